//! Stages reading JSON lines files.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tracing::{debug, warn};

use super::traits::{Extraction, Extractor, StageError, Transformer};
use crate::model::Document;

const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Extracts one record per non-empty line of a file. The version hash is
/// the SHA-256 of the file content.
#[derive(Debug, Clone)]
pub struct JsonLinesExtractor {
    path: PathBuf,
}

impl JsonLinesExtractor {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// SHA-256 and line count of a file, read in chunks.
async fn fingerprint(path: &Path) -> Result<(String, u64), StageError> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; READ_CHUNK_SIZE];
    let mut lines = 0u64;
    let mut last = None;

    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        let chunk = &buffer[..read];
        hasher.update(chunk);
        lines += chunk.iter().filter(|byte| **byte == b'\n').count() as u64;
        last = chunk.last().copied();
    }
    if last.is_some_and(|byte| byte != b'\n') {
        lines += 1;
    }

    Ok((hex::encode(hasher.finalize()), lines))
}

#[async_trait]
impl Extractor for JsonLinesExtractor {
    fn stage_name(&self) -> &'static str {
        "json_lines_extractor"
    }

    async fn init(&mut self) -> Result<(), StageError> {
        let metadata = tokio::fs::metadata(&self.path).await?;
        if !metadata.is_file() {
            return Err(StageError::Other(format!(
                "{} is not a file",
                self.path.display()
            )));
        }
        Ok(())
    }

    async fn extract(&mut self) -> Result<Extraction, StageError> {
        let (version_hash, line_count) = fingerprint(&self.path).await?;
        debug!(
            path = %self.path.display(),
            version_hash = %version_hash,
            line_count,
            "Fingerprinted source"
        );

        let lines = BufReader::new(File::open(&self.path).await?).lines();
        let records = stream::unfold(lines, |mut lines| async move {
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) if line.trim().is_empty() => continue,
                    Ok(Some(line)) => {
                        let record = serde_json::from_str::<Value>(&line).map_err(StageError::from);
                        return Some((record, lines));
                    }
                    Ok(None) => return None,
                    Err(e) => return Some((Err(StageError::from(e)), lines)),
                }
            }
        });

        Ok(Extraction {
            version_hash,
            size_estimate: Some(line_count),
            records: records.boxed(),
        })
    }
}

/// Turns JSON objects into documents identified by one of their fields.
#[derive(Debug, Clone)]
pub struct JsonTransformer {
    id_field: String,
}

impl JsonTransformer {
    pub fn new(id_field: impl Into<String>) -> Self {
        Self {
            id_field: id_field.into(),
        }
    }
}

impl Transformer for JsonTransformer {
    fn stage_name(&self) -> &'static str {
        "json_transformer"
    }

    fn transform(&self, record: Value) -> Result<Option<Document>, StageError> {
        let id = match record.get(&self.id_field) {
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            Some(Value::Number(id)) => id.to_string(),
            _ if !record.is_object() => {
                return Err(StageError::InvalidRecord(format!(
                    "expected a JSON object, found {}",
                    record
                )));
            }
            _ => {
                warn!(id_field = %self.id_field, "Record without identifier skipped");
                return Ok(None);
            }
        };
        Ok(Document::from_value(id, record))
    }
}
