//! NDJSON bulk request framing and bulk response model.
//!
//! Request, one entry per document:
//!
//! ```text
//! {"index":{"_id":"<id>"}}
//! <serialized document>
//! {"delete":{"_id":"<id>"}}
//! ```
//!
//! Response:
//!
//! ```text
//! {"took":3,"errors":true,"items":[{"index":{"_id":"<id>","status":400,"error":{..}}}]}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;

use crate::model::DocumentContent;

// ============================================================================
// Request
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BulkAction {
    Index,
    Delete,
}

impl BulkAction {
    pub fn as_str(self) -> &'static str {
        match self {
            BulkAction::Index => "index",
            BulkAction::Delete => "delete",
        }
    }
}

/// One framed bulk operation. Index entries keep their document so a
/// rejected field can be stripped and the entry rebuilt.
#[derive(Debug, Clone)]
pub struct BulkEntry {
    id: String,
    action: BulkAction,
    document: Option<DocumentContent>,
    lines: String,
}

impl BulkEntry {
    pub fn index(
        id: impl Into<String>,
        document: DocumentContent,
    ) -> Result<Self, serde_json::Error> {
        let id = id.into();
        let header = serde_json::to_string(&json!({ "index": { "_id": id } }))?;
        let payload = serde_json::to_string(&document)?;
        Ok(Self {
            lines: format!("{}\n{}\n", header, payload),
            id,
            action: BulkAction::Index,
            document: Some(document),
        })
    }

    pub fn delete(id: impl Into<String>) -> Result<Self, serde_json::Error> {
        let id = id.into();
        let header = serde_json::to_string(&json!({ "delete": { "_id": id } }))?;
        Ok(Self {
            lines: format!("{}\n", header),
            id,
            action: BulkAction::Delete,
            document: None,
        })
    }

    /// Entry for `document`, or a delete entry when it is `None`.
    pub fn for_document(
        id: impl Into<String>,
        document: Option<DocumentContent>,
    ) -> Result<Self, serde_json::Error> {
        match document {
            Some(document) => Self::index(id, document),
            None => Self::delete(id),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn action(&self) -> BulkAction {
        self.action
    }

    pub fn document(&self) -> Option<&DocumentContent> {
        self.document.as_ref()
    }

    /// Framed lines, newline-terminated.
    pub fn lines(&self) -> &str {
        &self.lines
    }

    /// Size of the framed entry in bytes.
    pub fn size(&self) -> usize {
        self.lines.len()
    }

    /// Rebuilds the entry without top-level `field`. Returns `None` if the
    /// entry holds no document or the document has no such field.
    pub fn without_field(&self, field: &str) -> Result<Option<Self>, serde_json::Error> {
        let Some(document) = &self.document else {
            return Ok(None);
        };
        if !document.contains_key(field) {
            return Ok(None);
        }
        let mut stripped = document.clone();
        stripped.remove(field);
        Self::index(self.id.clone(), stripped).map(Some)
    }
}

/// Concatenates framed entries into one request body.
pub fn request_body<'a>(entries: impl IntoIterator<Item = &'a BulkEntry>) -> String {
    entries.into_iter().map(BulkEntry::lines).collect()
}

// ============================================================================
// Response
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct BulkResponse {
    #[serde(default)]
    pub took: u64,
    /// Whether any item failed
    #[serde(default)]
    pub errors: bool,
    #[serde(default)]
    pub items: Vec<BulkResponseItem>,
}

impl BulkResponse {
    pub fn parse(body: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(body)
    }
}

/// A per-operation item, `{"<action>": {..}}` with any action key.
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "HashMap<String, BulkItemResult>")]
pub struct BulkResponseItem {
    pub action: String,
    pub result: BulkItemResult,
}

impl TryFrom<HashMap<String, BulkItemResult>> for BulkResponseItem {
    type Error = String;

    fn try_from(map: HashMap<String, BulkItemResult>) -> Result<Self, Self::Error> {
        if map.len() != 1 {
            return Err(format!("expected one action per bulk item, found {}", map.len()));
        }
        map.into_iter()
            .next()
            .map(|(action, result)| Self { action, result })
            .ok_or_else(|| "empty bulk item".to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BulkItemResult {
    #[serde(rename = "_id", default)]
    pub id: Option<String>,
    pub status: u16,
    #[serde(default)]
    pub error: Option<BulkItemError>,
}

impl BulkItemResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none() && (200..300).contains(&self.status)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BulkItemError {
    #[serde(rename = "type", default)]
    pub error_type: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub caused_by: Option<Box<BulkItemError>>,
}

impl BulkItemError {
    /// This error followed by its nested causes, outermost first.
    pub fn chain(&self) -> impl Iterator<Item = &BulkItemError> {
        std::iter::successors(Some(self), |error| error.caused_by.as_deref())
    }
}
