use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Field map of a transformed document.
pub type DocumentContent = Map<String, Value>;

/// A transformed record ready for submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub content: DocumentContent,
}

impl Document {
    pub fn new(id: impl Into<String>, content: DocumentContent) -> Self {
        Self {
            id: id.into(),
            content,
        }
    }

    /// Builds a document from a JSON value, which must be an object.
    pub fn from_value(id: impl Into<String>, value: Value) -> Option<Self> {
        match value {
            Value::Object(content) => Some(Self::new(id, content)),
            _ => None,
        }
    }
}
