//! Document content storage.

use crate::core::Result;
use std::fmt;

/// Turns an entity's serde tree into the text stored in the `Content` column and back.
///
/// Entities reach the serializer already converted to `serde_json::Value`, so any
/// polymorphism is carried by serde's enum tagging plus the document `Type` column.
pub trait ContentSerializer: Send + Sync + fmt::Debug {
    fn serialize(&self, content: &serde_json::Value) -> Result<String>;

    fn deserialize(&self, text: &str) -> Result<serde_json::Value>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonContentSerializer {
    pretty: bool,
}

impl JsonContentSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Indented output, easier to read in a database console
    pub fn pretty() -> Self {
        Self { pretty: true }
    }
}

impl ContentSerializer for JsonContentSerializer {
    fn serialize(&self, content: &serde_json::Value) -> Result<String> {
        let text = if self.pretty {
            serde_json::to_string_pretty(content)?
        } else {
            serde_json::to_string(content)?
        };
        Ok(text)
    }

    fn deserialize(&self, text: &str) -> Result<serde_json::Value> {
        Ok(serde_json::from_str(text)?)
    }
}
