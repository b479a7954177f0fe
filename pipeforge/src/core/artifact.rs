//! File artifact descriptors produced by stage agents.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// A file produced by a stage.
///
/// Artifacts are descriptors: the orchestrator keeps them in the order the
/// agent returned them and never interprets their content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileArtifact {
    /// Project-relative path of the file.
    pub path: String,

    /// Source language or format, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,

    /// Size of the content in bytes.
    pub size_bytes: u64,

    /// SHA-256 of the content, hex encoded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,

    /// Inline content, when the agent chose to carry it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    /// Additional metadata about the artifact.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl FileArtifact {
    /// Creates a descriptor for a file whose content is not carried inline.
    #[must_use]
    pub fn new(path: impl Into<String>, size_bytes: u64) -> Self {
        Self {
            path: path.into(),
            language: None,
            size_bytes,
            checksum: None,
            content: None,
            metadata: HashMap::new(),
        }
    }

    /// Creates a descriptor carrying its content, with size and checksum filled in.
    #[must_use]
    pub fn with_content(path: impl Into<String>, content: impl Into<String>) -> Self {
        let content = content.into();
        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());
        Self {
            path: path.into(),
            language: None,
            size_bytes: content.len() as u64,
            checksum: Some(hex::encode(hasher.finalize())),
            content: Some(content),
            metadata: HashMap::new(),
        }
    }

    /// Sets the language.
    #[must_use]
    pub fn language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    /// Adds metadata to the artifact.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_with_content() {
        let artifact = FileArtifact::with_content("src/main.rs", "fn main() {}").language("rust");

        assert_eq!(artifact.size_bytes, 12);
        assert_eq!(artifact.language.as_deref(), Some("rust"));
        assert_eq!(artifact.checksum.as_ref().map(String::len), Some(64));
    }

    #[test]
    fn test_artifact_metadata() {
        let artifact = FileArtifact::new("Dockerfile", 120)
            .with_metadata("generated_by", serde_json::json!("infrastructure"));

        assert!(artifact.content.is_none());
        assert_eq!(artifact.metadata.len(), 1);
    }
}
