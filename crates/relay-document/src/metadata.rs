//! Report-level metadata attached to documents
#![allow(clippy::must_use_candidate)] // Constructor helpers are clear at call sites without #[must_use].
#![allow(clippy::return_self_not_must_use)] // Fluent setters are designed for chaining.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Metadata associated with a document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    /// Report identifier, unique per document version
    pub report_id: Uuid,

    /// Identifier of the submitting sender
    pub sender_id: Option<String>,

    /// Document type identifier (e.g. `ORU^R01`)
    pub doc_type: Option<String>,

    /// Format version (e.g. `2.5.1`)
    pub doc_version: Option<String>,

    /// Message control id from the source message
    pub message_control_id: Option<String>,

    /// Timestamp carried by the source message
    pub message_timestamp: Option<chrono::DateTime<chrono::Utc>>,

    /// Number of reportable items in this document
    pub item_count: usize,

    /// Creation timestamp of this document version
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl DocumentMetadata {
    /// Create metadata with a fresh report id
    pub fn new() -> Self {
        Self {
            report_id: Uuid::new_v4(),
            sender_id: None,
            doc_type: None,
            doc_version: None,
            message_control_id: None,
            message_timestamp: None,
            item_count: 0,
            created_at: chrono::Utc::now(),
        }
    }

    /// Set the sender identifier
    pub fn with_sender(mut self, sender_id: impl Into<String>) -> Self {
        self.sender_id = Some(sender_id.into());
        self
    }

    /// Set the document type and version
    pub fn with_type(mut self, doc_type: impl Into<String>, doc_version: impl Into<String>) -> Self {
        self.doc_type = Some(doc_type.into());
        self.doc_version = Some(doc_version.into());
        self
    }
}

impl Default for DocumentMetadata {
    fn default() -> Self {
        Self::new()
    }
}
