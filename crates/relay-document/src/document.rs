//! Document container and pure merge/split operations
#![allow(clippy::must_use_candidate)] // Builder/constructor API intentionally omits pervasive #[must_use].
#![allow(clippy::return_self_not_must_use)] // Fluent builder methods return Self for ergonomics.

use crate::metadata::DocumentMetadata;
use crate::node::{Node, NodeType};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// A health-data report in its canonical tree representation.
///
/// A document is immutable once persisted: pipeline stages derive new
/// documents (with fresh report ids) instead of mutating in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Root node of the document tree
    pub root: Node,

    /// Report-level metadata
    pub metadata: DocumentMetadata,
}

impl Document {
    /// Create a new document with the given root node
    pub fn new(root: Node) -> Self {
        let mut doc = Self {
            root,
            metadata: DocumentMetadata::new(),
        };
        doc.metadata.item_count = doc.items().len();
        doc
    }

    /// Create a new document with explicit metadata
    pub fn with_metadata(root: Node, metadata: DocumentMetadata) -> Self {
        let mut doc = Self { root, metadata };
        doc.metadata.item_count = doc.items().len();
        doc
    }

    /// The ordered reportable items of this document.
    ///
    /// Item position within this list is the index used for lineage.
    pub fn items(&self) -> Vec<&Node> {
        self.root
            .children
            .iter()
            .filter(|c| c.node_type == NodeType::Item)
            .collect()
    }

    /// Header nodes: every root child that is not a reportable item.
    pub fn header_nodes(&self) -> Vec<&Node> {
        self.root
            .children
            .iter()
            .filter(|c| c.node_type != NodeType::Item)
            .collect()
    }

    /// Merge several documents into one, concatenating items in input order.
    ///
    /// Header nodes come from the first input; the result carries a fresh
    /// report id and an item count equal to the sum of the inputs. Inputs
    /// are not mutated.
    ///
    /// # Errors
    ///
    /// Returns an error when called with no inputs.
    pub fn merge(docs: &[Document]) -> Result<Document> {
        let first = docs
            .first()
            .ok_or_else(|| Error::document("merge", "cannot merge zero documents"))?;

        let mut root = Node::new(&first.root.name, NodeType::Root);
        for header in first.header_nodes() {
            root.add_child(header.clone());
        }
        for doc in docs {
            for item in doc.items() {
                root.add_child(item.clone());
            }
        }

        let metadata = DocumentMetadata {
            sender_id: first.metadata.sender_id.clone(),
            doc_type: first.metadata.doc_type.clone(),
            doc_version: first.metadata.doc_version.clone(),
            ..DocumentMetadata::new()
        };

        Ok(Document::with_metadata(root, metadata))
    }

    /// Split this document into one document per item.
    ///
    /// Each child carries the full set of header nodes, exactly one item,
    /// and a fresh report id. A document with no items splits into nothing.
    pub fn split(&self) -> Vec<Document> {
        self.items()
            .into_iter()
            .map(|item| {
                let mut root = Node::new(&self.root.name, NodeType::Root);
                for header in self.header_nodes() {
                    root.add_child(header.clone());
                }
                root.add_child(item.clone());

                let metadata = DocumentMetadata {
                    sender_id: self.metadata.sender_id.clone(),
                    doc_type: self.metadata.doc_type.clone(),
                    doc_version: self.metadata.doc_version.clone(),
                    message_control_id: self.metadata.message_control_id.clone(),
                    message_timestamp: self.metadata.message_timestamp,
                    ..DocumentMetadata::new()
                };

                Document::with_metadata(root, metadata)
            })
            .collect()
    }
}
