#![deny(warnings)]
#![deny(rust_2018_idioms)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

//! # relay-document
//!
//! Canonical intermediate representation for health-data reports.
//!
//! Every report flowing through the pipeline — regardless of its source
//! format — is represented as a [`Document`]: a tree of typed nodes plus
//! report-level metadata. Documents are immutable by convention: each
//! pipeline stage produces a new value rather than mutating in place.

/// Document container, metadata, and pure merge/split operations.
pub mod document;
/// Report-level metadata attached to documents.
pub mod metadata;
/// Core tree node model.
pub mod node;
/// Structured-path expressions for navigating the tree.
pub mod path;

pub use document::Document;
pub use metadata::DocumentMetadata;
pub use node::{Node, NodeType, Value};
pub use path::PathExpr;

use thiserror::Error;

/// Errors that can occur when working with documents.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Node not found at path: {path}")]
    NodeNotFound { path: String },

    #[error("Invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("Document error in {context}: {message}")]
    Document { context: String, message: String },
}

impl Error {
    /// Build a node-not-found error with path context.
    pub fn node_not_found(path: impl Into<String>) -> Self {
        Self::NodeNotFound { path: path.into() }
    }

    /// Build an invalid-path error with the offending input and reason.
    pub fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Build a document error with operation context.
    pub fn document(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Document {
            context: context.into(),
            message: message.into(),
        }
    }
}

/// Crate-local result type.
pub type Result<T> = std::result::Result<T, Error>;
