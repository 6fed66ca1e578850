//! # relay-store
//!
//! Durable state for the relay pipeline: the libsql metadata store
//! (report files, tasks, action history, item lineage) and the
//! content-addressed blob store.
//!
//! Every stage-visible state change goes through [`DbTransaction`] so
//! that a report row, its lineage edges, and the action record commit
//! or roll back together. Blobs are write-once and verified by digest
//! on download.

pub mod blob;
pub mod connection;
pub mod schema;
mod sql;
pub mod store;

pub use blob::{BlobRef, BlobStore, LocalBlobStore, MemoryBlobStore, content_digest};
pub use connection::{ConnectionConfig, DbConnection, DbTransaction};
pub use schema::{DbValue, Row};
pub use store::{
    ActionHistory, ActionStatus, Header, ItemLineage, MetadataStore, ReportFileRecord,
    RetryClaim, TaskRecord, TaskStatus,
};

use thiserror::Error;

/// Errors that can occur in the store layer.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {details}")]
    Config { details: String },

    #[error("Connection error: {details}")]
    Connection { details: String },

    #[error("Libsql error during {context}: {source}")]
    Libsql {
        context: String,
        #[source]
        source: libsql::Error,
    },

    #[error("SQL error executing `{statement}`: {source}")]
    Sql {
        statement: String,
        #[source]
        source: libsql::Error,
    },

    #[error("Query error on `{table}`: {details}")]
    Query { table: String, details: String },

    #[error("Transaction error: {details}")]
    Transaction { details: String },

    #[error("Digest mismatch for blob '{url}': expected {expected}, computed {actual}")]
    DigestMismatch {
        url: String,
        expected: String,
        actual: String,
    },

    #[error("Blob already exists at '{url}'")]
    BlobExists { url: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build a query error with table context.
    pub fn query(table: impl Into<String>, details: impl Into<String>) -> Self {
        Self::Query {
            table: table.into(),
            details: details.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
