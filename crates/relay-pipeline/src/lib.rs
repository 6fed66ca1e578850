#![deny(warnings)]
#![deny(rust_2018_idioms)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

//! # relay-pipeline
//!
//! The staged, queue-driven pipeline that moves a report from raw
//! submission to delivery: convert, route, translate, batch, send.
//!
//! Stages are stateless async workers over a shared [`PipelineContext`].
//! Each stage persists its output through one store transaction before
//! the next stage's event becomes visible on the queue, and every stage
//! writes to the append-only action history.

pub mod batch;
pub mod dedup;
pub mod message;
pub mod queue;
pub mod receiver;
pub mod stages;
pub mod transport;

pub use batch::{lookback_minutes, run_batch};
pub use message::{MAX_MESSAGE_BYTES, ReportEvent};
pub use queue::{MemoryQueue, Queue};
pub use receiver::{
    BatchOperation, EmptyAction, Receiver, ReportFormat, Timing, TransportConfig, WhenEmpty,
    receivers_from_yaml,
};
pub use stages::{
    PipelineContext, handle_event, run_convert, run_resend, run_route, run_send, run_translate,
};
pub use transport::{DeliveryFile, DeliveryReceipt, FileTransport, RetryToken, Transport};

use thiserror::Error;

/// Errors that can occur while running the pipeline.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Queue message too large: {bytes} bytes exceeds the {limit} byte limit")]
    MessageTooLarge { bytes: usize, limit: usize },

    #[error("Receiver '{receiver}' cannot produce an empty delivery in a single-message format")]
    EmptyBatchUnsupported { receiver: String },

    #[error("Configuration error: {details}")]
    Config { details: String },

    #[error("Invalid payload: {details}")]
    InvalidPayload { details: String },

    #[error("Document error: {0}")]
    Document(#[from] relay_document::Error),

    #[error("Schema error: {0}")]
    Schema(#[from] relay_schema::Error),

    #[error("Translation error: {0}")]
    Translate(#[from] relay_translate::Error),

    #[error("Store error: {0}")]
    Store(#[from] relay_store::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Receiver config error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Delivery file error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build a configuration error.
    pub fn config(details: impl Into<String>) -> Self {
        Self::Config {
            details: details.into(),
        }
    }

    /// Build an invalid-payload error.
    pub fn invalid_payload(details: impl Into<String>) -> Self {
        Self::InvalidPayload {
            details: details.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
