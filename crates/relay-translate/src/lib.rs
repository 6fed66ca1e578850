//! # relay-translate
//!
//! Format translators between raw submissions and the canonical
//! document tree.
//!
//! Inbound: a fixed structural parse per source format (HL7v2 and FHIR
//! JSON) followed by a pure enhancement pass that lifts message-level
//! metadata. Outbound: the schema engine renders a document into a
//! delivery format through a template schema registered per message
//! type and version; an unknown type is a hard error, never a fallback.

pub mod config;
pub mod enhance;
pub mod fhir;
pub mod hl7;
pub mod serializer;
pub mod translator;

pub use config::TranslatorConfig;
pub use enhance::enhance;
pub use fhir::FhirParser;
pub use hl7::Hl7Parser;
pub use serializer::{Hl7Message, Hl7Serializer};
pub use translator::{SourceFormat, Translator};

use thiserror::Error;

/// Errors that can occur while translating between formats
#[derive(Error, Debug)]
pub enum Error {
    #[error("Parse error at segment {segment}: {message}")]
    Parse { segment: usize, message: String },

    #[error("No template registered for message type '{message_type}' version '{version}'")]
    UnsupportedMessageType {
        message_type: String,
        version: String,
    },

    #[error("Unrecognized submission format: {details}")]
    UnrecognizedFormat { details: String },

    #[error("Schema error: {0}")]
    Schema(#[from] relay_schema::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Build a parse error at the given 1-based segment position.
    pub fn parse(segment: usize, message: impl Into<String>) -> Self {
        Self::Parse {
            segment,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
