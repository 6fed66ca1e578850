#![deny(warnings)]
#![deny(rust_2018_idioms)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

//! # relay-schema
//!
//! Declarative transformation schemas for rendering documents into
//! delivery formats.
//!
//! A schema is a named, single-inheritance list of elements. Each element
//! either references a sub-schema (optionally narrowed to a context path)
//! or produces a value from an ordered template list and writes it to one
//! or more destination fields. Schemas load from YAML/JSON search paths,
//! merge along their `extends` chain, and are cached in a concurrent
//! registry.

pub mod convert;
pub mod expr;
pub mod inheritance;
pub mod loader;
pub mod model;
pub mod registry;
pub mod validate;

pub use convert::{Conversion, Converter, ElementError, FieldWrite};
pub use expr::{ConditionExpr, FieldSpec, ValueTemplate};
pub use loader::SchemaLoader;
pub use model::{ElementRule, Schema, SchemaElement};
pub use registry::SchemaRegistry;
pub use validate::{validate, ValidationIssue};

use thiserror::Error;

/// Errors that can occur when working with schemas
#[derive(Error, Debug)]
pub enum Error {
    #[error("Schema not found: {name} (searched {paths})")]
    NotFound { name: String, paths: String },

    #[error("Invalid schema format in '{name}': {details}")]
    InvalidFormat { name: String, details: String },

    #[error("Circular extends chain: {chain}")]
    CircularExtends { chain: String },

    #[error("Parent schema '{parent}' not found (extended by '{schema}')")]
    ParentNotFound { schema: String, parent: String },

    #[error("Schema '{schema}' failed validation: {details}")]
    Validation { schema: String, details: String },

    #[error("Invalid expression '{expression}': {reason}")]
    Expression { expression: String, reason: String },

    #[error("Required element '{element}' produced no value in schema '{schema}'")]
    RequiredElementEmpty { schema: String, element: String },

    #[error("Path error: {0}")]
    Path(#[from] relay_document::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build an invalid-expression error.
    pub fn expression(expression: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Expression {
            expression: expression.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
