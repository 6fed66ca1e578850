//! Schema-driven conversion of documents into field writes
//!
//! The converter walks a schema's elements in order against a document
//! and produces the flat list of destination-field writes a serializer
//! applies. Sub-schema references recurse with a narrowed context node
//! and expose a 1-based `%index` per repetition.

use crate::expr::FieldSpec;
use crate::loader::SchemaLoader;
use crate::model::{ElementRule, Schema};
use crate::{Error, Result};
use relay_document::{Document, Node};
use std::sync::Arc;
use tracing::{debug, trace};

/// One resolved write into the target message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldWrite {
    /// Target segment name
    pub segment: String,

    /// Segment repetition, 1-based
    pub repetition: usize,

    /// Field number, 1-based
    pub field: usize,

    /// Component number within the field, 1-based
    pub component: Option<usize>,

    /// Rendered value
    pub value: String,
}

/// A non-fatal problem with one element during conversion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementError {
    /// Schema the element belongs to
    pub schema: String,

    /// Element name
    pub element: String,

    /// What went wrong
    pub message: String,
}

/// The result of converting a document against a schema
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Conversion {
    /// Writes in element order
    pub writes: Vec<FieldWrite>,

    /// Per-element errors for non-required elements
    pub errors: Vec<ElementError>,
}

/// Evaluates schemas against documents. Sub-schema references are
/// looked up through the loader's cache, so conversion never touches
/// disk for a schema the loader has already resolved.
pub struct Converter {
    loader: Arc<SchemaLoader>,
}

impl Converter {
    /// Create a converter backed by the given loader
    pub fn new(loader: Arc<SchemaLoader>) -> Self {
        Self { loader }
    }

    /// Convert a document against a schema.
    ///
    /// Elements whose condition evaluates false are skipped. A required
    /// element producing an empty value fails the whole conversion;
    /// other element problems are collected and conversion continues
    /// best-effort.
    ///
    /// # Errors
    ///
    /// Fails when a required element renders empty or a referenced
    /// sub-schema cannot be loaded.
    pub fn convert(&self, schema: &Schema, document: &Document) -> Result<Conversion> {
        let mut conversion = Conversion::default();
        self.apply(schema, &document.root, None, &mut conversion)?;
        debug!(
            schema = %schema.name,
            writes = conversion.writes.len(),
            errors = conversion.errors.len(),
            "conversion finished"
        );
        Ok(conversion)
    }

    fn apply(
        &self,
        schema: &Schema,
        context: &Node,
        index: Option<usize>,
        out: &mut Conversion,
    ) -> Result<()> {
        for element in &schema.elements {
            if let Some(condition) = &element.condition {
                if !condition.eval(context) {
                    trace!(
                        schema = %schema.name,
                        element = %element.name,
                        "condition false, element skipped"
                    );
                    continue;
                }
            }

            match &element.rule {
                ElementRule::SchemaRef {
                    schema: sub_name,
                    context: context_path,
                } => {
                    let sub = self.loader.load(sub_name)?;
                    match context_path {
                        Some(path) => {
                            for (i, narrowed) in path.resolve_all(context).iter().enumerate() {
                                self.apply(&sub, narrowed, Some(i + 1), out)?;
                            }
                        }
                        None => self.apply(&sub, context, index, out)?,
                    }
                }
                ElementRule::Value {
                    templates,
                    destinations,
                } => {
                    let value = templates
                        .iter()
                        .map(|t| t.render(context, index))
                        .find(|v| !v.is_empty());

                    match value {
                        Some(value) => {
                            push_writes(destinations, index, &value, out);
                        }
                        None if element.required => {
                            out.errors.push(ElementError {
                                schema: schema.name.clone(),
                                element: element.name.clone(),
                                message: "required element produced no value".to_string(),
                            });
                            return Err(Error::RequiredElementEmpty {
                                schema: schema.name.clone(),
                                element: element.name.clone(),
                            });
                        }
                        None => {
                            out.errors.push(ElementError {
                                schema: schema.name.clone(),
                                element: element.name.clone(),
                                message: "no template produced a value".to_string(),
                            });
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

fn push_writes(
    destinations: &[FieldSpec],
    index: Option<usize>,
    value: &str,
    out: &mut Conversion,
) {
    for spec in destinations {
        out.writes.push(FieldWrite {
            segment: spec.segment().to_string(),
            repetition: spec.repetition(index),
            field: spec.field,
            component: spec.component,
            value: value.to_string(),
        });
    }
}
