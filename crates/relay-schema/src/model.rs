//! Schema model definitions

use crate::expr::{ConditionExpr, FieldSpec, ValueTemplate};
use relay_document::PathExpr;

/// A complete transformation schema
#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    /// Schema name, unique within the search paths
    pub name: String,

    /// Parent schema name for single inheritance
    pub extends: Option<String>,

    /// Target message type, root schemas only (e.g. `ORU_R01`)
    pub target_format_type: Option<String>,

    /// Target format version, root schemas only (e.g. `2.5.1`)
    pub target_format_version: Option<String>,

    /// Elements in evaluation order
    pub elements: Vec<SchemaElement>,
}

/// One element of a schema
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaElement {
    /// Element name; the override key during inheritance merge
    pub name: String,

    /// Guard condition; absent means the element always applies
    pub condition: Option<ConditionExpr>,

    /// Required elements fail the whole conversion when they produce
    /// nothing
    pub required: bool,

    /// What the element does
    pub rule: ElementRule,
}

/// The two element modes. The loader rejects raw elements that set
/// both or neither, so this shape is the only one constructible.
#[derive(Debug, Clone, PartialEq)]
pub enum ElementRule {
    /// Delegate to a named sub-schema, optionally once per node matched
    /// by the context path
    SchemaRef {
        schema: String,
        context: Option<PathExpr>,
    },

    /// Produce a value from the first non-empty template and write it
    /// to every destination
    Value {
        templates: Vec<ValueTemplate>,
        destinations: Vec<FieldSpec>,
    },
}

impl Schema {
    /// Create an empty schema with the given name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            extends: None,
            target_format_type: None,
            target_format_version: None,
            elements: Vec::new(),
        }
    }

    /// Set the parent schema name
    pub fn with_extends(mut self, parent: impl Into<String>) -> Self {
        self.extends = Some(parent.into());
        self
    }

    /// Set the target format type and version
    pub fn with_target(
        mut self,
        format_type: impl Into<String>,
        format_version: impl Into<String>,
    ) -> Self {
        self.target_format_type = Some(format_type.into());
        self.target_format_version = Some(format_version.into());
        self
    }

    /// Append elements
    pub fn with_elements(mut self, elements: Vec<SchemaElement>) -> Self {
        self.elements.extend(elements);
        self
    }

    /// Find an element by name
    pub fn find_element(&self, name: &str) -> Option<&SchemaElement> {
        self.elements.iter().find(|e| e.name == name)
    }
}
