//! Structural schema validation
//!
//! Syntax problems (bad conditions, templates, destination specs) are
//! rejected while the loader parses the raw file. The checks here run on
//! the typed schema after parsing; a schema with issues is never
//! registered.

use crate::model::{ElementRule, Schema};
use std::fmt;

/// One validation finding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    /// Schema the issue was found in
    pub schema: String,

    /// Offending element, when the issue is element-scoped
    pub element: Option<String>,

    /// Human-readable description
    pub message: String,
}

impl ValidationIssue {
    fn schema_level(schema: &str, message: impl Into<String>) -> Self {
        Self {
            schema: schema.to_string(),
            element: None,
            message: message.into(),
        }
    }

    fn element_level(schema: &str, element: &str, message: impl Into<String>) -> Self {
        Self {
            schema: schema.to_string(),
            element: Some(element.to_string()),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.element {
            Some(element) => write!(f, "[{}/{}] {}", self.schema, element, self.message),
            None => write!(f, "[{}] {}", self.schema, self.message),
        }
    }
}

/// Validate a typed schema. Empty result means valid.
pub fn validate(schema: &Schema) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    if schema.name.trim().is_empty() {
        issues.push(ValidationIssue::schema_level(
            &schema.name,
            "schema name must not be blank",
        ));
    }

    if schema.extends.is_some()
        && (schema.target_format_type.is_some() || schema.target_format_version.is_some())
    {
        issues.push(ValidationIssue::schema_level(
            &schema.name,
            "target format may only be declared on a root schema, not one that extends",
        ));
    }

    let mut seen = std::collections::HashSet::new();
    for element in &schema.elements {
        if element.name.trim().is_empty() {
            issues.push(ValidationIssue::schema_level(
                &schema.name,
                "element name must not be blank",
            ));
            continue;
        }
        if !seen.insert(element.name.as_str()) {
            issues.push(ValidationIssue::element_level(
                &schema.name,
                &element.name,
                "duplicate element name",
            ));
        }

        match &element.rule {
            ElementRule::SchemaRef { schema: name, .. } => {
                if name.trim().is_empty() {
                    issues.push(ValidationIssue::element_level(
                        &schema.name,
                        &element.name,
                        "schema reference must name a schema",
                    ));
                }
            }
            ElementRule::Value {
                templates,
                destinations,
            } => {
                if templates.is_empty() {
                    issues.push(ValidationIssue::element_level(
                        &schema.name,
                        &element.name,
                        "value element needs at least one template",
                    ));
                }
                if destinations.is_empty() {
                    issues.push(ValidationIssue::element_level(
                        &schema.name,
                        &element.name,
                        "value element needs at least one destination",
                    ));
                }
            }
        }
    }

    issues
}
