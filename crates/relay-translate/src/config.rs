//! Translator configuration
//!
//! Constructed explicitly and handed to the translator; there is no
//! global template registry.

use std::collections::HashMap;
use std::path::PathBuf;

/// Configuration for outbound serialization: where template schemas
/// live and which schema renders which message type/version.
#[derive(Debug, Clone, Default)]
pub struct TranslatorConfig {
    /// Search paths for template schema files
    pub schema_paths: Vec<PathBuf>,

    templates: HashMap<(String, String), String>,
}

impl TranslatorConfig {
    /// Create a configuration with the given schema search paths
    pub fn new(schema_paths: Vec<PathBuf>) -> Self {
        Self {
            schema_paths,
            templates: HashMap::new(),
        }
    }

    /// Register a template schema for a message type and version
    pub fn with_template(
        mut self,
        message_type: impl Into<String>,
        version: impl Into<String>,
        schema_name: impl Into<String>,
    ) -> Self {
        self.templates
            .insert((message_type.into(), version.into()), schema_name.into());
        self
    }

    /// Look up the template schema for a message type and version
    pub fn template_for(&self, message_type: &str, version: &str) -> Option<&str> {
        self.templates
            .get(&(message_type.to_string(), version.to_string()))
            .map(String::as_str)
    }
}
