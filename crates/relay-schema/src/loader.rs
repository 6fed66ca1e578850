//! Schema loader with inheritance support

use crate::expr::{ConditionExpr, FieldSpec, ValueTemplate};
use crate::inheritance::merge;
use crate::model::{ElementRule, Schema, SchemaElement};
use crate::registry::SchemaRegistry;
use crate::validate::{validate, ValidationIssue};
use crate::{Error, Result};
use relay_document::PathExpr;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, trace};

/// Serializable schema format for loading from files
#[derive(Debug, Deserialize)]
struct SchemaFile {
    name: String,
    #[serde(default)]
    extends: Option<String>,
    #[serde(default)]
    target_format_type: Option<String>,
    #[serde(default)]
    target_format_version: Option<String>,
    #[serde(default)]
    elements: Vec<ElementFile>,
}

/// Serializable element. Exactly one of `schema` and `value` must be
/// set; the loader turns violations into validation issues.
#[derive(Debug, Deserialize)]
struct ElementFile {
    name: String,
    #[serde(default)]
    condition: Option<String>,
    #[serde(default)]
    required: bool,
    #[serde(default)]
    schema: Option<String>,
    #[serde(default)]
    context: Option<String>,
    #[serde(default)]
    value: Option<Vec<String>>,
    #[serde(default)]
    destinations: Option<Vec<String>>,
}

/// Schema loader with search paths, inheritance resolution, and a
/// concurrent cache of merged results
pub struct SchemaLoader {
    registry: Arc<SchemaRegistry>,
    schema_paths: Vec<PathBuf>,
}

impl SchemaLoader {
    /// Create a new schema loader with the given search paths
    pub fn new(schema_paths: Vec<PathBuf>) -> Self {
        Self {
            registry: Arc::new(SchemaRegistry::new()),
            schema_paths,
        }
    }

    /// Create a new schema loader with a pre-configured registry
    pub fn with_registry(registry: Arc<SchemaRegistry>, schema_paths: Vec<PathBuf>) -> Self {
        Self {
            registry,
            schema_paths,
        }
    }

    /// Add a search path for schema files
    pub fn add_path(&mut self, path: PathBuf) {
        self.schema_paths.push(path);
    }

    /// Get the registry (for testing/debugging)
    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    /// Load a schema by name with full inheritance resolution.
    ///
    /// The `extends` chain is walked bottom-to-top and merged; sub-schema
    /// references are resolved eagerly so a loaded schema is guaranteed
    /// convertible. Results are cached by name.
    ///
    /// # Errors
    ///
    /// Fails on missing files, circular `extends` or schema-ref chains,
    /// missing parents, and validation issues.
    pub fn load(&self, name: &str) -> Result<Schema> {
        let mut ancestry = Vec::new();
        self.load_resolved(name, &mut ancestry)
    }

    fn load_resolved(&self, name: &str, ancestry: &mut Vec<String>) -> Result<Schema> {
        if ancestry.iter().any(|a| a == name) {
            let mut chain = ancestry.join(" -> ");
            chain.push_str(" -> ");
            chain.push_str(name);
            return Err(Error::CircularExtends { chain });
        }

        if let Some(cached) = self.registry.get(name) {
            debug!("Cache hit for schema: {}", name);
            return Ok(cached);
        }
        trace!("Cache miss for schema: {}", name);

        ancestry.push(name.to_string());

        let file = self.read_schema_file(name)?;
        let mut issues = Vec::new();
        let schema = convert_schema_file(file, &mut issues);

        // Validate the schema's own declaration before merging: the
        // extends/target conflict is only visible pre-merge, and parent
        // elements were validated when the parent loaded.
        issues.extend(validate(&schema));

        let merged = match &schema.extends {
            Some(parent_name) => {
                let parent = match self.load_resolved(parent_name, ancestry) {
                    Ok(p) => p,
                    Err(Error::NotFound { .. }) => {
                        ancestry.pop();
                        return Err(Error::ParentNotFound {
                            schema: name.to_string(),
                            parent: parent_name.clone(),
                        });
                    }
                    Err(e) => {
                        ancestry.pop();
                        return Err(e);
                    }
                };
                info!("Merging schema '{}' over parent '{}'", name, parent_name);
                merge(&parent, &schema)
            }
            None => schema,
        };

        if let Err(e) = self.resolve_references(&merged, ancestry) {
            ancestry.pop();
            return Err(e);
        }

        ancestry.pop();

        if !issues.is_empty() {
            return Err(validation_error(name, &issues));
        }

        self.registry.register(name, merged.clone());
        Ok(merged)
    }

    /// Eagerly load every sub-schema this schema references, with the
    /// current ancestry so reference cycles fail like extends cycles.
    fn resolve_references(&self, schema: &Schema, ancestry: &mut Vec<String>) -> Result<()> {
        for element in &schema.elements {
            if let ElementRule::SchemaRef { schema: sub, .. } = &element.rule {
                self.load_resolved(sub, ancestry)?;
            }
        }
        Ok(())
    }

    /// Load a schema from a specific file path, without inheritance
    /// resolution or registration.
    pub fn load_from_file(&self, path: &Path) -> Result<Schema> {
        trace!("Loading schema from file: {:?}", path);
        let content = std::fs::read_to_string(path)?;

        if path
            .extension()
            .is_some_and(|e| e == "yaml" || e == "yml")
        {
            self.load_from_yaml(&content)
        } else {
            self.load_from_json(&content)
        }
    }

    /// Parse a schema from a JSON string (no inheritance resolution)
    pub fn load_from_json(&self, json: &str) -> Result<Schema> {
        let file: SchemaFile = serde_json::from_str(json).map_err(|e| Error::InvalidFormat {
            name: "<json>".to_string(),
            details: format!("JSON parse error: {e}"),
        })?;
        let name = file.name.clone();
        let mut issues = Vec::new();
        let schema = convert_schema_file(file, &mut issues);
        if issues.is_empty() {
            Ok(schema)
        } else {
            Err(validation_error(&name, &issues))
        }
    }

    /// Parse a schema from a YAML string (no inheritance resolution)
    pub fn load_from_yaml(&self, yaml: &str) -> Result<Schema> {
        let file: SchemaFile = serde_yaml::from_str(yaml).map_err(|e| Error::InvalidFormat {
            name: "<yaml>".to_string(),
            details: format!("YAML parse error: {e}"),
        })?;
        let name = file.name.clone();
        let mut issues = Vec::new();
        let schema = convert_schema_file(file, &mut issues);
        if issues.is_empty() {
            Ok(schema)
        } else {
            Err(validation_error(&name, &issues))
        }
    }

    fn read_schema_file(&self, name: &str) -> Result<SchemaFile> {
        for path in &self.schema_paths {
            for ext in ["yaml", "yml", "json"] {
                let file_path = path.join(format!("{name}.{ext}"));
                if file_path.exists() {
                    trace!("Found schema file: {:?}", file_path);
                    let content = std::fs::read_to_string(&file_path)?;
                    let parsed = if ext == "json" {
                        serde_json::from_str(&content).map_err(|e| Error::InvalidFormat {
                            name: name.to_string(),
                            details: format!("JSON parse error: {e}"),
                        })?
                    } else {
                        serde_yaml::from_str(&content).map_err(|e| Error::InvalidFormat {
                            name: name.to_string(),
                            details: format!("YAML parse error: {e}"),
                        })?
                    };
                    return Ok(parsed);
                }
            }
        }

        Err(Error::NotFound {
            name: name.to_string(),
            paths: format!("{:?}", self.schema_paths),
        })
    }
}

impl Default for SchemaLoader {
    fn default() -> Self {
        Self::new(vec![PathBuf::from(".")])
    }
}

fn validation_error(name: &str, issues: &[ValidationIssue]) -> Error {
    let details = issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ");
    Error::Validation {
        schema: name.to_string(),
        details,
    }
}

/// Convert the raw file form into the typed schema, collecting syntax
/// and element-mode problems as validation issues.
fn convert_schema_file(file: SchemaFile, issues: &mut Vec<ValidationIssue>) -> Schema {
    let mut elements = Vec::with_capacity(file.elements.len());

    for raw in file.elements {
        let mut element_issue = |message: String| {
            issues.push(ValidationIssue {
                schema: file.name.clone(),
                element: Some(raw.name.clone()),
                message,
            });
        };

        let condition = match &raw.condition {
            Some(text) => match ConditionExpr::parse(text) {
                Ok(c) => Some(c),
                Err(e) => {
                    element_issue(e.to_string());
                    continue;
                }
            },
            None => None,
        };

        let rule = match (&raw.schema, &raw.value) {
            (Some(sub), None) => {
                if raw.destinations.is_some() {
                    element_issue("schema-ref element must not set destinations".to_string());
                    continue;
                }
                let context = match &raw.context {
                    Some(text) => match PathExpr::parse(text) {
                        Ok(p) => Some(p),
                        Err(e) => {
                            element_issue(e.to_string());
                            continue;
                        }
                    },
                    None => None,
                };
                ElementRule::SchemaRef {
                    schema: sub.clone(),
                    context,
                }
            }
            (None, Some(raw_templates)) => {
                let mut templates = Vec::with_capacity(raw_templates.len());
                let mut bad = false;
                for t in raw_templates {
                    match ValueTemplate::parse(t) {
                        Ok(parsed) => templates.push(parsed),
                        Err(e) => {
                            element_issue(e.to_string());
                            bad = true;
                        }
                    }
                }
                let mut destinations = Vec::new();
                for d in raw.destinations.as_deref().unwrap_or(&[]) {
                    match FieldSpec::parse(d) {
                        Ok(parsed) => destinations.push(parsed),
                        Err(e) => {
                            element_issue(e.to_string());
                            bad = true;
                        }
                    }
                }
                if bad {
                    continue;
                }
                ElementRule::Value {
                    templates,
                    destinations,
                }
            }
            _ => {
                element_issue("element must set exactly one of 'schema' or 'value'".to_string());
                continue;
            }
        };

        elements.push(SchemaElement {
            name: raw.name,
            condition,
            required: raw.required,
            rule,
        });
    }

    Schema {
        name: file.name,
        extends: file.extends,
        target_format_type: file.target_format_type,
        target_format_version: file.target_format_version,
        elements,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_loader() -> SchemaLoader {
        SchemaLoader::new(vec![
            PathBuf::from("tests/data"),
            PathBuf::from("crates/relay-schema/tests/data"),
        ])
    }

    #[test]
    fn load_root_schema() {
        let loader = create_test_loader();
        let schema = loader.load("oru-base").unwrap();
        assert_eq!(schema.name, "oru-base");
        assert_eq!(schema.target_format_type.as_deref(), Some("ORU_R01"));
        assert!(schema.find_element("message-type").is_some());
    }

    #[test]
    fn load_not_found() {
        let loader = create_test_loader();
        match loader.load("nonexistent") {
            Err(Error::NotFound { name, .. }) => assert_eq!(name, "nonexistent"),
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn load_caches_merged_result() {
        let loader = create_test_loader();
        let first = loader.load("oru-base").unwrap();
        assert!(loader.registry().contains("oru-base"));
        let second = loader.load("oru-base").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn missing_parent_is_a_distinct_error() {
        let loader = create_test_loader();
        match loader.load("orphan") {
            Err(Error::ParentNotFound { schema, parent }) => {
                assert_eq!(schema, "orphan");
                assert_eq!(parent, "no-such-parent");
            }
            other => panic!("expected ParentNotFound, got {other:?}"),
        }
    }

    #[test]
    fn load_from_yaml_parses_elements() {
        let loader = SchemaLoader::default();
        let yaml = r"
name: inline
elements:
  - name: message-type
    required: true
    value:
      - ORU^R01
    destinations:
      - MSH-9
";
        let schema = loader.load_from_yaml(yaml).unwrap();
        assert_eq!(schema.name, "inline");
        assert_eq!(schema.elements.len(), 1);
        assert!(schema.elements[0].required);
    }

    #[test]
    fn load_from_yaml_rejects_both_modes() {
        let loader = SchemaLoader::default();
        let yaml = r"
name: broken
elements:
  - name: both
    schema: sub
    value:
      - x
";
        match loader.load_from_yaml(yaml) {
            Err(Error::Validation { schema, details }) => {
                assert_eq!(schema, "broken");
                assert!(details.contains("exactly one"));
            }
            other => panic!("expected Validation, got {other:?}"),
        }
    }

    #[test]
    fn load_from_yaml_rejects_bad_condition() {
        let loader = SchemaLoader::default();
        let yaml = r"
name: broken
elements:
  - name: guarded
    condition: 'nonsense here'
    value:
      - x
    destinations:
      - MSH-9
";
        assert!(matches!(
            loader.load_from_yaml(yaml),
            Err(Error::Validation { .. })
        ));
    }

    #[test]
    fn load_from_json_invalid_input() {
        let loader = SchemaLoader::default();
        assert!(matches!(
            loader.load_from_json("not valid json"),
            Err(Error::InvalidFormat { .. })
        ));
    }
}
