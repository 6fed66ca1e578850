//! FHIR JSON structural parser
//!
//! Bundles become a root with one `Resource` node per entry; Observation
//! resources are wrapped in `ITEM` nodes so they count as reportable
//! items. Nested objects become field subtrees, arrays fan out into
//! repeated children.

use crate::{Error, Result};
use relay_document::{Document, DocumentMetadata, Node, NodeType, Value};
use serde_json::Value as Json;
use tracing::trace;

/// Parser for FHIR JSON payloads
pub struct FhirParser;

impl FhirParser {
    /// Create a new FHIR parser
    pub fn new() -> Self {
        Self
    }

    /// Parse a FHIR JSON payload (a Bundle or a single resource).
    ///
    /// # Errors
    ///
    /// Fails on invalid JSON or a payload without a `resourceType`.
    pub fn parse(&self, json: &str) -> Result<Document> {
        let value: Json = serde_json::from_str(json)?;
        let resource_type = value
            .get("resourceType")
            .and_then(Json::as_str)
            .ok_or_else(|| Error::parse(1, "payload has no resourceType"))?
            .to_string();

        let mut root = Node::new("REPORT", NodeType::Root);

        if resource_type == "Bundle" {
            let entries = value
                .get("entry")
                .and_then(Json::as_array)
                .cloned()
                .unwrap_or_default();
            for entry in &entries {
                if let Some(resource) = entry.get("resource") {
                    add_resource(&mut root, resource)?;
                }
            }
        } else {
            add_resource(&mut root, &value)?;
        }

        let mut metadata = DocumentMetadata::new();
        metadata.doc_type = Some(resource_type);
        metadata.doc_version = Some("R4".to_string());
        metadata.sender_id = sender_from_bundle(&value);

        trace!(
            doc_type = metadata.doc_type.as_deref().unwrap_or(""),
            "parsed FHIR payload"
        );
        Ok(Document::with_metadata(root, metadata))
    }
}

impl Default for FhirParser {
    fn default() -> Self {
        Self::new()
    }
}

fn add_resource(root: &mut Node, resource: &Json) -> Result<()> {
    let resource_type = resource
        .get("resourceType")
        .and_then(Json::as_str)
        .ok_or_else(|| Error::parse(1, "bundle entry has no resourceType"))?;

    let mut node = Node::new(resource_type, NodeType::Resource);
    if let Some(fields) = resource.as_object() {
        for (key, value) in fields {
            if key == "resourceType" {
                continue;
            }
            append_json(&mut node, key, value);
        }
    }

    if resource_type == "Observation" {
        let mut item = Node::new("ITEM", NodeType::Item);
        item.add_child(node);
        root.add_child(item);
    } else {
        root.add_child(node);
    }
    Ok(())
}

/// Map a JSON value onto field nodes. Arrays become repeated children
/// under the same name.
fn append_json(parent: &mut Node, name: &str, value: &Json) {
    match value {
        Json::Array(items) => {
            for item in items {
                append_json(parent, name, item);
            }
        }
        Json::Object(fields) => {
            let mut node = Node::new(name, NodeType::Field);
            for (key, child) in fields {
                append_json(&mut node, key, child);
            }
            parent.add_child(node);
        }
        Json::String(s) => {
            parent.add_child(Node::with_value(
                name,
                NodeType::Field,
                Value::String(s.clone()),
            ));
        }
        Json::Number(n) => {
            let v = n
                .as_i64()
                .map(Value::Integer)
                .or_else(|| n.as_f64().map(Value::Decimal))
                .unwrap_or(Value::Null);
            parent.add_child(Node::with_value(name, NodeType::Field, v));
        }
        Json::Bool(b) => {
            parent.add_child(Node::with_value(name, NodeType::Field, Value::Boolean(*b)));
        }
        Json::Null => {
            parent.add_child(Node::with_value(name, NodeType::Field, Value::Null));
        }
    }
}

fn sender_from_bundle(value: &Json) -> Option<String> {
    // MessageHeader.source.name identifies the submitting system
    let entries = value.get("entry")?.as_array()?;
    for entry in entries {
        let resource = entry.get("resource")?;
        if resource.get("resourceType").and_then(Json::as_str) == Some("MessageHeader") {
            return resource
                .get("source")
                .and_then(|s| s.get("name"))
                .and_then(Json::as_str)
                .map(ToString::to_string);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const BUNDLE: &str = r#"{
        "resourceType": "Bundle",
        "type": "message",
        "entry": [
            {"resource": {"resourceType": "MessageHeader", "source": {"name": "acme-lab"}}},
            {"resource": {"resourceType": "Patient", "name": [{"family": "Doe", "given": ["Jane"]}]}},
            {"resource": {"resourceType": "Observation", "status": "final", "valueString": "Detected"}},
            {"resource": {"resourceType": "Observation", "status": "final", "valueString": "Not detected"}}
        ]
    }"#;

    #[test]
    fn bundle_entries_become_resources_and_items() {
        let doc = FhirParser::new().parse(BUNDLE).unwrap();

        assert_eq!(doc.metadata.doc_type.as_deref(), Some("Bundle"));
        assert_eq!(doc.metadata.sender_id.as_deref(), Some("acme-lab"));
        assert_eq!(doc.items().len(), 2);

        let patient = doc.root.find_child("Patient").unwrap();
        assert_eq!(patient.node_type, NodeType::Resource);
        let family = patient
            .find_child("name")
            .and_then(|n| n.find_child("family"))
            .unwrap();
        assert_eq!(family.value, Some(Value::String("Doe".to_string())));
    }

    #[test]
    fn single_resource_parses() {
        let doc = FhirParser::new()
            .parse(r#"{"resourceType": "Observation", "status": "final"}"#)
            .unwrap();
        assert_eq!(doc.items().len(), 1);
    }

    #[test]
    fn invalid_payloads_are_errors() {
        assert!(FhirParser::new().parse("{not json").is_err());
        assert!(FhirParser::new().parse(r#"{"no": "type"}"#).is_err());
    }
}
