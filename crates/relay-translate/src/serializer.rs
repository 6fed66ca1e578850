//! Document to HL7v2 serialization via the schema engine
//!
//! The serializer never guesses at structure: it looks up the template
//! schema registered for the message type/version, runs the converter,
//! and applies the resulting field writes into an ordered message
//! builder. An unregistered type is a hard error.

use crate::config::TranslatorConfig;
use crate::{Error, Result};
use relay_document::Document;
use relay_schema::{Converter, FieldWrite, SchemaLoader};
use std::sync::Arc;
use tracing::{debug, warn};

const FIELD_SEP: char = '|';
const COMPONENT_SEP: char = '^';
const DEFAULT_ENCODING_CHARS: &str = "^~\\&";

/// Ordered HL7 message builder with 1-based field and component
/// addressing. Segment repetitions grow on demand.
#[derive(Debug, Default)]
pub struct Hl7Message {
    segments: Vec<SegmentBuffer>,
}

#[derive(Debug)]
struct SegmentBuffer {
    name: String,
    repetition: usize,
    /// fields[i] holds the components of field i+1
    fields: Vec<Vec<String>>,
}

impl Hl7Message {
    /// Create an empty message
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a field (or component) value, creating the segment
    /// repetition and growing the field list as needed.
    pub fn set(
        &mut self,
        segment: &str,
        repetition: usize,
        field: usize,
        component: Option<usize>,
        value: &str,
    ) {
        let buffer = self.segment_mut(segment, repetition.max(1));
        if buffer.fields.len() < field {
            buffer.fields.resize(field, Vec::new());
        }
        let components = &mut buffer.fields[field - 1];
        let slot = component.unwrap_or(1);
        if components.len() < slot {
            components.resize(slot, String::new());
        }
        components[slot - 1] = value.to_string();
    }

    /// Apply a converter field write
    pub fn apply(&mut self, write: &FieldWrite) {
        self.set(
            &write.segment,
            write.repetition,
            write.field,
            write.component,
            &write.value,
        );
    }

    fn segment_mut(&mut self, name: &str, repetition: usize) -> &mut SegmentBuffer {
        if let Some(pos) = self
            .segments
            .iter()
            .position(|s| s.name == name && s.repetition == repetition)
        {
            return &mut self.segments[pos];
        }

        // Keep repetitions of the same segment adjacent and ordered
        let insert_at = self
            .segments
            .iter()
            .rposition(|s| s.name == name)
            .map_or(self.segments.len(), |p| p + 1);
        self.segments.insert(
            insert_at,
            SegmentBuffer {
                name: name.to_string(),
                repetition,
                fields: Vec::new(),
            },
        );
        let pos = self
            .segments
            .iter()
            .position(|s| s.name == name && s.repetition == repetition)
            .unwrap_or(insert_at);
        &mut self.segments[pos]
    }

    /// Render the message with CR segment terminators.
    pub fn render(&self) -> String {
        let mut ordered: Vec<&SegmentBuffer> = self.segments.iter().collect();
        // MSH leads regardless of write order
        ordered.sort_by_key(|s| usize::from(s.name != "MSH"));

        ordered
            .iter()
            .map(|s| render_segment(s))
            .collect::<Vec<_>>()
            .join("\r")
    }
}

fn render_segment(segment: &SegmentBuffer) -> String {
    let mut rendered: Vec<String> = segment
        .fields
        .iter()
        .map(|components| {
            let mut parts = components.clone();
            while parts.len() > 1 && parts.last().is_some_and(String::is_empty) {
                parts.pop();
            }
            parts.join(&COMPONENT_SEP.to_string())
        })
        .collect();

    if segment.name == "MSH" {
        // Field 1 is the separator itself; field 2 defaults to the
        // standard encoding characters.
        if rendered.len() < 2 {
            rendered.resize(2, String::new());
        }
        if rendered[1].is_empty() {
            rendered[1] = DEFAULT_ENCODING_CHARS.to_string();
        }
        let mut out = segment.name.clone();
        for field in &rendered[1..] {
            out.push(FIELD_SEP);
            out.push_str(field);
        }
        out
    } else {
        let mut out = segment.name.clone();
        for field in &rendered {
            out.push(FIELD_SEP);
            out.push_str(field);
        }
        out
    }
}

/// Serializes documents into HL7v2 via registered template schemas
pub struct Hl7Serializer {
    config: TranslatorConfig,
    loader: Arc<SchemaLoader>,
    converter: Converter,
}

impl Hl7Serializer {
    /// Create a serializer from a translator configuration
    pub fn new(config: TranslatorConfig) -> Self {
        let loader = Arc::new(SchemaLoader::new(config.schema_paths.clone()));
        let converter = Converter::new(Arc::clone(&loader));
        Self {
            config,
            loader,
            converter,
        }
    }

    /// Create a serializer sharing an existing loader
    pub fn with_loader(config: TranslatorConfig, loader: Arc<SchemaLoader>) -> Self {
        let converter = Converter::new(Arc::clone(&loader));
        Self {
            config,
            loader,
            converter,
        }
    }

    /// Serialize a document for the given message type and version.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::UnsupportedMessageType`] when no template is
    /// registered, and propagates schema load and conversion failures.
    pub fn serialize(
        &self,
        document: &Document,
        message_type: &str,
        version: &str,
    ) -> Result<String> {
        let template = self
            .config
            .template_for(message_type, version)
            .ok_or_else(|| Error::UnsupportedMessageType {
                message_type: message_type.to_string(),
                version: version.to_string(),
            })?;

        debug!(%message_type, %version, %template, "serializing via template schema");
        self.serialize_with_schema(document, template)
    }

    /// Serialize a document through a template schema named directly,
    /// bypassing the type/version registry.
    pub fn serialize_with_schema(&self, document: &Document, schema_name: &str) -> Result<String> {
        let schema = self.loader.load(schema_name)?;
        let conversion = self.converter.convert(&schema, document)?;
        for error in &conversion.errors {
            warn!(
                schema = %error.schema,
                element = %error.element,
                "element skipped during serialization: {}",
                error.message
            );
        }

        let mut message = Hl7Message::new();
        for write in &conversion.writes {
            message.apply(write);
        }
        Ok(message.render())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_addresses_fields_one_based() {
        let mut msg = Hl7Message::new();
        msg.set("PID", 1, 5, Some(1), "DOE");
        msg.set("PID", 1, 5, Some(2), "JANE");
        msg.set("PID", 1, 1, None, "1");

        assert_eq!(msg.render(), "PID|1||||DOE^JANE");
    }

    #[test]
    fn msh_renders_separator_and_encoding() {
        let mut msg = Hl7Message::new();
        msg.set("MSH", 1, 9, None, "ORU^R01");
        assert_eq!(msg.render(), "MSH|^~\\&|||||||ORU^R01");
    }

    #[test]
    fn repetitions_stay_adjacent_and_ordered() {
        let mut msg = Hl7Message::new();
        msg.set("MSH", 1, 9, None, "ORU^R01");
        msg.set("OBX", 1, 5, None, "POSITIVE");
        msg.set("OBX", 2, 5, None, "NEGATIVE");
        msg.set("OBX", 1, 1, None, "1");
        msg.set("OBX", 2, 1, None, "2");

        let rendered = msg.render();
        let lines: Vec<&str> = rendered.split('\r').collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("MSH"));
        assert_eq!(lines[1], "OBX|1||||POSITIVE");
        assert_eq!(lines[2], "OBX|2||||NEGATIVE");
    }

    #[test]
    fn unknown_message_type_is_a_hard_error() {
        let serializer = Hl7Serializer::new(TranslatorConfig::new(vec![]));
        let doc = relay_document::Document::new(relay_document::Node::new(
            "REPORT",
            relay_document::NodeType::Root,
        ));
        match serializer.serialize(&doc, "ADT_A01", "2.5.1") {
            Err(Error::UnsupportedMessageType { message_type, .. }) => {
                assert_eq!(message_type, "ADT_A01");
            }
            other => panic!("expected UnsupportedMessageType, got {other:?}"),
        }
    }
}
