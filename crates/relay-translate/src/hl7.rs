//! HL7v2 structural parser
//!
//! The structural mapping is fixed: segments split on CR/LF, fields on
//! the separator declared by MSH, repetitions on `~`, components on `^`.
//! Segments become `Segment` nodes with `f{n}` field children and
//! `c{n}` component children; each OBX segment is additionally wrapped
//! in an `ITEM` node so the document's reportable items fall out of the
//! parse.

use crate::{Error, Result};
use relay_document::{Document, DocumentMetadata, Node, NodeType, Value};
use tracing::trace;

/// Parser for HL7v2 messages
pub struct Hl7Parser;

impl Hl7Parser {
    /// Create a new HL7 parser
    pub fn new() -> Self {
        Self
    }

    /// Parse a single HL7v2 message into a document.
    ///
    /// # Errors
    ///
    /// Fails when the message does not begin with an MSH segment or a
    /// segment line is malformed.
    pub fn parse(&self, raw: &str) -> Result<Document> {
        let lines: Vec<&str> = raw
            .split(['\r', '\n'])
            .map(str::trim_end)
            .filter(|l| !l.is_empty())
            .collect();

        let first = lines
            .first()
            .ok_or_else(|| Error::parse(1, "message is empty"))?;
        if !first.starts_with("MSH") || first.len() < 4 {
            return Err(Error::parse(1, "message must begin with an MSH segment"));
        }
        let field_sep = first
            .chars()
            .nth(3)
            .ok_or_else(|| Error::parse(1, "MSH segment is truncated"))?;

        let mut root = Node::new("REPORT", NodeType::Root);
        for (i, line) in lines.iter().enumerate() {
            let segment = parse_segment(i + 1, line, field_sep)?;
            if segment.name == "OBX" {
                let mut item = Node::new("ITEM", NodeType::Item);
                item.add_child(segment);
                root.add_child(item);
            } else {
                root.add_child(segment);
            }
        }

        let metadata = metadata_from_msh(&root);
        trace!(
            doc_type = metadata.doc_type.as_deref().unwrap_or(""),
            items = root
                .children
                .iter()
                .filter(|c| c.node_type == NodeType::Item)
                .count(),
            "parsed HL7 message"
        );

        Ok(Document::with_metadata(root, metadata))
    }
}

impl Default for Hl7Parser {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_segment(position: usize, line: &str, field_sep: char) -> Result<Node> {
    let tokens: Vec<&str> = line.split(field_sep).collect();
    let name = tokens[0];
    if name.len() != 3 || !name.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(Error::parse(
            position,
            format!("invalid segment name '{name}'"),
        ));
    }

    let mut segment = Node::new(name, NodeType::Segment);

    if name == "MSH" {
        // MSH-1 is the field separator itself; MSH-2 the encoding
        // characters, never component-split.
        segment.add_child(Node::with_value(
            "f1",
            NodeType::Field,
            Value::String(field_sep.to_string()),
        ));
        if let Some(encoding) = tokens.get(1) {
            segment.add_child(Node::with_value(
                "f2",
                NodeType::Field,
                Value::String((*encoding).to_string()),
            ));
        }
        for (i, token) in tokens.iter().enumerate().skip(2) {
            add_field(&mut segment, i + 1, token);
        }
    } else {
        for (i, token) in tokens.iter().enumerate().skip(1) {
            add_field(&mut segment, i, token);
        }
    }

    Ok(segment)
}

/// Add one field, fanning repetitions out into repeated `f{n}` nodes.
fn add_field(segment: &mut Node, number: usize, text: &str) {
    for repetition in text.split('~') {
        let mut field = Node::with_value(
            format!("f{number}"),
            NodeType::Field,
            Value::String(repetition.to_string()),
        );
        if repetition.contains('^') {
            for (j, component) in repetition.split('^').enumerate() {
                field.add_child(Node::with_value(
                    format!("c{}", j + 1),
                    NodeType::Component,
                    Value::String(component.to_string()),
                ));
            }
        }
        segment.add_child(field);
    }
}

/// Pull sender, type, and version out of the MSH segment. The message
/// type is normalized to `TYPE_TRIGGER` form for template lookup.
fn metadata_from_msh(root: &Node) -> DocumentMetadata {
    let mut metadata = DocumentMetadata::new();
    let Some(msh) = root.find_child("MSH") else {
        return metadata;
    };

    if let Some(sender) = field_value(msh, 4) {
        metadata.sender_id = Some(sender);
    }
    if let Some(message_type) = field_value(msh, 9) {
        let normalized = message_type
            .split('^')
            .take(2)
            .collect::<Vec<_>>()
            .join("_");
        metadata.doc_type = Some(normalized);
    }
    if let Some(version) = field_value(msh, 12) {
        metadata.doc_version = Some(version);
    }
    metadata
}

pub(crate) fn field_value(segment: &Node, number: usize) -> Option<String> {
    segment
        .find_child(&format!("f{number}"))
        .and_then(|f| f.value.as_ref())
        .and_then(Value::as_string)
        .filter(|v| !v.is_empty())
}
