//! Node types for the canonical document tree

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A node in the document tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Node name (e.g., segment tag, resource type, field name)
    pub name: String,

    /// Node type
    pub node_type: NodeType,

    /// Node value (if applicable)
    pub value: Option<Value>,

    /// Child nodes
    pub children: Vec<Node>,

    /// Node attributes (metadata, flags, etc.)
    pub attributes: HashMap<String, String>,
}

/// Types of nodes in the document tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeType {
    /// Root of the document
    Root,

    /// FHIR-style resource (e.g. Patient, Observation)
    Resource,

    /// HL7-style segment (e.g. MSH, PID, OBX)
    Segment,

    /// Group of related nodes
    Group,

    /// One reportable item (e.g. a single test result)
    Item,

    /// Field within a segment or resource
    Field,

    /// Component within a field
    Component,

    /// Side-channel metadata attached alongside the structural mapping
    Extension,
}

/// Values that can be stored in nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// String value
    String(String),

    /// Integer value
    Integer(i64),

    /// Decimal value
    Decimal(f64),

    /// Boolean value
    Boolean(bool),

    /// Date value (ISO 8601)
    Date(String),

    /// Time value (ISO 8601)
    Time(String),

    /// DateTime value (ISO 8601)
    DateTime(String),

    /// Null/empty value
    Null,
}

impl Node {
    /// Create a new node
    pub fn new(name: impl Into<String>, node_type: NodeType) -> Self {
        Self {
            name: name.into(),
            node_type,
            value: None,
            children: Vec::new(),
            attributes: HashMap::new(),
        }
    }

    /// Create a node with a value
    pub fn with_value(name: impl Into<String>, node_type: NodeType, value: Value) -> Self {
        Self {
            name: name.into(),
            node_type,
            value: Some(value),
            children: Vec::new(),
            attributes: HashMap::new(),
        }
    }

    /// Add a child node
    pub fn add_child(&mut self, child: Node) -> &mut Self {
        self.children.push(child);
        self
    }

    /// Set an attribute
    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Find the first child with the given name
    pub fn find_child(&self, name: &str) -> Option<&Node> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Find all children with the given name, in document order
    pub fn find_children(&self, name: &str) -> Vec<&Node> {
        self.children.iter().filter(|c| c.name == name).collect()
    }
}

impl Value {
    /// Convert the value to its string form
    pub fn as_string(&self) -> Option<String> {
        match self {
            Value::String(s) => Some(s.clone()),
            Value::Integer(i) => Some(i.to_string()),
            Value::Decimal(d) => Some(d.to_string()),
            Value::Boolean(b) => Some(b.to_string()),
            Value::Date(d) | Value::Time(d) | Value::DateTime(d) => Some(d.clone()),
            Value::Null => None,
        }
    }

    /// Check if value is null or renders to an empty string
    pub fn is_empty(&self) -> bool {
        match self {
            Value::Null => true,
            other => other.as_string().is_none_or(|s| s.is_empty()),
        }
    }
}
