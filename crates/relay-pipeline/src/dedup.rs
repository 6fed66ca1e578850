//! Duplicate-submission detection.
//!
//! The hash covers the sender and the declared key fields in
//! declaration order, so two documents with the same values in a
//! different field order never collide by accident, and the same
//! content from two senders stays distinct.

use relay_document::{Document, PathExpr};
use sha2::{Digest, Sha256};

/// SHA-256 over `sender` followed by each key field, uppercase hex.
/// Each value is framed with its byte length so adjacent values cannot
/// shift content across their boundary.
pub fn digest(sender: &str, key_fields: &[String]) -> String {
    let mut hasher = Sha256::new();
    update_framed(&mut hasher, sender);
    for field in key_fields {
        update_framed(&mut hasher, field);
    }
    hex::encode_upper(hasher.finalize())
}

fn update_framed(hasher: &mut Sha256, value: &str) {
    hasher.update((value.len() as u64).to_be_bytes());
    hasher.update(value.as_bytes());
}

/// Resolve the key fields of a document, preserving declaration order.
/// A path with no value contributes an empty string so positions stay
/// stable.
pub fn extract_key_fields(document: &Document, paths: &[PathExpr]) -> Vec<String> {
    paths
        .iter()
        .map(|path| path.resolve_value(&document.root).unwrap_or_default())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_document::{Node, NodeType, Value};

    fn doc(control_id: &str, patient: &str) -> Document {
        let mut root = Node::new("REPORT", NodeType::Root);
        let mut msh = Node::new("MSH", NodeType::Segment);
        msh.add_child(Node::with_value(
            "f10",
            NodeType::Field,
            Value::String(control_id.to_string()),
        ));
        let mut pid = Node::new("PID", NodeType::Segment);
        pid.add_child(Node::with_value(
            "f5",
            NodeType::Field,
            Value::String(patient.to_string()),
        ));
        root.add_child(msh);
        root.add_child(pid);
        Document::new(root)
    }

    fn key_paths() -> Vec<PathExpr> {
        vec![
            PathExpr::parse("MSH/f10").unwrap(),
            PathExpr::parse("PID/f5").unwrap(),
        ]
    }

    #[test]
    fn identical_content_and_sender_hash_identically() {
        let a = extract_key_fields(&doc("C1", "DOE^JANE"), &key_paths());
        let b = extract_key_fields(&doc("C1", "DOE^JANE"), &key_paths());
        assert_eq!(digest("lab-one", &a), digest("lab-one", &b));
    }

    #[test]
    fn sender_isolates_the_hash() {
        let fields = extract_key_fields(&doc("C1", "DOE^JANE"), &key_paths());
        assert_ne!(digest("lab-one", &fields), digest("lab-two", &fields));
    }

    #[test]
    fn field_order_is_declaration_order() {
        let document = doc("C1", "DOE^JANE");
        let forward = extract_key_fields(&document, &key_paths());
        let mut reversed_paths = key_paths();
        reversed_paths.reverse();
        let reversed = extract_key_fields(&document, &reversed_paths);
        assert_ne!(digest("lab-one", &forward), digest("lab-one", &reversed));
    }

    #[test]
    fn missing_fields_keep_their_position() {
        let document = doc("C1", "DOE^JANE");
        let paths = vec![
            PathExpr::parse("MSH/f10").unwrap(),
            PathExpr::parse("MSH/f99").unwrap(),
        ];
        let fields = extract_key_fields(&document, &paths);
        assert_eq!(fields, vec!["C1".to_string(), String::new()]);
    }

    #[test]
    fn value_boundaries_do_not_shift() {
        assert_ne!(
            digest("ab", &["c".to_string()]),
            digest("a", &["bc".to_string()])
        );
        assert_ne!(
            digest("a", &["b".to_string(), "c".to_string()]),
            digest("a", &["bc".to_string()])
        );
    }

    #[test]
    fn digest_is_uppercase_hex() {
        let value = digest("s", &["a".to_string()]);
        assert_eq!(value.len(), 64);
        assert!(value.chars().all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
    }
}
