//! Schema inheritance and merge logic

use crate::model::Schema;

/// Merge a child schema over its parent.
///
/// Child elements override parent elements with the same name in place;
/// parent elements the child does not name are inherited unchanged;
/// child-only elements are appended after the parent's. The result keeps
/// the child's identity and the parent's target format when the child
/// does not set one. Deterministic for a given input pair.
pub fn merge(parent: &Schema, child: &Schema) -> Schema {
    let mut elements = Vec::with_capacity(parent.elements.len() + child.elements.len());

    for parent_element in &parent.elements {
        match child.find_element(&parent_element.name) {
            Some(override_element) => elements.push(override_element.clone()),
            None => elements.push(parent_element.clone()),
        }
    }
    for child_element in &child.elements {
        if parent.find_element(&child_element.name).is_none() {
            elements.push(child_element.clone());
        }
    }

    Schema {
        name: child.name.clone(),
        extends: None,
        target_format_type: child
            .target_format_type
            .clone()
            .or_else(|| parent.target_format_type.clone()),
        target_format_version: child
            .target_format_version
            .clone()
            .or_else(|| parent.target_format_version.clone()),
        elements,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{FieldSpec, ValueTemplate};
    use crate::model::{ElementRule, SchemaElement};

    fn value_element(name: &str, template: &str, dest: &str) -> SchemaElement {
        SchemaElement {
            name: name.to_string(),
            condition: None,
            required: false,
            rule: ElementRule::Value {
                templates: vec![ValueTemplate::parse(template).unwrap()],
                destinations: vec![FieldSpec::parse(dest).unwrap()],
            },
        }
    }

    fn parent_schema() -> Schema {
        Schema::new("base")
            .with_target("ORU_R01", "2.5.1")
            .with_elements(vec![
                value_element("message-type", "ORU^R01", "MSH-9"),
                value_element("processing-id", "P", "MSH-11"),
            ])
    }

    #[test]
    fn child_overrides_by_element_name_in_place() {
        let parent = parent_schema();
        let child = Schema::new("partner")
            .with_extends("base")
            .with_elements(vec![
                value_element("processing-id", "T", "MSH-11"),
                value_element("receiving-app", "PARTNER", "MSH-5"),
            ]);

        let merged = merge(&parent, &child);

        assert_eq!(merged.name, "partner");
        assert_eq!(merged.elements.len(), 3);
        // Parent order kept, override in place
        assert_eq!(merged.elements[0].name, "message-type");
        assert_eq!(merged.elements[1].name, "processing-id");
        assert_eq!(merged.elements[2].name, "receiving-app");

        let ElementRule::Value { templates, .. } = &merged.elements[1].rule else {
            panic!("expected value element");
        };
        assert_eq!(templates[0].raw(), "T");
        // Target format inherited from the root
        assert_eq!(merged.target_format_type.as_deref(), Some("ORU_R01"));
    }

    #[test]
    fn merge_is_deterministic() {
        let parent = parent_schema();
        let child = Schema::new("partner")
            .with_extends("base")
            .with_elements(vec![value_element("receiving-app", "PARTNER", "MSH-5")]);

        let once = merge(&parent, &child);
        let twice = merge(&parent, &child);
        assert_eq!(once, twice);
    }
}
