//! Structured-path expressions for navigating the document tree
//!
//! A path is a `/`-separated list of child names, each optionally narrowed
//! to one repetition by a zero-based index: `OBX[2]/f5/c1` selects the
//! third `OBX` child, then its `f5` child, then that node's `c1` child.
//! Steps without an index match every repetition during [`PathExpr::resolve_all`]
//! and the first repetition during [`PathExpr::resolve`].

use crate::node::Node;
use crate::{Error, Result};
use std::fmt;

/// One step of a parsed path expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathStep {
    /// Child name to match
    pub name: String,

    /// Optional zero-based repetition index
    pub index: Option<usize>,
}

/// A parsed path expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathExpr {
    steps: Vec<PathStep>,
}

impl PathExpr {
    /// Parse a path expression.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPath`] for empty paths, empty steps, and
    /// malformed index brackets.
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(Error::invalid_path(input, "path is empty"));
        }

        let mut steps = Vec::new();
        for raw in trimmed.split('/') {
            if raw.is_empty() {
                return Err(Error::invalid_path(input, "empty path step"));
            }
            steps.push(Self::parse_step(input, raw)?);
        }
        Ok(Self { steps })
    }

    fn parse_step(input: &str, raw: &str) -> Result<PathStep> {
        if let Some(open) = raw.find('[') {
            if !raw.ends_with(']') {
                return Err(Error::invalid_path(
                    input,
                    format!("step '{raw}' has an unterminated index"),
                ));
            }
            let name = &raw[..open];
            if name.is_empty() {
                return Err(Error::invalid_path(
                    input,
                    format!("step '{raw}' has an index but no name"),
                ));
            }
            let digits = &raw[open + 1..raw.len() - 1];
            let index: usize = digits.parse().map_err(|_| {
                Error::invalid_path(input, format!("step '{raw}' has a non-numeric index"))
            })?;
            Ok(PathStep {
                name: name.to_string(),
                index: Some(index),
            })
        } else if raw.contains(']') {
            Err(Error::invalid_path(
                input,
                format!("step '{raw}' has a stray ']'"),
            ))
        } else {
            Ok(PathStep {
                name: raw.to_string(),
                index: None,
            })
        }
    }

    /// The parsed steps, in order.
    pub fn steps(&self) -> &[PathStep] {
        &self.steps
    }

    /// Resolve the path against a node, returning the first match.
    pub fn resolve<'a>(&self, node: &'a Node) -> Option<&'a Node> {
        self.resolve_all(node).into_iter().next()
    }

    /// Resolve the path against a node, returning every match in
    /// document order. Unindexed steps fan out across repetitions.
    pub fn resolve_all<'a>(&self, node: &'a Node) -> Vec<&'a Node> {
        let mut current = vec![node];
        for step in &self.steps {
            let mut next = Vec::new();
            for candidate in current {
                let matches = candidate.find_children(&step.name);
                match step.index {
                    Some(i) => {
                        if let Some(picked) = matches.get(i) {
                            next.push(*picked);
                        }
                    }
                    None => next.extend(matches),
                }
            }
            if next.is_empty() {
                return Vec::new();
            }
            current = next;
        }
        current
    }

    /// Resolve the path and render the first match's value as a string.
    pub fn resolve_value(&self, node: &Node) -> Option<String> {
        self.resolve(node)
            .and_then(|n| n.value.as_ref())
            .and_then(super::Value::as_string)
    }
}

impl fmt::Display for PathExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, step) in self.steps.iter().enumerate() {
            if i > 0 {
                write!(f, "/")?;
            }
            write!(f, "{}", step.name)?;
            if let Some(idx) = step.index {
                write!(f, "[{idx}]")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{NodeType, Value};

    fn sample_tree() -> Node {
        let mut root = Node::new("REPORT", NodeType::Root);
        for v in ["a", "b", "c"] {
            let mut obx = Node::new("OBX", NodeType::Segment);
            obx.add_child(Node::with_value(
                "f5",
                NodeType::Field,
                Value::String(v.to_string()),
            ));
            root.add_child(obx);
        }
        root
    }

    #[test]
    fn parse_round_trips_through_display() {
        let expr = PathExpr::parse("OBX[2]/f5/c1").unwrap();
        assert_eq!(expr.to_string(), "OBX[2]/f5/c1");
        assert_eq!(expr.steps().len(), 3);
        assert_eq!(expr.steps()[0].index, Some(2));
        assert_eq!(expr.steps()[1].index, None);
    }

    #[test]
    fn malformed_paths_are_parse_errors() {
        assert!(PathExpr::parse("").is_err());
        assert!(PathExpr::parse("a//b").is_err());
        assert!(PathExpr::parse("a[1").is_err());
        assert!(PathExpr::parse("a[x]").is_err());
        assert!(PathExpr::parse("[0]").is_err());
        assert!(PathExpr::parse("a]b").is_err());
    }

    #[test]
    fn indexed_step_picks_one_repetition() {
        let root = sample_tree();
        let expr = PathExpr::parse("OBX[1]/f5").unwrap();
        assert_eq!(expr.resolve_value(&root).as_deref(), Some("b"));

        let missing = PathExpr::parse("OBX[9]/f5").unwrap();
        assert!(missing.resolve(&root).is_none());
    }

    #[test]
    fn unindexed_step_fans_out() {
        let root = sample_tree();
        let expr = PathExpr::parse("OBX/f5").unwrap();

        let all = expr.resolve_all(&root);
        assert_eq!(all.len(), 3);
        // First match wins for resolve
        assert_eq!(expr.resolve_value(&root).as_deref(), Some("a"));
    }
}
