//! Condition, template, and destination-field expressions
//!
//! These small grammars are parsed once at schema load; evaluation against
//! a document node never fails, it only yields booleans or strings.

use crate::{Error, Result};
use regex::Regex;
use relay_document::{Node, PathExpr};

/// A boolean condition evaluated against a document node.
///
/// Grammar: `exists(path)`, `path = 'literal'`, `path != 'literal'`,
/// `matches(path, pattern)`, and the combinators `and(...)`, `or(...)`,
/// `not(...)`.
#[derive(Debug, Clone)]
pub enum ConditionExpr {
    Exists(PathExpr),
    Equals { path: PathExpr, literal: String },
    NotEquals { path: PathExpr, literal: String },
    Matches { path: PathExpr, pattern: Regex },
    And(Vec<ConditionExpr>),
    Or(Vec<ConditionExpr>),
    Not(Box<ConditionExpr>),
}

impl PartialEq for ConditionExpr {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Exists(a), Self::Exists(b)) => a == b,
            (
                Self::Equals { path: p1, literal: l1 },
                Self::Equals { path: p2, literal: l2 },
            )
            | (
                Self::NotEquals { path: p1, literal: l1 },
                Self::NotEquals { path: p2, literal: l2 },
            ) => p1 == p2 && l1 == l2,
            (
                Self::Matches { path: p1, pattern: r1 },
                Self::Matches { path: p2, pattern: r2 },
            ) => p1 == p2 && r1.as_str() == r2.as_str(),
            (Self::And(a), Self::And(b)) | (Self::Or(a), Self::Or(b)) => a == b,
            (Self::Not(a), Self::Not(b)) => a == b,
            _ => false,
        }
    }
}

impl ConditionExpr {
    /// Parse a condition expression.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Expression`] on malformed input.
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(Error::expression(input, "condition is empty"));
        }
        Self::parse_inner(input, trimmed)
    }

    fn parse_inner(original: &str, s: &str) -> Result<Self> {
        let s = s.trim();

        if let Some(inner) = strip_call(s, "and") {
            let parts = split_top_level(inner);
            if parts.len() < 2 {
                return Err(Error::expression(original, "and() needs two or more operands"));
            }
            let conds = parts
                .iter()
                .map(|p| Self::parse_inner(original, p))
                .collect::<Result<Vec<_>>>()?;
            return Ok(Self::And(conds));
        }
        if let Some(inner) = strip_call(s, "or") {
            let parts = split_top_level(inner);
            if parts.len() < 2 {
                return Err(Error::expression(original, "or() needs two or more operands"));
            }
            let conds = parts
                .iter()
                .map(|p| Self::parse_inner(original, p))
                .collect::<Result<Vec<_>>>()?;
            return Ok(Self::Or(conds));
        }
        if let Some(inner) = strip_call(s, "not") {
            return Ok(Self::Not(Box::new(Self::parse_inner(original, inner)?)));
        }
        if let Some(inner) = strip_call(s, "exists") {
            let path = PathExpr::parse(inner.trim())?;
            return Ok(Self::Exists(path));
        }
        if let Some(inner) = strip_call(s, "matches") {
            let parts = split_top_level(inner);
            if parts.len() != 2 {
                return Err(Error::expression(
                    original,
                    "matches() takes a path and a pattern",
                ));
            }
            let path = PathExpr::parse(parts[0].trim())?;
            let raw_pattern = unquote(parts[1].trim());
            let pattern = Regex::new(raw_pattern)
                .map_err(|e| Error::expression(original, format!("bad pattern: {e}")))?;
            return Ok(Self::Matches { path, pattern });
        }

        // Comparison forms: path != 'lit' checked before path = 'lit'
        if let Some((lhs, rhs)) = split_operator(s, "!=") {
            let path = PathExpr::parse(lhs.trim())?;
            let literal = parse_literal(original, rhs.trim())?;
            return Ok(Self::NotEquals { path, literal });
        }
        if let Some((lhs, rhs)) = split_operator(s, "=") {
            let path = PathExpr::parse(lhs.trim())?;
            let literal = parse_literal(original, rhs.trim())?;
            return Ok(Self::Equals { path, literal });
        }

        Err(Error::expression(original, "unrecognized condition form"))
    }

    /// Evaluate against a context node. Missing paths make `exists`,
    /// `=`, and `matches` false and `!=` true.
    pub fn eval(&self, node: &Node) -> bool {
        match self {
            Self::Exists(path) => path.resolve(node).is_some_and(|n| {
                n.value.as_ref().is_some_and(|v| !v.is_empty()) || !n.children.is_empty()
            }),
            Self::Equals { path, literal } => {
                path.resolve_value(node).is_some_and(|v| v == *literal)
            }
            Self::NotEquals { path, literal } => {
                path.resolve_value(node).is_none_or(|v| v != *literal)
            }
            Self::Matches { path, pattern } => {
                path.resolve_value(node).is_some_and(|v| pattern.is_match(&v))
            }
            Self::And(conds) => conds.iter().all(|c| c.eval(node)),
            Self::Or(conds) => conds.iter().any(|c| c.eval(node)),
            Self::Not(cond) => !cond.eval(node),
        }
    }
}

/// If `s` is `name( ... )` with the final `)` closing the first `(`,
/// return the inner text.
fn strip_call<'a>(s: &'a str, name: &str) -> Option<&'a str> {
    let rest = s.strip_prefix(name)?;
    let inner = rest.strip_prefix('(')?.strip_suffix(')')?;

    // The trailing ')' must close the '(' after the call name, not an
    // earlier nested group.
    let mut depth = 1usize;
    let mut in_quote = false;
    for c in inner.chars() {
        match c {
            '\'' => in_quote = !in_quote,
            '(' if !in_quote => depth += 1,
            ')' if !in_quote => {
                depth -= 1;
                if depth == 0 {
                    return None;
                }
            }
            _ => {}
        }
    }
    Some(inner)
}

/// Split on commas at paren depth zero, outside single quotes.
fn split_top_level(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut in_quote = false;
    let mut start = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '\'' => in_quote = !in_quote,
            '(' if !in_quote => depth += 1,
            ')' if !in_quote => depth = depth.saturating_sub(1),
            ',' if !in_quote && depth == 0 => {
                parts.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

/// Split on the first occurrence of `op` outside quotes and parens.
fn split_operator<'a>(s: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    let mut depth = 0usize;
    let mut in_quote = false;
    let mut prev: Option<char> = None;
    for (i, c) in s.char_indices() {
        match c {
            '\'' => in_quote = !in_quote,
            '(' if !in_quote => depth += 1,
            ')' if !in_quote => depth = depth.saturating_sub(1),
            _ => {}
        }
        if !in_quote && depth == 0 && s[i..].starts_with(op) {
            // '=' must not shadow '!='
            if !(op == "=" && prev == Some('!')) {
                return Some((&s[..i], &s[i + op.len()..]));
            }
        }
        prev = Some(c);
    }
    None
}

fn parse_literal(original: &str, s: &str) -> Result<String> {
    if s.len() >= 2 && s.starts_with('\'') && s.ends_with('\'') {
        Ok(s[1..s.len() - 1].to_string())
    } else {
        Err(Error::expression(
            original,
            "comparison literal must be single-quoted",
        ))
    }
}

fn unquote(s: &str) -> &str {
    if s.len() >= 2 && s.starts_with('\'') && s.ends_with('\'') {
        &s[1..s.len() - 1]
    } else {
        s
    }
}

/// A value template: literal text with `%{path}` substitutions and a
/// `%index` placeholder (1-based repetition index under a narrowed
/// context).
#[derive(Debug, Clone, PartialEq)]
pub struct ValueTemplate {
    raw: String,
    parts: Vec<TemplatePart>,
}

#[derive(Debug, Clone, PartialEq)]
enum TemplatePart {
    Literal(String),
    Path(PathExpr),
    Index,
}

impl ValueTemplate {
    /// Parse a template string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Expression`] on unterminated `%{` or malformed
    /// embedded paths.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut parts = Vec::new();
        let mut literal = String::new();
        let mut rest = raw;

        while let Some(pos) = rest.find('%') {
            literal.push_str(&rest[..pos]);
            let after = &rest[pos..];
            if let Some(body) = after.strip_prefix("%{") {
                let end = body
                    .find('}')
                    .ok_or_else(|| Error::expression(raw, "unterminated %{"))?;
                if !literal.is_empty() {
                    parts.push(TemplatePart::Literal(std::mem::take(&mut literal)));
                }
                parts.push(TemplatePart::Path(PathExpr::parse(&body[..end])?));
                rest = &body[end + 1..];
            } else if let Some(after_index) = after.strip_prefix("%index") {
                if !literal.is_empty() {
                    parts.push(TemplatePart::Literal(std::mem::take(&mut literal)));
                }
                parts.push(TemplatePart::Index);
                rest = after_index;
            } else {
                // Lone percent sign is literal text
                literal.push('%');
                rest = &after[1..];
            }
        }
        literal.push_str(rest);
        if !literal.is_empty() {
            parts.push(TemplatePart::Literal(literal));
        }

        Ok(Self {
            raw: raw.to_string(),
            parts,
        })
    }

    /// Render against a context node. Missing paths render as empty;
    /// `%index` renders empty outside a repetition context.
    pub fn render(&self, node: &Node, index: Option<usize>) -> String {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                TemplatePart::Literal(text) => out.push_str(text),
                TemplatePart::Path(path) => {
                    if let Some(value) = path.resolve_value(node) {
                        out.push_str(&value);
                    }
                }
                TemplatePart::Index => {
                    if let Some(i) = index {
                        out.push_str(&i.to_string());
                    }
                }
            }
        }
        out
    }

    /// The original template text.
    pub fn raw(&self) -> &str {
        &self.raw
    }
}

/// Destination coordinates in a delimited message: `SEG-field[-component]`,
/// 1-based. The segment token may carry a `(%index)` repetition
/// placeholder so repeated contexts land in distinct segment repetitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    raw: String,
    segment: String,
    indexed: bool,
    pub field: usize,
    pub component: Option<usize>,
}

impl FieldSpec {
    /// Parse a destination spec.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Expression`] when the spec is not
    /// `SEG-field` or `SEG-field-component` with 1-based numbers.
    pub fn parse(raw: &str) -> Result<Self> {
        let tokens: Vec<&str> = raw.split('-').collect();
        if tokens.len() < 2 || tokens.len() > 3 {
            return Err(Error::expression(raw, "expected SEG-field[-component]"));
        }

        let mut segment = tokens[0].to_string();
        let indexed = segment.contains("(%index)");
        if indexed {
            segment = segment.replace("(%index)", "");
        }
        if segment.is_empty() {
            return Err(Error::expression(raw, "missing segment name"));
        }

        let field: usize = tokens[1]
            .parse()
            .map_err(|_| Error::expression(raw, "field must be a number"))?;
        if field == 0 {
            return Err(Error::expression(raw, "field numbering is 1-based"));
        }

        let component = match tokens.get(2) {
            Some(t) => {
                let c: usize = t
                    .parse()
                    .map_err(|_| Error::expression(raw, "component must be a number"))?;
                if c == 0 {
                    return Err(Error::expression(raw, "component numbering is 1-based"));
                }
                Some(c)
            }
            None => None,
        };

        Ok(Self {
            raw: raw.to_string(),
            segment,
            indexed,
            field,
            component,
        })
    }

    /// Segment name without placeholders.
    pub fn segment(&self) -> &str {
        &self.segment
    }

    /// Segment repetition (1-based) this spec targets under the given
    /// context index. Unindexed specs always target the first repetition.
    pub fn repetition(&self, index: Option<usize>) -> usize {
        if self.indexed {
            index.unwrap_or(1)
        } else {
            1
        }
    }

    /// The original spec text.
    pub fn raw(&self) -> &str {
        &self.raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_document::{NodeType, Value};

    fn patient_node() -> Node {
        let mut pid = Node::new("PID", NodeType::Segment);
        pid.add_child(Node::with_value(
            "f8",
            NodeType::Field,
            Value::String("F".to_string()),
        ));
        let mut root = Node::new("REPORT", NodeType::Root);
        root.add_child(pid);
        root
    }

    #[test]
    fn exists_and_comparisons() {
        let node = patient_node();
        assert!(ConditionExpr::parse("exists(PID/f8)").unwrap().eval(&node));
        assert!(!ConditionExpr::parse("exists(PID/f9)").unwrap().eval(&node));
        assert!(ConditionExpr::parse("PID/f8 = 'F'").unwrap().eval(&node));
        assert!(ConditionExpr::parse("PID/f8 != 'M'").unwrap().eval(&node));
        // Missing path: != holds, = does not
        assert!(ConditionExpr::parse("PID/f9 != 'M'").unwrap().eval(&node));
        assert!(!ConditionExpr::parse("PID/f9 = 'M'").unwrap().eval(&node));
    }

    #[test]
    fn matches_uses_regex() {
        let node = patient_node();
        let cond = ConditionExpr::parse("matches(PID/f8, '^[FM]$')").unwrap();
        assert!(cond.eval(&node));
        let cond = ConditionExpr::parse("matches(PID/f8, '^X')").unwrap();
        assert!(!cond.eval(&node));
    }

    #[test]
    fn combinators_nest() {
        let node = patient_node();
        let cond =
            ConditionExpr::parse("and(exists(PID/f8), or(PID/f8 = 'F', PID/f8 = 'M'))").unwrap();
        assert!(cond.eval(&node));
        let cond = ConditionExpr::parse("not(PID/f8 = 'F')").unwrap();
        assert!(!cond.eval(&node));
    }

    #[test]
    fn malformed_conditions_fail_to_parse() {
        assert!(ConditionExpr::parse("").is_err());
        assert!(ConditionExpr::parse("bogus").is_err());
        assert!(ConditionExpr::parse("and(exists(PID))").is_err());
        assert!(ConditionExpr::parse("PID/f8 = unquoted").is_err());
        assert!(ConditionExpr::parse("matches(PID/f8, '[')").is_err());
    }

    #[test]
    fn template_substitutes_paths_and_index() {
        let node = patient_node();
        let t = ValueTemplate::parse("sex=%{PID/f8} rep=%index").unwrap();
        assert_eq!(t.render(&node, Some(3)), "sex=F rep=3");
        assert_eq!(t.render(&node, None), "sex=F rep=");
    }

    #[test]
    fn template_missing_path_renders_empty() {
        let node = patient_node();
        let t = ValueTemplate::parse("%{PID/f99}").unwrap();
        assert_eq!(t.render(&node, None), "");
    }

    #[test]
    fn template_unterminated_brace_is_an_error() {
        assert!(ValueTemplate::parse("%{PID/f8").is_err());
    }

    #[test]
    fn field_spec_parses_coordinates() {
        let spec = FieldSpec::parse("OBX-5-1").unwrap();
        assert_eq!(spec.segment(), "OBX");
        assert_eq!(spec.field, 5);
        assert_eq!(spec.component, Some(1));
        assert_eq!(spec.repetition(Some(4)), 1);

        let spec = FieldSpec::parse("OBX(%index)-5").unwrap();
        assert_eq!(spec.segment(), "OBX");
        assert_eq!(spec.repetition(Some(4)), 4);
        assert_eq!(spec.repetition(None), 1);
    }

    #[test]
    fn field_spec_rejects_bad_input() {
        assert!(FieldSpec::parse("OBX").is_err());
        assert!(FieldSpec::parse("OBX-0").is_err());
        assert!(FieldSpec::parse("OBX-5-0").is_err());
        assert!(FieldSpec::parse("OBX-x").is_err());
        assert!(FieldSpec::parse("-5").is_err());
    }
}
