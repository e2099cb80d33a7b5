//! Typed references from linked parameters into a model-system tree.
//!
//! On the wire a reference is a dot-separated string where a literal dot in
//! a field name is escaped as `\.`. It is parsed once into a list of
//! [`PathSegment`]s plus the final parameter name, and resolved by a typed
//! walk: collection nodes are entered by index, named children by field.

use std::fmt;
use std::str::FromStr;

use super::structure::{ModelSystemStructure, ParameterValue};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathSegment {
    /// Position inside a collection node.
    Index(usize),
    /// Parent field name of a named child.
    Field(String),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ReferenceParseError {
    #[error("parameter reference is empty")]
    Empty,
    #[error("parameter reference `{0}` has an empty segment")]
    EmptySegment(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParameterReference {
    segments: Vec<PathSegment>,
    parameter: String,
}

impl ParameterReference {
    pub fn new(segments: Vec<PathSegment>, parameter: impl Into<String>) -> Self {
        Self {
            segments,
            parameter: parameter.into(),
        }
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    pub fn parameter(&self) -> &str {
        &self.parameter
    }

    /// Find the node that owns the referenced parameter.
    pub fn locate<'a>(&self, root: &'a ModelSystemStructure) -> Option<&'a ModelSystemStructure> {
        let mut current = root;
        for segment in &self.segments {
            let index = child_index(current, segment)?;
            current = &current.children[index];
        }
        Some(current)
    }

    pub fn resolve<'a>(&self, root: &'a ModelSystemStructure) -> Option<&'a ParameterValue> {
        self.locate(root)?
            .parameters
            .iter()
            .find(|p| p.name == self.parameter)
    }

    pub fn resolve_mut<'a>(&self, root: &'a mut ModelSystemStructure) -> Option<&'a mut ParameterValue> {
        let mut current = root;
        for segment in &self.segments {
            let index = child_index(current, segment)?;
            current = &mut current.children[index];
        }
        current.parameter_mut(&self.parameter)
    }
}

fn child_index(node: &ModelSystemStructure, segment: &PathSegment) -> Option<usize> {
    match (node.is_collection, segment) {
        (true, PathSegment::Index(i)) => (*i < node.children.len()).then_some(*i),
        (true, PathSegment::Field(_)) => None,
        // a numeric field name parses as an index; match it textually
        (false, PathSegment::Index(i)) => find_field(node, &i.to_string()),
        (false, PathSegment::Field(name)) => find_field(node, name),
    }
}

fn find_field(node: &ModelSystemStructure, name: &str) -> Option<usize> {
    node.children
        .iter()
        .position(|c| c.parent_field_name.as_deref() == Some(name))
}

/// Split on unescaped dots. `\.` yields a literal dot; any other backslash
/// is kept as-is.
fn split_escaped(text: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::with_capacity(text.len());
    let mut escape = false;
    for c in text.chars() {
        if escape && c != '.' {
            current.push('\\');
        }
        if !escape && c == '.' {
            parts.push(std::mem::take(&mut current));
        } else if c != '\\' {
            current.push(c);
            escape = false;
        } else {
            escape = true;
        }
    }
    if escape {
        current.push('\\');
    }
    parts.push(current);
    parts
}

impl FromStr for ParameterReference {
    type Err = ReferenceParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ReferenceParseError::Empty);
        }
        let mut parts = split_escaped(s);
        if parts.iter().any(String::is_empty) {
            return Err(ReferenceParseError::EmptySegment(s.to_string()));
        }
        let parameter = parts.pop().ok_or(ReferenceParseError::Empty)?;
        let segments = parts
            .into_iter()
            .map(|part| match part.parse::<usize>() {
                Ok(index) if part.bytes().all(|b| b.is_ascii_digit()) => PathSegment::Index(index),
                _ => PathSegment::Field(part),
            })
            .collect();
        Ok(Self { segments, parameter })
    }
}

impl fmt::Display for ParameterReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.segments {
            match segment {
                PathSegment::Index(i) => write!(f, "{i}.")?,
                PathSegment::Field(name) => write!(f, "{}.", name.replace('.', "\\."))?,
            }
        }
        f.write_str(&self.parameter.replace('.', "\\."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mixed_segments() {
        let r: ParameterReference = "Scenarios.2.Zone System.Number Of Zones".parse().unwrap();
        assert_eq!(
            r.segments(),
            &[
                PathSegment::Field("Scenarios".into()),
                PathSegment::Index(2),
                PathSegment::Field("Zone System".into()),
            ]
        );
        assert_eq!(r.parameter(), "Number Of Zones");
    }

    #[test]
    fn test_escaped_dot_is_literal() {
        let r: ParameterReference = r"Version 1\.5.Rate".parse().unwrap();
        assert_eq!(r.segments(), &[PathSegment::Field("Version 1.5".into())]);
        assert_eq!(r.parameter(), "Rate");
        assert_eq!(r.to_string(), r"Version 1\.5.Rate");
    }

    #[test]
    fn test_other_backslashes_are_kept() {
        let r: ParameterReference = r"C:\data.Path\".parse().unwrap();
        assert_eq!(r.segments(), &[PathSegment::Field(r"C:\data".into())]);
        assert_eq!(r.parameter(), r"Path\");
    }

    #[test]
    fn test_parameter_only() {
        let r: ParameterReference = "Iterations".parse().unwrap();
        assert!(r.segments().is_empty());
        assert_eq!(r.parameter(), "Iterations");
    }

    #[test]
    fn test_rejects_empty_input() {
        assert_eq!("".parse::<ParameterReference>(), Err(ReferenceParseError::Empty));
        assert!(matches!(
            "A..B".parse::<ParameterReference>(),
            Err(ReferenceParseError::EmptySegment(_))
        ));
    }

    #[test]
    fn test_resolve_against_tree() {
        let root = ModelSystemStructure::new("Root", "Sequence")
            .with_field(
                "Model.Part",
                ModelSystemStructure::new("Dotted", "Delay").with_parameter("Millis", "3"),
            )
            .with_field(
                "Runs",
                ModelSystemStructure::collection("Runs")
                    .with_child(ModelSystemStructure::new("First", "Delay").with_parameter("Millis", "1")),
            );

        let dotted: ParameterReference = r"Model\.Part.Millis".parse().unwrap();
        assert_eq!(dotted.resolve(&root).map(|p| p.value.as_str()), Some("3"));

        let indexed: ParameterReference = "Runs.0.Millis".parse().unwrap();
        assert_eq!(indexed.locate(&root).map(|n| n.name.as_str()), Some("First"));

        let out_of_range: ParameterReference = "Runs.4.Millis".parse().unwrap();
        assert!(out_of_range.resolve(&root).is_none());

        let named_in_collection: ParameterReference = "Runs.First.Millis".parse().unwrap();
        assert!(named_in_collection.resolve(&root).is_none());
    }
}
