//! Typed attribute trees.
//!
//! Desired configuration, stored state and backend responses are all
//! represented as [`Attributes`]: a map from attribute name to
//! [`AttributeValue`]. The representation is plain JSON on the wire, so that
//! external configuration loaders and backends can exchange it without
//! knowing about these types.

use std::{
    collections::BTreeMap,
    fmt::{self, Display},
    str::FromStr,
};

use serde::{Deserialize, Serialize};

/// The attributes of a resource, or of one nested block.
pub type Attributes = BTreeMap<String, AttributeValue>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    Number(f64),
    String(String),
    List(Vec<AttributeValue>),
    Block(Attributes),
}

impl AttributeValue {
    /// Name of the variant, for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            AttributeValue::Bool(_) => "bool",
            AttributeValue::Number(_) => "number",
            AttributeValue::String(_) => "string",
            AttributeValue::List(_) => "list",
            AttributeValue::Block(_) => "block",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_block(&self) -> Option<&Attributes> {
        match self {
            AttributeValue::Block(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[AttributeValue]> {
        match self {
            AttributeValue::List(l) => Some(l),
            _ => None,
        }
    }

    /// Follow `path` into this value. An empty path returns `self`.
    pub fn lookup(&self, path: &AttributePath) -> Option<&AttributeValue> {
        let mut current = self;
        for segment in path.segments() {
            current = match (segment, current) {
                (PathSegment::Attribute(name), AttributeValue::Block(b)) => b.get(name)?,
                (PathSegment::Index(i), AttributeValue::List(l)) => l.get(*i)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// A string that is equal for structurally equal values, used to give
    /// set-like block lists a deterministic order.
    pub(crate) fn canonical_key(&self) -> String {
        // BTreeMap keys serialize in sorted order, so this is canonical.
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl From<&str> for AttributeValue {
    fn from(s: &str) -> Self {
        AttributeValue::String(s.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(s: String) -> Self {
        AttributeValue::String(s)
    }
}

impl From<bool> for AttributeValue {
    fn from(b: bool) -> Self {
        AttributeValue::Bool(b)
    }
}

impl From<f64> for AttributeValue {
    fn from(n: f64) -> Self {
        AttributeValue::Number(n)
    }
}

impl From<Attributes> for AttributeValue {
    fn from(b: Attributes) -> Self {
        AttributeValue::Block(b)
    }
}

impl Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::String(s) => write!(f, "{:?}", s),
            other => write!(f, "{}", serde_json::to_string(other).map_err(|_| fmt::Error)?),
        }
    }
}

/// Look up a flatmap-style path such as `parameter.0.name` in a resource's
/// attributes.
pub fn lookup<'a>(attributes: &'a Attributes, path: &AttributePath) -> Option<&'a AttributeValue> {
    let (first, rest) = path.segments().split_first()?;
    let value = match first {
        PathSegment::Attribute(name) => attributes.get(name)?,
        PathSegment::Index(_) => return None,
    };
    value.lookup(&AttributePath(rest.to_vec()))
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PathSegment {
    Attribute(String),
    Index(usize),
}

/// Location of a value inside an attribute tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AttributePath(Vec<PathSegment>);

impl AttributePath {
    pub fn root() -> Self {
        AttributePath(Vec::new())
    }

    pub fn attr(&self, name: &str) -> Self {
        let mut p = self.clone();
        p.0.push(PathSegment::Attribute(name.to_string()));
        p
    }

    pub fn index(&self, i: usize) -> Self {
        let mut p = self.clone();
        p.0.push(PathSegment::Index(i));
        p
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// The top-level attribute this path starts at.
    pub fn root_attribute(&self) -> Option<&str> {
        match self.0.first() {
            Some(PathSegment::Attribute(name)) => Some(name),
            _ => None,
        }
    }
}

impl Display for AttributePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "<root>");
        }
        for (i, segment) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            match segment {
                PathSegment::Attribute(name) => write!(f, "{}", name)?,
                PathSegment::Index(idx) => write!(f, "{}", idx)?,
            }
        }
        Ok(())
    }
}

impl FromStr for AttributePath {
    type Err = std::convert::Infallible;

    /// Numeric segments are list indices; attribute names are never numeric.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(AttributePath(
            s.split('.')
                .filter(|part| !part.is_empty())
                .map(|part| match part.parse::<usize>() {
                    Ok(i) => PathSegment::Index(i),
                    Err(_) => PathSegment::Attribute(part.to_string()),
                })
                .collect(),
        ))
    }
}

impl From<&str> for AttributePath {
    fn from(s: &str) -> Self {
        match s.parse() {
            Ok(p) => p,
            Err(never) => match never {},
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parameter_group() -> Attributes {
        serde_json::from_value(json!({
            "name": "parameter-group-test-terraform",
            "family": "mysql5.6",
            "parameter": [
                { "name": "character_set_client", "value": "utf8", "apply_method": "immediate" },
                { "name": "collation_server", "value": "utf8_unicode_ci", "apply_method": "immediate" }
            ]
        }))
        .unwrap()
    }

    #[test]
    fn deserializes_plain_json() {
        let attrs = parameter_group();
        assert_eq!(
            attrs.get("family"),
            Some(&AttributeValue::String("mysql5.6".to_string()))
        );
        let params = attrs.get("parameter").and_then(|p| p.as_list()).unwrap();
        assert_eq!(params.len(), 2);
        assert!(params[0].as_block().is_some());

        let n: AttributeValue = serde_json::from_value(json!(3)).unwrap();
        assert_eq!(n, AttributeValue::Number(3.0));
        let b: AttributeValue = serde_json::from_value(json!(true)).unwrap();
        assert_eq!(b, AttributeValue::Bool(true));
    }

    #[test]
    fn path_display_and_parse() {
        let p = AttributePath::root().attr("parameter").index(0).attr("name");
        assert_eq!(p.to_string(), "parameter.0.name");
        assert_eq!(AttributePath::from("parameter.0.name"), p);
        assert_eq!(p.root_attribute(), Some("parameter"));
        assert_eq!(AttributePath::root().to_string(), "<root>");
    }

    #[test]
    fn lookup_flatmap_paths() {
        let attrs = parameter_group();
        assert_eq!(
            lookup(&attrs, &"parameter.1.value".into()),
            Some(&AttributeValue::from("utf8_unicode_ci"))
        );
        assert_eq!(
            lookup(&attrs, &"name".into()),
            Some(&AttributeValue::from("parameter-group-test-terraform"))
        );
        assert_eq!(lookup(&attrs, &"parameter.5.value".into()), None);
        assert_eq!(lookup(&attrs, &"name.value".into()), None);
        assert_eq!(lookup(&attrs, &AttributePath::root()), None);
    }

    #[test]
    fn canonical_key_ignores_insertion_order() {
        let mut a = Attributes::new();
        a.insert("value".to_string(), "utf8".into());
        a.insert("name".to_string(), "x".into());
        let mut b = Attributes::new();
        b.insert("name".to_string(), "x".into());
        b.insert("value".to_string(), "utf8".into());
        assert_eq!(
            AttributeValue::Block(a).canonical_key(),
            AttributeValue::Block(b).canonical_key()
        );
    }
}
