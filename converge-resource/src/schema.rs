//! Declarative shape of a resource type.
//!
//! A [`Schema`] maps attribute names to [`AttributeDef`]s. Nested repeatable
//! blocks (for example the `parameter` blocks of a database parameter group)
//! carry their own child [`Schema`] and a [`Nesting`] policy that decides how
//! the diff engine identifies blocks.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result, ValidationError, Violation, ViolationReason},
    value::{AttributePath, AttributeValue, Attributes},
};

/// How the elements of a block list are identified when diffing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Nesting {
    /// Position matters: `parameter.0` is compared with `parameter.0`.
    Ordered,
    /// Set semantics: a block is identified by its field values only.
    Unordered,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AttributeType {
    String,
    Bool,
    Number,
    Blocks { block: Box<Schema>, nesting: Nesting },
}

impl AttributeType {
    pub fn name(&self) -> &'static str {
        match self {
            AttributeType::String => "string",
            AttributeType::Bool => "bool",
            AttributeType::Number => "number",
            AttributeType::Blocks { .. } => "list of blocks",
        }
    }

    /// Shallow type check; block contents are checked by the caller.
    pub fn admits(&self, value: &AttributeValue) -> bool {
        matches!(
            (self, value),
            (AttributeType::String, AttributeValue::String(_))
                | (AttributeType::Bool, AttributeValue::Bool(_))
                | (AttributeType::Number, AttributeValue::Number(_))
                | (AttributeType::Blocks { .. }, AttributeValue::List(_))
        )
    }

    pub fn is_scalar(&self) -> bool {
        !matches!(self, AttributeType::Blocks { .. })
    }
}

/// Schema for a single attribute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeDef {
    #[serde(flatten)]
    pub type_: AttributeType,
    #[serde(default)]
    pub required: bool,
    /// Whether configuration may set this attribute. Always true unless the
    /// attribute is required or output-only.
    #[serde(default = "default_true")]
    pub optional: bool,
    /// Whether the backend may fill in or own this attribute.
    #[serde(default)]
    pub computed: bool,
    /// Any change to this attribute means destroy and recreate.
    #[serde(default)]
    pub forces_replace: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<AttributeValue>,
    /// Carried along with its block but never compared, e.g. `apply_method`.
    #[serde(default)]
    pub metadata: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_true() -> bool {
    true
}

impl AttributeDef {
    pub fn new(type_: AttributeType) -> Self {
        AttributeDef {
            type_,
            required: false,
            optional: true,
            computed: false,
            forces_replace: false,
            default: None,
            metadata: false,
            description: None,
        }
    }

    pub fn string() -> Self {
        Self::new(AttributeType::String)
    }

    pub fn bool() -> Self {
        Self::new(AttributeType::Bool)
    }

    pub fn number() -> Self {
        Self::new(AttributeType::Number)
    }

    pub fn blocks(block: Schema, nesting: Nesting) -> Self {
        Self::new(AttributeType::Blocks {
            block: Box::new(block),
            nesting,
        })
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self.optional = false;
        self
    }

    /// Output-only. Chain with [`AttributeDef::optional`] for an attribute
    /// that configuration may set and the backend fills in otherwise.
    pub fn computed(mut self) -> Self {
        self.computed = true;
        self.optional = false;
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn forces_replace(mut self) -> Self {
        self.forces_replace = true;
        self
    }

    pub fn with_default(mut self, value: impl Into<AttributeValue>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn metadata(mut self) -> Self {
        self.metadata = true;
        self
    }

    pub fn describe(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    pub fn is_computed_only(&self) -> bool {
        self.computed && !self.optional && !self.required
    }

    fn check_definition(&self, name: &str) -> Result<()> {
        let invalid = |reason: &str| {
            Err(Error::InvalidSchema {
                attribute: name.to_string(),
                reason: reason.to_string(),
            })
        };
        if self.required && self.computed {
            return invalid("a computed attribute cannot be required");
        }
        if let Some(default) = &self.default {
            if self.required {
                return invalid("a required attribute cannot have a default");
            }
            if !self.type_.is_scalar() || !self.type_.admits(default) {
                return invalid(&format!(
                    "default {} does not have type {}",
                    default,
                    self.type_.name()
                ));
            }
        }
        Ok(())
    }
}

/// The root block schema of a resource type, or the schema of a nested block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawSchema", into = "RawSchema")]
pub struct Schema {
    attributes: BTreeMap<String, AttributeDef>,
}

#[derive(Serialize, Deserialize)]
struct RawSchema {
    attributes: BTreeMap<String, AttributeDef>,
}

impl TryFrom<RawSchema> for Schema {
    type Error = Error;

    fn try_from(raw: RawSchema) -> Result<Self> {
        Schema::new(raw.attributes)
    }
}

impl From<Schema> for RawSchema {
    fn from(schema: Schema) -> Self {
        RawSchema {
            attributes: schema.attributes,
        }
    }
}

/// What [`Schema::collect_violations`] checks.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Check {
    /// Desired configuration: everything.
    Configuration,
    /// Stored or backend state: types and known attribute names only.
    Shape,
}

impl Schema {
    pub fn new<N: Into<String>>(
        attributes: impl IntoIterator<Item = (N, AttributeDef)>,
    ) -> Result<Self> {
        let mut map = BTreeMap::new();
        for (name, def) in attributes {
            let name = name.into();
            def.check_definition(&name)?;
            if map.contains_key(&name) {
                return Err(Error::InvalidSchema {
                    attribute: name,
                    reason: "attribute is declared more than once".to_string(),
                });
            }
            map.insert(name, def);
        }
        Ok(Schema { attributes: map })
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeDef> {
        self.attributes.get(name)
    }

    pub fn attributes(&self) -> impl Iterator<Item = (&String, &AttributeDef)> {
        self.attributes.iter()
    }

    /// Check a desired configuration before any diff or apply logic runs.
    pub fn validate(&self, desired: &Attributes) -> std::result::Result<(), ValidationError> {
        let mut violations = Vec::new();
        self.collect_violations(
            desired,
            &AttributePath::root(),
            Check::Configuration,
            &mut violations,
        );
        if violations.is_empty() {
            Ok(())
        } else {
            Err(ValidationError { violations })
        }
    }

    /// Check that `tree` has the shape this schema describes, without
    /// requiring configuration-level completeness.
    pub(crate) fn check_shape(&self, tree: &Attributes) -> Result<()> {
        let mut violations = Vec::new();
        self.collect_violations(tree, &AttributePath::root(), Check::Shape, &mut violations);
        match violations.into_iter().next() {
            None => Ok(()),
            Some(v) => Err(Error::SchemaMismatch {
                reason: v.reason.to_string(),
                path: v.path,
            }),
        }
    }

    fn collect_violations(
        &self,
        tree: &Attributes,
        path: &AttributePath,
        check: Check,
        violations: &mut Vec<Violation>,
    ) {
        for (name, value) in tree {
            let attr_path = path.attr(name);
            let def = match self.attributes.get(name) {
                Some(def) => def,
                None => {
                    violations.push(Violation {
                        path: attr_path,
                        reason: ViolationReason::UnknownAttribute,
                    });
                    continue;
                }
            };
            if check == Check::Configuration && def.is_computed_only() {
                violations.push(Violation {
                    path: attr_path,
                    reason: ViolationReason::ComputedOnly,
                });
                continue;
            }
            if !def.type_.admits(value) {
                violations.push(Violation {
                    path: attr_path,
                    reason: ViolationReason::TypeMismatch {
                        expected: def.type_.name().to_string(),
                        found: value.kind(),
                    },
                });
                continue;
            }
            if let (AttributeType::Blocks { block, .. }, AttributeValue::List(items)) =
                (&def.type_, value)
            {
                for (i, item) in items.iter().enumerate() {
                    let item_path = attr_path.index(i);
                    match item {
                        AttributeValue::Block(fields) => {
                            block.collect_violations(fields, &item_path, check, violations)
                        }
                        other => violations.push(Violation {
                            path: item_path,
                            reason: ViolationReason::TypeMismatch {
                                expected: "block".to_string(),
                                found: other.kind(),
                            },
                        }),
                    }
                }
            }
        }
        if check == Check::Configuration {
            for (name, def) in &self.attributes {
                if def.required && !tree.contains_key(name) {
                    violations.push(Violation {
                        path: path.attr(name),
                        reason: ViolationReason::MissingRequired,
                    });
                }
            }
        }
    }

    /// Fill unset optional attributes with their declared defaults, inside
    /// nested blocks too.
    pub fn with_defaults(&self, tree: &Attributes) -> Attributes {
        let mut out = tree.clone();
        for (name, def) in &self.attributes {
            if !out.contains_key(name) {
                if let Some(default) = &def.default {
                    out.insert(name.clone(), default.clone());
                }
                continue;
            }
            if let (AttributeType::Blocks { block, .. }, Some(AttributeValue::List(items))) =
                (&def.type_, out.get_mut(name))
            {
                for item in items.iter_mut() {
                    if let AttributeValue::Block(fields) = item {
                        *fields = block.with_defaults(fields);
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parameter_schema() -> Schema {
        Schema::new([
            ("name", AttributeDef::string().required()),
            ("value", AttributeDef::string().required()),
            (
                "apply_method",
                AttributeDef::string().with_default("immediate").metadata(),
            ),
        ])
        .unwrap()
    }

    fn group_schema() -> Schema {
        Schema::new([
            ("name", AttributeDef::string().required().forces_replace()),
            ("family", AttributeDef::string().required().forces_replace()),
            (
                "description",
                AttributeDef::string().with_default("Managed by converge"),
            ),
            (
                "parameter",
                AttributeDef::blocks(parameter_schema(), Nesting::Unordered),
            ),
            ("arn", AttributeDef::string().computed()),
        ])
        .unwrap()
    }

    fn attrs(v: serde_json::Value) -> Attributes {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn rejects_required_computed() {
        let r = Schema::new([("id", AttributeDef::string().computed().required())]);
        assert!(matches!(r, Err(Error::InvalidSchema { attribute, .. }) if attribute == "id"));
    }

    #[test]
    fn rejects_duplicate_names() {
        let r = Schema::new([
            ("name", AttributeDef::string()),
            ("name", AttributeDef::bool()),
        ]);
        assert!(matches!(r, Err(Error::InvalidSchema { .. })));
    }

    #[test]
    fn rejects_mistyped_default() {
        let r = Schema::new([("port", AttributeDef::number().with_default("x"))]);
        assert!(matches!(r, Err(Error::InvalidSchema { .. })));
    }

    #[test]
    fn validate_accepts_complete_config() {
        let schema = group_schema();
        let desired = attrs(json!({
            "name": "parameter-group-test-terraform",
            "family": "mysql5.6",
            "parameter": [{ "name": "character_set_server", "value": "utf8" }]
        }));
        schema.validate(&desired).unwrap();
    }

    #[test]
    fn validate_names_missing_required() {
        let schema = group_schema();
        let err = schema
            .validate(&attrs(json!({ "name": "x" })))
            .unwrap_err();
        assert!(err.mentions("family"));
        assert_eq!(err.violations.len(), 1);
        assert_eq!(err.violations[0].reason, ViolationReason::MissingRequired);
    }

    #[test]
    fn validate_reports_every_problem_with_paths() {
        let schema = group_schema();
        let err = schema
            .validate(&attrs(json!({
                "name": "x",
                "family": true,
                "color": "blue",
                "arn": "arn:aws:rds:x",
                "parameter": [{ "name": "a" }, "oops"]
            })))
            .unwrap_err();
        let reasons: Vec<(String, ViolationReason)> = err
            .violations
            .iter()
            .map(|v| (v.path.to_string(), v.reason.clone()))
            .collect();
        assert!(reasons.contains(&(
            "family".to_string(),
            ViolationReason::TypeMismatch {
                expected: "string".to_string(),
                found: "bool"
            }
        )));
        assert!(reasons.contains(&("color".to_string(), ViolationReason::UnknownAttribute)));
        assert!(reasons.contains(&("arn".to_string(), ViolationReason::ComputedOnly)));
        assert!(reasons.contains(&(
            "parameter.0.value".to_string(),
            ViolationReason::MissingRequired
        )));
        assert!(reasons.contains(&(
            "parameter.1".to_string(),
            ViolationReason::TypeMismatch {
                expected: "block".to_string(),
                found: "string"
            }
        )));
    }

    #[test]
    fn shape_check_allows_computed_and_missing() {
        let schema = group_schema();
        schema
            .check_shape(&attrs(json!({ "arn": "arn:aws:rds:x" })))
            .unwrap();
        let err = schema
            .check_shape(&attrs(json!({ "name": 3 })))
            .unwrap_err();
        assert!(matches!(err, Error::SchemaMismatch { path, .. } if path.to_string() == "name"));
    }

    #[test]
    fn defaults_fill_nested_blocks() {
        let schema = group_schema();
        let filled = schema.with_defaults(&attrs(json!({
            "name": "x",
            "family": "mysql5.6",
            "parameter": [
                { "name": "a", "value": "1" },
                { "name": "b", "value": "2", "apply_method": "pending-reboot" }
            ]
        })));
        assert_eq!(
            filled,
            attrs(json!({
                "name": "x",
                "family": "mysql5.6",
                "description": "Managed by converge",
                "parameter": [
                    { "name": "a", "value": "1", "apply_method": "immediate" },
                    { "name": "b", "value": "2", "apply_method": "pending-reboot" }
                ]
            }))
        );
    }

    #[test]
    fn schema_json_roundtrip() {
        let schema = group_schema();
        let json = serde_json::to_value(&schema).unwrap();
        assert_eq!(json["attributes"]["parameter"]["type"], "blocks");
        assert_eq!(json["attributes"]["parameter"]["nesting"], "unordered");
        let back: Schema = serde_json::from_value(json).unwrap();
        assert_eq!(back, schema);
    }

    #[test]
    fn schema_json_rejects_invalid_definition() {
        let r: std::result::Result<Schema, _> = serde_json::from_value(json!({
            "attributes": { "id": { "type": "string", "required": true, "computed": true } }
        }));
        assert!(r.is_err());
    }
}
