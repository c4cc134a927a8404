//! Core types shared by schema compilation, condition indexing and projection.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Extension keywords understood by the tree but unknown to JSON Schema validators.
pub const EXTENSION_KEYWORDS: &[&str] = &[
    "computed",
    "virtual",
    "&if",
    "&active",
    "&visible",
    "&readOnly",
    "&disabled",
    "&derived",
];

/// Metadata keywords where the first schema to define them wins during a merge.
pub const FIRST_WIN_KEYWORDS: &[&str] = &[
    "title",
    "description",
    "default",
    "examples",
    "format",
    "$comment",
    "readOnly",
    "writeOnly",
    "deprecated",
    "contentMediaType",
    "contentEncoding",
];

/// Returns the JSON type name for error messages.
pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Declared JSON type of a schema fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaType {
    Object,
    Array,
    String,
    Number,
    Integer,
    Boolean,
    Null,
}

impl SchemaType {
    /// Parse a JSON Schema `type` keyword value.
    ///
    /// Returns `None` for unknown type names (caller should error).
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "object" => Some(SchemaType::Object),
            "array" => Some(SchemaType::Array),
            "string" => Some(SchemaType::String),
            "number" => Some(SchemaType::Number),
            "integer" => Some(SchemaType::Integer),
            "boolean" => Some(SchemaType::Boolean),
            "null" => Some(SchemaType::Null),
            _ => None,
        }
    }

    /// Type name as written in a schema.
    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaType::Object => "object",
            SchemaType::Array => "array",
            SchemaType::String => "string",
            SchemaType::Number => "number",
            SchemaType::Integer => "integer",
            SchemaType::Boolean => "boolean",
            SchemaType::Null => "null",
        }
    }

    /// Type a literal value would satisfy. Integral numbers map to `Integer`.
    pub fn of_value(value: &Value) -> Self {
        match value {
            Value::Null => SchemaType::Null,
            Value::Bool(_) => SchemaType::Boolean,
            Value::Number(n) if n.is_i64() || n.is_u64() => SchemaType::Integer,
            Value::Number(_) => SchemaType::Number,
            Value::String(_) => SchemaType::String,
            Value::Array(_) => SchemaType::Array,
            Value::Object(_) => SchemaType::Object,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, SchemaType::Number | SchemaType::Integer)
    }
}

impl fmt::Display for SchemaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Right-hand side of one key in a [`ConditionEntry`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ConditionValue {
    /// Sibling must equal the literal.
    Equals(Value),
    /// Sibling must equal one of the literals.
    OneOf(Vec<Value>),
}

impl ConditionValue {
    pub fn matches(&self, actual: Option<&Value>) -> bool {
        let actual = actual.unwrap_or(&Value::Null);
        match self {
            ConditionValue::Equals(expected) => loose_eq(expected, actual),
            ConditionValue::OneOf(options) => options.iter().any(|o| loose_eq(o, actual)),
        }
    }
}

/// A single disjunct of a field requirement: all pairs must match,
/// then `inverse` negates the result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConditionEntry {
    pub condition: BTreeMap<String, ConditionValue>,
    pub inverse: bool,
}

impl ConditionEntry {
    pub fn new(condition: BTreeMap<String, ConditionValue>, inverse: bool) -> Self {
        Self { condition, inverse }
    }

    /// Evaluate against an object's sibling fields.
    pub fn matches(&self, siblings: &serde_json::Map<String, Value>) -> bool {
        let matched = if self.condition.len() == 1 {
            let Some((key, expected)) = self.condition.iter().next() else {
                return !self.inverse;
            };
            expected.matches(siblings.get(key))
        } else {
            self.condition
                .iter()
                .all(|(key, expected)| expected.matches(siblings.get(key)))
        };
        matched != self.inverse
    }
}

/// Full requirement for one field.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldCondition {
    /// Unconditionally required.
    Always,
    /// Required when any entry matches.
    AnyOf(Vec<ConditionEntry>),
}

pub type FieldConditionMap = BTreeMap<String, FieldCondition>;

/// Field sets declared by the `oneOf` branches of an object schema.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OneOfKeyInfo {
    /// Union of every branch's keys.
    pub one_of_key_set: BTreeSet<String>,
    /// Keys per branch, indexed by branch position.
    pub one_of_key_set_list: Vec<BTreeSet<String>>,
}

impl OneOfKeyInfo {
    /// Keys allowed for the given branch; `None` allows no `oneOf` key.
    pub fn allowed(&self, branch: Option<usize>) -> Option<&BTreeSet<String>> {
        branch.and_then(|i| self.one_of_key_set_list.get(i))
    }
}

/// Equality used by conditions and expressions: numbers compare by value,
/// everything else structurally.
pub fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}
