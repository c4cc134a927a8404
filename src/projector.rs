//! Value projection - filters an object's keys down to the fields valid for
//! its current conditions and selected `oneOf` branch.

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Map, Value};

use crate::error::SchemaError;
use crate::expression::{Expression, PathResolver};
use crate::types::{ConditionValue, FieldCondition, FieldConditionMap};

/// Build a requirement predicate over `value`'s sibling fields.
///
/// Fields absent from `conditions` count as not required; callers only ask
/// about indexed fields.
pub fn required_factory<'a>(
    value: &'a Map<String, Value>,
    conditions: &'a FieldConditionMap,
) -> impl Fn(&str) -> bool + 'a {
    move |field| match conditions.get(field) {
        Some(FieldCondition::Always) => true,
        Some(FieldCondition::AnyOf(entries)) => entries.iter().any(|e| e.matches(value)),
        None => false,
    }
}

/// Drop keys whose condition is false, and `oneOf` keys outside `allowed`.
///
/// Returns the input borrowed when nothing is filtered, so callers can
/// compare by reference. `one_of_key_set` without `allowed` means no branch
/// matched and every `oneOf` key is dropped.
pub fn project<'a>(
    value: &'a Value,
    conditions: Option<&FieldConditionMap>,
    one_of_key_set: Option<&BTreeSet<String>>,
    allowed: Option<&BTreeSet<String>>,
) -> Cow<'a, Value> {
    let Value::Object(map) = value else {
        return Cow::Borrowed(value);
    };
    if conditions.is_none() && one_of_key_set.is_none() {
        return Cow::Borrowed(value);
    }

    let is_required = conditions.map(|c| required_factory(map, c));
    let keep = |key: &str| {
        if let (Some(conditions), Some(is_required)) = (conditions, &is_required) {
            if conditions.contains_key(key) && !is_required(key) {
                return false;
            }
        }
        match one_of_key_set {
            Some(set) if set.contains(key) => allowed.is_some_and(|a| a.contains(key)),
            _ => true,
        }
    };

    if map.keys().all(|k| keep(k.as_str())) {
        return Cow::Borrowed(value);
    }
    let filtered: Map<String, Value> = map
        .iter()
        .filter(|(k, _)| keep(k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    Cow::Owned(Value::Object(filtered))
}

/// How a `oneOf` branch decides whether it applies.
#[derive(Debug, Clone, Default)]
pub struct BranchDiscriminant {
    /// `&if` / `computed.if` expression.
    pub expression: Option<Expression>,
    /// `const`/`enum` constraints on the branch's properties.
    pub constants: BTreeMap<String, ConditionValue>,
}

impl BranchDiscriminant {
    /// Read the discriminant of one branch schema.
    ///
    /// # Errors
    ///
    /// Returns `SchemaError::InvalidExpression` when the branch's `if`
    /// expression does not parse.
    pub fn from_schema(branch: &Map<String, Value>, path: &str) -> Result<Self, SchemaError> {
        let source = branch.get("&if").or_else(|| {
            branch
                .get("computed")
                .and_then(|c| c.get("if").or_else(|| c.get("active")))
        });
        let expression = match source {
            Some(Value::String(src)) => Some(Expression::parse(src).map_err(|e| {
                SchemaError::InvalidExpression {
                    path: path.to_string(),
                    expression: src.clone(),
                    message: e.to_string(),
                }
            })?),
            Some(other) => {
                return Err(SchemaError::InvalidSchema {
                    path: path.to_string(),
                    message: format!("branch condition must be a string, got {}", other),
                })
            }
            None => None,
        };

        let constants = branch
            .get("properties")
            .and_then(Value::as_object)
            .map(|props| {
                props
                    .iter()
                    .filter_map(|(key, prop)| {
                        if let Some(c) = prop.get("const") {
                            Some((key.clone(), ConditionValue::Equals(c.clone())))
                        } else {
                            prop.get("enum")
                                .and_then(Value::as_array)
                                .map(|e| (key.clone(), ConditionValue::OneOf(e.clone())))
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            expression,
            constants,
        })
    }

    pub fn is_unconditional(&self) -> bool {
        self.expression.is_none() && self.constants.is_empty()
    }

    /// A branch with no discriminant always matches.
    pub fn matches(&self, value: &Map<String, Value>, resolver: &dyn PathResolver) -> bool {
        let constants = self
            .constants
            .iter()
            .all(|(key, expected)| expected.matches(value.get(key)));
        constants && self.expression.as_ref().map_or(true, |e| e.test(resolver))
    }
}

/// Index of the first branch matching `value`, in declaration order.
pub fn select_one_of_branch<'a>(
    branches: impl IntoIterator<Item = &'a BranchDiscriminant>,
    value: &Map<String, Value>,
    resolver: &dyn PathResolver,
) -> Option<usize> {
    branches
        .into_iter()
        .position(|b| b.matches(value, resolver))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::{build_field_condition_map, build_one_of_key_info};
    use crate::expression::NodePath;
    use serde_json::json;

    struct NoPaths;

    impl PathResolver for NoPaths {
        fn resolve(&self, _path: &NodePath) -> Option<Value> {
            None
        }
    }

    fn adult_conditions() -> FieldConditionMap {
        let schema = json!({
            "properties": { "type": {}, "age": {} },
            "if": { "properties": { "type": { "const": "adult" } } },
            "then": { "required": ["age"] }
        });
        build_field_condition_map(schema.as_object().unwrap(), std::iter::empty())
    }

    #[test]
    fn project_identity_without_maps() {
        let value = json!({ "a": 1 });
        let projected = project(&value, None, None, None);
        assert!(matches!(projected, Cow::Borrowed(v) if std::ptr::eq(v, &value)));
    }

    #[test]
    fn project_identity_when_nothing_dropped() {
        let conditions = adult_conditions();
        let value = json!({ "type": "adult", "age": 18 });
        assert!(matches!(project(&value, Some(&conditions), None, None), Cow::Borrowed(_)));
    }

    #[test]
    fn project_drops_unmet_condition() {
        let conditions = adult_conditions();
        let value = json!({ "type": "none", "age": 18 });
        let projected = project(&value, Some(&conditions), None, None);
        assert_eq!(projected.as_ref(), &json!({ "type": "none" }));
    }

    #[test]
    fn project_is_idempotent() {
        let conditions = adult_conditions();
        let value = json!({ "type": "none", "age": 18, "extra": true });
        let once = project(&value, Some(&conditions), None, None).into_owned();
        let twice = project(&once, Some(&conditions), None, None);
        assert_eq!(twice.as_ref(), &once);
        assert!(matches!(twice, Cow::Borrowed(_)));
    }

    #[test]
    fn project_one_of_keys() {
        let schema = json!({
            "oneOf": [
                { "properties": { "category": { "const": "game" }, "platform": {} } },
                { "properties": { "category": { "const": "movie" }, "director": {} } }
            ]
        });
        let info = build_one_of_key_info(schema.as_object().unwrap()).unwrap();
        let value = json!({ "category": "movie", "platform": "pc", "director": "x", "title": "t" });
        let projected = project(&value, None, Some(&info.one_of_key_set), info.allowed(Some(1)));
        assert_eq!(
            projected.as_ref(),
            &json!({ "category": "movie", "director": "x", "title": "t" })
        );

        let none = project(&value, None, Some(&info.one_of_key_set), info.allowed(None));
        assert_eq!(none.as_ref(), &json!({ "title": "t" }));
    }

    #[test]
    fn required_factory_always_and_conditional() {
        let schema = json!({
            "properties": { "type": {}, "age": {}, "name": {} },
            "required": ["name"],
            "if": { "properties": { "type": { "const": "adult" } } },
            "then": { "required": ["age"] }
        });
        let conditions = build_field_condition_map(schema.as_object().unwrap(), std::iter::empty());
        let value = json!({ "type": "none" });
        let is_required = required_factory(value.as_object().unwrap(), &conditions);
        assert!(is_required("name"));
        assert!(!is_required("age"));
    }

    #[test]
    fn branch_selection_first_match_wins() {
        let branches: Vec<BranchDiscriminant> = [
            json!({ "properties": { "category": { "const": "game" } } }),
            json!({ "properties": { "category": { "enum": ["game", "movie"] } } }),
            json!({ "title": "fallback" }),
        ]
        .iter()
        .map(|b| BranchDiscriminant::from_schema(b.as_object().unwrap(), "").unwrap())
        .collect();

        let game = json!({ "category": "game" });
        let movie = json!({ "category": "movie" });
        let other = json!({ "category": "book" });
        assert_eq!(select_one_of_branch(&branches, game.as_object().unwrap(), &NoPaths), Some(0));
        assert_eq!(select_one_of_branch(&branches, movie.as_object().unwrap(), &NoPaths), Some(1));
        assert_eq!(select_one_of_branch(&branches, other.as_object().unwrap(), &NoPaths), Some(2));
        assert!(branches[2].is_unconditional());
    }

    #[test]
    fn branch_selection_no_match() {
        let branch = json!({ "properties": { "category": { "const": "game" } } });
        let branches = vec![BranchDiscriminant::from_schema(branch.as_object().unwrap(), "").unwrap()];
        let value = json!({});
        assert_eq!(select_one_of_branch(&branches, value.as_object().unwrap(), &NoPaths), None);
    }

    #[test]
    fn branch_expression_errors() {
        let branch = json!({ "&if": "@.kind ===" });
        let err = BranchDiscriminant::from_schema(branch.as_object().unwrap(), "/oneOf/0").unwrap_err();
        assert_eq!(err.code(), "INVALID_EXPRESSION");
    }
}
