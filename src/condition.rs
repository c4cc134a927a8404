//! Condition indices derived once per object schema.
//!
//! [`build_field_condition_map`] answers "under which sibling values is this
//! field required/active", and [`build_one_of_key_info`] records which keys
//! each `oneOf` branch declares. Both read an already resolved fragment
//! (`allOf` merged, refs inlined).

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Map, Value};

use crate::expression::Expression;
use crate::types::{
    ConditionEntry, ConditionValue, FieldCondition, FieldConditionMap, OneOfKeyInfo,
};

/// Build the field requirement map for an object schema.
///
/// Sources, in order:
/// - `if`/`then`/`else` at the top level and inside the residual `allOf`:
///   fields in `then.required` get the `if` condition, fields in
///   `else.required` get it inverted. Properties only declared inside a
///   branch count as required by that branch.
/// - `active` expressions attached to properties that reduce to a static
///   sibling condition (see [`Expression::as_sibling_condition`]).
/// - the schema's own `required`: those fields map to [`FieldCondition::Always`].
///
/// Virtual names listed in any `required` expand to their underlying fields.
pub fn build_field_condition_map<'a>(
    schema: &Map<String, Value>,
    active: impl IntoIterator<Item = (&'a str, &'a Expression)>,
) -> FieldConditionMap {
    let virtuals = virtual_fields(schema);
    let declared: BTreeSet<&str> = schema
        .get("properties")
        .and_then(Value::as_object)
        .map(|props| props.keys().map(String::as_str).collect())
        .unwrap_or_default();

    let mut map = FieldConditionMap::new();

    for conditional in conditionals(schema) {
        let Some(condition) = conditional.get("if").and_then(if_condition) else {
            tracing::debug!("skipping conditional without a static `if` discriminant");
            continue;
        };
        for (branch, inverse) in [("then", false), ("else", true)] {
            let Some(branch) = conditional.get(branch).and_then(Value::as_object) else {
                continue;
            };
            for field in branch_fields(branch, &declared, &virtuals) {
                add_entry(&mut map, field, ConditionEntry::new(condition.clone(), inverse));
            }
        }
    }

    for (field, expression) in active {
        if let Some(entry) = expression.as_sibling_condition() {
            add_entry(&mut map, field.to_string(), entry);
        }
    }

    for field in expand_virtual(string_list(schema.get("required")), &virtuals) {
        map.insert(field, FieldCondition::Always);
    }

    map
}

/// Record each `oneOf` branch's property keys, or `None` without `oneOf`.
///
/// Branches lacking `properties` contribute an empty set at their index.
pub fn build_one_of_key_info(schema: &Map<String, Value>) -> Option<OneOfKeyInfo> {
    let branches = schema.get("oneOf")?.as_array()?;
    let mut info = OneOfKeyInfo::default();
    for branch in branches {
        let keys: BTreeSet<String> = branch
            .get("properties")
            .and_then(Value::as_object)
            .map(|props| props.keys().cloned().collect())
            .unwrap_or_default();
        info.one_of_key_set.extend(keys.iter().cloned());
        info.one_of_key_set_list.push(keys);
    }
    Some(info)
}

/// Virtual field declarations: `virtual: { name: { fields: [..] } }`.
pub fn virtual_fields(schema: &Map<String, Value>) -> BTreeMap<String, Vec<String>> {
    schema
        .get("virtual")
        .and_then(Value::as_object)
        .map(|virtuals| {
            virtuals
                .iter()
                .map(|(name, decl)| (name.clone(), string_list(decl.get("fields"))))
                .collect()
        })
        .unwrap_or_default()
}

/// Replace virtual names with their underlying fields, keeping order and
/// dropping duplicates.
pub fn expand_virtual(
    fields: Vec<String>,
    virtuals: &BTreeMap<String, Vec<String>>,
) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(fields.len());
    for field in fields {
        let expanded = match virtuals.get(&field) {
            Some(inner) => inner.clone(),
            None => vec![field],
        };
        for f in expanded {
            if !out.contains(&f) {
                out.push(f);
            }
        }
    }
    out
}

/// The top-level conditional and every conditional left in `allOf`.
fn conditionals(schema: &Map<String, Value>) -> Vec<&Map<String, Value>> {
    let mut out = Vec::new();
    if schema.contains_key("if") {
        out.push(schema);
    }
    if let Some(members) = schema.get("allOf").and_then(Value::as_array) {
        out.extend(
            members
                .iter()
                .filter_map(Value::as_object)
                .filter(|m| m.contains_key("if")),
        );
    }
    out
}

/// `if.properties.X.const` / `.enum` pairs. Any property without a literal
/// discriminant makes the whole condition non-static.
fn if_condition(if_schema: &Value) -> Option<BTreeMap<String, ConditionValue>> {
    let props = if_schema.get("properties")?.as_object()?;
    if props.is_empty() {
        return None;
    }
    props
        .iter()
        .map(|(key, prop)| {
            let value = if let Some(c) = prop.get("const") {
                ConditionValue::Equals(c.clone())
            } else {
                ConditionValue::OneOf(prop.get("enum")?.as_array()?.clone())
            };
            Some((key.clone(), value))
        })
        .collect()
}

fn branch_fields(
    branch: &Map<String, Value>,
    declared: &BTreeSet<&str>,
    virtuals: &BTreeMap<String, Vec<String>>,
) -> Vec<String> {
    let mut fields = string_list(branch.get("required"));
    if let Some(props) = branch.get("properties").and_then(Value::as_object) {
        fields.extend(
            props
                .keys()
                .filter(|k| !declared.contains(k.as_str()))
                .cloned(),
        );
    }
    expand_virtual(fields, virtuals)
}

fn add_entry(map: &mut FieldConditionMap, field: String, entry: ConditionEntry) {
    match map.entry(field).or_insert_with(|| FieldCondition::AnyOf(Vec::new())) {
        FieldCondition::Always => {}
        FieldCondition::AnyOf(entries) => {
            if !entries.contains(&entry) {
                entries.push(entry);
            }
        }
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
