//! Schema intersection - resolves `allOf` into a single normalized schema.
//!
//! Two fragments of the same JSON type are intersected keyword by keyword:
//!
//! | Keyword | Rule |
//! |---------|------|
//! | `minimum`, `exclusiveMinimum`, `minLength`, `minItems`, `minProperties` | larger value |
//! | `maximum`, `exclusiveMaximum`, `maxLength`, `maxItems`, `maxProperties` | smaller value |
//! | `multipleOf` | least common multiple, or both kept when it is not representable |
//! | `enum` | intersection, must stay non-empty |
//! | `const` | must be identical |
//! | `required` | deduplicated union |
//! | `properties`, `items`, `propertyNames` | merged recursively |
//! | `title`, `description`, `default`, ... | first definition wins |
//!
//! `allOf` members that only carry `if`/`then`/`else` are not intersected;
//! they stay in a residual `allOf` so every conditional keeps its own branch.

use serde_json::{Map, Number, Value};

use crate::error::SchemaError;
use crate::types::{json_type_name, loose_eq, SchemaType, FIRST_WIN_KEYWORDS};

/// Keys a conditional-only `allOf` member may carry.
const CONDITIONAL_KEYWORDS: &[&str] = &["if", "then", "else", "$comment"];

/// Intersect `source` into `base`, dispatching on the declared type.
///
/// # Errors
///
/// Returns `SchemaError` when the two fragments cannot be satisfied together.
pub fn merge(base: Value, source: &Value) -> Result<Value, SchemaError> {
    let base = into_map(base, "")?;
    let source = as_map(source, "")?;
    merge_at(base, source, "").map(Value::Object)
}

/// Intersect two `number`/`integer` fragments.
pub fn intersect_number_schema(base: Value, source: &Value) -> Result<Value, SchemaError> {
    let mut base = into_map(base, "")?;
    let source = as_map(source, "")?;
    merge_type_keyword(&mut base, source, "")?;
    merge_common(&mut base, source, "")?;
    merge_numeric(&mut base, source, "")?;
    merge_rest(&mut base, source, NUMERIC_KEYWORDS);
    Ok(Value::Object(base))
}

/// Intersect two `string` fragments.
pub fn intersect_string_schema(base: Value, source: &Value) -> Result<Value, SchemaError> {
    let mut base = into_map(base, "")?;
    let source = as_map(source, "")?;
    merge_type_keyword(&mut base, source, "")?;
    merge_common(&mut base, source, "")?;
    merge_string(&mut base, source, "")?;
    merge_rest(&mut base, source, STRING_KEYWORDS);
    Ok(Value::Object(base))
}

/// Intersect two `array` fragments.
pub fn intersect_array_schema(base: Value, source: &Value) -> Result<Value, SchemaError> {
    let mut base = into_map(base, "")?;
    let source = as_map(source, "")?;
    merge_type_keyword(&mut base, source, "")?;
    merge_common(&mut base, source, "")?;
    merge_array(&mut base, source, "")?;
    merge_rest(&mut base, source, ARRAY_KEYWORDS);
    Ok(Value::Object(base))
}

/// Intersect two `object` fragments.
pub fn intersect_object_schema(base: Value, source: &Value) -> Result<Value, SchemaError> {
    let mut base = into_map(base, "")?;
    let source = as_map(source, "")?;
    merge_type_keyword(&mut base, source, "")?;
    merge_common(&mut base, source, "")?;
    merge_object(&mut base, source, "")?;
    merge_rest(&mut base, source, OBJECT_KEYWORDS);
    Ok(Value::Object(base))
}

/// Recursively resolve every `allOf` in a schema.
///
/// # Errors
///
/// Returns `SchemaError` if any `allOf` is self-contradictory.
pub fn resolve_all_of(schema: &Value) -> Result<Value, SchemaError> {
    resolve_at(schema, "")
}

// --- Internal implementation ---

/// Keywords handled by `merge_common`; never copied by `merge_rest`.
const COMMON_KEYWORDS: &[&str] = &[
    "type", "const", "enum", "if", "then", "else", "allOf", "computed", "virtual",
];
const NUMERIC_KEYWORDS: &[&str] = &[
    "minimum",
    "maximum",
    "exclusiveMinimum",
    "exclusiveMaximum",
    "multipleOf",
];
const STRING_KEYWORDS: &[&str] = &["minLength", "maxLength", "pattern"];
const ARRAY_KEYWORDS: &[&str] = &["minItems", "maxItems", "uniqueItems", "items"];
const OBJECT_KEYWORDS: &[&str] = &[
    "properties",
    "patternProperties",
    "required",
    "minProperties",
    "maxProperties",
    "additionalProperties",
    "propertyNames",
];

fn merge_at(
    mut base: Map<String, Value>,
    source: &Map<String, Value>,
    path: &str,
) -> Result<Map<String, Value>, SchemaError> {
    let schema_type = merge_type_keyword(&mut base, source, path)?;
    merge_common(&mut base, source, path)?;

    match schema_type {
        Some(SchemaType::Number | SchemaType::Integer) => {
            merge_numeric(&mut base, source, path)?;
            merge_rest(&mut base, source, NUMERIC_KEYWORDS);
        }
        Some(SchemaType::String) => {
            merge_string(&mut base, source, path)?;
            merge_rest(&mut base, source, STRING_KEYWORDS);
        }
        Some(SchemaType::Array) => {
            merge_array(&mut base, source, path)?;
            merge_rest(&mut base, source, ARRAY_KEYWORDS);
        }
        Some(SchemaType::Object) => {
            merge_object(&mut base, source, path)?;
            merge_rest(&mut base, source, OBJECT_KEYWORDS);
        }
        Some(SchemaType::Boolean | SchemaType::Null) => merge_rest(&mut base, source, &[]),
        None => {
            // Untyped fragments (e.g. a bare `required` list) - infer from structure
            if base.contains_key("properties") || source.contains_key("properties") {
                merge_object(&mut base, source, path)?;
                merge_rest(&mut base, source, OBJECT_KEYWORDS);
            } else if base.contains_key("items") || source.contains_key("items") {
                merge_array(&mut base, source, path)?;
                merge_rest(&mut base, source, ARRAY_KEYWORDS);
            } else {
                merge_object(&mut base, source, path)?;
                merge_rest(&mut base, source, OBJECT_KEYWORDS);
            }
        }
    }

    Ok(base)
}

fn resolve_at(value: &Value, path: &str) -> Result<Value, SchemaError> {
    let map = match value {
        Value::Object(map) => map,
        Value::Array(arr) => {
            let mut result = Vec::with_capacity(arr.len());
            for (i, item) in arr.iter().enumerate() {
                result.push(resolve_at(item, &format!("{}/{}", path, i))?);
            }
            return Ok(Value::Array(result));
        }
        other => return Ok(other.clone()),
    };

    let mut result = Map::new();
    for (key, child) in map {
        let child_path = format!("{}/{}", path, key);
        match key.as_str() {
            "allOf" => continue,
            "properties" | "patternProperties" | "$defs" | "definitions" => {
                let resolved = match child.as_object() {
                    Some(entries) => {
                        let mut out = Map::new();
                        for (name, schema) in entries {
                            out.insert(
                                name.clone(),
                                resolve_at(schema, &format!("{}/{}", child_path, name))?,
                            );
                        }
                        Value::Object(out)
                    }
                    None => child.clone(),
                };
                result.insert(key.clone(), resolved);
            }
            "items" | "additionalProperties" | "propertyNames" | "contains" | "not" | "if"
            | "then" | "else" | "oneOf" | "anyOf" | "prefixItems" => {
                result.insert(key.clone(), resolve_at(child, &child_path)?);
            }
            _ => {
                result.insert(key.clone(), child.clone());
            }
        }
    }

    let Some(all_of) = map.get("allOf").and_then(|v| v.as_array()) else {
        return Ok(Value::Object(result));
    };

    let mut conditionals = Vec::new();
    for (i, branch) in all_of.iter().enumerate() {
        let branch_path = format!("{}/allOf/{}", path, i);
        let resolved = resolve_at(branch, &branch_path)?;
        let branch_map = as_map(&resolved, &branch_path)?;
        if is_conditional_only(branch_map) {
            conditionals.push(resolved);
        } else {
            result = merge_at(result, branch_map, path)?;
        }
    }

    if !conditionals.is_empty() {
        push_conditionals(&mut result, conditionals);
    }

    Ok(Value::Object(result))
}

fn is_conditional_only(map: &Map<String, Value>) -> bool {
    map.contains_key("if") && map.keys().all(|k| CONDITIONAL_KEYWORDS.contains(&k.as_str()))
}

fn push_conditionals(base: &mut Map<String, Value>, conditionals: Vec<Value>) {
    let residue = base
        .entry("allOf".to_string())
        .or_insert_with(|| Value::Array(Vec::new()));
    if let Value::Array(items) = residue {
        items.extend(conditionals);
    }
}

/// Merge the `type` keyword, returning the primary type to dispatch on.
fn merge_type_keyword(
    base: &mut Map<String, Value>,
    source: &Map<String, Value>,
    path: &str,
) -> Result<Option<SchemaType>, SchemaError> {
    let base_types = declared_types(base.get("type"), path)?;
    let source_types = declared_types(source.get("type"), path)?;

    let merged = match (base_types, source_types) {
        (None, None) => return Ok(None),
        (Some(types), None) | (None, Some(types)) => types,
        (Some(a), Some(b)) => {
            let mut merged = Vec::new();
            for ta in &a {
                for tb in &b {
                    let hit = match (ta, tb) {
                        _ if ta == tb => Some(*ta),
                        // integer dominates number
                        (SchemaType::Integer, SchemaType::Number)
                        | (SchemaType::Number, SchemaType::Integer) => Some(SchemaType::Integer),
                        _ => None,
                    };
                    if let Some(t) = hit {
                        if !merged.contains(&t) {
                            merged.push(t);
                        }
                    }
                }
            }
            if merged.is_empty() {
                return Err(SchemaError::IncompatibleTypes {
                    path: path.to_string(),
                    base: type_label(&a),
                    other: type_label(&b),
                });
            }
            merged
        }
    };

    let type_value = if merged.len() == 1 {
        Value::String(merged[0].as_str().to_string())
    } else {
        Value::Array(
            merged
                .iter()
                .map(|t| Value::String(t.as_str().to_string()))
                .collect(),
        )
    };
    base.insert("type".to_string(), type_value);

    Ok(merged
        .iter()
        .copied()
        .find(|t| *t != SchemaType::Null)
        .or(merged.first().copied()))
}

fn declared_types(
    value: Option<&Value>,
    path: &str,
) -> Result<Option<Vec<SchemaType>>, SchemaError> {
    let parse = |s: &str| {
        SchemaType::parse(s).ok_or_else(|| SchemaError::InvalidSchema {
            path: path.to_string(),
            message: format!("unknown type \"{}\"", s),
        })
    };
    match value {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(vec![parse(s)?])),
        Some(Value::Array(arr)) => {
            let mut types = Vec::new();
            for item in arr {
                let name = item.as_str().ok_or_else(|| SchemaError::InvalidSchema {
                    path: path.to_string(),
                    message: format!("type entries must be strings, got {}", json_type_name(item)),
                })?;
                types.push(parse(name)?);
            }
            Ok(Some(types))
        }
        Some(other) => Err(SchemaError::InvalidSchema {
            path: path.to_string(),
            message: format!("type must be string or array, got {}", json_type_name(other)),
        }),
    }
}

fn type_label(types: &[SchemaType]) -> String {
    types
        .iter()
        .map(|t| t.as_str())
        .collect::<Vec<_>>()
        .join("|")
}

/// Keywords shared by every type: metadata, `const`, `enum`, conditionals
/// and the tree's extension maps.
fn merge_common(
    base: &mut Map<String, Value>,
    source: &Map<String, Value>,
    path: &str,
) -> Result<(), SchemaError> {
    for key in FIRST_WIN_KEYWORDS {
        if let Some(value) = source.get(*key) {
            base.entry(key.to_string()).or_insert_with(|| value.clone());
        }
    }

    if let Some(source_const) = source.get("const") {
        match base.get("const") {
            Some(base_const) if !loose_eq(base_const, source_const) => {
                return Err(SchemaError::ConflictingConstValues {
                    path: path.to_string(),
                    base: base_const.to_string(),
                    other: source_const.to_string(),
                });
            }
            Some(_) => {}
            None => {
                base.insert("const".to_string(), source_const.clone());
            }
        }
    }

    if let Some(source_enum) = source.get("enum").and_then(|v| v.as_array()) {
        let merged = match base.get("enum").and_then(|v| v.as_array()) {
            Some(base_enum) => base_enum
                .iter()
                .filter(|item| source_enum.iter().any(|other| loose_eq(item, other)))
                .cloned()
                .collect::<Vec<_>>(),
            None => source_enum.clone(),
        };
        if merged.is_empty() {
            return Err(SchemaError::EmptyEnumIntersection {
                path: path.to_string(),
            });
        }
        base.insert("enum".to_string(), Value::Array(merged));
    }

    if let (Some(constant), Some(options)) = (
        base.get("const"),
        base.get("enum").and_then(|v| v.as_array()),
    ) {
        if !options.iter().any(|o| loose_eq(o, constant)) {
            return Err(SchemaError::EmptyEnumIntersection {
                path: path.to_string(),
            });
        }
    }

    if source.contains_key("if") {
        let mut conditional = Map::new();
        for key in ["if", "then", "else"] {
            if let Some(value) = source.get(key) {
                conditional.insert(key.to_string(), value.clone());
            }
        }
        if base.contains_key("if") {
            push_conditionals(base, vec![Value::Object(conditional)]);
        } else {
            base.extend(conditional);
        }
    }

    if let Some(Value::Array(residue)) = source.get("allOf") {
        push_conditionals(base, residue.clone());
    }

    for key in ["computed", "virtual"] {
        if let Some(Value::Object(entries)) = source.get(key) {
            let target = base
                .entry(key.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(target) = target {
                for (name, value) in entries {
                    target.entry(name.clone()).or_insert_with(|| value.clone());
                }
            }
        }
    }

    Ok(())
}

/// Copy every remaining source keyword the base lacks.
fn merge_rest(base: &mut Map<String, Value>, source: &Map<String, Value>, handled: &[&str]) {
    for (key, value) in source {
        if COMMON_KEYWORDS.contains(&key.as_str()) || handled.contains(&key.as_str()) {
            continue;
        }
        base.entry(key.clone()).or_insert_with(|| value.clone());
    }
}

fn merge_numeric(
    base: &mut Map<String, Value>,
    source: &Map<String, Value>,
    path: &str,
) -> Result<(), SchemaError> {
    merge_bound(base, source, "minimum", Bound::Lower);
    merge_bound(base, source, "exclusiveMinimum", Bound::Lower);
    merge_bound(base, source, "maximum", Bound::Upper);
    merge_bound(base, source, "exclusiveMaximum", Bound::Upper);

    if let Some(source_multiple) = source.get("multipleOf") {
        let invalid = || SchemaError::InvalidSchema {
            path: path.to_string(),
            message: "multipleOf must be a positive number".to_string(),
        };
        if !is_positive(source_multiple) {
            return Err(invalid());
        }
        match base.get("multipleOf") {
            None => {
                base.insert("multipleOf".to_string(), source_multiple.clone());
            }
            Some(base_multiple) if !is_positive(base_multiple) => return Err(invalid()),
            Some(base_multiple) if loose_eq(base_multiple, source_multiple) => {}
            Some(base_multiple) => match lcm_number(base_multiple, source_multiple) {
                Some(lcm) => {
                    base.insert("multipleOf".to_string(), lcm);
                }
                // No exact common multiple: both constraints stay in force.
                None => push_conditionals(base, vec![json_multiple_of(source_multiple)]),
            },
        }
    }

    check_numeric_range(base, path)
}

fn merge_string(
    base: &mut Map<String, Value>,
    source: &Map<String, Value>,
    path: &str,
) -> Result<(), SchemaError> {
    merge_bound(base, source, "minLength", Bound::Lower);
    merge_bound(base, source, "maxLength", Bound::Upper);

    if let Some(Value::String(source_pattern)) = source.get("pattern") {
        let merged = match base.get("pattern").and_then(|v| v.as_str()) {
            Some(base_pattern) if base_pattern != source_pattern => {
                format!("^(?={})(?={})", lookahead(base_pattern), lookahead(source_pattern))
            }
            Some(base_pattern) => base_pattern.to_string(),
            None => source_pattern.clone(),
        };
        base.insert("pattern".to_string(), Value::String(merged));
    }

    check_range(base, "minLength", "maxLength", path)
}

/// Turn an unanchored pattern into a lookahead body that searches anywhere.
fn lookahead(pattern: &str) -> String {
    if pattern.starts_with('^') {
        pattern.to_string()
    } else {
        format!(".*(?:{})", pattern)
    }
}

fn merge_array(
    base: &mut Map<String, Value>,
    source: &Map<String, Value>,
    path: &str,
) -> Result<(), SchemaError> {
    merge_bound(base, source, "minItems", Bound::Lower);
    merge_bound(base, source, "maxItems", Bound::Upper);

    if source.get("uniqueItems") == Some(&Value::Bool(true)) {
        base.insert("uniqueItems".to_string(), Value::Bool(true));
    }

    if let Some(source_items) = source.get("items") {
        let merged = match base.remove("items") {
            Some(Value::Object(base_items)) => match source_items.as_object() {
                Some(source_items) => {
                    Value::Object(merge_at(base_items, source_items, &format!("{}/items", path))?)
                }
                None => Value::Object(base_items),
            },
            Some(other) => other,
            None => source_items.clone(),
        };
        base.insert("items".to_string(), merged);
    }

    check_range(base, "minItems", "maxItems", path)
}

fn merge_object(
    base: &mut Map<String, Value>,
    source: &Map<String, Value>,
    path: &str,
) -> Result<(), SchemaError> {
    for key in ["properties", "patternProperties"] {
        let Some(Value::Object(source_props)) = source.get(key) else {
            continue;
        };
        let mut merged = match base.remove(key) {
            Some(Value::Object(props)) => props,
            _ => Map::new(),
        };
        for (name, source_prop) in source_props {
            let prop_path = format!("{}/{}/{}", path, key, name);
            let combined = match (merged.remove(name), source_prop) {
                (Some(Value::Object(base_prop)), Value::Object(source_prop)) => {
                    Value::Object(merge_at(base_prop, source_prop, &prop_path)?)
                }
                (Some(Value::Bool(false)), _) | (_, Value::Bool(false)) => Value::Bool(false),
                (Some(Value::Bool(true)) | None, other) => other.clone(),
                (Some(existing), _) => existing,
            };
            merged.insert(name.clone(), combined);
        }
        base.insert(key.to_string(), Value::Object(merged));
    }

    if let Some(Value::Array(source_required)) = source.get("required") {
        let mut required = match base.remove("required") {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        };
        for item in source_required {
            if !required.contains(item) {
                required.push(item.clone());
            }
        }
        base.insert("required".to_string(), Value::Array(required));
    }

    merge_bound(base, source, "minProperties", Bound::Lower);
    merge_bound(base, source, "maxProperties", Bound::Upper);

    if let Some(source_additional) = source.get("additionalProperties") {
        let merged = match (base.remove("additionalProperties"), source_additional) {
            (Some(Value::Bool(false)), _) | (_, Value::Bool(false)) => Value::Bool(false),
            (Some(Value::Object(a)), Value::Object(b)) => Value::Object(merge_at(
                a,
                b,
                &format!("{}/additionalProperties", path),
            )?),
            (Some(Value::Bool(true)) | None, other) => other.clone(),
            (Some(existing), _) => existing,
        };
        base.insert("additionalProperties".to_string(), merged);
    }

    if let Some(Value::Object(source_names)) = source.get("propertyNames") {
        let merged = match base.remove("propertyNames") {
            Some(Value::Object(base_names)) => Value::Object(merge_at(
                base_names,
                source_names,
                &format!("{}/propertyNames", path),
            )?),
            _ => Value::Object(source_names.clone()),
        };
        base.insert("propertyNames".to_string(), merged);
    }

    check_range(base, "minProperties", "maxProperties", path)
}

#[derive(Clone, Copy)]
enum Bound {
    Lower,
    Upper,
}

/// Keep the tighter of two numeric bounds, preserving the original JSON number.
fn merge_bound(base: &mut Map<String, Value>, source: &Map<String, Value>, key: &str, bound: Bound) {
    let Some(source_value) = source.get(key).filter(|v| v.is_number()) else {
        return;
    };
    let keep_source = match base.get(key).and_then(|v| v.as_f64()) {
        None => true,
        Some(current) => {
            let candidate = source_value.as_f64().unwrap_or(current);
            match bound {
                Bound::Lower => candidate > current,
                Bound::Upper => candidate < current,
            }
        }
    };
    if keep_source {
        base.insert(key.to_string(), source_value.clone());
    }
}

fn check_range(
    map: &Map<String, Value>,
    min_key: &str,
    max_key: &str,
    path: &str,
) -> Result<(), SchemaError> {
    match (
        map.get(min_key).and_then(|v| v.as_f64()),
        map.get(max_key).and_then(|v| v.as_f64()),
    ) {
        (Some(min), Some(max)) if min > max => Err(invalid_range(path, min_key, max_key)),
        _ => Ok(()),
    }
}

/// Numeric bounds must leave at least one admissible value.
fn check_numeric_range(map: &Map<String, Value>, path: &str) -> Result<(), SchemaError> {
    let number = |key: &'static str| map.get(key).and_then(|v| v.as_f64()).map(|n| (key, n));

    let lower = [number("minimum"), number("exclusiveMinimum")]
        .into_iter()
        .flatten()
        .fold(None, |acc: Option<(&str, f64)>, (key, n)| match acc {
            Some((_, best)) if best > n || (best == n && key == "minimum") => acc,
            _ => Some((key, n)),
        });
    let upper = [number("maximum"), number("exclusiveMaximum")]
        .into_iter()
        .flatten()
        .fold(None, |acc: Option<(&str, f64)>, (key, n)| match acc {
            Some((_, best)) if best < n || (best == n && key == "maximum") => acc,
            _ => Some((key, n)),
        });

    if let (Some((min_key, min)), Some((max_key, max))) = (lower, upper) {
        let exclusive = min_key.starts_with("exclusive") || max_key.starts_with("exclusive");
        if min > max || (exclusive && min >= max) {
            return Err(invalid_range(path, min_key, max_key));
        }
    }
    Ok(())
}

fn invalid_range(path: &str, min_key: &str, max_key: &str) -> SchemaError {
    SchemaError::InvalidRange {
        path: path.to_string(),
        min_keyword: min_key.to_string(),
        max_keyword: max_key.to_string(),
    }
}

/// Least common multiple of two positive JSON numbers.
///
/// Integral inputs yield an integral JSON number; decimals are scaled to
/// integers first so `0.2` and `0.3` give `0.6`. `None` when the result
/// is not exactly representable.
fn lcm_number(a: &Value, b: &Value) -> Option<Value> {
    if let (Some(x), Some(y)) = (a.as_u64(), b.as_u64()) {
        if x == 0 || y == 0 {
            return None;
        }
        let (x, y) = (u128::from(x), u128::from(y));
        let lcm = (x / gcd(x, y)).checked_mul(y)?;
        return u64::try_from(lcm).ok().map(Value::from);
    }

    let (x, y) = (a.as_f64()?, b.as_f64()?);
    if x <= 0.0 || y <= 0.0 {
        return None;
    }
    let scale = 10u128.checked_pow(decimals(x)?.max(decimals(y)?))?;
    let (sx, sy) = (scaled(x, scale)?, scaled(y, scale)?);
    let lcm = (sx / gcd(sx, sy)).checked_mul(sy)?;
    if lcm % scale == 0 {
        let whole = u64::try_from(lcm / scale).ok()?;
        Some(Value::from(whole))
    } else {
        Number::from_f64(lcm as f64 / scale as f64).map(Value::Number)
    }
}

fn is_positive(value: &Value) -> bool {
    value.as_f64().is_some_and(|n| n > 0.0)
}

fn json_multiple_of(value: &Value) -> Value {
    let mut member = Map::new();
    member.insert("multipleOf".to_string(), value.clone());
    Value::Object(member)
}

/// Number of decimal places needed to make `n` integral, up to 12.
fn decimals(n: f64) -> Option<u32> {
    (0..=12u32).find(|k| {
        let scaled = n * 10f64.powi(*k as i32);
        let rounded = scaled.round();
        rounded != 0.0 && (scaled - rounded).abs() <= 1e-9 * rounded.abs()
    })
}

fn scaled(n: f64, scale: u128) -> Option<u128> {
    let value = (n * scale as f64).round();
    (value >= 1.0 && value < u128::MAX as f64).then(|| value as u128)
}

fn gcd(mut a: u128, mut b: u128) -> u128 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

fn into_map(value: Value, path: &str) -> Result<Map<String, Value>, SchemaError> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(SchemaError::InvalidSchema {
            path: path.to_string(),
            message: format!("expected schema object, got {}", json_type_name(&other)),
        }),
    }
}

fn as_map<'a>(value: &'a Value, path: &str) -> Result<&'a Map<String, Value>, SchemaError> {
    value.as_object().ok_or_else(|| SchemaError::InvalidSchema {
        path: path.to_string(),
        message: format!("expected schema object, got {}", json_type_name(value)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // === Numeric ===

    #[test]
    fn number_range_narrows() {
        let merged =
            intersect_number_schema(json!({"minimum": 0, "maximum": 100}), &json!({"minimum": 10, "maximum": 50}))
                .unwrap();
        assert_eq!(merged, json!({"minimum": 10, "maximum": 50}));
    }

    #[test]
    fn number_multiple_of_lcm() {
        let merged =
            intersect_number_schema(json!({"multipleOf": 2}), &json!({"multipleOf": 3})).unwrap();
        assert_eq!(merged, json!({"multipleOf": 6}));
    }

    #[test]
    fn number_multiple_of_decimal_lcm() {
        let merged =
            intersect_number_schema(json!({"multipleOf": 0.2}), &json!({"multipleOf": 0.3})).unwrap();
        assert_eq!(merged["multipleOf"].as_f64(), Some(0.6));
    }

    #[test]
    fn number_multiple_of_overflow_keeps_both() {
        let merged = intersect_number_schema(
            json!({"multipleOf": 4294967311u64}),
            &json!({"multipleOf": 4294967291u64}),
        )
        .unwrap();
        assert_eq!(merged["multipleOf"], json!(4294967311u64));
        assert_eq!(merged["allOf"], json!([{"multipleOf": 4294967291u64}]));
    }

    #[test]
    fn number_multiple_of_tiny_decimals() {
        let same =
            intersect_number_schema(json!({"multipleOf": 1e-10}), &json!({"multipleOf": 1e-10})).unwrap();
        assert_eq!(same, json!({"multipleOf": 1e-10}));

        let mixed =
            intersect_number_schema(json!({"multipleOf": 0.5}), &json!({"multipleOf": 1e-10})).unwrap();
        assert_eq!(mixed["multipleOf"].as_f64(), Some(0.5));

        let beyond =
            intersect_number_schema(json!({"multipleOf": 0.5}), &json!({"multipleOf": 1e-15})).unwrap();
        assert_eq!(beyond["multipleOf"].as_f64(), Some(0.5));
        assert_eq!(beyond["allOf"], json!([{"multipleOf": 1e-15}]));
    }

    #[test]
    fn number_multiple_of_must_be_positive() {
        let result =
            intersect_number_schema(json!({"multipleOf": 2}), &json!({"multipleOf": 0}));
        assert!(matches!(result, Err(SchemaError::InvalidSchema { .. })));
    }

    #[test]
    fn resolve_all_of_multiple_of_residue_is_stable() {
        let schema = json!({
            "type": "number",
            "allOf": [{ "multipleOf": 4294967311u64 }, { "multipleOf": 4294967291u64 }]
        });
        let once = resolve_all_of(&schema).unwrap();
        assert_eq!(once["allOf"], json!([{"multipleOf": 4294967291u64}]));
        assert_eq!(resolve_all_of(&once).unwrap(), once);
    }

    #[test]
    fn number_conflicting_const() {
        let result = intersect_number_schema(json!({"const": 42}), &json!({"const": 84}));
        assert!(matches!(
            result,
            Err(SchemaError::ConflictingConstValues { .. })
        ));
    }

    #[test]
    fn number_equal_const_across_representations() {
        let merged = intersect_number_schema(json!({"const": 1}), &json!({"const": 1.0})).unwrap();
        assert_eq!(merged["const"], json!(1));
    }

    #[test]
    fn number_invalid_range() {
        let result = intersect_number_schema(json!({"minimum": 60}), &json!({"maximum": 50}));
        assert!(matches!(
            result,
            Err(SchemaError::InvalidRange { min_keyword, .. }) if min_keyword == "minimum"
        ));
    }

    #[test]
    fn number_exclusive_bounds_degenerate() {
        let result =
            intersect_number_schema(json!({"exclusiveMinimum": 5}), &json!({"maximum": 5}));
        assert!(matches!(result, Err(SchemaError::InvalidRange { .. })));

        let ok = intersect_number_schema(json!({"minimum": 5}), &json!({"maximum": 5}));
        assert!(ok.is_ok());
    }

    #[test]
    fn integer_dominates_number() {
        let merged =
            intersect_number_schema(json!({"type": "number"}), &json!({"type": "integer"})).unwrap();
        assert_eq!(merged["type"], json!("integer"));
    }

    // === Enum / const / metadata ===

    #[test]
    fn enum_intersection() {
        let merged = intersect_string_schema(
            json!({"type": "string", "enum": ["a", "b", "c"]}),
            &json!({"enum": ["c", "b", "z"]}),
        )
        .unwrap();
        assert_eq!(merged["enum"], json!(["b", "c"]));
    }

    #[test]
    fn empty_enum_intersection() {
        let result =
            intersect_string_schema(json!({"enum": ["a"]}), &json!({"enum": ["b"]}));
        assert!(matches!(
            result,
            Err(SchemaError::EmptyEnumIntersection { .. })
        ));
    }

    #[test]
    fn const_outside_enum_is_empty() {
        let result = intersect_string_schema(json!({"enum": ["a", "b"]}), &json!({"const": "c"}));
        assert!(matches!(
            result,
            Err(SchemaError::EmptyEnumIntersection { .. })
        ));
    }

    #[test]
    fn first_win_metadata() {
        let merged = intersect_string_schema(
            json!({"type": "string", "title": "Base"}),
            &json!({"type": "string", "title": "Source", "description": "from source"}),
        )
        .unwrap();
        assert_eq!(merged["title"], json!("Base"));
        assert_eq!(merged["description"], json!("from source"));
    }

    #[test]
    fn string_length_range() {
        let merged = intersect_string_schema(json!({"minLength": 1}), &json!({"maxLength": 8, "minLength": 3}))
            .unwrap();
        assert_eq!(merged["minLength"], json!(3));
        assert_eq!(merged["maxLength"], json!(8));

        let result = intersect_string_schema(json!({"minLength": 9}), &json!({"maxLength": 8}));
        assert!(matches!(result, Err(SchemaError::InvalidRange { .. })));
    }

    #[test]
    fn string_patterns_combine() {
        let merged =
            intersect_string_schema(json!({"pattern": "^a"}), &json!({"pattern": "z$"})).unwrap();
        assert_eq!(merged["pattern"], json!("^(?=^a)(?=.*(?:z$))"));
    }

    #[test]
    fn incompatible_types() {
        let result = merge(json!({"type": "string"}), &json!({"type": "number"}));
        assert!(matches!(
            result,
            Err(SchemaError::IncompatibleTypes { .. })
        ));
    }

    // === Object / array ===

    #[test]
    fn boolean_property_schemas() {
        let merged = intersect_object_schema(
            json!({ "properties": { "a": { "type": "string" }, "b": true } }),
            &json!({ "properties": { "a": false, "b": { "type": "integer" } } }),
        )
        .unwrap();
        assert_eq!(merged["properties"]["a"], json!(false));
        assert_eq!(merged["properties"]["b"], json!({ "type": "integer" }));
    }

    #[test]
    fn object_required_union_and_properties() {
        let merged = intersect_object_schema(
            json!({
                "type": "object",
                "properties": { "a": { "type": "number", "maximum": 10 } },
                "required": ["a"]
            }),
            &json!({
                "properties": {
                    "a": { "type": "integer", "minimum": 1 },
                    "b": { "type": "string" }
                },
                "required": ["b", "a"]
            }),
        )
        .unwrap();
        assert_eq!(merged["required"], json!(["a", "b"]));
        assert_eq!(
            merged["properties"]["a"],
            json!({ "type": "integer", "maximum": 10, "minimum": 1 })
        );
        assert_eq!(merged["properties"]["b"], json!({ "type": "string" }));
    }

    #[test]
    fn object_property_count_range() {
        let result = intersect_object_schema(
            json!({"type": "object", "minProperties": 3}),
            &json!({"maxProperties": 2}),
        );
        assert!(matches!(result, Err(SchemaError::InvalidRange { .. })));
    }

    #[test]
    fn object_additional_properties_false_wins() {
        let merged = intersect_object_schema(
            json!({"type": "object", "additionalProperties": true}),
            &json!({"additionalProperties": false}),
        )
        .unwrap();
        assert_eq!(merged["additionalProperties"], json!(false));
    }

    #[test]
    fn array_items_merge() {
        let merged = intersect_array_schema(
            json!({"type": "array", "items": {"type": "string"}, "maxItems": 5}),
            &json!({"items": {"minLength": 2}, "maxItems": 3, "uniqueItems": true}),
        )
        .unwrap();
        assert_eq!(merged["items"], json!({"type": "string", "minLength": 2}));
        assert_eq!(merged["maxItems"], json!(3));
        assert_eq!(merged["uniqueItems"], json!(true));
    }

    // === allOf resolution ===

    #[test]
    fn resolve_all_of_flattens() {
        let schema = json!({
            "type": "object",
            "allOf": [
                { "properties": { "n": { "type": "number", "minimum": 0 } } },
                { "properties": { "n": { "maximum": 9 } }, "required": ["n"] }
            ]
        });
        let resolved = resolve_all_of(&schema).unwrap();
        assert!(resolved.get("allOf").is_none());
        assert_eq!(
            resolved["properties"]["n"],
            json!({ "type": "number", "minimum": 0, "maximum": 9 })
        );
        assert_eq!(resolved["required"], json!(["n"]));
    }

    #[test]
    fn resolve_all_of_keeps_conditionals() {
        let schema = json!({
            "type": "object",
            "properties": { "kind": { "type": "string" } },
            "allOf": [
                { "if": { "properties": { "kind": { "const": "a" } } }, "then": { "required": ["x"] } },
                { "if": { "properties": { "kind": { "const": "b" } } }, "then": { "required": ["y"] } }
            ]
        });
        let resolved = resolve_all_of(&schema).unwrap();
        assert_eq!(resolved["allOf"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn resolve_all_of_nested_in_properties() {
        let schema = json!({
            "type": "object",
            "properties": {
                "age": { "allOf": [{ "type": "integer" }, { "minimum": 18 }] }
            }
        });
        let resolved = resolve_all_of(&schema).unwrap();
        assert_eq!(
            resolved["properties"]["age"],
            json!({ "type": "integer", "minimum": 18 })
        );
    }

    #[test]
    fn resolve_all_of_propagates_errors() {
        let schema = json!({
            "allOf": [{ "type": "integer", "const": 1 }, { "const": 2 }]
        });
        assert!(matches!(
            resolve_all_of(&schema),
            Err(SchemaError::ConflictingConstValues { .. })
        ));
    }
}
