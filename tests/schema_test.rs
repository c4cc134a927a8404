//! Integration tests for schema merging, condition indices and projection.

use std::borrow::Cow;
use std::collections::BTreeSet;

use serde_json::{json, Value};
use schema_tree::{
    build_field_condition_map, build_one_of_key_info, compile, merge, project, required_factory,
    resolve_all_of, validation_schema, Expression, SchemaError,
};

fn sorted(value: &Value) -> Vec<String> {
    let mut out: Vec<String> = value
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.to_string())
        .collect();
    out.sort();
    out
}

fn no_expressions() -> Vec<(&'static str, &'static Expression)> {
    Vec::new()
}

// === Merge Property Tests ===

mod merge_properties {
    use super::*;

    #[test]
    fn enum_is_commutative() {
        let a = json!({ "type": "string", "enum": ["a", "b", "c", "d"] });
        let b = json!({ "type": "string", "enum": ["d", "b", "x"] });

        let ab = merge(a.clone(), &b).unwrap();
        let ba = merge(b, &a).unwrap();
        assert_eq!(sorted(&ab["enum"]), sorted(&ba["enum"]));
        assert_eq!(sorted(&ab["enum"]), vec!["\"b\"", "\"d\""]);
    }

    #[test]
    fn required_is_commutative() {
        let a = json!({ "type": "object", "required": ["x", "y"] });
        let b = json!({ "type": "object", "required": ["y", "z"] });

        let ab = merge(a.clone(), &b).unwrap();
        let ba = merge(b, &a).unwrap();
        assert_eq!(sorted(&ab["required"]), sorted(&ba["required"]));
        assert_eq!(sorted(&ab["required"]).len(), 3);
    }

    #[test]
    fn const_is_commutative() {
        let a = json!({ "type": "integer", "const": 7 });
        let b = json!({ "type": "integer", "minimum": 0 });
        assert_eq!(merge(a.clone(), &b).unwrap()["const"], json!(7));
        assert_eq!(merge(b, &a).unwrap()["const"], json!(7));

        let conflict = json!({ "type": "integer", "const": 8 });
        assert!(merge(a.clone(), &conflict).is_err());
        assert!(merge(conflict, &a).is_err());
    }

    #[test]
    fn three_way_all_of_is_associative() {
        let a = json!({ "type": "number", "minimum": 0, "enum": [1, 2, 3, 4] });
        let b = json!({ "type": "number", "maximum": 10, "enum": [2, 3, 4] });
        let c = json!({ "type": "number", "multipleOf": 2, "enum": [4, 2] });

        let left = merge(merge(a.clone(), &b).unwrap(), &c).unwrap();
        let right = merge(a.clone(), &merge(b.clone(), &c).unwrap()).unwrap();
        assert_eq!(left, right);

        let chained = resolve_all_of(&json!({ "allOf": [a, b, c] })).unwrap();
        assert_eq!(chained["minimum"], json!(0));
        assert_eq!(chained["maximum"], json!(10));
        assert_eq!(chained["multipleOf"], json!(2));
        assert_eq!(sorted(&chained["enum"]), vec!["2", "4"]);
    }

    #[test]
    fn multiple_of_without_exact_lcm() {
        let coprime = merge(
            json!({ "type": "integer", "multipleOf": 4294967311u64 }),
            &json!({ "type": "integer", "multipleOf": 4294967291u64 }),
        )
        .unwrap();
        assert_eq!(coprime["multipleOf"], json!(4294967311u64));
        assert_eq!(coprime["allOf"], json!([{ "multipleOf": 4294967291u64 }]));

        let tiny = merge(
            json!({ "type": "number", "multipleOf": 1e-10 }),
            &json!({ "type": "number", "multipleOf": 1e-10 }),
        )
        .unwrap();
        assert_eq!(tiny["multipleOf"].as_f64(), Some(1e-10));

        let mixed = merge(
            json!({ "type": "number", "multipleOf": 0.5 }),
            &json!({ "type": "number", "multipleOf": 1e-10 }),
        )
        .unwrap();
        assert_eq!(mixed["multipleOf"].as_f64(), Some(0.5));
    }

    #[test]
    fn tree_builds_with_tiny_multiple_of() {
        let schema = json!({
            "type": "object",
            "properties": {
                "ratio": {
                    "type": "number",
                    "default": 0.5,
                    "allOf": [{ "multipleOf": 1e-10 }, { "multipleOf": 1e-10 }]
                }
            }
        });
        let tree = schema_tree::SchemaTree::new(&schema, None).unwrap();
        assert_eq!(tree.value(), Some(json!({ "ratio": 0.5 })));
    }

    #[test]
    fn mismatched_types_are_rejected() {
        let result = merge(json!({ "type": "string" }), &json!({ "type": "integer" }));
        assert!(matches!(result, Err(SchemaError::IncompatibleTypes { .. })));
    }
}

// === allOf Resolution Tests ===

mod all_of_resolution {
    use super::*;

    #[test]
    fn nested_properties_merge() {
        let resolved = resolve_all_of(&json!({
            "type": "object",
            "allOf": [
                { "properties": { "a": { "type": "integer", "minimum": 0 } }, "required": ["a"] },
                { "properties": { "a": { "type": "integer", "maximum": 9 }, "b": { "type": "string" } } }
            ]
        }))
        .unwrap();

        assert_eq!(resolved["properties"]["a"]["minimum"], json!(0));
        assert_eq!(resolved["properties"]["a"]["maximum"], json!(9));
        assert_eq!(resolved["properties"]["b"]["type"], json!("string"));
        assert_eq!(resolved["required"], json!(["a"]));
        assert!(resolved.get("allOf").is_none());
    }

    #[test]
    fn conditional_members_are_kept() {
        let resolved = resolve_all_of(&json!({
            "type": "object",
            "properties": { "a": { "type": "string" }, "b": { "type": "string" } },
            "allOf": [
                { "if": { "properties": { "a": { "const": "x" } } }, "then": { "required": ["b"] } },
                { "if": { "properties": { "b": { "const": "y" } } }, "then": { "required": ["a"] } }
            ]
        }))
        .unwrap();
        assert_eq!(resolved["allOf"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn errors_carry_paths() {
        let result = resolve_all_of(&json!({
            "type": "object",
            "properties": {
                "n": { "type": "number", "allOf": [{ "minimum": 10 }, { "maximum": 5 }] }
            }
        }));
        match result {
            Err(SchemaError::InvalidRange { path, .. }) => assert_eq!(path, "/properties/n"),
            other => panic!("expected INVALID_RANGE, got {:?}", other),
        }
    }
}

// === Condition Index Tests ===

mod condition_index {
    use super::*;

    #[test]
    fn multiple_conditionals_are_indexed() {
        let schema = json!({
            "type": "object",
            "properties": {
                "a": { "type": "string" },
                "b": { "type": "string" },
                "c": { "type": "string" }
            },
            "required": ["a"],
            "allOf": [
                { "if": { "properties": { "a": { "const": "x" } } }, "then": { "required": ["b"] } },
                { "if": { "properties": { "a": { "enum": ["y", "z"] } } }, "then": { "required": ["c"] } }
            ]
        });
        let map = build_field_condition_map(schema.as_object().unwrap(), no_expressions());

        let value = json!({ "a": "z" });
        let is_required = required_factory(value.as_object().unwrap(), &map);
        assert!(is_required("a"));
        assert!(!is_required("b"));
        assert!(is_required("c"));
    }

    #[test]
    fn one_of_key_sets() {
        let schema = json!({
            "oneOf": [
                { "properties": { "p": {}, "q": {} } },
                { "required": ["r"] },
                { "properties": { "q": {}, "s": {} } }
            ]
        });
        let info = build_one_of_key_info(schema.as_object().unwrap()).unwrap();

        let union: BTreeSet<String> = ["p", "q", "s"].iter().map(|s| s.to_string()).collect();
        assert_eq!(info.one_of_key_set, union);
        assert_eq!(info.one_of_key_set_list.len(), 3);
        assert!(info.one_of_key_set_list[1].is_empty());
    }

    #[test]
    fn no_one_of_means_no_info() {
        let schema = json!({ "type": "object", "properties": { "a": {} } });
        assert!(build_one_of_key_info(schema.as_object().unwrap()).is_none());
    }
}

// === Projection Tests ===

mod projection {
    use super::*;

    fn adult_map() -> schema_tree::FieldConditionMap {
        let schema = json!({
            "type": "object",
            "properties": { "type": {}, "age": {} },
            "if": { "properties": { "type": { "const": "adult" } } },
            "then": { "required": ["age"] }
        });
        build_field_condition_map(schema.as_object().unwrap(), no_expressions())
    }

    #[test]
    fn identity_without_maps() {
        let value = json!({ "a": 1 });
        assert!(matches!(project(&value, None, None, None), Cow::Borrowed(v) if std::ptr::eq(v, &value)));
    }

    #[test]
    fn idempotent() {
        let map = adult_map();
        let value = json!({ "type": "none", "age": 3, "other": true });

        let once = project(&value, Some(&map), None, None).into_owned();
        assert_eq!(once, json!({ "type": "none", "other": true }));
        let twice = project(&once, Some(&map), None, None);
        assert!(matches!(twice, Cow::Borrowed(_)));
        assert_eq!(twice.into_owned(), once);
    }

    #[test]
    fn one_of_keys_outside_branch_are_dropped() {
        let one_of: BTreeSet<String> = ["platform", "director"].iter().map(|s| s.to_string()).collect();
        let allowed: BTreeSet<String> = ["director"].iter().map(|s| s.to_string()).collect();
        let value = json!({ "category": "movie", "platform": "pc", "director": "K" });

        let kept = project(&value, None, Some(&one_of), Some(&allowed)).into_owned();
        assert_eq!(kept, json!({ "category": "movie", "director": "K" }));

        let none_matched = project(&value, None, Some(&one_of), None).into_owned();
        assert_eq!(none_matched, json!({ "category": "movie" }));
    }
}

// === Compilation Tests ===

mod compilation {
    use super::*;

    #[test]
    fn validation_schema_strips_extensions() {
        let derived = validation_schema(&json!({
            "type": "object",
            "properties": {
                "a": { "type": "string", "&visible": "../b", "computed": { "disabled": "true" } },
                "b": { "type": "boolean" }
            },
            "oneOf": [{ "&if": "@.b", "properties": { "c": { "type": "string" } } }]
        }));

        assert!(derived["properties"]["a"].get("&visible").is_none());
        assert!(derived["properties"]["a"].get("computed").is_none());
        assert!(derived.get("oneOf").is_none());
        assert!(derived["anyOf"][0].get("&if").is_none());
    }

    #[test]
    fn invalid_expression_fails() {
        let result = compile(&json!({
            "type": "object",
            "properties": { "a": { "type": "string", "&visible": "../b ===" } }
        }));
        assert!(matches!(result, Err(SchemaError::InvalidExpression { .. })));
    }

    #[test]
    fn unknown_type_fails() {
        let result = compile(&json!({ "type": "decimal" }));
        assert!(matches!(result, Err(SchemaError::UnresolvedType { .. })));
    }
}
