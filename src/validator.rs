//! Validation collaborator and error post-processing.
//!
//! The tree never produces validation errors itself. A [`Validator`] turns
//! the projected value plus the derived validation schema into a raw error
//! list; [`transform_errors`] filters it and optionally stamps sequence keys
//! before the tree routes each error to its node.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};

use jsonschema::error::ValidationErrorKind;
use serde_json::{json, Value};

use crate::error::{JsonSchemaError, ValidatorError};

/// Produces raw validation errors for a value.
pub trait Validator {
    /// # Errors
    ///
    /// Returns `ValidatorError` when the schema itself is unusable.
    fn validate(&self, value: &Value, schema: &Value) -> Result<Vec<JsonSchemaError>, ValidatorError>;
}

/// Default collaborator backed by the `jsonschema` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSchemaValidator;

impl Validator for JsonSchemaValidator {
    fn validate(&self, value: &Value, schema: &Value) -> Result<Vec<JsonSchemaError>, ValidatorError> {
        let validator = jsonschema::validator_for(schema).map_err(|e| ValidatorError::InvalidSchema {
            message: e.to_string(),
        })?;

        let errors = validator
            .iter_errors(value)
            .map(|e| {
                let schema_path = e.schema_path.to_string();
                let keyword = schema_path
                    .rsplit('/')
                    .next()
                    .unwrap_or_default()
                    .to_string();
                let params = match &e.kind {
                    ValidationErrorKind::Required { property } => {
                        json!({ "missingProperty": property })
                    }
                    _ => json!({}),
                };
                JsonSchemaError {
                    keyword,
                    instance_path: e.instance_path.to_string(),
                    schema_path,
                    message: e.to_string(),
                    params,
                    key: None,
                }
            })
            .collect();
        Ok(errors)
    }
}

/// Monotonic key source for error list diffing.
///
/// Keys start at 1 and are never reused by the same sequence.
#[derive(Debug, Default)]
pub struct ErrorSequence {
    last: AtomicU64,
}

impl ErrorSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_key(&self) -> u64 {
        self.last.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Drop errors whose keyword is in `omit`, then stamp keys from `sequence`.
pub fn transform_errors(
    errors: Vec<JsonSchemaError>,
    omit: &BTreeSet<String>,
    sequence: Option<&ErrorSequence>,
) -> Vec<JsonSchemaError> {
    errors
        .into_iter()
        .filter(|e| !omit.contains(&e.keyword))
        .map(|mut e| {
            if let Some(sequence) = sequence {
                e.key = Some(sequence.next_key());
            }
            e
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validate(schema: Value, value: Value) -> Vec<JsonSchemaError> {
        JsonSchemaValidator.validate(&value, &schema).unwrap()
    }

    #[test]
    fn valid_value_has_no_errors() {
        let errors = validate(
            json!({ "type": "object", "properties": { "name": { "type": "string" } } }),
            json!({ "name": "test" }),
        );
        assert!(errors.is_empty());
    }

    #[test]
    fn required_error_carries_missing_property() {
        let errors = validate(
            json!({ "type": "object", "required": ["name"] }),
            json!({}),
        );
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].keyword, "required");
        assert_eq!(errors[0].instance_path, "");
        assert_eq!(errors[0].params, json!({ "missingProperty": "name" }));
        assert_eq!(errors[0].data_path(), "/name");
    }

    #[test]
    fn nested_error_paths() {
        let errors = validate(
            json!({
                "type": "object",
                "properties": { "age": { "type": "integer", "minimum": 18 } }
            }),
            json!({ "age": 3 }),
        );
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].keyword, "minimum");
        assert_eq!(errors[0].instance_path, "/age");
        assert_eq!(errors[0].schema_path, "/properties/age/minimum");
    }

    #[test]
    fn invalid_schema_is_an_error() {
        let result = JsonSchemaValidator.validate(&json!("x"), &json!({ "pattern": "(" }));
        assert!(matches!(result, Err(ValidatorError::InvalidSchema { .. })));
    }

    #[test]
    fn transform_filters_and_sequences() {
        let errors = validate(
            json!({
                "type": "object",
                "required": ["a"],
                "properties": { "b": { "type": "string", "minLength": 3 } }
            }),
            json!({ "b": "x" }),
        );
        assert_eq!(errors.len(), 2);

        let sequence = ErrorSequence::new();
        let omit = BTreeSet::from(["minLength".to_string()]);
        let out = transform_errors(errors.clone(), &omit, Some(&sequence));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].keyword, "required");
        assert_eq!(out[0].key, Some(1));

        let again = transform_errors(errors, &BTreeSet::new(), Some(&sequence));
        assert_eq!(again.iter().map(|e| e.key).collect::<Vec<_>>(), vec![Some(2), Some(3)]);
    }

    #[test]
    fn independent_sequences() {
        let a = ErrorSequence::new();
        let b = ErrorSequence::new();
        assert_eq!(a.next_key(), 1);
        assert_eq!(a.next_key(), 2);
        assert_eq!(b.next_key(), 1);
    }
}
