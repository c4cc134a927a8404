//! Error types for schema compilation, cascades, loading and validation.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while compiling a schema into a tree.
///
/// These mean the declared schema is self-contradictory; no tree is built.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("conflicting const values at {path}: {base} vs {other}")]
    ConflictingConstValues {
        path: String,
        base: String,
        other: String,
    },

    #[error("enum intersection at {path} is empty")]
    EmptyEnumIntersection { path: String },

    #[error("invalid range at {path}: {min_keyword} exceeds {max_keyword}")]
    InvalidRange {
        path: String,
        min_keyword: String,
        max_keyword: String,
    },

    #[error("cannot merge incompatible types at {path}: {base} and {other}")]
    IncompatibleTypes {
        path: String,
        base: String,
        other: String,
    },

    #[error("cannot determine schema type at {path}")]
    UnresolvedType { path: String },

    #[error("invalid expression at {path} (\"{expression}\"): {message}")]
    InvalidExpression {
        path: String,
        expression: String,
        message: String,
    },

    #[error("unresolvable reference \"{reference}\" at {path}")]
    InvalidReference { path: String, reference: String },

    #[error("invalid schema at {path}: {message}")]
    InvalidSchema { path: String, message: String },
}

impl SchemaError {
    /// Stable error code for this failure.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConflictingConstValues { .. } => "CONFLICTING_CONST_VALUES",
            Self::EmptyEnumIntersection { .. } => "EMPTY_ENUM_INTERSECTION",
            Self::InvalidRange { .. } => "INVALID_RANGE",
            Self::IncompatibleTypes { .. } => "INCOMPATIBLE_TYPES",
            Self::UnresolvedType { .. } => "UNRESOLVED_TYPE",
            Self::InvalidExpression { .. } => "INVALID_EXPRESSION",
            Self::InvalidReference { .. } => "INVALID_REFERENCE",
            Self::InvalidSchema { .. } => "INVALID_SCHEMA",
        }
    }
}

/// Errors raised while delivering change notifications.
#[derive(Debug, Clone, Error)]
pub enum CascadeError {
    #[error(
        "infinite loop detected at {}: {batches} batches without settling (dependencies: [{}])",
        display_path(path),
        dependencies.join(", ")
    )]
    InfiniteLoopDetected {
        path: String,
        dependencies: Vec<String>,
        batches: u32,
    },
}

impl CascadeError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InfiniteLoopDetected { .. } => "INFINITE_LOOP_DETECTED",
        }
    }
}

/// Errors while loading schemas or values.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("cannot read {path}: {source}")]
    ReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[cfg(feature = "remote")]
    #[error("failed to fetch {url}: {source}")]
    NetworkError {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("invalid JSON: {source}")]
    InvalidJson {
        #[source]
        source: serde_json::Error,
    },
}

impl LoadError {
    /// Returns the exit code for this error type.
    pub fn exit_code(&self) -> i32 {
        match self {
            LoadError::FileNotFound { .. } | LoadError::ReadError { .. } => 3,
            #[cfg(feature = "remote")]
            LoadError::NetworkError { .. } => 3,
            LoadError::InvalidJson { .. } => 2,
        }
    }
}

/// Errors from the external validator collaborator.
#[derive(Debug, Error)]
pub enum ValidatorError {
    #[error("validator rejected schema: {message}")]
    InvalidSchema { message: String },
}

/// Any error the engine can surface.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Cascade(#[from] CascadeError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Validator(#[from] ValidatorError),
}

impl Error {
    /// Returns the exit code for this error type.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Load(e) => e.exit_code(),
            Error::Schema(_) | Error::Cascade(_) | Error::Validator(_) => 2,
        }
    }
}

/// Single validation error as produced by the validator and routed to a node.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonSchemaError {
    /// Keyword that failed (e.g. "required", "minimum").
    pub keyword: String,
    /// JSON Pointer (RFC 6901) to the invalid instance.
    pub instance_path: String,
    /// JSON Pointer to the failing keyword inside the schema.
    pub schema_path: String,
    /// Human-readable error message.
    pub message: String,
    /// Keyword-specific details (e.g. `missingProperty`).
    pub params: serde_json::Value,
    /// Monotonic key for list diffing, when sequencing is enabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<u64>,
}

impl JsonSchemaError {
    /// Path of the node this error belongs to.
    ///
    /// `required` errors point at the missing child rather than the object.
    pub fn data_path(&self) -> String {
        match self
            .params
            .get("missingProperty")
            .and_then(|p| p.as_str())
        {
            Some(prop) if self.keyword == "required" => {
                format!("{}/{}", self.instance_path, escape_pointer(prop))
            }
            _ => self.instance_path.clone(),
        }
    }
}

impl std::fmt::Display for JsonSchemaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", display_path(&self.instance_path), self.message)
    }
}

/// Root pointer is empty; show it as "/".
pub(crate) fn display_path(path: &str) -> &str {
    if path.is_empty() {
        "/"
    } else {
        path
    }
}

pub(crate) fn escape_pointer(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn schema_error_codes() {
        let err = SchemaError::EmptyEnumIntersection {
            path: "/properties/kind".into(),
        };
        assert_eq!(err.code(), "EMPTY_ENUM_INTERSECTION");

        let err = SchemaError::InvalidRange {
            path: "".into(),
            min_keyword: "minimum".into(),
            max_keyword: "maximum".into(),
        };
        assert_eq!(err.code(), "INVALID_RANGE");
    }

    #[test]
    fn load_error_exit_codes() {
        let err = LoadError::FileNotFound {
            path: PathBuf::from("schema.json"),
        };
        assert_eq!(err.exit_code(), 3);
        assert_eq!(Error::from(err).exit_code(), 3);
    }

    #[test]
    fn cascade_error_display_names_path_and_dependencies() {
        let err = CascadeError::InfiniteLoopDetected {
            path: "/a".into(),
            dependencies: vec!["/b".into()],
            batches: 51,
        };
        assert_eq!(err.code(), "INFINITE_LOOP_DETECTED");
        let message = err.to_string();
        assert!(message.contains("/a"));
        assert!(message.contains("[/b]"));
    }

    #[test]
    fn required_error_points_at_missing_child() {
        let err = JsonSchemaError {
            keyword: "required".into(),
            instance_path: "/buyer".into(),
            schema_path: "/properties/buyer/required".into(),
            message: "\"email\" is a required property".into(),
            params: json!({ "missingProperty": "email" }),
            key: None,
        };
        assert_eq!(err.data_path(), "/buyer/email");
    }

    #[test]
    fn display_root_path() {
        let err = JsonSchemaError {
            keyword: "type".into(),
            instance_path: "".into(),
            schema_path: "/type".into(),
            message: "not an object".into(),
            params: json!({}),
            key: None,
        };
        assert_eq!(err.to_string(), "/: not an object");
    }
}
