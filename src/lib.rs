//! Schema Tree
//!
//! Schema-driven reactive node trees.
//!
//! This library builds a live tree of typed nodes from a JSON Schema extended with
//! `oneOf` branch discriminants, `if`/`then`/`else` requirements, `virtual` field
//! groups and `computed` expressions. Each node keeps its value in sync with the
//! branch and conditions currently in force, and change notifications are batched
//! per node with protection against runaway cascades.
//!
//! # Example
//!
//! ```
//! use schema_tree::SchemaTree;
//! use serde_json::json;
//!
//! let schema = json!({
//!     "type": "object",
//!     "properties": {
//!         "category": { "enum": ["game", "movie"], "default": "game" }
//!     },
//!     "oneOf": [
//!         { "&if": "@.category === 'game'", "properties": { "platform": { "type": "string", "default": "pc" } } },
//!         { "&if": "@.category === 'movie'", "properties": { "director": { "type": "string", "default": "?" } } }
//!     ]
//! });
//!
//! let tree = SchemaTree::new(&schema, None).unwrap();
//! assert_eq!(tree.value(), Some(json!({ "category": "game", "platform": "pc" })));
//!
//! // Switching the discriminant swaps the branch fields in the same call.
//! tree.find("/category").unwrap().set_value(json!("movie")).unwrap();
//! assert_eq!(tree.value(), Some(json!({ "category": "movie", "director": "?" })));
//! ```
//!
//! # Schema Extensions
//!
//! | Keyword | Effect |
//! |---------|--------|
//! | `oneOf[].&if` / `oneOf[].computed.if` | Branch discriminant expression |
//! | `if` / `then` / `else` | Conditional requirement; unmet fields are dropped |
//! | `virtual: { name: { fields } }` | Named group over sibling fields |
//! | `computed: { active, visible, readOnly, disabled, derived }` | Expressions over other nodes |
//! | `&active`, `&visible`, `&readOnly`, `&disabled`, `&derived` | Shorthand for `computed` |
//!
//! Expressions read other nodes through relative paths:
//! ```text
//! @.field        the owning node's child
//! ../field       a sibling
//! $.a.b / #/a/b  from the root
//! ```
//!
//! # Scheduling
//!
//! Mutations apply synchronously. Listener delivery and computed expressions run
//! as microtasks on the tree's [`Scheduler`]; with the default [`TaskQueue`], call
//! [`SchemaTree::run_until_idle`] to drain it.

mod condition;
mod error;
mod event;
mod expression;
mod loader;
mod merge;
mod node;
mod projector;
mod scheduler;
mod schema;
mod tree;
mod types;
mod validator;

pub use condition::{build_field_condition_map, build_one_of_key_info, expand_virtual, virtual_fields};
pub use error::{CascadeError, Error, JsonSchemaError, LoadError, SchemaError, ValidatorError};
pub use event::{
    EventOptions, EventPayload, NodeEvent, NodeEventType, NodeEvents, Subscription,
    DEFAULT_LOOP_THRESHOLD,
};
pub use expression::{truthy, Expression, NodePath, ParseError, PathResolver, PathSegment};
pub use loader::{is_url, load_schema, load_schema_auto, load_schema_str};
pub use merge::{
    intersect_array_schema, intersect_number_schema, intersect_object_schema,
    intersect_string_schema, merge, resolve_all_of,
};
pub use node::{NodeId, NodeVariant};
pub use projector::{project, required_factory, select_one_of_branch, BranchDiscriminant};
pub use scheduler::{Scheduler, Task, TaskQueue};
pub use schema::{
    compile, validation_schema, ArrayShape, CompiledRoot, CompiledSchema, ComputedKind,
    ObjectShape, OneOfBranch, Shape, VirtualField,
};
pub use tree::{NodeRef, SchemaTree, SetMode, SetValueOptions, TreeOptions};
pub use types::{
    ConditionEntry, ConditionValue, FieldCondition, FieldConditionMap, OneOfKeyInfo, SchemaType,
};
pub use validator::{transform_errors, ErrorSequence, JsonSchemaValidator, Validator};

#[cfg(feature = "remote")]
pub use loader::load_schema_url;
