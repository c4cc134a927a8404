//! Schema compilation - turns a raw schema into shared, immutable fragments
//! the tree builds nodes from.
//!
//! Compilation runs once per tree:
//!
//! 1. internal `$ref`s (`#/$defs/...`, `#/definitions/...`, any `#/...`
//!    pointer) are inlined; recursive refs are left in place
//! 2. `allOf` is resolved by [`crate::merge::resolve_all_of`]
//! 3. every fragment is compiled into a [`CompiledSchema`] with its
//!    expressions parsed and its condition indices built
//! 4. a validation schema is derived for the external validator

use std::collections::{BTreeMap, HashSet};
use std::rc::Rc;

use serde_json::{Map, Value};

use crate::condition::{build_field_condition_map, build_one_of_key_info, expand_virtual, virtual_fields};
use crate::error::{escape_pointer, SchemaError};
use crate::expression::{Expression, NodePath};
use crate::merge::resolve_all_of;
use crate::projector::BranchDiscriminant;
use crate::types::{FieldConditionMap, OneOfKeyInfo, SchemaType, EXTENSION_KEYWORDS};

/// Computed flag a node can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ComputedKind {
    Active,
    Visible,
    ReadOnly,
    Disabled,
    Derived,
}

impl ComputedKind {
    pub const ALL: [ComputedKind; 5] = [
        ComputedKind::Active,
        ComputedKind::Visible,
        ComputedKind::ReadOnly,
        ComputedKind::Disabled,
        ComputedKind::Derived,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ComputedKind::Active => "active",
            ComputedKind::Visible => "visible",
            ComputedKind::ReadOnly => "readOnly",
            ComputedKind::Disabled => "disabled",
            ComputedKind::Derived => "derived",
        }
    }

    /// Names accepted inside `computed: { .. }`.
    fn from_computed_key(key: &str) -> Option<Self> {
        match key {
            "active" | "if" => Some(ComputedKind::Active),
            "visible" => Some(ComputedKind::Visible),
            "readOnly" => Some(ComputedKind::ReadOnly),
            "disabled" => Some(ComputedKind::Disabled),
            "derived" => Some(ComputedKind::Derived),
            _ => None,
        }
    }

    /// `&active`-style shorthand keywords.
    fn from_shorthand(key: &str) -> Option<Self> {
        key.strip_prefix('&').and_then(Self::from_computed_key)
    }
}

/// Parsed computed expressions of one fragment.
#[derive(Debug, Clone, Default)]
pub struct ComputedProperties {
    expressions: BTreeMap<ComputedKind, Expression>,
}

impl ComputedProperties {
    pub fn get(&self, kind: ComputedKind) -> Option<&Expression> {
        self.expressions.get(&kind)
    }

    pub fn is_empty(&self) -> bool {
        self.expressions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ComputedKind, &Expression)> {
        self.expressions.iter().map(|(k, e)| (*k, e))
    }

    /// Every path read by any expression, deduplicated.
    pub fn dependencies(&self) -> Vec<NodePath> {
        let mut out: Vec<NodePath> = Vec::new();
        for expression in self.expressions.values() {
            for path in expression.dependencies() {
                if !out.contains(path) {
                    out.push(path.clone());
                }
            }
        }
        out
    }
}

/// A fragment ready for node construction. Shared by every node built from it.
#[derive(Debug)]
pub struct CompiledSchema {
    /// Location of the fragment inside the root schema.
    pub pointer: String,
    /// The resolved fragment.
    pub schema: Value,
    /// `None` accepts any JSON value.
    pub schema_type: Option<SchemaType>,
    pub shape: Shape,
    pub computed: ComputedProperties,
    pub default: Option<Value>,
}

#[derive(Debug)]
pub enum Shape {
    Object(ObjectShape),
    Array(ArrayShape),
    Terminal,
}

#[derive(Debug, Default)]
pub struct ObjectShape {
    /// Properties every branch shares, in declaration order.
    pub properties: Vec<(String, Rc<CompiledSchema>)>,
    pub branches: Vec<OneOfBranch>,
    pub virtuals: Vec<VirtualField>,
    pub conditions: Option<FieldConditionMap>,
    pub one_of: Option<OneOfKeyInfo>,
}

impl ObjectShape {
    pub fn property(&self, key: &str) -> Option<&Rc<CompiledSchema>> {
        self.properties.iter().find(|(k, _)| k == key).map(|(_, s)| s)
    }
}

/// One `oneOf` alternative.
#[derive(Debug)]
pub struct OneOfBranch {
    pub discriminant: BranchDiscriminant,
    /// Properties only this branch declares.
    pub properties: Vec<(String, Rc<CompiledSchema>)>,
}

#[derive(Debug)]
pub struct ArrayShape {
    pub items: Rc<CompiledSchema>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VirtualField {
    pub name: String,
    pub fields: Vec<String>,
}

impl CompiledSchema {
    /// Fragment accepting any value, used for `items`-less arrays.
    pub fn any(pointer: String) -> Self {
        Self {
            pointer,
            schema: Value::Object(Map::new()),
            schema_type: None,
            shape: Shape::Terminal,
            computed: ComputedProperties::default(),
            default: None,
        }
    }

    /// Fragment for the `false` schema: a terminal that is never active.
    pub fn never(pointer: String) -> Self {
        Self {
            schema: Value::Bool(false),
            ..Self::any(pointer)
        }
    }

    pub fn object(&self) -> Option<&ObjectShape> {
        match &self.shape {
            Shape::Object(shape) => Some(shape),
            _ => None,
        }
    }

    /// Value of a computed flag before any expression has run.
    pub fn static_flag(&self, kind: ComputedKind) -> bool {
        match kind {
            ComputedKind::Active | ComputedKind::Visible => self.schema != Value::Bool(false),
            ComputedKind::ReadOnly => self
                .schema
                .get("readOnly")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            ComputedKind::Disabled | ComputedKind::Derived => false,
        }
    }
}

/// Output of [`compile`].
#[derive(Debug)]
pub struct CompiledRoot {
    pub root: Rc<CompiledSchema>,
    /// Extension-free schema handed to the validator.
    pub validation_schema: Value,
    /// `allOf`-resolved schema with refs inlined.
    pub resolved: Value,
}

/// Compile a root schema.
///
/// # Errors
///
/// Returns `SchemaError` when a reference cannot be resolved, `allOf`
/// members contradict each other, a type is unknown, or an expression
/// does not parse.
pub fn compile(schema: &Value) -> Result<CompiledRoot, SchemaError> {
    if !schema.is_object() {
        return Err(SchemaError::InvalidSchema {
            path: String::new(),
            message: "root schema must be an object".to_string(),
        });
    }

    let mut inlined = schema.clone();
    inline_refs(&mut inlined, schema, "", &mut HashSet::new())?;
    let resolved = resolve_all_of(&inlined)?;
    let root = Rc::new(compile_fragment(&resolved, String::new())?);
    let validation_schema = validation_schema(&resolved);

    tracing::debug!(
        schema_type = ?root.schema_type,
        "compiled schema"
    );

    Ok(CompiledRoot {
        root,
        validation_schema,
        resolved,
    })
}

/// Replace internal `$ref` objects with the referenced fragment.
///
/// Keys next to `$ref` win over the target's. A ref already being inlined
/// higher up is recursive and stays as a `$ref`.
fn inline_refs(
    value: &mut Value,
    root: &Value,
    path: &str,
    visiting: &mut HashSet<String>,
) -> Result<(), SchemaError> {
    match value {
        Value::Object(obj) => {
            if let Some(reference) = obj.get("$ref").and_then(Value::as_str).map(str::to_string) {
                if let Some(pointer) = reference.strip_prefix('#') {
                    if pointer.is_empty() || visiting.contains(&reference) {
                        return Ok(());
                    }
                    let target = root.pointer(pointer).ok_or_else(|| SchemaError::InvalidReference {
                        path: path.to_string(),
                        reference: reference.clone(),
                    })?;

                    let mut inlined = target.clone();
                    visiting.insert(reference.clone());
                    inline_refs(&mut inlined, root, path, visiting)?;
                    visiting.remove(&reference);

                    if let Value::Object(target_obj) = inlined {
                        if !target_obj.contains_key("$ref") {
                            obj.remove("$ref");
                        }
                        for (k, v) in target_obj {
                            obj.entry(k).or_insert(v);
                        }
                    }
                    return Ok(());
                } else {
                    tracing::debug!(reference = %reference, path = %path, "leaving external reference");
                }
            }

            for (key, child) in obj.iter_mut() {
                if path.is_empty() && (key == "$defs" || key == "definitions") {
                    continue;
                }
                inline_refs(child, root, &format!("{}/{}", path, escape_pointer(key)), visiting)?;
            }
            Ok(())
        }
        Value::Array(items) => {
            for (i, item) in items.iter_mut().enumerate() {
                inline_refs(item, root, &format!("{}/{}", path, i), visiting)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn compile_fragment(value: &Value, pointer: String) -> Result<CompiledSchema, SchemaError> {
    let map = match value {
        Value::Object(map) => map,
        Value::Bool(true) => return Ok(CompiledSchema::any(pointer)),
        Value::Bool(false) => return Ok(CompiledSchema::never(pointer)),
        other => {
            return Err(SchemaError::InvalidSchema {
                path: pointer,
                message: format!("expected a schema object, got {}", other),
            })
        }
    };

    let schema_type = infer_type(map, &pointer)?;
    let computed = parse_computed(map, &pointer)?;
    let shape = match schema_type {
        Some(SchemaType::Object) => Shape::Object(compile_object(map, &pointer)?),
        Some(SchemaType::Array) => {
            let items_pointer = format!("{}/items", pointer);
            let items = match map.get("items") {
                Some(items) => compile_fragment(items, items_pointer)?,
                None => CompiledSchema::any(items_pointer),
            };
            Shape::Array(ArrayShape {
                items: Rc::new(items),
            })
        }
        _ => Shape::Terminal,
    };

    Ok(CompiledSchema {
        default: map.get("default").cloned(),
        schema: value.clone(),
        pointer,
        schema_type,
        shape,
        computed,
    })
}

fn compile_object(map: &Map<String, Value>, pointer: &str) -> Result<ObjectShape, SchemaError> {
    let mut shape = ObjectShape::default();

    if let Some(props) = map.get("properties").and_then(Value::as_object) {
        for (key, prop) in props {
            let child_pointer = format!("{}/properties/{}", pointer, escape_pointer(key));
            shape
                .properties
                .push((key.clone(), Rc::new(compile_fragment(prop, child_pointer)?)));
        }
    }

    // Properties introduced by conditional branches become regular
    // properties; the condition map decides when they are active.
    for (location, branch) in conditional_branches(map) {
        let Some(props) = branch.get("properties").and_then(Value::as_object) else {
            continue;
        };
        for (key, prop) in props {
            if shape.property(key).is_some() {
                continue;
            }
            let child_pointer = format!("{}{}/properties/{}", pointer, location, escape_pointer(key));
            shape
                .properties
                .push((key.clone(), Rc::new(compile_fragment(prop, child_pointer)?)));
        }
    }

    if let Some(branches) = map.get("oneOf").and_then(Value::as_array) {
        for (i, branch) in branches.iter().enumerate() {
            let branch_pointer = format!("{}/oneOf/{}", pointer, i);
            let Some(branch_map) = branch.as_object() else {
                return Err(SchemaError::InvalidSchema {
                    path: branch_pointer,
                    message: "oneOf branch must be an object".to_string(),
                });
            };
            let discriminant = BranchDiscriminant::from_schema(branch_map, &branch_pointer)?;
            let mut properties = Vec::new();
            if let Some(props) = branch_map.get("properties").and_then(Value::as_object) {
                for (key, prop) in props {
                    if shape.property(key).is_some() {
                        continue;
                    }
                    let child_pointer =
                        format!("{}/properties/{}", branch_pointer, escape_pointer(key));
                    properties.push((key.clone(), Rc::new(compile_fragment(prop, child_pointer)?)));
                }
            }
            shape.branches.push(OneOfBranch {
                discriminant,
                properties,
            });
        }
    }

    shape.virtuals = virtual_fields(map)
        .into_iter()
        .map(|(name, fields)| VirtualField { name, fields })
        .collect();

    let active = shape
        .properties
        .iter()
        .filter_map(|(key, schema)| {
            schema
                .computed
                .get(ComputedKind::Active)
                .map(|e| (key.as_str(), e))
        });
    let conditions = build_field_condition_map(map, active);
    shape.conditions = (!conditions.is_empty()).then_some(conditions);
    shape.one_of = build_one_of_key_info(map);

    Ok(shape)
}

/// `then`/`else` maps with their pointer suffix, top level and `allOf`.
fn conditional_branches(map: &Map<String, Value>) -> Vec<(String, &Map<String, Value>)> {
    let mut out = Vec::new();
    for key in ["then", "else"] {
        if let Some(branch) = map.get(key).and_then(Value::as_object) {
            out.push((format!("/{}", key), branch));
        }
    }
    if let Some(members) = map.get("allOf").and_then(Value::as_array) {
        for (i, member) in members.iter().enumerate() {
            for key in ["then", "else"] {
                if let Some(branch) = member.get(key).and_then(Value::as_object) {
                    out.push((format!("/allOf/{}/{}", i, key), branch));
                }
            }
        }
    }
    out
}

fn infer_type(map: &Map<String, Value>, pointer: &str) -> Result<Option<SchemaType>, SchemaError> {
    let unresolved = || SchemaError::UnresolvedType {
        path: pointer.to_string(),
    };
    match map.get("type") {
        Some(Value::String(name)) => SchemaType::parse(name).map(Some).ok_or_else(unresolved),
        Some(Value::Array(names)) => {
            let mut types = Vec::with_capacity(names.len());
            for name in names {
                let parsed = name.as_str().and_then(SchemaType::parse).ok_or_else(unresolved)?;
                types.push(parsed);
            }
            Ok(types
                .iter()
                .copied()
                .find(|t| *t != SchemaType::Null)
                .or_else(|| types.first().copied()))
        }
        Some(_) => Err(unresolved()),
        None => {
            const OBJECT_HINTS: &[&str] = &["properties", "oneOf", "virtual", "required"];
            const ARRAY_HINTS: &[&str] = &["items", "prefixItems", "minItems", "maxItems"];
            if OBJECT_HINTS.iter().any(|k| map.contains_key(*k)) {
                Ok(Some(SchemaType::Object))
            } else if ARRAY_HINTS.iter().any(|k| map.contains_key(*k)) {
                Ok(Some(SchemaType::Array))
            } else {
                Ok(map
                    .get("const")
                    .or_else(|| map.get("enum").and_then(|e| e.get(0)))
                    .or_else(|| map.get("default"))
                    .map(SchemaType::of_value))
            }
        }
    }
}

fn parse_computed(map: &Map<String, Value>, pointer: &str) -> Result<ComputedProperties, SchemaError> {
    let mut computed = ComputedProperties::default();

    let mut sources: Vec<(ComputedKind, String, &Value)> = Vec::new();
    match map.get("computed") {
        Some(Value::Object(entries)) => {
            for (key, value) in entries {
                match ComputedKind::from_computed_key(key) {
                    Some(kind) => sources.push((kind, format!("{}/computed/{}", pointer, key), value)),
                    None => tracing::debug!(key = %key, pointer = %pointer, "ignoring unknown computed key"),
                }
            }
        }
        Some(other) => {
            return Err(SchemaError::InvalidSchema {
                path: format!("{}/computed", pointer),
                message: format!("computed must be an object, got {}", other),
            })
        }
        None => {}
    }
    for (key, value) in map {
        if let Some(kind) = ComputedKind::from_shorthand(key) {
            sources.push((kind, format!("{}/{}", pointer, escape_pointer(key)), value));
        }
    }

    for (kind, path, value) in sources {
        let source = match value {
            Value::String(s) => s.as_str(),
            Value::Bool(true) => "true",
            Value::Bool(false) => "false",
            other => {
                return Err(SchemaError::InvalidSchema {
                    path,
                    message: format!("expression must be a string, got {}", other),
                })
            }
        };
        let expression = Expression::parse(source).map_err(|e| SchemaError::InvalidExpression {
            path: path.clone(),
            expression: source.to_string(),
            message: e.to_string(),
        })?;
        computed.expressions.insert(kind, expression);
    }

    Ok(computed)
}

/// Derive the schema handed to the validator: extension keywords removed,
/// virtual names in `required` expanded, `oneOf` relaxed to `anyOf` since
/// projection already keeps only the selected branch's keys.
pub fn validation_schema(resolved: &Value) -> Value {
    let mut out = resolved.clone();
    strip_extensions(&mut out);
    out
}

fn strip_extensions(value: &mut Value) {
    let map = match value {
        Value::Object(map) => map,
        Value::Array(items) => {
            items.iter_mut().for_each(strip_extensions);
            return;
        }
        _ => return,
    };

    let virtuals = virtual_fields(map);
    if !virtuals.is_empty() {
        expand_required(map, &virtuals);
        for key in ["then", "else"] {
            if let Some(Value::Object(branch)) = map.get_mut(key) {
                expand_required(branch, &virtuals);
            }
        }
        if let Some(Value::Array(members)) = map.get_mut("allOf") {
            for member in members.iter_mut() {
                for key in ["then", "else"] {
                    if let Some(Value::Object(branch)) = member.get_mut(key) {
                        expand_required(branch, &virtuals);
                    }
                }
            }
        }
    }

    for keyword in EXTENSION_KEYWORDS {
        map.remove(*keyword);
    }
    if let Some(branches) = map.remove("oneOf") {
        map.insert("anyOf".to_string(), branches);
    }

    for (key, child) in map.iter_mut() {
        match key.as_str() {
            // keyed by property name, not by keyword
            "properties" | "patternProperties" | "$defs" | "definitions" | "dependentSchemas" => {
                if let Value::Object(named) = child {
                    named.values_mut().for_each(strip_extensions);
                }
            }
            "const" | "enum" | "default" | "examples" => {}
            _ => strip_extensions(child),
        }
    }
}

fn expand_required(map: &mut Map<String, Value>, virtuals: &BTreeMap<String, Vec<String>>) {
    let Some(Value::Array(required)) = map.get("required") else {
        return;
    };
    let names: Vec<String> = required
        .iter()
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect();
    let expanded = expand_virtual(names, virtuals);
    map.insert(
        "required".to_string(),
        Value::Array(expanded.into_iter().map(Value::String).collect()),
    );
}
