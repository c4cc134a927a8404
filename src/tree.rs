//! Tree builder and public node API.
//!
//! A [`SchemaTree`] owns an arena of nodes built from a compiled schema.
//! Mutations are synchronous: values, `oneOf` branch selection and
//! condition-driven activity are up to date as soon as a call returns.
//! Notifications and `computed` expressions run later, through the
//! scheduler's microtasks.
//!
//! ```
//! use schema_tree::SchemaTree;
//! use serde_json::json;
//!
//! let schema = json!({
//!     "type": "object",
//!     "properties": {
//!         "type": { "enum": ["adult", "none"], "default": "adult" },
//!         "age": { "type": "integer", "default": 18 }
//!     },
//!     "if": { "properties": { "type": { "const": "adult" } } },
//!     "then": { "required": ["age"] }
//! });
//!
//! let tree = SchemaTree::new(&schema, None).unwrap();
//! assert_eq!(tree.value(), Some(json!({ "type": "adult", "age": 18 })));
//!
//! tree.find("/type").unwrap().set_value(json!("none")).unwrap();
//! assert_eq!(tree.value(), Some(json!({ "type": "none" })));
//! ```

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::rc::{Rc, Weak};

use serde_json::{Map, Value};

use crate::error::{display_path, escape_pointer, CascadeError, Error, JsonSchemaError};
use crate::event::{
    EventCascade, EventOptions, EventPayload, NodeEventType, NodeEvents, Subscription,
    DEFAULT_LOOP_THRESHOLD,
};
use crate::expression::{truthy, NodePath, PathResolver, PathSegment};
use crate::node::{Arena, ChildEntry, ChildOrigin, Node, NodeId, NodeKind, NodeVariant};
use crate::projector::{project, required_factory, select_one_of_branch};
use crate::scheduler::{Scheduler, TaskQueue};
use crate::schema::{compile, CompiledRoot, CompiledSchema, ComputedKind, Shape};
use crate::types::{FieldCondition, SchemaType};
use crate::validator::{transform_errors, ErrorSequence, JsonSchemaValidator, Validator};

/// Options for building a tree.
///
/// ```
/// use schema_tree::TreeOptions;
///
/// let options = TreeOptions::new()
///     .loop_threshold(20)
///     .omit_error_keywords(["format"])
///     .sequence_errors(true);
/// ```
#[derive(Clone)]
pub struct TreeOptions {
    loop_threshold: u32,
    omit_error_keywords: BTreeSet<String>,
    sequence_errors: bool,
    scheduler: Option<Rc<dyn Scheduler>>,
    validator: Rc<dyn Validator>,
}

impl TreeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Batches a node may open before a cascade counts as a loop.
    pub fn loop_threshold(mut self, threshold: u32) -> Self {
        self.loop_threshold = threshold;
        self
    }

    /// Validation keywords to drop before routing errors.
    pub fn omit_error_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.omit_error_keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    /// Stamp routed errors with monotonically increasing keys.
    pub fn sequence_errors(mut self, enabled: bool) -> Self {
        self.sequence_errors = enabled;
        self
    }

    /// Use a host scheduler instead of the tree's own [`TaskQueue`].
    pub fn scheduler(mut self, scheduler: Rc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn validator(mut self, validator: Rc<dyn Validator>) -> Self {
        self.validator = validator;
        self
    }
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self {
            loop_threshold: DEFAULT_LOOP_THRESHOLD,
            omit_error_keywords: BTreeSet::new(),
            sequence_errors: false,
            scheduler: None,
            validator: Rc::new(JsonSchemaValidator),
        }
    }
}

impl fmt::Debug for TreeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TreeOptions")
            .field("loop_threshold", &self.loop_threshold)
            .field("omit_error_keywords", &self.omit_error_keywords)
            .field("sequence_errors", &self.sequence_errors)
            .field("custom_scheduler", &self.scheduler.is_some())
            .finish()
    }
}

/// How `set_value` treats object keys missing from the new value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SetMode {
    /// Missing keys are cleared.
    #[default]
    Replace,
    /// Missing keys keep their current value.
    Merge,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetValueOptions {
    pub mode: SetMode,
}

impl SetValueOptions {
    pub fn merge() -> Self {
        Self {
            mode: SetMode::Merge,
        }
    }

    pub fn replace() -> Self {
        Self {
            mode: SetMode::Replace,
        }
    }
}

/// A live node tree. Cloning shares the same tree.
#[derive(Clone)]
pub struct SchemaTree {
    core: Rc<TreeCore>,
}

struct TreeCore {
    inner: RefCell<TreeInner>,
    compiled: CompiledRoot,
    queue: Option<Rc<TaskQueue>>,
    validator: Rc<dyn Validator>,
    omit_error_keywords: BTreeSet<String>,
    sequence: Option<ErrorSequence>,
    this: Weak<TreeCore>,
}

impl SchemaTree {
    /// Build a tree with default options.
    ///
    /// # Errors
    ///
    /// Returns `Error::Schema` when the schema cannot be compiled.
    pub fn new(schema: &Value, initial: Option<Value>) -> Result<Self, Error> {
        Self::with_options(schema, initial, TreeOptions::default())
    }

    /// Build a tree. Missing values fall back to schema defaults.
    ///
    /// # Errors
    ///
    /// Returns `Error::Schema` when the schema cannot be compiled.
    pub fn with_options(
        schema: &Value,
        initial: Option<Value>,
        options: TreeOptions,
    ) -> Result<Self, Error> {
        let compiled = compile(schema)?;

        let (scheduler, queue) = match options.scheduler {
            Some(scheduler) => (scheduler, None),
            None => {
                let queue = Rc::new(TaskQueue::new());
                (queue.clone() as Rc<dyn Scheduler>, Some(queue))
            }
        };

        let mut arena = Arena::new();
        let root_schema = compiled.root.clone();
        let root = arena.insert(Node::new(
            String::new(),
            String::new(),
            None,
            root_schema.clone(),
            skeleton(&root_schema),
            EventCascade::new("", scheduler.clone(), options.loop_threshold),
        ));
        let mut inner = TreeInner {
            arena,
            root,
            scheduler,
            threshold: options.loop_threshold,
        };

        let mut outbox = Outbox::default();
        inner.assign(root, initial, SetMode::Replace, true, true, &mut outbox);
        outbox.events.clear();
        outbox.created.insert(0, root);
        outbox.structural = true;

        tracing::debug!(nodes = inner.arena.len(), "built schema tree");

        let core = Rc::new_cyclic(|this| TreeCore {
            inner: RefCell::new(inner),
            compiled,
            queue,
            validator: options.validator,
            omit_error_keywords: options.omit_error_keywords,
            sequence: options.sequence_errors.then(ErrorSequence::new),
            this: this.clone(),
        });
        let tree = SchemaTree { core };
        tree.settle(outbox)?;
        Ok(tree)
    }

    pub fn root(&self) -> NodeRef {
        self.node(self.core.inner.borrow().root)
    }

    pub fn root_id(&self) -> NodeId {
        self.core.inner.borrow().root
    }

    /// Wrap a handle. The handle may be stale; accessors then return `None`.
    pub fn node(&self, id: NodeId) -> NodeRef {
        NodeRef {
            tree: self.clone(),
            id,
        }
    }

    /// Projected value of the whole tree.
    pub fn value(&self) -> Option<Value> {
        let inner = self.core.inner.borrow();
        inner.value_of(inner.root)
    }

    pub fn value_of(&self, id: NodeId) -> Option<Value> {
        self.core.inner.borrow().value_of(id)
    }

    /// Resolve a pointer from the root.
    pub fn find(&self, pointer: &str) -> Option<NodeRef> {
        let root = self.root_id();
        self.find_from(root, pointer)
    }

    /// Resolve a pointer relative to `from`: `#` or a leading `/` starts at
    /// the root, `.` is `from`, `..` its parent, other segments are child
    /// keys or array indices. Returns `None` on any unresolved segment.
    pub fn find_from(&self, from: NodeId, pointer: &str) -> Option<NodeRef> {
        let path = NodePath::parse_pointer(pointer);
        let id = self.core.inner.borrow().find(from, &path)?;
        Some(self.node(id))
    }

    pub fn node_count(&self) -> usize {
        self.core.inner.borrow().arena.len()
    }

    /// Schema handed to the validator.
    pub fn validation_schema(&self) -> &Value {
        &self.core.compiled.validation_schema
    }

    /// Root schema with refs inlined and `allOf` resolved.
    pub fn resolved_schema(&self) -> &Value {
        &self.core.compiled.resolved
    }

    /// Replace (or merge into) a node's value.
    ///
    /// Inactive nodes ignore new values. Setting a virtual node writes the
    /// matching keys to its underlying fields.
    ///
    /// # Errors
    ///
    /// Returns `CascadeError` when publishing the resulting events trips
    /// loop detection.
    pub fn set_value(
        &self,
        id: NodeId,
        value: Value,
        options: SetValueOptions,
    ) -> Result<(), CascadeError> {
        let (active, virtual_fields, parent) = {
            let inner = self.core.inner.borrow();
            let Some(node) = inner.arena.get(id) else {
                return Ok(());
            };
            let fields = match &node.kind {
                NodeKind::Virtual { fields } => Some(fields.clone()),
                _ => None,
            };
            (node.is_active(), fields, node.parent)
        };

        if !active {
            tracing::debug!(path = %self.path_of(id), "ignoring value for inactive node");
            return Ok(());
        }

        if let Some(fields) = virtual_fields {
            let (Some(parent), Value::Object(map)) = (parent, value) else {
                return Ok(());
            };
            for field in fields {
                let Some(v) = map.get(&field) else {
                    continue;
                };
                let sibling = self.core.inner.borrow().find_child(parent, &field);
                if let Some(sibling) = sibling {
                    self.set_value(sibling, v.clone(), SetValueOptions::replace())?;
                }
            }
            return Ok(());
        }

        self.mutate(id, |inner, outbox| {
            inner.assign(id, Some(value), options.mode, false, false, outbox);
        })
    }

    /// Set one state flag (dirty, touched, ...).
    pub fn set_state(&self, id: NodeId, key: &str, value: bool) -> Result<(), CascadeError> {
        let cascade = {
            let mut inner = self.core.inner.borrow_mut();
            let Some(node) = inner.arena.get_mut(id) else {
                return Ok(());
            };
            if node.state.insert(key.to_string(), value) == Some(value) {
                return Ok(());
            }
            node.cascade.clone()
        };
        cascade.publish(
            EventPayload::State(BTreeMap::from([(key.to_string(), value)])),
            EventOptions::default(),
        )
    }

    pub fn state(&self, id: NodeId) -> BTreeMap<String, bool> {
        self.core
            .inner
            .borrow()
            .arena
            .get(id)
            .map(|n| n.state.clone())
            .unwrap_or_default()
    }

    /// Reset every state flag to `false` and forget them.
    pub fn clear_state(&self, id: NodeId) -> Result<(), CascadeError> {
        let (cascade, cleared) = {
            let mut inner = self.core.inner.borrow_mut();
            let Some(node) = inner.arena.get_mut(id) else {
                return Ok(());
            };
            let cleared: BTreeMap<String, bool> = std::mem::take(&mut node.state)
                .into_keys()
                .map(|k| (k, false))
                .collect();
            (node.cascade.clone(), cleared)
        };
        if cleared.is_empty() {
            return Ok(());
        }
        cascade.publish(EventPayload::State(cleared), EventOptions::default())
    }

    pub fn errors(&self, id: NodeId) -> Option<Vec<JsonSchemaError>> {
        self.core
            .inner
            .borrow()
            .arena
            .get(id)
            .and_then(|n| n.errors.clone())
    }

    /// Clear errors on a node and its descendants.
    pub fn clear_errors(&self, id: NodeId) -> Result<(), CascadeError> {
        let mut outbox = Outbox::default();
        {
            let mut inner = self.core.inner.borrow_mut();
            for target in inner.subtree(id) {
                if let Some(node) = inner.arena.get_mut(target) {
                    if node.errors.take().is_some() {
                        outbox.push(
                            &node.cascade,
                            EventPayload::Errors(Vec::new()),
                            EventOptions::propagated(),
                        );
                    }
                }
            }
        }
        outbox.publish()
    }

    /// Validate the projected value and route errors to their nodes.
    ///
    /// Every node's errors are replaced: nodes without errors end up with
    /// `None`. Errors whose node does not exist go to the nearest existing
    /// ancestor.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validator` when the validation schema is rejected.
    pub fn validate(&self) -> Result<Vec<JsonSchemaError>, Error> {
        let value = self.value().unwrap_or(Value::Null);
        let raw = self
            .core
            .validator
            .validate(&value, &self.core.compiled.validation_schema)?;
        let errors = transform_errors(
            raw,
            &self.core.omit_error_keywords,
            self.core.sequence.as_ref(),
        );

        let mut outbox = Outbox::default();
        {
            let mut inner = self.core.inner.borrow_mut();
            let mut grouped: BTreeMap<NodeId, Vec<JsonSchemaError>> = BTreeMap::new();
            for error in &errors {
                let target = inner.route(&error.data_path());
                grouped.entry(target).or_default().push(error.clone());
            }

            let ids: Vec<NodeId> = inner.arena.iter().map(|(id, _)| id).collect();
            for id in ids {
                let Some(node) = inner.arena.get_mut(id) else {
                    continue;
                };
                let next = grouped.remove(&id);
                if node.errors != next {
                    node.errors = next.clone();
                    outbox.push(
                        &node.cascade,
                        EventPayload::Errors(next.unwrap_or_default()),
                        EventOptions::propagated(),
                    );
                }
            }
        }
        outbox.publish()?;

        tracing::debug!(errors = errors.len(), "validated tree");
        Ok(errors)
    }

    /// Register a listener on a node's merged events.
    pub fn subscribe(
        &self,
        id: NodeId,
        listener: impl Fn(&NodeEvents) + 'static,
    ) -> Option<Subscription> {
        let cascade = self.core.inner.borrow().arena.get(id)?.cascade.clone();
        Some(cascade.subscribe(listener))
    }

    /// Deliver an event to a node's listeners now, outside batching.
    /// Stale handles are ignored.
    pub fn dispatch(
        &self,
        id: NodeId,
        payload: EventPayload,
        options: EventOptions,
    ) -> Result<(), CascadeError> {
        let cascade = self.core.inner.borrow().arena.get(id).map(|n| n.cascade.clone());
        match cascade {
            Some(cascade) => cascade.dispatch(payload, options),
            None => Ok(()),
        }
    }

    /// Append an element to an array node. Returns the new child.
    pub fn push(&self, id: NodeId, value: Option<Value>) -> Result<Option<NodeId>, CascadeError> {
        if !self.is_active(id) {
            return Ok(None);
        }
        self.mutate(id, |inner, outbox| inner.push_item(id, value, outbox))
    }

    /// Remove an array element; later elements shift down.
    pub fn remove(&self, id: NodeId, index: usize) -> Result<bool, CascadeError> {
        self.mutate(id, |inner, outbox| inner.remove_item(id, index, outbox))
    }

    /// Remove every element of an array node.
    pub fn clear(&self, id: NodeId) -> Result<(), CascadeError> {
        self.mutate(id, |inner, outbox| inner.clear_items(id, outbox))
    }

    /// Drain the tree's own task queue. A no-op with a host scheduler.
    ///
    /// # Errors
    ///
    /// Returns the first `CascadeError` raised while delivering.
    pub fn run_until_idle(&self) -> Result<(), CascadeError> {
        match &self.core.queue {
            Some(queue) => queue.run_until_idle(),
            None => Ok(()),
        }
    }

    /// Drain pending microtasks only; the idle window stays open.
    pub fn run_microtasks(&self) -> Result<(), CascadeError> {
        match &self.core.queue {
            Some(queue) => queue.run_microtasks().map(|_| ()),
            None => Ok(()),
        }
    }

    fn has_branches(&self, id: NodeId) -> bool {
        self.core
            .inner
            .borrow()
            .arena
            .get(id)
            .and_then(|n| n.schema.object())
            .is_some_and(|shape| !shape.branches.is_empty())
    }

    fn is_active(&self, id: NodeId) -> bool {
        self.core
            .inner
            .borrow()
            .arena
            .get(id)
            .is_some_and(Node::is_active)
    }

    fn path_of(&self, id: NodeId) -> String {
        self.core
            .inner
            .borrow()
            .arena
            .get(id)
            .map(|n| display_path(&n.path).to_string())
            .unwrap_or_default()
    }

    /// Run `f` against the arena, refresh `id`'s ancestors bottom-up and
    /// publish the collected events once the arena is released.
    fn mutate<R>(
        &self,
        id: NodeId,
        f: impl FnOnce(&mut TreeInner, &mut Outbox) -> R,
    ) -> Result<R, CascadeError> {
        let (result, outbox) = {
            let mut inner = self.core.inner.borrow_mut();
            let ancestors = inner.ancestors(id);
            let before: Vec<Option<Value>> = ancestors.iter().map(|a| inner.value_of(*a)).collect();

            let mut outbox = Outbox::default();
            let result = f(&mut inner, &mut outbox);

            for ancestor in &ancestors {
                inner.refresh_object(*ancestor, &mut outbox);
            }
            for (ancestor, before) in ancestors.iter().zip(before) {
                let after = inner.value_of(*ancestor);
                if after != before {
                    if let Some(node) = inner.arena.get(*ancestor) {
                        outbox.push(
                            &node.cascade,
                            EventPayload::Value {
                                previous: before,
                                current: after,
                            },
                            EventOptions::propagated(),
                        );
                    }
                }
            }
            (result, outbox)
        };
        self.settle(outbox)?;
        Ok(result)
    }

    fn settle(&self, outbox: Outbox) -> Result<(), CascadeError> {
        let Outbox {
            events,
            created,
            structural,
        } = outbox;
        if structural {
            self.rewire();
        }
        for (cascade, payload, options) in events {
            cascade.publish(payload, options)?;
        }
        for id in created {
            if self.has_branches(id) {
                self.reselect(id)?;
            }
            self.recompute(id)?;
        }
        Ok(())
    }

    /// Resubscribe every computed node to the nodes its expressions read,
    /// and every `oneOf` object to what its discriminants read outside it.
    fn rewire(&self) {
        let inner = self.core.inner.borrow();
        let mut wired = 0usize;
        for (id, node) in inner.arena.iter() {
            node.cascade.release_dependencies();

            let computed = inner.dependency_targets(id, node.schema.computed.dependencies(), false);
            let branches = match node.schema.object() {
                Some(shape) => {
                    let paths = shape
                        .branches
                        .iter()
                        .filter_map(|b| b.discriminant.expression.as_ref())
                        .flat_map(|e| e.dependencies().iter().cloned())
                        .collect();
                    inner.dependency_targets(id, paths, true)
                }
                None => Vec::new(),
            };
            if computed.is_empty() && branches.is_empty() {
                continue;
            }

            let mut names: Vec<String> = Vec::new();
            let reactions = computed
                .into_iter()
                .map(|t| (t, SchemaTree::recompute as Reaction))
                .chain(branches.into_iter().map(|t| (t, SchemaTree::reselect as Reaction)));
            for (target, react) in reactions {
                let Some(target_node) = inner.arena.get(target) else {
                    continue;
                };
                let name = display_path(&target_node.path).to_string();
                if !names.contains(&name) {
                    names.push(name);
                }
                let subscription = target_node
                    .cascade
                    .subscribe_fallible(self.dependency_listener(id, react));
                node.cascade.add_cleanup(move || subscription.unsubscribe());
            }
            node.cascade.set_dependencies(names);
            wired += 1;
        }
        tracing::debug!(nodes = wired, "rewired computed dependencies");
    }

    fn dependency_listener(&self, owner: NodeId, react: Reaction) -> crate::event::Listener {
        let core = self.core.this.clone();
        Rc::new(move |events: &NodeEvents| {
            if !events.contains(NodeEventType::UpdateValue)
                && !events.contains(NodeEventType::UpdateChildren)
            {
                return Ok(());
            }
            match core.upgrade() {
                Some(core) => react(&SchemaTree { core }, owner),
                None => Ok(()),
            }
        })
    }

    /// Re-run `oneOf` selection on an object after a value it reads changed.
    fn reselect(&self, id: NodeId) -> Result<(), CascadeError> {
        self.mutate(id, |inner, outbox| inner.reselect_branch(id, outbox))
    }

    /// Re-evaluate a node's computed expressions and apply the results.
    pub(crate) fn recompute(&self, id: NodeId) -> Result<(), CascadeError> {
        let evaluated: Vec<(ComputedKind, Value)> = {
            let inner = self.core.inner.borrow();
            let Some(node) = inner.arena.get(id) else {
                return Ok(());
            };
            if node.schema.computed.is_empty() {
                return Ok(());
            }
            let resolver = TreeResolver::new(&inner, id);
            node.schema
                .computed
                .iter()
                .map(|(kind, expression)| (kind, expression.evaluate(&resolver)))
                .collect()
        };
        self.mutate(id, |inner, outbox| inner.apply_computed(id, evaluated, outbox))
    }
}

impl fmt::Debug for SchemaTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaTree")
            .field("nodes", &self.node_count())
            .finish()
    }
}

/// What a dependency listener does to its owner.
type Reaction = fn(&SchemaTree, NodeId) -> Result<(), CascadeError>;

/// Events and structural changes collected while the arena is borrowed.
#[derive(Default)]
struct Outbox {
    events: Vec<(Rc<EventCascade>, EventPayload, EventOptions)>,
    created: Vec<NodeId>,
    structural: bool,
}

impl Outbox {
    fn push(&mut self, cascade: &Rc<EventCascade>, payload: EventPayload, options: EventOptions) {
        self.events.push((cascade.clone(), payload, options));
    }

    fn publish(self) -> Result<(), CascadeError> {
        for (cascade, payload, options) in self.events {
            cascade.publish(payload, options)?;
        }
        Ok(())
    }
}

struct TreeInner {
    arena: Arena,
    root: NodeId,
    scheduler: Rc<dyn Scheduler>,
    threshold: u32,
}

fn skeleton(schema: &CompiledSchema) -> NodeKind {
    match &schema.shape {
        Shape::Object(_) => NodeKind::Object {
            children: Vec::new(),
            branch: None,
            extra: Map::new(),
        },
        Shape::Array(_) => NodeKind::Array {
            children: Vec::new(),
        },
        Shape::Terminal => NodeKind::Terminal { value: None },
    }
}

/// Terminal values: objects/arrays only fit untyped terminals, `null`
/// only fits `type: null`.
fn coerce_terminal(schema_type: Option<SchemaType>, value: Option<Value>) -> Option<Value> {
    match value? {
        Value::Null => (schema_type == Some(SchemaType::Null)).then_some(Value::Null),
        Value::Object(_) | Value::Array(_) if schema_type.is_some() => {
            tracing::debug!(expected = ?schema_type, "coercing structured value on terminal to empty");
            None
        }
        v => Some(v),
    }
}

fn child_path(parent: &str, key: &str) -> String {
    format!("{}/{}", parent, escape_pointer(key))
}

impl TreeInner {
    // --- Reads ---

    fn value_of(&self, id: NodeId) -> Option<Value> {
        let node = self.arena.get(id)?;
        if !node.is_active() {
            return None;
        }
        match &node.kind {
            NodeKind::Terminal { value } => value.clone(),
            NodeKind::Array { children } => Some(Value::Array(
                children
                    .iter()
                    .map(|c| self.value_of(*c).unwrap_or(Value::Null))
                    .collect(),
            )),
            NodeKind::Object { branch, .. } => {
                let raw = Value::Object(self.raw_object(id));
                let Some(shape) = node.schema.object() else {
                    return Some(raw);
                };
                let filtered = match project(
                    &raw,
                    shape.conditions.as_ref(),
                    shape.one_of.as_ref().map(|info| &info.one_of_key_set),
                    shape.one_of.as_ref().and_then(|info| info.allowed(*branch)),
                ) {
                    std::borrow::Cow::Owned(projected) => Some(projected),
                    std::borrow::Cow::Borrowed(_) => None,
                };
                Some(filtered.unwrap_or(raw))
            }
            NodeKind::Virtual { fields } => {
                let parent = node.parent?;
                let mut out = Map::new();
                for field in fields {
                    if let Some(value) = self.find_child(parent, field).and_then(|c| self.value_of(c)) {
                        out.insert(field.clone(), value);
                    }
                }
                Some(Value::Object(out))
            }
        }
    }

    /// Unprojected object value: active children, then passthrough keys.
    fn raw_object(&self, id: NodeId) -> Map<String, Value> {
        let mut out = Map::new();
        let Some(NodeKind::Object { children, extra, .. }) = self.arena.get(id).map(|n| &n.kind) else {
            return out;
        };
        for entry in children {
            if entry.origin == ChildOrigin::Virtual {
                continue;
            }
            if let Some(value) = self.value_of(entry.id) {
                out.insert(entry.key.clone(), value);
            }
        }
        for (key, value) in extra {
            if !out.contains_key(key) {
                out.insert(key.clone(), value.clone());
            }
        }
        out
    }

    fn find_child(&self, id: NodeId, key: &str) -> Option<NodeId> {
        match &self.arena.get(id)?.kind {
            NodeKind::Object { children, .. } => {
                children.iter().find(|c| c.key == key).map(|c| c.id)
            }
            NodeKind::Array { children } => key
                .parse::<usize>()
                .ok()
                .and_then(|i| children.get(i).copied()),
            NodeKind::Terminal { .. } | NodeKind::Virtual { .. } => None,
        }
    }

    /// Distinct nodes `paths` resolve to from `id`, never `id` itself.
    /// With `outside_only`, nodes inside `id`'s subtree are skipped.
    fn dependency_targets(&self, id: NodeId, paths: Vec<NodePath>, outside_only: bool) -> Vec<NodeId> {
        let mut targets: Vec<NodeId> = Vec::new();
        for path in paths {
            let Some((target, _)) = self.walk(id, &path) else {
                continue;
            };
            if target == id || targets.contains(&target) {
                continue;
            }
            if outside_only && self.ancestors(target).contains(&id) {
                continue;
            }
            targets.push(target);
        }
        targets
    }

    fn ancestors(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut current = self.arena.get(id).and_then(|n| n.parent);
        while let Some(parent) = current {
            out.push(parent);
            current = self.arena.get(parent).and_then(|n| n.parent);
        }
        out
    }

    fn subtree(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let Some(node) = self.arena.get(current) else {
                continue;
            };
            out.push(current);
            stack.extend(node.kind.child_ids());
        }
        out
    }

    /// Follow `path` from `anchor` as far as nodes exist. Returns the deepest
    /// node reached and the keys left over, or `None` when the path climbs
    /// above the root.
    fn walk(&self, anchor: NodeId, path: &NodePath) -> Option<(NodeId, Vec<String>)> {
        let mut current = anchor;
        let mut rest: Vec<String> = Vec::new();
        for segment in &path.segments {
            if !rest.is_empty() {
                match segment {
                    PathSegment::Key(key) => rest.push(key.clone()),
                    _ => return None,
                }
                continue;
            }
            match segment {
                PathSegment::Root => current = self.root,
                PathSegment::Current => {}
                PathSegment::Parent => current = self.arena.get(current)?.parent?,
                PathSegment::Key(key) => match self.find_child(current, key) {
                    Some(child) => current = child,
                    None => rest.push(key.clone()),
                },
            }
        }
        Some((current, rest))
    }

    fn find(&self, from: NodeId, path: &NodePath) -> Option<NodeId> {
        self.arena.get(from)?;
        match self.walk(from, path)? {
            (id, rest) if rest.is_empty() => Some(id),
            _ => None,
        }
    }

    /// Node an error at `pointer` belongs to, or its nearest ancestor.
    fn route(&self, pointer: &str) -> NodeId {
        let mut current = self.root;
        for segment in pointer.split('/').skip(1) {
            let key = segment.replace("~1", "/").replace("~0", "~");
            match self.find_child(current, &key) {
                Some(child) => current = child,
                None => {
                    tracing::warn!(
                        pointer = %display_path(pointer),
                        node = %self.arena.get(current).map(|n| display_path(&n.path).to_string()).unwrap_or_default(),
                        "routing error to nearest existing ancestor"
                    );
                    break;
                }
            }
        }
        current
    }

    // --- Structure ---

    fn create_node(
        &mut self,
        key: String,
        path: String,
        parent: NodeId,
        schema: Rc<CompiledSchema>,
        outbox: &mut Outbox,
    ) -> NodeId {
        let kind = skeleton(&schema);
        let cascade = EventCascade::new(path.clone(), self.scheduler.clone(), self.threshold);
        let id = self
            .arena
            .insert(Node::new(key, path, Some(parent), schema, kind, cascade));
        outbox.created.push(id);
        outbox.structural = true;
        id
    }

    /// Remove a subtree, dropping its listeners and dependency subscriptions.
    fn destroy(&mut self, id: NodeId) {
        let Some(node) = self.arena.remove(id) else {
            return;
        };
        node.cascade.clean_up();
        for child in node.kind.child_ids() {
            self.destroy(child);
        }
    }

    /// Rewrite paths after a key change.
    fn set_paths(&mut self, id: NodeId, path: String) {
        let Some(node) = self.arena.get_mut(id) else {
            return;
        };
        node.cascade.set_path(path.clone());
        node.path = path.clone();
        let children: Vec<(String, NodeId)> = match &node.kind {
            NodeKind::Object { children, .. } => {
                children.iter().map(|c| (c.key.clone(), c.id)).collect()
            }
            NodeKind::Array { children } => children
                .iter()
                .enumerate()
                .map(|(i, c)| (i.to_string(), *c))
                .collect(),
            NodeKind::Terminal { .. } | NodeKind::Virtual { .. } => Vec::new(),
        };
        for (key, child) in children {
            self.set_paths(child, child_path(&path, &key));
        }
    }

    // --- Writes ---

    /// Write `value` into a node and its subtree.
    ///
    /// `fill` substitutes schema defaults for missing values (construction
    /// and reactivation). `propagated` marks the node's own value event.
    fn assign(
        &mut self,
        id: NodeId,
        value: Option<Value>,
        mode: SetMode,
        fill: bool,
        propagated: bool,
        outbox: &mut Outbox,
    ) {
        let Some(node) = self.arena.get(id) else {
            return;
        };
        let schema = node.schema.clone();
        let variant = node.kind.variant();
        let before = self.value_of(id);

        let value = match value {
            Some(v) => Some(v),
            None if fill => schema.default.clone(),
            None => None,
        };

        match variant {
            NodeVariant::Terminal => {
                let coerced = coerce_terminal(schema.schema_type, value);
                if let Some(Node {
                    kind: NodeKind::Terminal { value },
                    ..
                }) = self.arena.get_mut(id)
                {
                    *value = coerced;
                }
            }
            NodeVariant::Array => self.assign_array(id, &schema, value, fill, outbox),
            NodeVariant::Object => self.assign_object(id, &schema, value, mode, fill, outbox),
            NodeVariant::Virtual => {}
        }

        let after = self.value_of(id);
        if before != after {
            if let Some(node) = self.arena.get(id) {
                outbox.push(
                    &node.cascade,
                    EventPayload::Value {
                        previous: before,
                        current: after,
                    },
                    EventOptions { propagated },
                );
            }
        }
    }

    fn assign_array(
        &mut self,
        id: NodeId,
        schema: &CompiledSchema,
        value: Option<Value>,
        fill: bool,
        outbox: &mut Outbox,
    ) {
        let Shape::Array(shape) = &schema.shape else {
            return;
        };
        let items = match value {
            Some(Value::Array(items)) => items,
            None | Some(Value::Null) => Vec::new(),
            Some(other) => {
                tracing::debug!(got = %crate::types::json_type_name(&other), "coercing non-array value to empty array");
                Vec::new()
            }
        };
        let (existing, path) = match self.arena.get(id) {
            Some(Node {
                kind: NodeKind::Array { children },
                path,
                ..
            }) => (children.clone(), path.clone()),
            _ => return,
        };

        let mut added = Vec::new();
        let mut removed = Vec::new();
        let mut children = Vec::with_capacity(items.len());
        for (i, item) in items.into_iter().enumerate() {
            match existing.get(i) {
                Some(child) => {
                    self.assign(*child, Some(item), SetMode::Replace, fill, true, outbox);
                    children.push(*child);
                }
                None => {
                    let key = i.to_string();
                    let child = self.create_node(
                        key.clone(),
                        child_path(&path, &key),
                        id,
                        shape.items.clone(),
                        outbox,
                    );
                    self.assign(child, Some(item), SetMode::Replace, true, true, outbox);
                    children.push(child);
                    added.push(key);
                }
            }
        }
        for (i, child) in existing.iter().enumerate().skip(children.len()) {
            self.destroy(*child);
            removed.push(i.to_string());
        }

        let changed = !added.is_empty() || !removed.is_empty();
        if let Some(node) = self.arena.get_mut(id) {
            if let NodeKind::Array { children: current } = &mut node.kind {
                *current = children;
            }
            if changed {
                tracing::debug!(path = %display_path(&node.path), added = added.len(), removed = removed.len(), "rebuilt array children");
                outbox.structural = true;
                outbox.push(
                    &node.cascade,
                    EventPayload::Children { added, removed },
                    EventOptions::propagated(),
                );
            }
        }
    }

    fn assign_object(
        &mut self,
        id: NodeId,
        schema: &CompiledSchema,
        value: Option<Value>,
        mode: SetMode,
        fill: bool,
        outbox: &mut Outbox,
    ) {
        let Some(shape) = schema.object() else {
            return;
        };
        let incoming = match value {
            Some(Value::Object(map)) => map,
            None | Some(Value::Null) => Map::new(),
            Some(other) => {
                tracing::debug!(got = %crate::types::json_type_name(&other), "coercing non-object value to empty object");
                Map::new()
            }
        };
        let combined = match mode {
            SetMode::Replace => incoming.clone(),
            SetMode::Merge => {
                let mut current = self.raw_object(id);
                current.extend(incoming.clone());
                current
            }
        };

        let mut fresh: Vec<NodeId> = Vec::new();

        // Shared properties exist for the node's whole life.
        let path = match self.arena.get(id) {
            Some(node) => node.path.clone(),
            None => return,
        };
        for (key, child_schema) in &shape.properties {
            if self.find_child(id, key).is_some() {
                continue;
            }
            let child = self.create_node(key.clone(), child_path(&path, key), id, child_schema.clone(), outbox);
            self.push_child(id, key.clone(), child, ChildOrigin::Property);
            fresh.push(child);
        }
        for virtual_field in &shape.virtuals {
            if self.find_child(id, &virtual_field.name).is_some() {
                continue;
            }
            let child = self.create_node(
                virtual_field.name.clone(),
                child_path(&path, &virtual_field.name),
                id,
                Rc::new(CompiledSchema::any(format!("{}/virtual/{}", schema.pointer, escape_pointer(&virtual_field.name)))),
                outbox,
            );
            if let Some(node) = self.arena.get_mut(child) {
                node.kind = NodeKind::Virtual {
                    fields: virtual_field.fields.clone(),
                };
            }
            self.push_child(id, virtual_field.name.clone(), child, ChildOrigin::Virtual);
        }

        if !shape.branches.is_empty() {
            let selected = {
                let resolver = TreeResolver::with_incoming(self, id, &combined);
                select_one_of_branch(
                    shape.branches.iter().map(|b| &b.discriminant),
                    &combined,
                    &resolver,
                )
            };
            fresh.extend(self.switch_branch(id, schema, selected, outbox));
        }

        if let Some(conditions) = &shape.conditions {
            let is_required = required_factory(&combined, conditions);
            let flags: Vec<(NodeId, bool)> = self
                .object_children(id)
                .into_iter()
                .filter(|c| c.origin != ChildOrigin::Virtual && conditions.contains_key(&c.key))
                .map(|c| (c.id, is_required(&c.key)))
                .collect();
            for (child, required) in flags {
                self.set_activity(child, true, outbox, |node| node.condition_active = required);
            }
        }

        let defaults = match (&schema.default, fill) {
            (Some(Value::Object(defaults)), true) => defaults.clone(),
            _ => Map::new(),
        };
        for entry in self.object_children(id) {
            if entry.origin == ChildOrigin::Virtual {
                continue;
            }
            let is_fresh = fresh.contains(&entry.id);
            let given = incoming.get(&entry.key).cloned();
            if mode == SetMode::Merge && given.is_none() && !is_fresh {
                continue;
            }
            let active = self.arena.get(entry.id).is_some_and(Node::is_active);
            let child_value = if active {
                given.or_else(|| defaults.get(&entry.key).cloned())
            } else {
                None
            };
            self.assign(
                entry.id,
                child_value,
                SetMode::Replace,
                (fill || is_fresh) && active,
                true,
                outbox,
            );
        }

        let child_keys: BTreeSet<String> = self.object_children(id).into_iter().map(|c| c.key).collect();
        let one_of_keys = shape.one_of.as_ref().map(|info| &info.one_of_key_set);
        let passthrough: Map<String, Value> = incoming
            .into_iter()
            .filter(|(k, _)| !child_keys.contains(k) && !one_of_keys.is_some_and(|set| set.contains(k)))
            .collect();
        if let Some(NodeKind::Object { extra, .. }) = self.arena.get_mut(id).map(|n| &mut n.kind) {
            match mode {
                SetMode::Replace => *extra = passthrough,
                SetMode::Merge => extra.extend(passthrough),
            }
        }

        self.refresh_object(id, outbox);
    }

    fn object_children(&self, id: NodeId) -> Vec<ChildEntry> {
        match self.arena.get(id).map(|n| &n.kind) {
            Some(NodeKind::Object { children, .. }) => children.clone(),
            _ => Vec::new(),
        }
    }

    fn push_child(&mut self, id: NodeId, key: String, child: NodeId, origin: ChildOrigin) {
        if let Some(NodeKind::Object { children, .. }) = self.arena.get_mut(id).map(|n| &mut n.kind) {
            children.push(ChildEntry {
                key,
                id: child,
                origin,
            });
        }
    }

    /// Swap branch-owned children when the selected branch changes.
    /// Returns the children created for the new branch.
    fn switch_branch(
        &mut self,
        id: NodeId,
        schema: &CompiledSchema,
        selected: Option<usize>,
        outbox: &mut Outbox,
    ) -> Vec<NodeId> {
        let Some(shape) = schema.object() else {
            return Vec::new();
        };
        let (current, path) = match self.arena.get(id) {
            Some(Node {
                kind: NodeKind::Object { branch, .. },
                path,
                ..
            }) => (*branch, path.clone()),
            _ => return Vec::new(),
        };
        if current == selected {
            return Vec::new();
        }

        let mut removed = Vec::new();
        if let Some(NodeKind::Object { children, branch, .. }) = self.arena.get_mut(id).map(|n| &mut n.kind) {
            *branch = selected;
            let (dropped, kept): (Vec<ChildEntry>, Vec<ChildEntry>) = std::mem::take(children)
                .into_iter()
                .partition(|c| matches!(c.origin, ChildOrigin::Branch(_)));
            *children = kept;
            removed = dropped;
        }
        for entry in &removed {
            self.destroy(entry.id);
        }

        let mut created = Vec::new();
        if let Some(index) = selected {
            if let Some(branch) = shape.branches.get(index) {
                for (key, child_schema) in &branch.properties {
                    let child = self.create_node(key.clone(), child_path(&path, key), id, child_schema.clone(), outbox);
                    self.push_child(id, key.clone(), child, ChildOrigin::Branch(index));
                    created.push((key.clone(), child));
                }
            }
        }

        tracing::debug!(
            path = %display_path(&path),
            from = ?current,
            to = ?selected,
            "switched oneOf branch"
        );
        outbox.structural = true;
        if let Some(node) = self.arena.get(id) {
            outbox.push(
                &node.cascade,
                EventPayload::Children {
                    added: created.iter().map(|(k, _)| k.clone()).collect(),
                    removed: removed.into_iter().map(|c| c.key).collect(),
                },
                EventOptions::propagated(),
            );
        }
        created.into_iter().map(|(_, id)| id).collect()
    }

    /// Re-select the `oneOf` branch and re-apply the condition index after
    /// a descendant changed.
    fn refresh_object(&mut self, id: NodeId, outbox: &mut Outbox) {
        let Some(schema) = self.arena.get(id).map(|n| n.schema.clone()) else {
            return;
        };
        let Some(shape) = schema.object() else {
            return;
        };
        if !matches!(self.arena.get(id).map(|n| &n.kind), Some(NodeKind::Object { .. })) {
            return;
        }

        if !shape.branches.is_empty() {
            let raw = self.raw_object(id);
            let selected = {
                let resolver = TreeResolver::with_incoming(self, id, &raw);
                select_one_of_branch(shape.branches.iter().map(|b| &b.discriminant), &raw, &resolver)
            };
            for child in self.switch_branch(id, &schema, selected, outbox) {
                self.assign(child, None, SetMode::Replace, true, true, outbox);
            }
        }

        let Some(conditions) = &shape.conditions else {
            return;
        };
        let children: Vec<ChildEntry> = self
            .object_children(id)
            .into_iter()
            .filter(|c| c.origin != ChildOrigin::Virtual && conditions.contains_key(&c.key))
            .collect();
        // Each pass settles at least one field, so this terminates.
        for _ in 0..=children.len() {
            let raw = self.raw_object(id);
            let is_required = required_factory(&raw, conditions);
            let toggles: Vec<(NodeId, bool)> = children
                .iter()
                .filter_map(|c| {
                    let node = self.arena.get(c.id)?;
                    let required = is_required(&c.key);
                    (node.condition_active != required).then_some((c.id, required))
                })
                .collect();
            if toggles.is_empty() {
                break;
            }
            for (child, required) in toggles {
                self.set_activity(child, true, outbox, |node| node.condition_active = required);
            }
        }
    }

    /// Re-run branch selection on `id`, reporting its own value change.
    fn reselect_branch(&mut self, id: NodeId, outbox: &mut Outbox) {
        let before = self.value_of(id);
        self.refresh_object(id, outbox);
        let after = self.value_of(id);
        if after != before {
            if let Some(node) = self.arena.get(id) {
                outbox.push(
                    &node.cascade,
                    EventPayload::Value {
                        previous: before,
                        current: after,
                    },
                    EventOptions::default(),
                );
            }
        }
    }

    /// Apply `toggle` to a node; on an activity change clear the value
    /// (deactivation) or restore the schema default (reactivation).
    fn set_activity(
        &mut self,
        id: NodeId,
        propagated: bool,
        outbox: &mut Outbox,
        toggle: impl FnOnce(&mut Node),
    ) {
        let before = self.value_of(id);
        let Some(node) = self.arena.get_mut(id) else {
            return;
        };
        let was_active = node.is_active();
        toggle(node);
        let now_active = node.is_active();
        if was_active == now_active {
            return;
        }

        if now_active {
            self.assign(id, None, SetMode::Replace, true, propagated, outbox);
        } else {
            self.assign(id, None, SetMode::Replace, false, propagated, outbox);
        }

        let after = self.value_of(id);
        if before != after {
            if let Some(node) = self.arena.get(id) {
                outbox.push(
                    &node.cascade,
                    EventPayload::Value {
                        previous: before,
                        current: after,
                    },
                    EventOptions { propagated },
                );
            }
        }
    }

    fn apply_computed(&mut self, id: NodeId, evaluated: Vec<(ComputedKind, Value)>, outbox: &mut Outbox) {
        let mut changed: BTreeMap<String, bool> = BTreeMap::new();
        let mut derived: Option<Value> = None;
        let mut active: Option<bool> = None;

        let Some(node) = self.arena.get_mut(id) else {
            return;
        };
        for (kind, value) in evaluated {
            match kind {
                ComputedKind::Derived => derived = Some(value),
                ComputedKind::Active => active = Some(truthy(&value)),
                _ => {
                    let flag = truthy(&value);
                    if node.computed_flag(kind) != flag {
                        node.computed.insert(kind, flag);
                        changed.insert(kind.as_str().to_string(), flag);
                    }
                }
            }
        }

        if let Some(flag) = active {
            if node.computed_flag(ComputedKind::Active) != flag {
                changed.insert(ComputedKind::Active.as_str().to_string(), flag);
                self.set_activity(id, false, outbox, |node| {
                    node.computed.insert(ComputedKind::Active, flag);
                });
            }
        }

        if !changed.is_empty() {
            if let Some(node) = self.arena.get(id) {
                outbox.push(&node.cascade, EventPayload::Computed(changed), EventOptions::default());
            }
        }

        if let Some(value) = derived {
            let target = (!value.is_null()).then_some(value);
            let is_active = self.arena.get(id).is_some_and(Node::is_active);
            if is_active && self.value_of(id) != target {
                self.assign(id, target, SetMode::Replace, false, false, outbox);
            }
        }
    }

    fn push_item(&mut self, id: NodeId, value: Option<Value>, outbox: &mut Outbox) -> Option<NodeId> {
        let (items, path, index) = match self.arena.get(id) {
            Some(Node {
                kind: NodeKind::Array { children },
                schema,
                path,
                ..
            }) => match &schema.shape {
                Shape::Array(shape) => (shape.items.clone(), path.clone(), children.len()),
                _ => return None,
            },
            _ => return None,
        };
        let before = self.value_of(id);

        let key = index.to_string();
        let child = self.create_node(key.clone(), child_path(&path, &key), id, items, outbox);
        if let Some(NodeKind::Array { children }) = self.arena.get_mut(id).map(|n| &mut n.kind) {
            children.push(child);
        }
        self.assign(child, value, SetMode::Replace, true, true, outbox);

        self.emit_children(id, before, vec![key], Vec::new(), outbox);
        Some(child)
    }

    fn remove_item(&mut self, id: NodeId, index: usize, outbox: &mut Outbox) -> bool {
        let before = self.value_of(id);
        let (removed, path, shifted) = match self.arena.get_mut(id) {
            Some(Node {
                kind: NodeKind::Array { children },
                path,
                ..
            }) if index < children.len() => {
                let removed = children.remove(index);
                let shifted: Vec<(usize, NodeId)> = children
                    .iter()
                    .enumerate()
                    .skip(index)
                    .map(|(i, c)| (i, *c))
                    .collect();
                (removed, path.clone(), shifted)
            }
            _ => return false,
        };
        self.destroy(removed);
        for (i, child) in shifted {
            if let Some(node) = self.arena.get_mut(child) {
                node.key = i.to_string();
            }
            self.set_paths(child, child_path(&path, &i.to_string()));
        }
        outbox.structural = true;
        self.emit_children(id, before, Vec::new(), vec![index.to_string()], outbox);
        true
    }

    fn clear_items(&mut self, id: NodeId, outbox: &mut Outbox) {
        let before = self.value_of(id);
        let removed = match self.arena.get_mut(id) {
            Some(Node {
                kind: NodeKind::Array { children },
                ..
            }) => std::mem::take(children),
            _ => return,
        };
        if removed.is_empty() {
            return;
        }
        for child in &removed {
            self.destroy(*child);
        }
        outbox.structural = true;
        let keys = (0..removed.len()).map(|i| i.to_string()).collect();
        self.emit_children(id, before, Vec::new(), keys, outbox);
    }

    fn emit_children(
        &mut self,
        id: NodeId,
        before: Option<Value>,
        added: Vec<String>,
        removed: Vec<String>,
        outbox: &mut Outbox,
    ) {
        let after = self.value_of(id);
        let Some(node) = self.arena.get(id) else {
            return;
        };
        outbox.push(
            &node.cascade,
            EventPayload::Children { added, removed },
            EventOptions::default(),
        );
        if before != after {
            outbox.push(
                &node.cascade,
                EventPayload::Value {
                    previous: before,
                    current: after,
                },
                EventOptions::default(),
            );
        }
    }
}

/// Reads node values for expressions anchored at one node.
struct TreeResolver<'a> {
    inner: &'a TreeInner,
    anchor: NodeId,
    /// Value being assigned to the anchor; `@` paths read it instead of
    /// the anchor's children.
    incoming: Option<&'a Map<String, Value>>,
}

impl<'a> TreeResolver<'a> {
    fn new(inner: &'a TreeInner, anchor: NodeId) -> Self {
        Self {
            inner,
            anchor,
            incoming: None,
        }
    }

    fn with_incoming(inner: &'a TreeInner, anchor: NodeId, incoming: &'a Map<String, Value>) -> Self {
        Self {
            inner,
            anchor,
            incoming: Some(incoming),
        }
    }
}

impl PathResolver for TreeResolver<'_> {
    fn resolve(&self, path: &NodePath) -> Option<Value> {
        if let (Some(incoming), Some(PathSegment::Current)) = (self.incoming, path.segments.first()) {
            let keys: Option<Vec<&str>> = path.segments[1..]
                .iter()
                .map(|s| match s {
                    PathSegment::Key(k) => Some(k.as_str()),
                    _ => None,
                })
                .collect();
            if let Some(keys) = keys {
                let Some((first, rest)) = keys.split_first() else {
                    return Some(Value::Object(incoming.clone()));
                };
                let mut value = incoming.get(*first)?.clone();
                for key in rest {
                    value = step(value, key)?;
                }
                return Some(value);
            }
        }

        let (node, rest) = self.inner.walk(self.anchor, path)?;
        let mut value = self.inner.value_of(node)?;
        for key in &rest {
            value = step(value, key)?;
        }
        Some(value)
    }
}

/// Navigate one key into a plain value; `length` works on arrays and strings.
fn step(value: Value, key: &str) -> Option<Value> {
    match value {
        Value::Object(mut map) => map.remove(key),
        Value::Array(mut items) => {
            if key == "length" {
                return Some(Value::from(items.len()));
            }
            let index = key.parse::<usize>().ok()?;
            (index < items.len()).then(|| items.swap_remove(index))
        }
        Value::String(s) if key == "length" => Some(Value::from(s.chars().count())),
        _ => None,
    }
}

/// Convenience handle pairing a tree with one node.
#[derive(Clone)]
pub struct NodeRef {
    tree: SchemaTree,
    id: NodeId,
}

impl NodeRef {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn tree(&self) -> &SchemaTree {
        &self.tree
    }

    fn with_node<T>(&self, f: impl FnOnce(&Node) -> T) -> Option<T> {
        self.tree.core.inner.borrow().arena.get(self.id).map(f)
    }

    /// False once the node has been removed from its tree.
    pub fn exists(&self) -> bool {
        self.tree.core.inner.borrow().arena.contains(self.id)
    }

    pub fn key(&self) -> Option<String> {
        self.with_node(|n| n.key.clone())
    }

    /// JSON Pointer from the root.
    pub fn path(&self) -> Option<String> {
        self.with_node(|n| n.path.clone())
    }

    pub fn variant(&self) -> Option<NodeVariant> {
        self.with_node(|n| n.kind.variant())
    }

    pub fn schema_type(&self) -> Option<SchemaType> {
        self.with_node(|n| n.schema.schema_type).flatten()
    }

    pub fn schema(&self) -> Option<Rc<CompiledSchema>> {
        self.with_node(|n| n.schema.clone())
    }

    pub fn value(&self) -> Option<Value> {
        self.tree.value_of(self.id)
    }

    pub fn set_value(&self, value: Value) -> Result<(), CascadeError> {
        self.tree.set_value(self.id, value, SetValueOptions::default())
    }

    pub fn set_value_with(&self, value: Value, options: SetValueOptions) -> Result<(), CascadeError> {
        self.tree.set_value(self.id, value, options)
    }

    pub fn find(&self, pointer: &str) -> Option<NodeRef> {
        self.tree.find_from(self.id, pointer)
    }

    pub fn parent(&self) -> Option<NodeRef> {
        let parent = self.with_node(|n| n.parent).flatten()?;
        Some(self.tree.node(parent))
    }

    /// Children in order, including virtual ones.
    pub fn children(&self) -> Vec<NodeRef> {
        self.with_node(|n| n.kind.child_ids())
            .unwrap_or_default()
            .into_iter()
            .map(|id| self.tree.node(id))
            .collect()
    }

    pub fn child(&self, key: &str) -> Option<NodeRef> {
        let id = self.tree.core.inner.borrow().find_child(self.id, key)?;
        Some(self.tree.node(id))
    }

    /// Keys of the children in order.
    pub fn child_keys(&self) -> Vec<String> {
        self.children().iter().filter_map(NodeRef::key).collect()
    }

    pub fn is_active(&self) -> bool {
        self.with_node(Node::is_active).unwrap_or(false)
    }

    pub fn is_visible(&self) -> bool {
        self.flag(ComputedKind::Visible)
    }

    pub fn is_read_only(&self) -> bool {
        self.flag(ComputedKind::ReadOnly)
    }

    pub fn is_disabled(&self) -> bool {
        self.flag(ComputedKind::Disabled)
    }

    fn flag(&self, kind: ComputedKind) -> bool {
        self.with_node(|n| n.computed_flag(kind)).unwrap_or(false)
    }

    /// Whether the parent's condition index currently requires this field.
    pub fn is_required(&self) -> bool {
        let Some((key, parent)) = self.with_node(|n| (n.key.clone(), n.parent)) else {
            return false;
        };
        let Some(parent) = parent else {
            return false;
        };
        let inner = self.tree.core.inner.borrow();
        let Some(parent_node) = inner.arena.get(parent) else {
            return false;
        };
        let Some(conditions) = parent_node.schema.object().and_then(|s| s.conditions.as_ref()) else {
            return false;
        };
        match conditions.get(&key) {
            Some(FieldCondition::Always) => true,
            Some(FieldCondition::AnyOf(_)) => {
                let raw = inner.raw_object(parent);
                let is_required = required_factory(&raw, conditions)(&key);
                is_required
            }
            None => false,
        }
    }

    pub fn errors(&self) -> Option<Vec<JsonSchemaError>> {
        self.tree.errors(self.id)
    }

    pub fn clear_errors(&self) -> Result<(), CascadeError> {
        self.tree.clear_errors(self.id)
    }

    pub fn state(&self) -> BTreeMap<String, bool> {
        self.tree.state(self.id)
    }

    pub fn set_state(&self, key: &str, value: bool) -> Result<(), CascadeError> {
        self.tree.set_state(self.id, key, value)
    }

    pub fn clear_state(&self) -> Result<(), CascadeError> {
        self.tree.clear_state(self.id)
    }

    pub fn subscribe(&self, listener: impl Fn(&NodeEvents) + 'static) -> Option<Subscription> {
        self.tree.subscribe(self.id, listener)
    }

    pub fn dispatch(&self, payload: EventPayload, options: EventOptions) -> Result<(), CascadeError> {
        self.tree.dispatch(self.id, payload, options)
    }

    pub fn push(&self, value: Option<Value>) -> Result<Option<NodeRef>, CascadeError> {
        Ok(self.tree.push(self.id, value)?.map(|id| self.tree.node(id)))
    }

    pub fn remove(&self, index: usize) -> Result<bool, CascadeError> {
        self.tree.remove(self.id, index)
    }

    pub fn clear(&self) -> Result<(), CascadeError> {
        self.tree.clear(self.id)
    }
}

impl fmt::Debug for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeRef")
            .field("id", &self.id)
            .field("path", &self.path())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn coerce_terminal_rules() {
        assert_eq!(coerce_terminal(Some(SchemaType::String), Some(json!("a"))), Some(json!("a")));
        assert_eq!(coerce_terminal(Some(SchemaType::String), Some(json!({}))), None);
        assert_eq!(coerce_terminal(Some(SchemaType::String), Some(Value::Null)), None);
        assert_eq!(coerce_terminal(Some(SchemaType::Null), Some(Value::Null)), Some(Value::Null));
        assert_eq!(coerce_terminal(None, Some(json!([1]))), Some(json!([1])));
    }

    #[test]
    fn step_navigates_values() {
        assert_eq!(step(json!({ "a": 1 }), "a"), Some(json!(1)));
        assert_eq!(step(json!([1, 2, 3]), "length"), Some(json!(3)));
        assert_eq!(step(json!([1, 2, 3]), "1"), Some(json!(2)));
        assert_eq!(step(json!("abc"), "length"), Some(json!(3)));
        assert_eq!(step(json!(1), "a"), None);
    }

    #[test]
    fn builds_defaults() {
        let tree = SchemaTree::new(
            &json!({
                "type": "object",
                "properties": {
                    "name": { "type": "string", "default": "anon" },
                    "tags": { "type": "array", "items": { "type": "string" }, "default": ["a"] }
                }
            }),
            None,
        )
        .unwrap();
        assert_eq!(tree.value(), Some(json!({ "name": "anon", "tags": ["a"] })));
        assert_eq!(tree.node_count(), 4);
    }

    #[test]
    fn initial_value_overrides_defaults() {
        let tree = SchemaTree::new(
            &json!({
                "type": "object",
                "properties": { "name": { "type": "string", "default": "anon" } }
            }),
            Some(json!({ "name": "bob", "extra": 1 })),
        )
        .unwrap();
        assert_eq!(tree.value(), Some(json!({ "name": "bob", "extra": 1 })));
    }

    #[test]
    fn resolver_reads_incoming_for_current_paths() {
        let tree = SchemaTree::new(
            &json!({ "type": "object", "properties": { "kind": { "type": "string" } } }),
            Some(json!({ "kind": "a" })),
        )
        .unwrap();
        let inner = tree.core.inner.borrow();
        let incoming = json!({ "kind": "b", "list": [1, 2] });
        let incoming = incoming.as_object().unwrap();
        let resolver = TreeResolver::with_incoming(&inner, inner.root, incoming);
        assert_eq!(resolver.resolve(&NodePath::parse_pointer("kind")), Some(json!("b")));

        let at = crate::expression::Expression::parse("@.list.length === 2").unwrap();
        assert!(at.test(&resolver));

        let plain = TreeResolver::new(&inner, inner.root);
        assert_eq!(plain.resolve(&NodePath::parse_pointer("kind")), Some(json!("a")));
    }
}
