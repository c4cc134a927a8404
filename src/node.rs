//! Node storage - a generational arena of live nodes.
//!
//! Parents own their children through [`NodeId`] handles; the back-reference
//! to the parent is a handle too. Freed slots go to a free pool and bump
//! their generation, so a stale handle never aliases a newer node.

use std::collections::BTreeMap;
use std::rc::Rc;

use serde_json::{Map, Value};

use crate::error::JsonSchemaError;
use crate::event::EventCascade;
use crate::schema::{CompiledSchema, ComputedKind};

/// Handle to a node in a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

/// Where an object child comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildOrigin {
    /// Declared on the object itself (including conditional branches).
    Property,
    /// Declared only by the `oneOf` branch at this index.
    Branch(usize),
    /// `virtual` group over sibling fields.
    Virtual,
}

#[derive(Debug, Clone)]
pub struct ChildEntry {
    pub key: String,
    pub id: NodeId,
    pub origin: ChildOrigin,
}

#[derive(Debug)]
pub enum NodeKind {
    Object {
        children: Vec<ChildEntry>,
        /// Selected `oneOf` branch.
        branch: Option<usize>,
        /// Keys without a child node, passed through as-is.
        extra: Map<String, Value>,
    },
    Array {
        children: Vec<NodeId>,
    },
    Terminal {
        value: Option<Value>,
    },
    Virtual {
        fields: Vec<String>,
    },
}

/// Variant tag of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeVariant {
    Object,
    Array,
    Terminal,
    Virtual,
}

impl NodeKind {
    pub fn variant(&self) -> NodeVariant {
        match self {
            NodeKind::Object { .. } => NodeVariant::Object,
            NodeKind::Array { .. } => NodeVariant::Array,
            NodeKind::Terminal { .. } => NodeVariant::Terminal,
            NodeKind::Virtual { .. } => NodeVariant::Virtual,
        }
    }

    /// Child handles in order; empty for terminal and virtual nodes.
    pub fn child_ids(&self) -> Vec<NodeId> {
        match self {
            NodeKind::Object { children, .. } => children.iter().map(|c| c.id).collect(),
            NodeKind::Array { children } => children.clone(),
            NodeKind::Terminal { .. } | NodeKind::Virtual { .. } => Vec::new(),
        }
    }
}

#[derive(Debug)]
pub struct Node {
    /// Property key or array index; empty for the root.
    pub key: String,
    /// JSON Pointer from the root; the root is `""`.
    pub path: String,
    pub parent: Option<NodeId>,
    pub schema: Rc<CompiledSchema>,
    pub kind: NodeKind,
    pub errors: Option<Vec<JsonSchemaError>>,
    pub state: BTreeMap<String, bool>,
    /// Last evaluated computed flags.
    pub computed: BTreeMap<ComputedKind, bool>,
    /// Set by the parent's condition index.
    pub condition_active: bool,
    pub cascade: Rc<EventCascade>,
}

impl Node {
    pub fn new(
        key: String,
        path: String,
        parent: Option<NodeId>,
        schema: Rc<CompiledSchema>,
        kind: NodeKind,
        cascade: Rc<EventCascade>,
    ) -> Self {
        Self {
            key,
            path,
            parent,
            schema,
            kind,
            errors: None,
            state: BTreeMap::new(),
            computed: BTreeMap::new(),
            condition_active: true,
            cascade,
        }
    }

    pub fn computed_flag(&self, kind: ComputedKind) -> bool {
        self.computed
            .get(&kind)
            .copied()
            .unwrap_or_else(|| self.schema.static_flag(kind))
    }

    /// Active nodes contribute to their parent's value.
    pub fn is_active(&self) -> bool {
        self.condition_active && self.computed_flag(ComputedKind::Active)
    }
}

struct Slot {
    generation: u32,
    node: Option<Node>,
}

#[derive(Default)]
pub struct Arena {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl Arena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, node: Node) -> NodeId {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.node = Some(node);
            return NodeId {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            node: Some(node),
        });
        NodeId {
            index,
            generation: 0,
        }
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_ref())
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_mut())
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.get(id).is_some()
    }

    /// Take the node out and recycle its slot.
    pub fn remove(&mut self, id: NodeId) -> Option<Node> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let node = slot.node.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        Some(node)
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.node.as_ref().map(|node| {
                (
                    NodeId {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    node,
                )
            })
        })
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena").field("len", &self.len()).finish()
    }
}
