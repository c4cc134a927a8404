//! Per-node change notification with batching and loop detection.
//!
//! Every node owns one [`EventCascade`]. `publish` calls made during one
//! synchronous mutation land in a single batch; a microtask later merges the
//! batch (one event per type) and hands it to every listener once.
//!
//! Each batch opened by a non-propagated publish counts toward a per-node
//! limit. The counter resets in a macrotask scheduled when the node turns
//! busy, so a cascade that keeps re-opening batches without ever yielding to
//! a macrotask fails with [`CascadeError::InfiniteLoopDetected`].

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::rc::{Rc, Weak};

use serde::Serialize;
use serde_json::Value;

use crate::error::{display_path, CascadeError, JsonSchemaError};
use crate::scheduler::Scheduler;

/// Batches a node may open within one idle window.
pub const DEFAULT_LOOP_THRESHOLD: u32 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum NodeEventType {
    UpdateValue,
    UpdateState,
    UpdateErrors,
    UpdateChildren,
    UpdateComputed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    Value {
        previous: Option<Value>,
        current: Option<Value>,
    },
    State(BTreeMap<String, bool>),
    Errors(Vec<JsonSchemaError>),
    Children {
        added: Vec<String>,
        removed: Vec<String>,
    },
    Computed(BTreeMap<String, bool>),
}

impl EventPayload {
    pub fn event_type(&self) -> NodeEventType {
        match self {
            EventPayload::Value { .. } => NodeEventType::UpdateValue,
            EventPayload::State(_) => NodeEventType::UpdateState,
            EventPayload::Errors(_) => NodeEventType::UpdateErrors,
            EventPayload::Children { .. } => NodeEventType::UpdateChildren,
            EventPayload::Computed(_) => NodeEventType::UpdateComputed,
        }
    }

    /// Fold a later payload of the same type into this one.
    fn merge(&mut self, later: EventPayload) {
        match (self, later) {
            (EventPayload::Value { current, .. }, EventPayload::Value { current: next, .. }) => {
                *current = next;
            }
            (EventPayload::State(map), EventPayload::State(next))
            | (EventPayload::Computed(map), EventPayload::Computed(next)) => map.extend(next),
            (this, later) => *this = later,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventOptions {
    /// Raised on an ancestor or descendant because of a change elsewhere.
    pub propagated: bool,
}

impl EventOptions {
    pub fn propagated() -> Self {
        Self { propagated: true }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeEvent {
    pub payload: EventPayload,
    pub options: EventOptions,
}

impl NodeEvent {
    pub fn event_type(&self) -> NodeEventType {
        self.payload.event_type()
    }
}

/// Merged events of one batch, one per type, in order of first publish.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeEvents {
    events: Vec<NodeEvent>,
}

impl NodeEvents {
    fn merge(entries: Vec<NodeEvent>) -> Self {
        let mut events: Vec<NodeEvent> = Vec::new();
        for entry in entries {
            match events
                .iter_mut()
                .find(|e| e.event_type() == entry.event_type())
            {
                Some(existing) => {
                    existing.options.propagated &= entry.options.propagated;
                    existing.payload.merge(entry.payload);
                }
                None => events.push(entry),
            }
        }
        Self { events }
    }

    pub fn single(payload: EventPayload, options: EventOptions) -> Self {
        Self {
            events: vec![NodeEvent { payload, options }],
        }
    }

    pub fn get(&self, event_type: NodeEventType) -> Option<&NodeEvent> {
        self.events.iter().find(|e| e.event_type() == event_type)
    }

    pub fn contains(&self, event_type: NodeEventType) -> bool {
        self.get(event_type).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeEvent> {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

pub type Listener = Rc<dyn Fn(&NodeEvents) -> Result<(), CascadeError>>;

#[derive(Default)]
struct CascadeState {
    /// Entries of the open batch; `None` once resolved.
    batch: Option<Vec<NodeEvent>>,
    busy: bool,
    batch_count: u32,
}

pub struct EventCascade {
    path: RefCell<String>,
    dependencies: RefCell<Vec<String>>,
    threshold: u32,
    scheduler: Rc<dyn Scheduler>,
    state: RefCell<CascadeState>,
    listeners: RefCell<Vec<(u64, Listener)>>,
    next_id: Cell<u64>,
    cleanups: RefCell<Vec<Box<dyn FnOnce()>>>,
}

impl EventCascade {
    pub fn new(path: impl Into<String>, scheduler: Rc<dyn Scheduler>, threshold: u32) -> Rc<Self> {
        Rc::new(Self {
            path: RefCell::new(path.into()),
            dependencies: RefCell::new(Vec::new()),
            threshold,
            scheduler,
            state: RefCell::new(CascadeState::default()),
            listeners: RefCell::new(Vec::new()),
            next_id: Cell::new(0),
            cleanups: RefCell::new(Vec::new()),
        })
    }

    pub fn path(&self) -> String {
        self.path.borrow().clone()
    }

    pub fn set_path(&self, path: impl Into<String>) {
        *self.path.borrow_mut() = path.into();
    }

    pub fn dependencies(&self) -> Vec<String> {
        self.dependencies.borrow().clone()
    }

    pub fn set_dependencies(&self, dependencies: Vec<String>) {
        *self.dependencies.borrow_mut() = dependencies;
    }

    /// Batches opened in the current idle window.
    pub fn batch_count(&self) -> u32 {
        self.state.borrow().batch_count
    }

    /// Queue an event for the next flush.
    ///
    /// # Errors
    ///
    /// Returns `CascadeError::InfiniteLoopDetected` when opening this batch
    /// exceeds the loop threshold; the batch is discarded.
    pub fn publish(
        self: &Rc<Self>,
        payload: EventPayload,
        options: EventOptions,
    ) -> Result<(), CascadeError> {
        let event = NodeEvent { payload, options };
        let mut state = self.state.borrow_mut();
        if let Some(batch) = state.batch.as_mut() {
            batch.push(event);
            return Ok(());
        }

        if !options.propagated {
            state.batch_count += 1;
        }
        if state.batch_count > self.threshold {
            let batches = state.batch_count;
            drop(state);
            let path = self.path();
            let dependencies = self.dependencies();
            tracing::warn!(
                path = %display_path(&path),
                ?dependencies,
                batches,
                "infinite loop detected"
            );
            return Err(CascadeError::InfiniteLoopDetected {
                path,
                dependencies,
                batches,
            });
        }

        state.batch = Some(vec![event]);
        let went_busy = !state.busy;
        state.busy = true;
        drop(state);

        if went_busy {
            let weak = Rc::downgrade(self);
            self.scheduler.schedule_macrotask(Box::new(move || {
                if let Some(cascade) = weak.upgrade() {
                    cascade.reset();
                }
                Ok(())
            }));
        }

        let weak = Rc::downgrade(self);
        self.scheduler.schedule_microtask(Box::new(move || match weak.upgrade() {
            Some(cascade) => cascade.flush(),
            None => Ok(()),
        }));
        Ok(())
    }

    /// Deliver immediately, bypassing batching.
    pub fn dispatch(&self, payload: EventPayload, options: EventOptions) -> Result<(), CascadeError> {
        self.deliver(&NodeEvents::single(payload, options))
    }

    fn flush(&self) -> Result<(), CascadeError> {
        let Some(entries) = self.state.borrow_mut().batch.take() else {
            return Ok(());
        };
        let events = NodeEvents::merge(entries);
        tracing::debug!(
            path = %display_path(&self.path.borrow()),
            events = events.len(),
            "flushing batch"
        );
        self.deliver(&events)
    }

    fn deliver(&self, events: &NodeEvents) -> Result<(), CascadeError> {
        let listeners: Vec<Listener> = self
            .listeners
            .borrow()
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            listener(events)?;
        }
        Ok(())
    }

    fn reset(&self) {
        let mut state = self.state.borrow_mut();
        state.busy = false;
        state.batch_count = 0;
    }

    /// Register a listener for merged batches.
    pub fn subscribe(self: &Rc<Self>, listener: impl Fn(&NodeEvents) + 'static) -> Subscription {
        self.subscribe_fallible(Rc::new(move |events: &NodeEvents| {
            listener(events);
            Ok(())
        }))
    }

    /// Register a listener whose errors abort the current drain.
    pub fn subscribe_fallible(self: &Rc<Self>, listener: Listener) -> Subscription {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        self.listeners.borrow_mut().push((id, listener));
        Subscription {
            cascade: Rc::downgrade(self),
            id,
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.borrow().len()
    }

    /// Register a teardown to run on [`EventCascade::clean_up`] or
    /// [`EventCascade::release_dependencies`].
    pub fn add_cleanup(&self, cleanup: impl FnOnce() + 'static) {
        self.cleanups.borrow_mut().push(Box::new(cleanup));
    }

    /// Run and clear every dependency teardown, keeping listeners.
    pub fn release_dependencies(&self) {
        let cleanups = std::mem::take(&mut *self.cleanups.borrow_mut());
        for cleanup in cleanups {
            cleanup();
        }
        self.dependencies.borrow_mut().clear();
    }

    /// Drop all listeners and dependency subscriptions.
    pub fn clean_up(&self) {
        self.listeners.borrow_mut().clear();
        self.release_dependencies();
        self.state.borrow_mut().batch = None;
    }
}

impl fmt::Debug for EventCascade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventCascade")
            .field("path", &self.path.borrow())
            .field("listeners", &self.listener_count())
            .field("batch_count", &self.batch_count())
            .finish()
    }
}

/// Handle returned by `subscribe`.
#[derive(Debug, Clone)]
pub struct Subscription {
    cascade: Weak<EventCascade>,
    id: u64,
}

impl Subscription {
    /// Remove the listener. A batch already being delivered still reaches it.
    pub fn unsubscribe(&self) {
        if let Some(cascade) = self.cascade.upgrade() {
            cascade.listeners.borrow_mut().retain(|(id, _)| *id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::TaskQueue;
    use serde_json::json;

    fn cascade(queue: &Rc<TaskQueue>) -> Rc<EventCascade> {
        EventCascade::new("/a", queue.clone(), DEFAULT_LOOP_THRESHOLD)
    }

    fn value(previous: i64, current: i64) -> EventPayload {
        EventPayload::Value {
            previous: Some(json!(previous)),
            current: Some(json!(current)),
        }
    }

    fn recorder(cascade: &Rc<EventCascade>) -> Rc<RefCell<Vec<NodeEvents>>> {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        cascade.subscribe(move |events| sink.borrow_mut().push(events.clone()));
        seen
    }

    #[test]
    fn publishes_in_one_tick_merge_into_one_delivery() {
        let queue = Rc::new(TaskQueue::new());
        let cascade = cascade(&queue);
        let seen = recorder(&cascade);

        for i in 0..5 {
            cascade.publish(value(i, i + 1), EventOptions::default()).unwrap();
        }
        assert!(seen.borrow().is_empty());

        queue.run_microtasks().unwrap();
        let seen = seen.borrow();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].len(), 1);
        assert_eq!(
            seen[0].get(NodeEventType::UpdateValue).unwrap().payload,
            value(0, 5)
        );
    }

    #[test]
    fn different_types_share_a_batch() {
        let queue = Rc::new(TaskQueue::new());
        let cascade = cascade(&queue);
        let seen = recorder(&cascade);

        cascade
            .publish(EventPayload::State(BTreeMap::from([("dirty".into(), true)])), EventOptions::default())
            .unwrap();
        cascade.publish(value(1, 2), EventOptions::default()).unwrap();
        cascade
            .publish(EventPayload::State(BTreeMap::from([("touched".into(), true)])), EventOptions::default())
            .unwrap();
        queue.run_microtasks().unwrap();

        let seen = seen.borrow();
        assert_eq!(seen.len(), 1);
        let events = &seen[0];
        assert_eq!(events.len(), 2);
        let types: Vec<NodeEventType> = events.iter().map(NodeEvent::event_type).collect();
        assert_eq!(types, vec![NodeEventType::UpdateState, NodeEventType::UpdateValue]);
        assert_eq!(
            events.get(NodeEventType::UpdateState).unwrap().payload,
            EventPayload::State(BTreeMap::from([("dirty".into(), true), ("touched".into(), true)]))
        );
    }

    #[test]
    fn dispatch_is_synchronous() {
        let queue = Rc::new(TaskQueue::new());
        let cascade = cascade(&queue);
        let seen = recorder(&cascade);
        cascade.dispatch(value(0, 1), EventOptions::default()).unwrap();
        assert_eq!(seen.borrow().len(), 1);
        assert!(queue.is_idle());
    }

    #[test]
    fn loop_detection_after_threshold() {
        let queue = Rc::new(TaskQueue::new());
        let cascade = EventCascade::new("/a", queue.clone(), 3);
        cascade.set_dependencies(vec!["/b".into()]);

        for i in 0..3 {
            cascade.publish(value(i, i + 1), EventOptions::default()).unwrap();
            queue.run_microtasks().unwrap();
        }
        let err = cascade.publish(value(3, 4), EventOptions::default()).unwrap_err();
        let CascadeError::InfiniteLoopDetected { path, dependencies, batches } = err;
        assert_eq!(path, "/a");
        assert_eq!(dependencies, vec!["/b".to_string()]);
        assert_eq!(batches, 4);
    }

    #[test]
    fn macrotask_resets_counter() {
        let queue = Rc::new(TaskQueue::new());
        let cascade = EventCascade::new("/a", queue.clone(), 3);
        for round in 0..3 {
            for i in 0..3 {
                cascade.publish(value(i, round), EventOptions::default()).unwrap();
                queue.run_microtasks().unwrap();
            }
            queue.run_until_idle().unwrap();
            assert_eq!(cascade.batch_count(), 0);
        }
    }

    #[test]
    fn propagated_batches_are_not_counted() {
        let queue = Rc::new(TaskQueue::new());
        let cascade = EventCascade::new("/a", queue.clone(), 1);
        for i in 0..10 {
            cascade.publish(value(i, i + 1), EventOptions::propagated()).unwrap();
            queue.run_microtasks().unwrap();
        }
        assert_eq!(cascade.batch_count(), 0);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let queue = Rc::new(TaskQueue::new());
        let cascade = cascade(&queue);
        let calls = Rc::new(Cell::new(0));
        let counter = calls.clone();
        let sub = cascade.subscribe(move |_| counter.set(counter.get() + 1));

        cascade.publish(value(0, 1), EventOptions::default()).unwrap();
        queue.run_microtasks().unwrap();
        sub.unsubscribe();
        cascade.publish(value(1, 2), EventOptions::default()).unwrap();
        queue.run_microtasks().unwrap();
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn listener_removed_mid_delivery_still_sees_batch() {
        let queue = Rc::new(TaskQueue::new());
        let cascade = cascade(&queue);
        let calls = Rc::new(Cell::new(0));

        let late: Rc<RefCell<Option<Subscription>>> = Rc::new(RefCell::new(None));
        let late_handle = late.clone();
        cascade.subscribe(move |_| {
            if let Some(sub) = late_handle.borrow().as_ref() {
                sub.unsubscribe();
            }
        });
        let counter = calls.clone();
        *late.borrow_mut() = Some(cascade.subscribe(move |_| counter.set(counter.get() + 1)));

        cascade.publish(value(0, 1), EventOptions::default()).unwrap();
        queue.run_microtasks().unwrap();
        assert_eq!(calls.get(), 1);
        assert_eq!(cascade.listener_count(), 1);
    }

    #[test]
    fn clean_up_runs_teardowns() {
        let queue = Rc::new(TaskQueue::new());
        let cascade = cascade(&queue);
        let released = Rc::new(Cell::new(false));
        let flag = released.clone();
        cascade.add_cleanup(move || flag.set(true));
        let _ = recorder(&cascade);

        cascade.clean_up();
        assert!(released.get());
        assert_eq!(cascade.listener_count(), 0);
    }

    #[test]
    fn dropped_cascade_skips_flush() {
        let queue = Rc::new(TaskQueue::new());
        let cascade = cascade(&queue);
        cascade.publish(value(0, 1), EventOptions::default()).unwrap();
        drop(cascade);
        assert!(queue.run_until_idle().is_ok());
    }
}
