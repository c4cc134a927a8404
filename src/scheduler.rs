//! Cooperative task scheduling for cascade delivery.
//!
//! Microtasks resolve event batches; macrotasks reset the loop counters of
//! nodes that went busy. [`TaskQueue`] is a deterministic single-threaded
//! implementation: every pending microtask drains before the next macrotask
//! runs.

use std::cell::RefCell;
use std::collections::VecDeque;

use crate::error::CascadeError;

/// Deferred unit of work. A task failing aborts the current drain.
pub type Task = Box<dyn FnOnce() -> Result<(), CascadeError>>;

/// Host hook for deferring work.
pub trait Scheduler {
    /// Run `task` after the current synchronous mutation, before any macrotask.
    fn schedule_microtask(&self, task: Task);

    /// Run `task` once every pending microtask has drained.
    fn schedule_macrotask(&self, task: Task);
}

#[derive(Default)]
pub struct TaskQueue {
    microtasks: RefCell<VecDeque<Task>>,
    macrotasks: RefCell<VecDeque<Task>>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_microtasks(&self) -> usize {
        self.microtasks.borrow().len()
    }

    pub fn pending_macrotasks(&self) -> usize {
        self.macrotasks.borrow().len()
    }

    pub fn is_idle(&self) -> bool {
        self.pending_microtasks() == 0 && self.pending_macrotasks() == 0
    }

    /// Drain microtasks, including ones scheduled while draining.
    ///
    /// Returns how many ran.
    ///
    /// # Errors
    ///
    /// Stops at the first failing task, discards the remaining microtasks and
    /// returns its error. Pending macrotasks are kept.
    pub fn run_microtasks(&self) -> Result<usize, CascadeError> {
        let mut ran = 0;
        loop {
            let Some(task) = self.microtasks.borrow_mut().pop_front() else {
                break;
            };
            ran += 1;
            if let Err(err) = task() {
                let dropped = self.microtasks.borrow_mut().drain(..).count();
                tracing::warn!(error = %err, dropped, "microtask failed");
                return Err(err);
            }
        }
        Ok(ran)
    }

    /// Run the oldest pending macrotask, if any.
    pub fn run_macrotask(&self) -> Result<bool, CascadeError> {
        let Some(task) = self.macrotasks.borrow_mut().pop_front() else {
            return Ok(false);
        };
        task()?;
        Ok(true)
    }

    /// Alternate microtask drains and single macrotasks until both queues
    /// are empty.
    pub fn run_until_idle(&self) -> Result<(), CascadeError> {
        loop {
            self.run_microtasks()?;
            if !self.run_macrotask()? {
                return Ok(());
            }
        }
    }
}

impl Scheduler for TaskQueue {
    fn schedule_microtask(&self, task: Task) {
        self.microtasks.borrow_mut().push_back(task);
    }

    fn schedule_macrotask(&self, task: Task) {
        self.macrotasks.borrow_mut().push_back(task);
    }
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("microtasks", &self.pending_microtasks())
            .field("macrotasks", &self.pending_macrotasks())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    fn recorder() -> (Rc<RefCell<Vec<&'static str>>>, impl Fn(&'static str) -> Task) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let make = {
            let log = log.clone();
            move |name: &'static str| -> Task {
                let log = log.clone();
                Box::new(move || {
                    log.borrow_mut().push(name);
                    Ok(())
                })
            }
        };
        (log, make)
    }

    #[test]
    fn microtasks_drain_before_macrotasks() {
        let queue = TaskQueue::new();
        let (log, task) = recorder();
        queue.schedule_macrotask(task("macro"));
        queue.schedule_microtask(task("micro-1"));
        queue.schedule_microtask(task("micro-2"));

        queue.run_until_idle().unwrap();
        assert_eq!(*log.borrow(), vec!["micro-1", "micro-2", "macro"]);
        assert!(queue.is_idle());
    }

    #[test]
    fn microtasks_scheduled_while_draining_run_in_same_drain() {
        let queue = Rc::new(TaskQueue::new());
        let (log, task) = recorder();
        let inner = task("nested");
        let q = queue.clone();
        queue.schedule_microtask(Box::new(move || {
            q.schedule_microtask(inner);
            Ok(())
        }));

        assert_eq!(queue.run_microtasks().unwrap(), 2);
        assert_eq!(*log.borrow(), vec!["nested"]);
    }

    #[test]
    fn failure_discards_pending_microtasks() {
        let queue = TaskQueue::new();
        let (log, task) = recorder();
        queue.schedule_microtask(Box::new(|| {
            Err(CascadeError::InfiniteLoopDetected {
                path: "/a".into(),
                dependencies: vec![],
                batches: 51,
            })
        }));
        queue.schedule_microtask(task("skipped"));
        queue.schedule_macrotask(task("kept"));

        assert!(queue.run_until_idle().is_err());
        assert_eq!(queue.pending_microtasks(), 0);
        assert_eq!(queue.pending_macrotasks(), 1);
        assert!(log.borrow().is_empty());
    }
}
