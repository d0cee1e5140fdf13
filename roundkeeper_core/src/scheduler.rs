//! Cancellable scheduled tasks, polled from the host's update loop.
//!
//! Nothing here sleeps. The host calls [`Scheduler::poll_due`] every update
//! with the session clock; due tasks come back in due-time order (ties in
//! scheduling order) together with the instant they were due, so a chained
//! delay ("revive 3 s after the countdown hit zero") is measured from the
//! due instant rather than from whenever the update happened to run.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// Handle for a scheduled task; keep it to be able to cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

/// A task that came due.
#[derive(Debug, Clone, PartialEq)]
pub struct DueTask<T> {
    pub handle: TimerHandle,
    pub due_at: Duration,
    pub task: T,
}

/// Single-threaded timer wheel keyed by due time.
#[derive(Debug)]
pub struct Scheduler<T> {
    next_handle: u64,
    pending: BTreeMap<(Duration, u64), T>,
    due_at: HashMap<u64, Duration>,
}

impl<T> Scheduler<T> {
    /// Creates an empty scheduler.
    pub fn new() -> Self {
        Self {
            next_handle: 0,
            pending: BTreeMap::new(),
            due_at: HashMap::new(),
        }
    }

    /// Schedules `task` to run `after` from `now`.
    pub fn schedule(&mut self, now: Duration, after: Duration, task: T) -> TimerHandle {
        let id = self.next_handle;
        self.next_handle += 1;

        let due = now.saturating_add(after);
        self.pending.insert((due, id), task);
        self.due_at.insert(id, due);
        TimerHandle(id)
    }

    /// Cancels a pending task. Returns false if it already fired or was cancelled.
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        match self.due_at.remove(&handle.0) {
            Some(due) => self.pending.remove(&(due, handle.0)).is_some(),
            None => false,
        }
    }

    /// Returns true while `handle` has neither fired nor been cancelled.
    pub fn is_pending(&self, handle: TimerHandle) -> bool {
        self.due_at.contains_key(&handle.0)
    }

    /// When `handle` is due, if pending.
    pub fn due_time(&self, handle: TimerHandle) -> Option<Duration> {
        self.due_at.get(&handle.0).copied()
    }

    /// Removes and returns the earliest task due at or before `now`.
    ///
    /// Pop one at a time so tasks scheduled by a firing task are seen by the
    /// same poll loop.
    pub fn pop_due(&mut self, now: Duration) -> Option<DueTask<T>> {
        let (&(due, id), _) = self.pending.iter().next()?;
        if due > now {
            return None;
        }
        let task = self.pending.remove(&(due, id))?;
        self.due_at.remove(&id);
        Some(DueTask {
            handle: TimerHandle(id),
            due_at: due,
            task,
        })
    }

    /// Removes and returns every task due at or before `now`.
    pub fn poll_due(&mut self, now: Duration) -> Vec<DueTask<T>> {
        let mut due = Vec::new();
        while let Some(task) = self.pop_due(now) {
            due.push(task);
        }
        due
    }

    /// Earliest pending due time.
    pub fn next_due(&self) -> Option<Duration> {
        self.pending.keys().next().map(|(due, _)| *due)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl<T> Default for Scheduler<T> {
    fn default() -> Self {
        Self::new()
    }
}
