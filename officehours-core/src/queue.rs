// ABOUTME: A single help queue: FIFO waiting list, notification group, auto-clear policy.
// ABOUTME: Pure synchronous state; Server wraps these calls with events and persistence.

use crate::error::QueueError;
use crate::ids::{MemberId, QueueId};
use crate::snapshot::{QueueSnapshot, WaitingEntry};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::time::Duration;
use tokio::task::JoinHandle;

/// A student waiting for help in one queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Waiter {
    pub actor_id: MemberId,
    pub queue_id: QueueId,
    pub wait_start: DateTime<Utc>,
}

impl Waiter {
    pub fn entry(&self) -> WaitingEntry {
        WaitingEntry {
            actor_id: self.actor_id.clone(),
            wait_start: self.wait_start,
        }
    }
}

/// Handle to an armed auto-clear timer task.
///
/// Dropping the handle does not cancel the task; `Queue` aborts it explicitly
/// whenever a new timer replaces it or the policy is turned off.
#[derive(Debug)]
pub struct AutoClearTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

impl AutoClearTimer {
    pub fn new(generation: u64, handle: JoinHandle<()>) -> Self {
        Self { generation, handle }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn cancel(self) {
        self.handle.abort();
    }
}

#[derive(Debug)]
pub struct Queue {
    id: QueueId,
    topic_name: String,
    parent_group_id: String,
    waiting: VecDeque<Waiter>,
    notify_group: BTreeSet<MemberId>,
    auto_clear_timeout: Option<Duration>,
    last_closed_at: Option<DateTime<Utc>>,
    open: bool,
    timer: Option<AutoClearTimer>,
}

impl Queue {
    pub fn new(topic_name: impl Into<String>, parent_group_id: impl Into<String>) -> Self {
        let parent_group_id = parent_group_id.into();
        Self {
            id: QueueId::new(parent_group_id.clone()),
            topic_name: topic_name.into(),
            parent_group_id,
            waiting: VecDeque::new(),
            notify_group: BTreeSet::new(),
            auto_clear_timeout: None,
            last_closed_at: None,
            open: false,
            timer: None,
        }
    }

    pub fn id(&self) -> &QueueId {
        &self.id
    }

    pub fn topic_name(&self) -> &str {
        &self.topic_name
    }

    pub fn parent_group_id(&self) -> &str {
        &self.parent_group_id
    }

    /// Waiters in service order
    pub fn students(&self) -> impl Iterator<Item = &Waiter> {
        self.waiting.iter()
    }

    pub fn len(&self) -> usize {
        self.waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }

    pub fn contains(&self, actor: &MemberId) -> bool {
        self.waiting.iter().any(|w| &w.actor_id == actor)
    }

    /// Zero-based position in line
    pub fn position_of(&self, actor: &MemberId) -> Option<usize> {
        self.waiting.iter().position(|w| &w.actor_id == actor)
    }

    pub fn notify_group(&self) -> &BTreeSet<MemberId> {
        &self.notify_group
    }

    pub fn auto_clear_timeout(&self) -> Option<Duration> {
        self.auto_clear_timeout
    }

    pub fn last_closed_at(&self) -> Option<DateTime<Utc>> {
        self.last_closed_at
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn enqueue(&mut self, actor: MemberId, now: DateTime<Utc>) -> Result<Waiter, QueueError> {
        if self.contains(&actor) {
            return Err(QueueError::AlreadyInQueue {
                member: actor,
                queue: self.id.clone(),
            });
        }
        let waiter = Waiter {
            actor_id: actor,
            queue_id: self.id.clone(),
            wait_start: now,
        };
        self.waiting.push_back(waiter.clone());
        Ok(waiter)
    }

    pub fn dequeue_first(&mut self) -> Result<Waiter, QueueError> {
        self.waiting.pop_front().ok_or_else(|| QueueError::QueueEmpty {
            queue: self.id.clone(),
        })
    }

    pub fn dequeue_specific(&mut self, actor: &MemberId) -> Result<Waiter, QueueError> {
        self.take(actor).ok_or_else(|| QueueError::NotInQueue {
            member: actor.clone(),
            queue: self.id.clone(),
        })
    }

    /// Voluntary leave. Leaving a queue you are not in is not an error.
    pub fn remove(&mut self, actor: &MemberId) -> Option<Waiter> {
        self.take(actor)
    }

    /// Empty the waiting list, returning everyone who was removed
    pub fn clear(&mut self) -> Vec<Waiter> {
        self.waiting.drain(..).collect()
    }

    /// Returns true if the member was newly added
    pub fn add_to_notify_group(&mut self, actor: MemberId) -> bool {
        self.notify_group.insert(actor)
    }

    /// Returns true if the member was present
    pub fn remove_from_notify_group(&mut self, actor: &MemberId) -> bool {
        self.notify_group.remove(actor)
    }

    /// Change the auto-clear policy. Turning it off cancels any armed timer.
    pub fn set_auto_clear_timeout(&mut self, timeout: Option<Duration>) {
        self.auto_clear_timeout = timeout;
        if timeout.is_none() {
            self.cancel_auto_clear();
        }
    }

    /// Install a new timer, cancelling the previous one first
    pub fn arm_auto_clear(&mut self, timer: AutoClearTimer) {
        self.cancel_auto_clear();
        self.timer = Some(timer);
    }

    /// Returns true if a pending timer was cancelled
    pub fn cancel_auto_clear(&mut self) -> bool {
        match self.timer.take() {
            Some(timer) => {
                timer.cancel();
                true
            }
            None => false,
        }
    }

    /// Release the timer slot if it still belongs to `generation`.
    ///
    /// Called by the timer task itself when it fires, so the handle is dropped
    /// rather than aborted.
    pub fn take_fired_timer(&mut self, generation: u64) -> bool {
        match &self.timer {
            Some(timer) if timer.generation() == generation => {
                self.timer = None;
                true
            }
            _ => false,
        }
    }

    pub fn has_pending_auto_clear(&self) -> bool {
        self.timer.is_some()
    }

    /// Returns true if this call changed the queue from closed to open
    pub fn mark_open(&mut self) -> bool {
        let was_closed = !self.open;
        self.open = true;
        if was_closed {
            self.cancel_auto_clear();
        }
        was_closed
    }

    /// Returns true if this call changed the queue from open to closed
    pub fn mark_closed(&mut self, now: DateTime<Utc>) -> bool {
        if !self.open {
            return false;
        }
        self.open = false;
        self.last_closed_at = Some(now);
        true
    }

    /// Replace the waiting list from persisted entries.
    ///
    /// Duplicate actors keep their first slot; the rest are dropped.
    pub fn restore_waiting(&mut self, entries: &[WaitingEntry]) -> usize {
        self.waiting.clear();
        for entry in entries {
            if self.contains(&entry.actor_id) {
                tracing::warn!(
                    queue_id = %self.id,
                    actor_id = %entry.actor_id,
                    "Dropping duplicate waiter from restored snapshot"
                );
                continue;
            }
            self.waiting.push_back(Waiter {
                actor_id: entry.actor_id.clone(),
                queue_id: self.id.clone(),
                wait_start: entry.wait_start,
            });
        }
        self.waiting.len()
    }

    /// Replace the notification group from persisted members
    pub fn restore_notify_group(&mut self, members: &[MemberId]) {
        self.notify_group = members.iter().cloned().collect();
    }

    pub fn restore_closed_at(&mut self, closed_at: Option<DateTime<Utc>>) {
        if !self.open {
            self.last_closed_at = closed_at;
        }
    }

    /// Time left before a closed queue's auto-clear is due, measured from
    /// when it last closed. Zero when the deadline has already passed.
    pub fn auto_clear_remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        if self.open {
            return None;
        }
        let timeout = self.auto_clear_timeout?;
        let closed_at = self.last_closed_at?;
        let elapsed = (now - closed_at).to_std().unwrap_or(Duration::ZERO);
        Some(timeout.saturating_sub(elapsed))
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            topic_name: self.topic_name.clone(),
            parent_group_id: self.parent_group_id.clone(),
            waiting_list: self.waiting.iter().map(Waiter::entry).collect(),
            notify_group: self.notify_group.iter().cloned().collect(),
            auto_clear_timeout_secs: self.auto_clear_timeout.map(|d| d.as_secs()),
            last_closed_at: self.last_closed_at,
            is_open: self.open,
        }
    }

    fn take(&mut self, actor: &MemberId) -> Option<Waiter> {
        let index = self.position_of(actor)?;
        self.waiting.remove(index)
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        self.cancel_auto_clear();
    }
}
