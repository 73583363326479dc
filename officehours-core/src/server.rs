// ABOUTME: Server composition root: owns the queues and the helper session manager for one community.
// ABOUTME: Serializes operations, persists after each change, then fans events out to extensions.

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::QueueError;
use crate::extension::{ExtensionBus, ServerEvent, ServerExtension};
use crate::ids::{MemberId, QueueId, ServerId};
use crate::metrics;
use crate::queue::{AutoClearTimer, Queue, Waiter};
use crate::session::{HelpSessionEntry, HelperSession, JustClaimed, SessionManager};
use crate::snapshot::{QueueSnapshot, ServerSnapshot, SnapshotSink};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug, Default)]
struct ServerState {
    queues: BTreeMap<QueueId, Queue>,
    sessions: SessionManager,
}

type Dequeued = (Waiter, QueueSnapshot);

impl ServerState {
    fn queue(&self, id: &QueueId) -> Result<&Queue, QueueError> {
        self.queues
            .get(id)
            .ok_or_else(|| QueueError::QueueNotFound { queue: id.clone() })
    }

    fn queue_mut(&mut self, id: &QueueId) -> Result<&mut Queue, QueueError> {
        self.queues
            .get_mut(id)
            .ok_or_else(|| QueueError::QueueNotFound { queue: id.clone() })
    }

    fn snapshot(&self, server_id: &ServerId, now: DateTime<Utc>) -> ServerSnapshot {
        ServerSnapshot {
            server_id: server_id.clone(),
            saved_at: now,
            queues: self.queues.values().map(Queue::snapshot).collect(),
        }
    }

    fn create_queue(
        &mut self,
        topic_name: String,
        parent_group_id: String,
        auto_clear: Option<Duration>,
    ) -> Result<QueueSnapshot, QueueError> {
        let id = QueueId::new(parent_group_id.clone());
        if self.queues.contains_key(&id) {
            return Err(QueueError::QueueAlreadyExists { queue: id });
        }
        let mut queue = Queue::new(topic_name, parent_group_id);
        queue.set_auto_clear_timeout(auto_clear);
        if self.sessions.is_queue_served(&id) {
            queue.mark_open();
        }
        let snapshot = queue.snapshot();
        self.queues.insert(id, queue);
        Ok(snapshot)
    }

    fn delete_queue(&mut self, id: &QueueId) -> Result<(QueueSnapshot, Vec<Waiter>), QueueError> {
        let mut queue = self
            .queues
            .remove(id)
            .ok_or_else(|| QueueError::QueueNotFound { queue: id.clone() })?;
        let evicted = queue.clear();
        queue.cancel_auto_clear();
        Ok((queue.snapshot(), evicted))
    }

    fn enqueue(
        &mut self,
        id: &QueueId,
        actor: MemberId,
        now: DateTime<Utc>,
        allow_multi_queue: bool,
    ) -> Result<Dequeued, QueueError> {
        self.queue(id)?;
        if !allow_multi_queue {
            if let Some(other) = self
                .queues
                .values()
                .find(|q| q.id() != id && q.contains(&actor))
            {
                return Err(QueueError::AlreadyInAnotherQueue {
                    member: actor,
                    other: other.id().clone(),
                });
            }
        }
        let queue = self.queue_mut(id)?;
        let waiter = queue.enqueue(actor, now)?;
        Ok((waiter, queue.snapshot()))
    }

    fn dequeue(
        &mut self,
        id: &QueueId,
        specific: Option<&MemberId>,
    ) -> Result<Dequeued, QueueError> {
        let queue = self.queue_mut(id)?;
        let waiter = match specific {
            Some(actor) => queue.dequeue_specific(actor)?,
            None => queue.dequeue_first()?,
        };
        Ok((waiter, queue.snapshot()))
    }

    fn claim(
        &mut self,
        helper: &MemberId,
        id: &QueueId,
        specific: Option<&MemberId>,
        now: DateTime<Utc>,
    ) -> Result<Dequeued, QueueError> {
        self.sessions.ensure_helping(helper)?;
        let (waiter, snapshot) = self.dequeue(id, specific)?;
        self.sessions.record_claim(helper, waiter.clone(), now)?;
        Ok((waiter, snapshot))
    }

    fn remove(&mut self, id: &QueueId, actor: &MemberId) -> Result<Option<Dequeued>, QueueError> {
        let queue = self.queue_mut(id)?;
        Ok(queue.remove(actor).map(|waiter| (waiter, queue.snapshot())))
    }

    fn leave_all(&mut self, actor: &MemberId) -> Vec<Dequeued> {
        self.queues
            .values_mut()
            .filter_map(|queue| queue.remove(actor).map(|waiter| (waiter, queue.snapshot())))
            .collect()
    }

    fn start_helping(
        &mut self,
        actor: MemberId,
        served: Vec<QueueId>,
        now: DateTime<Utc>,
    ) -> Result<(HelperSession, Vec<QueueSnapshot>), QueueError> {
        for id in &served {
            self.queue(id)?;
        }
        let session = self.sessions.start_helping(actor, served, now)?;
        let mut opened = Vec::new();
        for id in &session.served_queues {
            if let Some(queue) = self.queues.get_mut(id) {
                if queue.mark_open() {
                    opened.push(queue.snapshot());
                }
            }
        }
        Ok((session, opened))
    }

    /// Returns the closed session and the ids of queues nobody serves anymore
    fn stop_helping(
        &mut self,
        actor: &MemberId,
        now: DateTime<Utc>,
    ) -> Result<(HelperSession, Vec<QueueId>), QueueError> {
        let session = self.sessions.stop_helping(actor, now)?;
        let mut closed = Vec::new();
        for id in &session.served_queues {
            if self.sessions.is_queue_served(id) {
                continue;
            }
            if let Some(queue) = self.queues.get_mut(id) {
                if queue.mark_closed(now) {
                    closed.push(id.clone());
                }
            }
        }
        Ok((session, closed))
    }

    fn restore(&mut self, snapshot: &ServerSnapshot, default_auto_clear: Option<Duration>) -> usize {
        for saved in &snapshot.queues {
            let id = saved.queue_id();
            let queue = self
                .queues
                .entry(id)
                .or_insert_with(|| Queue::new(&saved.topic_name, &saved.parent_group_id));
            queue.restore_waiting(&saved.waiting_list);
            queue.restore_notify_group(&saved.notify_group);
            queue.restore_closed_at(saved.last_closed_at);
            queue.set_auto_clear_timeout(
                saved
                    .auto_clear_timeout_secs
                    .map(Duration::from_secs)
                    .or(default_auto_clear),
            );
        }
        snapshot.queues.len()
    }
}

/// Read-only access to a server, handed to extension hooks.
///
/// Every accessor returns owned snapshots, so observers cannot reach the
/// live state.
#[derive(Debug, Clone)]
pub struct ServerView {
    server_id: ServerId,
    state: Arc<Mutex<ServerState>>,
}

impl ServerView {
    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn server_id(&self) -> &ServerId {
        &self.server_id
    }

    pub fn queue(&self, id: &QueueId) -> Option<QueueSnapshot> {
        self.lock().queues.get(id).map(Queue::snapshot)
    }

    pub fn queues(&self) -> Vec<QueueSnapshot> {
        self.lock().queues.values().map(Queue::snapshot).collect()
    }

    /// Waiters of one queue in service order
    pub fn students(&self, id: &QueueId) -> Vec<Waiter> {
        self.lock()
            .queues
            .get(id)
            .map(|q| q.students().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_helping(&self, actor: &MemberId) -> bool {
        self.lock().sessions.is_helping(actor)
    }

    pub fn helper_session(&self, actor: &MemberId) -> Option<HelperSession> {
        self.lock().sessions.session(actor)
    }

    pub fn open_sessions(&self) -> Vec<HelperSession> {
        self.lock().sessions.open_sessions()
    }
}

struct ServerInner {
    id: ServerId,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    state: Arc<Mutex<ServerState>>,
    /// Held for the whole operation, including event dispatch, so extensions
    /// see events in the order operations happened
    ops: tokio::sync::Mutex<()>,
    bus: ExtensionBus,
    sink: RwLock<Option<Arc<dyn SnapshotSink>>>,
    periodic: Mutex<Option<JoinHandle<()>>>,
    timer_generation: AtomicU64,
}

/// One community's queues and helper sessions.
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("id", &self.inner.id)
            .field("extensions", &self.inner.bus.names())
            .finish()
    }
}

impl Server {
    pub fn new(id: ServerId, config: EngineConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                id,
                config,
                clock,
                state: Arc::new(Mutex::new(ServerState::default())),
                ops: tokio::sync::Mutex::new(()),
                bus: ExtensionBus::new(),
                sink: RwLock::new(None),
                periodic: Mutex::new(None),
                timer_generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn with_snapshot_sink(self, sink: Arc<dyn SnapshotSink>) -> Self {
        self.set_snapshot_sink(sink);
        self
    }

    pub fn set_snapshot_sink(&self, sink: Arc<dyn SnapshotSink>) {
        *self.inner.sink.write().unwrap_or_else(|e| e.into_inner()) = Some(sink);
    }

    pub fn id(&self) -> &ServerId {
        &self.inner.id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn view(&self) -> ServerView {
        ServerView {
            server_id: self.inner.id.clone(),
            state: Arc::clone(&self.inner.state),
        }
    }

    pub fn register_extension(&self, extension: Arc<dyn ServerExtension>) {
        self.inner.bus.register(extension);
    }

    pub fn unregister_extension(&self, name: &str) -> usize {
        self.inner.bus.unregister(name)
    }

    pub fn extension_names(&self) -> Vec<String> {
        self.inner.bus.names()
    }

    fn lock_state(&self) -> MutexGuard<'_, ServerState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    fn check<T>(&self, op: &'static str, result: Result<T, QueueError>) -> Result<T, QueueError> {
        if let Err(e) = &result {
            metrics::record_usage_error(e.kind());
            tracing::debug!(server_id = %self.inner.id, op, error = %e, "Operation rejected");
        }
        result
    }

    // ─── Reads ──────────────────────────────────────────────────────

    pub fn queue(&self, id: &QueueId) -> Option<QueueSnapshot> {
        self.lock_state().queues.get(id).map(Queue::snapshot)
    }

    pub fn queues(&self) -> Vec<QueueSnapshot> {
        self.lock_state().queues.values().map(Queue::snapshot).collect()
    }

    pub fn queue_ids(&self) -> Vec<QueueId> {
        self.lock_state().queues.keys().cloned().collect()
    }

    pub fn students(&self, id: &QueueId) -> Result<Vec<Waiter>, QueueError> {
        let state = self.lock_state();
        Ok(state.queue(id)?.students().cloned().collect())
    }

    /// Members to ping when the queue opens
    pub fn notify_group_for(&self, id: &QueueId) -> Result<Vec<MemberId>, QueueError> {
        let state = self.lock_state();
        Ok(state.queue(id)?.notify_group().iter().cloned().collect())
    }

    pub fn has_pending_auto_clear(&self, id: &QueueId) -> bool {
        self.lock_state()
            .queues
            .get(id)
            .map(Queue::has_pending_auto_clear)
            .unwrap_or(false)
    }

    pub fn is_helping(&self, actor: &MemberId) -> bool {
        self.lock_state().sessions.is_helping(actor)
    }

    pub fn helper_session(&self, actor: &MemberId) -> Option<HelperSession> {
        self.lock_state().sessions.session(actor)
    }

    pub fn open_sessions(&self) -> Vec<HelperSession> {
        self.lock_state().sessions.open_sessions()
    }

    pub fn pending_claim(&self, student: &MemberId) -> Option<JustClaimed> {
        self.lock_state().sessions.just_claimed(student).cloned()
    }

    pub fn help_in_progress(&self, student: &MemberId) -> Option<HelpSessionEntry> {
        self.lock_state().sessions.in_progress(student).cloned()
    }

    pub fn snapshot(&self) -> ServerSnapshot {
        let now = self.now();
        self.lock_state().snapshot(&self.inner.id, now)
    }

    // ─── Queue management ───────────────────────────────────────────

    pub async fn create_queue(
        &self,
        topic_name: impl Into<String>,
        parent_group_id: impl Into<String>,
    ) -> Result<QueueSnapshot, QueueError> {
        let _op = self.inner.ops.lock().await;
        let result = {
            let mut state = self.lock_state();
            state.create_queue(
                topic_name.into(),
                parent_group_id.into(),
                self.inner.config.default_auto_clear(),
            )
        };
        let queue = self.check("create_queue", result)?;
        tracing::info!(
            server_id = %self.inner.id,
            queue_id = %queue.queue_id(),
            topic = %queue.topic_name,
            "Queue created"
        );
        self.persist_server().await;
        Ok(queue)
    }

    /// Delete a queue, evicting everyone still waiting in it
    pub async fn delete_queue(&self, id: &QueueId) -> Result<Vec<Waiter>, QueueError> {
        let _op = self.inner.ops.lock().await;
        let result = {
            let mut state = self.lock_state();
            state.delete_queue(id)
        };
        let (queue, evicted) = self.check("delete_queue", result)?;
        tracing::info!(
            server_id = %self.inner.id,
            queue_id = %id,
            evicted = evicted.len(),
            "Queue deleted"
        );
        self.persist_server().await;
        self.emit(vec![ServerEvent::QueueDelete {
            queue,
            evicted: evicted.clone(),
        }])
        .await;
        Ok(evicted)
    }

    /// Change a queue's auto-clear policy. `None` disables it and cancels any
    /// armed timer.
    pub async fn set_auto_clear_timeout(
        &self,
        id: &QueueId,
        timeout: Option<Duration>,
    ) -> Result<(), QueueError> {
        let _op = self.inner.ops.lock().await;
        let result = {
            let mut state = self.lock_state();
            state.queue_mut(id).map(|queue| {
                queue.set_auto_clear_timeout(timeout);
                queue.snapshot()
            })
        };
        let queue = self.check("set_auto_clear_timeout", result)?;
        self.persist_queue(&queue).await;
        Ok(())
    }

    /// Arm a one-shot timer that clears the queue when it fires, unless a
    /// helper has opened the queue by then. Re-arming replaces the previous timer.
    pub async fn schedule_auto_clear(&self, id: &QueueId, after: Duration) -> Result<(), QueueError> {
        let _op = self.inner.ops.lock().await;
        let result = {
            let mut state = self.lock_state();
            state
                .queue_mut(id)
                .map(|queue| self.arm_auto_clear(queue, after))
        };
        self.check("schedule_auto_clear", result)
    }

    // ─── Queue operations ───────────────────────────────────────────

    pub async fn enqueue(&self, id: &QueueId, actor: MemberId) -> Result<Waiter, QueueError> {
        let _op = self.inner.ops.lock().await;
        let now = self.now();
        let result = {
            let mut state = self.lock_state();
            state.enqueue(id, actor, now, self.inner.config.allow_multi_queue)
        };
        let (waiter, queue) = self.check("enqueue", result)?;
        metrics::record_enqueue(id.as_str());
        metrics::set_queue_length(id.as_str(), queue.len());
        tracing::debug!(
            server_id = %self.inner.id,
            queue_id = %id,
            actor = %waiter.actor_id,
            position = queue.len(),
            "Student joined queue"
        );
        self.persist_queue(&queue).await;
        self.emit(vec![ServerEvent::StudentJoin {
            waiter: waiter.clone(),
            queue,
        }])
        .await;
        Ok(waiter)
    }

    /// Remove and return the head of the line
    pub async fn dequeue_first(&self, id: &QueueId) -> Result<Waiter, QueueError> {
        self.dequeue(id, None).await
    }

    pub async fn dequeue_specific(
        &self,
        id: &QueueId,
        actor: &MemberId,
    ) -> Result<Waiter, QueueError> {
        self.dequeue(id, Some(actor)).await
    }

    async fn dequeue(&self, id: &QueueId, specific: Option<&MemberId>) -> Result<Waiter, QueueError> {
        let _op = self.inner.ops.lock().await;
        let result = {
            let mut state = self.lock_state();
            state.dequeue(id, specific)
        };
        let (waiter, queue) = self.check("dequeue", result)?;
        let kind = if specific.is_some() { "specific" } else { "first" };
        metrics::record_dequeue(id.as_str(), kind);
        metrics::set_queue_length(id.as_str(), queue.len());
        self.persist_queue(&queue).await;
        self.emit(vec![ServerEvent::DequeueFirst {
            waiter: waiter.clone(),
            helper_id: None,
            queue,
        }])
        .await;
        Ok(waiter)
    }

    /// Voluntary leave. Returns `Ok(None)` when the member was not waiting.
    pub async fn remove(&self, id: &QueueId, actor: &MemberId) -> Result<Option<Waiter>, QueueError> {
        let _op = self.inner.ops.lock().await;
        let result = {
            let mut state = self.lock_state();
            state.remove(id, actor)
        };
        let Some((waiter, queue)) = self.check("remove", result)? else {
            return Ok(None);
        };
        metrics::record_leave(id.as_str());
        metrics::set_queue_length(id.as_str(), queue.len());
        self.persist_queue(&queue).await;
        self.emit(vec![ServerEvent::StudentLeave {
            waiter: waiter.clone(),
            queue,
        }])
        .await;
        Ok(Some(waiter))
    }

    /// Remove the member from every queue they wait in
    pub async fn leave_all(&self, actor: &MemberId) -> Vec<Waiter> {
        let _op = self.inner.ops.lock().await;
        let left = {
            let mut state = self.lock_state();
            state.leave_all(actor)
        };
        let mut events = Vec::with_capacity(left.len());
        let mut waiters = Vec::with_capacity(left.len());
        for (waiter, queue) in left {
            metrics::record_leave(queue.parent_group_id.as_str());
            metrics::set_queue_length(queue.parent_group_id.as_str(), queue.len());
            self.persist_queue(&queue).await;
            waiters.push(waiter.clone());
            events.push(ServerEvent::StudentLeave { waiter, queue });
        }
        self.emit(events).await;
        waiters
    }

    /// Empty the waiting list with a single batch event
    pub async fn clear(&self, id: &QueueId) -> Result<Vec<Waiter>, QueueError> {
        let _op = self.inner.ops.lock().await;
        let result = {
            let mut state = self.lock_state();
            state.queue_mut(id).map(|queue| (queue.clear(), queue.snapshot()))
        };
        let (removed, queue) = self.check("clear", result)?;
        metrics::record_clear(id.as_str(), "manual", removed.len());
        metrics::set_queue_length(id.as_str(), 0);
        tracing::info!(
            server_id = %self.inner.id,
            queue_id = %id,
            removed = removed.len(),
            "Queue cleared"
        );
        self.persist_queue(&queue).await;
        self.emit(vec![ServerEvent::QueueClear {
            queue,
            removed: removed.clone(),
        }])
        .await;
        Ok(removed)
    }

    /// Returns true if the member was newly added
    pub async fn add_to_notify_group(&self, id: &QueueId, actor: MemberId) -> Result<bool, QueueError> {
        let _op = self.inner.ops.lock().await;
        let result = {
            let mut state = self.lock_state();
            state
                .queue_mut(id)
                .map(|queue| (queue.add_to_notify_group(actor), queue.snapshot()))
        };
        let (added, queue) = self.check("add_to_notify_group", result)?;
        if added {
            self.persist_queue(&queue).await;
        }
        Ok(added)
    }

    /// Returns true if the member was in the group
    pub async fn remove_from_notify_group(
        &self,
        id: &QueueId,
        actor: &MemberId,
    ) -> Result<bool, QueueError> {
        let _op = self.inner.ops.lock().await;
        let result = {
            let mut state = self.lock_state();
            state
                .queue_mut(id)
                .map(|queue| (queue.remove_from_notify_group(actor), queue.snapshot()))
        };
        let (removed, queue) = self.check("remove_from_notify_group", result)?;
        if removed {
            self.persist_queue(&queue).await;
        }
        Ok(removed)
    }

    // ─── Helper sessions ────────────────────────────────────────────

    /// Open a helper session serving the given queues. Queues nobody was
    /// serving become open.
    pub async fn start_helping(
        &self,
        actor: MemberId,
        served_queues: Vec<QueueId>,
    ) -> Result<HelperSession, QueueError> {
        let _op = self.inner.ops.lock().await;
        let now = self.now();
        let result = {
            let mut state = self.lock_state();
            state
                .start_helping(actor, served_queues, now)
                .map(|(session, opened)| (session, opened, state.sessions.open_sessions().len()))
        };
        let (session, opened, active) = self.check("start_helping", result)?;
        metrics::record_helper_started();
        metrics::set_active_helpers(active);
        tracing::info!(
            server_id = %self.inner.id,
            helper = %session.actor_id,
            queues = session.served_queues.len(),
            opened = opened.len(),
            "Helper started helping"
        );

        let mut events = vec![ServerEvent::HelperStartHelping {
            session: session.clone(),
        }];
        events.extend(opened.into_iter().map(|queue| ServerEvent::QueueOpen { queue }));
        self.emit(events).await;
        Ok(session)
    }

    /// Dequeue the head of the line on behalf of a helper
    pub async fn claim(&self, helper: &MemberId, id: &QueueId) -> Result<Waiter, QueueError> {
        self.claim_inner(helper, id, None).await
    }

    /// Dequeue a particular student on behalf of a helper
    pub async fn claim_specific(
        &self,
        helper: &MemberId,
        id: &QueueId,
        student: &MemberId,
    ) -> Result<Waiter, QueueError> {
        self.claim_inner(helper, id, Some(student)).await
    }

    async fn claim_inner(
        &self,
        helper: &MemberId,
        id: &QueueId,
        student: Option<&MemberId>,
    ) -> Result<Waiter, QueueError> {
        let _op = self.inner.ops.lock().await;
        let now = self.now();
        let result = {
            let mut state = self.lock_state();
            state.claim(helper, id, student, now)
        };
        let (waiter, queue) = self.check("claim", result)?;
        metrics::record_dequeue(id.as_str(), "claim");
        metrics::set_queue_length(id.as_str(), queue.len());
        tracing::info!(
            server_id = %self.inner.id,
            queue_id = %id,
            helper = %helper,
            student = %waiter.actor_id,
            "Student claimed"
        );
        self.persist_queue(&queue).await;
        self.emit(vec![ServerEvent::DequeueFirst {
            waiter: waiter.clone(),
            helper_id: Some(helper.clone()),
            queue,
        }])
        .await;
        Ok(waiter)
    }

    /// A member joined the shared meeting space. Ignored unless they were
    /// claimed and not yet confirmed.
    pub async fn confirm_presence_join(
        &self,
        actor: &MemberId,
        when: DateTime<Utc>,
    ) -> Option<HelpSessionEntry> {
        let _op = self.inner.ops.lock().await;
        let entry = {
            let mut state = self.lock_state();
            state.sessions.confirm_presence_join(actor, when)
        }?;
        tracing::debug!(
            server_id = %self.inner.id,
            student = %entry.student_id,
            helper = %entry.helper_id,
            "Help session started"
        );
        self.emit(vec![ServerEvent::StudentJoinPresence {
            entry: entry.clone(),
        }])
        .await;
        Some(entry)
    }

    /// A member left the shared meeting space. Completes their help session
    /// entry if one is in progress.
    pub async fn confirm_presence_leave(
        &self,
        actor: &MemberId,
        when: DateTime<Utc>,
    ) -> Option<HelpSessionEntry> {
        let _op = self.inner.ops.lock().await;
        let entry = {
            let mut state = self.lock_state();
            state.sessions.confirm_presence_leave(actor, when)
        }?;
        metrics::record_help_session(entry.wait_time_ms, entry.duration_ms().unwrap_or(0));
        tracing::debug!(
            server_id = %self.inner.id,
            student = %entry.student_id,
            helper = %entry.helper_id,
            duration_ms = entry.duration_ms().unwrap_or(0),
            "Help session completed"
        );
        self.emit(vec![ServerEvent::StudentLeavePresence {
            entry: entry.clone(),
        }])
        .await;
        Some(entry)
    }

    /// Close the helper's session. Queues nobody serves anymore close and,
    /// when they have an auto-clear policy, start their clear timer.
    pub async fn stop_helping(&self, actor: &MemberId) -> Result<HelperSession, QueueError> {
        let _op = self.inner.ops.lock().await;
        let now = self.now();
        let result = {
            let mut state = self.lock_state();
            match state.stop_helping(actor, now) {
                Ok((session, closed_ids)) => {
                    let mut closed = Vec::with_capacity(closed_ids.len());
                    for id in &closed_ids {
                        if let Some(queue) = state.queues.get_mut(id) {
                            if let Some(after) = queue.auto_clear_timeout() {
                                self.arm_auto_clear(queue, after);
                            }
                            closed.push(queue.snapshot());
                        }
                    }
                    Ok((session, closed, state.sessions.open_sessions().len()))
                }
                Err(e) => Err(e),
            }
        };
        let (session, closed, active) = self.check("stop_helping", result)?;
        metrics::record_helper_stopped(session.active_time_ms);
        metrics::set_active_helpers(active);
        tracing::info!(
            server_id = %self.inner.id,
            helper = %session.actor_id,
            helped = session.helped_waiters.len(),
            active_time_ms = session.active_time_ms,
            closed = closed.len(),
            "Helper stopped helping"
        );

        let mut events = vec![ServerEvent::HelperStopHelping {
            session: session.clone(),
        }];
        events.extend(closed.into_iter().map(|queue| ServerEvent::QueueClose { queue }));
        self.emit(events).await;
        Ok(session)
    }

    // ─── Auto-clear ─────────────────────────────────────────────────

    fn arm_auto_clear(&self, queue: &mut Queue, after: Duration) {
        let generation = self.inner.timer_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let weak = Arc::downgrade(&self.inner);
        let queue_id = queue.id().clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(inner) = weak.upgrade() {
                Server { inner }.fire_auto_clear(&queue_id, generation).await;
            }
        });
        tracing::debug!(
            server_id = %self.inner.id,
            queue_id = %queue.id(),
            after_secs = after.as_secs(),
            "Auto-clear armed"
        );
        queue.arm_auto_clear(AutoClearTimer::new(generation, handle));
    }

    async fn fire_auto_clear(&self, id: &QueueId, generation: u64) {
        let _op = self.inner.ops.lock().await;
        let outcome = {
            let mut state = self.lock_state();
            state.queues.get_mut(id).and_then(|queue| {
                if queue.take_fired_timer(generation) && !queue.is_open() {
                    let removed = queue.clear();
                    Some((removed, queue.snapshot()))
                } else {
                    None
                }
            })
        };
        let Some((removed, queue)) = outcome else {
            tracing::debug!(server_id = %self.inner.id, queue_id = %id, "Stale auto-clear timer ignored");
            return;
        };
        if removed.is_empty() {
            return;
        }
        metrics::record_clear(id.as_str(), "auto", removed.len());
        metrics::set_queue_length(id.as_str(), 0);
        tracing::info!(
            server_id = %self.inner.id,
            queue_id = %id,
            removed = removed.len(),
            "Queue auto-cleared"
        );
        self.persist_queue(&queue).await;
        self.emit(vec![ServerEvent::QueueClear { queue, removed }])
            .await;
    }

    // ─── Periodic updates ───────────────────────────────────────────

    /// Send every queue to the periodic-update hook and drop claims whose
    /// helper is gone. Returns the number of queues announced.
    pub async fn periodic_update(&self) -> usize {
        let _op = self.inner.ops.lock().await;
        let (queues, stale) = {
            let mut state = self.lock_state();
            let queues: Vec<QueueSnapshot> = state.queues.values().map(Queue::snapshot).collect();
            (queues, state.sessions.discard_stale_claims())
        };
        for claim in &stale {
            tracing::debug!(
                server_id = %self.inner.id,
                student = %claim.actor_id,
                helper = %claim.helper_id,
                "Discarded stale claim"
            );
        }
        let count = queues.len();
        self.emit(
            queues
                .into_iter()
                .map(|queue| ServerEvent::QueuePeriodicUpdate { queue })
                .collect(),
        )
        .await;
        count
    }

    /// Spawn the periodic update loop, replacing any previous one
    pub fn start_periodic_updates(&self) {
        let period = self
            .inner
            .config
            .periodic_update_interval()
            .max(Duration::from_secs(1));
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                Server { inner }.periodic_update().await;
            }
        });
        let previous = self
            .inner
            .periodic
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    // ─── Persistence ────────────────────────────────────────────────

    /// Rehydrate queues from a stored snapshot. Waiting lists keep their
    /// original wait start; no per-student events are emitted.
    ///
    /// Closed queues with an auto-clear policy get their timer back for
    /// whatever is left since they closed. An overdue clear fires right away.
    pub async fn restore(&self, snapshot: ServerSnapshot) -> usize {
        let _op = self.inner.ops.lock().await;
        let now = self.now();
        if snapshot.server_id != ServerId::default() && snapshot.server_id != self.inner.id {
            tracing::warn!(
                server_id = %self.inner.id,
                snapshot_server_id = %snapshot.server_id,
                "Restoring snapshot taken from a different server"
            );
        }
        let restored = {
            let mut state = self.lock_state();
            let restored = state.restore(&snapshot, self.inner.config.default_auto_clear());
            for saved in &snapshot.queues {
                if let Some(queue) = state.queues.get_mut(&saved.queue_id()) {
                    if let Some(remaining) = queue.auto_clear_remaining(now) {
                        self.arm_auto_clear(queue, remaining);
                    }
                }
            }
            restored
        };
        tracing::info!(
            server_id = %self.inner.id,
            queues = restored,
            "Server state restored"
        );
        self.persist_server().await;
        restored
    }

    fn sink(&self) -> Option<Arc<dyn SnapshotSink>> {
        self.inner
            .sink
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    async fn persist_server(&self) {
        let Some(sink) = self.sink() else {
            return;
        };
        let snapshot = self.snapshot();
        if let Err(e) = sink.save_server(&snapshot).await {
            metrics::record_snapshot_failure();
            tracing::warn!(server_id = %self.inner.id, error = %e, "Failed to save server snapshot");
        }
    }

    async fn persist_queue(&self, queue: &QueueSnapshot) {
        let Some(sink) = self.sink() else {
            return;
        };
        if let Err(e) = sink.save_queue(&self.inner.id, queue).await {
            metrics::record_snapshot_failure();
            tracing::warn!(
                server_id = %self.inner.id,
                queue_id = %queue.queue_id(),
                error = %e,
                "Failed to save queue snapshot"
            );
        }
    }

    // ─── Dispatch & lifecycle ───────────────────────────────────────

    async fn emit(&self, events: Vec<ServerEvent>) {
        if events.is_empty() {
            return;
        }
        let view = self.view();
        for event in &events {
            self.inner.bus.dispatch(&view, event).await;
        }
    }

    /// Stop background tasks and announce the server's removal
    pub async fn shutdown(&self) {
        let periodic = self
            .inner
            .periodic
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = periodic {
            handle.abort();
        }
        let _op = self.inner.ops.lock().await;
        {
            let mut state = self.lock_state();
            for queue in state.queues.values_mut() {
                queue.cancel_auto_clear();
            }
        }
        tracing::info!(server_id = %self.inner.id, "Server shut down");
        self.emit(vec![ServerEvent::ServerDelete {
            server_id: self.inner.id.clone(),
        }])
        .await;
    }
}
