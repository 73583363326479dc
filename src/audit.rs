// ABOUTME: Audit log extension emitting one structured tracing line per lifecycle event.
// ABOUTME: The full event is serialized to JSON so log pipelines can index it.
use anyhow::Result;
use async_trait::async_trait;
use officehours_core::{
    HelpSessionEntry, HelperSession, MemberId, QueueSnapshot, ServerEvent, ServerExtension,
    ServerView, Waiter,
};

pub const AUDIT_TARGET: &str = "officehours::audit";

/// Logs every lifecycle event under the `officehours::audit` target.
///
/// Periodic queue updates are left to the trait default and not logged, since
/// they repeat for every queue on each tick.
#[derive(Debug, Default)]
pub struct AuditLogExtension;

impl AuditLogExtension {
    pub fn new() -> Self {
        Self
    }

    fn record(&self, server: &ServerView, event: ServerEvent) -> Result<()> {
        let payload = serde_json::to_string(&event)?;
        tracing::info!(
            target: AUDIT_TARGET,
            server_id = %server.server_id(),
            event = event.event_type(),
            queue_id = event.queue().map(|q| q.parent_group_id.as_str()).unwrap_or(""),
            payload = %payload,
            "audit"
        );
        Ok(())
    }
}

#[async_trait]
impl ServerExtension for AuditLogExtension {
    fn name(&self) -> &str {
        "audit"
    }

    async fn on_queue_open(&self, server: &ServerView, queue: &QueueSnapshot) -> Result<()> {
        self.record(
            server,
            ServerEvent::QueueOpen {
                queue: queue.clone(),
            },
        )
    }

    async fn on_queue_close(&self, server: &ServerView, queue: &QueueSnapshot) -> Result<()> {
        self.record(
            server,
            ServerEvent::QueueClose {
                queue: queue.clone(),
            },
        )
    }

    async fn on_queue_clear(
        &self,
        server: &ServerView,
        queue: &QueueSnapshot,
        removed: &[Waiter],
    ) -> Result<()> {
        self.record(
            server,
            ServerEvent::QueueClear {
                queue: queue.clone(),
                removed: removed.to_vec(),
            },
        )
    }

    async fn on_student_join(
        &self,
        server: &ServerView,
        waiter: &Waiter,
        queue: &QueueSnapshot,
    ) -> Result<()> {
        self.record(
            server,
            ServerEvent::StudentJoin {
                waiter: waiter.clone(),
                queue: queue.clone(),
            },
        )
    }

    async fn on_student_leave(
        &self,
        server: &ServerView,
        waiter: &Waiter,
        queue: &QueueSnapshot,
    ) -> Result<()> {
        self.record(
            server,
            ServerEvent::StudentLeave {
                waiter: waiter.clone(),
                queue: queue.clone(),
            },
        )
    }

    async fn on_dequeue_first(
        &self,
        server: &ServerView,
        waiter: &Waiter,
        helper: Option<&MemberId>,
        queue: &QueueSnapshot,
    ) -> Result<()> {
        self.record(
            server,
            ServerEvent::DequeueFirst {
                waiter: waiter.clone(),
                helper_id: helper.cloned(),
                queue: queue.clone(),
            },
        )
    }

    async fn on_helper_start_helping(
        &self,
        server: &ServerView,
        session: &HelperSession,
    ) -> Result<()> {
        self.record(
            server,
            ServerEvent::HelperStartHelping {
                session: session.clone(),
            },
        )
    }

    async fn on_helper_stop_helping(
        &self,
        server: &ServerView,
        session: &HelperSession,
    ) -> Result<()> {
        self.record(
            server,
            ServerEvent::HelperStopHelping {
                session: session.clone(),
            },
        )
    }

    async fn on_student_join_presence(
        &self,
        server: &ServerView,
        entry: &HelpSessionEntry,
    ) -> Result<()> {
        self.record(
            server,
            ServerEvent::StudentJoinPresence {
                entry: entry.clone(),
            },
        )
    }

    async fn on_student_leave_presence(
        &self,
        server: &ServerView,
        entry: &HelpSessionEntry,
    ) -> Result<()> {
        self.record(
            server,
            ServerEvent::StudentLeavePresence {
                entry: entry.clone(),
            },
        )
    }

    async fn on_queue_delete(
        &self,
        server: &ServerView,
        queue: &QueueSnapshot,
        evicted: &[Waiter],
    ) -> Result<()> {
        self.record(
            server,
            ServerEvent::QueueDelete {
                queue: queue.clone(),
                evicted: evicted.to_vec(),
            },
        )
    }

    async fn on_server_delete(&self, server: &ServerView) -> Result<()> {
        self.record(
            server,
            ServerEvent::ServerDelete {
                server_id: server.server_id().clone(),
            },
        )
    }
}
