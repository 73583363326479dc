// ABOUTME: Extension event bus: lifecycle events and the observers that react to them.
// ABOUTME: Hooks default to no-ops; a failing or panicking hook never affects other observers.

use crate::ids::{MemberId, ServerId};
use crate::metrics;
use crate::queue::Waiter;
use crate::server::ServerView;
use crate::session::{HelpSessionEntry, HelperSession};
use crate::snapshot::QueueSnapshot;
use anyhow::Result;
use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};

/// Every lifecycle transition announced to extensions.
///
/// Payloads are owned snapshots taken after the transition was committed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    QueueOpen {
        queue: QueueSnapshot,
    },
    QueueClose {
        queue: QueueSnapshot,
    },
    /// Whole waiting list removed at once (manual clear or auto-clear)
    QueueClear {
        queue: QueueSnapshot,
        removed: Vec<Waiter>,
    },
    StudentJoin {
        waiter: Waiter,
        queue: QueueSnapshot,
    },
    StudentLeave {
        waiter: Waiter,
        queue: QueueSnapshot,
    },
    /// A waiter was dequeued. `helper_id` is set when the dequeue was a claim.
    DequeueFirst {
        waiter: Waiter,
        helper_id: Option<MemberId>,
        queue: QueueSnapshot,
    },
    HelperStartHelping {
        session: HelperSession,
    },
    HelperStopHelping {
        session: HelperSession,
    },
    StudentJoinPresence {
        entry: HelpSessionEntry,
    },
    StudentLeavePresence {
        entry: HelpSessionEntry,
    },
    QueueDelete {
        queue: QueueSnapshot,
        evicted: Vec<Waiter>,
    },
    ServerDelete {
        server_id: ServerId,
    },
    QueuePeriodicUpdate {
        queue: QueueSnapshot,
    },
}

impl ServerEvent {
    /// Hook name, used in logs and metrics labels
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::QueueOpen { .. } => "queue_open",
            Self::QueueClose { .. } => "queue_close",
            Self::QueueClear { .. } => "queue_clear",
            Self::StudentJoin { .. } => "student_join",
            Self::StudentLeave { .. } => "student_leave",
            Self::DequeueFirst { .. } => "dequeue_first",
            Self::HelperStartHelping { .. } => "helper_start_helping",
            Self::HelperStopHelping { .. } => "helper_stop_helping",
            Self::StudentJoinPresence { .. } => "student_join_presence",
            Self::StudentLeavePresence { .. } => "student_leave_presence",
            Self::QueueDelete { .. } => "queue_delete",
            Self::ServerDelete { .. } => "server_delete",
            Self::QueuePeriodicUpdate { .. } => "queue_periodic_update",
        }
    }

    /// The queue this event concerns, if any
    pub fn queue(&self) -> Option<&QueueSnapshot> {
        match self {
            Self::QueueOpen { queue }
            | Self::QueueClose { queue }
            | Self::QueueClear { queue, .. }
            | Self::StudentJoin { queue, .. }
            | Self::StudentLeave { queue, .. }
            | Self::DequeueFirst { queue, .. }
            | Self::QueueDelete { queue, .. }
            | Self::QueuePeriodicUpdate { queue } => Some(queue),
            _ => None,
        }
    }
}

/// An observer of server lifecycle events.
///
/// Implement only the hooks you care about. Hooks run after the state change
/// is committed and receive a read-only view of the server; returning an
/// error only logs it.
///
/// Hooks run while the server's operation lock is held. A hook must not call
/// a mutating `Server` method on a `Server` it holds a clone of: that call waits
/// on the same lock and deadlocks. Hand such work to a spawned task instead.
#[async_trait]
pub trait ServerExtension: Send + Sync {
    /// Identifies this extension in logs
    fn name(&self) -> &str;

    async fn on_queue_open(&self, _server: &ServerView, _queue: &QueueSnapshot) -> Result<()> {
        Ok(())
    }

    async fn on_queue_close(&self, _server: &ServerView, _queue: &QueueSnapshot) -> Result<()> {
        Ok(())
    }

    async fn on_queue_clear(
        &self,
        _server: &ServerView,
        _queue: &QueueSnapshot,
        _removed: &[Waiter],
    ) -> Result<()> {
        Ok(())
    }

    async fn on_student_join(
        &self,
        _server: &ServerView,
        _waiter: &Waiter,
        _queue: &QueueSnapshot,
    ) -> Result<()> {
        Ok(())
    }

    async fn on_student_leave(
        &self,
        _server: &ServerView,
        _waiter: &Waiter,
        _queue: &QueueSnapshot,
    ) -> Result<()> {
        Ok(())
    }

    async fn on_dequeue_first(
        &self,
        _server: &ServerView,
        _waiter: &Waiter,
        _helper: Option<&MemberId>,
        _queue: &QueueSnapshot,
    ) -> Result<()> {
        Ok(())
    }

    async fn on_helper_start_helping(
        &self,
        _server: &ServerView,
        _session: &HelperSession,
    ) -> Result<()> {
        Ok(())
    }

    async fn on_helper_stop_helping(
        &self,
        _server: &ServerView,
        _session: &HelperSession,
    ) -> Result<()> {
        Ok(())
    }

    async fn on_student_join_presence(
        &self,
        _server: &ServerView,
        _entry: &HelpSessionEntry,
    ) -> Result<()> {
        Ok(())
    }

    async fn on_student_leave_presence(
        &self,
        _server: &ServerView,
        _entry: &HelpSessionEntry,
    ) -> Result<()> {
        Ok(())
    }

    async fn on_queue_delete(
        &self,
        _server: &ServerView,
        _queue: &QueueSnapshot,
        _evicted: &[Waiter],
    ) -> Result<()> {
        Ok(())
    }

    async fn on_server_delete(&self, _server: &ServerView) -> Result<()> {
        Ok(())
    }

    async fn on_queue_periodic_update(
        &self,
        _server: &ServerView,
        _queue: &QueueSnapshot,
    ) -> Result<()> {
        Ok(())
    }
}

async fn deliver(ext: &dyn ServerExtension, view: &ServerView, event: &ServerEvent) -> Result<()> {
    match event {
        ServerEvent::QueueOpen { queue } => ext.on_queue_open(view, queue).await,
        ServerEvent::QueueClose { queue } => ext.on_queue_close(view, queue).await,
        ServerEvent::QueueClear { queue, removed } => ext.on_queue_clear(view, queue, removed).await,
        ServerEvent::StudentJoin { waiter, queue } => ext.on_student_join(view, waiter, queue).await,
        ServerEvent::StudentLeave { waiter, queue } => {
            ext.on_student_leave(view, waiter, queue).await
        }
        ServerEvent::DequeueFirst {
            waiter,
            helper_id,
            queue,
        } => {
            ext.on_dequeue_first(view, waiter, helper_id.as_ref(), queue)
                .await
        }
        ServerEvent::HelperStartHelping { session } => {
            ext.on_helper_start_helping(view, session).await
        }
        ServerEvent::HelperStopHelping { session } => {
            ext.on_helper_stop_helping(view, session).await
        }
        ServerEvent::StudentJoinPresence { entry } => {
            ext.on_student_join_presence(view, entry).await
        }
        ServerEvent::StudentLeavePresence { entry } => {
            ext.on_student_leave_presence(view, entry).await
        }
        ServerEvent::QueueDelete { queue, evicted } => {
            ext.on_queue_delete(view, queue, evicted).await
        }
        ServerEvent::ServerDelete { .. } => ext.on_server_delete(view).await,
        ServerEvent::QueuePeriodicUpdate { queue } => {
            ext.on_queue_periodic_update(view, queue).await
        }
    }
}

/// Ordered registry of extensions for one server
#[derive(Default)]
pub struct ExtensionBus {
    extensions: RwLock<Vec<Arc<dyn ServerExtension>>>,
}

impl ExtensionBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an extension; delivery follows registration order
    pub fn register(&self, extension: Arc<dyn ServerExtension>) {
        tracing::debug!(extension = %extension.name(), "Registering extension");
        self.extensions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(extension);
    }

    /// Remove every extension with the given name. Returns how many were removed.
    pub fn unregister(&self, name: &str) -> usize {
        let mut extensions = self.extensions.write().unwrap_or_else(|e| e.into_inner());
        let before = extensions.len();
        extensions.retain(|e| e.name() != name);
        before - extensions.len()
    }

    pub fn names(&self) -> Vec<String> {
        self.snapshot().iter().map(|e| e.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.extensions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<Arc<dyn ServerExtension>> {
        self.extensions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Deliver one event to every extension in registration order.
    ///
    /// Returns the number of extensions whose hook failed.
    pub async fn dispatch(&self, view: &ServerView, event: &ServerEvent) -> usize {
        let mut failures = 0;
        for ext in self.snapshot() {
            let outcome = AssertUnwindSafe(deliver(ext.as_ref(), view, event))
                .catch_unwind()
                .await;
            let error = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => format!("{:#}", e),
                Err(panic) => panic_message(panic.as_ref()),
            };
            failures += 1;
            metrics::record_extension_failure(event.event_type());
            tracing::error!(
                server_id = %view.server_id(),
                extension = %ext.name(),
                event = event.event_type(),
                error = %error,
                "Extension hook failed"
            );
        }
        failures
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}
