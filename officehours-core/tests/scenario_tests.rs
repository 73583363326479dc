// ABOUTME: End-to-end lifecycle scenarios: auto-clear timers, event sequences, persistence, restore, and registry.
// ABOUTME: Timer tests run on a paused tokio clock so sleeps complete instantly and deterministically.

use anyhow::Result;
use async_trait::async_trait;
use officehours_core::snapshot::WaitingEntry;
use officehours_core::{
    EngineConfig, HelpSessionEntry, HelperSession, ManualClock, MemberId, QueueId, QueueSnapshot,
    Server, ServerEvent, ServerExtension, ServerId, ServerRegistry, ServerSnapshot, ServerView,
    SnapshotSink, Waiter,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Rebuilds every hook call into a `ServerEvent` so tests can assert on sequences
#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<ServerEvent>>,
}

impl Recorder {
    fn push(&self, event: ServerEvent) -> Result<()> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }

    fn types(&self) -> Vec<&'static str> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(ServerEvent::event_type)
            .collect()
    }

    fn count(&self, event_type: &str) -> usize {
        self.types().into_iter().filter(|t| *t == event_type).count()
    }

    fn events(&self) -> Vec<ServerEvent> {
        self.events.lock().unwrap().clone()
    }

    fn reset(&self) {
        self.events.lock().unwrap().clear();
    }
}

#[async_trait]
impl ServerExtension for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    async fn on_queue_open(&self, _: &ServerView, queue: &QueueSnapshot) -> Result<()> {
        self.push(ServerEvent::QueueOpen {
            queue: queue.clone(),
        })
    }

    async fn on_queue_close(&self, _: &ServerView, queue: &QueueSnapshot) -> Result<()> {
        self.push(ServerEvent::QueueClose {
            queue: queue.clone(),
        })
    }

    async fn on_queue_clear(
        &self,
        _: &ServerView,
        queue: &QueueSnapshot,
        removed: &[Waiter],
    ) -> Result<()> {
        self.push(ServerEvent::QueueClear {
            queue: queue.clone(),
            removed: removed.to_vec(),
        })
    }

    async fn on_student_join(&self, _: &ServerView, waiter: &Waiter, queue: &QueueSnapshot) -> Result<()> {
        self.push(ServerEvent::StudentJoin {
            waiter: waiter.clone(),
            queue: queue.clone(),
        })
    }

    async fn on_student_leave(&self, _: &ServerView, waiter: &Waiter, queue: &QueueSnapshot) -> Result<()> {
        self.push(ServerEvent::StudentLeave {
            waiter: waiter.clone(),
            queue: queue.clone(),
        })
    }

    async fn on_dequeue_first(
        &self,
        _: &ServerView,
        waiter: &Waiter,
        helper: Option<&MemberId>,
        queue: &QueueSnapshot,
    ) -> Result<()> {
        self.push(ServerEvent::DequeueFirst {
            waiter: waiter.clone(),
            helper_id: helper.cloned(),
            queue: queue.clone(),
        })
    }

    async fn on_helper_start_helping(&self, _: &ServerView, session: &HelperSession) -> Result<()> {
        self.push(ServerEvent::HelperStartHelping {
            session: session.clone(),
        })
    }

    async fn on_helper_stop_helping(&self, _: &ServerView, session: &HelperSession) -> Result<()> {
        self.push(ServerEvent::HelperStopHelping {
            session: session.clone(),
        })
    }

    async fn on_student_join_presence(&self, _: &ServerView, entry: &HelpSessionEntry) -> Result<()> {
        self.push(ServerEvent::StudentJoinPresence {
            entry: entry.clone(),
        })
    }

    async fn on_student_leave_presence(&self, _: &ServerView, entry: &HelpSessionEntry) -> Result<()> {
        self.push(ServerEvent::StudentLeavePresence {
            entry: entry.clone(),
        })
    }

    async fn on_queue_delete(
        &self,
        _: &ServerView,
        queue: &QueueSnapshot,
        evicted: &[Waiter],
    ) -> Result<()> {
        self.push(ServerEvent::QueueDelete {
            queue: queue.clone(),
            evicted: evicted.to_vec(),
        })
    }

    async fn on_server_delete(&self, server: &ServerView) -> Result<()> {
        self.push(ServerEvent::ServerDelete {
            server_id: server.server_id().clone(),
        })
    }

    async fn on_queue_periodic_update(&self, _: &ServerView, queue: &QueueSnapshot) -> Result<()> {
        self.push(ServerEvent::QueuePeriodicUpdate {
            queue: queue.clone(),
        })
    }
}

/// In-memory persistence port that counts saves
#[derive(Default)]
struct MemorySink {
    servers: Mutex<Vec<ServerSnapshot>>,
    queues: Mutex<Vec<QueueSnapshot>>,
    fail: bool,
}

#[async_trait]
impl SnapshotSink for MemorySink {
    async fn save_server(&self, snapshot: &ServerSnapshot) -> Result<()> {
        if self.fail {
            anyhow::bail!("disk full");
        }
        self.servers.lock().unwrap().push(snapshot.clone());
        Ok(())
    }

    async fn save_queue(&self, _server_id: &ServerId, queue: &QueueSnapshot) -> Result<()> {
        if self.fail {
            anyhow::bail!("disk full");
        }
        self.queues.lock().unwrap().push(queue.clone());
        Ok(())
    }
}

fn member(id: &str) -> MemberId {
    MemberId::new(id)
}

fn lab() -> QueueId {
    QueueId::new("cat-1")
}

async fn setup(config: EngineConfig) -> (Server, Arc<Recorder>) {
    let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
    let server = Server::new(ServerId::new("guild-1"), config, clock);
    server.create_queue("Lab help", "cat-1").await.unwrap();
    let recorder = Arc::new(Recorder::default());
    server.register_extension(recorder.clone());
    (server, recorder)
}

#[tokio::test(start_paused = true)]
async fn test_auto_clear_fires_one_batch_event() {
    let (server, recorder) = setup(EngineConfig::default()).await;
    server
        .set_auto_clear_timeout(&lab(), Some(Duration::from_secs(60)))
        .await
        .unwrap();
    server.start_helping(member("bob"), vec![lab()]).await.unwrap();
    server.enqueue(&lab(), member("alice")).await.unwrap();
    server.enqueue(&lab(), member("carol")).await.unwrap();

    server.stop_helping(&member("bob")).await.unwrap();
    assert!(server.has_pending_auto_clear(&lab()));
    recorder.reset();

    tokio::time::sleep(Duration::from_secs(59)).await;
    assert_eq!(server.students(&lab()).unwrap().len(), 2);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(server.students(&lab()).unwrap().is_empty());
    assert_eq!(recorder.types(), vec!["queue_clear"]);
    assert_eq!(recorder.count("student_leave"), 0);
    match &recorder.events()[0] {
        ServerEvent::QueueClear { removed, queue } => {
            assert_eq!(removed.len(), 2);
            assert!(queue.is_empty());
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert!(!server.has_pending_auto_clear(&lab()));
}

#[tokio::test(start_paused = true)]
async fn test_reopening_cancels_auto_clear() {
    let (server, recorder) = setup(EngineConfig::default()).await;
    server
        .set_auto_clear_timeout(&lab(), Some(Duration::from_secs(60)))
        .await
        .unwrap();
    server.enqueue(&lab(), member("alice")).await.unwrap();
    server.start_helping(member("bob"), vec![lab()]).await.unwrap();
    server.stop_helping(&member("bob")).await.unwrap();

    tokio::time::sleep(Duration::from_secs(30)).await;
    server.start_helping(member("bob"), vec![lab()]).await.unwrap();
    assert!(!server.has_pending_auto_clear(&lab()));

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(server.students(&lab()).unwrap().len(), 1);
    assert_eq!(recorder.count("queue_clear"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_repeated_close_cycles_fire_once() {
    let (server, recorder) = setup(EngineConfig::default()).await;
    server
        .set_auto_clear_timeout(&lab(), Some(Duration::from_secs(60)))
        .await
        .unwrap();
    server.enqueue(&lab(), member("alice")).await.unwrap();
    for _ in 0..3 {
        server.start_helping(member("bob"), vec![lab()]).await.unwrap();
        server.stop_helping(&member("bob")).await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
    }

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(recorder.count("queue_clear"), 1);
    assert!(server.students(&lab()).unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_auto_clear_on_empty_queue_is_silent() {
    let (server, recorder) = setup(EngineConfig::default()).await;
    server
        .schedule_auto_clear(&lab(), Duration::from_secs(5))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(recorder.count("queue_clear"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_disabling_policy_cancels_armed_timer() {
    let (server, recorder) = setup(EngineConfig::default()).await;
    server.enqueue(&lab(), member("alice")).await.unwrap();
    server
        .schedule_auto_clear(&lab(), Duration::from_secs(5))
        .await
        .unwrap();
    server.set_auto_clear_timeout(&lab(), None).await.unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(recorder.count("queue_clear"), 0);
    assert_eq!(server.students(&lab()).unwrap().len(), 1);
}

#[tokio::test]
async fn test_event_sequence_for_basic_flow() {
    let (server, recorder) = setup(EngineConfig::default()).await;
    server.enqueue(&lab(), member("alice")).await.unwrap();
    server.start_helping(member("bob"), vec![lab()]).await.unwrap();
    server.claim(&member("bob"), &lab()).await.unwrap();
    let now = chrono::Utc::now();
    server.confirm_presence_join(&member("alice"), now).await.unwrap();
    server
        .confirm_presence_leave(&member("alice"), now + chrono::Duration::seconds(30))
        .await
        .unwrap();
    server.stop_helping(&member("bob")).await.unwrap();

    assert_eq!(
        recorder.types(),
        vec![
            "student_join",
            "helper_start_helping",
            "queue_open",
            "dequeue_first",
            "student_join_presence",
            "student_leave_presence",
            "helper_stop_helping",
            "queue_close",
        ]
    );
    let claimed_by = recorder.events().iter().find_map(|e| match e {
        ServerEvent::DequeueFirst { helper_id, .. } => helper_id.clone(),
        _ => None,
    });
    assert_eq!(claimed_by, Some(member("bob")));
}

#[tokio::test]
async fn test_stale_claim_produces_no_presence_events() {
    let (server, recorder) = setup(EngineConfig::default()).await;
    server.enqueue(&lab(), member("alice")).await.unwrap();
    server.start_helping(member("bob"), vec![lab()]).await.unwrap();
    server.claim(&member("bob"), &lab()).await.unwrap();
    server.stop_helping(&member("bob")).await.unwrap();
    assert!(server
        .confirm_presence_join(&member("alice"), chrono::Utc::now())
        .await
        .is_none());
    assert_eq!(recorder.count("student_join_presence"), 0);
}

#[tokio::test]
async fn test_leave_all_emits_one_leave_per_queue() {
    let (server, recorder) = setup(EngineConfig::default()).await;
    server.create_queue("Exam prep", "cat-2").await.unwrap();
    server.enqueue(&lab(), member("alice")).await.unwrap();
    server
        .enqueue(&QueueId::new("cat-2"), member("alice"))
        .await
        .unwrap();
    recorder.reset();

    server.leave_all(&member("alice")).await;
    assert_eq!(recorder.types(), vec!["student_leave", "student_leave"]);
}

#[tokio::test]
async fn test_clear_and_delete_events() {
    let (server, recorder) = setup(EngineConfig::default()).await;
    server.enqueue(&lab(), member("alice")).await.unwrap();
    server.clear(&lab()).await.unwrap();
    server.enqueue(&lab(), member("bob")).await.unwrap();
    server.delete_queue(&lab()).await.unwrap();

    assert_eq!(
        recorder.types(),
        vec!["student_join", "queue_clear", "student_join", "queue_delete"]
    );
    match recorder.events().last() {
        Some(ServerEvent::QueueDelete { evicted, .. }) => {
            assert_eq!(evicted.len(), 1);
            assert_eq!(evicted[0].actor_id, member("bob"));
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_periodic_update_announces_each_queue() {
    let (server, recorder) = setup(EngineConfig::default()).await;
    server.create_queue("Exam prep", "cat-2").await.unwrap();
    assert_eq!(server.periodic_update().await, 2);
    assert_eq!(recorder.count("queue_periodic_update"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_periodic_update_loop_ticks() {
    let config = EngineConfig {
        periodic_update_secs: 60,
        ..EngineConfig::default()
    };
    let (server, recorder) = setup(config).await;
    server.start_periodic_updates();

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(recorder.count("queue_periodic_update"), 0);

    tokio::time::sleep(Duration::from_secs(100)).await;
    assert_eq!(recorder.count("queue_periodic_update"), 2);

    server.shutdown().await;
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(recorder.count("queue_periodic_update"), 2);
    assert_eq!(recorder.count("server_delete"), 1);
}

#[tokio::test]
async fn test_snapshot_sink_receives_saves() {
    let (server, _) = setup(EngineConfig::default()).await;
    let sink = Arc::new(MemorySink::default());
    server.set_snapshot_sink(sink.clone());

    server.create_queue("Exam prep", "cat-2").await.unwrap();
    server.enqueue(&lab(), member("alice")).await.unwrap();
    server.add_to_notify_group(&lab(), member("zed")).await.unwrap();

    let servers = sink.servers.lock().unwrap();
    assert_eq!(servers.len(), 1);
    assert_eq!(servers[0].queues.len(), 2);
    let queues = sink.queues.lock().unwrap();
    assert_eq!(queues.len(), 2);
    assert!(queues[0].contains(&member("alice")));
    assert_eq!(queues[1].notify_group, vec![member("zed")]);
}

#[tokio::test]
async fn test_failing_sink_does_not_fail_operations() {
    let (server, recorder) = setup(EngineConfig::default()).await;
    server.set_snapshot_sink(Arc::new(MemorySink {
        fail: true,
        ..MemorySink::default()
    }));
    server.enqueue(&lab(), member("alice")).await.unwrap();
    assert_eq!(recorder.count("student_join"), 1);
}

#[tokio::test]
async fn test_restore_preserves_order_and_wait_start() {
    let (server, _) = setup(EngineConfig::default()).await;
    server.enqueue(&lab(), member("alice")).await.unwrap();
    server.enqueue(&lab(), member("bob")).await.unwrap();
    server.add_to_notify_group(&lab(), member("zed")).await.unwrap();
    server
        .set_auto_clear_timeout(&lab(), Some(Duration::from_secs(90)))
        .await
        .unwrap();
    let snapshot = server.snapshot();

    let json = serde_json::to_string(&snapshot).unwrap();
    let decoded: ServerSnapshot = serde_json::from_str(&json).unwrap();

    let clock = Arc::new(ManualClock::at_unix(1_800_000_000));
    let restored = Server::new(ServerId::new("guild-1"), EngineConfig::default(), clock);
    let recorder = Arc::new(Recorder::default());
    restored.register_extension(recorder.clone());
    assert_eq!(restored.restore(decoded).await, 1);

    let original = server.students(&lab()).unwrap();
    let rehydrated = restored.students(&lab()).unwrap();
    assert_eq!(original, rehydrated);
    assert_eq!(restored.notify_group_for(&lab()).unwrap(), vec![member("zed")]);
    assert_eq!(
        restored.queue(&lab()).unwrap().auto_clear_timeout_secs,
        Some(90)
    );
    assert!(!restored.queue(&lab()).unwrap().is_open);
    assert!(recorder.types().is_empty());
}

async fn closed_with_waiter(policy: Duration) -> (Server, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
    let server = Server::new(ServerId::new("guild-1"), EngineConfig::default(), clock.clone());
    server.create_queue("Lab help", "cat-1").await.unwrap();
    server.set_auto_clear_timeout(&lab(), Some(policy)).await.unwrap();
    server.start_helping(member("bob"), vec![lab()]).await.unwrap();
    server.enqueue(&lab(), member("alice")).await.unwrap();
    server.stop_helping(&member("bob")).await.unwrap();
    (server, clock)
}

#[tokio::test(start_paused = true)]
async fn test_restore_rearms_remaining_auto_clear() {
    let (server, clock) = closed_with_waiter(Duration::from_secs(60)).await;
    let snapshot = server.snapshot();
    server.shutdown().await;
    assert!(snapshot.queues[0].last_closed_at.is_some());

    clock.advance(Duration::from_secs(20));
    let restored = Server::new(ServerId::new("guild-1"), EngineConfig::default(), clock);
    let recorder = Arc::new(Recorder::default());
    restored.register_extension(recorder.clone());
    restored.restore(snapshot.clone()).await;

    assert_eq!(
        restored.queue(&lab()).unwrap().last_closed_at,
        snapshot.queues[0].last_closed_at
    );
    assert!(restored.has_pending_auto_clear(&lab()));

    tokio::time::sleep(Duration::from_secs(39)).await;
    assert_eq!(restored.students(&lab()).unwrap().len(), 1);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(restored.students(&lab()).unwrap().is_empty());
    assert_eq!(recorder.types(), vec!["queue_clear"]);
}

#[tokio::test(start_paused = true)]
async fn test_restore_clears_overdue_queue() {
    let (server, clock) = closed_with_waiter(Duration::from_secs(60)).await;
    let snapshot = server.snapshot();
    server.shutdown().await;

    clock.advance(Duration::from_secs(3_600));
    let restored = Server::new(ServerId::new("guild-1"), EngineConfig::default(), clock);
    let recorder = Arc::new(Recorder::default());
    restored.register_extension(recorder.clone());
    restored.restore(snapshot).await;

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(restored.students(&lab()).unwrap().is_empty());
    assert_eq!(recorder.count("queue_clear"), 1);
}

#[tokio::test]
async fn test_restore_from_minimal_json() {
    let json = r#"{
        "queues": [{
            "topic_name": "Lab help",
            "parent_group_id": "cat-9",
            "waiting_list": [
                {"actor_id": "alice", "wait_start": "2024-01-01T10:00:00Z"},
                {"actor_id": "alice", "wait_start": "2024-01-01T10:05:00Z"}
            ]
        }]
    }"#;
    let snapshot: ServerSnapshot = serde_json::from_str(json).unwrap();
    let (server, _) = setup(EngineConfig::default()).await;
    server.restore(snapshot).await;

    let students = server.students(&QueueId::new("cat-9")).unwrap();
    assert_eq!(students.len(), 1);
    assert_eq!(
        students[0].entry(),
        WaitingEntry {
            actor_id: member("alice"),
            wait_start: "2024-01-01T10:00:00Z".parse().unwrap(),
        }
    );
}

/// Subscribes every joining student to the queue's notify group from a spawned task
struct AutoSubscribe {
    server: Mutex<Option<Server>>,
    done: tokio::sync::mpsc::UnboundedSender<bool>,
}

#[async_trait]
impl ServerExtension for AutoSubscribe {
    fn name(&self) -> &str {
        "auto-subscribe"
    }

    async fn on_student_join(&self, _: &ServerView, waiter: &Waiter, _: &QueueSnapshot) -> Result<()> {
        let Some(server) = self.server.lock().unwrap().clone() else {
            return Ok(());
        };
        let waiter = waiter.clone();
        let done = self.done.clone();
        tokio::spawn(async move {
            let added = server
                .add_to_notify_group(&waiter.queue_id, waiter.actor_id)
                .await
                .unwrap_or(false);
            let _ = done.send(added);
        });
        Ok(())
    }
}

#[tokio::test]
async fn test_hook_mutates_server_from_spawned_task() {
    let (server, _) = setup(EngineConfig::default()).await;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    server.register_extension(Arc::new(AutoSubscribe {
        server: Mutex::new(Some(server.clone())),
        done: tx,
    }));

    server.enqueue(&lab(), member("alice")).await.unwrap();
    assert_eq!(rx.recv().await, Some(true));
    assert_eq!(server.notify_group_for(&lab()).unwrap(), vec![member("alice")]);
}

#[tokio::test]
async fn test_registry_unregister_emits_server_delete() {
    let registry = ServerRegistry::new();
    let (server, recorder) = setup(EngineConfig::default()).await;
    registry.register(server.clone());

    let found = registry.get(&ServerId::new("guild-1")).unwrap();
    found.enqueue(&lab(), member("alice")).await.unwrap();
    assert_eq!(server.students(&lab()).unwrap().len(), 1);

    registry.unregister(&ServerId::new("guild-1")).await.unwrap();
    assert!(registry.get(&ServerId::new("guild-1")).is_none());
    assert_eq!(recorder.count("server_delete"), 1);
    match recorder.events().last() {
        Some(ServerEvent::ServerDelete { server_id }) => {
            assert_eq!(server_id, &ServerId::new("guild-1"))
        }
        other => panic!("unexpected event {:?}", other),
    }
}
