// ABOUTME: Queue and help-session lifecycle engine for chat-community office hours
// ABOUTME: Queues, helper sessions, and an extension event bus behind a per-community Server

pub mod clock;
pub mod config;
pub mod error;
pub mod extension;
pub mod ids;
pub mod metrics;
pub mod paths;
pub mod queue;
pub mod registry;
pub mod server;
pub mod session;
pub mod snapshot;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, EngineConfig};
pub use error::QueueError;
pub use extension::{ExtensionBus, ServerEvent, ServerExtension};
pub use ids::{MemberId, QueueId, ServerId};
pub use queue::{Queue, Waiter};
pub use registry::ServerRegistry;
pub use server::{Server, ServerView};
pub use session::{HelpSessionEntry, HelperSession, JustClaimed, SessionManager};
pub use snapshot::{QueueSnapshot, ServerSnapshot, SnapshotSink, WaitingEntry};
