// ABOUTME: Root library module for the office-hours server process
// ABOUTME: SQLite snapshot store, attendance and audit extensions, plus engine re-exports

pub mod attendance;
pub mod audit;
pub mod store;

// Re-export the engine so the binary and tests need a single import path
pub use officehours_core::{
    clock, config, error, extension, ids, metrics, paths, queue, registry, server, session,
    snapshot,
};
pub use officehours_core::{Config, Server, ServerExtension, ServerRegistry};

pub use attendance::AttendanceExtension;
pub use audit::AuditLogExtension;
pub use store::SqliteSnapshotStore;
