//! Shared contract between the `server` binary and its `supervisor` parent.
//!
//! Kept in its own crate so a version mismatch between the two binaries is a
//! compile-time dependency question, not a magic number duplicated in two
//! places.

use serde::{Deserialize, Serialize};

/// Exit code the server uses to mean "please respawn me, this isn't a
/// crash". The supervisor must not count this toward the crash circuit
/// breaker. Do not overload this value for anything else.
pub const RESTART_EXIT_CODE: i32 = 75;

/// How many non-zero, non-restart exits within [`CRASH_WINDOW`] trip the
/// supervisor's circuit breaker.
pub const CRASH_THRESHOLD: usize = 3;

/// Sliding window the supervisor uses to count crashes.
pub const CRASH_WINDOW: std::time::Duration = std::time::Duration::from_secs(30);

/// Grace period the supervisor waits after a restart-coded exit before
/// respawning.
pub const RESTART_BACKOFF: std::time::Duration = std::time::Duration::from_secs(1);

/// Grace period the supervisor waits after any other non-zero exit.
pub const CRASH_BACKOFF: std::time::Duration = std::time::Duration::from_secs(3);

/// How long the supervisor waits for the child to exit after a graceful
/// shutdown request before sending a hard kill.
pub const HARD_KILL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Messages sent over the supervisor -> server IPC channel (a line-delimited
/// JSON pipe over the child's stdin). This is portable to platforms where
/// Unix signals are not available to deliver to a child process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SupervisorMessage {
    /// Ask the server to shut down gracefully (flush persistence, notify
    /// connected clients, then exit 0).
    Shutdown,
}

/// Messages the server may write back to the supervisor over stdout, used
/// only for diagnostics (the supervisor does not otherwise interpret the
/// child's stdout).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Ready { port: u16 },
}
