//! Canonical event union for the control plane.
//!
//! Every state change observable from outside the core flows through this
//! enum: supervisor lifecycle transitions, daemon crash/restart decisions,
//! resource samples, per-instance log lines, and batch progress. The hub
//! relays these to connected clients verbatim.
//!
//! # Wire Format
//!
//! Events are serialized with a `type` tag:
//!
//! ```json
//! { "type": "server_crashed", "instance_id": "lobby", "restart_attempts": 2, ... }
//! ```

use serde::{Deserialize, Serialize};

use crate::instance::InstanceStatus;

/// Field-less discriminant of [`Event`], used as the subscription key on the
/// event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ServerStarting,
    ServerStarted,
    ServerStopping,
    ServerStopped,
    ServerCrashed,
    ServerRestartFailed,
    ServerLog,
    ResourceUsage,
    BatchProgress,
    BatchComplete,
}

impl EventKind {
    /// Every kind, in a stable order. Used by the hub to subscribe to the
    /// whole stream.
    pub const ALL: &'static [Self] = &[
        Self::ServerStarting,
        Self::ServerStarted,
        Self::ServerStopping,
        Self::ServerStopped,
        Self::ServerCrashed,
        Self::ServerRestartFailed,
        Self::ServerLog,
        Self::ResourceUsage,
        Self::BatchProgress,
        Self::BatchComplete,
    ];
}

/// Control-plane event, passed by value to every subscriber.
///
/// Events are best-effort and in-memory only: no delivery ordering is
/// guaranteed across producers, and no history is persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Spawn has been issued for an instance.
    ServerStarting {
        /// Instance the event belongs to.
        instance_id: String,
    },

    /// The instance process is up and registered.
    ServerStarted {
        instance_id: String,
        /// OS process ID.
        pid: u32,
    },

    /// Graceful shutdown has been initiated.
    ServerStopping { instance_id: String },

    /// The instance stopped as requested.
    ServerStopped { instance_id: String },

    /// The instance process exited without a stop request.
    ServerCrashed {
        instance_id: String,
        /// Exit code when the OS reported one.
        #[serde(skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        /// Consecutive crash count, including this one.
        restart_attempts: u32,
        /// Configured attempt bound.
        max_restart_attempts: u32,
        /// Whether the daemon will attempt another restart.
        will_restart: bool,
    },

    /// Auto-restart attempts are exhausted; the instance stays crashed
    /// until a manual start.
    ServerRestartFailed {
        instance_id: String,
        /// Attempts made before giving up.
        attempts: u32,
    },

    /// One line of process output.
    ServerLog {
        instance_id: String,
        /// The log line, without trailing newline.
        line: String,
    },

    /// Periodic resource usage sample for a running instance.
    ResourceUsage {
        instance_id: String,
        cpu_percent: f32,
        memory_bytes: u64,
    },

    /// A batch operation finished one more target.
    BatchProgress {
        /// Batch operation ID.
        operation_id: String,
        /// Percent complete, 0–100, monotonically non-decreasing.
        progress: u8,
        /// Targets processed so far.
        completed: u32,
        /// Total targets in the batch.
        total: u32,
    },

    /// A batch operation ran to completion.
    BatchComplete {
        operation_id: String,
        /// Final status as its wire name (`completed`, `failed`,
        /// `partial_success`).
        status: String,
        /// Targets that succeeded.
        succeeded: u32,
        /// Targets that failed.
        failed: u32,
    },
}

impl Event {
    /// Discriminant used for bus subscriptions.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::ServerStarting { .. } => EventKind::ServerStarting,
            Self::ServerStarted { .. } => EventKind::ServerStarted,
            Self::ServerStopping { .. } => EventKind::ServerStopping,
            Self::ServerStopped { .. } => EventKind::ServerStopped,
            Self::ServerCrashed { .. } => EventKind::ServerCrashed,
            Self::ServerRestartFailed { .. } => EventKind::ServerRestartFailed,
            Self::ServerLog { .. } => EventKind::ServerLog,
            Self::ResourceUsage { .. } => EventKind::ResourceUsage,
            Self::BatchProgress { .. } => EventKind::BatchProgress,
            Self::BatchComplete { .. } => EventKind::BatchComplete,
        }
    }

    /// The instance this event is scoped to, if any.
    ///
    /// Batch events are global: the hub delivers them to every client
    /// regardless of subscriptions.
    #[must_use]
    pub fn instance_id(&self) -> Option<&str> {
        match self {
            Self::ServerStarting { instance_id }
            | Self::ServerStarted { instance_id, .. }
            | Self::ServerStopping { instance_id }
            | Self::ServerStopped { instance_id }
            | Self::ServerCrashed { instance_id, .. }
            | Self::ServerRestartFailed { instance_id, .. }
            | Self::ServerLog { instance_id, .. }
            | Self::ResourceUsage { instance_id, .. } => Some(instance_id),
            Self::BatchProgress { .. } | Self::BatchComplete { .. } => None,
        }
    }

    /// Stable wire name for logging and client-side routing.
    #[must_use]
    pub const fn event_name(&self) -> &'static str {
        match self {
            Self::ServerStarting { .. } => "server:starting",
            Self::ServerStarted { .. } => "server:started",
            Self::ServerStopping { .. } => "server:stopping",
            Self::ServerStopped { .. } => "server:stopped",
            Self::ServerCrashed { .. } => "server:crashed",
            Self::ServerRestartFailed { .. } => "server:restart_failed",
            Self::ServerLog { .. } => "server:log",
            Self::ResourceUsage { .. } => "server:resource_usage",
            Self::BatchProgress { .. } => "batch:progress",
            Self::BatchComplete { .. } => "batch:complete",
        }
    }
}

/// Status query reply the hub sends back to a single client.
///
/// Not a broadcast event: it only ever travels down the asking client's own
/// queue, so it lives outside the [`Event`] union's bus traffic but shares
/// the wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReply {
    pub instance_id: String,
    pub status: InstanceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}
