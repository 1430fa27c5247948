//! Process supervision runtime for the gamectl control plane.
//!
//! Owns the lifecycle of supervised game-server processes: spawning and
//! terminating them, capturing their output, applying crash/auto-restart
//! policy, sampling resource usage, and coordinating batch operations.

pub mod batch;
pub mod daemon;
pub mod logs;
pub mod resources;
pub mod shutdown;
pub mod supervisor;

// Re-export commonly used types for convenience
pub use batch::{BatchCoordinator, BatchKind, BatchOperation, BatchStatus, TargetResult};
pub use daemon::{Daemon, DaemonConfig};
pub use logs::{LogLine, LogSink};
pub use resources::ResourceSampler;
pub use supervisor::{SupervisionHook, Supervisor, SupervisorConfig};
