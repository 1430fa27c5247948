//! Domain model, event bus and ports for the gamectl control plane.
//!
//! This crate has no process or network I/O: it defines the instance
//! record, the canonical event union, the in-process pub/sub bus, the
//! error taxonomy, and the instance-store port the runtime consumes.

pub mod bus;
pub mod error;
pub mod events;
pub mod instance;
pub mod store;

// Re-export commonly used types for convenience
pub use bus::{EventBus, EventHandler, FnHandler};
pub use error::{BatchError, StoreError, SupervisorError};
pub use events::{Event, EventKind, StatusReply};
pub use instance::{Instance, InstanceStatus, LaunchSpec, ResourceSnapshot, now_ms};
pub use store::{InstanceStore, MemoryInstanceStore};
