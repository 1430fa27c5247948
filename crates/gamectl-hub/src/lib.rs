//! Realtime broadcast hub for the gamectl control plane.
//!
//! Relays event-bus traffic to many long-lived WebSocket clients with
//! per-client backpressure isolation, and routes inbound client frames
//! (subscriptions, console commands, status queries) back into the
//! supervisor.

pub mod hub;
pub mod protocol;
pub mod ws;

// Re-export commonly used types for convenience
pub use hub::{ClientHandle, Hub, HubConfig};
pub use protocol::{ClientMessage, Outbound, Reply};
pub use ws::{event_ws, router};
