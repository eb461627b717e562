//! Real-time delivery: the connection registry, the message router, the
//! recall state machine and the WebSocket connection loops.

pub mod auth;
pub mod connection;
pub mod recall;
pub mod registry;
pub mod router;
pub mod store;

pub use registry::{ConnectionRegistry, RegistryConfig, SendOutcome};
pub use router::MessageRouter;
pub use store::Stores;
