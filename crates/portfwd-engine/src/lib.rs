//! portfwd Engine Library
//!
//! TCP port forwarding with per-connection traffic history:
//! - [`Forwarder`]: listener lifecycle, accept loop and connection counters
//! - Relay sessions copying bytes both ways and recording every chunk
//! - [`Transmission`]: the recorded conversation of one connection
//! - [`EventBus`]: notifications for observers, one queue per subscriber

pub mod config;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod notification;
mod session;
pub mod transmission;

pub use config::EngineConfig;
pub use engine::Forwarder;
pub use error::ForwardError;
pub use notification::{EventBus, Notification, NotificationKind};
pub use transmission::{Direction, MessageEvent, SessionState, Transmission};
