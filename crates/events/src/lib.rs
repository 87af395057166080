//! CloudBox lifecycle events.
//!
//! - [`EventBus`] — in-process publish/subscribe hub backed by
//!   `tokio::sync::broadcast`.
//! - [`PlatformEvent`] — the event envelope, with the function lifecycle
//!   names in [`names`].
//! - [`EventLogger`] — background subscriber that writes every event to
//!   the structured log.

pub mod bus;
pub mod logger;

pub use bus::{names, EventBus, PlatformEvent};
pub use logger::EventLogger;
