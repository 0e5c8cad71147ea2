//! Client engine for ephemeral, end-to-end-encrypted direct messaging.
//!
//! [`MessagingClient`] is the entry point. Message state is driven by a
//! fixed-cadence poll; the websocket signal channel only carries typing
//! hints and read-receipt mirrors, and the engine stays correct without it.

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod message;
pub mod roster;
pub mod session;
pub mod signal;
pub mod store;
pub mod sync;
pub mod timers;
pub mod transport;
pub mod typing;

pub use client::MessagingClient;
pub use config::{load_settings, ClientSettings};
pub use events::ClientEvent;
pub use message::{DeliveryState, Message, UNAVAILABLE_BODY};
pub use session::SessionContext;
pub use signal::{ConnectionState, ReconnectPolicy};
pub use store::SendOptions;

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;
