//! Presence and messaging hub.
//!
//! A [`Hub`] owns the registry of live connections and the single event
//! loop that mutates it. Each socket is driven by [`run_connection`], which
//! splits it into a reader that feeds the [`Dispatcher`] and a writer that
//! drains the connection's bounded outbound queue.

pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod gate;
pub mod hub;
mod presence;
pub mod rate_limit;
pub mod registry;
pub mod session;

pub use config::HubConfig;
pub use connection::{CloseReason, Connection, ConnectionId, ConnectionState, Delivery, Frame};
pub use dispatch::Dispatcher;
pub use error::HubError;
pub use gate::{MessageStore, PrivacyGate, SocialGraph};
pub use hub::{Handshake, Hub, TypingTarget};
pub use registry::Registry;
pub use session::run_connection;
