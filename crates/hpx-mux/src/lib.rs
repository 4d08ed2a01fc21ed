//! # hpx-mux
//!
//! One lazily opened, reference-counted WebSocket connection shared by many
//! independent subscriptions.
//!
//! ## Features
//!
//! - **Acknowledged connections**: a connection only counts as open once the
//!   server's first message is the acknowledgment literal (`"ack"` by default)
//! - **Lazy sharing**: the first lease opens the connection, concurrent leases
//!   share the same attempt, and the last release closes it gracefully
//! - **Multiplexing**: every subscription gets a fresh numeric identifier and
//!   only sees the responses addressed to it
//! - **Silent retry**: subscriptions survive abnormal closures (code 1006)
//!   with a new identifier on a new connection; any other close code is fatal
//!
//! ## Wire format
//!
//! ```text
//! client -> server  {"id": 0, "request": "givemewaves"}
//! server -> client  {"id": 0, "response": "🌊"}
//! either direction  {"complete": 0}
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hpx_mux::{LazyConnectionManager, MuxConfig, SubscriptionMultiplexer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = LazyConnectionManager::new(MuxConfig::new("ws://127.0.0.1:8080"))?;
//!     let mux = SubscriptionMultiplexer::new(manager);
//!
//!     let subscription = mux.subscribe("givemewaves", |wave, completer| {
//!         println!("{wave}");
//!         completer.complete();
//!     });
//!     subscription.wait().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection;
pub mod envelope;
pub mod error;
pub mod manager;
pub mod multiplexer;
mod reconnect;
pub mod routes;
pub mod terminal;

#[cfg(test)]
mod test_support;

// Re-export commonly used types
pub use config::MuxConfig;
pub use connection::{
    Completer, Connected, ConnectionHandle, Connector, WsConnector, connect,
};
pub use envelope::{Envelope, SubscriptionId};
pub use error::{
    ABNORMAL_CLOSURE, MuxError, MuxResult, NO_STATUS_RECEIVED, NORMAL_CLOSURE, PROTOCOL_ERROR,
};
pub use manager::{LazyConnectionManager, Lease, Releaser};
pub use multiplexer::{
    Subscription, SubscriptionCompleter, SubscriptionMultiplexer, SubscriptionState,
};
pub use routes::{Route, RouteTable};
pub use terminal::{CloseInfo, Terminal, TerminalState};
