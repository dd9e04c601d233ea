//! # Rift
//!
//! A real-time bidirectional messaging server over HTTP: clients open a
//! session through a handshake, exchange framed packets over a negotiated
//! transport (XHR or JSONP long-polling, or a persistent websocket),
//! multiplex logical namespaces over the session, and invoke remote event
//! handlers with optional acknowledgment replies.
//!
//! The usual wiring:
//!
//! ```ignore
//! let server = rift_core::Server::builder()
//!     .resource_name("net.io")
//!     .build()?;
//!
//! server.on("news", |ns: rift_core::Context, message: String| {
//!     let _ = ns.emit("news", (message,));
//! });
//!
//! axum::serve(listener, server.router()).await?;
//! ```

pub mod broadcast;
pub mod connection;
pub mod emitter;
pub mod error;
pub mod namespace;
pub mod packet;
pub mod payload;
pub mod server;
pub mod stats;
pub mod store;

pub use broadcast::Broadcaster;
pub use connection::Connection;
pub use emitter::{Ack, Context, EventEmitter, HandlerId, IntoHandler};
pub use error::{AckError, CallError, ConnectionDisallowed, EmitError, InvalidTransport};
pub use namespace::Namespace;
pub use packet::Packet;
pub use server::{Config, Server, ServerBuilder};
