//! # Rift transport contract
//!
//! A transport is the physical byte-carrying mechanism under a session: an
//! HTTP long-poll pair, or a persistent full-duplex socket. Transports do
//! not understand packet semantics; they move opaque byte buffers between
//! the wire and the connection that owns them.
//!
//! A transport instance is constructed per-session with a [`Hooks`] handle
//! back into its owning connection:
//!
//! ```text
//! wire ──► Transport::serve ──► Hooks::on_raw_message ──► connection decode
//! connection encode ──► Hooks::sender_chan ──► Transport ──► wire
//! ```

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::{extract::Request, response::Response};
use bytes::Bytes;

/// Callbacks a transport invokes on its owning connection.
///
/// The connection hands one of these to every transport it creates. All
/// methods are synchronous and must not block; `on_raw_message` may fan work
/// out to background tasks.
pub trait Hooks: Send + Sync + 'static {
    /// The outbound channel this transport drains. Each received buffer is
    /// one fully framed payload, ready for the wire.
    fn sender_chan(&self) -> async_channel::Receiver<Bytes>;

    /// A raw inbound buffer arrived from the wire.
    fn on_raw_message(&self, data: &[u8]);

    /// A raw buffer is about to be dispatched to the wire (accounting only).
    fn on_raw_dispatch(&self, data: &[u8]);

    /// This transport instance closed. `transport` is the instance id handed
    /// to the [`Creater`] at construction, or `None` when no transport was
    /// ever attached.
    fn on_transport_close(&self, transport: Option<u64>);
}

/// Per-instance options the connection passes down at construction time.
#[derive(Debug, Clone, Copy)]
pub struct TransportOptions {
    /// How long a long-poll request may idle before a keep-alive frame is
    /// returned. Unused by persistent-socket transports.
    pub poll_timeout: Duration,
}

/// A named transport constructor, registered with the server by name.
#[derive(Clone, Copy)]
pub struct Creater {
    /// The wire name of the transport (`xhr-polling`, `websocket`, …).
    pub name: &'static str,

    /// Whether switching an established session to this transport counts as
    /// an upgrade.
    pub upgrading: bool,

    /// Construct a transport instance. The id tags close notifications so
    /// the connection can tell which instance is reporting.
    pub server: fn(u64, Arc<dyn Hooks>, TransportOptions) -> Arc<dyn Transport>,
}

impl std::fmt::Debug for Creater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Creater")
            .field("name", &self.name)
            .field("upgrading", &self.upgrading)
            .finish_non_exhaustive()
    }
}

/// A server-side transport instance bound to one session.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// The instance id assigned at construction.
    fn id(&self) -> u64;

    /// Handle one HTTP request addressed to this transport.
    ///
    /// Long-poll transports serve many requests over their lifetime; a
    /// socket transport consumes exactly one (the upgrade) and rejects the
    /// rest.
    async fn serve(&self, req: Request) -> Response;

    /// Close the transport. Repeated or concurrent closes after the first
    /// are no-ops.
    async fn close(&self);
}
