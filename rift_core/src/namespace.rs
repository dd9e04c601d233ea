//! Logical channels multiplexed over one physical session.
//!
//! A namespace is identified by a path (empty string is the default
//! channel) and bound to exactly one connection. Application code talks to
//! the peer through [`Namespace::emit`], [`Namespace::call`] and
//! [`Namespace::send`]; inbound packets for the path are routed here by the
//! connection and fanned out through the shared per-path [`EventEmitter`].

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::oneshot;

use crate::{
    connection::Connection,
    emitter::{self, Ack, EventEmitter, HandlerId, IntoHandler},
    error::{CallError, EmitError},
    packet::{self, Packet},
};

/// One logical channel over a session.
pub struct Namespace {
    endpoint: String,
    /// Write-only back-reference; the connection owns its namespaces, never
    /// the other way around.
    conn: Weak<Connection>,
    emitter: Arc<EventEmitter>,
    connected: AtomicBool,
    next_ack_id: AtomicU64,
    /// Outstanding acknowledged calls, keyed by correlation id. Entries are
    /// reclaimed when the matching ack arrives or the call times out.
    waiting: DashMap<u64, oneshot::Sender<String>>,
}

impl Namespace {
    pub(crate) fn new(conn: Weak<Connection>, endpoint: &str, emitter: Arc<EventEmitter>) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            conn,
            emitter,
            connected: AtomicBool::new(false),
            next_ack_id: AtomicU64::new(1),
            waiting: DashMap::new(),
        }
    }

    /// The namespace path; empty for the default channel.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// The owning session's id, if the connection is still alive.
    #[must_use]
    pub fn session_id(&self) -> Option<String> {
        self.conn.upgrade().map(|c| c.id().to_string())
    }

    /// Whether this namespace currently has a live channel to the peer.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// The handler registry shared by every session's namespace at this path.
    #[must_use]
    pub fn emitter(&self) -> &Arc<EventEmitter> {
        &self.emitter
    }

    /// Register a handler on this namespace's path. See [`EventEmitter::on`].
    pub fn on<M, H: IntoHandler<M>>(&self, name: &str, handler: H) -> HandlerId {
        self.emitter.on(name, handler)
    }

    /// Fire-and-forget an event to the peer.
    pub fn emit<A: Serialize>(&self, name: &str, args: A) -> Result<(), EmitError> {
        let args = emitter::encode_args(&args).map_err(EmitError::Encode)?;
        self.emit_json(name, &args)
    }

    /// Emit with pre-serialized arguments; the broadcast path uses this to
    /// serialize once for many namespaces.
    pub(crate) fn emit_json(&self, name: &str, args: &str) -> Result<(), EmitError> {
        if !self.is_connected() {
            return Err(EmitError::NotConnected);
        }
        self.send_packet(&Packet::Event {
            id: 0,
            endpoint: self.endpoint.clone(),
            name: name.to_string(),
            args: args.to_string(),
        })
    }

    /// Emit an event and wait for the peer's acknowledgment.
    ///
    /// The ack's JSON result array is decoded into `R` (use a tuple to
    /// capture several reply slots). On timeout the pending registration is
    /// reclaimed and [`CallError::Timeout`] returned.
    pub async fn call<A, R>(&self, name: &str, timeout: Duration, args: A) -> Result<R, CallError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        if !self.is_connected() {
            return Err(CallError::NotConnected);
        }

        let args = emitter::encode_args(&args).map_err(CallError::Encode)?;
        let id = self.next_ack_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.waiting.insert(id, tx);

        let packet = Packet::Event {
            id,
            endpoint: self.endpoint.clone(),
            name: name.to_string(),
            args,
        };
        if let Err(e) = self.send_packet(&packet) {
            self.waiting.remove(&id);
            return Err(e.into());
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(raw)) => serde_json::from_str(&raw).map_err(CallError::Decode),
            Ok(Err(_)) => {
                self.waiting.remove(&id);
                Err(CallError::Closed)
            }
            Err(_elapsed) => {
                self.waiting.remove(&id);
                Err(CallError::Timeout)
            }
        }
    }

    /// Send an arbitrary JSON-encodable value as a plain message packet.
    pub fn send<T: Serialize>(&self, message: T) -> Result<(), EmitError> {
        if !self.is_connected() {
            return Err(EmitError::NotConnected);
        }
        let data = serde_json::to_string(&message).map_err(EmitError::Encode)?;
        self.send_packet(&Packet::Json {
            id: 0,
            endpoint: self.endpoint.clone(),
            data,
        })
    }

    /// Route one decoded inbound packet addressed to this namespace.
    pub(crate) fn on_packet(self: &Arc<Self>, packet: Packet) {
        match packet {
            Packet::Disconnect { .. } => self.on_disconnect(),
            Packet::Connect { .. } => self.on_connect(),
            Packet::Event { id, name, args, .. } => self.on_event(id, &name, &args),
            Packet::Ack { ack_id, args } => self.on_ack(ack_id, args),
            Packet::Json { data, .. } => self.on_message(format!("[{data}]")),
            Packet::Message { data, .. } => {
                match serde_json::to_string(&data) {
                    Ok(quoted) => self.on_message(format!("[{quoted}]")),
                    Err(e) => tracing::warn!(error = %e, "failed to quote message payload"),
                }
            }
            other => {
                tracing::debug!(endpoint = %self.endpoint, packet = ?other, "ignoring packet");
            }
        }
    }

    fn on_event(self: &Arc<Self>, id: u64, name: &str, args: &str) {
        let ack = Ack::new(self.clone(), id);
        self.emitter.emit_raw(self.clone(), name, args, ack);
    }

    fn on_ack(&self, ack_id: u64, args: String) {
        if let Some((_, tx)) = self.waiting.remove(&ack_id) {
            let _ = tx.send(args);
        }
    }

    /// Plain and JSON messages are rewrapped as a one-element argument array
    /// and dispatched under the event name `message`.
    fn on_message(self: &Arc<Self>, args: String) {
        if self.is_connected() {
            self.emitter
                .emit_raw(self.clone(), "message", &args, Ack::detached());
        }
    }

    pub(crate) fn on_connect(self: &Arc<Self>) {
        if self
            .connected
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.emitter.emit_local(self.clone(), "connect");
            let _ = self.emit("connect", ());
        }
    }

    pub(crate) fn on_disconnect(self: &Arc<Self>) {
        let _ = self.send_packet(&Packet::Disconnect {
            endpoint: self.endpoint.clone(),
        });
        self.emitter.emit_local(self.clone(), "disconnect");
        self.connected.store(false, Ordering::SeqCst);
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub(crate) fn emit_local(self: &Arc<Self>, name: &str) {
        self.emitter.emit_local(self.clone(), name);
    }

    /// Encode and enqueue one packet on the owning connection.
    pub(crate) fn send_packet(&self, packet: &Packet) -> Result<(), EmitError> {
        let frame = packet::encode_packet(&self.endpoint, packet);
        if !self.is_connected() {
            tracing::warn!(
                endpoint = %self.endpoint,
                frame = %String::from_utf8_lossy(&frame),
                "dropping packet for unconnected namespace"
            );
            return Err(EmitError::NotConnected);
        }
        let conn = self.conn.upgrade().ok_or(EmitError::Closed)?;
        tracing::trace!(sid = %conn.id(), frame = %String::from_utf8_lossy(&frame), "send packet");
        conn.write(frame).map_err(|_| EmitError::Closed)
    }

    #[cfg(test)]
    pub(crate) fn waiting_acks(&self) -> usize {
        self.waiting.len()
    }
}

impl std::fmt::Debug for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Namespace")
            .field("endpoint", &self.endpoint)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}
