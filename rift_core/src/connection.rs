//! The per-session connection state machine.
//!
//! A connection owns exactly one active transport (plus at most one mid
//! upgrade), an unbounded outbound buffering queue, a heartbeat monitor and
//! the namespace map for its session. Raw bytes arrive from the transport,
//! are split into frames and decoded, and each packet is routed to its
//! namespace; writes from any namespace funnel through the outbound pump,
//! which coalesces every buffer queued at that moment into a single framed
//! payload per drain cycle.
//!
//! Lifecycle: `normal → upgrading → normal` on a successful transport
//! switch, or `normal|upgrading → closing → closed` on teardown.

use std::sync::{
    atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicU8, Ordering},
    Arc, Mutex, RwLock, Weak,
};

use axum::{
    extract::Request,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use dashmap::DashMap;
use rift_transport::{Creater, Hooks, Transport, TransportOptions};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;

use crate::{
    emitter::EventEmitter,
    error::ClosedError,
    namespace::Namespace,
    packet::{self, Packet},
    payload,
    server::{Config, IoRequest, TransportRegistry},
    stats::StatsCollector,
};

/// Unanswered heartbeat intervals tolerated before the connection is closed.
const MAX_MISSED_HEARTBEATS: i32 = 2;

/// What the connection needs from the server that owns it.
pub(crate) trait ServerCallback: Send + Sync + 'static {
    fn config(&self) -> &Config;
    fn transports(&self) -> &TransportRegistry;
    fn on_close(&self, sid: &str);
    fn emitter(&self, endpoint: &str) -> Arc<EventEmitter>;
    fn stats(&self) -> &StatsCollector;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum State {
    Normal = 0,
    Upgrading = 1,
    Closing = 2,
    Closed = 3,
}

fn state_from(raw: u8) -> State {
    match raw {
        0 => State::Normal,
        1 => State::Upgrading,
        2 => State::Closing,
        _ => State::Closed,
    }
}

#[derive(Clone)]
struct Slot {
    name: String,
    transport: Arc<dyn Transport>,
}

#[derive(Default)]
struct Slots {
    current: Option<Slot>,
    upgrading: Option<Slot>,
}

/// One client session: transport ownership, outbound queue, heartbeat and
/// namespace multiplexing.
pub struct Connection {
    id: String,
    callback: Arc<dyn ServerCallback>,
    self_ref: Weak<Connection>,

    /// Read-mostly: routing reads vastly outnumber upgrade swaps.
    slots: RwLock<Slots>,
    state: AtomicU8,

    /// Feeds the outbound pump; taking it closes the queue.
    in_tx: Mutex<Option<UnboundedSender<Bytes>>>,
    /// Drained by whichever transport is currently attached.
    sender_rx: async_channel::Receiver<Bytes>,

    missed_heartbeats: AtomicI32,
    heartbeat: CancellationToken,

    namespaces: DashMap<String, Arc<Namespace>>,
    transport_seq: AtomicU64,
    /// Guards the registry notification so it fires exactly once no matter
    /// how many close paths race.
    close_notified: AtomicBool,
}

impl Connection {
    /// Create the session, start its pump and heartbeat, and emit the
    /// synthetic connect on the default namespace.
    pub(crate) fn open(id: String, callback: Arc<dyn ServerCallback>) -> Arc<Self> {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (sender_tx, sender_rx) = async_channel::bounded(1);

        let conn = Arc::new_cyclic(|weak: &Weak<Connection>| Self {
            id,
            callback,
            self_ref: weak.clone(),
            slots: RwLock::new(Slots::default()),
            state: AtomicU8::new(State::Normal as u8),
            in_tx: Mutex::new(Some(in_tx)),
            sender_rx,
            missed_heartbeats: AtomicI32::new(0),
            heartbeat: CancellationToken::new(),
            namespaces: DashMap::new(),
            transport_seq: AtomicU64::new(1),
            close_notified: AtomicBool::new(false),
        });

        tokio::spawn(outbound_pump(Arc::downgrade(&conn), in_rx, sender_tx));
        conn.spawn_heartbeat();

        let default_ns = conn.of("");
        default_ns.set_connected(true);
        let _ = default_ns.send_packet(&Packet::Connect {
            endpoint: String::new(),
        });
        default_ns.emit_local("connect");

        conn
    }

    /// The session id, immutable after creation.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The namespace at `name`, created lazily on first reference.
    pub fn of(self: &Arc<Self>, name: &str) -> Arc<Namespace> {
        self.namespaces
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(Namespace::new(
                    Arc::downgrade(self),
                    name,
                    self.callback.emitter(name),
                ))
            })
            .clone()
    }

    /// Route one HTTP request into the session's transport, creating or
    /// upgrading the transport as the request's name demands.
    pub(crate) async fn serve(self: &Arc<Self>, io_req: &IoRequest, req: Request) -> Response {
        let requested = io_req.transport.as_str();

        let current_name = self
            .slots
            .read()
            .expect("transport slots poisoned")
            .current
            .as_ref()
            .map(|s| s.name.clone());

        match current_name {
            None => {
                let Some(creater) = self.callback.transports().get(requested) else {
                    return invalid_transport(requested);
                };
                let transport = self.new_transport(&creater);
                self.set_current(creater.name, transport);
            }
            Some(name) if name != requested => {
                if !self.callback.config().allow_upgrades {
                    return invalid_transport(requested);
                }
                let Some(creater) = self.callback.transports().get(requested) else {
                    return invalid_transport(requested);
                };
                // The switch takes effect on this very request: install the
                // new transport, swap, and only then close the old one.
                let transport = self.new_transport(&creater);
                self.set_upgrading(creater.name, transport);
                self.upgraded();
            }
            Some(_) => {}
        }

        let Some(transport) = self.current_transport() else {
            return (StatusCode::INTERNAL_SERVER_ERROR, "no transport attached").into_response();
        };
        transport.serve(req).await
    }

    /// Close the session: disconnect namespaces, stop the heartbeat and
    /// tear down the outbound queue. Concurrent calls collapse into one.
    pub fn close(&self) {
        let transitioned = self
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |raw| {
                match state_from(raw) {
                    State::Normal | State::Upgrading => Some(State::Closing as u8),
                    State::Closing | State::Closed => None,
                }
            });
        if transitioned.is_err() {
            return;
        }
        tracing::debug!(sid = %self.id, "closing connection");

        if let Some(upgrading) = self
            .slots
            .read()
            .expect("transport slots poisoned")
            .upgrading
            .clone()
        {
            spawn_close(upgrading.transport);
        }

        let namespaces: Vec<Arc<Namespace>> =
            self.namespaces.iter().map(|e| e.value().clone()).collect();
        for ns in &namespaces {
            ns.on_disconnect();
        }
        if let Some(default_ns) = self.namespaces.get("") {
            default_ns.value().emit_local("close");
        }

        self.heartbeat.cancel();
        // Closing the queue lets the pump flush what is pending (bounded by
        // the ping timeout) and then close the transport.
        self.in_tx.lock().expect("outbound queue lock poisoned").take();
    }

    /// Enqueue one encoded packet for the peer.
    pub(crate) fn write(&self, frame: Bytes) -> Result<(), ClosedError> {
        if self.state() == State::Closed {
            return Err(ClosedError);
        }
        let guard = self.in_tx.lock().expect("outbound queue lock poisoned");
        match guard.as_ref() {
            Some(tx) => tx.send(frame).map_err(|_| ClosedError),
            None => Err(ClosedError),
        }
    }

    pub(crate) fn state(&self) -> State {
        state_from(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn new_transport(self: &Arc<Self>, creater: &Creater) -> Arc<dyn Transport> {
        let id = self.transport_seq.fetch_add(1, Ordering::Relaxed);
        let hooks: Arc<dyn Hooks> = self.clone();
        let options = TransportOptions {
            poll_timeout: self.callback.config().polling_timeout,
        };
        (creater.server)(id, hooks, options)
    }

    fn current_transport(&self) -> Option<Arc<dyn Transport>> {
        self.slots
            .read()
            .expect("transport slots poisoned")
            .current
            .as_ref()
            .map(|s| s.transport.clone())
    }

    fn set_current(&self, name: &str, transport: Arc<dyn Transport>) {
        let mut slots = self.slots.write().expect("transport slots poisoned");
        slots.current = Some(Slot {
            name: name.to_string(),
            transport,
        });
    }

    fn set_upgrading(&self, name: &str, transport: Arc<dyn Transport>) {
        {
            let mut slots = self.slots.write().expect("transport slots poisoned");
            slots.upgrading = Some(Slot {
                name: name.to_string(),
                transport,
            });
        }
        self.set_state(State::Upgrading);
        tracing::debug!(sid = %self.id, transport = name, "transport upgrade started");
    }

    /// Promote the upgrading transport; the previous one is closed only
    /// after the swap, so there is no window with neither active.
    fn upgraded(&self) {
        let previous = {
            let mut slots = self.slots.write().expect("transport slots poisoned");
            let Some(upgrading) = slots.upgrading.take() else {
                return;
            };
            std::mem::replace(&mut slots.current, Some(upgrading))
        };
        if let Some(previous) = previous {
            tracing::debug!(sid = %self.id, transport = %previous.name, "closing replaced transport");
            spawn_close(previous.transport);
        }
        self.set_state(State::Normal);
    }

    fn clear_upgrading(&self) {
        self.slots
            .write()
            .expect("transport slots poisoned")
            .upgrading = None;
    }

    fn spawn_heartbeat(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let token = self.heartbeat.clone();
        let interval = self.callback.config().ping_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // An interval fires immediately; swallow the zeroth tick.
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(conn) = weak.upgrade() else { break };
                        let _ = conn.of("").send_packet(&Packet::Heartbeat);
                        let missed = conn.missed_heartbeats.fetch_add(1, Ordering::Relaxed) + 1;
                        if missed > MAX_MISSED_HEARTBEATS {
                            tracing::info!(sid = %conn.id, missed, "missed heartbeats, closing connection");
                            conn.close();
                            break;
                        }
                    }
                }
            }
        });
    }

    fn on_raw_packet(&self, raw: &[u8]) {
        let packet = match packet::decode_packet(raw) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(
                    sid = %self.id,
                    error = %e,
                    frame = %String::from_utf8_lossy(raw),
                    "dropping undecodable packet"
                );
                return;
            }
        };

        if packet.endpoint().is_empty() {
            self.on_packet(&packet);
        }

        let Some(this) = self.self_ref.upgrade() else {
            return;
        };
        let ns = this.of(packet.endpoint());
        ns.on_packet(packet);
    }

    /// Session-level handling for packets on the default endpoint.
    fn on_packet(&self, packet: &Packet) {
        let state = self.state();
        if state != State::Normal && state != State::Upgrading {
            return;
        }
        match packet {
            Packet::Heartbeat => {
                self.missed_heartbeats.store(0, Ordering::Relaxed);
            }
            Packet::Disconnect { endpoint } if endpoint.is_empty() => {
                self.close();
            }
            _ => {}
        }
    }
}

impl Hooks for Connection {
    fn sender_chan(&self) -> async_channel::Receiver<Bytes> {
        self.sender_rx.clone()
    }

    fn on_raw_message(&self, data: &[u8]) {
        tracing::trace!(sid = %self.id, frame = %String::from_utf8_lossy(data), ">>>");
        self.callback.stats().on_packets_recv(data.len() as i64);

        match payload::decode_frames(data) {
            Ok(frames) => {
                for frame in frames {
                    self.on_raw_packet(frame);
                }
            }
            Err(e) => {
                tracing::warn!(sid = %self.id, error = %e, "dropping undecodable payload");
            }
        }
    }

    fn on_raw_dispatch(&self, data: &[u8]) {
        tracing::trace!(sid = %self.id, frame = %String::from_utf8_lossy(data), "<<<");
        self.callback.stats().on_packets_sent(data.len() as i64);
    }

    fn on_transport_close(&self, closed: Option<u64>) {
        tracing::debug!(sid = %self.id, transport = ?closed, "transport closed");

        if let Some(closed_id) = closed {
            let (current, upgrading) = {
                let slots = self.slots.read().expect("transport slots poisoned");
                (slots.current.clone(), slots.upgrading.clone())
            };

            // A dying upgrade candidate does not take the session with it.
            if let Some(upgrading) = &upgrading {
                if upgrading.transport.id() == closed_id {
                    self.clear_upgrading();
                    spawn_close(upgrading.transport.clone());
                    return;
                }
            }

            let Some(current) = current else { return };
            if current.transport.id() != closed_id {
                return;
            }
            spawn_close(current.transport);
            if let Some(upgrading) = upgrading {
                spawn_close(upgrading.transport);
                self.clear_upgrading();
            }
        }

        self.set_state(State::Closed);
        self.heartbeat.cancel();
        self.in_tx.lock().expect("outbound queue lock poisoned").take();
        {
            // Drop the slots: a transport holds the connection through its
            // hooks, and the cycle must break for either to be freed.
            let mut slots = self.slots.write().expect("transport slots poisoned");
            slots.current = None;
            slots.upgrading = None;
        }
        if !self.close_notified.swap(true, Ordering::SeqCst) {
            self.callback.on_close(&self.id);
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn invalid_transport(name: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        format!("invalid transport {name}"),
    )
        .into_response()
}

fn spawn_close(transport: Arc<dyn Transport>) {
    tokio::spawn(async move { transport.close().await });
}

/// Coalesce queued buffers into one framed payload per drain cycle.
///
/// While buffers are pending, the pump races "another buffer arrives"
/// against "the transport is ready for a payload", so bursts of small
/// writes become one round-trip. When the queue closes, any remainder is
/// flushed (bounded by the ping timeout) and the transport closed; if no
/// transport was ever attached, the close completes directly.
async fn outbound_pump(
    conn: Weak<Connection>,
    mut in_rx: UnboundedReceiver<Bytes>,
    sender_tx: async_channel::Sender<Bytes>,
) {
    let mut pending: Vec<Bytes> = Vec::new();

    'recv: loop {
        if pending.is_empty() {
            match in_rx.recv().await {
                Some(frame) => pending.push(frame),
                None => break 'recv,
            }
        }

        tokio::select! {
            frame = in_rx.recv() => match frame {
                Some(frame) => pending.push(frame),
                None => break 'recv,
            },
            sent = sender_tx.send(payload::encode_payload(&pending)) => {
                if sent.is_err() {
                    return;
                }
                pending.clear();
            }
        }
    }

    let Some(conn) = conn.upgrade() else { return };

    let Some(transport) = conn.current_transport() else {
        tracing::debug!(sid = %conn.id, "queue closed with no transport attached");
        conn.on_transport_close(None);
        return;
    };

    if !pending.is_empty() {
        let flush = sender_tx.send(payload::encode_payload(&pending));
        if tokio::time::timeout(conn.callback.config().ping_timeout, flush)
            .await
            .is_err()
        {
            tracing::debug!(sid = %conn.id, "flush timed out, dropping pending payload");
        }
    }
    transport.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emitter::{Ack, Context};
    use axum::body::{to_bytes, Body};
    use std::{
        collections::HashMap,
        sync::atomic::AtomicUsize,
        time::Duration,
    };

    struct TestCallback {
        config: Config,
        registry: TransportRegistry,
        emitters: DashMap<String, Arc<EventEmitter>>,
        stats: StatsCollector,
        closes: AtomicUsize,
    }

    impl TestCallback {
        fn new(config: Config) -> Arc<Self> {
            let mut registry = TransportRegistry::default();
            registry.register(rift_polling::XHR_CREATER);
            registry.register(rift_polling::JSONP_CREATER);
            Arc::new(Self {
                config,
                registry,
                emitters: DashMap::new(),
                stats: StatsCollector::new(),
                closes: AtomicUsize::new(0),
            })
        }

        fn close_count(&self) -> usize {
            self.closes.load(Ordering::SeqCst)
        }
    }

    impl ServerCallback for TestCallback {
        fn config(&self) -> &Config {
            &self.config
        }

        fn transports(&self) -> &TransportRegistry {
            &self.registry
        }

        fn on_close(&self, _sid: &str) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }

        fn emitter(&self, endpoint: &str) -> Arc<EventEmitter> {
            self.emitters
                .entry(endpoint.to_string())
                .or_insert_with(|| Arc::new(EventEmitter::new()))
                .clone()
        }

        fn stats(&self) -> &StatsCollector {
            &self.stats
        }
    }

    fn quiet_config() -> Config {
        Config {
            ping_interval: Duration::from_secs(600),
            ..Config::default()
        }
    }

    fn open(config: Config) -> (Arc<TestCallback>, Arc<Connection>) {
        let callback = TestCallback::new(config);
        let cb: Arc<dyn ServerCallback> = callback.clone();
        let conn = Connection::open(String::from("sid-test"), cb);
        (callback, conn)
    }

    async fn next_payload(conn: &Arc<Connection>) -> String {
        let rx = conn.sender_chan();
        let payload = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("no payload before timeout")
            .expect("sender channel closed");
        String::from_utf8(payload.to_vec()).expect("utf8 payload")
    }

    fn io_req(transport: &str) -> IoRequest {
        IoRequest {
            resource: String::from("net.io"),
            protocol: 1,
            transport: transport.to_string(),
            sid: String::from("sid-test"),
            query: HashMap::new(),
        }
    }

    fn get_request(uri: &str) -> Request {
        Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .expect("request")
    }

    async fn body_string(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        String::from_utf8(bytes.to_vec()).expect("utf8 body")
    }

    #[tokio::test]
    async fn open_emits_synthetic_connect() {
        let (_callback, conn) = open(quiet_config());
        assert_eq!(next_payload(&conn).await, "1::");
        assert_eq!(conn.state(), State::Normal);
    }

    #[tokio::test]
    async fn missed_heartbeats_close_exactly_once() {
        let (callback, conn) = open(Config {
            ping_interval: Duration::from_millis(20),
            ping_timeout: Duration::from_millis(100),
            ..Config::default()
        });

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(callback.close_count(), 1);
        assert_eq!(conn.state(), State::Closed);
    }

    #[tokio::test]
    async fn answered_heartbeats_keep_the_session_alive() {
        let (callback, conn) = open(Config {
            ping_interval: Duration::from_millis(30),
            ..Config::default()
        });

        for _ in 0..8 {
            tokio::time::sleep(Duration::from_millis(25)).await;
            conn.on_raw_message(b"2::");
        }
        assert_eq!(callback.close_count(), 0);
        assert_ne!(conn.state(), State::Closed);
    }

    #[tokio::test]
    async fn concurrent_closes_remove_the_session_once() {
        let (callback, conn) = open(quiet_config());

        let a = conn.clone();
        let b = conn.clone();
        let (ra, rb) = tokio::join!(
            tokio::spawn(async move { a.close() }),
            tokio::spawn(async move { b.close() })
        );
        ra.expect("close task");
        rb.expect("close task");
        conn.close();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(callback.close_count(), 1);
        assert_eq!(conn.state(), State::Closed);
    }

    #[tokio::test]
    async fn inbound_disconnect_packet_closes_the_session() {
        let (callback, conn) = open(quiet_config());

        conn.on_raw_message(b"0::");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(callback.close_count(), 1);
    }

    #[tokio::test]
    async fn writes_after_close_fail() {
        let (_callback, conn) = open(quiet_config());
        conn.close();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(conn.write(Bytes::from_static(b"2::")).is_err());
    }

    #[tokio::test]
    async fn handler_with_ack_parameter_answers_the_event() {
        let (_callback, conn) = open(quiet_config());
        assert_eq!(next_payload(&conn).await, "1::");

        let ns = conn.of("");
        ns.on("add", |_ctx: Context, a: i64, b: i64, ack: Ack| {
            let _ = ack.send((a + b,));
        });

        conn.on_raw_message(br#"5:9::{"name":"add","args":[2,3]}"#);
        assert_eq!(next_payload(&conn).await, "6:::9+[5]");
    }

    #[tokio::test]
    async fn handler_return_value_becomes_the_ack() {
        let (_callback, conn) = open(quiet_config());
        assert_eq!(next_payload(&conn).await, "1::");

        let ns = conn.of("");
        ns.on("add", |_ctx: Context, a: i64, b: i64| a + b);

        conn.on_raw_message(br#"5:4::{"name":"add","args":[2,3]}"#);
        assert_eq!(next_payload(&conn).await, "6:::4+[5]");
    }

    #[tokio::test]
    async fn unacknowledged_event_sends_no_reply() {
        let (_callback, conn) = open(quiet_config());
        assert_eq!(next_payload(&conn).await, "1::");

        let ns = conn.of("");
        ns.on("add", |_ctx: Context, a: i64, b: i64| a + b);

        // No id on the packet, so the return value is discarded.
        conn.on_raw_message(br#"5:::{"name":"add","args":[2,3]}"#);
        let rx = conn.sender_chan();
        assert!(
            tokio::time::timeout(Duration::from_millis(100), rx.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn call_resolves_from_matching_ack() {
        let (_callback, conn) = open(quiet_config());
        assert_eq!(next_payload(&conn).await, "1::");
        let ns = conn.of("");

        let pending = {
            let ns = ns.clone();
            tokio::spawn(async move {
                ns.call::<_, (String,)>("greet", Duration::from_secs(1), ("bob",))
                    .await
            })
        };

        let outbound = next_payload(&conn).await;
        assert!(
            outbound.starts_with("5:1::"),
            "expected acknowledged event, got {outbound}"
        );
        assert!(outbound.contains(r#""name":"greet""#));

        conn.on_raw_message(br#"6:::1+["hi bob"]"#);
        let reply = pending.await.expect("join").expect("call");
        assert_eq!(reply.0, "hi bob");
        assert_eq!(ns.waiting_acks(), 0);
    }

    #[tokio::test]
    async fn call_timeout_reclaims_the_waiting_entry() {
        let (_callback, conn) = open(quiet_config());
        assert_eq!(next_payload(&conn).await, "1::");
        let ns = conn.of("");

        let result = ns
            .call::<_, (String,)>("greet", Duration::from_millis(50), ("bob",))
            .await;
        assert!(matches!(result, Err(crate::error::CallError::Timeout)));
        assert_eq!(ns.waiting_acks(), 0);
    }

    #[tokio::test]
    async fn upgrade_swaps_transports_without_losing_data() {
        let (_callback, conn) = open(Config {
            polling_timeout: Duration::from_millis(50),
            ..quiet_config()
        });

        // First request attaches xhr-polling and drains the connect packet.
        let response = conn
            .serve(&io_req("xhr-polling"), get_request("/net.io/1/xhr-polling/sid-test"))
            .await;
        assert_eq!(body_string(response).await, "1::");

        conn.of("").emit("evt", ("x",)).expect("emit");

        // A request naming a different transport swaps in place; the queued
        // event arrives on the new transport.
        let response = conn
            .serve(
                &io_req("jsonp-polling"),
                get_request("/net.io/1/jsonp-polling/sid-test?i=0"),
            )
            .await;
        let body = body_string(response).await;
        assert!(body.starts_with("io.j[0]("), "unexpected body: {body}");
        assert!(body.contains("evt"), "payload lost in upgrade: {body}");
        assert_eq!(conn.state(), State::Normal);

        // Nothing queued now: the next poll idles out, proving the event
        // was delivered exactly once.
        let response = conn
            .serve(
                &io_req("jsonp-polling"),
                get_request("/net.io/1/jsonp-polling/sid-test?i=0"),
            )
            .await;
        let body = body_string(response).await;
        assert!(body.contains("8::"), "unexpected body: {body}");
        assert!(!body.contains("evt"));
    }

    #[tokio::test]
    async fn unknown_transport_name_is_rejected() {
        let (_callback, conn) = open(quiet_config());
        let response = conn
            .serve(&io_req("bogus"), get_request("/net.io/1/bogus/sid-test"))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn upgrades_can_be_disabled() {
        let (_callback, conn) = open(Config {
            allow_upgrades: false,
            polling_timeout: Duration::from_millis(50),
            ..quiet_config()
        });

        let response = conn
            .serve(&io_req("xhr-polling"), get_request("/net.io/1/xhr-polling/sid-test"))
            .await;
        assert_eq!(body_string(response).await, "1::");

        let response = conn
            .serve(
                &io_req("jsonp-polling"),
                get_request("/net.io/1/jsonp-polling/sid-test"),
            )
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn client_connect_packet_opens_a_namespace() {
        let (_callback, conn) = open(quiet_config());
        assert_eq!(next_payload(&conn).await, "1::");

        let chat = conn.of("/chat");
        assert!(!chat.is_connected());
        assert!(chat.emit("news", ("x",)).is_err());

        conn.on_raw_message(b"1::/chat");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(chat.is_connected());

        // The namespace answers the connect over the wire.
        let payload = next_payload(&conn).await;
        assert!(
            payload.contains(r#"5::/chat:{"name":"connect","args":[]}"#),
            "unexpected payload: {payload}"
        );
    }

    #[tokio::test]
    async fn malformed_packet_is_dropped_but_siblings_survive() {
        let (_callback, conn) = open(quiet_config());
        assert_eq!(next_payload(&conn).await, "1::");

        let ns = conn.of("");
        ns.on("ok", |_ctx: Context, ack: Ack| {
            let _ = ack.send(("fine",));
        });

        // Payload with one garbage frame and one valid acknowledged event.
        let raw = "\u{FFFD}8\u{FFFD}9:zz:bad\u{FFFD}28\u{FFFD}5:3::{\"name\":\"ok\",\"args\":[]}";
        conn.on_raw_message(raw.as_bytes());
        assert_eq!(next_payload(&conn).await, "6:::3+[\"fine\"]");
    }
}
