//! The top-level HTTP-facing server: handshakes, session registry, request
//! routing and the broadcast surface.
//!
//! Request routing follows `/<resource>/<protocol>/<transport>/<sid>`:
//!
//! | `sid` segment      | Handling                                         |
//! |--------------------|--------------------------------------------------|
//! | absent             | handshake: issue a sid, record it, return config |
//! | unknown, unclaimed | claim the handshake, create the connection       |
//! | known              | route straight into the session's transport      |
//!
//! Unclaimed handshakes are garbage-collected after a 30 second TTL.

use std::{
    collections::HashMap,
    fmt::Write as _,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc, Weak,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use axum::{
    extract::{Query, Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use bytes::Bytes;
use dashmap::DashMap;
use rift_transport::Creater;
use serde::Serialize;

use crate::{
    broadcast::Broadcaster,
    connection::{Connection, ServerCallback},
    emitter::{EventEmitter, HandlerId, IntoHandler},
    error::{ConnectionDisallowed, InvalidTransport},
    namespace::Namespace,
    stats::{StatsCollector, StatsSnapshot},
    store::{Message, PubSub, StoreError},
};

/// How often unclaimed handshakes are swept.
const HANDSHAKE_GC_INTERVAL: Duration = Duration::from_secs(10);

/// How long an unclaimed handshake survives.
const HANDSHAKE_TTL_SECS: u64 = 30;

/// Runtime configuration for a [`Server`].
#[derive(Debug, Clone)]
pub struct Config {
    /// How long a close may wait for the last payload to flush, and how
    /// long the peer has to answer heartbeats.
    pub ping_timeout: Duration,
    /// Interval between heartbeat packets.
    pub ping_interval: Duration,
    /// How long a polling GET may idle before a keep-alive frame.
    pub polling_timeout: Duration,
    /// Admission ceiling; exceeding it answers 503.
    pub max_connections: usize,
    /// Whether an established session may switch transports.
    pub allow_upgrades: bool,
    /// Name of the session cookie.
    pub cookie: String,
    /// First path segment this server answers under.
    pub resource_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ping_timeout: Duration::from_secs(60),
            ping_interval: Duration::from_secs(12),
            polling_timeout: Duration::from_secs(20),
            max_connections: 20_000,
            allow_upgrades: true,
            cookie: String::from("io"),
            resource_name: String::from("net.io"),
        }
    }
}

type AdmissionHook = Arc<dyn Fn(&Request) -> Result<(), ConnectionDisallowed> + Send + Sync>;
type IdGenerator = Arc<dyn Fn(&Request) -> String + Send + Sync>;

/// The parsed shape of one incoming request path.
#[derive(Debug, Clone)]
pub struct IoRequest {
    /// First path segment (the resource name).
    pub resource: String,
    /// Protocol revision segment.
    pub protocol: i32,
    /// Requested transport name.
    pub transport: String,
    /// Session id; empty routes to handshake.
    pub sid: String,
    /// Decoded query parameters.
    pub query: HashMap<String, String>,
}

impl IoRequest {
    pub(crate) fn parse(req: &Request) -> Self {
        let mut segments = req.uri().path().split('/');
        segments.next(); // leading slash
        let resource = segments.next().unwrap_or_default().to_string();
        let protocol = segments
            .next()
            .and_then(|s| s.parse().ok())
            .unwrap_or_default();
        let transport = segments.next().unwrap_or_default().to_string();
        let sid = segments.next().unwrap_or_default().to_string();
        let query = Query::<HashMap<String, String>>::try_from_uri(req.uri())
            .map(|Query(q)| q)
            .unwrap_or_default();

        Self {
            resource,
            protocol,
            transport,
            sid,
            query,
        }
    }
}

/// A transient record of an issued-but-unclaimed handshake.
#[derive(Debug, Clone)]
pub struct HandshakeRecord {
    /// The resource segment the handshake arrived under.
    pub namespace: String,
    /// Protocol revision.
    pub protocol: i32,
    /// Transport named in the handshake path, if any.
    pub transport: String,
    /// The issued session id.
    pub sid: String,
    /// Peer address, when the listener provides connect info.
    pub address: Option<String>,
    /// Request URL.
    pub url: String,
    /// Whether the request carried an `Origin` header.
    pub xdomain: bool,
    /// Creation time, unix seconds.
    pub time: u64,
    /// Set once a session claims the record.
    pub issued: bool,
}

/// Lookup table of registered transport constructors.
#[derive(Debug, Default)]
pub struct TransportRegistry {
    creaters: HashMap<&'static str, Creater>,
}

impl TransportRegistry {
    pub(crate) fn register(&mut self, creater: Creater) {
        self.creaters.insert(creater.name, creater);
    }

    pub(crate) fn get(&self, name: &str) -> Option<Creater> {
        self.creaters.get(name).copied()
    }
}

fn creater_for(name: &str) -> Option<Creater> {
    match name {
        "xhr-polling" => Some(rift_polling::XHR_CREATER),
        "jsonp-polling" => Some(rift_polling::JSONP_CREATER),
        "websocket" => Some(rift_websocket::CREATER),
        _ => None,
    }
}

/// Builder for a [`Server`].
pub struct ServerBuilder {
    config: Config,
    allow_request: AdmissionHook,
    new_id: IdGenerator,
    transports: Vec<String>,
    pubsub: Option<Arc<dyn PubSub>>,
}

impl ServerBuilder {
    fn new() -> Self {
        Self {
            config: Config::default(),
            allow_request: Arc::new(|_req| Ok(())),
            new_id: Arc::new(default_session_id),
            transports: vec![
                String::from("xhr-polling"),
                String::from("jsonp-polling"),
                String::from("websocket"),
            ],
            pubsub: None,
        }
    }

    /// Set the ping timeout (default 60 s).
    #[must_use]
    pub fn ping_timeout(mut self, timeout: Duration) -> Self {
        self.config.ping_timeout = timeout;
        self
    }

    /// Set the heartbeat interval (default 12 s).
    #[must_use]
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.config.ping_interval = interval;
        self
    }

    /// Set the polling idle timeout (default 20 s).
    #[must_use]
    pub fn polling_timeout(mut self, timeout: Duration) -> Self {
        self.config.polling_timeout = timeout;
        self
    }

    /// Set the concurrent-connection ceiling (default 20 000).
    #[must_use]
    pub fn max_connections(mut self, max: usize) -> Self {
        self.config.max_connections = max;
        self
    }

    /// Allow or forbid transport upgrades (default allowed).
    #[must_use]
    pub fn allow_upgrades(mut self, allow: bool) -> Self {
        self.config.allow_upgrades = allow;
        self
    }

    /// Set the session cookie name (default `io`).
    #[must_use]
    pub fn cookie(mut self, name: impl Into<String>) -> Self {
        self.config.cookie = name.into();
        self
    }

    /// Set the resource name (default `net.io`).
    #[must_use]
    pub fn resource_name(mut self, name: impl Into<String>) -> Self {
        self.config.resource_name = name.into();
        self
    }

    /// Restrict the advertised transports, in order.
    #[must_use]
    pub fn transports(mut self, names: &[&str]) -> Self {
        self.transports = names.iter().map(|n| (*n).to_string()).collect();
        self
    }

    /// Install an admission hook; a rejection answers the handshake with
    /// HTTP 400.
    #[must_use]
    pub fn allow_request<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Request) -> Result<(), ConnectionDisallowed> + Send + Sync + 'static,
    {
        self.allow_request = Arc::new(hook);
        self
    }

    /// Replace the session-id generator.
    #[must_use]
    pub fn session_id_generator<F>(mut self, generator: F) -> Self
    where
        F: Fn(&Request) -> String + Send + Sync + 'static,
    {
        self.new_id = Arc::new(generator);
        self
    }

    /// Attach an external publish/subscribe store for cross-process
    /// dispatch.
    #[must_use]
    pub fn pubsub(mut self, store: Arc<dyn PubSub>) -> Self {
        self.pubsub = Some(store);
        self
    }

    /// Build the server and start its background tasks.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTransport`] when an unknown transport name was
    /// requested.
    pub fn build(self) -> Result<Arc<Server>, InvalidTransport> {
        let mut registry = TransportRegistry::default();
        let mut transport_names = Vec::with_capacity(self.transports.len());
        for name in &self.transports {
            let creater = creater_for(name).ok_or_else(|| InvalidTransport(name.clone()))?;
            transport_names.push(creater.name);
            registry.register(creater);
        }

        let server = Arc::new(Server {
            config: self.config,
            allow_request: self.allow_request,
            new_id: self.new_id,
            registry,
            transport_names,
            sessions: DashMap::new(),
            handshakes: DashMap::new(),
            current_connections: AtomicI64::new(0),
            stats: StatsCollector::new(),
            emitters: DashMap::new(),
            pubsub: self.pubsub,
        });
        server.spawn_handshake_gc();
        server.spawn_stats_flush();
        server.spawn_remote_dispatch();
        Ok(server)
    }
}

/// The session registry and HTTP entry point.
pub struct Server {
    config: Config,
    allow_request: AdmissionHook,
    new_id: IdGenerator,
    registry: TransportRegistry,
    transport_names: Vec<&'static str>,
    sessions: DashMap<String, Arc<Connection>>,
    handshakes: DashMap<String, HandshakeRecord>,
    current_connections: AtomicI64,
    stats: StatsCollector,
    emitters: DashMap<String, Arc<EventEmitter>>,
    pubsub: Option<Arc<dyn PubSub>>,
}

impl Server {
    /// Start configuring a server.
    #[must_use]
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Build a server with default configuration and all transports.
    ///
    /// # Panics
    ///
    /// Never panics: the default transport set is always valid.
    #[must_use]
    pub fn new() -> Arc<Self> {
        ServerBuilder::new()
            .build()
            .expect("default transports are valid")
    }

    /// An axum router that feeds every request under this server's paths
    /// into [`Server::handle`].
    #[must_use]
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/{*path}", any(route_request))
            .with_state(self.clone())
    }

    /// Resolve and serve one HTTP request.
    pub async fn handle(self: &Arc<Self>, req: Request) -> Response {
        self.stats.connection_opened();
        let io_req = IoRequest::parse(&req);
        let response = if io_req.sid.is_empty() {
            self.handle_handshake(&io_req, &req)
        } else {
            self.handle_session(&io_req, req).await
        };
        self.stats.connection_closed();
        response
    }

    fn handle_handshake(&self, io_req: &IoRequest, req: &Request) -> Response {
        let cors = cors_headers(req.headers());

        if let Err(denied) = (self.allow_request)(req) {
            tracing::debug!(reason = %denied.reason, "handshake rejected by admission hook");
            return with_headers(
                (StatusCode::BAD_REQUEST, denied.reason).into_response(),
                cors,
            );
        }

        let sid = (self.new_id)(req);
        let record = HandshakeRecord {
            namespace: io_req.resource.clone(),
            protocol: io_req.protocol,
            transport: io_req.transport.clone(),
            sid: sid.clone(),
            address: req
                .extensions()
                .get::<axum::extract::ConnectInfo<std::net::SocketAddr>>()
                .map(|info| info.0.to_string()),
            url: req.uri().to_string(),
            xdomain: req.headers().contains_key(header::ORIGIN),
            time: unix_now(),
            issued: false,
        };
        self.handshakes.insert(sid.clone(), record);
        tracing::debug!(%sid, "handshake issued");

        let body = format!(
            "{sid}:{}:{}:{}",
            self.config.ping_interval.as_secs(),
            self.config.polling_timeout.as_secs(),
            self.transport_names.join(",")
        );

        let response = match io_req.query.get("jsonp") {
            Some(index) => (
                [(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("application/javascript; charset=UTF-8"),
                )],
                format!("io.j[{index}](\"{body}\");"),
            )
                .into_response(),
            None => (
                [(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("text/plain; charset=UTF-8"),
                )],
                body,
            )
                .into_response(),
        };
        with_headers(response, cors)
    }

    async fn handle_session(self: &Arc<Self>, io_req: &IoRequest, req: Request) -> Response {
        let conn = match self.sessions.get(&io_req.sid).map(|c| c.clone()) {
            Some(conn) => conn,
            None => {
                // First request bearing this sid: claim the handshake.
                if self.handshakes.remove(&io_req.sid).is_none() {
                    return (StatusCode::BAD_REQUEST, "invalid sid").into_response();
                }

                let open = self.current_connections.fetch_add(1, Ordering::SeqCst) + 1;
                if open > self.config.max_connections as i64 {
                    self.current_connections.fetch_sub(1, Ordering::SeqCst);
                    return (StatusCode::SERVICE_UNAVAILABLE, "too many connections")
                        .into_response();
                }

                let callback: Arc<dyn ServerCallback> = self.clone();
                let conn = Connection::open(io_req.sid.clone(), callback);
                self.sessions.insert(io_req.sid.clone(), conn.clone());
                tracing::info!(sid = %io_req.sid, transport = %io_req.transport, "session created");
                conn
            }
        };

        self.stats.session_opened();
        let mut response = conn.serve(io_req, req).await;
        if let Ok(cookie) = HeaderValue::from_str(&format!("{}={}", self.config.cookie, io_req.sid))
        {
            response.headers_mut().append(header::SET_COOKIE, cookie);
        }
        self.stats.session_closed();
        response
    }

    /// The shared handler registry for the namespace at `name`.
    #[must_use]
    pub fn of(&self, name: &str) -> Arc<EventEmitter> {
        self.emitters
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(EventEmitter::new()))
            .clone()
    }

    /// Register a handler on the default namespace.
    pub fn on<M, H: IntoHandler<M>>(&self, name: &str, handler: H) -> HandlerId {
        self.of("").on(name, handler)
    }

    /// Remove one default-namespace registration.
    pub fn remove_listener(&self, name: &str, id: HandlerId) {
        self.of("").remove_listener(name, id);
    }

    /// Remove every default-namespace registration for `name`.
    pub fn remove_all_listeners(&self, name: &str) {
        self.of("").remove_all_listeners(name);
    }

    /// A broadcaster over `name`'s namespace in every live session.
    #[must_use]
    pub fn in_namespace(&self, name: &str) -> Broadcaster {
        let namespaces = self
            .sessions
            .iter()
            .map(|entry| entry.value().of(name))
            .collect();
        Broadcaster::new(namespaces)
    }

    /// Emit an event on the default namespace of every live session.
    pub fn broadcast<A: Serialize>(&self, name: &str, args: A) {
        self.in_namespace("").broadcast(name, args);
    }

    /// A default-namespace broadcaster excluding `ns`.
    #[must_use]
    pub fn except(&self, ns: &Arc<Namespace>) -> Broadcaster {
        self.in_namespace("").except(ns)
    }

    /// Look up a live session.
    #[must_use]
    pub fn session(&self, sid: &str) -> Option<Arc<Connection>> {
        self.sessions.get(sid).map(|c| c.clone())
    }

    /// How many sessions are currently registered.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// A point-in-time dump of the server's counters.
    #[must_use]
    pub fn stats_snapshot(&self) -> StatsSnapshot {
        self.stats.dump()
    }

    /// Publish a raw payload for `sid` through the configured store, so a
    /// peer process owning that session can deliver it.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when the store rejects the message. Without
    /// a configured store this is a no-op.
    pub async fn publish_remote(&self, sid: &str, data: Bytes) -> Result<(), StoreError> {
        let Some(store) = &self.pubsub else {
            return Ok(());
        };
        store
            .publish(
                &self.dispatch_subject(),
                Message {
                    id: sid.to_string(),
                    data,
                },
            )
            .await
    }

    fn dispatch_subject(&self) -> String {
        format!("{}.dispatch-remote", self.config.resource_name)
    }

    pub(crate) fn collect_stale_handshakes(&self, now: u64) {
        self.handshakes.retain(|sid, record| {
            let keep = record.issued || now.saturating_sub(record.time) <= HANDSHAKE_TTL_SECS;
            if !keep {
                tracing::trace!(%sid, "collected stale handshake");
            }
            keep
        });
    }

    fn spawn_handshake_gc(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HANDSHAKE_GC_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(server) = weak.upgrade() else { break };
                server.collect_stale_handshakes(unix_now());
            }
        });
    }

    fn spawn_stats_flush(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(server) = weak.upgrade() else { break };
                server.stats.flush();
            }
        });
    }

    fn spawn_remote_dispatch(self: &Arc<Self>) {
        let Some(store) = self.pubsub.clone() else {
            return;
        };
        let weak: Weak<Server> = Arc::downgrade(self);
        let subject = self.dispatch_subject();
        tokio::spawn(async move {
            let rx = match store.subscribe(&subject).await {
                Ok(rx) => rx,
                Err(e) => {
                    tracing::warn!(error = %e, "remote dispatch unavailable");
                    return;
                }
            };
            while let Ok(msg) = rx.recv().await {
                let Some(server) = weak.upgrade() else { break };
                if let Some(conn) = server.sessions.get(&msg.id).map(|c| c.clone()) {
                    if let Err(e) = conn.write(msg.data.clone()) {
                        tracing::debug!(sid = %msg.id, error = %e, "remote dispatch to closed session");
                    }
                }
            }
        });
    }
}

impl ServerCallback for Server {
    fn config(&self) -> &Config {
        &self.config
    }

    fn transports(&self) -> &TransportRegistry {
        &self.registry
    }

    fn on_close(&self, sid: &str) {
        self.sessions.remove(sid);
        self.current_connections.fetch_sub(1, Ordering::SeqCst);
        tracing::debug!(%sid, "session removed");
    }

    fn emitter(&self, endpoint: &str) -> Arc<EventEmitter> {
        self.of(endpoint)
    }

    fn stats(&self) -> &StatsCollector {
        &self.stats
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("sessions", &self.sessions.len())
            .field("transports", &self.transport_names)
            .finish_non_exhaustive()
    }
}

async fn route_request(State(server): State<Arc<Server>>, req: Request) -> Response {
    server.handle(req).await
}

fn default_session_id(_req: &Request) -> String {
    let bytes: [u8; 16] = rand::random();
    let mut out = String::with_capacity(32);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

fn cors_headers(headers: &HeaderMap) -> Vec<(HeaderName, HeaderValue)> {
    let Some(origin) = headers.get(header::ORIGIN) else {
        return Vec::new();
    };
    vec![
        (header::ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone()),
        (
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("POST, GET, OPTIONS"),
        ),
        (
            header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
            HeaderValue::from_static("true"),
        ),
    ]
}

fn with_headers(mut response: Response, headers: Vec<(HeaderName, HeaderValue)>) -> Response {
    for (name, value) in headers {
        response.headers_mut().insert(name, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};

    async fn body_string(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        String::from_utf8(bytes.to_vec()).expect("utf8 body")
    }

    fn get(uri: &str) -> Request {
        Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .expect("request")
    }

    async fn handshake_sid(server: &Arc<Server>) -> String {
        let response = server.handle(get("/net.io/1/")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_string(response).await;
        body.split(':').next().expect("sid segment").to_string()
    }

    #[tokio::test]
    async fn handshake_advertises_config_and_transports() {
        let server = Server::new();
        let response = server.handle(get("/net.io/1/")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok()),
            Some("text/plain; charset=UTF-8")
        );

        let body = body_string(response).await;
        let parts: Vec<&str> = body.split(':').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0].len(), 32);
        assert_eq!(parts[1], "12");
        assert_eq!(parts[2], "20");
        assert_eq!(parts[3], "xhr-polling,jsonp-polling,websocket");
        assert!(server.handshakes.contains_key(parts[0]));
    }

    #[tokio::test]
    async fn jsonp_handshake_is_wrapped() {
        let server = Server::new();
        let response = server.handle(get("/net.io/1/?jsonp=3")).await;
        assert_eq!(
            response
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok()),
            Some("application/javascript; charset=UTF-8")
        );
        let body = body_string(response).await;
        assert!(body.starts_with("io.j[3](\""), "unexpected body: {body}");
        assert!(body.ends_with("\");"));
    }

    #[tokio::test]
    async fn handshake_echoes_origin() {
        let server = Server::new();
        let request = Request::builder()
            .method("GET")
            .uri("/net.io/1/")
            .header(header::ORIGIN, "http://example.com")
            .body(Body::empty())
            .expect("request");

        let response = server.handle(request).await;
        assert_eq!(
            response
                .headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .and_then(|v| v.to_str().ok()),
            Some("http://example.com")
        );
        assert_eq!(
            response
                .headers()
                .get(header::ACCESS_CONTROL_ALLOW_CREDENTIALS)
                .and_then(|v| v.to_str().ok()),
            Some("true")
        );
    }

    #[tokio::test]
    async fn admission_hook_rejects_handshake() {
        let server = Server::builder()
            .allow_request(|_req| Err(ConnectionDisallowed::new("banned")))
            .build()
            .expect("build");

        let response = server.handle(get("/net.io/1/")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_string(response).await, "banned");
    }

    #[tokio::test]
    async fn unknown_sid_is_rejected() {
        let server = Server::new();
        let response = server
            .handle(get("/net.io/1/xhr-polling/not-a-session"))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_string(response).await, "invalid sid");
    }

    #[tokio::test]
    async fn first_request_claims_handshake_and_sets_cookie() {
        let server = Server::builder()
            .polling_timeout(Duration::from_millis(50))
            .build()
            .expect("build");
        let sid = handshake_sid(&server).await;

        let response = server
            .handle(get(&format!("/net.io/1/xhr-polling/{sid}")))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        // The synthetic connect packet is the first payload.
        assert_eq!(body_string(response).await, "1::");

        assert!(!server.handshakes.contains_key(&sid));
        assert_eq!(server.session_count(), 1);

        let response = server
            .handle(get(&format!("/net.io/1/xhr-polling/{sid}")))
            .await;
        let cookie = response
            .headers()
            .get(header::SET_COOKIE)
            .and_then(|v| v.to_str().ok())
            .expect("cookie");
        assert_eq!(cookie, format!("io={sid}"));
    }

    #[tokio::test]
    async fn connection_limit_answers_service_unavailable() {
        let server = Server::builder()
            .max_connections(1)
            .build()
            .expect("build");

        let sid1 = handshake_sid(&server).await;
        let sid2 = handshake_sid(&server).await;

        let response = server
            .handle(get(&format!("/net.io/1/xhr-polling/{sid1}")))
            .await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = server
            .handle(get(&format!("/net.io/1/xhr-polling/{sid2}")))
            .await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn invalid_transport_name_is_rejected() {
        let server = Server::new();
        let sid = handshake_sid(&server).await;

        let response = server
            .handle(get(&format!("/net.io/1/carrier-pigeon/{sid}")))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_string(response).await.contains("invalid transport"));
    }

    #[tokio::test]
    async fn stale_handshakes_are_collected() {
        let server = Server::new();
        let sid = handshake_sid(&server).await;
        assert!(server.handshakes.contains_key(&sid));

        server.collect_stale_handshakes(unix_now() + HANDSHAKE_TTL_SECS + 1);
        assert!(!server.handshakes.contains_key(&sid));
    }

    #[tokio::test]
    async fn broadcast_reaches_every_session() {
        let server = Server::new();
        let sid1 = handshake_sid(&server).await;
        let sid2 = handshake_sid(&server).await;

        for sid in [&sid1, &sid2] {
            let response = server
                .handle(get(&format!("/net.io/1/xhr-polling/{sid}")))
                .await;
            assert_eq!(body_string(response).await, "1::");
        }

        server.broadcast("news", ("hello",));

        for sid in [&sid1, &sid2] {
            let response = server
                .handle(get(&format!("/net.io/1/xhr-polling/{sid}")))
                .await;
            let body = body_string(response).await;
            assert!(
                body.contains(r#"{"name":"news","args":["hello"]}"#),
                "unexpected payload: {body}"
            );
        }
    }

    #[tokio::test]
    async fn builder_rejects_unknown_transport() {
        let result = Server::builder().transports(&["telegraph"]).build();
        assert!(matches!(result, Err(InvalidTransport(name)) if name == "telegraph"));
    }

    #[tokio::test]
    async fn remote_dispatch_writes_into_the_session() {
        use crate::store::MemoryPubSub;

        let server = Server::builder()
            .pubsub(Arc::new(MemoryPubSub::new()))
            .polling_timeout(Duration::from_millis(50))
            .build()
            .expect("build");

        let sid = handshake_sid(&server).await;
        let response = server
            .handle(get(&format!("/net.io/1/xhr-polling/{sid}")))
            .await;
        assert_eq!(body_string(response).await, "1::");

        server
            .publish_remote(&sid, Bytes::from_static(b"5:::{\"name\":\"remote\",\"args\":[]}"))
            .await
            .expect("publish");
        tokio::time::sleep(Duration::from_millis(50)).await;

        let response = server
            .handle(get(&format!("/net.io/1/xhr-polling/{sid}")))
            .await;
        let body = body_string(response).await;
        assert!(body.contains("remote"), "unexpected payload: {body}");
    }

    #[tokio::test]
    async fn stats_track_request_and_session_gauges() {
        let server = Server::builder()
            .polling_timeout(Duration::from_millis(50))
            .build()
            .expect("build");

        let sid = handshake_sid(&server).await;
        server
            .handle(get(&format!("/net.io/1/xhr-polling/{sid}")))
            .await;

        let snapshot = server.stats_snapshot();
        assert!(snapshot.max_connections >= 1);
        assert!(snapshot.max_sessions >= 1);
        assert_eq!(snapshot.active_connections, 0);
        assert_eq!(snapshot.active_sessions, 0);
    }
}
