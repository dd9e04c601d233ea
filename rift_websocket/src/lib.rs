//! Persistent full-duplex socket transport.
//!
//! A websocket transport consumes exactly one HTTP request (the upgrade)
//! and then runs two loops over the socket: a writer draining the
//! connection's outbound channel into text frames, and a reader forwarding
//! inbound text frames as raw messages. Either loop observing a failure
//! tears the whole transport down; the close signal is single-fire no
//! matter how many paths race into it.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        FromRequestParts, Request,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use rift_transport::{Creater, Hooks, Transport, TransportOptions};
use tokio_util::sync::CancellationToken;

/// The websocket transport.
pub const CREATER: Creater = Creater {
    name: "websocket",
    upgrading: true,
    server: new_server,
};

fn new_server(id: u64, hooks: Arc<dyn Hooks>, _options: TransportOptions) -> Arc<dyn Transport> {
    Arc::new(WebSocketTransport {
        id,
        hooks,
        upgraded: AtomicBool::new(false),
        shutdown: CancellationToken::new(),
        closed: Arc::new(AtomicBool::new(false)),
    })
}

/// A single persistent socket bound to one session.
pub struct WebSocketTransport {
    id: u64,
    hooks: Arc<dyn Hooks>,
    upgraded: AtomicBool,
    shutdown: CancellationToken,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn id(&self) -> u64 {
        self.id
    }

    async fn serve(&self, req: Request) -> Response {
        if self.upgraded.swap(true, Ordering::SeqCst) {
            // The socket is the session's only request; anything further
            // over plain HTTP is a protocol violation.
            return StatusCode::BAD_REQUEST.into_response();
        }

        let (mut parts, _body) = req.into_parts();
        let upgrade = match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
            Ok(upgrade) => upgrade,
            Err(rejection) => {
                tracing::warn!(transport = self.id, "websocket upgrade rejected");
                // Not upgraded after all; let the client retry.
                self.upgraded.store(false, Ordering::SeqCst);
                return rejection.into_response();
            }
        };

        let hooks = self.hooks.clone();
        let shutdown = self.shutdown.clone();
        let closed = self.closed.clone();
        let id = self.id;
        upgrade.on_upgrade(move |socket| async move {
            run_socket(socket, hooks, shutdown, closed, id).await;
        })
    }

    async fn close(&self) {
        self.shutdown.cancel();
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.hooks.on_transport_close(Some(self.id));
        }
    }
}

impl std::fmt::Debug for WebSocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketTransport")
            .field("id", &self.id)
            .field("upgraded", &self.upgraded.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

async fn run_socket(
    socket: WebSocket,
    hooks: Arc<dyn Hooks>,
    shutdown: CancellationToken,
    closed: Arc<AtomicBool>,
    id: u64,
) {
    let (mut sink, mut stream) = socket.split();
    let sender = hooks.sender_chan();

    let writer = {
        let hooks = hooks.clone();
        let shutdown = shutdown.clone();
        async move {
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    payload = sender.recv() => {
                        let Ok(payload) = payload else { break };
                        hooks.on_raw_dispatch(&payload);
                        let text = String::from_utf8_lossy(&payload).into_owned();
                        if let Err(e) = sink.send(Message::Text(text.into())).await {
                            tracing::debug!(transport = id, error = %e, "websocket write failed");
                            break;
                        }
                    }
                }
            }
        }
    };

    let reader = {
        let hooks = hooks.clone();
        let shutdown = shutdown.clone();
        async move {
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    frame = stream.next() => match frame {
                        Some(Ok(Message::Text(text))) => hooks.on_raw_message(text.as_bytes()),
                        Some(Ok(Message::Binary(_))) => {
                            tracing::warn!(transport = id, "ignoring binary websocket frame");
                        }
                        // The library answers pings on its own.
                        Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            tracing::debug!(transport = id, error = %e, "websocket read failed");
                            break;
                        }
                    }
                }
            }
        }
    };

    // Either side finishing (error, peer close, shutdown) ends the whole
    // transport.
    tokio::select! {
        () = writer => {}
        () = reader => {}
    }
    shutdown.cancel();

    if !closed.swap(true, Ordering::SeqCst) {
        hooks.on_transport_close(Some(id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use bytes::Bytes;
    use std::sync::Mutex;

    struct StubHooks {
        outbound_rx: async_channel::Receiver<Bytes>,
        closes: Mutex<Vec<Option<u64>>>,
    }

    impl StubHooks {
        fn new() -> Arc<Self> {
            let (_tx, outbound_rx) = async_channel::bounded(1);
            Arc::new(Self {
                outbound_rx,
                closes: Mutex::new(Vec::new()),
            })
        }

        fn closes(&self) -> Vec<Option<u64>> {
            self.closes.lock().expect("closes lock").clone()
        }
    }

    impl Hooks for StubHooks {
        fn sender_chan(&self) -> async_channel::Receiver<Bytes> {
            self.outbound_rx.clone()
        }

        fn on_raw_message(&self, _data: &[u8]) {}

        fn on_raw_dispatch(&self, _data: &[u8]) {}

        fn on_transport_close(&self, transport: Option<u64>) {
            self.closes.lock().expect("closes lock").push(transport);
        }
    }

    fn transport(hooks: &Arc<StubHooks>) -> Arc<dyn Transport> {
        let hooks: Arc<dyn Hooks> = hooks.clone();
        new_server(3, hooks, TransportOptions {
            poll_timeout: std::time::Duration::from_secs(1),
        })
    }

    #[tokio::test]
    async fn close_fires_exactly_once() {
        let hooks = StubHooks::new();
        let ws = transport(&hooks);

        ws.close().await;
        ws.close().await;
        assert_eq!(hooks.closes(), vec![Some(3)]);
    }

    #[tokio::test]
    async fn non_upgrade_request_is_rejected_and_recoverable() {
        let hooks = StubHooks::new();
        let ws = transport(&hooks);

        let request = Request::builder()
            .method("GET")
            .uri("/net.io/1/websocket/s")
            .body(Body::empty())
            .expect("request");
        let response = ws.serve(request).await;
        assert!(response.status().is_client_error());

        // The failed upgrade did not consume the transport's one slot.
        let request = Request::builder()
            .method("GET")
            .uri("/net.io/1/websocket/s")
            .body(Body::empty())
            .expect("request");
        let response = ws.serve(request).await;
        assert!(response.status().is_client_error());
        assert!(hooks.closes().is_empty());
    }
}
