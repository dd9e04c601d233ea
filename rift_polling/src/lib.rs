//! HTTP long-polling transport.
//!
//! One instance serves the whole life of a session: GETs block until an
//! outbound payload (or the idle timeout) and POSTs carry inbound payloads.
//! The same implementation backs both wire names: `xhr-polling` reads raw
//! request bodies, while `jsonp-polling` (detected from the request path)
//! wraps responses in a script callback and reads the `d` form field.
//!
//! Overlapping requests are first-come-first-served: a second concurrent
//! GET or POST on the same instance is rejected with HTTP 400 rather than
//! silently dropped. A graceful close lets one pending GET (or an in-flight
//! POST) finish before the close notification fires.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    extract::{FromRequest, Query, Request},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    Form,
};
use bytes::Bytes;
use rift_transport::{Creater, Hooks, Transport, TransportOptions};
use tokio_util::sync::CancellationToken;

/// The keep-alive frame returned when a GET idles out.
const KEEPALIVE_FRAME: &[u8] = b"8::";

/// Upper bound on POST bodies.
const MAX_BODY_SIZE: usize = 1 << 20;

/// XHR long-polling.
pub const XHR_CREATER: Creater = Creater {
    name: "xhr-polling",
    upgrading: false,
    server: new_server,
};

/// JSONP long-polling for script-tag clients.
pub const JSONP_CREATER: Creater = Creater {
    name: "jsonp-polling",
    upgrading: false,
    server: new_server,
};

fn new_server(id: u64, hooks: Arc<dyn Hooks>, options: TransportOptions) -> Arc<dyn Transport> {
    Arc::new(Polling::new(id, hooks, options.poll_timeout))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum State {
    Normal = 0,
    Closing = 1,
    Closed = 2,
}

fn state_from(raw: u8) -> State {
    match raw {
        0 => State::Normal,
        1 => State::Closing,
        _ => State::Closed,
    }
}

/// A long-polling transport instance.
pub struct Polling {
    id: u64,
    hooks: Arc<dyn Hooks>,
    poll_timeout: Duration,
    get_lock: tokio::sync::Mutex<()>,
    post_lock: tokio::sync::Mutex<()>,
    state: AtomicU8,
    close_signal: CancellationToken,
}

impl Polling {
    fn new(id: u64, hooks: Arc<dyn Hooks>, poll_timeout: Duration) -> Self {
        Self {
            id,
            hooks,
            poll_timeout,
            get_lock: tokio::sync::Mutex::new(()),
            post_lock: tokio::sync::Mutex::new(()),
            state: AtomicU8::new(State::Normal as u8),
            close_signal: CancellationToken::new(),
        }
    }

    fn state(&self) -> State {
        state_from(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    async fn get(&self, req: Request) -> Response {
        let Ok(_get_guard) = self.get_lock.try_lock() else {
            return (StatusCode::BAD_REQUEST, "overlay get").into_response();
        };
        if self.state() != State::Normal {
            return (StatusCode::BAD_REQUEST, "closed").into_response();
        }

        let sender = self.hooks.sender_chan();
        let data: Option<Bytes> = tokio::select! {
            payload = sender.recv() => payload.ok(),
            () = tokio::time::sleep(self.poll_timeout) => {
                tracing::debug!(transport = self.id, "polling idle timeout");
                Some(Bytes::from_static(KEEPALIVE_FRAME))
            }
            () = self.close_signal.cancelled() => None,
        };

        let response = match data {
            Some(data) => {
                self.hooks.on_raw_dispatch(&data);
                if is_jsonp(&req) {
                    jsonp_response(&req, &data)
                } else {
                    (
                        [(
                            header::CONTENT_TYPE,
                            HeaderValue::from_static("text/plain; charset=UTF-8"),
                        )],
                        data,
                    )
                        .into_response()
                }
            }
            // Closing, or the queue went away: drain with an empty response.
            None => StatusCode::OK.into_response(),
        };

        self.finalize_after_get();
        response
    }

    async fn post(&self, req: Request) -> Response {
        let Ok(_post_guard) = self.post_lock.try_lock() else {
            return (StatusCode::BAD_REQUEST, "overlay post").into_response();
        };
        if self.state() != State::Normal {
            return (StatusCode::BAD_REQUEST, "closed").into_response();
        }

        let data: Option<Bytes> = if is_jsonp(&req) {
            match Form::<HashMap<String, String>>::from_request(req, &()).await {
                Ok(Form(mut fields)) => {
                    let field = fields.remove("d").unwrap_or_default();
                    if field.starts_with('"') {
                        match serde_json::from_str::<String>(&field) {
                            Ok(unquoted) => Some(Bytes::from(unquoted)),
                            Err(e) => {
                                tracing::warn!(error = %e, "bad jsonp post payload");
                                None
                            }
                        }
                    } else {
                        Some(Bytes::from(field))
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "bad jsonp form body");
                    None
                }
            }
        } else {
            match to_bytes(req.into_body(), MAX_BODY_SIZE).await {
                Ok(body) => {
                    // IE XDomainRequest prefixes the body.
                    match body.strip_prefix(b"data=") {
                        Some(stripped) => Some(Bytes::copy_from_slice(stripped)),
                        None => Some(body),
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to read post body");
                    None
                }
            }
        };

        let response = match data {
            Some(data) => {
                self.hooks.on_raw_message(&data);
                (
                    [(
                        header::CONTENT_TYPE,
                        HeaderValue::from_static("text/html; charset=UTF-8"),
                    )],
                    Body::empty(),
                )
                    .into_response()
            }
            None => (StatusCode::BAD_REQUEST, "bad request body").into_response(),
        };

        self.finalize_after_post();
        response
    }

    /// A GET finished while a close was pending: if no POST is in flight,
    /// this request was the drain and the close completes now.
    fn finalize_after_get(&self) {
        if self.state() != State::Closing {
            return;
        }
        if let Ok(_post_guard) = self.post_lock.try_lock() {
            self.set_state(State::Closed);
            self.hooks.on_transport_close(Some(self.id));
        }
    }

    fn finalize_after_post(&self) {
        if self.state() != State::Closing {
            return;
        }
        if let Ok(_get_guard) = self.get_lock.try_lock() {
            self.set_state(State::Closed);
            self.hooks.on_transport_close(Some(self.id));
        }
    }
}

#[async_trait]
impl Transport for Polling {
    fn id(&self) -> u64 {
        self.id
    }

    async fn serve(&self, req: Request) -> Response {
        let cors = cors_headers(req.headers());
        let response = if req.method() == Method::GET {
            self.get(req).await
        } else if req.method() == Method::POST {
            self.post(req).await
        } else {
            // Anything else (OPTIONS preflight included) gets an empty OK
            // with the CORS headers attached.
            StatusCode::OK.into_response()
        };
        with_headers(response, cors)
    }

    async fn close(&self) {
        let transitioned = self
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |raw| {
                match state_from(raw) {
                    State::Normal => Some(State::Closing as u8),
                    State::Closing | State::Closed => None,
                }
            });
        if transitioned.is_err() {
            return;
        }

        self.close_signal.cancel();

        // If neither verb is in flight the close completes immediately;
        // otherwise the active request finalizes it on the way out.
        if let Ok(_get_guard) = self.get_lock.try_lock() {
            if let Ok(_post_guard) = self.post_lock.try_lock() {
                self.set_state(State::Closed);
                self.hooks.on_transport_close(Some(self.id));
            }
        }
    }
}

impl std::fmt::Debug for Polling {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Polling")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn is_jsonp(req: &Request) -> bool {
    req.uri().path().contains("/jsonp-polling/")
}

fn jsonp_response(req: &Request, data: &[u8]) -> Response {
    let index = Query::<HashMap<String, String>>::try_from_uri(req.uri())
        .map(|Query(q)| q.get("i").cloned().unwrap_or_default())
        .unwrap_or_default();

    let quoted = match serde_json::to_string(&String::from_utf8_lossy(data)) {
        Ok(quoted) => quoted,
        Err(e) => {
            tracing::error!(error = %e, "failed to quote jsonp payload");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    (
        [
            (
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/javascript; charset=UTF-8"),
            ),
            (
                header::X_XSS_PROTECTION,
                HeaderValue::from_static("0"),
            ),
        ],
        format!("io.j[{index}]({quoted})"),
    )
        .into_response()
}

fn cors_headers(headers: &HeaderMap) -> Vec<(header::HeaderName, HeaderValue)> {
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

fn with_headers(mut response: Response, headers: Vec<(header::HeaderName, HeaderValue)>) -> Response {
    for (name, value) in headers {
        response.headers_mut().insert(name, value);
    }
    response
}
