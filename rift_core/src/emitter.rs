//! Event registration and dispatch.
//!
//! Handlers are registered through a typed API: a handler is any closure
//! whose first parameter is the namespace context, followed by up to four
//! deserializable arguments and an optional trailing [`Ack`]. Registration
//! wraps the closure in an adapter that captures its argument shape, so
//! dispatch is a direct call through a stored function value, and the
//! wire argument array is decoded against each handler's own declared types.
//!
//! Every invocation runs in its own task with a panic guard: a handler
//! fault is logged and never reaches its siblings or the connection.

use std::{
    collections::HashMap,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock,
    },
};

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::{error::AckError, namespace::Namespace, packet::Packet};

/// The first argument of every handler: the namespace the event arrived on.
pub type Context = Arc<Namespace>;

/// The erased shape every registered handler is adapted into.
#[doc(hidden)]
pub type DynHandler = dyn Fn(Context, &str, Ack) + Send + Sync;

/// Token returned by [`EventEmitter::on`], used to remove the registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// An acknowledgment sender bound to one incoming packet.
///
/// When the originating packet carried a correlation id, `send` delivers the
/// given results back as the ack's result array. When no acknowledgment was
/// requested, the sender is detached and `send` reports
/// [`AckError::NotRequested`].
#[derive(Clone)]
pub struct Ack {
    target: Option<(Arc<Namespace>, u64)>,
}

impl Ack {
    pub(crate) fn new(ns: Arc<Namespace>, id: u64) -> Self {
        Self {
            target: (id != 0).then_some((ns, id)),
        }
    }

    pub(crate) fn detached() -> Self {
        Self { target: None }
    }

    /// Whether the peer asked for an acknowledgment.
    #[must_use]
    pub fn requested(&self) -> bool {
        self.target.is_some()
    }

    /// Send the acknowledgment. Tuples become the result array; a single
    /// value becomes a one-element array.
    pub fn send<T: Serialize>(&self, results: T) -> Result<(), AckError> {
        let value = serde_json::to_value(results).map_err(AckError::Encode)?;
        self.send_value(value)
    }

    fn send_value(&self, value: Value) -> Result<(), AckError> {
        let (ns, id) = self.target.as_ref().ok_or(AckError::NotRequested)?;
        let args = match value {
            Value::Null => String::from("[]"),
            Value::Array(_) => value.to_string(),
            other => Value::Array(vec![other]).to_string(),
        };
        ns.send_packet(&Packet::Ack { ack_id: *id, args })?;
        Ok(())
    }
}

impl std::fmt::Debug for Ack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ack")
            .field("requested", &self.requested())
            .finish()
    }
}

/// Serialize an argument value into the wire argument array.
///
/// Tuples map to the array positionally; any other value becomes a
/// one-element array; unit becomes an empty array.
pub(crate) fn encode_args<A: Serialize>(args: &A) -> Result<String, serde_json::Error> {
    let value = serde_json::to_value(args)?;
    Ok(match value {
        Value::Null => String::from("[]"),
        Value::Array(_) => value.to_string(),
        other => Value::Array(vec![other]).to_string(),
    })
}

/// A name-to-handler registry with typed registration and raw dispatch.
pub struct EventEmitter {
    handlers: RwLock<HashMap<String, Vec<(HandlerId, Arc<DynHandler>)>>>,
    next_id: AtomicU64,
}

impl EventEmitter {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a handler for `name`.
    ///
    /// The handler's first parameter is always the namespace context; wire
    /// arguments are decoded positionally against the remaining parameters.
    /// A trailing [`Ack`] parameter receives the synthesized ack sender;
    /// without one, a non-unit return value is marshaled as the ack reply
    /// whenever the incoming packet requested acknowledgment.
    pub fn on<M, H: IntoHandler<M>>(&self, name: &str, handler: H) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .expect("handler registry poisoned")
            .entry(name.to_string())
            .or_default()
            .push((id, handler.into_handler()));
        id
    }

    /// Remove one registration by its token.
    pub fn remove_listener(&self, name: &str, id: HandlerId) {
        let mut handlers = self.handlers.write().expect("handler registry poisoned");
        if let Some(list) = handlers.get_mut(name) {
            list.retain(|(hid, _)| *hid != id);
            if list.is_empty() {
                handlers.remove(name);
            }
        }
    }

    /// Remove every registration for `name`.
    pub fn remove_all_listeners(&self, name: &str) {
        self.handlers
            .write()
            .expect("handler registry poisoned")
            .remove(name);
    }

    fn fetch(&self, name: &str) -> Vec<Arc<DynHandler>> {
        self.handlers
            .read()
            .expect("handler registry poisoned")
            .get(name)
            .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default()
    }

    /// Dispatch a wire event: decode `args` against each handler and invoke
    /// every one in its own task.
    pub(crate) fn emit_raw(&self, ctx: Context, name: &str, args: &str, ack: Ack) {
        for handler in self.fetch(name) {
            let ctx = ctx.clone();
            let ack = ack.clone();
            let args = args.to_string();
            tokio::spawn(async move {
                guarded_call(&handler, ctx, &args, ack);
            });
        }
    }

    /// Dispatch a local lifecycle event (`connect`, `disconnect`, `close`).
    pub(crate) fn emit_local(&self, ctx: Context, name: &str) {
        self.emit_raw(ctx, name, "[]", Ack::detached());
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter").finish_non_exhaustive()
    }
}

fn guarded_call(handler: &Arc<DynHandler>, ctx: Context, args: &str, ack: Ack) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| handler(ctx, args, ack))) {
        let message = panic_message(payload.as_ref());
        let backtrace = std::backtrace::Backtrace::force_capture();
        tracing::error!(panic = %message, %backtrace, "event handler panicked");
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("non-string panic payload")
    }
}

/// Marshal a handler's return value into an automatic ack reply.
///
/// A unit (null) return sends nothing; tuples become the result array; any
/// other value becomes a one-element array.
fn auto_ack<R: Serialize>(ack: &Ack, ret: R) {
    if !ack.requested() {
        return;
    }
    let value = match serde_json::to_value(ret) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, "failed to encode handler return for ack");
            return;
        }
    };
    if value.is_null() {
        return;
    }
    if let Err(e) = ack.send_value(value) {
        tracing::debug!(error = %e, "failed to send auto-ack");
    }
}

/// Decode a single declared argument, retrying against the whole JSON value
/// when positional decoding fails. Some clients send the bare array where a
/// single wrapped argument is expected.
fn decode_one<A: DeserializeOwned>(raw: &str) -> Result<A, serde_json::Error> {
    match serde_json::from_str::<(A,)>(raw) {
        Ok((a,)) => Ok(a),
        Err(positional) => serde_json::from_str::<A>(raw).map_err(|_| positional),
    }
}

/// Marker for handlers without a trailing [`Ack`] parameter.
pub struct ByValue;

/// Marker for handlers that declare a trailing [`Ack`] parameter.
pub struct WithAck;

/// Conversion from a typed closure into a stored dispatch adapter.
///
/// Implemented for closures `Fn(Context, A1, …, An)` and
/// `Fn(Context, A1, …, An, Ack)` with up to four deserializable arguments.
pub trait IntoHandler<Marker>: Send + Sync + 'static {
    #[doc(hidden)]
    fn into_handler(self) -> Arc<DynHandler>;
}

impl<F, R> IntoHandler<(ByValue,)> for F
where
    F: Fn(Context) -> R + Send + Sync + 'static,
    R: Serialize + 'static,
{
    fn into_handler(self) -> Arc<DynHandler> {
        Arc::new(move |ctx: Context, _args: &str, ack: Ack| {
            auto_ack(&ack, self(ctx));
        })
    }
}

impl<F, R, A1> IntoHandler<(ByValue, A1)> for F
where
    F: Fn(Context, A1) -> R + Send + Sync + 'static,
    R: Serialize + 'static,
    A1: DeserializeOwned + 'static,
{
    fn into_handler(self) -> Arc<DynHandler> {
        Arc::new(move |ctx: Context, args: &str, ack: Ack| match decode_one::<A1>(args) {
            Ok(a1) => auto_ack(&ack, self(ctx, a1)),
            Err(e) => {
                tracing::debug!(error = %e, "dropping event with undecodable arguments");
            }
        })
    }
}

impl<F, R> IntoHandler<(WithAck,)> for F
where
    F: Fn(Context, Ack) -> R + Send + Sync + 'static,
    R: 'static,
{
    fn into_handler(self) -> Arc<DynHandler> {
        Arc::new(move |ctx: Context, _args: &str, ack: Ack| {
            self(ctx, ack);
        })
    }
}

impl<F, R, A1> IntoHandler<(WithAck, A1)> for F
where
    F: Fn(Context, A1, Ack) -> R + Send + Sync + 'static,
    R: 'static,
    A1: DeserializeOwned + 'static,
{
    fn into_handler(self) -> Arc<DynHandler> {
        Arc::new(move |ctx: Context, args: &str, ack: Ack| match decode_one::<A1>(args) {
            Ok(a1) => {
                self(ctx, a1, ack);
            }
            Err(e) => {
                tracing::debug!(error = %e, "dropping event with undecodable arguments");
            }
        })
    }
}

macro_rules! impl_plain_handler {
    ($($arg:ident),+) => {
        impl<F, R, $($arg),+> IntoHandler<(ByValue, $($arg),+)> for F
        where
            F: Fn(Context, $($arg),+) -> R + Send + Sync + 'static,
            R: Serialize + 'static,
            $($arg: DeserializeOwned + 'static,)+
        {
            fn into_handler(self) -> Arc<DynHandler> {
                Arc::new(move |ctx: Context, args: &str, ack: Ack| {
                    match serde_json::from_str::<($($arg,)+)>(args) {
                        #[allow(non_snake_case)]
                        Ok(($($arg,)+)) => auto_ack(&ack, self(ctx, $($arg),+)),
                        Err(e) => {
                            tracing::debug!(error = %e, "dropping event with undecodable arguments");
                        }
                    }
                })
            }
        }
    };
}

macro_rules! impl_ack_handler {
    ($($arg:ident),+) => {
        impl<F, R, $($arg),+> IntoHandler<(WithAck, $($arg),+)> for F
        where
            F: Fn(Context, $($arg,)+ Ack) -> R + Send + Sync + 'static,
            R: 'static,
            $($arg: DeserializeOwned + 'static,)+
        {
            fn into_handler(self) -> Arc<DynHandler> {
                Arc::new(move |ctx: Context, args: &str, ack: Ack| {
                    match serde_json::from_str::<($($arg,)+)>(args) {
                        #[allow(non_snake_case)]
                        Ok(($($arg,)+)) => {
                            self(ctx, $($arg,)+ ack);
                        }
                        Err(e) => {
                            tracing::debug!(error = %e, "dropping event with undecodable arguments");
                        }
                    }
                })
            }
        }
    };
}

impl_plain_handler!(A1, A2);
impl_plain_handler!(A1, A2, A3);
impl_plain_handler!(A1, A2, A3, A4);
impl_ack_handler!(A1, A2);
impl_ack_handler!(A1, A2, A3);
impl_ack_handler!(A1, A2, A3, A4);
