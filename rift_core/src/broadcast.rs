//! Fan-out over the same namespace of many sessions.

use std::sync::Arc;

use serde::Serialize;

use crate::{emitter, namespace::Namespace};

/// A snapshot of one namespace path across every live session.
///
/// Obtained from [`Server::in_namespace`](crate::server::Server::in_namespace);
/// sends are best-effort; namespaces that are not connected are skipped.
#[derive(Debug)]
pub struct Broadcaster {
    namespaces: Vec<Arc<Namespace>>,
}

impl Broadcaster {
    pub(crate) fn new(namespaces: Vec<Arc<Namespace>>) -> Self {
        Self { namespaces }
    }

    /// Drop one namespace from the set, typically the event's originator.
    #[must_use]
    pub fn except(mut self, ns: &Arc<Namespace>) -> Self {
        self.namespaces.retain(|other| !Arc::ptr_eq(other, ns));
        self
    }

    /// How many namespaces the fan-out currently covers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.namespaces.len()
    }

    /// Whether the fan-out covers no namespaces.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.namespaces.is_empty()
    }

    /// Emit the event to every namespace in the set. Arguments are
    /// serialized once.
    pub fn broadcast<A: Serialize>(&self, name: &str, args: A) {
        let Ok(args) = emitter::encode_args(&args) else {
            tracing::warn!(event = name, "failed to encode broadcast arguments");
            return;
        };
        for ns in &self.namespaces {
            if let Err(e) = ns.emit_json(name, &args) {
                tracing::debug!(
                    event = name,
                    endpoint = %ns.endpoint(),
                    error = %e,
                    "skipping namespace in broadcast"
                );
            }
        }
    }

    /// Send a plain message to every namespace in the set.
    pub fn send<T: Serialize>(&self, message: T) {
        for ns in &self.namespaces {
            if let Err(e) = ns.send(&message) {
                tracing::debug!(endpoint = %ns.endpoint(), error = %e, "skipping namespace in send");
            }
        }
    }
}
