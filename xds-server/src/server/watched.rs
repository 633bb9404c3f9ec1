//! Per-connection record of what each client subscribes to and what it was sent.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use tokio::time::Instant;

use crate::server::push::PushRequest;

/// The server's record of one connection's subscription to one resource type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchedResource {
    /// Type URL of the watched resources.
    pub type_url: String,
    /// Subscribed resource names. Empty for a wildcard subscription.
    pub resource_names: BTreeSet<String>,
    /// Nonce of the last response sent.
    pub nonce_sent: String,
    /// Nonce of the last response the client acknowledged.
    pub nonce_acked: String,
    /// Nonce of the last response the client rejected, empty when none.
    pub nonce_nacked: String,
    /// Push context version of the last response sent.
    pub version_sent: String,
    /// When the last response was sent.
    pub last_sent: Option<Instant>,
}

impl WatchedResource {
    /// Create a record for a type with the given subscription.
    pub fn new(type_url: impl Into<String>, resource_names: BTreeSet<String>) -> Self {
        Self {
            type_url: type_url.into(),
            resource_names,
            ..Default::default()
        }
    }

    /// The subscription that results from applying a request's subscribe
    /// and unsubscribe lists to the current one.
    ///
    /// Subscribing is a set union and unsubscribing a set difference, so
    /// repeating either is a no-op.
    pub fn subscription_after(&self, subscribe: &[String], unsubscribe: &[String]) -> BTreeSet<String> {
        apply_delta(&self.resource_names, subscribe, unsubscribe)
    }

    /// Whether the last response has been answered by the client.
    ///
    /// A rejected response counts as answered: the client will not send a
    /// matching ACK for it.
    pub fn is_synced(&self) -> bool {
        !self.nonce_nacked.is_empty() || self.nonce_acked == self.nonce_sent
    }

    /// Whether more than `timeout` elapsed since the last response was sent.
    pub fn is_timed_out(&self, now: Instant, timeout: Duration) -> bool {
        self.last_sent
            .is_none_or(|sent| now.saturating_duration_since(sent) > timeout)
    }

    pub(crate) fn record_sent(&mut self, nonce: &str, version: &str, at: Instant) {
        self.nonce_sent = nonce.to_string();
        self.version_sent = version.to_string();
        self.last_sent = Some(at);
    }
}

/// Applies subscribe/unsubscribe lists to a subscription.
pub(crate) fn apply_delta(
    existing: &BTreeSet<String>,
    subscribe: &[String],
    unsubscribe: &[String],
) -> BTreeSet<String> {
    let mut names = existing.clone();
    names.extend(subscribe.iter().cloned());
    for name in unsubscribe {
        names.remove(name);
    }
    names
}

/// Watched resources and deferred pushes of one connection.
///
/// Guarded by the connection lock; every method is a short map operation.
#[derive(Debug, Default)]
pub(crate) struct WatchTable {
    watched: HashMap<String, WatchedResource>,
    blocked: HashMap<String, PushRequest>,
}

impl WatchTable {
    pub(crate) fn get(&self, type_url: &str) -> Option<&WatchedResource> {
        self.watched.get(type_url)
    }

    pub(crate) fn get_mut(&mut self, type_url: &str) -> Option<&mut WatchedResource> {
        self.watched.get_mut(type_url)
    }

    pub(crate) fn insert(&mut self, watched: WatchedResource) {
        self.watched.insert(watched.type_url.clone(), watched);
    }

    /// Copies of all watched resources, ordered by type URL.
    pub(crate) fn watched(&self) -> Vec<WatchedResource> {
        let mut all: Vec<WatchedResource> = self.watched.values().cloned().collect();
        all.sort_by(|a, b| a.type_url.cmp(&b.type_url));
        all
    }

    /// Record a sent response, creating the entry if the type was pushed
    /// before it was requested.
    pub(crate) fn record_sent(&mut self, type_url: &str, nonce: &str, version: &str, at: Instant) {
        self.watched
            .entry(type_url.to_string())
            .or_insert_with(|| WatchedResource::new(type_url, BTreeSet::new()))
            .record_sent(nonce, version, at);
    }

    /// Replace the stored subscription of an existing entry.
    pub(crate) fn set_resource_names(&mut self, type_url: &str, names: BTreeSet<String>) {
        if let Some(watched) = self.watched.get_mut(type_url) {
            watched.resource_names = names;
        }
    }

    /// Defer a push for a type, merging with any push already deferred.
    pub(crate) fn block(&mut self, type_url: &str, request: PushRequest) {
        let merged = match self.blocked.remove(type_url) {
            Some(existing) => existing.merge(request),
            None => request,
        };
        self.blocked.insert(type_url.to_string(), merged);
    }

    /// Remove and return the deferred push for a type.
    pub(crate) fn take_blocked(&mut self, type_url: &str) -> Option<PushRequest> {
        self.blocked.remove(type_url)
    }

    pub(crate) fn blocked(&self) -> BTreeMap<String, PushRequest> {
        self.blocked
            .iter()
            .map(|(type_url, request)| (type_url.clone(), request.clone()))
            .collect()
    }
}
