//! Push requests and the events that carry them to connections.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::oneshot;
use tokio::time::Instant;

/// Global counter ordering push contexts by creation.
static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// An immutable snapshot of the global configuration.
///
/// Generators compute resources against a push context. The server holds
/// the current one and swaps it atomically when configuration changes.
#[derive(Debug, PartialEq, Eq)]
pub struct PushContext {
    version: String,
    generation: u64,
}

impl PushContext {
    /// Create a new push context for the given configuration version.
    ///
    /// Contexts created later always order after earlier ones.
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            generation: NEXT_GENERATION.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// The configuration version, sent as `system_version_info`.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Process-wide creation order of this context.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Why a push was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TriggerReason {
    /// Endpoints of a service changed.
    EndpointUpdate,
    /// A configuration object changed.
    ConfigUpdate,
    /// A service changed.
    ServiceUpdate,
    /// The proxy itself changed (labels, metadata).
    ProxyUpdate,
    /// Everything must be recomputed.
    GlobalUpdate,
    /// The proxy asked for resources.
    ProxyRequest,
    /// A secret changed.
    SecretTrigger,
    /// Mesh network topology changed.
    NetworksTrigger,
    /// Triggered for debugging.
    DebugTrigger,
    /// Unknown cause.
    UnknownTrigger,
}

impl TriggerReason {
    /// Stable label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerReason::EndpointUpdate => "endpoint",
            TriggerReason::ConfigUpdate => "config",
            TriggerReason::ServiceUpdate => "service",
            TriggerReason::ProxyUpdate => "proxy",
            TriggerReason::GlobalUpdate => "global",
            TriggerReason::ProxyRequest => "proxyrequest",
            TriggerReason::SecretTrigger => "secret",
            TriggerReason::NetworksTrigger => "networks",
            TriggerReason::DebugTrigger => "debug",
            TriggerReason::UnknownTrigger => "unknown",
        }
    }
}

impl fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies a configuration object whose change triggered a push.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConfigKey {
    /// Kind of the object, e.g. `ServiceEntry`.
    pub kind: String,
    /// Object name.
    pub name: String,
    /// Object namespace.
    pub namespace: String,
}

impl ConfigKey {
    /// Create a config key.
    pub fn new(
        kind: impl Into<String>,
        name: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            namespace: namespace.into(),
        }
    }
}

/// Describes a pending configuration change for a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushRequest {
    /// Whether every watched resource must be recomputed.
    pub full: bool,
    /// The push context to compute resources against.
    pub push: Arc<PushContext>,
    /// Why this push was triggered.
    pub reasons: BTreeSet<TriggerReason>,
    /// Configuration objects that changed. Empty when unknown.
    pub configs_updated: BTreeSet<ConfigKey>,
    /// When the change was first observed.
    pub start: Instant,
}

impl PushRequest {
    /// A full push for the given context.
    pub fn full(push: Arc<PushContext>, reason: TriggerReason) -> Self {
        Self {
            full: true,
            push,
            reasons: BTreeSet::from([reason]),
            configs_updated: BTreeSet::new(),
            start: Instant::now(),
        }
    }

    /// An incremental push for the given context.
    pub fn incremental(push: Arc<PushContext>, reason: TriggerReason) -> Self {
        Self {
            full: false,
            ..Self::full(push, reason)
        }
    }

    /// Record a changed configuration object.
    pub fn with_config_updated(mut self, key: ConfigKey) -> Self {
        self.configs_updated.insert(key);
        self
    }

    /// Merge two push requests into one that covers both.
    ///
    /// The result is full if either side is, uses the newer push context,
    /// carries the union of reasons and updated configs and keeps the
    /// earliest start time. Merging is idempotent and commutative, so a
    /// request can be folded into a blocked push any number of times.
    pub fn merge(self, other: PushRequest) -> PushRequest {
        let push = if other.push.generation() > self.push.generation() {
            other.push
        } else {
            self.push
        };
        let mut reasons = self.reasons;
        reasons.extend(other.reasons);
        let mut configs_updated = self.configs_updated;
        configs_updated.extend(other.configs_updated);
        PushRequest {
            full: self.full || other.full,
            push,
            reasons,
            configs_updated,
            start: self.start.min(other.start),
        }
    }

    /// Reasons joined for logging, e.g. ` (config,proxyrequest)`.
    pub fn push_reason(&self) -> String {
        if self.reasons.is_empty() {
            return String::new();
        }
        let reasons: Vec<&str> = self.reasons.iter().map(TriggerReason::as_str).collect();
        format!(" ({})", reasons.join(","))
    }
}

/// Signals that a push event has been fully handled by a connection.
///
/// The signal fires when this value is dropped, so it is delivered even if
/// the connection closes before processing the event.
#[derive(Debug)]
pub(crate) struct PushDone(Option<oneshot::Sender<()>>);

impl PushDone {
    pub(crate) fn channel() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self(Some(tx)), rx)
    }
}

impl Drop for PushDone {
    fn drop(&mut self) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(());
        }
    }
}

/// A push request queued on one connection.
#[derive(Debug)]
pub(crate) struct PushEvent {
    pub(crate) request: PushRequest,
    pub(crate) done: PushDone,
}

/// Push events folded into one while a connection's queue was full.
#[derive(Debug)]
pub(crate) struct Overflow {
    pub(crate) request: PushRequest,
    pub(crate) done: Vec<PushDone>,
}

impl Overflow {
    pub(crate) fn new(event: PushEvent) -> Self {
        Self {
            request: event.request,
            done: vec![event.done],
        }
    }

    pub(crate) fn absorb(self, event: PushEvent) -> Self {
        let Self { request, mut done } = self;
        done.push(event.done);
        Self {
            request: request.merge(event.request),
            done,
        }
    }
}

/// Completion handle for a fan-out started by
/// [`DiscoveryServer::push`](crate::DiscoveryServer::push).
#[derive(Debug, Default)]
pub struct PushCompletion {
    pending: Vec<oneshot::Receiver<()>>,
}

impl PushCompletion {
    pub(crate) fn new(pending: Vec<oneshot::Receiver<()>>) -> Self {
        Self { pending }
    }

    /// Number of connections the push was queued on.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Returns true if no connection received the push.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Wait until every connection has handled (sent or deferred) the push.
    pub async fn wait(self) {
        for rx in self.pending {
            let _ = rx.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn request(push: &Arc<PushContext>, full: bool, reason: TriggerReason) -> PushRequest {
        if full {
            PushRequest::full(Arc::clone(push), reason)
        } else {
            PushRequest::incremental(Arc::clone(push), reason)
        }
    }

    #[test]
    fn test_push_context_generation_is_monotonic() {
        let a = PushContext::new("v1");
        let b = PushContext::new("v1");
        assert!(b.generation() > a.generation());
        assert_eq!(a.version(), "v1");
    }

    #[test]
    fn test_merge_is_idempotent() {
        let old = Arc::new(PushContext::new("v1"));
        let new = Arc::new(PushContext::new("v2"));
        let blocked = request(&old, false, TriggerReason::EndpointUpdate);
        let incoming = request(&new, false, TriggerReason::ConfigUpdate)
            .with_config_updated(ConfigKey::new("ServiceEntry", "a", "ns"));

        let once = blocked.clone().merge(incoming.clone());
        let twice = once.clone().merge(incoming);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_merge_is_commutative() {
        let old = Arc::new(PushContext::new("v1"));
        let new = Arc::new(PushContext::new("v2"));
        let a = request(&old, true, TriggerReason::ServiceUpdate);
        let b = request(&new, false, TriggerReason::EndpointUpdate);

        assert_eq!(a.clone().merge(b.clone()), b.merge(a));
    }

    #[test]
    fn test_merge_combines_fields() {
        let old = Arc::new(PushContext::new("v1"));
        let new = Arc::new(PushContext::new("v2"));
        let first = request(&old, true, TriggerReason::ServiceUpdate);
        let mut second = request(&new, false, TriggerReason::EndpointUpdate)
            .with_config_updated(ConfigKey::new("Service", "b", "ns"));
        second.start = first.start + Duration::from_secs(1);

        let merged = second.merge(first.clone());
        assert!(merged.full);
        assert_eq!(merged.push.version(), "v2");
        assert_eq!(merged.start, first.start);
        assert_eq!(
            merged.reasons,
            BTreeSet::from([TriggerReason::ServiceUpdate, TriggerReason::EndpointUpdate])
        );
        assert_eq!(merged.configs_updated.len(), 1);
        assert_eq!(merged.push_reason(), " (endpoint,service)");
    }

    #[tokio::test]
    async fn test_push_done_fires_on_drop() {
        let (done, rx) = PushDone::channel();
        let (done2, rx2) = PushDone::channel();
        let completion = PushCompletion::new(vec![rx, rx2]);
        assert_eq!(completion.len(), 2);
        drop(done);
        drop(done2);
        completion.wait().await;
    }
}
