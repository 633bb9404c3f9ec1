//! Provides abstraction for resource generators.
//!
//! A generator turns a connection's subscription into concrete resources,
//! computed against a [`PushContext`]. Generators are registered per type URL
//! on the [`DiscoveryServerBuilder`](crate::DiscoveryServerBuilder).

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::message::Resource;
use crate::server::Proxy;
use crate::server::push::{PushContext, PushRequest};
use crate::server::watched::WatchedResource;

/// Extra information a generator reports for push logging.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogDetails {
    /// Whether only a subset of the resources was regenerated.
    pub incremental: bool,
    /// Free-form text appended to the push log line.
    pub additional_info: String,
}

/// Output of [`Generator::generate`].
#[derive(Debug, Clone, Default)]
pub struct Generation {
    /// Generated resources. `None` means there is nothing to send.
    pub resources: Option<Vec<Resource>>,
    /// Log metadata.
    pub log: LogDetails,
}

impl Generation {
    /// The complete current resource set.
    pub fn resources(resources: Vec<Resource>) -> Self {
        Self {
            resources: Some(resources),
            log: LogDetails::default(),
        }
    }

    /// Nothing to send.
    pub fn nothing() -> Self {
        Self::default()
    }
}

/// Output of [`Generator::generate_deltas`].
#[derive(Debug, Clone, Default)]
pub struct DeltaGeneration {
    /// Added or changed resources.
    pub resources: Option<Vec<Resource>>,
    /// Names of resources the client must remove.
    pub removed: Option<Vec<String>>,
    /// Log metadata.
    pub log: LogDetails,
    /// Whether `removed` is authoritative. When false the server infers
    /// removals from the subscription on full pushes.
    pub used_delta: bool,
}

impl DeltaGeneration {
    /// A delta with an explicit removal list.
    pub fn delta(resources: Vec<Resource>, removed: Vec<String>) -> Self {
        Self {
            resources: Some(resources),
            removed: Some(removed),
            log: LogDetails::default(),
            used_delta: true,
        }
    }

    /// Returns true if there is nothing to send.
    pub fn is_empty(&self) -> bool {
        self.resources.is_none() && self.removed.is_none()
    }
}

impl From<Generation> for DeltaGeneration {
    fn from(generation: Generation) -> Self {
        Self {
            resources: generation.resources,
            removed: None,
            log: generation.log,
            used_delta: false,
        }
    }
}

/// Trait for resource generators.
///
/// Implementations must not block for long: they run on the connection's
/// main task, outside the connection lock.
///
/// # Example
///
/// ```ignore
/// struct ClusterGenerator { store: Arc<ClusterStore> }
///
/// impl Generator for ClusterGenerator {
///     fn generate(&self, proxy: &Proxy, push: &PushContext,
///         watched: &WatchedResource, request: &PushRequest) -> Result<Generation> {
///         let clusters = self.store.clusters_for(proxy, push.version());
///         Ok(Generation::resources(clusters))
///     }
/// }
/// ```
pub trait Generator: Send + Sync + 'static {
    /// Generate the current resources for a subscription.
    fn generate(
        &self,
        proxy: &Proxy,
        push: &PushContext,
        watched: &WatchedResource,
        request: &PushRequest,
    ) -> Result<Generation>;

    /// Generate a delta for a subscription.
    ///
    /// Delta-capable generators override this and return
    /// [`DeltaGeneration::used_delta`] set. The default delegates to
    /// [`generate`](Generator::generate).
    fn generate_deltas(
        &self,
        proxy: &Proxy,
        push: &PushContext,
        request: &PushRequest,
        watched: &WatchedResource,
    ) -> Result<DeltaGeneration> {
        self.generate(proxy, push, watched, request).map(Into::into)
    }
}

/// Generators keyed by type URL.
#[derive(Clone, Default)]
pub struct GeneratorRegistry {
    by_type: HashMap<String, Arc<dyn Generator>>,
    fallback: Option<Arc<dyn Generator>>,
}

impl fmt::Debug for GeneratorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<&String> = self.by_type.keys().collect();
        types.sort();
        f.debug_struct("GeneratorRegistry")
            .field("types", &types)
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

impl GeneratorRegistry {
    /// Register a generator for a type URL, replacing any previous one.
    pub fn insert(&mut self, type_url: impl Into<String>, generator: Arc<dyn Generator>) {
        self.by_type.insert(type_url.into(), generator);
    }

    /// Set the generator used for types without a dedicated one.
    pub fn set_fallback(&mut self, generator: Arc<dyn Generator>) {
        self.fallback = Some(generator);
    }

    /// Find the generator for a type URL.
    pub fn find(&self, type_url: &str) -> Option<&Arc<dyn Generator>> {
        self.by_type.get(type_url).or(self.fallback.as_ref())
    }
}
