//! A Rust implementation of an incremental [xDS](https://www.envoyproxy.io/docs/envoy/latest/api-docs/xds_protocol) server.
//!
//! This crate provides the server side of the delta xDS protocol. It handles:
//! - Per-connection request processing and ACK/NACK tracking
//! - Nonce-based detection of stale acknowledgements
//! - Subscription diffing and inferred removals
//! - Flow-controlled pushes with merging of deferred pushes
//!
//! It does NOT compute configuration. Resources come from [`Generator`]s
//! registered per type URL, computed against the current [`PushContext`].
//!
//! # Example
//!
//! ```ignore
//! use xds_server::{DiscoveryServer, ServerConfig, ProstCodec, TokioRuntime};
//! use xds_server::{DeltaAdsService, PushContext, PushRequest, TriggerReason};
//!
//! let server = DiscoveryServer::builder(ServerConfig::default(), ProstCodec, TokioRuntime)
//!     .with_generator(xds_server::type_url::CLUSTER, ClusterGenerator::new(store))
//!     .with_status_sink(xds_server::MetricsStatusSink)
//!     .build();
//! server.set_ready(true);
//!
//! tokio::spawn(
//!     tonic::transport::Server::builder()
//!         .add_service(DeltaAdsService::new(server.clone()))
//!         .serve(addr),
//! );
//!
//! // On every configuration change:
//! let push = Arc::new(PushContext::new("2024-06-01T00:00:00Z/42"));
//! server.update_push_context(Arc::clone(&push));
//! server.push(PushRequest::full(push, TriggerReason::ConfigUpdate)).wait().await;
//! ```
//!
//! # Feature Flags
//!
//! - `transport-tonic`: Enables the `tonic` transport ([`DeltaAdsService`]). This enables the `rt-tokio` feature. Enabled by default.
//! - `rt-tokio`: Enables the use of the `tokio` runtime. Enabled by default.
//! - `codegen-prost`: Enables the `prost`/`envoy-types` codec. Enabled by default.
//! - `metrics`: Enables [`MetricsStatusSink`], reporting through the `metrics` facade. Enabled by default.

pub mod auth;
pub mod codec;
pub mod error;
pub mod generator;
pub mod message;
pub mod runtime;
pub mod server;
pub mod status;
pub mod transport;
pub mod type_url;

#[cfg(all(test, feature = "codegen-prost"))]
pub(crate) mod testutil;

pub use auth::{Admission, AdmitAll, AllowAnonymous, Authenticator};
pub use codec::XdsCodec;
pub use error::{Error, Result};
pub use generator::{DeltaGeneration, Generation, Generator, GeneratorRegistry, LogDetails};
pub use message::{
    DeltaDiscoveryRequest, DeltaDiscoveryResponse, ErrorDetail, Locality, Node, Resource,
    ResourceAny,
};
pub use runtime::Runtime;
pub use server::config::ServerConfig;
pub use server::{
    ConfigKey, ConnectionSnapshot, ConnectionState, DiscoveryServer, DiscoveryServerBuilder,
    Proxy, PushCompletion, PushContext, PushRequest, TriggerReason, WatchedResource,
};
pub use status::{NoopStatusSink, StatusSink};
pub use transport::{IncomingStream, RequestStream, ResponseSink, StreamContext};

// Tokio runtime
#[cfg(feature = "rt-tokio")]
pub use runtime::tokio::TokioRuntime;

// Tonic transport
#[cfg(feature = "transport-tonic")]
pub use transport::tonic::DeltaAdsService;

// Prost codec
#[cfg(feature = "codegen-prost")]
pub use codec::prost::ProstCodec;

// Metrics facade
#[cfg(feature = "metrics")]
pub use status::MetricsStatusSink;
