//! Well-known xDS type URLs.

/// Listener (LDS).
pub const LISTENER: &str = "type.googleapis.com/envoy.config.listener.v3.Listener";
/// Cluster (CDS).
pub const CLUSTER: &str = "type.googleapis.com/envoy.config.cluster.v3.Cluster";
/// Route configuration (RDS).
pub const ROUTE: &str = "type.googleapis.com/envoy.config.route.v3.RouteConfiguration";
/// Cluster load assignment (EDS).
pub const ENDPOINT: &str = "type.googleapis.com/envoy.config.endpoint.v3.ClusterLoadAssignment";
/// Secret (SDS).
pub const SECRET: &str = "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.Secret";

/// Prefix of debug types. Requests for these are answered immediately and
/// never tracked.
pub const DEBUG_PREFIX: &str = "istio.io/debug";

/// Returns true for debug type URLs.
pub fn is_debug(type_url: &str) -> bool {
    type_url.starts_with(DEBUG_PREFIX)
}

/// Short, log friendly name for a type URL.
///
/// Well-known types map to their discovery service acronym; anything else
/// is reduced to the last path segment.
pub fn short_name(type_url: &str) -> &str {
    match type_url {
        LISTENER => "LDS",
        CLUSTER => "CDS",
        ROUTE => "RDS",
        ENDPOINT => "EDS",
        SECRET => "SDS",
        other => other.rsplit('/').next().unwrap_or(other),
    }
}
