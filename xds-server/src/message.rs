//! Crate-owned delta xDS message types.
//!
//! These types are codegen-agnostic and serve as the interface between
//! the xDS server logic and the codec layer. The codec converts these
//! to/from the wire format (e.g., prost/envoy-types or google-protobuf).

use bytes::Bytes;

/// An incremental discovery request received from a client.
#[derive(Debug, Clone, Default)]
pub struct DeltaDiscoveryRequest {
    /// The node making the request. Only required on the first request of a stream.
    pub node: Option<Node>,
    /// Type URL of the resources being requested.
    pub type_url: String,
    /// Resource names to add to the subscription.
    pub resource_names_subscribe: Vec<String>,
    /// Resource names to remove from the subscription.
    pub resource_names_unsubscribe: Vec<String>,
    /// The nonce of the response being acknowledged, or empty for a
    /// spontaneous request.
    pub response_nonce: String,
    /// Error details if this is a NACK (negative acknowledgment).
    pub error_detail: Option<ErrorDetail>,
}

/// An incremental discovery response sent to a client.
#[derive(Debug, Clone, Default)]
pub struct DeltaDiscoveryResponse {
    /// Version of the global configuration the response was computed from.
    pub system_version_info: String,
    /// Type URL of the resources.
    pub type_url: String,
    /// Nonce for this response, to be echoed back in the next request.
    pub nonce: String,
    /// Added or updated resources.
    pub resources: Vec<Resource>,
    /// Names of resources the client should drop.
    pub removed_resources: Vec<String>,
    /// Identifier of the control plane instance that sent the response.
    pub control_plane: Option<String>,
}

impl DeltaDiscoveryResponse {
    /// Total size in bytes of the serialized resource payloads.
    pub fn payload_size(&self) -> usize {
        self.resources.iter().map(|r| r.resource.value.len()).sum()
    }
}

/// A named resource carried in a [`DeltaDiscoveryResponse`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    /// The resource name.
    pub name: String,
    /// Version of this individual resource. May be empty.
    pub version: String,
    /// The serialized resource.
    pub resource: ResourceAny,
}

impl Resource {
    /// Create a resource without a per-resource version.
    pub fn new(name: impl Into<String>, resource: ResourceAny) -> Self {
        Self {
            name: name.into(),
            version: String::new(),
            resource,
        }
    }

    /// Set the per-resource version.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }
}

/// A resource wrapped as google.protobuf.Any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceAny {
    /// Type URL of the resource.
    pub type_url: String,
    /// Serialized resource bytes.
    pub value: Bytes,
}

impl ResourceAny {
    /// Wrap serialized bytes with their type URL.
    pub fn new(type_url: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            type_url: type_url.into(),
            value: value.into(),
        }
    }
}

/// Node identification sent by the client.
#[derive(Debug, Clone, Default)]
pub struct Node {
    /// An opaque node identifier.
    pub id: Option<String>,
    /// The cluster the node belongs to.
    pub cluster: Option<String>,
    /// Locality specifying where the node is running.
    pub locality: Option<Locality>,
    /// Free-form string identifying the client type (e.g., "envoy", "grpc").
    pub user_agent_name: String,
    /// Version of the client.
    pub user_agent_version: String,
}

impl Node {
    /// Create a new Node with the required user agent fields.
    ///
    /// Other fields (id, cluster, locality) can be set using builder methods.
    pub fn new(user_agent_name: impl Into<String>, user_agent_version: impl Into<String>) -> Self {
        Self {
            id: None,
            cluster: None,
            locality: None,
            user_agent_name: user_agent_name.into(),
            user_agent_version: user_agent_version.into(),
        }
    }

    /// Set the node ID.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the cluster.
    pub fn with_cluster(mut self, cluster: impl Into<String>) -> Self {
        self.cluster = Some(cluster.into());
        self
    }

    /// Set the locality.
    pub fn with_locality(mut self, locality: Locality) -> Self {
        self.locality = Some(locality);
        self
    }

    /// Returns the node id if it is present and non-empty.
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref().filter(|id| !id.is_empty())
    }
}

/// Locality information identifying where a node is running.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Locality {
    /// Region the node is in.
    pub region: String,
    /// Zone within the region.
    pub zone: String,
    /// Sub-zone within the zone.
    pub sub_zone: String,
}

/// Error details carried by a NACK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorDetail {
    /// gRPC status code.
    pub code: i32,
    /// Error message.
    pub message: String,
}
