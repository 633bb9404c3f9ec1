//! Prost-based codec using envoy-types.

use crate::codec::XdsCodec;
use crate::error::Result;
use crate::message::{DeltaDiscoveryRequest, DeltaDiscoveryResponse, ErrorDetail, Locality, Node};
use bytes::Bytes;
use envoy_types::pb::envoy::config::core::v3 as core;
use envoy_types::pb::envoy::service::discovery::v3 as discovery;
use prost::Message;

/// A codec that uses prost/envoy-types for serialization.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProstCodec;

impl XdsCodec for ProstCodec {
    fn decode_request(&self, bytes: Bytes) -> Result<DeltaDiscoveryRequest> {
        let proto_request = discovery::DeltaDiscoveryRequest::decode(bytes)?;

        Ok(DeltaDiscoveryRequest {
            node: proto_request.node.map(node_from_proto),
            type_url: proto_request.type_url,
            resource_names_subscribe: proto_request.resource_names_subscribe,
            resource_names_unsubscribe: proto_request.resource_names_unsubscribe,
            response_nonce: proto_request.response_nonce,
            error_detail: proto_request.error_detail.map(|status| ErrorDetail {
                code: status.code,
                message: status.message,
            }),
        })
    }

    fn encode_response(&self, response: &DeltaDiscoveryResponse) -> Result<Bytes> {
        use envoy_types::pb::google::protobuf::Any;

        let proto_response = discovery::DeltaDiscoveryResponse {
            system_version_info: response.system_version_info.clone(),
            type_url: response.type_url.clone(),
            nonce: response.nonce.clone(),
            resources: response
                .resources
                .iter()
                .map(|r| discovery::Resource {
                    name: r.name.clone(),
                    version: r.version.clone(),
                    resource: Some(Any {
                        type_url: r.resource.type_url.clone(),
                        value: r.resource.value.to_vec(),
                    }),
                    ..Default::default()
                })
                .collect(),
            removed_resources: response.removed_resources.clone(),
            control_plane: response
                .control_plane
                .as_ref()
                .map(|identifier| core::ControlPlane {
                    identifier: identifier.clone(),
                }),
            ..Default::default()
        };

        Ok(proto_response.encode_to_vec().into())
    }
}

fn node_from_proto(node: core::Node) -> Node {
    let user_agent_version = match node.user_agent_version_type {
        Some(core::node::UserAgentVersionType::UserAgentVersion(version)) => version,
        _ => String::new(),
    };
    Node {
        id: Some(node.id).filter(|id| !id.is_empty()),
        cluster: Some(node.cluster).filter(|cluster| !cluster.is_empty()),
        locality: node.locality.map(|l| Locality {
            region: l.region,
            zone: l.zone,
            sub_zone: l.sub_zone,
        }),
        user_agent_name: node.user_agent_name,
        user_agent_version,
    }
}
