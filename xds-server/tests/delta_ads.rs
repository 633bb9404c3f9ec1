//! End-to-end tests driving `DeltaAdsService` through a real tonic
//! server and the envoy-types ADS client.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use envoy_types::pb::envoy::config::cluster::v3::Cluster;
use envoy_types::pb::envoy::config::core::v3::Node as ProtoNode;
use envoy_types::pb::envoy::service::discovery::v3::aggregated_discovery_service_client::AggregatedDiscoveryServiceClient;
use envoy_types::pb::envoy::service::discovery::v3::{
    DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest,
};
use prost::Message;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tonic::transport::Channel;
use xds_server::{
    DeltaAdsService, DiscoveryServer, Generation, Generator, ProstCodec, Proxy, PushContext,
    PushRequest, Resource, ResourceAny, ServerConfig, TokioRuntime, TriggerReason,
    WatchedResource, type_url,
};

/// Serves a `Cluster` named after every subscribed name, or `c1` and `c2`
/// for a wildcard subscription.
struct ClusterGenerator;

impl Generator for ClusterGenerator {
    fn generate(
        &self,
        _proxy: &Proxy,
        push: &PushContext,
        watched: &WatchedResource,
        _request: &PushRequest,
    ) -> xds_server::Result<Generation> {
        let names: Vec<String> = if watched.resource_names.is_empty() {
            vec!["c1".to_string(), "c2".to_string()]
        } else {
            watched.resource_names.iter().cloned().collect()
        };
        let resources = names
            .into_iter()
            .map(|name| {
                let cluster = Cluster {
                    name: name.clone(),
                    ..Default::default()
                };
                Resource::new(
                    name,
                    ResourceAny::new(type_url::CLUSTER, cluster.encode_to_vec()),
                )
                .with_version(push.version())
            })
            .collect();
        Ok(Generation::resources(resources))
    }
}

type TestServer = DiscoveryServer<ProstCodec, TokioRuntime>;

fn discovery_server() -> TestServer {
    let server = DiscoveryServer::builder(ServerConfig::default(), ProstCodec, TokioRuntime)
        .with_generator(type_url::CLUSTER, ClusterGenerator)
        .with_push_context(Arc::new(PushContext::new("v1")))
        .build();
    server.set_ready(true);
    server
}

async fn start_server(server: TestServer) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(DeltaAdsService::new(server))
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
            .unwrap();
    });

    addr
}

async fn connect(addr: SocketAddr) -> AggregatedDiscoveryServiceClient<Channel> {
    AggregatedDiscoveryServiceClient::connect(format!("http://{addr}"))
        .await
        .unwrap()
}

fn cluster_request(node_id: Option<&str>) -> DeltaDiscoveryRequest {
    DeltaDiscoveryRequest {
        node: node_id.map(|id| ProtoNode {
            id: id.to_string(),
            ..Default::default()
        }),
        type_url: type_url::CLUSTER.to_string(),
        ..Default::default()
    }
}

async fn next(responses: &mut tonic::Streaming<DeltaDiscoveryResponse>) -> DeltaDiscoveryResponse {
    tokio::time::timeout(Duration::from_secs(5), responses.message())
        .await
        .expect("timed out waiting for a response")
        .expect("stream failed")
        .expect("stream ended")
}

#[tokio::test]
async fn test_delta_ads_subscribe_ack_and_push() {
    let server = discovery_server();
    let addr = start_server(server.clone()).await;
    let mut client = connect(addr).await;

    let (tx, rx) = mpsc::channel(16);
    tx.send(cluster_request(Some("sidecar~10.0.0.1~app.default"))).await.unwrap();
    let mut responses = client
        .delta_aggregated_resources(ReceiverStream::new(rx))
        .await
        .unwrap()
        .into_inner();

    let first = next(&mut responses).await;
    assert_eq!(first.type_url, type_url::CLUSTER);
    assert_eq!(first.system_version_info, "v1");
    let names: Vec<&str> = first.resources.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, ["c1", "c2"]);
    let cluster = Cluster::decode(first.resources[0].resource.as_ref().unwrap().value.as_slice()).unwrap();
    assert_eq!(cluster.name, "c1");

    tx.send(DeltaDiscoveryRequest {
        response_nonce: first.nonce.clone(),
        ..cluster_request(None)
    })
    .await
    .unwrap();

    assert_eq!(server.connection_ids(), ["sidecar~10.0.0.1~app.default-1"]);

    let push = Arc::new(PushContext::new("v2"));
    server.update_push_context(Arc::clone(&push));
    server
        .push(PushRequest::full(push, TriggerReason::ConfigUpdate))
        .wait()
        .await;

    let second = next(&mut responses).await;
    assert_eq!(second.system_version_info, "v2");
    assert_ne!(second.nonce, first.nonce);

    drop(tx);
    let end = tokio::time::timeout(Duration::from_secs(5), responses.message())
        .await
        .unwrap();
    assert!(matches!(end, Ok(None)));

    for _ in 0..50 {
        if server.connection_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(server.connection_count(), 0);
}

#[tokio::test]
async fn test_delta_ads_missing_node() {
    let addr = start_server(discovery_server()).await;
    let mut client = connect(addr).await;

    let (tx, rx) = mpsc::channel(16);
    tx.send(cluster_request(None)).await.unwrap();
    let status = match client.delta_aggregated_resources(ReceiverStream::new(rx)).await {
        Ok(response) => response.into_inner().message().await.unwrap_err(),
        Err(status) => status,
    };
    assert_eq!(status.code(), tonic::Code::InvalidArgument);
    assert_eq!(status.message(), "missing node information");
}

#[tokio::test]
async fn test_delta_ads_not_ready() {
    let server = discovery_server();
    server.set_ready(false);
    let addr = start_server(server).await;
    let mut client = connect(addr).await;

    let (tx, rx) = mpsc::channel(16);
    tx.send(cluster_request(Some("node-a"))).await.unwrap();
    let status = match client.delta_aggregated_resources(ReceiverStream::new(rx)).await {
        Ok(response) => response.into_inner().message().await.unwrap_err(),
        Err(status) => status,
    };
    assert_eq!(status.code(), tonic::Code::Unavailable);
}

#[tokio::test]
async fn test_state_of_the_world_is_unimplemented() {
    let addr = start_server(discovery_server()).await;
    let mut client = connect(addr).await;

    let request = DiscoveryRequest {
        type_url: type_url::CLUSTER.to_string(),
        ..Default::default()
    };
    let status = client
        .stream_aggregated_resources(tokio_stream::iter(vec![request]))
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::Unimplemented);
}
