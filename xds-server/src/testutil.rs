//! Test doubles: an in-memory stream pair, a client speaking envoy-types
//! messages over it, a map-backed generator and a recording status sink.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use envoy_types::pb::envoy::config::core::v3 as core;
use envoy_types::pb::envoy::service::discovery::v3 as discovery;
use envoy_types::pb::google::rpc::Status as RpcStatus;
use prost::Message;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::generator::{DeltaGeneration, Generation, Generator};
use crate::message::{Resource, ResourceAny};
use crate::server::Proxy;
use crate::server::push::{PushContext, PushRequest};
use crate::server::watched::WatchedResource;
use crate::status::StatusSink;
use crate::transport::{IncomingStream, RequestStream, ResponseSink, StreamContext};
use crate::type_url;

pub(crate) struct MockRequestStream {
    rx: mpsc::UnboundedReceiver<Result<Bytes>>,
}

impl RequestStream for MockRequestStream {
    async fn recv(&mut self) -> Result<Option<Bytes>> {
        self.rx.recv().await.transpose()
    }
}

pub(crate) struct MockResponseSink {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl ResponseSink for MockResponseSink {
    async fn send(&mut self, response: Bytes) -> Result<()> {
        self.tx.send(response).map_err(|_| Error::StreamClosed)
    }
}

/// A sink whose writes never complete.
pub(crate) struct StalledSink;

impl ResponseSink for StalledSink {
    async fn send(&mut self, _response: Bytes) -> Result<()> {
        std::future::pending().await
    }
}

/// The client end of an in-memory stream.
pub(crate) struct MockClient {
    requests: Option<mpsc::UnboundedSender<Result<Bytes>>>,
    responses: mpsc::UnboundedReceiver<Bytes>,
}

impl MockClient {
    pub(crate) fn send(&self, request: discovery::DeltaDiscoveryRequest) {
        if let Some(requests) = &self.requests {
            let _ = requests.send(Ok(request.encode_to_vec().into()));
        }
    }

    pub(crate) fn send_raw(&self, frame: Result<Bytes>) {
        if let Some(requests) = &self.requests {
            let _ = requests.send(frame);
        }
    }

    /// Half-close the stream from the client side.
    pub(crate) fn close(&mut self) {
        self.requests = None;
    }

    /// Next response, or `None` once the server ended the stream.
    pub(crate) async fn recv(&mut self) -> Option<discovery::DeltaDiscoveryResponse> {
        let bytes = tokio::time::timeout(Duration::from_secs(5), self.responses.recv())
            .await
            .expect("timed out waiting for a response")?;
        Some(discovery::DeltaDiscoveryResponse::decode(bytes).expect("response decodes"))
    }

    pub(crate) async fn expect_response(&mut self) -> discovery::DeltaDiscoveryResponse {
        self.recv().await.expect("stream ended before a response")
    }
}

pub(crate) fn mock_stream() -> (IncomingStream<MockRequestStream, MockResponseSink>, MockClient) {
    let (req_tx, req_rx) = mpsc::unbounded_channel();
    let (resp_tx, resp_rx) = mpsc::unbounded_channel();
    let stream = IncomingStream::new(
        StreamContext::new("10.0.0.1:41000"),
        MockRequestStream { rx: req_rx },
        MockResponseSink { tx: resp_tx },
    );
    let client = MockClient {
        requests: Some(req_tx),
        responses: resp_rx,
    };
    (stream, client)
}

/// A stream whose responses are never written.
pub(crate) fn stalled_stream() -> (IncomingStream<MockRequestStream, StalledSink>, MockClient) {
    let (stream, client) = mock_stream();
    let IncomingStream {
        context, requests, ..
    } = stream;
    (IncomingStream::new(context, requests, StalledSink), client)
}

/// Builds envoy-types delta requests.
#[derive(Debug, Clone)]
pub(crate) struct Req(discovery::DeltaDiscoveryRequest);

impl Req {
    pub(crate) fn new(type_url: &str) -> Self {
        Self(discovery::DeltaDiscoveryRequest {
            type_url: type_url.to_string(),
            ..Default::default()
        })
    }

    pub(crate) fn node(mut self, id: &str) -> Self {
        self.0.node = Some(core::Node {
            id: id.to_string(),
            ..Default::default()
        });
        self
    }

    pub(crate) fn subscribe(mut self, names: &[&str]) -> Self {
        self.0.resource_names_subscribe = names.iter().map(|s| s.to_string()).collect();
        self
    }

    pub(crate) fn unsubscribe(mut self, names: &[&str]) -> Self {
        self.0.resource_names_unsubscribe = names.iter().map(|s| s.to_string()).collect();
        self
    }

    pub(crate) fn nonce(mut self, nonce: &str) -> Self {
        self.0.response_nonce = nonce.to_string();
        self
    }

    pub(crate) fn nack(mut self, message: &str) -> Self {
        self.0.error_detail = Some(RpcStatus {
            code: 3,
            message: message.to_string(),
            details: vec![],
        });
        self
    }

    pub(crate) fn build(self) -> discovery::DeltaDiscoveryRequest {
        self.0
    }
}

pub(crate) fn resource_names(response: &discovery::DeltaDiscoveryResponse) -> Vec<String> {
    response.resources.iter().map(|r| r.name.clone()).collect()
}

/// Serves whatever is in its map. An empty subscription gets everything
/// for wildcard and debug types and nothing otherwise.
#[derive(Debug, Clone, Default)]
pub(crate) struct MapGenerator {
    resources: Arc<Mutex<BTreeMap<String, Bytes>>>,
    failing: Arc<AtomicBool>,
}

impl MapGenerator {
    pub(crate) fn with(names: &[&str]) -> Self {
        let generator = Self::default();
        for name in names {
            generator.set(name, name);
        }
        generator
    }

    pub(crate) fn set(&self, name: &str, value: &str) {
        self.resources
            .lock()
            .unwrap()
            .insert(name.to_string(), Bytes::copy_from_slice(value.as_bytes()));
    }

    pub(crate) fn remove(&self, name: &str) {
        self.resources.lock().unwrap().remove(name);
    }

    pub(crate) fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }
}

impl Generator for MapGenerator {
    fn generate(
        &self,
        _proxy: &Proxy,
        push: &PushContext,
        watched: &WatchedResource,
        _request: &PushRequest,
    ) -> Result<Generation> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::generation(&watched.type_url, "store unavailable"));
        }
        let all = (watched.resource_names.is_empty()
            && matches!(watched.type_url.as_str(), type_url::CLUSTER | type_url::LISTENER))
            || type_url::is_debug(&watched.type_url);
        let resources = self
            .resources
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| all || watched.resource_names.contains(*name))
            .map(|(name, value)| {
                Resource::new(name, ResourceAny::new(watched.type_url.clone(), value.clone()))
                    .with_version(push.version())
            })
            .collect();
        Ok(Generation::resources(resources))
    }
}

/// Reports explicit deltas: whatever was staged since its last call.
#[derive(Debug, Clone, Default)]
pub(crate) struct DeltaGenerator {
    staged: Arc<Mutex<(Vec<String>, Vec<String>)>>,
}

impl DeltaGenerator {
    pub(crate) fn stage(&self, updated: &[&str], removed: &[&str]) {
        *self.staged.lock().unwrap() = (
            updated.iter().map(|s| s.to_string()).collect(),
            removed.iter().map(|s| s.to_string()).collect(),
        );
    }
}

impl Generator for DeltaGenerator {
    fn generate(
        &self,
        _proxy: &Proxy,
        _push: &PushContext,
        _watched: &WatchedResource,
        _request: &PushRequest,
    ) -> Result<Generation> {
        Ok(Generation::nothing())
    }

    fn generate_deltas(
        &self,
        _proxy: &Proxy,
        push: &PushContext,
        _request: &PushRequest,
        watched: &WatchedResource,
    ) -> Result<DeltaGeneration> {
        let (updated, removed) = std::mem::take(&mut *self.staged.lock().unwrap());
        let resources = updated
            .into_iter()
            .map(|name| {
                let value = Bytes::from(name.clone().into_bytes());
                Resource::new(name, ResourceAny::new(watched.type_url.clone(), value))
                    .with_version(push.version())
            })
            .collect();
        Ok(DeltaGeneration::delta(resources, removed))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StatusEvent {
    Registered { type_url: String, nonce: String },
    Reject { type_url: String, code: i32 },
    Delayed(String),
    ExpiredNonce(String),
    AckMismatch(String),
    Push(String),
    SendError(String),
    InternalError,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct RecordingStatusSink {
    events: Arc<Mutex<Vec<StatusEvent>>>,
}

impl RecordingStatusSink {
    pub(crate) fn events(&self) -> Vec<StatusEvent> {
        self.events.lock().unwrap().clone()
    }

    pub(crate) fn count(&self, event: &StatusEvent) -> usize {
        self.events().iter().filter(|e| *e == event).count()
    }

    fn record(&self, event: StatusEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl StatusSink for RecordingStatusSink {
    fn register_event(&self, _connection_id: &str, type_url: &str, nonce: &str) {
        self.record(StatusEvent::Registered {
            type_url: type_url.to_string(),
            nonce: nonce.to_string(),
        });
    }

    fn record_reject(&self, type_url: &str, code: i32) {
        self.record(StatusEvent::Reject {
            type_url: type_url.to_string(),
            code,
        });
    }

    fn record_delayed_push(&self, type_url: &str) {
        self.record(StatusEvent::Delayed(type_url.to_string()));
    }

    fn record_expired_nonce(&self, type_url: &str) {
        self.record(StatusEvent::ExpiredNonce(type_url.to_string()));
    }

    fn record_ack_mismatch(&self, type_url: &str) {
        self.record(StatusEvent::AckMismatch(type_url.to_string()));
    }

    fn record_push(&self, type_url: &str, _duration: Duration, _size: usize) {
        self.record(StatusEvent::Push(type_url.to_string()));
    }

    fn record_send_error(&self, type_url: &str) {
        self.record(StatusEvent::SendError(type_url.to_string()));
    }

    fn record_internal_error(&self) {
        self.record(StatusEvent::InternalError);
    }
}
