//! Provides abstraction for transport layers.

use crate::error::Result;
use bytes::Bytes;
use http::HeaderMap;
use std::future::Future;

#[cfg(feature = "transport-tonic")]
pub mod tonic;

/// The inbound half of an accepted delta ADS stream.
///
/// Raw byte transport where the bytes are serialized DeltaDiscoveryRequests;
/// (de)serialization is handled by the server through its codec.
pub trait RequestStream: Send + 'static {
    /// Receive the next serialized request from the client.
    ///
    /// Returns:
    /// - `Ok(Some(bytes))` - Received a request.
    /// - `Ok(None)` - Stream closed normally by the client.
    /// - `Err(_)` - Stream error (connection dropped, etc.)
    fn recv(&mut self) -> impl Future<Output = Result<Option<Bytes>>> + Send;
}

/// The outbound half of an accepted delta ADS stream.
pub trait ResponseSink: Send + 'static {
    /// Send serialized DeltaDiscoveryResponse bytes to the client.
    fn send(&mut self, response: Bytes) -> impl Future<Output = Result<()>> + Send;
}

/// Information about the peer of an accepted stream.
#[derive(Debug, Clone, Default)]
pub struct StreamContext {
    /// Remote address, `0.0.0.0` when unknown.
    pub peer_addr: String,
    /// Request headers, available to authenticators and admission control.
    pub metadata: HeaderMap,
}

impl StreamContext {
    /// Create a context for the given peer address.
    pub fn new(peer_addr: impl Into<String>) -> Self {
        Self {
            peer_addr: peer_addr.into(),
            metadata: HeaderMap::new(),
        }
    }

    /// Attach request headers.
    pub fn with_metadata(mut self, metadata: HeaderMap) -> Self {
        self.metadata = metadata;
        self
    }
}

/// An accepted bidirectional stream handed to
/// [`DiscoveryServer::stream_deltas`](crate::DiscoveryServer::stream_deltas).
#[derive(Debug)]
pub struct IncomingStream<Rq, Rs> {
    /// Peer information.
    pub context: StreamContext,
    /// Inbound requests.
    pub requests: Rq,
    /// Outbound responses.
    pub responses: Rs,
}

impl<Rq, Rs> IncomingStream<Rq, Rs>
where
    Rq: RequestStream,
    Rs: ResponseSink,
{
    /// Bundle the two halves of a stream with its peer context.
    pub fn new(context: StreamContext, requests: Rq, responses: Rs) -> Self {
        Self {
            context,
            requests,
            responses,
        }
    }
}
