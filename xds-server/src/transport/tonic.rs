//! `tonic` based transport implementation.
//!
//! [`DeltaAdsService`] serves the `DeltaAggregatedResources` method of the
//! envoy `AggregatedDiscoveryService` using tonic's low-level `Grpc` server
//! with a `BytesCodec`, leaving serialization to the server's codec.

use std::convert::Infallible;
use std::task::{Context, Poll};

use bytes::{Buf, BufMut, Bytes};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::codegen::{Body, BoxFuture, Service, StdError};
use tonic::server::{Grpc, NamedService, StreamingService};
use tonic::{Status, Streaming};

use crate::codec::XdsCodec;
use crate::error::{Error, Result};
use crate::runtime::Runtime;
use crate::server::DiscoveryServer;
use crate::transport::{IncomingStream, RequestStream, ResponseSink, StreamContext};

/// The gRPC service name of ADS.
const ADS_SERVICE: &str = "envoy.service.discovery.v3.AggregatedDiscoveryService";

/// The gRPC path for the ADS DeltaAggregatedResources RPC.
const DELTA_ADS_PATH: &str =
    "/envoy.service.discovery.v3.AggregatedDiscoveryService/DeltaAggregatedResources";

const RESPONSE_CHANNEL_BUFFER_SIZE: usize = 16;

/// A codec that passes bytes through without serialization.
///
/// This allows us to handle serialization in the xDS server layer
/// rather than in the transport layer.
#[derive(Debug, Clone, Copy)]
struct BytesCodec;

impl Codec for BytesCodec {
    type Encode = Bytes;
    type Decode = Bytes;
    type Encoder = BytesEncoder;
    type Decoder = BytesDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        BytesEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        BytesDecoder
    }
}

#[derive(Debug)]
struct BytesEncoder;

impl Encoder for BytesEncoder {
    type Item = Bytes;
    type Error = Status;

    fn encode(
        &mut self,
        item: Self::Item,
        dst: &mut EncodeBuf<'_>,
    ) -> std::result::Result<(), Self::Error> {
        dst.put_slice(&item);
        Ok(())
    }
}

#[derive(Debug)]
struct BytesDecoder;

impl Decoder for BytesDecoder {
    type Item = Bytes;
    type Error = Status;

    fn decode(
        &mut self,
        src: &mut DecodeBuf<'_>,
    ) -> std::result::Result<Option<Self::Item>, Self::Error> {
        Ok(Some(src.copy_to_bytes(src.remaining())))
    }
}

/// Inbound half of a tonic stream.
#[derive(Debug)]
pub struct TonicRequestStream {
    inner: Streaming<Bytes>,
}

impl RequestStream for TonicRequestStream {
    async fn recv(&mut self) -> Result<Option<Bytes>> {
        self.inner.message().await.map_err(Error::Stream)
    }
}

/// Outbound half of a tonic stream.
#[derive(Debug)]
pub struct TonicResponseSink {
    sender: mpsc::Sender<std::result::Result<Bytes, Status>>,
}

impl ResponseSink for TonicResponseSink {
    async fn send(&mut self, response: Bytes) -> Result<()> {
        self.sender
            .send(Ok(response))
            .await
            .map_err(|_| Error::StreamClosed)
    }
}

/// A tonic service serving delta ADS from a [`DiscoveryServer`].
///
/// Other ADS methods answer `UNIMPLEMENTED`.
///
/// # Example
///
/// ```ignore
/// let server = DiscoveryServer::builder(config, ProstCodec, TokioRuntime)
///     .with_generator(type_url::CLUSTER, clusters)
///     .build();
/// server.set_ready(true);
///
/// tonic::transport::Server::builder()
///     .add_service(DeltaAdsService::new(server))
///     .serve("[::]:15010".parse()?)
///     .await?;
/// ```
#[derive(Debug)]
pub struct DeltaAdsService<C, R> {
    server: DiscoveryServer<C, R>,
}

impl<C, R> Clone for DeltaAdsService<C, R> {
    fn clone(&self) -> Self {
        Self {
            server: self.server.clone(),
        }
    }
}

impl<C, R> DeltaAdsService<C, R>
where
    C: XdsCodec,
    R: Runtime,
{
    /// Serve the given discovery server.
    pub fn new(server: DiscoveryServer<C, R>) -> Self {
        Self { server }
    }
}

impl<C, R> NamedService for DeltaAdsService<C, R> {
    const NAME: &'static str = ADS_SERVICE;
}

impl<C, R, B> Service<http::Request<B>> for DeltaAdsService<C, R>
where
    C: XdsCodec,
    R: Runtime,
    B: Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
{
    type Response = http::Response<tonic::body::Body>;
    type Error = Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        match req.uri().path() {
            DELTA_ADS_PATH => {
                let method = DeltaStreamSvc {
                    server: self.server.clone(),
                };
                Box::pin(async move {
                    let mut grpc = Grpc::new(BytesCodec);
                    Ok(grpc.streaming(method, req).await)
                })
            }
            path => {
                let status = Status::unimplemented(format!("{path} is not served"));
                Box::pin(async move { Ok(status.into_http()) })
            }
        }
    }
}

struct DeltaStreamSvc<C, R> {
    server: DiscoveryServer<C, R>,
}

impl<C, R> StreamingService<Bytes> for DeltaStreamSvc<C, R>
where
    C: XdsCodec,
    R: Runtime,
{
    type Response = Bytes;
    type ResponseStream = ReceiverStream<std::result::Result<Bytes, Status>>;
    type Future = BoxFuture<tonic::Response<Self::ResponseStream>, Status>;

    fn call(&mut self, request: tonic::Request<Streaming<Bytes>>) -> Self::Future {
        let server = self.server.clone();
        Box::pin(async move {
            let peer_addr = request
                .remote_addr()
                .map_or_else(|| "0.0.0.0".to_string(), |addr| addr.to_string());
            let metadata = request.metadata().clone().into_headers();
            let context = StreamContext::new(peer_addr).with_metadata(metadata);

            let (sender, receiver) = mpsc::channel(RESPONSE_CHANNEL_BUFFER_SIZE);
            let stream = IncomingStream::new(
                context,
                TonicRequestStream {
                    inner: request.into_inner(),
                },
                TonicResponseSink {
                    sender: sender.clone(),
                },
            );

            let runtime = server.runtime().clone();
            runtime.spawn(async move {
                if let Err(e) = server.stream_deltas(stream).await {
                    let _ = sender.send(Err(e.into())).await;
                }
            });

            Ok(tonic::Response::new(ReceiverStream::new(receiver)))
        })
    }
}
