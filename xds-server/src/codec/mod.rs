//! Codec for encoding/decoding delta xDS messages.
//!
//! The codec layer converts between serialized bytes and the crate-owned
//! message types ([`DeltaDiscoveryRequest`], [`DeltaDiscoveryResponse`]).
//! This abstraction allows different protobuf implementations
//! (prost, google-protobuf) to be used with the same server logic.

use crate::error::Result;
use crate::message::{DeltaDiscoveryRequest, DeltaDiscoveryResponse};
use bytes::Bytes;

#[cfg(feature = "codegen-prost")]
pub mod prost;

/// Trait for encoding/decoding delta discovery messages on the server side.
///
/// Implementations convert between the crate-owned message types
/// and their serialized wire format.
pub trait XdsCodec: Send + Sync + 'static {
    /// Decode bytes received from a client into a [`DeltaDiscoveryRequest`].
    fn decode_request(&self, bytes: Bytes) -> Result<DeltaDiscoveryRequest>;

    /// Encode a [`DeltaDiscoveryResponse`] to bytes.
    fn encode_response(&self, response: &DeltaDiscoveryResponse) -> Result<Bytes>;
}
