//! Error types for the xDS server.

use std::time::Duration;

use thiserror::Error;

/// Error type for the xDS server.
#[derive(Debug, Error)]
pub enum Error {
    /// The first request on a stream did not carry a node with an id.
    #[error("missing node information")]
    MissingNode,

    /// The server has not been marked ready to serve discovery information.
    #[error("server is not ready to serve discovery information")]
    NotReady,

    /// The stream was refused by connection admission.
    #[error("request rate limit exceeded: {0}")]
    RateLimited(String),

    /// The peer could not be authenticated.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// Invalid configuration value.
    #[error("validation error: {0}")]
    Validation(String),

    /// A resource generator failed.
    #[error("failed to generate {type_url}: {message}")]
    Generation {
        /// Type URL the generator was invoked for.
        type_url: String,
        /// Generator supplied description.
        message: String,
    },

    /// An outbound frame could not be encoded.
    #[error("encode error: {0}")]
    Encode(String),

    /// An inbound frame could not be decoded.
    #[cfg(feature = "codegen-prost")]
    #[error("decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    /// The underlying gRPC stream failed.
    #[cfg(feature = "transport-tonic")]
    #[error("stream error: {0}")]
    Stream(#[from] tonic::Status),

    /// Generic transport failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// The peer went away.
    #[error("stream closed")]
    StreamClosed,

    /// Writing a response did not complete in time.
    #[error("timed out after {0:?} writing response")]
    SendTimeout(Duration),
}

impl Error {
    /// Build a [`Error::Generation`] for the given type URL.
    pub fn generation(type_url: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Error::Generation {
            type_url: type_url.into(),
            message: message.to_string(),
        }
    }

    /// Returns true if the error is an ordinary end of stream rather than a
    /// failure worth reporting.
    pub fn is_expected_termination(&self) -> bool {
        match self {
            Error::StreamClosed => true,
            #[cfg(feature = "transport-tonic")]
            Error::Stream(status) => matches!(
                status.code(),
                tonic::Code::Cancelled | tonic::Code::DeadlineExceeded
            ),
            _ => false,
        }
    }
}

#[cfg(feature = "transport-tonic")]
impl From<Error> for tonic::Status {
    fn from(err: Error) -> Self {
        match err {
            Error::MissingNode => tonic::Status::invalid_argument(err.to_string()),
            Error::NotReady => tonic::Status::unavailable(err.to_string()),
            Error::RateLimited(_) => tonic::Status::resource_exhausted(err.to_string()),
            Error::Unauthenticated(_) => tonic::Status::unauthenticated(err.to_string()),
            Error::Stream(status) => status,
            #[cfg(feature = "codegen-prost")]
            Error::Decode(_) => tonic::Status::invalid_argument(err.to_string()),
            Error::SendTimeout(_) => tonic::Status::deadline_exceeded(err.to_string()),
            _ => tonic::Status::internal(err.to_string()),
        }
    }
}

/// Result type alias for xDS server operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_termination() {
        assert!(Error::StreamClosed.is_expected_termination());
        assert!(!Error::MissingNode.is_expected_termination());
        assert!(!Error::SendTimeout(Duration::from_secs(1)).is_expected_termination());
    }

    #[cfg(feature = "transport-tonic")]
    #[test]
    fn test_status_codes() {
        let status: tonic::Status = Error::MissingNode.into();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
        assert_eq!(status.message(), "missing node information");

        let status: tonic::Status = Error::NotReady.into();
        assert_eq!(status.code(), tonic::Code::Unavailable);

        let status: tonic::Status = Error::RateLimited("too many streams".into()).into();
        assert_eq!(status.code(), tonic::Code::ResourceExhausted);

        let status: tonic::Status = Error::generation("t", "boom").into();
        assert_eq!(status.code(), tonic::Code::Internal);

        assert!(Error::Stream(tonic::Status::cancelled("bye")).is_expected_termination());
    }
}
