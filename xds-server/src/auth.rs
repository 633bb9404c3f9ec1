//! Stream admission and authentication hooks.

use crate::error::Result;
use crate::transport::StreamContext;

/// Extracts the identities of a stream's peer.
pub trait Authenticator: Send + Sync + 'static {
    /// Returns the peer identities, or `None` for an anonymous peer.
    ///
    /// An `Err` refuses the stream.
    fn authenticate(&self, context: &StreamContext) -> Result<Option<Vec<String>>>;
}

/// Treats every peer as anonymous.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAnonymous;

impl Authenticator for AllowAnonymous {
    fn authenticate(&self, _context: &StreamContext) -> Result<Option<Vec<String>>> {
        Ok(None)
    }
}

/// Decides whether a new stream may start, e.g. to rate limit reconnect storms.
pub trait Admission: Send + Sync + 'static {
    /// Returns `Err` (usually [`Error::RateLimited`](crate::Error::RateLimited))
    /// to refuse the stream.
    fn admit(&self, context: &StreamContext) -> Result<()>;
}

/// Admits every stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdmitAll;

impl Admission for AdmitAll {
    fn admit(&self, _context: &StreamContext) -> Result<()> {
        Ok(())
    }
}
