//! Configuration for the xDS server.

use std::collections::HashSet;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::type_url;

/// Configuration for the xDS server.
///
/// # Example
///
/// ```
/// use xds_server::ServerConfig;
/// use std::time::Duration;
///
/// let config = ServerConfig::default()
///     .with_flow_control_timeout(Duration::from_secs(5)).unwrap()
///     .with_send_timeout(Some(Duration::from_secs(10))).unwrap()
///     .with_control_plane_id("istiod-0");
/// ```
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Whether pushes to a type wait for the previous response to be
    /// acknowledged.
    ///
    /// Default: true.
    pub enable_flow_control: bool,

    /// How long a type may stay unacknowledged before pushes are sent anyway.
    ///
    /// Default: 15 seconds.
    pub flow_control_timeout: Duration,

    /// Upper bound on writing one response. Exceeding it closes the connection.
    ///
    /// Default: None (no bound).
    pub send_timeout: Option<Duration>,

    /// Capacity of the queue between a connection's receive and main actors.
    ///
    /// Default: 1.
    pub request_buffer_size: usize,

    /// Capacity of each connection's push event queue.
    ///
    /// Default: 16.
    pub push_buffer_size: usize,

    /// Refuse streams whose peer has no identity.
    ///
    /// Default: false.
    pub require_authentication: bool,

    /// Panic when the ACK heuristics disagree instead of only logging.
    /// Intended for tests.
    ///
    /// Default: false.
    pub unsafe_assertions: bool,

    /// Types whose subscription tracks every generated resource when the
    /// client did not name any.
    ///
    /// Default: Cluster and Listener.
    pub wildcard_types: HashSet<String>,

    /// Identifier sent in the `control_plane` field of each response.
    ///
    /// Default: None.
    pub control_plane_id: Option<String>,
}

impl ServerConfig {
    /// Enable or disable flow control.
    pub fn with_flow_control(mut self, enabled: bool) -> Self {
        self.enable_flow_control = enabled;
        self
    }

    /// Set the flow control timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if `timeout` is zero.
    pub fn with_flow_control_timeout(mut self, timeout: Duration) -> Result<Self> {
        if timeout.is_zero() {
            return Err(Error::Validation(
                "flow_control_timeout must be greater than zero".into(),
            ));
        }
        self.flow_control_timeout = timeout;
        Ok(self)
    }

    /// Set the send timeout. `None` disables it.
    ///
    /// # Errors
    ///
    /// Returns an error if `timeout` is `Some(0)`.
    pub fn with_send_timeout(mut self, timeout: Option<Duration>) -> Result<Self> {
        if timeout.is_some_and(|t| t.is_zero()) {
            return Err(Error::Validation(
                "send_timeout must be greater than zero".into(),
            ));
        }
        self.send_timeout = timeout;
        Ok(self)
    }

    /// Set the request queue capacity.
    ///
    /// # Errors
    ///
    /// Returns an error if `size` is zero.
    pub fn with_request_buffer_size(mut self, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::Validation(
                "request_buffer_size must be greater than zero".into(),
            ));
        }
        self.request_buffer_size = size;
        Ok(self)
    }

    /// Set the push queue capacity.
    ///
    /// # Errors
    ///
    /// Returns an error if `size` is zero.
    pub fn with_push_buffer_size(mut self, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::Validation(
                "push_buffer_size must be greater than zero".into(),
            ));
        }
        self.push_buffer_size = size;
        Ok(self)
    }

    /// Require authenticated peers.
    pub fn with_require_authentication(mut self, required: bool) -> Self {
        self.require_authentication = required;
        self
    }

    /// Enable panicking assertions.
    pub fn with_unsafe_assertions(mut self, enabled: bool) -> Self {
        self.unsafe_assertions = enabled;
        self
    }

    /// Replace the set of wildcard types.
    pub fn with_wildcard_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.wildcard_types = types.into_iter().map(Into::into).collect();
        self
    }

    /// Set the control plane identifier.
    pub fn with_control_plane_id(mut self, id: impl Into<String>) -> Self {
        self.control_plane_id = Some(id.into());
        self
    }

    pub(crate) fn is_wildcard(&self, type_url: &str) -> bool {
        self.wildcard_types.contains(type_url)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enable_flow_control: true,
            flow_control_timeout: Duration::from_secs(15),
            send_timeout: None,
            request_buffer_size: 1,
            push_buffer_size: 16,
            require_authentication: false,
            unsafe_assertions: false,
            wildcard_types: HashSet::from([
                type_url::CLUSTER.to_string(),
                type_url::LISTENER.to_string(),
            ]),
            control_plane_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert!(config.enable_flow_control);
        assert_eq!(config.flow_control_timeout, Duration::from_secs(15));
        assert!(config.is_wildcard(type_url::CLUSTER));
        assert!(config.is_wildcard(type_url::LISTENER));
        assert!(!config.is_wildcard(type_url::ENDPOINT));
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(ServerConfig::default().with_flow_control_timeout(Duration::ZERO).is_err());
        assert!(ServerConfig::default().with_send_timeout(Some(Duration::ZERO)).is_err());
        assert!(ServerConfig::default().with_send_timeout(None).is_ok());
        assert!(ServerConfig::default().with_request_buffer_size(0).is_err());
        assert!(ServerConfig::default().with_push_buffer_size(0).is_err());
    }

    #[test]
    fn test_wildcard_types_override() {
        let config = ServerConfig::default().with_wildcard_types([type_url::SECRET]);
        assert!(config.is_wildcard(type_url::SECRET));
        assert!(!config.is_wildcard(type_url::CLUSTER));
    }
}
