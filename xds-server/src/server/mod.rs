//! The discovery server and the per-connection main actor.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use arc_swap::ArcSwap;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::auth::{Admission, AdmitAll, AllowAnonymous, Authenticator};
use crate::codec::XdsCodec;
use crate::error::{Error, Result};
use crate::generator::{Generator, GeneratorRegistry};
use crate::message::DeltaDiscoveryRequest;
use crate::runtime::Runtime;
use crate::status::{NoopStatusSink, StatusSink};
use crate::transport::{IncomingStream, RequestStream, ResponseSink};

pub use connection::{ConnectionState, Proxy};
pub use push::{ConfigKey, PushCompletion, PushContext, PushRequest, TriggerReason};
pub use watched::WatchedResource;

use connection::{Connection, ConnectionHandle, Receiver};
use push::{Overflow, PushDone, PushEvent};

pub mod config;
pub(crate) mod connection;
pub mod push;
mod request;
mod scheduler;
pub mod watched;

use config::ServerConfig;

/// State shared by the server handle and every connection.
pub(crate) struct ServerInner<C, R> {
    pub(crate) config: ServerConfig,
    pub(crate) codec: C,
    pub(crate) runtime: R,
    pub(crate) generators: GeneratorRegistry,
    pub(crate) status: Arc<dyn StatusSink>,
    authenticator: Arc<dyn Authenticator>,
    admission: Arc<dyn Admission>,
    pub(crate) push_context: ArcSwap<PushContext>,
    pub(crate) connections: DashMap<String, ConnectionHandle>,
    ready: AtomicBool,
    pub(crate) conn_seq: AtomicU64,
}

/// Builder for [`DiscoveryServer`].
pub struct DiscoveryServerBuilder<C, R> {
    config: ServerConfig,
    codec: C,
    runtime: R,
    generators: GeneratorRegistry,
    status: Arc<dyn StatusSink>,
    authenticator: Arc<dyn Authenticator>,
    admission: Arc<dyn Admission>,
    push_context: Arc<PushContext>,
}

impl<C, R> fmt::Debug for DiscoveryServerBuilder<C, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscoveryServerBuilder")
            .field("config", &self.config)
            .field("generators", &self.generators)
            .field("push_context", &self.push_context)
            .finish_non_exhaustive()
    }
}

impl<C, R> DiscoveryServerBuilder<C, R>
where
    C: XdsCodec,
    R: Runtime,
{
    /// Create a new builder with the given configuration, codec, and runtime.
    pub fn new(config: ServerConfig, codec: C, runtime: R) -> Self {
        Self {
            config,
            codec,
            runtime,
            generators: GeneratorRegistry::default(),
            status: Arc::new(NoopStatusSink),
            authenticator: Arc::new(AllowAnonymous),
            admission: Arc::new(AdmitAll),
            push_context: Arc::new(PushContext::new("")),
        }
    }

    /// Register the generator for a type URL.
    pub fn with_generator(mut self, type_url: impl Into<String>, generator: impl Generator) -> Self {
        self.generators.insert(type_url, Arc::new(generator));
        self
    }

    /// Register the generator used for type URLs without a dedicated one.
    pub fn with_default_generator(mut self, generator: impl Generator) -> Self {
        self.generators.set_fallback(Arc::new(generator));
        self
    }

    /// Set the status sink. Defaults to [`NoopStatusSink`].
    pub fn with_status_sink(mut self, status: impl StatusSink) -> Self {
        self.status = Arc::new(status);
        self
    }

    /// Set the authenticator. Defaults to [`AllowAnonymous`].
    pub fn with_authenticator(mut self, authenticator: impl Authenticator) -> Self {
        self.authenticator = Arc::new(authenticator);
        self
    }

    /// Set the admission policy. Defaults to [`AdmitAll`].
    pub fn with_admission(mut self, admission: impl Admission) -> Self {
        self.admission = Arc::new(admission);
        self
    }

    /// Set the initial push context.
    pub fn with_push_context(mut self, push_context: Arc<PushContext>) -> Self {
        self.push_context = push_context;
        self
    }

    /// Build the server.
    ///
    /// The server starts out not ready; call
    /// [`DiscoveryServer::set_ready`] once the push context is populated.
    pub fn build(self) -> DiscoveryServer<C, R> {
        DiscoveryServer {
            inner: Arc::new(ServerInner {
                config: self.config,
                codec: self.codec,
                runtime: self.runtime,
                generators: self.generators,
                status: self.status,
                authenticator: self.authenticator,
                admission: self.admission,
                push_context: ArcSwap::new(self.push_context),
                connections: DashMap::new(),
                ready: AtomicBool::new(false),
                conn_seq: AtomicU64::new(0),
            }),
        }
    }
}

/// A point-in-time view of one connection.
#[derive(Debug, Clone)]
pub struct ConnectionSnapshot {
    /// Connection id.
    pub id: String,
    /// Peer address.
    pub peer_addr: String,
    /// When the stream was accepted.
    pub connected_at: Instant,
    /// Lifecycle state.
    pub state: ConnectionState,
    /// The client, once initialized.
    pub proxy: Option<Proxy>,
    /// Watched resources ordered by type URL.
    pub watched: Vec<WatchedResource>,
    /// Deferred pushes keyed by type URL.
    pub blocked: BTreeMap<String, PushRequest>,
}

/// An incremental xDS server.
///
/// Cloning this handle creates a new reference to the same server.
pub struct DiscoveryServer<C, R> {
    inner: Arc<ServerInner<C, R>>,
}

impl<C, R> Clone for DiscoveryServer<C, R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C, R> fmt::Debug for DiscoveryServer<C, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscoveryServer")
            .field("config", &self.inner.config)
            .field("generators", &self.inner.generators)
            .field("connections", &self.inner.connections.len())
            .field("ready", &self.inner.ready.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<C, R> DiscoveryServer<C, R>
where
    C: XdsCodec,
    R: Runtime,
{
    /// Create a new builder with the given configuration, codec, and runtime.
    pub fn builder(config: ServerConfig, codec: C, runtime: R) -> DiscoveryServerBuilder<C, R> {
        DiscoveryServerBuilder::new(config, codec, runtime)
    }

    pub(crate) fn runtime(&self) -> &R {
        &self.inner.runtime
    }

    /// Allow or refuse new streams. Established connections are unaffected.
    pub fn set_ready(&self, ready: bool) {
        self.inner.ready.store(ready, Ordering::Release);
    }

    /// Whether new streams are accepted.
    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::Acquire)
    }

    /// Replace the global push context.
    ///
    /// Requests arriving afterwards are answered from the new context.
    /// Connected clients only see it once a push is sent with
    /// [`push`](Self::push).
    pub fn update_push_context(&self, push_context: Arc<PushContext>) {
        self.inner.push_context.store(push_context);
    }

    /// The current global push context.
    pub fn global_push_context(&self) -> Arc<PushContext> {
        self.inner.push_context.load_full()
    }

    /// Queue a push on every connection.
    ///
    /// Never waits on a connection: when its push queue is full the request
    /// is merged with the other pushes pending for it. The returned
    /// [`PushCompletion`] resolves once every connection has sent or deferred
    /// the push, or closed.
    pub fn push(&self, request: PushRequest) -> PushCompletion {
        let handles: Vec<ConnectionHandle> = self
            .inner
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let mut pending = Vec::with_capacity(handles.len());
        for handle in handles {
            let (done, rx) = PushDone::channel();
            let event = PushEvent {
                request: request.clone(),
                done,
            };
            if handle.deliver(event) {
                pending.push(rx);
            }
        }
        PushCompletion::new(pending)
    }

    /// Ids of all registered connections, sorted.
    pub fn connection_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    /// Number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    /// Snapshot a connection's state, or `None` if it is not registered.
    pub fn snapshot(&self, id: &str) -> Option<ConnectionSnapshot> {
        let conn = self
            .inner
            .connections
            .get(id)
            .map(|entry| Arc::clone(&entry.conn))?;
        let table = conn.table();
        Some(ConnectionSnapshot {
            id: id.to_string(),
            peer_addr: conn.peer_addr().to_string(),
            connected_at: conn.connected_at(),
            state: conn.state(),
            proxy: conn.proxy().cloned(),
            watched: table.watched(),
            blocked: table.blocked(),
        })
    }

    /// Stop a connection. Returns false if it is not registered.
    ///
    /// The stream ends without an error and the client is expected to
    /// reconnect.
    pub fn close_connection(&self, id: &str) -> bool {
        let Some(conn) = self
            .inner
            .connections
            .get(id)
            .map(|entry| Arc::clone(&entry.conn))
        else {
            return false;
        };
        tracing::info!(con_id = id, "ADS: closing connection on request");
        conn.stop_token().cancel();
        true
    }

    /// Serve one delta ADS stream until it ends.
    ///
    /// Returns `Ok(())` when the client disconnects or the connection is
    /// stopped, and the fatal error otherwise.
    pub async fn stream_deltas<Rq, Rs>(&self, stream: IncomingStream<Rq, Rs>) -> Result<()>
    where
        Rq: RequestStream,
        Rs: ResponseSink,
    {
        let inner = &self.inner;
        let IncomingStream {
            context,
            requests,
            responses,
        } = stream;

        if !self.is_ready() {
            tracing::warn!(peer = %context.peer_addr, "ADS: refusing stream, server not ready");
            return Err(Error::NotReady);
        }
        if let Err(e) = inner.admission.admit(&context) {
            tracing::warn!(peer = %context.peer_addr, error = %e, "ADS: stream refused");
            return Err(e);
        }
        let identities = inner.authenticator.authenticate(&context)?.unwrap_or_default();
        if identities.is_empty() && inner.config.require_authentication {
            tracing::warn!(peer = %context.peer_addr, "ADS: refusing anonymous stream");
            return Err(Error::Unauthenticated(
                "authentication required".to_string(),
            ));
        }

        let conn = Arc::new(Connection::new(context.peer_addr, identities));
        // Public fields can bypass the validating setters.
        let (req_tx, req_rx) = mpsc::channel(inner.config.request_buffer_size.max(1));
        let (push_tx, push_rx) = mpsc::channel(inner.config.push_buffer_size.max(1));
        let (err_tx, err_rx) = oneshot::channel();

        let receiver = Receiver {
            server: Arc::clone(inner),
            conn: Arc::clone(&conn),
            requests,
            req_tx,
            push_tx,
        };
        inner.runtime.spawn(receiver.run(err_tx));

        let mut driver = Driver {
            server: Arc::clone(inner),
            conn,
            responses,
            requests: req_rx,
            pushes: push_rx,
            errors: err_rx,
        };
        let result = driver.run().await;
        drop(driver);

        match result {
            Err(e) if e.is_expected_termination() => Ok(()),
            other => other,
        }
    }
}

/// The main actor of one connection.
///
/// Closing happens on drop, so a connection is deregistered even when the
/// serving future is cancelled.
pub(crate) struct Driver<Rs, C, R> {
    server: Arc<ServerInner<C, R>>,
    conn: Arc<Connection>,
    responses: Rs,
    requests: mpsc::Receiver<DeltaDiscoveryRequest>,
    pushes: mpsc::Receiver<PushEvent>,
    errors: oneshot::Receiver<Error>,
}

impl<Rs, C, R> Driver<Rs, C, R>
where
    Rs: ResponseSink,
    C: XdsCodec,
    R: Runtime,
{
    async fn run(&mut self) -> Result<()> {
        // Pushes queue up until initialization completes.
        let mut state = self.conn.subscribe_state();
        tokio::select! {
            initialized = async { state.wait_for(|s| *s >= ConnectionState::Active).await.is_ok() } => {
                if !initialized {
                    return Ok(());
                }
            }
            _ = self.conn.stop_token().cancelled() => return Ok(()),
        }

        loop {
            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(request) => self.process_request(request).await?,
                    None => {
                        return match (&mut self.errors).await {
                            Ok(e) => Err(e),
                            Err(_) => Ok(()),
                        };
                    }
                },
                event = self.pushes.recv() => match event {
                    Some(PushEvent { request, done }) => {
                        self.push_connection(request).await?;
                        drop(done);
                    }
                    None => return Ok(()),
                },
                // Queued events are older than folded ones.
                _ = self.conn.overflowed(), if self.pushes.is_empty() => {
                    if let Some(Overflow { request, done }) = self.conn.take_overflow() {
                        self.push_connection(request).await?;
                        drop(done);
                    }
                }
                _ = self.conn.stop_token().cancelled() => return Ok(()),
            }
        }
    }
}

impl<Rs, C, R> Driver<Rs, C, R> {
    fn close(&mut self) {
        self.conn.advance(ConnectionState::Closing);
        self.conn.stop_token().cancel();

        self.requests.close();
        while self.requests.try_recv().is_ok() {}
        self.errors.close();
        // Dropping queued events completes their push acknowledgements.
        self.pushes.close();
        while self.pushes.try_recv().is_ok() {}
        drop(self.conn.take_overflow());

        let id = self.conn.id();
        if !id.is_empty() {
            self.server.connections.remove(id);
        }
        self.conn.advance(ConnectionState::Closed);
        tracing::debug!(con_id = id, peer = self.conn.peer_addr(), "ADS: connection closed");
    }
}

impl<Rs, C, R> Drop for Driver<Rs, C, R> {
    fn drop(&mut self) {
        self.close();
    }
}
