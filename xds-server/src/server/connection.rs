//! Per-connection state and the receive actor.
//!
//! Each accepted stream gets a [`Connection`] shared by two tasks: the
//! receive actor below, which reads and decodes frames and performs
//! initialization, and the main actor in [`crate::server`], which processes
//! requests and push events.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Notify, mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::codec::XdsCodec;
use crate::error::{Error, Result};
use crate::message::{DeltaDiscoveryRequest, Node};
use crate::runtime::Runtime;
use crate::server::ServerInner;
use crate::server::push::{Overflow, PushEvent};
use crate::server::watched::WatchTable;
use crate::transport::RequestStream;

/// Lifecycle of a connection.
///
/// States only move forward. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConnectionState {
    /// Stream accepted, no request parsed yet.
    Connecting,
    /// First request received and being validated.
    Initializing,
    /// Serving requests and pushes.
    Active,
    /// Shutting down.
    Closing,
    /// Shut down.
    Closed,
}

/// The client at the other end of a connection, as established by its first
/// request.
#[derive(Debug, Clone)]
pub struct Proxy {
    id: String,
    node: Node,
    identities: Vec<String>,
}

impl Proxy {
    /// Create a proxy record.
    pub fn new(id: impl Into<String>, node: Node, identities: Vec<String>) -> Self {
        Self {
            id: id.into(),
            node,
            identities,
        }
    }

    /// The node id reported by the client.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The node reported in the first request.
    pub fn node(&self) -> &Node {
        &self.node
    }

    /// Authenticated identities of the peer. Empty when anonymous.
    pub fn identities(&self) -> &[String] {
        &self.identities
    }
}

#[derive(Debug)]
struct Initialized {
    id: String,
    proxy: Proxy,
}

/// One client session.
#[derive(Debug)]
pub(crate) struct Connection {
    peer_addr: String,
    connected_at: Instant,
    identities: Vec<String>,
    init: OnceLock<Initialized>,
    table: Mutex<WatchTable>,
    overflow: Mutex<Option<Overflow>>,
    overflow_ready: Notify,
    state: watch::Sender<ConnectionState>,
    stop: CancellationToken,
    nonce_seq: AtomicU64,
}

impl Connection {
    pub(crate) fn new(peer_addr: String, identities: Vec<String>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        Self {
            peer_addr,
            connected_at: Instant::now(),
            identities,
            init: OnceLock::new(),
            table: Mutex::new(WatchTable::default()),
            overflow: Mutex::new(None),
            overflow_ready: Notify::new(),
            state,
            stop: CancellationToken::new(),
            nonce_seq: AtomicU64::new(0),
        }
    }

    /// Connection id, set once the first request was accepted.
    pub(crate) fn id(&self) -> &str {
        self.init.get().map_or("", |init| init.id.as_str())
    }

    pub(crate) fn proxy(&self) -> Option<&Proxy> {
        self.init.get().map(|init| &init.proxy)
    }

    pub(crate) fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    pub(crate) fn connected_at(&self) -> Instant {
        self.connected_at
    }

    /// Lock the watch table.
    ///
    /// Critical sections must stay short: no generator calls and no I/O
    /// while the guard is held.
    pub(crate) fn table(&self) -> MutexGuard<'_, WatchTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn overflow(&self) -> MutexGuard<'_, Option<Overflow>> {
        self.overflow.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove the pushes folded while the queue was full.
    pub(crate) fn take_overflow(&self) -> Option<Overflow> {
        self.overflow().take()
    }

    /// Resolves once pushes were folded into the overflow slot.
    pub(crate) async fn overflowed(&self) {
        self.overflow_ready.notified().await;
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub(crate) fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Move to `next` if it is later than the current state.
    ///
    /// Returns whether the state changed.
    pub(crate) fn advance(&self, next: ConnectionState) -> bool {
        self.state.send_if_modified(|state| {
            if next > *state {
                *state = next;
                true
            } else {
                false
            }
        })
    }

    pub(crate) fn stop_token(&self) -> &CancellationToken {
        &self.stop
    }

    /// Mint a nonce for a response built from push context `version`.
    pub(crate) fn next_nonce(&self, version: &str) -> String {
        let seq = self.nonce_seq.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{version}-{seq}")
    }

    fn initialize(&self, id: String, proxy: Proxy) -> bool {
        self.init.set(Initialized { id, proxy }).is_ok()
    }
}

/// A registered connection as seen by the server.
#[derive(Debug, Clone)]
pub(crate) struct ConnectionHandle {
    pub(crate) conn: Arc<Connection>,
    pub(crate) push_tx: mpsc::Sender<PushEvent>,
}

impl ConnectionHandle {
    /// Hand a push event to the connection without waiting.
    ///
    /// When the queue is full the event is merged into the overflow slot,
    /// and later events keep merging there until the main actor drained its
    /// queue and took the slot, so events are handled in order. Returns
    /// false if the connection is closing.
    pub(crate) fn deliver(&self, event: PushEvent) -> bool {
        let mut overflow = self.conn.overflow();
        if self.push_tx.is_closed() {
            return false;
        }
        let folded = match overflow.take() {
            Some(pending) => pending.absorb(event),
            None => match self.push_tx.try_send(event) {
                Ok(()) => return true,
                Err(TrySendError::Closed(_)) => return false,
                Err(TrySendError::Full(event)) => Overflow::new(event),
            },
        };
        *overflow = Some(folded);
        drop(overflow);

        self.conn.overflow_ready.notify_one();
        true
    }
}

/// The receive actor of one connection.
pub(crate) struct Receiver<Rq, C, R> {
    pub(crate) server: Arc<ServerInner<C, R>>,
    pub(crate) conn: Arc<Connection>,
    pub(crate) requests: Rq,
    pub(crate) req_tx: mpsc::Sender<DeltaDiscoveryRequest>,
    pub(crate) push_tx: mpsc::Sender<PushEvent>,
}

impl<Rq, C, R> Receiver<Rq, C, R>
where
    Rq: RequestStream,
    C: XdsCodec,
    R: Runtime,
{
    /// Read frames until the stream ends, fails or the connection stops.
    ///
    /// A failure is reported on `err_tx`. Dropping the request sender tells
    /// the main actor no more requests follow.
    pub(crate) async fn run(mut self, err_tx: oneshot::Sender<Error>) {
        let result = self.receive().await;
        let conn = &self.conn;

        match result {
            Ok(()) => {}
            Err(e) if e.is_expected_termination() => {
                tracing::info!(con_id = conn.id(), peer = conn.peer_addr(), "ADS: terminated");
                let _ = err_tx.send(e);
            }
            Err(e) => {
                tracing::error!(
                    con_id = conn.id(),
                    peer = conn.peer_addr(),
                    error = %e,
                    "ADS: terminated with error"
                );
                self.server.status.record_internal_error();
                let _ = err_tx.send(e);
            }
        }

        // Releases a main actor still waiting for initialization.
        if conn.state() < ConnectionState::Active {
            conn.advance(ConnectionState::Closing);
        }
    }

    async fn receive(&mut self) -> Result<()> {
        let mut first = true;
        loop {
            let frame = tokio::select! {
                frame = self.requests.recv() => frame?,
                _ = self.conn.stop_token().cancelled() => return Ok(()),
            };
            let Some(bytes) = frame else {
                tracing::info!(con_id = self.conn.id(), peer = self.conn.peer_addr(), "ADS: terminated");
                return Ok(());
            };
            let request = self.server.codec.decode_request(bytes)?;

            if first {
                first = false;
                self.initialize(&request)?;
            }

            tokio::select! {
                sent = self.req_tx.send(request) => {
                    if sent.is_err() {
                        return Ok(());
                    }
                }
                _ = self.conn.stop_token().cancelled() => return Ok(()),
            }
        }
    }

    fn initialize(&self, request: &DeltaDiscoveryRequest) -> Result<()> {
        self.conn.advance(ConnectionState::Initializing);

        let node = request.node.clone().ok_or(Error::MissingNode)?;
        let proxy_id = node.id().ok_or(Error::MissingNode)?.to_string();

        let seq = self.server.conn_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let id = format!("{proxy_id}-{seq}");
        let proxy = Proxy::new(proxy_id, node, self.conn.identities.clone());
        if !self.conn.initialize(id.clone(), proxy) {
            return Err(Error::Validation("connection initialized twice".into()));
        }

        self.server.connections.insert(
            id.clone(),
            ConnectionHandle {
                conn: Arc::clone(&self.conn),
                push_tx: self.push_tx.clone(),
            },
        );
        self.conn.advance(ConnectionState::Active);

        tracing::info!(
            con_id = %id,
            peer = self.conn.peer_addr(),
            type_url = crate::type_url::short_name(&request.type_url),
            "ADS: new delta connection"
        );
        Ok(())
    }
}
