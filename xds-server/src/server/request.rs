//! Request processing: subscription updates, ACK/NACK tracking and deciding
//! whether a request is owed a response.

use std::collections::BTreeSet;

use crate::codec::XdsCodec;
use crate::error::Result;
use crate::message::DeltaDiscoveryRequest;
use crate::runtime::Runtime;
use crate::server::Driver;
use crate::server::push::{PushRequest, TriggerReason};
use crate::server::watched::{WatchTable, WatchedResource, apply_delta};
use crate::transport::ResponseSink;
use crate::type_url;

/// How a request relates to what was previously sent for its type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum Disposition {
    /// The client rejected the response carrying the echoed nonce.
    Nack,
    /// First request for the type on this connection.
    Initial,
    /// The echoed nonce is not the last one sent.
    ExpiredNonce { sent: String },
    /// The echoed nonce is the last one sent.
    Ack { changed: bool },
    /// No nonce echoed on an already watched type.
    Spontaneous { changed: bool },
}

impl Disposition {
    /// Whether the request is owed a freshly generated response.
    pub(super) fn should_respond(&self) -> bool {
        match self {
            Disposition::Initial => true,
            Disposition::Ack { changed } | Disposition::Spontaneous { changed } => *changed,
            Disposition::Nack | Disposition::ExpiredNonce { .. } => false,
        }
    }

    /// Whether a push deferred for this type may go out now.
    fn releases_blocked(&self) -> bool {
        self.should_respond()
            || matches!(self, Disposition::Nack | Disposition::Ack { changed: false })
    }

    /// An unchanged subscription should come with an echoed nonce and a
    /// changed one without.
    fn is_ack_mismatch(&self) -> bool {
        match self {
            Disposition::Ack { changed } => *changed,
            Disposition::Spontaneous { changed } => !*changed,
            _ => false,
        }
    }
}

/// Apply a request to the watch table and classify it.
pub(super) fn classify(table: &mut WatchTable, request: &DeltaDiscoveryRequest) -> Disposition {
    let type_url = request.type_url.as_str();
    let nonce = request.response_nonce.as_str();

    if request.error_detail.is_some() {
        if let Some(watched) = table.get_mut(type_url) {
            watched.nonce_nacked = nonce.to_string();
        }
        return Disposition::Nack;
    }

    let Some(watched) = table.get_mut(type_url) else {
        let names = apply_delta(
            &BTreeSet::new(),
            &request.resource_names_subscribe,
            &request.resource_names_unsubscribe,
        );
        table.insert(WatchedResource::new(type_url, names));
        return Disposition::Initial;
    };

    if !nonce.is_empty() && nonce != watched.nonce_sent {
        watched.nonce_nacked.clear();
        return Disposition::ExpiredNonce {
            sent: watched.nonce_sent.clone(),
        };
    }

    let names = watched.subscription_after(
        &request.resource_names_subscribe,
        &request.resource_names_unsubscribe,
    );
    let changed = names != watched.resource_names;
    watched.resource_names = names;

    if nonce.is_empty() {
        Disposition::Spontaneous { changed }
    } else {
        watched.nonce_acked = nonce.to_string();
        watched.nonce_nacked.clear();
        Disposition::Ack { changed }
    }
}

impl<Rs, C, R> Driver<Rs, C, R>
where
    Rs: ResponseSink,
    C: XdsCodec,
    R: Runtime,
{
    /// Handle one request from the client.
    pub(super) async fn process_request(&mut self, request: DeltaDiscoveryRequest) -> Result<()> {
        let short = type_url::short_name(&request.type_url);

        if type_url::is_debug(&request.type_url) {
            let names = request.resource_names_subscribe.iter().cloned().collect();
            let watched = WatchedResource::new(request.type_url.as_str(), names);
            let push = PushRequest::full(
                self.server.push_context.load_full(),
                TriggerReason::ProxyRequest,
            );
            return self.push_delta(&watched, &push, None).await;
        }

        self.server
            .status
            .register_event(self.conn.id(), &request.type_url, &request.response_nonce);

        let disposition = classify(&mut self.conn.table(), &request);

        match &disposition {
            Disposition::Nack => {
                let (code, message) = request
                    .error_detail
                    .as_ref()
                    .map(|e| (e.code, e.message.as_str()))
                    .unwrap_or_default();
                tracing::warn!(
                    con_id = self.conn.id(),
                    type_url = short,
                    nonce = %request.response_nonce,
                    code,
                    error = message,
                    "ADS: ACK ERROR"
                );
                self.server.status.record_reject(&request.type_url, code);
            }
            Disposition::Initial => {
                tracing::debug!(
                    con_id = self.conn.id(),
                    type_url = short,
                    subscribe = ?request.resource_names_subscribe,
                    "ADS: INIT"
                );
            }
            Disposition::ExpiredNonce { sent } => {
                tracing::debug!(
                    con_id = self.conn.id(),
                    type_url = short,
                    nonce = %request.response_nonce,
                    sent = %sent,
                    "ADS: REQ expired nonce"
                );
                self.server.status.record_expired_nonce(&request.type_url);
                return Ok(());
            }
            Disposition::Ack { changed } | Disposition::Spontaneous { changed } => {
                tracing::debug!(
                    con_id = self.conn.id(),
                    type_url = short,
                    nonce = %request.response_nonce,
                    changed,
                    "ADS: ACK"
                );
            }
        }

        if disposition.is_ack_mismatch() {
            tracing::warn!(
                con_id = self.conn.id(),
                type_url = short,
                nonce = %request.response_nonce,
                subscribe = ?request.resource_names_subscribe,
                unsubscribe = ?request.resource_names_unsubscribe,
                "ADS: unexpected ACK, subscription change and nonce disagree"
            );
            self.server.status.record_ack_mismatch(&request.type_url);
            if self.server.config.unsafe_assertions {
                panic!(
                    "ADS:{short}: ACK mismatch for nonce {:?} on {}",
                    request.response_nonce,
                    self.conn.id()
                );
            }
        }

        let blocked = if disposition.releases_blocked() {
            self.conn.table().take_blocked(&request.type_url)
        } else {
            None
        };

        let released = blocked.is_some();
        let push = if disposition.should_respond() {
            let fresh = PushRequest::full(
                self.server.push_context.load_full(),
                TriggerReason::ProxyRequest,
            );
            match blocked {
                Some(blocked) => blocked.merge(fresh),
                None => fresh,
            }
        } else if let Some(mut blocked) = blocked {
            tracing::debug!(con_id = self.conn.id(), type_url = short, "ADS: DEQUEUE");
            blocked.reasons.insert(TriggerReason::ProxyRequest);
            blocked
        } else {
            return Ok(());
        };

        let watched = self.conn.table().get(&request.type_url).cloned();
        let Some(watched) = watched else {
            return Ok(());
        };
        // A released push covers names subscribed before this request too.
        let subscribe = (!released && !request.resource_names_subscribe.is_empty())
            .then_some(request.resource_names_subscribe.as_slice());
        self.push_delta(&watched, &push, subscribe).await
    }
}
