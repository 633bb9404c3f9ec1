//! Flow-controlled push scheduling and response construction.

use std::borrow::Cow;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::codec::XdsCodec;
use crate::error::{Error, Result};
use crate::generator::DeltaGeneration;
use crate::message::{DeltaDiscoveryResponse, Resource};
use crate::runtime::Runtime;
use crate::server::Driver;
use crate::server::push::PushRequest;
use crate::server::watched::{WatchTable, WatchedResource};
use crate::transport::ResponseSink;
use crate::type_url;

/// What to do with a push for one watched type.
#[derive(Debug)]
pub(super) enum Schedule {
    /// Send now.
    Send(PushRequest),
    /// Send now although the previous response was never answered.
    SendAfterTimeout(PushRequest),
    /// Merged into the blocked push for the type.
    Deferred,
}

/// Decide whether `request` may be sent for `type_url` now.
///
/// A push that goes out absorbs the push blocked for the type, if any.
pub(super) fn schedule(
    table: &mut WatchTable,
    type_url: &str,
    request: &PushRequest,
    flow_control_timeout: Option<Duration>,
    now: Instant,
) -> Schedule {
    let merged = |table: &mut WatchTable| match table.take_blocked(type_url) {
        Some(blocked) => blocked.merge(request.clone()),
        None => request.clone(),
    };

    let Some(timeout) = flow_control_timeout else {
        return Schedule::Send(merged(table));
    };
    let Some(watched) = table.get(type_url) else {
        return Schedule::Send(merged(table));
    };

    if watched.is_synced() {
        Schedule::Send(merged(table))
    } else if watched.is_timed_out(now, timeout) {
        Schedule::SendAfterTimeout(merged(table))
    } else {
        table.block(type_url, request.clone());
        Schedule::Deferred
    }
}

/// Names the client must drop: everything it watched that was not generated.
fn inferred_removals(watched: &WatchedResource, resources: &[Resource]) -> Vec<String> {
    let mut removed = watched.resource_names.clone();
    for resource in resources {
        removed.remove(&resource.name);
    }
    removed.into_iter().collect()
}

impl<Rs, C, R> Driver<Rs, C, R>
where
    Rs: ResponseSink,
    C: XdsCodec,
    R: Runtime,
{
    /// Handle a push event for every type the connection watches.
    pub(super) async fn push_connection(&mut self, request: PushRequest) -> Result<()> {
        let config = &self.server.config;
        let timeout = config
            .enable_flow_control
            .then_some(config.flow_control_timeout);

        let watched = self.conn.table().watched();
        for watched in watched {
            let short = type_url::short_name(&watched.type_url);
            let scheduled = schedule(
                &mut self.conn.table(),
                &watched.type_url,
                &request,
                timeout,
                Instant::now(),
            );

            match scheduled {
                Schedule::Send(push) => self.push_delta(&watched, &push, None).await?,
                Schedule::SendAfterTimeout(push) => {
                    tracing::warn!(
                        con_id = self.conn.id(),
                        type_url = short,
                        nonce = %watched.nonce_sent,
                        "ADS: QUEUE TIMEOUT, proceeding with push"
                    );
                    self.server.status.record_delayed_push(&watched.type_url);
                    self.push_delta(&watched, &push, None).await?;
                }
                Schedule::Deferred => {
                    tracing::debug!(
                        con_id = self.conn.id(),
                        type_url = short,
                        nonce = %watched.nonce_sent,
                        "ADS: QUEUE"
                    );
                    self.server.status.record_delayed_push(&watched.type_url);
                }
            }
        }

        self.server.status.record_convergence(request.start.elapsed());
        Ok(())
    }

    /// Generate and send one response for a watched type.
    ///
    /// With `subscribe`, the generator only sees the named resources.
    pub(super) async fn push_delta(
        &mut self,
        watched: &WatchedResource,
        request: &PushRequest,
        subscribe: Option<&[String]>,
    ) -> Result<()> {
        let type_url = watched.type_url.as_str();
        let short = type_url::short_name(type_url);
        let conn = Arc::clone(&self.conn);

        let Some(generator) = self.server.generators.find(type_url).cloned() else {
            tracing::debug!(con_id = conn.id(), type_url = short, "ADS: no generator");
            return Ok(());
        };
        let Some(proxy) = conn.proxy() else {
            return Ok(());
        };

        let target: Cow<'_, WatchedResource> = match subscribe {
            Some(names) => Cow::Owned(WatchedResource {
                resource_names: names.iter().cloned().collect(),
                ..watched.clone()
            }),
            None => Cow::Borrowed(watched),
        };

        let started = Instant::now();
        let generated = match generator.generate_deltas(proxy, &request.push, request, &target) {
            Ok(generated) => generated,
            Err(e) => {
                tracing::warn!(con_id = conn.id(), type_url = short, error = %e, "ADS: generator failed");
                self.server
                    .status
                    .register_event(conn.id(), type_url, request.push.version());
                return Err(e);
            }
        };
        if generated.is_empty() {
            // Nothing to send counts as acknowledged.
            self.server
                .status
                .register_event(conn.id(), type_url, request.push.version());
            return Ok(());
        }

        let DeltaGeneration {
            resources,
            removed,
            log,
            used_delta,
        } = generated;
        let resources = resources.unwrap_or_default();
        let removed_resources = if used_delta {
            removed.unwrap_or_default()
        } else if request.full {
            inferred_removals(&target, &resources)
        } else {
            Vec::new()
        };

        let response = DeltaDiscoveryResponse {
            system_version_info: request.push.version().to_string(),
            type_url: type_url.to_string(),
            nonce: conn.next_nonce(request.push.version()),
            resources,
            removed_resources,
            control_plane: self.server.config.control_plane_id.clone(),
        };
        let size = response.payload_size();
        self.send_delta(&response).await?;

        // An incremental full-state generation only covers what changed.
        if subscribe.is_none()
            && (used_delta || request.full)
            && self.server.config.is_wildcard(type_url)
        {
            let mut names: BTreeSet<String> = if used_delta {
                target.resource_names.clone()
            } else {
                BTreeSet::new()
            };
            names.extend(response.resources.iter().map(|r| r.name.clone()));
            for name in &response.removed_resources {
                names.remove(name);
            }
            conn.table().set_resource_names(type_url, names);
        }

        self.server.status.record_push(type_url, started.elapsed(), size);

        let info = if log.additional_info.is_empty() {
            String::new()
        } else {
            format!(" {}", log.additional_info)
        };
        if request.full {
            tracing::info!(
                con_id = conn.id(),
                type_url = short,
                resources = response.resources.len(),
                removed = response.removed_resources.len(),
                size,
                nonce = %response.nonce,
                incremental = log.incremental,
                "ADS: PUSH{}{}",
                request.push_reason(),
                info
            );
        } else {
            tracing::debug!(
                con_id = conn.id(),
                type_url = short,
                resources = response.resources.len(),
                removed = response.removed_resources.len(),
                size,
                nonce = %response.nonce,
                "ADS: PUSH INC{}{}",
                request.push_reason(),
                info
            );
        }
        Ok(())
    }

    /// Write a response, recording it as sent for its type.
    ///
    /// Failing to write, or exceeding the send timeout, is fatal for the
    /// connection.
    async fn send_delta(&mut self, response: &DeltaDiscoveryResponse) -> Result<()> {
        let bytes = self.server.codec.encode_response(response)?;

        let sent = match self.server.config.send_timeout {
            Some(timeout) => {
                tokio::select! {
                    sent = self.responses.send(bytes) => sent,
                    _ = self.server.runtime.sleep(timeout) => Err(Error::SendTimeout(timeout)),
                }
            }
            None => self.responses.send(bytes).await,
        };

        match sent {
            Ok(()) => {
                if !response.nonce.is_empty() && !type_url::is_debug(&response.type_url) {
                    self.conn.table().record_sent(
                        &response.type_url,
                        &response.nonce,
                        &response.system_version_info,
                        Instant::now(),
                    );
                }
                Ok(())
            }
            Err(e) => {
                tracing::warn!(
                    con_id = self.conn.id(),
                    type_url = type_url::short_name(&response.type_url),
                    error = %e,
                    "ADS: send failure, closing connection"
                );
                self.server.status.record_send_error(&response.type_url);
                Err(e)
            }
        }
    }
}
