//! The space manager cell
//!
//! Front-end for the ledger: answers explicit accounting requests, annotates
//! pool-selection traffic passing through it, and consumes transfer
//! lifecycle notifications from the pool topic. Failures on the selection
//! path never block the request; they ride along as a conditional failure
//! for the final recipient to act on.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::cells::{Cell, CellAddress, CellPath, Envelope, Nucleus};
use crate::config::SpaceConfig;
use crate::cost;
use crate::messages::{FailureCode, Message, PoolMessage, SpaceReply, SpaceRequest};

use super::ledger::{now_ms, Ledger, LinkGroupUpdate};
use super::model::{AccessLatency, LinkGroup, RetentionPolicy};
use super::{authz, Result, SpaceError};

pub struct SpaceManager {
    ledger: Arc<Ledger>,
    config: SpaceConfig,
}

/// Additive annotations for a pool-selection request.
struct Annotation {
    token: Option<i64>,
    file_id: Option<i64>,
    link_group: Option<String>,
    latency: Option<AccessLatency>,
    retention: Option<RetentionPolicy>,
}

fn failure_code(err: &SpaceError) -> FailureCode {
    match err {
        SpaceError::Authorization(_) => FailureCode::PermissionDenied,
        SpaceError::NoFreeSpace(_) => FailureCode::NoSpace,
        SpaceError::SpaceExpired(_) | SpaceError::SpaceReleased(_) => FailureCode::InvalidState,
        SpaceError::NotFound(_) => FailureCode::NotFound,
        SpaceError::LedgerConsistency(_) => FailureCode::InvalidArgs,
        SpaceError::Ledger(_) => FailureCode::Internal,
    }
}

impl SpaceManager {
    pub fn new(ledger: Arc<Ledger>, config: SpaceConfig) -> Self {
        SpaceManager { ledger, config }
    }

    /// Freshness floor for link-group telemetry, or None when stale figures
    /// are acceptable.
    fn freshness_cutoff(&self) -> Option<i64> {
        if self.config.require_cost_data {
            Some(now_ms() - 2 * self.config.refresh_period_ms as i64)
        } else {
            None
        }
    }

    /// Pick the link group for a new reservation. A requested name is
    /// verified rather than searched; otherwise the fullest eligible group
    /// the requester is authorized for wins.
    fn select_link_group(
        &self,
        requested: Option<&str>,
        vo_group: &str,
        vo_role: Option<&str>,
        retention: RetentionPolicy,
        latency: AccessLatency,
        size_in_bytes: i64,
    ) -> Result<LinkGroup> {
        let cutoff = self.freshness_cutoff();
        if let Some(name) = requested {
            let group = self
                .ledger
                .get_link_group(name)?
                .ok_or_else(|| SpaceError::NoFreeSpace(format!("no link group named {name}")))?;
            if !group.allows_latency(latency) || !group.allows_retention(retention) {
                return Err(SpaceError::NoFreeSpace(format!(
                    "link group {name} does not admit {latency:?}/{retention:?} reservations"
                )));
            }
            authz::check_placement(&group, vo_group, vo_role)?;
            if let Some(cutoff) = cutoff {
                if group.last_update_time < cutoff {
                    return Err(SpaceError::NoFreeSpace(format!(
                        "link group {name} has no recent telemetry"
                    )));
                }
            }
            if group.available() < size_in_bytes {
                return Err(SpaceError::NoFreeSpace(format!(
                    "link group {name} has {} bytes uncommitted",
                    group.available()
                )));
            }
            return Ok(group);
        }

        let candidates =
            self.ledger
                .find_link_group_candidates(size_in_bytes, latency, retention, cutoff)?;
        if candidates.is_empty() {
            return Err(SpaceError::NoFreeSpace(format!(
                "no link group can hold {size_in_bytes} bytes of {latency:?}/{retention:?}"
            )));
        }
        candidates
            .into_iter()
            .find(|group| group.authorizes(vo_group, vo_role))
            .ok_or_else(|| {
                SpaceError::Authorization(format!(
                    "no fitting link group admits {vo_group}"
                ))
            })
    }

    fn try_handle_space(&self, request: SpaceRequest) -> Result<SpaceReply> {
        match request {
            SpaceRequest::Reserve {
                vo_group,
                vo_role,
                retention_policy,
                access_latency,
                size_in_bytes,
                lifetime_ms,
                description,
                link_group,
            } => {
                let lifetime = lifetime_ms.unwrap_or(self.config.default_lifetime_ms);
                let group = self.select_link_group(
                    link_group.as_deref(),
                    &vo_group,
                    vo_role.as_deref(),
                    retention_policy,
                    access_latency,
                    size_in_bytes,
                )?;
                let token = self.ledger.reserve(
                    group.id,
                    &vo_group,
                    vo_role.as_deref(),
                    retention_policy,
                    access_latency,
                    size_in_bytes,
                    lifetime,
                    description.as_deref(),
                )?;
                info!(token, vo_group, link_group = %group.name, size_in_bytes, "reserved");
                Ok(SpaceReply::Reserved { token })
            }
            SpaceRequest::Release {
                token,
                vo_group,
                vo_role,
            } => {
                let space = self.ledger.get_space(token)?;
                authz::check_owner(&space, vo_group.as_deref(), vo_role.as_deref())?;
                self.ledger.release(token)?;
                Ok(SpaceReply::Released { token })
            }
            SpaceRequest::Use {
                token,
                vo_group,
                vo_role,
                size_in_bytes,
                lifetime_ms,
                path,
                content_id,
            } => {
                let space = self.ledger.get_space(token)?;
                authz::check_owner(&space, Some(&vo_group), vo_role.as_deref())?;
                let file_id = self.ledger.add_file(
                    token,
                    &vo_group,
                    vo_role.as_deref(),
                    size_in_bytes,
                    lifetime_ms,
                    path.as_deref(),
                    content_id.as_deref(),
                )?;
                Ok(SpaceReply::FileAdmitted { file_id })
            }
            SpaceRequest::CancelUse { token, path } => {
                self.ledger.cancel_use(token, &path)?;
                Ok(SpaceReply::UseCancelled { token })
            }
            SpaceRequest::ExtendLifetime { token, lifetime_ms } => {
                let effective = self.ledger.extend_lifetime(token, lifetime_ms)?;
                Ok(SpaceReply::LifetimeExtended {
                    token,
                    lifetime_ms: effective,
                })
            }
            SpaceRequest::GetSpaceTokens {
                vo_group,
                description,
            } => Ok(SpaceReply::Tokens {
                tokens: self
                    .ledger
                    .get_space_tokens(vo_group.as_deref(), description.as_deref())?,
            }),
            SpaceRequest::GetSpaceMetaData { tokens } => Ok(SpaceReply::MetaData {
                spaces: self.ledger.get_space_metadata(&tokens)?,
            }),
            SpaceRequest::GetLinkGroups => Ok(SpaceReply::LinkGroups {
                groups: self.ledger.get_link_groups()?,
            }),
            SpaceRequest::GetLinkGroupNames => Ok(SpaceReply::LinkGroupNames {
                names: self.ledger.get_link_group_names()?,
            }),
            SpaceRequest::GetFileSpaceTokens { path } => Ok(SpaceReply::FileTokens {
                tokens: self.ledger.get_file_space_tokens(&path)?,
            }),
        }
    }

    fn handle_space(&self, request: SpaceRequest) -> SpaceReply {
        match self.try_handle_space(request) {
            Ok(reply) => reply,
            Err(err) => {
                debug!(%err, "space request failed");
                SpaceReply::Failed {
                    code: failure_code(&err),
                    reason: err.to_string(),
                }
            }
        }
    }

    /// Work out the accounting for a write heading to pool selection.
    /// Precedence: a record the door prepared for this path, then the
    /// caller's token, then (optionally) an implicit placement.
    fn annotate(
        &self,
        path: &str,
        content_id: Option<&str>,
        preallocated: i64,
        vo_group: Option<&str>,
        vo_role: Option<&str>,
        default_token: Option<i64>,
    ) -> Result<Option<Annotation>> {
        if let Some(file) = self.ledger.find_pending_file_by_path(path)? {
            let space = self.ledger.get_space(file.space_id)?;
            self.ledger.check_space_usable(space.id, 0)?;
            return Ok(Some(Annotation {
                token: Some(space.id),
                file_id: Some(file.id),
                link_group: self.ledger.link_group_name(space.link_group_id)?,
                latency: Some(space.access_latency),
                retention: Some(space.retention_policy),
            }));
        }
        if let Some(token) = default_token {
            let space = self.ledger.get_space(token)?;
            authz::check_owner(&space, vo_group, vo_role)?;
            self.ledger.check_space_usable(token, preallocated)?;
            let file_id = self.ledger.add_file(
                token,
                vo_group.unwrap_or(&space.vo_group),
                vo_role,
                preallocated,
                self.config.implicit_lifetime_ms,
                Some(path),
                content_id,
            )?;
            return Ok(Some(Annotation {
                token: Some(token),
                file_id: Some(file_id),
                link_group: self.ledger.link_group_name(space.link_group_id)?,
                latency: Some(space.access_latency),
                retention: Some(space.retention_policy),
            }));
        }
        if self.config.reserve_for_unsolicited_writes {
            if let Some(vo_group) = vo_group {
                let group = self.select_link_group(
                    None,
                    vo_group,
                    vo_role,
                    self.config.default_retention_policy,
                    self.config.default_access_latency,
                    preallocated,
                )?;
                return Ok(Some(Annotation {
                    token: None,
                    file_id: None,
                    link_group: Some(group.name),
                    latency: Some(self.config.default_access_latency),
                    retention: Some(self.config.default_retention_policy),
                }));
            }
        }
        Ok(None)
    }

    fn annotate_and_forward(&self, nucleus: &Nucleus, mut envelope: Envelope) {
        let Message::Pool(PoolMessage::SelectWritePool {
            ref path,
            ref content_id,
            preallocated,
            ref vo_group,
            ref vo_role,
            default_token,
            ref mut access_latency,
            ref mut retention_policy,
            ref mut link_group,
            ref mut space_token,
            ref mut file_id,
            ref mut failure,
        }) = envelope.payload
        else {
            return;
        };

        match self.annotate(
            path,
            content_id.as_deref(),
            preallocated,
            vo_group.as_deref(),
            vo_role.as_deref(),
            default_token,
        ) {
            Ok(Some(annotation)) => {
                *space_token = annotation.token;
                *file_id = annotation.file_id;
                *link_group = annotation.link_group;
                if access_latency.is_none() {
                    *access_latency = annotation.latency;
                }
                if retention_policy.is_none() {
                    *retention_policy = annotation.retention;
                }
            }
            Ok(None) => {}
            Err(err) => {
                debug!(path, %err, "selection accounting failed, attaching failure");
                *failure = Some((failure_code(&err), err.to_string()));
            }
        }

        if let Err(err) = nucleus.send_onward(envelope) {
            warn!(%err, "could not forward annotated selection");
        }
    }

    fn handle_notification(&self, notification: PoolMessage) {
        let result = match notification {
            PoolMessage::TransferStarting {
                content_id,
                file_id,
                default_token,
                vo_group,
                vo_role,
                preallocated,
                ..
            } => {
                if let Some(file_id) = file_id {
                    self.ledger.bind_content_id(file_id, &content_id)
                } else if let Some(token) = default_token {
                    self.ledger.get_space(token).and_then(|space| {
                        self.ledger.add_file(
                            token,
                            vo_group.as_deref().unwrap_or(&space.vo_group),
                            vo_role.as_deref(),
                            preallocated,
                            self.config.implicit_lifetime_ms,
                            None,
                            Some(&content_id),
                        )
                    }).map(|_| ())
                } else {
                    Ok(())
                }
            }
            PoolMessage::TransferStarted {
                content_id,
                success,
            } => self.ledger.transfer_started(&content_id, success),
            PoolMessage::TransferFinished {
                content_id,
                final_size,
                success,
            } => self.ledger.transfer_finished(&content_id, final_size, success),
            PoolMessage::FileFlushed { content_id } => self.ledger.file_flushed(&content_id),
            PoolMessage::FileRemoved { content_id } => self.ledger.file_removed(&content_id),
            PoolMessage::SelectWritePool { .. } => Ok(()),
        };
        if let Err(err) = result {
            warn!(%err, "transfer notification not applied");
        }
    }
}

#[async_trait]
impl Cell for SpaceManager {
    async fn message_arrived(&mut self, nucleus: &Nucleus, envelope: Envelope) {
        match envelope.payload.clone() {
            Message::Ping => {
                let _ = nucleus.send(envelope.into_reply(Message::Pong));
            }
            Message::Space(request) => {
                let reply = self.handle_space(request);
                if let Err(err) = nucleus.send(envelope.into_reply(Message::SpaceReply(reply))) {
                    warn!(%err, "could not deliver space reply");
                }
            }
            Message::Pool(PoolMessage::SelectWritePool { .. }) => {
                self.annotate_and_forward(nucleus, envelope);
            }
            Message::Pool(notification) => self.handle_notification(notification),
            other => debug!(?other, "unexpected message for space manager"),
        }
    }
}

/// Seed configured link groups so selection works before (or without) a
/// telemetry provider. Never touches reserved space.
pub fn seed_link_groups(ledger: &Ledger, config: &SpaceConfig) -> Result<()> {
    for group in &config.link_groups {
        ledger.update_link_group(
            &LinkGroupUpdate {
                name: group.name.clone(),
                free_space: group.free_space,
                online_allowed: group.online_allowed,
                nearline_allowed: group.nearline_allowed,
                replica_allowed: group.replica_allowed,
                output_allowed: group.output_allowed,
                custodial_allowed: group.custodial_allowed,
                authorized: group.authorized.iter().map(|vo| vo.to_vo_info()).collect(),
            },
            now_ms(),
        )?;
        info!(link_group = %group.name, "link group seeded");
    }
    Ok(())
}

/// Periodically expire reservations and stale file pledges.
pub fn spawn_sweeper(ledger: Arc<Ledger>, period: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let now = now_ms();
            match ledger.expire_files(now) {
                Ok(0) => {}
                Ok(n) => info!(count = n, "expired file pledges"),
                Err(err) => warn!(%err, "file expiry sweep failed"),
            }
            match ledger.expire_spaces(now) {
                Ok(0) => {}
                Ok(n) => info!(count = n, "expired reservations"),
                Err(err) => warn!(%err, "reservation expiry sweep failed"),
            }
        }
    })
}

/// Periodically pull the cost table from the configured provider and refresh
/// each link group's free space from the pools backing it. Pools below their
/// gap threshold contribute nothing.
pub fn spawn_refresher(
    nucleus: Nucleus,
    ledger: Arc<Ledger>,
    config: SpaceConfig,
) -> Option<tokio::task::JoinHandle<()>> {
    let provider = config.cost_table_provider.clone()?;
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(config.refresh_period_ms));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let envelope = Envelope::new(
                CellAddress::new("SpaceManager", nucleus.domain()),
                CellPath::parse(&provider),
                Message::CostTableRequest,
            );
            let reply = nucleus
                .send_and_wait(envelope, Duration::from_secs(30))
                .await;
            let table = match reply {
                Ok(reply) => match reply.payload {
                    Message::CostTable(table) => table,
                    other => {
                        warn!(?other, "cost-table provider sent an unexpected payload");
                        continue;
                    }
                },
                Err(err) => {
                    warn!(%err, "cost-table refresh failed");
                    continue;
                }
            };

            let now = now_ms();
            for group in &config.link_groups {
                let free: i64 = table
                    .iter()
                    .filter(|pool| group.pools.contains(&pool.name))
                    .filter(|pool| cost::usable_for_write(&pool.space))
                    .map(|pool| pool.space.free)
                    .sum();
                let update = LinkGroupUpdate {
                    name: group.name.clone(),
                    free_space: free,
                    online_allowed: group.online_allowed,
                    nearline_allowed: group.nearline_allowed,
                    replica_allowed: group.replica_allowed,
                    output_allowed: group.output_allowed,
                    custodial_allowed: group.custodial_allowed,
                    authorized: group.authorized.iter().map(|vo| vo.to_vo_info()).collect(),
                };
                if let Err(err) = ledger.update_link_group(&update, now) {
                    warn!(link_group = %group.name, %err, "link group refresh failed");
                } else {
                    debug!(link_group = %group.name, free, "link group refreshed");
                }
            }
        }
    });
    Some(handle)
}
