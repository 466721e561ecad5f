//! Pushing config changes to the swarm.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::object::{ConfigKind, PushData};
use super::ConfigSet;
use crate::error::SwarmResult;
use crate::rpc::{RequestAuth, SnodeApi, SnodeMessage};

/// What one [`ConfigSyncJob::run`] did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub pushed: usize,
    pub deleted: usize,
    pub failed: usize,
}

/// Pushes every config that needs it, confirms the stored hash, persists
/// dumps and deletes superseded messages.
pub struct ConfigSyncJob {
    api: Arc<SnodeApi>,
}

impl ConfigSyncJob {
    pub fn new(api: Arc<SnodeApi>) -> Self {
        Self { api }
    }

    /// One sync pass over `configs`. The lock is never held across a
    /// network call; edits made meanwhile are picked up by the next pass.
    pub async fn run<C: ConfigSet>(
        &self,
        configs: &Mutex<C>,
        auth: RequestAuth<'_>,
    ) -> SwarmResult<SyncReport> {
        let ctx = self.api.context();
        let (account, pushes) = {
            let mut guard = configs.lock();
            let account = guard.account().clone();
            let mut pushes: Vec<(ConfigKind, PushData)> = Vec::new();
            for object in guard.objects_mut() {
                if object.needs_push() && object.has_keys() {
                    pushes.push((object.kind(), object.push()?));
                }
            }
            guard.persist(ctx.store.as_ref())?;
            (account, pushes)
        };

        let mut report = SyncReport::default();
        let mut obsolete: Vec<(ConfigKind, Vec<String>)> = Vec::new();
        for (kind, push) in pushes {
            let message = SnodeMessage {
                recipient: account.clone(),
                data: STANDARD.encode(&push.ciphertext),
                ttl_ms: ctx.config.message_ttl_ms,
                timestamp: ctx.clock.now(),
            };
            match self.api.send_message(&message, kind.namespace(), auth).await {
                Ok(stored) => {
                    debug!(?kind, seqno = push.seqno, hash = %stored.hash, "Config pushed");
                    let mut guard = configs.lock();
                    if let Some(object) = guard.object_mut(kind) {
                        object.confirm_pushed(push.seqno, &stored.hash);
                    }
                    guard.persist(ctx.store.as_ref())?;
                    report.pushed += 1;
                    if !push.obsolete_hashes.is_empty() {
                        obsolete.push((kind, push.obsolete_hashes));
                    }
                }
                Err(e) => {
                    warn!(?kind, error = %e, "Config push failed, will retry");
                    report.failed += 1;
                }
            }
        }

        for (kind, hashes) in obsolete {
            match self.api.delete_messages(&account, &hashes, auth).await {
                Ok(results) => {
                    let unverified: Vec<&String> = results
                        .iter()
                        .filter(|(_, deleted)| !**deleted)
                        .map(|(node, _)| node)
                        .collect();
                    if unverified.len() == results.len() {
                        warn!(?kind, nodes = results.len(), "No node confirmed deleting obsolete config messages");
                        continue;
                    }
                    if !unverified.is_empty() {
                        debug!(?kind, ?unverified, "Some nodes did not confirm the deletion");
                    }
                    let mut guard = configs.lock();
                    if let Some(object) = guard.object_mut(kind) {
                        object.forget_hashes(&hashes);
                    }
                    guard.persist(ctx.store.as_ref())?;
                    report.deleted += hashes.len();
                }
                Err(e) => warn!(?kind, error = %e, "Could not delete obsolete config messages"),
            }
        }

        if report.pushed > 0 || report.failed > 0 {
            info!(
                account = %account.short(),
                pushed = report.pushed,
                deleted = report.deleted,
                failed = report.failed,
                "Config sync finished"
            );
        }
        Ok(report)
    }
}
