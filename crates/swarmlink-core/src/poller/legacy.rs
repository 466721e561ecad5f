//! Legacy closed group poller.
//!
//! Quiet groups are polled less often: the interval grows linearly from the
//! minimum to the maximum as the time since the last message approaches the
//! limit, then stays at the maximum.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{CycleOutcome, NodeSelector, Poller, StateReporter};
use crate::config::PollConfig;
use crate::error::SwarmResult;
use crate::events::NetworkEvent;
use crate::identity::Identity;
use crate::receive::{BatchSink, DirectOpener, ReceivePipeline};
use crate::rpc::{RequestAuth, SnodeApi};
use crate::storage::{settings, SwarmStoreExt};
use crate::types::{now_ms, Namespace};

/// Interval for a legacy group whose last message arrived `since_last_ms`
/// ago. Unknown activity counts as the configured default.
pub fn legacy_interval(poll: &PollConfig, since_last_ms: Option<u64>) -> Duration {
    let min = poll.legacy_min_interval_ms as f64;
    let max = poll.legacy_max_interval_ms as f64;
    let limit = poll.legacy_limit_ms.max(1) as f64;
    let since = since_last_ms.unwrap_or(poll.legacy_default_since_ms) as f64;
    let slope = (max - min) / limit;
    let next = slope * since.min(limit) + min;
    Duration::from_millis(next.round() as u64)
}

/// Polls a legacy group's swarm. The group holds a shared keypair, so
/// messages open like one-to-one messages addressed to the group.
pub struct LegacyGroupPoller {
    api: Arc<SnodeApi>,
    pipeline: ReceivePipeline,
    sink: Arc<dyn BatchSink>,
    group: Arc<Identity>,
    selector: NodeSelector,
}

impl LegacyGroupPoller {
    pub fn new(api: Arc<SnodeApi>, sink: Arc<dyn BatchSink>, group: Arc<Identity>) -> Self {
        let ctx = api.context();
        Self {
            pipeline: ReceivePipeline::new(ctx.store.clone(), ctx.config.batch_size),
            selector: NodeSelector::new(group.account_id()),
            api,
            sink,
            group,
        }
    }

    fn activity_key(&self) -> String {
        settings::last_message_at(&self.selector.account().to_hex())
    }
}

#[async_trait]
impl Poller for LegacyGroupPoller {
    fn key(&self) -> String {
        format!("legacy:{}", self.selector.account().to_hex())
    }

    async fn poll_cycle(&mut self, status: &StateReporter) -> SwarmResult<CycleOutcome> {
        let ctx = self.api.context().clone();
        let account = self.group.account_id();
        let node = status.network(self.selector.node(&self.api, status)).await??;

        let namespaces = [Namespace::UNAUTHENTICATED_CLOSED_GROUP, Namespace::DEFAULT];
        let mut requests = Vec::with_capacity(namespaces.len());
        for namespace in namespaces {
            requests.push((namespace, ctx.store.last_hash(&node, &account, namespace)?));
        }
        let results = status
            .network(self.api.retrieve_many(&node, &account, &requests, RequestAuth::None))
            .await?;

        let mut first_error = None;
        let mut received = 0;
        for (namespace, result) in results {
            let raw = match result {
                Ok(raw) => raw,
                Err(e) => {
                    first_error.get_or_insert(e);
                    continue;
                }
            };
            let envelopes =
                self.pipeline
                    .ingest(&raw, &node, &account, namespace, &DirectOpener(&self.group))?;
            if envelopes.is_empty() {
                continue;
            }
            let count = self
                .pipeline
                .deliver(self.sink.as_ref(), &account, namespace, envelopes)
                .await?;
            received += count;
            ctx.emit(NetworkEvent::MessagesReceived {
                account: account.clone(),
                namespace,
                count,
            });
        }

        if received > 0 {
            ctx.store.save_json(&self.activity_key(), &now_ms())?;
        }

        match first_error {
            Some(e) => {
                self.selector.fail(&self.api, &e);
                Err(e)
            }
            None => Ok(CycleOutcome::Continue { received }),
        }
    }

    fn next_delay(&mut self, _result: &SwarmResult<CycleOutcome>) -> Duration {
        let ctx = self.api.context();
        let since = ctx
            .store
            .load_json::<u64>(&self.activity_key())
            .ok()
            .flatten()
            .map(|at| now_ms().saturating_sub(at));
        legacy_interval(&ctx.config.poll, since)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_bounds() {
        let poll = PollConfig::default();
        assert_eq!(legacy_interval(&poll, Some(0)), Duration::from_secs(4));
        assert_eq!(
            legacy_interval(&poll, Some(poll.legacy_limit_ms)),
            Duration::from_secs(240)
        );
        assert_eq!(
            legacy_interval(&poll, Some(poll.legacy_limit_ms * 3)),
            Duration::from_secs(240)
        );
    }

    #[test]
    fn test_interval_grows_with_silence() {
        let poll = PollConfig::default();
        let hour = 60 * 60 * 1000;
        let one = legacy_interval(&poll, Some(hour));
        let six = legacy_interval(&poll, Some(6 * hour));
        assert!(one < six);
        // Halfway to the limit lands halfway between the bounds.
        assert_eq!(six, Duration::from_secs(122));
    }

    #[test]
    fn test_interval_unknown_uses_default() {
        let poll = PollConfig::default();
        assert_eq!(
            legacy_interval(&poll, None),
            legacy_interval(&poll, Some(poll.legacy_default_since_ms))
        );
    }
}
