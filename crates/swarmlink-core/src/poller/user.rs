//! One-to-one poller: the user's own swarm.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{CycleOutcome, NodeSelector, Poller, StateReporter};
use crate::config_sync::{config_messages, ConfigSet, UserConfigs};
use crate::error::SwarmResult;
use crate::events::NetworkEvent;
use crate::receive::{BatchSink, DirectOpener, ReceivePipeline};
use crate::rpc::{RequestAuth, SnodeApi};
use crate::types::Namespace;

/// Polls the default namespace and the user config namespaces.
pub struct UserPoller {
    api: Arc<SnodeApi>,
    pipeline: ReceivePipeline,
    sink: Arc<dyn BatchSink>,
    configs: Arc<Mutex<UserConfigs>>,
    selector: NodeSelector,
    interval: Duration,
}

impl UserPoller {
    pub fn new(
        api: Arc<SnodeApi>,
        sink: Arc<dyn BatchSink>,
        configs: Arc<Mutex<UserConfigs>>,
    ) -> SwarmResult<Self> {
        let ctx = api.context().clone();
        let account = ctx.identity()?.account_id();
        Ok(Self {
            pipeline: ReceivePipeline::new(ctx.store.clone(), ctx.config.batch_size),
            interval: ctx.config.poll.user_interval(),
            selector: NodeSelector::new(account),
            api,
            sink,
            configs,
        })
    }
}

#[async_trait]
impl Poller for UserPoller {
    fn key(&self) -> String {
        format!("user:{}", self.selector.account().to_hex())
    }

    async fn poll_cycle(&mut self, status: &StateReporter) -> SwarmResult<CycleOutcome> {
        let ctx = self.api.context().clone();
        let identity = ctx.identity()?.clone();
        let account = identity.account_id();
        let node = status.network(self.selector.node(&self.api, status)).await??;

        let mut namespaces = Namespace::USER_CONFIGS.to_vec();
        namespaces.push(Namespace::DEFAULT);
        let mut requests = Vec::with_capacity(namespaces.len());
        for namespace in namespaces {
            requests.push((namespace, ctx.store.last_hash(&node, &account, namespace)?));
        }

        let results = status
            .network(self.api.retrieve_many(&node, &account, &requests, RequestAuth::Owner(&identity)))
            .await?;

        let mut first_error = None;
        let mut messages = None;
        {
            let mut configs = self.configs.lock();
            for (namespace, result) in results {
                let raw = match result {
                    Ok(raw) => raw,
                    Err(e) => {
                        first_error.get_or_insert(e);
                        continue;
                    }
                };
                if namespace == Namespace::DEFAULT {
                    messages = Some(raw);
                    continue;
                }
                self.pipeline.advance_cursor(&raw, &node, &account, namespace)?;
                let accepted = configs.merge(namespace, &config_messages(&raw));
                if accepted > 0 {
                    debug!(%namespace, accepted, "Merged user config");
                }
            }
            if let Err(e) = configs.persist(ctx.store.as_ref()) {
                warn!(error = %e, "Could not persist user configs");
            }
        }

        let mut received = 0;
        if let Some(raw) = messages {
            let envelopes = self.pipeline.ingest(
                &raw,
                &node,
                &account,
                Namespace::DEFAULT,
                &DirectOpener(&identity),
            )?;
            received = envelopes.len();
            if received > 0 {
                self.pipeline
                    .deliver(self.sink.as_ref(), &account, Namespace::DEFAULT, envelopes)
                    .await?;
                ctx.emit(NetworkEvent::MessagesReceived {
                    account: account.clone(),
                    namespace: Namespace::DEFAULT,
                    count: received,
                });
            }
        }

        match first_error {
            Some(e) => {
                self.selector.fail(&self.api, &e);
                Err(e)
            }
            None => Ok(CycleOutcome::Continue { received }),
        }
    }

    fn next_delay(&mut self, result: &SwarmResult<CycleOutcome>) -> Duration {
        let poll = &self.api.context().config.poll;
        self.interval = match result {
            Ok(_) => poll.user_interval(),
            Err(_) => self
                .interval
                .mul_f64(poll.user_backoff_factor)
                .min(poll.user_max_interval()),
        };
        self.interval
    }
}
