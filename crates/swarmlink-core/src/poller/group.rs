//! v2 closed group poller.
//!
//! ```text
//!   retrieve keys, info, members, messages, revoked   (one node, concurrently)
//!        │
//!        ├── any config namespace failed ──► cycle fails, nothing merged
//!        │
//!        ├── merge keys ─► info ─► members      (keys first: new generations
//!        │                                       unlock info and members)
//!        ├── decrypt messages with every known key
//!        └── revoked: kicked notice for us ──► RemovedFromGroup, loop ends
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{CycleOutcome, NodeSelector, Poller, StateReporter};
use crate::config_sync::{config_messages, ConfigSet, GroupConfigs};
use crate::error::{SwarmError, SwarmResult};
use crate::events::NetworkEvent;
use crate::groups::{check_kicked, SubAccountToken};
use crate::identity::Identity;
use crate::receive::{BatchSink, GroupOpener, ReceivePipeline};
use crate::rpc::{RequestAuth, SnodeApi};
use crate::types::{now_ms, AccountId, Namespace, StoredMessage};

const CONFIG_NAMESPACES: [Namespace; 3] = [
    Namespace::ENCRYPTION_KEYS,
    Namespace::CLOSED_GROUP_INFO,
    Namespace::CLOSED_GROUP_MEMBERS,
];

enum Role {
    /// Holds the group key pair
    Admin(Arc<Identity>),
    /// Regular member, reading with an admin-issued token when it has one
    Member(Option<SubAccountToken>),
}

pub struct GroupPoller {
    api: Arc<SnodeApi>,
    pipeline: ReceivePipeline,
    sink: Arc<dyn BatchSink>,
    configs: Arc<Mutex<GroupConfigs>>,
    role: Role,
    selector: NodeSelector,
}

impl GroupPoller {
    /// Poll as a member of the group.
    pub fn member(
        api: Arc<SnodeApi>,
        sink: Arc<dyn BatchSink>,
        configs: Arc<Mutex<GroupConfigs>>,
        token: Option<SubAccountToken>,
    ) -> Self {
        Self::build(api, sink, configs, Role::Member(token))
    }

    /// Poll as the admin. Config TTLs are extended on every cycle.
    pub fn admin(
        api: Arc<SnodeApi>,
        sink: Arc<dyn BatchSink>,
        configs: Arc<Mutex<GroupConfigs>>,
        group: Arc<Identity>,
    ) -> Self {
        Self::build(api, sink, configs, Role::Admin(group))
    }

    fn build(
        api: Arc<SnodeApi>,
        sink: Arc<dyn BatchSink>,
        configs: Arc<Mutex<GroupConfigs>>,
        role: Role,
    ) -> Self {
        let ctx = api.context();
        let group = configs.lock().group().clone();
        Self {
            pipeline: ReceivePipeline::new(ctx.store.clone(), ctx.config.batch_size),
            selector: NodeSelector::new(group),
            api,
            sink,
            configs,
            role,
        }
    }

    fn group(&self) -> &AccountId {
        self.selector.account()
    }

    /// Handle the revoked namespace. Returns the kicked generation when a
    /// notice addressed to `me` is found.
    fn find_kick(
        &self,
        me: &Identity,
        known_generation: Option<u64>,
        fresh: &[StoredMessage],
    ) -> Option<u64> {
        fresh.iter().find_map(|message| {
            let data = STANDARD.decode(&message.data).ok()?;
            check_kicked(me, self.group(), known_generation, &data)
        })
    }

    async fn extend_config_ttl(&self, admin: &Identity) {
        let ctx = self.api.context();
        let hashes = {
            let mut configs = self.configs.lock();
            configs
                .objects_mut()
                .into_iter()
                .flat_map(|object| object.current_hashes())
                .collect::<Vec<_>>()
        };
        if hashes.is_empty() {
            return;
        }
        let expiry = now_ms() + ctx.config.config_ttl_extension_ms;
        match self
            .api
            .alter_ttl(self.group(), &hashes, expiry, true, RequestAuth::Owner(admin))
            .await
        {
            Ok(updated) => debug!(group = %self.group().short(), updated = updated.len(), "Extended config TTL"),
            Err(e) => warn!(group = %self.group().short(), error = %e, "Could not extend config TTL"),
        }
    }
}

#[async_trait]
impl Poller for GroupPoller {
    fn key(&self) -> String {
        format!("group:{}", self.group().to_hex())
    }

    async fn poll_cycle(&mut self, status: &StateReporter) -> SwarmResult<CycleOutcome> {
        let ctx = self.api.context().clone();
        let group = self.group().clone();
        let me = ctx.identity()?.clone();
        let holder = match &self.role {
            Role::Admin(admin) => admin.clone(),
            Role::Member(_) => me.clone(),
        };
        let node = status.network(self.selector.node(&self.api, status)).await??;

        let mut requests = Vec::new();
        for namespace in CONFIG_NAMESPACES.into_iter().chain([
            Namespace::CLOSED_GROUP_MESSAGES,
            Namespace::REVOKED_GROUP_MESSAGES,
        ]) {
            requests.push((namespace, ctx.store.last_hash(&node, &group, namespace)?));
        }
        let auth = match &self.role {
            Role::Admin(admin) => RequestAuth::Owner(admin),
            Role::Member(Some(token)) => RequestAuth::SubAccount { member: &me, token },
            Role::Member(None) => RequestAuth::None,
        };
        let mut results: HashMap<Namespace, SwarmResult<Vec<StoredMessage>>> = status
            .network(self.api.retrieve_many(&node, &group, &requests, auth))
            .await?
            .into_iter()
            .collect();

        // Configs are all-or-nothing: merging members without the keys
        // that came with them would drop their content.
        let mut configs_raw = Vec::with_capacity(CONFIG_NAMESPACES.len());
        for namespace in CONFIG_NAMESPACES {
            match results.remove(&namespace) {
                Some(Ok(raw)) => configs_raw.push((namespace, raw)),
                Some(Err(e)) => {
                    self.selector.fail(&self.api, &e);
                    return Err(e);
                }
                None => return Err(SwarmError::Generic(format!("no result for {}", namespace))),
            }
        }

        let (keys, known_generation) = {
            let mut configs = self.configs.lock();
            for (namespace, raw) in &configs_raw {
                self.pipeline.advance_cursor(raw, &node, &group, *namespace)?;
            }
            let accepted = configs.merge_in_order(
                &holder,
                &config_messages(&configs_raw[0].1),
                &config_messages(&configs_raw[1].1),
                &config_messages(&configs_raw[2].1),
            );
            if accepted > 0 {
                debug!(group = %group.short(), accepted, "Merged group configs");
            }
            if let Err(e) = configs.persist(ctx.store.as_ref()) {
                warn!(error = %e, "Could not persist group configs");
            }
            (configs.keys.keys_for(&holder), configs.keys.member_generation(&me))
        };

        let mut first_error = None;
        let mut received = 0;
        match results.remove(&Namespace::CLOSED_GROUP_MESSAGES) {
            Some(Ok(raw)) => {
                let opener = GroupOpener {
                    group: &group,
                    keys: &keys,
                };
                let envelopes = self.pipeline.ingest(
                    &raw,
                    &node,
                    &group,
                    Namespace::CLOSED_GROUP_MESSAGES,
                    &opener,
                )?;
                if !envelopes.is_empty() {
                    received = self
                        .pipeline
                        .deliver(self.sink.as_ref(), &group, Namespace::CLOSED_GROUP_MESSAGES, envelopes)
                        .await?;
                    ctx.emit(NetworkEvent::MessagesReceived {
                        account: group.clone(),
                        namespace: Namespace::CLOSED_GROUP_MESSAGES,
                        count: received,
                    });
                }
            }
            Some(Err(e)) => first_error = Some(e),
            None => {}
        }

        match results.remove(&Namespace::REVOKED_GROUP_MESSAGES) {
            Some(Ok(raw)) => {
                self.pipeline
                    .advance_cursor(&raw, &node, &group, Namespace::REVOKED_GROUP_MESSAGES)?;
                let fresh = self.pipeline.dedup(&group, &raw)?;
                if matches!(self.role, Role::Member(_)) {
                    if let Some(generation) = self.find_kick(&me, known_generation, &fresh) {
                        info!(group = %group.short(), generation, "Removed from group");
                        ctx.emit(NetworkEvent::RemovedFromGroup {
                            group: group.clone(),
                            generation,
                        });
                        return Ok(CycleOutcome::Removed);
                    }
                }
            }
            Some(Err(e)) => {
                first_error.get_or_insert(e);
            }
            None => {}
        }

        if let Role::Admin(admin) = &self.role {
            let admin = admin.clone();
            if status.network(self.extend_config_ttl(&admin)).await.is_err() {
                debug!(group = %group.short(), "Stopped before extending config TTL");
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
        match result {
            Ok(_) => poll.group_interval(),
            Err(_) => poll.group_error_interval(),
        }
    }
}
