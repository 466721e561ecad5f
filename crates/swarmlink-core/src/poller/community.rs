//! Community server poller.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{CycleOutcome, Poller, StateReporter};
use crate::community::{
    process_direct, process_room, CommunityApi, CommunityHandler, CommunityServer, PollRequest,
};
use crate::context::SwarmContext;
use crate::error::SwarmResult;
use crate::storage::{settings, CommunityCursor, SwarmStoreExt};

/// Polls every joined room of one server plus the blinded inbox and outbox.
pub struct CommunityPoller {
    ctx: Arc<SwarmContext>,
    api: Arc<dyn CommunityApi>,
    handler: Arc<dyn CommunityHandler>,
    server: CommunityServer,
    rooms: Vec<String>,
}

impl CommunityPoller {
    pub fn new(
        ctx: Arc<SwarmContext>,
        api: Arc<dyn CommunityApi>,
        handler: Arc<dyn CommunityHandler>,
        server: CommunityServer,
        rooms: Vec<String>,
    ) -> Self {
        Self {
            ctx,
            api,
            handler,
            server,
            rooms,
        }
    }

    fn cursor(&self, room: &str) -> SwarmResult<CommunityCursor> {
        let key = settings::community_cursor(&self.server.url, room);
        Ok(self.ctx.store.load_json(&key)?.unwrap_or_default())
    }

    fn save_cursor(&self, room: &str, cursor: &CommunityCursor) -> SwarmResult<()> {
        self.ctx
            .store
            .save_json(&settings::community_cursor(&self.server.url, room), cursor)
    }
}

#[async_trait]
impl Poller for CommunityPoller {
    fn key(&self) -> String {
        format!("community:{}", self.server.url)
    }

    async fn poll_cycle(&mut self, status: &StateReporter) -> SwarmResult<CycleOutcome> {
        // Inbox and outbox cursors live under the empty room name.
        let mut direct = self.cursor("")?;
        let mut rooms = Vec::with_capacity(self.rooms.len());
        for room in &self.rooms {
            rooms.push((room.clone(), self.cursor(room)?.last_seqno));
        }
        let request = PollRequest {
            rooms,
            inbox_since: direct.last_inbox_id,
            outbox_since: direct.last_outbox_id,
        };

        let poll = status.network(self.api.poll(&self.server.url, request)).await??;
        debug!(server = %self.server.url, capabilities = ?poll.capabilities, "Polled community");

        let mut received = 0;
        for room_poll in poll.rooms {
            let room = room_poll.room.clone();
            let mut cursor = self.cursor(&room)?;
            let update = process_room(room_poll, &mut cursor);
            received += update.additions.len();
            self.handler.on_room(&self.server, update).await?;
            self.save_cursor(&room, &cursor)?;
        }

        let identity = self.ctx.identity()?.clone();
        let mut updates = process_direct(&identity, &self.server, poll.inbox, false, &mut direct)?;
        updates.extend(process_direct(&identity, &self.server, poll.outbox, true, &mut direct)?);
        if !updates.is_empty() {
            received += updates.len();
            self.handler.on_direct(&self.server, updates).await?;
        }
        self.save_cursor("", &direct)?;

        Ok(CycleOutcome::Continue { received })
    }

    fn next_delay(&mut self, _result: &SwarmResult<CycleOutcome>) -> Duration {
        self.ctx.config.poll.community_interval()
    }
}
