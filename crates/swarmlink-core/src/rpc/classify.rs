//! Turning node responses into recovery actions.
//!
//! | class          | pool / swarm effect                         | surfaced as          |
//! |----------------|---------------------------------------------|----------------------|
//! | NodeFault      | failure counted, evicted at threshold       | retryable NodeFault  |
//! | ClockOutOfSync | clock recalibrated, event emitted           | `ClockOutOfSync`     |
//! | SwarmMoved     | swarm replaced from body, else node dropped | retryable NodeFault  |
//! | Unclassified   | failure counted                             | retryable NodeFault  |

use serde_json::{json, Value};
use tracing::{debug, warn};

use super::SnodeApi;
use crate::config::StatusClass;
use crate::error::{SwarmError, SwarmResult};
use crate::events::NetworkEvent;
use crate::onion::{OnionResponse, RpcMethod};
use crate::snode::parse_swarm;
use crate::types::{AccountId, Node};

impl SnodeApi {
    /// Apply the side effects of a failed call and return the error to feed
    /// the retry loop.
    pub(crate) async fn handle_failure(
        &self,
        node: &Node,
        account: Option<&AccountId>,
        response: &OnionResponse,
    ) -> SwarmError {
        let class = self.ctx.config.status_policy.classify(response.status);
        debug!(%node, status = response.status, ?class, "Classifying node response");

        match class {
            StatusClass::NodeFault | StatusClass::Unclassified => {
                self.count_failure(node, account);
                SwarmError::NodeFault {
                    status: response.status,
                    message: body_reason(&response.body),
                }
            }
            StatusClass::ClockOutOfSync => {
                warn!(%node, "Node reports clock out of sync");
                if let Err(e) = self.recalibrate_clock(node).await {
                    warn!(error = %e, "Clock recalibration failed");
                }
                self.ctx.emit(NetworkEvent::ClockOutOfSync {
                    offset_ms: self.ctx.clock.offset(),
                });
                SwarmError::ClockOutOfSync
            }
            StatusClass::SwarmMoved => {
                if let Some(account) = account {
                    let result = match parse_swarm(&response.body).filter(|s| !s.is_empty()) {
                        Some(swarm) => self.ctx.resolver.replace_swarm(account, swarm),
                        None => self.ctx.resolver.invalidate(account, node),
                    };
                    if let Err(e) = result {
                        warn!(error = %e, "Failed to update swarm after move");
                    }
                    self.ctx.emit(NetworkEvent::SwarmMoved {
                        account: account.clone(),
                    });
                }
                SwarmError::NodeFault {
                    status: response.status,
                    message: "swarm moved".into(),
                }
            }
        }
    }

    /// Transport-level failure: counts against the node like a fault.
    pub(crate) fn handle_transport_error(
        &self,
        node: &Node,
        account: Option<&AccountId>,
        error: SwarmError,
    ) -> SwarmError {
        if error.is_node_fault() {
            self.count_failure(node, account);
        }
        error
    }

    fn count_failure(&self, node: &Node, account: Option<&AccountId>) {
        match self.ctx.resolver.record_failure(node, account) {
            Ok(true) => self.ctx.emit(NetworkEvent::NodeEvicted { node: node.clone() }),
            Ok(false) => {}
            Err(e) => warn!(error = %e, "Failed to record node failure"),
        }
    }

    /// Ask `node` for network time and store the new offset.
    async fn recalibrate_clock(&self, node: &Node) -> SwarmResult<()> {
        let response = self
            .ctx
            .onion
            .send(RpcMethod::Info, json!({}), node, None)
            .await?;
        let timestamp = parse_timestamp(&response)?;
        let offset = self.ctx.clock.calibrate(timestamp);
        self.ctx.save_clock_offset(offset)
    }
}

pub(crate) fn parse_timestamp(response: &OnionResponse) -> SwarmResult<u64> {
    if !response.is_success() {
        return Err(SwarmError::NodeFault {
            status: response.status,
            message: "info rejected".into(),
        });
    }
    response
        .body
        .get("timestamp")
        .and_then(Value::as_u64)
        .ok_or_else(|| SwarmError::Generic("info response has no timestamp".into()))
}

fn body_reason(body: &Value) -> String {
    match body {
        Value::String(s) => s.clone(),
        Value::Null => "no body".to_string(),
        other => other
            .get("reason")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| other.to_string()),
    }
}
