use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use lazy_static::lazy_static;
use tokio::sync::broadcast;
use tracing::info;

use copperline_db::message::{
    CallSnapshot, ChannelLifecycleEvent, ChannelProp, ChannelState, PollEvent,
};
use copperline_db::models::AgentProfile;

lazy_static! {
    /// Cluster-local registry of live channel properties. The owning
    /// channel is the only writer; subscribers and supervisor views read.
    pub static ref CHANNEL_PROPS: DashMap<String, ChannelProp> = DashMap::new();
}

/// Sink for call detail records. Reporting persistence is an external
/// collaborator, so the default just logs the closed record.
pub trait CdrSink: Send + Sync {
    fn channel_terminated(&self, agent: &AgentProfile, call: &CallSnapshot);
}

pub struct TracingCdr;

impl CdrSink for TracingCdr {
    fn channel_terminated(&self, agent: &AgentProfile, call: &CallSnapshot) {
        info!(
            agent = %agent.login,
            call = %call.id,
            states = call.state_changes.len(),
            "cdr endwrapup",
        );
    }
}

/// Receives per-agent notifications out of the channel layer. The
/// connection worker implements this to feed its poll queue.
pub trait ChannelObserver: Send + Sync {
    fn notify(&self, event: PollEvent);
}

pub struct NullObserver;

impl ChannelObserver for NullObserver {
    fn notify(&self, _event: PollEvent) {}
}

/// Channel lifecycle fan-out. Events are delivered to each subscriber in
/// the order the emitting channel produced them; nothing is guaranteed
/// across channels.
#[derive(Clone)]
pub struct EventManager {
    tx: broadcast::Sender<ChannelLifecycleEvent>,
    cdr: Arc<dyn CdrSink>,
}

impl EventManager {
    pub fn new(cdr: Arc<dyn CdrSink>) -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { tx, cdr }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelLifecycleEvent> {
        self.tx.subscribe()
    }

    pub fn initiated_channel(&self, channel_id: &str, call: CallSnapshot) {
        let _ = self.tx.send(ChannelLifecycleEvent::Initiated {
            at: Utc::now(),
            channel_id: channel_id.to_string(),
            call,
        });
    }

    pub fn channel_state_update(
        &self,
        channel_id: &str,
        agent_login: &str,
        new_state: ChannelState,
        old_state: ChannelState,
        prop: ChannelProp,
    ) {
        let _ = self.tx.send(ChannelLifecycleEvent::StateUpdate {
            at: Utc::now(),
            channel_id: channel_id.to_string(),
            agent_login: agent_login.to_string(),
            new_state,
            old_state,
            prop,
        });
    }

    pub fn terminated_channel(
        &self,
        agent: AgentProfile,
        call: CallSnapshot,
        from_wrapup: bool,
    ) {
        if from_wrapup {
            self.cdr.channel_terminated(&agent, &call);
        }
        let _ = self.tx.send(ChannelLifecycleEvent::Terminated {
            at: Utc::now(),
            agent,
            call,
            from_wrapup,
        });
    }
}

impl Default for EventManager {
    fn default() -> Self {
        Self::new(Arc::new(TracingCdr))
    }
}
