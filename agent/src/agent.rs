use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use lazy_static::lazy_static;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use copperline_cluster::manager::QueueManagerHandle;
use copperline_cluster::queue::{QueuedCall, DEFAULT_CALL_PRIORITY};
use copperline_db::message::{
    ApiCall, ApiError, Call, CallType, ChannelState, EndpointSpec, ErrCode,
    NullMediaPeer, PollEvent,
};
use copperline_db::models::{
    AgentProfile, MediaPath, RingPath, SecurityLevel,
};
use copperline_db::Database;

use crate::channel::{AgentChannel, FsmError, Input};
use crate::endpoint::EndpointConfig;
use crate::event::{ChannelObserver, EventManager};

lazy_static! {
    /// Node-local registry of logged-in agents.
    pub static ref AGENTS: DashMap<String, AgentHandle> = DashMap::new();
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AgentState {
    Available,
    Released(Option<String>),
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            AgentState::Available => write!(f, "available"),
            AgentState::Released(_) => write!(f, "released"),
        }
    }
}

/// Immutable view of the agent record handed to `check_cookie` and
/// supervisor listings.
#[derive(serde::Serialize, Clone, Debug)]
pub struct AgentSnapshot {
    pub login: String,
    pub profile: String,
    pub state: String,
    pub statedata: Option<String>,
    pub statetime: u64,
    pub timestamp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mediaload: Option<Value>,
}

enum AgentMsg {
    Api {
        call: ApiCall,
        reply: oneshot::Sender<Result<Value, ApiError>>,
    },
    SetEndpoint {
        spec: EndpointSpec,
        ring_path: RingPath,
    },
    NewChannel {
        call: Call,
        initial: ChannelState,
        reply: oneshot::Sender<Result<String, ApiError>>,
    },
    Dump {
        reply: oneshot::Sender<AgentSnapshot>,
    },
    Stop,
}

#[derive(Clone)]
pub struct AgentHandle {
    pub login: String,
    pub profile: String,
    instance: String,
    tx: mpsc::UnboundedSender<AgentMsg>,
}

impl AgentHandle {
    pub fn is_alive(&self) -> bool {
        !self.tx.is_closed()
    }

    pub async fn api(&self, call: ApiCall) -> Result<Value, ApiError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(AgentMsg::Api { call, reply })
            .map_err(|_| ApiError::new(ErrCode::NoAgent, "agent is gone"))?;
        rx.await
            .map_err(|_| ApiError::new(ErrCode::NoAgent, "agent is gone"))?
    }

    pub fn set_endpoint(&self, spec: EndpointSpec, ring_path: RingPath) {
        let _ = self.tx.send(AgentMsg::SetEndpoint { spec, ring_path });
    }

    pub async fn new_channel(
        &self,
        call: Call,
        initial: ChannelState,
    ) -> Result<String, ApiError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(AgentMsg::NewChannel {
                call,
                initial,
                reply,
            })
            .map_err(|_| ApiError::new(ErrCode::NoAgent, "agent is gone"))?;
        rx.await
            .map_err(|_| ApiError::new(ErrCode::NoAgent, "agent is gone"))?
    }

    pub async fn dump(&self) -> Option<AgentSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(AgentMsg::Dump { reply }).ok()?;
        // bounded so two agents dumping each other cannot wedge both
        tokio::time::timeout(std::time::Duration::from_secs(1), rx)
            .await
            .ok()?
            .ok()
    }

    pub fn stop(&self) {
        let _ = self.tx.send(AgentMsg::Stop);
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Per-agent process: tracks availability and owns the agent's channels.
/// Channels are linked to it, so stopping the FSM takes them down too.
pub struct AgentFsm {
    profile: AgentProfile,
    instance: String,
    state: AgentState,
    statetime: u64,
    endpoint: Option<(EndpointSpec, RingPath)>,
    channels: HashMap<String, Arc<AgentChannel>>,
    observer: Arc<dyn ChannelObserver>,
    event_manager: EventManager,
    queues: Option<QueueManagerHandle>,
    db: Arc<Database>,
}

impl AgentFsm {
    pub fn start(
        profile: AgentProfile,
        observer: Arc<dyn ChannelObserver>,
        event_manager: EventManager,
        queues: Option<QueueManagerHandle>,
        db: Arc<Database>,
    ) -> AgentHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let instance = copperline_utils::uuid();
        let handle = AgentHandle {
            login: profile.login.clone(),
            profile: profile.profile.clone(),
            instance: instance.clone(),
            tx,
        };
        AGENTS.insert(profile.login.clone(), handle.clone());
        let fsm = AgentFsm {
            profile,
            instance,
            state: AgentState::Available,
            statetime: now_secs(),
            endpoint: None,
            channels: HashMap::new(),
            observer,
            event_manager,
            queues,
            db,
        };
        tokio::spawn(fsm.run(rx));
        handle
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<AgentMsg>) {
        info!(agent = %self.profile.login, "agent fsm started");
        while let Some(msg) = rx.recv().await {
            self.prune_channels().await;
            match msg {
                AgentMsg::Api { call, reply } => {
                    let _ = reply.send(self.handle_api(call).await);
                }
                AgentMsg::SetEndpoint { spec, ring_path } => {
                    self.endpoint = Some((spec, ring_path));
                }
                AgentMsg::NewChannel {
                    call,
                    initial,
                    reply,
                } => {
                    let _ = reply.send(self.new_channel(call, initial).await);
                }
                AgentMsg::Dump { reply } => {
                    let _ = reply.send(self.snapshot().await);
                }
                AgentMsg::Stop => break,
            }
        }
        // linked lifetime: the agent going down terminates its channels
        for channel in self.channels.values() {
            channel.kill().await;
        }
        AGENTS.remove_if(&self.profile.login, |_, handle| {
            handle.instance == self.instance
        });
        info!(agent = %self.profile.login, "agent fsm stopped");
    }

    async fn prune_channels(&mut self) {
        let mut dead = Vec::new();
        for (id, channel) in &self.channels {
            if channel.is_terminated().await {
                dead.push(id.clone());
            }
        }
        for id in dead {
            self.channels.remove(&id);
        }
    }

    async fn snapshot(&self) -> AgentSnapshot {
        let mut inband_oncall = Vec::new();
        for channel in self.channels.values() {
            if channel.state().await == ChannelState::Oncall {
                let call = channel.call().await;
                if call.media_path == MediaPath::Inband {
                    inband_oncall.push(channel.id.clone());
                }
            }
        }
        let (state, statedata) = match &self.state {
            AgentState::Available => ("available".to_string(), None),
            AgentState::Released(data) => ("released".to_string(), data.clone()),
        };
        AgentSnapshot {
            login: self.profile.login.clone(),
            profile: self.profile.profile.clone(),
            state,
            statedata,
            statetime: self.statetime,
            timestamp: now_secs(),
            mediaload: if inband_oncall.is_empty() {
                None
            } else {
                Some(json!({ "channels": inband_oncall }))
            },
        }
    }

    async fn handle_api(&mut self, call: ApiCall) -> Result<Value, ApiError> {
        match call {
            ApiCall::SetState { state, data } => {
                self.set_state(&state, data).await
            }
            ApiCall::Ack { counter } => {
                info!(agent = %self.profile.login, counter, "event acked");
                Ok(Value::Null)
            }
            ApiCall::Err { counter, message } => {
                warn!(
                    agent = %self.profile.login,
                    counter,
                    message = message.as_deref().unwrap_or(""),
                    "event erred by client",
                );
                Ok(Value::Null)
            }
            ApiCall::Dial { number } => self.dial(&number).await,
            ApiCall::GetAvailAgents => self.avail_agents().await,
            ApiCall::AgentTransfer { agent, .. } => {
                self.agent_transfer(&agent).await
            }
            ApiCall::MediaPush { data } => self.media_push(data).await,
            ApiCall::WarmTransfer { .. } => self.warm_transfer().await,
            ApiCall::WarmTransferComplete | ApiCall::WarmTransferCancel => {
                self.warm_transfer_answer().await
            }
            ApiCall::QueueTransfer { queue } => self.queue_transfer(&queue).await,
            ApiCall::InitOutbound { client, media_type } => {
                self.init_outbound(&client, &media_type).await
            }
            ApiCall::Supervisor { path } => self.supervisor(&path),
            ApiCall::Raw { function, .. } => Err(ApiError::new(
                ErrCode::FunctionNoexists,
                &format!("no such function {function}"),
            )),
            _ => Err(ApiError::unknown("not an agent operation")),
        }
    }

    async fn set_state(
        &mut self,
        state: &str,
        data: Option<String>,
    ) -> Result<Value, ApiError> {
        let new_state = match state {
            "available" | "idle" => AgentState::Available,
            // an unnamed release takes the configured default option
            "released" => match data {
                Some(data) => AgentState::Released(Some(data)),
                None => AgentState::Released(
                    self.db.default_release().await.map(|o| o.id),
                ),
            },
            _ => {
                return Err(ApiError::unknown(&format!("unknown state {state}")))
            }
        };
        info!(agent = %self.profile.login, state = %new_state, "agent state change");
        self.state = new_state;
        self.statetime = now_secs();
        self.observer.notify(PollEvent::SetRelease {
            release: match &self.state {
                AgentState::Available => None,
                AgentState::Released(data) => {
                    Some(data.clone().unwrap_or_else(|| "default".to_string()))
                }
            },
        });
        Ok(Value::Null)
    }

    async fn channel_in(&self, state: ChannelState) -> Option<Arc<AgentChannel>> {
        for channel in self.channels.values() {
            if channel.state().await == state {
                return Some(channel.clone());
            }
        }
        None
    }

    async fn dial(&mut self, number: &str) -> Result<Value, ApiError> {
        let channel = self
            .channel_in(ChannelState::Precall)
            .await
            .ok_or_else(|| ApiError::unknown("no outbound call in progress"))?;
        // the gateway dials; the channel answers when it calls back with
        // oncall(call)
        info!(
            agent = %self.profile.login,
            channel = %channel.id,
            number = %number,
            "dialing",
        );
        Ok(Value::Null)
    }

    async fn avail_agents(&self) -> Result<Value, ApiError> {
        let mut out = vec![json!({
            "login": self.profile.login,
            "profile": self.profile.profile,
            "state": self.state.to_string(),
        })];
        let others: Vec<AgentHandle> = AGENTS
            .iter()
            .filter(|entry| entry.value().instance != self.instance)
            .map(|entry| entry.value().clone())
            .collect();
        for handle in others {
            if let Some(snapshot) = handle.dump().await {
                out.push(json!({
                    "login": snapshot.login,
                    "profile": snapshot.profile,
                    "state": snapshot.state,
                }));
            }
        }
        Ok(json!(out))
    }

    async fn agent_transfer(&mut self, target: &str) -> Result<Value, ApiError> {
        let channel = self
            .channel_in(ChannelState::Oncall)
            .await
            .ok_or_else(|| ApiError::unknown("no call to transfer"))?;
        let target = AGENTS
            .get(target)
            .filter(|h| h.is_alive())
            .map(|h| h.value().clone())
            .ok_or_else(|| {
                ApiError::new(ErrCode::NoAgent, "transfer target not logged in")
            })?;
        if target.instance == self.instance {
            return Err(ApiError::unknown("cannot transfer to yourself"));
        }

        let mut call = channel.call().await;
        call.state_changes = Vec::new();
        target.new_channel(call, ChannelState::Prering).await?;
        self.channel_wrapup(&channel).await?;
        Ok(Value::Null)
    }

    async fn media_push(&mut self, data: Value) -> Result<Value, ApiError> {
        let channel = self
            .channel_in(ChannelState::Oncall)
            .await
            .ok_or_else(|| ApiError::unknown("no active media"))?;
        self.observer.notify(PollEvent::MediaEvent {
            channel_id: channel.id.clone(),
            data,
        });
        Ok(Value::Null)
    }

    async fn warm_transfer(&mut self) -> Result<Value, ApiError> {
        let channel = self
            .channel_in(ChannelState::Oncall)
            .await
            .ok_or_else(|| ApiError::unknown("no call to transfer"))?;
        // the caller goes on hold; the gateway drives the channel to the
        // third-party state when the far end answers
        self.channel_input(&channel, Input::WarmTransferHold).await?;
        Ok(Value::Null)
    }

    /// Complete or cancel a warm transfer: bring the held channel back
    /// oncall from whichever warm-transfer state it reached.
    async fn warm_transfer_answer(&mut self) -> Result<Value, ApiError> {
        let channel = match self
            .channel_in(ChannelState::Warmtransfer3rdParty)
            .await
        {
            Some(channel) => channel,
            None => self
                .channel_in(ChannelState::WarmtransferHold)
                .await
                .ok_or_else(|| ApiError::unknown("no transfer in progress"))?,
        };
        self.channel_input(&channel, Input::Oncall(None)).await?;
        Ok(Value::Null)
    }

    async fn queue_transfer(&mut self, queue: &str) -> Result<Value, ApiError> {
        let manager = self
            .queues
            .clone()
            .ok_or_else(|| ApiError::unknown("queue manager unavailable"))?;
        let channel = self
            .channel_in(ChannelState::Oncall)
            .await
            .ok_or_else(|| ApiError::unknown("no call to transfer"))?;
        let call = channel.call().await;

        let handle = match manager.get_queue(queue).await {
            Some(handle) => handle,
            None => {
                return Err(ApiError::unknown(&format!("no queue {queue}")))
            }
        };
        handle
            .push(QueuedCall::new(
                &call.id,
                DEFAULT_CALL_PRIORITY,
                call.source.clone(),
            ))
            .map_err(|e| ApiError::unknown(&format!("{e:#}")))?;
        self.channel_wrapup(&channel).await?;
        Ok(Value::Null)
    }

    async fn init_outbound(
        &mut self,
        client: &str,
        media_type: &str,
    ) -> Result<Value, ApiError> {
        let client = self
            .db
            .get_client(client)
            .await
            .ok_or_else(|| ApiError::unknown(&format!("no client {client}")))?;
        let call_type: CallType = media_type
            .parse()
            .map_err(|_| ApiError::unknown(&format!("bad media type {media_type}")))?;

        let mut call = Call::new(
            &copperline_utils::uuid(),
            call_type,
            &self.profile.login,
            Arc::new(NullMediaPeer),
        );
        call.client = Some(client);
        let channel_id = self.new_channel(call, ChannelState::Precall).await?;
        Ok(json!({ "channel": channel_id }))
    }

    fn supervisor(&self, path: &[String]) -> Result<Value, ApiError> {
        if self.profile.security_level < SecurityLevel::Supervisor {
            return Err(ApiError::unknown("insufficient security level"));
        }
        info!(
            agent = %self.profile.login,
            path = %path.join("/"),
            "supervisor request",
        );
        Ok(Value::Null)
    }

    async fn new_channel(
        &mut self,
        mut call: Call,
        initial: ChannelState,
    ) -> Result<String, ApiError> {
        if let Some((_, ring_path)) = &self.endpoint {
            call.ring_path = *ring_path;
        }
        let endpoint = match &self.endpoint {
            Some((spec, ring_path))
                if *ring_path == RingPath::Outband
                    || call.media_path == MediaPath::Outband =>
            {
                EndpointConfig::Spec(spec.clone())
            }
            _ => EndpointConfig::Inband,
        };
        let channel = AgentChannel::start(
            self.profile.clone(),
            call,
            endpoint,
            initial,
            self.event_manager.clone(),
            self.observer.clone(),
        )
        .await
        .map_err(|e| ApiError::unknown(&format!("channel start: {e:#}")))?;

        if initial == ChannelState::Prering {
            let call_id = channel.call().await.id;
            let _ = channel.input_sender().send(Input::Ringing { call_id });
        }
        let id = channel.id.clone();
        self.channels.insert(id.clone(), channel);
        Ok(id)
    }

    async fn channel_wrapup(
        &self,
        channel: &Arc<AgentChannel>,
    ) -> Result<(), ApiError> {
        self.channel_input(
            channel,
            Input::Wrapup {
                self_initiated: true,
            },
        )
        .await
    }

    async fn channel_input(
        &self,
        channel: &Arc<AgentChannel>,
        input: Input,
    ) -> Result<(), ApiError> {
        match channel.input(input).await {
            Ok(_) => Ok(()),
            Err(FsmError::InvalidInput) => {
                Err(ApiError::unknown("invalid in current channel state"))
            }
            Err(FsmError::Terminated) => {
                Err(ApiError::unknown("channel already terminated"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::NullObserver;
    use copperline_db::api::StoreSeed;
    use copperline_db::models::Client;

    fn profile(login: &str) -> AgentProfile {
        AgentProfile {
            id: copperline_utils::uuid(),
            login: login.to_string(),
            profile: "Default".to_string(),
            skills: Vec::new(),
            security_level: SecurityLevel::Agent,
        }
    }

    fn empty_db() -> Arc<Database> {
        Arc::new(Database::new(StoreSeed::default()))
    }

    fn handle(login: &str, db: Arc<Database>) -> AgentHandle {
        AgentFsm::start(
            profile(login),
            Arc::new(NullObserver),
            EventManager::default(),
            None,
            db,
        )
    }

    #[tokio::test]
    async fn state_changes_show_in_snapshot() {
        let agent = handle("agent-state-test", empty_db());
        agent
            .api(ApiCall::SetState {
                state: "released".to_string(),
                data: Some("lunch".to_string()),
            })
            .await
            .unwrap();
        let snapshot = agent.dump().await.unwrap();
        assert_eq!(snapshot.state, "released");
        assert_eq!(snapshot.statedata.as_deref(), Some("lunch"));
        agent.stop();
    }

    #[tokio::test]
    async fn unknown_function_is_rejected() {
        let agent = handle("agent-raw-test", empty_db());
        let err = agent
            .api(ApiCall::Raw {
                function: "frobnicate".to_string(),
                args: Vec::new(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.errcode, ErrCode::FunctionNoexists);
        agent.stop();
    }

    #[tokio::test]
    async fn supervisor_path_needs_security_level() {
        let agent = handle("agent-sup-test", empty_db());
        let err = agent
            .api(ApiCall::Supervisor {
                path: vec!["agents".to_string()],
            })
            .await
            .unwrap_err();
        assert_eq!(err.errcode, ErrCode::UnknownError);
        agent.stop();
    }

    #[tokio::test]
    async fn init_outbound_creates_precall_channel() {
        let db = Arc::new(Database::new(StoreSeed {
            clients: vec![Client {
                id: "acme".to_string(),
                label: "Acme".to_string(),
                autoend_wrapup: None,
            }],
            ..Default::default()
        }));
        let agent = handle("agent-outbound-test", db);
        let result = agent
            .api(ApiCall::InitOutbound {
                client: "acme".to_string(),
                media_type: "voice".to_string(),
            })
            .await
            .unwrap();
        assert!(result.get("channel").is_some());

        // dialing is only valid with the precall channel up
        agent
            .api(ApiCall::Dial {
                number: "+442080908160".to_string(),
            })
            .await
            .unwrap();
        agent.stop();
    }

    #[tokio::test]
    async fn stopping_agent_kills_channels() {
        let db = Arc::new(Database::new(StoreSeed {
            clients: vec![Client {
                id: "acme".to_string(),
                label: "Acme".to_string(),
                autoend_wrapup: None,
            }],
            ..Default::default()
        }));
        let agent = handle("agent-linked-test", db);
        agent
            .api(ApiCall::InitOutbound {
                client: "acme".to_string(),
                media_type: "voice".to_string(),
            })
            .await
            .unwrap();
        agent.stop();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!agent.is_alive());
        assert!(AGENTS.get("agent-linked-test").is_none());
    }
}
