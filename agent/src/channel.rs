use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, MutexGuard};
use tracing::{info, warn};

use copperline_db::message::{Call, ChannelProp, ChannelState, PollEvent};
use copperline_db::models::{AgentProfile, MediaPath, RingPath};

use crate::endpoint::{Endpoint, EndpointConfig};
use crate::event::{ChannelObserver, EventManager, CHANNEL_PROPS};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FsmError {
    #[error("invalid input")]
    InvalidInput,
    #[error("channel terminated")]
    Terminated,
}

/// Inputs to the channel state machine. Everything not named in the
/// per-state action functions is invalid and leaves the channel where it
/// was, with no side effects.
#[derive(Clone, Debug)]
pub enum Input {
    No,

    /// The offer started ringing; carries the call id for matching.
    Ringing { call_id: String },
    /// Answer. `None` comes from the agent connection, `Some` from the
    /// media gateway with the (possibly updated) call.
    Oncall(Option<Call>),
    Wrapup { self_initiated: bool },
    Stop,
    EndWrapup,
    EndpointExit(String),

    WarmTransferHold,
    WarmTransfer3rdParty,
}

enum Next {
    Stay,
    Goto(ChannelState),
    Terminate,
}

struct Inner {
    state: ChannelState,
    call: Call,
    endpoint: Endpoint,
    endpoint_freed: bool,
    terminated: bool,
}

/// One media interaction owned by one agent. The channel owns its
/// endpoint (linked lifetime) and mediates between the agent connection
/// and the media gateway.
pub struct AgentChannel {
    pub id: String,
    agent: AgentProfile,
    event_manager: EventManager,
    observer: Arc<dyn ChannelObserver>,
    inner: Mutex<Inner>,
    input_tx: mpsc::UnboundedSender<Input>,
}

fn channel_prop(
    id: &str,
    agent: &AgentProfile,
    call: &Call,
    state: ChannelState,
) -> ChannelProp {
    ChannelProp {
        channel_id: id.to_string(),
        login: agent.login.clone(),
        profile: agent.profile.clone(),
        media_type: call.call_type,
        client: call.client.as_ref().map(|c| c.id.clone()),
        caller_id: call.caller_id.clone(),
        state,
    }
}

impl AgentChannel {
    pub async fn start(
        agent: AgentProfile,
        mut call: Call,
        endpoint: EndpointConfig,
        initial_state: ChannelState,
        event_manager: EventManager,
        observer: Arc<dyn ChannelObserver>,
    ) -> Result<Arc<Self>> {
        let id = copperline_utils::uuid();

        CHANNEL_PROPS
            .insert(id.clone(), channel_prop(&id, &agent, &call, initial_state));
        event_manager.initiated_channel(&id, call.snapshot());

        let endpoint = if initial_state == ChannelState::Prering {
            match endpoint.start() {
                Ok(endpoint) => endpoint,
                Err(e) => {
                    CHANNEL_PROPS.remove(&id);
                    return Err(e.context(format!("channel {id} endpoint start")));
                }
            }
        } else {
            Endpoint::Inband
        };
        if let Endpoint::Driver(driver) = &endpoint {
            driver.ring(&call.id);
        }

        call.push_state(initial_state);

        let (input_tx, mut input_rx) = mpsc::unbounded_channel();
        let channel = Arc::new(Self {
            id: id.clone(),
            agent,
            event_manager,
            observer,
            inner: Mutex::new(Inner {
                state: initial_state,
                call,
                endpoint,
                endpoint_freed: false,
                terminated: false,
            }),
            input_tx,
        });

        {
            let inner = channel.inner.lock().await;
            channel.observer.notify(PollEvent::SetChannel {
                channel_id: id.clone(),
                state: initial_state,
                call_id: inner.call.id.clone(),
            });
            if let Endpoint::Driver(driver) = &inner.endpoint {
                let mut exit = driver.exit_watch();
                let input_tx = channel.input_tx.clone();
                tokio::spawn(async move {
                    let reason = loop {
                        if exit.changed().await.is_err() {
                            break "endpoint exit".to_string();
                        }
                        if let Some(reason) = exit.borrow().clone() {
                            break reason;
                        }
                    };
                    let _ = input_tx.send(Input::EndpointExit(reason));
                });
            }
        }

        let pump = channel.clone();
        tokio::spawn(async move {
            while let Some(input) = input_rx.recv().await {
                match pump.input(input).await {
                    Ok(Some(_)) => {}
                    Ok(None) | Err(FsmError::Terminated) => break,
                    Err(FsmError::InvalidInput) => {}
                }
            }
        });

        Ok(channel)
    }

    pub async fn state(&self) -> ChannelState {
        self.inner.lock().await.state
    }

    pub async fn call(&self) -> Call {
        self.inner.lock().await.call.clone()
    }

    pub async fn is_terminated(&self) -> bool {
        self.inner.lock().await.terminated
    }

    /// Drive one input through the machine. `Ok(None)` means the channel
    /// terminated; `Err(InvalidInput)` means the input was rejected and
    /// nothing changed.
    pub async fn input(
        &self,
        input: Input,
    ) -> Result<Option<ChannelState>, FsmError> {
        let mut inner = self.inner.lock().await;
        if inner.terminated {
            return Err(FsmError::Terminated);
        }
        // an exit observed after the channel gave up its driver on
        // purpose is not an event
        if matches!(input, Input::EndpointExit(_)) && inner.endpoint_freed {
            return Ok(Some(inner.state));
        }

        let mut input = input;
        loop {
            let (next, chained) = match inner.state {
                ChannelState::Prering => self.prering_act(&mut inner, input)?,
                ChannelState::Ringing => self.ringing_act(&mut inner, input)?,
                ChannelState::Precall => self.precall_act(&mut inner, input)?,
                ChannelState::Oncall => self.oncall_act(&mut inner, input)?,
                ChannelState::WarmtransferHold => {
                    self.warmtransfer_hold_act(&mut inner, input)?
                }
                ChannelState::Warmtransfer3rdParty => {
                    self.warmtransfer_3rd_party_act(&mut inner, input)?
                }
                ChannelState::Wrapup => self.wrapup_act(&mut inner, input)?,
            };
            match next {
                Next::Stay => {}
                Next::Goto(state) => self.transition(&mut inner, state),
                Next::Terminate => {
                    self.terminate(&mut inner);
                    return Ok(None);
                }
            }
            if matches!(chained, Input::No) {
                break;
            }
            input = chained;
        }
        Ok(Some(inner.state))
    }

    /// Forcible termination outside the transition table, used by the
    /// linked agent FSM when it goes down.
    pub async fn kill(&self) {
        let mut inner = self.inner.lock().await;
        if !inner.terminated {
            self.terminate(&mut inner);
        }
    }

    pub fn input_sender(&self) -> mpsc::UnboundedSender<Input> {
        self.input_tx.clone()
    }

    fn prering_act(
        &self,
        inner: &mut MutexGuard<Inner>,
        input: Input,
    ) -> Result<(Next, Input), FsmError> {
        match input {
            Input::Ringing { call_id } if call_id == inner.call.id => {
                Ok((Next::Goto(ChannelState::Ringing), Input::No))
            }
            Input::EndpointExit(reason) => {
                warn!(channel = %self.id, reason = %reason, "endpoint lost in prering");
                Ok((Next::Terminate, Input::No))
            }
            _ => Err(FsmError::InvalidInput),
        }
    }

    fn ringing_act(
        &self,
        inner: &mut MutexGuard<Inner>,
        input: Input,
    ) -> Result<(Next, Input), FsmError> {
        match input {
            Input::Oncall(None) => {
                if inner.endpoint.is_inband() {
                    inner.call.source.oncall(&inner.call.id);
                    Ok((Next::Goto(ChannelState::Oncall), Input::No))
                } else if inner.call.ring_path == RingPath::Inband
                    && inner.call.media_path == MediaPath::Outband
                {
                    inner.call.source.oncall(&inner.call.id);
                    Self::free_endpoint(inner);
                    Ok((Next::Goto(ChannelState::Oncall), Input::No))
                } else {
                    Err(FsmError::InvalidInput)
                }
            }
            Input::Oncall(Some(call)) if call.id == inner.call.id => {
                Self::adopt_call(inner, call);
                Ok((Next::Goto(ChannelState::Oncall), Input::No))
            }
            Input::Stop => Ok((Next::Terminate, Input::No)),
            Input::EndpointExit(reason) => {
                warn!(channel = %self.id, reason = %reason, "endpoint lost in ringing");
                Ok((Next::Terminate, Input::No))
            }
            _ => Err(FsmError::InvalidInput),
        }
    }

    fn precall_act(
        &self,
        inner: &mut MutexGuard<Inner>,
        input: Input,
    ) -> Result<(Next, Input), FsmError> {
        match input {
            Input::Oncall(Some(call)) => {
                let same_client = match (&call.client, &inner.call.client) {
                    (Some(a), Some(b)) => a.id == b.id,
                    _ => false,
                };
                if call.id == inner.call.id || same_client {
                    Self::adopt_call(inner, call);
                    Ok((Next::Goto(ChannelState::Oncall), Input::No))
                } else {
                    Err(FsmError::InvalidInput)
                }
            }
            Input::EndpointExit(reason) => {
                warn!(channel = %self.id, reason = %reason, "endpoint lost in precall");
                Ok((Next::Terminate, Input::No))
            }
            _ => Err(FsmError::InvalidInput),
        }
    }

    fn oncall_act(
        &self,
        inner: &mut MutexGuard<Inner>,
        input: Input,
    ) -> Result<(Next, Input), FsmError> {
        match input {
            Input::Wrapup { self_initiated } => {
                if self_initiated {
                    inner.call.source.wrapup(&inner.call.id);
                } else {
                    Self::try_wrapup(inner);
                }
                Ok((Next::Goto(ChannelState::Wrapup), Input::No))
            }
            Input::EndpointExit(reason) => {
                info!(channel = %self.id, reason = %reason, "endpoint exit in oncall");
                Self::try_wrapup(inner);
                Ok((Next::Goto(ChannelState::Wrapup), Input::No))
            }
            Input::WarmTransferHold => {
                Ok((Next::Goto(ChannelState::WarmtransferHold), Input::No))
            }
            _ => Err(FsmError::InvalidInput),
        }
    }

    // the warm-transfer states are superseded by per-media warm transfer
    // and kept as pass-through
    fn warmtransfer_hold_act(
        &self,
        inner: &mut MutexGuard<Inner>,
        input: Input,
    ) -> Result<(Next, Input), FsmError> {
        match input {
            Input::WarmTransfer3rdParty => {
                Ok((Next::Goto(ChannelState::Warmtransfer3rdParty), Input::No))
            }
            Input::Oncall(None) => Ok((Next::Goto(ChannelState::Oncall), Input::No)),
            Input::Wrapup { .. } => {
                Self::try_wrapup(inner);
                Ok((Next::Goto(ChannelState::Wrapup), Input::No))
            }
            Input::EndpointExit(_) => Ok((Next::Terminate, Input::No)),
            _ => Err(FsmError::InvalidInput),
        }
    }

    fn warmtransfer_3rd_party_act(
        &self,
        inner: &mut MutexGuard<Inner>,
        input: Input,
    ) -> Result<(Next, Input), FsmError> {
        match input {
            Input::Oncall(None) => Ok((Next::Goto(ChannelState::Oncall), Input::No)),
            Input::Wrapup { .. } => {
                Self::try_wrapup(inner);
                Ok((Next::Goto(ChannelState::Wrapup), Input::No))
            }
            Input::EndpointExit(_) => Ok((Next::Terminate, Input::No)),
            _ => Err(FsmError::InvalidInput),
        }
    }

    fn wrapup_act(
        &self,
        _inner: &mut MutexGuard<Inner>,
        input: Input,
    ) -> Result<(Next, Input), FsmError> {
        match input {
            Input::Stop | Input::EndWrapup => Ok((Next::Terminate, Input::No)),
            // the endpoint winding down during wrapup is expected
            Input::EndpointExit(_) => Ok((Next::Stay, Input::No)),
            _ => Err(FsmError::InvalidInput),
        }
    }

    /// Tell the gateway to wind the media leg down. With outband media the
    /// leg follows the endpoint, so there is nothing to send.
    fn try_wrapup(inner: &mut MutexGuard<Inner>) {
        if inner.call.media_path == MediaPath::Inband {
            inner.call.source.wrapup(&inner.call.id);
        }
    }

    fn free_endpoint(inner: &mut MutexGuard<Inner>) {
        if let Endpoint::Driver(driver) = &inner.endpoint {
            driver.hangup();
        }
        inner.endpoint = Endpoint::Inband;
        inner.endpoint_freed = true;
    }

    fn adopt_call(inner: &mut MutexGuard<Inner>, mut call: Call) {
        call.state_changes = std::mem::take(&mut inner.call.state_changes);
        inner.call = call;
    }

    fn transition(&self, inner: &mut MutexGuard<Inner>, new_state: ChannelState) {
        let old_state = inner.state;
        inner.state = new_state;
        inner.call.push_state(new_state);

        let prop = channel_prop(&self.id, &self.agent, &inner.call, new_state);
        CHANNEL_PROPS.insert(self.id.clone(), prop.clone());
        self.event_manager.channel_state_update(
            &self.id,
            &self.agent.login,
            new_state,
            old_state,
            prop,
        );
        self.observer.notify(PollEvent::SetChannel {
            channel_id: self.id.clone(),
            state: new_state,
            call_id: inner.call.id.clone(),
        });

        if new_state == ChannelState::Wrapup {
            if let Some(n) =
                inner.call.client.as_ref().and_then(|c| c.autoend_wrapup)
            {
                if n > 0 {
                    let input_tx = self.input_tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_secs(n)).await;
                        let _ = input_tx.send(Input::EndWrapup);
                    });
                }
            }
        }
    }

    fn terminate(&self, inner: &mut MutexGuard<Inner>) {
        let from_wrapup = inner.state == ChannelState::Wrapup;
        inner.terminated = true;
        if let Endpoint::Driver(driver) = &inner.endpoint {
            driver.hangup();
        }
        CHANNEL_PROPS.remove(&self.id);
        self.observer.notify(PollEvent::EndChannel {
            channel_id: self.id.clone(),
        });
        self.event_manager.terminated_channel(
            self.agent.clone(),
            inner.call.snapshot(),
            from_wrapup,
        );
        info!(
            channel = %self.id,
            agent = %self.agent.login,
            from_wrapup,
            "channel terminated",
        );
    }

    #[cfg(test)]
    async fn force_state(&self, state: ChannelState) {
        self.inner.lock().await.state = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::NullObserver;
    use copperline_db::message::{CallType, MediaPeer};
    use copperline_db::models::Client;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingPeer {
        oncalls: AtomicUsize,
        wrapups: AtomicUsize,
    }

    impl MediaPeer for RecordingPeer {
        fn oncall(&self, _call_id: &str) {
            self.oncalls.fetch_add(1, Ordering::SeqCst);
        }

        fn wrapup(&self, _call_id: &str) {
            self.wrapups.fetch_add(1, Ordering::SeqCst);
        }

        fn hangup(&self, _call_id: &str) {}
    }

    fn agent() -> AgentProfile {
        AgentProfile {
            id: "a-1".to_string(),
            login: "alice".to_string(),
            profile: "Default".to_string(),
            skills: Vec::new(),
            security_level: Default::default(),
        }
    }

    fn call(peer: Arc<RecordingPeer>) -> Call {
        Call::new("call-1", CallType::Voice, "+442080908160", peer)
    }

    async fn prering_channel(
        peer: Arc<RecordingPeer>,
    ) -> Arc<AgentChannel> {
        AgentChannel::start(
            agent(),
            call(peer),
            EndpointConfig::Inband,
            ChannelState::Prering,
            EventManager::default(),
            Arc::new(NullObserver),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn happy_path_rings_answers_wraps_up() {
        let peer = Arc::new(RecordingPeer::default());
        let channel = prering_channel(peer.clone()).await;

        let state = channel
            .input(Input::Ringing {
                call_id: "call-1".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(state, Some(ChannelState::Ringing));

        let state = channel.input(Input::Oncall(None)).await.unwrap();
        assert_eq!(state, Some(ChannelState::Oncall));
        assert_eq!(peer.oncalls.load(Ordering::SeqCst), 1);

        let state = channel
            .input(Input::Wrapup {
                self_initiated: true,
            })
            .await
            .unwrap();
        assert_eq!(state, Some(ChannelState::Wrapup));
        assert_eq!(peer.wrapups.load(Ordering::SeqCst), 1);

        let state = channel.input(Input::Stop).await.unwrap();
        assert_eq!(state, None);
        assert!(channel.is_terminated().await);
        assert!(CHANNEL_PROPS.get(&channel.id).is_none());

        let history: Vec<ChannelState> = channel
            .call()
            .await
            .state_changes
            .iter()
            .map(|(s, _)| *s)
            .collect();
        assert_eq!(
            history,
            vec![
                ChannelState::Prering,
                ChannelState::Ringing,
                ChannelState::Oncall,
                ChannelState::Wrapup,
            ]
        );
    }

    #[tokio::test]
    async fn invalid_input_leaves_state_untouched() {
        let peer = Arc::new(RecordingPeer::default());
        let channel = prering_channel(peer.clone()).await;
        channel
            .input(Input::Ringing {
                call_id: "call-1".to_string(),
            })
            .await
            .unwrap();

        let err = channel
            .input(Input::Wrapup {
                self_initiated: true,
            })
            .await
            .unwrap_err();
        assert_eq!(err, FsmError::InvalidInput);
        assert_eq!(channel.state().await, ChannelState::Ringing);
        assert_eq!(peer.wrapups.load(Ordering::SeqCst), 0);

        let err = channel
            .input(Input::Ringing {
                call_id: "other".to_string(),
            })
            .await
            .unwrap_err();
        assert_eq!(err, FsmError::InvalidInput);
        assert_eq!(channel.state().await, ChannelState::Ringing);
    }

    #[tokio::test]
    async fn transition_graph_is_closed() {
        // every (state, input) pair not named here must be invalid
        let allowed: Vec<(ChannelState, Input, Option<ChannelState>)> = vec![
            (
                ChannelState::Prering,
                Input::Ringing {
                    call_id: "call-1".to_string(),
                },
                Some(ChannelState::Ringing),
            ),
            (
                ChannelState::Ringing,
                Input::Oncall(None),
                Some(ChannelState::Oncall),
            ),
            (ChannelState::Ringing, Input::Stop, None),
            (
                ChannelState::Oncall,
                Input::Wrapup {
                    self_initiated: true,
                },
                Some(ChannelState::Wrapup),
            ),
            (
                ChannelState::Oncall,
                Input::Wrapup {
                    self_initiated: false,
                },
                Some(ChannelState::Wrapup),
            ),
            (
                ChannelState::Oncall,
                Input::WarmTransferHold,
                Some(ChannelState::WarmtransferHold),
            ),
            (
                ChannelState::WarmtransferHold,
                Input::WarmTransfer3rdParty,
                Some(ChannelState::Warmtransfer3rdParty),
            ),
            (
                ChannelState::WarmtransferHold,
                Input::Oncall(None),
                Some(ChannelState::Oncall),
            ),
            (
                ChannelState::WarmtransferHold,
                Input::Wrapup {
                    self_initiated: false,
                },
                Some(ChannelState::Wrapup),
            ),
            (
                ChannelState::WarmtransferHold,
                Input::Wrapup {
                    self_initiated: true,
                },
                Some(ChannelState::Wrapup),
            ),
            (
                ChannelState::Warmtransfer3rdParty,
                Input::Oncall(None),
                Some(ChannelState::Oncall),
            ),
            (
                ChannelState::Warmtransfer3rdParty,
                Input::Wrapup {
                    self_initiated: false,
                },
                Some(ChannelState::Wrapup),
            ),
            (
                ChannelState::Warmtransfer3rdParty,
                Input::Wrapup {
                    self_initiated: true,
                },
                Some(ChannelState::Wrapup),
            ),
            (ChannelState::Wrapup, Input::Stop, None),
            (ChannelState::Wrapup, Input::EndWrapup, None),
        ];

        let states = [
            ChannelState::Prering,
            ChannelState::Ringing,
            ChannelState::Precall,
            ChannelState::Oncall,
            ChannelState::WarmtransferHold,
            ChannelState::Warmtransfer3rdParty,
            ChannelState::Wrapup,
        ];
        let inputs = [
            Input::Ringing {
                call_id: "call-1".to_string(),
            },
            Input::Oncall(None),
            Input::Wrapup {
                self_initiated: true,
            },
            Input::Wrapup {
                self_initiated: false,
            },
            Input::Stop,
            Input::EndWrapup,
            Input::WarmTransferHold,
            Input::WarmTransfer3rdParty,
        ];

        for state in states {
            for input in &inputs {
                let peer = Arc::new(RecordingPeer::default());
                let channel = prering_channel(peer).await;
                channel.force_state(state).await;

                let expected = allowed.iter().find(|(s, i, _)| {
                    *s == state
                        && std::mem::discriminant(i)
                            == std::mem::discriminant(input)
                        && match (i, input) {
                            (
                                Input::Wrapup { self_initiated: a },
                                Input::Wrapup { self_initiated: b },
                            ) => a == b,
                            _ => true,
                        }
                });
                match expected {
                    Some((_, _, target)) => {
                        let got = channel.input(input.clone()).await.unwrap();
                        assert_eq!(got, *target, "{state:?} + {input:?}");
                    }
                    None => {
                        let err =
                            channel.input(input.clone()).await.unwrap_err();
                        assert_eq!(
                            err,
                            FsmError::InvalidInput,
                            "{state:?} + {input:?}"
                        );
                        assert_eq!(channel.state().await, state);
                    }
                }
            }
        }
    }

    #[tokio::test]
    async fn endpoint_exit_in_oncall_wraps_up_and_is_ignored_in_wrapup() {
        let peer = Arc::new(RecordingPeer::default());
        let channel = prering_channel(peer.clone()).await;
        channel.force_state(ChannelState::Oncall).await;

        let state = channel
            .input(Input::EndpointExit("hangup".to_string()))
            .await
            .unwrap();
        assert_eq!(state, Some(ChannelState::Wrapup));
        assert_eq!(peer.wrapups.load(Ordering::SeqCst), 1);

        let state = channel
            .input(Input::EndpointExit("hangup".to_string()))
            .await
            .unwrap();
        assert_eq!(state, Some(ChannelState::Wrapup));
        assert!(!channel.is_terminated().await);
    }

    #[tokio::test(start_paused = true)]
    async fn wrapup_auto_ends_from_client_options() {
        let peer = Arc::new(RecordingPeer::default());
        let mut call = call(peer);
        call.client = Some(Client {
            id: "client-1".to_string(),
            label: "Acme".to_string(),
            autoend_wrapup: Some(2),
        });
        let channel = AgentChannel::start(
            agent(),
            call,
            EndpointConfig::Inband,
            ChannelState::Prering,
            EventManager::default(),
            Arc::new(NullObserver),
        )
        .await
        .unwrap();
        channel.force_state(ChannelState::Oncall).await;
        channel
            .input(Input::Wrapup {
                self_initiated: true,
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(channel.is_terminated().await);
    }
}
