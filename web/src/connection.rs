use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::info;

use copperline_agent::agent::{AgentFsm, AgentHandle, AgentSnapshot};
use copperline_agent::event::{ChannelObserver, EventManager};
use copperline_cluster::manager::QueueManagerHandle;
use copperline_db::message::{
    ApiCall, ApiError, EndpointSpec, ErrCode, PollEvent,
};
use copperline_db::models::{AgentProfile, RingPath};
use copperline_db::Database;

pub enum PollOutcome {
    /// Pending events, delivered with HTTP 200. A poll superseded by a
    /// newer one resolves here with an empty list.
    Events(Vec<Value>),
    /// The bounded wait expired: HTTP 408, session intact.
    Timeout,
    /// The worker died under the poll: HTTP 408.
    Killed,
}

enum ConnectionMsg {
    Poll {
        reply: oneshot::Sender<Vec<Value>>,
    },
    KeepAlive,
    SetEndpoint {
        spec: EndpointSpec,
        ring_path: RingPath,
    },
    DumpAgent {
        reply: oneshot::Sender<Option<AgentSnapshot>>,
    },
    Api {
        call: ApiCall,
        reply: oneshot::Sender<Result<Value, ApiError>>,
    },
    Event(PollEvent),
    Stop,
}

/// Cloneable handle the session table and dispatcher hold onto.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub id: String,
    pub login: String,
    poll_timeout: Duration,
    tx: mpsc::UnboundedSender<ConnectionMsg>,
}

impl ConnectionHandle {
    pub fn is_alive(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Resolves once the worker task is gone; the session table uses
    /// this to reclaim the session atomically.
    pub async fn closed(&self) {
        self.tx.closed().await
    }

    pub async fn poll(&self) -> PollOutcome {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(ConnectionMsg::Poll { reply }).is_err() {
            return PollOutcome::Killed;
        }
        match tokio::time::timeout(self.poll_timeout, rx).await {
            Ok(Ok(events)) => PollOutcome::Events(events),
            Ok(Err(_)) => PollOutcome::Killed,
            Err(_) => PollOutcome::Timeout,
        }
    }

    pub fn keep_alive(&self) {
        let _ = self.tx.send(ConnectionMsg::KeepAlive);
    }

    pub fn set_endpoint(&self, spec: EndpointSpec, ring_path: RingPath) {
        let _ = self.tx.send(ConnectionMsg::SetEndpoint { spec, ring_path });
    }

    pub async fn dump_agent(&self) -> Option<AgentSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(ConnectionMsg::DumpAgent { reply }).ok()?;
        rx.await.ok().flatten()
    }

    pub async fn api(&self, call: ApiCall) -> Result<Value, ApiError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ConnectionMsg::Api { call, reply })
            .map_err(|_| ApiError::unknown("connection lost"))?;
        rx.await.map_err(|_| ApiError::unknown("connection lost"))?
    }

    pub fn stop(&self) {
        let _ = self.tx.send(ConnectionMsg::Stop);
    }
}

struct ConnectionObserver {
    tx: mpsc::UnboundedSender<ConnectionMsg>,
}

impl ChannelObserver for ConnectionObserver {
    fn notify(&self, event: PollEvent) {
        let _ = self.tx.send(ConnectionMsg::Event(event));
    }
}

/// Per-agent session façade: owns the poll queue, forwards whitelisted
/// API calls to the agent FSM, and self-terminates when `keep_alive`
/// stops arriving.
pub struct ConnectionWorker {
    id: String,
    login: String,
    agent: AgentHandle,
    pending: VecDeque<Value>,
    counter: u64,
    poller: Option<oneshot::Sender<Vec<Value>>>,
    idle_timeout: Duration,
    deadline: Instant,
}

impl ConnectionWorker {
    pub fn start(
        profile: AgentProfile,
        event_manager: EventManager,
        queues: Option<QueueManagerHandle>,
        db: Arc<Database>,
        idle_timeout: Duration,
        poll_timeout: Duration,
    ) -> ConnectionHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let observer = Arc::new(ConnectionObserver { tx: tx.clone() });
        let agent =
            AgentFsm::start(profile.clone(), observer, event_manager, queues, db);
        let id = copperline_utils::uuid();
        let worker = ConnectionWorker {
            id: id.clone(),
            login: profile.login.clone(),
            agent,
            pending: VecDeque::new(),
            counter: 0,
            poller: None,
            idle_timeout,
            deadline: Instant::now() + idle_timeout,
        };
        tokio::spawn(worker.run(rx));
        ConnectionHandle {
            id,
            login: profile.login,
            poll_timeout,
            tx,
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<ConnectionMsg>) {
        info!(connection = %self.id, agent = %self.login, "connection started");
        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        None | Some(ConnectionMsg::Stop) => break,
                        Some(msg) => self.handle(msg).await,
                    }
                }
                _ = tokio::time::sleep_until(self.deadline) => {
                    info!(
                        connection = %self.id,
                        agent = %self.login,
                        "connection idle timeout",
                    );
                    break;
                }
            }
            self.flush_poller();
        }
        self.agent.stop();
        info!(connection = %self.id, agent = %self.login, "connection stopped");
    }

    async fn handle(&mut self, msg: ConnectionMsg) {
        match msg {
            ConnectionMsg::Poll { reply } => {
                // at most one outstanding poll; the superseded one gets
                // a synthetic empty reply
                if let Some(old) = self.poller.replace(reply) {
                    let _ = old.send(Vec::new());
                }
            }
            ConnectionMsg::KeepAlive => {
                self.deadline = Instant::now() + self.idle_timeout;
            }
            ConnectionMsg::SetEndpoint { spec, ring_path } => {
                self.agent.set_endpoint(spec, ring_path);
            }
            ConnectionMsg::DumpAgent { reply } => {
                let _ = reply.send(self.agent.dump().await);
            }
            ConnectionMsg::Api { call, reply } => {
                let _ = reply.send(self.api(call).await);
            }
            ConnectionMsg::Event(event) => {
                self.counter += 1;
                if let Ok(mut value) = serde_json::to_value(&event) {
                    value["counter"] = Value::from(self.counter);
                    self.pending.push_back(value);
                }
            }
            ConnectionMsg::Stop => unreachable!("handled in run"),
        }
    }

    fn flush_poller(&mut self) {
        if self.pending.is_empty() || self.poller.is_none() {
            return;
        }
        let events: Vec<Value> = self.pending.drain(..).collect();
        if let Some(poller) = self.poller.take() {
            let _ = poller.send(events);
        }
    }

    /// The verb allowlist. Typed commands go to the agent FSM; anything
    /// that failed to parse into one is rejected right here.
    async fn api(&mut self, call: ApiCall) -> Result<Value, ApiError> {
        match call {
            ApiCall::Raw { function, .. } => Err(ApiError::new(
                ErrCode::FunctionNoexists,
                &format!("no such function {function}"),
            )),
            ApiCall::Poll | ApiCall::Logout => {
                Err(ApiError::unknown("handled by the dispatcher"))
            }
            call if call.is_public() => {
                Err(ApiError::unknown("not valid on a logged-in connection"))
            }
            call => self.agent.api(call).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use copperline_db::api::StoreSeed;
    use copperline_db::models::SecurityLevel;

    fn start(login: &str, idle: Duration, poll: Duration) -> ConnectionHandle {
        ConnectionWorker::start(
            AgentProfile {
                id: copperline_utils::uuid(),
                login: login.to_string(),
                profile: "Default".to_string(),
                skills: Vec::new(),
                security_level: SecurityLevel::Agent,
            },
            EventManager::default(),
            None,
            Arc::new(Database::new(StoreSeed::default())),
            idle,
            poll,
        )
    }

    #[tokio::test]
    async fn poll_times_out_without_events() {
        let handle = start(
            "conn-timeout-test",
            Duration::from_secs(60),
            Duration::from_millis(50),
        );
        assert!(matches!(handle.poll().await, PollOutcome::Timeout));
        assert!(handle.is_alive());
        handle.stop();
    }

    #[tokio::test]
    async fn state_change_lands_in_poll() {
        let handle = start(
            "conn-poll-test",
            Duration::from_secs(60),
            Duration::from_secs(2),
        );
        handle
            .api(ApiCall::SetState {
                state: "released".to_string(),
                data: None,
            })
            .await
            .unwrap();
        match handle.poll().await {
            PollOutcome::Events(events) => {
                assert!(!events.is_empty());
                assert_eq!(events[0]["command"], "set_release");
                assert_eq!(events[0]["counter"], 1);
            }
            _ => panic!("expected events"),
        }
        handle.stop();
    }

    #[tokio::test]
    async fn new_poll_supersedes_the_old() {
        let handle = start(
            "conn-supersede-test",
            Duration::from_secs(60),
            Duration::from_secs(2),
        );
        let first = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.poll().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.poll().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // the first poller got its synthetic empty reply
        match first.await.unwrap() {
            PollOutcome::Events(events) => assert!(events.is_empty()),
            _ => panic!("expected synthetic reply"),
        }

        handle
            .api(ApiCall::SetState {
                state: "available".to_string(),
                data: None,
            })
            .await
            .unwrap();
        match second.await.unwrap() {
            PollOutcome::Events(events) => assert!(!events.is_empty()),
            _ => panic!("expected events"),
        }
        handle.stop();
    }

    #[tokio::test]
    async fn unknown_verb_is_rejected() {
        let handle = start(
            "conn-reject-test",
            Duration::from_secs(60),
            Duration::from_secs(1),
        );
        let err = handle
            .api(ApiCall::Raw {
                function: "no_such_thing".to_string(),
                args: Vec::new(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.errcode, ErrCode::FunctionNoexists);
        handle.stop();
    }
}
