use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Result};
use tokio::sync::{mpsc, oneshot};
use tracing::info;

use copperline_db::message::MediaPeer;
use copperline_db::models::{QueueConfig, Recipe};

use crate::election::NodeId;

pub const DEFAULT_CALL_PRIORITY: i64 = 10;

/// A call waiting in a queue. Numerically lower priority is offered
/// first; ties break on enqueue time.
#[derive(Clone)]
pub struct QueuedCall {
    pub priority: i64,
    pub enqueue_time: u64,
    pub call_id: String,
    pub handle: Arc<dyn MediaPeer>,
}

impl QueuedCall {
    pub fn new(call_id: &str, priority: i64, handle: Arc<dyn MediaPeer>) -> Self {
        let enqueue_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            priority,
            enqueue_time,
            call_id: call_id.to_string(),
            handle,
        }
    }

    fn key(&self) -> (i64, u64, String) {
        (self.priority, self.enqueue_time, self.call_id.clone())
    }
}

impl std::fmt::Debug for QueuedCall {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("QueuedCall")
            .field("priority", &self.priority)
            .field("enqueue_time", &self.enqueue_time)
            .field("call_id", &self.call_id)
            .finish()
    }
}

enum QueueMsg {
    Push(QueuedCall),
    Ask {
        reply: oneshot::Sender<Option<QueuedCall>>,
    },
    Remove {
        call_id: String,
        reply: oneshot::Sender<bool>,
    },
    CallCount {
        reply: oneshot::Sender<usize>,
    },
    Stop,
}

/// Handle to one queue worker. Cloneable; the worker dies when told to
/// stop or when its node goes away, and `is_alive` reflects that.
#[derive(Clone)]
pub struct QueueHandle {
    pub name: String,
    pub node: NodeId,
    pub weight: u64,
    tx: mpsc::UnboundedSender<QueueMsg>,
}

impl std::fmt::Debug for QueueHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("QueueHandle")
            .field("name", &self.name)
            .field("node", &self.node)
            .field("weight", &self.weight)
            .finish()
    }
}

impl QueueHandle {
    pub fn is_alive(&self) -> bool {
        !self.tx.is_closed()
    }

    pub fn push(&self, call: QueuedCall) -> Result<()> {
        self.tx
            .send(QueueMsg::Push(call))
            .map_err(|_| anyhow!("queue {} worker is gone", self.name))
    }

    /// The call currently eligible to be offered to an agent, if any.
    /// A peek: the call stays queued until removed.
    pub async fn ask(&self) -> Option<QueuedCall> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(QueueMsg::Ask { reply }).ok()?;
        rx.await.ok().flatten()
    }

    pub async fn remove(&self, call_id: &str) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(QueueMsg::Remove {
                call_id: call_id.to_string(),
                reply,
            })
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn call_count(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(QueueMsg::CallCount { reply }).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    pub fn stop(&self) {
        let _ = self.tx.send(QueueMsg::Stop);
    }
}

/// One queue's worker task: the ordered holding area for its calls.
pub struct QueueWorker {
    name: String,
    #[allow(dead_code)]
    recipe: Recipe,
    calls: BTreeMap<(i64, u64, String), QueuedCall>,
}

impl QueueWorker {
    pub fn start(config: &QueueConfig, node: &NodeId) -> QueueHandle {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut worker = QueueWorker {
            name: config.name.clone(),
            recipe: config.recipe.clone(),
            calls: BTreeMap::new(),
        };
        let name = config.name.clone();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if !worker.handle(msg) {
                    break;
                }
            }
            info!(queue = %name, "queue worker stopped");
        });
        QueueHandle {
            name: config.name.clone(),
            node: node.clone(),
            weight: config.weight.max(1),
            tx,
        }
    }

    fn handle(&mut self, msg: QueueMsg) -> bool {
        match msg {
            QueueMsg::Push(call) => {
                info!(
                    queue = %self.name,
                    call = %call.call_id,
                    priority = call.priority,
                    "call queued",
                );
                self.calls.insert(call.key(), call);
            }
            QueueMsg::Ask { reply } => {
                let _ = reply.send(self.calls.values().next().cloned());
            }
            QueueMsg::Remove { call_id, reply } => {
                let key = self
                    .calls
                    .iter()
                    .find(|(_, c)| c.call_id == call_id)
                    .map(|(k, _)| k.clone());
                let removed = match key {
                    Some(key) => self.calls.remove(&key).is_some(),
                    None => false,
                };
                let _ = reply.send(removed);
            }
            QueueMsg::CallCount { reply } => {
                let _ = reply.send(self.calls.len());
            }
            QueueMsg::Stop => return false,
        }
        true
    }
}
