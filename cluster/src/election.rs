use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, RwLock};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::manager::QueueManagerHandle;

pub type NodeId = String;

/// Membership and leadership changes as seen from one node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClusterEvent {
    /// This node became the leader.
    Elected,
    /// This node became (or stayed) a follower of `leader`.
    Surrendered { leader: NodeId },
    NodeUp(NodeId),
    NodeDown(NodeId),
}

/// Shared membership substrate. In one process this is the wire: nodes
/// heartbeat into it and look up each other's manager handles through it.
/// A networked deployment puts a transport behind the same surface.
pub struct Cluster {
    heartbeats: RwLock<HashMap<NodeId, Instant>>,
    managers: RwLock<HashMap<NodeId, QueueManagerHandle>>,
}

impl Cluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            heartbeats: RwLock::new(HashMap::new()),
            managers: RwLock::new(HashMap::new()),
        })
    }

    pub async fn register_manager(&self, node: &NodeId, handle: QueueManagerHandle) {
        self.managers.write().await.insert(node.clone(), handle);
    }

    pub async fn manager(&self, node: &NodeId) -> Option<QueueManagerHandle> {
        self.managers.read().await.get(node).cloned()
    }

    pub async fn managers(&self) -> Vec<(NodeId, QueueManagerHandle)> {
        self.managers
            .read()
            .await
            .iter()
            .map(|(node, handle)| (node.clone(), handle.clone()))
            .collect()
    }

    async fn beat(&self, node: &NodeId) {
        self.heartbeats
            .write()
            .await
            .insert(node.clone(), Instant::now());
    }

    async fn alive(&self, window: Duration) -> HashSet<NodeId> {
        let now = Instant::now();
        self.heartbeats
            .read()
            .await
            .iter()
            .filter(|(_, at)| now.duration_since(**at) < window)
            .map(|(node, _)| node.clone())
            .collect()
    }

    /// Drop a node entirely. Used when a node shuts down (and by the
    /// failover tests to simulate node death).
    pub async fn remove(&self, node: &NodeId) {
        self.heartbeats.write().await.remove(node);
        self.managers.write().await.remove(node);
    }
}

/// Leader election over the membership substrate. At most one leader at a
/// time: the winner is the lowest live node id, which every node computes
/// from the same heartbeat table, and a node only acts on the leadership
/// it observes for itself.
pub struct ElectionService {
    pub node: NodeId,
    cluster: Arc<Cluster>,
    events: broadcast::Sender<ClusterEvent>,
    leader: RwLock<Option<NodeId>>,
    pub heartbeat: Duration,
    pub window: Duration,
    stop: RwLock<bool>,
}

impl ElectionService {
    pub fn start(
        node: NodeId,
        cluster: Arc<Cluster>,
        heartbeat: Duration,
        window: Duration,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        let service = Arc::new(Self {
            node,
            cluster,
            events,
            leader: RwLock::new(None),
            heartbeat,
            window,
            stop: RwLock::new(false),
        });

        let this = service.clone();
        tokio::spawn(async move {
            let mut known: HashSet<NodeId> = HashSet::new();
            loop {
                if *this.stop.read().await {
                    return;
                }
                this.cluster.beat(&this.node).await;
                let alive = this.cluster.alive(this.window).await;

                for node in alive.difference(&known) {
                    if node != &this.node {
                        info!(node = %node, "cluster node up");
                    }
                    let _ = this.events.send(ClusterEvent::NodeUp(node.clone()));
                }
                for node in known.difference(&alive) {
                    warn!(node = %node, "cluster node down");
                    let _ = this.events.send(ClusterEvent::NodeDown(node.clone()));
                }
                known = alive.clone();

                let new_leader = alive.iter().min().cloned();
                let mut leader = this.leader.write().await;
                if *leader != new_leader {
                    let was_self = leader.as_ref() == Some(&this.node);
                    *leader = new_leader.clone();
                    match new_leader {
                        Some(l) if l == this.node => {
                            info!(node = %this.node, "elected cluster leader");
                            let _ = this.events.send(ClusterEvent::Elected);
                        }
                        Some(l) => {
                            if was_self {
                                info!(node = %this.node, leader = %l, "surrendered leadership");
                            }
                            let _ = this
                                .events
                                .send(ClusterEvent::Surrendered { leader: l });
                        }
                        None => {}
                    }
                }
                drop(leader);

                tokio::time::sleep(this.heartbeat).await;
            }
        });

        service
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.events.subscribe()
    }

    pub async fn leader(&self) -> Option<NodeId> {
        self.leader.read().await.clone()
    }

    pub async fn is_leader(&self) -> bool {
        self.leader.read().await.as_ref() == Some(&self.node)
    }

    /// Stop heartbeating. The rest of the cluster sees this node down
    /// once its last heartbeat ages out of the window.
    pub async fn stop(&self) {
        *self.stop.write().await = true;
    }
}
