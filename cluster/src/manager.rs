use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};

use copperline_db::models::{QueueConfig, Recipe, DEFAULT_QUEUE_WEIGHT};
use copperline_db::Database;

use crate::election::{Cluster, ClusterEvent, ElectionService, NodeId};
use crate::queue::{QueueHandle, QueueWorker, QueuedCall};

pub type QueueManagerHandle = Arc<QueueManager>;

const RPC_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub enum AddQueueResult {
    Ok(QueueHandle),
    Exists(QueueHandle),
}

pub enum RegisterOutcome {
    Accepted,
    /// The leader already maps this name to a live worker elsewhere. The
    /// caller's worker loses and must stand down.
    Rejected(QueueHandle),
}

/// One entry of the bindable ranking: the queue, the call it would offer,
/// and the collapsed monotonic weight routing consumes.
#[derive(Debug)]
pub struct BindableQueue {
    pub name: String,
    pub handle: QueueHandle,
    pub call: QueuedCall,
    pub weight: u64,
}

/// Replicated directory `queue name → worker handle`. All mutations route
/// via the elected leader, which pushes accepted entries to every node;
/// followers serve reads from their replica and forward misses.
pub struct QueueManager {
    pub node: NodeId,
    cluster: Arc<Cluster>,
    pub election: Arc<ElectionService>,
    db: Arc<Database>,
    queues: RwLock<HashMap<String, QueueHandle>>,
}

impl QueueManager {
    pub async fn start(
        node: NodeId,
        cluster: Arc<Cluster>,
        db: Arc<Database>,
        heartbeat: Duration,
        window: Duration,
    ) -> QueueManagerHandle {
        let election =
            ElectionService::start(node.clone(), cluster.clone(), heartbeat, window);
        let manager = Arc::new(Self {
            node: node.clone(),
            cluster: cluster.clone(),
            election,
            db,
            queues: RwLock::new(HashMap::new()),
        });
        // subscribe before the first await so the initial election result
        // cannot slip past us
        let mut events = manager.election.subscribe();
        cluster.register_manager(&node, manager.clone()).await;

        let this = manager.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ClusterEvent::Elected) => {
                        info!(node = %this.node, "queue manager took leadership");
                    }
                    Ok(ClusterEvent::Surrendered { leader }) => {
                        this.surrendered(&leader).await;
                    }
                    Ok(ClusterEvent::NodeDown(down)) => {
                        this.node_down(&down).await;
                    }
                    Ok(ClusterEvent::NodeUp(up)) => {
                        if this.election.is_leader().await && up != this.node {
                            this.sync_node(&up).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        let this = manager.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(this.election.heartbeat * 2).await;
                this.sweep_dead_workers().await;
            }
        });

        manager
    }

    /// `add_queue`: local check, then leader check, then start a worker
    /// here and publish it.
    pub async fn add_queue(
        &self,
        name: &str,
        recipe: Option<Recipe>,
        weight: Option<u64>,
    ) -> Result<AddQueueResult> {
        if let Some(handle) = self.queues.read().await.get(name) {
            if handle.is_alive() {
                return Ok(AddQueueResult::Exists(handle.clone()));
            }
        }

        if !self.election.is_leader().await {
            let leader = self.leader_manager().await?;
            let wanted = name.to_string();
            if let Some(handle) = self
                .rpc(async move { leader.registered(&wanted).await })
                .await?
            {
                return Ok(AddQueueResult::Exists(handle));
            }
        }

        let config = QueueConfig {
            name: name.to_string(),
            recipe: recipe.unwrap_or_default(),
            weight: weight.unwrap_or(DEFAULT_QUEUE_WEIGHT),
            skills: Vec::new(),
        };
        let handle = QueueWorker::start(&config, &self.node);
        self.queues
            .write()
            .await
            .insert(name.to_string(), handle.clone());
        info!(queue = %name, node = %self.node, "queue started");

        if self.election.is_leader().await {
            self.replicate(name, handle.clone()).await;
        } else if let Ok(leader) = self.leader_manager().await {
            let wanted = name.to_string();
            let published = handle.clone();
            match self
                .rpc(async move { leader.register(&wanted, published).await })
                .await
            {
                Ok(RegisterOutcome::Accepted) | Err(_) => {}
                Ok(RegisterOutcome::Rejected(winner)) => {
                    handle.stop();
                    self.queues
                        .write()
                        .await
                        .insert(name.to_string(), winner.clone());
                    return Ok(AddQueueResult::Exists(winner));
                }
            }
        }

        Ok(AddQueueResult::Ok(handle))
    }

    /// Replica hit first, then the leader.
    pub async fn get_queue(&self, name: &str) -> Option<QueueHandle> {
        if let Some(handle) = self.queues.read().await.get(name) {
            if handle.is_alive() {
                return Some(handle.clone());
            }
        }
        if self.election.is_leader().await {
            return None;
        }
        let leader = self.leader_manager().await.ok()?;
        let wanted = name.to_string();
        self.rpc(async move { leader.registered(&wanted).await })
            .await
            .ok()
            .flatten()
    }

    /// Local-first existence check, falling back to the leader.
    pub async fn query_queue(&self, name: &str) -> bool {
        self.get_queue(name).await.is_some()
    }

    /// Leader-authoritative listing, sorted by name so every node sees
    /// the same order.
    pub async fn queues(&self) -> Result<Vec<(String, QueueHandle)>> {
        if self.election.is_leader().await {
            return Ok(self.snapshot().await);
        }
        let leader = self.leader_manager().await?;
        self.rpc(async move { leader.snapshot().await }).await
    }

    /// Rank every queue that would currently offer a call. The multi-key
    /// order collapses into one monotonic score: item `c` of `L` (1-based)
    /// gets `weight × call_count + L − c`.
    pub async fn get_best_bindable_queues(&self) -> Result<Vec<BindableQueue>> {
        let mut items = Vec::new();
        for (name, handle) in self.queues().await? {
            let call = match handle.ask().await {
                Some(call) => call,
                None => continue,
            };
            let count = handle.call_count().await as u64;
            let w = handle.weight * count;
            items.push((name, handle, call, w));
        }

        items.sort_by_key(|(_, _, call, _)| call.enqueue_time);
        items.sort_by_key(|(_, _, call, _)| call.priority);
        items.sort_by_key(|(_, _, _, w)| std::cmp::Reverse(*w));

        let l = items.len() as u64;
        Ok(items
            .into_iter()
            .enumerate()
            .map(|(i, (name, handle, call, w))| BindableQueue {
                name,
                handle,
                call,
                weight: w + l - (i as u64 + 1),
            })
            .collect())
    }

    /// Leader-side read used by follower RPCs.
    pub async fn registered(&self, name: &str) -> Option<QueueHandle> {
        let queues = self.queues.read().await;
        queues.get(name).filter(|h| h.is_alive()).cloned()
    }

    /// Leader-side registration. The leader's mapping wins conflicts;
    /// accepted entries fan out to every replica.
    pub async fn register(
        &self,
        name: &str,
        handle: QueueHandle,
    ) -> RegisterOutcome {
        {
            let mut queues = self.queues.write().await;
            match queues.get(name) {
                Some(existing)
                    if existing.is_alive() && existing.node != handle.node =>
                {
                    warn!(
                        queue = %name,
                        winner = %existing.node,
                        loser = %handle.node,
                        "duplicate queue registration rejected",
                    );
                    return RegisterOutcome::Rejected(existing.clone());
                }
                _ => {
                    queues.insert(name.to_string(), handle.clone());
                }
            }
        }
        self.replicate(name, handle).await;
        RegisterOutcome::Accepted
    }

    pub async fn deregister(&self, name: &str, node: &NodeId) {
        let removed = {
            let mut queues = self.queues.write().await;
            match queues.get(name) {
                Some(existing) if &existing.node == node => {
                    queues.remove(name);
                    true
                }
                _ => false,
            }
        };
        if removed {
            for (peer_node, peer) in self.cluster.managers().await {
                if peer_node != self.node {
                    peer.accept_replica_removal(name, node).await;
                }
            }
        }
    }

    /// Follower-side: adopt an entry the leader accepted. A live local
    /// worker losing its name to another node is the partition-heal
    /// loser and stands down.
    pub async fn accept_replica(&self, name: &str, handle: QueueHandle) {
        let mut queues = self.queues.write().await;
        if let Some(existing) = queues.get(name) {
            if existing.node == self.node
                && existing.node != handle.node
                && existing.is_alive()
            {
                info!(queue = %name, "local queue lost the name, stopping worker");
                existing.stop();
            }
        }
        queues.insert(name.to_string(), handle);
    }

    pub async fn accept_replica_removal(&self, name: &str, node: &NodeId) {
        let mut queues = self.queues.write().await;
        if let Some(existing) = queues.get(name) {
            if &existing.node == node {
                queues.remove(name);
            }
        }
    }

    pub async fn snapshot(&self) -> Vec<(String, QueueHandle)> {
        let queues = self.queues.read().await;
        let mut entries: Vec<(String, QueueHandle)> = queues
            .iter()
            .filter(|(_, h)| h.is_alive())
            .map(|(name, h)| (name.clone(), h.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// The replicated store reported an inconsistent database; assert
    /// local mastership of the config tables.
    pub async fn inconsistent_database(&self) {
        warn!(node = %self.node, "inconsistent database event");
        self.db.assert_schema_master().await;
    }

    /// Leave the cluster and take the local workers down. The failover
    /// tests use this as node death: a crashed node stops heartbeating
    /// and its workers die with it, which is exactly this.
    pub async fn shutdown(&self) {
        self.election.stop().await;
        self.cluster.remove(&self.node).await;
        for (_, handle) in self.queues.read().await.iter() {
            if handle.node == self.node {
                handle.stop();
            }
        }
    }

    /// This node became a follower: entries living elsewhere are the
    /// leader's business now, and everything local gets republished so
    /// the new leader's view converges.
    async fn surrendered(&self, leader: &NodeId) {
        {
            let mut queues = self.queues.write().await;
            queues.retain(|_, handle| handle.node == self.node);
        }
        let local: Vec<(String, QueueHandle)> = self
            .queues
            .read()
            .await
            .iter()
            .map(|(n, h)| (n.clone(), h.clone()))
            .collect();
        if local.is_empty() {
            return;
        }
        info!(
            node = %self.node,
            leader = %leader,
            entries = local.len(),
            "republishing local queues to leader",
        );
        for (name, handle) in local {
            let leader_manager = match self.cluster.manager(leader).await {
                Some(m) => m,
                None => return,
            };
            let republished = handle.clone();
            let wanted = name.clone();
            match self
                .rpc(async move {
                    leader_manager.register(&wanted, republished).await
                })
                .await
            {
                Ok(RegisterOutcome::Accepted) => {}
                Ok(RegisterOutcome::Rejected(winner)) => {
                    handle.stop();
                    self.queues.write().await.insert(name, winner);
                }
                Err(e) => {
                    warn!(queue = %name, "republish failed: {e:#}");
                }
            }
        }
    }

    /// Drop entries that lived on the downed node, take the config tables
    /// over, and bring the dead queues back from persisted config.
    async fn node_down(&self, down: &NodeId) {
        let dead: Vec<String> = {
            let mut queues = self.queues.write().await;
            let dead: Vec<String> = queues
                .iter()
                .filter(|(_, h)| &h.node == down)
                .map(|(n, _)| n.clone())
                .collect();
            for name in &dead {
                queues.remove(name);
            }
            dead
        };
        if dead.is_empty() {
            return;
        }
        self.db.assert_schema_master().await;
        for name in dead {
            self.restore_queue(&name).await;
        }
    }

    /// Restart a queue lost with its node, once leadership settles. Only
    /// the leader restarts so a heal cannot spawn duplicates.
    async fn restore_queue(&self, name: &str) {
        for _ in 0..5 {
            if let Some(handle) = self.queues.read().await.get(name) {
                if handle.is_alive() {
                    return;
                }
            }
            if self.election.is_leader().await {
                let config = match self.db.get_queue_config(name).await {
                    Some(config) => config,
                    None => {
                        info!(queue = %name, "no config for dead queue, dropping");
                        return;
                    }
                };
                let handle = QueueWorker::start(&config, &self.node);
                self.queues
                    .write()
                    .await
                    .insert(name.to_string(), handle.clone());
                info!(queue = %name, node = %self.node, "queue restored after node down");
                self.replicate(name, handle).await;
                return;
            }
            tokio::time::sleep(self.election.heartbeat * 2).await;
        }
    }

    /// Restart local workers that died, from the persisted config; drop
    /// entries whose config is gone.
    async fn sweep_dead_workers(&self) {
        let dead: Vec<String> = self
            .queues
            .read()
            .await
            .iter()
            .filter(|(_, h)| h.node == self.node && !h.is_alive())
            .map(|(n, _)| n.clone())
            .collect();
        for name in dead {
            match self.db.get_queue_config(&name).await {
                Some(config) => {
                    let handle = QueueWorker::start(&config, &self.node);
                    self.queues
                        .write()
                        .await
                        .insert(name.clone(), handle.clone());
                    info!(queue = %name, "queue worker restarted");
                    if self.election.is_leader().await {
                        self.replicate(&name, handle).await;
                    } else if let Ok(leader) = self.leader_manager().await {
                        let wanted = name.clone();
                        let _ = self
                            .rpc(async move {
                                leader.register(&wanted, handle).await
                            })
                            .await;
                    }
                }
                None => {
                    self.queues.write().await.remove(&name);
                    info!(queue = %name, "queue config gone, entry dropped");
                    if self.election.is_leader().await {
                        self.deregister(&name, &self.node).await;
                    } else if let Ok(leader) = self.leader_manager().await {
                        let wanted = name.clone();
                        let node = self.node.clone();
                        let _ = self
                            .rpc(async move {
                                leader.deregister(&wanted, &node).await
                            })
                            .await;
                    }
                }
            }
        }
    }

    /// Leader-side: push one accepted entry to every other node.
    async fn replicate(&self, name: &str, handle: QueueHandle) {
        for (peer_node, peer) in self.cluster.managers().await {
            if peer_node == self.node {
                continue;
            }
            peer.accept_replica(name, handle.clone()).await;
        }
    }

    /// Leader-side: push the whole registry to a node that just joined.
    async fn sync_node(&self, node: &NodeId) {
        let peer = match self.cluster.manager(node).await {
            Some(peer) => peer,
            None => return,
        };
        for (name, handle) in self.snapshot().await {
            peer.accept_replica(&name, handle).await;
        }
    }

    async fn leader_manager(&self) -> Result<QueueManagerHandle> {
        let leader = self
            .election
            .leader()
            .await
            .ok_or_else(|| anyhow!("no leader elected"))?;
        self.cluster
            .manager(&leader)
            .await
            .ok_or_else(|| anyhow!("leader {leader} unreachable"))
    }

    /// Leader calls are synchronous and bounded; expiry surfaces as an
    /// error the dispatcher maps to UNKNOWN_ERROR, and the caller may
    /// retry.
    async fn rpc<T>(&self, fut: impl Future<Output = T>) -> Result<T> {
        tokio::time::timeout(RPC_TIMEOUT, fut)
            .await
            .map_err(|_| anyhow!("leader rpc timeout"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use copperline_db::api::StoreSeed;
    use copperline_db::message::NullMediaPeer;
    use std::sync::Arc;

    const BEAT: Duration = Duration::from_millis(20);
    const WINDOW: Duration = Duration::from_millis(100);

    fn db_with_queues(names: &[&str]) -> Arc<Database> {
        Arc::new(Database::new(StoreSeed {
            queues: names.iter().map(|n| QueueConfig::new(n)).collect(),
            ..Default::default()
        }))
    }

    fn queued(call_id: &str, priority: i64, enqueue_time: u64) -> QueuedCall {
        QueuedCall {
            priority,
            enqueue_time,
            call_id: call_id.to_string(),
            handle: Arc::new(NullMediaPeer),
        }
    }

    async fn single_node(db: Arc<Database>) -> QueueManagerHandle {
        let cluster = Cluster::new();
        let manager =
            QueueManager::start("node-a".to_string(), cluster, db, BEAT, WINDOW)
                .await;
        tokio::time::sleep(WINDOW).await;
        assert!(manager.election.is_leader().await);
        manager
    }

    #[tokio::test]
    async fn add_queue_reports_existing() {
        let manager = single_node(db_with_queues(&[])).await;
        let first = manager.add_queue("support", None, None).await.unwrap();
        assert!(matches!(first, AddQueueResult::Ok(_)));
        let second = manager.add_queue("support", None, None).await.unwrap();
        assert!(matches!(second, AddQueueResult::Exists(_)));
        assert!(manager.query_queue("support").await);
        assert!(!manager.query_queue("sales").await);
    }

    #[tokio::test]
    async fn ranking_weight_beats_age_and_priority_beats_weight_ties() {
        let manager = single_node(db_with_queues(&[])).await;

        let q1 = match manager.add_queue("q1", None, Some(1)).await.unwrap() {
            AddQueueResult::Ok(h) => h,
            _ => unreachable!(),
        };
        let q2 = match manager.add_queue("q2", None, Some(10)).await.unwrap() {
            AddQueueResult::Ok(h) => h,
            _ => unreachable!(),
        };
        q1.push(queued("c1", 10, 100)).unwrap();
        q2.push(queued("c2", 10, 200)).unwrap();

        // weight dominates age
        let ranked = manager.get_best_bindable_queues().await.unwrap();
        let names: Vec<&str> = ranked.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["q2", "q1"]);
        // collapsed scores: w + L - c
        assert_eq!(ranked[0].weight, 10 + 2 - 1);
        assert_eq!(ranked[1].weight, 1 + 2 - 2);

        // q2 older than q1 keeps the same order
        assert!(q2.remove("c2").await);
        q2.push(queued("c2", 10, 50)).unwrap();
        let ranked = manager.get_best_bindable_queues().await.unwrap();
        let names: Vec<&str> = ranked.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["q2", "q1"]);

        // equal weight, better priority wins
        let q3 = match manager.add_queue("q3", None, Some(1)).await.unwrap() {
            AddQueueResult::Ok(h) => h,
            _ => unreachable!(),
        };
        q3.push(queued("c3", 0, 200)).unwrap();
        let ranked = manager.get_best_bindable_queues().await.unwrap();
        let q3_pos = ranked.iter().position(|b| b.name == "q3").unwrap();
        let q1_pos = ranked.iter().position(|b| b.name == "q1").unwrap();
        assert!(q3_pos < q1_pos);
    }

    #[tokio::test]
    async fn ranking_is_a_stable_permutation() {
        let manager = single_node(db_with_queues(&[])).await;
        for name in ["qa", "qb", "qc"] {
            let handle =
                match manager.add_queue(name, None, Some(2)).await.unwrap() {
                    AddQueueResult::Ok(h) => h,
                    _ => unreachable!(),
                };
            handle.push(queued("call", 5, 1000)).unwrap();
        }
        let ranked = manager.get_best_bindable_queues().await.unwrap();
        let names: Vec<&str> = ranked.iter().map(|b| b.name.as_str()).collect();
        // identical keys: the name-sorted input order survives every pass
        assert_eq!(names, vec!["qa", "qb", "qc"]);
        let ranked = manager.get_best_bindable_queues().await.unwrap();
        let again: Vec<&str> = ranked.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, again);
    }

    #[tokio::test]
    async fn empty_queues_are_not_bindable() {
        let manager = single_node(db_with_queues(&[])).await;
        manager.add_queue("empty", None, None).await.unwrap();
        let ranked = manager.get_best_bindable_queues().await.unwrap();
        assert!(ranked.is_empty());
    }

    #[tokio::test]
    async fn leader_death_converges_on_survivor() {
        let cluster = Cluster::new();
        let db = db_with_queues(&["q1"]);
        let a = QueueManager::start(
            "node-a".to_string(),
            cluster.clone(),
            db.clone(),
            BEAT,
            WINDOW,
        )
        .await;
        let b = QueueManager::start(
            "node-b".to_string(),
            cluster.clone(),
            db.clone(),
            BEAT,
            WINDOW,
        )
        .await;
        tokio::time::sleep(WINDOW).await;
        assert!(a.election.is_leader().await);

        let added = a.add_queue("q1", None, None).await.unwrap();
        assert!(matches!(added, AddQueueResult::Ok(_)));
        assert!(b.query_queue("q1").await);

        // both nodes answer queues() identically before the failover
        let from_a: Vec<String> =
            a.queues().await.unwrap().into_iter().map(|(n, _)| n).collect();
        let from_b: Vec<String> =
            b.queues().await.unwrap().into_iter().map(|(n, _)| n).collect();
        assert_eq!(from_a, from_b);

        a.shutdown().await;
        // convergence window: heartbeats age out, B elects itself and
        // restores q1 from the config store
        tokio::time::sleep(WINDOW + BEAT * 6).await;

        assert!(b.election.is_leader().await);
        assert!(b.query_queue("q1").await);
        let added = b.add_queue("q1", None, None).await.unwrap();
        assert!(matches!(added, AddQueueResult::Exists(_)));
        assert!(db.is_schema_master().await);

        let queues = b.queues().await.unwrap();
        assert_eq!(queues.len(), 1);
        assert_eq!(queues[0].0, "q1");
        assert_eq!(queues[0].1.node, "node-b");
    }
}
