use std::collections::HashMap;

use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::models::{
    Agent, Client, QueueConfig, ReleaseOpt, RingPath, SecurityLevel,
};

/// Seed content for the store façade, deserialized from the service
/// configuration. The durable authentication and configuration stores are
/// external collaborators; this façade gives the rest of the system their
/// read interface.
#[derive(Deserialize, Default)]
pub struct StoreSeed {
    #[serde(default)]
    pub agents: Vec<AgentSeed>,
    #[serde(default)]
    pub clients: Vec<Client>,
    #[serde(default)]
    pub queues: Vec<QueueConfig>,
    #[serde(default)]
    pub release_opts: Vec<ReleaseOpt>,
}

#[derive(Deserialize)]
pub struct AgentSeed {
    pub login: String,
    pub password: String,
    #[serde(default)]
    pub profile: Option<String>,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub security_level: SecurityLevel,
    #[serde(default)]
    pub ring_path: RingPath,
}

pub struct Database {
    agents: RwLock<HashMap<String, Agent>>,
    clients: RwLock<HashMap<String, Client>>,
    queues: RwLock<HashMap<String, QueueConfig>>,
    release_opts: RwLock<Vec<ReleaseOpt>>,
    schema_master: RwLock<bool>,
}

impl Database {
    pub fn new(seed: StoreSeed) -> Self {
        let agents = seed
            .agents
            .into_iter()
            .map(|a| {
                let agent = Agent {
                    id: copperline_utils::uuid(),
                    login: a.login.clone(),
                    profile: a.profile.unwrap_or_else(|| "Default".to_string()),
                    skills: a.skills,
                    security_level: a.security_level,
                    default_ring_path: a.ring_path,
                    password_hash: copperline_utils::sha256(&a.password),
                };
                (a.login, agent)
            })
            .collect();
        let clients = seed
            .clients
            .into_iter()
            .map(|c| (c.id.clone(), c))
            .collect();
        let queues = seed
            .queues
            .into_iter()
            .map(|q| (q.name.clone(), q))
            .collect();
        Self {
            agents: RwLock::new(agents),
            clients: RwLock::new(clients),
            queues: RwLock::new(queues),
            release_opts: RwLock::new(seed.release_opts),
            schema_master: RwLock::new(false),
        }
    }

    /// Check credentials against the auth store. The stored hash is over
    /// the plaintext password, after the dispatcher has stripped the salt
    /// prefix from the decrypted ciphertext.
    pub async fn authenticate(
        &self,
        username: &str,
        password: &str,
    ) -> Option<Agent> {
        let agents = self.agents.read().await;
        let agent = agents.get(username)?;
        if agent.password_hash != copperline_utils::sha256(password) {
            warn!(agent = username, "authentication denied");
            return None;
        }
        Some(agent.clone())
    }

    pub async fn get_agent(&self, login: &str) -> Option<Agent> {
        self.agents.read().await.get(login).cloned()
    }

    pub async fn get_client(&self, id: &str) -> Option<Client> {
        self.clients.read().await.get(id).cloned()
    }

    pub async fn clients(&self) -> Vec<Client> {
        let mut clients: Vec<Client> =
            self.clients.read().await.values().cloned().collect();
        clients.sort_by(|a, b| a.label.cmp(&b.label));
        clients
    }

    pub async fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> =
            self.queues.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn get_queue_config(&self, name: &str) -> Option<QueueConfig> {
        self.queues.read().await.get(name).cloned()
    }

    pub async fn release_opts(&self) -> Vec<ReleaseOpt> {
        self.release_opts.read().await.clone()
    }

    /// The release option applied when an agent releases without naming
    /// one.
    pub async fn default_release(&self) -> Option<ReleaseOpt> {
        self.release_opts
            .read()
            .await
            .iter()
            .find(|o| o.default)
            .cloned()
    }

    /// Promote the local copy of the config tables to master. Called when
    /// a node holding the schema dies or the replicated store reports an
    /// inconsistent database.
    pub async fn assert_schema_master(&self) {
        let mut master = self.schema_master.write().await;
        if !*master {
            info!("asserting local master for queue config tables");
            *master = true;
        }
    }

    pub async fn is_schema_master(&self) -> bool {
        *self.schema_master.read().await
    }
}
