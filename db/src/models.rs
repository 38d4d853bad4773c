use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

#[derive(
    Display, EnumString, Deserialize, Serialize, PartialEq, Eq, Clone, Copy, Debug, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum RingPath {
    #[strum(serialize = "inband")]
    #[default]
    Inband,
    #[strum(serialize = "outband")]
    Outband,
}

#[derive(
    Display, EnumString, Deserialize, Serialize, PartialEq, Eq, Clone, Copy, Debug, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum MediaPath {
    #[strum(serialize = "inband")]
    #[default]
    Inband,
    #[strum(serialize = "outband")]
    Outband,
}

#[derive(
    Display,
    EnumString,
    Deserialize,
    Serialize,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Clone,
    Copy,
    Debug,
    Default,
)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    #[strum(serialize = "agent")]
    #[default]
    Agent,
    #[strum(serialize = "supervisor")]
    Supervisor,
    #[strum(serialize = "admin")]
    Admin,
}

/// One human operator as held by the authentication store. The
/// `password_hash` never leaves this crate; [`Agent::profile_view`] is the
/// shape handed to connection workers and API replies.
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct Agent {
    pub id: String,
    pub login: String,
    pub profile: String,
    pub skills: Vec<String>,
    pub security_level: SecurityLevel,
    pub default_ring_path: RingPath,
    pub password_hash: String,
}

impl Agent {
    pub fn profile_view(&self) -> AgentProfile {
        AgentProfile {
            id: self.id.clone(),
            login: self.login.clone(),
            profile: self.profile.clone(),
            skills: self.skills.clone(),
            security_level: self.security_level,
        }
    }
}

/// The agent record minus credentials.
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct AgentProfile {
    pub id: String,
    pub login: String,
    pub profile: String,
    pub skills: Vec<String>,
    pub security_level: SecurityLevel,
}

/// A tenant ("brand") as the configuration store publishes it. Queue and
/// channel behaviour keys off the options, the UI only sees `{label, id}`.
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct Client {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub autoend_wrapup: Option<u64>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct ReleaseOpt {
    pub label: String,
    pub id: String,
    /// -1 negative, 0 neutral, 1 positive.
    pub bias: i8,
    /// The release applied when an agent releases without naming one.
    #[serde(default)]
    pub default: bool,
}

/// Declarative queue behaviour over time. Only the schema is carried here;
/// executing recipe steps against live calls belongs to the dialplan layer.
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct Recipe {
    #[serde(default)]
    pub steps: Vec<RecipeStep>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct RecipeStep {
    pub after_secs: u64,
    pub action: RecipeAction,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(rename_all = "snake_case")]
pub enum RecipeAction {
    Announce(String),
    SetPriority(i64),
    TransferQueue(String),
}

pub const DEFAULT_QUEUE_WEIGHT: u64 = 1;

fn default_weight() -> u64 {
    DEFAULT_QUEUE_WEIGHT
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct QueueConfig {
    pub name: String,
    #[serde(default)]
    pub recipe: Recipe,
    #[serde(default = "default_weight")]
    pub weight: u64,
    #[serde(default)]
    pub skills: Vec<String>,
}

impl QueueConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            recipe: Recipe::default(),
            weight: DEFAULT_QUEUE_WEIGHT,
            skills: Vec::new(),
        }
    }
}
