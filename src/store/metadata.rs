//! Flat per-run metadata record persisted as `metadata.json`.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::run::RunState;

/// Everything about a run that survives a process restart.
///
/// Written on every state change and on creation, so a crashed manager can
/// rehydrate its run map from disk and reconcile against the live runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub workspace: PathBuf,
    #[serde(default)]
    pub grants: Vec<String>,
    #[serde(default)]
    pub agent: String,
    #[serde(default)]
    pub image: String,
    /// Declared endpoints: endpoint name to container port.
    #[serde(default)]
    pub ports: HashMap<String, u16>,
    /// Bound endpoints: endpoint name to host port.
    #[serde(default)]
    pub host_ports: HashMap<String, u16>,
    #[serde(default)]
    pub container_id: Option<String>,
    pub state: RunState,
    #[serde(default)]
    pub interactive: bool,
    #[serde(default)]
    pub keep_container: bool,
    #[serde(default)]
    pub firewall_enabled: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stopped_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub provider_meta: HashMap<String, String>,
    #[serde(default)]
    pub worktree_path: Option<String>,
    #[serde(default)]
    pub worktree_branch: Option<String>,
    #[serde(default)]
    pub buildkit_container_id: Option<String>,
    #[serde(default)]
    pub network_id: Option<String>,
    /// Service name to container id for attached service containers.
    #[serde(default)]
    pub service_containers: HashMap<String, String>,
}

impl Default for RunMetadata {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            workspace: PathBuf::new(),
            grants: Vec::new(),
            agent: String::new(),
            image: String::new(),
            ports: HashMap::new(),
            host_ports: HashMap::new(),
            container_id: None,
            state: RunState::Created,
            interactive: false,
            keep_container: false,
            firewall_enabled: false,
            created_at: Utc::now(),
            started_at: None,
            stopped_at: None,
            error: None,
            provider_meta: HashMap::new(),
            worktree_path: None,
            worktree_branch: None,
            buildkit_container_id: None,
            network_id: None,
            service_containers: HashMap::new(),
        }
    }
}
