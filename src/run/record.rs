//! The run record: per-run state, invariants, and safe accessors.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::creds::{ProxyHandle, SshAgentHandle};
use crate::store::RunMetadata;

/// Lifecycle state of a run.
///
/// Transitions are monotonic within a run's lifetime; once a run reaches a
/// terminal state it never becomes non-terminal again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Stopped | RunState::Failed)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Created => write!(f, "created"),
            RunState::Starting => write!(f, "starting"),
            RunState::Running => write!(f, "running"),
            RunState::Stopping => write!(f, "stopping"),
            RunState::Stopped => write!(f, "stopped"),
            RunState::Failed => write!(f, "failed"),
        }
    }
}

/// The mutable state tuple, guarded by one mutex. Every write goes through
/// the setters below; readers always observe a consistent tuple.
#[derive(Debug, Clone)]
struct RunStatus {
    state: RunState,
    error: Option<String>,
    started_at: Option<DateTime<Utc>>,
    stopped_at: Option<DateTime<Utc>>,
}

/// Live container bindings, written while the run is being wired up.
#[derive(Debug, Clone, Default)]
pub struct RunBinding {
    pub container_id: Option<String>,
    pub host_ports: HashMap<String, u16>,
    pub buildkit_container_id: Option<String>,
    pub network_id: Option<String>,
    pub service_containers: HashMap<String, String>,
    pub claude_config_dir: Option<PathBuf>,
    pub codex_config_dir: Option<PathBuf>,
    pub gemini_config_dir: Option<PathBuf>,
    pub provider_cleanup_paths: HashMap<String, PathBuf>,
    pub provider_meta: HashMap<String, String>,
}

/// Immutable creation parameters for a run.
pub struct RunParams {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub workspace: PathBuf,
    pub grants: Vec<String>,
    pub agent: String,
    pub image: String,
    pub ports: HashMap<String, u16>,
    pub interactive: bool,
    pub keep_container: bool,
    pub disable_pre_run_snapshot: bool,
    pub firewall_enabled: bool,
    pub proxy_host: String,
    pub proxy_port: u16,
    pub proxy_auth_token: Option<String>,
}

/// A supervised run.
#[derive(Debug)]
pub struct Run {
    // Identity and creation snapshot; never mutated after registration.
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub workspace: PathBuf,
    pub grants: Vec<String>,
    pub agent: String,
    pub image: String,
    pub ports: HashMap<String, u16>,
    pub interactive: bool,
    pub keep_container: bool,
    pub disable_pre_run_snapshot: bool,

    // Security bindings.
    pub firewall_enabled: bool,
    pub proxy_host: String,
    pub proxy_port: u16,
    pub proxy_auth_token: Option<String>,

    status: Mutex<RunStatus>,
    binding: RwLock<RunBinding>,

    // One-shot latches.
    pub(crate) logs_captured: AtomicBool,
    pub(crate) provider_hooks_done: AtomicBool,
    pub(crate) monitor_started: AtomicBool,

    ssh_agent: RwLock<Option<Arc<SshAgentHandle>>>,
    proxy: RwLock<Option<Arc<ProxyHandle>>>,

    // Cancelled exactly once by the exit monitor, after the terminal state
    // is settled and logs are captured.
    exit: CancellationToken,

    // Tells the refresh loop to wind down on Stop.
    refresh_cancel: CancellationToken,
}

impl Run {
    pub fn new(params: RunParams) -> Self {
        Self {
            id: params.id,
            name: params.name,
            created_at: params.created_at,
            workspace: params.workspace,
            grants: params.grants,
            agent: params.agent,
            image: params.image,
            ports: params.ports,
            interactive: params.interactive,
            keep_container: params.keep_container,
            disable_pre_run_snapshot: params.disable_pre_run_snapshot,
            firewall_enabled: params.firewall_enabled,
            proxy_host: params.proxy_host,
            proxy_port: params.proxy_port,
            proxy_auth_token: params.proxy_auth_token,
            status: Mutex::new(RunStatus {
                state: RunState::Created,
                error: None,
                started_at: None,
                stopped_at: None,
            }),
            binding: RwLock::new(RunBinding::default()),
            logs_captured: AtomicBool::new(false),
            provider_hooks_done: AtomicBool::new(false),
            monitor_started: AtomicBool::new(false),
            ssh_agent: RwLock::new(None),
            proxy: RwLock::new(None),
            exit: CancellationToken::new(),
            refresh_cancel: CancellationToken::new(),
        }
    }

    /// Rebuild a run from persisted metadata with a reconciled state.
    pub fn from_metadata(meta: RunMetadata, state: RunState) -> Self {
        let stopped_at = match (state.is_terminal(), meta.stopped_at) {
            // A terminal run must carry a stop time even if the process died
            // before persisting one.
            (true, None) => Some(Utc::now()),
            (_, stopped_at) => stopped_at,
        };

        let run = Self::new(RunParams {
            id: meta.id,
            name: meta.name,
            created_at: meta.created_at,
            workspace: meta.workspace,
            grants: meta.grants,
            agent: meta.agent,
            image: meta.image,
            ports: meta.ports,
            interactive: meta.interactive,
            keep_container: meta.keep_container,
            disable_pre_run_snapshot: false,
            firewall_enabled: meta.firewall_enabled,
            proxy_host: String::new(),
            proxy_port: 0,
            proxy_auth_token: None,
        });

        {
            let mut status = run.status.lock();
            status.state = state;
            status.error = meta.error;
            status.started_at = meta.started_at;
            status.stopped_at = stopped_at;
        }
        {
            let mut binding = run.binding.write();
            binding.container_id = meta.container_id;
            binding.host_ports = meta.host_ports;
            binding.buildkit_container_id = meta.buildkit_container_id;
            binding.network_id = meta.network_id;
            binding.service_containers = meta.service_containers;
            binding.provider_meta = meta.provider_meta;
        }

        run
    }

    // ========================================================================
    // State accessors
    // ========================================================================

    pub fn state(&self) -> RunState {
        self.status.lock().state
    }

    pub fn error(&self) -> Option<String> {
        self.status.lock().error.clone()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.status.lock().started_at
    }

    pub fn stopped_at(&self) -> Option<DateTime<Utc>> {
        self.status.lock().stopped_at
    }

    pub fn set_state(&self, state: RunState) {
        self.mutate(state, |status| status.state = state);
    }

    pub fn set_state_with_error(&self, state: RunState, error: impl Into<String>) {
        let error = error.into();
        self.mutate(state, |status| {
            status.state = state;
            status.error = Some(error.clone());
        });
    }

    /// Set the state and stamp `started_at` (entering Running) or
    /// `stopped_at` (entering a terminal state).
    pub fn set_state_at(&self, state: RunState, at: DateTime<Utc>) {
        self.mutate(state, |status| {
            status.state = state;
            if state == RunState::Running {
                status.started_at = Some(at);
            }
            if state.is_terminal() {
                status.stopped_at = Some(at);
            }
        });
    }

    /// Atomically fail the run: state, error, and stop time in one write.
    pub fn set_failed_at(&self, error: impl Into<String>, at: DateTime<Utc>) {
        let error = error.into();
        self.mutate(RunState::Failed, |status| {
            status.state = RunState::Failed;
            status.error = Some(error.clone());
            status.stopped_at = Some(at);
        });
    }

    /// Terminal states are permanent: any late transition is dropped.
    fn mutate(&self, target: RunState, apply: impl FnOnce(&mut RunStatus)) {
        let mut status = self.status.lock();
        if status.state.is_terminal() && target != status.state {
            debug!(
                "run {}: ignoring transition {} -> {}",
                self.id, status.state, target
            );
            return;
        }
        apply(&mut status);
    }

    /// Created -> Starting, rejecting every other source state.
    pub(crate) fn begin_start(&self) -> Result<(), RunState> {
        let mut status = self.status.lock();
        if status.state != RunState::Created {
            return Err(status.state);
        }
        status.state = RunState::Starting;
        Ok(())
    }

    // ========================================================================
    // Live bindings
    // ========================================================================

    pub fn container_id(&self) -> Option<String> {
        self.binding.read().container_id.clone()
    }

    pub fn host_ports(&self) -> HashMap<String, u16> {
        self.binding.read().host_ports.clone()
    }

    pub fn service_containers(&self) -> HashMap<String, String> {
        self.binding.read().service_containers.clone()
    }

    pub fn buildkit_container_id(&self) -> Option<String> {
        self.binding.read().buildkit_container_id.clone()
    }

    pub fn network_id(&self) -> Option<String> {
        self.binding.read().network_id.clone()
    }

    pub fn provider_meta(&self) -> HashMap<String, String> {
        self.binding.read().provider_meta.clone()
    }

    pub fn set_provider_meta(&self, key: impl Into<String>, value: impl Into<String>) {
        self.binding
            .write()
            .provider_meta
            .insert(key.into(), value.into());
    }

    pub(crate) fn update_binding(&self, apply: impl FnOnce(&mut RunBinding)) {
        apply(&mut self.binding.write());
    }

    /// Temp directories to delete when the run is cleaned up.
    pub fn cleanup_paths(&self) -> Vec<PathBuf> {
        let binding = self.binding.read();
        let mut paths: Vec<PathBuf> = binding.provider_cleanup_paths.values().cloned().collect();
        paths.extend(binding.claude_config_dir.clone());
        paths.extend(binding.codex_config_dir.clone());
        paths.extend(binding.gemini_config_dir.clone());
        paths
    }

    // ========================================================================
    // Helper servers
    // ========================================================================

    pub(crate) fn set_ssh_agent(&self, handle: SshAgentHandle) {
        *self.ssh_agent.write() = Some(Arc::new(handle));
    }

    pub(crate) fn set_proxy(&self, handle: ProxyHandle) {
        *self.proxy.write() = Some(Arc::new(handle));
    }

    /// One-shot: the underlying stop runs at most once no matter how many
    /// callers race here.
    pub fn stop_ssh_agent(&self) -> bool {
        match self.ssh_agent.read().as_ref() {
            Some(handle) => handle.stop(),
            None => false,
        }
    }

    /// One-shot, same contract as [`Run::stop_ssh_agent`].
    pub fn stop_proxy(&self) -> bool {
        match self.proxy.read().as_ref() {
            Some(handle) => handle.stop(),
            None => false,
        }
    }

    // ========================================================================
    // Coordination
    // ========================================================================

    /// Token cancelled when the run has fully exited. Observing it cancelled
    /// also guarantees the terminal state and stop time are visible.
    pub fn exit_token(&self) -> CancellationToken {
        self.exit.clone()
    }

    pub(crate) fn mark_exited(&self) {
        self.exit.cancel();
    }

    pub fn has_exited(&self) -> bool {
        self.exit.is_cancelled()
    }

    pub(crate) fn refresh_cancel_token(&self) -> CancellationToken {
        self.refresh_cancel.clone()
    }

    pub fn cancel_refresh(&self) {
        self.refresh_cancel.cancel();
    }

    pub fn mark_logs_captured(&self) {
        self.logs_captured.store(true, Ordering::Release);
    }

    /// Snapshot every persisted field. The mutable tuple is read inside its
    /// lock; serialization and store I/O happen with no lock held.
    pub fn snapshot_metadata(&self) -> RunMetadata {
        let status = { self.status.lock().clone() };
        let binding = { self.binding.read().clone() };

        RunMetadata {
            id: self.id.clone(),
            name: self.name.clone(),
            workspace: self.workspace.clone(),
            grants: self.grants.clone(),
            agent: self.agent.clone(),
            image: self.image.clone(),
            ports: self.ports.clone(),
            host_ports: binding.host_ports,
            container_id: binding.container_id,
            state: status.state,
            interactive: self.interactive,
            keep_container: self.keep_container,
            firewall_enabled: self.firewall_enabled,
            created_at: self.created_at,
            started_at: status.started_at,
            stopped_at: status.stopped_at,
            error: status.error,
            provider_meta: binding.provider_meta,
            worktree_path: None,
            worktree_branch: None,
            buildkit_container_id: binding.buildkit_container_id,
            network_id: binding.network_id,
            service_containers: binding.service_containers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run() -> Run {
        Run::new(RunParams {
            id: "run_aabbccddeeff".to_string(),
            name: "quiet-otter".to_string(),
            created_at: Utc::now(),
            workspace: PathBuf::from("/tmp"),
            grants: Vec::new(),
            agent: "claude".to_string(),
            image: "moat-agent:latest".to_string(),
            ports: HashMap::new(),
            interactive: false,
            keep_container: false,
            disable_pre_run_snapshot: false,
            firewall_enabled: false,
            proxy_host: String::new(),
            proxy_port: 0,
            proxy_auth_token: None,
        })
    }

    #[test]
    fn test_terminal_state_is_permanent() {
        let r = run();
        r.set_state_at(RunState::Running, Utc::now());
        r.set_failed_at("boom", Utc::now());
        assert_eq!(r.state(), RunState::Failed);

        r.set_state(RunState::Running);
        assert_eq!(r.state(), RunState::Failed);

        r.set_state_at(RunState::Stopped, Utc::now());
        assert_eq!(r.state(), RunState::Failed);
        assert_eq!(r.error().as_deref(), Some("boom"));
    }

    #[test]
    fn test_set_state_at_stamps_times() {
        let r = run();
        assert!(r.started_at().is_none());

        let t1 = Utc::now();
        r.set_state_at(RunState::Running, t1);
        assert_eq!(r.started_at(), Some(t1));
        assert!(r.stopped_at().is_none());

        let t2 = Utc::now();
        r.set_state_at(RunState::Stopped, t2);
        assert_eq!(r.stopped_at(), Some(t2));
    }

    #[test]
    fn test_begin_start_rejects_non_created() {
        let r = run();
        r.begin_start().unwrap();
        assert_eq!(r.state(), RunState::Starting);

        assert_eq!(r.begin_start().unwrap_err(), RunState::Starting);
    }

    #[tokio::test]
    async fn test_readers_observe_consistent_tuple() {
        let r = Arc::new(run());

        let mut writers = Vec::new();
        for i in 0..8u32 {
            let r = r.clone();
            writers.push(tokio::spawn(async move {
                let now = Utc::now();
                match i % 4 {
                    0 => r.set_state_at(RunState::Running, now),
                    1 => r.set_state(RunState::Stopping),
                    2 => r.set_state_at(RunState::Stopped, now),
                    _ => r.set_failed_at("late failure", now),
                }
            }));
        }

        let mut readers = Vec::new();
        for _ in 0..8 {
            let r = r.clone();
            readers.push(tokio::spawn(async move {
                for _ in 0..100 {
                    let state = r.state();
                    if state.is_terminal() {
                        assert!(r.stopped_at().is_some());
                    }
                    if state == RunState::Running {
                        assert!(r.started_at().is_some());
                    }
                    tokio::task::yield_now().await;
                }
            }));
        }

        for task in writers.into_iter().chain(readers) {
            task.await.unwrap();
        }

        // Whichever terminal write won, it stays won and carries a stop time.
        assert!(r.state().is_terminal());
        assert!(r.stopped_at().is_some());
    }

    #[test]
    fn test_metadata_snapshot_roundtrip() {
        let r = run();
        r.update_binding(|b| {
            b.container_id = Some("ctr-1".to_string());
            b.host_ports.insert("http".to_string(), 32768);
            b.service_containers
                .insert("postgres".to_string(), "svc-1".to_string());
        });
        r.set_state_at(RunState::Running, Utc::now());

        let meta = r.snapshot_metadata();
        assert_eq!(meta.container_id.as_deref(), Some("ctr-1"));
        assert_eq!(meta.state, RunState::Running);
        assert_eq!(meta.host_ports.get("http"), Some(&32768));

        let rebuilt = Run::from_metadata(meta, RunState::Stopped);
        assert_eq!(rebuilt.state(), RunState::Stopped);
        assert_eq!(rebuilt.container_id().as_deref(), Some("ctr-1"));
        // Reconciled terminal runs always carry a stop time.
        assert!(rebuilt.stopped_at().is_some());
    }
}
