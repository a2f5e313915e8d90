//! The run manager: top-level coordinator for run lifecycles.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::creds::{
    spawn_refresh_loop, validate_grants, validate_mcp_grants, CredentialStore, GrantError,
    ProviderRegistry, ProxyHandle, RefreshTarget, SetupContext, SshAgentHandle,
};
use crate::deps::{resolve_docker_dependency, DepError, Dependency};
use crate::routes::{EndpointMap, RouteError, RouteTable};
use crate::runtime::{
    user_for_workspace, ContainerSpec, MountSpec, Runtime, RuntimeError, RuntimeKind,
};
use crate::services::{self, ServiceError, ServiceRegistry};
use crate::store::{AuditLog, Store, StoreError};

use super::monitor;
use super::names::{generate_run_id, random_name};
use super::record::{Run, RunParams, RunState};
use super::resolve::{self, ResolveError};

/// Workspace mount point inside the run container.
const WORKSPACE_TARGET: &str = "/workspace";

/// Where the forwarded SSH agent socket lands inside the container.
const SSH_AGENT_TARGET: &str = "/run/moat/ssh";

#[derive(Debug, Error)]
pub enum RunError {
    #[error("run {0} not found")]
    NotFound(String),

    #[error("run name {0:?} is already in use by an active run")]
    NameInUse(String),

    #[error("cannot start run {0}: state is {1}, expected created")]
    NotCreated(String, RunState),

    #[error("cannot remove run {0}: still {1}")]
    NotTerminal(String, RunState),

    #[error(transparent)]
    Grant(#[from] GrantError),

    #[error(transparent)]
    Dep(#[from] DepError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error("firewall setup failed: {0}")]
    FirewallSetup(RuntimeError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Route(#[from] RouteError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Options for [`Manager::create`].
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub name: Option<String>,
    pub workspace: PathBuf,
    pub grants: Vec<String>,
    pub agent: String,
    pub image: Option<String>,
    pub cmd: Option<String>,
    pub env: HashMap<String, String>,
    /// Declared endpoints: endpoint name to container port.
    pub ports: HashMap<String, u16>,
    pub interactive: bool,
    pub tty: bool,
    pub keep_container: bool,
    pub disable_pre_run_snapshot: bool,
}

/// Resources to unwind when create fails partway.
#[derive(Default)]
struct Rollback {
    container: Option<String>,
    buildkit: Option<String>,
    services: Vec<String>,
    network: Option<String>,
    dirs: Vec<PathBuf>,
    ssh: Option<SshAgentHandle>,
}

impl Rollback {
    async fn unwind(self, runtime: &dyn Runtime) {
        if let Some(ssh) = &self.ssh {
            ssh.stop();
        }
        if let Some(id) = &self.container {
            if let Err(e) = runtime.remove_container(id).await {
                warn!("rollback: failed to remove container {}: {}", id, e);
            }
        }
        if let Some(id) = &self.buildkit {
            if let Err(e) = runtime.sidecars().remove(id).await {
                warn!("rollback: failed to remove buildkit sidecar {}: {}", id, e);
            }
        }
        for id in &self.services {
            if let Err(e) = runtime.services().remove_service(id).await {
                warn!("rollback: failed to remove service container {}: {}", id, e);
            }
        }
        if let Some(name) = &self.network {
            if let Err(e) = runtime.networks().remove_network(name).await {
                warn!("rollback: failed to remove network {}: {}", name, e);
            }
        }
        for dir in &self.dirs {
            remove_dir_quiet(dir);
        }
    }
}

/// Manager for all runs on this host.
pub struct Manager {
    runs: DashMap<String, Arc<Run>>,
    runtime: Arc<dyn Runtime>,
    store: Store,
    routes: RouteTable,
    creds: Arc<dyn CredentialStore>,
    providers: ProviderRegistry,
    services: ServiceRegistry,
    config: Arc<Config>,
}

impl Manager {
    /// Build the manager and rehydrate persisted runs from disk.
    pub async fn new(
        runtime: Arc<dyn Runtime>,
        store: Store,
        routes: RouteTable,
        creds: Arc<dyn CredentialStore>,
        providers: ProviderRegistry,
        services: ServiceRegistry,
        config: Arc<Config>,
    ) -> Result<Self, RunError> {
        let manager = Self {
            runs: DashMap::new(),
            runtime,
            store,
            routes,
            creds,
            providers,
            services,
            config,
        };
        manager.load_persisted_runs().await?;
        Ok(manager)
    }

    // ========================================================================
    // Create
    // ========================================================================

    pub async fn create(&self, opts: CreateOptions) -> Result<Arc<Run>, RunError> {
        let mut rollback = Rollback::default();
        match self.create_inner(&mut rollback, opts).await {
            Ok(run) => Ok(run),
            Err(e) => {
                rollback.unwind(self.runtime.as_ref()).await;
                Err(e)
            }
        }
    }

    async fn create_inner(
        &self,
        rollback: &mut Rollback,
        opts: CreateOptions,
    ) -> Result<Arc<Run>, RunError> {
        let id = generate_run_id();
        let name = match &opts.name {
            Some(name) => {
                if self.name_in_use(name) {
                    return Err(RunError::NameInUse(name.clone()));
                }
                name.clone()
            }
            None => self.unique_random_name(&id),
        };

        let deps: Vec<Dependency> = opts.grants.iter().map(|g| Dependency::parse(g)).collect();
        let (service_deps, cred_deps): (Vec<&Dependency>, Vec<&Dependency>) = deps
            .iter()
            .filter(|d| d.name != "docker")
            .partition(|d| self.services.contains(&d.name));

        let cred_deps: Vec<Dependency> = cred_deps.into_iter().cloned().collect();
        validate_grants(&cred_deps, &self.providers, self.creds.as_ref()).await?;
        validate_mcp_grants(&self.config.mcp_servers, &deps)?;

        let docker_config = resolve_docker_dependency(&deps, self.runtime.kind(), &id)?;

        // A dind sidecar or service containers need a shared per-run network.
        let wants_buildkit = docker_config
            .as_ref()
            .map(|d| d.buildkit.is_some())
            .unwrap_or(false);
        let network_name = format!("moat-{}", id);
        let mut network_id = None;
        if wants_buildkit || !service_deps.is_empty() {
            network_id = Some(self.runtime.networks().create_network(&network_name).await?);
            rollback.network = Some(network_name.clone());
        }

        // Service containers, each brought to readiness before the run exists.
        let mut env = opts.env.clone();
        let mut service_containers = HashMap::new();
        for dep in &service_deps {
            let spec = self
                .services
                .get(&dep.name)
                .ok_or_else(|| ServiceError::Unknown(dep.name.clone()))?;
            let provisioned = services::provision(
                self.runtime.as_ref(),
                &dep.name,
                spec,
                &id,
                &opts.env,
                Some(&network_name),
            )
            .await?;

            rollback.services.push(provisioned.container_id.clone());
            service_containers.insert(dep.name.clone(), provisioned.container_id);
            env.extend(provisioned.env);
        }

        // BuildKit sidecar for dind runs.
        let mut buildkit_id = None;
        if let Some(buildkit) = docker_config.as_ref().and_then(|d| d.buildkit.as_ref()) {
            let sidecar = self.runtime.sidecars().start_buildkit(buildkit).await?;
            rollback.buildkit = Some(sidecar.clone());
            buildkit_id = Some(sidecar);
        }

        // Host ports for declared endpoints.
        let mut host_ports = HashMap::new();
        let mut port_bindings = HashMap::new();
        for (endpoint, container_port) in &opts.ports {
            let host_port = allocate_host_port()?;
            host_ports.insert(endpoint.clone(), host_port);
            port_bindings.insert(*container_port, host_port);
        }

        // Credential proxy wiring; the helper inside the container reads
        // these regardless of which grants are active.
        let firewall = &self.config.firewall;
        let proxy = ProxyHandle::new(
            firewall.proxy_host.clone(),
            firewall.proxy_port,
            firewall.auth_token.clone(),
        );
        env.insert(
            "AGENTOPS_CREDENTIAL_URL".to_string(),
            proxy.credential_url(),
        );
        if let Some(token) = &firewall.auth_token {
            env.insert("AGENTOPS_CREDENTIAL_TOKEN".to_string(), token.clone());
        }

        let mut mounts = vec![MountSpec {
            source: opts.workspace.display().to_string(),
            target: WORKSPACE_TARGET.to_string(),
            read_only: false,
        }];

        // Provider setups (helper binaries, injected tokens).
        let mut provider_cleanup_paths = HashMap::new();
        for dep in &cred_deps {
            if dep.name == "ssh" || dep.name.starts_with("mcp-") {
                continue;
            }
            let provider = match self.providers.get(&dep.name) {
                Some(provider) => provider,
                None => continue,
            };

            let ctx = SetupContext {
                run_id: &id,
                workspace: &opts.workspace,
                scratch_dir: std::env::temp_dir().join(format!("moat-{}-{}", id, dep.name)),
                proxy_url: Some(proxy.credential_url()),
                proxy_token: firewall.auth_token.clone(),
            };
            let setup = provider
                .setup(&ctx, self.creds.as_ref())
                .await
                .map_err(|e| RunError::Other(format!("provider {} setup failed: {}", dep.name, e)))?;

            env.extend(setup.env);
            mounts.extend(setup.mounts);
            if let Some(path) = setup.cleanup_path {
                rollback.dirs.push(path.clone());
                provider_cleanup_paths.insert(dep.name.clone(), path);
            }
        }

        // Injected agent configuration directories.
        let agent_dirs = prepare_agent_config(&opts.agent, &id, &mut env, &mut mounts)?;
        rollback.dirs.extend(agent_dirs.all());

        // SSH agent forwarding.
        if deps.iter().any(|d| d.name == "ssh") {
            match std::env::var("SSH_AUTH_SOCK") {
                Ok(host_sock) => {
                    let dir = std::env::temp_dir().join(format!("moat-{}-ssh", id));
                    let handle = SshAgentHandle::start(
                        &id,
                        std::path::Path::new(&host_sock),
                        &dir,
                    )
                    .await?;
                    mounts.push(MountSpec {
                        source: dir.display().to_string(),
                        target: SSH_AGENT_TARGET.to_string(),
                        read_only: false,
                    });
                    env.insert(
                        "SSH_AUTH_SOCK".to_string(),
                        format!("{}/agent.sock", SSH_AGENT_TARGET),
                    );
                    rollback.dirs.push(dir);
                    rollback.ssh = Some(handle);
                }
                Err(_) => {
                    warn!("ssh grant requested but SSH_AUTH_SOCK is not set; skipping agent forwarding");
                }
            }
        }

        // The container spec.
        let image = opts
            .image
            .clone()
            .unwrap_or_else(|| self.config.default_image.clone());
        let cmd = match &opts.cmd {
            Some(cmd) => shell_words::split(cmd)
                .map_err(|e| RunError::Other(format!("invalid command: {}", e)))?,
            None => Vec::new(),
        };

        let mut spec = ContainerSpec {
            name: format!("{}_run", id),
            image: image.clone(),
            cmd,
            env,
            mounts,
            group_add: Vec::new(),
            privileged: false,
            user: user_for_workspace(&opts.workspace),
            labels: HashMap::from([
                ("moat.run-id".to_string(), id.clone()),
                ("moat.run-name".to_string(), name.clone()),
            ]),
            port_bindings,
            network: network_id.is_some().then(|| network_name.clone()),
            workdir: Some(WORKSPACE_TARGET.to_string()),
            interactive: opts.interactive,
            tty: opts.tty,
        };
        if let Some(docker_config) = &docker_config {
            docker_config.apply(&mut spec);
        }

        let container_id = self.runtime.create_container(&spec).await?;
        // From here on, any failure also reaps the container.
        rollback.container = Some(container_id.clone());

        // Route registration.
        let host = self.runtime.host_address();
        let endpoints: EndpointMap = host_ports
            .iter()
            .map(|(endpoint, port)| (endpoint.clone(), format!("{}:{}", host, port)))
            .collect();
        self.routes.set(&name, endpoints)?;

        let run = Arc::new(Run::new(RunParams {
            id: id.clone(),
            name: name.clone(),
            created_at: Utc::now(),
            workspace: opts.workspace.clone(),
            grants: opts.grants.clone(),
            agent: opts.agent.clone(),
            image,
            ports: opts.ports.clone(),
            interactive: opts.interactive,
            keep_container: opts.keep_container,
            disable_pre_run_snapshot: opts.disable_pre_run_snapshot,
            firewall_enabled: firewall.enabled,
            proxy_host: firewall.proxy_host.clone(),
            proxy_port: firewall.proxy_port,
            proxy_auth_token: firewall.auth_token.clone(),
        }));

        run.update_binding(|binding| {
            binding.container_id = Some(container_id.clone());
            binding.host_ports = host_ports;
            binding.buildkit_container_id = buildkit_id;
            binding.network_id = network_id;
            binding.service_containers = service_containers;
            binding.claude_config_dir = agent_dirs.claude;
            binding.codex_config_dir = agent_dirs.codex;
            binding.gemini_config_dir = agent_dirs.gemini;
            binding.provider_cleanup_paths = provider_cleanup_paths;
        });
        run.set_proxy(proxy);
        if let Some(ssh) = rollback.ssh.take() {
            run.set_ssh_agent(ssh);
        }

        self.runs.insert(id.clone(), run.clone());
        self.persist(&run);
        if let Err(e) = self
            .store
            .audit(&id)
            .append("created", serde_json::json!({ "name": name, "image": run.image }))
        {
            warn!("failed to append audit record for {}: {}", id, e);
        }

        // Registration succeeded; nothing left to unwind.
        *rollback = Rollback::default();

        info!("created run {} ({})", id, name);
        Ok(run)
    }

    // ========================================================================
    // Start
    // ========================================================================

    pub async fn start(&self, id: &str) -> Result<(), RunError> {
        let run = self.get(id)?;

        run.begin_start()
            .map_err(|state| RunError::NotCreated(run.id.clone(), state))?;

        let container_id = run
            .container_id()
            .ok_or_else(|| RunError::Other(format!("run {} has no container", run.id)))?;

        if let Err(e) = self.runtime.start_container(&container_id).await {
            run.set_failed_at(format!("container start failed: {}", e), Utc::now());
            self.persist(&run);
            return Err(e.into());
        }

        if run.firewall_enabled {
            if let Err(e) = self
                .runtime
                .setup_firewall(&container_id, &run.proxy_host, run.proxy_port)
                .await
            {
                // The firewall error is what the caller needs to see; a
                // failed best-effort stop is only logged.
                if let Err(stop_err) = self.runtime.stop_container(&container_id).await {
                    error!(
                        "failed to stop container {} after firewall error: {}",
                        container_id, stop_err
                    );
                }
                run.set_failed_at(format!("firewall setup failed: {}", e), Utc::now());
                self.persist(&run);
                return Err(RunError::FirewallSetup(e));
            }
        }

        monitor::spawn_exit_monitor(
            run.clone(),
            self.runtime.clone(),
            self.store.clone(),
            self.providers.clone(),
        );

        let targets = self.refresh_targets(&run).await;
        if !targets.is_empty() {
            spawn_refresh_loop(
                targets,
                self.creds.clone(),
                run.refresh_cancel_token(),
                run.exit_token(),
            );
        }

        // Interactive Apple runs tee output through the attach path; every
        // other run streams logs straight to the persistent file.
        if !(self.runtime.kind() == RuntimeKind::Apple && run.interactive) {
            monitor::spawn_log_streamer(run.clone(), self.runtime.clone(), self.store.clone());
        }

        run.set_state_at(RunState::Running, Utc::now());
        self.persist(&run);
        if let Err(e) = self.store.audit(&run.id).append("started", serde_json::json!({})) {
            warn!("failed to append audit record for {}: {}", run.id, e);
        }

        info!("started run {} ({})", run.id, run.name);
        Ok(())
    }

    // ========================================================================
    // Stop
    // ========================================================================

    /// Stop a run. Idempotent: terminal runs return Ok immediately, and
    /// every cleanup step is best-effort so a partial earlier failure never
    /// blocks the rest.
    pub async fn stop(&self, id: &str) -> Result<(), RunError> {
        let run = self.get(id)?;

        if run.state().is_terminal() {
            return Ok(());
        }
        run.set_state(RunState::Stopping);

        if let Some(container_id) = run.container_id() {
            if let Err(e) = self.runtime.stop_container(&container_id).await {
                warn!("failed to stop container {}: {}", container_id, e);
            }
        }

        run.cancel_refresh();
        run.stop_ssh_agent();
        run.stop_proxy();

        // Let the exit monitor settle terminal state and capture logs; if it
        // never started or hangs, proceed after a bounded wait.
        if run.monitor_started.load(std::sync::atomic::Ordering::Acquire) {
            let timeout = Duration::from_secs(self.config.exit_wait_timeout_secs);
            let exited = run.exit_token();
            if tokio::time::timeout(timeout, exited.cancelled()).await.is_err() {
                warn!("timed out waiting for run {} to exit; continuing cleanup", run.id);
            }
        }

        monitor::capture_logs(&run, self.runtime.as_ref(), &self.store).await;

        if !run.keep_container {
            if let Some(container_id) = run.container_id() {
                if let Err(e) = self.runtime.remove_container(&container_id).await {
                    warn!("failed to remove container {}: {}", container_id, e);
                }
            }
        }

        if let Err(e) = self.routes.remove(&run.name) {
            warn!("failed to remove route for {}: {}", run.name, e);
        }

        for dir in run.cleanup_paths() {
            remove_dir_quiet(&dir);
        }

        for (service, container_id) in run.service_containers() {
            if let Err(e) = self.runtime.services().remove_service(&container_id).await {
                warn!("failed to remove {} container {}: {}", service, container_id, e);
            }
        }

        if let Some(buildkit) = run.buildkit_container_id() {
            if let Err(e) = self.runtime.sidecars().remove(&buildkit).await {
                warn!("failed to remove buildkit sidecar {}: {}", buildkit, e);
            }
        }
        if let Some(network) = run.network_id() {
            let network_name = format!("moat-{}", run.id);
            if let Err(e) = self.runtime.networks().remove_network(&network_name).await {
                warn!("failed to remove network {} ({}): {}", network_name, network, e);
            }
        }

        run.set_state_at(RunState::Stopped, Utc::now());
        self.persist(&run);
        if let Err(e) = self.store.audit(&run.id).append("stopped", serde_json::json!({})) {
            warn!("failed to append audit record for {}: {}", run.id, e);
        }

        info!("stopped run {} ({})", run.id, run.name);
        Ok(())
    }

    // ========================================================================
    // Attach
    // ========================================================================

    /// Attach the caller's terminal to an interactive run.
    ///
    /// On Apple runtimes container output is also tee'd into the persistent
    /// log file, since the attach stream is the only capture path there; on
    /// every other runtime the log streamer started at Start already owns
    /// capture, and attaching only mirrors output to the terminal.
    pub async fn attach(&self, id: &str) -> Result<(), RunError> {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let run = self.get(id)?;
        let container_id = run
            .container_id()
            .ok_or_else(|| RunError::Other(format!("run {} has no container", run.id)))?;

        let streams = self.runtime.attach(&container_id).await?;
        let mut output = streams.output;
        let mut input = streams.input;

        let tee = self.runtime.kind() == RuntimeKind::Apple;

        let stdin_task = tokio::spawn(async move {
            let mut stdin = tokio::io::stdin();
            let _ = tokio::io::copy(&mut stdin, &mut input).await;
        });

        let mut stdout = tokio::io::stdout();
        let mut buf = [0u8; 8192];
        loop {
            let n = output.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            stdout.write_all(&buf[..n]).await?;
            stdout.flush().await?;
            if tee {
                if let Err(e) = self.store.append_logs(&run.id, &buf[..n]) {
                    warn!("failed to tee output for {}: {}", run.id, e);
                }
            }
        }

        if tee {
            run.mark_logs_captured();
        }
        stdin_task.abort();
        Ok(())
    }

    // ========================================================================
    // Queries and removal
    // ========================================================================

    pub fn get(&self, id: &str) -> Result<Arc<Run>, RunError> {
        self.runs
            .get(id)
            .map(|r| r.value().clone())
            .ok_or_else(|| RunError::NotFound(id.to_string()))
    }

    /// Snapshot of all runs, newest first.
    pub fn list(&self) -> Vec<Arc<Run>> {
        let mut runs: Vec<Arc<Run>> = self.runs.iter().map(|r| r.value().clone()).collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        runs
    }

    /// Resolve an id, id prefix, or name to matching runs, newest first.
    /// Multi-match disambiguation is the caller's job.
    pub fn resolve(&self, arg: &str) -> Result<Vec<Arc<Run>>, RunError> {
        let runs: Vec<Arc<Run>> = self.runs.iter().map(|r| r.value().clone()).collect();
        Ok(resolve::resolve(&runs, arg)?)
    }

    /// Remove a terminal run's record and on-disk artifacts.
    pub async fn remove(&self, id: &str) -> Result<(), RunError> {
        let run = self.get(id)?;
        let state = run.state();
        if !state.is_terminal() {
            return Err(RunError::NotTerminal(run.id.clone(), state));
        }

        // Terminal runs may still hold containers kept for inspection.
        if let Some(container_id) = run.container_id() {
            if let Err(e) = self.runtime.remove_container(&container_id).await {
                warn!("failed to remove container {}: {}", container_id, e);
            }
        }
        for (service, container_id) in run.service_containers() {
            if let Err(e) = self.runtime.services().remove_service(&container_id).await {
                warn!("failed to remove {} container {}: {}", service, container_id, e);
            }
        }

        self.store.remove_run(&run.id)?;
        if let Err(e) = self.routes.remove(&run.name) {
            warn!("failed to remove route for {}: {}", run.name, e);
        }
        self.runs.remove(&run.id);

        info!("removed run {} ({})", run.id, run.name);
        Ok(())
    }

    /// Captured logs for a run, optionally tail-limited.
    pub fn logs(&self, id: &str, tail: Option<usize>) -> Result<String, RunError> {
        let run = self.get(id)?;
        let content = self.store.read_logs(&run.id).map_err(|e| match e {
            StoreError::Io(ref io) if io.kind() == std::io::ErrorKind::NotFound => {
                RunError::Other(format!("no logs captured yet for run {}", run.id))
            }
            other => RunError::Store(other),
        })?;

        Ok(match tail {
            Some(n) => monitor::last_n_lines(&content, n).to_string(),
            None => content,
        })
    }

    // ========================================================================
    // Boot reconciliation
    // ========================================================================

    /// Rehydrate persisted runs, reconciling each against the live runtime.
    /// Routes whose run is not actually running are stale and removed.
    async fn load_persisted_runs(&self) -> Result<(), RunError> {
        for meta in self.store.list_runs()? {
            let persisted_state = meta.state;
            let mut state = persisted_state;
            let mut container_missing = meta.container_id.is_none();

            if let Some(container_id) = &meta.container_id {
                match self.runtime.container_state(container_id).await {
                    Ok(runtime_state) => {
                        state = match runtime_state.as_str() {
                            "running" => RunState::Running,
                            "exited" | "dead" | "stopped" => RunState::Stopped,
                            "created" | "restarting" => RunState::Created,
                            _ => persisted_state,
                        };
                    }
                    Err(RuntimeError::ContainerNotFound(_)) => {
                        container_missing = true;
                    }
                    Err(e) => {
                        warn!("could not query container {}: {}", container_id, e);
                    }
                }
            }

            let name = meta.name.clone();
            if state.is_terminal() || container_missing {
                match self.routes.remove(&name) {
                    Ok(true) => debug!("removed stale route for {}", name),
                    Ok(false) => {}
                    Err(e) => warn!("failed to remove stale route for {}: {}", name, e),
                }
            }

            let run = Run::from_metadata(meta, state);
            if self.store.log_path(&run.id).exists() {
                run.mark_logs_captured();
            }

            debug!("rehydrated run {} ({}) as {}", run.id, run.name, state);
            self.runs.insert(run.id.clone(), Arc::new(run));
        }

        // Any remaining route must belong to a run that is actually running.
        for (name, _) in self.routes.list() {
            let live = self
                .runs
                .iter()
                .any(|r| r.name == name && r.state() == RunState::Running);
            if !live {
                match self.routes.remove(&name) {
                    Ok(true) => debug!("removed orphaned route for {}", name),
                    Ok(false) => {}
                    Err(e) => warn!("failed to remove orphaned route for {}: {}", name, e),
                }
            }
        }

        Ok(())
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// Persist a run's metadata snapshot; post-registration persistence
    /// failures are logged, never fatal.
    fn persist(&self, run: &Run) {
        if let Err(e) = self.store.save_metadata(&run.snapshot_metadata()) {
            warn!("failed to persist metadata for {}: {}", run.id, e);
        }
    }

    fn name_in_use(&self, name: &str) -> bool {
        self.runs
            .iter()
            .any(|r| r.name == name && !r.state().is_terminal())
    }

    fn unique_random_name(&self, id: &str) -> String {
        for _ in 0..32 {
            let name = random_name();
            if !self.name_in_use(&name) {
                return name;
            }
        }
        // The word space is crowded; fall back to a suffix from the id.
        format!("{}-{}", random_name(), &id[4..8])
    }

    async fn refresh_targets(&self, run: &Run) -> Vec<RefreshTarget> {
        let mut targets = Vec::new();
        for grant in &run.grants {
            let dep = Dependency::parse(grant);
            if dep.name == "ssh" || dep.name.starts_with("mcp-") {
                continue;
            }
            let provider = match self.providers.get(&dep.name) {
                Some(provider) => provider,
                None => continue,
            };
            let refresher = match provider.refresher() {
                Some(refresher) => refresher,
                None => continue,
            };
            match self.creds.get(&dep.name).await {
                Ok(credential) => targets.push(RefreshTarget {
                    provider: dep.name,
                    refresher,
                    credential,
                }),
                Err(e) => warn!("skipping refresh for {}: {}", dep.name, e),
            }
        }
        targets
    }
}

/// Agent-specific configuration directories injected into the container.
#[derive(Default)]
struct AgentConfigDirs {
    claude: Option<PathBuf>,
    codex: Option<PathBuf>,
    gemini: Option<PathBuf>,
}

impl AgentConfigDirs {
    fn all(&self) -> Vec<PathBuf> {
        [&self.claude, &self.codex, &self.gemini]
            .into_iter()
            .flatten()
            .cloned()
            .collect()
    }
}

fn prepare_agent_config(
    agent: &str,
    run_id: &str,
    env: &mut HashMap<String, String>,
    mounts: &mut Vec<MountSpec>,
) -> std::io::Result<AgentConfigDirs> {
    let mut dirs = AgentConfigDirs::default();
    let base = std::env::temp_dir();

    let (dir, target, seed_file, seed_content): (PathBuf, &str, &str, &str) = match agent {
        "claude" => (
            base.join(format!("moat-{}-claude", run_id)),
            "/home/moatuser/.claude",
            "settings.json",
            "{}\n",
        ),
        "codex" => (
            base.join(format!("moat-{}-codex", run_id)),
            "/home/moatuser/.codex",
            "config.toml",
            "",
        ),
        "gemini" => (
            base.join(format!("moat-{}-gemini", run_id)),
            "/home/moatuser/.gemini",
            "settings.json",
            "{}\n",
        ),
        _ => return Ok(dirs),
    };

    std::fs::create_dir_all(&dir)?;
    std::fs::write(dir.join(seed_file), seed_content)?;
    mounts.push(MountSpec {
        source: dir.display().to_string(),
        target: target.to_string(),
        read_only: false,
    });
    if agent == "claude" {
        env.insert("CLAUDE_CONFIG_DIR".to_string(), target.to_string());
    }

    match agent {
        "claude" => dirs.claude = Some(dir),
        "codex" => dirs.codex = Some(dir),
        "gemini" => dirs.gemini = Some(dir),
        _ => {}
    }
    Ok(dirs)
}

/// Bind an ephemeral port and hand it out.
fn allocate_host_port() -> std::io::Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

fn remove_dir_quiet(dir: &std::path::Path) {
    if let Err(e) = std::fs::remove_dir_all(dir) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("failed to remove {}: {}", dir.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FirewallConfig;
    use crate::creds::MemoryCredentialStore;
    use crate::runtime::mock::MockRuntime;
    use crate::store::RunMetadata;

    struct Fixture {
        manager: Manager,
        runtime: Arc<MockRuntime>,
        _dir: tempfile::TempDir,
    }

    async fn fixture(runtime: Arc<MockRuntime>) -> Fixture {
        fixture_with(runtime, Config::default(), MemoryCredentialStore::new()).await
    }

    async fn fixture_with(
        runtime: Arc<MockRuntime>,
        mut config: Config,
        creds: MemoryCredentialStore,
    ) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        config.state_dir = dir.path().join("runs");
        config.routes_dir = dir.path().join("routes");
        config.exit_wait_timeout_secs = 5;

        let store = Store::new(&config.state_dir).unwrap();
        let routes = RouteTable::load(&config.routes_dir).unwrap();

        let manager = Manager::new(
            runtime.clone(),
            store,
            routes,
            Arc::new(creds),
            ProviderRegistry::builtin(),
            ServiceRegistry::builtin(),
            Arc::new(config),
        )
        .await
        .unwrap();

        Fixture {
            manager,
            runtime,
            _dir: dir,
        }
    }

    fn workspace_opts(dir: &tempfile::TempDir) -> CreateOptions {
        CreateOptions {
            workspace: dir.path().to_path_buf(),
            agent: "claude".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_assigns_identity_and_persists() {
        let fx = fixture(MockRuntime::new()).await;
        let ws = tempfile::tempdir().unwrap();

        let run = fx.manager.create(workspace_opts(&ws)).await.unwrap();

        assert!(crate::run::resolve::is_run_id(&run.id));
        assert!(!run.name.is_empty());
        assert_eq!(run.state(), RunState::Created);
        assert!(run.container_id().is_some());

        // Metadata landed on disk and the route exists.
        let meta = fx.manager.store.load_metadata(&run.id).unwrap();
        assert_eq!(meta.state, RunState::Created);
        assert!(fx.manager.routes.get(&run.name).is_some());
        assert!(fx.manager.store.audit(&run.id).verify().unwrap());
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate_active_name() {
        let fx = fixture(MockRuntime::new()).await;
        let ws = tempfile::tempdir().unwrap();

        let mut opts = workspace_opts(&ws);
        opts.name = Some("pinned-name".to_string());
        fx.manager.create(opts.clone()).await.unwrap();

        let err = fx.manager.create(opts).await.unwrap_err();
        assert!(matches!(err, RunError::NameInUse(_)));
    }

    #[tokio::test]
    async fn test_terminal_run_frees_its_name() {
        let fx = fixture(MockRuntime::new()).await;
        let ws = tempfile::tempdir().unwrap();

        let mut opts = workspace_opts(&ws);
        opts.name = Some("pinned-name".to_string());
        let first = fx.manager.create(opts.clone()).await.unwrap();
        fx.manager.stop(&first.id).await.unwrap();

        fx.manager.create(opts).await.unwrap();
    }

    #[tokio::test]
    async fn test_dind_create_wires_sidecar_and_env() {
        let fx = fixture(MockRuntime::new()).await;
        let ws = tempfile::tempdir().unwrap();

        let mut opts = workspace_opts(&ws);
        opts.grants = vec!["docker:dind".to_string()];
        let run = fx.manager.create(opts).await.unwrap();

        let specs = fx.runtime.created_specs();
        assert_eq!(specs.len(), 1);
        let spec = &specs[0];

        assert!(spec.privileged);
        assert_eq!(spec.env.get("MOAT_DOCKER_DIND").unwrap(), "1");
        assert!(!spec.env.contains_key("MOAT_DOCKER_GID"));
        assert_eq!(spec.env.get("BUILDKIT_HOST").unwrap(), "tcp://buildkit:1234");
        assert!(spec.group_add.is_empty());
        assert!(!spec.mounts.iter().any(|m| m.target.contains("docker.sock")));

        assert_eq!(
            run.buildkit_container_id().unwrap(),
            format!("moat-buildkit-{}-ctr", run.id)
        );
        let calls = fx.runtime.calls();
        assert!(calls.contains(&format!("create_network:moat-{}", run.id)));
        assert!(calls.contains(&format!("start_buildkit:moat-buildkit-{}", run.id)));
    }

    #[tokio::test]
    async fn test_service_create_injects_env_and_readiness() {
        let fx = fixture(MockRuntime::new()).await;
        let ws = tempfile::tempdir().unwrap();

        let mut opts = workspace_opts(&ws);
        opts.grants = vec!["postgres".to_string()];
        let run = fx.manager.create(opts).await.unwrap();

        let specs = fx.runtime.created_specs();
        let spec = &specs[0];

        assert_eq!(spec.env.get("MOAT_POSTGRES_HOST").unwrap(), "postgres");
        assert_eq!(spec.env.get("MOAT_POSTGRES_PORT").unwrap(), "5432");
        assert_eq!(spec.env.get("MOAT_POSTGRES_USER").unwrap(), "postgres");
        assert_eq!(spec.env.get("MOAT_POSTGRES_DB").unwrap(), "postgres");
        let url = spec.env.get("MOAT_POSTGRES_URL").unwrap();
        assert!(url.starts_with("postgresql://postgres:"));
        assert!(url.ends_with("@postgres:5432/postgres"));

        assert_eq!(run.service_containers().len(), 1);
        assert!(fx
            .runtime
            .calls()
            .contains(&"start_service:postgres".to_string()));
    }

    #[tokio::test]
    async fn test_start_and_stop_lifecycle() {
        let fx = fixture(MockRuntime::new()).await;
        let ws = tempfile::tempdir().unwrap();

        let run = fx.manager.create(workspace_opts(&ws)).await.unwrap();
        fx.manager.start(&run.id).await.unwrap();
        assert_eq!(run.state(), RunState::Running);
        assert!(run.started_at().is_some());

        fx.manager.stop(&run.id).await.unwrap();
        assert!(run.state().is_terminal());
        assert!(run.stopped_at().is_some());
        assert!(run.has_exited());

        // Container was removed, route is gone, logs were captured.
        let container_id = run.container_id().unwrap();
        assert!(fx.runtime.calls().contains(&format!("remove:{}", container_id)));
        assert!(fx.manager.routes.get(&run.name).is_none());
        assert!(fx.manager.store.log_path(&run.id).exists());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_missing_ids_error() {
        let fx = fixture(MockRuntime::new()).await;
        let ws = tempfile::tempdir().unwrap();

        let run = fx.manager.create(workspace_opts(&ws)).await.unwrap();
        fx.manager.start(&run.id).await.unwrap();
        fx.manager.stop(&run.id).await.unwrap();
        fx.manager.stop(&run.id).await.unwrap();

        let err = fx.manager.stop("run_000000000000").await.unwrap_err();
        assert!(matches!(err, RunError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_start_rejects_non_created_runs() {
        let fx = fixture(MockRuntime::new()).await;
        let ws = tempfile::tempdir().unwrap();

        let run = fx.manager.create(workspace_opts(&ws)).await.unwrap();
        fx.manager.start(&run.id).await.unwrap();

        let err = fx.manager.start(&run.id).await.unwrap_err();
        assert!(matches!(err, RunError::NotCreated(_, RunState::Running)));
    }

    #[tokio::test]
    async fn test_failed_start_marks_run_failed() {
        let runtime = MockRuntime::new();
        runtime.state.lock().fail_start = true;
        let fx = fixture(runtime).await;
        let ws = tempfile::tempdir().unwrap();

        let run = fx.manager.create(workspace_opts(&ws)).await.unwrap();
        fx.manager.start(&run.id).await.unwrap_err();

        assert_eq!(run.state(), RunState::Failed);
        assert!(run.stopped_at().is_some());
    }

    #[tokio::test]
    async fn test_firewall_failure_rolls_back_start() {
        let runtime = MockRuntime::new();
        runtime.state.lock().fail_firewall = true;

        let config = Config {
            firewall: FirewallConfig {
                enabled: true,
                proxy_host: "127.0.0.1".to_string(),
                proxy_port: 8642,
                auth_token: None,
            },
            ..Default::default()
        };
        let fx = fixture_with(runtime, config, MemoryCredentialStore::new()).await;
        let ws = tempfile::tempdir().unwrap();

        let run = fx.manager.create(workspace_opts(&ws)).await.unwrap();
        let err = fx.manager.start(&run.id).await.unwrap_err();

        assert!(err.to_string().contains("firewall setup failed"));
        assert_eq!(run.state(), RunState::Failed);

        let container_id = run.container_id().unwrap();
        let calls = fx.runtime.calls();
        assert!(calls.iter().any(|c| c.starts_with(&format!("firewall:{}", container_id))));
        assert!(calls.contains(&format!("stop:{}", container_id)));
    }

    #[tokio::test]
    async fn test_boot_reconciliation_cleans_stale_routes() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().join("runs");
        let routes_dir = dir.path().join("routes");

        // Persisted world: one run believed Running, with a route.
        let store = Store::new(&state_dir).unwrap();
        store
            .save_metadata(&RunMetadata {
                id: "run_aabbccddeeff".to_string(),
                name: "my-agent".to_string(),
                container_id: Some("container-abc".to_string()),
                state: RunState::Running,
                ..Default::default()
            })
            .unwrap();
        let routes = RouteTable::load(&routes_dir).unwrap();
        routes
            .set(
                "my-agent",
                EndpointMap::from([("default".to_string(), "127.0.0.1:8080".to_string())]),
            )
            .unwrap();

        // The runtime says the container actually exited.
        let runtime = MockRuntime::new();
        runtime.set_container_state("container-abc", "exited");

        let config = Config {
            state_dir,
            routes_dir,
            ..Default::default()
        };
        let manager = Manager::new(
            runtime,
            store,
            routes,
            Arc::new(MemoryCredentialStore::new()),
            ProviderRegistry::builtin(),
            ServiceRegistry::builtin(),
            Arc::new(config),
        )
        .await
        .unwrap();

        let run = manager.get("run_aabbccddeeff").unwrap();
        assert_eq!(run.state(), RunState::Stopped);
        assert!(run.stopped_at().is_some());
        assert!(manager.routes.get("my-agent").is_none());
    }

    #[tokio::test]
    async fn test_boot_keeps_routes_for_running_containers() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().join("runs");
        let routes_dir = dir.path().join("routes");

        let store = Store::new(&state_dir).unwrap();
        store
            .save_metadata(&RunMetadata {
                id: "run_aabbccddeeff".to_string(),
                name: "my-agent".to_string(),
                container_id: Some("container-abc".to_string()),
                state: RunState::Running,
                ..Default::default()
            })
            .unwrap();
        let routes = RouteTable::load(&routes_dir).unwrap();
        routes.set("my-agent", EndpointMap::new()).unwrap();

        let runtime = MockRuntime::new();
        runtime.set_container_state("container-abc", "running");

        let config = Config {
            state_dir,
            routes_dir,
            ..Default::default()
        };
        let manager = Manager::new(
            runtime,
            store,
            routes,
            Arc::new(MemoryCredentialStore::new()),
            ProviderRegistry::builtin(),
            ServiceRegistry::builtin(),
            Arc::new(config),
        )
        .await
        .unwrap();

        assert_eq!(
            manager.get("run_aabbccddeeff").unwrap().state(),
            RunState::Running
        );
        assert!(manager.routes.get("my-agent").is_some());
    }

    #[tokio::test]
    async fn test_list_is_newest_first() {
        let fx = fixture(MockRuntime::new()).await;
        let ws = tempfile::tempdir().unwrap();

        let first = fx.manager.create(workspace_opts(&ws)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = fx.manager.create(workspace_opts(&ws)).await.unwrap();

        let listed = fx.manager.list();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, second.id);
        assert_eq!(listed[1].id, first.id);
    }

    #[tokio::test]
    async fn test_resolve_prefers_exact_id() {
        let fx = fixture(MockRuntime::new()).await;
        let ws = tempfile::tempdir().unwrap();

        let run = fx.manager.create(workspace_opts(&ws)).await.unwrap();

        assert_eq!(fx.manager.resolve(&run.id).unwrap().len(), 1);
        assert_eq!(fx.manager.resolve(&run.id[..8]).unwrap().len(), 1);
        assert_eq!(fx.manager.resolve(&run.name).unwrap().len(), 1);
        assert!(fx.manager.resolve("no-such-run").is_err());
    }

    #[tokio::test]
    async fn test_remove_requires_terminal_state() {
        let fx = fixture(MockRuntime::new()).await;
        let ws = tempfile::tempdir().unwrap();

        let run = fx.manager.create(workspace_opts(&ws)).await.unwrap();
        let err = fx.manager.remove(&run.id).await.unwrap_err();
        assert!(matches!(err, RunError::NotTerminal(_, _)));

        fx.manager.stop(&run.id).await.unwrap();
        fx.manager.remove(&run.id).await.unwrap();

        assert!(matches!(
            fx.manager.get(&run.id),
            Err(RunError::NotFound(_))
        ));
        assert!(!fx.manager.store.run_dir(&run.id).exists());
    }

    #[tokio::test]
    async fn test_logs_tail() {
        let fx = fixture(MockRuntime::new()).await;
        let ws = tempfile::tempdir().unwrap();

        let run = fx.manager.create(workspace_opts(&ws)).await.unwrap();
        fx.manager
            .store
            .write_logs(&run.id, b"one\ntwo\nthree\n")
            .unwrap();

        assert_eq!(fx.manager.logs(&run.id, None).unwrap(), "one\ntwo\nthree\n");
        assert_eq!(fx.manager.logs(&run.id, Some(2)).unwrap(), "two\nthree\n");
    }
}
