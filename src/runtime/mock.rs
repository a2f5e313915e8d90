//! Scriptable in-memory runtime for tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::deps::BuildkitConfig;
use crate::services::{ServiceConfig, ServiceInfo};

use super::{
    AttachStreams, BuildManager, ContainerSpec, LogStream, NetworkManager, Runtime, RuntimeError,
    RuntimeKind, RuntimeResult, ServiceManager, SidecarManager,
};

#[derive(Default)]
pub struct MockState {
    pub calls: Vec<String>,
    pub created: Vec<ContainerSpec>,
    pub container_states: HashMap<String, String>,
    pub finished: HashMap<String, i64>,
    pub logs: HashMap<String, Vec<u8>>,
    pub fail_firewall: bool,
    pub fail_start: bool,
    pub ready_after: u32,
    pub ready_attempts: u32,
    next_id: u32,
}

/// In-memory [`Runtime`] that records every call and lets tests script
/// container lifecycles.
pub struct MockRuntime {
    kind: RuntimeKind,
    pub state: Mutex<MockState>,
    exit_notify: Notify,
}

impl MockRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            kind: RuntimeKind::Docker,
            state: Mutex::new(MockState::default()),
            exit_notify: Notify::new(),
        })
    }

    pub fn apple() -> Arc<Self> {
        Arc::new(Self {
            kind: RuntimeKind::Apple,
            state: Mutex::new(MockState::default()),
            exit_notify: Notify::new(),
        })
    }

    /// Mark a container as exited; unblocks any `wait_container` callers.
    pub fn finish_container(&self, id: &str, exit_code: i64) {
        {
            let mut state = self.state.lock();
            state.finished.insert(id.to_string(), exit_code);
            state
                .container_states
                .insert(id.to_string(), "exited".to_string());
        }
        self.exit_notify.notify_waiters();
    }

    pub fn set_container_state(&self, id: &str, container_state: &str) {
        self.state
            .lock()
            .container_states
            .insert(id.to_string(), container_state.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn created_specs(&self) -> Vec<ContainerSpec> {
        self.state.lock().created.clone()
    }

    fn record(&self, call: String) {
        self.state.lock().calls.push(call);
    }
}

#[async_trait]
impl Runtime for MockRuntime {
    fn kind(&self) -> RuntimeKind {
        self.kind
    }

    async fn ping(&self) -> RuntimeResult<()> {
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> RuntimeResult<String> {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = format!("ctr-{}", state.next_id);
        state.calls.push(format!("create:{}", id));
        state.created.push(spec.clone());
        state
            .container_states
            .insert(id.clone(), "created".to_string());
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> RuntimeResult<()> {
        let fail = {
            let mut state = self.state.lock();
            state.calls.push(format!("start:{}", id));
            state.fail_start
        };
        if fail {
            return Err(RuntimeError::Other("start refused".to_string()));
        }
        self.set_container_state(id, "running");
        Ok(())
    }

    async fn stop_container(&self, id: &str) -> RuntimeResult<()> {
        self.record(format!("stop:{}", id));
        self.finish_container(id, 0);
        Ok(())
    }

    async fn wait_container(&self, id: &str) -> RuntimeResult<i64> {
        loop {
            let notified = self.exit_notify.notified();
            if let Some(code) = self.state.lock().finished.get(id).copied() {
                return Ok(code);
            }
            notified.await;
        }
    }

    async fn remove_container(&self, id: &str) -> RuntimeResult<()> {
        self.record(format!("remove:{}", id));
        Ok(())
    }

    async fn container_state(&self, id: &str) -> RuntimeResult<String> {
        match self.state.lock().container_states.get(id) {
            Some(s) => Ok(s.clone()),
            None => Err(RuntimeError::ContainerNotFound(id.to_string())),
        }
    }

    async fn container_logs(&self, _id: &str, _follow: bool) -> RuntimeResult<LogStream> {
        Ok(Box::pin(futures_util::stream::empty()))
    }

    async fn container_logs_all(&self, id: &str) -> RuntimeResult<Vec<u8>> {
        let mut state = self.state.lock();
        state.calls.push(format!("logs_all:{}", id));
        Ok(state
            .logs
            .get(id)
            .cloned()
            .unwrap_or_else(|| b"mock output\n".to_vec()))
    }

    async fn port_bindings(&self, _id: &str) -> RuntimeResult<HashMap<u16, u16>> {
        Ok(HashMap::new())
    }

    fn host_address(&self) -> String {
        "127.0.0.1".to_string()
    }

    fn supports_host_network(&self) -> bool {
        true
    }

    async fn setup_firewall(
        &self,
        id: &str,
        proxy_host: &str,
        proxy_port: u16,
    ) -> RuntimeResult<()> {
        let fail = {
            let mut state = self.state.lock();
            state
                .calls
                .push(format!("firewall:{}:{}:{}", id, proxy_host, proxy_port));
            state.fail_firewall
        };
        if fail {
            return Err(RuntimeError::Other("iptables rules rejected".to_string()));
        }
        Ok(())
    }

    async fn attach(&self, _id: &str) -> RuntimeResult<AttachStreams> {
        Err(RuntimeError::Unsupported(
            self.kind,
            "attach is not available in tests".to_string(),
        ))
    }

    async fn resize_tty(&self, _id: &str, _width: u16, _height: u16) -> RuntimeResult<()> {
        Ok(())
    }

    fn networks(&self) -> &dyn NetworkManager {
        self
    }

    fn sidecars(&self) -> &dyn SidecarManager {
        self
    }

    fn services(&self) -> &dyn ServiceManager {
        self
    }

    fn builds(&self) -> &dyn BuildManager {
        self
    }
}

#[async_trait]
impl BuildManager for MockRuntime {
    async fn ensure_image(&self, image: &str) -> RuntimeResult<()> {
        self.record(format!("ensure_image:{}", image));
        Ok(())
    }
}

#[async_trait]
impl NetworkManager for MockRuntime {
    async fn create_network(&self, name: &str) -> RuntimeResult<String> {
        self.record(format!("create_network:{}", name));
        Ok(format!("net-{}", name))
    }

    async fn remove_network(&self, name: &str) -> RuntimeResult<()> {
        self.record(format!("remove_network:{}", name));
        Ok(())
    }
}

#[async_trait]
impl SidecarManager for MockRuntime {
    async fn start_buildkit(&self, config: &BuildkitConfig) -> RuntimeResult<String> {
        self.record(format!("start_buildkit:{}", config.container_name));
        Ok(format!("{}-ctr", config.container_name))
    }

    async fn remove(&self, id: &str) -> RuntimeResult<()> {
        self.record(format!("remove_sidecar:{}", id));
        Ok(())
    }
}

#[async_trait]
impl ServiceManager for MockRuntime {
    async fn start_service(&self, config: &ServiceConfig) -> RuntimeResult<ServiceInfo> {
        self.record(format!("start_service:{}", config.name));
        Ok(ServiceInfo {
            host: config.name.clone(),
            container_id: format!("svc-{}-{}", config.run_id, config.name),
            ports: config.ports.clone(),
            env: config.env.clone(),
        })
    }

    async fn check_ready(&self, config: &ServiceConfig, _info: &ServiceInfo) -> RuntimeResult<()> {
        let mut state = self.state.lock();
        state.ready_attempts += 1;
        if state.ready_attempts > state.ready_after {
            Ok(())
        } else {
            Err(RuntimeError::Other(format!(
                "{} is still starting",
                config.name
            )))
        }
    }

    async fn remove_service(&self, id: &str) -> RuntimeResult<()> {
        self.record(format!("remove_service:{}", id));
        Ok(())
    }
}
