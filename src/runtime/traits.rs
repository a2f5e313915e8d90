//! Container runtime trait definitions.
//!
//! The run manager is agnostic of the underlying container technology; all
//! container operations go through [`Runtime`] and its narrow sub-seams for
//! networks, sidecars, and service containers.

use std::collections::HashMap;
use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::deps::BuildkitConfig;
use crate::services::{ServiceConfig, ServiceInfo};

/// Error type for runtime operations.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("container not found: {0}")]
    ContainerNotFound(String),

    #[error("container already exists: {0}")]
    ContainerExists(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation timed out")]
    Timeout,

    #[error("unsupported on the {0} runtime: {1}")]
    Unsupported(RuntimeKind, String),

    #[error("{0}")]
    Other(String),
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Which container backend a runtime speaks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    Docker,
    Apple,
}

impl std::fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeKind::Docker => write!(f, "docker"),
            RuntimeKind::Apple => write!(f, "apple"),
        }
    }
}

impl std::str::FromStr for RuntimeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "docker" => Ok(RuntimeKind::Docker),
            "apple" => Ok(RuntimeKind::Apple),
            other => Err(format!("unknown runtime {:?}: use docker or apple", other)),
        }
    }
}

/// Bind mount into the run container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    /// Source path on host.
    pub source: String,

    /// Target path in container.
    pub target: String,

    /// Read-only mount.
    pub read_only: bool,
}

/// Everything needed to create the run container.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    /// Container name.
    pub name: String,

    /// Image reference.
    pub image: String,

    /// Command tokens; empty keeps the image default.
    pub cmd: Vec<String>,

    /// Environment variables.
    pub env: HashMap<String, String>,

    /// Bind mounts.
    pub mounts: Vec<MountSpec>,

    /// Supplementary groups (numeric, as strings).
    pub group_add: Vec<String>,

    /// Privileged mode. Only set for Docker-in-Docker runs.
    pub privileged: bool,

    /// Container user ("uid:gid"); empty keeps the image default.
    pub user: String,

    /// Container labels.
    pub labels: HashMap<String, String>,

    /// Container port to host port.
    pub port_bindings: HashMap<u16, u16>,

    /// Docker network to join, if any.
    pub network: Option<String>,

    /// Working directory inside the container.
    pub workdir: Option<String>,

    /// Keep stdin open for interactive runs.
    pub interactive: bool,

    /// Allocate a TTY.
    pub tty: bool,
}

/// Streamed container output chunks.
pub type LogStream = Pin<Box<dyn Stream<Item = RuntimeResult<bytes::Bytes>> + Send>>;

/// Attached container I/O.
pub struct AttachStreams {
    pub output: Box<dyn AsyncRead + Send + Unpin>,
    pub input: Box<dyn AsyncWrite + Send + Unpin>,
}

/// Container runtime interface.
#[async_trait]
pub trait Runtime: Send + Sync {
    fn kind(&self) -> RuntimeKind;

    async fn ping(&self) -> RuntimeResult<()>;

    /// Create the container and return its id. Pulls the image if missing.
    async fn create_container(&self, spec: &ContainerSpec) -> RuntimeResult<String>;

    async fn start_container(&self, id: &str) -> RuntimeResult<()>;

    async fn stop_container(&self, id: &str) -> RuntimeResult<()>;

    /// Block until the container exits; returns its exit code.
    async fn wait_container(&self, id: &str) -> RuntimeResult<i64>;

    async fn remove_container(&self, id: &str) -> RuntimeResult<()>;

    /// Runtime-reported state string ("running", "exited", ...).
    async fn container_state(&self, id: &str) -> RuntimeResult<String>;

    /// Follow container output as a stream.
    async fn container_logs(&self, id: &str, follow: bool) -> RuntimeResult<LogStream>;

    /// Fetch the complete container output in one shot.
    async fn container_logs_all(&self, id: &str) -> RuntimeResult<Vec<u8>>;

    /// Container port to bound host port, as reported by the runtime.
    async fn port_bindings(&self, id: &str) -> RuntimeResult<HashMap<u16, u16>>;

    /// Address at which published ports are reachable from the host.
    fn host_address(&self) -> String;

    fn supports_host_network(&self) -> bool;

    /// Install egress rules so the container can only reach the credential
    /// proxy and DNS.
    async fn setup_firewall(
        &self,
        id: &str,
        proxy_host: &str,
        proxy_port: u16,
    ) -> RuntimeResult<()>;

    async fn attach(&self, id: &str) -> RuntimeResult<AttachStreams>;

    async fn resize_tty(&self, id: &str, width: u16, height: u16) -> RuntimeResult<()>;

    fn networks(&self) -> &dyn NetworkManager;

    fn sidecars(&self) -> &dyn SidecarManager;

    fn services(&self) -> &dyn ServiceManager;

    fn builds(&self) -> &dyn BuildManager;
}

/// Image availability. Building images belongs to the image builder; runs
/// only need their image present before the container is created.
#[async_trait]
pub trait BuildManager: Send + Sync {
    /// Make sure the image is available locally, pulling it if missing.
    async fn ensure_image(&self, image: &str) -> RuntimeResult<()>;
}

/// Per-run network management.
#[async_trait]
pub trait NetworkManager: Send + Sync {
    /// Create a network and return its id.
    async fn create_network(&self, name: &str) -> RuntimeResult<String>;

    async fn remove_network(&self, name: &str) -> RuntimeResult<()>;
}

/// BuildKit sidecar management for Docker-in-Docker runs.
#[async_trait]
pub trait SidecarManager: Send + Sync {
    /// Start the BuildKit sidecar and return its container id.
    async fn start_buildkit(&self, config: &BuildkitConfig) -> RuntimeResult<String>;

    async fn remove(&self, id: &str) -> RuntimeResult<()>;
}

/// Service container management (postgres, redis, ...).
#[async_trait]
pub trait ServiceManager: Send + Sync {
    /// Launch a service container and report how to reach it.
    async fn start_service(&self, config: &ServiceConfig) -> RuntimeResult<ServiceInfo>;

    /// Probe whether the service is ready to accept connections.
    async fn check_ready(&self, config: &ServiceConfig, info: &ServiceInfo) -> RuntimeResult<()>;

    async fn remove_service(&self, id: &str) -> RuntimeResult<()>;
}
