//! Docker runtime: the [`Runtime`] trait over bollard.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, LogsOptions, RemoveContainerOptions,
    ResizeContainerTtyOptions, StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::Docker;
use futures_util::StreamExt;
use tracing::{debug, info};

use crate::runtime::{
    AttachStreams, BuildManager, ContainerSpec, LogStream, NetworkManager, Runtime, RuntimeError,
    RuntimeKind, RuntimeResult, ServiceManager, SidecarManager,
};

use super::aux::{DockerNetworkManager, DockerServiceManager, DockerSidecarManager};
use super::container;

/// Docker implementation of the runtime seam.
pub struct DockerRuntime {
    client: Docker,
    networks: DockerNetworkManager,
    sidecars: DockerSidecarManager,
    services: DockerServiceManager,
}

impl DockerRuntime {
    /// Connect with the local platform defaults (unix socket on Linux).
    pub fn connect() -> RuntimeResult<Self> {
        let client = Docker::connect_with_local_defaults()?;
        Ok(Self::with_client(client))
    }

    pub fn with_client(client: Docker) -> Self {
        Self {
            networks: DockerNetworkManager::new(client.clone()),
            sidecars: DockerSidecarManager::new(client.clone()),
            services: DockerServiceManager::new(client.clone()),
            client,
        }
    }

    fn not_found(id: &str, e: bollard::errors::Error) -> RuntimeError {
        if let bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } = e
        {
            RuntimeError::ContainerNotFound(id.to_string())
        } else {
            RuntimeError::Docker(e)
        }
    }
}

#[async_trait]
impl Runtime for DockerRuntime {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Docker
    }

    async fn ping(&self) -> RuntimeResult<()> {
        self.client.ping().await?;
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> RuntimeResult<String> {
        container::create_container(&self.client, spec).await
    }

    async fn start_container(&self, id: &str) -> RuntimeResult<()> {
        self.client
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| Self::not_found(id, e))?;
        info!("started container {}", id);
        Ok(())
    }

    async fn stop_container(&self, id: &str) -> RuntimeResult<()> {
        match self
            .client
            .stop_container(id, Some(StopContainerOptions { t: 30 }))
            .await
        {
            Ok(_) => Ok(()),
            // Already stopped or already gone is fine for our callers.
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304 | 404,
                ..
            }) => Ok(()),
            Err(e) => Err(RuntimeError::Docker(e)),
        }
    }

    async fn wait_container(&self, id: &str) -> RuntimeResult<i64> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };

        let mut stream = self.client.wait_container(id, Some(options));
        match stream.next().await {
            Some(Ok(response)) => {
                debug!("container {} exited with code {}", id, response.status_code);
                Ok(response.status_code)
            }
            Some(Err(e)) => Err(Self::not_found(id, e)),
            None => Err(RuntimeError::Other(format!(
                "wait stream for container {} ended without a result",
                id
            ))),
        }
    }

    async fn remove_container(&self, id: &str) -> RuntimeResult<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        match self.client.remove_container(id, Some(options)).await {
            Ok(_) => {
                debug!("removed container {}", id);
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(RuntimeError::Docker(e)),
        }
    }

    async fn container_state(&self, id: &str) -> RuntimeResult<String> {
        let info = self
            .client
            .inspect_container(id, None)
            .await
            .map_err(|e| Self::not_found(id, e))?;

        Ok(info
            .state
            .and_then(|s| s.status)
            .map(|s| s.to_string())
            .unwrap_or_else(|| "unknown".to_string()))
    }

    async fn container_logs(&self, id: &str, follow: bool) -> RuntimeResult<LogStream> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow,
            tail: "all".to_string(),
            ..Default::default()
        };

        let stream = self
            .client
            .logs(id, Some(options))
            .map(|item| item.map(|out| out.into_bytes()).map_err(RuntimeError::Docker));
        Ok(Box::pin(stream))
    }

    async fn container_logs_all(&self, id: &str) -> RuntimeResult<Vec<u8>> {
        let mut stream = self.container_logs(id, false).await?;
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }

    async fn port_bindings(&self, id: &str) -> RuntimeResult<HashMap<u16, u16>> {
        let info = self
            .client
            .inspect_container(id, None)
            .await
            .map_err(|e| Self::not_found(id, e))?;

        let mut bindings = HashMap::new();
        if let Some(ports) = info.network_settings.and_then(|n| n.ports) {
            for (key, value) in ports {
                let container_port = match key.split('/').next().and_then(|p| p.parse().ok()) {
                    Some(p) => p,
                    None => continue,
                };
                let host_port = value
                    .and_then(|v| v.into_iter().next())
                    .and_then(|b| b.host_port)
                    .and_then(|p| p.parse().ok());
                if let Some(host_port) = host_port {
                    bindings.insert(container_port, host_port);
                }
            }
        }
        Ok(bindings)
    }

    fn host_address(&self) -> String {
        "127.0.0.1".to_string()
    }

    fn supports_host_network(&self) -> bool {
        cfg!(target_os = "linux")
    }

    async fn setup_firewall(
        &self,
        id: &str,
        proxy_host: &str,
        proxy_port: u16,
    ) -> RuntimeResult<()> {
        // Default-deny egress; allow loopback, DNS, and the credential proxy.
        let script = format!(
            "iptables -P OUTPUT DROP \
             && iptables -A OUTPUT -o lo -j ACCEPT \
             && iptables -A OUTPUT -p udp --dport 53 -j ACCEPT \
             && iptables -A OUTPUT -p tcp -d {host} --dport {port} -j ACCEPT \
             && iptables -A OUTPUT -m state --state ESTABLISHED,RELATED -j ACCEPT",
            host = proxy_host,
            port = proxy_port,
        );

        let exec = self
            .client
            .create_exec(
                id,
                CreateExecOptions {
                    cmd: Some(vec!["/bin/sh", "-c", script.as_str()]),
                    user: Some("root"),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| Self::not_found(id, e))?;

        if let StartExecResults::Attached { mut output, .. } =
            self.client.start_exec(&exec.id, None).await?
        {
            while let Some(chunk) = output.next().await {
                if let Ok(chunk) = chunk {
                    debug!("firewall setup: {}", String::from_utf8_lossy(&chunk.into_bytes()));
                }
            }
        }

        let inspect = self.client.inspect_exec(&exec.id).await?;
        match inspect.exit_code {
            Some(0) | None => Ok(()),
            Some(code) => Err(RuntimeError::Other(format!(
                "firewall rules exited with code {}",
                code
            ))),
        }
    }

    async fn attach(&self, id: &str) -> RuntimeResult<AttachStreams> {
        let options = AttachContainerOptions::<String> {
            stdin: Some(true),
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            logs: Some(false),
            ..Default::default()
        };

        let AttachContainerResults { output, input } = self
            .client
            .attach_container(id, Some(options))
            .await
            .map_err(|e| Self::not_found(id, e))?;

        // Flatten the demultiplexed log stream into raw bytes.
        let reader = tokio_util::io::StreamReader::new(output.map(|item| {
            item.map(|out| out.into_bytes())
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
        }));

        Ok(AttachStreams {
            output: Box::new(reader),
            input: Box::new(input),
        })
    }

    async fn resize_tty(&self, id: &str, width: u16, height: u16) -> RuntimeResult<()> {
        self.client
            .resize_container_tty(
                id,
                ResizeContainerTtyOptions {
                    width,
                    height,
                },
            )
            .await
            .map_err(|e| Self::not_found(id, e))?;
        Ok(())
    }

    fn networks(&self) -> &dyn NetworkManager {
        &self.networks
    }

    fn sidecars(&self) -> &dyn SidecarManager {
        &self.sidecars
    }

    fn services(&self) -> &dyn ServiceManager {
        &self.services
    }

    fn builds(&self) -> &dyn BuildManager {
        self
    }
}

#[async_trait]
impl BuildManager for DockerRuntime {
    async fn ensure_image(&self, image: &str) -> RuntimeResult<()> {
        container::ensure_image_exists(&self.client, image).await
    }
}
