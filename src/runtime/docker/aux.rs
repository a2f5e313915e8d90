//! Auxiliary Docker machinery: per-run networks, the BuildKit sidecar, and
//! service containers.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{Config, CreateContainerOptions, RemoveContainerOptions};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{EndpointSettings, HostConfig};
use bollard::network::CreateNetworkOptions;
use bollard::Docker;
use futures_util::StreamExt;
use tracing::{debug, info};

use crate::deps::BuildkitConfig;
use crate::runtime::{NetworkManager, RuntimeError, RuntimeResult, ServiceManager, SidecarManager};
use crate::services::{ServiceConfig, ServiceInfo};

use super::container::ensure_image_exists;

/// Per-run bridge networks.
pub struct DockerNetworkManager {
    client: Docker,
}

impl DockerNetworkManager {
    pub fn new(client: Docker) -> Self {
        Self { client }
    }
}

#[async_trait]
impl NetworkManager for DockerNetworkManager {
    async fn create_network(&self, name: &str) -> RuntimeResult<String> {
        let options = CreateNetworkOptions {
            name,
            driver: "bridge",
            ..Default::default()
        };

        let response = self.client.create_network(options).await?;
        debug!("created network {}", name);
        Ok(response.id.unwrap_or_default())
    }

    async fn remove_network(&self, name: &str) -> RuntimeResult<()> {
        match self.client.remove_network(name).await {
            Ok(_) => {
                debug!("removed network {}", name);
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(RuntimeError::Docker(e)),
        }
    }
}

/// BuildKit sidecar for Docker-in-Docker runs. The sidecar joins the run's
/// network under the `buildkit` alias so `BUILDKIT_HOST=tcp://buildkit:1234`
/// resolves from inside the run container.
pub struct DockerSidecarManager {
    client: Docker,
}

impl DockerSidecarManager {
    pub fn new(client: Docker) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SidecarManager for DockerSidecarManager {
    async fn start_buildkit(&self, config: &BuildkitConfig) -> RuntimeResult<String> {
        ensure_image_exists(&self.client, &config.image).await?;

        let container_config = Config {
            image: Some(config.image.clone()),
            host_config: Some(HostConfig {
                // BuildKit needs privileged mode to run builds.
                privileged: Some(true),
                network_mode: Some(config.network.clone()),
                ..Default::default()
            }),
            networking_config: Some(bollard::container::NetworkingConfig {
                endpoints_config: HashMap::from([(
                    config.network.clone(),
                    EndpointSettings {
                        aliases: Some(vec!["buildkit".to_string()]),
                        ..Default::default()
                    },
                )]),
            }),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: config.container_name.as_str(),
            platform: None,
        };

        let response = self
            .client
            .create_container(Some(options), container_config)
            .await?;
        self.client
            .start_container::<String>(&response.id, None)
            .await?;

        info!("started buildkit sidecar {}", config.container_name);
        Ok(response.id)
    }

    async fn remove(&self, id: &str) -> RuntimeResult<()> {
        remove_forced(&self.client, id).await
    }
}

/// Service containers (postgres, redis, ...) attached to a run's network.
pub struct DockerServiceManager {
    client: Docker,
}

impl DockerServiceManager {
    pub fn new(client: Docker) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ServiceManager for DockerServiceManager {
    async fn start_service(&self, config: &ServiceConfig) -> RuntimeResult<ServiceInfo> {
        ensure_image_exists(&self.client, &config.image).await?;

        let env_vars: Vec<String> = config
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let container_name = format!("moat-{}-{}", config.run_id, config.name);

        // On a shared network the run container reaches the service by its
        // alias, which is the plain service name.
        let networking_config = config.network.as_ref().map(|network| {
            bollard::container::NetworkingConfig {
                endpoints_config: HashMap::from([(
                    network.clone(),
                    EndpointSettings {
                        aliases: Some(vec![config.name.clone()]),
                        ..Default::default()
                    },
                )]),
            }
        });

        let container_config = Config {
            image: Some(config.image.clone()),
            env: Some(env_vars),
            cmd: if config.extra_cmd.is_empty() {
                None
            } else {
                Some(config.extra_cmd.clone())
            },
            labels: Some(HashMap::from([
                ("moat.run-id".to_string(), config.run_id.clone()),
                ("moat.service".to_string(), config.name.clone()),
            ])),
            host_config: Some(HostConfig {
                network_mode: config.network.clone(),
                ..Default::default()
            }),
            networking_config,
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: container_name.as_str(),
            platform: None,
        };

        let response = self
            .client
            .create_container(Some(options), container_config)
            .await?;
        self.client
            .start_container::<String>(&response.id, None)
            .await?;

        info!("started service container {} for {}", container_name, config.name);

        Ok(ServiceInfo {
            host: config.name.clone(),
            container_id: response.id,
            ports: config.ports.clone(),
            env: config.env.clone(),
        })
    }

    async fn check_ready(&self, config: &ServiceConfig, info: &ServiceInfo) -> RuntimeResult<()> {
        if config.readiness_cmd.is_empty() {
            return Ok(());
        }

        let cmd: Vec<&str> = config.readiness_cmd.iter().map(|s| s.as_str()).collect();
        let exec = self
            .client
            .create_exec(
                &info.container_id,
                CreateExecOptions {
                    cmd: Some(cmd),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await?;

        if let StartExecResults::Attached { mut output, .. } =
            self.client.start_exec(&exec.id, None).await?
        {
            while let Some(chunk) = output.next().await {
                if chunk.is_err() {
                    break;
                }
            }
        }

        let inspect = self.client.inspect_exec(&exec.id).await?;
        match inspect.exit_code {
            Some(0) => Ok(()),
            code => Err(RuntimeError::Other(format!(
                "readiness probe for {} exited with {:?}",
                config.name, code
            ))),
        }
    }

    async fn remove_service(&self, id: &str) -> RuntimeResult<()> {
        remove_forced(&self.client, id).await
    }
}

async fn remove_forced(client: &Docker, id: &str) -> RuntimeResult<()> {
    let options = RemoveContainerOptions {
        force: true,
        ..Default::default()
    };

    match client.remove_container(id, Some(options)).await {
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
