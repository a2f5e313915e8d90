//! Run container creation.

use std::collections::HashMap;

use bollard::container::{Config, CreateContainerOptions};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, Mount, MountTypeEnum, PortBinding, RestartPolicy, RestartPolicyNameEnum};
use bollard::Docker;
use futures_util::StreamExt;
use tracing::{debug, error, info};

use crate::runtime::{ContainerSpec, RuntimeError, RuntimeResult};

/// Create the run container with all configuration applied; returns its id.
pub async fn create_container(client: &Docker, spec: &ContainerSpec) -> RuntimeResult<String> {
    ensure_image_exists(client, &spec.image).await?;

    let env_vars: Vec<String> = spec
        .env
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();

    let mut exposed_ports = HashMap::new();
    let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
    for (container_port, host_port) in &spec.port_bindings {
        let key = format!("{}/tcp", container_port);
        exposed_ports.insert(key.clone(), HashMap::new());
        port_bindings.insert(
            key,
            Some(vec![PortBinding {
                host_ip: Some("127.0.0.1".to_string()),
                host_port: Some(host_port.to_string()),
            }]),
        );
    }

    let mounts: Vec<Mount> = spec
        .mounts
        .iter()
        .map(|m| Mount {
            target: Some(m.target.clone()),
            source: Some(m.source.clone()),
            typ: Some(MountTypeEnum::BIND),
            read_only: Some(m.read_only),
            ..Default::default()
        })
        .collect();

    let host_config = HostConfig {
        port_bindings: Some(port_bindings),
        mounts: Some(mounts),
        group_add: if spec.group_add.is_empty() {
            None
        } else {
            Some(spec.group_add.clone())
        },
        privileged: Some(spec.privileged),
        network_mode: spec.network.clone(),
        restart_policy: Some(RestartPolicy {
            name: Some(RestartPolicyNameEnum::NO),
            ..Default::default()
        }),
        ..Default::default()
    };

    let container_config = Config {
        image: Some(spec.image.clone()),
        cmd: if spec.cmd.is_empty() {
            None
        } else {
            Some(spec.cmd.clone())
        },
        env: Some(env_vars),
        user: if spec.user.is_empty() {
            None
        } else {
            Some(spec.user.clone())
        },
        labels: Some(spec.labels.clone()),
        exposed_ports: Some(exposed_ports),
        working_dir: spec.workdir.clone(),
        attach_stdin: Some(spec.interactive),
        open_stdin: Some(spec.interactive),
        stdin_once: Some(false),
        tty: Some(spec.tty),
        host_config: Some(host_config),
        ..Default::default()
    };

    let options = CreateContainerOptions {
        name: spec.name.as_str(),
        platform: None,
    };

    let response = client
        .create_container(Some(options), container_config)
        .await
        .map_err(|e| {
            if let bollard::errors::Error::DockerResponseServerError {
                status_code: 409, ..
            } = e
            {
                return RuntimeError::ContainerExists(spec.name.clone());
            }
            RuntimeError::Docker(e)
        })?;

    info!("created container {} ({})", spec.name, response.id);
    Ok(response.id)
}

/// Ensure the image exists locally, pulling it if necessary.
pub async fn ensure_image_exists(client: &Docker, image: &str) -> RuntimeResult<()> {
    match client.inspect_image(image).await {
        Ok(_) => {
            debug!("image {} already present", image);
            return Ok(());
        }
        Err(bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        }) => {
            info!("image {} not found, pulling", image);
        }
        Err(e) => return Err(RuntimeError::Docker(e)),
    }

    let options = CreateImageOptions {
        from_image: image,
        ..Default::default()
    };

    let mut stream = client.create_image(Some(options), None, None);
    while let Some(result) = stream.next().await {
        match result {
            Ok(progress) => {
                if let Some(status) = progress.status {
                    debug!("pull {}: {}", image, status);
                }
            }
            Err(e) => {
                error!("failed to pull image {}: {}", image, e);
                return Err(RuntimeError::Docker(e));
            }
        }
    }

    info!("pulled image {}", image);
    Ok(())
}
