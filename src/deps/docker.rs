//! Docker-mode dependency resolution.
//!
//! A run may ask for Docker access in one of two modes: `docker:host`
//! mounts the host Docker socket into the container, `docker:dind` runs the
//! container privileged with its own Docker daemon plus a BuildKit sidecar.
//! The two wirings are mutually exclusive in the produced container spec.

use std::path::Path;

use thiserror::Error;
use tracing::warn;

use crate::runtime::{ContainerSpec, MountSpec, RuntimeKind};

/// Host Docker socket path.
pub const DOCKER_SOCKET: &str = "/var/run/docker.sock";

/// Endpoint the run container uses to reach the BuildKit sidecar.
pub const BUILDKIT_HOST: &str = "tcp://buildkit:1234";

const BUILDKIT_IMAGE: &str = "moby/buildkit:latest";

#[derive(Debug, Error)]
pub enum DepError {
    #[error("docker:host requires the docker runtime: Apple containers cannot access the host Docker socket (retry with `moat run --runtime docker`)")]
    HostRequiresDocker,

    #[error("docker:dind requires the docker runtime: Apple containers do not support privileged mode (retry with `moat run --runtime docker`)")]
    DindRequiresDocker,

    #[error("the docker dependency requires explicit mode: use docker:host or docker:dind")]
    ModeRequired,

    #[error("unknown docker mode {0:?}: use docker:host or docker:dind")]
    UnknownMode(String),

    #[error("cannot stat docker socket {0}: {1}")]
    SocketStat(String, std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DockerMode {
    /// Mount the host Docker socket.
    Host,

    /// Privileged Docker-in-Docker.
    Dind,
}

/// Sidecar configuration for Docker-in-Docker runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildkitConfig {
    pub network: String,
    pub container_name: String,
    pub image: String,
}

impl BuildkitConfig {
    pub fn for_run(run_id: &str) -> Self {
        Self {
            network: format!("moat-{}", run_id),
            container_name: format!("moat-buildkit-{}", run_id),
            image: BUILDKIT_IMAGE.to_string(),
        }
    }
}

/// Resolved Docker access configuration for a run.
#[derive(Debug, Clone)]
pub struct DockerDependencyConfig {
    pub mode: DockerMode,
    pub socket_mount: Option<MountSpec>,
    pub group_id: Option<u32>,
    pub privileged: bool,
    pub buildkit: Option<BuildkitConfig>,
}

impl DockerDependencyConfig {
    /// Wire this configuration into a container spec.
    pub fn apply(&self, spec: &mut ContainerSpec) {
        match self.mode {
            DockerMode::Host => {
                if let Some(mount) = &self.socket_mount {
                    spec.mounts.push(mount.clone());
                }
                if let Some(gid) = self.group_id {
                    spec.group_add.push(gid.to_string());
                    spec.env
                        .insert("MOAT_DOCKER_GID".to_string(), gid.to_string());
                }
            }
            DockerMode::Dind => {
                spec.privileged = true;
                spec.env
                    .insert("MOAT_DOCKER_DIND".to_string(), "1".to_string());
                spec.env
                    .insert("BUILDKIT_HOST".to_string(), BUILDKIT_HOST.to_string());
            }
        }
    }
}

/// Resolve the `docker` dependency from a parsed dependency list.
///
/// Returns `None` when no docker dependency is present, an error when the
/// requested mode cannot work on this runtime, and the resolved
/// configuration otherwise.
pub fn resolve_docker_dependency(
    deps: &[super::Dependency],
    kind: RuntimeKind,
    run_id: &str,
) -> Result<Option<DockerDependencyConfig>, DepError> {
    let dep = match deps.iter().find(|d| d.name == "docker") {
        Some(dep) => dep,
        None => return Ok(None),
    };

    match dep.arg.as_deref() {
        None => Err(DepError::ModeRequired),
        Some("host") => {
            if kind == RuntimeKind::Apple {
                return Err(DepError::HostRequiresDocker);
            }
            resolve_host_mode(Path::new(DOCKER_SOCKET)).map(Some)
        }
        Some("dind") => {
            if kind == RuntimeKind::Apple {
                return Err(DepError::DindRequiresDocker);
            }
            Ok(Some(DockerDependencyConfig {
                mode: DockerMode::Dind,
                socket_mount: None,
                group_id: None,
                privileged: true,
                buildkit: Some(BuildkitConfig::for_run(run_id)),
            }))
        }
        Some(other) => Err(DepError::UnknownMode(other.to_string())),
    }
}

fn resolve_host_mode(socket: &Path) -> Result<DockerDependencyConfig, DepError> {
    let meta = std::fs::metadata(socket)
        .map_err(|e| DepError::SocketStat(socket.display().to_string(), e))?;

    let gid = socket_gid(&meta);

    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;

        if meta.uid() == 0 && gid == 0 {
            warn!(
                "{} is owned by root:root; the run user may not be able to use it",
                socket.display()
            );
        }
        if meta.mode() & 0o060 != 0o060 {
            warn!(
                "{} has unexpected group permissions ({:o}); docker commands inside the run may fail",
                socket.display(),
                meta.mode() & 0o777
            );
        }
    }

    Ok(DockerDependencyConfig {
        mode: DockerMode::Host,
        socket_mount: Some(MountSpec {
            source: socket.display().to_string(),
            target: DOCKER_SOCKET.to_string(),
            read_only: false,
        }),
        group_id: Some(gid),
        privileged: false,
        buildkit: None,
    })
}

#[cfg(unix)]
fn socket_gid(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::MetadataExt;
    meta.gid()
}

#[cfg(not(unix))]
fn socket_gid(_meta: &std::fs::Metadata) -> u32 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deps::Dependency;

    fn deps(s: &str) -> Vec<Dependency> {
        vec![Dependency::parse(s)]
    }

    #[test]
    fn test_no_docker_dependency() {
        let deps = vec![Dependency::parse("postgres")];
        let config =
            resolve_docker_dependency(&deps, RuntimeKind::Docker, "run_aabbccddeeff").unwrap();
        assert!(config.is_none());
    }

    #[test]
    fn test_mode_required() {
        let err = resolve_docker_dependency(&deps("docker"), RuntimeKind::Docker, "run_a")
            .unwrap_err();
        assert!(matches!(err, DepError::ModeRequired));
    }

    #[test]
    fn test_unknown_mode() {
        let err = resolve_docker_dependency(&deps("docker:weird"), RuntimeKind::Docker, "run_a")
            .unwrap_err();
        assert!(matches!(err, DepError::UnknownMode(m) if m == "weird"));
    }

    #[test]
    fn test_apple_rejects_host_mode() {
        let err = resolve_docker_dependency(&deps("docker:host"), RuntimeKind::Apple, "run_a")
            .unwrap_err();
        assert!(matches!(err, DepError::HostRequiresDocker));
        assert!(err.to_string().contains("moat run --runtime docker"));
    }

    #[test]
    fn test_apple_rejects_dind_mode() {
        let err = resolve_docker_dependency(&deps("docker:dind"), RuntimeKind::Apple, "run_a")
            .unwrap_err();
        assert!(matches!(err, DepError::DindRequiresDocker));
        assert!(err.to_string().contains("moat run --runtime docker"));
    }

    #[test]
    fn test_dind_mode_config() {
        let config =
            resolve_docker_dependency(&deps("docker:dind"), RuntimeKind::Docker, "run_aabbccddeeff")
                .unwrap()
                .unwrap();

        assert_eq!(config.mode, DockerMode::Dind);
        assert!(config.privileged);
        assert!(config.socket_mount.is_none());
        assert!(config.group_id.is_none());

        let buildkit = config.buildkit.unwrap();
        assert_eq!(buildkit.network, "moat-run_aabbccddeeff");
        assert_eq!(buildkit.container_name, "moat-buildkit-run_aabbccddeeff");
        assert_eq!(buildkit.image, "moby/buildkit:latest");
    }

    #[test]
    fn test_host_mode_resolves_socket() {
        // Use any stat-able path as the socket stand-in.
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("docker.sock");
        std::fs::write(&sock, b"").unwrap();

        let config = resolve_host_mode(&sock).unwrap();
        assert_eq!(config.mode, DockerMode::Host);
        assert!(!config.privileged);
        assert!(config.buildkit.is_none());
        assert!(config.group_id.is_some());

        let mount = config.socket_mount.unwrap();
        assert_eq!(mount.source, sock.display().to_string());
        assert_eq!(mount.target, DOCKER_SOCKET);
        assert!(!mount.read_only);
    }

    #[test]
    fn test_host_mode_missing_socket() {
        let err = resolve_host_mode(Path::new("/nonexistent/docker.sock")).unwrap_err();
        assert!(matches!(err, DepError::SocketStat(_, _)));
    }

    #[test]
    fn test_apply_host_wiring() {
        let config = DockerDependencyConfig {
            mode: DockerMode::Host,
            socket_mount: Some(MountSpec {
                source: DOCKER_SOCKET.to_string(),
                target: DOCKER_SOCKET.to_string(),
                read_only: false,
            }),
            group_id: Some(999),
            privileged: false,
            buildkit: None,
        };

        let mut spec = ContainerSpec::default();
        config.apply(&mut spec);

        assert_eq!(spec.mounts.len(), 1);
        assert_eq!(spec.mounts[0].source, DOCKER_SOCKET);
        assert_eq!(spec.mounts[0].target, DOCKER_SOCKET);
        assert!(!spec.mounts[0].read_only);
        assert_eq!(spec.group_add, vec!["999".to_string()]);
        assert_eq!(spec.env.get("MOAT_DOCKER_GID").unwrap(), "999");
        assert!(!spec.env.contains_key("MOAT_DOCKER_DIND"));
        assert!(!spec.privileged);
    }

    #[test]
    fn test_apply_dind_wiring() {
        let config = DockerDependencyConfig {
            mode: DockerMode::Dind,
            socket_mount: None,
            group_id: None,
            privileged: true,
            buildkit: Some(BuildkitConfig::for_run("run_aabbccddeeff")),
        };

        let mut spec = ContainerSpec::default();
        config.apply(&mut spec);

        assert!(spec.mounts.is_empty());
        assert!(spec.group_add.is_empty());
        assert_eq!(spec.env.get("MOAT_DOCKER_DIND").unwrap(), "1");
        assert!(!spec.env.contains_key("MOAT_DOCKER_GID"));
        assert_eq!(spec.env.get("BUILDKIT_HOST").unwrap(), "tcp://buildkit:1234");
        assert!(spec.privileged);
    }
}
