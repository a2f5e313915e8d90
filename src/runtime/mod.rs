//! Container runtime abstraction and its Docker implementation.

pub mod docker;
mod traits;
mod user;

#[cfg(test)]
pub mod mock;

pub use docker::DockerRuntime;
pub use traits::{
    AttachStreams, BuildManager, ContainerSpec, LogStream, MountSpec, NetworkManager, Runtime,
    RuntimeError, RuntimeKind, RuntimeResult, ServiceManager, SidecarManager,
};
pub use user::{user_for_workspace, IMAGE_USER_UID};
