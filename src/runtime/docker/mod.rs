//! Docker implementation of the runtime seam, backed by bollard.

mod aux;
mod container;
mod runtime;

pub use runtime::DockerRuntime;
