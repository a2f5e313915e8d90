//! Service containers attached to runs (postgres, redis, ...).

mod orchestrator;
mod registry;

pub use orchestrator::{
    generate_password, provision, service_env, ProvisionedService, ServiceConfig, ServiceError,
    ServiceInfo,
};
pub use registry::{ServiceRegistry, ServiceSpec};
