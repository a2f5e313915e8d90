//! Credential brokering: grant validation, provider registry, the per-run
//! refresh loop, and the helper machinery injected into run containers.

mod grants;
mod helper;
mod provider;
mod proxy;
mod refresh;
mod ssh_agent;
mod store;

pub use grants::{validate_grants, validate_mcp_grants, GrantError};
pub use helper::{helper_binary, install_helper};
pub use provider::{
    Provider, ProviderRegistry, ProviderSetup, Refresher, SetupContext,
};
pub use proxy::ProxyHandle;
pub use refresh::{spawn_refresh_loop, RefreshTarget, REFRESH_RETRY_MAX, REFRESH_RETRY_MIN};
pub use ssh_agent::SshAgentHandle;
pub use store::{
    is_revoked, CredError, Credential, CredentialStore, FileCredentialStore, MemoryCredentialStore,
    TokenRevoked,
};
