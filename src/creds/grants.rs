//! Grant validation.
//!
//! Every credential grant a run requests must resolve to a registered
//! provider with a retrievable credential before the run is created.
//! Failures are aggregated into a single actionable error so users fix
//! everything in one pass instead of replaying create repeatedly.

use thiserror::Error;

use crate::config::McpServerConfig;
use crate::deps::Dependency;

use super::provider::ProviderRegistry;
use super::store::{CredError, CredentialStore};

#[derive(Debug, Error)]
pub enum GrantError {
    #[error("missing grants:\n{0}")]
    Missing(String),

    #[error("mcp server {server} requires grant {grant}, which was not requested")]
    McpGrantMissing { server: String, grant: String },
}

/// Validate credential grants against the provider registry and vault.
///
/// `ssh` and `mcp-*` grants are validated elsewhere and skipped here.
pub async fn validate_grants(
    grants: &[Dependency],
    providers: &ProviderRegistry,
    store: &dyn CredentialStore,
) -> Result<(), GrantError> {
    let mut failures: Vec<(String, String)> = Vec::new();

    for grant in grants {
        if grant.name == "ssh" || grant.name.starts_with("mcp-") {
            continue;
        }

        if !providers.contains(&grant.name) {
            failures.push((grant.name.clone(), "unknown provider".to_string()));
            continue;
        }

        match store.get(&grant.name).await {
            Ok(_) => {}
            Err(CredError::NotConfigured(_)) => {
                failures.push((grant.name.clone(), "not configured".to_string()));
            }
            Err(CredError::EncryptionKeyChanged) => {
                failures.push((grant.name.clone(), "encryption key changed".to_string()));
            }
            Err(e) => failures.push((grant.name.clone(), e.to_string())),
        }
    }

    if failures.is_empty() {
        return Ok(());
    }

    let details = failures
        .iter()
        .map(|(name, reason)| format!("  {}: {} (run `moat grant {}` to fix)", name, reason, name))
        .collect::<Vec<_>>()
        .join("\n");
    Err(GrantError::Missing(details))
}

/// Every MCP server with an auth spec must have its referenced grant in the
/// run's grant list.
pub fn validate_mcp_grants(
    servers: &[McpServerConfig],
    grants: &[Dependency],
) -> Result<(), GrantError> {
    for server in servers {
        if let Some(auth) = &server.auth {
            let present = grants.iter().any(|g| g.name == auth.grant);
            if !present {
                return Err(GrantError::McpGrantMissing {
                    server: server.name.clone(),
                    grant: auth.grant.clone(),
                });
            }
        }
    }
    Ok(())
}
