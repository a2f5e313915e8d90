//! Credential providers.
//!
//! A provider encapsulates one credential type (GitHub, AWS, ...) behind a
//! narrow capability surface: optional container setup, an optional
//! stopped hook, and an optional refresher. New providers register under a
//! name; the manager never matches on concrete types.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::runtime::MountSpec;

use super::helper::install_helper;
use super::store::{Credential, CredentialStore, TokenRevoked};

/// Context handed to a provider's setup hook.
pub struct SetupContext<'a> {
    pub run_id: &'a str,
    pub workspace: &'a Path,

    /// Per-run scratch directory the provider may populate; anything it
    /// creates there is cleaned up when the run stops.
    pub scratch_dir: PathBuf,

    /// Credential proxy endpoint, when one is configured.
    pub proxy_url: Option<String>,
    pub proxy_token: Option<String>,
}

/// What a provider contributes to the run container.
#[derive(Default)]
pub struct ProviderSetup {
    pub env: HashMap<String, String>,
    pub mounts: Vec<MountSpec>,
    pub cleanup_path: Option<PathBuf>,
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Prepare injected material for the run container.
    async fn setup(
        &self,
        _ctx: &SetupContext<'_>,
        _store: &dyn CredentialStore,
    ) -> anyhow::Result<ProviderSetup> {
        Ok(ProviderSetup::default())
    }

    /// Invoked once when the run reaches a terminal state.
    async fn on_stopped(&self, _run_id: &str) {}

    fn refresher(&self) -> Option<Arc<dyn Refresher>> {
        None
    }
}

/// Periodic token refresh for a provider.
#[async_trait]
pub trait Refresher: Send + Sync {
    fn refresh_interval(&self) -> Duration;

    /// Exchange the current credential for a fresh one. Errors wrapping
    /// [`TokenRevoked`] are permanent.
    async fn refresh(&self, cred: &Credential) -> anyhow::Result<Credential>;
}

/// Named provider registry.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in github and aws providers.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(GithubProvider::new()));
        registry.register(Arc::new(AwsProvider));
        registry
    }

    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        self.providers
            .insert(provider.name().to_string(), provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }
}

// ============================================================================
// GitHub
// ============================================================================

const GITHUB_TOKEN_URL: &str = "https://github.com/login/oauth/access_token";
const GITHUB_REFRESH_INTERVAL: Duration = Duration::from_secs(30 * 60);

pub struct GithubProvider {
    refresher: Arc<GithubRefresher>,
}

impl GithubProvider {
    pub fn new() -> Self {
        Self {
            refresher: Arc::new(GithubRefresher {
                client: reqwest::Client::new(),
            }),
        }
    }
}

impl Default for GithubProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for GithubProvider {
    fn name(&self) -> &'static str {
        "github"
    }

    async fn setup(
        &self,
        _ctx: &SetupContext<'_>,
        store: &dyn CredentialStore,
    ) -> anyhow::Result<ProviderSetup> {
        let cred = store.get("github").await?;
        let mut setup = ProviderSetup::default();
        setup.env.insert("GITHUB_TOKEN".to_string(), cred.token.clone());
        setup.env.insert("GH_TOKEN".to_string(), cred.token);
        Ok(setup)
    }

    fn refresher(&self) -> Option<Arc<dyn Refresher>> {
        Some(self.refresher.clone())
    }
}

struct GithubRefresher {
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct GithubTokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    error: Option<String>,
}

#[async_trait]
impl Refresher for GithubRefresher {
    fn refresh_interval(&self) -> Duration {
        GITHUB_REFRESH_INTERVAL
    }

    async fn refresh(&self, cred: &Credential) -> anyhow::Result<Credential> {
        let refresh_token = cred
            .refresh_token
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("github credential has no refresh token"))?;
        let client_id = cred
            .meta
            .get("client_id")
            .ok_or_else(|| anyhow::anyhow!("github credential has no client_id"))?;

        let response: GithubTokenResponse = self
            .client
            .post(GITHUB_TOKEN_URL)
            .header("Accept", "application/json")
            .form(&[
                ("client_id", client_id.as_str()),
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.as_str()),
            ])
            .send()
            .await?
            .json()
            .await?;

        if let Some(error) = response.error {
            if error == "bad_refresh_token" {
                return Err(anyhow::Error::from(TokenRevoked)
                    .context("github rejected the refresh token"));
            }
            return Err(anyhow::anyhow!("github token refresh failed: {}", error));
        }

        let access_token = response
            .access_token
            .ok_or_else(|| anyhow::anyhow!("github returned no access token"))?;

        debug!("refreshed github token");
        Ok(Credential {
            provider: cred.provider.clone(),
            token: access_token,
            refresh_token: response.refresh_token.or_else(|| cred.refresh_token.clone()),
            expires_at: response
                .expires_in
                .map(|secs| chrono::Utc::now() + chrono::Duration::seconds(secs)),
            meta: cred.meta.clone(),
        })
    }
}

// ============================================================================
// AWS
// ============================================================================

/// Directory inside the container where the credential helper lands.
const AWS_HELPER_TARGET: &str = "/opt/moat/aws";

pub struct AwsProvider;

#[async_trait]
impl Provider for AwsProvider {
    fn name(&self) -> &'static str {
        "aws"
    }

    /// Install the architecture-matched credential helper into a per-run
    /// scratch directory and point the AWS CLI at it via credential_process.
    async fn setup(
        &self,
        ctx: &SetupContext<'_>,
        _store: &dyn CredentialStore,
    ) -> anyhow::Result<ProviderSetup> {
        std::fs::create_dir_all(&ctx.scratch_dir)?;
        let helper = install_helper(&ctx.scratch_dir)?;

        let helper_name = helper
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let config = format!(
            "[default]\ncredential_process = {}/{}\n",
            AWS_HELPER_TARGET, helper_name
        );
        std::fs::write(ctx.scratch_dir.join("config"), config)?;

        let mut setup = ProviderSetup {
            env: HashMap::new(),
            mounts: vec![MountSpec {
                source: ctx.scratch_dir.display().to_string(),
                target: AWS_HELPER_TARGET.to_string(),
                read_only: true,
            }],
            cleanup_path: Some(ctx.scratch_dir.clone()),
        };
        setup.env.insert(
            "AWS_CONFIG_FILE".to_string(),
            format!("{}/config", AWS_HELPER_TARGET),
        );
        Ok(setup)
    }
}
