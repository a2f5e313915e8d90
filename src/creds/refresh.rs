//! Per-run credential refresh loop.
//!
//! One task per run keeps its refreshable credentials fresh: an immediate
//! refresh at loop start, then a ticker at the shortest interval across all
//! targets. Failing targets back off exponentially; a revoked token takes
//! its target out of rotation permanently.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::provider::Refresher;
use super::store::{is_revoked, CredentialStore};
use super::Credential;

/// First retry delay after a refresh failure.
pub const REFRESH_RETRY_MIN: Duration = Duration::from_secs(30);

/// Backoff ceiling.
pub const REFRESH_RETRY_MAX: Duration = Duration::from_secs(15 * 60);

/// One refreshable credential.
pub struct RefreshTarget {
    pub provider: String,
    pub refresher: Arc<dyn Refresher>,
    pub credential: Credential,
}

struct TargetState {
    target: RefreshTarget,
    retry_delay: Option<Duration>,
    next_retry_after: Option<Instant>,
    revoked: bool,
}

impl TargetState {
    fn new(target: RefreshTarget) -> Self {
        Self {
            target,
            retry_delay: None,
            next_retry_after: None,
            revoked: false,
        }
    }
}

/// Spawn the refresh loop for a run. Exits when `cancel` fires (Stop) or
/// `exit` fires (the container exited).
pub fn spawn_refresh_loop(
    targets: Vec<RefreshTarget>,
    store: Arc<dyn CredentialStore>,
    cancel: CancellationToken,
    exit: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(run_loop(targets, store, cancel, exit))
}

async fn run_loop(
    targets: Vec<RefreshTarget>,
    store: Arc<dyn CredentialStore>,
    cancel: CancellationToken,
    exit: CancellationToken,
) {
    if targets.is_empty() {
        return;
    }

    let tick = targets
        .iter()
        .map(|t| t.refresher.refresh_interval())
        .min()
        .unwrap_or(REFRESH_RETRY_MAX);

    let mut states: Vec<TargetState> = targets.into_iter().map(TargetState::new).collect();

    // Refresh immediately so a run never starts on a token about to expire.
    refresh_pass(&mut states, store.as_ref()).await;

    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = exit.cancelled() => break,
            _ = interval.tick() => refresh_pass(&mut states, store.as_ref()).await,
        }
    }

    debug!("refresh loop exited");
}

async fn refresh_pass(states: &mut [TargetState], store: &dyn CredentialStore) {
    let now = Instant::now();

    for state in states.iter_mut() {
        if state.revoked {
            continue;
        }
        if let Some(after) = state.next_retry_after {
            if now < after {
                continue;
            }
        }

        match state.target.refresher.refresh(&state.target.credential).await {
            Ok(fresh) => {
                state.retry_delay = None;
                state.next_retry_after = None;

                if fresh.token != state.target.credential.token {
                    if let Err(e) = store.put(&fresh).await {
                        warn!(
                            "failed to persist refreshed {} credential: {}",
                            state.target.provider, e
                        );
                    }
                    state.target.credential = fresh;
                    debug!("refreshed {} credential", state.target.provider);
                }
            }
            Err(err) if is_revoked(&err) => {
                state.revoked = true;
                warn!(
                    "{} token revoked; refresh disabled for this run",
                    state.target.provider
                );
            }
            Err(err) => {
                let delay = state
                    .retry_delay
                    .map(|d| (d * 2).min(REFRESH_RETRY_MAX))
                    .unwrap_or(REFRESH_RETRY_MIN);
                state.retry_delay = Some(delay);
                state.next_retry_after = Some(Instant::now() + delay);
                warn!(
                    "refresh for {} failed (retrying in {:?}): {}",
                    state.target.provider, delay, err
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::creds::{MemoryCredentialStore, TokenRevoked};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedRefresher {
        calls: AtomicU32,
        mode: Mode,
    }

    enum Mode {
        Revoked,
        Fail,
        NewToken(String),
    }

    #[async_trait]
    impl Refresher for ScriptedRefresher {
        fn refresh_interval(&self) -> Duration {
            Duration::from_secs(60)
        }

        async fn refresh(&self, cred: &Credential) -> anyhow::Result<Credential> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.mode {
                Mode::Revoked => {
                    Err(anyhow::Error::from(TokenRevoked).context("refresh rejected"))
                }
                Mode::Fail => Err(anyhow::anyhow!("upstream unavailable")),
                Mode::NewToken(token) => Ok(Credential {
                    token: token.clone(),
                    ..cred.clone()
                }),
            }
        }
    }

    fn target(refresher: Arc<ScriptedRefresher>) -> RefreshTarget {
        RefreshTarget {
            provider: "github".to_string(),
            refresher,
            credential: Credential {
                provider: "github".to_string(),
                token: "old".to_string(),
                refresh_token: None,
                expires_at: None,
                meta: HashMap::new(),
            },
        }
    }

    #[tokio::test]
    async fn test_revocation_is_sticky() {
        let refresher = Arc::new(ScriptedRefresher {
            calls: AtomicU32::new(0),
            mode: Mode::Revoked,
        });
        let store = MemoryCredentialStore::new();
        let mut states = vec![TargetState::new(target(refresher.clone()))];

        refresh_pass(&mut states, &store).await;
        assert!(states[0].revoked);
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);

        // Later ticks never touch the refresher again.
        refresh_pass(&mut states, &store).await;
        refresh_pass(&mut states, &store).await;
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_backs_off_exponentially() {
        let refresher = Arc::new(ScriptedRefresher {
            calls: AtomicU32::new(0),
            mode: Mode::Fail,
        });
        let store = MemoryCredentialStore::new();
        let mut states = vec![TargetState::new(target(refresher.clone()))];

        refresh_pass(&mut states, &store).await;
        assert_eq!(states[0].retry_delay, Some(REFRESH_RETRY_MIN));
        assert!(states[0].next_retry_after.is_some());

        // Within the backoff window the target is skipped entirely.
        refresh_pass(&mut states, &store).await;
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);

        // Force the window open and fail again: the delay doubles.
        states[0].next_retry_after = Some(Instant::now() - Duration::from_secs(1));
        refresh_pass(&mut states, &store).await;
        assert_eq!(states[0].retry_delay, Some(REFRESH_RETRY_MIN * 2));

        // The delay never exceeds the ceiling.
        states[0].retry_delay = Some(REFRESH_RETRY_MAX);
        states[0].next_retry_after = Some(Instant::now() - Duration::from_secs(1));
        refresh_pass(&mut states, &store).await;
        assert_eq!(states[0].retry_delay, Some(REFRESH_RETRY_MAX));
    }

    #[tokio::test]
    async fn test_new_token_is_persisted_and_backoff_clears() {
        let refresher = Arc::new(ScriptedRefresher {
            calls: AtomicU32::new(0),
            mode: Mode::NewToken("fresh".to_string()),
        });
        let store = MemoryCredentialStore::new();
        let mut states = vec![TargetState::new(target(refresher))];
        states[0].retry_delay = Some(REFRESH_RETRY_MIN);

        refresh_pass(&mut states, &store).await;

        assert_eq!(states[0].target.credential.token, "fresh");
        assert_eq!(states[0].retry_delay, None);
        assert_eq!(states[0].next_retry_after, None);

        use crate::creds::CredentialStore as _;
        let stored = store.get("github").await.unwrap();
        assert_eq!(stored.token, "fresh");
    }

    #[tokio::test]
    async fn test_loop_exits_on_cancel() {
        let refresher = Arc::new(ScriptedRefresher {
            calls: AtomicU32::new(0),
            mode: Mode::NewToken("fresh".to_string()),
        });
        let store: Arc<dyn CredentialStore> = Arc::new(MemoryCredentialStore::new());
        let cancel = CancellationToken::new();
        let exit = CancellationToken::new();

        let handle = spawn_refresh_loop(
            vec![target(refresher.clone())],
            store,
            cancel.clone(),
            exit,
        );

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("refresh loop did not exit")
            .unwrap();

        // The immediate refresh ran before the loop parked.
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
    }
}
