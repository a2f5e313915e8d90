//! Exit monitoring and log capture.
//!
//! One monitor task per started run blocks on the runtime's wait, settles
//! the terminal state, runs provider stopped hooks, captures logs, and only
//! then cancels the run's exit token. Anyone observing the token cancelled
//! therefore sees a fully settled run.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::Utc;
use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::creds::ProviderRegistry;
use crate::deps::Dependency;
use crate::runtime::{Runtime, RuntimeKind};
use crate::store::Store;

use super::record::{Run, RunState};

pub(crate) fn spawn_exit_monitor(
    run: Arc<Run>,
    runtime: Arc<dyn Runtime>,
    store: Store,
    providers: ProviderRegistry,
) -> JoinHandle<()> {
    run.monitor_started.store(true, Ordering::Release);

    tokio::spawn(async move {
        let container_id = run.container_id().unwrap_or_default();

        let result = runtime.wait_container(&container_id).await;

        // A run that settled terminal before the container exited has
        // nothing left to do here beyond releasing its waiters.
        if run.state().is_terminal() {
            run.mark_exited();
            debug!("exit monitor for {} finished", run.id);
            return;
        }

        let now = Utc::now();
        match result {
            Ok(0) => run.set_state_at(RunState::Stopped, now),
            Ok(code) => run.set_failed_at(format!("container exited with code {}", code), now),
            // A failed wait is indistinguishable from a failed run.
            Err(e) => run.set_failed_at(format!("container wait failed: {}", e), now),
        }

        run_stopped_hooks(&run, &providers).await;
        capture_logs(&run, runtime.as_ref(), &store).await;

        if let Err(e) = store.save_metadata(&run.snapshot_metadata()) {
            warn!("failed to persist metadata for {}: {}", run.id, e);
        }

        // Last: any Stop waiter unblocked here observes the settled run.
        run.mark_exited();
        debug!("exit monitor for {} finished", run.id);
    })
}

/// Provider "stopped" hooks run at most once per run.
pub(crate) async fn run_stopped_hooks(run: &Run, providers: &ProviderRegistry) {
    if run
        .provider_hooks_done
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return;
    }

    for grant in &run.grants {
        let dep = Dependency::parse(grant);
        if let Some(provider) = providers.get(&dep.name) {
            provider.on_stopped(&run.id).await;
        }
    }
}

/// Capture container output into the run's log file, at most once.
///
/// Interactive Apple runs tee output through the attach path while they
/// execute, so the runtime fetch is skipped for them. A failed fetch still
/// leaves an empty file behind for audit completeness.
pub(crate) async fn capture_logs(run: &Run, runtime: &dyn Runtime, store: &Store) {
    let path = store.log_path(&run.id);
    if run.logs_captured.load(Ordering::Acquire) && path.exists() {
        return;
    }

    if run
        .logs_captured
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        // Another caller owns the capture.
        return;
    }

    if runtime.kind() == RuntimeKind::Apple && run.interactive {
        return;
    }

    let container_id = match run.container_id() {
        Some(id) => id,
        None => return,
    };

    match runtime.container_logs_all(&container_id).await {
        Ok(bytes) => {
            if let Err(e) = store.write_logs(&run.id, &bytes) {
                warn!("failed to write logs for {}: {}", run.id, e);
            }
        }
        Err(e) => {
            warn!("failed to fetch logs for {}: {}", run.id, e);
            if let Err(e) = store.write_logs(&run.id, b"") {
                warn!("failed to write empty log file for {}: {}", run.id, e);
            }
        }
    }
}

/// Stream container output into the persistent log file while the run
/// executes. Non-Apple runs start this at Start; interactive Apple runs tee
/// through the attach path instead.
pub(crate) fn spawn_log_streamer(
    run: Arc<Run>,
    runtime: Arc<dyn Runtime>,
    store: Store,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let container_id = match run.container_id() {
            Some(id) => id,
            None => return,
        };

        let mut stream = match runtime.container_logs(&container_id, true).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("cannot stream logs for {}: {}", run.id, e);
                return;
            }
        };

        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => {
                    if let Err(e) = store.append_logs(&run.id, &bytes) {
                        warn!("failed to append logs for {}: {}", run.id, e);
                        break;
                    }
                }
                Err(e) => {
                    debug!("log stream for {} ended: {}", run.id, e);
                    break;
                }
            }
        }
    })
}

/// Last `n` newline-delimited lines of `s`, trailing newline included.
/// Returns all of `s` when it has fewer lines, and "" for `n == 0`.
pub fn last_n_lines(s: &str, n: usize) -> &str {
    if n == 0 || s.is_empty() {
        return "";
    }

    let bytes = s.as_bytes();
    let mut end = bytes.len();
    if bytes[end - 1] == b'\n' {
        // The trailing newline terminates the last line rather than
        // starting a new one.
        end -= 1;
    }

    let mut seen = 0;
    for i in (0..end).rev() {
        if bytes[i] == b'\n' {
            seen += 1;
            if seen == n {
                return &s[i + 1..];
            }
        }
    }
    s
}
