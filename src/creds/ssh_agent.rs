//! Per-run SSH agent forwarding.
//!
//! Proxies the host's `SSH_AUTH_SOCK` into a per-run socket directory that
//! is bind-mounted into the container. The handle's stop is one-shot so the
//! Stop path and the exit monitor can both call it without coordination.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A running SSH agent forward for one run.
#[derive(Debug)]
pub struct SshAgentHandle {
    socket_path: PathBuf,
    cancel: CancellationToken,
    stopped: AtomicBool,
}

impl SshAgentHandle {
    /// Bind `<dir>/agent.sock` and start forwarding connections to the host
    /// agent at `upstream`.
    pub async fn start(run_id: &str, upstream: &Path, dir: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let socket_path = dir.join("agent.sock");
        if socket_path.exists() {
            std::fs::remove_file(&socket_path)?;
        }

        let listener = UnixListener::bind(&socket_path)?;
        let cancel = CancellationToken::new();

        let accept_cancel = cancel.clone();
        let upstream = upstream.to_path_buf();
        let run_id = run_id.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_cancel.cancelled() => break,
                    accepted = listener.accept() => {
                        let (mut client, _) = match accepted {
                            Ok(pair) => pair,
                            Err(e) => {
                                warn!("ssh agent accept failed for {}: {}", run_id, e);
                                break;
                            }
                        };
                        let upstream = upstream.clone();
                        tokio::spawn(async move {
                            match UnixStream::connect(&upstream).await {
                                Ok(mut agent) => {
                                    let _ = tokio::io::copy_bidirectional(&mut client, &mut agent).await;
                                }
                                Err(e) => warn!("cannot reach host ssh agent: {}", e),
                            }
                        });
                    }
                }
            }
            debug!("ssh agent forward for {} stopped", run_id);
        });

        Ok(Self {
            socket_path,
            cancel,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Stop the forward. Only the first call has any effect; returns whether
    /// this call performed the stop.
    pub fn stop(&self) -> bool {
        if self
            .stopped
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.cancel.cancel();
        true
    }
}
