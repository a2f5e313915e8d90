//! Credential proxy lifecycle handle.
//!
//! The HTTP credential proxy is its own subsystem; runs only carry a handle
//! with the endpoint the container should use and a one-shot stop that
//! releases the run's registration with the proxy.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub struct ProxyHandle {
    pub host: String,
    pub port: u16,
    pub auth_token: Option<String>,
    cancel: CancellationToken,
    stopped: AtomicBool,
}

impl ProxyHandle {
    pub fn new(host: impl Into<String>, port: u16, auth_token: Option<String>) -> Self {
        Self {
            host: host.into(),
            port,
            auth_token,
            cancel: CancellationToken::new(),
            stopped: AtomicBool::new(false),
        }
    }

    /// URL the in-container credential helper talks to.
    pub fn credential_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Token observed by whatever serves this run on the proxy side; fires
    /// once when the run's registration is released.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Release the run's proxy registration. Only the first call has any
    /// effect; returns whether this call performed the stop.
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_credential_url() {
        let handle = ProxyHandle::new("127.0.0.1", 8642, None);
        assert_eq!(handle.credential_url(), "http://127.0.0.1:8642");
    }

    #[tokio::test]
    async fn test_stop_runs_exactly_once() {
        let handle = Arc::new(ProxyHandle::new("127.0.0.1", 8642, None));
        let token = handle.cancel_token();

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move { handle.stop() }));
        }

        let mut performed = 0;
        for task in tasks {
            if task.await.unwrap() {
                performed += 1;
            }
        }
        assert_eq!(performed, 1);
        assert!(token.is_cancelled());
    }
}
