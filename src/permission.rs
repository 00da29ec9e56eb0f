//! OS tunneling-consent gate
//!
//! The operating system must consent to tunneling before the engine may
//! connect. The actual consent UI is platform work and lives behind the
//! [`PermissionPrompt`] trait; this module owns the bookkeeping around it:
//! at most one prompt in flight, every concurrent caller resolved with the
//! identical outcome, and an immediate short-circuit once granted.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::time::timeout;

use crate::error::{Result, SessionError};
use crate::state::PermissionStatus;

/// Platform consent prompt collaborator
///
/// Implementations surface the OS permission dialog (or its platform
/// equivalent) and report whether the user granted tunneling.
#[async_trait]
pub trait PermissionPrompt: Send + Sync {
    async fn request(&self) -> Result<bool>;
}

/// Prompt for hosts where consent is handled out-of-band
///
/// Always reports granted. Useful on platforms that gate tunneling before
/// this library is ever reached, and in embeddings that manage consent in
/// native code.
pub struct AutoGrantPrompt;

#[async_trait]
impl PermissionPrompt for AutoGrantPrompt {
    async fn request(&self) -> Result<bool> {
        Ok(true)
    }
}

type Waiter = oneshot::Sender<Result<PermissionStatus>>;

struct GateInner {
    status: PermissionStatus,
    /// `Some` while a prompt is in flight; holds the waiters to resolve.
    pending: Option<Vec<Waiter>>,
}

/// Tracks OS tunneling consent and serializes grant requests
pub struct PermissionGate {
    prompt: Arc<dyn PermissionPrompt>,
    prompt_timeout: Duration,
    inner: Mutex<GateInner>,
}

impl PermissionGate {
    pub fn new(prompt: Arc<dyn PermissionPrompt>, prompt_timeout: Duration) -> Self {
        Self {
            prompt,
            prompt_timeout,
            inner: Mutex::new(GateInner {
                status: PermissionStatus::Unknown,
                pending: None,
            }),
        }
    }

    /// Non-blocking read of the current status.
    pub fn status(&self) -> PermissionStatus {
        self.inner.lock().unwrap().status
    }

    pub fn is_granted(&self) -> bool {
        self.status().is_granted()
    }

    /// Request tunneling consent.
    ///
    /// Resolves immediately when already granted. While a prompt is in
    /// flight, further callers await the same prompt and every one of them
    /// receives the identical outcome. The prompt wait is bounded; on expiry
    /// all callers get [`SessionError::Timeout`] and the status is left
    /// unchanged, so a later request may prompt again.
    pub async fn request_grant(&self) -> Result<PermissionStatus> {
        enum Role {
            Leader,
            Follower(oneshot::Receiver<Result<PermissionStatus>>),
        }

        let role = {
            let mut inner = self.inner.lock().unwrap();
            if inner.status == PermissionStatus::Granted {
                return Ok(PermissionStatus::Granted);
            }
            match inner.pending.as_mut() {
                Some(waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Role::Follower(rx)
                }
                None => {
                    inner.pending = Some(Vec::new());
                    Role::Leader
                }
            }
        };

        match role {
            Role::Follower(rx) => match rx.await {
                Ok(outcome) => outcome,
                // Leader dropped without resolving; treat as an abandoned prompt.
                Err(_) => Err(SessionError::Timeout("permission prompt".to_string())),
            },
            Role::Leader => {
                log::debug!("requesting tunneling permission from the platform");
                let outcome = match timeout(self.prompt_timeout, self.prompt.request()).await {
                    Ok(Ok(granted)) => {
                        let status = if granted {
                            PermissionStatus::Granted
                        } else {
                            PermissionStatus::Denied
                        };
                        log::info!("tunneling permission {}", if granted { "granted" } else { "denied" });
                        Ok(status)
                    }
                    Ok(Err(e)) => {
                        log::warn!("permission prompt failed: {e}");
                        Err(e)
                    }
                    Err(_) => {
                        log::warn!("permission prompt timed out");
                        Err(SessionError::Timeout("permission prompt".to_string()))
                    }
                };

                let waiters = {
                    let mut inner = self.inner.lock().unwrap();
                    if let Ok(status) = &outcome {
                        inner.status = *status;
                    }
                    inner.pending.take().unwrap_or_default()
                };

                for waiter in waiters {
                    let _ = waiter.send(outcome.clone());
                }
                outcome
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Prompt with a scripted outcome, optional delay, and a call counter.
    struct ScriptedPrompt {
        granted: bool,
        delay: Option<Duration>,
        calls: AtomicU32,
    }

    impl ScriptedPrompt {
        fn new(granted: bool) -> Self {
            Self { granted, delay: None, calls: AtomicU32::new(0) }
        }

        fn with_delay(granted: bool, delay: Duration) -> Self {
            Self { granted, delay: Some(delay), calls: AtomicU32::new(0) }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PermissionPrompt for ScriptedPrompt {
        async fn request(&self) -> Result<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            Ok(self.granted)
        }
    }

    /// Prompt that never completes, for timeout paths.
    struct StalledPrompt;

    #[async_trait]
    impl PermissionPrompt for StalledPrompt {
        async fn request(&self) -> Result<bool> {
            std::future::pending().await
        }
    }

    fn gate_with(prompt: Arc<dyn PermissionPrompt>) -> PermissionGate {
        PermissionGate::new(prompt, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_grant_updates_status() {
        let gate = gate_with(Arc::new(ScriptedPrompt::new(true)));
        assert_eq!(gate.status(), PermissionStatus::Unknown);

        let outcome = gate.request_grant().await.unwrap();
        assert_eq!(outcome, PermissionStatus::Granted);
        assert_eq!(gate.status(), PermissionStatus::Granted);
    }

    #[tokio::test]
    async fn test_denial_updates_status_and_is_rerequestable() {
        let gate = gate_with(Arc::new(ScriptedPrompt::new(false)));
        assert_eq!(gate.request_grant().await.unwrap(), PermissionStatus::Denied);
        assert_eq!(gate.status(), PermissionStatus::Denied);

        // An explicit new request prompts again; a denial never flips on its own.
        assert_eq!(gate.request_grant().await.unwrap(), PermissionStatus::Denied);
    }

    #[tokio::test]
    async fn test_granted_short_circuits_without_prompting() {
        let prompt = Arc::new(ScriptedPrompt::new(true));
        let gate = gate_with(prompt.clone());

        gate.request_grant().await.unwrap();
        gate.request_grant().await.unwrap();
        gate.request_grant().await.unwrap();

        assert_eq!(prompt.calls(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_prompt_and_outcome() {
        let prompt = Arc::new(ScriptedPrompt::with_delay(true, Duration::from_millis(50)));
        let gate = Arc::new(gate_with(prompt.clone()));

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let gate = gate.clone();
            tasks.push(tokio::spawn(async move { gate.request_grant().await }));
        }

        for task in tasks {
            let outcome = task.await.unwrap().unwrap();
            assert_eq!(outcome, PermissionStatus::Granted);
        }
        assert_eq!(prompt.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prompt_timeout_resolves_every_waiter() {
        let gate = Arc::new(PermissionGate::new(
            Arc::new(StalledPrompt),
            Duration::from_secs(2),
        ));

        let mut tasks = Vec::new();
        for _ in 0..3 {
            let gate = gate.clone();
            tasks.push(tokio::spawn(async move { gate.request_grant().await }));
        }

        for task in tasks {
            let outcome = task.await.unwrap();
            assert!(matches!(outcome, Err(SessionError::Timeout(_))));
        }

        // Status untouched; a later request may still succeed.
        assert_eq!(gate.status(), PermissionStatus::Unknown);
    }
}
