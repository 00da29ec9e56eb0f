//! Mock engine implementation for testing
//!
//! Simulates the native engine service without a charon daemon: binding can
//! be delayed or made to fail, connect requests are captured for inspection,
//! and state notifications are injected manually or auto-acknowledged. Used
//! by this crate's tests and usable by host applications testing their own
//! integration glue.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{EngineHandle, EngineNotification, EngineProfile, VpnEngine};
use crate::error::{Result, SessionError};
use crate::state::{ErrorState, SessionState};

/// Scriptable stand-in for the native engine service
pub struct MockEngine {
    handle: Arc<MockHandle>,
    bind_delay: Mutex<Option<Duration>>,
    fail_bind: AtomicBool,
    bind_count: AtomicU32,
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            handle: Arc::new(MockHandle::new()),
            bind_delay: Mutex::new(None),
            fail_bind: AtomicBool::new(false),
            bind_count: AtomicU32::new(0),
        }
    }

    /// The handle `bind` will yield; tests hold it to inject notifications.
    pub fn handle(&self) -> Arc<MockHandle> {
        self.handle.clone()
    }

    /// Delay `bind` completion, simulating slow service binding.
    pub fn set_bind_delay(&self, delay: Duration) {
        *self.bind_delay.lock().unwrap() = Some(delay);
    }

    /// Make every `bind` call fail until cleared.
    pub fn set_bind_failure(&self, fail: bool) {
        self.fail_bind.store(fail, Ordering::SeqCst);
    }

    /// Number of `bind` calls observed.
    pub fn bind_count(&self) -> u32 {
        self.bind_count.load(Ordering::SeqCst)
    }
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VpnEngine for MockEngine {
    async fn bind(&self) -> Result<Arc<dyn EngineHandle>> {
        self.bind_count.fetch_add(1, Ordering::SeqCst);

        let delay = *self.bind_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.fail_bind.load(Ordering::SeqCst) {
            return Err(SessionError::Engine(ErrorState::GenericNetworkError));
        }

        Ok(self.handle.clone() as Arc<dyn EngineHandle>)
    }
}

/// Handle yielded by [`MockEngine::bind`]
pub struct MockHandle {
    listener: Mutex<Option<mpsc::UnboundedSender<EngineNotification>>>,
    connects: Mutex<Vec<(EngineProfile, bool)>>,
    disconnect_count: AtomicU32,
    connect_error: Mutex<Option<SessionError>>,
    auto_ack_connect: AtomicBool,
    auto_ack_disconnect: AtomicBool,
}

impl MockHandle {
    fn new() -> Self {
        Self {
            listener: Mutex::new(None),
            connects: Mutex::new(Vec::new()),
            disconnect_count: AtomicU32::new(0),
            connect_error: Mutex::new(None),
            auto_ack_connect: AtomicBool::new(false),
            auto_ack_disconnect: AtomicBool::new(false),
        }
    }

    /// Push a state notification through the registered listener.
    ///
    /// Returns false if no listener is registered.
    pub fn notify(&self, state: SessionState, error: ErrorState) -> bool {
        let listener = self.listener.lock().unwrap();
        match listener.as_ref() {
            Some(tx) => tx.send(EngineNotification::new(state, error)).is_ok(),
            None => false,
        }
    }

    /// Captured `(profile, log_all)` connect requests, in order.
    pub fn connect_requests(&self) -> Vec<(EngineProfile, bool)> {
        self.connects.lock().unwrap().clone()
    }

    /// Number of `disconnect` calls observed.
    pub fn disconnect_count(&self) -> u32 {
        self.disconnect_count.load(Ordering::SeqCst)
    }

    /// Fail the next `connect` call with the given error.
    pub fn set_connect_error(&self, error: SessionError) {
        *self.connect_error.lock().unwrap() = Some(error);
    }

    /// Emit `Connecting` then `Connected` when a connect request arrives.
    pub fn set_auto_ack_connect(&self, on: bool) {
        self.auto_ack_connect.store(on, Ordering::SeqCst);
    }

    /// Emit `Disconnected` when a disconnect request arrives.
    pub fn set_auto_ack_disconnect(&self, on: bool) {
        self.auto_ack_disconnect.store(on, Ordering::SeqCst);
    }

    pub fn has_listener(&self) -> bool {
        self.listener.lock().unwrap().is_some()
    }
}

#[async_trait]
impl EngineHandle for MockHandle {
    async fn connect(&self, profile: &EngineProfile, log_all: bool) -> Result<()> {
        if let Some(error) = self.connect_error.lock().unwrap().take() {
            return Err(error);
        }

        self.connects.lock().unwrap().push((profile.clone(), log_all));

        if self.auto_ack_connect.load(Ordering::SeqCst) {
            self.notify(SessionState::Connecting, ErrorState::NoError);
            self.notify(SessionState::Connected, ErrorState::NoError);
        }

        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnect_count.fetch_add(1, Ordering::SeqCst);

        if self.auto_ack_disconnect.load(Ordering::SeqCst) {
            self.notify(SessionState::Disconnected, ErrorState::NoError);
        }

        Ok(())
    }

    fn register_listener(&self, listener: mpsc::UnboundedSender<EngineNotification>) {
        *self.listener.lock().unwrap() = Some(listener);
    }

    fn unregister_listener(&self) {
        *self.listener.lock().unwrap() = None;
    }
}
