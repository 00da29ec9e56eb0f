//! Connection-lifecycle state bridge
//!
//! The controller owns the asynchronous handshake between "request a VPN
//! connection", "native engine becomes ready" and "deliver one authoritative
//! state to every listener". All transitions are serialized through one
//! session lock; engine notifications are funneled into the same lock
//! through an ordered channel, so no transition is ever computed from a
//! stale read of the prior state.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::timeout;

use crate::broadcast::{StateBroadcaster, Subscription};
use crate::engine::{EngineHandle, EngineNotification, VpnEngine};
use crate::error::{Result, SessionError};
use crate::permission::{PermissionGate, PermissionPrompt};
use crate::profile::ConnectionProfile;
use crate::state::{ErrorState, PermissionStatus, SessionState, StateSnapshot};

/// Bounds for every suspension point, in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutSettings {
    /// Permission prompt wait (user-driven, so generous)
    #[serde(default = "default_permission_timeout")]
    pub permission: u64,
    /// Engine service binding
    #[serde(default = "default_bind_timeout")]
    pub bind: u64,
    /// Engine accepting a connect request
    #[serde(default = "default_connect_timeout")]
    pub connect: u64,
    /// Engine confirming teardown
    #[serde(default = "default_disconnect_timeout")]
    pub disconnect: u64,
}

impl TimeoutSettings {
    pub fn permission_timeout(&self) -> Duration {
        Duration::from_secs(self.permission)
    }

    pub fn bind_timeout(&self) -> Duration {
        Duration::from_secs(self.bind)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_secs(self.disconnect)
    }
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            permission: default_permission_timeout(),
            bind: default_bind_timeout(),
            connect: default_connect_timeout(),
            disconnect: default_disconnect_timeout(),
        }
    }
}

// Default value functions for serde
fn default_permission_timeout() -> u64 {
    60
}

fn default_bind_timeout() -> u64 {
    10
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_disconnect_timeout() -> u64 {
    10
}

/// Options for a connect request
#[derive(Debug, Clone, Copy)]
pub struct ConnectOptions {
    /// Tear down an active session first instead of failing `AlreadyActive`
    pub reconnect: bool,
    /// Ask the engine for verbose daemon logging
    pub log_all: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            reconnect: false,
            log_all: true,
        }
    }
}

/// Controller-internal lifecycle position
///
/// Distinct from the published [`SessionState`]: `Preparing` publishes
/// nothing (a denied permission leaves no trace on the stream) and `Idle`
/// publishes `Disconnected` once the binding is up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Preparing,
    Connecting,
    Connected,
    Disconnecting,
    Error,
}

/// Engine binding progress carried on the bind watch channel
#[derive(Clone)]
enum BindPhase {
    Binding,
    Bound(Arc<dyn EngineHandle>),
    Failed,
}

struct Session {
    phase: Phase,
    /// At most one connect may wait for binding completion
    connect_queued: bool,
    /// Profile of the attempt or session in progress
    active_profile: Option<ConnectionProfile>,
}

struct Shared {
    engine: Arc<dyn VpnEngine>,
    gate: PermissionGate,
    broadcaster: StateBroadcaster,
    timeouts: TimeoutSettings,
    /// The serialization point for every state transition
    session: Mutex<Session>,
    bind_tx: watch::Sender<BindPhase>,
    /// Kept alive so bind updates are never lost between waiters
    bind_rx: watch::Receiver<BindPhase>,
}

/// The VPN session controller
///
/// One logical session per instance. Cloning shares the same session.
#[derive(Clone)]
pub struct SessionController {
    shared: Arc<Shared>,
}

impl SessionController {
    /// Create a controller and start binding the engine service.
    ///
    /// Must be called from within a Tokio runtime; binding and notification
    /// relay run as background tasks.
    pub fn new(
        engine: Arc<dyn VpnEngine>,
        prompt: Arc<dyn PermissionPrompt>,
        timeouts: TimeoutSettings,
    ) -> Self {
        let (bind_tx, bind_rx) = watch::channel(BindPhase::Binding);
        let shared = Arc::new(Shared {
            engine,
            gate: PermissionGate::new(prompt, timeouts.permission_timeout()),
            broadcaster: StateBroadcaster::new(StateSnapshot::unbound()),
            timeouts,
            session: Mutex::new(Session {
                phase: Phase::Idle,
                connect_queued: false,
                active_profile: None,
            }),
            bind_tx,
            bind_rx,
        });

        let binder = shared.clone();
        tokio::spawn(async move { binder.run_binding().await });

        Self { shared }
    }

    /// Request tunneling permission; true when granted.
    pub async fn request_permission(&self) -> Result<bool> {
        let status = self.shared.gate.request_grant().await?;
        Ok(status == PermissionStatus::Granted)
    }

    /// Non-blocking read of the permission status.
    pub fn permission_status(&self) -> PermissionStatus {
        self.shared.gate.status()
    }

    pub fn is_permission_granted(&self) -> bool {
        self.shared.gate.is_granted()
    }

    /// Non-blocking read of the latest `(state, error)` pair.
    ///
    /// Reports `Unbound` until the engine binding is established.
    pub fn current_state(&self) -> StateSnapshot {
        self.shared.broadcaster.latest()
    }

    /// Non-blocking read of the latest engine-reported error state.
    pub fn current_error(&self) -> ErrorState {
        self.current_state().error
    }

    /// Subscribe to state changes; the latest pair is replayed immediately.
    pub fn subscribe(&self) -> Subscription {
        self.shared.broadcaster.subscribe()
    }

    /// Request a VPN connection with the given profile.
    ///
    /// Returns `Ok(true)` once the engine accepted the request; the tunnel
    /// outcome arrives on the broadcast stream. Returns `Ok(false)` when the
    /// attempt ended without a fault: permission denied, or the attempt was
    /// aborted by an intervening disconnect. Caller errors
    /// (`InvalidProfile`, `AlreadyActive`, `AlreadyPending`) are returned
    /// synchronously and leave the state untouched.
    pub async fn connect(
        &self,
        profile: &ConnectionProfile,
        options: ConnectOptions,
    ) -> Result<bool> {
        profile.validate()?;
        let shared = &self.shared;

        // Claim the session. A fresh connect acknowledges a prior error.
        loop {
            let mut session = shared.session.lock().await;
            match session.phase {
                Phase::Idle | Phase::Error => {
                    session.phase = Phase::Preparing;
                    break;
                }
                Phase::Preparing if session.connect_queued => {
                    return Err(SessionError::AlreadyPending)
                }
                _ if options.reconnect => {
                    drop(session);
                    log::info!("reconnect requested; tearing down the active session");
                    self.disconnect().await?;
                    // Loop back and claim the now-idle session.
                }
                _ => return Err(SessionError::AlreadyActive),
            }
        }

        // Suspension point: permission. The session lock is not held here.
        let status = match shared.gate.request_grant().await {
            Ok(status) => status,
            Err(e) => {
                shared.fail_attempt(e.error_state()).await;
                return Err(e);
            }
        };

        if status != PermissionStatus::Granted {
            log::info!("tunneling permission denied; connect not accepted");
            shared.abort_preparing().await;
            return Ok(false);
        }

        // Suspension point: engine binding, with the one-deep connect queue.
        let handle = match shared.await_bound().await {
            Ok(handle) => handle,
            Err(e @ SessionError::Timeout(_)) => {
                shared.fail_attempt(ErrorState::Timeout).await;
                return Err(e);
            }
            Err(e) => {
                // Binding failed; transient and retryable, not a session fault.
                shared.abort_preparing().await;
                return Err(e);
            }
        };

        {
            let mut session = shared.session.lock().await;
            if session.phase != Phase::Preparing {
                log::debug!("connect aborted while suspended");
                return Ok(false);
            }
            session.phase = Phase::Connecting;
            session.active_profile = Some(profile.clone());
            shared.broadcaster.publish(StateSnapshot::new(
                SessionState::Connecting,
                ErrorState::NoError,
            ));
        }

        log::info!(
            "forwarding connect for profile '{}' ({}) to the engine",
            profile.name,
            profile.auth.vpn_type()
        );
        let engine_profile = profile.engine_profile();
        let request = handle.connect(&engine_profile, options.log_all);
        match timeout(shared.timeouts.connect_timeout(), request).await {
            Ok(Ok(())) => Ok(true),
            Ok(Err(e)) => {
                log::error!("engine rejected the connect request: {e}");
                shared.fail_attempt(e.error_state()).await;
                Err(e)
            }
            Err(_) => {
                log::error!("engine connect request timed out");
                shared.fail_attempt(ErrorState::Timeout).await;
                Err(SessionError::Timeout("engine connect request".to_string()))
            }
        }
    }

    /// Tear the session down and drive the controller back to idle.
    ///
    /// A no-op when already idle; safe to call at any phase and repeatedly.
    /// Reaches idle in bounded time even when the engine never confirms.
    pub async fn disconnect(&self) -> Result<()> {
        let shared = &self.shared;

        let mut confirmation = {
            let mut session = shared.session.lock().await;
            match session.phase {
                Phase::Idle => return Ok(()),
                Phase::Preparing => {
                    // Abort a suspended connect. Nothing was published for
                    // it, so nothing is published here either.
                    session.phase = Phase::Idle;
                    session.active_profile = None;
                    log::debug!("disconnect aborted a preparing connect");
                    return Ok(());
                }
                Phase::Error => {
                    // Acknowledge the fault; the engine is not tunneling.
                    // Without a binding the honest settled state is Unbound.
                    session.phase = Phase::Idle;
                    session.active_profile = None;
                    let settled = match &*shared.bind_rx.borrow() {
                        BindPhase::Bound(_) => SessionState::Disconnected,
                        _ => SessionState::Unbound,
                    };
                    shared
                        .broadcaster
                        .publish(StateSnapshot::new(settled, ErrorState::NoError));
                    return Ok(());
                }
                Phase::Connecting | Phase::Connected => {
                    if let Some(profile) = session.active_profile.as_ref() {
                        log::info!("disconnecting profile '{}'", profile.name);
                    }
                    session.phase = Phase::Disconnecting;
                    shared.broadcaster.publish(StateSnapshot::new(
                        SessionState::Disconnecting,
                        ErrorState::NoError,
                    ));
                }
                Phase::Disconnecting => {
                    // A teardown is already in flight; wait for it below.
                }
            }
            shared.broadcaster.subscribe()
        };

        let handle = match &*shared.bind_rx.borrow() {
            BindPhase::Bound(handle) => Some(handle.clone()),
            _ => None,
        };
        if let Some(handle) = handle {
            match timeout(shared.timeouts.disconnect_timeout(), handle.disconnect()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::warn!("engine disconnect request failed: {e}"),
                Err(_) => log::warn!("engine disconnect request timed out"),
            }
        }

        // Wait for the engine's confirmation; force idle on silence.
        let confirmed = timeout(shared.timeouts.disconnect_timeout(), async {
            while let Some(snapshot) = confirmation.next().await {
                if snapshot.state == SessionState::Disconnected {
                    break;
                }
            }
        })
        .await
        .is_ok();

        if !confirmed {
            let mut session = shared.session.lock().await;
            match session.phase {
                Phase::Disconnecting => {
                    log::warn!("engine never confirmed teardown; forcing idle");
                    session.phase = Phase::Idle;
                    session.active_profile = None;
                    shared
                        .broadcaster
                        .publish(StateSnapshot::new(SessionState::Error, ErrorState::Timeout));
                    shared.broadcaster.publish(StateSnapshot::new(
                        SessionState::Disconnected,
                        ErrorState::NoError,
                    ));
                }
                Phase::Error => {
                    // The engine answered with a fault instead of confirming;
                    // this disconnect acknowledges it.
                    session.phase = Phase::Idle;
                    session.active_profile = None;
                    shared.broadcaster.publish(StateSnapshot::new(
                        SessionState::Disconnected,
                        ErrorState::NoError,
                    ));
                }
                _ => {}
            }
        }

        Ok(())
    }

    /// Disconnect and tear down the engine binding.
    ///
    /// After shutdown the reported state is `Unbound` again; a later connect
    /// establishes a fresh binding.
    pub async fn shutdown(&self) -> Result<()> {
        self.disconnect().await?;

        let previous = {
            let _session = self.shared.session.lock().await;
            self.shared.bind_tx.send_replace(BindPhase::Failed)
        };
        if let BindPhase::Bound(handle) = previous {
            handle.unregister_listener();
            self.shared.broadcaster.publish(StateSnapshot::unbound());
            log::info!("engine binding torn down");
        }
        Ok(())
    }
}

impl Shared {
    /// Bind the engine service and wire up the notification relay.
    ///
    /// The wait bound lives in `await_bound` on the connect side; the
    /// binding itself may outlast it and still complete for later attempts.
    async fn run_binding(self: Arc<Self>) {
        eprintln!("DBG: run_binding start");
        log::debug!("binding the VPN engine service");
        match self.engine.bind().await {
            Ok(handle) => {
                let (tx, rx) = mpsc::unbounded_channel();
                handle.register_listener(tx);

                let relay = self.clone();
                tokio::spawn(async move { relay.relay_notifications(rx).await });

                {
                    let session = self.session.lock().await;
                    if session.phase == Phase::Idle {
                        self.broadcaster.publish(StateSnapshot::new(
                            SessionState::Disconnected,
                            ErrorState::NoError,
                        ));
                    }
                }
                self.bind_tx.send_replace(BindPhase::Bound(handle));
                eprintln!("DBG: run_binding set Bound");
                log::info!("engine binding established");
            }
            Err(e) => {
                log::error!("engine binding failed: {e}");
                self.bind_tx.send_replace(BindPhase::Failed);
            }
        }
    }

    /// Process engine notifications strictly in arrival order.
    async fn relay_notifications(&self, mut rx: mpsc::UnboundedReceiver<EngineNotification>) {
        while let Some(notification) = rx.recv().await {
            self.apply_notification(notification).await;
        }
        log::debug!("engine listener gone; notification relay stopped");
    }

    async fn apply_notification(&self, notification: EngineNotification) {
        let mut session = self.session.lock().await;

        let phase = match notification.state {
            SessionState::Unbound => {
                log::warn!("engine reported an unbound state; dropped");
                return;
            }
            SessionState::Connected if !self.gate.is_granted() => {
                log::warn!("engine reported connected without permission; dropped");
                return;
            }
            SessionState::Disconnected => Phase::Idle,
            SessionState::Connecting => Phase::Connecting,
            SessionState::Connected => Phase::Connected,
            SessionState::Disconnecting => Phase::Disconnecting,
            SessionState::Error => Phase::Error,
        };

        session.phase = phase;
        if phase == Phase::Idle {
            session.active_profile = None;
        }

        let snapshot = StateSnapshot::new(notification.state, notification.error);
        log::debug!("engine state change: {snapshot}");
        self.broadcaster.publish(snapshot);
    }

    /// Wait for the engine binding, queueing at most one connect.
    async fn await_bound(self: &Arc<Self>) -> Result<Arc<dyn EngineHandle>> {
        let mut rx = self.bind_rx.clone();

        {
            let mut session = self.session.lock().await;
            match rx.borrow_and_update().clone() {
                BindPhase::Bound(handle) => return Ok(handle),
                BindPhase::Failed => {
                    // Transient; start a fresh binding attempt.
                    eprintln!("DBG: await_bound saw Failed, spawning retry");
                    self.bind_tx.send_replace(BindPhase::Binding);
                    let binder = self.clone();
                    tokio::spawn(async move { binder.run_binding().await });
                    log::debug!("retrying engine binding");
                }
                BindPhase::Binding => {}
            }
            if session.connect_queued {
                eprintln!("DBG: await_bound returning AlreadyPending");
                return Err(SessionError::AlreadyPending);
            }
            session.connect_queued = true;
        }
        eprintln!("DBG: await_bound lock dropped, entering timeout");

        let wait = async {
            let mut spins = 0u64;
            loop {
                let phase = rx.borrow_and_update().clone();
                spins += 1;
                if spins <= 5 || spins % 1000000 == 0 {
                    let tag = match &phase { BindPhase::Bound(_) => "Bound", BindPhase::Failed => "Failed", BindPhase::Binding => "Binding" };
                    eprintln!("DBG: wait loop iter={spins} phase={tag}");
                }
                match phase {
                    BindPhase::Bound(handle) => return Ok(handle),
                    BindPhase::Failed => return Err(SessionError::Unbound),
                    BindPhase::Binding => {
                        if rx.changed().await.is_err() {
                            return Err(SessionError::Unbound);
                        }
                    }
                }
            }
        };

        let outcome = match timeout(self.timeouts.bind_timeout(), wait).await {
            Ok(outcome) => outcome,
            Err(_) => Err(SessionError::Timeout("engine binding".to_string())),
        };

        self.session.lock().await.connect_queued = false;
        outcome
    }

    /// Revert an attempt that ended without a fault; publishes nothing.
    async fn abort_preparing(&self) {
        let mut session = self.session.lock().await;
        if session.phase == Phase::Preparing {
            session.phase = Phase::Idle;
        }
    }

    /// Fail the attempt in progress and publish the error pair.
    async fn fail_attempt(&self, error: ErrorState) {
        let mut session = self.session.lock().await;
        if matches!(session.phase, Phase::Preparing | Phase::Connecting) {
            session.phase = Phase::Error;
            self.broadcaster
                .publish(StateSnapshot::new(SessionState::Error, error));
        }
    }
}
