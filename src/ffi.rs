//! C FFI Interface for host-application embedding
//!
//! This module exposes the session controller to applications written in
//! other languages (Swift, Kotlin, C#, etc.). The native side supplies the
//! engine through a callback table and pushes the engine's state changes
//! back with `charon_session_notify`; the session pushes merged state
//! changes out through an optional state callback. Tunneling consent is
//! expected to be settled by the native layer before connect is called.

#![allow(clippy::missing_safety_doc)]

use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int, c_void};
use std::ptr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::controller::{ConnectOptions, SessionController, TimeoutSettings};
use crate::engine::{EngineHandle, EngineNotification, EngineProfile, VpnEngine};
use crate::error::{Result, SessionError};
use crate::permission::AutoGrantPrompt;
use crate::profile::ConnectionProfile;
use crate::state::{ErrorState, SessionState};

/// Error codes returned by C FFI functions
#[repr(C)]
pub enum CharonError {
    Success = 0,
    InvalidParameter = 1,
    InvalidProfile = 2,
    AlreadyActive = 3,
    AlreadyPending = 4,
    PermissionDenied = 5,
    EngineFault = 6,
    Timeout = 7,
    Unbound = 8,
    InternalError = 99,
}

impl From<SessionError> for CharonError {
    fn from(error: SessionError) -> Self {
        match error {
            SessionError::InvalidProfile(_) => CharonError::InvalidProfile,
            SessionError::AlreadyActive => CharonError::AlreadyActive,
            SessionError::AlreadyPending => CharonError::AlreadyPending,
            SessionError::Engine(_) => CharonError::EngineFault,
            SessionError::Timeout(_) => CharonError::Timeout,
            SessionError::Unbound => CharonError::Unbound,
            SessionError::Config(_) => CharonError::InvalidProfile,
        }
    }
}

/// Session state codes crossing the C boundary
///
/// Fixed discriminants; the Rust enum may be reordered without shifting
/// these values.
#[repr(C)]
pub enum CharonState {
    Unbound = 0,
    Disconnected = 1,
    Connecting = 2,
    Connected = 3,
    Disconnecting = 4,
    Error = 5,
}

/// Error state codes crossing the C boundary
#[repr(C)]
pub enum CharonErrorState {
    NoError = 0,
    AuthFailed = 1,
    LookupFailed = 2,
    UnreachableServer = 3,
    GenericNetworkError = 4,
    Aborted = 5,
    Timeout = 6,
}

fn state_code(state: SessionState) -> c_int {
    match state {
        SessionState::Unbound => CharonState::Unbound as c_int,
        SessionState::Disconnected => CharonState::Disconnected as c_int,
        SessionState::Connecting => CharonState::Connecting as c_int,
        SessionState::Connected => CharonState::Connected as c_int,
        SessionState::Disconnecting => CharonState::Disconnecting as c_int,
        SessionState::Error => CharonState::Error as c_int,
    }
}

fn state_from_code(code: c_int) -> Option<SessionState> {
    match code {
        0 => Some(SessionState::Unbound),
        1 => Some(SessionState::Disconnected),
        2 => Some(SessionState::Connecting),
        3 => Some(SessionState::Connected),
        4 => Some(SessionState::Disconnecting),
        5 => Some(SessionState::Error),
        _ => None,
    }
}

fn error_state_code(error: ErrorState) -> c_int {
    match error {
        ErrorState::NoError => CharonErrorState::NoError as c_int,
        ErrorState::AuthFailed => CharonErrorState::AuthFailed as c_int,
        ErrorState::LookupFailed => CharonErrorState::LookupFailed as c_int,
        ErrorState::UnreachableServer => CharonErrorState::UnreachableServer as c_int,
        ErrorState::GenericNetworkError => CharonErrorState::GenericNetworkError as c_int,
        ErrorState::Aborted => CharonErrorState::Aborted as c_int,
        ErrorState::Timeout => CharonErrorState::Timeout as c_int,
    }
}

fn error_state_from_code(code: c_int) -> Option<ErrorState> {
    match code {
        0 => Some(ErrorState::NoError),
        1 => Some(ErrorState::AuthFailed),
        2 => Some(ErrorState::LookupFailed),
        3 => Some(ErrorState::UnreachableServer),
        4 => Some(ErrorState::GenericNetworkError),
        5 => Some(ErrorState::Aborted),
        6 => Some(ErrorState::Timeout),
        _ => None,
    }
}

/// Engine operations supplied by the native side
///
/// `connect` receives the marshaled profile as a TOML string and the verbose
/// logging flag; both callbacks return 0 for accepted. The callbacks must be
/// callable from any thread; `ctx` is passed back verbatim.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct CharonEngineCallbacks {
    pub ctx: *mut c_void,
    pub connect:
        Option<unsafe extern "C" fn(ctx: *mut c_void, profile: *const c_char, log_all: c_int) -> c_int>,
    pub disconnect: Option<unsafe extern "C" fn(ctx: *mut c_void) -> c_int>,
}

struct CallbackHandle {
    callbacks: CharonEngineCallbacks,
    listener: Mutex<Option<mpsc::UnboundedSender<EngineNotification>>>,
}

// The callback contract requires thread-safe callbacks; ctx travels with them.
unsafe impl Send for CallbackHandle {}
unsafe impl Sync for CallbackHandle {}

impl CallbackHandle {
    fn notify(&self, state: SessionState, error: ErrorState) {
        if let Some(tx) = self.listener.lock().unwrap().as_ref() {
            let _ = tx.send(EngineNotification::new(state, error));
        }
    }
}

#[async_trait]
impl EngineHandle for CallbackHandle {
    async fn connect(&self, profile: &EngineProfile, log_all: bool) -> Result<()> {
        let connect = self
            .callbacks
            .connect
            .ok_or(SessionError::Unbound)?;
        let marshaled = toml::to_string(profile)
            .map_err(|e| SessionError::Config(format!("Failed to marshal profile: {e}")))?;
        let marshaled = CString::new(marshaled)
            .map_err(|e| SessionError::Config(format!("Profile contains NUL: {e}")))?;

        let code = unsafe { connect(self.callbacks.ctx, marshaled.as_ptr(), c_int::from(log_all)) };
        if code == 0 {
            Ok(())
        } else {
            Err(SessionError::Engine(ErrorState::GenericNetworkError))
        }
    }

    async fn disconnect(&self) -> Result<()> {
        let disconnect = self
            .callbacks
            .disconnect
            .ok_or(SessionError::Unbound)?;
        let code = unsafe { disconnect(self.callbacks.ctx) };
        if code == 0 {
            Ok(())
        } else {
            Err(SessionError::Engine(ErrorState::GenericNetworkError))
        }
    }

    fn register_listener(&self, listener: mpsc::UnboundedSender<EngineNotification>) {
        *self.listener.lock().unwrap() = Some(listener);
    }

    fn unregister_listener(&self) {
        *self.listener.lock().unwrap() = None;
    }
}

struct CallbackEngine {
    handle: Arc<CallbackHandle>,
}

#[async_trait]
impl VpnEngine for CallbackEngine {
    async fn bind(&self) -> Result<Arc<dyn EngineHandle>> {
        // The native side handed over working callbacks; the binding is
        // established as soon as the controller asks for it.
        Ok(self.handle.clone() as Arc<dyn EngineHandle>)
    }
}

struct StateCallback {
    callback: unsafe extern "C" fn(*mut c_void, c_int, c_int),
    ctx: *mut c_void,
}

unsafe impl Send for StateCallback {}

/// Opaque session handle for C callers
pub struct CharonSession {
    runtime: tokio::runtime::Runtime,
    controller: SessionController,
    handle: Arc<CallbackHandle>,
}

unsafe fn write_error_msg(error_msg: *mut c_char, error_msg_len: usize, message: &str) {
    if error_msg.is_null() || error_msg_len == 0 {
        return;
    }
    let error_cstr = CString::new(message).unwrap_or_default();
    let error_bytes = error_cstr.as_bytes_with_nul();
    let copy_len = std::cmp::min(error_bytes.len(), error_msg_len - 1);

    ptr::copy_nonoverlapping(error_bytes.as_ptr() as *const c_char, error_msg, copy_len);
    *error_msg.add(copy_len) = 0; // Null terminate
}

/// Parse and validate a connection profile
///
/// # Parameters
/// - `profile_str`: TOML profile string
/// - `error_msg`: Output buffer for error messages (nullable)
/// - `error_msg_len`: Size of error message buffer
///
/// # Returns
/// - 0 on success
/// - Error code on failure
#[no_mangle]
pub unsafe extern "C" fn charon_profile_validate(
    profile_str: *const c_char,
    error_msg: *mut c_char,
    error_msg_len: usize,
) -> c_int {
    if profile_str.is_null() {
        return CharonError::InvalidParameter as c_int;
    }

    let profile_str = match CStr::from_ptr(profile_str).to_str() {
        Ok(s) => s,
        Err(_) => return CharonError::InvalidParameter as c_int,
    };

    let outcome = profile_str
        .parse::<ConnectionProfile>()
        .and_then(|profile| profile.validate());
    match outcome {
        Ok(()) => CharonError::Success as c_int,
        Err(err) => {
            write_error_msg(error_msg, error_msg_len, &err.to_string());
            CharonError::from(err) as c_int
        }
    }
}

/// Create a new session over the supplied engine callbacks
///
/// # Returns
/// - Opaque pointer to the session on success
/// - NULL on failure
#[no_mangle]
pub unsafe extern "C" fn charon_session_new(
    callbacks: *const CharonEngineCallbacks,
) -> *mut CharonSession {
    if callbacks.is_null() {
        return ptr::null_mut();
    }
    let callbacks = *callbacks;

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(_) => return ptr::null_mut(),
    };

    let handle = Arc::new(CallbackHandle {
        callbacks,
        listener: Mutex::new(None),
    });
    let engine = Arc::new(CallbackEngine {
        handle: handle.clone(),
    });

    let controller = runtime.block_on(async {
        SessionController::new(engine, Arc::new(AutoGrantPrompt), TimeoutSettings::default())
    });

    Box::into_raw(Box::new(CharonSession {
        runtime,
        controller,
        handle,
    }))
}

/// Request a VPN connection
///
/// # Parameters
/// - `session`: Session from `charon_session_new`
/// - `profile_str`: TOML profile string
/// - `reconnect`: Non-zero to tear down an active session first
/// - `log_all`: Non-zero for verbose engine logging
///
/// # Returns
/// - 0 once the engine accepted the request
/// - `PermissionDenied` when the attempt ended without a fault
/// - Error code on failure
#[no_mangle]
pub unsafe extern "C" fn charon_session_connect(
    session: *mut CharonSession,
    profile_str: *const c_char,
    reconnect: c_int,
    log_all: c_int,
) -> c_int {
    if session.is_null() || profile_str.is_null() {
        return CharonError::InvalidParameter as c_int;
    }

    let session = &*session;
    let profile_str = match CStr::from_ptr(profile_str).to_str() {
        Ok(s) => s,
        Err(_) => return CharonError::InvalidParameter as c_int,
    };
    let profile = match profile_str.parse::<ConnectionProfile>() {
        Ok(profile) => profile,
        Err(err) => return CharonError::from(err) as c_int,
    };

    let options = ConnectOptions {
        reconnect: reconnect != 0,
        log_all: log_all != 0,
    };
    match session
        .runtime
        .block_on(session.controller.connect(&profile, options))
    {
        Ok(true) => CharonError::Success as c_int,
        Ok(false) => CharonError::PermissionDenied as c_int,
        Err(err) => CharonError::from(err) as c_int,
    }
}

/// Tear the session down
///
/// # Returns
/// - 0 on success
/// - Error code on failure
#[no_mangle]
pub unsafe extern "C" fn charon_session_disconnect(session: *mut CharonSession) -> c_int {
    if session.is_null() {
        return CharonError::InvalidParameter as c_int;
    }

    let session = &*session;
    match session.runtime.block_on(session.controller.disconnect()) {
        Ok(()) => CharonError::Success as c_int,
        Err(err) => CharonError::from(err) as c_int,
    }
}

/// Get the current session state
///
/// # Returns
/// - State code (see [`CharonState`])
/// - -1 for an invalid session
#[no_mangle]
pub unsafe extern "C" fn charon_session_state(session: *const CharonSession) -> c_int {
    if session.is_null() {
        return -1;
    }

    let session = &*session;
    state_code(session.controller.current_state().state)
}

/// Get the current engine error state
///
/// # Returns
/// - Error state code (see [`CharonErrorState`])
/// - -1 for an invalid session
#[no_mangle]
pub unsafe extern "C" fn charon_session_error_state(session: *const CharonSession) -> c_int {
    if session.is_null() {
        return -1;
    }

    let session = &*session;
    error_state_code(session.controller.current_error())
}

/// Push an engine state change into the session
///
/// The native engine implementation calls this from its own listener; the
/// session relays the change to every subscriber in arrival order.
///
/// # Returns
/// - 0 on success
/// - `InvalidParameter` for an unknown state or error code
#[no_mangle]
pub unsafe extern "C" fn charon_session_notify(
    session: *mut CharonSession,
    state: c_int,
    error: c_int,
) -> c_int {
    if session.is_null() {
        return CharonError::InvalidParameter as c_int;
    }

    let session = &*session;
    let (state, error) = match (state_from_code(state), error_state_from_code(error)) {
        (Some(state), Some(error)) => (state, error),
        _ => return CharonError::InvalidParameter as c_int,
    };

    session.handle.notify(state, error);
    CharonError::Success as c_int
}

/// Register a state-change callback
///
/// The callback receives `(ctx, state_code, error_state_code)` for the
/// latest known pair immediately, then for every later change, from a
/// session-owned thread.
///
/// # Returns
/// - 0 on success
/// - Error code on failure
#[no_mangle]
pub unsafe extern "C" fn charon_session_set_state_callback(
    session: *mut CharonSession,
    callback: Option<unsafe extern "C" fn(ctx: *mut c_void, state: c_int, error: c_int)>,
    ctx: *mut c_void,
) -> c_int {
    if session.is_null() {
        return CharonError::InvalidParameter as c_int;
    }
    let callback = match callback {
        Some(callback) => callback,
        None => return CharonError::InvalidParameter as c_int,
    };

    let session = &*session;
    let mut subscription = session.controller.subscribe();
    let sink = StateCallback { callback, ctx };

    session.runtime.spawn(async move {
        // Capture the whole `sink` (which is `Send`) rather than its individual
        // fields, so the future stays `Send` under edition-2021 closure capture.
        let sink = sink;
        while let Some(snapshot) = subscription.next().await {
            unsafe {
                (sink.callback)(sink.ctx, state_code(snapshot.state), error_state_code(snapshot.error));
            }
        }
    });

    CharonError::Success as c_int
}

/// Free a session
///
/// Disconnects, tears down the engine binding and releases the runtime.
#[no_mangle]
pub unsafe extern "C" fn charon_session_free(session: *mut CharonSession) {
    if !session.is_null() {
        let session = Box::from_raw(session);
        let _ = session.runtime.block_on(session.controller.shutdown());
    }
}

/// Get library version
///
/// # Returns
/// - Version string (caller must not free)
#[no_mangle]
pub unsafe extern "C" fn charon_version() -> *const c_char {
    static VERSION_CSTR: &[u8] = concat!(env!("CARGO_PKG_VERSION"), "\0").as_bytes();
    VERSION_CSTR.as_ptr() as *const c_char
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
    use std::time::{Duration, Instant};

    static CONNECTS: AtomicU32 = AtomicU32::new(0);
    static DISCONNECTS: AtomicU32 = AtomicU32::new(0);
    static LAST_STATE: AtomicI32 = AtomicI32::new(-1);

    unsafe extern "C" fn record_connect(
        _ctx: *mut c_void,
        _profile: *const c_char,
        _log_all: c_int,
    ) -> c_int {
        CONNECTS.fetch_add(1, Ordering::SeqCst);
        0
    }

    unsafe extern "C" fn record_disconnect(_ctx: *mut c_void) -> c_int {
        DISCONNECTS.fetch_add(1, Ordering::SeqCst);
        0
    }

    unsafe extern "C" fn record_state(_ctx: *mut c_void, state: c_int, _error: c_int) {
        LAST_STATE.store(state, Ordering::SeqCst);
    }

    fn callbacks() -> CharonEngineCallbacks {
        CharonEngineCallbacks {
            ctx: ptr::null_mut(),
            connect: Some(record_connect),
            disconnect: Some(record_disconnect),
        }
    }

    const PROFILE_TOML: &str = "name = \"A\"\nserver = \"vpn.example.com\"\n\n[auth]\nmode = \"password\"\nusername = \"u\"\npassword = \"p\"\n";

    /// Poll a state query until it reports the wanted code.
    unsafe fn wait_for_state(session: *mut CharonSession, wanted: c_int) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if charon_session_state(session) == wanted {
                return;
            }
            assert!(Instant::now() < deadline, "state {wanted} never reported");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_profile_validate() {
        let valid = CString::new(PROFILE_TOML).unwrap();
        let code = unsafe { charon_profile_validate(valid.as_ptr(), ptr::null_mut(), 0) };
        assert_eq!(code, CharonError::Success as c_int);

        let invalid = CString::new("name = \"A\"\nserver = \"\"\n\n[auth]\nmode = \"pkcs12\"\npassphrase = \"s\"\n").unwrap();
        let mut buffer = [0 as c_char; 128];
        let code = unsafe {
            charon_profile_validate(invalid.as_ptr(), buffer.as_mut_ptr(), buffer.len())
        };
        assert_eq!(code, CharonError::InvalidProfile as c_int);
        let message = unsafe { CStr::from_ptr(buffer.as_ptr()) }.to_str().unwrap();
        assert!(message.contains("Server address"));

        let code = unsafe { charon_profile_validate(ptr::null(), ptr::null_mut(), 0) };
        assert_eq!(code, CharonError::InvalidParameter as c_int);
    }

    #[test]
    fn test_null_session_arguments() {
        let profile = CString::new(PROFILE_TOML).unwrap();
        unsafe {
            assert!(charon_session_new(ptr::null()).is_null());
            assert_eq!(
                charon_session_connect(ptr::null_mut(), profile.as_ptr(), 0, 1),
                CharonError::InvalidParameter as c_int
            );
            assert_eq!(
                charon_session_disconnect(ptr::null_mut()),
                CharonError::InvalidParameter as c_int
            );
            assert_eq!(charon_session_state(ptr::null()), -1);
            assert_eq!(charon_session_error_state(ptr::null()), -1);
            assert_eq!(
                charon_session_notify(ptr::null_mut(), 1, 0),
                CharonError::InvalidParameter as c_int
            );
            // Freeing NULL is a no-op.
            charon_session_free(ptr::null_mut());
        }
    }

    /// Poll the state-callback sink until it reports the wanted code.
    fn wait_for_callback_state(wanted: c_int) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while LAST_STATE.load(Ordering::SeqCst) != wanted {
            assert!(Instant::now() < deadline, "callback state {wanted} never seen");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_session_lifecycle_over_ffi() {
        let callbacks = callbacks();
        let session = unsafe { charon_session_new(&callbacks) };
        assert!(!session.is_null());

        unsafe {
            wait_for_state(session, CharonState::Disconnected as c_int);
            let code = charon_session_set_state_callback(session, Some(record_state), ptr::null_mut());
            assert_eq!(code, CharonError::Success as c_int);
            // The latest known pair is replayed to the new callback.
            wait_for_callback_state(CharonState::Disconnected as c_int);

            let profile = CString::new(PROFILE_TOML).unwrap();
            let code = charon_session_connect(session, profile.as_ptr(), 0, 1);
            assert_eq!(code, CharonError::Success as c_int);
            assert_eq!(CONNECTS.load(Ordering::SeqCst), 1);
            wait_for_state(session, CharonState::Connecting as c_int);

            // The native engine reports the tunnel up, then down again.
            let code = charon_session_notify(
                session,
                CharonState::Connected as c_int,
                CharonErrorState::NoError as c_int,
            );
            assert_eq!(code, CharonError::Success as c_int);
            wait_for_state(session, CharonState::Connected as c_int);
            wait_for_callback_state(CharonState::Connected as c_int);
            assert_eq!(
                charon_session_error_state(session),
                CharonErrorState::NoError as c_int
            );

            // Unknown codes are rejected.
            assert_eq!(
                charon_session_notify(session, 42, 0),
                CharonError::InvalidParameter as c_int
            );

            charon_session_notify(
                session,
                CharonState::Disconnected as c_int,
                CharonErrorState::NoError as c_int,
            );
            wait_for_state(session, CharonState::Disconnected as c_int);

            charon_session_free(session);
        }

        // The session was idle at free time, so no teardown was forwarded.
        assert_eq!(DISCONNECTS.load(Ordering::SeqCst), 0);
    }
}
