//! C ABI for `libcompskyplayaudio`.
//!
//! Two incompatible flavours exist and both name their play function
//! `playAudio`, so a build exports exactly one of them:
//!
//! - `abi-handle` (default): `initFFMPEG() -> handle`, `uninitFFMPEG(handle)`,
//!   `playAudio(handle, path, pan, crossfeed, gain)`. A null handle means
//!   initialisation failed.
//! - `abi-global`: `init_all() -> int`, `uninit_all() -> int`,
//!   `playAudio(path, pan, crossfeed, gain)`. A non-zero return means
//!   initialisation failed.
//!
//! `playAudio` blocks until the file has finished playing. Errors are logged
//! and never cross the boundary.

#![allow(unsafe_code)]

use std::ffi::CStr;
use std::os::raw::c_char;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};

use playaudio_core::{EngineConfig, Error, Result};
use tracing::{debug, error, info};

use crate::engine::{AudioEngine, PlaybackReport};
use crate::logging;
use crate::mix::StereoTransform;

#[cfg(all(feature = "abi-handle", feature = "abi-global"))]
compile_error!("features `abi-handle` and `abi-global` both export `playAudio`; enable only one");

/// An initialised engine as seen by C callers.
pub struct Session {
    engine: AudioEngine,
}

impl Session {
    /// Start a session with an explicit configuration.
    pub fn new(config: EngineConfig) -> Result<Self> {
        let engine = AudioEngine::with_config(config)?;
        info!(
            "playaudio session ready on {} ({} Hz)",
            engine.device_name(),
            engine.output_config().sample_rate
        );
        Ok(Self { engine })
    }

    /// Start a session the way the C entry points do: install logging,
    /// then load configuration from file and environment.
    pub fn from_env() -> Result<Self> {
        logging::init();
        Self::new(EngineConfig::load()?)
    }

    /// Play a file to completion.
    pub fn play(&self, path: &Path, transform: StereoTransform) -> Result<PlaybackReport> {
        self.engine.play_file(path, transform)
    }

    pub const fn engine(&self) -> &AudioEngine {
        &self.engine
    }
}

/// Convert a NUL-terminated C path.
///
/// # Safety
/// `path` must be null or point to a NUL-terminated string that stays valid
/// for the duration of the call.
#[cfg_attr(not(any(feature = "abi-handle", feature = "abi-global")), allow(dead_code))]
unsafe fn path_from_c(path: *const c_char) -> Result<PathBuf> {
    if path.is_null() {
        return Err(Error::InvalidArgument("path is null".to_string()));
    }

    // SAFETY: non-null and NUL-terminated per the caller's contract.
    let bytes = unsafe { CStr::from_ptr(path) }.to_bytes();
    if bytes.is_empty() {
        return Err(Error::InvalidArgument("path is empty".to_string()));
    }

    #[cfg(unix)]
    {
        use std::os::unix::ffi::OsStrExt;
        Ok(PathBuf::from(std::ffi::OsStr::from_bytes(bytes)))
    }

    #[cfg(not(unix))]
    {
        std::str::from_utf8(bytes)
            .map(PathBuf::from)
            .map_err(|e| Error::InvalidArgument(format!("path is not UTF-8: {e}")))
    }
}

/// Shared body of both `playAudio` flavours.
///
/// # Safety
/// Same contract as [`path_from_c`].
#[cfg_attr(not(any(feature = "abi-handle", feature = "abi-global")), allow(dead_code))]
unsafe fn play_from_c(
    session: &Session,
    path: *const c_char,
    pan: f32,
    crossfeed: f32,
    gain: f32,
) -> Result<PlaybackReport> {
    let result = guarded("playAudio", || {
        // SAFETY: forwarded from the caller.
        let path = unsafe { path_from_c(path) }?;
        session.play(&path, StereoTransform::from_raw(pan, crossfeed, gain))
    });

    match &result {
        Ok(report) => debug!("playAudio done: {:?}", report),
        // Per-file failures were already logged by the engine.
        Err(e) if e.is_per_file() && !matches!(e, Error::InvalidArgument(_)) => {
            debug!("playAudio failed: {e}");
        }
        Err(e) => error!("playAudio failed: {e}"),
    }
    result
}

/// Run `f`, turning a panic into `Error::Internal`.
#[cfg_attr(not(any(feature = "abi-handle", feature = "abi-global")), allow(dead_code))]
fn guarded<T>(what: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
    catch_unwind(AssertUnwindSafe(f))
        .unwrap_or_else(|_| Err(Error::Internal(format!("{what} panicked"))))
}

#[cfg_attr(not(any(feature = "abi-handle", feature = "abi-global")), allow(dead_code))]
fn start_session() -> Option<Session> {
    guarded("Audio engine initialisation", Session::from_env)
        .map_err(|e| error!("Failed to initialise audio engine: {e}"))
        .ok()
}

/// Create a session. Returns null on failure.
#[cfg(feature = "abi-handle")]
#[no_mangle]
#[allow(non_snake_case)]
pub extern "C" fn initFFMPEG() -> *mut Session {
    start_session().map_or(std::ptr::null_mut(), |session| Box::into_raw(Box::new(session)))
}

/// Destroy a session created by `initFFMPEG`. Null is ignored.
///
/// # Safety
/// `session` must be null or a pointer returned by `initFFMPEG` that has not
/// been passed to `uninitFFMPEG` before, with no `playAudio` call running on it.
#[cfg(feature = "abi-handle")]
#[no_mangle]
#[allow(non_snake_case)]
pub unsafe extern "C" fn uninitFFMPEG(session: *mut Session) {
    if session.is_null() {
        return;
    }
    // SAFETY: ownership returns from the caller per the contract above.
    let session = unsafe { Box::from_raw(session) };
    if catch_unwind(AssertUnwindSafe(|| drop(session))).is_err() {
        error!("Audio engine shutdown panicked");
    }
}

/// Play `path` on `session`, blocking until it has finished.
///
/// # Safety
/// `session` must be null or a live pointer from `initFFMPEG`; `path` must be
/// null or a NUL-terminated string.
#[cfg(feature = "abi-handle")]
#[no_mangle]
#[allow(non_snake_case)]
pub unsafe extern "C" fn playAudio(
    session: *const Session,
    path: *const c_char,
    pan: f32,
    crossfeed: f32,
    gain: f32,
) {
    // SAFETY: null or live per the contract above.
    let Some(session) = (unsafe { session.as_ref() }) else {
        error!("playAudio called with a null session");
        return;
    };
    // SAFETY: forwarded from the caller.
    let _ = unsafe { play_from_c(session, path, pan, crossfeed, gain) };
}

#[cfg(feature = "abi-global")]
static GLOBAL_SESSION: parking_lot::Mutex<Option<std::sync::Arc<Session>>> =
    parking_lot::const_mutex(None);

/// The session started by `init_all`, if any.
#[cfg(feature = "abi-global")]
pub fn global_session() -> Option<std::sync::Arc<Session>> {
    GLOBAL_SESSION.lock().clone()
}

/// Start the process-wide session. Returns 0 on success, 1 on failure.
/// Calling it again while a session exists is a no-op returning 0.
#[cfg(feature = "abi-global")]
#[no_mangle]
pub extern "C" fn init_all() -> std::os::raw::c_int {
    let mut global = GLOBAL_SESSION.lock();
    if global.is_some() {
        tracing::warn!("init_all called twice; keeping the existing session");
        return 0;
    }

    match start_session() {
        Some(session) => {
            *global = Some(std::sync::Arc::new(session));
            0
        }
        None => 1,
    }
}

/// Tear down the process-wide session. Always returns 0.
///
/// A `playAudio` call already in progress keeps the engine alive until it returns.
#[cfg(feature = "abi-global")]
#[no_mangle]
pub extern "C" fn uninit_all() -> std::os::raw::c_int {
    let session = GLOBAL_SESSION.lock().take();
    if catch_unwind(AssertUnwindSafe(|| drop(session))).is_err() {
        error!("Audio engine shutdown panicked");
    }
    0
}

/// Play `path` on the process-wide session, blocking until it has finished.
///
/// # Safety
/// `path` must be null or a NUL-terminated string.
#[cfg(feature = "abi-global")]
#[no_mangle]
#[allow(non_snake_case)]
pub unsafe extern "C" fn playAudio(path: *const c_char, pan: f32, crossfeed: f32, gain: f32) {
    // Clone out so the lock is not held while playing.
    let Some(session) = global_session() else {
        error!("playAudio called before init_all");
        return;
    };
    // SAFETY: forwarded from the caller.
    let _ = unsafe { play_from_c(&session, path, pan, crossfeed, gain) };
}
