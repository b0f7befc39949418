//! Process control for the signal state machine
//!
//! Everything the interceptor does to its own process goes through
//! [`ProcessControl`]: masking the two signals while a capture is in flight,
//! installing and restoring their handlers, the idle alarm, the name switch,
//! detaching, and giving up. [`UnixProcess`] is the libc implementation.
//!
//! Handlers are installed with a mask that blocks both signals while either
//! one runs, so a release can never interrupt a timeout or vice versa.

use crate::error::{DeferError, DeferResult};
use crate::identity::{Identity, Names};
use std::cell::UnsafeCell;
use std::os::raw::c_int;
use std::sync::atomic::{AtomicBool, Ordering};

/// Signal a controller sends to release the parked window
pub const RELEASE_SIGNAL: c_int = libc::SIGUSR1;

/// Signal delivered when the idle budget runs out
pub const TIMEOUT_SIGNAL: c_int = libc::SIGALRM;

/// Signature of a handler installed for either signal
pub type SignalHandler = extern "C" fn(c_int);

/// Signal mask saved by [`ProcessControl::hold_signals`]
#[derive(Clone, Copy)]
pub struct HeldSignals(Option<libc::sigset_t>);

impl HeldSignals {
    /// Nothing to restore
    pub fn none() -> Self {
        Self(None)
    }
}

impl std::fmt::Debug for HeldSignals {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("HeldSignals").field(&self.0.is_some()).finish()
    }
}

/// Process-level operations used by the interceptor
#[cfg_attr(test, mockall::automock)]
pub trait ProcessControl {
    /// Block both signals on the calling thread
    fn hold_signals(&self) -> HeldSignals;

    /// Undo a matching [`ProcessControl::hold_signals`]
    fn release_signals(&self, held: HeldSignals);

    /// Install the release and timeout handlers, remembering the previous ones
    fn install_handlers(&self) -> DeferResult<()>;

    /// Put the previous handlers back; a no-op unless installed
    fn restore_handlers(&self);

    /// Arm the idle alarm; zero leaves it disarmed
    fn arm_timeout(&self, secs: u32);

    fn cancel_timeout(&self);

    fn set_identity(&self, identity: Identity) -> DeferResult<()>;

    /// Leave the controlling terminal and continue in the background
    fn detach(&self) -> DeferResult<()>;

    /// End the process the way an external `kill` would
    fn terminate(&self);
}

#[derive(Clone, Copy)]
struct SavedActions {
    release: libc::sigaction,
    timeout: libc::sigaction,
}

/// [`ProcessControl`] backed by libc
pub struct UnixProcess {
    names: Names,
    on_release: SignalHandler,
    on_timeout: SignalHandler,
    installed: AtomicBool,
    saved: UnsafeCell<Option<SavedActions>>,
}

// `saved` is written before `installed` is set (Release) and read only by the
// caller that swaps `installed` back to false (AcqRel), so at most one thread
// touches it at a time.
unsafe impl Sync for UnixProcess {}

impl UnixProcess {
    pub fn new(names: Names, on_release: SignalHandler, on_timeout: SignalHandler) -> Self {
        Self {
            names,
            on_release,
            on_timeout,
            installed: AtomicBool::new(false),
            saved: UnsafeCell::new(None),
        }
    }

    /// Whether our handlers are currently in place
    pub fn handlers_installed(&self) -> bool {
        self.installed.load(Ordering::Acquire)
    }

    fn install(signal: c_int, handler: SignalHandler) -> DeferResult<libc::sigaction> {
        // SAFETY: zeroed sigaction is a valid "no flags, empty mask" value
        let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
        action.sa_sigaction = handler as libc::sighandler_t;
        action.sa_flags = libc::SA_RESTART;
        action.sa_mask = deferral_sigset();

        let mut previous: libc::sigaction = unsafe { std::mem::zeroed() };
        if unsafe { libc::sigaction(signal, &action, &mut previous) } != 0 {
            return Err(DeferError::SignalInstall {
                signal,
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(previous)
    }

    fn put_back(signal: c_int, action: &libc::sigaction) {
        // Restoring a disposition the kernel handed us cannot fail for a valid signal
        unsafe {
            libc::sigaction(signal, action, std::ptr::null_mut());
        }
    }
}

impl std::fmt::Debug for UnixProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnixProcess")
            .field("names", &self.names)
            .field("installed", &self.handlers_installed())
            .finish()
    }
}

/// Write a fixed message to stderr from signal context
///
/// A bare `write(2)`: no formatting, no allocation, no logger lock.
pub fn notice(message: &'static [u8]) {
    unsafe {
        libc::write(libc::STDERR_FILENO, message.as_ptr().cast(), message.len());
    }
}

/// Set containing the release and timeout signals
fn deferral_sigset() -> libc::sigset_t {
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, RELEASE_SIGNAL);
        libc::sigaddset(&mut set, TIMEOUT_SIGNAL);
        set
    }
}

impl ProcessControl for UnixProcess {
    fn hold_signals(&self) -> HeldSignals {
        let block = deferral_sigset();
        let mut previous: libc::sigset_t = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::pthread_sigmask(libc::SIG_BLOCK, &block, &mut previous) };
        if rc != 0 {
            return HeldSignals::none();
        }
        HeldSignals(Some(previous))
    }

    fn release_signals(&self, held: HeldSignals) {
        if let Some(previous) = held.0 {
            unsafe {
                libc::pthread_sigmask(libc::SIG_SETMASK, &previous, std::ptr::null_mut());
            }
        }
    }

    fn install_handlers(&self) -> DeferResult<()> {
        let release = Self::install(RELEASE_SIGNAL, self.on_release)?;
        let timeout = match Self::install(TIMEOUT_SIGNAL, self.on_timeout) {
            Ok(previous) => previous,
            Err(e) => {
                Self::put_back(RELEASE_SIGNAL, &release);
                return Err(e);
            }
        };

        // SAFETY: `installed` is still false, so no restorer reads `saved`
        unsafe {
            *self.saved.get() = Some(SavedActions { release, timeout });
        }
        self.installed.store(true, Ordering::Release);
        Ok(())
    }

    fn restore_handlers(&self) {
        if !self.installed.swap(false, Ordering::AcqRel) {
            return;
        }
        // SAFETY: we are the only caller that observed `installed == true`
        if let Some(saved) = unsafe { (*self.saved.get()).take() } {
            Self::put_back(RELEASE_SIGNAL, &saved.release);
            Self::put_back(TIMEOUT_SIGNAL, &saved.timeout);
        }
    }

    fn arm_timeout(&self, secs: u32) {
        unsafe {
            libc::alarm(secs);
        }
    }

    fn cancel_timeout(&self) {
        unsafe {
            libc::alarm(0);
        }
    }

    fn set_identity(&self, identity: Identity) -> DeferResult<()> {
        self.names.assume(identity)
    }

    fn detach(&self) -> DeferResult<()> {
        // Keep the working directory, point stdio at /dev/null
        if unsafe { libc::daemon(1, 0) } == -1 {
            return Err(DeferError::last_os_error("daemon"));
        }
        Ok(())
    }

    fn terminate(&self) {
        unsafe {
            libc::raise(libc::SIGTERM);
        }
    }
}
