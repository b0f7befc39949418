//! Error types for the deferral layer
//!
//! Nothing here ever reaches the host program: the interposed entry point
//! only returns Xlib status codes. These errors exist so the internal steps
//! can report *why* they fell back to passthrough or defaults.

use thiserror::Error;

/// Failures inside the deferral layer
#[derive(Debug, Error)]
pub enum DeferError {
    /// A configuration value is outside what the layer can honor
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A process name the kernel cannot store
    #[error("process name {name:?} is not usable: {reason}")]
    InvalidProcessName { name: String, reason: &'static str },

    /// A required symbol was not found in the process
    #[error("symbol {0} could not be resolved")]
    Unresolved(&'static str),

    /// `sigaction` refused one of our handlers
    #[error("failed to install handler for signal {signal}: {source}")]
    SignalInstall {
        signal: libc::c_int,
        #[source]
        source: std::io::Error,
    },

    /// A process-level syscall failed
    #[error("{call} failed: {source}")]
    Syscall {
        call: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl DeferError {
    /// Capture `errno` for the named syscall
    pub fn last_os_error(call: &'static str) -> Self {
        DeferError::Syscall {
            call,
            source: std::io::Error::last_os_error(),
        }
    }
}

/// Crate-local result alias
pub type DeferResult<T> = std::result::Result<T, DeferError>;
