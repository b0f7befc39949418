//! Discovery identity
//!
//! A parked process renames itself (the `comm` shown by `ps` and matched by
//! `pkill`) so a controller can find exactly the processes waiting for
//! release. Release renames it back.

use crate::config::MAX_PROCESS_NAME_LEN;
use crate::error::{DeferError, DeferResult};
use log::warn;
use std::ffi::{CStr, CString};

/// Main thread's name, writable by any thread in the process
const PROCESS_COMM: &str = "/proc/self/comm";
const PROCESS_COMM_C: &CStr = c"/proc/self/comm";

/// Which of the two names the process should carry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Identity {
    /// The name the process started with
    Ordinary,
    /// The well-known "waiting for release" name
    Discoverable,
}

/// A name the kernel will store verbatim
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessName(CString);

impl ProcessName {
    pub fn new(name: &str) -> DeferResult<Self> {
        if name.is_empty() {
            return Err(DeferError::InvalidProcessName {
                name: name.to_string(),
                reason: "empty",
            });
        }
        if name.len() > MAX_PROCESS_NAME_LEN {
            return Err(DeferError::InvalidProcessName {
                name: name.to_string(),
                reason: "longer than 15 bytes",
            });
        }
        let c_name = CString::new(name).map_err(|_| DeferError::InvalidProcessName {
            name: name.to_string(),
            reason: "contains NUL",
        })?;
        Ok(Self(c_name))
    }

    /// The process name, i.e. the main thread's `comm`
    pub fn current() -> DeferResult<Self> {
        match std::fs::read(PROCESS_COMM) {
            Ok(mut raw) => {
                if raw.last() == Some(&b'\n') {
                    raw.pop();
                }
                CString::new(raw)
                    .map(Self)
                    .map_err(|_| DeferError::InvalidProcessName {
                        name: PROCESS_COMM.to_string(),
                        reason: "contains NUL",
                    })
            }
            Err(_) => Self::current_thread(),
        }
    }

    /// Name of the calling thread
    pub fn current_thread() -> DeferResult<Self> {
        // PR_GET_NAME writes at most 16 bytes including the terminator
        let mut buf = [0 as libc::c_char; MAX_PROCESS_NAME_LEN + 1];
        let rc = unsafe { libc::prctl(libc::PR_GET_NAME, buf.as_mut_ptr(), 0, 0, 0) };
        if rc != 0 {
            return Err(DeferError::last_os_error("prctl(PR_GET_NAME)"));
        }
        // SAFETY: the kernel always NUL-terminates within the buffer
        let name = unsafe { CStr::from_ptr(buf.as_ptr()) };
        Ok(Self(name.to_owned()))
    }

    /// Rename the process
    ///
    /// Writes the main thread's `comm` through procfs, so the name `ps` and
    /// `pkill` see changes whichever thread the release signal landed on.
    /// Without procfs only the calling thread is renamed. Uses nothing but
    /// `open`/`write`/`close`/`prctl`, so it may run in a signal handler.
    pub fn apply(&self) -> DeferResult<()> {
        let fd = unsafe { libc::open(PROCESS_COMM_C.as_ptr(), libc::O_WRONLY | libc::O_CLOEXEC) };
        if fd >= 0 {
            let bytes = self.0.as_bytes();
            let written = unsafe { libc::write(fd, bytes.as_ptr().cast(), bytes.len()) };
            unsafe {
                libc::close(fd);
            }
            if written == bytes.len() as isize {
                return Ok(());
            }
        }

        let rc = unsafe { libc::prctl(libc::PR_SET_NAME, self.0.as_ptr(), 0, 0, 0) };
        if rc != 0 {
            return Err(DeferError::last_os_error("prctl(PR_SET_NAME)"));
        }
        Ok(())
    }

    /// Best-effort name that never fails
    ///
    /// Truncates to what the kernel keeps and drops NUL bytes; falls back to
    /// `"?"` if nothing usable is left.
    pub fn lossy(name: &str) -> Self {
        let mut end = name.len().min(MAX_PROCESS_NAME_LEN);
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        let cleaned: Vec<u8> = name[..end].bytes().filter(|b| *b != 0).collect();
        let cleaned = if cleaned.is_empty() { b"?".to_vec() } else { cleaned };
        // NUL bytes were filtered out above
        Self(CString::new(cleaned).unwrap_or_default())
    }

    /// Short name the process was invoked as, the way exec(2) sets `comm`
    pub fn invocation() -> Self {
        let argv0 = std::env::args_os().next().unwrap_or_default();
        let base = std::path::Path::new(&argv0)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self::lossy(&base)
    }

    pub fn as_str(&self) -> &str {
        // Constructed from &str or a kernel comm; lossy only for odd comms
        self.0.to_str().unwrap_or("?")
    }
}

impl std::fmt::Display for ProcessName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.to_string_lossy())
    }
}

/// The pair of names a process switches between
#[derive(Debug, Clone)]
pub struct Names {
    pub ordinary: ProcessName,
    pub discoverable: ProcessName,
}

impl Names {
    /// Pair the current name with the configured discoverable one
    pub fn capture(server_name: &str) -> DeferResult<Self> {
        Ok(Self {
            ordinary: ProcessName::current()?,
            discoverable: ProcessName::new(server_name)?,
        })
    }

    /// Like [`Names::capture`] but always produces a usable pair
    pub fn resolve(server_name: &str) -> Self {
        let ordinary = ProcessName::current().unwrap_or_else(|e| {
            warn!("⚠️ {}, using the invocation name instead", e);
            ProcessName::invocation()
        });
        let discoverable = ProcessName::new(server_name).unwrap_or_else(|e| {
            warn!("⚠️ {}", e);
            ProcessName::lossy(server_name)
        });
        Self {
            ordinary,
            discoverable,
        }
    }

    pub fn get(&self, identity: Identity) -> &ProcessName {
        match identity {
            Identity::Ordinary => &self.ordinary,
            Identity::Discoverable => &self.discoverable,
        }
    }

    /// Switch the process to `identity`
    pub fn assume(&self, identity: Identity) -> DeferResult<()> {
        self.get(identity).apply()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::thread;

    #[test]
    fn rejects_names_the_kernel_would_truncate() {
        assert!(ProcessName::new("xtermserver").is_ok());
        assert!(ProcessName::new("0123456789abcde").is_ok());
        assert!(ProcessName::new("0123456789abcdef").is_err());
        assert!(ProcessName::new("").is_err());
        assert!(ProcessName::new("a\0b").is_err());
    }

    #[test]
    #[serial]
    fn rename_from_another_thread_reaches_the_process_name() {
        let before = ProcessName::current().expect("process name");
        let names = Names::capture("xtermserver").expect("names");
        assert_eq!(names.ordinary, before);

        // A multithreaded host may take the release signal on any thread
        thread::spawn(move || {
            let own = ProcessName::current_thread().expect("PR_GET_NAME");
            names.assume(Identity::Discoverable).expect("rename");
            assert_eq!(ProcessName::current().expect("process name").as_str(), "xtermserver");
            assert_eq!(ProcessName::current_thread().expect("PR_GET_NAME"), own);

            names.assume(Identity::Ordinary).expect("restore");
        })
        .join()
        .expect("rename thread panicked");

        assert_eq!(ProcessName::current().expect("process name"), before);
    }

    #[test]
    fn lossy_truncates_like_the_kernel() {
        assert_eq!(ProcessName::lossy("xterm").as_str(), "xterm");
        assert_eq!(
            ProcessName::lossy("a-very-long-process-name").as_str(),
            "a-very-long-pro"
        );
        assert_eq!(ProcessName::lossy("a\0b").as_str(), "ab");
        assert_eq!(ProcessName::lossy("").as_str(), "?");
        // Never splits a multi-byte character
        assert_eq!(ProcessName::lossy("ééééééééé").as_str(), "ééééééé");
    }

    #[test]
    fn resolve_falls_back_for_bad_server_name() {
        let names = Names::resolve("a-very-long-server-name");
        assert_eq!(names.discoverable.as_str(), "a-very-long-ser");
        assert!(!names.ordinary.as_str().is_empty());
    }

    #[test]
    fn names_select_by_identity() {
        let names = Names {
            ordinary: ProcessName::new("xterm").unwrap(),
            discoverable: ProcessName::new("xtermserver").unwrap(),
        };
        assert_eq!(names.get(Identity::Ordinary).as_str(), "xterm");
        assert_eq!(names.get(Identity::Discoverable).to_string(), "xtermserver");
    }
}
