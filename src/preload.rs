//! Preload glue
//!
//! This is the only part of the crate that knows it lives inside someone
//! else's process: the interposed `XMapWindow`, the two signal trampolines,
//! and the load-time constructor that sets up logging and takes this object
//! back out of `LD_PRELOAD` so the host's children run uninstrumented.

use crate::config::DeferConfig;
use crate::identity::Names;
use crate::interceptor::Interceptor;
use crate::signals::UnixProcess;
use crate::window_system::WindowId;
use crate::xlib::{Display, DisplayPtr, Xlib};
use log::{debug, info};
use std::ffi::{CStr, OsStr, OsString};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::raw::{c_int, c_void};
use std::path::Path;
use std::sync::OnceLock;

/// Environment variable the dynamic loader reads preload objects from
pub const PRELOAD_ENV: &str = "LD_PRELOAD";

/// Environment variable holding the `env_logger` filter
pub const LOG_ENV: &str = "DEFERRED_MAP_LOG";

/// File name this object is built as, used when `dladdr` has nothing better
const DEFAULT_OBJECT_NAME: &str = "libdeferred_map.so";

type ProcessInterceptor = Interceptor<Xlib, UnixProcess>;

static INTERCEPTOR: OnceLock<ProcessInterceptor> = OnceLock::new();

fn interceptor() -> &'static ProcessInterceptor {
    INTERCEPTOR.get_or_init(|| {
        let config = DeferConfig::from_env();
        let names = Names::resolve(&config.server_name);
        let process = UnixProcess::new(names, on_release_signal, on_timeout_signal);
        Interceptor::new(config, Xlib::new(), process)
    })
}

/// Interposed `XMapWindow`
#[no_mangle]
#[allow(non_snake_case)]
pub extern "C" fn XMapWindow(display: *mut Display, window: WindowId) -> c_int {
    let interceptor = interceptor();
    // A missing real XMapWindow must fail now, not when the release arrives
    interceptor.windows().real_map_window();
    interceptor.map_window(DisplayPtr(display), window).status()
}

/// Runs `f` without disturbing the interrupted code's `errno`
fn preserving_errno(f: impl FnOnce()) {
    let errno = unsafe { libc::__errno_location() };
    let saved = unsafe { *errno };
    f();
    unsafe {
        *errno = saved;
    }
}

extern "C" fn on_release_signal(signal: c_int) {
    preserving_errno(|| {
        debug!("📨 Release signal {}", signal);
        if let Some(interceptor) = INTERCEPTOR.get() {
            interceptor.release();
        }
    });
}

extern "C" fn on_timeout_signal(_signal: c_int) {
    // Must not allocate: the alarm can interrupt the host inside malloc
    preserving_errno(|| {
        if let Some(interceptor) = INTERCEPTOR.get() {
            interceptor.expire();
        }
    });
}

/// Drop every entry naming `object` from an `LD_PRELOAD` value
///
/// Entries are separated by colons or whitespace, as ld.so accepts. Works on
/// raw bytes so other entries survive exactly, UTF-8 or not. Returns `None`
/// when nothing else was preloaded.
pub fn scrub_preload_list(value: &OsStr, object: &OsStr) -> Option<OsString> {
    let kept: Vec<&[u8]> = value
        .as_bytes()
        .split(|b| *b == b':' || b.is_ascii_whitespace())
        .filter(|entry| !entry.is_empty())
        .filter(|entry| Path::new(OsStr::from_bytes(entry)).file_name() != Some(object))
        .collect();

    if kept.is_empty() {
        None
    } else {
        Some(OsString::from_vec(kept.join(&b':')))
    }
}

/// File name of the shared object this code was loaded from
fn object_name() -> OsString {
    let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
    let here = object_name as *const c_void;
    if unsafe { libc::dladdr(here, &mut info) } != 0 && !info.dli_fname.is_null() {
        let path = unsafe { CStr::from_ptr(info.dli_fname) };
        if let Some(name) = Path::new(OsStr::from_bytes(path.to_bytes())).file_name() {
            return name.to_os_string();
        }
    }
    OsString::from(DEFAULT_OBJECT_NAME)
}

fn scrub_preload_env() {
    let Some(value) = std::env::var_os(PRELOAD_ENV) else {
        return;
    };
    let object = object_name();

    match scrub_preload_list(&value, &object) {
        Some(rest) if rest == value => {}
        Some(rest) => {
            debug!("🧹 {}={:?}", PRELOAD_ENV, rest);
            std::env::set_var(PRELOAD_ENV, rest);
        }
        None => {
            debug!("🧹 Unset {}", PRELOAD_ENV);
            std::env::remove_var(PRELOAD_ENV);
        }
    }
}

fn init_logging() {
    let env = env_logger::Env::new().filter_or(LOG_ENV, "warn");
    // The host may have its own logger; never replace it
    let _ = env_logger::Builder::from_env(env).try_init();
}

#[cfg_attr(test, allow(dead_code))]
extern "C" fn on_load() {
    init_logging();
    scrub_preload_env();
    let interceptor = interceptor();
    info!(
        "🚀 deferred-map {} ({}, built {}) loaded in pid {}, advertising as {:?}",
        crate::VERSION,
        crate::GIT_COMMIT,
        crate::BUILD_DATE,
        std::process::id(),
        interceptor.config().server_name
    );
}

// Runs once when the dynamic loader maps this object, before the host's main
#[cfg(not(test))]
#[used]
#[link_section = ".init_array"]
static ON_LOAD: extern "C" fn() = on_load;

#[cfg(test)]
mod tests {
    use super::*;

    fn scrub(value: &str) -> Option<String> {
        scrub_preload_list(OsStr::new(value), OsStr::new("libdeferred_map.so"))
            .map(|rest| rest.to_string_lossy().into_owned())
    }

    #[test]
    fn scrub_removes_only_this_object() {
        assert_eq!(
            scrub("/usr/lib/libfoo.so:/opt/lib/libdeferred_map.so"),
            Some("/usr/lib/libfoo.so".to_string())
        );
    }

    #[test]
    fn scrub_accepts_whitespace_separators() {
        assert_eq!(
            scrub("libdeferred_map.so  libbar.so\tlibbaz.so"),
            Some("libbar.so:libbaz.so".to_string())
        );
    }

    #[test]
    fn scrub_leaves_nothing_when_only_this_object() {
        assert_eq!(scrub("./target/release/libdeferred_map.so"), None);
        assert_eq!(scrub(""), None);
    }

    #[test]
    fn scrub_keeps_lookalike_names() {
        assert_eq!(
            scrub("/lib/libdeferred_map.so.bak"),
            Some("/lib/libdeferred_map.so.bak".to_string())
        );
    }

    #[test]
    fn scrub_keeps_non_utf8_entries_byte_for_byte() {
        let value = OsStr::from_bytes(b"/opt/caf\xe9/libx.so:/lib/libdeferred_map.so");
        let rest = scrub_preload_list(value, OsStr::new("libdeferred_map.so"))
            .expect("other entry kept");
        assert_eq!(rest.as_bytes(), b"/opt/caf\xe9/libx.so");
    }

    #[test]
    fn object_name_is_never_empty() {
        assert!(!object_name().is_empty());
    }
}
