//! Xlib facade
//!
//! The preload object never links libX11: the host program already has it
//! loaded, so every entry point is looked up at runtime. The real
//! `XMapWindow` must come from *after* this object in lookup order
//! (`RTLD_NEXT`), otherwise we would find our own interposed symbol. The
//! helpers used for the top-level query and activation come from the global
//! scope through `libloading`.

use crate::error::{DeferError, DeferResult};
use crate::window_system::{WindowId, WindowSystem};
use log::{debug, error};
use std::os::raw::{c_char, c_int, c_long, c_uint, c_ulong, c_void};
use std::sync::OnceLock;

/// Opaque Xlib `Display`
#[repr(C)]
pub struct Display {
    _private: [u8; 0],
}

pub type Atom = c_ulong;
pub type Bool = c_int;
pub type Status = c_int;

const FALSE: Bool = 0;
const TRUE: Bool = 1;

/// `ClientMessage` event type
const CLIENT_MESSAGE: c_int = 33;
const SUBSTRUCTURE_NOTIFY_MASK: c_long = 1 << 19;
const SUBSTRUCTURE_REDIRECT_MASK: c_long = 1 << 20;

/// Exit code used when the real `XMapWindow` cannot be found
pub const EXIT_UNRESOLVED: c_int = 127;

/// `XClientMessageEvent` with `format == 32`
#[repr(C)]
#[derive(Clone, Copy)]
pub struct XClientMessageEvent {
    pub type_: c_int,
    pub serial: c_ulong,
    pub send_event: Bool,
    pub display: *mut Display,
    pub window: WindowId,
    pub message_type: Atom,
    pub format: c_int,
    pub data: [c_long; 5],
}

/// `XEvent`; only the client-message arm is ever filled in
#[repr(C)]
pub union XEvent {
    pub client_message: XClientMessageEvent,
    pad: [c_long; 24],
}

pub type MapWindowFn = unsafe extern "C" fn(*mut Display, WindowId) -> c_int;
type QueryTreeFn = unsafe extern "C" fn(
    *mut Display,
    WindowId,
    *mut WindowId,
    *mut WindowId,
    *mut *mut WindowId,
    *mut c_uint,
) -> Status;
type FreeFn = unsafe extern "C" fn(*mut c_void) -> c_int;
type SyncFn = unsafe extern "C" fn(*mut Display, Bool) -> c_int;
type FlushFn = unsafe extern "C" fn(*mut Display) -> c_int;
type InternAtomFn = unsafe extern "C" fn(*mut Display, *const c_char, Bool) -> Atom;
type SendEventFn =
    unsafe extern "C" fn(*mut Display, WindowId, Bool, c_long, *mut XEvent) -> Status;
type DefaultRootWindowFn = unsafe extern "C" fn(*mut Display) -> WindowId;

/// `Display *` as handed to us by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayPtr(pub *mut Display);

// Only ever dereferenced by Xlib, on the thread that owns the connection
unsafe impl Send for DisplayPtr {}

/// Helper entry points looked up from the host's libX11
struct XlibFns {
    // Keeps the lookup handle alive; absent for injected entry points
    _lib: Option<libloading::os::unix::Library>,
    query_tree: QueryTreeFn,
    free: FreeFn,
    sync: SyncFn,
    flush: FlushFn,
    intern_atom: InternAtomFn,
    send_event: SendEventFn,
    default_root_window: DefaultRootWindowFn,
}

impl XlibFns {
    fn load() -> DeferResult<Self> {
        let lib = libloading::os::unix::Library::this();

        macro_rules! sym {
            ($ty:ty, $name:literal) => {
                // SAFETY: signatures match Xlib.h; the handle outlives the copy
                unsafe {
                    *lib.get::<$ty>(concat!($name, "\0").as_bytes())
                        .map_err(|_| DeferError::Unresolved($name))?
                }
            };
        }

        let query_tree = sym!(QueryTreeFn, "XQueryTree");
        let free = sym!(FreeFn, "XFree");
        let sync = sym!(SyncFn, "XSync");
        let flush = sym!(FlushFn, "XFlush");
        let intern_atom = sym!(InternAtomFn, "XInternAtom");
        let send_event = sym!(SendEventFn, "XSendEvent");
        let default_root_window = sym!(DefaultRootWindowFn, "XDefaultRootWindow");

        Ok(Self {
            _lib: Some(lib),
            query_tree,
            free,
            sync,
            flush,
            intern_atom,
            send_event,
            default_root_window,
        })
    }
}

/// [`WindowSystem`] over the host's Xlib
#[derive(Default)]
pub struct Xlib {
    real_map: OnceLock<MapWindowFn>,
    fns: OnceLock<Option<XlibFns>>,
}

impl Xlib {
    pub const fn new() -> Self {
        Self {
            real_map: OnceLock::new(),
            fns: OnceLock::new(),
        }
    }

    /// Xlib backed by the given helper entry points
    #[cfg(test)]
    fn with_fns(fns: XlibFns) -> Self {
        Self {
            real_map: OnceLock::new(),
            fns: OnceLock::from(Some(fns)),
        }
    }

    /// The real `XMapWindow`, resolved on first use
    ///
    /// Failing to find it leaves nothing sensible to do, so the process exits
    /// with a diagnostic instead of hanging with an unmapped window.
    pub fn real_map_window(&self) -> MapWindowFn {
        *self.real_map.get_or_init(|| match resolve_next(c"XMapWindow") {
            Some(map) => map,
            None => {
                error!("❌ Could not resolve the real XMapWindow, is libX11 loaded?");
                std::process::exit(EXIT_UNRESOLVED);
            }
        })
    }

    fn fns(&self) -> Option<&XlibFns> {
        self.fns
            .get_or_init(|| match XlibFns::load() {
                Ok(fns) => Some(fns),
                Err(e) => {
                    debug!("🔍 Xlib helpers unavailable: {}", e);
                    None
                }
            })
            .as_ref()
    }
}

impl std::fmt::Debug for Xlib {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Xlib")
            .field("real_map_resolved", &self.real_map.get().is_some())
            .field("helpers_loaded", &self.fns.get().map(Option::is_some))
            .finish()
    }
}

/// Look `name` up in the objects loaded after this one
fn resolve_next(name: &std::ffi::CStr) -> Option<MapWindowFn> {
    let addr = unsafe { libc::dlsym(libc::RTLD_NEXT, name.as_ptr()) };
    if addr.is_null() {
        return None;
    }
    // SAFETY: a non-null XMapWindow from libX11 has exactly this signature
    Some(unsafe { std::mem::transmute::<*mut c_void, MapWindowFn>(addr) })
}

impl WindowSystem for Xlib {
    type Connection = DisplayPtr;

    fn map_window(&self, connection: DisplayPtr, window: WindowId) -> c_int {
        let map = self.real_map_window();
        unsafe { map(connection.0, window) }
    }

    fn is_toplevel(&self, connection: DisplayPtr, window: WindowId) -> bool {
        let Some(x) = self.fns() else {
            return false;
        };

        let mut root: WindowId = 0;
        let mut parent: WindowId = 0;
        let mut children: *mut WindowId = std::ptr::null_mut();
        let mut nchildren: c_uint = 0;

        let status = unsafe {
            (x.query_tree)(
                connection.0,
                window,
                &mut root,
                &mut parent,
                &mut children,
                &mut nchildren,
            )
        };
        if status == 0 {
            debug!("🔍 XQueryTree({:#x}) failed, treating as child window", window);
            return false;
        }

        if !children.is_null() {
            unsafe {
                (x.free)(children.cast());
            }
        }

        debug!(
            "🔍 Window {:#x}: parent {:#x}, root {:#x}",
            window, parent, root
        );
        parent == root
    }

    fn activate(&self, connection: DisplayPtr, window: WindowId) -> bool {
        let Some(x) = self.fns() else {
            return false;
        };
        let display = connection.0;

        // The map has to reach the server before the WM can act on it
        unsafe {
            (x.sync)(display, FALSE);
            (x.flush)(display);
        }

        let message_type = unsafe { (x.intern_atom)(display, c"_NET_ACTIVE_WINDOW".as_ptr(), TRUE) };
        if message_type == 0 {
            debug!("🪟 No _NET_ACTIVE_WINDOW atom, no EWMH window manager running");
            return false;
        }

        let mut event = XEvent { pad: [0; 24] };
        event.client_message = XClientMessageEvent {
            type_: CLIENT_MESSAGE,
            serial: 0,
            send_event: TRUE,
            display,
            window,
            message_type,
            format: 32,
            // Source indication 0: legacy client, no timestamp
            data: [0; 5],
        };

        let root = unsafe { (x.default_root_window)(display) };
        let status = unsafe {
            (x.send_event)(
                display,
                root,
                FALSE,
                SUBSTRUCTURE_NOTIFY_MASK | SUBSTRUCTURE_REDIRECT_MASK,
                &mut event,
            )
        };
        status != 0
    }
}
