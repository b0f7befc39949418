//! Window system seam
//!
//! The interceptor only needs three things from the display server. Keeping
//! them behind a trait lets the state machine run against a recording fake
//! in tests and against Xlib in the preload object.

use std::os::raw::{c_int, c_ulong};

/// X11 window id
pub type WindowId = c_ulong;

/// Calls the interceptor makes into the window system
#[cfg_attr(test, mockall::automock(type Connection = usize;))]
pub trait WindowSystem {
    /// Handle for a session with the window system
    type Connection: Copy + Send + std::fmt::Debug;

    /// Map `window` for real, bypassing interception
    fn map_window(&self, connection: Self::Connection, window: WindowId) -> c_int;

    /// Whether `window`'s immediate parent is the root window
    ///
    /// A failed query answers false so the window is passed through.
    fn is_toplevel(&self, connection: Self::Connection, window: WindowId) -> bool;

    /// Ask the window manager to raise and focus `window`
    ///
    /// Returns whether the request was sent; callers ignore failures.
    fn activate(&self, connection: Self::Connection, window: WindowId) -> bool;
}
