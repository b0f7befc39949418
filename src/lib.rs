//! # deferred-map
//!
//! A preload layer that lets an X11 program start up with its main window
//! hidden, advertise itself as ready, and only show the window when a
//! controller asks for it.
//!
//! ## How it works
//!
//! The first top-level `XMapWindow` call is intercepted and parked instead of
//! performed. The process then renames itself to a well-known server name
//! and waits, carrying on with its own event loop. A controller picks one of
//! the waiting processes by name and sends it `SIGUSR1`; the parked window is
//! mapped, activated, and the process detaches from its terminal. A process
//! left waiting past its idle budget terminates itself.
//!
//! ```text
//! # keep four xterms warm
//! yes | xargs -P4 -I{} env LD_PRELOAD=libdeferred_map.so xterm
//! # show one of them
//! pkill -o -USR1 xtermserver
//! ```
//!
//! ## Modules
//!
//! - `interceptor`: the capture policy and the release/timeout transitions
//! - `slot`: the single-entry store for the parked window
//! - `signals`: handler installation, alarm, detaching (`ProcessControl`)
//! - `identity`: switching the process name
//! - `xlib`: runtime-resolved Xlib calls (`WindowSystem`)
//! - `config`: defaults and the optional TOML override
//! - `preload`: the exported `XMapWindow` and the load-time constructor

pub mod config;
pub mod error;
pub mod identity;
pub mod interceptor;
pub mod preload;
pub mod signals;
pub mod slot;
pub mod window_system;
pub mod xlib;

// Re-export main types for easy access
pub use config::DeferConfig;
pub use error::{DeferError, DeferResult};
pub use identity::{Identity, Names, ProcessName};
pub use interceptor::{DeferState, Interceptor, MapOutcome};
pub use signals::{ProcessControl, UnixProcess, RELEASE_SIGNAL, TIMEOUT_SIGNAL};
pub use slot::{Deferred, DeferredSlot};
pub use window_system::{WindowId, WindowSystem};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
pub const GIT_COMMIT: &str = env!("GIT_COMMIT");
pub const BUILD_DATE: &str = env!("BUILD_DATE");
