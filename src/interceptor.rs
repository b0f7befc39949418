//! Interception and the deferral state machine
//!
//! [`Interceptor`] owns the deferred slot and drives the three transitions:
//!
//! ```text
//!            capture (first top-level map)
//!   Idle ─────────────────────────────────► Armed
//!                                             │
//!              release signal ────────────────┤──► Resolved (window mapped)
//!              idle timeout ──────────────────┘──► Resolved (process ends)
//! ```
//!
//! Every map request after the first capture is passed straight through,
//! and whichever of release or timeout drains the slot first is the only
//! transition that ever runs.

use crate::config::DeferConfig;
use crate::identity::Identity;
use crate::signals::{notice, ProcessControl};
use crate::slot::{Deferred, DeferredSlot, SlotPhase};
use crate::window_system::{WindowId, WindowSystem};
use log::{debug, info, warn};
use std::os::raw::c_int;

/// Status returned for a map request that was parked instead of performed
///
/// Matches what Xlib's own `XMapWindow` returns.
pub const MAP_DEFERRED: c_int = 1;

/// Where the process is in the deferral protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferState {
    /// Nothing captured yet
    Idle,
    /// A window is parked, handlers and timeout are live
    Armed,
    /// The parked window was released or abandoned
    Resolved,
}

/// What a map request turned into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapOutcome {
    /// The window was parked; nothing was mapped
    Deferred,
    /// The real map ran and returned this status
    Passthrough(c_int),
}

impl MapOutcome {
    /// Status to hand back to the caller of `XMapWindow`
    pub fn status(self) -> c_int {
        match self {
            MapOutcome::Deferred => MAP_DEFERRED,
            MapOutcome::Passthrough(status) => status,
        }
    }
}

/// Owner of the deferred slot and the transitions out of it
pub struct Interceptor<W: WindowSystem, P: ProcessControl> {
    config: DeferConfig,
    windows: W,
    process: P,
    slot: DeferredSlot<W::Connection>,
}

impl<W: WindowSystem, P: ProcessControl> Interceptor<W, P> {
    pub fn new(config: DeferConfig, windows: W, process: P) -> Self {
        Self {
            config,
            windows,
            process,
            slot: DeferredSlot::new(),
        }
    }

    pub fn config(&self) -> &DeferConfig {
        &self.config
    }

    pub fn windows(&self) -> &W {
        &self.windows
    }

    pub fn state(&self) -> DeferState {
        match self.slot.phase() {
            SlotPhase::Empty => DeferState::Idle,
            SlotPhase::Held => DeferState::Armed,
            SlotPhase::Drained => DeferState::Resolved,
        }
    }

    /// The parked request, if one is waiting
    pub fn pending(&self) -> Option<Deferred<W::Connection>> {
        self.slot.peek()
    }

    /// Handle one `XMapWindow` call
    pub fn map_window(&self, connection: W::Connection, window: WindowId) -> MapOutcome {
        if self.slot.is_claimed() {
            debug!("➡️ Map {:#x}: a window was already deferred, passing through", window);
            return self.passthrough(connection, window);
        }

        if !self.windows.is_toplevel(connection, window) {
            debug!("➡️ Map {:#x}: not a top-level window, passing through", window);
            return self.passthrough(connection, window);
        }

        // Neither signal may run until the slot, handlers and name agree
        let held = self.process.hold_signals();
        let outcome = self.arm(connection, window);
        self.process.release_signals(held);
        outcome
    }

    fn arm(&self, connection: W::Connection, window: WindowId) -> MapOutcome {
        if !self.slot.try_capture(connection, window) {
            return self.passthrough(connection, window);
        }

        if let Err(e) = self.process.install_handlers() {
            warn!("⚠️ Cannot defer window {:#x}: {}", window, e);
            // Spend the slot so later windows do not retry
            let _ = self.slot.take();
            return self.passthrough(connection, window);
        }

        if self.config.timeout_enabled() {
            self.process.arm_timeout(self.config.idle_timeout_secs);
        }

        if let Err(e) = self.process.set_identity(Identity::Discoverable) {
            warn!("⚠️ Window {:#x} deferred but not discoverable: {}", window, e);
        }

        if self.config.timeout_enabled() {
            // The timeout itself runs in a signal handler and cannot log
            info!(
                "⏸️ Deferred window {:#x}, waiting for release as {:?}, giving up after {}s",
                window, self.config.server_name, self.config.idle_timeout_secs
            );
        } else {
            info!(
                "⏸️ Deferred window {:#x}, waiting for release as {:?}",
                window, self.config.server_name
            );
        }
        MapOutcome::Deferred
    }

    fn passthrough(&self, connection: W::Connection, window: WindowId) -> MapOutcome {
        MapOutcome::Passthrough(self.windows.map_window(connection, window))
    }

    /// Release transition: map the parked window now
    ///
    /// Returns the real map status, or `None` when nothing was parked (the
    /// signal arrived before a capture or after a resolution).
    pub fn release(&self) -> Option<c_int> {
        let Some(deferred) = self.slot.take() else {
            debug!("🔁 Release with nothing deferred, ignoring");
            return None;
        };

        self.process.cancel_timeout();

        if let Err(e) = self.process.set_identity(Identity::Ordinary) {
            debug!("Could not restore process name: {}", e);
        }

        self.process.restore_handlers();

        let status = self.windows.map_window(deferred.connection, deferred.window);
        debug!("▶️ Mapped deferred window {:#x} => {}", deferred.window, status);

        if self.config.activate_window
            && !self.windows.activate(deferred.connection, deferred.window)
        {
            debug!("Activation request for {:#x} not sent", deferred.window);
        }

        if self.config.detach_on_release {
            // Lets a supervisor like `xargs -P` count this server as consumed
            if self.process.detach().is_err() {
                notice(b"deferred-map: could not detach after release\n");
            }
        }

        Some(status)
    }

    /// Timeout transition: abandon the parked window and end the process
    ///
    /// Runs from the alarm handler, so nothing here may allocate or take a
    /// lock. Returns false when nothing was parked.
    pub fn expire(&self) -> bool {
        if self.slot.take().is_none() {
            return false;
        }

        self.process.restore_handlers();
        notice(b"deferred-map: window not released in time, terminating\n");
        self.process.terminate();
        true
    }
}

impl<W, P> std::fmt::Debug for Interceptor<W, P>
where
    W: WindowSystem + std::fmt::Debug,
    P: ProcessControl + std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interceptor")
            .field("config", &self.config)
            .field("windows", &self.windows)
            .field("process", &self.process)
            .field("slot", &self.slot)
            .finish()
    }
}
