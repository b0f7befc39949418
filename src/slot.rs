//! The single-entry deferred slot
//!
//! Holds the one window whose mapping has been postponed. The slot moves
//! through `Empty -> Filling -> Held -> Drained` exactly once; the phase word
//! is the only synchronization, so it can be read from a signal handler
//! without ever blocking.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU8, Ordering};

const EMPTY: u8 = 0;
const FILLING: u8 = 1;
const HELD: u8 = 2;
const DRAINED: u8 = 3;

/// A captured mapping request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deferred<C> {
    /// Connection the request arrived on
    pub connection: C,
    /// Window that was asked to be mapped
    pub window: libc::c_ulong,
}

/// Where the slot is in its one-shot lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotPhase {
    /// Nothing captured yet
    Empty,
    /// A window is parked
    Held,
    /// The parked window was handed out; the slot is spent
    Drained,
}

/// Process-wide holder for the one deferred window
pub struct DeferredSlot<C> {
    phase: AtomicU8,
    entry: UnsafeCell<Option<Deferred<C>>>,
}

// `entry` is written only by the thread that wins EMPTY -> FILLING and read
// only by the caller that wins HELD -> DRAINED; the phase word orders both.
unsafe impl<C: Send> Sync for DeferredSlot<C> {}

impl<C: Copy> DeferredSlot<C> {
    pub const fn new() -> Self {
        Self {
            phase: AtomicU8::new(EMPTY),
            entry: UnsafeCell::new(None),
        }
    }

    /// True once anything has ever been captured, even if already drained
    pub fn is_claimed(&self) -> bool {
        self.phase.load(Ordering::Acquire) != EMPTY
    }

    pub fn phase(&self) -> SlotPhase {
        match self.phase.load(Ordering::Acquire) {
            EMPTY => SlotPhase::Empty,
            DRAINED => SlotPhase::Drained,
            // A capture in flight counts as parked
            _ => SlotPhase::Held,
        }
    }

    /// Park `(connection, window)` if the slot has never been used
    ///
    /// Returns false when some earlier request already claimed it.
    pub fn try_capture(&self, connection: C, window: libc::c_ulong) -> bool {
        if self
            .phase
            .compare_exchange(EMPTY, FILLING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        // SAFETY: we won EMPTY -> FILLING, nobody else touches `entry` until
        // the HELD store below publishes it.
        unsafe {
            *self.entry.get() = Some(Deferred { connection, window });
        }
        self.phase.store(HELD, Ordering::Release);
        true
    }

    /// Hand out the parked window, at most once per process
    pub fn take(&self) -> Option<Deferred<C>> {
        if self
            .phase
            .compare_exchange(HELD, DRAINED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }

        // SAFETY: we won HELD -> DRAINED; the Acquire pairs with the Release
        // in `try_capture` and no later writer can exist.
        unsafe { (*self.entry.get()).take() }
    }

    /// Copy of the parked window without draining it
    pub fn peek(&self) -> Option<Deferred<C>> {
        if self.phase.load(Ordering::Acquire) != HELD {
            return None;
        }
        // SAFETY: HELD means the entry is fully written. A concurrent `take`
        // only swaps it to None after winning the phase, and `C: Copy`.
        unsafe { *self.entry.get() }
    }
}

impl<C: Copy> Default for DeferredSlot<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Copy + std::fmt::Debug> std::fmt::Debug for DeferredSlot<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredSlot")
            .field("phase", &self.phase())
            .field("entry", &self.peek())
            .finish()
    }
}
