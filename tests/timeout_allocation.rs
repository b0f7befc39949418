//! The timeout transition runs inside the alarm handler, where the host may
//! have been interrupted in the middle of `malloc`. It must not touch the
//! heap, even with the most verbose logger installed.

use deferred_map::signals::HeldSignals;
use deferred_map::{
    DeferConfig, DeferResult, DeferState, Identity, Interceptor, MapOutcome, ProcessControl,
    WindowId, WindowSystem,
};
use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;
use std::os::raw::c_int;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// System allocator that counts allocations made by threads that opted in
struct CountingAllocator;

static ALLOCATIONS: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static COUNTING: Cell<bool> = const { Cell::new(false) };
}

fn counting() -> bool {
    COUNTING.try_with(Cell::get).unwrap_or(false)
}

unsafe impl GlobalAlloc for CountingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if counting() {
            ALLOCATIONS.fetch_add(1, Ordering::SeqCst);
        }
        System.alloc(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        System.dealloc(ptr, layout)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if counting() {
            ALLOCATIONS.fetch_add(1, Ordering::SeqCst);
        }
        System.realloc(ptr, layout, new_size)
    }
}

#[global_allocator]
static GLOBAL: CountingAllocator = CountingAllocator;

/// Allocations made by `f` on this thread
fn allocations_during(f: impl FnOnce()) -> usize {
    let before = ALLOCATIONS.load(Ordering::SeqCst);
    COUNTING.with(|c| c.set(true));
    f();
    COUNTING.with(|c| c.set(false));
    ALLOCATIONS.load(Ordering::SeqCst) - before
}

const TOP: WindowId = 0x0220_0004;

struct TopLevelOnly;

impl WindowSystem for TopLevelOnly {
    type Connection = usize;

    fn map_window(&self, _connection: usize, _window: WindowId) -> c_int {
        1
    }

    fn is_toplevel(&self, _connection: usize, window: WindowId) -> bool {
        window == TOP
    }

    fn activate(&self, _connection: usize, _window: WindowId) -> bool {
        true
    }
}

/// Process control that only records the calls made from the timeout path
#[derive(Default)]
struct QuietProcess {
    restored: AtomicBool,
    terminated: AtomicBool,
}

impl ProcessControl for QuietProcess {
    fn hold_signals(&self) -> HeldSignals {
        HeldSignals::none()
    }

    fn release_signals(&self, _held: HeldSignals) {}

    fn install_handlers(&self) -> DeferResult<()> {
        Ok(())
    }

    fn restore_handlers(&self) {
        self.restored.store(true, Ordering::SeqCst);
    }

    fn arm_timeout(&self, _secs: u32) {}

    fn cancel_timeout(&self) {}

    fn set_identity(&self, _identity: Identity) -> DeferResult<()> {
        Ok(())
    }

    fn detach(&self) -> DeferResult<()> {
        Ok(())
    }

    fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
    }
}

#[test]
fn expire_does_not_allocate_with_verbose_logging() {
    let _ = env_logger::Builder::new()
        .filter_level(log::LevelFilter::Trace)
        .is_test(true)
        .try_init();

    let config = DeferConfig {
        idle_timeout_secs: 2,
        ..DeferConfig::default()
    };
    let process = QuietProcess::default();
    let interceptor = Interceptor::new(config, TopLevelOnly, process);
    assert_eq!(interceptor.map_window(7, TOP), MapOutcome::Deferred);

    let mut expired = false;
    let allocations = allocations_during(|| expired = interceptor.expire());

    assert!(expired);
    assert_eq!(allocations, 0, "timeout transition touched the heap");
    assert_eq!(interceptor.state(), DeferState::Resolved);
}

#[test]
fn expire_without_capture_does_not_allocate() {
    let _ = env_logger::Builder::new()
        .filter_level(log::LevelFilter::Trace)
        .is_test(true)
        .try_init();

    let interceptor = Interceptor::new(DeferConfig::default(), TopLevelOnly, QuietProcess::default());

    let mut expired = true;
    let allocations = allocations_during(|| expired = interceptor.expire());

    assert!(!expired);
    assert_eq!(allocations, 0);
}
