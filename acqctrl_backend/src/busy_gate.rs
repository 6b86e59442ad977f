//! Debounce latch of the trigger-driven sub-acquisitions.

use std::sync::atomic::{AtomicBool, Ordering};

/// At most one in-flight cycle: [`BusyGate::try_enter`] succeeds for a single caller until
/// the gate is set back to idle.
#[derive(Debug, Default)]
pub struct BusyGate {
    busy: AtomicBool,
}
impl BusyGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idle to busy; `false` if the gate was already busy.
    pub fn try_enter(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn set(&self, busy: bool) {
        self.busy.store(busy, Ordering::Release);
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}
