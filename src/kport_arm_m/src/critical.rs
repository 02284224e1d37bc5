//! A kernel's [`Kernel::enter_critical`] and [`Kernel::exit_critical`] can
//! forward to [`enter`] and [`exit`].
//!
//! [`Kernel::enter_critical`]: kport::Kernel::enter_critical
//! [`Kernel::exit_critical`]: kport::Kernel::exit_critical
use cortex_m::{interrupt, register::primask};

/// The interrupt state saved by [`enter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct CriticalState {
    was_enabled: bool,
}

/// Mask all configurable-priority interrupts, returning the previous state.
#[inline]
pub fn enter() -> CriticalState {
    let was_enabled = primask::read().is_inactive();
    interrupt::disable();
    CriticalState { was_enabled }
}

/// Restore the state saved by [`enter`].
///
/// # Safety
///
/// `state` must be the value returned by the innermost unmatched [`enter`].
#[inline]
pub unsafe fn exit(state: CriticalState) {
    if state.was_enabled {
        // Safety: Upheld by the caller
        unsafe { interrupt::enable() };
    }
}
