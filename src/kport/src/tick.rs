//! Periodic timer integration
//!
//! The tick timer is a SysTick-style 24-bit down counter. [`configure_tick`]
//! programs it once at startup, and [`handle_tick`] is called from its
//! interrupt handler.
use num_rational::Ratio;

use crate::{KernelTick, PortCfg};

/// SysTick Control and Status Register: counter enable
pub const CTRL_ENABLE: u32 = 1 << 0;
/// SysTick Control and Status Register: interrupt enable
pub const CTRL_TICKINT: u32 = 1 << 1;
/// SysTick Control and Status Register: use the processor clock
pub const CTRL_CLKSOURCE: u32 = 1 << 2;
/// SysTick Control and Status Register: the counter reached zero since the
/// last read
pub const CTRL_COUNTFLAG: u32 = 1 << 16;

/// The bit position of the tick interrupt's priority in
/// [`TickReg::HandlerPriority3`].
pub const SHPR3_PRI_15_SHIFT: u32 = 24;

/// The registers touched by [`configure_tick`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TickReg {
    /// SysTick Control and Status Register (`SYST_CSR`)
    Control,
    /// SysTick Reload Value Register (`SYST_RVR`)
    Reload,
    /// SysTick Current Value Register (`SYST_CVR`)
    Current,
    /// System Handler Priority Register 3 (`SHPR3`), shared by PendSV and
    /// SysTick
    HandlerPriority3,
}

/// Access to the tick timer's registers.
pub trait TickRegisters {
    fn read(&mut self, reg: TickReg) -> u32;
    fn write(&mut self, reg: TickReg, value: u32);

    #[inline]
    fn modify(&mut self, reg: TickReg, f: impl FnOnce(u32) -> u32) {
        let value = self.read(reg);
        self.write(reg, f(value));
    }
}

impl<T: TickRegisters + ?Sized> TickRegisters for &'_ mut T {
    #[inline]
    fn read(&mut self, reg: TickReg) -> u32 {
        (**self).read(reg)
    }

    #[inline]
    fn write(&mut self, reg: TickReg, value: u32) {
        (**self).write(reg, value)
    }
}

/// Get the tick rate actually produced by `cfg`'s reload count, which may
/// differ from the requested rate if the clock frequency is not a multiple
/// of it.
pub fn effective_tick_rate(cfg: &PortCfg) -> Ratio<u64> {
    Ratio::new(cfg.cpu_freq_hz(), cfg.tick_reload() as u64)
}

/// Program and start the tick timer.
pub fn configure_tick(mut regs: impl TickRegisters, cfg: &PortCfg) {
    let reload = cfg.tick_reload();
    assert!(reload != 0, "tick reload count is zero");

    regs.write(TickReg::Reload, reload - 1);
    regs.write(TickReg::Current, 0);

    // Merge the priority into bits 31..24, leaving PendSV's priority alone
    regs.modify(TickReg::HandlerPriority3, |x| {
        (x & !(0xff << SHPR3_PRI_15_SHIFT))
            | ((cfg.tick_priority() as u32) << SHPR3_PRI_15_SHIFT)
    });

    regs.modify(TickReg::Control, |x| x | CTRL_CLKSOURCE | CTRL_ENABLE);
    regs.modify(TickReg::Control, |x| x | CTRL_TICKINT);

    let rate = effective_tick_rate(cfg);
    if rate.is_integer() {
        log::debug!("tick timer started at {} Hz", rate.to_integer());
    } else {
        log::debug!(
            "tick timer started at {} Hz (requested {} Hz)",
            rate,
            cfg.tick_rate_hz()
        );
    }
}

/// Handle a tick interrupt.
///
/// The kernel reschedules in [`KernelTick::interrupt_exit`] if this is the
/// outermost interrupt.
pub fn handle_tick<K: KernelTick>(kernel: &K) {
    {
        let _cs = crate::klock::CsGuard::lock(kernel);
        // Safety: Interrupt context, inside a critical section
        unsafe { kernel.increment_interrupt_nesting() };
    }

    kernel.time_tick();
    kernel.interrupt_exit();
}
