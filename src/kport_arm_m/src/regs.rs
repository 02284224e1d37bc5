//! Memory-mapped system control registers
use core::ptr::{read_volatile, write_volatile};
use kport::tick::{TickReg, TickRegisters};

/// SysTick Control and Status Register
pub const SYST_CSR: usize = 0xe000_e010;
/// SysTick Reload Value Register
pub const SYST_RVR: usize = 0xe000_e014;
/// SysTick Current Value Register
pub const SYST_CVR: usize = 0xe000_e018;
/// System Handler Priority Register 3
pub const SHPR3: usize = 0xe000_ed20;
/// Coprocessor Access Control Register
pub const CPACR: usize = 0xe000_ed88;
/// Floating-Point Context Control Register
pub const FPCCR: usize = 0xe000_ef34;

/// `CPACR`: full access to CP10 and CP11
pub const CPACR_CP10_CP11_FULL: u32 = (0b11 << 20) | (0b11 << 22);
/// `FPCCR`: automatic state preservation enable
pub const FPCCR_ASPEN: u32 = 1 << 31;
/// `FPCCR`: lazy state preservation enable
pub const FPCCR_LSPEN: u32 = 1 << 30;

/// [`TickRegisters`] backed by SysTick and `SHPR3`.
#[derive(Debug)]
pub struct MmioTickRegisters {
    /// Points `SYST_CSR`, followed by `SYST_RVR` and `SYST_CVR`
    syst: *mut u32,
    shpr3: *mut u32,
}

impl MmioTickRegisters {
    /// Construct a `MmioTickRegisters` referring to the architecturally
    /// defined addresses.
    ///
    /// # Safety
    ///
    /// The caller must have exclusive control of SysTick.
    pub const unsafe fn new() -> Self {
        Self {
            syst: SYST_CSR as *mut u32,
            shpr3: SHPR3 as *mut u32,
        }
    }

    /// Construct a `MmioTickRegisters` from arbitrary locations.
    ///
    /// # Safety
    ///
    /// `syst` must be valid for volatile reads and writes of three words, and
    /// `shpr3` of one word, for the lifetime of the returned value.
    pub unsafe fn from_raw(syst: *mut u32, shpr3: *mut u32) -> Self {
        Self { syst, shpr3 }
    }

    fn reg_ptr(&self, reg: TickReg) -> *mut u32 {
        match reg {
            TickReg::Control => self.syst,
            // Safety: `syst` points three consecutive words
            TickReg::Reload => unsafe { self.syst.add(1) },
            TickReg::Current => unsafe { self.syst.add(2) },
            TickReg::HandlerPriority3 => self.shpr3,
        }
    }
}

impl TickRegisters for MmioTickRegisters {
    #[inline]
    fn read(&mut self, reg: TickReg) -> u32 {
        // Safety: Guaranteed by the constructor's caller
        unsafe { read_volatile(self.reg_ptr(reg)) }
    }

    #[inline]
    fn write(&mut self, reg: TickReg, value: u32) {
        // Safety: Guaranteed by the constructor's caller
        unsafe { write_volatile(self.reg_ptr(reg), value) }
    }
}

/// `CPACR` and `FPCCR`.
#[derive(Debug)]
pub struct FpContextRegisters {
    cpacr: *mut u32,
    fpccr: *mut u32,
}

impl FpContextRegisters {
    /// # Safety
    ///
    /// The caller must have exclusive control of the FPU configuration.
    pub const unsafe fn new() -> Self {
        Self {
            cpacr: CPACR as *mut u32,
            fpccr: FPCCR as *mut u32,
        }
    }

    /// # Safety
    ///
    /// Both pointers must be valid for volatile reads and writes for the
    /// lifetime of the returned value.
    pub unsafe fn from_raw(cpacr: *mut u32, fpccr: *mut u32) -> Self {
        Self { cpacr, fpccr }
    }

    /// Grant full access to the floating-point coprocessors.
    ///
    /// The caller is responsible for the barriers that must follow.
    pub fn enable_fp_context(&mut self) {
        // Safety: Guaranteed by the constructor's caller
        unsafe {
            let x = read_volatile(self.cpacr);
            write_volatile(self.cpacr, x | CPACR_CP10_CP11_FULL);
        }
    }

    /// Stop the hardware from stacking the floating-point registers on
    /// exception entry. The port saves them itself.
    pub fn disable_hw_autostacking(&mut self) {
        // Safety: Guaranteed by the constructor's caller
        unsafe {
            let x = read_volatile(self.fpccr);
            write_volatile(self.fpccr, x & !(FPCCR_ASPEN | FPCCR_LSPEN));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kport::{tick::configure_tick, PortCfg, PortOptions};
    use quickcheck_macros::quickcheck;

    #[test]
    fn tick_registers_map_to_consecutive_words() {
        let mut syst = [0u32; 3];
        let mut shpr3 = 0x0000_ff00u32;
        let cfg = PortCfg::new(PortOptions {
            cpu_freq_hz: 8_000_000,
            tick_rate_hz: 100,
            ..PortOptions::DEFAULT
        })
        .unwrap();

        let mut regs = unsafe { MmioTickRegisters::from_raw(syst.as_mut_ptr(), &mut shpr3) };
        configure_tick(&mut regs, &cfg);
        drop(regs);

        assert_eq!(syst, [0b111, 79_999, 0]);
        assert_eq!(shpr3, 0xc000_ff00);
    }

    #[quickcheck]
    fn shpr3_merge_preserves_low_bits(initial: u32, priority: u8) -> bool {
        let mut syst = [0u32; 3];
        let mut shpr3 = initial;
        let cfg = PortCfg::new(PortOptions {
            tick_priority: priority,
            ..PortOptions::DEFAULT
        })
        .unwrap();

        let mut regs = unsafe { MmioTickRegisters::from_raw(syst.as_mut_ptr(), &mut shpr3) };
        configure_tick(&mut regs, &cfg);
        drop(regs);

        shpr3 == (initial & 0x00ff_ffff) | ((priority as u32) << 24)
    }

    #[test]
    fn fp_context_bits() {
        let mut cpacr = 0x0000_000fu32;
        let mut fpccr = 0xc000_0001u32;
        let mut regs = unsafe { FpContextRegisters::from_raw(&mut cpacr, &mut fpccr) };
        regs.enable_fp_context();
        regs.disable_hw_autostacking();
        drop(regs);

        assert_eq!(cpacr, 0x00f0_000f);
        assert_eq!(fpccr, 0x0000_0001);
    }
}
