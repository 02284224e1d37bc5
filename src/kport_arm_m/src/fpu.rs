use core::arch::asm;
use kport::{frame::FpBlock, FpuControl};

use crate::FpContextRegisters;

/// The [`FpuControl`] implementation for Armv7-M with a single-precision FPU.
#[derive(Debug, Clone, Copy, Default)]
pub struct CortexMFpu;

impl FpuControl for CortexMFpu {
    fn enable_fp_context(&self) {
        // Safety: The port owns the FPU configuration
        let mut regs = unsafe { FpContextRegisters::new() };
        regs.enable_fp_context();
        cortex_m::asm::dsb();
        cortex_m::asm::isb();
    }

    fn disable_hw_autostacking(&self) {
        // Safety: The port owns the FPU configuration
        let mut regs = unsafe { FpContextRegisters::new() };
        regs.disable_hw_autostacking();
        cortex_m::asm::dsb();
        cortex_m::asm::isb();
    }

    #[inline]
    fn save_registers(&self, block: &mut FpBlock) {
        // Safety: `block.s` is 32 writable words
        unsafe {
            asm!(
                "vstmia {s}, {{s0-s31}}",
                "vmrs {fpscr}, fpscr",
                s = in(reg) block.s.as_mut_ptr(),
                fpscr = lateout(reg) block.fpscr,
                options(nostack, preserves_flags),
            );
        }
    }

    #[inline]
    fn restore_registers(&self, block: &FpBlock) {
        // Safety: `block.s` is 32 readable words
        unsafe {
            asm!(
                "vldmia {s}, {{s0-s31}}",
                "vmsr fpscr, {fpscr}",
                s = in(reg) block.s.as_ptr(),
                fpscr = in(reg) block.fpscr,
                out("s0") _, out("s1") _, out("s2") _, out("s3") _,
                out("s4") _, out("s5") _, out("s6") _, out("s7") _,
                out("s8") _, out("s9") _, out("s10") _, out("s11") _,
                out("s12") _, out("s13") _, out("s14") _, out("s15") _,
                out("s16") _, out("s17") _, out("s18") _, out("s19") _,
                out("s20") _, out("s21") _, out("s22") _, out("s23") _,
                out("s24") _, out("s25") _, out("s26") _, out("s27") _,
                out("s28") _, out("s29") _, out("s30") _, out("s31") _,
                options(nostack, readonly),
            );
        }
    }
}
