use kport::{frame::FpBlock, FpuControl};
use spin::Mutex as SpinMutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// A simulated floating-point unit.
///
/// The register file starts out zeroed. Hardware stacking is initially
/// enabled, as on reset.
#[derive(Debug)]
pub struct SimFpu {
    regs: SpinMutex<FpBlock>,
    enabled: AtomicBool,
    hw_autostacking: AtomicBool,
}

impl SimFpu {
    pub const fn new() -> Self {
        Self {
            regs: SpinMutex::new(FpBlock::ZERO),
            enabled: AtomicBool::new(false),
            hw_autostacking: AtomicBool::new(true),
        }
    }

    /// Get the contents of the register file.
    pub fn registers(&self) -> FpBlock {
        *self.regs.lock()
    }

    /// Simulate the running task writing to the register file.
    ///
    /// # Panics
    ///
    /// Panics if the coprocessor access hasn't been granted.
    pub fn set_registers(&self, block: FpBlock) {
        assert!(self.is_enabled(), "FPU access while the coprocessor is disabled");
        *self.regs.lock() = block;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn is_hw_autostacking(&self) -> bool {
        self.hw_autostacking.load(Ordering::Acquire)
    }
}

impl Default for SimFpu {
    fn default() -> Self {
        Self::new()
    }
}

impl FpuControl for SimFpu {
    fn enable_fp_context(&self) {
        self.enabled.store(true, Ordering::Release);
    }

    fn disable_hw_autostacking(&self) {
        self.hw_autostacking.store(false, Ordering::Release);
    }

    fn save_registers(&self, block: &mut FpBlock) {
        *block = *self.regs.lock();
    }

    fn restore_registers(&self, block: &FpBlock) {
        *self.regs.lock() = *block;
    }
}
