use kport::tick::{TickReg, TickRegisters};

/// Simulated SysTick and `SHPR3` registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimTickRegisters {
    pub control: u32,
    pub reload: u32,
    pub current: u32,
    pub handler_priority3: u32,
}

impl SimTickRegisters {
    /// The reset state. `SYST_RVR` and `SYST_CVR` are architecturally
    /// unknown on reset; they read as zero here.
    pub const fn new() -> Self {
        Self {
            control: 0,
            reload: 0,
            current: 0,
            handler_priority3: 0,
        }
    }
}

impl Default for SimTickRegisters {
    fn default() -> Self {
        Self::new()
    }
}

impl TickRegisters for SimTickRegisters {
    fn read(&mut self, reg: TickReg) -> u32 {
        match reg {
            TickReg::Control => self.control,
            TickReg::Reload => self.reload,
            TickReg::Current => self.current,
            TickReg::HandlerPriority3 => self.handler_priority3,
        }
    }

    fn write(&mut self, reg: TickReg, value: u32) {
        match reg {
            TickReg::Control => self.control = value,
            // `SYST_RVR` is 24 bits wide
            TickReg::Reload => self.reload = value & 0x00ff_ffff,
            // Any write clears `SYST_CVR`
            TickReg::Current => self.current = 0,
            TickReg::HandlerPriority3 => self.handler_priority3 = value,
        }
    }
}
