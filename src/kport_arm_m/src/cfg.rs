use kport::{PortCfg, PortOptions};

/// The configuration of the port, supplied by implementing this trait on a
/// marker type.
pub trait PortOptionsExt {
    /// The input clock frequency of SysTick.
    const FREQUENCY: u64;

    /// The tick rate. Defaults to `1000`.
    const TICK_RATE_HZ: u32 = 1000;

    /// The priority of the SysTick handler. Defaults to `0xc0`.
    const INTERRUPT_PRIORITY: u8 = 0xc0;

    /// Save and restore the floating-point registers of the tasks that ask
    /// for it. Defaults to `false`.
    const FP_SUPPORTED: bool = false;

    /// The number of TLS IDs, including the library slot. Defaults to `4`.
    const TLS_TABLE_SIZE: usize = 4;

    /// The capacity of the runtime lock pool. Defaults to `8`.
    const LOCK_POOL_CAPACITY: usize = 8;

    /// The rate at which the kernel's timer task is signalled. Defaults to
    /// `0` (disabled).
    const TIMER_TASK_RATE_HZ: u32 = 0;

    /// The validated configuration. Evaluating this fails the build if the
    /// options are invalid.
    const PORT_CFG: PortCfg = match PortCfg::new(PortOptions {
        tls_table_size: Self::TLS_TABLE_SIZE,
        fp_supported: Self::FP_SUPPORTED,
        cpu_freq_hz: Self::FREQUENCY,
        tick_rate_hz: Self::TICK_RATE_HZ,
        tick_priority: Self::INTERRUPT_PRIORITY,
        lock_pool_capacity: Self::LOCK_POOL_CAPACITY,
        timer_task_rate_hz: Self::TIMER_TASK_RATE_HZ,
    }) {
        Ok(x) => x,
        Err(e) => e.panic(),
    };
}
