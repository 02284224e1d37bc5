/// The maximum number of TLS slots per task.
pub const MAX_TLS_TABLE_SIZE: usize = 32;

/// The maximum capacity of the lock pool.
pub const MAX_LOCK_POOL_CAPACITY: usize = 1024;

/// The largest tick period, measured in timer input clock cycles, that the
/// 24-bit reload register can express.
pub const MAX_TICK_RELOAD: u64 = 0x100_0000;

/// The unvalidated configuration of the port layer. Pass this to
/// [`PortCfg::new`] to get a validated [`PortCfg`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortOptions {
    /// The number of TLS IDs that can be issued. One of them is consumed by
    /// the library slot when [`Subsystem`] is created. Must be in range
    /// `0..=MAX_TLS_TABLE_SIZE`.
    ///
    /// [`Subsystem`]: crate::Subsystem
    pub tls_table_size: usize,
    /// Save and restore the floating-point registers of the tasks created
    /// with [`TaskOptions::SAVE_FP`].
    ///
    /// [`TaskOptions::SAVE_FP`]: crate::TaskOptions::SAVE_FP
    pub fp_supported: bool,
    /// The input clock frequency of the tick timer.
    pub cpu_freq_hz: u64,
    /// The desired tick rate.
    pub tick_rate_hz: u32,
    /// The priority of the tick interrupt.
    pub tick_priority: u8,
    /// The number of locks the lock pool can hand out at once. Must be in
    /// range `0..=MAX_LOCK_POOL_CAPACITY`.
    pub lock_pool_capacity: usize,
    /// The rate at which the kernel's timer task is signalled. `0` disables
    /// the signal. Must not exceed `tick_rate_hz`.
    pub timer_task_rate_hz: u32,
}

impl PortOptions {
    pub const DEFAULT: Self = Self {
        tls_table_size: 4,
        fp_supported: false,
        cpu_freq_hz: 16_000_000,
        tick_rate_hz: 1000,
        tick_priority: 0xc0,
        lock_pool_capacity: 8,
        timer_task_rate_hz: 0,
    };
}

impl Default for PortOptions {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Error type for [`PortCfg::new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CfgError {
    TlsTableSizeTooLarge,
    LockPoolCapacityTooLarge,
    TickRateZero,
    /// The tick rate exceeds the timer input frequency, so the reload count
    /// would be zero.
    TickReloadZero,
    TickReloadOverflow,
    TimerTaskRateTooHigh,
}

impl CfgError {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TlsTableSizeTooLarge => "`tls_table_size` must not exceed `MAX_TLS_TABLE_SIZE`",
            Self::LockPoolCapacityTooLarge => {
                "`lock_pool_capacity` must not exceed `MAX_LOCK_POOL_CAPACITY`"
            }
            Self::TickRateZero => "`tick_rate_hz` must not be zero",
            Self::TickReloadZero => "`tick_rate_hz` must not exceed `cpu_freq_hz`",
            Self::TickReloadOverflow => {
                "the tick period measured in cycles must be in range `1..=0x1000000`"
            }
            Self::TimerTaskRateTooHigh => "`timer_task_rate_hz` must not exceed `tick_rate_hz`",
        }
    }

    /// Panic with an explanatory message. Usable in a constant context.
    pub const fn panic(self) -> ! {
        panic!("{}", self.as_str())
    }
}

/// The validated configuration of the port layer.
///
/// This is fixed at construction and never branched on per call for anything
/// but the values it holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortCfg {
    tls_table_size: u8,
    fp_supported: bool,
    cpu_freq_hz: u64,
    tick_rate_hz: u32,
    tick_reload: u32,
    tick_priority: u8,
    lock_pool_capacity: u16,
    timer_task_divider: u32,
}

impl PortCfg {
    /// Validate `opts`.
    ///
    /// ```
    /// use kport::{PortCfg, PortOptions};
    ///
    /// const CFG: PortCfg = match PortCfg::new(PortOptions {
    ///     cpu_freq_hz: 2_000_000,
    ///     tick_rate_hz: 100,
    ///     ..PortOptions::DEFAULT
    /// }) {
    ///     Ok(x) => x,
    ///     Err(e) => e.panic(),
    /// };
    ///
    /// assert_eq!(CFG.tick_reload(), 20_000);
    /// ```
    pub const fn new(opts: PortOptions) -> Result<Self, CfgError> {
        if opts.tls_table_size > MAX_TLS_TABLE_SIZE {
            return Err(CfgError::TlsTableSizeTooLarge);
        }
        if opts.lock_pool_capacity > MAX_LOCK_POOL_CAPACITY {
            return Err(CfgError::LockPoolCapacityTooLarge);
        }
        if opts.tick_rate_hz == 0 {
            return Err(CfgError::TickRateZero);
        }

        let reload = opts.cpu_freq_hz / opts.tick_rate_hz as u64;
        if reload == 0 {
            return Err(CfgError::TickReloadZero);
        }
        if reload > MAX_TICK_RELOAD {
            return Err(CfgError::TickReloadOverflow);
        }

        let timer_task_divider = if opts.timer_task_rate_hz == 0 {
            0
        } else if opts.timer_task_rate_hz > opts.tick_rate_hz {
            return Err(CfgError::TimerTaskRateTooHigh);
        } else {
            opts.tick_rate_hz / opts.timer_task_rate_hz
        };

        Ok(Self {
            tls_table_size: opts.tls_table_size as u8,
            fp_supported: opts.fp_supported,
            cpu_freq_hz: opts.cpu_freq_hz,
            tick_rate_hz: opts.tick_rate_hz,
            tick_reload: reload as u32,
            tick_priority: opts.tick_priority,
            lock_pool_capacity: opts.lock_pool_capacity as u16,
            timer_task_divider,
        })
    }

    #[inline]
    pub const fn tls_table_size(&self) -> usize {
        self.tls_table_size as usize
    }

    #[inline]
    pub const fn fp_supported(&self) -> bool {
        self.fp_supported
    }

    #[inline]
    pub const fn cpu_freq_hz(&self) -> u64 {
        self.cpu_freq_hz
    }

    #[inline]
    pub const fn tick_rate_hz(&self) -> u32 {
        self.tick_rate_hz
    }

    /// The tick period measured in timer input clock cycles. Never zero.
    #[inline]
    pub const fn tick_reload(&self) -> u32 {
        self.tick_reload
    }

    #[inline]
    pub const fn tick_priority(&self) -> u8 {
        self.tick_priority
    }

    #[inline]
    pub const fn lock_pool_capacity(&self) -> usize {
        self.lock_pool_capacity as usize
    }

    /// The number of ticks between two timer task signals. `0` means the
    /// signal is disabled.
    #[inline]
    pub const fn timer_task_divider(&self) -> u32 {
        self.timer_task_divider
    }
}
