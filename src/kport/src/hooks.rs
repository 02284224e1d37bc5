//! Lifecycle hook dispatch
//!
//! The kernel calls the methods of [`PortHooks`] at fixed moments of the
//! system and task lifecycles. [`HookDispatch`] is the implementation
//! provided by this crate: it performs the port's own work (FPU setup,
//! floating-point context switching, TLS allocation, the timer task divider)
//! and forwards every call to an application-supplied [`AppHooks`].
use core::{
    ptr::{self, NonNull},
    sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, Ordering},
};

use crate::{
    frame::{self, FpBlock},
    klock::{CsCell, CsGuard},
    CreateTlsError, KernelSemaphore, KernelTick, PortCfg, Subsystem, TaskCb, TaskOptions,
    TlsRuntime,
};

/// Application extension points. Every method defaults to doing nothing.
///
/// These must not fail visibly to the kernel.
pub trait AppHooks<K: crate::Kernel> {
    /// Called at the beginning of the kernel initialization.
    fn init_begin(&self) {}

    /// Called at the end of the kernel initialization.
    fn init_end(&self) {}

    /// Called when a task is created.
    fn task_create(&self, task: &K::Task) {
        let _ = task;
    }

    /// Called when a task is deleted.
    fn task_delete(&self, task: &K::Task) {
        let _ = task;
    }

    /// Called on a context switch. `outgoing` is `None` on the first
    /// switch after the kernel starts.
    fn task_switch(&self, outgoing: Option<&K::Task>, incoming: &K::Task) {
        let _ = (outgoing, incoming);
    }

    /// Called when a task's entry point returns.
    fn task_returned(&self, task: &K::Task) {
        let _ = task;
    }

    /// Called repeatedly by the idle task.
    fn task_idle(&self) {}

    /// Called periodically by the statistics task.
    fn task_stat(&self) {}

    /// Called on every tick.
    fn time_tick(&self) {}

    /// Called when a task control block is initialized.
    fn tcb_init(&self, task: &K::Task) {
        let _ = task;
    }
}

/// An [`AppHooks`] that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAppHooks;

impl<K: crate::Kernel> AppHooks<K> for NoAppHooks {}

/// Control over the floating-point unit.
pub trait FpuControl {
    /// Grant access to the floating-point coprocessor.
    fn enable_fp_context(&self);

    /// Disable the hardware's automatic and lazy stacking of floating-point
    /// registers on exception entry.
    fn disable_hw_autostacking(&self);

    /// Store S0..S31 and FPSCR to `block`.
    fn save_registers(&self, block: &mut FpBlock);

    /// Load S0..S31 and FPSCR from `block`.
    fn restore_registers(&self, block: &FpBlock);
}

/// An [`FpuControl`] for targets without a floating-point unit.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoFpu;

impl FpuControl for NoFpu {
    fn enable_fp_context(&self) {}
    fn disable_hw_autostacking(&self) {}
    fn save_registers(&self, _: &mut FpBlock) {}
    fn restore_registers(&self, _: &FpBlock) {}
}

/// The hooks called by the kernel.
pub trait PortHooks<K: crate::Kernel> {
    fn init_begin(&self);
    fn init_end(&self);

    /// Called after the task's initial context is built and before it's made
    /// ready. The kernel should abandon the task creation on failure.
    fn task_create(&self, task: &K::Task) -> Result<(), CreateTlsError>;

    /// Called before the task's control block is reclaimed.
    fn task_delete(&self, task: &K::Task);

    /// Called during a context switch, after the outgoing task's integer
    /// context is saved and before the incoming task's is restored.
    ///
    /// # Safety
    ///
    /// Must be called inside a critical section. The stack pointers of both
    /// tasks must point to their saved contexts. The incoming task's saved
    /// context must include an [`FpBlock`] if it uses
    /// [`TaskOptions::SAVE_FP`] and floating-point support is enabled.
    unsafe fn task_switch(&self, outgoing: Option<&K::Task>, incoming: &K::Task);

    fn task_returned(&self, task: &K::Task);
    fn task_idle(&self);
    fn task_stat(&self);

    /// Called by the kernel's time-advance operation on every tick.
    fn time_tick(&self);

    fn tcb_init(&self, task: &K::Task);
}

/// The dispatcher for [`PortHooks`].
pub struct HookDispatch<K: KernelSemaphore, R, H = NoAppHooks, F = NoFpu> {
    subsystem: Subsystem<K, R>,
    app: H,
    fpu: F,
    /// `init_end` has set up the FPU.
    fp_ready: AtomicBool,
    /// Ticks since the timer task was last signalled
    timer_ctr: AtomicU32,
    exception_stack: CsCell<Option<&'static mut [u32]>>,
    exception_stack_top: AtomicPtr<u32>,
}

impl<K: KernelSemaphore, R> HookDispatch<K, R> {
    pub fn new(subsystem: Subsystem<K, R>) -> Self {
        Self {
            subsystem,
            app: NoAppHooks,
            fpu: NoFpu,
            fp_ready: AtomicBool::new(false),
            timer_ctr: AtomicU32::new(0),
            exception_stack: CsCell::new(None),
            exception_stack_top: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

impl<K: KernelSemaphore, R, H, F> HookDispatch<K, R, H, F> {
    pub fn with_app_hooks<H2>(self, app: H2) -> HookDispatch<K, R, H2, F> {
        HookDispatch {
            subsystem: self.subsystem,
            app,
            fpu: self.fpu,
            fp_ready: self.fp_ready,
            timer_ctr: self.timer_ctr,
            exception_stack: self.exception_stack,
            exception_stack_top: self.exception_stack_top,
        }
    }

    pub fn with_fpu<F2>(self, fpu: F2) -> HookDispatch<K, R, H, F2> {
        HookDispatch {
            subsystem: self.subsystem,
            app: self.app,
            fpu,
            fp_ready: self.fp_ready,
            timer_ctr: self.timer_ctr,
            exception_stack: self.exception_stack,
            exception_stack_top: self.exception_stack_top,
        }
    }

    /// Attach the stack used by exception handlers. It's zero-filled by
    /// `init_begin` so that its high-water mark can be measured.
    pub fn with_exception_stack(mut self, stack: &'static mut [u32]) -> Self {
        *self.exception_stack.get_mut() = Some(stack);
        self
    }

    #[inline]
    pub fn subsystem(&self) -> &Subsystem<K, R> {
        &self.subsystem
    }

    #[inline]
    pub fn app_hooks(&self) -> &H {
        &self.app
    }

    #[inline]
    pub fn fpu(&self) -> &F {
        &self.fpu
    }

    #[inline]
    fn cfg(&self) -> &PortCfg {
        self.subsystem.cfg()
    }

    /// Get the 8-byte-aligned top of the exception stack. Available after
    /// `init_begin` if an exception stack is attached.
    pub fn exception_stack_top(&self) -> Option<NonNull<u32>> {
        NonNull::new(self.exception_stack_top.load(Ordering::Acquire))
    }
}

impl<K, R, H, F> PortHooks<K> for HookDispatch<K, R, H, F>
where
    K: KernelSemaphore + KernelTick,
    R: TlsRuntime,
    H: AppHooks<K>,
    F: FpuControl,
{
    fn init_begin(&self) {
        {
            let mut cs = CsGuard::lock(self.subsystem.kernel());
            if let Some(stack) = self.exception_stack.write(&mut cs) {
                stack.fill(0);
                let end = stack.as_mut_ptr_range().end;
                let top = ((end as usize) & !7) as *mut u32;
                self.exception_stack_top.store(top, Ordering::Release);
            }
        }
        self.timer_ctr.store(0, Ordering::Relaxed);

        log::trace!("init_begin");
        self.app.init_begin();
    }

    fn init_end(&self) {
        if self.cfg().fp_supported() && !self.fp_ready.load(Ordering::Acquire) {
            self.fpu.enable_fp_context();
            self.fpu.disable_hw_autostacking();
            self.fp_ready.store(true, Ordering::Release);
            log::debug!("FPU enabled, hardware FP stacking disabled");
        }

        log::trace!("init_end");
        self.app.init_end();
    }

    fn task_create(&self, task: &K::Task) -> Result<(), CreateTlsError> {
        self.subsystem.task_create(task)?;
        self.app.task_create(task);
        Ok(())
    }

    fn task_delete(&self, task: &K::Task) {
        self.app.task_delete(task);
        self.subsystem.task_delete(task);
    }

    unsafe fn task_switch(&self, outgoing: Option<&K::Task>, incoming: &K::Task) {
        if self.cfg().fp_supported() {
            // The outgoing task's registers must be saved before the incoming
            // task's are loaded
            if let Some(task) = outgoing.filter(|t| t.options().contains(TaskOptions::SAVE_FP)) {
                let mut block = FpBlock::ZERO;
                self.fpu.save_registers(&mut block);
                // Safety: The task's stack has room for its saved context,
                //         which includes an `FpBlock`
                unsafe {
                    let sp = frame::push_fp_block(task.stack_pointer(), &block);
                    task.set_stack_pointer(sp);
                }
            }

            if incoming.options().contains(TaskOptions::SAVE_FP) {
                debug_assert!(
                    self.fp_ready.load(Ordering::Relaxed),
                    "FP task switched in before `init_end`"
                );
                // Safety: The saved context starts with an `FpBlock`
                unsafe {
                    let (block, sp) = frame::pop_fp_block(incoming.stack_pointer());
                    self.fpu.restore_registers(&block);
                    incoming.set_stack_pointer(sp);
                }
            }
        }

        self.app.task_switch(outgoing, incoming);
    }

    fn task_returned(&self, task: &K::Task) {
        log::warn!("a task returned from its entry point");
        self.app.task_returned(task);
    }

    fn task_idle(&self) {
        self.app.task_idle();
    }

    fn task_stat(&self) {
        self.app.task_stat();
    }

    fn time_tick(&self) {
        self.app.time_tick();

        let divider = self.cfg().timer_task_divider();
        if divider != 0 {
            let ctr = self.timer_ctr.load(Ordering::Relaxed) + 1;
            if ctr >= divider {
                self.timer_ctr.store(0, Ordering::Relaxed);
                self.subsystem.kernel().signal_timer_task();
            } else {
                self.timer_ctr.store(ctr, Ordering::Relaxed);
            }
        }
    }

    fn tcb_init(&self, task: &K::Task) {
        self.app.tcb_init(task);
    }
}
