//! The interface to the kernel collaborator
use core::{fmt, ops::Deref};

use crate::tls::TlsTable;

bitflags::bitflags! {
    /// Per-task option flags, specified at task creation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TaskOptions: u16 {
        /// Save and restore the floating-point registers on context switches.
        /// Has no effect unless [`PortCfg::fp_supported`] is set.
        ///
        /// [`PortCfg::fp_supported`]: crate::PortCfg::fp_supported
        const SAVE_FP = 0x0004;
        /// The task does not use thread-local storage. No TLS segment is
        /// allocated for it, and TLS accesses on it fail with `NotEnabled`.
        const NO_TLS = 0x0008;
    }
}

/// The part of a task control block (TCB) the port layer needs to see.
pub trait TaskCb {
    fn options(&self) -> TaskOptions;

    /// Get the saved stack pointer.
    fn stack_pointer(&self) -> *mut u32;

    /// Replace the saved stack pointer.
    ///
    /// # Safety
    ///
    /// `sp` must point into the task's stack region, and the saved context
    /// below it must match what the kernel's restore path expects.
    unsafe fn set_stack_pointer(&self, sp: *mut u32);

    /// Get the task's TLS slot table. The kernel creates it with
    /// [`TlsTable::new`] and must not touch it otherwise.
    fn tls(&self) -> &TlsTable;
}

/// The services consumed from the kernel.
///
/// # Safety
///
/// `enter_critical` must establish mutual exclusion against every other
/// context that can call into this crate (tasks and interrupt handlers), and
/// it must not be entered again before the matching `exit_critical`.
pub unsafe trait Kernel {
    type Task: TaskCb;

    /// A counted or `'static` reference to a task.
    type TaskRef: Clone + Deref<Target = Self::Task>;

    /// The saved interrupt state returned by `enter_critical`.
    type CriticalState;

    /// Check if the kernel has started running tasks.
    fn is_running(&self) -> bool;

    /// Get the currently running task. Returns `None` before the kernel
    /// starts and in contexts without a current task. Must be callable
    /// inside a critical section.
    fn current_task(&self) -> Option<Self::TaskRef>;

    /// Enter a critical section.
    ///
    /// # Safety
    ///
    /// Only meant to be called by this crate.
    unsafe fn enter_critical(&self) -> Self::CriticalState;

    /// Leave a critical section.
    ///
    /// # Safety
    ///
    /// `state` must be the value returned by the matching `enter_critical`.
    unsafe fn exit_critical(&self, state: Self::CriticalState);
}

/// The kernel's time-keeping services, used by the tick interrupt handler.
pub trait KernelTick: Kernel {
    /// Increment the interrupt nesting counter.
    ///
    /// # Safety
    ///
    /// Interrupt context, inside a critical section.
    unsafe fn increment_interrupt_nesting(&self);

    /// Advance the kernel time by one tick, firing due timers and waking
    /// tasks whose delays have elapsed.
    fn time_tick(&self);

    /// Leave an interrupt handler. The kernel decrements the interrupt
    /// nesting counter and makes a scheduling decision only if this was the
    /// outermost interrupt.
    fn interrupt_exit(&self);

    /// Wake up the kernel's software timer task. Defaults to doing nothing.
    fn signal_timer_task(&self) {}
}

/// The kernel's counting semaphores, used by the lock pool.
pub trait KernelSemaphore: Kernel {
    type Semaphore: Copy + fmt::Debug + Send;

    /// Create a semaphore. Returns `None` on failure.
    fn semaphore_create(&self, initial_count: u16) -> Option<Self::Semaphore>;

    fn semaphore_delete(&self, sem: Self::Semaphore);

    /// Wait on `sem` without a timeout.
    fn semaphore_pend(&self, sem: Self::Semaphore);

    /// Signal `sem`, waking up at most one waiter.
    fn semaphore_post(&self, sem: Self::Semaphore);
}

unsafe impl<K: Kernel + ?Sized> Kernel for &'_ K {
    type Task = K::Task;
    type TaskRef = K::TaskRef;
    type CriticalState = K::CriticalState;

    #[inline]
    fn is_running(&self) -> bool {
        (**self).is_running()
    }

    #[inline]
    fn current_task(&self) -> Option<Self::TaskRef> {
        (**self).current_task()
    }

    #[inline]
    unsafe fn enter_critical(&self) -> Self::CriticalState {
        unsafe { (**self).enter_critical() }
    }

    #[inline]
    unsafe fn exit_critical(&self, state: Self::CriticalState) {
        unsafe { (**self).exit_critical(state) }
    }
}

impl<K: KernelTick + ?Sized> KernelTick for &'_ K {
    #[inline]
    unsafe fn increment_interrupt_nesting(&self) {
        unsafe { (**self).increment_interrupt_nesting() }
    }

    #[inline]
    fn time_tick(&self) {
        (**self).time_tick()
    }

    #[inline]
    fn interrupt_exit(&self) {
        (**self).interrupt_exit()
    }

    #[inline]
    fn signal_timer_task(&self) {
        (**self).signal_timer_task()
    }
}

impl<K: KernelSemaphore + ?Sized> KernelSemaphore for &'_ K {
    type Semaphore = K::Semaphore;

    #[inline]
    fn semaphore_create(&self, initial_count: u16) -> Option<Self::Semaphore> {
        (**self).semaphore_create(initial_count)
    }

    #[inline]
    fn semaphore_delete(&self, sem: Self::Semaphore) {
        (**self).semaphore_delete(sem)
    }

    #[inline]
    fn semaphore_pend(&self, sem: Self::Semaphore) {
        (**self).semaphore_pend(sem)
    }

    #[inline]
    fn semaphore_post(&self, sem: Self::Semaphore) {
        (**self).semaphore_post(sem)
    }
}
