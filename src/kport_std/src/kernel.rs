use kport::{
    frame::{
        self, CalleeFrame, ExceptionFrame, FrameLayout, StackRegion, TaskContext, TaskInit,
        CALLEE_FRAME_WORDS, EXC_FRAME_WORDS,
    },
    tick, CreateTlsError, Kernel, KernelSemaphore, KernelTick, PortCfg, PortHooks, TaskCb,
    TaskOptions, TlsTable,
};
use once_cell::sync::OnceCell;
use slab::Slab;
use spin::Mutex as SpinMutex;
use std::{
    fmt,
    mem::{self, MaybeUninit},
    ops::Range,
    ptr,
    sync::{
        atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicUsize, Ordering},
        Condvar, Mutex, MutexGuard, PoisonError,
    },
};

use crate::SimTickRegisters;

/// The hooks a [`SimKernel`] calls.
pub type SimHooks = dyn PortHooks<&'static SimKernel> + Sync;

/// Identifies a task in a [`SimKernel`].
///
/// Task slots are reused, but an ID never refers to a task other than the
/// one it was issued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId {
    index: usize,
    generation: u64,
}

/// A semaphore of a [`SimKernel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SimSemaphore(usize);

/// A simulated kernel.
pub struct SimKernel {
    cfg: PortCfg,
    hooks: OnceCell<&'static SimHooks>,
    /// Held while a critical section is active
    cs: SpinMutex<()>,
    running: AtomicBool,
    current: SpinMutex<Option<&'static SimTask>>,
    /// `None` = creation in progress
    tasks: SpinMutex<Slab<Option<&'static SimTask>>>,
    next_generation: AtomicU64,
    tick_regs: SpinMutex<SimTickRegisters>,

    /// Semaphore counts
    sems: Mutex<Slab<u16>>,
    sem_cv: Condvar,
    sem_limit: AtomicUsize,

    interrupt_nesting: AtomicUsize,
    ticks: AtomicU64,
    reschedules: AtomicU64,
    timer_task_signals: AtomicU64,
    context_switches: AtomicU64,
}

/// A task control block of a [`SimKernel`].
pub struct SimTask {
    id: TaskId,
    options: TaskOptions,
    sp: AtomicPtr<u32>,
    stack: Range<usize>,
    tls: TlsTable,
    /// The register state loaded by the last context switch to this task.
    /// `None` if the task isn't running.
    resumed: SpinMutex<Option<TaskContext>>,
}

impl SimKernel {
    /// Construct a `SimKernel`. [`Self::install_hooks`] must be called
    /// before creating tasks.
    pub fn new(cfg: PortCfg) -> Self {
        let _ = env_logger::try_init();

        Self {
            cfg,
            hooks: OnceCell::new(),
            cs: SpinMutex::new(()),
            running: AtomicBool::new(false),
            current: SpinMutex::new(None),
            tasks: SpinMutex::new(Slab::new()),
            next_generation: AtomicU64::new(0),
            tick_regs: SpinMutex::new(SimTickRegisters::new()),
            sems: Mutex::new(Slab::new()),
            sem_cv: Condvar::new(),
            sem_limit: AtomicUsize::new(usize::MAX),
            interrupt_nesting: AtomicUsize::new(0),
            ticks: AtomicU64::new(0),
            reschedules: AtomicU64::new(0),
            timer_task_signals: AtomicU64::new(0),
            context_switches: AtomicU64::new(0),
        }
    }

    /// Attach the port hooks.
    ///
    /// # Panics
    ///
    /// Panics if hooks are already attached.
    pub fn install_hooks(&self, hooks: &'static SimHooks) {
        if self.hooks.set(hooks).is_err() {
            panic!("port hooks are already installed");
        }
    }

    fn hooks(&self) -> &'static SimHooks {
        match self.hooks.get() {
            Some(&hooks) => hooks,
            None => panic!("port hooks are not installed"),
        }
    }

    pub fn cfg(&self) -> &PortCfg {
        &self.cfg
    }

    /// Run the startup sequence and mark the kernel as running.
    pub fn start(&self) {
        let hooks = self.hooks();
        hooks.init_begin();
        tick::configure_tick(&mut *self.tick_regs.lock(), &self.cfg);
        hooks.init_end();
        self.running.store(true, Ordering::Release);
        log::debug!("kernel started");
    }

    /// Create a task with a stack of `stack_words` words.
    ///
    /// # Panics
    ///
    /// Panics if the stack is too small for the initial context.
    pub fn create_task(&self, init: TaskInit, stack_words: usize) -> Result<TaskId, CreateTlsError> {
        let id = TaskId {
            index: self.tasks.lock().insert(None),
            generation: self.next_generation.fetch_add(1, Ordering::Relaxed),
        };

        let stack: &'static mut [MaybeUninit<u32>] =
            Box::leak(vec![MaybeUninit::uninit(); stack_words].into_boxed_slice());
        let range = stack.as_ptr_range();
        let stack_range = range.start as usize..range.end as usize;
        let sp = StackRegion::new(stack).build(&init, &self.cfg);

        let task: &'static SimTask = Box::leak(Box::new(SimTask {
            id,
            options: init.options,
            sp: AtomicPtr::new(sp),
            stack: stack_range,
            tls: TlsTable::new(),
            resumed: SpinMutex::new(None),
        }));

        let hooks = self.hooks();
        hooks.tcb_init(task);
        if let Err(e) = hooks.task_create(task) {
            log::warn!("creation of {:?} failed: {:?}", id, e);
            self.tasks.lock().remove(id.index);
            return Err(e);
        }

        self.tasks.lock()[id.index] = Some(task);
        log::debug!("created {:?} with {:?}", id, init.options);
        Ok(id)
    }

    /// Get a live task.
    pub fn task(&self, id: TaskId) -> Option<&'static SimTask> {
        self.tasks
            .lock()
            .get(id.index)
            .copied()
            .flatten()
            .filter(|task| task.id == id)
    }

    /// Delete a task. Returns `false` if `id` doesn't refer to a live task.
    pub fn delete_task(&self, id: TaskId) -> bool {
        let task = {
            let mut tasks = self.tasks.lock();
            match tasks.get(id.index) {
                Some(&Some(task)) if task.id == id => {
                    tasks.remove(id.index);
                    task
                }
                _ => return false,
            }
        };

        {
            let mut current = self.current.lock();
            if current.map_or(false, |t| ptr::eq(t, task)) {
                *current = None;
            }
        }
        *task.resumed.lock() = None;

        self.hooks().task_delete(task);
        log::debug!("deleted {:?}", id);
        true
    }

    /// Perform a context switch to `id`. Returns `false` if `id` doesn't
    /// refer to a live task.
    pub fn switch_to(&self, id: TaskId) -> bool {
        let Some(incoming) = self.task(id) else {
            return false;
        };

        // Safety: Not in a critical section
        unsafe { self.enter_critical() };

        let outgoing = *self.current.lock();
        if outgoing.map_or(false, |t| ptr::eq(t, incoming)) {
            // Safety: Matches the `enter_critical` above
            unsafe { self.exit_critical(()) };
            return true;
        }

        if let Some(task) = outgoing {
            task.save_integer_context();
        }

        // Safety: Inside a critical section. The outgoing task's stack
        //         pointer points its saved integer context, and the incoming
        //         task's points its full saved context.
        unsafe { self.hooks().task_switch(outgoing, incoming) };

        incoming.restore_integer_context();
        *self.current.lock() = Some(incoming);
        self.context_switches.fetch_add(1, Ordering::Relaxed);

        // Safety: Matches the `enter_critical` above
        unsafe { self.exit_critical(()) };

        log::trace!("switched to {:?}", id);
        true
    }

    /// Simulate the current task returning from its entry point.
    pub fn return_from_entry(&self) {
        if let Some(task) = self.current_task() {
            self.hooks().task_returned(task);
        }
    }

    /// Run one iteration of the idle task.
    pub fn idle(&self) {
        self.hooks().task_idle();
    }

    /// Run one iteration of the statistics task.
    pub fn stat(&self) {
        self.hooks().task_stat();
    }

    /// Simulate a tick interrupt.
    pub fn fire_tick_interrupt(&self) {
        tick::handle_tick(self);
    }

    /// Get the current state of the simulated tick timer.
    pub fn tick_registers(&self) -> SimTickRegisters {
        *self.tick_regs.lock()
    }

    /// Make semaphore creation fail once `limit` semaphores exist.
    pub fn set_semaphore_limit(&self, limit: usize) {
        self.sem_limit.store(limit, Ordering::Relaxed);
    }

    pub fn live_semaphore_count(&self) -> usize {
        self.lock_sems().len()
    }

    /// Check if a critical section is active.
    pub fn in_critical(&self) -> bool {
        self.cs.is_locked()
    }

    pub fn interrupt_nesting(&self) -> usize {
        self.interrupt_nesting.load(Ordering::Relaxed)
    }

    /// Get the number of ticks processed.
    pub fn tick_count(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Get the number of scheduling decisions made on interrupt exit.
    pub fn reschedule_count(&self) -> u64 {
        self.reschedules.load(Ordering::Relaxed)
    }

    pub fn timer_task_signal_count(&self) -> u64 {
        self.timer_task_signals.load(Ordering::Relaxed)
    }

    pub fn context_switch_count(&self) -> u64 {
        self.context_switches.load(Ordering::Relaxed)
    }

    fn lock_sems(&self) -> MutexGuard<'_, Slab<u16>> {
        self.sems.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for SimKernel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SimKernel")
            .field("cfg", &self.cfg)
            .field("running", &self.running)
            .field("ticks", &self.ticks)
            .finish_non_exhaustive()
    }
}

unsafe impl Kernel for SimKernel {
    type Task = SimTask;
    type TaskRef = &'static SimTask;
    type CriticalState = ();

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn current_task(&self) -> Option<&'static SimTask> {
        *self.current.lock()
    }

    unsafe fn enter_critical(&self) {
        mem::forget(self.cs.lock());
    }

    unsafe fn exit_critical(&self, (): ()) {
        // Safety: The lock was acquired by `enter_critical`, whose guard was
        //         forgotten
        unsafe { self.cs.force_unlock() };
    }
}

impl KernelTick for SimKernel {
    unsafe fn increment_interrupt_nesting(&self) {
        self.interrupt_nesting.fetch_add(1, Ordering::Relaxed);
    }

    fn time_tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        self.hooks().time_tick();
    }

    fn interrupt_exit(&self) {
        let prev = self.interrupt_nesting.fetch_sub(1, Ordering::Relaxed);
        debug_assert_ne!(prev, 0, "interrupt nesting underflow");
        if prev == 1 && self.is_running() {
            self.reschedules.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn signal_timer_task(&self) {
        self.timer_task_signals.fetch_add(1, Ordering::Relaxed);
    }
}

impl KernelSemaphore for SimKernel {
    type Semaphore = SimSemaphore;

    fn semaphore_create(&self, initial_count: u16) -> Option<SimSemaphore> {
        let mut sems = self.lock_sems();
        if sems.len() >= self.sem_limit.load(Ordering::Relaxed) {
            return None;
        }
        Some(SimSemaphore(sems.insert(initial_count)))
    }

    fn semaphore_delete(&self, sem: SimSemaphore) {
        let mut sems = self.lock_sems();
        if sems.contains(sem.0) {
            sems.remove(sem.0);
        } else {
            log::warn!("attempted to delete a nonexistent {:?}", sem);
        }
    }

    fn semaphore_pend(&self, sem: SimSemaphore) {
        let mut sems = self.lock_sems();
        loop {
            match sems.get_mut(sem.0) {
                Some(0) => {}
                Some(count) => {
                    *count -= 1;
                    return;
                }
                None => {
                    log::warn!("attempted to pend on a nonexistent {:?}", sem);
                    return;
                }
            }
            sems = self
                .sem_cv
                .wait(sems)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn semaphore_post(&self, sem: SimSemaphore) {
        let mut sems = self.lock_sems();
        if let Some(count) = sems.get_mut(sem.0) {
            *count = count.saturating_add(1);
            drop(sems);
            self.sem_cv.notify_all();
        } else {
            log::warn!("attempted to post to a nonexistent {:?}", sem);
        }
    }
}

impl SimTask {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Get the register state loaded when this task was last switched in.
    pub fn resumed_context(&self) -> Option<TaskContext> {
        *self.resumed.lock()
    }

    /// Get the address range of the task's stack.
    pub fn stack_range(&self) -> Range<usize> {
        self.stack.clone()
    }

    /// Push the integer context the hardware and the kernel would save on
    /// switching out.
    fn save_integer_context(&self) {
        let Some(ctx) = self.resumed.lock().take() else {
            return;
        };

        let sp = self.stack_pointer();
        let words = EXC_FRAME_WORDS + CALLEE_FRAME_WORDS;
        assert!(
            (sp as usize).wrapping_sub(words * 4) >= self.stack.start,
            "stack overflow in {:?}",
            self.id
        );

        // Safety: Checked above that the region is inside the task's stack
        unsafe {
            let sp = sp.sub(EXC_FRAME_WORDS);
            ptr::write_unaligned(sp as *mut ExceptionFrame, ctx.exc);
            let sp = sp.sub(CALLEE_FRAME_WORDS);
            ptr::write_unaligned(sp as *mut CalleeFrame, ctx.callee);
            self.set_stack_pointer(sp);
        }
    }

    /// Pop the integer context, leaving the stack pointer where the task
    /// resumes.
    fn restore_integer_context(&self) {
        // Safety: The saved context is inside the task's stack and was
        //         written by `build_stack_frame` or `save_integer_context`
        let (ctx, sp) =
            unsafe { frame::restore_frame(self.stack_pointer(), FrameLayout::Integer) };
        *self.resumed.lock() = Some(ctx);
        // Safety: `sp` is the task's stack top or where it was last switched
        //         out
        unsafe { self.set_stack_pointer(sp as *mut u32) };
    }
}

impl TaskCb for SimTask {
    fn options(&self) -> TaskOptions {
        self.options
    }

    fn stack_pointer(&self) -> *mut u32 {
        self.sp.load(Ordering::Relaxed)
    }

    unsafe fn set_stack_pointer(&self, sp: *mut u32) {
        debug_assert!(
            self.stack.contains(&(sp as usize)) || sp as usize == self.stack.end,
            "{:?}'s stack pointer {:p} is out of its stack",
            self.id,
            sp
        );
        self.sp.store(sp, Ordering::Relaxed);
    }

    fn tls(&self) -> &TlsTable {
        &self.tls
    }
}

impl fmt::Debug for SimTask {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SimTask")
            .field("id", &self.id)
            .field("options", &self.options)
            .field("sp", &self.sp)
            .finish()
    }
}
