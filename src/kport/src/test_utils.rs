//! A single-threaded kernel stand-in for unit tests
use core::{alloc::Layout, cell::Cell, ptr::NonNull};
use std::{
    cell::RefCell,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::{
    Kernel, KernelSemaphore, KernelTick, TaskCb, TaskOptions, TlsRuntime, TlsTable,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Event {
    EnterCritical,
    ExitCritical,
    IncrementNesting,
    TimeTick,
    InterruptExit,
    SignalTimerTask,
}

pub(crate) struct TestKernel {
    running: Cell<bool>,
    in_cs: Cell<bool>,
    cs_entries: Cell<usize>,
    current: Cell<Option<&'static TestTask>>,
    nesting: Cell<usize>,
    events: RefCell<Vec<Event>>,
    semaphores: RefCell<Vec<Option<u16>>>,
    fail_semaphore_creation: Cell<bool>,
    sem_calls_in_cs: Cell<usize>,
    pends: Cell<usize>,
    posts: Cell<usize>,
}

impl TestKernel {
    pub(crate) fn new() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        Self {
            running: Cell::new(false),
            in_cs: Cell::new(false),
            cs_entries: Cell::new(0),
            current: Cell::new(None),
            nesting: Cell::new(0),
            events: RefCell::new(Vec::new()),
            semaphores: RefCell::new(Vec::new()),
            fail_semaphore_creation: Cell::new(false),
            sem_calls_in_cs: Cell::new(0),
            pends: Cell::new(0),
            posts: Cell::new(0),
        }
    }

    /// Create a task that lives forever.
    pub(crate) fn spawn(&self, options: TaskOptions) -> &'static TestTask {
        Box::leak(Box::new(TestTask::new(options)))
    }

    pub(crate) fn set_running(&self, x: bool) {
        self.running.set(x);
    }

    pub(crate) fn set_current(&self, task: Option<&'static TestTask>) {
        self.current.set(task);
    }

    pub(crate) fn in_critical(&self) -> bool {
        self.in_cs.get()
    }

    pub(crate) fn critical_entry_count(&self) -> usize {
        self.cs_entries.get()
    }

    pub(crate) fn interrupt_nesting(&self) -> usize {
        self.nesting.get()
    }

    pub(crate) fn take_events(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.borrow_mut())
    }

    pub(crate) fn fail_semaphore_creation(&self, x: bool) {
        self.fail_semaphore_creation.set(x);
    }

    pub(crate) fn live_semaphore_count(&self) -> usize {
        self.semaphores.borrow().iter().flatten().count()
    }

    pub(crate) fn semaphore_calls_in_critical_section(&self) -> usize {
        self.sem_calls_in_cs.get()
    }

    pub(crate) fn semaphore_pend_count(&self) -> usize {
        self.pends.get()
    }

    pub(crate) fn semaphore_post_count(&self) -> usize {
        self.posts.get()
    }

    fn record(&self, e: Event) {
        self.events.borrow_mut().push(e);
    }

    fn check_sem_call(&self) {
        if self.in_cs.get() {
            self.sem_calls_in_cs.set(self.sem_calls_in_cs.get() + 1);
        }
    }
}

unsafe impl Kernel for TestKernel {
    type Task = TestTask;
    type TaskRef = &'static TestTask;
    type CriticalState = ();

    fn is_running(&self) -> bool {
        self.running.get()
    }

    fn current_task(&self) -> Option<Self::TaskRef> {
        self.current.get()
    }

    unsafe fn enter_critical(&self) {
        assert!(!self.in_cs.replace(true), "nested critical section");
        self.cs_entries.set(self.cs_entries.get() + 1);
        self.record(Event::EnterCritical);
    }

    unsafe fn exit_critical(&self, (): ()) {
        assert!(self.in_cs.replace(false));
        self.record(Event::ExitCritical);
    }
}

impl KernelTick for TestKernel {
    unsafe fn increment_interrupt_nesting(&self) {
        assert!(self.in_cs.get());
        self.nesting.set(self.nesting.get() + 1);
        self.record(Event::IncrementNesting);
    }

    fn time_tick(&self) {
        self.record(Event::TimeTick);
    }

    fn interrupt_exit(&self) {
        self.nesting.set(self.nesting.get() - 1);
        self.record(Event::InterruptExit);
    }

    fn signal_timer_task(&self) {
        self.record(Event::SignalTimerTask);
    }
}

impl KernelSemaphore for TestKernel {
    type Semaphore = usize;

    fn semaphore_create(&self, initial_count: u16) -> Option<usize> {
        self.check_sem_call();
        if self.fail_semaphore_creation.get() {
            return None;
        }
        let mut sems = self.semaphores.borrow_mut();
        sems.push(Some(initial_count));
        Some(sems.len() - 1)
    }

    fn semaphore_delete(&self, sem: usize) {
        self.check_sem_call();
        assert!(self.semaphores.borrow_mut()[sem].take().is_some());
    }

    fn semaphore_pend(&self, sem: usize) {
        self.check_sem_call();
        self.pends.set(self.pends.get() + 1);
        let mut sems = self.semaphores.borrow_mut();
        let count = sems[sem].as_mut().unwrap();
        // Nobody else can post in a single-threaded test
        assert!(*count > 0, "deadlock");
        *count -= 1;
    }

    fn semaphore_post(&self, sem: usize) {
        self.check_sem_call();
        self.posts.set(self.posts.get() + 1);
        *self.semaphores.borrow_mut()[sem].as_mut().unwrap() += 1;
    }
}

pub(crate) struct TestTask {
    serial: usize,
    options: TaskOptions,
    sp: Cell<*mut u32>,
    tls: TlsTable,
}

impl TestTask {
    pub(crate) fn new(options: TaskOptions) -> Self {
        static NEXT_SERIAL: AtomicUsize = AtomicUsize::new(0);
        Self {
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
            options,
            sp: Cell::new(core::ptr::null_mut()),
            tls: TlsTable::new(),
        }
    }

    /// A process-wide unique number identifying the task.
    pub(crate) fn serial(&self) -> usize {
        self.serial
    }
}

impl TaskCb for TestTask {
    fn options(&self) -> TaskOptions {
        self.options
    }

    fn stack_pointer(&self) -> *mut u32 {
        self.sp.get()
    }

    unsafe fn set_stack_pointer(&self, sp: *mut u32) {
        self.sp.set(sp);
    }

    fn tls(&self) -> &TlsTable {
        &self.tls
    }
}

/// Wraps a [`TlsRuntime`] to count the segments it manages.
pub(crate) struct TestRuntime<R> {
    inner: R,
    inits: AtomicUsize,
    thread_dtors: AtomicUsize,
}

impl<R> TestRuntime<R> {
    pub(crate) fn new(inner: R) -> Self {
        Self {
            inner,
            inits: AtomicUsize::new(0),
            thread_dtors: AtomicUsize::new(0),
        }
    }

    pub(crate) fn live_segments(&self) -> usize {
        self.inits.load(Ordering::Relaxed) - self.thread_dtors.load(Ordering::Relaxed)
    }

    pub(crate) fn thread_dtor_calls(&self) -> usize {
        self.thread_dtors.load(Ordering::Relaxed)
    }
}

impl<R: TlsRuntime> TlsRuntime for TestRuntime<R> {
    fn segment_layout(&self) -> Layout {
        self.inner.segment_layout()
    }

    unsafe fn init_segment(&self, segment: NonNull<u8>) {
        self.inits.fetch_add(1, Ordering::Relaxed);
        unsafe { self.inner.init_segment(segment) }
    }

    fn call_thread_dtors(&self, segment: NonNull<u8>) {
        self.thread_dtors.fetch_add(1, Ordering::Relaxed);
        self.inner.call_thread_dtors(segment)
    }
}
