use alloc::alloc::{alloc, dealloc};
use core::{alloc::Layout, fmt, ptr::NonNull};

use crate::{
    klock::{CsCell, CsGuard},
    lock_pool::{LockHandle, LockPool},
    tls::{id::IdAllocator, Destructor, TlsId, TlsRuntime, TlsValue},
    AllocIdError, CreateLockError, CreateTlsError, GetTlsError, InitError, Kernel,
    KernelSemaphore, PortCfg, SetDestructorError, SetTlsError, TaskCb, TaskOptions,
    MAX_TLS_TABLE_SIZE,
};

type DestructorTable<K> = [Option<Destructor<<K as Kernel>::Task>>; MAX_TLS_TABLE_SIZE];

/// The TLS and lock pool state of a port instance.
///
/// There is exactly one `Subsystem` per kernel. It's created once during
/// system startup, before any task uses TLS or runtime locks.
pub struct Subsystem<K: KernelSemaphore, R> {
    kernel: K,
    runtime: R,
    cfg: PortCfg,
    ids: IdAllocator,
    lib_id: TlsId,
    destructors: CsCell<DestructorTable<K>>,
    locks: LockPool<K::Semaphore>,
}

impl<K: KernelSemaphore, R: TlsRuntime> Subsystem<K, R> {
    /// Construct a `Subsystem`, reserving the first TLS ID for the library
    /// slot.
    ///
    /// Fails with [`InitError::Exhaustion`] if `cfg.tls_table_size()` is zero.
    pub fn new(kernel: K, runtime: R, cfg: PortCfg) -> Result<Self, InitError> {
        let ids = IdAllocator::new(cfg.tls_table_size());

        let lib_id = {
            let mut cs = CsGuard::lock(&kernel);
            ids.allocate(&mut cs)?
        };

        log::debug!(
            "TLS subsystem initialized: library slot = {:?}, lock pool capacity = {}",
            lib_id,
            cfg.lock_pool_capacity(),
        );

        Ok(Self {
            locks: LockPool::new(cfg.lock_pool_capacity()),
            kernel,
            runtime,
            cfg,
            ids,
            lib_id,
            destructors: CsCell::new([None; MAX_TLS_TABLE_SIZE]),
        })
    }

    /// Issue a new TLS ID.
    pub fn allocate_id(&self) -> Result<TlsId, AllocIdError> {
        let mut cs = CsGuard::lock(&self.kernel);
        let result = self.ids.allocate(&mut cs);
        drop(cs);

        match result {
            Ok(id) => log::trace!("issued {:?}", id),
            Err(_) => log::warn!("TLS IDs exhausted"),
        }
        result
    }

    /// Get the value of the slot `id` of `task` (or the current task if
    /// `task` is `None`).
    pub fn get_value(&self, task: Option<&K::Task>, id: TlsId) -> Result<TlsValue, GetTlsError> {
        let cs = CsGuard::lock(&self.kernel);
        if !self.ids.is_issued(id, &cs) {
            return Err(GetTlsError::BadId);
        }

        let current;
        let task = match task {
            Some(task) => task,
            None => {
                current = self.kernel.current_task().ok_or(GetTlsError::BadContext)?;
                &*current
            }
        };

        if task.options().contains(TaskOptions::NO_TLS) {
            return Err(GetTlsError::NotEnabled);
        }

        Ok(task.tls().read(&cs).get(id))
    }

    /// Set the value of the slot `id` of `task` (or the current task if
    /// `task` is `None`).
    ///
    /// The library slot is read-only through this method. Writing to it
    /// fails with [`SetTlsError::BadParam`].
    pub fn set_value(
        &self,
        task: Option<&K::Task>,
        id: TlsId,
        value: TlsValue,
    ) -> Result<(), SetTlsError> {
        let mut cs = CsGuard::lock(&self.kernel);
        if !self.ids.is_issued(id, &cs) {
            return Err(SetTlsError::BadId);
        }
        if id == self.lib_id {
            return Err(SetTlsError::BadParam);
        }

        let current;
        let task = match task {
            Some(task) => task,
            None => {
                current = self.kernel.current_task().ok_or(SetTlsError::BadContext)?;
                &*current
            }
        };

        if task.options().contains(TaskOptions::NO_TLS) {
            return Err(SetTlsError::NotEnabled);
        }

        task.tls().write(&mut cs).set(id, value);
        Ok(())
    }

    /// Register (`Some`) or unregister (`None`) the destructor for `id`.
    /// A registered destructor replaces the previous one.
    pub fn set_destructor(
        &self,
        id: TlsId,
        destructor: Option<Destructor<K::Task>>,
    ) -> Result<(), SetDestructorError> {
        let mut cs = CsGuard::lock(&self.kernel);
        if !self.ids.is_issued(id, &cs) {
            return Err(SetDestructorError::BadId);
        }
        self.destructors.write(&mut cs)[id.get()] = destructor;
        Ok(())
    }

    /// Allocate and initialize the library segment of a newly created task.
    /// Does nothing if the task has [`TaskOptions::NO_TLS`].
    pub fn task_create(&self, task: &K::Task) -> Result<(), CreateTlsError> {
        if task.options().contains(TaskOptions::NO_TLS) {
            return Ok(());
        }

        let layout = self.segment_layout();

        // Safety: `layout` has a non-zero size
        let segment = NonNull::new(unsafe { alloc(layout) }).ok_or_else(|| {
            log::warn!("failed to allocate a TLS segment of {:?}", layout);
            CreateTlsError::ResourceCreation
        })?;

        // Safety: `segment` is a fresh allocation of `layout`, which is
        //         at least as large as `segment_layout()`
        unsafe { self.runtime.init_segment(segment) };

        let mut cs = CsGuard::lock(&self.kernel);
        let slots = task.tls().write(&mut cs);
        *slots = crate::tls::TlsSlots::INIT;
        slots.set(self.lib_id, TlsValue::from_ptr(segment.as_ptr()));
        drop(cs);

        log::trace!("TLS segment {:p} allocated", segment);
        Ok(())
    }

    /// Run the destructors of a task being deleted and release its library
    /// segment. Does nothing if the task has [`TaskOptions::NO_TLS`].
    pub fn task_delete(&self, task: &K::Task) {
        if task.options().contains(TaskOptions::NO_TLS) {
            return;
        }

        // Take a snapshot so that destructors run outside the critical
        // section
        let mut pending = [(TlsId(0), TlsValue::NULL, None); MAX_TLS_TABLE_SIZE];
        let mut num_pending = 0;
        let segment;
        {
            let cs = CsGuard::lock(&self.kernel);
            let slots = task.tls().read(&cs);
            let destructors = self.destructors.read(&cs);
            for (id, value) in slots.touched() {
                if let Some(dtor) = destructors[id.get()] {
                    pending[num_pending] = (id, value, Some(dtor));
                    num_pending += 1;
                }
            }
            segment = slots.get(self.lib_id).as_non_null::<u8>();
        }

        for &(id, value, dtor) in &pending[..num_pending] {
            if let Some(dtor) = dtor {
                dtor(task, id, value);
            }
        }

        if let Some(segment) = segment {
            self.runtime.call_thread_dtors(segment);

            // Safety: `segment` was allocated by `task_create` with the same
            //         layout and hasn't been freed yet
            unsafe { dealloc(segment.as_ptr(), self.segment_layout()) };
            log::trace!("TLS segment {:p} freed", segment);
        }

        let mut cs = CsGuard::lock(&self.kernel);
        *task.tls().write(&mut cs) = crate::tls::TlsSlots::INIT;
    }

    /// Get the runtime's thread pointer: the library segment of the current
    /// task, or the runtime's static image if the kernel is not running.
    pub fn thread_pointer(&self) -> Option<NonNull<u8>> {
        if !self.kernel.is_running() {
            return self.runtime.initial_image();
        }

        let task = self.kernel.current_task()?;
        if task.options().contains(TaskOptions::NO_TLS) {
            return None;
        }

        let cs = CsGuard::lock(&self.kernel);
        task.tls().read(&cs).get(self.lib_id).as_non_null()
    }

    fn segment_layout(&self) -> Layout {
        let layout = self.runtime.segment_layout();
        if layout.size() == 0 {
            // The global allocator doesn't accept zero-sized requests
            Layout::from_size_align(1, layout.align()).unwrap_or(layout)
        } else {
            layout
        }
    }
}

impl<K: KernelSemaphore, R> Subsystem<K, R> {
    #[inline]
    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    #[inline]
    pub fn cfg(&self) -> &PortCfg {
        &self.cfg
    }

    #[inline]
    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    /// Get the ID of the library slot.
    #[inline]
    pub fn library_id(&self) -> TlsId {
        self.lib_id
    }

    // Runtime locks

    /// Create a lock from the pool. See [`LockPool::try_create`].
    pub fn lock_try_create(&self) -> Result<LockHandle, CreateLockError> {
        self.locks.try_create(&self.kernel)
    }

    /// Create a lock from the pool. See [`LockPool::create`].
    pub fn lock_create(&self) -> Option<LockHandle> {
        self.locks.create(&self.kernel)
    }

    /// See [`LockPool::destroy`].
    pub fn lock_destroy(&self, handle: LockHandle) {
        self.locks.destroy(&self.kernel, handle)
    }

    /// See [`LockPool::acquire`].
    pub fn lock_acquire(&self, handle: Option<LockHandle>) {
        self.locks.acquire(&self.kernel, handle)
    }

    /// See [`LockPool::release`].
    pub fn lock_release(&self, handle: Option<LockHandle>) {
        self.locks.release(&self.kernel, handle)
    }

    pub fn lock_free_count(&self) -> usize {
        self.locks.free_count(&self.kernel)
    }
}

impl<K: KernelSemaphore, R> fmt::Debug for Subsystem<K, R> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Subsystem")
            .field("cfg", &self.cfg)
            .field("lib_id", &self.lib_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        test_utils::{TestKernel, TestRuntime, TestTask},
        tls::ZeroInitRuntime,
        PortOptions,
    };
    use std::{cell::RefCell, sync::Mutex};

    fn cfg(tls_table_size: usize) -> PortCfg {
        PortCfg::new(PortOptions {
            tls_table_size,
            lock_pool_capacity: 2,
            ..PortOptions::DEFAULT
        })
        .unwrap()
    }

    fn runtime() -> TestRuntime<ZeroInitRuntime> {
        TestRuntime::new(ZeroInitRuntime(Layout::from_size_align(64, 8).unwrap()))
    }

    #[test]
    fn library_id_exhaustion() {
        let kernel = TestKernel::new();
        assert_eq!(
            Subsystem::new(&kernel, runtime(), cfg(0)).err(),
            Some(InitError::Exhaustion)
        );
    }

    #[test]
    fn library_slot_lifecycle() {
        let kernel = TestKernel::new();
        let sys = Subsystem::new(&kernel, runtime(), cfg(4)).unwrap();
        assert_eq!(sys.library_id(), TlsId::new(0));

        let task = TestTask::new(TaskOptions::empty());
        sys.task_create(&task).unwrap();
        let seg = sys.get_value(Some(&task), sys.library_id()).unwrap();
        assert!(!seg.is_null());
        assert_eq!(unsafe { *seg.as_ptr::<u64>() }, 0, "zero-initialized");

        sys.task_delete(&task);
        assert!(sys
            .get_value(Some(&task), sys.library_id())
            .unwrap()
            .is_null());
    }

    #[test]
    fn ids_are_checked_first() {
        let kernel = TestKernel::new();
        let sys = Subsystem::new(&kernel, runtime(), cfg(4)).unwrap();
        let unissued = TlsId::new(1);

        assert_eq!(sys.get_value(None, unissued), Err(GetTlsError::BadId));
        assert_eq!(
            sys.set_value(None, unissued, TlsValue::new(1)),
            Err(SetTlsError::BadId)
        );
        assert_eq!(
            sys.set_destructor(unissued, None),
            Err(SetDestructorError::BadId)
        );

        let id = sys.allocate_id().unwrap();
        assert_eq!(sys.get_value(None, id), Err(GetTlsError::BadContext));
        assert_eq!(
            sys.set_value(None, id, TlsValue::new(1)),
            Err(SetTlsError::BadContext)
        );
    }

    #[test]
    fn no_tls_task() {
        let kernel = TestKernel::new();
        let sys = Subsystem::new(&kernel, runtime(), cfg(4)).unwrap();
        let id = sys.allocate_id().unwrap();

        let task = TestTask::new(TaskOptions::NO_TLS);
        sys.task_create(&task).unwrap();
        for id in [sys.library_id(), id] {
            assert_eq!(
                sys.get_value(Some(&task), id),
                Err(GetTlsError::NotEnabled)
            );
        }
        assert_eq!(
            sys.set_value(Some(&task), id, TlsValue::new(5)),
            Err(SetTlsError::NotEnabled)
        );
        sys.task_delete(&task);
        assert_eq!(sys.runtime().live_segments(), 0);
        assert_eq!(sys.runtime().thread_dtor_calls(), 0);
    }

    #[test]
    fn current_task_is_used_by_default() {
        let kernel = TestKernel::new();
        let sys = Subsystem::new(&kernel, runtime(), cfg(4)).unwrap();
        let id = sys.allocate_id().unwrap();

        let task = kernel.spawn(TaskOptions::empty());
        sys.task_create(&task).unwrap();
        kernel.set_current(Some(task));
        kernel.set_running(true);

        sys.set_value(None, id, TlsValue::new(9)).unwrap();
        assert_eq!(sys.get_value(Some(task), id), Ok(TlsValue::new(9)));
        assert_eq!(
            sys.thread_pointer(),
            sys.get_value(None, sys.library_id())
                .unwrap()
                .as_non_null()
        );
        sys.task_delete(task);
    }

    #[test]
    fn thread_pointer_before_start() {
        struct Image;
        static IMAGE: u64 = 0;
        impl TlsRuntime for Image {
            fn segment_layout(&self) -> Layout {
                Layout::new::<u64>()
            }
            unsafe fn init_segment(&self, segment: NonNull<u8>) {
                unsafe { segment.as_ptr().cast::<u64>().write(IMAGE) };
            }
            fn initial_image(&self) -> Option<NonNull<u8>> {
                NonNull::new(&IMAGE as *const u64 as *mut u8)
            }
        }

        let kernel = TestKernel::new();
        let sys = Subsystem::new(&kernel, Image, cfg(4)).unwrap();
        assert_eq!(
            sys.thread_pointer(),
            NonNull::new(&IMAGE as *const u64 as *mut u8)
        );
    }

    static DTOR_LOG: Mutex<Vec<(usize, TlsId, TlsValue)>> = Mutex::new(Vec::new());

    fn log_dtor(task: &TestTask, id: TlsId, value: TlsValue) {
        DTOR_LOG.lock().unwrap().push((task.serial(), id, value));
    }

    #[test]
    fn destructors_fire_for_touched_slots() {
        let kernel = TestKernel::new();
        let sys = Subsystem::new(&kernel, runtime(), cfg(4)).unwrap();
        let id1 = sys.allocate_id().unwrap();
        let id2 = sys.allocate_id().unwrap();
        sys.set_destructor(id1, Some(log_dtor)).unwrap();
        sys.set_destructor(id2, Some(log_dtor)).unwrap();

        let a = TestTask::new(TaskOptions::empty());
        let b = TestTask::new(TaskOptions::empty());
        sys.task_create(&a).unwrap();
        sys.task_create(&b).unwrap();

        sys.set_value(Some(&a), id2, TlsValue::new(7)).unwrap();
        sys.set_value(Some(&a), id1, TlsValue::new(42)).unwrap();
        // `b` never sets anything but writes a null value
        sys.set_value(Some(&b), id1, TlsValue::NULL).unwrap();

        sys.task_delete(&a);
        sys.task_delete(&b);

        let log: Vec<_> = DTOR_LOG
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.0 == a.serial() || e.0 == b.serial())
            .cloned()
            .collect();
        assert_eq!(
            log,
            [
                (a.serial(), id1, TlsValue::new(42)),
                (a.serial(), id2, TlsValue::new(7)),
            ]
        );
        assert_eq!(sys.runtime().live_segments(), 0);
        assert_eq!(sys.runtime().thread_dtor_calls(), 2);
    }

    #[test]
    fn library_slot_is_read_only() {
        let kernel = TestKernel::new();
        let sys = Subsystem::new(&kernel, runtime(), cfg(4)).unwrap();

        let task = kernel.spawn(TaskOptions::empty());
        sys.task_create(task).unwrap();
        let seg = sys.get_value(Some(task), sys.library_id()).unwrap();

        for value in [TlsValue::new(0x1000), TlsValue::NULL] {
            assert_eq!(
                sys.set_value(Some(task), sys.library_id(), value),
                Err(SetTlsError::BadParam)
            );
        }
        // Rejected before the task is even looked up
        assert_eq!(
            sys.set_value(None, sys.library_id(), TlsValue::new(1)),
            Err(SetTlsError::BadParam)
        );
        assert_eq!(sys.get_value(Some(task), sys.library_id()), Ok(seg));

        sys.task_delete(task);
        assert_eq!(sys.runtime().live_segments(), 0);
        assert_eq!(sys.runtime().thread_dtor_calls(), 1);
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum SegmentEvent {
        Init(usize),
        Dtor(TlsId, TlsValue),
        ThreadDtors(usize),
    }

    const SEGMENT_MARKER: u64 = 0x5a5a_1234_a5a5_4321;

    thread_local! {
        static SEGMENT_EVENTS: RefCell<Vec<SegmentEvent>> = RefCell::new(Vec::new());
        static LIVE_SEGMENTS: RefCell<usize> = RefCell::new(0);
    }

    /// Logs segment events to the current thread.
    struct TracingRuntime;

    impl TlsRuntime for TracingRuntime {
        fn segment_layout(&self) -> Layout {
            Layout::new::<u64>()
        }

        unsafe fn init_segment(&self, segment: NonNull<u8>) {
            unsafe { segment.as_ptr().cast::<u64>().write(SEGMENT_MARKER) };
            LIVE_SEGMENTS.with(|n| *n.borrow_mut() += 1);
            SEGMENT_EVENTS.with(|e| {
                e.borrow_mut()
                    .push(SegmentEvent::Init(segment.as_ptr() as usize))
            });
        }

        fn call_thread_dtors(&self, segment: NonNull<u8>) {
            assert_eq!(unsafe { *segment.as_ptr().cast::<u64>() }, SEGMENT_MARKER);
            LIVE_SEGMENTS.with(|n| *n.borrow_mut() -= 1);
            SEGMENT_EVENTS.with(|e| {
                e.borrow_mut()
                    .push(SegmentEvent::ThreadDtors(segment.as_ptr() as usize))
            });
        }
    }

    fn trace_dtor(_: &TestTask, id: TlsId, value: TlsValue) {
        assert_eq!(LIVE_SEGMENTS.with(|n| *n.borrow()), 1);
        SEGMENT_EVENTS.with(|e| e.borrow_mut().push(SegmentEvent::Dtor(id, value)));
    }

    fn trace_library_dtor(task: &TestTask, id: TlsId, value: TlsValue) {
        // The segment must still be allocated and intact
        let segment = value.as_non_null::<u64>().unwrap();
        assert_eq!(unsafe { *segment.as_ptr() }, SEGMENT_MARKER);
        trace_dtor(task, id, value);
    }

    #[test]
    fn destructors_run_before_segment_is_freed() {
        let kernel = TestKernel::new();
        let sys = Subsystem::new(&kernel, TracingRuntime, cfg(4)).unwrap();
        let id = sys.allocate_id().unwrap();
        sys.set_destructor(id, Some(trace_dtor)).unwrap();
        sys.set_destructor(sys.library_id(), Some(trace_library_dtor))
            .unwrap();

        let task = TestTask::new(TaskOptions::empty());
        sys.task_create(&task).unwrap();
        let seg = sys.get_value(Some(&task), sys.library_id()).unwrap();
        sys.set_value(Some(&task), id, TlsValue::new(42)).unwrap();

        sys.task_delete(&task);
        assert!(sys
            .get_value(Some(&task), sys.library_id())
            .unwrap()
            .is_null());
        assert_eq!(sys.get_value(Some(&task), id), Ok(TlsValue::NULL));

        let seg_addr = seg.as_ptr::<u8>() as usize;
        assert_eq!(
            SEGMENT_EVENTS.with(|e| e.borrow().clone()),
            [
                SegmentEvent::Init(seg_addr),
                SegmentEvent::Dtor(sys.library_id(), seg),
                SegmentEvent::Dtor(id, TlsValue::new(42)),
                SegmentEvent::ThreadDtors(seg_addr),
            ]
        );

        // A second deletion finds nothing to run or free
        sys.task_delete(&task);
        assert_eq!(SEGMENT_EVENTS.with(|e| e.borrow().len()), 4);
        assert_eq!(LIVE_SEGMENTS.with(|n| *n.borrow()), 0);
    }

    #[test]
    fn destructor_can_be_cleared() {
        thread_local! {
            static CALLS: RefCell<usize> = RefCell::new(0);
        }
        fn count(_: &TestTask, _: TlsId, _: TlsValue) {
            CALLS.with(|c| *c.borrow_mut() += 1);
        }

        let kernel = TestKernel::new();
        let sys = Subsystem::new(&kernel, runtime(), cfg(4)).unwrap();
        let id = sys.allocate_id().unwrap();
        sys.set_destructor(id, Some(count)).unwrap();
        sys.set_destructor(id, None).unwrap();

        let task = TestTask::new(TaskOptions::empty());
        sys.task_create(&task).unwrap();
        sys.set_value(Some(&task), id, TlsValue::new(1)).unwrap();
        sys.task_delete(&task);
        assert_eq!(CALLS.with(|c| *c.borrow()), 0);
    }

    #[test]
    fn lock_wrappers() {
        let kernel = TestKernel::new();
        let sys = Subsystem::new(&kernel, runtime(), cfg(4)).unwrap();
        let l1 = sys.lock_create();
        let l2 = sys.lock_try_create();
        assert!(l1.is_some() && l2.is_ok());
        assert_eq!(sys.lock_try_create(), Err(CreateLockError::Exhaustion));
        sys.lock_acquire(l1);
        sys.lock_release(l1);
        sys.lock_destroy(l1.unwrap());
        assert_eq!(sys.lock_free_count(), 1);
    }
}
