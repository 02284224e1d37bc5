//! Fixed-capacity pool of semaphore-backed locks
//!
//! Runtime libraries (e.g., a C library guarding its heap or its file table)
//! ask for locks at arbitrary times. This pool hands out at most `capacity`
//! of them. Each lock is backed by a kernel semaphore created with an initial
//! count of one. Destroyed locks are recycled in LIFO order.
//!
//! The pool's free list is protected by the critical section, but semaphore
//! operations are always performed outside it.
use alloc::boxed::Box;
use core::{fmt, mem};

use crate::{
    klock::{CsCell, CsGuard},
    CreateLockError, KernelSemaphore,
};

/// Refers to a lock in a [`LockPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockHandle(u16);

impl LockHandle {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy)]
enum LockNode<S> {
    /// In the free list. Points the next free node.
    Free(Option<LockHandle>),
    /// Removed from the free list, semaphore creation in progress, or
    /// semaphore deletion in progress.
    Reserved,
    /// Owned by a handle.
    Bound(S),
}

struct PoolState<S> {
    nodes: Box<[LockNode<S>]>,
    first_free: Option<LockHandle>,
    num_free: usize,
}

/// A fixed-capacity pool of locks.
pub struct LockPool<S> {
    state: CsCell<PoolState<S>>,
}

impl<S: Copy + fmt::Debug + Send> LockPool<S> {
    /// Construct a `LockPool` with all `capacity` nodes free. The nodes are
    /// handed out in ascending order at first.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` exceeds [`MAX_LOCK_POOL_CAPACITY`].
    ///
    /// [`MAX_LOCK_POOL_CAPACITY`]: crate::MAX_LOCK_POOL_CAPACITY
    pub fn new(capacity: usize) -> Self {
        assert!(capacity <= crate::MAX_LOCK_POOL_CAPACITY);
        let nodes: Box<[_]> = (0..capacity)
            .map(|i| {
                LockNode::Free(if i + 1 < capacity {
                    Some(LockHandle((i + 1) as u16))
                } else {
                    None
                })
            })
            .collect();
        Self {
            state: CsCell::new(PoolState {
                first_free: if capacity > 0 {
                    Some(LockHandle(0))
                } else {
                    None
                },
                nodes,
                num_free: capacity,
            }),
        }
    }

    /// Get the total number of nodes.
    pub fn capacity<K: KernelSemaphore<Semaphore = S>>(&self, kernel: &K) -> usize {
        let cs = CsGuard::lock(kernel);
        self.state.read(&cs).nodes.len()
    }

    /// Get the number of nodes in the free list.
    pub fn free_count<K: KernelSemaphore<Semaphore = S>>(&self, kernel: &K) -> usize {
        let cs = CsGuard::lock(kernel);
        self.state.read(&cs).num_free
    }

    /// Create a lock. Never blocks.
    pub fn try_create<K: KernelSemaphore<Semaphore = S>>(
        &self,
        kernel: &K,
    ) -> Result<LockHandle, CreateLockError> {
        // Take a node from the free list
        let handle = {
            let mut cs = CsGuard::lock(kernel);
            let state = self.state.write(&mut cs);
            let handle = state.first_free.ok_or(CreateLockError::Exhaustion)?;
            let node = &mut state.nodes[handle.index()];
            state.first_free = match mem::replace(node, LockNode::Reserved) {
                LockNode::Free(next) => next,
                _ => unreachable!("a node in the free list is not free"),
            };
            state.num_free -= 1;
            handle
        };

        let Some(sem) = kernel.semaphore_create(1) else {
            log::debug!("semaphore creation failed; returning {:?}", handle);
            let mut cs = CsGuard::lock(kernel);
            self.state.write(&mut cs).push_free(handle);
            return Err(CreateLockError::ResourceCreation);
        };

        let mut cs = CsGuard::lock(kernel);
        self.state.write(&mut cs).nodes[handle.index()] = LockNode::Bound(sem);
        drop(cs);

        log::trace!("created {:?} backed by {:?}", handle, sem);
        Ok(handle)
    }

    /// Create a lock. Returns `None` if the pool is exhausted or the kernel
    /// failed to create a semaphore.
    pub fn create<K: KernelSemaphore<Semaphore = S>>(&self, kernel: &K) -> Option<LockHandle> {
        match self.try_create(kernel) {
            Ok(handle) => Some(handle),
            Err(e) => {
                log::warn!("lock creation failed: {:?}", e);
                None
            }
        }
    }

    /// Destroy a lock and return its node to the free list.
    ///
    /// `handle` must refer to a live lock. Destroying a lock twice is a
    /// precondition violation, which is only detected by a debug assertion.
    pub fn destroy<K: KernelSemaphore<Semaphore = S>>(&self, kernel: &K, handle: LockHandle) {
        let sem = {
            let mut cs = CsGuard::lock(kernel);
            let node = self.state.write(&mut cs).nodes.get_mut(handle.index());
            match node {
                Some(node) => match *node {
                    LockNode::Bound(sem) => {
                        *node = LockNode::Reserved;
                        Some(sem)
                    }
                    _ => None,
                },
                None => None,
            }
        };

        debug_assert!(sem.is_some(), "{:?} is not a live lock", handle);
        let Some(sem) = sem else { return };

        kernel.semaphore_delete(sem);

        let mut cs = CsGuard::lock(kernel);
        self.state.write(&mut cs).push_free(handle);
        drop(cs);

        log::trace!("destroyed {:?}", handle);
    }

    /// Acquire a lock, blocking indefinitely.
    ///
    /// This is a no-op if the kernel is not running or `handle` is `None`.
    pub fn acquire<K: KernelSemaphore<Semaphore = S>>(
        &self,
        kernel: &K,
        handle: Option<LockHandle>,
    ) {
        if let Some(sem) = self.bound_semaphore(kernel, handle) {
            kernel.semaphore_pend(sem);
        }
    }

    /// Release a lock.
    ///
    /// This is a no-op if the kernel is not running or `handle` is `None`.
    pub fn release<K: KernelSemaphore<Semaphore = S>>(
        &self,
        kernel: &K,
        handle: Option<LockHandle>,
    ) {
        if let Some(sem) = self.bound_semaphore(kernel, handle) {
            kernel.semaphore_post(sem);
        }
    }

    fn bound_semaphore<K: KernelSemaphore<Semaphore = S>>(
        &self,
        kernel: &K,
        handle: Option<LockHandle>,
    ) -> Option<S> {
        let handle = handle?;
        if !kernel.is_running() {
            return None;
        }

        let cs = CsGuard::lock(kernel);
        match self.state.read(&cs).nodes.get(handle.index()) {
            Some(&LockNode::Bound(sem)) => Some(sem),
            _ => {
                debug_assert!(false, "{:?} is not a live lock", handle);
                None
            }
        }
    }
}

impl<S> PoolState<S> {
    fn push_free(&mut self, handle: LockHandle) {
        self.nodes[handle.index()] = LockNode::Free(self.first_free);
        self.first_free = Some(handle);
        self.num_free += 1;
    }
}

impl<S> fmt::Debug for LockPool<S> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("LockPool")
    }
}
