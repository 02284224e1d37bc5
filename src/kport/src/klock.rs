//! Critical-section-protected cells
use core::{cell::UnsafeCell, fmt};

use crate::Kernel;

/// RAII guard for the kernel's critical section. The critical section is
/// left when this is dropped.
pub(crate) struct CsGuard<'a, K: Kernel> {
    kernel: &'a K,
    state: Option<K::CriticalState>,
}

impl<'a, K: Kernel> CsGuard<'a, K> {
    /// Enter a critical section.
    ///
    /// This crate never holds two guards at once, so the kernel's
    /// non-reentrancy requirement is upheld as long as the caller is not
    /// already inside a critical section.
    #[inline]
    pub(crate) fn lock(kernel: &'a K) -> Self {
        // Safety: See above
        let state = unsafe { kernel.enter_critical() };
        Self {
            kernel,
            state: Some(state),
        }
    }
}

impl<K: Kernel> Drop for CsGuard<'_, K> {
    #[inline]
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            // Safety: `state` came from the matching `enter_critical`
            unsafe { self.kernel.exit_critical(state) };
        }
    }
}

/// Cell type that can be accessed only while the critical section is held
/// (i.e., with a [`CsGuard`] in hand).
pub(crate) struct CsCell<T: ?Sized>(UnsafeCell<T>);

// Safety: Accesses are serialized by the critical section
unsafe impl<T: ?Sized + Send> Sync for CsCell<T> {}

impl<T> CsCell<T> {
    #[inline]
    pub(crate) const fn new(x: T) -> Self {
        Self(UnsafeCell::new(x))
    }
}

impl<T: ?Sized> CsCell<T> {
    #[inline]
    pub(crate) fn read<'a, K: Kernel>(&'a self, _cs: &'a CsGuard<'_, K>) -> &'a T {
        // Safety: The critical section is held, and no `&mut T` can coexist
        //         because `write` borrows the guard mutably
        unsafe { &*self.0.get() }
    }

    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub(crate) fn write<'a, K: Kernel>(&'a self, _cs: &'a mut CsGuard<'_, K>) -> &'a mut T {
        // Safety: The critical section is held exclusively by the caller
        unsafe { &mut *self.0.get() }
    }

    #[inline]
    pub(crate) fn get_mut(&mut self) -> &mut T {
        self.0.get_mut()
    }
}

impl<T: ?Sized> fmt::Debug for CsCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("CsCell(< protected >)")
    }
}
