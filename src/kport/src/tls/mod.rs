//! Thread-local storage
//!
//! Each task carries a [`TlsTable`], an array of pointer-sized slots indexed
//! by [`TlsId`]. IDs are issued process-wide by [`Subsystem::allocate_id`].
//! One ID is reserved at [`Subsystem::new`] for the *library slot*, which
//! holds the address of a per-task segment described by a [`TlsRuntime`]
//! (typically the C library's or the compiler runtime's thread-local data).
//!
//! [`Subsystem::allocate_id`]: crate::Subsystem::allocate_id
//! [`Subsystem::new`]: crate::Subsystem::new
use core::{alloc::Layout, fmt, ptr::NonNull};

use crate::{
    klock::{CsCell, CsGuard},
    Kernel, MAX_TLS_TABLE_SIZE,
};

pub(crate) mod id;

/// Identifies a TLS slot. Issued by [`Subsystem::allocate_id`].
///
/// [`Subsystem::allocate_id`]: crate::Subsystem::allocate_id
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TlsId(pub(crate) u8);

impl TlsId {
    /// Construct a `TlsId` from a raw index. The result is not necessarily
    /// a valid (issued) ID.
    #[inline]
    pub const fn new(index: usize) -> Self {
        Self(if index > u8::MAX as usize {
            u8::MAX
        } else {
            index as u8
        })
    }

    #[inline]
    pub const fn get(self) -> usize {
        self.0 as usize
    }
}

/// The contents of a TLS slot: a pointer-sized opaque value. New slots hold
/// [`TlsValue::NULL`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TlsValue(usize);

impl TlsValue {
    pub const NULL: Self = Self(0);

    #[inline]
    pub const fn new(x: usize) -> Self {
        Self(x)
    }

    #[inline]
    pub const fn get(self) -> usize {
        self.0
    }

    #[inline]
    pub fn from_ptr<T>(p: *mut T) -> Self {
        Self(p as usize)
    }

    #[inline]
    pub fn as_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    #[inline]
    pub fn as_non_null<T>(self) -> Option<NonNull<T>> {
        NonNull::new(self.as_ptr())
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for TlsValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "TlsValue({:#x})", self.0)
    }
}

/// A per-id callback invoked on task deletion for every slot the task has
/// set. Receives the task, the slot's ID and the slot's last value.
pub type Destructor<Task> = fn(&Task, TlsId, TlsValue);

/// The slots of a task. Embedded in the kernel's task control block.
pub struct TlsTable {
    slots: CsCell<TlsSlots>,
}

pub(crate) struct TlsSlots {
    pub(crate) values: [TlsValue; MAX_TLS_TABLE_SIZE],
    /// Bit `i` is set if slot `i` was ever assigned a non-null value.
    pub(crate) touched: u32,
}

impl TlsSlots {
    pub(crate) const INIT: Self = Self {
        values: [TlsValue::NULL; MAX_TLS_TABLE_SIZE],
        touched: 0,
    };

    #[inline]
    pub(crate) fn get(&self, id: TlsId) -> TlsValue {
        self.values[id.get()]
    }

    #[inline]
    pub(crate) fn set(&mut self, id: TlsId, value: TlsValue) {
        self.values[id.get()] = value;
        if !value.is_null() {
            self.touched |= 1 << id.0;
        }
    }

    /// Iterate over the slots ever set, in ascending ID order.
    pub(crate) fn touched(&self) -> impl Iterator<Item = (TlsId, TlsValue)> + '_ {
        (0..MAX_TLS_TABLE_SIZE)
            .filter(move |&i| self.touched & (1 << i) != 0)
            .map(move |i| (TlsId(i as u8), self.values[i]))
    }
}

impl TlsTable {
    pub const fn new() -> Self {
        Self {
            slots: CsCell::new(TlsSlots::INIT),
        }
    }

    #[inline]
    pub(crate) fn read<'a, K: Kernel>(&'a self, cs: &'a CsGuard<'_, K>) -> &'a TlsSlots {
        self.slots.read(cs)
    }

    #[inline]
    pub(crate) fn write<'a, K: Kernel>(&'a self, cs: &'a mut CsGuard<'_, K>) -> &'a mut TlsSlots {
        self.slots.write(cs)
    }
}

impl Default for TlsTable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TlsTable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("TlsTable")
    }
}

/// The runtime library whose thread-local data lives in the library slot.
pub trait TlsRuntime {
    /// Get the size and alignment of a task's segment.
    fn segment_layout(&self) -> Layout;

    /// Initialize a newly allocated segment.
    ///
    /// # Safety
    ///
    /// `segment` points to a block of [`Self::segment_layout`] which is
    /// valid for writes and not yet initialized.
    unsafe fn init_segment(&self, segment: NonNull<u8>);

    /// Run the runtime's own thread-exit handlers for the task owning
    /// `segment`. Called before the segment is freed.
    fn call_thread_dtors(&self, segment: NonNull<u8>) {
        let _ = segment;
    }

    /// The static image used as the thread-local data before the kernel
    /// starts.
    fn initial_image(&self) -> Option<NonNull<u8>> {
        None
    }
}

/// A [`TlsRuntime`] whose segments are zero-filled blocks of a fixed layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZeroInitRuntime(pub Layout);

impl TlsRuntime for ZeroInitRuntime {
    fn segment_layout(&self) -> Layout {
        self.0
    }

    unsafe fn init_segment(&self, segment: NonNull<u8>) {
        // Safety: Upheld by the caller
        unsafe { segment.as_ptr().write_bytes(0, self.0.size()) };
    }
}
