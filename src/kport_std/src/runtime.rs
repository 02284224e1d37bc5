use kport::TlsRuntime;
use std::{alloc::Layout, ptr::NonNull};

/// A [`TlsRuntime`] whose segments are a copy of an initialized data image
/// (`.tdata`) followed by zero-filled data (`.tbss`), the layout toolchains
/// use for thread-local sections.
#[derive(Debug, Clone, Copy)]
pub struct TemplateRuntime {
    tdata: &'static [u8],
    tbss_size: usize,
    align: usize,
}

impl TemplateRuntime {
    /// # Panics
    ///
    /// Panics if `align` is not a power of two.
    pub const fn new(tdata: &'static [u8], tbss_size: usize, align: usize) -> Self {
        assert!(align.is_power_of_two(), "alignment is not a power of two");
        Self {
            tdata,
            tbss_size,
            align,
        }
    }
}

impl TlsRuntime for TemplateRuntime {
    fn segment_layout(&self) -> Layout {
        let size = self.tdata.len() + self.tbss_size;
        Layout::from_size_align(size, self.align).unwrap_or_else(|_| Layout::new::<u8>())
    }

    unsafe fn init_segment(&self, segment: NonNull<u8>) {
        let p = segment.as_ptr();
        // Safety: `segment` is valid for writes of `segment_layout()`
        unsafe {
            p.copy_from_nonoverlapping(self.tdata.as_ptr(), self.tdata.len());
            p.add(self.tdata.len()).write_bytes(0, self.tbss_size);
        }
    }

    fn initial_image(&self) -> Option<NonNull<u8>> {
        NonNull::new(self.tdata.as_ptr() as *mut u8)
    }
}
