//! Initial saved-register images for new tasks
//!
//! A new task's stack is prepared so that it looks exactly like the stack of
//! a task that has been switched out. The first switch-in then "returns" into
//! the task's entry point.
use core::{mem::MaybeUninit, ptr};

use crate::{PortCfg, TaskOptions};

/// xPSR with only the Thumb bit set.
pub const XPSR_THUMB: u32 = 0x0100_0000;

/// The initial FPSCR value (default NaN mode).
pub const FPSCR_INIT: u32 = 0x0200_0000;

/// The number of words in the hardware-stacked exception frame.
pub const EXC_FRAME_WORDS: usize = 8;

/// The number of words in the software-stacked callee-saved register frame.
pub const CALLEE_FRAME_WORDS: usize = 8;

/// The number of words in the integer-only frame.
pub const INTEGER_FRAME_WORDS: usize = EXC_FRAME_WORDS + CALLEE_FRAME_WORDS;

/// The number of words in [`FpBlock`]. Even, so that pushing or popping it
/// keeps the stack pointer 8-byte aligned.
pub const FP_BLOCK_WORDS: usize = 34;

/// The registers saved by the hardware on exception entry, in memory order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct ExceptionFrame {
    pub r0: u32,
    pub r1: u32,
    pub r2: u32,
    pub r3: u32,
    pub r12: u32,
    pub lr: u32,
    pub pc: u32,
    pub xpsr: u32,
}

/// R4..R11, in memory order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct CalleeFrame {
    pub r: [u32; CALLEE_FRAME_WORDS],
}

impl CalleeFrame {
    /// Get the value of register `Rn` (`4 <= n <= 11`).
    #[inline]
    pub fn reg(&self, n: usize) -> u32 {
        self.r[n - 4]
    }
}

/// The floating-point registers, in memory order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct FpBlock {
    pub s: [u32; 32],
    pub fpscr: u32,
    pub reserved: u32,
}

impl FpBlock {
    pub const ZERO: Self = Self {
        s: [0; 32],
        fpscr: 0,
        reserved: 0,
    };

    /// The contents given to a newly created task: `S<n>` holds `n` as a
    /// single-precision float.
    pub const INITIAL: Self = {
        let mut s = [0; 32];
        let mut i = 0;
        while i < 32 {
            s[i] = small_int_f32_bits(i as u32);
            i += 1;
        }
        Self {
            s,
            fpscr: FPSCR_INIT,
            reserved: 0,
        }
    };
}

impl Default for FpBlock {
    fn default() -> Self {
        Self::ZERO
    }
}

/// Get the IEEE 754 single-precision bit pattern of `n`. `n` must be small
/// enough to be representable exactly (`n < 2^24`).
const fn small_int_f32_bits(n: u32) -> u32 {
    if n == 0 {
        return 0;
    }
    let exp = 31 - n.leading_zeros();
    let mantissa = (n << (23 - exp)) & 0x7f_ffff;
    ((exp + 127) << 23) | mantissa
}

/// The shape of a saved context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameLayout {
    /// Exception frame and callee-saved registers.
    Integer,
    /// [`Self::Integer`] preceded by an [`FpBlock`].
    WithFp,
}

impl FrameLayout {
    /// Get the layout used by a task created with `options`.
    #[inline]
    pub const fn for_options(options: TaskOptions, fp_supported: bool) -> Self {
        if fp_supported && options.contains(TaskOptions::SAVE_FP) {
            Self::WithFp
        } else {
            Self::Integer
        }
    }

    /// Get the number of words pushed by [`build_stack_frame`] and popped by
    /// [`restore_frame`].
    #[inline]
    pub const fn word_count(self) -> usize {
        match self {
            Self::Integer => INTEGER_FRAME_WORDS,
            Self::WithFp => INTEGER_FRAME_WORDS + FP_BLOCK_WORDS,
        }
    }
}

/// The parameters of a new task's initial context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskInit {
    /// The entry point. Bit 0 (the Thumb bit of a function pointer) is
    /// discarded.
    pub entry: u32,
    /// The argument passed to the entry point in R0.
    pub param: u32,
    /// The address the task "returns" to if the entry point returns.
    pub return_hook: u32,
    pub options: TaskOptions,
}

/// Build the initial context of a task below `top` and return the resulting
/// stack pointer.
///
/// <center>
///
#[doc = svgbobdoc::transform!(
/// ```svgbob
///  high address
///   ,-----------,  <- top (rounded down to 8 bytes)
///   |   xPSR    |  -,
///   |    PC     |   |
///   |    LR     |   |
///   |    R12    |   | exception frame, restored by the
///   |    R3     |   | hardware on exception return
///   |    R2     |   |
///   |    R1     |   |
///   |    R0     |  -'
///   |    R11    |  -,
///   |    ...    |   | callee-saved registers, restored
///   |    R4     |  -' by the kernel
///   | reserved  |  -,
///   |   FPSCR   |   |
///   |    S31    |   | floating-point block
///   |    ...    |   | (`FrameLayout::WithFp` only)
///   |    S0     |  -'
///   '-----------'  <- returned stack pointer
///  low address
/// ```
)]
///
/// </center>
///
/// `top` is rounded down to an 8-byte boundary first. The returned pointer
/// is 8-byte aligned and exactly
/// `FrameLayout::for_options(init.options, cfg.fp_supported()).word_count()`
/// words below the rounded top.
///
/// # Safety
///
/// The memory region spanning that many words below the rounded top must be
/// valid for writes.
pub unsafe fn build_stack_frame(top: *mut u32, init: &TaskInit, cfg: &PortCfg) -> *mut u32 {
    let mut sp = ((top as usize) & !7) as *mut u32;

    let mut push = |x: u32| {
        sp = sp.wrapping_sub(1);
        // Safety: Within the region guaranteed by the caller
        unsafe { sp.write(x) };
    };

    // Exception frame. PC must have bit 0 cleared; a function pointer has it
    // set to mark a Thumb target.
    push(XPSR_THUMB);
    push(init.entry & !1);
    push(init.return_hook);
    push(0x1212_1212); // R12
    push(0x0303_0303); // R3
    push(0x0202_0202); // R2
    push(0x0101_0101); // R1
    push(init.param); // R0

    // R11..R4
    for &x in [
        0x1111_1111,
        0x1010_1010,
        0x0909_0909,
        0x0808_0808,
        0x0707_0707,
        0x0606_0606,
        0x0505_0505,
        0x0404_0404,
    ]
    .iter()
    {
        push(x);
    }

    if FrameLayout::for_options(init.options, cfg.fp_supported()) == FrameLayout::WithFp {
        let fp = FpBlock::INITIAL;
        push(fp.reserved);
        push(fp.fpscr);
        for &x in fp.s.iter().rev() {
            push(x);
        }
    }

    sp
}

/// A task's saved context, as read back by [`restore_frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskContext {
    pub callee: CalleeFrame,
    pub exc: ExceptionFrame,
    pub fp: Option<FpBlock>,
}

/// Pop a saved context of the given layout starting at `sp`, the way the
/// kernel's restore sequence does, and return it along with the stack
/// pointer after the restore.
///
/// # Safety
///
/// `layout.word_count()` words starting at `sp` must be valid for reads and
/// initialized.
pub unsafe fn restore_frame(sp: *const u32, layout: FrameLayout) -> (TaskContext, *const u32) {
    let mut sp = sp;

    // Safety: Within the region guaranteed by the caller. All three types are
    //         `repr(C)` aggregates of `u32`.
    unsafe {
        let fp = if layout == FrameLayout::WithFp {
            let fp = ptr::read_unaligned(sp as *const FpBlock);
            sp = sp.add(FP_BLOCK_WORDS);
            Some(fp)
        } else {
            None
        };

        let callee = ptr::read_unaligned(sp as *const CalleeFrame);
        sp = sp.add(CALLEE_FRAME_WORDS);

        let exc = ptr::read_unaligned(sp as *const ExceptionFrame);
        sp = sp.add(EXC_FRAME_WORDS);

        (TaskContext { callee, exc, fp }, sp)
    }
}

/// Push `block` below `sp` and return the new stack pointer.
///
/// # Safety
///
/// [`FP_BLOCK_WORDS`] words below `sp` must be valid for writes.
#[inline]
pub unsafe fn push_fp_block(sp: *mut u32, block: &FpBlock) -> *mut u32 {
    let sp = sp.wrapping_sub(FP_BLOCK_WORDS);
    // Safety: Upheld by the caller
    unsafe { ptr::write_unaligned(sp as *mut FpBlock, *block) };
    sp
}

/// Pop an [`FpBlock`] at `sp` and return it with the new stack pointer.
///
/// # Safety
///
/// [`FP_BLOCK_WORDS`] words starting at `sp` must be valid for reads and
/// initialized.
#[inline]
pub unsafe fn pop_fp_block(sp: *mut u32) -> (FpBlock, *mut u32) {
    // Safety: Upheld by the caller
    let block = unsafe { ptr::read_unaligned(sp as *const FpBlock) };
    (block, sp.wrapping_add(FP_BLOCK_WORDS))
}

/// A task's stack region.
pub struct StackRegion<'a> {
    words: &'a mut [MaybeUninit<u32>],
}

impl<'a> StackRegion<'a> {
    #[inline]
    pub fn new(words: &'a mut [MaybeUninit<u32>]) -> Self {
        Self { words }
    }

    /// Build the initial context at the top of the region. See
    /// [`build_stack_frame`].
    ///
    /// # Panics
    ///
    /// Panics if the region cannot hold the frame regardless of where the
    /// 8-byte rounding puts the top.
    pub fn build(&mut self, init: &TaskInit, cfg: &PortCfg) -> *mut u32 {
        let words = FrameLayout::for_options(init.options, cfg.fp_supported()).word_count();
        assert!(
            self.words.len() > words,
            "stack region too small for the initial frame ({} words needed)",
            words + 1
        );

        let top = self.words.as_mut_ptr_range().end as *mut u32;

        // Safety: Rounding down `top` discards at most one word, and we just
        //         checked there's room for `words` more below it
        unsafe { build_stack_frame(top, init, cfg) }
    }
}
