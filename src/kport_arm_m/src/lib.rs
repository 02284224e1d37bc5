#![doc = include_str!("./lib.md")]
#![cfg_attr(not(test), no_std)] // Link `std` only when building a test (`cfg(test)`)
#![deny(unsafe_op_in_unsafe_fn)]

mod cfg;
mod regs;

/// `PRIMASK`-based critical section.
#[cfg(target_os = "none")]
pub mod critical;

/// The [`kport::FpuControl`] implementation.
#[cfg(all(target_os = "none", target_arch = "arm", target_abi = "eabihf"))]
mod fpu;

pub use self::{cfg::*, regs::*};

#[cfg(all(target_os = "none", target_arch = "arm", target_abi = "eabihf"))]
pub use self::fpu::CortexMFpu;
