#![doc = include_str!("./lib.md")]
#![cfg_attr(not(test), no_std)] // Link `std` only when building a test (`cfg(test)`)
#![deny(unsafe_op_in_unsafe_fn)]
extern crate alloc;

mod cfg;
mod error;
mod kernel;
mod klock;
mod subsystem;

pub mod frame;
pub mod hooks;
pub mod lock_pool;
pub mod tick;
pub mod tls;

#[cfg(test)]
mod test_utils;

pub use self::{
    cfg::*,
    error::*,
    hooks::{AppHooks, FpuControl, HookDispatch, NoAppHooks, NoFpu, PortHooks},
    kernel::*,
    lock_pool::LockHandle,
    subsystem::Subsystem,
    tls::{TlsId, TlsRuntime, TlsTable, TlsValue},
};
