#![doc = include_str!("./lib.md")]
#![deny(unsafe_op_in_unsafe_fn)]
use kport::{HookDispatch, InitError, NoAppHooks, PortCfg, Subsystem, TlsRuntime};

mod fpu;
mod kernel;
mod regs;
mod runtime;

pub use self::{fpu::*, kernel::*, regs::*, runtime::*};

/// Used by the test harnesses of dependent crates
#[doc(hidden)]
pub extern crate env_logger;

/// The hook dispatcher type used by [`boot`].
pub type StdPort<R> = HookDispatch<&'static SimKernel, R, NoAppHooks, SimFpu>;

/// Create a [`SimKernel`] and a [`StdPort`] attached to it, both leaked to
/// obtain `'static` lifetimes. Each call creates an independent system.
///
/// The kernel is not started yet; call [`SimKernel::start`] after creating
/// the initial tasks.
pub fn boot<R>(cfg: PortCfg, runtime: R) -> Result<(&'static SimKernel, &'static StdPort<R>), InitError>
where
    R: TlsRuntime + Send + Sync + 'static,
{
    let kernel: &'static SimKernel = Box::leak(Box::new(SimKernel::new(cfg)));
    let subsystem = Subsystem::new(kernel, runtime, cfg)?;
    let port: &'static StdPort<R> =
        Box::leak(Box::new(HookDispatch::new(subsystem).with_fpu(SimFpu::new())));
    kernel.install_hooks(port);
    Ok((kernel, port))
}
