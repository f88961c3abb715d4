//! Hypervisor driver seam.
//!
//! The driver owns everything below the agent socket: booting the hypervisor
//! process, wiring PTY fan-out and console watching, tearing the machine
//! down. The core only needs the two lifecycle entry points; drivers report
//! progress by posting events onto the VM's hub through the handle they are
//! given.

use crate::vm::VmHandle;

/// A hypervisor backend capable of launching and re-attaching guest VMs.
///
/// Registered at startup and passed into each [`crate::VmContext`] by handle;
/// the core never consults process-global state.
pub trait Driver: Send + Sync {
    /// Short backend name for logs and persisted records.
    fn name(&self) -> &str;

    /// Boot a fresh VM. Lifecycle events (start, exit, console activity) are
    /// posted to the handle's hub as they happen.
    fn launch(&self, vm: &VmHandle) -> crate::Result<()>;

    /// Re-attach to a VM that is already running, typically after a daemon
    /// restart.
    fn associate(&self, vm: &VmHandle) -> crate::Result<()>;
}
