//! vmplane - hypervisor-side control plane for guest init agents
//!
//! vmplane supervises the tiny "init" agent running inside a lightweight
//! virtual machine: it owns the host side of the agent socket, multiplexes
//! every event source a VM has into one serialized handler, and tracks each
//! host→guest command until the agent answers.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │  caller (daemon / scheduler)                     │
//! ├──────────────────────────────────────────────────┤
//! │  VmContext: Hub + event loop + state handlers    │
//! ├──────────────────────────────────────────────────┤
//! │  dispatcher / reader over the agent socket       │
//! ├──────────────────────────────────────────────────┤
//! │  hypervisor driver (qemu / kvm, injected)        │
//! └──────────────────────────────────────────────────┘
//! ```
//!
//! Two invariants shape everything here: exactly one task consumes a VM's
//! Hub, and exactly one task (the dispatcher) consumes its command channel
//! and writes to the agent socket. Replies are matched to pending commands
//! strictly FIFO; writes are metered through the guest's 512-byte window.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use vmplane::{BootConfig, VmContext};
//!
//! # fn driver() -> Arc<dyn vmplane::Driver> { unimplemented!() }
//! # async fn example() -> vmplane::Result<()> {
//! let (client_tx, mut client_rx) = tokio::sync::mpsc::unbounded_channel();
//! let ctx = VmContext::new(
//!     "vm-7f3a",
//!     BootConfig::default(),
//!     "/run/vmplane/vm-7f3a/agent.sock",
//!     client_tx,
//!     driver(),
//! );
//!
//! // Handle for issuing commands once the VM is up.
//! let vm = ctx.handle();
//!
//! tokio::spawn(ctx.launch());
//! vm.ping()?;
//! while let Some(response) = client_rx.recv().await {
//!     println!("{}: success={}", response.vm_id, response.success);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod driver;
pub mod error;
pub mod record;
pub mod vm;

// Re-export main types for convenience
pub use driver::Driver;
pub use error::{Error, Result};
pub use record::{BootConfig, VmRecord};
pub use vm::command::{Command, Payload};
pub use vm::event::{CommandOutcome, PauseState, PtyEvent, VmEvent, VmResponse};
pub use vm::state::VmState;
pub use vm::{VmContext, VmHandle};

/// Wire protocol shared with the guest init agent.
pub use vmplane_protocol as protocol;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
