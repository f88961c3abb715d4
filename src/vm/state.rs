//! Coarse lifecycle states and their event handlers.
//!
//! The event loop owns a current handler function; a handler reacts to one
//! event and may transition by calling [`VmContext::become_state`]. Handlers
//! run on the loop task only, so they take the context by mutable reference
//! without locking.

use crate::vm::event::{PauseState, VmEvent};
use crate::vm::VmContext;
use tracing::{debug, info, warn};

/// Handler invoked for each event while the VM is in a given state.
pub type StateHandler = fn(&mut VmContext, VmEvent);

/// Coarse VM lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    /// Booting; the agent channel is not established yet.
    Init,
    /// Agent channel live, commands flowing.
    Running,
    /// vCPUs paused; liveness failures suppressed.
    Paused,
    /// Tearing down; waiting for the hypervisor process to exit.
    Shutdown,
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmState::Init => write!(f, "init"),
            VmState::Running => write!(f, "running"),
            VmState::Paused => write!(f, "paused"),
            VmState::Shutdown => write!(f, "shutdown"),
        }
    }
}

pub(crate) fn state_init(ctx: &mut VmContext, event: VmEvent) {
    match event {
        VmEvent::InitConnected => {
            info!(vm = %ctx.id(), "init connected");
            ctx.become_state(state_running, VmState::Running);
        }
        VmEvent::VmStart => {
            debug!(vm = %ctx.id(), "hypervisor process started");
        }
        VmEvent::InitFailed { reason } | VmEvent::Interrupted { reason } => {
            warn!(vm = %ctx.id(), %reason, "boot failed");
            ctx.report_failure(&reason);
            ctx.become_state(state_shutdown, VmState::Shutdown);
        }
        VmEvent::VmExit => {
            warn!(vm = %ctx.id(), "hypervisor exited during boot");
            ctx.report_failure("vm exited during boot");
            ctx.finish();
        }
        other => {
            debug!(vm = %ctx.id(), event = other.kind(), "ignored in init state");
        }
    }
}

pub(crate) fn state_running(ctx: &mut VmContext, event: VmEvent) {
    match event {
        VmEvent::CommandAck { reply } => ctx.report_command_ack(reply),
        VmEvent::CommandError { reply } => ctx.report_command_error(reply),
        VmEvent::ProcessAsync(record) => ctx.handle_process_async_event(record),
        VmEvent::Pause => {
            info!(vm = %ctx.id(), "pausing");
            ctx.set_pause_state(PauseState::Paused);
            ctx.become_state(state_paused, VmState::Paused);
        }
        VmEvent::InitFailed { reason } | VmEvent::Interrupted { reason } => {
            warn!(vm = %ctx.id(), %reason, "agent channel lost");
            ctx.report_failure(&reason);
            ctx.become_state(state_shutdown, VmState::Shutdown);
        }
        VmEvent::VmExit => {
            info!(vm = %ctx.id(), "hypervisor exited");
            ctx.finish();
        }
        VmEvent::ContainerStart { container } => {
            debug!(vm = %ctx.id(), %container, "container started");
        }
        VmEvent::Pty(pty) => {
            // Fan-out to container stdio belongs to the PTY collaborator.
            debug!(vm = %ctx.id(), session = pty.session, len = pty.data.len(), "pty activity");
        }
        other => {
            debug!(vm = %ctx.id(), event = other.kind(), "ignored in running state");
        }
    }
}

pub(crate) fn state_paused(ctx: &mut VmContext, event: VmEvent) {
    match event {
        VmEvent::Resume => {
            info!(vm = %ctx.id(), "resuming");
            ctx.set_pause_state(PauseState::Unpaused);
            ctx.become_state(state_running, VmState::Running);
            // A template boot deferred its version probe until now.
            if ctx.api_version() == 0 {
                ctx.spawn_version_probe();
            }
        }
        VmEvent::CommandAck { reply } => ctx.report_command_ack(reply),
        VmEvent::CommandError { reply } => ctx.report_command_error(reply),
        VmEvent::ProcessAsync(record) => ctx.handle_process_async_event(record),
        VmEvent::VmExit => {
            info!(vm = %ctx.id(), "hypervisor exited while paused");
            ctx.finish();
        }
        other => {
            debug!(vm = %ctx.id(), event = other.kind(), "ignored in paused state");
        }
    }
}

pub(crate) fn state_shutdown(ctx: &mut VmContext, event: VmEvent) {
    match event {
        VmEvent::VmExit => {
            info!(vm = %ctx.id(), "hypervisor exited, shutdown complete");
            ctx.finish();
        }
        VmEvent::CommandAck { reply } => ctx.report_command_ack(reply),
        other => {
            debug!(vm = %ctx.id(), event = other.kind(), "dropped during shutdown");
        }
    }
}
