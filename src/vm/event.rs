//! Event and response types flowing through a VM context.
//!
//! Everything that happens to a VM — driver lifecycle, agent connection
//! state, command completions, guest notifications, external requests — is
//! expressed as a [`VmEvent`] pushed onto the Hub and handled by the single
//! event-loop task.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use vmplane_protocol::ProcessAsyncEvent;

/// Whether the guest vCPUs are currently paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PauseState {
    /// VM is executing normally.
    #[default]
    Unpaused,
    /// VM is paused; liveness failures are suppressed.
    Paused,
}

/// State shared between the event loop, the dispatcher, and the bootstrap
/// task. Everything here is a single atomic load on the read side, so a
/// slightly stale value is tolerated by all readers.
#[derive(Debug)]
pub struct VmShared {
    /// Stable VM identifier.
    pub id: String,
    paused: AtomicBool,
    api_version: AtomicU32,
}

impl VmShared {
    pub(crate) fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            paused: AtomicBool::new(false),
            api_version: AtomicU32::new(0),
        }
    }

    /// Current pause state.
    pub fn pause_state(&self) -> PauseState {
        if self.paused.load(Ordering::SeqCst) {
            PauseState::Paused
        } else {
            PauseState::Unpaused
        }
    }

    pub(crate) fn set_pause_state(&self, state: PauseState) {
        self.paused
            .store(state == PauseState::Paused, Ordering::SeqCst);
    }

    /// Agent API version, 0 until learned from the version probe.
    pub fn api_version(&self) -> u32 {
        self.api_version.load(Ordering::SeqCst)
    }

    /// Record the probed version. The transition 0 → N happens exactly once;
    /// later probes of a reconnected agent must agree and are ignored.
    pub(crate) fn set_api_version(&self, version: u32) -> bool {
        self.api_version
            .compare_exchange(0, version, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// Completed command data carried by ack/error events.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    /// Opcode of the completed command.
    pub code: u32,
    /// High-level event the command originated from, for correlation.
    pub event: Option<Box<VmEvent>>,
    /// Bytes the agent returned with the ack or error frame.
    pub msg: Vec<u8>,
}

/// Console or terminal activity reported by the PTY subsystem.
#[derive(Debug, Clone)]
pub struct PtyEvent {
    /// Guest stream identifier.
    pub session: u64,
    /// Raw bytes read from the stream.
    pub data: Vec<u8>,
}

/// One event on a VM's hub.
#[derive(Debug, Clone)]
pub enum VmEvent {
    /// The agent socket is connected and the command channel is live.
    InitConnected,
    /// The init handshake failed; the VM never became reachable.
    InitFailed {
        /// Failure description.
        reason: String,
    },
    /// The agent connection broke after it had been established.
    Interrupted {
        /// Failure description.
        reason: String,
    },
    /// A command without an explicit result sink was acknowledged.
    CommandAck {
        /// Completed command data.
        reply: CommandOutcome,
    },
    /// A command without an explicit result sink failed.
    CommandError {
        /// Completed command data.
        reply: CommandOutcome,
    },
    /// Unsolicited process lifecycle notification from the agent.
    ProcessAsync(ProcessAsyncEvent),
    /// Console or terminal activity from the PTY subsystem.
    Pty(PtyEvent),
    /// The driver reports the hypervisor process is up.
    VmStart,
    /// The driver reports the hypervisor process is gone.
    VmExit,
    /// An external caller reports a container has started.
    ContainerStart {
        /// Container id.
        container: String,
    },
    /// Pause the guest vCPUs.
    Pause,
    /// Resume a paused guest.
    Resume,
}

impl VmEvent {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            VmEvent::InitConnected => "init-connected",
            VmEvent::InitFailed { .. } => "init-failed",
            VmEvent::Interrupted { .. } => "interrupted",
            VmEvent::CommandAck { .. } => "command-ack",
            VmEvent::CommandError { .. } => "command-error",
            VmEvent::ProcessAsync(_) => "process-async",
            VmEvent::Pty(_) => "pty",
            VmEvent::VmStart => "vm-start",
            VmEvent::VmExit => "vm-exit",
            VmEvent::ContainerStart { .. } => "container-start",
            VmEvent::Pause => "pause",
            VmEvent::Resume => "resume",
        }
    }
}

/// High-level response delivered to the external owner of a VM.
#[derive(Debug, Clone)]
pub struct VmResponse {
    /// VM the response concerns.
    pub vm_id: String,
    /// Whether the underlying operation succeeded.
    pub success: bool,
    /// Failure description, empty on success.
    pub cause: String,
    /// Structured detail, if the operation produced any.
    pub data: Option<serde_json::Value>,
}

impl VmResponse {
    pub(crate) fn ok(vm_id: &str, data: Option<serde_json::Value>) -> Self {
        Self {
            vm_id: vm_id.to_string(),
            success: true,
            cause: String::new(),
            data,
        }
    }

    pub(crate) fn failed(vm_id: &str, cause: impl Into<String>) -> Self {
        Self {
            vm_id: vm_id.to_string(),
            success: false,
            cause: cause.into(),
            data: None,
        }
    }
}
