//! Protocol types for vmplane host-guest communication.
//!
//! This crate defines the wire protocol spoken between the vmplane host and
//! the init agent running inside the guest VM.
//!
//! # Protocol Overview
//!
//! Each message on the agent socket is a frame with an 8-byte header followed
//! by an opcode-specific payload (JSON for structured commands, raw bytes for
//! control codes). The length field covers the whole frame, header included.
//!
//! ```text
//! +----------------+----------------+----------------------+
//! | code (4 BE)    | length (4 BE)  | payload (length - 8) |
//! +----------------+----------------+----------------------+
//! ```
//!
//! The guest consumes host writes through a 512-byte ring buffer and reports
//! progress with cumulative `NEXT` frames; the host must never put more than
//! [`WRITE_WINDOW`] bytes on the wire per write call.

#![deny(missing_docs)]

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Agent API revision implemented by this crate.
pub const API_VERSION: u32 = 4242;

/// Agents at or below this API revision reject a `process.id` field on exec
/// and new-container payloads; the host strips the field before sending.
pub const LAST_VERSION_WITHOUT_PROCESS_ID: u32 = API_VERSION;

/// Size of the guest's receive ring buffer. Writes larger than this are
/// rejected or truncated by the transport, so the host caps every write at
/// this many bytes and waits for `NEXT` acknowledgements before continuing.
pub const WRITE_WINDOW: usize = 512;

/// Maximum total frame size (16 MiB). Encoding refuses anything larger;
/// decoding treats a larger length header as a protocol violation.
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Bytes of frame header: 4 for the opcode, 4 for the total length.
pub const HEADER_LEN: usize = 8;

/// Opcodes shared with the guest init agent.
///
/// These are stable u32 constants; the guest dispatches on the raw value, so
/// they must never be renumbered.
pub mod code {
    /// Ask the agent for its API revision.
    pub const VERSION: u32 = 0;
    /// Start the pod described by the payload.
    pub const START_POD: u32 = 1;
    /// Fetch the running pod description.
    pub const GET_POD: u32 = 2;
    // 3 was a deprecated stop-pod code and is never reissued.
    /// Tear the pod down; the reply to this command is terminal.
    pub const DESTROY_POD: u32 = 4;
    /// Restart a container inside the pod.
    pub const RESTART_CONTAINER: u32 = 5;
    /// Execute a process inside a running container.
    pub const EXEC_CMD: u32 = 6;
    /// Guest-side notification that a command's process finished.
    pub const FINISH_CMD: u32 = 7;
    /// First frame the agent sends after boot.
    pub const READY: u32 = 8;
    /// Successful reply to the oldest pending command.
    pub const ACK: u32 = 9;
    /// Failure reply to the oldest pending command; payload is the error text.
    pub const ERROR: u32 = 10;
    /// Resize a terminal attached to a process.
    pub const WINSIZE: u32 = 11;
    /// Liveness probe; acknowledged but carries no completion semantics.
    pub const PING: u32 = 12;
    /// Guest-side notification that the pod finished.
    pub const FINISH_POD: u32 = 13;
    /// Flow control: payload is a BE u32 count of bytes the guest consumed.
    pub const NEXT: u32 = 14;
    /// Write a file inside the guest.
    pub const WRITE_FILE: u32 = 15;
    /// Read a file from the guest.
    pub const READ_FILE: u32 = 16;
    /// Add a container to the running pod.
    pub const NEW_CONTAINER: u32 = 17;
    /// Signal a container's init process.
    pub const KILL_CONTAINER: u32 = 18;
    /// Online hotplugged cpu/memory.
    pub const ONLINE_CPU_MEM: u32 = 19;
    /// Configure a guest network interface.
    pub const SETUP_INTERFACE: u32 = 20;
    /// Install a guest route.
    pub const SETUP_ROUTE: u32 = 21;
    /// Remove a container from the pod.
    pub const REMOVE_CONTAINER: u32 = 22;
    /// Unsolicited process lifecycle notification; payload is JSON.
    pub const PROCESS_ASYNC_EVENT: u32 = 23;
}

// ============================================================================
// Frame codec
// ============================================================================

/// One decoded message from the agent socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Opcode from the [`code`] table.
    pub code: u32,
    /// Payload bytes, empty for header-only frames.
    pub payload: Vec<u8>,
}

/// Encode a frame to wire format.
///
/// Fails with [`FrameError::TooLarge`] instead of putting a frame on the wire
/// that the guest would have to reject.
pub fn encode_frame(code: u32, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    let total = HEADER_LEN + payload.len();
    if total > MAX_FRAME_SIZE as usize {
        return Err(FrameError::TooLarge(total));
    }

    let mut buf = Vec::with_capacity(total);
    buf.extend_from_slice(&code.to_be_bytes());
    buf.extend_from_slice(&(total as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Read one complete frame from `reader`.
///
/// Short reads are looped through a [`WRITE_WINDOW`]-sized scratch buffer
/// until the header and then the full payload have arrived. A partial frame is
/// never discarded silently: EOF mid-frame is [`FrameError::Truncated`], and a
/// length field below [`HEADER_LEN`] is [`FrameError::BadLength`].
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut scratch = [0u8; WRITE_WINDOW];
    let mut frame: Vec<u8> = Vec::with_capacity(HEADER_LEN);
    let mut need = HEADER_LEN;

    while frame.len() < need {
        let want = (need - frame.len()).min(scratch.len());
        let n = reader.read(&mut scratch[..want]).await?;
        if n == 0 {
            return Err(FrameError::Truncated {
                expected: need,
                got: frame.len(),
            });
        }
        frame.extend_from_slice(&scratch[..n]);

        if need == HEADER_LEN && frame.len() >= HEADER_LEN {
            let total = u32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]) as usize;
            if total < HEADER_LEN {
                return Err(FrameError::BadLength(total));
            }
            if total > MAX_FRAME_SIZE as usize {
                return Err(FrameError::TooLarge(total));
            }
            need = total;
        }
    }

    let code = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
    Ok(Frame {
        code,
        payload: frame.split_off(HEADER_LEN),
    })
}

/// Error encoding or decoding a wire frame.
#[derive(Debug)]
pub enum FrameError {
    /// Header declared a total length smaller than the header itself.
    BadLength(usize),
    /// Frame size exceeds [`MAX_FRAME_SIZE`].
    TooLarge(usize),
    /// The stream ended before the frame completed.
    Truncated {
        /// Bytes the frame needed.
        expected: usize,
        /// Bytes actually received.
        got: usize,
    },
    /// Reading from the underlying socket failed.
    Io(std::io::Error),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::BadLength(len) => {
                write!(f, "frame length {} is below the {}-byte header", len, HEADER_LEN)
            }
            FrameError::TooLarge(len) => {
                write!(f, "frame too large: {} bytes (max {})", len, MAX_FRAME_SIZE)
            }
            FrameError::Truncated { expected, got } => {
                write!(f, "truncated frame: expected {} bytes, got {}", expected, got)
            }
            FrameError::Io(e) => write!(f, "socket read failed: {}", e),
        }
    }
}

impl std::error::Error for FrameError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FrameError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for FrameError {
    fn from(e: std::io::Error) -> Self {
        FrameError::Io(e)
    }
}

// ============================================================================
// Payload types
// ============================================================================

/// One environment variable for a guest process.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvVar {
    /// Variable name.
    pub env: String,
    /// Variable value.
    pub value: String,
}

/// A process to run inside a guest container.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Process {
    /// Host-assigned process identifier. Agents at or below
    /// [`LAST_VERSION_WITHOUT_PROCESS_ID`] reject this field.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    /// Whether to allocate a terminal.
    #[serde(default)]
    pub terminal: bool,
    /// Command and arguments.
    pub args: Vec<String>,
    /// Environment variables.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub envs: Vec<EnvVar>,
    /// Working directory inside the container.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub workdir: String,
}

/// Payload of an [`code::EXEC_CMD`] frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecCommand {
    /// Target container id.
    pub container: String,
    /// Process to execute.
    pub process: Process,
}

/// Payload of a [`code::PROCESS_ASYNC_EVENT`] frame: an unsolicited process
/// lifecycle notification from the agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessAsyncEvent {
    /// Container the process belongs to.
    pub container: String,
    /// Process identifier inside the container.
    pub process: String,
    /// Event kind reported by the agent (e.g. "finished").
    pub event: String,
    /// Exit status or event-specific detail.
    pub status: i32,
}
