//! Error types for vmplane.
//!
//! Error messages follow one format: `"<operation> failed: <reason>"`, all
//! lowercase, carrying the identifiers a caller needs to act (socket path,
//! opcode, vm id). Per-command failures are delivered on the command's result
//! sink; transport and protocol failures escalate to the Hub as a single
//! coarse `Interrupted`/`InitFailed` event instead of an error return.

use thiserror::Error;
use vmplane_protocol::FrameError;

/// Result type alias using vmplane's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while supervising a guest init agent.
#[derive(Error, Debug)]
pub enum Error {
    /// A frame could not be encoded or decoded.
    #[error("init frame codec failed: {0}")]
    Frame(#[from] FrameError),

    /// A command payload could not be serialized for the wire.
    #[error("command {code} payload encode failed: {reason}")]
    Encode {
        /// Opcode of the failing command.
        code: u32,
        /// Serialization failure detail.
        reason: String,
    },

    /// The agent answered a command with an error frame.
    #[error("init replied with error: {0}")]
    Agent(String),

    /// The version probe got an unusable reply.
    #[error("agent version probe failed: {0}")]
    Version(String),

    /// A version-gated command was deferred past its retry budget.
    #[error("command {code} deferred too long: agent api version never learned")]
    VersionGate {
        /// Opcode of the starved command.
        code: u32,
    },

    /// A persisted VM record could not be decoded.
    #[error("vm record decode failed: {0}")]
    Record(#[source] serde_json::Error),

    /// A persisted VM record names a different VM than requested.
    #[error("vm id mismatch: record has {record}, expected {requested}")]
    VmMismatch {
        /// Id stored in the record.
        record: String,
        /// Id the caller asked to associate.
        requested: String,
    },

    /// A core channel was closed while an operation needed it.
    #[error("{0} channel closed")]
    ChannelClosed(&'static str),

    /// The dispatcher shut down before the command's reply arrived.
    #[error("vm shut down before the command completed")]
    Abandoned,

    /// Launch or associate was attempted on a context whose dispatcher
    /// already consumed the command channel.
    #[error("vm {id} already launched")]
    AlreadyLaunched {
        /// Id of the VM.
        id: String,
    },
}
