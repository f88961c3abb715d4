//! In-flight commands on the VM channel.
//!
//! A [`Command`] is one request to the guest agent. Commands submitted by
//! callers carry an outbound payload and an optional result sink; replies the
//! reader lifts off the socket re-enter the same channel as synthetic
//! commands whose `ret_msg` holds the reply payload.

use crate::vm::event::VmEvent;
use tokio::sync::oneshot;
use vmplane_protocol::code;

/// Outbound payload of a command.
#[derive(Debug, Clone, Default)]
pub enum Payload {
    /// Header-only frame.
    #[default]
    Empty,
    /// Pre-encoded bytes, sent verbatim.
    Raw(Vec<u8>),
    /// Structured value, JSON-encoded by the dispatcher. Encoding late keeps
    /// the version-compatibility rewrite on the dispatcher's single path.
    Json(serde_json::Value),
}

/// Where a command's completion is reported.
#[derive(Debug)]
pub(crate) enum ResultSink {
    /// Single-shot channel held by the submitting caller; receives the reply
    /// bytes on ack, the error on failure.
    Oneshot(oneshot::Sender<crate::Result<Vec<u8>>>),
    /// Default sink: completion is posted to the Hub as a
    /// [`VmEvent::CommandAck`] or [`VmEvent::CommandError`].
    Hub,
}

/// One request to the guest agent.
#[derive(Debug)]
pub struct Command {
    /// Opcode from [`vmplane_protocol::code`].
    pub code: u32,
    /// Outbound payload.
    pub message: Payload,
    /// High-level event this command originated from, echoed back in the
    /// completion for correlation.
    pub event: Option<VmEvent>,
    /// Reply bytes. Filled by the reader on synthetic reply commands and
    /// copied onto the queue head when the reply is matched.
    pub(crate) ret_msg: Vec<u8>,
    pub(crate) result: Option<ResultSink>,
    /// Times this command was deferred waiting for the agent API version.
    pub(crate) deferrals: u32,
}

impl Command {
    /// Create a command with the default Hub result sink.
    pub fn new(code: u32, message: Payload) -> Self {
        Self {
            code,
            message,
            event: None,
            ret_msg: Vec::new(),
            result: None,
            deferrals: 0,
        }
    }

    /// Attach the originating high-level event.
    pub fn with_event(mut self, event: VmEvent) -> Self {
        self.event = Some(event);
        self
    }

    /// Route this command's completion to a single-shot channel instead of
    /// the Hub.
    pub(crate) fn with_result(mut self, tx: oneshot::Sender<crate::Result<Vec<u8>>>) -> Self {
        self.result = Some(ResultSink::Oneshot(tx));
        self
    }

    /// Liveness probe. Pings are acknowledged by the agent but deliver no
    /// completion.
    pub(crate) fn ping() -> Self {
        Self::new(code::PING, Payload::Empty)
    }

    /// Synthetic reply injected by the reader: an ACK, ERROR, or NEXT frame
    /// lifted off the socket.
    pub(crate) fn reply(code: u32, ret_msg: Vec<u8>) -> Self {
        Self {
            code,
            message: Payload::Empty,
            event: None,
            ret_msg,
            result: None,
            deferrals: 0,
        }
    }

    /// Resolve the sink this command reports to, defaulting to the Hub.
    pub(crate) fn take_sink(&mut self) -> ResultSink {
        self.result.take().unwrap_or(ResultSink::Hub)
    }
}
