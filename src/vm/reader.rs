//! Inbound frame pump for the agent socket.
//!
//! One loop: decode a frame, classify it, forward it, repeat. Replies and
//! flow-control frames re-enter the dispatcher as synthetic commands so that
//! matching happens on the dispatcher's single serialized path; process
//! notifications go to the Hub. The reader never writes to the socket and
//! never touches timers.

use crate::vm::command::Command;
use crate::vm::event::{VmEvent, VmShared};
use std::sync::Arc;
use tokio::net::unix::OwnedReadHalf;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};
use vmplane_protocol::{code, read_frame, ProcessAsyncEvent};

pub(crate) async fn run(
    shared: Arc<VmShared>,
    mut sock: OwnedReadHalf,
    queue: UnboundedSender<Command>,
    hub: UnboundedSender<VmEvent>,
) {
    loop {
        let frame = match read_frame(&mut sock).await {
            Ok(frame) => frame,
            Err(e) => {
                let _ = hub.send(VmEvent::Interrupted {
                    reason: format!("init socket failed: {}", e),
                });
                return;
            }
        };

        debug!(
            vm = %shared.id,
            code = frame.code,
            len = frame.payload.len(),
            "frame from init"
        );

        match frame.code {
            code::ACK | code::NEXT | code::ERROR => {
                if queue.send(Command::reply(frame.code, frame.payload)).is_err() {
                    debug!(vm = %shared.id, "vm channel closed, reader quitting");
                    return;
                }
            }
            code::PROCESS_ASYNC_EVENT => {
                match serde_json::from_slice::<ProcessAsyncEvent>(&frame.payload) {
                    Ok(event) => {
                        let _ = hub.send(VmEvent::ProcessAsync(event));
                    }
                    Err(e) => {
                        warn!(vm = %shared.id, error = %e, "dropping malformed process event from init");
                    }
                }
            }
            other => {
                debug!(vm = %shared.id, code = other, "dropping unexpected frame from init");
            }
        }
    }
}
