//! Agent socket bootstrap: connect, handshake, start the channel tasks.
//!
//! Two entry points mirror the two VM lifecycles. A fresh launch waits for
//! the agent's READY frame before anything else may use the channel; a
//! re-association connects to an agent that is already mid-conversation and
//! goes straight to probing. Both end the same way: the socket splits into a
//! read half for the reader task and a write half for the dispatcher, and
//! from then on the channel is live.

use crate::vm::command::{Command, Payload};
use crate::vm::dispatcher::Dispatcher;
use crate::vm::event::{PauseState, VmEvent, VmShared};
use crate::vm::reader;
use crate::{BootConfig, Error};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::UnixStream;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use vmplane_protocol::{code, read_frame, API_VERSION};

/// Everything a bootstrap path needs to bring the agent channel up: the
/// socket address, the boot flags that shape the handshake, and the channel
/// ends the reader and dispatcher will own.
pub(crate) struct InitEndpoint {
    pub(crate) socket: PathBuf,
    pub(crate) boot: BootConfig,
    pub(crate) shared: Arc<VmShared>,
    pub(crate) hub: UnboundedSender<VmEvent>,
    pub(crate) queue: UnboundedSender<Command>,
    pub(crate) rx: UnboundedReceiver<Command>,
}

impl InitEndpoint {
    /// Fresh-boot handshake: wait for the agent to announce readiness.
    pub(crate) async fn wait_init_ready(self) {
        let mut conn = match UnixStream::connect(&self.socket).await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(vm = %self.shared.id, error = %e, "cannot connect to init socket");
                let _ = self.hub.send(VmEvent::InitFailed {
                    reason: format!(
                        "cannot connect to init socket {}: {}",
                        self.socket.display(),
                        e
                    ),
                });
                return;
            }
        };

        if self.boot.boot_from_template {
            // A template boot restores a snapshotted guest that already sent
            // its READY long ago. It starts paused; the version probe waits
            // for resume.
            info!(vm = %self.shared.id, "boot from template, init starts paused");
            self.shared.set_pause_state(PauseState::Paused);
            let _ = self.hub.send(VmEvent::InitConnected);
            self.start(conn);
            return;
        }

        debug!(vm = %self.shared.id, "waiting for init ready message");
        match read_frame(&mut conn).await {
            Ok(frame) if frame.code == code::READY => {
                info!(vm = %self.shared.id, "init is ready");
                let _ = self.hub.send(VmEvent::InitConnected);
                let probe = !self.boot.boot_to_be_template;
                let queue = self.queue.clone();
                let shared = self.shared.clone();
                self.start(conn);
                if probe {
                    if let Err(e) = probe_api_version(queue, shared).await {
                        warn!(error = %e, "agent api version probe failed");
                    }
                }
            }
            Ok(frame) => {
                warn!(vm = %self.shared.id, code = frame.code, "unexpected init message during handshake");
                let _ = self.hub.send(VmEvent::InitFailed {
                    reason: format!("unexpected init message {}", frame.code),
                });
            }
            Err(e) => {
                warn!(vm = %self.shared.id, error = %e, "read init message failed");
                let _ = self.hub.send(VmEvent::InitFailed {
                    reason: format!("read init message failed: {}", e),
                });
            }
        }
    }

    /// Re-attach to an agent that is already running; there is no READY
    /// frame to wait for.
    pub(crate) async fn connect_to_init(self) {
        match UnixStream::connect(&self.socket).await {
            Ok(conn) => {
                let queue = self.queue.clone();
                let shared = self.shared.clone();
                self.start(conn);
                if let Err(e) = probe_api_version(queue, shared).await {
                    warn!(error = %e, "agent api version probe failed");
                }
            }
            Err(e) => {
                warn!(vm = %self.shared.id, error = %e, "cannot re-connect to init socket");
                let _ = self.hub.send(VmEvent::InitFailed {
                    reason: format!(
                        "cannot re-connect to init socket {}: {}",
                        self.socket.display(),
                        e
                    ),
                });
            }
        }
    }

    /// Split the socket and hand each half to its owning task. The reader
    /// keeps a strong sender so replies can re-enter the channel; the
    /// dispatcher holds only a weak one so the channel can still close.
    fn start(self, conn: UnixStream) {
        let (read_half, write_half) = conn.into_split();
        let dispatcher = Dispatcher::new(
            self.shared.clone(),
            self.hub.clone(),
            self.queue.downgrade(),
            self.rx,
            write_half,
        );
        tokio::spawn(reader::run(self.shared, read_half, self.queue, self.hub));
        tokio::spawn(dispatcher.run());
    }
}

/// Ask the agent for its API revision and record it on the shared state.
///
/// The first four bytes of the ack payload are the version, big-endian; a
/// shorter reply is a version error and leaves the version unlearned.
pub(crate) async fn probe_api_version(
    queue: UnboundedSender<Command>,
    shared: Arc<VmShared>,
) -> crate::Result<u32> {
    let (tx, rx) = oneshot::channel();
    queue
        .send(Command::new(code::VERSION, Payload::Empty).with_result(tx))
        .map_err(|_| Error::ChannelClosed("vm"))?;

    let ret = rx.await.map_err(|_| Error::Abandoned)??;
    if ret.len() < 4 {
        return Err(Error::Version(format!(
            "short version reply: {} bytes",
            ret.len()
        )));
    }

    let version = u32::from_be_bytes([ret[0], ret[1], ret[2], ret[3]]);
    if shared.set_api_version(version) {
        info!(vm = %shared.id, version, host_api = API_VERSION, "agent api version learned");
    } else {
        debug!(vm = %shared.id, version, "agent api version already known");
    }
    Ok(version)
}
