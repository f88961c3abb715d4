//! The serialized host→guest command state machine.
//!
//! The dispatcher is the single consumer of the VM channel and the only task
//! that writes to the agent socket. It frames outbound commands, matches
//! ACK/ERROR replies to the pending queue in FIFO order, meters writes
//! through the guest's 512-byte window using cumulative NEXT counts, and
//! keeps the liveness probe running: a PING is enqueued 30 seconds after the
//! last reply, and a reply deadline trips `Interrupted` when the guest stops
//! answering.
//!
//! Timer state lives only in this task. The ping fire re-enters through a
//! weak sender to the dispatcher's own channel, so a closed channel makes the
//! probe a no-op instead of a fault; the reply deadline posts straight to the
//! Hub.

use crate::error::Error;
use crate::vm::command::{Command, Payload, ResultSink};
use crate::vm::event::{CommandOutcome, PauseState, VmEvent, VmShared};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, WeakUnboundedSender};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use vmplane_protocol::{code, encode_frame, LAST_VERSION_WITHOUT_PROCESS_ID, WRITE_WINDOW};

/// Idle time after the last reply before a PING is enqueued.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Time the guest has to reply once outbound data is pending before the VM
/// is declared interrupted.
const REPLY_DEADLINE: Duration = Duration::from_secs(30);

/// Delay before re-enqueueing a command that is waiting for the agent API
/// version to be learned.
const VERSION_GATE_RETRY_DELAY: Duration = Duration::from_millis(2);

/// Deferral budget for version-gated commands. At 2 ms per round this gives
/// the version probe roughly ten seconds before the command is failed
/// instead of starved forever.
const VERSION_GATE_MAX_RETRIES: u32 = 5000;

/// Reply-deadline timer. `Fired` keeps the deadline from re-arming until the
/// next reply clears it, so one stall produces one `Interrupted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplyDeadline {
    Idle,
    Armed(Instant),
    Fired,
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Exit,
}

pub(crate) struct Dispatcher {
    shared: Arc<VmShared>,
    hub: UnboundedSender<VmEvent>,
    /// Weak handle to the dispatcher's own channel for ping and version-gate
    /// re-enqueues. Weak so the channel still closes when every real
    /// producer is gone.
    queue: WeakUnboundedSender<Command>,
    rx: UnboundedReceiver<Command>,
    sock: OwnedWriteHalf,

    /// Pending commands awaiting replies, FIFO.
    cmds: VecDeque<Command>,
    /// Framed bytes not yet retired by the flow-control window.
    data: Vec<u8>,
    /// Bytes of `data` currently in flight (written, not yet acknowledged).
    index: usize,
    /// Bytes acknowledged by cumulative NEXTs within the current window.
    got: usize,
    /// New outbound data was appended and no reply has arrived since.
    awaiting_ack: bool,

    ping_at: Option<Instant>,
    pong: ReplyDeadline,
}

impl Dispatcher {
    pub(crate) fn new(
        shared: Arc<VmShared>,
        hub: UnboundedSender<VmEvent>,
        queue: WeakUnboundedSender<Command>,
        rx: UnboundedReceiver<Command>,
        sock: OwnedWriteHalf,
    ) -> Self {
        Self {
            shared,
            hub,
            queue,
            rx,
            sock,
            cmds: VecDeque::new(),
            data: Vec::new(),
            index: 0,
            got: 0,
            awaiting_ack: false,
            ping_at: None,
            pong: ReplyDeadline::Idle,
        }
    }

    pub(crate) async fn run(mut self) {
        debug!(vm = %self.shared.id, "dispatcher started");
        loop {
            let ping_at = self.ping_at;
            let pong_at = self.pong_at();
            let flow = tokio::select! {
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        debug!(vm = %self.shared.id, "vm channel closed, dispatcher quitting");
                        Flow::Exit
                    }
                },
                _ = Self::deadline(ping_at), if ping_at.is_some() => self.fire_ping(),
                _ = Self::deadline(pong_at), if pong_at.is_some() => self.fire_pong(),
            };
            if flow == Flow::Exit {
                break;
            }
        }
        // Deadlines die with the task; commands left in the queue are
        // abandoned and their result sinks dropped.
        debug!(vm = %self.shared.id, pending = self.cmds.len(), "dispatcher finished");
    }

    async fn deadline(at: Option<Instant>) {
        match at {
            Some(at) => tokio::time::sleep_until(at).await,
            // Only polled when the guard says the timer is armed.
            None => std::future::pending().await,
        }
    }

    fn pong_at(&self) -> Option<Instant> {
        match self.pong {
            ReplyDeadline::Armed(at) => Some(at),
            _ => None,
        }
    }

    async fn handle_command(&mut self, cmd: Command) -> Flow {
        // Reply rounds never arm the deadline: an ack just cleared it, and
        // only new traffic (outbound data or a window update) may restart
        // the liveness countdown.
        let (flow, may_arm) = match cmd.code {
            code::ACK | code::ERROR => (self.handle_reply(cmd), false),
            code::NEXT => (self.handle_next(cmd), true),
            _ => (self.handle_outbound(cmd), true),
        };
        if flow == Flow::Exit {
            return Flow::Exit;
        }
        if self.flush().await == Flow::Exit {
            return Flow::Exit;
        }
        if may_arm {
            self.arm_reply_deadline();
        }
        Flow::Continue
    }

    /// Match an ACK or ERROR reply to the oldest pending command.
    fn handle_reply(&mut self, reply: Command) -> Flow {
        let Some(mut head) = self.cmds.pop_front() else {
            warn!(vm = %self.shared.id, code = reply.code, "reply without a pending command, dropping");
            return Flow::Continue;
        };

        // The destroy-pod reply is the last frame the agent will ever send.
        let terminal = head.code == code::DESTROY_POD;
        head.ret_msg = reply.ret_msg;

        if reply.code == code::ACK {
            // Pings are acknowledged but carry no completion semantics.
            if head.code != code::PING {
                self.deliver(head, None);
            }
        } else {
            let cause = String::from_utf8_lossy(&head.ret_msg).into_owned();
            self.deliver(head, Some(Error::Agent(cause)));
        }

        // The reply we were waiting on arrived; go back to idle probing.
        self.pong = ReplyDeadline::Idle;
        self.ping_at = Some(Instant::now() + PING_INTERVAL);

        if terminal {
            info!(vm = %self.shared.id, "destroy-pod acknowledged, last round of commands to init");
            return Flow::Exit;
        }
        Flow::Continue
    }

    /// Apply a cumulative flow-control acknowledgement.
    fn handle_next(&mut self, reply: Command) -> Flow {
        if reply.ret_msg.len() < 4 {
            return self.protocol_violation(format!(
                "flow-control frame carried {} bytes, expected 4",
                reply.ret_msg.len()
            ));
        }
        let consumed = u32::from_be_bytes([
            reply.ret_msg[0],
            reply.ret_msg[1],
            reply.ret_msg[2],
            reply.ret_msg[3],
        ]) as usize;

        self.got += consumed;
        debug!(
            vm = %self.shared.id,
            sent = self.index,
            acked = self.got,
            "flow-control window update"
        );
        self.awaiting_ack = false;

        if self.got > self.index {
            return self.protocol_violation(format!(
                "init acknowledged {} bytes with only {} in flight",
                self.got, self.index
            ));
        }
        if self.got == self.index {
            // Whole in-flight chunk absorbed; retire the window.
            self.data.drain(..self.index);
            self.index = 0;
            self.got = 0;
        }
        Flow::Continue
    }

    /// Encode, version-gate, and queue an outbound command.
    fn handle_outbound(&mut self, mut cmd: Command) -> Flow {
        let version = self.shared.api_version();

        if version == 0 && version_sensitive(cmd.code) {
            return self.defer_for_version(cmd);
        }

        let payload = match std::mem::take(&mut cmd.message) {
            Payload::Empty => Vec::new(),
            Payload::Raw(bytes) => bytes,
            Payload::Json(value) => match serde_json::to_vec(&value) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(vm = %self.shared.id, code = cmd.code, error = %e, "payload encode failed");
                    let err = Error::Encode {
                        code: cmd.code,
                        reason: e.to_string(),
                    };
                    self.deliver(cmd, Some(err));
                    return Flow::Continue;
                }
            },
        };

        // Older agents reject the process.id field on exec and new-container
        // payloads; rewrite the JSON before it hits the wire.
        let payload = if version <= LAST_VERSION_WITHOUT_PROCESS_ID && version_sensitive(cmd.code) {
            match strip_process_id(&payload) {
                Ok(rewritten) => rewritten,
                Err(e) => {
                    let err = Error::Encode {
                        code: cmd.code,
                        reason: format!("legacy payload rewrite failed: {}", e),
                    };
                    self.deliver(cmd, Some(err));
                    return Flow::Continue;
                }
            }
        } else {
            payload
        };

        let frame = match encode_frame(cmd.code, &payload) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(vm = %self.shared.id, code = cmd.code, error = %e, "refusing oversized frame");
                self.deliver(cmd, Some(Error::Frame(e)));
                return Flow::Continue;
            }
        };

        debug!(
            vm = %self.shared.id,
            code = cmd.code,
            len = frame.len(),
            "queueing command for init"
        );
        self.data.extend_from_slice(&frame);
        self.cmds.push_back(cmd);
        self.awaiting_ack = true;
        Flow::Continue
    }

    /// Re-enqueue a version-sensitive command until the probe completes, or
    /// fail it once the deferral budget is spent.
    fn defer_for_version(&mut self, mut cmd: Command) -> Flow {
        cmd.deferrals += 1;
        if cmd.deferrals > VERSION_GATE_MAX_RETRIES {
            warn!(
                vm = %self.shared.id,
                code = cmd.code,
                "agent api version still unknown, giving up on deferred command"
            );
            let code = cmd.code;
            self.deliver(cmd, Some(Error::VersionGate { code }));
            return Flow::Continue;
        }

        debug!(
            vm = %self.shared.id,
            code = cmd.code,
            attempt = cmd.deferrals,
            "agent api version unknown, deferring command"
        );
        let queue = self.queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(VERSION_GATE_RETRY_DELAY).await;
            if let Some(queue) = queue.upgrade() {
                let _ = queue.send(cmd);
            }
        });
        Flow::Continue
    }

    /// Writer sub-step: with nothing in flight and bytes pending, put one
    /// window's worth on the wire.
    async fn flush(&mut self) -> Flow {
        if self.index != 0 || self.data.is_empty() {
            return Flow::Continue;
        }
        let end = self.data.len().min(WRITE_WINDOW);
        match self.sock.write(&self.data[..end]).await {
            Ok(n) => {
                debug!(vm = %self.shared.id, wrote = n, "wrote to init socket");
                self.index += n;
                Flow::Continue
            }
            Err(e) => {
                error!(vm = %self.shared.id, error = %e, "init socket write failed");
                let _ = self.hub.send(VmEvent::Interrupted {
                    reason: format!("init socket write failed: {}", e),
                });
                Flow::Exit
            }
        }
    }

    fn arm_reply_deadline(&mut self) {
        if self.awaiting_ack && self.pong == ReplyDeadline::Idle {
            debug!(vm = %self.shared.id, "output pending, arming reply deadline");
            self.pong = ReplyDeadline::Armed(Instant::now() + REPLY_DEADLINE);
        }
    }

    /// Idle too long since the last reply: enqueue a liveness probe.
    fn fire_ping(&mut self) -> Flow {
        self.ping_at = None;
        debug!(vm = %self.shared.id, "sending ping to init");
        if let Some(queue) = self.queue.upgrade() {
            let _ = queue.send(Command::ping());
        }
        Flow::Continue
    }

    /// The guest missed the reply deadline. Paused VMs are exempt: their
    /// vCPUs are not running, so silence is expected.
    fn fire_pong(&mut self) -> Flow {
        self.pong = ReplyDeadline::Fired;
        if self.shared.pause_state() == PauseState::Unpaused {
            warn!(vm = %self.shared.id, "init missed the reply deadline");
            let _ = self.hub.send(VmEvent::Interrupted {
                reason: "init not reply ping mesg".to_string(),
            });
        }
        Flow::Continue
    }

    fn protocol_violation(&mut self, reason: String) -> Flow {
        error!(vm = %self.shared.id, %reason, "protocol violation from init");
        let _ = self.hub.send(VmEvent::Interrupted { reason });
        Flow::Exit
    }

    /// Report a command's completion to its sink.
    fn deliver(&self, mut cmd: Command, err: Option<Error>) {
        match cmd.take_sink() {
            ResultSink::Oneshot(tx) => {
                let outcome = match err {
                    None => Ok(cmd.ret_msg),
                    Some(e) => Err(e),
                };
                let _ = tx.send(outcome);
            }
            ResultSink::Hub => {
                let reply = CommandOutcome {
                    code: cmd.code,
                    event: cmd.event.map(Box::new),
                    msg: cmd.ret_msg,
                };
                let event = match err {
                    None => VmEvent::CommandAck { reply },
                    Some(_) => VmEvent::CommandError { reply },
                };
                let _ = self.hub.send(event);
            }
        }
    }
}

fn version_sensitive(code: u32) -> bool {
    code == code::EXEC_CMD || code == code::NEW_CONTAINER
}

fn strip_process_id(payload: &[u8]) -> serde_json::Result<Vec<u8>> {
    let mut value: serde_json::Value = serde_json::from_slice(payload)?;
    if let Some(process) = value.get_mut("process").and_then(|p| p.as_object_mut()) {
        process.remove("id");
    }
    serde_json::to_vec(&value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::UnixStream;
    use tokio::sync::mpsc::unbounded_channel;
    use tokio::sync::oneshot;
    use vmplane_protocol::{read_frame, ExecCommand, Process, HEADER_LEN};

    struct Rig {
        dispatcher: Dispatcher,
        vm_tx: UnboundedSender<Command>,
        hub_rx: UnboundedReceiver<VmEvent>,
        peer: UnixStream,
        // Keeps the local read half open for the lifetime of the test.
        _read_half: tokio::net::unix::OwnedReadHalf,
    }

    fn rig() -> Rig {
        let shared = Arc::new(VmShared::new("vm-test"));
        let (hub_tx, hub_rx) = unbounded_channel();
        let (vm_tx, vm_rx) = unbounded_channel();
        let (local, peer) = UnixStream::pair().unwrap();
        let (read_half, write_half) = local.into_split();
        let dispatcher = Dispatcher::new(shared, hub_tx, vm_tx.downgrade(), vm_rx, write_half);
        Rig {
            dispatcher,
            vm_tx,
            hub_rx,
            peer,
            _read_half: read_half,
        }
    }

    fn exec_command(tx: oneshot::Sender<crate::Result<Vec<u8>>>) -> Command {
        let value = serde_json::to_value(ExecCommand {
            container: "c1".to_string(),
            process: Process {
                id: "p1".to_string(),
                args: vec!["echo".to_string()],
                ..Default::default()
            },
        })
        .unwrap();
        Command::new(code::EXEC_CMD, Payload::Json(value)).with_result(tx)
    }

    #[tokio::test]
    async fn test_ack_matches_fifo_and_delivers_reply() {
        let mut r = rig();
        let (tx, rx) = oneshot::channel();
        let cmd = Command::new(code::GET_POD, Payload::Empty).with_result(tx);

        assert_eq!(r.dispatcher.handle_command(cmd).await, Flow::Continue);
        assert_eq!(r.dispatcher.cmds.len(), 1);

        let frame = read_frame(&mut r.peer).await.unwrap();
        assert_eq!(frame.code, code::GET_POD);

        let flow = r
            .dispatcher
            .handle_command(Command::reply(code::ACK, b"pod".to_vec()))
            .await;
        assert_eq!(flow, Flow::Continue);
        assert!(r.dispatcher.cmds.is_empty());
        assert_eq!(rx.await.unwrap().unwrap(), b"pod");
    }

    #[tokio::test]
    async fn test_error_reply_carries_agent_text() {
        let mut r = rig();
        let (tx, rx) = oneshot::channel();
        let cmd = Command::new(code::GET_POD, Payload::Empty).with_result(tx);
        r.dispatcher.handle_command(cmd).await;

        r.dispatcher
            .handle_command(Command::reply(code::ERROR, b"no such pod".to_vec()))
            .await;

        match rx.await.unwrap() {
            Err(Error::Agent(cause)) => assert_eq!(cause, "no such pod"),
            other => panic!("expected agent error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reply_with_empty_queue_is_dropped() {
        let mut r = rig();
        let flow = r
            .dispatcher
            .handle_command(Command::reply(code::ACK, Vec::new()))
            .await;
        assert_eq!(flow, Flow::Continue);
        assert!(r.dispatcher.cmds.is_empty());
        assert!(r.hub_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_ping_reply_produces_no_completion() {
        let mut r = rig();
        r.dispatcher.handle_command(Command::ping()).await;
        r.dispatcher
            .handle_command(Command::reply(code::ACK, Vec::new()))
            .await;

        assert!(r.dispatcher.cmds.is_empty());
        assert!(r.hub_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_destroy_pod_reply_is_terminal() {
        let mut r = rig();
        let (tx, rx) = oneshot::channel();
        let cmd = Command::new(code::DESTROY_POD, Payload::Empty).with_result(tx);
        r.dispatcher.handle_command(cmd).await;

        let flow = r
            .dispatcher
            .handle_command(Command::reply(code::ACK, Vec::new()))
            .await;
        assert_eq!(flow, Flow::Exit);
        assert!(rx.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_flow_control_window_split() {
        let mut r = rig();
        // 892 payload bytes frame to exactly 900 on the wire.
        let cmd = Command::new(code::WRITE_FILE, Payload::Raw(vec![0xa5; 892]));
        r.dispatcher.handle_command(cmd).await;

        assert_eq!(r.dispatcher.index, WRITE_WINDOW);
        assert_eq!(r.dispatcher.data.len(), 900);

        let mut first = vec![0u8; WRITE_WINDOW];
        tokio::io::AsyncReadExt::read_exact(&mut r.peer, &mut first)
            .await
            .unwrap();

        let next = Command::reply(code::NEXT, (WRITE_WINDOW as u32).to_be_bytes().to_vec());
        r.dispatcher.handle_command(next).await;

        // Window retired, remainder written in the same round.
        assert_eq!(r.dispatcher.index, 388);
        assert_eq!(r.dispatcher.data.len(), 388);

        let mut second = vec![0u8; 388];
        tokio::io::AsyncReadExt::read_exact(&mut r.peer, &mut second)
            .await
            .unwrap();

        let next = Command::reply(code::NEXT, 388u32.to_be_bytes().to_vec());
        r.dispatcher.handle_command(next).await;

        assert!(r.dispatcher.data.is_empty());
        assert_eq!(r.dispatcher.index, 0);
        assert_eq!(r.dispatcher.got, 0);
    }

    #[tokio::test]
    async fn test_next_overshoot_fails_fast() {
        let mut r = rig();
        let cmd = Command::new(code::GET_POD, Payload::Empty);
        r.dispatcher.handle_command(cmd).await;
        assert_eq!(r.dispatcher.index, HEADER_LEN);

        let next = Command::reply(code::NEXT, 200u32.to_be_bytes().to_vec());
        let flow = r.dispatcher.handle_command(next).await;

        assert_eq!(flow, Flow::Exit);
        assert!(matches!(
            r.hub_rx.try_recv(),
            Ok(VmEvent::Interrupted { .. })
        ));
    }

    #[tokio::test]
    async fn test_short_next_payload_fails_fast() {
        let mut r = rig();
        let next = Command::reply(code::NEXT, vec![0x00, 0x01]);
        let flow = r.dispatcher.handle_command(next).await;

        assert_eq!(flow, Flow::Exit);
        assert!(matches!(
            r.hub_rx.try_recv(),
            Ok(VmEvent::Interrupted { .. })
        ));
    }

    #[tokio::test]
    async fn test_version_gate_defers_exec() {
        let mut r = rig();
        let (tx, _rx) = oneshot::channel();
        r.dispatcher.handle_command(exec_command(tx)).await;

        // Nothing framed, nothing queued; the command comes back around
        // through the dispatcher's own channel.
        assert!(r.dispatcher.cmds.is_empty());
        assert!(r.dispatcher.data.is_empty());

        let deferred = tokio::time::timeout(Duration::from_millis(200), r.dispatcher.rx.recv())
            .await
            .expect("deferred command should be re-enqueued")
            .expect("vm channel open");
        assert_eq!(deferred.code, code::EXEC_CMD);
        assert_eq!(deferred.deferrals, 1);
    }

    #[tokio::test]
    async fn test_version_gate_budget_exhaustion() {
        let mut r = rig();
        let (tx, rx) = oneshot::channel();
        let mut cmd = exec_command(tx);
        cmd.deferrals = VERSION_GATE_MAX_RETRIES;

        r.dispatcher.handle_command(cmd).await;
        assert!(matches!(
            rx.await.unwrap(),
            Err(Error::VersionGate {
                code: code::EXEC_CMD
            })
        ));
    }

    #[tokio::test]
    async fn test_exec_strips_process_id_for_legacy_agent() {
        let mut r = rig();
        r.dispatcher.shared.set_api_version(4242);

        let (tx, _rx) = oneshot::channel();
        r.dispatcher.handle_command(exec_command(tx)).await;

        let frame = read_frame(&mut r.peer).await.unwrap();
        assert_eq!(frame.code, code::EXEC_CMD);
        let sent: serde_json::Value = serde_json::from_slice(&frame.payload).unwrap();
        assert_eq!(
            sent,
            json!({"container": "c1", "process": {"args": ["echo"], "terminal": false}})
        );
    }

    #[tokio::test]
    async fn test_modern_agent_keeps_process_id() {
        let mut r = rig();
        r.dispatcher.shared.set_api_version(4243);

        let (tx, _rx) = oneshot::channel();
        r.dispatcher.handle_command(exec_command(tx)).await;

        let frame = read_frame(&mut r.peer).await.unwrap();
        let sent: serde_json::Value = serde_json::from_slice(&frame.payload).unwrap();
        assert_eq!(sent["process"]["id"], "p1");
    }

    #[tokio::test]
    async fn test_oversized_payload_fails_command_only() {
        let mut r = rig();
        let (tx, rx) = oneshot::channel();
        let cmd = Command::new(
            code::WRITE_FILE,
            Payload::Raw(vec![0u8; vmplane_protocol::MAX_FRAME_SIZE as usize]),
        )
        .with_result(tx);

        let flow = r.dispatcher.handle_command(cmd).await;
        assert_eq!(flow, Flow::Continue);
        assert!(matches!(rx.await.unwrap(), Err(Error::Frame(_))));
        assert!(r.dispatcher.cmds.is_empty());
        assert!(r.dispatcher.data.is_empty());
    }

    #[tokio::test]
    async fn test_default_sink_posts_ack_to_hub() {
        let mut r = rig();
        let cmd = Command::new(code::GET_POD, Payload::Empty);
        r.dispatcher.handle_command(cmd).await;
        r.dispatcher
            .handle_command(Command::reply(code::ACK, b"pod".to_vec()))
            .await;

        match r.hub_rx.try_recv() {
            Ok(VmEvent::CommandAck { reply }) => {
                assert_eq!(reply.code, code::GET_POD);
                assert_eq!(reply.msg, b"pod");
            }
            other => panic!("expected command ack on hub, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reply_timers_follow_ack() {
        let mut r = rig();
        let cmd = Command::new(code::GET_POD, Payload::Empty);
        r.dispatcher.handle_command(cmd).await;

        // Output pending: reply deadline armed, no ping scheduled yet.
        assert!(matches!(r.dispatcher.pong, ReplyDeadline::Armed(_)));
        assert!(r.dispatcher.ping_at.is_none());

        r.dispatcher
            .handle_command(Command::reply(code::ACK, Vec::new()))
            .await;

        // Reply arrived: deadline cleared, idle ping scheduled.
        assert_eq!(r.dispatcher.pong, ReplyDeadline::Idle);
        assert!(r.dispatcher.ping_at.is_some());
    }

    #[tokio::test]
    async fn test_ping_fire_enqueues_probe() {
        let mut r = rig();
        r.dispatcher.ping_at = Some(Instant::now());
        r.dispatcher.fire_ping();

        assert!(r.dispatcher.ping_at.is_none());
        let cmd = r.dispatcher.rx.recv().await.unwrap();
        assert_eq!(cmd.code, code::PING);
    }

    #[tokio::test]
    async fn test_reply_deadline_fire_interrupts_when_unpaused() {
        let mut r = rig();
        r.dispatcher.pong = ReplyDeadline::Armed(Instant::now());
        r.dispatcher.fire_pong();

        assert_eq!(r.dispatcher.pong, ReplyDeadline::Fired);
        match r.hub_rx.try_recv() {
            Ok(VmEvent::Interrupted { reason }) => {
                assert_eq!(reason, "init not reply ping mesg");
            }
            other => panic!("expected interrupted, got {:?}", other),
        }

        // A fired deadline does not re-arm until a reply clears it.
        r.dispatcher.awaiting_ack = true;
        r.dispatcher.arm_reply_deadline();
        assert_eq!(r.dispatcher.pong, ReplyDeadline::Fired);
    }

    #[tokio::test]
    async fn test_reply_deadline_suppressed_while_paused() {
        let mut r = rig();
        r.dispatcher.shared.set_pause_state(PauseState::Paused);
        r.dispatcher.pong = ReplyDeadline::Armed(Instant::now());
        r.dispatcher.fire_pong();

        assert!(r.hub_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_channel_close_stops_dispatcher() {
        let r = rig();
        let Rig {
            dispatcher, vm_tx, ..
        } = r;
        drop(vm_tx);
        // The dispatcher's own handle is weak, so dropping the last real
        // sender ends the loop.
        dispatcher.run().await;
    }
}
