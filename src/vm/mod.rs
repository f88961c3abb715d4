//! VM context, event loop, and the host side of the agent channel.
//!
//! A [`VmContext`] is the single-writer home of one guest VM. Every producer
//! — the hypervisor driver, the agent reader, timers, external callers —
//! pushes [`VmEvent`]s into the Hub; one loop task consumes them and runs the
//! current state's handler. Outbound traffic flows the other way: commands go
//! onto the VM channel, where the dispatcher serializes framing, writing, and
//! reply matching.
//!
//! ```text
//!  driver ─┐                                  ┌─> reader ──(acks)──┐
//!  pty ────┼─> Hub ─> event loop ─> handler   │                    v
//!  caller ─┘                          │       │   VM channel ─> dispatcher
//!                                     └── commands ──^            │
//!                                                    agent socket ┘
//! ```

pub mod command;
pub mod event;
pub mod state;

mod bootstrap;
mod dispatcher;
mod reader;

use crate::driver::Driver;
use crate::error::{Error, Result};
use crate::record::{BootConfig, VmRecord};
use bootstrap::InitEndpoint;
use command::{Command, Payload};
use event::{CommandOutcome, PauseState, VmEvent, VmResponse, VmShared};
use state::{state_init, state_running, StateHandler, VmState};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use vmplane_protocol::{code, ExecCommand, Process};

/// The supervised state of one guest VM.
///
/// Owns both single-consumer channels: the Hub (events in) and the VM
/// channel (commands out, consumed by the dispatcher once a bootstrap path
/// starts it). The context must outlive every task spawned from it; the
/// event loop consumes it, so it does.
pub struct VmContext {
    shared: Arc<VmShared>,
    boot: BootConfig,
    agent_socket: PathBuf,
    driver: Arc<dyn Driver>,

    hub_tx: UnboundedSender<VmEvent>,
    hub_rx: UnboundedReceiver<VmEvent>,
    queue: UnboundedSender<Command>,
    /// Receiver half of the VM channel, handed to the dispatcher by the
    /// first bootstrap path to run.
    vm_rx: Option<UnboundedReceiver<Command>>,
    client: UnboundedSender<VmResponse>,

    handler: Option<StateHandler>,
    state: VmState,
}

impl std::fmt::Debug for VmContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmContext").field("state", &self.state).finish()
    }
}

impl VmContext {
    /// Create a context for a fresh VM.
    pub fn new(
        id: impl Into<String>,
        boot: BootConfig,
        agent_socket: impl Into<PathBuf>,
        client: UnboundedSender<VmResponse>,
        driver: Arc<dyn Driver>,
    ) -> Self {
        let (hub_tx, hub_rx) = unbounded_channel();
        let (queue, vm_rx) = unbounded_channel();
        Self {
            shared: Arc::new(VmShared::new(id)),
            boot,
            agent_socket: agent_socket.into(),
            driver,
            hub_tx,
            hub_rx,
            queue,
            vm_rx: Some(vm_rx),
            client,
            handler: Some(state_init),
            state: VmState::Init,
        }
    }

    /// Rebuild a context around an already-running VM from its persisted
    /// record and start re-attaching to its agent.
    ///
    /// Fails before any task is spawned if the blob does not decode or names
    /// a different VM.
    pub fn associate(
        vm_id: &str,
        blob: &[u8],
        client: UnboundedSender<VmResponse>,
        driver: Arc<dyn Driver>,
    ) -> Result<Self> {
        let record = VmRecord::decode(blob)?;
        if record.id != vm_id {
            return Err(Error::VmMismatch {
                record: record.id,
                requested: vm_id.to_string(),
            });
        }

        debug!(vm = %record.id, driver = %record.driver, "re-associating");
        let mut ctx = Self::new(record.id, record.boot, record.agent_socket, client, driver);
        ctx.driver.associate(&ctx.handle())?;

        let endpoint = ctx.take_endpoint()?;
        tokio::spawn(endpoint.connect_to_init());
        ctx.become_state(state_running, VmState::Running);
        Ok(ctx)
    }

    /// Stable VM identifier.
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Current coarse lifecycle state.
    pub fn state(&self) -> VmState {
        self.state
    }

    /// Current pause state.
    pub fn pause_state(&self) -> PauseState {
        self.shared.pause_state()
    }

    /// Agent API version, 0 until probed.
    pub fn api_version(&self) -> u32 {
        self.shared.api_version()
    }

    /// A cloneable handle external producers use to post events and issue
    /// commands.
    pub fn handle(&self) -> VmHandle {
        VmHandle {
            shared: self.shared.clone(),
            hub: self.hub_tx.clone(),
            queue: self.queue.clone(),
        }
    }

    /// Serialize this VM for later re-association.
    pub fn record(&self) -> VmRecord {
        VmRecord {
            id: self.shared.id.clone(),
            driver: self.driver.name().to_string(),
            agent_socket: self.agent_socket.clone(),
            boot: self.boot.clone(),
        }
    }

    /// Boot a fresh VM and run its event loop until the VM is gone.
    pub async fn launch(mut self) -> Result<()> {
        let endpoint = self.take_endpoint()?;
        tokio::spawn(endpoint.wait_init_ready());
        self.driver.launch(&self.handle())?;
        self.run().await;
        Ok(())
    }

    /// Run the event loop: the single consumer of the Hub. Returns when the
    /// current handler clears itself or the Hub closes.
    pub async fn run(mut self) {
        while let Some(handler) = self.handler {
            match self.hub_rx.recv().await {
                Some(event) => {
                    debug!(
                        vm = %self.shared.id,
                        state = %self.state,
                        event = event.kind(),
                        "event loop got message"
                    );
                    handler(&mut self, event);
                }
                None => {
                    error!(vm = %self.shared.id, "hub closed, event loop quitting");
                    break;
                }
            }
        }
        info!(vm = %self.shared.id, "event loop finished");
    }

    /// Atomically install the next state and its handler.
    pub(crate) fn become_state(&mut self, handler: StateHandler, state: VmState) {
        debug!(vm = %self.shared.id, from = %self.state, to = %state, "state transition");
        self.handler = Some(handler);
        self.state = state;
    }

    /// Terminate the event loop after the current event.
    pub(crate) fn finish(&mut self) {
        self.handler = None;
    }

    pub(crate) fn set_pause_state(&self, pause: PauseState) {
        self.shared.set_pause_state(pause);
    }

    /// Launch the deferred version probe of a template boot after resume.
    pub(crate) fn spawn_version_probe(&self) {
        let queue = self.queue.clone();
        let shared = self.shared.clone();
        tokio::spawn(async move {
            if let Err(e) = bootstrap::probe_api_version(queue, shared).await {
                warn!(error = %e, "agent api version probe failed");
            }
        });
    }

    pub(crate) fn report_command_ack(&self, reply: CommandOutcome) {
        let data = serde_json::json!({
            "code": reply.code,
            "msg": String::from_utf8_lossy(&reply.msg),
        });
        self.respond(VmResponse::ok(&self.shared.id, Some(data)));
    }

    pub(crate) fn report_command_error(&self, reply: CommandOutcome) {
        let cause = format!(
            "command {} failed: {}",
            reply.code,
            String::from_utf8_lossy(&reply.msg)
        );
        self.respond(VmResponse::failed(&self.shared.id, cause));
    }

    pub(crate) fn report_failure(&self, reason: &str) {
        self.respond(VmResponse::failed(&self.shared.id, reason));
    }

    /// Map a guest process notification to a client response; container and
    /// process bookkeeping belongs to the upper layer.
    pub(crate) fn handle_process_async_event(
        &self,
        record: vmplane_protocol::ProcessAsyncEvent,
    ) {
        debug!(
            vm = %self.shared.id,
            container = %record.container,
            process = %record.process,
            event = %record.event,
            status = record.status,
            "process event from init"
        );
        let data = serde_json::to_value(&record).ok();
        self.respond(VmResponse::ok(&self.shared.id, data));
    }

    fn respond(&self, response: VmResponse) {
        if self.client.send(response).is_err() {
            debug!(vm = %self.shared.id, "client channel closed, dropping response");
        }
    }

    fn take_endpoint(&mut self) -> Result<InitEndpoint> {
        let rx = self.vm_rx.take().ok_or_else(|| Error::AlreadyLaunched {
            id: self.shared.id.clone(),
        })?;
        Ok(InitEndpoint {
            socket: self.agent_socket.clone(),
            boot: self.boot.clone(),
            shared: self.shared.clone(),
            hub: self.hub_tx.clone(),
            queue: self.queue.clone(),
            rx,
        })
    }
}

/// Cloneable handle to a supervised VM for external producers: post events
/// onto the Hub, issue commands to the guest agent.
#[derive(Clone)]
pub struct VmHandle {
    shared: Arc<VmShared>,
    hub: UnboundedSender<VmEvent>,
    queue: UnboundedSender<Command>,
}

impl VmHandle {
    /// Stable VM identifier.
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Agent API version, 0 until probed.
    pub fn api_version(&self) -> u32 {
        self.shared.api_version()
    }

    /// Current pause state.
    pub fn pause_state(&self) -> PauseState {
        self.shared.pause_state()
    }

    /// Post an event onto the VM's hub.
    pub fn post(&self, event: VmEvent) -> Result<()> {
        self.hub.send(event).map_err(|_| Error::ChannelClosed("hub"))
    }

    /// Enqueue a command whose completion is reported to the Hub as a
    /// `CommandAck`/`CommandError` event.
    pub fn send_command(&self, cmd: Command) -> Result<()> {
        self.queue.send(cmd).map_err(|_| Error::ChannelClosed("vm"))
    }

    /// Issue a command and await its reply bytes.
    pub async fn issue(&self, code: u32, payload: Payload) -> Result<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        self.queue
            .send(Command::new(code, payload).with_result(tx))
            .map_err(|_| Error::ChannelClosed("vm"))?;
        rx.await.map_err(|_| Error::Abandoned)?
    }

    /// Execute a process inside a running container.
    pub async fn exec(&self, container: &str, process: Process) -> Result<Vec<u8>> {
        let payload = serde_json::to_value(ExecCommand {
            container: container.to_string(),
            process,
        })
        .map_err(|e| Error::Encode {
            code: code::EXEC_CMD,
            reason: e.to_string(),
        })?;
        self.issue(code::EXEC_CMD, Payload::Json(payload)).await
    }

    /// Add a container to the running pod. The spec is pre-translated JSON;
    /// building it from an image config is the caller's concern.
    pub async fn new_container(&self, spec: serde_json::Value) -> Result<Vec<u8>> {
        self.issue(code::NEW_CONTAINER, Payload::Json(spec)).await
    }

    /// Tear the pod down. The reply to this command is terminal: the
    /// dispatcher exits after delivering it.
    pub async fn destroy_pod(&self) -> Result<Vec<u8>> {
        self.issue(code::DESTROY_POD, Payload::Empty).await
    }

    /// Enqueue a liveness probe. Pings are acknowledged by the agent but
    /// deliver no completion, so this is fire-and-forget.
    pub fn ping(&self) -> Result<()> {
        self.send_command(Command::new(code::PING, Payload::Empty))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct TestDriver {
        launches: AtomicU32,
        associates: AtomicU32,
    }

    impl Driver for TestDriver {
        fn name(&self) -> &str {
            "test"
        }

        fn launch(&self, _vm: &VmHandle) -> Result<()> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn associate(&self, _vm: &VmHandle) -> Result<()> {
            self.associates.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn record_blob(id: &str, socket: &str) -> Vec<u8> {
        VmRecord {
            id: id.to_string(),
            driver: "test".to_string(),
            agent_socket: PathBuf::from(socket),
            boot: BootConfig::default(),
        }
        .encode()
        .unwrap()
    }

    #[tokio::test]
    async fn test_associate_id_mismatch() {
        let driver = Arc::new(TestDriver::default());
        let (client_tx, _client_rx) = unbounded_channel();
        let blob = record_blob("vm-A", "/tmp/none.sock");

        let err = VmContext::associate("vm-B", &blob, client_tx, driver.clone()).unwrap_err();
        match err {
            Error::VmMismatch { record, requested } => {
                assert_eq!(record, "vm-A");
                assert_eq!(requested, "vm-B");
            }
            other => panic!("expected id mismatch, got {}", other),
        }
        // Validation failed before the driver or any task was touched.
        assert_eq!(driver.associates.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_associate_goes_straight_to_running() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("agent.sock");
        let _listener = tokio::net::UnixListener::bind(&socket).unwrap();

        let driver = Arc::new(TestDriver::default());
        let (client_tx, _client_rx) = unbounded_channel();
        let blob = record_blob("vm-A", socket.to_str().unwrap());

        let ctx = VmContext::associate("vm-A", &blob, client_tx, driver.clone()).unwrap();
        assert_eq!(ctx.state(), VmState::Running);
        assert_eq!(driver.associates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_event_loop_exits_on_vm_exit() {
        let driver = Arc::new(TestDriver::default());
        let (client_tx, _client_rx) = unbounded_channel();
        let ctx = VmContext::new(
            "vm-1",
            BootConfig::default(),
            "/tmp/none.sock",
            client_tx,
            driver,
        );
        let handle = ctx.handle();

        let loop_task = tokio::spawn(ctx.run());
        handle.post(VmEvent::InitConnected).unwrap();
        handle.post(VmEvent::VmExit).unwrap();
        loop_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_interrupted_reports_failure_and_shuts_down() {
        let driver = Arc::new(TestDriver::default());
        let (client_tx, mut client_rx) = unbounded_channel();
        let ctx = VmContext::new(
            "vm-1",
            BootConfig::default(),
            "/tmp/none.sock",
            client_tx,
            driver,
        );
        let handle = ctx.handle();

        let loop_task = tokio::spawn(ctx.run());
        handle.post(VmEvent::InitConnected).unwrap();
        handle
            .post(VmEvent::Interrupted {
                reason: "init socket failed".to_string(),
            })
            .unwrap();

        let response = client_rx.recv().await.unwrap();
        assert!(!response.success);
        assert!(response.cause.contains("init socket failed"));

        handle.post(VmEvent::VmExit).unwrap();
        loop_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_process_event_forwarded_to_client() {
        let driver = Arc::new(TestDriver::default());
        let (client_tx, mut client_rx) = unbounded_channel();
        let ctx = VmContext::new(
            "vm-1",
            BootConfig::default(),
            "/tmp/none.sock",
            client_tx,
            driver,
        );
        let handle = ctx.handle();

        let loop_task = tokio::spawn(ctx.run());
        handle.post(VmEvent::InitConnected).unwrap();
        handle
            .post(VmEvent::ProcessAsync(vmplane_protocol::ProcessAsyncEvent {
                container: "c1".to_string(),
                process: "p1".to_string(),
                event: "finished".to_string(),
                status: 0,
            }))
            .unwrap();

        let response = client_rx.recv().await.unwrap();
        assert!(response.success);
        let data = response.data.unwrap();
        assert_eq!(data["container"], "c1");
        assert_eq!(data["status"], 0);

        handle.post(VmEvent::VmExit).unwrap();
        loop_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_pause_and_resume_transitions() {
        let driver = Arc::new(TestDriver::default());
        let (client_tx, _client_rx) = unbounded_channel();
        let ctx = VmContext::new(
            "vm-1",
            BootConfig::default(),
            "/tmp/none.sock",
            client_tx,
            driver,
        );
        let handle = ctx.handle();
        let shared = ctx.shared.clone();
        // Resume probes the version only when it is still unknown; pretend
        // a probe already ran so no task is spawned here.
        shared.set_api_version(4242);

        let loop_task = tokio::spawn(ctx.run());
        handle.post(VmEvent::InitConnected).unwrap();
        handle.post(VmEvent::Pause).unwrap();
        handle.post(VmEvent::Resume).unwrap();
        handle.post(VmEvent::VmExit).unwrap();
        loop_task.await.unwrap();

        assert_eq!(shared.pause_state(), PauseState::Unpaused);
    }

    #[tokio::test]
    async fn test_launch_twice_is_rejected() {
        let driver = Arc::new(TestDriver::default());
        let (client_tx, _client_rx) = unbounded_channel();
        let mut ctx = VmContext::new(
            "vm-1",
            BootConfig::default(),
            "/tmp/none.sock",
            client_tx,
            driver,
        );

        ctx.take_endpoint().unwrap();
        assert!(matches!(
            ctx.take_endpoint(),
            Err(Error::AlreadyLaunched { .. })
        ));
    }
}
