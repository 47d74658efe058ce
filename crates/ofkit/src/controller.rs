use std::{
    fmt,
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use serde_json::{json, Value};
use tokio::{sync::mpsc, task::JoinHandle, time};
use tracing::{debug, error, info, warn};

use crate::{
    app::App,
    config::Configuration,
    datapath::{Datapath, DatapathId, DatapathTable},
    dispatch::Dispatcher,
    error::{ControllerError, EXIT_STATUS_ERROR, EXIT_STATUS_OK},
    event::{self, Event, EventKind},
    packet,
    reply::{ReplyError, ReplyHandle, ReplyTracker, SWEEP_INTERVAL},
    rpc::{Rpc, TaskScope},
    tasklist::{TaskList, TaskRef},
    transport::{SubprocessTransport, Transport},
};

/// Highest engine API major version this controller understands.
const API_VERSION_MAJOR: u64 = 1;
const DRAIN_ATTEMPTS: u32 = 3;
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Coarse lifecycle state. Strictly monotone; phase names double as task
/// scope keys.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Init,
    Prestart,
    Start,
    Stop,
    Poststop,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Init => "INIT",
            Phase::Prestart => "PRESTART",
            Phase::Start => "START",
            Phase::Stop => "STOP",
            Phase::Poststop => "POSTSTOP",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cloneable handle through which apps and tasks drive the controller.
#[derive(Clone)]
pub struct ControllerHandle {
    rpc: Rpc,
    datapaths: Arc<Mutex<DatapathTable>>,
    config: Arc<Configuration>,
}

impl ControllerHandle {
    pub fn config(&self) -> &Configuration {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        self.rpc.phase()
    }

    pub fn find_datapath(&self, id: DatapathId) -> Option<Datapath> {
        lock_table(&self.datapaths).get_dpid(id)
    }

    pub fn datapaths(&self) -> Vec<Datapath> {
        lock_table(&self.datapaths).all()
    }

    /// Fire-and-forget OpenFlow message. The target connection comes from
    /// the message fields or the calling task's datapath context.
    pub fn send(&self, msg: Event) -> Result<(), ControllerError> {
        self.rpc.send_message(msg)
    }

    /// OpenFlow request; replies arrive on the returned handle.
    pub fn request(&self, msg: Event) -> Result<ReplyHandle, ControllerError> {
        self.rpc.request_message(msg)
    }

    /// Raw RPC request to the engine.
    pub fn rpc_call(&self, method: &str, params: Value) -> Result<ReplyHandle, ControllerError> {
        self.rpc.rpc_call(method, params)
    }

    /// Makes an outgoing OpenFlow connection; resolves to its conn_id.
    pub async fn connect(&self, endpoint: &str) -> Result<u64, ControllerError> {
        let mut reply = self
            .rpc
            .rpc_call("OFP.CONNECT", json!({"endpoint": endpoint}))?;
        let result = reply.next().await?;
        Ok(result.get("conn_id").and_then(Value::as_u64).unwrap_or_default())
    }

    /// Closes a connection by id; resolves to the engine's close count.
    pub async fn close_connection(&self, conn_id: u64) -> Result<u64, ControllerError> {
        let mut reply = self.rpc.rpc_call("OFP.CLOSE", json!({"conn_id": conn_id}))?;
        let result = reply.next().await?;
        Ok(result.get("count").and_then(Value::as_u64).unwrap_or_default())
    }

    /// Spawns a task scoped to the current phase.
    pub fn create_task<F>(&self, future: F) -> TaskRef
    where
        F: Future<Output = Result<(), anyhow::Error>> + Send + 'static,
    {
        self.rpc.spawn(None, TaskScope::default(), future)
    }

    /// Posts a synthetic event to the dispatch queue.
    pub fn post_event(&self, event: Event) {
        self.rpc.post_event(event);
    }

    /// Requests a graceful exit.
    pub fn shutdown(&self) {
        self.rpc.post_event(Event::synthetic("EXIT"));
    }

    /// Marks `task` as the target of the next interrupt signal.
    pub fn set_interruptible(&self, task: TaskRef) {
        self.rpc.set_interruptible(task);
    }
}

/// Builder for a [`Controller`]. Apps dispatch in registration order.
pub struct ControllerBuilder {
    config: Configuration,
    apps: Vec<Box<dyn App>>,
    transport: Option<Box<dyn Transport>>,
}

impl ControllerBuilder {
    pub fn config(mut self, config: Configuration) -> Self {
        self.config = config;
        self
    }

    pub fn app<A: App>(mut self, app: A) -> Self {
        self.apps.push(Box::new(app));
        self
    }

    /// Replaces the subprocess transport, e.g. with a scripted engine in
    /// tests.
    pub fn transport<T: Transport + 'static>(mut self, transport: T) -> Self {
        self.transport = Some(Box::new(transport));
        self
    }

    pub fn build(self) -> Controller {
        let ControllerBuilder {
            config,
            apps,
            transport,
        } = self;
        let transport = transport
            .unwrap_or_else(|| Box::new(SubprocessTransport::new(config.backend.clone())));
        Controller {
            config: Arc::new(config),
            transport,
            dispatcher: Dispatcher::new(apps),
            ofp_versions: Vec::new(),
        }
    }
}

/// Event dispatcher for OpenFlow apps.
///
/// Owns the protocol engine transport and the registered apps, and drives
/// the full lifecycle: engine start, listen setup, event dispatch, and the
/// drain on shutdown.
pub struct Controller {
    config: Arc<Configuration>,
    transport: Box<dyn Transport>,
    dispatcher: Dispatcher,
    ofp_versions: Vec<u64>,
}

impl Controller {
    pub fn builder() -> ControllerBuilder {
        ControllerBuilder {
            config: Configuration::default(),
            apps: Vec::new(),
            transport: None,
        }
    }

    /// Runs the controller to completion and returns the process exit
    /// status: 0 after a clean shutdown, 10 when the run failed outside
    /// the controlled start-failure path.
    pub async fn run(mut self) -> i32 {
        match self.run_inner().await {
            Ok(()) => EXIT_STATUS_OK,
            Err(error) => {
                error!(%error, "controller run failed");
                EXIT_STATUS_ERROR
            }
        }
    }

    async fn run_inner(&mut self) -> Result<(), ControllerError> {
        let link = self.transport.open().await?;

        let (queue_tx, mut queue_rx) = mpsc::unbounded_channel();
        let (failure_tx, mut failure_rx) = mpsc::unbounded_channel();
        let rpc = Rpc::new(
            link.writer,
            queue_tx,
            ReplyTracker::new(),
            TaskList::new(failure_tx),
            self.config.request_timeout,
        );
        let datapaths = Arc::new(Mutex::new(DatapathTable::default()));
        let handle = ControllerHandle {
            rpc: rpc.clone(),
            datapaths: Arc::clone(&datapaths),
            config: Arc::clone(&self.config),
        };

        let pump = tokio::spawn(reader_pump(link.events, rpc.clone()));
        let sweeper = tokio::spawn(reply_sweeper(rpc.clone()));
        let signals = spawn_signal_tasks(&self.config, &rpc)?;

        self.set_phase(&rpc, Phase::Prestart);
        match self.start_sequence(&rpc).await {
            Ok(()) => {
                self.set_phase(&rpc, Phase::Start);
                self.dispatcher.invoke_start(&handle).await;
            }
            Err(error) => {
                error!(%error, "controller start failed");
                rpc.post_event(Event::synthetic("STARTFAIL"));
                rpc.post_event(Event::synthetic("EXIT"));
            }
        }

        self.event_loop(&handle, &rpc, &datapaths, &mut queue_rx, &mut failure_rx)
            .await;

        self.set_phase(&rpc, Phase::Stop);
        sweeper.abort();
        pump.abort();
        for task in signals {
            task.abort();
        }

        self.cleanup(&handle, &rpc, &datapaths);
        rpc.tasks().drain(DRAIN_ATTEMPTS, DRAIN_TIMEOUT).await;
        while let Ok(failure) = failure_rx.try_recv() {
            self.dispatcher.route_exception(failure);
        }
        self.dispatcher.invoke_stop(&handle).await;

        self.transport.close().await?;
        self.set_phase(&rpc, Phase::Poststop);
        Ok(())
    }

    fn set_phase(&self, rpc: &Rpc, next: Phase) {
        let previous = rpc.phase();
        debug_assert!(next > previous);
        debug!(from = %previous, to = %next, "phase change");
        if next != Phase::Prestart {
            rpc.cancel_scope(previous.as_str());
        }
        rpc.set_phase(next);
        rpc.post_event(Event::synthetic(next.as_str()));
    }

    /// Engine start: check the description, install the TLS identity, and
    /// listen on the configured endpoints.
    async fn start_sequence(&mut self, rpc: &Rpc) -> Result<(), ControllerError> {
        self.describe(rpc).await?;
        let tls_id = match self.config.tls.clone() {
            Some(tls) => self.add_identity(rpc, &tls).await?,
            None => 0,
        };
        self.listen(rpc, tls_id).await?;
        Ok(())
    }

    async fn describe(&mut self, rpc: &Rpc) -> Result<(), ControllerError> {
        let mut reply = rpc.rpc_call("OFP.DESCRIPTION", json!({}))?;
        let result = reply.next().await?;

        let major = result
            .get("major_version")
            .and_then(Value::as_u64)
            .unwrap_or_default();
        let minor = result
            .get("minor_version")
            .and_then(Value::as_u64)
            .unwrap_or_default();
        if major > API_VERSION_MAJOR {
            return Err(ControllerError::ApiVersion { major, minor });
        }

        self.ofp_versions = result
            .get("ofp_versions")
            .and_then(Value::as_array)
            .map(|versions| versions.iter().filter_map(Value::as_u64).collect())
            .unwrap_or_default();
        info!(
            software = result
                .get("software_version")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default(),
            "connected to protocol engine"
        );
        Ok(())
    }

    async fn add_identity(
        &mut self,
        rpc: &Rpc,
        tls: &crate::config::TlsConfig,
    ) -> Result<u64, ControllerError> {
        let mut reply = rpc.rpc_call(
            "OFP.ADD_IDENTITY",
            json!({
                "cert": tls.cert,
                "cacert": tls.cacert,
                "privkey": tls.privkey,
            }),
        )?;
        let result = reply.next().await?;
        let tls_id = result
            .get("tls_id")
            .and_then(Value::as_u64)
            .unwrap_or_default();
        debug!(tls_id, "tls identity installed");
        Ok(tls_id)
    }

    async fn listen(&mut self, rpc: &Rpc, tls_id: u64) -> Result<(), ControllerError> {
        let versions: Vec<u64> = if self.config.listen_versions.is_empty() {
            self.ofp_versions.clone()
        } else {
            self.config.listen_versions.iter().map(|v| *v as u64).collect()
        };

        for endpoint in &self.config.listen_endpoints {
            let mut reply = rpc.rpc_call(
                "OFP.LISTEN",
                json!({
                    "endpoint": endpoint,
                    "versions": versions,
                    "tls_id": tls_id,
                    "options": self.config.listen_options,
                }),
            )?;
            let result = reply.next().await?;
            info!(
                endpoint = %endpoint,
                conn_id = result.get("conn_id").and_then(serde_json::Value::as_u64).unwrap_or_default(),
                ?versions,
                "listening"
            );
        }
        Ok(())
    }

    /// Dispatch loop: drains the queue strictly in order, one cooperative
    /// yield after each event so pending tasks run before the next one.
    /// Exits when the `EXIT` event arrives or the queue closes.
    async fn event_loop(
        &mut self,
        handle: &ControllerHandle,
        rpc: &Rpc,
        datapaths: &Arc<Mutex<DatapathTable>>,
        queue: &mut mpsc::UnboundedReceiver<Event>,
        failures: &mut mpsc::UnboundedReceiver<anyhow::Error>,
    ) {
        debug!("event loop entered");
        loop {
            tokio::select! {
                biased;
                Some(failure) = failures.recv() => {
                    self.dispatcher.route_exception(failure);
                }
                maybe_event = queue.recv() => {
                    let Some(event) = maybe_event else { break };
                    if self.handle_event(handle, rpc, datapaths, event) {
                        break;
                    }
                    tokio::task::yield_now().await;
                }
            }
        }
        debug!("event loop exited");
    }

    /// Returns true when the loop should stop.
    fn handle_event(
        &mut self,
        handle: &ControllerHandle,
        rpc: &Rpc,
        datapaths: &Arc<Mutex<DatapathTable>>,
        event: Event,
    ) -> bool {
        match event.kind() {
            EventKind::Internal("EXIT") => {
                debug!("exit event received");
                return true;
            }
            EventKind::Internal(_) => {
                self.dispatcher.dispatch_event(handle, &event);
            }
            EventKind::RpcReply(xid) => {
                deliver_rpc_reply(rpc, xid, &event);
            }
            EventKind::Message(_) => {
                self.handle_message(handle, rpc, datapaths, event);
            }
            EventKind::Unknown => {
                warn!(%event, "unhandled event");
            }
        }
        false
    }

    fn handle_message(
        &mut self,
        handle: &ControllerHandle,
        rpc: &Rpc,
        datapaths: &Arc<Mutex<DatapathTable>>,
        mut event: Event,
    ) {
        let Some(message_type) = event.event_type().map(str::to_owned) else {
            return;
        };
        match message_type.as_str() {
            "CHANNEL_UP" => self.channel_up(handle, rpc, datapaths, &event),
            "CHANNEL_DOWN" => self.channel_down(handle, rpc, datapaths, &event),
            "CHANNEL_ALERT" => self.channel_alert(handle, rpc, datapaths, event),
            _ => {
                // Reply correlation: any message whose xid matches an
                // outstanding request is consumed as its reply.
                if let Some(xid) = event.xid() {
                    if rpc.replies().contains(xid) {
                        if message_type == "ERROR" {
                            rpc.replies()
                                .deliver_error(xid, ReplyError::Message { xid, event });
                        } else {
                            let more = event.has_more();
                            rpc.replies().deliver_result(xid, event.into_value(), more);
                        }
                        return;
                    }
                }

                let dp = match event.conn_id() {
                    Some(conn_id) => {
                        let found = lock_table(datapaths).get_conn(conn_id);
                        if found.is_none() {
                            warn!(conn_id, message_type = %message_type, "message for unknown conn_id");
                        }
                        found
                    }
                    None => None,
                };
                if dp.as_ref().is_some_and(Datapath::is_closed) {
                    return;
                }
                if message_type == "ERROR" {
                    error!(%event, "openflow error not matching any request");
                }

                match message_type.as_str() {
                    "PACKET_IN" => {
                        packet::normalize_packet_in(&mut event);
                        self.dispatcher.dispatch_packet_in(handle, dp.as_ref(), &event);
                    }
                    "PORT_STATUS" => match dp {
                        Some(dp) => {
                            dp.apply_port_status(&event);
                            self.dispatcher.dispatch_port_status(handle, &dp, &event);
                        }
                        None => {
                            self.dispatcher
                                .dispatch_message(handle, &message_type, None, &event);
                        }
                    },
                    _ => {
                        self.dispatcher
                            .dispatch_message(handle, &message_type, dp.as_ref(), &event);
                    }
                }
            }
        }
    }

    fn channel_up(
        &mut self,
        handle: &ControllerHandle,
        rpc: &Rpc,
        datapaths: &Arc<Mutex<DatapathTable>>,
        event: &Event,
    ) {
        let dp = match Datapath::from_channel_up(rpc.clone(), event) {
            Ok(dp) => dp,
            Err(error) => {
                warn!(%error, "dropping channel up");
                return;
            }
        };
        if let Err(error) = lock_table(datapaths).insert(dp.clone()) {
            warn!(%error, "dropping channel up");
            return;
        }
        info!(conn_id = dp.conn_id(), datapath = %dp.id(), version = dp.version(), "channel up");
        self.dispatcher.dispatch_channel_up(handle, &dp, event);
    }

    fn channel_down(
        &mut self,
        handle: &ControllerHandle,
        rpc: &Rpc,
        datapaths: &Arc<Mutex<DatapathTable>>,
        event: &Event,
    ) {
        let Some(conn_id) = event.conn_id() else {
            warn!("channel down without conn_id");
            return;
        };
        let Some(dp) = lock_table(datapaths).remove_conn(conn_id) else {
            debug!(conn_id, "channel down for unknown connection");
            return;
        };

        // Bookkeeping precedes dispatch: the datapath leaves the table and
        // its tasks are cancelled, so an awaiting task observes its
        // cancellation ordered after this event.
        dp.mark_closed();
        rpc.cancel_scope(&dp.scope_key());
        if dp.mark_down_dispatched() {
            debug!(conn_id, "suppressing duplicate channel down");
            return;
        }
        info!(conn_id, datapath = %dp.id(), "channel down");
        self.dispatcher.dispatch_channel_down(handle, &dp, event);
    }

    fn channel_alert(
        &mut self,
        handle: &ControllerHandle,
        rpc: &Rpc,
        datapaths: &Arc<Mutex<DatapathTable>>,
        event: Event,
    ) {
        // An alert answering one of our requests is a delivery failure.
        if let Some(xid) = event.xid() {
            if rpc.replies().contains(xid) {
                rpc.replies()
                    .deliver_error(xid, ReplyError::Delivery { xid, event });
                return;
            }
        }
        let dp = event
            .conn_id()
            .and_then(|conn_id| lock_table(datapaths).get_conn(conn_id));
        if dp.as_ref().is_some_and(Datapath::is_closed) {
            return;
        }
        self.dispatcher
            .dispatch_channel_alert(handle, dp.as_ref(), &event);
    }

    /// Force-closes whatever is still connected at shutdown so apps observe
    /// a channel down for every channel up.
    fn cleanup(
        &mut self,
        handle: &ControllerHandle,
        rpc: &Rpc,
        datapaths: &Arc<Mutex<DatapathTable>>,
    ) {
        let remaining = lock_table(datapaths).drain_all();
        for dp in remaining {
            dp.mark_closed();
            rpc.cancel_scope(&dp.scope_key());
            if dp.mark_down_dispatched() {
                continue;
            }
            let event = Event::message("CHANNEL_DOWN")
                .with("conn_id", json!(dp.conn_id()))
                .with("datapath_id", json!(dp.id().to_string()));
            self.dispatcher.dispatch_channel_down(handle, &dp, &event);
        }
    }
}

fn lock_table(table: &Arc<Mutex<DatapathTable>>) -> MutexGuard<'_, DatapathTable> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Routes engine output: RPC replies resolve their pending request
/// directly, everything else queues for dispatch. Posts `EXIT` when the
/// engine's stream ends.
async fn reader_pump(mut events: mpsc::UnboundedReceiver<Event>, rpc: Rpc) {
    while let Some(event) = events.recv().await {
        match event.kind() {
            EventKind::RpcReply(xid) => deliver_rpc_reply(&rpc, xid, &event),
            _ => rpc.post_event(event),
        }
    }
    debug!("backend event stream ended");
    rpc.post_event(Event::synthetic("EXIT"));
}

fn deliver_rpc_reply(rpc: &Rpc, xid: u32, event: &Event) {
    if let Some(error) = event.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        rpc.replies().deliver_error(
            xid,
            ReplyError::Rpc {
                xid,
                message,
                data: error.clone(),
            },
        );
    } else if let Some(result) = event.get("result") {
        let more = event::value_has_more(result);
        rpc.replies().deliver_result(xid, result.clone(), more);
    } else {
        warn!(xid, "rpc reply missing result and error");
    }
}

/// Ages out timed-out requests once per second.
async fn reply_sweeper(rpc: Rpc) {
    let mut ticker = time::interval(SWEEP_INTERVAL);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        rpc.replies().expire(time::Instant::now());
    }
}

#[cfg(unix)]
fn spawn_signal_tasks(
    config: &Configuration,
    rpc: &Rpc,
) -> Result<Vec<JoinHandle<()>>, ControllerError> {
    use tokio::signal::unix::{signal, SignalKind};

    use crate::config::ExitSignal;

    let mut tasks = Vec::new();
    for exit_signal in &config.exit_signals {
        let kind = match exit_signal {
            ExitSignal::Terminate => SignalKind::terminate(),
            ExitSignal::Interrupt => SignalKind::interrupt(),
        };
        let mut stream = signal(kind).map_err(ControllerError::Signal)?;
        let rpc = rpc.clone();
        let which = *exit_signal;
        tasks.push(tokio::spawn(async move {
            while stream.recv().await.is_some() {
                info!(signal = ?which, "signal received");
                if which == ExitSignal::Interrupt {
                    if let Some(task) = rpc.take_interruptible() {
                        task.cancel();
                        continue;
                    }
                }
                rpc.post_event(Event::synthetic("EXIT"));
            }
        }));
    }
    Ok(tasks)
}

#[cfg(not(unix))]
fn spawn_signal_tasks(
    _config: &Configuration,
    _rpc: &Rpc,
) -> Result<Vec<JoinHandle<()>>, ControllerError> {
    Ok(Vec::new())
}
