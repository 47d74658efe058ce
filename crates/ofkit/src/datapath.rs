use std::{
    collections::HashMap,
    fmt,
    future::Future,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use serde_json::{json, Map, Value};
use tracing::debug;

use crate::{
    error::ControllerError,
    event::Event,
    reply::ReplyHandle,
    rpc::{Rpc, TaskScope},
    tasklist::TaskRef,
};

/// 64-bit OpenFlow datapath identifier, rendered as colon-separated hex
/// (`00:00:00:00:00:00:00:01`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DatapathId(pub u64);

impl FromStr for DatapathId {
    type Err = ControllerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex: String = s.chars().filter(|c| *c != ':').collect();
        if hex.is_empty() || hex.len() > 16 {
            return Err(ControllerError::BadDatapathId(s.to_string()));
        }
        u64::from_str_radix(&hex, 16)
            .map(DatapathId)
            .map_err(|_| ControllerError::BadDatapathId(s.to_string()))
    }
}

impl fmt::Display for DatapathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.0.to_be_bytes();
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7]
        )
    }
}

struct DatapathInner {
    conn_id: u64,
    id: DatapathId,
    version: u8,
    endpoint: Option<String>,
    closed: AtomicBool,
    down_dispatched: AtomicBool,
    ports: Mutex<Map<String, Value>>,
    rpc: Rpc,
}

/// User-visible handle for one connected switch.
///
/// Cheap to clone; all clones observe the same `closed` flag and port
/// table. Messages sent through a datapath are stamped with its
/// `datapath_id` and `conn_id`.
#[derive(Clone)]
pub struct Datapath {
    inner: Arc<DatapathInner>,
}

impl Datapath {
    pub(crate) fn from_channel_up(rpc: Rpc, event: &Event) -> Result<Self, ControllerError> {
        let conn_id = event.conn_id().ok_or(ControllerError::MalformedChannelUp)?;
        let id: DatapathId = event
            .datapath_id()
            .ok_or(ControllerError::MalformedChannelUp)?
            .parse()?;
        let version = event.get_u64("version").unwrap_or_default() as u8;
        let endpoint = event.get_str("endpoint").map(str::to_owned);

        let mut ports = Map::new();
        if let Some(list) = event
            .get("features")
            .and_then(|features| features.get("ports"))
            .and_then(Value::as_array)
        {
            for port in list {
                if let Some(key) = port_key(port) {
                    ports.insert(key, port.clone());
                }
            }
        }

        Ok(Self {
            inner: Arc::new(DatapathInner {
                conn_id,
                id,
                version,
                endpoint,
                closed: AtomicBool::new(false),
                down_dispatched: AtomicBool::new(false),
                ports: Mutex::new(ports),
                rpc,
            }),
        })
    }

    pub fn conn_id(&self) -> u64 {
        self.inner.conn_id
    }

    pub fn id(&self) -> DatapathId {
        self.inner.id
    }

    /// OpenFlow version negotiated for this connection.
    pub fn version(&self) -> u8 {
        self.inner.version
    }

    /// Remote endpoint reported at channel up, when known.
    pub fn endpoint(&self) -> Option<&str> {
        self.inner.endpoint.as_deref()
    }

    /// Once closed, further events for this datapath are dropped before
    /// dispatch.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Snapshot of the port table.
    pub fn ports(&self) -> Map<String, Value> {
        self.lock_ports().clone()
    }

    pub(crate) fn scope_key(&self) -> String {
        self.inner.id.to_string()
    }

    /// Fire-and-forget OpenFlow message to this switch.
    pub fn send(&self, msg: Event) -> Result<(), ControllerError> {
        if self.is_closed() {
            return Err(ControllerError::DatapathClosed(self.inner.id));
        }
        self.inner.rpc.send_message(self.stamp(msg))
    }

    /// OpenFlow request to this switch; replies arrive on the returned
    /// handle.
    pub fn request(&self, msg: Event) -> Result<ReplyHandle, ControllerError> {
        if self.is_closed() {
            return Err(ControllerError::DatapathClosed(self.inner.id));
        }
        self.inner.rpc.request_message(self.stamp(msg))
    }

    /// Spawns a task scoped to this datapath. The task is cancelled when
    /// the channel goes down or the datapath is force-closed.
    pub fn create_task<F>(&self, future: F) -> TaskRef
    where
        F: Future<Output = Result<(), anyhow::Error>> + Send + 'static,
    {
        let locals = TaskScope {
            datapath_id: Some(self.inner.id),
            conn_id: Some(self.inner.conn_id),
        };
        self.inner.rpc.spawn(Some(self.scope_key()), locals, future)
    }

    /// Closes this datapath.
    ///
    /// Without `force`, asks the engine to close the connection and lets
    /// the natural `CHANNEL_DOWN` flow through dispatch. With `force`, the
    /// datapath is closed immediately: its tasks are cancelled, a synthetic
    /// `CHANNEL_DOWN` is posted, and the engine's own `CHANNEL_DOWN` is
    /// suppressed so apps observe exactly one.
    pub fn close(&self, force: bool) {
        if !force {
            let _ = self
                .inner
                .rpc
                .rpc_call("OFP.CLOSE", json!({"conn_id": self.inner.conn_id}));
            return;
        }
        if self.mark_closed() {
            return;
        }
        debug!(conn_id = self.inner.conn_id, datapath = %self.inner.id, "force closing datapath");
        self.inner.rpc.cancel_scope(&self.scope_key());
        self.inner.rpc.post_event(
            Event::message("CHANNEL_DOWN")
                .with("conn_id", json!(self.inner.conn_id))
                .with("datapath_id", json!(self.inner.id.to_string()))
                .with("reason", json!("force_closed")),
        );
    }

    /// Sets the closed flag, returning the previous value.
    pub(crate) fn mark_closed(&self) -> bool {
        self.inner.closed.swap(true, Ordering::SeqCst)
    }

    /// Records that a channel-down was dispatched for this datapath,
    /// returning whether one already was.
    pub(crate) fn mark_down_dispatched(&self) -> bool {
        self.inner.down_dispatched.swap(true, Ordering::SeqCst)
    }

    /// Applies a PORT_STATUS message to the port table.
    pub(crate) fn apply_port_status(&self, event: &Event) {
        let Some(msg) = event.get("msg") else {
            return;
        };
        let Some(key) = port_key(msg) else {
            return;
        };
        let reason = msg.get("reason").and_then(Value::as_str).unwrap_or("");
        let mut ports = self.lock_ports();
        if reason == "DELETE" {
            ports.remove(&key);
        } else {
            ports.insert(key, msg.clone());
        }
    }

    fn stamp(&self, mut msg: Event) -> Event {
        if !msg.contains("datapath_id") {
            msg.insert("datapath_id", json!(self.inner.id.to_string()));
        }
        if !msg.contains("conn_id") {
            msg.insert("conn_id", json!(self.inner.conn_id));
        }
        msg
    }

    fn lock_ports(&self) -> MutexGuard<'_, Map<String, Value>> {
        self.inner
            .ports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Datapath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Datapath")
            .field("id", &self.inner.id)
            .field("conn_id", &self.inner.conn_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn port_key(port: &Value) -> Option<String> {
    match port.get("port_no") {
        Some(Value::String(name)) => Some(name.clone()),
        Some(Value::Number(number)) => Some(number.to_string()),
        _ => None,
    }
}

/// Bidirectional index of connected datapaths: one entry per connection,
/// one per datapath id, always in step.
#[derive(Default)]
pub(crate) struct DatapathTable {
    by_conn: HashMap<u64, Datapath>,
    by_dpid: HashMap<DatapathId, Datapath>,
}

impl DatapathTable {
    pub(crate) fn insert(&mut self, dp: Datapath) -> Result<(), ControllerError> {
        if self.by_conn.contains_key(&dp.conn_id()) {
            return Err(ControllerError::DuplicateConn(dp.conn_id()));
        }
        if self.by_dpid.contains_key(&dp.id()) {
            return Err(ControllerError::DuplicateDatapath(dp.id()));
        }
        self.by_conn.insert(dp.conn_id(), dp.clone());
        self.by_dpid.insert(dp.id(), dp);
        Ok(())
    }

    pub(crate) fn remove_conn(&mut self, conn_id: u64) -> Option<Datapath> {
        let dp = self.by_conn.remove(&conn_id)?;
        self.by_dpid.remove(&dp.id());
        Some(dp)
    }

    pub(crate) fn get_conn(&self, conn_id: u64) -> Option<Datapath> {
        self.by_conn.get(&conn_id).cloned()
    }

    pub(crate) fn get_dpid(&self, id: DatapathId) -> Option<Datapath> {
        self.by_dpid.get(&id).cloned()
    }

    pub(crate) fn all(&self) -> Vec<Datapath> {
        self.by_conn.values().cloned().collect()
    }

    pub(crate) fn drain_all(&mut self) -> Vec<Datapath> {
        self.by_dpid.clear();
        self.by_conn.drain().map(|(_, dp)| dp).collect()
    }

    pub(crate) fn len(&self) -> usize {
        debug_assert_eq!(self.by_conn.len(), self.by_dpid.len());
        self.by_conn.len()
    }
}
