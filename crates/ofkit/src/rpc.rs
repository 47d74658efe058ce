use std::{
    future::Future,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::debug;

use crate::{
    controller::Phase,
    datapath::DatapathId,
    error::ControllerError,
    event::Event,
    reply::{ReplyHandle, ReplyTracker},
    tasklist::{TaskList, TaskRef},
};

/// First xid handed to requests; lower values are reserved for the engine
/// and the framework.
pub(crate) const MIN_XID: u32 = 8092;

tokio::task_local! {
    static TASK_SCOPE: TaskScope;
}

/// Datapath context propagated into tasks so that `send`/`request` can
/// infer the target connection without explicit arguments.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct TaskScope {
    pub(crate) datapath_id: Option<DatapathId>,
    pub(crate) conn_id: Option<u64>,
}

struct RpcInner {
    writer: mpsc::UnboundedSender<Value>,
    queue: mpsc::UnboundedSender<Event>,
    replies: ReplyTracker,
    tasks: TaskList,
    xid: AtomicU32,
    phase: Mutex<Phase>,
    interruptible: Mutex<Option<TaskRef>>,
    request_timeout: Duration,
}

/// Shared request/task surface behind the controller and datapath handles.
///
/// Owns the xid counter, the frame writer, the reply table, and the task
/// registry. Cheap to clone; holds no datapath state.
#[derive(Clone)]
pub(crate) struct Rpc {
    inner: Arc<RpcInner>,
}

impl Rpc {
    pub(crate) fn new(
        writer: mpsc::UnboundedSender<Value>,
        queue: mpsc::UnboundedSender<Event>,
        replies: ReplyTracker,
        tasks: TaskList,
        request_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(RpcInner {
                writer,
                queue,
                replies,
                tasks,
                xid: AtomicU32::new(MIN_XID),
                phase: Mutex::new(Phase::Init),
                interruptible: Mutex::new(None),
                request_timeout,
            }),
        }
    }

    /// Next xid, wrapping from the top of the 32-bit space back to
    /// [`MIN_XID`].
    pub(crate) fn next_xid(&self) -> u32 {
        let previous = self
            .inner
            .xid
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |xid| {
                Some(if xid == u32::MAX { MIN_XID } else { xid + 1 })
            })
            .unwrap_or(MIN_XID);
        if previous == u32::MAX {
            MIN_XID
        } else {
            previous + 1
        }
    }

    pub(crate) fn write(&self, frame: Value) -> Result<(), ControllerError> {
        self.inner
            .writer
            .send(frame)
            .map_err(|_| ControllerError::ChannelClosed)
    }

    /// Sends an RPC request and returns the handle awaiting its reply.
    pub(crate) fn rpc_call(
        &self,
        method: &str,
        params: Value,
    ) -> Result<ReplyHandle, ControllerError> {
        let xid = self.next_xid();
        debug!(method, xid, "rpc call");
        let handle = self
            .inner
            .replies
            .register(xid, self.inner.request_timeout)?;
        if let Err(error) = self.write(json!({"id": xid, "method": method, "params": params})) {
            self.inner.replies.discard(xid);
            return Err(error);
        }
        Ok(handle)
    }

    /// Fire-and-forget OpenFlow message.
    pub(crate) fn send_message(&self, msg: Event) -> Result<(), ControllerError> {
        let msg = self.prepare(msg)?;
        self.write(json!({"method": "OFP.SEND", "params": msg.into_value()}))
    }

    /// OpenFlow message expecting one or more replies correlated by xid.
    pub(crate) fn request_message(&self, msg: Event) -> Result<ReplyHandle, ControllerError> {
        let msg = self.prepare(msg)?;
        let xid = msg.xid().unwrap_or_default();
        let handle = self
            .inner
            .replies
            .register(xid, self.inner.request_timeout)?;
        if let Err(error) = self.write(json!({"method": "OFP.SEND", "params": msg.into_value()})) {
            self.inner.replies.discard(xid);
            return Err(error);
        }
        Ok(handle)
    }

    /// Fills in the xid and the datapath scope of an outgoing message.
    /// The connection is inferred from the calling task's context when the
    /// message names neither a `datapath_id` nor a `conn_id`.
    fn prepare(&self, mut msg: Event) -> Result<Event, ControllerError> {
        if msg.event_type().is_none() {
            return Err(ControllerError::MissingType);
        }
        if msg.xid().is_none() {
            msg.insert("xid", json!(self.next_xid()));
        }

        if !msg.contains("datapath_id") || !msg.contains("conn_id") {
            let scope = TASK_SCOPE.try_with(|scope| *scope).unwrap_or_default();
            if !msg.contains("datapath_id") {
                if let Some(datapath_id) = scope.datapath_id {
                    msg.insert("datapath_id", json!(datapath_id.to_string()));
                }
            }
            if !msg.contains("conn_id") {
                if let Some(conn_id) = scope.conn_id {
                    msg.insert("conn_id", json!(conn_id));
                }
            }
        }

        if !msg.contains("datapath_id") && !msg.contains("conn_id") {
            return Err(ControllerError::NoDatapath);
        }
        Ok(msg)
    }

    /// Posts a synthetic event onto the dispatch queue.
    pub(crate) fn post_event(&self, event: Event) {
        if self.inner.queue.send(event).is_err() {
            debug!("event queue closed; dropping posted event");
        }
    }

    /// Spawns a task under `scope` (or the current phase) with the given
    /// datapath context.
    pub(crate) fn spawn<F>(&self, scope: Option<String>, locals: TaskScope, future: F) -> TaskRef
    where
        F: Future<Output = Result<(), anyhow::Error>> + Send + 'static,
    {
        let scope = scope.unwrap_or_else(|| self.phase().to_string());
        self.inner.tasks.spawn(&scope, TASK_SCOPE.scope(locals, future))
    }

    pub(crate) fn cancel_scope(&self, scope: &str) {
        self.inner.tasks.cancel(scope);
    }

    pub(crate) fn tasks(&self) -> &TaskList {
        &self.inner.tasks
    }

    pub(crate) fn replies(&self) -> &ReplyTracker {
        &self.inner.replies
    }

    pub(crate) fn phase(&self) -> Phase {
        *self.lock_phase()
    }

    pub(crate) fn set_phase(&self, phase: Phase) {
        *self.lock_phase() = phase;
    }

    fn lock_phase(&self) -> MutexGuard<'_, Phase> {
        self.inner
            .phase
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_interruptible(&self, task: TaskRef) {
        *self
            .inner
            .interruptible
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);
    }

    pub(crate) fn take_interruptible(&self) -> Option<TaskRef> {
        self.inner
            .interruptible
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}
