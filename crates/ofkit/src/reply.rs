use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use serde_json::Value;
use thiserror::Error;
use tokio::{sync::Notify, time::Instant};
use tracing::{debug, warn};

use crate::{error::ControllerError, event::Event};

pub(crate) const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Terminal failure delivered through a [`ReplyHandle`].
#[derive(Debug, Error)]
pub enum ReplyError {
    /// The engine returned an `error` object for the request.
    #[error("rpc error for xid {xid}: {message}")]
    Rpc {
        xid: u32,
        message: String,
        data: Value,
    },
    /// The engine delivered an OpenFlow `ERROR` message for the request.
    #[error("openflow error reply for xid {xid}")]
    Message { xid: u32, event: Event },
    /// A `CHANNEL_ALERT` reported the request as undeliverable.
    #[error("delivery failed for xid {xid}")]
    Delivery { xid: u32, event: Event },
    #[error("request xid {0} timed out")]
    Timeout(u32),
    /// The handle was awaited again after its final reply.
    #[error("no further replies for xid {0}")]
    InvalidState(u32),
}

struct ReplyState {
    queue: VecDeque<Result<Value, ReplyError>>,
    done: bool,
}

struct ReplyShared {
    xid: u32,
    state: Mutex<ReplyState>,
    notify: Notify,
}

impl ReplyShared {
    fn lock(&self) -> MutexGuard<'_, ReplyState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, entry: Result<Value, ReplyError>, done: bool) {
        let mut state = self.lock();
        state.queue.push_back(entry);
        if done {
            state.done = true;
        }
        drop(state);
        self.notify.notify_one();
    }

    fn finish(&self) {
        self.lock().done = true;
        self.notify.notify_one();
    }
}

/// Receiver for the replies to one request.
///
/// A request produces one or more replies followed by a terminal marker
/// (final reply, error, or timeout). Await single replies with
/// [`ReplyHandle::next`], or drain the full sequence with
/// [`ReplyHandle::recv`] in a `while let` loop.
pub struct ReplyHandle {
    shared: Arc<ReplyShared>,
}

impl ReplyHandle {
    pub fn xid(&self) -> u32 {
        self.shared.xid
    }

    /// True once the final reply has been consumed.
    pub fn is_done(&self) -> bool {
        let state = self.shared.lock();
        state.done && state.queue.is_empty()
    }

    /// Returns the next reply, suspending until one is delivered.
    ///
    /// Fails with [`ReplyError::InvalidState`] when called again after the
    /// sequence terminated.
    pub async fn next(&mut self) -> Result<Value, ReplyError> {
        loop {
            let notified = self.shared.notify.notified();
            {
                let mut state = self.shared.lock();
                if let Some(entry) = state.queue.pop_front() {
                    return entry;
                }
                if state.done {
                    return Err(ReplyError::InvalidState(self.shared.xid));
                }
            }
            notified.await;
        }
    }

    /// Iteration-friendly variant of [`ReplyHandle::next`]: returns
    /// `Ok(None)` once the sequence terminated.
    pub async fn recv(&mut self) -> Result<Option<Value>, ReplyError> {
        match self.next().await {
            Ok(value) => Ok(Some(value)),
            Err(ReplyError::InvalidState(_)) => Ok(None),
            Err(error) => Err(error),
        }
    }
}

impl fmt::Debug for ReplyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplyHandle")
            .field("xid", &self.shared.xid)
            .finish_non_exhaustive()
    }
}

impl Drop for ReplyHandle {
    fn drop(&mut self) {
        let state = self.shared.lock();
        if !state.queue.is_empty() {
            warn!(
                xid = self.shared.xid,
                unread = state.queue.len(),
                "dropping reply handle with unread replies"
            );
        }
    }
}

struct Tracked {
    shared: Arc<ReplyShared>,
    deadline: Instant,
}

/// Correlates request xids with their reply handles.
///
/// A handle is either tracked here (more replies expected) or removed
/// (terminal delivery happened). Deliveries for unknown xids are logged and
/// dropped; they are usually late replies to a request that timed out.
#[derive(Clone)]
pub(crate) struct ReplyTracker {
    inner: Arc<Mutex<HashMap<u32, Tracked>>>,
}

impl ReplyTracker {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u32, Tracked>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn register(
        &self,
        xid: u32,
        timeout: Duration,
    ) -> Result<ReplyHandle, ControllerError> {
        let shared = Arc::new(ReplyShared {
            xid,
            state: Mutex::new(ReplyState {
                queue: VecDeque::new(),
                done: false,
            }),
            notify: Notify::new(),
        });
        let tracked = Tracked {
            shared: Arc::clone(&shared),
            deadline: Instant::now() + timeout,
        };

        let mut table = self.lock();
        if table.contains_key(&xid) {
            return Err(ControllerError::DuplicateXid(xid));
        }
        table.insert(xid, tracked);
        Ok(ReplyHandle { shared })
    }

    pub(crate) fn contains(&self, xid: u32) -> bool {
        self.lock().contains_key(&xid)
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    /// Appends a reply. When `more` is false this is the terminal delivery
    /// and the xid is released.
    pub(crate) fn deliver_result(&self, xid: u32, value: Value, more: bool) {
        let entry = {
            let mut table = self.lock();
            if more {
                table.get(&xid).map(|tracked| Arc::clone(&tracked.shared))
            } else {
                table.remove(&xid).map(|tracked| tracked.shared)
            }
        };
        match entry {
            Some(shared) => shared.push(Ok(value), !more),
            None => warn!(xid, "reply for unknown xid"),
        }
    }

    /// Delivers a terminal error and releases the xid.
    pub(crate) fn deliver_error(&self, xid: u32, error: ReplyError) {
        let entry = self.lock().remove(&xid).map(|tracked| tracked.shared);
        match entry {
            Some(shared) => shared.push(Err(error), true),
            None => warn!(xid, "error reply for unknown xid"),
        }
    }

    /// Removes a registration without delivering anything.
    pub(crate) fn discard(&self, xid: u32) {
        if let Some(tracked) = self.lock().remove(&xid) {
            tracked.shared.finish();
        }
    }

    /// Ages out requests whose deadline has passed. Called by the sweeper
    /// once per second.
    pub(crate) fn expire(&self, now: Instant) {
        let expired: Vec<u32> = self
            .lock()
            .iter()
            .filter(|(_, tracked)| tracked.deadline <= now)
            .map(|(xid, _)| *xid)
            .collect();
        for xid in expired {
            debug!(xid, "request timed out");
            self.deliver_error(xid, ReplyError::Timeout(xid));
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn single_reply_resolves_pending_await() {
        let tracker = ReplyTracker::new();
        let mut handle = tracker.register(9000, Duration::from_secs(10)).expect("register");

        let deliver = {
            let tracker = tracker.clone();
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                tracker.deliver_result(9000, json!({"ok": true}), false);
            })
        };

        assert_eq!(handle.next().await.expect("reply"), json!({"ok": true}));
        assert!(handle.is_done());
        assert_eq!(tracker.len(), 0);
        deliver.await.expect("join");
    }

    #[tokio::test]
    async fn multipart_replies_arrive_in_order_then_invalid_state() {
        let tracker = ReplyTracker::new();
        let mut handle = tracker.register(9001, Duration::from_secs(10)).expect("register");

        tracker.deliver_result(9001, json!(1), true);
        tracker.deliver_result(9001, json!(2), true);
        tracker.deliver_result(9001, json!(3), false);

        assert_eq!(handle.next().await.expect("first"), json!(1));
        assert_eq!(handle.next().await.expect("second"), json!(2));
        assert_eq!(handle.next().await.expect("third"), json!(3));
        assert!(matches!(
            handle.next().await,
            Err(ReplyError::InvalidState(9001))
        ));
    }

    #[tokio::test]
    async fn error_is_terminal() {
        let tracker = ReplyTracker::new();
        let mut handle = tracker.register(9002, Duration::from_secs(10)).expect("register");

        tracker.deliver_error(
            9002,
            ReplyError::Rpc {
                xid: 9002,
                message: "bad request".to_string(),
                data: json!({}),
            },
        );

        assert!(matches!(handle.next().await, Err(ReplyError::Rpc { .. })));
        assert!(matches!(
            handle.next().await,
            Err(ReplyError::InvalidState(9002))
        ));
        assert!(!tracker.contains(9002));
    }

    #[tokio::test]
    async fn expiry_delivers_timeout() {
        let tracker = ReplyTracker::new();
        let mut handle = tracker.register(9003, Duration::from_secs(10)).expect("register");

        tracker.expire(Instant::now() + Duration::from_secs(11));
        assert!(matches!(
            handle.next().await,
            Err(ReplyError::Timeout(9003))
        ));
        assert_eq!(tracker.len(), 0);
    }

    #[tokio::test]
    async fn duplicate_xid_is_rejected_and_late_delivery_is_dropped() {
        let tracker = ReplyTracker::new();
        let _handle = tracker.register(9004, Duration::from_secs(10)).expect("register");
        assert!(matches!(
            tracker.register(9004, Duration::from_secs(10)),
            Err(ControllerError::DuplicateXid(9004))
        ));

        // Unknown xid: logged and otherwise a no-op.
        tracker.deliver_result(1, json!(null), false);
        tracker.deliver_error(2, ReplyError::Timeout(2));
    }

    #[tokio::test]
    async fn recv_drains_until_none() {
        let tracker = ReplyTracker::new();
        let mut handle = tracker.register(9005, Duration::from_secs(10)).expect("register");
        tracker.deliver_result(9005, json!("a"), true);
        tracker.deliver_result(9005, json!("b"), false);

        let mut seen = Vec::new();
        while let Some(value) = handle.recv().await.expect("recv") {
            seen.push(value);
        }
        assert_eq!(seen, vec![json!("a"), json!("b")]);
    }
}
