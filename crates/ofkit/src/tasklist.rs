use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::{sync::mpsc, time};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Scope keys that cancel every task regardless of scope.
const GLOBAL_SCOPES: [&str; 2] = ["START", "STOP"];

/// Cancellation handle for a task spawned through the registry.
#[derive(Clone, Debug)]
pub struct TaskRef {
    token: CancellationToken,
}

impl TaskRef {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    scopes: HashMap<String, HashMap<u64, CancellationToken>>,
}

impl Registry {
    fn task_count(&self) -> usize {
        self.scopes.values().map(HashMap::len).sum()
    }
}

/// Background tasks grouped by scope key (a phase name or a datapath id).
///
/// Task bodies are wrapped so that neither cancellation nor failure escapes:
/// a cancelled body is dropped at its next suspension point, and a failed
/// body is reported through the failure channel. The wrapper removes its
/// registry entry exactly once, when the task reaches a terminal state.
#[derive(Clone)]
pub(crate) struct TaskList {
    inner: Arc<Mutex<Registry>>,
    idle: Arc<tokio::sync::Notify>,
    failures: mpsc::UnboundedSender<anyhow::Error>,
}

impl TaskList {
    pub(crate) fn new(failures: mpsc::UnboundedSender<anyhow::Error>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Registry::default())),
            idle: Arc::new(tokio::sync::Notify::new()),
            failures,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn spawn<F>(&self, scope: &str, future: F) -> TaskRef
    where
        F: Future<Output = Result<(), anyhow::Error>> + Send + 'static,
    {
        let token = CancellationToken::new();
        let id = {
            let mut registry = self.lock();
            let id = registry.next_id;
            registry.next_id += 1;
            registry
                .scopes
                .entry(scope.to_string())
                .or_default()
                .insert(id, token.clone());
            id
        };

        let scope = scope.to_string();
        let task_token = token.clone();
        let inner = Arc::clone(&self.inner);
        let idle = Arc::clone(&self.idle);
        let failures = self.failures.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = task_token.cancelled() => {
                    debug!(scope = %scope, "task cancelled");
                }
                result = future => {
                    if let Err(error) = result {
                        let _ = failures.send(error);
                    }
                }
            }

            let mut registry = inner.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(tasks) = registry.scopes.get_mut(&scope) {
                tasks.remove(&id);
                if tasks.is_empty() {
                    registry.scopes.remove(&scope);
                }
            }
            drop(registry);
            idle.notify_waiters();
        });

        TaskRef { token }
    }

    /// Cancel every task under `scope`. The phase scopes `START` and `STOP`
    /// cancel all tasks across all scopes.
    pub(crate) fn cancel(&self, scope: &str) {
        if GLOBAL_SCOPES.contains(&scope) {
            self.cancel_all();
            return;
        }
        let registry = self.lock();
        if let Some(tasks) = registry.scopes.get(scope) {
            debug!(scope, tasks = tasks.len(), "cancelling scope");
            for token in tasks.values() {
                token.cancel();
            }
        }
    }

    pub(crate) fn cancel_all(&self) {
        let registry = self.lock();
        for tasks in registry.scopes.values() {
            for token in tasks.values() {
                token.cancel();
            }
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.lock().task_count() == 0
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().task_count()
    }

    /// Cancel everything and wait for the registry to empty, giving each
    /// attempt up to `timeout`. Retried because draining tasks may spawn
    /// further tasks.
    pub(crate) async fn drain(&self, attempts: u32, timeout: Duration) {
        for attempt in 0..attempts {
            if self.is_empty() {
                return;
            }
            debug!(attempt, tasks = self.len(), "draining tasks");
            self.cancel_all();

            let deadline = time::Instant::now() + timeout;
            loop {
                let notified = self.idle.notified();
                if self.is_empty() {
                    break;
                }
                if time::timeout_at(deadline, notified).await.is_err() {
                    break;
                }
            }
        }
        if !self.is_empty() {
            warn!(remaining = self.len(), "tasks still pending after drain");
        }
    }
}
