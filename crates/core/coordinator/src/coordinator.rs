use std::{collections::HashMap, future::Future, hash::Hash, sync::Arc};

use tokio::{
    sync::{
        watch::{channel as watch_channel, Receiver},
        RwLock,
    },
    task::AbortHandle,
};

use crate::Error;

/// Outcome of the most recently completed operation for a key.
pub type Outcome<V, E> = Result<Arc<V>, Error<E>>;

/// Shared handle to the operation currently running for a key.
struct InFlight<V, E> {
    outcome: Receiver<Option<Outcome<V, E>>>,
    abort: AbortHandle,
}

impl<V, E> Clone for InFlight<V, E> {
    fn clone(&self) -> Self {
        Self {
            outcome: self.outcome.clone(),
            abort: self.abort.clone(),
        }
    }
}

/// Both maps live behind a single lock: recording an outcome and clearing the
/// in-flight entry must be one transition, observed whole or not at all.
struct State<K, V, E> {
    running: HashMap<K, InFlight<V, E>>,
    outcomes: HashMap<K, Outcome<V, E>>,
}

/// Coalesces concurrent asynchronous work by key.
///
/// At most one operation runs per key at any time. Callers requesting a key
/// that is already in flight await the running operation instead of starting
/// duplicate work, and everyone waiting on the same key receives the same
/// value or error. Once an operation completes the key is immediately free
/// again; its result stays readable through
/// [`last_outcome`](TaskCoordinator::last_outcome) until the next completion
/// overwrites it, but is never used to short-circuit a new launch.
///
/// Cancellation is group-wide by design: dropping any waiting future, whether
/// the launcher's or an attached caller's, aborts the shared operation and
/// every remaining waiter receives [`Error::Cancelled`].
pub struct TaskCoordinator<K, V, E> {
    state: Arc<RwLock<State<K, V, E>>>,
}

impl<K, V, E> TaskCoordinator<K, V, E>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach to an already running operation.
    ///
    /// Resolves to `Ok(None)` immediately if nothing is in flight for `key`;
    /// no work is started and no state is created. Otherwise waits alongside
    /// the other callers and shares the operation's value or error.
    pub async fn attach(&self, key: &K) -> Result<Option<Arc<V>>, Error<E>> {
        let current = self.state.read().await.running.get(key).cloned();

        match current {
            Some(operation) => {
                debug!("attaching to an operation already in flight");
                self.wait_for(operation).await.map(Some)
            }
            None => Ok(None),
        }
    }

    /// Start a new operation for `key`, or attach to the one already running.
    ///
    /// `operation` is called exactly once per coalesced group; when this call
    /// lands on existing work the closure is never invoked. The closure only
    /// builds the future, which then runs as its own task.
    pub async fn launch_or_attach<F: FnOnce() -> Fut, Fut>(
        &self,
        key: K,
        operation: F,
    ) -> Result<Arc<V>, Error<E>>
    where
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let current = {
            let mut state = self.state.write().await;

            if let Some(existing) = state.running.get(&key) {
                debug!("coalescing into an operation already in flight");
                existing.clone()
            } else {
                let launched = self.launch(key.clone(), operation());
                state.running.insert(key, launched.clone());
                debug!("launched an operation, {} now in flight", state.running.len());
                launched
            }
        };

        self.wait_for(current).await
    }

    /// Last recorded outcome for `key`, if any operation for it has completed.
    ///
    /// Purely observational: never consulted when deciding whether to launch.
    pub async fn last_outcome(&self, key: &K) -> Option<Outcome<V, E>> {
        self.state.read().await.outcomes.get(key).cloned()
    }

    /// Number of operations currently in flight across all keys.
    pub async fn running_count(&self) -> usize {
        self.state.read().await.running.len()
    }

    /// Spawn the operation together with its bookkeeping task.
    ///
    /// The bookkeeping task is never aborted itself: whatever happens to the
    /// operation (value, error, abort, panic) it records the outcome and
    /// clears the in-flight entry in one critical section, then wakes the
    /// waiters. Waking strictly after clearing means a waiter that relaunches
    /// the key can never land on the finished entry.
    fn launch<Fut>(&self, key: K, operation: Fut) -> InFlight<V, E>
    where
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let (sender, receiver) = watch_channel(None);
        let task = tokio::spawn(operation);
        let abort = task.abort_handle();
        let state = Arc::clone(&self.state);

        tokio::spawn(async move {
            let outcome = match task.await {
                Ok(Ok(value)) => Ok(Arc::new(value)),
                Ok(Err(error)) => Err(Error::Operation(Arc::new(error))),
                Err(reason) if reason.is_cancelled() => Err(Error::Cancelled),
                Err(_) => Err(Error::Panicked),
            };

            {
                let mut state = state.write().await;
                state.outcomes.insert(key.clone(), outcome.clone());
                state.running.remove(&key);
            }

            match &outcome {
                Ok(_) => debug!("operation completed, outcome recorded"),
                Err(Error::Cancelled) => debug!("operation cancelled, outcome recorded"),
                Err(_) => debug!("operation failed, outcome recorded"),
            }

            sender.send_modify(|slot| {
                slot.replace(outcome);
            });
        });

        InFlight {
            outcome: receiver,
            abort,
        }
    }

    /// Wait on a shared in-flight operation through the cancellation bridge:
    /// dropping this wait aborts the operation for the whole group.
    async fn wait_for(&self, operation: InFlight<V, E>) -> Result<Arc<V>, Error<E>> {
        let InFlight { mut outcome, abort } = operation;
        let guard = AbortOnDrop::new(abort);

        let result = outcome
            .wait_for(|slot| slot.is_some())
            .await
            .map_err(|_| Error::RecvError)
            .and_then(|slot| slot.clone().unwrap());

        guard.disarm();
        result
    }
}

impl<K, V, E> Default for TaskCoordinator<K, V, E> {
    fn default() -> Self {
        Self {
            state: Arc::new(RwLock::new(State {
                running: HashMap::new(),
                outcomes: HashMap::new(),
            })),
        }
    }
}

impl<K, V, E> Clone for TaskCoordinator<K, V, E> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

/// Aborts the shared operation if the waiter is dropped before an outcome
/// arrives.
struct AbortOnDrop {
    handle: AbortHandle,
    armed: bool,
}

impl AbortOnDrop {
    fn new(handle: AbortHandle) -> Self {
        Self { handle, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        if self.armed {
            debug!("waiter dropped mid-flight, aborting the shared operation");
            self.handle.abort();
        }
    }
}
