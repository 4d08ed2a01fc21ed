//! Lazily opened, reference-counted shared connection.
//!
//! The [`LazyConnectionManager`] keeps at most one physical connection. The
//! first [`lease`](LazyConnectionManager::lease) starts a connection attempt;
//! every lease requested while that attempt is pending or the connection is
//! open shares it. Each lease adds one lock. When the last lock is released the
//! connection is completed gracefully, and once its terminal signal settles the
//! next lease starts a fresh attempt.
//!
//! ```text
//! lease() ──► no slot ──► start attempt ──┐
//!         └─► slot    ──► join attempt ───┴─► locks += 1 ─► Lease
//!
//! Releaser::release() ──► locks -= 1 ──► locks == 0 ──► Completer::complete()
//! Terminal settles    ──► slot cleared ──► next lease() opens a new connection
//! ```

use std::{
    fmt,
    sync::{Arc, Weak},
};

use futures_util::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::{
    config::MuxConfig,
    connection::{Completer, Connected, ConnectionHandle, Connector, WsConnector},
    error::{MuxError, MuxResult},
    terminal::Terminal,
};

type Attempt = Shared<BoxFuture<'static, MuxResult<Connected>>>;

/// Remembered connection attempt and its lock count.
struct Slot {
    generation: u64,
    attempt: Attempt,
    locks: usize,
    /// The graceful close has been requested; the slot only waits for its terminal.
    closing: bool,
}

impl Slot {
    fn completer(&self) -> Option<Completer> {
        match self.attempt.peek() {
            Some(Ok((_, completer, _))) => Some(completer.clone()),
            _ => None,
        }
    }

    /// The attempt failed or the connection already reached its final state.
    fn is_dead(&self) -> bool {
        match self.attempt.peek() {
            Some(Ok((_, _, terminal))) => terminal.is_settled(),
            Some(Err(_)) => true,
            None => false,
        }
    }
}

#[derive(Default)]
struct ManagerState {
    slot: Option<Slot>,
    next_generation: u64,
}

struct ManagerInner {
    connector: Arc<dyn Connector>,
    config: MuxConfig,
    state: Mutex<ManagerState>,
}

enum Claim {
    /// Lock taken on a pending or open connection.
    Join { generation: u64, attempt: Attempt },
    /// The current connection is closing; wait for it before starting over.
    AwaitClose { generation: u64, attempt: Attempt },
}

impl ManagerInner {
    fn claim(self: &Arc<Self>) -> Claim {
        let mut state = self.state.lock();

        if let Some(slot) = state.slot.as_mut()
            && !slot.is_dead()
        {
            if slot.closing {
                return Claim::AwaitClose {
                    generation: slot.generation,
                    attempt: slot.attempt.clone(),
                };
            }
            slot.locks += 1;
            debug!(
                generation = slot.generation,
                locks = slot.locks,
                "Joined shared connection"
            );
            return Claim::Join {
                generation: slot.generation,
                attempt: slot.attempt.clone(),
            };
        }

        let generation = state.next_generation;
        state.next_generation += 1;
        let attempt = self.start_attempt(generation);
        state.slot = Some(Slot {
            generation,
            attempt: attempt.clone(),
            locks: 1,
            closing: false,
        });
        Claim::Join {
            generation,
            attempt,
        }
    }

    fn start_attempt(self: &Arc<Self>, generation: u64) -> Attempt {
        debug!(generation, "Opening shared connection");
        let connector = Arc::clone(&self.connector);
        let attempt = async move { connector.connect().await }.boxed().shared();
        tokio::spawn(supervise(
            Arc::downgrade(self),
            generation,
            attempt.clone(),
        ));
        attempt
    }

    fn unlock(&self, generation: u64) {
        {
            let mut state = self.state.lock();
            match state.slot.as_mut() {
                Some(slot) if slot.generation == generation => {
                    slot.locks = slot.locks.saturating_sub(1);
                    debug!(generation, locks = slot.locks, "Released shared connection");
                }
                _ => return,
            }
        }
        self.complete_if_unused(generation);
    }

    /// Request the graceful close once nothing holds a lock on an open connection.
    fn complete_if_unused(&self, generation: u64) {
        let completer = {
            let mut state = self.state.lock();
            match state.slot.as_mut() {
                Some(slot) if slot.generation == generation && slot.locks == 0 && !slot.closing => {
                    let completer = slot.completer();
                    slot.closing = completer.is_some();
                    completer
                }
                _ => None,
            }
        };
        if let Some(completer) = completer {
            info!(generation, "No leases left, completing shared connection");
            completer.complete();
        }
    }

    fn retire(&self, generation: u64) {
        let mut state = self.state.lock();
        if state
            .slot
            .as_ref()
            .is_some_and(|slot| slot.generation == generation)
        {
            state.slot = None;
            debug!(generation, "Forgot shared connection");
        }
    }
}

/// Follows one attempt to its end and clears the slot afterwards.
async fn supervise(inner: Weak<ManagerInner>, generation: u64, attempt: Attempt) {
    let terminal = match attempt.await {
        Ok((_, _, terminal)) => terminal,
        Err(err) => {
            debug!(generation, error = %err, "Shared connection attempt failed");
            if let Some(inner) = inner.upgrade() {
                inner.retire(generation);
            }
            return;
        }
    };

    // Every lease may have gone away while the attempt was pending.
    if let Some(inner) = inner.upgrade() {
        inner.complete_if_unused(generation);
    }

    match terminal.wait().await {
        Ok(()) => debug!(generation, "Shared connection completed"),
        Err(err) => debug!(generation, error = %err, "Shared connection closed"),
    }
    if let Some(inner) = inner.upgrade() {
        inner.retire(generation);
    }
}

/// Lazily shared connection with reference-counted leases.
///
/// Cheap to clone; clones share the same connection and lock count.
#[derive(Clone)]
pub struct LazyConnectionManager {
    inner: Arc<ManagerInner>,
}

impl fmt::Debug for LazyConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyConnectionManager")
            .field("url", &self.inner.config.url)
            .field("locks", &self.lock_count())
            .finish()
    }
}

impl LazyConnectionManager {
    /// Create a manager that dials `config.url` with [`WsConnector`].
    ///
    /// No connection is opened until the first lease.
    pub fn new(config: MuxConfig) -> MuxResult<Self> {
        let connector = WsConnector::new(config.clone())?;
        Self::with_connector(connector, config)
    }

    /// Create a manager over a custom [`Connector`].
    ///
    /// `config` supplies the retry pacing used by subscriptions riding on
    /// this manager; the connector does its own dialing. The config is
    /// validated all the same.
    pub fn with_connector(connector: impl Connector, config: MuxConfig) -> MuxResult<Self> {
        config.validate().map_err(MuxError::config)?;
        Ok(Self {
            inner: Arc::new(ManagerInner {
                connector: Arc::new(connector),
                config,
                state: Mutex::new(ManagerState::default()),
            }),
        })
    }

    /// Configuration this manager was created with.
    pub fn config(&self) -> &MuxConfig {
        &self.inner.config
    }

    /// Obtain a lease on the shared connection, opening it if necessary.
    ///
    /// Concurrent callers share a single connection attempt. If that attempt
    /// fails, every caller waiting on it receives the error and the next call
    /// starts over.
    pub async fn lease(&self) -> MuxResult<Lease> {
        loop {
            match self.inner.claim() {
                Claim::Join {
                    generation,
                    attempt,
                } => {
                    let guard = LockGuard {
                        inner: Arc::clone(&self.inner),
                        generation,
                    };
                    return match attempt.await {
                        Ok((connection, _, terminal)) => Ok(Lease::new(connection, terminal, guard)),
                        Err(err) => {
                            drop(guard);
                            self.inner.retire(generation);
                            Err(err)
                        }
                    };
                }
                Claim::AwaitClose {
                    generation,
                    attempt,
                } => {
                    debug!(generation, "Waiting for closing connection before reopening");
                    if let Ok((_, _, terminal)) = attempt.await {
                        let _ = terminal.wait().await;
                    }
                    self.inner.retire(generation);
                }
            }
        }
    }

    /// Number of unreleased leases on the current connection.
    pub fn lock_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .slot
            .as_ref()
            .map_or(0, |slot| slot.locks)
    }

    /// Whether an acknowledged connection is currently open.
    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().slot.as_ref().is_some_and(|slot| {
            matches!(slot.attempt.peek(), Some(Ok((_, _, terminal))) if !terminal.is_settled())
        })
    }

    /// Number of connection attempts started so far.
    pub fn attempts_started(&self) -> u64 {
        self.inner.state.lock().next_generation
    }
}

/// One lock on a connection generation, returned on drop.
struct LockGuard {
    inner: Arc<ManagerInner>,
    generation: u64,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.inner.unlock(self.generation);
    }
}

struct ReleaseState {
    released: watch::Sender<bool>,
    guard: Mutex<Option<LockGuard>>,
}

/// Returns a lease's lock to the manager.
///
/// Only the first [`release`](Releaser::release) has effect. Dropping the
/// last clone releases implicitly.
#[derive(Clone)]
pub struct Releaser {
    inner: Arc<ReleaseState>,
}

impl fmt::Debug for Releaser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Releaser")
            .field("released", &self.is_released())
            .finish()
    }
}

impl Releaser {
    fn new(guard: LockGuard) -> Self {
        let (released, _) = watch::channel(false);
        Self {
            inner: Arc::new(ReleaseState {
                released,
                guard: Mutex::new(Some(guard)),
            }),
        }
    }

    /// Release the lease.
    pub fn release(&self) {
        let guard = self.inner.guard.lock().take();
        if let Some(guard) = guard {
            self.inner.released.send_replace(true);
            drop(guard);
        }
    }

    /// Whether the lease has been released.
    pub fn is_released(&self) -> bool {
        *self.inner.released.borrow()
    }
}

/// A lock on the shared connection.
#[derive(Debug)]
pub struct Lease {
    connection: ConnectionHandle,
    terminal: Terminal,
    releaser: Releaser,
}

impl Lease {
    fn new(connection: ConnectionHandle, terminal: Terminal, guard: LockGuard) -> Self {
        Self {
            connection,
            terminal,
            releaser: Releaser::new(guard),
        }
    }

    /// The shared connection.
    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    /// Terminal signal of the shared connection.
    pub fn terminal(&self) -> &Terminal {
        &self.terminal
    }

    /// A handle that releases this lease.
    pub fn releaser(&self) -> Releaser {
        self.releaser.clone()
    }

    /// Release this lease. Later calls are no-ops.
    pub fn release(&self) {
        self.releaser.release();
    }

    /// Whether this lease has been released.
    pub fn is_released(&self) -> bool {
        self.releaser.is_released()
    }

    /// Wait until the lease ends.
    ///
    /// Resolves `Ok(())` when the lease is released or the connection
    /// completes gracefully, and fails with the connection's close error
    /// otherwise.
    pub async fn closed(&self) -> MuxResult<()> {
        let mut released = self.releaser.inner.released.subscribe();
        tokio::select! {
            biased;
            () = async {
                let _ = released.wait_for(|done| *done).await;
            } => Ok(()),
            result = self.terminal.wait() => result,
        }
    }
}
