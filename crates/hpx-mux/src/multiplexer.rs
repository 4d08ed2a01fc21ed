//! Identifier-keyed subscriptions over the shared connection.
//!
//! Each subscription runs as its own task and walks the state machine
//!
//! ```text
//! Pending ──lease──► Active(id) ──┬─ released / peer Complete / graceful close ─► Completed
//!    ▲                            ├─ abnormal closure (1006) ─► Retrying ─┐
//!    └────────────────────────────┼───────────────────────────────────────┘
//!                                 └─ any other close or error ─► Failed
//! ```
//!
//! A fresh identifier is allocated for every Active phase, right before the
//! request is sent, so a subscription completed before it ever leased a
//! connection consumes no identifier and sends nothing.

use std::{
    fmt, mem,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};

use parking_lot::Mutex;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    connection::ConnectionHandle,
    envelope::{Envelope, SubscriptionId},
    error::{MuxError, MuxResult},
    manager::{LazyConnectionManager, Lease, Releaser},
    reconnect::{BackoffConfig, calculate_backoff},
};

/// Where a subscription is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Waiting for a lease on the shared connection.
    Pending,
    /// Request sent; listening for envelopes addressed to `id`.
    Active { id: SubscriptionId },
    /// The connection closed abnormally; waiting before retry number `attempt`.
    Retrying { attempt: u32 },
    /// Finished without error.
    Completed,
    /// Finished with an error.
    Failed,
}

impl SubscriptionState {
    /// Whether the subscription has finished.
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// How [`SubscriptionCompleter::complete`] currently ends the subscription.
enum CompletionStrategy {
    /// No lease yet; completing only records the request.
    Pending { requested: bool },
    /// Riding a lease; completing notifies the peer and releases.
    Active {
        id: SubscriptionId,
        connection: ConnectionHandle,
        releaser: Releaser,
    },
    Finished,
}

/// Ends a subscription. Cheap to clone; only the first effective call matters.
#[derive(Clone)]
pub struct SubscriptionCompleter {
    strategy: Arc<Mutex<CompletionStrategy>>,
}

impl fmt::Debug for SubscriptionCompleter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let strategy = match &*self.strategy.lock() {
            CompletionStrategy::Pending { requested: false } => "pending",
            CompletionStrategy::Pending { requested: true } => "requested",
            CompletionStrategy::Active { .. } => "active",
            CompletionStrategy::Finished => "finished",
        };
        f.debug_struct("SubscriptionCompleter")
            .field("strategy", &strategy)
            .finish()
    }
}

impl SubscriptionCompleter {
    fn new() -> Self {
        Self {
            strategy: Arc::new(Mutex::new(CompletionStrategy::Pending { requested: false })),
        }
    }

    /// Complete the subscription.
    ///
    /// Before a lease is obtained this only marks the subscription as
    /// completed; it will release its first lease without sending a request.
    /// Once active it sends `{"complete": id}` and releases the lease.
    pub fn complete(&self) {
        let previous = {
            let mut strategy = self.strategy.lock();
            match &mut *strategy {
                CompletionStrategy::Pending { requested } => {
                    *requested = true;
                    return;
                }
                CompletionStrategy::Finished => return,
                CompletionStrategy::Active { .. } => {}
            }
            mem::replace(&mut *strategy, CompletionStrategy::Finished)
        };

        if let CompletionStrategy::Active {
            id,
            connection,
            releaser,
        } = previous
        {
            debug!(id = %id, "Completing subscription");
            if let Err(err) = connection.send(&Envelope::complete(id)) {
                debug!(id = %id, error = %err, "Could not notify peer of completion");
            }
            releaser.release();
        }
    }

    /// Whether completion was requested or the subscription already finished.
    pub fn is_completed(&self) -> bool {
        matches!(
            &*self.strategy.lock(),
            CompletionStrategy::Pending { requested: true } | CompletionStrategy::Finished
        )
    }

    /// Switch to the active strategy unless completion was already requested.
    fn activate(&self, id: SubscriptionId, connection: ConnectionHandle, releaser: Releaser) -> bool {
        let mut strategy = self.strategy.lock();
        if !matches!(*strategy, CompletionStrategy::Pending { requested: false }) {
            return false;
        }
        *strategy = CompletionStrategy::Active {
            id,
            connection,
            releaser,
        };
        true
    }

    /// Leave the active strategy after an attempt ended.
    fn deactivate(&self, retry: bool) {
        let previous = {
            let mut strategy = self.strategy.lock();
            let next = match &*strategy {
                CompletionStrategy::Active { .. } if retry => {
                    CompletionStrategy::Pending { requested: false }
                }
                CompletionStrategy::Pending { requested } if retry => CompletionStrategy::Pending {
                    requested: *requested,
                },
                _ => CompletionStrategy::Finished,
            };
            mem::replace(&mut *strategy, next)
        };
        if let CompletionStrategy::Active { releaser, .. } = previous {
            releaser.release();
        }
    }
}

/// Handle to a running subscription.
///
/// Dropping the handle does not stop the subscription; call
/// [`complete`](Subscription::complete) for that.
#[derive(Debug)]
pub struct Subscription {
    completer: SubscriptionCompleter,
    state: watch::Receiver<SubscriptionState>,
    task: JoinHandle<MuxResult<()>>,
}

impl Subscription {
    /// A handle that completes this subscription.
    pub fn completer(&self) -> SubscriptionCompleter {
        self.completer.clone()
    }

    /// Complete this subscription.
    pub fn complete(&self) {
        self.completer.complete();
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    /// Wait for the subscription to finish.
    ///
    /// Resolves `Ok(())` when it completes from either side and fails with
    /// the first error that is not an abnormal closure. Abnormal closures are
    /// retried and never surface here unless the retry limit is exceeded.
    pub async fn wait(self) -> MuxResult<()> {
        match self.task.await {
            Ok(result) => result,
            Err(err) => Err(MuxError::internal(format!("subscription task failed: {err}"))),
        }
    }
}

/// Opens subscriptions on a [`LazyConnectionManager`].
///
/// Identifiers are allocated from a counter owned by this multiplexer: they
/// start at 0, increase monotonically and are never reused.
#[derive(Clone, Debug)]
pub struct SubscriptionMultiplexer {
    manager: LazyConnectionManager,
    next_id: Arc<AtomicU64>,
    active: Arc<AtomicUsize>,
}

impl SubscriptionMultiplexer {
    /// Create a multiplexer over `manager`.
    pub fn new(manager: LazyConnectionManager) -> Self {
        Self {
            manager,
            next_id: Arc::new(AtomicU64::new(0)),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// The underlying connection manager.
    pub fn manager(&self) -> &LazyConnectionManager {
        &self.manager
    }

    /// Number of subscriptions that have not finished yet.
    pub fn active_subscriptions(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Open a subscription sending `request` and delivering every response
    /// payload to `listener`.
    ///
    /// The listener also receives the subscription's completer so it can end
    /// the subscription from inside the callback.
    pub fn subscribe<F>(&self, request: impl Into<String>, listener: F) -> Subscription
    where
        F: FnMut(String, &SubscriptionCompleter) + Send + 'static,
    {
        let completer = SubscriptionCompleter::new();
        let (state_tx, state_rx) = watch::channel(SubscriptionState::Pending);
        let config = self.manager.config();

        self.active.fetch_add(1, Ordering::AcqRel);
        let task = SubscriptionTask {
            manager: self.manager.clone(),
            next_id: Arc::clone(&self.next_id),
            request: request.into(),
            listener,
            completer: completer.clone(),
            state: state_tx,
            backoff: config.backoff(),
            max_retries: config.retry_max_attempts,
            _active: ActiveGuard(Arc::clone(&self.active)),
        };

        Subscription {
            completer,
            state: state_rx,
            task: tokio::spawn(task.run()),
        }
    }
}

struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

struct SubscriptionTask<F> {
    manager: LazyConnectionManager,
    next_id: Arc<AtomicU64>,
    request: String,
    listener: F,
    completer: SubscriptionCompleter,
    state: watch::Sender<SubscriptionState>,
    backoff: BackoffConfig,
    max_retries: Option<u32>,
    _active: ActiveGuard,
}

impl<F> SubscriptionTask<F>
where
    F: FnMut(String, &SubscriptionCompleter) + Send + 'static,
{
    async fn run(mut self) -> MuxResult<()> {
        let mut retries = 0u32;
        loop {
            self.state.send_replace(SubscriptionState::Pending);
            let result = self.attempt(&mut retries).await;
            let retry = matches!(&result, Err(err) if err.is_abrupt());
            self.completer.deactivate(retry);

            let err = match result {
                Ok(()) => {
                    debug!("Subscription completed");
                    self.state.send_replace(SubscriptionState::Completed);
                    return Ok(());
                }
                Err(err) if retry && self.max_retries.is_none_or(|max| retries < max) => err,
                Err(err) => {
                    warn!(error = %err, "Subscription failed");
                    self.state.send_replace(SubscriptionState::Failed);
                    return Err(err);
                }
            };

            let delay = calculate_backoff(self.backoff, retries);
            retries += 1;
            self.state
                .send_replace(SubscriptionState::Retrying { attempt: retries });
            info!(
                attempt = retries,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Connection lost, retrying subscription"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// One Pending -> Active -> settled pass.
    async fn attempt(&mut self, retries: &mut u32) -> MuxResult<()> {
        let lease = self.manager.lease().await?;

        if self.completer.is_completed() {
            debug!("Subscription completed before it started");
            lease.release();
            return Ok(());
        }

        let id = SubscriptionId::new(self.next_id.fetch_add(1, Ordering::AcqRel));
        // Attach the route before the request goes out so no response is missed.
        let mut route = lease.connection().route(id)?;
        if !self
            .completer
            .activate(id, lease.connection().clone(), lease.releaser())
        {
            lease.release();
            return Ok(());
        }

        self.state.send_replace(SubscriptionState::Active { id });
        debug!(id = %id, request = %self.request, "Sending subscription request");
        lease
            .connection()
            .send(&Envelope::request(id, self.request.clone()))?;

        loop {
            tokio::select! {
                biased;
                result = lease.closed() => {
                    // Envelopes routed before the close still belong to this attempt.
                    while !lease.is_released() {
                        let Some(envelope) = route.try_recv() else {
                            break;
                        };
                        self.deliver(id, envelope, &lease, retries);
                    }
                    return if lease.is_released() { Ok(()) } else { result };
                }
                envelope = route.recv() => match envelope {
                    Some(envelope) => self.deliver(id, envelope, &lease, retries),
                    None => return Err(MuxError::internal("subscription route detached")),
                },
            }
        }
    }

    fn deliver(
        &mut self,
        id: SubscriptionId,
        envelope: Envelope,
        lease: &Lease,
        retries: &mut u32,
    ) {
        match envelope {
            Envelope::Response { response, .. } => {
                *retries = 0;
                (self.listener)(response, &self.completer);
            }
            Envelope::Complete { .. } => {
                debug!(id = %id, "Peer completed subscription");
                lease.release();
            }
            Envelope::Request { .. } => {
                debug!(id = %id, "Ignoring request addressed to this subscription");
            }
        }
    }
}
