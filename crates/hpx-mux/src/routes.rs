//! Identifier-keyed inbound dispatch using `scc::HashMap`.
//!
//! Each active subscription registers one route for its identifier on the
//! connection it rides. The connection driver decodes every inbound envelope
//! once and hands it to the route owning that identifier; envelopes for
//! unknown identifiers are dropped.

use std::{fmt, sync::Arc};

use tokio::sync::mpsc;
use tracing::debug;

use crate::envelope::{Envelope, SubscriptionId};

/// Lock-free store of inbound routes for one connection.
#[derive(Default)]
pub struct RouteTable {
    routes: scc::HashMap<SubscriptionId, mpsc::UnboundedSender<Envelope>>,
}

impl fmt::Debug for RouteTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteTable")
            .field("routes", &self.routes.len())
            .finish()
    }
}

impl RouteTable {
    /// Create an empty route table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a route for `id`.
    ///
    /// Returns `None` if a route for `id` already exists. The route is
    /// detached when the returned [`Route`] is dropped.
    pub fn register(self: &Arc<Self>, id: SubscriptionId) -> Option<Route> {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.routes.insert_sync(id, tx).is_err() {
            return None;
        }
        Some(Route {
            id,
            table: Arc::clone(self),
            rx,
        })
    }

    /// Hand an envelope to the route owning its identifier.
    ///
    /// Returns `true` if a route for the identifier exists.
    pub fn dispatch(&self, envelope: Envelope) -> bool {
        let id = envelope.id();
        let routed = self
            .routes
            .update_sync(&id, |_, tx| {
                // Receiver gone means the subscription is already tearing down.
                let _ = tx.send(envelope);
            })
            .is_some();
        if !routed {
            debug!(id = %id, "Dropping envelope for unknown subscription");
        }
        routed
    }

    /// Number of attached routes.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Check if no routes are attached.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    fn detach(&self, id: &SubscriptionId) {
        self.routes.remove_sync(id);
    }
}

/// Inbound envelopes for one subscription identifier.
#[derive(Debug)]
pub struct Route {
    id: SubscriptionId,
    table: Arc<RouteTable>,
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl Route {
    /// The identifier this route receives envelopes for.
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Receive the next envelope, in arrival order.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    /// Try to receive an envelope without waiting.
    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Route {
    fn drop(&mut self) {
        self.table.detach(&self.id);
    }
}
