//! Single-settlement outcome of one physical connection.
//!
//! Every connection owns exactly one [`TerminalSetter`]. The first call to
//! [`TerminalSetter::settle`] wins; later calls are ignored, and every
//! [`Terminal`] observer (including ones created after settlement) sees the
//! same final [`TerminalState`].

use tokio::sync::watch;

use crate::error::{ABNORMAL_CLOSURE, MuxError, MuxResult, NORMAL_CLOSURE};

/// Close code and reason reported by the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseInfo {
    /// WebSocket close code.
    pub code: u16,
    /// Human-readable close reason.
    pub reason: String,
}

/// Lifecycle of a physical connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TerminalState {
    /// Connection is open.
    Alive,
    /// Closed with [`NORMAL_CLOSURE`].
    Completed,
    /// Closed with any other code.
    Closed(CloseInfo),
}

impl TerminalState {
    /// Classify a close event by its code.
    pub fn from_close(code: u16, reason: impl Into<String>) -> Self {
        if code == NORMAL_CLOSURE {
            Self::Completed
        } else {
            Self::Closed(CloseInfo {
                code,
                reason: reason.into(),
            })
        }
    }

    /// Whether the connection has reached its final state.
    pub fn is_settled(&self) -> bool {
        !matches!(self, Self::Alive)
    }

    /// The settled outcome, or `None` while the connection is alive.
    pub fn outcome(&self) -> Option<MuxResult<()>> {
        match self {
            Self::Alive => None,
            Self::Completed => Some(Ok(())),
            Self::Closed(info) => Some(Err(MuxError::closed(info.code, info.reason.clone()))),
        }
    }
}

/// Write side of the terminal signal, owned by the connection driver.
#[derive(Debug)]
pub(crate) struct TerminalSetter {
    tx: watch::Sender<TerminalState>,
}

impl TerminalSetter {
    /// Settle the signal. Returns `false` if it was already settled.
    pub(crate) fn settle(&self, state: TerminalState) -> bool {
        if !state.is_settled() {
            return false;
        }
        self.tx.send_if_modified(|current| {
            if current.is_settled() {
                return false;
            }
            *current = state;
            true
        })
    }
}

impl Drop for TerminalSetter {
    fn drop(&mut self) {
        // A driver that goes away without reporting a close lost the connection.
        self.settle(TerminalState::from_close(
            ABNORMAL_CLOSURE,
            "connection task ended",
        ));
    }
}

/// Read side of the terminal signal. Cheap to clone.
#[derive(Clone, Debug)]
pub struct Terminal {
    rx: watch::Receiver<TerminalState>,
}

impl Terminal {
    pub(crate) fn channel() -> (TerminalSetter, Self) {
        let (tx, rx) = watch::channel(TerminalState::Alive);
        (TerminalSetter { tx }, Self { rx })
    }

    /// Current state without waiting.
    pub fn state(&self) -> TerminalState {
        self.rx.borrow().clone()
    }

    /// Whether the connection has reached its final state.
    pub fn is_settled(&self) -> bool {
        self.rx.borrow().is_settled()
    }

    /// Wait for the connection to end.
    ///
    /// Resolves `Ok(())` on graceful completion and fails with
    /// [`MuxError::Closed`] for any other close code.
    pub async fn wait(&self) -> MuxResult<()> {
        let mut rx = self.rx.clone();
        let settled = match rx.wait_for(TerminalState::is_settled).await {
            Ok(state) => state.clone(),
            Err(_) => TerminalState::from_close(ABNORMAL_CLOSURE, "connection task ended"),
        };
        settled
            .outcome()
            .unwrap_or_else(|| Err(MuxError::internal("terminal settled while alive")))
    }
}
