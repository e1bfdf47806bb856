//! Connection lifecycle
//!
//! A connection moves `Connecting -> Open -> Closed` exactly once; there is
//! no reconnect at this layer. Closure can come from the local side, a
//! clean remote close, or a transport error, and every path funnels through
//! [`Lifecycle::set_closed`] so pending requests are failed exactly once.

use std::fmt;

use tokio::sync::watch;

/// Why the connection closed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Explicit close by this client
    Local,
    /// The server closed the connection
    Remote,
    /// The transport failed
    Transport(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Local => write!(f, "closed locally"),
            CloseReason::Remote => write!(f, "closed by server"),
            CloseReason::Transport(e) => write!(f, "transport error: {}", e),
        }
    }
}

/// Connection state as observed by callers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnState {
    /// Connection is being established
    Connecting,
    /// Connection is open; calls are accepted
    Open,
    /// Connection is closed; calls fail fast
    Closed(CloseReason),
}

/// Owns the state transitions and exposes them on a watch channel
#[derive(Debug)]
pub(crate) struct Lifecycle {
    tx: watch::Sender<ConnState>,
}

impl Lifecycle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ConnState::Connecting);
        Self { tx }
    }

    /// Mark the connection open. Ignored once closed.
    pub fn set_open(&self) {
        self.tx.send_if_modified(|state| {
            if matches!(state, ConnState::Connecting) {
                *state = ConnState::Open;
                true
            } else {
                false
            }
        });
    }

    /// Mark the connection closed.
    ///
    /// Returns whether this call performed the transition; the first close
    /// wins and later causes are ignored. The caller that wins owns the
    /// cleanup (invalidating pending requests, stopping the I/O tasks).
    pub fn set_closed(&self, reason: CloseReason) -> bool {
        self.tx.send_if_modified(|state| {
            if matches!(state, ConnState::Closed(_)) {
                false
            } else {
                tracing::debug!(%reason, "Connection closed");
                *state = ConnState::Closed(reason.clone());
                true
            }
        })
    }

    pub fn is_open(&self) -> bool {
        matches!(&*self.tx.borrow(), ConnState::Open)
    }

    pub fn state(&self) -> ConnState {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnState> {
        self.tx.subscribe()
    }

    /// Wait until the connection is closed and return the reason
    pub async fn closed(&self) -> CloseReason {
        let mut rx = self.tx.subscribe();
        let result = rx
            .wait_for(|state| matches!(state, ConnState::Closed(_)))
            .await;
        match result {
            Ok(state) => match &*state {
                ConnState::Closed(reason) => reason.clone(),
                _ => CloseReason::Local,
            },
            // Sender dropped without closing; treat as a local teardown
            Err(_) => CloseReason::Local,
        }
    }
}
