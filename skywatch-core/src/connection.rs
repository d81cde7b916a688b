//! Broker connection lifecycle as an explicit state machine.
//!
//! ```text
//! Disconnected --Connect--> Connecting --Ack--> Connected
//! Connecting --Failure--> Backoff(n+1)      Connected --NetworkLoss--> Backoff(1)
//! Backoff(n) --TimerElapsed--> Connecting   Backoff(n) --Failure--> Backoff(n+1)
//! any --Shutdown--> Disconnected (final)
//! ```

use crate::config::{BackoffConf, MIN_BACKOFF_MS};
use crate::state::{new_state, Shared};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Attempt counter stops growing here; the delay is long since capped by then.
pub const MAX_BACKOFF_ATTEMPT: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Consecutive failed attempts, starting at 1.
    Backoff(u32),
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("disconnected"),
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Connected => f.write_str("connected"),
            ConnectionState::Backoff(n) => write!(f, "backoff({n})"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connect,
    Ack,
    Failure,
    NetworkLoss,
    TimerElapsed,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid connection transition: {event:?} while {from}")]
pub struct InvalidTransition {
    pub from: ConnectionState,
    pub event: ConnectionEvent,
}

#[derive(Debug)]
pub struct ConnectionMachine {
    state: ConnectionState,
    failures: u32,
    closed: bool,
}

impl Default for ConnectionMachine {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            failures: 0,
            closed: false,
        }
    }
}

impl ConnectionMachine {
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn apply(&mut self, event: ConnectionEvent) -> Result<ConnectionState, InvalidTransition> {
        use ConnectionEvent as E;
        use ConnectionState as S;

        let invalid = InvalidTransition {
            from: self.state,
            event,
        };
        if self.closed {
            return Err(invalid);
        }

        let next = match (self.state, event) {
            (_, E::Shutdown) => {
                self.closed = true;
                S::Disconnected
            }
            (S::Disconnected, E::Connect) => S::Connecting,
            (S::Connecting, E::Ack) => {
                self.failures = 0;
                S::Connected
            }
            (S::Connecting, E::Failure) | (S::Backoff(_), E::Failure) => {
                self.failures = (self.failures + 1).min(MAX_BACKOFF_ATTEMPT);
                S::Backoff(self.failures)
            }
            (S::Connected, E::NetworkLoss) => {
                self.failures = 1;
                S::Backoff(1)
            }
            (S::Backoff(_), E::TimerElapsed) => S::Connecting,
            _ => return Err(invalid),
        };
        self.state = next;
        Ok(next)
    }
}

/// Capped exponential backoff: `base * 2^(n-1)`, never above `cap`, never below the floor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        let floor = Duration::from_millis(MIN_BACKOFF_MS);
        let base = base.max(floor);
        Self {
            base,
            cap: cap.max(base),
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.clamp(1, MAX_BACKOFF_ATTEMPT) - 1;
        self.base.saturating_mul(1u32 << exp).min(self.cap)
    }

    pub fn cap(&self) -> Duration {
        self.cap
    }
}

impl From<&BackoffConf> for Backoff {
    fn from(conf: &BackoffConf) -> Self {
        Backoff::new(
            Duration::from_millis(conf.base_ms),
            Duration::from_millis(conf.cap_ms),
        )
    }
}

/// The one connection state both roles look at. Cloning shares it.
#[derive(Clone)]
pub struct ConnectionHandle {
    machine: Shared<ConnectionMachine>,
    tx: Arc<watch::Sender<ConnectionState>>,
}

impl Default for ConnectionHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::Disconnected);
        Self {
            machine: new_state(ConnectionMachine::default()),
            tx: Arc::new(tx),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.machine.lock().state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn apply(&self, event: ConnectionEvent) -> Result<ConnectionState, InvalidTransition> {
        let next = self.machine.lock().apply(event)?;
        self.tx.send_replace(next);
        Ok(next)
    }

    /// Failure while connecting, or loss of an established link.
    pub fn record_error(&self) -> Result<ConnectionState, InvalidTransition> {
        let mut machine = self.machine.lock();
        let event = if machine.state() == ConnectionState::Connected {
            ConnectionEvent::NetworkLoss
        } else {
            ConnectionEvent::Failure
        };
        let next = machine.apply(event)?;
        drop(machine);
        self.tx.send_replace(next);
        Ok(next)
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Resolves once the state satisfies `pred`.
    pub async fn wait_for<F>(&self, pred: F) -> ConnectionState
    where
        F: Fn(ConnectionState) -> bool,
    {
        let mut rx = self.subscribe();
        let state = match rx.wait_for(|s| pred(*s)).await {
            Ok(state) => *state,
            // sender lives as long as self
            Err(_) => self.state(),
        };
        state
    }
}
