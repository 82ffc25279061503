//! Service lifecycle state machine
//!
//! Every long-lived component transitions through a strict FSM:
//! `NotStarted → Starting → Started → Stopped`. Transitions are guarded by
//! an atomic compare-and-swap so start/stop hooks run exactly once even
//! under concurrent callers. Invoking a component before it reaches
//! `Started` yields the retriable `Error::NotStarted`.

use std::sync::atomic::{AtomicU32, Ordering};
use tracing::debug;

use crate::error::{Error, Result};

/// Lifecycle state of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum State {
    NotStarted = 0,
    Starting = 1,
    Started = 2,
    Stopped = 3,
}

impl State {
    fn from_u32(v: u32) -> State {
        match v {
            0 => State::NotStarted,
            1 => State::Starting,
            2 => State::Started,
            _ => State::Stopped,
        }
    }
}

/// Start/stop guard shared by all long-lived components
pub struct Lifecycle {
    name: String,
    state: AtomicU32,
}

impl Lifecycle {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: AtomicU32::new(State::NotStarted as u32),
        }
    }

    /// Run the start hook if the service has not been started yet.
    /// Returns false (and does nothing) on any other state.
    pub fn start<F: FnOnce()>(&self, start_fn: F) -> bool {
        if self
            .state
            .compare_exchange(
                State::NotStarted as u32,
                State::Starting as u32,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            debug!(service = %self.name, "service already started");
            return false;
        }

        debug!(service = %self.name, "starting service");
        start_fn();
        self.state.store(State::Started as u32, Ordering::SeqCst);
        debug!(service = %self.name, "service started");

        true
    }

    /// Run the stop hook if the service is started.
    /// Returns false (and does nothing) on any other state.
    pub fn stop<F: FnOnce()>(&self, stop_fn: F) -> bool {
        if self
            .state
            .compare_exchange(
                State::Started as u32,
                State::Stopped as u32,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            debug!(service = %self.name, "service already stopped");
            return false;
        }

        debug!(service = %self.name, "stopping service");
        stop_fn();
        debug!(service = %self.name, "service stopped");

        true
    }

    /// Current state
    pub fn state(&self) -> State {
        State::from_u32(self.state.load(Ordering::SeqCst))
    }

    /// Fails with the retriable `NotStarted` error unless the service
    /// has reached `Started`.
    pub fn check_started(&self) -> Result<()> {
        match self.state() {
            State::Started => Ok(()),
            _ => Err(Error::NotStarted),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_start_stop_transitions() {
        let lc = Lifecycle::new("test");
        assert_eq!(lc.state(), State::NotStarted);
        assert!(lc.check_started().is_err());

        assert!(lc.start(|| {}));
        assert_eq!(lc.state(), State::Started);
        assert!(lc.check_started().is_ok());

        assert!(lc.stop(|| {}));
        assert_eq!(lc.state(), State::Stopped);
        assert!(lc.check_started().is_err());
    }

    #[test]
    fn test_start_is_idempotent() {
        let lc = Lifecycle::new("test");
        let count = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&count);
        assert!(lc.start(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        let c = Arc::clone(&count);
        assert!(!lc.start(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stop_before_start_is_noop() {
        let lc = Lifecycle::new("test");
        let count = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&count);
        assert!(!lc.stop(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(lc.state(), State::NotStarted);
    }
}
