//! Start/stop lifecycle shared by the manager, clients, servers and the relay.

use std::fmt;
use tracing::{debug, error, warn};

use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum State {
    #[default]
    Uninitialized,
    BeginStart,
    Started,
    Stopped,
    Error,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Uninitialized => "uninitialized",
            State::BeginStart => "begin_start",
            State::Started => "started",
            State::Stopped => "stopped",
            State::Error => "error",
        };
        f.write_str(name)
    }
}

/// Lifecycle bookkeeping: the current state plus the failures collected
/// while stopping.
#[derive(Debug, Default)]
pub struct Lifecycle {
    state: State,
    exceptions: Vec<String>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn set_state(&mut self, state: State) {
        self.state = state;
    }

    pub fn exceptions(&self) -> &[String] {
        &self.exceptions
    }

    pub fn append_exception<E: fmt::Display>(&mut self, name: &str, err: E) {
        error!("{}: {}", name, err);
        self.exceptions.push(format!("{}: {}", name, err));
        self.state = State::Error;
    }

    /// Returns false if `name` is not allowed to start from the current state.
    pub fn begin_start(&mut self, name: &str) -> bool {
        if !matches!(self.state, State::Uninitialized | State::Stopped) {
            warn!("{} is not stopped (state {}), refusing to start", name, self.state);
            return false;
        }
        debug!("start {}", name);
        self.state = State::BeginStart;
        true
    }

    pub fn begin_stop(&mut self, name: &str) -> bool {
        if !matches!(self.state, State::Started | State::BeginStart) {
            debug!("{} is not started (state {}), nothing to stop", name, self.state);
            return false;
        }
        debug!("stop {}", name);
        true
    }

    /// Records the outcome of every stop procedure; callers run all of
    /// them even if an earlier one failed.
    pub fn finish_stop(&mut self, name: &str, results: Vec<Result<()>>) {
        for result in results {
            if let Err(e) = result {
                self.append_exception(name, e);
            }
        }
        if self.state != State::Error {
            self.state = State::Stopped;
        }
    }
}

/// Objects with a start/stop lifecycle.
pub trait Stateful {
    fn name(&self) -> String;

    fn state(&self) -> State;

    fn start(&mut self) -> Result<()>;

    fn stop(&mut self);

    fn is_running(&self) -> bool {
        self.state() == State::Started
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn test_start_only_from_stopped() {
        let mut lc = Lifecycle::new();
        assert!(lc.begin_start("srv"));
        lc.set_state(State::Started);
        assert!(!lc.begin_start("srv"));
    }

    #[test]
    fn test_stop_requires_started() {
        let mut lc = Lifecycle::new();
        assert!(!lc.begin_stop("srv"));
        lc.set_state(State::BeginStart);
        assert!(lc.begin_stop("srv"));
    }

    #[test]
    fn test_failed_stop_procedure_moves_to_error() {
        let mut lc = Lifecycle::new();
        lc.set_state(State::Started);
        lc.finish_stop("srv", vec![Err(Error::framework("socket gone")), Ok(())]);
        assert_eq!(lc.state(), State::Error);
        assert_eq!(lc.exceptions().len(), 1);
    }

    #[test]
    fn test_clean_stop() {
        let mut lc = Lifecycle::new();
        lc.set_state(State::Started);
        lc.finish_stop("srv", vec![Ok(())]);
        assert_eq!(lc.state(), State::Stopped);
    }
}
