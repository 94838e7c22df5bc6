//! Interpreter session
//!
//! One session per `create` call. It owns the solver parameters and, once
//! `solver create` succeeds, the solver with its network.

use crate::buffer::Buffer;
use crate::engine::Solver;
use crate::error::CommandError;
use crate::param::SolverParameter;
use crate::protocol;

/// Per-session command counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    pub commands: usize,
    pub failures: usize,
}

#[derive(Default)]
pub struct Session {
    pub(crate) parameters: SolverParameter,
    pub(crate) solver: Option<Box<dyn Solver>>,
    stats: SessionStats,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parameters(&self) -> &SolverParameter {
        &self.parameters
    }

    pub fn solver(&self) -> Option<&dyn Solver> {
        self.solver.as_deref()
    }

    pub(crate) fn solver_mut(&mut self) -> Result<&mut (dyn Solver + 'static), CommandError> {
        self.solver.as_deref_mut().ok_or(CommandError::NoSolver)
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Parse and run one command, keeping the error.
    pub fn try_send(&mut self, command: &str, buffer: &mut Buffer<'_>) -> Result<(), CommandError> {
        let parsed = protocol::parse(command)?;
        protocol::execute(self, &parsed, buffer)
    }

    /// Parse and run one command. Every failure collapses to `false`; the
    /// reason is only logged.
    pub fn send(&mut self, command: &str, buffer: &mut Buffer<'_>) -> bool {
        self.stats.commands += 1;
        match self.try_send(command, buffer) {
            Ok(()) => true,
            Err(e) => {
                self.stats.failures += 1;
                if e.is_grammar() {
                    log::debug!("Command '{}' rejected: {}", command, e);
                } else {
                    log::warn!("Command '{}' failed: {}", command, e);
                }
                false
            }
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("solver", &self.solver.as_ref().map(|s| s.solver_type().to_string()))
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::Message;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_new_session_is_empty() {
        let session = Session::new();
        assert_eq!(session.parameters(), &SolverParameter::default());
        assert!(session.solver().is_none());
        assert_eq!(session.stats(), SessionStats::default());
    }

    #[test]
    fn test_bogus_command_leaves_state() {
        let mut session = Session::new();
        let mut text = b"base_lr: 0.1 type: \"SGD\"".to_vec();
        assert!(session.send("solver_param set_string", &mut Buffer::new(&mut text)));
        let before = session.parameters().encode_to_vec();

        for command in ["bogus_token", "", "solver", "solver_param", "solver_param bogus", "solver bogus"] {
            let mut raw = [0x5au8; 16];
            assert!(!session.send(command, &mut Buffer::new(&mut raw)), "{:?}", command);
            assert_eq!(raw, [0x5a; 16]);
        }

        assert_eq!(session.parameters().encode_to_vec(), before);
        assert!(session.solver().is_none());
        assert_eq!(session.stats(), SessionStats { commands: 7, failures: 6 });
    }

    #[test]
    fn test_try_send_keeps_error() {
        let mut session = Session::new();
        let err = session.try_send("solver step", &mut Buffer::new(&mut [0u8; 4])).unwrap_err();
        assert!(matches!(err, CommandError::NoSolver));
    }
}
