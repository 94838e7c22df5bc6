//! Error types for the command interpreter
//!
//! Every variant here ends up as a plain `false` at the host boundary.
//! The detail only ever reaches the host through the log sink.

use thiserror::Error;

use crate::engine::EngineError;
use crate::param::ParamError;

/// Failures of a single coercion on a [`crate::Buffer`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    #[error("buffer too small: need {needed} bytes, have {actual}")]
    TooSmall { needed: usize, actual: usize },

    #[error("buffer of {actual} bytes is not a native int ({expected} bytes)")]
    NotAnInteger { expected: usize, actual: usize },
}

/// Failures of one `send` call.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The cursor was asked for a token past the end of the command.
    #[error("missing argument")]
    NoArgument,

    #[error("unknown command token '{0}'")]
    UnknownCommand(String),

    #[error("command is not valid UTF-8")]
    InvalidEncoding,

    #[error("no solver has been created in this session")]
    NoSolver,

    #[error("unknown layer '{0}'")]
    UnknownLayer(String),

    #[error("unknown blob '{0}'")]
    UnknownBlob(String),

    #[error("layer '{name}' is a {kind} layer, not MemoryData")]
    NotMemoryData { name: String, kind: &'static str },

    #[error("invalid iteration count {0}")]
    InvalidIterations(i32),

    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error(transparent)]
    Param(#[from] ParamError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl CommandError {
    /// Grammar-level misses are routine for hosts probing the protocol and
    /// are logged quieter than state or data failures.
    pub fn is_grammar(&self) -> bool {
        matches!(
            self,
            CommandError::NoArgument | CommandError::UnknownCommand(_) | CommandError::InvalidEncoding
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_error_message() {
        let err = BufferError::TooSmall { needed: 8, actual: 2 };
        assert_eq!(err.to_string(), "buffer too small: need 8 bytes, have 2");
    }

    #[test]
    fn test_grammar_classification() {
        assert!(CommandError::NoArgument.is_grammar());
        assert!(CommandError::UnknownCommand("x".into()).is_grammar());
        assert!(!CommandError::NoSolver.is_grammar());
        assert!(!CommandError::from(BufferError::TooSmall { needed: 4, actual: 0 }).is_grammar());
    }
}
