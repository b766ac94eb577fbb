//! Runtime error type.
//!
//! Every failure the VM can raise while executing bytecode or serving the
//! host API is a single [`Error`] carrying a formatted message; callers
//! distinguish failures by content, not by variant. Errors propagate with
//! `?` up to the nearest host [`call`](crate::State::call) boundary, which
//! restores the stack and frame tops saved by the active recovery point
//! before surfacing the error. The backtrace is printed to the state's
//! error stream at raise time, so by the time an `Error` reaches the host
//! the diagnostic output has already happened.

use thiserror::Error;

/// Unified runtime error.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct Error {
    message: String,
}

impl Error {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The formatted error message, without the backtrace.
    pub fn message(&self) -> &str {
        &self.message
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_roundtrip() {
        let err = Error::new("Division by zero!");
        assert_eq!(err.message(), "Division by zero!");
        assert_eq!(err.to_string(), "Division by zero!");
    }
}
