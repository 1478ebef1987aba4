// SPDX-License-Identifier: AGPL-3.0-or-later
use std::io;

use thiserror::Error;

use crate::sink::SinkError;

/// Fatal conditions of a `logpipe` run.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Nothing is piped in so there is nothing to log!")]
    NotPiped,
    #[error("Could not stat standard input: {0}")]
    Stdin(#[source] io::Error),
    #[error("Failed to watch for termination signals: {0}")]
    Signals(#[source] io::Error),
    #[error("Failed to reach the log collector: {0}")]
    Connect(#[source] SinkError),
    #[error("Log collector failed: {0}")]
    SinkFailure(#[source] SinkError),
    #[error("Failed to close client: {0}")]
    Close(#[source] SinkError),
}

impl Error {
    pub fn exit_code(&self) -> i32 {
        match self {
            // The sink already had its chance to close cleanly.
            Error::SinkFailure(_) => 1,
            _ => 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_and_close_failures_exit_with_two() {
        assert_eq!(Error::NotPiped.exit_code(), 2);
        assert_eq!(Error::Connect(SinkError::Disconnected).exit_code(), 2);
        assert_eq!(Error::Close(SinkError::Disconnected).exit_code(), 2);
        assert_eq!(
            Error::Stdin(io::Error::new(io::ErrorKind::Other, "boom")).exit_code(),
            2
        );
    }

    #[test]
    fn runtime_sink_failure_exits_with_one() {
        let err = Error::SinkFailure(SinkError::Rejected("quota exhausted".into()));
        assert_eq!(err.exit_code(), 1);
        assert_eq!(err.to_string(), "Log collector failed: quota exhausted");
    }
}
