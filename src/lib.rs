// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pipe standard input into a remote log while passing it through:
//! - Every input byte is mirrored to standard output as it is read.
//! - Every input line becomes one record sent to a log collector.
//! - The run ends on end of input, SIGINT/SIGTERM or a collector failure,
//!   and the collector session is flushed and closed exactly once.
//!
//! Transport: TCP, see [`wire`].

use std::fs::File;
use std::io;
use std::os::fd::AsFd;
use std::os::unix::fs::FileTypeExt;

pub mod collector;
pub mod config;
pub mod error;
pub mod line_source;
pub mod signal_watch;
pub mod sink;
pub mod stream_loop;
pub mod wire;

pub use error::Error;
pub use line_source::{Line, LineSource};
pub use sink::{CollectorSink, FailureNotifier, LogRecord, Sink, SinkError};
pub use stream_loop::{Event, Phase, Report, StreamLoop, TerminationReason};

/// Events the loop may fall behind by before the reader waits.
pub const EVENT_BACKLOG: usize = 1024;

/// Fails unless standard input is a pipe, so nobody is left waiting on a
/// terminal (or a regular file) by accident.
pub fn ensure_piped_stdin() -> Result<(), Error> {
    let fd = io::stdin().as_fd().try_clone_to_owned().map_err(Error::Stdin)?;
    let meta = File::from(fd).metadata().map_err(Error::Stdin)?;
    if meta.file_type().is_fifo() {
        Ok(())
    } else {
        Err(Error::NotPiped)
    }
}
