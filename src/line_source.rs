// SPDX-License-Identifier: AGPL-3.0-or-later
//! Input side of the pipe: tee every byte to the mirror, split into lines.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::sync::mpsc::SyncSender;
use std::thread::{self, JoinHandle};

use log::{error, warn};

use crate::stream_loop::Event;

/// Longest line forwarded as a record; longer lines are truncated.
pub const MAX_LINE_LEN: usize = 1024 * 1024; // 1 MiB

/// One line of input, without its line terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line(String);

impl Line {
    fn from_bytes(bytes: &[u8]) -> Self {
        Self(String::from_utf8_lossy(bytes).into_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl From<&str> for Line {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Copies every chunk read from `inner` into `mirror` before handing it on.
///
/// Mirroring happens per read call, so it does not depend on where line
/// boundaries fall or on whether a line is ever consumed.
pub struct TeeReader<R, W> {
    inner: R,
    mirror: W,
}

impl<R: Read, W: Write> TeeReader<R, W> {
    pub fn new(inner: R, mirror: W) -> Self {
        Self { inner, mirror }
    }
}

impl<R: Read, W: Write> Read for TeeReader<R, W> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.mirror.write_all(&buf[..n])?;
            // Downstream consumers should see bytes as they arrive.
            self.mirror.flush()?;
        }
        Ok(n)
    }
}

/// Ordered, finite sequence of lines read from `R`.
///
/// A read error is yielded once and ends the sequence. A final line without
/// a trailing newline is still yielded. A line longer than the maximum is cut
/// at the maximum; the rest of it is still read (and so mirrored) but
/// discarded.
pub struct LineSource<R> {
    reader: R,
    max_len: usize,
    done: bool,
}

impl<R: Read, W: Write> LineSource<BufReader<TeeReader<R, W>>> {
    pub fn tee(input: R, mirror: W) -> Self {
        Self::new(BufReader::new(TeeReader::new(input, mirror)))
    }
}

impl<R: BufRead> LineSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            max_len: MAX_LINE_LEN,
            done: false,
        }
    }

    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }

    fn next_line(&mut self) -> io::Result<Option<Line>> {
        let mut buf = Vec::new();
        // One byte over the limit is enough to tell an overlong line apart.
        let limit = self.max_len as u64 + 1;
        let n = self.reader.by_ref().take(limit).read_until(b'\n', &mut buf)?;
        if n == 0 {
            return Ok(None);
        }

        if buf.last() == Some(&b'\n') {
            buf.pop();
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
        } else if buf.len() > self.max_len {
            buf.truncate(self.max_len);
            // The rest still passes through the reader, so it is mirrored.
            self.reader.skip_until(b'\n')?;
            warn!("Input line longer than {} bytes was truncated", self.max_len);
        }
        Ok(Some(Line::from_bytes(&buf)))
    }
}

impl<R: BufRead> Iterator for LineSource<R> {
    type Item = io::Result<Line>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_line() {
            Ok(Some(line)) => Some(Ok(line)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Reads `input` on its own thread, mirroring into `mirror` and sending one
/// [`Event::Line`] per line, then [`Event::InputEnded`].
///
/// The thread stops early once the receiving side is gone; callers are free
/// to abandon the handle.
pub fn spawn<R, W>(input: R, mirror: W, events: SyncSender<Event>) -> JoinHandle<()>
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    thread::spawn(move || {
        for line in LineSource::tee(input, mirror) {
            match line {
                Ok(line) => {
                    if events.send(Event::Line(line)).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    error!("Failed to scan input: {}", e);
                    break;
                }
            }
        }
        let _ = events.send(Event::InputEnded);
    })
}
