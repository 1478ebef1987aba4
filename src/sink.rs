// SPDX-License-Identifier: AGPL-3.0-or-later
//! Remote logging destination.
//!
//! [`CollectorSink`] speaks the [`wire`](crate::wire) protocol to a collector:
//! submissions are queued to a writer thread, collector replies are watched
//! by a monitor thread, and transport failures surface through a
//! [`FailureNotifier`]. The only error `submit` reports itself is a full
//! queue.

use std::io::{self, BufReader, BufWriter, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info};
use thiserror::Error;

use crate::line_source::Line;
use crate::stream_loop::Event;
use crate::wire::{recv_message, send_message, session_hex, Message};

/// Bound on connecting and on each reply of the startup handshake.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(1);
/// Bound on flushing and acknowledging pending records at close.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);
/// Records that may wait for the writer before submissions are refused.
pub const DEFAULT_SUBMIT_BACKLOG: usize = 1024;

#[derive(Debug, Clone, Error)]
pub enum SinkError {
    #[error("{0}")]
    Rejected(String),
    #[error("collector closed the connection")]
    Disconnected,
    #[error("no answer from collector within {0:?}")]
    Timeout(Duration),
    #[error("unexpected reply from collector: {0}")]
    Protocol(String),
    #[error("could not resolve collector address {0:?}")]
    Unresolved(String),
    #[error("collector is not keeping up: {0} records already queued")]
    Overflow(usize),
    #[error(transparent)]
    Io(Arc<io::Error>),
}

impl From<io::Error> for SinkError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                SinkError::Timeout(PROBE_TIMEOUT)
            }
            _ => SinkError::Io(Arc::new(e)),
        }
    }
}

/// The payload submitted to a sink for one line of input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    payload: String,
}

impl LogRecord {
    pub fn new(payload: impl Into<String>) -> Self {
        Self { payload: payload.into() }
    }

    pub fn into_payload(self) -> String {
        self.payload
    }
}

impl From<Line> for LogRecord {
    fn from(line: Line) -> Self {
        Self::new(line.into_string())
    }
}

pub trait Sink {
    /// Queues a record for transmission. Never waits on the network.
    ///
    /// An error means the record was not queued and the sink cannot keep up;
    /// the caller should stop submitting.
    fn submit(&mut self, record: LogRecord) -> Result<(), SinkError>;

    /// Flushes queued records and releases the transport.
    fn close(self) -> Result<(), SinkError>;
}

/// Hands asynchronous sink failures to the orchestrator's event channel.
#[derive(Clone)]
pub struct FailureNotifier {
    events: SyncSender<Event>,
}

impl FailureNotifier {
    pub fn new(events: SyncSender<Event>) -> Self {
        Self { events }
    }

    pub fn notify(&self, err: SinkError) {
        // Nobody listening means the loop already terminated.
        let _ = self.events.send(Event::SinkFailed(err));
    }
}

#[derive(Debug, Clone)]
pub struct SinkConfig {
    pub collector: String,
    pub project: String,
    pub log_name: String,
    /// Capacity of the queue between `submit` and the writer thread.
    pub backlog: usize,
}

enum Command {
    Record(LogRecord),
    Flush,
}

pub struct CollectorSink {
    commands: SyncSender<Command>,
    backlog: usize,
    stream: TcpStream,
    closing: Arc<AtomicBool>,
    writer_done: Receiver<io::Result<()>>,
    acks: Receiver<Result<(), SinkError>>,
    session: String,
}

fn expect_reply(stream: &mut TcpStream) -> Result<Message, SinkError> {
    match recv_message(stream)? {
        Some(Message::Failure { reason }) => Err(SinkError::Rejected(reason)),
        Some(msg) => Ok(msg),
        None => Err(SinkError::Disconnected),
    }
}

impl CollectorSink {
    /// Opens a session with the collector and pings it before returning.
    ///
    /// Every step is bounded by [`PROBE_TIMEOUT`], so a dead collector fails
    /// here instead of after the pipeline started.
    pub fn connect(
                config: &SinkConfig,
                notifier: FailureNotifier
            ) -> Result<Self, SinkError> {
        let addr = config
            .collector
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| SinkError::Unresolved(config.collector.clone()))?;
        let mut stream = TcpStream::connect_timeout(&addr, PROBE_TIMEOUT)?;
        stream.set_nodelay(true).ok();
        stream.set_read_timeout(Some(PROBE_TIMEOUT))?;

        send_message(&mut stream, &Message::Hello {
            project: config.project.clone(),
            log_name: config.log_name.clone(),
        })?;
        let session = match expect_reply(&mut stream)? {
            Message::Accepted { session } => session_hex(&session),
            other => return Err(SinkError::Protocol(format!("{other:?}"))),
        };

        send_message(&mut stream, &Message::Ping)?;
        match expect_reply(&mut stream)? {
            Message::Pong => {}
            other => return Err(SinkError::Protocol(format!("{other:?}"))),
        }
        stream.set_read_timeout(None)?;
        info!(
            "session {} open on {} for {}/{}",
            session, addr, config.project, config.log_name
        );

        let closing = Arc::new(AtomicBool::new(false));

        let backlog = config.backlog.max(1);
        let (commands, queue) = mpsc::sync_channel(backlog);
        let (done_tx, writer_done) = mpsc::channel();
        {
            let out = BufWriter::new(stream.try_clone()?);
            let notifier = notifier.clone();
            let closing = closing.clone();
            thread::spawn(move || {
                let result = write_loop(out, &queue);
                let failure = result.as_ref().err().map(
                    |e| SinkError::from(io::Error::new(e.kind(), e.to_string()))
                );
                // Report to close() first: notify() may block on a full channel.
                let _ = done_tx.send(result);
                if let Some(err) = failure {
                    if !closing.load(Ordering::SeqCst) {
                        notifier.notify(err);
                    }
                }
            });
        }

        let (acks_tx, acks) = mpsc::channel();
        {
            let replies = BufReader::new(stream.try_clone()?);
            let closing = closing.clone();
            thread::spawn(move || monitor(replies, notifier, &closing, acks_tx));
        }

        Ok(Self {
            commands,
            backlog,
            stream,
            closing,
            writer_done,
            acks,
            session,
        })
    }

    pub fn session(&self) -> &str {
        &self.session
    }
}

fn write_loop(
            mut out: BufWriter<TcpStream>,
            queue: &Receiver<Command>
        ) -> io::Result<()> {
    while let Ok(cmd) = queue.recv() {
        write_command(&mut out, cmd)?;
        // Batch whatever is already queued into a single flush.
        while let Ok(cmd) = queue.try_recv() {
            write_command(&mut out, cmd)?;
        }
        out.flush()?;
    }
    Ok(())
}

fn write_command<W: Write>(out: &mut W, cmd: Command) -> io::Result<()> {
    match cmd {
        Command::Record(record) => send_message(out, &Message::Entry {
            payload: record.into_payload(),
        }),
        Command::Flush => send_message(out, &Message::Flush),
    }
}

fn monitor(
            mut replies: BufReader<TcpStream>,
            notifier: FailureNotifier,
            closing: &AtomicBool,
            acks: Sender<Result<(), SinkError>>
        ) {
    let err = loop {
        match recv_message(&mut replies) {
            Ok(Some(Message::Flushed)) => {
                let _ = acks.send(Ok(()));
                return;
            }
            Ok(Some(Message::Failure { reason })) => break SinkError::Rejected(reason),
            Ok(Some(other)) => debug!("ignoring collector message {:?}", other),
            Ok(None) => break SinkError::Disconnected,
            Err(e) => break SinkError::from(e),
        }
    };
    let _ = acks.send(Err(err.clone()));
    if !closing.load(Ordering::SeqCst) {
        notifier.notify(err);
    }
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

fn await_flush(
            writer_done: &Receiver<io::Result<()>>,
            acks: &Receiver<Result<(), SinkError>>,
            deadline: Instant
        ) -> Result<(), SinkError> {
    match writer_done.recv_timeout(remaining(deadline)) {
        Ok(result) => result?,
        Err(RecvTimeoutError::Timeout) => return Err(SinkError::Timeout(CLOSE_TIMEOUT)),
        Err(RecvTimeoutError::Disconnected) => return Err(SinkError::Disconnected),
    }
    match acks.recv_timeout(remaining(deadline)) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => Err(SinkError::Timeout(CLOSE_TIMEOUT)),
        Err(RecvTimeoutError::Disconnected) => Err(SinkError::Disconnected),
    }
}

/// Queues the final `Flush`, waiting for room until `deadline`.
fn queue_flush(commands: &SyncSender<Command>, deadline: Instant) -> Result<(), SinkError> {
    let mut cmd = Command::Flush;
    loop {
        match commands.try_send(cmd) {
            Ok(()) => return Ok(()),
            // The writer is gone; await_flush reports why.
            Err(TrySendError::Disconnected(_)) => return Ok(()),
            Err(TrySendError::Full(back)) => {
                if Instant::now() >= deadline {
                    return Err(SinkError::Timeout(CLOSE_TIMEOUT));
                }
                cmd = back;
                thread::sleep(Duration::from_millis(10));
            }
        }
    }
}

impl Sink for CollectorSink {
    fn submit(&mut self, record: LogRecord) -> Result<(), SinkError> {
        match self.commands.try_send(Command::Record(record)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(SinkError::Overflow(self.backlog)),
            // The writer failed; that was already reported.
            Err(TrySendError::Disconnected(_)) => Ok(()),
        }
    }

    fn close(self) -> Result<(), SinkError> {
        let CollectorSink { commands, stream, closing, writer_done, acks, session, .. } = self;
        let deadline = Instant::now() + CLOSE_TIMEOUT;

        closing.store(true, Ordering::SeqCst);
        let flushed = queue_flush(&commands, deadline)
            .and_then(|()| {
                drop(commands);
                await_flush(&writer_done, &acks, deadline)
            });
        // Also unblocks a writer stuck on a peer that stopped reading.
        let released = match stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(SinkError::from(e)),
            _ => Ok(()),
        };
        debug!("session {} closed", session);
        flushed.and(released)
    }
}
