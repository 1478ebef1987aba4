// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reference log collector: the server side of the wire protocol.
//!
//! One thread per session. Records are written to a shared output, one line
//! per record, in the order each session delivered them.

use std::io::{self, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use clap::ValueEnum;
use log::{info, warn};
use rand::{rngs::SysRng, TryRng};

use crate::wire::{recv_message, send_message, session_hex, Message, SESSION_ID_LEN};

/// How long a new connection may take to introduce itself.
pub const HELLO_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// `project/log: payload`
    #[default]
    Text,
    /// base64 of the payload, one per line
    Base64,
}

impl OutputFormat {
    fn write_record<W: Write>(
                self,
                out: &mut W,
                project: &str,
                log_name: &str,
                payload: &str
            ) -> io::Result<()> {
        match self {
            OutputFormat::Text => writeln!(out, "{project}/{log_name}: {payload}"),
            OutputFormat::Base64 => writeln!(out, "{}", STANDARD.encode(payload)),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CollectorConfig {
    /// Projects allowed to open sessions. Empty accepts any project.
    pub projects: Vec<String>,
    /// Records accepted per session before it is failed.
    pub max_records: Option<u64>,
    pub format: OutputFormat,
}

impl CollectorConfig {
    fn accepts(&self, project: &str) -> bool {
        self.projects.is_empty() || self.projects.iter().any(|p| p == project)
    }
}

#[derive(Default)]
pub struct Stats {
    // Records written to the output
    records: AtomicU64,
    record_bytes: AtomicU64,

    // Records refused because the session ran out of quota
    refused: AtomicU64,

    sessions_opened: AtomicU64,
    active_sessions: AtomicUsize,
}

impl Stats {
    pub fn records(&self) -> u64 {
        self.records.load(Ordering::Relaxed)
    }

    pub fn refused(&self) -> u64 {
        self.refused.load(Ordering::Relaxed)
    }

    pub fn sessions_opened(&self) -> u64 {
        self.sessions_opened.load(Ordering::Relaxed)
    }

    pub fn active_sessions(&self) -> usize {
        self.active_sessions.load(Ordering::Relaxed)
    }
}

struct SessionGuard<'a> {
    stats: &'a Stats,
}

impl<'a> SessionGuard<'a> {
    fn new(stats: &'a Stats) -> Self {
        stats.sessions_opened.fetch_add(1, Ordering::Relaxed);
        stats.active_sessions.fetch_add(1, Ordering::Relaxed);
        Self { stats }
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.stats.active_sessions.fetch_sub(1, Ordering::Relaxed);
    }
}

pub struct Collector {
    listener: TcpListener,
    config: Arc<CollectorConfig>,
    stats: Arc<Stats>,
}

impl Collector {
    pub fn bind(addr: &str, config: CollectorConfig) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        Ok(Self {
            listener,
            config: Arc::new(config),
            stats: Arc::new(Stats::default()),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn stats(&self) -> Arc<Stats> {
        self.stats.clone()
    }

    /// Reporter thread: emits a one-line summary every `every`.
    pub fn report_every(&self, every: Duration) {
        let stats = self.stats.clone();
        thread::spawn(move || stats_reporter(stats, every));
    }

    /// Accepts sessions forever, writing their records into `out`.
    pub fn serve<W>(self, out: Arc<Mutex<W>>) -> io::Result<()>
    where
        W: Write + Send + 'static,
    {
        info!(
            "collector listening on {} (projects: {}, quota: {})",
            self.listener.local_addr()?,
            if self.config.projects.is_empty() {
                "any".to_string()
            } else {
                self.config.projects.join(",")
            },
            self.config
                .max_records
                .map_or_else(|| "none".to_string(), |n| n.to_string())
        );

        for conn in self.listener.incoming() {
            match conn {
                Ok(stream) => {
                    let config = self.config.clone();
                    let stats = self.stats.clone();
                    let out = out.clone();
                    thread::spawn(move || {
                        if let Err(e) = handle_session(stream, &config, &*out, &stats) {
                            warn!("session error: {}", e);
                        }
                    });
                }
                Err(e) => warn!("accept error: {}", e),
            }
        }

        Ok(())
    }
}

fn stats_reporter(stats: Arc<Stats>, every: Duration) {
    let mut last_records = 0u64;
    let mut last_bytes = 0u64;
    let mut last_refused = 0u64;

    loop {
        thread::sleep(every);

        let records = stats.records.load(Ordering::Relaxed);
        let bytes = stats.record_bytes.load(Ordering::Relaxed);
        let refused = stats.refused.load(Ordering::Relaxed);

        let dm = records - last_records;
        let db = bytes - last_bytes;
        let dr = refused - last_refused;

        last_records = records;
        last_bytes = bytes;
        last_refused = refused;

        let active = stats.active_sessions.load(Ordering::Relaxed);

        // One compact line per interval; goes to stderr.
        info!(
            "[stats] +{dm} rec ({db} B) written | +{dr} rec refused | \
             sessions={active} | totals: written={records} refused={refused}"
        );
    }
}

fn lock_output<W>(out: &Mutex<W>) -> io::Result<std::sync::MutexGuard<'_, W>> {
    out.lock()
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "output lock poisoned"))
}

fn unexpected(msg: &Message) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("unexpected message {msg:?}"),
    )
}

fn handle_session<W: Write>(
            mut stream: TcpStream,
            config: &CollectorConfig,
            out: &Mutex<W>,
            stats: &Stats
        ) -> io::Result<()> {
    stream.set_nodelay(true).ok();
    stream.set_read_timeout(Some(HELLO_TIMEOUT)).ok();
    let peer = stream.peer_addr()?;

    let (project, log_name) = match recv_message(&mut stream)? {
        Some(Message::Hello { project, log_name }) => (project, log_name),
        Some(other) => return Err(unexpected(&other)),
        None => return Ok(()),
    };

    if !config.accepts(&project) {
        warn!("client {} denied for project {:?}", peer, project);
        send_message(&mut stream, &Message::Failure {
            reason: format!("permission denied for project {project:?}"),
        })?;
        return Ok(());
    }

    let mut session = [0u8; SESSION_ID_LEN];
    SysRng.try_fill_bytes(&mut session).map_err(
        |e| io::Error::new(io::ErrorKind::Other, e)
    )?;
    send_message(&mut stream, &Message::Accepted { session })?;
    stream.set_read_timeout(None).ok();
    info!(
        "client {} opened session {} for {}/{}",
        peer, session_hex(&session), project, log_name
    );

    let _guard = SessionGuard::new(stats);
    let mut frames = BufReader::new(stream.try_clone()?);
    let mut written = 0u64;
    // Set once the quota runs out; the rest of the session is refused.
    let mut failure: Option<String> = None;

    loop {
        let msg = match recv_message(&mut frames)? {
            Some(msg) => msg,
            None => return Ok(()), // client disconnected
        };
        match msg {
            Message::Ping => send_message(&mut stream, &Message::Pong)?,
            Message::Entry { payload } => {
                if failure.is_some() {
                    stats.refused.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                if let Some(max) = config.max_records.filter(|&max| written >= max) {
                    stats.refused.fetch_add(1, Ordering::Relaxed);
                    let reason = format!("quota exhausted: {max} records per session");
                    warn!("session {}: {}", session_hex(&session), reason);
                    send_message(&mut stream, &Message::Failure { reason: reason.clone() })?;
                    failure = Some(reason);
                    continue;
                }

                config.format.write_record(
                    &mut *lock_output(out)?, &project, &log_name, &payload
                )?;
                written += 1;
                stats.records.fetch_add(1, Ordering::Relaxed);
                stats.record_bytes.fetch_add(payload.len() as u64, Ordering::Relaxed);
            }
            Message::Flush => {
                let reply = match &failure {
                    Some(reason) => Message::Failure { reason: reason.clone() },
                    None => {
                        lock_output(out)?.flush()?;
                        Message::Flushed
                    }
                };
                send_message(&mut stream, &reply)?;
            }
            other => return Err(unexpected(&other)),
        }
    }
}
