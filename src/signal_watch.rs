// SPDX-License-Identifier: AGPL-3.0-or-later
//! Termination signals as an event source.

use std::io;
use std::os::raw::c_int;
use std::sync::atomic::AtomicBool;
use std::sync::mpsc::SyncSender;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::debug;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::flag;
use signal_hook::iterator::{Handle, Signals};
use signal_hook::low_level::signal_name;

use crate::stream_loop::Event;

pub const TERM_SIGNALS: [c_int; 2] = [SIGINT, SIGTERM];

/// Exit code used when a signal arrives while already shutting down.
pub const FORCED_EXIT_CODE: i32 = 130;

pub fn signal_label(signal: c_int) -> String {
    match signal_name(signal) {
        Some(name) => name.to_string(),
        None => format!("signal {signal}"),
    }
}

/// Registered signal handlers, not yet forwarding anywhere.
///
/// Signals that arrive between [`install`](Self::install) and
/// [`spawn`](Self::spawn) are queued, not lost.
pub struct SignalWatch {
    signals: Signals,
}

/// A running forwarder thread.
pub struct SignalForwarder {
    handle: Handle,
    thread: JoinHandle<()>,
}

impl SignalWatch {
    pub fn install(draining: Arc<AtomicBool>) -> io::Result<Self> {
        Self::install_for(&TERM_SIGNALS, draining)
    }

    /// Once `draining` is set, any of `signals` ends the process on the spot
    /// with [`FORCED_EXIT_CODE`].
    pub fn install_for(signals: &[c_int], draining: Arc<AtomicBool>) -> io::Result<Self> {
        for &sig in signals {
            flag::register_conditional_shutdown(sig, FORCED_EXIT_CODE, draining.clone())?;
        }
        Ok(Self { signals: Signals::new(signals)? })
    }

    pub fn spawn(self, events: SyncSender<Event>) -> SignalForwarder {
        let mut signals = self.signals;
        let handle = signals.handle();
        let thread = thread::spawn(move || {
            for sig in signals.forever() {
                debug!("received {}", signal_label(sig));
                if events.send(Event::Interrupt(sig)).is_err() {
                    break;
                }
            }
        });
        SignalForwarder { handle, thread }
    }
}

impl SignalForwarder {
    /// Stops forwarding and waits for the thread. The forced-exit handlers
    /// stay registered.
    pub fn close(self) {
        self.handle.close();
        let _ = self.thread.join();
    }
}
