// SPDX-License-Identifier: AGPL-3.0-or-later
use std::io;
use std::process;
use std::sync::atomic::AtomicBool;
use std::sync::mpsc;
use std::sync::Arc;

use clap::Parser;
use log::error;

use logpipe::config::Options;
use logpipe::signal_watch::SignalWatch;
use logpipe::{
    ensure_piped_stdin, line_source, CollectorSink, Error, FailureNotifier, StreamLoop,
    EVENT_BACKLOG,
};

fn run(opts: &Options) -> Result<(), Error> {
    ensure_piped_stdin()?;

    // Handlers go in before connecting so an early Ctrl-C is queued.
    let draining = Arc::new(AtomicBool::new(false));
    let watch = SignalWatch::install(draining.clone()).map_err(Error::Signals)?;

    let (events, inbox) = mpsc::sync_channel(EVENT_BACKLOG);
    let sink = CollectorSink::connect(&opts.sink_config(), FailureNotifier::new(events.clone()))
        .map_err(Error::Connect)?;

    // Both producers are left running at exit; a pending stdin read cannot
    // be interrupted anyway.
    let _signals = watch.spawn(events.clone());
    let _reader = line_source::spawn(io::stdin(), io::stdout(), events);

    StreamLoop::new(sink, inbox, draining).run().into_result()
}

fn main() {
    // By default emit warnings
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("warn")
    ).init();

    let opts = Options::parse();

    if let Err(e) = run(&opts) {
        error!("{}", e);
        process::exit(e.exit_code());
    }
}
