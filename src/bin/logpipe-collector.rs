// SPDX-License-Identifier: AGPL-3.0-or-later
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;

use logpipe::collector::Collector;
use logpipe::config::CollectorOptions;

fn main() -> io::Result<()> {
    // By default emit warnings
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("warn")
    ).init();

    let opts = CollectorOptions::parse();

    let collector = Collector::bind(&opts.listen, opts.collector_config())?;
    if opts.stats {
        collector.report_every(Duration::from_secs(1));
    }

    collector.serve(Arc::new(Mutex::new(io::stdout())))
}
