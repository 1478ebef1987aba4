// SPDX-License-Identifier: AGPL-3.0-or-later
//! Command-line options for both binaries.

use clap::builder::{NonEmptyStringValueParser, RangedU64ValueParser};
use clap::Parser;

use crate::collector::{CollectorConfig, OutputFormat};
use crate::sink::{SinkConfig, DEFAULT_SUBMIT_BACKLOG};

pub const DEFAULT_COLLECTOR: &str = "127.0.0.1:7000";
pub const DEFAULT_LISTEN: &str = "0.0.0.0:7000";

#[derive(Parser, Debug)]
#[command(name = "logpipe", version)]
#[command(about = "Pipe standard input to a log collector while passing it through to standard output")]
pub struct Options {
    /// Project the log belongs to
    #[arg(short = 'p', long = "project", env = "LOGPIPE_PROJECT", value_parser = NonEmptyStringValueParser::new())]
    pub project: String,

    /// The name of the log to write to
    #[arg(short = 'l', long = "logname", default_value = "default")]
    pub log_name: String,

    /// Address of the log collector
    #[arg(short = 'c', long, env = "LOGPIPE_COLLECTOR", default_value = DEFAULT_COLLECTOR)]
    pub collector: String,

    /// Records that may queue up for a slow collector before the run fails
    #[arg(long, default_value_t = DEFAULT_SUBMIT_BACKLOG, value_parser = RangedU64ValueParser::<usize>::new().range(1..))]
    pub backlog: usize,
}

impl Options {
    pub fn sink_config(&self) -> SinkConfig {
        SinkConfig {
            collector: self.collector.clone(),
            project: self.project.clone(),
            log_name: self.log_name.clone(),
            backlog: self.backlog,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "logpipe-collector", version)]
#[command(about = "Receive records from logpipe clients and print them to standard output")]
pub struct CollectorOptions {
    /// Address to listen on
    #[arg(default_value = DEFAULT_LISTEN)]
    pub listen: String,

    /// Only accept sessions for this project (repeatable; default accepts any)
    #[arg(short = 'p', long = "project")]
    pub projects: Vec<String>,

    /// Fail a session once it has delivered this many records
    #[arg(long)]
    pub max_records: Option<u64>,

    /// How records are printed
    #[arg(long, value_enum, default_value_t)]
    pub format: OutputFormat,

    /// Log a throughput summary every second
    #[arg(long)]
    pub stats: bool,
}

impl CollectorOptions {
    pub fn collector_config(&self) -> CollectorConfig {
        CollectorConfig {
            projects: self.projects.clone(),
            max_records: self.max_records,
            format: self.format,
        }
    }
}
