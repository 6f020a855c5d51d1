// SPDX-License-Identifier: AGPL-3.0-or-later

//! Command-line surface for the daemon.

use std::net::{SocketAddr, ToSocketAddrs};

use clap::Parser;
use thiserror::Error;

const DEFAULT_GEARMAND_SERVER: &str = "localhost:4730";
const DEFAULT_JOB_QUEUE: &str = "curler";
const DEFAULT_NUM_WORKERS: u32 = 5;
const DEFAULT_RECONNECT_ATTEMPTS: u32 = 120;
const DEFAULT_RECONNECT_DELAY_SECS: u64 = 5;

/// Gearman worker daemon that executes jobs by POSTing their data to an
/// HTTP backend.
#[derive(Debug, Parser)]
#[command(name = "gearman-curler", version, about)]
pub struct Cli {
    /// Increase log verbosity; repeatable (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Comma-separated list of HTTP backend base URLs.
    #[arg(short = 'u', long = "base-urls", required = true, value_delimiter = ',')]
    pub base_urls: Vec<String>,

    /// Gearman function name this worker registers as.
    #[arg(short = 'q', long = "job-queue", default_value = DEFAULT_JOB_QUEUE)]
    pub job_queue: String,

    /// Gearman job server address (host:port). May be repeated for
    /// multiple brokers.
    #[arg(short = 'g', long = "gearmand-server", default_value = DEFAULT_GEARMAND_SERVER)]
    pub gearmand_server: Vec<String>,

    /// Number of cooperating worker drivers per broker connection.
    #[arg(short = 'n', long = "num-workers", default_value_t = DEFAULT_NUM_WORKERS)]
    pub num_workers: u32,

    /// Number of reconnect attempts before giving up on a broker.
    #[arg(long = "reconnect-attempts", default_value_t = DEFAULT_RECONNECT_ATTEMPTS)]
    pub reconnect_attempts: u32,

    /// Delay in seconds between reconnect attempts.
    #[arg(long = "reconnect-delay-secs", default_value_t = DEFAULT_RECONNECT_DELAY_SECS)]
    pub reconnect_delay_secs: u64,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("could not resolve gearman server address {0:?}: {1}")]
    ResolveServer(String, #[source] std::io::Error),
    #[error("gearman server address {0:?} resolved to no addresses")]
    NoAddress(String),
}

impl Cli {
    /// Resolve every configured `--gearmand-server` entry to a concrete
    /// socket address.
    pub fn resolve_brokers(&self) -> Result<Vec<SocketAddr>, CliError> {
        self.gearmand_server
            .iter()
            .map(|server| {
                server
                    .to_socket_addrs()
                    .map_err(|e| CliError::ResolveServer(server.clone(), e))?
                    .next()
                    .ok_or_else(|| CliError::NoAddress(server.clone()))
            })
            .collect()
    }
}
