// SPDX-License-Identifier: AGPL-3.0-or-later

//! Structured logging setup, verbosity driven by the CLI's repeated `-v`.

use tracing_subscriber::{EnvFilter, fmt};

/// Initialize the global `tracing` subscriber.
///
/// `verbosity` is the number of times `-v` was passed: 0 → info, 1 →
/// debug, 2+ → trace. `RUST_LOG` always takes precedence when set, so
/// operators can still scope logging per-module in production.
pub fn init(verbosity: u8) {
    let default_level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    fmt().with_env_filter(filter).with_target(true).init();
}
