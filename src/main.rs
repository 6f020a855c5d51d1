// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use gearman_curler::{
    cfg::{cli::Cli, logger},
    curler::adapter::CurlerJobHandler,
    gearman::supervisor::{FunctionRegistration, ReconnectPolicy, Supervisor},
};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logger::init(cli.verbose);

    let brokers = cli
        .resolve_brokers()
        .context("failed to resolve configured gearman servers")?;

    let handler: Arc<dyn gearman_curler::gearman::worker::JobHandler> =
        Arc::new(CurlerJobHandler::new(cli.base_urls.clone()));

    let functions = vec![FunctionRegistration {
        name: cli.job_queue.clone(),
        handler,
    }];

    info!(
        brokers = ?cli.gearmand_server,
        queue = %cli.job_queue,
        num_workers = cli.num_workers,
        "gearman-curler: starting"
    );

    let supervisor = Arc::new(Supervisor::with_reconnect_policy(
        brokers,
        functions,
        Some("gearman-curler".to_string()),
        cli.num_workers,
        ReconnectPolicy {
            max_attempts: cli.reconnect_attempts,
            delay: std::time::Duration::from_secs(cli.reconnect_delay_secs),
        },
    ));
    let cancel = supervisor.cancellation_token();

    let mut run_handle = {
        let supervisor = Arc::clone(&supervisor);
        tokio::spawn(async move { supervisor.run().await })
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("gearman-curler: received shutdown signal, draining in-flight jobs");
            cancel.cancel();
        }
        res = &mut run_handle => {
            if let Err(e) = res {
                tracing::error!(error = %e, "gearman-curler: supervisor task panicked");
            }
            return Ok(());
        }
    }

    if let Err(e) = run_handle.await {
        tracing::error!(error = %e, "gearman-curler: supervisor task panicked during drain");
    }

    info!("gearman-curler: shut down cleanly");
    Ok(())
}
