// SPDX-License-Identifier: AGPL-3.0-or-later

//! Owns one [`Worker`] per configured job server, keeping each connected
//! and reconnecting on failure until asked to shut down.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::gearman::{
    session::{Session, SessionError},
    worker::{JobHandler, Worker, WorkerError},
};

/// Staggering applied between starting successive broker driver tasks, so
/// that a fleet of workers doesn't all hit every broker in the same
/// instant on startup.
const STARTUP_STAGGER: Duration = Duration::from_millis(100);

/// How hard to try reconnecting to a broker before giving up on it.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 120,
            delay: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
}

/// A function name plus the handler it should be registered against on
/// every broker this supervisor manages.
#[derive(Clone)]
pub struct FunctionRegistration {
    pub name: String,
    pub handler: Arc<dyn JobHandler>,
}

/// Drives one worker connection per broker address, reconnecting broker
/// connections independently of one another. Each broker connection is
/// shared by `num_workers` cooperating driver tasks, matching the
/// upstream behavior of N workers racing GRAB_JOB over one socket.
pub struct Supervisor {
    brokers: Vec<SocketAddr>,
    functions: Vec<FunctionRegistration>,
    client_id: Option<String>,
    num_workers: u32,
    reconnect: ReconnectPolicy,
    cancel: CancellationToken,
}

impl Supervisor {
    pub fn new(
        brokers: Vec<SocketAddr>,
        functions: Vec<FunctionRegistration>,
        client_id: Option<String>,
        num_workers: u32,
    ) -> Self {
        Self::with_reconnect_policy(brokers, functions, client_id, num_workers, ReconnectPolicy::default())
    }

    pub fn with_reconnect_policy(
        brokers: Vec<SocketAddr>,
        functions: Vec<FunctionRegistration>,
        client_id: Option<String>,
        num_workers: u32,
        reconnect: ReconnectPolicy,
    ) -> Self {
        Self {
            brokers,
            functions,
            client_id,
            num_workers: num_workers.max(1),
            reconnect,
            cancel: CancellationToken::new(),
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Start one driver task per broker and wait for all of them to exit,
    /// which happens only once `cancel` has fired (or an unrecoverable
    /// error occurs).
    pub async fn run(&self) -> Result<(), SupervisorError> {
        let mut tasks = Vec::with_capacity(self.brokers.len());

        for (idx, &addr) in self.brokers.iter().enumerate() {
            let functions = self.functions.clone();
            let client_id = self.client_id.clone();
            let cancel = self.cancel.clone();
            let num_workers = self.num_workers;
            let reconnect = self.reconnect;
            let stagger = STARTUP_STAGGER * idx as u32;

            tasks.push(tokio::spawn(async move {
                sleep(stagger).await;
                drive_broker(addr, functions, client_id, num_workers, reconnect, cancel).await;
            }));
        }

        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "gearman supervisor: broker driver task panicked");
            }
        }

        Ok(())
    }

    /// Signal every driver task to finish its current job loop iteration
    /// and stop.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

async fn drive_broker(
    addr: SocketAddr,
    functions: Vec<FunctionRegistration>,
    client_id: Option<String>,
    num_workers: u32,
    reconnect: ReconnectPolicy,
    cancel: CancellationToken,
) {
    let mut attempt: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return;
        }

        match connect_and_run(addr, &functions, client_id.as_deref(), num_workers, cancel.clone()).await {
            Ok(()) => {
                info!(broker = %addr, "gearman supervisor: worker loop ended cleanly");
                return;
            }
            Err(e) => {
                attempt += 1;
                warn!(broker = %addr, attempt, error = %e, "gearman supervisor: connection to broker failed");
                if attempt >= reconnect.max_attempts {
                    error!(broker = %addr, attempts = reconnect.max_attempts, "gearman supervisor: giving up on broker");
                    return;
                }
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    _ = sleep(reconnect.delay) => {}
                }
            }
        }
    }
}

/// Connect once, register abilities, then run `num_workers` driver tasks
/// sharing the resulting [`Worker`]/[`Session`] until one of them fails
/// (signaling the connection is lost) or `cancel` fires.
async fn connect_and_run(
    addr: SocketAddr,
    functions: &[FunctionRegistration],
    client_id: Option<&str>,
    num_workers: u32,
    cancel: CancellationToken,
) -> Result<(), SupervisorError> {
    let session = Session::connect(addr).await?;
    let worker = Worker::new(Arc::clone(&session)).await;

    if let Some(client_id) = client_id {
        worker.set_client_id(client_id).await?;
    }

    for reg in functions {
        worker.register_function(reg.name.clone(), Arc::clone(&reg.handler)).await?;
    }

    info!(broker = %addr, functions = functions.len(), num_workers, "gearman supervisor: worker connected and registered");

    let mut drivers = tokio::task::JoinSet::new();
    for driver_idx in 0..num_workers {
        let worker = Arc::clone(&worker);
        let cancel = cancel.clone();
        let stagger = STARTUP_STAGGER * driver_idx;
        drivers.spawn(async move {
            sleep(stagger).await;
            worker.do_jobs_forever(cancel).await
        });
    }

    let mut outcome: Result<(), SupervisorError> = Ok(());
    while let Some(joined) = drivers.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                outcome = Err(e.into());
                drivers.abort_all();
            }
            Err(e) => {
                error!(broker = %addr, error = %e, "gearman supervisor: worker driver task panicked");
            }
        }
    }

    session.shutdown();
    outcome
}
