// SPDX-License-Identifier: AGPL-3.0-or-later

//! Worker-side Gearman protocol: registering job functions, pulling
//! assigned jobs off a session, and reporting their outcome.

use std::{
    future::Future,
    panic::AssertUnwindSafe,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use dashmap::DashMap;
use futures::FutureExt;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::gearman::{
    codec::{Frame, split_nul_once},
    constants::Command,
    session::{Session, SessionError},
};

/// A job handed to this worker by a job server, ready to be run.
#[derive(Debug, Clone)]
pub struct Job {
    pub handle: Bytes,
    pub function_name: String,
    pub payload: Bytes,
}

/// Errors a job handler can return. These are reported back to the job
/// server as `WORK_EXCEPTION` followed by `WORK_FAIL`.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("{0}")]
    Message(String),
}

impl JobError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self::Message(msg.into())
    }
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A unit of work registered under a Gearman function name.
///
/// Defined with a boxed-future method rather than an `async fn` so that
/// `Arc<dyn JobHandler>` can be stored in a registry: `async fn` in traits
/// is not object-safe.
pub trait JobHandler: Send + Sync {
    fn run<'a>(&'a self, job: &'a Job) -> BoxFuture<'a, Result<Option<Bytes>, JobError>>;
}

impl<F> JobHandler for F
where
    F: for<'a> Fn(&'a Job) -> BoxFuture<'a, Result<Option<Bytes>, JobError>> + Send + Sync,
{
    fn run<'a>(&'a self, job: &'a Job) -> BoxFuture<'a, Result<Option<Bytes>, JobError>> {
        (self)(job)
    }
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("no handler registered for function {0:?}")]
    NoSuchFunction(String),
    #[error("job server sent a malformed JOB_ASSIGN payload")]
    MalformedJobAssign,
}

/// Upper bound on how long a single job handler is allowed to run before
/// its driver task gives up waiting on it. Applies uniformly, not just
/// during shutdown: a handler that hangs forever must not wedge a whole
/// driver slot forever either.
const JOB_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

fn parse_job_assign(payload: &Bytes) -> Option<(Bytes, String, Bytes)> {
    let (handle, rest) = split_nul_once(payload)?;
    let (func, workload) = split_nul_once(&rest)?;
    let func = String::from_utf8(func.to_vec()).ok()?;
    Some((handle, func, workload))
}

/// Drives one worker connection: registers abilities, grabs jobs, and
/// reports results.
pub struct Worker {
    session: Arc<Session>,
    functions: DashMap<String, Arc<dyn JobHandler>>,
    noop_tx: watch::Sender<u64>,
    noop_count: Arc<AtomicU64>,
    /// Set by whichever sleeper in a batch wins the race to send
    /// `PRE_SLEEP`; cleared again when `NOOP` arrives so the next batch
    /// of sleepers sends its own.
    sleeping: Arc<AtomicBool>,
}

impl Worker {
    /// Build a worker around an already-connected session. Registers the
    /// unsolicited subscriber that feeds the sleep-coalescing wakeup
    /// channel before returning, so no `NOOP` can arrive and be dropped
    /// before a caller gets a chance to sleep on it.
    pub async fn new(session: Arc<Session>) -> Arc<Self> {
        let (noop_tx, _noop_rx) = watch::channel(0u64);
        let noop_count = Arc::new(AtomicU64::new(0));
        let sleeping = Arc::new(AtomicBool::new(false));

        let tx = noop_tx.clone();
        let count = Arc::clone(&noop_count);
        let sleeping_for_handler = Arc::clone(&sleeping);
        session
            .register_unsolicited(Arc::new(move |frame: Frame| {
                if frame.command != Command::Noop {
                    return;
                }
                sleeping_for_handler.store(false, Ordering::SeqCst);
                let next = count.fetch_add(1, Ordering::SeqCst) + 1;
                let _ = tx.send(next);
            }))
            .await;

        Arc::new(Self {
            session,
            functions: DashMap::new(),
            noop_tx,
            noop_count,
            sleeping,
        })
    }

    pub async fn set_client_id(&self, client_id: &str) -> Result<(), WorkerError> {
        self.session
            .send_raw(&Frame::new(Command::SetClientId, Bytes::copy_from_slice(client_id.as_bytes())))
            .await?;
        Ok(())
    }

    /// Announce ability to perform `name`, remembering `handler` so that
    /// [`Worker::do_job`] can dispatch assigned jobs to it.
    pub async fn register_function(&self, name: impl Into<String>, handler: Arc<dyn JobHandler>) -> Result<(), WorkerError> {
        let name = name.into();
        self.session
            .send_raw(&Frame::new(Command::CanDo, Bytes::copy_from_slice(name.as_bytes())))
            .await?;
        self.functions.insert(name, handler);
        Ok(())
    }

    pub async fn unregister_function(&self, name: &str) -> Result<(), WorkerError> {
        self.session
            .send_raw(&Frame::new(Command::CantDo, Bytes::copy_from_slice(name.as_bytes())))
            .await?;
        self.functions.remove(name);
        Ok(())
    }

    /// Ask the job server for the next queued job matching one of our
    /// registered abilities. Returns `None` if none is currently queued
    /// (the caller should then call [`Worker::sleep_until_noop`]).
    pub async fn get_job(&self) -> Result<Option<Job>, WorkerError> {
        let reply = self.session.send(&Frame::new(Command::GrabJob, Bytes::new())).await?;
        match reply.command {
            Command::NoJob => Ok(None),
            Command::JobAssign => {
                let (handle, function_name, payload) =
                    parse_job_assign(&reply.payload).ok_or(WorkerError::MalformedJobAssign)?;
                Ok(Some(Job {
                    handle,
                    function_name,
                    payload,
                }))
            }
            other => {
                warn!(command = ?other, "gearman worker: unexpected reply to GRAB_JOB");
                Err(WorkerError::MalformedJobAssign)
            }
        }
    }

    /// Tell the job server this worker has nothing to do and block until
    /// a `NOOP` wakes it (or any other queued job arrives and later wakes
    /// it). Several callers sleeping concurrently on the same connection
    /// are all woken by a single `NOOP`: the `watch` channel captures
    /// "seen" state at subscribe time, so unlike `tokio::sync::Notify`
    /// there is no window between subscribing and awaiting in which a
    /// wakeup can be missed.
    ///
    /// Only the first sleeper of a batch actually writes `PRE_SLEEP` to
    /// the wire: `sleeping` is CAS'd `false -> true` before the send, and
    /// every concurrent sleeper that loses the race just waits on the
    /// shared wakeup. `NOOP` resets the flag so the next batch sends its
    /// own `PRE_SLEEP`.
    pub async fn sleep_until_noop(&self) -> Result<(), WorkerError> {
        let mut rx = self.noop_tx.subscribe();
        let is_first = self
            .sleeping
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if is_first {
            if let Err(e) = self.session.send_raw(&Frame::new(Command::PreSleep, Bytes::new())).await {
                self.sleeping.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        }
        rx.changed().await.ok();
        Ok(())
    }

    async fn send_job_result(&self, handle: &Bytes, result: Result<Option<Bytes>, String>) -> Result<(), WorkerError> {
        match result {
            Ok(data) => {
                let mut payload = bytes::BytesMut::with_capacity(handle.len() + 1 + data.as_ref().map_or(0, Bytes::len));
                payload.extend_from_slice(handle);
                payload.extend_from_slice(b"\0");
                if let Some(data) = data {
                    payload.extend_from_slice(&data);
                }
                self.session
                    .send_raw(&Frame::new(Command::WorkComplete, payload.freeze()))
                    .await?;
            }
            Err(message) => {
                let mut exc_payload = bytes::BytesMut::with_capacity(handle.len() + 1 + message.len());
                exc_payload.extend_from_slice(handle);
                exc_payload.extend_from_slice(b"\0");
                exc_payload.extend_from_slice(message.as_bytes());
                self.session
                    .send_raw(&Frame::new(Command::WorkException, exc_payload.freeze()))
                    .await?;

                let mut fail_payload = bytes::BytesMut::with_capacity(handle.len() + 1);
                fail_payload.extend_from_slice(handle);
                fail_payload.extend_from_slice(b"\0");
                self.session
                    .send_raw(&Frame::new(Command::WorkFail, fail_payload.freeze()))
                    .await?;
            }
        }
        Ok(())
    }

    /// Run the handler registered for `job.function_name` and report the
    /// outcome. A handler panic is caught and reported as a
    /// `WORK_EXCEPTION`/`WORK_FAIL` pair rather than unwinding through the
    /// worker loop and taking the whole connection down with it.
    pub async fn finish_job(&self, job: &Job) -> Result<(), WorkerError> {
        let Some(handler) = self.functions.get(&job.function_name).map(|h| Arc::clone(h.value())) else {
            return Err(WorkerError::NoSuchFunction(job.function_name.clone()));
        };

        let outcome = AssertUnwindSafe(handler.run(job)).catch_unwind().await;

        let result = match outcome {
            Ok(Ok(data)) => Ok(data),
            Ok(Err(e)) => Err(format!("JobError({e})")),
            Err(panic) => {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(function = %job.function_name, panic = %msg, "gearman worker: job handler panicked");
                Err(format!("Panic({msg})"))
            }
        };

        self.send_job_result(&job.handle, result).await
    }

    /// Run a single grab/sleep/execute cycle: pull a job if one is queued,
    /// running its handler, or sleep until `NOOP` wakes this worker.
    ///
    /// `cancel` only ever preempts the grab/sleep half of the cycle. Once
    /// `get_job` has handed back an assigned job, it runs to completion
    /// unconditionally (bounded by [`JOB_DRAIN_TIMEOUT`]): an already
    /// running handler is allowed to finish and report its result even if
    /// shutdown fires mid-job.
    pub async fn do_jobs(&self, cancel: &tokio_util::sync::CancellationToken) -> Result<(), WorkerError> {
        let job = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            res = self.get_job() => res?,
        };

        match job {
            Some(job) => {
                debug!(function = %job.function_name, "gearman worker: running job");
                match tokio::time::timeout(JOB_DRAIN_TIMEOUT, self.finish_job(&job)).await {
                    Ok(res) => res?,
                    Err(_) => {
                        error!(
                            function = %job.function_name,
                            handle = ?job.handle,
                            timeout = ?JOB_DRAIN_TIMEOUT,
                            "gearman worker: job handler exceeded drain timeout, abandoning it"
                        );
                    }
                }
            }
            None => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {}
                    res = self.sleep_until_noop() => res?,
                }
            }
        }
        Ok(())
    }

    /// Run [`Worker::do_jobs`] forever until `cancel` fires or a session
    /// error occurs.
    pub async fn do_jobs_forever(&self, cancel: tokio_util::sync::CancellationToken) -> Result<(), WorkerError> {
        info!("gearman worker: entering job loop");
        while !cancel.is_cancelled() {
            self.do_jobs(&cancel).await?;
        }
        info!("gearman worker: job loop cancelled");
        Ok(())
    }
}
