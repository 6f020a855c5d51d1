// SPDX-License-Identifier: AGPL-3.0-or-later

//! Client-side Gearman protocol: submitting jobs and collecting their
//! results.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::warn;

use crate::gearman::{
    codec::{Frame, split_nul_once},
    constants::Command,
    session::{Session, SessionError},
};

/// Priority/background combination a job is submitted under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitMode {
    Normal,
    High,
    Low,
    BackgroundNormal,
    BackgroundHigh,
    BackgroundLow,
}

impl SubmitMode {
    fn command(self) -> Command {
        match self {
            SubmitMode::Normal => Command::SubmitJob,
            SubmitMode::High => Command::SubmitJobHigh,
            SubmitMode::Low => Command::SubmitJobLow,
            SubmitMode::BackgroundNormal => Command::SubmitJobBg,
            SubmitMode::BackgroundHigh => Command::SubmitJobHighBg,
            SubmitMode::BackgroundLow => Command::SubmitJobLowBg,
        }
    }

    fn is_background(self) -> bool {
        matches!(
            self,
            SubmitMode::BackgroundNormal | SubmitMode::BackgroundHigh | SubmitMode::BackgroundLow
        )
    }
}

/// The final outcome of a foreground job submission, including any
/// intermediate data/warning chunks the worker streamed back before
/// completing.
#[derive(Debug, Clone, Default)]
pub struct JobOutcome {
    /// `WORK_DATA` chunks, accumulated in arrival order. Distinct from
    /// [`JobOutcome::completion`]: a worker may stream any number of these
    /// before the one `WORK_COMPLETE` payload that ends the job.
    pub data: BytesMut,
    pub warnings: Vec<Bytes>,
    /// The payload carried by the terminal `WORK_COMPLETE` frame.
    pub completion: Bytes,
    pub failed: bool,
    pub exception: Option<Bytes>,
}

#[derive(Debug, Error)]
pub enum SubmitterError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("job server sent a malformed {0:?} payload")]
    MalformedPayload(Command),
    #[error("the tracking channel for job handle was dropped before the job finished")]
    TrackingChannelDropped,
    #[error("submitted job failed: {0:?}")]
    JobFailed(Option<Bytes>),
}

struct Tracked {
    outcome: JobOutcome,
    done: Option<oneshot::Sender<JobOutcome>>,
}

/// Submits jobs on a session and, for foreground submissions, waits for
/// their result.
pub struct Submitter {
    session: Arc<Session>,
    tracked: Arc<DashMap<Bytes, Tracked>>,
}

impl Submitter {
    /// Build a submitter around an already-connected session, wiring up
    /// the unsolicited subscriber that demultiplexes `WORK_*` frames by job
    /// handle.
    ///
    /// Registration is awaited before this returns, just like
    /// [`crate::gearman::worker::Worker::new`]: otherwise a `WORK_COMPLETE`
    /// for a job submitted immediately afterward could race the subscriber
    /// being wired up and be silently dropped.
    pub async fn new(session: Arc<Session>) -> Arc<Self> {
        let tracked: Arc<DashMap<Bytes, Tracked>> = Arc::new(DashMap::new());

        let handler_tracked = Arc::clone(&tracked);
        session
            .register_unsolicited(Arc::new(move |frame: Frame| {
                handle_work_frame(&handler_tracked, frame);
            }))
            .await;

        Arc::new(Self { session, tracked })
    }

    /// Whether `handle` still has a tracked foreground submission awaiting
    /// a terminal `WORK_COMPLETE`/`WORK_FAIL`. Mainly useful for tests and
    /// diagnostics: a well-behaved broker leaves no entries behind once
    /// every submitted job finishes.
    pub fn has_tracked_handle(&self, handle: &Bytes) -> bool {
        self.tracked.contains_key(handle)
    }

    /// Submit a job and, for foreground modes, block until the worker
    /// reports completion (or failure). Background modes return as soon
    /// as the job handle is assigned.
    pub async fn submit(
        &self,
        function: &str,
        unique_id: &str,
        workload: &[u8],
        mode: SubmitMode,
    ) -> Result<(Bytes, Option<JobOutcome>), SubmitterError> {
        let mut payload = BytesMut::with_capacity(function.len() + unique_id.len() + workload.len() + 2);
        payload.extend_from_slice(function.as_bytes());
        payload.extend_from_slice(b"\0");
        payload.extend_from_slice(unique_id.as_bytes());
        payload.extend_from_slice(b"\0");
        payload.extend_from_slice(workload);

        let reply = self
            .session
            .send(&Frame::new(mode.command(), payload.freeze()))
            .await?;

        if reply.command != Command::JobCreated {
            warn!(command = ?reply.command, "gearman submitter: unexpected reply to job submission");
            return Err(SubmitterError::MalformedPayload(reply.command));
        }
        let handle = reply.payload;

        if mode.is_background() {
            return Ok((handle, None));
        }

        let (tx, rx) = oneshot::channel();
        self.tracked.insert(
            handle.clone(),
            Tracked {
                outcome: JobOutcome::default(),
                done: Some(tx),
            },
        );

        let outcome = rx.await.map_err(|_| SubmitterError::TrackingChannelDropped)?;
        if outcome.failed {
            return Err(SubmitterError::JobFailed(outcome.exception.clone()));
        }
        Ok((handle, Some(outcome)))
    }

    pub async fn submit_high(&self, function: &str, unique_id: &str, workload: &[u8]) -> Result<JobOutcome, SubmitterError> {
        self.submit(function, unique_id, workload, SubmitMode::High)
            .await
            .map(|(_, outcome)| outcome.unwrap_or_default())
    }

    pub async fn submit_low(&self, function: &str, unique_id: &str, workload: &[u8]) -> Result<JobOutcome, SubmitterError> {
        self.submit(function, unique_id, workload, SubmitMode::Low)
            .await
            .map(|(_, outcome)| outcome.unwrap_or_default())
    }

    pub async fn submit_foreground(&self, function: &str, unique_id: &str, workload: &[u8]) -> Result<JobOutcome, SubmitterError> {
        self.submit(function, unique_id, workload, SubmitMode::Normal)
            .await
            .map(|(_, outcome)| outcome.unwrap_or_default())
    }

    pub async fn submit_background(&self, function: &str, unique_id: &str, workload: &[u8]) -> Result<Bytes, SubmitterError> {
        self.submit(function, unique_id, workload, SubmitMode::BackgroundNormal)
            .await
            .map(|(handle, _)| handle)
    }

    pub async fn submit_background_high(&self, function: &str, unique_id: &str, workload: &[u8]) -> Result<Bytes, SubmitterError> {
        self.submit(function, unique_id, workload, SubmitMode::BackgroundHigh)
            .await
            .map(|(handle, _)| handle)
    }

    pub async fn submit_background_low(&self, function: &str, unique_id: &str, workload: &[u8]) -> Result<Bytes, SubmitterError> {
        self.submit(function, unique_id, workload, SubmitMode::BackgroundLow)
            .await
            .map(|(handle, _)| handle)
    }
}

fn handle_work_frame(tracked: &DashMap<Bytes, Tracked>, frame: Frame) {
    let Some((handle, rest)) = split_nul_once(&frame.payload) else {
        warn!(command = ?frame.command, "gearman submitter: malformed WORK_* payload, no handle separator");
        return;
    };

    // `finish()` removes `handle` from `tracked`, which would deadlock if
    // called while still holding this shard's `get_mut` guard, so the
    // removal happens after the guard is dropped at the end of this block.
    let mut terminal = false;
    {
        let Some(mut entry) = tracked.get_mut(&handle) else {
            // the job may have been submitted in the background, or this
            // worker is sharing the connection with another submitter;
            // either way there's nobody waiting on this handle.
            return;
        };

        match frame.command {
            Command::WorkData => entry.outcome.data.extend_from_slice(&rest),
            Command::WorkWarning => entry.outcome.warnings.push(rest),
            Command::WorkComplete => {
                entry.outcome.completion = rest;
                finish(&mut entry);
                terminal = true;
            }
            Command::WorkFail => {
                entry.outcome.failed = true;
                finish(&mut entry);
                terminal = true;
            }
            Command::WorkException => {
                // Informational only: WORK_FAIL always follows and is the
                // authoritative terminal event, so this doesn't resolve
                // the caller's future.
                entry.outcome.exception = Some(rest);
            }
            _ => {}
        }
    }

    if terminal {
        tracked.remove(&handle);
    }
}

fn finish(entry: &mut Tracked) {
    if let Some(tx) = entry.done.take() {
        let _ = tx.send(entry.outcome.clone());
    }
}
