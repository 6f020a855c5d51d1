// SPDX-License-Identifier: AGPL-3.0-or-later

//! The job handler that bridges a Gearman job to an HTTP POST: this is
//! the one piece of business logic the rest of the crate exists to run.

use std::{panic::AssertUnwindSafe, pin::Pin};

use bytes::Bytes;
use futures::FutureExt;
use rand::Rng;
use serde_json::{Map, Value, json};
use tracing::{error, info, warn};

use crate::gearman::worker::{Job, JobError, JobHandler};

/// POSTs job data to one of a configured set of HTTP backends and shapes
/// the reply document Gearman sends back as the job's result.
pub struct CurlerJobHandler {
    base_urls: Vec<String>,
    http: reqwest::Client,
}

impl CurlerJobHandler {
    pub fn new(base_urls: Vec<String>) -> Self {
        Self {
            base_urls,
            http: reqwest::Client::new(),
        }
    }

    fn pick_base_url(&self) -> &str {
        let idx = rand::rng().random_range(0..self.base_urls.len());
        &self.base_urls[idx]
    }

    async fn run_job(&self, job: &Job) -> Bytes {
        let handle = String::from_utf8_lossy(&job.handle).into_owned();
        let mut reply = Map::new();
        reply.insert("job_handle".to_string(), json!(handle));

        let job_data: Value = match serde_json::from_slice(&job.payload) {
            Ok(v) => v,
            Err(_) => {
                warn!(handle = %handle, "curler: job payload is not valid JSON");
                reply.insert("error".to_string(), json!("Job data is not valid JSON"));
                reply.insert("job_data".to_string(), json!(String::from_utf8_lossy(&job.payload)));
                return render(&reply);
            }
        };

        let Some(method) = job_data.get("method").and_then(Value::as_str) else {
            warn!(handle = %handle, "curler: job payload missing method");
            reply.insert("error".to_string(), json!("Missing \"method\" property in job data"));
            reply.insert("job_data".to_string(), json!(String::from_utf8_lossy(&job.payload)));
            return render(&reply);
        };

        let Some(data) = job_data.get("data").filter(|v| v.is_object()) else {
            warn!(handle = %handle, "curler: job payload missing data");
            reply.insert("error".to_string(), json!("Missing \"data\" property in job data"));
            reply.insert("job_data".to_string(), json!(String::from_utf8_lossy(&job.payload)));
            return render(&reply);
        };

        let base_url = self.pick_base_url();
        let url = format!("{}/{}", base_url.trim_end_matches('/'), method);

        let data_json = match serde_json::to_string(data) {
            Ok(s) => s,
            Err(e) => {
                error!(handle = %handle, error = %e, "curler: failed to re-serialize job data");
                reply.insert("error".to_string(), json!("Internal curler error. Check the logs."));
                reply.insert("job_data".to_string(), json!(String::from_utf8_lossy(&job.payload)));
                return render(&reply);
            }
        };

        let body = format!(
            "data={}&job_handle={}",
            urlencoding::encode(&data_json),
            urlencoding::encode(&handle)
        );

        info!(handle = %handle, %url, "curler: dispatching job");

        match self
            .http
            .post(&url)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await
        {
            Ok(response) => {
                let real_status = response.status();
                // The backend's literal status code is only surfaced on
                // failure; any 2xx is reported as a flat 200, matching
                // twisted's getPage (which never exposes the real code on
                // success, only Error.status on failure).
                let status = if real_status.is_success() { 200 } else { real_status.as_u16() };
                let body_text = response.text().await.unwrap_or_default();
                reply.insert("url".to_string(), json!(url));
                reply.insert("status".to_string(), json!(status));
                reply.insert("response".to_string(), json!(body_text));
                if !real_status.is_success() {
                    warn!(handle = %handle, status = real_status.as_u16(), "curler: backend returned non-2xx");
                }
            }
            Err(e) => {
                warn!(handle = %handle, error = %e, "curler: POST to backend failed");
                reply.insert("error".to_string(), json!(format!("POST failed: {e}")));
                reply.insert("job_data".to_string(), json!(String::from_utf8_lossy(&job.payload)));
            }
        }

        render(&reply)
    }
}

fn render(reply: &Map<String, Value>) -> Bytes {
    let text = serde_json::to_string_pretty(reply).unwrap_or_else(|_| "{}".to_string());
    Bytes::from(text.into_bytes())
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

impl JobHandler for CurlerJobHandler {
    fn run<'a>(&'a self, job: &'a Job) -> BoxFuture<'a, Result<Option<Bytes>, JobError>> {
        Box::pin(async move {
            // This handler is not expected to panic, but per the job
            // adapter's own error-handling contract it still guards its
            // internal work: only a genuine bug should ever escalate past
            // here to the worker's own panic-to-WORK_EXCEPTION path.
            match AssertUnwindSafe(self.run_job(job)).catch_unwind().await {
                Ok(bytes) => Ok(Some(bytes)),
                Err(panic) => {
                    let msg = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    error!(function = %job.function_name, panic = %msg, "curler: internal handler error");
                    let handle = String::from_utf8_lossy(&job.handle).into_owned();
                    let mut reply = Map::new();
                    reply.insert("job_handle".to_string(), json!(handle));
                    reply.insert("error".to_string(), json!("Internal curler error. Check the logs."));
                    reply.insert("job_data".to_string(), json!(String::from_utf8_lossy(&job.payload)));
                    Ok(Some(render(&reply)))
                }
            }
        })
    }
}
