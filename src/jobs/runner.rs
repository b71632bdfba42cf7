//! Submit, poll and fetch

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

use super::{ArtifactParser, AsyncJob, JobState};
use crate::error::{Result, SyncError, TransportError};
use crate::reconcile::RawRecord;
use crate::transport::{Request, Transport};

/// HTTP method of the status endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusMethod {
    #[default]
    Get,
    Post,
}

/// How one provider's report jobs are tracked.
///
/// `status_path` and string leaves of `status_body` may contain `{job_id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobProtocol {
    /// JSON pointer to the job id in the submit response
    pub job_id_pointer: String,
    #[serde(default)]
    pub status_method: StatusMethod,
    pub status_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_body: Option<Value>,
    /// JSON pointer to the status word in the poll response
    pub state_pointer: String,
    /// Provider status words that the built-in vocabulary does not cover
    #[serde(default)]
    pub states: HashMap<String, JobState>,
    /// JSON pointer to the artifact location in a finished poll response
    pub artifact_pointer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_pointer: Option<String>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_polls")]
    pub max_polls: u32,
    /// Whether the artifact download carries the provider auth headers
    #[serde(default = "default_authenticated_download")]
    pub authenticated_download: bool,
}

fn default_poll_interval_ms() -> u64 {
    5000
}

fn default_max_polls() -> u32 {
    60
}

fn default_authenticated_download() -> bool {
    true
}

impl JobProtocol {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    fn state_for(&self, status: &str) -> JobState {
        if let Some(state) = self.states.get(status) {
            return *state;
        }
        match JobState::from_provider_status(status) {
            Some(state) => state,
            None => {
                tracing::warn!(status, "Unknown job status, treating as still running");
                JobState::Running
            }
        }
    }

    fn status_request(&self, job_id: &str) -> Request {
        let path = self
            .status_path
            .replace("{job_id}", &urlencoding::encode(job_id));
        match self.status_method {
            StatusMethod::Get => Request::get(path),
            StatusMethod::Post => {
                let body = self
                    .status_body
                    .as_ref()
                    .map(|body| substitute_job_id(body, job_id))
                    .unwrap_or(Value::Null);
                // Polling reads state, so repeating it is harmless
                Request::post(path).with_body(body).idempotent()
            }
        }
    }
}

fn substitute_job_id(value: &Value, job_id: &str) -> Value {
    match value {
        Value::String(s) => Value::String(s.replace("{job_id}", job_id)),
        Value::Array(items) => Value::Array(items.iter().map(|v| substitute_job_id(v, job_id)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute_job_id(v, job_id)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Drives one provider's job protocol for one client
pub struct JobRunner<'a> {
    transport: &'a Transport,
    protocol: &'a JobProtocol,
}

impl<'a> JobRunner<'a> {
    pub fn new(transport: &'a Transport, protocol: &'a JobProtocol) -> Self {
        Self {
            transport,
            protocol,
        }
    }

    /// Submit a job with exactly one request.
    ///
    /// Submission is never retried here: a repeated submit may create a
    /// second job on the provider side.
    pub async fn submit(&self, request: &Request) -> Result<AsyncJob> {
        let response = self.transport.call_once(request).await?;
        let job_id = response
            .pointer(&self.protocol.job_id_pointer)
            .and_then(scalar_text)
            .ok_or_else(|| {
                TransportError::MalformedBody(format!(
                    "submit response has no job id at {}",
                    self.protocol.job_id_pointer
                ))
            })?;

        tracing::info!(
            provider = %self.transport.provider().name(),
            client = %self.transport.client().client_id,
            job_id = %job_id,
            "Submitted report job"
        );
        Ok(AsyncJob::submitted(job_id))
    }

    /// Query the job status once and record the new state.
    ///
    /// A finished job that names no artifact is reported as
    /// [`JobState::NoData`].
    pub async fn poll(&self, job: &mut AsyncJob) -> Result<JobState> {
        let response = self
            .transport
            .call(&self.protocol.status_request(&job.job_id))
            .await?;

        let status = response
            .pointer(&self.protocol.state_pointer)
            .and_then(scalar_text)
            .ok_or_else(|| {
                TransportError::MalformedBody(format!(
                    "status response has no state at {}",
                    self.protocol.state_pointer
                ))
            })?;

        let mut state = self.protocol.state_for(&status);
        let artifact_ref = response
            .pointer(&self.protocol.artifact_pointer)
            .and_then(scalar_text);
        if state == JobState::Done && artifact_ref.is_none() {
            tracing::warn!(
                job_id = %job.job_id,
                status = %status,
                pointer = %self.protocol.artifact_pointer,
                "Job reported done without an artifact reference, treating it as no data"
            );
            state = JobState::NoData;
        }
        let error = self
            .protocol
            .error_pointer
            .as_deref()
            .and_then(|p| response.pointer(p))
            .and_then(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Null => None,
                other => Some(other.to_string()),
            });

        tracing::debug!(job_id = %job.job_id, status = %status, state = ?state, "Polled report job");
        job.transition(state, artifact_ref, error);
        Ok(state)
    }

    /// Poll until the job reaches a terminal state, at most `max_polls` times.
    ///
    /// `Done` and `NoData` return normally; provider failures, cancellation
    /// and running out of polls are errors.
    pub async fn wait(&self, job: &mut AsyncJob) -> Result<()> {
        for poll in 1..=self.protocol.max_polls {
            if poll > 1 {
                tokio::time::sleep(self.protocol.poll_interval()).await;
            }

            match self.poll(job).await? {
                JobState::Done | JobState::NoData => {
                    tracing::info!(job_id = %job.job_id, state = ?job.state(), polls = poll, "Report job finished");
                    return Ok(());
                }
                JobState::Failed => {
                    let reason = job
                        .error()
                        .unwrap_or("provider reported failure")
                        .to_string();
                    tracing::warn!(job_id = %job.job_id, reason = %reason, "Report job failed");
                    return Err(SyncError::JobFailed {
                        job_id: job.job_id.clone(),
                        reason,
                    });
                }
                JobState::Canceled => {
                    tracing::warn!(job_id = %job.job_id, "Report job canceled");
                    return Err(SyncError::JobCanceled {
                        job_id: job.job_id.clone(),
                    });
                }
                JobState::Submitted | JobState::Running => {}
            }
        }

        tracing::error!(
            job_id = %job.job_id,
            polls = self.protocol.max_polls,
            "Report job did not finish in time"
        );
        Err(SyncError::JobTimeout {
            job_id: job.job_id.clone(),
            polls: self.protocol.max_polls,
        })
    }

    /// Download the artifact of a finished job with exactly one request
    pub async fn fetch_artifact(&self, job: &AsyncJob) -> Result<Vec<u8>> {
        let artifact_error = |reason: String| SyncError::JobArtifact {
            job_id: job.job_id.clone(),
            reason,
        };

        let location = match (job.state(), job.artifact_ref()) {
            (JobState::Done, Some(location)) => location,
            (state, _) => {
                return Err(artifact_error(format!(
                    "job is {:?}, no artifact available",
                    state
                )))
            }
        };

        let bytes = match self
            .transport
            .download(location, self.protocol.authenticated_download)
            .await
        {
            Ok(bytes) => bytes,
            Err(e @ SyncError::Auth { .. }) => return Err(e),
            Err(e) => return Err(artifact_error(e.to_string())),
        };

        if bytes.is_empty() {
            return Err(artifact_error("artifact is empty".to_string()));
        }

        tracing::debug!(job_id = %job.job_id, bytes = bytes.len(), "Downloaded report artifact");
        Ok(bytes)
    }

    /// Submit, wait and parse. A job without data yields no records.
    pub async fn run(&self, submit: &Request, parser: &dyn ArtifactParser) -> Result<Vec<RawRecord>> {
        let mut job = self.submit(submit).await?;
        self.wait(&mut job).await?;

        if job.state() == JobState::NoData {
            return Ok(Vec::new());
        }

        let bytes = self.fetch_artifact(&job).await?;
        parser.parse(&bytes).map_err(|e| SyncError::JobArtifact {
            job_id: job.job_id.clone(),
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JsonArtifact;
    use crate::test_support::{client_context, ScriptedClient};
    use crate::transport::{AuthScheme, Provider, RetryPolicy};
    use serde_json::json;
    use std::sync::Arc;

    fn protocol() -> JobProtocol {
        serde_json::from_value(json!({
            "job_id_pointer": "/result/code",
            "status_method": "post",
            "status_path": "/v1/report/info",
            "status_body": {"code": "{job_id}"},
            "state_pointer": "/result/status",
            "artifact_pointer": "/result/file",
            "error_pointer": "/result/error",
            "poll_interval_ms": 0,
            "max_polls": 5
        }))
        .unwrap()
    }

    fn session(http: Arc<ScriptedClient>) -> Transport {
        Arc::new(
            Provider::new(
                "acme",
                "https://api.example.com",
                AuthScheme::Bearer,
                RetryPolicy::new(3, Duration::ZERO),
                http,
                4,
            )
            .unwrap(),
        )
        .session(client_context())
    }

    fn submit() -> Request {
        Request::post("/v1/report/create").with_body(json!({"from": "2024-01-01"}))
    }

    fn status(state: &str) -> Value {
        json!({"result": {"status": state}})
    }

    #[tokio::test]
    async fn test_running_running_done_fetches_artifact() {
        let http = Arc::new(ScriptedClient::new());
        http.push_json(200, json!({"result": {"code": "job-1"}}));
        http.push_json(200, status("processing"));
        http.push_json(200, status("processing"));
        http.push_json(
            200,
            json!({"result": {"status": "success", "file": "https://files.example.com/r.json"}}),
        );
        http.push_json(200, json!([{"sku": "A", "qty": 2}]));

        let transport = session(http.clone());
        let protocol = protocol();
        let runner = JobRunner::new(&transport, &protocol);
        let records = runner.run(&submit(), &JsonArtifact::default()).await.unwrap();

        assert_eq!(records.len(), 1);
        let sent = http.requests();
        assert_eq!(sent.len(), 5);
        assert_eq!(sent[1].body, Some(json!({"code": "job-1"})));
        assert_eq!(sent[4].url, "https://files.example.com/r.json");
    }

    #[tokio::test]
    async fn test_running_failed_does_not_download() {
        let http = Arc::new(ScriptedClient::new());
        http.push_json(200, json!({"result": {"code": "job-2"}}));
        http.push_json(200, status("processing"));
        http.push_json(200, json!({"result": {"status": "failed", "error": "quota"}}));

        let transport = session(http.clone());
        let protocol = protocol();
        let runner = JobRunner::new(&transport, &protocol);
        let err = runner
            .run(&submit(), &JsonArtifact::default())
            .await
            .unwrap_err();

        match err {
            SyncError::JobFailed { job_id, reason } => {
                assert_eq!(job_id, "job-2");
                assert_eq!(reason, "quota");
            }
            other => panic!("expected JobFailed, got {:?}", other),
        }
        assert_eq!(http.call_count(), 3);
    }

    #[tokio::test]
    async fn test_running_no_data_yields_empty() {
        let http = Arc::new(ScriptedClient::new());
        http.push_json(200, json!({"result": {"code": "job-3"}}));
        http.push_json(200, status("processing"));
        http.push_json(200, status("no_data"));

        let transport = session(http.clone());
        let protocol = protocol();
        let runner = JobRunner::new(&transport, &protocol);
        let records = runner.run(&submit(), &JsonArtifact::default()).await.unwrap();

        assert!(records.is_empty());
        assert_eq!(http.call_count(), 3);
    }

    #[tokio::test]
    async fn test_done_without_artifact_is_no_data() {
        let http = Arc::new(ScriptedClient::new());
        http.push_json(200, json!({"result": {"code": 77}}));
        http.push_json(200, status("success"));

        let transport = session(http.clone());
        let protocol = protocol();
        let runner = JobRunner::new(&transport, &protocol);
        let records = runner.run(&submit(), &JsonArtifact::default()).await.unwrap();

        assert!(records.is_empty());
        assert_eq!(http.call_count(), 2);
    }

    #[tokio::test]
    async fn test_poll_budget_exhausted_is_timeout() {
        let http = Arc::new(ScriptedClient::new());
        http.push_json(200, json!({"result": {"code": "job-4"}}));
        for _ in 0..5 {
            http.push_json(200, status("processing"));
        }

        let transport = session(http.clone());
        let protocol = protocol();
        let runner = JobRunner::new(&transport, &protocol);
        let err = runner
            .run(&submit(), &JsonArtifact::default())
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::JobTimeout { polls: 5, .. }));
        assert_eq!(http.call_count(), 6);
    }

    #[tokio::test]
    async fn test_canceled_job() {
        let http = Arc::new(ScriptedClient::new());
        http.push_json(200, json!({"result": {"code": "job-5"}}));
        http.push_json(200, status("cancelled"));

        let transport = session(http.clone());
        let protocol = protocol();
        let runner = JobRunner::new(&transport, &protocol);
        let err = runner
            .run(&submit(), &JsonArtifact::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::JobCanceled { .. }));
    }

    #[tokio::test]
    async fn test_submit_is_never_retried() {
        let http = Arc::new(ScriptedClient::new());
        http.push_status(503, "busy");
        http.push_json(200, json!({"result": {"code": "job-6"}}));

        let transport = session(http.clone());
        let protocol = protocol();
        let runner = JobRunner::new(&transport, &protocol);
        let err = runner.submit(&submit()).await.unwrap_err();

        assert!(matches!(
            err,
            SyncError::Transport(TransportError::Status { status: 503, .. })
        ));
        assert_eq!(http.call_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_or_empty_download_is_fatal() {
        let http = Arc::new(ScriptedClient::new());
        http.push_json(200, json!({"result": {"code": "job-7"}}));
        http.push_json(200, json!({"result": {"status": "success", "file": "/files/r.json"}}));
        http.push_status(500, "");
        http.push_json(200, json!([]));

        let transport = session(http.clone());
        let protocol = protocol();
        let runner = JobRunner::new(&transport, &protocol);
        let err = runner
            .run(&submit(), &JsonArtifact::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::JobArtifact { .. }));
        assert_eq!(http.call_count(), 3);

        let http = Arc::new(ScriptedClient::new());
        http.push_json(200, json!({"result": {"code": "job-8"}}));
        http.push_json(200, json!({"result": {"status": "success", "file": "/files/r.json"}}));
        http.push_status(200, "");

        let transport = session(http.clone());
        let runner = JobRunner::new(&transport, &protocol);
        let err = runner
            .run(&submit(), &JsonArtifact::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::JobArtifact { .. }));
    }

    #[tokio::test]
    async fn test_get_status_path_substitution() {
        let http = Arc::new(ScriptedClient::new());
        http.push_json(200, json!({"id": "a b"}));
        http.push_json(200, json!({"state": "no_data"}));

        let transport = session(http.clone());
        let protocol: JobProtocol = serde_json::from_value(json!({
            "job_id_pointer": "/id",
            "status_path": "/reports/{job_id}",
            "state_pointer": "/state",
            "artifact_pointer": "/url",
            "poll_interval_ms": 0
        }))
        .unwrap();
        let runner = JobRunner::new(&transport, &protocol);
        runner.run(&submit(), &JsonArtifact::default()).await.unwrap();

        assert_eq!(http.requests()[1].url, "https://api.example.com/reports/a%20b");
        assert_eq!(http.requests()[1].method, reqwest::Method::GET);
    }
}
