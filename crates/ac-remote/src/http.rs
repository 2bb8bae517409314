//! REST/JSON adapter for a hosted study service.
//!
//! | Operation | Request |
//! |-----------|---------|
//! | dispatch | `PUT {base}/jobs/{id}` with `{"job_id", "batches"}` |
//! | poll | `GET {base}/jobs/{id}/status?reclaim_timeout_seconds=..` → `{"status"}` |
//! | fetch | `GET {base}/jobs/{id}/observations` → `{"observations": {id: log}}` |
//! | release | `DELETE {base}/jobs/{id}/timers` |
//!
//! A log may be a JSON value or a string holding JSON.

use ac_types::{
    internal_error, invalid_parameter, AcResult, BackendError, JobId, JobStatus, Observation,
    ParticipantBatch, ParticipantId,
};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

use crate::backend::{BackendResult, RemoteBackend};

#[derive(Serialize)]
struct DispatchRequest<'a> {
    job_id: JobId,
    batches: &'a [ParticipantBatch],
}

#[derive(Deserialize)]
struct StatusResponse {
    status: JobStatus,
}

#[derive(Deserialize)]
struct ObservationsResponse {
    observations: BTreeMap<String, Value>,
}

/// Backend speaking to a study service over HTTP.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBackend {
    /// `headers` are sent verbatim on every request (auth tokens and the like).
    pub fn new(
        base_url: impl Into<String>,
        headers: &BTreeMap<String, String>,
        request_timeout: Duration,
    ) -> AcResult<Self> {
        let mut header_map = HeaderMap::new();
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| invalid_parameter!("header name {name:?}: {e}"))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| invalid_parameter!("header {}: {e}", name.as_str()))?;
            header_map.insert(name, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(header_map)
            .timeout(request_timeout)
            .build()
            .map_err(|e| internal_error!("failed to build HTTP client: {e}"))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn job_url(&self, job: JobId, suffix: &str) -> String {
        format!("{}/jobs/{}{}", self.base_url, job, suffix)
    }
}

fn transport_error(err: reqwest::Error) -> BackendError {
    if err.is_decode() {
        BackendError::Decode {
            message: err.to_string(),
        }
    } else {
        BackendError::Unavailable {
            message: err.to_string(),
        }
    }
}

/// Map a non-success response onto the backend error taxonomy.
async fn check_status(job: JobId, response: Response) -> BackendResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::NOT_FOUND => BackendError::UnknownJob { job_id: job },
        StatusCode::CONFLICT => BackendError::NotReady { job_id: job },
        StatusCode::TOO_MANY_REQUESTS => BackendError::Unavailable {
            message: format!("HTTP {status}: {body}"),
        },
        s if s.is_server_error() => BackendError::Unavailable {
            message: format!("HTTP {status}: {body}"),
        },
        _ => BackendError::Rejected {
            reason: format!("HTTP {status}: {body}"),
        },
    })
}

fn decode_observation(raw: Value) -> AcResult<Observation> {
    match raw {
        Value::String(text) => Observation::from_json(&text),
        other => Observation::from_value(other),
    }
}

#[async_trait]
impl RemoteBackend for HttpBackend {
    async fn dispatch(&self, job: JobId, batches: &[ParticipantBatch]) -> BackendResult<()> {
        let response = self
            .client
            .put(self.job_url(job, ""))
            .json(&DispatchRequest {
                job_id: job,
                batches,
            })
            .send()
            .await
            .map_err(transport_error)?;
        check_status(job, response).await?;
        debug!(job = %job, slots = batches.len(), "job uploaded");
        Ok(())
    }

    async fn poll_status(
        &self,
        job: JobId,
        reclaim_timeout: Duration,
    ) -> BackendResult<JobStatus> {
        let timeout = reclaim_timeout.as_secs_f64().to_string();
        let response = self
            .client
            .get(self.job_url(job, "/status"))
            .query(&[("reclaim_timeout_seconds", timeout.as_str())])
            .send()
            .await
            .map_err(transport_error)?;
        let body: StatusResponse = check_status(job, response)
            .await?
            .json()
            .await
            .map_err(transport_error)?;
        Ok(body.status)
    }

    async fn fetch_observations(
        &self,
        job: JobId,
    ) -> BackendResult<BTreeMap<ParticipantId, Observation>> {
        let response = self
            .client
            .get(self.job_url(job, "/observations"))
            .send()
            .await
            .map_err(transport_error)?;
        let body: ObservationsResponse = check_status(job, response)
            .await?
            .json()
            .await
            .map_err(transport_error)?;

        let mut observations = BTreeMap::new();
        for (key, raw) in body.observations {
            let participant = key.parse::<u32>().map_err(|_| BackendError::Decode {
                message: format!("participant id {key:?} is not an integer"),
            })?;
            let observation = decode_observation(raw).map_err(|e| BackendError::Decode {
                message: format!("observation for participant {key}: {e}"),
            })?;
            observations.insert(ParticipantId(participant), observation);
        }
        Ok(observations)
    }

    async fn release(&self, job: JobId) -> BackendResult<()> {
        let response = self
            .client
            .delete(self.job_url(job, "/timers"))
            .send()
            .await
            .map_err(transport_error)?;
        check_status(job, response).await?;
        Ok(())
    }

    fn name(&self) -> &str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ac_types::Block;
    use mockito::{Matcher, Server};
    use serde_json::json;

    fn backend(url: String) -> HttpBackend {
        let mut headers = BTreeMap::new();
        headers.insert("authorization".to_string(), "Bearer test-token".to_string());
        HttpBackend::new(url, &headers, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn dispatch_puts_batches_with_headers() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("PUT", "/jobs/3")
            .match_header("authorization", "Bearer test-token")
            .match_body(Matcher::PartialJson(json!({"job_id": 3})))
            .with_status(201)
            .create_async()
            .await;

        let batches = vec![ParticipantBatch {
            slot: 0,
            blocks: vec![Block { trials: vec![] }],
        }];
        backend(server.url()).dispatch(JobId(3), &batches).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn poll_passes_reclaim_timeout() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/jobs/1/status")
            .match_query(Matcher::UrlEncoded(
                "reclaim_timeout_seconds".into(),
                "100".into(),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"status": "running"}"#)
            .create_async()
            .await;

        let status = backend(server.url())
            .poll_status(JobId(1), Duration::from_secs(100))
            .await
            .unwrap();
        assert_eq!(status, JobStatus::Running);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn fetch_decodes_string_and_inline_logs() {
        let mut server = Server::new_async().await;
        let body = json!({
            "observations": {
                "7": "{\"trials\": [{\"trial_type\": \"rok\", \"correct\": true}]}",
                "2": [{"trial_type": "rok", "correct": false}, {"trial_type": "html"}]
            }
        });
        server
            .mock("GET", "/jobs/0/observations")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body.to_string())
            .create_async()
            .await;

        let observations = backend(server.url())
            .fetch_observations(JobId(0))
            .await
            .unwrap();
        let ids: Vec<_> = observations.keys().copied().collect();
        assert_eq!(ids, vec![ParticipantId(2), ParticipantId(7)]);
        assert_eq!(observations[&ParticipantId(2)].len(), 2);
        assert_eq!(observations[&ParticipantId(7)].len(), 1);
    }

    #[tokio::test]
    async fn status_codes_map_to_backend_errors() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/jobs/0/observations")
            .with_status(409)
            .create_async()
            .await;
        server
            .mock("GET", "/jobs/4/observations")
            .with_status(404)
            .create_async()
            .await;
        server
            .mock("PUT", "/jobs/5")
            .with_status(503)
            .create_async()
            .await;
        server
            .mock("PUT", "/jobs/6")
            .with_status(422)
            .with_body("slot count mismatch")
            .create_async()
            .await;

        let backend = backend(server.url());
        assert!(matches!(
            backend.fetch_observations(JobId(0)).await,
            Err(BackendError::NotReady { .. })
        ));
        assert!(matches!(
            backend.fetch_observations(JobId(4)).await,
            Err(BackendError::UnknownJob { .. })
        ));
        let unavailable = backend.dispatch(JobId(5), &[]).await.unwrap_err();
        assert!(unavailable.is_transient());
        match backend.dispatch(JobId(6), &[]).await {
            Err(BackendError::Rejected { reason }) => assert!(reason.contains("slot count")),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_observations_are_decode_errors() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/jobs/0/observations")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"observations": {"alice": []}}"#)
            .create_async()
            .await;

        assert!(matches!(
            backend(server.url()).fetch_observations(JobId(0)).await,
            Err(BackendError::Decode { .. })
        ));
    }

    #[tokio::test]
    async fn release_deletes_timers() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("DELETE", "/jobs/2/timers")
            .with_status(204)
            .create_async()
            .await;
        backend(server.url()).release(JobId(2)).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn unreachable_server_is_transient() {
        let backend = HttpBackend::new(
            "http://127.0.0.1:9",
            &BTreeMap::new(),
            Duration::from_millis(500),
        )
        .unwrap();
        let err = backend.release(JobId(0)).await.unwrap_err();
        assert!(err.is_transient(), "got {err:?}");
    }

    #[test]
    fn invalid_header_is_rejected() {
        let mut headers = BTreeMap::new();
        headers.insert("bad header".to_string(), "x".to_string());
        assert!(HttpBackend::new("http://localhost", &headers, Duration::from_secs(1)).is_err());
    }
}
