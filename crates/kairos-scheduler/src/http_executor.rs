//! Executor that delivers jobs to their recipient over HTTP.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::Result;
use crate::executor::{JobExecutionResponse, JobExecutor};
use crate::types::ScheduledJob;

/// Default request timeout.
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Body POSTed to the recipient.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeliveryRequest<'a> {
    job_id: &'a str,
    execution_counter: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<&'a serde_json::Value>,
}

/// POSTs each firing to the job's recipient URL.
///
/// Any 2xx response counts as success. Other statuses and transport errors
/// are failures and send the job down the retry path.
#[derive(Debug, Clone)]
pub struct HttpJobExecutor {
    http: reqwest::Client,
}

impl HttpJobExecutor {
    /// Create an executor whose requests give up after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http })
    }
}

#[async_trait]
impl JobExecutor for HttpJobExecutor {
    #[tracing::instrument(skip(self, job), fields(job_id = %job.id()))]
    async fn execute(
        &self,
        job: &ScheduledJob,
    ) -> std::result::Result<JobExecutionResponse, JobExecutionResponse> {
        let response = JobExecutionResponse::new(job.id());

        let Some(recipient) = job.job.recipient.as_ref() else {
            warn!("job has no recipient");
            return Err(response.with_message("job has no recipient"));
        };

        let body = DeliveryRequest {
            job_id: job.id(),
            execution_counter: job.execution_counter,
            payload: recipient.payload.as_ref(),
        };

        let result = self.http.post(&recipient.url).json(&body).send().await;

        match result {
            Ok(resp) if resp.status().is_success() => {
                let code = resp.status().as_u16().to_string();
                debug!(url = %recipient.url, %code, "delivered job");
                Ok(response.with_code(code))
            }
            Ok(resp) => {
                let status = resp.status();
                let text = resp.text().await.unwrap_or_default();
                warn!(url = %recipient.url, status = %status, "recipient rejected job");
                Err(response
                    .with_code(status.as_u16().to_string())
                    .with_message(text))
            }
            Err(e) => {
                warn!(url = %recipient.url, error = %e, "failed to deliver job");
                Err(response.with_message(e.to_string()))
            }
        }
    }
}
