//! HTTP client for submitting jobs and following them to completion.

use async_trait::async_trait;
use mediaflow_jobs::{PollConfig, PollError, StatusPoller, StatusResponse, StatusSource, SubmitResponse};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with an error body.
    #[error("Server rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error(transparent)]
    Poll(#[from] PollError),
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

#[derive(Serialize)]
struct SubmitBody<'a> {
    payload: &'a serde_json::Value,
    options: &'a SubmitOptions,
}

#[derive(Debug, Clone)]
pub struct MediaflowClient {
    http: reqwest::Client,
    base_url: String,
}

impl MediaflowClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self::with_client(http, base_url))
    }

    pub fn with_client(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Relative status URLs are resolved against the base URL.
    fn absolute(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!("{}/{}", self.base_url, url.trim_start_matches('/'))
        }
    }

    pub async fn submit(
        &self,
        queue: &str,
        job_type: &str,
        payload: &serde_json::Value,
        options: &SubmitOptions,
    ) -> Result<SubmitResponse, ClientError> {
        let response = self
            .http
            .post(format!("{}/api/jobs/{}/{}", self.base_url, queue, job_type))
            .json(&SubmitBody { payload, options })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = error_message(response).await;
            return Err(ClientError::Rejected {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response.json().await?)
    }

    /// Submit, then poll until the job is terminal.
    pub async fn submit_and_wait(
        &self,
        queue: &str,
        job_type: &str,
        payload: &serde_json::Value,
        options: &SubmitOptions,
        poll: PollConfig,
        on_progress: impl FnMut(u8) + Send,
    ) -> Result<serde_json::Value, ClientError> {
        let accepted = self.submit(queue, job_type, payload, options).await?;
        let poller = StatusPoller::with_config(self, poll);
        Ok(poller
            .wait_with_progress(&accepted.job_id, &accepted.status_url, on_progress)
            .await?)
    }
}

async fn error_message(response: reqwest::Response) -> String {
    let status = response.status();
    match response.json::<serde_json::Value>().await {
        Ok(body) => body["error"]["message"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| status.to_string()),
        Err(_) => status.to_string(),
    }
}

#[async_trait]
impl<'c> StatusSource for &'c MediaflowClient {
    async fn fetch(&self, status_url: &str) -> Result<StatusResponse, PollError> {
        let response = self
            .http
            .get(self.absolute(status_url))
            .send()
            .await
            .map_err(|e| PollError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(PollError::Transport(format!("server returned {status}")));
        }
        if !status.is_success() {
            return Err(PollError::Protocol(error_message(response).await));
        }
        response
            .json::<StatusResponse>()
            .await
            .map_err(|e| PollError::Protocol(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_status_urls_use_the_base() {
        let client = MediaflowClient::with_client(reqwest::Client::new(), "http://localhost:8080/");
        assert_eq!(client.base_url(), "http://localhost:8080");
        assert_eq!(
            client.absolute("/api/jobs/q/1"),
            "http://localhost:8080/api/jobs/q/1"
        );
        assert_eq!(
            client.absolute("https://media.example.com/api/jobs/q/1"),
            "https://media.example.com/api/jobs/q/1"
        );
    }
}
