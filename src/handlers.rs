//! Built-in callback: run units of work by POSTing them to an HTTP endpoint.
//!
//! `POST {base_url}/{kind}` with the task's args as the JSON body. The reply
//! decides the outcome: 2xx succeeds with the response body as payload, 4xx is
//! fatal, anything else (5xx, timeouts, connection errors) is retryable.

use crate::error::{Error, Result};
use crate::worker::{Handler, TaskContext, TaskFailure, TaskOutcome};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Build the shared client the worker pool hands to every invocation.
pub fn http_client(connect_timeout: Duration) -> Result<Client> {
    Client::builder()
        .connect_timeout(connect_timeout)
        .user_agent(concat!("taskcast/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| Error::Config(format!("failed to build http client: {e}")))
}

pub struct HttpCallback {
    base_url: String,
}

impl HttpCallback {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, kind: &str) -> String {
        format!("{}/{kind}", self.base_url)
    }
}

fn request_failure(e: &reqwest::Error) -> TaskFailure {
    if e.is_timeout() {
        TaskFailure::retryable("callback timed out")
    } else if e.is_connect() {
        TaskFailure::retryable("callback unreachable")
    } else {
        TaskFailure::retryable("callback request failed")
    }
}

fn status_failure(status: StatusCode) -> TaskFailure {
    if status.is_client_error() {
        TaskFailure::fatal(format!("callback rejected task: HTTP {}", status.as_u16()))
    } else {
        TaskFailure::retryable(format!("callback unavailable: HTTP {}", status.as_u16()))
    }
}

#[async_trait]
impl Handler<Client> for HttpCallback {
    async fn run(&self, client: Arc<Client>, ctx: TaskContext, args: Value) -> TaskOutcome {
        let response = client
            .post(self.url(ctx.kind()))
            .header("X-Task-Id", ctx.task_id().to_string())
            .header("X-Task-Attempt", ctx.attempt().to_string())
            .json(&args)
            .send()
            .await
            .map_err(|e| request_failure(&e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_failure(status));
        }

        let body = response.bytes().await.map_err(|e| request_failure(&e))?;
        if body.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&body)
            .map_err(|_| TaskFailure::fatal("callback returned invalid JSON"))
    }
}
