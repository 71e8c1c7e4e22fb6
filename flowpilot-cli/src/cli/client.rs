//! HTTP client for a running flowpilot server

use anyhow::{Context, Result};
use flowpilot_core::models::hil::{HilRequest, HilResolution, HilResponse};
use flowpilot_core::models::schedule::ScheduleExecution;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use url::Url;
use uuid::Uuid;

#[derive(Serialize)]
struct TriggerPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    input: Option<Value>,
}

pub struct FlowClient {
    base_url: Url,
    client: Client,
}

impl FlowClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let mut base = base_url.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url =
            Url::parse(&base).with_context(|| format!("Invalid server URL '{}'", base_url))?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(anyhow::anyhow!(
                "Server URL must use http or https, got '{}'",
                base_url.scheme()
            ));
        }
        Ok(Self {
            base_url,
            client: Client::new(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .with_context(|| format!("Invalid endpoint path '{}'", path))
    }

    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|v| v.get("error").and_then(Value::as_str).map(str::to_string))
                .unwrap_or_else(|| body.trim().to_string());
            tracing::debug!(%status, "server rejected request: {}", message);
            Err(anyhow::anyhow!("Server error {}: {}", status, message))
        }
    }

    pub async fn health(&self) -> Result<Value> {
        let response = self
            .client
            .get(self.endpoint("api/v1/health")?)
            .send()
            .await
            .context("Failed to reach server")?;
        let response = Self::ensure_success(response).await?;
        response
            .json::<Value>()
            .await
            .context("Failed to parse health response")
    }

    pub async fn list_pending(&self, workflow_id: Option<&str>) -> Result<Vec<HilRequest>> {
        let mut request = self.client.get(self.endpoint("api/v1/hil/requests")?);
        if let Some(workflow_id) = workflow_id {
            request = request.query(&[("workflow_id", workflow_id)]);
        }
        let response = request.send().await.context("Failed to reach server")?;
        let response = Self::ensure_success(response).await?;
        response
            .json::<Vec<HilRequest>>()
            .await
            .context("Failed to parse pending requests")
    }

    pub async fn respond(
        &self,
        request_id: Uuid,
        resolution: &HilResolution,
    ) -> Result<HilResponse> {
        let response = self
            .client
            .post(self.endpoint(&format!("api/v1/hil/requests/{}/respond", request_id))?)
            .json(resolution)
            .send()
            .await
            .context("Failed to reach server")?;
        let response = Self::ensure_success(response).await?;
        response
            .json::<HilResponse>()
            .await
            .context("Failed to parse HIL response")
    }

    /// Manually fire a schedule, optionally waiting up to `wait` seconds
    pub async fn trigger(
        &self,
        schedule_id: Uuid,
        input: Option<Value>,
        wait: Option<u64>,
    ) -> Result<ScheduleExecution> {
        let mut request = self
            .client
            .post(self.endpoint(&format!("api/v1/schedules/{}/trigger", schedule_id))?)
            .json(&TriggerPayload { input });
        if let Some(wait) = wait {
            request = request.query(&[("wait", wait)]);
        }
        let response = request.send().await.context("Failed to reach server")?;
        let response = Self::ensure_success(response).await?;
        response
            .json::<ScheduleExecution>()
            .await
            .context("Failed to parse schedule execution")
    }
}
