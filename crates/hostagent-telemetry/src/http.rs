use crate::{Result, TelemetryError, TelemetryReport, TelemetrySink};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

/// Header carrying the shared secret the collector authenticates agents with.
pub const SECRET_HEADER: &str = "X-Agent-Secret";

const PUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Pushes reports as JSON to `{base_url}/stats`.
#[derive(Clone)]
pub struct HttpSink {
    client: reqwest::Client,
    endpoint: String,
    secret: Option<String>,
}

impl HttpSink {
    pub fn new(base_url: &str, secret: Option<String>) -> Result<Self> {
        let base = base_url.trim().trim_end_matches('/');
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(TelemetryError::Config(format!(
                "collector url must be http(s), got {base_url:?}"
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(PUSH_TIMEOUT)
            .build()
            .map_err(|e| TelemetryError::Config(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: format!("{base}/stats"),
            secret,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl TelemetrySink for HttpSink {
    async fn push(&self, report: &TelemetryReport) -> Result<()> {
        let mut request = self.client.post(&self.endpoint).json(report);
        if let Some(secret) = &self.secret {
            request = request.header(SECRET_HEADER, secret);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TelemetryError::Delivery(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TelemetryError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        debug!(instance_id = %report.instance_id, "Telemetry delivered");
        Ok(())
    }
}
