//! Liveness probing of launched servers

use std::time::Duration;

use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::types::HealthCheckResult;

/// Issues single GET requests against health endpoints
#[derive(Debug, Clone)]
pub struct Prober {
    client: reqwest::Client,
}

impl Prober {
    /// Create a prober whose requests give up after `timeout`
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "failed to build HTTP client, using defaults");
                reqwest::Client::new()
            });
        Self { client }
    }

    /// Probe `url` once
    ///
    /// 2xx is healthy, with the body decoded as JSON when possible and kept as
    /// a string otherwise. Anything else is unhealthy with a description.
    #[instrument(skip(self))]
    pub async fn probe(&self, url: &str) -> HealthCheckResult {
        let response = match self.client.get(url).send().await {
            Ok(response) => response,
            Err(e) => {
                debug!(error = %e, "health check request failed");
                return HealthCheckResult::unhealthy(format!("health check request failed: {e}"));
            }
        };

        let status = response.status();
        let text = match response.text().await {
            Ok(text) => text,
            Err(e) => {
                return HealthCheckResult::unhealthy(format!(
                    "failed to read health check response: {e}"
                ));
            }
        };
        let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));

        if status.is_success() {
            debug!(%status, "health check passed");
            HealthCheckResult::healthy(body)
        } else {
            debug!(%status, "health check returned an error status");
            HealthCheckResult {
                body: Some(body),
                ..HealthCheckResult::unhealthy(format!("health check returned HTTP {status}"))
            }
        }
    }
}
