//! Live adapter: posts mutations to the external ads platform.

use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::{debug, warn};

use super::{AdapterOutcome, AdsApiAdapter, MutationRequest};

pub struct LiveAdsAdapter {
    client: reqwest::Client,
    endpoint: String,
}

impl LiveAdsAdapter {
    /// `endpoint` is the platform's mutation base URL; the per-attempt
    /// timeout is enforced here on the HTTP client.
    pub fn new(endpoint: String, attempt_timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(attempt_timeout)
            .build()?;
        Ok(Self { client, endpoint })
    }

    fn classify(status: StatusCode, retry_after: Option<Duration>) -> AdapterOutcome {
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            AdapterOutcome::Transient { retry_after }
        } else {
            AdapterOutcome::Permanent {
                error_kind: format!("http_{}", status.as_u16()),
            }
        }
    }
}

#[async_trait]
impl AdsApiAdapter for LiveAdsAdapter {
    async fn apply(&self, request: &MutationRequest) -> AdapterOutcome {
        let url = format!(
            "{}/customers/{}/mutate",
            self.endpoint.trim_end_matches('/'),
            request.customer_id
        );
        debug!(
            resource = request.resource,
            operation = request.operation,
            entity_id = request.entity_id,
            "sending platform mutation"
        );

        let response = match self.client.post(&url).json(request).send().await {
            Ok(response) => response,
            Err(err) => {
                // Connect failures and timeouts are worth another attempt.
                warn!(error = %err, "platform request failed");
                return AdapterOutcome::Transient { retry_after: None };
            }
        };

        let status = response.status();
        if status.is_success() {
            let ack = response
                .json::<serde_json::Value>()
                .await
                .ok()
                .and_then(|body| {
                    body.get("resource_name")
                        .and_then(|v| v.as_str())
                        .map(str::to_string)
                })
                .unwrap_or_else(|| format!("{}:{}", request.resource, request.entity_id));
            return AdapterOutcome::Ok { platform_ack: ack };
        }

        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);

        warn!(status = status.as_u16(), "platform rejected mutation");
        Self::classify(status, retry_after)
    }
}
