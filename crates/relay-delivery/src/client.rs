//! HTTP client for event delivery with response classification.
//!
//! Sends the delivery payload and maps the outcome onto the error
//! taxonomy: 2xx is success, 4xx is a permanent client error, 5xx and
//! transport failures are transient.

use std::time::Duration;

use relay_core::{DeliveryId, Event};
use reqwest::Response;
use serde::Serialize;
use tracing::{debug, info_span, warn, Instrument};

use crate::error::{DeliveryError, Result};

/// Response body bytes retained for the audit trail.
const MAX_AUDIT_BODY_BYTES: usize = 1024;

/// Configuration for the delivery client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Total request timeout.
    pub timeout: Duration,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            user_agent: "Relay-Event-Delivery/1.0".to_string(),
        }
    }
}

/// Wire payload posted to processor targets.
#[derive(Debug, Serialize)]
struct DeliveryBody<'a> {
    event: &'a Event,
    attempt_number: i32,
}

/// Successful response from a processor target.
#[derive(Debug, Clone)]
pub struct DeliveryResponse {
    /// HTTP status code (2xx).
    pub status_code: u16,
    /// Truncated response body.
    pub body: String,
}

/// HTTP client for processor deliveries.
///
/// Uses connection pooling and configured timeouts so one slow target
/// cannot hold a worker longer than the timeout budget.
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    client: reqwest::Client,
    config: ClientConfig,
}

impl DeliveryClient {
    /// Creates a new delivery client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the HTTP client cannot be
    /// built.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, config })
    }

    /// Creates a delivery client with default configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the HTTP client cannot be
    /// built.
    pub fn with_defaults() -> Result<Self> {
        Self::new(ClientConfig::default())
    }

    /// Posts `{event, attempt_number}` to the target URL.
    ///
    /// # Errors
    ///
    /// - `Timeout` when the request exceeds the timeout budget
    /// - `Network` for connection and transport failures
    /// - `ClientError` for 4xx responses
    /// - `ServerError` for 5xx responses
    pub async fn deliver(
        &self,
        url: &str,
        event: &Event,
        delivery_id: DeliveryId,
        attempt_number: i32,
    ) -> Result<DeliveryResponse> {
        let span = info_span!(
            "event_delivery",
            event_id = %event.event_id,
            delivery_id = %delivery_id,
            url,
            attempt = attempt_number
        );

        async move {
            debug!("starting delivery request");

            let request = self
                .client
                .post(url)
                .json(&DeliveryBody { event, attempt_number })
                .header("X-Relay-Event-Id", event.event_id.to_string())
                .header("X-Relay-Delivery-Id", delivery_id.to_string())
                .header("X-Relay-Delivery-Attempt", attempt_number.to_string());

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => {
                    warn!(error = %e, "delivery request failed");
                    if e.is_timeout() {
                        return Err(DeliveryError::timeout(self.config.timeout.as_secs()));
                    }
                    if e.is_connect() {
                        return Err(DeliveryError::network(format!("connection failed: {e}")));
                    }
                    return Err(DeliveryError::network(e.to_string()));
                },
            };

            let status_code = response.status().as_u16();
            let is_success = response.status().is_success();
            let body = read_truncated_body(response).await;

            debug!(status = status_code, "received response");

            match status_code {
                _ if is_success => Ok(DeliveryResponse { status_code, body }),
                400..=499 => Err(DeliveryError::client_error(status_code, body)),
                _ => Err(DeliveryError::server_error(status_code, body)),
            }
        }
        .instrument(span)
        .await
    }
}

/// Reads the response body, truncated to the audit limit.
async fn read_truncated_body(response: Response) -> String {
    match response.bytes().await {
        Ok(bytes) if bytes.len() > MAX_AUDIT_BODY_BYTES => {
            let suffix = "... (truncated)";
            let kept = String::from_utf8_lossy(&bytes[..MAX_AUDIT_BODY_BYTES - suffix.len()]);
            format!("{kept}{suffix}")
        },
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(_) => String::new(),
    }
}
