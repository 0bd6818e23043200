//! HTTP client for an EWS subscription gateway.
//!
//! The gateway fronts an EWS server and exposes its subscription service as
//! JSON over HTTP:
//!
//! - `POST {base}/subscriptions` creates a subscription and returns its
//!   initial values
//! - `POST {base}/subscriptions/{id}/read` reads changes since the last read
//!
//! A read answered with 404 or 410 means the server dropped the
//! subscription and it must be created again.

use crate::reader::{
    ReadOutcome, ReadStatus, ReaderError, SubscriptionReader, SubscriptionSpec,
    MAX_ITEMS_PER_SUBSCRIPTION,
};
use async_trait::async_trait;
use ews_bridge_core::ChangeEvent;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Subscription event type requested from EWS.
const VALUE_ITEM_CHANGED: &str = "ValueItemChanged";

/// EWS gateway client configuration.
#[derive(Debug, Clone)]
pub struct EwsGatewayConfig {
    /// Base URL of the gateway (e.g., <http://localhost:8090>)
    pub base_url: String,
    /// Request timeout
    pub timeout: Duration,
    /// User name for basic authentication
    pub username: Option<String>,
    /// Password for basic authentication
    pub password: Option<String>,
}

impl Default for EwsGatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8090".to_string(),
            timeout: Duration::from_secs(30),
            username: None,
            password: None,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSubscriptionRequest<'a> {
    event_type: &'a str,
    ids: &'a [String],
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ReadResponse {
    subscription_id: String,
    success: bool,
    failure_reason: Option<String>,
    resubscribe_required: bool,
    subscription_changed: bool,
    events: Vec<ChangeEvent>,
    subscribed_items: Vec<String>,
    failed_items: Vec<String>,
    prompts: Vec<String>,
}

impl ReadResponse {
    fn into_outcome(self, requested_id: Option<&str>) -> ReadOutcome {
        let subscription_id = if self.subscription_id.is_empty() {
            requested_id.unwrap_or_default().to_string()
        } else {
            self.subscription_id
        };

        let renamed_to = requested_id
            .filter(|requested| self.subscription_changed && *requested != subscription_id)
            .map(|_| subscription_id.clone());

        let status = if self.success {
            ReadStatus::Success
        } else {
            ReadStatus::Failed {
                reason: self
                    .failure_reason
                    .unwrap_or_else(|| "read failed".to_string()),
                resubscribe_required: self.resubscribe_required,
            }
        };

        ReadOutcome {
            subscription_id,
            status,
            renamed_to,
            events: self.events,
            covered_point_ids: self.subscribed_items,
            failed_point_ids: self.failed_items,
            warnings: self.prompts,
        }
    }
}

/// HTTP client for the EWS subscription gateway.
pub struct EwsGatewayClient {
    client: Client,
    config: EwsGatewayConfig,
}

impl EwsGatewayClient {
    /// Create a new gateway client.
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be created.
    pub fn new(config: EwsGatewayConfig) -> Result<Self, ClientError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ClientError::Init(e.to_string()))?;

        Ok(Self { client, config })
    }

    fn with_auth(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.username {
            Some(username) => request.basic_auth(username, self.config.password.as_ref()),
            None => request,
        }
    }

    fn base_url(&self) -> &str {
        self.config.base_url.trim_end_matches('/')
    }

    /// Create a subscription for the given points and read initial values.
    ///
    /// # Errors
    ///
    /// Returns error on network or API errors, or if more than
    /// [`MAX_ITEMS_PER_SUBSCRIPTION`] points are requested.
    pub async fn create_subscription(
        &self,
        point_ids: &[String],
    ) -> Result<ReadOutcome, ReaderError> {
        if point_ids.len() > MAX_ITEMS_PER_SUBSCRIPTION {
            return Err(ReaderError::InvalidRequest(format!(
                "{} points exceeds the limit of {MAX_ITEMS_PER_SUBSCRIPTION}",
                point_ids.len()
            )));
        }

        let url = format!("{}/subscriptions", self.base_url());

        tracing::debug!(url = %url, points = point_ids.len(), "POST create subscription");

        let request = self
            .client
            .post(&url)
            .json(&CreateSubscriptionRequest {
                event_type: VALUE_ITEM_CHANGED,
                ids: point_ids,
            });

        let response = self
            .with_auth(request)
            .send()
            .await
            .map_err(|e| ReaderError::Request(e.to_string()))?;

        let body = parse_response(response).await?;
        Ok(body.into_outcome(None))
    }

    /// Read changes from an existing subscription.
    ///
    /// # Errors
    ///
    /// Returns error on network errors or unexpected API status.
    pub async fn read_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<ReadOutcome, ReaderError> {
        let encoded_id = utf8_percent_encode(subscription_id, NON_ALPHANUMERIC);
        let url = format!("{}/subscriptions/{encoded_id}/read", self.base_url());

        tracing::debug!(subscription_id, url = %url, "POST read subscription");

        let response = self
            .with_auth(self.client.post(&url))
            .send()
            .await
            .map_err(|e| ReaderError::Request(e.to_string()))?;

        if matches!(response.status(), StatusCode::NOT_FOUND | StatusCode::GONE) {
            let reason = format!("subscription {subscription_id} no longer exists");
            return Ok(ReadOutcome::failed(subscription_id, reason, true));
        }

        let body = parse_response(response).await?;
        Ok(body.into_outcome(Some(subscription_id)))
    }
}

#[async_trait]
impl SubscriptionReader for EwsGatewayClient {
    async fn read(&self, spec: SubscriptionSpec) -> Result<ReadOutcome, ReaderError> {
        match spec {
            SubscriptionSpec::Existing { subscription_id } => {
                self.read_subscription(&subscription_id).await
            }
            SubscriptionSpec::Create { point_ids } => self.create_subscription(&point_ids).await,
        }
    }
}

async fn parse_response(response: Response) -> Result<ReadResponse, ReaderError> {
    if !response.status().is_success() {
        return Err(ReaderError::ApiError {
            status: response.status().as_u16(),
            message: response.text().await.unwrap_or_default(),
        });
    }

    response
        .json()
        .await
        .map_err(|e| ReaderError::Parse(e.to_string()))
}

/// Errors that can occur creating the gateway client.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    /// Client initialization failed
    #[error("client init error: {0}")]
    Init(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_default() {
        let config = EwsGatewayConfig::default();
        assert_eq!(config.base_url, "http://localhost:8090");
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert!(config.username.is_none());
        assert!(config.password.is_none());
    }

    #[test]
    fn client_creation() {
        let client = EwsGatewayClient::new(EwsGatewayConfig::default());
        assert!(client.is_ok());
    }

    #[test]
    fn oversized_create_is_rejected_locally() {
        let client = EwsGatewayClient::new(EwsGatewayConfig::default()).unwrap();
        let ids: Vec<String> = (0..=MAX_ITEMS_PER_SUBSCRIPTION)
            .map(|i| format!("01Bldg1/AHU1/P{i}"))
            .collect();

        let result = tokio_test::block_on(client.read(SubscriptionSpec::Create { point_ids: ids }));

        assert!(matches!(result, Err(ReaderError::InvalidRequest(_))));
    }

    #[test]
    fn response_with_rename() {
        let body: ReadResponse = serde_json::from_str(
            r#"{
                "subscriptionId": "S2",
                "success": true,
                "subscriptionChanged": true,
                "events": [{"id":"01Bldg1/AHU1/Temp","value":"70","timestamp":"2024-01-01T00:00:00Z"}]
            }"#,
        )
        .unwrap();

        let outcome = body.into_outcome(Some("S1"));

        assert!(outcome.is_success());
        assert_eq!(outcome.subscription_id, "S2");
        assert_eq!(outcome.renamed_to.as_deref(), Some("S2"));
        assert_eq!(outcome.events.len(), 1);
    }

    #[test]
    fn response_failure_defaults() {
        let body: ReadResponse =
            serde_json::from_str(r#"{"success": false, "resubscribeRequired": true}"#).unwrap();

        let outcome = body.into_outcome(Some("S1"));

        assert_eq!(outcome.subscription_id, "S1");
        assert!(outcome.renamed_to.is_none());
        assert!(outcome.is_resubscribe_required());
    }

    #[test]
    fn create_response_carries_coverage() {
        let body: ReadResponse = serde_json::from_str(
            r#"{"subscriptionId":"S9","success":true,"subscribedItems":["01a/b/c"],"failedItems":["01a/b/d"]}"#,
        )
        .unwrap();

        let outcome = body.into_outcome(None);

        assert!(outcome.renamed_to.is_none());
        assert_eq!(outcome.covered_point_ids, vec!["01a/b/c".to_string()]);
        assert_eq!(outcome.failed_point_ids, vec!["01a/b/d".to_string()]);
    }
}
