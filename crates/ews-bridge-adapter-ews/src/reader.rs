//! Subscription reader contract.

use async_trait::async_trait;
use ews_bridge_core::ChangeEvent;

/// Hard ceiling on points per subscription request.
pub const MAX_ITEMS_PER_SUBSCRIPTION: usize = 500;

/// What to read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionSpec {
    /// Read changes from a subscription that already exists
    Existing {
        /// Server-assigned subscription id
        subscription_id: String,
    },
    /// Create a subscription for these points and read its initial values
    Create {
        /// EWS point identifiers, at most [`MAX_ITEMS_PER_SUBSCRIPTION`]
        point_ids: Vec<String>,
    },
}

/// Result status of a read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadStatus {
    /// Read completed
    Success,
    /// Server rejected the read
    Failed {
        /// Reason reported by the server
        reason: String,
        /// The subscription is gone and must be created again
        resubscribe_required: bool,
    },
}

/// Everything a single read reports.
#[derive(Debug, Clone)]
pub struct ReadOutcome {
    /// Subscription id after the read
    pub subscription_id: String,
    /// Read status
    pub status: ReadStatus,
    /// New id if the server renamed the subscription during the read
    pub renamed_to: Option<String>,
    /// Value changes
    pub events: Vec<ChangeEvent>,
    /// Points the subscription covers
    pub covered_point_ids: Vec<String>,
    /// Points the server refused to subscribe
    pub failed_point_ids: Vec<String>,
    /// Non-fatal messages from the server
    pub warnings: Vec<String>,
}

impl ReadOutcome {
    /// A successful read with the given events.
    #[must_use]
    pub fn success(subscription_id: impl Into<String>, events: Vec<ChangeEvent>) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            status: ReadStatus::Success,
            renamed_to: None,
            events,
            covered_point_ids: Vec::new(),
            failed_point_ids: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// A failed read.
    #[must_use]
    pub fn failed(
        subscription_id: impl Into<String>,
        reason: impl Into<String>,
        resubscribe_required: bool,
    ) -> Self {
        Self {
            status: ReadStatus::Failed {
                reason: reason.into(),
                resubscribe_required,
            },
            ..Self::success(subscription_id, Vec::new())
        }
    }

    /// Whether the read succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self.status, ReadStatus::Success)
    }

    /// Whether the server asked for the subscription to be recreated.
    #[must_use]
    pub fn is_resubscribe_required(&self) -> bool {
        matches!(
            self.status,
            ReadStatus::Failed {
                resubscribe_required: true,
                ..
            }
        )
    }
}

/// Reads value changes from EWS subscriptions.
#[async_trait]
pub trait SubscriptionReader: Send + Sync {
    /// Read an existing subscription or create and read a new one.
    ///
    /// # Errors
    ///
    /// Returns error when the read could not be performed at all. A read the
    /// server answered with a failure is an `Ok` with [`ReadStatus::Failed`].
    async fn read(&self, spec: SubscriptionSpec) -> Result<ReadOutcome, ReaderError>;
}

/// Errors that prevent a read from completing.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ReaderError {
    /// Request rejected before sending
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Transport-level failure
    #[error("request error: {0}")]
    Request(String),
    /// Server returned an unexpected status
    #[error("API error (status {status}): {message}")]
    ApiError {
        /// HTTP status code
        status: u16,
        /// Error message from server
        message: String,
    },
    /// Response could not be parsed
    #[error("parse error: {0}")]
    Parse(String),
}
