//! Subscription reconciliation.
//!
//! Keeps the active subscription set in line with what the EWS server
//! actually serves, and subscribes every configured point that no
//! subscription covers yet.
//!
//! The active set is loaded once per pass, mutated in memory while a
//! snapshot is iterated, and persisted only between iterations.

use crate::persistence::StoreError;
use crate::shutdown::Shutdown;
use crate::subscriptions::{ActiveSet, SubscriptionStore};
use ews_bridge_adapter_ews::{
    ReadOutcome, ReadStatus, SubscriptionReader, SubscriptionSpec, MAX_ITEMS_PER_SUBSCRIPTION,
};
use ews_bridge_core::{ChangeEvent, SignalRegistry};
use std::collections::VecDeque;

/// Result of one reconciliation pass.
#[derive(Debug, Clone)]
pub struct PassOutcome {
    /// Change events read during the pass
    pub events: Vec<ChangeEvent>,
    /// False if any read failed during the pass
    pub complete: bool,
    /// Messages to surface to the operator
    pub warnings: Vec<String>,
}

impl Default for PassOutcome {
    fn default() -> Self {
        Self {
            events: Vec::new(),
            complete: true,
            warnings: Vec::new(),
        }
    }
}

/// Reconciles stored subscriptions against the EWS server.
pub struct Reconciler<'a> {
    reader: &'a dyn SubscriptionReader,
    store: SubscriptionStore<'a>,
    shutdown: &'a Shutdown,
}

impl<'a> Reconciler<'a> {
    /// Create a reconciler.
    #[must_use]
    pub fn new(
        reader: &'a dyn SubscriptionReader,
        store: SubscriptionStore<'a>,
        shutdown: &'a Shutdown,
    ) -> Self {
        Self {
            reader,
            store,
            shutdown,
        }
    }

    /// Read every active subscription, repairing or evicting as needed.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::Cancelled`] if cancellation was requested,
    /// after persisting the iterations already evaluated, or a store error.
    /// A cancelled pass still carries the events read before it stopped.
    pub async fn reconcile_existing(&self) -> Result<PassOutcome, ReconcileError> {
        let mut active = self.store.active_set()?;
        tracing::debug!(subscriptions = active.len(), "Reading existing subscriptions");

        let mut outcome = PassOutcome::default();

        for subscription_id in active.snapshot() {
            if self.shutdown.is_triggered() {
                self.store.save_active_set(&active)?;
                return Err(ReconcileError::Cancelled(outcome));
            }

            tracing::debug!(%subscription_id, "Reading existing subscription");

            let spec = SubscriptionSpec::Existing {
                subscription_id: subscription_id.clone(),
            };

            let read = match self.reader.read(spec).await {
                Ok(read) => read,
                Err(err) => {
                    tracing::warn!(
                        %subscription_id,
                        error = %err,
                        "Reading subscription failed, evicting it"
                    );
                    self.evict(&mut active, &subscription_id)?;
                    outcome.complete = false;
                    continue;
                }
            };

            let ReadOutcome {
                status,
                renamed_to,
                events,
                warnings,
                ..
            } = read;

            match status {
                ReadStatus::Failed {
                    reason,
                    resubscribe_required: true,
                } => {
                    tracing::info!(
                        %subscription_id,
                        %reason,
                        "Subscription requires resubscribe, dropping it"
                    );
                    self.evict(&mut active, &subscription_id)?;
                }
                ReadStatus::Failed { reason, .. } => {
                    tracing::warn!(%subscription_id, %reason, "Reading subscription failed");
                    outcome.complete = false;
                    outcome
                        .warnings
                        .push(format!("Reading subscription {subscription_id} failed: {reason}"));
                    self.store.save_active_set(&active)?;
                    return Ok(outcome);
                }
                ReadStatus::Success => {
                    if let Some(new_id) = renamed_to {
                        tracing::debug!(
                            %subscription_id,
                            %new_id,
                            "Subscription id changed, updating cache"
                        );
                        self.store.move_coverage(&subscription_id, &new_id)?;
                        active.replace(&subscription_id, new_id);
                    }
                    outcome.warnings.extend(warnings);
                    outcome.events.extend(events);
                }
            }
        }

        self.store.save_active_set(&active)?;
        Ok(outcome)
    }

    /// Subscribe every configured point that no stored subscription covers.
    ///
    /// Points are submitted in batches of at most
    /// [`MAX_ITEMS_PER_SUBSCRIPTION`]. The first failed batch stops the pass;
    /// the remaining points are picked up next cycle.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::Cancelled`] if cancellation was requested,
    /// carrying the events of the batches already subscribed, or a store
    /// error.
    pub async fn subscribe_new(
        &self,
        registry: &SignalRegistry,
    ) -> Result<PassOutcome, ReconcileError> {
        tracing::debug!("Creating and reading new subscriptions");

        let covered = self.store.covered_point_ids()?;
        let uncovered: Vec<String> = registry
            .ews_ids()
            .into_iter()
            .filter(|id| !covered.contains(id))
            .collect();

        let mut outcome = PassOutcome::default();
        if uncovered.is_empty() {
            return Ok(outcome);
        }

        tracing::info!(points = uncovered.len(), "Subscribing uncovered points");

        let mut batches: VecDeque<Vec<String>> = uncovered
            .chunks(MAX_ITEMS_PER_SUBSCRIPTION)
            .map(<[String]>::to_vec)
            .collect();
        let mut active = self.store.active_set()?;

        while let Some(batch) = batches.pop_front() {
            if self.shutdown.is_triggered() {
                return Err(ReconcileError::Cancelled(outcome));
            }

            let batch_len = batch.len();
            let spec = SubscriptionSpec::Create {
                point_ids: batch.clone(),
            };

            let read = match self.reader.read(spec).await {
                Ok(read) if read.is_success() && !read.subscription_id.is_empty() => read,
                Ok(read) => {
                    let reason = match read.status {
                        ReadStatus::Failed { reason, .. } => reason,
                        ReadStatus::Success => "no subscription id returned".to_string(),
                    };
                    abandon(&mut outcome, batch_len, &reason, batches.len());
                    break;
                }
                Err(err) => {
                    abandon(&mut outcome, batch_len, &err.to_string(), batches.len());
                    break;
                }
            };

            self.record_new(&mut active, &read, &batch)?;

            if !read.failed_point_ids.is_empty() {
                tracing::info!(
                    subscription_id = %read.subscription_id,
                    failed = ?read.failed_point_ids,
                    "Some items failed to be subscribed to"
                );
                outcome.warnings.push(format!(
                    "Some items failed to be subscribed to: {}",
                    read.failed_point_ids.join(", ")
                ));
            }

            outcome.warnings.extend(read.warnings);
            outcome.events.extend(read.events);
        }

        Ok(outcome)
    }

    fn evict(&self, active: &mut ActiveSet, subscription_id: &str) -> Result<(), StoreError> {
        active.remove(subscription_id);
        self.store.delete_coverage(subscription_id)
    }

    fn record_new(
        &self,
        active: &mut ActiveSet,
        read: &ReadOutcome,
        batch: &[String],
    ) -> Result<(), StoreError> {
        let coverage: Vec<String> = if read.covered_point_ids.is_empty() {
            batch
                .iter()
                .filter(|point| !read.failed_point_ids.contains(point))
                .cloned()
                .collect()
        } else {
            read.covered_point_ids.clone()
        };

        if coverage.is_empty() {
            tracing::warn!(
                subscription_id = %read.subscription_id,
                "Subscription covers no points, not recording it"
            );
            return Ok(());
        }

        tracing::debug!(
            subscription_id = %read.subscription_id,
            points = coverage.len(),
            "Subscription created"
        );

        self.store.save_coverage(&read.subscription_id, &coverage)?;
        active.insert(read.subscription_id.clone());
        self.store.save_active_set(active)
    }
}

fn abandon(outcome: &mut PassOutcome, batch_len: usize, reason: &str, remaining: usize) {
    tracing::warn!(
        points = batch_len,
        remaining_batches = remaining,
        %reason,
        "Creating subscription failed, retrying next cycle"
    );
    outcome.complete = false;
    outcome
        .warnings
        .push(format!("Subscribing {batch_len} points failed: {reason}"));
}

/// Errors that stop a reconciliation pass.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    /// Cancellation was requested; holds what was read before stopping
    #[error("reconciliation cancelled")]
    Cancelled(PassOutcome),
    /// Subscription store failed
    #[error(transparent)]
    Store(#[from] StoreError),
}
