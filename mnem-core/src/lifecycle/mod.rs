//! Memory lifecycle state machine.
//!
//! Validates transitions locally against [`MemoryState::allowed_targets`],
//! persists accepted ones through the [`MemoryApi`], and keeps an audit log of
//! every applied transition.
//!
//! ## Bulk operations
//!
//! ```text
//!  ids ──▶ stream::iter ──▶ buffered(concurrency) ──▶ one result per id, input order
//!                               │
//!                 get ─▶ same state? ─▶ no-op
//!                        valid?      ─▶ update ─▶ history
//!                        otherwise   ─▶ per-id failure
//! ```
//!
//! A failure on one id never aborts the batch.

mod history;

pub use history::HistoryStore;

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::MemoryApi;
use crate::error::{Error, Result};
use crate::types::{
    BulkOperation, BulkOperationResult, MemoryListFilter, MemoryRecord, MemoryState,
    StateTransition,
};

const NOT_FOUND: &str = "not found";
const CANCELLED: &str = "cancelled";

pub struct LifecycleManager {
    api: Arc<dyn MemoryApi>,
    history: HistoryStore,
    actor_id: String,
    concurrency: usize,
}

impl LifecycleManager {
    pub fn new(
        api: Arc<dyn MemoryApi>,
        history: HistoryStore,
        actor_id: impl Into<String>,
        concurrency: usize,
    ) -> Self {
        Self {
            api,
            history,
            actor_id: actor_id.into(),
            concurrency: concurrency.max(1),
        }
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    /// Move one memory to `new_state`.
    ///
    /// Transitions absent from the table (including same-state requests)
    /// fail with [`Error::InvalidTransition`] before any write is issued.
    pub async fn update_state(
        &self,
        id: &str,
        new_state: MemoryState,
        reason: Option<&str>,
    ) -> Result<StateTransition> {
        let record = self.api.get_memory(id).await?;
        self.apply(&record, new_state, reason).await
    }

    pub async fn bulk_update_state(
        &self,
        ids: &[String],
        operation: BulkOperation,
    ) -> Vec<BulkOperationResult> {
        self.bulk_update_state_with_cancel(ids, operation, &CancellationToken::new())
            .await
    }

    /// Bulk transition. Ids not finished when `cancel` fires report `"cancelled"`.
    pub async fn bulk_update_state_with_cancel(
        &self,
        ids: &[String],
        operation: BulkOperation,
        cancel: &CancellationToken,
    ) -> Vec<BulkOperationResult> {
        let target = operation.target_state();
        let reason = format!("bulk {}", operation.as_str());
        info!(operation = operation.as_str(), count = ids.len(), "Bulk state update");

        let results = self
            .fan_out(ids, cancel, |id| self.bulk_one(id, target, &reason))
            .await;
        log_summary(operation.as_str(), &results);
        results
    }

    /// Archive every Active memory created before `before`.
    pub async fn archive_older_than(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<BulkOperationResult>> {
        let filter = MemoryListFilter {
            state: Some(MemoryState::Active),
            created_before: Some(before),
            limit: None,
        };
        let ids: Vec<String> = self
            .api
            .list_memories(&filter)
            .await?
            .into_iter()
            .filter(|r| r.state == MemoryState::Active && r.created_at < before)
            .map(|r| r.id)
            .collect();

        info!(before = %before, count = ids.len(), "Archiving memories by age");
        Ok(self.bulk_update_state(&ids, BulkOperation::Archive).await)
    }

    pub async fn restore(&self, ids: &[String]) -> Vec<BulkOperationResult> {
        self.restore_with_cancel(ids, &CancellationToken::new()).await
    }

    /// Bring Paused or Archived memories back to Active.
    pub async fn restore_with_cancel(
        &self,
        ids: &[String],
        cancel: &CancellationToken,
    ) -> Vec<BulkOperationResult> {
        let results = self.fan_out(ids, cancel, |id| self.restore_one(id)).await;
        log_summary("restore", &results);
        results
    }

    /// Transitions for `id`, most recent first.
    pub fn get_history(&self, id: &str) -> Vec<StateTransition> {
        self.history.for_memory(id)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Internals
    // ─────────────────────────────────────────────────────────────────────────

    async fn apply(
        &self,
        record: &MemoryRecord,
        target: MemoryState,
        reason: Option<&str>,
    ) -> Result<StateTransition> {
        if !record.state.can_transition_to(target) {
            debug!(id = %record.id, from = %record.state, to = %target, "Rejected transition");
            return Err(Error::InvalidTransition {
                from: record.state,
                to: target,
            });
        }

        self.api.update_state(&record.id, target, reason).await?;

        let transition = StateTransition {
            id: Uuid::new_v4().to_string(),
            memory_id: record.id.clone(),
            from_state: record.state,
            to_state: target,
            reason: reason.map(str::to_string),
            timestamp: Utc::now(),
            actor_id: self.actor_id.clone(),
        };
        if let Err(e) = self.history.append(transition.clone()) {
            warn!(id = %record.id, error = %e, "Failed to persist transition history");
        }

        info!(id = %record.id, from = %record.state, to = %target, "Memory state changed");
        Ok(transition)
    }

    async fn bulk_one(&self, id: &str, target: MemoryState, reason: &str) -> BulkOperationResult {
        let record = match self.api.get_memory(id).await {
            Ok(record) => record,
            Err(e) => return failure(id, None, e),
        };

        if record.state == target {
            return BulkOperationResult::succeeded(id, target, target);
        }

        match self.apply(&record, target, Some(reason)).await {
            Ok(t) => BulkOperationResult::succeeded(id, t.from_state, t.to_state),
            Err(e) => failure(id, Some(record.state), e),
        }
    }

    async fn restore_one(&self, id: &str) -> BulkOperationResult {
        let record = match self.api.get_memory(id).await {
            Ok(record) => record,
            Err(e) => return failure(id, None, e),
        };

        match record.state {
            MemoryState::Active => {
                BulkOperationResult::failed(id, Some(record.state), "already active")
            }
            MemoryState::Deleted => BulkOperationResult::failed(
                id,
                Some(record.state),
                "deleted memories cannot be restored",
            ),
            MemoryState::Paused | MemoryState::Archived => {
                match self.apply(&record, MemoryState::Active, Some("restore")).await {
                    Ok(t) => BulkOperationResult::succeeded(id, t.from_state, t.to_state),
                    Err(e) => failure(id, Some(record.state), e),
                }
            }
        }
    }

    /// Run `op` for every id with bounded concurrency, keeping input order.
    ///
    /// Cancellation drops in-flight futures, so a remote call that completes
    /// afterwards cannot append history.
    async fn fan_out<'a, F, Fut>(
        &'a self,
        ids: &'a [String],
        cancel: &'a CancellationToken,
        op: F,
    ) -> Vec<BulkOperationResult>
    where
        F: Fn(&'a str) -> Fut,
        Fut: Future<Output = BulkOperationResult> + 'a,
    {
        stream::iter(ids)
            .map(|id| {
                let work = op(id.as_str());
                async move {
                    if cancel.is_cancelled() {
                        return BulkOperationResult::failed(id, None, CANCELLED);
                    }
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => BulkOperationResult::failed(id, None, CANCELLED),
                        result = work => result,
                    }
                }
            })
            .buffered(self.concurrency)
            .collect()
            .await
    }
}

/// Per-id failure with the ledger wording for known error kinds.
fn failure(id: &str, previous: Option<MemoryState>, error: Error) -> BulkOperationResult {
    let message = match error {
        Error::NotFound(_) => NOT_FOUND.to_string(),
        Error::InvalidTransition { from, to } => format!("invalid transition: {} -> {}", from, to),
        Error::Cancelled => CANCELLED.to_string(),
        other => other.to_string(),
    };
    BulkOperationResult::failed(id, previous, message)
}

fn log_summary(operation: &str, results: &[BulkOperationResult]) {
    let failed = results.iter().filter(|r| !r.success).count();
    if failed > 0 {
        warn!(operation, total = results.len(), failed, "Bulk operation finished with failures");
    } else {
        info!(operation, total = results.len(), "Bulk operation finished");
    }
}
