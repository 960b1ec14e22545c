use async_trait::async_trait;
use time::OffsetDateTime;

use crate::error::NotificationError;
use crate::types::{
    ConsentPreference, DeliveryLogEntry, NotificationRequest, NotificationStats,
    NotificationStatus, OptOutRecord,
};

/// Storage trait for notification requests.
///
/// Transitions out of `in_flight` (`mark_sent`, `mark_failed`, `mark_scheduled`,
/// `mark_cancelled`) only apply to rows currently claimed, so a row that was
/// released or already sent is never overwritten. They return false when the
/// lease was lost.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Persist a new request
    async fn insert(&self, request: &NotificationRequest) -> Result<(), NotificationError>;

    /// Get a request by ID
    async fn get(&self, id: &str) -> Result<Option<NotificationRequest>, NotificationError>;

    /// Lease a row: move it to `in_flight` only if its status is one of `from`.
    /// Returns the claimed row, or `None` when another worker got there first.
    async fn claim(
        &self,
        id: &str,
        from: &[NotificationStatus],
        now: OffsetDateTime,
    ) -> Result<Option<NotificationRequest>, NotificationError>;

    /// in_flight → sent
    async fn mark_sent(
        &self,
        id: &str,
        provider_correlation_id: &str,
        sent_at: OffsetDateTime,
    ) -> Result<bool, NotificationError>;

    /// failed → sent, for a provider acceptance that arrived after the lease
    /// was released. Returns false unless the row is still `failed`.
    async fn mark_sent_after_release(
        &self,
        id: &str,
        provider_correlation_id: &str,
        sent_at: OffsetDateTime,
    ) -> Result<bool, NotificationError>;

    /// in_flight → failed
    async fn mark_failed(&self, id: &str, error: &str) -> Result<bool, NotificationError>;

    /// in_flight → scheduled
    async fn mark_scheduled(
        &self,
        id: &str,
        at: OffsetDateTime,
    ) -> Result<bool, NotificationError>;

    /// in_flight → cancelled (consent suppression)
    async fn mark_cancelled(&self, id: &str, reason: &str) -> Result<bool, NotificationError>;

    /// Void a pending or scheduled request. Returns false if it was in any other state.
    async fn cancel(&self, id: &str) -> Result<bool, NotificationError>;

    /// sent → delivered. Returns false if the row was not `sent`.
    async fn mark_delivered(
        &self,
        id: &str,
        delivered_at: OffsetDateTime,
    ) -> Result<bool, NotificationError>;

    /// Record a provider-reported delivery error without changing status
    async fn record_delivery_error(&self, id: &str, error: &str) -> Result<(), NotificationError>;

    /// Increment retry_count, never past `max`. Returns the new count.
    async fn increment_retry(&self, id: &str, max: u32) -> Result<u32, NotificationError>;

    /// Look up a request by the provider's message id
    async fn find_by_provider_id(
        &self,
        provider_correlation_id: &str,
    ) -> Result<Option<NotificationRequest>, NotificationError>;

    /// Scheduled requests with scheduled_at <= now, oldest first
    async fn list_due_scheduled(
        &self,
        now: OffsetDateTime,
        limit: u32,
    ) -> Result<Vec<NotificationRequest>, NotificationError>;

    /// Failed requests with retry_count < max_retries created after `created_after`
    async fn list_retry_candidates(
        &self,
        created_after: OffsetDateTime,
        max_retries: u32,
        limit: u32,
    ) -> Result<Vec<NotificationRequest>, NotificationError>;

    /// Move in_flight rows claimed before `claimed_before` to failed. Returns their ids.
    async fn release_stale_leases(
        &self,
        claimed_before: OffsetDateTime,
    ) -> Result<Vec<String>, NotificationError>;

    /// Get requests by status for monitoring
    async fn list_by_status(
        &self,
        status: NotificationStatus,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<NotificationRequest>, NotificationError>;

    /// Get request statistics (counts by status)
    async fn stats(&self) -> Result<NotificationStats, NotificationError>;
}

/// Storage trait for consent preferences and opt-out audit records
#[async_trait]
pub trait ConsentStore: Send + Sync {
    async fn get_preference(
        &self,
        patient_id: &str,
    ) -> Result<Option<ConsentPreference>, NotificationError>;

    /// Insert or replace a preference record. Records are never deleted.
    async fn upsert_preference(
        &self,
        preference: &ConsentPreference,
    ) -> Result<(), NotificationError>;

    async fn record_opt_out(&self, record: &OptOutRecord) -> Result<(), NotificationError>;

    /// Remove opt-out audit records older than `before`. Returns the number removed.
    async fn purge_opt_out_records(
        &self,
        before: OffsetDateTime,
    ) -> Result<u64, NotificationError>;
}

/// Append-only audit trail
#[async_trait]
pub trait DeliveryLog: Send + Sync {
    async fn append(&self, entry: &DeliveryLogEntry) -> Result<(), NotificationError>;

    async fn list_for(
        &self,
        notification_id: &str,
    ) -> Result<Vec<DeliveryLogEntry>, NotificationError>;
}
