//! In-memory storage backend.
//!
//! Row-level updates go through `DashMap::get_mut`, which holds the shard
//! lock for the duration of the update, so `claim` is an atomic
//! compare-and-set on the status.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::RwLock;
use time::OffsetDateTime;

use crate::error::NotificationError;
use crate::store::{ConsentStore, DeliveryLog, NotificationStore};
use crate::types::{
    ConsentPreference, DeliveryLogEntry, NotificationRequest, NotificationStats,
    NotificationStatus, OptOutRecord,
};

#[derive(Debug, Default)]
pub struct InMemoryNotificationStore {
    requests: DashMap<String, NotificationRequest>,
}

impl InMemoryNotificationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn update<F>(&self, id: &str, f: F) -> Result<bool, NotificationError>
    where
        F: FnOnce(&mut NotificationRequest) -> bool,
    {
        let mut row = self
            .requests
            .get_mut(id)
            .ok_or_else(|| NotificationError::NotFound(format!("notification {id}")))?;
        Ok(f(row.value_mut()))
    }

    fn update_in_flight<F>(&self, id: &str, f: F) -> Result<bool, NotificationError>
    where
        F: FnOnce(&mut NotificationRequest),
    {
        self.update(id, |row| {
            if row.status != NotificationStatus::InFlight {
                return false;
            }
            row.claimed_at = None;
            f(row);
            true
        })
    }

    fn collect<P>(&self, predicate: P) -> Vec<NotificationRequest>
    where
        P: Fn(&NotificationRequest) -> bool,
    {
        let mut rows: Vec<NotificationRequest> = self
            .requests
            .iter()
            .filter(|r| predicate(r.value()))
            .map(|r| r.value().clone())
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        rows
    }
}

#[async_trait]
impl NotificationStore for InMemoryNotificationStore {
    async fn insert(&self, request: &NotificationRequest) -> Result<(), NotificationError> {
        if self.requests.contains_key(&request.id) {
            return Err(NotificationError::Storage(format!(
                "duplicate notification id {}",
                request.id
            )));
        }
        self.requests.insert(request.id.clone(), request.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<NotificationRequest>, NotificationError> {
        Ok(self.requests.get(id).map(|r| r.clone()))
    }

    async fn claim(
        &self,
        id: &str,
        from: &[NotificationStatus],
        now: OffsetDateTime,
    ) -> Result<Option<NotificationRequest>, NotificationError> {
        let Some(mut row) = self.requests.get_mut(id) else {
            return Ok(None);
        };
        if !from.contains(&row.status) {
            return Ok(None);
        }
        row.status = NotificationStatus::InFlight;
        row.scheduled_at = None;
        row.claimed_at = Some(now);
        Ok(Some(row.clone()))
    }

    async fn mark_sent(
        &self,
        id: &str,
        provider_correlation_id: &str,
        sent_at: OffsetDateTime,
    ) -> Result<bool, NotificationError> {
        self.update_in_flight(id, |row| {
            row.status = NotificationStatus::Sent;
            row.provider_correlation_id = Some(provider_correlation_id.to_string());
            row.sent_at = Some(sent_at);
            row.last_error = None;
        })
    }

    async fn mark_sent_after_release(
        &self,
        id: &str,
        provider_correlation_id: &str,
        sent_at: OffsetDateTime,
    ) -> Result<bool, NotificationError> {
        self.update(id, |row| {
            if row.status != NotificationStatus::Failed {
                return false;
            }
            row.status = NotificationStatus::Sent;
            row.provider_correlation_id = Some(provider_correlation_id.to_string());
            row.sent_at = Some(sent_at);
            row.last_error = None;
            true
        })
    }

    async fn mark_failed(&self, id: &str, error: &str) -> Result<bool, NotificationError> {
        self.update_in_flight(id, |row| {
            row.status = NotificationStatus::Failed;
            row.last_error = Some(error.to_string());
        })
    }

    async fn mark_scheduled(
        &self,
        id: &str,
        at: OffsetDateTime,
    ) -> Result<bool, NotificationError> {
        self.update_in_flight(id, |row| {
            row.status = NotificationStatus::Scheduled;
            row.scheduled_at = Some(at);
        })
    }

    async fn mark_cancelled(&self, id: &str, reason: &str) -> Result<bool, NotificationError> {
        self.update_in_flight(id, |row| {
            row.status = NotificationStatus::Cancelled;
            row.last_error = Some(reason.to_string());
        })
    }

    async fn cancel(&self, id: &str) -> Result<bool, NotificationError> {
        self.update(id, |row| {
            if matches!(
                row.status,
                NotificationStatus::Pending | NotificationStatus::Scheduled
            ) {
                row.status = NotificationStatus::Cancelled;
                row.scheduled_at = None;
                true
            } else {
                false
            }
        })
    }

    async fn mark_delivered(
        &self,
        id: &str,
        delivered_at: OffsetDateTime,
    ) -> Result<bool, NotificationError> {
        self.update(id, |row| {
            if row.status != NotificationStatus::Sent {
                return false;
            }
            row.status = NotificationStatus::Delivered;
            row.delivered_at = Some(delivered_at);
            true
        })
    }

    async fn record_delivery_error(&self, id: &str, error: &str) -> Result<(), NotificationError> {
        self.update(id, |row| {
            row.last_error = Some(error.to_string());
            true
        })?;
        Ok(())
    }

    async fn increment_retry(&self, id: &str, max: u32) -> Result<u32, NotificationError> {
        let mut row = self
            .requests
            .get_mut(id)
            .ok_or_else(|| NotificationError::NotFound(format!("notification {id}")))?;
        if row.retry_count < max {
            row.retry_count += 1;
        }
        Ok(row.retry_count)
    }

    async fn find_by_provider_id(
        &self,
        provider_correlation_id: &str,
    ) -> Result<Option<NotificationRequest>, NotificationError> {
        Ok(self
            .requests
            .iter()
            .find(|r| r.provider_correlation_id.as_deref() == Some(provider_correlation_id))
            .map(|r| r.value().clone()))
    }

    async fn list_due_scheduled(
        &self,
        now: OffsetDateTime,
        limit: u32,
    ) -> Result<Vec<NotificationRequest>, NotificationError> {
        let mut rows = self.collect(|r| {
            r.status == NotificationStatus::Scheduled
                && r.scheduled_at.map(|at| at <= now).unwrap_or(true)
        });
        rows.sort_by(|a, b| a.scheduled_at.cmp(&b.scheduled_at));
        rows.truncate(limit as usize);
        Ok(rows)
    }

    async fn list_retry_candidates(
        &self,
        created_after: OffsetDateTime,
        max_retries: u32,
        limit: u32,
    ) -> Result<Vec<NotificationRequest>, NotificationError> {
        let mut rows = self.collect(|r| {
            r.status == NotificationStatus::Failed
                && r.retry_count < max_retries
                && r.created_at > created_after
        });
        rows.truncate(limit as usize);
        Ok(rows)
    }

    async fn release_stale_leases(
        &self,
        claimed_before: OffsetDateTime,
    ) -> Result<Vec<String>, NotificationError> {
        let mut released = Vec::new();
        for mut row in self.requests.iter_mut() {
            let stale = row.status == NotificationStatus::InFlight
                && row.claimed_at.map(|at| at < claimed_before).unwrap_or(true);
            if stale {
                row.status = NotificationStatus::Failed;
                row.claimed_at = None;
                row.last_error = Some("lease expired before dispatch completed".to_string());
                released.push(row.id.clone());
            }
        }
        released.sort();
        Ok(released)
    }

    async fn list_by_status(
        &self,
        status: NotificationStatus,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<NotificationRequest>, NotificationError> {
        let mut rows = self.collect(|r| r.status == status);
        rows.reverse();
        Ok(rows
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn stats(&self) -> Result<NotificationStats, NotificationError> {
        let mut stats = NotificationStats::default();
        for row in self.requests.iter() {
            stats.record(row.status);
        }
        Ok(stats)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryConsentStore {
    preferences: DashMap<String, ConsentPreference>,
    opt_outs: RwLock<Vec<OptOutRecord>>,
}

impl InMemoryConsentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn opt_out_records(&self) -> Vec<OptOutRecord> {
        self.opt_outs
            .read()
            .map(|records| records.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ConsentStore for InMemoryConsentStore {
    async fn get_preference(
        &self,
        patient_id: &str,
    ) -> Result<Option<ConsentPreference>, NotificationError> {
        Ok(self.preferences.get(patient_id).map(|p| p.clone()))
    }

    async fn upsert_preference(
        &self,
        preference: &ConsentPreference,
    ) -> Result<(), NotificationError> {
        self.preferences
            .insert(preference.patient_id.clone(), preference.clone());
        Ok(())
    }

    async fn record_opt_out(&self, record: &OptOutRecord) -> Result<(), NotificationError> {
        self.opt_outs
            .write()
            .map_err(|e| NotificationError::Internal(e.to_string()))?
            .push(record.clone());
        Ok(())
    }

    async fn purge_opt_out_records(
        &self,
        before: OffsetDateTime,
    ) -> Result<u64, NotificationError> {
        let mut records = self
            .opt_outs
            .write()
            .map_err(|e| NotificationError::Internal(e.to_string()))?;
        let len = records.len();
        records.retain(|r| r.recorded_at >= before);
        Ok((len - records.len()) as u64)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryDeliveryLog {
    entries: RwLock<Vec<DeliveryLogEntry>>,
}

impl InMemoryDeliveryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<DeliveryLogEntry> {
        self.entries
            .read()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl DeliveryLog for InMemoryDeliveryLog {
    async fn append(&self, entry: &DeliveryLogEntry) -> Result<(), NotificationError> {
        self.entries
            .write()
            .map_err(|e| NotificationError::Internal(e.to_string()))?
            .push(entry.clone());
        Ok(())
    }

    async fn list_for(
        &self,
        notification_id: &str,
    ) -> Result<Vec<DeliveryLogEntry>, NotificationError> {
        Ok(self
            .entries
            .read()
            .map_err(|e| NotificationError::Internal(e.to_string()))?
            .iter()
            .filter(|e| e.notification_id == notification_id)
            .cloned()
            .collect())
    }
}
