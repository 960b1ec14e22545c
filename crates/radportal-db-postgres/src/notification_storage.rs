//! PostgreSQL storage implementation for SMS notification requests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashSet;
use sqlx_postgres::PgPool;
use time::OffsetDateTime;
use tracing::{debug, info, instrument};

use radportal_notifications::{
    NotificationError, NotificationRequest, NotificationStats, NotificationStatus,
    NotificationStore, Priority,
};

use crate::convert::{chrono_to_time, chrono_to_time_opt, time_to_chrono, time_to_chrono_opt};
use crate::error::{PostgresError, db_err};

const SELECT_COLUMNS: &str = "id, patient_id, recipient_phone, template_type, variables, \
     priority, status, scheduled_at, created_at, sent_at, delivered_at, claimed_at, \
     retry_count, provider_correlation_id, last_error";

type RequestRow = (
    String,
    Option<String>,
    String,
    String,
    serde_json::Value,
    String,
    String,
    Option<DateTime<Utc>>,
    DateTime<Utc>,
    Option<DateTime<Utc>>,
    Option<DateTime<Utc>>,
    Option<DateTime<Utc>>,
    i32,
    Option<String>,
    Option<String>,
);

/// PostgreSQL implementation of [`NotificationStore`].
///
/// Row leases are conditional `UPDATE ... WHERE status = ANY(..) RETURNING`
/// statements, so two workers can never claim the same request.
#[derive(Clone)]
pub struct PostgresNotificationStorage {
    pool: PgPool,
    tables_created: Arc<DashSet<String>>,
}

impl PostgresNotificationStorage {
    /// Create a new PostgreSQL notification storage.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            tables_created: Arc::new(DashSet::new()),
        }
    }

    /// Ensure the notification table exists.
    #[instrument(skip(self))]
    async fn ensure_tables(&self) -> Result<(), NotificationError> {
        if self.tables_created.contains("sms_notifications") {
            return Ok(());
        }

        sqlx_core::query::query(
            r#"
            CREATE TABLE IF NOT EXISTS _sms_notifications (
                id TEXT PRIMARY KEY,
                patient_id TEXT,
                recipient_phone TEXT NOT NULL,
                template_type TEXT NOT NULL,
                variables JSONB NOT NULL DEFAULT '{}',
                priority TEXT NOT NULL DEFAULT 'normal',
                status TEXT NOT NULL DEFAULT 'pending',
                scheduled_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                sent_at TIMESTAMPTZ,
                delivered_at TIMESTAMPTZ,
                claimed_at TIMESTAMPTZ,
                retry_count INTEGER NOT NULL DEFAULT 0,
                provider_correlation_id TEXT,
                last_error TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        sqlx_core::query::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_sms_notifications_status ON _sms_notifications(status);
            CREATE INDEX IF NOT EXISTS idx_sms_notifications_scheduled ON _sms_notifications(scheduled_at) WHERE status = 'scheduled';
            CREATE INDEX IF NOT EXISTS idx_sms_notifications_retry ON _sms_notifications(created_at) WHERE status = 'failed';
            CREATE UNIQUE INDEX IF NOT EXISTS idx_sms_notifications_provider ON _sms_notifications(provider_correlation_id) WHERE provider_correlation_id IS NOT NULL;
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        info!("Created SMS notifications table");
        self.tables_created.insert("sms_notifications".to_string());
        Ok(())
    }

    fn from_row(row: RequestRow) -> Result<NotificationRequest, NotificationError> {
        let (
            id,
            patient_id,
            recipient_phone,
            template_type,
            variables,
            priority,
            status,
            scheduled_at,
            created_at,
            sent_at,
            delivered_at,
            claimed_at,
            retry_count,
            provider_correlation_id,
            last_error,
        ) = row;

        let variables: HashMap<String, String> = serde_json::from_value(variables)
            .map_err(|e| PostgresError::decode(format!("variables of {id}: {e}")))?;
        let priority = Priority::parse(&priority)
            .ok_or_else(|| PostgresError::decode(format!("unknown priority '{priority}'")))?;
        let status = NotificationStatus::parse(&status)
            .ok_or_else(|| PostgresError::decode(format!("unknown status '{status}'")))?;

        Ok(NotificationRequest {
            id,
            patient_id,
            recipient_phone,
            template_type,
            variables,
            priority,
            status,
            scheduled_at: chrono_to_time_opt(scheduled_at),
            created_at: chrono_to_time(created_at),
            sent_at: chrono_to_time_opt(sent_at),
            delivered_at: chrono_to_time_opt(delivered_at),
            claimed_at: chrono_to_time_opt(claimed_at),
            retry_count: retry_count.max(0) as u32,
            provider_correlation_id,
            last_error,
        })
    }

    fn from_rows(rows: Vec<RequestRow>) -> Result<Vec<NotificationRequest>, NotificationError> {
        rows.into_iter().map(Self::from_row).collect()
    }

    /// Log transitions that found the row already moved on.
    fn applied(id: &str, rows_affected: u64) -> bool {
        if rows_affected == 0 {
            debug!(id = %id, "Row no longer in flight, transition skipped");
        }
        rows_affected > 0
    }
}

#[async_trait]
impl NotificationStore for PostgresNotificationStorage {
    #[instrument(skip(self, request), fields(id = %request.id))]
    async fn insert(&self, request: &NotificationRequest) -> Result<(), NotificationError> {
        self.ensure_tables().await?;

        let variables = serde_json::to_value(&request.variables)
            .map_err(|e| NotificationError::Internal(e.to_string()))?;

        sqlx_core::query::query(
            r#"
            INSERT INTO _sms_notifications (
                id, patient_id, recipient_phone, template_type, variables,
                priority, status, scheduled_at, created_at, retry_count
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(&request.id)
        .bind(&request.patient_id)
        .bind(&request.recipient_phone)
        .bind(&request.template_type)
        .bind(variables)
        .bind(request.priority.as_str())
        .bind(request.status.as_str())
        .bind(time_to_chrono_opt(request.scheduled_at))
        .bind(time_to_chrono(request.created_at))
        .bind(request.retry_count as i32)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        debug!(id = %request.id, "Inserted notification request");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get(&self, id: &str) -> Result<Option<NotificationRequest>, NotificationError> {
        self.ensure_tables().await?;

        let row: Option<RequestRow> = sqlx_core::query_as::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM _sms_notifications WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(Self::from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn claim(
        &self,
        id: &str,
        from: &[NotificationStatus],
        now: OffsetDateTime,
    ) -> Result<Option<NotificationRequest>, NotificationError> {
        self.ensure_tables().await?;

        let allowed: Vec<String> = from.iter().map(|s| s.as_str().to_string()).collect();
        let row: Option<RequestRow> = sqlx_core::query_as::query_as(&format!(
            r#"
            UPDATE _sms_notifications
            SET status = 'in_flight', scheduled_at = NULL, claimed_at = $3
            WHERE id = $1 AND status = ANY($2)
            RETURNING {SELECT_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(allowed)
        .bind(time_to_chrono(now))
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(Self::from_row).transpose()
    }

    async fn mark_sent(
        &self,
        id: &str,
        provider_correlation_id: &str,
        sent_at: OffsetDateTime,
    ) -> Result<bool, NotificationError> {
        self.ensure_tables().await?;

        let result = sqlx_core::query::query(
            r#"
            UPDATE _sms_notifications
            SET status = 'sent', provider_correlation_id = $2, sent_at = $3,
                last_error = NULL, claimed_at = NULL
            WHERE id = $1 AND status = 'in_flight'
            "#,
        )
        .bind(id)
        .bind(provider_correlation_id)
        .bind(time_to_chrono(sent_at))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(Self::applied(id, result.rows_affected()))
    }

    #[instrument(skip(self))]
    async fn mark_sent_after_release(
        &self,
        id: &str,
        provider_correlation_id: &str,
        sent_at: OffsetDateTime,
    ) -> Result<bool, NotificationError> {
        self.ensure_tables().await?;

        let result = sqlx_core::query::query(
            r#"
            UPDATE _sms_notifications
            SET status = 'sent', provider_correlation_id = $2, sent_at = $3,
                last_error = NULL, claimed_at = NULL
            WHERE id = $1 AND status = 'failed'
            "#,
        )
        .bind(id)
        .bind(provider_correlation_id)
        .bind(time_to_chrono(sent_at))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_failed(&self, id: &str, error: &str) -> Result<bool, NotificationError> {
        self.ensure_tables().await?;

        let result = sqlx_core::query::query(
            r#"
            UPDATE _sms_notifications
            SET status = 'failed', last_error = $2, claimed_at = NULL
            WHERE id = $1 AND status = 'in_flight'
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(Self::applied(id, result.rows_affected()))
    }

    async fn mark_scheduled(
        &self,
        id: &str,
        at: OffsetDateTime,
    ) -> Result<bool, NotificationError> {
        self.ensure_tables().await?;

        let result = sqlx_core::query::query(
            r#"
            UPDATE _sms_notifications
            SET status = 'scheduled', scheduled_at = $2, claimed_at = NULL
            WHERE id = $1 AND status = 'in_flight'
            "#,
        )
        .bind(id)
        .bind(time_to_chrono(at))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(Self::applied(id, result.rows_affected()))
    }

    async fn mark_cancelled(&self, id: &str, reason: &str) -> Result<bool, NotificationError> {
        self.ensure_tables().await?;

        let result = sqlx_core::query::query(
            r#"
            UPDATE _sms_notifications
            SET status = 'cancelled', last_error = $2, claimed_at = NULL
            WHERE id = $1 AND status = 'in_flight'
            "#,
        )
        .bind(id)
        .bind(reason)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(Self::applied(id, result.rows_affected()))
    }

    #[instrument(skip(self))]
    async fn cancel(&self, id: &str) -> Result<bool, NotificationError> {
        self.ensure_tables().await?;

        let result = sqlx_core::query::query(
            r#"
            UPDATE _sms_notifications
            SET status = 'cancelled', scheduled_at = NULL
            WHERE id = $1 AND status IN ('pending', 'scheduled')
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn mark_delivered(
        &self,
        id: &str,
        delivered_at: OffsetDateTime,
    ) -> Result<bool, NotificationError> {
        self.ensure_tables().await?;

        let result = sqlx_core::query::query(
            r#"
            UPDATE _sms_notifications
            SET status = 'delivered', delivered_at = $2
            WHERE id = $1 AND status = 'sent'
            "#,
        )
        .bind(id)
        .bind(time_to_chrono(delivered_at))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn record_delivery_error(&self, id: &str, error: &str) -> Result<(), NotificationError> {
        self.ensure_tables().await?;

        sqlx_core::query::query("UPDATE _sms_notifications SET last_error = $2 WHERE id = $1")
            .bind(id)
            .bind(error)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn increment_retry(&self, id: &str, max: u32) -> Result<u32, NotificationError> {
        self.ensure_tables().await?;

        let row: Option<(i32,)> = sqlx_core::query_as::query_as(
            r#"
            UPDATE _sms_notifications
            SET retry_count = LEAST(retry_count + 1, $2)
            WHERE id = $1
            RETURNING retry_count
            "#,
        )
        .bind(id)
        .bind(max as i32)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(|(count,)| count.max(0) as u32)
            .ok_or_else(|| NotificationError::NotFound(format!("notification {id}")))
    }

    async fn find_by_provider_id(
        &self,
        provider_correlation_id: &str,
    ) -> Result<Option<NotificationRequest>, NotificationError> {
        self.ensure_tables().await?;

        let row: Option<RequestRow> = sqlx_core::query_as::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM _sms_notifications WHERE provider_correlation_id = $1"
        ))
        .bind(provider_correlation_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(Self::from_row).transpose()
    }

    async fn list_due_scheduled(
        &self,
        now: OffsetDateTime,
        limit: u32,
    ) -> Result<Vec<NotificationRequest>, NotificationError> {
        self.ensure_tables().await?;

        let rows: Vec<RequestRow> = sqlx_core::query_as::query_as(&format!(
            r#"
            SELECT {SELECT_COLUMNS} FROM _sms_notifications
            WHERE status = 'scheduled' AND (scheduled_at IS NULL OR scheduled_at <= $1)
            ORDER BY scheduled_at ASC NULLS FIRST
            LIMIT $2
            "#
        ))
        .bind(time_to_chrono(now))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Self::from_rows(rows)
    }

    async fn list_retry_candidates(
        &self,
        created_after: OffsetDateTime,
        max_retries: u32,
        limit: u32,
    ) -> Result<Vec<NotificationRequest>, NotificationError> {
        self.ensure_tables().await?;

        let rows: Vec<RequestRow> = sqlx_core::query_as::query_as(&format!(
            r#"
            SELECT {SELECT_COLUMNS} FROM _sms_notifications
            WHERE status = 'failed' AND retry_count < $2 AND created_at > $1
            ORDER BY created_at ASC, id ASC
            LIMIT $3
            "#
        ))
        .bind(time_to_chrono(created_after))
        .bind(max_retries as i32)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Self::from_rows(rows)
    }

    #[instrument(skip(self))]
    async fn release_stale_leases(
        &self,
        claimed_before: OffsetDateTime,
    ) -> Result<Vec<String>, NotificationError> {
        self.ensure_tables().await?;

        let rows: Vec<(String,)> = sqlx_core::query_as::query_as(
            r#"
            UPDATE _sms_notifications
            SET status = 'failed', claimed_at = NULL,
                last_error = 'lease expired before dispatch completed'
            WHERE status = 'in_flight' AND (claimed_at IS NULL OR claimed_at < $1)
            RETURNING id
            "#,
        )
        .bind(time_to_chrono(claimed_before))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut ids: Vec<String> = rows.into_iter().map(|(id,)| id).collect();
        ids.sort();
        Ok(ids)
    }

    async fn list_by_status(
        &self,
        status: NotificationStatus,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<NotificationRequest>, NotificationError> {
        self.ensure_tables().await?;

        let rows: Vec<RequestRow> = sqlx_core::query_as::query_as(&format!(
            r#"
            SELECT {SELECT_COLUMNS} FROM _sms_notifications
            WHERE status = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2 OFFSET $3
            "#
        ))
        .bind(status.as_str())
        .bind(i64::from(limit))
        .bind(i64::from(offset))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Self::from_rows(rows)
    }

    async fn stats(&self) -> Result<NotificationStats, NotificationError> {
        self.ensure_tables().await?;

        let rows: Vec<(String, i64)> = sqlx_core::query_as::query_as(
            "SELECT status, COUNT(*) FROM _sms_notifications GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut stats = NotificationStats::default();
        for (status, count) in rows {
            let status = NotificationStatus::parse(&status)
                .ok_or_else(|| PostgresError::decode(format!("unknown status '{status}'")))?;
            stats.add(status, count.max(0) as u32);
        }
        Ok(stats)
    }
}
