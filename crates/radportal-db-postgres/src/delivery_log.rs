//! Append-only delivery audit log in PostgreSQL.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashSet;
use sqlx_postgres::PgPool;
use tracing::{info, instrument};

use radportal_notifications::{DeliveryEvent, DeliveryLog, DeliveryLogEntry, NotificationError};

use crate::convert::{chrono_to_time, time_to_chrono};
use crate::error::{PostgresError, db_err};

#[derive(Clone)]
pub struct PostgresDeliveryLog {
    pool: PgPool,
    tables_created: Arc<DashSet<String>>,
}

impl PostgresDeliveryLog {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            tables_created: Arc::new(DashSet::new()),
        }
    }

    #[instrument(skip(self))]
    async fn ensure_tables(&self) -> Result<(), NotificationError> {
        if self.tables_created.contains("sms_delivery_log") {
            return Ok(());
        }

        // No UPDATE or DELETE is ever issued against this table
        sqlx_core::query::query(
            r#"
            CREATE TABLE IF NOT EXISTS _sms_delivery_log (
                id TEXT PRIMARY KEY,
                notification_id TEXT NOT NULL,
                event TEXT NOT NULL,
                detail TEXT,
                recorded_at TIMESTAMPTZ NOT NULL,
                seq BIGSERIAL
            );
            CREATE INDEX IF NOT EXISTS idx_sms_delivery_log_notification ON _sms_delivery_log(notification_id, seq);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        info!("Created SMS delivery log table");
        self.tables_created.insert("sms_delivery_log".to_string());
        Ok(())
    }
}

#[async_trait]
impl DeliveryLog for PostgresDeliveryLog {
    async fn append(&self, entry: &DeliveryLogEntry) -> Result<(), NotificationError> {
        self.ensure_tables().await?;

        sqlx_core::query::query(
            r#"
            INSERT INTO _sms_delivery_log (id, notification_id, event, detail, recorded_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&entry.id)
        .bind(&entry.notification_id)
        .bind(entry.event.as_str())
        .bind(&entry.detail)
        .bind(time_to_chrono(entry.recorded_at))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_for(
        &self,
        notification_id: &str,
    ) -> Result<Vec<DeliveryLogEntry>, NotificationError> {
        self.ensure_tables().await?;

        let rows: Vec<(String, String, String, Option<String>, DateTime<Utc>)> =
            sqlx_core::query_as::query_as(
                r#"
                SELECT id, notification_id, event, detail, recorded_at
                FROM _sms_delivery_log
                WHERE notification_id = $1
                ORDER BY seq ASC
                "#,
            )
            .bind(notification_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        rows.into_iter()
            .map(|(id, notification_id, event, detail, recorded_at)| -> Result<_, NotificationError> {
                let event = DeliveryEvent::parse(&event)
                    .ok_or_else(|| PostgresError::decode(format!("unknown event '{event}'")))?;
                Ok(DeliveryLogEntry {
                    id,
                    notification_id,
                    event,
                    detail,
                    recorded_at: chrono_to_time(recorded_at),
                })
            })
            .collect()
    }
}
