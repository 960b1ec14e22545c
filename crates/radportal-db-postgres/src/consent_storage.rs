//! PostgreSQL storage for SMS consent preferences and opt-out audit records.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashSet;
use sqlx_postgres::PgPool;
use time::OffsetDateTime;
use tracing::{info, instrument};

use radportal_notifications::{ConsentPreference, ConsentStore, NotificationError, OptOutRecord};

use crate::convert::{chrono_to_time, chrono_to_time_opt, time_to_chrono, time_to_chrono_opt};
use crate::error::db_err;

type PreferenceRow = (
    String,
    bool,
    bool,
    bool,
    bool,
    Option<DateTime<Utc>>,
    Option<String>,
    DateTime<Utc>,
);

#[derive(Clone)]
pub struct PostgresConsentStorage {
    pool: PgPool,
    tables_created: Arc<DashSet<String>>,
}

impl PostgresConsentStorage {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            tables_created: Arc::new(DashSet::new()),
        }
    }

    #[instrument(skip(self))]
    async fn ensure_tables(&self) -> Result<(), NotificationError> {
        if self.tables_created.contains("sms_consent") {
            return Ok(());
        }

        sqlx_core::query::query(
            r#"
            CREATE TABLE IF NOT EXISTS _sms_consent_preferences (
                patient_id TEXT PRIMARY KEY,
                report_ready_notifications BOOLEAN NOT NULL DEFAULT TRUE,
                appointment_notifications BOOLEAN NOT NULL DEFAULT TRUE,
                general_information_notifications BOOLEAN NOT NULL DEFAULT TRUE,
                emergency_notifications BOOLEAN NOT NULL DEFAULT TRUE,
                opted_out_at TIMESTAMPTZ,
                opt_out_reason TEXT,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        sqlx_core::query::query(
            r#"
            CREATE TABLE IF NOT EXISTS _sms_opt_out_records (
                id BIGSERIAL PRIMARY KEY,
                patient_id TEXT NOT NULL,
                phone TEXT,
                reason TEXT NOT NULL,
                keyword TEXT,
                recorded_at TIMESTAMPTZ NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sms_opt_out_recorded ON _sms_opt_out_records(recorded_at);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        info!("Created SMS consent tables");
        self.tables_created.insert("sms_consent".to_string());
        Ok(())
    }
}

#[async_trait]
impl ConsentStore for PostgresConsentStorage {
    #[instrument(skip(self))]
    async fn get_preference(
        &self,
        patient_id: &str,
    ) -> Result<Option<ConsentPreference>, NotificationError> {
        self.ensure_tables().await?;

        let row: Option<PreferenceRow> = sqlx_core::query_as::query_as(
            r#"
            SELECT patient_id, report_ready_notifications, appointment_notifications,
                   general_information_notifications, emergency_notifications,
                   opted_out_at, opt_out_reason, updated_at
            FROM _sms_consent_preferences WHERE patient_id = $1
            "#,
        )
        .bind(patient_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.map(
            |(
                patient_id,
                report_ready_notifications,
                appointment_notifications,
                general_information_notifications,
                emergency_notifications,
                opted_out_at,
                opt_out_reason,
                updated_at,
            )| ConsentPreference {
                patient_id,
                report_ready_notifications,
                appointment_notifications,
                general_information_notifications,
                emergency_notifications,
                opted_out_at: chrono_to_time_opt(opted_out_at),
                opt_out_reason,
                updated_at: chrono_to_time(updated_at),
            },
        ))
    }

    #[instrument(skip(self, preference), fields(patient_id = %preference.patient_id))]
    async fn upsert_preference(
        &self,
        preference: &ConsentPreference,
    ) -> Result<(), NotificationError> {
        self.ensure_tables().await?;

        sqlx_core::query::query(
            r#"
            INSERT INTO _sms_consent_preferences (
                patient_id, report_ready_notifications, appointment_notifications,
                general_information_notifications, emergency_notifications,
                opted_out_at, opt_out_reason, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (patient_id) DO UPDATE SET
                report_ready_notifications = EXCLUDED.report_ready_notifications,
                appointment_notifications = EXCLUDED.appointment_notifications,
                general_information_notifications = EXCLUDED.general_information_notifications,
                emergency_notifications = EXCLUDED.emergency_notifications,
                opted_out_at = EXCLUDED.opted_out_at,
                opt_out_reason = EXCLUDED.opt_out_reason,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&preference.patient_id)
        .bind(preference.report_ready_notifications)
        .bind(preference.appointment_notifications)
        .bind(preference.general_information_notifications)
        .bind(preference.emergency_notifications)
        .bind(time_to_chrono_opt(preference.opted_out_at))
        .bind(&preference.opt_out_reason)
        .bind(time_to_chrono(preference.updated_at))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    #[instrument(skip(self, record), fields(patient_id = %record.patient_id))]
    async fn record_opt_out(&self, record: &OptOutRecord) -> Result<(), NotificationError> {
        self.ensure_tables().await?;

        sqlx_core::query::query(
            r#"
            INSERT INTO _sms_opt_out_records (patient_id, phone, reason, keyword, recorded_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&record.patient_id)
        .bind(&record.phone)
        .bind(&record.reason)
        .bind(&record.keyword)
        .bind(time_to_chrono(record.recorded_at))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn purge_opt_out_records(
        &self,
        before: OffsetDateTime,
    ) -> Result<u64, NotificationError> {
        self.ensure_tables().await?;

        let result =
            sqlx_core::query::query("DELETE FROM _sms_opt_out_records WHERE recorded_at < $1")
                .bind(time_to_chrono(before))
                .execute(&self.pool)
                .await
                .map_err(db_err)?;

        Ok(result.rows_affected())
    }
}
