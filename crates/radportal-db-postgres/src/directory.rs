//! Read access to the portal's patient, report, appointment and study tables.
//!
//! These tables belong to the portal application; the only write issued here
//! is the set-once `critical_notified_at` stamp.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx_postgres::PgPool;
use time::OffsetDateTime;
use tracing::instrument;

use radportal_notifications::NotificationError;
use radportal_notifications::directory::{
    AppointmentContext, PatientContact, PortalDirectory, ReportContext, ReportStatus,
    StudyContext,
};

use crate::convert::{chrono_to_time, chrono_to_time_opt, time_to_chrono};
use crate::error::{PostgresError, db_err};

type PatientColumns = (String, String, Option<String>, bool);

#[derive(Clone)]
pub struct PostgresPortalDirectory {
    pool: PgPool,
}

impl PostgresPortalDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn patient_from(columns: PatientColumns) -> PatientContact {
        let (patient_id, display_name, mobile_phone, has_portal_account) = columns;
        PatientContact {
            patient_id,
            display_name,
            mobile_phone,
            has_portal_account,
        }
    }
}

fn digits(s: &str) -> String {
    s.chars().filter(|c| c.is_ascii_digit()).collect()
}

#[async_trait]
impl PortalDirectory for PostgresPortalDirectory {
    #[instrument(skip(self))]
    async fn report(&self, report_id: &str) -> Result<Option<ReportContext>, NotificationError> {
        let row: Option<(
            String,
            String,
            String,
            String,
            bool,
            Option<DateTime<Utc>>,
            String,
            String,
            Option<String>,
            bool,
        )> = sqlx_core::query_as::query_as(
            r#"
            SELECT r.id, r.modality, r.study_description, r.status, r.is_critical,
                   r.critical_notified_at,
                   p.id, p.display_name, p.mobile_phone, p.has_portal_account
            FROM reports r
            JOIN patients p ON p.id = r.patient_id
            WHERE r.id = $1
            "#,
        )
        .bind(report_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        let Some((
            report_id,
            modality,
            study_description,
            status,
            is_critical,
            critical_notified_at,
            patient_id,
            display_name,
            mobile_phone,
            has_portal_account,
        )) = row
        else {
            return Ok(None);
        };

        let status = ReportStatus::parse(&status)
            .ok_or_else(|| PostgresError::decode(format!("unknown report status '{status}'")))?;

        Ok(Some(ReportContext {
            report_id,
            patient: Self::patient_from((
                patient_id,
                display_name,
                mobile_phone,
                has_portal_account,
            )),
            modality,
            study_description,
            status,
            is_critical,
            critical_notified_at: chrono_to_time_opt(critical_notified_at),
        }))
    }

    #[instrument(skip(self))]
    async fn appointment(
        &self,
        appointment_id: &str,
    ) -> Result<Option<AppointmentContext>, NotificationError> {
        let row: Option<(
            String,
            DateTime<Utc>,
            String,
            String,
            String,
            String,
            Option<String>,
            bool,
        )> = sqlx_core::query_as::query_as(
            r#"
            SELECT a.id, a.starts_at, a.procedure, a.location,
                   p.id, p.display_name, p.mobile_phone, p.has_portal_account
            FROM appointments a
            JOIN patients p ON p.id = a.patient_id
            WHERE a.id = $1
            "#,
        )
        .bind(appointment_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.map(
            |(
                appointment_id,
                starts_at,
                procedure,
                location,
                patient_id,
                display_name,
                mobile_phone,
                has_portal_account,
            )| AppointmentContext {
                appointment_id,
                patient: Self::patient_from((
                    patient_id,
                    display_name,
                    mobile_phone,
                    has_portal_account,
                )),
                starts_at: chrono_to_time(starts_at),
                procedure,
                location,
            },
        ))
    }

    #[instrument(skip(self))]
    async fn study(&self, study_id: &str) -> Result<Option<StudyContext>, NotificationError> {
        let row: Option<(String, String, String, String, String, Option<String>, bool)> =
            sqlx_core::query_as::query_as(
                r#"
                SELECT s.id, s.modality, s.study_description,
                       p.id, p.display_name, p.mobile_phone, p.has_portal_account
                FROM studies s
                JOIN patients p ON p.id = s.patient_id
                WHERE s.id = $1
                "#,
            )
            .bind(study_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(row.map(
            |(
                study_id,
                modality,
                study_description,
                patient_id,
                display_name,
                mobile_phone,
                has_portal_account,
            )| StudyContext {
                study_id,
                patient: Self::patient_from((
                    patient_id,
                    display_name,
                    mobile_phone,
                    has_portal_account,
                )),
                modality,
                study_description,
            },
        ))
    }

    #[instrument(skip(self))]
    async fn patient(
        &self,
        patient_id: &str,
    ) -> Result<Option<PatientContact>, NotificationError> {
        let row: Option<PatientColumns> = sqlx_core::query_as::query_as(
            "SELECT id, display_name, mobile_phone, has_portal_account FROM patients WHERE id = $1",
        )
        .bind(patient_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.map(Self::patient_from))
    }

    #[instrument(skip(self))]
    async fn patients_by_phone(
        &self,
        candidates: &[String],
    ) -> Result<Vec<String>, NotificationError> {
        let wanted: Vec<String> = candidates.iter().map(|c| digits(c)).collect();

        let rows: Vec<(String,)> = sqlx_core::query_as::query_as(
            r#"
            SELECT id FROM patients
            WHERE mobile_phone IS NOT NULL
              AND regexp_replace(mobile_phone, '[^0-9]', '', 'g') = ANY($1)
            ORDER BY id
            "#,
        )
        .bind(wanted)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    #[instrument(skip(self))]
    async fn mark_critical_notified(
        &self,
        report_id: &str,
        at: OffsetDateTime,
    ) -> Result<bool, NotificationError> {
        let result = sqlx_core::query::query(
            r#"
            UPDATE reports SET critical_notified_at = $2
            WHERE id = $1 AND critical_notified_at IS NULL
            "#,
        )
        .bind(report_id)
        .bind(time_to_chrono(at))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn clear_critical_notified(&self, report_id: &str) -> Result<(), NotificationError> {
        sqlx_core::query::query("UPDATE reports SET critical_notified_at = NULL WHERE id = $1")
            .bind(report_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digits_strips_formatting() {
        assert_eq!(digits("+61 (412) 345-678"), "61412345678");
    }

    #[test]
    fn test_patient_from_columns() {
        let patient = PostgresPortalDirectory::patient_from((
            "p1".into(),
            "Jordan".into(),
            Some("0412345678".into()),
            false,
        ));
        assert_eq!(patient.patient_id, "p1");
        assert!(!patient.has_portal_account);
    }
}
