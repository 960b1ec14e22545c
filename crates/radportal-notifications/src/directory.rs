//! Read access to the portal's domain records.
//!
//! The orchestrator receives only an event name and an entity id, then loads
//! the current state through [`PortalDirectory`] so it never acts on a stale
//! payload.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::NotificationError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatientContact {
    pub patient_id: String,
    pub display_name: String,
    pub mobile_phone: Option<String>,
    /// Whether the patient has portal credentials
    pub has_portal_account: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReportStatus {
    Draft,
    Preliminary,
    Final,
    Cancelled,
}

impl ReportStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "DRAFT" => Some(ReportStatus::Draft),
            "PRELIMINARY" => Some(ReportStatus::Preliminary),
            "FINAL" => Some(ReportStatus::Final),
            "CANCELLED" => Some(ReportStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportContext {
    pub report_id: String,
    pub patient: PatientContact,
    /// DICOM modality code or free-text modality name
    pub modality: String,
    pub study_description: String,
    pub status: ReportStatus,
    pub is_critical: bool,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub critical_notified_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppointmentContext {
    pub appointment_id: String,
    pub patient: PatientContact,
    #[serde(with = "time::serde::rfc3339")]
    pub starts_at: OffsetDateTime,
    pub procedure: String,
    pub location: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudyContext {
    pub study_id: String,
    pub patient: PatientContact,
    pub modality: String,
    pub study_description: String,
}

#[async_trait]
pub trait PortalDirectory: Send + Sync {
    async fn report(&self, report_id: &str) -> Result<Option<ReportContext>, NotificationError>;

    async fn appointment(
        &self,
        appointment_id: &str,
    ) -> Result<Option<AppointmentContext>, NotificationError>;

    async fn study(&self, study_id: &str) -> Result<Option<StudyContext>, NotificationError>;

    async fn patient(&self, patient_id: &str)
    -> Result<Option<PatientContact>, NotificationError>;

    /// Patients whose mobile matches any of the given phone forms
    async fn patients_by_phone(
        &self,
        candidates: &[String],
    ) -> Result<Vec<String>, NotificationError>;

    /// Set critical_notified_at if still unset. Returns true only for the caller that set it.
    async fn mark_critical_notified(
        &self,
        report_id: &str,
        at: OffsetDateTime,
    ) -> Result<bool, NotificationError>;

    /// Undo `mark_critical_notified` when the alert could not be submitted.
    async fn clear_critical_notified(&self, report_id: &str) -> Result<(), NotificationError>;
}

/// In-memory directory for development and tests
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    patients: DashMap<String, PatientContact>,
    reports: DashMap<String, ReportContext>,
    appointments: DashMap<String, AppointmentContext>,
    studies: DashMap<String, StudyContext>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_patient(&self, patient: PatientContact) {
        self.patients.insert(patient.patient_id.clone(), patient);
    }

    pub fn add_report(&self, report: ReportContext) {
        self.add_patient(report.patient.clone());
        self.reports.insert(report.report_id.clone(), report);
    }

    pub fn add_appointment(&self, appointment: AppointmentContext) {
        self.add_patient(appointment.patient.clone());
        self.appointments
            .insert(appointment.appointment_id.clone(), appointment);
    }

    pub fn add_study(&self, study: StudyContext) {
        self.add_patient(study.patient.clone());
        self.studies.insert(study.study_id.clone(), study);
    }

    pub fn set_report_status(&self, report_id: &str, status: ReportStatus) {
        if let Some(mut report) = self.reports.get_mut(report_id) {
            report.status = status;
        }
    }
}

fn digits(s: &str) -> String {
    s.chars().filter(|c| c.is_ascii_digit()).collect()
}

#[async_trait]
impl PortalDirectory for InMemoryDirectory {
    async fn report(&self, report_id: &str) -> Result<Option<ReportContext>, NotificationError> {
        Ok(self.reports.get(report_id).map(|r| r.clone()))
    }

    async fn appointment(
        &self,
        appointment_id: &str,
    ) -> Result<Option<AppointmentContext>, NotificationError> {
        Ok(self.appointments.get(appointment_id).map(|a| a.clone()))
    }

    async fn study(&self, study_id: &str) -> Result<Option<StudyContext>, NotificationError> {
        Ok(self.studies.get(study_id).map(|s| s.clone()))
    }

    async fn patient(
        &self,
        patient_id: &str,
    ) -> Result<Option<PatientContact>, NotificationError> {
        Ok(self.patients.get(patient_id).map(|p| p.clone()))
    }

    async fn patients_by_phone(
        &self,
        candidates: &[String],
    ) -> Result<Vec<String>, NotificationError> {
        let wanted: Vec<String> = candidates.iter().map(|c| digits(c)).collect();
        let mut ids: Vec<String> = self
            .patients
            .iter()
            .filter(|p| {
                p.mobile_phone
                    .as_deref()
                    .map(|m| wanted.contains(&digits(m)))
                    .unwrap_or(false)
            })
            .map(|p| p.patient_id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn mark_critical_notified(
        &self,
        report_id: &str,
        at: OffsetDateTime,
    ) -> Result<bool, NotificationError> {
        let mut report = self
            .reports
            .get_mut(report_id)
            .ok_or_else(|| NotificationError::NotFound(format!("report {report_id}")))?;
        if report.critical_notified_at.is_some() {
            return Ok(false);
        }
        report.critical_notified_at = Some(at);
        Ok(true)
    }

    async fn clear_critical_notified(&self, report_id: &str) -> Result<(), NotificationError> {
        if let Some(mut report) = self.reports.get_mut(report_id) {
            report.critical_notified_at = None;
        }
        Ok(())
    }
}
