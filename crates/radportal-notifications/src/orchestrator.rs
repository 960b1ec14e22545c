//! Business-event automations.
//!
//! Each trigger loads the current record through [`PortalDirectory`], picks a
//! template and submits through [`NotificationService`]. Scheduling, consent
//! and retries all happen downstream.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{Duration, OffsetDateTime, UtcOffset};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::{AutomationConfig, EngineConfig};
use crate::directory::{PatientContact, PortalDirectory, ReportContext, ReportStatus};
use crate::error::NotificationError;
use crate::service::NotificationService;
use crate::templates::ids;
use crate::types::{NewNotification, Priority, SendOutcome};

const APPOINTMENT_TIME_FORMAT: &[BorrowedFormatItem<'static>] = format_description!(
    "[weekday repr:short] [day padding:none] [month repr:short] [hour repr:12 padding:none]:[minute] [period case:lower]"
);

/// Domain event: event name plus the id of the entity it concerns
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "entityId", rename_all = "snake_case")]
pub enum DomainEvent {
    ReportStatusChanged(String),
    ReportCritical(String),
    AppointmentBooked(String),
    ScanCompleted(String),
    /// Entity id is the patient id
    RegistrationPending(String),
}

impl DomainEvent {
    pub fn parse(event: &str, entity_id: impl Into<String>) -> Option<Self> {
        let id = entity_id.into();
        match event {
            "report_status_changed" => Some(DomainEvent::ReportStatusChanged(id)),
            "report_critical" => Some(DomainEvent::ReportCritical(id)),
            "appointment_booked" => Some(DomainEvent::AppointmentBooked(id)),
            "scan_completed" => Some(DomainEvent::ScanCompleted(id)),
            "registration_pending" => Some(DomainEvent::RegistrationPending(id)),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DomainEvent::ReportStatusChanged(_) => "report_status_changed",
            DomainEvent::ReportCritical(_) => "report_critical",
            DomainEvent::AppointmentBooked(_) => "appointment_booked",
            DomainEvent::ScanCompleted(_) => "scan_completed",
            DomainEvent::RegistrationPending(_) => "registration_pending",
        }
    }

    pub fn entity_id(&self) -> &str {
        match self {
            DomainEvent::ReportStatusChanged(id)
            | DomainEvent::ReportCritical(id)
            | DomainEvent::AppointmentBooked(id)
            | DomainEvent::ScanCompleted(id)
            | DomainEvent::RegistrationPending(id) => id,
        }
    }
}

/// Modality-specific "report ready" template, general fallback
pub fn report_ready_template(modality: &str) -> &'static str {
    match modality.trim().to_ascii_uppercase().as_str() {
        "CR" | "DX" | "XR" | "X-RAY" | "XRAY" => ids::REPORT_READY_XRAY,
        "CT" => ids::REPORT_READY_CT,
        "US" | "ULTRASOUND" => ids::REPORT_READY_ULTRASOUND,
        "MR" | "MRI" => ids::REPORT_READY_MRI,
        "MG" | "MAMMO" | "MAMMOGRAM" | "MAMMOGRAPHY" => ids::REPORT_READY_MAMMOGRAM,
        _ => ids::REPORT_READY_GENERAL,
    }
}

pub struct AutomationOrchestrator {
    service: Arc<dyn NotificationService>,
    directory: Arc<dyn PortalDirectory>,
    clock: Arc<dyn Clock>,
    config: AutomationConfig,
    facility_offset: UtcOffset,
}

impl AutomationOrchestrator {
    pub fn new(
        service: Arc<dyn NotificationService>,
        directory: Arc<dyn PortalDirectory>,
        clock: Arc<dyn Clock>,
        config: &EngineConfig,
    ) -> Result<Self, NotificationError> {
        let facility_offset = config
            .business_hours
            .offset()
            .map_err(NotificationError::InvalidConfig)?;
        Ok(Self {
            service,
            directory,
            clock,
            config: config.automation.clone(),
            facility_offset,
        })
    }

    /// React to a domain event. Returns the outcome of every submitted notification.
    pub async fn handle(&self, event: &DomainEvent) -> Result<Vec<SendOutcome>, NotificationError> {
        debug!(event = event.name(), entity_id = %event.entity_id(), "Automation event");
        match event {
            DomainEvent::ReportStatusChanged(id) => self.on_report_status_changed(id).await,
            DomainEvent::ReportCritical(id) => {
                let report = self.load_report(id).await?;
                Ok(self.notify_critical(&report).await?.into_iter().collect())
            }
            DomainEvent::AppointmentBooked(id) => self.on_appointment_booked(id).await,
            DomainEvent::ScanCompleted(id) => self.on_scan_completed(id).await,
            DomainEvent::RegistrationPending(id) => self.on_registration_pending(id).await,
        }
    }

    async fn on_report_status_changed(
        &self,
        report_id: &str,
    ) -> Result<Vec<SendOutcome>, NotificationError> {
        let report = self.load_report(report_id).await?;
        let mut outcomes = Vec::new();

        if let Some(outcome) = self.notify_critical(&report).await? {
            outcomes.push(outcome);
        }

        let Some(base) = self.base_request(&report.patient) else {
            return Ok(outcomes);
        };
        let base = base.with_variable("study_description", &report.study_description);

        match report.status {
            ReportStatus::Final => {
                let template = report_ready_template(&report.modality);
                outcomes.push(self.submit(base.clone(), template, None).await?);

                let followup_at =
                    self.clock.now() + Duration::days(self.config.gp_followup_days as i64);
                outcomes.push(
                    self.submit(base, ids::GP_FOLLOWUP_REMINDER, Some(followup_at))
                        .await?,
                );
                info!(
                    report_id = %report.report_id,
                    template,
                    "Report ready notifications submitted"
                );
            }
            ReportStatus::Preliminary => {
                let request = base.with_priority(Priority::High);
                outcomes.push(self.submit(request, ids::REPORT_PRELIMINARY, None).await?);
            }
            status => {
                debug!(report_id = %report.report_id, ?status, "No automation for report status");
            }
        }
        Ok(outcomes)
    }

    /// Urgent contact request for a critical report, at most once per report
    async fn notify_critical(
        &self,
        report: &ReportContext,
    ) -> Result<Option<SendOutcome>, NotificationError> {
        if !report.is_critical || report.critical_notified_at.is_some() {
            return Ok(None);
        }
        let Some(base) = self.base_request(&report.patient) else {
            return Ok(None);
        };

        let now = self.clock.now();
        if !self
            .directory
            .mark_critical_notified(&report.report_id, now)
            .await?
        {
            debug!(report_id = %report.report_id, "Critical finding already notified");
            return Ok(None);
        }

        let request = base
            .with_priority(Priority::Emergency)
            .with_variable("study_description", &report.study_description);
        let outcome = match self.submit(request, ids::CRITICAL_FINDING, None).await {
            Ok(outcome) => outcome,
            Err(e) => {
                // Nothing was persisted; let the next trigger try again
                self.directory
                    .clear_critical_notified(&report.report_id)
                    .await?;
                return Err(e);
            }
        };
        warn!(
            report_id = %report.report_id,
            patient_id = %report.patient.patient_id,
            "Critical finding notification submitted"
        );
        Ok(Some(outcome))
    }

    async fn on_appointment_booked(
        &self,
        appointment_id: &str,
    ) -> Result<Vec<SendOutcome>, NotificationError> {
        let appointment = self
            .directory
            .appointment(appointment_id)
            .await?
            .ok_or_else(|| NotificationError::NotFound(format!("appointment {appointment_id}")))?;
        let Some(base) = self.base_request(&appointment.patient) else {
            return Ok(Vec::new());
        };

        let appointment_time = appointment
            .starts_at
            .to_offset(self.facility_offset)
            .format(APPOINTMENT_TIME_FORMAT)
            .map_err(|e| NotificationError::Internal(e.to_string()))?;
        let base = base
            .with_variable("procedure", &appointment.procedure)
            .with_variable("location", &appointment.location)
            .with_variable("appointment_time", appointment_time);

        let mut outcomes = vec![
            self.submit(base.clone(), ids::APPOINTMENT_CONFIRMATION, None)
                .await?,
        ];

        let now = self.clock.now();
        for hours in &self.config.reminder_offsets_hours {
            let remind_at = appointment.starts_at - Duration::hours(*hours as i64);
            if remind_at <= now {
                debug!(
                    appointment_id = %appointment.appointment_id,
                    offset_hours = hours,
                    "Reminder time already passed, skipping"
                );
                continue;
            }
            outcomes.push(
                self.submit(base.clone(), ids::APPOINTMENT_REMINDER, Some(remind_at))
                    .await?,
            );
        }
        Ok(outcomes)
    }

    async fn on_scan_completed(&self, study_id: &str) -> Result<Vec<SendOutcome>, NotificationError> {
        let study = self
            .directory
            .study(study_id)
            .await?
            .ok_or_else(|| NotificationError::NotFound(format!("study {study_id}")))?;
        let Some(base) = self.base_request(&study.patient) else {
            return Ok(Vec::new());
        };
        let base = base.with_variable("study_description", &study.study_description);

        let outcome = if study.patient.has_portal_account {
            self.submit(base, ids::SCAN_COMPLETE, None).await?
        } else {
            let registration_url = format!("{}/register", self.config.portal_url.trim_end_matches('/'));
            self.submit(
                base.with_variable("registration_url", registration_url),
                ids::SCAN_REGISTRATION_INVITE,
                None,
            )
            .await?
        };
        Ok(vec![outcome])
    }

    async fn on_registration_pending(
        &self,
        patient_id: &str,
    ) -> Result<Vec<SendOutcome>, NotificationError> {
        let patient = self
            .directory
            .patient(patient_id)
            .await?
            .ok_or_else(|| NotificationError::NotFound(format!("patient {patient_id}")))?;
        let Some(base) = self.base_request(&patient) else {
            return Ok(Vec::new());
        };
        Ok(vec![self.submit(base, ids::REGISTRATION_PENDING, None).await?])
    }

    async fn load_report(&self, report_id: &str) -> Result<ReportContext, NotificationError> {
        self.directory
            .report(report_id)
            .await?
            .ok_or_else(|| NotificationError::NotFound(format!("report {report_id}")))
    }

    /// Request skeleton with the shared bindings; `None` if the patient has no mobile.
    fn base_request(&self, patient: &PatientContact) -> Option<NewNotification> {
        let Some(phone) = patient.mobile_phone.as_deref().filter(|p| !p.trim().is_empty()) else {
            warn!(patient_id = %patient.patient_id, "Patient has no mobile number, skipping SMS");
            return None;
        };
        Some(
            NewNotification::new(phone, "")
                .for_patient(&patient.patient_id)
                .with_variable("patient_name", &patient.display_name)
                .with_variable("facility_name", &self.config.facility_name)
                .with_variable("facility_phone", &self.config.facility_phone)
                .with_variable("portal_url", &self.config.portal_url),
        )
    }

    async fn submit(
        &self,
        mut request: NewNotification,
        template: &str,
        not_before: Option<OffsetDateTime>,
    ) -> Result<SendOutcome, NotificationError> {
        request.template_type = template.to_string();
        if let Some(at) = not_before {
            request = request.not_before(at);
        }
        self.service.send(request).await
    }
}
