use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use time::OffsetDateTime;

/// Delivery priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Normal,
    High,
    Emergency,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Emergency => "emergency",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "normal" => Some(Priority::Normal),
            "high" => Some(Priority::High),
            "emergency" => Some(Priority::Emergency),
            _ => None,
        }
    }
}

/// Notification status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Pending,
    Scheduled,
    /// Claimed by exactly one worker while a dispatch is in progress
    InFlight,
    Sent,
    Delivered,
    Failed,
    /// Voided before dispatch, or suppressed by the consent gate
    Cancelled,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Pending => "pending",
            NotificationStatus::Scheduled => "scheduled",
            NotificationStatus::InFlight => "in_flight",
            NotificationStatus::Sent => "sent",
            NotificationStatus::Delivered => "delivered",
            NotificationStatus::Failed => "failed",
            NotificationStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(NotificationStatus::Pending),
            "scheduled" => Some(NotificationStatus::Scheduled),
            "in_flight" => Some(NotificationStatus::InFlight),
            "sent" => Some(NotificationStatus::Sent),
            "delivered" => Some(NotificationStatus::Delivered),
            "failed" => Some(NotificationStatus::Failed),
            "cancelled" => Some(NotificationStatus::Cancelled),
            _ => None,
        }
    }
}

/// One unit of outbound communication. Never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRequest {
    pub id: String,

    /// None for non-patient recipients (e.g. referring practitioners)
    pub patient_id: Option<String>,

    /// Destination as supplied by the caller; normalized at dispatch
    pub recipient_phone: String,

    pub template_type: String,

    pub variables: HashMap<String, String>,

    pub priority: Priority,

    pub status: NotificationStatus,

    /// Set only while status = scheduled
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub scheduled_at: Option<OffsetDateTime>,

    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,

    #[serde(with = "time::serde::rfc3339::option", default)]
    pub sent_at: Option<OffsetDateTime>,

    #[serde(with = "time::serde::rfc3339::option", default)]
    pub delivered_at: Option<OffsetDateTime>,

    /// Lease timestamp while status = in_flight
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub claimed_at: Option<OffsetDateTime>,

    pub retry_count: u32,

    /// Provider message id returned on a successful send
    pub provider_correlation_id: Option<String>,

    pub last_error: Option<String>,
}

impl NotificationRequest {
    /// Build a pending request from a submission.
    pub fn from_new(id: String, new: NewNotification, now: OffsetDateTime) -> Self {
        Self {
            id,
            patient_id: new.patient_id,
            recipient_phone: new.recipient_phone,
            template_type: new.template_type,
            variables: new.variables,
            priority: new.priority,
            status: NotificationStatus::Pending,
            scheduled_at: None,
            created_at: now,
            sent_at: None,
            delivered_at: None,
            claimed_at: None,
            retry_count: 0,
            provider_correlation_id: None,
            last_error: None,
        }
    }

    /// Token sent to the provider for idempotency. Unique per request and attempt.
    pub fn correlation_string(&self) -> String {
        format!("{}-{}", self.id, self.retry_count)
    }
}

/// Submission accepted by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewNotification {
    pub patient_id: Option<String>,
    pub recipient_phone: String,
    pub template_type: String,
    #[serde(default)]
    pub variables: HashMap<String, String>,
    pub priority: Priority,
    /// Earliest send time; reminders use this to land in the future
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub not_before: Option<OffsetDateTime>,
}

impl NewNotification {
    pub fn new(recipient_phone: impl Into<String>, template_type: impl Into<String>) -> Self {
        Self {
            patient_id: None,
            recipient_phone: recipient_phone.into(),
            template_type: template_type.into(),
            variables: HashMap::new(),
            priority: Priority::Normal,
            not_before: None,
        }
    }

    pub fn for_patient(mut self, patient_id: impl Into<String>) -> Self {
        self.patient_id = Some(patient_id.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    pub fn not_before(mut self, at: OffsetDateTime) -> Self {
        self.not_before = Some(at);
        self
    }
}

/// Unit of opt-in/opt-out granularity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentCategory {
    ReportReady,
    Appointment,
    GeneralInformation,
    Emergency,
}

/// Per-patient SMS preferences
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsentPreference {
    pub patient_id: String,
    pub report_ready_notifications: bool,
    pub appointment_notifications: bool,
    pub general_information_notifications: bool,
    pub emergency_notifications: bool,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub opted_out_at: Option<OffsetDateTime>,
    pub opt_out_reason: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl ConsentPreference {
    pub fn is_opted_out(&self) -> bool {
        self.opted_out_at.is_some()
    }

    pub fn allows(&self, category: ConsentCategory) -> bool {
        match category {
            ConsentCategory::ReportReady => self.report_ready_notifications,
            ConsentCategory::Appointment => self.appointment_notifications,
            ConsentCategory::GeneralInformation => self.general_information_notifications,
            ConsentCategory::Emergency => self.emergency_notifications,
        }
    }

    /// Apply a partial update. A global opt-out keeps every flag false.
    pub fn apply(&mut self, update: &ConsentUpdate) {
        if let Some(v) = update.report_ready_notifications {
            self.report_ready_notifications = v;
        }
        if let Some(v) = update.appointment_notifications {
            self.appointment_notifications = v;
        }
        if let Some(v) = update.general_information_notifications {
            self.general_information_notifications = v;
        }
        if let Some(v) = update.emergency_notifications {
            self.emergency_notifications = v;
        }
        if self.is_opted_out() {
            self.clear_flags();
        }
    }

    pub(crate) fn clear_flags(&mut self) {
        self.report_ready_notifications = false;
        self.appointment_notifications = false;
        self.general_information_notifications = false;
        self.emergency_notifications = false;
    }
}

/// Partial preference update
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsentUpdate {
    #[serde(default)]
    pub report_ready_notifications: Option<bool>,
    #[serde(default)]
    pub appointment_notifications: Option<bool>,
    #[serde(default)]
    pub general_information_notifications: Option<bool>,
    #[serde(default)]
    pub emergency_notifications: Option<bool>,
}

/// Audit record written whenever a patient opts out
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptOutRecord {
    pub patient_id: String,
    pub phone: Option<String>,
    pub reason: String,
    pub keyword: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

/// Kind of audit entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryEvent {
    Created,
    ConsentAllowed,
    ConsentDenied,
    Deferred,
    DispatchAttempt,
    Sent,
    Failed,
    Delivered,
    DeliveryFailed,
    RetryAttempt,
    RetryExhausted,
    LeaseReleased,
    Cancelled,
}

impl DeliveryEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryEvent::Created => "created",
            DeliveryEvent::ConsentAllowed => "consent_allowed",
            DeliveryEvent::ConsentDenied => "consent_denied",
            DeliveryEvent::Deferred => "deferred",
            DeliveryEvent::DispatchAttempt => "dispatch_attempt",
            DeliveryEvent::Sent => "sent",
            DeliveryEvent::Failed => "failed",
            DeliveryEvent::Delivered => "delivered",
            DeliveryEvent::DeliveryFailed => "delivery_failed",
            DeliveryEvent::RetryAttempt => "retry_attempt",
            DeliveryEvent::RetryExhausted => "retry_exhausted",
            DeliveryEvent::LeaseReleased => "lease_released",
            DeliveryEvent::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(DeliveryEvent::Created),
            "consent_allowed" => Some(DeliveryEvent::ConsentAllowed),
            "consent_denied" => Some(DeliveryEvent::ConsentDenied),
            "deferred" => Some(DeliveryEvent::Deferred),
            "dispatch_attempt" => Some(DeliveryEvent::DispatchAttempt),
            "sent" => Some(DeliveryEvent::Sent),
            "failed" => Some(DeliveryEvent::Failed),
            "delivered" => Some(DeliveryEvent::Delivered),
            "delivery_failed" => Some(DeliveryEvent::DeliveryFailed),
            "retry_attempt" => Some(DeliveryEvent::RetryAttempt),
            "retry_exhausted" => Some(DeliveryEvent::RetryExhausted),
            "lease_released" => Some(DeliveryEvent::LeaseReleased),
            "cancelled" => Some(DeliveryEvent::Cancelled),
            _ => None,
        }
    }
}

/// Append-only audit record tied to a notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryLogEntry {
    pub id: String,
    pub notification_id: String,
    pub event: DeliveryEvent,
    pub detail: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

impl DeliveryLogEntry {
    pub fn new(
        notification_id: &str,
        event: DeliveryEvent,
        detail: Option<String>,
        recorded_at: OffsetDateTime,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            notification_id: notification_id.to_string(),
            event,
            detail,
            recorded_at,
        }
    }
}

/// Result of pushing a request through the pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SendOutcome {
    Sent {
        notification_id: String,
        provider_correlation_id: String,
    },
    Scheduled {
        notification_id: String,
        #[serde(with = "time::serde::rfc3339")]
        at: OffsetDateTime,
    },
    ConsentDenied {
        notification_id: String,
    },
    Failed {
        notification_id: String,
        error: String,
    },
}

impl SendOutcome {
    pub fn notification_id(&self) -> &str {
        match self {
            SendOutcome::Sent {
                notification_id, ..
            }
            | SendOutcome::Scheduled {
                notification_id, ..
            }
            | SendOutcome::ConsentDenied { notification_id }
            | SendOutcome::Failed {
                notification_id, ..
            } => notification_id,
        }
    }
}

/// Notification statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotificationStats {
    pub pending: u32,
    pub scheduled: u32,
    pub in_flight: u32,
    pub sent: u32,
    pub delivered: u32,
    pub failed: u32,
    pub cancelled: u32,
}

impl NotificationStats {
    pub fn record(&mut self, status: NotificationStatus) {
        self.add(status, 1);
    }

    pub fn add(&mut self, status: NotificationStatus, count: u32) {
        let slot = match status {
            NotificationStatus::Pending => &mut self.pending,
            NotificationStatus::Scheduled => &mut self.scheduled,
            NotificationStatus::InFlight => &mut self.in_flight,
            NotificationStatus::Sent => &mut self.sent,
            NotificationStatus::Delivered => &mut self.delivered,
            NotificationStatus::Failed => &mut self.failed,
            NotificationStatus::Cancelled => &mut self.cancelled,
        };
        *slot += count;
    }
}
