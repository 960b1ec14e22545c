//! Per-patient, per-category SMS consent.

use std::sync::Arc;

use time::Duration;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::{ConsentConfig, EngineConfig, GatewayConfig};
use crate::directory::PortalDirectory;
use crate::error::NotificationError;
use crate::phone;
use crate::store::ConsentStore;
use crate::templates::TemplateRenderer;
use crate::types::{ConsentCategory, ConsentPreference, ConsentUpdate, OptOutRecord};

pub struct ConsentGate {
    store: Arc<dyn ConsentStore>,
    directory: Arc<dyn PortalDirectory>,
    templates: Arc<TemplateRenderer>,
    clock: Arc<dyn Clock>,
    config: ConsentConfig,
    gateway: GatewayConfig,
}

/// Pure consent decision.
///
/// A global opt-out denies everything unless the category is emergency and
/// the emergency bypass is configured.
pub fn decide(preference: &ConsentPreference, category: ConsentCategory, bypass: bool) -> bool {
    if preference.is_opted_out() {
        return category == ConsentCategory::Emergency && bypass;
    }
    preference.allows(category)
}

impl ConsentGate {
    pub fn new(
        store: Arc<dyn ConsentStore>,
        directory: Arc<dyn PortalDirectory>,
        templates: Arc<TemplateRenderer>,
        clock: Arc<dyn Clock>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            directory,
            templates,
            clock,
            config: config.consent.clone(),
            gateway: config.gateway.clone(),
        }
    }

    /// Whether a message of this template may be sent to the patient.
    ///
    /// Recipients without a patient id have no preference record and are allowed.
    pub async fn can_send(
        &self,
        patient_id: Option<&str>,
        template_type: &str,
    ) -> Result<bool, NotificationError> {
        let category = self.templates.category(template_type)?;

        let Some(patient_id) = patient_id else {
            return Ok(true);
        };

        let preference = self.get_preferences(patient_id).await?;
        let allowed = decide(
            &preference,
            category,
            self.config.emergency_bypass_opt_out,
        );
        debug!(
            patient_id = %patient_id,
            template = %template_type,
            ?category,
            allowed,
            "Consent decision"
        );
        Ok(allowed)
    }

    /// Load preferences, creating the default record on first access.
    pub async fn get_preferences(
        &self,
        patient_id: &str,
    ) -> Result<ConsentPreference, NotificationError> {
        if let Some(existing) = self.store.get_preference(patient_id).await? {
            return Ok(existing);
        }

        let preference = ConsentPreference {
            patient_id: patient_id.to_string(),
            report_ready_notifications: self.config.default_report_ready,
            appointment_notifications: self.config.default_appointment,
            general_information_notifications: self.config.default_general_information,
            emergency_notifications: self.config.default_emergency,
            opted_out_at: None,
            opt_out_reason: None,
            updated_at: self.clock.now(),
        };
        self.store.upsert_preference(&preference).await?;
        debug!(patient_id = %patient_id, "Created default consent preferences");
        Ok(preference)
    }

    pub async fn update_preferences(
        &self,
        patient_id: &str,
        update: &ConsentUpdate,
    ) -> Result<ConsentPreference, NotificationError> {
        let mut preference = self.get_preferences(patient_id).await?;
        preference.apply(update);
        preference.updated_at = self.clock.now();
        self.store.upsert_preference(&preference).await?;
        info!(patient_id = %patient_id, "Consent preferences updated");
        Ok(preference)
    }

    pub async fn opt_out_completely(
        &self,
        patient_id: &str,
        reason: &str,
    ) -> Result<ConsentPreference, NotificationError> {
        self.opt_out(patient_id, reason, None, None).await
    }

    /// Clear a global opt-out and restore the configured defaults.
    pub async fn resubscribe(
        &self,
        patient_id: &str,
    ) -> Result<ConsentPreference, NotificationError> {
        let mut preference = self.get_preferences(patient_id).await?;
        preference.opted_out_at = None;
        preference.opt_out_reason = None;
        preference.report_ready_notifications = self.config.default_report_ready;
        preference.appointment_notifications = self.config.default_appointment;
        preference.general_information_notifications = self.config.default_general_information;
        preference.emergency_notifications = self.config.default_emergency;
        preference.updated_at = self.clock.now();
        self.store.upsert_preference(&preference).await?;
        info!(patient_id = %patient_id, "Patient resubscribed to SMS");
        Ok(preference)
    }

    /// Interpret an inbound SMS reply. Returns the ids of patients opted out,
    /// empty when the text is not an opt-out keyword or the number is unknown.
    pub async fn process_opt_out_keyword(
        &self,
        from_phone: &str,
        message_text: &str,
    ) -> Result<Vec<String>, NotificationError> {
        let Some(keyword) = self.match_keyword(message_text) else {
            debug!("Inbound SMS is not an opt-out keyword");
            return Ok(Vec::new());
        };

        let e164 = match phone::normalize(from_phone, &self.gateway) {
            Ok(number) => number,
            Err(e) => {
                warn!(error = %e, "Opt-out keyword from unrecognized number");
                return Ok(Vec::new());
            }
        };

        let candidates = phone::candidate_forms(&e164, &self.gateway);
        let patients = self.directory.patients_by_phone(&candidates).await?;
        if patients.is_empty() {
            warn!(keyword = %keyword, "Opt-out keyword from number with no matching patient");
            return Ok(Vec::new());
        }

        let reason = format!("SMS keyword {keyword}");
        for patient_id in &patients {
            self.opt_out(patient_id, &reason, Some(&e164), Some(&keyword))
                .await?;
        }
        Ok(patients)
    }

    /// Remove opt-out audit records past the retention window.
    pub async fn purge_opt_out_audit(&self) -> Result<u64, NotificationError> {
        let cutoff =
            self.clock.now() - Duration::days(i64::from(self.config.opt_out_audit_retention_days));
        let removed = self.store.purge_opt_out_records(cutoff).await?;
        if removed > 0 {
            info!(removed, "Purged expired opt-out audit records");
        }
        Ok(removed)
    }

    fn match_keyword(&self, message_text: &str) -> Option<String> {
        let first = message_text.split_whitespace().next()?;
        let word: String = first
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_uppercase();
        self.config
            .opt_out_keywords
            .iter()
            .find(|k| k.eq_ignore_ascii_case(&word))
            .map(|k| k.to_ascii_uppercase())
    }

    async fn opt_out(
        &self,
        patient_id: &str,
        reason: &str,
        phone: Option<&str>,
        keyword: Option<&str>,
    ) -> Result<ConsentPreference, NotificationError> {
        let now = self.clock.now();
        let mut preference = self.get_preferences(patient_id).await?;
        preference.opted_out_at = Some(now);
        preference.opt_out_reason = Some(reason.to_string());
        preference.clear_flags();
        preference.updated_at = now;
        self.store.upsert_preference(&preference).await?;

        self.store
            .record_opt_out(&OptOutRecord {
                patient_id: patient_id.to_string(),
                phone: phone.map(str::to_string),
                reason: reason.to_string(),
                keyword: keyword.map(str::to_string),
                recorded_at: now,
            })
            .await?;

        info!(patient_id = %patient_id, reason = %reason, "Patient opted out of SMS");
        Ok(preference)
    }
}
