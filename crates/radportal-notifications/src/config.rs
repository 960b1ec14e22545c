//! Engine configuration.
//!
//! Every field has a default so a deployment only overrides what differs.
//! Call [`EngineConfig::validate`] once at startup.

use serde::{Deserialize, Serialize};
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{Time, UtcOffset};

const CLOCK_FORMAT: &[BorrowedFormatItem<'static>] = format_description!("[hour]:[minute]");
const OFFSET_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[offset_hour sign:mandatory]:[offset_minute]");

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub business_hours: BusinessHoursConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub consent: ConsentConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub automation: AutomationConfig,
    #[serde(default)]
    pub processor: ProcessorConfig,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), String> {
        let bh = &self.business_hours;
        bh.offset()?;
        let (open, close) = bh.weekday_window()?;
        if open >= close {
            return Err("business_hours.weekday_open must be before weekday_close".into());
        }
        let (open, close) = bh.saturday_window()?;
        if open >= close {
            return Err("business_hours.saturday_open must be before saturday_close".into());
        }

        if self.retry.max_retries == 0 {
            return Err("retry.max_retries must be > 0".into());
        }
        if self.retry.batch_size == 0 {
            return Err("retry.batch_size must be > 0".into());
        }
        if self.retry.window_hours == 0 {
            return Err("retry.window_hours must be > 0".into());
        }
        if self.retry.interval_secs == 0 {
            return Err("retry.interval_secs must be > 0".into());
        }

        if self.consent.opt_out_keywords.is_empty() {
            return Err("consent.opt_out_keywords must not be empty".into());
        }

        let gw = &self.gateway;
        if gw.timeout_ms == 0 {
            return Err("gateway.timeout_ms must be > 0".into());
        }
        if self.retry.lease_timeout_secs.saturating_mul(1000) <= gw.timeout_ms {
            return Err("retry.lease_timeout_secs must exceed gateway.timeout_ms".into());
        }
        if gw.max_body_chars == 0 {
            return Err("gateway.max_body_chars must be > 0".into());
        }
        if gw.country_code.is_empty() || !gw.country_code.chars().all(|c| c.is_ascii_digit()) {
            return Err("gateway.country_code must be digits".into());
        }
        if !gw.trunk_prefix.chars().all(|c| c.is_ascii_digit()) {
            return Err("gateway.trunk_prefix must be digits".into());
        }
        if gw.subscriber_digits == 0 || gw.country_code.len() + gw.subscriber_digits > 15 {
            return Err("gateway.subscriber_digits must fit an E.164 number".into());
        }
        if gw.sender_id.is_empty() {
            return Err("gateway.sender_id must not be empty".into());
        }

        if self.automation.reminder_offsets_hours.iter().any(|h| *h == 0) {
            return Err("automation.reminder_offsets_hours must be > 0".into());
        }

        if self.processor.poll_interval_secs == 0 || self.processor.scheduled_batch_size == 0 {
            return Err("processor.poll_interval_secs and scheduled_batch_size must be > 0".into());
        }
        Ok(())
    }
}

/// Facility-local sending windows. Sunday is always closed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusinessHoursConfig {
    /// Fixed facility offset, e.g. "+10:00"
    #[serde(default = "default_utc_offset")]
    pub utc_offset: String,
    #[serde(default = "default_weekday_open")]
    pub weekday_open: String,
    #[serde(default = "default_weekday_close")]
    pub weekday_close: String,
    #[serde(default = "default_saturday_open")]
    pub saturday_open: String,
    #[serde(default = "default_saturday_close")]
    pub saturday_close: String,
}

fn default_utc_offset() -> String {
    "+10:00".into()
}
fn default_weekday_open() -> String {
    "07:00".into()
}
fn default_weekday_close() -> String {
    "19:00".into()
}
fn default_saturday_open() -> String {
    "08:00".into()
}
fn default_saturday_close() -> String {
    "16:00".into()
}

impl Default for BusinessHoursConfig {
    fn default() -> Self {
        Self {
            utc_offset: default_utc_offset(),
            weekday_open: default_weekday_open(),
            weekday_close: default_weekday_close(),
            saturday_open: default_saturday_open(),
            saturday_close: default_saturday_close(),
        }
    }
}

impl BusinessHoursConfig {
    pub fn offset(&self) -> Result<UtcOffset, String> {
        UtcOffset::parse(&self.utc_offset, OFFSET_FORMAT)
            .map_err(|e| format!("business_hours.utc_offset '{}': {e}", self.utc_offset))
    }

    pub fn weekday_window(&self) -> Result<(Time, Time), String> {
        Ok((
            parse_clock("weekday_open", &self.weekday_open)?,
            parse_clock("weekday_close", &self.weekday_close)?,
        ))
    }

    pub fn saturday_window(&self) -> Result<(Time, Time), String> {
        Ok((
            parse_clock("saturday_open", &self.saturday_open)?,
            parse_clock("saturday_close", &self.saturday_close)?,
        ))
    }
}

fn parse_clock(field: &str, value: &str) -> Result<Time, String> {
    Time::parse(value, CLOCK_FORMAT).map_err(|e| format!("business_hours.{field} '{value}': {e}"))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retry budget per request
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Failures older than this are never retried
    #[serde(default = "default_window_hours")]
    pub window_hours: u32,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default = "default_retry_interval")]
    pub interval_secs: u64,
    /// In-flight leases older than this are released
    #[serde(default = "default_lease_timeout")]
    pub lease_timeout_secs: u64,
}

fn default_max_retries() -> u32 {
    3
}
fn default_window_hours() -> u32 {
    24
}
fn default_batch_size() -> u32 {
    50
}
fn default_retry_interval() -> u64 {
    60
}
fn default_lease_timeout() -> u64 {
    300
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            window_hours: default_window_hours(),
            batch_size: default_batch_size(),
            interval_secs: default_retry_interval(),
            lease_timeout_secs: default_lease_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsentConfig {
    /// Let emergency messages through a global opt-out
    #[serde(default)]
    pub emergency_bypass_opt_out: bool,
    #[serde(default = "default_true")]
    pub default_report_ready: bool,
    #[serde(default = "default_true")]
    pub default_appointment: bool,
    #[serde(default = "default_true")]
    pub default_general_information: bool,
    #[serde(default = "default_true")]
    pub default_emergency: bool,
    /// Inbound replies treated as a global opt-out (case-insensitive)
    #[serde(default = "default_opt_out_keywords")]
    pub opt_out_keywords: Vec<String>,
    #[serde(default = "default_opt_out_retention_days")]
    pub opt_out_audit_retention_days: u32,
}

fn default_true() -> bool {
    true
}

fn default_opt_out_keywords() -> Vec<String> {
    ["STOP", "STOPALL", "UNSUBSCRIBE", "CANCEL", "END", "QUIT", "OPTOUT"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_opt_out_retention_days() -> u32 {
    365
}

impl Default for ConsentConfig {
    fn default() -> Self {
        Self {
            emergency_bypass_opt_out: false,
            default_report_ready: true,
            default_appointment: true,
            default_general_information: true,
            default_emergency: true,
            opt_out_keywords: default_opt_out_keywords(),
            opt_out_audit_retention_days: default_opt_out_retention_days(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Provider send endpoint; the logging gateway is used when unset
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    /// HMAC-SHA256 key for the X-Signature-256 header
    #[serde(default)]
    pub signing_secret: Option<String>,
    #[serde(default = "default_sender_id")]
    pub sender_id: String,
    #[serde(default)]
    pub status_callback_url: Option<String>,
    #[serde(default = "default_gateway_timeout")]
    pub timeout_ms: u64,
    /// Four concatenated GSM-7 segments
    #[serde(default = "default_max_body_chars")]
    pub max_body_chars: usize,
    #[serde(default = "default_country_code")]
    pub country_code: String,
    #[serde(default = "default_trunk_prefix")]
    pub trunk_prefix: String,
    #[serde(default = "default_subscriber_digits")]
    pub subscriber_digits: usize,
}

fn default_sender_id() -> String {
    "RadPortal".into()
}
fn default_gateway_timeout() -> u64 {
    10_000
}
fn default_max_body_chars() -> usize {
    612
}
fn default_country_code() -> String {
    "61".into()
}
fn default_trunk_prefix() -> String {
    "0".into()
}
fn default_subscriber_digits() -> usize {
    9
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            signing_secret: None,
            sender_id: default_sender_id(),
            status_callback_url: None,
            timeout_ms: default_gateway_timeout(),
            max_body_chars: default_max_body_chars(),
            country_code: default_country_code(),
            trunk_prefix: default_trunk_prefix(),
            subscriber_digits: default_subscriber_digits(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationConfig {
    /// Delay before the "discuss with your GP" reminder
    #[serde(default = "default_gp_followup_days")]
    pub gp_followup_days: u32,
    /// Appointment reminders, in hours before the appointment
    #[serde(default = "default_reminder_offsets")]
    pub reminder_offsets_hours: Vec<u32>,
    #[serde(default = "default_portal_url")]
    pub portal_url: String,
    #[serde(default = "default_facility_name")]
    pub facility_name: String,
    #[serde(default)]
    pub facility_phone: String,
}

fn default_gp_followup_days() -> u32 {
    3
}
fn default_reminder_offsets() -> Vec<u32> {
    vec![24, 2]
}
fn default_portal_url() -> String {
    "https://portal.example.com".into()
}
fn default_facility_name() -> String {
    "Radiology".into()
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            gp_followup_days: default_gp_followup_days(),
            reminder_offsets_hours: default_reminder_offsets(),
            portal_url: default_portal_url(),
            facility_name: default_facility_name(),
            facility_phone: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_batch_size")]
    pub scheduled_batch_size: u32,
}

fn default_poll_interval() -> u64 {
    30
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            scheduled_batch_size: default_batch_size(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.window_hours, 24);
        assert!(!config.consent.emergency_bypass_opt_out);
        assert_eq!(config.automation.reminder_offsets_hours, vec![24, 2]);
    }

    #[test]
    fn test_parse_offset_and_windows() {
        let config = BusinessHoursConfig::default();
        assert_eq!(config.offset().unwrap(), UtcOffset::from_hms(10, 0, 0).unwrap());
        let (open, close) = config.saturday_window().unwrap();
        assert_eq!(open, Time::from_hms(8, 0, 0).unwrap());
        assert_eq!(close, Time::from_hms(16, 0, 0).unwrap());
    }

    #[test]
    fn test_rejects_lease_shorter_than_send() {
        let mut config = EngineConfig::default();
        config.retry.lease_timeout_secs = 10;
        config.gateway.timeout_ms = 10_000;
        let err = config.validate().unwrap_err();
        assert!(err.contains("lease_timeout_secs"));

        config.gateway.timeout_ms = 9_999;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_inverted_window() {
        let mut config = EngineConfig::default();
        config.business_hours.weekday_open = "20:00".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_offset() {
        let mut config = EngineConfig::default();
        config.business_hours.utc_offset = "AEST".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_retry_budget() {
        let mut config = EngineConfig::default();
        config.retry.max_retries = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deserialize_partial() {
        let config: EngineConfig = serde_json::from_value(serde_json::json!({
            "consent": { "emergency_bypass_opt_out": true },
            "gateway": { "sender_id": "Imaging" }
        }))
        .unwrap();
        assert!(config.consent.emergency_bypass_opt_out);
        assert!(config.consent.default_report_ready);
        assert_eq!(config.gateway.sender_id, "Imaging");
        assert_eq!(config.gateway.country_code, "61");
    }
}
