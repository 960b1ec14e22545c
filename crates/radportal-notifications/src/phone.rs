//! Destination number normalization to E.164.

use crate::config::GatewayConfig;
use crate::error::NotificationError;

const MIN_E164_DIGITS: usize = 8;
const MAX_E164_DIGITS: usize = 15;

/// Normalize a local or international number to `+<country><subscriber>`.
///
/// Accepted forms, for country code 61 / trunk prefix 0 / 9 subscriber digits:
/// `+61 412 345 678`, `0061412345678`, `61412345678`, `0412 345 678`, `412345678`.
pub fn normalize(raw: &str, config: &GatewayConfig) -> Result<String, NotificationError> {
    let trimmed = raw.trim();
    let digits: String = trimmed.chars().filter(|c| c.is_ascii_digit()).collect();
    let invalid = || NotificationError::InvalidRecipient(raw.to_string());

    if digits.is_empty() {
        return Err(invalid());
    }

    let international = if trimmed.starts_with('+') {
        Some(digits.as_str())
    } else {
        digits.strip_prefix("00")
    };
    if let Some(number) = international {
        if (MIN_E164_DIGITS..=MAX_E164_DIGITS).contains(&number.len()) && !number.starts_with('0')
        {
            return Ok(format!("+{number}"));
        }
        return Err(invalid());
    }

    let country = config.country_code.as_str();
    let trunk = config.trunk_prefix.as_str();
    let subscriber = config.subscriber_digits;

    if digits.starts_with(country) && digits.len() == country.len() + subscriber {
        return Ok(format!("+{digits}"));
    }
    if !trunk.is_empty()
        && digits.len() == trunk.len() + subscriber
        && let Some(local) = digits.strip_prefix(trunk)
    {
        return Ok(format!("+{country}{local}"));
    }
    if digits.len() == subscriber && (trunk.is_empty() || !digits.starts_with(trunk)) {
        return Ok(format!("+{country}{digits}"));
    }

    Err(invalid())
}

/// Forms a stored patient number may take for the given E.164 number.
pub fn candidate_forms(e164: &str, config: &GatewayConfig) -> Vec<String> {
    let digits: String = e164.chars().filter(|c| c.is_ascii_digit()).collect();
    let mut forms = vec![e164.to_string(), digits.clone()];
    if let Some(local) = digits.strip_prefix(config.country_code.as_str()) {
        forms.push(format!("{}{local}", config.trunk_prefix));
        forms.push(local.to_string());
    }
    forms.dedup();
    forms
}
