use std::collections::HashMap;

use tracing::warn;

use crate::error::NotificationError;
use crate::types::ConsentCategory;

/// Built-in template identifiers
pub mod ids {
    pub const REPORT_READY_XRAY: &str = "report_ready_xray";
    pub const REPORT_READY_CT: &str = "report_ready_ct";
    pub const REPORT_READY_ULTRASOUND: &str = "report_ready_ultrasound";
    pub const REPORT_READY_MRI: &str = "report_ready_mri";
    pub const REPORT_READY_MAMMOGRAM: &str = "report_ready_mammogram";
    pub const REPORT_READY_GENERAL: &str = "report_ready_general";
    pub const REPORT_PRELIMINARY: &str = "report_preliminary";
    pub const GP_FOLLOWUP_REMINDER: &str = "gp_followup_reminder";
    pub const CRITICAL_FINDING: &str = "critical_finding";
    pub const APPOINTMENT_CONFIRMATION: &str = "appointment_confirmation";
    pub const APPOINTMENT_REMINDER: &str = "appointment_reminder";
    pub const SCAN_REGISTRATION_INVITE: &str = "scan_registration_invite";
    pub const SCAN_COMPLETE: &str = "scan_complete";
    pub const REGISTRATION_PENDING: &str = "registration_pending";
}

/// Simple template renderer using {{variable}} syntax
pub struct TemplateRenderer {
    templates: HashMap<String, Template>,
}

#[derive(Debug, Clone)]
pub struct Template {
    pub id: String,
    pub category: ConsentCategory,
    pub body: String,
}

/// Rendered text plus the placeholders that had no binding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    pub body: String,
    pub missing: Vec<String>,
}

impl TemplateRenderer {
    pub fn new() -> Self {
        Self {
            templates: HashMap::new(),
        }
    }

    /// Renderer loaded with the portal's built-in SMS catalog.
    pub fn with_defaults() -> Self {
        use ConsentCategory::*;
        use ids::*;
        let mut renderer = Self::new();
        let catalog: [(&str, ConsentCategory, &str); 14] = [
            (
                REPORT_READY_XRAY,
                ReportReady,
                "Hi {{patient_name}}, your X-ray report from {{facility_name}} is ready. View it at {{portal_url}}",
            ),
            (
                REPORT_READY_CT,
                ReportReady,
                "Hi {{patient_name}}, your CT report from {{facility_name}} is ready. View it at {{portal_url}}",
            ),
            (
                REPORT_READY_ULTRASOUND,
                ReportReady,
                "Hi {{patient_name}}, your ultrasound report from {{facility_name}} is ready. View it at {{portal_url}}",
            ),
            (
                REPORT_READY_MRI,
                ReportReady,
                "Hi {{patient_name}}, your MRI report from {{facility_name}} is ready. View it at {{portal_url}}",
            ),
            (
                REPORT_READY_MAMMOGRAM,
                ReportReady,
                "Hi {{patient_name}}, your mammogram report from {{facility_name}} is ready. View it at {{portal_url}}",
            ),
            (
                REPORT_READY_GENERAL,
                ReportReady,
                "Hi {{patient_name}}, your {{study_description}} report from {{facility_name}} is ready. View it at {{portal_url}}",
            ),
            (
                REPORT_PRELIMINARY,
                ReportReady,
                "Hi {{patient_name}}, a preliminary result for your {{study_description}} is available at {{portal_url}}. The final report will follow.",
            ),
            (
                GP_FOLLOWUP_REMINDER,
                ReportReady,
                "Hi {{patient_name}}, a reminder to discuss your {{study_description}} results with your GP.",
            ),
            (
                CRITICAL_FINDING,
                Emergency,
                "URGENT: {{patient_name}}, please call {{facility_name}} on {{facility_phone}} as soon as possible about your recent {{study_description}}.",
            ),
            (
                APPOINTMENT_CONFIRMATION,
                Appointment,
                "Hi {{patient_name}}, your {{procedure}} at {{location}} is booked for {{appointment_time}}. Reply STOP to opt out.",
            ),
            (
                APPOINTMENT_REMINDER,
                Appointment,
                "Reminder: {{patient_name}}, your {{procedure}} at {{location}} is on {{appointment_time}}.",
            ),
            (
                SCAN_REGISTRATION_INVITE,
                GeneralInformation,
                "Hi {{patient_name}}, your scan at {{facility_name}} is complete. Register at {{registration_url}} to view your images and report.",
            ),
            (
                SCAN_COMPLETE,
                GeneralInformation,
                "Hi {{patient_name}}, your {{study_description}} is complete. Your report will appear at {{portal_url}} once finalised.",
            ),
            (
                REGISTRATION_PENDING,
                GeneralInformation,
                "Hi {{patient_name}}, thanks for registering with {{facility_name}}. Your portal account is being reviewed.",
            ),
        ];

        for (id, category, body) in catalog {
            renderer.register(Template {
                id: id.to_string(),
                category,
                body: body.to_string(),
            });
        }
        renderer
    }

    pub fn register(&mut self, template: Template) {
        self.templates.insert(template.id.clone(), template);
    }

    pub fn get(&self, template_id: &str) -> Option<&Template> {
        self.templates.get(template_id)
    }

    pub fn category(&self, template_id: &str) -> Result<ConsentCategory, NotificationError> {
        self.get(template_id)
            .map(|t| t.category)
            .ok_or_else(|| NotificationError::UnknownTemplate(template_id.to_string()))
    }

    /// Unbound placeholders stay verbatim and are reported, never fatal.
    pub fn render(
        &self,
        template_id: &str,
        data: &HashMap<String, String>,
    ) -> Result<RenderedMessage, NotificationError> {
        let template = self
            .templates
            .get(template_id)
            .ok_or_else(|| NotificationError::UnknownTemplate(template_id.to_string()))?;

        let rendered = render_string(&template.body, data);
        if !rendered.missing.is_empty() {
            warn!(
                template = %template_id,
                missing = ?rendered.missing,
                "Template rendered with unbound placeholders"
            );
        }
        Ok(rendered)
    }
}

impl Default for TemplateRenderer {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn render_string(template: &str, data: &HashMap<String, String>) -> RenderedMessage {
    let mut body = String::with_capacity(template.len());
    let mut missing = Vec::new();
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        body.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        let Some(end) = after_open.find("}}") else {
            // Unterminated: copy through as literal text
            body.push_str(&rest[start..]);
            rest = "";
            break;
        };

        let key = after_open[..end].trim();
        match data.get(key) {
            Some(value) => body.push_str(value),
            None => {
                body.push_str(&rest[start..start + 2 + end + 2]);
                if !missing.iter().any(|m| m == key) {
                    missing.push(key.to_string());
                }
            }
        }
        rest = &after_open[end + 2..];
    }
    body.push_str(rest);

    RenderedMessage { body, missing }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_render_template() {
        let mut renderer = TemplateRenderer::new();
        renderer.register(Template {
            id: "test".to_string(),
            category: ConsentCategory::Appointment,
            body: "Hello {{name}}, your appointment is on {{date}}".to_string(),
        });

        let data = vars(&[("name", "John"), ("date", "2024-01-15")]);
        let result = renderer.render("test", &data).unwrap();
        assert_eq!(result.body, "Hello John, your appointment is on 2024-01-15");
        assert!(result.missing.is_empty());
    }

    #[test]
    fn test_missing_variable_left_verbatim() {
        let mut renderer = TemplateRenderer::new();
        renderer.register(Template {
            id: "test".to_string(),
            category: ConsentCategory::GeneralInformation,
            body: "Hi {{name}}, see {{ url }} and {{url}}".to_string(),
        });

        let result = renderer.render("test", &vars(&[("name", "Ana")])).unwrap();
        assert_eq!(result.body, "Hi Ana, see {{ url }} and {{url}}");
        assert_eq!(result.missing, vec!["url".to_string()]);
    }

    #[test]
    fn test_repeated_and_unterminated_placeholders() {
        let data = vars(&[("a", "1")]);
        let result = render_string("{{a}}{{a}} then {{b", &data);
        assert_eq!(result.body, "11 then {{b");
        assert!(result.missing.is_empty());
    }

    #[test]
    fn test_render_is_idempotent() {
        let renderer = TemplateRenderer::with_defaults();
        let data = vars(&[("patient_name", "Sam"), ("portal_url", "https://p")]);
        let first = renderer.render(ids::REPORT_READY_CT, &data).unwrap();
        let second = renderer.render(ids::REPORT_READY_CT, &data).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_template_not_found() {
        let renderer = TemplateRenderer::new();
        let result = renderer.render("nonexistent", &HashMap::new());
        assert!(matches!(
            result,
            Err(NotificationError::UnknownTemplate(_))
        ));
    }

    #[test]
    fn test_catalog_categories() {
        let renderer = TemplateRenderer::with_defaults();
        assert_eq!(
            renderer.category(ids::CRITICAL_FINDING).unwrap(),
            ConsentCategory::Emergency
        );
        assert_eq!(
            renderer.category(ids::APPOINTMENT_REMINDER).unwrap(),
            ConsentCategory::Appointment
        );
        assert_eq!(
            renderer.category(ids::GP_FOLLOWUP_REMINDER).unwrap(),
            ConsentCategory::ReportReady
        );
        assert_eq!(
            renderer.category(ids::SCAN_REGISTRATION_INVITE).unwrap(),
            ConsentCategory::GeneralInformation
        );
        assert!(renderer.category("otp_code").is_err());
    }
}
