//! Communication templates, placeholder rendering and message dispatch.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::db::Collection;
use crate::error::validation::require_text;
use crate::error::{AppError, AppResult};
use crate::metrics::Metrics;
use crate::store::{get_path, get_str, DocumentStore};
use crate::types::now_iso;

pub const SMS_MAX_CHARS: usize = 1000;
const CONTENT_MAX_CHARS: usize = 20_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateType {
    Email,
    Sms,
    Whatsapp,
}

impl TemplateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TemplateType::Email => "email",
            TemplateType::Sms => "sms",
            TemplateType::Whatsapp => "whatsapp",
        }
    }

    /// Student field the message is addressed to.
    pub fn recipient_field(&self) -> &'static str {
        match self {
            TemplateType::Email => "email",
            TemplateType::Sms | TemplateType::Whatsapp => "mobile",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TemplateInput {
    pub template_type: TemplateType,
    pub name: String,
    pub subject: Option<String>,
    pub content: String,
    pub dlt_content_id: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub is_published: bool,
}

impl TemplateInput {
    /// Checks the per-channel rules and returns the document body to store.
    pub fn validate(&self) -> AppResult<Value> {
        let name = require_text(&self.name, "name", 200)?;
        let content = require_text(&self.content, "content", CONTENT_MAX_CHARS)?;
        let subject = match (self.template_type, self.subject.as_deref()) {
            (TemplateType::Email, Some(s)) => Some(require_text(s, "subject", 300)?),
            (TemplateType::Email, None) => {
                return Err(AppError::validation("subject", "Subject is required for email templates"))
            }
            (_, Some(_)) => return Err(AppError::validation("subject", "Only email templates have a subject")),
            (_, None) => None,
        };
        if self.template_type == TemplateType::Sms && content.chars().count() > SMS_MAX_CHARS {
            return Err(AppError::validation(
                "content",
                format!("SMS content must be at most {} characters", SMS_MAX_CHARS),
            ));
        }
        let dlt_content_id = match (self.template_type, self.dlt_content_id.as_deref()) {
            (TemplateType::Sms, Some(id)) => Some(require_text(id, "dlt_content_id", 64)?),
            (_, Some(_)) => {
                return Err(AppError::validation("dlt_content_id", "dlt_content_id applies to SMS templates only"))
            }
            (_, None) => None,
        };
        let tags: Vec<String> = self
            .tags
            .iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();

        Ok(json!({
            "template_type": self.template_type,
            "name": name,
            "subject": subject,
            "content": content,
            "dlt_content_id": dlt_content_id,
            "tags": tags,
            "is_published": self.is_published,
        }))
    }
}

fn is_placeholder_path(inner: &str) -> bool {
    !inner.is_empty()
        && inner.split('.').all(|seg| !seg.is_empty() && seg.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'))
}

fn display_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Array(items) => items.iter().map(display_value).collect::<Vec<_>>().join(", "),
        other => other.to_string(),
    }
}

/// Replaces `{{ field.path }}` placeholders with values from `context`.
///
/// Unknown paths render as empty text. Anything between braces that is not a dotted
/// path, and unterminated `{{`, is copied through unchanged.
pub fn render(content: &str, context: &Value) -> String {
    let mut out = String::with_capacity(content.len());
    let mut rest = content;
    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let Some(close) = after.find("}}") else {
            out.push_str(&rest[open..]);
            return out;
        };
        if let Some(nested) = after[..close].find("{{") {
            // the innermost opener starts the placeholder
            out.push_str(&rest[open..open + 2 + nested]);
            rest = &after[nested..];
            continue;
        }
        let inner = after[..close].trim();
        if is_placeholder_path(inner) {
            if let Some(v) = get_path(context, inner) {
                out.push_str(&display_value(v));
            }
        } else {
            out.push_str(&rest[open..open + 2 + close + 2]);
        }
        rest = &after[close + 2..];
    }
    out.push_str(rest);
    out
}

#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub channel: TemplateType,
    pub recipient: String,
    pub subject: Option<String>,
    pub body: String,
    pub college_id: String,
    pub student_id: Option<String>,
    pub template_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub provider_message_id: String,
    pub accepted_at: String,
}

/// Seam to an email/SMS/WhatsApp provider.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn send(&self, message: &Message) -> AppResult<DeliveryReceipt>;
}

/// Dispatcher that only records the message in the log.
#[derive(Debug, Default, Clone)]
pub struct LogDispatcher;

#[async_trait]
impl Dispatcher for LogDispatcher {
    async fn send(&self, message: &Message) -> AppResult<DeliveryReceipt> {
        tracing::info!(
            channel = message.channel.as_str(),
            recipient = %message.recipient,
            template_id = ?message.template_id,
            bytes = message.body.len(),
            "message dispatched"
        );
        Ok(DeliveryReceipt { provider_message_id: uuid::Uuid::new_v4().to_string(), accepted_at: now_iso() })
    }
}

/// Sends one message and records the attempt in the communication log.
/// Returns whether the provider accepted it.
pub async fn deliver(
    store: &DocumentStore,
    dispatcher: &dyn Dispatcher,
    metrics: &Metrics,
    message: Message,
) -> AppResult<bool> {
    let outcome = dispatcher.send(&message).await;
    let (status, receipt, error) = match &outcome {
        Ok(receipt) => {
            metrics.inc_communications_sent();
            ("sent", Some(receipt.clone()), None)
        }
        Err(e) => {
            metrics.inc_communications_failed();
            tracing::warn!(recipient = %message.recipient, error = %e, "message dispatch failed");
            ("failed", None, Some(e.to_string()))
        }
    };
    store
        .insert(
            Collection::CommunicationLogs,
            json!({
                "channel": message.channel,
                "recipient": message.recipient,
                "subject": message.subject,
                "body": message.body,
                "college_id": message.college_id,
                "student_id": message.student_id,
                "template_id": message.template_id,
                "status": status,
                "receipt": receipt,
                "error": error,
            }),
        )
        .await?;
    Ok(outcome.is_ok())
}

/// Builds the message for one student from a stored template, or `None` when the
/// student has no address for the template's channel.
pub fn message_for(template: &Value, student: &Value) -> AppResult<Option<Message>> {
    let channel: TemplateType =
        serde_json::from_value(template.get("template_type").cloned().unwrap_or(Value::Null))
            .map_err(|_| AppError::Internal(anyhow::anyhow!("template with invalid template_type")))?;
    let Some(recipient) = get_str(student, channel.recipient_field()).filter(|r| !r.is_empty()) else {
        return Ok(None);
    };
    let content = get_str(template, "content").unwrap_or_default();
    Ok(Some(Message {
        channel,
        recipient: recipient.to_string(),
        subject: get_str(template, "subject").map(|s| render(s, student)),
        body: render(content, student),
        college_id: get_str(student, "college_id").unwrap_or_default().to_string(),
        student_id: get_str(student, "_id").map(str::to_string),
        template_id: get_str(template, "_id").map(str::to_string),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_resolves_paths_and_keeps_malformed_text() {
        let ctx = json!({"name": "Asha", "address": {"city": "Pune"}, "score": 91.5, "tags": ["a", "b"]});
        assert_eq!(render("Hi {{ name }} from {{address.city}}", &ctx), "Hi Asha from Pune");
        assert_eq!(render("{{ score }} {{ tags }}", &ctx), "91.5 a, b");
        assert_eq!(render("[{{ missing.field }}]", &ctx), "[]");
        assert_eq!(render("{{ not a path }} and {{ name", &ctx), "{{ not a path }} and {{ name");
        assert_eq!(render("no placeholders", &ctx), "no placeholders");
    }

    #[test]
    fn render_restarts_at_nested_opener() {
        let ctx = json!({"name": "Asha"});
        assert_eq!(render("{{ {{ name }}", &ctx), "{{ Asha");
        assert_eq!(render("{{{{name}}!", &ctx), "{{Asha!");
        assert_eq!(render("a {{ b {{ c {{ name }} d", &ctx), "a {{ b {{ c Asha d");
        assert_eq!(render("{{ x {{ y }}", &ctx), "{{ x ");
    }

    fn input(template_type: TemplateType) -> TemplateInput {
        TemplateInput {
            template_type,
            name: " Welcome ".into(),
            subject: None,
            content: "Hello {{ name }}".into(),
            dlt_content_id: None,
            tags: vec![" intake ".into(), "".into()],
            is_published: false,
        }
    }

    #[test]
    fn email_requires_subject() {
        assert!(matches!(input(TemplateType::Email).validate(), Err(AppError::ValidationError { .. })));
        let mut ok = input(TemplateType::Email);
        ok.subject = Some("Hi".into());
        let doc = ok.validate().unwrap();
        assert_eq!(doc["name"], "Welcome");
        assert_eq!(doc["tags"], json!(["intake"]));
    }

    #[test]
    fn sms_rules() {
        let mut sms = input(TemplateType::Sms);
        sms.content = "x".repeat(SMS_MAX_CHARS + 1);
        assert!(sms.validate().is_err());

        let mut wa = input(TemplateType::Whatsapp);
        wa.dlt_content_id = Some("1007".into());
        assert!(wa.validate().is_err());

        let mut sms = input(TemplateType::Sms);
        sms.dlt_content_id = Some("1007".into());
        assert_eq!(sms.validate().unwrap()["dlt_content_id"], "1007");
    }

    #[test]
    fn message_uses_channel_recipient() {
        let template = json!({"_id": "t1", "template_type": "sms", "content": "Hi {{ name }}"});
        let student = json!({"_id": "s1", "name": "Ravi", "mobile": "+919999999999", "college_id": "c1"});
        let msg = message_for(&template, &student).unwrap().unwrap();
        assert_eq!(msg.recipient, "+919999999999");
        assert_eq!(msg.body, "Hi Ravi");

        let no_mobile = json!({"_id": "s2", "name": "Ravi"});
        assert!(message_for(&template, &no_mobile).unwrap().is_none());
    }
}
