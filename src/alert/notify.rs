//! Outbound notification channels.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use reqwest::{Client, Method};
use serde_json::{json, Map, Value};
use tracing::info;

use crate::config::{EmailConfig, NotifyConfig, NotifyKind};
use crate::detect::Severity;

/// A destination for alert summaries. Delivery is best effort; callers log
/// failures and move on.
#[async_trait::async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send(&self, subject: &str, message: &str, extra: Option<&Value>) -> Result<()>;
}

/// Build the sink described by `[notify]`, or `None` when notifications are
/// disabled.
pub fn build_sink(config: &NotifyConfig) -> Result<Option<Arc<dyn NotificationSink>>> {
    let timeout = Duration::from_secs(config.timeout_secs.max(1));
    let url = || {
        config
            .resolved_url()
            .context("notification url is not configured")
    };
    let sink: Arc<dyn NotificationSink> = match config.kind {
        NotifyKind::None => return Ok(None),
        NotifyKind::Webhook => Arc::new(WebhookSink::new(
            url()?,
            &config.method,
            config.headers.clone(),
            timeout,
        )?),
        NotifyKind::Chat => Arc::new(ChatSink::new(url()?, config.channel.clone(), timeout)?),
        NotifyKind::Email => Arc::new(EmailSink::new(&config.email, timeout)?),
    };
    info!(sink = sink.name(), "notification sink configured");
    Ok(Some(sink))
}

fn http_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .build()
        .context("failed to build HTTP client")
}

// ---------------------------------------------------------------------------
// Webhook
// ---------------------------------------------------------------------------

/// Generic JSON webhook.
pub struct WebhookSink {
    client: Client,
    url: String,
    method: Method,
    headers: BTreeMap<String, String>,
}

impl WebhookSink {
    pub fn new(url: String, method: &str, headers: BTreeMap<String, String>, timeout: Duration) -> Result<Self> {
        let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
            .with_context(|| format!("invalid HTTP method '{}'", method))?;
        Ok(Self {
            client: http_client(timeout)?,
            url,
            method,
            headers,
        })
    }
}

/// `{subject, message}` plus every key of `extra` when it is an object.
pub fn webhook_payload(subject: &str, message: &str, extra: Option<&Value>) -> Value {
    let mut body = Map::new();
    if let Some(Value::Object(fields)) = extra {
        body.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    body.insert("subject".into(), Value::String(subject.to_string()));
    body.insert("message".into(), Value::String(message.to_string()));
    Value::Object(body)
}

#[async_trait::async_trait]
impl NotificationSink for WebhookSink {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn send(&self, subject: &str, message: &str, extra: Option<&Value>) -> Result<()> {
        let mut req = self.client.request(self.method.clone(), &self.url);
        for (k, v) in &self.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        req.json(&webhook_payload(subject, message, extra))
            .send()
            .await
            .with_context(|| format!("webhook request to {} failed", self.url))?
            .error_for_status()
            .context("webhook rejected notification")?;
        info!(subject, "webhook notification sent");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Chat
// ---------------------------------------------------------------------------

/// Chat incoming-webhook with a coloured attachment per severity.
pub struct ChatSink {
    client: Client,
    url: String,
    channel: Option<String>,
}

impl ChatSink {
    pub fn new(url: String, channel: Option<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            url,
            channel,
        })
    }
}

pub fn severity_color(severity: Option<Severity>) -> &'static str {
    match severity {
        Some(Severity::Critical) => "#FF0000",
        Some(Severity::High) => "#FFA500",
        Some(Severity::Medium) => "#FFFF00",
        Some(Severity::Low) => "#00FF00",
        None => "#808080",
    }
}

/// Severity carried in the `severity` key of `extra`, if any.
fn extra_severity(extra: Option<&Value>) -> Option<Severity> {
    extra?.get("severity")?.as_str()?.parse().ok()
}

pub fn chat_payload(channel: Option<&str>, subject: &str, message: &str, extra: Option<&Value>) -> Value {
    let mut body = json!({
        "text": format!("*{}*", subject),
        "attachments": [{
            "color": severity_color(extra_severity(extra)),
            "text": message,
        }],
    });
    if let Some(channel) = channel {
        body["channel"] = Value::String(channel.to_string());
    }
    body
}

#[async_trait::async_trait]
impl NotificationSink for ChatSink {
    fn name(&self) -> &'static str {
        "chat"
    }

    async fn send(&self, subject: &str, message: &str, extra: Option<&Value>) -> Result<()> {
        self.client
            .post(&self.url)
            .json(&chat_payload(self.channel.as_deref(), subject, message, extra))
            .send()
            .await
            .with_context(|| format!("chat webhook request to {} failed", self.url))?
            .error_for_status()
            .context("chat webhook rejected notification")?;
        info!(subject, "chat notification sent");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Email
// ---------------------------------------------------------------------------

/// Plain-text mail over an SMTP relay with STARTTLS.
pub struct EmailSink {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Vec<Mailbox>,
}

impl EmailSink {
    pub fn new(config: &EmailConfig, timeout: Duration) -> Result<Self> {
        let server = config
            .server
            .as_deref()
            .context("smtp server is not configured")?;
        let from = config
            .sender()
            .context("sender address is not configured")?
            .parse::<Mailbox>()
            .context("invalid sender address")?;
        let to = config
            .to
            .iter()
            .map(|addr| {
                addr.parse::<Mailbox>()
                    .with_context(|| format!("invalid recipient address '{}'", addr))
            })
            .collect::<Result<Vec<_>>>()?;
        if to.is_empty() {
            bail!("no email recipients configured");
        }

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(server)
            .with_context(|| format!("failed to configure smtp relay {}", server))?
            .port(config.port)
            .timeout(Some(timeout));
        if let Some(user) = &config.username {
            let password = config
                .resolved_password()
                .context("smtp password is not configured")?;
            builder = builder.credentials(Credentials::new(user.clone(), password));
        }

        Ok(Self {
            transport: builder.build(),
            from,
            to,
        })
    }
}

/// `message`, followed by one `key: value` line per field of `extra`.
pub fn email_body(message: &str, extra: Option<&Value>) -> String {
    let mut body = message.to_string();
    if let Some(Value::Object(fields)) = extra {
        if !fields.is_empty() {
            body.push_str("\n\nDetails:\n");
            for (key, value) in fields {
                let text = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                body.push_str(&format!("  {}: {}\n", key, text));
            }
        }
    }
    body
}

pub fn build_email(from: &Mailbox, to: &[Mailbox], subject: &str, body: String) -> Result<Message> {
    let mut builder = Message::builder()
        .from(from.clone())
        .subject(subject)
        .header(ContentType::TEXT_PLAIN);
    for rcpt in to {
        builder = builder.to(rcpt.clone());
    }
    builder.body(body).context("failed to build email")
}

#[async_trait::async_trait]
impl NotificationSink for EmailSink {
    fn name(&self) -> &'static str {
        "email"
    }

    async fn send(&self, subject: &str, message: &str, extra: Option<&Value>) -> Result<()> {
        let email = build_email(&self.from, &self.to, subject, email_body(message, extra))?;
        self.transport
            .send(email)
            .await
            .context("smtp delivery failed")?;
        info!(subject, recipients = self.to.len(), "email notification sent");
        Ok(())
    }
}
