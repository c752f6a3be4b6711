use anyhow::{Context, Result};
use askama::Template;
use chrono::{NaiveDate, Utc};
use lettre::message::{Mailbox, Message, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::AsyncSmtpTransport;
use lettre::{AsyncTransport, Tokio1Executor};
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::error::PipelineError;
use crate::models::{BriefingEntry, BriefingStatus, User};
use crate::storage::{BriefingRepository, Repositories, UserRepository};

/// A rendered message ready for the transport.
#[derive(Debug, Clone)]
pub struct OutgoingEmail {
    pub to: String,
    pub subject: String,
    pub html: String,
    pub text: String,
}

#[async_trait::async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: OutgoingEmail) -> Result<()>;
}

/// SMTP transport over lettre.
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    pub fn from_config(config: &common::EmailConfig) -> Result<Self> {
        let host = config.smtp_host.as_deref().unwrap_or("localhost");
        let port = config.smtp_port.unwrap_or(587);

        let mut builder = match config.tls.as_deref().unwrap_or("starttls") {
            "tls" => AsyncSmtpTransport::<Tokio1Executor>::relay(host)
                .with_context(|| format!("invalid SMTP host: {}", host))?,
            "none" => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host),
            _ => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
                .with_context(|| format!("invalid SMTP host: {}", host))?,
        }
        .port(port);

        let username = config.username_env.as_deref().and_then(|var| std::env::var(var).ok());
        let password = config.password_env.as_deref().and_then(|var| std::env::var(var).ok());
        if let (Some(user), Some(pass)) = (username, password) {
            builder = builder.credentials(Credentials::new(user, pass));
        }

        let from = config
            .from
            .as_deref()
            .unwrap_or("Briefly <briefly@localhost>")
            .parse()
            .context("invalid email.from mailbox")?;

        Ok(Self {
            transport: builder.build(),
            from,
        })
    }
}

#[async_trait::async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, email: OutgoingEmail) -> Result<()> {
        let to: Mailbox = email
            .to
            .parse()
            .with_context(|| format!("invalid recipient: {}", email.to))?;

        let msg = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(email.subject)
            .multipart(MultiPart::alternative_plain_html(email.text, email.html))
            .context("build email")?;

        self.transport.send(msg).await.context("send email")?;
        Ok(())
    }
}

/// Result of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Sent,
    /// The briefing was not in `compiled` state; nothing was done.
    Skipped,
}

/// Sends compiled briefings by email and records the delivery status.
pub struct BriefingMailer {
    briefings: Arc<dyn BriefingRepository>,
    users: Arc<dyn UserRepository>,
    mailer: Arc<dyn Mailer>,
    app_url: String,
}

impl BriefingMailer {
    pub fn new(repos: &Repositories, mailer: Arc<dyn Mailer>, app_url: impl Into<String>) -> Self {
        Self {
            briefings: repos.briefings.clone(),
            users: repos.users.clone(),
            mailer,
            app_url: app_url.into(),
        }
    }

    /// compiled -> sending -> sent | failed. A failed send is terminal and the error is
    /// returned; redelivering a briefing that is no longer compiled is a no-op.
    pub async fn send_briefing(&self, briefing_id: i64) -> Result<DeliveryOutcome> {
        let briefing = self
            .briefings
            .get(briefing_id)
            .await?
            .ok_or(PipelineError::BriefingNotFound(briefing_id))?;

        if briefing.status != BriefingStatus::Compiled {
            debug!(briefing_id, status = ?briefing.status, "briefing not in compiled state, skipping");
            return Ok(DeliveryOutcome::Skipped);
        }

        let user = self
            .users
            .get(briefing.user_id)
            .await?
            .ok_or(PipelineError::UserNotFound(briefing.user_id))?;

        if !self.briefings.mark_sending(briefing_id).await? {
            return Ok(DeliveryOutcome::Skipped);
        }

        match self.deliver(&user, briefing_id, briefing.briefing_date).await {
            Ok(()) => {
                self.briefings.mark_sent(briefing_id, Utc::now()).await?;
                info!(briefing_id, user_id = user.id, "Briefing sent to {}", user.email);
                Ok(DeliveryOutcome::Sent)
            }
            Err(e) => {
                error!(briefing_id, user_id = user.id, "Briefing delivery failed: {:#}", e);
                self.briefings.mark_failed(briefing_id).await?;
                Err(e)
            }
        }
    }

    async fn deliver(&self, user: &User, briefing_id: i64, date: NaiveDate) -> Result<()> {
        let entries = self.briefings.entries(briefing_id).await?;
        let sections = group_sections(&entries);
        let date = format_date(date);
        let preferences_url = format!("{}/preferences", self.app_url.trim_end_matches('/'));

        let email = OutgoingEmail {
            to: user.email.clone(),
            subject: format!("Briefly — Your briefing for {}", date),
            html: render_html(user.display_name(), &date, &sections, &preferences_url)?,
            text: render_text(user.display_name(), &date, &sections, &preferences_url)?,
        };
        self.mailer.send(email).await
    }
}

/// Entries of one topic, in briefing order.
pub struct EmailSection<'a> {
    pub topic_name: &'a str,
    pub entries: Vec<&'a BriefingEntry>,
}

/// Group position-ordered entries into topic sections, keeping first-appearance order.
pub fn group_sections(entries: &[BriefingEntry]) -> Vec<EmailSection<'_>> {
    let mut sections: Vec<EmailSection<'_>> = Vec::new();
    for entry in entries {
        let name = entry.topic_name.as_deref().unwrap_or(&entry.topic_slug);
        match sections.iter_mut().find(|s| s.topic_name == name) {
            Some(section) => section.entries.push(entry),
            None => sections.push(EmailSection {
                topic_name: name,
                entries: vec![entry],
            }),
        }
    }
    sections
}

pub fn format_date(date: NaiveDate) -> String {
    date.format("%A, %B %-d, %Y").to_string()
}

/// HTML body. Interpolated values are escaped by the template.
#[derive(Template)]
#[template(path = "briefing.html")]
struct BriefingHtml<'a> {
    name: &'a str,
    date: &'a str,
    sections: &'a [EmailSection<'a>],
    preferences_url: &'a str,
}

#[derive(Template)]
#[template(path = "briefing.txt")]
struct BriefingText<'a> {
    name: &'a str,
    date: &'a str,
    sections: &'a [EmailSection<'a>],
    preferences_url: &'a str,
}

pub fn render_html(name: &str, date: &str, sections: &[EmailSection<'_>], preferences_url: &str) -> Result<String> {
    BriefingHtml {
        name,
        date,
        sections,
        preferences_url,
    }
    .render()
    .context("render briefing html")
}

pub fn render_text(name: &str, date: &str, sections: &[EmailSection<'_>], preferences_url: &str) -> Result<String> {
    BriefingText {
        name,
        date,
        sections,
        preferences_url,
    }
    .render()
    .context("render briefing text")
}
