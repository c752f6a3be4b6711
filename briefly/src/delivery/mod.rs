//! Outbound channels: per-user email briefings and the shared chat webhook.

pub mod discord;
pub mod email;

pub use discord::{DiscordOptions, DiscordPoster, PostSummary};
pub use email::{BriefingMailer, DeliveryOutcome, Mailer, OutgoingEmail, SmtpMailer};
