//! Telegram Bot API sink.
//!
//! Public alerts go to one fixed channel, private alerts to the user's chat
//! id. Failures are classified from the Bot API's status and description:
//! a blocked bot or vanished chat is unreachable, anything else transient.

use super::{DeliveryResult, Notifier};
use crate::detector::{AlertEvent, AlertKind, AlertTarget, Direction};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

pub struct TelegramNotifier {
    api_url: String,
    bot_token: String,
    public_channel_id: String,
    unit_scale: u64,
    http: Client,
}

impl TelegramNotifier {
    pub fn new(
        api_url: String,
        bot_token: String,
        public_channel_id: String,
        unit_scale: u64,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            api_url,
            bot_token,
            public_channel_id,
            unit_scale,
            http,
        })
    }

    fn chat_id<'a>(&'a self, target: &'a AlertTarget) -> &'a str {
        match target {
            AlertTarget::Public => &self.public_channel_id,
            AlertTarget::User(id) => id,
        }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, target: &AlertTarget, event: &AlertEvent) -> DeliveryResult {
        let url = format!("{}/bot{}/sendMessage", self.api_url, self.bot_token);
        let body = serde_json::json!({
            "chat_id": self.chat_id(target),
            "text": render(event, self.unit_scale),
            "parse_mode": "HTML",
            "disable_web_page_preview": true,
        });

        let resp = match self.http.post(&url).json(&body).send().await {
            Ok(r) => r,
            Err(e) => return DeliveryResult::TransientFailure(e.to_string()),
        };
        let status = resp.status();
        let parsed: Option<ApiResponse> = resp.json().await.ok();
        let description = parsed
            .as_ref()
            .and_then(|p| p.description.clone())
            .unwrap_or_default();

        if status.is_success() && parsed.as_ref().map_or(true, |p| p.ok) {
            debug!(chat_id = %self.chat_id(target), key = %event.key, "telegram message sent");
            return DeliveryResult::Delivered;
        }
        classify_failure(status, &description)
    }
}

fn classify_failure(status: StatusCode, description: &str) -> DeliveryResult {
    let lowered = description.to_lowercase();
    let reason = format!("{} {}", status.as_u16(), description);
    if status == StatusCode::FORBIDDEN
        || (status == StatusCode::BAD_REQUEST && lowered.contains("chat not found"))
    {
        DeliveryResult::RecipientUnreachable(reason)
    } else {
        DeliveryResult::TransientFailure(reason)
    }
}

/// Message body for an event (Telegram HTML parse mode).
pub fn render(event: &AlertEvent, unit_scale: u64) -> String {
    match &event.kind {
        AlertKind::NewEpoch {
            epoch,
            active_stake,
        } => format!(
            "🌐 <b>New epoch {}</b>\nActive stake: {} XNT",
            epoch,
            format_units(*active_stake as u128, unit_scale)
        ),
        AlertKind::Whale {
            identity,
            name,
            delta,
            direction,
        } => {
            let (icon, word) = match direction {
                Direction::Inflow => ("🐋", "to"),
                Direction::Outflow => ("📉", "from"),
            };
            format!(
                "{} <b>WHALE:</b> {} XNT {} <b>{}</b>",
                icon,
                format_units(delta.unsigned_abs(), unit_scale),
                word,
                label(identity, name)
            )
        }
        AlertKind::Status {
            identity,
            name,
            previous,
            current,
        } => format!(
            "🛰 <b>Alert: {}</b>\n🚦 Status: {} → {}",
            label(identity, name),
            previous,
            current
        ),
        AlertKind::Commission {
            identity,
            name,
            previous,
            current,
        } => format!(
            "🛰 <b>Alert: {}</b>\n⚖️ Commission: {}% → {}%",
            label(identity, name),
            previous,
            current
        ),
        AlertKind::Skips {
            identity,
            name,
            skipped,
            epoch,
            ..
        } => format!(
            "🛰 <b>Alert: {}</b>\n⚠️ High skips: {} slots in epoch {}",
            label(identity, name),
            skipped,
            epoch
        ),
    }
}

fn label(identity: &str, name: &Option<String>) -> String {
    match name.as_deref() {
        Some(n) if !n.trim().is_empty() => escape_html(n),
        _ => format!("<code>{}</code>", escape_html(&identity.chars().take(8).collect::<String>())),
    }
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// Whole units with thousands separators, rounded down.
pub fn format_units(base_units: u128, unit_scale: u64) -> String {
    let whole = base_units / unit_scale.max(1) as u128;
    let digits = whole.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}
