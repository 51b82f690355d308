//! Lifecycle notifications over an outgoing webhook.
//!
//! Discord URLs get rich embeds; any other URL gets a flat JSON event.
//! Delivery is fire-and-forget: a failed POST is logged and forgotten, the
//! fleet must never stall on a chat service.

use std::time::Duration;

use serde_json::{Value, json};

use crate::config::WebhookConfig;
use crate::machine::NotifyKind;

const COLOR_GREEN: u32 = 0x2ecc71;
const COLOR_YELLOW: u32 = 0xf1c40f;
const COLOR_RED: u32 = 0xe74c3c;
const COLOR_ORANGE: u32 = 0xe67e22;

pub struct WebhookNotifier {
    http: reqwest::Client,
    url: String,
    label: String,
    is_discord: bool,
}

fn is_discord_url(url: &str) -> bool {
    url.contains("discord.com/api/webhooks") || url.contains("discordapp.com/api/webhooks")
}

impl WebhookNotifier {
    /// `None` when no URL is configured; emission is suppressed entirely.
    pub fn new(cfg: &WebhookConfig) -> Option<Self> {
        let url = cfg.url.clone()?;
        let http = reqwest::Client::builder()
            .user_agent(concat!("craftwatch/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(10))
            .build()
            .ok()?;
        Some(Self {
            is_discord: is_discord_url(&url),
            http,
            url,
            label: cfg.label.clone(),
        })
    }

    pub async fn notify(&self, server: &str, kind: NotifyKind) {
        let (title, description, color) = match kind {
            NotifyKind::Started => (
                "Server Starting",
                format!("🚀 **{server}** is starting up!"),
                COLOR_GREEN,
            ),
            NotifyKind::Stopped => (
                "Server Stopped",
                format!("💤 **{server}** was shut down after sitting idle."),
                COLOR_YELLOW,
            ),
            NotifyKind::Crashed => (
                "Server Crashed",
                format!("❌ **{server}** went down unexpectedly!"),
                COLOR_RED,
            ),
            NotifyKind::Quarantined => (
                "Server Quarantined",
                format!("🔁 **{server}** is cycling too fast; automatic stops are paused."),
                COLOR_ORANGE,
            ),
        };
        self.post(server, kind.as_str(), title, &description, color)
            .await;
    }

    pub async fn notify_degraded(&self, server: &str) {
        self.post(
            server,
            "degraded",
            "Server Degraded",
            &format!("⚠️ Controller calls for **{server}** keep failing."),
            COLOR_ORANGE,
        )
        .await;
    }

    async fn post(&self, server: &str, event: &str, title: &str, description: &str, color: u32) {
        let payload = if self.is_discord {
            discord_payload(title, description, color, &self.label)
        } else {
            generic_payload(event, server, description)
        };

        match self.http.post(&self.url).json(&payload).send().await {
            Ok(resp) if resp.status().is_success() => {
                tracing::debug!(%server, %event, "webhook delivered");
            }
            Ok(resp) => {
                tracing::warn!(%server, %event, status = %resp.status(), "webhook rejected");
            }
            Err(err) => {
                tracing::warn!(%server, %event, error = %err, "webhook delivery failed");
            }
        }
    }
}

fn discord_payload(title: &str, description: &str, color: u32, label: &str) -> Value {
    let mut embed = json!({
        "title": title,
        "description": description,
        "color": color,
        "timestamp": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
    });
    if !label.is_empty() {
        embed["footer"] = json!({"text": label});
    }
    json!({"embeds": [embed]})
}

fn generic_payload(event: &str, server: &str, message: &str) -> Value {
    json!({
        "event": event,
        "server": server,
        "message": message,
        "timestamp": chrono::Utc::now().timestamp(),
    })
}
