//! Top-signal notifications
//!
//! `notify` is fire-and-forget: it formats the message and queues it for a
//! background worker, so a slow or failing channel never delays a cycle.
//! The queue is bounded; when it is full the new message is dropped.
//! Delivery failures are logged and dropped, there are no retries.

use super::config::TelegramCredentials;
use super::error::NotificationError;
use super::types::Signal;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const TELEGRAM_API: &str = "https://api.telegram.org";
const SEND_TIMEOUT: Duration = Duration::from_secs(10);
/// Messages waiting for the delivery worker
const QUEUE_CAPACITY: usize = 8;
/// Indicators listed per signal line
const TOP_COMPONENTS: usize = 3;

pub trait AlertDispatcher: Send + Sync {
    /// Hand the cycle's ranked top signals to the channel; must not block
    ///
    /// Returns whether the batch was accepted for delivery.
    fn notify(&self, top: &[Signal]) -> bool;
}

/// Used when no channel is configured
pub struct NullDispatcher;

impl AlertDispatcher for NullDispatcher {
    fn notify(&self, top: &[Signal]) -> bool {
        log::debug!("🔕 Alerts disabled, {} signals not sent", top.len());
        false
    }
}

/// Telegram Bot API `sendMessage` in Markdown
pub struct TelegramDispatcher {
    sender: mpsc::Sender<String>,
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'a str,
}

impl TelegramDispatcher {
    /// Spawn the delivery worker; must be called inside a tokio runtime
    pub fn new(credentials: TelegramCredentials) -> Self {
        let (sender, mut receiver) = mpsc::channel::<String>(QUEUE_CAPACITY);
        let http = reqwest::Client::builder()
            .timeout(SEND_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        tokio::spawn(async move {
            while let Some(text) = receiver.recv().await {
                match send_message(&http, &credentials, &text).await {
                    Ok(()) => log::info!("📨 Telegram alert delivered"),
                    Err(e) => log::error!("❌ Telegram send failed: {}", e),
                }
            }
            log::debug!("Telegram worker stopped");
        });

        Self { sender }
    }
}

impl AlertDispatcher for TelegramDispatcher {
    fn notify(&self, top: &[Signal]) -> bool {
        if top.is_empty() {
            return false;
        }
        match self.sender.try_send(format_message(top)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!("⚠️  Telegram queue full ({} pending), alert dropped", QUEUE_CAPACITY);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                log::error!("❌ Telegram worker is gone, alert dropped");
                false
            }
        }
    }
}

async fn send_message(
    http: &reqwest::Client,
    credentials: &TelegramCredentials,
    text: &str,
) -> Result<(), NotificationError> {
    let url = format!("{}/bot{}/sendMessage", TELEGRAM_API, credentials.bot_token);
    let response = http
        .post(&url)
        .json(&SendMessage {
            chat_id: &credentials.chat_id,
            text,
            parse_mode: "Markdown",
        })
        .send()
        .await?;

    if !response.status().is_success() {
        return Err(NotificationError::Rejected(response.status().as_u16()));
    }
    Ok(())
}

/// Telegram Markdown body for a ranked list of signals
pub fn format_message(top: &[Signal]) -> String {
    let mut lines = vec!["🔥 *Top Signal Update* 🔥".to_string()];
    for signal in top {
        let drivers = signal
            .top_components(TOP_COMPONENTS)
            .iter()
            .map(|(name, value)| format!("{} {:+.3}", name, value))
            .collect::<Vec<_>>()
            .join(", ");
        let (direction, strength) = signal.lean();
        lines.push(format!(
            "*{}* → `{}` · Bias: *{}* · Top: *{}* ({:.1}%) · Score: *{:+.3}*",
            signal.pair,
            signal.regime.as_str(),
            signal.bias.as_str(),
            direction.as_str(),
            strength * 100.0,
            signal.score
        ));
        if !signal.summary.is_empty() {
            lines.push(format!("_Summary_: {}", signal.summary));
        }
        lines.push(format!("_Drivers_: {}", drivers));
        lines.push(String::new());
    }
    lines.join("\n").trim().to_string()
}

/// Telegram when both credentials are set, otherwise a no-op
pub fn dispatcher_from_config(telegram: Option<TelegramCredentials>) -> Arc<dyn AlertDispatcher> {
    match telegram {
        Some(credentials) => Arc::new(TelegramDispatcher::new(credentials)),
        None => Arc::new(NullDispatcher),
    }
}
