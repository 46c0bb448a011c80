// Notification boundary: attendance/key messages to the incoming
// webhook, and posting as the user with the stored (encrypted) token.
//
// Webhook delivery is fire-and-forget: the log row is already committed
// by the time this runs, so a notification failure loses a message,
// never state.

use chrono::{DateTime, FixedOffset, Utc};
use serde::Deserialize;
use thiserror::Error;

use crate::auth::cipher::TokenCipher;
use crate::store::{LogEntry, StoreError, UserStore, ACTION_ENTER, ACTION_RETURN_KEY, ACTION_TAKE_KEY};

use super::{SlackApi, SlackApiError};

const WEBHOOK_USERNAME: &str = "研究室入退室管理システム";
const WEBHOOK_ICON: &str = ":office:";

/// A timestamp as it may arrive from collaborators: either a native
/// RFC 3339 datetime or the provider's `{seconds, nanoseconds}` object.
/// Resolved exactly once, here at the boundary.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum WireTimestamp {
    Native(DateTime<Utc>),
    Provider {
        seconds: i64,
        #[serde(default)]
        nanoseconds: u32,
    },
}

impl WireTimestamp {
    pub fn to_utc(&self) -> DateTime<Utc> {
        match self {
            Self::Native(datetime) => *datetime,
            Self::Provider { seconds, nanoseconds } => {
                DateTime::<Utc>::from_timestamp(*seconds, *nanoseconds)
                    .unwrap_or_else(Utc::now)
            }
        }
    }
}

/// Render a timestamp for the Japanese-audience messages (JST).
pub fn jst_string(timestamp: DateTime<Utc>) -> String {
    match FixedOffset::east_opt(9 * 3600) {
        Some(jst) => timestamp.with_timezone(&jst).format("%Y/%m/%d %H:%M:%S").to_string(),
        None => timestamp.format("%Y/%m/%d %H:%M:%S").to_string(),
    }
}

/// Format a room entry/exit log for the webhook channel.
pub fn format_attendance_message(entry: &LogEntry) -> String {
    let preposition = if entry.action == ACTION_ENTER { "に" } else { "から" };
    format!(
        "*{}* さんが *{}* {} *{}* しました\n時刻: {}",
        entry.user_name,
        entry.room,
        preposition,
        entry.action,
        jst_string(entry.logged_at)
    )
}

/// Format a key acquisition/return log, naming the current holder on
/// acquisition.
pub fn format_key_message(entry: &LogEntry, key_holder_name: Option<&str>) -> String {
    let mut message = format!("*{}* さんが *{}* しました\n", entry.user_name, entry.action);

    if entry.action == ACTION_TAKE_KEY {
        if let Some(holder) = key_holder_name {
            message.push_str(&format!("現在の鍵保持者: *{holder}*\n"));
        }
    } else if entry.action == ACTION_RETURN_KEY {
        message.push_str("鍵は詰所に戻りました\n");
    }

    message.push_str(&format!("時刻: {}", jst_string(entry.logged_at)));
    message
}

fn is_key_action(action: &str) -> bool {
    action == ACTION_TAKE_KEY || action == ACTION_RETURN_KEY
}

/// Posts attendance/key messages to the configured incoming webhook.
#[derive(Clone)]
pub struct WebhookNotifier {
    webhook_url: Option<String>,
    http: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(webhook_url: Option<String>) -> Self {
        Self { webhook_url, http: reqwest::Client::new() }
    }

    /// Deliver a log event. Never fails the caller: an unconfigured
    /// webhook skips silently, a delivery error is logged and dropped.
    pub async fn notify_log(&self, entry: &LogEntry, key_holder_name: Option<&str>) {
        let Some(url) = self.webhook_url.as_deref() else {
            tracing::debug!("slack webhook url not configured, skipping notification");
            return;
        };

        let text = if is_key_action(&entry.action) {
            format_key_message(entry, key_holder_name)
        } else {
            format_attendance_message(entry)
        };

        let payload = serde_json::json!({
            "text": text,
            "username": WEBHOOK_USERNAME,
            "icon_emoji": WEBHOOK_ICON,
        });

        match self.http.post(url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => {
                tracing::debug!(action = %entry.action, user = %entry.user_name, "slack notification sent");
            }
            Ok(response) => {
                tracing::warn!(status = %response.status(), "slack webhook rejected notification");
            }
            Err(error) => {
                tracing::warn!(%error, "slack webhook delivery failed");
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum SendAsUserError {
    #[error("user {0} has no stored slack token")]
    NoToken(String),
    #[error("stored slack token is no longer valid")]
    TokenInvalid,
    #[error("slack rejected the message: {0}")]
    Rejected(String),
    #[error(transparent)]
    Api(#[from] SlackApiError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Slack-level errors that mean the user token itself is dead.
const TOKEN_DEAD_ERRORS: &[&str] = &["invalid_auth", "token_revoked", "account_inactive"];

/// Post a message to `channel` as the user, decrypting the stored token
/// on the way.
///
/// Any cipher failure means the stored blob can never decrypt again, so
/// the token is deleted before reporting it invalid — the next login
/// stores a fresh one instead of every send failing identically.
pub async fn send_message_as_user(
    store: &UserStore,
    cipher: &TokenCipher,
    slack: &dyn SlackApi,
    uid: &str,
    channel: &str,
    text: &str,
) -> Result<(), SendAsUserError> {
    let stored = store
        .encrypted_token(uid)
        .await?
        .ok_or_else(|| SendAsUserError::NoToken(uid.to_owned()))?;

    let user_token = match cipher.decrypt(&stored) {
        Ok(token) => token,
        Err(error) => {
            tracing::warn!(%uid, %error, "stored slack token failed decryption, deleting it");
            store.delete_encrypted_token(uid).await?;
            return Err(SendAsUserError::TokenInvalid);
        }
    };

    let response = slack.post_message(&user_token, channel, text).await?;
    if !response.ok {
        let reason = response.error.unwrap_or_else(|| "unknown_error".to_owned());
        if TOKEN_DEAD_ERRORS.contains(&reason.as_str()) {
            tracing::warn!(%uid, %reason, "slack reports user token dead, deleting it");
            store.delete_encrypted_token(uid).await?;
            return Err(SendAsUserError::TokenInvalid);
        }
        return Err(SendAsUserError::Rejected(reason));
    }

    Ok(())
}
