//! Telegram Bot API transport.

use super::Transport;
use crate::{Error, Result};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, instrument};

/// Default Bot API endpoint.
pub const DEFAULT_API_BASE: &str = "https://api.telegram.org";

const PARSE_MODE: &str = "Markdown";

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'a str,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

/// Posts messages with `sendMessage`.
///
/// The bot token is part of the request URL, so transport errors are
/// stripped of their URL before being reported.
pub struct TelegramTransport {
    client: reqwest::blocking::Client,
    api_base: String,
    token: SecretString,
}

impl TelegramTransport {
    /// Creates a transport for the given bot token.
    #[must_use]
    pub fn new(token: SecretString, api_base: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::blocking::Client::builder()
            .user_agent(format!("feedrelay/{}", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .pool_max_idle_per_host(4)
            .build()
            .unwrap_or_else(|_| reqwest::blocking::Client::new());

        Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/bot{}/sendMessage",
            self.api_base,
            self.token.expose_secret()
        )
    }
}

impl std::fmt::Debug for TelegramTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramTransport")
            .field("api_base", &self.api_base)
            .field("token", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

impl Transport for TelegramTransport {
    #[instrument(skip(self, text), fields(operation = "send_message", len = text.len()))]
    fn send(&self, channel: &str, text: &str) -> Result<()> {
        let body = SendMessage {
            chat_id: channel,
            text,
            parse_mode: PARSE_MODE,
        };

        let response = self
            .client
            .post(self.endpoint())
            .json(&body)
            .send()
            .map_err(|e| Error::operation("send_message", e.without_url()))?;

        let status = response.status();
        let parsed: Option<ApiResponse> = response.json().ok();

        match parsed {
            Some(ApiResponse { ok: true, .. }) if status.is_success() => {
                debug!(channel, "Message accepted");
                Ok(())
            },
            Some(ApiResponse { description, .. }) => Err(Error::operation(
                "send_message",
                format!(
                    "HTTP {}: {}",
                    status.as_u16(),
                    description.unwrap_or_else(|| "request rejected".to_string())
                ),
            )),
            None => Err(Error::operation(
                "send_message",
                format!("HTTP {}: unreadable response body", status.as_u16()),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKEN: &str = "123456:secret-token";

    fn transport(api_base: &str) -> TelegramTransport {
        TelegramTransport::new(
            SecretString::from(TOKEN.to_string()),
            api_base,
            Duration::from_secs(2),
        )
    }

    #[test]
    fn test_request_body_shape() {
        let body = SendMessage {
            chat_id: "@news",
            text: "*hello*",
            parse_mode: PARSE_MODE,
        };
        let json = serde_json::to_value(&body).expect("serialize");
        assert_eq!(
            json,
            serde_json::json!({"chat_id": "@news", "text": "*hello*", "parse_mode": "Markdown"})
        );
    }

    #[test]
    fn test_endpoint_trims_trailing_slash() {
        let t = transport("https://api.example.test/");
        assert_eq!(
            t.endpoint(),
            format!("https://api.example.test/bot{TOKEN}/sendMessage")
        );
    }

    #[test]
    fn test_debug_redacts_token() {
        let rendered = format!("{:?}", transport(DEFAULT_API_BASE));
        assert!(!rendered.contains("secret-token"));
        assert!(rendered.contains("REDACTED"));
    }

    #[test]
    fn test_connection_error_does_not_leak_token() {
        let err = transport("http://127.0.0.1:9")
            .send("@news", "hi")
            .expect_err("nothing listens on the discard port");
        let message = err.to_string();
        assert!(message.contains("send_message"));
        assert!(!message.contains("secret-token"));
    }

    #[test]
    fn test_api_error_response_shape() {
        let parsed: ApiResponse =
            serde_json::from_str(r#"{"ok":false,"error_code":400,"description":"chat not found"}"#)
                .expect("parse");
        assert!(!parsed.ok);
        assert_eq!(parsed.description.as_deref(), Some("chat not found"));
    }
}
