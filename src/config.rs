use std::env;
use std::time::Duration;

use url::Url;

use crate::engine::settle::SettlePolicy;
use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct Config {
    pub api_base_url: Url,
    pub chat_ws_url: Url,
    pub http_port: u16,
    pub log_level: String,
    pub page_size: u32,
    pub first_claim_settle_ms: u64,
    pub claim_settle_ms: u64,
    pub empty_retry_ms: u64,
    pub request_timeout_secs: u64,
    pub event_buffer_size: usize,
    pub shipper_email: Option<String>,
    pub shipper_password: Option<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();

        Ok(Self {
            api_base_url: base_url(
                &env::var("API_BASE_URL")
                    .unwrap_or_else(|_| "http://10.0.2.2:8080/api/v1/".to_string()),
            )?,
            chat_ws_url: parse_url(
                "CHAT_WS_URL",
                &env::var("CHAT_WS_URL").unwrap_or_else(|_| "ws://10.0.2.2:8080/ws".to_string()),
            )?,
            http_port: parse_or_default("HTTP_PORT", 3000)?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            page_size: parse_or_default("PAGE_SIZE", 20)?,
            first_claim_settle_ms: parse_or_default("FIRST_CLAIM_SETTLE_MS", 1200)?,
            claim_settle_ms: parse_or_default("CLAIM_SETTLE_MS", 800)?,
            empty_retry_ms: parse_or_default("EMPTY_RETRY_MS", 1000)?,
            request_timeout_secs: parse_or_default("REQUEST_TIMEOUT_SECS", 10)?,
            event_buffer_size: parse_or_default("EVENT_BUFFER_SIZE", 1024)?,
            shipper_email: optional("SHIPPER_EMAIL"),
            shipper_password: optional("SHIPPER_PASSWORD"),
            access_token: optional("ACCESS_TOKEN"),
            refresh_token: optional("REFRESH_TOKEN"),
        })
    }

    /// Settings pointing at a backend on `api_base_url` and `chat_ws_url`,
    /// with zero settle delays.
    pub fn for_backend(api_base_url: &str, chat_ws_url: &str) -> Result<Self, AppError> {
        Ok(Self {
            api_base_url: base_url(api_base_url)?,
            chat_ws_url: parse_url("CHAT_WS_URL", chat_ws_url)?,
            http_port: 0,
            log_level: "info".to_string(),
            page_size: 20,
            first_claim_settle_ms: 0,
            claim_settle_ms: 0,
            empty_retry_ms: 0,
            request_timeout_secs: 5,
            event_buffer_size: 64,
            shipper_email: None,
            shipper_password: None,
            access_token: None,
            refresh_token: None,
        })
    }

    pub fn settle_policy(&self) -> SettlePolicy {
        SettlePolicy {
            first_claim: Duration::from_millis(self.first_claim_settle_ms),
            later_claim: Duration::from_millis(self.claim_settle_ms),
            empty_retry: Duration::from_millis(self.empty_retry_ms),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_url(key: &str, raw: &str) -> Result<Url, AppError> {
    Url::parse(raw).map_err(|err| AppError::Internal(format!("invalid {key}: {err}")))
}

/// Relative endpoint paths only join under the base when it ends in `/`.
fn base_url(raw: &str) -> Result<Url, AppError> {
    if raw.ends_with('/') {
        parse_url("API_BASE_URL", raw)
    } else {
        parse_url("API_BASE_URL", &format!("{raw}/"))
    }
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| AppError::Internal(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}
