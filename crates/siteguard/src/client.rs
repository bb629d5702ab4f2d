//! HTTP client for the detection backend.
//!
//! [`BackendClient`] wraps the backend's REST contract. The poller talks to
//! it through the [`DetectionBackend`] trait so that tests can substitute a
//! scripted backend.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, trace};

use crate::catalog::CameraCatalog;
use crate::config::Config;
use crate::detection::Domain;
use crate::error::{Error, Result};

/// The backend's answer to an alert email request.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct EmailReceipt {
    /// Whether an email was sent.
    #[serde(default)]
    pub ok: bool,
    /// Human-readable outcome.
    #[serde(default)]
    pub message: Option<String>,
    /// Why nothing was sent.
    #[serde(default)]
    pub reason: Option<String>,
    /// Authoritative wait before the backend accepts another email.
    #[serde(default, rename = "retry_after", deserialize_with = "de_seconds")]
    pub retry_after: Option<Duration>,
}

fn de_seconds<'de, D>(deserializer: D) -> std::result::Result<Option<Duration>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let secs = Option::<f64>::deserialize(deserializer)?;
    Ok(secs
        .and_then(|s| Duration::try_from_secs_f64(s).ok())
        .map(|wait| wait.min(MAX_RETRY_AFTER)))
}

/// Longest wait the backend may impose on alert emails.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(60 * 60);

/// The calls a detection poller needs.
#[async_trait]
pub trait DetectionBackend: Send + Sync + std::fmt::Debug {
    /// Run one detection check on `camera_index`.
    ///
    /// A body carrying an `error` field is returned as `Ok`, whatever the
    /// HTTP status; the poller reports it as status text.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or a non-2xx response without
    /// a recognizable error body.
    async fn check(&self, domain: Domain, camera_index: u32) -> Result<Value>;

    /// Ask the backend to send the alert email for `domain`.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or an unexpected status.
    async fn send_alert_email(&self, domain: Domain, payload: Value) -> Result<EmailReceipt>;
}

/// Client for the backend's HTTP endpoints.
#[derive(Debug, Clone)]
pub struct BackendClient {
    http: Client,
    base: Url,
    timeout: Duration,
}

impl BackendClient {
    /// Create a client from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the base URL is invalid or the HTTP client cannot
    /// be built.
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(config.base_url()?, config.request_timeout())
    }

    /// Create a client for `base`.
    ///
    /// Request/response calls use `timeout`; streaming calls have none.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(mut base: Url, timeout: Duration) -> Result<Self> {
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let http = Client::builder()
            .user_agent(concat!("siteguard/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            base,
            timeout,
        })
    }

    /// The underlying HTTP client, shared with stream readers.
    #[must_use]
    pub fn http(&self) -> &Client {
        &self.http
    }

    /// Resolve `path` against the base URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the result is not a valid URL.
    pub fn endpoint(&self, path: &str) -> Result<Url> {
        let relative = path.trim_start_matches('/');
        self.base.join(relative).map_err(|e| Error::InvalidUrl {
            url: format!("{}{relative}", self.base),
            message: e.to_string(),
        })
    }

    /// URL of the MJPEG stream for `camera_index`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL cannot be built.
    pub fn video_feed_url(&self, camera_index: u32) -> Result<Url> {
        self.endpoint(&format!("video_feed/{camera_index}"))
    }

    /// URL of the push channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL cannot be built.
    pub fn events_url(&self) -> Result<Url> {
        self.endpoint("events")
    }

    /// Fetch the RTSP camera catalog.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure, non-2xx status or bad JSON.
    pub async fn rtsp_cameras(&self) -> Result<CameraCatalog> {
        let body = self.get_text("api/rtsp/cameras").await?;
        CameraCatalog::from_rtsp_json(&body)
    }

    /// Fetch the cameras assigned to a detection model.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure, non-2xx status or bad JSON.
    pub async fn model_cameras(&self, model: &str) -> Result<CameraCatalog> {
        let body = self.get_text(&format!("api/model-cameras/{model}")).await?;
        CameraCatalog::from_model_json(&body)
    }

    /// Fire a backend trigger. The resulting alert arrives on the push
    /// channel, not in the response.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or non-2xx status.
    pub async fn trigger(&self, domain: Domain) -> Result<()> {
        let url = self.endpoint(&format!("trigger/{domain}"))?;
        debug!(%url, "Firing trigger");
        let response = self.http.post(url.clone()).timeout(self.timeout).send().await?;
        ensure_success(&url, response.status())?;
        Ok(())
    }

    async fn get_text(&self, path: &str) -> Result<String> {
        let url = self.endpoint(path)?;
        trace!(%url, "GET");
        let response = self.http.get(url.clone()).timeout(self.timeout).send().await?;
        ensure_success(&url, response.status())?;
        Ok(response.text().await?)
    }
}

fn ensure_success(url: &Url, status: StatusCode) -> Result<()> {
    if status.is_success() {
        Ok(())
    } else {
        Err(Error::HttpStatus {
            url: url.to_string(),
            status: status.as_u16(),
        })
    }
}

/// Parse a check response. Error bodies win over the status code.
fn parse_check_body(url: &Url, status: StatusCode, body: &str) -> Result<Value> {
    match serde_json::from_str::<Value>(body) {
        Ok(value) if value.get("error").is_some() => Ok(value),
        Ok(value) if status.is_success() => Ok(value),
        Err(e) if status.is_success() => Err(e.into()),
        _ => Err(Error::HttpStatus {
            url: url.to_string(),
            status: status.as_u16(),
        }),
    }
}

/// Parse a `Retry-After` header given in seconds. HTTP dates are ignored.
fn parse_retry_after(value: &str) -> Option<Duration> {
    let secs = value.trim().parse::<u64>().ok()?;
    Some(Duration::from_secs(secs).min(MAX_RETRY_AFTER))
}

/// Parse an email response. 429 carries a regular receipt.
fn parse_email_body(
    url: &Url,
    status: StatusCode,
    retry_header: Option<Duration>,
    body: &str,
) -> Result<EmailReceipt> {
    if !status.is_success() && status != StatusCode::TOO_MANY_REQUESTS {
        return Err(Error::HttpStatus {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }
    let mut receipt: EmailReceipt = serde_json::from_str(body).unwrap_or_default();
    if receipt.retry_after.is_none() {
        receipt.retry_after = retry_header;
    }
    Ok(receipt)
}

#[async_trait]
impl DetectionBackend for BackendClient {
    async fn check(&self, domain: Domain, camera_index: u32) -> Result<Value> {
        let url = self.endpoint(&format!("api/demo/{domain}/check"))?;
        let response = self
            .http
            .post(url.clone())
            .timeout(self.timeout)
            .json(&json!({ "camera_index": camera_index }))
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        trace!(%domain, camera = camera_index, status = status.as_u16(), "Check response");
        parse_check_body(&url, status, &body)
    }

    async fn send_alert_email(&self, domain: Domain, payload: Value) -> Result<EmailReceipt> {
        let url = self.endpoint(&format!("api/demo/{domain}/send-alert-email"))?;
        let response = self
            .http
            .post(url.clone())
            .timeout(self.timeout)
            .json(&payload)
            .send()
            .await?;
        let status = response.status();
        let retry_header = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        let body = response.text().await?;
        parse_email_body(&url, status, retry_header, &body)
    }
}
