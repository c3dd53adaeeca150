//! Delivery of record batches to the remote collector.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, warn};
use url::Url;

use crate::domain::records::LogRecord;

const SOURCE: &str = "docgen::logging::transport";
pub const METRIC_TRANSFER_TOTAL: &str = "docgen_clogs_transfer_total";

pub const LOG_ENDPOINT: &str = "api/v1/log";
pub const STDOUT_PREFIX: &str = "[clogs]";

const TOKEN_EXPIRY_SKEW: Duration = Duration::from_secs(30);
const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(300);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Result classification of one transfer attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// The collector answered with this HTTP status.
    Http(u16),
    /// Records were written locally instead of sent.
    Local,
    /// Nothing was passed in.
    NoMessages,
    /// An empty batch was passed in.
    NoBatchItems,
    /// The request failed before a status was observed.
    Unknown,
}

impl TransferStatus {
    /// Numeric code reported to operators.
    pub fn code(self) -> i32 {
        match self {
            Self::Http(status) => i32::from(status),
            Self::Local => 0,
            Self::NoMessages => -1,
            Self::NoBatchItems => -2,
            Self::Unknown => -3,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Http(_) => "http",
            Self::Local => "local",
            Self::NoMessages => "no_messages",
            Self::NoBatchItems => "no_batch_items",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOutcome {
    pub success: bool,
    pub status: TransferStatus,
}

impl TransferOutcome {
    fn new(success: bool, status: TransferStatus) -> Self {
        let outcome = if success { "success" } else { status.label() };
        counter!(METRIC_TRANSFER_TOTAL, "outcome" => outcome).increment(1);
        Self { success, status }
    }

    fn failed(status: TransferStatus) -> Self {
        Self::new(false, status)
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid collector URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("token endpoint returned status {0}")]
    TokenStatus(u16),
}

/// Sends a batch somewhere. Failures are reported in the outcome, never raised.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn xfer(&self, records: Option<&[LogRecord]>) -> TransferOutcome;
}

fn precheck(records: Option<&[LogRecord]>) -> Result<&[LogRecord], TransferOutcome> {
    match records {
        None => Err(TransferOutcome::failed(TransferStatus::NoMessages)),
        Some([]) => Err(TransferOutcome::failed(TransferStatus::NoBatchItems)),
        Some(records) => Ok(records),
    }
}

/// Connection settings for [`HttpTransport`].
#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    pub api_url: Url,
    pub token_url: Url,
    pub client_id: String,
    pub client_secret: String,
    pub timeout: Duration,
}

impl HttpTransportConfig {
    pub fn new(
        api_url: &str,
        token_url: &str,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Result<Self, TransportError> {
        Ok(Self {
            api_url: Url::parse(api_url)?,
            token_url: Url::parse(token_url)?,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    refresh_at: Instant,
}

/// OAuth2 client-credentials bearer token, cached until shortly before expiry.
#[derive(Debug)]
struct TokenProvider {
    client: Client,
    token_url: Url,
    client_id: String,
    client_secret: String,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenProvider {
    async fn token(&self) -> Result<String, TransportError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref()
            && Instant::now() < token.refresh_at
        {
            return Ok(token.value.clone());
        }

        let response = self
            .client
            .post(self.token_url.clone())
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(TransportError::TokenStatus(response.status().as_u16()));
        }

        let body: TokenResponse = response.json().await?;
        let lifetime = body
            .expires_in
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TOKEN_LIFETIME);
        let refresh_at = Instant::now() + lifetime.saturating_sub(TOKEN_EXPIRY_SKEW);

        debug!(
            target = SOURCE,
            op = "token.refresh",
            result = "ok",
            lifetime_secs = lifetime.as_secs(),
            "Fetched collector token"
        );

        *cached = Some(CachedToken {
            value: body.access_token.clone(),
            refresh_at,
        });
        Ok(body.access_token)
    }

    async fn invalidate(&self) {
        self.cached.lock().await.take();
    }
}

/// Posts batches as a JSON array to `{api_url}/api/v1/log`. 201 is success.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    endpoint: Url,
    tokens: Arc<TokenProvider>,
}

impl HttpTransport {
    pub fn new(config: HttpTransportConfig) -> Result<Self, TransportError> {
        let client = Client::builder()
            .user_agent(concat!("docgen/", env!("CARGO_PKG_VERSION")))
            .timeout(config.timeout)
            .build()?;
        let endpoint = with_trailing_slash(config.api_url).join(LOG_ENDPOINT)?;

        Ok(Self {
            tokens: Arc::new(TokenProvider {
                client: client.clone(),
                token_url: config.token_url,
                client_id: config.client_id,
                client_secret: config.client_secret,
                cached: Mutex::new(None),
            }),
            client,
            endpoint,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    async fn send(&self, records: &[LogRecord]) -> Result<StatusCode, TransportError> {
        let token = self.tokens.token().await?;
        let response = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(token)
            .json(records)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            self.tokens.invalidate().await;
        }
        Ok(status)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn xfer(&self, records: Option<&[LogRecord]>) -> TransferOutcome {
        let records = match precheck(records) {
            Ok(records) => records,
            Err(outcome) => return outcome,
        };

        match self.send(records).await {
            Ok(StatusCode::CREATED) => {
                debug!(
                    target = SOURCE,
                    op = "xfer",
                    result = "ok",
                    records = records.len(),
                    "Delivered log batch"
                );
                TransferOutcome::new(true, TransferStatus::Http(StatusCode::CREATED.as_u16()))
            }
            Ok(status) => {
                warn!(
                    target = SOURCE,
                    op = "xfer",
                    result = "rejected",
                    status = status.as_u16(),
                    records = records.len(),
                    "Collector rejected log batch"
                );
                TransferOutcome::failed(TransferStatus::Http(status.as_u16()))
            }
            Err(err) => {
                error!(
                    target = SOURCE,
                    op = "xfer",
                    result = "error",
                    records = records.len(),
                    error = %err,
                    "Failed to deliver log batch"
                );
                TransferOutcome::failed(TransferStatus::Unknown)
            }
        }
    }
}

fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

/// Writes each record as a `[clogs]` line on stdout.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdoutTransport;

impl StdoutTransport {
    fn write_to<W: Write>(records: &[LogRecord], out: &mut W) -> std::io::Result<()> {
        for record in records {
            writeln!(out, "{STDOUT_PREFIX} {}", record.display_line())?;
        }
        out.flush()
    }
}

#[async_trait]
impl Transport for StdoutTransport {
    async fn xfer(&self, records: Option<&[LogRecord]>) -> TransferOutcome {
        let records = match precheck(records) {
            Ok(records) => records,
            Err(outcome) => return outcome,
        };

        let written = {
            let mut stdout = std::io::stdout().lock();
            Self::write_to(records, &mut stdout)
        };
        match written {
            Ok(()) => TransferOutcome::new(true, TransferStatus::Local),
            Err(err) => {
                error!(
                    target = SOURCE,
                    op = "xfer.stdout",
                    result = "error",
                    error = %err,
                    "Failed to write log batch"
                );
                TransferOutcome::failed(TransferStatus::Unknown)
            }
        }
    }
}
