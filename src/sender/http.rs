use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, DATE};
use reqwest::StatusCode;
use tracing::{debug, warn};

use super::{EventSender, SendError, SendResult};
use crate::config::HttpSenderConfig;

/// Event schema version understood by the collector.
const EVENT_SCHEMA_VERSION: &str = "4";

const ANALYTICS_PATH: &str = "/bulk";
const DIAGNOSTIC_PATH: &str = "/diagnostic";

/// Delivers event payloads to the collector over HTTP.
///
/// Each call makes exactly one request.
#[derive(Debug, Clone)]
pub struct HttpEventSender {
    client: reqwest::Client,
    cfg: HttpSenderConfig,
}

impl HttpEventSender {
    pub fn new(cfg: HttpSenderConfig) -> Result<Self> {
        let mut client_builder = reqwest::Client::builder().timeout(cfg.timeout);

        if !cfg.keep_alive {
            client_builder = client_builder.pool_max_idle_per_host(0);
        }

        let client = client_builder.build().context("building HTTP client")?;

        Ok(Self { client, cfg })
    }

    async fn post(
        &self,
        url: String,
        data: Vec<u8>,
        payload_id: Option<String>,
    ) -> Result<Option<DateTime<Utc>>, SendError> {
        let raw_len = data.len();

        let mut request = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("X-Event-Schema", EVENT_SCHEMA_VERSION)
            .body(data);

        if let Some(id) = payload_id {
            request = request.header("X-Payload-ID", id);
        }

        for (k, v) in &self.cfg.headers {
            request = request.header(k.as_str(), v.as_str());
        }

        let resp = request
            .send()
            .await
            .map_err(|e| SendError::Recoverable(e.to_string()))?;

        let status = resp.status();
        let server_time = parse_server_time(resp.headers());
        // Drain body for connection reuse.
        let _ = resp.bytes().await;

        if !status.is_success() {
            return Err(classify_status(status));
        }

        debug!(url = %url, bytes = raw_len, status = %status, "delivered payload");

        Ok(server_time)
    }

    fn to_result(&self, kind: &str, outcome: Result<Option<DateTime<Utc>>, SendError>) -> SendResult {
        match outcome {
            Ok(server_time) => SendResult::ok(server_time),
            Err(e) => {
                warn!(kind, error = %e, "event delivery failed");
                SendResult::failed(e.must_shutdown())
            }
        }
    }
}

impl EventSender for HttpEventSender {
    async fn send_analytics_events(&self, data: Vec<u8>, event_count: usize, base_uri: &str) -> SendResult {
        let payload_id = uuid::Uuid::new_v4().to_string();
        debug!(events = event_count, payload_id = %payload_id, "sending analytics events");
        let outcome = self
            .post(join_uri(base_uri, ANALYTICS_PATH), data, Some(payload_id))
            .await;
        self.to_result("analytics", outcome)
    }

    async fn send_diagnostic_event(&self, data: Vec<u8>, base_uri: &str) -> SendResult {
        let outcome = self.post(join_uri(base_uri, DIAGNOSTIC_PATH), data, None).await;
        self.to_result("diagnostic", outcome)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Statuses that may succeed on a later attempt; anything else in the
/// 4xx range means the collector will keep rejecting us.
fn is_recoverable(status: StatusCode) -> bool {
    if !status.is_client_error() {
        return true;
    }
    matches!(status.as_u16(), 400 | 408 | 429)
}

fn classify_status(status: StatusCode) -> SendError {
    if is_recoverable(status) {
        SendError::Recoverable(format!("unexpected status: {status}"))
    } else {
        SendError::Unrecoverable {
            status: status.as_u16(),
        }
    }
}

fn parse_server_time(headers: &HeaderMap) -> Option<DateTime<Utc>> {
    let raw = headers.get(DATE)?.to_str().ok()?;
    DateTime::parse_from_rfc2822(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn join_uri(base: &str, path: &str) -> String {
    format!("{}{}", base.trim_end_matches('/'), path)
}
