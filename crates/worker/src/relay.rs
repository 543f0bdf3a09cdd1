//! HTTP relay transport.
//!
//! Each rendered message is POSTed as JSON to
//! `{base_url}/destinations/{destination_id}/messages`. The relay owns the
//! provider credentials and MIME assembly; any 2xx counts as accepted.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use serde::Serialize;

use courier_core::{DestinationId, EntryId, TenantId};
use courier_infra::queue::QueueEntry;
use courier_infra::{SendFailure, Transport};

/// Longest response body echoed into an entry's error message.
const MAX_ERROR_BODY: usize = 200;

#[derive(Debug, Serialize)]
struct RelayMessage<'a> {
    entry_id: EntryId,
    tenant_id: TenantId,
    destination_id: &'a DestinationId,
    to: &'a str,
    from_address: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    from_name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_to: Option<&'a str>,
    subject: &'a str,
    html_body: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    text_body: Option<&'a str>,
    headers: &'a [(String, String)],
}

impl<'a> From<&'a QueueEntry> for RelayMessage<'a> {
    fn from(entry: &'a QueueEntry) -> Self {
        let payload = &entry.payload;
        Self {
            entry_id: entry.id,
            tenant_id: entry.tenant_id,
            destination_id: &entry.destination_id,
            to: &entry.recipient,
            from_address: &payload.from_address,
            from_name: payload.from_name.as_deref(),
            reply_to: payload.reply_to.as_deref(),
            subject: &payload.subject,
            html_body: &payload.html_body,
            text_body: payload.text_body.as_deref(),
            headers: &payload.headers,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("invalid relay url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("building relay client: {0}")]
    Client(#[from] reqwest::Error),
}

pub struct HttpRelayTransport {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpRelayTransport {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, RelayError> {
        let invalid = |reason: String| RelayError::InvalidUrl {
            url: base_url.to_string(),
            reason,
        };
        let parsed = Url::parse(base_url).map_err(|e| invalid(e.to_string()))?;
        if parsed.cannot_be_a_base() {
            return Err(invalid("not a base url".to_string()));
        }

        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: parsed,
        })
    }

    /// `{base}/destinations/{destination}/messages` with the destination as a
    /// single escaped path segment.
    fn endpoint(&self, destination: &DestinationId) -> Result<Url, SendFailure> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| SendFailure::new("relay url cannot carry a path"))?
            .pop_if_empty()
            .extend(["destinations", destination.as_str(), "messages"]);
        Ok(url)
    }
}

#[async_trait]
impl Transport for HttpRelayTransport {
    async fn send(&self, entry: &QueueEntry) -> Result<(), SendFailure> {
        let response = self
            .client
            .post(self.endpoint(&entry.destination_id)?)
            .json(&RelayMessage::from(entry))
            .send()
            .await
            .map_err(|e| SendFailure::new(format!("relay unreachable: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        let body: String = body.trim().chars().take(MAX_ERROR_BODY).collect();
        Err(SendFailure::new(if body.is_empty() {
            format!("relay rejected message: {status}")
        } else {
            format!("relay rejected message: {status}: {body}")
        }))
    }
}
