//! Default [`GatewayTransport`] implementation over `reqwest`.

use super::{
    CreateInboxOptions, CreateInboxResult, EventStream, GatewayTransport, InboxSyncResult,
    RawEmailRecord, RawEmailSource, ServerInfo, StreamEvent,
};
use crate::email::EmailMetadata;
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::{header::RETRY_AFTER, Client, Response};
use std::pin::Pin;
use std::time::Duration;

/// Push-stream records carry only ids, but the scanner must still
/// tolerate well-formed records up to this size before treating the
/// stream as misbehaving (§4.3).
const MAX_EVENT_RECORD_BYTES: usize = 1024 * 1024;

/// Production transport. Owns a single `reqwest::Client` used for
/// both REST calls and the event stream, satisfying the "HTTP client
/// reuse" rule of §4.3.
#[derive(Clone)]
pub struct HttpGatewayTransport {
    http: Client,
    base_url: String,
    api_key: String,
}

impl HttpGatewayTransport {
    /// # Errors
    ///
    /// Returns [`Error::Network`] if the underlying `reqwest::Client`
    /// cannot be built.
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            api_key: api_key.into(),
        })
    }

    /// Build a transport around a caller-supplied client, e.g. one
    /// configured with custom TLS or a proxy.
    #[must_use]
    pub fn with_client(base_url: impl Into<String>, api_key: impl Into<String>, http: Client) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url.trim_end_matches('/'))
    }
}

enum ErrorContext {
    None,
    Inbox(String),
    Email(String),
}

async fn check_status(response: Response, context: ErrorContext) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after_secs = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    let body = response.text().await.unwrap_or_default();

    Err(match status.as_u16() {
        401 => Error::Unauthorized,
        404 => match context {
            ErrorContext::Inbox(addr) => Error::InboxNotFound(addr),
            ErrorContext::Email(id) => Error::EmailNotFound(id),
            ErrorContext::None => Error::Api {
                status: 404,
                message: body,
            },
        },
        409 => Error::AlreadyExists(body),
        429 => Error::RateLimited { retry_after_secs },
        other => Error::Api {
            status: other,
            message: body,
        },
    })
}

#[async_trait]
impl GatewayTransport for HttpGatewayTransport {
    async fn check_key(&self) -> Result<()> {
        let response = self
            .http
            .get(self.url("/v1/auth/check"))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        check_status(response, ErrorContext::None).await?;
        Ok(())
    }

    async fn get_server_info(&self) -> Result<ServerInfo> {
        let response = self
            .http
            .get(self.url("/v1/server-info"))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        let response = check_status(response, ErrorContext::None).await?;
        Ok(response.json().await?)
    }

    async fn create_inbox(&self, opts: CreateInboxOptions) -> Result<CreateInboxResult> {
        #[derive(serde::Serialize)]
        struct Body {
            #[serde(skip_serializing_if = "Option::is_none")]
            ttl_secs: Option<u64>,
            #[serde(skip_serializing_if = "Option::is_none")]
            email_address: Option<String>,
            #[serde(rename = "kemPublicKey", skip_serializing_if = "Option::is_none")]
            kem_public_key: Option<String>,
        }

        let body = Body {
            ttl_secs: opts.ttl_secs,
            email_address: opts.email_address,
            kem_public_key: opts.kem_public_key.as_deref().map(crate::b64::encode),
        };

        let response = self
            .http
            .post(self.url("/v1/inboxes"))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let response = check_status(response, ErrorContext::None).await?;
        Ok(response.json().await?)
    }

    async fn get_inbox_sync(&self, email_address: &str) -> Result<InboxSyncResult> {
        let response = self
            .http
            .get(self.url(&format!("/v1/inboxes/{email_address}/sync")))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        let response = check_status(response, ErrorContext::Inbox(email_address.to_string())).await?;
        Ok(response.json().await?)
    }

    async fn get_emails(&self, email_address: &str, include_content: bool) -> Result<Vec<EmailMetadata>> {
        let response = self
            .http
            .get(self.url(&format!("/v1/inboxes/{email_address}/emails")))
            .bearer_auth(&self.api_key)
            .query(&[("includeContent", include_content.to_string())])
            .send()
            .await?;
        let response = check_status(response, ErrorContext::Inbox(email_address.to_string())).await?;
        Ok(response.json().await?)
    }

    async fn get_email(&self, email_address: &str, email_id: &str) -> Result<RawEmailRecord> {
        let response = self
            .http
            .get(self.url(&format!("/v1/inboxes/{email_address}/emails/{email_id}")))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        let response = check_status(response, ErrorContext::Email(email_id.to_string())).await?;
        Ok(response.json().await?)
    }

    async fn get_email_raw(&self, email_address: &str, email_id: &str) -> Result<RawEmailSource> {
        let response = self
            .http
            .get(self.url(&format!("/v1/inboxes/{email_address}/emails/{email_id}/raw")))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        let response = check_status(response, ErrorContext::Email(email_id.to_string())).await?;
        Ok(response.json().await?)
    }

    async fn delete_inbox_by_email(&self, email_address: &str) -> Result<()> {
        let response = self
            .http
            .delete(self.url(&format!("/v1/inboxes/{email_address}")))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        check_status(response, ErrorContext::Inbox(email_address.to_string())).await?;
        Ok(())
    }

    async fn delete_all_inboxes(&self) -> Result<()> {
        let response = self
            .http
            .delete(self.url("/v1/inboxes"))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        check_status(response, ErrorContext::None).await?;
        Ok(())
    }

    async fn mark_email_as_read(&self, email_address: &str, email_id: &str) -> Result<()> {
        let response = self
            .http
            .post(self.url(&format!(
                "/v1/inboxes/{email_address}/emails/{email_id}/read"
            )))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        check_status(response, ErrorContext::Email(email_id.to_string())).await?;
        Ok(())
    }

    async fn delete_email(&self, email_address: &str, email_id: &str) -> Result<()> {
        let response = self
            .http
            .delete(self.url(&format!("/v1/inboxes/{email_address}/emails/{email_id}")))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        check_status(response, ErrorContext::Email(email_id.to_string())).await?;
        Ok(())
    }

    async fn open_event_stream(&self, initial_inbox_hashes: Vec<String>) -> Result<EventStream> {
        let mut request = self
            .http
            .get(self.url("/v1/events"))
            .bearer_auth(&self.api_key);
        if !initial_inbox_hashes.is_empty() {
            request = request.query(&[("inboxes", initial_inbox_hashes.join(","))]);
        }

        let response = request.send().await?;
        let response = check_status(response, ErrorContext::None).await?;

        let byte_stream: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>> =
            Box::pin(response.bytes_stream());

        let state = LineScanState {
            buffer: Vec::new(),
            byte_stream,
        };

        let stream = futures::stream::unfold(state, |mut state| async move {
            loop {
                if let Some(record) = state.take_record() {
                    return Some((parse_record(&record), state));
                }
                if state.buffer.len() > MAX_EVENT_RECORD_BYTES {
                    return Some((
                        Err(Error::Stream("event record exceeded 1 MiB limit".to_string())),
                        state,
                    ));
                }
                match state.byte_stream.next().await {
                    Some(Ok(bytes)) => state.buffer.extend_from_slice(&bytes),
                    Some(Err(e)) => return Some((Err(Error::Network(e)), state)),
                    None => return None,
                }
            }
        });

        Ok(Box::pin(stream))
    }
}

struct LineScanState {
    buffer: Vec<u8>,
    byte_stream: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>,
}

impl LineScanState {
    /// Pull one blank-line-terminated record out of the buffer, if a
    /// full one is present.
    fn take_record(&mut self) -> Option<Vec<u8>> {
        let pos = self.buffer.windows(2).position(|w| w == b"\n\n")?;
        let record = self.buffer[..pos].to_vec();
        self.buffer.drain(..pos + 2);
        Some(record)
    }
}

/// Parse a record's `field: value` lines into a [`StreamEvent`].
fn parse_record(record: &[u8]) -> Result<StreamEvent> {
    let text = String::from_utf8_lossy(record);
    let mut inbox_hash = None;
    let mut email_id = None;

    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        if let Some((field, value)) = line.split_once(':') {
            match field.trim() {
                "inboxId" => inbox_hash = Some(value.trim().to_string()),
                "emailId" => email_id = Some(value.trim().to_string()),
                _ => {}
            }
        }
    }

    match (inbox_hash, email_id) {
        (Some(inbox_hash), Some(email_id)) => Ok(StreamEvent { inbox_hash, email_id }),
        _ => Err(Error::Stream("event record missing inboxId/emailId".to_string())),
    }
}
