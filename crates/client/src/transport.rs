//! HTTP transport for the sync endpoint.

use reqwest::header::CONTENT_TYPE;

use weft_core::{RecordReader, RecordWriter, SyncRequest, SyncResponse, TaskEnvelope, TaskRegistry};

use crate::error::ClientError;

pub struct SyncTransport {
    url: String,
    http: reqwest::Client,
}

impl SyncTransport {
    pub fn new(server_url: &str) -> Self {
        let base = server_url.trim_end_matches('/');
        Self {
            url: format!("{base}/sync"),
            http: reqwest::Client::new(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// One request/response round trip. `envelope` is appended after the
    /// request header when present.
    pub async fn exchange(
        &self,
        request: &SyncRequest,
        envelope: Option<&TaskEnvelope>,
        registry: &TaskRegistry,
    ) -> Result<(SyncResponse, TaskEnvelope), ClientError> {
        let mut writer = RecordWriter::new();
        writer.write(request)?;
        if let Some(envelope) = envelope {
            writer.write_envelope(envelope)?;
        }

        let resp = self
            .http
            .post(&self.url)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(writer.finish())
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(ClientError::Http { status, body });
        }

        let body = resp.bytes().await?;
        let mut reader = RecordReader::new(&body);
        let response: SyncResponse = reader.read()?;
        let envelope = reader.read_envelope(registry)?;
        Ok((response, envelope))
    }
}
