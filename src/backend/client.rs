//! HTTP client for the message store and attachment storage
//!
//! Wraps reqwest::Client with the store's URL layout and maps transport
//! failures onto [`SyncError`] at the trait boundary.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use url::Url;

use super::{attachment_name, AttachmentService, ConversationId, Persistence};
use crate::config::Config;
use crate::models::MessageRecord;
use crate::sync::SyncError;

/// Response body of an attachment upload.
#[derive(Debug, Deserialize)]
struct UploadResponse {
    url: String,
}

/// Client for the store's HTTP API.
pub struct StoreClient {
    http: reqwest::Client,
    base: Url,
}

impl StoreClient {
    /// Build a client for the configured store URL.
    pub fn new(config: &Config) -> Result<Self> {
        let raw = config
            .backend
            .store_url
            .as_deref()
            .context("No store URL configured. Run 'chat-sync config --store-url <url>'.")?;
        Self::with_base(raw)
    }

    pub fn with_base(base: &str) -> Result<Self> {
        let mut base = Url::parse(base).with_context(|| format!("Invalid store URL {}", base))?;
        // Url::join drops the last path segment unless it ends with '/'.
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self {
            http: reqwest::Client::new(),
            base,
        })
    }

    fn messages_url(&self, conversation: &ConversationId) -> Result<Url> {
        self.base
            .join(&format!("conversations/{}/messages", conversation))
            .context("Failed to build messages URL")
    }

    fn attachment_url(&self, conversation: &ConversationId, name: &str) -> Result<Url> {
        self.base
            .join(&format!("conversations/{}/attachments/{}", conversation, name))
            .context("Failed to build attachment URL")
    }

    /// POST a message record.
    pub async fn post_record(&self, conversation: &ConversationId, record: &MessageRecord) -> Result<()> {
        let url = self.messages_url(conversation)?;
        tracing::debug!("Store POST {}", url);

        let resp = self
            .http
            .post(url.clone())
            .json(record)
            .send()
            .await
            .with_context(|| format!("Store POST {} failed", url))?;

        check_response(resp, url.as_str()).await?;
        Ok(())
    }

    /// POST image bytes, returning the reference URL the store assigned.
    pub async fn post_attachment(&self, conversation: &ConversationId, bytes: Vec<u8>) -> Result<Url> {
        let url = self.attachment_url(conversation, &attachment_name())?;
        tracing::debug!("Attachment POST {} ({} bytes)", url, bytes.len());

        let resp = self
            .http
            .post(url.clone())
            .header(reqwest::header::CONTENT_TYPE, "image/jpeg")
            .body(bytes)
            .send()
            .await
            .with_context(|| format!("Attachment POST {} failed", url))?;

        let resp = check_response(resp, url.as_str()).await?;
        let body: UploadResponse = resp
            .json()
            .await
            .context("Failed to parse upload response")?;
        Url::parse(&body.url).with_context(|| format!("Store returned invalid URL {}", body.url))
    }

    /// GET attachment bytes, aborting once the body exceeds `max_bytes`.
    pub async fn get_attachment(&self, url: &Url, max_bytes: usize) -> Result<Vec<u8>> {
        tracing::debug!("Attachment GET {}", url);

        let resp = self
            .http
            .get(url.clone())
            .send()
            .await
            .with_context(|| format!("Attachment GET {} failed", url))?;
        let mut resp = check_response(resp, url.as_str()).await?;

        if let Some(len) = resp.content_length() {
            if len as usize > max_bytes {
                bail!("Attachment {} is {} bytes, limit is {}", url, len, max_bytes);
            }
        }

        let mut bytes = Vec::new();
        while let Some(chunk) = resp
            .chunk()
            .await
            .with_context(|| format!("Reading attachment {} failed", url))?
        {
            if bytes.len() + chunk.len() > max_bytes {
                bail!("Attachment {} exceeds limit of {} bytes", url, max_bytes);
            }
            bytes.extend_from_slice(&chunk);
        }

        if bytes.is_empty() {
            bail!("Attachment {} is empty", url);
        }
        Ok(bytes)
    }
}

#[async_trait]
impl Persistence for StoreClient {
    async fn append(&self, conversation: &ConversationId, record: MessageRecord) -> Result<(), SyncError> {
        self.post_record(conversation, &record)
            .await
            .map_err(|e| SyncError::PersistenceFailure(format!("{:#}", e)))
    }
}

#[async_trait]
impl AttachmentService for StoreClient {
    async fn upload(&self, conversation: &ConversationId, bytes: Vec<u8>) -> Result<Url, SyncError> {
        self.post_attachment(conversation, bytes)
            .await
            .map_err(|e| SyncError::UploadFailure(format!("{:#}", e)))
    }

    async fn download(&self, url: &Url, max_bytes: usize) -> Result<Vec<u8>, SyncError> {
        self.get_attachment(url, max_bytes)
            .await
            .map_err(|e| SyncError::DownloadFailure(format!("{:#}", e)))
    }
}

/// Check HTTP response status code and return a clear error on failure.
async fn check_response(resp: reqwest::Response, url: &str) -> Result<reqwest::Response> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        bail!("HTTP {} for {}: {}", status.as_u16(), url, body);
    }
    Ok(resp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned HTTP response on a local port and return its URL.
    async fn serve_once(response: Vec<u8>) -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            socket.write_all(&response).await.unwrap();
            socket.shutdown().await.ok();
        });
        Url::parse(&format!("http://{}/blob", addr)).unwrap()
    }

    fn response(headers: &str, body: &[u8]) -> Vec<u8> {
        let mut out = format!("HTTP/1.1 200 OK\r\nConnection: close\r\n{}\r\n", headers).into_bytes();
        out.extend_from_slice(body);
        out
    }

    #[tokio::test]
    async fn test_download_within_limit() {
        let url = serve_once(response("Content-Length: 3\r\n", b"abc")).await;
        let client = StoreClient::with_base("http://127.0.0.1:9").unwrap();
        let bytes = tokio_test::assert_ok!(client.download(&url, 16).await);
        assert_eq!(bytes, b"abc");
    }

    #[tokio::test]
    async fn test_download_rejects_large_content_length() {
        let url = serve_once(response("Content-Length: 10\r\n", &[7u8; 10])).await;
        let client = StoreClient::with_base("http://127.0.0.1:9").unwrap();
        let result = client.download(&url, 4).await;
        assert!(matches!(result, Err(SyncError::DownloadFailure(_))));
    }

    #[tokio::test]
    async fn test_download_rejects_oversized_chunked_body() {
        // No Content-Length: the cap has to trip while streaming.
        let body = b"3\r\nabc\r\n3\r\ndef\r\n3\r\nghi\r\n0\r\n\r\n";
        let url = serve_once(response("Transfer-Encoding: chunked\r\n", body)).await;
        let client = StoreClient::with_base("http://127.0.0.1:9").unwrap();
        match client.download(&url, 5).await {
            Err(SyncError::DownloadFailure(msg)) => assert!(msg.contains("exceeds limit"), "{}", msg),
            other => panic!("expected download failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_download_rejects_empty_body() {
        let url = serve_once(response("Content-Length: 0\r\n", b"")).await;
        let client = StoreClient::with_base("http://127.0.0.1:9").unwrap();
        match client.download(&url, 16).await {
            Err(SyncError::DownloadFailure(msg)) => assert!(msg.contains("empty"), "{}", msg),
            other => panic!("expected download failure, got {:?}", other),
        }
    }

    #[test]
    fn test_url_layout() {
        let client = StoreClient::with_base("https://store.example.com/api").unwrap();
        let conv = ConversationId::new("general");
        assert_eq!(
            client.messages_url(&conv).unwrap().as_str(),
            "https://store.example.com/api/conversations/general/messages"
        );
        assert_eq!(
            client.attachment_url(&conv, "abc123").unwrap().as_str(),
            "https://store.example.com/api/conversations/general/attachments/abc123"
        );
    }

    #[test]
    fn test_missing_store_url() {
        let config = Config::default();
        assert!(StoreClient::new(&config).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_store_maps_to_persistence_failure() {
        // Port 9 (discard) on localhost is normally closed.
        let client = StoreClient::with_base("http://127.0.0.1:9").unwrap();
        let record = MessageRecord {
            sender_id: "a".to_string(),
            display_name: "A".to_string(),
            created: 1,
            content: Some("x".to_string()),
            image_ref: None,
        };
        let result = client.append(&ConversationId::new("c"), record).await;
        assert!(matches!(result, Err(SyncError::PersistenceFailure(_))));
    }
}
