use std::error::Error as _;
use std::time::Duration;

use appdock_core::{TimeoutConfig, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use tracing::debug;

pub type ByteStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// Network seam for the manifest document and package archives. Every request
/// made through an implementation is bounded by a timeout.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    async fn fetch_text(&self, url: &str) -> Result<String, TransportError>;

    /// Opens `url` and yields its body in chunks without buffering it whole.
    async fn open_stream(&self, url: &str) -> Result<ByteStream, TransportError>;
}

#[derive(Debug, Clone)]
pub struct HttpSource {
    client: reqwest::Client,
    manifest_timeout: Duration,
    download_timeout: Duration,
}

impl HttpSource {
    pub fn new(timeouts: TimeoutConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeouts.manifest())
            .user_agent(concat!("appdock/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| TransportError::Network {
                url: String::new(),
                message: error_chain(&err),
            })?;

        Ok(Self {
            client,
            manifest_timeout: timeouts.manifest(),
            download_timeout: timeouts.download(),
        })
    }

    async fn send(&self, url: &str, timeout: Duration) -> Result<reqwest::Response, TransportError> {
        debug!(%url, ?timeout, "sending request");
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|err| classify(url, err))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl RemoteSource for HttpSource {
    async fn fetch_text(&self, url: &str) -> Result<String, TransportError> {
        let response = self.send(url, self.manifest_timeout).await?;
        response.text().await.map_err(|err| classify(url, err))
    }

    async fn open_stream(&self, url: &str) -> Result<ByteStream, TransportError> {
        let response = self.send(url, self.download_timeout).await?;
        let url = url.to_string();
        Ok(response
            .bytes_stream()
            .map(move |chunk| chunk.map_err(|err| classify(&url, err)))
            .boxed())
    }
}

fn classify(url: &str, err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        return TransportError::Timeout {
            url: url.to_string(),
        };
    }
    if let Some(status) = err.status() {
        return TransportError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        };
    }
    TransportError::Network {
        url: url.to_string(),
        message: error_chain(&err),
    }
}

fn error_chain(err: &reqwest::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
