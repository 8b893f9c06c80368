use std::future::Future;
use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::Request;
use hyper::body::Bytes;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tracing::debug;

use crate::error::TransportError;

/// Longest slice of an error body kept in [`TransportError::Status`].
const ERROR_PREVIEW_CHARS: usize = 512;

/// Posts an XML-RPC document to an endpoint and returns the raw response body.
pub trait Transport {
    fn post(&self, url: &str, body: Bytes) -> impl Future<Output = Result<Bytes, TransportError>>;
}

/// HTTP(S) transport over hyper + rustls.
///
/// Each call is a single POST bounded by `timeout`; nothing is retried.
pub struct HttpTransport {
    client: Client<hyper_rustls::HttpsConnector<HttpConnector>, Full<Bytes>>,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Self {
        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .build();

        let client = Client::builder(TokioExecutor::new()).build(connector);

        Self { client, timeout }
    }

    async fn send(&self, url: &str, body: Bytes) -> Result<Bytes, TransportError> {
        let req = Request::builder()
            .method("POST")
            .uri(url)
            .header("Content-Type", "text/xml")
            .header(
                "User-Agent",
                concat!("rtcprobe/", env!("CARGO_PKG_VERSION")),
            )
            .body(Full::new(body))
            .map_err(|e| TransportError::Http(e.to_string()))?;

        let response = self
            .client
            .request(req)
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;

        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?
            .to_bytes();

        debug!(url = %url, status = status.as_u16(), bytes = body.len(), "XML-RPC response");

        if !status.is_success() {
            let preview: String = String::from_utf8_lossy(&body)
                .chars()
                .take(ERROR_PREVIEW_CHARS)
                .collect();
            return Err(TransportError::Status {
                status: status.as_u16(),
                body: preview,
            });
        }

        Ok(body)
    }
}

impl Transport for HttpTransport {
    async fn post(&self, url: &str, body: Bytes) -> Result<Bytes, TransportError> {
        match tokio::time::timeout(self.timeout, self.send(url, body)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(self.timeout)),
        }
    }
}
