use crate::error::{SessionError, SessionResult};
use crate::protocol::StreamRequest;
use futures::{Stream, StreamExt};
use reqwest::Client as HttpClient;
use reqwest::header::ACCEPT;
use std::future::Future;
use std::pin::Pin;
use tracing::debug;

/// Raw body chunks of one streamed response.
pub type ByteStream = Pin<Box<dyn Stream<Item = SessionResult<Vec<u8>>> + Send>>;

/// Opens one event stream per request.
pub trait Transport: Send + Sync {
    fn open(
        &self,
        request: StreamRequest,
    ) -> impl Future<Output = SessionResult<ByteStream>> + Send;
}

/// Speaks to the backend over HTTP, reading `text/event-stream` bodies.
#[derive(Clone)]
pub struct HttpTransport {
    base_url: String,
    token: Option<String>,
    http: HttpClient,
}

impl HttpTransport {
    pub fn new(base_url: &str, token: Option<String>) -> Self {
        Self {
            base_url: normalize_base_url(base_url),
            token,
            http: HttpClient::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl Transport for HttpTransport {
    async fn open(&self, request: StreamRequest) -> SessionResult<ByteStream> {
        let url = format!("{}{}", self.base_url, request.path());
        debug!(%url, "opening event stream");

        let mut builder = self.http.post(&url).header(ACCEPT, "text/event-stream");
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        builder = match &request {
            StreamRequest::Ask(body) | StreamRequest::Agent(body) => builder.json(body),
            StreamRequest::Confirm(body) => builder.json(body),
        };

        let response = builder.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SessionError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(SessionError::from));
        Ok(Box::pin(stream))
    }
}

fn normalize_base_url(value: &str) -> String {
    value.trim_end_matches('/').to_string()
}
