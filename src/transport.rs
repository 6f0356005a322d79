// file: src/transport.rs
// description: push (SSE) and poll transports for the decisions API
// reference: GET /decisions/stream, GET /decisions/events

use crate::{
    config::ApiConfig,
    error::{FeedError, FeedResult},
    sse::{SseDecoder, SseFrame},
    types::{Event, EventId, PollResponse},
};
use async_trait::async_trait;
use futures_util::{StreamExt, stream::BoxStream};
use reqwest::{StatusCode, header};
use std::{sync::Arc, time::Duration};
use tracing::{debug, trace};
use url::Url;

pub type FrameStream = BoxStream<'static, FeedResult<SseFrame>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollQuery {
    pub after_id: EventId,
    pub limit: u32,
    pub portfolio_id: Option<i64>,
}

/// Long-lived server push subscription.
#[async_trait]
pub trait PushTransport: Send + Sync {
    /// Opens one subscription. `after_id` is a hint; the server may resend.
    /// Returns `PushUnavailable` when the server does not offer streaming.
    async fn open(
        &self,
        portfolio_id: Option<i64>,
        after_id: Option<&EventId>,
    ) -> FeedResult<FrameStream>;

    fn describe(&self) -> String;
}

#[async_trait]
pub trait PollTransport: Send + Sync {
    async fn fetch(&self, query: &PollQuery) -> FeedResult<Vec<Event>>;
}

/// Pair of transports handed to a client. `push: None` means streaming is
/// not supported and the client goes straight to polling.
#[derive(Clone)]
pub struct Transports {
    pub push: Option<Arc<dyn PushTransport>>,
    pub poll: Arc<dyn PollTransport>,
}

impl Transports {
    pub fn http(api: &ApiConfig) -> FeedResult<Self> {
        let http = Arc::new(HttpTransport::new(api)?);
        Ok(Self {
            push: Some(http.clone()),
            poll: http,
        })
    }
}

pub struct HttpTransport {
    http: reqwest::Client,
    base_url: Url,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(api: &ApiConfig) -> FeedResult<Self> {
        // No client-wide timeout: it would also cut long-lived streams.
        let http = reqwest::Client::builder()
            .connect_timeout(api.timeout)
            .user_agent(concat!("mip-live-feed/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            base_url: api.base_url.clone(),
            timeout: api.timeout,
        })
    }

    pub fn endpoint(&self, segments: &[&str]) -> FeedResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| FeedError::UrlError(url::ParseError::RelativeUrlWithCannotBeABaseBase))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn stream_request(
        &self,
        portfolio_id: Option<i64>,
        after_id: Option<&EventId>,
    ) -> FeedResult<reqwest::Request> {
        let url = self.endpoint(&["decisions", "stream"])?;
        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(id) = portfolio_id {
            query.push(("portfolio_id", id.to_string()));
        }
        if let Some(after) = after_id {
            query.push(("after_id", after.to_string()));
        }

        Ok(self
            .http
            .get(url)
            .query(&query)
            .header(header::ACCEPT, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .build()?)
    }

    // Streams have no overall deadline; polls carry the request timeout.
    fn poll_request(&self, query: &PollQuery) -> FeedResult<reqwest::Request> {
        let url = self.endpoint(&["decisions", "events"])?;
        let mut params: Vec<(&str, String)> = vec![
            ("limit", query.limit.to_string()),
            ("after_id", query.after_id.to_string()),
        ];
        if let Some(id) = query.portfolio_id {
            params.push(("portfolio_id", id.to_string()));
        }

        Ok(self
            .http
            .get(url)
            .query(&params)
            .timeout(self.timeout)
            .build()?)
    }
}

fn map_http_error(error: reqwest::Error) -> FeedError {
    if error.is_timeout() {
        FeedError::Timeout
    } else {
        FeedError::HttpError(error)
    }
}

/// Decides whether a stream response can be consumed. Answers that mean
/// the server has no stream endpoint map to `PushUnavailable`, which sends
/// the client to polling; other failures are retried.
pub fn check_stream_response(
    endpoint: &Url,
    status: StatusCode,
    content_type: Option<&str>,
) -> FeedResult<()> {
    if matches!(
        status,
        StatusCode::NOT_FOUND | StatusCode::METHOD_NOT_ALLOWED | StatusCode::NOT_IMPLEMENTED
    ) {
        return Err(FeedError::PushUnavailable {
            reason: format!("{endpoint} answered {status}"),
        });
    }
    if !status.is_success() {
        return Err(FeedError::UnexpectedStatus {
            status: status.as_u16(),
            endpoint: endpoint.to_string(),
        });
    }

    let content_type = content_type.unwrap_or_default();
    if !content_type.trim_start().to_ascii_lowercase().starts_with("text/event-stream") {
        return Err(FeedError::PushUnavailable {
            reason: format!("{endpoint} returned content type '{content_type}'"),
        });
    }
    Ok(())
}

#[async_trait]
impl PushTransport for HttpTransport {
    async fn open(
        &self,
        portfolio_id: Option<i64>,
        after_id: Option<&EventId>,
    ) -> FeedResult<FrameStream> {
        let request = self.stream_request(portfolio_id, after_id)?;
        let url = request.url().clone();

        debug!(%url, ?portfolio_id, "opening event stream");
        let response = self.http.execute(request).await.map_err(map_http_error)?;

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok());
        check_stream_response(&url, response.status(), content_type)?;

        let mut decoder = SseDecoder::new();
        let frames = response.bytes_stream().flat_map(move |chunk| {
            let items: Vec<FeedResult<SseFrame>> = match chunk {
                Ok(bytes) => {
                    trace!(bytes = bytes.len(), "stream chunk");
                    decoder.feed(&bytes).into_iter().map(Ok).collect()
                }
                Err(e) => vec![Err(map_http_error(e))],
            };
            futures_util::stream::iter(items)
        });

        Ok(frames.boxed())
    }

    fn describe(&self) -> String {
        self.endpoint(&["decisions", "stream"])
            .map(|url| url.to_string())
            .unwrap_or_else(|_| self.base_url.to_string())
    }
}

#[async_trait]
impl PollTransport for HttpTransport {
    async fn fetch(&self, query: &PollQuery) -> FeedResult<Vec<Event>> {
        let request = self.poll_request(query)?;
        let url = request.url().clone();
        let response = self.http.execute(request).await.map_err(map_http_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FeedError::UnexpectedStatus {
                status: status.as_u16(),
                endpoint: url.to_string(),
            });
        }

        let body: PollResponse = response.json().await.map_err(map_http_error)?;
        trace!(events = body.events.len(), after_id = %query.after_id, "poll page received");
        Ok(body.events)
    }
}
