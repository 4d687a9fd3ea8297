use std::collections::VecDeque;
use std::pin::Pin;

use futures::StreamExt as _;
use futures::stream;
use reqwest::Url;
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use tracing::debug;

use crate::config::ClientConfig;
use crate::errors::StreamError;
use crate::sse::{SseDecoder, SseFrame};

/// Decoded frames of one open connection. Ends when the server closes it.
pub type FrameStream = Pin<Box<dyn futures::Stream<Item = Result<SseFrame, StreamError>> + Send>>;

type ByteStream =
    Pin<Box<dyn futures::Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static>>;

/// Network seam of the transport.
///
/// The transport owns dedup, resume and retry; a backend only opens one
/// connection or sends one request per call.
#[async_trait::async_trait]
pub trait StreamBackend: Send + Sync + 'static {
    /// Opens an event stream. Fails on network errors and non-2xx handshakes.
    async fn connect(&self, url: Url) -> Result<FrameStream, StreamError>;

    /// Sends a body-less POST and returns the response status.
    async fn post(&self, url: Url) -> Result<u16, StreamError>;
}

/// `reqwest` implementation of `StreamBackend`.
pub struct HttpBackend {
    stream_client: reqwest::Client,
    request_client: reqwest::Client,
}

impl HttpBackend {
    pub fn new(config: &ClientConfig) -> Result<Self, StreamError> {
        let stream_client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| StreamError::Config(format!("failed to build stream client: {e}")))?;
        let request_client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| StreamError::Config(format!("failed to build request client: {e}")))?;
        Ok(Self {
            stream_client,
            request_client,
        })
    }
}

#[async_trait::async_trait]
impl StreamBackend for HttpBackend {
    async fn connect(&self, url: Url) -> Result<FrameStream, StreamError> {
        debug!(%url, "connecting event stream");
        let response = self
            .stream_client
            .get(url)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .send()
            .await
            .map_err(|e| StreamError::transport(format!("stream request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(StreamError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let bytes_stream: ByteStream = Box::pin(response.bytes_stream());
        Ok(Box::pin(sse_frame_stream(bytes_stream)))
    }

    async fn post(&self, url: Url) -> Result<u16, StreamError> {
        let response = self
            .request_client
            .post(url)
            .send()
            .await
            .map_err(|e| StreamError::transport(format!("request failed: {e}")))?;
        Ok(response.status().as_u16())
    }
}

fn sse_frame_stream(
    bytes_stream: ByteStream,
) -> impl futures::Stream<Item = Result<SseFrame, StreamError>> + Send {
    struct State {
        bytes_stream: ByteStream,
        decoder: SseDecoder,
        pending: VecDeque<SseFrame>,
        done: bool,
    }

    stream::try_unfold(
        State {
            bytes_stream,
            decoder: SseDecoder::default(),
            pending: VecDeque::new(),
            done: false,
        },
        |mut state| async move {
            loop {
                if let Some(frame) = state.pending.pop_front() {
                    return Ok(Some((frame, state)));
                }
                if state.done {
                    return Ok(None);
                }

                match state.bytes_stream.next().await {
                    Some(Ok(chunk)) => {
                        state.pending.extend(state.decoder.push_chunk(&chunk)?);
                    }
                    Some(Err(e)) => {
                        return Err(StreamError::transport(format!(
                            "event stream read failed: {e}"
                        )));
                    }
                    None => {
                        state.done = true;
                    }
                }
            }
        },
    )
}
