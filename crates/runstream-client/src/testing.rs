//! Scripted backend shared by unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use futures::StreamExt as _;
use futures::stream;
use reqwest::Url;

use crate::backend::{FrameStream, StreamBackend};
use crate::errors::StreamError;
use crate::sse::SseFrame;
use crate::transport::StreamHandle;

/// Behavior of one `connect` call.
pub(crate) enum Connect {
    Fail(StreamError),
    /// Yield the frames, then end the stream.
    Frames(Vec<SseFrame>),
    /// Yield the frames, then fail with a transport error.
    FramesThenError(Vec<SseFrame>, String),
    /// Yield the frames, then stay open.
    FramesThenHang(Vec<SseFrame>),
    /// Connect never completes.
    Hang,
}

#[derive(Default)]
pub(crate) struct ScriptedBackend {
    connects: Mutex<VecDeque<Connect>>,
    post_results: Mutex<VecDeque<Result<u16, StreamError>>>,
    connect_urls: Mutex<Vec<Url>>,
    posts: Mutex<Vec<Url>>,
}

impl ScriptedBackend {
    pub(crate) fn with_connects(connects: Vec<Connect>) -> Self {
        Self {
            connects: Mutex::new(connects.into()),
            ..Self::default()
        }
    }

    pub(crate) fn push_post_result(&self, result: Result<u16, StreamError>) {
        self.post_results.lock().unwrap().push_back(result);
    }

    pub(crate) fn connect_urls(&self) -> Vec<Url> {
        self.connect_urls.lock().unwrap().clone()
    }

    pub(crate) fn posts(&self) -> Vec<Url> {
        self.posts.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl StreamBackend for ScriptedBackend {
    async fn connect(&self, url: Url) -> Result<FrameStream, StreamError> {
        self.connect_urls.lock().unwrap().push(url);
        let script = self.connects.lock().unwrap().pop_front();
        let frames: FrameStream = match script.unwrap_or(Connect::Hang) {
            Connect::Fail(err) => return Err(err),
            Connect::Frames(frames) => Box::pin(stream::iter(frames.into_iter().map(Ok))),
            Connect::FramesThenError(frames, message) => Box::pin(
                stream::iter(frames.into_iter().map(Ok))
                    .chain(stream::once(async move { Err(StreamError::transport(message)) })),
            ),
            Connect::FramesThenHang(frames) => {
                Box::pin(stream::iter(frames.into_iter().map(Ok)).chain(stream::pending()))
            }
            Connect::Hang => return futures::future::pending().await,
        };
        Ok(frames)
    }

    async fn post(&self, url: Url) -> Result<u16, StreamError> {
        self.posts.lock().unwrap().push(url);
        self.post_results.lock().unwrap().pop_front().unwrap_or(Ok(200))
    }
}

/// Named `token` frame.
pub(crate) fn token(text: &str) -> SseFrame {
    SseFrame::new("token", text)
}

/// Drains a handle until its channel closes, failing after two seconds.
pub(crate) async fn collect<E>(handle: &mut StreamHandle<E>) -> Vec<E> {
    let mut events = Vec::new();
    loop {
        match tokio::time::timeout(Duration::from_secs(2), handle.next_event()).await {
            Ok(Some(event)) => events.push(event),
            Ok(None) => return events,
            Err(_) => panic!("stream did not finish; collected {} events", events.len()),
        }
    }
}
