//! Docker engine event feed
//!
//! Streams container start events from `GET /events` over the Docker API
//! socket. The response is a never-ending body of newline-delimited JSON
//! objects, read frame by frame.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use certwarden_config::DockerEndpoint;
use chrono::Utc;
use http::{header, Method, Request, StatusCode};
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use thiserror::Error;
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// How far back the feed replays events on connect
pub const REPLAY_WINDOW_SECS: i64 = 3600;

/// Longest event line buffered before it is skipped
pub const MAX_EVENT_LINE: usize = 1024 * 1024;

/// Only container start events are requested
const EVENT_FILTERS: &str = r#"{"type":["container"],"event":["start"]}"#;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("failed to connect to docker at {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("docker API transport error: {0}")]
    Http(#[from] hyper::Error),

    #[error("invalid docker API request: {0}")]
    Request(#[from] http::Error),

    #[error("docker API returned {0}")]
    Status(StatusCode),

    #[error("unix sockets are not supported on this platform")]
    UnsupportedTransport,
}

/// The part of a Docker event the watcher needs
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContainerEvent {
    #[serde(rename = "Type", default)]
    pub kind: String,
    #[serde(rename = "Action", default)]
    pub action: String,
    #[serde(rename = "Actor", default)]
    pub actor: EventActor,
}

/// Container identity and its labels
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventActor {
    #[serde(rename = "ID", default)]
    pub id: String,
    /// Container labels merged with `name` and `image`
    #[serde(rename = "Attributes", default)]
    pub attributes: HashMap<String, String>,
}

impl ContainerEvent {
    /// Container name, falling back to a short id
    pub fn container_name(&self) -> &str {
        self.actor
            .attributes
            .get("name")
            .map(String::as_str)
            .unwrap_or_else(|| self.actor.id.get(..12).unwrap_or(self.actor.id.as_str()))
    }
}

/// A source of container events
#[async_trait]
pub trait EventFeed: Send {
    /// Next event; `Ok(None)` when the stream has ended
    async fn next_event(&mut self) -> Result<Option<ContainerEvent>, FeedError>;
}

/// Decode one NDJSON line; blank or malformed lines yield `None`
pub fn decode_event(line: &[u8]) -> Option<ContainerEvent> {
    let line = line.trim_ascii();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_slice(line) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!(error = %e, "Skipping malformed docker event");
            None
        }
    }
}

/// `/events` request path with the replay window and filters applied
pub fn events_path(now_ts: i64) -> String {
    format!(
        "/events?since={}&filters={}",
        now_ts - REPLAY_WINDOW_SECS,
        urlencoding::encode(EVENT_FILTERS)
    )
}

/// Splits a byte stream into newline-terminated lines of bounded length.
///
/// A line longer than the limit is dropped whole, including whatever part of
/// it arrives after the limit was hit.
#[derive(Debug)]
pub struct LineBuffer {
    buffer: BytesMut,
    limit: usize,
    discarding: bool,
}

impl LineBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            limit,
            discarding: false,
        }
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Bytes currently held
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Next complete line, newline included
    pub fn next_line(&mut self) -> Option<BytesMut> {
        loop {
            let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') else {
                if self.buffer.len() > self.limit {
                    if !self.discarding {
                        warn!(limit = self.limit, "Skipping oversized docker event");
                    }
                    self.buffer.clear();
                    self.discarding = true;
                }
                return None;
            };

            let line = self.buffer.split_to(pos + 1);
            if self.discarding {
                self.discarding = false;
                continue;
            }
            if line.len() > self.limit {
                warn!(limit = self.limit, length = line.len(), "Skipping oversized docker event");
                continue;
            }
            return Some(line);
        }
    }
}

/// Event stream from a Docker daemon
pub struct DockerEventFeed {
    body: Incoming,
    lines: LineBuffer,
    connection: JoinHandle<()>,
}

impl DockerEventFeed {
    /// Connect and start streaming events
    pub async fn connect(endpoint: &DockerEndpoint) -> Result<Self, FeedError> {
        let path = events_path(Utc::now().timestamp());

        match endpoint {
            DockerEndpoint::Unix(socket) => {
                #[cfg(unix)]
                {
                    let stream = UnixStream::connect(socket).await.map_err(|source| {
                        FeedError::Connect {
                            endpoint: socket.display().to_string(),
                            source,
                        }
                    })?;
                    info!(socket = %socket.display(), "Connected to docker socket");
                    Self::start(TokioIo::new(stream), "localhost", &path).await
                }
                #[cfg(not(unix))]
                {
                    let _ = socket;
                    Err(FeedError::UnsupportedTransport)
                }
            }
            DockerEndpoint::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port))
                    .await
                    .map_err(|source| FeedError::Connect {
                        endpoint: format!("{host}:{port}"),
                        source,
                    })?;
                info!(host = %host, port, "Connected to docker daemon");
                Self::start(TokioIo::new(stream), &format!("{host}:{port}"), &path).await
            }
        }
    }

    async fn start<T>(io: T, authority: &str, path: &str) -> Result<Self, FeedError>
    where
        T: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
    {
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;
        let connection = tokio::spawn(async move {
            if let Err(e) = conn.await {
                warn!(error = %e, "Docker connection closed with error");
            }
        });

        let request = Request::builder()
            .method(Method::GET)
            .uri(path)
            .header(header::HOST, authority)
            .body(Empty::<Bytes>::new())?;

        debug!(path = %path, "Subscribing to docker events");
        let response = sender.send_request(request).await?;
        if !response.status().is_success() {
            connection.abort();
            return Err(FeedError::Status(response.status()));
        }

        Ok(Self {
            body: response.into_body(),
            lines: LineBuffer::new(MAX_EVENT_LINE),
            connection,
        })
    }
}

#[async_trait]
impl EventFeed for DockerEventFeed {
    async fn next_event(&mut self) -> Result<Option<ContainerEvent>, FeedError> {
        loop {
            if let Some(line) = self.lines.next_line() {
                if let Some(event) = decode_event(&line) {
                    trace!(action = %event.action, container = %event.container_name(), "Docker event");
                    return Ok(Some(event));
                }
                continue;
            }

            match self.body.frame().await {
                None => return Ok(None),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(frame)) => {
                    if let Ok(data) = frame.into_data() {
                        self.lines.extend(&data);
                    }
                }
            }
        }
    }
}

impl Drop for DockerEventFeed {
    fn drop(&mut self) {
        self.connection.abort();
    }
}

impl std::fmt::Debug for DockerEventFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerEventFeed")
            .field("buffered", &self.lines.len())
            .finish()
    }
}
