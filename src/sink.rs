//! # Sink Routing
//!
//! Decides where encoded output goes. The file and stream-socket kinds are
//! written by the downstream collaborator itself; the router only has work to
//! do for kinds that receive discrete chunks:
//!
//! | Kind            | Output path                                       |
//! |-----------------|---------------------------------------------------|
//! | `File(path)`    | collaborator muxes into `path`                    |
//! | `StreamSocket`  | collaborator serves a TCP stream on `port`        |
//! | `PullCallback`  | each chunk is handed to the user's output callback |
//! | `PushLatest`    | each chunk is published, latest wins              |
//!
//! For `PushLatest` the publish channel is bound when the pipeline becomes
//! ready and closed at end of stream. Send failures are counted and logged,
//! never propagated.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;

use crate::error::{StreamerError, StreamerResult, classify};
use crate::transport::{Endpoint, PublishTransport, TcpLatestPublisher};

/// Default `tcpserversink` port.
pub const DEFAULT_STREAM_PORT: u16 = 4953;

/// Output destination selected per run.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SinkKind {
    /// Muxed container file
    File(PathBuf),
    /// Raw encoded stream served to TCP clients
    StreamSocket { port: u16 },
    /// In-process output callback
    #[default]
    PullCallback,
    /// Latest-value-wins publish channel on an ephemeral port
    PushLatest,
}

impl SinkKind {
    /// Whether output arrives as discrete chunks the router must dispatch.
    pub fn receives_chunks(&self) -> bool {
        matches!(self, SinkKind::PullCallback | SinkKind::PushLatest)
    }
}

impl FromStr for SinkKind {
    type Err = StreamerError;

    /// `"tcp"`, `"app"` and `"push"` select the socket, callback and publish
    /// kinds; anything else is a file path.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" => Err(StreamerError::config("sink", s, "empty sink selection")),
            "tcp" => Ok(SinkKind::StreamSocket {
                port: DEFAULT_STREAM_PORT,
            }),
            "app" => Ok(SinkKind::PullCallback),
            "push" => Ok(SinkKind::PushLatest),
            path => Ok(SinkKind::File(PathBuf::from(path))),
        }
    }
}

impl fmt::Display for SinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkKind::File(path) => write!(f, "file:{}", path.display()),
            SinkKind::StreamSocket { port } => write!(f, "tcp:{}", port),
            SinkKind::PullCallback => write!(f, "app"),
            SinkKind::PushLatest => write!(f, "push"),
        }
    }
}

/// Counters for chunk dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkStats {
    /// Chunks received from the collaborator
    pub chunks: u64,
    /// Chunks accepted by the publish channel
    pub published: u64,
    /// Publish attempts that failed (never fatal)
    pub send_failures: u64,
}

pub type OutputCallback = Box<dyn FnMut(&[u8]) + Send>;

pub struct SinkRouter {
    kind: SinkKind,
    output: Mutex<Option<OutputCallback>>,
    transport: Mutex<Option<Arc<dyn PublishTransport>>>,
    endpoint: Mutex<Option<Endpoint>>,
    ready: AtomicBool,
    closed: AtomicBool,
    chunks: AtomicU64,
    published: AtomicU64,
    send_failures: AtomicU64,
}

impl SinkRouter {
    /// `transport` is only used by `PushLatest`; a [`TcpLatestPublisher`] is
    /// created when none is given.
    pub fn new(
        kind: SinkKind,
        output: Option<OutputCallback>,
        transport: Option<Arc<dyn PublishTransport>>,
    ) -> Self {
        Self {
            kind,
            output: Mutex::new(output),
            transport: Mutex::new(transport),
            endpoint: Mutex::new(None),
            ready: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            chunks: AtomicU64::new(0),
            published: AtomicU64::new(0),
            send_failures: AtomicU64::new(0),
        }
    }

    pub fn kind(&self) -> &SinkKind {
        &self.kind
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Bound publish endpoint. `None` unless `PushLatest` is ready.
    pub fn endpoint(&self) -> Option<Endpoint> {
        *lock(&self.endpoint)
    }

    pub fn stats(&self) -> SinkStats {
        SinkStats {
            chunks: self.chunks.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
        }
    }

    /// Open outputs owned by the router. Only the first call does anything.
    pub fn on_ready(&self) -> StreamerResult<()> {
        if self.ready.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if !self.kind.receives_chunks() && lock(&self.output).is_some() {
            log::warn!(
                "Sink {} writes its own output, the output callback receives no chunks",
                self.kind
            );
        }
        if self.kind != SinkKind::PushLatest {
            log::debug!("Sink {} ready", self.kind);
            return Ok(());
        }

        let transport = {
            let mut slot = lock(&self.transport);
            let transport = slot.get_or_insert_with(|| {
                Arc::new(TcpLatestPublisher::new()) as Arc<dyn PublishTransport>
            });
            Arc::clone(transport)
        };
        match transport.bind_ephemeral() {
            Ok(endpoint) => {
                log::info!("Streaming data on port {}", endpoint.port());
                *lock(&self.endpoint) = Some(endpoint);
                Ok(())
            }
            Err(e) => {
                self.ready.store(false, Ordering::SeqCst);
                Err(StreamerError::initialization("publish channel", e.to_string()))
            }
        }
    }

    /// Dispatch one encoded chunk. Never blocks on the publish channel.
    pub fn on_output_chunk(&self, chunk: Bytes) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        self.chunks.fetch_add(1, Ordering::Relaxed);

        if let Some(callback) = lock(&self.output).as_mut() {
            callback(&chunk);
        }

        if self.kind != SinkKind::PushLatest {
            return;
        }
        let Some(transport) = lock(&self.transport).clone() else {
            return;
        };
        let len = chunk.len();
        match transport.send_nonblocking_latest(chunk) {
            Ok(()) => {
                self.published.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                let failures = self.send_failures.fetch_add(1, Ordering::Relaxed);
                if classify::is_fatal(&e) {
                    classify::report(&e.with_operation("publish"));
                } else if failures == 0 {
                    log::warn!("Cannot publish frame ({} bytes): {}", len, e);
                } else {
                    log::debug!("Cannot publish frame ({} bytes): {}", len, e);
                }
            }
        }
    }

    /// Close outputs. Idempotent.
    pub fn on_end_of_stream(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(transport) = lock(&self.transport).as_ref() {
            transport.close();
        }
        *lock(&self.endpoint) = None;
        let stats = self.stats();
        log::info!(
            "Sink {} closed: {} chunks, {} published, {} send failures",
            self.kind,
            stats.chunks,
            stats.published,
            stats.send_failures
        );
    }
}

impl fmt::Debug for SinkRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SinkRouter")
            .field("kind", &self.kind)
            .field("endpoint", &self.endpoint())
            .field("stats", &self.stats())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
