//! # Latest-Wins Publish Transport
//!
//! Message channel used by the `PushLatest` sink. The pipeline only depends on
//! the [`PublishTransport`] trait; [`TcpLatestPublisher`] is the bundled
//! implementation.
//!
//! ## Socket Behaviour
//!
//! - **Ephemeral bind**: listens on port 0, the chosen port is reported back
//!   through [`Endpoint`]
//! - **Conflate**: a single pending message; a new send replaces the unsent one
//! - **Immediate**: with no connected subscriber a send fails at once instead
//!   of queueing
//! - **Linger 0**: `close` drops the pending message and shuts sockets down
//!   without flushing
//!
//! ## Wire Format
//!
//! Each message is a 4-byte big-endian length followed by the payload.
//! Subscribers are served round-robin, one message each.
//!
//! ```text
//! send_nonblocking_latest ──▶ [ slot: 1 ] ──▶ writer thread ──▶ subscriber N
//!                               ▲                                  (round-robin)
//!                 replaced when full
//! ```

use std::fmt;
use std::io::{self, Write};
use std::net::{IpAddr, Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};

use crate::error::{StreamerError, StreamerResult};

const ACCEPT_POLL: Duration = Duration::from_millis(10);
const WRITER_POLL: Duration = Duration::from_millis(50);

/// Address a publish channel is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub address: SocketAddr,
}

impl Endpoint {
    pub fn port(&self) -> u16 {
        self.address.port()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tcp://{}", self.address)
    }
}

/// Message transport behind the `PushLatest` sink.
///
/// Implementations must never block in `send_nonblocking_latest`; failures are
/// reported as [`StreamerError::TransportSend`] and are never fatal to a run.
pub trait PublishTransport: Send + Sync {
    /// Bind to an ephemeral endpoint and start accepting subscribers.
    fn bind_ephemeral(&self) -> StreamerResult<Endpoint>;

    /// Queue `payload`, replacing any message that was not sent yet.
    fn send_nonblocking_latest(&self, payload: Bytes) -> StreamerResult<()>;

    /// Stop accepting and drop pending messages. Idempotent.
    fn close(&self);
}

struct Subscriber {
    peer: SocketAddr,
    stream: TcpStream,
}

type Subscribers = Arc<Mutex<Vec<Subscriber>>>;

struct Running {
    endpoint: Endpoint,
    slot: Sender<Bytes>,
    // Second handle on the slot, used to evict a stale message
    evict: Receiver<Bytes>,
    subscribers: Subscribers,
    shutdown: Arc<AtomicBool>,
    acceptor: JoinHandle<()>,
    writer: JoinHandle<()>,
}

/// TCP implementation of [`PublishTransport`].
pub struct TcpLatestPublisher {
    host: IpAddr,
    running: Mutex<Option<Running>>,
}

impl Default for TcpLatestPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpLatestPublisher {
    /// Publisher listening on all interfaces.
    pub fn new() -> Self {
        Self::with_host(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }

    pub fn with_host(host: IpAddr) -> Self {
        Self {
            host,
            running: Mutex::new(None),
        }
    }

    /// Bound endpoint, `None` before `bind_ephemeral` or after `close`.
    pub fn endpoint(&self) -> Option<Endpoint> {
        self.lock().as_ref().map(|running| running.endpoint)
    }

    /// Currently connected subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.lock()
            .as_ref()
            .map(|running| lock_subscribers(&running.subscribers).len())
            .unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, Option<Running>> {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl PublishTransport for TcpLatestPublisher {
    fn bind_ephemeral(&self) -> StreamerResult<Endpoint> {
        let mut running = self.lock();
        if let Some(existing) = running.as_ref() {
            return Ok(existing.endpoint);
        }

        let listener = TcpListener::bind(SocketAddr::new(self.host, 0))
            .map_err(|e| StreamerError::io("bind publish socket", e))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| StreamerError::io("configure publish socket", e))?;
        let endpoint = Endpoint {
            address: listener
                .local_addr()
                .map_err(|e| StreamerError::io("query publish socket", e))?,
        };

        let (slot, rx) = bounded::<Bytes>(1);
        let subscribers: Subscribers = Arc::new(Mutex::new(Vec::new()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let acceptor = {
            let subscribers = Arc::clone(&subscribers);
            let shutdown = Arc::clone(&shutdown);
            thread::Builder::new()
                .name("publish-accept".into())
                .spawn(move || accept_loop(listener, subscribers, shutdown))
                .map_err(|e| StreamerError::io("spawn publish acceptor", e))?
        };
        let writer = {
            let subscribers = Arc::clone(&subscribers);
            let shutdown = Arc::clone(&shutdown);
            let rx = rx.clone();
            thread::Builder::new()
                .name("publish-write".into())
                .spawn(move || write_loop(rx, subscribers, shutdown))
                .map_err(|e| StreamerError::io("spawn publish writer", e))?
        };

        log::info!("Publishing latest frames on {}", endpoint);
        *running = Some(Running {
            endpoint,
            slot,
            evict: rx,
            subscribers,
            shutdown,
            acceptor,
            writer,
        });
        Ok(endpoint)
    }

    fn send_nonblocking_latest(&self, payload: Bytes) -> StreamerResult<()> {
        let running = self.lock();
        let Some(running) = running.as_ref() else {
            return Err(StreamerError::transport_send(None, "channel is not bound"));
        };
        let endpoint = Some(running.endpoint.to_string());

        if lock_subscribers(&running.subscribers).is_empty() {
            return Err(StreamerError::transport_send(
                endpoint,
                "no subscriber connected",
            ));
        }

        match running.slot.try_send(payload) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(payload)) => {
                if running.evict.try_recv().is_ok() {
                    log::trace!("Replaced unsent message");
                }
                running.slot.try_send(payload).map_err(|_| {
                    StreamerError::transport_send(endpoint, "pending message slot is busy")
                })
            }
            Err(TrySendError::Disconnected(_)) => Err(StreamerError::transport_send(
                endpoint,
                "writer thread stopped",
            )),
        }
    }

    fn close(&self) {
        let Some(running) = self.lock().take() else {
            return;
        };
        running.shutdown.store(true, Ordering::SeqCst);
        while running.evict.try_recv().is_ok() {}
        for subscriber in lock_subscribers(&running.subscribers).drain(..) {
            let _ = subscriber.stream.shutdown(Shutdown::Both);
        }
        drop(running.slot);

        if running.acceptor.join().is_err() {
            log::error!("Publish acceptor thread panicked");
        }
        if running.writer.join().is_err() {
            log::error!("Publish writer thread panicked");
        }
        log::info!("Closed publish channel {}", running.endpoint);
    }
}

impl Drop for TcpLatestPublisher {
    fn drop(&mut self) {
        self.close();
    }
}

fn lock_subscribers(subscribers: &Subscribers) -> MutexGuard<'_, Vec<Subscriber>> {
    subscribers
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn accept_loop(listener: TcpListener, subscribers: Subscribers, shutdown: Arc<AtomicBool>) {
    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(e) = stream
                    .set_nonblocking(false)
                    .and_then(|()| stream.set_nodelay(true))
                {
                    log::warn!("Rejecting subscriber {}: {}", peer, e);
                    continue;
                }
                log::info!("Subscriber connected: {}", peer);
                lock_subscribers(&subscribers).push(Subscriber { peer, stream });
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) => {
                log::warn!("Accept failed: {}", e);
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

fn write_loop(rx: Receiver<Bytes>, subscribers: Subscribers, shutdown: Arc<AtomicBool>) {
    let mut next = 0usize;
    loop {
        let payload = match rx.recv_timeout(WRITER_POLL) {
            Ok(payload) => payload,
            Err(RecvTimeoutError::Timeout) => {
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        };
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        // Write through a cloned handle so a stalled peer never holds the lock
        let target = {
            let subscribers = lock_subscribers(&subscribers);
            if subscribers.is_empty() {
                log::debug!("Dropping message, subscriber went away");
                continue;
            }
            next = (next + 1) % subscribers.len();
            let subscriber = &subscribers[next];
            subscriber
                .stream
                .try_clone()
                .map(|stream| (subscriber.peer, stream))
        };
        let (peer, mut stream) = match target {
            Ok(target) => target,
            Err(e) => {
                log::warn!("Cannot clone subscriber socket: {}", e);
                continue;
            }
        };

        if let Err(e) = write_message(&mut stream, &payload) {
            log::warn!("Subscriber {} dropped: {}", peer, e);
            lock_subscribers(&subscribers).retain(|s| s.peer != peer);
        }
    }
}

fn write_message(stream: &mut TcpStream, payload: &[u8]) -> io::Result<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "message too large"))?;
    stream.write_all(&len.to_be_bytes())?;
    stream.write_all(payload)
}
