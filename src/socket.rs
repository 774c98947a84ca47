//! Loopback-TCP socket fabric.
//!
//! The data plane uses push/pull sockets (round-robin fan-out on a bound
//! push, many-to-one fan-in on a bound pull), the control plane uses a
//! publish/subscribe broadcast plus exclusive pair channels. Every bind is
//! on 127.0.0.1 at a caller-supplied port; connects retry with exponential
//! backoff so startup order only matters for smoothing, not correctness.
//!
//! Wire format: one message is a single contiguous write of
//! `u32 frame-count`, then per frame `u32 length` + payload. A message is
//! therefore observed whole or not at all on a given connection, and order
//! is FIFO per connection. Order across connections is unspecified.

use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::envelope;
use crate::error::{PipelineError, TransportError};
use crate::message::Message;

const MAX_FRAME_LEN: usize = 1 << 30;
const MAX_FRAMES: usize = 1024;
const CHANNEL_DEPTH: usize = 64;

/// Backoff policy for connecting to a peer that may not have bound yet.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 60,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after the given (0-based) attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.min(16)));
        exp.min(self.max_delay)
    }
}

/// Connect to a local port with retry and exponential backoff.
async fn connect_retry(port: u16, policy: &RetryPolicy) -> Result<TcpStream, TransportError> {
    for attempt in 0..=policy.max_retries {
        match TcpStream::connect(("127.0.0.1", port)).await {
            Ok(stream) => {
                stream.set_nodelay(true).ok();
                debug!(port, attempt, "connected");
                return Ok(stream);
            }
            Err(e) if attempt < policy.max_retries => {
                let delay = policy.delay_for_attempt(attempt);
                debug!(port, attempt, error = %e, delay_ms = delay.as_millis() as u64, "connect retry");
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                return Err(TransportError::ConnectFailed {
                    port,
                    attempts: attempt + 1,
                    source: e,
                });
            }
        }
    }
    unreachable!()
}

async fn bind(port: u16) -> Result<TcpListener, TransportError> {
    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    debug!(port, "bound");
    Ok(listener)
}

/// Write one message's frames as a single contiguous buffer.
async fn write_frames(
    writer: &mut OwnedWriteHalf,
    frames: &[Bytes],
) -> Result<(), TransportError> {
    let payload: usize = frames.iter().map(Bytes::len).sum();
    let mut buf = BytesMut::with_capacity(4 + frames.len() * 4 + payload);
    buf.put_u32(frames.len() as u32);
    for frame in frames {
        if frame.len() > MAX_FRAME_LEN {
            return Err(TransportError::FrameTooLarge(frame.len()));
        }
        buf.put_u32(frame.len() as u32);
        buf.extend_from_slice(frame);
    }
    writer.write_all(&buf).await?;
    Ok(())
}

/// Read one message's frames. `Ok(None)` on a clean EOF at a message
/// boundary; EOF inside a message is an error.
async fn read_frames(reader: &mut OwnedReadHalf) -> Result<Option<Vec<Bytes>>, TransportError> {
    let mut word = [0u8; 4];
    match reader.read_exact(&mut word).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let count = u32::from_be_bytes(word) as usize;
    if count == 0 || count > MAX_FRAMES {
        return Err(TransportError::TruncatedMessage);
    }

    let mut frames = Vec::with_capacity(count);
    for _ in 0..count {
        reader
            .read_exact(&mut word)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::UnexpectedEof => TransportError::TruncatedMessage,
                _ => TransportError::Io(e),
            })?;
        let len = u32::from_be_bytes(word) as usize;
        if len > MAX_FRAME_LEN {
            return Err(TransportError::FrameTooLarge(len));
        }
        let mut data = vec![0u8; len];
        reader
            .read_exact(&mut data)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::UnexpectedEof => TransportError::TruncatedMessage,
                _ => TransportError::Io(e),
            })?;
        frames.push(Bytes::from(data));
    }
    Ok(Some(frames))
}

/// Aborts the wrapped task when dropped, so acceptor/reader tasks never
/// outlive their socket.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Writable peers of a bound push or publish socket.
#[derive(Default)]
struct PeerSet {
    peers: Mutex<Vec<OwnedWriteHalf>>,
    arrived: Notify,
}

fn spawn_acceptor(listener: TcpListener, peers: Arc<PeerSet>) -> AbortOnDrop {
    AbortOnDrop(tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    stream.set_nodelay(true).ok();
                    debug!(%peer, "peer connected");
                    let (_read, write) = stream.into_split();
                    peers.peers.lock().await.push(write);
                    peers.arrived.notify_one();
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                }
            }
        }
    }))
}

/// Decode messages off one connection into the shared inbound queue.
///
/// A decode failure is forwarded once and ends the pump: envelope errors are
/// fatal to the receiving process.
fn spawn_reader(
    mut reader: OwnedReadHalf,
    tx: mpsc::Sender<Result<Message, PipelineError>>,
) -> AbortOnDrop {
    AbortOnDrop(tokio::spawn(async move {
        loop {
            match read_frames(&mut reader).await {
                Ok(Some(frames)) => {
                    let item = envelope::decode(frames).map_err(PipelineError::from);
                    let fatal = item.is_err();
                    if tx.send(item).await.is_err() || fatal {
                        return;
                    }
                }
                Ok(None) => return,
                Err(e) => {
                    let _ = tx.send(Err(e.into())).await;
                    return;
                }
            }
        }
    }))
}

enum PushInner {
    Bound {
        peers: Arc<PeerSet>,
        round_robin: usize,
        _acceptor: AbortOnDrop,
    },
    Connected {
        writer: OwnedWriteHalf,
    },
}

/// Data-plane sender. A bound push fans out round-robin over every
/// connected peer, parking until at least one has arrived; a connected push
/// feeds a single bound pull.
pub struct PushSocket {
    inner: PushInner,
}

impl PushSocket {
    pub async fn bind(port: u16) -> Result<Self, TransportError> {
        let listener = bind(port).await?;
        let peers = Arc::new(PeerSet::default());
        let acceptor = spawn_acceptor(listener, peers.clone());
        Ok(Self {
            inner: PushInner::Bound {
                peers,
                round_robin: 0,
                _acceptor: acceptor,
            },
        })
    }

    pub async fn connect(port: u16, policy: &RetryPolicy) -> Result<Self, TransportError> {
        let stream = connect_retry(port, policy).await?;
        let (_read, writer) = stream.into_split();
        Ok(Self {
            inner: PushInner::Connected { writer },
        })
    }

    pub async fn send(&mut self, msg: &Message) -> Result<(), PipelineError> {
        let frames = envelope::encode(msg)?;
        match &mut self.inner {
            PushInner::Connected { writer } => {
                write_frames(writer, &frames).await.map_err(PipelineError::from)
            }
            PushInner::Bound {
                peers, round_robin, ..
            } => loop {
                let mut guard = peers.peers.lock().await;
                if guard.is_empty() {
                    drop(guard);
                    peers.arrived.notified().await;
                    continue;
                }
                let idx = *round_robin % guard.len();
                match write_frames(&mut guard[idx], &frames).await {
                    Ok(()) => {
                        *round_robin = round_robin.wrapping_add(1);
                        return Ok(());
                    }
                    Err(e) => {
                        debug!(error = %e, "push peer dropped");
                        guard.remove(idx);
                    }
                }
            },
        }
    }
}

enum PullInner {
    Bound { _acceptor: AbortOnDrop },
    Connected { _reader: AbortOnDrop },
}

/// Data-plane receiver. A bound pull fans in from every connected pusher
/// through one bounded queue (FIFO per connection); a connected pull drains
/// a single bound push and reports EOF when that peer closes.
pub struct PullSocket {
    rx: mpsc::Receiver<Result<Message, PipelineError>>,
    _inner: PullInner,
}

impl PullSocket {
    pub async fn bind(port: u16) -> Result<Self, TransportError> {
        let listener = bind(port).await?;
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        let acceptor = AbortOnDrop(tokio::spawn(async move {
            // Readers are detached into their own pumps; they stop when the
            // socket (and with it `rx`) is dropped or their peer closes.
            let mut pumps: Vec<AbortOnDrop> = Vec::new();
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        stream.set_nodelay(true).ok();
                        debug!(%peer, "pusher connected");
                        let (reader, _write) = stream.into_split();
                        pumps.push(spawn_reader(reader, tx.clone()));
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                    }
                }
            }
        }));
        Ok(Self {
            rx,
            _inner: PullInner::Bound {
                _acceptor: acceptor,
            },
        })
    }

    pub async fn connect(port: u16, policy: &RetryPolicy) -> Result<Self, TransportError> {
        let stream = connect_retry(port, policy).await?;
        let (reader, _write) = stream.into_split();
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        Ok(Self {
            rx,
            _inner: PullInner::Connected {
                _reader: spawn_reader(reader, tx),
            },
        })
    }

    /// Next inbound message. `None` means every sending peer has closed
    /// (only observable on a connected pull; a bound pull keeps listening).
    pub async fn recv(&mut self) -> Option<Result<Message, PipelineError>> {
        self.rx.recv().await
    }
}

/// Control-plane broadcaster. Messages go to every currently connected
/// subscriber; with none connected they are dropped.
pub struct PubSocket {
    peers: Arc<PeerSet>,
    _acceptor: AbortOnDrop,
}

impl PubSocket {
    pub async fn bind(port: u16) -> Result<Self, TransportError> {
        let listener = bind(port).await?;
        let peers = Arc::new(PeerSet::default());
        let acceptor = spawn_acceptor(listener, peers.clone());
        Ok(Self {
            peers,
            _acceptor: acceptor,
        })
    }

    pub async fn publish(&mut self, msg: &Message) -> Result<(), PipelineError> {
        let frames = envelope::encode(msg)?;
        let mut guard = self.peers.peers.lock().await;
        let mut idx = 0;
        while idx < guard.len() {
            match write_frames(&mut guard[idx], &frames).await {
                Ok(()) => idx += 1,
                Err(e) => {
                    debug!(error = %e, "subscriber dropped");
                    guard.remove(idx);
                }
            }
        }
        Ok(())
    }
}

/// Control-plane subscriber.
pub struct SubSocket {
    rx: mpsc::Receiver<Result<Message, PipelineError>>,
    _reader: AbortOnDrop,
}

impl SubSocket {
    pub async fn connect(port: u16, policy: &RetryPolicy) -> Result<Self, TransportError> {
        let stream = connect_retry(port, policy).await?;
        let (reader, _write) = stream.into_split();
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        Ok(Self {
            rx,
            _reader: spawn_reader(reader, tx),
        })
    }

    /// Next broadcast. `None` when the publisher has closed.
    pub async fn recv(&mut self) -> Option<Result<Message, PipelineError>> {
        self.rx.recv().await
    }
}

enum PairWriter {
    Pending(oneshot::Receiver<OwnedWriteHalf>),
    Ready(OwnedWriteHalf),
    Gone,
}

/// Exclusive one-to-one channel between two scaffolds. The bind side
/// accepts exactly one peer.
pub struct PairSocket {
    writer: PairWriter,
    rx: mpsc::Receiver<Result<Message, PipelineError>>,
    _task: AbortOnDrop,
}

impl PairSocket {
    pub async fn bind(port: u16) -> Result<Self, TransportError> {
        let listener = bind(port).await?;
        let (writer_tx, writer_rx) = oneshot::channel();
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        let task = AbortOnDrop(tokio::spawn(async move {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    stream.set_nodelay(true).ok();
                    debug!(%peer, "pair peer connected");
                    let (mut reader, writer) = stream.into_split();
                    let _ = writer_tx.send(writer);
                    loop {
                        match read_frames(&mut reader).await {
                            Ok(Some(frames)) => {
                                let item = envelope::decode(frames).map_err(PipelineError::from);
                                let fatal = item.is_err();
                                if tx.send(item).await.is_err() || fatal {
                                    return;
                                }
                            }
                            Ok(None) => return,
                            Err(e) => {
                                let _ = tx.send(Err(e.into())).await;
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "pair accept failed");
                }
            }
        }));
        Ok(Self {
            writer: PairWriter::Pending(writer_rx),
            rx,
            _task: task,
        })
    }

    pub async fn connect(port: u16, policy: &RetryPolicy) -> Result<Self, TransportError> {
        let stream = connect_retry(port, policy).await?;
        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        Ok(Self {
            writer: PairWriter::Ready(writer),
            rx,
            _task: spawn_reader(reader, tx),
        })
    }

    pub async fn send(&mut self, msg: &Message) -> Result<(), PipelineError> {
        let frames = envelope::encode(msg)?;
        if let PairWriter::Pending(_) = self.writer {
            let pending = std::mem::replace(&mut self.writer, PairWriter::Gone);
            match pending {
                PairWriter::Pending(rx) => match rx.await {
                    Ok(writer) => self.writer = PairWriter::Ready(writer),
                    Err(_) => return Err(TransportError::Closed.into()),
                },
                _ => unreachable!(),
            }
        }
        match &mut self.writer {
            PairWriter::Ready(writer) => write_frames(writer, &frames)
                .await
                .map_err(PipelineError::from),
            _ => Err(TransportError::Closed.into()),
        }
    }

    /// Next inbound message. `None` when the peer has closed.
    pub async fn recv(&mut self) -> Option<Result<Message, PipelineError>> {
        self.rx.recv().await
    }
}
