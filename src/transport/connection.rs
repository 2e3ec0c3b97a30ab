use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use super::handshake::{Acknowledge, ErrorMessage, Hello, NegotiatedLimits};
use super::{ChunkCodec, EndpointAddress, MessageType, RawChunk};
use crate::config::TransportConfig;
use crate::error::UaError;
use crate::status::StatusCode;

/// Any duplex byte stream the connection can run over.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> ByteStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

type BoxedStream = Box<dyn ByteStream>;

const INBOUND_QUEUE_DEPTH: usize = 64;

/// Byte counters shared between the reader task and writers.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    chunks_read: AtomicU64,
    chunks_written: AtomicU64,
}

impl ConnectionStats {
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    pub fn chunks_read(&self) -> u64 {
        self.chunks_read.load(Ordering::Relaxed)
    }

    pub fn chunks_written(&self) -> u64 {
        self.chunks_written.load(Ordering::Relaxed)
    }
}

/// One handshaken byte-stream connection.
///
/// Created by [`TransportConnection::connect`]; after the HEL/ACK exchange a reader task
/// turns inbound bytes into [`RawChunk`]s. A read failure is delivered as the final `Err`
/// item of the inbound queue, which is how the owning channel learns the connection broke.
pub struct TransportConnection {
    endpoint_url: String,
    limits: NegotiatedLimits,
    writer: tokio::sync::Mutex<FramedWrite<WriteHalf<BoxedStream>, ChunkCodec>>,
    inbound: parking_lot::Mutex<Option<mpsc::Receiver<Result<RawChunk, UaError>>>>,
    reader: parking_lot::Mutex<Option<JoinHandle<()>>>,
    stats: Arc<ConnectionStats>,
    closed: AtomicBool,
}

impl std::fmt::Debug for TransportConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportConnection")
            .field("endpoint_url", &self.endpoint_url)
            .field("limits", &self.limits)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl TransportConnection {
    /// Opens a TCP connection to `endpoint_url` and performs the handshake.
    pub async fn connect(endpoint_url: &str, config: &TransportConfig) -> Result<Self, UaError> {
        let address = EndpointAddress::parse(endpoint_url)?;
        let stream = time::timeout(
            config.hello_timeout(),
            TcpStream::connect(address.socket_target()),
        )
        .await
        .map_err(|_| UaError::transport(StatusCode::BAD_TIMEOUT, "tcp connect timed out"))??;
        stream.set_nodelay(true)?;
        Self::connect_stream(stream, endpoint_url, config).await
    }

    /// Performs the handshake over an already connected stream.
    pub async fn connect_stream<S: ByteStream>(
        stream: S,
        endpoint_url: &str,
        config: &TransportConfig,
    ) -> Result<Self, UaError> {
        let boxed: BoxedStream = Box::new(stream);
        let (read_half, write_half) = tokio::io::split(boxed);
        let mut reader = FramedRead::new(read_half, ChunkCodec::new(config.receive_buffer_size));
        let mut writer = FramedWrite::new(write_half, ChunkCodec::new(0));
        let stats = Arc::new(ConnectionStats::default());

        let hello = Hello::from_config(config, endpoint_url);
        let hello_chunk = hello.to_chunk();
        stats
            .bytes_written
            .fetch_add(hello_chunk.len() as u64, Ordering::Relaxed);
        writer.send(hello_chunk).await?;

        let reply = match time::timeout(config.hello_timeout(), reader.next()).await {
            Err(_) => {
                return Err(UaError::transport(
                    StatusCode::BAD_TIMEOUT,
                    "no reply to HEL before the handshake timeout",
                ))
            }
            Ok(None) => {
                return Err(UaError::transport(
                    StatusCode::BAD_CONNECTION_CLOSED,
                    "connection closed during handshake",
                ))
            }
            Ok(Some(Err(err))) => return Err(UaError::transport(err.status(), err.to_string())),
            Ok(Some(Ok(chunk))) => chunk,
        };
        stats
            .bytes_read
            .fetch_add(reply.len() as u64, Ordering::Relaxed);

        let limits = match reply.message_type {
            MessageType::Acknowledge => {
                let ack = Acknowledge::from_chunk(&reply)?;
                NegotiatedLimits::negotiate(&hello, &ack)?
            }
            MessageType::Error => {
                let err = ErrorMessage::from_chunk(&reply)
                    .map_err(|e| UaError::transport(e.status(), e.to_string()))?;
                warn!(status = %err.status, reason = %err.reason, "server rejected HEL");
                return Err(UaError::transport(err.status, err.reason));
            }
            other => {
                return Err(UaError::transport(
                    StatusCode::BAD_TCP_MESSAGE_TYPE_INVALID,
                    format!("expected ACK or ERR, got {:?}", other),
                ))
            }
        };
        info!(
            endpoint = endpoint_url,
            send_chunk = limits.send_chunk_size,
            receive_chunk = limits.receive_chunk_size,
            "transport handshake complete"
        );

        reader
            .decoder_mut()
            .set_max_chunk_size(limits.receive_chunk_size);
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);
        let reader_task = tokio::spawn(read_loop(reader, tx, stats.clone()));

        Ok(Self {
            endpoint_url: endpoint_url.to_string(),
            limits,
            writer: tokio::sync::Mutex::new(writer),
            inbound: parking_lot::Mutex::new(Some(rx)),
            reader: parking_lot::Mutex::new(Some(reader_task)),
            stats,
            closed: AtomicBool::new(false),
        })
    }

    pub fn endpoint_url(&self) -> &str {
        &self.endpoint_url
    }

    pub fn limits(&self) -> NegotiatedLimits {
        self.limits
    }

    pub fn stats(&self) -> Arc<ConnectionStats> {
        self.stats.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Hands out the inbound chunk queue. There is exactly one consumer per connection;
    /// asking twice is a programming error.
    pub fn take_inbound(&self) -> Result<mpsc::Receiver<Result<RawChunk, UaError>>, UaError> {
        self.inbound.lock().take().ok_or_else(|| {
            UaError::protocol(
                StatusCode::BAD_INVALID_STATE,
                "inbound chunk queue already taken",
            )
        })
    }

    pub async fn write(&self, chunk: RawChunk) -> Result<(), UaError> {
        self.write_all(vec![chunk]).await
    }

    /// Writes the chunks of one message back to back; no other message interleaves.
    pub async fn write_all(&self, chunks: Vec<RawChunk>) -> Result<(), UaError> {
        if self.is_closed() {
            return Err(UaError::closed("transport connection closed"));
        }
        let mut writer = self.writer.lock().await;
        let mut written = 0u64;
        let count = chunks.len() as u64;
        for chunk in chunks {
            written += chunk.len() as u64;
            if let Err(err) = writer.feed(chunk).await {
                drop(writer);
                self.fail(&err);
                return Err(err);
            }
        }
        if let Err(err) = writer.flush().await {
            drop(writer);
            self.fail(&err);
            return Err(err);
        }
        self.stats.bytes_written.fetch_add(written, Ordering::Relaxed);
        self.stats.chunks_written.fetch_add(count, Ordering::Relaxed);
        Ok(())
    }

    /// Stops the reader; the inbound queue then ends and the owner sees the break.
    fn fail(&self, err: &UaError) {
        warn!(endpoint = %self.endpoint_url, error = %err, "transport write failed");
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
    }

    pub async fn disconnect(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
        let mut writer = self.writer.lock().await;
        if let Err(err) = writer.get_mut().shutdown().await {
            debug!(error = %err, "socket shutdown failed");
        }
        debug!(endpoint = %self.endpoint_url, "transport disconnected");
    }
}

impl Drop for TransportConnection {
    fn drop(&mut self) {
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
    }
}

async fn read_loop(
    mut reader: FramedRead<ReadHalf<BoxedStream>, ChunkCodec>,
    tx: mpsc::Sender<Result<RawChunk, UaError>>,
    stats: Arc<ConnectionStats>,
) {
    loop {
        match reader.next().await {
            Some(Ok(chunk)) => {
                stats
                    .bytes_read
                    .fetch_add(chunk.len() as u64, Ordering::Relaxed);
                stats.chunks_read.fetch_add(1, Ordering::Relaxed);
                if tx.send(Ok(chunk)).await.is_err() {
                    return;
                }
            }
            Some(Err(err)) => {
                let _ = tx
                    .send(Err(UaError::transport(err.status(), err.to_string())))
                    .await;
                return;
            }
            None => {
                let _ = tx
                    .send(Err(UaError::transport(
                        StatusCode::BAD_CONNECTION_CLOSED,
                        "connection closed by peer",
                    )))
                    .await;
                return;
            }
        }
    }
}
