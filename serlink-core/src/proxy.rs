//! The per-flow stream proxy: a task pair relaying bytes between one TCP
//! flow over the link and one native socket.
//!
//! One direction drains the flow's byte queue into the socket; the other
//! reads the socket in 4 KiB chunks and feeds them back to the bridge as
//! flow data. The directions share a single shutdown signal: whichever
//! finishes first raises it, and the stack raises it when the flow leaves
//! the data-transfer states. Back-pressure toward the service is the byte
//! queue; back-pressure from the link is the send-credit semaphore, which
//! the stack replenishes as the peer acknowledges data.

use crate::bridge::Event;
use crate::config::{Config, ServiceTarget};
use crate::shutdown::{FlowEnd, FlowShutdown};
use crate::socks::{self, SocksError};
use crate::tcp::tcb::FlowId;
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::timeout;

/// Bytes the service may have buffered toward the link before its reader
/// pauses for acknowledgements.
pub const SEND_CREDIT: usize = 64 * 1024;

/// Largest single read from the native socket.
const READ_CHUNK: usize = 4096;

/// Depth of the link-to-service byte queue, in chunks.
const QUEUE_DEPTH: usize = 32;

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("service connect failed: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Socks(#[from] SocksError),
    #[error("service connect timed out")]
    TimedOut,
}

/// Open the native socket for a flow, directly or through SOCKS5, bounded
/// by the configured connect timeout.
pub async fn connect_service(
    config: &Config,
    target: &ServiceTarget,
) -> Result<TcpStream, ConnectError> {
    let attempt = async {
        match config.socks5 {
            Some(server) => socks::connect(server, &target.host, target.port)
                .await
                .map_err(ConnectError::from),
            None => TcpStream::connect((target.host.as_str(), target.port))
                .await
                .map_err(ConnectError::from),
        }
    };
    match timeout(config.tcp.connect_timeout, attempt).await {
        Ok(result) => result,
        Err(_) => Err(ConnectError::TimedOut),
    }
}

/// The bridge's grip on a running proxy pair.
#[derive(Debug)]
pub struct ProxyHandle {
    /// Link-to-service bytes. Dropping it (on peer FIN) half-closes the
    /// socket once the queue drains.
    pub queue: Option<mpsc::Sender<Bytes>>,
    pub shutdown: FlowShutdown,
    pub credit: Arc<Semaphore>,
}

impl ProxyHandle {
    /// Peer FIN: stop feeding the service after what is already queued.
    pub fn close_write(&mut self) {
        self.queue.take();
    }
}

/// Start the task pair for an established flow.
pub fn spawn(id: FlowId, socket: TcpStream, events: mpsc::Sender<Event>) -> ProxyHandle {
    let (queue_tx, queue_rx) = mpsc::channel(QUEUE_DEPTH);
    let shutdown = FlowShutdown::new();
    let credit = Arc::new(Semaphore::new(SEND_CREDIT));
    let (read_half, write_half) = socket.into_split();

    let writer_shutdown = shutdown.clone();
    let reader_shutdown = shutdown.clone();
    let reader_credit = credit.clone();
    let writer_events = events.clone();
    let finished_events = events.clone();
    tokio::spawn(async move {
        let writer = tokio::spawn(write_side(id, write_half, queue_rx, writer_shutdown, writer_events));
        let reader = tokio::spawn(read_side(id, read_half, reader_shutdown, reader_credit, events));
        let _ = reader.await;
        let _ = writer.await;
        let _ = finished_events.send(Event::ProxyFinished { id }).await;
        tracing::debug!(%id, "proxy finished");
    });

    ProxyHandle {
        queue: Some(queue_tx),
        shutdown,
        credit,
    }
}

/// Link to service: drain the queue into the socket, flushing each chunk.
async fn write_side(
    id: FlowId,
    mut socket: OwnedWriteHalf,
    mut queue: mpsc::Receiver<Bytes>,
    shutdown: FlowShutdown,
    events: mpsc::Sender<Event>,
) {
    loop {
        let chunk = tokio::select! {
            _ = shutdown.stopped() => break,
            chunk = queue.recv() => chunk,
        };
        match chunk {
            Some(data) => {
                let write = async {
                    socket.write_all(&data).await?;
                    socket.flush().await
                };
                if let Err(error) = write.await {
                    tracing::debug!(%id, %error, "service write failed");
                    let _ = events.send(Event::FlowError { id }).await;
                    shutdown.raise(FlowEnd::ServiceFailed);
                    break;
                }
            }
            None => {
                // Queue closed: the peer is done sending. Half-close toward
                // the service; the read side keeps going.
                let _ = socket.shutdown().await;
                break;
            }
        }
    }
}

/// Service to link: 4 KiB reads, credit-gated, handed to the bridge to be
/// segmentized by the flow's TCB.
async fn read_side(
    id: FlowId,
    mut socket: OwnedReadHalf,
    shutdown: FlowShutdown,
    credit: Arc<Semaphore>,
    events: mpsc::Sender<Event>,
) {
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let read = tokio::select! {
            _ = shutdown.stopped() => break,
            read = socket.read(&mut chunk) => read,
        };
        match read {
            Ok(0) => {
                tracing::debug!(%id, "service EOF");
                let _ = events.send(Event::FlowEof { id }).await;
                break;
            }
            Ok(n) => {
                // Wait for send window before buffering more into the stack.
                let acquired = tokio::select! {
                    _ = shutdown.stopped() => break,
                    permit = credit.acquire_many(n as u32) => permit,
                };
                match acquired {
                    Ok(permit) => permit.forget(),
                    Err(_) => break,
                }
                let data = Bytes::copy_from_slice(&chunk[..n]);
                if events.send(Event::FlowData { id, data }).await.is_err() {
                    break;
                }
            }
            Err(error) => {
                tracing::debug!(%id, %error, "service read failed");
                let _ = events.send(Event::FlowError { id }).await;
                break;
            }
        }
    }
}
