//! WebSocket transport for the live protocol
//!
//! The session loop never touches the socket directly. A `Connector` opens
//! the connection and hands back a `TransportHandle`: a FIFO sender for
//! outbound JSON frames and a receiver of inbound `TransportEvent`s. Tests
//! plug in a fake connector built from plain channels.
//!
//! # Task layout
//!
//! - Reader task: socket → `TransportEvent` channel (text and UTF-8 binary frames)
//! - Writer task: outbound channel → socket, in call order; closes the socket
//!   once every outbound sender is gone

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async_with_config, tungstenite::Message};

use super::ConnectError;

/// Capacity of the inbound event channel
const INBOUND_CAPACITY: usize = 100;

/// Something that happened on the socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One JSON frame
    Frame(String),
    /// Socket closed (by the peer or because the stream ended)
    Closed(Option<String>),
    /// Socket failed
    Error(String),
}

/// Channel pair for an open connection
///
/// Dropping the handle aborts the reader and writer tasks. Use `close()` for
/// a graceful close frame.
pub struct TransportHandle {
    outbound: mpsc::UnboundedSender<String>,
    inbound: mpsc::Receiver<TransportEvent>,
    reader_task: Option<JoinHandle<()>>,
    writer_task: Option<JoinHandle<()>>,
}

impl TransportHandle {
    /// Build a handle from raw channels (no background tasks)
    pub fn new(
        outbound: mpsc::UnboundedSender<String>,
        inbound: mpsc::Receiver<TransportEvent>,
    ) -> Self {
        Self {
            outbound,
            inbound,
            reader_task: None,
            writer_task: None,
        }
    }

    /// Queue one outbound frame; frames leave in the order they were queued
    pub fn send(&self, frame: String) -> Result<(), String> {
        self.outbound
            .send(frame)
            .map_err(|_| "outbound channel closed".to_string())
    }

    /// Receive the next inbound event
    ///
    /// Returns `None` once the reader side is gone.
    pub async fn recv(&mut self) -> Option<TransportEvent> {
        self.inbound.recv().await
    }

    /// Close gracefully: the writer flushes queued frames, then sends a close frame
    pub fn close(mut self) {
        // Detach the writer so Drop doesn't abort it; it exits when the
        // outbound sender below is dropped.
        self.writer_task.take();
    }
}

impl Drop for TransportHandle {
    fn drop(&mut self) {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        if let Some(task) = self.writer_task.take() {
            task.abort();
        }
    }
}

/// Opens transport connections
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, url: String) -> BoxFuture<'static, Result<TransportHandle, ConnectError>>;
}

/// Production connector over tokio-tungstenite
#[derive(Debug, Clone, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn connect(&self, url: String) -> BoxFuture<'static, Result<TransportHandle, ConnectError>> {
        Box::pin(open_websocket(url))
    }
}

async fn open_websocket(url: String) -> Result<TransportHandle, ConnectError> {
    log::info!("Transport: connecting to live service...");

    let (ws_stream, _response) = connect_async_with_config(
        url, None, false, // disable_nagle (we want low latency)
    )
    .await
    .map_err(|e| ConnectError::Transport(e.to_string()))?;

    log::info!("Transport: WebSocket connected");

    let (mut write, mut read) = ws_stream.split();
    let (in_tx, in_rx) = mpsc::channel(INBOUND_CAPACITY);
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

    let reader_tx = in_tx.clone();
    let reader_task = tokio::spawn(async move {
        while let Some(msg_result) = read.next().await {
            let event = match msg_result {
                Ok(Message::Text(text)) => TransportEvent::Frame(text),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => TransportEvent::Frame(text),
                    Err(e) => {
                        log::warn!("Transport: dropping non-UTF-8 binary frame: {}", e);
                        continue;
                    }
                },
                Ok(Message::Close(frame)) => {
                    let reason = frame.map(|f| f.reason.to_string());
                    log::info!("Transport: WebSocket closed by server ({:?})", reason);
                    let _ = reader_tx.send(TransportEvent::Closed(reason)).await;
                    return;
                }
                Err(e) => {
                    log::warn!("Transport: WebSocket error: {}", e);
                    let _ = reader_tx.send(TransportEvent::Error(e.to_string())).await;
                    return;
                }
                _ => continue, // Ignore ping/pong/raw frames
            };

            if reader_tx.send(event).await.is_err() {
                log::debug!("Transport: inbound channel closed");
                return;
            }
        }
        let _ = reader_tx.send(TransportEvent::Closed(None)).await;
        log::debug!("Transport: reader task exiting");
    });

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if let Err(e) = write.send(Message::Text(frame)).await {
                log::warn!("Transport: failed to send frame: {}", e);
                let _ = in_tx.send(TransportEvent::Error(e.to_string())).await;
                return;
            }
        }

        if let Err(e) = write.close().await {
            log::warn!("Transport: error closing WebSocket: {}", e);
        }
        log::debug!("Transport: writer task exiting");
    });

    Ok(TransportHandle {
        outbound: out_tx,
        inbound: in_rx,
        reader_task: Some(reader_task),
        writer_task: Some(writer_task),
    })
}
