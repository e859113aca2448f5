//! Per-connection state for accepted sockets (server side).
//!
//! Each accepted connection gets a `ServerConn` that owns its read/write
//! tasks and translates between wire frames and [`ServerEvent`]s for the
//! server's event loop. The port a socket arrived on fixes its role for
//! life: receive-port sockets carry requests in, send-port sockets carry
//! responses out, unified sockets do both.
//!
//! Unlike the client, the server is lenient with bad inbound bytes: a
//! framing or parse error is contained to that frame: the decoder
//! resyncs on its cleared buffer and the connection stays up.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use crate::framing::{FrameDecoder, FramerConfig};
use crate::iso::{Message, MessageCodec};

/// Server-side connection identifier.
pub(crate) type ConnId = u64;

/// Which listener accepted a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PortRole {
    /// The server reads requests here.
    Receive,
    /// The server writes responses here.
    Send,
    /// Both directions on one socket.
    Unified,
}

impl PortRole {
    /// Whether the server may write responses through this socket.
    pub(crate) fn is_send_capable(&self) -> bool {
        matches!(self, Self::Send | Self::Unified)
    }
}

impl std::fmt::Display for PortRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Receive => write!(f, "receive"),
            Self::Send => write!(f, "send"),
            Self::Unified => write!(f, "unified"),
        }
    }
}

/// Events from connection tasks to the server's event loop.
#[derive(Debug)]
pub(crate) enum ServerEvent {
    /// A listener accepted a socket.
    Connected {
        /// The new connection, ready to use.
        conn: ServerConn,
    },
    /// A complete message arrived.
    Message {
        /// Which connection.
        conn_id: ConnId,
        /// The connection's role.
        role: PortRole,
        /// The parsed message.
        message: Message,
    },
    /// A frame or message failed to decode; the connection survives.
    DecodeError {
        /// Which connection.
        conn_id: ConnId,
        /// What went wrong.
        detail: String,
    },
    /// A connection ended (EOF, read error, or write error).
    Disconnected {
        /// Which connection.
        conn_id: ConnId,
    },
}

/// One accepted socket: its write queue and task pair.
#[derive(Debug)]
pub(crate) struct ServerConn {
    conn_id: ConnId,
    role: PortRole,
    peer: SocketAddr,
    frame_tx: UnboundedSender<Vec<u8>>,
    active: Arc<AtomicBool>,
    read_task: JoinHandle<()>,
    write_task: JoinHandle<()>,
}

impl ServerConn {
    /// Take ownership of an accepted stream and spawn its task pair.
    pub(crate) fn new(
        conn_id: ConnId,
        role: PortRole,
        peer: SocketAddr,
        stream: TcpStream,
        framer: FramerConfig,
        codec: Arc<MessageCodec>,
        event_tx: UnboundedSender<ServerEvent>,
    ) -> Self {
        let (read_half, write_half) = stream.into_split();
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let active = Arc::new(AtomicBool::new(true));

        let read_task = tokio::spawn(read_loop(
            conn_id,
            role,
            read_half,
            framer,
            codec,
            event_tx.clone(),
            active.clone(),
        ));
        let write_task = tokio::spawn(write_loop(
            conn_id,
            write_half,
            frame_rx,
            event_tx,
            active.clone(),
        ));

        Self {
            conn_id,
            role,
            peer,
            frame_tx,
            active,
            read_task,
            write_task,
        }
    }

    pub(crate) fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    pub(crate) fn role(&self) -> PortRole {
        self.role
    }

    pub(crate) fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Queue pre-framed bytes for this socket. Returns `false` when the
    /// connection is gone.
    pub(crate) fn send_frame(&self, frame: Vec<u8>) -> bool {
        self.is_active() && self.frame_tx.send(frame).is_ok()
    }

    /// Abort both tasks and mark the connection dead.
    pub(crate) fn shutdown(&self) {
        self.active.store(false, Ordering::Release);
        self.read_task.abort();
        self.write_task.abort();
    }
}

impl Drop for ServerConn {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn read_loop(
    conn_id: ConnId,
    role: PortRole,
    mut reader: tokio::net::tcp::OwnedReadHalf,
    framer: FramerConfig,
    codec: Arc<MessageCodec>,
    event_tx: UnboundedSender<ServerEvent>,
    active: Arc<AtomicBool>,
) {
    let mut decoder = FrameDecoder::new(framer);
    let mut buf = vec![0u8; 16 * 1024];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                log::info!("[Server] conn #{conn_id} ({role}) closed by peer");
                let _ = event_tx.send(ServerEvent::Disconnected { conn_id });
                break;
            }
            Ok(n) => match decoder.feed(&buf[..n]) {
                Ok(bodies) => {
                    for body in bodies {
                        match codec.decode(&body) {
                            Ok((message, warnings)) => {
                                for warning in warnings {
                                    log::warn!("[Server] conn #{conn_id} codec: {warning}");
                                }
                                if event_tx
                                    .send(ServerEvent::Message {
                                        conn_id,
                                        role,
                                        message,
                                    })
                                    .is_err()
                                {
                                    return; // server loop is gone
                                }
                            }
                            Err(e) => {
                                // Contained: skip this frame, keep reading
                                let _ = event_tx.send(ServerEvent::DecodeError {
                                    conn_id,
                                    detail: e.to_string(),
                                });
                            }
                        }
                    }
                }
                Err(e) => {
                    // The decoder dropped its buffer; the stream itself
                    // stays up and resyncs on the next frame boundary
                    let _ = event_tx.send(ServerEvent::DecodeError {
                        conn_id,
                        detail: e.to_string(),
                    });
                }
            },
            Err(e) => {
                log::error!("[Server] conn #{conn_id} read error: {e}");
                let _ = event_tx.send(ServerEvent::Disconnected { conn_id });
                break;
            }
        }
    }
    active.store(false, Ordering::Release);
}

async fn write_loop(
    conn_id: ConnId,
    mut writer: tokio::net::tcp::OwnedWriteHalf,
    mut frame_rx: UnboundedReceiver<Vec<u8>>,
    event_tx: UnboundedSender<ServerEvent>,
    active: Arc<AtomicBool>,
) {
    while let Some(frame) = frame_rx.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            log::error!("[Server] conn #{conn_id} write error: {e}");
            active.store(false, Ordering::Release);
            let _ = event_tx.send(ServerEvent::Disconnected { conn_id });
            break;
        }
    }
    active.store(false, Ordering::Release);
}
