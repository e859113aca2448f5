//! Per-socket connection handler for the client.
//!
//! Each connected socket gets one of these: a reader task and a writer
//! task bridging the TCP stream to the rest of the client. The role tag
//! decides two things only: whether the read-idle timer arms, and
//! whether inbound messages are forwarded to the pending table. Everything
//! else is identical across the send, receive and unified roles.
//!
//! The reader is strict: a framing or parse error on an inbound byte
//! stream means response/STAN alignment is gone, so the socket is
//! reported down rather than resynced.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::ChannelSide;
use crate::events::{EventBus, FepEvent};
use crate::framing::{FrameDecoder, FramerConfig};
use crate::iso::{Message, MessageCodec};
use crate::pending::PendingTable;

/// Read buffer size per socket.
const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Signals from channel tasks to the client supervisor.
#[derive(Debug)]
pub(crate) enum ChannelSignal {
    /// A socket died: peer close, read/write error, or read idle.
    Down {
        /// Which socket.
        side: ChannelSide,
        /// Human-readable cause for events and logs.
        cause: String,
    },
}

/// One queued write and its acknowledgment sink.
struct WriteRequest {
    bytes: Vec<u8>,
    ack: oneshot::Sender<io::Result<()>>,
}

/// Handle to one live socket: its write queue and its two tasks.
pub(crate) struct ChannelHandle {
    side: ChannelSide,
    write_tx: UnboundedSender<WriteRequest>,
    active: Arc<AtomicBool>,
    read_task: JoinHandle<()>,
    write_task: JoinHandle<()>,
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("side", &self.side)
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

impl ChannelHandle {
    /// Take ownership of a connected stream and spawn its task pair.
    ///
    /// `read_idle` arms the staleness timer: when the socket sees no
    /// inbound bytes for that long it is reported down. Receive and
    /// unified roles pass a deadline; the send role passes `None`.
    pub(crate) fn spawn(
        side: ChannelSide,
        stream: TcpStream,
        framer: FramerConfig,
        codec: Arc<MessageCodec>,
        pending: PendingTable,
        events: EventBus,
        signal_tx: UnboundedSender<ChannelSignal>,
        read_idle: Option<Duration>,
    ) -> Self {
        let (read_half, write_half) = stream.into_split();
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let active = Arc::new(AtomicBool::new(true));

        let read_task = tokio::spawn(read_loop(
            side,
            read_half,
            framer,
            codec,
            pending,
            events,
            signal_tx.clone(),
            read_idle,
            active.clone(),
        ));
        let write_task = tokio::spawn(write_loop(side, write_half, write_rx, signal_tx, active.clone()));

        Self {
            side,
            write_tx,
            active,
            read_task,
            write_task,
        }
    }

    /// Which socket this handle owns.
    pub(crate) fn side(&self) -> ChannelSide {
        self.side
    }

    /// Whether both tasks still consider the socket usable.
    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Queue a frame for writing. The returned receiver resolves once the
    /// transport accepted (or refused) the bytes.
    pub(crate) fn write(&self, bytes: Vec<u8>) -> Option<oneshot::Receiver<io::Result<()>>> {
        if !self.is_active() {
            return None;
        }
        let (ack, ack_rx) = oneshot::channel();
        self.write_tx.send(WriteRequest { bytes, ack }).ok()?;
        Some(ack_rx)
    }

    /// Tear the socket down: abort both tasks and mark inactive.
    pub(crate) fn shutdown(&self) {
        self.active.store(false, Ordering::Release);
        self.read_task.abort();
        self.write_task.abort();
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The STAN as a number, when field 11 is present and numeric.
pub(crate) fn stan_value(message: &Message) -> Option<u32> {
    message.stan().and_then(|s| s.parse().ok())
}

#[allow(clippy::too_many_arguments)]
async fn read_loop(
    side: ChannelSide,
    mut reader: tokio::net::tcp::OwnedReadHalf,
    framer: FramerConfig,
    codec: Arc<MessageCodec>,
    pending: PendingTable,
    events: EventBus,
    signal_tx: UnboundedSender<ChannelSignal>,
    read_idle: Option<Duration>,
    active: Arc<AtomicBool>,
) {
    let mut decoder = FrameDecoder::new(framer);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut last_activity = Instant::now();

    // Staleness is checked at half the deadline so a dead socket is
    // noticed within 1.5x the configured idle window at worst.
    let check_period = read_idle.map_or(Duration::from_secs(3600), |d| (d / 2).max(Duration::from_millis(10)));
    let mut idle_check = tokio::time::interval(check_period);
    idle_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    idle_check.reset();

    // Mark the socket dead before the supervisor hears about it, so a
    // stale signal can never be mistaken for a live replacement
    let down = |cause: String| {
        active.store(false, Ordering::Release);
        let _ = signal_tx.send(ChannelSignal::Down { side, cause });
    };

    loop {
        tokio::select! {
            result = reader.read(&mut buf) => match result {
                Ok(0) => {
                    log::info!("[Client] {side} socket closed by peer");
                    down("closed by peer".to_string());
                    break;
                }
                Ok(n) => {
                    last_activity = Instant::now();
                    match decoder.feed(&buf[..n]) {
                        Ok(bodies) => {
                            for body in bodies {
                                if !handle_body(side, &body, &codec, &pending, &events) {
                                    down("message parse failed".to_string());
                                    active.store(false, Ordering::Release);
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            // Length framing lost: STAN alignment cannot be
                            // trusted any more on this socket
                            log::error!("[Client] {side} frame decode error: {e}");
                            events.emit(FepEvent::DecodeError {
                                side,
                                detail: e.to_string(),
                            });
                            down(format!("frame decode error: {e}"));
                            break;
                        }
                    }
                }
                Err(e) => {
                    log::error!("[Client] {side} read error: {e}");
                    down(format!("read error: {e}"));
                    break;
                }
            },
            _ = idle_check.tick() => {
                if let Some(deadline) = read_idle {
                    if last_activity.elapsed() >= deadline {
                        log::warn!(
                            "[Client] {side} socket idle for {:?}, declaring it dead",
                            last_activity.elapsed()
                        );
                        down("read idle".to_string());
                        break;
                    }
                }
            }
        }
    }
    active.store(false, Ordering::Release);
}

/// Decode one frame body and route the message. Returns `false` when the
/// body is unparseable, which is fatal for a client socket.
fn handle_body(
    side: ChannelSide,
    body: &[u8],
    codec: &MessageCodec,
    pending: &PendingTable,
    events: &EventBus,
) -> bool {
    let (message, warnings) = match codec.decode(body) {
        Ok(decoded) => decoded,
        Err(e) => {
            log::error!("[Client] {side} message parse error: {e}");
            events.emit(FepEvent::DecodeError {
                side,
                detail: e.to_string(),
            });
            return false;
        }
    };
    for warning in warnings {
        log::warn!("[Client] {side} codec: {warning}");
    }

    events.emit(FepEvent::MessageReceived {
        mti: message.mti(),
        stan: message.stan().map(str::to_string),
    });

    let forwards_to_pending = matches!(side, ChannelSide::Receive | ChannelSide::Unified);
    if !forwards_to_pending {
        log::warn!("[Client] unexpected inbound message on the {side} socket: {message}");
        events.emit(FepEvent::Unsolicited { message });
        return true;
    }

    match stan_value(&message) {
        Some(stan) if pending.complete(stan, message.clone()) => {
            log::debug!("[Client] matched response for STAN {stan:06}");
        }
        _ => {
            log::info!("[Client] unsolicited inbound message: {message}");
            events.emit(FepEvent::Unsolicited { message });
        }
    }
    true
}

async fn write_loop(
    side: ChannelSide,
    mut writer: tokio::net::tcp::OwnedWriteHalf,
    mut write_rx: UnboundedReceiver<WriteRequest>,
    signal_tx: UnboundedSender<ChannelSignal>,
    active: Arc<AtomicBool>,
) {
    while let Some(request) = write_rx.recv().await {
        match writer.write_all(&request.bytes).await {
            Ok(()) => {
                let _ = request.ack.send(Ok(()));
            }
            Err(e) => {
                log::error!("[Client] {side} write error: {e}");
                let cause = format!("write error: {e}");
                let _ = request.ack.send(Err(e));
                active.store(false, Ordering::Release);
                let _ = signal_tx.send(ChannelSignal::Down { side, cause });
                break;
            }
        }
    }
    active.store(false, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iso::Mti;

    #[test]
    fn test_stan_value_parses_digits() {
        let mut msg = Message::new(Mti::NETWORK_MANAGEMENT_RESPONSE);
        msg.set_stan(31);
        assert_eq!(stan_value(&msg), Some(31));
    }

    #[test]
    fn test_stan_value_rejects_garbage() {
        let mut msg = Message::new(Mti::NETWORK_MANAGEMENT_RESPONSE);
        msg.set_str(crate::iso::field::STAN, "00x001");
        assert_eq!(stan_value(&msg), None);
        assert_eq!(stan_value(&Message::new(Mti::NETWORK_MANAGEMENT_RESPONSE)), None);
    }
}
