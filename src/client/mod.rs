//! Dual-channel FISC client.
//!
//! The switch speaks over two long-lived TCP lines: requests leave on the
//! send socket, responses come back on the receive socket, and the STAN in
//! field 11 is the only thing correlating the two. This module owns that
//! whole arrangement:
//!
//! ```text
//! FiscClient
//!     ├── send socket    (ChannelHandle, role Send)
//!     ├── receive socket (ChannelHandle, role Receive)   [dual mode]
//!     │       └── completes PendingTable entries by STAN
//!     ├── PendingTable   (register-before-write correlation)
//!     ├── supervisor     (channel-down signals → strategy + reconnect)
//!     └── heartbeat      (0800/301 echo while signed on)
//! ```
//!
//! Unified mode collapses both roles onto one socket; everything else is
//! unchanged. Only `SIGNED_ON` permits normal traffic.
//!
//! Sign-on in dual mode is two exchanges: the receive line introduces
//! itself first (its sign-on carries field 32, which is how the switch
//! pairs that socket with the institution), then the send line signs on
//! for real. Responses to both arrive on the receive line.

mod channel;
mod state;

pub use state::ClientState;

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::broadcast;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::config::{ClientConfig, Endpoint, FailureStrategy, Mode};
use crate::constants::{
    NETMGMT_ECHO, NETMGMT_SIGN_OFF, NETMGMT_SIGN_ON, RECONNECT_JITTER_MS, RESPONSE_APPROVED,
    STAN_MODULUS,
};
use crate::error::{ChannelSide, FepError};
use crate::events::{EventBus, FepEvent};
use crate::framing::encode_frame;
use crate::iso::{field, Message, MessageCodec, Mti};
use crate::pending::{PendingReply, PendingTable};

use channel::{stan_value, ChannelHandle, ChannelSignal};

/// How many fresh STANs the assignment loop probes before concluding the
/// space is effectively full.
const MAX_STAN_PROBES: u32 = 1_000;

/// Per-side bookkeeping flags.
struct SideFlag {
    send: AtomicBool,
    receive: AtomicBool,
}

impl SideFlag {
    fn new() -> Self {
        Self {
            send: AtomicBool::new(false),
            receive: AtomicBool::new(false),
        }
    }

    fn slot(&self, side: ChannelSide) -> &AtomicBool {
        match side {
            ChannelSide::Send | ChannelSide::Unified => &self.send,
            ChannelSide::Receive => &self.receive,
        }
    }

    fn get(&self, side: ChannelSide) -> bool {
        self.slot(side).load(Ordering::Acquire)
    }

    fn set(&self, side: ChannelSide, value: bool) {
        self.slot(side).store(value, Ordering::Release)
    }

    fn swap(&self, side: ChannelSide, value: bool) -> bool {
        self.slot(side).swap(value, Ordering::AcqRel)
    }
}

/// The client's sockets. Unified mode lives in the `send` slot.
#[derive(Default)]
struct ChannelSet {
    send: Option<ChannelHandle>,
    receive: Option<ChannelHandle>,
}

impl ChannelSet {
    fn slot_mut(&mut self, side: ChannelSide) -> &mut Option<ChannelHandle> {
        match side {
            ChannelSide::Send | ChannelSide::Unified => &mut self.send,
            ChannelSide::Receive => &mut self.receive,
        }
    }

    fn slot(&self, side: ChannelSide) -> Option<&ChannelHandle> {
        match side {
            ChannelSide::Send | ChannelSide::Unified => self.send.as_ref(),
            ChannelSide::Receive => self.receive.as_ref(),
        }
    }

    fn is_up(&self, side: ChannelSide) -> bool {
        self.slot(side).is_some_and(ChannelHandle::is_active)
    }
}

struct ClientInner {
    config: ClientConfig,
    codec: Arc<MessageCodec>,
    pending: PendingTable,
    events: EventBus,
    state: Mutex<ClientState>,
    channels: Mutex<ChannelSet>,
    stan_counter: AtomicU32,
    signed_on: AtomicBool,
    closed: AtomicBool,
    using_backup: SideFlag,
    reconnecting: SideFlag,
    signal_tx: UnboundedSender<ChannelSignal>,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
    supervisor_task: Mutex<Option<JoinHandle<()>>>,
}

/// The FISC client. Cheap to clone; all clones drive the same connection.
#[derive(Clone)]
pub struct FiscClient {
    inner: Arc<ClientInner>,
}

impl FiscClient {
    /// Build a client over a validated config and codec.
    ///
    /// Must run inside a tokio runtime: the supervisor task that reacts to
    /// channel failures is spawned here.
    pub fn new(config: ClientConfig, codec: MessageCodec) -> anyhow::Result<Self> {
        config.validate()?;
        let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(ClientInner {
            config,
            codec: Arc::new(codec),
            pending: PendingTable::new(),
            events: EventBus::new(),
            state: Mutex::new(ClientState::Disconnected),
            channels: Mutex::new(ChannelSet::default()),
            stan_counter: AtomicU32::new(1),
            signed_on: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            using_backup: SideFlag::new(),
            reconnecting: SideFlag::new(),
            signal_tx,
            heartbeat_task: Mutex::new(None),
            supervisor_task: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        let supervisor = tokio::spawn(async move {
            while let Some(signal) = signal_rx.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                match signal {
                    ChannelSignal::Down { side, cause } => {
                        ClientInner::handle_down(&inner, side, cause).await;
                    }
                }
            }
        });
        *inner.supervisor_task.lock().expect("client lock poisoned") = Some(supervisor);

        Ok(Self { inner })
    }

    /// Establish all sockets the mode requires, primary endpoints first,
    /// backups on primary failure.
    pub async fn connect(&self) -> Result<(), FepError> {
        ClientInner::connect(&self.inner).await
    }

    /// Sign on to the switch (MTI 0800, field 70 "001").
    ///
    /// On response code "00" the client transitions to `SignedOn` and the
    /// heartbeat starts. Any other code is `SignOnRejected` with no state
    /// change.
    pub async fn sign_on(&self) -> Result<Message, FepError> {
        ClientInner::sign_on(&self.inner).await
    }

    /// Sign off from the switch (MTI 0800, field 70 "002").
    pub async fn sign_off(&self) -> Result<Message, FepError> {
        ClientInner::sign_off(&self.inner).await
    }

    /// Send a request and wait for the STAN-matched response.
    ///
    /// Assigns field 11 when absent; registers the pending entry before
    /// the bytes leave the process.
    ///
    /// # Errors
    ///
    /// `InvalidState` outside `SignedOn`, `ChannelClosed` when the
    /// outbound socket is down, `SendFailed` on a write error (the pending
    /// entry is cancelled), `Timeout` when no match arrives in time.
    pub async fn send_and_receive(
        &self,
        message: Message,
        timeout: Duration,
    ) -> Result<Message, FepError> {
        let state = self.inner.current_state();
        if !state.allows_traffic() {
            return Err(FepError::InvalidState(format!(
                "send_and_receive requires signed-on, state is {state}"
            )));
        }
        ClientInner::exchange(&self.inner, self.inner.outbound_side(), message, timeout).await
    }

    /// Fire-and-forget write; completes when the transport accepted the
    /// bytes. No pending entry is created.
    pub async fn send(&self, message: Message) -> Result<(), FepError> {
        let state = self.inner.current_state();
        if !state.allows_traffic() {
            return Err(FepError::InvalidState(format!(
                "send requires signed-on, state is {state}"
            )));
        }
        ClientInner::send_one_way(&self.inner, message).await
    }

    /// Close every owned socket and cancel all in-flight requests with
    /// `ChannelClosed`. The client may `connect()` again afterwards.
    pub fn disconnect(&self) {
        self.inner.disconnect("disconnected by caller");
    }

    /// As [`disconnect`](Self::disconnect), then shut the pending table
    /// and the supervisor down for good. Terminal.
    pub fn close(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        inner.disconnect("client closed");
        inner
            .pending
            .close(FepError::ChannelClosed(inner.response_side()));
        if let Some(task) = inner.supervisor_task.lock().expect("client lock poisoned").take() {
            task.abort();
        }
        inner.set_state(ClientState::Closed);
    }

    /// Current aggregate state.
    pub fn state(&self) -> ClientState {
        self.inner.current_state()
    }

    /// Subscribe to the client's event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<FepEvent> {
        self.inner.events.subscribe()
    }

    /// Whether the last sign-on succeeded and no side has since died.
    pub fn is_signed_on(&self) -> bool {
        self.inner.signed_on.load(Ordering::Acquire)
    }

    /// Whether a side's last successful connection used the backup
    /// endpoint (reconnects for that side will then try the backup first).
    pub fn using_backup(&self, side: ChannelSide) -> bool {
        self.inner.using_backup.get(side)
    }

    /// Number of requests currently awaiting responses.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }
}

impl std::fmt::Debug for FiscClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FiscClient")
            .field("state", &self.state())
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl ClientInner {
    fn current_state(&self) -> ClientState {
        *self.state.lock().expect("client lock poisoned")
    }

    /// Swap the aggregate state, logging and emitting on change only.
    fn set_state(&self, new: ClientState) {
        let old = {
            let mut state = self.state.lock().expect("client lock poisoned");
            let old = *state;
            if old == new {
                return;
            }
            *state = new;
            old
        };
        log::info!("[Client] state {old} -> {new}");
        self.events.emit(FepEvent::StateChanged { old, new });
    }

    /// The socket requests leave on.
    fn outbound_side(&self) -> ChannelSide {
        match self.config.mode {
            Mode::Dual => ChannelSide::Send,
            Mode::Unified => ChannelSide::Unified,
        }
    }

    /// The socket responses arrive on: the side whose loss severs
    /// correlation, used as the which-side of fan-out cancellations.
    fn response_side(&self) -> ChannelSide {
        match self.config.mode {
            Mode::Dual => ChannelSide::Receive,
            Mode::Unified => ChannelSide::Unified,
        }
    }

    fn endpoints(&self, side: ChannelSide) -> (Option<&Endpoint>, Option<&Endpoint>) {
        match side {
            ChannelSide::Send => (self.config.send.as_ref(), self.config.send_backup.as_ref()),
            ChannelSide::Receive => (
                self.config.receive.as_ref(),
                self.config.receive_backup.as_ref(),
            ),
            ChannelSide::Unified => (
                self.config.unified.as_ref(),
                self.config.unified_backup.as_ref(),
            ),
        }
    }

    fn install(&self, handle: ChannelHandle) {
        let mut set = self.channels.lock().expect("client lock poisoned");
        if let Some(old) = set.slot_mut(handle.side()).replace(handle) {
            old.shutdown();
        }
    }

    fn sides_up(&self) -> (bool, bool) {
        let set = self.channels.lock().expect("client lock poisoned");
        (set.is_up(ChannelSide::Send), set.is_up(ChannelSide::Receive))
    }

    async fn connect(self: &Arc<Self>) -> Result<(), FepError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(FepError::InvalidState("client is closed".into()));
        }
        let state = self.current_state();
        if !state.allows_connect() {
            return Err(FepError::InvalidState(format!(
                "connect not allowed from {state}"
            )));
        }
        self.set_state(ClientState::Connecting);

        match self.config.mode {
            Mode::Unified => {
                let handle = match self.open_side(ChannelSide::Unified, false).await {
                    Ok(handle) => handle,
                    Err(e) => {
                        self.set_state(ClientState::Disconnected);
                        return Err(e);
                    }
                };
                self.install(handle);
                self.events.emit(FepEvent::Connected {
                    side: ChannelSide::Unified,
                });
                self.set_state(ClientState::UnifiedConnected);
            }
            Mode::Dual => {
                let send = match self.open_side(ChannelSide::Send, false).await {
                    Ok(handle) => handle,
                    Err(e) => {
                        self.set_state(ClientState::Disconnected);
                        return Err(e);
                    }
                };
                self.install(send);
                self.events.emit(FepEvent::Connected {
                    side: ChannelSide::Send,
                });
                self.set_state(ClientState::SendOnly);

                match self.open_side(ChannelSide::Receive, false).await {
                    Ok(receive) => {
                        self.install(receive);
                        self.events.emit(FepEvent::Connected {
                            side: ChannelSide::Receive,
                        });
                        self.set_state(ClientState::BothConnected);
                    }
                    Err(e) => {
                        // Half a dual channel is useless; start over clean
                        self.teardown_channels("connect aborted");
                        self.set_state(ClientState::Disconnected);
                        return Err(e);
                    }
                }
            }
        }
        Ok(())
    }

    /// Open one side's socket: primary then backup, or backup-first after
    /// a backup connection carried the last success.
    async fn open_side(
        self: &Arc<Self>,
        side: ChannelSide,
        prefer_backup: bool,
    ) -> Result<ChannelHandle, FepError> {
        let (primary, backup) = self.endpoints(side);
        let primary = primary.ok_or_else(|| {
            FepError::InvalidState(format!("no {side} endpoint configured"))
        })?;

        let mut order: Vec<(&Endpoint, bool)> = vec![(primary, false)];
        if let Some(backup) = backup {
            order.push((backup, true));
        }
        if prefer_backup {
            order.reverse();
        }

        let mut failures = Vec::new();
        for (endpoint, is_backup) in order {
            log::info!("[Client] connecting {side} socket to {endpoint}");
            let attempt = tokio::time::timeout(
                self.config.connect_timeout(),
                connect_stream(endpoint, &self.config),
            )
            .await;
            match attempt {
                Ok(Ok(stream)) => {
                    if is_backup {
                        log::warn!("[Client] {side} socket is on the backup endpoint {endpoint}");
                    }
                    self.using_backup.set(side, is_backup);
                    let read_idle = matches!(side, ChannelSide::Receive | ChannelSide::Unified)
                        .then(|| self.config.read_idle_deadline());
                    return Ok(ChannelHandle::spawn(
                        side,
                        stream,
                        self.config.framer.clone(),
                        self.codec.clone(),
                        self.pending.clone(),
                        self.events.clone(),
                        self.signal_tx.clone(),
                        read_idle,
                    ));
                }
                Ok(Err(e)) => failures.push(format!("{endpoint}: {e}")),
                Err(_) => failures.push(format!("{endpoint}: connect timed out")),
            }
        }
        Err(FepError::ConnectFailed(format!(
            "{side} socket: {}",
            failures.join("; ")
        )))
    }

    async fn sign_on(self: &Arc<Self>) -> Result<Message, FepError> {
        let state = self.current_state();
        if !state.allows_sign_on() {
            return Err(FepError::InvalidState(format!(
                "sign-on not allowed from {state}"
            )));
        }

        let response = match self.config.mode {
            Mode::Unified => {
                self.network_exchange(ChannelSide::Unified, NETMGMT_SIGN_ON)
                    .await?
            }
            Mode::Dual => {
                // Receive line first: its field 32 lets the switch pair
                // the socket before any response needs routing
                let intro = self
                    .network_exchange(ChannelSide::Receive, NETMGMT_SIGN_ON)
                    .await?;
                check_approved(&intro)?;
                self.network_exchange(ChannelSide::Send, NETMGMT_SIGN_ON)
                    .await?
            }
        };
        check_approved(&response)?;

        self.signed_on.store(true, Ordering::Release);
        self.set_state(ClientState::SignedOn);
        self.events.emit(FepEvent::SignedOn);
        self.start_heartbeat();
        log::info!("[Client] signed on as institution {}", self.config.institution_id);
        Ok(response)
    }

    async fn sign_off(self: &Arc<Self>) -> Result<Message, FepError> {
        let response = self
            .network_exchange(self.outbound_side(), NETMGMT_SIGN_OFF)
            .await?;
        check_approved(&response)?;

        self.signed_on.store(false, Ordering::Release);
        self.stop_heartbeat();
        self.set_state(match self.config.mode {
            Mode::Dual => ClientState::BothConnected,
            Mode::Unified => ClientState::UnifiedConnected,
        });
        self.events.emit(FepEvent::SignedOff);
        Ok(response)
    }

    /// One network-management exchange (0800) over the given socket.
    async fn network_exchange(
        self: &Arc<Self>,
        via: ChannelSide,
        code: &str,
    ) -> Result<Message, FepError> {
        let mut message = Message::new(Mti::NETWORK_MANAGEMENT_REQUEST);
        message.set_str(field::NETWORK_MANAGEMENT_CODE, code);
        self.exchange(via, message, self.config.read_timeout()).await
    }

    /// The request path: stamp, register, write, await the match.
    async fn exchange(
        self: &Arc<Self>,
        via: ChannelSide,
        mut message: Message,
        timeout: Duration,
    ) -> Result<Message, FepError> {
        // Fail fast before touching the pending table
        if !self.channels.lock().expect("client lock poisoned").is_up(via) {
            return Err(FepError::ChannelClosed(via));
        }

        self.stamp(&mut message);

        let (stan, reply) = match stan_value(&message) {
            Some(stan) => (stan, self.pending.register(stan, timeout)?),
            None => {
                if message.has(field::STAN) {
                    return Err(FepError::Malformed("field 11 is not numeric".into()));
                }
                let (stan, reply) = self.register_fresh_stan(timeout)?;
                message.set_stan(stan);
                (stan, reply)
            }
        };

        // From here on every failure must release the entry it registered
        let frame = match self.encode_message(&message) {
            Ok(frame) => frame,
            Err(e) => {
                self.pending.cancel(stan, e.clone());
                return Err(e);
            }
        };

        let ack = match self.write_frame(via, frame) {
            Ok(ack) => ack,
            Err(e) => {
                self.pending.cancel(stan, e.clone());
                return Err(e);
            }
        };
        match ack.await {
            Ok(Ok(())) => {}
            Ok(Err(io_err)) => {
                let err = FepError::SendFailed(io_err);
                self.pending.cancel(stan, err.clone());
                return Err(err);
            }
            Err(_) => {
                let err = FepError::ChannelClosed(via);
                self.pending.cancel(stan, err.clone());
                return Err(err);
            }
        }

        reply.wait().await
    }

    async fn send_one_way(self: &Arc<Self>, mut message: Message) -> Result<(), FepError> {
        let via = self.outbound_side();
        self.stamp(&mut message);
        if !message.has(field::STAN) {
            let stan = self.stan_counter.fetch_add(1, Ordering::Relaxed) % STAN_MODULUS;
            message.set_stan(stan);
        }

        let frame = self.encode_message(&message)?;
        let ack = self.write_frame(via, frame)?;
        match ack.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(io_err)) => Err(FepError::SendFailed(io_err)),
            Err(_) => Err(FepError::ChannelClosed(via)),
        }
    }

    /// Fill in the fields every outbound message carries: transmission
    /// datetime and the institution id.
    fn stamp(&self, message: &mut Message) {
        if !message.has(field::TRANSMISSION_DATETIME) {
            let now = chrono::Utc::now().format("%m%d%H%M%S").to_string();
            message.set_str(field::TRANSMISSION_DATETIME, &now);
        }
        if !message.has(field::ACQUIRING_INSTITUTION) {
            message.set_str(field::ACQUIRING_INSTITUTION, &self.config.institution_id);
        }
    }

    /// Assign the next free STAN, probing past ones still in flight.
    fn register_fresh_stan(&self, timeout: Duration) -> Result<(u32, PendingReply), FepError> {
        for _ in 0..MAX_STAN_PROBES {
            let stan = self.stan_counter.fetch_add(1, Ordering::Relaxed) % STAN_MODULUS;
            match self.pending.register(stan, timeout) {
                Ok(reply) => return Ok((stan, reply)),
                Err(FepError::DuplicateStan(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(FepError::InvalidState(format!(
            "no free STAN in {MAX_STAN_PROBES} probes; table holds {}",
            self.pending.len()
        )))
    }

    fn encode_message(&self, message: &Message) -> Result<Vec<u8>, FepError> {
        let body = self.codec.encode(message)?;
        encode_frame(&self.config.framer, &body)
            .map_err(|e| FepError::Malformed(format!("framing: {e}")))
    }

    fn write_frame(
        &self,
        via: ChannelSide,
        frame: Vec<u8>,
    ) -> Result<oneshot::Receiver<io::Result<()>>, FepError> {
        let set = self.channels.lock().expect("client lock poisoned");
        let handle = set.slot(via).ok_or(FepError::ChannelClosed(via))?;
        handle.write(frame).ok_or(FepError::ChannelClosed(via))
    }

    /// Supervisor path: a socket died.
    async fn handle_down(self: &Arc<Self>, side: ChannelSide, cause: String) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }

        // Only reap a handle that really is dead; a second signal for a
        // side that already reconnected must not kill the fresh socket
        let removed = {
            let mut set = self.channels.lock().expect("client lock poisoned");
            let dead = set.slot(side).is_some_and(|handle| !handle.is_active());
            if dead {
                set.slot_mut(side).take()
            } else {
                None
            }
        };
        let Some(handle) = removed else { return };
        handle.shutdown();

        log::warn!("[Client] {side} socket down: {cause}");
        self.signed_on.store(false, Ordering::Release);
        self.stop_heartbeat();
        self.events.emit(FepEvent::Disconnected {
            side,
            cause: cause.clone(),
        });

        let (send_up, receive_up) = self.sides_up();
        match (self.config.mode, self.config.failure_strategy) {
            (Mode::Unified, _) => {
                let cancelled = self.pending.cancel_all(FepError::ChannelClosed(side));
                log::warn!("[Client] unified socket lost, cancelled {cancelled} pending");
                self.set_state(ClientState::Failed);
            }
            (Mode::Dual, FailureStrategy::FailWhenAnyDown) => {
                let cancelled = self.pending.cancel_all(FepError::ChannelClosed(side));
                log::warn!(
                    "[Client] {side} socket lost under FAIL_WHEN_ANY_DOWN, cancelled {cancelled} pending"
                );
                self.set_state(ClientState::Failed);
            }
            (Mode::Dual, _) => {
                if send_up {
                    self.set_state(ClientState::SendOnly);
                } else if receive_up {
                    self.set_state(ClientState::ReceiveOnly);
                } else {
                    let cancelled = self.pending.cancel_all(FepError::ChannelClosed(side));
                    log::warn!("[Client] both sockets down, cancelled {cancelled} pending");
                    self.set_state(ClientState::Failed);
                }
            }
        }

        if self.config.auto_reconnect {
            tokio::spawn(Self::reconnect_side(self.clone(), side));
        }
    }

    /// Re-establish one side: fixed delay plus jitter per attempt, backup
    /// endpoint first when the last success used it, bounded attempts.
    async fn reconnect_side(self: Arc<Self>, side: ChannelSide) {
        if self.reconnecting.swap(side, true) {
            return; // already being handled
        }
        let prefer_backup = self.using_backup.get(side);
        let max = self.config.max_retry_attempts;

        for attempt in 1..=max {
            if self.closed.load(Ordering::Acquire) {
                self.reconnecting.set(side, false);
                return;
            }
            self.set_state(ClientState::Reconnecting);
            self.events.emit(FepEvent::Reconnecting { side, attempt });

            let jitter = Duration::from_millis(rand::random::<u64>() % RECONNECT_JITTER_MS);
            tokio::time::sleep(self.config.retry_delay() + jitter).await;

            match self.open_side(side, prefer_backup).await {
                Ok(handle) => {
                    self.install(handle);
                    self.events.emit(FepEvent::Connected { side });
                    log::info!("[Client] {side} socket re-established (attempt {attempt})");

                    let (send_up, receive_up) = self.sides_up();
                    let all_up = match self.config.mode {
                        Mode::Dual => send_up && receive_up,
                        Mode::Unified => send_up,
                    };
                    if all_up {
                        self.set_state(match self.config.mode {
                            Mode::Dual => ClientState::BothConnected,
                            Mode::Unified => ClientState::UnifiedConnected,
                        });
                        match Self::sign_on(&self).await {
                            Ok(_) => log::info!("[Client] re-signed on after reconnect"),
                            Err(e) => log::warn!("[Client] re-sign-on failed: {e}"),
                        }
                    } else if send_up {
                        self.set_state(ClientState::SendOnly);
                    } else {
                        self.set_state(ClientState::ReceiveOnly);
                    }
                    self.reconnecting.set(side, false);
                    return;
                }
                Err(e) => {
                    log::warn!("[Client] {side} reconnect attempt {attempt}/{max} failed: {e}");
                }
            }
        }

        log::error!("[Client] {side} reconnect attempts exhausted after {max}");
        self.events.emit(FepEvent::TransportError {
            side,
            detail: format!("reconnect attempts exhausted after {max}"),
        });
        // The side stays disconnected; the aggregate reflects whatever is
        // still up
        let (send_up, receive_up) = self.sides_up();
        if !send_up && !receive_up {
            self.set_state(ClientState::Failed);
        } else if send_up {
            self.set_state(ClientState::SendOnly);
        } else {
            self.set_state(ClientState::ReceiveOnly);
        }
        self.reconnecting.set(side, false);
    }

    fn disconnect(&self, cause: &str) {
        let state = self.current_state();
        if matches!(state, ClientState::Closing | ClientState::Closed) {
            return;
        }
        self.set_state(ClientState::Closing);
        self.signed_on.store(false, Ordering::Release);
        self.stop_heartbeat();

        self.teardown_channels(cause);
        let cancelled = self
            .pending
            .cancel_all(FepError::ChannelClosed(self.response_side()));
        if cancelled > 0 {
            log::info!("[Client] cancelled {cancelled} pending requests on disconnect");
        }
        if !self.closed.load(Ordering::Acquire) {
            self.set_state(ClientState::Disconnected);
        }
    }

    /// Shut down and drop every socket, emitting a disconnect event per
    /// side that was up.
    fn teardown_channels(&self, cause: &str) {
        let handles: Vec<ChannelHandle> = {
            let mut set = self.channels.lock().expect("client lock poisoned");
            [set.send.take(), set.receive.take()]
                .into_iter()
                .flatten()
                .collect()
        };
        for handle in handles {
            handle.shutdown();
            self.events.emit(FepEvent::Disconnected {
                side: handle.side(),
                cause: cause.to_string(),
            });
        }
    }

    fn start_heartbeat(self: &Arc<Self>) {
        self.stop_heartbeat();

        let weak = Arc::downgrade(self);
        let interval_period = self.config.heartbeat_interval();
        let echo_timeout = self.config.heartbeat_timeout();

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval_period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            interval.tick().await; // the immediate first tick

            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                if inner.closed.load(Ordering::Acquire) || !inner.signed_on.load(Ordering::Acquire)
                {
                    break;
                }

                let mut echo = Message::new(Mti::NETWORK_MANAGEMENT_REQUEST);
                echo.set_str(field::NETWORK_MANAGEMENT_CODE, NETMGMT_ECHO);
                let via = inner.outbound_side();
                // Failures only warn: the receive socket's read-idle timer
                // is the liveness source of truth
                match ClientInner::exchange(&inner, via, echo, echo_timeout).await {
                    Ok(resp) if resp.response_code() == Some(RESPONSE_APPROVED) => {
                        log::debug!("[Client] heartbeat echo answered");
                    }
                    Ok(resp) => {
                        log::warn!(
                            "[Client] heartbeat echo returned code {:?}",
                            resp.response_code()
                        );
                    }
                    Err(e) => {
                        log::warn!("[Client] heartbeat failed: {e}");
                    }
                }
            }
        });
        *self.heartbeat_task.lock().expect("client lock poisoned") = Some(task);
    }

    fn stop_heartbeat(&self) {
        if let Some(task) = self.heartbeat_task.lock().expect("client lock poisoned").take() {
            task.abort();
        }
    }
}

/// Sign-on/sign-off responses must carry response code "00".
fn check_approved(response: &Message) -> Result<(), FepError> {
    match response.response_code() {
        Some(RESPONSE_APPROVED) => Ok(()),
        Some(code) => Err(FepError::SignOnRejected(code.to_string())),
        None => Err(FepError::SignOnRejected("missing field 39".to_string())),
    }
}

/// Connect one TCP stream with the configured socket tuning.
async fn connect_stream(endpoint: &Endpoint, config: &ClientConfig) -> io::Result<TcpStream> {
    let mut addrs = tokio::net::lookup_host(endpoint.addr()).await?;
    let addr = addrs.next().ok_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, format!("no address for {endpoint}"))
    })?;

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    if config.tcp_keepalive {
        socket.set_keepalive(true)?;
    }
    if let Some(bytes) = config.recv_buffer {
        socket.set_recv_buffer_size(bytes)?;
    }
    if let Some(bytes) = config.send_buffer {
        socket.set_send_buffer_size(bytes)?;
    }

    let stream = socket.connect(addr).await?;
    stream.set_nodelay(config.tcp_nodelay)?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Endpoint;

    fn test_client() -> FiscClient {
        let config = ClientConfig::dual(
            Endpoint::new("127.0.0.1", 19001),
            Endpoint::new("127.0.0.1", 19002),
            "001",
        );
        FiscClient::new(config, MessageCodec::fisc()).unwrap()
    }

    #[tokio::test]
    async fn test_traffic_refused_before_sign_on() {
        let client = test_client();
        let msg = Message::new(Mti::FINANCIAL_REQUEST);
        match client.send_and_receive(msg, Duration::from_secs(1)).await {
            Err(FepError::InvalidState(detail)) => assert!(detail.contains("signed-on")),
            other => panic!("Expected InvalidState, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_sign_on_refused_when_disconnected() {
        let client = test_client();
        match client.sign_on().await {
            Err(FepError::InvalidState(_)) => {}
            other => panic!("Expected InvalidState, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_connect_refused_after_close() {
        let client = test_client();
        client.close();
        assert_eq!(client.state(), ClientState::Closed);
        match client.connect().await {
            Err(FepError::InvalidState(detail)) => assert!(detail.contains("closed")),
            other => panic!("Expected InvalidState, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_connect_failure_reports_both_endpoints() {
        // Nothing listens on these ports; backup configured so both show up
        let mut config = ClientConfig::dual(
            Endpoint::new("127.0.0.1", 1),
            Endpoint::new("127.0.0.1", 2),
            "001",
        );
        config.send_backup = Some(Endpoint::new("127.0.0.1", 3));
        config.connect_timeout_ms = 500;
        config.auto_reconnect = false;
        let client = FiscClient::new(config, MessageCodec::fisc()).unwrap();

        match client.connect().await {
            Err(FepError::ConnectFailed(detail)) => {
                assert!(detail.contains("127.0.0.1:1"));
                assert!(detail.contains("127.0.0.1:3"));
            }
            other => panic!("Expected ConnectFailed, got: {other:?}"),
        }
        assert_eq!(client.state(), ClientState::Disconnected);
    }

    #[tokio::test]
    async fn test_fresh_stan_probes_past_collisions() {
        let client = test_client();
        let inner = &client.inner;

        // Occupy the next two counter values by hand
        let next = inner.stan_counter.load(Ordering::Relaxed);
        let _a = inner.pending.register(next, Duration::from_secs(5)).unwrap();
        let _b = inner
            .pending
            .register(next + 1, Duration::from_secs(5))
            .unwrap();

        let (stan, _reply) = inner
            .register_fresh_stan(Duration::from_secs(5))
            .unwrap();
        assert_eq!(stan, next + 2, "assignment must skip in-flight STANs");
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_terminal() {
        let client = test_client();
        client.close();
        client.close();
        assert_eq!(client.state(), ClientState::Closed);
        assert!(client.inner.pending.is_closed());
    }
}
