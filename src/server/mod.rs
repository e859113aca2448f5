//! Dual-port FISC simulator / bank-core server.
//!
//! The server mirrors the client's split-socket architecture from the
//! other side:
//!
//! ```text
//! FiscServer
//!     ├── receive listener  (clients' requests arrive here)
//!     ├── send listener     (clients' responses leave here)
//!     ├── ClientRouter      (field 32 → socket pair)
//!     ├── event loop        (request lifecycle: validate → handle → enqueue)
//!     └── dispatcher        (single task draining the response queue)
//! ```
//!
//! Requests are answered by per-MTI handler functions; a request with no
//! handler gets response code "12", a handler failure gets "96", and a
//! request the validation callback rejects gets the configured validation
//! code (default "30"). Responses travel through a bounded queue to one
//! dispatcher task, which routes by institution id and falls back, with
//! a warning, to the first live send-capable socket.
//!
//! Messages arriving on the send port are not requests: they identify the
//! socket (field 32) and, for network management, get answered so the
//! client's receive line can complete its own sign-on.

mod conn;
mod router;

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::net::TcpListener;
use tokio::sync::mpsc::{self, error::TrySendError, UnboundedSender};
use tokio::task::JoinHandle;

use crate::config::{Mode, ServerConfig};
use crate::constants::{
    RESPONSE_APPROVED, RESPONSE_INVALID_TRANSACTION, RESPONSE_SYSTEM_MALFUNCTION,
};
use crate::error::FepError;
use crate::framing::encode_frame;
use crate::iso::{field, Message, MessageCodec, Mti};

use conn::{ConnId, PortRole, ServerConn, ServerEvent};
use router::ClientRouter;

/// A request handler: builds the full response for one MTI.
type Handler = Arc<dyn Fn(&Message) -> anyhow::Result<Message> + Send + Sync>;

/// Validation callback: `None` accepts, `Some(reason)` rejects.
type Validator = Arc<dyn Fn(&Message) -> Option<String> + Send + Sync>;

/// One record on the inspection queue.
#[derive(Debug, Clone)]
pub struct ReceivedRequest {
    /// Server-side connection number the request arrived on.
    pub conn: u64,
    /// Institution id from field 32, when present.
    pub institution: Option<String>,
    /// The request's MTI.
    pub mti: Mti,
    /// The request's STAN, when present.
    pub stan: Option<String>,
    /// Arrival time.
    pub received_at: chrono::DateTime<chrono::Utc>,
}

/// Point-in-time statistics snapshot.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    /// Requests received on receive/unified sockets.
    pub received: u64,
    /// Responses and proactive messages written.
    pub sent: u64,
    /// Responses dropped: queue full, or no live socket to carry them.
    pub dropped: u64,
    /// Contained decode errors.
    pub decode_errors: u64,
    /// MTI of the most recent request.
    pub last_mti: Option<Mti>,
    /// STAN of the most recent request.
    pub last_stan: Option<String>,
}

/// A queued response on its way to the dispatcher.
struct Outgoing {
    institution: Option<String>,
    frame: Vec<u8>,
    descriptor: String,
}

struct Counters {
    received: AtomicU64,
    sent: AtomicU64,
    dropped: AtomicU64,
    decode_errors: AtomicU64,
}

struct ServerShared {
    config: ServerConfig,
    codec: Arc<MessageCodec>,
    router: ClientRouter,
    conns: Mutex<HashMap<ConnId, ServerConn>>,
    handlers: Mutex<HashMap<u16, Handler>>,
    validator: Mutex<Option<Validator>>,
    counters: Counters,
    last_mti: Mutex<Option<Mti>>,
    last_stan: Mutex<Option<String>>,
    inspection: Mutex<VecDeque<ReceivedRequest>>,
    response_tx: mpsc::Sender<Outgoing>,
    next_conn_id: AtomicU64,
}

/// The dual-port / unified FISC server.
pub struct FiscServer {
    shared: Arc<ServerShared>,
    receive_addr: Option<SocketAddr>,
    send_addr: Option<SocketAddr>,
    unified_addr: Option<SocketAddr>,
    tasks: Vec<JoinHandle<()>>,
}

impl FiscServer {
    /// Bind the configured listeners and start serving.
    pub async fn start(config: ServerConfig, codec: MessageCodec) -> anyhow::Result<Self> {
        config.validate()?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (response_tx, response_rx) = mpsc::channel(config.response_queue_capacity);

        let shared = Arc::new(ServerShared {
            config,
            codec: Arc::new(codec),
            router: ClientRouter::new(),
            conns: Mutex::new(HashMap::new()),
            handlers: Mutex::new(HashMap::new()),
            validator: Mutex::new(None),
            counters: Counters {
                received: AtomicU64::new(0),
                sent: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                decode_errors: AtomicU64::new(0),
            },
            last_mti: Mutex::new(None),
            last_stan: Mutex::new(None),
            inspection: Mutex::new(VecDeque::new()),
            response_tx,
            next_conn_id: AtomicU64::new(1),
        });

        let mut tasks = Vec::new();
        let mut receive_addr = None;
        let mut send_addr = None;
        let mut unified_addr = None;

        match shared.config.mode {
            Mode::Dual => {
                let receive_ep = shared.config.receive.clone().expect("validated");
                let send_ep = shared.config.send.clone().expect("validated");

                let receive_listener = TcpListener::bind(receive_ep.addr()).await?;
                receive_addr = Some(receive_listener.local_addr()?);
                let send_listener = TcpListener::bind(send_ep.addr()).await?;
                send_addr = Some(send_listener.local_addr()?);

                log::info!(
                    "[Server] listening: receive port {}, send port {}",
                    receive_addr.expect("bound"),
                    send_addr.expect("bound")
                );
                tasks.push(tokio::spawn(run_accept_loop(
                    shared.clone(),
                    receive_listener,
                    PortRole::Receive,
                    event_tx.clone(),
                )));
                tasks.push(tokio::spawn(run_accept_loop(
                    shared.clone(),
                    send_listener,
                    PortRole::Send,
                    event_tx.clone(),
                )));
            }
            Mode::Unified => {
                let endpoint = shared.config.unified.clone().expect("validated");
                let listener = TcpListener::bind(endpoint.addr()).await?;
                unified_addr = Some(listener.local_addr()?);
                log::info!("[Server] listening: unified port {}", unified_addr.expect("bound"));
                tasks.push(tokio::spawn(run_accept_loop(
                    shared.clone(),
                    listener,
                    PortRole::Unified,
                    event_tx.clone(),
                )));
            }
        }

        tasks.push(tokio::spawn(run_event_loop(shared.clone(), event_rx)));
        tasks.push(tokio::spawn(run_dispatcher(shared.clone(), response_rx)));

        Ok(Self {
            shared,
            receive_addr,
            send_addr,
            unified_addr,
            tasks,
        })
    }

    /// Register the handler for one request MTI, replacing any previous.
    pub fn register_handler<F>(&self, mti: Mti, handler: F)
    where
        F: Fn(&Message) -> anyhow::Result<Message> + Send + Sync + 'static,
    {
        self.shared
            .handlers
            .lock()
            .expect("server lock poisoned")
            .insert(mti.value(), Arc::new(handler));
    }

    /// Install the validation callback.
    pub fn set_validator<F>(&self, validator: F)
    where
        F: Fn(&Message) -> Option<String> + Send + Sync + 'static,
    {
        *self.shared.validator.lock().expect("server lock poisoned") = Some(Arc::new(validator));
    }

    /// Register the stock network-management handler: any 0800 is answered
    /// 0810 with field 70 echoed and response code "00".
    pub fn with_network_management_defaults(&self) -> &Self {
        self.register_handler(Mti::NETWORK_MANAGEMENT_REQUEST, |request| {
            Ok(network_management_response(request))
        });
        self
    }

    /// Write a server-initiated message to one institution's sending half.
    ///
    /// Returns `Ok(false)` when that institution has no live sending half
    /// (proactive sends never fall back to another client's socket).
    pub fn send_proactive(&self, institution: &str, message: &Message) -> Result<bool, FepError> {
        let frame = self.shared.encode_wire(message)?;
        let target = self.shared.router.sending_conn(institution);
        let conns = self.shared.conns.lock().expect("server lock poisoned");
        let delivered = target
            .and_then(|id| conns.get(&id))
            .map(|conn| conn.send_frame(frame))
            .unwrap_or(false);
        if delivered {
            self.shared.counters.sent.fetch_add(1, Ordering::Relaxed);
        } else {
            log::warn!("[Server] proactive message for {institution} has no live socket");
        }
        Ok(delivered)
    }

    /// Write a message to every live send-capable socket. Returns how many
    /// sockets accepted it.
    pub fn broadcast(&self, message: &Message) -> Result<usize, FepError> {
        let frame = self.shared.encode_wire(message)?;
        let conns = self.shared.conns.lock().expect("server lock poisoned");
        let mut delivered = 0;
        for conn in conns.values() {
            if conn.role().is_send_capable() && conn.send_frame(frame.clone()) {
                delivered += 1;
            }
        }
        self.shared
            .counters
            .sent
            .fetch_add(delivered as u64, Ordering::Relaxed);
        Ok(delivered)
    }

    /// Current statistics snapshot.
    pub fn stats(&self) -> ServerStats {
        let shared = &self.shared;
        ServerStats {
            received: shared.counters.received.load(Ordering::Relaxed),
            sent: shared.counters.sent.load(Ordering::Relaxed),
            dropped: shared.counters.dropped.load(Ordering::Relaxed),
            decode_errors: shared.counters.decode_errors.load(Ordering::Relaxed),
            last_mti: *shared.last_mti.lock().expect("server lock poisoned"),
            last_stan: shared.last_stan.lock().expect("server lock poisoned").clone(),
        }
    }

    /// Drain the inspection queue of received-request records.
    pub fn drain_received(&self) -> Vec<ReceivedRequest> {
        self.shared
            .inspection
            .lock()
            .expect("server lock poisoned")
            .drain(..)
            .collect()
    }

    /// Bound address of the receive listener (dual mode).
    pub fn receive_addr(&self) -> Option<SocketAddr> {
        self.receive_addr
    }

    /// Bound address of the send listener (dual mode).
    pub fn send_addr(&self) -> Option<SocketAddr> {
        self.send_addr
    }

    /// Bound address of the unified listener (unified mode).
    pub fn unified_addr(&self) -> Option<SocketAddr> {
        self.unified_addr
    }

    /// Number of currently accepted sockets.
    pub fn connection_count(&self) -> usize {
        self.shared.conns.lock().expect("server lock poisoned").len()
    }

    /// Institutions with at least one registered half.
    pub fn institutions(&self) -> Vec<String> {
        self.shared.router.institutions()
    }

    /// Stop the listeners, loops and every connection.
    pub fn shutdown(&self) {
        for task in &self.tasks {
            task.abort();
        }
        self.shared
            .conns
            .lock()
            .expect("server lock poisoned")
            .clear();
        log::info!("[Server] shut down");
    }
}

impl Drop for FiscServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for FiscServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FiscServer")
            .field("receive_addr", &self.receive_addr)
            .field("send_addr", &self.send_addr)
            .field("unified_addr", &self.unified_addr)
            .finish_non_exhaustive()
    }
}

impl ServerShared {
    fn encode_wire(&self, message: &Message) -> Result<Vec<u8>, FepError> {
        let body = self.codec.encode(message)?;
        encode_frame(&self.config.framer, &body)
            .map_err(|e| FepError::Malformed(format!("framing: {e}")))
    }

    /// Queue a response for the dispatcher, applying the drop-newest
    /// policy when the bounded queue is full.
    fn enqueue_response(&self, institution: Option<String>, response: &Message) {
        let frame = match self.encode_wire(response) {
            Ok(frame) => frame,
            Err(e) => {
                log::error!("[Server] failed to encode response: {e}");
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        let descriptor = format!(
            "{} STAN {}",
            response.mti(),
            response.stan().unwrap_or("none")
        );
        match self.response_tx.try_send(Outgoing {
            institution,
            frame,
            descriptor,
        }) {
            Ok(()) => {}
            Err(TrySendError::Full(outgoing)) => {
                log::warn!(
                    "[Server] response queue full, dropping {}",
                    outgoing.descriptor
                );
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Closed(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// The stock 0810: trace fields and field 70 echoed, response code "00".
fn network_management_response(request: &Message) -> Message {
    let mut response = Message::response_to(request);
    if let Some(code) = request.get(field::NETWORK_MANAGEMENT_CODE) {
        response.set(field::NETWORK_MANAGEMENT_CODE, code.to_vec());
    }
    response.set_response_code(RESPONSE_APPROVED);
    response
}

async fn run_accept_loop(
    shared: Arc<ServerShared>,
    listener: TcpListener,
    role: PortRole,
    event_tx: UnboundedSender<ServerEvent>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                if shared.config.tcp_nodelay {
                    let _ = stream.set_nodelay(true);
                }
                let conn_id = shared.next_conn_id.fetch_add(1, Ordering::Relaxed);
                log::info!("[Server] conn #{conn_id} accepted on the {role} port from {peer}");

                let conn = ServerConn::new(
                    conn_id,
                    role,
                    peer,
                    stream,
                    shared.config.framer.clone(),
                    shared.codec.clone(),
                    event_tx.clone(),
                );
                if event_tx.send(ServerEvent::Connected { conn }).is_err() {
                    log::warn!("[Server] event loop gone, stopping {role} accept loop");
                    break;
                }
            }
            Err(e) => {
                log::error!("[Server] accept error on the {role} port: {e}");
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}

async fn run_event_loop(
    shared: Arc<ServerShared>,
    mut event_rx: mpsc::UnboundedReceiver<ServerEvent>,
) {
    while let Some(event) = event_rx.recv().await {
        match event {
            ServerEvent::Connected { conn } => {
                shared
                    .conns
                    .lock()
                    .expect("server lock poisoned")
                    .insert(conn.conn_id(), conn);
            }
            ServerEvent::Disconnected { conn_id } => {
                if let Some(conn) = shared
                    .conns
                    .lock()
                    .expect("server lock poisoned")
                    .remove(&conn_id)
                {
                    log::info!("[Server] conn #{conn_id} ({}, {}) removed", conn.role(), conn.peer());
                }
                shared.router.forget_conn(conn_id);
            }
            ServerEvent::DecodeError { conn_id, detail } => {
                shared.counters.decode_errors.fetch_add(1, Ordering::Relaxed);
                log::warn!("[Server] conn #{conn_id} decode error (contained): {detail}");
            }
            ServerEvent::Message {
                conn_id,
                role,
                message,
            } => {
                handle_message(&shared, conn_id, role, message);
            }
        }
    }
}

fn handle_message(shared: &Arc<ServerShared>, conn_id: ConnId, role: PortRole, message: Message) {
    // Lazy routing registration from field 32
    if let Some(institution) = message.institution_id() {
        match role {
            PortRole::Receive => shared.router.register_receiving(institution, conn_id),
            PortRole::Send => shared.router.register_sending(institution, conn_id),
            PortRole::Unified => {
                shared.router.register_receiving(institution, conn_id);
                shared.router.register_sending(institution, conn_id);
            }
        }
    }

    // Send-port sockets do not carry requests; their traffic identifies
    // the socket, and network management gets answered so the client's
    // receive line can finish its own sign-on
    if role == PortRole::Send {
        if message.mti() == Mti::NETWORK_MANAGEMENT_REQUEST {
            let response = network_management_response(&message);
            shared.enqueue_response(message.institution_id().map(str::to_string), &response);
        } else {
            log::warn!(
                "[Server] conn #{conn_id} sent {} on the send port, ignoring",
                message.mti()
            );
        }
        return;
    }

    // Request lifecycle proper
    shared.counters.received.fetch_add(1, Ordering::Relaxed);
    *shared.last_mti.lock().expect("server lock poisoned") = Some(message.mti());
    *shared.last_stan.lock().expect("server lock poisoned") =
        message.stan().map(str::to_string);
    {
        let mut inspection = shared.inspection.lock().expect("server lock poisoned");
        inspection.push_back(ReceivedRequest {
            conn: conn_id,
            institution: message.institution_id().map(str::to_string),
            mti: message.mti(),
            stan: message.stan().map(str::to_string),
            received_at: chrono::Utc::now(),
        });
        while inspection.len() > shared.config.inspection_queue_capacity {
            inspection.pop_front();
        }
    }

    let validator = shared.validator.lock().expect("server lock poisoned").clone();
    let rejection = validator.and_then(|validate| validate(&message));
    let response = if let Some(reason) = rejection {
        log::info!(
            "[Server] request {} STAN {} rejected: {reason}",
            message.mti(),
            message.stan().unwrap_or("none")
        );
        let mut response = Message::response_to(&message);
        response.set_response_code(&shared.config.validation_error_code);
        response
    } else {
        let handler = shared
            .handlers
            .lock()
            .expect("server lock poisoned")
            .get(&message.mti().value())
            .cloned();
        match handler {
            Some(handler) => match catch_unwind(AssertUnwindSafe(|| handler(&message))) {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => {
                    log::error!("[Server] handler for {} failed: {e}", message.mti());
                    let mut response = Message::response_to(&message);
                    response.set_response_code(RESPONSE_SYSTEM_MALFUNCTION);
                    response
                }
                Err(_) => {
                    log::error!("[Server] handler for {} panicked", message.mti());
                    let mut response = Message::response_to(&message);
                    response.set_response_code(RESPONSE_SYSTEM_MALFUNCTION);
                    response
                }
            },
            None => {
                log::warn!("[Server] no handler for {}", message.mti());
                let mut response = Message::response_to(&message);
                response.set_response_code(RESPONSE_INVALID_TRANSACTION);
                response
            }
        }
    };

    shared.enqueue_response(message.institution_id().map(str::to_string), &response);
}

/// The single dispatcher: drains the response queue, applies the optional
/// delay, and routes each response to its institution's sending half,
/// or, with a warning, to the first live send-capable socket.
async fn run_dispatcher(shared: Arc<ServerShared>, mut response_rx: mpsc::Receiver<Outgoing>) {
    while let Some(outgoing) = response_rx.recv().await {
        if let Some(delay) = shared.config.response_delay() {
            tokio::time::sleep(delay).await;
        }

        let routed = shared
            .config
            .routing_enabled
            .then_some(outgoing.institution.as_deref())
            .flatten()
            .and_then(|institution| shared.router.sending_conn(institution));

        let delivered = {
            let conns = shared.conns.lock().expect("server lock poisoned");
            let direct = routed
                .and_then(|id| conns.get(&id))
                .filter(|conn| conn.is_active());
            match direct {
                Some(conn) => conn.send_frame(outgoing.frame.clone()),
                None => {
                    let fallback = conns
                        .values()
                        .find(|conn| conn.role().is_send_capable() && conn.is_active());
                    match fallback {
                        Some(conn) => {
                            if shared.config.routing_enabled && outgoing.institution.is_some() {
                                log::warn!(
                                    "[Server] no sending half for institution {:?}, falling back to conn #{}",
                                    outgoing.institution,
                                    conn.conn_id()
                                );
                            }
                            conn.send_frame(outgoing.frame.clone())
                        }
                        None => false,
                    }
                }
            }
        };

        if delivered {
            shared.counters.sent.fetch_add(1, Ordering::Relaxed);
        } else {
            shared.counters.dropped.fetch_add(1, Ordering::Relaxed);
            log::warn!(
                "[Server] dropped {}: no live socket to carry it",
                outgoing.descriptor
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Endpoint;
    use crate::framing::FrameDecoder;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn test_config() -> ServerConfig {
        ServerConfig::dual(Endpoint::new("127.0.0.1", 0), Endpoint::new("127.0.0.1", 0))
    }

    fn sign_on_request(institution: &str, stan: u32) -> Message {
        let mut msg = Message::new(Mti::NETWORK_MANAGEMENT_REQUEST);
        msg.set_str(field::TRANSMISSION_DATETIME, "0701120000")
            .set_stan(stan)
            .set_str(field::ACQUIRING_INSTITUTION, institution)
            .set_str(field::NETWORK_MANAGEMENT_CODE, "001");
        msg
    }

    async fn write_message(stream: &mut TcpStream, server: &FiscServer, msg: &Message) {
        let frame = server.shared.encode_wire(msg).unwrap();
        stream.write_all(&frame).await.unwrap();
    }

    async fn read_message(stream: &mut TcpStream, server: &FiscServer) -> Message {
        let mut decoder = FrameDecoder::new(server.shared.config.framer.clone());
        let mut buf = [0u8; 4096];
        loop {
            let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
                .await
                .expect("Timed out waiting for server bytes")
                .expect("Read failed");
            assert!(n > 0, "server closed the socket");
            let mut bodies = decoder.feed(&buf[..n]).unwrap();
            if let Some(body) = bodies.pop() {
                return server.shared.codec.decode(&body).unwrap().0;
            }
        }
    }

    #[tokio::test]
    async fn test_send_port_sign_on_is_answered_on_itself() {
        let server = FiscServer::start(test_config(), MessageCodec::fisc())
            .await
            .unwrap();

        let mut send_sock = TcpStream::connect(server.send_addr().unwrap()).await.unwrap();
        write_message(&mut send_sock, &server, &sign_on_request("001", 1)).await;

        let response = read_message(&mut send_sock, &server).await;
        assert_eq!(response.mti(), Mti::NETWORK_MANAGEMENT_RESPONSE);
        assert_eq!(response.response_code(), Some("00"));
        assert_eq!(response.network_code(), Some("001"));
        assert_eq!(response.stan(), Some("000001"));
    }

    #[tokio::test]
    async fn test_unhandled_mti_gets_code_12() {
        let server = FiscServer::start(test_config(), MessageCodec::fisc())
            .await
            .unwrap();

        // Pair both halves for institution 001 first
        let mut send_sock = TcpStream::connect(server.send_addr().unwrap()).await.unwrap();
        write_message(&mut send_sock, &server, &sign_on_request("001", 1)).await;
        let _ = read_message(&mut send_sock, &server).await;

        let mut recv_sock = TcpStream::connect(server.receive_addr().unwrap()).await.unwrap();
        let mut request = Message::new(Mti::FINANCIAL_REQUEST);
        request
            .set_str(field::PROCESSING_CODE, "000000")
            .set_str(field::TRANSMISSION_DATETIME, "0701120000")
            .set_stan(2)
            .set_str(field::ACQUIRING_INSTITUTION, "001");
        write_message(&mut recv_sock, &server, &request).await;

        let response = read_message(&mut send_sock, &server).await;
        assert_eq!(response.mti().to_string(), "0210");
        assert_eq!(response.response_code(), Some("12"));
        assert_eq!(response.stan(), Some("000002"));
    }

    #[tokio::test]
    async fn test_validator_rejection_uses_configured_code() {
        let server = FiscServer::start(test_config(), MessageCodec::fisc())
            .await
            .unwrap();
        server.with_network_management_defaults();
        server.set_validator(|request| {
            (!request.has(field::AMOUNT)).then(|| "missing amount".to_string())
        });

        let mut send_sock = TcpStream::connect(server.send_addr().unwrap()).await.unwrap();
        write_message(&mut send_sock, &server, &sign_on_request("001", 1)).await;
        let _ = read_message(&mut send_sock, &server).await;

        let mut recv_sock = TcpStream::connect(server.receive_addr().unwrap()).await.unwrap();
        let mut request = Message::new(Mti::FINANCIAL_REQUEST);
        request
            .set_str(field::PROCESSING_CODE, "000000")
            .set_str(field::TRANSMISSION_DATETIME, "0701120000")
            .set_stan(7)
            .set_str(field::ACQUIRING_INSTITUTION, "001");
        write_message(&mut recv_sock, &server, &request).await;

        let response = read_message(&mut send_sock, &server).await;
        assert_eq!(response.response_code(), Some("30"));
    }

    #[tokio::test]
    async fn test_handler_error_yields_code_96() {
        let server = FiscServer::start(test_config(), MessageCodec::fisc())
            .await
            .unwrap();
        server.register_handler(Mti::FINANCIAL_REQUEST, |_| {
            anyhow::bail!("core banking offline")
        });

        let mut send_sock = TcpStream::connect(server.send_addr().unwrap()).await.unwrap();
        write_message(&mut send_sock, &server, &sign_on_request("001", 1)).await;
        let _ = read_message(&mut send_sock, &server).await;

        let mut recv_sock = TcpStream::connect(server.receive_addr().unwrap()).await.unwrap();
        let mut request = Message::new(Mti::FINANCIAL_REQUEST);
        request
            .set_str(field::PROCESSING_CODE, "000000")
            .set_str(field::TRANSMISSION_DATETIME, "0701120000")
            .set_stan(9)
            .set_str(field::ACQUIRING_INSTITUTION, "001");
        write_message(&mut recv_sock, &server, &request).await;

        let response = read_message(&mut send_sock, &server).await;
        assert_eq!(response.response_code(), Some("96"));
    }

    #[tokio::test]
    async fn test_decode_error_is_contained() {
        let server = FiscServer::start(test_config(), MessageCodec::fisc())
            .await
            .unwrap();
        server.with_network_management_defaults();

        let mut send_sock = TcpStream::connect(server.send_addr().unwrap()).await.unwrap();
        // A zero length prefix is a framing error; the connection must
        // survive and the next frame must still be answered
        send_sock.write_all(&[0x00, 0x00]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        write_message(&mut send_sock, &server, &sign_on_request("001", 4)).await;
        let response = read_message(&mut send_sock, &server).await;
        assert_eq!(response.response_code(), Some("00"));
        assert!(server.stats().decode_errors >= 1);
    }

    #[tokio::test]
    async fn test_response_with_no_socket_is_dropped_and_counted() {
        let server = FiscServer::start(test_config(), MessageCodec::fisc())
            .await
            .unwrap();
        server.with_network_management_defaults();

        // Only a receive-side socket: nothing can carry the response
        let mut recv_sock = TcpStream::connect(server.receive_addr().unwrap()).await.unwrap();
        write_message(&mut recv_sock, &server, &sign_on_request("001", 1)).await;

        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if server.stats().dropped >= 1 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("Timed out waiting for the drop counter");

        let stats = server.stats();
        assert_eq!(stats.received, 1);
        assert_eq!(stats.sent, 0);
    }

    #[tokio::test]
    async fn test_stats_and_inspection_record_requests() {
        let server = FiscServer::start(test_config(), MessageCodec::fisc())
            .await
            .unwrap();
        server.with_network_management_defaults();

        let mut send_sock = TcpStream::connect(server.send_addr().unwrap()).await.unwrap();
        write_message(&mut send_sock, &server, &sign_on_request("001", 1)).await;
        let _ = read_message(&mut send_sock, &server).await;

        let mut recv_sock = TcpStream::connect(server.receive_addr().unwrap()).await.unwrap();
        write_message(&mut recv_sock, &server, &sign_on_request("001", 42)).await;
        let _ = read_message(&mut send_sock, &server).await;

        let stats = server.stats();
        assert_eq!(stats.received, 1, "send-port identification is not a request");
        assert_eq!(stats.last_mti, Some(Mti::NETWORK_MANAGEMENT_REQUEST));
        assert_eq!(stats.last_stan.as_deref(), Some("000042"));

        let records = server.drain_received();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].institution.as_deref(), Some("001"));
        assert_eq!(records[0].stan.as_deref(), Some("000042"));
        assert!(server.drain_received().is_empty());
    }

    #[tokio::test]
    async fn test_proactive_send_and_miss() {
        let server = FiscServer::start(test_config(), MessageCodec::fisc())
            .await
            .unwrap();

        let mut send_sock = TcpStream::connect(server.send_addr().unwrap()).await.unwrap();
        write_message(&mut send_sock, &server, &sign_on_request("001", 1)).await;
        let _ = read_message(&mut send_sock, &server).await;

        let mut notice = Message::new(Mti::NETWORK_MANAGEMENT_REQUEST);
        notice
            .set_str(field::TRANSMISSION_DATETIME, "0701120000")
            .set_stan(900)
            .set_str(field::NETWORK_MANAGEMENT_CODE, "301");

        assert!(server.send_proactive("001", &notice).unwrap());
        let delivered = read_message(&mut send_sock, &server).await;
        assert_eq!(delivered.stan(), Some("000900"));

        assert!(!server.send_proactive("999", &notice).unwrap());
    }
}
