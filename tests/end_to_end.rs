//! End-to-end scenarios over real localhost TCP.
//!
//! The happy-path, routing and failover scenarios run a real `FiscServer`;
//! the correlation, timeout and receive-death scenarios run a scripted
//! switch built from raw sockets plus the crate's own framer and codec, so
//! the peer can misbehave in exactly the way each scenario needs
//! (out-of-order responses, withheld responses, deliberate socket death).

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use fiscgate::iso::field;
use fiscgate::{
    ChannelSide, ClientConfig, ClientState, Endpoint, FailureStrategy, FepError, FepEvent,
    FiscClient, FiscServer, FrameDecoder, FramerConfig, Message, MessageCodec, Mti, ServerConfig,
};

fn endpoint(addr: SocketAddr) -> Endpoint {
    Endpoint::new(addr.ip().to_string(), addr.port())
}

/// Dual-port server with sign-on/echo defaults and an approving 0200
/// handler.
async fn start_switch() -> FiscServer {
    let config = ServerConfig::dual(Endpoint::new("127.0.0.1", 0), Endpoint::new("127.0.0.1", 0));
    let server = FiscServer::start(config, MessageCodec::fisc()).await.unwrap();
    server.with_network_management_defaults();
    server.register_handler(Mti::FINANCIAL_REQUEST, |request| {
        let mut response = Message::response_to(request);
        response.set_response_code("00");
        Ok(response)
    });
    server
}

/// Client config wired at a running server: the client's send socket dials
/// the server's receive port and vice versa.
fn client_config(server: &FiscServer, institution: &str) -> ClientConfig {
    let mut config = ClientConfig::dual(
        endpoint(server.receive_addr().unwrap()),
        endpoint(server.send_addr().unwrap()),
        institution,
    );
    config.connect_timeout_ms = 2_000;
    config.read_timeout_ms = 2_000;
    config.retry_delay_ms = 100;
    config
}

fn financial_request(stan: &str) -> Message {
    let mut msg = Message::new(Mti::FINANCIAL_REQUEST);
    msg.set_str(field::PROCESSING_CODE, "000000")
        .set_str(field::AMOUNT, "000000010000")
        .set_str(field::STAN, stan);
    msg
}

fn echo_request(stan: &str) -> Message {
    let mut msg = Message::new(Mti::NETWORK_MANAGEMENT_REQUEST);
    msg.set_str(field::STAN, stan)
        .set_str(field::NETWORK_MANAGEMENT_CODE, "301");
    msg
}

// ---------------------------------------------------------------------
// Scripted switch: raw sockets + the crate's framer/codec
// ---------------------------------------------------------------------

struct PeerConn {
    stream: TcpStream,
    decoder: FrameDecoder,
    codec: MessageCodec,
    framer: FramerConfig,
    inbox: std::collections::VecDeque<Message>,
}

impl PeerConn {
    fn new(stream: TcpStream) -> Self {
        let framer = FramerConfig::default();
        Self {
            stream,
            decoder: FrameDecoder::new(framer.clone()),
            codec: MessageCodec::fisc(),
            framer,
            inbox: std::collections::VecDeque::new(),
        }
    }

    async fn read_message(&mut self) -> Message {
        let mut buf = [0u8; 4096];
        loop {
            if let Some(message) = self.inbox.pop_front() {
                return message;
            }
            let n = tokio::time::timeout(Duration::from_secs(5), self.stream.read(&mut buf))
                .await
                .expect("Timed out reading from client")
                .expect("Read failed");
            assert!(n > 0, "client closed the socket");
            for body in self.decoder.feed(&buf[..n]).unwrap() {
                self.inbox.push_back(self.codec.decode(&body).unwrap().0);
            }
        }
    }

    async fn write_message(&mut self, message: &Message) {
        let body = self.codec.encode(message).unwrap();
        let frame = fiscgate::framing::encode_frame(&self.framer, &body).unwrap();
        self.stream.write_all(&frame).await.unwrap();
    }
}

fn approved_netmgmt(request: &Message) -> Message {
    let mut response = Message::response_to(request);
    if let Some(code) = request.get(field::NETWORK_MANAGEMENT_CODE) {
        response.set(field::NETWORK_MANAGEMENT_CODE, code.to_vec());
    }
    response.set_response_code("00");
    response
}

struct ScriptedSwitch {
    recv_listener: TcpListener,
    send_listener: TcpListener,
}

impl ScriptedSwitch {
    async fn bind() -> Self {
        Self {
            recv_listener: TcpListener::bind("127.0.0.1:0").await.unwrap(),
            send_listener: TcpListener::bind("127.0.0.1:0").await.unwrap(),
        }
    }

    fn client_config(&self, institution: &str) -> ClientConfig {
        let mut config = ClientConfig::dual(
            endpoint(self.recv_listener.local_addr().unwrap()),
            endpoint(self.send_listener.local_addr().unwrap()),
            institution,
        );
        config.connect_timeout_ms = 2_000;
        config.read_timeout_ms = 2_000;
        config.retry_delay_ms = 100;
        config
    }

    /// Accept the client's two sockets. The client opens its send socket
    /// (towards our receive listener) first.
    async fn accept_pair(&self) -> (PeerConn, PeerConn) {
        let (recv_side, _) = tokio::time::timeout(Duration::from_secs(5), self.recv_listener.accept())
            .await
            .expect("Timed out waiting for the client send socket")
            .unwrap();
        let (send_side, _) = tokio::time::timeout(Duration::from_secs(5), self.send_listener.accept())
            .await
            .expect("Timed out waiting for the client receive socket")
            .unwrap();
        (PeerConn::new(recv_side), PeerConn::new(send_side))
    }

    /// Play the dual-line sign-on: identification on the send-port socket
    /// answered on itself, then the real sign-on answered across lines.
    async fn complete_sign_on(&self, recv_conn: &mut PeerConn, send_conn: &mut PeerConn) {
        let identification = send_conn.read_message().await;
        assert_eq!(identification.mti(), Mti::NETWORK_MANAGEMENT_REQUEST);
        assert_eq!(identification.network_code(), Some("001"));
        let reply = approved_netmgmt(&identification);
        send_conn.write_message(&reply).await;

        let sign_on = recv_conn.read_message().await;
        assert_eq!(sign_on.mti(), Mti::NETWORK_MANAGEMENT_REQUEST);
        let reply = approved_netmgmt(&sign_on);
        send_conn.write_message(&reply).await;
    }
}

/// Wait for the next `Unsolicited` event, skipping everything else.
async fn next_unsolicited(
    events: &mut tokio::sync::broadcast::Receiver<FepEvent>,
    deadline: Duration,
) -> Message {
    let wait = async {
        loop {
            match events.recv().await {
                Ok(FepEvent::Unsolicited { message }) => return message,
                Ok(_) => continue,
                Err(e) => panic!("event stream ended: {e}"),
            }
        }
    };
    tokio::time::timeout(deadline, wait)
        .await
        .expect("Timed out waiting for an unsolicited message")
}

// ---------------------------------------------------------------------
// Scenario 1: happy-path sign-on and echo
// ---------------------------------------------------------------------

#[tokio::test]
async fn test_happy_path_sign_on_and_echo() {
    let server = start_switch().await;
    let client = FiscClient::new(client_config(&server, "001"), MessageCodec::fisc()).unwrap();

    client.connect().await.unwrap();
    assert_eq!(client.state(), ClientState::BothConnected);

    let sign_on = client.sign_on().await.unwrap();
    assert_eq!(sign_on.mti(), Mti::NETWORK_MANAGEMENT_RESPONSE);
    assert_eq!(sign_on.response_code(), Some("00"));
    assert_eq!(client.state(), ClientState::SignedOn);
    assert!(client.is_signed_on());

    let response = client
        .send_and_receive(echo_request("000002"), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(response.mti().to_string(), "0810");
    assert_eq!(response.stan(), Some("000002"));
    assert_eq!(response.response_code(), Some("00"));
    assert_eq!(response.network_code(), Some("301"));

    client.close();
}

// ---------------------------------------------------------------------
// Scenario 2: STAN correlation under out-of-order responses
// ---------------------------------------------------------------------

#[tokio::test]
async fn test_stan_correlation_under_interleaving() {
    let switch = ScriptedSwitch::bind().await;
    let client = FiscClient::new(switch.client_config("001"), MessageCodec::fisc()).unwrap();

    let driver = {
        let client = client.clone();
        tokio::spawn(async move {
            client.connect().await.unwrap();
            client.sign_on().await.unwrap();

            let calls = ["100001", "100002", "100003"].map(|stan| {
                let client = client.clone();
                tokio::spawn(async move {
                    client
                        .send_and_receive(financial_request(stan), Duration::from_secs(5))
                        .await
                })
            });
            let mut results = Vec::new();
            for call in calls {
                results.push(call.await.unwrap());
            }
            client.close();
            results
        })
    };

    let (mut recv_conn, mut send_conn) = switch.accept_pair().await;
    switch.complete_sign_on(&mut recv_conn, &mut send_conn).await;

    let mut requests = Vec::new();
    for _ in 0..3 {
        requests.push(recv_conn.read_message().await);
    }

    // Answer in the order 100002, 100003, 100001
    for wanted in ["100002", "100003", "100001"] {
        let request = requests
            .iter()
            .find(|r| r.stan() == Some(wanted))
            .expect("request with that STAN arrived");
        let mut response = Message::response_to(request);
        response.set_response_code("00");
        send_conn.write_message(&response).await;
    }

    let results = driver.await.unwrap();
    for (i, expected_stan) in ["100001", "100002", "100003"].iter().enumerate() {
        let response = results[i].as_ref().unwrap();
        assert_eq!(response.stan(), Some(*expected_stan), "call {i} mismatched");
        assert_eq!(response.mti().to_string(), "0210");
        assert_eq!(response.response_code(), Some("00"));
    }
}

// ---------------------------------------------------------------------
// Scenario 3: timeout, then the late response goes to the unsolicited path
// ---------------------------------------------------------------------

#[tokio::test]
async fn test_timeout_then_late_response_is_unsolicited() {
    let switch = ScriptedSwitch::bind().await;
    let client = FiscClient::new(switch.client_config("001"), MessageCodec::fisc()).unwrap();
    let mut events = client.subscribe();

    let driver = {
        let client = client.clone();
        tokio::spawn(async move {
            client.connect().await.unwrap();
            client.sign_on().await.unwrap();
            let started = Instant::now();
            let result = client
                .send_and_receive(financial_request("200001"), Duration::from_millis(500))
                .await;
            (result, started.elapsed())
        })
    };

    let (mut recv_conn, mut send_conn) = switch.accept_pair().await;
    switch.complete_sign_on(&mut recv_conn, &mut send_conn).await;

    let request = recv_conn.read_message().await;
    assert_eq!(request.stan(), Some("200001"));

    // Withhold the response past the caller's deadline
    tokio::time::sleep(Duration::from_millis(600)).await;
    let mut response = Message::response_to(&request);
    response.set_response_code("00");
    send_conn.write_message(&response).await;

    let (result, elapsed) = driver.await.unwrap();
    match result {
        Err(FepError::Timeout) => {}
        other => panic!("Expected Timeout, got: {other:?}"),
    }
    assert!(
        elapsed >= Duration::from_millis(450) && elapsed <= Duration::from_millis(1_000),
        "timeout fired at {elapsed:?}, wanted ~500ms"
    );

    let late = next_unsolicited(&mut events, Duration::from_secs(2)).await;
    assert_eq!(late.stan(), Some("200001"));
    client.close();
}

// ---------------------------------------------------------------------
// Scenario 4: receive-socket death under FAIL_WHEN_BOTH_DOWN
// ---------------------------------------------------------------------

#[tokio::test]
async fn test_receive_socket_death_degrades_then_recovers() {
    let switch = ScriptedSwitch::bind().await;
    let client = FiscClient::new(switch.client_config("001"), MessageCodec::fisc()).unwrap();

    let connector = {
        let client = client.clone();
        tokio::spawn(async move {
            client.connect().await.unwrap();
            client.sign_on().await.unwrap();
        })
    };
    let (mut recv_conn, mut send_conn) = switch.accept_pair().await;
    switch.complete_sign_on(&mut recv_conn, &mut send_conn).await;
    connector.await.unwrap();

    // Two in-flight requests the switch never answers
    let pending: Vec<_> = ["300001", "300002"]
        .map(|stan| {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .send_and_receive(financial_request(stan), Duration::from_millis(600))
                    .await
            })
        })
        .into_iter()
        .collect();
    let _one = recv_conn.read_message().await;
    let _two = recv_conn.read_message().await;
    assert_eq!(client.pending_count(), 2);

    // Kill the client's receive socket only
    drop(send_conn);

    // Send side stays up: the client degrades instead of failing
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let state = client.state();
            if state == ClientState::SendOnly || state == ClientState::Reconnecting {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("client never left the signed-on state");
    assert!(!client.is_signed_on());

    // The in-flight requests run into their own deadlines
    for task in pending {
        match task.await.unwrap() {
            Err(FepError::Timeout) => {}
            other => panic!("Expected Timeout, got: {other:?}"),
        }
    }

    // Auto-reconnect dials our send listener again and re-signs on
    let (new_send, _) =
        tokio::time::timeout(Duration::from_secs(5), switch.send_listener.accept())
            .await
            .expect("Timed out waiting for the reconnect")
            .unwrap();
    let mut new_send = PeerConn::new(new_send);

    let identification = new_send.read_message().await;
    new_send.write_message(&approved_netmgmt(&identification)).await;
    let sign_on = recv_conn.read_message().await;
    new_send.write_message(&approved_netmgmt(&sign_on)).await;

    tokio::time::timeout(Duration::from_secs(2), async {
        while client.state() != ClientState::SignedOn {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("client never re-signed on");
    assert!(client.is_signed_on());
    client.close();
}

// ---------------------------------------------------------------------
// Scenario 5: per-institution routing and broadcast
// ---------------------------------------------------------------------

#[tokio::test]
async fn test_server_routes_by_institution_and_broadcasts() {
    let server = start_switch().await;

    let client_a = FiscClient::new(client_config(&server, "001"), MessageCodec::fisc()).unwrap();
    let client_b = FiscClient::new(client_config(&server, "002"), MessageCodec::fisc()).unwrap();
    client_a.connect().await.unwrap();
    client_a.sign_on().await.unwrap();
    client_b.connect().await.unwrap();
    client_b.sign_on().await.unwrap();

    let mut events_a = client_a.subscribe();
    let mut events_b = client_b.subscribe();

    // A's request completes on A; B sees nothing
    let response = client_a
        .send_and_receive(financial_request("300001"), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(response.stan(), Some("300001"));
    assert_eq!(response.response_code(), Some("00"));

    let nothing = tokio::time::timeout(Duration::from_millis(300), async {
        loop {
            if let Ok(FepEvent::Unsolicited { message }) = events_b.recv().await {
                return message;
            }
        }
    })
    .await;
    assert!(nothing.is_err(), "B received A's traffic: {nothing:?}");

    // Broadcast reaches each client exactly once
    let mut notice = Message::new(Mti::NETWORK_MANAGEMENT_REQUEST);
    notice
        .set_str(field::TRANSMISSION_DATETIME, "0701120000")
        .set_str(field::STAN, "900001")
        .set_str(field::NETWORK_MANAGEMENT_CODE, "301");
    assert_eq!(server.broadcast(&notice).unwrap(), 2);

    let to_a = next_unsolicited(&mut events_a, Duration::from_secs(2)).await;
    assert_eq!(to_a.stan(), Some("900001"));
    let to_b = next_unsolicited(&mut events_b, Duration::from_secs(2)).await;
    assert_eq!(to_b.stan(), Some("900001"));

    client_a.close();
    client_b.close();
}

// ---------------------------------------------------------------------
// Scenario 6: backup failover on first connect
// ---------------------------------------------------------------------

/// An address that refuses connections: bind, note the port, drop.
async fn refused_endpoint() -> Endpoint {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    endpoint(addr)
}

#[tokio::test]
async fn test_backup_failover_on_connect() {
    let server = start_switch().await;

    let mut config = ClientConfig::dual(refused_endpoint().await, refused_endpoint().await, "001");
    config.send_backup = Some(endpoint(server.receive_addr().unwrap()));
    config.receive_backup = Some(endpoint(server.send_addr().unwrap()));
    config.connect_timeout_ms = 1_000;
    config.read_timeout_ms = 2_000;

    let client = FiscClient::new(config, MessageCodec::fisc()).unwrap();
    client.connect().await.unwrap();
    assert_eq!(client.state(), ClientState::BothConnected);

    // Both sides transparently landed on the backup endpoints, and later
    // reconnects for those sides will try the backup first
    assert!(client.using_backup(ChannelSide::Send));
    assert!(client.using_backup(ChannelSide::Receive));

    let sign_on = client.sign_on().await.unwrap();
    assert_eq!(sign_on.response_code(), Some("00"));

    let response = client
        .send_and_receive(echo_request("400001"), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(response.stan(), Some("400001"));

    client.close();
}

// ---------------------------------------------------------------------
// Reconnect exhaustion: bounded attempts, one terminal error event
// ---------------------------------------------------------------------

#[tokio::test]
async fn test_reconnect_exhaustion_emits_one_terminal_event() {
    let switch = ScriptedSwitch::bind().await;
    let mut config = switch.client_config("001");
    config.max_retry_attempts = 2;
    config.retry_delay_ms = 50;
    let client = FiscClient::new(config, MessageCodec::fisc()).unwrap();
    let mut events = client.subscribe();

    let connector = {
        let client = client.clone();
        tokio::spawn(async move {
            client.connect().await.unwrap();
            client.sign_on().await.unwrap();
        })
    };
    let (recv_conn, mut send_conn) = {
        let (mut recv_conn, mut send_conn) = switch.accept_pair().await;
        switch.complete_sign_on(&mut recv_conn, &mut send_conn).await;
        (recv_conn, send_conn)
    };
    connector.await.unwrap();

    // Nothing will be listening when the client tries to come back
    let ScriptedSwitch { recv_listener: _recv_listener, send_listener } = switch;
    drop(send_listener);
    drop(send_conn);

    // Exactly max_retry_attempts reconnect announcements, then the one
    // terminal transport error
    let mut attempts = Vec::new();
    let terminal = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(FepEvent::Reconnecting { side, attempt }) => {
                    assert_eq!(side, ChannelSide::Receive);
                    attempts.push(attempt);
                }
                Ok(FepEvent::TransportError { side, detail }) => {
                    assert_eq!(side, ChannelSide::Receive);
                    return detail;
                }
                Ok(_) => continue,
                Err(e) => panic!("event stream ended: {e}"),
            }
        }
    })
    .await
    .expect("Timed out waiting for reconnect exhaustion");
    assert_eq!(attempts, vec![1, 2]);
    assert!(terminal.contains("exhausted"));

    // And silence afterwards: no further reconnect events
    let extra = tokio::time::timeout(Duration::from_millis(400), async {
        loop {
            if let Ok(FepEvent::Reconnecting { .. }) = events.recv().await {
                return;
            }
        }
    })
    .await;
    assert!(extra.is_err(), "reconnects continued past the bound");

    // The send side never died
    assert_eq!(client.state(), ClientState::SendOnly);
    drop(recv_conn);
    client.close();
}

// ---------------------------------------------------------------------
// Unified mode: one socket carries both directions
// ---------------------------------------------------------------------

#[tokio::test]
async fn test_unified_mode_round_trip() {
    let server = FiscServer::start(
        ServerConfig::unified(Endpoint::new("127.0.0.1", 0)),
        MessageCodec::fisc(),
    )
    .await
    .unwrap();
    server.with_network_management_defaults();

    let mut config = ClientConfig::unified(endpoint(server.unified_addr().unwrap()), "001");
    config.connect_timeout_ms = 2_000;
    config.read_timeout_ms = 2_000;
    let client = FiscClient::new(config, MessageCodec::fisc()).unwrap();

    client.connect().await.unwrap();
    assert_eq!(client.state(), ClientState::UnifiedConnected);

    let sign_on = client.sign_on().await.unwrap();
    assert_eq!(sign_on.response_code(), Some("00"));
    assert_eq!(client.state(), ClientState::SignedOn);

    let response = client
        .send_and_receive(echo_request("600001"), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(response.stan(), Some("600001"));
    assert_eq!(response.network_code(), Some("301"));

    client.close();
}

// ---------------------------------------------------------------------
// FAIL_WHEN_ANY_DOWN: a single dead side cancels everything
// ---------------------------------------------------------------------

#[tokio::test]
async fn test_fail_when_any_down_cancels_pending() {
    let switch = ScriptedSwitch::bind().await;
    let mut config = switch.client_config("001");
    config.failure_strategy = FailureStrategy::FailWhenAnyDown;
    config.auto_reconnect = false;
    let client = FiscClient::new(config, MessageCodec::fisc()).unwrap();

    let connector = {
        let client = client.clone();
        tokio::spawn(async move {
            client.connect().await.unwrap();
            client.sign_on().await.unwrap();
        })
    };
    let (mut recv_conn, mut send_conn) = switch.accept_pair().await;
    switch.complete_sign_on(&mut recv_conn, &mut send_conn).await;
    connector.await.unwrap();

    let in_flight = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .send_and_receive(financial_request("700001"), Duration::from_secs(5))
                .await
        })
    };
    let _request = recv_conn.read_message().await;
    assert_eq!(client.pending_count(), 1);

    drop(send_conn);

    // Under FAIL_WHEN_ANY_DOWN the pending future fails right away with
    // the lost side, long before its own five-second deadline
    match in_flight.await.unwrap() {
        Err(FepError::ChannelClosed(ChannelSide::Receive)) => {}
        other => panic!("Expected ChannelClosed(receive), got: {other:?}"),
    }
    assert_eq!(client.pending_count(), 0);

    tokio::time::timeout(Duration::from_secs(2), async {
        while client.state() != ClientState::Failed {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("client never reached the failed state");
    client.close();
}

// ---------------------------------------------------------------------
// Boundary: write racing shutdown never strands a pending entry
// ---------------------------------------------------------------------

#[tokio::test]
async fn test_send_racing_disconnect_leaves_no_pending() {
    let server = start_switch().await;
    let client = FiscClient::new(client_config(&server, "001"), MessageCodec::fisc()).unwrap();
    client.connect().await.unwrap();
    client.sign_on().await.unwrap();

    let racer = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .send_and_receive(financial_request("500001"), Duration::from_secs(2))
                .await
        })
    };
    tokio::task::yield_now().await;
    client.disconnect();

    // Either outcome is legal; a stranded entry is not
    match racer.await.unwrap() {
        Ok(response) => assert_eq!(response.stan(), Some("500001")),
        Err(
            FepError::ChannelClosed(_) | FepError::SendFailed(_) | FepError::InvalidState(_),
        ) => {}
        Err(other) => panic!("Unexpected error kind: {other:?}"),
    }
    assert_eq!(client.pending_count(), 0);
    client.close();
}
