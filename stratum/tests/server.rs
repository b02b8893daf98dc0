use prosper_core::{log::Logger, triggers::SingleTrigger};
use prosper_stratum::{
    Client, ClientConfig, MinerId, Server, ServerConfig, StratumError,
    connection::SessionState,
    protocol::{HexParams, Message, ReconnectParams, Request, StratumMethod},
};
use serde_json::{Value, json};
use std::{sync::Arc, time::Duration};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf, duplex},
    net::TcpListener,
    time::timeout,
};

const WAIT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(100);

fn server(config: ServerConfig) -> Arc<Server> {
    Server::new(config, Logger::discard())
}

/// The far end of an in-memory miner connection, driven by hand.
struct Peer {
    reader: BufReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
}

impl Peer {
    fn attach(server: &Arc<Server>) -> (MinerId, Peer) {
        let (near, far) = duplex(64 * 1024);
        let id = server.new_conn(near, None);
        let (read, writer) = tokio::io::split(far);
        (id, Peer { reader: BufReader::new(read), writer })
    }

    async fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
    }

    /// Next line, or `None` on EOF.
    async fn recv(&mut self) -> Option<String> {
        let mut line = String::new();
        let read = timeout(WAIT, self.reader.read_line(&mut line)).await.expect("timed out waiting for a line").unwrap();
        (read > 0).then(|| line.trim_end().to_string())
    }

    async fn recv_json(&mut self) -> Value {
        serde_json::from_str(&self.recv().await.expect("connection closed")).unwrap()
    }

    async fn is_quiet(&mut self) -> bool {
        let mut line = String::new();
        timeout(QUIET, self.reader.read_line(&mut line)).await.is_err()
    }
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never held");
}

#[tokio::test]
async fn test_reconnect_reaches_only_its_miner() {
    let server = server(ServerConfig::default());
    let (first, mut first_peer) = Peer::attach(&server);
    let (_second, mut second_peer) = Peer::attach(&server);

    server.reconnect_client(first, "pipe", "1234", "3").await.unwrap();

    let Message::Request(request) = Message::decode(&first_peer.recv().await.unwrap()).unwrap() else {
        panic!("expected a request");
    };
    assert_eq!(request.method(), StratumMethod::Reconnect);
    assert!(request.id.is_some());
    let params: ReconnectParams = request.fit_params().unwrap();
    assert_eq!((params.hostname.as_str(), params.port.as_str(), params.wait.as_str()), ("pipe", "1234", "3"));

    assert!(second_peer.is_quiet().await);
}

#[tokio::test]
async fn test_set_nonce_sends_plain_hex() {
    let server = server(ServerConfig::default());
    let (id, mut peer) = Peer::attach(&server);

    server.set_nonce(id, "ffeabea").await.unwrap();
    let request = peer.recv_json().await;
    assert_eq!(request["method"], "mining.set_nonce");
    assert_eq!(request["id"], Value::Null);
    assert_eq!(request["params"], json!(["ffeabea"]));

    let request: Request = serde_json::from_value(request).unwrap();
    assert_eq!(request.fit_params::<HexParams>().unwrap().to_u64().unwrap(), 268348394);
}

#[tokio::test]
async fn test_hex_pushes_keep_leading_zeros() {
    let server = server(ServerConfig::default());
    let (id, mut peer) = Peer::attach(&server);

    server.set_nonce(id, "0000abcd").await.unwrap();
    server.set_target(id, "00000000ffff0000").await.unwrap();
    assert_eq!(peer.recv_json().await["params"], json!(["0000abcd"]));
    assert_eq!(peer.recv_json().await["params"], json!(["00000000ffff0000"]));
}

#[tokio::test]
async fn test_client_records_nonce_and_target() {
    let server = server(ServerConfig::default());
    let (near, far) = duplex(64 * 1024);
    let id = server.new_conn(near, None);

    let client = Arc::new(Client::new(ClientConfig::default(), Logger::discard()));
    client.init_conn(far).await;
    let shutdown = SingleTrigger::new();
    let listen = tokio::spawn({
        let client = client.clone();
        let listener = shutdown.listener.clone();
        async move { client.listen(listener).await }
    });

    server.set_nonce(id, "0ffeabea").await.unwrap();
    server.set_target(id, "00ff").await.unwrap();
    eventually(|| client.target().is_some()).await;
    assert_eq!(client.nonce().as_deref(), Some("0ffeabea"));
    assert_eq!(client.target().as_deref(), Some("00ff"));

    shutdown.trigger.trigger();
    listen.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_notify_over_tcp() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let server = server(ServerConfig::default());
    let serve = tokio::spawn({
        let server = server.clone();
        async move { server.serve(listener).await }
    });

    let clients = [
        Client::new(ClientConfig::new("alice", "x"), Logger::discard()),
        Client::new(ClientConfig::new("bob", "x"), Logger::discard()),
    ];
    for client in &clients {
        client.connect(&address).await.unwrap();
        assert_eq!(client.state(), SessionState::Authorized);
    }
    assert_eq!(server.miners().len(), 2);

    assert!(server.notify(b"\"work-1\"").await.is_empty());
    for client in &clients {
        let line = timeout(WAIT, client.next_line()).await.unwrap().unwrap();
        assert_eq!(line.as_deref(), Some("\"work-1\""));
    }

    let removed = server.miners().list_miners()[0];
    server.miners().remove(removed);
    assert!(server.notify(b"\"work-2\"").await.is_empty());

    let mut received = 0;
    for client in &clients {
        if let Ok(line) = timeout(QUIET * 3, client.next_line()).await {
            assert_eq!(line.unwrap().as_deref(), Some("\"work-2\""));
            received += 1;
        }
    }
    assert_eq!(received, 1);

    server.shutdown();
    serve.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_notify_to_a_stalled_miner_ends_when_it_is_closed() {
    let server = server(ServerConfig::default());
    let (near, _far) = duplex(64);
    let stalled = server.new_conn(near, None);
    let (_, mut healthy) = Peer::attach(&server);

    let payload = format!("\"{}\"", "w".repeat(16 * 1024));
    let notify = tokio::spawn({
        let server = server.clone();
        async move { server.notify(payload.as_bytes()).await }
    });
    assert_eq!(healthy.recv().await.map(|line| line.len()), Some(16 * 1024 + 2));
    assert!(!notify.is_finished());

    server.miners().get(stalled).unwrap().close();
    let failures = timeout(WAIT, notify).await.expect("notify stayed blocked").unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, stalled);
    assert!(matches!(failures[0].1, StratumError::ConnectionClosed));
}

#[tokio::test]
async fn test_shutdown_unblocks_notify() {
    let server = server(ServerConfig::default());
    let (near, _far) = duplex(64);
    server.new_conn(near, None);

    let payload = format!("\"{}\"", "w".repeat(16 * 1024));
    let notify = tokio::spawn({
        let server = server.clone();
        async move { server.notify(payload.as_bytes()).await }
    });
    tokio::time::sleep(QUIET).await;
    server.shutdown();
    let failures = timeout(WAIT, notify).await.expect("notify stayed blocked").unwrap();
    assert_eq!(failures.len(), 1);
}

#[tokio::test]
async fn test_query_version_over_tcp() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let server = server(ServerConfig::default());
    let serve = tokio::spawn({
        let server = server.clone();
        async move { server.serve(listener).await }
    });

    let client = Arc::new(Client::new(ClientConfig::new("alice", "x"), Logger::discard()));
    client.connect(&address).await.unwrap();
    let shutdown = SingleTrigger::new();
    let listen = tokio::spawn({
        let client = client.clone();
        let listener = shutdown.listener.clone();
        async move { client.listen(listener).await }
    });

    let id = server.miners().list_miners()[0];
    assert_eq!(server.query_version(id, WAIT).await.unwrap(), "0.0.1");
    let miner = server.miners().get(id).unwrap();
    assert_eq!(miner.version().as_deref(), Some("0.0.1"));
    assert_eq!(miner.username().as_deref(), Some("alice"));
    assert_eq!(miner.pending_requests(), 0);

    // the fire-and-forget variant records the answer too
    server.get_version(id).await.unwrap();
    eventually(|| miner.pending_requests() == 0).await;

    server.shutdown();
    shutdown.trigger.trigger();
    serve.await.unwrap().unwrap();
    listen.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_query_version_times_out_on_silent_miner() {
    let server = server(ServerConfig::default());
    let (id, mut peer) = Peer::attach(&server);

    let query = server.query_version(id, Duration::from_millis(50)).await;
    assert!(matches!(query, Err(StratumError::Timeout)));
    assert_eq!(peer.recv_json().await["method"], "client.get_version");
    assert_eq!(server.miners().get(id).unwrap().pending_requests(), 0);
}

#[tokio::test]
async fn test_commands_to_unknown_miner() {
    let server = server(ServerConfig::default());
    let missing = MinerId::new(99);
    assert!(matches!(server.show_message(missing, "hi").await, Err(StratumError::MinerNotFound(id)) if id == missing));
    assert!(matches!(server.set_target(missing, "01").await, Err(StratumError::MinerNotFound(_))));
}

#[tokio::test]
async fn test_show_message_is_a_request() {
    let server = server(ServerConfig::default());
    let (id, mut peer) = Peer::attach(&server);
    server.show_message(id, "maintenance at noon").await.unwrap();
    let request = peer.recv_json().await;
    assert_eq!(request["method"], "client.show_message");
    assert_eq!(request["params"], json!(["maintenance at noon"]));
    assert!(request["id"].is_u64());
}

#[tokio::test]
async fn test_submit_requires_authorization() {
    let server = server(ServerConfig::default());
    let mut submissions = server.take_submissions().unwrap();
    assert!(server.take_submissions().is_none());
    let (id, mut peer) = Peer::attach(&server);

    peer.send(r#"{"id":1,"method":"mining.submit","params":["alice","job","00ff","abcd"]}"#).await;
    let reply = peer.recv_json().await;
    assert_eq!(reply["id"], 1);
    assert_eq!(reply["error"]["code"], 24);

    peer.send(r#"{"id":2,"method":"mining.subscribe","params":[]}"#).await;
    assert!(peer.recv_json().await["result"].is_array());
    peer.send(r#"{"id":3,"method":"mining.authorize","params":["alice","x"]}"#).await;
    assert_eq!(peer.recv_json().await["result"], true);

    peer.send(r#"{"id":4,"method":"mining.submit","params":["alice","job","00ff","abcd"]}"#).await;
    assert_eq!(peer.recv_json().await["result"], true);

    let submission = timeout(WAIT, submissions.recv()).await.unwrap().unwrap();
    assert_eq!(submission.miner, id);
    assert_eq!((submission.job_id.as_str(), submission.nonce.as_str()), ("job", "00ff"));
}

#[tokio::test]
async fn test_string_ids_are_echoed() {
    let server = server(ServerConfig::default());
    let (_, mut peer) = Peer::attach(&server);

    peer.send(r#"{"id":"a1","method":"mining.subscribe","params":[]}"#).await;
    let reply = peer.recv_json().await;
    assert_eq!(reply["id"], "a1");
    assert!(reply["result"].is_array());

    peer.send(r#"{"id":"a2","method":"mining.authorize","params":["alice","x"]}"#).await;
    assert_eq!(peer.recv_json().await, json!({"id": "a2", "result": true, "error": null}));
}

#[tokio::test]
async fn test_get_opr_hash() {
    let server = server(ServerConfig::default());
    let (_, mut peer) = Peer::attach(&server);

    peer.send(r#"{"id":1,"method":"mining.get_oprhash","params":["job"]}"#).await;
    assert_eq!(peer.recv_json().await["error"]["code"], 21);

    server.set_opr_hash(Some("00aa".to_string()));
    peer.send(r#"{"id":2,"method":"mining.get_oprhash","params":["job"]}"#).await;
    assert_eq!(peer.recv_json().await["result"], "00aa");
}

#[tokio::test]
async fn test_unknown_and_malformed_requests_get_no_reply() {
    let server = server(ServerConfig::default());
    let (_, mut peer) = Peer::attach(&server);

    peer.send(r#"{"id":1,"method":"mining.bogus","params":[]}"#).await;
    peer.send(r#"{"id":2,"method":"mining.authorize","params":["only-user"]}"#).await;
    peer.send("not json at all").await;
    peer.send(r#"{"id":3,"method":"mining.suggest_difficulty","params":[256]}"#).await;

    let reply = peer.recv_json().await;
    assert_eq!(reply["id"], 3);
    assert_eq!(reply["result"], true);
}

#[tokio::test]
async fn test_miner_leaves_registry_on_disconnect() {
    let server = server(ServerConfig::default());
    let (_, peer) = Peer::attach(&server);
    assert_eq!(server.miners().len(), 1);
    drop(peer);
    eventually(|| server.miners().is_empty()).await;
}

#[tokio::test]
async fn test_shutdown_closes_miners() {
    let server = server(ServerConfig::default());
    let (_, mut peer) = Peer::attach(&server);
    server.shutdown();
    assert_eq!(peer.recv().await, None);
    eventually(|| server.miners().is_empty()).await;
}

#[tokio::test]
async fn test_flooding_miner_is_disconnected() {
    let server = server(ServerConfig { max_messages_per_second: Some(1), ..Default::default() });
    let (_, mut peer) = Peer::attach(&server);

    let flood = (0..50).map(|id| format!(r#"{{"id":{},"method":"mining.subscribe","params":[]}}"#, id)).collect::<Vec<_>>();
    peer.send(&flood.join("\n")).await;
    let mut replies = 0;
    while peer.recv().await.is_some() {
        replies += 1;
    }
    assert!(replies < 50, "got {} replies", replies);
    eventually(|| server.miners().is_empty()).await;
}

#[test]
fn test_config_uses_kebab_case_and_defaults() {
    let config: ServerConfig = serde_json::from_value(json!({
        "listen-address": "127.0.0.1:3333",
        "verbose": true,
        "max-messages-per-second": 50,
        "read-timeout-secs": 30
    }))
    .unwrap();
    assert_eq!(config.listen_address, "127.0.0.1:3333");
    assert!(config.verbose);
    let options = config.miner_options();
    assert_eq!(options.read_timeout, Some(Duration::from_secs(30)));
    assert_eq!(options.max_messages_per_second, Some(50));
    assert_eq!(config.pending_request_ttl_secs, ServerConfig::default().pending_request_ttl_secs);

    assert!(serde_json::from_value::<ServerConfig>(json!({"listen_address": "x"})).is_err());
}
