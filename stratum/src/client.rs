//! Stratum client, the miner side of a session

use crate::{
    connection::{Connection, LineReader, LineWriter, SessionState},
    error::{StratumError, StratumResult},
    miner::Subscription,
    pending::{DEFAULT_PENDING_REQUEST_TTL, PendingRequests},
    protocol::{HexParams, Message, NoParams, ReconnectParams, Request, RequestId, Response, ShowMessageParams, StratumMethod},
};
use parking_lot::RwLock;
use prosper_core::{
    debug, error, info,
    log::Logger,
    trace,
    triggers::Listener,
    warn,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    sync::Mutex,
};

pub const DEFAULT_CLIENT_VERSION: &str = "0.0.1";

/// How strictly handshake responses are checked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HandshakePolicy {
    /// A missing, unreadable or failed response aborts the handshake.
    #[default]
    Strict,
    /// Problems are logged and the handshake carries on.
    Permissive,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub username: String,
    pub password: String,
    /// Reported in answer to `client.get_version`.
    pub version: String,
    /// Log every line read from the pool at info level.
    pub verbose: bool,
    pub handshake: HandshakePolicy,
    pub pending_request_ttl: Duration,
}

impl ClientConfig {
    pub fn new(username: &str, password: &str) -> Self {
        Self { username: username.to_string(), password: password.to_string(), ..Default::default() }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            version: DEFAULT_CLIENT_VERSION.to_string(),
            verbose: false,
            handshake: HandshakePolicy::default(),
            pending_request_ttl: DEFAULT_PENDING_REQUEST_TTL,
        }
    }
}

/// Where the pool asked us to reconnect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectHint {
    pub hostname: String,
    pub port: String,
    pub wait: String,
}

pub struct Client {
    config: ClientConfig,
    logger: Logger,
    writer: RwLock<Option<Arc<LineWriter>>>,
    reader: Mutex<Option<LineReader>>,
    listening: RwLock<bool>,
    peer: RwLock<Option<SocketAddr>>,
    next_request_id: AtomicU64,
    pending: PendingRequests,
    state: RwLock<SessionState>,
    subscriptions: RwLock<Vec<Subscription>>,
    nonce: RwLock<Option<String>>,
    target: RwLock<Option<String>>,
    reconnect_hint: RwLock<Option<ReconnectHint>>,
}

impl Client {
    pub fn new(config: ClientConfig, logger: Logger) -> Self {
        Self {
            pending: PendingRequests::new(config.pending_request_ttl),
            config,
            logger,
            writer: RwLock::new(None),
            reader: Mutex::new(None),
            listening: RwLock::new(false),
            peer: RwLock::new(None),
            next_request_id: AtomicU64::new(1),
            state: RwLock::new(SessionState::Closed),
            subscriptions: RwLock::new(Vec::new()),
            nonce: RwLock::new(None),
            target: RwLock::new(None),
            reconnect_hint: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        *self.peer.read()
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.subscriptions.read().clone()
    }

    /// Last nonce pushed by the pool, as sent on the wire.
    pub fn nonce(&self) -> Option<String> {
        self.nonce.read().clone()
    }

    /// Last target pushed by the pool, as sent on the wire.
    pub fn target(&self) -> Option<String> {
        self.target.read().clone()
    }

    pub fn reconnect_hint(&self) -> Option<ReconnectHint> {
        self.reconnect_hint.read().clone()
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Dials `address`, then runs the handshake.
    pub async fn connect(&self, address: &str) -> StratumResult<()> {
        let stream = TcpStream::connect(address).await?;
        stream.set_nodelay(true)?;
        *self.peer.write() = stream.peer_addr().ok();
        self.init_conn(stream).await;
        self.handshake().await
    }

    /// Adopts an already established stream, replacing any previous one.
    pub async fn init_conn<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let Connection { reader, writer } = Connection::new(stream);
        if let Some(previous) = self.writer.write().replace(Arc::new(writer)) {
            previous.close();
        }
        *self.reader.lock().await = Some(reader);
        *self.listening.write() = false;
        *self.state.write() = SessionState::Connected;
    }

    fn writer(&self) -> StratumResult<Arc<LineWriter>> {
        self.writer.read().clone().ok_or(StratumError::ConnectionClosed)
    }

    fn next_request_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn send_request(&self, request: Request) -> StratumResult<u64> {
        let writer = self.writer()?;
        let id = request.id.as_ref().and_then(RequestId::as_u64).ok_or_else(|| StratumError::Protocol(format!("{} sent without an id", request.method)))?;
        self.pending.insert(id, request.method());
        if let Err(err) = writer.send(&request).await {
            self.pending.remove(id);
            return Err(err);
        }
        Ok(id)
    }

    pub async fn subscribe(&self) -> StratumResult<u64> {
        self.send_request(Request::subscribe(self.next_request_id())).await
    }

    pub async fn authorize(&self, username: &str, password: &str) -> StratumResult<u64> {
        self.send_request(Request::authorize(self.next_request_id(), username, password)).await
    }

    pub async fn suggest_difficulty(&self, preferred_difficulty: &str) -> StratumResult<u64> {
        self.send_request(Request::suggest_difficulty(self.next_request_id(), preferred_difficulty)).await
    }

    pub async fn get_opr_hash(&self, job_id: &str) -> StratumResult<u64> {
        self.send_request(Request::get_opr_hash(self.next_request_id(), job_id)).await
    }

    pub async fn submit(&self, username: &str, job_id: &str, nonce: &str, opr_hash: &str) -> StratumResult<u64> {
        self.send_request(Request::submit(self.next_request_id(), username, job_id, nonce, opr_hash)).await
    }

    /// Subscribes, then authorizes with the configured credentials, waiting for
    /// the response to each step.
    pub async fn handshake(&self) -> StratumResult<()> {
        let id = self.subscribe().await?;
        if let Some(response) = self.handshake_step(id, StratumMethod::Subscribe).await? {
            self.record_subscriptions(&response);
        }
        self.advance(SessionState::Subscribed);

        let id = self.authorize(&self.config.username, &self.config.password).await?;
        self.handshake_step(id, StratumMethod::Authorize).await?;
        self.advance(SessionState::Authorized);
        info!(self.logger, "Stratum client authorized as {}", self.config.username);
        Ok(())
    }

    /// Reads until the response to request `id` arrives. Pushes and unrelated
    /// responses that come first are dispatched as usual. Under the permissive
    /// policy a rejected step is logged and skipped.
    async fn handshake_step(&self, id: u64, method: StratumMethod) -> StratumResult<Option<Response>> {
        let checked = loop {
            let Some(line) = self.next_line().await? else {
                break Err(format!("connection closed while waiting for the {} response", method));
            };
            match Message::decode(&line) {
                Ok(Message::Response(response)) if response.id.as_ref().and_then(RequestId::as_u64) == Some(id) => {
                    trace!(self.logger, "CLIENT READ: {}", line);
                    if response.is_success() {
                        break Ok(response);
                    }
                    break Err(format!("{} was not accepted: {:?}", method, response));
                }
                _ => self.handle_message(&line).await,
            }
        };
        self.pending.take(Some(&RequestId::Number(id)));

        match (checked, self.config.handshake) {
            (Ok(response), _) => Ok(Some(response)),
            (Err(reason), HandshakePolicy::Strict) => Err(StratumError::Handshake(reason)),
            (Err(reason), HandshakePolicy::Permissive) => {
                warn!(self.logger, "Ignoring handshake problem: {}", reason);
                Ok(None)
            }
        }
    }

    fn record_subscriptions(&self, response: &Response) {
        // [[["mining.notify", "<id>"], ...], "<extranonce>"]
        let subscriptions = response
            .result
            .as_ref()
            .and_then(|result| result.get(0))
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| {
                        let method = entry.get(0)?.as_str()?;
                        let id = entry.get(1)?.as_str()?;
                        Some(Subscription { method: method.to_string(), id: id.to_string() })
                    })
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        *self.subscriptions.write() = subscriptions;
    }

    fn advance(&self, state: SessionState) {
        let mut current = self.state.write();
        if *current < state {
            *current = state;
        }
    }

    /// Reads the next raw line from the pool. Only available until [`Self::listen`] takes the stream over.
    pub async fn next_line(&self) -> StratumResult<Option<String>> {
        let mut reader = self.reader.lock().await;
        let reader = reader.as_mut().ok_or(StratumError::AlreadyListening)?;
        Ok(reader.read_line().await?)
    }

    /// Reads and dispatches messages until the pool hangs up, `shutdown` fires
    /// or [`Self::close`] is called.
    pub async fn listen(&self, shutdown: Listener) -> StratumResult<()> {
        let closed = self.writer()?.closed();
        let mut reader = self.reader.lock().await.take().ok_or(StratumError::AlreadyListening)?;
        *self.listening.write() = true;
        debug!(self.logger, "Stratum client listening to {:?}", self.peer());

        loop {
            tokio::select! {
                biased;
                _ = shutdown.clone() => {
                    debug!(self.logger, "Stratum client shutting down");
                    break;
                }
                _ = closed.clone() => {
                    debug!(self.logger, "Stratum client closed");
                    break;
                }
                line = reader.read_line() => match line {
                    Ok(Some(line)) => self.handle_message(&line).await,
                    Ok(None) => {
                        debug!(self.logger, "Pool closed the connection");
                        break;
                    }
                    Err(err) => {
                        warn!(self.logger, "Stratum client read failed: {}", err);
                        break;
                    }
                }
            }
        }

        self.close();
        Ok(())
    }

    pub fn is_listening(&self) -> bool {
        *self.listening.read()
    }

    pub fn close(&self) {
        if let Some(writer) = self.writer.write().take() {
            writer.close();
        }
        *self.listening.write() = false;
        *self.state.write() = SessionState::Closed;
    }

    /// Decodes one line and dispatches it.
    pub async fn handle_message(&self, line: &str) {
        if self.config.verbose {
            info!(self.logger, "CLIENT READ: {}", line);
        } else {
            trace!(self.logger, "CLIENT READ: {}", line);
        }

        match Message::decode(line) {
            Ok(Message::Request(request)) => self.handle_request(request).await,
            Ok(Message::Response(response)) => match self.pending.take(response.id.as_ref()) {
                Some(pending) => {
                    if let Some(err) = &response.error {
                        warn!(self.logger, "Pool rejected {}: {} ({})", pending.method, err.message, err.code);
                    } else {
                        debug!(self.logger, "Pool answered {}: {:?}", pending.method, response.result);
                    }
                    pending.complete(response);
                }
                None => debug!(self.logger, "Response to unknown request {:?}", response.id),
            },
            Err(err) => warn!(self.logger, "Stratum client read failed: {}", err),
        }
    }

    pub async fn handle_request(&self, request: Request) {
        match request.method() {
            StratumMethod::GetVersion => {
                if let Err(err) = request.fit_params::<NoParams>() {
                    warn!(self.logger, "{}", err);
                    return;
                }
                let reply = Response::version(request.id.clone(), &self.config.version);
                match self.writer() {
                    Ok(writer) => {
                        if let Err(err) = writer.send(&reply).await {
                            error!(self.logger, "Failed to answer {}: {}", request.method, err);
                        }
                    }
                    Err(err) => error!(self.logger, "Failed to answer {}: {}", request.method, err),
                }
            }
            StratumMethod::ShowMessage => match request.fit_params::<ShowMessageParams>() {
                Ok(params) => info!(self.logger, "Message from pool: {}", params.message),
                Err(err) => warn!(self.logger, "{}", err),
            },
            StratumMethod::Reconnect => match request.fit_params::<ReconnectParams>() {
                Ok(params) => {
                    info!(self.logger, "Pool asked to reconnect to {}:{} in {}s", params.hostname, params.port, params.wait);
                    *self.reconnect_hint.write() =
                        Some(ReconnectHint { hostname: params.hostname, port: params.port, wait: params.wait });
                }
                Err(err) => warn!(self.logger, "{}", err),
            },
            StratumMethod::SetNonce => match request.fit_params::<HexParams>() {
                Ok(params) => {
                    debug!(self.logger, "Pool set nonce {}", params.hex);
                    *self.nonce.write() = Some(params.hex);
                }
                Err(err) => warn!(self.logger, "{}", err),
            },
            StratumMethod::SetTarget => match request.fit_params::<HexParams>() {
                Ok(params) => {
                    debug!(self.logger, "Pool set target {}", params.hex);
                    *self.target.write() = Some(params.hex);
                }
                Err(err) => warn!(self.logger, "{}", err),
            },
            method => warn!(self.logger, "Stratum client got unknown method {}, ignoring", method),
        }
    }
}
