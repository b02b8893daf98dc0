//! The server side of one miner connection.

use crate::{
    connection::{Connection, LineReader, LineWriter, SessionState},
    error::{StratumError, StratumResult},
    pending::{DEFAULT_PENDING_REQUEST_TTL, PendingRequests},
    protocol::{
        AuthorizeParams, GetOprHashParams, Message, Request, Response, StratumMethod, SubmitParams, SuggestDifficultyParams,
    },
    rate_limit::RateLimiter,
};
use parking_lot::RwLock;
use prosper_core::{
    debug, info,
    log::Logger,
    trace,
    triggers::{Listener, SingleTrigger},
    warn,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::{
    fmt,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{Mutex, mpsc},
};

/// Identity of a miner session, unique for the lifetime of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MinerId(u64);

impl MinerId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn value(&self) -> u64 {
        self.0
    }
}

impl From<u64> for MinerId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for MinerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An entry of the `mining.subscribe` result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub method: String,
    pub id: String,
}

/// A share handed in through `mining.submit`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub miner: MinerId,
    pub username: String,
    pub job_id: String,
    pub nonce: String,
    pub opr_hash: String,
}

/// Pool-wide work state shared by every session.
#[derive(Debug, Default)]
pub struct PoolWork {
    opr_hash: RwLock<Option<String>>,
    submissions: Option<mpsc::UnboundedSender<Submission>>,
}

impl PoolWork {
    pub fn new(submissions: Option<mpsc::UnboundedSender<Submission>>) -> Self {
        Self { opr_hash: RwLock::new(None), submissions }
    }

    pub fn set_opr_hash(&self, opr_hash: Option<String>) {
        *self.opr_hash.write() = opr_hash;
    }

    pub fn opr_hash(&self) -> Option<String> {
        self.opr_hash.read().clone()
    }

    /// Forwards a submission, returning false when nobody consumes them.
    pub fn submit(&self, submission: Submission) -> bool {
        self.submissions.as_ref().is_some_and(|sender| sender.send(submission).is_ok())
    }
}

#[derive(Debug, Clone)]
pub struct MinerOptions {
    /// Log every line read from the miner at info level.
    pub verbose: bool,
    pub read_timeout: Option<Duration>,
    /// Disconnect once the miner sends more than ten times this many messages per second.
    pub max_messages_per_second: Option<u32>,
    pub pending_request_ttl: Duration,
}

impl Default for MinerOptions {
    fn default() -> Self {
        Self { verbose: false, read_timeout: None, max_messages_per_second: None, pending_request_ttl: DEFAULT_PENDING_REQUEST_TTL }
    }
}

pub struct Miner {
    id: MinerId,
    peer: Option<SocketAddr>,
    options: MinerOptions,
    logger: Logger,
    writer: LineWriter,
    reader: Mutex<Option<LineReader>>,
    next_request_id: AtomicU64,
    pending: PendingRequests,
    state: RwLock<SessionState>,
    username: RwLock<Option<String>>,
    version: RwLock<Option<String>>,
    preferred_difficulty: RwLock<Option<String>>,
    subscriptions: RwLock<Vec<Subscription>>,
    closing: SingleTrigger,
}

impl Miner {
    pub fn new<S>(id: MinerId, stream: S, peer: Option<SocketAddr>, options: MinerOptions, logger: Logger) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let Connection { reader, writer } = Connection::new(stream);
        Arc::new(Self {
            id,
            peer,
            pending: PendingRequests::new(options.pending_request_ttl),
            options,
            logger,
            writer,
            reader: Mutex::new(Some(reader)),
            next_request_id: AtomicU64::new(1),
            state: RwLock::new(SessionState::Connected),
            username: RwLock::new(None),
            version: RwLock::new(None),
            preferred_difficulty: RwLock::new(None),
            subscriptions: RwLock::new(Vec::new()),
            closing: SingleTrigger::new(),
        })
    }

    pub fn id(&self) -> MinerId {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn username(&self) -> Option<String> {
        self.username.read().clone()
    }

    /// Version last reported through `client.get_version`.
    pub fn version(&self) -> Option<String> {
        self.version.read().clone()
    }

    pub fn preferred_difficulty(&self) -> Option<String> {
        self.preferred_difficulty.read().clone()
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.subscriptions.read().clone()
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    fn next_request_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    fn advance(&self, state: SessionState) {
        let mut current = self.state.write();
        if *current < state {
            *current = state;
        }
    }

    pub async fn send(&self, message: &impl Serialize) -> StratumResult<()> {
        self.writer.send(message).await
    }

    /// Writes an opaque payload as one line.
    pub async fn send_raw(&self, payload: &[u8]) -> StratumResult<()> {
        self.writer.send_raw(payload).await
    }

    /// Sends a request under a fresh id and remembers it until answered.
    pub async fn send_request(&self, method: StratumMethod, params: Vec<Value>) -> StratumResult<u64> {
        self.request_with(|id| Request::new(Some(id.into()), method, params)).await
    }

    /// Sends a request without an id, expecting no answer.
    pub async fn send_notification(&self, method: StratumMethod, params: Vec<Value>) -> StratumResult<()> {
        self.writer.send(&Request::new(None, method, params)).await
    }

    async fn request_with(&self, build: impl FnOnce(u64) -> Request) -> StratumResult<u64> {
        let id = self.next_request_id();
        let request = build(id);
        self.pending.insert(id, request.method());
        if let Err(err) = self.writer.send(&request).await {
            self.pending.remove(id);
            return Err(err);
        }
        Ok(id)
    }

    pub async fn get_version(&self) -> StratumResult<u64> {
        self.request_with(Request::get_version).await
    }

    pub async fn show_message(&self, message: &str) -> StratumResult<u64> {
        self.request_with(|id| Request::show_message(id, message)).await
    }

    pub async fn reconnect(&self, hostname: &str, port: &str, wait: &str) -> StratumResult<u64> {
        self.request_with(|id| Request::reconnect(id, hostname, port, wait)).await
    }

    pub async fn set_nonce(&self, nonce: &str) -> StratumResult<()> {
        self.writer.send(&Request::set_nonce(nonce)).await
    }

    pub async fn set_target(&self, target: &str) -> StratumResult<()> {
        self.writer.send(&Request::set_target(target)).await
    }

    /// Sends `client.get_version` and waits for the answer.
    pub async fn query_version(&self, timeout: Duration) -> StratumResult<String> {
        let id = self.next_request_id();
        let receiver = self.pending.insert_waiting(id, StratumMethod::GetVersion);
        if let Err(err) = self.writer.send(&Request::get_version(id)).await {
            self.pending.remove(id);
            return Err(err);
        }
        let response = match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(StratumError::ResponseDropped),
            Err(_) => {
                self.pending.remove(id);
                return Err(StratumError::Timeout);
            }
        };
        if let Some(err) = response.error {
            return Err(StratumError::Protocol(format!("miner {} rejected client.get_version: {}", self.id, err.message)));
        }
        response.fit_result()
    }

    pub fn close(&self) {
        *self.state.write() = SessionState::Closed;
        self.writer.close();
        self.closing.trigger.trigger();
    }

    pub fn is_closed(&self) -> bool {
        self.closing.is_triggered()
    }

    /// Reads and dispatches lines until the miner leaves, the session is closed
    /// or `shutdown` fires. Closes the session on the way out.
    pub async fn run(&self, work: Arc<PoolWork>, shutdown: Listener) -> StratumResult<()> {
        let mut reader = self.reader.lock().await.take().ok_or(StratumError::AlreadyListening)?;
        let mut limiter = self.options.max_messages_per_second.map(RateLimiter::disconnect_threshold);
        let closing = self.closing.listener.clone();

        loop {
            tokio::select! {
                biased;
                _ = shutdown.clone() => {
                    debug!(self.logger, "Closing miner {} on server shutdown", self.id);
                    break;
                }
                _ = closing.clone() => break,
                line = read_line(&mut reader, self.options.read_timeout) => match line {
                    Ok(Some(line)) => {
                        if let Some(limiter) = limiter.as_mut()
                            && !limiter.check()
                        {
                            warn!(self.logger, "Miner {} exceeded the message rate limit, disconnecting", self.id);
                            break;
                        }
                        self.handle_message(&line, &work).await;
                    }
                    Ok(None) => {
                        debug!(self.logger, "Miner {} closed the connection", self.id);
                        break;
                    }
                    Err(err) => {
                        debug!(self.logger, "Miner {} read failed: {}", self.id, err);
                        break;
                    }
                }
            }
        }

        self.close();
        Ok(())
    }

    async fn handle_message(&self, line: &str, work: &PoolWork) {
        if self.options.verbose {
            info!(self.logger, "MINER {} READ: {}", self.id, line);
        } else {
            trace!(self.logger, "MINER {} READ: {}", self.id, line);
        }

        match Message::decode(line) {
            Ok(Message::Request(request)) => self.handle_request(request, work).await,
            Ok(Message::Response(response)) => self.handle_response(response),
            Err(err) => warn!(self.logger, "Miner {} sent an unreadable message: {}", self.id, err),
        }
    }

    async fn handle_request(&self, request: Request, work: &PoolWork) {
        let reply = match request.method() {
            StratumMethod::Subscribe => Some(self.handle_subscribe(&request)),
            StratumMethod::Authorize => self.handle_authorize(&request),
            StratumMethod::Submit => self.handle_submit(&request, work),
            StratumMethod::SuggestDifficulty => self.handle_suggest_difficulty(&request),
            StratumMethod::GetOprHash => self.handle_get_opr_hash(&request, work),
            method => {
                warn!(self.logger, "Miner {} sent unknown method {}, ignoring", self.id, method);
                None
            }
        };

        // notifications get no reply
        if let Some(reply) = reply.filter(|_| !request.is_notification())
            && let Err(err) = self.writer.send(&reply).await
        {
            debug!(self.logger, "Failed to reply to {} from miner {}: {}", request.method, self.id, err);
        }
    }

    fn handle_subscribe(&self, request: &Request) -> Response {
        let token = format!("{:016x}", self.id.value());
        self.subscriptions.write().push(Subscription { method: "mining.notify".to_string(), id: token.clone() });
        self.advance(SessionState::Subscribed);
        debug!(self.logger, "Miner {} subscribed", self.id);
        Response::success(request.id.clone(), json!([[["mining.notify", token]], token]))
    }

    fn handle_authorize(&self, request: &Request) -> Option<Response> {
        let params = self.fit::<AuthorizeParams>(request)?;
        info!(self.logger, "Miner {} authorized as {}", self.id, params.username);
        *self.username.write() = Some(params.username);
        self.advance(SessionState::Authorized);
        Some(Response::success(request.id.clone(), Value::Bool(true)))
    }

    fn handle_submit(&self, request: &Request, work: &PoolWork) -> Option<Response> {
        let params = self.fit::<SubmitParams>(request)?;
        if self.state() != SessionState::Authorized {
            warn!(self.logger, "Rejected submit from unauthorized miner {}", self.id);
            return Some(Response::from_error(request.id.clone(), &StratumError::UnauthorizedWorker));
        }
        debug!(self.logger, "Miner {} submitted job {} nonce {}", self.id, params.job_id, params.nonce);
        let forwarded = work.submit(Submission {
            miner: self.id,
            username: params.username,
            job_id: params.job_id,
            nonce: params.nonce,
            opr_hash: params.opr_hash,
        });
        if !forwarded {
            trace!(self.logger, "No consumer for submissions, dropped share from miner {}", self.id);
        }
        Some(Response::success(request.id.clone(), Value::Bool(true)))
    }

    fn handle_suggest_difficulty(&self, request: &Request) -> Option<Response> {
        let params = self.fit::<SuggestDifficultyParams>(request)?;
        debug!(self.logger, "Miner {} suggested difficulty {}", self.id, params.preferred_difficulty);
        *self.preferred_difficulty.write() = Some(params.preferred_difficulty);
        Some(Response::success(request.id.clone(), Value::Bool(true)))
    }

    fn handle_get_opr_hash(&self, request: &Request, work: &PoolWork) -> Option<Response> {
        let params = self.fit::<GetOprHashParams>(request)?;
        Some(match work.opr_hash() {
            Some(opr_hash) => Response::success(request.id.clone(), json!(opr_hash)),
            None => {
                debug!(self.logger, "Miner {} asked for the oprhash of job {} before any was set", self.id, params.job_id);
                Response::from_error(request.id.clone(), &StratumError::JobNotFound)
            }
        })
    }

    fn handle_response(&self, response: Response) {
        let Some(pending) = self.pending.take(response.id.as_ref()) else {
            debug!(self.logger, "Miner {} answered unknown request {:?}", self.id, response.id);
            return;
        };

        if let Some(err) = &response.error {
            warn!(self.logger, "Miner {} failed {}: {} ({})", self.id, pending.method, err.message, err.code);
        } else if pending.method == StratumMethod::GetVersion {
            match response.fit_result::<String>() {
                Ok(version) => {
                    info!(self.logger, "Miner {} runs version {}", self.id, version);
                    *self.version.write() = Some(version);
                }
                Err(err) => warn!(self.logger, "Miner {} sent a bad version: {}", self.id, err),
            }
        } else {
            trace!(self.logger, "Miner {} acknowledged {} after {:?}", self.id, pending.method, pending.issued_at.elapsed());
        }
        pending.complete(response);
    }

    fn fit<T: serde::de::DeserializeOwned>(&self, request: &Request) -> Option<T> {
        match request.fit_params() {
            Ok(params) => Some(params),
            Err(err) => {
                warn!(self.logger, "Miner {} sent bad params: {}", self.id, err);
                None
            }
        }
    }
}

impl fmt::Debug for Miner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Miner").field("id", &self.id).field("peer", &self.peer).field("state", &self.state()).finish()
    }
}

async fn read_line(reader: &mut LineReader, timeout: Option<Duration>) -> StratumResult<Option<String>> {
    match timeout {
        Some(timeout) => tokio::time::timeout(timeout, reader.read_line()).await.map_err(|_| StratumError::Timeout)?,
        None => reader.read_line().await,
    }
}
