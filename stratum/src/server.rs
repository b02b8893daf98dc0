//! Stratum server: accepts miners and carries operator commands to them.

use crate::{
    error::{StratumError, StratumResult},
    miner::{Miner, MinerId, MinerOptions, PoolWork, Submission},
    pending::DEFAULT_PENDING_REQUEST_TTL,
    registry::Miners,
};
use parking_lot::Mutex;
use prosper_core::{
    debug, info,
    log::Logger,
    triggers::{Listener, SingleTrigger},
    warn,
};
use serde::{Deserialize, Serialize};
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
    net::TcpListener,
    sync::mpsc,
};

pub const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0:1234";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct ServerConfig {
    pub listen_address: String,
    /// Log every line read from miners at info level.
    pub verbose: bool,
    /// Drop miners that stay silent this long. Unset means never.
    pub read_timeout_secs: Option<u64>,
    /// Disconnect miners sending more than ten times this many messages per second. Unset means no limit.
    pub max_messages_per_second: Option<u32>,
    /// How long an unanswered request to a miner is remembered.
    pub pending_request_ttl_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: DEFAULT_LISTEN_ADDRESS.to_string(),
            verbose: false,
            read_timeout_secs: None,
            max_messages_per_second: None,
            pending_request_ttl_secs: DEFAULT_PENDING_REQUEST_TTL.as_secs(),
        }
    }
}

impl ServerConfig {
    pub fn miner_options(&self) -> MinerOptions {
        MinerOptions {
            verbose: self.verbose,
            read_timeout: self.read_timeout_secs.map(Duration::from_secs),
            max_messages_per_second: self.max_messages_per_second,
            pending_request_ttl: Duration::from_secs(self.pending_request_ttl_secs),
        }
    }
}

pub struct Server {
    config: ServerConfig,
    logger: Logger,
    miners: Miners,
    next_miner_id: AtomicU64,
    work: Arc<PoolWork>,
    submissions: Mutex<Option<mpsc::UnboundedReceiver<Submission>>>,
    shutdown: SingleTrigger,
}

impl Server {
    pub fn new(config: ServerConfig, logger: Logger) -> Arc<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        Arc::new(Self {
            miners: Miners::new(logger.clone()),
            config,
            logger,
            next_miner_id: AtomicU64::new(1),
            work: Arc::new(PoolWork::new(Some(sender))),
            submissions: Mutex::new(Some(receiver)),
            shutdown: SingleTrigger::new(),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn miners(&self) -> &Miners {
        &self.miners
    }

    pub fn shutdown_listener(&self) -> Listener {
        self.shutdown.listener.clone()
    }

    /// Binds the configured address and serves until shutdown.
    pub async fn listen(self: &Arc<Self>) -> StratumResult<()> {
        let listener = TcpListener::bind(&self.config.listen_address).await?;
        self.serve(listener).await
    }

    /// Accepts miners from `listener` until shutdown, then closes every session.
    pub async fn serve(self: &Arc<Self>, listener: TcpListener) -> StratumResult<()> {
        info!(self.logger, "Stratum server listening on {}", listener.local_addr()?);
        let shutdown = self.shutdown_listener();

        loop {
            tokio::select! {
                biased;
                _ = shutdown.clone() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(err) = stream.set_nodelay(true) {
                            debug!(self.logger, "Failed to set TCP_NODELAY for {}: {}", peer, err);
                        }
                        self.new_conn(stream, Some(peer));
                    }
                    Err(err) => warn!(self.logger, "Failed to accept a connection: {}", err),
                }
            }
        }

        info!(self.logger, "Stratum server stopped listening");
        self.miners.close_all();
        Ok(())
    }

    /// Registers a miner on `stream` and spawns its read loop. The miner is
    /// unregistered once the loop ends.
    pub fn new_conn<S>(self: &Arc<Self>, stream: S, peer: Option<SocketAddr>) -> MinerId
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let id = MinerId::new(self.next_miner_id.fetch_add(1, Ordering::Relaxed));
        let miner = Miner::new(id, stream, peer, self.config.miner_options(), self.logger.clone());
        self.miners.add(miner.clone());
        match peer {
            Some(peer) => info!(self.logger, "New miner {} from {}", id, peer),
            None => info!(self.logger, "New miner {}", id),
        }

        let server = self.clone();
        tokio::spawn(async move {
            if let Err(err) = miner.run(server.work.clone(), server.shutdown_listener()).await {
                warn!(server.logger, "Miner {} loop failed: {}", id, err);
            }
            // a replacement may already hold the id
            if server.miners.get(id).is_some_and(|current| Arc::ptr_eq(&current, &miner)) {
                server.miners.remove(id);
            }
            info!(server.logger, "Miner {} disconnected", id);
        });
        id
    }

    fn miner(&self, id: MinerId) -> StratumResult<Arc<Miner>> {
        self.miners.get(id).ok_or(StratumError::MinerNotFound(id))
    }

    /// Sends `client.get_version`. The answer is recorded on the miner.
    pub async fn get_version(&self, id: MinerId) -> StratumResult<()> {
        self.miner(id)?.get_version().await.map(|_| ())
    }

    /// Sends `client.get_version` and waits up to `timeout` for the answer.
    pub async fn query_version(&self, id: MinerId, timeout: Duration) -> StratumResult<String> {
        self.miner(id)?.query_version(timeout).await
    }

    pub async fn show_message(&self, id: MinerId, message: &str) -> StratumResult<()> {
        self.miner(id)?.show_message(message).await.map(|_| ())
    }

    /// Sends `mining.set_nonce`. The hex string goes out exactly as given,
    /// leading zeros included.
    pub async fn set_nonce(&self, id: MinerId, nonce: &str) -> StratumResult<()> {
        self.miner(id)?.set_nonce(nonce).await
    }

    /// Sends `mining.set_target`, passed through verbatim like the nonce.
    pub async fn set_target(&self, id: MinerId, target: &str) -> StratumResult<()> {
        self.miner(id)?.set_target(target).await
    }

    pub async fn reconnect_client(&self, id: MinerId, hostname: &str, port: &str, wait: &str) -> StratumResult<()> {
        self.miner(id)?.reconnect(hostname, port, wait).await.map(|_| ())
    }

    /// Writes `payload` to every miner, see [`Miners::notify`].
    pub async fn notify(&self, payload: &[u8]) -> Vec<(MinerId, StratumError)> {
        let failures = self.miners.notify(payload).await;
        for (id, err) in &failures {
            debug!(self.logger, "Failed to notify miner {}: {}", id, err);
        }
        failures
    }

    /// Sets the hash returned to `mining.get_oprhash`.
    pub fn set_opr_hash(&self, opr_hash: Option<String>) {
        self.work.set_opr_hash(opr_hash);
    }

    pub fn opr_hash(&self) -> Option<String> {
        self.work.opr_hash()
    }

    /// Hands out the submission stream. Only the first caller gets it.
    pub fn take_submissions(&self) -> Option<mpsc::UnboundedReceiver<Submission>> {
        self.submissions.lock().take()
    }

    pub fn shutdown(&self) {
        self.shutdown.trigger.trigger();
        self.miners.close_all();
    }
}
