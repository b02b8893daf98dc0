use crate::args::Args;
use prosper_core::{
    debug, info,
    log::{LogError, Logger},
    triggers::Listener,
    warn,
};
use prosper_polling::{PegPriceSource, PollingError, new_data_source};
use prosper_stratum::{Server, StratumError, Submission};
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error(transparent)]
    Log(#[from] LogError),

    #[error(transparent)]
    Stratum(#[from] StratumError),

    #[error(transparent)]
    Polling(#[from] PollingError),

    #[error("signal handling failed: {0}")]
    Signal(#[from] std::io::Error),

    #[error("daemon task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// The stratum server plus the optional peg price poller.
pub struct Daemon {
    server: Arc<Server>,
    price_source: Option<Box<dyn PegPriceSource>>,
    poll_interval: Duration,
    logger: Logger,
}

impl Daemon {
    pub fn new(args: &Args, logger: Logger) -> Result<Self, DaemonError> {
        let price_source = match &args.peg_source {
            Some(identifier) => Some(new_data_source(identifier, &args.polling, logger.with_target("prosper_polling"))?),
            None => None,
        };
        Ok(Self {
            server: Server::new(args.server.clone(), logger.with_target("prosper_stratum")),
            price_source,
            poll_interval: Duration::from_secs(args.poll_interval_secs),
            logger,
        })
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    /// Serves miners until the server is shut down.
    pub async fn run(self) -> Result<(), DaemonError> {
        let Daemon { server, price_source, poll_interval, logger } = self;

        if let Some(submissions) = server.take_submissions() {
            tokio::spawn(log_submissions(submissions, logger.clone()));
        }
        let poller = price_source.map(|source| tokio::spawn(poll_prices(source, poll_interval, server.shutdown_listener(), logger.clone())));

        let result = server.listen().await;
        // stops the poller when binding failed
        server.shutdown();
        if let Some(poller) = poller {
            poller.await?;
        }
        Ok(result?)
    }
}

/// Runs `daemon` until it stops by itself or the process is interrupted.
pub async fn run_until_interrupted(daemon: Daemon, logger: Logger) -> Result<(), DaemonError> {
    let server = daemon.server().clone();
    let mut task = tokio::spawn(daemon.run());
    let interrupted = tokio::select! {
        result = &mut task => return result?,
        signal = tokio::signal::ctrl_c() => signal,
    };
    interrupted?;
    info!(logger, "Interrupted, shutting down");
    server.shutdown();
    task.await?
}

pub async fn log_submissions(mut submissions: UnboundedReceiver<Submission>, logger: Logger) {
    while let Some(submission) = submissions.recv().await {
        info!(
            logger,
            "Share from miner {} ({}) for job {}, nonce {}, oprhash {}",
            submission.miner,
            submission.username,
            submission.job_id,
            submission.nonce,
            submission.opr_hash
        );
    }
    debug!(logger, "Submission stream closed");
}

/// Polls `source` every `interval` until `shutdown` fires, logging each set of prices.
pub async fn poll_prices(source: Box<dyn PegPriceSource>, interval: Duration, shutdown: Listener, logger: Logger) {
    info!(logger, "Polling peg prices from {} ({}) every {:?}", source.name(), source.url(), interval);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.clone() => break,
            _ = ticker.tick() => {}
        }
        tokio::select! {
            biased;
            _ = shutdown.clone() => break,
            result = source.fetch_peg_prices() => match result {
                Ok(prices) => {
                    let mut prices = prices.into_iter().collect::<Vec<_>>();
                    prices.sort_by(|a, b| a.0.cmp(&b.0));
                    let line = prices.iter().map(|(asset, item)| format!("{}={}", asset, item.value)).collect::<Vec<_>>().join(", ");
                    info!(logger, "{} prices: {}", source.name(), line);
                }
                Err(err) => warn!(logger, "Failed to poll {}: {}", source.name(), err),
            }
        }
    }
    debug!(logger, "Price poller stopped");
}
