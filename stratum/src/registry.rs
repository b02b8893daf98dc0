use crate::{
    error::StratumError,
    miner::{Miner, MinerId},
};
use futures_util::future::join_all;
use parking_lot::RwLock;
use prosper_core::{debug, log::Logger};
use std::{collections::HashMap, sync::Arc};

/// Every connected miner, keyed by its id.
#[derive(Clone)]
pub struct Miners {
    miners: Arc<RwLock<HashMap<MinerId, Arc<Miner>>>>,
    logger: Logger,
}

impl Miners {
    pub fn new(logger: Logger) -> Self {
        Self { miners: Arc::new(RwLock::new(HashMap::new())), logger }
    }

    /// Registers `miner`, closing whatever session held its id before.
    pub fn add(&self, miner: Arc<Miner>) {
        let id = miner.id();
        let replaced = self.miners.write().insert(id, miner);
        if let Some(replaced) = replaced {
            debug!(self.logger, "Replaced miner {}", id);
            replaced.close();
        }
    }

    /// Unregisters `id`, if present.
    pub fn remove(&self, id: MinerId) -> Option<Arc<Miner>> {
        self.miners.write().remove(&id)
    }

    pub fn get(&self, id: MinerId) -> Option<Arc<Miner>> {
        self.miners.read().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.miners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.miners.read().is_empty()
    }

    /// Ids of every registered miner, in ascending order.
    pub fn list_miners(&self) -> Vec<MinerId> {
        let mut ids = self.miners.read().keys().copied().collect::<Vec<_>>();
        ids.sort();
        ids
    }

    fn snapshot(&self) -> Vec<Arc<Miner>> {
        self.miners.read().values().cloned().collect()
    }

    /// Writes `payload` as one line to every miner registered at the time of the
    /// call and returns the miners the write failed for.
    ///
    /// A failed miner stays registered; unregistering it is up to its read loop.
    pub async fn notify(&self, payload: &[u8]) -> Vec<(MinerId, StratumError)> {
        let miners = self.snapshot();
        let results = join_all(miners.iter().map(|miner| async move { (miner.id(), miner.send_raw(payload).await) })).await;
        results.into_iter().filter_map(|(id, result)| result.err().map(|err| (id, err))).collect()
    }

    /// Closes every registered miner. Their read loops unregister them.
    pub fn close_all(&self) {
        for miner in self.snapshot() {
            miner.close();
        }
    }
}
