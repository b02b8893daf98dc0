use crate::protocol::{RequestId, Response, StratumMethod};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    time::{Duration, Instant},
};
use tokio::sync::oneshot;

pub const DEFAULT_PENDING_REQUEST_TTL: Duration = Duration::from_secs(60);

/// A request we sent and whose response has not arrived yet.
#[derive(Debug)]
pub struct PendingRequest {
    pub method: StratumMethod,
    pub issued_at: Instant,
    waiter: Option<oneshot::Sender<Response>>,
}

impl PendingRequest {
    /// Hands the response to whoever awaits it, if anyone does.
    pub fn complete(self, response: Response) {
        if let Some(waiter) = self.waiter {
            let _ = waiter.send(response);
        }
    }
}

/// Correlates outbound request ids with their responses.
///
/// Entries older than the ttl are evicted whenever a new request is recorded, so
/// a peer that never answers cannot grow the table without bound.
#[derive(Debug)]
pub struct PendingRequests {
    requests: Mutex<HashMap<u64, PendingRequest>>,
    ttl: Duration,
}

impl PendingRequests {
    pub fn new(ttl: Duration) -> Self {
        Self { requests: Mutex::new(HashMap::new()), ttl }
    }

    pub fn insert(&self, id: u64, method: StratumMethod) {
        self.insert_inner(id, method, None);
    }

    /// Same as [`Self::insert`], returning a receiver completed with the response.
    pub fn insert_waiting(&self, id: u64, method: StratumMethod) -> oneshot::Receiver<Response> {
        let (sender, receiver) = oneshot::channel();
        self.insert_inner(id, method, Some(sender));
        receiver
    }

    fn insert_inner(&self, id: u64, method: StratumMethod, waiter: Option<oneshot::Sender<Response>>) {
        let mut requests = self.requests.lock();
        let ttl = self.ttl;
        requests.retain(|_, request| request.issued_at.elapsed() < ttl);
        requests.insert(id, PendingRequest { method, issued_at: Instant::now(), waiter });
    }

    /// Removes and returns the request answered by a response carrying `id`.
    /// Only numeric ids can match, since those are the only ones we issue.
    pub fn take(&self, id: Option<&RequestId>) -> Option<PendingRequest> {
        self.requests.lock().remove(&id?.as_u64()?)
    }

    pub fn remove(&self, id: u64) {
        self.requests.lock().remove(&id);
    }

    /// Drops every entry older than the ttl and returns how many went.
    pub fn evict_expired(&self) -> usize {
        let mut requests = self.requests.lock();
        let before = requests.len();
        let ttl = self.ttl;
        requests.retain(|_, request| request.issued_at.elapsed() < ttl);
        before - requests.len()
    }

    pub fn len(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.lock().is_empty()
    }
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new(DEFAULT_PENDING_REQUEST_TTL)
    }
}
