//! Session routing table for middle-end responses

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

use crate::crypto::SecureRandom;

/// Per-session queue depth. A session that lets it fill is dropped.
const SESSION_QUEUE: usize = 256;

/// What a reader delivers to one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeResponse {
    Data(Bytes),
    Ack(u32),
    Close,
}

#[derive(Default)]
pub struct ConnRegistry {
    map: DashMap<u64, mpsc::Sender<MeResponse>>,
}

impl ConnRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session under a random non-zero id unique among live ones.
    pub fn register(&self, rng: &SecureRandom) -> (u64, mpsc::Receiver<MeResponse>) {
        let (tx, rx) = mpsc::channel(SESSION_QUEUE);
        loop {
            let id = rng.u64();
            if id == 0 {
                continue;
            }
            if let Entry::Vacant(slot) = self.map.entry(id) {
                slot.insert(tx);
                return (id, rx);
            }
        }
    }

    pub fn unregister(&self, id: u64) {
        self.map.remove(&id);
    }

    pub fn contains(&self, id: u64) -> bool {
        self.map.contains_key(&id)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Deliver a response without waiting, so one stalled session never
    /// holds up the shared reader. Unknown ids are ignored; a session whose
    /// queue is full or gone is removed and sees its channel end.
    pub fn route(&self, id: u64, resp: MeResponse) -> bool {
        let res = match self.map.get(&id) {
            Some(tx) => tx.try_send(resp),
            None => {
                debug!(conn_id = id, "Response for unknown conn_id dropped");
                return false;
            }
        };
        match res {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!(conn_id = id, "Session queue full, dropping session");
                self.map.remove(&id);
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.map.remove(&id);
                false
            }
        }
    }
}
