//! registry of queries waiting for a response, keyed by transaction id

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Local};
#[allow(unused_imports)]
use log::{debug, trace, warn};
use rand::random;

use crate::dns::client::ClientError;
use crate::dns::dispatch::{Command, Completion};

type Result<T> = std::result::Result<T, ClientError>;

/// What a transport hands to a waiting request: raw response bytes, or the
/// reason the exchange failed
pub type Delivery = Result<Vec<u8>>;

/// Source of candidate transaction ids
pub type IdSource = Box<dyn Fn() -> u16 + Send + Sync>;

/// Every possible id gets drawn at most this many times on average before
/// registration gives up
const MAX_ID_DRAWS: usize = 0x10000;

/// Identifies one registration
///
/// Ids are reused once a query is over, tokens never are, so a stale
/// completion or removal can't reach the next owner of the same id.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Registration {
    pub id: u16,
    pub token: u64,
}

/// A query in progress. This struct holds the `id` of the request, the server
/// it was sent to, and a channel endpoint for returning a response back to the
/// dispatcher watching it.
pub struct PendingQuery {
    pub registration: Registration,
    /// Where replies may come from; `None` when they arrive over a stream
    pub peer: Option<SocketAddr>,
    pub timestamp: DateTime<Local>,
    tx: Sender<Command>,
}

/// Queries in progress
///
/// When many queries are sent in parallel over one socket, the responses can
/// come back in any order. Each query registers here under a unique id, and
/// the socket reader hands every datagram to the query owning its id. An
/// entry stays until its owner removes it, so an id is never handed out
/// twice while its query still runs.
pub struct PendingQueries {
    queries: Mutex<HashMap<u16, PendingQuery>>,
    next_id: IdSource,
    next_token: AtomicU64,
}

impl Default for PendingQueries {
    fn default() -> Self {
        PendingQueries::new()
    }
}

impl PendingQueries {
    pub fn new() -> PendingQueries {
        PendingQueries::with_id_source(Box::new(random::<u16>))
    }

    pub fn with_id_source(next_id: IdSource) -> PendingQueries {
        PendingQueries {
            queries: Mutex::new(HashMap::new()),
            next_id,
            next_token: AtomicU64::new(1),
        }
    }

    /// The table stays usable even if a thread panicked while holding it
    fn lock(&self) -> MutexGuard<'_, HashMap<u16, PendingQuery>> {
        self.queries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocates an id not used by any other pending query and registers
    /// `tx` under it
    pub fn register(&self, peer: Option<SocketAddr>, tx: Sender<Command>) -> Result<Registration> {
        let mut queries = self.lock();
        for _ in 0..MAX_ID_DRAWS {
            let id = (self.next_id)();
            if queries.contains_key(&id) {
                trace!("Transaction id {} is taken, drawing another one", id);
                continue;
            }

            let registration = Registration {
                id,
                token: self.next_token.fetch_add(1, Ordering::Relaxed),
            };
            queries.insert(
                id,
                PendingQuery {
                    registration,
                    peer,
                    timestamp: Local::now(),
                    tx,
                },
            );
            return Ok(registration);
        }

        warn!("No free transaction id among {} pending queries", queries.len());
        Err(ClientError::NoFreeId)
    }

    /// Hands a response to the query waiting for it
    ///
    /// Returns false and drops the data when nobody waits for `id`, or when
    /// the datagram came from another address than the query went to. The
    /// entry itself is left to its owner to remove.
    pub fn dispatch(&self, id: u16, from: SocketAddr, data: Vec<u8>) -> bool {
        let queries = self.lock();
        let query = match queries.get(&id) {
            Some(query) if query.peer == Some(from) => query,
            Some(_) => {
                debug!("Discarding response {} from unexpected source {}", id, from);
                return false;
            }
            None => {
                debug!("Discarding response {} from {}, nobody is waiting for it", id, from);
                return false;
            }
        };

        let elapsed = Local::now() - query.timestamp;
        trace!("Response {} from {} after {} ms", id, from, elapsed.num_milliseconds());
        // Sent under the lock, so the completion is queued before the entry can go away
        let completion = Completion {
            registration: query.registration,
            result: Ok(data),
        };
        query.tx.send(Command::Complete(completion)).is_ok()
    }

    /// Removes the entry of `registration`
    ///
    /// An entry that now belongs to another registration of the same id is
    /// left alone; removing an absent entry is a no-op.
    pub fn remove(&self, registration: Registration) -> bool {
        let mut queries = self.lock();
        match queries.get(&registration.id) {
            Some(query) if query.registration == registration => queries.remove(&registration.id).is_some(),
            _ => false,
        }
    }

    pub fn contains(&self, id: u16) -> bool {
        self.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
