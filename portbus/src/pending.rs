//! Correlation table between outgoing request ids and the completion waiting on them.

use std::collections::{HashMap, HashSet};

use tokio::sync::oneshot;

use crate::connection::ConnectionId;
use crate::envelope::{Envelope, RequestId};
use crate::error::Error;

pub type SingleReply = oneshot::Receiver<Result<Envelope, Error>>;
pub type ManyReply = oneshot::Receiver<Result<Vec<Envelope>, Error>>;

enum Completion {
    Single(oneshot::Sender<Result<Envelope, Error>>),
    Many { tx: oneshot::Sender<Result<Vec<Envelope>, Error>>, accumulated: Vec<Envelope> },
}

/// What, besides an explicit reply, can resolve this entry early.
enum Watch {
    /// Worker-side: the single upstream link dropping fails every entry at once via
    /// [`PendingTable::fail_all`].
    Link,
    /// Master-side: the specific connections a directed request or `request_many`
    /// fanned out to. Removed one at a time as replies arrive or links drop.
    Connections(HashSet<ConnectionId>),
    /// Worker-side `request_many`: a worker only has the one upstream link and never
    /// sees the individual connections its fan-out reaches, so it just counts replies
    /// down to zero instead of removing watched connections one by one.
    Count(usize),
}

struct Entry {
    completion: Completion,
    watch: Watch,
}

#[derive(Default)]
pub struct PendingTable {
    entries: HashMap<RequestId, Entry>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn fresh_id(&self) -> RequestId {
        loop {
            let id = RequestId::generate();
            if !self.entries.contains_key(&id) {
                return id;
            }
        }
    }

    /// Register a single-response request whose only failure mode is the worker's
    /// upstream link dropping.
    pub fn register_single_on_link(&mut self) -> (RequestId, SingleReply) {
        let id = self.fresh_id();
        let (tx, rx) = oneshot::channel();
        self.entries.insert(id, Entry { completion: Completion::Single(tx), watch: Watch::Link });
        (id, rx)
    }

    /// Register a single-response request watching a specific connection; resolves
    /// with [`Error::PeerGone`] if that connection disappears before replying.
    pub fn register_single_on_connection(&mut self, conn: ConnectionId) -> (RequestId, SingleReply) {
        self.register_single_on_connections(HashSet::from([conn]))
    }

    pub fn register_single_on_connections(&mut self, watched: HashSet<ConnectionId>) -> (RequestId, SingleReply) {
        let id = self.fresh_id();
        let (tx, rx) = oneshot::channel();
        self.entries.insert(id, Entry { completion: Completion::Single(tx), watch: Watch::Connections(watched) });
        (id, rx)
    }

    /// Register an N-of-M request: resolves once every watched connection has either
    /// replied or disappeared.
    pub fn register_many_on_connections(&mut self, watched: HashSet<ConnectionId>) -> (RequestId, ManyReply) {
        let id = self.fresh_id();
        let (tx, rx) = oneshot::channel();
        self.entries.insert(
            id,
            Entry { completion: Completion::Many { tx, accumulated: Vec::new() }, watch: Watch::Connections(watched) },
        );
        (id, rx)
    }

    /// Feed a reply envelope whose `response_id` matched `id`. `from` identifies the
    /// connection it arrived over, so it can stop being watched. Returns `true` if
    /// `id` matched a live entry.
    pub fn complete(&mut self, id: RequestId, from: Option<ConnectionId>, envelope: Envelope) -> bool {
        let Some(entry) = self.entries.get_mut(&id) else { return false };

        match &mut entry.watch {
            Watch::Connections(set) => {
                if let Some(conn) = from {
                    set.remove(&conn);
                }
            }
            Watch::Count(remaining) => *remaining = remaining.saturating_sub(1),
            Watch::Link => {}
        }

        let is_single = matches!(entry.completion, Completion::Single(_));

        if is_single {
            let entry = self.entries.remove(&id).expect("just looked up");
            if let Completion::Single(tx) = entry.completion {
                let _ = tx.send(Ok(envelope));
            }
            return true;
        }

        let done = if let Completion::Many { accumulated, .. } = &mut entry.completion {
            accumulated.push(envelope);
            match &entry.watch {
                Watch::Connections(set) => set.is_empty(),
                Watch::Count(remaining) => *remaining == 0,
                Watch::Link => false,
            }
        } else {
            unreachable!("non-single entry is always Many")
        };

        if done {
            let entry = self.entries.remove(&id).expect("just looked up");
            if let Completion::Many { tx, accumulated } = entry.completion {
                let _ = tx.send(Ok(accumulated));
            }
        }

        true
    }

    /// Register a multi-response entry at a specific id instead of drawing a fresh one,
    /// counting down `count` replies regardless of which connection sent each (a worker
    /// has only the one upstream link and can't tell them apart). Used to reuse the id
    /// of the `ipc_query_label` request that established `count` in the first place;
    /// collisions with an unrelated live entry are not checked for, since ids are drawn
    /// from a 128-bit space and this id was, moments ago, this table's own.
    pub fn register_many_with_id(&mut self, id: RequestId, count: usize) -> ManyReply {
        let (tx, rx) = oneshot::channel();
        self.entries.insert(id, Entry { completion: Completion::Many { tx, accumulated: Vec::new() }, watch: Watch::Count(count) });
        rx
    }

    /// Explicitly cancel a pending entry (e.g. its deadline elapsed).
    pub fn cancel(&mut self, id: RequestId) {
        if let Some(entry) = self.entries.remove(&id) {
            Self::fail_entry(entry, Error::Cancelled);
        }
    }

    /// A connection disappeared. Every entry watching it loses that watcher; an entry
    /// left with no watchers resolves now, with whatever it already accumulated
    /// (`PeerGone` for a single-response entry, since it has nothing to fall back on).
    pub fn connection_gone(&mut self, conn: ConnectionId) {
        let mut to_resolve = Vec::new();
        for (&id, entry) in self.entries.iter_mut() {
            if let Watch::Connections(set) = &mut entry.watch {
                if set.remove(&conn) && set.is_empty() {
                    to_resolve.push(id);
                }
            }
        }
        for id in to_resolve {
            let entry = self.entries.remove(&id).expect("collected above");
            match entry.completion {
                Completion::Single(tx) => {
                    let _ = tx.send(Err(Error::PeerGone));
                }
                Completion::Many { tx, accumulated } => {
                    let _ = tx.send(Ok(accumulated));
                }
            }
        }
    }

    /// The single upstream link dropped: every entry fails with [`Error::Disconnected`],
    /// discarding any partial accumulation.
    pub fn fail_all(&mut self) {
        let entries: Vec<_> = self.entries.drain().collect();
        for (_, entry) in entries {
            Self::fail_entry(entry, Error::Disconnected);
        }
    }

    fn fail_entry(entry: Entry, error: Error) {
        match entry.completion {
            Completion::Single(tx) => {
                let _ = tx.send(Err(error));
            }
            Completion::Many { tx, .. } => {
                let _ = tx.send(Err(error));
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_response_resolves_on_first_reply() {
        let mut table = PendingTable::new();
        let (id, rx) = table.register_single_on_connection(ConnectionId::from_raw(1));
        let envelope = Envelope::event("pong", serde_json::Value::Null);
        assert!(table.complete(id, Some(ConnectionId::from_raw(1)), envelope));
        assert!(rx.try_recv().unwrap().is_ok());
    }

    #[test]
    fn many_response_waits_for_every_watcher() {
        let mut table = PendingTable::new();
        let watched = HashSet::from([ConnectionId::from_raw(1), ConnectionId::from_raw(2)]);
        let (id, mut rx) = table.register_many_on_connections(watched);
        table.complete(id, Some(ConnectionId::from_raw(1)), Envelope::event("pong", serde_json::Value::Null));
        assert!(rx.try_recv().is_err());
        table.complete(id, Some(ConnectionId::from_raw(2)), Envelope::event("pong", serde_json::Value::Null));
        let result = rx.try_recv().unwrap().unwrap();
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn connection_gone_resolves_single_with_peer_gone() {
        let mut table = PendingTable::new();
        let (_, mut rx) = table.register_single_on_connection(ConnectionId::from_raw(7));
        table.connection_gone(ConnectionId::from_raw(7));
        assert!(matches!(rx.try_recv().unwrap(), Err(Error::PeerGone)));
    }

    #[test]
    fn connection_gone_completes_many_early_with_partial_results() {
        let mut table = PendingTable::new();
        let watched = HashSet::from([ConnectionId::from_raw(1), ConnectionId::from_raw(2)]);
        let (id, mut rx) = table.register_many_on_connections(watched);
        table.complete(id, Some(ConnectionId::from_raw(1)), Envelope::event("pong", serde_json::Value::Null));
        table.connection_gone(ConnectionId::from_raw(2));
        let result = rx.try_recv().unwrap().unwrap();
        assert_eq!(result.len(), 1);
    }

    #[test]
    fn many_with_count_resolves_once_every_reply_is_in() {
        let mut table = PendingTable::new();
        let id = RequestId::generate();
        let mut rx = table.register_many_with_id(id, 2);
        table.complete(id, None, Envelope::event("pong", serde_json::Value::Null));
        assert!(rx.try_recv().is_err());
        table.complete(id, None, Envelope::event("pong", serde_json::Value::Null));
        let result = rx.try_recv().unwrap().unwrap();
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn cancel_fails_the_entry_with_cancelled() {
        let mut table = PendingTable::new();
        let (id, mut rx) = table.register_single_on_link();
        table.cancel(id);
        assert!(matches!(rx.try_recv().unwrap(), Err(Error::Cancelled)));
        assert!(table.is_empty());
    }

    #[test]
    fn fail_all_fails_every_entry() {
        let mut table = PendingTable::new();
        let (_, mut rx1) = table.register_single_on_link();
        let (_, mut rx2) = table.register_single_on_link();
        table.fail_all();
        assert!(matches!(rx1.try_recv().unwrap(), Err(Error::Disconnected)));
        assert!(matches!(rx2.try_recv().unwrap(), Err(Error::Disconnected)));
    }
}
