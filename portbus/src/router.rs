//! The single task that owns all routing state for a peer, master or worker alike.
//!
//! Every other task (the accept loop, the per-connection readers, the public
//! [`Peer`](crate::peer::Peer) handle) only ever talks to this one through
//! [`Command`]s sent over an unbounded channel, so none of the state below needs a
//! lock.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;

use crate::connection::{Connection, ConnectionId};
use crate::envelope::{self, Envelope, RequestId, TargetKind, MASTER_TARGET};
use crate::error::Error;
use crate::internal::{is_internal, EVENT_QUERY_LABEL, EVENT_SET_LABELS};
use crate::labels::LabelRegistry;
use crate::listener::{Handler, ListenerRegistry};
use crate::pending::{ManyReply, PendingTable, SingleReply};

/// Tracks a request a connection sent towards a label or broadcast, so the eventual
/// reply (or replies) can be routed straight back to whoever asked instead of being
/// mistaken for a request the master itself issued. `remaining` starts at the number of
/// connections the request was actually relayed to, so an ordinary single-response
/// request (first-wins) and a worker's `request_many` fan-out (collect every reply) are
/// both handled by the same bookkeeping: the entry is dropped once `remaining` hits 0,
/// and any reply arriving after that point is silently ignored.
struct Relay {
    origin: ConnectionId,
    remaining: usize,
}

pub(crate) enum Role {
    Master {
        connections: HashMap<ConnectionId, Connection>,
        labels: LabelRegistry,
        next_conn_id: u64,
        relayed: HashMap<RequestId, Relay>,
    },
    Worker {
        outbound: mpsc::UnboundedSender<Message>,
        labels: Vec<String>,
    },
}

pub(crate) enum Command {
    /// A frame arrived. `from` is `None` on a worker (there is only one link).
    Inbound { from: Option<ConnectionId>, envelope: Envelope },
    /// Master only: a link finished its handshake and is ready to receive traffic.
    ConnectionOpened {
        addr: SocketAddr,
        outbound: mpsc::UnboundedSender<Message>,
        labels: Vec<String>,
        reply: oneshot::Sender<ConnectionId>,
    },
    /// Master only: a link's reader task exited.
    ConnectionClosed { id: ConnectionId },
    /// Worker only: the upstream link dropped.
    LinkLost,
    SendMessage { kind: String, data: serde_json::Value, target: Option<String>, reply: oneshot::Sender<Result<(), Error>> },
    Request {
        kind: String,
        data: serde_json::Value,
        target: Option<String>,
        reply: oneshot::Sender<Result<(RequestId, SingleReply), Error>>,
    },
    RequestMany {
        kind: String,
        data: serde_json::Value,
        label: String,
        reply: oneshot::Sender<Result<(RequestId, ManyReply), Error>>,
    },
    /// A worker's `ipc_query_label` round trip came back with a nonzero count: start the
    /// real fan-out, reusing `id` (the query's own id) for the multi-response entry.
    RequestManyQueryDone {
        id: RequestId,
        kind: String,
        data: serde_json::Value,
        label: String,
        count: usize,
        tx: oneshot::Sender<Result<Vec<Envelope>, Error>>,
    },
    /// A pending request's deadline elapsed, or its caller otherwise gave up.
    Cancel { id: RequestId },
    /// Answer an envelope that carried a `request_id`, addressing the reply back to
    /// whoever sent it (possibly relayed through a master neither side can see).
    Reply { envelope: Envelope, reply: oneshot::Sender<Result<(), Error>> },
    SetLabels { labels: Vec<String>, reply: oneshot::Sender<Result<(), Error>> },
    AddLabels { labels: Vec<String>, reply: oneshot::Sender<Result<(), Error>> },
    On { event: String, handler: Handler },
}

pub(crate) struct RouterCore {
    role: Role,
    pending: PendingTable,
    listeners: ListenerRegistry,
    /// Clone of the channel feeding this very router, so a task spawned mid-command
    /// (the second leg of a worker's `request_many`) can post a follow-up command.
    self_tx: mpsc::UnboundedSender<Command>,
}

impl RouterCore {
    pub(crate) fn new_master(self_tx: mpsc::UnboundedSender<Command>) -> Self {
        Self {
            role: Role::Master {
                connections: HashMap::new(),
                labels: LabelRegistry::new(),
                next_conn_id: 0,
                relayed: HashMap::new(),
            },
            pending: PendingTable::new(),
            listeners: ListenerRegistry::new(),
            self_tx,
        }
    }

    pub(crate) fn new_worker(
        outbound: mpsc::UnboundedSender<Message>,
        labels: Vec<String>,
        self_tx: mpsc::UnboundedSender<Command>,
    ) -> Self {
        Self {
            role: Role::Worker { outbound, labels },
            pending: PendingTable::new(),
            listeners: ListenerRegistry::new(),
            self_tx,
        }
    }

    pub(crate) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = commands.recv().await {
            match command {
                Command::Inbound { from, envelope } => self.handle_inbound(from, envelope),
                Command::ConnectionOpened { addr, outbound, labels, reply } => {
                    let _ = reply.send(self.open_connection(addr, outbound, labels));
                }
                Command::ConnectionClosed { id } => self.close_connection(id),
                Command::LinkLost => self.pending.fail_all(),
                Command::SendMessage { kind, data, target, reply } => {
                    let _ = reply.send(self.send_message(kind, data, target));
                }
                Command::Request { kind, data, target, reply } => {
                    let _ = reply.send(self.request(kind, data, target));
                }
                Command::RequestMany { kind, data, label, reply } => {
                    let _ = reply.send(self.request_many(kind, data, label));
                }
                Command::RequestManyQueryDone { id, kind, data, label, count, tx } => {
                    self.start_many_fanout(id, kind, data, label, count, tx);
                }
                Command::Cancel { id } => self.pending.cancel(id),
                Command::Reply { envelope, reply } => {
                    let _ = reply.send(self.send_reply(envelope));
                }
                Command::SetLabels { labels, reply } => {
                    let _ = reply.send(self.set_labels(labels));
                }
                Command::AddLabels { labels, reply } => {
                    let _ = reply.send(self.add_labels(labels));
                }
                Command::On { event, handler } => self.listeners.register(event, handler),
            }
        }
    }

    fn open_connection(
        &mut self,
        addr: SocketAddr,
        outbound: mpsc::UnboundedSender<Message>,
        labels: Vec<String>,
    ) -> ConnectionId {
        let Role::Master { connections, labels: registry, next_conn_id, .. } = &mut self.role else {
            unreachable!("ConnectionOpened only sent to a master router")
        };
        let id = ConnectionId::from_raw(*next_conn_id);
        *next_conn_id += 1;
        let mut conn = Connection::new(id, addr, outbound);
        conn.labels = labels.clone();
        registry.set_labels(id, &[], &labels);
        connections.insert(id, conn);
        tracing::info!(%id, %addr, ?labels, "worker connected");
        id
    }

    fn close_connection(&mut self, id: ConnectionId) {
        let Role::Master { connections, labels: registry, relayed, .. } = &mut self.role else {
            unreachable!("ConnectionClosed only sent to a master router")
        };
        if let Some(conn) = connections.remove(&id) {
            registry.remove_connection(id, &conn.labels);
            tracing::info!(%id, "worker disconnected");
        }
        relayed.retain(|_, relay| relay.origin != id);
        self.pending.connection_gone(id);
    }

    fn handle_inbound(&mut self, from: Option<ConnectionId>, envelope: Envelope) {
        if let Some(response_id) = envelope.response_id {
            self.complete_or_relay(response_id, from, envelope);
            return;
        }

        if is_internal(&envelope.kind) {
            self.handle_internal(from, envelope);
            return;
        }

        match &self.role {
            Role::Master { .. } => self.relay_from_master(from, envelope),
            Role::Worker { .. } => self.listeners.dispatch(envelope.kind.clone().as_str(), &envelope),
        }
    }

    /// Try to resolve `response_id` against requests this node itself issued; if it
    /// matches nothing, it must be the reply to a request the master only relayed on
    /// behalf of one of its connections, so forward it there instead.
    fn complete_or_relay(&mut self, response_id: RequestId, from: Option<ConnectionId>, envelope: Envelope) {
        if self.pending.complete(response_id, from, envelope.clone()) {
            return;
        }
        let Role::Master { connections, relayed, .. } = &mut self.role else { return };
        let Some(relay) = relayed.get_mut(&response_id) else { return };
        let origin = relay.origin;
        relay.remaining = relay.remaining.saturating_sub(1);
        let done = relay.remaining == 0;
        if let Some(conn) = connections.get(&origin) {
            if let Ok(text) = envelope::encode(&envelope) {
                conn.send(Message::Text(text));
            }
        }
        if done {
            relayed.remove(&response_id);
        }
    }

    fn handle_internal(&mut self, from: Option<ConnectionId>, envelope: Envelope) {
        let Role::Master { .. } = &self.role else {
            tracing::warn!(event = %envelope.kind, "ignoring internal event received on a worker");
            return;
        };

        match envelope.kind.as_str() {
            EVENT_SET_LABELS => self.handle_set_labels(from, envelope),
            EVENT_QUERY_LABEL => self.handle_query_label(from, envelope),
            other => tracing::debug!(event = other, "unhandled internal event"),
        }
    }

    fn handle_set_labels(&mut self, from: Option<ConnectionId>, envelope: Envelope) {
        let Role::Master { connections, labels, .. } = &mut self.role else { return };
        let Some(conn_id) = from else { return };
        let Some(conn) = connections.get_mut(&conn_id) else { return };
        let new_labels: Vec<String> = serde_json::from_value(envelope.data).unwrap_or_default();
        labels.set_labels(conn_id, &conn.labels, &new_labels);
        conn.labels = new_labels;
    }

    /// Answer a worker's `ipc_query_label` with how many connections currently
    /// advertise the label it asked about, so it can decide whether to fan the real
    /// request out at all.
    fn handle_query_label(&mut self, from: Option<ConnectionId>, envelope: Envelope) {
        let Role::Master { connections, labels, .. } = &self.role else { return };
        let Some(conn_id) = from else { return };
        let Some(request_id) = envelope.request_id else { return };
        let label = envelope.data.get("label").and_then(|v| v.as_str()).unwrap_or_default();
        let count = labels.count(label);
        let reply = Envelope {
            kind: EVENT_QUERY_LABEL.to_string(),
            data: serde_json::json!({ "count": count }),
            target: None,
            response_id: Some(request_id),
            request_id: None,
            from: Some(MASTER_TARGET.to_string()),
        };
        if let (Some(conn), Ok(text)) = (connections.get(&conn_id), envelope::encode(&reply)) {
            conn.send(Message::Text(text));
        }
    }

    /// Route a non-internal, non-response envelope that arrived over the network (or
    /// `from: None` for one the master authored itself). Remembers requests relayed on
    /// a connection's behalf so [`Self::complete_or_relay`] can route the answer(s)
    /// back. A label-addressed request's expected reply count is however many
    /// connections currently advertise that label right now — good enough for an
    /// ordinary single-response request (first reply wins, the rest are dropped once
    /// the entry is gone) and exactly what a worker's `request_many` fan-out needs.
    fn relay_from_master(&mut self, from: Option<ConnectionId>, mut envelope: Envelope) {
        let Role::Master { connections, relayed, labels, .. } = &mut self.role else { return };
        envelope.from = from.and_then(|id| connections.get(&id)).and_then(|c| c.labels.first().cloned());

        if let (Some(conn_id), Some(request_id)) = (from, envelope.request_id) {
            let remaining = match envelope.target_kind() {
                TargetKind::Label(label) => labels.count(label).max(1),
                _ => 1,
            };
            relayed.insert(request_id, Relay { origin: conn_id, remaining });
        }

        match envelope.target_kind() {
            TargetKind::Broadcast => {
                self.broadcast(from, &envelope);
                self.listeners.dispatch(envelope.kind.clone().as_str(), &envelope);
            }
            TargetKind::Master => {
                self.listeners.dispatch(envelope.kind.clone().as_str(), &envelope);
            }
            TargetKind::Label(label) => {
                self.send_to_label(label, &envelope);
            }
        }
    }

    fn broadcast(&self, exclude: Option<ConnectionId>, envelope: &Envelope) {
        let Role::Master { connections, .. } = &self.role else { return };
        let Ok(text) = envelope::encode(envelope) else { return };
        for (id, conn) in connections {
            if Some(*id) != exclude {
                conn.send(Message::Text(text.clone()));
            }
        }
    }

    fn send_to_label(&self, label: &str, envelope: &Envelope) {
        let Role::Master { connections, labels, .. } = &self.role else { return };
        let Ok(text) = envelope::encode(envelope) else { return };
        for id in labels.connections_by_label(label) {
            if let Some(conn) = connections.get(&id) {
                conn.send(Message::Text(text.clone()));
            }
        }
    }

    fn send_message(&mut self, kind: String, data: serde_json::Value, target: Option<String>) -> Result<(), Error> {
        let envelope = Envelope { kind, data, target, response_id: None, request_id: None, from: None };
        match &self.role {
            Role::Worker { outbound, .. } => {
                let text = envelope::encode(&envelope)?;
                outbound.send(Message::Text(text)).map_err(|_| Error::Disconnected)
            }
            Role::Master { labels, .. } => {
                if let TargetKind::Label(label) = envelope.target_kind() {
                    if labels.count(label) == 0 {
                        return Err(Error::NoSuchLabel(label.to_string()));
                    }
                }
                self.relay_from_master(None, envelope);
                Ok(())
            }
        }
    }

    fn request(&mut self, kind: String, data: serde_json::Value, target: Option<String>) -> Result<(RequestId, SingleReply), Error> {
        match &self.role {
            Role::Worker { outbound, .. } => {
                let (id, rx) = self.pending.register_single_on_link();
                let envelope = Envelope { kind, data, target, response_id: None, request_id: Some(id), from: None };
                let text = envelope::encode(&envelope)?;
                outbound.send(Message::Text(text)).map_err(|_| Error::Disconnected)?;
                Ok((id, rx))
            }
            Role::Master { connections, labels, .. } => {
                let targets: HashSet<ConnectionId> = match target.as_deref() {
                    None => connections.keys().copied().collect(),
                    Some(MASTER_TARGET) => return Err(Error::NoSuchLabel(MASTER_TARGET.to_string())),
                    Some(label) => {
                        let set = labels.connections_by_label(label);
                        if set.is_empty() {
                            return Err(Error::NoSuchLabel(label.to_string()));
                        }
                        set
                    }
                };
                let (id, rx) = self.pending.register_single_on_connections(targets.clone());
                let envelope = Envelope { kind, data, target: target.clone(), response_id: None, request_id: Some(id), from: None };
                self.dispatch_request_to(&targets, &envelope);
                Ok((id, rx))
            }
        }
    }

    /// `request_many` on a worker is a two-round-trip protocol: first ask the master
    /// how many connections advertise `label` via `ipc_query_label`, and only once that
    /// count is confirmed nonzero send the real request, reusing the query's own id for
    /// the multi-response entry that collects the replies. A master doing this to its
    /// own registry skips the round trip entirely — it already knows the membership.
    fn request_many(&mut self, kind: String, data: serde_json::Value, label: String) -> Result<(RequestId, ManyReply), Error> {
        match &self.role {
            Role::Worker { outbound, .. } => {
                let (query_id, query_rx) = self.pending.register_single_on_link();
                let query = Envelope {
                    kind: EVENT_QUERY_LABEL.to_string(),
                    data: serde_json::json!({ "label": label.clone() }),
                    target: Some(MASTER_TARGET.to_string()),
                    response_id: None,
                    request_id: Some(query_id),
                    from: None,
                };
                let text = envelope::encode(&query)?;
                outbound.send(Message::Text(text)).map_err(|_| Error::Disconnected)?;

                let (tx, many_rx) = oneshot::channel();
                let commands = self.self_tx.clone();
                tokio::spawn(async move {
                    let outcome = match query_rx.await {
                        Ok(Ok(reply)) => {
                            let count = reply.data.get("count").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
                            if count == 0 {
                                Err(Error::NoSuchLabel(label.clone()))
                            } else {
                                Ok(count)
                            }
                        }
                        Ok(Err(e)) => Err(e),
                        Err(_) => Err(Error::Disconnected),
                    };
                    match outcome {
                        Ok(count) => {
                            let _ = commands.send(Command::RequestManyQueryDone { id: query_id, kind, data, label, count, tx });
                        }
                        Err(e) => {
                            let _ = tx.send(Err(e));
                        }
                    }
                });
                Ok((query_id, many_rx))
            }
            Role::Master { labels, .. } => {
                let targets = labels.connections_by_label(&label);
                if targets.is_empty() {
                    return Err(Error::NoSuchLabel(label));
                }
                let (id, rx) = self.pending.register_many_on_connections(targets.clone());
                let envelope = Envelope { kind, data, target: Some(label), response_id: None, request_id: Some(id), from: None };
                self.dispatch_request_to(&targets, &envelope);
                Ok((id, rx))
            }
        }
    }

    /// Second leg of a worker's `request_many`: the query came back with a nonzero
    /// count, so send the real request addressed to `label` and collect `count` replies
    /// under `id` (the query's own id).
    fn start_many_fanout(
        &mut self,
        id: RequestId,
        kind: String,
        data: serde_json::Value,
        label: String,
        count: usize,
        tx: oneshot::Sender<Result<Vec<Envelope>, Error>>,
    ) {
        let envelope = Envelope { kind, data, target: Some(label), response_id: None, request_id: Some(id), from: None };
        let text = match envelope::encode(&envelope) {
            Ok(text) => text,
            Err(e) => {
                let _ = tx.send(Err(e));
                return;
            }
        };

        let rx = self.pending.register_many_with_id(id, count);

        let sent = match &self.role {
            Role::Worker { outbound, .. } => outbound.send(Message::Text(text)).is_ok(),
            Role::Master { .. } => false,
        };

        if !sent {
            self.pending.cancel(id);
            let _ = tx.send(Err(Error::Disconnected));
            return;
        }

        tokio::spawn(async move {
            let result = rx.await.unwrap_or(Err(Error::Disconnected));
            let _ = tx.send(result);
        });
    }

    fn dispatch_request_to(&self, targets: &HashSet<ConnectionId>, envelope: &Envelope) {
        let Role::Master { connections, .. } = &self.role else { return };
        let Ok(text) = envelope::encode(envelope) else { return };
        for id in targets {
            if let Some(conn) = connections.get(id) {
                conn.send(Message::Text(text.clone()));
            }
        }
    }

    /// Answer an envelope carrying a `request_id`, routing the reply on to whoever
    /// sent the original request, even through a master neither side can see.
    fn send_reply(&mut self, envelope: Envelope) -> Result<(), Error> {
        match &self.role {
            Role::Worker { outbound, .. } => {
                let text = envelope::encode(&envelope)?;
                outbound.send(Message::Text(text)).map_err(|_| Error::Disconnected)
            }
            Role::Master { .. } => {
                let response_id = envelope.response_id.ok_or_else(|| Error::BadEnvelope("reply is missing response_id".to_string()))?;
                self.complete_or_relay(response_id, None, envelope);
                Ok(())
            }
        }
    }

    fn set_labels(&mut self, new_labels: Vec<String>) -> Result<(), Error> {
        match &mut self.role {
            Role::Worker { outbound, labels } => {
                let envelope = Envelope {
                    kind: EVENT_SET_LABELS.to_string(),
                    data: serde_json::json!(new_labels),
                    target: Some(MASTER_TARGET.to_string()),
                    response_id: None,
                    request_id: None,
                    from: None,
                };
                let text = envelope::encode(&envelope)?;
                outbound.send(Message::Text(text)).map_err(|_| Error::Disconnected)?;
                *labels = new_labels;
                Ok(())
            }
            // The master never addresses itself through a label, so this is a local
            // bookkeeping no-op kept only for API symmetry with a worker peer.
            Role::Master { .. } => Ok(()),
        }
    }

    fn add_labels(&mut self, extra: Vec<String>) -> Result<(), Error> {
        let merged = match &self.role {
            Role::Worker { labels, .. } => {
                let mut merged = labels.clone();
                for label in extra {
                    if !merged.contains(&label) {
                        merged.push(label);
                    }
                }
                merged
            }
            Role::Master { .. } => return Ok(()),
        };
        self.set_labels(merged)
    }
}
