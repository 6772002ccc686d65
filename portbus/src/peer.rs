//! The public handle onto a bus, whichever authority discovery resolved it to.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::config::Config;
use crate::discovery;
use crate::envelope::{Envelope, RequestId};
use crate::error::Error;
use crate::pending::{ManyReply, SingleReply};
use crate::router::Command;

/// A connected node on the bus. Cloning a `Peer` is cheap: every clone shares the same
/// underlying router task.
#[derive(Clone)]
pub struct Peer {
    commands: mpsc::UnboundedSender<Command>,
}

impl Peer {
    /// Resolve `config`'s authority — dynamic discovery, or an explicit worker/master —
    /// and bring the resulting link up.
    pub async fn connect(config: Config) -> Result<Self, Error> {
        discovery::connect(config).await
    }

    pub(crate) fn from_commands(commands: mpsc::UnboundedSender<Command>) -> Self {
        Self { commands }
    }

    /// Broadcast to every connection (master), or forward upstream for the master to
    /// broadcast (worker). Fire and forget: there is no reply to await.
    pub async fn send_message(&self, event: impl Into<String>, data: serde_json::Value) -> Result<(), Error> {
        self.dispatch_send(event.into(), data, None).await
    }

    /// Address every connection currently advertising `label`, or `"master"` for the
    /// master itself.
    pub async fn send_to(&self, event: impl Into<String>, data: serde_json::Value, target: impl Into<String>) -> Result<(), Error> {
        self.dispatch_send(event.into(), data, Some(target.into())).await
    }

    async fn dispatch_send(&self, kind: String, data: serde_json::Value, target: Option<String>) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::SendMessage { kind, data, target, reply: tx })
            .map_err(|_| Error::Disconnected)?;
        rx.await.map_err(|_| Error::Disconnected)?
    }

    /// Send a request addressed to `target` (a label, `"master"`, or `None` to
    /// broadcast) and resolve with the first reply. `deadline` bounds how long to
    /// wait; `None` waits indefinitely.
    pub async fn request(
        &self,
        event: impl Into<String>,
        data: serde_json::Value,
        target: Option<&str>,
        deadline: Option<Duration>,
    ) -> Result<Envelope, Error> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Request { kind: event.into(), data, target: target.map(String::from), reply: tx })
            .map_err(|_| Error::Disconnected)?;
        let (id, reply_rx): (RequestId, SingleReply) = rx.await.map_err(|_| Error::Disconnected)??;
        self.await_with_deadline(id, reply_rx, deadline).await
    }

    /// Fan a request out to every connection advertising `label` and collect a reply
    /// from each — or `Err(PeerGone)`-worthy absence folded into early completion if
    /// one disappears before answering.
    pub async fn request_many(
        &self,
        event: impl Into<String>,
        data: serde_json::Value,
        label: impl Into<String>,
        deadline: Option<Duration>,
    ) -> Result<Vec<Envelope>, Error> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::RequestMany { kind: event.into(), data, label: label.into(), reply: tx })
            .map_err(|_| Error::Disconnected)?;
        let (id, reply_rx): (RequestId, ManyReply) = rx.await.map_err(|_| Error::Disconnected)??;
        self.await_with_deadline(id, reply_rx, deadline).await
    }

    /// Answer an envelope received through [`Peer::on`] that carried a `request_id`.
    pub async fn reply(&self, request: &Envelope, data: serde_json::Value) -> Result<(), Error> {
        let request_id = request
            .request_id
            .ok_or_else(|| Error::BadEnvelope("envelope carries no request_id to reply to".to_string()))?;
        let envelope = Envelope {
            kind: request.kind.clone(),
            data,
            target: None,
            response_id: Some(request_id),
            request_id: None,
            from: None,
        };
        let (tx, rx) = oneshot::channel();
        self.commands.send(Command::Reply { envelope, reply: tx }).map_err(|_| Error::Disconnected)?;
        rx.await.map_err(|_| Error::Disconnected)?
    }

    /// Replace this peer's advertised labels wholesale. A no-op on a master authority.
    pub async fn set_labels(&self, labels: Vec<String>) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(Command::SetLabels { labels, reply: tx }).map_err(|_| Error::Disconnected)?;
        rx.await.map_err(|_| Error::Disconnected)?
    }

    /// Add to this peer's advertised labels, leaving existing ones in place.
    pub async fn add_labels(&self, labels: Vec<String>) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(Command::AddLabels { labels, reply: tx }).map_err(|_| Error::Disconnected)?;
        rx.await.map_err(|_| Error::Disconnected)?
    }

    /// Register a handler for `event`. The reserved name `"receive"` matches every
    /// non-internal envelope regardless of its own event name.
    pub fn on(&self, event: impl Into<String>, handler: impl Fn(&Envelope) + Send + Sync + 'static) {
        let _ = self.commands.send(Command::On { event: event.into(), handler: Arc::new(handler) });
    }

    /// Wait for `rx` up to `deadline`. A deadline's elapse behaves exactly like an
    /// explicit cancellation: it tells the router to drop `id`'s pending entry, instead
    /// of just abandoning the receiver and leaking it forever.
    async fn await_with_deadline<T>(&self, id: RequestId, rx: oneshot::Receiver<Result<T, Error>>, deadline: Option<Duration>) -> Result<T, Error> {
        let outcome = match deadline {
            None => rx.await,
            Some(d) => match tokio::time::timeout(d, rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    let _ = self.commands.send(Command::Cancel { id });
                    return Err(Error::Cancelled);
                }
            },
        };
        outcome.map_err(|_| Error::Cancelled)?
    }
}
