//! The worker's single upstream link, including reconnect-on-drop.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::auth;
use crate::envelope;
use crate::error::Error;
use crate::router::Command;

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long to wait between reconnect attempts after the link to the master drops.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

pub(crate) async fn connect_once(url: &str, secret: &str, labels: Vec<String>) -> Result<WsStream, Error> {
    let (mut ws, _response) = tokio_tungstenite::connect_async(url).await?;
    auth::authenticate_as_worker(&mut ws, secret, labels).await?;
    Ok(ws)
}

/// Drive an already-authenticated link until it drops, then keep retrying `url` with a
/// fixed delay. Frames queued on `outbound_rx` while disconnected are sent once the
/// next connection's writer loop picks the channel back up.
pub(crate) fn spawn(
    url: String,
    secret: String,
    labels: Vec<String>,
    first: WsStream,
    commands: mpsc::UnboundedSender<Command>,
) -> mpsc::UnboundedSender<Message> {
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    tokio::spawn(run(url, secret, labels, first, commands, outbound_rx));
    outbound_tx
}

enum Outcome {
    LinkLost,
    ChannelClosed,
}

async fn run(
    url: String,
    secret: String,
    labels: Vec<String>,
    mut current: WsStream,
    commands: mpsc::UnboundedSender<Command>,
    mut outbound_rx: mpsc::UnboundedReceiver<Message>,
) {
    loop {
        match run_connected(current, &commands, &mut outbound_rx).await {
            Outcome::ChannelClosed => return,
            Outcome::LinkLost => {
                let _ = commands.send(Command::LinkLost);
            }
        }

        current = loop {
            match connect_once(&url, &secret, labels.clone()).await {
                Ok(ws) => break ws,
                Err(e) => {
                    tracing::warn!(%url, error = %e, "reconnect to master failed, retrying");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        };
        tracing::info!(%url, "reconnected to master");
    }
}

async fn run_connected(
    ws: WsStream,
    commands: &mpsc::UnboundedSender<Command>,
    outbound_rx: &mut mpsc::UnboundedReceiver<Message>,
) -> Outcome {
    let (mut write, mut read) = ws.split();
    loop {
        tokio::select! {
            frame = read.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => match envelope::decode(&text) {
                        Ok(envelope) => {
                            if commands.send(Command::Inbound { from: None, envelope }).is_err() {
                                return Outcome::ChannelClosed;
                            }
                        }
                        Err(e) => tracing::debug!(error = %e, "dropping malformed frame"),
                    },
                    Some(Ok(Message::Close(_))) | None => return Outcome::LinkLost,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "read error");
                        return Outcome::LinkLost;
                    }
                }
            }
            maybe_msg = outbound_rx.recv() => {
                match maybe_msg {
                    Some(msg) => {
                        if write.send(msg).await.is_err() {
                            return Outcome::LinkLost;
                        }
                    }
                    None => return Outcome::ChannelClosed,
                }
            }
        }
    }
}
