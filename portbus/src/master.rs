//! The master's accept loop: one task per listener, one task per connection.

use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

use crate::auth;
use crate::config::IPC_PATH;
use crate::connection::ConnectionId;
use crate::envelope;
use crate::error::Error;
use crate::router::Command;

/// Spawn the accept loop over an already-bound listener as a background task.
pub(crate) fn serve(listener: TcpListener, secret: String, commands: mpsc::UnboundedSender<Command>) {
    tokio::spawn(accept_loop(listener, secret, commands));
}

async fn accept_loop(listener: TcpListener, secret: String, commands: mpsc::UnboundedSender<Command>) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                continue;
            }
        };
        tokio::spawn(handle_connection(stream, addr, secret.clone(), commands.clone()));
    }
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, secret: String, commands: mpsc::UnboundedSender<Command>) {
    if let Err(e) = serve_connection(stream, addr, &secret, &commands).await {
        tracing::debug!(%addr, error = %e, "connection ended");
    }
}

fn check_path(req: &Request, response: Response) -> Result<Response, ErrorResponse> {
    if req.uri().path() == IPC_PATH {
        Ok(response)
    } else {
        Err(ErrorResponse::new(Some("unexpected path".to_string())))
    }
}

async fn serve_connection(
    stream: TcpStream,
    addr: SocketAddr,
    secret: &str,
    commands: &mpsc::UnboundedSender<Command>,
) -> Result<(), Error> {
    let mut ws = tokio_tungstenite::accept_hdr_async(stream, check_path).await?;
    let labels = auth::authenticate_as_master(&mut ws, secret).await?;

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    let (reply_tx, reply_rx) = oneshot::channel();
    commands
        .send(Command::ConnectionOpened { addr, outbound: outbound_tx, labels, reply: reply_tx })
        .map_err(|_| Error::Disconnected)?;
    let id: ConnectionId = reply_rx.await.map_err(|_| Error::Disconnected)?;

    let (mut write, mut read) = ws.split();

    let writer = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            if write.send(msg).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = read.next().await {
        match frame {
            Ok(Message::Text(text)) => match envelope::decode(&text) {
                Ok(envelope) => {
                    if commands.send(Command::Inbound { from: Some(id), envelope }).is_err() {
                        break;
                    }
                }
                Err(e) => tracing::debug!(%id, error = %e, "dropping malformed frame"),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(%id, error = %e, "read error");
                break;
            }
        }
    }

    writer.abort();
    let _ = commands.send(Command::ConnectionClosed { id });
    Ok(())
}
