//! Dynamic port-range election, and the explicit worker/master entry points.
//!
//! The dynamic algorithm mirrors a simple two-phase probe: try to join an existing
//! master by connecting to each port in range in turn, and if none answers, bind the
//! first free one ourselves.

use std::net::SocketAddr;
use std::ops::Range;

use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::auth;
use crate::config::{AuthorityMode, Config, IPC_PATH};
use crate::error::Error;
use crate::master;
use crate::peer::Peer;
use crate::router::RouterCore;
use crate::worker::{self, WsStream};

pub(crate) async fn connect(config: Config) -> Result<Peer, Error> {
    let (secret, mode, port_range) = config.resolve()?;
    match mode {
        AuthorityMode::Worker { url } => {
            let ws = worker::connect_once(&url, &secret, Vec::new()).await?;
            Ok(bring_up_worker(url, secret, Vec::new(), ws))
        }
        AuthorityMode::Master { host } => {
            let addr: SocketAddr = host.parse().map_err(|e| Error::BadEnvelope(format!("invalid host {host:?}: {e}")))?;
            let listener = TcpListener::bind(addr).await?;
            Ok(bring_up_master(listener, secret))
        }
        AuthorityMode::Dynamic => match probe(&secret, port_range.clone()).await? {
            ProbeOutcome::Found { port, ws } => {
                let url = format!("ws://localhost:{port}{IPC_PATH}");
                Ok(bring_up_worker(url, secret, Vec::new(), ws))
            }
            ProbeOutcome::NoneFound { taken } => {
                let listener = bind_free_port(port_range, &taken).await?;
                Ok(bring_up_master(listener, secret))
            }
        },
    }
}

enum ProbeOutcome {
    Found { port: u16, ws: WsStream },
    NoneFound { taken: Vec<u16> },
}

/// Walk the port range connecting as a websocket client. A refused TCP connection
/// means the port is free; any other connection or handshake failure means something
/// is listening there that isn't answering as our kind of master, so it's recorded as
/// taken and skipped. The first port that accepts both the websocket upgrade and the
/// auth handshake is adopted as the master.
async fn probe(secret: &str, port_range: Range<u16>) -> Result<ProbeOutcome, Error> {
    let mut taken = Vec::new();
    for port in port_range {
        let url = format!("ws://localhost:{port}{IPC_PATH}");
        match tokio_tungstenite::connect_async(&url).await {
            Ok((mut ws, _response)) => {
                auth::authenticate_as_worker(&mut ws, secret, Vec::new()).await?;
                return Ok(ProbeOutcome::Found { port, ws });
            }
            Err(tokio_tungstenite::tungstenite::Error::Io(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                continue;
            }
            Err(_) => taken.push(port),
        }
    }
    Ok(ProbeOutcome::NoneFound { taken })
}

async fn bind_free_port(port_range: Range<u16>, taken: &[u16]) -> Result<TcpListener, Error> {
    for port in port_range {
        if taken.contains(&port) {
            continue;
        }
        if let Ok(listener) = TcpListener::bind(("127.0.0.1", port)).await {
            return Ok(listener);
        }
    }
    Err(Error::NoSlotAvailable)
}

fn bring_up_worker(url: String, secret: String, labels: Vec<String>, ws: WsStream) -> Peer {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let outbound = worker::spawn(url, secret, labels.clone(), ws, commands_tx.clone());
    let router = RouterCore::new_worker(outbound, labels, commands_tx.clone());
    tokio::spawn(router.run(commands_rx));
    Peer::from_commands(commands_tx)
}

fn bring_up_master(listener: TcpListener, secret: String) -> Peer {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    master::serve(listener, secret, commands_tx.clone());
    let router = RouterCore::new_master(commands_tx.clone());
    tokio::spawn(router.run(commands_rx));
    Peer::from_commands(commands_tx)
}
