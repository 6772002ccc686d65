//! The handshake frame and the read/write logic shared by both ends of it.
//!
//! The handshake uses its own small wire shape rather than [`Envelope`](crate::envelope::Envelope):
//! it needs an `ok`/`message` pair the general envelope has no field for, and it is
//! the one frame exchanged before either side has a connection id to stamp `from`
//! with.

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::config::AUTH_TIMEOUT;
use crate::error::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct AuthFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Labels the worker wants registered atomically with the handshake, instead of a
    /// separate `ipc_setlabels` round trip right after connecting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<Vec<String>>,
}

impl AuthFrame {
    fn request(secret: &str, labels: Vec<String>) -> Self {
        Self {
            kind: "auth".to_string(),
            data: Some(secret.to_string()),
            ok: None,
            message: None,
            labels: if labels.is_empty() { None } else { Some(labels) },
        }
    }

    fn accepted() -> Self {
        Self { kind: "auth".to_string(), data: None, ok: Some(true), message: None, labels: None }
    }

    fn rejected(message: impl Into<String>) -> Self {
        Self { kind: "auth".to_string(), data: None, ok: Some(false), message: Some(message.into()), labels: None }
    }
}

async fn send_frame<S>(ws: &mut WebSocketStream<S>, frame: &AuthFrame) -> Result<(), Error>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let text = serde_json::to_string(frame).map_err(|e| Error::BadEnvelope(e.to_string()))?;
    ws.send(Message::Text(text)).await?;
    Ok(())
}

async fn recv_frame<S>(ws: &mut WebSocketStream<S>) -> Result<AuthFrame, Error>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let outcome = timeout(AUTH_TIMEOUT, ws.next()).await;
    match outcome {
        Err(_) => Err(Error::AuthRejected("handshake timed out".to_string())),
        Ok(None) => Err(Error::AuthRejected("connection closed during handshake".to_string())),
        Ok(Some(Err(e))) => Err(Error::WebSocket(e)),
        Ok(Some(Ok(Message::Text(text)))) => {
            serde_json::from_str(&text).map_err(|e| Error::AuthRejected(format!("malformed auth frame: {e}")))
        }
        Ok(Some(Ok(_))) => Err(Error::AuthRejected("expected a text auth frame".to_string())),
    }
}

/// Worker side: send the secret (and any initial labels), then wait for the verdict.
pub(crate) async fn authenticate_as_worker<S>(
    ws: &mut WebSocketStream<S>,
    secret: &str,
    labels: Vec<String>,
) -> Result<(), Error>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    send_frame(ws, &AuthFrame::request(secret, labels)).await?;
    let reply = recv_frame(ws).await?;
    match reply.ok {
        Some(true) => Ok(()),
        Some(false) => Err(Error::AuthRejected(reply.message.unwrap_or_default())),
        None => Err(Error::AuthRejected("auth reply missing `ok`".to_string())),
    }
}

/// Master side: wait for the secret, reply with the verdict. Returns the initial
/// labels the worker asked to be registered with, if any.
pub(crate) async fn authenticate_as_master<S>(
    ws: &mut WebSocketStream<S>,
    secret: &str,
) -> Result<Vec<String>, Error>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let request = recv_frame(ws).await?;
    if request.kind != "auth" {
        let _ = send_frame(ws, &AuthFrame::rejected("Sent non-auth packet before authenticating")).await;
        return Err(Error::AuthRejected("Sent non-auth packet before authenticating".to_string()));
    }
    if request.data.as_deref() != Some(secret) {
        let _ = send_frame(ws, &AuthFrame::rejected("Bad token")).await;
        return Err(Error::AuthRejected("Bad token".to_string()));
    }
    send_frame(ws, &AuthFrame::accepted()).await?;
    Ok(request.labels.unwrap_or_default())
}
