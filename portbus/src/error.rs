/// Every way a public operation on a [`Peer`](crate::peer::Peer) can fail.
///
/// Variants never embed the shared secret, even when they carry a peer address or a
/// raw protocol message for diagnostics.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The remote closed the handshake with `ok: false`, or it never replied in time.
    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    /// Dynamic discovery exhausted the configured port range without finding a free
    /// port to bind as master.
    #[error("no free port available in the configured range")]
    NoSlotAvailable,

    /// A directed send or `request_many` resolved to zero connections.
    #[error("no connection currently advertises label {0:?}")]
    NoSuchLabel(String),

    /// The link to the master dropped while a request was pending, or while trying to
    /// send one.
    #[error("link to master was lost")]
    Disconnected,

    /// The single connection a request was addressed to disappeared before replying.
    #[error("targeted peer disappeared before the request completed")]
    PeerGone,

    /// An inbound frame failed to decode or lacked a required field.
    #[error("malformed envelope: {0}")]
    BadEnvelope(String),

    /// A pending request was explicitly cancelled, or its deadline elapsed.
    #[error("request was cancelled")]
    Cancelled,

    /// Both `url` and `host` were supplied to a [`Config`](crate::config::Config).
    #[error("only one of `url` or `host` may be specified")]
    ConfigError,

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
