//! A self-organizing websocket message bus for cooperating processes on one host.
//!
//! Each process constructs a [`Peer`] from a shared secret. The first one up binds a
//! port in a well-known range and becomes the master; every later one finds it and
//! becomes a worker. From there, every peer can broadcast, address a label, send a
//! request and await its reply, or fan a request out to every connection behind a
//! label and collect them all — the master/worker split is invisible past [`Peer::connect`].
//!
//! ```no_run
//! # async fn run() -> Result<(), portbus::Error> {
//! use portbus::{Config, Peer};
//!
//! let peer = Peer::connect(Config::new("shared-secret")).await?;
//! peer.set_labels(vec!["renderer".to_string()]).await?;
//! peer.on("receive", |envelope| println!("{envelope:?}"));
//! peer.send_message("ping", serde_json::json!({})).await?;
//! # Ok(())
//! # }
//! ```

mod auth;
mod config;
mod connection;
mod discovery;
mod envelope;
mod error;
mod internal;
mod labels;
mod listener;
mod master;
mod pending;
mod peer;
mod router;
mod worker;

pub use config::Config;
pub use envelope::{Envelope, RequestId, TargetKind};
pub use error::Error;
pub use peer::Peer;
