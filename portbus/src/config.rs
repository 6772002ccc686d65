//! Construction-time configuration for a [`Peer`](crate::peer::Peer).

use std::ops::Range;
use std::time::Duration;

/// Default loopback port range probed during discovery and election.
pub const DEFAULT_PORT_RANGE: Range<u16> = 46000..46100;

/// Fixed websocket path every peer listens on and connects to.
pub const IPC_PATH: &str = "/nextcord-ipc";

/// How long the master waits for the auth frame, and a worker waits for the reply,
/// before giving up on the handshake.
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub(crate) enum AuthorityMode {
    Dynamic,
    Worker { url: String },
    Master { host: String },
}

/// Builder for the authority and secret a [`Peer`](crate::peer::Peer) should assume.
///
/// `url` and `host` are mutually exclusive: a config can hold at most one authority, so
/// calling one after the other already fails, right there at the call site — there is
/// nothing left for `connect()` to reject later.
#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) secret: String,
    authority: Option<AuthorityMode>,
    pub(crate) port_range: Range<u16>,
}

impl Config {
    /// Start from the shared secret alone: dynamic authority, default port range.
    pub fn new(secret: impl Into<String>) -> Self {
        Self { secret: secret.into(), authority: None, port_range: DEFAULT_PORT_RANGE }
    }

    /// Force worker authority, connecting directly to `url` instead of probing the
    /// port range. Fails if `host` was already set on this config.
    pub fn url(mut self, url: impl Into<String>) -> Result<Self, crate::error::Error> {
        if self.authority.is_some() {
            return Err(crate::error::Error::ConfigError);
        }
        self.authority = Some(AuthorityMode::Worker { url: url.into() });
        Ok(self)
    }

    /// Force master authority, binding directly on `host` instead of probing the port
    /// range. Fails if `url` was already set on this config.
    pub fn host(mut self, host: impl Into<String>) -> Result<Self, crate::error::Error> {
        if self.authority.is_some() {
            return Err(crate::error::Error::ConfigError);
        }
        self.authority = Some(AuthorityMode::Master { host: host.into() });
        Ok(self)
    }

    /// Override the port range probed and bound during dynamic discovery.
    pub fn with_port_range(mut self, range: Range<u16>) -> Self {
        self.port_range = range;
        self
    }

    pub(crate) fn resolve(self) -> Result<(String, AuthorityMode, Range<u16>), crate::error::Error> {
        let mode = self.authority.unwrap_or(AuthorityMode::Dynamic);
        Ok((self.secret, mode, self.port_range))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflicting_authority_is_rejected_at_construction() {
        let result = Config::new("s3cr3t").url("ws://localhost:9000").unwrap().host("0.0.0.0:9000");
        assert!(matches!(result, Err(crate::error::Error::ConfigError)));
    }

    #[test]
    fn bare_secret_resolves_to_dynamic() {
        let (_, mode, range) = Config::new("s3cr3t").resolve().unwrap();
        assert!(matches!(mode, AuthorityMode::Dynamic));
        assert_eq!(range, DEFAULT_PORT_RANGE);
    }
}
