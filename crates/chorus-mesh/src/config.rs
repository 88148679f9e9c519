//! Receiver configuration.

use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Default ceiling on simultaneous direct peer links.
pub const DEFAULT_MAX_PEERS: usize = 32;

/// Default ceiling on unanswered inbound connection attempts.
pub const DEFAULT_MAX_PENDING_INBOUND: usize = 32;

/// Default ceiling on signals queued per pending inbound peer.
pub const DEFAULT_MAX_PENDING_SIGNALS: usize = 16;

/// What to do with a signal from a peer we have no link to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IncomingPolicy {
    /// Hold it as pending until `accept_incoming` or `reject_incoming`.
    #[default]
    Manual,
    /// Accept immediately, subject to the same capacity check as `connect`.
    AutoAccept,
}

/// Configuration for a [`CollectiveReceiver`](crate::CollectiveReceiver).
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Maximum number of live peer links.
    pub max_peers: usize,

    /// Maximum number of peers waiting in the pending inbound table.
    pub max_pending_inbound: usize,

    /// Maximum number of signals held for one pending peer.
    pub max_pending_signals: usize,

    /// Handling of signals from unknown peers.
    pub incoming: IncomingPolicy,

    /// Evict a remote participant after this long without an update.
    /// `None` keeps silent peers until their link closes.
    pub stale_after: Option<Duration>,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            max_peers: DEFAULT_MAX_PEERS,
            max_pending_inbound: DEFAULT_MAX_PENDING_INBOUND,
            max_pending_signals: DEFAULT_MAX_PENDING_SIGNALS,
            incoming: IncomingPolicy::Manual,
            stale_after: None,
        }
    }
}

impl ReceiverConfig {
    /// Create config from environment variables with defaults for anything unset.
    ///
    /// - `CHORUS_MAX_PEERS`
    /// - `CHORUS_MAX_PENDING_INBOUND`
    /// - `CHORUS_MAX_PENDING_SIGNALS`
    /// - `CHORUS_AUTO_ACCEPT` (`true`/`false`)
    /// - `CHORUS_STALE_AFTER_SECS`
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(max) = parse_var::<usize>(&lookup, "CHORUS_MAX_PEERS")? {
            config.max_peers = max;
        }
        if let Some(max) = parse_var::<usize>(&lookup, "CHORUS_MAX_PENDING_INBOUND")? {
            config.max_pending_inbound = max;
        }
        if let Some(max) = parse_var::<usize>(&lookup, "CHORUS_MAX_PENDING_SIGNALS")? {
            config.max_pending_signals = max;
        }
        if let Some(auto) = parse_var::<bool>(&lookup, "CHORUS_AUTO_ACCEPT")? {
            config.incoming = if auto {
                IncomingPolicy::AutoAccept
            } else {
                IncomingPolicy::Manual
            };
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "CHORUS_STALE_AFTER_SECS")? {
            config.stale_after = Some(Duration::from_secs(secs));
        }

        config.validate()?;
        Ok(config)
    }

    /// Check the values make sense together.
    pub fn validate(&self) -> Result<()> {
        if self.max_peers == 0 {
            return Err(Error::Config("max_peers must be at least 1".into()));
        }
        if self.max_pending_signals == 0 {
            return Err(Error::Config("max_pending_signals must be at least 1".into()));
        }
        if self.stale_after == Some(Duration::ZERO) {
            return Err(Error::Config("stale_after must be non-zero".into()));
        }
        Ok(())
    }

    /// Set the live peer ceiling.
    #[must_use]
    pub fn with_max_peers(mut self, max_peers: usize) -> Self {
        self.max_peers = max_peers;
        self
    }

    /// Set the pending inbound ceiling.
    #[must_use]
    pub fn with_max_pending_inbound(mut self, max: usize) -> Self {
        self.max_pending_inbound = max;
        self
    }

    /// Set the per-peer pending signal ceiling.
    #[must_use]
    pub fn with_max_pending_signals(mut self, max: usize) -> Self {
        self.max_pending_signals = max;
        self
    }

    /// Set the incoming signal policy.
    #[must_use]
    pub fn with_incoming(mut self, policy: IncomingPolicy) -> Self {
        self.incoming = policy;
        self
    }

    /// Evict remote participants silent for longer than `after`.
    #[must_use]
    pub fn with_stale_after(mut self, after: Duration) -> Self {
        self.stale_after = Some(after);
        self
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("{key}: cannot parse {raw:?}"))),
    }
}
