//! Global configuration helpers and defaults for the library.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use once_cell::sync::OnceCell;
use tracing_subscriber::{fmt, EnvFilter};

/// Public libp2p bootstrap peers used to join the DHT.
pub const DEFAULT_BOOTSTRAP_PEERS: &[&str] = &[
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmNnooDu7bfjPFoTZYxMNLWUQJyrVwtbZg5gBMjTezGAJN",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmQCU2EcMqAqQPR2i9bChDtGNJchTbq5TbXJJ16u19uLTa",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmbLHAnMoJPWSCR5Zhtx6BHJX9KiKNN6tpvbUcqanj75Nb",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmcZf59bWwK5XFi76CZX8cbJ4BhTzzA3gU1ZjYZcYW3dwt",
    "/ip4/104.131.131.82/tcp/4001/p2p/QmaCpDMGvV2BGHeYERUEnRQAwe3N8SzbUtfsmvsqQLuvuJ",
];

/// Wall-clock budget shared by resolution, dialing and the handshake.
pub const DEFAULT_IDENTIFY_DEADLINE: Duration = Duration::from_secs(10);
/// How often the readiness gate checks the connection table.
pub const DEFAULT_READINESS_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Upper bound on the startup wait for a first connection.
pub const DEFAULT_READINESS_MAX_WAIT: Duration = Duration::from_secs(60);

const ENV_DEADLINE_MS: &str = "PEER_IDENTIFY_TIMEOUT_MS";
const ENV_READY_POLL_MS: &str = "PEER_IDENTIFY_READY_POLL_MS";
const ENV_READY_MAX_WAIT_MS: &str = "PEER_IDENTIFY_READY_MAX_WAIT_MS";

static TRACING_INITIALIZED: OnceCell<()> = OnceCell::new();

/// Initializes the global [`tracing`] subscriber once per process.
///
/// Subsequent invocations become no-ops, making it safe to call from
/// different entry points without worrying about initialization order.
pub fn init_tracing() -> Result<()> {
    TRACING_INITIALIZED
        .get_or_try_init(|| {
            let env_filter =
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
            fmt::Subscriber::builder()
                .with_env_filter(env_filter)
                .try_init()
                .map_err(|err| anyhow!(err))?;
            Ok(())
        })
        .map(|_| ())
}

/// Timing knobs for the identify workflow and the startup readiness gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowConfig {
    /// Budget for one identify run, from input validation to the handshake response.
    pub deadline: Duration,
    /// Interval between connection-count checks while waiting for readiness.
    pub readiness_poll_interval: Duration,
    /// Give up waiting for a first connection after this long. `None` waits forever.
    pub readiness_max_wait: Option<Duration>,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            deadline: DEFAULT_IDENTIFY_DEADLINE,
            readiness_poll_interval: DEFAULT_READINESS_POLL_INTERVAL,
            readiness_max_wait: Some(DEFAULT_READINESS_MAX_WAIT),
        }
    }
}

impl WorkflowConfig {
    /// Builds a config from the defaults overridden by `PEER_IDENTIFY_*` variables.
    ///
    /// `PEER_IDENTIFY_READY_MAX_WAIT_MS=0` disables the readiness bound.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(ms) = parse_millis(&lookup, ENV_DEADLINE_MS)? {
            config.deadline = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_millis(&lookup, ENV_READY_POLL_MS)? {
            config.readiness_poll_interval = Duration::from_millis(ms.max(1));
        }
        if let Some(ms) = parse_millis(&lookup, ENV_READY_MAX_WAIT_MS)? {
            config.readiness_max_wait = (ms > 0).then(|| Duration::from_millis(ms));
        }

        Ok(config)
    }
}

fn parse_millis(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<u64>> {
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<u64>()
        .map(Some)
        .with_context(|| format!("{key} must be a whole number of milliseconds, got {raw:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_use_documented_timings() {
        let config = WorkflowConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config, WorkflowConfig::default());
        assert_eq!(config.deadline, Duration::from_secs(10));
        assert_eq!(config.readiness_poll_interval, Duration::from_secs(1));
    }

    #[test]
    fn env_overrides_are_applied() {
        let config = WorkflowConfig::from_lookup(lookup_from(&[
            (ENV_DEADLINE_MS, "2500"),
            (ENV_READY_POLL_MS, "250"),
            (ENV_READY_MAX_WAIT_MS, "0"),
        ]))
        .unwrap();

        assert_eq!(config.deadline, Duration::from_millis(2500));
        assert_eq!(config.readiness_poll_interval, Duration::from_millis(250));
        assert_eq!(config.readiness_max_wait, None);
    }

    #[test]
    fn malformed_override_is_rejected() {
        let err = WorkflowConfig::from_lookup(lookup_from(&[(ENV_DEADLINE_MS, "soon")]))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_DEADLINE_MS));
    }

    #[test]
    fn bootstrap_peers_parse() {
        for peer in DEFAULT_BOOTSTRAP_PEERS {
            assert!(peer.parse::<libp2p::Multiaddr>().is_ok(), "{peer}");
        }
    }
}
