//! Startup gate that waits for the node to join the network.

use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};

use crate::{error::IdentifyError, peer::node::NetworkNode};

/// Shortest poll interval the gate accepts; `tokio::time::interval` rejects zero.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Holds callers back until the local node has at least one connection.
pub struct PeerReadinessGate<'a, N: ?Sized> {
    node: &'a N,
    poll_interval: Duration,
    max_wait: Option<Duration>,
}

impl<'a, N: NetworkNode + ?Sized> PeerReadinessGate<'a, N> {
    pub fn new(node: &'a N, poll_interval: Duration) -> Self {
        Self {
            node,
            poll_interval: poll_interval.max(MIN_POLL_INTERVAL),
            max_wait: None,
        }
    }

    /// Fails with `NotReady` instead of waiting longer than `max_wait`.
    pub fn with_max_wait(mut self, max_wait: Option<Duration>) -> Self {
        self.max_wait = max_wait;
        self
    }

    /// Checks the connection count once per poll interval and returns it as
    /// soon as it is non-zero.
    pub async fn await_readiness(&self) -> Result<usize, IdentifyError> {
        let started = Instant::now();
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            match self.node.active_connection_count().await {
                Ok(0) => {
                    tracing::debug!(target: "peer", "waiting for peers");
                }
                Ok(count) => {
                    tracing::info!(
                        target: "peer",
                        count,
                        waited_ms = started.elapsed().as_millis(),
                        "node ready",
                    );
                    return Ok(count);
                }
                Err(err) => {
                    tracing::warn!(target: "peer", %err, "failed to read connection count");
                }
            }

            if let Some(max_wait) = self.max_wait {
                let waited = started.elapsed();
                if waited >= max_wait {
                    tracing::warn!(target: "peer", ?waited, "gave up waiting for peers");
                    return Err(IdentifyError::NotReady { waited });
                }
            }
        }
    }
}
