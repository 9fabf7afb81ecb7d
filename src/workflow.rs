//! End-to-end "identify a peer" workflow.
//!
//! A run goes through resolution, dialing and the identify handshake under a
//! single deadline, reporting each phase and every DHT event on one ordered
//! stream of [`WorkflowEvent`]s.

use std::fmt;

use libp2p::PeerId;
use tokio::{sync::mpsc, time::Instant};

use crate::{
    config::WorkflowConfig,
    error::IdentifyError,
    identify::{IdentifyExchanger, PeerMetadataRecord, ResultNormalizer},
    peer::{
        AddressResolver, ConnectionEstablisher, NetworkNode, PeerReadinessGate, PeerReference,
        ProgressEvent,
    },
};

/// Status updates of one identify run, in the order they happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowEvent {
    /// A DHT lookup for the peer is starting.
    Searching { peer: PeerId },
    /// Something happened inside the DHT lookup.
    Dht(ProgressEvent),
    /// Candidate addresses are being dialed.
    Connecting { target: String },
    /// Connected; waiting for the identify response.
    Handshaking { peer: PeerId },
}

impl fmt::Display for WorkflowEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowEvent::Searching { peer } => write!(f, "Searching for peer {peer}..."),
            WorkflowEvent::Dht(event) => event.fmt(f),
            WorkflowEvent::Connecting { target } => write!(f, "Connecting to {target}"),
            WorkflowEvent::Handshaking { .. } => f.write_str("Connected, running identify"),
        }
    }
}

/// Queue a caller drains to follow a run.
#[derive(Debug)]
pub struct ProgressQueue {
    sender: mpsc::UnboundedSender<WorkflowEvent>,
    receiver: mpsc::UnboundedReceiver<WorkflowEvent>,
}

/// Cloneable producer side of a [`ProgressQueue`].
#[derive(Clone, Debug)]
pub struct WorkflowEventSender {
    sender: mpsc::UnboundedSender<WorkflowEvent>,
}

impl ProgressQueue {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self { sender, receiver }
    }

    pub fn sender(&self) -> WorkflowEventSender {
        WorkflowEventSender {
            sender: self.sender.clone(),
        }
    }

    /// Attempts to dequeue an event without blocking.
    pub fn try_dequeue(&mut self) -> Option<WorkflowEvent> {
        self.receiver.try_recv().ok()
    }

    /// Waits for the next event.
    pub async fn recv(&mut self) -> Option<WorkflowEvent> {
        self.receiver.recv().await
    }
}

impl Default for ProgressQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowEventSender {
    /// Sender whose events go nowhere, for callers that do not follow progress.
    pub fn discard() -> Self {
        let (sender, _) = mpsc::unbounded_channel();
        Self { sender }
    }

    pub fn emit(&self, event: WorkflowEvent) {
        tracing::debug!(target: "workflow", %event, "progress");
        if self.sender.send(event).is_err() {
            tracing::trace!(target: "workflow", "progress receiver dropped; skipping update");
        }
    }
}

/// Sequences resolution, dialing, identify and normalization.
#[derive(Debug, Clone)]
pub struct IdentifyWorkflow<N> {
    node: N,
    config: WorkflowConfig,
}

impl<N: NetworkNode> IdentifyWorkflow<N> {
    pub fn new(node: N, config: WorkflowConfig) -> Self {
        Self { node, config }
    }

    pub fn node(&self) -> &N {
        &self.node
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    /// Blocks until the node has a peer, per the configured poll interval and bound.
    pub async fn await_readiness(&self) -> Result<usize, IdentifyError> {
        PeerReadinessGate::new(&self.node, self.config.readiness_poll_interval)
            .with_max_wait(self.config.readiness_max_wait)
            .await_readiness()
            .await
    }

    /// Identifies `input` within the configured deadline.
    pub async fn run_identify(
        &self,
        input: &str,
        progress: &WorkflowEventSender,
    ) -> Result<PeerMetadataRecord, IdentifyError> {
        let deadline = Instant::now() + self.config.deadline;
        self.run_identify_until(input, deadline, progress).await
    }

    /// Identifies `input`, giving up at `deadline`.
    ///
    /// The first failing step ends the run and its error is returned as is.
    /// Time spent resolving is taken from the budget left for dialing and
    /// the handshake.
    pub async fn run_identify_until(
        &self,
        input: &str,
        deadline: Instant,
        progress: &WorkflowEventSender,
    ) -> Result<PeerMetadataRecord, IdentifyError> {
        let reference = PeerReference::parse(input)?;
        tracing::info!(target: "workflow", %reference, "identify requested");

        if let PeerReference::OpaqueIdentity(peer) = &reference {
            progress.emit(WorkflowEvent::Searching { peer: *peer });
        }

        let candidates = AddressResolver::new(&self.node)
            .resolve(&reference, deadline, |event| {
                progress.emit(WorkflowEvent::Dht(event))
            })
            .await?;

        progress.emit(WorkflowEvent::Connecting {
            target: reference.to_string(),
        });
        let connection = ConnectionEstablisher::new(&self.node)
            .connect(&candidates, deadline)
            .await?;

        progress.emit(WorkflowEvent::Handshaking {
            peer: connection.peer_id,
        });
        let response = IdentifyExchanger::new(&self.node)
            .identify(&connection, deadline)
            .await?;

        let record = ResultNormalizer.normalize(&response);
        tracing::info!(target: "workflow", peer_id = %record.peer_id, "identify complete");
        Ok(record)
    }
}
