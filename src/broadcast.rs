//! The control-broadcast transport between the driver rank and its peers
//! (spec.md §5, §6).
//!
//! The real binding for this is whatever collective library the inference
//! engine's process group uses (NCCL, gloo, MPI); that binding is out of
//! scope. [`RankTransport`] is the seam the coordinator talks to, and
//! [`LocalRankTransport`] is an in-process, channel-backed implementation
//! used for tests and for embedding the coordinator in a single process.

use std::sync::mpsc::{Receiver, Sender};

use serde::{Deserialize, Serialize};

use crate::error::{CoordinatorError, Result};

/// Control dict broadcast once per step from the driver to every peer rank
/// (spec.md §6). `None` (an empty broadcast) is the shutdown signal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub num_lookahead_slots: usize,
    pub no_spec: bool,
    pub disable_all_speculation: bool,
    pub run_spec_proposer_for_prefill: bool,
}

/// The collective broadcast point. Implementors must deliver the same
/// message, in the same order, to every rank (spec.md §5).
pub trait RankTransport: Send {
    fn broadcast(&self, message: Option<ControlMessage>) -> Result<()>;
    fn recv(&self) -> Result<Option<ControlMessage>>;
}

/// Driver side of an in-process transport: one sender fanned out to every
/// peer's receiver.
pub struct DriverTransport {
    peers: Vec<Sender<Option<ControlMessage>>>,
}

impl DriverTransport {
    pub fn new(peers: Vec<Sender<Option<ControlMessage>>>) -> Self {
        Self { peers }
    }
}

impl RankTransport for DriverTransport {
    fn broadcast(&self, message: Option<ControlMessage>) -> Result<()> {
        for peer in &self.peers {
            peer.send(message).map_err(|_| {
                CoordinatorError::InvariantViolation(
                    "peer rank channel closed before broadcast was delivered".into(),
                )
            })?;
        }
        Ok(())
    }

    fn recv(&self) -> Result<Option<ControlMessage>> {
        Err(CoordinatorError::InvariantViolation(
            "the driver rank never receives its own broadcast".into(),
        ))
    }
}

/// Peer side of an in-process transport.
pub struct PeerTransport {
    rx: Receiver<Option<ControlMessage>>,
}

impl PeerTransport {
    pub fn new(rx: Receiver<Option<ControlMessage>>) -> Self {
        Self { rx }
    }
}

impl RankTransport for PeerTransport {
    fn broadcast(&self, _message: Option<ControlMessage>) -> Result<()> {
        Err(CoordinatorError::InvariantViolation(
            "only the driver rank may broadcast".into(),
        ))
    }

    fn recv(&self) -> Result<Option<ControlMessage>> {
        self.rx.recv().map_err(|_| {
            CoordinatorError::InvariantViolation(
                "driver rank channel closed without sending a shutdown signal".into(),
            )
        })
    }
}

/// Builds one [`DriverTransport`] and `n_peers` matching [`PeerTransport`]s
/// wired together over `std::sync::mpsc` channels.
pub fn local_transport_group(n_peers: usize) -> (DriverTransport, Vec<PeerTransport>) {
    let mut senders = Vec::with_capacity(n_peers);
    let mut peers = Vec::with_capacity(n_peers);
    for _ in 0..n_peers {
        let (tx, rx) = std::sync::mpsc::channel();
        senders.push(tx);
        peers.push(PeerTransport::new(rx));
    }
    (DriverTransport::new(senders), peers)
}
