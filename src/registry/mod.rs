//! Boundary to the WireGuard configuration/peer registry.
//!
//! The registry owns live peer state and performs the actual restrict,
//! delete, allow and reset operations. The job engine only decides when to
//! ask for them.

mod memory;

pub use memory::{ConfigurationSnapshot, MemoryRegistry, PeerSnapshot, RegistrySnapshot};

use crate::job::{Job, TrafficDirection};

/// Result of asking the registry to act on peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    Success,
    Failure(String),
}

impl ActionOutcome {
    /// True when the registry carried the operation out.
    pub fn is_success(&self) -> bool {
        matches!(self, ActionOutcome::Success)
    }
}

/// A traffic counter of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    /// Usage of the current session.
    Live(TrafficDirection),
    /// Usage accumulated before the current session.
    Carryover(TrafficDirection),
}

impl Counter {
    /// Direction-qualified name, e.g. `total_receive` or `cumu_sent`.
    pub fn name(&self) -> String {
        match self {
            Counter::Live(direction) => format!("total_{}", direction.as_str()),
            Counter::Carryover(direction) => format!("cumu_{}", direction.as_str()),
        }
    }
}

/// Which usage counters a reset clears.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageScope {
    Total,
    Receive,
    Sent,
}

/// A single peer of a configuration, as seen by the job engine.
pub trait Peer {
    /// Public key identifying the peer inside its configuration.
    fn id(&self) -> &str;

    /// Current value of a counter; unknown counters read as zero.
    fn counter(&self, counter: Counter) -> f64;

    /// Clears the counters in `scope`. Returns false when the registry could
    /// not persist the reset.
    fn reset_data_usage(&self, scope: UsageScope) -> bool;

    /// Called after a job of this peer was saved or removed, with the peer's
    /// active jobs.
    fn refresh_jobs(&self, _jobs: &[Job]) {}
}

/// A WireGuard interface and the peers it holds.
pub trait WireguardConfiguration {
    /// Interface name, e.g. `wg0`.
    fn name(&self) -> &str;

    /// Looks a peer up by id; `None` when the configuration has no such peer.
    fn search_peer(&self, peer_id: &str) -> Option<&dyn Peer>;

    /// Moves the peers out of the live interface while keeping their
    /// settings, so they can be allowed again later.
    fn restrict_peers(&self, peer_ids: &[&str]) -> ActionOutcome;

    /// Removes the peers from the configuration for good.
    fn delete_peers(&self, peer_ids: &[&str]) -> ActionOutcome;

    /// Puts restricted peers back on the live interface.
    fn allow_access_peers(&self, peer_ids: &[&str]) -> ActionOutcome;
}

/// Lookup of configurations by name.
pub trait PeerRegistry {
    /// `None` when no configuration has that name.
    fn configuration(&self, name: &str) -> Option<&dyn WireguardConfiguration>;
}
