use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{ActionOutcome, Counter, Peer, PeerRegistry, UsageScope, WireguardConfiguration};
use crate::error::Result;
use crate::job::Job;

/// Serializable view of a [`MemoryRegistry`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    #[serde(default)]
    pub configurations: Vec<ConfigurationSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationSnapshot {
    pub name: String,
    #[serde(default)]
    pub peers: Vec<PeerSnapshot>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeerSnapshot {
    pub id: String,
    /// Counters by direction-qualified name (`total_receive`, `cumu_receive`, ...).
    #[serde(default)]
    pub counters: BTreeMap<String, f64>,
    #[serde(default)]
    pub restricted: bool,
    /// Ids of the active jobs last reported for this peer.
    #[serde(default)]
    pub jobs: Vec<String>,
}

#[derive(Debug, Default)]
struct PeerState {
    counters: BTreeMap<String, f64>,
    restricted: bool,
    deleted: bool,
    jobs: Vec<String>,
}

struct MemoryPeer {
    id: String,
    state: Mutex<PeerState>,
}

impl MemoryPeer {
    fn lock(&self) -> MutexGuard<'_, PeerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Peer for MemoryPeer {
    fn id(&self) -> &str {
        &self.id
    }

    fn counter(&self, counter: Counter) -> f64 {
        self.lock().counters.get(&counter.name()).copied().unwrap_or(0.0)
    }

    fn reset_data_usage(&self, scope: UsageScope) -> bool {
        let directions: &[&str] = match scope {
            UsageScope::Total => &["receive", "sent", "data"],
            UsageScope::Receive => &["receive"],
            UsageScope::Sent => &["sent"],
        };
        let mut state = self.lock();
        for direction in directions {
            state.counters.insert(format!("total_{direction}"), 0.0);
            state.counters.insert(format!("cumu_{direction}"), 0.0);
        }
        debug!(peer = %self.id, ?scope, "data usage reset");
        true
    }

    fn refresh_jobs(&self, jobs: &[Job]) {
        self.lock().jobs = jobs.iter().map(|j| j.job_id.clone()).collect();
    }
}

struct MemoryConfiguration {
    name: String,
    peers: Vec<MemoryPeer>,
}

impl MemoryConfiguration {
    fn find(&self, peer_id: &str) -> Option<&MemoryPeer> {
        self.peers
            .iter()
            .find(|p| p.id == peer_id && !p.lock().deleted)
    }

    fn apply(&self, peer_ids: &[&str], f: impl Fn(&mut PeerState)) -> ActionOutcome {
        // Validate everything first so a bad id leaves all peers untouched.
        let mut peers = Vec::with_capacity(peer_ids.len());
        for id in peer_ids {
            match self.find(id) {
                Some(peer) => peers.push(peer),
                None => {
                    return ActionOutcome::Failure(format!(
                        "Peer {id} does not exist in {}",
                        self.name
                    ));
                }
            }
        }
        for peer in peers {
            f(&mut peer.lock());
        }
        ActionOutcome::Success
    }
}

impl WireguardConfiguration for MemoryConfiguration {
    fn name(&self) -> &str {
        &self.name
    }

    fn search_peer(&self, peer_id: &str) -> Option<&dyn Peer> {
        self.find(peer_id).map(|p| p as &dyn Peer)
    }

    fn restrict_peers(&self, peer_ids: &[&str]) -> ActionOutcome {
        self.apply(peer_ids, |state| state.restricted = true)
    }

    fn delete_peers(&self, peer_ids: &[&str]) -> ActionOutcome {
        self.apply(peer_ids, |state| state.deleted = true)
    }

    fn allow_access_peers(&self, peer_ids: &[&str]) -> ActionOutcome {
        self.apply(peer_ids, |state| state.restricted = false)
    }
}

/// Peer registry held entirely in memory.
///
/// Restricted peers stay searchable, deleted peers disappear. The state can
/// be round-tripped through a JSON [`RegistrySnapshot`] file.
#[derive(Default)]
pub struct MemoryRegistry {
    configurations: BTreeMap<String, MemoryConfiguration>,
}

impl MemoryRegistry {
    pub fn from_snapshot(snapshot: RegistrySnapshot) -> Self {
        let configurations = snapshot
            .configurations
            .into_iter()
            .map(|c| {
                let peers = c
                    .peers
                    .into_iter()
                    .map(|p| MemoryPeer {
                        id: p.id,
                        state: Mutex::new(PeerState {
                            counters: p.counters,
                            restricted: p.restricted,
                            deleted: false,
                            jobs: p.jobs,
                        }),
                    })
                    .collect();
                (
                    c.name.clone(),
                    MemoryConfiguration {
                        name: c.name,
                        peers,
                    },
                )
            })
            .collect();
        Self { configurations }
    }

    /// Current state; deleted peers are left out.
    pub fn snapshot(&self) -> RegistrySnapshot {
        let configurations = self
            .configurations
            .values()
            .map(|c| ConfigurationSnapshot {
                name: c.name.clone(),
                peers: c
                    .peers
                    .iter()
                    .filter_map(|p| {
                        let state = p.lock();
                        (!state.deleted).then(|| PeerSnapshot {
                            id: p.id.clone(),
                            counters: state.counters.clone(),
                            restricted: state.restricted,
                            jobs: state.jobs.clone(),
                        })
                    })
                    .collect(),
            })
            .collect();
        RegistrySnapshot { configurations }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let snapshot: RegistrySnapshot = serde_json::from_str(&contents)?;
        Ok(Self::from_snapshot(snapshot))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.snapshot())?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn is_restricted(&self, configuration: &str, peer_id: &str) -> Option<bool> {
        self.configurations
            .get(configuration)?
            .find(peer_id)
            .map(|p| p.lock().restricted)
    }
}

impl PeerRegistry for MemoryRegistry {
    fn configuration(&self, name: &str) -> Option<&dyn WireguardConfiguration> {
        self.configurations
            .get(name)
            .map(|c| c as &dyn WireguardConfiguration)
    }
}
