//! Snapshot building and per-client delta compression

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::debug;

use crate::ws::protocol::{DeltaData, PlayerDelta, PlayerId, PlayerState, ServerMsg, SnapshotData};

/// Broadcast ticks remembered per client as potential baselines
pub const SENT_HISTORY: usize = 32;

/// Immutable world state produced at the end of a broadcast tick
#[derive(Debug, Clone, PartialEq)]
pub struct WorldSnapshot {
    pub tick: u64,
    /// Room clock at build time
    pub timestamp: u64,
    pub players: Vec<PlayerState>,
    pub last_processed_sequence: HashMap<PlayerId, u32>,
    pub input_ticks: HashMap<PlayerId, u32>,
}

impl WorldSnapshot {
    pub fn player(&self, id: &PlayerId) -> Option<&PlayerState> {
        self.players.iter().find(|p| p.id == *id)
    }

    pub fn to_data(&self) -> SnapshotData {
        SnapshotData {
            tick: self.tick,
            players: self.players.clone(),
            last_processed_sequence: self.last_processed_sequence.clone(),
            input_ticks: self.input_ticks.clone(),
        }
    }
}

/// Decides broadcast ticks and builds snapshots
pub struct SnapshotBuilder {
    /// Snapshot interval in ticks
    snapshot_interval: u32,
}

impl SnapshotBuilder {
    pub fn new(snapshot_interval: u32) -> Self {
        Self {
            snapshot_interval: snapshot_interval.max(1),
        }
    }

    /// Check if `tick` is a broadcast tick
    pub fn should_send(&self, tick: u64) -> bool {
        tick % self.snapshot_interval as u64 == 0
    }

    pub fn build(
        &self,
        tick: u64,
        timestamp: u64,
        players: impl IntoIterator<Item = (PlayerState, u32, u32)>,
    ) -> Arc<WorldSnapshot> {
        let mut snapshot = WorldSnapshot {
            tick,
            timestamp,
            players: Vec::new(),
            last_processed_sequence: HashMap::new(),
            input_ticks: HashMap::new(),
        };
        for (state, sequence, input_ticks) in players {
            snapshot.last_processed_sequence.insert(state.id, sequence);
            snapshot.input_ticks.insert(state.id, input_ticks);
            snapshot.players.push(state);
        }
        // Stable order keeps encoded frames comparable across ticks
        snapshot.players.sort_by_key(|p| p.id);
        Arc::new(snapshot)
    }
}

/// Per-client baseline bookkeeping
#[derive(Debug, Default)]
struct ClientBaseline {
    sent: VecDeque<Arc<WorldSnapshot>>,
    acked_tick: Option<u64>,
    broadcasts_since_ack: u32,
    last_full_at: Option<u64>,
}

impl ClientBaseline {
    fn sent_snapshot(&self, tick: u64) -> Option<&Arc<WorldSnapshot>> {
        self.sent.iter().find(|s| s.tick == tick)
    }
}

/// Per-client delta encoder
///
/// Each client is diffed against the last broadcast it acknowledged. Without a
/// usable baseline the client gets a full `state:snapshot` instead.
pub struct DeltaTracker {
    clients: HashMap<PlayerId, ClientBaseline>,
    /// Broadcasts without an ack before the baseline is considered stale
    stale_after: u32,
    /// Periodic forced resync, 0 disables
    full_interval_ms: u64,
}

impl DeltaTracker {
    pub fn new(stale_after: u32, full_interval_ms: u64) -> Self {
        Self {
            clients: HashMap::new(),
            stale_after: stale_after.max(1),
            full_interval_ms,
        }
    }

    /// Record a client ack; only moves forward and only to ticks still held
    pub fn acknowledge(&mut self, client: PlayerId, tick: u64) -> bool {
        let Some(baseline) = self.clients.get_mut(&client) else {
            return false;
        };
        if baseline.acked_tick.is_some_and(|acked| tick <= acked) {
            return false;
        }
        if baseline.sent_snapshot(tick).is_none() {
            debug!(client = %client, tick, "Ack for unknown tick ignored");
            return false;
        }
        baseline.acked_tick = Some(tick);
        baseline.broadcasts_since_ack = 0;
        true
    }

    pub fn baseline_tick(&self, client: &PlayerId) -> Option<u64> {
        self.clients.get(client).and_then(|b| b.acked_tick)
    }

    /// Encode `snapshot` for one client and remember it as a future baseline
    pub fn encode(&mut self, client: PlayerId, snapshot: &Arc<WorldSnapshot>, now_ms: u64) -> ServerMsg {
        let stale_after = self.stale_after;
        let full_interval_ms = self.full_interval_ms;
        let entry = self.clients.entry(client).or_default();

        let stale = entry.broadcasts_since_ack >= stale_after;
        let resync_due = full_interval_ms > 0
            && entry
                .last_full_at
                .is_some_and(|at| now_ms.saturating_sub(at) >= full_interval_ms);
        let baseline = entry
            .acked_tick
            .and_then(|tick| entry.sent_snapshot(tick))
            .filter(|_| !stale && !resync_due)
            .cloned();

        let msg = match baseline {
            Some(baseline) => ServerMsg::StateDelta(Self::diff(&baseline, snapshot)),
            None => {
                entry.last_full_at = Some(now_ms);
                ServerMsg::StateSnapshot(snapshot.to_data())
            }
        };

        entry.broadcasts_since_ack += 1;
        entry.sent.push_back(snapshot.clone());
        while entry.sent.len() > SENT_HISTORY {
            entry.sent.pop_front();
        }
        msg
    }

    /// Changes from `baseline` to `current`
    pub fn diff(baseline: &WorldSnapshot, current: &WorldSnapshot) -> DeltaData {
        let players = current
            .players
            .iter()
            .filter_map(|state| match baseline.player(&state.id) {
                Some(old) => PlayerDelta::diff(old, state),
                None => Some(PlayerDelta::full(state)),
            })
            .collect();
        let removed = baseline
            .players
            .iter()
            .filter(|p| current.player(&p.id).is_none())
            .map(|p| p.id)
            .collect();

        DeltaData {
            tick: current.tick,
            baseline_tick: baseline.tick,
            players,
            removed,
            last_processed_sequence: current.last_processed_sequence.clone(),
            input_ticks: current.input_ticks.clone(),
        }
    }

    pub fn remove_client(&mut self, client: &PlayerId) {
        self.clients.remove(client);
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }
}
