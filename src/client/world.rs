//! Client copy of the authoritative world
//!
//! Full snapshots and deltas are merged into complete states keyed by tick.
//! Recent states are kept so a delta can be applied against whichever
//! baseline the server chose.

use std::collections::{HashMap, VecDeque};
use thiserror::Error;

use crate::ws::protocol::{DeltaData, PlayerId, PlayerState, SnapshotData};

/// Ticks kept as possible delta baselines
pub const WORLD_HISTORY: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeltaError {
    #[error("Unknown baseline tick {0}")]
    UnknownBaseline(u64),

    #[error("Delta introduces player {0} without a full state")]
    IncompletePlayer(PlayerId),
}

/// Complete world state at one tick
#[derive(Debug, Clone, PartialEq)]
pub struct WorldState {
    pub tick: u64,
    /// Server time the state was sent at
    pub timestamp: u64,
    pub players: HashMap<PlayerId, PlayerState>,
    pub last_processed_sequence: HashMap<PlayerId, u32>,
    pub input_ticks: HashMap<PlayerId, u32>,
}

impl WorldState {
    pub fn from_snapshot(data: SnapshotData, timestamp: u64) -> Self {
        Self {
            tick: data.tick,
            timestamp,
            players: data.players.into_iter().map(|p| (p.id, p)).collect(),
            last_processed_sequence: data.last_processed_sequence,
            input_ticks: data.input_ticks,
        }
    }

    /// Merge a delta onto this state
    pub fn apply_delta(&self, delta: &DeltaData, timestamp: u64) -> Result<Self, DeltaError> {
        let mut players = self.players.clone();
        for id in &delta.removed {
            players.remove(id);
        }
        for change in &delta.players {
            match players.get_mut(&change.id) {
                Some(state) => change.apply_to(state),
                None => {
                    let state = change
                        .into_state()
                        .ok_or(DeltaError::IncompletePlayer(change.id))?;
                    players.insert(change.id, state);
                }
            }
        }
        Ok(Self {
            tick: delta.tick,
            timestamp,
            players,
            last_processed_sequence: delta.last_processed_sequence.clone(),
            input_ticks: delta.input_ticks.clone(),
        })
    }

    pub fn player(&self, id: &PlayerId) -> Option<&PlayerState> {
        self.players.get(id)
    }

    /// Input processing report for one player: (sequence, ticks applied)
    pub fn input_report(&self, id: &PlayerId) -> (u32, u32) {
        (
            self.last_processed_sequence.get(id).copied().unwrap_or(0),
            self.input_ticks.get(id).copied().unwrap_or(0),
        )
    }

    /// Every player except `local`, sorted by id
    pub fn others(&self, local: Option<&PlayerId>) -> Vec<PlayerState> {
        let mut players: Vec<PlayerState> = self
            .players
            .values()
            .filter(|p| Some(&p.id) != local)
            .copied()
            .collect();
        players.sort_by_key(|p| p.id);
        players
    }
}

#[derive(Debug, Default)]
pub struct ClientWorld {
    states: VecDeque<WorldState>,
}

impl ClientWorld {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply_snapshot(&mut self, data: SnapshotData, timestamp: u64) -> WorldState {
        self.store(WorldState::from_snapshot(data, timestamp))
    }

    pub fn apply_delta(&mut self, data: &DeltaData, timestamp: u64) -> Result<WorldState, DeltaError> {
        let baseline = self
            .state_at(data.baseline_tick)
            .ok_or(DeltaError::UnknownBaseline(data.baseline_tick))?;
        let state = baseline.apply_delta(data, timestamp)?;
        Ok(self.store(state))
    }

    fn store(&mut self, state: WorldState) -> WorldState {
        let index = self.states.partition_point(|s| s.tick < state.tick);
        if self.states.get(index).is_some_and(|s| s.tick == state.tick) {
            self.states[index] = state.clone();
        } else {
            self.states.insert(index, state.clone());
        }
        while self.states.len() > WORLD_HISTORY {
            self.states.pop_front();
        }
        state
    }

    pub fn state_at(&self, tick: u64) -> Option<&WorldState> {
        self.states.iter().find(|s| s.tick == tick)
    }

    pub fn latest(&self) -> Option<&WorldState> {
        self.states.back()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn clear(&mut self) {
        self.states.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::Vec2;
    use crate::ws::protocol::PlayerDelta;
    use uuid::Uuid;

    fn state(id: PlayerId, x: f32) -> PlayerState {
        PlayerState {
            id,
            position: Vec2::new(x, 100.0),
            velocity: Vec2::ZERO,
            health: 100.0,
            max_health: 100.0,
            rotation: 0.0,
            is_dead: false,
            is_sprinting: false,
            is_rolling: false,
        }
    }

    fn snapshot(tick: u64, players: Vec<PlayerState>) -> SnapshotData {
        SnapshotData {
            tick,
            players,
            last_processed_sequence: HashMap::new(),
            input_ticks: HashMap::new(),
        }
    }

    fn delta(tick: u64, baseline_tick: u64, players: Vec<PlayerDelta>, removed: Vec<PlayerId>) -> DeltaData {
        DeltaData {
            tick,
            baseline_tick,
            players,
            removed,
            last_processed_sequence: HashMap::new(),
            input_ticks: HashMap::new(),
        }
    }

    #[test]
    fn delta_merges_onto_baseline() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        let mut world = ClientWorld::new();
        world.apply_snapshot(snapshot(3, vec![state(a, 0.0), state(b, 50.0)]), 100);

        let moved = PlayerDelta {
            id: a,
            position: Some(Vec2::new(10.0, 100.0)),
            ..Default::default()
        };
        let joined = PlayerDelta::full(&state(c, 75.0));
        let merged = world
            .apply_delta(&delta(6, 3, vec![moved, joined], vec![b]), 150)
            .unwrap();

        assert_eq!(merged.tick, 6);
        assert_eq!(merged.timestamp, 150);
        assert_eq!(merged.players.len(), 2);
        assert_eq!(merged.player(&a).unwrap().position.x, 10.0);
        assert_eq!(merged.player(&a).unwrap().health, 100.0);
        assert_eq!(merged.player(&c), Some(&state(c, 75.0)));
        assert!(merged.player(&b).is_none());
    }

    #[test]
    fn unknown_baseline_is_rejected() {
        let mut world = ClientWorld::new();
        world.apply_snapshot(snapshot(3, vec![]), 0);
        let err = world.apply_delta(&delta(9, 6, vec![], vec![]), 0).unwrap_err();
        assert_eq!(err, DeltaError::UnknownBaseline(6));
        assert_eq!(world.latest().map(|s| s.tick), Some(3));
    }

    #[test]
    fn partial_delta_for_unknown_player_is_rejected() {
        let mut world = ClientWorld::new();
        world.apply_snapshot(snapshot(3, vec![]), 0);
        let stranger = Uuid::new_v4();
        let partial = PlayerDelta {
            id: stranger,
            health: Some(50.0),
            ..Default::default()
        };
        let err = world.apply_delta(&delta(6, 3, vec![partial], vec![]), 0).unwrap_err();
        assert_eq!(err, DeltaError::IncompletePlayer(stranger));
    }

    #[test]
    fn history_is_bounded_and_ordered() {
        let mut world = ClientWorld::new();
        for tick in (1..=(WORLD_HISTORY as u64 + 10)).rev() {
            world.apply_snapshot(snapshot(tick, vec![]), tick);
        }
        assert_eq!(world.len(), WORLD_HISTORY);
        assert_eq!(world.latest().map(|s| s.tick), Some(WORLD_HISTORY as u64 + 10));
        assert!(world.state_at(10).is_none());
        assert!(world.state_at(11).is_some());

        let mut world = ClientWorld::new();
        for tick in 1..=(WORLD_HISTORY as u64 + 10) {
            world.apply_snapshot(snapshot(tick, vec![]), tick);
        }
        assert!(world.state_at(1).is_none());
        assert_eq!(world.latest().map(|s| s.tick), Some(WORLD_HISTORY as u64 + 10));
    }

    #[test]
    fn others_excludes_local_player() {
        let me = Uuid::new_v4();
        let other = Uuid::new_v4();
        let world = WorldState::from_snapshot(snapshot(1, vec![state(me, 0.0), state(other, 1.0)]), 0);
        let others = world.others(Some(&me));
        assert_eq!(others.len(), 1);
        assert_eq!(others[0].id, other);
        assert_eq!(world.input_report(&me), (0, 0));
    }
}
