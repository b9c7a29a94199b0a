//! Snapshot interpolation for remote players
//!
//! Remote players are drawn slightly in the past, between two buffered server
//! states, so they move smoothly regardless of when broadcasts arrive.

use std::collections::VecDeque;

use crate::sim::{lerp_angle, PhysicsSystem};
use crate::ws::protocol::{PlayerId, PlayerState};

/// Server states kept for interpolation
pub const BUFFER_CAPACITY: usize = 32;
/// Extra delay on top of the broadcast interval to absorb jitter
pub const JITTER_MARGIN_MS: u64 = 50;
/// Furthest past the newest state a remote player is extrapolated
pub const MAX_EXTRAPOLATION_MS: u64 = 50;

/// Remote player states at one server timestamp
#[derive(Debug, Clone, PartialEq)]
pub struct TimedState {
    pub timestamp: u64,
    pub players: Vec<PlayerState>,
}

impl TimedState {
    fn player(&self, id: &PlayerId) -> Option<&PlayerState> {
        self.players.iter().find(|p| p.id == *id)
    }
}

pub struct InterpolationEngine {
    buffer: VecDeque<TimedState>,
    delay_ms: u64,
}

impl InterpolationEngine {
    pub fn new(delay_ms: u64) -> Self {
        Self {
            buffer: VecDeque::with_capacity(BUFFER_CAPACITY),
            delay_ms,
        }
    }

    /// Delay of one broadcast interval plus the jitter margin
    pub fn for_broadcast_rate(broadcast_rate: u32) -> Self {
        Self::new(1000 / broadcast_rate.max(1) as u64 + JITTER_MARGIN_MS)
    }

    pub fn delay_ms(&self) -> u64 {
        self.delay_ms
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Buffer a server state, keeping timestamp order
    ///
    /// A state carrying an already buffered timestamp is ignored.
    pub fn push(&mut self, timestamp: u64, players: Vec<PlayerState>) {
        let index = self.buffer.partition_point(|s| s.timestamp < timestamp);
        if self
            .buffer
            .get(index)
            .is_some_and(|s| s.timestamp == timestamp)
        {
            return;
        }
        self.buffer.insert(index, TimedState { timestamp, players });
        while self.buffer.len() > BUFFER_CAPACITY {
            self.buffer.pop_front();
        }
    }

    /// Point in server time that remote players are drawn at
    pub fn render_time(&self, server_now_ms: u64) -> u64 {
        server_now_ms.saturating_sub(self.delay_ms)
    }

    /// Interpolated states of every remote player at `render_time`
    pub fn sample(&self, render_time: u64) -> Vec<PlayerState> {
        let Some(newest) = self.buffer.back() else {
            return Vec::new();
        };
        let oldest = &self.buffer[0];

        if render_time <= oldest.timestamp {
            return oldest.players.clone();
        }
        if render_time >= newest.timestamp {
            return newest
                .players
                .iter()
                .map(|p| extrapolate(p, render_time - newest.timestamp))
                .collect();
        }

        let after = self.buffer.partition_point(|s| s.timestamp <= render_time);
        let (from, to) = (&self.buffer[after - 1], &self.buffer[after]);
        let t = (render_time - from.timestamp) as f32 / (to.timestamp - from.timestamp) as f32;

        let mut players: Vec<PlayerState> = to
            .players
            .iter()
            .map(|b| match from.player(&b.id) {
                Some(a) => interpolate(a, b, t),
                None => *b,
            })
            .collect();
        // Players that left between the two states are shown until the later one
        players.extend(
            from.players
                .iter()
                .filter(|a| to.player(&a.id).is_none())
                .copied(),
        );
        players
    }

    pub fn sample_player(&self, id: &PlayerId, render_time: u64) -> Option<PlayerState> {
        self.sample(render_time).into_iter().find(|p| p.id == *id)
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

fn interpolate(a: &PlayerState, b: &PlayerState, t: f32) -> PlayerState {
    if a.is_dead != b.is_dead {
        // Death and respawn are discrete; never slide across a teleport
        return if t < 0.5 { *a } else { *b };
    }
    PlayerState {
        position: a.position.lerp(b.position, t),
        velocity: a.velocity.lerp(b.velocity, t),
        rotation: lerp_angle(a.rotation, b.rotation, t),
        ..*b
    }
}

fn extrapolate(state: &PlayerState, ahead_ms: u64) -> PlayerState {
    if state.is_dead {
        return *state;
    }
    let ahead = ahead_ms.min(MAX_EXTRAPOLATION_MS) as f32 / 1000.0;
    PlayerState {
        position: PhysicsSystem::clamp_to_arena(state.position + state.velocity * ahead),
        ..*state
    }
}
