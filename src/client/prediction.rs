//! Client-side prediction
//!
//! The local player is advanced with the same fixed-step movement formula the
//! server runs, so an input predicts exactly what the server will compute
//! once it arrives. Each sent input keeps a trajectory record (the predicted
//! position after every step it was applied) so an authoritative state can be
//! compared against the matching point of the local history.

use std::collections::VecDeque;
use tracing::debug;

use crate::sim::{Body, Controls, PhysicsSystem, Vec2};
use crate::util::time::{tick_delta, SIMULATION_TPS};

/// Cap on catch-up steps after a long frame
pub const MAX_STEPS_PER_FRAME: u32 = 5;
/// Most unacknowledged trajectory records kept
pub const MAX_RECORDS: usize = 100;

/// Predicted trajectory of one sent input
#[derive(Debug, Clone)]
struct InputRecord {
    sequence: u32,
    controls: Controls,
    /// Leading steps already confirmed and trimmed
    skip: u32,
    /// Position before the first untrimmed step
    start: Vec2,
    /// Position after each untrimmed step
    positions: Vec<Vec2>,
}

impl InputRecord {
    fn steps(&self) -> u32 {
        self.skip + self.positions.len() as u32
    }

    /// Position after `k` applications of this input
    fn position_after(&self, k: u32) -> Option<Vec2> {
        if k < self.skip {
            return None;
        }
        match k - self.skip {
            0 => Some(self.start),
            n => self.positions.get(n as usize - 1).copied(),
        }
    }
}

pub struct PredictionEngine {
    body: Body,
    controls: Controls,
    records: VecDeque<InputRecord>,
    dt: f32,
    step_ms: f64,
    accumulator_ms: f64,
    last_frame_at: Option<u64>,
}

impl PredictionEngine {
    pub fn new(body: Body) -> Self {
        Self::with_tick_rate(body, SIMULATION_TPS)
    }

    pub fn with_tick_rate(body: Body, tick_rate: u32) -> Self {
        Self {
            body,
            controls: Controls::default(),
            records: VecDeque::new(),
            dt: tick_delta(tick_rate),
            step_ms: 1000.0 / tick_rate.max(1) as f64,
            accumulator_ms: 0.0,
            last_frame_at: None,
        }
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn position(&self) -> Vec2 {
        self.body.position
    }

    /// Controls applied on every step until the next input
    pub fn controls(&self) -> Controls {
        self.controls
    }

    pub fn pending_records(&self) -> usize {
        self.records.len()
    }

    /// Start predicting a newly sent input
    pub fn begin_input(&mut self, sequence: u32, controls: Controls) {
        self.controls = controls;
        self.records.push_back(InputRecord {
            sequence,
            controls,
            skip: 0,
            start: self.body.position,
            positions: Vec::new(),
        });
        while self.records.len() > MAX_RECORDS {
            self.records.pop_front();
        }
    }

    /// Advance by the fixed steps that fit in the time since the last frame
    pub fn predict(&mut self, now_ms: u64) -> Body {
        let Some(last) = self.last_frame_at.replace(now_ms) else {
            return self.body;
        };
        self.accumulator_ms += now_ms.saturating_sub(last) as f64;

        let mut steps = 0;
        while self.accumulator_ms >= self.step_ms && steps < MAX_STEPS_PER_FRAME {
            self.step();
            self.accumulator_ms -= self.step_ms;
            steps += 1;
        }
        if self.accumulator_ms >= self.step_ms {
            debug!(backlog_ms = self.accumulator_ms, "Dropping prediction backlog");
            self.accumulator_ms = 0.0;
        }
        self.body
    }

    /// Restart frame timing without stepping, used while the player is dead
    pub fn hold(&mut self, now_ms: u64) {
        self.last_frame_at = Some(now_ms);
        self.accumulator_ms = 0.0;
    }

    /// One fixed step with the current controls
    pub fn step(&mut self) {
        PhysicsSystem::step(&mut self.body, &self.controls, self.dt);
        if let Some(record) = self.records.back_mut() {
            record.positions.push(self.body.position);
        }
    }

    pub fn try_start_roll(&mut self) -> bool {
        PhysicsSystem::try_start_roll(&mut self.body, &self.controls)
    }

    /// Distance between the server position and the local prediction for the
    /// same point of input history
    ///
    /// `None` when there is nothing to compare against (no record for the
    /// sequence, or the point was already confirmed). A point the client has
    /// not reached yet counts as infinitely far.
    pub fn divergence(&self, sequence: u32, input_ticks: u32, server_position: Vec2) -> Option<f32> {
        let record = self.records.iter().find(|r| r.sequence == sequence)?;
        if input_ticks < record.skip {
            return None;
        }
        Some(
            record
                .position_after(input_ticks)
                .map_or(f32::INFINITY, |p| p.distance(server_position)),
        )
    }

    /// Drop history the server has confirmed
    pub fn confirm(&mut self, sequence: u32, input_ticks: u32) {
        while self.records.front().is_some_and(|r| r.sequence < sequence) {
            self.records.pop_front();
        }
        let Some(record) = self.records.front_mut().filter(|r| r.sequence == sequence) else {
            return;
        };
        if input_ticks <= record.skip {
            return;
        }
        let confirmed = (input_ticks - record.skip) as usize;
        if confirmed > record.positions.len() {
            // Server is ahead of the local trajectory
            record.positions.clear();
            record.skip = input_ticks;
            return;
        }
        record.start = record.positions[confirmed - 1];
        record.positions.drain(..confirmed);
        record.skip = input_ticks;
    }

    /// Reset to an authoritative state and replay everything after it
    pub fn rebase(&mut self, server: Body, sequence: u32, input_ticks: u32) {
        self.confirm(sequence, input_ticks);

        let dt = self.dt;
        let mut body = server;
        for record in self.records.iter_mut() {
            record.start = body.position;
            for slot in record.positions.iter_mut() {
                PhysicsSystem::step(&mut body, &record.controls, dt);
                *slot = body.position;
            }
        }
        self.body = body;
    }

    /// Adopt a server state outright and forget all history
    pub fn reset(&mut self, body: Body) {
        self.body = body;
        self.records.clear();
    }

    /// Sequence of the oldest unconfirmed record
    pub fn oldest_sequence(&self) -> Option<u32> {
        self.records.front().map(|r| r.sequence)
    }

    /// Total steps predicted for `sequence`, if it is still recorded
    pub fn steps_for(&self, sequence: u32) -> Option<u32> {
        self.records
            .iter()
            .find(|r| r.sequence == sequence)
            .map(InputRecord::steps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    const STEP_MS: u64 = 17;

    fn right() -> Controls {
        Controls {
            right: true,
            ..Default::default()
        }
    }

    fn server_body(controls: &Controls, steps: u32, from: Vec2) -> Body {
        let mut body = Body::at(from);
        for _ in 0..steps {
            PhysicsSystem::step(&mut body, controls, tick_delta(SIMULATION_TPS));
        }
        body
    }

    #[test]
    fn accumulates_fixed_steps() {
        let mut engine = PredictionEngine::new(Body::at(Vec2::new(100.0, 100.0)));
        engine.begin_input(1, right());
        engine.predict(0);
        engine.predict(51);
        // Three whole 60Hz steps fit in 51ms
        assert_eq!(engine.steps_for(1), Some(3));
        assert_eq!(engine.position(), server_body(&right(), 3, Vec2::new(100.0, 100.0)).position);
    }

    #[test]
    fn long_frames_are_capped() {
        let mut engine = PredictionEngine::new(Body::at(Vec2::new(100.0, 100.0)));
        engine.begin_input(1, right());
        engine.predict(0);
        engine.predict(1_000);
        assert_eq!(engine.steps_for(1), Some(MAX_STEPS_PER_FRAME));
        engine.predict(1_000 + STEP_MS);
        assert_eq!(engine.steps_for(1), Some(MAX_STEPS_PER_FRAME + 1));
    }

    #[test]
    fn matching_server_state_has_no_divergence() {
        let start = Vec2::new(100.0, 100.0);
        let mut engine = PredictionEngine::new(Body::at(start));
        engine.begin_input(1, right());
        for _ in 0..10 {
            engine.step();
        }
        let server = server_body(&right(), 4, start);
        assert_eq!(engine.divergence(1, 4, server.position), Some(0.0));

        engine.confirm(1, 4);
        assert_eq!(engine.steps_for(1), Some(10));
        assert_eq!(engine.divergence(1, 4, server.position), Some(0.0));
        assert_eq!(engine.divergence(1, 3, server.position), None);
    }

    #[test]
    fn unreached_point_is_infinitely_far() {
        let mut engine = PredictionEngine::new(Body::at(Vec2::new(100.0, 100.0)));
        engine.begin_input(1, right());
        engine.step();
        assert_eq!(engine.divergence(1, 5, Vec2::ZERO), Some(f32::INFINITY));
        assert_eq!(engine.divergence(9, 0, Vec2::ZERO), None);
    }

    #[test]
    fn rebase_replays_unconfirmed_inputs() {
        let start = Vec2::new(100.0, 100.0);
        let mut engine = PredictionEngine::new(Body::at(start));
        let down = Controls {
            down: true,
            ..Default::default()
        };
        engine.begin_input(1, right());
        for _ in 0..6 {
            engine.step();
        }
        engine.begin_input(2, down);
        for _ in 0..4 {
            engine.step();
        }

        // Server was knocked 20px up during input 1
        let mut server = server_body(&right(), 3, start);
        server.position.y -= 20.0;
        engine.rebase(server, 1, 3);

        let mut expected = server;
        for _ in 0..3 {
            PhysicsSystem::step(&mut expected, &right(), tick_delta(SIMULATION_TPS));
        }
        let input2_start = expected.position;
        for _ in 0..4 {
            PhysicsSystem::step(&mut expected, &down, tick_delta(SIMULATION_TPS));
        }
        assert_approx_eq!(engine.position().x, expected.position.x, 1e-4);
        assert_approx_eq!(engine.position().y, expected.position.y, 1e-4);

        // Replayed trajectory is the new reference for later acks
        assert_eq!(engine.divergence(2, 0, input2_start), Some(0.0));
        assert_eq!(engine.steps_for(2), Some(4));
    }

    #[test]
    fn confirm_drops_older_records() {
        let mut engine = PredictionEngine::new(Body::at(Vec2::new(100.0, 100.0)));
        engine.begin_input(1, right());
        engine.step();
        engine.begin_input(2, Controls::default());
        engine.step();
        engine.confirm(2, 1);
        assert_eq!(engine.pending_records(), 1);
        assert_eq!(engine.oldest_sequence(), Some(2));
    }

    #[test]
    fn server_ahead_of_trajectory_continues_from_its_point() {
        let start = Vec2::new(100.0, 100.0);
        let mut engine = PredictionEngine::new(Body::at(start));
        engine.begin_input(1, right());
        engine.step();

        let server = server_body(&right(), 3, start);
        engine.rebase(server, 1, 3);
        assert_eq!(engine.position(), server.position);
        engine.step();
        let mut next = server;
        PhysicsSystem::step(&mut next, &right(), tick_delta(SIMULATION_TPS));
        assert_eq!(engine.divergence(1, 4, next.position), Some(0.0));
    }
}
