//! Server reconciliation
//!
//! Each authoritative state for the local player is compared with the
//! prediction made for the same point of input history. Small divergence is
//! accepted silently. Anything larger resets the prediction to the server
//! state and replays unacknowledged inputs; the visible jump is then either
//! blended out over a short window or snapped when it is too large to hide.

use tracing::{debug, warn};

use crate::sim::{Body, RollState, Vec2, SPRINT_SPEED};
use crate::ws::protocol::PlayerState;

use super::prediction::PredictionEngine;

/// Divergence (pixels) tolerated without correcting
pub const DIVERGENCE_EPSILON: f32 = 0.5;
/// Visible jump that is always snapped, before latency allowance
pub const SNAP_BASE_DISTANCE: f32 = 64.0;
/// Blend window for visible corrections
pub const CORRECTION_DURATION_MS: u64 = 120;

/// What a reconciliation pass did to the local player
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Correction {
    #[default]
    None,
    /// Replayed; the visible jump is blended out from `offset`
    Blend { offset: Vec2 },
    /// Replayed; the jump was too large and is shown immediately
    Snap { distance: f32 },
    /// Prediction discarded in favor of the server state
    Reset,
}

impl Correction {
    /// Rank used to keep the most severe correction of a frame
    fn severity(&self) -> u8 {
        match self {
            Correction::None => 0,
            Correction::Blend { .. } => 1,
            Correction::Snap { .. } => 2,
            Correction::Reset => 3,
        }
    }

    pub fn max(self, other: Correction) -> Correction {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }
}

/// Visual offset easing toward zero
#[derive(Debug, Clone, Copy)]
struct SmoothCorrection {
    initial_offset: Vec2,
    started_at: u64,
}

impl SmoothCorrection {
    fn offset_at(&self, now_ms: u64) -> Option<Vec2> {
        let elapsed = now_ms.saturating_sub(self.started_at);
        if elapsed >= CORRECTION_DURATION_MS {
            return None;
        }
        let t = elapsed as f32 / CORRECTION_DURATION_MS as f32;
        Some(self.initial_offset * (1.0 - ease_out_cubic(t)))
    }
}

fn ease_out_cubic(t: f32) -> f32 {
    let t = t.clamp(0.0, 1.0);
    1.0 - (1.0 - t).powi(3)
}

/// Server body for the local player, keeping local roll timers the wire does not carry
pub fn authoritative_body(server: &PlayerState, local: &Body) -> Body {
    let roll = if server.is_rolling {
        local.roll
    } else {
        RollState {
            cooldown: local.roll.cooldown,
            ..Default::default()
        }
    };
    Body {
        position: server.position,
        velocity: server.velocity,
        rotation: server.rotation,
        roll,
    }
}

#[derive(Debug, Default)]
pub struct ReconciliationHandler {
    smoothing: Option<SmoothCorrection>,
    last_divergence: Option<f32>,
    corrections: u64,
    snaps: u64,
}

impl ReconciliationHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Jump size beyond which a correction is snapped instead of blended
    ///
    /// Grows with half the RTT at sprint speed, the distance a player can
    /// legitimately cover before the server hears about it.
    pub fn snap_threshold(rtt_ms: u64) -> f32 {
        SNAP_BASE_DISTANCE + SPRINT_SPEED * (rtt_ms as f32 / 2.0) / 1000.0
    }

    /// Compare an authoritative state with the prediction and correct it
    pub fn reconcile(
        &mut self,
        engine: &mut PredictionEngine,
        server: &PlayerState,
        sequence: u32,
        input_ticks: u32,
        rtt_ms: u64,
        now_ms: u64,
    ) -> Correction {
        if server.is_dead {
            engine.reset(authoritative_body(server, engine.body()));
            self.smoothing = None;
            return Correction::Reset;
        }

        let Some(divergence) = engine.divergence(sequence, input_ticks, server.position) else {
            if engine.pending_records() == 0 && engine.position() != server.position {
                // Nothing predicted to protect; follow the server
                engine.reset(authoritative_body(server, engine.body()));
                self.smoothing = None;
                return Correction::Reset;
            }
            return Correction::None;
        };
        self.last_divergence = Some(divergence);

        if divergence <= DIVERGENCE_EPSILON {
            engine.confirm(sequence, input_ticks);
            return Correction::None;
        }

        let shown = self.render_position(engine, now_ms);
        engine.rebase(authoritative_body(server, engine.body()), sequence, input_ticks);
        self.corrections += 1;

        let offset = shown - engine.position();
        let distance = offset.length();
        let threshold = Self::snap_threshold(rtt_ms);
        if distance > threshold {
            self.smoothing = None;
            self.snaps += 1;
            warn!(divergence, distance, threshold, sequence, "Prediction snapped to server state");
            Correction::Snap { distance }
        } else {
            self.smoothing = Some(SmoothCorrection {
                initial_offset: offset,
                started_at: now_ms,
            });
            debug!(divergence, distance, sequence, "Prediction corrected");
            Correction::Blend { offset }
        }
    }

    /// Offset to add to the predicted position when rendering
    pub fn visual_offset(&mut self, now_ms: u64) -> Vec2 {
        match self.smoothing.and_then(|s| s.offset_at(now_ms)) {
            Some(offset) => offset,
            None => {
                self.smoothing = None;
                Vec2::ZERO
            }
        }
    }

    pub fn render_position(&mut self, engine: &PredictionEngine, now_ms: u64) -> Vec2 {
        engine.position() + self.visual_offset(now_ms)
    }

    pub fn is_blending(&self) -> bool {
        self.smoothing.is_some()
    }

    /// Divergence measured by the latest comparison
    pub fn last_divergence(&self) -> Option<f32> {
        self.last_divergence
    }

    pub fn correction_count(&self) -> u64 {
        self.corrections
    }

    pub fn snap_count(&self) -> u64 {
        self.snaps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{Controls, PhysicsSystem};
    use crate::util::time::{tick_delta, SIMULATION_TPS};
    use assert_approx_eq::assert_approx_eq;
    use uuid::Uuid;

    fn right() -> Controls {
        Controls {
            right: true,
            ..Default::default()
        }
    }

    fn state_of(body: &Body) -> PlayerState {
        PlayerState {
            id: Uuid::nil(),
            position: body.position,
            velocity: body.velocity,
            health: 100.0,
            max_health: 100.0,
            rotation: body.rotation,
            is_dead: false,
            is_sprinting: false,
            is_rolling: false,
        }
    }

    fn moving_engine(steps: u32) -> (PredictionEngine, Body) {
        let start = Body::at(Vec2::new(500.0, 500.0));
        let mut engine = PredictionEngine::new(start);
        engine.begin_input(1, right());
        for _ in 0..steps {
            engine.step();
        }
        (engine, start)
    }

    fn server_after(start: Body, steps: u32) -> Body {
        let mut body = start;
        for _ in 0..steps {
            PhysicsSystem::step(&mut body, &right(), tick_delta(SIMULATION_TPS));
        }
        body
    }

    #[test]
    fn snap_threshold_scales_with_rtt() {
        assert_approx_eq!(ReconciliationHandler::snap_threshold(0), 64.0);
        assert_approx_eq!(ReconciliationHandler::snap_threshold(200), 94.0);
    }

    #[test]
    fn agreement_only_confirms() {
        let (mut engine, start) = moving_engine(10);
        let before = engine.position();
        let mut handler = ReconciliationHandler::new();

        let server = server_after(start, 4);
        let correction = handler.reconcile(&mut engine, &state_of(&server), 1, 4, 100, 0);

        assert_eq!(correction, Correction::None);
        assert_eq!(engine.position(), before);
        assert_eq!(handler.last_divergence(), Some(0.0));
        assert_eq!(handler.correction_count(), 0);
    }

    #[test]
    fn small_divergence_blends_out() {
        let (mut engine, start) = moving_engine(10);
        let shown_before = engine.position();
        let mut handler = ReconciliationHandler::new();

        let mut server = server_after(start, 4);
        server.position.y += 10.0;
        let correction = handler.reconcile(&mut engine, &state_of(&server), 1, 4, 100, 1_000);

        let Correction::Blend { offset } = correction else {
            panic!("expected blend, got {:?}", correction);
        };
        assert_approx_eq!(offset.y, -10.0, 1e-3);
        // Nothing visibly moves on the correction frame
        let shown = handler.render_position(&engine, 1_000);
        assert_approx_eq!(shown.x, shown_before.x, 1e-3);
        assert_approx_eq!(shown.y, shown_before.y, 1e-3);

        let halfway = handler.visual_offset(1_060);
        assert!(halfway.length() < 10.0 && halfway.length() > 0.0);
        assert_eq!(handler.visual_offset(1_120), Vec2::ZERO);
        assert!(!handler.is_blending());
    }

    #[test]
    fn large_divergence_snaps() {
        let (mut engine, start) = moving_engine(10);
        let mut handler = ReconciliationHandler::new();

        let mut server = server_after(start, 4);
        server.position.x += 200.0;
        let correction = handler.reconcile(&mut engine, &state_of(&server), 1, 4, 100, 0);

        assert!(matches!(correction, Correction::Snap { .. }));
        assert_eq!(handler.visual_offset(0), Vec2::ZERO);
        assert_eq!(handler.snap_count(), 1);
    }

    #[test]
    fn dead_player_is_reset() {
        let (mut engine, _) = moving_engine(10);
        let mut handler = ReconciliationHandler::new();
        let mut server = state_of(&Body::at(Vec2::new(100.0, 100.0)));
        server.is_dead = true;

        let correction = handler.reconcile(&mut engine, &server, 1, 4, 100, 0);
        assert_eq!(correction, Correction::Reset);
        assert_eq!(engine.position(), Vec2::new(100.0, 100.0));
        assert_eq!(engine.pending_records(), 0);
    }

    #[test]
    fn idle_client_follows_server() {
        let mut engine = PredictionEngine::new(Body::at(Vec2::new(500.0, 500.0)));
        let mut handler = ReconciliationHandler::new();
        let pushed = state_of(&Body::at(Vec2::new(540.0, 500.0)));

        let correction = handler.reconcile(&mut engine, &pushed, 0, 30, 50, 0);
        assert_eq!(correction, Correction::Reset);
        assert_eq!(engine.position(), pushed.position);
    }

    #[test]
    fn most_severe_correction_wins() {
        let blend = Correction::Blend { offset: Vec2::ZERO };
        assert_eq!(Correction::None.max(blend), blend);
        assert_eq!(Correction::Reset.max(blend), Correction::Reset);
    }
}
