//! Client-side netcode: prediction, reconciliation, interpolation
//!
//! [`ClientSession`] is transport agnostic. Decoded server envelopes are
//! queued with [`ClientSession::receive`] (which never touches game state)
//! and processed at the start of the next [`ClientSession::frame`], which
//! returns the envelopes to send and what to render.

pub mod clock_sync;
pub mod interpolation;
pub mod prediction;
pub mod reconciliation;
pub mod sequencer;
pub mod world;

use std::collections::VecDeque;
use tracing::{debug, info, warn};

use crate::sim::{Body, Controls};
use crate::util::time::SNAPSHOT_TPS;
use crate::util::SharedClock;
use crate::ws::protocol::{
    decode, AckData, AttackData, ClientEnvelope, ClientMsg, Envelope, PingData, PlayerId,
    PlayerState, ProtocolError, RoomId, ServerEnvelope, ServerMsg,
};

pub use clock_sync::ServerClock;
pub use interpolation::InterpolationEngine;
pub use prediction::PredictionEngine;
pub use reconciliation::{Correction, ReconciliationHandler};
pub use sequencer::InputSequencer;
pub use world::{ClientWorld, DeltaError, WorldState};

/// Everything a frame produced
#[derive(Debug, Default)]
pub struct FrameOutput {
    /// Envelopes to put on the wire, in order
    pub outgoing: Vec<ClientEnvelope>,
    /// Local player as it should be drawn
    pub local: Option<PlayerState>,
    /// Remote players at render time
    pub remotes: Vec<PlayerState>,
    /// Most severe correction applied this frame
    pub correction: Correction,
    /// Gameplay events (damage, deaths, weapon state, ...) for the UI
    pub events: Vec<ServerMsg>,
}

pub struct ClientSession {
    clock: SharedClock,
    player_id: Option<PlayerId>,
    room_id: Option<RoomId>,
    inbound: VecDeque<ServerEnvelope>,
    actions: Vec<ClientMsg>,
    sequencer: InputSequencer,
    prediction: Option<PredictionEngine>,
    reconciliation: ReconciliationHandler,
    interpolation: InterpolationEngine,
    world: ClientWorld,
    server_clock: ServerClock,
    /// Latest authoritative state of the local player
    local_state: Option<PlayerState>,
    latest_tick: Option<u64>,
    awaiting_respawn: bool,
}

impl ClientSession {
    pub fn new(clock: SharedClock) -> Self {
        Self::with_broadcast_rate(clock, SNAPSHOT_TPS)
    }

    pub fn with_broadcast_rate(clock: SharedClock, broadcast_rate: u32) -> Self {
        Self {
            clock,
            player_id: None,
            room_id: None,
            inbound: VecDeque::new(),
            actions: Vec::new(),
            sequencer: InputSequencer::new(),
            prediction: None,
            reconciliation: ReconciliationHandler::new(),
            interpolation: InterpolationEngine::for_broadcast_rate(broadcast_rate),
            world: ClientWorld::new(),
            server_clock: ServerClock::new(),
            local_state: None,
            latest_tick: None,
            awaiting_respawn: false,
        }
    }

    /// Queue a server envelope for the next frame
    pub fn receive(&mut self, envelope: ServerEnvelope) {
        self.inbound.push_back(envelope);
    }

    /// Decode and queue a text frame
    pub fn receive_text(&mut self, text: &str) -> Result<(), ProtocolError> {
        self.receive(decode(text)?);
        Ok(())
    }

    pub fn shoot(&mut self, aim_angle: f32) {
        let attack = self.attack(aim_angle);
        self.actions.push(ClientMsg::Shoot(attack));
    }

    pub fn melee(&mut self, aim_angle: f32) {
        let attack = self.attack(aim_angle);
        self.actions.push(ClientMsg::MeleeAttack(attack));
    }

    pub fn reload(&mut self) {
        self.actions.push(ClientMsg::Reload);
    }

    pub fn dodge_roll(&mut self) {
        self.actions.push(ClientMsg::DodgeRoll);
    }

    /// Attacks carry the estimated server time they were made at
    fn attack(&self, aim_angle: f32) -> AttackData {
        AttackData {
            aim_angle,
            client_timestamp: self.server_now(),
        }
    }

    /// Run one render frame with the current control sample
    pub fn frame(&mut self, sample: &Controls) -> FrameOutput {
        let now = self.clock.now_ms();
        let mut out = FrameOutput::default();

        while let Some(envelope) = self.inbound.pop_front() {
            self.handle(envelope, now, &mut out);
        }

        if self.player_id.is_some() {
            self.drive_local(sample, now, &mut out);
            if self.server_clock.poll_probe(now) {
                out.outgoing
                    .push(self.envelope(ClientMsg::Ping(PingData { sent_at: now }), now));
            }
        }

        out.local = self.render_local(sample, now);
        let render_time = self.interpolation.render_time(self.server_clock.server_now(now));
        out.remotes = self
            .interpolation
            .sample(render_time)
            .into_iter()
            .filter(|p| Some(p.id) != self.player_id)
            .collect();
        out
    }

    /// Sequence input, flush actions and advance prediction
    fn drive_local(&mut self, sample: &Controls, now: u64, out: &mut FrameOutput) {
        let dead = self.local_state.is_some_and(|s| s.is_dead);
        let server_now = self.server_clock.server_now(now);

        if !dead {
            if let Some(input) = self.sequencer.submit(sample, server_now) {
                if let Some(engine) = self.prediction.as_mut() {
                    engine.begin_input(input.sequence, input.controls());
                }
                out.outgoing
                    .push(Envelope::new(ClientMsg::InputState(input), server_now));
            }
        }

        for action in std::mem::take(&mut self.actions) {
            if dead {
                continue;
            }
            if matches!(action, ClientMsg::DodgeRoll) {
                if let Some(engine) = self.prediction.as_mut() {
                    engine.try_start_roll();
                }
            }
            out.outgoing.push(Envelope::new(action, server_now));
        }

        if let Some(engine) = self.prediction.as_mut() {
            if dead {
                engine.hold(now);
            } else {
                engine.predict(now);
            }
        }
    }

    fn handle(&mut self, envelope: ServerEnvelope, now: u64, out: &mut FrameOutput) {
        self.server_clock.observe_server_time(envelope.timestamp, now);
        let timestamp = envelope.timestamp;

        match envelope.msg {
            ServerMsg::RoomJoined(data) => {
                info!(room_id = %data.room_id, player_id = %data.player_id, "Joined room");
                self.player_id = Some(data.player_id);
                self.room_id = Some(data.room_id);
                self.prediction = Some(PredictionEngine::new(Body {
                    position: data.player.position,
                    velocity: data.player.velocity,
                    rotation: data.player.rotation,
                    roll: Default::default(),
                }));
                self.local_state = Some(data.player);
                self.sequencer.resend_next();
                self.world.clear();
                self.interpolation.clear();
                self.latest_tick = None;
            }
            ServerMsg::StateSnapshot(data) => {
                let tick = data.tick;
                let state = self.world.apply_snapshot(data, timestamp);
                out.outgoing
                    .push(self.envelope(ClientMsg::StateAck(AckData { tick }), now));
                self.apply_world_state(&state, now, out);
            }
            ServerMsg::StateDelta(data) => match self.world.apply_delta(&data, timestamp) {
                Ok(state) => {
                    out.outgoing
                        .push(self.envelope(ClientMsg::StateAck(AckData { tick: data.tick }), now));
                    self.apply_world_state(&state, now, out);
                }
                Err(e) => {
                    warn!(tick = data.tick, error = %e, "Delta dropped");
                }
            },
            ServerMsg::PlayerMove(data) => {
                let state = self.world.apply_snapshot(data, timestamp);
                self.apply_world_state(&state, now, out);
            }
            ServerMsg::Ping(ping) => {
                out.outgoing.push(self.envelope(ClientMsg::Pong(ping), now));
            }
            ServerMsg::Pong(pong) => {
                if let Some(rtt) = self.server_clock.on_pong(pong.sent_at, pong.server_time, now) {
                    debug!(rtt, smoothed = self.server_clock.rtt_ms(), "Pong");
                }
            }
            other => out.events.push(other),
        }
    }

    /// Feed a newer world state to interpolation and reconciliation
    fn apply_world_state(&mut self, state: &WorldState, now: u64, out: &mut FrameOutput) {
        if self.latest_tick.is_some_and(|tick| state.tick <= tick) {
            debug!(tick = state.tick, "Stale world state");
            return;
        }
        self.latest_tick = Some(state.tick);
        self.interpolation
            .push(state.timestamp, state.others(self.player_id.as_ref()));

        let Some(id) = self.player_id else {
            return;
        };
        let Some(server) = state.player(&id) else {
            return;
        };
        let (sequence, input_ticks) = state.input_report(&id);
        self.sequencer.clear_history_up_to(sequence);

        if let Some(engine) = self.prediction.as_mut() {
            let correction = self.reconciliation.reconcile(
                engine,
                server,
                sequence,
                input_ticks,
                self.server_clock.rtt_ms(),
                now,
            );
            out.correction = out.correction.max(correction);
        }

        if server.is_dead {
            self.awaiting_respawn = true;
        } else if self.awaiting_respawn {
            self.awaiting_respawn = false;
            self.sequencer.resend_next();
        }
        self.local_state = Some(*server);
    }

    fn render_local(&mut self, sample: &Controls, now: u64) -> Option<PlayerState> {
        let engine = self.prediction.as_ref()?;
        let mut state = self.local_state?;
        let body = engine.body();
        state.position = self.reconciliation.render_position(engine, now);
        state.velocity = body.velocity;
        state.is_rolling = body.is_rolling();
        state.rotation = if sample.aim_angle.is_finite() && !state.is_dead {
            sample.aim_angle
        } else {
            body.rotation
        };
        Some(state)
    }

    fn envelope(&self, msg: ClientMsg, now: u64) -> ClientEnvelope {
        Envelope::new(msg, self.server_clock.server_now(now))
    }

    pub fn player_id(&self) -> Option<PlayerId> {
        self.player_id
    }

    pub fn room_id(&self) -> Option<RoomId> {
        self.room_id
    }

    /// Estimated current server time
    pub fn server_now(&self) -> u64 {
        self.server_clock.server_now(self.clock.now_ms())
    }

    pub fn rtt_ms(&self) -> u64 {
        self.server_clock.rtt_ms()
    }

    pub fn prediction(&self) -> Option<&PredictionEngine> {
        self.prediction.as_ref()
    }

    pub fn reconciliation(&self) -> &ReconciliationHandler {
        &self.reconciliation
    }

    pub fn sequencer(&self) -> &InputSequencer {
        &self.sequencer
    }

    pub fn world(&self) -> &ClientWorld {
        &self.world
    }

    pub fn local_state(&self) -> Option<&PlayerState> {
        self.local_state.as_ref()
    }
}
