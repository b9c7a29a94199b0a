//! Authoritative player state owned by a room

use tracing::debug;

use crate::net::{PingTracker, SharedTransport, TransportError};
use crate::sim::{Body, Controls, Vec2, PLAYER_MAX_HEALTH};
use crate::ws::protocol::{
    InputState, PlayerId, PlayerState, ServerEnvelope, ServerMsg,
};

use super::combat::{SPAWN_INVULNERABILITY_MS, REGEN_DELAY_MS};
use super::history::PositionHistory;
use super::weapon::{WeaponKind, WeaponState};

/// Player state in a room (authoritative)
pub struct ServerPlayer {
    pub id: PlayerId,

    // Movement
    pub body: Body,
    /// Most recently accepted input, applied every tick until replaced
    pub held_input: Controls,
    pub last_input_seq: u32,
    /// Ticks `held_input` has been applied since it was accepted
    pub input_ticks: u32,

    // Combat
    pub health: f32,
    pub max_health: f32,
    pub is_dead: bool,
    pub died_at: Option<u64>,
    pub invulnerable_until: u64,
    pub last_damage_at: Option<u64>,
    pub kills: u32,
    pub deaths: u32,
    pub pistol: WeaponState,
    pub bat: WeaponState,

    // Networking
    pub ping: PingTracker,
    pub history: PositionHistory,
    outbox: SharedTransport<ServerEnvelope>,
}

impl ServerPlayer {
    pub fn new(
        id: PlayerId,
        spawn: Vec2,
        now_ms: u64,
        history: PositionHistory,
        outbox: SharedTransport<ServerEnvelope>,
    ) -> Self {
        Self {
            id,
            body: Body::at(spawn),
            held_input: Controls::default(),
            last_input_seq: 0,
            input_ticks: 0,
            health: PLAYER_MAX_HEALTH,
            max_health: PLAYER_MAX_HEALTH,
            is_dead: false,
            died_at: None,
            invulnerable_until: now_ms + SPAWN_INVULNERABILITY_MS,
            last_damage_at: None,
            kills: 0,
            deaths: 0,
            pistol: WeaponState::new(WeaponKind::Pistol),
            bat: WeaponState::new(WeaponKind::Bat),
            ping: PingTracker::new(),
            history,
            outbox,
        }
    }

    /// Accept a newer input; stale or non-finite inputs are rejected
    pub fn accept_input(&mut self, input: &InputState) -> bool {
        if input.sequence <= self.last_input_seq || !input.aim_angle.is_finite() {
            return false;
        }
        self.last_input_seq = input.sequence;
        self.held_input = input.controls();
        self.input_ticks = 0;
        true
    }

    pub fn is_invulnerable(&self, now_ms: u64) -> bool {
        now_ms < self.invulnerable_until || self.body.has_roll_iframes()
    }

    /// Damage is ignored while dead or invulnerable
    pub fn can_take_damage(&self, now_ms: u64) -> bool {
        !self.is_dead && !self.is_invulnerable(now_ms)
    }

    pub fn should_regenerate(&self, now_ms: u64) -> bool {
        !self.is_dead
            && self.health < self.max_health
            && self
                .last_damage_at
                .map_or(true, |at| now_ms.saturating_sub(at) >= REGEN_DELAY_MS)
    }

    pub fn kill(&mut self, now_ms: u64) {
        self.is_dead = true;
        self.died_at = Some(now_ms);
        self.deaths += 1;
        self.body.velocity = Vec2::ZERO;
        self.body.roll = Default::default();
        // Movement resumes only once the client sends a fresh input
        self.held_input = Controls {
            aim_angle: self.held_input.aim_angle,
            ..Default::default()
        };
    }

    /// Bring the player back at `spawn` with full health and a fresh pistol
    pub fn respawn(&mut self, spawn: Vec2, now_ms: u64) {
        let rotation = self.body.rotation;
        self.body = Body::at(spawn);
        self.body.rotation = rotation;
        self.health = self.max_health;
        self.is_dead = false;
        self.died_at = None;
        self.last_damage_at = None;
        self.invulnerable_until = now_ms + SPAWN_INVULNERABILITY_MS;
        self.pistol = WeaponState::new(WeaponKind::Pistol);
        self.history.clear();
    }

    pub fn to_state(&self) -> PlayerState {
        PlayerState {
            id: self.id,
            position: self.body.position,
            velocity: self.body.velocity,
            health: self.health,
            max_health: self.max_health,
            rotation: self.body.rotation,
            is_dead: self.is_dead,
            is_sprinting: self.held_input.is_sprinting && !self.is_dead,
            is_rolling: self.body.is_rolling(),
        }
    }

    /// Queue a message for this player's connection
    pub fn send(&self, msg: ServerMsg, now_ms: u64) -> Result<(), TransportError> {
        let result = self.outbox.send(ServerEnvelope::new(msg, now_ms));
        if let Err(e) = &result {
            debug!(player_id = %self.id, error = %e, "Outbound message dropped");
        }
        result
    }
}
