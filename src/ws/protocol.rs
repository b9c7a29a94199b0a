//! WebSocket protocol message definitions
//! These are the wire types for client-server communication.
//!
//! Every frame is a JSON object `{ "type": ..., "timestamp": ..., "data": ... }`.
//! `type` selects a variant of [`ClientMsg`] or [`ServerMsg`]; `timestamp` is
//! the sender's clock in Unix milliseconds.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::sim::{Controls, Vec2};

pub type PlayerId = Uuid;
pub type RoomId = Uuid;

/// Envelope wrapping every message on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<M> {
    #[serde(flatten)]
    pub msg: M,
    pub timestamp: u64,
}

impl<M> Envelope<M> {
    pub fn new(msg: M, timestamp: u64) -> Self {
        Self { msg, timestamp }
    }
}

pub type ClientEnvelope = Envelope<ClientMsg>;
pub type ServerEnvelope = Envelope<ServerMsg>;

/// Protocol errors
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

pub fn encode<M: Serialize>(envelope: &Envelope<M>) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(envelope)?)
}

pub fn decode<M: DeserializeOwned>(text: &str) -> Result<Envelope<M>, ProtocolError> {
    Ok(serde_json::from_str(text)?)
}

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ClientMsg {
    /// Control state change, sequenced for reconciliation
    #[serde(rename = "input:state")]
    InputState(InputState),

    #[serde(rename = "player:shoot")]
    Shoot(AttackData),

    #[serde(rename = "player:melee_attack")]
    MeleeAttack(AttackData),

    #[serde(rename = "player:reload")]
    Reload,

    #[serde(rename = "player:dodge_roll")]
    DodgeRoll,

    /// Acknowledge a snapshot or delta so it can become the delta baseline
    #[serde(rename = "state:ack")]
    StateAck(AckData),

    /// Client-initiated RTT probe
    #[serde(rename = "ping")]
    Ping(PingData),

    /// Echo of a server ping
    #[serde(rename = "pong")]
    Pong(PingData),
}

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerMsg {
    #[serde(rename = "room:joined")]
    RoomJoined(RoomJoinedData),

    #[serde(rename = "player:joined")]
    PlayerJoined(PlayerRef),

    #[serde(rename = "player:left")]
    PlayerLeft(PlayerLeftData),

    /// Uncompressed full-state broadcast (delta compression disabled)
    #[serde(rename = "player:move")]
    PlayerMove(SnapshotData),

    #[serde(rename = "state:snapshot")]
    StateSnapshot(SnapshotData),

    #[serde(rename = "state:delta")]
    StateDelta(DeltaData),

    #[serde(rename = "player:damaged")]
    PlayerDamaged(DamageData),

    #[serde(rename = "hit:confirmed")]
    HitConfirmed(HitConfirmedData),

    #[serde(rename = "player:death")]
    PlayerDeath(DeathData),

    #[serde(rename = "player:kill_credit")]
    KillCredit(KillCreditData),

    #[serde(rename = "player:respawn")]
    PlayerRespawn(RespawnData),

    #[serde(rename = "melee:hit")]
    MeleeHit(MeleeHitData),

    #[serde(rename = "weapon:state")]
    WeaponState(WeaponStateData),

    #[serde(rename = "shoot:failed")]
    ShootFailed(ShootFailedData),

    /// Server-initiated RTT probe
    #[serde(rename = "ping")]
    Ping(PingData),

    /// Answer to a client ping
    #[serde(rename = "pong")]
    Pong(PongData),

    #[serde(rename = "error")]
    Error(ErrorData),
}

/// Sequenced control sample
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputState {
    pub sequence: u32,
    pub up: bool,
    pub down: bool,
    pub left: bool,
    pub right: bool,
    /// Aim direction in radians
    pub aim_angle: f32,
    pub is_sprinting: bool,
    /// Client send time in (estimated) server milliseconds
    pub client_timestamp: u64,
}

impl InputState {
    pub fn from_controls(sequence: u32, controls: &Controls, client_timestamp: u64) -> Self {
        Self {
            sequence,
            up: controls.up,
            down: controls.down,
            left: controls.left,
            right: controls.right,
            aim_angle: controls.aim_angle,
            is_sprinting: controls.is_sprinting,
            client_timestamp,
        }
    }

    pub fn controls(&self) -> Controls {
        Controls {
            up: self.up,
            down: self.down,
            left: self.left,
            right: self.right,
            aim_angle: self.aim_angle,
            is_sprinting: self.is_sprinting,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttackData {
    pub aim_angle: f32,
    pub client_timestamp: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckData {
    pub tick: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingData {
    pub sent_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PongData {
    /// Echo of the client's `sentAt`
    pub sent_at: u64,
    pub server_time: u64,
}

/// Authoritative player state
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerState {
    pub id: PlayerId,
    pub position: Vec2,
    pub velocity: Vec2,
    pub health: f32,
    pub max_health: f32,
    pub rotation: f32,
    pub is_dead: bool,
    pub is_sprinting: bool,
    pub is_rolling: bool,
}

/// Full world state at a tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotData {
    pub tick: u64,
    pub players: Vec<PlayerState>,
    pub last_processed_sequence: HashMap<PlayerId, u32>,
    /// Ticks the server has applied each player's latest input
    #[serde(default)]
    pub input_ticks: HashMap<PlayerId, u32>,
}

/// Changes since a client's acknowledged baseline tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaData {
    pub tick: u64,
    pub baseline_tick: u64,
    pub players: Vec<PlayerDelta>,
    #[serde(default)]
    pub removed: Vec<PlayerId>,
    pub last_processed_sequence: HashMap<PlayerId, u32>,
    #[serde(default)]
    pub input_ticks: HashMap<PlayerId, u32>,
}

/// Changed fields of one player; absent fields are unchanged
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerDelta {
    pub id: PlayerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Vec2>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub velocity: Option<Vec2>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_health: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_dead: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_sprinting: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_rolling: Option<bool>,
}

fn changed<T: PartialEq + Copy>(old: T, new: T) -> Option<T> {
    (old != new).then_some(new)
}

impl PlayerDelta {
    /// Every field set, for players the baseline does not know about
    pub fn full(state: &PlayerState) -> Self {
        Self {
            id: state.id,
            position: Some(state.position),
            velocity: Some(state.velocity),
            health: Some(state.health),
            max_health: Some(state.max_health),
            rotation: Some(state.rotation),
            is_dead: Some(state.is_dead),
            is_sprinting: Some(state.is_sprinting),
            is_rolling: Some(state.is_rolling),
        }
    }

    /// Fields of `current` that differ from `baseline`, or `None` if nothing changed
    pub fn diff(baseline: &PlayerState, current: &PlayerState) -> Option<Self> {
        let delta = Self {
            id: current.id,
            position: changed(baseline.position, current.position),
            velocity: changed(baseline.velocity, current.velocity),
            health: changed(baseline.health, current.health),
            max_health: changed(baseline.max_health, current.max_health),
            rotation: changed(baseline.rotation, current.rotation),
            is_dead: changed(baseline.is_dead, current.is_dead),
            is_sprinting: changed(baseline.is_sprinting, current.is_sprinting),
            is_rolling: changed(baseline.is_rolling, current.is_rolling),
        };
        (!delta.is_empty()).then_some(delta)
    }

    pub fn is_empty(&self) -> bool {
        self.position.is_none()
            && self.velocity.is_none()
            && self.health.is_none()
            && self.max_health.is_none()
            && self.rotation.is_none()
            && self.is_dead.is_none()
            && self.is_sprinting.is_none()
            && self.is_rolling.is_none()
    }

    /// Merge the changed fields onto a known state
    pub fn apply_to(&self, state: &mut PlayerState) {
        if let Some(v) = self.position {
            state.position = v;
        }
        if let Some(v) = self.velocity {
            state.velocity = v;
        }
        if let Some(v) = self.health {
            state.health = v;
        }
        if let Some(v) = self.max_health {
            state.max_health = v;
        }
        if let Some(v) = self.rotation {
            state.rotation = v;
        }
        if let Some(v) = self.is_dead {
            state.is_dead = v;
        }
        if let Some(v) = self.is_sprinting {
            state.is_sprinting = v;
        }
        if let Some(v) = self.is_rolling {
            state.is_rolling = v;
        }
    }

    /// Build a state for a newly seen player; requires every field
    pub fn into_state(self) -> Option<PlayerState> {
        Some(PlayerState {
            id: self.id,
            position: self.position?,
            velocity: self.velocity?,
            health: self.health?,
            max_health: self.max_health?,
            rotation: self.rotation?,
            is_dead: self.is_dead?,
            is_sprinting: self.is_sprinting?,
            is_rolling: self.is_rolling?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomJoinedData {
    pub room_id: RoomId,
    pub player_id: PlayerId,
    pub tick: u64,
    pub player: PlayerState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerRef {
    pub player_id: PlayerId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerLeftData {
    pub player_id: PlayerId,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DamageData {
    pub victim_id: PlayerId,
    pub attacker_id: PlayerId,
    pub damage: f32,
    pub new_health: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HitConfirmedData {
    pub victim_id: PlayerId,
    pub damage: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeathData {
    pub victim_id: PlayerId,
    pub attacker_id: PlayerId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KillCreditData {
    pub killer_id: PlayerId,
    pub victim_id: PlayerId,
    pub killer_kills: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RespawnData {
    pub player_id: PlayerId,
    pub position: Vec2,
    pub health: f32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeleeHitData {
    pub attacker_id: PlayerId,
    pub victim_ids: Vec<PlayerId>,
    pub knockback_applied: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeaponStateData {
    pub current_ammo: u32,
    pub max_ammo: u32,
    pub is_reloading: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShootFailedData {
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorData {
    pub code: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_state() -> PlayerState {
        PlayerState {
            id: Uuid::new_v4(),
            position: Vec2::new(100.0, 200.0),
            velocity: Vec2::new(200.0, 0.0),
            health: 100.0,
            max_health: 100.0,
            rotation: 0.5,
            is_dead: false,
            is_sprinting: false,
            is_rolling: false,
        }
    }

    #[test]
    fn input_state_parses_from_wire_shape() {
        let text = json!({
            "type": "input:state",
            "timestamp": 1_700_000_000_123u64,
            "data": {
                "sequence": 7,
                "up": false,
                "down": false,
                "left": false,
                "right": true,
                "aimAngle": 1.5,
                "isSprinting": true,
                "clientTimestamp": 1_700_000_000_100u64
            }
        })
        .to_string();

        let envelope: ClientEnvelope = decode(&text).unwrap();
        assert_eq!(envelope.timestamp, 1_700_000_000_123);
        match envelope.msg {
            ClientMsg::InputState(input) => {
                assert_eq!(input.sequence, 7);
                assert!(input.right && input.is_sprinting);
                assert_eq!(input.client_timestamp, 1_700_000_000_100);
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn unit_messages_parse_without_data() {
        let envelope: ClientEnvelope =
            decode(r#"{"type":"player:reload","timestamp":5}"#).unwrap();
        assert_eq!(envelope.msg, ClientMsg::Reload);
    }

    #[test]
    fn unknown_type_is_rejected() {
        let result: Result<ClientEnvelope, _> =
            decode(r#"{"type":"player:teleport","timestamp":5,"data":{}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn server_message_has_type_timestamp_data() {
        let envelope = Envelope::new(ServerMsg::Ping(PingData { sent_at: 42 }), 99);
        let value: serde_json::Value = serde_json::from_str(&encode(&envelope).unwrap()).unwrap();
        assert_eq!(value["type"], "ping");
        assert_eq!(value["timestamp"], 99);
        assert_eq!(value["data"]["sentAt"], 42);
    }

    #[test]
    fn delta_omits_unchanged_fields() {
        let base = sample_state();
        let mut current = base;
        current.health = 75.0;

        let delta = PlayerDelta::diff(&base, &current).unwrap();
        let value = serde_json::to_value(delta).unwrap();
        assert_eq!(value["health"], 75.0);
        assert!(value.get("position").is_none());
        assert!(PlayerDelta::diff(&base, &base).is_none());
    }

    #[test]
    fn full_delta_rebuilds_state() {
        let state = sample_state();
        assert_eq!(PlayerDelta::full(&state).into_state(), Some(state));

        let partial = PlayerDelta {
            id: state.id,
            health: Some(10.0),
            ..Default::default()
        };
        assert_eq!(partial.into_state(), None);
    }
}
