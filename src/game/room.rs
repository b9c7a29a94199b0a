//! Room state and authoritative tick loop
//!
//! One task owns each room. Connection handlers never touch room state; they
//! push [`RoomCommand`]s into the room's inbox, which the loop drains at the
//! start of every tick.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::RoomConfig;
use crate::net::{ChannelTransport, SharedTransport, TransportError};
use crate::sim::{PhysicsSystem, Vec2, ARENA_HEIGHT, ARENA_WIDTH};
use crate::util::time::{tick_delta, tick_duration, ticks_per_broadcast};
use crate::util::SharedClock;
use crate::ws::protocol::{
    AckData, AttackData, ClientMsg, DamageData, DeathData, ErrorData, HitConfirmedData,
    KillCreditData, MeleeHitData, PingData, PlayerId, PlayerLeftData, PlayerRef, PongData,
    RespawnData, RoomId, RoomJoinedData, ServerEnvelope, ServerMsg, ShootFailedData,
};

use super::combat::{CombatSystem, Target, RESPAWN_DELAY_MS};
use super::history::PositionHistory;
use super::manager::RoomRegistry;
use super::player::ServerPlayer;
use super::snapshot::{DeltaTracker, SnapshotBuilder};
use super::weapon::FireError;

/// Inbox capacity per room
const INBOX_CAPACITY: usize = 256;

/// Keep spawns away from the arena edge
const SPAWN_MARGIN: f32 = 100.0;

/// Room lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomPhase {
    /// Created, nobody has joined yet
    Empty,
    /// Tick loop running with players
    Active,
    /// Last player left; stops at the next tick unless someone joins
    Draining,
    /// Loop exited
    Stopped,
}

/// A request from a connection to its room
#[derive(Clone)]
pub struct RoomCommand {
    pub player_id: PlayerId,
    pub kind: RoomCommandKind,
}

#[derive(Clone)]
pub enum RoomCommandKind {
    Join {
        outbox: SharedTransport<ServerEnvelope>,
    },
    Message(ClientMsg),
    Leave {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JoinError {
    #[error("Room is full")]
    Full,

    #[error("Room is closed")]
    Closed,
}

/// Handle to a running room
#[derive(Clone)]
pub struct RoomHandle {
    pub id: RoomId,
    inbox: mpsc::Sender<RoomCommand>,
    /// Players in the room plus joins still in flight
    occupancy: Arc<AtomicUsize>,
    capacity: usize,
}

impl RoomHandle {
    pub fn occupancy(&self) -> usize {
        self.occupancy.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Claim a slot for an incoming join
    pub fn try_reserve(&self) -> bool {
        self.occupancy
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.capacity).then_some(n + 1)
            })
            .is_ok()
    }

    fn release(&self) {
        let _ = self
            .occupancy
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Reserve a slot and queue the join
    pub fn join(
        &self,
        player_id: PlayerId,
        outbox: SharedTransport<ServerEnvelope>,
    ) -> Result<(), JoinError> {
        if !self.try_reserve() {
            return Err(JoinError::Full);
        }
        self.join_reserved(player_id, outbox)
    }

    /// Queue a join for a slot already claimed with [`try_reserve`](Self::try_reserve)
    pub fn join_reserved(
        &self,
        player_id: PlayerId,
        outbox: SharedTransport<ServerEnvelope>,
    ) -> Result<(), JoinError> {
        let cmd = RoomCommand {
            player_id,
            kind: RoomCommandKind::Join { outbox },
        };
        self.inbox.try_send(cmd).map_err(|_| {
            self.release();
            JoinError::Closed
        })
    }

    /// Transport into this room's inbox, for per-connection decoration
    pub fn inbox_transport(&self) -> ChannelTransport<RoomCommand> {
        ChannelTransport::new(self.inbox.clone())
    }

    pub fn send(&self, player_id: PlayerId, msg: ClientMsg) -> Result<(), TransportError> {
        self.inbox
            .try_send(RoomCommand {
                player_id,
                kind: RoomCommandKind::Message(msg),
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => TransportError::Full,
                mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
            })
    }

    /// Queue a leave, waiting for inbox space
    pub async fn leave(&self, player_id: PlayerId, reason: &str) {
        let cmd = RoomCommand {
            player_id,
            kind: RoomCommandKind::Leave {
                reason: reason.to_string(),
            },
        };
        if self.inbox.send(cmd).await.is_err() {
            debug!(room_id = %self.id, player_id = %player_id, "Room gone before leave");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inbox.is_closed()
    }
}

/// The authoritative game room
pub struct Room {
    id: RoomId,
    config: RoomConfig,
    clock: SharedClock,
    phase: RoomPhase,
    tick: u64,
    dt: f32,
    players: HashMap<PlayerId, ServerPlayer>,
    inbox: mpsc::Receiver<RoomCommand>,
    handle: RoomHandle,
    registry: Option<Arc<RoomRegistry>>,
    snapshots: SnapshotBuilder,
    deltas: DeltaTracker,
    rng: ChaCha8Rng,
    last_ping_at: Option<u64>,
}

impl Room {
    /// Create a new room
    pub fn new(id: RoomId, config: RoomConfig, clock: SharedClock, seed: u64) -> (Self, RoomHandle) {
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
        let handle = RoomHandle {
            id,
            inbox: inbox_tx,
            occupancy: Arc::new(AtomicUsize::new(0)),
            capacity: config.max_players,
        };

        let room = Self {
            id,
            dt: tick_delta(config.tick_rate),
            snapshots: SnapshotBuilder::new(ticks_per_broadcast(
                config.tick_rate,
                config.broadcast_rate,
            )),
            deltas: DeltaTracker::new(config.delta_stale_after, config.full_snapshot_interval_ms),
            config,
            clock,
            phase: RoomPhase::Empty,
            tick: 0,
            players: HashMap::new(),
            inbox: inbox_rx,
            handle: handle.clone(),
            registry: None,
            rng: ChaCha8Rng::seed_from_u64(seed),
            last_ping_at: None,
        };

        (room, handle)
    }

    /// Deregister from `registry` when the room stops
    pub fn with_registry(mut self, registry: Arc<RoomRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn id(&self) -> RoomId {
        self.id
    }

    pub fn phase(&self) -> RoomPhase {
        self.phase
    }

    pub fn current_tick(&self) -> u64 {
        self.tick
    }

    pub fn player(&self, id: &PlayerId) -> Option<&ServerPlayer> {
        self.players.get(id)
    }

    pub fn player_mut(&mut self, id: &PlayerId) -> Option<&mut ServerPlayer> {
        self.players.get_mut(id)
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    /// Run the authoritative tick loop until the room stops
    pub async fn run(mut self) {
        info!(room_id = %self.id, tick_rate = self.config.tick_rate, "Room started");

        let mut tick_interval = interval(tick_duration(self.config.tick_rate));
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tick_interval.tick().await;
            self.run_tick();
            if self.phase == RoomPhase::Stopped {
                break;
            }
        }

        info!(room_id = %self.id, ticks = self.tick, "Room stopped");
    }

    /// Run a single simulation tick
    pub fn run_tick(&mut self) {
        if self.phase == RoomPhase::Stopped {
            return;
        }
        let was_draining = self.phase == RoomPhase::Draining;

        // Drain input queue
        while let Ok(cmd) = self.inbox.try_recv() {
            self.handle_command(cmd);
        }

        if was_draining && self.phase == RoomPhase::Draining && self.try_retire() {
            self.phase = RoomPhase::Stopped;
            return;
        }

        self.tick += 1;
        let now = self.clock.now_ms();

        self.update_movement(now);
        self.update_timers(now);
        self.update_ping(now);

        if self.snapshots.should_send(self.tick) {
            self.broadcast_state(now);
        }
    }

    /// Apply one command from the inbox
    pub fn handle_command(&mut self, cmd: RoomCommand) {
        match cmd.kind {
            RoomCommandKind::Join { outbox } => self.handle_join(cmd.player_id, outbox),
            RoomCommandKind::Message(msg) => self.handle_message(cmd.player_id, msg),
            RoomCommandKind::Leave { reason } => self.remove_player(cmd.player_id, &reason),
        }
    }

    fn try_retire(&self) -> bool {
        if !self.players.is_empty() || self.handle.occupancy() > 0 {
            return false;
        }
        match &self.registry {
            Some(registry) => registry.retire(&self.id),
            None => true,
        }
    }

    /// Handle player join request
    fn handle_join(&mut self, player_id: PlayerId, outbox: SharedTransport<ServerEnvelope>) {
        let now = self.clock.now_ms();

        if self.players.contains_key(&player_id) {
            warn!(room_id = %self.id, player_id = %player_id, "Player already in room");
            self.handle.release();
            return;
        }

        let spawn = self.spawn_point();
        let history =
            PositionHistory::for_window(self.config.history_window_ms, self.config.tick_rate);
        let player = ServerPlayer::new(player_id, spawn, now, history, outbox);
        let state = player.to_state();
        let _ = player.send(
            ServerMsg::RoomJoined(RoomJoinedData {
                room_id: self.id,
                player_id,
                tick: self.tick,
                player: state,
            }),
            now,
        );
        let _ = player.send(ServerMsg::WeaponState(player.pistol.to_wire()), now);

        self.broadcast(ServerMsg::PlayerJoined(PlayerRef { player_id }), now);
        self.players.insert(player_id, player);

        if matches!(self.phase, RoomPhase::Empty | RoomPhase::Draining) {
            self.phase = RoomPhase::Active;
        }

        info!(
            room_id = %self.id,
            player_id = %player_id,
            player_count = self.players.len(),
            "Player joined room"
        );
    }

    /// Remove a player and tear down its per-connection state
    fn remove_player(&mut self, player_id: PlayerId, reason: &str) {
        let Some(player) = self.players.remove(&player_id) else {
            return;
        };
        self.deltas.remove_client(&player_id);
        self.handle.release();

        let now = self.clock.now_ms();
        self.broadcast(
            ServerMsg::PlayerLeft(PlayerLeftData {
                player_id,
                reason: reason.to_string(),
            }),
            now,
        );

        info!(
            room_id = %self.id,
            player_id = %player_id,
            reason,
            kills = player.kills,
            deaths = player.deaths,
            "Player left room"
        );

        if self.players.is_empty() && self.phase == RoomPhase::Active {
            self.phase = RoomPhase::Draining;
        }
    }

    fn handle_message(&mut self, player_id: PlayerId, msg: ClientMsg) {
        let now = self.clock.now_ms();
        match msg {
            ClientMsg::InputState(input) => {
                let Some(player) = self.players.get_mut(&player_id) else {
                    return;
                };
                if !input.aim_angle.is_finite() {
                    warn!(player_id = %player_id, sequence = input.sequence, "Malformed input ignored");
                } else if !player.accept_input(&input) {
                    debug!(
                        player_id = %player_id,
                        sequence = input.sequence,
                        last = player.last_input_seq,
                        "Stale input ignored"
                    );
                }
            }
            ClientMsg::Shoot(attack) => self.handle_shoot(player_id, attack, now),
            ClientMsg::MeleeAttack(attack) => self.handle_melee(player_id, attack, now),
            ClientMsg::Reload => {
                if let Some(player) = self.players.get_mut(&player_id) {
                    if !player.is_dead && player.pistol.start_reload(now) {
                        let _ = player.send(ServerMsg::WeaponState(player.pistol.to_wire()), now);
                    }
                }
            }
            ClientMsg::DodgeRoll => {
                if let Some(player) = self.players.get_mut(&player_id) {
                    let controls = player.held_input;
                    if !player.is_dead && PhysicsSystem::try_start_roll(&mut player.body, &controls) {
                        debug!(player_id = %player_id, "Dodge roll");
                    }
                }
            }
            ClientMsg::StateAck(AckData { tick }) => {
                self.deltas.acknowledge(player_id, tick);
            }
            ClientMsg::Pong(PingData { sent_at }) => {
                if let Some(player) = self.players.get_mut(&player_id) {
                    match player.ping.record_pong(sent_at, now) {
                        Some(rtt) => {
                            debug!(player_id = %player_id, rtt, smoothed = player.ping.rtt_ms(), "Pong");
                        }
                        None => {
                            debug!(player_id = %player_id, sent_at, "Ignoring pong for unknown probe");
                        }
                    }
                }
            }
            ClientMsg::Ping(PingData { sent_at }) => {
                if let Some(player) = self.players.get(&player_id) {
                    let _ = player.send(
                        ServerMsg::Pong(PongData {
                            sent_at,
                            server_time: now,
                        }),
                        now,
                    );
                }
            }
        }
    }

    fn handle_shoot(&mut self, shooter_id: PlayerId, attack: AttackData, now: u64) {
        let window = self.config.history_window_ms;
        let Some(shooter) = self.players.get_mut(&shooter_id) else {
            debug!(player_id = %shooter_id, reason = %FireError::NoPlayer, "Shot rejected");
            return;
        };
        if !attack.aim_angle.is_finite() {
            warn!(player_id = %shooter_id, "Malformed shot ignored");
            return;
        }

        let check = if shooter.is_dead {
            Err(FireError::Dead)
        } else {
            shooter.pistol.check_fire(now)
        };
        if let Err(e) = check {
            let _ = shooter.send(
                ServerMsg::ShootFailed(ShootFailedData {
                    reason: e.to_string(),
                }),
                now,
            );
            if e == FireError::Empty && shooter.pistol.start_reload(now) {
                let _ = shooter.send(ServerMsg::WeaponState(shooter.pistol.to_wire()), now);
            }
            return;
        }

        shooter.pistol.record_shot(now);
        let _ = shooter.send(ServerMsg::WeaponState(shooter.pistol.to_wire()), now);

        let origin = shooter.body.position;
        let stats = shooter.pistol.stats;
        let at = CombatSystem::compensated_time(
            attack.client_timestamp,
            shooter.ping.one_way_latency_ms(),
            now,
            window,
        );

        let targets = self.rewound_targets(shooter_id, at, now);
        if let Some(hit) = CombatSystem::closest_ray_hit(origin, attack.aim_angle, stats.range, targets) {
            debug!(
                shooter = %shooter_id,
                victim = %hit.victim_id,
                rewind_ms = now - at,
                distance = hit.distance,
                "Shot hit"
            );
            self.apply_hit(shooter_id, hit.victim_id, stats.damage, now);
        }
    }

    fn handle_melee(&mut self, attacker_id: PlayerId, attack: AttackData, now: u64) {
        let window = self.config.history_window_ms;
        let Some(attacker) = self.players.get_mut(&attacker_id) else {
            return;
        };
        if !attack.aim_angle.is_finite() {
            warn!(player_id = %attacker_id, "Malformed melee attack ignored");
            return;
        }

        let check = if attacker.is_dead {
            Err(FireError::Dead)
        } else {
            attacker.bat.check_fire(now)
        };
        if let Err(e) = check {
            let _ = attacker.send(
                ServerMsg::ShootFailed(ShootFailedData {
                    reason: e.to_string(),
                }),
                now,
            );
            return;
        }
        attacker.bat.record_shot(now);

        let origin = attacker.body.position;
        let stats = attacker.bat.stats;
        let at = CombatSystem::compensated_time(
            attack.client_timestamp,
            attacker.ping.one_way_latency_ms(),
            now,
            window,
        );

        let targets = self.rewound_targets(attacker_id, at, now);
        let victim_ids = CombatSystem::melee_targets(
            origin,
            attack.aim_angle,
            stats.range,
            stats.arc_degrees,
            targets,
        );

        let mut knockback_applied = false;
        for victim_id in &victim_ids {
            self.apply_hit(attacker_id, *victim_id, stats.damage, now);
            if let Some(victim) = self.players.get_mut(victim_id) {
                if !victim.is_dead && stats.knockback > 0.0 {
                    victim.body.position = CombatSystem::knockback(
                        origin,
                        victim.body.position,
                        attack.aim_angle,
                        stats.knockback,
                    );
                    knockback_applied = true;
                }
            }
        }

        self.broadcast(
            ServerMsg::MeleeHit(MeleeHitData {
                attacker_id,
                victim_ids,
                knockback_applied,
            }),
            now,
        );
    }

    /// Damageable players other than `attacker_id`, rewound to `at`
    fn rewound_targets(&self, attacker_id: PlayerId, at: u64, now: u64) -> Vec<Target> {
        self.players
            .values()
            .filter(|p| p.id != attacker_id && p.can_take_damage(now))
            .map(|p| Target {
                id: p.id,
                position: CombatSystem::rewound_position(&p.history, p.body.position, at),
            })
            .collect()
    }

    fn apply_hit(&mut self, attacker_id: PlayerId, victim_id: PlayerId, damage: f32, now: u64) {
        let Some(victim) = self.players.get_mut(&victim_id) else {
            return;
        };
        let (new_health, killed) = CombatSystem::apply_damage(victim.health, damage);
        victim.health = new_health;
        victim.last_damage_at = Some(now);
        if killed {
            victim.kill(now);
        }

        self.broadcast(
            ServerMsg::PlayerDamaged(DamageData {
                victim_id,
                attacker_id,
                damage,
                new_health,
            }),
            now,
        );

        let killer_kills = match self.players.get_mut(&attacker_id) {
            Some(attacker) => {
                let _ = attacker.send(
                    ServerMsg::HitConfirmed(HitConfirmedData { victim_id, damage }),
                    now,
                );
                if killed {
                    attacker.kills += 1;
                }
                attacker.kills
            }
            None => 0,
        };

        if killed {
            self.broadcast(ServerMsg::PlayerDeath(DeathData { victim_id, attacker_id }), now);
            self.broadcast(
                ServerMsg::KillCredit(KillCreditData {
                    killer_id: attacker_id,
                    victim_id,
                    killer_kills,
                }),
                now,
            );
            info!(room_id = %self.id, killer = %attacker_id, victim = %victim_id, "Player killed");
        }
    }

    /// Step every alive player with its held input and record history
    fn update_movement(&mut self, now: u64) {
        let dt = self.dt;
        for player in self.players.values_mut() {
            if player.is_dead {
                continue;
            }
            let controls = player.held_input;
            PhysicsSystem::step(&mut player.body, &controls, dt);
            player.input_ticks = player.input_ticks.saturating_add(1);
            player.history.record(now, player.body.position);
        }
    }

    /// Reloads, respawns and health regeneration
    fn update_timers(&mut self, now: u64) {
        let dt = self.dt;
        let mut respawns = Vec::new();

        for player in self.players.values_mut() {
            if player.pistol.poll_reload(now) {
                let _ = player.send(ServerMsg::WeaponState(player.pistol.to_wire()), now);
            }
            if player.is_dead {
                if player
                    .died_at
                    .is_some_and(|at| now.saturating_sub(at) >= RESPAWN_DELAY_MS)
                {
                    respawns.push(player.id);
                }
            } else if player.should_regenerate(now) {
                player.health = CombatSystem::regenerate(player.health, player.max_health, dt);
            }
        }

        for player_id in respawns {
            let spawn = self.spawn_point();
            let Some(player) = self.players.get_mut(&player_id) else {
                continue;
            };
            player.respawn(spawn, now);
            let health = player.health;
            let _ = player.send(ServerMsg::WeaponState(player.pistol.to_wire()), now);
            self.broadcast(
                ServerMsg::PlayerRespawn(RespawnData {
                    player_id,
                    position: spawn,
                    health,
                }),
                now,
            );
        }
    }

    /// Send ping probes and drop players that stopped answering
    fn update_ping(&mut self, now: u64) {
        let interval = self.config.ping_interval_ms;
        if interval == 0 {
            return;
        }
        let due = self
            .last_ping_at
            .map_or(true, |at| now.saturating_sub(at) >= interval);
        if !due {
            return;
        }
        self.last_ping_at = Some(now);

        for player in self.players.values_mut() {
            player.ping.begin_probe(now);
            let _ = player.send(ServerMsg::Ping(PingData { sent_at: now }), now);
        }

        let limit = self.config.ping_miss_limit;
        let timed_out: Vec<PlayerId> = self
            .players
            .values()
            .filter(|p| p.ping.is_timed_out(limit))
            .map(|p| p.id)
            .collect();

        for player_id in timed_out {
            warn!(room_id = %self.id, player_id = %player_id, "Player timed out");
            if let Some(player) = self.players.get(&player_id) {
                let _ = player.send(
                    ServerMsg::Error(ErrorData {
                        code: "timeout".to_string(),
                        message: "Missed too many pings".to_string(),
                    }),
                    now,
                );
            }
            self.remove_player(player_id, "timeout");
        }
    }

    /// Build the tick snapshot and send each client its encoding
    fn broadcast_state(&mut self, now: u64) {
        let snapshot = self.snapshots.build(
            self.tick,
            now,
            self.players
                .values()
                .map(|p| (p.to_state(), p.last_input_seq, p.input_ticks)),
        );

        for player in self.players.values() {
            let msg = if self.config.delta_compression {
                self.deltas.encode(player.id, &snapshot, now)
            } else {
                ServerMsg::PlayerMove(snapshot.to_data())
            };
            let _ = player.send(msg, now);
        }
    }

    fn broadcast(&self, msg: ServerMsg, now: u64) {
        for player in self.players.values() {
            let _ = player.send(msg.clone(), now);
        }
    }

    /// Random spawn point inside the arena
    fn spawn_point(&mut self) -> Vec2 {
        Vec2::new(
            self.rng.gen_range(SPAWN_MARGIN..ARENA_WIDTH - SPAWN_MARGIN),
            self.rng.gen_range(SPAWN_MARGIN..ARENA_HEIGHT - SPAWN_MARGIN),
        )
    }
}
