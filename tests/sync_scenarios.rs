//! End-to-end synchronization scenarios driven by a manual clock
//!
//! A room and a client session run in lockstep over an in-memory link with a
//! fixed one-way delay, so every scenario is deterministic.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use assert_approx_eq::assert_approx_eq;
use tokio::sync::mpsc;
use uuid::Uuid;

use arena_sync::client::{ClientSession, ClientWorld, Correction, InterpolationEngine, WorldState};
use arena_sync::config::RoomConfig;
use arena_sync::game::{DeltaTracker, Room, RoomHandle, SnapshotBuilder};
use arena_sync::net::ChannelTransport;
use arena_sync::sim::{Controls, Vec2, MOVEMENT_SPEED};
use arena_sync::util::{Clock, ManualClock};
use arena_sync::ws::protocol::{
    decode, encode, AttackData, ClientMsg, Envelope, InputState, PlayerId, PlayerState,
    ServerEnvelope, ServerMsg,
};

const START: Vec2 = Vec2::new(600.0, 500.0);
const EPSILON: f32 = 0.5;

/// Messages released a fixed delay after they were sent
struct DelayLine<M> {
    delay_ms: u64,
    queue: VecDeque<(u64, M)>,
}

impl<M> DelayLine<M> {
    fn new(delay_ms: u64) -> Self {
        Self {
            delay_ms,
            queue: VecDeque::new(),
        }
    }

    fn push(&mut self, now: u64, msg: M) {
        self.queue.push_back((now + self.delay_ms, msg));
    }

    fn due(&mut self, now: u64) -> Vec<M> {
        let mut out = Vec::new();
        while self.queue.front().is_some_and(|(at, _)| *at <= now) {
            if let Some((_, msg)) = self.queue.pop_front() {
                out.push(msg);
            }
        }
        out
    }
}

/// One room and one client joined over a delayed link
struct Harness {
    clock: ManualClock,
    room: Room,
    handle: RoomHandle,
    server_rx: mpsc::Receiver<ServerEnvelope>,
    session: ClientSession,
    id: PlayerId,
    to_server: DelayLine<ClientMsg>,
    to_client: DelayLine<ServerEnvelope>,
    dropped_inputs: HashSet<u32>,
    iteration: u64,
    corrections: Vec<Correction>,
    last_local: Option<PlayerState>,
    last_remotes: Vec<PlayerState>,
}

impl Harness {
    fn new(one_way_ms: u64) -> Self {
        let clock = ManualClock::starting_at_ms(1_000_000);
        let (mut room, handle) = Room::new(Uuid::new_v4(), RoomConfig::default(), clock.shared(), 11);
        let (tx, mut server_rx) = mpsc::channel::<ServerEnvelope>(4096);
        let id = Uuid::new_v4();
        handle.join(id, Arc::new(ChannelTransport::new(tx))).unwrap();
        room.run_tick();

        // Start from a known spot away from the walls
        {
            let player = room.player_mut(&id).unwrap();
            player.body.position = START;
            player.history.clear();
        }

        let mut session = ClientSession::new(clock.shared());
        while let Ok(mut env) = server_rx.try_recv() {
            if let ServerMsg::RoomJoined(data) = &mut env.msg {
                data.player.position = START;
            }
            session.receive(env);
        }

        Self {
            clock,
            room,
            handle,
            server_rx,
            session,
            id,
            to_server: DelayLine::new(one_way_ms),
            to_client: DelayLine::new(one_way_ms),
            dropped_inputs: HashSet::new(),
            iteration: 0,
            corrections: Vec::new(),
            last_local: None,
            last_remotes: Vec::new(),
        }
    }

    /// Advance one server tick and one client frame (60 Hz on average)
    fn step(&mut self, controls: &Controls) {
        let before = self.iteration * 50 / 3;
        self.iteration += 1;
        let after = self.iteration * 50 / 3;
        self.clock.advance_ms(after - before);
        let now = self.clock.now_ms();

        for msg in self.to_server.due(now) {
            self.handle.send(self.id, msg).unwrap();
        }
        self.room.run_tick();
        while let Ok(env) = self.server_rx.try_recv() {
            self.to_client.push(now, env);
        }

        for env in self.to_client.due(now) {
            self.session.receive(env);
        }
        let out = self.session.frame(controls);
        for env in out.outgoing {
            if let ClientMsg::InputState(input) = &env.msg {
                if self.dropped_inputs.contains(&input.sequence) {
                    continue;
                }
            }
            self.to_server.push(now, env.msg);
        }
        self.corrections.push(out.correction);
        self.last_local = out.local;
        self.last_remotes = out.remotes;
    }

    fn run(&mut self, controls: &Controls, frames: usize) {
        for _ in 0..frames {
            self.step(controls);
        }
    }

    fn server_position(&self) -> Vec2 {
        self.room.player(&self.id).unwrap().body.position
    }

    fn predicted_position(&self) -> Vec2 {
        self.session.prediction().unwrap().position()
    }
}

fn moving(right: bool, down: bool, left: bool) -> Controls {
    Controls {
        right,
        down,
        left,
        ..Default::default()
    }
}

#[test]
fn prediction_leads_server_by_one_way_latency() {
    let mut h = Harness::new(100);
    let idle = Controls::default();
    h.run(&idle, 18);
    assert_eq!(h.predicted_position(), START);

    h.run(&moving(true, false, false), 30);

    // ~100 ms of walking the server has not simulated yet
    let lead = h.predicted_position().x - h.server_position().x;
    let expected = MOVEMENT_SPEED * 0.1;
    assert!((lead - expected).abs() <= 5.0, "lead {lead}");

    assert!(!h
        .corrections
        .iter()
        .any(|c| matches!(c, Correction::Snap { .. })));
    assert_eq!(h.session.reconciliation().snap_count(), 0);
    let divergence = h.session.reconciliation().last_divergence().unwrap();
    assert!(divergence < EPSILON, "divergence {divergence}");
}

#[test]
fn lost_inputs_converge_after_reconciliation() {
    let mut h = Harness::new(50);
    h.run(&Controls::default(), 10);

    // Sequence 1 is the idle input; the "down" input is lost on the way
    h.dropped_inputs.insert(3);
    h.run(&moving(true, false, false), 12);
    h.run(&moving(false, true, false), 12);
    h.run(&moving(false, false, true), 18);
    h.run(&Controls::default(), 60);

    assert!(h.session.reconciliation().correction_count() >= 1);
    assert!(h
        .corrections
        .iter()
        .any(|c| matches!(c, Correction::Blend { .. } | Correction::Snap { .. })));

    let server = h.server_position();
    assert!(h.predicted_position().distance(server) < EPSILON);
    let rendered = h.last_local.unwrap().position;
    assert!(rendered.distance(server) < EPSILON, "rendered {rendered:?} server {server:?}");
    assert!(!h.session.reconciliation().is_blending());
}

#[test]
fn remote_players_are_interpolated_from_snapshots() {
    let mut h = Harness::new(40);
    let (tx, _other_rx) = mpsc::channel::<ServerEnvelope>(4096);
    let other = Uuid::new_v4();
    h.handle
        .join(other, Arc::new(ChannelTransport::new(tx)))
        .unwrap();
    h.run(&Controls::default(), 1);
    {
        let player = h.room.player_mut(&other).unwrap();
        player.body.position = Vec2::new(300.0, 300.0);
        player.history.clear();
    }
    h.handle
        .send(
            other,
            ClientMsg::InputState(InputState {
                sequence: 1,
                right: true,
                ..Default::default()
            }),
        )
        .unwrap();

    let mut xs = Vec::new();
    for _ in 0..90 {
        h.step(&Controls::default());
        if let Some(remote) = h.last_remotes.iter().find(|p| p.id == other) {
            xs.push(remote.position.x);
        }
    }

    assert!(xs.len() > 30);
    assert!(xs.windows(2).all(|w| w[1] >= w[0] - 1e-3), "{xs:?}");
    // Rendered behind the authority by the interpolation delay
    assert!(*xs.last().unwrap() < h.room.player(&other).unwrap().body.position.x);
}

#[test]
fn shots_are_resolved_against_rewound_positions() {
    let clock = ManualClock::starting_at_ms(1_000_000);
    let (mut room, handle) = Room::new(Uuid::new_v4(), RoomConfig::default(), clock.shared(), 5);
    let join = |room: &mut Room| {
        let (tx, rx) = mpsc::channel::<ServerEnvelope>(4096);
        let id = Uuid::new_v4();
        handle.join(id, Arc::new(ChannelTransport::new(tx))).unwrap();
        room.run_tick();
        (id, rx)
    };
    let (shooter, _shooter_rx) = join(&mut room);
    let (bystander, _bystander_rx) = join(&mut room);
    let (victim, _victim_rx) = join(&mut room);

    // Past spawn protection
    clock.advance_ms(2_500);
    for (id, at) in [
        (victim, Vec2::new(900.0, 300.0)),
        (shooter, Vec2::new(700.0, 600.0)),
        (bystander, Vec2::new(1_100.0, 600.0)),
    ] {
        let player = room.player_mut(&id).unwrap();
        player.body.position = at;
        player.history.clear();
    }

    handle
        .send(
            victim,
            ClientMsg::InputState(InputState {
                sequence: 1,
                down: true,
                ..Default::default()
            }),
        )
        .unwrap();
    for i in 0..60u64 {
        clock.advance_ms((i + 1) * 50 / 3 - i * 50 / 3);
        room.run_tick();
    }

    let now = clock.now_ms();
    let v = room.player(&victim).unwrap();
    assert_approx_eq!(v.body.velocity.y, MOVEMENT_SPEED, 1e-3);
    let current = v.body.position;
    let past = v.history.position_at(now - 150).unwrap();
    assert!(current.y - past.y > 25.0);

    // Put the shooters on the victim's old row
    for id in [shooter, bystander] {
        let player = room.player_mut(&id).unwrap();
        player.body.position.y = past.y + if id == shooter { 100.0 } else { 0.0 };
        player.history.clear();
    }
    let shooter_pos = room.player(&shooter).unwrap().body.position;
    let aim = (past.y - shooter_pos.y).atan2(past.x - shooter_pos.x);

    // Seen 150 ms ago on the shooter's screen: hit
    handle
        .send(
            shooter,
            ClientMsg::Shoot(AttackData {
                aim_angle: aim,
                client_timestamp: now - 150,
            }),
        )
        .unwrap();
    // Same old position claimed as current: the victim has moved on
    handle
        .send(
            bystander,
            ClientMsg::Shoot(AttackData {
                aim_angle: std::f32::consts::PI,
                client_timestamp: now,
            }),
        )
        .unwrap();
    room.run_tick();

    assert_eq!(room.player(&victim).unwrap().health, 75.0);
    assert_eq!(room.player(&shooter).unwrap().health, 100.0);
}

fn player(id: PlayerId, x: f32, y: f32, health: f32) -> PlayerState {
    PlayerState {
        id,
        position: Vec2::new(x, y),
        velocity: Vec2::ZERO,
        health,
        max_health: 100.0,
        rotation: 0.0,
        is_dead: false,
        is_sprinting: false,
        is_rolling: false,
    }
}

#[test]
fn delta_against_acked_baseline_rebuilds_full_state() {
    let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    let builder = SnapshotBuilder::new(3);
    let first = builder.build(
        3,
        1_000,
        [
            (player(a, 100.0, 100.0, 100.0), 1, 3),
            (player(b, 200.0, 200.0, 100.0), 4, 1),
        ],
    );
    let second = builder.build(
        6,
        1_050,
        [
            (player(a, 110.0, 100.0, 75.0), 2, 1),
            (player(c, 500.0, 500.0, 100.0), 1, 1),
        ],
    );

    let mut tracker = DeltaTracker::new(10, 0);
    let mut world = ClientWorld::new();

    let ServerMsg::StateSnapshot(full) = tracker.encode(a, &first, 1_000) else {
        panic!("first broadcast must be a full snapshot");
    };
    world.apply_snapshot(full, 1_000);
    assert!(tracker.acknowledge(a, 3));

    // Through the wire format
    let msg = tracker.encode(a, &second, 1_050);
    let text = encode(&Envelope::new(msg, 1_050)).unwrap();
    let ServerMsg::StateDelta(delta) = decode::<ServerMsg>(&text).unwrap().msg else {
        panic!("acked baseline must yield a delta");
    };
    assert_eq!(delta.baseline_tick, 3);
    assert_eq!(delta.removed, vec![b]);

    let expected = WorldState::from_snapshot(second.to_data(), 1_050);
    assert_eq!(world.apply_delta(&delta, 1_050).unwrap(), expected);
    // Re-applying the same delta is harmless
    assert_eq!(world.apply_delta(&delta, 1_050).unwrap(), expected);
}

#[test]
fn interpolation_never_moves_backwards() {
    let id = Uuid::new_v4();
    let mut engine = InterpolationEngine::new(100);
    // Arrival order scrambled by jitter
    for i in [3u64, 0, 1, 5, 4, 2, 7, 6, 9, 8] {
        engine.push(1_000 + i * 50, vec![player(id, 100.0 + i as f32 * 10.0, 200.0, 100.0)]);
    }

    let mut last = f32::MIN;
    for t in (900..1_500).step_by(7) {
        let x = engine.sample_player(&id, t).unwrap().position.x;
        assert!(x >= last - 1e-3, "x went from {last} to {x} at {t}");
        assert!((100.0..=190.0 + MOVEMENT_SPEED * 0.05 + 1e-3).contains(&x));
        last = x;
    }
}
