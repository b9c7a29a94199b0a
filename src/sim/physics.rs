//! Player movement: acceleration, sprint, dodge roll, arena bounds

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{
    Vec2, ACCELERATION, ARENA_HEIGHT, ARENA_WIDTH, DECELERATION, MOVEMENT_SPEED, PLAYER_HEIGHT,
    PLAYER_WIDTH, ROLL_COOLDOWN, ROLL_DURATION, ROLL_IFRAMES, ROLL_SPEED, SPRINT_SPEED,
};

/// Control state that drives one movement step
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Controls {
    pub up: bool,
    pub down: bool,
    pub left: bool,
    pub right: bool,
    /// Aim direction in radians
    pub aim_angle: f32,
    pub is_sprinting: bool,
}

impl Controls {
    /// Raw (unnormalized) directional input
    pub fn direction(&self) -> Vec2 {
        let mut dir = Vec2::ZERO;
        if self.left {
            dir.x -= 1.0;
        }
        if self.right {
            dir.x += 1.0;
        }
        if self.up {
            dir.y -= 1.0;
        }
        if self.down {
            dir.y += 1.0;
        }
        dir
    }

    pub fn has_movement(&self) -> bool {
        !self.direction().is_zero()
    }
}

/// Dodge roll timers (seconds)
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RollState {
    pub remaining: f32,
    pub elapsed: f32,
    pub direction: Vec2,
    pub cooldown: f32,
}

/// Kinematic state integrated by the movement formula
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Body {
    pub position: Vec2,
    pub velocity: Vec2,
    /// Facing in radians
    pub rotation: f32,
    pub roll: RollState,
}

impl Body {
    pub fn at(position: Vec2) -> Self {
        Self {
            position,
            ..Default::default()
        }
    }

    pub fn is_rolling(&self) -> bool {
        self.roll.remaining > 0.0
    }

    /// Rolling players are untouchable for the first part of the roll
    pub fn has_roll_iframes(&self) -> bool {
        self.is_rolling() && self.roll.elapsed < ROLL_IFRAMES
    }
}

/// Physics system for updating player bodies
pub struct PhysicsSystem;

impl PhysicsSystem {
    /// Advance a body by one fixed step
    pub fn step(body: &mut Body, controls: &Controls, dt: f32) {
        body.roll.cooldown = (body.roll.cooldown - dt).max(0.0);

        if body.is_rolling() {
            body.velocity = body.roll.direction * ROLL_SPEED;
            body.roll.elapsed += dt;
            body.roll.remaining = (body.roll.remaining - dt).max(0.0);
        } else {
            let dir = controls.direction().normalize_or_zero();
            body.velocity = if dir.is_zero() {
                accelerate_toward(body.velocity, Vec2::ZERO, DECELERATION * dt)
            } else {
                let speed = if controls.is_sprinting {
                    SPRINT_SPEED
                } else {
                    MOVEMENT_SPEED
                };
                accelerate_toward(body.velocity, dir * speed, ACCELERATION * dt)
            };
        }
        body.velocity = sanitize(body.velocity, "velocity");

        let unclamped = body.position + body.velocity * dt;
        let clamped = Self::clamp_to_arena(unclamped);
        if clamped != unclamped && body.is_rolling() {
            // Rolling into a wall ends the roll
            body.roll.remaining = 0.0;
        }
        body.position = sanitize(clamped, "position");

        if controls.aim_angle.is_finite() {
            body.rotation = controls.aim_angle;
        }
    }

    /// Start a dodge roll if the cooldown has elapsed
    ///
    /// Rolls go in the movement direction, or along the aim when standing still.
    pub fn try_start_roll(body: &mut Body, controls: &Controls) -> bool {
        if body.is_rolling() || body.roll.cooldown > 0.0 {
            return false;
        }

        let dir = controls.direction().normalize_or_zero();
        let direction = if dir.is_zero() {
            Vec2::from_angle(controls.aim_angle)
        } else {
            dir
        };
        if !direction.is_finite() {
            return false;
        }

        body.roll = RollState {
            remaining: ROLL_DURATION,
            elapsed: 0.0,
            direction,
            cooldown: ROLL_COOLDOWN,
        };
        true
    }

    /// Keep a position inside the arena, accounting for the player hitbox
    pub fn clamp_to_arena(pos: Vec2) -> Vec2 {
        let half_w = PLAYER_WIDTH / 2.0;
        let half_h = PLAYER_HEIGHT / 2.0;
        Vec2::new(
            pos.x.clamp(half_w, ARENA_WIDTH - half_w),
            pos.y.clamp(half_h, ARENA_HEIGHT - half_h),
        )
    }
}

/// Move `current` toward `target` by at most `max_change`, snapping when close
fn accelerate_toward(current: Vec2, target: Vec2, max_change: f32) -> Vec2 {
    let diff = target - current;
    let dist = diff.length();
    if dist <= max_change {
        return target;
    }
    current + diff * (max_change / dist)
}

/// Replace NaN/∞ components with zero
fn sanitize(v: Vec2, what: &'static str) -> Vec2 {
    if v.is_finite() {
        return v;
    }
    let fixed = Vec2::new(
        if v.x.is_finite() { v.x } else { 0.0 },
        if v.y.is_finite() { v.y } else { 0.0 },
    );
    warn!(field = what, x = %v.x, y = %v.y, "Sanitized non-finite physics value");
    fixed
}
