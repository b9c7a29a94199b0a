//! Shared simulation code
//!
//! The movement formula here runs on both sides of the wire: the server
//! integrates it as the authority and the client replays it for prediction.
//! Any change must keep both sides bit-identical.

pub mod physics;
pub mod vec2;

pub use physics::{Body, Controls, PhysicsSystem, RollState};
pub use vec2::{angle_delta, lerp_angle, wrap_angle, Vec2};

/// Walking speed in pixels per second
pub const MOVEMENT_SPEED: f32 = 200.0;
/// Sprinting speed in pixels per second
pub const SPRINT_SPEED: f32 = 300.0;
/// Acceleration toward the target velocity (px/s²)
pub const ACCELERATION: f32 = 1500.0;
/// Deceleration toward rest when there is no input (px/s²)
pub const DECELERATION: f32 = 1500.0;

pub const ARENA_WIDTH: f32 = 1920.0;
pub const ARENA_HEIGHT: f32 = 1080.0;

pub const PLAYER_WIDTH: f32 = 32.0;
pub const PLAYER_HEIGHT: f32 = 64.0;
pub const PLAYER_MAX_HEALTH: f32 = 100.0;

/// Dodge roll tuning
pub const ROLL_SPEED: f32 = 250.0;
pub const ROLL_DURATION: f32 = 0.4;
pub const ROLL_IFRAMES: f32 = 0.2;
pub const ROLL_COOLDOWN: f32 = 3.0;
