//! Combat system - hit detection, lag compensation, damage

use crate::sim::{PhysicsSystem, Vec2};
use crate::ws::protocol::PlayerId;

use super::history::PositionHistory;

/// Circular hitbox radius used for shot and swing tests
pub const HITBOX_RADIUS: f32 = 16.0;

/// Spawn protection after joining or respawning
pub const SPAWN_INVULNERABILITY_MS: u64 = 2_000;

/// Delay between death and respawn
pub const RESPAWN_DELAY_MS: u64 = 3_000;

/// Health regained per second once regeneration kicks in
pub const REGEN_PER_SECOND: f32 = 10.0;

/// Time without damage before regeneration starts
pub const REGEN_DELAY_MS: u64 = 5_000;

/// A candidate victim at its rewound position
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Target {
    pub id: PlayerId,
    pub position: Vec2,
}

/// Closest victim along a shot
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HitResult {
    pub victim_id: PlayerId,
    /// Distance from the shooter to the hitbox edge
    pub distance: f32,
}

/// Combat system for hit tests and damage
pub struct CombatSystem;

impl CombatSystem {
    /// Server time to rewind victims to for an attack
    ///
    /// `client_timestamp - one_way_latency`, clamped into the retained window
    /// `[now - window, now]`. Timestamps from the future resolve at `now`.
    pub fn compensated_time(
        client_timestamp: u64,
        one_way_latency_ms: u64,
        now_ms: u64,
        window_ms: u64,
    ) -> u64 {
        let earliest = now_ms.saturating_sub(window_ms);
        client_timestamp
            .saturating_sub(one_way_latency_ms)
            .clamp(earliest, now_ms)
    }

    /// Where a victim was at `at_ms`, falling back to its current position
    pub fn rewound_position(history: &PositionHistory, current: Vec2, at_ms: u64) -> Vec2 {
        history.position_at(at_ms).unwrap_or(current)
    }

    /// Distance along the ray at which it enters a circle, if it does within `range`
    pub fn ray_circle(origin: Vec2, aim_angle: f32, range: f32, center: Vec2, radius: f32) -> Option<f32> {
        let dir = Vec2::from_angle(aim_angle);
        let to_center = center - origin;
        let along = to_center.dot(dir);
        let perp_sq = to_center.length_squared() - along * along;
        let radius_sq = radius * radius;

        if perp_sq > radius_sq {
            return None;
        }
        let entry = along - (radius_sq - perp_sq).max(0.0).sqrt();
        if along < 0.0 && entry < 0.0 && to_center.length_squared() > radius_sq {
            // Behind the shooter
            return None;
        }
        let entry = entry.max(0.0);
        (entry <= range).then_some(entry)
    }

    /// Closest target hit by a shot
    pub fn closest_ray_hit(
        origin: Vec2,
        aim_angle: f32,
        range: f32,
        targets: impl IntoIterator<Item = Target>,
    ) -> Option<HitResult> {
        targets
            .into_iter()
            .filter_map(|t| {
                Self::ray_circle(origin, aim_angle, range, t.position, HITBOX_RADIUS).map(
                    |distance| HitResult {
                        victim_id: t.id,
                        distance,
                    },
                )
            })
            .min_by(|a, b| a.distance.total_cmp(&b.distance))
    }

    /// Whether `target` is inside a swing of `arc_degrees` centered on the aim
    pub fn in_melee_arc(origin: Vec2, aim_angle: f32, range: f32, arc_degrees: f32, target: Vec2) -> bool {
        let offset = target - origin;
        let dist = offset.length();
        if dist > range {
            return false;
        }
        if dist < 1e-3 {
            return true;
        }
        let cos = (offset.dot(Vec2::from_angle(aim_angle)) / dist).clamp(-1.0, 1.0);
        cos.acos() <= (arc_degrees / 2.0).to_radians()
    }

    /// Every target inside a swing
    pub fn melee_targets(
        origin: Vec2,
        aim_angle: f32,
        range: f32,
        arc_degrees: f32,
        targets: impl IntoIterator<Item = Target>,
    ) -> Vec<PlayerId> {
        targets
            .into_iter()
            .filter(|t| Self::in_melee_arc(origin, aim_angle, range, arc_degrees, t.position))
            .map(|t| t.id)
            .collect()
    }

    /// Victim position after being pushed away from the attacker
    pub fn knockback(attacker: Vec2, victim: Vec2, aim_angle: f32, distance: f32) -> Vec2 {
        let mut dir = (victim - attacker).normalize_or_zero();
        if dir.is_zero() {
            dir = Vec2::from_angle(aim_angle);
        }
        PhysicsSystem::clamp_to_arena(victim + dir * distance)
    }

    /// Apply damage to health, returns (new_health, is_dead)
    pub fn apply_damage(current_health: f32, damage: f32) -> (f32, bool) {
        let new_health = (current_health - damage).max(0.0);
        (new_health, new_health <= 0.0)
    }

    /// Health after `dt` seconds of regeneration
    pub fn regenerate(health: f32, max_health: f32, dt: f32) -> f32 {
        (health + REGEN_PER_SECOND * dt).min(max_health)
    }
}
