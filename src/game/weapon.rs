//! Weapon stats and per-player weapon state
//!
//! Cooldowns and reloads are measured against the room clock in milliseconds.

use crate::ws::protocol::WeaponStateData;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeaponKind {
    Pistol,
    Bat,
}

/// Static weapon tuning
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeaponStats {
    pub damage: f32,
    /// Shots (or swings) per second
    pub fire_rate: f32,
    /// Rounds per magazine, 0 for melee
    pub magazine_size: u32,
    pub reload_ms: u64,
    /// Maximum reach in pixels
    pub range: f32,
    /// Swing arc in degrees, 0 for ranged
    pub arc_degrees: f32,
    /// Knockback distance in pixels
    pub knockback: f32,
}

impl WeaponStats {
    pub fn for_kind(kind: WeaponKind) -> Self {
        match kind {
            WeaponKind::Pistol => Self {
                damage: 25.0,
                fire_rate: 3.0,
                magazine_size: 15,
                reload_ms: 1500,
                range: 800.0,
                arc_degrees: 0.0,
                knockback: 0.0,
            },
            WeaponKind::Bat => Self {
                damage: 25.0,
                fire_rate: 2.0,
                magazine_size: 0,
                reload_ms: 0,
                range: 90.0,
                arc_degrees: 90.0,
                knockback: 40.0,
            },
        }
    }

    pub fn is_melee(&self) -> bool {
        self.magazine_size == 0
    }

    /// Minimum time between shots
    pub fn cooldown_ms(&self) -> u64 {
        if self.fire_rate <= 0.0 {
            return 0;
        }
        (1000.0 / self.fire_rate) as u64
    }
}

/// Why an attack was refused; `Display` is the `shoot:failed` reason code
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FireError {
    #[error("no_player")]
    NoPlayer,
    #[error("dead")]
    Dead,
    #[error("reloading")]
    Reloading,
    #[error("empty")]
    Empty,
    #[error("cooldown")]
    Cooldown,
}

#[derive(Debug, Clone)]
pub struct WeaponState {
    pub kind: WeaponKind,
    pub stats: WeaponStats,
    pub current_ammo: u32,
    reload_started_at: Option<u64>,
    last_fired_at: Option<u64>,
}

impl WeaponState {
    pub fn new(kind: WeaponKind) -> Self {
        let stats = WeaponStats::for_kind(kind);
        Self {
            kind,
            stats,
            current_ammo: stats.magazine_size,
            reload_started_at: None,
            last_fired_at: None,
        }
    }

    pub fn is_reloading(&self) -> bool {
        self.reload_started_at.is_some()
    }

    pub fn is_empty(&self) -> bool {
        !self.stats.is_melee() && self.current_ammo == 0
    }

    fn cooldown_ready(&self, now_ms: u64) -> bool {
        match self.last_fired_at {
            Some(at) => now_ms.saturating_sub(at) >= self.stats.cooldown_ms(),
            None => true,
        }
    }

    /// Whether the weapon may fire at `now_ms`
    pub fn check_fire(&self, now_ms: u64) -> Result<(), FireError> {
        if !self.stats.is_melee() {
            if self.is_reloading() {
                return Err(FireError::Reloading);
            }
            if self.current_ammo == 0 {
                return Err(FireError::Empty);
            }
        }
        if !self.cooldown_ready(now_ms) {
            return Err(FireError::Cooldown);
        }
        Ok(())
    }

    pub fn record_shot(&mut self, now_ms: u64) {
        if !self.stats.is_melee() {
            self.current_ammo = self.current_ammo.saturating_sub(1);
        }
        self.last_fired_at = Some(now_ms);
    }

    /// Begin reloading; refused for melee, full magazines, or an active reload
    pub fn start_reload(&mut self, now_ms: u64) -> bool {
        if self.stats.is_melee()
            || self.is_reloading()
            || self.current_ammo >= self.stats.magazine_size
        {
            return false;
        }
        self.reload_started_at = Some(now_ms);
        true
    }

    /// Finish a reload whose time has elapsed; returns true on completion
    pub fn poll_reload(&mut self, now_ms: u64) -> bool {
        match self.reload_started_at {
            Some(started) if now_ms.saturating_sub(started) >= self.stats.reload_ms => {
                self.current_ammo = self.stats.magazine_size;
                self.reload_started_at = None;
                true
            }
            _ => false,
        }
    }

    pub fn to_wire(&self) -> WeaponStateData {
        WeaponStateData {
            current_ammo: self.current_ammo,
            max_ammo: self.stats.magazine_size,
            is_reloading: self.is_reloading(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pistol_fire_rate_cooldown() {
        let mut pistol = WeaponState::new(WeaponKind::Pistol);
        assert_eq!(pistol.check_fire(1_000), Ok(()));
        pistol.record_shot(1_000);
        assert_eq!(pistol.current_ammo, 14);

        assert_eq!(pistol.check_fire(1_200), Err(FireError::Cooldown));
        assert_eq!(pistol.check_fire(1_333), Ok(()));
    }

    #[test]
    fn empty_magazine_blocks_until_reloaded() {
        let mut pistol = WeaponState::new(WeaponKind::Pistol);
        let mut now = 0;
        for _ in 0..15 {
            assert_eq!(pistol.check_fire(now), Ok(()));
            pistol.record_shot(now);
            now += 400;
        }
        assert!(pistol.is_empty());
        assert_eq!(pistol.check_fire(now), Err(FireError::Empty));

        assert!(pistol.start_reload(now));
        assert!(!pistol.start_reload(now));
        assert_eq!(pistol.check_fire(now + 100), Err(FireError::Reloading));

        assert!(!pistol.poll_reload(now + 1_499));
        assert!(pistol.poll_reload(now + 1_500));
        assert_eq!(pistol.current_ammo, 15);
        assert_eq!(pistol.check_fire(now + 1_500), Ok(()));
    }

    #[test]
    fn full_magazine_does_not_reload() {
        let mut pistol = WeaponState::new(WeaponKind::Pistol);
        assert!(!pistol.start_reload(0));
    }

    #[test]
    fn melee_ignores_ammo() {
        let mut bat = WeaponState::new(WeaponKind::Bat);
        assert!(bat.stats.is_melee());
        bat.record_shot(0);
        assert_eq!(bat.check_fire(100), Err(FireError::Cooldown));
        assert_eq!(bat.check_fire(500), Ok(()));
        assert!(!bat.start_reload(500));
    }

    #[test]
    fn reason_codes() {
        assert_eq!(FireError::Cooldown.to_string(), "cooldown");
        assert_eq!(FireError::Empty.to_string(), "empty");
    }
}
