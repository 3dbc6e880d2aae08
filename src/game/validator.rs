//! Shot plausibility validation - advisory anti-cheat
//!
//! A rejected claim never disconnects or desyncs the shooter; the room still
//! broadcasts the visual event and only the damage attribution is suspect.

use thiserror::Error;

use crate::ws::protocol::{Position, Trajectory};

/// Maximum distance between the claimed muzzle position and the shooter's
/// last authoritative position
pub const ORIGIN_TOLERANCE: f32 = 50.0;

/// Maximum plausible movement between two consecutive state updates
pub const MAX_UPDATE_STEP: f32 = 120.0;

/// Weapon firing parameters used for plausibility checks
#[derive(Debug, Clone, Copy)]
pub struct WeaponSpec {
    /// Longest trajectory this weapon can produce
    pub max_range: f32,
    /// Minimum time between accepted shots (milliseconds)
    pub cooldown_ms: u64,
    /// Upper bound on a single claimed hit
    pub max_damage: i32,
}

impl WeaponSpec {
    pub fn for_name(name: &str) -> Self {
        match name {
            "pistol" => Self {
                max_range: 400.0,
                cooldown_ms: 250,
                max_damage: 25,
            },
            "shotgun" => Self {
                max_range: 250.0,
                cooldown_ms: 800,
                max_damage: 60,
            },
            "sniper" => Self {
                max_range: 1200.0,
                cooldown_ms: 1500,
                max_damage: 90,
            },
            // rifle, and anything the client makes up
            _ => Self::default(),
        }
    }
}

impl Default for WeaponSpec {
    fn default() -> Self {
        Self {
            max_range: 800.0,
            cooldown_ms: 150,
            max_damage: 35,
        }
    }
}

/// A client-reported firing event
#[derive(Debug, Clone, Copy)]
pub struct ShotClaim {
    pub position: Position,
    pub trajectory: Trajectory,
    /// Client clock at fire time; advisory only, never an ordering key
    pub timestamp: Option<u64>,
}

/// What the room knows authoritatively about the shooter
#[derive(Debug, Clone, Copy)]
pub struct ShooterView {
    pub x: f32,
    pub y: f32,
    /// Server arrival time of the last accepted shot
    pub last_shot_at: Option<u64>,
}

/// Reasons a shot claim fails plausibility
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ShotRejection {
    #[error("claimed origin too far from last known position")]
    OriginMismatch,

    #[error("trajectory exceeds weapon range")]
    OutOfRange,

    #[error("fired again before weapon cooldown elapsed")]
    CooldownViolation,
}

/// Check a shot claim against the shooter's authoritative state.
/// `now_ms` is the server arrival time of the claim.
pub fn validate(
    claim: &ShotClaim,
    shooter: &ShooterView,
    weapon: &WeaponSpec,
    now_ms: u64,
) -> Result<(), ShotRejection> {
    let dx = claim.position.x - shooter.x;
    let dy = claim.position.y - shooter.y;
    if (dx * dx + dy * dy).sqrt() > ORIGIN_TOLERANCE {
        return Err(ShotRejection::OriginMismatch);
    }

    if claim.trajectory.length() > weapon.max_range {
        return Err(ShotRejection::OutOfRange);
    }

    if let Some(last) = shooter.last_shot_at {
        if now_ms.saturating_sub(last) < weapon.cooldown_ms {
            return Err(ShotRejection::CooldownViolation);
        }
    }

    Ok(())
}

/// Check that a reported position step from the previous authoritative
/// position is physically plausible
pub fn movement_plausible(from_x: f32, from_y: f32, to_x: f32, to_y: f32) -> bool {
    let dx = to_x - from_x;
    let dy = to_y - from_y;
    (dx * dx + dy * dy).sqrt() <= MAX_UPDATE_STEP
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claim(x: f32, y: f32, end_x: f32, end_y: f32) -> ShotClaim {
        ShotClaim {
            position: Position { x, y },
            trajectory: Trajectory {
                start_x: x,
                start_y: y,
                end_x,
                end_y,
            },
            timestamp: None,
        }
    }

    fn shooter_at(x: f32, y: f32) -> ShooterView {
        ShooterView {
            x,
            y,
            last_shot_at: None,
        }
    }

    #[test]
    fn plausible_shot_is_accepted() {
        let c = claim(100.0, 100.0, 400.0, 100.0);
        let s = shooter_at(110.0, 100.0);
        assert_eq!(validate(&c, &s, &WeaponSpec::default(), 1_000), Ok(()));
    }

    #[test]
    fn origin_far_from_authoritative_position_is_rejected() {
        let c = claim(500.0, 500.0, 600.0, 500.0);
        let s = shooter_at(100.0, 100.0);
        assert_eq!(
            validate(&c, &s, &WeaponSpec::default(), 1_000),
            Err(ShotRejection::OriginMismatch)
        );
    }

    #[test]
    fn trajectory_beyond_weapon_range_is_rejected() {
        let c = claim(100.0, 100.0, 2_000.0, 100.0);
        let s = shooter_at(100.0, 100.0);
        assert_eq!(
            validate(&c, &s, &WeaponSpec::default(), 1_000),
            Err(ShotRejection::OutOfRange)
        );
    }

    #[test]
    fn second_shot_inside_cooldown_is_rejected() {
        let c = claim(100.0, 100.0, 400.0, 100.0);
        let weapon = WeaponSpec::default();

        let mut s = shooter_at(100.0, 100.0);
        assert_eq!(validate(&c, &s, &weapon, 1_000), Ok(()));
        s.last_shot_at = Some(1_000);

        assert_eq!(
            validate(&c, &s, &weapon, 1_000 + weapon.cooldown_ms - 1),
            Err(ShotRejection::CooldownViolation)
        );
    }

    #[test]
    fn shot_after_cooldown_elapsed_is_accepted() {
        let c = claim(100.0, 100.0, 400.0, 100.0);
        let weapon = WeaponSpec::default();
        let s = ShooterView {
            x: 100.0,
            y: 100.0,
            last_shot_at: Some(1_000),
        };
        assert_eq!(validate(&c, &s, &weapon, 1_000 + weapon.cooldown_ms), Ok(()));
    }

    #[test]
    fn named_weapons_have_distinct_budgets() {
        assert!(WeaponSpec::for_name("sniper").max_range > WeaponSpec::for_name("shotgun").max_range);
        assert!(WeaponSpec::for_name("shotgun").cooldown_ms > WeaponSpec::for_name("pistol").cooldown_ms);
    }

    #[test]
    fn movement_step_bound() {
        assert!(movement_plausible(0.0, 0.0, 100.0, 0.0));
        assert!(!movement_plausible(0.0, 0.0, 500.0, 0.0));
    }
}
