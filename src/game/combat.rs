//! Melee combat resolution - stamina, accuracy, armor and status effects

use rand::Rng;

use crate::ws::protocol::{EffectTag, MeleeActionKind};

/// Flat damage bonus when the action carries a stun tag
const STUN_BONUS_DAMAGE: f64 = 2.0;
/// Immediate health loss applied by a bleed tag
const BLEED_DAMAGE: i32 = 2;
/// Fraction of dealt damage shaved off the target's armor
const ARMOR_DEGRADE_FACTOR: f64 = 0.1;

/// Per-action costs and modifiers
#[derive(Debug, Clone, Copy)]
pub struct ActionProfile {
    pub stamina_cost: f64,
    /// Chance to land, rolled for attack kinds only
    pub accuracy: f64,
    pub damage_multiplier: f64,
}

impl ActionProfile {
    pub fn for_kind(kind: MeleeActionKind) -> Self {
        match kind {
            MeleeActionKind::Attack => Self {
                stamina_cost: 5.0,
                accuracy: 0.9,
                damage_multiplier: 1.0,
            },
            MeleeActionKind::PowerAttack => Self {
                stamina_cost: 20.0,
                accuracy: 0.85,
                damage_multiplier: 1.5,
            },
            MeleeActionKind::Defend => Self {
                stamina_cost: 15.0,
                accuracy: 1.0,
                damage_multiplier: 0.0,
            },
            MeleeActionKind::Riposte => Self {
                stamina_cost: 25.0,
                accuracy: 1.0,
                damage_multiplier: 0.0,
            },
        }
    }
}

/// Armor granted by a defend action
pub const DEFEND_ARMOR_BOOST: f64 = 30.0;
/// Turns a defend buff stays up
pub const DEFEND_DURATION_TURNS: u32 = 5;
/// Counter-attack trigger chance for an armed riposte
pub const RIPOSTE_CHANCE: f64 = 0.3;
/// Counter damage as a fraction of the riposting actor's own damage stat
pub const RIPOSTE_DAMAGE_FACTOR: f64 = 0.5;

/// Timed armor buff from a defend action
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArmorBuff {
    pub amount: f64,
    pub remaining_turns: u32,
}

/// One-turn armed counter-attack
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RiposteArmed {
    pub chance: f64,
    pub damage_factor: f64,
    pub remaining_turns: u32,
}

/// Mutable fighter state the resolver operates on.
/// Buffs are a fixed set of typed fields with explicit expiry, never
/// attached ad hoc.
#[derive(Debug, Clone, PartialEq)]
pub struct FighterState {
    pub health: i32,
    pub alive: bool,
    pub damage: f64,
    pub armor: f64,
    pub stamina: f64,
    pub armor_buff: Option<ArmorBuff>,
    pub riposte: Option<RiposteArmed>,
    pub stunned: bool,
}

impl FighterState {
    pub fn new(health: i32, damage: f64, armor: f64, stamina: f64) -> Self {
        Self {
            health,
            alive: true,
            damage,
            armor,
            stamina,
            armor_buff: None,
            riposte: None,
            stunned: false,
        }
    }

    fn take_damage(&mut self, amount: i32) {
        self.health = (self.health - amount).max(0);
        if self.health == 0 {
            self.alive = false;
        }
    }

    /// Advance this fighter's turn clock: expire the defend buff when its
    /// turns run out and disarm a riposte that was never triggered.
    pub fn tick_turn(&mut self) {
        if let Some(ref mut buff) = self.armor_buff {
            buff.remaining_turns = buff.remaining_turns.saturating_sub(1);
            if buff.remaining_turns == 0 {
                self.armor = (self.armor - buff.amount).max(0.0);
                self.armor_buff = None;
            }
        }

        if let Some(ref mut riposte) = self.riposte {
            riposte.remaining_turns = riposte.remaining_turns.saturating_sub(1);
            if riposte.remaining_turns == 0 {
                self.riposte = None;
            }
        }
    }
}

/// A declared combat action; attacker and target records are passed to
/// `resolve` separately
#[derive(Debug, Clone, Default)]
pub struct CombatAction {
    pub base_damage: Option<f64>,
    pub stamina_cost: Option<f64>,
    pub accuracy: Option<f64>,
    pub effects: Vec<EffectTag>,
}

/// Outcome of one resolved combat action
#[derive(Debug, Clone)]
pub struct CombatResult {
    pub success: bool,
    pub hit: bool,
    pub damage_dealt: i32,
    pub target_killed: bool,
    pub message: String,
    pub applied_effects: Vec<EffectTag>,
}

impl CombatResult {
    fn failure(message: &str) -> Self {
        Self {
            success: false,
            hit: false,
            damage_dealt: 0,
            target_killed: false,
            message: message.to_string(),
            applied_effects: Vec::new(),
        }
    }

    fn no_damage(message: String, applied_effects: Vec<EffectTag>) -> Self {
        Self {
            success: true,
            hit: false,
            damage_dealt: 0,
            target_killed: false,
            message,
            applied_effects,
        }
    }
}

/// Resolve a combat action against the attacker/target records.
///
/// The caller owns both records; this is the only code that mutates their
/// health/armor/stamina/buff fields during the call. Attack damage follows
/// `max(1, round(base - armor * 0.5))` - armor reduction is linear and
/// always lets at least 1 damage through.
pub fn resolve(
    kind: MeleeActionKind,
    action: &CombatAction,
    attacker: &mut FighterState,
    mut target: Option<&mut FighterState>,
    rng: &mut impl Rng,
) -> CombatResult {
    let profile = ActionProfile::for_kind(kind);
    let cost = action.stamina_cost.unwrap_or(profile.stamina_cost);

    if attacker.stamina < cost {
        return CombatResult::failure("Insufficient stamina");
    }
    attacker.stamina = (attacker.stamina - cost).max(0.0);

    match kind {
        MeleeActionKind::Defend => {
            attacker.armor += DEFEND_ARMOR_BOOST;
            attacker.armor_buff = Some(ArmorBuff {
                amount: DEFEND_ARMOR_BOOST,
                remaining_turns: DEFEND_DURATION_TURNS,
            });
            return CombatResult::no_damage(
                format!(
                    "Defend applied +{} armor for {} turns",
                    DEFEND_ARMOR_BOOST as i32, DEFEND_DURATION_TURNS
                ),
                vec![EffectTag::Defend],
            );
        }
        MeleeActionKind::Riposte => {
            attacker.riposte = Some(RiposteArmed {
                chance: RIPOSTE_CHANCE,
                damage_factor: RIPOSTE_DAMAGE_FACTOR,
                remaining_turns: 1,
            });
            return CombatResult::no_damage("Riposte ready".to_string(), vec![EffectTag::Riposte]);
        }
        MeleeActionKind::Attack | MeleeActionKind::PowerAttack => {}
    }

    let Some(target) = target.as_deref_mut() else {
        return CombatResult::failure("No target");
    };
    if !target.alive {
        return CombatResult::failure("Target already down");
    }

    let accuracy = action.accuracy.unwrap_or(profile.accuracy).clamp(0.0, 1.0);
    let roll: f64 = rng.gen();
    if roll > accuracy {
        return CombatResult {
            success: true,
            hit: false,
            damage_dealt: 0,
            target_killed: false,
            message: "Missed attack".to_string(),
            applied_effects: Vec::new(),
        };
    }

    let base = action.base_damage.unwrap_or(attacker.damage);
    let mut final_damage = base * profile.damage_multiplier;
    if action.effects.contains(&EffectTag::Stun) {
        final_damage += STUN_BONUS_DAMAGE;
    }

    let dealt = ((final_damage - target.armor * 0.5).round()).max(1.0) as i32;
    target.take_damage(dealt);
    // Armor degrades under fire
    target.armor = (target.armor - (dealt as f64 * ARMOR_DEGRADE_FACTOR).round()).max(0.0);

    let mut applied = Vec::new();
    for effect in &action.effects {
        applied.push(*effect);
        match effect {
            EffectTag::Bleed => target.take_damage(BLEED_DAMAGE),
            EffectTag::Stun => target.stunned = true,
            _ => {}
        }
    }

    // An armed riposte on the target counters with the target's own damage
    // stat; the flag is consumed whether or not the roll succeeds
    if let Some(riposte) = target.riposte.take() {
        let counter_roll: f64 = rng.gen();
        if counter_roll <= riposte.chance {
            let counter = ((riposte.damage_factor * target.damage).round()).max(1.0) as i32;
            attacker.take_damage(counter);
        }
    }

    CombatResult {
        success: true,
        hit: true,
        damage_dealt: dealt,
        target_killed: !target.alive,
        message: "Hit".to_string(),
        applied_effects: applied,
    }
}
