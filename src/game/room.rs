//! Battle room state and the per-room event loop

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::store::LedgerClient;
use crate::ws::protocol::{
    ClientMsg, Difficulty, EffectTag, MeleeActionKind, PlayerInfo, Position, ServerMsg, Trajectory,
};

use super::combat::{self, CombatAction, FighterState};
use super::settlement::battle_reward;
use super::validator::{self, ShooterView, ShotClaim, WeaponSpec};
use super::{Recipients, RoomEvent};

/// Starting health for every player
pub const FULL_HEALTH: i32 = 100;
/// Starting and maximum ammo
pub const MAX_AMMO: i32 = 30;
/// Players per room before a new one is opened
pub const MAX_ROOM_PLAYERS: usize = 8;
/// Score granted per point of killing damage
const SCORE_PER_DAMAGE: i64 = 10;
/// Melee damage stat every player starts with
const BASE_MELEE_DAMAGE: f64 = 10.0;
/// Melee stamina pool every player starts with
const BASE_STAMINA: f64 = 100.0;
/// How long a freshly created room waits for its first join
const FORMING_GRACE: Duration = Duration::from_secs(30);

/// Server-held combat state for one participant
#[derive(Debug, Clone)]
pub struct PlayerRecord {
    pub id: Uuid,
    pub session_id: Uuid,
    pub display_name: String,
    pub difficulty: Difficulty,

    // Transform
    pub x: f32,
    pub y: f32,
    pub angle: f32,

    // Combat
    pub ammo: i32,
    pub combat: FighterState,
    pub last_shot_at: Option<u64>,
    /// Implausible shots/moves observed for this player
    pub suspect_flags: u32,

    // Match tallies, read once at settlement and then discarded
    pub kills: u32,
    pub deaths: u32,
    pub score: i64,
}

impl PlayerRecord {
    fn new(id: Uuid, session_id: Uuid, difficulty: Difficulty, x: f32, y: f32) -> Self {
        Self {
            id,
            session_id,
            display_name: format!("Player_{}", &id.to_string()[..8]),
            difficulty,
            x,
            y,
            angle: 0.0,
            ammo: MAX_AMMO,
            combat: FighterState::new(FULL_HEALTH, BASE_MELEE_DAMAGE, 0.0, BASE_STAMINA),
            last_shot_at: None,
            suspect_flags: 0,
            kills: 0,
            deaths: 0,
            score: 0,
        }
    }

    pub fn info(&self) -> PlayerInfo {
        PlayerInfo {
            id: self.id,
            display_name: self.display_name.clone(),
            x: self.x,
            y: self.y,
            angle: self.angle,
            health: self.combat.health,
            ammo: self.ammo,
            alive: self.combat.alive,
            kills: self.kills,
            deaths: self.deaths,
            score: self.score,
        }
    }
}

/// Room lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomPhase {
    /// Created, waiting for the first join
    Forming,
    /// At least one player, accepting events
    Active,
    /// Last player left; the registry evicts the room
    Closed,
}

/// Side effects produced by handling one room event
#[derive(Debug)]
pub enum Effect {
    Send(Recipients, ServerMsg),
    /// Unbind a transport session from this room
    ReleaseSession(Uuid),
    /// Credit the player on the external ledger, off the room loop
    Settle(SettlementJob),
}

#[derive(Debug, Clone)]
pub struct SettlementJob {
    pub player_id: Uuid,
    pub session_id: Uuid,
    pub amount: i64,
    pub reason: String,
}

/// One match's authoritative state. All mutation happens on the room's own
/// event loop, one event at a time.
pub struct BattleRoom {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub phase: RoomPhase,
    pub players: HashMap<Uuid, PlayerRecord>,
    /// transport session id -> player id
    pub sessions: HashMap<Uuid, Uuid>,
    pub rng: ChaCha8Rng,
}

impl BattleRoom {
    pub fn new(id: Uuid, seed: u64) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            phase: RoomPhase::Forming,
            players: HashMap::new(),
            sessions: HashMap::new(),
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn is_forming(&self) -> bool {
        self.phase == RoomPhase::Forming
    }

    pub fn is_closed(&self) -> bool {
        self.phase == RoomPhase::Closed
    }

    /// Dispatch one inbound event, returning the outbound effects
    pub fn handle_event(&mut self, event: RoomEvent) -> Vec<Effect> {
        match event {
            RoomEvent::Message {
                session_id,
                msg,
                received_at,
            } => match msg {
                ClientMsg::Join {
                    player_id,
                    difficulty,
                } => self.apply_join(session_id, player_id, difficulty),
                ClientMsg::Update {
                    id,
                    x,
                    y,
                    angle,
                    health,
                    ammo,
                } => self.apply_update(session_id, id, x, y, angle, health, ammo),
                ClientMsg::Shot {
                    player_id,
                    position,
                    trajectory,
                    timestamp,
                } => self.apply_shot(player_id, position, trajectory, timestamp, received_at),
                ClientMsg::Hit {
                    player_id,
                    target_id,
                    weapon,
                    damage,
                } => self.apply_hit(player_id, target_id, weapon, damage),
                ClientMsg::Melee {
                    player_id,
                    target_id,
                    action,
                    effects,
                } => self.apply_melee(player_id, target_id, action, effects),
                ClientMsg::End {
                    player_id,
                    score,
                    kills,
                } => self.apply_end(player_id, score, kills),
            },
            RoomEvent::Disconnected { session_id } => self.apply_leave(session_id),
        }
    }

    fn apply_join(
        &mut self,
        session_id: Uuid,
        player_id: Uuid,
        difficulty: Difficulty,
    ) -> Vec<Effect> {
        // A duplicate join never creates a second record; re-sync the client
        if self.players.contains_key(&player_id) {
            debug!(room_id = %self.id, player_id = %player_id, "Duplicate join, resyncing");
            self.sessions.insert(session_id, player_id);
            return vec![Effect::Send(
                Recipients::Only(session_id),
                ServerMsg::Start {
                    room_id: self.id,
                    players: self.roster(),
                },
            )];
        }

        let x = self.rng.gen_range(100.0..900.0);
        let y = self.rng.gen_range(100.0..700.0);
        let record = PlayerRecord::new(player_id, session_id, difficulty, x, y);
        let joined = record.info();

        self.players.insert(player_id, record);
        self.sessions.insert(session_id, player_id);
        self.phase = RoomPhase::Active;

        info!(
            room_id = %self.id,
            player_id = %player_id,
            difficulty = ?difficulty,
            player_count = self.players.len(),
            "Player joined battle"
        );

        vec![
            Effect::Send(Recipients::All, ServerMsg::PlayerJoined { player: joined }),
            Effect::Send(
                Recipients::Only(session_id),
                ServerMsg::Start {
                    room_id: self.id,
                    players: self.roster(),
                },
            ),
        ]
    }

    fn apply_update(
        &mut self,
        session_id: Uuid,
        player_id: Uuid,
        x: f32,
        y: f32,
        angle: f32,
        health: i32,
        ammo: i32,
    ) -> Vec<Effect> {
        let Some(player) = self.players.get_mut(&player_id) else {
            return Vec::new();
        };
        if !player.combat.alive {
            return Vec::new();
        }

        if !validator::movement_plausible(player.x, player.y, x, y) {
            warn!(
                room_id = %self.id,
                player_id = %player_id,
                "Implausible position jump in state update"
            );
            player.suspect_flags += 1;
        }
        player.x = x;
        player.y = y;
        player.angle = angle;

        // Health and ammo are server-owned: an update may spend them, never
        // restore them
        player.combat.health = health.clamp(0, player.combat.health);
        if player.combat.health == 0 {
            player.combat.alive = false;
        }
        player.ammo = ammo.clamp(0, MAX_AMMO);

        vec![Effect::Send(
            Recipients::AllExcept(session_id),
            ServerMsg::PlayerUpdate {
                id: player.id,
                x: player.x,
                y: player.y,
                angle: player.angle,
                health: player.combat.health,
                ammo: player.ammo,
            },
        )]
    }

    fn apply_shot(
        &mut self,
        player_id: Uuid,
        position: Position,
        trajectory: Trajectory,
        timestamp: Option<u64>,
        received_at: u64,
    ) -> Vec<Effect> {
        let Some(shooter) = self.players.get_mut(&player_id) else {
            return Vec::new();
        };

        if let Some(client_ts) = timestamp {
            if received_at.abs_diff(client_ts) > 5_000 {
                debug!(player_id = %player_id, "Large client clock skew on shot claim");
            }
        }

        let claim = ShotClaim {
            position,
            trajectory,
            timestamp,
        };
        let view = ShooterView {
            x: shooter.x,
            y: shooter.y,
            last_shot_at: shooter.last_shot_at,
        };

        match validator::validate(&claim, &view, &WeaponSpec::default(), received_at) {
            Ok(()) => {
                shooter.last_shot_at = Some(received_at);
            }
            Err(reason) => {
                warn!(
                    room_id = %self.id,
                    player_id = %player_id,
                    %reason,
                    "Rejected implausible shot"
                );
                shooter.suspect_flags += 1;
            }
        }

        // The visual event goes out either way
        vec![Effect::Send(
            Recipients::All,
            ServerMsg::Shot {
                player_id,
                position,
                trajectory,
            },
        )]
    }

    fn apply_hit(
        &mut self,
        attacker_id: Uuid,
        target_id: Uuid,
        weapon: String,
        damage: i32,
    ) -> Vec<Effect> {
        let spec = WeaponSpec::for_name(&weapon);
        let applied = damage.clamp(0, spec.max_damage);

        let killed = {
            let Some(target) = self.players.get_mut(&target_id) else {
                return Vec::new();
            };
            if !target.combat.alive {
                return Vec::new();
            }

            target.combat.health = (target.combat.health - applied).max(0);
            if target.combat.health == 0 {
                target.combat.alive = false;
                target.deaths += 1;
                true
            } else {
                false
            }
        };

        if let Some(attacker) = self.players.get_mut(&attacker_id) {
            if attacker.suspect_flags > 0 {
                warn!(
                    room_id = %self.id,
                    player_id = %attacker_id,
                    flags = attacker.suspect_flags,
                    "Hit claimed by player with rejected shots"
                );
            }
            if killed {
                attacker.kills += 1;
                attacker.score += applied as i64 * SCORE_PER_DAMAGE;
            }
        }

        vec![Effect::Send(
            Recipients::All,
            ServerMsg::Hit {
                player_id: attacker_id,
                target_id,
                weapon,
                damage,
            },
        )]
    }

    fn apply_melee(
        &mut self,
        player_id: Uuid,
        target_id: Option<Uuid>,
        action: MeleeActionKind,
        effects: Vec<EffectTag>,
    ) -> Vec<Effect> {
        let Some(mut attacker) = self.players.remove(&player_id) else {
            return Vec::new();
        };
        if !attacker.combat.alive {
            self.players.insert(player_id, attacker);
            return Vec::new();
        }

        // A stunned fighter spends the turn shaking it off
        if attacker.combat.stunned {
            attacker.combat.stunned = false;
            self.players.insert(player_id, attacker);
            return vec![Effect::Send(
                Recipients::All,
                ServerMsg::MeleeResult {
                    attacker_id: player_id,
                    target_id,
                    success: false,
                    hit: false,
                    damage_dealt: 0,
                    target_killed: false,
                    message: "Stunned".to_string(),
                    applied_effects: Vec::new(),
                },
            )];
        }

        let mut target = target_id
            .filter(|tid| *tid != player_id)
            .and_then(|tid| self.players.remove(&tid));

        let combat_action = CombatAction {
            effects,
            ..Default::default()
        };
        let result = combat::resolve(
            action,
            &combat_action,
            &mut attacker.combat,
            target.as_mut().map(|t| &mut t.combat),
            &mut self.rng,
        );
        attacker.combat.tick_turn();

        if result.target_killed {
            attacker.kills += 1;
            attacker.score += result.damage_dealt as i64 * SCORE_PER_DAMAGE;
            if let Some(ref mut t) = target {
                t.deaths += 1;
            }
        }
        // A riposte counter can drop the original attacker
        if !attacker.combat.alive {
            attacker.deaths += 1;
            if let Some(ref mut t) = target {
                t.kills += 1;
            }
        }

        self.players.insert(player_id, attacker);
        if let (Some(tid), Some(rec)) = (target_id, target) {
            self.players.insert(tid, rec);
        }

        vec![Effect::Send(
            Recipients::All,
            ServerMsg::MeleeResult {
                attacker_id: player_id,
                target_id,
                success: result.success,
                hit: result.hit,
                damage_dealt: result.damage_dealt,
                target_killed: result.target_killed,
                message: result.message,
                applied_effects: result.applied_effects,
            },
        )]
    }

    fn apply_end(&mut self, player_id: Uuid, reported_score: i64, reported_kills: u32) -> Vec<Effect> {
        let Some(record) = self.players.remove(&player_id) else {
            return Vec::new();
        };
        self.sessions.remove(&record.session_id);

        if record.score != reported_score || record.kills != reported_kills {
            debug!(
                room_id = %self.id,
                player_id = %player_id,
                tallied_kills = record.kills,
                reported_kills,
                "Client-reported end stats differ from room tallies"
            );
        }

        let amount = battle_reward(record.kills, record.score);
        let reason = format!(
            "Battle victory: {} kills, {} score",
            record.kills, record.score
        );

        info!(
            room_id = %self.id,
            player_id = %player_id,
            amount,
            "Battle ended, settling reward"
        );

        let mut out = vec![Effect::ReleaseSession(record.session_id)];
        if self.sessions.is_empty() {
            self.phase = RoomPhase::Closed;
        } else {
            out.push(Effect::Send(
                Recipients::All,
                ServerMsg::PlayerLeft { player_id },
            ));
        }
        out.push(Effect::Settle(SettlementJob {
            player_id,
            session_id: record.session_id,
            amount,
            reason,
        }));
        out
    }

    fn apply_leave(&mut self, session_id: Uuid) -> Vec<Effect> {
        let Some(player_id) = self.sessions.remove(&session_id) else {
            return Vec::new();
        };
        self.players.remove(&player_id);

        info!(
            room_id = %self.id,
            player_id = %player_id,
            player_count = self.players.len(),
            "Player left battle"
        );

        let mut out = vec![Effect::ReleaseSession(session_id)];
        if self.sessions.is_empty() {
            self.phase = RoomPhase::Closed;
        } else {
            out.push(Effect::Send(
                Recipients::All,
                ServerMsg::PlayerLeft { player_id },
            ));
        }
        out
    }

    fn roster(&self) -> Vec<PlayerInfo> {
        self.players.values().map(PlayerRecord::info).collect()
    }
}

/// Handle to a running battle room
#[derive(Clone)]
pub struct RoomHandle {
    pub id: Uuid,
    pub event_tx: mpsc::Sender<RoomEvent>,
    pub outbound_tx: broadcast::Sender<(Recipients, ServerMsg)>,
    pub player_count: Arc<AtomicUsize>,
}

impl RoomHandle {
    pub fn player_count(&self) -> usize {
        self.player_count.load(Ordering::Relaxed)
    }
}

/// Drives one battle room: drains the event queue, applies effects,
/// spawns settlement calls
pub struct RoomActor {
    room: BattleRoom,
    event_rx: mpsc::Receiver<RoomEvent>,
    outbound_tx: broadcast::Sender<(Recipients, ServerMsg)>,
    player_count: Arc<AtomicUsize>,
    ledger: LedgerClient,
    sessions: Arc<DashMap<Uuid, Uuid>>,
}

impl RoomActor {
    pub fn new(
        id: Uuid,
        seed: u64,
        ledger: LedgerClient,
        sessions: Arc<DashMap<Uuid, Uuid>>,
    ) -> (Self, RoomHandle) {
        let (event_tx, event_rx) = mpsc::channel(256);
        let (outbound_tx, _) = broadcast::channel(64);
        let player_count = Arc::new(AtomicUsize::new(0));

        let handle = RoomHandle {
            id,
            event_tx,
            outbound_tx: outbound_tx.clone(),
            player_count: player_count.clone(),
        };

        let actor = Self {
            room: BattleRoom::new(id, seed),
            event_rx,
            outbound_tx,
            player_count,
            ledger,
            sessions,
        };

        (actor, handle)
    }

    /// Run the room's event loop until it closes
    pub async fn run(mut self) {
        info!(room_id = %self.room.id, created_at = %self.room.created_at, "Battle room opened");

        loop {
            let event = if self.room.is_forming() {
                match timeout(FORMING_GRACE, self.event_rx.recv()).await {
                    Ok(Some(event)) => event,
                    Ok(None) => break,
                    Err(_) => {
                        info!(room_id = %self.room.id, "No players joined, closing room");
                        break;
                    }
                }
            } else {
                match self.event_rx.recv().await {
                    Some(event) => event,
                    None => break,
                }
            };

            let effects = self.room.handle_event(event);
            self.player_count
                .store(self.room.player_count(), Ordering::Relaxed);

            for effect in effects {
                match effect {
                    Effect::Send(to, msg) => {
                        let _ = self.outbound_tx.send((to, msg));
                    }
                    Effect::ReleaseSession(session_id) => {
                        self.sessions.remove(&session_id);
                    }
                    Effect::Settle(job) => self.spawn_settlement(job),
                }
            }

            if self.room.is_closed() {
                break;
            }
        }

        info!(room_id = %self.room.id, "Battle room closed");
    }

    /// The ledger call runs on its own task: room-side cleanup already
    /// happened and never depends on the outcome
    fn spawn_settlement(&self, job: SettlementJob) {
        let ledger = self.ledger.clone();
        let outbound = self.outbound_tx.clone();

        tokio::spawn(async move {
            match ledger
                .credit_player(job.player_id, job.amount, &job.reason)
                .await
            {
                Ok(()) => {
                    let _ = outbound.send((
                        Recipients::Only(job.session_id),
                        ServerMsg::Reward {
                            tokens_earned: job.amount,
                        },
                    ));
                }
                Err(error) => {
                    warn!(
                        player_id = %job.player_id,
                        amount = job.amount,
                        %error,
                        "Reward settlement failed"
                    );
                }
            }
        });
    }
}

/// Registry of all live battle rooms, plus the session routing table
pub struct RoomRegistry {
    rooms: Arc<DashMap<Uuid, RoomHandle>>,
    /// transport session id -> room id
    sessions: Arc<DashMap<Uuid, Uuid>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            rooms: Arc::new(DashMap::new()),
            sessions: Arc::new(DashMap::new()),
        }
    }

    pub fn get(&self, id: &Uuid) -> Option<RoomHandle> {
        self.rooms.get(id).map(|r| r.value().clone())
    }

    pub fn active_rooms(&self) -> usize {
        self.rooms.len()
    }

    pub fn total_players(&self) -> usize {
        self.rooms.iter().map(|r| r.value().player_count()).sum()
    }

    pub fn room_for_session(&self, session_id: &Uuid) -> Option<Uuid> {
        self.sessions.get(session_id).map(|r| *r.value())
    }

    pub fn bind_session(&self, session_id: Uuid, room_id: Uuid) {
        self.sessions.insert(session_id, room_id);
    }

    /// Room ids with their current player counts
    pub fn summaries(&self) -> Vec<(Uuid, usize)> {
        self.rooms
            .iter()
            .map(|r| (*r.key(), r.value().player_count()))
            .collect()
    }

    /// Route a joining session to an open room, spawning a fresh one when
    /// every room is full
    pub fn find_or_create(&self, ledger: &LedgerClient) -> RoomHandle {
        if let Some(handle) = self.find_available(MAX_ROOM_PLAYERS) {
            return handle;
        }

        let id = Uuid::new_v4();
        let seed = rand::random::<u64>();
        let (actor, handle) = RoomActor::new(id, seed, ledger.clone(), self.sessions.clone());
        self.rooms.insert(id, handle.clone());

        // Evict the room and sweep its session bindings once the loop exits
        let rooms = self.rooms.clone();
        let sessions = self.sessions.clone();
        tokio::spawn(async move {
            actor.run().await;
            rooms.remove(&id);
            sessions.retain(|_, room_id| *room_id != id);
        });

        handle
    }

    fn find_available(&self, max_players: usize) -> Option<RoomHandle> {
        self.rooms
            .iter()
            .find(|r| r.value().player_count() < max_players)
            .map(|r| r.value().clone())
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn test_room() -> BattleRoom {
        BattleRoom::new(Uuid::new_v4(), 7)
    }

    fn join(room: &mut BattleRoom, session_id: Uuid, player_id: Uuid) -> Vec<Effect> {
        room.handle_event(RoomEvent::Message {
            session_id,
            msg: ClientMsg::Join {
                player_id,
                difficulty: Difficulty::Normal,
            },
            received_at: 0,
        })
    }

    fn sends_of(effects: &[Effect]) -> Vec<(&Recipients, &ServerMsg)> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Send(to, msg) => Some((to, msg)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn join_creates_record_and_syncs_the_joiner() {
        let mut room = test_room();
        let session = Uuid::new_v4();
        let player = Uuid::new_v4();

        let effects = join(&mut room, session, player);

        let record = &room.players[&player];
        assert_eq!(record.combat.health, FULL_HEALTH);
        assert_eq!(record.ammo, MAX_AMMO);
        assert!(record.combat.alive);
        assert_eq!((record.kills, record.deaths, record.score), (0, 0, 0));
        assert!((100.0..900.0).contains(&record.x));
        assert!((100.0..700.0).contains(&record.y));
        assert_eq!(room.sessions[&session], player);
        assert_eq!(room.phase, RoomPhase::Active);

        let sends = sends_of(&effects);
        assert!(matches!(
            sends[0],
            (Recipients::All, ServerMsg::PlayerJoined { .. })
        ));
        match sends[1] {
            (Recipients::Only(sid), ServerMsg::Start { room_id, players }) => {
                assert_eq!(*sid, session);
                assert_eq!(*room_id, room.id);
                assert_eq!(players.len(), 1);
            }
            other => panic!("unexpected effect: {:?}", other),
        }
    }

    #[test]
    fn duplicate_join_is_a_benign_resync() {
        let mut room = test_room();
        let session = Uuid::new_v4();
        let player = Uuid::new_v4();

        join(&mut room, session, player);
        let effects = join(&mut room, session, player);

        assert_eq!(room.players.len(), 1);
        let sends = sends_of(&effects);
        assert_eq!(sends.len(), 1);
        assert!(matches!(sends[0], (_, ServerMsg::Start { .. })));
    }

    #[test]
    fn join_then_leave_restores_roster_and_session_map() {
        let mut room = test_room();
        let session = Uuid::new_v4();
        let player = Uuid::new_v4();

        join(&mut room, session, player);
        let effects = room.handle_event(RoomEvent::Disconnected {
            session_id: session,
        });

        assert!(room.players.is_empty());
        assert!(room.sessions.is_empty());
        assert!(room.is_closed());
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::ReleaseSession(sid) if *sid == session)));
    }

    #[test]
    fn leave_with_players_remaining_broadcasts_and_stays_open() {
        let mut room = test_room();
        let (s1, p1) = (Uuid::new_v4(), Uuid::new_v4());
        let (s2, p2) = (Uuid::new_v4(), Uuid::new_v4());
        join(&mut room, s1, p1);
        join(&mut room, s2, p2);

        let effects = room.handle_event(RoomEvent::Disconnected { session_id: s1 });

        assert!(!room.is_closed());
        assert_eq!(room.players.len(), 1);
        let sends = sends_of(&effects);
        assert!(matches!(
            sends[0],
            (Recipients::All, ServerMsg::PlayerLeft { player_id }) if *player_id == p1
        ));
    }

    #[test]
    fn update_relays_to_everyone_but_the_sender() {
        let mut room = test_room();
        let session = Uuid::new_v4();
        let player = Uuid::new_v4();
        join(&mut room, session, player);
        let (x, y) = {
            let r = &room.players[&player];
            (r.x, r.y)
        };

        let effects = room.handle_event(RoomEvent::Message {
            session_id: session,
            msg: ClientMsg::Update {
                id: player,
                x: x + 10.0,
                y,
                angle: 1.5,
                health: 80,
                ammo: 25,
            },
            received_at: 10,
        });

        let sends = sends_of(&effects);
        match sends[0] {
            (Recipients::AllExcept(sid), ServerMsg::PlayerUpdate { health, ammo, .. }) => {
                assert_eq!(*sid, session);
                assert_eq!(*health, 80);
                assert_eq!(*ammo, 25);
            }
            other => panic!("unexpected effect: {:?}", other),
        }
        assert_eq!(room.players[&player].combat.health, 80);
    }

    #[test]
    fn update_cannot_restore_health_or_overfill_ammo() {
        let mut room = test_room();
        let session = Uuid::new_v4();
        let player = Uuid::new_v4();
        join(&mut room, session, player);
        let (x, y) = {
            let r = &room.players[&player];
            (r.x, r.y)
        };

        room.handle_event(RoomEvent::Message {
            session_id: session,
            msg: ClientMsg::Update {
                id: player,
                x,
                y,
                angle: 0.0,
                health: 40,
                ammo: 10,
            },
            received_at: 10,
        });
        room.handle_event(RoomEvent::Message {
            session_id: session,
            msg: ClientMsg::Update {
                id: player,
                x,
                y,
                angle: 0.0,
                health: 95,
                ammo: 99,
            },
            received_at: 20,
        });

        let record = &room.players[&player];
        assert_eq!(record.combat.health, 40);
        assert_eq!(record.ammo, MAX_AMMO);
    }

    #[test]
    fn implausible_position_jump_is_flagged_not_rejected() {
        let mut room = test_room();
        let session = Uuid::new_v4();
        let player = Uuid::new_v4();
        join(&mut room, session, player);
        let (x, y) = {
            let r = &room.players[&player];
            (r.x, r.y)
        };

        let effects = room.handle_event(RoomEvent::Message {
            session_id: session,
            msg: ClientMsg::Update {
                id: player,
                x: x + 5_000.0,
                y,
                angle: 0.0,
                health: 100,
                ammo: 30,
            },
            received_at: 10,
        });

        let record = &room.players[&player];
        assert_eq!(record.suspect_flags, 1);
        assert_eq!(record.x, x + 5_000.0);
        assert_eq!(sends_of(&effects).len(), 1);
    }

    #[test]
    fn update_for_unknown_player_is_dropped() {
        let mut room = test_room();
        let effects = room.handle_event(RoomEvent::Message {
            session_id: Uuid::new_v4(),
            msg: ClientMsg::Update {
                id: Uuid::new_v4(),
                x: 0.0,
                y: 0.0,
                angle: 0.0,
                health: 100,
                ammo: 30,
            },
            received_at: 10,
        });
        assert!(effects.is_empty());
    }

    fn shot_from(room: &BattleRoom, player: Uuid) -> (Position, Trajectory) {
        let record = &room.players[&player];
        let position = Position {
            x: record.x,
            y: record.y,
        };
        let trajectory = Trajectory {
            start_x: record.x,
            start_y: record.y,
            end_x: record.x + 300.0,
            end_y: record.y,
        };
        (position, trajectory)
    }

    #[test]
    fn accepted_shot_records_fire_time_and_broadcasts() {
        let mut room = test_room();
        let session = Uuid::new_v4();
        let player = Uuid::new_v4();
        join(&mut room, session, player);
        let (position, trajectory) = shot_from(&room, player);

        let effects = room.handle_event(RoomEvent::Message {
            session_id: session,
            msg: ClientMsg::Shot {
                player_id: player,
                position,
                trajectory,
                timestamp: None,
            },
            received_at: 1_000,
        });

        assert_eq!(room.players[&player].last_shot_at, Some(1_000));
        let sends = sends_of(&effects);
        assert!(matches!(sends[0], (Recipients::All, ServerMsg::Shot { .. })));
    }

    #[test]
    fn rapid_second_shot_is_flagged_but_still_broadcast() {
        let mut room = test_room();
        let session = Uuid::new_v4();
        let player = Uuid::new_v4();
        join(&mut room, session, player);
        let (position, trajectory) = shot_from(&room, player);

        let first = room.handle_event(RoomEvent::Message {
            session_id: session,
            msg: ClientMsg::Shot {
                player_id: player,
                position,
                trajectory,
                timestamp: None,
            },
            received_at: 1_000,
        });
        let second = room.handle_event(RoomEvent::Message {
            session_id: session,
            msg: ClientMsg::Shot {
                player_id: player,
                position,
                trajectory,
                timestamp: None,
            },
            received_at: 1_010,
        });

        // Both visuals went out, only the first counted
        assert_eq!(sends_of(&first).len(), 1);
        assert_eq!(sends_of(&second).len(), 1);
        let record = &room.players[&player];
        assert_eq!(record.suspect_flags, 1);
        assert_eq!(record.last_shot_at, Some(1_000));
    }

    fn hit(room: &mut BattleRoom, session: Uuid, attacker: Uuid, target: Uuid, damage: i32) -> Vec<Effect> {
        room.handle_event(RoomEvent::Message {
            session_id: session,
            msg: ClientMsg::Hit {
                player_id: attacker,
                target_id: target,
                weapon: "sniper".to_string(),
                damage,
            },
            received_at: 100,
        })
    }

    #[test]
    fn hit_applies_damage_and_broadcasts() {
        let mut room = test_room();
        let (s1, p1) = (Uuid::new_v4(), Uuid::new_v4());
        let (s2, p2) = (Uuid::new_v4(), Uuid::new_v4());
        join(&mut room, s1, p1);
        join(&mut room, s2, p2);

        let effects = hit(&mut room, s1, p1, p2, 30);

        assert_eq!(room.players[&p2].combat.health, 70);
        assert!(room.players[&p2].combat.alive);
        assert_eq!(room.players[&p1].kills, 0);
        let sends = sends_of(&effects);
        assert!(matches!(sends[0], (Recipients::All, ServerMsg::Hit { .. })));
    }

    #[test]
    fn lethal_hit_updates_kill_death_and_score_tallies() {
        let mut room = test_room();
        let (s1, p1) = (Uuid::new_v4(), Uuid::new_v4());
        let (s2, p2) = (Uuid::new_v4(), Uuid::new_v4());
        join(&mut room, s1, p1);
        join(&mut room, s2, p2);

        hit(&mut room, s1, p1, p2, 90);
        hit(&mut room, s1, p1, p2, 90);

        let target = &room.players[&p2];
        assert_eq!(target.combat.health, 0);
        assert!(!target.combat.alive);
        assert_eq!(target.deaths, 1);

        let attacker = &room.players[&p1];
        assert_eq!(attacker.kills, 1);
        // The killing blow lands clamped at 90 damage: 90 * 10 score
        assert_eq!(attacker.score, 900);
    }

    #[test]
    fn hit_on_dead_target_is_dropped() {
        let mut room = test_room();
        let (s1, p1) = (Uuid::new_v4(), Uuid::new_v4());
        let (s2, p2) = (Uuid::new_v4(), Uuid::new_v4());
        join(&mut room, s1, p1);
        join(&mut room, s2, p2);
        hit(&mut room, s1, p1, p2, 90);
        hit(&mut room, s1, p1, p2, 90);

        let effects = hit(&mut room, s1, p1, p2, 90);

        assert!(effects.is_empty());
        assert_eq!(room.players[&p1].kills, 1);
        assert_eq!(room.players[&p2].deaths, 1);
    }

    #[test]
    fn hit_damage_is_clamped_to_the_weapon_bound() {
        let mut room = test_room();
        let (s1, p1) = (Uuid::new_v4(), Uuid::new_v4());
        let (s2, p2) = (Uuid::new_v4(), Uuid::new_v4());
        join(&mut room, s1, p1);
        join(&mut room, s2, p2);

        room.handle_event(RoomEvent::Message {
            session_id: s1,
            msg: ClientMsg::Hit {
                player_id: p1,
                target_id: p2,
                weapon: "pistol".to_string(),
                damage: 500,
            },
            received_at: 100,
        });

        // Pistol caps at 25 per hit
        assert_eq!(room.players[&p2].combat.health, 75);
    }

    #[test]
    fn end_settles_reward_from_room_tallies_and_cleans_up() {
        let mut room = test_room();
        let session = Uuid::new_v4();
        let player = Uuid::new_v4();
        join(&mut room, session, player);
        {
            let record = room.players.get_mut(&player).unwrap();
            record.kills = 4;
            record.score = 230;
        }

        let effects = room.handle_event(RoomEvent::Message {
            session_id: session,
            msg: ClientMsg::End {
                player_id: player,
                score: 230,
                kills: 4,
            },
            received_at: 5_000,
        });

        let job = effects
            .iter()
            .find_map(|e| match e {
                Effect::Settle(job) => Some(job),
                _ => None,
            })
            .expect("settlement scheduled");
        assert_eq!(job.amount, 223);
        assert_eq!(job.session_id, session);
        assert!(job.reason.contains("4 kills"));

        assert!(room.players.is_empty());
        assert!(room.sessions.is_empty());
        assert!(room.is_closed());
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::ReleaseSession(sid) if *sid == session)));
    }

    #[test]
    fn end_for_unknown_player_is_dropped() {
        let mut room = test_room();
        let effects = room.handle_event(RoomEvent::Message {
            session_id: Uuid::new_v4(),
            msg: ClientMsg::End {
                player_id: Uuid::new_v4(),
                score: 0,
                kills: 0,
            },
            received_at: 5_000,
        });
        assert!(effects.is_empty());
    }

    fn melee(
        room: &mut BattleRoom,
        session: Uuid,
        player: Uuid,
        target: Option<Uuid>,
        action: MeleeActionKind,
    ) -> Vec<Effect> {
        room.handle_event(RoomEvent::Message {
            session_id: session,
            msg: ClientMsg::Melee {
                player_id: player,
                target_id: target,
                action,
                effects: Vec::new(),
            },
            received_at: 200,
        })
    }

    #[test]
    fn melee_defend_costs_stamina_and_broadcasts_result() {
        let mut room = test_room();
        let session = Uuid::new_v4();
        let player = Uuid::new_v4();
        join(&mut room, session, player);

        let effects = melee(&mut room, session, player, None, MeleeActionKind::Defend);

        let record = &room.players[&player];
        assert_eq!(record.combat.stamina, 85.0);
        assert_eq!(record.combat.armor, 30.0);
        let sends = sends_of(&effects);
        assert!(matches!(
            sends[0],
            (Recipients::All, ServerMsg::MeleeResult { success: true, .. })
        ));
    }

    #[test]
    fn melee_attack_without_target_reports_failure() {
        let mut room = test_room();
        let session = Uuid::new_v4();
        let player = Uuid::new_v4();
        join(&mut room, session, player);

        let effects = melee(&mut room, session, player, None, MeleeActionKind::Attack);

        match &sends_of(&effects)[0] {
            (_, ServerMsg::MeleeResult { success, message, .. }) => {
                assert!(!success);
                assert_eq!(message, "No target");
            }
            other => panic!("unexpected effect: {:?}", other),
        }
    }

    #[test]
    fn melee_attack_spends_stamina_and_reports_an_exchange() {
        let mut room = test_room();
        let (s1, p1) = (Uuid::new_v4(), Uuid::new_v4());
        let (s2, p2) = (Uuid::new_v4(), Uuid::new_v4());
        join(&mut room, s1, p1);
        join(&mut room, s2, p2);

        let effects = melee(&mut room, s1, p1, Some(p2), MeleeActionKind::Attack);

        assert_eq!(room.players[&p1].combat.stamina, 95.0);
        let sends = sends_of(&effects);
        match sends[0] {
            (Recipients::All, ServerMsg::MeleeResult { success, .. }) => assert!(success),
            other => panic!("unexpected effect: {:?}", other),
        }
    }

    #[test]
    fn stunned_attacker_spends_the_turn_recovering() {
        let mut room = test_room();
        let (s1, p1) = (Uuid::new_v4(), Uuid::new_v4());
        let (s2, p2) = (Uuid::new_v4(), Uuid::new_v4());
        join(&mut room, s1, p1);
        join(&mut room, s2, p2);
        room.players.get_mut(&p1).unwrap().combat.stunned = true;

        let effects = melee(&mut room, s1, p1, Some(p2), MeleeActionKind::Attack);

        let record = &room.players[&p1];
        assert!(!record.combat.stunned);
        assert_eq!(record.combat.stamina, 100.0);
        match &sends_of(&effects)[0] {
            (_, ServerMsg::MeleeResult { success, message, .. }) => {
                assert!(!success);
                assert_eq!(message, "Stunned");
            }
            other => panic!("unexpected effect: {:?}", other),
        }
    }

    fn test_config() -> Config {
        Config {
            server_addr: "127.0.0.1:0".parse().unwrap(),
            log_level: "info".to_string(),
            ledger_url: "http://127.0.0.1:9".to_string(),
            ledger_service_key: "test-key".to_string(),
            client_origin: "http://localhost:3000".to_string(),
        }
    }

    async fn wait_for<F: Fn() -> bool>(predicate: F) {
        for _ in 0..100 {
            if predicate() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn registry_reuses_rooms_with_open_slots() {
        let registry = Arc::new(RoomRegistry::new());
        let ledger = LedgerClient::new(&test_config());

        let first = registry.find_or_create(&ledger);
        let session = Uuid::new_v4();
        registry.bind_session(session, first.id);
        first
            .event_tx
            .send(RoomEvent::Message {
                session_id: session,
                msg: ClientMsg::Join {
                    player_id: Uuid::new_v4(),
                    difficulty: Difficulty::Normal,
                },
                received_at: 0,
            })
            .await
            .unwrap();

        let first_id = first.id;
        let reg = registry.clone();
        wait_for(move || reg.get(&first_id).map(|h| h.player_count()) == Some(1)).await;

        let second = registry.find_or_create(&ledger);
        assert_eq!(second.id, first.id);
        assert_eq!(registry.active_rooms(), 1);
    }

    #[tokio::test]
    async fn room_is_evicted_after_its_last_player_disconnects() {
        let registry = Arc::new(RoomRegistry::new());
        let ledger = LedgerClient::new(&test_config());

        let handle = registry.find_or_create(&ledger);
        let session = Uuid::new_v4();
        registry.bind_session(session, handle.id);
        handle
            .event_tx
            .send(RoomEvent::Message {
                session_id: session,
                msg: ClientMsg::Join {
                    player_id: Uuid::new_v4(),
                    difficulty: Difficulty::Normal,
                },
                received_at: 0,
            })
            .await
            .unwrap();
        handle
            .event_tx
            .send(RoomEvent::Disconnected {
                session_id: session,
            })
            .await
            .unwrap();

        let reg = registry.clone();
        wait_for(move || reg.active_rooms() == 0).await;
        assert_eq!(registry.room_for_session(&session), None);
    }
}
