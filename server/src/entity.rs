use shared::{BotBehavior, EntityId, EntitySnapshot, Vec3, MAX_NAME_LEN};
use std::time::Instant;

/// AI state carried only by bots.
#[derive(Debug, Clone)]
pub struct BotState {
    pub behavior: BotBehavior,
    pub follow_target: Option<EntityId>,
    pub speed: f32,
    /// Unit direction on the XZ plane used by `Random`.
    pub move_direction: Option<(f32, f32)>,
    pub last_behavior_change: Instant,
    /// When `Random` picks its next direction; re-rolled per bot.
    pub next_direction_change: Instant,
    pub patrol_waypoints: Vec<Vec3>,
    pub current_waypoint: usize,
}

impl BotState {
    pub fn new(behavior: BotBehavior, speed: f32, now: Instant) -> Self {
        Self {
            behavior,
            follow_target: None,
            speed,
            move_direction: None,
            last_behavior_change: now,
            next_direction_change: now,
            patrol_waypoints: Vec::new(),
            current_waypoint: 0,
        }
    }
}

/// Square patrol loop around `center`, starting at the (+x, +z) corner.
pub fn patrol_square(center: Vec3, half_size: f32) -> Vec<Vec3> {
    vec![
        Vec3::new(center.x + half_size, center.y, center.z + half_size),
        Vec3::new(center.x - half_size, center.y, center.z + half_size),
        Vec3::new(center.x - half_size, center.y, center.z - half_size),
        Vec3::new(center.x + half_size, center.y, center.z - half_size),
    ]
}

/// Patrol loop for a freshly spawned bot: the spawn point, then the square
/// around it, so every cycle passes through where the bot started.
pub fn spawn_patrol_loop(spawn: Vec3, half_size: f32) -> Vec<Vec3> {
    let mut waypoints = Vec::with_capacity(5);
    waypoints.push(spawn);
    waypoints.extend(patrol_square(spawn, half_size));
    waypoints
}

/// Half-width of the waypoint square generated for `Patrol`.
pub const PATROL_HALF_SIZE: f32 = 3.0;

/// What kind of entity this is. Bots are always NPCs too.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EntityFlags {
    pub is_admin: bool,
    pub is_npc: bool,
    pub is_bot: bool,
}

impl EntityFlags {
    pub const PLAYER: EntityFlags = EntityFlags {
        is_admin: false,
        is_npc: false,
        is_bot: false,
    };
    pub const ADMIN: EntityFlags = EntityFlags {
        is_admin: true,
        is_npc: false,
        is_bot: false,
    };
    pub const NPC: EntityFlags = EntityFlags {
        is_admin: false,
        is_npc: true,
        is_bot: false,
    };
    pub const BOT: EntityFlags = EntityFlags {
        is_admin: false,
        is_npc: true,
        is_bot: true,
    };
}

/// A simulated object in the world: player, admin, NPC or bot
#[derive(Debug, Clone)]
pub struct Entity {
    pub id: EntityId,
    pub name: String,
    pub position: Vec3,
    pub last_update: Instant,
    pub flags: EntityFlags,
    /// Client movement is rejected until this deadline passes.
    pub server_authority_until: Option<Instant>,
    pub bot: Option<BotState>,
}

impl Entity {
    pub fn new(id: EntityId, name: &str, position: Vec3, flags: EntityFlags, now: Instant) -> Self {
        Self {
            id,
            name: truncate_name(name),
            position,
            last_update: now,
            flags,
            server_authority_until: None,
            bot: None,
        }
    }

    pub fn new_bot(id: EntityId, name: &str, position: Vec3, bot: BotState, now: Instant) -> Self {
        let mut entity = Self::new(id, name, position, EntityFlags::BOT, now);
        entity.bot = Some(bot);
        entity
    }

    pub fn set_position(&mut self, position: Vec3, now: Instant) {
        self.position = position;
        self.last_update = now;
    }

    pub fn is_under_server_authority(&self, now: Instant) -> bool {
        self.server_authority_until
            .map_or(false, |deadline| now < deadline)
    }

    /// Bot with a behavior other than Idle.
    pub fn is_active_bot(&self) -> bool {
        self.flags.is_bot
            && self
                .bot
                .as_ref()
                .map_or(false, |bot| bot.behavior != BotBehavior::Idle)
    }

    /// A human-controlled player (not admin, not NPC).
    pub fn is_real_player(&self) -> bool {
        !self.flags.is_npc && !self.flags.is_admin
    }

    pub fn snapshot(&self) -> EntitySnapshot {
        EntitySnapshot {
            id: self.id,
            name: self.name.clone(),
            x: self.position.x,
            y: self.position.y,
            z: self.position.z,
            is_npc: self.flags.is_npc,
        }
    }
}

/// Cuts a display name down to `MAX_NAME_LEN` characters.
pub fn truncate_name(name: &str) -> String {
    name.chars().take(MAX_NAME_LEN).collect()
}
