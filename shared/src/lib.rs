use serde::{Deserialize, Serialize};

/// Half-extent of the square play area on the XZ plane.
pub const WORLD_BOUND: f32 = 50.0;
/// Ground level; y never goes below this.
pub const GROUND_Y: f32 = 0.0;
/// Display names are truncated to this many characters.
pub const MAX_NAME_LEN: usize = 16;
/// Fixed integration step applied to every accepted `input` (20Hz).
pub const INPUT_TICK_DELTA: f32 = 0.05;
pub const DEFAULT_PORT: u16 = 8080;

/// Entity identifier, unique for the lifetime of the server process.
pub type EntityId = u32;

/// A position in world space. Movement happens on the XZ plane.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3 {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }

    /// Distance ignoring the vertical axis.
    pub fn planar_distance(&self, other: &Vec3) -> f32 {
        let dx = other.x - self.x;
        let dz = other.z - self.z;
        (dx * dx + dz * dz).sqrt()
    }

    /// Clamps x/z into `[-bound, bound]` and keeps y at or above ground.
    pub fn clamp_to_world(self, bound: f32) -> Vec3 {
        Vec3 {
            x: self.x.clamp(-bound, bound),
            y: self.y.max(GROUND_Y),
            z: self.z.clamp(-bound, bound),
        }
    }

    /// Moves toward `target` on the XZ plane by at most `max_step`, never overshooting.
    pub fn step_toward(self, target: &Vec3, max_step: f32) -> Vec3 {
        let distance = self.planar_distance(target);
        if distance <= max_step || distance == 0.0 {
            return Vec3 {
                x: target.x,
                y: self.y,
                z: target.z,
            };
        }
        let scale = max_step / distance;
        Vec3 {
            x: self.x + (target.x - self.x) * scale,
            y: self.y,
            z: self.z + (target.z - self.z) * scale,
        }
    }
}

/// Scales a planar input vector down to unit length when it is longer than 1.
///
/// Shorter vectors are left untouched so analog input keeps its magnitude.
pub fn clamp_input_vector(dx: f32, dy: f32) -> (f32, f32) {
    let magnitude = (dx * dx + dy * dy).sqrt();
    if magnitude > 1.0 {
        (dx / magnitude, dy / magnitude)
    } else {
        (dx, dy)
    }
}

/// Bot AI state. Transitions only happen through admin commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BotBehavior {
    #[default]
    #[serde(alias = "Idle")]
    Idle,
    #[serde(alias = "Random")]
    Random,
    #[serde(alias = "Follow")]
    Follow,
    #[serde(alias = "Patrol")]
    Patrol,
}

fn default_spread_radius() -> f32 {
    20.0
}

/// Messages sent from clients to the server, discriminated by `op`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientMessage {
    Join {
        name: String,
    },
    /// Relative movement. `x`/`y` are the planar input axes, not a position.
    Input {
        seq: u32,
        x: f32,
        y: f32,
        speed: f32,
        #[serde(default)]
        time: f64,
    },
    /// Deprecated absolute position update. Prefer `Input`.
    Move {
        x: f32,
        y: f32,
        z: f32,
    },
    Leave,
    #[serde(alias = "ping")]
    Heartbeat,

    AdminJoin {
        name: String,
    },
    AdminSpawnNpc {
        name: String,
        x: f32,
        y: f32,
        z: f32,
    },
    AdminSpawnBot {
        name: String,
        x: f32,
        y: f32,
        z: f32,
        #[serde(default)]
        behavior: BotBehavior,
    },
    AdminControlBot {
        #[serde(rename = "botId")]
        bot_id: EntityId,
        x: f32,
        y: f32,
        z: f32,
    },
    AdminBotBehavior {
        #[serde(rename = "botId")]
        bot_id: EntityId,
        behavior: BotBehavior,
        #[serde(rename = "targetId", default)]
        target_id: Option<EntityId>,
    },
    AdminTeleport {
        #[serde(rename = "playerId")]
        player_id: EntityId,
        x: f32,
        y: f32,
        z: f32,
    },
    AdminTeleportAll {
        x: f32,
        y: f32,
        z: f32,
    },
    AdminKick {
        #[serde(rename = "playerId")]
        player_id: EntityId,
    },
    AdminKickAll,
    AdminSpawnBenchmarkBots {
        count: u32,
        #[serde(default)]
        behavior: BotBehavior,
        #[serde(rename = "spreadRadius", default = "default_spread_radius")]
        spread_radius: f32,
    },
    AdminClearBenchmarkBots,
}

impl ClientMessage {
    /// True for every op that requires an admin session.
    pub fn is_admin_op(&self) -> bool {
        matches!(
            self,
            ClientMessage::AdminSpawnNpc { .. }
                | ClientMessage::AdminSpawnBot { .. }
                | ClientMessage::AdminControlBot { .. }
                | ClientMessage::AdminBotBehavior { .. }
                | ClientMessage::AdminTeleport { .. }
                | ClientMessage::AdminTeleportAll { .. }
                | ClientMessage::AdminKick { .. }
                | ClientMessage::AdminKickAll
                | ClientMessage::AdminSpawnBenchmarkBots { .. }
                | ClientMessage::AdminClearBenchmarkBots
        )
    }
}

/// One entity as it appears in a `state` broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub id: EntityId,
    pub name: String,
    pub x: f32,
    pub y: f32,
    pub z: f32,
    #[serde(rename = "isNPC")]
    pub is_npc: bool,
}

/// Server health figures attached to every `state` broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Metrics {
    pub total_entities: usize,
    pub real_players: usize,
    pub bots: usize,
    pub active_bots: usize,
    pub memory_usage_kb: u64,
    pub update_rate_hz: f32,
    pub uptime_secs: u64,
}

/// Messages sent from the server to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ServerMessage {
    JoinAck {
        id: EntityId,
    },
    State {
        players: Vec<EntitySnapshot>,
        metrics: Metrics,
    },
    Kicked {
        reason: String,
    },
}

pub fn decode_client_message(data: &[u8]) -> Result<ClientMessage, serde_json::Error> {
    serde_json::from_slice(data)
}

pub fn encode_client_message(message: &ClientMessage) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(message)
}

pub fn decode_server_message(data: &[u8]) -> Result<ServerMessage, serde_json::Error> {
    serde_json::from_slice(data)
}

pub fn encode_server_message(message: &ServerMessage) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(message)
}
