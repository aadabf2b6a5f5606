//! Server tunables and command line parsing.

use clap::Parser;
use shared::{DEFAULT_PORT, INPUT_TICK_DELTA, WORLD_BOUND};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

/// How long client movement is ignored after the server forcibly moves an entity.
pub const SERVER_AUTHORITY_WINDOW: Duration = Duration::from_secs(2);

/// Name prefix given to bots created by `admin_spawn_benchmark_bots`.
pub const BENCHMARK_BOT_PREFIX: &str = "Bench_";

/// Every knob the simulation, broadcast and admin paths read.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Half-extent of the world on x and z.
    pub world_bound: f32,
    pub authority_window: Duration,
    /// Integration step used for every accepted input, regardless of send rate.
    pub input_tick_delta: f32,
    /// Inputs arriving faster than this from one session are dropped.
    pub min_input_interval: Duration,
    pub max_input_speed: f32,
    pub bot_tick: Duration,
    pub max_active_bots_per_tick: usize,
    pub bot_speed_range: (f32, f32),
    pub movement_epsilon: f32,
    /// Above this many entities the broadcast only carries real entities.
    pub snapshot_safety_ceiling: usize,
    pub degraded_snapshot_cap: usize,
    pub max_benchmark_bots: usize,
    pub max_total_entities: usize,
    pub benchmark_batch_size: usize,
    pub benchmark_batch_delay: Duration,
    pub session_timeout: Duration,
    pub timeout_check_interval: Duration,
    pub max_players: usize,
    pub receiver_workers: usize,
    /// Endpoints from these hosts may issue `admin_join`.
    pub admin_hosts: Vec<IpAddr>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: format!("127.0.0.1:{}", DEFAULT_PORT),
            world_bound: WORLD_BOUND,
            authority_window: SERVER_AUTHORITY_WINDOW,
            input_tick_delta: INPUT_TICK_DELTA,
            min_input_interval: Duration::from_millis(10),
            max_input_speed: 10.0,
            bot_tick: Duration::from_millis(100),
            max_active_bots_per_tick: 200,
            bot_speed_range: (2.0, 6.0),
            movement_epsilon: 0.001,
            snapshot_safety_ceiling: 800,
            degraded_snapshot_cap: 100,
            max_benchmark_bots: 500,
            max_total_entities: 800,
            benchmark_batch_size: 50,
            benchmark_batch_delay: Duration::from_millis(10),
            session_timeout: Duration::from_secs(30),
            timeout_check_interval: Duration::from_secs(1),
            max_players: 64,
            receiver_workers: 4,
            admin_hosts: vec![
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                IpAddr::V6(Ipv6Addr::LOCALHOST),
            ],
        }
    }
}

impl ServerConfig {
    /// Seconds advanced per bot tick.
    pub fn bot_tick_delta(&self) -> f32 {
        self.bot_tick.as_secs_f32()
    }
}

/// Command line arguments for the server binary
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Server IP address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    pub host: String,

    /// Server port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Bot update period in milliseconds
    #[arg(long, default_value = "100")]
    pub bot_tick_ms: u64,

    /// Seconds without input or heartbeat before a session is dropped
    #[arg(long, default_value = "30")]
    pub session_timeout_secs: u64,

    /// Maximum number of joined players
    #[arg(short, long, default_value = "64")]
    pub max_players: usize,

    /// Number of tasks reading from the socket in parallel
    #[arg(long, default_value = "4")]
    pub receiver_workers: usize,

    /// Hosts allowed to become admins (repeatable)
    #[arg(long = "admin-host")]
    pub admin_hosts: Vec<IpAddr>,
}

impl Args {
    pub fn into_config(self) -> ServerConfig {
        let mut config = ServerConfig {
            bind_addr: format!("{}:{}", self.host, self.port),
            bot_tick: Duration::from_millis(self.bot_tick_ms.max(1)),
            session_timeout: Duration::from_secs(self.session_timeout_secs),
            max_players: self.max_players,
            receiver_workers: self.receiver_workers.max(1),
            ..ServerConfig::default()
        };
        if !self.admin_hosts.is_empty() {
            config.admin_hosts = self.admin_hosts;
        }
        config
    }
}
