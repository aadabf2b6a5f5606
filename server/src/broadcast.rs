//! Throttled snapshot broadcasting.
//!
//! Requests arrive after every accepted input, admin action and bot tick. At
//! most one request per throttle interval turns into a fan-out; the rest are
//! dropped because the next honored broadcast carries the latest state anyway.

use crate::config::{ServerConfig, BENCHMARK_BOT_PREFIX};
use crate::entity::Entity;
use crate::entity_store::EntityStore;
use crate::session::{Session, SessionRegistry};
use crate::transport::{Payload, Transport};
use log::{debug, warn};
use shared::{encode_server_message, EntitySnapshot, Metrics, ServerMessage};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Minimum gap between honored broadcasts for a given world size.
pub fn throttle_interval(entity_count: usize) -> Duration {
    let millis = match entity_count {
        0..=50 => 50,
        51..=100 => 75,
        101..=150 => 100,
        _ => 200,
    };
    Duration::from_millis(millis)
}

/// Lock-free "last broadcast" timestamp.
///
/// Stored as microseconds since `origin` plus one, so zero means "never".
pub struct Throttle {
    origin: Instant,
    last_micros: AtomicU64,
}

impl Throttle {
    pub fn new(origin: Instant) -> Self {
        Self {
            origin,
            last_micros: AtomicU64::new(0),
        }
    }

    fn stamp(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.origin).as_micros() as u64 + 1
    }

    /// Claims the broadcast slot if `interval` has passed since the last one.
    ///
    /// Concurrent callers race on a compare-exchange; exactly one wins.
    pub fn try_acquire(&self, interval: Duration, now: Instant) -> bool {
        let stamp = self.stamp(now);
        let interval = interval.as_micros() as u64;
        let mut last = self.last_micros.load(Ordering::Acquire);
        loop {
            if last != 0 && stamp.saturating_sub(last) < interval {
                return false;
            }
            match self.last_micros.compare_exchange_weak(
                last,
                stamp,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(current) => last = current,
            }
        }
    }

    /// Records an unthrottled broadcast.
    pub fn mark(&self, now: Instant) {
        self.last_micros.fetch_max(self.stamp(now), Ordering::AcqRel);
    }
}

/// Benchmark bots are the first thing dropped from a degraded snapshot.
fn is_named_entity(entity: &Entity) -> bool {
    !entity.flags.is_bot || !entity.name.starts_with(BENCHMARK_BOT_PREFIX)
}

/// Turns copied entities into the wire list, degrading above the safety ceiling.
///
/// Returns the snapshot list and whether it was degraded.
pub fn build_snapshot(mut entities: Vec<Entity>, config: &ServerConfig) -> (Vec<EntitySnapshot>, bool) {
    entities.sort_by_key(|entity| entity.id);

    if entities.len() > config.snapshot_safety_ceiling {
        let players: Vec<EntitySnapshot> = entities
            .iter()
            .filter(|entity| is_named_entity(entity))
            .take(config.degraded_snapshot_cap)
            .map(Entity::snapshot)
            .collect();
        return (players, true);
    }

    (entities.iter().map(Entity::snapshot).collect(), false)
}

/// Rough heap footprint of the simulation state in kilobytes.
fn approximate_memory_kb(entities: &[Entity], session_count: usize) -> u64 {
    let entity_bytes: usize = entities
        .iter()
        .map(|entity| {
            std::mem::size_of::<Entity>()
                + entity.name.capacity()
                + entity
                    .bot
                    .as_ref()
                    .map_or(0, |bot| bot.patrol_waypoints.capacity() * std::mem::size_of::<shared::Vec3>())
        })
        .sum();
    let session_bytes = session_count * std::mem::size_of::<Session>();
    ((entity_bytes + session_bytes) / 1024) as u64
}

pub fn compute_metrics(entities: &[Entity], session_count: usize, uptime: Duration) -> Metrics {
    let interval = throttle_interval(entities.len());
    Metrics {
        total_entities: entities.len(),
        real_players: entities.iter().filter(|e| e.is_real_player()).count(),
        bots: entities.iter().filter(|e| e.flags.is_bot).count(),
        active_bots: entities.iter().filter(|e| e.is_active_bot()).count(),
        memory_usage_kb: approximate_memory_kb(entities, session_count),
        update_rate_hz: 1000.0 / interval.as_millis() as f32,
        uptime_secs: uptime.as_secs(),
    }
}

/// Owns the throttle and performs the snapshot, encode and fan-out sequence.
pub struct Broadcaster {
    throttle: Throttle,
    started: Instant,
    transport: Arc<dyn Transport>,
    honored: AtomicU64,
}

impl Broadcaster {
    pub fn new(transport: Arc<dyn Transport>, started: Instant) -> Self {
        Self {
            throttle: Throttle::new(started),
            started,
            transport,
            honored: AtomicU64::new(0),
        }
    }

    /// Number of broadcasts actually fanned out.
    pub fn honored_count(&self) -> u64 {
        self.honored.load(Ordering::Relaxed)
    }

    /// Broadcasts if the adaptive throttle allows it. Returns whether it did.
    pub fn request(
        &self,
        store: &EntityStore,
        sessions: &SessionRegistry,
        config: &ServerConfig,
        now: Instant,
    ) -> bool {
        if !self.throttle.try_acquire(throttle_interval(store.len()), now) {
            return false;
        }
        self.send_snapshot(store, sessions, config, now);
        true
    }

    /// Broadcasts immediately, ignoring the throttle.
    pub fn force(
        &self,
        store: &EntityStore,
        sessions: &SessionRegistry,
        config: &ServerConfig,
        now: Instant,
    ) {
        self.throttle.mark(now);
        self.send_snapshot(store, sessions, config, now);
    }

    /// Builds the `state` payload. Entity state is copied out first; encoding
    /// happens with no map locks held.
    pub fn encode_state(
        &self,
        store: &EntityStore,
        session_count: usize,
        config: &ServerConfig,
        now: Instant,
    ) -> Result<Payload, serde_json::Error> {
        let entities = store.snapshot();
        let metrics = compute_metrics(
            &entities,
            session_count,
            now.saturating_duration_since(self.started),
        );
        let total = entities.len();
        let (players, degraded) = build_snapshot(entities, config);
        if degraded {
            warn!(
                "{} entities exceed snapshot ceiling {}; broadcasting {} named entities only",
                total,
                config.snapshot_safety_ceiling,
                players.len()
            );
        }

        let bytes = encode_server_message(&ServerMessage::State { players, metrics })?;
        Ok(Payload::from(bytes))
    }

    fn send_snapshot(
        &self,
        store: &EntityStore,
        sessions: &SessionRegistry,
        config: &ServerConfig,
        now: Instant,
    ) {
        let recipients = sessions.endpoints();
        if recipients.is_empty() {
            return;
        }

        let payload = match self.encode_state(store, recipients.len(), config, now) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to encode state snapshot: {}", e);
                return;
            }
        };

        let failures = self.transport.broadcast(&recipients, payload);
        for (addr, e) in &failures {
            warn!("Broadcast to {} failed: {}", addr, e);
        }
        self.honored.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Broadcast state to {} endpoints ({} failed)",
            recipients.len(),
            failures.len()
        );
    }
}
