//! The synchronization service.
//!
//! [`Game`] owns the entity store, the session registry and the broadcaster.
//! It is constructed explicitly and shared behind an `Arc` by every network
//! task, so tests can run as many independent instances as they like.

use crate::bots::{run_bot_tick, BotTickReport};
use crate::broadcast::{compute_metrics, Broadcaster};
use crate::config::ServerConfig;
use crate::entity::{Entity, EntityFlags};
use crate::entity_store::EntityStore;
use crate::movement::{process_absolute_move, process_input, InputOutcome};
use crate::session::SessionRegistry;
use crate::transport::{Payload, Transport};
use log::{debug, info, warn};
use rand::Rng;
use shared::{
    decode_client_message, encode_server_message, ClientMessage, EntityId, Metrics, ServerMessage,
    Vec3,
};
use std::net::SocketAddr;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Instant;

pub struct Game {
    pub(crate) config: ServerConfig,
    pub(crate) store: EntityStore,
    pub(crate) sessions: SessionRegistry,
    pub(crate) broadcaster: Broadcaster,
    pub(crate) transport: Arc<dyn Transport>,
    /// Benchmark bot slots claimed by spawns still in progress.
    pub(crate) benchmark_reserved: AtomicUsize,
    started: Instant,
}

impl Game {
    pub fn new(config: ServerConfig, transport: Arc<dyn Transport>) -> Self {
        let started = Instant::now();
        Self {
            sessions: SessionRegistry::new(config.admin_hosts.clone()),
            store: EntityStore::new(),
            broadcaster: Broadcaster::new(Arc::clone(&transport), started),
            transport,
            benchmark_reserved: AtomicUsize::new(0),
            config,
            started,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    /// Decodes and handles one datagram. Malformed input is dropped.
    pub async fn handle_datagram(&self, addr: SocketAddr, data: &[u8]) {
        match decode_client_message(data) {
            Ok(message) => self.handle_message(addr, message, Instant::now()).await,
            Err(e) => debug!("Dropping malformed message from {}: {}", addr, e),
        }
    }

    /// Routes a decoded message from `addr`.
    pub async fn handle_message(&self, addr: SocketAddr, message: ClientMessage, now: Instant) {
        let session = self.sessions.register_or_get(addr, now);

        match message {
            ClientMessage::Join { name } => {
                self.join(addr, &name, EntityFlags::PLAYER, now);
            }
            ClientMessage::AdminJoin { name } => {
                if session.privileged {
                    self.join(addr, &name, EntityFlags::ADMIN, now);
                } else {
                    debug!("Ignoring admin_join from unprivileged endpoint {}", addr);
                }
            }
            ClientMessage::Input {
                seq, x, y, speed, ..
            } => {
                let outcome = process_input(
                    &self.sessions,
                    &self.store,
                    &self.config,
                    addr,
                    seq,
                    x,
                    y,
                    speed,
                    now,
                );
                self.after_movement(outcome, now);
            }
            ClientMessage::Move { x, y, z } => {
                let outcome = process_absolute_move(
                    &self.sessions,
                    &self.store,
                    &self.config,
                    addr,
                    Vec3::new(x, y, z),
                    now,
                );
                self.after_movement(outcome, now);
            }
            ClientMessage::Leave => self.disconnect(addr),
            // Liveness was refreshed by register_or_get.
            ClientMessage::Heartbeat => {}
            admin => self.handle_admin(&session, admin, now).await,
        }
    }

    fn after_movement(&self, outcome: InputOutcome, now: Instant) {
        if outcome.is_applied() {
            self.request_broadcast(now);
        }
    }

    /// Creates an entity for `addr` and acknowledges it with `join_ack`.
    ///
    /// A session that already controls an entity gets a fresh one; the old
    /// entity is removed.
    pub fn join(
        &self,
        addr: SocketAddr,
        name: &str,
        flags: EntityFlags,
        now: Instant,
    ) -> Option<EntityId> {
        self.sessions.register_or_get(addr, now);
        if !flags.is_admin {
            let players = self.store.count_where(Entity::is_real_player);
            let rejoining = self
                .sessions
                .entity_of(addr)
                .and_then(|id| self.store.get(id))
                .map_or(false, |entity| entity.is_real_player());
            if players >= self.config.max_players && !rejoining {
                warn!(
                    "Refusing join from {}: {} players already connected",
                    addr, players
                );
                return None;
            }
        }

        self.attach_entity(addr, name, flags, now)
    }

    /// Inserts the joining entity and binds it to the session at `addr`.
    ///
    /// If the session disappeared since it was registered the entity is
    /// removed again and no `join_ack` is sent.
    pub(crate) fn attach_entity(
        &self,
        addr: SocketAddr,
        name: &str,
        flags: EntityFlags,
        now: Instant,
    ) -> Option<EntityId> {
        let id = self.store.allocate_id();
        self.store
            .insert(Entity::new(id, name, Vec3::ZERO, flags, now));
        match self.sessions.bind_entity(addr, id) {
            Ok(Some(previous)) => {
                self.store.remove(previous);
                info!("Session {} replaced entity {} with {}", addr, previous, id);
            }
            Ok(None) => {}
            Err(e) => {
                self.store.remove(id);
                warn!("Dropping join of {}: {}", name, e);
                return None;
            }
        }
        info!(
            "{} {} joined as entity {} from {}",
            if flags.is_admin { "Admin" } else { "Player" },
            name,
            id,
            addr
        );

        self.send_to(addr, &ServerMessage::JoinAck { id });
        self.request_broadcast(now);
        Some(id)
    }

    /// Removes the session at `addr` and the entity it controls.
    pub fn disconnect(&self, addr: SocketAddr) {
        if let Some(session) = self.sessions.remove(addr) {
            if let Some(id) = session.entity_id {
                self.store.remove(id);
                info!("Entity {} left", id);
            }
        }
    }

    /// Removes an entity and, if a client controls it, its session.
    ///
    /// The client is told it was kicked on a best-effort basis. Returns false
    /// when the id is unknown.
    pub fn remove_entity(&self, id: EntityId, reason: &str) -> bool {
        let removed = self.store.remove(id).is_some();
        if let Some(session) = self.sessions.remove_by_entity(id) {
            self.send_to(
                session.addr,
                &ServerMessage::Kicked {
                    reason: reason.to_string(),
                },
            );
        }
        removed
    }

    /// Encodes and queues a message for one endpoint. Failures are logged only.
    pub fn send_to(&self, addr: SocketAddr, message: &ServerMessage) {
        let payload = match encode_server_message(message) {
            Ok(bytes) => Payload::from(bytes),
            Err(e) => {
                warn!("Failed to encode message for {}: {}", addr, e);
                return;
            }
        };
        if let Err(e) = self.transport.send(addr, payload) {
            warn!("Send to {} failed: {}", addr, e);
        }
    }

    /// Throttled broadcast. Returns whether a snapshot went out.
    pub fn request_broadcast(&self, now: Instant) -> bool {
        self.broadcaster
            .request(&self.store, &self.sessions, &self.config, now)
    }

    /// Unthrottled broadcast, used after admin actions.
    pub fn force_broadcast(&self, now: Instant) {
        self.broadcaster
            .force(&self.store, &self.sessions, &self.config, now);
    }

    /// Advances every active bot once and requests a broadcast if any moved.
    pub fn tick_bots<R: Rng>(&self, rng: &mut R, now: Instant) -> BotTickReport {
        let report = run_bot_tick(&self.store, &self.config, rng, now);
        if report.any_moved() {
            self.request_broadcast(now);
        }
        report
    }

    /// Drops sessions that went quiet and removes their entities.
    pub fn expire_sessions(&self, now: Instant) -> usize {
        let expired = self
            .sessions
            .take_timed_out(self.config.session_timeout, now);
        for session in &expired {
            info!("Session {} timed out", session.addr);
            if let Some(id) = session.entity_id {
                self.store.remove(id);
            }
        }
        if !expired.is_empty() {
            self.request_broadcast(now);
        }
        expired.len()
    }

    pub fn metrics(&self, now: Instant) -> Metrics {
        compute_metrics(
            &self.store.snapshot(),
            self.sessions.len(),
            now.saturating_duration_since(self.started),
        )
    }
}
