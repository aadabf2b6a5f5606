//! Privileged world manipulation.
//!
//! Every admin op is checked against the issuing session's entity and is
//! silently ignored for non-admins. Each accepted op ends with an unthrottled
//! broadcast so the change is visible immediately.

use crate::config::BENCHMARK_BOT_PREFIX;
use crate::entity::{patrol_square, spawn_patrol_loop, BotState, Entity, EntityFlags, PATROL_HALF_SIZE};
use crate::game::Game;
use crate::session::Session;
use log::{debug, info, warn};
use rand::Rng;
use shared::{BotBehavior, ClientMessage, EntityId, Vec3};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

/// Benchmark slots claimed but not yet filled. Unused slots are handed back
/// on drop, including when the spawning future is cancelled.
struct Reservation<'a> {
    counter: &'a AtomicUsize,
    remaining: usize,
}

impl Reservation<'_> {
    /// Call right after the reserved entity was inserted into the store.
    fn release_one(&mut self) {
        if self.remaining > 0 {
            self.remaining -= 1;
            self.counter.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.remaining > 0 {
            self.counter.fetch_sub(self.remaining, Ordering::AcqRel);
        }
    }
}

impl Game {
    fn is_admin_session(&self, session: &Session) -> bool {
        session
            .entity_id
            .and_then(|id| self.store.get(id))
            .map_or(false, |entity| entity.flags.is_admin)
    }

    /// Dispatches an admin op after checking that `session` belongs to an admin.
    pub(crate) async fn handle_admin(&self, session: &Session, message: ClientMessage, now: Instant) {
        if !self.is_admin_session(session) {
            debug!(
                "Ignoring admin op from non-admin endpoint {}: {:?}",
                session.addr, message
            );
            return;
        }

        match message {
            ClientMessage::AdminSpawnNpc { name, x, y, z } => {
                self.spawn_npc(&name, Vec3::new(x, y, z), now);
            }
            ClientMessage::AdminSpawnBot {
                name,
                x,
                y,
                z,
                behavior,
            } => {
                self.spawn_bot(&name, Vec3::new(x, y, z), behavior, now);
            }
            ClientMessage::AdminControlBot { bot_id, x, y, z } => {
                self.control_bot(bot_id, Vec3::new(x, y, z), now);
            }
            ClientMessage::AdminBotBehavior {
                bot_id,
                behavior,
                target_id,
            } => {
                self.set_bot_behavior(bot_id, behavior, target_id, now);
            }
            ClientMessage::AdminTeleport { player_id, x, y, z } => {
                self.teleport(player_id, Vec3::new(x, y, z), now);
            }
            ClientMessage::AdminTeleportAll { x, y, z } => {
                self.teleport_all(Vec3::new(x, y, z), now);
            }
            ClientMessage::AdminKick { player_id } => {
                self.kick(player_id);
            }
            ClientMessage::AdminKickAll => {
                self.kick_all();
            }
            ClientMessage::AdminSpawnBenchmarkBots {
                count,
                behavior,
                spread_radius,
            } => {
                self.spawn_benchmark_bots(count as usize, behavior, spread_radius)
                    .await;
            }
            ClientMessage::AdminClearBenchmarkBots => {
                self.clear_benchmark_bots();
            }
            other => {
                debug!("Not an admin op: {:?}", other);
                return;
            }
        }

        self.force_broadcast(now);
    }

    fn random_bot_speed(&self) -> f32 {
        let (low, high) = self.config.bot_speed_range;
        if high > low {
            rand::thread_rng().gen_range(low..high)
        } else {
            low
        }
    }

    /// Waypoints outside the world could never be reached.
    fn clamp_waypoints(&self, waypoints: Vec<Vec3>) -> Vec<Vec3> {
        waypoints
            .into_iter()
            .map(|waypoint| waypoint.clamp_to_world(self.config.world_bound))
            .collect()
    }

    pub fn spawn_npc(&self, name: &str, position: Vec3, now: Instant) -> EntityId {
        let id = self.store.allocate_id();
        let position = position.clamp_to_world(self.config.world_bound);
        self.store
            .insert(Entity::new(id, name, position, EntityFlags::NPC, now));
        info!("Spawned NPC {} ({}) at {:?}", id, name, position);
        id
    }

    pub fn spawn_bot(&self, name: &str, position: Vec3, behavior: BotBehavior, now: Instant) -> EntityId {
        let id = self.store.allocate_id();
        self.insert_bot(id, name, position, behavior, now);
        id
    }

    fn insert_bot(&self, id: EntityId, name: &str, position: Vec3, behavior: BotBehavior, now: Instant) {
        let position = position.clamp_to_world(self.config.world_bound);
        let mut bot = BotState::new(behavior, self.random_bot_speed(), now);
        if behavior == BotBehavior::Patrol {
            bot.patrol_waypoints = self.clamp_waypoints(spawn_patrol_loop(position, PATROL_HALF_SIZE));
        }
        self.store
            .insert(Entity::new_bot(id, name, position, bot, now));
        info!("Spawned bot {} ({}) with {:?} at {:?}", id, name, behavior, position);
    }

    /// Places a bot by hand and suspends its AI.
    pub fn control_bot(&self, bot_id: EntityId, position: Vec3, now: Instant) -> bool {
        let position = position.clamp_to_world(self.config.world_bound);
        let updated = self
            .store
            .update(bot_id, |entity| match entity.bot.as_mut() {
                Some(bot) => {
                    bot.behavior = BotBehavior::Idle;
                    bot.move_direction = None;
                    bot.last_behavior_change = now;
                    entity.set_position(position, now);
                    true
                }
                None => false,
            })
            .unwrap_or(false);
        if !updated {
            debug!("control_bot: {} is not a bot", bot_id);
        }
        updated
    }

    pub fn set_bot_behavior(
        &self,
        bot_id: EntityId,
        behavior: BotBehavior,
        target_id: Option<EntityId>,
        now: Instant,
    ) -> bool {
        let updated = self
            .store
            .update(bot_id, |entity| {
                let position = entity.position;
                let bot = match entity.bot.as_mut() {
                    Some(bot) => bot,
                    None => return false,
                };
                bot.behavior = behavior;
                bot.last_behavior_change = now;
                bot.move_direction = None;
                match behavior {
                    BotBehavior::Patrol => {
                        bot.patrol_waypoints =
                            self.clamp_waypoints(patrol_square(position, PATROL_HALF_SIZE));
                        bot.current_waypoint = 0;
                    }
                    BotBehavior::Follow => bot.follow_target = target_id,
                    BotBehavior::Random | BotBehavior::Idle => {}
                }
                true
            })
            .unwrap_or(false);
        if updated {
            info!("Bot {} behavior set to {:?}", bot_id, behavior);
        } else {
            debug!("set_bot_behavior: {} is not a bot", bot_id);
        }
        updated
    }

    /// Moves an entity and opens its server authority window.
    pub fn teleport(&self, id: EntityId, position: Vec3, now: Instant) -> bool {
        let position = position.clamp_to_world(self.config.world_bound);
        let deadline = now + self.config.authority_window;
        let updated = self
            .store
            .update(id, |entity| {
                entity.set_position(position, now);
                entity.server_authority_until = Some(deadline);
            })
            .is_some();
        if !updated {
            debug!("teleport: unknown entity {}", id);
        }
        updated
    }

    /// Teleports every non-admin entity. Returns how many moved.
    pub fn teleport_all(&self, position: Vec3, now: Instant) -> usize {
        let targets = self.store.ids_where(|entity| !entity.flags.is_admin);
        let moved = targets
            .into_iter()
            .filter(|id| self.teleport(*id, position, now))
            .count();
        info!("Teleported {} entities to {:?}", moved, position);
        moved
    }

    /// Removes an entity. Unknown ids are a no-op.
    pub fn kick(&self, id: EntityId) -> bool {
        let removed = self.remove_entity(id, "kicked by admin");
        if removed {
            info!("Kicked entity {}", id);
        } else {
            debug!("kick: unknown entity {}", id);
        }
        removed
    }

    /// Kicks every non-admin entity. Returns how many were removed.
    pub fn kick_all(&self) -> usize {
        let targets = self.store.ids_where(|entity| !entity.flags.is_admin);
        let removed = targets
            .into_iter()
            .filter(|id| self.remove_entity(*id, "kicked by admin"))
            .count();
        info!("Kicked {} entities", removed);
        removed
    }

    /// Claims up to `wanted` slots under the total entity ceiling.
    ///
    /// Slots still reserved by spawns in progress count as occupied, so
    /// overlapping requests can never overshoot the ceiling together.
    fn reserve_benchmark_slots(&self, wanted: usize) -> Reservation<'_> {
        let mut granted = 0;
        // The closure always returns Some, so this cannot fail.
        let _ = self
            .benchmark_reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |reserved| {
                let room = self
                    .config
                    .max_total_entities
                    .saturating_sub(self.store.len() + reserved);
                granted = wanted.min(room);
                Some(reserved + granted)
            });
        Reservation {
            counter: &self.benchmark_reserved,
            remaining: granted,
        }
    }

    /// Spawns up to `count` randomly placed bots in batches.
    ///
    /// The request is reduced to stay under both the per-request and the
    /// total entity ceilings. Returns how many bots were created.
    pub async fn spawn_benchmark_bots(
        &self,
        count: usize,
        behavior: BotBehavior,
        spread_radius: f32,
    ) -> usize {
        let mut reservation = self.reserve_benchmark_slots(count.min(self.config.max_benchmark_bots));
        let allowed = reservation.remaining;
        if allowed < count {
            warn!(
                "Benchmark spawn reduced from {} to {} (limit {}, {} entities present)",
                count,
                allowed,
                self.config.max_benchmark_bots,
                self.store.len()
            );
        }
        if allowed == 0 {
            return 0;
        }

        let radius = if spread_radius.is_finite() {
            spread_radius.abs().min(self.config.world_bound)
        } else {
            0.0
        };
        let batch_size = self.config.benchmark_batch_size.max(1);
        let mut spawned = 0;
        while spawned < allowed {
            let batch = batch_size.min(allowed - spawned);
            let now = Instant::now();
            for _ in 0..batch {
                let position = {
                    let mut rng = rand::thread_rng();
                    if radius > 0.0 {
                        Vec3::new(
                            rng.gen_range(-radius..=radius),
                            0.0,
                            rng.gen_range(-radius..=radius),
                        )
                    } else {
                        Vec3::ZERO
                    }
                };
                let id = self.store.allocate_id();
                let name = format!("{}{}", BENCHMARK_BOT_PREFIX, id);
                self.insert_bot(id, &name, position, behavior, now);
                reservation.release_one();
                spawned += 1;
            }
            if spawned < allowed {
                tokio::time::sleep(self.config.benchmark_batch_delay).await;
            }
        }

        info!("Spawned {} benchmark bots with {:?}", spawned, behavior);
        spawned
    }

    /// Removes every bot that follows the benchmark naming convention.
    pub fn clear_benchmark_bots(&self) -> usize {
        let targets = self
            .store
            .ids_where(|entity| entity.flags.is_bot && entity.name.starts_with(BENCHMARK_BOT_PREFIX));
        let removed = targets
            .into_iter()
            .filter(|id| self.store.remove(*id).is_some())
            .count();
        info!("Cleared {} benchmark bots", removed);
        removed
    }
}

#[cfg(test)]
mod tests {
    use crate::config::ServerConfig;
    use crate::entity::EntityFlags;
    use crate::game::Game;
    use crate::transport::RecordingTransport;
    use shared::{decode_server_message, BotBehavior, ClientMessage, ServerMessage, Vec3};
    use std::net::SocketAddr;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn setup() -> (Game, Arc<RecordingTransport>, Instant) {
        let transport = Arc::new(RecordingTransport::new());
        let game = Game::new(ServerConfig::default(), transport.clone());
        let now = Instant::now();
        game.join(addr(1), "Root", EntityFlags::ADMIN, now);
        transport.take();
        (game, transport, now)
    }

    fn state_count(transport: &RecordingTransport) -> usize {
        transport
            .take()
            .iter()
            .filter(|out| {
                matches!(
                    decode_server_message(&out.payload),
                    Ok(ServerMessage::State { .. })
                )
            })
            .count()
    }

    #[test]
    fn test_spawn_npc_via_router_forces_broadcast() {
        let (game, transport, now) = setup();
        tokio_test::block_on(game.handle_message(
            addr(1),
            ClientMessage::AdminSpawnNpc {
                name: "X".into(),
                x: 1.0,
                y: 0.0,
                z: 2.0,
            },
            now,
        ));

        let npcs: Vec<_> = game
            .store()
            .snapshot()
            .into_iter()
            .filter(|e| e.flags.is_npc)
            .collect();
        assert_eq!(npcs.len(), 1);
        assert_eq!(npcs[0].name, "X");
        assert_eq!(npcs[0].position, Vec3::new(1.0, 0.0, 2.0));
        assert_eq!(state_count(&transport), 1);
    }

    #[test]
    fn test_non_admin_ops_are_ignored() {
        let (game, transport, now) = setup();
        game.join(addr(2), "Alice", EntityFlags::PLAYER, now);
        transport.take();

        tokio_test::block_on(game.handle_message(addr(2), ClientMessage::AdminKickAll, now));
        tokio_test::block_on(game.handle_message(
            addr(3),
            ClientMessage::AdminSpawnNpc {
                name: "Sneaky".into(),
                x: 0.0,
                y: 0.0,
                z: 0.0,
            },
            now,
        ));

        assert_eq!(game.store().len(), 2);
        assert_eq!(state_count(&transport), 0);
    }

    #[test]
    fn test_spawn_bot_patrol_gets_waypoints() {
        let (game, _transport, now) = setup();
        let id = game.spawn_bot("Guard", Vec3::new(5.0, 0.0, 5.0), BotBehavior::Patrol, now);
        let bot = game.store().get(id).unwrap();
        assert!(bot.flags.is_bot && bot.flags.is_npc);
        let state = bot.bot.unwrap();
        assert_eq!(state.patrol_waypoints.len(), 5);
        assert_eq!(state.patrol_waypoints[0], Vec3::new(5.0, 0.0, 5.0));
        assert_eq!(state.patrol_waypoints[1], Vec3::new(8.0, 0.0, 8.0));
        assert!((2.0..=6.0).contains(&state.speed));
    }

    #[test]
    fn test_control_bot_forces_idle() {
        let (game, _transport, now) = setup();
        let id = game.spawn_bot("Walker", Vec3::ZERO, BotBehavior::Random, now);
        assert!(game.control_bot(id, Vec3::new(3.0, 0.0, -3.0), now));

        let bot = game.store().get(id).unwrap();
        assert_eq!(bot.position, Vec3::new(3.0, 0.0, -3.0));
        assert_eq!(bot.bot.unwrap().behavior, BotBehavior::Idle);

        let npc = game.spawn_npc("Guard", Vec3::ZERO, now);
        assert!(!game.control_bot(npc, Vec3::new(1.0, 0.0, 1.0), now));
    }

    #[test]
    fn test_set_bot_behavior() {
        let (game, _transport, now) = setup();
        let id = game.spawn_bot("Walker", Vec3::new(1.0, 0.0, 1.0), BotBehavior::Idle, now);

        assert!(game.set_bot_behavior(id, BotBehavior::Follow, Some(42), now));
        let state = game.store().get(id).unwrap().bot.unwrap();
        assert_eq!(state.behavior, BotBehavior::Follow);
        assert_eq!(state.follow_target, Some(42));

        assert!(game.set_bot_behavior(id, BotBehavior::Patrol, None, now));
        let state = game.store().get(id).unwrap().bot.unwrap();
        assert_eq!(state.current_waypoint, 0);
        assert_eq!(state.patrol_waypoints[0], Vec3::new(4.0, 0.0, 4.0));
        assert_eq!(state.patrol_waypoints[2], Vec3::new(-2.0, 0.0, -2.0));
    }

    #[test]
    fn test_teleport_opens_authority_window() {
        let (game, _transport, now) = setup();
        let id = game.join(addr(2), "Alice", EntityFlags::PLAYER, now).unwrap();

        assert!(game.teleport(id, Vec3::new(10.0, 0.0, 10.0), now));
        let entity = game.store().get(id).unwrap();
        assert_eq!(entity.position, Vec3::new(10.0, 0.0, 10.0));
        assert_eq!(entity.server_authority_until, Some(now + Duration::from_secs(2)));

        assert!(!game.teleport(9999, Vec3::ZERO, now));
    }

    #[test]
    fn test_teleport_all_skips_admins() {
        let (game, _transport, now) = setup();
        game.join(addr(2), "Alice", EntityFlags::PLAYER, now);
        game.spawn_npc("Guard", Vec3::ZERO, now);

        assert_eq!(game.teleport_all(Vec3::new(7.0, 0.0, 7.0), now), 2);
        let admin_id = game.sessions().entity_of(addr(1)).unwrap();
        assert_eq!(game.store().get(admin_id).unwrap().position, Vec3::ZERO);
    }

    #[test]
    fn test_kick_is_idempotent_and_notifies() {
        let (game, transport, now) = setup();
        let id = game.join(addr(2), "Alice", EntityFlags::PLAYER, now).unwrap();
        transport.take();

        assert!(game.kick(id));
        assert!(!game.kick(id));
        assert!(game.sessions().get(addr(2)).is_none());

        let kicked = transport.take().into_iter().any(|out| {
            out.addr == addr(2)
                && matches!(
                    decode_server_message(&out.payload),
                    Ok(ServerMessage::Kicked { .. })
                )
        });
        assert!(kicked);
    }

    #[test]
    fn test_kick_all_keeps_admins() {
        let (game, _transport, now) = setup();
        game.join(addr(2), "Alice", EntityFlags::PLAYER, now);
        game.join(addr(3), "Bob", EntityFlags::PLAYER, now);
        game.spawn_bot("Walker", Vec3::ZERO, BotBehavior::Random, now);

        assert_eq!(game.kick_all(), 3);
        assert_eq!(game.store().len(), 1);
        assert_eq!(game.sessions().len(), 1);
    }

    #[tokio::test]
    async fn test_benchmark_spawn_is_capped() {
        let transport = Arc::new(RecordingTransport::new());
        let game = Game::new(
            ServerConfig {
                max_benchmark_bots: 30,
                benchmark_batch_size: 8,
                benchmark_batch_delay: Duration::from_millis(1),
                ..ServerConfig::default()
            },
            transport,
        );

        let spawned = game
            .spawn_benchmark_bots(100, BotBehavior::Random, 10.0)
            .await;
        assert_eq!(spawned, 30);
        for entity in game.store().snapshot() {
            assert!(entity.flags.is_bot);
            assert!(entity.position.x.abs() <= 10.0 && entity.position.z.abs() <= 10.0);
        }
    }

    #[tokio::test]
    async fn test_benchmark_spawn_respects_total_ceiling() {
        let transport = Arc::new(RecordingTransport::new());
        let game = Game::new(
            ServerConfig {
                max_total_entities: 12,
                benchmark_batch_delay: Duration::from_millis(1),
                ..ServerConfig::default()
            },
            transport,
        );
        let now = Instant::now();
        for n in 0..10 {
            game.spawn_npc(&format!("N{}", n), Vec3::ZERO, now);
        }

        assert_eq!(game.spawn_benchmark_bots(50, BotBehavior::Idle, 5.0).await, 2);
        assert_eq!(game.spawn_benchmark_bots(50, BotBehavior::Idle, 5.0).await, 0);
        assert_eq!(game.store().len(), 12);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_benchmark_spawns_share_ceiling() {
        let transport = Arc::new(RecordingTransport::new());
        let game = Arc::new(Game::new(
            ServerConfig {
                benchmark_batch_delay: Duration::from_millis(1),
                ..ServerConfig::default()
            },
            transport,
        ));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let game = Arc::clone(&game);
                tokio::spawn(async move {
                    game.spawn_benchmark_bots(500, BotBehavior::Idle, 10.0).await
                })
            })
            .collect();
        let mut total = 0;
        for handle in handles {
            total += handle.await.unwrap();
        }

        assert_eq!(total, 800);
        assert_eq!(game.store().len(), 800);
        assert_eq!(game.benchmark_reserved.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancelled_benchmark_spawn_returns_unused_slots() {
        let transport = Arc::new(RecordingTransport::new());
        let game = Game::new(
            ServerConfig {
                max_total_entities: 10,
                benchmark_batch_size: 1,
                benchmark_batch_delay: Duration::from_secs(5),
                ..ServerConfig::default()
            },
            transport,
        );

        let cut_short = tokio::time::timeout(
            Duration::from_millis(20),
            game.spawn_benchmark_bots(10, BotBehavior::Idle, 5.0),
        )
        .await;
        assert!(cut_short.is_err());
        assert_eq!(game.store().len(), 1);
        assert_eq!(game.benchmark_reserved.load(Ordering::SeqCst), 0);

        let timer = Instant::now();
        let spawned = tokio::time::timeout(
            Duration::from_millis(20),
            game.spawn_benchmark_bots(1, BotBehavior::Idle, 5.0),
        )
        .await;
        assert_eq!(spawned, Ok(1));
        assert!(timer.elapsed() < Duration::from_secs(5));
        assert_eq!(game.store().len(), 2);
    }

    #[tokio::test]
    async fn test_clear_benchmark_bots_leaves_named_bots() {
        let (game, _transport, now) = setup();
        game.spawn_bot("Sentry", Vec3::ZERO, BotBehavior::Idle, now);
        game.spawn_benchmark_bots(5, BotBehavior::Random, 5.0).await;

        assert_eq!(game.clear_benchmark_bots(), 5);
        let names: Vec<String> = game
            .store()
            .snapshot()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert!(names.contains(&"Sentry".to_string()));
        assert_eq!(names.len(), 2);
    }
}
