//! Bot behavior state machine, advanced on a fixed timer.
//!
//! Bots never change behavior on their own; only admin commands move them
//! between Idle, Random, Follow and Patrol.

use crate::config::ServerConfig;
use crate::entity::Entity;
use crate::entity_store::EntityStore;
use crate::error::BotError;
use log::warn;
use rand::Rng;
use shared::{BotBehavior, EntityId, Vec3};
use std::f32::consts::TAU;
use std::time::{Duration, Instant};

/// Followers stop once they are this close to their target.
pub const FOLLOW_DISTANCE: f32 = 2.0;
/// A patrol waypoint counts as reached inside this radius.
pub const WAYPOINT_REACHED: f32 = 0.5;

/// What one bot tick did.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct BotTickReport {
    pub processed: usize,
    /// Active bots left for a later tick because of the per-tick cap.
    pub deferred: usize,
    pub moved: usize,
    pub demoted: Vec<EntityId>,
}

impl BotTickReport {
    pub fn any_moved(&self) -> bool {
        self.moved > 0
    }
}

pub fn random_direction<R: Rng>(rng: &mut R) -> (f32, f32) {
    let angle = rng.gen_range(0.0..TAU);
    (angle.cos(), angle.sin())
}

/// Direction changes for `Random` happen roughly every two seconds, jittered per bot.
fn next_reroll<R: Rng>(rng: &mut R, now: Instant) -> Instant {
    now + Duration::from_millis(rng.gen_range(1500..=2500))
}

/// Advances one bot by `dt` seconds. Returns whether it moved more than `epsilon`.
pub fn step_bot<R: Rng>(
    entity: &mut Entity,
    follow_target: Option<Vec3>,
    dt: f32,
    config: &ServerConfig,
    rng: &mut R,
    now: Instant,
) -> Result<bool, BotError> {
    let before = entity.position;
    if !before.is_finite() {
        return Err(BotError::NonFinitePosition);
    }
    let bot = match entity.bot.as_mut() {
        Some(bot) => bot,
        None => return Ok(false),
    };
    let max_step = bot.speed * dt;

    let next = match bot.behavior {
        BotBehavior::Idle => return Ok(false),
        BotBehavior::Random => {
            let (dx, dz) = match bot.move_direction {
                Some(direction) if now < bot.next_direction_change => direction,
                _ => {
                    let direction = random_direction(rng);
                    bot.move_direction = Some(direction);
                    bot.next_direction_change = next_reroll(rng, now);
                    direction
                }
            };
            Vec3::new(before.x + dx * max_step, before.y, before.z + dz * max_step)
        }
        BotBehavior::Follow => match follow_target {
            Some(target) => {
                let distance = before.planar_distance(&target);
                if distance > FOLLOW_DISTANCE {
                    before.step_toward(&target, max_step.min(distance - FOLLOW_DISTANCE))
                } else {
                    before
                }
            }
            None => before,
        },
        BotBehavior::Patrol => {
            let count = bot.patrol_waypoints.len();
            if count == 0 {
                return Err(BotError::EmptyPatrol);
            }
            let mut index = bot.current_waypoint % count;
            if before.planar_distance(&bot.patrol_waypoints[index]) < WAYPOINT_REACHED {
                index = (index + 1) % count;
            }
            bot.current_waypoint = index;
            before.step_toward(&bot.patrol_waypoints[index], max_step)
        }
    };

    let next = next.clamp_to_world(config.world_bound);
    if !next.is_finite() {
        return Err(BotError::NonFinitePosition);
    }

    let moved = before.planar_distance(&next) > config.movement_epsilon;
    if moved {
        entity.set_position(next, now);
    }
    Ok(moved)
}

/// Runs one tick over every active bot, at most `max_active_bots_per_tick` of them.
///
/// Bots are visited in id order so the same ones are processed each tick when
/// the cap applies. A failing bot is demoted to Idle and the tick continues.
pub fn run_bot_tick<R: Rng>(
    store: &EntityStore,
    config: &ServerConfig,
    rng: &mut R,
    now: Instant,
) -> BotTickReport {
    let mut active = store.ids_where(Entity::is_active_bot);
    active.sort_unstable();

    let mut report = BotTickReport::default();
    if active.len() > config.max_active_bots_per_tick {
        report.deferred = active.len() - config.max_active_bots_per_tick;
        active.truncate(config.max_active_bots_per_tick);
    }

    let dt = config.bot_tick_delta();
    for id in active {
        // Read the target before locking the bot; both may share a shard.
        let follow_target = store
            .get(id)
            .and_then(|entity| entity.bot.and_then(|bot| bot.follow_target))
            .and_then(|target| store.get(target))
            .map(|target| target.position);

        let result = store.update(id, |entity| {
            step_bot(entity, follow_target, dt, config, rng, now).map_err(|e| {
                if let Some(bot) = entity.bot.as_mut() {
                    bot.behavior = BotBehavior::Idle;
                    bot.move_direction = None;
                    bot.last_behavior_change = now;
                }
                e
            })
        });

        match result {
            Some(Ok(moved)) => {
                report.processed += 1;
                if moved {
                    report.moved += 1;
                }
            }
            Some(Err(e)) => {
                warn!("Bot {} demoted to Idle: {}", id, e);
                report.processed += 1;
                report.demoted.push(id);
            }
            // Removed between listing and update.
            None => {}
        }
    }

    report
}
