//! Admission control and movement integration for client input.
//!
//! Every rejection is silent towards the client; the returned [`InputOutcome`]
//! exists for logging and tests.

use crate::config::ServerConfig;
use crate::entity_store::EntityStore;
use crate::session::SessionRegistry;
use log::{debug, warn};
use shared::{clamp_input_vector, EntityId, Vec3};
use std::net::SocketAddr;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InputOutcome {
    /// Movement applied; carries the new position.
    Applied(Vec3),
    /// Endpoint has no entity yet.
    NotJoined,
    /// Non-finite axis or speed.
    Malformed,
    StaleSequence { seq: u32, last: u32 },
    RateLimited,
    /// Entity was recently moved by the server.
    AuthorityWindow,
    /// Admin entities do not move.
    AdminIgnored,
    UnknownEntity,
}

impl InputOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, InputOutcome::Applied(_))
    }
}

/// Integrates one input step on the XZ plane and clamps the result into the world.
///
/// `dt` is the fixed server step, not the wall-clock gap between messages, so
/// sending inputs faster never moves an entity further per message.
pub fn integrate(position: Vec3, dx: f32, dy: f32, speed: f32, dt: f32, bound: f32) -> Vec3 {
    let (dx, dy) = clamp_input_vector(dx, dy);
    Vec3 {
        x: position.x + dx * speed * dt,
        y: position.y,
        z: position.z + dy * speed * dt,
    }
    .clamp_to_world(bound)
}

/// Sequence and rate checks against the session. Returns the controlled entity.
fn admit(
    sessions: &SessionRegistry,
    config: &ServerConfig,
    addr: SocketAddr,
    seq: Option<u32>,
    now: Instant,
) -> Result<EntityId, InputOutcome> {
    sessions
        .update(addr, |session| {
            let entity_id = session.entity_id.ok_or(InputOutcome::NotJoined)?;

            // Sequences start at 1; a fresh session behaves as if it saw 0.
            if let Some(seq) = seq {
                let last = session.last_sequence.unwrap_or(0);
                if seq <= last {
                    return Err(InputOutcome::StaleSequence { seq, last });
                }
                session.last_sequence = Some(seq);
            }

            if let Some(previous) = session.last_input {
                if now.saturating_duration_since(previous) < config.min_input_interval {
                    return Err(InputOutcome::RateLimited);
                }
            }
            session.last_input = Some(now);

            Ok(entity_id)
        })
        .unwrap_or(Err(InputOutcome::NotJoined))
}

/// Validates and applies a relative `input` message.
#[allow(clippy::too_many_arguments)]
pub fn process_input(
    sessions: &SessionRegistry,
    store: &EntityStore,
    config: &ServerConfig,
    addr: SocketAddr,
    seq: u32,
    dx: f32,
    dy: f32,
    speed: f32,
    now: Instant,
) -> InputOutcome {
    if !(dx.is_finite() && dy.is_finite() && speed.is_finite()) {
        debug!("Dropping non-finite input from {}", addr);
        return InputOutcome::Malformed;
    }

    let entity_id = match admit(sessions, config, addr, Some(seq), now) {
        Ok(id) => id,
        Err(outcome) => {
            debug!("Dropping input seq {} from {}: {:?}", seq, addr, outcome);
            return outcome;
        }
    };

    let speed = speed.clamp(0.0, config.max_input_speed);
    let outcome = store
        .update(entity_id, |entity| {
            if entity.flags.is_admin {
                return InputOutcome::AdminIgnored;
            }
            if entity.is_under_server_authority(now) {
                return InputOutcome::AuthorityWindow;
            }
            let next = integrate(
                entity.position,
                dx,
                dy,
                speed,
                config.input_tick_delta,
                config.world_bound,
            );
            entity.set_position(next, now);
            InputOutcome::Applied(next)
        })
        .unwrap_or(InputOutcome::UnknownEntity);

    if !outcome.is_applied() {
        debug!("Input seq {} for entity {} dropped: {:?}", seq, entity_id, outcome);
    }
    outcome
}

/// Applies the deprecated absolute `move` message.
///
/// Same rate and authority checks as [`process_input`], no sequence check; the
/// position is set directly (clamped) instead of integrated.
pub fn process_absolute_move(
    sessions: &SessionRegistry,
    store: &EntityStore,
    config: &ServerConfig,
    addr: SocketAddr,
    target: Vec3,
    now: Instant,
) -> InputOutcome {
    if !target.is_finite() {
        return InputOutcome::Malformed;
    }

    let entity_id = match admit(sessions, config, addr, None, now) {
        Ok(id) => id,
        Err(outcome) => {
            debug!("Dropping move from {}: {:?}", addr, outcome);
            return outcome;
        }
    };

    let first_use = sessions
        .update(addr, |session| !std::mem::replace(&mut session.warned_absolute_move, true))
        .unwrap_or(false);
    if first_use {
        warn!(
            "Session {} uses deprecated absolute 'move'; clients should send 'input'",
            addr
        );
    }

    store
        .update(entity_id, |entity| {
            if entity.flags.is_admin {
                return InputOutcome::AdminIgnored;
            }
            if entity.is_under_server_authority(now) {
                return InputOutcome::AuthorityWindow;
            }
            let next = target.clamp_to_world(config.world_bound);
            entity.set_position(next, now);
            InputOutcome::Applied(next)
        })
        .unwrap_or(InputOutcome::UnknownEntity)
}
