//! Connection endpoint tracking for the multiplayer server
//!
//! This module handles the server-side bookkeeping for every endpoint that has
//! sent a valid message, including:
//! - Insert-if-absent session creation on first contact
//! - Binding a session to the entity it controls after `join`
//! - Per-session sequence and rate limiting state for the input validator
//! - Liveness tracking and timeout sweeps
//!
//! Sessions never hold entity state; they only reference an entity by id.

use crate::error::SessionError;
use dashmap::DashMap;
use log::info;
use shared::EntityId;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

/// Server-side record for one remote endpoint
#[derive(Debug, Clone)]
pub struct Session {
    /// Network address for sending responses
    pub addr: SocketAddr,
    /// Entity controlled by this session, assigned on join
    pub entity_id: Option<EntityId>,
    /// Endpoint is allowed to issue `admin_join`
    pub privileged: bool,
    /// Highest input sequence accepted so far
    pub last_sequence: Option<u32>,
    /// When the last input passed the rate limit
    pub last_input: Option<Instant>,
    /// Last time any message arrived from this endpoint
    pub last_heartbeat: Instant,
    /// Whether the deprecated `move` warning was already logged
    pub warned_absolute_move: bool,
}

impl Session {
    pub fn new(addr: SocketAddr, privileged: bool, now: Instant) -> Self {
        Self {
            addr,
            entity_id: None,
            privileged,
            last_sequence: None,
            last_input: None,
            last_heartbeat: now,
            warned_absolute_move: false,
        }
    }

    pub fn last_seen(&self) -> Instant {
        match self.last_input {
            Some(input) => input.max(self.last_heartbeat),
            None => self.last_heartbeat,
        }
    }

    /// Returns true when neither input nor heartbeat arrived within `timeout`.
    pub fn is_timed_out(&self, timeout: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.last_seen()) > timeout
    }
}

/// All known sessions keyed by endpoint
pub struct SessionRegistry {
    sessions: DashMap<SocketAddr, Session>,
    admin_hosts: Vec<IpAddr>,
}

impl SessionRegistry {
    pub fn new(admin_hosts: Vec<IpAddr>) -> Self {
        Self {
            sessions: DashMap::new(),
            admin_hosts,
        }
    }

    /// Looks up the session for `addr`, creating it on first contact.
    ///
    /// Also refreshes the liveness timestamp. No entity is assigned here.
    pub fn register_or_get(&self, addr: SocketAddr, now: Instant) -> Session {
        let mut entry = self.sessions.entry(addr).or_insert_with(|| {
            let privileged = self.admin_hosts.contains(&addr.ip());
            info!(
                "New session from {}{}",
                addr,
                if privileged { " (privileged)" } else { "" }
            );
            Session::new(addr, privileged, now)
        });
        entry.last_heartbeat = entry.last_heartbeat.max(now);
        entry.value().clone()
    }

    pub fn get(&self, addr: SocketAddr) -> Option<Session> {
        self.sessions.get(&addr).map(|entry| entry.value().clone())
    }

    /// Runs `f` on the session while it is locked.
    pub fn update<R>(&self, addr: SocketAddr, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        self.sessions
            .get_mut(&addr)
            .map(|mut entry| f(entry.value_mut()))
    }

    /// Binds a session to a freshly joined entity and resets its input state.
    ///
    /// Returns the entity the session controlled before, if any. Fails when
    /// the session was removed in the meantime; nothing is bound then.
    pub fn bind_entity(
        &self,
        addr: SocketAddr,
        entity_id: EntityId,
    ) -> Result<Option<EntityId>, SessionError> {
        self.update(addr, |session| {
            session.last_sequence = None;
            session.last_input = None;
            session.entity_id.replace(entity_id)
        })
        .ok_or(SessionError::Gone(addr))
    }

    pub fn entity_of(&self, addr: SocketAddr) -> Option<EntityId> {
        self.sessions.get(&addr).and_then(|entry| entry.entity_id)
    }

    pub fn remove(&self, addr: SocketAddr) -> Option<Session> {
        self.sessions.remove(&addr).map(|(_, session)| {
            info!("Session {} removed", addr);
            session
        })
    }

    /// Finds the endpoint controlling `entity_id`.
    pub fn find_by_entity(&self, entity_id: EntityId) -> Option<SocketAddr> {
        self.sessions
            .iter()
            .find(|entry| entry.entity_id == Some(entity_id))
            .map(|entry| *entry.key())
    }

    pub fn remove_by_entity(&self, entity_id: EntityId) -> Option<Session> {
        let addr = self.find_by_entity(entity_id)?;
        self.remove(addr)
    }

    /// Every endpoint that should receive broadcasts.
    pub fn endpoints(&self) -> Vec<SocketAddr> {
        self.sessions.iter().map(|entry| *entry.key()).collect()
    }

    /// Removes and returns every session that has gone quiet for longer than `timeout`.
    pub fn take_timed_out(&self, timeout: Duration, now: Instant) -> Vec<Session> {
        let expired: Vec<SocketAddr> = self
            .sessions
            .iter()
            .filter(|entry| entry.is_timed_out(timeout, now))
            .map(|entry| *entry.key())
            .collect();

        expired
            .into_iter()
            .filter_map(|addr| {
                self.sessions
                    .remove_if(&addr, |_, session| session.is_timed_out(timeout, now))
                    .map(|(_, session)| session)
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn test_addr() -> SocketAddr {
        "127.0.0.1:8080".parse().unwrap()
    }

    fn remote_addr() -> SocketAddr {
        "192.168.1.20:5000".parse().unwrap()
    }

    fn registry() -> SessionRegistry {
        SessionRegistry::new(vec![IpAddr::V4(Ipv4Addr::LOCALHOST)])
    }

    #[test]
    fn test_register_is_insert_if_absent() {
        let registry = registry();
        let now = Instant::now();

        let first = registry.register_or_get(test_addr(), now);
        assert!(first.entity_id.is_none());
        registry.bind_entity(test_addr(), 5).unwrap();

        let again = registry.register_or_get(test_addr(), now);
        assert_eq!(again.entity_id, Some(5));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_privilege_follows_admin_hosts() {
        let registry = registry();
        let now = Instant::now();
        assert!(registry.register_or_get(test_addr(), now).privileged);
        assert!(!registry.register_or_get(remote_addr(), now).privileged);
    }

    #[test]
    fn test_bind_entity_resets_input_state() {
        let registry = registry();
        let now = Instant::now();
        registry.register_or_get(test_addr(), now);
        registry.bind_entity(test_addr(), 1).unwrap();
        registry.update(test_addr(), |session| {
            session.last_sequence = Some(40);
            session.last_input = Some(now);
        });

        let previous = registry.bind_entity(test_addr(), 2);
        assert_eq!(previous, Ok(Some(1)));

        let session = registry.get(test_addr()).unwrap();
        assert_eq!(session.entity_id, Some(2));
        assert_eq!(session.last_sequence, None);
        assert_eq!(session.last_input, None);
    }

    #[test]
    fn test_find_and_remove_by_entity() {
        let registry = registry();
        let now = Instant::now();
        registry.register_or_get(test_addr(), now);
        registry.register_or_get(remote_addr(), now);
        registry.bind_entity(remote_addr(), 9).unwrap();

        assert_eq!(registry.find_by_entity(9), Some(remote_addr()));
        assert!(registry.remove_by_entity(9).is_some());
        assert!(registry.remove_by_entity(9).is_none());
        assert_eq!(registry.endpoints(), vec![test_addr()]);
    }

    #[test]
    fn test_session_timeout() {
        let now = Instant::now();
        let mut session = Session::new(test_addr(), false, now);
        let timeout = Duration::from_secs(30);

        assert!(!session.is_timed_out(timeout, now + Duration::from_secs(29)));
        assert!(session.is_timed_out(timeout, now + Duration::from_secs(31)));

        session.last_input = Some(now + Duration::from_secs(20));
        assert!(!session.is_timed_out(timeout, now + Duration::from_secs(31)));
    }

    #[test]
    fn test_take_timed_out_removes_only_stale_sessions() {
        let registry = registry();
        let start = Instant::now();
        registry.register_or_get(test_addr(), start);
        registry.register_or_get(remote_addr(), start + Duration::from_secs(20));

        let expired = registry.take_timed_out(Duration::from_secs(30), start + Duration::from_secs(31));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].addr, test_addr());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_bind_entity_fails_without_session() {
        let registry = registry();
        assert_eq!(
            registry.bind_entity(test_addr(), 3),
            Err(SessionError::Gone(test_addr()))
        );
        assert!(registry.is_empty());
    }
}
