//! Client session cache for resumption.
//!
//! Sessions are keyed by peer id, `host:port` plus an optional `/shard`
//! suffix that keeps isolated contexts from resuming each other's sessions.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use tlsock_types::{CipherSuite, ProtocolVersion};
use zeroize::Zeroize;

use crate::HostPortPair;

/// Default lifetime of a cached session.
pub const DEFAULT_SESSION_LIFETIME: Duration = Duration::from_secs(2 * 60 * 60);

/// Builds the session cache key for a server.
pub fn session_cache_key(host_and_port: &HostPortPair, shard: &str) -> String {
    if shard.is_empty() {
        host_and_port.to_string()
    } else {
        format!("{host_and_port}/{shard}")
    }
}

/// Engine state needed to resume a session with one peer.
#[derive(Debug, Clone)]
pub struct CachedSession {
    /// Session id or ticket, as sent to the server.
    pub id: Vec<u8>,
    pub cipher_suite: CipherSuite,
    pub protocol_version: ProtocolVersion,
    /// Opaque resumption secret. Wiped on drop.
    pub state: Vec<u8>,
    pub next_proto: Option<Vec<u8>>,
    pub created_at: SystemTime,
}

impl Drop for CachedSession {
    fn drop(&mut self) {
        self.state.zeroize();
    }
}

/// Where engines keep sessions between connection attempts.
pub trait SessionCache: Send + Sync {
    fn put(&mut self, peer_id: &str, session: CachedSession);

    /// The live session for `peer_id`, if any.
    fn get(&self, peer_id: &str) -> Option<&CachedSession>;

    /// Forgets `peer_id`'s session so the next attempt does a full handshake.
    fn remove(&mut self, peer_id: &str);

    fn clear(&mut self);
}

/// Bounded [`SessionCache`] held in memory.
///
/// Expired sessions stay stored until [`purge_expired`](Self::purge_expired)
/// or an eviction removes them, but `get` never returns them.
pub struct InMemorySessionCache {
    entries: HashMap<String, CachedSession>,
    capacity: usize,
    /// `None` keeps sessions forever.
    lifetime: Option<Duration>,
}

impl InMemorySessionCache {
    /// A cache of up to `capacity` sessions living
    /// [`DEFAULT_SESSION_LIFETIME`].
    pub fn new(capacity: usize) -> Self {
        Self::with_lifetime(capacity, Some(DEFAULT_SESSION_LIFETIME))
    }

    pub fn with_lifetime(capacity: usize, lifetime: Option<Duration>) -> Self {
        Self {
            entries: HashMap::new(),
            capacity,
            lifetime,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn is_live(&self, session: &CachedSession, now: SystemTime) -> bool {
        match self.lifetime {
            None => true,
            Some(lifetime) => now
                .duration_since(session.created_at)
                .map_or(true, |age| age <= lifetime),
        }
    }

    /// Drops every expired session.
    pub fn purge_expired(&mut self) {
        let now = SystemTime::now();
        let live: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, s)| self.is_live(s, now))
            .map(|(k, _)| k.clone())
            .collect();
        self.entries.retain(|k, _| live.contains(k));
    }
}

impl SessionCache for InMemorySessionCache {
    fn put(&mut self, peer_id: &str, session: CachedSession) {
        if self.capacity == 0 {
            return;
        }
        if !self.entries.contains_key(peer_id) && self.entries.len() >= self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, s)| s.created_at)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                self.entries.remove(&oldest);
            }
        }
        self.entries.insert(peer_id.to_owned(), session);
    }

    fn get(&self, peer_id: &str) -> Option<&CachedSession> {
        self.entries
            .get(peer_id)
            .filter(|s| self.is_live(s, SystemTime::now()))
    }

    fn remove(&mut self, peer_id: &str) {
        self.entries.remove(peer_id);
    }

    fn clear(&mut self) {
        self.entries.clear();
    }
}
