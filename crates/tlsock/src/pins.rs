//! Public-key pinning.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use crate::cert::HashValue;
use crate::runner::lock;

/// Pins in force for one domain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainState {
    pub static_spki_hashes: Vec<HashValue>,
    pub dynamic_spki_hashes: Vec<HashValue>,
    /// Keys that must never appear in the chain.
    pub bad_static_spki_hashes: Vec<HashValue>,
    pub include_subdomains: bool,
}

impl DomainState {
    pub fn has_pins(&self) -> bool {
        !self.static_spki_hashes.is_empty()
            || !self.dynamic_spki_hashes.is_empty()
            || !self.bad_static_spki_hashes.is_empty()
    }

    /// A chain is permitted when it contains no forbidden key and, if any
    /// pins exist, at least one pinned key.
    pub fn is_chain_permitted(&self, hashes: &[HashValue]) -> bool {
        if intersects(&self.bad_static_spki_hashes, hashes) {
            return false;
        }
        if self.static_spki_hashes.is_empty() && self.dynamic_spki_hashes.is_empty() {
            return true;
        }
        intersects(&self.static_spki_hashes, hashes) || intersects(&self.dynamic_spki_hashes, hashes)
    }
}

fn intersects(a: &[HashValue], b: &[HashValue]) -> bool {
    a.iter().any(|h| b.contains(h))
}

/// Source of pin sets, keyed by host.
pub trait TransportSecurityState: Send + Sync {
    /// Pins for `host`. Entries that depend on SNI are skipped when SNI
    /// cannot be sent.
    fn domain_state(&self, host: &str, sni_available: bool) -> Option<DomainState>;
}

/// [`TransportSecurityState`] backed by a map.
#[derive(Default)]
pub struct MemorySecurityState {
    entries: Mutex<HashMap<String, (DomainState, bool)>>,
}

impl MemorySecurityState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers pins for `host`. `sni_only` entries apply only when SNI is
    /// available.
    pub fn add(&self, host: &str, state: DomainState, sni_only: bool) {
        lock(&self.entries).insert(host.to_ascii_lowercase(), (state, sni_only));
    }
}

impl TransportSecurityState for MemorySecurityState {
    fn domain_state(&self, host: &str, sni_available: bool) -> Option<DomainState> {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        let entries = lock(&self.entries);
        let mut candidate = host.as_str();
        let mut exact = true;
        loop {
            if let Some((state, sni_only)) = entries.get(candidate) {
                if (exact || state.include_subdomains) && (sni_available || !sni_only) {
                    return Some(state.clone());
                }
            }
            let (_, parent) = candidate.split_once('.')?;
            candidate = parent;
            exact = false;
        }
    }
}

/// Default time after the build date during which pins are enforced.
pub const DEFAULT_ENFORCEMENT_WINDOW: Duration = Duration::from_secs(70 * 24 * 60 * 60);

/// Decides whether a pin mismatch is fatal.
///
/// Pins age with the binary: once the build is `enforcement_window` old or
/// older, mismatches are reported but not enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinPolicy {
    pub build_time: SystemTime,
    pub enforcement_window: Duration,
}

impl PinPolicy {
    pub fn new(build_time: SystemTime) -> Self {
        Self {
            build_time,
            enforcement_window: DEFAULT_ENFORCEMENT_WINDOW,
        }
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.enforcement_window = window;
        self
    }

    pub fn enforces(&self, now: SystemTime) -> bool {
        let age = now.duration_since(self.build_time).unwrap_or(Duration::ZERO);
        age < self.enforcement_window
    }
}

impl Default for PinPolicy {
    /// A build made now.
    fn default() -> Self {
        Self::new(SystemTime::now())
    }
}

/// Outcome of checking a chain against its host's pins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinCheck {
    pub permitted: bool,
    /// Whether a mismatch fails the connection.
    pub enforced: bool,
}

/// Checks `hashes` against the pins for `host`. `None` when the host has no
/// pins.
pub fn check_pins(
    state: &dyn TransportSecurityState,
    host: &str,
    sni_available: bool,
    hashes: &[HashValue],
    policy: &PinPolicy,
    now: SystemTime,
) -> Option<PinCheck> {
    let domain = state.domain_state(host, sni_available)?;
    if !domain.has_pins() {
        return None;
    }
    let permitted = domain.is_chain_permitted(hashes);
    Some(PinCheck {
        permitted,
        enforced: !permitted && policy.enforces(now),
    })
}
