use std::sync::RwLock;
use std::time::{Duration, Instant};

use crate::upstream::ServerIdentity;

struct CacheSlot {
    identity: ServerIdentity,
    captured_at: Instant,
}

/// Time-boxed cache of the upstream server identity. One instance exists
/// per address family so a failing IPv6 upstream cannot invalidate a
/// healthy IPv4 entry.
///
/// A TTL of zero means the entry never expires (cache until restart).
/// The lock is held only for the copy in/out, never across an await.
pub struct IdentityCache {
    ttl: Duration,
    slot: RwLock<Option<CacheSlot>>,
}

impl IdentityCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slot: RwLock::new(None),
        }
    }

    /// Returns the cached identity if present and not expired. Expired or
    /// empty entries return None; the caller is expected to fetch fresh
    /// data and write it back with [`set`](Self::set).
    pub fn get(&self) -> Option<ServerIdentity> {
        let guard = self.slot.read().unwrap_or_else(|e| e.into_inner());
        let slot = guard.as_ref()?;
        if self.ttl.is_zero() || slot.captured_at.elapsed() < self.ttl {
            Some(slot.identity.clone())
        } else {
            None
        }
    }

    /// Replace the entry wholesale and restart the TTL clock.
    pub fn set(&self, identity: ServerIdentity) {
        let mut guard = self.slot.write().unwrap_or_else(|e| e.into_inner());
        *guard = Some(CacheSlot {
            identity,
            captured_at: Instant::now(),
        });
    }

    /// Age of the current entry, if any. Reported on the dashboard even
    /// when the entry has expired.
    pub fn age(&self) -> Option<Duration> {
        let guard = self.slot.read().unwrap_or_else(|e| e.into_inner());
        guard.as_ref().map(|slot| slot.captured_at.elapsed())
    }
}
