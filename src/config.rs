//! Library tunables

use std::time::Duration;

/// Configuration for a Lime manager.
///
/// Defaults are conservative; the skipped-key caps bound the memory a
/// malicious or lossy peer can make a session retain.
#[derive(Debug, Clone)]
pub struct LimeConfig {
    /// Maximum message keys cached for out-of-order delivery within one
    /// receiving chain.
    pub max_skipped_per_chain: usize,

    /// Maximum message keys cached across a whole session; oldest
    /// entries are evicted first.
    pub max_skipped_per_session: usize,

    /// Age after which the active signed prekey is rotated by `update`.
    pub spk_lifetime: Duration,

    /// Extra retention of a retired signed prekey before it is purged,
    /// so in-flight sessions referencing it can still complete.
    pub spk_grace: Duration,

    /// Retention of stale Double Ratchet sessions before purge.
    pub session_retention: Duration,
}

impl Default for LimeConfig {
    fn default() -> Self {
        Self {
            max_skipped_per_chain: 256,
            max_skipped_per_session: 1024,
            spk_lifetime: Duration::from_secs(7 * 24 * 3600),
            spk_grace: Duration::from_secs(24 * 3600),
            session_retention: Duration::from_secs(30 * 24 * 3600),
        }
    }
}
