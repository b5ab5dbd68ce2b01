//! Cache configuration.
//!
//! Loaded once at startup and frozen. The cache copies the sticky flags
//! into its own state at construction; shutdown clears those copies so the
//! drain can proceed without touching the config.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of inodes the LRU retains before trim kicks in.
    pub cache_size: usize,
    /// Fraction of the LRU treated as the hot top segment; new inodes are
    /// inserted at the midpoint so one-touch entries age out quickly.
    pub cache_mid: f64,
    /// Keep a sync grant after its waiters drain (normal regime).
    pub sticky_sync_normal: bool,
    /// Keep a sync grant after its waiters drain (softasync regime).
    pub sticky_sync_softasync: bool,
    /// Keep a hard lock after the active count drains.
    pub sticky_lock: bool,
    /// Verbosity knob surfaced to the tracing subscriber by the embedder.
    pub debug: u8,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_size: 4096,
            cache_mid: 0.7,
            sticky_sync_normal: false,
            sticky_sync_softasync: false,
            sticky_lock: false,
            debug: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = CacheConfig::default();
        assert!(cfg.cache_size > 0);
        assert!(cfg.cache_mid > 0.0 && cfg.cache_mid < 1.0);
        assert!(!cfg.sticky_lock);
    }
}
