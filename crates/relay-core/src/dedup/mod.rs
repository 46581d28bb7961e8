//! Duplicate prompt detection
//!
//! Two devices of the same user often submit the same prompt a moment apart. The
//! detector fingerprints normalized prompt content together with the user and session
//! key, and remembers each fingerprint for the dedup window.

use crate::config::DedupConfig;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::time::{Duration, Instant};

pub struct DuplicateDetector {
    seen: DashMap<String, Instant>,
    window: Duration,
}

impl DuplicateDetector {
    pub fn new(config: &DedupConfig) -> Self {
        Self::with_window(config.window())
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            seen: DashMap::new(),
            window,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// SHA-256 hex digest of the identifiers and the normalized prompt.
    pub fn fingerprint(user_id: &str, session_key: &str, prompt: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(user_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(session_key.as_bytes());
        hasher.update([0u8]);
        hasher.update(normalize(prompt).as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Record `hash` and report whether it was already seen inside the window.
    pub fn check_and_record(&self, hash: &str) -> bool {
        self.check_and_record_at(hash, Instant::now())
    }

    pub fn check_and_record_at(&self, hash: &str, now: Instant) -> bool {
        let window = self.window;
        let mut duplicate = false;
        self.seen
            .entry(hash.to_string())
            .and_modify(|first_seen| {
                if now.saturating_duration_since(*first_seen) < window {
                    duplicate = true;
                } else {
                    *first_seen = now;
                }
            })
            .or_insert(now);
        if duplicate {
            log::debug!("Duplicate fingerprint {}", &hash[..hash.len().min(12)]);
        }
        duplicate
    }

    /// Forget `hash`, so a retry after a failed hand-off is not treated as a duplicate.
    pub fn forget(&self, hash: &str) {
        self.seen.remove(hash);
    }

    /// Drop expired fingerprints. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> usize {
        let before = self.seen.len();
        let window = self.window;
        self.seen
            .retain(|_, first_seen| now.saturating_duration_since(*first_seen) < window);
        before.saturating_sub(self.seen.len())
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Trim and collapse internal whitespace runs to a single space.
pub fn normalize(prompt: &str) -> String {
    prompt.split_whitespace().collect::<Vec<_>>().join(" ")
}
