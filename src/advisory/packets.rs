//! Packet Cache
//!
//! Pre-computed advice bundles keyed by recent tool patterns. A packet is
//! stored under an exact key (tool + normalized argument head + session
//! phase) and a relaxed key (tool only), so retrieval can loosen predicates
//! when the exact pattern misses.

use super::AdviceItem;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Packet {
    pub key: String,
    pub items: Vec<AdviceItem>,
    pub built_at_s: i64,
}

pub struct PacketCache {
    inner: Mutex<LruCache<String, Packet>>,
}

/// Exact packet key: hash(tool, normalized_arg_head, session_phase)
pub fn exact_key(tool: &str, arg_head: &str, phase: &str) -> String {
    let normalized = arg_head
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    let mut hasher = Sha256::new();
    hasher.update(tool.as_bytes());
    hasher.update(b"|");
    hasher.update(normalized.as_bytes());
    hasher.update(b"|");
    hasher.update(phase.as_bytes());
    hex::encode(&hasher.finalize()[..8])
}

/// Relaxed key drops everything but the tool
pub fn relaxed_key(tool: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"tool-only|");
    hasher.update(tool.as_bytes());
    hex::encode(&hasher.finalize()[..8])
}

impl PacketCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get_exact(&self, tool: &str, arg_head: &str, phase: &str) -> Option<Packet> {
        self.inner
            .lock()
            .get(&exact_key(tool, arg_head, phase))
            .cloned()
    }

    pub fn get_relaxed(&self, tool: &str) -> Option<Packet> {
        self.inner.lock().get(&relaxed_key(tool)).cloned()
    }

    /// Cache a fresh live result under both the exact and relaxed keys.
    pub fn store(
        &self,
        tool: &str,
        arg_head: &str,
        phase: &str,
        items: Vec<AdviceItem>,
        now_s: i64,
    ) {
        if items.is_empty() {
            return;
        }
        let exact = exact_key(tool, arg_head, phase);
        let relaxed = relaxed_key(tool);
        let mut inner = self.inner.lock();
        inner.put(
            exact.clone(),
            Packet {
                key: exact,
                items: items.clone(),
                built_at_s: now_s,
            },
        );
        inner.put(
            relaxed.clone(),
            Packet {
                key: relaxed,
                items,
                built_at_s: now_s,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
