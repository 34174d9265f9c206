//! Synthesized audio cache.
//!
//! LRU bounded by total byte size rather than entry count, with a
//! time-to-live. Advisory only: it is lost on restart and never consulted
//! for correctness.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use super::{Bytes, CacheKey};

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: usize,
    pub max_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

struct Entry {
    audio: Bytes,
    inserted_at: Instant,
    tick: u64,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<CacheKey, Entry>,
    // tick -> key; the smallest tick is the least recently used entry
    recency: BTreeMap<u64, CacheKey>,
    next_tick: u64,
    total_bytes: usize,
}

impl CacheInner {
    fn tick(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    fn remove(&mut self, key: &CacheKey) -> Option<Entry> {
        let entry = self.entries.remove(key)?;
        self.recency.remove(&entry.tick);
        self.total_bytes -= entry.audio.len();
        Some(entry)
    }

    fn pop_lru(&mut self) -> Option<(CacheKey, Entry)> {
        let (_, key) = self.recency.pop_first()?;
        let entry = self.entries.remove(&key)?;
        self.total_bytes -= entry.audio.len();
        Some((key, entry))
    }
}

pub struct AudioCache {
    max_bytes: usize,
    ttl: Duration,
    inner: Mutex<CacheInner>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl AudioCache {
    pub fn new(max_bytes: usize, ttl: Duration) -> Self {
        Self {
            max_bytes,
            ttl,
            inner: Mutex::new(CacheInner::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Look up audio and mark it most recently used. Expired entries are dropped.
    pub fn get(&self, key: &CacheKey) -> Option<Bytes> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let expired = match inner.entries.get(key) {
            Some(entry) => entry.inserted_at.elapsed() > self.ttl,
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };
        if expired {
            inner.remove(key);
            self.misses.fetch_add(1, Ordering::Relaxed);
            debug!("Audio cache entry {key} expired");
            return None;
        }

        let tick = inner.tick();
        let entry = inner.entries.get_mut(key)?;
        let old_tick = std::mem::replace(&mut entry.tick, tick);
        let audio = entry.audio.clone();
        inner.recency.remove(&old_tick);
        inner.recency.insert(tick, key.clone());

        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(audio)
    }

    /// Insert audio, evicting least recently used entries until it fits.
    ///
    /// Returns false when the audio alone is larger than the cache.
    pub fn insert(&self, key: CacheKey, audio: Bytes) -> bool {
        let size = audio.len();
        if size > self.max_bytes {
            debug!("Not caching {size} bytes for {key}: larger than cache");
            return false;
        }

        let mut inner = self.inner.lock();
        inner.remove(&key);

        while inner.total_bytes + size > self.max_bytes {
            match inner.pop_lru() {
                Some((evicted, entry)) => {
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                    debug!("Evicted {evicted} ({} bytes)", entry.audio.len());
                }
                None => break,
            }
        }

        let tick = inner.tick();
        inner.recency.insert(tick, key.clone());
        inner.total_bytes += size;
        inner.entries.insert(
            key,
            Entry {
                audio,
                inserted_at: Instant::now(),
                tick,
            },
        );
        true
    }

    pub fn remove(&self, key: &CacheKey) -> bool {
        self.inner.lock().remove(key).is_some()
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let mut inner = self.inner.lock();
        let expired: Vec<CacheKey> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.inserted_at.elapsed() > self.ttl)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            inner.remove(key);
        }
        expired.len()
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            entries: inner.entries.len(),
            bytes: inner.total_bytes,
            max_bytes: self.max_bytes,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::speech::{cache_key, AudioFormat, SpeechRequest};

    fn key(text: &str) -> CacheKey {
        cache_key(&SpeechRequest {
            provider: "openai".into(),
            model: "tts-1".into(),
            voice: "alloy".into(),
            speed: 1.0,
            format: AudioFormat::Mp3,
            text: text.into(),
            instructions: None,
        })
    }

    fn audio(len: usize) -> Bytes {
        Bytes::from(vec![7u8; len])
    }

    #[test]
    fn evicts_least_recently_used_by_bytes() {
        let cache = AudioCache::new(100, Duration::from_secs(60));
        assert!(cache.insert(key("a"), audio(40)));
        assert!(cache.insert(key("b"), audio(40)));
        // touch "a" so "b" is now the oldest
        assert!(cache.get(&key("a")).is_some());
        assert!(cache.insert(key("c"), audio(40)));

        assert!(cache.get(&key("a")).is_some());
        assert!(cache.get(&key("b")).is_none());
        assert!(cache.get(&key("c")).is_some());

        let stats = cache.stats();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.bytes, 80);
        assert_eq!(stats.evictions, 1);
    }

    #[test]
    fn one_large_entry_can_evict_several_small_ones() {
        let cache = AudioCache::new(100, Duration::from_secs(60));
        for name in ["a", "b", "c", "d"] {
            cache.insert(key(name), audio(25));
        }
        cache.insert(key("big"), audio(90));
        let stats = cache.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.bytes, 90);
        assert_eq!(stats.evictions, 4);
    }

    #[test]
    fn oversized_audio_is_not_cached() {
        let cache = AudioCache::new(10, Duration::from_secs(60));
        assert!(!cache.insert(key("a"), audio(11)));
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn replacing_a_key_updates_size() {
        let cache = AudioCache::new(100, Duration::from_secs(60));
        cache.insert(key("a"), audio(30));
        cache.insert(key("a"), audio(50));
        let stats = cache.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.bytes, 50);
    }

    #[test]
    fn entries_expire_after_ttl() {
        let cache = AudioCache::new(100, Duration::from_millis(20));
        cache.insert(key("a"), audio(10));
        assert!(cache.get(&key("a")).is_some());
        std::thread::sleep(Duration::from_millis(40));
        assert!(cache.get(&key("a")).is_none());
        assert_eq!(cache.stats().bytes, 0);
    }

    #[test]
    fn purge_drops_only_expired() {
        let cache = AudioCache::new(100, Duration::from_millis(30));
        cache.insert(key("old"), audio(10));
        std::thread::sleep(Duration::from_millis(50));
        cache.insert(key("new"), audio(10));
        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.get(&key("new")).is_some());
    }
}
