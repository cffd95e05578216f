use lazy_static::lazy_static;
use regex::Regex;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use strsim::jaro_winkler;

lazy_static! {
    static ref WHITESPACE: Regex = Regex::new(r"\s+").unwrap();
}

/// Fuzzy matcher for names mentioned in questions against database values
pub struct FuzzyMatcher {
    /// Similarity threshold (0.0-1.0) for considering two strings as matches
    pub similarity_threshold: f64,
}

impl Default for FuzzyMatcher {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.80,
        }
    }
}

impl FuzzyMatcher {
    pub fn new(threshold: f64) -> Self {
        Self {
            similarity_threshold: threshold,
        }
    }

    /// Normalize a string for fuzzy matching
    /// - Converts to lowercase
    /// - Removes punctuation ("Betts, Lauren" -> "betts lauren")
    /// - Normalizes whitespace
    pub fn normalize_string(&self, s: &str) -> String {
        let normalized: String = s
            .to_lowercase()
            .chars()
            .map(|c| if c.is_alphanumeric() || c.is_whitespace() { c } else { ' ' })
            .collect();

        WHITESPACE.replace_all(normalized.trim(), " ").to_string()
    }

    fn sorted_tokens(normalized: &str) -> String {
        let mut tokens: Vec<&str> = normalized.split(' ').collect();
        tokens.sort_unstable();
        tokens.join(" ")
    }

    /// Calculate similarity between two strings
    /// Returns a score between 0.0 and 1.0 (higher = more similar)
    pub fn similarity(&self, s1: &str, s2: &str) -> f64 {
        let norm1 = self.normalize_string(s1);
        let norm2 = self.normalize_string(s2);
        if norm1.is_empty() || norm2.is_empty() {
            return 0.0;
        }
        if norm1 == norm2 {
            return 1.0;
        }

        // Token order differs between how people say names ("Lauren Betts")
        // and how the box scores store them ("Betts, Lauren")
        let direct = jaro_winkler(&norm1, &norm2);
        let reordered = jaro_winkler(&Self::sorted_tokens(&norm1), &Self::sorted_tokens(&norm2));
        let jw_score = direct.max(reordered);

        // Bonus for a surname alone ("Betts" vs "Betts Lauren"), scaled by how
        // much of the longer string it covers
        let is_substring = norm1.contains(&norm2) || norm2.contains(&norm1);
        let substring_bonus = if is_substring {
            let len_diff = (norm1.len() as f64 - norm2.len() as f64).abs();
            let max_len = norm1.len().max(norm2.len()) as f64;
            (1.0 - (len_diff / max_len)) * 0.1
        } else {
            0.0
        };

        (jw_score + substring_bonus).min(1.0)
    }

    /// Check if two strings are similar enough to be considered a match
    pub fn is_match(&self, s1: &str, s2: &str) -> bool {
        self.similarity(s1, s2) >= self.similarity_threshold
    }

    /// Find best matching option for `query`
    /// Returns (matched_option, similarity_score) if a match clears the threshold
    pub fn find_best_match(&self, query: &str, options: &[String]) -> Option<(String, f64)> {
        let mut best_match: Option<(String, f64)> = None;

        for option in options {
            let score = self.similarity(query, option);
            if score < self.similarity_threshold {
                continue;
            }
            if best_match.as_ref().map_or(true, |(_, best)| score > *best) {
                best_match = Some((option.clone(), score));
            }
        }

        best_match
    }
}

/// Type alias for cache key: (vocabulary, normalized query)
type CacheKey = (String, String);

/// LRU cache using HashMap + VecDeque
struct LruCache {
    /// Cache storage; `None` records a lookup that found no match
    data: HashMap<CacheKey, Option<String>>,
    /// Access order: most recently used at front, least recently used at back
    access_order: VecDeque<CacheKey>,
    max_size: usize,
}

impl LruCache {
    fn new(max_size: usize) -> Self {
        Self {
            data: HashMap::new(),
            access_order: VecDeque::with_capacity(max_size.min(1024)),
            max_size: max_size.max(1),
        }
    }

    /// Get a value from cache, promoting it to most recently used
    fn get(&mut self, key: &CacheKey) -> Option<Option<String>> {
        let value = self.data.get(key)?.clone();
        self.access_order.retain(|k| k != key);
        self.access_order.push_front(key.clone());
        Some(value)
    }

    /// Put a value into cache, evicting least recently used if needed
    fn put(&mut self, key: CacheKey, value: Option<String>) {
        if self.data.contains_key(&key) {
            self.access_order.retain(|k| k != &key);
        } else if self.data.len() >= self.max_size {
            if let Some(lru_key) = self.access_order.pop_back() {
                self.data.remove(&lru_key);
            }
        }

        self.access_order.push_front(key.clone());
        self.data.insert(key, value);
    }

    fn len(&self) -> usize {
        self.data.len()
    }
}

/// Bounded, thread-safe cache of fuzzy resolutions.
///
/// Concurrent callers may race to fill the same key; the work is idempotent
/// so the duplicate insert is harmless. The mutex only protects the map and
/// its recency order.
pub struct MatchCache {
    inner: Mutex<LruCache>,
    capacity: usize,
}

impl MatchCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Outer `None` is a cache miss; inner `None` is a cached "no match".
    pub fn get(&self, vocabulary: &str, query: &str) -> Option<Option<String>> {
        self.lock()
            .get(&(vocabulary.to_string(), query.to_lowercase()))
    }

    pub fn put(&self, vocabulary: &str, query: &str, resolved: Option<String>) {
        self.lock()
            .put((vocabulary.to_string(), query.to_lowercase()), resolved);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruCache> {
        // A panic while holding the lock cannot leave the map half-written
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
