//! Hierarchical repository: values keyed by wildcard pattern, stored in a
//! segment trie and resolved to the single most specific match.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use mq_common::WildcardConfig;
use parking_lot::RwLock;

use super::pattern::{split_address, AddressPattern, Segment};
use crate::Result;

/// Resolutions kept before the cache is cleared and refilled on demand.
pub const DEFAULT_CACHE_CAPACITY: usize = 10_000;

struct TrieNode<T> {
    children: HashMap<Segment, TrieNode<T>>,
    entry: Option<(AddressPattern, T)>,
}

impl<T> TrieNode<T> {
    fn new() -> Self {
        Self {
            children: HashMap::new(),
            entry: None,
        }
    }

    fn is_empty(&self) -> bool {
        self.entry.is_none() && self.children.is_empty()
    }

    fn insert(&mut self, segments: &[Segment], pattern: AddressPattern, value: T) -> Option<T> {
        match segments.split_first() {
            None => self.entry.replace((pattern, value)).map(|(_, v)| v),
            Some((head, rest)) => self
                .children
                .entry(head.clone())
                .or_insert_with(TrieNode::new)
                .insert(rest, pattern, value),
        }
    }

    fn remove(&mut self, segments: &[Segment]) -> Option<T> {
        match segments.split_first() {
            None => self.entry.take().map(|(_, v)| v),
            Some((head, rest)) => {
                let child = self.children.get_mut(head)?;
                let removed = child.remove(rest);
                if child.is_empty() {
                    self.children.remove(head);
                }
                removed
            }
        }
    }

    fn collect<'a>(&'a self, address: &[&str], out: &mut Vec<&'a (AddressPattern, T)>) {
        if let Some(entry) = self.children.get(&Segment::AnyWords).and_then(|n| n.entry.as_ref()) {
            out.push(entry);
        }

        let Some((word, rest)) = address.split_first() else {
            if let Some(entry) = &self.entry {
                out.push(entry);
            }
            return;
        };

        if let Some(child) = self.children.get(&Segment::Literal(word.to_string())) {
            child.collect(rest, out);
        }
        if let Some(child) = self.children.get(&Segment::AnyWord) {
            child.collect(rest, out);
        }
    }

    fn patterns(&self, out: &mut Vec<String>) {
        if let Some((pattern, _)) = &self.entry {
            out.push(pattern.as_str().to_string());
        }
        for child in self.children.values() {
            child.patterns(out);
        }
    }
}

/// Pattern-keyed store with an always-present catch-all default.
///
/// Resolutions are cached per concrete address and tagged with the
/// generation they were computed at; any mutation bumps the generation so
/// stale entries are recomputed on next use. The cache holds at most
/// `cache_capacity` addresses and is cleared wholesale when full.
pub struct HierarchicalRepository<T> {
    wildcard: WildcardConfig,
    default: T,
    root: RwLock<TrieNode<T>>,
    generation: AtomicU64,
    cache: DashMap<String, (u64, T)>,
    cache_capacity: usize,
}

impl<T: Clone + Send + Sync> HierarchicalRepository<T> {
    pub fn new(wildcard: WildcardConfig, default: T) -> Self {
        Self::with_cache_capacity(wildcard, default, DEFAULT_CACHE_CAPACITY)
    }

    pub fn with_cache_capacity(wildcard: WildcardConfig, default: T, cache_capacity: usize) -> Self {
        Self {
            wildcard,
            default,
            root: RwLock::new(TrieNode::new()),
            generation: AtomicU64::new(0),
            cache: DashMap::new(),
            cache_capacity: cache_capacity.max(1),
        }
    }

    pub fn wildcard(&self) -> &WildcardConfig {
        &self.wildcard
    }

    /// Add or replace the value stored at `pattern`.
    pub fn add_match(&self, pattern: &str, value: T) -> Result<Option<T>> {
        let pattern = AddressPattern::parse(pattern, &self.wildcard)?;
        let segments = pattern.segments().to_vec();

        let previous = {
            let mut root = self.root.write();
            let previous = root.insert(&segments, pattern, value);
            self.generation.fetch_add(1, Ordering::SeqCst);
            previous
        };
        self.cache.clear();
        Ok(previous)
    }

    /// Remove the value stored at `pattern`. Removing the catch-all restores
    /// the default rather than leaving addresses unmatched.
    pub fn remove_match(&self, pattern: &str) -> Result<Option<T>> {
        let pattern = AddressPattern::parse(pattern, &self.wildcard)?;

        let removed = {
            let mut root = self.root.write();
            let removed = root.remove(pattern.segments());
            self.generation.fetch_add(1, Ordering::SeqCst);
            removed
        };
        self.cache.clear();
        Ok(removed)
    }

    /// Value at the most specific pattern matching `address`.
    pub fn get_match(&self, address: &str) -> T {
        let generation = self.generation.load(Ordering::SeqCst);
        if let Some(cached) = self.cache.get(address) {
            if cached.0 == generation {
                return cached.1.clone();
            }
        }

        let (generation, value) = {
            let root = self.root.read();
            let segments = split_address(address, &self.wildcard);
            let mut matches = Vec::new();
            root.collect(&segments, &mut matches);

            let value = matches
                .into_iter()
                .max_by(|a, b| a.0.compare_specificity(&b.0))
                .map(|(_, v)| v.clone())
                .unwrap_or_else(|| self.default.clone());
            (self.generation.load(Ordering::SeqCst), value)
        };

        if self.cache.len() >= self.cache_capacity && !self.cache.contains_key(address) {
            self.cache.clear();
        }
        self.cache.insert(address.to_string(), (generation, value.clone()));
        value
    }

    /// Drop the cached resolution for an address that no longer exists.
    pub fn evict(&self, address: &str) {
        self.cache.remove(address);
    }

    /// Pattern of the most specific match, `None` when only the default applies.
    pub fn matching_pattern(&self, address: &str) -> Option<String> {
        let root = self.root.read();
        let segments = split_address(address, &self.wildcard);
        let mut matches = Vec::new();
        root.collect(&segments, &mut matches);
        matches
            .into_iter()
            .max_by(|a, b| a.0.compare_specificity(&b.0))
            .map(|(p, _)| p.as_str().to_string())
    }

    pub fn patterns(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.root.read().patterns(&mut out);
        out.sort();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> HierarchicalRepository<&'static str> {
        HierarchicalRepository::new(WildcardConfig::default(), "default")
    }

    #[test]
    fn test_most_specific_match_wins() {
        let repo = repo();
        repo.add_match("#", "root").unwrap();
        repo.add_match("a.#", "a-any").unwrap();
        repo.add_match("a.*", "a-one").unwrap();
        repo.add_match("a.b.#", "ab-any").unwrap();
        repo.add_match("a.b.c", "exact").unwrap();

        assert_eq!(repo.get_match("a.b.c"), "exact");
        assert_eq!(repo.get_match("a.b.d"), "ab-any");
        assert_eq!(repo.get_match("a.x"), "a-one");
        assert_eq!(repo.get_match("a.x.y"), "a-any");
        assert_eq!(repo.get_match("a"), "a-any");
        assert_eq!(repo.get_match("z"), "root");
    }

    #[test]
    fn test_default_when_nothing_matches() {
        let repo = repo();
        repo.add_match("a.b", "ab").unwrap();
        assert_eq!(repo.get_match("x.y"), "default");
        assert_eq!(repo.matching_pattern("x.y"), None);
    }

    #[test]
    fn test_removal_invalidates_cached_resolution() {
        let repo = repo();
        repo.add_match("test.#", "test").unwrap();
        assert_eq!(repo.get_match("test.whatever"), "test");

        assert_eq!(repo.remove_match("test.#").unwrap(), Some("test"));
        assert_eq!(repo.get_match("test.whatever"), "default");
        assert!(repo.patterns().is_empty());
    }

    #[test]
    fn test_replacing_pattern_returns_previous() {
        let repo = repo();
        assert_eq!(repo.add_match("q.*", "first").unwrap(), None);
        assert_eq!(repo.add_match("q.*", "second").unwrap(), Some("first"));
        assert_eq!(repo.get_match("q.1"), "second");
        assert_eq!(repo.patterns(), vec!["q.*".to_string()]);
    }

    #[test]
    fn test_cache_stays_bounded() {
        let repo =
            HierarchicalRepository::with_cache_capacity(WildcardConfig::default(), "default", 4);
        repo.add_match("auto.#", "auto").unwrap();

        for i in 0..100 {
            assert_eq!(repo.get_match(&format!("auto.{}", i)), "auto");
            assert!(repo.cache.len() <= 4);
        }
        assert_eq!(repo.get_match("other"), "default");
    }

    #[test]
    fn test_evict_forgets_address() {
        let repo = repo();
        repo.get_match("gone");
        assert!(repo.cache.contains_key("gone"));

        repo.evict("gone");
        assert!(!repo.cache.contains_key("gone"));
        assert_eq!(repo.get_match("gone"), "default");
    }
}
