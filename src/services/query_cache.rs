// Query Result Cache Service
//
// Caches query results per query name and bound parameter values, with TTL
// expiry, LRU eviction and pattern-based invalidation.

use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

use crate::api::middleware::AppError;
use crate::models::{BoundValue, QueryResult, ResolvedPage};

const NULL_MARK: &str = "%null";
const PAGE_PARAM: &str = "$page";
const SIZE_PARAM: &str = "$size";

/// Percent-escape the characters that carry meaning in keys and patterns
fn escape_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '%' => out.push_str("%25"),
            ':' => out.push_str("%3A"),
            '*' => out.push_str("%2A"),
            '=' => out.push_str("%3D"),
            other => out.push(other),
        }
    }
    out
}

/// Cache key: `<query>:<name=value>:<name=value>` with names sorted.
///
/// Pagination is folded in as the reserved `$page` / `$size` pairs so each
/// page of a result is cached separately.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    query: String,
    key: String,
}

impl CacheKey {
    pub fn new(query: &str, params: &[(String, BoundValue)], page: Option<&ResolvedPage>) -> Self {
        let mut pairs: Vec<(String, String)> = params
            .iter()
            .map(|(name, value)| {
                let value = match value.to_text() {
                    Some(text) => escape_component(&text),
                    None => NULL_MARK.to_string(),
                };
                (escape_component(name), value)
            })
            .collect();

        if let Some(page) = page {
            pairs.push((PAGE_PARAM.to_string(), page.page.to_string()));
            pairs.push((SIZE_PARAM.to_string(), page.size.to_string()));
        }
        pairs.sort();

        let mut key = escape_component(query);
        for (name, value) in pairs {
            key.push(':');
            key.push_str(&name);
            key.push('=');
            key.push_str(&value);
        }

        Self {
            query: query.to_string(),
            key,
        }
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

/// A parsed invalidation pattern.
///
/// The first segment globs the query name; every further segment globs one
/// `name=value` pair that must be present. A trailing `*` segment allows any
/// additional pairs, and a bare query glob matches every variant of the query.
#[derive(Debug, Clone)]
pub struct KeyPattern {
    raw: String,
    query: Regex,
    pairs: Vec<Regex>,
    open: bool,
}

impl KeyPattern {
    pub fn parse(pattern: &str) -> Result<Self, AppError> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return Err(AppError::Validation("Cache pattern must not be empty".to_string()));
        }

        let mut segments: Vec<&str> = pattern.split(':').collect();
        let query = Self::glob(segments.remove(0))?;
        let open = segments.is_empty() || segments.last() == Some(&"*");
        if segments.last() == Some(&"*") {
            segments.pop();
        }

        let pairs = segments
            .into_iter()
            .map(|segment| match segment.split_once('=') {
                Some(_) => Self::glob(segment),
                None => Err(AppError::Validation(format!(
                    "Invalid cache pattern segment '{}': expected name=value",
                    segment
                ))),
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            raw: pattern.to_string(),
            query,
            pairs,
            open,
        })
    }

    fn glob(segment: &str) -> Result<Regex, AppError> {
        let literal = segment.replace('%', "%25");
        let expr = format!("^{}$", regex::escape(&literal).replace(r"\*", ".*"));
        Regex::new(&expr).map_err(|e| AppError::Validation(format!("Invalid cache pattern '{}': {}", segment, e)))
    }

    pub fn matches(&self, key: &str) -> bool {
        let mut segments = key.split(':');
        let query_matches = segments.next().map(|q| self.query.is_match(q)).unwrap_or(false);
        if !query_matches {
            return false;
        }

        let pairs: Vec<&str> = segments.collect();
        if !self.open && pairs.len() != self.pairs.len() {
            return false;
        }
        self.pairs.iter().all(|glob| pairs.iter().any(|pair| glob.is_match(pair)))
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

/// Cached query result with metadata
#[derive(Debug, Clone)]
struct CachedResult {
    result: QueryResult,
    query: String,
    cached_at: Instant,
    ttl: Duration,
    last_accessed: Instant,
}

impl CachedResult {
    /// Check if cache entry is expired
    fn is_expired(&self) -> bool {
        self.cached_at.elapsed() >= self.ttl
    }
}

#[derive(Debug, Default)]
struct QueryCounters {
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Overall request counters
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OverallStatistics {
    pub total_requests: u64,
    pub total_hits: u64,
    pub total_misses: u64,
    pub hit_rate: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueryStatistics {
    pub requests: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

/// Cache statistics
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatistics {
    pub overall: OverallStatistics,
    pub per_query: BTreeMap<String, QueryStatistics>,
    pub entries: usize,
    pub evictions: u64,
    pub expirations: u64,
}

fn hit_rate(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}

/// Query result cache with LRU eviction and TTL
pub struct QueryResultCache {
    entries: Mutex<HashMap<String, CachedResult>>,
    max_entries: usize,
    /// Bumped by every invalidation; fills started under an older generation are dropped
    generation: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    per_query: Mutex<HashMap<String, Arc<QueryCounters>>>,
}

impl QueryResultCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_entries: max_entries.max(1),
            generation: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            per_query: Mutex::new(HashMap::new()),
        }
    }

    fn lock_entries(&self) -> MutexGuard<'_, HashMap<String, CachedResult>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn counters(&self, query: &str) -> Arc<QueryCounters> {
        let mut per_query = self.per_query.lock().unwrap_or_else(PoisonError::into_inner);
        per_query.entry(query.to_string()).or_default().clone()
    }

    fn record(&self, query: &str, hit: bool) {
        let counters = self.counters(query);
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
            counters.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            counters.misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Get cached result if available and not expired.
    /// Expired entries count as misses and are removed.
    pub fn get(&self, key: &CacheKey) -> Option<QueryResult> {
        let found = {
            let mut entries = self.lock_entries();
            match entries.get(key.as_str()).map(CachedResult::is_expired) {
                Some(true) => {
                    entries.remove(key.as_str());
                    self.expirations.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!("Cache expired for key: {}", key);
                    None
                }
                Some(false) => entries.get_mut(key.as_str()).map(|cached| {
                    cached.last_accessed = Instant::now();
                    cached.result.clone()
                }),
                None => None,
            }
        };

        self.record(key.query(), found.is_some());
        match &found {
            Some(_) => tracing::debug!("Cache hit for key: {}", key),
            None => tracing::debug!("Cache miss for key: {}", key),
        }
        found
    }

    /// Generation to pass to [`put`](Self::put) for a fill that starts now
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Store a result unless an invalidation happened since `generation` was
    /// read. Returns whether the entry was stored.
    pub fn put(&self, key: &CacheKey, result: QueryResult, ttl: Duration, generation: u64) -> bool {
        if ttl.is_zero() {
            return false;
        }

        let mut entries = self.lock_entries();
        if self.generation.load(Ordering::Acquire) != generation {
            tracing::debug!("Discarding stale cache fill for key: {}", key);
            return false;
        }

        if entries.len() >= self.max_entries && !entries.contains_key(key.as_str()) {
            self.evict_lru(&mut entries);
        }

        let now = Instant::now();
        entries.insert(
            key.as_str().to_string(),
            CachedResult {
                result,
                query: key.query().to_string(),
                cached_at: now,
                ttl,
                last_accessed: now,
            },
        );
        tracing::debug!("Cached result for key: {} (cache size: {})", key, entries.len());
        true
    }

    /// Evict least recently used entry
    fn evict_lru(&self, entries: &mut HashMap<String, CachedResult>) {
        let oldest = entries
            .iter()
            .min_by_key(|(_, cached)| cached.last_accessed)
            .map(|(key, _)| key.clone());

        if let Some(key) = oldest {
            entries.remove(&key);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Evicted cache entry: {}", key);
        }
    }

    /// Remove every entry matching any of the patterns; returns how many
    pub fn invalidate<S: AsRef<str>>(&self, patterns: &[S]) -> Result<usize, AppError> {
        let patterns = patterns
            .iter()
            .map(|p| KeyPattern::parse(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;

        let mut entries = self.lock_entries();
        self.generation.fetch_add(1, Ordering::AcqRel);
        let before = entries.len();
        entries.retain(|key, _| !patterns.iter().any(|p| p.matches(key)));
        let removed = before - entries.len();

        tracing::info!(
            "Invalidated {} cache entries for patterns [{}]",
            removed,
            patterns.iter().map(KeyPattern::as_str).collect::<Vec<_>>().join(", ")
        );
        Ok(removed)
    }

    /// Clear all cache entries
    pub fn clear(&self) -> usize {
        let mut entries = self.lock_entries();
        self.generation.fetch_add(1, Ordering::AcqRel);
        let count = entries.len();
        entries.clear();

        tracing::info!("Cleared {} cache entries", count);
        count
    }

    /// Get current cache size
    pub fn size(&self) -> usize {
        self.lock_entries().len()
    }

    /// Number of live entries belonging to one query
    pub fn entries_for(&self, query: &str) -> usize {
        self.lock_entries().values().filter(|c| c.query == query).count()
    }

    pub fn statistics(&self) -> CacheStatistics {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);

        let per_query = self
            .per_query
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, counters)| {
                let hits = counters.hits.load(Ordering::Relaxed);
                let misses = counters.misses.load(Ordering::Relaxed);
                (
                    name.clone(),
                    QueryStatistics {
                        requests: hits + misses,
                        hits,
                        misses,
                        hit_rate: hit_rate(hits, misses),
                    },
                )
            })
            .collect();

        CacheStatistics {
            overall: OverallStatistics {
                total_requests: hits + misses,
                total_hits: hits,
                total_misses: misses,
                hit_rate: hit_rate(hits, misses),
            },
            per_query,
            entries: self.size(),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }

    /// Remove expired entries
    pub fn cleanup_expired(&self) -> usize {
        let mut entries = self.lock_entries();
        let before = entries.len();
        entries.retain(|_, cached| !cached.is_expired());
        let removed = before - entries.len();

        if removed > 0 {
            self.expirations.fetch_add(removed as u64, Ordering::Relaxed);
            tracing::info!("Cleaned up {} expired cache entries", removed);
        }
        removed
    }

    /// Sweep expired entries in the background
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                cache.cleanup_expired();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn create_test_result() -> QueryResult {
        let row = json!({"id": 1, "symbol": "AAPL"});
        QueryResult::Simple {
            data: vec![row.as_object().unwrap().clone()],
            cached: false,
        }
    }

    fn key(query: &str, params: &[(&str, BoundValue)]) -> CacheKey {
        let params: Vec<(String, BoundValue)> = params.iter().map(|(n, v)| (n.to_string(), v.clone())).collect();
        CacheKey::new(query, &params, None)
    }

    fn text(s: &str) -> BoundValue {
        BoundValue::Text(s.to_string())
    }

    #[test]
    fn test_key_sorts_parameter_names() {
        let a = key("trades", &[("symbol", text("AAPL")), ("day", text("2024-01-02"))]);
        let b = key("trades", &[("day", text("2024-01-02")), ("symbol", text("AAPL"))]);
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "trades:day=2024-01-02:symbol=AAPL");
    }

    #[test]
    fn test_key_escapes_and_nulls() {
        let k = key("q", &[("note", text("a:b*c%")), ("opt", BoundValue::Null)]);
        assert_eq!(k.as_str(), "q:note=a%3Ab%2Ac%25:opt=%null");
        assert_ne!(k, key("q", &[("note", text("a:b*c%")), ("opt", text("%null"))]));
    }

    #[test]
    fn test_key_includes_page() {
        let page = ResolvedPage { page: 2, size: 20 };
        let k = CacheKey::new("list", &[("symbol".into(), text("AAPL"))], Some(&page));
        assert_eq!(k.as_str(), "list:$page=2:$size=20:symbol=AAPL");
    }

    #[test]
    fn test_pattern_matching() {
        let aapl = key("get_trades_by_symbol", &[("symbol", text("AAPL"))]);
        let paged = CacheKey::new(
            "get_trades_by_symbol",
            &[("symbol".into(), text("AAPL"))],
            Some(&ResolvedPage { page: 0, size: 20 }),
        );
        let msft = key("get_trades_by_symbol", &[("symbol", text("MSFT"))]);

        let exact = KeyPattern::parse("get_trades_by_symbol:symbol=AAPL").unwrap();
        assert!(exact.matches(aapl.as_str()));
        assert!(!exact.matches(paged.as_str()));
        assert!(!exact.matches(msft.as_str()));

        let open = KeyPattern::parse("get_trades_by_symbol:symbol=AAPL:*").unwrap();
        assert!(open.matches(aapl.as_str()));
        assert!(open.matches(paged.as_str()));
        assert!(!open.matches(msft.as_str()));

        let bare = KeyPattern::parse("get_trades_*").unwrap();
        assert!(bare.matches(msft.as_str()));
        assert!(!bare.matches("list_trades"));

        assert!(KeyPattern::parse("").is_err());
        assert!(KeyPattern::parse("q:nonsense").is_err());
    }

    #[test]
    fn test_cache_put_and_get() {
        let cache = QueryResultCache::new(10);
        let k = key("q", &[("id", BoundValue::Integer(1))]);
        assert!(cache.put(&k, create_test_result(), Duration::from_secs(60), cache.generation()));

        let cached = cache.get(&k).unwrap();
        assert_eq!(cached.data().len(), 1);
        assert!(cache.get(&key("q", &[("id", BoundValue::Integer(2))])).is_none());
    }

    #[test]
    fn test_cache_expiration() {
        let cache = QueryResultCache::new(10);
        let k = key("q", &[]);
        cache.put(&k, create_test_result(), Duration::from_millis(100), cache.generation());

        // Should exist immediately
        assert!(cache.get(&k).is_some());

        // Wait for expiration
        std::thread::sleep(Duration::from_millis(150));

        // Should be expired
        assert!(cache.get(&k).is_none());
        assert_eq!(cache.statistics().expirations, 1);
    }

    #[test]
    fn test_cache_stats() {
        let cache = QueryResultCache::new(10);
        let k = key("q", &[]);
        cache.put(&k, create_test_result(), Duration::from_secs(60), cache.generation());

        // Generate some hits and misses
        cache.get(&k); // hit
        cache.get(&k); // hit
        cache.get(&key("other", &[])); // miss

        let stats = cache.statistics();
        assert_eq!(stats.overall.total_hits, 2);
        assert_eq!(stats.overall.total_misses, 1);
        assert_eq!(stats.overall.total_requests, 3);
        assert!(stats.overall.hit_rate > 0.6);
        assert_eq!(stats.per_query["q"].hits, 2);
        assert_eq!(stats.per_query["other"].misses, 1);
    }

    #[test]
    fn test_targeted_invalidation() {
        let cache = QueryResultCache::new(10);
        let aapl = key("get_trades_by_symbol", &[("symbol", text("AAPL"))]);
        let msft = key("get_trades_by_symbol", &[("symbol", text("MSFT"))]);
        for k in [&aapl, &msft] {
            cache.put(k, create_test_result(), Duration::from_secs(60), cache.generation());
        }

        let removed = cache.invalidate(&["get_trades_by_symbol:symbol=AAPL:*"]).unwrap();
        assert_eq!(removed, 1);
        assert!(cache.get(&aapl).is_none());
        assert!(cache.get(&msft).is_some());
    }

    #[test]
    fn test_stale_fill_discarded() {
        let cache = QueryResultCache::new(10);
        let k = key("q", &[]);
        let generation = cache.generation();
        cache.invalidate(&["q"]).unwrap();
        assert!(!cache.put(&k, create_test_result(), Duration::from_secs(60), generation));
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn test_cache_clear() {
        let cache = QueryResultCache::new(10);
        cache.put(&key("a", &[]), create_test_result(), Duration::from_secs(60), cache.generation());
        cache.put(&key("b", &[]), create_test_result(), Duration::from_secs(60), cache.generation());

        assert_eq!(cache.size(), 2);
        assert_eq!(cache.clear(), 2);
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn test_lru_eviction() {
        let cache = QueryResultCache::new(3); // Max 3 entries
        let ttl = Duration::from_secs(60);

        // Fill cache
        cache.put(&key("k1", &[]), create_test_result(), ttl, cache.generation());
        std::thread::sleep(Duration::from_millis(10));
        cache.put(&key("k2", &[]), create_test_result(), ttl, cache.generation());
        std::thread::sleep(Duration::from_millis(10));
        cache.put(&key("k3", &[]), create_test_result(), ttl, cache.generation());

        // Touch k1 so k2 becomes the least recently used
        std::thread::sleep(Duration::from_millis(10));
        assert!(cache.get(&key("k1", &[])).is_some());

        std::thread::sleep(Duration::from_millis(10));
        cache.put(&key("k4", &[]), create_test_result(), ttl, cache.generation());

        assert_eq!(cache.size(), 3);
        assert!(cache.get(&key("k2", &[])).is_none()); // Evicted
        assert!(cache.get(&key("k1", &[])).is_some());
        assert!(cache.get(&key("k4", &[])).is_some());
        assert_eq!(cache.statistics().evictions, 1);
    }

    #[test]
    fn test_cleanup_expired() {
        let cache = QueryResultCache::new(10);
        cache.put(&key("short", &[]), create_test_result(), Duration::from_millis(20), cache.generation());
        cache.put(&key("long", &[]), create_test_result(), Duration::from_secs(60), cache.generation());
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(cache.cleanup_expired(), 1);
        assert_eq!(cache.entries_for("long"), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_counters_survive_concurrent_access() {
        const TASKS: usize = 16;
        const ROUNDS: usize = 250;

        let cache = Arc::new(QueryResultCache::new(64));
        let mut handles = Vec::with_capacity(TASKS);

        for task in 0..TASKS {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move {
                for round in 0..ROUNDS {
                    let query = if (task + round) % 2 == 0 { "stock_trades" } else { "stock_quotes" };
                    let k = key(query, &[("symbol", text(["AAPL", "MSFT", "GOOG"][round % 3]))]);

                    let generation = cache.generation();
                    if cache.get(&k).is_none() {
                        cache.put(&k, create_test_result(), Duration::from_secs(60), generation);
                    }
                    if round % 25 == task % 25 {
                        cache.invalidate(&["stock_*"]).unwrap();
                    }
                    tokio::task::yield_now().await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let stats = cache.statistics();
        let calls = (TASKS * ROUNDS) as u64;
        assert_eq!(stats.overall.total_hits + stats.overall.total_misses, calls);
        assert_eq!(stats.overall.total_requests, calls);
        assert!(stats.overall.total_hits > 0);

        let per_query_hits: u64 = stats.per_query.values().map(|q| q.hits).sum();
        let per_query_misses: u64 = stats.per_query.values().map(|q| q.misses).sum();
        assert_eq!(per_query_hits, stats.overall.total_hits);
        assert_eq!(per_query_misses, stats.overall.total_misses);
        assert_eq!(stats.per_query["stock_trades"].requests, calls / 2);
        assert_eq!(stats.per_query["stock_quotes"].requests, calls / 2);
    }
}
