//! Metadata store: the process-external key/value + sorted-set store holding
//! the cache indices, the aggregate size and the API-key records.
//!
//! Layout:
//! - `image:<derivedPath>` — hash with field `size`
//! - `totalcachesize` — integer aggregate of all `size` fields
//! - `imageaccesstimestamps` — sorted set of derived paths by last access
//! - `imageaccesscounts` — sorted set of derived paths by hit count
//! - `api-keys` — set of keys; `key:<k>` — set of permission tokens

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::env;
use std::sync::Mutex;

use async_trait::async_trait;
use redis::AsyncCommands;

use crate::config::CachePolicy;
use crate::error::Error;

pub const REDIS_URL_ENV_VAR: &str = "IMGSERV_REDIS_URL";
pub const REDIS_PORT_ENV_VAR: &str = "IMGSERV_REDIS_PORT";
pub const REDIS_DEFAULT_PORT: u16 = 6379;

pub const API_KEYS_KEY: &str = "api-keys";

const RECORD_PREFIX: &str = "image:";
const SIZE_FIELD: &str = "size";
const TOTAL_CACHE_SIZE_KEY: &str = "totalcachesize";
const ACCESS_TIMESTAMPS_KEY: &str = "imageaccesstimestamps";
const ACCESS_COUNTS_KEY: &str = "imageaccesscounts";

fn record_key(derived_path: &str) -> String {
    format!("{RECORD_PREFIX}{derived_path}")
}

/// Set of permission tokens granted to an API key.
pub fn key_permissions_key(key: &str) -> String {
    format!("key:{key}")
}

fn policy_index(policy: CachePolicy) -> &'static str {
    match policy {
        CachePolicy::Lru => ACCESS_TIMESTAMPS_KEY,
        CachePolicy::Lfu => ACCESS_COUNTS_KEY,
    }
}

/// The store operations the cache indices and the auth snapshot need.
///
/// `record_insert` and `record_remove` are single atomic blocks from the
/// caller's viewpoint: the record, both access indices and the aggregate
/// move together.
#[async_trait]
pub trait MetaStore: Send + Sync {
    async fn record_exists(&self, derived_path: &str) -> Result<bool, Error>;

    /// Stored byte size of a record, `None` when the record is gone.
    async fn record_size(&self, derived_path: &str) -> Result<Option<i64>, Error>;

    async fn record_insert(&self, derived_path: &str, size: i64, now: i64) -> Result<(), Error>;

    async fn record_remove(&self, derived_path: &str, size: i64) -> Result<(), Error>;

    async fn total_cache_size(&self) -> Result<i64, Error>;

    /// Updates the access timestamp of a record.
    async fn touch(&self, derived_path: &str, now: i64) -> Result<(), Error>;

    /// Increments the hit count of a record.
    async fn bump_count(&self, derived_path: &str) -> Result<(), Error>;

    /// Up to `count` eviction candidates in ascending policy-score order.
    async fn victims(&self, policy: CachePolicy, count: usize) -> Result<Vec<String>, Error>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>, Error>;
}

/// Redis-backed store over one multiplexed connection.
#[derive(Clone)]
pub struct RedisStore {
    conn: redis::aio::MultiplexedConnection,
}

impl RedisStore {
    /// Connects using `IMGSERV_REDIS_URL`, falling back to
    /// `redis://127.0.0.1:<IMGSERV_REDIS_PORT|6379>`.
    pub async fn connect_from_env() -> Result<Self, Error> {
        let url = match env::var(REDIS_URL_ENV_VAR) {
            Ok(url) if !url.is_empty() => url,
            _ => {
                let port = env::var(REDIS_PORT_ENV_VAR)
                    .ok()
                    .and_then(|p| p.parse::<u16>().ok())
                    .unwrap_or(REDIS_DEFAULT_PORT);
                format!("redis://127.0.0.1:{port}")
            }
        };
        let client = redis::Client::open(url.as_str())?;
        let conn = client.get_multiplexed_async_connection().await?;
        tracing::info!(%url, "metadata store ready");
        Ok(RedisStore { conn })
    }
}

#[async_trait]
impl MetaStore for RedisStore {
    async fn record_exists(&self, derived_path: &str) -> Result<bool, Error> {
        let mut conn = self.conn.clone();
        Ok(conn.exists(record_key(derived_path)).await?)
    }

    async fn record_size(&self, derived_path: &str) -> Result<Option<i64>, Error> {
        let mut conn = self.conn.clone();
        Ok(conn.hget(record_key(derived_path), SIZE_FIELD).await?)
    }

    async fn record_insert(&self, derived_path: &str, size: i64, now: i64) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset(record_key(derived_path), SIZE_FIELD, size)
            .ignore()
            .zadd(ACCESS_TIMESTAMPS_KEY, derived_path, now)
            .ignore()
            .zadd(ACCESS_COUNTS_KEY, derived_path, 0)
            .ignore()
            .incr(TOTAL_CACHE_SIZE_KEY, size)
            .ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn record_remove(&self, derived_path: &str, size: i64) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .del(record_key(derived_path))
            .ignore()
            .zrem(ACCESS_TIMESTAMPS_KEY, derived_path)
            .ignore()
            .zrem(ACCESS_COUNTS_KEY, derived_path)
            .ignore()
            .decr(TOTAL_CACHE_SIZE_KEY, size)
            .ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn total_cache_size(&self) -> Result<i64, Error> {
        let mut conn = self.conn.clone();
        let total: Option<i64> = conn.get(TOTAL_CACHE_SIZE_KEY).await?;
        Ok(total.unwrap_or(0))
    }

    async fn touch(&self, derived_path: &str, now: i64) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        let _: () = conn.zadd(ACCESS_TIMESTAMPS_KEY, derived_path, now).await?;
        Ok(())
    }

    async fn bump_count(&self, derived_path: &str) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        let _: () = conn.zincr(ACCESS_COUNTS_KEY, derived_path, 1).await?;
        Ok(())
    }

    async fn victims(&self, policy: CachePolicy, count: usize) -> Result<Vec<String>, Error> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        Ok(conn
            .zrange(policy_index(policy), 0, count as isize - 1)
            .await?)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, Error> {
        let mut conn = self.conn.clone();
        Ok(conn.smembers(key).await?)
    }
}

/// In-process store with the same semantics, for tests and embedding.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    hashes: HashMap<String, HashMap<String, i64>>,
    counters: HashMap<String, i64>,
    // member -> score
    zsets: HashMap<String, BTreeMap<String, i64>>,
    sets: HashMap<String, BTreeSet<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    /// Seeds a plain set; used to stage API-key records.
    pub fn sadd(&self, key: &str, member: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
    }

    /// Membership of both access indices, for invariant checks.
    pub fn index_members(&self) -> (BTreeSet<String>, BTreeSet<String>) {
        let inner = self.inner.lock().unwrap();
        let members = |key: &str| {
            inner
                .zsets
                .get(key)
                .map(|z| z.keys().cloned().collect())
                .unwrap_or_default()
        };
        (members(ACCESS_TIMESTAMPS_KEY), members(ACCESS_COUNTS_KEY))
    }

    /// Sum of `size` over all records, for invariant checks.
    pub fn sum_of_record_sizes(&self) -> i64 {
        let inner = self.inner.lock().unwrap();
        inner
            .hashes
            .iter()
            .filter(|(key, _)| key.starts_with(RECORD_PREFIX))
            .filter_map(|(_, fields)| fields.get(SIZE_FIELD))
            .sum()
    }
}

#[async_trait]
impl MetaStore for MemoryStore {
    async fn record_exists(&self, derived_path: &str) -> Result<bool, Error> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.hashes.contains_key(&record_key(derived_path)))
    }

    async fn record_size(&self, derived_path: &str) -> Result<Option<i64>, Error> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .hashes
            .get(&record_key(derived_path))
            .and_then(|fields| fields.get(SIZE_FIELD))
            .copied())
    }

    async fn record_insert(&self, derived_path: &str, size: i64, now: i64) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .hashes
            .entry(record_key(derived_path))
            .or_default()
            .insert(SIZE_FIELD.to_string(), size);
        inner
            .zsets
            .entry(ACCESS_TIMESTAMPS_KEY.to_string())
            .or_default()
            .insert(derived_path.to_string(), now);
        inner
            .zsets
            .entry(ACCESS_COUNTS_KEY.to_string())
            .or_default()
            .insert(derived_path.to_string(), 0);
        *inner.counters.entry(TOTAL_CACHE_SIZE_KEY.to_string()).or_default() += size;
        Ok(())
    }

    async fn record_remove(&self, derived_path: &str, size: i64) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        inner.hashes.remove(&record_key(derived_path));
        for index in [ACCESS_TIMESTAMPS_KEY, ACCESS_COUNTS_KEY] {
            if let Some(zset) = inner.zsets.get_mut(index) {
                zset.remove(derived_path);
            }
        }
        *inner.counters.entry(TOTAL_CACHE_SIZE_KEY.to_string()).or_default() -= size;
        Ok(())
    }

    async fn total_cache_size(&self) -> Result<i64, Error> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.counters.get(TOTAL_CACHE_SIZE_KEY).copied().unwrap_or(0))
    }

    async fn touch(&self, derived_path: &str, now: i64) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .zsets
            .entry(ACCESS_TIMESTAMPS_KEY.to_string())
            .or_default()
            .insert(derived_path.to_string(), now);
        Ok(())
    }

    async fn bump_count(&self, derived_path: &str) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        *inner
            .zsets
            .entry(ACCESS_COUNTS_KEY.to_string())
            .or_default()
            .entry(derived_path.to_string())
            .or_default() += 1;
        Ok(())
    }

    async fn victims(&self, policy: CachePolicy, count: usize) -> Result<Vec<String>, Error> {
        let inner = self.inner.lock().unwrap();
        let Some(zset) = inner.zsets.get(policy_index(policy)) else {
            return Ok(Vec::new());
        };
        let mut entries: Vec<(&String, &i64)> = zset.iter().map(|(m, s)| (m, s)).collect();
        // Score order, ties broken by member ordering, as redis does.
        entries.sort_by(|a, b| a.1.cmp(b.1).then_with(|| a.0.cmp(b.0)));
        Ok(entries.into_iter().take(count).map(|(m, _)| m.clone()).collect())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, Error> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }
}
