/* arestor/src/store.rs

Keyed secret store: a resilient client over the remote key-value store.

Schema (Redis hashes):
- user.secret          api_key -> secret string
- user.info            api_key -> JSON user record
- resource.<namespace> name    -> JSON resource record

Connection policy:
- A single connection handle lives behind a mutex and is never handed out.
- Every accessor first runs `refresh` with the configured attempt budget:
  probe the current handle with PING, otherwise reconnect (a new handle only
  counts once it answers PING). The first live handle ends the loop.
- Running out of attempts is the only fatal condition (ConnectionRefused).
- A connection-level failure while running a command drops the handle so the
  next access reconnects.

Backends:
- redis://host:port/db  blocking `redis` connection
- memory                in-process hashes (tests, local development)
*/

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const SECRET_HASH: &str = "user.secret";
pub const USER_HASH: &str = "user.info";
pub const DEFAULT_RETRIES: u32 = 3;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("connection refused after {attempts} attempt(s)")]
    ConnectionRefused { attempts: u32 },
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("stored value is not valid JSON: {0}")]
    Deserialize(#[from] serde_json::Error),
    #[error("store connection lock poisoned")]
    Poisoned,
}

impl StoreError {
    /// True when the handle that produced this error should not be reused.
    fn is_connection_failure(&self) -> bool {
        match self {
            StoreError::Redis(err) => err.is_io_error() || err.is_connection_dropped(),
            StoreError::Unavailable(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

// ==============================
// Records
// ==============================

/// User record kept under `user.info`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

/// One piece of mocked metadata, as posted by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub resource: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default)]
    pub namespace: String,
}

fn resource_hash(namespace: &str) -> String {
    format!("resource.{}", namespace)
}

// ==============================
// Connection traits
// ==============================

/// A live link to the remote store.
pub trait StoreConnection: Send {
    fn ping(&mut self) -> Result<()>;
    fn hget(&mut self, hash: &str, field: &str) -> Result<Option<String>>;
    fn hset(&mut self, hash: &str, field: &str, value: &str) -> Result<()>;
    fn hdel(&mut self, hash: &str, field: &str) -> Result<bool>;
    fn hgetall(&mut self, hash: &str) -> Result<HashMap<String, String>>;
}

/// Produces fresh connections for the store to own.
pub trait StoreConnector: Send + Sync {
    fn connect(&self) -> Result<Box<dyn StoreConnection>>;
}

// ==============================
// Redis backend
// ==============================

mod redis_store_impl {
    use super::*;

    pub struct RedisConnector {
        client: redis::Client,
    }

    impl RedisConnector {
        pub fn open(url: &str) -> Result<Self> {
            let client = redis::Client::open(url)?;
            Ok(Self { client })
        }
    }

    impl StoreConnector for RedisConnector {
        fn connect(&self) -> Result<Box<dyn StoreConnection>> {
            let conn = self.client.get_connection()?;
            Ok(Box::new(RedisConnection { conn }))
        }
    }

    struct RedisConnection {
        conn: redis::Connection,
    }

    impl StoreConnection for RedisConnection {
        fn ping(&mut self) -> Result<()> {
            let _: String = redis::cmd("PING").query(&mut self.conn)?;
            Ok(())
        }

        fn hget(&mut self, hash: &str, field: &str) -> Result<Option<String>> {
            let val: Option<String> = redis::cmd("HGET")
                .arg(hash)
                .arg(field)
                .query(&mut self.conn)?;
            Ok(val)
        }

        fn hset(&mut self, hash: &str, field: &str, value: &str) -> Result<()> {
            let _: i64 = redis::cmd("HSET")
                .arg(hash)
                .arg(field)
                .arg(value)
                .query(&mut self.conn)?;
            Ok(())
        }

        fn hdel(&mut self, hash: &str, field: &str) -> Result<bool> {
            let n: i64 = redis::cmd("HDEL")
                .arg(hash)
                .arg(field)
                .query(&mut self.conn)?;
            Ok(n > 0)
        }

        fn hgetall(&mut self, hash: &str) -> Result<HashMap<String, String>> {
            let map: HashMap<String, String> =
                redis::cmd("HGETALL").arg(hash).query(&mut self.conn)?;
            Ok(map)
        }
    }
}

pub use redis_store_impl::RedisConnector;

// ==============================
// In-memory backend
// ==============================

mod memory_store_impl {
    use super::*;

    struct Shared {
        hashes: RwLock<HashMap<String, HashMap<String, String>>>,
        reachable: AtomicBool,
    }

    /// In-process stand-in for Redis. Clones share the same data.
    #[derive(Clone)]
    pub struct MemoryConnector {
        shared: Arc<Shared>,
    }

    impl Default for MemoryConnector {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MemoryConnector {
        pub fn new() -> Self {
            Self {
                shared: Arc::new(Shared {
                    hashes: RwLock::new(HashMap::new()),
                    reachable: AtomicBool::new(true),
                }),
            }
        }

        /// Simulate the store going away (or coming back).
        pub fn set_reachable(&self, reachable: bool) {
            self.shared.reachable.store(reachable, Ordering::SeqCst);
        }
    }

    impl StoreConnector for MemoryConnector {
        fn connect(&self) -> Result<Box<dyn StoreConnection>> {
            if !self.shared.reachable.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("memory store offline".into()));
            }
            Ok(Box::new(MemoryConnection {
                shared: self.shared.clone(),
            }))
        }
    }

    struct MemoryConnection {
        shared: Arc<Shared>,
    }

    impl MemoryConnection {
        fn check(&self) -> Result<()> {
            if self.shared.reachable.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(StoreError::Unavailable("memory store offline".into()))
            }
        }
    }

    impl StoreConnection for MemoryConnection {
        fn ping(&mut self) -> Result<()> {
            self.check()
        }

        fn hget(&mut self, hash: &str, field: &str) -> Result<Option<String>> {
            self.check()?;
            let g = self.shared.hashes.read().map_err(|_| StoreError::Poisoned)?;
            Ok(g.get(hash).and_then(|h| h.get(field)).cloned())
        }

        fn hset(&mut self, hash: &str, field: &str, value: &str) -> Result<()> {
            self.check()?;
            let mut g = self.shared.hashes.write().map_err(|_| StoreError::Poisoned)?;
            g.entry(hash.to_string())
                .or_default()
                .insert(field.to_string(), value.to_string());
            Ok(())
        }

        fn hdel(&mut self, hash: &str, field: &str) -> Result<bool> {
            self.check()?;
            let mut g = self.shared.hashes.write().map_err(|_| StoreError::Poisoned)?;
            Ok(g.get_mut(hash)
                .map(|h| h.remove(field).is_some())
                .unwrap_or(false))
        }

        fn hgetall(&mut self, hash: &str) -> Result<HashMap<String, String>> {
            self.check()?;
            let g = self.shared.hashes.read().map_err(|_| StoreError::Poisoned)?;
            Ok(g.get(hash).cloned().unwrap_or_default())
        }
    }
}

pub use memory_store_impl::MemoryConnector;

// Backends selectable at runtime via CLI/env
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    Redis { url: String },
    Memory,
}

impl StoreBackend {
    /// Parse a backend spec string:
    /// - "redis://..." → Redis at URL
    /// - "memory"      → In-memory backend
    pub fn from_spec(spec: &str) -> Option<Self> {
        let spec = spec.trim();
        if spec.starts_with("redis://") || spec.starts_with("rediss://") {
            return Some(StoreBackend::Redis {
                url: spec.to_string(),
            });
        }
        if spec.eq_ignore_ascii_case("memory") {
            return Some(StoreBackend::Memory);
        }
        None
    }

    pub fn redis(host: &str, port: u16, database: i64) -> Self {
        StoreBackend::Redis {
            url: format!("redis://{}:{}/{}", host, port, database),
        }
    }
}

// ==============================
// Store
// ==============================

pub struct SecretStore {
    connector: Box<dyn StoreConnector>,
    conn: Mutex<Option<Box<dyn StoreConnection>>>,
    retries: u32,
}

impl SecretStore {
    /// Build a store without connecting; the first accessor connects lazily.
    pub fn new(connector: impl StoreConnector + 'static, retries: u32) -> Self {
        Self {
            connector: Box::new(connector),
            conn: Mutex::new(None),
            retries,
        }
    }

    pub fn from_backend(backend: StoreBackend, retries: u32) -> Result<Self> {
        match backend {
            StoreBackend::Redis { url } => Ok(Self::new(RedisConnector::open(&url)?, retries)),
            StoreBackend::Memory => Ok(Self::new(MemoryConnector::new(), retries)),
        }
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Make sure the connection handle is live, trying at most `max_attempts` times.
    pub fn refresh(&self, max_attempts: u32) -> Result<()> {
        let mut slot = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        Self::refresh_slot(self.connector.as_ref(), &mut slot, max_attempts)
    }

    fn refresh_slot(
        connector: &dyn StoreConnector,
        slot: &mut Option<Box<dyn StoreConnection>>,
        max_attempts: u32,
    ) -> Result<()> {
        for attempt in 1..=max_attempts {
            if let Some(conn) = slot.as_mut() {
                match conn.ping() {
                    Ok(()) => return Ok(()),
                    Err(err) => {
                        debug!(attempt, "store connection failed liveness probe: {}", err);
                        *slot = None;
                    }
                }
            }

            match Self::connect(connector) {
                Ok(conn) => {
                    info!(attempt, "store connection established");
                    *slot = Some(conn);
                    return Ok(());
                }
                Err(err) => warn!(attempt, max_attempts, "store connection attempt failed: {}", err),
            }
        }
        Err(StoreError::ConnectionRefused {
            attempts: max_attempts,
        })
    }

    // Only hand back connections that answer PING.
    fn connect(connector: &dyn StoreConnector) -> Result<Box<dyn StoreConnection>> {
        let mut conn = connector.connect()?;
        conn.ping()?;
        Ok(conn)
    }

    fn with_connection<T>(
        &self,
        operation: &str,
        op: impl FnOnce(&mut dyn StoreConnection) -> Result<T>,
    ) -> Result<T> {
        let start = Instant::now();
        let mut slot = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        Self::refresh_slot(self.connector.as_ref(), &mut slot, self.retries)?;

        let result = match slot.as_mut() {
            Some(conn) => op(&mut **conn),
            None => Err(StoreError::ConnectionRefused {
                attempts: self.retries,
            }),
        };
        if let Err(err) = &result {
            if err.is_connection_failure() {
                warn!("dropping store connection after {} failure: {}", operation, err);
                *slot = None;
            }
        }
        drop(slot);

        Self::log_store_latency(operation, start.elapsed());
        result
    }

    fn log_store_latency(operation: &str, elapsed: Duration) {
        if elapsed >= Duration::from_millis(250) {
            warn!(
                duration_ms = elapsed.as_millis() as u64,
                "secret store {} latency", operation
            );
        } else if elapsed >= Duration::from_millis(50) {
            debug!(
                duration_ms = elapsed.as_millis() as u64,
                "secret store {} latency", operation
            );
        }
    }

    // --------------------------
    // Accessors
    // --------------------------

    /// Secret for `api_key`; `Ok(None)` when the key is unknown.
    pub fn get_secret(&self, api_key: &str) -> Result<Option<String>> {
        self.with_connection("get_secret", |conn| conn.hget(SECRET_HASH, api_key))
    }

    /// Decoded user record for `api_key`.
    pub fn get_user(&self, api_key: &str) -> Result<Option<UserInfo>> {
        match self.with_connection("get_user", |conn| conn.hget(USER_HASH, api_key))? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn set_secret(&self, api_key: &str, secret: &str) -> Result<()> {
        self.with_connection("set_secret", |conn| conn.hset(SECRET_HASH, api_key, secret))
    }

    pub fn set_user(&self, api_key: &str, user: &UserInfo) -> Result<()> {
        let raw = serde_json::to_string(user)?;
        self.with_connection("set_user", |conn| conn.hset(USER_HASH, api_key, &raw))
    }

    pub fn get_resource(&self, namespace: &str, name: &str) -> Result<Option<ResourceRecord>> {
        let hash = resource_hash(namespace);
        match self.with_connection("get_resource", |conn| conn.hget(&hash, name))? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// All decodable records of a namespace, ordered by name.
    pub fn list_resources(&self, namespace: &str) -> Result<Vec<ResourceRecord>> {
        let hash = resource_hash(namespace);
        let raw = self.with_connection("list_resources", |conn| conn.hgetall(&hash))?;
        let mut out: Vec<ResourceRecord> = raw
            .into_iter()
            .filter_map(|(name, value)| match serde_json::from_str(&value) {
                Ok(rec) => Some(rec),
                Err(err) => {
                    warn!(namespace, name = %name, "skipping undecodable resource record: {}", err);
                    None
                }
            })
            .collect();
        out.sort_by(|a, b| a.resource.cmp(&b.resource));
        Ok(out)
    }

    pub fn put_resource(&self, record: &ResourceRecord) -> Result<()> {
        let hash = resource_hash(&record.namespace);
        let raw = serde_json::to_string(record)?;
        self.with_connection("put_resource", |conn| {
            conn.hset(&hash, &record.resource, &raw)
        })
    }

    pub fn delete_resource(&self, namespace: &str, name: &str) -> Result<bool> {
        let hash = resource_hash(namespace);
        self.with_connection("delete_resource", |conn| conn.hdel(&hash, name))
    }

    /// Whether the store can currently be reached within the retry budget.
    pub fn is_reachable(&self) -> bool {
        self.refresh(self.retries).is_ok()
    }
}

// ==============================
// Tests
// ==============================
