//! The `Client` facade: picks a transport per operation and owns the pool
//! lifecycle (§2, §6, §9 "Multiple client constructors").
//!
//! The source exposes two facades (one per server kind) plus several
//! historical variants; this collapses them into one `Client` parameterized
//! by [`ServerKind`], since the query-builder's op-code language and the
//! pool/connection plumbing are identical across both.

use std::sync::Arc;
use std::time::Duration;

use log::debug;

use crate::codec::Codec;
use crate::error::{ClientError, Result};
use crate::http::{Cursor, HttpProtocol};
use crate::pool::{Pool, PoolConfig};
use crate::protocol_a::{self, Record};
use crate::protocol_b;
use crate::query::QueryBuilder;
use crate::value::Value;

/// Which wire family a `Client` speaks binary requests over. Both kinds
/// share the HTTP/TSV protocol and the query builder (§9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerKind {
    /// The cache server: Binary Protocol A (§4.4) plus HTTP (§4.7).
    CacheServer,
    /// The sibling server: Binary Protocol B (§4.6) only.
    SiblingServer,
}

/// Construction-time configuration (§3 "Config", §6 "Configuration
/// options"). Validated once in [`ClientConfig::build`], then shared via
/// `Arc` across every transport and pool the `Client` owns.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub kind: ServerKind,
    pub serializer: Codec,
    pub decode_keys: bool,
    pub timeout: Option<Duration>,
    pub connection_pool: bool,
    pub default_db: u16,
    pub max_idle: usize,
    pub max_total: usize,
    pub connect_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            host: "127.0.0.1".to_string(),
            port: 1978,
            kind: ServerKind::CacheServer,
            serializer: Codec::Binary,
            decode_keys: true,
            timeout: None,
            connection_pool: true,
            default_db: 0,
            max_idle: 8,
            max_total: 16,
            connect_timeout: None,
        }
    }
}

impl ClientConfig {
    pub fn build(self) -> Result<Client> {
        let serializer = self.serializer.validate()?;
        let pool = Pool::new(PoolConfig {
            host: self.host.clone(),
            port: self.port,
            max_size: if self.connection_pool { self.max_total } else { 1 },
            max_age: Duration::from_secs(30),
            connect_timeout: self.connect_timeout,
            io_timeout: self.timeout,
        });
        let http = HttpProtocol::new(&self.host, self.port, serializer, self.timeout)?;
        debug!(
            "client configured for {}:{} ({:?}, serializer={:?})",
            self.host, self.port, self.kind, serializer
        );
        Ok(Client {
            config: Arc::new(ClientConfig { serializer, ..self }),
            pool,
            http: Arc::new(http),
        })
    }
}

/// The facade applications hold. Cheap to clone: the pool and HTTP client
/// are both reference-counted.
#[derive(Clone)]
pub struct Client {
    config: Arc<ClientConfig>,
    pool: Arc<Pool>,
    http: Arc<HttpProtocol>,
}

impl Client {
    pub fn builder() -> ClientConfig {
        ClientConfig::default()
    }

    fn db(&self, db: Option<u16>) -> u16 {
        db.unwrap_or(self.config.default_db)
    }

    fn require_cache_server(&self) -> Result<()> {
        if self.config.kind != ServerKind::CacheServer {
            return Err(ClientError::Configuration(
                "this operation requires a cache-server Client".to_string(),
            ));
        }
        Ok(())
    }

    fn require_sibling_server(&self) -> Result<()> {
        if self.config.kind != ServerKind::SiblingServer {
            return Err(ClientError::Configuration(
                "this operation requires a sibling-server Client".to_string(),
            ));
        }
        Ok(())
    }

    fn decode_key(&self, key: Vec<u8>) -> Vec<u8> {
        // `decode_keys` only changes whether callers receive `String` or
        // `Vec<u8>` at a higher layer; at this layer keys always round-trip
        // as bytes, matching `binary`'s own UTF-8-with-fallback contract.
        let _ = self.config.decode_keys;
        key
    }

    // --- Cache-server binary operations (§4.4) -----------------------------

    pub async fn set(&self, key: &[u8], value: Value, db: Option<u16>, expire_seconds: Option<i64>) -> Result<()> {
        self.require_cache_server()?;
        let mut conn = self.pool.acquire().await?;
        let encoded = self.config.serializer.encode(value)?;
        let record = Record {
            db: self.db(db),
            key: key.to_vec(),
            value: encoded,
            xt: expire_seconds.unwrap_or(-1),
        };
        protocol_a::set_bulk(&mut conn, std::slice::from_ref(&record)).await?;
        Ok(())
    }

    pub async fn get(&self, key: &[u8], db: Option<u16>) -> Result<Option<Value>> {
        self.require_cache_server()?;
        let mut conn = self.pool.acquire().await?;
        let records = protocol_a::get_bulk(&mut conn, &[(self.db(db), key.to_vec())]).await?;
        match records.into_iter().next() {
            Some(record) => Ok(Some(self.config.serializer.decode(record.value)?)),
            None => Ok(None),
        }
    }

    pub async fn remove(&self, key: &[u8], db: Option<u16>) -> Result<bool> {
        self.require_cache_server()?;
        let mut conn = self.pool.acquire().await?;
        let removed = protocol_a::remove_bulk(&mut conn, &[(self.db(db), key.to_vec())]).await?;
        Ok(removed > 0)
    }

    pub async fn set_bulk(&self, records: &[(Vec<u8>, Value)], db: Option<u16>, expire_seconds: Option<i64>) -> Result<u32> {
        self.require_cache_server()?;
        let db = self.db(db);
        let mut conn = self.pool.acquire().await?;
        let mut encoded = Vec::with_capacity(records.len());
        for (key, value) in records {
            encoded.push(Record {
                db,
                key: key.clone(),
                value: self.config.serializer.encode(value.clone())?,
                xt: expire_seconds.unwrap_or(-1),
            });
        }
        protocol_a::set_bulk(&mut conn, &encoded).await
    }

    pub async fn get_bulk(&self, keys: &[Vec<u8>], db: Option<u16>) -> Result<Vec<(Vec<u8>, Value)>> {
        self.require_cache_server()?;
        let db = self.db(db);
        let mut conn = self.pool.acquire().await?;
        let request = keys.iter().map(|k| (db, k.clone())).collect::<Vec<_>>();
        let records = protocol_a::get_bulk(&mut conn, &request).await?;
        let mut out = Vec::with_capacity(records.len());
        for record in records {
            out.push((self.decode_key(record.key), self.config.serializer.decode(record.value)?));
        }
        Ok(out)
    }

    pub async fn remove_bulk(&self, keys: &[Vec<u8>], db: Option<u16>) -> Result<u32> {
        self.require_cache_server()?;
        let db = self.db(db);
        let mut conn = self.pool.acquire().await?;
        let request = keys.iter().map(|k| (db, k.clone())).collect::<Vec<_>>();
        protocol_a::remove_bulk(&mut conn, &request).await
    }

    pub async fn script(&self, name: &str, params: &[(Vec<u8>, Vec<u8>)]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.require_cache_server()?;
        let mut conn = self.pool.acquire().await?;
        protocol_a::script(&mut conn, name, params).await
    }

    /// `set_bulk` with Binary Protocol A's no-reply flag (§4.4, §5): no
    /// response is read, so a caller that needs to know how many records
    /// were written should use [`Client::set_bulk`] instead.
    pub async fn set_bulk_no_reply(&self, records: &[(Vec<u8>, Value)], db: Option<u16>, expire_seconds: Option<i64>) -> Result<()> {
        self.require_cache_server()?;
        let db = self.db(db);
        let mut conn = self.pool.acquire().await?;
        let mut encoded = Vec::with_capacity(records.len());
        for (key, value) in records {
            encoded.push(Record {
                db,
                key: key.clone(),
                value: self.config.serializer.encode(value.clone())?,
                xt: expire_seconds.unwrap_or(-1),
            });
        }
        protocol_a::set_bulk_no_reply(&mut conn, &encoded).await
    }

    // --- Sibling-server binary operations (§4.6) ---------------------------

    pub async fn tt_put(&self, key: &[u8], value: Value) -> Result<()> {
        self.require_sibling_server()?;
        let mut conn = self.pool.acquire().await?;
        protocol_b::put(&mut conn, key, &self.config.serializer.encode(value)?).await
    }

    pub async fn tt_get(&self, key: &[u8]) -> Result<Option<Value>> {
        self.require_sibling_server()?;
        let mut conn = self.pool.acquire().await?;
        match protocol_b::get(&mut conn, key).await? {
            Some(bytes) => Ok(Some(self.config.serializer.decode(bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn tt_out(&self, key: &[u8]) -> Result<bool> {
        self.require_sibling_server()?;
        let mut conn = self.pool.acquire().await?;
        protocol_b::out(&mut conn, key).await
    }

    pub async fn tt_add(&self, key: &[u8], value: Value) -> Result<bool> {
        self.require_sibling_server()?;
        let mut conn = self.pool.acquire().await?;
        protocol_b::putkeep(&mut conn, key, &self.config.serializer.encode(value)?).await
    }

    pub async fn tt_append(&self, key: &[u8], value: Value) -> Result<()> {
        self.require_sibling_server()?;
        let mut conn = self.pool.acquire().await?;
        protocol_b::putcat(&mut conn, key, &self.config.serializer.encode(value)?).await
    }

    pub async fn tt_get_part(&self, key: &[u8], start: Option<i64>, end: Option<i64>) -> Result<Option<Vec<u8>>> {
        self.require_sibling_server()?;
        let mut conn = self.pool.acquire().await?;
        protocol_b::getpart(&mut conn, key, start, end).await
    }

    pub async fn tt_exists(&self, key: &[u8]) -> Result<bool> {
        self.require_sibling_server()?;
        let mut conn = self.pool.acquire().await?;
        Ok(protocol_b::vsiz(&mut conn, key).await?.is_some())
    }

    pub async fn tt_incr(&self, key: &[u8], delta: i32) -> Result<i32> {
        self.require_sibling_server()?;
        let mut conn = self.pool.acquire().await?;
        protocol_b::addint(&mut conn, key, delta).await
    }

    pub async fn tt_incr_double(&self, key: &[u8], delta: f64) -> Result<f64> {
        self.require_sibling_server()?;
        let mut conn = self.pool.acquire().await?;
        protocol_b::adddouble(&mut conn, key, delta).await
    }

    pub async fn tt_len(&self) -> Result<u64> {
        self.require_sibling_server()?;
        let mut conn = self.pool.acquire().await?;
        protocol_b::rnum(&mut conn).await
    }

    pub async fn tt_size(&self) -> Result<u64> {
        self.require_sibling_server()?;
        let mut conn = self.pool.acquire().await?;
        protocol_b::size(&mut conn).await
    }

    pub async fn tt_clear(&self) -> Result<()> {
        self.require_sibling_server()?;
        let mut conn = self.pool.acquire().await?;
        protocol_b::vanish(&mut conn).await
    }

    pub async fn tt_get_range(&self, start: &[u8], stop: Option<&[u8]>, max_keys: i64) -> Result<Vec<Vec<u8>>> {
        self.require_sibling_server()?;
        let mut conn = self.pool.acquire().await?;
        protocol_b::range(&mut conn, start, max_keys, stop).await
    }

    pub async fn tt_match_prefix(&self, prefix: &[u8], max_keys: i64) -> Result<Vec<Vec<u8>>> {
        self.require_sibling_server()?;
        let mut conn = self.pool.acquire().await?;
        protocol_b::fwmkeys(&mut conn, prefix, max_keys as i32).await
    }

    pub async fn tt_match_regex(&self, pattern: &str, max_keys: i64) -> Result<Vec<Vec<u8>>> {
        self.require_sibling_server()?;
        let mut conn = self.pool.acquire().await?;
        protocol_b::regex(&mut conn, pattern, max_keys).await
    }

    pub async fn tt_optimize(&self) -> Result<()> {
        self.require_sibling_server()?;
        let mut conn = self.pool.acquire().await?;
        protocol_b::optimize(&mut conn).await
    }

    pub async fn tt_clear_cache(&self) -> Result<()> {
        self.require_sibling_server()?;
        let mut conn = self.pool.acquire().await?;
        protocol_b::cacheclear(&mut conn).await
    }

    pub async fn tt_error(&self) -> Result<Vec<Vec<u8>>> {
        self.require_sibling_server()?;
        let mut conn = self.pool.acquire().await?;
        protocol_b::error(&mut conn).await
    }

    /// `misc "putlist"` (§4.6): bulk store, framing-level success only — a
    /// rejected individual record (e.g. locked) is not reported back.
    pub async fn tt_put_list(&self, records: &[(Vec<u8>, Value)]) -> Result<()> {
        self.require_sibling_server()?;
        let mut conn = self.pool.acquire().await?;
        let mut encoded = Vec::with_capacity(records.len());
        for (key, value) in records {
            encoded.push((key.clone(), self.config.serializer.encode(value.clone())?));
        }
        protocol_b::putlist(&mut conn, &encoded).await
    }

    /// `misc "outlist"` (§4.6): bulk remove, framing-level success only.
    pub async fn tt_out_list(&self, keys: &[Vec<u8>]) -> Result<()> {
        self.require_sibling_server()?;
        let mut conn = self.pool.acquire().await?;
        protocol_b::outlist(&mut conn, keys).await
    }

    /// `misc "getlist"` (§4.6): bulk fetch, returned as a flat key/value
    /// sequence decoded with the configured serializer.
    pub async fn tt_get_list(&self, keys: &[Vec<u8>]) -> Result<Vec<(Vec<u8>, Value)>> {
        self.require_sibling_server()?;
        let mut conn = self.pool.acquire().await?;
        let pairs = protocol_b::getlist(&mut conn, keys).await?;
        let mut out = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            out.push((key, self.config.serializer.decode(value)?));
        }
        Ok(out)
    }

    /// `copy` (0x73): snapshots the database file to `dest_path` on the
    /// server's own filesystem.
    pub async fn tt_copy(&self, dest_path: &str) -> Result<()> {
        self.require_sibling_server()?;
        let mut conn = self.pool.acquire().await?;
        protocol_b::copy(&mut conn, dest_path).await
    }

    /// `misc "optindex"` (§4.6): optimizes the named secondary index.
    pub async fn tt_optimize_index(&self, name: &str) -> Result<bool> {
        self.require_sibling_server()?;
        let mut conn = self.pool.acquire().await?;
        protocol_b::optindex(&mut conn, name).await
    }

    /// Returns a [`QueryBuilder`]; it borrows no state from `Client` —
    /// `execute`/`get`/`delete`/`count` take a leased connection explicitly.
    pub fn query(&self) -> QueryBuilder {
        QueryBuilder::new()
    }

    pub async fn acquire(&self) -> Result<crate::pool::PooledConnection> {
        self.require_sibling_server()?;
        self.pool.acquire().await
    }

    // --- HTTP operations (§4.7), available on both server kinds ------------

    pub async fn add(&self, key: &[u8], value: Value, db: Option<u16>, expire_seconds: Option<i64>) -> Result<bool> {
        self.http.add(key, value, self.db(db), expire_seconds).await
    }

    pub async fn replace(&self, key: &[u8], value: Value, db: Option<u16>, expire_seconds: Option<i64>) -> Result<bool> {
        self.http.replace(key, value, self.db(db), expire_seconds).await
    }

    pub async fn append(&self, key: &[u8], value: Value, db: Option<u16>, expire_seconds: Option<i64>) -> Result<bool> {
        self.http.append(key, value, self.db(db), expire_seconds).await
    }

    pub async fn exists(&self, key: &[u8], db: Option<u16>) -> Result<bool> {
        self.http.check(key, self.db(db)).await
    }

    /// `/rpc/set` (§4.7): the HTTP-transport sibling of [`Client::set`],
    /// which rides Binary Protocol A instead. Exposed separately so callers
    /// who need HTTP's status-code semantics (e.g. scripting atomicity
    /// alongside `cas`/`increment`) are not forced onto the binary path.
    pub async fn http_set(&self, key: &[u8], value: Value, db: Option<u16>, expire_seconds: Option<i64>) -> Result<bool> {
        self.http.set(key, value, self.db(db), expire_seconds).await
    }

    /// `/rpc/get` (§4.7): the HTTP-transport sibling of [`Client::get`].
    pub async fn http_get(&self, key: &[u8], db: Option<u16>) -> Result<Option<Value>> {
        self.http.get(key, self.db(db)).await
    }

    /// `/rpc/remove` (§4.7): the HTTP-transport sibling of [`Client::remove`].
    pub async fn http_remove(&self, key: &[u8], db: Option<u16>) -> Result<bool> {
        self.http.remove(key, self.db(db)).await
    }

    pub async fn seize(&self, key: &[u8], db: Option<u16>) -> Result<Option<Value>> {
        self.http.seize(key, self.db(db)).await
    }

    pub async fn cas(
        &self,
        key: &[u8],
        old: Option<Value>,
        new: Option<Value>,
        db: Option<u16>,
        expire_seconds: Option<i64>,
    ) -> Result<bool> {
        self.http.cas(key, old, new, self.db(db), expire_seconds).await
    }

    pub async fn increment(&self, key: &[u8], delta: i64, orig: Option<i64>, db: Option<u16>) -> Result<i64> {
        self.http.increment(key, delta, orig, self.db(db), None).await
    }

    pub async fn increment_double(&self, key: &[u8], delta: f64, orig: Option<f64>, db: Option<u16>) -> Result<f64> {
        self.http.increment_double(key, delta, orig, self.db(db), None).await
    }

    pub async fn match_prefix(&self, prefix: &[u8], max_keys: Option<u32>, db: Option<u16>) -> Result<Vec<Vec<u8>>> {
        self.http.match_prefix(prefix, max_keys, self.db(db)).await
    }

    pub async fn match_regex(&self, pattern: &str, max_keys: Option<u32>, db: Option<u16>) -> Result<Vec<Vec<u8>>> {
        self.http.match_regex(pattern, max_keys, self.db(db)).await
    }

    pub async fn match_similar(
        &self,
        origin: &[u8],
        distance: Option<u32>,
        max_keys: Option<u32>,
        db: Option<u16>,
    ) -> Result<Vec<Vec<u8>>> {
        self.http.match_similar(origin, distance, max_keys, self.db(db)).await
    }

    pub async fn status(&self, db: Option<u16>) -> Result<crate::http::TsvMap> {
        self.http.status(self.db(db)).await
    }

    pub async fn report(&self) -> Result<crate::http::TsvMap> {
        self.http.report().await
    }

    pub async fn len(&self, db: Option<u16>) -> Result<u64> {
        let status = self.status(db).await?;
        status
            .get(b"count".as_slice())
            .and_then(|v| std::str::from_utf8(v).ok())
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| ClientError::Protocol("status response missing `count`".to_string()))
    }

    pub async fn database_size(&self, db: Option<u16>) -> Result<u64> {
        let status = self.status(db).await?;
        status
            .get(b"size".as_slice())
            .and_then(|v| std::str::from_utf8(v).ok())
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| ClientError::Protocol("status response missing `size`".to_string()))
    }

    pub async fn clear(&self, db: Option<u16>) -> Result<bool> {
        self.http.clear(self.db(db)).await
    }

    pub async fn synchronize(&self, hard: bool, command: Option<&str>, db: Option<u16>) -> Result<bool> {
        self.http.synchronize(hard, command, self.db(db)).await
    }

    pub async fn vacuum(&self, step: u32, db: Option<u16>) -> Result<bool> {
        self.http.vacuum(step, self.db(db)).await
    }

    /// `/rpc/tune_replication` (§4.4 "Replication tuning"): a send-and-forget
    /// helper only — no replication choreography is implemented.
    pub async fn tune_replication(
        &self,
        host: Option<&str>,
        port: Option<u16>,
        timestamp: Option<u64>,
        interval: Option<u64>,
    ) -> Result<bool> {
        self.http.tune_replication(host, port, timestamp, interval).await
    }

    pub async fn play_script(&self, name: &str, params: &[(String, Value)]) -> Result<Option<Vec<(String, Value)>>> {
        self.http.play_script(name, params).await
    }

    pub async fn ulog_list(&self) -> Result<Vec<(Vec<u8>, u64, u64)>> {
        self.http.ulog_list().await
    }

    pub async fn ulog_remove(&self, max_ts_nanos: u64) -> Result<bool> {
        self.http.ulog_remove(max_ts_nanos).await
    }

    pub fn cursor(&self, db: Option<u16>) -> Cursor<'_> {
        Cursor::new(&self.http, self.db(db))
    }

    /// Drains idle pooled connections. In-flight leases finish or time out
    /// on their own (§5 "Cancellation and timeouts").
    pub fn close(&self) {
        self.pool.close_all();
    }
}
