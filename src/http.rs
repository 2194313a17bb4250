//! The HTTP/TSV RPC protocol (§4.7): endpoints under `/rpc/<name>`, bodies
//! are tab-separated `key\tvalue\n` lines with base64- or URL-encoded
//! columns.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use base64::Engine;
use log::{debug, warn};

use crate::codec::Codec;
use crate::error::{ClientError, Result};
use crate::value::Value;

const CONTENT_TYPE: &str = "text/tab-separated-values; colenc=B";

fn b64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn unb64(text: &str) -> Result<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(text)
        .map_err(|e| ClientError::Protocol(format!("invalid base64 column: {e}")))
}

fn url_decode(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len());
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(byte) = u8::from_str_radix(&text[i + 1..i + 3], 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    out
}

/// A decoded TSV response: an ordered map from raw key bytes to raw value
/// bytes (decoding per the response's `Content-Type` column encoding).
pub type TsvMap = BTreeMap<Vec<u8>, Vec<u8>>;

fn decode_body(body: &[u8], content_type: &str) -> Result<TsvMap> {
    let mut map = TsvMap::new();
    for line in body.split(|&b| b == b'\n') {
        if line.is_empty() {
            continue;
        }
        let mut parts = line.splitn(2, |&b| b == b'\t');
        let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        let (key, value) = if content_type.ends_with("colenc=B") {
            let key = std::str::from_utf8(key)
                .map_err(|e| ClientError::Protocol(format!("non-utf8 column: {e}")))?;
            let value = std::str::from_utf8(value)
                .map_err(|e| ClientError::Protocol(format!("non-utf8 column: {e}")))?;
            (unb64(key)?, unb64(value)?)
        } else if content_type.ends_with("colenc=U") {
            let key = std::str::from_utf8(key)
                .map_err(|e| ClientError::Protocol(format!("non-utf8 column: {e}")))?;
            let value = std::str::from_utf8(value)
                .map_err(|e| ClientError::Protocol(format!("non-utf8 column: {e}")))?;
            (url_decode(key), url_decode(value))
        } else {
            (key.to_vec(), value.to_vec())
        };
        map.insert(key, value);
    }
    Ok(map)
}

fn encode_body(fields: &[(Vec<u8>, Vec<u8>)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (i, (key, value)) in fields.iter().enumerate() {
        if i > 0 {
            out.push(b'\n');
        }
        out.extend_from_slice(b64(key).as_bytes());
        out.push(b'\t');
        out.extend_from_slice(b64(value).as_bytes());
    }
    out
}

/// Thin client over a single `reqwest::Client`, one per `Client` instance.
/// Unlike the binary protocols there is no connection pool here: keep-alive
/// is reqwest's own concern.
pub struct HttpProtocol {
    http: reqwest::Client,
    base_url: String,
    codec: Codec,
    cursor_counter: AtomicU32,
}

/// Status codes other than 200/450/501 are always protocol errors (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    LogicalFailure,
    Unsupported,
}

impl HttpProtocol {
    pub fn new(host: &str, port: u16, codec: Codec, timeout: Option<Duration>) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder.build().map_err(ClientError::from)?;
        Ok(HttpProtocol {
            http,
            base_url: format!("http://{host}:{port}/rpc"),
            codec,
            cursor_counter: AtomicU32::new(0),
        })
    }

    pub fn next_cursor_id(&self) -> u32 {
        self.cursor_counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Posts `fields` (plus a leading `DB` control field unless `db` is
    /// `None`) to `/rpc/<path>` and returns the decoded body alongside the
    /// outcome implied by its status code. Any status outside
    /// `{200, 450, 501}` is a protocol error.
    async fn request(
        &self,
        path: &str,
        mut fields: Vec<(Vec<u8>, Vec<u8>)>,
        db: Option<u16>,
    ) -> Result<(TsvMap, Outcome)> {
        if let Some(db) = db {
            fields.insert(0, (b"DB".to_vec(), db.to_string().into_bytes()));
        }
        let body = encode_body(&fields);
        debug!("POST /rpc/{path} ({} fields)", fields.len());

        let response = self
            .http
            .post(format!("{}/{path}", self.base_url))
            .header("Content-Type", CONTENT_TYPE)
            .body(body)
            .send()
            .await
            .map_err(ClientError::from)?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or(CONTENT_TYPE)
            .to_string();
        let body = response.bytes().await.map_err(ClientError::from)?;
        let map = decode_body(&body, &content_type)?;

        let outcome = match status {
            200 => Outcome::Ok,
            450 => Outcome::LogicalFailure,
            501 => Outcome::Unsupported,
            other => {
                warn!("unexpected HTTP status {other} from /rpc/{path}");
                return Err(ClientError::Protocol(format!(
                    "unexpected status {other} from /rpc/{path}"
                )));
            }
        };
        Ok((map, outcome))
    }

    fn encode_value(&self, value: Value) -> Result<Vec<u8>> {
        self.codec.encode(value)
    }

    fn decode_value(&self, bytes: Vec<u8>) -> Result<Value> {
        self.codec.decode(bytes)
    }

    pub async fn set(
        &self,
        key: &[u8],
        value: Value,
        db: u16,
        expire_seconds: Option<i64>,
    ) -> Result<bool> {
        self.simple_write("set", key, value, db, expire_seconds).await
    }

    pub async fn add(
        &self,
        key: &[u8],
        value: Value,
        db: u16,
        expire_seconds: Option<i64>,
    ) -> Result<bool> {
        self.simple_write("add", key, value, db, expire_seconds).await
    }

    pub async fn replace(
        &self,
        key: &[u8],
        value: Value,
        db: u16,
        expire_seconds: Option<i64>,
    ) -> Result<bool> {
        self.simple_write("replace", key, value, db, expire_seconds).await
    }

    pub async fn append(
        &self,
        key: &[u8],
        value: Value,
        db: u16,
        expire_seconds: Option<i64>,
    ) -> Result<bool> {
        self.simple_write("append", key, value, db, expire_seconds).await
    }

    async fn simple_write(
        &self,
        cmd: &str,
        key: &[u8],
        value: Value,
        db: u16,
        expire_seconds: Option<i64>,
    ) -> Result<bool> {
        let mut fields = vec![(b"key".to_vec(), key.to_vec()), (b"value".to_vec(), self.encode_value(value)?)];
        if let Some(xt) = expire_seconds {
            fields.push((b"xt".to_vec(), xt.to_string().into_bytes()));
        }
        let (_, outcome) = self.request(cmd, fields, Some(db)).await?;
        Ok(outcome == Outcome::Ok)
    }

    pub async fn get(&self, key: &[u8], db: u16) -> Result<Option<Value>> {
        let (mut map, outcome) = self
            .request("get", vec![(b"key".to_vec(), key.to_vec())], Some(db))
            .await?;
        if outcome == Outcome::LogicalFailure {
            return Ok(None);
        }
        let bytes = map
            .remove(b"value".as_slice())
            .ok_or_else(|| ClientError::Protocol("get response missing `value` column".to_string()))?;
        Ok(Some(self.decode_value(bytes)?))
    }

    pub async fn seize(&self, key: &[u8], db: u16) -> Result<Option<Value>> {
        let (mut map, outcome) = self
            .request("seize", vec![(b"key".to_vec(), key.to_vec())], Some(db))
            .await?;
        if outcome == Outcome::LogicalFailure {
            return Ok(None);
        }
        let bytes = map
            .remove(b"value".as_slice())
            .ok_or_else(|| ClientError::Protocol("seize response missing `value` column".to_string()))?;
        Ok(Some(self.decode_value(bytes)?))
    }

    pub async fn remove(&self, key: &[u8], db: u16) -> Result<bool> {
        let (_, outcome) = self
            .request("remove", vec![(b"key".to_vec(), key.to_vec())], Some(db))
            .await?;
        Ok(outcome == Outcome::Ok)
    }

    pub async fn check(&self, key: &[u8], db: u16) -> Result<bool> {
        let (_, outcome) = self
            .request("check", vec![(b"key".to_vec(), key.to_vec())], Some(db))
            .await?;
        Ok(outcome == Outcome::Ok)
    }

    /// `cas`: exactly one of `old`/`new` may be `None`. `None` old = create
    /// unconditionally; `None` new = delete-if-matches; both `None` is a
    /// configuration error (§4.7).
    pub async fn cas(
        &self,
        key: &[u8],
        old: Option<Value>,
        new: Option<Value>,
        db: u16,
        expire_seconds: Option<i64>,
    ) -> Result<bool> {
        if old.is_none() && new.is_none() {
            return Err(ClientError::Configuration(
                "cas requires at least one of old/new value".to_string(),
            ));
        }
        let mut fields = vec![(b"key".to_vec(), key.to_vec())];
        if let Some(old) = old {
            fields.push((b"oval".to_vec(), self.encode_value(old)?));
        }
        if let Some(new) = new {
            fields.push((b"nval".to_vec(), self.encode_value(new)?));
        }
        if let Some(xt) = expire_seconds {
            fields.push((b"xt".to_vec(), xt.to_string().into_bytes()));
        }
        let (_, outcome) = self.request("cas", fields, Some(db)).await?;
        Ok(outcome == Outcome::Ok)
    }

    pub async fn increment(
        &self,
        key: &[u8],
        delta: i64,
        orig: Option<i64>,
        db: u16,
        expire_seconds: Option<i64>,
    ) -> Result<i64> {
        let mut fields = vec![
            (b"key".to_vec(), key.to_vec()),
            (b"num".to_vec(), delta.to_string().into_bytes()),
        ];
        if let Some(orig) = orig {
            fields.push((b"orig".to_vec(), orig.to_string().into_bytes()));
        }
        if let Some(xt) = expire_seconds {
            fields.push((b"xt".to_vec(), xt.to_string().into_bytes()));
        }
        let (map, outcome) = self.request("increment", fields, Some(db)).await?;
        if outcome != Outcome::Ok {
            return Err(ClientError::Server("increment on missing key without `orig`".to_string()));
        }
        parse_number_field(&map, b"num")
    }

    pub async fn increment_double(
        &self,
        key: &[u8],
        delta: f64,
        orig: Option<f64>,
        db: u16,
        expire_seconds: Option<i64>,
    ) -> Result<f64> {
        let mut fields = vec![
            (b"key".to_vec(), key.to_vec()),
            (b"num".to_vec(), delta.to_string().into_bytes()),
        ];
        if let Some(orig) = orig {
            fields.push((b"orig".to_vec(), orig.to_string().into_bytes()));
        }
        if let Some(xt) = expire_seconds {
            fields.push((b"xt".to_vec(), xt.to_string().into_bytes()));
        }
        let (map, outcome) = self.request("increment_double", fields, Some(db)).await?;
        if outcome != Outcome::Ok {
            return Err(ClientError::Server(
                "increment_double on missing key without `orig`".to_string(),
            ));
        }
        let raw = map
            .get(b"num".as_slice())
            .ok_or_else(|| ClientError::Protocol("increment_double response missing `num`".to_string()))?;
        std::str::from_utf8(raw)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| ClientError::Protocol("malformed `num` field".to_string()))
    }

    pub async fn set_bulk(
        &self,
        records: &[(Vec<u8>, Value)],
        db: u16,
        expire_seconds: Option<i64>,
    ) -> Result<u64> {
        let mut fields = Vec::with_capacity(records.len() + 1);
        if let Some(xt) = expire_seconds {
            fields.push((b"xt".to_vec(), xt.to_string().into_bytes()));
        }
        for (key, value) in records {
            let mut prefixed = Vec::with_capacity(key.len() + 1);
            prefixed.push(b'_');
            prefixed.extend_from_slice(key);
            fields.push((prefixed, self.encode_value(value.clone())?));
        }
        let (map, _) = self.request("set_bulk", fields, Some(db)).await?;
        parse_number_field(&map, b"num")
            .map(|n| n as u64)
            .or(Ok(0))
    }

    pub async fn remove_bulk(&self, keys: &[Vec<u8>], db: u16) -> Result<u64> {
        let fields = keys
            .iter()
            .map(|k| {
                let mut prefixed = Vec::with_capacity(k.len() + 1);
                prefixed.push(b'_');
                prefixed.extend_from_slice(k);
                (prefixed, Vec::new())
            })
            .collect();
        let (map, _) = self.request("remove_bulk", fields, Some(db)).await?;
        parse_number_field(&map, b"num").map(|n| n as u64)
    }

    pub async fn get_bulk(&self, keys: &[Vec<u8>], db: u16) -> Result<Vec<(Vec<u8>, Value)>> {
        let fields = keys
            .iter()
            .map(|k| {
                let mut prefixed = Vec::with_capacity(k.len() + 1);
                prefixed.push(b'_');
                prefixed.extend_from_slice(k);
                (prefixed, Vec::new())
            })
            .collect();
        let (mut map, _) = self.request("get_bulk", fields, Some(db)).await?;
        map.remove(b"num".as_slice());
        let mut out = Vec::with_capacity(map.len());
        for (key, value) in map {
            let key = key.strip_prefix(b"_").unwrap_or(&key).to_vec();
            out.push((key, self.decode_value(value)?));
        }
        Ok(out)
    }

    /// Shared shape for `match_prefix`/`match_regex`/`match_similar`: the
    /// response's `num`-valued keys are sorted by that numeric distance
    /// before their bare key text is returned.
    async fn match_sorted(&self, cmd: &str, mut fields: Vec<(Vec<u8>, Vec<u8>)>, db: u16) -> Result<Vec<Vec<u8>>> {
        fields.retain(|(k, _)| k != b"num");
        let (mut map, _) = self.request(cmd, fields, Some(db)).await?;
        map.remove(b"num".as_slice());
        let mut keys_with_rank: Vec<(Vec<u8>, i64)> = Vec::with_capacity(map.len());
        for (key, value) in map {
            let rank = std::str::from_utf8(&value)
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            keys_with_rank.push((key, rank));
        }
        keys_with_rank.sort_by_key(|(_, rank)| *rank);
        Ok(keys_with_rank.into_iter().map(|(k, _)| k).collect())
    }

    pub async fn match_prefix(&self, prefix: &[u8], max_keys: Option<u32>, db: u16) -> Result<Vec<Vec<u8>>> {
        let mut fields = vec![(b"prefix".to_vec(), prefix.to_vec())];
        if let Some(max) = max_keys {
            fields.push((b"max".to_vec(), max.to_string().into_bytes()));
        }
        self.match_sorted("match_prefix", fields, db).await
    }

    pub async fn match_regex(&self, pattern: &str, max_keys: Option<u32>, db: u16) -> Result<Vec<Vec<u8>>> {
        let mut fields = vec![(b"regex".to_vec(), pattern.as_bytes().to_vec())];
        if let Some(max) = max_keys {
            fields.push((b"max".to_vec(), max.to_string().into_bytes()));
        }
        self.match_sorted("match_regex", fields, db).await
    }

    pub async fn match_similar(
        &self,
        origin: &[u8],
        distance: Option<u32>,
        max_keys: Option<u32>,
        db: u16,
    ) -> Result<Vec<Vec<u8>>> {
        let mut fields = vec![
            (b"origin".to_vec(), origin.to_vec()),
            (b"utf".to_vec(), b"true".to_vec()),
        ];
        if let Some(distance) = distance {
            fields.push((b"range".to_vec(), distance.to_string().into_bytes()));
        }
        if let Some(max) = max_keys {
            fields.push((b"max".to_vec(), max.to_string().into_bytes()));
        }
        self.match_sorted("match_similar", fields, db).await
    }

    pub async fn status(&self, db: u16) -> Result<TsvMap> {
        Ok(self.request("status", vec![], Some(db)).await?.0)
    }

    pub async fn report(&self) -> Result<TsvMap> {
        Ok(self.request("report", vec![], None).await?.0)
    }

    pub async fn clear(&self, db: u16) -> Result<bool> {
        let (_, outcome) = self.request("clear", vec![], Some(db)).await?;
        Ok(outcome == Outcome::Ok)
    }

    pub async fn synchronize(&self, hard: bool, command: Option<&str>, db: u16) -> Result<bool> {
        let mut fields = Vec::new();
        if hard {
            fields.push((b"hard".to_vec(), Vec::new()));
        }
        if let Some(command) = command {
            fields.push((b"command".to_vec(), command.as_bytes().to_vec()));
        }
        let (_, outcome) = self.request("synchronize", fields, Some(db)).await?;
        Ok(outcome == Outcome::Ok)
    }

    pub async fn vacuum(&self, step: u32, db: u16) -> Result<bool> {
        let fields = if step > 0 {
            vec![(b"step".to_vec(), step.to_string().into_bytes())]
        } else {
            vec![]
        };
        let (_, outcome) = self.request("vacuum", fields, Some(db)).await?;
        Ok(outcome == Outcome::Ok)
    }

    /// `/rpc/tune_replication` (§4.4 "Replication tuning"): a send-and-forget
    /// helper, not a replication client — see `crate::protocol_a::open_replication`.
    pub async fn tune_replication(
        &self,
        host: Option<&str>,
        port: Option<u16>,
        timestamp: Option<u64>,
        interval: Option<u64>,
    ) -> Result<bool> {
        let mut fields = Vec::new();
        if let Some(host) = host {
            fields.push((b"host".to_vec(), host.as_bytes().to_vec()));
        }
        if let Some(port) = port {
            fields.push((b"port".to_vec(), port.to_string().into_bytes()));
        }
        if let Some(ts) = timestamp {
            fields.push((b"ts".to_vec(), ts.to_string().into_bytes()));
        }
        if let Some(iv) = interval {
            fields.push((b"iv".to_vec(), iv.to_string().into_bytes()));
        }
        let (_, outcome) = self.request("tune_replication", fields, None).await?;
        Ok(outcome == Outcome::Ok)
    }

    pub async fn play_script(&self, name: &str, params: &[(String, Value)]) -> Result<Option<Vec<(String, Value)>>> {
        let mut fields = Vec::with_capacity(params.len() + 1);
        fields.push((b"name".to_vec(), name.as_bytes().to_vec()));
        for (key, value) in params {
            let mut prefixed = Vec::with_capacity(key.len() + 1);
            prefixed.push(b'_');
            prefixed.extend_from_slice(key.as_bytes());
            fields.push((prefixed, self.encode_value(value.clone())?));
        }
        let (map, outcome) = self.request("play_script", fields, None).await?;
        if outcome == Outcome::LogicalFailure {
            return Ok(None);
        }
        let mut out = Vec::with_capacity(map.len());
        for (key, value) in map {
            let key = key.strip_prefix(b"_").unwrap_or(&key);
            let key = String::from_utf8(key.to_vec())
                .map_err(|e| ClientError::Protocol(format!("non-utf8 script output key: {e}")))?;
            out.push((key, self.decode_value(value)?));
        }
        Ok(Some(out))
    }

    /// `ulog_list` (supplemented): parses the `"<size>:<ts_nanos>"` value
    /// format into `(filename, size, timestamp_nanos)` triples.
    pub async fn ulog_list(&self) -> Result<Vec<(Vec<u8>, u64, u64)>> {
        let (map, _) = self.request("ulog_list", vec![], None).await?;
        let mut out = Vec::with_capacity(map.len());
        for (filename, meta) in map {
            let meta = std::str::from_utf8(&meta)
                .map_err(|e| ClientError::Protocol(format!("malformed ulog_list entry: {e}")))?;
            let (size, ts) = meta
                .split_once(':')
                .ok_or_else(|| ClientError::Protocol("malformed ulog_list entry".to_string()))?;
            out.push((
                filename,
                size.parse().map_err(|_| ClientError::Protocol("malformed ulog size".to_string()))?,
                ts.parse().map_err(|_| ClientError::Protocol("malformed ulog timestamp".to_string()))?,
            ));
        }
        Ok(out)
    }

    /// `ulog_remove` (supplemented): `max_ts_nanos` defaults to "now" at the
    /// call site, since this module may not call `Date.now()`-equivalents.
    pub async fn ulog_remove(&self, max_ts_nanos: u64) -> Result<bool> {
        let fields = vec![(b"ts".to_vec(), max_ts_nanos.to_string().into_bytes())];
        let (_, outcome) = self.request("ulog_remove", fields, None).await?;
        Ok(outcome == Outcome::Ok)
    }

    // --- Cursor operations -------------------------------------------------

    pub async fn cur_jump(&self, cursor_id: u32, key: Option<&[u8]>, db: u16) -> Result<bool> {
        let mut fields = Vec::new();
        if let Some(key) = key {
            fields.push((b"key".to_vec(), key.to_vec()));
        }
        self.cursor_command("cur_jump", cursor_id, fields, Some(db)).await
    }

    pub async fn cur_jump_back(&self, cursor_id: u32, key: Option<&[u8]>, db: u16) -> Result<bool> {
        let mut fields = Vec::new();
        if let Some(key) = key {
            fields.push((b"key".to_vec(), key.to_vec()));
        }
        self.cursor_command("cur_jump_back", cursor_id, fields, Some(db)).await
    }

    pub async fn cur_step(&self, cursor_id: u32) -> Result<bool> {
        self.cursor_command("cur_step", cursor_id, vec![], None).await
    }

    pub async fn cur_step_back(&self, cursor_id: u32) -> Result<bool> {
        self.cursor_command("cur_step_back", cursor_id, vec![], None).await
    }

    pub async fn cur_set_value(
        &self,
        cursor_id: u32,
        value: Value,
        step: bool,
        expire_seconds: Option<i64>,
    ) -> Result<bool> {
        let mut fields = vec![(b"value".to_vec(), self.encode_value(value)?)];
        if let Some(xt) = expire_seconds {
            fields.push((b"xt".to_vec(), xt.to_string().into_bytes()));
        }
        if step {
            fields.push((b"step".to_vec(), Vec::new()));
        }
        self.cursor_command("cur_set_value", cursor_id, fields, None).await
    }

    pub async fn cur_remove(&self, cursor_id: u32) -> Result<bool> {
        self.cursor_command("cur_remove", cursor_id, vec![], None).await
    }

    pub async fn cur_delete(&self, cursor_id: u32) -> Result<bool> {
        self.cursor_command("cur_delete", cursor_id, vec![], None).await
    }

    pub async fn cur_get_key(&self, cursor_id: u32, step: bool) -> Result<Option<Vec<u8>>> {
        let fields = if step { vec![(b"step".to_vec(), Vec::new())] } else { vec![] };
        let (mut map, outcome) = self.cursor_request("cur_get_key", cursor_id, fields, None).await?;
        if outcome != Outcome::Ok {
            return Ok(None);
        }
        Ok(map.remove(b"key".as_slice()))
    }

    pub async fn cur_get_value(&self, cursor_id: u32, step: bool) -> Result<Option<Value>> {
        let fields = if step { vec![(b"step".to_vec(), Vec::new())] } else { vec![] };
        let (mut map, outcome) = self.cursor_request("cur_get_value", cursor_id, fields, None).await?;
        if outcome != Outcome::Ok {
            return Ok(None);
        }
        let bytes = map
            .remove(b"value".as_slice())
            .ok_or_else(|| ClientError::Protocol("cur_get_value response missing `value`".to_string()))?;
        Ok(Some(self.decode_value(bytes)?))
    }

    pub async fn cur_get(&self, cursor_id: u32, step: bool) -> Result<Option<(Vec<u8>, Value)>> {
        let fields = if step { vec![(b"step".to_vec(), Vec::new())] } else { vec![] };
        let (mut map, outcome) = self.cursor_request("cur_get", cursor_id, fields, None).await?;
        if outcome != Outcome::Ok {
            return Ok(None);
        }
        let key = map
            .remove(b"key".as_slice())
            .ok_or_else(|| ClientError::Protocol("cur_get response missing `key`".to_string()))?;
        let value = map
            .remove(b"value".as_slice())
            .ok_or_else(|| ClientError::Protocol("cur_get response missing `value`".to_string()))?;
        Ok(Some((key, self.decode_value(value)?)))
    }

    pub async fn cur_seize(&self, cursor_id: u32) -> Result<Option<(Vec<u8>, Value)>> {
        let (mut map, outcome) = self.cursor_request("cur_seize", cursor_id, vec![], None).await?;
        if outcome != Outcome::Ok {
            return Ok(None);
        }
        let key = map
            .remove(b"key".as_slice())
            .ok_or_else(|| ClientError::Protocol("cur_seize response missing `key`".to_string()))?;
        let value = map
            .remove(b"value".as_slice())
            .ok_or_else(|| ClientError::Protocol("cur_seize response missing `value`".to_string()))?;
        Ok(Some((key, self.decode_value(value)?)))
    }

    async fn cursor_command(
        &self,
        cmd: &str,
        cursor_id: u32,
        fields: Vec<(Vec<u8>, Vec<u8>)>,
        db: Option<u16>,
    ) -> Result<bool> {
        let (_, outcome) = self.cursor_request(cmd, cursor_id, fields, db).await?;
        Ok(outcome == Outcome::Ok)
    }

    async fn cursor_request(
        &self,
        cmd: &str,
        cursor_id: u32,
        mut fields: Vec<(Vec<u8>, Vec<u8>)>,
        db: Option<u16>,
    ) -> Result<(TsvMap, Outcome)> {
        fields.push((b"CUR".to_vec(), cursor_id.to_string().into_bytes()));
        let (map, outcome) = self.request(cmd, fields, db).await?;
        if outcome == Outcome::Unsupported {
            return Err(ClientError::Protocol(format!("{cmd} is not supported by this server")));
        }
        Ok((map, outcome))
    }
}

fn parse_number_field(map: &TsvMap, field: &[u8]) -> Result<i64> {
    let raw = map
        .get(field)
        .ok_or_else(|| ClientError::Protocol(format!("response missing `{}` field", String::from_utf8_lossy(field))))?;
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ClientError::Protocol(format!("malformed `{}` field", String::from_utf8_lossy(field))))
}

/// Cursor state machine (§4.7 "Cursor state machine"): `unopened` / `valid`
/// / `invalid` / `closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CursorState {
    Unopened,
    Valid,
    Invalid,
    Closed,
}

pub struct Cursor<'a> {
    protocol: &'a HttpProtocol,
    cursor_id: u32,
    db: u16,
    state: CursorState,
}

impl<'a> Cursor<'a> {
    pub fn new(protocol: &'a HttpProtocol, db: u16) -> Self {
        Cursor {
            protocol,
            cursor_id: protocol.next_cursor_id(),
            db,
            state: CursorState::Unopened,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.state == CursorState::Valid
    }

    pub async fn jump(&mut self, key: Option<&[u8]>) -> Result<bool> {
        let ok = self.protocol.cur_jump(self.cursor_id, key, self.db).await?;
        self.state = if ok { CursorState::Valid } else { CursorState::Invalid };
        Ok(ok)
    }

    pub async fn jump_back(&mut self, key: Option<&[u8]>) -> Result<bool> {
        let ok = self.protocol.cur_jump_back(self.cursor_id, key, self.db).await?;
        self.state = if ok { CursorState::Valid } else { CursorState::Invalid };
        Ok(ok)
    }

    pub async fn step(&mut self) -> Result<bool> {
        let ok = self.protocol.cur_step(self.cursor_id).await?;
        self.state = if ok { CursorState::Valid } else { CursorState::Invalid };
        Ok(ok)
    }

    pub async fn step_back(&mut self) -> Result<bool> {
        let ok = self.protocol.cur_step_back(self.cursor_id).await?;
        self.state = if ok { CursorState::Valid } else { CursorState::Invalid };
        Ok(ok)
    }

    pub async fn get(&mut self) -> Result<Option<(Vec<u8>, Value)>> {
        if self.state != CursorState::Valid {
            return Ok(None);
        }
        let result = self.protocol.cur_get(self.cursor_id, false).await?;
        if result.is_none() {
            self.state = CursorState::Invalid;
        }
        Ok(result)
    }

    pub async fn seize(&mut self) -> Result<Option<(Vec<u8>, Value)>> {
        if self.state != CursorState::Valid {
            return Ok(None);
        }
        let result = self.protocol.cur_seize(self.cursor_id).await?;
        if result.is_none() {
            self.state = CursorState::Invalid;
        }
        Ok(result)
    }

    pub async fn set_value(&mut self, value: Value) -> Result<bool> {
        if self.state != CursorState::Valid {
            return Ok(false);
        }
        let ok = self.protocol.cur_set_value(self.cursor_id, value, false, None).await?;
        if !ok {
            self.state = CursorState::Invalid;
        }
        Ok(ok)
    }

    pub async fn remove(&mut self) -> Result<bool> {
        if self.state != CursorState::Valid {
            return Ok(false);
        }
        self.protocol.cur_remove(self.cursor_id).await
    }

    pub async fn delete(&mut self) -> Result<bool> {
        let ok = self.protocol.cur_delete(self.cursor_id).await?;
        if ok {
            self.state = CursorState::Closed;
        }
        Ok(ok)
    }
}
