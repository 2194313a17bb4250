//! Compiles typed predicates into the sibling server's `search` command
//! encoding (§4.8).
//!
//! Each `addcond`/`setorder`/`setlimit` argument is the NUL-joined UTF-8
//! encoding of its tokens; opcodes and order codes are opaque `u32`s the
//! caller supplies (§6) — the builder never interprets them beyond OR'ing in
//! [`OP_NEGATE`] when asked to negate a condition.

use crate::error::Result;
use crate::pool::PooledConnection;
use crate::protocol_b::{items_to_pairs, search, search_cmd_blob};
use crate::tabmap;

pub const OP_NEGATE: u32 = 1 << 24;

#[derive(Debug, Clone)]
struct Condition {
    column: String,
    opcode: u32,
    value: String,
}

#[derive(Debug, Clone)]
struct Ordering {
    column: String,
    order_code: u32,
}

/// Builds one `search` call. `execute`/`get`/`delete`/`count` each reuse the
/// accumulated condition/ordering list — none of them mutate `self`, so the
/// same builder can be run against several aggregators.
#[derive(Debug, Clone, Default)]
pub struct QueryBuilder {
    conditions: Vec<Condition>,
    orderings: Vec<Ordering>,
    limit: Option<u64>,
    offset: Option<u64>,
}

impl QueryBuilder {
    pub fn new() -> Self {
        QueryBuilder::default()
    }

    /// Pushes `addcond\0<column>\0<opcode>\0<value>`. Pass `negate: true` to
    /// OR in [`OP_NEGATE`] rather than pre-computing it at the call site.
    pub fn filter(mut self, column: impl Into<String>, opcode: u32, value: impl Into<String>, negate: bool) -> Self {
        let opcode = if negate { opcode | OP_NEGATE } else { opcode };
        self.conditions.push(Condition {
            column: column.into(),
            opcode,
            value: value.into(),
        });
        self
    }

    /// Pushes `setorder\0<column>\0<order_code>`.
    pub fn order_by(mut self, column: impl Into<String>, order_code: u32) -> Self {
        self.orderings.push(Ordering {
            column: column.into(),
            order_code,
        });
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    fn cmd_blobs(&self) -> Vec<Vec<u8>> {
        let mut blobs = Vec::with_capacity(self.conditions.len() + self.orderings.len() + 1);
        for cond in &self.conditions {
            blobs.push(search_cmd_blob(&[
                b"addcond",
                cond.column.as_bytes(),
                cond.opcode.to_string().as_bytes(),
                cond.value.as_bytes(),
            ]));
        }
        for order in &self.orderings {
            blobs.push(search_cmd_blob(&[
                b"setorder",
                order.column.as_bytes(),
                order.order_code.to_string().as_bytes(),
            ]));
        }
        if self.limit.is_some() || self.offset.is_some() {
            let limit = self.limit.unwrap_or(u64::from(u32::MAX));
            let offset = self.offset.unwrap_or(0);
            blobs.push(search_cmd_blob(&[
                b"setlimit",
                limit.to_string().as_bytes(),
                offset.to_string().as_bytes(),
            ]));
        }
        blobs
    }

    /// `search(…, None)`: matching keys, unordered aggregation.
    pub async fn execute(&self, conn: &mut PooledConnection) -> Result<Vec<Vec<u8>>> {
        search(conn, &self.cmd_blobs(), None).await
    }

    /// `search(…, "get")`: matching rows, decoded via TabMap.
    pub async fn get(&self, conn: &mut PooledConnection) -> Result<Vec<(Vec<u8>, Vec<(String, String)>)>> {
        let items = search(conn, &self.cmd_blobs(), Some("get")).await?;
        let pairs = items_to_pairs(items)?;
        let mut out = Vec::with_capacity(pairs.len());
        for (key, row) in pairs {
            let mut fields = Vec::new();
            for (k, v) in tabmap::deserialize_map(&row)? {
                fields.push((String::from_utf8_lossy(&k).into_owned(), String::from_utf8_lossy(&v).into_owned()));
            }
            out.push((key, fields));
        }
        Ok(out)
    }

    /// `search(…, "out")`: deletes matching records.
    pub async fn delete(&self, conn: &mut PooledConnection) -> Result<Vec<Vec<u8>>> {
        search(conn, &self.cmd_blobs(), Some("out")).await
    }

    /// `search(…, "count")`: number of matching records.
    pub async fn count(&self, conn: &mut PooledConnection) -> Result<u64> {
        let items = search(conn, &self.cmd_blobs(), Some("count")).await?;
        let raw = items
            .first()
            .ok_or_else(|| crate::error::ClientError::Protocol("search count returned no items".to_string()))?;
        std::str::from_utf8(raw)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| crate::error::ClientError::Protocol("malformed search count".to_string()))
    }
}
