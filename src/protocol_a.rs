//! Binary Protocol A: the cache-server's framed binary RPC (§4.4).
//!
//! A single `get`/`set`/`remove` is sent as a bulk request of length one,
//! matching the wire's own uniformity — there is no separate single-record
//! op code to special-case.

use log::warn;

use crate::error::{ClientError, Result};
use crate::pool::PooledConnection;

pub const OP_SET_BULK: u8 = 0xB8;
pub const OP_REMOVE_BULK: u8 = 0xB9;
pub const OP_GET_BULK: u8 = 0xBA;
pub const OP_SCRIPT: u8 = 0xB4;
pub const OP_REPLICATION: u8 = 0xB1;
pub const OP_ERROR: u8 = 0xBF;

const FLAG_NONE: u32 = 0x0000_0000;
const FLAG_NO_REPLY: u32 = 0x0000_0001;

/// One record as carried in a bulk request or response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub db: u16,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    /// Negative means "no expiry override", per §4.2.
    pub xt: i64,
}

async fn expect_op(conn: &mut PooledConnection, expected: u8) -> Result<()> {
    let got = conn.read_u8_be().await?;
    if got == OP_ERROR {
        conn.mark_dead();
        return Err(ClientError::Protocol(
            "server returned error opcode 0xBF".to_string(),
        ));
    }
    if got != expected {
        conn.mark_dead();
        return Err(ClientError::Protocol(format!(
            "expected echoed opcode {expected:#04x}, got {got:#04x}"
        )));
    }
    Ok(())
}

async fn write_record(conn: &mut PooledConnection, record: &Record) -> Result<()> {
    conn.write_u16_be(record.db).await?;
    conn.write_u32_be(record.key.len() as u32).await?;
    conn.write_u32_be(record.value.len() as u32).await?;
    conn.write_i64_be(record.xt).await?;
    conn.write_all_bytes(&record.key).await?;
    conn.write_all_bytes(&record.value).await
}

async fn read_record(conn: &mut PooledConnection) -> Result<Record> {
    let db = conn.read_u16_be().await?;
    let klen = conn.read_u32_be().await? as usize;
    let vlen = conn.read_u32_be().await? as usize;
    let xt = conn.read_i64_be().await?;
    let key = conn.read_exact_bytes(klen).await?;
    let value = conn.read_exact_bytes(vlen).await?;
    Ok(Record { db, key, value, xt })
}

/// Writes `n_recs` then each record, with a two-byte key descriptor used by
/// `get_bulk`/`remove_bulk` (no value, no expiry — just `db ∥ klen ∥ key`).
async fn write_key(conn: &mut PooledConnection, db: u16, key: &[u8]) -> Result<()> {
    conn.write_u16_be(db).await?;
    conn.write_u32_be(key.len() as u32).await?;
    conn.write_all_bytes(key).await
}

/// `set_bulk` (0xB8). Returns the number of records written.
pub async fn set_bulk(conn: &mut PooledConnection, records: &[Record]) -> Result<u32> {
    conn.write_u8_be(OP_SET_BULK).await?;
    conn.write_u32_be(FLAG_NONE).await?;
    conn.write_u32_be(records.len() as u32).await?;
    for record in records {
        write_record(conn, record).await?;
    }
    expect_op(conn, OP_SET_BULK).await?;
    conn.read_u32_be().await
}

/// `set_bulk` with the no-reply flag set: the caller must not read a
/// response (§4.4 "no-reply"; §5 "No-reply writes"). It is the caller's
/// responsibility not to interleave a reply-producing request on the same
/// connection before the server has drained this one.
pub async fn set_bulk_no_reply(conn: &mut PooledConnection, records: &[Record]) -> Result<()> {
    conn.write_u8_be(OP_SET_BULK).await?;
    conn.write_u32_be(FLAG_NO_REPLY).await?;
    conn.write_u32_be(records.len() as u32).await?;
    for record in records {
        write_record(conn, record).await?;
    }
    Ok(())
}

/// `get_bulk` (0xBA). Requests are `(db, key)` pairs; returns every record
/// the server holds for them (missing keys are simply absent from the
/// result, per the server's own bulk semantics).
pub async fn get_bulk(conn: &mut PooledConnection, keys: &[(u16, Vec<u8>)]) -> Result<Vec<Record>> {
    conn.write_u8_be(OP_GET_BULK).await?;
    conn.write_u32_be(FLAG_NONE).await?;
    conn.write_u32_be(keys.len() as u32).await?;
    for (db, key) in keys {
        write_key(conn, *db, key).await?;
    }
    expect_op(conn, OP_GET_BULK).await?;
    let n = conn.read_u32_be().await? as usize;
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        out.push(read_record(conn).await?);
    }
    Ok(out)
}

/// `remove_bulk` (0xB9). Returns the number of records actually removed.
pub async fn remove_bulk(conn: &mut PooledConnection, keys: &[(u16, Vec<u8>)]) -> Result<u32> {
    conn.write_u8_be(OP_REMOVE_BULK).await?;
    conn.write_u32_be(FLAG_NONE).await?;
    conn.write_u32_be(keys.len() as u32).await?;
    for (db, key) in keys {
        write_key(conn, *db, key).await?;
    }
    expect_op(conn, OP_REMOVE_BULK).await?;
    conn.read_u32_be().await
}

/// `script` (0xB4). Output keys have their leading `_` stripped, mirroring
/// the convention by which callers tag input keys in the first place.
pub async fn script(
    conn: &mut PooledConnection,
    name: &str,
    params: &[(Vec<u8>, Vec<u8>)],
) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    conn.write_u8_be(OP_SCRIPT).await?;
    conn.write_u32_be(FLAG_NONE).await?;
    conn.write_u32_be(name.len() as u32).await?;
    conn.write_u32_be(params.len() as u32).await?;
    conn.write_all_bytes(name.as_bytes()).await?;
    for (key, value) in params {
        conn.write_u32_be(key.len() as u32).await?;
        conn.write_u32_be(value.len() as u32).await?;
        conn.write_all_bytes(key).await?;
        conn.write_all_bytes(value).await?;
    }

    let got = conn.read_u8_be().await?;
    if got == OP_ERROR {
        // Framing completed (the status byte was read); a pending-script
        // failure is a server error, not a reason to discard the connection.
        warn!("script {name} reported a pending-script failure");
        return Ok(Vec::new());
    }
    if got != OP_SCRIPT {
        conn.mark_dead();
        return Err(ClientError::Protocol(format!(
            "expected echoed opcode {OP_SCRIPT:#04x}, got {got:#04x}"
        )));
    }

    let n = conn.read_u32_be().await? as usize;
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        let klen = conn.read_u32_be().await? as usize;
        let vlen = conn.read_u32_be().await? as usize;
        let key = conn.read_exact_bytes(klen).await?;
        let value = conn.read_exact_bytes(vlen).await?;
        let key = key.strip_prefix(b"_").map(|k| k.to_vec()).unwrap_or(key);
        out.push((key, value));
    }
    Ok(out)
}

/// Sends the replication-stream open request (0xB1) and returns without
/// reading the response stream; replaying/merging it is out of scope
/// (Non-goal: no replication choreography). `tune_replication` itself goes
/// over the HTTP protocol, not this op — see `crate::http`.
pub async fn open_replication(conn: &mut PooledConnection, timestamp: u64, sid: u16) -> Result<()> {
    conn.write_u8_be(OP_REPLICATION).await?;
    conn.write_u64_be(timestamp).await?;
    conn.write_u16_be(sid).await
}
