//! Binary Protocol B: the sibling server's framed binary RPC (§4.6).
//!
//! Two request framings share one leading magic byte, `0xC8`: a per-command
//! op byte for the fixed commands below, and a generic `misc` sub-op (`0x90`)
//! that every other command — including `search` — rides on.

use crate::error::{ClientError, Result};
use crate::pool::PooledConnection;

pub const MAGIC: u8 = 0xC8;

pub const OP_PUT: u8 = 0x10;
pub const OP_PUTKEEP: u8 = 0x11;
pub const OP_PUTCAT: u8 = 0x12;
pub const OP_PUTSHL: u8 = 0x13;
pub const OP_PUTNR: u8 = 0x18;
pub const OP_OUT: u8 = 0x20;
pub const OP_GET: u8 = 0x30;
pub const OP_MGET: u8 = 0x31;
pub const OP_VSIZ: u8 = 0x38;
pub const OP_ITERINIT: u8 = 0x50;
pub const OP_ITERNEXT: u8 = 0x51;
pub const OP_FWMKEYS: u8 = 0x58;
pub const OP_ADDINT: u8 = 0x60;
pub const OP_ADDDOUBLE: u8 = 0x61;
pub const OP_EXT: u8 = 0x68;
pub const OP_SYNC: u8 = 0x70;
pub const OP_VANISH: u8 = 0x72;
pub const OP_COPY: u8 = 0x73;
pub const OP_RESTORE: u8 = 0x74;
pub const OP_SETMST: u8 = 0x78;
pub const OP_RNUM: u8 = 0x80;
pub const OP_SIZE: u8 = 0x81;
pub const OP_STAT: u8 = 0x88;
pub const OP_MISC: u8 = 0x90;

const OPT_NO_ULOG: u32 = 0x0000_0001;
pub const EXT_LOCK_RECORDS: u32 = 0x0000_0001;
pub const EXT_LOCK_ALL: u32 = 0x0000_0002;

async fn write_blob(conn: &mut PooledConnection, bytes: &[u8]) -> Result<()> {
    conn.write_blob(bytes).await
}

/// Reads the leading status byte every magic-framed command echoes: `0x00`
/// on success, non-zero on failure. The connection stays reusable on a
/// server-signaled failure — only a framing mismatch or I/O error kills it.
async fn read_status(conn: &mut PooledConnection) -> Result<u8> {
    conn.read_u8_be().await
}

async fn open_command(conn: &mut PooledConnection, op: u8) -> Result<()> {
    conn.write_u8_be(MAGIC).await?;
    conn.write_u8_be(op).await
}

/// `put` (0x10): unconditional write.
pub async fn put(conn: &mut PooledConnection, key: &[u8], value: &[u8]) -> Result<()> {
    open_command(conn, OP_PUT).await?;
    write_blob(conn, key).await?;
    write_blob(conn, value).await?;
    match read_status(conn).await? {
        0 => Ok(()),
        code => Err(ClientError::Server(format!("put failed with status {code}"))),
    }
}

/// `put` without waiting for a reply (0x18). The caller is responsible for
/// not interleaving a reply-producing request on the same connection before
/// the server has drained this one (§5).
pub async fn putnr(conn: &mut PooledConnection, key: &[u8], value: &[u8]) -> Result<()> {
    open_command(conn, OP_PUTNR).await?;
    write_blob(conn, key).await?;
    write_blob(conn, value).await
}

/// `putkeep` (0x11): fails (returns `false`) if the key already exists.
pub async fn putkeep(conn: &mut PooledConnection, key: &[u8], value: &[u8]) -> Result<bool> {
    open_command(conn, OP_PUTKEEP).await?;
    write_blob(conn, key).await?;
    write_blob(conn, value).await?;
    Ok(read_status(conn).await? == 0)
}

/// `putcat` (0x12): appends `value` to the existing record, creating it if
/// absent.
pub async fn putcat(conn: &mut PooledConnection, key: &[u8], value: &[u8]) -> Result<()> {
    open_command(conn, OP_PUTCAT).await?;
    write_blob(conn, key).await?;
    write_blob(conn, value).await?;
    match read_status(conn).await? {
        0 => Ok(()),
        code => Err(ClientError::Server(format!("putcat failed with status {code}"))),
    }
}

/// `putshl` (0x13): appends then truncates the record to its trailing
/// `width` bytes.
pub async fn putshl(conn: &mut PooledConnection, key: &[u8], value: &[u8], width: u32) -> Result<()> {
    open_command(conn, OP_PUTSHL).await?;
    write_blob(conn, key).await?;
    write_blob(conn, value).await?;
    conn.write_u32_be(width).await?;
    match read_status(conn).await? {
        0 => Ok(()),
        code => Err(ClientError::Server(format!("putshl failed with status {code}"))),
    }
}

/// `out` (0x20): returns `false` if the key was not present.
pub async fn out(conn: &mut PooledConnection, key: &[u8]) -> Result<bool> {
    open_command(conn, OP_OUT).await?;
    write_blob(conn, key).await?;
    Ok(read_status(conn).await? == 0)
}

/// `get` (0x30): returns `None` if the key is not present.
pub async fn get(conn: &mut PooledConnection, key: &[u8]) -> Result<Option<Vec<u8>>> {
    open_command(conn, OP_GET).await?;
    write_blob(conn, key).await?;
    match read_status(conn).await? {
        0 => Ok(Some(conn.read_blob().await?)),
        _ => Ok(None),
    }
}

/// `mget` (0x31): returns only the keys the server actually holds.
pub async fn mget(conn: &mut PooledConnection, keys: &[Vec<u8>]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    open_command(conn, OP_MGET).await?;
    conn.write_u32_be(keys.len() as u32).await?;
    for key in keys {
        write_blob(conn, key).await?;
    }
    match read_status(conn).await? {
        0 => {
            let n = conn.read_u32_be().await? as usize;
            let mut out = Vec::with_capacity(n);
            for _ in 0..n {
                let key = conn.read_blob().await?;
                let value = conn.read_blob().await?;
                out.push((key, value));
            }
            Ok(out)
        }
        code => Err(ClientError::Server(format!("mget failed with status {code}"))),
    }
}

/// `putlist` (misc): writes every `(key, value)` pair in one round trip.
/// Always succeeds at the framing level regardless of per-record outcome,
/// per §4.6 "misc command semantics".
pub async fn putlist(conn: &mut PooledConnection, records: &[(Vec<u8>, Vec<u8>)]) -> Result<()> {
    let mut args = Vec::with_capacity(records.len() * 2);
    for (key, value) in records {
        args.push(key.clone());
        args.push(value.clone());
    }
    misc(conn, "putlist", &args, false).await.map(|_| ())
}

/// `outlist` (misc): removes every key in one round trip. Always succeeds
/// at the framing level regardless of per-record outcome.
pub async fn outlist(conn: &mut PooledConnection, keys: &[Vec<u8>]) -> Result<()> {
    misc(conn, "outlist", keys, false).await.map(|_| ())
}

/// `getlist` (misc): the flat alternating key,value sequence `misc`
/// returns is interpreted as a map; an odd element count is a protocol
/// error (§4.6).
pub async fn getlist(conn: &mut PooledConnection, keys: &[Vec<u8>]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let items = misc(conn, "getlist", keys, false).await?;
    items_to_pairs(items)
}

/// `vsiz` (0x38): `None` means the key is not present, matching the wire's
/// `i32 size` sentinel of `-1`.
pub async fn vsiz(conn: &mut PooledConnection, key: &[u8]) -> Result<Option<i32>> {
    open_command(conn, OP_VSIZ).await?;
    write_blob(conn, key).await?;
    match read_status(conn).await? {
        0 => {
            let size = conn.read_i32_be().await?;
            Ok(if size < 0 { None } else { Some(size) })
        }
        _ => Ok(None),
    }
}

/// `fwmkeys` (0x58): keys sharing `prefix`, capped at `max` (`<0` = no cap).
pub async fn fwmkeys(conn: &mut PooledConnection, prefix: &[u8], max: i32) -> Result<Vec<Vec<u8>>> {
    open_command(conn, OP_FWMKEYS).await?;
    write_blob(conn, prefix).await?;
    conn.write_i32_be(max).await?;
    match read_status(conn).await? {
        0 => {
            let n = conn.read_u32_be().await? as usize;
            let mut out = Vec::with_capacity(n);
            for _ in 0..n {
                out.push(conn.read_blob().await?);
            }
            Ok(out)
        }
        code => Err(ClientError::Server(format!("fwmkeys failed with status {code}"))),
    }
}

/// `addint` (0x60): adds `delta` to the integer stored at `key` (creating it
/// if absent) and returns the new value.
pub async fn addint(conn: &mut PooledConnection, key: &[u8], delta: i32) -> Result<i32> {
    open_command(conn, OP_ADDINT).await?;
    write_blob(conn, key).await?;
    conn.write_i32_be(delta).await?;
    match read_status(conn).await? {
        0 => conn.read_i32_be().await,
        code => Err(ClientError::Server(format!("addint failed with status {code}"))),
    }
}

/// `adddouble` (0x61): the wire splits the double into an integer and
/// fractional part scaled by 1e12, per §4.6.
pub async fn adddouble(conn: &mut PooledConnection, key: &[u8], delta: f64) -> Result<f64> {
    let int_part = delta.trunc() as i64;
    let frac_part = ((delta.fract()) * 1e12).round() as i64;
    open_command(conn, OP_ADDDOUBLE).await?;
    write_blob(conn, key).await?;
    conn.write_i64_be(int_part).await?;
    conn.write_i64_be(frac_part).await?;
    match read_status(conn).await? {
        0 => {
            let int_part = conn.read_i64_be().await?;
            let frac_part = conn.read_i64_be().await?;
            Ok(int_part as f64 + (frac_part as f64 / 1e12))
        }
        code => Err(ClientError::Server(format!("adddouble failed with status {code}"))),
    }
}

/// `ext` (0x68): invokes a server-side extension function.
pub async fn ext(
    conn: &mut PooledConnection,
    name: &str,
    opts: u32,
    key: &[u8],
    value: &[u8],
) -> Result<Vec<u8>> {
    open_command(conn, OP_EXT).await?;
    write_blob(conn, name.as_bytes()).await?;
    conn.write_u32_be(opts).await?;
    write_blob(conn, key).await?;
    write_blob(conn, value).await?;
    match read_status(conn).await? {
        0 => conn.read_blob().await,
        code => Err(ClientError::Server(format!("ext {name} failed with status {code}"))),
    }
}

/// `vanish` (0x72): removes every record.
pub async fn vanish(conn: &mut PooledConnection) -> Result<()> {
    open_command(conn, OP_VANISH).await?;
    match read_status(conn).await? {
        0 => Ok(()),
        code => Err(ClientError::Server(format!("vanish failed with status {code}"))),
    }
}

/// `sync` (0x70): flushes updates to the backing store.
pub async fn sync(conn: &mut PooledConnection) -> Result<()> {
    open_command(conn, OP_SYNC).await?;
    match read_status(conn).await? {
        0 => Ok(()),
        code => Err(ClientError::Server(format!("sync failed with status {code}"))),
    }
}

/// `copy` (0x73): hot-copies the database file to `dest_path`.
pub async fn copy(conn: &mut PooledConnection, dest_path: &str) -> Result<()> {
    open_command(conn, OP_COPY).await?;
    write_blob(conn, dest_path.as_bytes()).await?;
    match read_status(conn).await? {
        0 => Ok(()),
        code => Err(ClientError::Server(format!("copy failed with status {code}"))),
    }
}

/// `restore` (0x74): restores from `path` at or after update-log `ts`.
pub async fn restore(conn: &mut PooledConnection, path: &str, ts: u64, opts: u32) -> Result<()> {
    open_command(conn, OP_RESTORE).await?;
    write_blob(conn, path.as_bytes()).await?;
    conn.write_u64_be(ts).await?;
    conn.write_u32_be(opts).await?;
    match read_status(conn).await? {
        0 => Ok(()),
        code => Err(ClientError::Server(format!("restore failed with status {code}"))),
    }
}

/// `setmst` (0x78): points this server at a new replication master.
pub async fn setmst(conn: &mut PooledConnection, host: &str, port: u32, ts: u64, opts: u32) -> Result<()> {
    open_command(conn, OP_SETMST).await?;
    write_blob(conn, host.as_bytes()).await?;
    conn.write_u32_be(port).await?;
    conn.write_u64_be(ts).await?;
    conn.write_u32_be(opts).await?;
    match read_status(conn).await? {
        0 => Ok(()),
        code => Err(ClientError::Server(format!("setmst failed with status {code}"))),
    }
}

/// `rnum` (0x80): total record count.
pub async fn rnum(conn: &mut PooledConnection) -> Result<u64> {
    open_command(conn, OP_RNUM).await?;
    conn.read_u64_be().await
}

/// `size` (0x81): total database size in bytes.
pub async fn size(conn: &mut PooledConnection) -> Result<u64> {
    open_command(conn, OP_SIZE).await?;
    conn.read_u64_be().await
}

/// `stat` (0x88): server status as a flat key-value TabMap.
pub async fn stat(conn: &mut PooledConnection) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    open_command(conn, OP_STAT).await?;
    let len = conn.read_u32_be().await? as usize;
    let buf = conn.read_exact_bytes(len).await?;
    crate::tabmap::deserialize_map(&buf)
}

/// `iterinit` (0x50): rewinds the legacy full-table cursor to the start.
pub async fn iterinit(conn: &mut PooledConnection) -> Result<()> {
    open_command(conn, OP_ITERINIT).await?;
    match read_status(conn).await? {
        0 => Ok(()),
        code => Err(ClientError::Server(format!("iterinit failed with status {code}"))),
    }
}

/// `iternext` (0x51): the next key in the legacy full-table cursor, or
/// `None` once exhausted.
pub async fn iternext(conn: &mut PooledConnection) -> Result<Option<Vec<u8>>> {
    open_command(conn, OP_ITERNEXT).await?;
    match read_status(conn).await? {
        0 => Ok(Some(conn.read_blob().await?)),
        _ => Ok(None),
    }
}

/// Generic `misc` call (§4.6 "misc command semantics"): `name` selects the
/// server-side procedure, `args` are its NUL-free blob arguments. Setting
/// `no_ulog` mirrors the "no update-log" `opts` bit.
///
/// Returns the raw item list; callers interpret it per-command (a flat
/// key/value sequence for `getlist`/`search(get)`, a bare key list for
/// `fwmkeys`-alikes, and so on).
pub async fn misc(
    conn: &mut PooledConnection,
    name: &str,
    args: &[Vec<u8>],
    no_ulog: bool,
) -> Result<Vec<Vec<u8>>> {
    conn.write_u8_be(MAGIC).await?;
    conn.write_u8_be(OP_MISC).await?;
    conn.write_u32_be(name.len() as u32).await?;
    conn.write_u32_be(if no_ulog { OPT_NO_ULOG } else { 0 }).await?;
    conn.write_u32_be(args.len() as u32).await?;
    conn.write_all_bytes(name.as_bytes()).await?;
    for arg in args {
        write_blob(conn, arg).await?;
    }

    let result_code = conn.read_u32_be().await?;
    let n_items = conn.read_u32_be().await? as usize;
    let mut items = Vec::with_capacity(n_items);
    for _ in 0..n_items {
        items.push(conn.read_blob().await?);
    }
    if result_code != 0 {
        return Err(ClientError::Server(format!(
            "misc {name} failed with result code {result_code}"
        )));
    }
    Ok(items)
}

/// Interprets a `misc` item list as a flat alternating key,value sequence —
/// the shape `getlist` and `search(get)` (non-table rows) return. An odd
/// element count is a protocol error, per §4.6.
pub fn items_to_pairs(items: Vec<Vec<u8>>) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    if items.len() % 2 != 0 {
        return Err(ClientError::Protocol(
            "misc result has an odd number of elements; expected key/value pairs".to_string(),
        ));
    }
    Ok(items
        .chunks_exact(2)
        .map(|pair| (pair[0].clone(), pair[1].clone()))
        .collect())
}

/// `setindex` (supplemented, §4.6 "Index management"): thin `misc` wrapper.
pub async fn setindex(
    conn: &mut PooledConnection,
    name: &str,
    index_type: u32,
    nolock: bool,
) -> Result<bool> {
    let mut args = vec![name.as_bytes().to_vec(), index_type.to_string().into_bytes()];
    if nolock {
        args.push(b"1".to_vec());
    }
    Ok(misc(conn, "setindex", &args, false).await.is_ok())
}

/// `optindex` (supplemented, §4.6): optimizes an existing index.
pub async fn optindex(conn: &mut PooledConnection, name: &str) -> Result<bool> {
    Ok(misc(conn, "optindex", &[name.as_bytes().to_vec()], false)
        .await
        .is_ok())
}

/// `outindex` (supplemented, §4.6): drops an index.
pub async fn outindex(conn: &mut PooledConnection, name: &str) -> Result<bool> {
    Ok(misc(conn, "outindex", &[name.as_bytes().to_vec()], false)
        .await
        .is_ok())
}

/// `range` (supplemented from the original source): keys in `[start, stop)`
/// order, capped at `max_keys` (`0` = no cap).
pub async fn range(
    conn: &mut PooledConnection,
    start: &[u8],
    max_keys: i64,
    stop: Option<&[u8]>,
) -> Result<Vec<Vec<u8>>> {
    let mut args = vec![start.to_vec(), max_keys.to_string().into_bytes()];
    if let Some(stop) = stop {
        args.push(stop.to_vec());
    }
    misc(conn, "range", &args, false).await
}

/// `regex` (supplemented): keys whose name matches `pattern`.
pub async fn regex(conn: &mut PooledConnection, pattern: &str, max_keys: i64) -> Result<Vec<Vec<u8>>> {
    misc(
        conn,
        "regex",
        &[pattern.as_bytes().to_vec(), max_keys.to_string().into_bytes()],
        false,
    )
    .await
}

/// `optimize` (supplemented): triggers the backend's own optimize routine.
pub async fn optimize(conn: &mut PooledConnection) -> Result<()> {
    misc(conn, "optimize", &[], false).await.map(|_| ())
}

/// `cacheclear` (supplemented): drops the server-side record cache.
pub async fn cacheclear(conn: &mut PooledConnection) -> Result<()> {
    misc(conn, "cacheclear", &[], false).await.map(|_| ())
}

/// `error` (supplemented): last error code/message the server recorded.
pub async fn error(conn: &mut PooledConnection) -> Result<Vec<Vec<u8>>> {
    misc(conn, "error", &[], false).await
}

/// `getpart` (supplemented): a byte-range slice of a record's value.
pub async fn getpart(
    conn: &mut PooledConnection,
    key: &[u8],
    start: Option<i64>,
    end: Option<i64>,
) -> Result<Option<Vec<u8>>> {
    let mut args = vec![key.to_vec()];
    if start.is_some() || end.is_some() {
        args.push(start.unwrap_or(0).to_string().into_bytes());
    }
    if let Some(end) = end {
        args.push(end.to_string().into_bytes());
    }
    match misc(conn, "getpart", &args, false).await {
        Ok(mut items) if !items.is_empty() => Ok(Some(items.remove(0))),
        Ok(_) => Ok(None),
        Err(ClientError::Server(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

/// `search` (§4.6 "Search encoding"): each `cmd_blob` is the NUL-joined UTF-8
/// encoding of its tokens, e.g. `"addcond\0<col>\0<opcode>\0<value>"`.
/// `aggregator` selects the tail command: `None` = key list, `Some("get")` =
/// interleaved key/row pairs (rows are TabMap-encoded), `Some("out")` = bulk
/// delete, `Some("count")` = count.
pub async fn search(
    conn: &mut PooledConnection,
    cmd_blobs: &[Vec<u8>],
    aggregator: Option<&str>,
) -> Result<Vec<Vec<u8>>> {
    let mut args: Vec<Vec<u8>> = cmd_blobs.to_vec();
    if let Some(agg) = aggregator {
        args.push(agg.as_bytes().to_vec());
    }
    misc(conn, "search", &args, false).await
}

/// Joins search-condition tokens with NUL bytes, matching the wire's
/// `addcond\0<col>\0<opcode>\0<value>` shape.
pub fn search_cmd_blob(tokens: &[&[u8]]) -> Vec<u8> {
    tokens.join(&0u8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use crate::pool::{Pool, PoolConfig};

    #[tokio::test]
    async fn nonzero_status_leaves_connection_reusable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 256];
            let _ = stream.read(&mut buf).await.unwrap();
            stream.write_u8(1).await.unwrap();
        });

        let pool = Pool::new(PoolConfig {
            host: addr.ip().to_string(),
            port: addr.port(),
            ..Default::default()
        });
        let mut conn = pool.acquire().await.unwrap();
        let err = put(&mut conn, b"k", b"v").await.unwrap_err();
        assert!(matches!(err, ClientError::Server(_)));
        server.await.unwrap();

        drop(conn);
        assert_eq!(pool.idle_len(), 1);
    }

    #[tokio::test]
    async fn misc_nonzero_result_code_leaves_connection_reusable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 256];
            let _ = stream.read(&mut buf).await.unwrap();
            // result_code = 1, n_items = 0
            stream.write_all(&[0, 0, 0, 1, 0, 0, 0, 0]).await.unwrap();
        });

        let pool = Pool::new(PoolConfig {
            host: addr.ip().to_string(),
            port: addr.port(),
            ..Default::default()
        });
        let mut conn = pool.acquire().await.unwrap();
        let err = optimize(&mut conn).await.unwrap_err();
        assert!(matches!(err, ClientError::Server(_)));
        server.await.unwrap();

        drop(conn);
        assert_eq!(pool.idle_len(), 1);
    }
}
