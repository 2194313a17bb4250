//! Async client for the Kyoto Tycoon and Tokyo Tyrant key-value servers,
//! speaking their native binary and HTTP/TSV RPC protocols.

mod client;
mod codec;
mod connection;
mod error;
mod http;
mod io;
mod pool;
mod protocol_a;
mod protocol_b;
mod query;
mod tabmap;
mod value;

pub use client::{Client, ClientConfig, ServerKind};
pub use codec::Codec;
pub use error::{ClientError, Result};
pub use http::{Cursor, Outcome, TsvMap};
pub use pool::{Pool, PoolConfig, PooledConnection};
pub use protocol_a::Record;
pub use query::QueryBuilder;
pub use value::Value;

pub mod binary {
    pub use crate::protocol_a::{
        open_replication, script, set_bulk_no_reply, OP_ERROR, OP_REPLICATION, OP_SCRIPT, OP_SET_BULK,
    };
    pub use crate::protocol_b::{
        addint, adddouble, cacheclear, copy, ext, fwmkeys, get, getlist, iterinit, iternext, mget, misc,
        optimize, optindex, out, outindex, outlist, put, putcat, putkeep, putlist, putnr, putshl, range,
        regex, restore, rnum, search, setindex, setmst, size, stat, sync, vanish, vsiz, EXT_LOCK_ALL,
        EXT_LOCK_RECORDS, MAGIC, OP_COPY,
    };
}

/// TabMap/List in-value encodings (§4.5), for callers that store structured
/// values directly rather than through [`Codec::Table`].
pub mod formats {
    pub use crate::tabmap::{deserialize_list, deserialize_map, serialize_list, serialize_map};
}
