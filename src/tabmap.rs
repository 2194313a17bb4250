//! The in-value "list" and "map" (TabMap) byte formats used by server-side
//! scripts and by the `table` codec.
//!
//! Both formats are varint-length-prefixed concatenations of byte strings;
//! the varint itself is the same unsigned LEB128-style 7-bit-group encoding
//! used elsewhere in this family of wire protocols, just applied to an
//! in-memory buffer instead of a socket.

use crate::error::{ClientError, Result};

fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
}

fn read_varint(buf: &[u8], pos: &mut usize) -> Result<u64> {
    let mut out = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = *buf.get(*pos).ok_or_else(|| {
            ClientError::Protocol("truncated varint in list/map value".to_string())
        })?;
        *pos += 1;
        out |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    Ok(out)
}

/// Serializes a list of byte strings as `(varint length, bytes)*`.
///
/// `serialize_list(["foo","baze","nugget","bar"]) == b"\x03foo\x04baze\x06nugget\x03bar"`
pub fn serialize_list<I, B>(items: I) -> Vec<u8>
where
    I: IntoIterator<Item = B>,
    B: AsRef<[u8]>,
{
    let mut out = Vec::new();
    for item in items {
        let item = item.as_ref();
        write_varint(&mut out, item.len() as u64);
        out.extend_from_slice(item);
    }
    out
}

/// Inverse of [`serialize_list`]. An empty buffer decodes to an empty list.
pub fn deserialize_list(buf: &[u8]) -> Result<Vec<Vec<u8>>> {
    let mut pos = 0;
    let mut out = Vec::new();
    while pos < buf.len() {
        let len = read_varint(buf, &mut pos)? as usize;
        let end = pos + len;
        let item = buf
            .get(pos..end)
            .ok_or_else(|| ClientError::Protocol("truncated list item".to_string()))?
            .to_vec();
        out.push(item);
        pos = end;
    }
    Ok(out)
}

/// Serializes a map of byte strings as `(varint klen, varint vlen, key, value)*`.
///
/// `serialize_map({"foo": "baze"}) == b"\x03\x04foobaze"`
pub fn serialize_map<I, K, V>(entries: I) -> Vec<u8>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<[u8]>,
    V: AsRef<[u8]>,
{
    let mut out = Vec::new();
    for (key, value) in entries {
        let (key, value) = (key.as_ref(), value.as_ref());
        write_varint(&mut out, key.len() as u64);
        write_varint(&mut out, value.len() as u64);
        out.extend_from_slice(key);
        out.extend_from_slice(value);
    }
    out
}

/// Inverse of [`serialize_map`]. An empty buffer decodes to an empty map.
/// Preserves insertion order since duplicate keys are a server-side
/// consideration this crate does not normalize (see DESIGN.md).
pub fn deserialize_map(buf: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut pos = 0;
    let mut out = Vec::new();
    while pos < buf.len() {
        let klen = read_varint(buf, &mut pos)? as usize;
        let vlen = read_varint(buf, &mut pos)? as usize;
        let kend = pos + klen;
        let key = buf
            .get(pos..kend)
            .ok_or_else(|| ClientError::Protocol("truncated map key".to_string()))?
            .to_vec();
        pos = kend;
        let vend = pos + vlen;
        let value = buf
            .get(pos..vend)
            .ok_or_else(|| ClientError::Protocol("truncated map value".to_string()))?
            .to_vec();
        pos = vend;
        out.push((key, value));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_map_roundtrip() {
        assert_eq!(serialize_map::<_, &str, &str>(vec![]), b"");
        assert_eq!(deserialize_map(b"").unwrap(), vec![]);
    }

    #[test]
    fn literal_map_vector() {
        let encoded = serialize_map(vec![("foo", "baze")]);
        assert_eq!(encoded, b"\x03\x04foobaze");
        assert_eq!(
            deserialize_map(&encoded).unwrap(),
            vec![(b"foo".to_vec(), b"baze".to_vec())]
        );
    }

    #[test]
    fn literal_list_vectors() {
        let encoded = serialize_list(["foo", "baze", "nugget", "bar"]);
        assert_eq!(encoded, b"\x03foo\x04baze\x06nugget\x03bar");
        assert_eq!(
            deserialize_list(&encoded).unwrap(),
            vec![
                b"foo".to_vec(),
                b"baze".to_vec(),
                b"nugget".to_vec(),
                b"bar".to_vec()
            ]
        );

        let encoded = serialize_list(["", "foo", ""]);
        assert_eq!(encoded, b"\x00\x03foo\x00");
        assert_eq!(
            deserialize_list(&encoded).unwrap(),
            vec![b"".to_vec(), b"foo".to_vec(), b"".to_vec()]
        );
    }

    #[test]
    fn list_roundtrip_arbitrary() {
        let items: Vec<Vec<u8>> = vec![
            b"".to_vec(),
            b"a".to_vec(),
            vec![0u8; 200],
            b"last".to_vec(),
        ];
        let encoded = serialize_list(items.clone());
        assert_eq!(deserialize_list(&encoded).unwrap(), items);
    }

    #[test]
    fn map_roundtrip_arbitrary() {
        let entries: Vec<(Vec<u8>, Vec<u8>)> = vec![
            (b"k1".to_vec(), b"v1".to_vec()),
            (b"".to_vec(), b"empty-key".to_vec()),
            (b"empty-value".to_vec(), b"".to_vec()),
        ];
        let encoded = serialize_map(entries.clone());
        assert_eq!(deserialize_map(&encoded).unwrap(), entries);
    }

    #[test]
    fn truncated_varint_is_protocol_error() {
        assert!(deserialize_list(&[0x80]).is_err());
    }
}
