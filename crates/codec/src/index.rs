//! Secondary-index key encoding.
//!
//! An index key is the *value*: the payload under it is empty, and a scan
//! of the key range yields the matching data keys. Layout:
//!
//! ```text
//! packed(4, type=Index) || indexId(4) || encoded-values || nullable-bitmap(2)
//!     || suffix-length-table || vertexId            (tag index)
//!     || suffix-length-table || srcId || ranking || dstId   (edge index)
//! ```
//!
//! Per-column encodings are order-preserving so that lexicographic byte
//! comparison of two index keys equals comparison of their column tuples:
//! sign-flipped big-endian integers, IEEE-754 doubles with the sign bit
//! flipped for positives and all bits flipped for negatives, and strings
//! padded to the index's declared length. The suffix-length table records
//! each string column's true (pre-padding) length, distinguishing a string
//! that ended early from one padded with equal bytes.

use super::keys::{read_i64_ord, write_i64_ord, PACKED_PREFIX_LEN};
use super::{Error, Result};
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use chrono::{Datelike, Timelike};
use models::{
    EdgeRanking, FieldType, IndexDef, IndexId, PartitionId, Schema, Value, VertexId,
};

/// An index encodes at most 16 columns; the nullable bitmap is 16 bits.
pub const MAX_INDEX_COLUMNS: usize = 16;

const INDEX_TYPE_TAG: u8 = 0x03;

fn packed(part: PartitionId) -> [u8; 4] {
    let mut out = [0u8; 4];
    BigEndian::write_u32(&mut out, ((part as u32) << 8) | INDEX_TYPE_TAG as u32);
    out
}

/// Prefix of every entry of one index within a partition.
pub fn index_prefix(part: PartitionId, index_id: IndexId) -> Vec<u8> {
    let mut key = Vec::with_capacity(PACKED_PREFIX_LEN + 4);
    key.extend_from_slice(&packed(part));
    let mut b = [0u8; 4];
    BigEndian::write_u32(&mut b, (index_id as u32) ^ 0x8000_0000);
    key.extend_from_slice(&b);
    key
}

/// Order-preserving encoding of one non-null column value.
/// `string_len` is the index's declared length for string columns and is
/// ignored for other types.
pub fn encode_single(
    buf: &mut Vec<u8>,
    value: &Value,
    field_type: &FieldType,
    string_len: usize,
) -> Result<u16> {
    if !value.fits(field_type) {
        return Err(Error::WrongType {
            field: String::new(),
            expected: field_type.clone(),
        });
    }
    match (value, field_type) {
        (Value::Bool(b), FieldType::Bool) => buf.push(*b as u8),
        (Value::Int(i), FieldType::Int64) | (Value::Timestamp(i), FieldType::Timestamp) => {
            buf.write_u64::<BigEndian>((*i as u64) ^ 0x8000_0000_0000_0000)
                .unwrap();
        }
        (Value::Float(f), FieldType::Double) => {
            let bits = f.to_bits();
            let ordered = if bits & 0x8000_0000_0000_0000 == 0 {
                bits ^ 0x8000_0000_0000_0000
            } else {
                !bits
            };
            buf.write_u64::<BigEndian>(ordered).unwrap();
        }
        (Value::Str(s), FieldType::String) => {
            let keep = s.len().min(string_len);
            buf.extend_from_slice(&s.as_bytes()[..keep]);
            buf.extend(std::iter::repeat(0u8).take(string_len - keep));
            return Ok(keep as u16);
        }
        (Value::Date(d), FieldType::Date) => {
            buf.write_u16::<BigEndian>((d.year() as i16 as u16) ^ 0x8000)
                .unwrap();
            buf.push(d.month() as u8);
            buf.push(d.day() as u8);
        }
        (Value::DateTime(dt), FieldType::DateTime) => {
            buf.write_u16::<BigEndian>((dt.year() as i16 as u16) ^ 0x8000)
                .unwrap();
            buf.push(dt.month() as u8);
            buf.push(dt.day() as u8);
            buf.push(dt.hour() as u8);
            buf.push(dt.minute() as u8);
            buf.push(dt.second() as u8);
            buf.push(0);
            buf.write_u32::<BigEndian>(dt.nanosecond() / 1_000).unwrap();
        }
        _ => {
            return Err(Error::WrongType {
                field: String::new(),
                expected: field_type.clone(),
            })
        }
    }
    Ok(0)
}

fn encoded_width(field_type: &FieldType, string_len: usize) -> Result<usize> {
    Ok(match field_type {
        FieldType::Bool => 1,
        FieldType::Int64 | FieldType::Timestamp | FieldType::Double => 8,
        FieldType::Date => 4,
        FieldType::DateTime => 12,
        FieldType::String => string_len,
        FieldType::List(_) | FieldType::Map(_) => {
            return Err(Error::WrongType {
                field: String::new(),
                expected: field_type.clone(),
            })
        }
    })
}

/// Encode the column-value segment of an index key:
/// `encoded-values || nullable-bitmap(2) || suffix-length-table`.
/// `values` parallels `index.fields`; columns resolve their types against
/// `schema` (the newest version of the indexed tag or edge).
pub fn encode_values(index: &IndexDef, schema: &Schema, values: &[Value]) -> Result<Vec<u8>> {
    if index.fields.len() > MAX_INDEX_COLUMNS || values.len() != index.fields.len() {
        return Err(Error::BadRow("index column count out of range"));
    }

    let mut out = Vec::with_capacity(64);
    let mut bitmap = 0u16;
    let mut suffix_lens: Vec<u16> = Vec::new();

    for (column, (name, value)) in index.fields.iter().zip(values.iter()).enumerate() {
        let (_, field) = schema.field(name).ok_or_else(|| Error::MissingField {
            field: name.clone(),
        })?;
        let string_len = index.string_lens.get(name).copied().unwrap_or(0);

        if value.is_null() {
            // Placeholder of the column's full width; the bitmap bit is the
            // authoritative null marker.
            bitmap |= 0x8000 >> column;
            let width = encoded_width(&field.field_type, string_len)?;
            out.extend(std::iter::repeat(0u8).take(width));
            if matches!(field.field_type, FieldType::String) {
                suffix_lens.push(0);
            }
        } else {
            let suffix = encode_single(&mut out, value, &field.field_type, string_len)
                .map_err(|err| match err {
                    Error::WrongType { expected, .. } => Error::WrongType {
                        field: name.clone(),
                        expected,
                    },
                    err => err,
                })?;
            if matches!(field.field_type, FieldType::String) {
                suffix_lens.push(suffix);
            }
        }
    }

    out.write_u16::<BigEndian>(bitmap).unwrap();
    for len in suffix_lens {
        out.write_u16::<BigEndian>(len).unwrap();
    }
    Ok(out)
}

/// `packed || indexId || values-segment || vertexId`
pub fn tag_index_key(
    part: PartitionId,
    index_id: IndexId,
    values_segment: &[u8],
    vid: &VertexId,
    vid_len: usize,
) -> Result<Vec<u8>> {
    let mut key = index_prefix(part, index_id);
    key.extend_from_slice(values_segment);
    key.extend_from_slice(&vid.padded(vid_len)?);
    Ok(key)
}

/// `packed || indexId || values-segment || srcId || ranking || dstId`
pub fn edge_index_key(
    part: PartitionId,
    index_id: IndexId,
    values_segment: &[u8],
    src: &VertexId,
    ranking: EdgeRanking,
    dst: &VertexId,
    vid_len: usize,
) -> Result<Vec<u8>> {
    let mut key = index_prefix(part, index_id);
    key.extend_from_slice(values_segment);
    key.extend_from_slice(&src.padded(vid_len)?);
    write_i64_ord(&mut key, ranking);
    key.extend_from_slice(&dst.padded(vid_len)?);
    Ok(key)
}

/// Recover the vertex id from a tag index key.
pub fn tag_index_vid(key: &[u8], vid_len: usize) -> Result<VertexId> {
    if key.len() < PACKED_PREFIX_LEN + 4 + 2 + vid_len {
        return Err(Error::InvalidKey {
            expected: "tag index",
            len: key.len(),
        });
    }
    Ok(VertexId::from(&key[key.len() - vid_len..]))
}

/// Recover (src, ranking, dst) from an edge index key.
pub fn edge_index_tail(key: &[u8], vid_len: usize) -> Result<(VertexId, EdgeRanking, VertexId)> {
    let tail_len = vid_len + 8 + vid_len;
    if key.len() < PACKED_PREFIX_LEN + 4 + 2 + tail_len {
        return Err(Error::InvalidKey {
            expected: "edge index",
            len: key.len(),
        });
    }
    let at = key.len() - tail_len;
    let src = VertexId::from(&key[at..at + vid_len]);
    let ranking = read_i64_ord(&key[at + vid_len..at + vid_len + 8]);
    let dst = VertexId::from(&key[at + vid_len + 8..]);
    Ok((src, ranking, dst))
}

#[cfg(test)]
mod test {
    use super::*;
    use models::FieldDef;

    fn schema() -> Schema {
        Schema::new(
            0,
            vec![
                FieldDef::new("age", FieldType::Int64),
                FieldDef::new("name", FieldType::String).nullable(),
                FieldDef::new("score", FieldType::Double).nullable(),
            ],
        )
    }

    fn index() -> IndexDef {
        IndexDef {
            index_id: 9,
            schema_id: 1,
            is_edge: false,
            fields: vec!["age".to_string(), "name".to_string(), "score".to_string()],
            string_lens: [("name".to_string(), 8)].into_iter().collect(),
            unique: false,
        }
    }

    fn seg(age: i64, name: Option<&str>, score: Option<f64>) -> Vec<u8> {
        let values = vec![
            Value::Int(age),
            name.map_or(Value::Null, |s| Value::Str(s.to_string())),
            score.map_or(Value::Null, Value::Float),
        ];
        encode_values(&index(), &schema(), &values).unwrap()
    }

    #[test]
    fn test_int_order_is_preserved() {
        let mut keys: Vec<_> = [-10i64, -1, 0, 1, 10, i64::MAX, i64::MIN]
            .iter()
            .map(|age| seg(*age, Some("x"), Some(0.0)))
            .collect();
        keys.sort();

        let decoded_order: Vec<i64> = keys
            .iter()
            .map(|k| (BigEndian::read_u64(k) ^ 0x8000_0000_0000_0000) as i64)
            .collect();
        assert_eq!(decoded_order, vec![i64::MIN, -10, -1, 0, 1, 10, i64::MAX]);
    }

    #[test]
    fn test_double_order_is_preserved() {
        let floats = [-1e300, -2.5, -0.0, 0.0, 1e-9, 2.5, 1e300];
        let mut encoded: Vec<(Vec<u8>, f64)> = floats
            .iter()
            .map(|f| {
                let mut buf = Vec::new();
                encode_single(&mut buf, &Value::Float(*f), &FieldType::Double, 0).unwrap();
                (buf, *f)
            })
            .collect();
        encoded.sort_by(|a, b| a.0.cmp(&b.0));

        let order: Vec<f64> = encoded.iter().map(|(_, f)| *f).collect();
        assert_eq!(order, vec![-1e300, -2.5, -0.0, 0.0, 1e-9, 2.5, 1e300]);
    }

    #[test]
    fn test_string_padding_and_suffix_table() {
        // "ab" padded with NULs must sort before "ab\0x": the suffix table
        // disambiguates them but only after all value bytes, preserving
        // prefix-scan semantics.
        let short = seg(1, Some("ab"), Some(0.0));
        let longer = seg(1, Some("ab\0x"), Some(0.0));
        assert_ne!(short, longer);
        assert!(short < longer);

        // Over-length strings are truncated to the declared length.
        let a = seg(1, Some("abcdefgh-tail-1"), Some(0.0));
        let b = seg(1, Some("abcdefgh-tail-2"), Some(0.0));
        assert_eq!(a, b);
    }

    #[test]
    fn test_null_bitmap() {
        let with_name = seg(1, Some(""), Some(0.0));
        let null_name = seg(1, None, Some(0.0));
        // Same value bytes (empty string pads to the same placeholder),
        // distinguished by the bitmap.
        assert_ne!(with_name, null_name);

        let null_bits_at = 8 + 8; // int64 + padded string.
        assert_eq!(BigEndian::read_u16(&null_name[null_bits_at + 8..]), 0x4000);
        assert_eq!(BigEndian::read_u16(&with_name[null_bits_at + 8..]), 0x0000);
    }

    #[test]
    fn test_tag_index_key_tail() {
        let segment = seg(25, Some("alice"), Some(9.5));
        let key = tag_index_key(2, 9, &segment, &VertexId::from("v1"), 8).unwrap();
        assert!(key.starts_with(&index_prefix(2, 9)));
        assert_eq!(tag_index_vid(&key, 8).unwrap(), VertexId::from(&b"v1\0\0\0\0\0\0"[..]));
    }

    #[test]
    fn test_edge_index_key_tail() {
        let segment = seg(25, Some("alice"), Some(9.5));
        let key = edge_index_key(
            2,
            9,
            &segment,
            &VertexId::from("src"),
            -4,
            &VertexId::from("dst"),
            8,
        )
        .unwrap();

        let (src, ranking, dst) = edge_index_tail(&key, 8).unwrap();
        assert_eq!(src, VertexId::from(&b"src\0\0\0\0\0"[..]));
        assert_eq!(ranking, -4);
        assert_eq!(dst, VertexId::from(&b"dst\0\0\0\0\0"[..]));
    }

    #[test]
    fn test_unindexable_types_are_rejected() {
        let mut buf = Vec::new();
        let err = encode_single(
            &mut buf,
            &Value::List(vec![]),
            &FieldType::List(Box::new(FieldType::Int64)),
            0,
        )
        .unwrap_err();
        assert!(matches!(err, Error::WrongType { .. }));
    }
}
