//! Field-level binary encodings shared by the row codec. These encodings
//! are *not* order-preserving (rows are never compared as bytes); the
//! order-preserving forms used inside index keys live in `index`.

use super::{Error, Result};
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use models::{FieldType, Value};

/// Encode a non-null value of a fixed-width type into `buf`.
/// Callers guarantee `value.fits(field_type)` and `field_type.is_fixed()`.
pub fn encode_fixed(buf: &mut Vec<u8>, value: &Value, field_type: &FieldType) {
    match (value, field_type) {
        (Value::Bool(b), FieldType::Bool) => buf.push(*b as u8),
        (Value::Int(i), FieldType::Int64) => buf.write_i64::<BigEndian>(*i).unwrap(),
        (Value::Timestamp(t), FieldType::Timestamp) => buf.write_i64::<BigEndian>(*t).unwrap(),
        (Value::Float(f), FieldType::Double) => buf.write_u64::<BigEndian>(f.to_bits()).unwrap(),
        (Value::Date(d), FieldType::Date) => encode_date(buf, d),
        (Value::DateTime(dt), FieldType::DateTime) => {
            encode_date(buf, &dt.date());
            let t = dt.time();
            buf.push(t.hour() as u8);
            buf.push(t.minute() as u8);
            buf.push(t.second() as u8);
            buf.push(0);
            buf.write_u32::<BigEndian>(t.nanosecond() / 1_000).unwrap();
        }
        _ => unreachable!("caller checked value type and fixedness"),
    }
}

fn encode_date(buf: &mut Vec<u8>, d: &NaiveDate) {
    buf.write_i16::<BigEndian>(d.year() as i16).unwrap();
    buf.push(d.month() as u8);
    buf.push(d.day() as u8);
}

pub fn decode_fixed(buf: &[u8], field_type: &FieldType) -> Result<Value> {
    let want = field_type.fixed_width();
    if buf.len() < want {
        return Err(Error::BadRow("fixed field extends past row end"));
    }
    Ok(match field_type {
        FieldType::Bool => Value::Bool(buf[0] != 0),
        FieldType::Int64 => Value::Int(BigEndian::read_i64(buf)),
        FieldType::Timestamp => Value::Timestamp(BigEndian::read_i64(buf)),
        FieldType::Double => Value::Float(f64::from_bits(BigEndian::read_u64(buf))),
        FieldType::Date => Value::Date(decode_date(buf)?),
        FieldType::DateTime => {
            let date = decode_date(buf)?;
            let micros = BigEndian::read_u32(&buf[8..12]);
            let time =
                NaiveTime::from_hms_micro_opt(buf[4] as u32, buf[5] as u32, buf[6] as u32, micros)
                    .ok_or(Error::BadRow("datetime field out of range"))?;
            Value::DateTime(NaiveDateTime::new(date, time))
        }
        FieldType::String | FieldType::List(_) | FieldType::Map(_) => {
            unreachable!("caller checked fixedness")
        }
    })
}

fn decode_date(buf: &[u8]) -> Result<NaiveDate> {
    let year = BigEndian::read_i16(buf) as i32;
    NaiveDate::from_ymd_opt(year, buf[2] as u32, buf[3] as u32)
        .ok_or(Error::BadRow("date field out of range"))
}

/// Encode a non-null value of a variable-width type.
pub fn encode_var(buf: &mut Vec<u8>, value: &Value, field_type: &FieldType) {
    match (value, field_type) {
        (Value::Str(s), FieldType::String) => buf.extend_from_slice(s.as_bytes()),
        (Value::List(items), FieldType::List(inner)) => {
            buf.write_u32::<BigEndian>(items.len() as u32).unwrap();
            for item in items {
                encode_element(buf, item, inner);
            }
        }
        (Value::Map(entries), FieldType::Map(inner)) => {
            buf.write_u32::<BigEndian>(entries.len() as u32).unwrap();
            for (key, item) in entries {
                buf.write_u32::<BigEndian>(key.len() as u32).unwrap();
                buf.extend_from_slice(key.as_bytes());
                encode_element(buf, item, inner);
            }
        }
        _ => unreachable!("caller checked value type and fixedness"),
    }
}

// Elements nest arbitrarily (list<list<int>>), so each carries a null flag
// and, for variable-width element types, a length prefix.
fn encode_element(buf: &mut Vec<u8>, value: &Value, field_type: &FieldType) {
    if value.is_null() {
        buf.push(0);
        return;
    }
    buf.push(1);
    if field_type.is_fixed() {
        encode_fixed(buf, value, field_type);
    } else {
        let mut inner = Vec::new();
        encode_var(&mut inner, value, field_type);
        buf.write_u32::<BigEndian>(inner.len() as u32).unwrap();
        buf.extend_from_slice(&inner);
    }
}

pub fn decode_var(buf: &[u8], field_type: &FieldType) -> Result<Value> {
    match field_type {
        FieldType::String => Ok(Value::Str(
            String::from_utf8(buf.to_vec()).map_err(|_| Error::BadRow("string is not utf-8"))?,
        )),
        FieldType::List(inner) => {
            let mut cursor = check_len(buf, 4)?;
            let count = BigEndian::read_u32(buf) as usize;
            let mut items = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                let (item, rest) = decode_element(cursor, inner)?;
                items.push(item);
                cursor = rest;
            }
            Ok(Value::List(items))
        }
        FieldType::Map(inner) => {
            let mut cursor = check_len(buf, 4)?;
            let count = BigEndian::read_u32(buf) as usize;
            let mut entries = std::collections::BTreeMap::new();
            for _ in 0..count {
                let rest = check_len(cursor, 4)?;
                let key_len = BigEndian::read_u32(cursor) as usize;
                let rest2 = check_len(rest, key_len)?;
                let key = String::from_utf8(rest[..key_len].to_vec())
                    .map_err(|_| Error::BadRow("map key is not utf-8"))?;
                let (item, rest3) = decode_element(rest2, inner)?;
                entries.insert(key, item);
                cursor = rest3;
            }
            Ok(Value::Map(entries))
        }
        _ => unreachable!("caller checked fixedness"),
    }
}

fn decode_element<'b>(buf: &'b [u8], field_type: &FieldType) -> Result<(Value, &'b [u8])> {
    let rest = check_len(buf, 1)?;
    if buf[0] == 0 {
        return Ok((Value::Null, rest));
    }
    if field_type.is_fixed() {
        let width = field_type.fixed_width();
        let value = decode_fixed(rest, field_type)?;
        Ok((value, check_len(rest, width)?))
    } else {
        let rest2 = check_len(rest, 4)?;
        let len = BigEndian::read_u32(rest) as usize;
        let rest3 = check_len(rest2, len)?;
        let value = decode_var(&rest2[..len], field_type)?;
        Ok((value, rest3))
    }
}

fn check_len(buf: &[u8], want: usize) -> Result<&[u8]> {
    if buf.len() < want {
        return Err(Error::BadRow("value extends past row end"));
    }
    Ok(&buf[want..])
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_fixed_round_trip() {
        let cases = vec![
            (Value::Bool(true), FieldType::Bool),
            (Value::Int(-42), FieldType::Int64),
            (Value::Float(3.25), FieldType::Double),
            (Value::Timestamp(1_700_000_000), FieldType::Timestamp),
            (
                Value::Date(NaiveDate::from_ymd_opt(2024, 2, 29).unwrap()),
                FieldType::Date,
            ),
            (
                Value::DateTime(
                    NaiveDate::from_ymd_opt(2024, 2, 29)
                        .unwrap()
                        .and_hms_micro_opt(13, 14, 15, 161_718)
                        .unwrap(),
                ),
                FieldType::DateTime,
            ),
        ];

        for (value, field_type) in cases {
            let mut buf = Vec::new();
            encode_fixed(&mut buf, &value, &field_type);
            assert_eq!(buf.len(), field_type.fixed_width());
            assert_eq!(decode_fixed(&buf, &field_type).unwrap(), value);
        }
    }

    #[test]
    fn test_nested_var_round_trip() {
        let field_type = FieldType::List(Box::new(FieldType::List(Box::new(FieldType::Int64))));
        let value = Value::List(vec![
            Value::List(vec![Value::Int(1), Value::Null, Value::Int(3)]),
            Value::Null,
            Value::List(vec![]),
        ]);

        let mut buf = Vec::new();
        encode_var(&mut buf, &value, &field_type);
        assert_eq!(decode_var(&buf, &field_type).unwrap(), value);
    }

    #[test]
    fn test_map_round_trip() {
        let field_type = FieldType::Map(Box::new(FieldType::String));
        let value = Value::Map(
            [
                ("a".to_string(), Value::Str("x".to_string())),
                ("b".to_string(), Value::Null),
            ]
            .into_iter()
            .collect(),
        );

        let mut buf = Vec::new();
        encode_var(&mut buf, &value, &field_type);
        assert_eq!(decode_var(&buf, &field_type).unwrap(), value);
    }

    #[test]
    fn test_truncated_input_is_an_error() {
        let field_type = FieldType::List(Box::new(FieldType::Int64));
        let value = Value::List(vec![Value::Int(7)]);

        let mut buf = Vec::new();
        encode_var(&mut buf, &value, &field_type);
        assert!(decode_var(&buf[..buf.len() - 1], &field_type).is_err());
    }
}
