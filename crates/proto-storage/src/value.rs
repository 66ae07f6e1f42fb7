//! Property values on the wire, and conversions to and from the in-memory
//! `models::Value`.

use chrono::{Datelike, Timelike};

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WireValue {
    #[prost(oneof = "wire_value::Kind", tags = "1, 2, 3, 4, 5, 6, 7, 8, 9")]
    pub kind: Option<wire_value::Kind>,
}

pub mod wire_value {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Kind {
        #[prost(bool, tag = "1")]
        Bool(bool),
        #[prost(int64, tag = "2")]
        Int(i64),
        #[prost(double, tag = "3")]
        Float(f64),
        #[prost(string, tag = "4")]
        Str(String),
        #[prost(message, tag = "5")]
        Date(super::WireDate),
        #[prost(message, tag = "6")]
        DateTime(super::WireDateTime),
        #[prost(int64, tag = "7")]
        Timestamp(i64),
        #[prost(message, tag = "8")]
        List(super::WireList),
        #[prost(message, tag = "9")]
        Map(super::WireMap),
    }
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct WireDate {
    #[prost(int32, tag = "1")]
    pub year: i32,
    #[prost(uint32, tag = "2")]
    pub month: u32,
    #[prost(uint32, tag = "3")]
    pub day: u32,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct WireDateTime {
    #[prost(message, optional, tag = "1")]
    pub date: Option<WireDate>,
    #[prost(uint32, tag = "2")]
    pub hour: u32,
    #[prost(uint32, tag = "3")]
    pub minute: u32,
    #[prost(uint32, tag = "4")]
    pub second: u32,
    #[prost(uint32, tag = "5")]
    pub microsecond: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WireList {
    #[prost(message, repeated, tag = "1")]
    pub items: Vec<WireValue>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WireMap {
    #[prost(btree_map = "string, message", tag = "1")]
    pub entries: std::collections::BTreeMap<String, WireValue>,
}

#[derive(Debug, thiserror::Error)]
pub enum WireValueError {
    #[error("date or datetime value is out of range")]
    OutOfRange,
}

/// Lower an in-memory value onto the wire. An absent `kind` is null.
pub fn value_to_wire(value: &models::Value) -> WireValue {
    use models::Value;
    use wire_value::Kind;

    let kind = match value {
        Value::Null => None,
        Value::Bool(b) => Some(Kind::Bool(*b)),
        Value::Int(i) => Some(Kind::Int(*i)),
        Value::Float(f) => Some(Kind::Float(*f)),
        Value::Str(s) => Some(Kind::Str(s.clone())),
        Value::Timestamp(t) => Some(Kind::Timestamp(*t)),
        Value::Date(d) => Some(Kind::Date(WireDate {
            year: d.year(),
            month: d.month(),
            day: d.day(),
        })),
        Value::DateTime(dt) => Some(Kind::DateTime(WireDateTime {
            date: Some(WireDate {
                year: dt.year(),
                month: dt.month(),
                day: dt.day(),
            }),
            hour: dt.hour(),
            minute: dt.minute(),
            second: dt.second(),
            microsecond: dt.nanosecond() / 1_000,
        })),
        Value::List(items) => Some(Kind::List(WireList {
            items: items.iter().map(value_to_wire).collect(),
        })),
        Value::Map(entries) => Some(Kind::Map(WireMap {
            entries: entries
                .iter()
                .map(|(k, v)| (k.clone(), value_to_wire(v)))
                .collect(),
        })),
    };
    WireValue { kind }
}

/// Raise a wire value into memory.
pub fn value_from_wire(value: &WireValue) -> Result<models::Value, WireValueError> {
    use models::Value;
    use wire_value::Kind;

    let Some(kind) = &value.kind else {
        return Ok(Value::Null);
    };
    Ok(match kind {
        Kind::Bool(b) => Value::Bool(*b),
        Kind::Int(i) => Value::Int(*i),
        Kind::Float(f) => Value::Float(*f),
        Kind::Str(s) => Value::Str(s.clone()),
        Kind::Timestamp(t) => Value::Timestamp(*t),
        Kind::Date(d) => Value::Date(date_from_wire(d)?),
        Kind::DateTime(dt) => {
            let date = date_from_wire(&dt.date.unwrap_or_default())?;
            let time = chrono::NaiveTime::from_hms_micro_opt(
                dt.hour,
                dt.minute,
                dt.second,
                dt.microsecond,
            )
            .ok_or(WireValueError::OutOfRange)?;
            Value::DateTime(chrono::NaiveDateTime::new(date, time))
        }
        Kind::List(list) => Value::List(
            list.items
                .iter()
                .map(value_from_wire)
                .collect::<Result<_, _>>()?,
        ),
        Kind::Map(map) => Value::Map(
            map.entries
                .iter()
                .map(|(k, v)| Ok((k.clone(), value_from_wire(v)?)))
                .collect::<Result<_, _>>()?,
        ),
    })
}

fn date_from_wire(d: &WireDate) -> Result<chrono::NaiveDate, WireValueError> {
    chrono::NaiveDate::from_ymd_opt(d.year, d.month, d.day).ok_or(WireValueError::OutOfRange)
}

#[cfg(test)]
mod test {
    use super::*;
    use models::Value;
    use prost::Message;

    #[test]
    fn test_value_round_trip() {
        let values = vec![
            Value::Null,
            Value::Bool(true),
            Value::Int(-5),
            Value::Float(2.5),
            Value::Str("hi".to_string()),
            Value::Timestamp(1_700_000_000),
            Value::Date(chrono::NaiveDate::from_ymd_opt(2024, 12, 31).unwrap()),
            Value::List(vec![Value::Int(1), Value::Null]),
            Value::Map(
                [("k".to_string(), Value::Str("v".to_string()))]
                    .into_iter()
                    .collect(),
            ),
        ];

        for value in values {
            let wire = value_to_wire(&value);
            let bytes = wire.encode_to_vec();
            let decoded = WireValue::decode(bytes.as_slice()).unwrap();
            assert_eq!(value_from_wire(&decoded).unwrap(), value);
        }
    }
}
