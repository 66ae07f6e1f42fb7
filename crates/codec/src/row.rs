//! Self-describing row encoding.
//!
//! Layout:
//!
//! ```text
//! flags(1) || schemaVer(8) || null-bitmap(ceil(N/8)) || fixed-region || var-tail [|| writeTs(8)]
//! ```
//!
//! The header carries the *writer* schema version; readers resolve that
//! version through the schema cache and decode with it. Fixed-width fields
//! occupy their declared width in schema order; variable-width fields
//! (strings, lists, maps) occupy an 8-byte (offset, length) slot pointing
//! into the tail. A set bit in the null bitmap marks a field as absent or
//! explicitly null; such fields materialize their schema-declared default
//! on read.

use super::value::{decode_fixed, decode_var, encode_fixed, encode_var};
use super::{Error, Result};
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use models::{Schema, SchemaVer, Value};

// Header flag bits.
const FLAG_HAS_WRITE_TS: u8 = 0x01;

const HEADER_LEN: usize = 1 + 8;

/// Builds an encoded row under a schema.
#[derive(Debug)]
pub struct RowWriter<'s> {
    schema: &'s Schema,
    values: Vec<Option<Value>>,
    write_ts: Option<i64>,
}

impl<'s> RowWriter<'s> {
    pub fn new(schema: &'s Schema) -> Self {
        Self {
            schema,
            values: vec![None; schema.num_fields()],
            write_ts: None,
        }
    }

    /// Set a field by name. The value must inhabit the field's type.
    pub fn set(&mut self, name: &str, value: Value) -> Result<&mut Self> {
        let (index, _) = self.schema.field(name).ok_or_else(|| Error::MissingField {
            field: name.to_string(),
        })?;
        self.set_at(index, value)
    }

    /// Set a field by its schema ordinal.
    pub fn set_at(&mut self, index: usize, value: Value) -> Result<&mut Self> {
        let field = &self.schema.fields[index];
        if !value.fits(&field.field_type) {
            return Err(Error::WrongType {
                field: field.name.clone(),
                expected: field.field_type.clone(),
            });
        }
        self.values[index] = Some(value);
        Ok(self)
    }

    /// Stamp the row with its write time, used for TTL evaluation.
    pub fn set_write_ts(&mut self, ts: i64) -> &mut Self {
        self.write_ts = Some(ts);
        self
    }

    pub fn finish(self) -> Result<Vec<u8>> {
        let schema = self.schema;
        let bitmap_len = (schema.num_fields() + 7) / 8;
        let fixed_at = HEADER_LEN + bitmap_len;
        let fixed_len = schema.fixed_len();

        let mut row = Vec::with_capacity(fixed_at + fixed_len + 16);
        row.push(if self.write_ts.is_some() {
            FLAG_HAS_WRITE_TS
        } else {
            0
        });
        row.write_i64::<BigEndian>(schema.ver).unwrap();
        row.resize(fixed_at + fixed_len, 0);

        let mut tail = Vec::new();
        let mut at = fixed_at;
        for (index, field) in schema.fields.iter().enumerate() {
            let width = field.field_type.fixed_width();
            let value = self.values[index].as_ref();

            match value {
                Some(value) if !value.is_null() => {
                    if field.field_type.is_fixed() {
                        let mut buf = Vec::with_capacity(width);
                        encode_fixed(&mut buf, value, &field.field_type);
                        row[at..at + width].copy_from_slice(&buf);
                    } else {
                        let offset = fixed_at + fixed_len + tail.len();
                        encode_var(&mut tail, value, &field.field_type);
                        let len = fixed_at + fixed_len + tail.len() - offset;
                        BigEndian::write_u32(&mut row[at..at + 4], offset as u32);
                        BigEndian::write_u32(&mut row[at + 4..at + 8], len as u32);
                    }
                }
                _ => {
                    // Absent or null: mark the bitmap, leave the slot zeroed.
                    if !field.nullable && field.default.is_none() {
                        return Err(Error::MissingField {
                            field: field.name.clone(),
                        });
                    }
                    row[HEADER_LEN + index / 8] |= 0x80 >> (index % 8);
                }
            }
            at += width;
        }

        row.extend_from_slice(&tail);
        if let Some(ts) = self.write_ts {
            row.write_i64::<BigEndian>(ts).unwrap();
        }
        Ok(row)
    }
}

/// Reads an encoded row under its writer schema.
pub struct RowReader<'s, 'b> {
    schema: &'s Schema,
    row: &'b [u8],
    fixed_at: usize,
}

impl<'s, 'b> RowReader<'s, 'b> {
    /// Peek the writer schema version from a row header, without a schema.
    pub fn peek_schema_ver(row: &[u8]) -> Result<SchemaVer> {
        if row.len() < HEADER_LEN {
            return Err(Error::BadRow("row shorter than its header"));
        }
        Ok(BigEndian::read_i64(&row[1..9]))
    }

    /// Open a row for reading. `schema` must be the schema version named by
    /// the row's header.
    pub fn new(schema: &'s Schema, row: &'b [u8]) -> Result<Self> {
        let ver = Self::peek_schema_ver(row)?;
        if ver != schema.ver {
            return Err(Error::UnknownSchemaVer(ver));
        }
        let bitmap_len = (schema.num_fields() + 7) / 8;
        let fixed_at = HEADER_LEN + bitmap_len;
        if row.len() < fixed_at + schema.fixed_len() {
            return Err(Error::BadRow("row shorter than its fixed region"));
        }
        Ok(Self {
            schema,
            row,
            fixed_at,
        })
    }

    pub fn schema(&self) -> &'s Schema {
        self.schema
    }

    fn is_null(&self, index: usize) -> bool {
        self.row[HEADER_LEN + index / 8] & (0x80 >> (index % 8)) != 0
    }

    /// Read a field by schema ordinal. Null or absent fields materialize
    /// the schema default when one is declared.
    pub fn get(&self, index: usize) -> Result<Value> {
        let field = &self.schema.fields[index];
        if self.is_null(index) {
            return Ok(field.default.clone().unwrap_or(Value::Null));
        }

        let at = self.fixed_at
            + self.schema.fields[..index]
                .iter()
                .map(|f| f.field_type.fixed_width())
                .sum::<usize>();
        let slot = &self.row[at..at + field.field_type.fixed_width()];

        if field.field_type.is_fixed() {
            decode_fixed(slot, &field.field_type)
        } else {
            let offset = BigEndian::read_u32(slot) as usize;
            let len = BigEndian::read_u32(&slot[4..]) as usize;
            if offset + len > self.row.len() {
                return Err(Error::BadRow("var field extends past row end"));
            }
            decode_var(&self.row[offset..offset + len], &field.field_type)
        }
    }

    pub fn get_by_name(&self, name: &str) -> Result<Value> {
        let (index, _) = self.schema.field(name).ok_or_else(|| Error::MissingField {
            field: name.to_string(),
        })?;
        self.get(index)
    }

    /// The row's write timestamp, if it was stamped.
    pub fn write_ts(&self) -> Option<i64> {
        if self.row[0] & FLAG_HAS_WRITE_TS == 0 {
            return None;
        }
        let at = self.row.len().checked_sub(8)?;
        Some(BigEndian::read_i64(&self.row[at..]))
    }

    /// Whether this row is dead under its schema's TTL declaration at time
    /// `now` (seconds since epoch). The TTL anchor is the declared field's
    /// timestamp value, falling back to the row's write timestamp when the
    /// field is null; a row with no usable anchor never expires.
    pub fn expired(&self, now: i64) -> bool {
        let Some((index, ttl_secs)) = self.schema.ttl() else {
            return false;
        };
        let anchor = match self.get(index) {
            Ok(Value::Timestamp(ts)) => Some(ts),
            Ok(Value::Int(ts)) => Some(ts),
            _ => None,
        }
        .or_else(|| self.write_ts());

        match anchor {
            Some(anchor) => anchor + ttl_secs <= now,
            None => false,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use models::{FieldDef, FieldType};

    fn person() -> Schema {
        Schema::new(
            3,
            vec![
                FieldDef::new("name", FieldType::String),
                FieldDef::new("age", FieldType::Int64),
                FieldDef::new("score", FieldType::Double).with_default(Value::Float(1.0)),
                FieldDef::new("nick", FieldType::String).nullable(),
            ],
        )
    }

    #[test]
    fn test_row_round_trip() {
        let schema = person();
        let mut writer = RowWriter::new(&schema);
        writer.set("name", Value::Str("alice".to_string())).unwrap();
        writer.set("age", Value::Int(30)).unwrap();
        writer.set("score", Value::Float(2.5)).unwrap();
        let row = writer.finish().unwrap();

        assert_eq!(RowReader::peek_schema_ver(&row).unwrap(), 3);

        let reader = RowReader::new(&schema, &row).unwrap();
        assert_eq!(reader.get_by_name("name").unwrap(), Value::Str("alice".to_string()));
        assert_eq!(reader.get_by_name("age").unwrap(), Value::Int(30));
        assert_eq!(reader.get_by_name("score").unwrap(), Value::Float(2.5));
        // Unset nullable field without a default reads as null.
        assert_eq!(reader.get_by_name("nick").unwrap(), Value::Null);
    }

    #[test]
    fn test_absent_field_materializes_default() {
        let schema = person();
        let mut writer = RowWriter::new(&schema);
        writer.set("name", Value::Str("bob".to_string())).unwrap();
        writer.set("age", Value::Int(7)).unwrap();
        let row = writer.finish().unwrap();

        let reader = RowReader::new(&schema, &row).unwrap();
        assert_eq!(reader.get_by_name("score").unwrap(), Value::Float(1.0));
    }

    #[test]
    fn test_missing_required_field_is_rejected() {
        let schema = person();
        let mut writer = RowWriter::new(&schema);
        writer.set("name", Value::Str("carol".to_string())).unwrap();
        let err = writer.finish().unwrap_err();
        assert!(matches!(err, Error::MissingField { field } if field == "age"));
    }

    #[test]
    fn test_wrong_type_is_rejected() {
        let schema = person();
        let mut writer = RowWriter::new(&schema);
        let err = writer.set("age", Value::Str("x".to_string())).unwrap_err();
        assert!(matches!(err, Error::WrongType { field, .. } if field == "age"));
    }

    #[test]
    fn test_write_ts_and_ttl() {
        let schema = Schema::new(
            0,
            vec![FieldDef::new("seen", FieldType::Timestamp)
                .nullable()
                .with_ttl(60)],
        );

        // Anchored at the field value.
        let mut writer = RowWriter::new(&schema);
        writer.set("seen", Value::Timestamp(1_000)).unwrap();
        let row = writer.finish().unwrap();
        let reader = RowReader::new(&schema, &row).unwrap();
        assert!(!reader.expired(1_059));
        assert!(reader.expired(1_060));

        // Null field falls back to the write timestamp.
        let mut writer = RowWriter::new(&schema);
        writer.set_write_ts(2_000);
        let row = writer.finish().unwrap();
        let reader = RowReader::new(&schema, &row).unwrap();
        assert_eq!(reader.write_ts(), Some(2_000));
        assert!(!reader.expired(2_059));
        assert!(reader.expired(2_060));

        // No anchor at all: never expires.
        let row = RowWriter::new(&schema).finish().unwrap();
        let reader = RowReader::new(&schema, &row).unwrap();
        assert!(!reader.expired(i64::MAX));
    }

    #[test]
    fn test_schema_ver_mismatch() {
        let schema = person();
        let mut writer = RowWriter::new(&schema);
        writer.set("name", Value::Str("d".to_string())).unwrap();
        writer.set("age", Value::Int(1)).unwrap();
        let row = writer.finish().unwrap();

        let newer = Schema::new(4, schema.fields.clone());
        assert!(matches!(
            RowReader::new(&newer, &row),
            Err(Error::UnknownSchemaVer(3))
        ));
    }
}
