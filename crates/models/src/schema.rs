use super::{FieldType, IndexId, SchemaVer, Value};

/// One field of a tag or edge schema.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub field_type: FieldType,
    pub nullable: bool,
    /// Materialized on read when the field is absent from a row written
    /// under an older schema version, or null in the null bitmap.
    pub default: Option<Value>,
    /// Time-to-live in seconds, anchored at this field's timestamp value
    /// (falling back to the row's write timestamp when the field is null).
    /// At most one field of a schema declares a TTL.
    pub ttl_secs: Option<i64>,
}

impl FieldDef {
    pub fn new(name: &str, field_type: FieldType) -> Self {
        Self {
            name: name.to_string(),
            field_type,
            nullable: false,
            default: None,
            ttl_secs: None,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn with_ttl(mut self, secs: i64) -> Self {
        self.ttl_secs = Some(secs);
        self
    }
}

/// One immutable version of a tag or edge schema: an ordered vector of
/// field definitions. Schema evolution appends a new version; rows carry
/// the version they were written under in their header.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Schema {
    pub ver: SchemaVer,
    pub fields: Vec<FieldDef>,
}

impl Schema {
    pub fn new(ver: SchemaVer, fields: Vec<FieldDef>) -> Self {
        Self { ver, fields }
    }

    pub fn field(&self, name: &str) -> Option<(usize, &FieldDef)> {
        self.fields
            .iter()
            .enumerate()
            .find(|(_, f)| f.name == name)
    }

    pub fn num_fields(&self) -> usize {
        self.fields.len()
    }

    /// The TTL field of this schema, if any: (field index, ttl seconds).
    pub fn ttl(&self) -> Option<(usize, i64)> {
        self.fields
            .iter()
            .enumerate()
            .find_map(|(i, f)| f.ttl_secs.map(|secs| (i, secs)))
    }

    /// Total width of the fixed-length region of a row under this schema.
    pub fn fixed_len(&self) -> usize {
        self.fields.iter().map(|f| f.field_type.fixed_width()).sum()
    }
}

/// A secondary index over a prefix of a tag's or edge's columns.
/// `schema_id` is a TagId for tag indexes and an EdgeType for edge indexes.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct IndexDef {
    pub index_id: IndexId,
    pub schema_id: i32,
    pub is_edge: bool,
    /// Indexed column names, in key order. Each resolves against the
    /// *newest* schema version of `schema_id`.
    pub fields: Vec<String>,
    /// Declared encoded length per string column, by column name. Strings
    /// are prefix-padded to this length in the index key.
    pub string_lens: std::collections::BTreeMap<String, usize>,
    /// A unique index additionally enforces at most one data record per
    /// encoded value.
    pub unique: bool,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_schema_lookup_and_ttl() {
        let schema = Schema::new(
            0,
            vec![
                FieldDef::new("name", FieldType::String),
                FieldDef::new("age", FieldType::Int64).with_default(Value::Int(0)),
                FieldDef::new("seen", FieldType::Timestamp).nullable().with_ttl(3600),
            ],
        );

        let (idx, field) = schema.field("age").unwrap();
        assert_eq!(idx, 1);
        assert_eq!(field.default, Some(Value::Int(0)));
        assert!(schema.field("missing").is_none());

        assert_eq!(schema.ttl(), Some((2, 3600)));
        // string slot (8) + int64 (8) + timestamp (8).
        assert_eq!(schema.fixed_len(), 24);
    }
}
