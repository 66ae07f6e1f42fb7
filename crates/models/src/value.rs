use std::collections::BTreeMap;

/// The closed set of property value types.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FieldType {
    Bool,
    Int64,
    Double,
    /// Variable-length byte string. Secondary indexes over strings declare a
    /// fixed prefix length at index definition time.
    String,
    Date,
    DateTime,
    /// Seconds since the Unix epoch.
    Timestamp,
    List(Box<FieldType>),
    Map(Box<FieldType>),
}

impl FieldType {
    /// Width of this type within a row's fixed-length region, in bytes.
    /// Variable-length types occupy an (offset, length) slot instead.
    pub fn fixed_width(&self) -> usize {
        match self {
            FieldType::Bool => 1,
            FieldType::Int64 | FieldType::Double | FieldType::Timestamp => 8,
            FieldType::Date => 4,
            FieldType::DateTime => 12,
            // Offset + length into the variable-length tail.
            FieldType::String | FieldType::List(_) | FieldType::Map(_) => 8,
        }
    }

    pub fn is_fixed(&self) -> bool {
        !matches!(
            self,
            FieldType::String | FieldType::List(_) | FieldType::Map(_)
        )
    }
}

/// A property value. `Null` is distinct from an absent field: absent fields
/// materialize their schema-declared default on read.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Date(chrono::NaiveDate),
    DateTime(chrono::NaiveDateTime),
    Timestamp(i64),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Whether this value inhabits `field_type`. Null inhabits every type;
    /// nullability is enforced by the schema, not the value.
    pub fn fits(&self, field_type: &FieldType) -> bool {
        match (self, field_type) {
            (Value::Null, _) => true,
            (Value::Bool(_), FieldType::Bool) => true,
            (Value::Int(_), FieldType::Int64) => true,
            (Value::Float(_), FieldType::Double) => true,
            (Value::Str(_), FieldType::String) => true,
            (Value::Date(_), FieldType::Date) => true,
            (Value::DateTime(_), FieldType::DateTime) => true,
            (Value::Timestamp(_), FieldType::Timestamp) => true,
            (Value::List(items), FieldType::List(inner)) => {
                items.iter().all(|item| item.fits(inner))
            }
            (Value::Map(entries), FieldType::Map(inner)) => {
                entries.values().all(|item| item.fits(inner))
            }
            _ => false,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Total order used by ORDER BY and top-K: null sorts first, then by
    /// type, then by value. NaN compares equal to itself and greater than
    /// every other float so that sorting is total.
    pub fn cmp_total(&self, other: &Value) -> std::cmp::Ordering {
        use std::cmp::Ordering;
        use Value::*;

        fn rank(v: &Value) -> u8 {
            match v {
                Null => 0,
                Bool(_) => 1,
                Int(_) | Float(_) => 2,
                Str(_) => 3,
                Date(_) => 4,
                DateTime(_) => 5,
                Timestamp(_) => 6,
                List(_) => 7,
                Map(_) => 8,
            }
        }

        match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Bool(l), Bool(r)) => l.cmp(r),
            (Int(l), Int(r)) => l.cmp(r),
            (Int(l), Float(r)) => total_f64(*l as f64, *r),
            (Float(l), Int(r)) => total_f64(*l, *r as f64),
            (Float(l), Float(r)) => total_f64(*l, *r),
            (Str(l), Str(r)) => l.cmp(r),
            (Date(l), Date(r)) => l.cmp(r),
            (DateTime(l), DateTime(r)) => l.cmp(r),
            (Timestamp(l), Timestamp(r)) => l.cmp(r),
            (List(l), List(r)) => {
                for (l, r) in l.iter().zip(r.iter()) {
                    match l.cmp_total(r) {
                        Ordering::Equal => continue,
                        other => return other,
                    }
                }
                l.len().cmp(&r.len())
            }
            (l, r) => rank(l).cmp(&rank(r)),
        }
    }
}

fn total_f64(l: f64, r: f64) -> std::cmp::Ordering {
    l.partial_cmp(&r).unwrap_or_else(|| {
        match (l.is_nan(), r.is_nan()) {
            (true, true) => std::cmp::Ordering::Equal,
            (true, false) => std::cmp::Ordering::Greater,
            (false, true) => std::cmp::Ordering::Less,
            (false, false) => unreachable!("partial_cmp is None only for NaN"),
        }
    })
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Date(d) => write!(f, "{d}"),
            Value::DateTime(d) => write!(f, "{d}"),
            Value::Timestamp(t) => write!(f, "{t}"),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Map(entries) => {
                write!(f, "{{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_fits() {
        assert!(Value::Int(3).fits(&FieldType::Int64));
        assert!(!Value::Int(3).fits(&FieldType::Double));
        assert!(Value::Null.fits(&FieldType::String));
        assert!(
            Value::List(vec![Value::Int(1), Value::Int(2)])
                .fits(&FieldType::List(Box::new(FieldType::Int64)))
        );
        assert!(
            !Value::List(vec![Value::Int(1), Value::Str("x".into())])
                .fits(&FieldType::List(Box::new(FieldType::Int64)))
        );
    }

    #[test]
    fn test_total_order() {
        use std::cmp::Ordering;

        assert_eq!(Value::Null.cmp_total(&Value::Int(0)), Ordering::Less);
        assert_eq!(Value::Int(2).cmp_total(&Value::Float(2.5)), Ordering::Less);
        assert_eq!(
            Value::Float(f64::NAN).cmp_total(&Value::Float(f64::NAN)),
            Ordering::Equal
        );
        assert_eq!(
            Value::Float(f64::NAN).cmp_total(&Value::Float(1e300)),
            Ordering::Greater
        );
    }
}
