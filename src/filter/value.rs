// Tagged value model for filter evaluation
// Records project into this union instead of being reflected over

use chrono::{DateTime, Utc};

/// A value the evaluator can inspect.
///
/// Records participate in filtering by projecting themselves into this
/// tagged union via [`Project`]: a record becomes a [`Value::Record`]
/// whose fields carry both plain data and the results of the record's
/// zero-argument accessors. The evaluator only ever sees `Value`s.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// The nil-pointer analogue: never matches anything.
    Invalid,
    Bool(bool),
    Int(i64),
    Uint(u64),
    Float(f64),
    Str(String),
    Time(DateTime<Utc>),
    /// Elapsed time in nanoseconds.
    Duration(i64),
    List(Vec<Value>),
    /// String-keyed map, insertion-ordered.
    Map(Vec<(String, Value)>),
    /// A named-field record.
    Record(Vec<(String, Value)>),
}

impl Value {
    pub fn record(fields: impl IntoIterator<Item = (&'static str, Value)>) -> Value {
        Value::Record(
            fields
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        )
    }

    pub fn list(items: impl IntoIterator<Item = Value>) -> Value {
        Value::List(items.into_iter().collect())
    }

    pub fn str(s: impl Into<String>) -> Value {
        Value::Str(s.into())
    }

    /// The named fields of a record or map, if any.
    pub fn fields(&self) -> Option<&[(String, Value)]> {
        match self {
            Value::Record(fields) | Value::Map(fields) => Some(fields),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::Uint(n)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Float(n)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(t: DateTime<Utc>) -> Self {
        Value::Time(t)
    }
}

impl<T> From<Option<T>> for Value
where
    T: Into<Value>,
{
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Invalid)
    }
}

impl From<&serde_json::Value> for Value {
    fn from(v: &serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Invalid,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else if let Some(u) = n.as_u64() {
                    Value::Uint(u)
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Value::Str(s.clone()),
            serde_json::Value::Array(items) => {
                Value::List(items.iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => Value::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from(v)))
                    .collect(),
            ),
        }
    }
}

/// The capability a type needs to be filterable: a deterministic
/// projection into the value model. Computed accessors become fields of
/// the projected record.
pub trait Project {
    fn project(&self) -> Value;
}

impl Project for Value {
    fn project(&self) -> Value {
        self.clone()
    }
}

impl Project for serde_json::Value {
    fn project(&self) -> Value {
        Value::from(self)
    }
}

/// Identifier-to-field matching: exact, then case-insensitive with
/// underscores ignored, so `field_name` finds `FieldName` and `fieldName`.
pub fn name_matches(field: &str, query: &str) -> bool {
    if field == query {
        return true;
    }
    let mut f = field.chars().filter(|c| *c != '_').flat_map(char::to_lowercase);
    let mut q = query.chars().filter(|c| *c != '_').flat_map(char::to_lowercase);
    loop {
        match (f.next(), q.next()) {
            (None, None) => return true,
            (Some(a), Some(b)) if a == b => continue,
            _ => return false,
        }
    }
}

/// Find a field of `fields` matching `query`, exact matches first.
pub fn lookup_field<'a>(fields: &'a [(String, Value)], query: &str) -> Option<&'a Value> {
    if let Some((_, v)) = fields.iter().find(|(k, _)| k == query) {
        return Some(v);
    }
    fields
        .iter()
        .find(|(k, _)| name_matches(k, query))
        .map(|(_, v)| v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_matching_rules() {
        assert!(name_matches("FieldName", "field_name"));
        assert!(name_matches("field_name", "FieldName"));
        assert!(name_matches("updated", "Updated"));
        assert!(name_matches("updated_at", "updatedAt"));
        assert!(!name_matches("field", "fields"));
        assert!(!name_matches("ab", "ba"));
    }

    #[test]
    fn lookup_prefers_exact() {
        let fields = vec![
            ("Status".to_string(), Value::str("a")),
            ("status".to_string(), Value::str("b")),
        ];
        assert_eq!(lookup_field(&fields, "status"), Some(&Value::str("b")));
        assert_eq!(lookup_field(&fields, "STATUS"), Some(&Value::str("a")));
        assert_eq!(lookup_field(&fields, "missing"), None);
    }

    #[test]
    fn json_projection() {
        let json: serde_json::Value = serde_json::json!({
            "number": 7,
            "open": true,
            "tags": ["a", "b"],
            "owner": {"name": "alice"},
            "gone": null,
        });
        let v = json.project();
        let fields = v.fields().unwrap();
        assert_eq!(lookup_field(fields, "number"), Some(&Value::Int(7)));
        assert_eq!(lookup_field(fields, "open"), Some(&Value::Bool(true)));
        assert_eq!(lookup_field(fields, "gone"), Some(&Value::Invalid));
        match lookup_field(fields, "tags").unwrap() {
            Value::List(items) => assert_eq!(items.len(), 2),
            other => panic!("expected list, got {other:?}"),
        }
    }

    #[test]
    fn option_projection() {
        let some: Value = Some(3i64).into();
        let none: Value = Option::<i64>::None.into();
        assert_eq!(some, Value::Int(3));
        assert_eq!(none, Value::Invalid);
    }
}
