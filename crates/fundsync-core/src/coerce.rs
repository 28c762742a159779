//! Tolerant decoding for provider payloads whose shape drifts between
//! "single object", "array of objects", plain strings and `{"$": ...}` wrappers.

use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Accepts a single value, an array of values, or null; always yields a list.
pub fn one_or_many<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany<T> {
        Many(Vec<T>),
        One(T),
    }

    Ok(match Option::<OneOrMany<T>>::deserialize(deserializer)? {
        Some(OneOrMany::Many(items)) => items,
        Some(OneOrMany::One(item)) => vec![item],
        None => Vec::new(),
    })
}

/// Same as [`one_or_many`] but for an already-parsed JSON value.
pub fn value_list(value: Option<&Value>) -> Vec<&Value> {
    match value {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(Value::Null) | None => Vec::new(),
        Some(other) => vec![other],
    }
}

/// Text field that may arrive as a string, a number, `{"$": ..}`, `{"value": ..}`
/// or an array of any of those. Blank text decodes to `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextValue(pub Option<String>);

impl TextValue {
    pub fn as_deref(&self) -> Option<&str> {
        self.0.as_deref()
    }

    pub fn into_inner(self) -> Option<String> {
        self.0
    }

    pub fn parse<T: std::str::FromStr>(&self) -> Option<T> {
        self.0.as_deref().and_then(|v| v.trim().parse().ok())
    }
}

impl<'de> Deserialize<'de> for TextValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Ok(TextValue(text_of(&value)))
    }
}

pub fn text_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Array(items) => items.iter().find_map(text_of),
        Value::Object(map) => map
            .get("$")
            .and_then(text_of)
            .or_else(|| map.get("value").and_then(text_of)),
        Value::Null => None,
    }
}
