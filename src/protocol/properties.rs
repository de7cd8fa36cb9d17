//! Loosely typed MQTT v5 property bags and the schema-driven copier that
//! moves validated fields between them.
//!
//! Host messages, CONNACK packets and inbound PUBLISH packets all arrive as a
//! [`PropertyBag`]. Only fields that pass the type and range rules of a
//! [`FieldSpec`] are copied into the destination bag; everything else is left
//! absent rather than defaulted.

use bytes::Bytes;
use indexmap::IndexMap;
use serde_json::Value;

/// Ordered map of property name to value
pub type PropertyBag = IndexMap<String, PropertyValue>;

/// A single loosely typed property value
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Bytes),
    Map(PropertyBag),
    /// Any other structured value (arrays, nested JSON)
    Json(Value),
}

impl PropertyValue {
    pub fn is_null(&self) -> bool {
        matches!(self, PropertyValue::Null)
    }

    /// Render the value as JSON. Binary data uses the `{"type":"Buffer"}` shape.
    pub fn to_json(&self) -> Value {
        match self {
            PropertyValue::Null => Value::Null,
            PropertyValue::Bool(b) => Value::Bool(*b),
            PropertyValue::Int(i) => Value::from(*i),
            PropertyValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            PropertyValue::Str(s) => Value::String(s.clone()),
            PropertyValue::Bytes(b) => serde_json::json!({
                "type": "Buffer",
                "data": b.iter().copied().collect::<Vec<u8>>(),
            }),
            PropertyValue::Map(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            PropertyValue::Json(v) => v.clone(),
        }
    }
}

impl From<Value> for PropertyValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => PropertyValue::Null,
            Value::Bool(b) => PropertyValue::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => PropertyValue::Int(i),
                None => PropertyValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => PropertyValue::Str(s),
            Value::Object(map) => {
                if let Some(bytes) = buffer_from_json(&map) {
                    return PropertyValue::Bytes(bytes);
                }
                PropertyValue::Map(
                    map.into_iter()
                        .map(|(k, v)| (k, PropertyValue::from(v)))
                        .collect(),
                )
            }
            other @ Value::Array(_) => PropertyValue::Json(other),
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::Str(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::Str(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Int(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

impl From<Bytes> for PropertyValue {
    fn from(value: Bytes) -> Self {
        PropertyValue::Bytes(value)
    }
}

impl From<Vec<u8>> for PropertyValue {
    fn from(value: Vec<u8>) -> Self {
        PropertyValue::Bytes(Bytes::from(value))
    }
}

/// Recognise the `{"type":"Buffer","data":[..]}` encoding of binary data
fn buffer_from_json(map: &serde_json::Map<String, Value>) -> Option<Bytes> {
    if map.len() != 2 || map.get("type")?.as_str()? != "Buffer" {
        return None;
    }
    let data = map.get("data")?.as_array()?;
    data.iter()
        .map(|v| v.as_u64().and_then(|n| u8::try_from(n).ok()))
        .collect::<Option<Vec<u8>>>()
        .map(Bytes::from)
}

/// Parse an integer the lenient way host messages expect: numbers are
/// truncated, strings contribute their leading integer ("12abc" is 12).
pub fn parse_int(value: &PropertyValue) -> Option<i64> {
    match value {
        PropertyValue::Int(i) => Some(*i),
        PropertyValue::Float(f) if f.is_finite() => Some(f.trunc() as i64),
        PropertyValue::Str(s) => parse_leading_int(s),
        _ => None,
    }
}

fn parse_leading_int(s: &str) -> Option<i64> {
    let trimmed = s.trim_start();
    let (negative, digits) = match trimmed.as_bytes().first() {
        Some(b'-') => (true, &trimmed[1..]),
        Some(b'+') => (false, &trimmed[1..]),
        _ => (false, trimmed),
    };
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    if end == 0 {
        return None;
    }
    let magnitude: i64 = digits[..end].parse().ok()?;
    Some(if negative { -magnitude } else { magnitude })
}

/// Copy an integer field when it parses and sits inside `[min, max]`.
/// The default is only used when the field is missing from `src` entirely.
pub fn set_int_prop(
    src: &PropertyBag,
    dst: &mut PropertyBag,
    name: &str,
    min: Option<i64>,
    max: Option<i64>,
    default: Option<i64>,
) {
    let Some(raw) = src.get(name) else {
        if let Some(default) = default {
            dst.insert(name.to_string(), PropertyValue::Int(default));
        }
        return;
    };
    let Some(value) = parse_int(raw) else {
        return;
    };
    if min.is_some_and(|min| value < min) || max.is_some_and(|max| value > max) {
        return;
    }
    dst.insert(name.to_string(), PropertyValue::Int(value));
}

/// Copy a non-empty string field, otherwise fall back to `default`.
pub fn set_str_prop(src: &PropertyBag, dst: &mut PropertyBag, name: &str, default: Option<&str>) {
    match src.get(name) {
        Some(PropertyValue::Str(s)) if !s.is_empty() => {
            dst.insert(name.to_string(), PropertyValue::Str(s.clone()));
        }
        _ => {
            if let Some(default) = default {
                dst.insert(name.to_string(), PropertyValue::Str(default.to_string()));
            }
        }
    }
}

/// Copy a boolean field given as a boolean or as `"true"`/`"false"`.
///
/// A present value of any other shape is ignored without applying the default.
pub fn set_bool_prop(src: &PropertyBag, dst: &mut PropertyBag, name: &str, default: Option<bool>) {
    match src.get(name) {
        None | Some(PropertyValue::Null) => {
            if let Some(default) = default {
                dst.insert(name.to_string(), PropertyValue::Bool(default));
            }
        }
        Some(PropertyValue::Bool(b)) => {
            dst.insert(name.to_string(), PropertyValue::Bool(*b));
        }
        Some(PropertyValue::Str(s)) if s == "true" || s == "false" => {
            dst.insert(name.to_string(), PropertyValue::Bool(s == "true"));
        }
        Some(_) => {}
    }
}

/// Copy a field only when it already holds binary data.
pub fn set_bytes_prop(src: &PropertyBag, dst: &mut PropertyBag, name: &str) {
    if let Some(PropertyValue::Bytes(b)) = src.get(name) {
        dst.insert(name.to_string(), PropertyValue::Bytes(b.clone()));
    }
}

/// Copy a user-property map, stringifying non-string values.
///
/// Null entries are skipped. When nothing survives, the destination field is
/// left absent instead of holding an empty map.
pub fn set_user_properties(src: Option<&PropertyValue>, dst: &mut PropertyBag, name: &str) {
    let Some(PropertyValue::Map(entries)) = src else {
        return;
    };
    let cloned: PropertyBag = entries
        .iter()
        .filter_map(|(key, value)| {
            let text = match value {
                PropertyValue::Str(s) => s.clone(),
                PropertyValue::Null => return None,
                other => serde_json::to_string(&other.to_json()).ok()?,
            };
            Some((key.clone(), PropertyValue::Str(text)))
        })
        .collect();
    if !cloned.is_empty() {
        dst.insert(name.to_string(), PropertyValue::Map(cloned));
    }
}

/// How a single field is validated when copied
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldKind {
    Int {
        min: Option<i64>,
        max: Option<i64>,
        default: Option<i64>,
    },
    Str {
        default: Option<&'static str>,
    },
    Bool {
        default: Option<bool>,
    },
    Bytes,
    UserProperties,
}

/// One named field of a copy schema
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
}

impl FieldSpec {
    pub const fn int(name: &'static str, min: Option<i64>, max: Option<i64>) -> Self {
        Self {
            name,
            kind: FieldKind::Int {
                min,
                max,
                default: None,
            },
        }
    }

    pub const fn string(name: &'static str) -> Self {
        Self {
            name,
            kind: FieldKind::Str { default: None },
        }
    }

    pub const fn boolean(name: &'static str, default: Option<bool>) -> Self {
        Self {
            name,
            kind: FieldKind::Bool { default },
        }
    }

    pub const fn bytes(name: &'static str) -> Self {
        Self {
            name,
            kind: FieldKind::Bytes,
        }
    }

    pub const fn user_properties(name: &'static str) -> Self {
        Self {
            name,
            kind: FieldKind::UserProperties,
        }
    }
}

/// Copy every field described by `schema` from `src` into `dst`.
pub fn copy_fields(src: &PropertyBag, dst: &mut PropertyBag, schema: &[FieldSpec]) {
    for field in schema {
        match field.kind {
            FieldKind::Int { min, max, default } => {
                set_int_prop(src, dst, field.name, min, max, default)
            }
            FieldKind::Str { default } => set_str_prop(src, dst, field.name, default),
            FieldKind::Bool { default } => set_bool_prop(src, dst, field.name, default),
            FieldKind::Bytes => set_bytes_prop(src, dst, field.name),
            FieldKind::UserProperties => set_user_properties(src.get(field.name), dst, field.name),
        }
    }
}

/// Typed reads over a bag produced by [`copy_fields`]
pub trait PropertyBagExt {
    fn get_str(&self, name: &str) -> Option<&str>;
    fn get_int(&self, name: &str) -> Option<i64>;
    fn get_bool(&self, name: &str) -> Option<bool>;
    fn get_bytes(&self, name: &str) -> Option<&Bytes>;
    fn get_string_map(&self, name: &str) -> Option<IndexMap<String, String>>;
}

impl PropertyBagExt for PropertyBag {
    fn get_str(&self, name: &str) -> Option<&str> {
        match self.get(name) {
            Some(PropertyValue::Str(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    fn get_int(&self, name: &str) -> Option<i64> {
        match self.get(name) {
            Some(PropertyValue::Int(i)) => Some(*i),
            _ => None,
        }
    }

    fn get_bool(&self, name: &str) -> Option<bool> {
        match self.get(name) {
            Some(PropertyValue::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    fn get_bytes(&self, name: &str) -> Option<&Bytes> {
        match self.get(name) {
            Some(PropertyValue::Bytes(b)) => Some(b),
            _ => None,
        }
    }

    fn get_string_map(&self, name: &str) -> Option<IndexMap<String, String>> {
        let Some(PropertyValue::Map(map)) = self.get(name) else {
            return None;
        };
        let strings: IndexMap<String, String> = map
            .iter()
            .filter_map(|(k, v)| match v {
                PropertyValue::Str(s) => Some((k.clone(), s.clone())),
                _ => None,
            })
            .collect();
        (!strings.is_empty()).then_some(strings)
    }
}

/// Build a bag from `(name, value)` pairs
pub fn bag<I, K, V>(entries: I) -> PropertyBag
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<PropertyValue>,
{
    entries
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_int_prop_respects_range_and_absence() {
        let src = bag([
            ("inRange", PropertyValue::Int(5)),
            ("tooBig", PropertyValue::Int(11)),
            ("text", PropertyValue::from("7 seconds")),
            ("garbage", PropertyValue::from("abc")),
            ("null", PropertyValue::Null),
        ]);
        let mut dst = PropertyBag::new();

        set_int_prop(&src, &mut dst, "inRange", Some(0), Some(10), None);
        set_int_prop(&src, &mut dst, "tooBig", Some(0), Some(10), None);
        set_int_prop(&src, &mut dst, "text", Some(0), None, None);
        set_int_prop(&src, &mut dst, "garbage", None, None, Some(3));
        set_int_prop(&src, &mut dst, "null", None, None, Some(3));
        set_int_prop(&src, &mut dst, "missing", None, None, Some(3));

        assert_eq!(dst.get_int("inRange"), Some(5));
        assert_eq!(dst.get_int("tooBig"), None);
        assert_eq!(dst.get_int("text"), Some(7));
        assert_eq!(dst.get_int("garbage"), None);
        assert_eq!(dst.get_int("null"), None);
        assert_eq!(dst.get_int("missing"), Some(3));
    }

    #[test]
    fn test_int_prop_never_defaults_to_zero() {
        let mut dst = PropertyBag::new();
        set_int_prop(&PropertyBag::new(), &mut dst, "messageExpiryInterval", Some(0), None, None);
        assert!(dst.is_empty());
    }

    #[test]
    fn test_parse_int_follows_leading_digits() {
        assert_eq!(parse_int(&PropertyValue::from("  -42xyz")), Some(-42));
        assert_eq!(parse_int(&PropertyValue::from("+8")), Some(8));
        assert_eq!(parse_int(&PropertyValue::Float(2.9)), Some(2));
        assert_eq!(parse_int(&PropertyValue::from("")), None);
        assert_eq!(parse_int(&PropertyValue::Bool(true)), None);
    }

    #[test]
    fn test_str_prop_copies_only_non_empty_strings() {
        let src = bag([
            ("contentType", PropertyValue::from("text/plain")),
            ("empty", PropertyValue::from("")),
            ("number", PropertyValue::Int(4)),
        ]);
        let mut dst = PropertyBag::new();
        set_str_prop(&src, &mut dst, "contentType", None);
        set_str_prop(&src, &mut dst, "empty", None);
        set_str_prop(&src, &mut dst, "number", Some("fallback"));

        assert_eq!(dst.get_str("contentType"), Some("text/plain"));
        assert!(!dst.contains_key("empty"));
        assert_eq!(dst.get_str("number"), Some("fallback"));
    }

    #[test]
    fn test_bool_prop_accepts_literals_and_strings() {
        let src = bag([
            ("a", PropertyValue::Bool(true)),
            ("b", PropertyValue::from("false")),
            ("c", PropertyValue::from("yes")),
            ("d", PropertyValue::Null),
        ]);
        let mut dst = PropertyBag::new();
        for name in ["a", "b", "c", "d", "e"] {
            set_bool_prop(&src, &mut dst, name, Some(true));
        }

        assert_eq!(dst.get_bool("a"), Some(true));
        assert_eq!(dst.get_bool("b"), Some(false));
        assert_eq!(dst.get_bool("c"), None);
        assert_eq!(dst.get_bool("d"), Some(true));
        assert_eq!(dst.get_bool("e"), Some(true));
    }

    #[test]
    fn test_bytes_prop_requires_binary_source() {
        let src = bag([
            ("correlationData", PropertyValue::from(vec![1u8, 2, 3])),
            ("text", PropertyValue::from("abc")),
        ]);
        let mut dst = PropertyBag::new();
        set_bytes_prop(&src, &mut dst, "correlationData");
        set_bytes_prop(&src, &mut dst, "text");

        assert_eq!(
            dst.get_bytes("correlationData").map(|b| b.to_vec()),
            Some(vec![1, 2, 3])
        );
        assert!(!dst.contains_key("text"));
    }

    #[test]
    fn test_user_properties_are_stringified() {
        let source = PropertyValue::from(json!({
            "name": "sensor",
            "count": 3,
            "nested": {"a": true},
            "skip": null,
        }));
        let mut dst = PropertyBag::new();
        set_user_properties(Some(&source), &mut dst, "userProperties");

        let map = dst.get_string_map("userProperties").expect("map present");
        assert_eq!(map.get("name").map(String::as_str), Some("sensor"));
        assert_eq!(map.get("count").map(String::as_str), Some("3"));
        assert_eq!(map.get("nested").map(String::as_str), Some(r#"{"a":true}"#));
        assert!(!map.contains_key("skip"));
    }

    #[test]
    fn test_empty_user_properties_are_absent() {
        let mut dst = PropertyBag::new();
        set_user_properties(Some(&PropertyValue::from(json!({}))), &mut dst, "userProperties");
        set_user_properties(
            Some(&PropertyValue::from(json!({"only": null}))),
            &mut dst,
            "userProperties",
        );
        set_user_properties(Some(&PropertyValue::from("not a map")), &mut dst, "userProperties");
        assert!(dst.is_empty());
    }

    #[test]
    fn test_json_buffer_shape_becomes_bytes() {
        let value = PropertyValue::from(json!({"type": "Buffer", "data": [104, 105]}));
        assert_eq!(value, PropertyValue::Bytes(Bytes::from_static(b"hi")));
        assert_eq!(
            value.to_json(),
            json!({"type": "Buffer", "data": [104, 105]})
        );
    }

    #[test]
    fn test_copy_fields_applies_schema() {
        const SCHEMA: [FieldSpec; 3] = [
            FieldSpec::int("maximumQoS", Some(0), Some(2)),
            FieldSpec::boolean("retainAvailable", Some(true)),
            FieldSpec::string("reasonString"),
        ];
        let src = bag([
            ("maximumQoS", PropertyValue::Int(3)),
            ("reasonString", PropertyValue::from("ok")),
            ("ignored", PropertyValue::from("x")),
        ]);
        let mut dst = PropertyBag::new();
        copy_fields(&src, &mut dst, &SCHEMA);

        assert_eq!(dst.get_int("maximumQoS"), None);
        assert_eq!(dst.get_bool("retainAvailable"), Some(true));
        assert_eq!(dst.get_str("reasonString"), Some("ok"));
        assert!(!dst.contains_key("ignored"));
    }
}
