//! Cache key definitions.
//!
//! A [`CacheKey`] names one cached item: an entity, a collection owned by an
//! entity, or a query result. The namespace is part of the key value, so an
//! entity `Post#1` and a collection owned by `Post#1` can never collide.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Primary-key value of a cached entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Identifier {
    Int(i64),
    Uuid(Uuid),
    Text(String),
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(value) => write!(f, "{value}"),
            Self::Uuid(value) => write!(f, "{value}"),
            Self::Text(value) => write!(f, "{value:?}"),
        }
    }
}

impl From<i64> for Identifier {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for Identifier {
    fn from(value: i32) -> Self {
        Self::Int(value.into())
    }
}

impl From<u32> for Identifier {
    fn from(value: u32) -> Self {
        Self::Int(value.into())
    }
}

impl From<Uuid> for Identifier {
    fn from(value: Uuid) -> Self {
        Self::Uuid(value)
    }
}

impl From<&str> for Identifier {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Identifier {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// Normalized query parameter value.
///
/// Construction goes through the `From` impls, which normalize numeric
/// representations so that `1`, `1u64` and `1.0` produce the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(untagged)]
pub enum ParamValue {
    Null,
    Bool(bool),
    Int(i64),
    /// Integer above `i64::MAX`.
    UInt(u64),
    /// Non-integral float, stored as canonical bits.
    Float(u64),
    Text(String),
    Uuid(Uuid),
    List(Vec<ParamValue>),
}

const CANONICAL_NAN_BITS: u64 = 0x7ff8_0000_0000_0000;
// 2^63 and 2^64 are exact in f64.
const TWO_POW_63: f64 = 9_223_372_036_854_775_808.0;
const TWO_POW_64: f64 = 18_446_744_073_709_551_616.0;

impl ParamValue {
    /// Normalize a JSON value into a parameter.
    pub fn from_json(value: &serde_json::Value) -> Self {
        use serde_json::Value;

        match value {
            Value::Null => Self::Null,
            Value::Bool(flag) => Self::Bool(*flag),
            Value::Number(number) => {
                if let Some(int) = number.as_i64() {
                    Self::Int(int)
                } else if let Some(unsigned) = number.as_u64() {
                    Self::from(unsigned)
                } else {
                    Self::from(number.as_f64().unwrap_or(f64::NAN))
                }
            }
            Value::String(text) => Self::Text(text.clone()),
            Value::Array(items) => Self::List(items.iter().map(Self::from_json).collect()),
            Value::Object(_) => Self::Text(value.to_string()),
        }
    }

    fn write_canonical(&self, out: &mut String) {
        use std::fmt::Write;

        let _ = match self {
            Self::Null => write!(out, "null"),
            Self::Bool(flag) => write!(out, "b:{flag}"),
            Self::Int(value) => write!(out, "i:{value}"),
            Self::UInt(value) => write!(out, "i:{value}"),
            Self::Float(bits) => write!(out, "f:{bits:016x}"),
            Self::Text(text) => write!(out, "s:{}:{text}", text.len()),
            Self::Uuid(value) => write!(out, "u:{value}"),
            Self::List(items) => {
                out.push('[');
                for item in items {
                    item.write_canonical(out);
                    out.push(',');
                }
                out.push(']');
                Ok(())
            }
        };
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(flag) => write!(f, "{flag}"),
            Self::Int(value) => write!(f, "{value}"),
            Self::UInt(value) => write!(f, "{value}"),
            Self::Float(bits) => write!(f, "{}", f64::from_bits(*bits)),
            Self::Text(text) => write!(f, "{text:?}"),
            Self::Uuid(value) => write!(f, "{value}"),
            Self::List(items) => {
                f.write_str("[")?;
                for (index, item) in items.iter().enumerate() {
                    if index > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
        }
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for ParamValue {
    fn from(value: i32) -> Self {
        Self::Int(value.into())
    }
}

impl From<u32> for ParamValue {
    fn from(value: u32) -> Self {
        Self::Int(value.into())
    }
}

impl From<u64> for ParamValue {
    fn from(value: u64) -> Self {
        match i64::try_from(value) {
            Ok(int) => Self::Int(int),
            Err(_) => Self::UInt(value),
        }
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        if value.is_nan() {
            return Self::Float(CANONICAL_NAN_BITS);
        }
        if value.is_finite() && value.fract() == 0.0 {
            if (-TWO_POW_63..TWO_POW_63).contains(&value) {
                return Self::Int(value as i64);
            }
            if (TWO_POW_63..TWO_POW_64).contains(&value) {
                return Self::UInt(value as u64);
            }
        }
        Self::Float(value.to_bits())
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Uuid> for ParamValue {
    fn from(value: Uuid) -> Self {
        Self::Uuid(value)
    }
}

impl From<Identifier> for ParamValue {
    fn from(value: Identifier) -> Self {
        match value {
            Identifier::Int(int) => Self::Int(int),
            Identifier::Uuid(uuid) => Self::Uuid(uuid),
            Identifier::Text(text) => Self::Text(text),
        }
    }
}

impl<T: Into<ParamValue>> From<Option<T>> for ParamValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

impl<T: Into<ParamValue>> From<Vec<T>> for ParamValue {
    fn from(values: Vec<T>) -> Self {
        Self::List(values.into_iter().map(Into::into).collect())
    }
}

/// Key of a cached query result: normalized statement plus ordered parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
    text: Arc<str>,
    params: Arc<[ParamValue]>,
}

impl QueryKey {
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn params(&self) -> &[ParamValue] {
        &self.params
    }

    /// Stable hex SHA-256 digest of the normalized statement and parameters.
    pub fn digest(&self) -> String {
        let mut canonical = String::with_capacity(self.text.len() + 16 * self.params.len());
        canonical.push_str(&self.text);
        for param in self.params.iter() {
            canonical.push('\u{1f}');
            param.write_canonical(&mut canonical);
        }
        hex::encode(Sha256::digest(canonical.as_bytes()))
    }
}

/// Namespace a key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyNamespace {
    Entity,
    Collection,
    Query,
}

impl fmt::Display for KeyNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Entity => "entity",
            Self::Collection => "collection",
            Self::Query => "query",
        })
    }
}

/// Unified cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Entity {
        entity: Arc<str>,
        id: Identifier,
    },
    Collection {
        owner: Arc<str>,
        role: Arc<str>,
        owner_id: Identifier,
    },
    Query(QueryKey),
}

impl CacheKey {
    pub fn namespace(&self) -> KeyNamespace {
        match self {
            Self::Entity { .. } => KeyNamespace::Entity,
            Self::Collection { .. } => KeyNamespace::Collection,
            Self::Query(_) => KeyNamespace::Query,
        }
    }

    pub fn as_query(&self) -> Option<&QueryKey> {
        match self {
            Self::Query(query) => Some(query),
            _ => None,
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Entity { entity, id } => write!(f, "{entity}#{id}"),
            Self::Collection {
                owner,
                role,
                owner_id,
            } => write!(f, "{owner}.{role}#{owner_id}"),
            Self::Query(query) => write!(f, "query:{}", &query.digest()[..16]),
        }
    }
}

// ============================================================================
// Key factory
// ============================================================================

/// Key of one entity instance.
pub fn entity_key(entity_name: &str, id: impl Into<Identifier>) -> CacheKey {
    CacheKey::Entity {
        entity: Arc::from(entity_name),
        id: id.into(),
    }
}

/// Key of the collection `role` owned by `owner_entity#owner_id`.
pub fn collection_key(owner_entity: &str, role: &str, owner_id: impl Into<Identifier>) -> CacheKey {
    CacheKey::Collection {
        owner: Arc::from(owner_entity),
        role: Arc::from(role),
        owner_id: owner_id.into(),
    }
}

/// Key of a query result.
///
/// The statement text is normalized with [`normalize_query_text`]; parameter
/// values are normalized by their `ParamValue` conversions.
pub fn query_key<I>(query_text: &str, params: I) -> CacheKey
where
    I: IntoIterator,
    I::Item: Into<ParamValue>,
{
    CacheKey::Query(QueryKey {
        text: Arc::from(normalize_query_text(query_text)),
        params: params.into_iter().map(Into::into).collect(),
    })
}

/// Name of the region holding collection `role` of `owner_entity`.
pub fn collection_region_name(owner_entity: &str, role: &str) -> String {
    format!("{owner_entity}.{role}")
}

/// Trim the statement and collapse whitespace runs outside single-quoted literals.
pub fn normalize_query_text(text: &str) -> String {
    let mut normalized = String::with_capacity(text.len());
    let mut in_literal = false;
    let mut pending_space = false;

    for ch in text.trim().chars() {
        if in_literal {
            normalized.push(ch);
            if ch == '\'' {
                in_literal = false;
            }
            continue;
        }

        if ch.is_whitespace() {
            pending_space = true;
            continue;
        }

        if pending_space {
            normalized.push(' ');
            pending_space = false;
        }
        if ch == '\'' {
            in_literal = true;
        }
        normalized.push(ch);
    }

    normalized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_key_equality() {
        assert_eq!(entity_key("Post", 1), entity_key("Post", 1i64));
        assert_ne!(entity_key("Post", 1), entity_key("Post", 2));
        assert_ne!(entity_key("Post", 1), entity_key("PostComment", 1));
    }

    #[test]
    fn namespaces_never_collide() {
        let entity = entity_key("Post", 1);
        let collection = collection_key("Post", "comments", 1);
        assert_ne!(entity, collection);
        assert_eq!(entity.namespace(), KeyNamespace::Entity);
        assert_eq!(collection.namespace(), KeyNamespace::Collection);

        // Same role string under different owners is a different key.
        assert_ne!(
            collection_key("Post", "comments", 1),
            collection_key("Page", "comments", 1)
        );
    }

    #[test]
    fn numeric_parameters_normalize() {
        let a = query_key("select p from Post p where p.id = :id", [ParamValue::from(1i32)]);
        let b = query_key("select p from Post p where p.id = :id", [ParamValue::from(1u64)]);
        let c = query_key("select p from Post p where p.id = :id", [ParamValue::from(1.0f64)]);
        assert_eq!(a, b);
        assert_eq!(b, c);
        assert_eq!(ParamValue::from(-0.0f64), ParamValue::Int(0));
        assert_eq!(ParamValue::from(f64::NAN), ParamValue::from(-f64::NAN));
        assert_ne!(ParamValue::from(1.5f64), ParamValue::from(1i64));
    }

    #[test]
    fn unsigned_parameters_above_i64_stay_numeric() {
        let big = ParamValue::from(u64::MAX);
        assert_eq!(big, ParamValue::UInt(u64::MAX));
        assert_ne!(
            query_key("q", [big]),
            query_key("q", [ParamValue::from(u64::MAX.to_string())])
        );

        let ten_pow_19 = 10_000_000_000_000_000_000u64;
        assert_eq!(ParamValue::from(ten_pow_19), ParamValue::from(1e19f64));
        assert_eq!(
            ParamValue::from(ten_pow_19),
            ParamValue::from_json(&serde_json::json!(10_000_000_000_000_000_000u64))
        );
        assert_eq!(ParamValue::from(i64::MIN as f64), ParamValue::Int(i64::MIN));
        assert!(matches!(ParamValue::from(1e20f64), ParamValue::Float(_)));
    }

    #[test]
    fn string_and_number_parameters_stay_distinct() {
        let number = query_key("q", [ParamValue::from(1i64)]);
        let text = query_key("q", [ParamValue::from("1")]);
        assert_ne!(number, text);
    }

    #[test]
    fn json_parameters_match_native_ones() {
        let json = serde_json::json!([1.0, "Welcome to%", null, [2, 3.0]]);
        let from_json: Vec<ParamValue> = json
            .as_array()
            .expect("array")
            .iter()
            .map(ParamValue::from_json)
            .collect();
        let native = vec![
            ParamValue::from(1i64),
            ParamValue::from("Welcome to%"),
            ParamValue::Null,
            ParamValue::from(vec![2i64, 3]),
        ];
        assert_eq!(from_json, native);
    }

    #[test]
    fn query_text_whitespace_is_collapsed_outside_literals() {
        assert_eq!(
            normalize_query_text("  select p\n  from   Post_Query p where p.title like 'a  b' "),
            "select p from Post_Query p where p.title like 'a  b'"
        );

        let a = query_key("select p from Post p", Vec::<ParamValue>::new());
        let b = query_key("select p\n\tfrom Post p ", Vec::<ParamValue>::new());
        assert_eq!(a, b);
    }

    #[test]
    fn parameter_order_matters() {
        let a = query_key("q", [ParamValue::from(1i64), ParamValue::from(2i64)]);
        let b = query_key("q", [ParamValue::from(2i64), ParamValue::from(1i64)]);
        assert_ne!(a, b);
    }

    #[test]
    fn digest_is_stable_and_distinguishes_params() {
        let a = query_key("q", [ParamValue::from("x")]);
        let b = query_key("q", [ParamValue::from("x")]);
        let c = query_key("q", [ParamValue::from("y")]);
        let digest = |key: &CacheKey| key.as_query().expect("query key").digest();
        assert_eq!(digest(&a), digest(&b));
        assert_ne!(digest(&a), digest(&c));
        assert_eq!(digest(&a).len(), 64);
    }

    #[test]
    fn display_is_readable() {
        assert_eq!(entity_key("Post", 1).to_string(), "Post#1");
        assert_eq!(
            collection_key("Post", "comments", 1).to_string(),
            "Post.comments#1"
        );
        assert_eq!(entity_key("Tag", "rust").to_string(), "Tag#\"rust\"");
        assert!(query_key("q", [1i64]).to_string().starts_with("query:"));
    }
}
