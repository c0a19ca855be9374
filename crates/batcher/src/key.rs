use std::fmt::{self, Write};
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Number, Value};
use sha2::{Digest, Sha256};

use crate::error::KeyError;

/// `2^63`, the first double past the range of `i64`.
const I64_END: f64 = 9_223_372_036_854_775_808.0;
/// `2^64`, the first double past the range of `u64`.
const U64_END: f64 = 18_446_744_073_709_551_616.0;

/// The normalized identity of a coalesced call.
///
/// A key is an ordered sequence of JSON values. It is encoded into a canonical
/// JSON array, its *identifier*, which is then hashed. Two keys are equal exactly when
/// their identifiers are equal:
///
/// - order of the sequence matters,
/// - order of object fields does not, fields are sorted by name,
/// - numbers compare by value, so `1` and `1.0` are the same key. This holds for every
///   integral float within the range of `i64` or `u64`.
#[derive(Debug, Clone, Eq)]
pub struct CacheKey {
    identifier: Arc<str>,
    hash: [u8; 32],
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl std::hash::Hash for CacheKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.identifier)
    }
}

impl CacheKey {
    /// Creates a [`CacheKey`] from anything that serializes to a sequence.
    ///
    /// Slices, `Vec`s, arrays and tuples all qualify:
    ///
    /// ```
    /// # use batcher::CacheKey;
    /// let key = CacheKey::new(&("repos", "rust-lang/rust", 42)).unwrap();
    /// assert_eq!(key.identifier(), r#"["repos","rust-lang/rust",42]"#);
    /// ```
    pub fn new<K: Serialize + ?Sized>(key: &K) -> Result<Self, KeyError> {
        match serde_json::to_value(key)? {
            Value::Array(values) => Ok(Self::from_values(&values)),
            other => Err(KeyError::NotASequence(value_kind(&other))),
        }
    }

    /// Creates a [`CacheKey`] from already materialized JSON values.
    pub fn from_values(values: &[Value]) -> Self {
        let mut builder = Self::builder();
        for value in values {
            builder.push_value(value);
        }
        builder.build()
    }

    /// Create a [`CacheKeyBuilder`] that accepts the parts of a key one by one.
    pub fn builder() -> CacheKeyBuilder {
        CacheKeyBuilder {
            identifier: String::from("["),
            parts: 0,
        }
    }

    /// Returns the canonical JSON encoding of this key.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Returns a short hex digest of this key, suitable for log lines.
    pub fn digest(&self) -> String {
        let mut digest = String::with_capacity(16);
        for b in &self.hash[..8] {
            let _ = write!(digest, "{b:02x}");
        }
        digest
    }
}

/// A builder for [`CacheKey`]s.
///
/// Every pushed part becomes one element of the key sequence.
#[derive(Debug)]
pub struct CacheKeyBuilder {
    identifier: String,
    parts: usize,
}

impl CacheKeyBuilder {
    /// Appends any serializable value as the next part of the key.
    pub fn push<V: Serialize + ?Sized>(&mut self, value: &V) -> Result<&mut Self, KeyError> {
        let value = serde_json::to_value(value)?;
        Ok(self.push_value(&value))
    }

    /// Appends a JSON value as the next part of the key.
    pub fn push_value(&mut self, value: &Value) -> &mut Self {
        if self.parts > 0 {
            self.identifier.push(',');
        }
        write_canonical(&mut self.identifier, value);
        self.parts += 1;
        self
    }

    /// Finalize the [`CacheKey`].
    pub fn build(mut self) -> CacheKey {
        self.identifier.push(']');
        let hash = Sha256::digest(self.identifier.as_bytes()).into();

        CacheKey {
            identifier: self.identifier.into(),
            hash,
        }
    }
}

/// Writes `value` as JSON, sorting object fields and normalizing numbers.
fn write_canonical(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(number) => write_number(out, number),
        Value::String(s) => write_string(out, s),
        Value::Array(values) => {
            out.push('[');
            for (i, value) in values.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(out, value);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut fields: Vec<_> = map.iter().collect();
            fields.sort_unstable_by(|a, b| a.0.cmp(b.0));

            out.push('{');
            for (i, (name, value)) in fields.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(out, name);
                out.push(':');
                write_canonical(out, value);
            }
            out.push('}');
        }
    }
}

fn write_number(out: &mut String, number: &Number) {
    if number.is_f64() {
        if let Some(f) = number.as_f64() {
            if f.fract() == 0.0 {
                // the casts are exact inside these ranges, `-0.0` folds into `0`
                if (-I64_END..I64_END).contains(&f) {
                    let _ = write!(out, "{}", f as i64);
                    return;
                }
                if (0.0..U64_END).contains(&f) {
                    let _ = write!(out, "{}", f as u64);
                    return;
                }
            }
        }
    }
    let _ = write!(out, "{number}");
}

fn write_string(out: &mut String, s: &str) {
    // serializing a `str` into JSON cannot fail
    match serde_json::to_string(s) {
        Ok(escaped) => out.push_str(&escaped),
        Err(_) => out.push_str("null"),
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a sequence",
        Value::Object(_) => "an object",
    }
}
