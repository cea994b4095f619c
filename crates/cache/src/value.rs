//! Conversion of analysis results into the portable value form
//!
//! `serde_json::to_value` maps NaN and infinities to `null`, which would make
//! a cached result read back differently from what was stored. Values are
//! instead encoded with MessagePack, which keeps the floats intact, and
//! rebuilt into a [`serde_json::Value`] by a visitor that rejects non-finite
//! numbers.

use crate::{Error, Result};
use serde::Serialize;
use serde::de::{self, Deserialize, Deserializer, MapAccess, SeqAccess, Visitor};
use serde_json::{Map, Number, Value};
use std::fmt;

/// Reduce `value` to a [`serde_json::Value`] that reads back unchanged
///
/// # Errors
///
/// Returns [`Error::Serialization`] if the value does not serialize or
/// contains a NaN or infinite float.
pub fn to_portable<T: Serialize + ?Sized>(value: &T) -> Result<Value> {
    let bytes = rmp_serde::to_vec_named(value)
        .map_err(|e| Error::serialization(format!("Value does not serialize: {e}")))?;
    rmp_serde::from_slice::<Portable>(&bytes)
        .map(|portable| portable.0)
        .map_err(|e| Error::serialization(e.to_string()))
}

struct Portable(Value);

impl<'de> Deserialize<'de> for Portable {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_any(PortableVisitor).map(Portable)
    }
}

struct PortableVisitor;

impl<'de> Visitor<'de> for PortableVisitor {
    type Value = Value;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a value with finite numbers")
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> std::result::Result<Value, E> {
        Ok(Value::Bool(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<Value, E> {
        Ok(Value::from(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<Value, E> {
        Ok(Value::from(v))
    }

    fn visit_f32<E: de::Error>(self, v: f32) -> std::result::Result<Value, E> {
        self.visit_f64(f64::from(v))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<Value, E> {
        Number::from_f64(v)
            .map(Value::Number)
            .ok_or_else(|| E::custom(format!("non-finite float {v} cannot be cached")))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Value, E> {
        Ok(Value::String(v.to_owned()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> std::result::Result<Value, E> {
        Ok(Value::String(v))
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> std::result::Result<Value, E> {
        Ok(Value::Array(v.iter().map(|b| Value::from(*b)).collect()))
    }

    fn visit_unit<E: de::Error>(self) -> std::result::Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_none<E: de::Error>(self) -> std::result::Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> std::result::Result<Value, D::Error> {
        deserializer.deserialize_any(self)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<Value, A::Error> {
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(Portable(item)) = seq.next_element()? {
            items.push(item);
        }
        Ok(Value::Array(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<Value, A::Error> {
        let mut object = Map::new();
        while let Some((Portable(key), Portable(value))) = map.next_entry()? {
            let key = match key {
                Value::String(s) => s,
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                other => {
                    return Err(de::Error::custom(format!(
                        "map key {other} cannot be cached"
                    )));
                }
            };
            object.insert(key, value);
        }
        Ok(Value::Object(object))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    #[derive(Serialize)]
    struct Features {
        tempo: f64,
        mfcc: Vec<f32>,
        key: Option<String>,
        is_percussive: bool,
    }

    #[test]
    fn struct_matches_json_value() {
        let features = Features {
            tempo: 0.5,
            mfcc: vec![1.25, -3.0],
            key: None,
            is_percussive: true,
        };
        assert_eq!(
            to_portable(&features).unwrap(),
            serde_json::to_value(&features).unwrap()
        );
    }

    #[test]
    fn nested_values_pass_through() {
        let value = json!({"a": [1, -2, 3.5, "x", null], "b": {"c": [[0.25]]}});
        assert_eq!(to_portable(&value).unwrap(), value);
    }

    #[test]
    fn integer_map_keys_become_strings() {
        let bands: BTreeMap<u32, f64> = [(1, 0.5), (2, 0.75)].into_iter().collect();
        assert_eq!(to_portable(&bands).unwrap(), json!({"1": 0.5, "2": 0.75}));
    }

    #[test]
    fn non_finite_floats_are_rejected() {
        let silent = Features {
            tempo: f64::NAN,
            mfcc: vec![1.0, f32::INFINITY],
            key: None,
            is_percussive: false,
        };
        let err = to_portable(&silent).unwrap_err();
        assert!(matches!(err, Error::Serialization { .. }));
        assert!(err.to_string().contains("non-finite"));

        assert!(to_portable(&vec![f64::NEG_INFINITY]).is_err());
    }
}
