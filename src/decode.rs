//! Decoding of script output into typed results.
//!
//! PowerShell's `ConvertTo-Json` does not promise stable key casing, and
//! lookup scripts signal "not found" with `{}` or no output at all. The
//! decoder maps keys onto struct fields ignoring ASCII case and underscores
//! (`ParentPath` fills `parent_path`), drops `null`
//! members so `#[serde(default)]` applies, and accepts a lone value where a
//! sequence is expected (PowerShell unwraps single-element arrays).

use serde::de::value::StringDeserializer;
use serde::de::{
    self, DeserializeOwned, DeserializeSeed, IntoDeserializer, MapAccess, SeqAccess, Visitor,
};
use serde::forward_to_deserialize_any;
use serde_json::{Map, Value};

use crate::error::HypervError;

/// Decodes `stdout` into `T`.
///
/// Empty output, whitespace, `null`, and `{}` all yield `T::default()`.
///
/// # Errors
///
/// Returns [`HypervError::Decode`] carrying the raw payload when the output
/// is not valid JSON or does not fit `T`.
pub fn decode<T>(script: &str, stdout: &str) -> Result<T, HypervError>
where
    T: DeserializeOwned + Default,
{
    let payload = stdout.trim_start_matches('\u{feff}').trim();
    if payload.is_empty() {
        return Ok(T::default());
    }
    let value: Value = serde_json::from_str(payload).map_err(|err| HypervError::Decode {
        script: script.to_owned(),
        message: err.to_string(),
        payload: stdout.to_owned(),
    })?;
    let absent = match &value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    };
    if absent {
        return Ok(T::default());
    }
    T::deserialize(CaseInsensitive(value)).map_err(|err| HypervError::Decode {
        script: script.to_owned(),
        message: err.to_string(),
        payload: stdout.to_owned(),
    })
}

/// Deserializer adapter matching object keys to struct field names.
struct CaseInsensitive(Value);

impl CaseInsensitive {
    fn entries(map: Map<String, Value>, fields: Option<&[&str]>) -> Entries {
        let entries: Vec<(String, Value)> = map
            .into_iter()
            .filter(|(_, value)| fields.is_none() || !value.is_null())
            .map(|(key, value)| {
                let canonical = fields
                    .and_then(|names| names.iter().find(|name| same_key(name, &key)))
                    .map_or(key, |name| (*name).to_owned());
                (canonical, value)
            })
            .collect();
        Entries {
            iter: entries.into_iter(),
            pending: None,
        }
    }
}

fn same_key(field: &str, key: &str) -> bool {
    let normalise = |text: &str| {
        text.chars()
            .filter(|ch| *ch != '_')
            .map(|ch| ch.to_ascii_lowercase())
            .collect::<String>()
    };
    normalise(field) == normalise(key)
}

impl<'de> de::Deserializer<'de> for CaseInsensitive {
    type Error = serde_json::Error;

    fn deserialize_any<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        match self.0 {
            Value::Object(map) => visitor.visit_map(Self::entries(map, None)),
            Value::Array(items) => visitor.visit_seq(Elements(items.into_iter())),
            other => de::Deserializer::deserialize_any(other, visitor),
        }
    }

    fn deserialize_option<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        match self.0 {
            Value::Null => visitor.visit_none(),
            other => visitor.visit_some(Self(other)),
        }
    }

    fn deserialize_seq<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        match self.0 {
            Value::Array(items) => visitor.visit_seq(Elements(items.into_iter())),
            Value::Null => visitor.visit_seq(Elements(Vec::new().into_iter())),
            single => visitor.visit_seq(Elements(vec![single].into_iter())),
        }
    }

    fn deserialize_struct<V: Visitor<'de>>(
        self,
        name: &'static str,
        fields: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        match self.0 {
            Value::Object(map) => visitor.visit_map(Self::entries(map, Some(fields))),
            other => de::Deserializer::deserialize_struct(other, name, fields, visitor),
        }
    }

    fn deserialize_newtype_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_enum<V: Visitor<'de>>(
        self,
        name: &'static str,
        variants: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        de::Deserializer::deserialize_enum(self.0, name, variants, visitor)
    }

    forward_to_deserialize_any! {
        bool i8 i16 i32 i64 i128 u8 u16 u32 u64 u128 f32 f64 char str string
        bytes byte_buf unit unit_struct tuple tuple_struct map identifier ignored_any
    }
}

struct Entries {
    iter: std::vec::IntoIter<(String, Value)>,
    pending: Option<Value>,
}

impl<'de> MapAccess<'de> for Entries {
    type Error = serde_json::Error;

    fn next_key_seed<K: DeserializeSeed<'de>>(
        &mut self,
        seed: K,
    ) -> Result<Option<K::Value>, Self::Error> {
        let Some((key, value)) = self.iter.next() else {
            return Ok(None);
        };
        self.pending = Some(value);
        let key_de: StringDeserializer<Self::Error> = key.into_deserializer();
        seed.deserialize(key_de).map(Some)
    }

    fn next_value_seed<V: DeserializeSeed<'de>>(
        &mut self,
        seed: V,
    ) -> Result<V::Value, Self::Error> {
        let value = self
            .pending
            .take()
            .ok_or_else(|| {
                <serde_json::Error as de::Error>::custom("map value requested before its key")
            })?;
        seed.deserialize(CaseInsensitive(value))
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.iter.len())
    }
}

struct Elements(std::vec::IntoIter<Value>);

impl<'de> SeqAccess<'de> for Elements {
    type Error = serde_json::Error;

    fn next_element_seed<T: DeserializeSeed<'de>>(
        &mut self,
        seed: T,
    ) -> Result<Option<T::Value>, Self::Error> {
        self.0
            .next()
            .map(|value| seed.deserialize(CaseInsensitive(value)))
            .transpose()
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.0.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde::Deserialize;

    #[derive(Debug, Default, Deserialize, PartialEq, Eq)]
    #[serde(default)]
    struct Disk {
        path: String,
        size: u64,
        parent_path: String,
        attached: bool,
        tags: Vec<String>,
        owner: Option<Owner>,
    }

    #[derive(Debug, Default, Deserialize, PartialEq, Eq)]
    #[serde(default)]
    struct Owner {
        name: String,
    }

    #[rstest]
    #[case("")]
    #[case("   \r\n")]
    #[case("{}")]
    #[case(" { } \r\n")]
    #[case("\u{feff}{}")]
    #[case("null")]
    fn absent_payloads_decode_to_default(#[case] stdout: &str) {
        let disk: Disk = decode("get_vhd", stdout).expect("absent payload should decode");
        assert_eq!(disk, Disk::default());
    }

    #[test]
    fn keys_match_case_insensitively() {
        let stdout = r#"{"PATH":"C:\\d.vhdx","Size":4096,"parent_PATH":"C:\\p.vhdx","ATTACHED":true,"Tags":["a"],"Owner":{"NAME":"ops"}}"#;
        let disk: Disk = decode("get_vhd", stdout).expect("payload should decode");
        assert_eq!(
            disk,
            Disk {
                path: String::from("C:\\d.vhdx"),
                size: 4096,
                parent_path: String::from("C:\\p.vhdx"),
                attached: true,
                tags: vec![String::from("a")],
                owner: Some(Owner {
                    name: String::from("ops"),
                }),
            }
        );
    }

    #[test]
    fn nulls_fall_back_to_defaults() {
        let disk: Disk = decode("get_vhd", r#"{"Path":"x","ParentPath":null,"Tags":null}"#)
            .expect("nulls should be tolerated");
        assert_eq!(disk.path, "x");
        assert!(disk.parent_path.is_empty());
        assert!(disk.tags.is_empty());
    }

    #[test]
    fn single_object_decodes_as_one_element_list() {
        let disks: Vec<Disk> = decode("get_drives", r#"{"path":"a"}"#).expect("object as list");
        assert_eq!(disks.len(), 1);
        assert_eq!(disks.first().map(|d| d.path.as_str()), Some("a"));
    }

    #[test]
    fn lone_scalar_fills_a_list_field() {
        let disk: Disk = decode("get_switch", r#"{"Path":"x","Tags":"only"}"#)
            .expect("scalar as list");
        assert_eq!(disk.tags, ["only"]);
    }

    #[test]
    fn arrays_decode_element_wise() {
        let disks: Vec<Disk> =
            decode("get_drives", r#"[{"PATH":"a"},{"path":"b"}]"#).expect("array should decode");
        let paths: Vec<&str> = disks.iter().map(|d| d.path.as_str()).collect();
        assert_eq!(paths, ["a", "b"]);
    }

    #[rstest]
    #[case(r#"{"Path":"C:\\d.vhdx""#)]
    #[case("Get-VHD : not found")]
    #[case(r#"{"Size":"big"}"#)]
    fn malformed_payloads_carry_raw_text(#[case] stdout: &str) {
        let err = decode::<Disk>("get_vhd", stdout).expect_err("payload must be rejected");
        let HypervError::Decode { payload, script, .. } = err else {
            panic!("expected a decode failure");
        };
        assert_eq!(payload, stdout);
        assert_eq!(script, "get_vhd");
    }
}
