//! The `noarch` field of a package record.
//!
//! Grounded on `rattler_conda_types::NoArchType`: old-style `repodata.json`
//! encodes `noarch` as a plain boolean (`true` meaning "generic"), while
//! modern repodata and shards encode it as the string `"python"` or
//! `"generic"`. Both forms must deserialize to the same in-memory type.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// The kind of architecture-independence a package declares.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum NoArchType {
    /// Platform independent, but requires a Python interpreter to finish
    /// installation (compiling `.pyc` files).
    Python,
    /// Platform independent with no further install-time work required.
    Generic,
}

impl NoArchType {
    /// Returns `true` for [`NoArchType::Python`].
    pub fn is_python(self) -> bool {
        matches!(self, NoArchType::Python)
    }

    /// Returns `true` for [`NoArchType::Generic`].
    pub fn is_generic(self) -> bool {
        matches!(self, NoArchType::Generic)
    }
}

impl<'de> Deserialize<'de> for NoArchType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Bool(bool),
            Str(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Bool(true) => Ok(NoArchType::Generic),
            Repr::Bool(false) => Err(serde::de::Error::custom(
                "noarch: false does not name a NoArchType; use the optional field instead",
            )),
            Repr::Str(s) if s.eq_ignore_ascii_case("python") => Ok(NoArchType::Python),
            Repr::Str(s) if s.eq_ignore_ascii_case("generic") => Ok(NoArchType::Generic),
            Repr::Str(other) => Err(serde::de::Error::custom(format!(
                "unrecognized noarch value: {other}"
            ))),
        }
    }
}

impl Serialize for NoArchType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            NoArchType::Python => "python".serialize(serializer),
            NoArchType::Generic => "generic".serialize(serializer),
        }
    }
}

/// Deserializes an `Option<NoArchType>` where the field may be entirely
/// absent, `null`, `false`, `true`, `"python"` or `"generic"`.
pub fn deserialize_optional_noarch<'de, D>(
    deserializer: D,
) -> Result<Option<NoArchType>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Bool(bool),
        Str(String),
        Null,
    }

    match Option::<Repr>::deserialize(deserializer)? {
        None | Some(Repr::Null) => Ok(None),
        Some(Repr::Bool(false)) => Ok(None),
        Some(Repr::Bool(true)) => Ok(Some(NoArchType::Generic)),
        Some(Repr::Str(s)) if s.eq_ignore_ascii_case("python") => Ok(Some(NoArchType::Python)),
        Some(Repr::Str(s)) if s.eq_ignore_ascii_case("generic") => Ok(Some(NoArchType::Generic)),
        Some(Repr::Str(other)) => Err(serde::de::Error::custom(format!(
            "unrecognized noarch value: {other}"
        ))),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Deserialize)]
    struct Wrapper {
        #[serde(default, deserialize_with = "deserialize_optional_noarch")]
        noarch: Option<NoArchType>,
    }

    #[test]
    fn legacy_boolean_true_is_generic() {
        let w: Wrapper = serde_json::from_str(r#"{"noarch": true}"#).unwrap();
        assert_eq!(w.noarch, Some(NoArchType::Generic));
    }

    #[test]
    fn legacy_boolean_false_is_none() {
        let w: Wrapper = serde_json::from_str(r#"{"noarch": false}"#).unwrap();
        assert_eq!(w.noarch, None);
    }

    #[test]
    fn modern_strings() {
        let w: Wrapper = serde_json::from_str(r#"{"noarch": "python"}"#).unwrap();
        assert_eq!(w.noarch, Some(NoArchType::Python));
        let w: Wrapper = serde_json::from_str(r#"{"noarch": "generic"}"#).unwrap();
        assert_eq!(w.noarch, Some(NoArchType::Generic));
    }

    #[test]
    fn missing_field_is_none() {
        let w: Wrapper = serde_json::from_str(r#"{}"#).unwrap();
        assert_eq!(w.noarch, None);
    }
}
