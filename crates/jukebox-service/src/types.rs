use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, de};

use crate::error::FetchError;

/// The longest key accepted.
pub const MAX_KEY_LEN: usize = 64;

/// Identifies one unit of fetchable content, such as a video id.
///
/// Keys consist of 1 to [`MAX_KEY_LEN`] ASCII alphanumerics, `-` and `_`, so they can be
/// embedded into file names and URLs as they are.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct FetchKey(String);

impl FetchKey {
    /// Validates `raw` and wraps it into a key.
    pub fn parse(raw: &str) -> Result<Self, FetchError> {
        if raw.is_empty() || raw.len() > MAX_KEY_LEN {
            return Err(FetchError::InvalidKey(format!(
                "key must have between 1 and {MAX_KEY_LEN} characters"
            )));
        }
        if let Some(c) = raw
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
        {
            return Err(FetchError::InvalidKey(format!(
                "unexpected character {c:?} in key"
            )));
        }
        Ok(Self(raw.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FetchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for FetchKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for FetchKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl FromStr for FetchKey {
    type Err = FetchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl<'de> Deserialize<'de> for FetchKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_keys() {
        for raw in ["abc123", "dQw4w9WgXcQ", "a-b_c", "Z"] {
            assert_eq!(FetchKey::parse(raw).unwrap().as_str(), raw);
        }
        let longest = "x".repeat(MAX_KEY_LEN);
        assert!(FetchKey::parse(&longest).is_ok());
    }

    #[test]
    fn test_invalid_keys() {
        let too_long = "x".repeat(MAX_KEY_LEN + 1);
        let invalid = [
            "",
            "../etc/passwd",
            "a/b",
            "a.mp3",
            "with space",
            "ümlaut",
            too_long.as_str(),
        ];
        for raw in invalid {
            assert!(
                matches!(FetchKey::parse(raw), Err(FetchError::InvalidKey(_))),
                "{raw:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_deserialize() {
        let key: FetchKey = serde_json::from_str(r#""abc123""#).unwrap();
        assert_eq!(key.as_str(), "abc123");
        assert!(serde_json::from_str::<FetchKey>(r#""a/b""#).is_err());
    }
}
