use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid merkle path: {0:?}")]
pub struct InvalidPath(pub String);

/// Root-to-leaf position in a binary Merkle tree, e.g. `0/1/1`.
///
/// Each step is `0` (left child) or `1` (right child), slash-joined. The
/// empty string is not a path; a single-leaf tree uses `0`.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PathLine(String);

impl PathLine {
    pub fn from_bits(bits: impl IntoIterator<Item = bool>) -> Result<Self, InvalidPath> {
        let text = bits
            .into_iter()
            .map(|b| if b { "1" } else { "0" })
            .collect::<Vec<_>>()
            .join("/");
        if text.is_empty() {
            return Err(InvalidPath(text));
        }
        Ok(Self(text))
    }

    /// Steps from root to leaf; `false` is left, `true` is right.
    pub fn bits(&self) -> impl Iterator<Item = bool> + '_ {
        self.0.split('/').map(|s| s == "1")
    }

    pub fn depth(&self) -> usize {
        self.0.split('/').count()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PathLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for PathLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PathLine({})", self.0)
    }
}

impl FromStr for PathLine {
    type Err = InvalidPath;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(InvalidPath(s.to_string()));
        }
        if !s.split('/').all(|step| step == "0" || step == "1") {
            return Err(InvalidPath(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

impl Serialize for PathLine {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for PathLine {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}
