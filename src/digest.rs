//! Stable digests over a row's comparison attribute set.
//!
//! Change detection compares digests instead of walking attribute maps.
//! The encoding is `name=canonical(value)` joined by a unit separator, in
//! the order the comparison set is declared, hashed with blake3.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::value::{Attributes, Value};

/// blake3 digest of a comparison attribute set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowDigest([u8; 32]);

impl RowDigest {
    /// Digests `names` (in order) from `attributes`. Missing attributes hash as null.
    #[must_use]
    pub fn of<'a>(attributes: &Attributes, names: impl IntoIterator<Item = &'a str>) -> Self {
        let mut hasher = blake3::Hasher::new();
        for name in names {
            let canonical = attributes
                .get(name)
                .map_or_else(|| Value::Null.canonical(), Value::canonical);
            hasher.update(name.as_bytes());
            hasher.update(b"=");
            hasher.update(canonical.as_bytes());
            hasher.update(&[0x1f]);
        }
        Self(*hasher.finalize().as_bytes())
    }

    /// Raw digest bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for RowDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}
