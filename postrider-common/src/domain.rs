//! Domain newtype for type safety.
//!
//! Wraps hostname strings so an email address or an arbitrary string cannot
//! be passed where a domain is expected. Blacklists, rate limits and the
//! resolver cache are all keyed by this type.

use std::{
    fmt::{self, Display},
    ops::Deref,
    sync::Arc,
};

use serde::{Deserialize, Deserializer, Serialize};

/// A lowercased domain name.
///
/// Cheap to clone (`Arc<str>` inside) since the same hostname travels
/// through every pipeline stage and keys several shared maps.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct Domain(Arc<str>);

impl<'de> Deserialize<'de> for Domain {
    // routed through `new` so deserialized domains keep the lowercase invariant
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        String::deserialize(deserializer).map(Self::new)
    }
}

impl Domain {
    #[must_use]
    pub fn new(s: impl AsRef<str>) -> Self {
        Self(Arc::from(s.as_ref().to_ascii_lowercase()))
    }

    /// Builds a domain from a DNS answer, trimming the trailing root dot
    /// (`mx.example.org.` → `mx.example.org`).
    #[must_use]
    pub fn from_dns(name: &str) -> Self {
        Self::new(name.trim_end_matches('.'))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Domain {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Deref for Domain {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<&str> for Domain {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Domain {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}
