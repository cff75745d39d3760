//! Shared data-model types: catalog identifiers and cache keys (§3).

use std::fmt;

/// An opaque hierarchical identifier:
/// `"<scheme>:<partition>:<service>:<region>:<account>:<name>"`.
///
/// Treated as an ordered sequence of six fields; equality is field-wise.
/// Used as a cache-key prefix via [`CatalogId::as_str`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CatalogId {
    raw: String,
    fields: [String; 6],
}

impl CatalogId {
    /// Parse a catalog id of the form
    /// `scheme:partition:service:region:account:name`.
    pub fn parse(raw: impl Into<String>) -> Result<Self, CatalogIdError> {
        let raw = raw.into();
        let parts: Vec<&str> = raw.splitn(6, ':').collect();
        if parts.len() != 6 {
            return Err(CatalogIdError::WrongFieldCount(parts.len()));
        }
        let fields = [
            parts[0].to_string(),
            parts[1].to_string(),
            parts[2].to_string(),
            parts[3].to_string(),
            parts[4].to_string(),
            parts[5].to_string(),
        ];
        Ok(CatalogId { raw, fields })
    }

    /// The full string representation, usable as a cache-key prefix.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The `<scheme>` field.
    pub fn scheme(&self) -> &str {
        &self.fields[0]
    }

    /// The `<partition>` field.
    pub fn partition(&self) -> &str {
        &self.fields[1]
    }

    /// The `<service>` field.
    pub fn service(&self) -> &str {
        &self.fields[2]
    }

    /// The `<region>` field.
    pub fn region(&self) -> &str {
        &self.fields[3]
    }

    /// The `<account>` field.
    pub fn account(&self) -> &str {
        &self.fields[4]
    }

    /// The `<name>` field.
    pub fn name(&self) -> &str {
        &self.fields[5]
    }
}

impl fmt::Display for CatalogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

/// Error parsing a [`CatalogId`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum CatalogIdError {
    /// The id did not split into exactly six colon-separated fields.
    #[error("catalog id must have 6 colon-separated fields, got {0}")]
    WrongFieldCount(usize),
}

/// `"<catalog>::<segment₁>::…::<segmentₙ>"`.
///
/// Segments are component-chosen (e.g. `"api"`, `"quadtree"`, `"Data"`,
/// `"partition::<id>"`); the trailing segment identifies the artifact kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Build a key from a catalog id and an ordered list of segments.
    pub fn new(catalog: &CatalogId, segments: &[&str]) -> Self {
        let mut key = catalog.as_str().to_string();
        for segment in segments {
            key.push_str("::");
            key.push_str(segment);
        }
        CacheKey(key)
    }

    /// Build a key directly from an already-formatted string (used when
    /// round-tripping keys read back from a persistent layer).
    pub fn from_raw(raw: impl Into<String>) -> Self {
        CacheKey(raw.into())
    }

    /// The key's prefix, i.e. everything up to and including the catalog id,
    /// usable with [`crate::cache::DefaultCache::remove_with_prefix`].
    pub fn catalog_prefix(catalog: &CatalogId) -> String {
        catalog.as_str().to_string()
    }

    /// Borrow the underlying string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Cache key for an API lookup entry: `"<catalog>::<service>::<version>::api"`.
pub fn api_cache_key(catalog: &CatalogId, service: &str, version: &str) -> CacheKey {
    CacheKey::new(catalog, &[service, version, "api"])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_six_fields() {
        let id = CatalogId::parse("here:here-cn:config:eu:realm:my-catalog").unwrap();
        assert_eq!(id.scheme(), "here");
        assert_eq!(id.partition(), "here-cn");
        assert_eq!(id.service(), "config");
        assert_eq!(id.region(), "eu");
        assert_eq!(id.account(), "realm");
        assert_eq!(id.name(), "my-catalog");
    }

    #[test]
    fn rejects_wrong_field_count() {
        assert!(CatalogId::parse("too:few:fields").is_err());
    }

    #[test]
    fn cache_key_formats_segments() {
        let id = CatalogId::parse("here:here-cn:config:eu:realm:my-catalog").unwrap();
        let key = CacheKey::new(&id, &["quadtree", "partition::123"]);
        assert_eq!(
            key.as_str(),
            "here:here-cn:config:eu:realm:my-catalog::quadtree::partition::123"
        );
    }

    #[test]
    fn api_cache_key_matches_spec_layout() {
        let id = CatalogId::parse("here:here-cn:config:eu:realm:my-catalog").unwrap();
        let key = api_cache_key(&id, "metadata", "v1");
        assert_eq!(
            key.as_str(),
            "here:here-cn:config:eu:realm:my-catalog::metadata::v1::api"
        );
    }
}
