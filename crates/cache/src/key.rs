//! Deterministic cache keys for downloaded resources
//!
//! A key is `"<source_id>-<record_id>"`. When the originating request carried
//! the [`OPTION_ARGUMENT`] property, which selects a different byte stream for
//! the same record (a thumbnail rendition, say), the key gets an
//! `"_OptionArgument-<value>"` suffix. No other request property takes part.

use crate::{Error, Result};
use std::collections::BTreeMap;

/// Request property name that selects an alternate rendition of a record
pub const OPTION_ARGUMENT: &str = "OPTION_ARGUMENT";

const OPTION_SUFFIX: &str = "_OptionArgument-";

/// Inputs that identify one cached resource
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    source_id: String,
    record_id: String,
    option: Option<String>,
}

impl CacheKey {
    /// Build a key for a record without a rendition option
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if either id is empty.
    pub fn new(source_id: impl Into<String>, record_id: impl Into<String>) -> Result<Self> {
        let source_id = source_id.into();
        let record_id = record_id.into();
        if source_id.trim().is_empty() {
            return Err(Error::invalid_argument("source id must not be empty"));
        }
        if record_id.trim().is_empty() {
            return Err(Error::invalid_argument("record id must not be empty"));
        }
        Ok(Self {
            source_id,
            record_id,
            option: None,
        })
    }

    /// Apply a request property. Only [`OPTION_ARGUMENT`] with a non-empty
    /// value changes the key; anything else is ignored.
    #[must_use]
    pub fn with_request_property(mut self, name: &str, value: &str) -> Self {
        if name == OPTION_ARGUMENT && !value.is_empty() {
            self.option = Some(value.to_string());
        }
        self
    }

    /// Build a key from the full property map of a resource request
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if either id is empty.
    pub fn from_request(
        source_id: impl Into<String>,
        record_id: impl Into<String>,
        properties: &BTreeMap<String, String>,
    ) -> Result<Self> {
        let key = Self::new(source_id, record_id)?;
        Ok(match properties.get(OPTION_ARGUMENT) {
            Some(value) => key.with_request_property(OPTION_ARGUMENT, value),
            None => key,
        })
    }

    /// The rendition option, if the request carried one
    #[must_use]
    pub fn option(&self) -> Option<&str> {
        self.option.as_deref()
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.source_id, self.record_id)?;
        if let Some(option) = &self.option {
            write!(f, "{OPTION_SUFFIX}{option}")?;
        }
        Ok(())
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.to_string()
    }
}

/// Compute the string key for `(source_id, record_id)` and an optional request
/// property. Pass empty strings when the request carried no property.
///
/// # Errors
///
/// Returns [`Error::InvalidArgument`] if `source_id` or `record_id` is empty.
pub fn generate_key(
    source_id: &str,
    record_id: &str,
    option_name: &str,
    option_value: &str,
) -> Result<String> {
    Ok(CacheKey::new(source_id, record_id)?
        .with_request_property(option_name, option_value)
        .to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_key() {
        assert_eq!(generate_key("src1", "rec1", "", "").unwrap(), "src1-rec1");
    }

    #[test]
    fn test_option_argument_suffix() {
        let key = generate_key("src1", "rec1", OPTION_ARGUMENT, "thumbnail").unwrap();
        assert_eq!(key, "src1-rec1_OptionArgument-thumbnail");
        assert_ne!(key, generate_key("src1", "rec1", "", "").unwrap());
    }

    #[test]
    fn test_unrecognized_property_is_ignored() {
        let key = generate_key("src1", "rec1", "username", "alice").unwrap();
        assert_eq!(key, "src1-rec1");
    }

    #[test]
    fn test_empty_option_value_is_ignored() {
        let key = generate_key("src1", "rec1", OPTION_ARGUMENT, "").unwrap();
        assert_eq!(key, "src1-rec1");
    }

    #[test]
    fn test_empty_ids_rejected() {
        assert!(matches!(
            generate_key("", "rec1", "", ""),
            Err(Error::InvalidArgument { .. })
        ));
        assert!(matches!(
            generate_key("src1", "  ", "", ""),
            Err(Error::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_from_request_uses_only_option_argument() {
        let mut props = BTreeMap::new();
        props.insert("username".to_string(), "alice".to_string());
        props.insert("checksum".to_string(), "abc".to_string());
        let plain = CacheKey::from_request("src1", "rec1", &props).unwrap();
        assert_eq!(plain.to_string(), "src1-rec1");
        assert_eq!(plain.option(), None);

        props.insert(OPTION_ARGUMENT.to_string(), "overview".to_string());
        let with_option = CacheKey::from_request("src1", "rec1", &props).unwrap();
        assert_eq!(with_option.to_string(), "src1-rec1_OptionArgument-overview");
        assert_eq!(with_option.option(), Some("overview"));
    }

    #[test]
    fn test_key_is_deterministic() {
        let a = generate_key("src1", "rec1", OPTION_ARGUMENT, "thumbnail").unwrap();
        let b = generate_key("src1", "rec1", OPTION_ARGUMENT, "thumbnail").unwrap();
        assert_eq!(a, b);
    }
}
