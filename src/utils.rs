//! # Utilities

use crate::{Result, unexpected};

/// Normalize a protocol or schema URI for comparison and storage.
///
/// # Errors
///
/// Returns an error when the URI is empty.
pub fn clean_url(url: &str) -> Result<String> {
    let url = url.trim();
    if url.is_empty() {
        return Err(unexpected!("URI is empty"));
    }
    Ok(url.trim_end_matches('/').to_string())
}

/// Fixed-precision RFC 3339 timestamp serialization.
///
/// Message ordering compares serialized timestamps, so every message carries
/// the same precision: UTC with microseconds.
pub mod timestamp {
    use chrono::{DateTime, SecondsFormat::Micros, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize the timestamp as RFC 3339 UTC with microsecond precision.
    ///
    /// # Errors
    ///
    /// Returns a serializer error when writing fails.
    pub fn serialize<S: Serializer>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&date.to_rfc3339_opts(Micros, true))
    }

    /// Deserialize an RFC 3339 timestamp.
    ///
    /// # Errors
    ///
    /// Returns a deserializer error when the string is not valid RFC 3339.
    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<DateTime<Utc>, D::Error> {
        let s = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, SecondsFormat::Micros, Utc};

    use super::*;

    #[test]
    fn url_normalization() {
        assert_eq!(clean_url("https://example.com/email/").unwrap(), "https://example.com/email");
        assert_eq!(clean_url(" https://example.com ").unwrap(), "https://example.com");
        assert!(clean_url("  ").is_err());
    }

    #[test]
    fn timestamp_precision() {
        let now = Utc::now();
        let text = now.to_rfc3339_opts(Micros, true);
        let parsed: DateTime<Utc> = DateTime::parse_from_rfc3339(&text).unwrap().into();
        assert_eq!(parsed.to_rfc3339_opts(Micros, true), text);
    }
}
