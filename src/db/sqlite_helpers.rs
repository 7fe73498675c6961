//! SQLite helper utilities for type conversion
//!
//! SQLite doesn't natively support JSONB or native booleans like PostgreSQL.
//! This module provides utilities to convert between Rust types and SQLite-compatible formats.

use anyhow::{Result, anyhow};
use serde::{Serialize, de::DeserializeOwned};

// ============================================================================
// JSONB/JSON Helpers (stored as TEXT in SQLite)
// ============================================================================

/// Serialize any serializable value to a JSON string
#[inline]
pub fn to_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

/// Deserialize a JSON string to a value
#[inline]
pub fn from_json<T: DeserializeOwned>(s: &str) -> Result<T> {
    serde_json::from_str(s).map_err(|e| anyhow!("JSON parse error: {}", e))
}

/// Deserialize an optional JSON string
#[inline]
pub fn from_json_opt<T: DeserializeOwned>(s: Option<&str>) -> Result<Option<T>> {
    match s {
        Some(s) if !s.is_empty() && s != "null" => Ok(Some(from_json(s)?)),
        _ => Ok(None),
    }
}

// ============================================================================
// Timestamp Helpers (stored as ISO8601 TEXT in SQLite)
// ============================================================================

use chrono::{DateTime, Utc};

/// Get current UTC timestamp as ISO8601 string for SQLite
#[inline]
pub fn now_iso8601() -> String {
    Utc::now().to_rfc3339()
}

/// Convert a chrono DateTime to ISO8601 string
#[inline]
pub fn datetime_to_str(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

/// Parse an ISO8601 string to DateTime
#[inline]
pub fn str_to_datetime(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            // Try parsing SQLite's datetime() format: "YYYY-MM-DD HH:MM:SS"
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                .map(|ndt| ndt.and_utc())
                .map_err(|e| anyhow!("Invalid datetime '{}': {}", s, e))
        })
}

// ============================================================================
// Boolean Helpers (SQLite uses 0/1 integers)
// ============================================================================

/// Convert bool to SQLite integer (0 or 1)
#[inline]
pub fn bool_to_int(b: bool) -> i32 {
    if b { 1 } else { 0 }
}

/// Convert SQLite integer to bool
#[inline]
pub fn int_to_bool(i: i32) -> bool {
    i != 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;

    #[test]
    fn test_json_roundtrip() {
        let v = vec!["hello".to_string(), "world".to_string()];
        let json = to_json(&v);
        let parsed: Vec<String> = from_json(&json).unwrap();
        assert_eq!(v, parsed);
    }

    #[test]
    fn test_from_json_opt_treats_null_and_empty_as_none() {
        assert!(from_json_opt::<Vec<String>>(None).unwrap().is_none());
        assert!(from_json_opt::<Vec<String>>(Some("")).unwrap().is_none());
        assert!(from_json_opt::<Vec<String>>(Some("null")).unwrap().is_none());
    }

    #[test]
    fn test_datetime_roundtrip() {
        let dt = Utc::now();
        let s = datetime_to_str(dt);
        let parsed = str_to_datetime(&s).unwrap();
        // Compare to second precision (rfc3339 might have slight differences)
        assert_eq!(dt.timestamp(), parsed.timestamp());
    }

    #[test]
    fn test_sqlite_datetime_format() {
        let s = "2024-01-15 10:30:45";
        let parsed = str_to_datetime(s).unwrap();
        assert_eq!(parsed.year(), 2024);
        assert_eq!(parsed.month(), 1);
        assert_eq!(parsed.day(), 15);
    }

    #[test]
    fn test_bool_conversion() {
        assert_eq!(bool_to_int(true), 1);
        assert_eq!(bool_to_int(false), 0);
        assert!(int_to_bool(1));
        assert!(int_to_bool(42)); // Any non-zero is true
        assert!(!int_to_bool(0));
    }
}
