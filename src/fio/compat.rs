//! fio/compat: build compatibility record exchanged at handshake.
//!
//! Serialized as "key=value\n" lines in insertion order. Peers compare the
//! serialized strings byte for byte; any drift is an incompatibility.

use std::fmt;

use crate::consts::{DEFAULT_EDITION, PG_MAJORVERSION, PG_VERSION_NUM};

pub const KEY_MAJOR: &str = "PG_MAJORVERSION";
pub const KEY_EDITION: &str = "edition";
pub const KEY_POINTER: &str = "SIZEOF_VOID_P";

/// Map a raw edition name to the one used for compatibility checks.
///
/// "1C" builds are vanilla-compatible. Releases 10..12 built as certified
/// "standard"/"enterprise" carry a "-certified" suffix.
pub fn normalize_edition(edition: &str, pg_version_num: u32, version_str: &str) -> String {
    if edition == "1C" {
        return DEFAULT_EDITION.to_string();
    }
    if pg_version_num < 100_000 {
        return edition.to_string();
    }
    let certified = version_str.contains("certified");
    if pg_version_num < 130_000 && certified && (edition == "standard" || edition == "enterprise") {
        return format!("{edition}-certified");
    }
    edition.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CompatibilityRecord {
    entries: Vec<(String, String)>,
}

impl CompatibilityRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record describing this build.
    pub fn local(pg_major_version: &str, edition: &str) -> Self {
        Self::new()
            .with(KEY_MAJOR, pg_major_version)
            .with(
                KEY_EDITION,
                normalize_edition(edition, PG_VERSION_NUM, PG_MAJORVERSION),
            )
            .with(KEY_POINTER, std::mem::size_of::<usize>().to_string())
    }

    /// Append or replace a key, keeping the original position.
    pub fn with<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.entries.push((key, value)),
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn serialize(&self) -> String {
        let mut s = String::new();
        for (k, v) in &self.entries {
            s.push_str(k);
            s.push('=');
            s.push_str(v);
            s.push('\n');
        }
        s
    }

    /// Lenient parse; lines without '=' are ignored.
    pub fn parse(s: &str) -> Self {
        let mut rec = Self::new();
        for line in s.lines() {
            if let Some((k, v)) = line.split_once('=') {
                rec.entries.push((k.to_string(), v.to_string()));
            }
        }
        rec
    }
}

impl fmt::Display for CompatibilityRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.serialize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edition_normalisation() {
        assert_eq!(normalize_edition("1C", 150000, "15.2"), "vanilla");
        assert_eq!(normalize_edition("enterprise", 96000, "9.6 certified"), "enterprise");
        assert_eq!(normalize_edition("standard", 110000, "11.7 (certified)"), "standard-certified");
        assert_eq!(normalize_edition("enterprise", 120000, "12.3 certified"), "enterprise-certified");
        assert_eq!(normalize_edition("enterprise", 140000, "14.1 certified"), "enterprise");
        assert_eq!(normalize_edition("standard", 110000, "11.7"), "standard");
        assert_eq!(normalize_edition("vanilla", 110000, "11.7 certified"), "vanilla");
    }

    #[test]
    fn record_serialization_is_ordered() {
        let r = CompatibilityRecord::local("16", "vanilla");
        let s = r.serialize();
        assert!(s.starts_with("PG_MAJORVERSION=16\nedition=vanilla\nSIZEOF_VOID_P="));
        assert_eq!(CompatibilityRecord::parse(&s), r);
        let other = r.clone().with(KEY_POINTER, "4");
        assert_ne!(other.serialize(), s);
        assert_eq!(other.get(KEY_MAJOR), Some("16"));
    }
}
