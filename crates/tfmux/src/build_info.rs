//! Compile-time build metadata.
//!
//! `BUILD_COMMIT` and `BUILD_DATE` are read from the build environment and
//! fall back to `unknown` for local builds.

use std::fmt;

use serde::Serialize;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// What `/version` reports and `serve` logs at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BuildInfo {
    pub version: &'static str,
    pub commit: &'static str,
    pub build_date: &'static str,
    pub target_os: &'static str,
}

/// Metadata of the running binary.
pub const CURRENT: BuildInfo = BuildInfo {
    version: VERSION,
    commit: or_unknown(option_env!("BUILD_COMMIT")),
    build_date: or_unknown(option_env!("BUILD_DATE")),
    target_os: std::env::consts::OS,
};

const fn or_unknown(value: Option<&'static str>) -> &'static str {
    match value {
        Some(value) if !value.is_empty() => value,
        _ => "unknown",
    }
}

impl fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}, built {}, {})",
            self.version, self.commit, self.build_date, self.target_os
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_values_read_as_unknown() {
        assert_eq!(or_unknown(None), "unknown");
        assert_eq!(or_unknown(Some("")), "unknown");
        assert_eq!(or_unknown(Some("abc123")), "abc123");
    }

    #[test]
    fn display_leads_with_version() {
        let info = BuildInfo {
            version: "1.2.3",
            commit: "abc123",
            build_date: "2026-01-01",
            target_os: "linux",
        };
        assert_eq!(info.to_string(), "1.2.3 (abc123, built 2026-01-01, linux)");
        assert!(CURRENT.to_string().starts_with(VERSION));
    }
}
