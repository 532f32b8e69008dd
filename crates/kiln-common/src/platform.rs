//! Target platform parsing.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{KilnError, KilnResult};

/// A build target platform, e.g. `linux/amd64`.
///
/// Platform and architecture are tracked as independent components: two
/// builds of the same specification for different architectures must never
/// collapse into one identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Platform {
    /// Operating system component (e.g. `linux`).
    pub os: String,
    /// Architecture component (e.g. `amd64`, `arm64`).
    pub arch: String,
}

impl Platform {
    /// Parse an `os/arch` platform string.
    pub fn parse(value: &str) -> KilnResult<Self> {
        let value = value.trim();
        let mut parts = value.splitn(2, '/');
        let os = parts.next().unwrap_or_default();
        let arch = parts.next().unwrap_or_default();

        if os.is_empty() || arch.is_empty() || arch.contains('/') {
            return Err(KilnError::InvalidPlatform {
                value: value.to_string(),
            });
        }

        Ok(Self {
            os: os.to_string(),
            arch: arch.to_string(),
        })
    }

    /// Parse a comma-separated platform list, e.g. `linux/amd64,linux/arm64`.
    pub fn parse_list(value: &str) -> KilnResult<Vec<Self>> {
        value
            .split(',')
            .filter(|part| !part.trim().is_empty())
            .map(Self::parse)
            .collect()
    }

    /// The platform of the host running the build.
    #[must_use]
    pub fn host() -> Self {
        let arch = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            other => other,
        };
        Self {
            os: "linux".to_string(),
            arch: arch.to_string(),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.arch)
    }
}

impl FromStr for Platform {
    type Err = KilnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple() {
        let platform = Platform::parse("linux/amd64").unwrap();
        assert_eq!(platform.os, "linux");
        assert_eq!(platform.arch, "amd64");
        assert_eq!(platform.to_string(), "linux/amd64");
    }

    #[test]
    fn parse_list() {
        let platforms = Platform::parse_list("linux/amd64,linux/arm64").unwrap();
        assert_eq!(platforms.len(), 2);
        assert_eq!(platforms[1].arch, "arm64");
    }

    #[test]
    fn parse_rejects_missing_arch() {
        assert!(Platform::parse("linux").is_err());
        assert!(Platform::parse("linux/").is_err());
        assert!(Platform::parse("").is_err());
    }

    #[test]
    fn parse_rejects_extra_components() {
        assert!(Platform::parse("linux/arm/v7/extra").is_err());
    }

    #[test]
    fn host_platform_is_valid() {
        let host = Platform::host();
        assert_eq!(host.os, "linux");
        assert!(!host.arch.is_empty());
    }
}
