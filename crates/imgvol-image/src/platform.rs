//! Target platform selection.

use std::fmt;
use std::str::FromStr;

use imgvol_common::ImgvolError;
use serde::{Deserialize, Serialize};

/// An OCI platform (`os/architecture[/variant]`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Platform {
    /// Operating system (e.g., "linux").
    pub os: String,
    /// CPU architecture in OCI spelling (e.g., "amd64").
    pub architecture: String,
    /// Optional architecture variant (e.g., "v8").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Platform {
    /// Create a platform, normalizing architecture aliases.
    pub fn new(os: impl Into<String>, architecture: impl Into<String>) -> Self {
        let architecture: String = architecture.into();
        let (architecture, variant) = normalize_arch(&architecture, None);
        Self {
            os: os.into().to_ascii_lowercase(),
            architecture,
            variant,
        }
    }

    /// The platform this process runs on.
    #[must_use]
    pub fn host() -> Self {
        Self::new(std::env::consts::OS, std::env::consts::ARCH)
    }

    /// Whether an image built for `self` can serve a request for `wanted`.
    ///
    /// OS and architecture must match exactly. Variants only have to match
    /// when both sides name one.
    #[must_use]
    pub fn satisfies(&self, wanted: &Self) -> bool {
        self.os == wanted.os
            && self.architecture == wanted.architecture
            && match (&self.variant, &wanted.variant) {
                (Some(have), Some(want)) => have == want,
                _ => true,
            }
    }
}

fn normalize_arch(arch: &str, variant: Option<&str>) -> (String, Option<String>) {
    let arch = arch.to_ascii_lowercase();
    let variant = variant.map(str::to_ascii_lowercase);
    match arch.as_str() {
        "x86_64" | "x86-64" => ("amd64".to_string(), None),
        "aarch64" => ("arm64".to_string(), variant.filter(|v| v != "v8")),
        "arm64" => ("arm64".to_string(), variant.filter(|v| v != "v8")),
        "i386" | "x86" => ("386".to_string(), None),
        "armhf" => ("arm".to_string(), Some("v7".to_string())),
        "armel" => ("arm".to_string(), Some("v6".to_string())),
        _ => (arch, variant),
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self::host()
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(variant) = &self.variant {
            write!(f, "/{variant}")?;
        }
        Ok(())
    }
}

impl FromStr for Platform {
    type Err = ImgvolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        let invalid = || ImgvolError::Config {
            message: format!("invalid platform '{s}', expected os/arch[/variant]"),
        };

        match parts.as_slice() {
            [os, arch] if !os.is_empty() && !arch.is_empty() => Ok(Self::new(*os, *arch)),
            [os, arch, variant] if !os.is_empty() && !arch.is_empty() && !variant.is_empty() => {
                let (architecture, variant) = normalize_arch(arch, Some(*variant));
                Ok(Self {
                    os: os.to_ascii_lowercase(),
                    architecture,
                    variant,
                })
            }
            _ => Err(invalid()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        let p: Platform = "linux/amd64".parse().unwrap();
        assert_eq!(p.to_string(), "linux/amd64");

        let p: Platform = "linux/arm/v7".parse().unwrap();
        assert_eq!(p.variant.as_deref(), Some("v7"));
        assert_eq!(p.to_string(), "linux/arm/v7");
    }

    #[test]
    fn aliases_are_normalized() {
        assert_eq!(Platform::new("linux", "x86_64").architecture, "amd64");
        let p: Platform = "linux/aarch64/v8".parse().unwrap();
        assert_eq!(p, Platform::new("linux", "arm64"));
    }

    #[test]
    fn malformed_platforms_are_rejected() {
        assert!("linux".parse::<Platform>().is_err());
        assert!("linux/".parse::<Platform>().is_err());
        assert!("a/b/c/d".parse::<Platform>().is_err());
    }

    #[test]
    fn matching_rules() {
        let image: Platform = "linux/arm/v7".parse().unwrap();
        assert!(image.satisfies(&"linux/arm".parse().unwrap()));
        assert!(image.satisfies(&"linux/arm/v7".parse().unwrap()));
        assert!(!image.satisfies(&"linux/arm/v6".parse().unwrap()));
        assert!(!image.satisfies(&"windows/arm".parse().unwrap()));
    }
}
