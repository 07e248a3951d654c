//! Target platform parsing.

use std::fmt;

use serde::{Deserialize, Serialize};

/// An `os/arch[/variant]` triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Platform {
    /// Parse and normalize a single platform string.
    pub fn parse(value: &str) -> Result<Self, String> {
        let value = value.trim().to_ascii_lowercase();
        let parts: Vec<&str> = value.split('/').collect();
        if parts.len() < 2 || parts.len() > 3 || parts.iter().any(|p| p.is_empty()) {
            return Err(format!("{value:?}: expected os/arch[/variant]"));
        }
        if !parts
            .iter()
            .all(|p| p.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-'))
        {
            return Err(format!("{value:?}: invalid characters"));
        }

        let os = match parts[0] {
            "macos" => "darwin".to_string(),
            other => other.to_string(),
        };
        let (architecture, alias_variant) = normalize_arch(parts[1]);
        let variant = match (parts.get(2), alias_variant) {
            (Some(v), _) => Some(v.to_string()),
            (None, v) => v.map(str::to_string),
        };
        // arm64 has a single meaningful variant, drop it like the engines do
        let variant = match (architecture.as_str(), variant.as_deref()) {
            ("arm64", Some("v8")) => None,
            _ => variant,
        };

        Ok(Self {
            os,
            architecture,
            variant,
        })
    }
}

fn normalize_arch(arch: &str) -> (String, Option<&'static str>) {
    match arch {
        "x86_64" | "x86-64" => ("amd64".to_string(), None),
        "aarch64" => ("arm64".to_string(), None),
        "armhf" => ("arm".to_string(), Some("v7")),
        "armel" => ("arm".to_string(), Some("v6")),
        "i386" | "i686" => ("386".to_string(), None),
        other => (other.to_string(), None),
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(v) = &self.variant {
            write!(f, "/{v}")?;
        }
        Ok(())
    }
}

/// Parse a list of platform flags. Each entry may hold a comma-separated list.
/// The result keeps first-seen order and drops duplicates.
pub fn parse_platforms(values: &[String]) -> Result<Vec<Platform>, String> {
    let mut out: Vec<Platform> = Vec::new();
    for value in values {
        for item in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let p = Platform::parse(item)?;
            if !out.contains(&p) {
                out.push(p);
            }
        }
    }
    Ok(out)
}
