//! Build context inputs: named contexts and remote context detection.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// An extra build context referencable from the Dockerfile by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedContext {
    pub path: String,
}

fn reference_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        let component = r"[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*";
        let pattern = format!(
            r"^(?:[a-zA-Z0-9.-]+(?::[0-9]+)?/)?{component}(?:/{component})*(?::[A-Za-z0-9_][A-Za-z0-9_.-]{{0,127}})?(?:@[a-z0-9]+:[a-f0-9]{{32,}})?$"
        );
        Regex::new(&pattern).expect("reference pattern is valid")
    })
}

fn git_ssh_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:ssh://|[A-Za-z][A-Za-z0-9_.-]*@[A-Za-z0-9.-]+:)")
            .expect("git ssh pattern is valid")
    })
}

/// Repository path of a reference: registry domain, tag and digest removed.
///
/// The first path component is a domain when it contains `.` or `:`, is
/// `localhost`, or has an uppercase letter.
fn remote_name(name: &str) -> &str {
    let name = name.split('@').next().unwrap_or(name);
    let remainder = match name.split_once('/') {
        Some((first, rest))
            if first.contains(|c: char| c == '.' || c == ':')
                || first == "localhost"
                || first.chars().any(|c| c.is_ascii_uppercase()) =>
        {
            rest
        }
        _ => name,
    };
    remainder.split(':').next().unwrap_or(remainder)
}

/// Normalize a context name the way image references are shortened for display.
pub fn normalize_context_name(name: &str) -> Result<String, String> {
    if remote_name(name).chars().any(|c| c.is_ascii_uppercase()) {
        return Err(format!("invalid context name {name}: repository name must be lowercase"));
    }
    if !reference_re().is_match(name) {
        return Err(format!("invalid context name {name}: invalid reference format"));
    }
    let familiar = name
        .strip_prefix("docker.io/library/")
        .or_else(|| name.strip_prefix("index.docker.io/library/"))
        .or_else(|| name.strip_prefix("docker.io/"))
        .or_else(|| name.strip_prefix("index.docker.io/"))
        .unwrap_or(name);
    Ok(familiar
        .strip_suffix(":latest")
        .unwrap_or(familiar)
        .to_string())
}

/// Parse `name=path` pairs into named contexts. Names that collide after
/// normalization are rejected.
pub fn parse_context_names(values: &[String]) -> Result<BTreeMap<String, NamedContext>, String> {
    let mut out = BTreeMap::new();
    for value in values {
        let (name, path) = value
            .split_once('=')
            .ok_or_else(|| format!("invalid context value: {value}, expected key=value"))?;
        let name = normalize_context_name(name)?;
        if out.contains_key(&name) {
            return Err(format!("duplicate context name {name}"));
        }
        out.insert(
            name,
            NamedContext {
                path: path.to_string(),
            },
        );
    }
    Ok(out)
}

/// True when a context location is a git repository reached over SSH.
pub fn is_git_ssh(location: &str) -> bool {
    git_ssh_re().is_match(location)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_strips_default_registry_and_latest() {
        assert_eq!(
            normalize_context_name("docker.io/library/alpine:latest").unwrap(),
            "alpine"
        );
        assert_eq!(normalize_context_name("alpine:3.19").unwrap(), "alpine:3.19");
        assert_eq!(
            normalize_context_name("docker.io/me/base").unwrap(),
            "me/base"
        );
        assert_eq!(
            normalize_context_name("ghcr.io/org/tool:latest").unwrap(),
            "ghcr.io/org/tool"
        );
    }

    #[test]
    fn test_uppercase_allowed_outside_repository_path() {
        assert_eq!(normalize_context_name("alpine:V1").unwrap(), "alpine:V1");
        assert_eq!(
            normalize_context_name("Registry.Local:5000/team/app:RC1").unwrap(),
            "Registry.Local:5000/team/app:RC1"
        );
        assert_eq!(
            normalize_context_name("localhost:5000/app").unwrap(),
            "localhost:5000/app"
        );
    }

    #[test]
    fn test_normalize_rejects_invalid_names() {
        assert!(normalize_context_name("Base").is_err());
        assert!(normalize_context_name("Alpine")
            .unwrap_err()
            .contains("must be lowercase"));
        assert!(normalize_context_name("ghcr.io/Org/tool").is_err());
        assert!(normalize_context_name("bad name").is_err());
        assert!(normalize_context_name("").is_err());
    }

    #[test]
    fn test_parse_context_names() {
        let ctx = parse_context_names(&[
            "base=docker-image://alpine".to_string(),
            "src=./src".to_string(),
        ])
        .unwrap();
        assert_eq!(ctx.len(), 2);
        assert_eq!(ctx["src"].path, "./src");

        assert!(parse_context_names(&["nopath".to_string()]).is_err());
        let dup = parse_context_names(&[
            "alpine=./a".to_string(),
            "alpine:latest=./b".to_string(),
        ]);
        assert!(dup.unwrap_err().contains("duplicate"));
    }

    #[test]
    fn test_is_git_ssh() {
        assert!(is_git_ssh("git@github.com:org/repo.git"));
        assert!(is_git_ssh("ssh://git@github.com/org/repo.git"));
        assert!(!is_git_ssh("https://github.com/org/repo.git"));
        assert!(!is_git_ssh("."));
        assert!(!is_git_ssh("/srv/app"));
    }
}
