//! Parsers for the auxiliary spec families of a build request.
//!
//! Every family is written as CSV `key=value` fields (`type=image,push=true`).
//! Parsers return a plain `String` reason; the translator attaches the
//! family name when it turns the reason into a configuration error.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Split one CSV record. Double quotes group a field; `""` inside quotes is a literal quote.
pub(crate) fn split_csv(input: &str) -> Result<Vec<String>, String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut chars = input.chars().peekable();
    let mut in_quotes = false;

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes => {
                if chars.peek() == Some(&'"') {
                    current.push('"');
                    chars.next();
                } else {
                    in_quotes = false;
                }
            }
            '"' if current.is_empty() => in_quotes = true,
            ',' if !in_quotes => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    if in_quotes {
        return Err(format!("unterminated quote in {input:?}"));
    }
    fields.push(current);
    Ok(fields)
}

fn split_kv(field: &str) -> Option<(String, String)> {
    let (k, v) = field.split_once('=')?;
    Some((k.trim().to_ascii_lowercase(), v.to_string()))
}

// ---------------------------------------------------------------------------
// Exports
// ---------------------------------------------------------------------------

/// One output destination for a build result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportEntry {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub attrs: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
}

impl ExportEntry {
    pub fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            attrs: BTreeMap::new(),
            destination: None,
        }
    }
}

pub fn parse_export(value: &str) -> Result<ExportEntry, String> {
    let fields = split_csv(value)?;
    if fields.len() == 1 && fields[0] == value && !value.starts_with("type=") {
        let mut entry = if value == "-" {
            ExportEntry::new("tar")
        } else {
            ExportEntry::new("local")
        };
        entry.destination = Some(value.to_string());
        return Ok(entry);
    }

    let mut kind = String::new();
    let mut attrs = BTreeMap::new();
    for field in &fields {
        let (key, val) = split_kv(field).ok_or_else(|| format!("invalid value {field}"))?;
        if key == "type" {
            kind = val;
        } else {
            attrs.insert(key, val);
        }
    }
    if kind.is_empty() {
        return Err(format!("type is required for output {value:?}"));
    }
    if kind == "registry" {
        kind = "image".to_string();
        attrs.insert("push".to_string(), "true".to_string());
    }
    let destination = attrs.remove("dest");
    Ok(ExportEntry {
        kind,
        attrs,
        destination,
    })
}

// ---------------------------------------------------------------------------
// Cache import/export
// ---------------------------------------------------------------------------

/// A cache import or export source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub attrs: BTreeMap<String, String>,
}

pub fn parse_cache(value: &str) -> Result<CacheEntry, String> {
    let fields = split_csv(value)?;
    if fields.len() == 1 && !fields[0].contains('=') {
        let mut attrs = BTreeMap::new();
        attrs.insert("ref".to_string(), fields[0].clone());
        return Ok(CacheEntry {
            kind: "registry".to_string(),
            attrs,
        });
    }

    let mut kind = String::new();
    let mut attrs = BTreeMap::new();
    for field in &fields {
        let (key, val) = split_kv(field).ok_or_else(|| format!("invalid value {field}"))?;
        if key == "type" {
            kind = val;
        } else {
            attrs.insert(key, val);
        }
    }
    if kind.is_empty() {
        return Err(format!("type is required for cache {value:?}"));
    }
    Ok(CacheEntry { kind, attrs })
}

// ---------------------------------------------------------------------------
// Attestations
// ---------------------------------------------------------------------------

/// A supplementary artifact request (provenance, SBOM).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attestation {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub attrs: BTreeMap<String, String>,
}

pub fn parse_attestation(value: &str) -> Result<Attestation, String> {
    let mut kind = String::new();
    let mut disabled = false;
    let mut attrs = BTreeMap::new();
    for field in split_csv(value)? {
        let (key, val) = split_kv(&field).ok_or_else(|| format!("invalid value {field}"))?;
        match key.as_str() {
            "type" => kind = val,
            "disabled" => {
                disabled = val
                    .parse::<bool>()
                    .map_err(|_| format!("invalid value {field}"))?
            }
            _ => {
                attrs.insert(key, val);
            }
        }
    }
    if kind.is_empty() {
        return Err(format!("attestation type not specified in {value:?}"));
    }
    Ok(Attestation {
        kind,
        disabled,
        attrs,
    })
}

/// Parse all attestation specs, rejecting a type requested twice.
pub fn parse_attestations(values: &[String]) -> Result<Vec<Attestation>, String> {
    let mut out: Vec<Attestation> = Vec::with_capacity(values.len());
    for value in values {
        let attest = parse_attestation(value)?;
        if out.iter().any(|a| a.kind == attest.kind) {
            return Err(format!("duplicate attestation field {}", attest.kind));
        }
        out.push(attest);
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Secrets and SSH
// ---------------------------------------------------------------------------

/// Where the session collaborator should read a secret from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SecretSource {
    File { path: String },
    Env { var: String },
}

/// A secret exposed to the build under `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretSpec {
    pub id: String,
    pub source: SecretSource,
}

pub fn parse_secret(value: &str) -> Result<SecretSpec, String> {
    let mut kind: Option<String> = None;
    let mut id = String::new();
    let mut src = None;
    let mut env = None;
    for field in split_csv(value)? {
        let (key, val) = split_kv(&field).ok_or_else(|| format!("invalid field {field:?}"))?;
        match key.as_str() {
            "type" => {
                if val != "file" && val != "env" {
                    return Err(format!("unsupported secret type {val:?}"));
                }
                kind = Some(val);
            }
            "id" => id = val,
            "source" | "src" => src = Some(val),
            "env" => env = Some(val),
            _ => return Err(format!("unexpected key {key:?} in {field:?}")),
        }
    }
    if id.is_empty() {
        return Err(format!("secret id is required in {value:?}"));
    }

    let kind = kind.unwrap_or_else(|| {
        if env.is_some() && src.is_none() {
            "env".to_string()
        } else {
            "file".to_string()
        }
    });
    let source = if kind == "env" {
        SecretSource::Env {
            var: env.or(src).unwrap_or_else(|| id.clone()),
        }
    } else {
        let path = src.ok_or_else(|| format!("source is required for file secret {id:?}"))?;
        SecretSource::File { path }
    };
    Ok(SecretSpec { id, source })
}

/// An SSH agent socket or key set forwarded to the build under `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshSpec {
    pub id: String,
    #[serde(default)]
    pub paths: Vec<String>,
}

impl SshSpec {
    /// The agent forward synthesized for git-over-SSH contexts.
    pub fn default_agent() -> Self {
        Self {
            id: "default".to_string(),
            paths: Vec::new(),
        }
    }
}

pub fn parse_ssh(value: &str) -> Result<SshSpec, String> {
    let (id, paths) = match value.split_once('=') {
        Some((id, rest)) => (
            id,
            rest.split(',')
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect(),
        ),
        None => (value, Vec::new()),
    };
    let id = id.trim();
    if id.is_empty() {
        return Err(format!("invalid ssh spec {value:?}: id is empty"));
    }
    Ok(SshSpec {
        id: id.to_string(),
        paths,
    })
}

// ---------------------------------------------------------------------------
// Entitlements and ulimits
// ---------------------------------------------------------------------------

/// Elevated capabilities a build may be granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Entitlement {
    #[serde(rename = "network.host")]
    NetworkHost,
    #[serde(rename = "security.insecure")]
    SecurityInsecure,
}

impl fmt::Display for Entitlement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Entitlement::NetworkHost => "network.host",
            Entitlement::SecurityInsecure => "security.insecure",
        })
    }
}

pub fn parse_entitlements(values: &[String]) -> Result<Vec<Entitlement>, String> {
    let mut out = Vec::new();
    for value in values {
        for item in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let ent = match item {
                "network.host" => Entitlement::NetworkHost,
                "security.insecure" => Entitlement::SecurityInsecure,
                other => return Err(format!("invalid entitlement: {other}")),
            };
            if !out.contains(&ent) {
                out.push(ent);
            }
        }
    }
    Ok(out)
}

const ULIMIT_NAMES: &[&str] = &[
    "core",
    "cpu",
    "data",
    "fsize",
    "locks",
    "memlock",
    "msgqueue",
    "nice",
    "nofile",
    "nproc",
    "rss",
    "rtprio",
    "rttime",
    "sigpending",
    "stack",
];

/// A resource limit applied to build containers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ulimit {
    pub name: String,
    pub soft: i64,
    pub hard: i64,
}

pub fn parse_ulimit(value: &str) -> Result<Ulimit, String> {
    let (name, limits) = value
        .split_once('=')
        .ok_or_else(|| format!("invalid ulimit argument: {value}"))?;
    if !ULIMIT_NAMES.contains(&name) {
        return Err(format!("invalid ulimit type: {name}"));
    }
    let (soft, hard) = match limits.split_once(':') {
        Some((s, h)) => (s, h),
        None => (limits, limits),
    };
    let soft: i64 = soft
        .parse()
        .map_err(|_| format!("invalid ulimit soft value: {soft}"))?;
    let hard: i64 = hard
        .parse()
        .map_err(|_| format!("invalid ulimit hard value: {hard}"))?;
    if soft > hard {
        return Err(format!(
            "ulimit soft limit must be less than or equal to hard limit: {soft} > {hard}"
        ));
    }
    Ok(Ulimit {
        name: name.to_string(),
        soft,
        hard,
    })
}

// ---------------------------------------------------------------------------
// Print mode
// ---------------------------------------------------------------------------

/// Asks the engine to evaluate a named subrequest and print its result
/// instead of producing a build output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrintFunc {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

pub fn parse_print_func(value: &str) -> Result<Option<PrintFunc>, String> {
    if value.is_empty() {
        return Ok(None);
    }
    let mut name = String::new();
    let mut format = None;
    for field in split_csv(value)? {
        match field.split_once('=') {
            Some(("format", fmt)) => format = Some(fmt.to_string()),
            Some(_) => return Err(format!("invalid print field: {field}")),
            None => {
                if !name.is_empty() {
                    return Err(format!("invalid print value: {value}"));
                }
                name = field;
            }
        }
    }
    Ok(Some(PrintFunc { name, format }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_csv_honors_quotes() {
        let fields = split_csv(r#"type=local,"dest=a,b","x=say ""hi""""#).unwrap();
        assert_eq!(fields, vec!["type=local", "dest=a,b", r#"x=say "hi""#]);
        assert!(split_csv(r#""open"#).is_err());
    }

    #[test]
    fn test_parse_export_shorthand() {
        let local = parse_export("./out").unwrap();
        assert_eq!(local.kind, "local");
        assert_eq!(local.destination.as_deref(), Some("./out"));

        let tar = parse_export("-").unwrap();
        assert_eq!(tar.kind, "tar");
        assert_eq!(tar.destination.as_deref(), Some("-"));
    }

    #[test]
    fn test_parse_export_registry_becomes_pushed_image() {
        let entry = parse_export("type=registry,name=example.com/app").unwrap();
        assert_eq!(entry.kind, "image");
        assert_eq!(entry.attrs.get("push").map(String::as_str), Some("true"));
        assert_eq!(
            entry.attrs.get("name").map(String::as_str),
            Some("example.com/app")
        );
    }

    #[test]
    fn test_parse_export_requires_type() {
        assert!(parse_export("name=foo,push=true").is_err());
        assert!(parse_export("type=image,bogus").is_err());
    }

    #[test]
    fn test_parse_cache_bare_ref_is_registry() {
        let entry = parse_cache("user/app:cache").unwrap();
        assert_eq!(entry.kind, "registry");
        assert_eq!(
            entry.attrs.get("ref").map(String::as_str),
            Some("user/app:cache")
        );
        assert!(parse_cache("mode=max,ref=x").is_err());
    }

    #[test]
    fn test_parse_attestations_rejects_duplicates() {
        let ok = parse_attestations(&[
            "type=provenance,mode=max".to_string(),
            "type=sbom,disabled=true".to_string(),
        ])
        .unwrap();
        assert_eq!(ok.len(), 2);
        assert!(ok[1].disabled);
        assert_eq!(ok[0].attrs.get("mode").map(String::as_str), Some("max"));

        let dup = parse_attestations(&["type=sbom".to_string(), "type=sbom".to_string()]);
        assert!(dup.unwrap_err().contains("duplicate"));
    }

    #[test]
    fn test_parse_secret_sources() {
        let file = parse_secret("id=npmrc,src=/home/me/.npmrc").unwrap();
        assert_eq!(
            file.source,
            SecretSource::File {
                path: "/home/me/.npmrc".to_string()
            }
        );

        let env = parse_secret("id=token,env=GITHUB_TOKEN").unwrap();
        assert_eq!(
            env.source,
            SecretSource::Env {
                var: "GITHUB_TOKEN".to_string()
            }
        );

        let env_by_id = parse_secret("type=env,id=AWS_KEY").unwrap();
        assert_eq!(
            env_by_id.source,
            SecretSource::Env {
                var: "AWS_KEY".to_string()
            }
        );

        assert!(parse_secret("src=/x").is_err());
        assert!(parse_secret("id=x,type=vault").is_err());
        assert!(parse_secret("id=x").is_err());
    }

    #[test]
    fn test_parse_ssh() {
        assert_eq!(parse_ssh("default").unwrap(), SshSpec::default_agent());
        let keys = parse_ssh("deploy=/k1,/k2").unwrap();
        assert_eq!(keys.id, "deploy");
        assert_eq!(keys.paths, vec!["/k1", "/k2"]);
        assert!(parse_ssh("=/k1").is_err());
    }

    #[test]
    fn test_parse_entitlements() {
        let ents =
            parse_entitlements(&["network.host,security.insecure".to_string()]).unwrap();
        assert_eq!(
            ents,
            vec![Entitlement::NetworkHost, Entitlement::SecurityInsecure]
        );
        assert!(parse_entitlements(&["device".to_string()]).is_err());
    }

    #[test]
    fn test_parse_ulimit() {
        let u = parse_ulimit("nofile=1024:2048").unwrap();
        assert_eq!((u.soft, u.hard), (1024, 2048));
        let same = parse_ulimit("nproc=512").unwrap();
        assert_eq!((same.soft, same.hard), (512, 512));
        assert!(parse_ulimit("nofile=4096:1024").is_err());
        assert!(parse_ulimit("bogus=1").is_err());
        assert!(parse_ulimit("nofile").is_err());
    }

    #[test]
    fn test_parse_print_func() {
        assert_eq!(parse_print_func("").unwrap(), None);
        let f = parse_print_func("outline,format=json").unwrap().unwrap();
        assert_eq!(f.name, "outline");
        assert_eq!(f.format.as_deref(), Some("json"));
        assert!(parse_print_func("outline,color=red").is_err());
        assert!(parse_print_func("outline,targets").is_err());
    }
}
