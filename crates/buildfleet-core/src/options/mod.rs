//! Option translation: flat user-facing build options in, a validated
//! [`BuildRequest`] out.
//!
//! # Module layout
//!
//! - [`platform`]: `Platform`, `parse_platforms`
//! - [`context`]: `NamedContext`, `parse_context_names`, `is_git_ssh`
//! - [`specs`]: exports, caches, attestations, secrets, SSH, entitlements,
//!   ulimits and the print-mode descriptor

pub mod context;
pub mod platform;
pub mod specs;

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{BuildError, Result};
use crate::session::Session;

pub use context::{is_git_ssh, parse_context_names, NamedContext};
pub use platform::{parse_platforms, Platform};
pub use specs::{
    Attestation, CacheEntry, Entitlement, ExportEntry, PrintFunc, SecretSource, SecretSpec,
    SshSpec, Ulimit,
};

/// Name of the single target built by a plain `build` invocation.
pub const DEFAULT_TARGET: &str = "default";

/// Build options as the user typed them. Auxiliary specs are still raw strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildOptions {
    pub context_path: String,
    pub dockerfile: Option<String>,
    /// `name=path` pairs.
    pub named_contexts: Vec<String>,
    pub build_args: BTreeMap<String, String>,
    pub extra_hosts: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub network_mode: Option<String>,
    pub no_cache: bool,
    pub no_cache_filter: Vec<String>,
    pub pull: bool,
    pub shm_size: Option<u64>,
    pub tags: Vec<String>,
    pub target: Option<String>,
    pub platforms: Vec<String>,
    pub secrets: Vec<String>,
    pub ssh: Vec<String>,
    pub exports: Vec<String>,
    pub export_push: bool,
    pub export_load: bool,
    pub cache_from: Vec<String>,
    pub cache_to: Vec<String>,
    pub attests: Vec<String>,
    pub allow: Vec<String>,
    pub ulimits: Vec<String>,
    pub print_func: Option<String>,
    pub metadata_file: Option<PathBuf>,
}

/// Where the build reads its sources from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inputs {
    pub context_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dockerfile_path: Option<String>,
    #[serde(default)]
    pub named_contexts: BTreeMap<String, NamedContext>,
}

/// A normalized, validated build request for one target.
///
/// Constructed once per invocation and shared read-only by every dispatch
/// branch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildRequest {
    pub inputs: Inputs,
    pub build_args: BTreeMap<String, String>,
    pub extra_hosts: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub network_mode: Option<String>,
    pub no_cache: bool,
    pub no_cache_filter: Vec<String>,
    pub pull: bool,
    pub shm_size: Option<u64>,
    pub tags: Vec<String>,
    pub target: Option<String>,
    pub platforms: Vec<Platform>,
    pub ulimits: Vec<Ulimit>,
    pub allow: Vec<Entitlement>,
    pub secrets: Vec<SecretSpec>,
    pub ssh: Vec<SshSpec>,
    pub cache_from: Vec<CacheEntry>,
    pub cache_to: Vec<CacheEntry>,
    pub attests: Vec<Attestation>,
    pub exports: Vec<ExportEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub print_func: Option<PrintFunc>,
    #[serde(skip)]
    pub metadata_file: Option<PathBuf>,
    #[serde(skip)]
    pub session: Session,
}

fn family<T>(field: &'static str, parsed: std::result::Result<T, String>) -> Result<T> {
    parsed.map_err(|reason| BuildError::config(field, reason))
}

fn parse_each<T>(
    field: &'static str,
    values: &[String],
    parse: fn(&str) -> std::result::Result<T, String>,
) -> Result<Vec<T>> {
    values
        .iter()
        .map(|v| family(field, parse(v)))
        .collect()
}

fn dedup_ordered(values: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(values.len());
    for v in values {
        if !out.contains(v) {
            out.push(v.clone());
        }
    }
    out
}

/// Reconcile `--push`/`--load` with the explicit export list.
///
/// An explicit entry keeps its attributes; the mode only sets or checks what
/// it needs.
pub fn reconcile_exports(
    mut outputs: Vec<ExportEntry>,
    push: bool,
    load: bool,
) -> Result<Vec<ExportEntry>> {
    if push {
        if load {
            return Err(BuildError::config(
                "output",
                "push and load may not be set together at the moment",
            ));
        }
        match outputs.first_mut() {
            None => {
                let mut entry = ExportEntry::new("image");
                entry.attrs.insert("push".to_string(), "true".to_string());
                outputs.push(entry);
            }
            Some(first) if first.kind == "image" => {
                first.attrs.insert("push".to_string(), "true".to_string());
            }
            Some(first) => {
                return Err(BuildError::config(
                    "output",
                    format!("push and {:?} output can't be used together", first.kind),
                ));
            }
        }
    }
    if load {
        match outputs.first() {
            None => outputs.push(ExportEntry::new("docker")),
            Some(first) if first.kind == "docker" => {}
            Some(first) => {
                return Err(BuildError::config(
                    "output",
                    format!("load and {:?} output can't be used together", first.kind),
                ));
            }
        }
    }
    Ok(outputs)
}

/// Translate raw options into a [`BuildRequest`]. The session is left empty;
/// see [`crate::session::provision_session`].
pub fn translate(opts: &BuildOptions) -> Result<BuildRequest> {
    if opts.no_cache && !opts.no_cache_filter.is_empty() {
        return Err(BuildError::config(
            "no-cache-filter",
            "--no-cache and --no-cache-filter cannot currently be used together",
        ));
    }

    let named_contexts = family("build-context", parse_context_names(&opts.named_contexts))?;
    let print_func = match opts.print_func.as_deref() {
        Some(raw) => family("print", specs::parse_print_func(raw))?,
        None => None,
    };
    let platforms = family("platform", parse_platforms(&opts.platforms))?;

    let secrets = parse_each("secret", &opts.secrets, specs::parse_secret)?;
    let mut ssh = parse_each("ssh", &opts.ssh, specs::parse_ssh)?;
    if ssh.is_empty() && is_git_ssh(&opts.context_path) {
        debug!(context = %opts.context_path, "git-over-ssh context, forwarding default agent");
        ssh.push(SshSpec::default_agent());
    }

    let outputs = parse_each("output", &opts.exports, specs::parse_export)?;
    let exports = reconcile_exports(outputs, opts.export_push, opts.export_load)?;

    let cache_from = parse_each("cache-from", &opts.cache_from, specs::parse_cache)?;
    let cache_to = parse_each("cache-to", &opts.cache_to, specs::parse_cache)?;
    let attests = family("attest", specs::parse_attestations(&opts.attests))?;
    let allow = family("allow", specs::parse_entitlements(&opts.allow))?;
    let ulimits = parse_each("ulimit", &opts.ulimits, specs::parse_ulimit)?;

    Ok(BuildRequest {
        inputs: Inputs {
            context_path: opts.context_path.clone(),
            dockerfile_path: opts.dockerfile.clone(),
            named_contexts,
        },
        build_args: opts.build_args.clone(),
        extra_hosts: opts.extra_hosts.clone(),
        labels: opts.labels.clone(),
        network_mode: opts.network_mode.clone(),
        no_cache: opts.no_cache,
        no_cache_filter: opts.no_cache_filter.clone(),
        pull: opts.pull,
        shm_size: opts.shm_size,
        tags: dedup_ordered(&opts.tags),
        target: opts.target.clone(),
        platforms,
        ulimits,
        allow,
        secrets,
        ssh,
        cache_from,
        cache_to,
        attests,
        exports,
        print_func,
        metadata_file: opts.metadata_file.clone(),
        session: Session::default(),
    })
}
