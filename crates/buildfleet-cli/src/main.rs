//! buildfleet - multi-node container image builds
//!
//! ## Commands
//!
//! - `build`: build one image across the nodes of a builder
//! - `du`: show disk usage of every node of a builder

mod printer;
mod session;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use buildfleet_core::telemetry::init_tracing;
use buildfleet_core::{
    aggregate_usage, provision_session, run_build, translate, BuildOptions, FleetConfig, NodeSet,
    UsageFilter, DEFAULT_TARGET,
};
use buildfleet_remote::HttpDriverFactory;
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};

use crate::printer::{ProgressMode, TerminalReporter};
use crate::session::LocalSession;

#[derive(Parser)]
#[command(name = "buildfleet")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Build container images across a fleet of build engines", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short = 'D', long, global = true)]
    debug: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Builders file (default: `<config dir>/buildfleet/builders.json`)
    #[arg(long, global = true, env = "BUILDFLEET_CONFIG")]
    config: Option<PathBuf>,

    /// Builder to use (default: the one marked default in the builders file)
    #[arg(long, global = true)]
    builder: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build an image from a context directory
    Build(BuildArgs),

    /// Show disk usage of the builder's nodes
    Du {
        /// Filter records (e.g. `type=regular`, `until=24h`)
        #[arg(long = "filter", value_name = "KEY=VALUE")]
        filters: Vec<String>,

        /// Show every field of each record
        #[arg(short, long)]
        verbose: bool,
    },
}

#[derive(Args, Debug)]
struct BuildArgs {
    /// Build context directory
    #[arg(default_value = ".")]
    context: String,

    /// Name of the Dockerfile (default: `PATH/Dockerfile`)
    #[arg(short = 'f', long = "file")]
    file: Option<String>,

    /// Additional build contexts (e.g. `name=path`)
    #[arg(long = "build-context", value_name = "NAME=PATH")]
    build_contexts: Vec<String>,

    /// Set build-time variables
    #[arg(long = "build-arg", value_name = "KEY[=VALUE]", value_parser = parse_build_arg)]
    build_args: Vec<(String, Option<String>)>,

    /// Add a custom host-to-IP mapping (`host:ip`)
    #[arg(long = "add-host")]
    add_hosts: Vec<String>,

    /// Set metadata for an image
    #[arg(long = "label", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    labels: Vec<(String, String)>,

    /// Networking mode for RUN instructions
    #[arg(long)]
    network: Option<String>,

    /// Do not use cache when building the image
    #[arg(long)]
    no_cache: bool,

    /// Do not cache specified stages
    #[arg(long = "no-cache-filter", value_delimiter = ',')]
    no_cache_filter: Vec<String>,

    /// Always attempt to pull all referenced images
    #[arg(long)]
    pull: bool,

    /// Size of `/dev/shm` in bytes
    #[arg(long)]
    shm_size: Option<u64>,

    /// Name and optionally a tag (`name:tag`)
    #[arg(short = 't', long = "tag")]
    tags: Vec<String>,

    /// Target build stage
    #[arg(long)]
    target: Option<String>,

    /// Target platforms (`linux/amd64,linux/arm64`)
    #[arg(long = "platform")]
    platforms: Vec<String>,

    /// Secret to expose (`id=mysecret[,src=/local/secret]`)
    #[arg(long = "secret")]
    secrets: Vec<String>,

    /// SSH agent socket or keys to expose (`default|<id>[=<socket>|<key>[,<key>]]`)
    #[arg(long)]
    ssh: Vec<String>,

    /// Output destination (`type=local,dest=path`)
    #[arg(short = 'o', long = "output")]
    outputs: Vec<String>,

    /// Shorthand for `--output=type=registry`
    #[arg(long)]
    push: bool,

    /// Shorthand for `--output=type=docker`
    #[arg(long)]
    load: bool,

    /// External cache sources (`user/app:cache`, `type=local,src=path`)
    #[arg(long = "cache-from")]
    cache_from: Vec<String>,

    /// Cache export destinations (`user/app:cache`, `type=local,dest=path`)
    #[arg(long = "cache-to")]
    cache_to: Vec<String>,

    /// Attestation parameters (`type=sbom,generator=image`)
    #[arg(long = "attest")]
    attests: Vec<String>,

    /// Extra privileged entitlement (`network.host`, `security.insecure`)
    #[arg(long)]
    allow: Vec<String>,

    /// Ulimit options (`nofile=1024:2048`)
    #[arg(long = "ulimit")]
    ulimits: Vec<String>,

    /// Print result of information request (`outline`, `targets`)
    #[arg(long = "call", alias = "print", value_name = "NAME[,format=FMT]")]
    print: Option<String>,

    /// Write build result metadata to a file
    #[arg(long)]
    metadata_file: Option<PathBuf>,

    /// Progress output
    #[arg(long, value_enum, default_value_t = ProgressMode::Plain)]
    progress: ProgressMode,
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {raw:?}")),
    }
}

/// `KEY=VALUE`, or a bare `KEY` to be taken from the environment.
fn parse_build_arg(raw: &str) -> Result<(String, Option<String>), String> {
    match raw.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), Some(v.to_string()))),
        Some(_) => Err(format!("expected KEY[=VALUE], got {raw:?}")),
        None if raw.is_empty() => Err("empty build argument".to_string()),
        None => Ok((raw.to_string(), None)),
    }
}

impl BuildArgs {
    fn into_options(self, env: impl Fn(&str) -> Option<String>) -> BuildOptions {
        let mut build_args = BTreeMap::new();
        for (key, value) in self.build_args {
            // A bare KEY that is unset in the environment is dropped.
            if let Some(value) = value.or_else(|| env(&key)) {
                build_args.insert(key, value);
            }
        }
        BuildOptions {
            context_path: self.context,
            dockerfile: self.file,
            named_contexts: self.build_contexts,
            build_args,
            extra_hosts: self.add_hosts,
            labels: self.labels.into_iter().collect(),
            network_mode: self.network,
            no_cache: self.no_cache,
            no_cache_filter: self.no_cache_filter,
            pull: self.pull,
            shm_size: self.shm_size,
            tags: self.tags,
            target: self.target,
            platforms: self.platforms,
            secrets: self.secrets,
            ssh: self.ssh,
            exports: self.outputs,
            export_push: self.push,
            export_load: self.load,
            cache_from: self.cache_from,
            cache_to: self.cache_to,
            attests: self.attests,
            allow: self.allow,
            ulimits: self.ulimits,
            print_func: self.print,
            metadata_file: self.metadata_file,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.debug {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    let config_path = resolve_config_path(cli.config, dirs::config_dir())?;
    let cancel = cancel_on_interrupt();

    match cli.command {
        Commands::Build(args) => {
            cmd_build(
                &config_path,
                cli.builder.as_deref(),
                args,
                cli.debug,
                &cancel,
            )
            .await
        }
        Commands::Du { filters, verbose } => {
            cmd_du(
                &config_path,
                cli.builder.as_deref(),
                &filters,
                verbose,
                &cancel,
            )
            .await
        }
    }
}

fn resolve_config_path(explicit: Option<PathBuf>, config_dir: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path);
    }
    let dir = config_dir.context("no --config given and no user config directory found")?;
    Ok(dir.join("buildfleet").join("builders.json"))
}

fn cancel_on_interrupt() -> CancellationToken {
    let token = CancellationToken::new();
    let on_signal = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling");
            on_signal.cancel();
        }
    });
    token
}

async fn load_nodes(config_path: &Path, builder: Option<&str>) -> Result<NodeSet> {
    let fleet = FleetConfig::from_path(config_path)
        .with_context(|| format!("Failed to load builders from {}", config_path.display()))?;
    let builder = fleet.builder(builder)?;
    Ok(NodeSet::load(builder, &HttpDriverFactory::new()).await)
}

async fn cmd_build(
    config_path: &Path,
    builder: Option<&str>,
    args: BuildArgs,
    debug: bool,
    cancel: &CancellationToken,
) -> Result<()> {
    let reporter = TerminalReporter::new(args.progress, debug);
    let options = args.into_options(|key| std::env::var(key).ok());
    let printing = options.print_func.is_some();

    let mut request = translate(&options)?;
    provision_session(&mut request, &LocalSession::from_env())
        .await
        .context("Failed to prepare build session")?;

    let nodes = load_nodes(config_path, builder).await?;
    info!(builder = %nodes.name, nodes = nodes.len(), "building");

    let outcome = run_build(&nodes, request, &reporter, cancel).await?;

    if printing {
        return Ok(());
    }
    if let Some(result) = &outcome.result {
        info!(node = %result.node, result = %result.handle.id, "build complete");
    }
    if let Some(digest) = outcome
        .responses
        .get(DEFAULT_TARGET)
        .and_then(|r| r.get("containerimage.digest"))
    {
        println!("{digest}");
    }
    Ok(())
}

async fn cmd_du(
    config_path: &Path,
    builder: Option<&str>,
    filters: &[String],
    verbose: bool,
    cancel: &CancellationToken,
) -> Result<()> {
    let filter = UsageFilter::parse(filters)?;
    let nodes = load_nodes(config_path, builder).await?;
    let report = aggregate_usage(&nodes, &filter, cancel)
        .await
        .context("Failed to collect disk usage")?;
    print!(
        "{}",
        report.render(verbose, !filter.is_empty(), chrono::Utc::now())
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_args(argv: &[&str]) -> BuildArgs {
        let mut full = vec!["buildfleet", "build"];
        full.extend_from_slice(argv);
        match Cli::try_parse_from(full).unwrap().command {
            Commands::Build(args) => args,
            Commands::Du { .. } => panic!("expected build"),
        }
    }

    #[test]
    fn test_build_flags_map_to_options() {
        let args = build_args(&[
            "-t",
            "app:1",
            "--tag",
            "app:latest",
            "--platform",
            "linux/amd64,linux/arm64",
            "--build-arg",
            "A=1",
            "--label",
            "team=infra",
            "--no-cache-filter",
            "deps,test",
            "--push",
            "--metadata-file",
            "meta.json",
            "--progress",
            "quiet",
            "ctx",
        ]);
        assert_eq!(args.progress, ProgressMode::Quiet);

        let opts = args.into_options(|_| None);
        assert_eq!(opts.context_path, "ctx");
        assert_eq!(opts.tags, vec!["app:1", "app:latest"]);
        assert_eq!(opts.platforms, vec!["linux/amd64,linux/arm64"]);
        assert_eq!(opts.build_args["A"], "1");
        assert_eq!(opts.labels["team"], "infra");
        assert_eq!(opts.no_cache_filter, vec!["deps", "test"]);
        assert!(opts.export_push);
        assert_eq!(opts.metadata_file, Some(PathBuf::from("meta.json")));
    }

    #[test]
    fn test_bare_build_arg_reads_environment() {
        let args = build_args(&["--build-arg", "FROM_ENV", "--build-arg", "UNSET"]);
        let opts = args.into_options(|key| (key == "FROM_ENV").then(|| "v".to_string()));
        assert_eq!(opts.build_args.len(), 1);
        assert_eq!(opts.build_args["FROM_ENV"], "v");
    }

    #[test]
    fn test_invalid_label_rejected_by_parser() {
        assert!(Cli::try_parse_from(["buildfleet", "build", "--label", "novalue"]).is_err());
        assert!(Cli::try_parse_from(["buildfleet", "build", "--build-arg", "=x"]).is_err());
    }

    #[test]
    fn test_print_alias() {
        let opts = build_args(&["--print", "outline,format=json"]).into_options(|_| None);
        assert_eq!(opts.print_func.as_deref(), Some("outline,format=json"));
        assert!(translate(&opts).unwrap().print_func.is_some());
    }

    #[test]
    fn test_du_filters_and_globals() {
        let cli = Cli::try_parse_from([
            "buildfleet",
            "du",
            "--filter",
            "type=regular",
            "--filter",
            "until=24h",
            "--builder",
            "arm",
            "-v",
        ])
        .unwrap();
        assert!(!cli.debug);
        assert_eq!(cli.builder.as_deref(), Some("arm"));
        match cli.command {
            Commands::Du { filters, verbose } => {
                assert!(verbose);
                assert_eq!(filters, vec!["type=regular", "until=24h"]);
                assert!(UsageFilter::parse(&filters).is_ok());
            }
            Commands::Build(_) => panic!("expected du"),
        }
    }

    #[test]
    fn test_debug_logging_separate_from_du_verbose() {
        let cli = Cli::try_parse_from(["buildfleet", "--debug", "du"]).unwrap();
        assert!(cli.debug);
        assert!(matches!(cli.command, Commands::Du { verbose: false, .. }));

        // --verbose belongs to du only
        assert!(Cli::try_parse_from(["buildfleet", "--verbose", "du"]).is_err());
        assert!(Cli::try_parse_from(["buildfleet", "build", "-v"]).is_err());
    }

    #[test]
    fn test_config_path_resolution() {
        let explicit = resolve_config_path(Some(PathBuf::from("/etc/fleet.json")), None).unwrap();
        assert_eq!(explicit, PathBuf::from("/etc/fleet.json"));

        let default =
            resolve_config_path(None, Some(PathBuf::from("/home/dev/.config"))).unwrap();
        assert_eq!(
            default,
            PathBuf::from("/home/dev/.config/buildfleet/builders.json")
        );

        let platform = resolve_config_path(None, dirs::config_dir());
        assert_eq!(platform.is_ok(), dirs::config_dir().is_some());

        assert!(resolve_config_path(None, None).is_err());
    }
}
