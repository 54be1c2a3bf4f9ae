//! The netrun command-line front end.
//!
//! ```text
//! netrun [OPTIONS] <TARGET> <FUNCTION> [ARGS]...
//! ```
//!
//! Arguments of the form `key=value` become keyword arguments; everything else is positional.
//! Values are parsed as YAML, so `count=3` passes a number and `'[a, b]'` passes a list.

use anyhow::{bail, Context as _};
use clap::Parser;
use netrun::cache::FileCache;
use netrun::config::Config;
use netrun::core::{Mapping, Value};
use netrun::net::openssh::SshDriver;
use netrun::report::{print_results, PrintSink};
use netrun::resolve::DeviceSet;
use netrun::roster::TargetType;
use netrun::{execute, execute_on_device_set, Context, ExecuteOutcome};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "netrun")]
#[command(about = "Run a function on many network devices at once", long_about = None)]
struct Cli {
    /// Read configuration from this file instead of /etc/netrun/config.yaml
    #[arg(long, env = "NETRUN_CONFIG")]
    config: Option<PathBuf>,

    /// The roster that expands TARGET. Defaults to the configured roster
    #[arg(long)]
    roster: Option<String>,

    /// TARGET is a comma- or space-separated list of device ids
    #[arg(short = 'L', long, group = "tgt_type")]
    list: bool,

    /// TARGET is a regular expression
    #[arg(short = 'E', long, group = "tgt_type")]
    pcre: bool,

    /// TARGET is the name of a nodegroup
    #[arg(short = 'N', long, group = "tgt_type")]
    nodegroup: bool,

    /// TARGET is a YAML device set (a hostname, a list, or a mapping), used without a roster
    #[arg(short = 'D', long, group = "tgt_type")]
    devices: bool,

    /// Wait for every device, then print all results at once
    #[arg(long)]
    sync: bool,

    /// The number of devices contacted at once
    #[arg(short, long)]
    batch_size: Option<usize>,

    /// Print the matched devices without running anything
    #[arg(long)]
    preview_target: bool,

    /// With --preview-target, print each device's options too
    #[arg(long, requires = "preview_target")]
    target_details: bool,

    /// Collect grains after connecting
    #[arg(long)]
    with_grains: bool,

    /// Compile pillar data after connecting
    #[arg(long)]
    with_pillar: bool,

    /// Store each device's grains in the cache
    #[arg(long)]
    cache_grains: bool,

    /// Store each device's pillar data in the cache
    #[arg(long)]
    cache_pillar: bool,

    /// Collect grains even if cached grains exist
    #[arg(long)]
    no_cached_grains: bool,

    /// Compile pillar data even if cached pillar data exists
    #[arg(long)]
    no_cached_pillar: bool,

    /// Per-device timeout in seconds
    #[arg(short, long)]
    timeout: Option<u64>,

    /// The driver for devices that don't name one
    #[arg(long)]
    driver: Option<String>,

    /// The username for devices that don't name one
    #[arg(long)]
    username: Option<String>,

    /// The devices to run on
    target: String,

    /// The function to run, e.g. test.ping or net.cli
    function: String,

    /// Arguments for the function
    args: Vec<String>,
}

impl Cli {
    fn target_type(&self) -> TargetType {
        if self.list {
            TargetType::List
        } else if self.pcre {
            TargetType::Pcre
        } else if self.nodegroup {
            TargetType::Nodegroup
        } else {
            TargetType::Glob
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "netrun=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let config = match cli.config {
        Some(ref path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    debug!(roster = ?config.roster, batch_size = config.batch_size, "loaded configuration");

    let mut options = config.job_options();
    let (args, kwargs) = split_args(&cli.args);
    options.args = args;
    options.kwargs = kwargs;
    options.sync = cli.sync;
    options.events = false;
    options.preview_target = cli.preview_target;
    options.target_details = cli.target_details;
    if let Some(batch_size) = cli.batch_size {
        options.batch_size = batch_size;
    }
    if let Some(timeout) = cli.timeout {
        options.connection.timeout = Duration::from_secs(timeout);
    }
    if cli.driver.is_some() {
        options.connection.driver = cli.driver.clone();
    }
    if cli.username.is_some() {
        options.connection.username = cli.username.clone();
    }
    options.aux.with_grains = cli.with_grains;
    options.aux.with_pillar = cli.with_pillar;
    options.aux.cache_grains = cli.cache_grains;
    options.aux.cache_pillar = cli.cache_pillar;
    options.aux.use_cached_grains = !cli.no_cached_grains;
    options.aux.use_cached_pillar = !cli.no_cached_pillar;

    let cache = FileCache::new(config.cache_dir()?)?;
    let roster = config.file_roster()?;
    let roster_name = config.file_roster_name().to_string();
    let mut ctx = Context::new(config, SshDriver::default()).with_cache(cache);
    if let Some(roster) = roster {
        ctx = ctx.with_roster(roster_name, roster);
    }

    let outcome = if cli.devices {
        let set: DeviceSet = serde_yaml::from_str(&cli.target)
            .with_context(|| format!("could not parse device set {:?}", cli.target))?;
        if cli.preview_target {
            bail!("--preview-target needs a roster target, not --devices");
        }
        execute_on_device_set(&ctx, set, &cli.function, options, PrintSink::new()).await?
    } else {
        execute(
            &ctx,
            &cli.target,
            cli.target_type(),
            cli.roster.as_deref(),
            &cli.function,
            options,
            PrintSink::new(),
        )
        .await?
    };

    match outcome {
        ExecuteOutcome::Preview(ids) => {
            for id in ids {
                println!("{id}");
            }
            Ok(ExitCode::SUCCESS)
        }
        ExecuteOutcome::PreviewDetails(targets) => {
            print!("{}", serde_yaml::to_string(&targets)?);
            Ok(ExitCode::SUCCESS)
        }
        ExecuteOutcome::NoMatch => {
            eprintln!("{}", netrun::execute::NO_MATCH);
            Ok(ExitCode::FAILURE)
        }
        ExecuteOutcome::Complete { results, .. } => {
            print_results(&results)?;
            Ok(exit_code(results.failures()))
        }
        ExecuteOutcome::Streaming(handle) => {
            let jid = handle.jid.clone();
            let delivered = handle.wait().await?;
            info!(%jid, delivered, "done");
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn exit_code(failures: usize) -> ExitCode {
    if failures == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// Splits command-line arguments into positional and keyword arguments.
///
/// `key=value` is a keyword argument if `key` is a plain identifier; anything else, including
/// `show run | include a=b`, is positional.
fn split_args(raw: &[String]) -> (Vec<Value>, Mapping) {
    let mut args = Vec::new();
    let mut kwargs = Mapping::new();
    for arg in raw {
        match arg.split_once('=') {
            Some((key, value)) if is_identifier(key) => {
                kwargs.insert(key.into(), parse_value(value));
            }
            _ => args.push(parse_value(arg)),
        }
    }
    (args, kwargs)
}

fn is_identifier(key: &str) -> bool {
    let mut chars = key.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Parses `text` as YAML. Falls back to a plain string if it isn't valid YAML.
fn parse_value(text: &str) -> Value {
    if text.is_empty() {
        return Value::String(String::new());
    }
    serde_yaml::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}
