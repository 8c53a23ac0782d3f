//! mlworker - serves model predictions, tests and explanations to a control
//! plane, either co-located with it or through a bridge tunnel.

use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use mlworker::{
    ArtifactRegistry, ArtifactResolver, MirrorFetcher, Worker, WorkerMode, WorkerSettings,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mlworker")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the worker and connect it to the control plane
    ///
    /// Examples:
    ///   mlworker start
    ///   mlworker start --remote hub.example.com:9100 --api-key $KEY
    Start(StartArgs),
}

#[derive(Args, Debug, Default)]
struct StartArgs {
    /// Host of the rpc listener (co-located mode)
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Port of the rpc listener, a free port when omitted
    #[arg(short, long)]
    port: Option<u16>,

    /// Worker home (artifacts, caches, sockets)
    #[arg(long)]
    home: Option<PathBuf>,

    /// STOMP control plane address
    #[arg(long, value_name = "HOST:PORT")]
    control_addr: Option<String>,

    /// Bridge service of a remote control plane; switches to bridged mode
    #[arg(short, long, value_name = "HOST:PORT", requires = "api_key")]
    remote: Option<String>,

    /// API key presented to the remote control plane
    #[arg(short = 'k', long, env = "MLWORKER_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Projects tree to fetch missing artifacts from
    #[arg(long)]
    mirror: Option<PathBuf>,

    /// Disable the per-model prediction cache
    #[arg(long)]
    no_cache: bool,
}

impl StartArgs {
    // flags win over MLWORKER_* variables
    fn apply(&self, mut settings: WorkerSettings) -> WorkerSettings {
        if let Some(host) = &self.host {
            settings.host = host.clone();
        }
        if self.port.is_some() {
            settings.port = self.port;
        }
        if let Some(home) = &self.home {
            settings.home = home.clone();
        }
        if let Some(addr) = &self.control_addr {
            settings.control_addr = addr.clone();
        }
        if self.no_cache {
            settings.cache_enabled = false;
        }
        settings
    }

    fn mode(&self) -> WorkerMode {
        match (&self.remote, &self.api_key) {
            (Some(remote), Some(api_key)) => WorkerMode::Bridged {
                remote: remote.clone(),
                api_key: api_key.clone(),
            },
            _ => WorkerMode::CoLocated,
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn start(args: StartArgs) -> anyhow::Result<()> {
    let settings = args.apply(WorkerSettings::from_env().context("invalid MLWORKER_* settings")?);
    let mode = args.mode();

    let mut resolver = ArtifactResolver::new(settings.projects_dir());
    if let Some(mirror) = &args.mirror {
        resolver = resolver.with_fetcher(Arc::new(MirrorFetcher::new(mirror)));
    }
    let registry =
        Arc::new(ArtifactRegistry::new(resolver).with_cache_enabled(settings.cache_enabled));

    info!(
        home = %settings.home.display(),
        control_addr = %settings.control_addr,
        remote = mode.is_remote(),
        loaders = ?registry.loader_names(),
        "starting ml worker"
    );
    Worker::new(settings, mode, registry)
        .start()
        .await
        .context("worker stopped with an error")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Start(args) => start(args).await,
    }
}
