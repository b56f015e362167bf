//! kola CLI - OS integration test harness.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use kola::conf::{BootPayload, PayloadKind};
use kola::config::{self, Config, Platform};
use kola::harness::Harness;
use kola::platform::machine::{
    aws::AwsProvider, digitalocean::DoProvider, esx::EsxProvider, gce::GceProvider,
    oci::OciProvider, packet::PacketProvider, qemu::QemuProvider,
};
use kola::platform::{Cluster, ClusterConfig, Provider};
use kola::register::{NamePattern, Registry, RegistryBuilder, Selection};
use kola::report::{ConsoleReporter, JUnitReporter, MultiReporter, TapReporter};

#[derive(Parser)]
#[command(name = "kola")]
#[command(about = "Run integration tests against OS images", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path (missing file means defaults)
    #[arg(short, long, default_value = "kola.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run tests
    Run {
        /// Only run tests whose name matches this glob
        pattern: Option<String>,

        /// Override the platform
        #[arg(short, long, value_enum)]
        platform: Option<Platform>,

        /// Override the distribution
        #[arg(short = 'b', long)]
        distro: Option<String>,

        /// Override the number of tests run at once
        #[arg(short = 'j', long)]
        parallel: Option<usize>,

        /// TAP output path
        #[arg(long)]
        tapfile: Option<PathBuf>,

        /// JUnit XML output path
        #[arg(long)]
        junit: Option<PathBuf>,
    },

    /// List registered tests
    List {
        #[arg(short, long, value_enum)]
        platform: Option<Platform>,

        #[arg(short = 'b', long)]
        distro: Option<String>,
    },

    /// Validate configuration and print the effective settings
    Validate,

    /// Boot machines and keep them until interrupted
    Spawn {
        /// Number of machines
        #[arg(short = 'n', long, default_value_t = 1)]
        count: usize,

        /// Boot payload file
        #[arg(long)]
        userdata: Option<PathBuf>,

        /// How the boot payload is interpreted
        #[arg(long, value_enum, default_value_t = PayloadKind::Ignition)]
        userdata_kind: PayloadKind,

        #[arg(short, long, value_enum)]
        platform: Option<Platform>,
    },
}

/// Builds the configured platform's provider and evaluates `$body` with it.
macro_rules! with_provider {
    ($config:expr, |$provider:ident| $body:expr) => {{
        let config: &Config = $config;
        let concurrency = config.kola.api_concurrency;
        let board = config.kola.board.as_str();
        match config.kola.platform {
            Platform::Aws => {
                let $provider = AwsProvider::new(config.aws.clone(), board, concurrency);
                $body
            }
            Platform::Do => {
                let $provider = DoProvider::new(config.digitalocean.clone(), concurrency);
                $body
            }
            Platform::Esx => {
                let $provider = EsxProvider::new(config.esx.clone(), concurrency)?;
                $body
            }
            Platform::Gce => {
                let $provider = GceProvider::new(config.gce.clone(), concurrency);
                $body
            }
            Platform::Oci => {
                let $provider = OciProvider::new(config.oci.clone(), concurrency);
                $body
            }
            Platform::Packet => {
                let $provider = PacketProvider::new(config.packet.clone(), board, concurrency);
                $body
            }
            Platform::Qemu => {
                let $provider = QemuProvider::new(config.qemu.clone(), board);
                $body
            }
        }
    }};
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run {
            pattern,
            platform,
            distro,
            parallel,
            tapfile,
            junit,
        } => {
            let mut config = load(&cli.config)?;
            if let Some(platform) = platform {
                config.kola.platform = platform;
            }
            if let Some(distro) = distro {
                config.kola.distro = distro;
            }
            if let Some(parallel) = parallel {
                config.kola.parallel = parallel;
            }
            if tapfile.is_some() {
                config.kola.tapfile = tapfile;
            }
            if junit.is_some() {
                config.kola.junit_file = junit;
            }
            let code = run_tests(config, pattern.as_deref(), cli.verbose).await?;
            std::process::exit(code);
        }
        Commands::List { platform, distro } => {
            let mut config = load(&cli.config)?;
            if let Some(platform) = platform {
                config.kola.platform = platform;
            }
            if let Some(distro) = distro {
                config.kola.distro = distro;
            }
            list_tests(&config)
        }
        Commands::Validate => validate_config(&cli.config),
        Commands::Spawn {
            count,
            userdata,
            userdata_kind,
            platform,
        } => {
            let mut config = load(&cli.config)?;
            if let Some(platform) = platform {
                config.kola.platform = platform;
            }
            spawn(&config, count, userdata.as_deref(), userdata_kind).await
        }
    }
}

fn load(path: &Path) -> Result<Config> {
    let config = config::load_config_or_default(path)
        .with_context(|| format!("Failed to load config from {}", path.display()))?;
    Ok(config)
}

fn registry() -> Result<Registry> {
    let mut builder = RegistryBuilder::new();
    kola::suite::register_all(&mut builder).context("Failed to register tests")?;
    Ok(builder.freeze())
}

fn selection(config: &Config, pattern: Option<&str>) -> Result<Selection> {
    Ok(Selection {
        platform: config.kola.platform,
        distro: config.kola.distro.clone(),
        architecture: config.kola.architecture().to_string(),
        pattern: pattern.map(NamePattern::new).transpose()?,
    })
}

async fn run_tests(config: Config, pattern: Option<&str>, verbose: bool) -> Result<i32> {
    config.validate().context("Invalid configuration")?;

    let registry = registry()?;
    let tests = registry.select(&selection(&config, pattern)?);
    info!(
        "Selected {} of {} tests for {} ({})",
        tests.len(),
        registry.len(),
        config.kola.platform,
        config.kola.distro
    );

    let mut reporter = MultiReporter::new().with_reporter(ConsoleReporter::new(verbose));
    if let Some(path) = &config.kola.tapfile {
        reporter = reporter.with_reporter(TapReporter::new(path.clone()));
    }
    if let Some(path) = &config.kola.junit_file {
        reporter = reporter.with_reporter(JUnitReporter::new(path.clone()));
    }

    let result = with_provider!(&config.clone(), |provider| {
        Harness::new(config, provider, reporter).run(&tests).await?
    });
    Ok(result.exit_code())
}

fn list_tests(config: &Config) -> Result<()> {
    let registry = registry()?;
    let selection = selection(config, None)?;

    println!(
        "Tests for {} ({}, {}):",
        config.kola.platform,
        config.kola.distro,
        config.kola.architecture()
    );
    for test in registry.iter() {
        let marker = if test.matches(&selection) {
            console::style("*").green()
        } else {
            console::style(" ").dim()
        };
        let or_any = |list: &[String]| {
            if list.is_empty() {
                "any".to_string()
            } else {
                list.join(",")
            }
        };
        let mut line = format!(
            "{} {:<40} machines={} platforms={} distros={}",
            marker,
            test.name,
            test.cluster_size,
            or_any(&test.platforms),
            or_any(&test.distros)
        );
        if !test.exclude_platforms.is_empty() {
            line.push_str(&format!(" exclude={}", test.exclude_platforms.join(",")));
        }
        println!("{}", line);
    }
    Ok(())
}

fn validate_config(path: &Path) -> Result<()> {
    let config = load(path)?;
    config.validate().context("Invalid configuration")?;

    println!("Configuration is valid!");
    println!();
    print!(
        "{}",
        toml::to_string_pretty(&config).context("Failed to render configuration")?
    );
    Ok(())
}

async fn spawn(
    config: &Config,
    count: usize,
    userdata: Option<&Path>,
    kind: PayloadKind,
) -> Result<()> {
    config.validate().context("Invalid configuration")?;
    if count == 0 {
        bail!("--count must be at least 1");
    }

    let payload = match userdata {
        Some(path) => {
            let data = std::fs::read(path)
                .with_context(|| format!("Failed to read userdata: {}", path.display()))?;
            BootPayload::from_bytes(kind, data)
        }
        None => BootPayload::empty(),
    };

    with_provider!(config, |provider| {
        spawn_with(config, provider, count, &payload).await
    })
}

async fn spawn_with<P: Provider>(
    config: &Config,
    provider: P,
    count: usize,
    payload: &BootPayload,
) -> Result<()> {
    let cluster_config = ClusterConfig::for_label(config, "spawn");
    let cluster = provider
        .new_cluster(&cluster_config)
        .await
        .context("Failed to create cluster")?;

    let outcome = match cluster.new_machines(payload, count).await {
        Ok(machines) => {
            for m in &machines {
                let target = m.ssh_target();
                println!(
                    "{}\t{}\t{}\tssh -p {} {}@{}",
                    m.id(),
                    m.ip(),
                    m.private_ip(),
                    target.port,
                    config.ssh.user,
                    target.host
                );
            }
            println!("Press Ctrl-C to destroy the cluster");
            tokio::signal::ctrl_c()
                .await
                .context("Failed to wait for Ctrl-C")
        }
        Err(e) => Err(anyhow::Error::new(e).context("Failed to create machines")),
    };

    for e in cluster.destroy().await {
        warn!("teardown: {}", e);
    }
    outcome
}
