//! kola: an integration test harness for OS images.
//!
//! Tests are registered once at startup, selected for a platform and
//! distribution, and run in parallel. Every test gets a fresh cluster of
//! machines booted with its payload; the cluster is torn down after the
//! test whatever the outcome.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Platform**: providers that create clusters and machines (AWS,
//!   DigitalOcean, ESX, GCE, OCI, Packet, QEMU)
//! - **Register**: the test registry and selection
//! - **Harness**: the worker pool that runs tests and decides outcomes
//! - **Report**: console progress, TAP and JUnit XML output
//!
//! # Example
//!
//! ```no_run
//! use kola::config::load_config;
//! use kola::harness::Harness;
//! use kola::platform::machine::qemu::QemuProvider;
//! use kola::register::{RegistryBuilder, Selection};
//! use kola::report::ConsoleReporter;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("kola.toml"))?;
//!
//!     let mut builder = RegistryBuilder::new();
//!     kola::suite::register_all(&mut builder)?;
//!     let registry = builder.freeze();
//!
//!     let tests = registry.select(&Selection {
//!         platform: config.kola.platform,
//!         distro: config.kola.distro.clone(),
//!         architecture: config.kola.architecture().to_string(),
//!         pattern: None,
//!     });
//!
//!     let provider = QemuProvider::new(config.qemu.clone(), &config.kola.board);
//!     let harness = Harness::new(config, provider, ConsoleReporter::new(false));
//!     let result = harness.run(&tests).await?;
//!     std::process::exit(result.exit_code());
//! }
//! ```

pub mod conf;
pub mod config;
pub mod harness;
pub mod platform;
pub mod register;
pub mod report;
pub mod ssh;
pub mod suite;
pub mod util;

// Re-export commonly used types
pub use config::{Config, load_config};
pub use harness::{Harness, RunResult, TestAbort, TestCluster, TestOutcome, TestResult};
pub use platform::{Cluster, Machine, Provider, ProviderError};
pub use register::{Registry, RegistryBuilder, Test};
pub use report::Reporter;
