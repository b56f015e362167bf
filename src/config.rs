//! Configuration loading and schema definitions for kola.
//!
//! Configuration is a TOML file with one section for run settings, one for
//! SSH access, and one per provisioning platform. See [`schema`] for the
//! full set of keys and their defaults.

pub mod schema;

pub use schema::*;

use std::path::Path;

use anyhow::{Context, Result};

/// Loads kola configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read (e.g., doesn't exist or permission denied)
/// - The file contains invalid TOML syntax
/// - The configuration doesn't match the expected schema
///
/// # Example
///
/// ```no_run
/// use kola::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("kola.toml"))?;
/// println!("Platform: {}", config.kola.platform);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Like [`load_config`], but a missing file yields the defaults.
pub fn load_config_or_default(path: &Path) -> Result<Config> {
    if !path.exists() {
        tracing::debug!("{} not found, using default configuration", path.display());
        return Ok(Config::default());
    }
    load_config(path)
}

/// Loads kola configuration from a TOML string.
///
/// # Example
///
/// ```
/// use kola::config::{load_config_str, Platform};
///
/// let config = load_config_str(r#"
///     [kola]
///     platform = "aws"
///     parallel = 4
///
///     [aws]
///     ami = "ami-0123456789abcdef0"
/// "#)?;
///
/// assert_eq!(config.kola.platform, Platform::Aws);
/// assert_eq!(config.kola.parallel, 4);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    Ok(config)
}
