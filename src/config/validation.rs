use anyhow::{Context, Result};
use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use garde::Validate;

use super::AppConfig;

#[derive(Parser, Clone, Debug, Default)]
#[command(name = "bucket-telemetry", about = "Per-bucket HTTP telemetry front end")]
pub struct Cli {
    /// Path to an extra configuration file, merged after the environment file
    #[arg(long, env = "APP_CONFIG")]
    pub config: Option<std::path::PathBuf>,

    /// Server port
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    /// Environment name
    #[arg(long, env = "ENVIRONMENT")]
    pub environment: Option<String>,

    /// Upstream S3 gateway to forward requests to
    #[arg(long)]
    pub upstream: Option<String>,

    /// Admin service endpoint for bucket owner lookups
    #[arg(long)]
    pub admin_endpoint: Option<String>,

    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,
}

/// Build the layered configuration source
///
/// Precedence, lowest first: embedded defaults, `config/default.toml`,
/// `config/{environment}.toml`, the `--config` file, `APP_`-prefixed
/// environment variables (`__` separates sections), CLI flags.
pub fn figment(cli: &Cli) -> Figment {
    let env_name = cli.environment.clone().unwrap_or_else(|| {
        std::env::var("ENVIRONMENT").unwrap_or_else(|_| "production".to_string())
    });

    let mut figment = Figment::new()
        .merge(Serialized::defaults(AppConfig::default()))
        .merge(Toml::file("config/default.toml"))
        .merge(Toml::file(format!("config/{}.toml", env_name)));

    if let Some(path) = &cli.config {
        figment = figment.merge(Toml::file(path));
    }

    figment = figment
        .merge(Env::prefixed("APP_").split("__"))
        .merge(Serialized::default("environment", env_name.to_lowercase()));

    if let Some(port) = cli.port {
        figment = figment.merge(Serialized::default("server.port", port));
    }
    if let Some(upstream) = &cli.upstream {
        figment = figment.merge(Serialized::default("server.upstream", upstream));
    }
    if let Some(endpoint) = &cli.admin_endpoint {
        figment = figment.merge(Serialized::default("ownership.admin_endpoint", endpoint));
    }
    if cli.debug {
        figment = figment.merge(Serialized::default("logging.level", "debug"));
    }

    figment
}

/// Extract and validate configuration from a figment
pub fn load_from(figment: Figment) -> Result<AppConfig> {
    let config: AppConfig = figment
        .extract()
        .context("Failed to parse configuration")?;

    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    Ok(config)
}

/// Load configuration from files, environment and command line
pub fn load_config() -> Result<AppConfig> {
    let cli = Cli::parse();
    load_from(figment(&cli))
}
