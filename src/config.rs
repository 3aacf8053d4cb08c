use anyhow::{Context, Result};
use chrono::Duration;
use clap::Parser;
use std::{env, str::FromStr};

/// Tunables of the metadata engine.
#[derive(Debug, Clone)]
pub struct MetadataConfig {
    /// Age after which an unconfirmed single-part write counts as failed.
    pub failed_put_timeout: Duration,
    /// Age after which an unfinished multipart upload counts as failed.
    pub multipart_timeout: Duration,
    /// Upper bound on entries per listing page.
    pub max_listing_keys: usize,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            failed_put_timeout: Duration::hours(168),
            multipart_timeout: Duration::hours(168),
            max_listing_keys: 1000,
        }
    }
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    /// Seconds between maintenance passes; 0 disables the worker.
    pub maintenance_interval_secs: u64,
    pub metadata: MetadataConfig,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Object metadata engine for an S3-compatible gateway")]
pub struct Args {
    /// Host to bind the operator API to (overrides OBJECT_META_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides OBJECT_META_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory of the local backend content store (overrides OBJECT_META_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides OBJECT_META_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Hours before an unconfirmed write is reported as failed (overrides OBJECT_META_FAILED_PUT_TIMEOUT_HOURS)
    #[arg(long)]
    pub failed_put_timeout_hours: Option<i64>,

    /// Hours before an unfinished multipart upload is reported as failed (overrides OBJECT_META_MULTIPART_TIMEOUT_HOURS)
    #[arg(long)]
    pub multipart_timeout_hours: Option<i64>,

    /// Seconds between maintenance passes, 0 to disable (overrides OBJECT_META_MAINTENANCE_INTERVAL_SECS)
    #[arg(long)]
    pub maintenance_interval_secs: Option<u64>,

    /// Maximum entries per listing page (overrides OBJECT_META_MAX_LISTING_KEYS)
    #[arg(long)]
    pub max_listing_keys: Option<usize>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let defaults = MetadataConfig::default();

        // --- Environment fallback ---
        let env_host = env::var("OBJECT_META_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_or("OBJECT_META_PORT", 3000u16)?;
        let env_storage =
            env::var("OBJECT_META_STORAGE_DIR").unwrap_or_else(|_| "./data/objects".into());
        let env_db = env::var("OBJECT_META_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/object_meta.db".into());
        let env_failed = env_or(
            "OBJECT_META_FAILED_PUT_TIMEOUT_HOURS",
            defaults.failed_put_timeout.num_hours(),
        )?;
        let env_multipart = env_or(
            "OBJECT_META_MULTIPART_TIMEOUT_HOURS",
            defaults.multipart_timeout.num_hours(),
        )?;
        let env_interval = env_or("OBJECT_META_MAINTENANCE_INTERVAL_SECS", 300u64)?;
        let env_max_keys = env_or("OBJECT_META_MAX_LISTING_KEYS", defaults.max_listing_keys)?;

        // --- Merge ---
        let metadata = MetadataConfig {
            failed_put_timeout: Duration::hours(args.failed_put_timeout_hours.unwrap_or(env_failed)),
            multipart_timeout: Duration::hours(args.multipart_timeout_hours.unwrap_or(env_multipart)),
            max_listing_keys: args.max_listing_keys.unwrap_or(env_max_keys).max(1),
        };
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            maintenance_interval_secs: args.maintenance_interval_secs.unwrap_or(env_interval),
            metadata,
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Read and parse `name`, falling back to `default` when it is unset.
fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}
