use anyhow::{Context, Result};
use clap::Parser;
use std::env;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_path: String,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Local S3-compatible object store server")]
pub struct Args {
    /// Host to bind to (overrides BLOBDEPOT_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides BLOBDEPOT_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where object payloads are stored (overrides BLOBDEPOT_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Path of the SQLite metadata database (overrides BLOBDEPOT_DATABASE_PATH)
    #[arg(long)]
    pub database_path: Option<String>,

    /// Apply the schema and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        Self::merge(args)
    }

    fn merge(args: Args) -> Result<(Self, bool)> {
        let env_host = env::var("BLOBDEPOT_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = match env::var("BLOBDEPOT_PORT") {
            Ok(value) => value
                .parse::<u16>()
                .with_context(|| format!("parsing BLOBDEPOT_PORT value `{}`", value))?,
            Err(env::VarError::NotPresent) => 9090,
            Err(err) => return Err(err).context("reading BLOBDEPOT_PORT"),
        };
        let env_storage =
            env::var("BLOBDEPOT_STORAGE_DIR").unwrap_or_else(|_| "./data/objects".into());
        let env_db = env::var("BLOBDEPOT_DATABASE_PATH")
            .unwrap_or_else(|_| "./data/meta/blobdepot.db".into());

        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_path: args.database_path.unwrap_or(env_db),
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
