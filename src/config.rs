use crate::error::{AppError, Result};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Read-only OPDS catalog server for Calibre libraries.
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "calibre-opds")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to config file.
    #[arg(short, long, env = "OPDS_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Calibre library directory (the one holding metadata.db).
    #[arg(short, long, env = "CALIBRE_LIBRARY_PATH", global = true)]
    pub library: Option<PathBuf>,

    /// Number of entries per feed page.
    #[arg(long, env = "PAGE_SIZE", global = true)]
    pub page_size: Option<u32>,

    /// Address to bind the server to.
    #[arg(short, long, env = "BIND_ADDR", global = true)]
    pub bind: Option<SocketAddr>,

    /// Catalog title shown to OPDS clients.
    #[arg(long, env = "OPDS_TITLE", global = true)]
    pub title: Option<String>,

    /// Public URL prefix for generated links (when behind a proxy).
    #[arg(long, env = "OPDS_BASE_URL", global = true)]
    pub base_url: Option<String>,

    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// CLI subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start the server (default if no command given).
    Serve,

    /// Validate configuration and check that the catalog can be read.
    Check,

    /// Write a default config file.
    Init {
        /// Force overwrite existing config.
        #[arg(short, long)]
        force: bool,
    },
}

/// Main configuration from TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Catalog configuration.
    #[serde(default)]
    pub catalog: CatalogConfig,

    /// Feed configuration.
    #[serde(default)]
    pub feed: FeedConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to.
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,

    /// Catalog title.
    #[serde(default = "default_title")]
    pub title: String,

    /// Prefix for generated links, e.g. `https://example.org/library`.
    /// Empty means root-relative links.
    #[serde(default)]
    pub base_url: String,

    /// Upper bound on the time spent serving one request.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            title: default_title(),
            base_url: String::new(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl ServerConfig {
    /// Request timeout as a duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn default_bind() -> SocketAddr {
    SocketAddr::new(
        std::net::IpAddr::V4(std::net::Ipv4Addr::new(0, 0, 0, 0)),
        8080,
    )
}

fn default_title() -> String {
    "Calibre OPDS Catalog".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

/// Calibre catalog configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Calibre library directory.
    #[serde(default = "default_library_path")]
    pub library_path: PathBuf,

    /// Database file name inside the library directory.
    #[serde(default = "default_database_file")]
    pub database_file: String,

    /// Idle read-only connections kept for reuse.
    #[serde(default = "default_max_idle_connections")]
    pub max_idle_connections: usize,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            library_path: default_library_path(),
            database_file: default_database_file(),
            max_idle_connections: default_max_idle_connections(),
        }
    }
}

fn default_library_path() -> PathBuf {
    PathBuf::from("/books")
}

fn default_database_file() -> String {
    "metadata.db".to_string()
}

fn default_max_idle_connections() -> usize {
    4
}

/// Feed rendering configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Entries per page in navigation and acquisition feeds.
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
        }
    }
}

fn default_page_size() -> u32 {
    30
}

impl Config {
    /// Load configuration from file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("Failed to read config file: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| AppError::Config(format!("Failed to parse config file: {}", e)))
    }

    /// Find config file in default locations.
    pub fn find_config_file() -> Option<PathBuf> {
        let candidates = [
            PathBuf::from("config.toml"),
            PathBuf::from("calibre-opds.toml"),
            dirs::config_dir()
                .map(|p| p.join("calibre-opds").join("config.toml"))
                .unwrap_or_default(),
            PathBuf::from("/etc/calibre-opds/config.toml"),
        ];

        candidates
            .into_iter()
            .find(|p| !p.as_os_str().is_empty() && p.exists())
    }

    /// Resolve the process configuration: file (explicit or discovered),
    /// then CLI/environment overrides, then validation.
    pub fn resolve(cli: &Cli) -> Result<Self> {
        let config_path = cli.config.clone().or_else(Self::find_config_file);

        let mut config = match config_path {
            Some(ref path) => Self::load(path)?,
            None => Self::default(),
        };

        config.apply_overrides(cli);
        config.validate()?;
        Ok(config)
    }

    /// Apply CLI flags and environment variables on top of file values.
    pub fn apply_overrides(&mut self, cli: &Cli) {
        if let Some(ref library) = cli.library {
            self.catalog.library_path = library.clone();
        }
        if let Some(page_size) = cli.page_size {
            self.feed.page_size = page_size;
        }
        if let Some(bind) = cli.bind {
            self.server.bind = bind;
        }
        if let Some(ref title) = cli.title {
            self.server.title = title.clone();
        }
        if let Some(ref base_url) = cli.base_url {
            self.server.base_url = base_url.clone();
        }
        self.server.base_url = self.server.base_url.trim_end_matches('/').to_string();
    }

    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.feed.page_size == 0 {
            return Err(AppError::Config(
                "page size must be a positive integer".to_string(),
            ));
        }

        if self.server.request_timeout_secs == 0 {
            return Err(AppError::Config(
                "request timeout must be at least one second".to_string(),
            ));
        }

        if self.catalog.max_idle_connections == 0 {
            return Err(AppError::Config(
                "max_idle_connections must be at least 1".to_string(),
            ));
        }

        let file = Path::new(&self.catalog.database_file);
        if self.catalog.database_file.is_empty()
            || file.file_name().map(|n| n != file.as_os_str()).unwrap_or(true)
        {
            return Err(AppError::Config(format!(
                "database_file must be a plain file name, got {:?}",
                self.catalog.database_file
            )));
        }

        let library = &self.catalog.library_path;
        if !library.exists() {
            return Err(AppError::Config(format!(
                "library directory does not exist: {}",
                library.display()
            )));
        }
        if !library.is_dir() {
            return Err(AppError::Config(format!(
                "library path is not a directory: {}",
                library.display()
            )));
        }

        Ok(())
    }

    /// Generate default config file content.
    pub fn generate_default() -> String {
        r#"# calibre-opds configuration

[server]
bind = "0.0.0.0:8080"
title = "Calibre OPDS Catalog"
# base_url = "https://example.org/library"
request_timeout_secs = 30

[catalog]
# Calibre library directory (mounted read-only is fine)
library_path = "/books"
database_file = "metadata.db"
max_idle_connections = 4

[feed]
page_size = 30
"#
        .to_string()
    }
}
