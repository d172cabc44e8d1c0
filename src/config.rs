use clap::{Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Database bridge, file streamer and library watcher for an e-book server.
#[derive(Parser, Debug, Clone)]
#[command(name = "ebook-bridge")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to config file.
    #[arg(short, long, env = "EBOOK_BRIDGE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Execute one SQL request read as JSON from stdin.
    Db {
        /// Result shape to produce.
        #[arg(value_enum)]
        mode: BridgeMode,
    },

    /// Stream an object from the configured S3 bucket to stdout.
    #[command(name = "s3-stream")]
    S3Stream {
        /// Object key.
        #[arg(long)]
        key: String,
        /// HTTP Range header value, forwarded verbatim.
        #[arg(long)]
        range: Option<String>,
    },

    /// Stream a local book file to stdout.
    #[command(name = "serve-file")]
    ServeFile {
        /// Absolute path of the file.
        #[arg(long)]
        path: PathBuf,
        /// Declared book file type.
        #[arg(long, value_enum)]
        file_type: BookFormat,
        /// HTTP Range header value.
        #[arg(long)]
        range: Option<String>,
    },

    /// Apply pending schema migrations.
    Migrate {
        /// Database file (defaults to the configured path).
        #[arg(long)]
        db: Option<PathBuf>,
        /// Initial migration script (defaults to the bundled script).
        #[arg(long)]
        script: Option<PathBuf>,
    },

    /// Watch a local library directory and keep the database in sync.
    Watch {
        /// Library root directory.
        #[arg(short, long)]
        library: Option<PathBuf>,
        /// Cover output directory.
        #[arg(long)]
        covers: Option<PathBuf>,
    },

    /// Poll the configured S3 bucket and keep the database in sync.
    #[command(name = "watch-s3")]
    WatchS3,

    /// User management commands.
    User {
        /// User subcommand action.
        #[command(subcommand)]
        action: UserCommand,
    },

    /// Library maintenance commands.
    Library {
        /// Library subcommand action.
        #[command(subcommand)]
        action: LibraryCommand,
    },
}

/// Bridge result shapes.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeMode {
    /// All rows.
    #[value(name = "query-all")]
    QueryAll,
    /// First row or null.
    #[value(name = "query-one")]
    QueryOne,
    /// Number of changed rows.
    #[value(name = "execute")]
    Execute,
}

/// User management subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum UserCommand {
    /// Add a new user.
    Add {
        /// Email address used to log in.
        email: String,
        /// Password (will prompt if not provided).
        #[arg(short, long)]
        password: Option<String>,
        /// User role (admin or user).
        #[arg(short, long, default_value = "user")]
        role: String,
        /// Display name.
        #[arg(short, long)]
        name: Option<String>,
    },

    /// List all users.
    List,
}

/// Library maintenance subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum LibraryCommand {
    /// Delete every book row and cover file.
    Clear,

    /// Print the library version counter.
    Version,
}

/// Main configuration from TOML file, overridden by environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Library directories.
    #[serde(default)]
    pub library: LibraryConfig,

    /// Watcher configuration.
    #[serde(default)]
    pub scan: ScanConfig,

    /// Object storage configuration.
    #[serde(default)]
    pub s3: S3Config,
}

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/library.db")
}

/// Library configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryConfig {
    /// Root directory holding book files.
    #[serde(default = "default_library_path")]
    pub path: PathBuf,

    /// Directory for extracted covers.
    #[serde(default = "default_covers_dir")]
    pub covers_dir: PathBuf,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            path: default_library_path(),
            covers_dir: default_covers_dir(),
        }
    }
}

fn default_library_path() -> PathBuf {
    PathBuf::from("library")
}

fn default_covers_dir() -> PathBuf {
    PathBuf::from("data/covers")
}

/// Scan configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Poll interval of the local watcher in milliseconds.
    #[serde(default = "default_scan_interval")]
    pub interval_ms: u64,

    /// Number of parallel workers for the initial scan (1 = sequential).
    /// Keep low for NAS/network storage to avoid saturation.
    #[serde(default = "default_scan_workers")]
    pub workers: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_scan_interval(),
            workers: default_scan_workers(),
        }
    }
}

fn default_scan_interval() -> u64 {
    2000
}

fn default_scan_workers() -> usize {
    1
}

/// S3-compatible object storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    /// Bucket name.
    pub bucket: Option<String>,
    /// Access key ID.
    pub access_key: Option<String>,
    /// Secret access key.
    pub secret_key: Option<String>,
    /// Custom endpoint for non-AWS services.
    pub endpoint: Option<String>,
    /// Region.
    #[serde(default = "default_region")]
    pub region: String,
    /// Key prefix acting as a virtual directory.
    pub prefix: Option<String>,
    /// Seconds between remote-source polls.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Overall stream timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Request attempts including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket: None,
            access_key: None,
            secret_key: None,
            endpoint: None,
            region: default_region(),
            prefix: None,
            poll_interval_secs: default_poll_interval(),
            timeout_secs: default_timeout(),
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_poll_interval() -> u64 {
    60
}

fn default_timeout() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    3
}

/// Validated S3 credentials.
#[derive(Debug, Clone)]
pub struct S3Credentials {
    /// Bucket name.
    pub bucket: String,
    /// Access key ID.
    pub access_key: String,
    /// Secret access key.
    pub secret_key: String,
}

impl S3Config {
    /// Return the credentials, or a configuration error naming what is missing.
    pub fn credentials(&self) -> crate::error::Result<S3Credentials> {
        let missing: Vec<&str> = [
            ("S3_BUCKET", &self.bucket),
            ("S3_ACCESS_KEY", &self.access_key),
            ("S3_SECRET_KEY", &self.secret_key),
        ]
        .into_iter()
        .filter(|(_, v)| v.as_deref().is_none_or(str::is_empty))
        .map(|(name, _)| name)
        .collect();

        if !missing.is_empty() {
            return Err(crate::error::AppError::Config(format!(
                "Missing S3 configuration: {}",
                missing.join(", ")
            )));
        }

        Ok(S3Credentials {
            bucket: self.bucket.clone().unwrap_or_default(),
            access_key: self.access_key.clone().unwrap_or_default(),
            secret_key: self.secret_key.clone().unwrap_or_default(),
        })
    }

    /// Overall stream timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Config {
    /// Load configuration from file.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::error::AppError::Config(format!("Failed to read config file: {}", e))
        })?;

        toml::from_str(&content).map_err(|e| {
            crate::error::AppError::Config(format!("Failed to parse config file: {}", e))
        })
    }

    /// Load `explicit`, else the first default location found, else defaults.
    pub fn resolve(explicit: Option<&Path>) -> crate::error::Result<Self> {
        match explicit.map(Path::to_path_buf).or_else(Self::find_config_file) {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    /// Find config file in default locations.
    pub fn find_config_file() -> Option<PathBuf> {
        let candidates = [
            PathBuf::from("ebook-bridge.toml"),
            dirs::config_dir()
                .map(|p| p.join("ebook-bridge").join("config.toml"))
                .unwrap_or_default(),
        ];

        candidates.into_iter().find(|p| p.is_file())
    }

    /// Apply environment overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_vars(|name| std::env::var(name).ok());
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn apply_vars(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |name: &str| lookup(name).filter(|v| !v.is_empty());

        if let Some(v) = get("DATABASE_PATH") {
            self.database.path = PathBuf::from(v);
        }
        if let Some(v) = get("LIBRARY_PATH") {
            self.library.path = PathBuf::from(v);
        }
        if let Some(v) = get("COVERS_PATH") {
            self.library.covers_dir = PathBuf::from(v);
        }
        if let Some(v) = get("S3_BUCKET") {
            self.s3.bucket = Some(v);
        }
        if let Some(v) = get("S3_ACCESS_KEY") {
            self.s3.access_key = Some(v);
        }
        if let Some(v) = get("S3_SECRET_KEY") {
            self.s3.secret_key = Some(v);
        }
        if let Some(v) = get("S3_ENDPOINT") {
            self.s3.endpoint = Some(v);
        }
        if let Some(v) = get("S3_REGION") {
            self.s3.region = v;
        }
        if let Some(v) = get("S3_PREFIX") {
            self.s3.prefix = Some(v);
        }
        if let Some(v) = get("S3_POLL_INTERVAL").and_then(|v| v.parse().ok()) {
            self.s3.poll_interval_secs = v;
        }
        if let Some(v) = get("S3_TIMEOUT").and_then(|v| v.parse().ok()) {
            self.s3.timeout_secs = v;
        }
    }
}

/// Supported book formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BookFormat {
    /// EPUB format (Electronic Publication).
    Epub,
    /// PDF format (Portable Document Format).
    Pdf,
}

impl BookFormat {
    /// Get the MIME type for this format.
    pub fn mime_type(&self) -> &'static str {
        match self {
            BookFormat::Epub => "application/epub+zip",
            BookFormat::Pdf => "application/pdf",
        }
    }

    /// Value stored in the `file_type` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            BookFormat::Epub => "epub",
            BookFormat::Pdf => "pdf",
        }
    }

    /// Try to detect format from file extension.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "epub" => Some(BookFormat::Epub),
            "pdf" => Some(BookFormat::Pdf),
            _ => None,
        }
    }

    /// Detect format from a path or object key.
    pub fn from_path(path: impl AsRef<Path>) -> Option<Self> {
        path.as_ref()
            .extension()
            .and_then(|e| e.to_str())
            .and_then(Self::from_extension)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn env_overrides_file_values() {
        let vars: HashMap<&str, &str> = [
            ("DATABASE_PATH", "/srv/db.sqlite"),
            ("S3_BUCKET", "books"),
            ("S3_TIMEOUT", "5"),
            ("S3_PREFIX", ""),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_vars(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(config.database.path, PathBuf::from("/srv/db.sqlite"));
        assert_eq!(config.s3.bucket.as_deref(), Some("books"));
        assert_eq!(config.s3.timeout_secs, 5);
        assert_eq!(config.s3.prefix, None);
    }

    #[test]
    fn missing_credentials_is_config_error() {
        let config = S3Config {
            bucket: Some("books".into()),
            ..S3Config::default()
        };
        let err = config.credentials().unwrap_err();
        assert_eq!(err.kind(), "config");
        assert!(err.to_string().contains("S3_ACCESS_KEY"));
        assert!(!err.to_string().contains("S3_BUCKET"));
    }

    #[test]
    fn unreadable_config_reports_config_kind() {
        let dir = tempfile::tempdir().unwrap();
        let broken = dir.path().join("broken.toml");
        std::fs::write(&broken, "[database\npath = 1").unwrap();

        for path in [broken, dir.path().join("missing.toml")] {
            let err = Config::resolve(Some(&path)).unwrap_err();
            assert_eq!(err.kind(), "config");

            // What the binary prints is understood by stream callers.
            let line = format!("error[{}]: {}", err.kind(), err);
            assert!(matches!(
                crate::stream::client::failure_from_stderr(&line, Duration::from_secs(30)),
                crate::error::AppError::Config(_)
            ));
        }
    }

    #[test]
    fn format_detection_is_case_insensitive() {
        assert_eq!(BookFormat::from_path("a/B.PDF"), Some(BookFormat::Pdf));
        assert_eq!(BookFormat::from_path("x.epub"), Some(BookFormat::Epub));
        assert_eq!(BookFormat::from_path("x.mobi"), None);
        assert_eq!(BookFormat::from_path("noext"), None);
    }

    #[test]
    fn parses_toml_sections() {
        let config: Config = toml::from_str(
            r#"
            [database]
            path = "/var/lib/books.db"
            [scan]
            workers = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.database.path, PathBuf::from("/var/lib/books.db"));
        assert_eq!(config.scan.workers, 4);
        assert_eq!(config.s3.timeout_secs, 30);
    }
}
