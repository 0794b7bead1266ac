//! Configuration management for s3sync.
//!
//! Built-in defaults, overlaid by a TOML file, overlaid by `S3SYNC_*`
//! environment variables (`S3SYNC_SYNC__DEFAULT_BUCKET=photos`).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::inventory::{Destination, PathFilter};
use crate::store::{ClientOptions, RemoteFingerprint, S3StoreConfig};
use crate::sync::{CorruptManifestPolicy, SessionOptions};
use crate::utils::errors::{Result, SyncError};

/// Directory under the home directory holding the user config.
pub const CONFIG_DIR: &str = ".s3sync";
pub const CONFIG_FILE: &str = "config.toml";
pub const ENV_PREFIX: &str = "S3SYNC";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub aws: AwsConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwsConfig {
    #[serde(default = "default_region")]
    pub region: String,

    /// Named profile from ~/.aws/config
    #[serde(default)]
    pub profile: Option<String>,

    /// S3-compatible endpoint (MinIO, LocalStack)
    #[serde(default)]
    pub endpoint_url: Option<String>,

    /// Attempts per request including the first; SDK default when unset
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Bucket used when a command does not name one
    #[serde(default)]
    pub default_bucket: Option<String>,

    /// Key prefix used when a command does not name one
    #[serde(default)]
    pub prefix: Option<String>,

    /// Gitignore-style exclusion patterns
    #[serde(default = "default_exclude")]
    pub exclude: Vec<String>,

    /// Semaphore budget shared by concurrent transfers
    #[serde(default = "default_max_concurrent_transfers")]
    pub max_concurrent_transfers: u32,

    #[serde(default)]
    pub remote_fingerprint: RemoteFingerprint,

    /// Continue as on a first run when the manifest cannot be parsed
    #[serde(default)]
    pub recover_corrupt_manifest: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_exclude() -> Vec<String> {
    vec![".DS_Store".to_string(), "Thumbs.db".to_string(), ".git/".to_string()]
}

fn default_max_concurrent_transfers() -> u32 {
    16
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            profile: None,
            endpoint_url: None,
            max_attempts: None,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            default_bucket: None,
            prefix: None,
            exclude: default_exclude(),
            max_concurrent_transfers: default_max_concurrent_transfers(),
            remote_fingerprint: RemoteFingerprint::default(),
            recover_corrupt_manifest: false,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a single TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// `~/.s3sync/config.toml`, if a home directory is known.
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(CONFIG_DIR).join(CONFIG_FILE))
    }

    /// Layered load. An explicit `path` must exist; the default path is
    /// used only when present. Returns the file that was read, if any.
    pub fn load(path: Option<&Path>) -> anyhow::Result<(Self, Option<PathBuf>)> {
        let file = match path {
            Some(path) => Some(path.to_path_buf()),
            None => Self::default_path().filter(|p| p.is_file()),
        };

        let mut builder = ::config::Config::builder().add_source(::config::Config::try_from(&Config::default())?);
        if let Some(file) = &file {
            builder = builder.add_source(
                ::config::File::from(file.as_path())
                    .format(::config::FileFormat::Toml)
                    .required(true),
            );
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("sync.exclude")
                .try_parsing(true),
        );

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok((config, file))
    }

    pub fn validate(&self) -> Result<()> {
        if self.sync.max_concurrent_transfers == 0 {
            return Err(SyncError::Config(
                "sync.max_concurrent_transfers must be at least 1".to_string(),
            ));
        }
        if self.aws.max_attempts == Some(0) {
            return Err(SyncError::Config("aws.max_attempts must be at least 1".to_string()));
        }
        self.path_filter()?;
        Ok(())
    }

    pub fn path_filter(&self) -> Result<PathFilter> {
        PathFilter::new(&self.sync.exclude)
    }

    /// Bucket from the command line, else the configured default.
    pub fn resolve_destination(&self, bucket: Option<&str>, prefix: Option<&str>) -> Result<Destination> {
        let bucket = bucket
            .map(str::to_string)
            .or_else(|| self.sync.default_bucket.clone())
            .filter(|b| !b.is_empty())
            .ok_or_else(|| {
                SyncError::Config("no bucket given and sync.default_bucket is not set".to_string())
            })?;

        let destination = Destination::new(bucket);
        Ok(match prefix.map(str::to_string).or_else(|| self.sync.prefix.clone()) {
            Some(prefix) => destination.with_prefix(prefix),
            None => destination,
        })
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            region: Some(self.aws.region.clone()),
            profile: self.aws.profile.clone(),
            endpoint_url: self.aws.endpoint_url.clone(),
            max_attempts: self.aws.max_attempts,
        }
    }

    pub fn store_config(&self, destination: Destination) -> Result<S3StoreConfig> {
        Ok(S3StoreConfig::new(destination)
            .with_client(self.client_options())
            .with_fingerprint(self.sync.remote_fingerprint)
            .with_filter(self.path_filter()?))
    }

    /// `recover` forces manifest recovery regardless of configuration.
    pub fn session_options(&self, recover: bool) -> SessionOptions {
        let corrupt_manifest = if recover || self.sync.recover_corrupt_manifest {
            CorruptManifestPolicy::TreatAsEmpty
        } else {
            CorruptManifestPolicy::Fail
        };

        SessionOptions {
            concurrency_budget: self.sync.max_concurrent_transfers,
            corrupt_manifest,
        }
    }
}
