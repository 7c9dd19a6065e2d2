use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/feedback-decryptor/conf.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid config document: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config value for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// A non-empty, ordered list of email addresses.
///
/// Accepts either a single string or a list of strings in the config
/// document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "OneOrMany", into = "Vec<String>")]
pub struct Recipients(Vec<String>);

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl TryFrom<OneOrMany> for Recipients {
    type Error = String;

    fn try_from(value: OneOrMany) -> Result<Self, Self::Error> {
        let addrs = match value {
            OneOrMany::One(addr) => vec![addr],
            OneOrMany::Many(addrs) => addrs,
        };
        Recipients::new(addrs)
    }
}

impl From<Recipients> for Vec<String> {
    fn from(value: Recipients) -> Self {
        value.0
    }
}

impl Recipients {
    pub fn new<I, S>(addrs: I) -> Result<Self, String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let addrs: Vec<String> = addrs
            .into_iter()
            .map(Into::into)
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty())
            .collect();
        if addrs.is_empty() {
            return Err("at least one recipient address is required".to_string());
        }
        Ok(Recipients(addrs))
    }

    pub fn single(addr: impl Into<String>) -> Result<Self, String> {
        Self::new([addr.into()])
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.0.iter()
    }
}

/// A string that never shows up in `Debug` output.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Secret(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("Secret(<empty>)")
        } else {
            f.write_str("Secret(<redacted>)")
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub private_key_pem_file: String,
    #[serde(default)]
    pub private_key_password: Secret,
    pub decrypted_email_recipient: Recipients,
    pub aws_region: String,
    pub s3_bucket_name: String,
    pub psi_ops_path: String,
    pub psinet_file_path: String,
    pub google_api_key: Secret,
    pub google_api_servers: Vec<String>,
    pub stats_email_recipients: Recipients,
    pub stats_warning_threshold_per_minute: f64,
    pub response_email_address: String,
    pub default_sponsor_name: String,
    pub default_propagation_channel_name: String,
    pub s3_object_max_size: u64,
    pub num_processes: usize,

    // Mail transport settings
    #[serde(default)]
    pub pop_server: Option<String>,
    #[serde(default = "default_pop_port")]
    pub pop_port: u16,
    #[serde(default)]
    pub email_username: String,
    #[serde(default)]
    pub email_password: Secret,
    #[serde(default)]
    pub smtp_server: Option<String>,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,

    #[serde(default = "default_datastore_path")]
    pub datastore_path: String,
    #[serde(default = "default_correlation_ttl_minutes")]
    pub correlation_ttl_minutes: i64,
    #[serde(default)]
    pub reply_retry_count: u32,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
}

fn default_pop_port() -> u16 {
    995
}

fn default_smtp_port() -> u16 {
    465
}

fn default_datastore_path() -> String {
    "/var/lib/feedback-decryptor/feedback.db".to_string()
}

fn default_correlation_ttl_minutes() -> i64 {
    360
}

fn default_http_timeout_secs() -> u64 {
    10
}

/// Smallest object the bucket ingestor will consider.
pub const BUCKET_OBJECT_MIN_SIZE: u64 = 100;

impl Config {
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.private_key_pem_file.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "privateKeyPemFile",
                reason: "must not be empty".to_string(),
            });
        }
        if self.num_processes == 0 {
            return Err(ConfigError::Invalid {
                key: "numProcesses",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.s3_object_max_size < BUCKET_OBJECT_MIN_SIZE {
            return Err(ConfigError::Invalid {
                key: "s3ObjectMaxSize",
                reason: format!("must be at least {BUCKET_OBJECT_MIN_SIZE}"),
            });
        }
        if !self.stats_warning_threshold_per_minute.is_finite()
            || self.stats_warning_threshold_per_minute < 0.0
        {
            return Err(ConfigError::Invalid {
                key: "statsWarningThresholdPerMinute",
                reason: "must be a non-negative number".to_string(),
            });
        }
        if self.correlation_ttl_minutes <= 0 {
            return Err(ConfigError::Invalid {
                key: "correlationTtlMinutes",
                reason: "must be positive".to_string(),
            });
        }
        if self.response_email_address.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "responseEmailAddress",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }

    /// Resolves the psinet export, relative paths being taken from `psiOpsPath`.
    pub fn psinet_path(&self) -> PathBuf {
        let path = Path::new(&self.psinet_file_path);
        if path.is_absolute() || self.psi_ops_path.is_empty() {
            path.to_path_buf()
        } else {
            Path::new(&self.psi_ops_path).join(path)
        }
    }

    pub fn http_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.http_timeout_secs)
    }

    pub fn correlation_ttl(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.correlation_ttl_minutes)
    }

    /// A config with every required key filled in, handy for tests and
    /// for `--generate-config`.
    pub fn example() -> Self {
        Config {
            private_key_pem_file: "/etc/feedback-decryptor/private.pem".to_string(),
            private_key_password: Secret::default(),
            decrypted_email_recipient: Recipients(vec!["feedback@example.com".to_string()]),
            aws_region: "us-east-1".to_string(),
            s3_bucket_name: "feedback-uploads".to_string(),
            psi_ops_path: "/opt/psiphon/Automation".to_string(),
            psinet_file_path: "psi_ops.json".to_string(),
            google_api_key: Secret::default(),
            google_api_servers: Vec::new(),
            stats_email_recipients: Recipients(vec!["stats@example.com".to_string()]),
            stats_warning_threshold_per_minute: 10.0,
            response_email_address: "noreply@example.com".to_string(),
            default_sponsor_name: "[UNKNOWN_SPONSOR]".to_string(),
            default_propagation_channel_name: "[UNKNOWN_CHANNEL]".to_string(),
            s3_object_max_size: 1_048_576,
            num_processes: 2,
            pop_server: None,
            pop_port: default_pop_port(),
            email_username: String::new(),
            email_password: Secret::default(),
            smtp_server: None,
            smtp_port: default_smtp_port(),
            datastore_path: default_datastore_path(),
            correlation_ttl_minutes: default_correlation_ttl_minutes(),
            reply_retry_count: 0,
            http_timeout_secs: default_http_timeout_secs(),
        }
    }

    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
