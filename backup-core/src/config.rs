//! Configuration management for the backup manager.
//!
//! Defaults, then an optional TOML file, then environment variables
//! (a `.env` file is honoured).

use crate::retention::RetentionPolicy;
use crate::utils::errors::{BackupError, Result};
use crate::utils::format::parse_duration;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub backup: BackupSettings,
    pub retention: RetentionConfig,
    pub health: HealthConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub name: String,

    /// Explicit pg_dump binary; looked up on PATH when unset
    pub pg_dump_path: Option<PathBuf>,

    /// Explicit psql binary; looked up on PATH when unset
    pub psql_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupSettings {
    /// Directory holding artifacts and their descriptors
    pub dir: PathBuf,

    pub compress: bool,

    /// Compression codec (gzip, zstd)
    pub compression: CompressionCodec,

    /// 1-9 for gzip, 1-22 for zstd
    pub compression_level: i32,

    pub validate_after_backup: bool,
    pub validate_before_restore: bool,

    /// Take a dump of the current database before every restore
    pub safety_backup_before_restore: bool,

    /// Total attempts per dump/restore, including the first
    pub max_retries: u32,

    #[serde(with = "humantime_serde")]
    pub retry_wait: Duration,

    /// Deadline for a single dump or restore invocation
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Time a tool gets to exit after SIGTERM before it is killed
    #[serde(with = "humantime_serde")]
    pub stop_grace: Duration,

    /// Refuse to start a dump when less than this is free (0 disables the check)
    pub min_free_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    #[serde(with = "humantime_serde")]
    pub max_age: Option<Duration>,
    pub max_count: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Newest backup older than this degrades health to WARNING
    #[serde(with = "humantime_serde")]
    pub max_backup_age: Duration,

    /// Disk usage percentage above which health degrades to WARNING
    pub disk_warn_percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log output format (text, json)
    pub format: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionCodec {
    Gzip,
    Zstd,
}

impl CompressionCodec {
    /// Suffix appended after `.sql`
    pub fn extension(&self) -> &'static str {
        match self {
            CompressionCodec::Gzip => "gz",
            CompressionCodec::Zstd => "zst",
        }
    }

    pub fn level_range(&self) -> std::ops::RangeInclusive<i32> {
        match self {
            CompressionCodec::Gzip => 1..=9,
            CompressionCodec::Zstd => 1..=22,
        }
    }
}

impl FromStr for CompressionCodec {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gzip" | "gz" => Ok(CompressionCodec::Gzip),
            "zstd" | "zst" => Ok(CompressionCodec::Zstd),
            other => Err(format!("unknown compression codec '{}'", other)),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: String::new(),
            name: "postgres".to_string(),
            pg_dump_path: None,
            psql_path: None,
        }
    }
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./backups"),
            compress: true,
            compression: CompressionCodec::Gzip,
            compression_level: 6,
            validate_after_backup: true,
            validate_before_restore: true,
            safety_backup_before_restore: true,
            max_retries: 3,
            retry_wait: Duration::from_secs(1),
            timeout: Duration::from_secs(30 * 60),
            stop_grace: Duration::from_secs(10),
            min_free_bytes: 0,
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_age: Some(Duration::from_secs(30 * 86_400)),
            max_count: Some(100),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            max_backup_age: Duration::from_secs(25 * 3600),
            disk_warn_percent: 85.0,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| BackupError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        toml::from_str(&content)
            .map_err(|e| BackupError::Config(format!("invalid {}: {}", path.display(), e)))
    }

    /// Defaults or `file`, overlaid with the environment, then validated.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let _ = dotenvy::dotenv();

        let mut config = match file {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay values from `lookup` (normally the process environment).
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("DB_HOST") {
            self.database.host = v;
        }
        if let Some(v) = get("DB_PORT") {
            self.database.port = parse_value("DB_PORT", &v)?;
        }
        if let Some(v) = get("DB_USER") {
            self.database.user = v;
        }
        if let Some(v) = get("DB_PASSWORD") {
            self.database.password = v;
        }
        if let Some(v) = get("DB_NAME") {
            self.database.name = v;
        }
        if let Some(v) = get("PG_DUMP_PATH") {
            self.database.pg_dump_path = Some(PathBuf::from(v));
        }
        if let Some(v) = get("PSQL_PATH") {
            self.database.psql_path = Some(PathBuf::from(v));
        }

        if let Some(v) = get("BACKUP_DIR") {
            self.backup.dir = PathBuf::from(v);
        }
        if let Some(v) = get("BACKUP_COMPRESS") {
            self.backup.compress = parse_bool("BACKUP_COMPRESS", &v)?;
        }
        if let Some(v) = get("BACKUP_COMPRESSION") {
            self.backup.compression = parse_value("BACKUP_COMPRESSION", &v)?;
        }
        if let Some(v) = get("BACKUP_COMPRESSION_LEVEL") {
            self.backup.compression_level = parse_value("BACKUP_COMPRESSION_LEVEL", &v)?;
        }
        if let Some(v) = get("BACKUP_VALIDATE_AFTER") {
            self.backup.validate_after_backup = parse_bool("BACKUP_VALIDATE_AFTER", &v)?;
        }
        if let Some(v) = get("BACKUP_VALIDATE_BEFORE_RESTORE") {
            self.backup.validate_before_restore = parse_bool("BACKUP_VALIDATE_BEFORE_RESTORE", &v)?;
        }
        if let Some(v) = get("BACKUP_SAFETY_BEFORE_RESTORE") {
            self.backup.safety_backup_before_restore =
                parse_bool("BACKUP_SAFETY_BEFORE_RESTORE", &v)?;
        }
        if let Some(v) = get("BACKUP_MAX_RETRIES") {
            self.backup.max_retries = parse_value("BACKUP_MAX_RETRIES", &v)?;
        }
        if let Some(v) = get("BACKUP_RETRY_WAIT") {
            self.backup.retry_wait = parse_env_duration("BACKUP_RETRY_WAIT", &v)?;
        }
        if let Some(v) = get("BACKUP_TIMEOUT") {
            self.backup.timeout = parse_env_duration("BACKUP_TIMEOUT", &v)?;
        }
        if let Some(v) = get("BACKUP_MIN_FREE_BYTES") {
            self.backup.min_free_bytes = parse_value("BACKUP_MIN_FREE_BYTES", &v)?;
        }

        if let Some(v) = get("BACKUP_RETENTION_DAYS") {
            let days: u64 = parse_value("BACKUP_RETENTION_DAYS", &v)?;
            self.retention.max_age = Some(Duration::from_secs(days * 86_400));
        }
        if let Some(v) = get("BACKUP_MAX_COUNT") {
            self.retention.max_count = Some(parse_value("BACKUP_MAX_COUNT", &v)?);
        }

        if let Some(v) = get("BACKUP_HEALTH_MAX_AGE") {
            self.health.max_backup_age = parse_env_duration("BACKUP_HEALTH_MAX_AGE", &v)?;
        }
        if let Some(v) = get("BACKUP_DISK_WARN_PERCENT") {
            self.health.disk_warn_percent = parse_value("BACKUP_DISK_WARN_PERCENT", &v)?;
        }

        if let Some(v) = get("LOG_LEVEL") {
            self.log.level = v;
        }
        if let Some(v) = get("LOG_FORMAT") {
            self.log.format = v;
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.backup.dir.as_os_str().is_empty() {
            return Err(BackupError::Config("backup directory cannot be empty".into()));
        }
        if self.backup.max_retries < 1 {
            return Err(BackupError::Config("max retries must be at least 1".into()));
        }
        let range = self.backup.compression.level_range();
        if self.backup.compress && !range.contains(&self.backup.compression_level) {
            return Err(BackupError::Config(format!(
                "compression level must be between {} and {} for {:?}",
                range.start(),
                range.end(),
                self.backup.compression
            )));
        }
        if self.retention.max_age == Some(Duration::ZERO) {
            return Err(BackupError::Config("retention max age must be positive".into()));
        }
        if self.retention.max_count == Some(0) {
            return Err(BackupError::Config("retention max count must be at least 1".into()));
        }
        let pct = self.health.disk_warn_percent;
        if !(pct > 0.0 && pct <= 100.0) {
            return Err(BackupError::Config(
                "disk warning threshold must be within (0, 100]".into(),
            ));
        }
        Ok(())
    }

    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            max_age: self.retention.max_age,
            max_count: self.retention.max_count,
        }
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| BackupError::Config(format!("{}: invalid value '{}': {}", key, value, e)))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(BackupError::Config(format!("{}: invalid boolean '{}'", key, value))),
    }
}

fn parse_env_duration(key: &str, value: &str) -> Result<Duration> {
    parse_duration(value).map_err(|e| BackupError::Config(format!("{}: {}", key, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.backup.max_retries, 3);
        assert_eq!(config.retention.max_age, Some(Duration::from_secs(30 * 86_400)));
        assert!(config.backup.compress);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_env(env(&[
                ("BACKUP_DIR", "/var/backups/db"),
                ("BACKUP_COMPRESS", "false"),
                ("BACKUP_COMPRESSION", "zstd"),
                ("BACKUP_MAX_RETRIES", "5"),
                ("BACKUP_RETRY_WAIT", "2s"),
                ("BACKUP_RETENTION_DAYS", "7"),
                ("BACKUP_MAX_COUNT", "10"),
                ("DB_PORT", "6543"),
            ]))
            .unwrap();

        assert_eq!(config.backup.dir, PathBuf::from("/var/backups/db"));
        assert!(!config.backup.compress);
        assert_eq!(config.backup.compression, CompressionCodec::Zstd);
        assert_eq!(config.backup.max_retries, 5);
        assert_eq!(config.backup.retry_wait, Duration::from_secs(2));
        assert_eq!(config.retention.max_age, Some(Duration::from_secs(7 * 86_400)));
        assert_eq!(config.retention.max_count, Some(10));
        assert_eq!(config.database.port, 6543);
    }

    #[test]
    fn test_invalid_env_value_is_rejected() {
        let mut config = Config::default();
        let err = config.apply_env(env(&[("BACKUP_MAX_RETRIES", "many")])).unwrap_err();
        assert!(err.to_string().contains("BACKUP_MAX_RETRIES"));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.backup.max_retries = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.backup.compression_level = 12;
        assert!(config.validate().is_err());

        config.backup.compression = CompressionCodec::Zstd;
        assert!(config.validate().is_ok());

        let mut config = Config::default();
        config.retention.max_count = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_toml() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("backup.toml");
        std::fs::write(
            &path,
            r#"
[database]
name = "toeic"

[backup]
dir = "/srv/backups"
retry_wait = "5s"
compression = "zstd"
compression_level = 3

[retention]
max_age = "14days"
"#,
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.database.name, "toeic");
        assert_eq!(config.database.port, 5432);
        assert_eq!(config.backup.retry_wait, Duration::from_secs(5));
        assert_eq!(config.backup.compression, CompressionCodec::Zstd);
        assert_eq!(config.retention.max_age, Some(Duration::from_secs(14 * 86_400)));
        assert_eq!(config.retention.max_count, Some(100));
    }
}
