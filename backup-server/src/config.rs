use backup_core::scheduler::cadence::parse_time;
use backup_core::utils::format::parse_duration;
use chrono::NaiveTime;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    /// Seed the default daily/weekly/monthly schedules when none are stored
    pub auto_backup_enabled: bool,
    pub auto_backup_time: NaiveTime,
    pub cleanup_interval: Duration,
    pub health_interval: Duration,
    /// Time scheduled backups get to finish on shutdown
    pub shutdown_grace: Duration,
    /// Artifacts without descriptors younger than this are left alone
    pub orphan_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let data_dir = PathBuf::from("./data");
        Self {
            port: 3000,
            db_path: data_dir.join("backup-server.db"),
            data_dir,
            auto_backup_enabled: true,
            auto_backup_time: NaiveTime::from_hms_opt(3, 0, 0).unwrap_or_default(),
            cleanup_interval: Duration::from_secs(6 * 3600),
            health_interval: Duration::from_secs(5 * 60),
            shutdown_grace: Duration::from_secs(60),
            orphan_grace: Duration::from_secs(3600),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(v) = get("PORT") {
            config.port = v.trim().parse().map_err(|e| anyhow::anyhow!("PORT: {}", e))?;
        }
        if let Some(v) = get("DATA_DIR") {
            config.data_dir = PathBuf::from(v);
            config.db_path = config.data_dir.join("backup-server.db");
        }
        if let Some(v) = get("AUTO_BACKUP_ENABLED") {
            config.auto_backup_enabled = matches!(
                v.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }
        if let Some(v) = get("AUTO_BACKUP_TIME") {
            config.auto_backup_time =
                parse_time(&v).map_err(|e| anyhow::anyhow!("AUTO_BACKUP_TIME: {}", e))?;
        }
        if let Some(v) = get("CLEANUP_INTERVAL") {
            config.cleanup_interval = interval("CLEANUP_INTERVAL", &v)?;
        }
        if let Some(v) = get("HEALTH_INTERVAL") {
            config.health_interval = interval("HEALTH_INTERVAL", &v)?;
        }
        if let Some(v) = get("SHUTDOWN_GRACE") {
            config.shutdown_grace =
                parse_duration(&v).map_err(|e| anyhow::anyhow!("SHUTDOWN_GRACE: {}", e))?;
        }

        Ok(config)
    }
}

fn interval(key: &str, value: &str) -> anyhow::Result<Duration> {
    let d = parse_duration(value).map_err(|e| anyhow::anyhow!("{}: {}", key, e))?;
    if d.is_zero() {
        anyhow::bail!("{}: interval must be positive", key);
    }
    Ok(d)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.port, 3000);
        assert!(config.auto_backup_enabled);
        assert_eq!(config.auto_backup_time, NaiveTime::from_hms_opt(3, 0, 0).unwrap());
        assert_eq!(config.cleanup_interval, Duration::from_secs(6 * 3600));
    }

    #[test]
    fn test_overrides() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("PORT", "8080"),
            ("DATA_DIR", "/var/lib/backup"),
            ("AUTO_BACKUP_ENABLED", "false"),
            ("AUTO_BACKUP_TIME", "04:30"),
            ("CLEANUP_INTERVAL", "1h"),
        ]))
        .unwrap();

        assert_eq!(config.port, 8080);
        assert_eq!(config.db_path, PathBuf::from("/var/lib/backup/backup-server.db"));
        assert!(!config.auto_backup_enabled);
        assert_eq!(config.auto_backup_time, NaiveTime::from_hms_opt(4, 30, 0).unwrap());
        assert_eq!(config.cleanup_interval, Duration::from_secs(3600));
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(ServerConfig::from_lookup(lookup(&[("PORT", "abc")])).is_err());
        assert!(ServerConfig::from_lookup(lookup(&[("AUTO_BACKUP_TIME", "25:00")])).is_err());
        assert!(ServerConfig::from_lookup(lookup(&[("HEALTH_INTERVAL", "0s")])).is_err());
    }
}
