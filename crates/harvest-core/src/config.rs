use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{HarvestError, Result};

/// Top-level configuration, loaded from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HarvestConfig {
    /// Root directory of the store. All engine paths derive from it.
    pub root: String,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub gc: GcConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScanConfig {
    /// Remote account used for ssh/scp/rsync.
    #[serde(default = "default_remote_user")]
    pub remote_user: String,
    /// Remote directory tree the scanner inventories.
    #[serde(default = "default_remote_root")]
    pub remote_root: String,
    /// Local path of the scanner binary copied to each host.
    #[serde(default = "default_scanner_bin")]
    pub scanner_bin: String,
    /// Timeout for each individual ssh/scp invocation.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_seconds: u64,
    /// Deadline for the fleet-wide scan-completion poll loop.
    #[serde(default = "default_wait_timeout")]
    pub wait_timeout_seconds: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            remote_user: default_remote_user(),
            remote_root: default_remote_root(),
            scanner_bin: default_scanner_bin(),
            command_timeout_seconds: default_command_timeout(),
            wait_timeout_seconds: default_wait_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransferConfig {
    /// Timeout for one host's whole bulk transfer.
    #[serde(default = "default_transfer_timeout")]
    pub timeout_seconds: u64,
    /// Interval between disk-usage samples while a transfer is in flight.
    #[serde(default = "default_sample_interval")]
    pub sample_interval_seconds: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_transfer_timeout(),
            sample_interval_seconds: default_sample_interval(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GcConfig {
    /// Exclude manifests older than this from the liveness mark phase
    /// (e.g. "30d", "12h"). Unset: a stale manifest keeps its content
    /// live indefinitely.
    #[serde(default)]
    pub expire_manifests_after: Option<String>,
}

impl GcConfig {
    pub fn expiry(&self) -> Result<Option<Duration>> {
        self.expire_manifests_after
            .as_deref()
            .map(parse_human_duration)
            .transpose()
    }
}

fn default_remote_user() -> String {
    "root".to_string()
}

fn default_remote_root() -> String {
    "/opt".to_string()
}

fn default_scanner_bin() -> String {
    "quick".to_string()
}

fn default_command_timeout() -> u64 {
    30
}

fn default_wait_timeout() -> u64 {
    3600
}

fn default_transfer_timeout() -> u64 {
    6 * 3600
}

fn default_sample_interval() -> u64 {
    5
}

impl HarvestConfig {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            HarvestError::Config(format!("cannot read '{}': {e}", path.display()))
        })?;
        let mut config: HarvestConfig = serde_yaml::from_str(&raw)
            .map_err(|e| HarvestError::Config(format!("'{}': {e}", path.display())))?;
        config.root = expand_tilde(&config.root);
        if config.root.is_empty() {
            return Err(HarvestError::Config("root must not be empty".into()));
        }
        Ok(config)
    }

    pub fn paths(&self) -> StorePaths {
        StorePaths::derive(Path::new(&self.root))
    }
}

/// All on-disk locations, derived once from the configured root.
/// Components receive this value; none computes its own root.
#[derive(Debug, Clone)]
pub struct StorePaths {
    pub root: PathBuf,
    pub hash_dir: PathBuf,
    pub meta_dir: PathBuf,
    pub temp_dir: PathBuf,
}

impl StorePaths {
    pub fn derive(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            hash_dir: root.join("hash"),
            meta_dir: root.join("meta"),
            temp_dir: root.join("temp"),
        }
    }

    /// A host's disposable staging workspace under `temp/`.
    pub fn host_temp_dir(&self, hostname: &str) -> PathBuf {
        self.temp_dir.join(hostname)
    }

    /// A host's durable manifest directory under `meta/`.
    pub fn host_meta_dir(&self, hostname: &str) -> PathBuf {
        self.meta_dir.join(hostname)
    }
}

/// Configuration file lookup: explicit flag, then `HARVEST_CONFIG`,
/// then `./harvest.yaml`, then the platform user config dir.
pub fn resolve_config_path(flag: Option<&str>) -> Option<PathBuf> {
    if let Some(path) = flag {
        return Some(PathBuf::from(expand_tilde(path)));
    }
    if let Ok(env_path) = std::env::var("HARVEST_CONFIG") {
        if !env_path.is_empty() {
            return Some(PathBuf::from(expand_tilde(&env_path)));
        }
    }
    let project = PathBuf::from("harvest.yaml");
    if project.is_file() {
        return Some(project);
    }
    let user = dirs::config_dir().map(|base| base.join("harvest").join("config.yaml"));
    match user {
        Some(path) if path.is_file() => Some(path),
        _ => None,
    }
}

pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest).to_string_lossy().into_owned();
        }
    }
    path.to_string()
}

/// Parse a duration like "90s", "15m", "12h", "30d", "2w".
pub fn parse_human_duration(input: &str) -> Result<Duration> {
    let s = input.trim();
    if s.is_empty() {
        return Err(HarvestError::Config("empty duration string".into()));
    }
    let (num_str, unit_secs) = match s.as_bytes().last() {
        Some(b's' | b'S') => (&s[..s.len() - 1], 1u64),
        Some(b'm' | b'M') => (&s[..s.len() - 1], 60),
        Some(b'h' | b'H') => (&s[..s.len() - 1], 3600),
        Some(b'd' | b'D') => (&s[..s.len() - 1], 86400),
        Some(b'w' | b'W') => (&s[..s.len() - 1], 604800),
        _ => {
            return Err(HarvestError::Config(format!(
                "invalid duration '{s}': use a suffix of s, m, h, d or w (e.g. 12h, 30d)"
            )))
        }
    };
    let n: u64 = num_str
        .parse()
        .map_err(|_| HarvestError::Config(format!("invalid duration number: '{num_str}'")))?;
    if n == 0 {
        return Err(HarvestError::Config(format!(
            "duration must be positive (got '{s}')"
        )));
    }
    Ok(Duration::from_secs(n * unit_secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_minimal_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harvest.yaml");
        std::fs::write(&path, "root: /srv/backups\n").unwrap();
        let config = HarvestConfig::load(&path).unwrap();
        assert_eq!(config.root, "/srv/backups");
        assert_eq!(config.scan.remote_user, "root");
        assert_eq!(config.scan.remote_root, "/opt");
        assert_eq!(config.transfer.sample_interval_seconds, 5);
        assert!(config.gc.expire_manifests_after.is_none());
    }

    #[test]
    fn load_rejects_unknown_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harvest.yaml");
        std::fs::write(&path, "root: /srv/backups\nshenanigans: true\n").unwrap();
        assert!(HarvestConfig::load(&path).is_err());
    }

    #[test]
    fn load_rejects_empty_root() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harvest.yaml");
        std::fs::write(&path, "root: \"\"\n").unwrap();
        assert!(HarvestConfig::load(&path).is_err());
    }

    #[test]
    fn paths_derive_from_single_root() {
        let paths = StorePaths::derive(Path::new("/srv/backups"));
        assert_eq!(paths.hash_dir, Path::new("/srv/backups/hash"));
        assert_eq!(paths.meta_dir, Path::new("/srv/backups/meta"));
        assert_eq!(paths.temp_dir, Path::new("/srv/backups/temp"));
        assert_eq!(
            paths.host_temp_dir("web01"),
            Path::new("/srv/backups/temp/web01")
        );
        assert_eq!(
            paths.host_meta_dir("web01"),
            Path::new("/srv/backups/meta/web01")
        );
    }

    #[test]
    fn parse_human_duration_suffixes() {
        assert_eq!(parse_human_duration("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_human_duration("15m").unwrap(), Duration::from_secs(900));
        assert_eq!(parse_human_duration("12h").unwrap(), Duration::from_secs(43200));
        assert_eq!(
            parse_human_duration("30d").unwrap(),
            Duration::from_secs(30 * 86400)
        );
        assert_eq!(
            parse_human_duration("2w").unwrap(),
            Duration::from_secs(2 * 604800)
        );
    }

    #[test]
    fn parse_human_duration_rejects_garbage() {
        assert!(parse_human_duration("").is_err());
        assert!(parse_human_duration("12").is_err());
        assert!(parse_human_duration("0d").is_err());
        assert!(parse_human_duration("xd").is_err());
    }

    #[test]
    fn gc_expiry_parses_optional_threshold() {
        let gc = GcConfig {
            expire_manifests_after: Some("30d".into()),
        };
        assert_eq!(gc.expiry().unwrap(), Some(Duration::from_secs(30 * 86400)));
        assert_eq!(GcConfig::default().expiry().unwrap(), None);
    }
}
