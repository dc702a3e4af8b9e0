use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default="default_base_folder")]
    pub base_folder: PathBuf,

    #[serde(default="default_max_concurrent_downloads")]
    pub max_concurrent_downloads: usize,
    #[serde(default="default_max_concurrent_uploads")]
    pub max_concurrent_uploads: usize,
    #[serde(default="default_max_download_attempts")]
    pub max_download_attempts: usize,
    /// Seconds to wait before the second download attempt, multiplied by the attempt number after that.
    #[serde(default="default_download_retry_delay")]
    pub download_retry_delay: f64,

    #[serde(default="default_log_level")]
    pub log_level: String
}

fn default_base_folder() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".strata")
}

fn default_max_concurrent_downloads() -> usize {
    3
}

fn default_max_concurrent_uploads() -> usize {
    5
}

fn default_max_download_attempts() -> usize {
    5
}

fn default_download_retry_delay() -> f64 {
    5.0
}

fn default_log_level() -> String {
    "info".to_owned()
}

impl StoreConfig {
    pub fn new() -> StoreConfig {
        StoreConfig::with_base_folder(default_base_folder())
    }

    pub fn with_base_folder(base_folder: PathBuf) -> StoreConfig {
        StoreConfig {
            base_folder,
            max_concurrent_downloads: default_max_concurrent_downloads(),
            max_concurrent_uploads: default_max_concurrent_uploads(),
            max_download_attempts: default_max_download_attempts(),
            download_retry_delay: default_download_retry_delay(),
            log_level: default_log_level()
        }
    }

    pub fn load_from_file(path: &Path) -> Result<StoreConfig, String> {
        let content = std::fs::read_to_string(path).map_err(|err| format!("{}", err))?;
        let config: StoreConfig = toml::from_str(&content).map_err(|err| format!("{}", err))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), String> {
        if !self.download_retry_delay.is_finite() || self.download_retry_delay < 0.0 {
            return Err(format!("Invalid download_retry_delay {}: expected a non-negative number of seconds", self.download_retry_delay));
        }

        Ok(())
    }

    pub fn save_to_file(&self, path: &Path) -> Result<(), String> {
        let content = toml::to_string(self).map_err(|err| format!("{}", err))?;
        std::fs::write(path, content).map_err(|err| format!("{}", err))?;
        Ok(())
    }

    pub fn base_folder(&self) -> PathBuf {
        self.base_folder.clone()
    }

    pub fn state_folder(&self) -> PathBuf {
        self.base_folder.join("state")
    }

    pub fn layers_folder(&self) -> PathBuf {
        self.base_folder.join("layers")
    }

    pub fn mounts_folder(&self) -> PathBuf {
        self.base_folder.join("mounts")
    }

    pub fn download_retry_delay(&self) -> Duration {
        Duration::try_from_secs_f64(self.download_retry_delay).unwrap_or(Duration::ZERO)
    }

    pub fn log_level(&self) -> log::LevelFilter {
        self.log_level.parse().unwrap_or(log::LevelFilter::Info)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::new()
    }
}

#[test]
fn test_load_partial_config() {
    let config: StoreConfig = toml::from_str(
        r#"
        base_folder = "/tmp/strata"
        max_concurrent_downloads = 8
        "#
    ).unwrap();

    assert_eq!(PathBuf::from("/tmp/strata"), config.base_folder);
    assert_eq!(8, config.max_concurrent_downloads);
    assert_eq!(5, config.max_concurrent_uploads);
    assert_eq!(5, config.max_download_attempts);
    assert_eq!(Duration::from_secs(5), config.download_retry_delay());
    assert_eq!(log::LevelFilter::Info, config.log_level());
    assert_eq!(PathBuf::from("/tmp/strata/layers"), config.layers_folder());
}

#[test]
fn test_save_and_load() {
    let folder = crate::test_helpers::TempFolder::new();
    folder.create().unwrap();

    let mut config = StoreConfig::with_base_folder(folder.owned());
    config.log_level = "debug".to_owned();
    config.save_to_file(&folder.join("config.toml")).unwrap();

    let loaded = StoreConfig::load_from_file(&folder.join("config.toml")).unwrap();
    assert_eq!(folder.owned(), loaded.base_folder);
    assert_eq!(log::LevelFilter::Debug, loaded.log_level());
}

#[test]
fn test_reject_invalid_retry_delay() {
    let folder = crate::test_helpers::TempFolder::new();
    folder.create().unwrap();

    let path = folder.join("config.toml");
    std::fs::write(&path, "download_retry_delay = inf\n").unwrap();
    assert!(StoreConfig::load_from_file(&path).is_err());

    std::fs::write(&path, "download_retry_delay = -1.0\n").unwrap();
    assert!(StoreConfig::load_from_file(&path).is_err());

    std::fs::write(&path, "download_retry_delay = 0.5\n").unwrap();
    assert_eq!(Duration::from_millis(500), StoreConfig::load_from_file(&path).unwrap().download_retry_delay());

    let mut config = StoreConfig::default();
    config.download_retry_delay = f64::INFINITY;
    assert_eq!(Duration::ZERO, config.download_retry_delay());
    config.download_retry_delay = f64::NAN;
    assert_eq!(Duration::ZERO, config.download_retry_delay());
}
