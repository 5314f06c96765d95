use std::path::PathBuf;

use directories::ProjectDirs;
use serde::Deserialize;

use crate::planner::PlanMode;
use crate::similarity::SimilarityWeights;

/// Application configuration loaded from TOML config file.
/// Every field has a default, so the file is optional.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Library roots, registered as music locations on start-up.
    pub music_dirs: Vec<PathBuf>,
    /// Custom database path (overrides XDG default).
    pub db_path: Option<PathBuf>,
    /// Number of parallel workers. 0 = auto-detect (cores / 2, min 1).
    pub workers: usize,
    /// Component weights for the combined similarity score.
    pub similarity: SimilarityWeights,
    pub planner: PlannerConfig,
    pub similar: SimilarConfig,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct PlannerConfig {
    /// Ordering mode used when `plan` gets no `--mode`.
    pub mode: PlanMode,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SimilarConfig {
    /// Result count for `similar` when `--limit` is not given.
    pub limit: usize,
}

impl Default for SimilarConfig {
    fn default() -> Self {
        Self { limit: 10 }
    }
}

impl AppConfig {
    /// Load config from `~/.config/mixplan/config.toml`.
    /// Returns default config if the file doesn't exist, and logs a warning
    /// if it exists but can't be read or parsed.
    pub fn load() -> Self {
        match Self::config_path() {
            Some(path) if path.exists() => match std::fs::read_to_string(&path) {
                Ok(contents) => Self::from_toml(&contents).unwrap_or_else(|e| {
                    log::warn!("Failed to parse {}: {}. Using defaults.", path.display(), e);
                    Self::default()
                }),
                Err(e) => {
                    log::warn!("Failed to read {}: {}. Using defaults.", path.display(), e);
                    Self::default()
                }
            },
            _ => {
                log::debug!("No config file found, using defaults");
                Self::default()
            }
        }
    }

    fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        let config = toml::from_str::<AppConfig>(contents)?;
        log::info!("Loaded config ({} music dirs)", config.music_dirs.len());
        Ok(config)
    }

    /// Resolve worker count: 0 → auto-detect (cores / 2, min 1).
    pub fn resolve_workers(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            let cores = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2);
            (cores / 2).max(1)
        }
    }

    fn config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", crate::APP_NAME)
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}

/// Resolve the default database path using XDG data directory.
pub fn default_db_path() -> PathBuf {
    if let Some(dirs) = ProjectDirs::from("", "", crate::APP_NAME) {
        let data_dir = dirs.data_dir();
        std::fs::create_dir_all(data_dir).ok();
        data_dir.join("mixplan.db")
    } else {
        // Fallback: current directory
        PathBuf::from("mixplan.db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = AppConfig::from_toml("").unwrap();
        assert!(config.music_dirs.is_empty());
        assert_eq!(config.workers, 0);
        assert_eq!(config.similar.limit, 10);
        assert_eq!(config.planner.mode, PlanMode::PeakTime);
        assert_eq!(config.similarity.embedding, 0.5);
    }

    #[test]
    fn test_partial_config() {
        let config = AppConfig::from_toml(
            r#"
            music_dirs = ["/music/house"]
            workers = 3

            [similarity]
            embedding = 0.4
            tempo = 0.3

            [planner]
            mode = "warmUp"
            "#,
        )
        .unwrap();
        assert_eq!(config.music_dirs, vec![PathBuf::from("/music/house")]);
        assert_eq!(config.resolve_workers(), 3);
        assert_eq!(config.similarity.embedding, 0.4);
        assert_eq!(config.similarity.tempo, 0.3);
        // Unset weights keep their defaults
        assert_eq!(config.similarity.key, 0.2);
        assert_eq!(config.planner.mode, PlanMode::WarmUp);
    }

    #[test]
    fn test_bad_config_is_an_error() {
        assert!(AppConfig::from_toml("workers = \"many\"").is_err());
    }

    #[test]
    fn test_auto_workers_at_least_one() {
        assert!(AppConfig::default().resolve_workers() >= 1);
    }
}
