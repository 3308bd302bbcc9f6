use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::ordering::ChapterSort;

/// User-facing reader settings. Loaded from TOML by the CLI; embedders may
/// construct it directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    pub sort: ChapterSort,
    pub descending: bool,
    /// Skip already-read chapters when building the session list.
    pub skip_read: bool,
    /// Honor the manga's display filters when building the session list.
    pub skip_filtered: bool,
    /// Suppress local progress/history writes (see tracker override below).
    pub incognito: bool,
    /// Write progress locally even in incognito mode so remote sync has
    /// something to read.
    pub always_sync_progress: bool,
    /// Delete the chapter N slots behind the one just finished; negative
    /// disables the policy.
    pub remove_after_read_slots: i64,
    /// How many upcoming chapters to auto-download; 0 disables.
    pub auto_download_ahead: usize,
    /// Fraction of the current chapter that must be read before
    /// auto-download kicks in.
    pub auto_download_threshold: f32,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            sort: ChapterSort::BySource,
            descending: false,
            skip_read: false,
            skip_filtered: false,
            incognito: false,
            always_sync_progress: false,
            remove_after_read_slots: -1,
            auto_download_ahead: 0,
            auto_download_threshold: 0.2,
        }
    }
}

impl ReaderConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {:?}", path))?;
        let config = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {:?}", path))?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create config directory {:?}", parent))?;
        }
        let payload = toml::to_string_pretty(self)?;
        fs::write(path, payload)
            .with_context(|| format!("failed to write config file {:?}", path))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_disable_destructive_policies() {
        let config = ReaderConfig::default();
        assert_eq!(config.remove_after_read_slots, -1);
        assert_eq!(config.auto_download_ahead, 0);
        assert!(!config.incognito);
    }

    #[test]
    fn round_trips_through_toml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("reader.toml");

        let mut config = ReaderConfig::default();
        config.descending = true;
        config.skip_read = true;
        config.remove_after_read_slots = 2;
        config.save(&path).unwrap();

        let restored = ReaderConfig::load(&path).unwrap();
        assert!(restored.descending);
        assert!(restored.skip_read);
        assert_eq!(restored.remove_after_read_slots, 2);
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let config: ReaderConfig = toml::from_str("incognito = true").unwrap();
        assert!(config.incognito);
        assert_eq!(config.auto_download_threshold, 0.2);
    }
}
