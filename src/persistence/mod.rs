use crate::engine::stats::GlobalStats;
use anyhow::Context;
use std::path::{Path, PathBuf};

/// JSON-file store for [`GlobalStats`].
///
/// Read once at startup, written after every stats mutation. A missing or
/// unreadable file yields defaults so a fresh deployment starts clean.
pub struct StatsRepository {
    path: PathBuf,
}

impl StatsRepository {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn load(&self) -> GlobalStats {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(stats) => {
                    tracing::info!("Loaded trade stats from {:?}", self.path);
                    stats
                }
                Err(e) => {
                    tracing::warn!("Stats file {:?} unparsable ({}), starting fresh", self.path, e);
                    GlobalStats::default()
                }
            },
            Err(_) => {
                tracing::info!("No stats file at {:?}, starting fresh", self.path);
                GlobalStats::default()
            }
        }
    }

    pub fn save(&self, stats: &GlobalStats) -> anyhow::Result<()> {
        let raw = serde_json::to_string_pretty(stats)?;
        std::fs::write(&self.path, raw)
            .with_context(|| format!("writing stats to {:?}", self.path))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("liqbot-stats-test");
        std::fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    #[test]
    fn test_load_missing_file_defaults() {
        let repo = StatsRepository::new(temp_path("missing.json"));
        std::fs::remove_file(temp_path("missing.json")).ok();

        let stats = repo.load();
        assert_eq!(stats, GlobalStats::default());
    }

    #[test]
    fn test_save_then_load_round_trip() {
        let path = temp_path("roundtrip.json");
        let repo = StatsRepository::new(&path);

        let mut stats = GlobalStats::default();
        stats.record_loss();
        stats.record_close(-42.0);
        repo.save(&stats).unwrap();

        let loaded = repo.load();
        assert_eq!(loaded, stats);
        assert_eq!(loaded.losses_count, 1);
        assert_eq!(loaded.max_loss, -42.0);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_load_corrupt_file_defaults() {
        let path = temp_path("corrupt.json");
        std::fs::write(&path, "{not json").unwrap();

        let repo = StatsRepository::new(&path);
        assert_eq!(repo.load(), GlobalStats::default());

        std::fs::remove_file(&path).ok();
    }
}
