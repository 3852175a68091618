//! arcsync configuration file parsing (.arcsync.toml)

use std::path::{Path, PathBuf};

use arcsync_core::ChunkConfig;

/// arcsync project configuration
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
pub struct ArcsyncConfig {
    /// Default chunk store directory
    pub store: Option<PathBuf>,

    /// Chunk size bounds used when no flags are given
    pub chunk: Option<ChunkConfig>,
}

/// Config file name
pub const CONFIG_FILE: &str = ".arcsync.toml";

impl ArcsyncConfig {
    /// Load config from a directory.
    ///
    /// Returns default config if .arcsync.toml doesn't exist.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be parsed.
    pub fn load(dir: &Path) -> color_eyre::Result<Self> {
        let config_path = dir.join(CONFIG_FILE);
        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
store = "/var/lib/arcsync/default.store"

[chunk]
min_size = 4096
avg_size = 16384
max_size = 65536
"#;

        let config: ArcsyncConfig = toml::from_str(toml).unwrap();
        assert_eq!(
            config.store.as_deref(),
            Some(Path::new("/var/lib/arcsync/default.store"))
        );
        let chunk = config.chunk.unwrap();
        assert_eq!(chunk.min_size, 4096);
        assert_eq!(chunk.avg_size, 16384);
        assert_eq!(chunk.max_size, 65536);
    }

    #[test]
    fn test_parse_empty_config() {
        let config: ArcsyncConfig = toml::from_str("").unwrap();
        assert!(config.store.is_none());
        assert!(config.chunk.is_none());
    }

    #[test]
    fn test_load_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = ArcsyncConfig::load(dir.path()).unwrap();
        assert!(config.store.is_none());
    }
}
