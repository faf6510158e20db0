use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Application directory name under the platform config/data roots
const APP_DIR: &str = "geosync";

/// Sync configuration file
pub const CONFIG_FILE: &str = "geosync.json";

/// Default log file for `--log` without a path
pub const LOG_FILE: &str = "geosync.log";

/// Configuration for overriding default application paths
#[derive(Debug, Clone, Default)]
pub struct PathConfig {
    /// Custom config directory (from CLI or ENV)
    pub config_dir: Option<PathBuf>,
}

impl PathConfig {
    /// Priority: CLI args → ENV var (GEOSYNC_CONFIG_DIR) → None (use defaults)
    pub fn from_env_and_cli(cli_dir: Option<PathBuf>) -> Self {
        let config_dir = cli_dir.or_else(|| std::env::var("GEOSYNC_CONFIG_DIR").ok().map(PathBuf::from));
        Self { config_dir }
    }
}

/// Get path to a configuration file
///
/// Priority:
/// 1. CLI --config-dir argument
/// 2. GEOSYNC_CONFIG_DIR environment variable
/// 3. Local folder IF geosync.json or geosync.log exist there
/// 4. Platform-specific config directory from dirs-next (default)
///
/// Platform paths:
/// - Linux: ~/.config/geosync/{name}
/// - macOS: ~/Library/Application Support/geosync/{name}
/// - Windows: %APPDATA%\geosync\{name}
pub fn config_file(name: &str, config: &PathConfig) -> PathBuf {
    resolve_dir(config, dirs_next::config_dir()).join(name)
}

/// Get path to a data file (logs). Same priority as [`config_file`], with
/// the platform data directory as default.
pub fn data_file(name: &str, config: &PathConfig) -> PathBuf {
    resolve_dir(config, dirs_next::data_dir()).join(name)
}

/// Ensure that configuration and data directories exist
pub fn ensure_dirs(config: &PathConfig) -> Result<()> {
    let config_dir = resolve_dir(config, dirs_next::config_dir());
    let data_dir = resolve_dir(config, dirs_next::data_dir());

    for dir in [&config_dir, &data_dir] {
        if !dir.exists() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        }
    }
    Ok(())
}

fn has_local_files(dir: &Path) -> bool {
    [CONFIG_FILE, LOG_FILE].iter().any(|f| dir.join(f).exists())
}

fn resolve_dir(config: &PathConfig, platform_root: Option<PathBuf>) -> PathBuf {
    if let Some(dir) = &config.config_dir {
        return dir.clone();
    }
    if let Ok(current_dir) = std::env::current_dir() {
        if has_local_files(&current_dir) {
            return current_dir;
        }
    }
    match platform_root {
        Some(root) => root.join(APP_DIR),
        None => PathBuf::from("."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_custom_dir_wins() {
        let config = PathConfig {
            config_dir: Some(PathBuf::from("/custom")),
        };
        assert_eq!(config_file("geosync.json", &config), PathBuf::from("/custom/geosync.json"));
        assert_eq!(data_file("geosync.log", &config), PathBuf::from("/custom/geosync.log"));
    }

    #[test]
    fn test_platform_defaults() {
        let path = resolve_dir(&PathConfig::default(), Some(PathBuf::from("/home/u/.config")));
        // Local files in the test's cwd would take priority
        if !has_local_files(&std::env::current_dir().unwrap()) {
            assert_eq!(path, PathBuf::from("/home/u/.config/geosync"));
        }
        assert_eq!(
            resolve_dir(&PathConfig { config_dir: Some("/x".into()) }, None),
            PathBuf::from("/x")
        );
    }

    #[test]
    fn test_ensure_dirs_creates_custom_dir() {
        let dir = std::env::temp_dir().join(format!("geosync_paths_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let config = PathConfig { config_dir: Some(dir.clone()) };
        ensure_dirs(&config).unwrap();
        assert!(dir.is_dir());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
