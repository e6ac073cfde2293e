//! Config loader: reads `~/.zhi/config.json` and layers `ZHI_*` env vars
//! on top.
//!
//! # Loading precedence
//! 1. Defaults (`Config::default()`)
//! 2. JSON file at `~/.zhi/config.json`
//! 3. Environment variables (`ZHI_API_KEY`, `ZHI_DEFAULT_MODEL`, ...)

use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::schema::Config;

/// Default config file path.
pub fn get_config_path() -> PathBuf {
    crate::utils::get_data_path().join("config.json")
}

/// Load configuration from `path` (or the default path) plus env vars.
///
/// Falls back to `Config::default()` if the file doesn't exist or can't be
/// parsed. Values are not validated here; call [`Config::validate`].
pub fn load_config(path: Option<&Path>) -> Config {
    let config_path = path.map(PathBuf::from).unwrap_or_else(get_config_path);
    let config = load_config_from_path(&config_path);
    apply_env_overrides(config, |key| std::env::var(key).ok())
}

fn load_config_from_path(path: &Path) -> Config {
    if !path.exists() {
        info!("No config file found at {}, using defaults", path.display());
        return Config::default();
    }

    debug!("Loading config from {}", path.display());

    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            warn!("Failed to read config file {}: {}", path.display(), e);
            return Config::default();
        }
    };

    match serde_json::from_str::<Config>(&content) {
        Ok(c) => c,
        Err(e) => {
            warn!("Failed to parse config JSON: {}", e);
            Config::default()
        }
    }
}

/// Save configuration as pretty-printed camelCase JSON.
///
/// On unix the file is restricted to the owner since it holds the API key.
pub fn save_config(config: &Config, path: Option<&Path>) -> std::io::Result<PathBuf> {
    let config_path = path.map(PathBuf::from).unwrap_or_else(get_config_path);

    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(config).map_err(std::io::Error::other)?;
    std::fs::write(&config_path, json)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) =
            std::fs::set_permissions(&config_path, std::fs::Permissions::from_mode(0o600))
        {
            warn!("Could not restrict permissions on {}: {}", config_path.display(), e);
        }
    }

    debug!("Config saved to {}", config_path.display());
    Ok(config_path)
}

/// Apply environment overrides using `lookup` to read variables.
///
/// Supported overrides:
/// - `ZHI_API_KEY` → `api_key`
/// - `ZHI_API_BASE` → `api_base`
/// - `ZHI_DEFAULT_MODEL` → `default_model`
/// - `ZHI_SKILL_MODEL` → `skill_model`
/// - `ZHI_OUTPUT_DIR` → `output_dir`
/// - `ZHI_LOG_LEVEL` → `log_level`
/// - `ZHI_MAX_TURNS` → `max_turns`
/// - `ZHI_PERMISSION_MODE` → `permission_mode`
///
/// Empty values are ignored, as are values that fail to parse.
fn apply_env_overrides<F>(mut config: Config, lookup: F) -> Config
where
    F: Fn(&str) -> Option<String>,
{
    let var = |key: &str| lookup(key).filter(|v| !v.is_empty());

    if let Some(val) = var("ZHI_API_KEY") {
        config.api_key = val;
    }
    if let Some(val) = var("ZHI_API_BASE") {
        config.api_base = val;
    }
    if let Some(val) = var("ZHI_DEFAULT_MODEL") {
        config.default_model = val;
    }
    if let Some(val) = var("ZHI_SKILL_MODEL") {
        config.skill_model = val;
    }
    if let Some(val) = var("ZHI_OUTPUT_DIR") {
        config.output_dir = val;
    }
    if let Some(val) = var("ZHI_LOG_LEVEL") {
        config.log_level = val;
    }
    if let Some(val) = var("ZHI_MAX_TURNS") {
        match val.parse::<u32>() {
            Ok(n) => config.max_turns = n,
            Err(_) => warn!(value = %val, "Ignoring non-numeric ZHI_MAX_TURNS"),
        }
    }
    if let Some(val) = var("ZHI_PERMISSION_MODE") {
        match val.parse() {
            Ok(mode) => config.permission_mode = mode,
            Err(e) => warn!("Ignoring ZHI_PERMISSION_MODE: {}", e),
        }
    }

    config
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PermissionMode;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_temp_json(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_load_missing_file() {
        let config = load_config_from_path(Path::new("/nonexistent/zhi/config.json"));
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_partial_json_keeps_defaults() {
        let file = write_temp_json(r#"{"defaultModel": "glm-4-air", "maxTurns": 12}"#);
        let config = load_config_from_path(file.path());
        assert_eq!(config.default_model, "glm-4-air");
        assert_eq!(config.max_turns, 12);
        assert_eq!(config.skill_model, "glm-4-flash");
    }

    #[test]
    fn test_load_invalid_json_returns_defaults() {
        let file = write_temp_json("not json {{");
        let config = load_config_from_path(file.path());
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let config = Config {
            api_key: "zk-test".into(),
            permission_mode: PermissionMode::Auto,
            ..Default::default()
        };
        let written = save_config(&config, Some(&path)).unwrap();
        assert_eq!(written, path);

        let reloaded = load_config_from_path(&path);
        assert_eq!(reloaded.api_key, "zk-test");
        assert_eq!(reloaded.permission_mode, PermissionMode::Auto);
    }

    #[cfg(unix)]
    #[test]
    fn test_saved_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        save_config(&Config::default(), Some(&path)).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_env_overrides() {
        let config = apply_env_overrides(
            Config::default(),
            env(&[
                ("ZHI_API_KEY", "from-env"),
                ("ZHI_DEFAULT_MODEL", "glm-4-air"),
                ("ZHI_MAX_TURNS", "7"),
                ("ZHI_PERMISSION_MODE", "auto"),
            ]),
        );
        assert_eq!(config.api_key, "from-env");
        assert_eq!(config.default_model, "glm-4-air");
        assert_eq!(config.max_turns, 7);
        assert_eq!(config.permission_mode, PermissionMode::Auto);
    }

    #[test]
    fn test_env_ignores_empty_and_garbage() {
        let config = apply_env_overrides(
            Config::default(),
            env(&[
                ("ZHI_API_KEY", ""),
                ("ZHI_MAX_TURNS", "many"),
                ("ZHI_PERMISSION_MODE", "yolo"),
            ]),
        );
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_env_overrides_file_values() {
        let file = write_temp_json(r#"{"outputDir": "from-file"}"#);
        let config = apply_env_overrides(
            load_config_from_path(file.path()),
            env(&[("ZHI_OUTPUT_DIR", "from-env")]),
        );
        assert_eq!(config.output_dir, "from-env");
    }
}
