//! Loading [`SyncConfig`] from TOML plus environment overrides.
//!
//! Secrets are best kept out of the file:
//!
//! | Variable | Overrides |
//! |---|---|
//! | `ENCOUNTER_SYNC_DB_PASSWORD` | `db_route.password` |
//! | `ENCOUNTER_SYNC_SSH_SECRET` | `ssh_route.key_or_password` |
//! | `ENCOUNTER_SYNC_USE_LOCALHOST` | `use_localhost` |

use std::path::Path;

use encounter_sync_models::SyncConfig;

use crate::SyncError;

/// Config file read when `--config` is not given, if it exists.
pub const DEFAULT_CONFIG_FILE: &str = "encounter_sync.toml";

/// Overrides `db_route.password`.
pub const ENV_DB_PASSWORD: &str = "ENCOUNTER_SYNC_DB_PASSWORD";

/// Overrides `ssh_route.key_or_password`.
pub const ENV_SSH_SECRET: &str = "ENCOUNTER_SYNC_SSH_SECRET";

/// Overrides `use_localhost`.
pub const ENV_USE_LOCALHOST: &str = "ENCOUNTER_SYNC_USE_LOCALHOST";

/// Reads the config at `path`, or [`DEFAULT_CONFIG_FILE`] if present, or
/// falls back to defaults. Environment overrides are applied last.
///
/// # Errors
///
/// Returns [`SyncError::Config`] if an explicitly named file cannot be read
/// or an override is malformed, and [`SyncError::Toml`] if the file does
/// not parse.
pub fn load_config(path: Option<&Path>) -> Result<SyncConfig, SyncError> {
    let mut config = match path {
        Some(path) => parse_file(path)?,
        None if Path::new(DEFAULT_CONFIG_FILE).is_file() => {
            parse_file(Path::new(DEFAULT_CONFIG_FILE))?
        }
        None => {
            log::debug!("No config file, using defaults");
            SyncConfig::default()
        }
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
    Ok(config)
}

fn parse_file(path: &Path) -> Result<SyncConfig, SyncError> {
    let text = std::fs::read_to_string(path).map_err(|e| SyncError::Config {
        message: format!("cannot read {}: {e}", path.display()),
    })?;
    log::info!("Loaded config from {}", path.display());
    Ok(toml::from_str(&text)?)
}

/// Applies the `ENCOUNTER_SYNC_*` overrides using `lookup` to read
/// variables.
///
/// # Errors
///
/// Returns [`SyncError::Config`] if `ENCOUNTER_SYNC_USE_LOCALHOST` is not a
/// boolean.
pub fn apply_env_overrides(
    config: &mut SyncConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<(), SyncError> {
    if let Some(password) = lookup(ENV_DB_PASSWORD) {
        match config.db_route.as_mut() {
            Some(db) => db.password = password,
            None => log::warn!("{ENV_DB_PASSWORD} is set but no [db_route] is configured"),
        }
    }

    if let Some(secret) = lookup(ENV_SSH_SECRET) {
        match config.ssh_route.as_mut() {
            Some(ssh) => ssh.key_or_password = secret,
            None => log::warn!("{ENV_SSH_SECRET} is set but no [ssh_route] is configured"),
        }
    }

    if let Some(value) = lookup(ENV_USE_LOCALHOST) {
        config.use_localhost = parse_bool(&value).ok_or_else(|| SyncError::Config {
            message: format!("{ENV_USE_LOCALHOST} must be true or false, got '{value}'"),
        })?;
    }

    Ok(())
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn config_with_routes() -> SyncConfig {
        toml::from_str(
            r#"
            [ssh_route]
            host = "bastion"
            user = "ops"

            [db_route]
            host = "db.internal"
            user = "reader"
            password = "from-file"
            database = "clinic"
            "#,
        )
        .unwrap()
    }

    #[test]
    fn env_overrides_secrets() {
        let mut config = config_with_routes();
        let env: BTreeMap<&str, &str> = [
            (ENV_DB_PASSWORD, "from-env"),
            (ENV_SSH_SECRET, "ssh-pass"),
            (ENV_USE_LOCALHOST, "yes"),
        ]
        .into();

        apply_env_overrides(&mut config, |k| env.get(k).map(ToString::to_string)).unwrap();

        assert_eq!(config.db_route.unwrap().password, "from-env");
        assert_eq!(config.ssh_route.unwrap().key_or_password, "ssh-pass");
        assert!(config.use_localhost);
    }

    #[test]
    fn no_env_keeps_file_values() {
        let mut config = config_with_routes();
        apply_env_overrides(&mut config, |_| None).unwrap();
        assert_eq!(config.db_route.unwrap().password, "from-file");
        assert!(!config.use_localhost);
    }

    #[test]
    fn rejects_bad_bool() {
        let mut config = SyncConfig::default();
        let err = apply_env_overrides(&mut config, |k| {
            (k == ENV_USE_LOCALHOST).then(|| "maybe".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, SyncError::Config { .. }));
    }

    #[test]
    fn loads_explicit_file() {
        let path = std::env::temp_dir().join(format!(
            "encounter_sync_config_{}.toml",
            uuid::Uuid::new_v4()
        ));
        std::fs::write(&path, "batch_size = 10\nroot_dir = \"/tmp/report\"\n").unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.root_dir, Path::new("/tmp/report"));

        std::fs::write(&path, "batch_size = \"ten\"\n").unwrap();
        assert!(matches!(load_config(Some(&path)), Err(SyncError::Toml(_))));

        let _ = std::fs::remove_file(&path);
        assert!(matches!(load_config(Some(&path)), Err(SyncError::Config { .. })));
    }
}
