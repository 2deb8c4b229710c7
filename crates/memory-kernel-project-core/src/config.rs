use serde::{Deserialize, Serialize};

use crate::ProjectError;

pub const DEFAULT_AUTO_SESSION: bool = true;
pub const DEFAULT_AUTO_SESSION_HOURS: f64 = 4.0;
pub const DEFAULT_AUTO_BACKUP: bool = true;
pub const DEFAULT_BACKUP_INTERVAL: u64 = 10;
pub const DEFAULT_MAX_BACKUP_DAYS: u64 = 7;
pub const DEFAULT_TOKEN_OPTIMIZATION: bool = true;
pub const DEFAULT_SILENT_MODE: bool = false;
pub const MAX_AUTO_SESSION_HOURS: f64 = 24.0 * 366.0;

/// Configuration as written in `config.json` or supplied by a caller. Every
/// field is optional; unset fields fall through to the next layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_session: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_session_hours: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_backup: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_interval: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_backup_days: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_optimization: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub silent_mode: Option<bool>,
}

/// Fully resolved configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MemoryConfig {
    pub auto_session: bool,
    pub auto_session_hours: f64,
    pub auto_backup: bool,
    pub backup_interval: u64,
    pub max_backup_days: u64,
    pub token_optimization: bool,
    pub silent_mode: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            auto_session: DEFAULT_AUTO_SESSION,
            auto_session_hours: DEFAULT_AUTO_SESSION_HOURS,
            auto_backup: DEFAULT_AUTO_BACKUP,
            backup_interval: DEFAULT_BACKUP_INTERVAL,
            max_backup_days: DEFAULT_MAX_BACKUP_DAYS,
            token_optimization: DEFAULT_TOKEN_OPTIMIZATION,
            silent_mode: DEFAULT_SILENT_MODE,
        }
    }
}

impl ConfigFile {
    /// Decodes a config file body.
    ///
    /// # Errors
    /// Returns [`ProjectError::Configuration`] when the body is not a valid
    /// configuration object.
    pub fn from_json_str(body: &str) -> Result<Self, ProjectError> {
        serde_json::from_str(body)
            .map_err(|err| ProjectError::Configuration(format!("invalid config JSON: {err}")))
    }

    /// Layers `overrides` on top of `self` and fills the rest with defaults.
    ///
    /// # Errors
    /// Returns [`ProjectError::Configuration`] when the merged values violate
    /// configuration bounds.
    pub fn resolve(&self, overrides: &ConfigFile) -> Result<MemoryConfig, ProjectError> {
        let config = MemoryConfig {
            auto_session: overrides
                .auto_session
                .or(self.auto_session)
                .unwrap_or(DEFAULT_AUTO_SESSION),
            auto_session_hours: overrides
                .auto_session_hours
                .or(self.auto_session_hours)
                .unwrap_or(DEFAULT_AUTO_SESSION_HOURS),
            auto_backup: overrides
                .auto_backup
                .or(self.auto_backup)
                .unwrap_or(DEFAULT_AUTO_BACKUP),
            backup_interval: overrides
                .backup_interval
                .or(self.backup_interval)
                .unwrap_or(DEFAULT_BACKUP_INTERVAL),
            max_backup_days: overrides
                .max_backup_days
                .or(self.max_backup_days)
                .unwrap_or(DEFAULT_MAX_BACKUP_DAYS),
            token_optimization: overrides
                .token_optimization
                .or(self.token_optimization)
                .unwrap_or(DEFAULT_TOKEN_OPTIMIZATION),
            silent_mode: overrides
                .silent_mode
                .or(self.silent_mode)
                .unwrap_or(DEFAULT_SILENT_MODE),
        };
        config.validate()?;
        Ok(config)
    }
}

impl MemoryConfig {
    /// Validates numeric bounds.
    ///
    /// # Errors
    /// Returns [`ProjectError::Configuration`] when a threshold is out of range.
    pub fn validate(&self) -> Result<(), ProjectError> {
        if !(0.0..=MAX_AUTO_SESSION_HOURS).contains(&self.auto_session_hours) {
            return Err(ProjectError::Configuration(format!(
                "autoSessionHours MUST be in [0, {MAX_AUTO_SESSION_HOURS}]"
            )));
        }

        if self.backup_interval == 0 {
            return Err(ProjectError::Configuration(
                "backupInterval MUST be >= 1".to_string(),
            ));
        }

        Ok(())
    }

    #[must_use]
    pub fn session_max_age(&self) -> time::Duration {
        time::Duration::seconds_f64(self.auto_session_hours * 3_600.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    #[test]
    fn empty_layers_resolve_to_documented_defaults() {
        let config = must(ConfigFile::default().resolve(&ConfigFile::default()));
        assert_eq!(config, MemoryConfig::default());
        assert!(config.auto_session);
        assert!((config.auto_session_hours - 4.0).abs() < f64::EPSILON);
        assert!(config.auto_backup);
        assert_eq!(config.backup_interval, 10);
        assert_eq!(config.max_backup_days, 7);
        assert!(config.token_optimization);
        assert!(!config.silent_mode);
    }

    #[test]
    fn overrides_win_over_file_values() {
        let file = must(ConfigFile::from_json_str(
            r#"{"backupInterval": 3, "silentMode": true, "autoSession": false}"#,
        ));
        let overrides = ConfigFile {
            backup_interval: Some(5),
            ..ConfigFile::default()
        };

        let config = must(file.resolve(&overrides));
        assert_eq!(config.backup_interval, 5);
        assert!(config.silent_mode);
        assert!(!config.auto_session);
        assert_eq!(config.max_backup_days, DEFAULT_MAX_BACKUP_DAYS);
    }

    #[test]
    fn zero_backup_interval_is_rejected() {
        let file = ConfigFile {
            backup_interval: Some(0),
            ..ConfigFile::default()
        };
        assert!(matches!(
            file.resolve(&ConfigFile::default()),
            Err(ProjectError::Configuration(_))
        ));
    }

    #[test]
    fn negative_session_hours_are_rejected() {
        let file = ConfigFile {
            auto_session_hours: Some(-1.0),
            ..ConfigFile::default()
        };
        assert!(file.resolve(&ConfigFile::default()).is_err());
    }

    #[test]
    fn malformed_config_body_is_a_configuration_error() {
        assert!(matches!(
            ConfigFile::from_json_str(r#"{"backupInterval": "often"}"#),
            Err(ProjectError::Configuration(_))
        ));
    }
}
