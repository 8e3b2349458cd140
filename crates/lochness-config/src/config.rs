// crates/lochness-config/src/config.rs
// ============================================================================
// Module: Lochness Configuration
// Description: Configuration loading, environment overrides, and validation.
// Purpose: Provide strict, fail-closed config parsing with hard limits.
// Dependencies: lochness-connectors, lochness-core, lochness-store-sqlite, serde, toml
// ============================================================================

//! ## Overview
//! Configuration is loaded from a TOML file with strict size and path limits,
//! then overlaid with environment values for secrets and deployment paths.
//! Unknown keys and out-of-range values fail closed. Environment lookup is a
//! plain function so callers and tests can inject their own.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::env;
use std::fs;
use std::path::Path;
use std::path::PathBuf;

use lochness_connectors::ConnectorOptions;
use lochness_core::KdfParams;
use lochness_store_sqlite::SqliteStoreConfig;
use serde::Deserialize;
use thiserror::Error;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Default configuration filename when no path is specified.
const DEFAULT_CONFIG_NAME: &str = "lochness.toml";
/// Environment variable used to override the config path.
pub const CONFIG_ENV_VAR: &str = "LOCHNESS_CONFIG";
/// Environment variable overriding `database.path`.
pub const DATABASE_PATH_ENV_VAR: &str = "LOCHNESS_DATABASE_PATH";
/// Default environment variable holding the vault passphrase.
pub const DEFAULT_PASSPHRASE_ENV_VAR: &str = "LOCHNESS_VAULT_PASSPHRASE";
/// Default database file.
const DEFAULT_DATABASE_PATH: &str = "lochness.db";
/// Maximum configuration file size in bytes.
pub(crate) const MAX_CONFIG_FILE_SIZE: usize = 1024 * 1024;
/// Maximum length of a single path component.
pub(crate) const MAX_PATH_COMPONENT_LENGTH: usize = 255;
/// Maximum total path length.
pub(crate) const MAX_TOTAL_PATH_LENGTH: usize = 4096;
/// Maximum attempts per operation.
pub(crate) const MAX_ATTEMPTS: u32 = 100;
/// Upper bound for any backoff delay.
pub(crate) const MAX_BACKOFF_CEILING_MS: u64 = 3_600_000;
/// Upper bound for the in-flight ledger.
pub(crate) const MAX_IN_FLIGHT_CEILING: u32 = 100_000;
/// Upper bound for cursor restarts within one run.
pub(crate) const MAX_CURSOR_RESTARTS: u32 = 100;
/// Upper bound for the scheduler pool.
pub(crate) const MAX_WORKERS: usize = 256;
/// Upper bound for the scheduler interval (one week).
pub(crate) const MAX_INTERVAL_SECS: u64 = 7 * 24 * 60 * 60;
/// Smallest Argon2 memory cost accepted.
pub(crate) const MIN_KDF_MEMORY_KIB: u32 = 8;
/// Largest Argon2 memory cost accepted (4 GiB).
pub(crate) const MAX_KDF_MEMORY_KIB: u32 = 4 * 1024 * 1024;
/// Largest Argon2 iteration count accepted.
pub(crate) const MAX_KDF_ITERATIONS: u32 = 64;
/// Largest Argon2 parallelism accepted.
pub(crate) const MAX_KDF_PARALLELISM: u32 = 64;
/// Maximum length of an environment variable name.
pub(crate) const MAX_ENV_NAME_LENGTH: usize = 128;

// ============================================================================
// SECTION: Configuration Types
// ============================================================================

/// Lochness process configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LochnessConfig {
    /// `SQLite` database settings.
    #[serde(default = "default_database")]
    pub database: SqliteStoreConfig,
    /// Credential vault settings.
    #[serde(default)]
    pub vault: VaultConfig,
    /// Orchestrator tuning.
    #[serde(default)]
    pub sync: SyncConfig,
    /// Scheduler tuning.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Sync event output.
    #[serde(default)]
    pub events: EventsConfig,
    /// Built-in connector options.
    #[serde(default)]
    pub connectors: ConnectorOptions,
    /// Non-fatal findings from the last validation pass.
    #[serde(skip)]
    pub warnings: Vec<String>,
}

impl Default for LochnessConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
            vault: VaultConfig::default(),
            sync: SyncConfig::default(),
            scheduler: SchedulerConfig::default(),
            events: EventsConfig::default(),
            connectors: ConnectorOptions::default(),
            warnings: Vec::new(),
        }
    }
}

impl LochnessConfig {
    /// Loads configuration from disk using the process environment.
    ///
    /// The path is taken from `path`, then `LOCHNESS_CONFIG`, then
    /// `lochness.toml` in the working directory.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when loading or validation fails.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with_env(path, &|name| env::var(name).ok())
    }

    /// Loads configuration from disk with an injected environment lookup.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when loading or validation fails.
    pub fn load_with_env(
        path: Option<&Path>,
        lookup: &dyn Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let resolved = resolve_path(path, lookup)?;
        validate_path(&resolved)?;
        let bytes = fs::read(&resolved)
            .map_err(|err| ConfigError::Io(format!("{}: {err}", resolved.display())))?;
        if bytes.len() > MAX_CONFIG_FILE_SIZE {
            return Err(ConfigError::Invalid("config file exceeds size limit".to_string()));
        }
        let content = std::str::from_utf8(&bytes)
            .map_err(|_| ConfigError::Invalid("config file must be utf-8".to_string()))?;
        Self::from_toml_with_env(content, lookup)
    }

    /// Parses configuration text, applies environment overrides, and validates.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed TOML and
    /// [`ConfigError::Invalid`] when validation fails.
    pub fn from_toml_with_env(
        content: &str,
        lookup: &dyn Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut config: Self =
            toml::from_str(content).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.apply_env(lookup)?;
        config.validate()?;
        Ok(config)
    }

    /// Overlays environment values onto the parsed file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the passphrase variable name is
    /// unusable.
    pub fn apply_env(&mut self, lookup: &dyn Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(path) = lookup(DATABASE_PATH_ENV_VAR) {
            self.database.path = PathBuf::from(path);
        }
        validate_env_name("vault.passphrase_env", &self.vault.passphrase_env)?;
        if let Some(passphrase) = lookup(&self.vault.passphrase_env) {
            self.vault.passphrase = Some(passphrase);
            self.vault.passphrase_source = PassphraseSource::Environment;
        } else if self.vault.passphrase.is_some() {
            self.vault.passphrase_source = PassphraseSource::File;
        }
        Ok(())
    }

    /// Validates the configuration and records non-fatal warnings.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        self.warnings.clear();
        validate_path_string("database.path", &self.database.path.to_string_lossy())?;
        if self.database.busy_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "database.busy_timeout_ms must be greater than zero".to_string(),
            ));
        }
        self.vault.validate()?;
        self.sync.validate()?;
        self.scheduler.validate()?;
        self.events.validate()?;
        validate_connectors(&self.connectors)?;
        if self.vault.passphrase_source == PassphraseSource::File {
            self.warnings.push(format!(
                "vault.passphrase is stored in the config file; prefer the {} environment variable",
                self.vault.passphrase_env
            ));
        }
        Ok(())
    }
}

/// Where the resolved vault passphrase came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PassphraseSource {
    /// No passphrase configured.
    #[default]
    Missing,
    /// Read from the configured environment variable.
    Environment,
    /// Read from the config file.
    File,
}

/// Credential vault configuration.
#[derive(Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VaultConfig {
    /// Environment variable holding the passphrase.
    #[serde(default = "default_passphrase_env")]
    pub passphrase_env: String,
    /// Passphrase stored in the file (discouraged).
    #[serde(default)]
    pub passphrase: Option<String>,
    /// Argon2id parameters used when the vault is first initialized.
    #[serde(default)]
    pub kdf: KdfParams,
    /// Origin of `passphrase` after overrides.
    #[serde(skip)]
    pub passphrase_source: PassphraseSource,
}

impl std::fmt::Debug for VaultConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultConfig")
            .field("passphrase_env", &self.passphrase_env)
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .field("kdf", &self.kdf)
            .field("passphrase_source", &self.passphrase_source)
            .finish()
    }
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            passphrase_env: default_passphrase_env(),
            passphrase: None,
            kdf: KdfParams::default(),
            passphrase_source: PassphraseSource::Missing,
        }
    }
}

impl VaultConfig {
    /// Returns the resolved passphrase.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when neither the environment nor the
    /// file provides one.
    pub fn passphrase(&self) -> Result<&str, ConfigError> {
        self.passphrase.as_deref().ok_or_else(|| {
            ConfigError::Invalid(format!(
                "vault passphrase missing: set {} or vault.passphrase",
                self.passphrase_env
            ))
        })
    }

    /// Validates vault settings.
    fn validate(&self) -> Result<(), ConfigError> {
        validate_env_name("vault.passphrase_env", &self.passphrase_env)?;
        if let Some(passphrase) = &self.passphrase
            && passphrase.is_empty()
        {
            return Err(ConfigError::Invalid("vault passphrase must be non-empty".to_string()));
        }
        let kdf = self.kdf;
        if !(MIN_KDF_MEMORY_KIB ..= MAX_KDF_MEMORY_KIB).contains(&kdf.memory_kib) {
            return Err(ConfigError::Invalid(format!(
                "vault.kdf.memory_kib must be between {MIN_KDF_MEMORY_KIB} and {MAX_KDF_MEMORY_KIB}"
            )));
        }
        if !(1 ..= MAX_KDF_ITERATIONS).contains(&kdf.iterations) {
            return Err(ConfigError::Invalid(format!(
                "vault.kdf.iterations must be between 1 and {MAX_KDF_ITERATIONS}"
            )));
        }
        if !(1 ..= MAX_KDF_PARALLELISM).contains(&kdf.parallelism) {
            return Err(ConfigError::Invalid(format!(
                "vault.kdf.parallelism must be between 1 and {MAX_KDF_PARALLELISM}"
            )));
        }
        if kdf.memory_kib < kdf.parallelism.saturating_mul(8) {
            return Err(ConfigError::Invalid(
                "vault.kdf.memory_kib must be at least 8 * parallelism".to_string(),
            ));
        }
        Ok(())
    }
}

/// Orchestrator tuning.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SyncConfig {
    /// Attempts per fetch or write before the run fails.
    pub max_attempts: u32,
    /// First backoff delay in milliseconds.
    pub initial_backoff_ms: u64,
    /// Backoff ceiling in milliseconds.
    pub max_backoff_ms: u64,
    /// Written items between checkpoint advances.
    pub checkpoint_interval: u32,
    /// Ledger size that forces a checkpoint advance.
    pub max_in_flight: u32,
    /// Change-stream restarts allowed after cursor expiry.
    pub max_cursor_restarts: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            checkpoint_interval: 50,
            max_in_flight: 500,
            max_cursor_restarts: 3,
        }
    }
}

impl SyncConfig {
    /// Validates orchestrator tuning.
    fn validate(&self) -> Result<(), ConfigError> {
        if !(1 ..= MAX_ATTEMPTS).contains(&self.max_attempts) {
            return Err(ConfigError::Invalid(format!(
                "sync.max_attempts must be between 1 and {MAX_ATTEMPTS}"
            )));
        }
        if self.initial_backoff_ms == 0 {
            return Err(ConfigError::Invalid(
                "sync.initial_backoff_ms must be greater than zero".to_string(),
            ));
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(ConfigError::Invalid(
                "sync.max_backoff_ms must be >= sync.initial_backoff_ms".to_string(),
            ));
        }
        if self.max_backoff_ms > MAX_BACKOFF_CEILING_MS {
            return Err(ConfigError::Invalid(format!(
                "sync.max_backoff_ms must be <= {MAX_BACKOFF_CEILING_MS}"
            )));
        }
        if !(1 ..= MAX_IN_FLIGHT_CEILING).contains(&self.max_in_flight) {
            return Err(ConfigError::Invalid(format!(
                "sync.max_in_flight must be between 1 and {MAX_IN_FLIGHT_CEILING}"
            )));
        }
        if self.checkpoint_interval == 0 || self.checkpoint_interval > self.max_in_flight {
            return Err(ConfigError::Invalid(
                "sync.checkpoint_interval must be between 1 and sync.max_in_flight".to_string(),
            ));
        }
        if self.max_cursor_restarts > MAX_CURSOR_RESTARTS {
            return Err(ConfigError::Invalid(format!(
                "sync.max_cursor_restarts must be <= {MAX_CURSOR_RESTARTS}"
            )));
        }
        Ok(())
    }
}

/// Scheduler tuning.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SchedulerConfig {
    /// Concurrent runs.
    pub workers: usize,
    /// Seconds between `trigger_all` rounds in `serve`.
    pub interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            interval_secs: 900,
        }
    }
}

impl SchedulerConfig {
    /// Validates scheduler tuning.
    fn validate(&self) -> Result<(), ConfigError> {
        if !(1 ..= MAX_WORKERS).contains(&self.workers) {
            return Err(ConfigError::Invalid(format!(
                "scheduler.workers must be between 1 and {MAX_WORKERS}"
            )));
        }
        if !(1 ..= MAX_INTERVAL_SECS).contains(&self.interval_secs) {
            return Err(ConfigError::Invalid(format!(
                "scheduler.interval_secs must be between 1 and {MAX_INTERVAL_SECS}"
            )));
        }
        Ok(())
    }
}

/// Sync event output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EventsConfig {
    /// Append-only JSON lines file; events go to tracing when unset.
    pub jsonl_path: Option<PathBuf>,
}

impl EventsConfig {
    /// Validates event settings.
    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(path) = &self.jsonl_path {
            validate_path_string("events.jsonl_path", &path.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Configuration loading or validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O failure while reading configuration.
    #[error("config io error: {0}")]
    Io(String),
    /// TOML parsing error.
    #[error("config parse error: {0}")]
    Parse(String),
    /// Invalid configuration data.
    #[error("invalid config: {0}")]
    Invalid(String),
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Returns the default database settings.
fn default_database() -> SqliteStoreConfig {
    SqliteStoreConfig::at(DEFAULT_DATABASE_PATH)
}

/// Returns the default passphrase variable name.
fn default_passphrase_env() -> String {
    DEFAULT_PASSPHRASE_ENV_VAR.to_string()
}

/// Resolves the config path from CLI or environment defaults.
fn resolve_path(
    path: Option<&Path>,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<PathBuf, ConfigError> {
    if let Some(path) = path {
        return Ok(path.to_path_buf());
    }
    if let Some(env_path) = lookup(CONFIG_ENV_VAR) {
        if env_path.len() > MAX_TOTAL_PATH_LENGTH {
            return Err(ConfigError::Invalid("config path exceeds max length".to_string()));
        }
        return Ok(PathBuf::from(env_path));
    }
    Ok(PathBuf::from(DEFAULT_CONFIG_NAME))
}

/// Validates the resolved path against security limits.
fn validate_path(path: &Path) -> Result<(), ConfigError> {
    let text = path.to_string_lossy();
    if text.len() > MAX_TOTAL_PATH_LENGTH {
        return Err(ConfigError::Invalid("config path exceeds max length".to_string()));
    }
    for component in path.components() {
        let value = component.as_os_str().to_string_lossy();
        if value.len() > MAX_PATH_COMPONENT_LENGTH {
            return Err(ConfigError::Invalid("config path component too long".to_string()));
        }
    }
    Ok(())
}

/// Validates a path string against length constraints.
fn validate_path_string(field: &str, value: &str) -> Result<(), ConfigError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::Invalid(format!("{field} must be non-empty")));
    }
    if trimmed.len() > MAX_TOTAL_PATH_LENGTH {
        return Err(ConfigError::Invalid(format!("{field} exceeds max length")));
    }
    for component in Path::new(trimmed).components() {
        if component.as_os_str().len() > MAX_PATH_COMPONENT_LENGTH {
            return Err(ConfigError::Invalid(format!("{field} path component too long")));
        }
    }
    Ok(())
}

/// Validates an environment variable name.
fn validate_env_name(field: &str, value: &str) -> Result<(), ConfigError> {
    if value.is_empty() || value.len() > MAX_ENV_NAME_LENGTH {
        return Err(ConfigError::Invalid(format!(
            "{field} must be 1 to {MAX_ENV_NAME_LENGTH} characters"
        )));
    }
    if !value.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '_') {
        return Err(ConfigError::Invalid(format!(
            "{field} must contain only ASCII letters, digits, and underscores"
        )));
    }
    Ok(())
}

/// Validates connector options.
fn validate_connectors(options: &ConnectorOptions) -> Result<(), ConfigError> {
    let http = &options.http;
    if http.timeout_ms == 0 || http.connect_timeout_ms == 0 {
        return Err(ConfigError::Invalid(
            "connectors.http timeouts must be greater than zero".to_string(),
        ));
    }
    if http.connect_timeout_ms > http.timeout_ms {
        return Err(ConfigError::Invalid(
            "connectors.http.connect_timeout_ms must be <= connectors.http.timeout_ms".to_string(),
        ));
    }
    if http.max_body_bytes == 0 {
        return Err(ConfigError::Invalid(
            "connectors.http.max_body_bytes must be greater than zero".to_string(),
        ));
    }
    let sharepoint = &options.sharepoint;
    for (field, value) in [
        ("connectors.sharepoint.login_base", &sharepoint.login_base),
        ("connectors.sharepoint.graph_base", &sharepoint.graph_base),
    ] {
        if !(value.starts_with("https://") || value.starts_with("http://")) {
            return Err(ConfigError::Invalid(format!("{field} must be an http(s) URL")));
        }
    }
    Ok(())
}

// ============================================================================
// SECTION: Tests
// ============================================================================
