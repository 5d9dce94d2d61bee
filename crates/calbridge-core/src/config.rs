use std::path::{Path, PathBuf};

use anyhow::Result;
use config::Config;
use serde::Deserialize;

use crate::types::{ConflictPolicy, SyncDirection};

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub database: DatabaseConfig,
    pub google: GoogleConfig,
    pub caldav: CalDavConfig,
    pub sync: SyncConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u8,
}

/// Google OAuth material. The OAuth flow itself is external; the engine only
/// consumes a bearer token persisted at `token_path`.
#[derive(Debug, Clone, Deserialize)]
pub struct GoogleConfig {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub token_path: PathBuf,
}

/// CalDAV endpoint with Basic auth via an app-specific password.
/// Credentials may be given inline or as paths into a secrets directory.
#[derive(Debug, Clone, Deserialize)]
pub struct CalDavConfig {
    pub server_url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub username_file: Option<PathBuf>,
    pub password_file: Option<PathBuf>,
}

impl CalDavConfig {
    /// ## Summary
    /// Resolves the username, preferring the inline value over the file.
    ///
    /// ## Errors
    /// Returns an error when neither is configured or the file is unreadable.
    pub fn resolve_username(&self) -> Result<String> {
        resolve_secret("caldav.username", self.username.as_deref(), self.username_file.as_deref())
    }

    /// ## Summary
    /// Resolves the app-specific password, preferring the inline value.
    ///
    /// ## Errors
    /// Returns an error when neither is configured or the file is unreadable.
    pub fn resolve_password(&self) -> Result<String> {
        resolve_secret("caldav.password", self.password.as_deref(), self.password_file.as_deref())
    }
}

fn resolve_secret(name: &str, inline: Option<&str>, file: Option<&Path>) -> Result<String> {
    if let Some(value) = inline {
        return Ok(value.to_string());
    }
    if let Some(path) = file {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read secret file {}: {e}", path.display()))?;
        return Ok(contents.trim().to_string());
    }
    anyhow::bail!("{name} is not configured (set the value or a *_file path)")
}

/// A configured one-to-one calendar pairing
#[derive(Debug, Clone, Deserialize)]
pub struct PairConfig {
    pub name: Option<String>,
    pub google_calendar_id: String,
    pub caldav_calendar_id: String,
    #[serde(default)]
    pub direction: SyncDirection,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub conflict_policy: Option<ConflictPolicy>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    pub past_days: i64,
    pub future_days: i64,
    pub max_events_per_pass: usize,
    pub retry_attempts: u32,
    pub retry_backoff_seconds: u64,
    pub conflict_policy: ConflictPolicy,
    pub auto_create_calendars: bool,
    pub poll_interval_seconds: u64,
    pub webhook_renew_minutes: u64,
    pub webhook_renew_before_minutes: u64,
    /// Pair leftover CalDAV calendars with Google's primary when set
    pub match_leftover_to_primary: bool,
    #[serde(default)]
    pub pairs: Vec<PairConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

const fn default_true() -> bool {
    true
}

impl Settings {
    /// ## Summary
    /// Loads configuration from `.env` file and environment variables into a
    /// `Settings`. Environment variables take precedence over `.env` file
    /// values; an optional `config.toml` fills the rest.
    ///
    /// ## Errors
    /// Returns an error if building the configuration or deserializing it fails.
    pub fn load() -> Result<Self> {
        Ok(Config::builder()
            .set_default("database.max_connections", 4)?
            .set_default("google.token_path", "credentials/google_token.json")?
            .set_default("caldav.server_url", crate::constants::CALDAV_DISCOVERY_URL)?
            .set_default("sync.past_days", 30)?
            .set_default("sync.future_days", 365)?
            .set_default("sync.max_events_per_pass", 1000)?
            .set_default("sync.retry_attempts", 3)?
            .set_default("sync.retry_backoff_seconds", 5)?
            .set_default("sync.conflict_policy", "latest_wins")?
            .set_default("sync.auto_create_calendars", false)?
            .set_default("sync.poll_interval_seconds", 300)?
            .set_default("sync.webhook_renew_minutes", 1440)?
            .set_default("sync.webhook_renew_before_minutes", 60)?
            .set_default("sync.match_leftover_to_primary", false)?
            .set_default("logging.level", "debug")?
            // Env file
            .add_source(
                config::Environment::default()
                    .convert_case(config::Case::Snake)
                    .separator("_")
                    .ignore_empty(true)
                    .try_parsing(true),
            )
            // TOML file
            .add_source(config::File::with_name("config.toml").required(false))
            .build()?
            .try_deserialize::<Settings>()?)
    }
}

/// ## Summary
/// Loads configuration from environment variables and `.env` file.
///
/// ## Errors
/// Returns an error if loading or deserializing the configuration fails.
pub fn load_config() -> Result<Settings> {
    dotenvy::dotenv().ok();

    Settings::load()
}
