use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

pub const TELEGRAM_TOKEN_ENV: &str = "TELEGRAM_TOKEN";
pub const TELEGRAM_CHAT_ID_ENV: &str = "TELEGRAM_CHAT_ID";
pub const FOLDER_ID_ENV: &str = "FOLDER_ID";
const CHECK_INTERVAL_ENV: &str = "CHECK_INTERVAL_SECS";
const SAVE_DIR_ENV: &str = "WHALE_SAVE_DIR";
const TEMP_DIR_ENV: &str = "WHALE_TEMP_DIR";
const TOKEN_FILE_ENV: &str = "GOOGLE_TOKEN_FILE";
const CREDENTIALS_FILE_ENV: &str = "GOOGLE_CREDENTIALS_FILE";
const TELEGRAM_API_ENV: &str = "TELEGRAM_API_URL";
const ALERT_TEXT_ENV: &str = "WHALE_ALERT_TEXT";

const DEFAULT_CHECK_INTERVAL_SECS: u64 = 10;
const DEFAULT_SAVE_DIR: &str = "whales";
const DEFAULT_TOKEN_FILE: &str = "token.json";
const DEFAULT_CREDENTIALS_FILE: &str = "credentials.json";
pub const DEFAULT_TELEGRAM_API: &str = "https://api.telegram.org";
const DEFAULT_ALERT_TEXT: &str = "🐋 Whale spotted!";

/// Everything the daemon needs to know before it authenticates.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub telegram_token: String,
    pub telegram_chat_id: String,
    pub telegram_api_url: String,
    pub folder_id: String,
    pub check_interval: Duration,
    pub save_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub token_file: PathBuf,
    pub credentials_file: PathBuf,
    pub alert_text: String,
}

#[derive(Debug)]
pub enum ConfigError {
    Missing(&'static str),
    Invalid { name: &'static str, reason: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Missing(name) => {
                write!(f, "{name} must be set (environment or .env file)")
            }
            ConfigError::Invalid { name, reason } => write!(f, "{name} is invalid: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl WatchConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let optional = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_owned())
                .filter(|v| !v.is_empty())
        };
        let required = |name: &'static str| optional(name).ok_or(ConfigError::Missing(name));

        let check_interval = match optional(CHECK_INTERVAL_ENV) {
            Some(raw) => parse_interval(&raw)?,
            None => Duration::from_secs(DEFAULT_CHECK_INTERVAL_SECS),
        };

        Ok(Self {
            telegram_token: required(TELEGRAM_TOKEN_ENV)?,
            telegram_chat_id: required(TELEGRAM_CHAT_ID_ENV)?,
            telegram_api_url: optional(TELEGRAM_API_ENV)
                .unwrap_or_else(|| DEFAULT_TELEGRAM_API.to_string()),
            folder_id: required(FOLDER_ID_ENV)?,
            check_interval,
            save_dir: optional(SAVE_DIR_ENV)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SAVE_DIR)),
            temp_dir: optional(TEMP_DIR_ENV)
                .map(PathBuf::from)
                .unwrap_or_else(|| env::temp_dir().join("whalewatch")),
            token_file: optional(TOKEN_FILE_ENV)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_TOKEN_FILE)),
            credentials_file: optional(CREDENTIALS_FILE_ENV)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CREDENTIALS_FILE)),
            alert_text: optional(ALERT_TEXT_ENV).unwrap_or_else(|| DEFAULT_ALERT_TEXT.to_string()),
        })
    }
}

/// Loads `.env` into the process environment. Runs before logging is set up
/// so `RUST_LOG` can live there too; the outcome is logged afterwards.
pub fn load_dotenv() -> Result<Option<PathBuf>, dotenvy::Error> {
    match dotenvy::dotenv() {
        Ok(path) => Ok(Some(path)),
        Err(err) if err.not_found() => Ok(None),
        Err(err) => Err(err),
    }
}

fn parse_interval(raw: &str) -> Result<Duration, ConfigError> {
    let secs: u64 = raw.parse().map_err(|_| ConfigError::Invalid {
        name: CHECK_INTERVAL_ENV,
        reason: format!("`{raw}` is not a whole number of seconds"),
    })?;
    if secs == 0 {
        return Err(ConfigError::Invalid {
            name: CHECK_INTERVAL_ENV,
            reason: "must be at least 1 second".into(),
        });
    }
    Ok(Duration::from_secs(secs))
}
