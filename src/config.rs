use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentConfig {
    pub telegram: TelegramConfig,
    pub rcon: RconConfig,
    pub minecraft: MinecraftConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Clone, Deserialize, Serialize)]
pub struct TelegramConfig {
    pub token: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Chat that receives the log relay and scheduled backup reports.
    pub chat_id: i64,
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: u64,
}

impl std::fmt::Debug for TelegramConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramConfig")
            .field("token", &"[REDACTED]")
            .field("base_url", &self.base_url)
            .field("chat_id", &self.chat_id)
            .field("poll_timeout_secs", &self.poll_timeout_secs)
            .finish()
    }
}

#[derive(Clone, Deserialize, Serialize)]
pub struct RconConfig {
    pub host: String,
    pub port: u16,
    pub password: String,
    #[serde(default = "default_rcon_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_rcon_timeout")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_rcon_retries")]
    pub retries: u32,
}

impl RconConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

impl std::fmt::Debug for RconConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RconConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("password", &"[REDACTED]")
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("read_timeout_secs", &self.read_timeout_secs)
            .field("retries", &self.retries)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MinecraftConfig {
    pub base_dir: PathBuf,
    /// Log file path, relative to `base_dir`.
    pub log_file: PathBuf,
    /// World directory name, relative to `base_dir`.
    pub world_dir: String,
    /// Loaded and reported at startup. The daily job itself runs at a fixed time of day.
    #[serde(default)]
    pub daily_backup: Option<String>,
    #[serde(default = "std::env::temp_dir")]
    pub archive_dir: PathBuf,
    #[serde(default = "default_archive_timeout")]
    pub archive_timeout_secs: u64,
}

impl MinecraftConfig {
    pub fn log_path(&self) -> PathBuf {
        self.base_dir.join(&self.log_file)
    }

    pub fn world_path(&self) -> PathBuf {
        self.base_dir.join(&self.world_dir)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_bind")]
    pub bind: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: default_http_bind(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

fn default_base_url() -> String {
    "https://api.telegram.org/bot".to_string()
}

fn default_poll_timeout() -> u64 {
    30
}

fn default_rcon_timeout() -> u64 {
    5
}

fn default_rcon_retries() -> u32 {
    2
}

fn default_archive_timeout() -> u64 {
    30 * 60
}

fn default_http_bind() -> String {
    "127.0.0.1:8090".to_string()
}

impl AgentConfig {
    pub fn from_file(path: &str) -> Result<Self, String> {
        let content =
            std::fs::read_to_string(path).map_err(|e| format!("Failed to read config: {}", e))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, String> {
        toml::from_str(content).map_err(|e| format!("Failed to parse config: {}", e))
    }

    pub fn from_env() -> Result<Self, String> {
        Ok(Self {
            telegram: TelegramConfig {
                token: std::env::var("TELEGRAM_TOKEN")
                    .map_err(|_| "TELEGRAM_TOKEN not set".to_string())?,
                base_url: std::env::var("TELEGRAM_BASE_URL").unwrap_or_else(|_| default_base_url()),
                chat_id: required_env("TELEGRAM_CHAT_ID")?
                    .parse()
                    .map_err(|e| format!("Invalid TELEGRAM_CHAT_ID: {}", e))?,
                poll_timeout_secs: default_poll_timeout(),
            },
            rcon: RconConfig {
                host: std::env::var("RCON_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
                port: std::env::var("RCON_PORT")
                    .unwrap_or_else(|_| "25575".to_string())
                    .parse()
                    .map_err(|e| format!("Invalid RCON_PORT: {}", e))?,
                password: required_env("RCON_PASSWORD")?,
                connect_timeout_secs: default_rcon_timeout(),
                read_timeout_secs: default_rcon_timeout(),
                retries: default_rcon_retries(),
            },
            minecraft: MinecraftConfig {
                base_dir: PathBuf::from(required_env("MC_BASE_DIR")?),
                log_file: PathBuf::from(
                    std::env::var("MC_LOG_FILE").unwrap_or_else(|_| "logs/latest.log".to_string()),
                ),
                world_dir: std::env::var("MC_WORLD_DIR").unwrap_or_else(|_| "world".to_string()),
                daily_backup: std::env::var("MC_DAILY_BACKUP").ok(),
                archive_dir: std::env::temp_dir(),
                archive_timeout_secs: default_archive_timeout(),
            },
            http: HttpConfig::default(),
            logging: LoggingConfig {
                level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
                format: "json".to_string(),
            },
        })
    }
}

fn required_env(name: &str) -> Result<String, String> {
    std::env::var(name).map_err(|_| format!("{} not set", name))
}
