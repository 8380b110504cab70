use chrono::NaiveTime;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

mod backup;
mod commands;
mod config;
mod errors;
mod gateway;
mod http_server;
mod log_watcher;
mod rcon;
mod scheduler;
mod telegram;
#[cfg(test)]
mod testing;

pub use backup::{BackupOrchestrator, TarArchiver};
pub use commands::{builtin_commands, Dispatcher};
pub use config::AgentConfig;
pub use errors::{AgentError, AgentResult};
pub use gateway::Gateway;
pub use log_watcher::LogWatcher;
pub use rcon::ConsoleSession;
pub use scheduler::Scheduler;
pub use telegram::TelegramGateway;

/// Grace period before the command menu is advertised and the log relay starts.
const STARTUP_GRACE: Duration = Duration::from_secs(10);
const LOG_POLL_INTERVAL: Duration = Duration::from_secs(3);
/// Local (hour, minute) of the daily backup.
const DAILY_BACKUP_AT: (u32, u32) = (2, 30);

/// Relay Agent - Main application state
pub struct RelayAgent {
    pub config: Arc<AgentConfig>,
    pub telegram: Arc<TelegramGateway>,
    pub dispatcher: Arc<Dispatcher>,
    pub watcher: Arc<LogWatcher>,
    pub backup: Arc<BackupOrchestrator>,
    pub scheduler: Scheduler,
}

impl RelayAgent {
    pub fn new(config: AgentConfig) -> AgentResult<Self> {
        info!("Initializing Relay Agent");

        let config = Arc::new(config);
        let telegram = Arc::new(TelegramGateway::new(&config.telegram)?);
        let gateway: Arc<dyn Gateway> = telegram.clone();
        let session = Arc::new(ConsoleSession::from_config(&config.rcon));

        let backup = Arc::new(BackupOrchestrator::new(
            session.clone(),
            gateway.clone(),
            Arc::new(TarArchiver::new(Duration::from_secs(
                config.minecraft.archive_timeout_secs,
            ))),
            &config.minecraft,
            config.telegram.chat_id,
        ));

        let registry = builtin_commands(session.clone(), gateway.clone(), backup.clone()).build()?;
        info!("Registered {} commands", registry.len());
        let dispatcher = Arc::new(Dispatcher::new(Arc::new(registry), gateway.clone()));

        let watcher = Arc::new(LogWatcher::new(
            config.minecraft.log_path(),
            config.telegram.chat_id,
            gateway,
        ));

        Ok(Self {
            config,
            telegram,
            dispatcher,
            watcher,
            backup,
            scheduler: Scheduler::new(),
        })
    }

    pub async fn run(&self) -> AgentResult<()> {
        info!("Starting Relay Agent");

        self.schedule_jobs();

        let telegram = self.telegram.clone();
        let dispatcher = self.dispatcher.clone();
        let updates_task = tokio::spawn(async move {
            telegram.run_update_loop(dispatcher).await;
        });

        let state = http_server::StatusState {
            watcher: self.watcher.clone(),
            backup: self.backup.clone(),
            registry: self.dispatcher.registry().clone(),
        };
        let bind = self.config.http.bind.clone();
        let http_task = tokio::spawn(async move {
            if let Err(e) = http_server::serve(&bind, state).await {
                error!("HTTP server error: {}", e);
            }
        });

        tokio::select! {
            _ = updates_task => warn!("Update loop exited"),
            _ = http_task => warn!("HTTP server exited"),
            _ = tokio::signal::ctrl_c() => info!("Shutdown requested"),
        }

        self.scheduler.shutdown();
        Ok(())
    }

    fn schedule_jobs(&self) {
        let dispatcher = self.dispatcher.clone();
        self.scheduler.run_once("set_commands", STARTUP_GRACE, move || async move {
            dispatcher.advertise_menu().await;
        });

        let watcher = self.watcher.clone();
        self.scheduler
            .run_repeating("log_relay", STARTUP_GRACE, LOG_POLL_INTERVAL, move || {
                let watcher = watcher.clone();
                async move { watcher.run_tick().await }
            });

        // The configured value is informational; the trigger time is fixed.
        let Some(backup_time) = daily_backup_time() else {
            error!(
                "Invalid daily backup time {:?}; daily backup disabled",
                DAILY_BACKUP_AT
            );
            return;
        };
        if let Some(configured) = &self.config.minecraft.daily_backup {
            info!(
                "daily_backup configured as {:?}; scheduled backup runs at {}",
                configured, backup_time
            );
        }
        let backup = self.backup.clone();
        self.scheduler.run_daily("backup_job", backup_time, move || {
            let backup = backup.clone();
            async move { backup.run_job().await }
        });
    }
}

fn daily_backup_time() -> Option<NaiveTime> {
    let (hour, minute) = DAILY_BACKUP_AT;
    NaiveTime::from_hms_opt(hour, minute, 0)
}

fn load_config() -> AgentResult<AgentConfig> {
    let mut config_path: Option<String> = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            config_path = args.next();
        }
    }

    let config_path = config_path
        .or_else(|| std::env::var("CONFIG_FILE_NAME").ok())
        .unwrap_or_else(|| "./config.toml".to_string());

    AgentConfig::from_file(&config_path)
        .or_else(|_| AgentConfig::from_file("/etc/minecraft-relay-agent/config.toml"))
        .or_else(|_| AgentConfig::from_env())
        .map_err(AgentError::ConfigError)
}

#[tokio::main]
async fn main() -> AgentResult<()> {
    // Load config first so logging level/format can be applied.
    let config = load_config()?;

    let filter = format!("minecraft_relay_agent={},tower_http=info", config.logging.level);
    if config.logging.format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!("Relay Agent starting");
    info!("Configuration loaded: {:?}", config);

    let agent = RelayAgent::new(config)?;
    agent.run().await?;

    Ok(())
}
