use async_trait::async_trait;
use chrono::{Local, NaiveDateTime};
use futures::FutureExt;
use sha2::{Digest, Sha256};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::MinecraftConfig;
use crate::gateway::{Gateway, MessageRef, TransferTimeouts};
use crate::rcon::ConsoleSession;
use crate::{AgentError, AgentResult};

/// Captured result of one archiver run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveOutput {
    /// `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ArchiveOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

#[async_trait]
pub trait Archiver: Send + Sync {
    /// Compress `source` into `archive`.
    async fn archive(&self, archive: &Path, source: &Path) -> AgentResult<ArchiveOutput>;
}

/// Runs `tar -czf <archive> <source>`.
pub struct TarArchiver {
    timeout: Duration,
}

impl TarArchiver {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Archiver for TarArchiver {
    async fn archive(&self, archive: &Path, source: &Path) -> AgentResult<ArchiveOutput> {
        info!(
            "Archiving {} into {}",
            source.display(),
            archive.display()
        );

        let child = Command::new("tar")
            .arg("-czf")
            .arg(archive)
            .arg(source)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AgentError::SubprocessError {
                code: -1,
                stderr: format!("Failed to run tar: {}", e),
            })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| AgentError::SubprocessError {
                code: -1,
                stderr: format!("tar timed out after {}s", self.timeout.as_secs()),
            })??;

        Ok(ArchiveOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupOutcome {
    Uploaded { archive: PathBuf, checksum: String },
    ArchiveFailed { code: i32, stderr: String },
    Failed(String),
    /// Another backup held the guard.
    Skipped,
}

/// `<world_dir>.<YYYY-MM-DD_HH-MM-SS>.tar.gz`
pub fn archive_file_name(world_dir: &str, at: &NaiveDateTime) -> String {
    format!("{}.{}.tar.gz", world_dir, at.format("%Y-%m-%d_%H-%M-%S"))
}

pub struct BackupOrchestrator {
    session: Arc<ConsoleSession>,
    gateway: Arc<dyn Gateway>,
    archiver: Arc<dyn Archiver>,
    world_dir: String,
    world_path: PathBuf,
    archive_dir: PathBuf,
    report_chat: i64,
    running: Mutex<()>,
}

impl BackupOrchestrator {
    pub fn new(
        session: Arc<ConsoleSession>,
        gateway: Arc<dyn Gateway>,
        archiver: Arc<dyn Archiver>,
        config: &MinecraftConfig,
        report_chat: i64,
    ) -> Self {
        Self {
            session,
            gateway,
            archiver,
            world_dir: config.world_dir.clone(),
            world_path: config.world_path(),
            archive_dir: config.archive_dir.clone(),
            report_chat,
            running: Mutex::new(()),
        }
    }

    pub fn in_progress(&self) -> bool {
        self.running.try_lock().is_err()
    }

    /// Scheduled entry point: post a status message, back up, then remove the status message.
    pub async fn run_job(&self) {
        info!("backup_job started");
        let status = match self
            .gateway
            .send_message(self.report_chat, "Backing up...", None)
            .await
        {
            Ok(status) => status,
            Err(e) => {
                error!("Failed to post backup status message: {}", e);
                return;
            }
        };

        let outcome = self.run(&status).await;
        info!("backup_job finished: {:?}", outcome);

        if let Err(e) = self.gateway.delete_message(&status).await {
            warn!("Failed to delete backup status message: {}", e);
        }
    }

    /// Save, archive, upload, and always remove the local archive.
    pub async fn run(&self, status: &MessageRef) -> BackupOutcome {
        let _guard = match self.running.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                warn!("Backup requested while another backup is running");
                self.report(status, "Backup already in progress.").await;
                return BackupOutcome::Skipped;
            }
        };

        let started = Local::now().naive_local();
        let archive = self
            .archive_dir
            .join(archive_file_name(&self.world_dir, &started));

        let result = AssertUnwindSafe(self.pipeline(status, &archive, &started))
            .catch_unwind()
            .await;

        remove_archive(&archive).await;

        match result {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => {
                error!("backup failed: {}", err);
                self.report(status, &format!("Backup failed: {}", err)).await;
                BackupOutcome::Failed(err.to_string())
            }
            Err(_) => {
                error!("backup failed: pipeline panicked");
                self.report(status, "Backup failed: internal error").await;
                BackupOutcome::Failed("pipeline panicked".to_string())
            }
        }
    }

    async fn pipeline(
        &self,
        status: &MessageRef,
        archive: &Path,
        started: &NaiveDateTime,
    ) -> AgentResult<BackupOutcome> {
        match self.session.send("save-all", &[], None).await {
            Ok(response) => info!("backup response: {}", response),
            Err(e) => warn!("save-all failed, archiving files as they are: {}", e),
        }

        self.gateway
            .edit_message(status, "World saved. Backing up...")
            .await?;

        let output = match self.archiver.archive(archive, &self.world_path).await {
            Ok(output) => output,
            Err(AgentError::SubprocessError { code, stderr }) => ArchiveOutput {
                code: Some(code),
                stdout: String::new(),
                stderr,
            },
            Err(e) => return Err(e),
        };

        if !output.success() {
            let code = output.code.unwrap_or(-1);
            let stderr = output.stderr.trim().to_string();
            error!("backup failed: [{}] {}", code, stderr);
            remove_archive(archive).await;
            self.gateway
                .edit_message(status, &format!("Backup failed: [{}] {}", code, stderr))
                .await?;
            return Ok(BackupOutcome::ArchiveFailed { code, stderr });
        }

        let stdout = output.stdout.trim();
        info!("backup succeeded: {}", stdout);
        let progress = if stdout.is_empty() {
            "Backup succeeded. Uploading...".to_string()
        } else {
            format!("Backup succeeded {}. Uploading...", stdout)
        };
        self.gateway.edit_message(status, &progress).await?;

        let checksum = sha256_file(archive).await?;
        info!("backup archive {} sha256 {}", archive.display(), checksum);

        let caption = format!(
            "Backup of [{}] @ {}",
            self.world_dir,
            started.format("%Y-%m-%d %H:%M:%S")
        );
        self.gateway
            .send_document(
                status.chat_id,
                archive,
                &caption,
                Some(status.message_id),
                TransferTimeouts::ARCHIVE_UPLOAD,
            )
            .await
            .map_err(|e| match e {
                AgentError::UploadError(_) => e,
                other => AgentError::UploadError(other.to_string()),
            })?;
        info!("backup uploaded: {}", archive.display());

        self.gateway.edit_message(status, "Backup finished.").await?;

        Ok(BackupOutcome::Uploaded {
            archive: archive.to_path_buf(),
            checksum,
        })
    }

    async fn report(&self, status: &MessageRef, text: &str) {
        if let Err(e) = self.gateway.edit_message(status, text).await {
            error!("Failed to update backup status: {}", e);
        }
    }
}

async fn sha256_file(path: &Path) -> AgentResult<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

async fn remove_archive(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => info!("backup removed: {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove backup {}: {}", path.display(), e),
    }
}
