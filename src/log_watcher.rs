use lazy_static::lazy_static;
use regex::Regex;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::gateway::Gateway;
use crate::{AgentError, AgentResult};

lazy_static! {
    static ref CHAT_PATTERN: Regex = Regex::new(
        r"\[Server thread/INFO\] \[net\.minecraft\.server\.MinecraftServer/\]:\s+(?:\[Not Secure\]\s+)?<([^>]+)>\s+(.+)"
    )
    .expect("chat pattern is valid");
    static ref EVENT_PATTERN: Regex =
        Regex::new(r"\[Server thread/INFO\] \[net\.minecraft\.server\.MinecraftServer/\]:\s+(.+)")
            .expect("event pattern is valid");
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvent {
    Chat { speaker: String, message: String },
    Event { text: String },
}

impl LogEvent {
    pub fn render(&self) -> String {
        match self {
            LogEvent::Chat { speaker, message } => format!("{}: {}", speaker, message),
            LogEvent::Event { text } => text.clone(),
        }
    }
}

/// Chat wins over event; anything else is dropped.
pub fn classify_line(line: &str) -> Option<LogEvent> {
    if let Some(caps) = CHAT_PATTERN.captures(line) {
        return Some(LogEvent::Chat {
            speaker: caps[1].to_string(),
            message: caps[2].trim_end().to_string(),
        });
    }

    let caps = EVENT_PATTERN.captures(line)?;
    let text = caps[1].trim_end();
    if text.starts_with('[') {
        return None;
    }
    Some(LogEvent::Event {
        text: text.to_string(),
    })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub lines_read: usize,
    pub forwarded: usize,
}

/// Relays server chat and events from the server log.
///
/// The cursor only ever advances past newline-terminated lines, so a line
/// that is still being written is picked up whole on a later tick. A file
/// that shrinks is assumed to have been rotated and is re-read from the
/// start.
pub struct LogWatcher {
    path: PathBuf,
    chat_id: i64,
    gateway: Arc<dyn Gateway>,
    cursor: Mutex<Option<u64>>,
}

impl LogWatcher {
    pub fn new(path: PathBuf, chat_id: i64, gateway: Arc<dyn Gateway>) -> Self {
        Self {
            path,
            chat_id,
            gateway,
            cursor: Mutex::new(None),
        }
    }

    /// Current cursor, or `None` while a tick holds it.
    pub fn try_cursor(&self) -> Option<Option<u64>> {
        self.cursor.try_lock().ok().map(|cursor| *cursor)
    }

    #[cfg(test)]
    pub async fn cursor(&self) -> Option<u64> {
        *self.cursor.lock().await
    }

    /// Scheduled entry point. Never fails.
    pub async fn run_tick(&self) {
        match self.tick().await {
            Ok(report) if report.lines_read > 0 => debug!(
                "log tick read {} lines, forwarded {}",
                report.lines_read, report.forwarded
            ),
            Ok(_) => {}
            Err(e) => error!("Log watcher tick failed: {}", e),
        }
    }

    /// Read newly completed lines and forward the classified ones.
    /// Holds the cursor lock for the whole tick.
    pub async fn tick(&self) -> AgentResult<TickReport> {
        let mut cursor = self.cursor.lock().await;
        let lines = match self.read_new_lines(&mut cursor).await? {
            Some(lines) => lines,
            None => return Ok(TickReport::default()),
        };

        let mut report = TickReport {
            lines_read: lines.len(),
            forwarded: 0,
        };
        for line in &lines {
            let Some(event) = classify_line(line) else {
                continue;
            };
            match &event {
                LogEvent::Chat { speaker, message } => {
                    info!("server chat: [{}] {}", speaker, message)
                }
                LogEvent::Event { text } => info!("server event: {}", text),
            }
            match self
                .gateway
                .send_message(self.chat_id, &event.render(), None)
                .await
            {
                Ok(_) => report.forwarded += 1,
                Err(e) => warn!("Failed to forward log line: {}", e),
            }
        }

        Ok(report)
    }

    /// `Ok(None)` means nothing to forward this tick.
    async fn read_new_lines(&self, cursor: &mut Option<u64>) -> AgentResult<Option<Vec<String>>> {
        let mut file = match File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("log file does not exist: {}", self.path.display());
                return Ok(None);
            }
            Err(e) => return Err(file_access(&self.path, e)),
        };

        let end = file
            .metadata()
            .await
            .map_err(|e| file_access(&self.path, e))?
            .len();

        let start = match *cursor {
            None => {
                *cursor = Some(end);
                info!("set current log tell to file end: {}", end);
                return Ok(None);
            }
            Some(pos) if end < pos => {
                warn!("log file shrank from {} to {} bytes, reading from the beginning", pos, end);
                0
            }
            Some(pos) => pos,
        };

        file.seek(SeekFrom::Start(start))
            .await
            .map_err(|e| file_access(&self.path, e))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .await
            .map_err(|e| file_access(&self.path, e))?;

        let consumed = buf
            .iter()
            .rposition(|&b| b == b'\n')
            .map(|idx| idx + 1)
            .unwrap_or(0);
        let next = start + consumed as u64;
        if Some(next) != *cursor {
            debug!("set current log tell [{:?}] to: [{}]", *cursor, next);
        }
        *cursor = Some(next);

        let lines = String::from_utf8_lossy(&buf[..consumed])
            .lines()
            .map(str::to_string)
            .collect();
        Ok(Some(lines))
    }
}

fn file_access(path: &std::path::Path, err: std::io::Error) -> AgentError {
    AgentError::FileAccessError(format!("{}: {}", path.display(), err))
}
