use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;

use crate::AgentResult;

/// A message owned by the gateway that can later be edited or deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageRef {
    pub chat_id: i64,
    pub message_id: i64,
}

const MIN_UPLOAD_BYTES_PER_SEC: u64 = 128 * 1024;

/// Transfer budgets for large uploads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferTimeouts {
    pub connect: Duration,
    pub read: Duration,
    pub write: Duration,
}

impl TransferTimeouts {
    /// Budgets for backup archives, well above normal API calls.
    pub const ARCHIVE_UPLOAD: TransferTimeouts = TransferTimeouts {
        connect: Duration::from_secs(15),
        read: Duration::from_secs(30),
        write: Duration::from_secs(300),
    };

    /// Whole-request budget for a body of `bytes`: the fixed budgets plus
    /// the time to send the body at the slowest tolerated rate.
    pub fn overall_for(&self, bytes: u64) -> Duration {
        self.connect
            + self.read
            + self.write
            + Duration::from_secs(bytes / MIN_UPLOAD_BYTES_PER_SEC)
    }
}

/// A slash command received from a chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingCommand {
    pub chat_id: i64,
    pub message_id: i64,
    pub sender: String,
    pub keyword: String,
    pub args: Vec<String>,
    /// Everything after the keyword, untouched.
    pub raw_args: String,
}

impl IncomingCommand {
    /// Parse `/keyword[@bot] args...`. Returns `None` for plain text and for
    /// commands that mention a bot other than `bot_username`.
    pub fn parse(
        chat_id: i64,
        message_id: i64,
        sender: &str,
        text: &str,
        bot_username: Option<&str>,
    ) -> Option<Self> {
        let text = text.trim_start();
        let rest = text.strip_prefix('/')?;
        let (head, raw_args) = match rest.find(char::is_whitespace) {
            Some(idx) => (&rest[..idx], rest[idx..].trim()),
            None => (rest, ""),
        };
        let (keyword, mention) = match head.split_once('@') {
            Some((keyword, mention)) => (keyword, Some(mention)),
            None => (head, None),
        };
        if keyword.is_empty() {
            return None;
        }
        if let Some(mention) = mention {
            match bot_username {
                Some(own) if own.eq_ignore_ascii_case(mention) => {}
                _ => return None,
            }
        }

        Some(Self {
            chat_id,
            message_id,
            sender: sender.to_string(),
            keyword: keyword.to_lowercase(),
            args: raw_args.split_whitespace().map(str::to_string).collect(),
            raw_args: raw_args.to_string(),
        })
    }
}

#[async_trait]
pub trait Gateway: Send + Sync {
    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        reply_to: Option<i64>,
    ) -> AgentResult<MessageRef>;

    async fn edit_message(&self, message: &MessageRef, text: &str) -> AgentResult<()>;

    async fn delete_message(&self, message: &MessageRef) -> AgentResult<()>;

    async fn send_document(
        &self,
        chat_id: i64,
        path: &Path,
        caption: &str,
        reply_to: Option<i64>,
        timeouts: TransferTimeouts,
    ) -> AgentResult<MessageRef>;

    /// Advertise the command menu as (name, description) pairs.
    async fn set_commands(&self, commands: &[(String, String)]) -> AgentResult<()>;
}
