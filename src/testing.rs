use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use crate::backup::{ArchiveOutput, Archiver};
use crate::gateway::{Gateway, MessageRef, TransferTimeouts};
use crate::rcon::{ConsoleConnector, ConsoleFailure, ConsoleResponse, ConsoleTransport, PACKET_RESPONSE};
use crate::{AgentError, AgentResult};

#[derive(Default)]
struct Script {
    outcomes: Mutex<VecDeque<Result<ConsoleResponse, ConsoleFailure>>>,
    commands: Mutex<Vec<String>>,
    builds: AtomicUsize,
    connects: AtomicUsize,
}

/// Connector whose transports replay a shared queue of outcomes.
/// An exhausted queue answers with an empty response.
#[derive(Default)]
pub struct ScriptedConnector {
    script: Arc<Script>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_response(&self, body: &str) {
        self.script.outcomes.lock().push_back(Ok(ConsoleResponse {
            body: body.to_string(),
            kind: PACKET_RESPONSE,
        }));
    }

    pub fn push_failure(&self, failure: ConsoleFailure) {
        self.script.outcomes.lock().push_back(Err(failure));
    }

    pub fn commands(&self) -> Vec<String> {
        self.script.commands.lock().clone()
    }

    pub fn builds(&self) -> usize {
        self.script.builds.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> usize {
        self.script.connects.load(Ordering::SeqCst)
    }
}

impl ConsoleConnector for ScriptedConnector {
    fn build(&self) -> Box<dyn ConsoleTransport> {
        self.script.builds.fetch_add(1, Ordering::SeqCst);
        Box::new(ScriptedTransport {
            script: self.script.clone(),
        })
    }
}

struct ScriptedTransport {
    script: Arc<Script>,
}

#[async_trait]
impl ConsoleTransport for ScriptedTransport {
    async fn connect(&mut self, _timeout: Duration) -> Result<(), ConsoleFailure> {
        self.script.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn exec(
        &mut self,
        command: &str,
        _timeout: Duration,
    ) -> Result<ConsoleResponse, ConsoleFailure> {
        self.script.commands.lock().push(command.to_string());
        self.script
            .outcomes
            .lock()
            .pop_front()
            .unwrap_or_else(|| {
                Ok(ConsoleResponse {
                    body: String::new(),
                    kind: PACKET_RESPONSE,
                })
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCall {
    Send {
        chat_id: i64,
        text: String,
        reply_to: Option<i64>,
    },
    Edit {
        message_id: i64,
        text: String,
    },
    Delete {
        message_id: i64,
    },
    Document {
        chat_id: i64,
        path: PathBuf,
        caption: String,
        file_existed: bool,
    },
    SetCommands(Vec<(String, String)>),
}

/// Gateway that records every call. Failures can be switched on per kind.
#[derive(Default)]
pub struct RecordingGateway {
    calls: Mutex<Vec<GatewayCall>>,
    next_id: AtomicI64,
    send_gate: Mutex<Option<(Arc<Notify>, Arc<Notify>)>>,
    pub fail_sends: AtomicBool,
    pub fail_uploads: AtomicBool,
}

impl RecordingGateway {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1000),
            ..Default::default()
        }
    }

    /// The next `send_message` signals `entered`, then waits for `release`.
    pub fn gate_next_send(&self, entered: Arc<Notify>, release: Arc<Notify>) {
        *self.send_gate.lock() = Some((entered, release));
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        self.calls.lock().clone()
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                GatewayCall::Send { text, .. } => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn edits(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                GatewayCall::Edit { text, .. } => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn uploads(&self) -> Vec<GatewayCall> {
        self.calls()
            .into_iter()
            .filter(|call| matches!(call, GatewayCall::Document { .. }))
            .collect()
    }
}

#[async_trait]
impl Gateway for RecordingGateway {
    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        reply_to: Option<i64>,
    ) -> AgentResult<MessageRef> {
        let gate = self.send_gate.lock().take();
        if let Some((entered, release)) = gate {
            entered.notify_one();
            release.notified().await;
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(AgentError::GatewayError("send refused".to_string()));
        }
        self.calls.lock().push(GatewayCall::Send {
            chat_id,
            text: text.to_string(),
            reply_to,
        });
        Ok(MessageRef {
            chat_id,
            message_id: self.next_id.fetch_add(1, Ordering::SeqCst),
        })
    }

    async fn edit_message(&self, message: &MessageRef, text: &str) -> AgentResult<()> {
        self.calls.lock().push(GatewayCall::Edit {
            message_id: message.message_id,
            text: text.to_string(),
        });
        Ok(())
    }

    async fn delete_message(&self, message: &MessageRef) -> AgentResult<()> {
        self.calls.lock().push(GatewayCall::Delete {
            message_id: message.message_id,
        });
        Ok(())
    }

    async fn send_document(
        &self,
        chat_id: i64,
        path: &Path,
        caption: &str,
        _reply_to: Option<i64>,
        _timeouts: TransferTimeouts,
    ) -> AgentResult<MessageRef> {
        self.calls.lock().push(GatewayCall::Document {
            chat_id,
            path: path.to_path_buf(),
            caption: caption.to_string(),
            file_existed: path.exists(),
        });
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(AgentError::UploadError("connection reset".to_string()));
        }
        Ok(MessageRef {
            chat_id,
            message_id: self.next_id.fetch_add(1, Ordering::SeqCst),
        })
    }

    async fn set_commands(&self, commands: &[(String, String)]) -> AgentResult<()> {
        self.calls
            .lock()
            .push(GatewayCall::SetCommands(commands.to_vec()));
        Ok(())
    }
}

/// Archiver that writes a placeholder file and reports a canned exit status.
pub struct FakeArchiver {
    code: i32,
    stdout: String,
    stderr: String,
    write_file: bool,
    gate: Option<(Arc<Notify>, Arc<Notify>)>,
    calls: Mutex<Vec<(PathBuf, PathBuf)>>,
}

impl FakeArchiver {
    pub fn succeeding() -> Self {
        Self {
            code: 0,
            stdout: String::new(),
            stderr: String::new(),
            write_file: true,
            gate: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(code: i32, stderr: &str) -> Self {
        Self {
            code,
            stderr: stderr.to_string(),
            ..Self::succeeding()
        }
    }

    /// Signal `entered` once archiving starts, then wait for `release`.
    pub fn gated(entered: Arc<Notify>, release: Arc<Notify>) -> Self {
        Self {
            gate: Some((entered, release)),
            ..Self::succeeding()
        }
    }

    pub fn calls(&self) -> Vec<(PathBuf, PathBuf)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Archiver for FakeArchiver {
    async fn archive(&self, archive: &Path, source: &Path) -> AgentResult<ArchiveOutput> {
        self.calls
            .lock()
            .push((archive.to_path_buf(), source.to_path_buf()));
        if self.write_file {
            tokio::fs::write(archive, b"partial archive bytes").await?;
        }
        if let Some((entered, release)) = &self.gate {
            entered.notify_one();
            release.notified().await;
        }
        Ok(ArchiveOutput {
            code: Some(self.code),
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone(),
        })
    }
}
