use async_trait::async_trait;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, info, info_span, Instrument};
use uuid::Uuid;

use crate::backup::BackupOrchestrator;
use crate::gateway::{Gateway, IncomingCommand};
use crate::rcon::ConsoleSession;
use crate::{AgentError, AgentResult};

#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, command: &IncomingCommand) -> AgentResult<()>;
}

pub struct CommandDescriptor {
    pub keyword: String,
    pub description: String,
    handler: Arc<dyn CommandHandler>,
}

#[derive(Default)]
pub struct CommandRegistryBuilder {
    entries: Vec<CommandDescriptor>,
}

impl CommandRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn command(
        mut self,
        keyword: &str,
        description: &str,
        handler: impl CommandHandler + 'static,
    ) -> Self {
        self.entries.push(CommandDescriptor {
            keyword: keyword.to_string(),
            description: description.to_string(),
            handler: Arc::new(handler),
        });
        self
    }

    /// Fails on the first repeated keyword.
    pub fn build(self) -> AgentResult<CommandRegistry> {
        let mut index = HashMap::with_capacity(self.entries.len());
        for (position, entry) in self.entries.iter().enumerate() {
            if index.insert(entry.keyword.clone(), position).is_some() {
                return Err(AgentError::DuplicateCommand(entry.keyword.clone()));
            }
            info!("[{}][{}] registered", entry.keyword, entry.description);
        }

        Ok(CommandRegistry {
            commands: self.entries,
            index,
        })
    }
}

/// Immutable keyword table, in registration order.
pub struct CommandRegistry {
    commands: Vec<CommandDescriptor>,
    index: HashMap<String, usize>,
}

impl CommandRegistry {
    pub fn get(&self, keyword: &str) -> Option<&CommandDescriptor> {
        self.index.get(keyword).map(|&position| &self.commands[position])
    }

    pub fn menu(&self) -> Vec<(String, String)> {
        self.commands
            .iter()
            .map(|c| (c.keyword.clone(), c.description.clone()))
            .collect()
    }

    pub fn keywords(&self) -> Vec<&str> {
        self.commands.iter().map(|c| c.keyword.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Completed,
    Failed { notified: bool },
    Unknown,
}

/// Runs handlers and keeps their failures from going anywhere but the log
/// and an error reply.
pub struct Dispatcher {
    registry: Arc<CommandRegistry>,
    gateway: Arc<dyn Gateway>,
}

impl Dispatcher {
    pub fn new(registry: Arc<CommandRegistry>, gateway: Arc<dyn Gateway>) -> Self {
        Self { registry, gateway }
    }

    pub fn registry(&self) -> &Arc<CommandRegistry> {
        &self.registry
    }

    pub async fn advertise_menu(&self) {
        let commands = self.registry.menu();
        match self.gateway.set_commands(&commands).await {
            Ok(()) => info!("set command menu; supported: {:?}", commands),
            Err(e) => error!("Failed to set command menu: {}", e),
        }
    }

    pub async fn dispatch(&self, command: IncomingCommand) -> DispatchOutcome {
        let Some(descriptor) = self.registry.get(&command.keyword) else {
            debug!("Ignoring unknown command /{}", command.keyword);
            return DispatchOutcome::Unknown;
        };

        let span = info_span!(
            "command",
            keyword = %command.keyword,
            chat_id = command.chat_id,
            message_id = command.message_id,
            request_id = %Uuid::new_v4(),
        );
        let handler = descriptor.handler.clone();
        self.run_handler(handler, &command).instrument(span).await
    }

    async fn run_handler(
        &self,
        handler: Arc<dyn CommandHandler>,
        command: &IncomingCommand,
    ) -> DispatchOutcome {
        let result = AssertUnwindSafe(handler.handle(command))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                Err(AgentError::InternalError(
                    "command handler panicked".to_string(),
                ))
            });

        let err = match result {
            Ok(()) => {
                info!(
                    "[{}] command executed in chat [{}] message [{}]",
                    command.keyword, command.chat_id, command.message_id
                );
                return DispatchOutcome::Completed;
            }
            Err(err) => err,
        };

        error!(
            "[{}] command failed in chat [{}] message [{}]: {:?}",
            command.keyword, command.chat_id, command.message_id, err
        );
        let notified = match self
            .gateway
            .send_message(
                command.chat_id,
                &format!("Error: {}", err),
                Some(command.message_id),
            )
            .await
        {
            Ok(_) => true,
            Err(notify_err) => {
                error!(
                    "[{}] failed to send error message; chat [{}] message [{}]: {}",
                    command.keyword, command.chat_id, command.message_id, notify_err
                );
                false
            }
        };
        DispatchOutcome::Failed { notified }
    }
}

async fn reply(gateway: &dyn Gateway, command: &IncomingCommand, text: &str) -> AgentResult<()> {
    gateway
        .send_message(command.chat_id, text, Some(command.message_id))
        .await?;
    Ok(())
}

fn non_empty(text: String, fallback: &str) -> String {
    if text.is_empty() {
        fallback.to_string()
    } else {
        text
    }
}

pub struct Greeting {
    gateway: Arc<dyn Gateway>,
}

#[async_trait]
impl CommandHandler for Greeting {
    async fn handle(&self, command: &IncomingCommand) -> AgentResult<()> {
        reply(
            self.gateway.as_ref(),
            command,
            &format!("Hi {}!", command.sender),
        )
        .await
    }
}

/// Forwards a console command and replies with its response.
pub struct ConsoleCommand {
    session: Arc<ConsoleSession>,
    gateway: Arc<dyn Gateway>,
    console_keyword: &'static str,
    forward_args: bool,
}

#[async_trait]
impl CommandHandler for ConsoleCommand {
    async fn handle(&self, command: &IncomingCommand) -> AgentResult<()> {
        let args: Vec<&str> = if self.forward_args {
            command.args.iter().map(String::as_str).collect()
        } else {
            Vec::new()
        };
        let response = self
            .session
            .send(self.console_keyword, &args, None)
            .await?;
        reply(
            self.gateway.as_ref(),
            command,
            &non_empty(response, "(no response)"),
        )
        .await
    }
}

/// Broadcasts a chat message to players, attributed to the sender.
pub struct SayCommand {
    session: Arc<ConsoleSession>,
    gateway: Arc<dyn Gateway>,
}

#[async_trait]
impl CommandHandler for SayCommand {
    async fn handle(&self, command: &IncomingCommand) -> AgentResult<()> {
        if command.raw_args.is_empty() {
            return Err(AgentError::InvalidRequest(
                "usage: /say <message>".to_string(),
            ));
        }
        let speaker = format!("[{}]:", command.sender);
        let response = self
            .session
            .send("say", &[speaker.as_str(), command.raw_args.as_str()], None)
            .await?;
        reply(
            self.gateway.as_ref(),
            command,
            &non_empty(response, "sent to server"),
        )
        .await
    }
}

/// Runs a backup against a fresh status reply.
pub struct SaveCommand {
    gateway: Arc<dyn Gateway>,
    backup: Arc<BackupOrchestrator>,
}

#[async_trait]
impl CommandHandler for SaveCommand {
    async fn handle(&self, command: &IncomingCommand) -> AgentResult<()> {
        let status = self
            .gateway
            .send_message(command.chat_id, "Saving...", Some(command.message_id))
            .await?;
        let outcome = self.backup.run(&status).await;
        info!("save finished: {:?}", outcome);
        Ok(())
    }
}

/// The stock command table.
pub fn builtin_commands(
    session: Arc<ConsoleSession>,
    gateway: Arc<dyn Gateway>,
    backup: Arc<BackupOrchestrator>,
) -> CommandRegistryBuilder {
    let console = |console_keyword: &'static str, forward_args: bool| ConsoleCommand {
        session: session.clone(),
        gateway: gateway.clone(),
        console_keyword,
        forward_args,
    };

    CommandRegistryBuilder::new()
        .command(
            "start",
            "Greets the user",
            Greeting {
                gateway: gateway.clone(),
            },
        )
        .command("list", "Lists players on the server", console("list", false))
        .command("op", "Grants operator status to a player", console("op", true))
        .command(
            "deop",
            "Revokes operator status from a player",
            console("deop", true),
        )
        .command(
            "kill",
            "Kills entities (players, mobs, items, etc.)",
            console("kill", true),
        )
        .command("kick", "Kicks a player off a server", console("kick", true))
        .command("seed", "Displays the world seed", console("seed", false))
        .command(
            "say",
            "Displays a message to multiple players",
            SayCommand {
                session: session.clone(),
                gateway: gateway.clone(),
            },
        )
        .command(
            "save",
            "Saves the server to disk",
            SaveCommand {
                gateway: gateway.clone(),
                backup,
            },
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MinecraftConfig;
    use crate::testing::{FakeArchiver, GatewayCall, RecordingGateway, ScriptedConnector};
    use std::path::PathBuf;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Succeeds(Arc<dyn Gateway>);

    #[async_trait]
    impl CommandHandler for Succeeds {
        async fn handle(&self, command: &IncomingCommand) -> AgentResult<()> {
            reply(self.0.as_ref(), command, "done").await
        }
    }

    struct Fails;

    #[async_trait]
    impl CommandHandler for Fails {
        async fn handle(&self, _command: &IncomingCommand) -> AgentResult<()> {
            Err(AgentError::TransportError("connection refused".to_string()))
        }
    }

    struct Panics;

    #[async_trait]
    impl CommandHandler for Panics {
        async fn handle(&self, _command: &IncomingCommand) -> AgentResult<()> {
            panic!("handler bug")
        }
    }

    fn incoming(text: &str) -> IncomingCommand {
        IncomingCommand::parse(9, 77, "Steve", text, None).unwrap()
    }

    struct Fixture {
        _dir: TempDir,
        gateway: Arc<RecordingGateway>,
        connector: Arc<ScriptedConnector>,
        dispatcher: Dispatcher,
    }

    fn builtin_fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let config = MinecraftConfig {
            base_dir: dir.path().to_path_buf(),
            log_file: PathBuf::from("latest.log"),
            world_dir: "world".to_string(),
            daily_backup: None,
            archive_dir: dir.path().to_path_buf(),
            archive_timeout_secs: 60,
        };
        let connector = Arc::new(ScriptedConnector::new());
        let session = Arc::new(
            ConsoleSession::new(connector.clone(), Duration::from_secs(1), Duration::from_secs(1))
                .with_retries(0, Duration::ZERO),
        );
        let gateway = Arc::new(RecordingGateway::new());
        let backup = Arc::new(BackupOrchestrator::new(
            session.clone(),
            gateway.clone(),
            Arc::new(FakeArchiver::succeeding()),
            &config,
            9,
        ));
        let registry = builtin_commands(session, gateway.clone(), backup)
            .build()
            .unwrap();
        Fixture {
            _dir: dir,
            gateway: gateway.clone(),
            connector,
            dispatcher: Dispatcher::new(Arc::new(registry), gateway),
        }
    }

    #[test]
    fn duplicate_keyword_fails_build() {
        let err = CommandRegistryBuilder::new()
            .command("list", "a", Fails)
            .command("seed", "b", Fails)
            .command("list", "c", Fails)
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, AgentError::DuplicateCommand(ref k) if k == "list"));
    }

    #[tokio::test]
    async fn every_dispatch_replies_or_reports_once() {
        let gateway = Arc::new(RecordingGateway::new());
        let registry = CommandRegistryBuilder::new()
            .command("ok", "works", Succeeds(gateway.clone()))
            .command("broken", "fails", Fails)
            .command("buggy", "panics", Panics)
            .build()
            .unwrap();
        let dispatcher = Dispatcher::new(Arc::new(registry), gateway.clone());

        assert_eq!(dispatcher.dispatch(incoming("/ok")).await, DispatchOutcome::Completed);
        assert_eq!(
            dispatcher.dispatch(incoming("/broken")).await,
            DispatchOutcome::Failed { notified: true }
        );
        assert_eq!(
            dispatcher.dispatch(incoming("/buggy")).await,
            DispatchOutcome::Failed { notified: true }
        );

        let replies = gateway.calls();
        assert_eq!(replies.len(), 3);
        assert_eq!(
            replies[1],
            GatewayCall::Send {
                chat_id: 9,
                text: "Error: Transport error: connection refused".to_string(),
                reply_to: Some(77),
            }
        );
        assert!(gateway.sent_texts()[2].starts_with("Error: Internal error"));
    }

    #[tokio::test]
    async fn failed_notification_is_only_logged() {
        let gateway = Arc::new(RecordingGateway::new());
        gateway.fail_sends.store(true, Ordering::SeqCst);
        let registry = CommandRegistryBuilder::new()
            .command("broken", "fails", Fails)
            .build()
            .unwrap();
        let dispatcher = Dispatcher::new(Arc::new(registry), gateway.clone());

        let outcome = dispatcher.dispatch(incoming("/broken")).await;

        assert_eq!(outcome, DispatchOutcome::Failed { notified: false });
        assert!(gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn unknown_keyword_is_ignored() {
        let fx = builtin_fixture();
        assert_eq!(
            fx.dispatcher.dispatch(incoming("/teleport")).await,
            DispatchOutcome::Unknown
        );
        assert!(fx.gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn menu_lists_builtins_in_order() {
        let fx = builtin_fixture();
        fx.dispatcher.advertise_menu().await;

        let keywords: Vec<String> = match fx.gateway.calls().pop().unwrap() {
            GatewayCall::SetCommands(commands) => commands.into_iter().map(|(k, _)| k).collect(),
            other => panic!("unexpected call {:?}", other),
        };
        assert_eq!(
            keywords,
            vec!["start", "list", "op", "deop", "kill", "kick", "seed", "say", "save"]
        );
    }

    #[tokio::test]
    async fn console_command_forwards_args_and_replies() {
        let fx = builtin_fixture();
        fx.connector.push_response("Kicked Bob: Kicked by an operator\n");

        let outcome = fx.dispatcher.dispatch(incoming("/kick Bob")).await;

        assert_eq!(outcome, DispatchOutcome::Completed);
        assert_eq!(fx.connector.commands(), vec!["kick Bob"]);
        assert_eq!(
            fx.gateway.calls(),
            vec![GatewayCall::Send {
                chat_id: 9,
                text: "Kicked Bob: Kicked by an operator".to_string(),
                reply_to: Some(77),
            }]
        );
    }

    #[tokio::test]
    async fn list_ignores_extra_args() {
        let fx = builtin_fixture();
        fx.connector.push_response("There are 1 of a max of 20 players online: Alex");

        fx.dispatcher.dispatch(incoming("/list everyone")).await;

        assert_eq!(fx.connector.commands(), vec!["list"]);
    }

    #[tokio::test]
    async fn say_attributes_sender_and_fills_empty_response() {
        let fx = builtin_fixture();

        fx.dispatcher.dispatch(incoming("/say good  night all")).await;

        assert_eq!(fx.connector.commands(), vec!["say [Steve]: good  night all"]);
        assert_eq!(fx.gateway.sent_texts(), vec!["sent to server"]);
    }

    #[tokio::test]
    async fn save_runs_backup_against_status_reply() {
        let fx = builtin_fixture();
        fx.connector.push_response("Saved the game");

        let outcome = fx.dispatcher.dispatch(incoming("/save")).await;

        assert_eq!(outcome, DispatchOutcome::Completed);
        assert_eq!(fx.gateway.sent_texts(), vec!["Saving..."]);
        assert_eq!(fx.gateway.uploads().len(), 1);
        assert_eq!(fx.gateway.edits().last().map(String::as_str), Some("Backup finished."));
    }
}
