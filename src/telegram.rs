use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::commands::Dispatcher;
use crate::config::TelegramConfig;
use crate::gateway::{Gateway, IncomingCommand, MessageRef, TransferTimeouts};
use crate::{AgentError, AgentResult};

const RETRY_DELAY: Duration = Duration::from_secs(2);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    error_code: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    message: Option<Message>,
}

#[derive(Debug, Deserialize)]
struct Message {
    message_id: i64,
    chat: Chat,
    from: Option<User>,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct User {
    first_name: String,
    last_name: Option<String>,
    username: Option<String>,
}

impl User {
    fn full_name(&self) -> String {
        match &self.last_name {
            Some(last) => format!("{} {}", self.first_name, last),
            None => self.first_name.clone(),
        }
    }
}

fn unwrap_response<T>(method: &str, response: ApiResponse<T>) -> AgentResult<T> {
    if !response.ok {
        return Err(AgentError::GatewayError(format!(
            "{} failed ({}): {}",
            method,
            response.error_code.unwrap_or_default(),
            response.description.unwrap_or_default()
        )));
    }
    response
        .result
        .ok_or_else(|| AgentError::GatewayError(format!("{} returned no result", method)))
}

/// `bot_username` filters out commands mentioning other bots.
fn to_command(update: Update, bot_username: Option<&str>) -> Option<IncomingCommand> {
    let message = update.message?;
    let text = message.text.as_deref()?;
    let sender = message
        .from
        .as_ref()
        .map(User::full_name)
        .unwrap_or_default();
    IncomingCommand::parse(
        message.chat.id,
        message.message_id,
        &sender,
        text,
        bot_username,
    )
}

pub struct TelegramGateway {
    client: Client,
    api_url: String,
    poll_timeout: Duration,
}

impl TelegramGateway {
    pub fn new(config: &TelegramConfig) -> AgentResult<Self> {
        let poll_timeout = Duration::from_secs(config.poll_timeout_secs);
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(poll_timeout + Duration::from_secs(15))
            .build()
            .map_err(|e| AgentError::ConfigError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_url: format!("{}{}", config.base_url, config.token),
            poll_timeout,
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/{}", self.api_url, method)
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, body: Value) -> AgentResult<T> {
        let response: ApiResponse<T> = self
            .client
            .post(self.method_url(method))
            .json(&body)
            .send()
            .await?
            .json()
            .await?;
        unwrap_response(method, response)
    }

    async fn get_me(&self) -> AgentResult<User> {
        self.call("getMe", json!({})).await
    }

    /// The bot's own username, retried until the API answers.
    async fn own_username(&self) -> Option<String> {
        let mut retry_delay = RETRY_DELAY;
        loop {
            match self.get_me().await {
                Ok(me) => {
                    info!("Running as bot @{}", me.username.as_deref().unwrap_or("?"));
                    return me.username;
                }
                Err(e) => {
                    warn!("getMe failed: {}; retrying in {:?}", e, retry_delay);
                    tokio::time::sleep(retry_delay).await;
                    retry_delay = (retry_delay * 2).min(MAX_RETRY_DELAY);
                }
            }
        }
    }

    async fn get_updates(&self, offset: i64) -> AgentResult<Vec<Update>> {
        self.call(
            "getUpdates",
            json!({
                "offset": offset,
                "timeout": self.poll_timeout.as_secs(),
                "allowed_updates": ["message"],
            }),
        )
        .await
    }

    /// Long-poll for updates forever, dispatching each command on its own task.
    pub async fn run_update_loop(&self, dispatcher: Arc<Dispatcher>) {
        info!("Telegram update loop starting");
        let username = self.own_username().await;
        let mut offset = 0i64;
        let mut retry_delay = RETRY_DELAY;

        loop {
            let updates = match self.get_updates(offset).await {
                Ok(updates) => {
                    retry_delay = RETRY_DELAY;
                    updates
                }
                Err(e) => {
                    warn!("getUpdates failed: {}; retrying in {:?}", e, retry_delay);
                    tokio::time::sleep(retry_delay).await;
                    retry_delay = (retry_delay * 2).min(MAX_RETRY_DELAY);
                    continue;
                }
            };

            for update in updates {
                offset = offset.max(update.update_id + 1);
                let Some(command) = to_command(update, username.as_deref()) else {
                    continue;
                };
                debug!("Received /{} from chat {}", command.keyword, command.chat_id);
                let dispatcher = dispatcher.clone();
                tokio::spawn(async move {
                    dispatcher.dispatch(command).await;
                });
            }
        }
    }
}

#[async_trait]
impl Gateway for TelegramGateway {
    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        reply_to: Option<i64>,
    ) -> AgentResult<MessageRef> {
        let mut body = json!({ "chat_id": chat_id, "text": text });
        if let Some(reply_to) = reply_to {
            body["reply_to_message_id"] = json!(reply_to);
        }
        let message: Message = self.call("sendMessage", body).await?;
        Ok(MessageRef {
            chat_id: message.chat.id,
            message_id: message.message_id,
        })
    }

    async fn edit_message(&self, message: &MessageRef, text: &str) -> AgentResult<()> {
        let _: Value = self
            .call(
                "editMessageText",
                json!({
                    "chat_id": message.chat_id,
                    "message_id": message.message_id,
                    "text": text,
                }),
            )
            .await?;
        Ok(())
    }

    async fn delete_message(&self, message: &MessageRef) -> AgentResult<()> {
        let _: bool = self
            .call(
                "deleteMessage",
                json!({ "chat_id": message.chat_id, "message_id": message.message_id }),
            )
            .await?;
        Ok(())
    }

    async fn send_document(
        &self,
        chat_id: i64,
        path: &Path,
        caption: &str,
        reply_to: Option<i64>,
        timeouts: TransferTimeouts,
    ) -> AgentResult<MessageRef> {
        let upload_err = |e: &dyn std::fmt::Display| AgentError::UploadError(e.to_string());

        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| upload_err(&e))?;
        let size = file.metadata().await.map_err(|e| upload_err(&e))?.len();
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "backup.tar.gz".to_string());
        info!("Uploading {} ({} bytes)", file_name, size);

        let document = Part::stream_with_length(Body::from(file), size)
            .file_name(file_name)
            .mime_str("application/gzip")
            .map_err(|e| upload_err(&e))?;
        let mut form = Form::new()
            .text("chat_id", chat_id.to_string())
            .text("caption", caption.to_string())
            .part("document", document);
        if let Some(reply_to) = reply_to {
            form = form.text("reply_to_message_id", reply_to.to_string());
        }

        let client = Client::builder()
            .connect_timeout(timeouts.connect)
            .timeout(timeouts.overall_for(size))
            .build()
            .map_err(|e| upload_err(&e))?;
        let response: ApiResponse<Message> = client
            .post(self.method_url("sendDocument"))
            .multipart(form)
            .send()
            .await
            .map_err(|e| upload_err(&e))?
            .json()
            .await
            .map_err(|e| upload_err(&e))?;

        let message = unwrap_response("sendDocument", response).map_err(|e| {
            error!("Document upload rejected: {}", e);
            upload_err(&e)
        })?;
        Ok(MessageRef {
            chat_id: message.chat.id,
            message_id: message.message_id,
        })
    }

    async fn set_commands(&self, commands: &[(String, String)]) -> AgentResult<()> {
        let commands: Vec<Value> = commands
            .iter()
            .map(|(command, description)| json!({ "command": command, "description": description }))
            .collect();
        let _: bool = self
            .call("setMyCommands", json!({ "commands": commands }))
            .await?;
        Ok(())
    }
}
