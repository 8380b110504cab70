use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::RconConfig;
use crate::{AgentError, AgentResult};

pub const PACKET_RESPONSE: i32 = 0;
pub const PACKET_COMMAND: i32 = 2;
pub const PACKET_AUTH_RESPONSE: i32 = 2;
pub const PACKET_LOGIN: i32 = 3;

const MIN_PACKET_LEN: i32 = 10;
const MAX_PACKET_LEN: i32 = 4110;
const MAX_COMMAND_LEN: usize = 1446;
const AUTH_FAILED_ID: i32 = -1;

/// One RCON packet. On the wire it is `length | request_id | type | body | 0x00 0x00`
/// with little-endian `i32` header fields, where `length` counts everything
/// after itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub request_id: i32,
    pub kind: i32,
    pub body: String,
}

impl Packet {
    pub fn new(request_id: i32, kind: i32, body: impl Into<String>) -> Self {
        Self {
            request_id,
            kind,
            body: body.into(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let body = self.body.as_bytes();
        let len = 4 + 4 + body.len() + 2;
        let mut buf = BytesMut::with_capacity(4 + len);
        buf.put_i32_le(len as i32);
        buf.put_i32_le(self.request_id);
        buf.put_i32_le(self.kind);
        buf.put_slice(body);
        buf.put_u8(0);
        buf.put_u8(0);
        buf.freeze()
    }

    /// Decode the bytes following the length prefix.
    pub fn decode(payload: &[u8]) -> Result<Self, ConsoleFailure> {
        if payload.len() < MIN_PACKET_LEN as usize {
            return Err(ConsoleFailure::Protocol(format!(
                "packet too short: {} bytes",
                payload.len()
            )));
        }
        let mut buf = payload;
        let request_id = buf.get_i32_le();
        let kind = buf.get_i32_le();
        let (body, terminator) = buf.split_at(buf.len() - 2);
        if terminator != [0, 0] {
            return Err(ConsoleFailure::Protocol(
                "packet is not NUL terminated".to_string(),
            ));
        }

        Ok(Self {
            request_id,
            kind,
            body: String::from_utf8_lossy(body).into_owned(),
        })
    }
}

async fn read_packet<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Packet, ConsoleFailure> {
    let len = reader.read_i32_le().await?;
    if !(MIN_PACKET_LEN..=MAX_PACKET_LEN).contains(&len) {
        return Err(ConsoleFailure::Protocol(format!(
            "invalid packet length {}",
            len
        )));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Packet::decode(&payload)
}

async fn round_trip(stream: &mut TcpStream, request: &Packet) -> Result<Packet, ConsoleFailure> {
    stream.write_all(&request.encode()).await?;
    read_packet(stream).await
}

/// Response body plus the protocol's response-type tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleResponse {
    pub body: String,
    pub kind: i32,
}

/// Failure of a single transport attempt, before the session decides
/// whether it is worth retrying.
#[derive(Debug)]
pub enum ConsoleFailure {
    Io(io::Error),
    Timeout(&'static str),
    Protocol(String),
}

impl ConsoleFailure {
    /// The peer went away under us; a fresh connection may succeed.
    pub fn is_dead_peer(&self) -> bool {
        match self {
            ConsoleFailure::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

impl fmt::Display for ConsoleFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsoleFailure::Io(err) => write!(f, "{}", err),
            ConsoleFailure::Timeout(phase) => write!(f, "{} timed out", phase),
            ConsoleFailure::Protocol(msg) => write!(f, "{}", msg),
        }
    }
}

impl From<io::Error> for ConsoleFailure {
    fn from(err: io::Error) -> Self {
        ConsoleFailure::Io(err)
    }
}

impl From<ConsoleFailure> for AgentError {
    fn from(failure: ConsoleFailure) -> Self {
        match failure {
            ConsoleFailure::Protocol(msg) => AgentError::ProtocolError(msg),
            other => AgentError::TransportError(other.to_string()),
        }
    }
}

/// One connection object. The session owns exactly one at a time.
#[async_trait]
pub trait ConsoleTransport: Send {
    /// Establish a fresh, authenticated connection, replacing any previous one.
    async fn connect(&mut self, timeout: Duration) -> Result<(), ConsoleFailure>;

    async fn exec(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> Result<ConsoleResponse, ConsoleFailure>;
}

/// Builds connection objects for the session.
pub trait ConsoleConnector: Send + Sync {
    fn build(&self) -> Box<dyn ConsoleTransport>;
}

pub struct TcpConnector {
    host: String,
    port: u16,
    password: String,
}

impl TcpConnector {
    pub fn new(host: impl Into<String>, port: u16, password: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            password: password.into(),
        }
    }
}

impl ConsoleConnector for TcpConnector {
    fn build(&self) -> Box<dyn ConsoleTransport> {
        Box::new(RconClient::new(
            format!("{}:{}", self.host, self.port),
            self.password.clone(),
        ))
    }
}

pub struct RconClient {
    addr: String,
    password: String,
    stream: Option<TcpStream>,
    next_id: i32,
}

impl RconClient {
    pub fn new(addr: String, password: String) -> Self {
        Self {
            addr,
            password,
            stream: None,
            next_id: 1,
        }
    }

    fn allocate_id(&mut self) -> i32 {
        let id = self.next_id;
        self.next_id = if self.next_id == i32::MAX { 1 } else { self.next_id + 1 };
        id
    }

    async fn login(&mut self) -> Result<TcpStream, ConsoleFailure> {
        let mut stream = TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;

        let id = self.allocate_id();
        let login = Packet::new(id, PACKET_LOGIN, self.password.clone());
        stream.write_all(&login.encode()).await?;

        loop {
            let reply = read_packet(&mut stream).await?;
            // Some servers send an empty response value ahead of the auth result.
            if reply.kind == PACKET_RESPONSE && reply.body.is_empty() {
                continue;
            }
            if reply.request_id == AUTH_FAILED_ID {
                return Err(ConsoleFailure::Protocol(
                    "authentication rejected".to_string(),
                ));
            }
            if reply.kind != PACKET_AUTH_RESPONSE || reply.request_id != id {
                return Err(ConsoleFailure::Protocol(format!(
                    "unexpected auth reply: id {} type {}",
                    reply.request_id, reply.kind
                )));
            }
            return Ok(stream);
        }
    }
}

#[async_trait]
impl ConsoleTransport for RconClient {
    async fn connect(&mut self, timeout: Duration) -> Result<(), ConsoleFailure> {
        self.stream = None;
        let stream = tokio::time::timeout(timeout, self.login())
            .await
            .map_err(|_| ConsoleFailure::Timeout("connect"))??;
        debug!("RCON connected to {}", self.addr);
        self.stream = Some(stream);
        Ok(())
    }

    async fn exec(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> Result<ConsoleResponse, ConsoleFailure> {
        let id = self.allocate_id();
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| ConsoleFailure::Io(io::Error::from(io::ErrorKind::NotConnected)))?;

        let request = Packet::new(id, PACKET_COMMAND, command);
        let reply = tokio::time::timeout(timeout, round_trip(stream, &request))
            .await
            .map_err(|_| ConsoleFailure::Timeout("command"))??;

        if reply.request_id != id {
            return Err(ConsoleFailure::Protocol(format!(
                "response id {} does not match request {}",
                reply.request_id, id
            )));
        }
        if reply.kind != PACKET_RESPONSE {
            return Err(ConsoleFailure::Protocol(format!(
                "unexpected response type {}",
                reply.kind
            )));
        }

        Ok(ConsoleResponse {
            body: reply.body,
            kind: reply.kind,
        })
    }
}

/// Single logical console connection with reconnect-and-retry on a dead peer.
pub struct ConsoleSession {
    connector: Arc<dyn ConsoleConnector>,
    connection: Mutex<Option<Box<dyn ConsoleTransport>>>,
    connect_timeout: Duration,
    read_timeout: Duration,
    retries: u32,
    retry_delay: Duration,
}

impl ConsoleSession {
    pub fn new(
        connector: Arc<dyn ConsoleConnector>,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Self {
        Self {
            connector,
            connection: Mutex::new(None),
            connect_timeout,
            read_timeout,
            retries: 2,
            retry_delay: Duration::from_secs(1),
        }
    }

    pub fn from_config(config: &RconConfig) -> Self {
        let connector = Arc::new(TcpConnector::new(
            config.host.clone(),
            config.port,
            config.password.clone(),
        ));
        Self::new(connector, config.connect_timeout(), config.read_timeout())
            .with_retries(config.retries, Duration::from_secs(1))
    }

    pub fn with_retries(mut self, retries: u32, retry_delay: Duration) -> Self {
        self.retries = retries;
        self.retry_delay = retry_delay;
        self
    }

    /// Send `command` followed by `args`, joined by single spaces, and return
    /// the trimmed response text. `timeout` defaults to the read timeout.
    pub async fn send(
        &self,
        command: &str,
        args: &[&str],
        timeout: Option<Duration>,
    ) -> AgentResult<String> {
        let line = std::iter::once(command)
            .chain(args.iter().copied())
            .collect::<Vec<_>>()
            .join(" ");
        if line.len() > MAX_COMMAND_LEN {
            return Err(AgentError::InvalidRequest(format!(
                "command is {} bytes, limit is {}",
                line.len(),
                MAX_COMMAND_LEN
            )));
        }
        let timeout = timeout.unwrap_or(self.read_timeout);

        let mut connection = self.connection.lock().await;
        let mut attempt = 0u32;
        loop {
            let conn = connection.get_or_insert_with(|| self.connector.build());
            let outcome = match conn.connect(self.connect_timeout).await {
                Ok(()) => conn.exec(&line, timeout).await,
                Err(failure) => Err(failure),
            };

            match outcome {
                Ok(response) => {
                    info!(
                        "rcon command executed: [{}], response: [{}] {}",
                        command, response.kind, response.body
                    );
                    return Ok(response.body.trim().to_string());
                }
                Err(failure) if failure.is_dead_peer() => {
                    *connection = None;
                    if attempt >= self.retries {
                        error!("Connection closed. Max retries reached: {}", failure);
                        return Err(AgentError::ConnectionExhausted {
                            attempts: attempt + 1,
                            last_error: failure.to_string(),
                        });
                    }
                    attempt += 1;
                    warn!(
                        "Connection closed ({}). Reset client and try again ({}/{})",
                        failure, attempt, self.retries
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(failure) => {
                    error!("rcon command [{}] failed: {}", command, failure);
                    return Err(failure.into());
                }
            }
        }
    }
}
