//! Mock SMTP server listening on a real TCP port
//!
//! The server can:
#![allow(dead_code)] // Test utility module - not all methods used in every test
//! - Answer each command with a configurable reply
//! - Refuse individual recipients
//! - Drop or stall the connection after a number of commands
//! - Record every command line and every message body it receives
//!
//! # Example
//!
//! ```rust,no_run
//! use support::mock_server::MockSmtpServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let server = MockSmtpServer::builder()
//!     .with_extensions(&["SIZE 10000"])
//!     .with_rejected_recipient("nobody@example.com", 550)
//!     .build()
//!     .await?;
//!
//! // Point a router's domain override at server.target()
//!
//! server.shutdown();
//! # Ok(())
//! # }
//! ```

use std::{
    collections::HashMap,
    fmt::Write,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::RwLock,
    time::timeout,
};

#[derive(Debug, Clone)]
struct Reply {
    code: u16,
    text: String,
}

impl Reply {
    fn new(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        format!("{} {}\r\n", self.code, self.text).into_bytes()
    }
}

#[derive(Debug, Clone)]
struct Config {
    greeting: Reply,
    ehlo_code: u16,
    extensions: Vec<String>,
    mail: Reply,
    rcpt: Reply,
    rejected: HashMap<String, u16>,
    data: Reply,
    data_end: Reply,
    rset: Reply,
    quit: Reply,

    // Failure injection
    drop_after_commands: Option<usize>,
    stall_on_command: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            greeting: Reply::new(220, "Mock SMTP Server"),
            ehlo_code: 250,
            extensions: vec!["PIPELINING".to_string()],
            mail: Reply::new(250, "OK"),
            rcpt: Reply::new(250, "OK"),
            rejected: HashMap::new(),
            data: Reply::new(354, "Start mail input; end with <CRLF>.<CRLF>"),
            data_end: Reply::new(250, "OK: Message accepted"),
            rset: Reply::new(250, "OK"),
            quit: Reply::new(221, "Bye"),
            drop_after_commands: None,
            stall_on_command: None,
        }
    }
}

impl Config {
    fn ehlo_reply(&self) -> Vec<u8> {
        if self.ehlo_code != 250 {
            return Reply::new(self.ehlo_code, "Command not recognized").to_bytes();
        }

        let mut lines = vec!["mock.test"];
        lines.extend(self.extensions.iter().map(String::as_str));

        let mut reply = String::new();
        for (i, line) in lines.iter().enumerate() {
            let separator = if i + 1 < lines.len() { '-' } else { ' ' };
            let _ = write!(&mut reply, "{}{separator}{line}\r\n", self.ehlo_code);
        }
        reply.into_bytes()
    }

    fn rcpt_reply(&self, argument: &str) -> Vec<u8> {
        let address = argument
            .trim_start_matches("TO:")
            .trim_start_matches('<')
            .split('>')
            .next()
            .unwrap_or_default();

        self.rejected.get(address).map_or_else(
            || self.rcpt.to_bytes(),
            |code| Reply::new(*code, "Recipient rejected").to_bytes(),
        )
    }
}

#[derive(Debug, Default)]
struct Recorded {
    commands: Vec<String>,
    messages: Vec<Vec<u8>>,
}

/// Mock SMTP server for testing
pub struct MockSmtpServer {
    addr: SocketAddr,
    recorded: Arc<RwLock<Recorded>>,
    shutdown: Arc<AtomicBool>,
    connections: Arc<AtomicUsize>,
}

impl MockSmtpServer {
    #[must_use]
    pub fn builder() -> MockSmtpServerBuilder {
        MockSmtpServerBuilder {
            config: Config::default(),
        }
    }

    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// `127.0.0.1:<port>`, ready for a domain override.
    #[must_use]
    pub fn target(&self) -> String {
        format!("127.0.0.1:{}", self.addr.port())
    }

    /// Command lines received, in order, across all connections.
    pub async fn commands(&self) -> Vec<String> {
        self.recorded.read().await.commands.clone()
    }

    /// Message bodies as received, still dot-stuffed.
    pub async fn messages(&self) -> Vec<Vec<u8>> {
        self.recorded.read().await.messages.clone()
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    async fn handle_client(
        mut stream: TcpStream,
        config: Arc<Config>,
        recorded: Arc<RwLock<Recorded>>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let (reader, mut writer) = stream.split();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();
        let mut command_count = 0;

        writer.write_all(&config.greeting.to_bytes()).await?;
        writer.flush().await?;

        loop {
            line.clear();

            if config
                .drop_after_commands
                .is_some_and(|limit| command_count >= limit)
            {
                return Ok(());
            }

            if config.stall_on_command == Some(command_count) {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                return Ok(());
            }

            let Ok(read) = timeout(Duration::from_secs(10), reader.read_line(&mut line)).await
            else {
                return Ok(());
            };
            if read? == 0 {
                return Ok(());
            }

            command_count += 1;

            let command_line = line.trim_end().to_string();
            tracing::debug!("Mock server received: {command_line}");
            recorded.write().await.commands.push(command_line.clone());

            let (verb, argument) = command_line
                .split_once(' ')
                .unwrap_or((command_line.as_str(), ""));

            let reply = match verb.to_ascii_uppercase().as_str() {
                "EHLO" => config.ehlo_reply(),
                "HELO" => Reply::new(250, "Hello").to_bytes(),
                "MAIL" => config.mail.to_bytes(),
                "RCPT" => config.rcpt_reply(argument),
                "RSET" => config.rset.to_bytes(),
                "DATA" if config.data.code != 354 => config.data.to_bytes(),
                "DATA" => {
                    writer.write_all(&config.data.to_bytes()).await?;
                    writer.flush().await?;

                    let mut body = Vec::new();
                    let mut data_line = String::new();
                    loop {
                        data_line.clear();
                        if reader.read_line(&mut data_line).await? == 0 {
                            return Ok(());
                        }
                        if data_line == ".\r\n" {
                            break;
                        }
                        body.extend_from_slice(data_line.as_bytes());
                    }

                    recorded.write().await.messages.push(body);
                    config.data_end.to_bytes()
                }
                "QUIT" => {
                    writer.write_all(&config.quit.to_bytes()).await?;
                    writer.flush().await?;
                    return Ok(());
                }
                _ => Reply::new(500, "Unknown command").to_bytes(),
            };

            writer.write_all(&reply).await?;
            writer.flush().await?;
        }
    }
}

/// Builder for configuring a `MockSmtpServer`
pub struct MockSmtpServerBuilder {
    config: Config,
}

impl MockSmtpServerBuilder {
    #[must_use]
    pub fn with_greeting(mut self, code: u16, text: impl Into<String>) -> Self {
        self.config.greeting = Reply::new(code, text);
        self
    }

    /// EHLO keywords advertised after the greeting line.
    #[must_use]
    pub fn with_extensions(mut self, extensions: &[&str]) -> Self {
        self.config.extensions = extensions.iter().map(ToString::to_string).collect();
        self
    }

    /// Answer EHLO with `code` instead of the extension list.
    #[must_use]
    pub const fn with_ehlo_code(mut self, code: u16) -> Self {
        self.config.ehlo_code = code;
        self
    }

    #[must_use]
    pub fn with_mail_from_response(mut self, code: u16, text: impl Into<String>) -> Self {
        self.config.mail = Reply::new(code, text);
        self
    }

    #[must_use]
    pub fn with_rcpt_to_response(mut self, code: u16, text: impl Into<String>) -> Self {
        self.config.rcpt = Reply::new(code, text);
        self
    }

    #[must_use]
    pub fn with_rejected_recipient(mut self, address: &str, code: u16) -> Self {
        self.config.rejected.insert(address.to_string(), code);
        self
    }

    #[must_use]
    pub fn with_data_response(mut self, code: u16, text: impl Into<String>) -> Self {
        self.config.data = Reply::new(code, text);
        self
    }

    #[must_use]
    pub fn with_data_end_response(mut self, code: u16, text: impl Into<String>) -> Self {
        self.config.data_end = Reply::new(code, text);
        self
    }

    /// Close the connection after N commands
    #[must_use]
    pub const fn with_network_error_after_commands(mut self, count: usize) -> Self {
        self.config.drop_after_commands = Some(count);
        self
    }

    /// Stop answering before the Nth command (0-indexed)
    #[must_use]
    pub const fn with_stall_on_command(mut self, index: usize) -> Self {
        self.config.stall_on_command = Some(index);
        self
    }

    /// Binds to a random local port and starts accepting connections.
    ///
    /// # Errors
    ///
    /// Returns an error if the server fails to bind to a port
    pub async fn build(self) -> Result<MockSmtpServer, std::io::Error> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let config = Arc::new(self.config);
        let recorded = Arc::new(RwLock::new(Recorded::default()));
        let shutdown = Arc::new(AtomicBool::new(false));
        let connections = Arc::new(AtomicUsize::new(0));

        let server = MockSmtpServer {
            addr,
            recorded: Arc::clone(&recorded),
            shutdown: Arc::clone(&shutdown),
            connections: Arc::clone(&connections),
        };

        tokio::spawn(async move {
            while !shutdown.load(Ordering::Relaxed) {
                // Accept with a timeout so the shutdown flag is polled
                let Ok(Ok((stream, _peer))) =
                    timeout(Duration::from_millis(100), listener.accept()).await
                else {
                    continue;
                };

                connections.fetch_add(1, Ordering::Relaxed);
                let config = Arc::clone(&config);
                let recorded = Arc::clone(&recorded);

                tokio::spawn(async move {
                    if let Err(e) = MockSmtpServer::handle_client(stream, config, recorded).await {
                        tracing::debug!("Mock server client error: {e}");
                    }
                });
            }
        });

        Ok(server)
    }
}

/// A local port with nothing listening on it.
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}
