//! An in-memory SMTP server for exercising sessions without sockets.
//!
//! [`MockConnector`] hands out channels backed by a scripted server per
//! host and records every connection attempt, command and message body so
//! tests can assert on the exact conversation.

use std::{collections::VecDeque, io, sync::Arc};

use ahash::AHashMap;
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{
    channel::{Channel, Connector},
    error::ChannelError,
};

/// A canned reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Reply {
    #[must_use]
    pub fn new(code: u16, text: &str) -> Self {
        Self {
            code,
            lines: vec![text.to_string()],
        }
    }

    /// A reply sent verbatim, without a status code.
    #[must_use]
    pub fn garbled(text: &str) -> Self {
        Self {
            code: 0,
            lines: vec![text.to_string()],
        }
    }

    fn render(&self) -> Vec<String> {
        if self.code == 0 {
            return self.lines.clone();
        }
        if self.lines.is_empty() {
            return vec![self.code.to_string()];
        }

        let last = self.lines.len() - 1;
        self.lines
            .iter()
            .enumerate()
            .map(|(i, line)| {
                let separator = if i == last { ' ' } else { '-' };
                format!("{}{separator}{line}", self.code)
            })
            .collect()
    }
}

/// How a mock server answers each step.
#[derive(Debug, Clone)]
pub struct MockServerConfig {
    pub greeting: Reply,
    pub ehlo: Reply,
    pub helo: Reply,
    pub mail: Reply,
    /// Per-recipient replies keyed by lower-cased address.
    pub rcpt: AHashMap<String, Reply>,
    pub rcpt_default: Reply,
    pub data: Reply,
    pub data_end: Reply,
    pub rset: Reply,
    pub quit: Reply,
    /// Verb after which the server drops the connection without replying.
    /// `GREETING` drops before the greeting, `.` after the message body.
    pub disconnect_on: Option<String>,
}

impl Default for MockServerConfig {
    fn default() -> Self {
        Self {
            greeting: Reply::new(220, "mock.test ESMTP ready"),
            ehlo: Reply {
                code: 250,
                lines: vec!["mock.test".to_string(), "PIPELINING".to_string()],
            },
            helo: Reply::new(250, "mock.test"),
            mail: Reply::new(250, "Sender OK"),
            rcpt: AHashMap::new(),
            rcpt_default: Reply::new(250, "Recipient OK"),
            data: Reply::new(354, "End data with <CR><LF>.<CR><LF>"),
            data_end: Reply::new(250, "Queued"),
            rset: Reply::new(250, "Reset"),
            quit: Reply::new(221, "Bye"),
            disconnect_on: None,
        }
    }
}

impl MockServerConfig {
    #[must_use]
    pub fn with_greeting(mut self, code: u16) -> Self {
        self.greeting = Reply::new(code, "greeting");
        self
    }

    /// Replaces the advertised extensions.
    #[must_use]
    pub fn with_extensions(mut self, extensions: &[&str]) -> Self {
        self.ehlo.lines = std::iter::once("mock.test")
            .chain(extensions.iter().copied())
            .map(str::to_string)
            .collect();
        self
    }

    #[must_use]
    pub fn with_ehlo_code(mut self, code: u16) -> Self {
        self.ehlo = Reply::new(code, "EHLO");
        self
    }

    #[must_use]
    pub fn with_helo_code(mut self, code: u16) -> Self {
        self.helo = Reply::new(code, "HELO");
        self
    }

    #[must_use]
    pub fn with_mail_code(mut self, code: u16) -> Self {
        self.mail = Reply::new(code, "MAIL");
        self
    }

    #[must_use]
    pub fn reject_recipient(mut self, address: &str, code: u16) -> Self {
        self.rcpt
            .insert(address.to_ascii_lowercase(), Reply::new(code, "Rejected"));
        self
    }

    /// Answers `RCPT TO:<address>` with something that is not an SMTP reply.
    #[must_use]
    pub fn garble_recipient(mut self, address: &str) -> Self {
        self.rcpt
            .insert(address.to_ascii_lowercase(), Reply::garbled("what?"));
        self
    }

    #[must_use]
    pub fn with_rcpt_default(mut self, code: u16) -> Self {
        self.rcpt_default = Reply::new(code, "RCPT");
        self
    }

    #[must_use]
    pub fn with_data_code(mut self, code: u16) -> Self {
        self.data = Reply::new(code, "DATA");
        self
    }

    #[must_use]
    pub fn with_data_end_code(mut self, code: u16) -> Self {
        self.data_end = Reply::new(code, "Message");
        self
    }

    #[must_use]
    pub fn with_rset_code(mut self, code: u16) -> Self {
        self.rset = Reply::new(code, "RSET");
        self
    }

    #[must_use]
    pub fn disconnect_on(mut self, verb: &str) -> Self {
        self.disconnect_on = Some(verb.to_ascii_uppercase());
        self
    }

    fn reply_to(&self, verb: &str, argument: &str) -> Reply {
        match verb {
            "EHLO" => self.ehlo.clone(),
            "HELO" => self.helo.clone(),
            "MAIL" => self.mail.clone(),
            "RCPT" => {
                let address = argument
                    .split_once('<')
                    .and_then(|(_, rest)| rest.split_once('>'))
                    .map(|(address, _)| address.to_ascii_lowercase())
                    .unwrap_or_default();
                self.rcpt
                    .get(&address)
                    .unwrap_or(&self.rcpt_default)
                    .clone()
            }
            "DATA" => self.data.clone(),
            "RSET" => self.rset.clone(),
            "QUIT" => self.quit.clone(),
            "NOOP" => Reply::new(250, "OK"),
            _ => Reply::new(500, "Command not recognised"),
        }
    }
}

#[derive(Debug, Clone)]
enum MockHost {
    Refuse,
    Serve(Arc<MockServerConfig>),
}

#[derive(Debug, Default)]
struct MockLog {
    connections: Vec<String>,
    commands: Vec<(String, String)>,
    messages: Vec<(String, Vec<u8>)>,
    terminated: Vec<String>,
}

/// Hands out channels to scripted in-memory servers.
///
/// Hosts that were never configured refuse the connection.
#[derive(Debug, Default)]
pub struct MockConnector {
    hosts: Mutex<AHashMap<String, MockHost>>,
    log: Arc<Mutex<MockLog>>,
}

impl MockConnector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Serves `host` with the given behaviour.
    #[must_use]
    pub fn serve(self, host: &str, config: MockServerConfig) -> Self {
        self.hosts
            .lock()
            .insert(host.to_string(), MockHost::Serve(Arc::new(config)));
        self
    }

    /// Refuses connections to `host`.
    #[must_use]
    pub fn refuse(self, host: &str) -> Self {
        self.hosts.lock().insert(host.to_string(), MockHost::Refuse);
        self
    }

    /// Every connection attempt, refused ones included, in order.
    #[must_use]
    pub fn connections(&self) -> Vec<String> {
        self.log.lock().connections.clone()
    }

    /// Commands received by `host`, in order.
    #[must_use]
    pub fn commands(&self, host: &str) -> Vec<String> {
        self.log
            .lock()
            .commands
            .iter()
            .filter(|(h, _)| h == host)
            .map(|(_, command)| command.clone())
            .collect()
    }

    /// Every command as `(host, command)`, in order.
    #[must_use]
    pub fn all_commands(&self) -> Vec<(String, String)> {
        self.log.lock().commands.clone()
    }

    /// Message bodies accepted by `host`, as transmitted (still stuffed).
    #[must_use]
    pub fn messages(&self, host: &str) -> Vec<Vec<u8>> {
        self.log
            .lock()
            .messages
            .iter()
            .filter(|(h, _)| h == host)
            .map(|(_, body)| body.clone())
            .collect()
    }

    /// How many times a channel to `host` was terminated by the client.
    #[must_use]
    pub fn terminated(&self, host: &str) -> usize {
        self.log
            .lock()
            .terminated
            .iter()
            .filter(|h| *h == host)
            .count()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, host: &str, port: u16) -> Result<Box<dyn Channel>, ChannelError> {
        self.log.lock().connections.push(host.to_string());

        let Some(MockHost::Serve(config)) = self.hosts.lock().get(host).cloned() else {
            return Err(ChannelError::Connect {
                host: host.to_string(),
                port,
                source: io::Error::from(io::ErrorKind::ConnectionRefused),
            });
        };

        let mut channel = MockChannel {
            host: host.to_string(),
            config,
            log: Arc::clone(&self.log),
            replies: VecDeque::new(),
            inbound: Vec::new(),
            in_data: false,
            body: Vec::new(),
            dead: false,
        };

        if channel.config.disconnect_on.as_deref() == Some("GREETING") {
            channel.dead = true;
        } else {
            let greeting = channel.config.greeting.clone();
            channel.queue(&greeting);
        }

        Ok(Box::new(channel))
    }
}

#[derive(Debug)]
struct MockChannel {
    host: String,
    config: Arc<MockServerConfig>,
    log: Arc<Mutex<MockLog>>,
    replies: VecDeque<String>,
    inbound: Vec<u8>,
    in_data: bool,
    body: Vec<u8>,
    dead: bool,
}

impl MockChannel {
    fn queue(&mut self, reply: &Reply) {
        self.replies.extend(reply.render());
    }

    fn drops_after(&self, verb: &str) -> bool {
        self.config.disconnect_on.as_deref() == Some(verb)
    }

    fn handle_line(&mut self, line: &str) {
        if self.in_data {
            if line == "." {
                self.in_data = false;
                let body = std::mem::take(&mut self.body);
                self.log.lock().messages.push((self.host.clone(), body));
                if self.drops_after(".") {
                    self.dead = true;
                } else {
                    let reply = self.config.data_end.clone();
                    self.queue(&reply);
                }
            } else {
                self.body.extend_from_slice(line.as_bytes());
                self.body.extend_from_slice(b"\r\n");
            }
            return;
        }

        self.log
            .lock()
            .commands
            .push((self.host.clone(), line.to_string()));

        let verb = line
            .split([' ', ':'])
            .next()
            .unwrap_or_default()
            .to_ascii_uppercase();

        if self.drops_after(&verb) {
            self.dead = true;
            return;
        }

        let reply = self.config.reply_to(&verb, line);
        if verb == "DATA" && reply.code == 354 {
            self.in_data = true;
        }
        self.queue(&reply);
    }
}

#[async_trait]
impl Channel for MockChannel {
    async fn write_all(&mut self, bytes: &[u8]) -> Result<(), ChannelError> {
        if self.dead {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe).into());
        }

        self.inbound.extend_from_slice(bytes);
        while let Some(end) = self.inbound.windows(2).position(|w| w == b"\r\n") {
            let line: Vec<u8> = self.inbound.drain(..end + 2).take(end).collect();
            self.handle_line(&String::from_utf8_lossy(&line));
            if self.dead {
                self.inbound.clear();
                break;
            }
        }

        Ok(())
    }

    async fn read_line(&mut self) -> Result<String, ChannelError> {
        if self.dead {
            return Err(ChannelError::ConnectionClosed);
        }
        self.replies.pop_front().ok_or(ChannelError::ConnectionClosed)
    }

    async fn terminate(&mut self) -> Result<(), ChannelError> {
        self.dead = true;
        self.log.lock().terminated.push(self.host.clone());
        Ok(())
    }
}
