//! The ESMTP client session.
//!
//! A [`SmtpSession`] owns at most one channel at a time and walks it
//! through greeting, EHLO (or HELO), any number of mail transactions and
//! QUIT. Every command written and every reply read is reported to the
//! session's [`EventDispatcher`].

use std::{fmt::Write as _, sync::Arc};

use emissary_common::{
    Address, AddressEncoder, DeliveryOutcome, Ev, EventContext, EventDispatcher, Message,
    Utf8AddressEncoder, incoming, internal, outgoing,
};
use emissary_tracing::traced;
use serde::{Deserialize, Serialize};

use crate::{
    capabilities::Capabilities,
    channel::{Channel, Connector},
    codes::ResponseCodes,
    data::DotStuffer,
    error::SessionError,
    response::{Response, ResponseLine},
    state::SessionState,
};

/// Port used when nothing else is configured.
pub const DEFAULT_PORT: u16 = 25;

/// Replies longer than this are treated as malformed.
const MAX_REPLY_LINES: usize = 512;

/// Settings shared by every session a transport opens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Name announced in EHLO/HELO.
    ///
    /// Default: `[127.0.0.1]`
    #[serde(default = "defaults::local_domain")]
    pub local_domain: String,

    #[serde(default)]
    pub codes: ResponseCodes,

    /// Declare the message size on `MAIL FROM` when the server supports
    /// the SIZE extension.
    #[serde(default = "defaults::enabled")]
    pub send_size: bool,

    /// Send non-ASCII local parts verbatim when the server supports
    /// SMTPUTF8.
    #[serde(default = "defaults::enabled")]
    pub smtputf8: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            local_domain: defaults::local_domain(),
            codes: ResponseCodes::default(),
            send_size: defaults::enabled(),
            smtputf8: defaults::enabled(),
        }
    }
}

mod defaults {
    pub fn local_domain() -> String {
        String::from("[127.0.0.1]")
    }

    pub const fn enabled() -> bool {
        true
    }
}

#[derive(Debug)]
pub struct SmtpSession {
    name: Arc<str>,
    host: String,
    port: u16,
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    encoder: Arc<dyn AddressEncoder>,
    dispatcher: EventDispatcher,
    channel: Option<Box<dyn Channel>>,
    state: SessionState,
    capabilities: Capabilities,
}

impl SmtpSession {
    /// Creates an unconnected session targeting `localhost:25`.
    #[must_use]
    pub fn new(
        config: SessionConfig,
        connector: Arc<dyn Connector>,
        encoder: Arc<dyn AddressEncoder>,
        dispatcher: EventDispatcher,
    ) -> Self {
        Self {
            name: Arc::from("smtp"),
            host: String::from("localhost"),
            port: DEFAULT_PORT,
            config,
            connector,
            encoder,
            dispatcher,
            channel: None,
            state: SessionState::Unconnected,
            capabilities: Capabilities::default(),
        }
    }

    /// Name reported as the transport in dispatched events.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<Arc<str>>) -> Self {
        self.name = name.into();
        self
    }

    /// Points the session at another server. Takes effect on the next
    /// [`start`](Self::start); an open connection is left alone.
    pub fn set_target(&mut self, host: impl Into<String>, port: u16) {
        self.host = host.into();
        self.port = port;
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    #[must_use]
    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Extensions from the last EHLO; empty after a HELO fallback.
    #[must_use]
    pub const fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    #[must_use]
    pub const fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    /// Connected and past the handshake.
    #[must_use]
    pub const fn is_started(&self) -> bool {
        self.channel.is_some() && self.state.is_ready()
    }

    /// Connects, reads the greeting and performs EHLO, falling back to HELO
    /// when the server does not understand EHLO.
    ///
    /// Does nothing if the session is already started, or if a listener
    /// cancels `BeforeTransportStarted`. On failure the connection is
    /// dropped and the session is left unconnected.
    ///
    /// # Errors
    ///
    /// Transport errors from connecting, protocol errors from any
    /// handshake step.
    #[traced(instrument(level = tracing::Level::DEBUG, skip(self), fields(host = %self.host, port = self.port)), timing(precision = "ms"))]
    pub async fn start(&mut self) -> Result<(), SessionError> {
        if self.is_started() {
            return Ok(());
        }

        if !self
            .dispatcher
            .dispatch(Ev::BeforeTransportStarted, &mut self.context())
        {
            return Ok(());
        }

        if self.state == SessionState::Closed {
            self.transition(SessionState::Unconnected)?;
        }

        internal!(level = DEBUG, "Connecting to {}:{}", self.host, self.port);
        self.channel = Some(self.connector.connect(&self.host, self.port).await?);

        if let Err(error) = self.handshake().await {
            self.abandon().await;
            return Err(error);
        }

        internal!(level = DEBUG, "Session with {} established", self.host);
        self.dispatcher
            .dispatch(Ev::TransportStarted, &mut self.context());

        Ok(())
    }

    async fn handshake(&mut self) -> Result<(), SessionError> {
        let greeting = self.read_response().await?;
        let codes = self.config.codes.clone();
        self.check("connect", &greeting, &codes.greeting)?;
        self.transition(SessionState::Greeted)?;

        let ehlo = self
            .execute_command(
                &format!("EHLO {}", self.config.local_domain),
                &codes.ehlo_any(),
            )
            .await?;

        if codes.ehlo.contains(&ehlo.code) {
            self.capabilities = Capabilities::from_ehlo(&ehlo);
        } else {
            internal!(
                level = DEBUG,
                "{} answered EHLO with {}, falling back to HELO",
                self.host,
                ehlo.code
            );
            self.execute_command(&format!("HELO {}", self.config.local_domain), &codes.helo)
                .await?;
            self.capabilities = Capabilities::default();
        }

        self.transition(SessionState::HeloDone)
    }

    /// Sends QUIT and closes the connection. Best effort: failures are
    /// logged and the session ends up closed regardless.
    ///
    /// Does nothing on a session without a connection, or if a listener
    /// cancels `BeforeTransportStopped`. Use [`close`](Self::close) when the
    /// connection must go regardless.
    pub async fn stop(&mut self) {
        if self.channel.is_none() {
            return;
        }

        if !self
            .dispatcher
            .dispatch(Ev::BeforeTransportStopped, &mut self.context())
        {
            return;
        }

        self.close().await;
    }

    /// Like [`stop`](Self::stop), but without consulting listeners first.
    pub async fn close(&mut self) {
        if self.channel.is_none() {
            return;
        }

        if let Err(error) = self.quit().await {
            internal!(level = DEBUG, "QUIT to {} failed: {error}", self.host);
        }

        if let Some(mut channel) = self.channel.take()
            && let Err(error) = channel.terminate().await
        {
            internal!(level = DEBUG, "Closing connection to {} failed: {error}", self.host);
        }

        self.state = SessionState::Closed;
        self.capabilities = Capabilities::default();
        self.dispatcher
            .dispatch(Ev::TransportStopped, &mut self.context());
    }

    async fn quit(&mut self) -> Result<(), SessionError> {
        self.send_line("QUIT").await?;
        let response = self.read_response().await?;
        if !self.config.codes.quit.contains(&response.code) {
            internal!(
                level = DEBUG,
                "Unexpected reply to QUIT from {}: {} {}",
                self.host,
                response.code,
                response.message()
            );
        }
        Ok(())
    }

    /// Aborts the current transaction with RSET.
    ///
    /// # Errors
    ///
    /// `NotStarted` without a connection, otherwise transport or protocol
    /// errors from the exchange.
    pub async fn reset(&mut self) -> Result<(), SessionError> {
        if !self.is_started() {
            return Err(SessionError::NotStarted);
        }

        let codes = self.config.codes.rset.clone();
        self.execute_command("RSET", &codes).await?;

        if self.state == SessionState::InTransaction {
            self.transition(SessionState::HeloDone)?;
        }
        Ok(())
    }

    /// Writes `command`, reads the full reply and checks its code against
    /// `acceptable`. An empty `acceptable` accepts anything.
    ///
    /// An unacceptable code is announced as `ExceptionThrown` first; if a
    /// listener cancels it the reply is returned as though it were fine.
    ///
    /// # Errors
    ///
    /// `Protocol` for an unacceptable code, `Transport` for I/O failures.
    pub async fn execute_command(
        &mut self,
        command: &str,
        acceptable: &[u16],
    ) -> Result<Response, SessionError> {
        self.send_line(command).await?;
        let response = self.read_response().await?;
        self.check(command, &response, acceptable)?;
        Ok(response)
    }

    /// Runs one mail transaction: `MAIL FROM`, one `RCPT TO` per recipient
    /// and, if any recipient was accepted, `DATA` with the dot-stuffed
    /// message.
    ///
    /// Recipients refused by the server or that cannot be encoded land in
    /// the outcome's failed list. When none is accepted the transaction is
    /// reset and nothing is transmitted.
    ///
    /// # Errors
    ///
    /// A rejected `MAIL FROM`, `DATA` or end-of-data reply is a protocol
    /// error; connection failures are transport errors. Either way the
    /// session should be stopped before reuse.
    pub async fn send_envelope(
        &mut self,
        message: &dyn Message,
        reverse_path: &Address,
        recipients: &[Address],
    ) -> Result<DeliveryOutcome, SessionError> {
        if !self.is_started() {
            return Err(SessionError::NotStarted);
        }
        if self.state == SessionState::InTransaction {
            self.reset().await?;
        }

        let body = render(message)?;
        let utf8 = self.wants_smtputf8(reverse_path, recipients);
        let encoder: Arc<dyn AddressEncoder> = if utf8 {
            Arc::new(Utf8AddressEncoder)
        } else {
            Arc::clone(&self.encoder)
        };
        let codes = self.config.codes.clone();

        let mut mail_from = format!("MAIL FROM:<{}>", encoder.encode(reverse_path)?);
        if self.config.send_size && self.capabilities.supports("SIZE") {
            let _ = write!(mail_from, " SIZE={}", body.len());
        }
        if utf8 {
            mail_from.push_str(" SMTPUTF8");
        }
        self.execute_command(&mail_from, &codes.mail).await?;
        self.transition(SessionState::InTransaction)?;

        let mut outcome = DeliveryOutcome::default();
        for recipient in recipients {
            let encoded = match encoder.encode(recipient) {
                Ok(encoded) => encoded,
                Err(error) => {
                    internal!(level = WARN, "Unable to encode recipient {recipient}: {error}");
                    outcome.failed.push(recipient.clone());
                    continue;
                }
            };

            match self
                .execute_command(&format!("RCPT TO:<{encoded}>"), &codes.rcpt)
                .await
            {
                Ok(_) => outcome.accepted += 1,
                Err(error @ SessionError::Protocol { .. }) => {
                    internal!(level = INFO, "{} refused {recipient}: {error}", self.host);
                    outcome.failed.push(recipient.clone());
                }
                Err(error) => return Err(error),
            }
        }

        if outcome.accepted == 0 {
            self.reset().await?;
            return Ok(outcome);
        }

        self.execute_command("DATA", &codes.data).await?;

        self.channel_mut()?.write_all(&body).await?;
        outgoing!(level = DEBUG, "<{} bytes of message data>", body.len());

        self.set_awaiting_data_reply(true);
        let end = self.execute_command(".", &codes.data_end).await;
        self.set_awaiting_data_reply(false);
        end?;

        self.transition(SessionState::HeloDone)?;
        Ok(outcome)
    }

    fn wants_smtputf8(&self, reverse_path: &Address, recipients: &[Address]) -> bool {
        self.config.smtputf8
            && self.capabilities.supports("SMTPUTF8")
            && std::iter::once(reverse_path)
                .chain(recipients)
                .any(|address| !address.local_part().is_ascii())
    }

    async fn send_line(&mut self, line: &str) -> Result<(), SessionError> {
        self.channel_mut()?.write_line(line).await?;
        outgoing!("{line}");
        self.dispatcher.dispatch(
            Ev::CommandSent,
            &mut self.context().with_command(line),
        );
        Ok(())
    }

    async fn read_response(&mut self) -> Result<Response, SessionError> {
        let channel = self.channel_mut()?;

        let mut lines = Vec::new();
        loop {
            let line = ResponseLine::parse(&channel.read_line().await?)?;
            let is_last = line.is_last;
            lines.push(line);
            if is_last {
                break;
            }
            if lines.len() >= MAX_REPLY_LINES {
                return Err(SessionError::MalformedReply(format!(
                    "more than {MAX_REPLY_LINES} lines in one reply"
                )));
            }
        }

        let response = Response::from_lines(lines)?;
        incoming!("{} {}", response.code, response.message());
        self.dispatcher.dispatch(
            Ev::ResponseReceived,
            &mut self
                .context()
                .with_reply(response.code, response.message()),
        );

        Ok(response)
    }

    fn check(
        &self,
        command: &str,
        response: &Response,
        acceptable: &[u16],
    ) -> Result<(), SessionError> {
        if acceptable.is_empty() || acceptable.contains(&response.code) {
            return Ok(());
        }

        self.raise(SessionError::Protocol {
            command: command.to_string(),
            code: response.code,
            message: response.message(),
            expected: acceptable.to_vec(),
        })
    }

    /// Offers `error` to listeners as `ExceptionThrown`; it is returned
    /// unless one of them cancels the event.
    fn raise(&self, error: SessionError) -> Result<(), SessionError> {
        let mut context = self.context().with_error(&error);
        if let SessionError::Protocol {
            command,
            code,
            message,
            ..
        } = &error
        {
            context = context
                .with_command(command.as_str())
                .with_reply(*code, message.as_str());
        }

        if self.dispatcher.dispatch(Ev::ExceptionThrown, &mut context) {
            Err(error)
        } else {
            internal!(level = DEBUG, "Listener suppressed error: {error}");
            Ok(())
        }
    }

    fn transition(&mut self, next: SessionState) -> Result<(), SessionError> {
        if self.state == next {
            return Ok(());
        }
        if !self.state.can_transition(next) {
            return Err(SessionError::InvalidState {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Drops a connection whose handshake failed.
    async fn abandon(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            let _ = channel.terminate().await;
        }
        self.state = SessionState::Unconnected;
        self.capabilities = Capabilities::default();
    }

    fn channel_mut(&mut self) -> Result<&mut (dyn Channel + 'static), SessionError> {
        self.channel.as_deref_mut().ok_or(SessionError::NotStarted)
    }

    fn set_awaiting_data_reply(&mut self, awaiting: bool) {
        if let Some(channel) = self.channel.as_deref_mut() {
            channel.awaiting_data_reply(awaiting);
        }
    }

    fn context(&self) -> EventContext {
        EventContext::new(Arc::clone(&self.name)).with_host(self.host.as_str())
    }
}

/// The message as a dot-stuffed, CRLF-terminated DATA payload.
fn render(message: &dyn Message) -> Result<Vec<u8>, SessionError> {
    let mut stuffer = DotStuffer::new(Vec::new());
    message.write_to(&mut stuffer).map_err(SessionError::Render)?;
    stuffer.finish().map_err(SessionError::Render)
}
