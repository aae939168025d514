//-
// Copyright (c) 2026, Pistolet contributors
//
// This file is part of Pistolet.
//
// Pistolet is free software: you can  redistribute it and/or modify it under
// the terms of the GNU General Public  License as published by the Free Soft-
// ware Foundation, either version 3 of  the License, or (at your option) any
// later version.
//
// Pistolet is distributed in the hope  that it will be useful, but WITHOUT
// ANY  WARRANTY; without  even the  implied warranty  of MERCHANTABILITY  or
// FITNESS FOR  A PARTICULAR  PURPOSE. See the  GNU General  Public License
// for more details.
//
// You should have received a copy of the GNU General Public License along
// with Pistolet. If not, see <http://www.gnu.org/licenses/>.

//! The per-connection protocol engine.
//!
//! One `Session` drives a connection from the 220 greeting to QUIT or
//! disconnect: it reads command lines through the bounded line reader,
//! parses them, applies the sequencing rules, accumulates the envelope,
//! receives the dot-stuffed payload, and hands the completed `Mail` to the
//! downstream handler. Role-specific behavior (capability advertisement,
//! MAIL admission, STARTTLS/AUTH recognition) is delegated to `Role`.

use std::io;
use std::rc::Rc;
use std::time::{Duration, Instant};

use log::{info, warn};
use openssl::ssl::SslAcceptor;
use tokio::io::{AsyncWriteExt, BufStream};
use tokio::sync::mpsc;

use super::address::MailAddress;
use super::codes::*;
use super::framing::{self, BodyError, LineError, MAX_COMMAND_LINE};
use super::syntax::Command;
use super::{Mail, ServerState};
use crate::support::{
    async_io::ServerIo, error::Error, log_prefix::LogPrefix,
};

/// Idle ceiling between commands.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(300);
/// Inactivity ceiling for receiving the whole DATA payload.
const DATA_TIMEOUT: Duration = Duration::from_secs(600);
/// Largest message payload accepted before replying 552.
const MAX_MESSAGE_SIZE: usize = 32 * 1024 * 1024;
/// RFC 5321 §4.5.3.1.8 requires buffering at least 100 recipients.
const MAX_RECIPIENTS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseKind {
    /// The last (or only) line of a reply. Forces a flush.
    Final,
    /// A non-final line of a multi-line reply, safe to buffer.
    Delayable,
}

impl ResponseKind {
    fn or_final(self, phinal: bool) -> Self {
        if phinal {
            ResponseKind::Final
        } else {
            self
        }
    }

    fn indicator(self) -> char {
        match self {
            Final => ' ',
            Delayable => '-',
        }
    }
}

use self::ResponseKind::*;

pub(super) struct Session {
    io: BufStream<ServerIo>,
    srv: Rc<ServerState>,
    log_prefix: LogPrefix,
    /// The acceptor for a pending STARTTLS upgrade; taken on use so the
    /// upgrade can happen at most once per connection.
    ssl_acceptor: Option<SslAcceptor>,
    deadline_tx: mpsc::Sender<Instant>,
    quit: bool,

    greeted: bool,
    extended: bool,
    authenticated: bool,
    peer_domain: String,
    from: Option<MailAddress>,
    to: Vec<MailAddress>,
    msg: Vec<u8>,
}

/// Runs one connection to completion.
///
/// The connection is torn down when the idle timer expires, after a
/// best-effort 421.
pub(super) async fn run(
    io: ServerIo,
    srv: Rc<ServerState>,
    log_prefix: LogPrefix,
) -> Result<(), Error> {
    let (deadline_tx, deadline_rx) = mpsc::channel(1);
    let ssl_acceptor = srv.ssl_acceptor.clone();

    let mut session = Session {
        io: BufStream::new(io),
        srv,
        log_prefix,
        ssl_acceptor,
        deadline_tx,
        quit: false,

        greeted: false,
        extended: false,
        authenticated: false,
        peer_domain: String::new(),
        from: None,
        to: Vec::new(),
        msg: Vec::new(),
    };

    tokio::select! {
        r = session.run() => return r,
        _ = idle_timer(deadline_rx) => (),
    }

    warn!("{} Connection idle timer expired", session.log_prefix);
    let _ = session
        .send_reply(Final, pc::ServiceNotAvailableClosing, "Shutting down")
        .await;
    Err(Error::Io(io::Error::new(
        io::ErrorKind::TimedOut,
        "Connection idle timer expired",
    )))
}

impl Session {
    async fn run(&mut self) -> Result<(), Error> {
        let greeting = format!(
            "{} {} ESMTP",
            self.srv.config.host_name,
            env!("CARGO_PKG_NAME"),
        );
        self.send_reply(Final, pc::ServiceReady, &greeting).await?;

        while !self.quit {
            self.run_command().await?;
        }

        Ok(())
    }

    async fn run_command(&mut self) -> Result<(), Error> {
        let _ = self
            .deadline_tx
            .send(Instant::now() + COMMAND_TIMEOUT)
            .await;

        let line = match framing::read_line(
            &mut self.io,
            MAX_COMMAND_LINE,
            b"\n",
        )
        .await
        {
            Ok(line) => line,
            Err(LineError::TooLong) => {
                warn!("{} Command line too long", self.log_prefix);
                self.send_reply(Final, pc::CommandSyntaxError, "Line too long")
                    .await?;
                return self.resync().await;
            },
            Err(LineError::NoDelimiter) => {
                // Clean EOF from the peer.
                self.quit = true;
                return Ok(());
            },
            Err(LineError::Io(e)) => return Err(e.into()),
        };

        let line = String::from_utf8_lossy(&line);
        let line = line.trim();
        if line.is_empty() {
            // Tolerate stray keepalives; no reply.
            return Ok(());
        }

        match Command::parse(line) {
            Command::Helo(domain) => self.cmd_helo(domain).await,
            Command::Ehlo(domain) => self.cmd_ehlo(domain).await,
            Command::Mail(from) => self.cmd_mail(from).await,
            Command::Rcpt(to) => self.cmd_rcpt(to).await,
            Command::Data => self.cmd_data().await,
            Command::Rset => self.cmd_rset().await,
            Command::Noop => self.send_reply(Final, pc::Ok, "OK").await,
            Command::Quit => self.cmd_quit().await,
            Command::Vrfy(_)
            | Command::Expn(_)
            | Command::Send
            | Command::Soml
            | Command::Saml => {
                self.send_reply(
                    Final,
                    pc::CommandNotImplemented,
                    "Command not implemented",
                )
                .await
            },
            Command::Auth(mechanism, initial) => {
                self.cmd_auth(mechanism, initial).await
            },
            Command::StartTls => self.cmd_start_tls().await,
            Command::Unknown(verb) => {
                warn!("{} Command unrecognized: {:?}", self.log_prefix, verb);
                self.send_reply(
                    Final,
                    pc::CommandSyntaxError,
                    "Command unrecognized",
                )
                .await
            },
            Command::Invalid(verb, detail) => {
                warn!("{} Could not parse {} command", self.log_prefix, verb);
                self.send_reply(Final, pc::ParameterSyntaxError, detail).await
            },
        }
    }

    /// Discards input to the next newline after an overlong line, so the
    /// next command starts on a line boundary.
    async fn resync(&mut self) -> Result<(), Error> {
        match framing::skip_to_newline(&mut self.io).await {
            Ok(()) => Ok(()),
            Err(LineError::Io(e)) => Err(e.into()),
            Err(_) => {
                // The stream ended while resynchronising.
                self.quit = true;
                Ok(())
            },
        }
    }

    async fn cmd_helo(&mut self, domain: String) -> Result<(), Error> {
        if domain.is_empty() {
            warn!("{} No hostname given in HELO", self.log_prefix);
        }
        self.log_prefix.set_helo(domain.clone());
        info!("{} SMTP HELO", self.log_prefix);

        self.greeted = true;
        self.extended = false;
        self.peer_domain = domain;

        let host_name = self.srv.config.host_name.clone();
        self.send_reply(Final, pc::Ok, &host_name).await
    }

    async fn cmd_ehlo(&mut self, domain: String) -> Result<(), Error> {
        if domain.is_empty() {
            warn!("{} No hostname given in EHLO", self.log_prefix);
        }
        self.log_prefix.set_helo(domain.clone());
        info!("{} SMTP EHLO", self.log_prefix);

        // RFC 5321 §4.1.4: an EHLO later in the session resets the state
        // exactly as if RSET had been issued.
        self.reset_envelope();
        self.greeted = true;
        self.extended = true;
        self.peer_domain = domain;

        let extensions = self
            .srv
            .role
            .extensions(self.srv.ssl_acceptor.is_some(), self.tls());
        let host_name = self.srv.config.host_name.clone();
        self.send_reply(
            Delayable.or_final(extensions.is_empty()),
            pc::Ok,
            &host_name,
        )
        .await?;

        for (ix, extension) in extensions.iter().enumerate() {
            self.send_reply(
                Delayable.or_final(ix + 1 == extensions.len()),
                pc::Ok,
                extension,
            )
            .await?;
        }

        Ok(())
    }

    async fn cmd_mail(&mut self, from: MailAddress) -> Result<(), Error> {
        if !self.greeted {
            warn!("{} MAIL without prior HELO", self.log_prefix);
        }

        if self.srv.role.requires_auth_for_mail() && !self.authenticated {
            warn!("{} Rejected MAIL without authentication", self.log_prefix);
            return self
                .send_reply(
                    Final,
                    pc::AuthenticationRequired,
                    "Authentication required",
                )
                .await;
        }

        if self.from.is_some() {
            warn!("{} MAIL FROM already specified", self.log_prefix);
            return self
                .send_reply(
                    Final,
                    pc::BadSequenceOfCommands,
                    "Sender already specified",
                )
                .await;
        }

        if let Err((code, text)) = self.srv.role.validate_from(&from) {
            warn!("{} Rejected MAIL FROM:<{}>", self.log_prefix, from);
            return self.send_reply(Final, code, text).await;
        }

        info!("{} From: {}", self.log_prefix, from);
        self.from = Some(from);
        self.send_reply(Final, pc::Ok, "OK").await
    }

    async fn cmd_rcpt(&mut self, to: MailAddress) -> Result<(), Error> {
        if self.from.is_none() {
            return self
                .send_reply(
                    Final,
                    pc::BadSequenceOfCommands,
                    "Need MAIL before RCPT",
                )
                .await;
        }

        if self.to.len() >= MAX_RECIPIENTS {
            warn!("{} Rejected recipient over limit", self.log_prefix);
            return self
                .send_reply(
                    Final,
                    pc::InsufficientStorage,
                    "Too many recipients",
                )
                .await;
        }

        info!("{} To: {}", self.log_prefix, to);
        self.to.push(to);
        self.send_reply(Final, pc::Ok, "OK").await
    }

    async fn cmd_data(&mut self) -> Result<(), Error> {
        if self.from.is_none() {
            return self
                .send_reply(
                    Final,
                    pc::BadSequenceOfCommands,
                    "Need MAIL before DATA",
                )
                .await;
        }
        if self.to.is_empty() {
            return self
                .send_reply(
                    Final,
                    pc::BadSequenceOfCommands,
                    "Need RCPT before DATA",
                )
                .await;
        }

        self.send_reply(Final, pc::StartMailInput, "Accepting mail input")
            .await?;

        let _ = self
            .deadline_tx
            .send(Instant::now() + DATA_TIMEOUT)
            .await;

        match framing::read_dot_stuffed(&mut self.io, MAX_MESSAGE_SIZE).await {
            Ok(body) => self.msg = body,
            Err(BodyError::TooLarge) => {
                warn!(
                    "{} Message larger than {} bytes, rejecting",
                    self.log_prefix, MAX_MESSAGE_SIZE,
                );
                framing::drain_dot_stuffed(&mut self.io).await?;
                self.reset_envelope();
                return self
                    .send_reply(
                        Final,
                        pc::ExceededStorageAllocation,
                        "Too much mail data",
                    )
                    .await;
            },
            Err(BodyError::Io(e)) => return Err(e.into()),
        }

        let mail = Mail {
            from: self.from.take().unwrap(),
            to: std::mem::take(&mut self.to),
            body: std::mem::take(&mut self.msg),
        };
        info!(
            "{} Received {} byte(s) for {} recipient(s) from {} ({})",
            self.log_prefix,
            mail.body.len(),
            mail.to.len(),
            if self.peer_domain.is_empty() {
                "<unknown>"
            } else {
                &self.peer_domain
            },
            if self.extended { "ESMTP" } else { "SMTP" },
        );
        self.srv.handler.deliver(mail);

        self.reset_envelope();
        self.send_reply(Final, pc::Ok, "OK").await
    }

    async fn cmd_rset(&mut self) -> Result<(), Error> {
        self.reset_envelope();
        self.send_reply(Final, pc::Ok, "OK").await
    }

    async fn cmd_quit(&mut self) -> Result<(), Error> {
        info!("{} Closing connection", self.log_prefix);
        self.quit = true;
        // The reply is best-effort; the client may close without reading.
        let _ = self.send_reply(Final, pc::ServiceClosing, "Bye!").await;
        Ok(())
    }

    async fn cmd_start_tls(&mut self) -> Result<(), Error> {
        if !self.srv.role.offers_extension("STARTTLS") {
            warn!(
                "{} Command unrecognized: \"STARTTLS\"",
                self.log_prefix,
            );
            return self
                .send_reply(
                    Final,
                    pc::CommandSyntaxError,
                    "Command unrecognized",
                )
                .await;
        }

        if self.tls() {
            return self
                .send_reply(Final, pc::CommandNotImplemented, "Already in tls")
                .await;
        }

        let Some(acceptor) = self.ssl_acceptor.take() else {
            return self
                .send_reply(
                    Final,
                    pc::CommandNotImplemented,
                    "TLS not supported",
                )
                .await;
        };

        self.send_reply(Final, pc::ServiceReady, "Go ahead").await?;

        info!("{} Start TLS handshake", self.log_prefix);
        if let Err(e) = self.io.get_mut().ssl_accept(&acceptor).await {
            warn!("{} TLS handshake failed: {}", self.log_prefix, e);
            let _ = self
                .send_reply(
                    Final,
                    pc::ActionNotTakenPermanent,
                    "Handshake error",
                )
                .await;
            return Err(e);
        }

        info!(
            "{} TLS handshake completed: {}",
            self.log_prefix,
            self.io.get_ref().ssl_string().unwrap_or_default(),
        );

        // Everything learned over cleartext starts over on the encrypted
        // stream; only the TLS state itself survives.
        self.greeted = false;
        self.extended = false;
        self.authenticated = false;
        self.peer_domain.clear();
        self.reset_envelope();
        Ok(())
    }

    async fn cmd_auth(
        &mut self,
        mechanism: String,
        initial: Option<String>,
    ) -> Result<(), Error> {
        if !self.srv.role.offers_extension("AUTH") {
            warn!("{} Command unrecognized: \"AUTH\"", self.log_prefix);
            return self
                .send_reply(
                    Final,
                    pc::CommandSyntaxError,
                    "Command unrecognized",
                )
                .await;
        }

        if !self.tls() && self.srv.ssl_acceptor.is_some() {
            warn!("{} Rejected AUTH without TLS", self.log_prefix);
            return self
                .send_reply(
                    Final,
                    pc::CommandNotImplemented,
                    "Enable tls before sending AUTH",
                )
                .await;
        }

        if self.authenticated {
            return self
                .send_reply(
                    Final,
                    pc::BadSequenceOfCommands,
                    "Already authenticated",
                )
                .await;
        }

        if "LOGIN" != mechanism {
            warn!(
                "{} Unsupported AUTH mechanism {:?}",
                self.log_prefix, mechanism,
            );
            return self
                .send_reply(
                    Final,
                    pc::CommandParameterNotImplemented,
                    "Not supported",
                )
                .await;
        }

        // RFC 4954 permits the first credential as an initial response on
        // the AUTH line itself; otherwise it is requested by challenge.
        let username = match initial {
            Some(initial) => match base64::decode(initial.trim()) {
                Ok(username) => username,
                Err(_) => {
                    warn!(
                        "{} Base64 decoding error in AUTH initial response",
                        self.log_prefix,
                    );
                    return self
                        .send_reply(
                            Final,
                            pc::CommandSyntaxError,
                            "Not base64",
                        )
                        .await;
                },
            },
            None => match self.read_auth_response("Username:").await? {
                Some(username) => username,
                None => return Ok(()),
            },
        };

        let password = match self.read_auth_response("Password:").await? {
            Some(password) => password,
            None => return Ok(()),
        };

        let (Ok(username), Ok(password)) =
            (String::from_utf8(username), String::from_utf8(password))
        else {
            warn!("{} Non-UTF-8 credentials", self.log_prefix);
            return self
                .send_reply(
                    Final,
                    pc::AuthenticationCredentialsInvalid,
                    "Authentication failed",
                )
                .await;
        };

        let valid = self
            .srv
            .users
            .as_ref()
            .is_some_and(|db| db.check_credentials(&username, &password));

        if valid {
            self.log_prefix.set_user(username);
            info!("{} Authentication succeeded", self.log_prefix);
            self.authenticated = true;
            self.send_reply(Final, pc::AuthenticationSucceeded, "OK").await
        } else {
            warn!(
                "{} Authentication failed for {:?}",
                self.log_prefix, username,
            );
            self.send_reply(
                Final,
                pc::AuthenticationCredentialsInvalid,
                "Authentication failed",
            )
            .await
        }
    }

    /// Sends a 334 challenge and reads one base64-encoded response line.
    ///
    /// `Ok(None)` means the exchange was aborted; a reply has already been
    /// sent and `authenticated` is untouched.
    async fn read_auth_response(
        &mut self,
        challenge: &str,
    ) -> Result<Option<Vec<u8>>, Error> {
        let encoded = base64::encode(challenge);
        self.send_reply(Final, pc::ServerChallenge, &encoded).await?;

        let line = match framing::read_line(
            &mut self.io,
            MAX_COMMAND_LINE,
            b"\n",
        )
        .await
        {
            Ok(line) => line,
            Err(LineError::TooLong) => {
                warn!(
                    "{} Authentication exchange line too long",
                    self.log_prefix,
                );
                self.send_reply(Final, pc::CommandSyntaxError, "Line too long")
                    .await?;
                self.resync().await?;
                return Ok(None);
            },
            Err(LineError::NoDelimiter) => {
                self.quit = true;
                return Ok(None);
            },
            Err(LineError::Io(e)) => return Err(e.into()),
        };

        let text = String::from_utf8_lossy(&line);
        match base64::decode(text.trim()) {
            Ok(decoded) => Ok(Some(decoded)),
            Err(_) => {
                warn!("{} Base64 decoding error", self.log_prefix);
                self.send_reply(Final, pc::CommandSyntaxError, "Not base64")
                    .await?;
                Ok(None)
            },
        }
    }

    fn tls(&self) -> bool {
        self.io.get_ref().is_ssl()
    }

    fn reset_envelope(&mut self) {
        self.from = None;
        self.to.clear();
        self.msg.clear();
    }

    async fn send_reply(
        &mut self,
        kind: ResponseKind,
        code: StatusCode,
        text: &str,
    ) -> Result<(), Error> {
        if pc::ServiceClosing == code || pc::ServiceNotAvailableClosing == code
        {
            self.quit = true;
        }

        let line =
            format!("{}{}{}\r\n", code as u16, kind.indicator(), text);
        self.io.write_all(line.as_bytes()).await?;
        match kind {
            Final => self.io.flush().await?,
            Delayable => (),
        }

        Ok(())
    }
}

// Runs until either the deadline channel is closed or the current deadline
// has expired. Used to force-close idle connections.
async fn idle_timer(mut deadline_rx: mpsc::Receiver<Instant>) {
    let mut deadline = Instant::now() + Duration::from_secs(30);

    loop {
        match tokio::time::timeout_at(deadline.into(), deadline_rx.recv())
            .await
        {
            Err(_) => return,   // Timed out
            Ok(None) => return, // Done
            Ok(Some(d)) => deadline = d,
        }
    }
}
