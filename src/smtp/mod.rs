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

//! The SMTP server: configuration, MTA/MSA construction and the accept
//! loop. The per-connection protocol engine lives in `session`.

pub mod address;
pub mod codes;
pub mod framing;
pub mod role;
mod session;
pub mod syntax;

#[cfg(test)]
mod integration_test_common;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use log::{error, info, warn};
use openssl::ssl::{SslAcceptor, SslFiletype, SslMethod};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

use crate::support::{
    async_io::ServerIo, error::Error, log_prefix::LogPrefix,
};
use crate::users::UserDb;
use self::address::MailAddress;
use self::role::Role;

/// The server configuration, loaded from a JSON file.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Config {
    /// The port to listen on.
    pub port: u16,
    /// The host name used in the greeting and the EHLO response. Also the
    /// bind address; empty means all interfaces.
    #[serde(default)]
    pub host_name: String,
    /// Path of the PEM private key. TLS is enabled when both `key` and
    /// `cert` are present.
    #[serde(default)]
    pub key: Option<PathBuf>,
    /// Path of the PEM certificate chain.
    #[serde(default)]
    pub cert: Option<PathBuf>,
    /// Path of the JSON user database used by AUTH.
    #[serde(default)]
    pub users: Option<PathBuf>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let file = fs::File::open(path)?;
        Ok(serde_json::from_reader(file)?)
    }
}

/// A completed mail transaction: the envelope negotiated by MAIL and RCPT
/// plus the decoded message bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mail {
    pub from: MailAddress,
    pub to: Vec<MailAddress>,
    pub body: Vec<u8>,
}

/// The downstream consumer of completed transactions. Queueing and
/// delivery happen behind this seam.
pub trait MailHandler {
    fn deliver(&self, mail: Mail);
}

/// The handler used when no other is installed: log the envelope summary
/// and drop the message.
struct LogOnlyHandler;

impl MailHandler for LogOnlyHandler {
    fn deliver(&self, mail: Mail) {
        info!(
            "Discarding {} byte(s) from {} for {} recipient(s); \
             no mail handler installed",
            mail.body.len(),
            mail.from,
            mail.to.len(),
        );
    }
}

/// Everything shared between the sessions of one server, all of it
/// read-only once the server starts.
pub(crate) struct ServerState {
    pub(crate) config: Config,
    pub(crate) role: Role,
    pub(crate) ssl_acceptor: Option<SslAcceptor>,
    pub(crate) users: Option<UserDb>,
    pub(crate) handler: Rc<dyn MailHandler>,
}

pub struct Server {
    state: Rc<ServerState>,
}

impl Server {
    /// Creates an MTA accepting inbound mail from peer servers.
    pub fn new_mta(config: Config) -> Result<Self, Error> {
        Self::new(config, Role::Mta, None)
    }

    /// Creates an MSA accepting authenticated submission. The user
    /// database named by the configuration is loaded eagerly.
    pub fn new_msa(config: Config) -> Result<Self, Error> {
        let users = match config.users {
            Some(ref path) => Some(UserDb::load(path)?),
            None => None,
        };
        Self::new(config, Role::Msa, users)
    }

    fn new(
        config: Config,
        role: Role,
        users: Option<UserDb>,
    ) -> Result<Self, Error> {
        let ssl_acceptor = match (&config.key, &config.cert) {
            (Some(key), Some(cert)) => Some(create_ssl_acceptor(key, cert)?),
            (None, None) => None,
            _ => return Err(Error::IncompleteTlsConfig),
        };

        if ssl_acceptor.is_some() {
            info!("Starting {} server with TLS support", role.protocol_name());
        } else {
            info!(
                "Starting {} server WITHOUT TLS support",
                role.protocol_name(),
            );
        }

        Ok(Server {
            state: Rc::new(ServerState {
                config,
                role,
                ssl_acceptor,
                users,
                handler: Rc::new(LogOnlyHandler),
            }),
        })
    }

    /// Replaces the downstream mail handler. Only possible before the
    /// first connection is served.
    pub fn set_handler(&mut self, handler: Rc<dyn MailHandler>) {
        Rc::get_mut(&mut self.state)
            .expect("set_handler called while serving")
            .handler = handler;
    }

    /// Binds the configured address and serves until the listener fails.
    pub async fn listen_and_serve(self) -> Result<(), Error> {
        let addr = if self.state.config.host_name.is_empty() {
            format!("0.0.0.0:{}", self.state.config.port)
        } else {
            format!(
                "{}:{}",
                self.state.config.host_name, self.state.config.port,
            )
        };

        let listener = TcpListener::bind(&addr).await?;
        info!("Listening on {}", addr);
        self.serve(listener).await
    }

    /// Accepts connections forever, one task per connection.
    ///
    /// Transient accept failures are logged and retried; anything else
    /// tears the loop down. Must run inside a `LocalSet`.
    pub async fn serve(self, listener: TcpListener) -> Result<(), Error> {
        loop {
            let (socket, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) if is_temporary_accept_error(&e) => {
                    warn!("Accept error: {}", e);
                    continue;
                },
                Err(e) => return Err(e.into()),
            };

            let _ = socket.set_nodelay(true);
            let state = Rc::clone(&self.state);
            tokio::task::spawn_local(async move {
                let log_prefix = LogPrefix::new(format!(
                    "{}:{}",
                    state.role.protocol_name(),
                    peer,
                ));
                info!("{} Connection established", log_prefix);

                let io = match socket
                    .into_std()
                    .map_err(Error::from)
                    .and_then(ServerIo::new_owned_socket)
                {
                    Ok(io) => io,
                    Err(e) => {
                        error!(
                            "{} Unable to set up connection: {}",
                            log_prefix, e,
                        );
                        return;
                    },
                };

                match session::run(io, state, log_prefix.clone()).await {
                    Ok(()) => {
                        info!("{} Normal client disconnect", log_prefix)
                    },
                    Err(e) => {
                        warn!("{} Abnormal client disconnect: {}", log_prefix, e)
                    },
                }
            });
        }
    }
}

fn is_temporary_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

fn create_ssl_acceptor(
    key: &Path,
    cert: &Path,
) -> Result<SslAcceptor, Error> {
    let mut acceptor =
        SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server())?;
    acceptor.set_private_key_file(key, SslFiletype::PEM)?;
    acceptor.set_certificate_chain_file(cert)?;
    acceptor.check_private_key()?;
    Ok(acceptor.build())
}
