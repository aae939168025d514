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

use std::any::Any;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::pin::Pin;
use std::rc::Rc;
use std::task;

use openssl::ssl::{SslAcceptor, SslStream};
use tokio::io::{unix::AsyncFd, AsyncRead, AsyncWrite, ReadBuf};

use crate::support::error::Error;

/// The main type for doing async I/O on a server connection.
///
/// This fulfils two roles:
/// - Supporting STARTTLS, i.e. switching from cleartext to TLS in the
///   middle of the byte stream, without giving up the socket.
/// - Driving OpenSSL's synchronous `SslStream` from Tokio readiness
///   notifications.
///
/// The socket passed to `new_owned_socket` is owned by the `ServerIo` and
/// closed when it is dropped.
pub struct ServerIo {
    fd: Rc<AsyncFd<RawFd>>,
    mode: Mode,
    _owned: Rc<dyn Any>,
}

enum Mode {
    Cleartext(FdRw),
    Ssl(SslStream<FdRw>),
}

impl ServerIo {
    /// Sets up a `ServerIo` over the given connected socket.
    ///
    /// This only fails if making the socket non-blocking fails or if it
    /// cannot be registered with the Tokio reactor.
    pub fn new_owned_socket(sock: impl AsRawFd + Any) -> Result<Self, Error> {
        let fd = sock.as_raw_fd();
        nix::fcntl::fcntl(
            fd,
            nix::fcntl::F_SETFL(nix::fcntl::OFlag::O_NONBLOCK),
        )?;

        let fd = Rc::new(AsyncFd::with_interest(
            fd,
            tokio::io::Interest::READABLE | tokio::io::Interest::WRITABLE,
        )?);

        Ok(Self {
            fd: Rc::clone(&fd),
            mode: Mode::Cleartext(FdRw(fd)),
            _owned: Rc::new(sock),
        })
    }

    pub fn is_ssl(&self) -> bool {
        matches!(self.mode, Mode::Ssl(_))
    }

    /// Describes the negotiated TLS session, or `None` in cleartext mode.
    pub fn ssl_string(&self) -> Option<String> {
        match self.mode {
            Mode::Cleartext(..) => None,
            Mode::Ssl(ref stream) => {
                let ssl = stream.ssl();
                let cipher = ssl.current_cipher();
                Some(format!(
                    "{tls_version}:{cipher}:{strength}",
                    tls_version = ssl.version_str(),
                    cipher = cipher.map_or("NONE", |c| c.name()),
                    strength = cipher.map_or(0, |c| c.bits().algorithm),
                ))
            },
        }
    }

    /// Performs server-side TLS setup with the given acceptor.
    ///
    /// On success, all further reads and writes go through the TLS session.
    /// On failure, the connection is left in an unusable state and should be
    /// closed.
    pub async fn ssl_accept(
        &mut self,
        acceptor: &SslAcceptor,
    ) -> Result<(), Error> {
        let mut result = acceptor.accept(FdRw(Rc::clone(&self.fd)));

        // OpenSSL tells us which direction it is blocked on; wait for that
        // readiness, clear it so Tokio polls the FD again, and take another
        // run through the handshake.
        loop {
            match result {
                Ok(stream) => {
                    self.mode = Mode::Ssl(stream);
                    return Ok(());
                },

                Err(openssl::ssl::HandshakeError::SetupFailure(e)) => {
                    return Err(e.into());
                },

                Err(openssl::ssl::HandshakeError::Failure(mhss)) => {
                    return Err(mhss_to_error(mhss));
                },

                Err(openssl::ssl::HandshakeError::WouldBlock(mhss)) => {
                    match mhss.error().code() {
                        openssl::ssl::ErrorCode::WANT_READ => {
                            let mut guard = self.fd.readable().await?;
                            guard.clear_ready();
                            result = mhss.handshake();
                        },

                        openssl::ssl::ErrorCode::WANT_WRITE => {
                            let mut guard = self.fd.writable().await?;
                            guard.clear_ready();
                            result = mhss.handshake();
                        },

                        _ => return Err(mhss_to_error(mhss)),
                    }
                },
            }
        }
    }
}

/// Called when an error is returned from `ssl_read` or `ssl_write`.
///
/// The main purpose of this function is to handle the cases where OpenSSL
/// returns `WANT_READ` or `WANT_WRITE`: it arranges a readiness check for
/// the FD and clears its readiness status if currently set. It is critical
/// that this *only* be called immediately after `ssl_read` or `ssl_write`,
/// with no await points in between, so that we can be certain that the
/// `WANT_READ` or `WANT_WRITE` indicate that there is absolutely no data on
/// the socket.
fn poll_rw_ssl_error(
    fd: &AsyncFd<RawFd>,
    ctx: &mut task::Context<'_>,
    e: openssl::ssl::Error,
) -> task::Poll<io::Result<()>> {
    match e.code() {
        openssl::ssl::ErrorCode::WANT_READ => {
            futures::ready!(fd.poll_read_ready(ctx))?.clear_ready();
            // Call again to get Tokio to actually watch for more changes.
            futures::ready!(fd.poll_read_ready(ctx))?.retain_ready();
            // If we get here, the FD has somehow become ready meanwhile.
            task::Poll::Ready(Ok(()))
        },

        openssl::ssl::ErrorCode::WANT_WRITE => {
            futures::ready!(fd.poll_write_ready(ctx))?.clear_ready();
            futures::ready!(fd.poll_write_ready(ctx))?.retain_ready();
            task::Poll::Ready(Ok(()))
        },

        // As can be seen in the `fmt::Display` implementation of
        // `openssl::ssl::Error`, EOF is represented by the SYSCALL error
        // code with no associated IO error, and into_io_error() doesn't
        // bother to translate that.
        openssl::ssl::ErrorCode::SYSCALL => task::Poll::Ready(Err(e
            .into_io_error()
            .unwrap_or_else(|_| io::ErrorKind::UnexpectedEof.into()))),

        _ => task::Poll::Ready(Err(e
            .into_io_error()
            .unwrap_or_else(|e| io::Error::new(io::ErrorKind::Other, e)))),
    }
}

impl AsyncRead for ServerIo {
    fn poll_read(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> task::Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.mode {
            Mode::Cleartext(ref mut f) => Pin::new(f).poll_read(ctx, buf),
            Mode::Ssl(ref mut ssl) => loop {
                match ssl.ssl_read(buf.initialize_unfilled()) {
                    Ok(n) => {
                        buf.advance(n);
                        return task::Poll::Ready(Ok(()));
                    },

                    Err(e) => {
                        futures::ready!(poll_rw_ssl_error(&this.fd, ctx, e))?
                    },
                }
            },
        }
    }
}

impl AsyncWrite for ServerIo {
    fn poll_write(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
        buf: &[u8],
    ) -> task::Poll<io::Result<usize>> {
        let this = self.get_mut();
        match this.mode {
            Mode::Cleartext(ref mut f) => Pin::new(f).poll_write(ctx, buf),
            Mode::Ssl(ref mut ssl) => loop {
                match ssl.ssl_write(buf) {
                    Ok(n) => return task::Poll::Ready(Ok(n)),
                    Err(e) => {
                        futures::ready!(poll_rw_ssl_error(&this.fd, ctx, e))?
                    },
                }
            },
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        _ctx: &mut task::Context<'_>,
    ) -> task::Poll<io::Result<()>> {
        // OpenSSL doesn't buffer anything itself and the cleartext path has
        // no buffers either, so there's nothing to do.
        task::Poll::Ready(Ok(()))
    }

    /// If there is a TLS session, the session is shut down, returning the
    /// socket to cleartext.
    fn poll_shutdown(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
    ) -> task::Poll<io::Result<()>> {
        let this = self.get_mut();
        let done = if let Mode::Ssl(ref mut ssl) = this.mode {
            loop {
                match ssl.shutdown() {
                    Ok(openssl::ssl::ShutdownResult::Received) => break,
                    Ok(openssl::ssl::ShutdownResult::Sent) => {
                        return task::Poll::Pending;
                    },

                    Err(e) => {
                        futures::ready!(poll_rw_ssl_error(&this.fd, ctx, e))?
                    },
                }
            }

            true
        } else {
            false
        };

        if done {
            this.mode = Mode::Cleartext(FdRw(Rc::clone(&this.fd)));
        }

        task::Poll::Ready(Ok(()))
    }
}

/// Implements both the synchronous and asynchronous read and write traits
/// atop the raw file descriptor.
///
/// The synchronous implementations are what OpenSSL drives; they return
/// `WouldBlock` errors which surface as `WANT_READ`/`WANT_WRITE` and are
/// handled by the async layer above.
struct FdRw(Rc<AsyncFd<RawFd>>);

impl io::Read for FdRw {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        let fd = *self.0.get_ref();
        nix::unistd::read(fd, dst).map_err(nix_to_io)
    }
}

impl io::Write for FdRw {
    fn write(&mut self, src: &[u8]) -> io::Result<usize> {
        let fd = *self.0.get_ref();
        nix::unistd::write(fd, src).map_err(nix_to_io)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AsyncRead for FdRw {
    fn poll_read(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> task::Poll<io::Result<()>> {
        loop {
            let mut guard = futures::ready!(self.0.poll_read_ready(ctx))?;

            match guard.try_io(|fd| {
                nix::unistd::read(*fd.get_ref(), buf.initialize_unfilled())
                    .map_err(nix_to_io)
            }) {
                Ok(Ok(n)) => {
                    buf.advance(n);
                    return task::Poll::Ready(Ok(()));
                },

                Ok(Err(e)) => return task::Poll::Ready(Err(e)),

                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for FdRw {
    fn poll_write(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
        buf: &[u8],
    ) -> task::Poll<io::Result<usize>> {
        loop {
            let mut guard = futures::ready!(self.0.poll_write_ready(ctx))?;

            if let Ok(result) = guard.try_io(|fd| {
                nix::unistd::write(*fd.get_ref(), buf).map_err(nix_to_io)
            }) {
                return task::Poll::Ready(result);
            }
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        _ctx: &mut task::Context<'_>,
    ) -> task::Poll<io::Result<()>> {
        task::Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        _ctx: &mut task::Context<'_>,
    ) -> task::Poll<io::Result<()>> {
        task::Poll::Ready(Ok(()))
    }
}

fn nix_to_io(e: nix::Error) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}

fn mhss_to_error(mhss: openssl::ssl::MidHandshakeSslStream<FdRw>) -> Error {
    let e = mhss.into_error();
    if let Some(es) = e.ssl_error() {
        Error::Ssl(es.clone())
    } else {
        match e.into_io_error() {
            Ok(io) => Error::Io(io),
            Err(e) if e.code() == openssl::ssl::ErrorCode::SYSCALL => {
                Error::Io(io::ErrorKind::UnexpectedEof.into())
            },
            Err(e) => Error::Io(io::Error::new(io::ErrorKind::Other, e)),
        }
    }
}
