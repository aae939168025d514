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

use std::fmt;

use lazy_static::lazy_static;
use regex::Regex;

use super::address::MailAddress;

/// One parsed command line.
///
/// Parsing is total: anything that is not a well-formed command comes back
/// as `Unknown` (unrecognised verb) or `Invalid` (recognised verb, bad
/// arguments), which the session maps to 500 and 501 respectively.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// HELO origin-host
    Helo(String),
    /// EHLO origin-host
    Ehlo(String),
    /// MAIL FROM:<return-path>
    Mail(MailAddress),
    /// RCPT TO:<forward-path>
    Rcpt(MailAddress),
    /// DATA
    Data,
    /// RSET
    Rset,
    /// NOOP
    Noop,
    /// QUIT
    Quit,
    /// VRFY string (not implemented, 502)
    Vrfy(String),
    /// EXPN list (not implemented, 502)
    Expn(String),
    /// SEND (obsolete, 502)
    Send,
    /// SOML (obsolete, 502)
    Soml,
    /// SAML (obsolete, 502)
    Saml,
    /// AUTH mechanism [initial-response]
    Auth(String, Option<String>),
    /// STARTTLS
    StartTls,
    /// An unrecognised verb.
    Unknown(String),
    /// A recognised verb with arguments we could not make sense of.
    Invalid(&'static str, &'static str),
}

lazy_static! {
    // The angle-bracketed address requires a non-empty local part and
    // domain; trailing parameters (e.g. SIZE=..) are tolerated and ignored.
    static ref RX_MAIL_FROM: Regex =
        Regex::new("^(?i)FROM: ?<([^>]+)>").unwrap();
    // RCPT TO additionally tolerates an RFC 5321 source route, which is
    // stripped.
    static ref RX_RCPT_TO: Regex =
        Regex::new("^(?i)TO: ?<(?:@[^:>]+:)?([^>]+)>").unwrap();
}

impl Command {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        let (verb, rest) = match line.find(' ') {
            Some(ix) => (&line[..ix], line[ix + 1..].trim()),
            None => (line, ""),
        };
        let verb = verb.to_ascii_uppercase();
        let args = rest
            .split(' ')
            .filter(|a| !a.is_empty())
            .collect::<Vec<_>>();

        match verb.as_str() {
            "HELO" => Command::Helo(first_arg(&args)),
            "EHLO" => Command::Ehlo(first_arg(&args)),
            "MAIL" => parse_path(&RX_MAIL_FROM, rest)
                .map(Command::Mail)
                .unwrap_or(Command::Invalid("MAIL", "Invalid syntax")),
            "RCPT" => parse_path(&RX_RCPT_TO, rest)
                .map(Command::Rcpt)
                .unwrap_or(Command::Invalid("RCPT", "Invalid syntax")),
            "DATA" => Command::Data,
            "RSET" => Command::Rset,
            "NOOP" => Command::Noop,
            "QUIT" => Command::Quit,
            "VRFY" => Command::Vrfy(rest.to_owned()),
            "EXPN" => Command::Expn(rest.to_owned()),
            "SEND" => Command::Send,
            "SOML" => Command::Soml,
            "SAML" => Command::Saml,
            "AUTH" => match args.as_slice() {
                [mechanism] => {
                    Command::Auth(mechanism.to_ascii_uppercase(), None)
                },
                [mechanism, initial] => Command::Auth(
                    mechanism.to_ascii_uppercase(),
                    Some((*initial).to_owned()),
                ),
                _ => Command::Invalid("AUTH", "Error parsing arguments"),
            },
            "STARTTLS" => Command::StartTls,
            _ => Command::Unknown(verb),
        }
    }
}

fn first_arg(args: &[&str]) -> String {
    args.first().copied().unwrap_or("").to_owned()
}

fn parse_path(rx: &Regex, rest: &str) -> Option<MailAddress> {
    let cap = rx.captures(rest)?;
    cap.get(1).unwrap().as_str().parse().ok()
}

/// Renders the canonical wire form of a command. Commands produced by the
/// parser round-trip through this.
impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Command::Helo(ref domain) => write!(f, "HELO {}", domain),
            Command::Ehlo(ref domain) => write!(f, "EHLO {}", domain),
            Command::Mail(ref from) => {
                write!(f, "MAIL FROM:<{}>", from.addr_spec())
            },
            Command::Rcpt(ref to) => write!(f, "RCPT TO:<{}>", to.addr_spec()),
            Command::Data => write!(f, "DATA"),
            Command::Rset => write!(f, "RSET"),
            Command::Noop => write!(f, "NOOP"),
            Command::Quit => write!(f, "QUIT"),
            Command::Vrfy(ref param) => write!(f, "VRFY {}", param),
            Command::Expn(ref list) => write!(f, "EXPN {}", list),
            Command::Send => write!(f, "SEND"),
            Command::Soml => write!(f, "SOML"),
            Command::Saml => write!(f, "SAML"),
            Command::Auth(ref mechanism, None) => {
                write!(f, "AUTH {}", mechanism)
            },
            Command::Auth(ref mechanism, Some(ref initial)) => {
                write!(f, "AUTH {} {}", mechanism, initial)
            },
            Command::StartTls => write!(f, "STARTTLS"),
            Command::Unknown(ref verb) => write!(f, "{}", verb),
            Command::Invalid(verb, _) => write!(f, "{}", verb),
        }
    }
}
