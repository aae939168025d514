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
use std::str::FromStr;

/// A parsed envelope address.
///
/// The parser accepts the name-addr and addr-spec forms of RFC 5322 §3.4:
/// an optional display name (quoted string or a run of atoms) followed by
/// `<local@domain>`, or a bare `local@domain`. The local part may be a
/// quoted string; it is stored in decoded form. The split between local
/// part and domain is at the last unquoted `@`.
///
/// RFC 5321 §4.5.3.1 bounds are enforced: the local part is at most 64
/// octets, the domain at most 253, and the two together at most 254.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MailAddress {
    pub name: Option<String>,
    pub local: String,
    pub domain: String,
}

const MAX_LOCAL: usize = 64;
const MAX_DOMAIN: usize = 253;
const MAX_TOTAL: usize = 254;

impl MailAddress {
    pub fn new(local: String, domain: String) -> Result<Self, &'static str> {
        let addr = MailAddress {
            name: None,
            local,
            domain,
        };
        addr.validate()?;
        Ok(addr)
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if self.local.is_empty() {
            return Err("Local part empty");
        }
        if self.domain.is_empty() {
            return Err("Domain empty");
        }
        if self.local.len() > MAX_LOCAL {
            return Err("Local part too long");
        }
        if self.domain.len() > MAX_DOMAIN {
            return Err("Domain too long");
        }
        if self.local.len() + self.domain.len() > MAX_TOTAL {
            return Err("Address too long");
        }
        Ok(())
    }

    /// The `local@domain` form, quoting the local part if necessary.
    pub fn addr_spec(&self) -> String {
        if needs_quoting(&self.local) {
            format!("{}@{}", quoted(&self.local), self.domain)
        } else {
            format!("{}@{}", self.local, self.domain)
        }
    }
}

impl fmt::Display for MailAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.name {
            Some(ref name) if !name.is_empty() => {
                write!(f, "{} <{}>", quoted(name), self.addr_spec())
            },
            _ => write!(f, "{}", self.addr_spec()),
        }
    }
}

impl FromStr for MailAddress {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        let s = s.trim();

        let (name, addr) = match (s.find('<'), s.rfind('>')) {
            (Some(lt), Some(gt)) if lt < gt => {
                if !s[gt + 1..].trim().is_empty() {
                    return Err(());
                }
                (parse_display_name(s[..lt].trim())?, &s[lt + 1..gt])
            },
            (None, None) => (None, s),
            _ => return Err(()),
        };

        let (local, domain) = split_addr_spec(addr)?;

        if domain.is_empty()
            || domain.contains('@')
            || domain.contains(|c: char| c.is_whitespace() || c.is_control())
        {
            return Err(());
        }

        let mut parsed =
            MailAddress::new(local, domain.to_owned()).map_err(|_| ())?;
        parsed.name = name;
        Ok(parsed)
    }
}

/// Splits an addr-spec at the last `@` outside of a quoted local part,
/// decoding the local part if it is quoted.
fn split_addr_spec(addr: &str) -> Result<(String, &str), ()> {
    if let Some(rest) = addr.strip_prefix('"') {
        let mut local = String::new();
        let mut chars = rest.char_indices();
        loop {
            let Some((ix, c)) = chars.next() else {
                // Unterminated quoted string
                return Err(());
            };

            match c {
                '"' => {
                    let rest = &rest[ix + 1..];
                    let Some(domain) = rest.strip_prefix('@') else {
                        return Err(());
                    };
                    return Ok((local, domain));
                },
                '\\' => match chars.next() {
                    Some((_, escaped)) => local.push(escaped),
                    None => return Err(()),
                },
                c if c.is_control() => return Err(()),
                c => local.push(c),
            }
        }
    } else {
        let Some((local, domain)) = addr.rsplit_once('@') else {
            return Err(());
        };
        if local.contains(|c: char| c.is_whitespace() || c.is_control()) {
            return Err(());
        }
        Ok((local.to_owned(), domain))
    }
}

/// Parses an optional display name: either a quoted string or a bare run
/// of words, as the name part of a name-addr.
fn parse_display_name(name: &str) -> Result<Option<String>, ()> {
    if name.is_empty() {
        return Ok(None);
    }

    if let Some(rest) = name.strip_prefix('"') {
        let Some(inner) = rest.strip_suffix('"') else {
            return Err(());
        };
        let mut decoded = String::new();
        let mut chars = inner.chars();
        while let Some(c) = chars.next() {
            match c {
                '"' => return Err(()),
                '\\' => match chars.next() {
                    Some(escaped) => decoded.push(escaped),
                    None => return Err(()),
                },
                c => decoded.push(c),
            }
        }
        Ok(Some(decoded))
    } else {
        if name.contains(|c: char| c.is_control() || "<>\"".contains(c)) {
            return Err(());
        }
        Ok(Some(name.to_owned()))
    }
}

fn is_atext(c: char) -> bool {
    c.is_ascii_alphanumeric() || "!#$%&'*+-/=?^_`{|}~".contains(c)
}

fn needs_quoting(s: &str) -> bool {
    !s.split('.').all(|atom| {
        !atom.is_empty() && atom.chars().all(is_atext)
    })
}

fn quoted(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if '"' == c || '\\' == c {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}
