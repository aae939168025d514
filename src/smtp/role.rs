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

use super::address::MailAddress;
use super::codes::StatusCode;

/// Which flavour of server this is. Fixed at construction; the session
/// consults it for the EHLO capability list, MAIL admission and which
/// extension verbs are recognised at all.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Mail Transfer Agent: accepts inbound mail from peer servers.
    Mta,
    /// Mail Submission Agent: accepts mail from authenticated clients.
    Msa,
}

impl Role {
    /// Short tag used in log prefixes.
    pub fn protocol_name(self) -> &'static str {
        match self {
            Role::Mta => "mta",
            Role::Msa => "msa",
        }
    }

    /// The capabilities advertised in the EHLO response, after the
    /// hostname line.
    ///
    /// STARTTLS disappears once the session is encrypted (RFC 3207);
    /// AUTH LOGIN is only offered over TLS, unless no TLS is configured
    /// at all.
    pub fn extensions(
        self,
        tls_configured: bool,
        tls_active: bool,
    ) -> Vec<&'static str> {
        match self {
            Role::Mta => vec![],
            Role::Msa => {
                let mut extensions = Vec::new();
                if tls_configured && !tls_active {
                    extensions.push("STARTTLS");
                }
                if tls_active || !tls_configured {
                    extensions.push("AUTH LOGIN");
                }
                extensions
            },
        }
    }

    /// Whether MAIL is only admitted after a successful AUTH.
    pub fn requires_auth_for_mail(self) -> bool {
        match self {
            Role::Mta => false,
            Role::Msa => true,
        }
    }

    /// Whether `verb` is recognised as an extension command for this
    /// role. Unclaimed verbs get the generic 500 reply.
    pub fn offers_extension(self, verb: &str) -> bool {
        match self {
            Role::Mta => false,
            Role::Msa => matches!(verb, "AUTH" | "STARTTLS"),
        }
    }

    /// Site policy check of the reverse-path. Both roles currently accept
    /// any address; reverse-DNS and SPF verification would hang off this
    /// hook.
    pub fn validate_from(
        self,
        _from: &MailAddress,
    ) -> Result<(), (StatusCode, &'static str)> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn mta_is_featureless() {
        assert!(Role::Mta.extensions(true, false).is_empty());
        assert!(Role::Mta.extensions(false, false).is_empty());
        assert!(!Role::Mta.requires_auth_for_mail());
        assert!(!Role::Mta.offers_extension("AUTH"));
        assert!(!Role::Mta.offers_extension("STARTTLS"));
    }

    #[test]
    fn msa_capability_matrix() {
        assert_eq!(
            vec!["STARTTLS"],
            Role::Msa.extensions(true, false),
        );
        assert_eq!(
            vec!["AUTH LOGIN"],
            Role::Msa.extensions(true, true),
        );
        assert_eq!(
            vec!["AUTH LOGIN"],
            Role::Msa.extensions(false, false),
        );
    }

    #[test]
    fn msa_claims_extension_verbs() {
        assert!(Role::Msa.requires_auth_for_mail());
        assert!(Role::Msa.offers_extension("AUTH"));
        assert!(Role::Msa.offers_extension("STARTTLS"));
        assert!(!Role::Msa.offers_extension("XYZZY"));
    }
}
