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
use std::sync::{Arc, Mutex};

/// Tracks text that should be included at the start of every log statement
/// for one connection.
///
/// Clones of a `LogPrefix` share the same underlying data.
#[derive(Clone)]
pub struct LogPrefix {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    connection: String,
    helo: Option<String>,
    user: Option<String>,
}

impl LogPrefix {
    pub fn new(connection: String) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                connection,
                helo: None,
                user: None,
            })),
        }
    }

    /// Records the domain the peer sent in HELO/EHLO.
    pub fn set_helo(&self, helo: String) {
        self.inner.lock().unwrap().helo = Some(helo);
    }

    /// Records the name the peer authenticated as.
    pub fn set_user(&self, user: String) {
        self.inner.lock().unwrap().user = Some(user);
    }
}

impl fmt::Display for LogPrefix {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let inner = self.inner.lock().unwrap();
        write!(f, "{}", inner.connection)?;
        if inner.helo.is_some() || inner.user.is_some() {
            write!(f, "[{}", inner.helo.as_deref().unwrap_or("<no-helo>"))?;
            if let Some(ref user) = inner.user {
                write!(f, " {}", user)?;
            }
            write!(f, "]")?;
        }

        Ok(())
    }
}
