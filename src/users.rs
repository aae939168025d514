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

//! The JSON-backed user database consulted by AUTH LOGIN.
//!
//! This is deliberately primitive: a flat file mapping names to users,
//! loaded once at server construction and read-only from then on.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::support::error::Error;

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct User {
    /// The name the client authenticates with.
    pub name: String,
    /// The user's mail address.
    #[serde(default)]
    pub email: Option<String>,
    pub password: String,
}

impl User {
    pub fn check_password(&self, password: &str) -> bool {
        self.password == password
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct UserDb {
    pub users: BTreeMap<String, User>,
}

impl UserDb {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let input = fs::File::open(path)?;
        Ok(serde_json::from_reader(input)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), Error> {
        let output = serde_json::to_string_pretty(self)?;
        fs::write(path, output)?;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&User> {
        self.users.get(name)
    }

    pub fn add(&mut self, user: User) -> Result<(), Error> {
        if self.users.contains_key(&user.name) {
            return Err(Error::UserExists);
        }

        self.users.insert(user.name.clone(), user);
        Ok(())
    }

    pub fn check_credentials(&self, name: &str, password: &str) -> bool {
        self.get(name).is_some_and(|user| user.check_password(password))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_user(name: &str, password: &str) -> User {
        User {
            name: name.to_owned(),
            email: Some(format!("{}@example.com", name)),
            password: password.to_owned(),
        }
    }

    #[test]
    fn add_and_check_credentials() {
        let mut db = UserDb::default();
        db.add(test_user("zim", "hunter2")).unwrap();

        assert!(db.get("zim").is_some());
        assert!(db.get("dib").is_none());

        assert!(db.check_credentials("zim", "hunter2"));
        assert!(!db.check_credentials("zim", "hunter3"));
        assert!(!db.check_credentials("dib", "hunter2"));
    }

    #[test]
    fn duplicate_user_rejected() {
        let mut db = UserDb::default();
        db.add(test_user("zim", "hunter2")).unwrap();
        assert_matches!(
            Err(Error::UserExists),
            db.add(test_user("zim", "other")),
        );
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("users.json");

        let mut db = UserDb::default();
        db.add(test_user("zim", "hunter2")).unwrap();
        db.add(test_user("dib", "membrane")).unwrap();
        db.save(&path).unwrap();

        let reloaded = UserDb::load(&path).unwrap();
        assert_eq!(2, reloaded.users.len());
        assert!(reloaded.check_credentials("dib", "membrane"));
        assert_eq!(
            Some("zim@example.com"),
            reloaded.get("zim").and_then(|u| u.email.as_deref()),
        );
    }
}
