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

use std::path::PathBuf;
use std::process;

use log::error;
use structopt::StructOpt;

use crate::smtp::{Config, Server};
use crate::users::{User, UserDb};

#[derive(StructOpt)]
#[structopt(max_term_width = 80)]
enum Command {
    /// Serve as a Mail Transfer Agent, accepting inbound mail from peer
    /// servers.
    Mta(CommonOptions),
    /// Serve as a Mail Submission Agent, accepting mail from
    /// authenticated clients.
    Msa(CommonOptions),
    /// Manage the user database.
    User(UserSubcommand),
}

#[derive(StructOpt)]
struct CommonOptions {
    /// Path of the JSON configuration file.
    #[structopt(long, parse(from_os_str), default_value = "pistolet.json")]
    config: PathBuf,
}

#[derive(StructOpt)]
enum UserSubcommand {
    /// Create a user in the user database, creating the database if it
    /// does not exist yet.
    Add(UserAddOptions),
}

#[derive(StructOpt)]
struct UserAddOptions {
    /// Path of the JSON user database.
    #[structopt(long, parse(from_os_str), default_value = "users.json")]
    db: PathBuf,

    /// Mail address of the user.
    #[structopt(long)]
    email: Option<String>,

    /// Name the user authenticates with.
    name: String,

    /// Password of the user.
    password: String,
}

pub fn main() {
    let command = Command::from_args();
    crate::init_simple_log();

    match command {
        Command::Mta(options) => serve(options, false),
        Command::Msa(options) => serve(options, true),
        Command::User(UserSubcommand::Add(options)) => user_add(options),
    }
}

fn serve(options: CommonOptions, msa: bool) {
    let config = match Config::load(&options.config) {
        Ok(config) => config,
        Err(e) => {
            error!(
                "Unable to load configuration from '{}': {}",
                options.config.display(),
                e,
            );
            process::exit(1);
        },
    };

    let server = match if msa {
        Server::new_msa(config)
    } else {
        Server::new_mta(config)
    } {
        Ok(server) => server,
        Err(e) => {
            error!("Unable to set up server: {}", e);
            process::exit(1);
        },
    };

    run_server(server);
}

#[tokio::main(flavor = "current_thread")]
async fn run_server(server: Server) {
    let local = tokio::task::LocalSet::new();
    let result = local.run_until(server.listen_and_serve()).await;
    // Let in-flight sessions complete before tearing the process down.
    local.await;

    if let Err(e) = result {
        error!("Server terminated: {}", e);
        process::exit(1);
    }
}

fn user_add(options: UserAddOptions) {
    let mut db = if options.db.exists() {
        match UserDb::load(&options.db) {
            Ok(db) => db,
            Err(e) => {
                error!(
                    "Unable to load user database from '{}': {}",
                    options.db.display(),
                    e,
                );
                process::exit(1);
            },
        }
    } else {
        UserDb::default()
    };

    let name = options.name.clone();
    let result = db
        .add(User {
            name: options.name,
            email: options.email,
            password: options.password,
        })
        .and_then(|_| db.save(&options.db));

    match result {
        Ok(()) => println!("User {} added to {}", name, options.db.display()),
        Err(e) => {
            error!("Unable to add user: {}", e);
            process::exit(1);
        },
    }
}
