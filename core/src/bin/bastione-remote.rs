/*
 * bastione-remote.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Bastione, an SMTP server and client suite.
 *
 * Bastione is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Bastione is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Bastione.  If not, see <http://www.gnu.org/licenses/>.
 */

//! The outbound relay client, a drop-in for qmail-remote:
//! `bastione-remote <host> <sender> <recipient>...` with the message on
//! fd 0 and per-recipient status bytes going to fd 1.

use std::io::Read;

use tracing::error;

use bastione_core::dns::SystemResolver;
use bastione_core::remote::{deliver, write_status, RemoteConfig};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    let base = std::env::var_os("AUTOQMAIL")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| std::path::PathBuf::from("/var/qmail"));
    if std::env::set_current_dir(&base).is_err() {
        write_status("Z4.3.0 Configuration error.");
        return;
    }

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 4 {
        error!("too few arguments");
        write_status("Zinternal error: invalid arguments");
        return;
    }

    let cfg = match RemoteConfig::load(&base) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "configuration error");
            write_status("Z4.3.0 Configuration error.");
            return;
        }
    };

    let mut msgdata = Vec::new();
    if std::io::stdin().read_to_end(&mut msgdata).is_err() {
        error!("can't read() input");
        write_status("Zinternal error: can't read() input");
        return;
    }

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime construction cannot fail");
    rt.block_on(async {
        let dns = match SystemResolver::from_system() {
            Ok(d) => d,
            Err(_) => {
                write_status("Z4.3.0 Configuration error.");
                return;
            }
        };
        deliver(&cfg, &dns, &args[1], &args[2], &args[3..], &msgdata).await;
    });
}
