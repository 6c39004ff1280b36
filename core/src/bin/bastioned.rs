/*
 * bastioned.rs
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

//! The inbound SMTP daemon. One session per process on the socket a
//! tcpserver-style spawner put on fd 0; optional arguments enable AUTH:
//! `bastioned <authhost> <checkpassword> <subprogram...>`.

use std::os::fd::FromRawFd;
use std::path::PathBuf;

use tracing::{error, warn};

use bastione_core::dns::{Resolver, SystemResolver};
use bastione_core::netio::{Conn, SmtpStream};
use bastione_core::smtpd::{Session, SessionEnd, SmtpdConfig, TransferState};

fn base_dir() -> PathBuf {
    std::env::var_os("AUTOQMAIL")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/var/qmail"))
}

async fn reverse_name(dns: &SystemResolver, state: &TransferState) -> String {
    match dns.ptr(&state.remote_ip).await {
        Ok(names) => names.into_iter().next().unwrap_or_default(),
        Err(_) => String::new(),
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    // EPIPE must surface as a write error, not kill the process
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    let base = base_dir();
    if std::env::set_current_dir(&base).is_err() {
        error!(dir = %base.display(), "cannot chdir to qmail directory");
        std::process::exit(1);
    }

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime construction cannot fail");
    let code = rt.block_on(run(&base));
    std::process::exit(code);
}

async fn run(base: &std::path::Path) -> i32 {
    let socket = unsafe { std::net::TcpStream::from_raw_fd(0) };
    if socket.set_nonblocking(true).is_err() {
        error!("fd 0 is not a socket");
        return 1;
    }
    let socket = match tokio::net::TcpStream::from_std(socket) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "cannot take over fd 0");
            return 1;
        }
    };

    let mut cfg = match SmtpdConfig::load(base) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "unable to read controls");
            // tell the client before giving up
            use tokio::io::AsyncWriteExt;
            let mut socket = socket;
            let _ = socket
                .write_all(b"421 4.3.5 unable to read controls\r\n")
                .await;
            return 1;
        }
    };

    // arguments switch on AUTH: hostname, checkpassword, subprogram
    let args: Vec<String> = std::env::args().collect();
    if args.len() >= 3 {
        if bastione_core::addr::domain_valid(&args[1]) {
            cfg.auth_host = Some(args[1].clone());
            cfg.auth_check = Some(PathBuf::from(&args[2]));
            cfg.auth_sub = args[3..].to_vec();
        } else {
            warn!(host = %args[1], "domainname for auth invalid");
        }
    } else if args.len() != 1 {
        error!("invalid number of parameters given");
    }

    let dns = match SystemResolver::from_system() {
        Ok(d) => d,
        Err(_) => {
            error!("cannot initialize resolver");
            return 1;
        }
    };

    let mut state = match TransferState::from_env(String::new()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "connection setup failed");
            return 1;
        }
    };
    state.remote_host = reverse_name(&dns, &state).await;

    let conn = Conn::new(SmtpStream::Plain(socket), cfg.timeout);
    let mut session = Session::new(conn, cfg, dns, state);
    match session.run().await {
        SessionEnd::Quit | SessionEnd::HttpProxy | SessionEnd::TooManyBadCommands => 0,
        SessionEnd::Timeout => 110,
        SessionEnd::PeerClosed => 104,
        SessionEnd::ConfigError => 1,
        SessionEnd::IoError => 1,
    }
}
