/*
 * auth.rs
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

//! SMTP AUTH: LOGIN, PLAIN and CRAM-MD5 exchanges. Credentials are never
//! verified in-process; they go to a checkpassword-style child on fd 3,
//! a zero exit code meaning success.

use std::os::fd::AsRawFd;
use std::os::unix::process::CommandExt;
use std::process::Stdio;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tracing::warn;

use crate::dns::Resolver;
use crate::netio::NetError;

use super::{CmdError, Session, SmtpdConfig};

const MAX_AUTH_LINE: usize = 8192;

const MECHANISMS: &[&str] = &["LOGIN", "PLAIN", "CRAM-MD5"];

/// The space-separated mechanism list for the EHLO response, filtered by
/// control/authtypes when that lists anything.
pub fn advertised_mechanisms(cfg: &SmtpdConfig) -> Option<String> {
    let enabled: Vec<&str> = MECHANISMS
        .iter()
        .copied()
        .filter(|m| {
            cfg.auth_types.is_empty()
                || cfg.auth_types.iter().any(|t| t.eq_ignore_ascii_case(m))
        })
        .collect();
    if enabled.is_empty() {
        None
    } else {
        Some(enabled.join(" "))
    }
}

fn mechanism_enabled(cfg: &SmtpdConfig, name: &str) -> bool {
    cfg.auth_types.is_empty() || cfg.auth_types.iter().any(|t| t.eq_ignore_ascii_case(name))
}

/// Read one line of auth input. A lone `*` cancels the exchange.
async fn auth_line<R: Resolver>(sess: &mut Session<R>) -> Result<Vec<u8>, CmdError> {
    let line = match sess.conn.read_until_lf(MAX_AUTH_LINE).await {
        Ok(l) => l,
        Err(NetError::LineTooLong) => return Err(err_input(sess).await?),
        Err(e) => return Err(e.into()),
    };
    if line == b"*" {
        sess.conn
            .write_line("501 5.0.0 auth exchange cancelled")
            .await?;
        return Err(CmdError::Done);
    }
    if line.is_empty() {
        return Err(err_input(sess).await?);
    }
    Ok(line)
}

/// Reject malformed auth input; the caller propagates the returned error.
async fn err_input<R: Resolver>(sess: &mut Session<R>) -> Result<CmdError, CmdError> {
    sess.tarpit().await;
    sess.conn
        .write_line("501 5.5.4 malformed auth input")
        .await?;
    Ok(CmdError::Done)
}

fn b64decode(input: &[u8]) -> Option<Vec<u8>> {
    let trimmed: Vec<u8> = input
        .iter()
        .copied()
        .filter(|b| !b" \t".contains(b))
        .collect();
    BASE64.decode(&trimmed).ok()
}

/// Hand the credentials to the external checker on its fd 3.
/// Returns true when the checker accepted them.
async fn backend_execute(
    cfg: &SmtpdConfig,
    user: &[u8],
    secret: &[u8],
    response: &[u8],
) -> Result<bool, std::io::Error> {
    let check = cfg
        .auth_check
        .as_ref()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no checkpassword"))?;
    let (reader, mut writer) = std::io::pipe()?;
    let read_fd = reader.as_raw_fd();
    let mut cmd = tokio::process::Command::new(check);
    cmd.args(&cfg.auth_sub)
        .stdin(Stdio::null())
        .stdout(Stdio::null());
    unsafe {
        cmd.pre_exec(move || {
            if libc::dup2(read_fd, 3) < 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
    let mut child = cmd.spawn()?;
    drop(reader);
    {
        use std::io::Write;
        let mut buf = Vec::with_capacity(user.len() + secret.len() + response.len() + 3);
        buf.extend_from_slice(user);
        buf.push(0);
        buf.extend_from_slice(secret);
        buf.push(0);
        buf.extend_from_slice(response);
        buf.push(0);
        writer.write_all(&buf)?;
    }
    drop(writer);
    let status = child.wait().await?;
    Ok(status.success())
}

/// Was AUTH permitted at all right now?
fn auth_permitted<R: Resolver>(sess: &Session<R>) -> bool {
    sess.cfg.auth_host.is_some()
        && sess.cfg.auth_check.is_some()
        && (!sess.cfg.force_ssl_auth || sess.conn.is_encrypted())
}

async fn auth_login<R: Resolver>(
    sess: &mut Session<R>,
    initial: Option<&str>,
) -> Result<Option<Vec<u8>>, CmdError> {
    let user_raw = match initial {
        Some(i) => i.as_bytes().to_vec(),
        None => {
            sess.conn.write_line("334 VXNlcm5hbWU6").await?; // Username:
            auth_line(sess).await?
        }
    };
    let user = match b64decode(&user_raw) {
        Some(u) => u,
        None => return Err(err_input(sess).await?),
    };
    sess.conn.write_line("334 UGFzc3dvcmQ6").await?; // Password:
    let pass_raw = auth_line(sess).await?;
    let pass = match b64decode(&pass_raw) {
        Some(p) => p,
        None => return Err(err_input(sess).await?),
    };
    if user.is_empty() || pass.is_empty() {
        return Err(err_input(sess).await?);
    }
    run_backend(sess, &user, &pass, b"").await
}

async fn auth_plain<R: Resolver>(
    sess: &mut Session<R>,
    initial: Option<&str>,
) -> Result<Option<Vec<u8>>, CmdError> {
    let raw = match initial {
        Some(i) => i.as_bytes().to_vec(),
        None => {
            sess.conn.write_line("334 ").await?;
            auth_line(sess).await?
        }
    };
    let decoded = match b64decode(&raw) {
        Some(d) => d,
        None => return Err(err_input(sess).await?),
    };
    // authorize-id NUL authenticate-id NUL password
    let mut parts = decoded.splitn(3, |&b| b == 0);
    let _authzid = parts.next();
    let user = parts.next().unwrap_or(&[]).to_vec();
    let pass = parts.next().unwrap_or(&[]).to_vec();
    if user.is_empty() || pass.is_empty() {
        return Err(err_input(sess).await?);
    }
    run_backend(sess, &user, &pass, b"").await
}

async fn auth_cram<R: Resolver>(sess: &mut Session<R>) -> Result<Option<Vec<u8>>, CmdError> {
    let host = sess.cfg.auth_host.clone().unwrap_or_default();
    let challenge = format!(
        "<{}.{}@{}>",
        std::process::id(),
        chrono::Utc::now().timestamp(),
        host
    );
    let msg = format!("334 {}", BASE64.encode(challenge.as_bytes()));
    sess.conn.write_line(&msg).await?;
    let raw = auth_line(sess).await?;
    let decoded = match b64decode(&raw) {
        Some(d) => d,
        None => return Err(err_input(sess).await?),
    };
    let text = String::from_utf8_lossy(&decoded).into_owned();
    let (user, digest) = match text.split_once(' ') {
        Some((u, d)) if !u.is_empty() && !d.trim().is_empty() => {
            (u.to_string(), d.trim_start().to_string())
        }
        _ => return Err(err_input(sess).await?),
    };
    run_backend(sess, user.as_bytes(), challenge.as_bytes(), digest.as_bytes()).await
}

async fn run_backend<R: Resolver>(
    sess: &mut Session<R>,
    user: &[u8],
    secret: &[u8],
    response: &[u8],
) -> Result<Option<Vec<u8>>, CmdError> {
    match backend_execute(&sess.cfg, user, secret, response).await {
        Ok(true) => Ok(Some(user.to_vec())),
        Ok(false) => Ok(None),
        Err(e) => {
            warn!(error = %e, "cannot run checkpassword");
            sess.conn
                .write_line("454 4.3.0 AUTH temporaryly not available")
                .await?;
            Err(CmdError::Done)
        }
    }
}

/// The AUTH verb: pick the mechanism, run the exchange, store the name.
pub async fn smtp_auth<R: Resolver>(sess: &mut Session<R>, arg: &str) -> Result<(), CmdError> {
    if sess.state.auth_name.is_some() || !auth_permitted(sess) {
        return Err(CmdError::BadSequence);
    }
    let (mech, initial) = match arg.split_once(' ') {
        Some((m, rest)) => (m, Some(rest)),
        None => (arg, None),
    };
    let result = if mech.eq_ignore_ascii_case("LOGIN") && mechanism_enabled(&sess.cfg, "LOGIN") {
        auth_login(sess, initial).await
    } else if mech.eq_ignore_ascii_case("PLAIN") && mechanism_enabled(&sess.cfg, "PLAIN") {
        auth_plain(sess, initial).await
    } else if mech.eq_ignore_ascii_case("CRAM-MD5") && mechanism_enabled(&sess.cfg, "CRAM-MD5") {
        if initial.is_some() {
            // CRAM-MD5 has no initial response
            return Err(CmdError::Syntax);
        }
        auth_cram(sess).await
    } else {
        sess.conn
            .write_line("504 5.5.1 Unrecognized authentication type.")
            .await?;
        return Err(CmdError::Done);
    };
    match result {
        Ok(Some(user)) => {
            sess.state.auth_name = Some(String::from_utf8_lossy(&user).into_owned());
            sess.conn.write_line("235 2.0.0 ok, go ahead").await?;
            Ok(())
        }
        Ok(None) => {
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            sess.conn
                .write_line("535 5.7.0 authorization failed")
                .await?;
            Err(CmdError::Done)
        }
        Err(e) => Err(e),
    }
}

/// Compute the CRAM-MD5 digest for a password and challenge; used by the
/// tests and by checkpassword helpers that verify the digest themselves.
pub fn cram_md5_digest(password: &[u8], challenge: &[u8]) -> String {
    use hmac::{Hmac, Mac};
    use md5::Md5;
    let mut mac = <Hmac<Md5> as Mac>::new_from_slice(password).expect("any key length works");
    mac.update(challenge);
    let out = mac.finalize().into_bytes();
    out.iter().map(|b| format!("{:02x}", b)).collect()
}
