/*
 * starttls.rs
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

//! Server-side STARTTLS. The 220 go-ahead is timing-sensitive: anything
//! the client pipelined ahead of the handshake is attacker-controlled
//! (CVE-2011-1431), so buffered input downgrades to a 550 and no TLS.

use std::sync::Arc;

use tokio_rustls::rustls::pki_types::PrivateKeyDer;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

use crate::dns::Resolver;
use crate::netio::SmtpStream;

use super::{CmdError, Session};

/// Load control/servercert.pem: full chain plus private key in one file,
/// the way qmail TLS patches ship it.
fn load_identity(
    path: &std::path::Path,
) -> Result<(Vec<tokio_rustls::rustls::pki_types::CertificateDer<'static>>, PrivateKeyDer<'static>), String>
{
    let pem = std::fs::read(path).map_err(|e| e.to_string())?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<_, _>>()
        .map_err(|e| e.to_string())?;
    if certs.is_empty() {
        return Err("no certificate in servercert.pem".to_string());
    }
    let key = rustls_pemfile::private_key(&mut pem.as_slice())
        .map_err(|e| e.to_string())?
        .ok_or("no private key in servercert.pem")?;
    Ok((certs, key))
}

pub async fn smtp_starttls<R: Resolver>(sess: &mut Session<R>) -> Result<(), CmdError> {
    if sess.conn.is_encrypted() {
        return Err(CmdError::BadSequence);
    }
    let cert_path = sess.cfg.control_dir.join("servercert.pem");
    let acceptor = match load_identity(&cert_path)
        .and_then(|(certs, key)| {
            ServerConfig::builder()
                .with_no_client_auth()
                .with_single_cert(certs, key)
                .map_err(|e| e.to_string())
        }) {
        Ok(config) => TlsAcceptor::from(Arc::new(config)),
        Err(e) => {
            warn!(error = %e, "cannot load server certificate");
            sess.conn
                .write_line("454 4.3.0 TLS not available: missing certificate")
                .await?;
            return Err(CmdError::Done);
        }
    };

    // pipelined input ahead of our 220 would end up inside the TLS
    // transcript; refuse and make the client start over
    if sess.conn.data_pending() {
        sess.sync_pipelining().await?;
        return Err(CmdError::Handled);
    }
    sess.conn.write_line("220 2.0.0 ready for tls").await?;

    let plain = match sess.conn.take_stream() {
        SmtpStream::Plain(tcp) => tcp,
        other => {
            sess.conn.set_stream(other);
            return Err(CmdError::Crypto);
        }
    };
    let timeout = sess.conn.timeout();
    let tls = match tokio::time::timeout(timeout, acceptor.accept(plain)).await {
        Ok(Ok(tls)) => tls,
        Ok(Err(e)) => {
            info!(ip = %sess.state.remote_ip_str, error = %e, "TLS handshake failed");
            return Err(CmdError::Net(crate::netio::NetError::PeerClosed));
        }
        Err(_) => return Err(CmdError::Net(crate::netio::NetError::Timeout)),
    };
    sess.conn.set_stream(SmtpStream::ServerTls(Box::new(tls)));
    sess.protocol = "ESMTPS";

    // the transcript starts over: nothing from the plaintext phase
    // survives into the encrypted session
    sess.state.reset_transaction();
    sess.state.helo = None;
    sess.state.esmtp = false;
    Ok(())
}
