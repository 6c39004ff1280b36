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

//! Client-side STARTTLS. When `control/tlshosts/<fqdn>.pem` exists the
//! peer must present a chain anchored there whose name matches the
//! expected FQDN (subjectAltName first, commonName as fallback, wildcard
//! `*.domain` covering one label); any failure aborts the delivery, there
//! is no cleartext fallback. Without a pinned CA file the session is
//! opportunistically encrypted without verification, as unauthenticated
//! TLS still beats plaintext.

use std::sync::Arc;

use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::client::WebPkiServerVerifier;
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, Error as TlsError, RootCertStore,
    SignatureScheme,
};
use tokio_rustls::TlsConnector;
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

use crate::dns::Resolver;
use crate::netio::SmtpStream;

use super::{write_status, Delivery, Quit};

/// RFC 2595 section 2.4 name matching: exact match, or `*.domain`
/// covering exactly one leading label.
pub fn match_partner(name: &str, fqdn: &str) -> bool {
    if name.eq_ignore_ascii_case(fqdn) {
        return true;
    }
    if let Some(tail) = name.strip_prefix('*') {
        if let Some(dot) = fqdn.find('.') {
            return fqdn[dot..].eq_ignore_ascii_case(tail);
        }
    }
    false
}

/// Check the end-entity certificate's names against the expected FQDN:
/// every dNSName in the SAN first, the subject CN as fallback.
fn cert_matches(cert: &[u8], fqdn: &str) -> bool {
    let (_, parsed) = match X509Certificate::from_der(cert) {
        Ok(p) => p,
        Err(_) => return false,
    };
    if let Ok(Some(san)) = parsed.subject_alternative_name() {
        let mut saw_dns = false;
        for gn in &san.value.general_names {
            if let GeneralName::DNSName(n) = gn {
                saw_dns = true;
                if match_partner(n, fqdn) {
                    return true;
                }
            }
        }
        if saw_dns {
            return false;
        }
    }
    let result = parsed
        .subject()
        .iter_common_name()
        .filter_map(|cn| cn.as_str().ok())
        .any(|cn| match_partner(cn, fqdn));
    result
}

/// Verifier for the pinned-CA case: chain validation through webpki, name
/// matching per RFC 2595 including the commonName fallback webpki left
/// behind.
#[derive(Debug)]
struct PinnedVerifier {
    inner: Arc<WebPkiServerVerifier>,
    fqdn: String,
}

impl ServerCertVerifier for PinnedVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, TlsError> {
        match self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        ) {
            Ok(v) => Ok(v),
            // the path was valid, only the SAN did not match: apply the
            // commonName fallback
            Err(TlsError::InvalidCertificate(CertificateError::NotValidForName)) => {
                if cert_matches(end_entity.as_ref(), &self.fqdn) {
                    Ok(ServerCertVerified::assertion())
                } else {
                    Err(TlsError::InvalidCertificate(
                        CertificateError::NotValidForName,
                    ))
                }
            }
            Err(e) => Err(e),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Verifier for opportunistic TLS: encrypt, do not authenticate.
#[derive(Debug)]
struct AcceptAny;

impl ServerCertVerifier for AcceptAny {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, TlsError> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
        ]
    }
}

fn load_roots(pem: &[u8]) -> Result<RootCertStore, String> {
    let mut store = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut &pem[..]) {
        let cert = cert.map_err(|e| e.to_string())?;
        store.add(cert).map_err(|e| e.to_string())?;
    }
    if store.is_empty() {
        Err("no usable CA certificate".to_string())
    } else {
        Ok(store)
    }
}

fn client_config<R: Resolver>(
    d: &Delivery<'_, R>,
    pinned: Option<&std::path::Path>,
) -> Result<ClientConfig, String> {
    let builder = ClientConfig::builder();
    let builder = match pinned {
        Some(path) => {
            let pem = std::fs::read(path).map_err(|e| e.to_string())?;
            let roots = load_roots(&pem)?;
            let inner = WebPkiServerVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|e| e.to_string())?;
            let fqdn = d.partner_fqdn.clone().unwrap_or_default();
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(PinnedVerifier { inner, fqdn }))
        }
        None => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAny)),
    };
    // present a client certificate when we have one
    let clientcert = d.cfg.control_dir.join("clientcert.pem");
    let config = match std::fs::read(&clientcert) {
        Ok(pem) => {
            let certs: Vec<_> = rustls_pemfile::certs(&mut pem.as_slice())
                .collect::<Result<_, _>>()
                .map_err(|e| e.to_string())?;
            let key = rustls_pemfile::private_key(&mut pem.as_slice())
                .map_err(|e| e.to_string())?;
            match key {
                Some(key) if !certs.is_empty() => builder
                    .with_client_auth_cert(certs, key)
                    .map_err(|e| e.to_string())?,
                _ => {
                    return Err("clientcert.pem unusable".to_string());
                }
            }
        }
        Err(_) => builder.with_no_client_auth(),
    };
    Ok(config)
}

/// Negotiate TLS on the established connection. Any failure ends the
/// delivery; the original never falls back to cleartext once STARTTLS
/// was offered.
pub async fn tls_init<R: Resolver>(d: &mut Delivery<'_, R>) -> Result<(), Quit> {
    let pinned_path = d
        .partner_fqdn
        .as_deref()
        .map(|f| d.cfg.control_dir.join("tlshosts").join(format!("{}.pem", f)))
        .filter(|p| p.exists());

    let config = match client_config(d, pinned_path.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            write_status(&format!("Z4.5.0 TLS error initializing ctx: {}", e));
            d.quit().await;
            return Err(Quit);
        }
    };

    if d.write_line("STARTTLS").await.is_err() {
        write_status("Zconnection to remote server died");
        return Err(Quit);
    }
    let (code, _) = d.netget().await?;
    if code != 220 {
        if pinned_path.is_some() {
            write_status("Z4.5.0 STARTTLS rejected while tlshosts file exists");
        } else {
            write_status("Z4.5.0 STARTTLS rejected");
        }
        d.quit().await;
        return Err(Quit);
    }

    let tcp = match d.conn.take_stream() {
        SmtpStream::Plain(tcp) => tcp,
        other => {
            d.conn.set_stream(other);
            write_status("Z4.5.0 TLS connect failed: not a plain connection");
            return Err(Quit);
        }
    };
    let name = d
        .partner_fqdn
        .clone()
        .and_then(|f| ServerName::try_from(f).ok())
        .unwrap_or_else(|| {
            ServerName::try_from("unverified.invalid").expect("static name parses")
        });
    let connector = TlsConnector::from(Arc::new(config));
    let timeout = d.conn.timeout();
    match tokio::time::timeout(timeout, connector.connect(name, tcp)).await {
        Ok(Ok(tls)) => {
            d.conn.set_stream(SmtpStream::ClientTls(Box::new(tls)));
            d.encrypted = true;
            Ok(())
        }
        Ok(Err(e)) => {
            let fqdn = d.partner_fqdn.as_deref().unwrap_or("");
            write_status(&format!(
                "Z4.5.0 TLS unable to verify server {}: {}",
                fqdn, e
            ));
            Err(Quit)
        }
        Err(_) => {
            write_status("Z4.5.0 TLS connect failed: timeout");
            Err(Quit)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_and_case_insensitive() {
        assert!(match_partner("mx.example.org", "mx.example.org"));
        assert!(match_partner("MX.Example.ORG", "mx.example.org"));
        assert!(!match_partner("mx.example.org", "other.example.org"));
    }

    #[test]
    fn wildcard_covers_one_label() {
        assert!(match_partner("*.example.org", "mx.example.org"));
        assert!(match_partner("*.example.org", "deep.example.org"));
        // only the first label is covered
        assert!(!match_partner("*.example.org", "a.b.example.org"));
        // no label to cover
        assert!(!match_partner("*.example.org", "example"));
    }
}
