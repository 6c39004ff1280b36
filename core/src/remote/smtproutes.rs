/*
 * smtproutes.rs
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

//! Static routes: `control/smtproutes.d/<domain>` key=value files are
//! probed first (domain, then `*.suffix` wildcards, then `default`), the
//! scanned `control/smtproutes` list second. A route names a relay host
//! and optionally a port.

use std::path::Path;

use crate::control::{self, match_domain};
use crate::dns::{sort_mx, MxHost, Resolver};

/// A static route decision: target host (resolved), port override.
pub struct Route {
    pub mx: Vec<MxHost>,
    pub port: u16,
}

#[derive(Debug)]
pub enum RouteError {
    /// The control file is broken; delivery must not proceed.
    Config(String),
    /// The route target does not resolve.
    BadTarget(String),
}

impl std::fmt::Display for RouteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouteError::Config(m) => write!(f, "{}", m),
            RouteError::BadTarget(t) => {
                write!(f, "cannot find IP address for static route \"{}\"", t)
            }
        }
    }
}

impl std::error::Error for RouteError {}

/// An smtproutes line is `pattern:relay[:port]`.
fn valid_route_line(line: &str) -> bool {
    let mut parts = line.splitn(3, ':');
    let _pattern = parts.next();
    if parts.next().is_none() {
        return false;
    }
    match parts.next() {
        None => true,
        Some(port) => !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()),
    }
}

async fn resolve_target<R: Resolver>(dns: &R, target: &str) -> Result<Vec<MxHost>, RouteError> {
    let addrs = dns
        .addrs(target)
        .await
        .map_err(|_| RouteError::BadTarget(target.to_string()))?;
    let mut mx: Vec<MxHost> = addrs
        .into_iter()
        .map(|addr| MxHost {
            addr,
            priority: 0,
            name: target.to_string(),
        })
        .collect();
    sort_mx(&mut mx);
    Ok(mx)
}

fn parse_port(s: &str) -> Result<u16, RouteError> {
    match s.parse::<u32>() {
        Ok(p) if (1..65536).contains(&p) => Ok(p as u16),
        _ => Err(RouteError::Config(format!("invalid port number '{}'", s))),
    }
}

/// Probe `smtproutes.d` for the domain: exact file, `*.suffix` per label,
/// finally `default`.
async fn route_dir<R: Resolver>(
    dns: &R,
    dir: &Path,
    domain: &str,
) -> Result<Option<Route>, RouteError> {
    if !dir.is_dir() {
        return Ok(None);
    }
    let mut names = vec![domain.to_string()];
    let mut rest = domain;
    while let Some(i) = rest.find('.') {
        names.push(format!("*{}", &rest[i..]));
        rest = &rest[i + 1..];
    }
    names.push("default".to_string());
    for name in names {
        let path = dir.join(&name);
        if !path.exists() {
            continue;
        }
        let entries = control::load_list(&path, None).map_err(|e| {
            RouteError::Config(format!(
                "error loading smtproutes.d file for domain {}: {}",
                domain, e
            ))
        })?;
        let mut relay = None;
        let mut port = 25;
        for e in &entries {
            if let Some(v) = e.strip_prefix("relay=") {
                if relay.is_some() {
                    return Err(RouteError::Config("duplicate relay tag".to_string()));
                }
                relay = Some(v.to_string());
            } else if let Some(v) = e.strip_prefix("port=") {
                port = parse_port(v)?;
            } else {
                return Err(RouteError::Config(format!(
                    "invalid entry '{}' in smtproutes.d file",
                    e
                )));
            }
        }
        let mx = match relay {
            Some(r) => resolve_target(dns, &r).await?,
            None => Vec::new(),
        };
        return Ok(Some(Route { mx, port }));
    }
    Ok(None)
}

/// Look up the static route for `domain`. `Ok(None)` means no route: use
/// the MX records. A route with an empty MX list forces DNS resolution
/// but may still carry a port.
pub async fn smtproute<R: Resolver>(
    dns: &R,
    control_dir: &Path,
    domain: &str,
) -> Result<Option<Route>, RouteError> {
    if let Some(r) = route_dir(dns, &control_dir.join("smtproutes.d"), domain).await? {
        return Ok(Some(r));
    }
    let lines = control::load_list(&control_dir.join("smtproutes"), Some(valid_route_line))
        .map_err(|e| RouteError::Config(format!("error loading smtproutes: {}", e)))?;
    for line in &lines {
        let (pattern, rest) = line.split_once(':').expect("validator enforced a colon");
        if !pattern.is_empty() && !match_domain(domain, pattern) {
            continue;
        }
        let (target, port) = match rest.split_once(':') {
            Some((t, p)) => (t, parse_port(p)?),
            None => (rest, 25),
        };
        if target.is_empty() {
            // empty relay: fall through to regular DNS, port may differ
            return Ok(Some(Route { mx: Vec::new(), port }));
        }
        let mx = resolve_target(dns, target).await?;
        return Ok(Some(Route { mx, port }));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::mock::MockDns;
    use std::net::Ipv4Addr;

    fn dns() -> MockDns {
        MockDns::new().with_a4("relay.example.net", &[Ipv4Addr::new(192, 0, 2, 25)])
    }

    #[tokio::test]
    async fn no_route_files() {
        let dir = tempfile::tempdir().unwrap();
        let r = smtproute(&dns(), dir.path(), "example.org").await.unwrap();
        assert!(r.is_none());
    }

    #[tokio::test]
    async fn smtproutes_suffix_match() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("smtproutes"),
            b".example.org:relay.example.net:2525\n",
        )
        .unwrap();
        let r = smtproute(&dns(), dir.path(), "mail.example.org")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(r.port, 2525);
        assert_eq!(r.mx.len(), 1);
        assert_eq!(r.mx[0].name, "relay.example.net");
        assert_eq!(r.mx[0].priority, 0);
        // non-matching domain falls through
        assert!(smtproute(&dns(), dir.path(), "other.example")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn wildcard_route_matches_everything() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("smtproutes"), b":relay.example.net\n").unwrap();
        let r = smtproute(&dns(), dir.path(), "anything.example")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(r.port, 25);
        assert!(!r.mx.is_empty());
    }

    #[tokio::test]
    async fn routes_dir_beats_flat_file() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("smtproutes.d");
        std::fs::create_dir(&sub).unwrap();
        std::fs::write(sub.join("example.org"), b"relay=relay.example.net\nport=587\n").unwrap();
        std::fs::write(dir.path().join("smtproutes"), b"example.org:other.example\n").unwrap();
        let r = smtproute(&dns(), dir.path(), "example.org")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(r.port, 587);
        assert_eq!(r.mx[0].name, "relay.example.net");
    }

    #[tokio::test]
    async fn routes_dir_wildcard_and_default() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("smtproutes.d");
        std::fs::create_dir(&sub).unwrap();
        std::fs::write(sub.join("*.example.org"), b"relay=relay.example.net\n").unwrap();
        let r = smtproute(&dns(), dir.path(), "sub.example.org")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(r.mx[0].name, "relay.example.net");
    }

    #[tokio::test]
    async fn bad_target_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("smtproutes"), b"example.org:missing.example\n").unwrap();
        assert!(matches!(
            smtproute(&dns(), dir.path(), "example.org").await,
            Err(RouteError::BadTarget(_))
        ));
    }

    #[test]
    fn route_line_validation() {
        assert!(valid_route_line("example.org:relay.example"));
        assert!(valid_route_line("example.org:relay.example:25"));
        assert!(valid_route_line(":relay.example"));
        assert!(!valid_route_line("no-colon-here"));
        assert!(!valid_route_line("a:b:notaport"));
    }
}
