/*
 * vpop.rs
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

//! vpopmail-compatible recipient lookup: the users/cdb domain database and
//! the `.qmail-*` existence rules, including `.qmail-<prefix>-default` for
//! list-style addresses and the vpopbounce template check.

use std::path::{Path, PathBuf};

use tracing::error;

use crate::addr::{AddrClass, ParsedAddr};
use crate::cdb;
use crate::control::UserConf;
use crate::dns::Resolver;

use super::{CmdError, Session};

/// Outcome of the local-address check in RCPT TO.
pub enum AddrCheck {
    /// The address is ours; the filter pipeline gets this configuration.
    Local(UserConf),
    /// Not one of our domains; only relay clients may send there.
    NotLocal,
    /// One of our domains, but that user does not exist.
    NoSuchUser,
}

/// Look up a domain in users/cdb. The record is
/// `realdomain\0uid\0gid\0path\0`; only the path is interesting here.
pub fn domain_dir(users_cdb: &Path, domain: &str) -> std::io::Result<Option<PathBuf>> {
    let mut key = Vec::with_capacity(domain.len() + 2);
    key.push(b'!');
    key.extend_from_slice(domain.as_bytes());
    key.push(b'-');
    let record = match cdb::lookup(users_cdb, &key)? {
        Some(r) => r,
        None => return Ok(None),
    };
    let mut fields = record.split(|&b| b == 0);
    let _realdomain = fields.next();
    let _uid = fields.next();
    let _gid = fields.next();
    let dir = match fields.next() {
        Some(d) if !d.is_empty() => d,
        _ => return Ok(None),
    };
    let mut path = String::from_utf8_lossy(dir).into_owned();
    while path.ends_with('/') {
        path.pop();
    }
    Ok(Some(PathBuf::from(path)))
}

/// `.qmail` files encode dots in the localpart as colons.
fn dotqm_name(localpart: &str) -> String {
    localpart.replace('.', ":")
}

/// How one user resolves inside a virtual domain directory.
enum UserState {
    Exists {
        /// The user's own directory, when it exists.
        user_dir: Option<PathBuf>,
    },
    Missing,
}

fn user_exists(domain_dir: &Path, localpart: &str, vpopbounce: Option<&str>) -> std::io::Result<UserState> {
    // '/' is valid in a localpart but would let the peer probe the
    // filesystem
    if localpart.contains('/') {
        return Ok(UserState::Missing);
    }
    let user_dir = domain_dir.join(localpart);
    match std::fs::metadata(&user_dir) {
        Ok(m) if m.is_dir() => {
            return Ok(UserState::Exists {
                user_dir: Some(user_dir),
            })
        }
        Ok(_) | Err(_) => {}
    }
    let encoded = dotqm_name(localpart);
    if domain_dir.join(format!(".qmail-{}", encoded)).exists() {
        return Ok(UserState::Exists { user_dir: None });
    }
    if domain_dir
        .join(format!(".qmail-{}-default", encoded))
        .exists()
    {
        return Ok(UserState::Exists { user_dir: None });
    }
    // list-style addresses: .qmail-<prefix>-default for every '-' prefix
    let mut pos = 0;
    while let Some(i) = localpart[pos..].find('-') {
        let prefix = &localpart[..pos + i];
        if domain_dir
            .join(format!(".qmail-{}-default", dotqm_name(prefix)))
            .exists()
        {
            return Ok(UserState::Exists { user_dir: None });
        }
        pos += i + 1;
    }
    let default = domain_dir.join(".qmail-default");
    match std::fs::read(&default) {
        Ok(content) => {
            if let Some(bounce) = vpopbounce {
                let text = String::from_utf8_lossy(&content);
                if text.trim_end() == bounce {
                    // .qmail-default is the bounce template: no such user
                    return Ok(UserState::Missing);
                }
            }
            Ok(UserState::Exists { user_dir: None })
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(UserState::Missing),
        Err(e) => Err(e),
    }
}

/// Decide whether `addr` is deliverable here: rcpthosts membership, the
/// users/cdb record, and the `.qmail` rules of the domain directory.
pub async fn addr_allowed<R: Resolver>(
    sess: &mut Session<R>,
    addr: &ParsedAddr,
) -> Result<AddrCheck, CmdError> {
    // the global postmaster has no domain to check
    if addr.class == AddrClass::DomainOnly {
        return Ok(AddrCheck::Local(UserConf::empty()));
    }

    let domain = if addr.class == AddrClass::Literal {
        let inner = addr
            .domain()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .trim_start_matches("IPv6:")
            .to_ascii_lowercase();
        if sess.state.local_ip_str.is_empty()
            || !inner.eq_ignore_ascii_case(&sess.state.local_ip_str)
        {
            return Ok(AddrCheck::NoSuchUser);
        }
        sess.cfg.liphost.clone()
    } else {
        if !crate::control::domain_matches_list(addr.domain(), &sess.cfg.rcpthosts) {
            return Ok(AddrCheck::NotLocal);
        }
        addr.domain().to_string()
    };

    let dir = match domain_dir(&sess.cfg.users_cdb, &domain) {
        Ok(Some(d)) => d,
        Ok(None) => {
            // in rcpthosts but not a virtual domain: someone else decides
            // whether the user exists
            return Ok(AddrCheck::Local(UserConf::empty()));
        }
        Err(e) => {
            error!(error = %e, "unable to read users/cdb");
            sess.conn
                .write_line("421 4.3.5 unable to read controls")
                .await?;
            return Err(CmdError::Config);
        }
    };

    match user_exists(&dir, addr.localpart(), sess.cfg.vpopbounce.as_deref()) {
        Ok(UserState::Exists { user_dir }) => {
            Ok(AddrCheck::Local(UserConf::new(user_dir, Some(dir))))
        }
        Ok(UserState::Missing) => Ok(AddrCheck::NoSuchUser),
        Err(e) => {
            error!(error = %e, domain = %domain, "unable to check user existence");
            sess.conn
                .write_line("421 4.3.5 unable to read controls")
                .await?;
            Err(CmdError::Config)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn direct_user_directory() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("foo")).unwrap();
        match user_exists(dir.path(), "foo", None).unwrap() {
            UserState::Exists { user_dir } => {
                assert_eq!(user_dir, Some(dir.path().join("foo")));
            }
            UserState::Missing => panic!("user should exist"),
        }
        assert!(matches!(
            user_exists(dir.path(), "bar", None).unwrap(),
            UserState::Missing
        ));
    }

    #[test]
    fn dotqmail_variants() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(".qmail-info"), b"|forward\n").unwrap();
        assert!(matches!(
            user_exists(dir.path(), "info", None).unwrap(),
            UserState::Exists { user_dir: None }
        ));
        // dots become colons
        fs::write(dir.path().join(".qmail-a:b"), b"x\n").unwrap();
        assert!(matches!(
            user_exists(dir.path(), "a.b", None).unwrap(),
            UserState::Exists { user_dir: None }
        ));
    }

    #[test]
    fn list_style_default() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(".qmail-list-default"), b"x\n").unwrap();
        assert!(matches!(
            user_exists(dir.path(), "list-sub-request", None).unwrap(),
            UserState::Exists { user_dir: None }
        ));
        assert!(matches!(
            user_exists(dir.path(), "other-sub", None).unwrap(),
            UserState::Missing
        ));
    }

    #[test]
    fn vpopbounce_means_missing() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(".qmail-default"), b"|/bin/bounce-no-mailbox\n").unwrap();
        assert!(matches!(
            user_exists(dir.path(), "nobody", Some("|/bin/bounce-no-mailbox")).unwrap(),
            UserState::Missing
        ));
        // different content catches everything
        assert!(matches!(
            user_exists(dir.path(), "nobody", Some("|/other")).unwrap(),
            UserState::Exists { user_dir: None }
        ));
    }

    #[test]
    fn slash_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            user_exists(dir.path(), "../etc/passwd", None).unwrap(),
            UserState::Missing
        ));
    }

    #[test]
    fn cdb_domain_record() {
        let dir = tempfile::tempdir().unwrap();
        let users = dir.path().join("users");
        fs::create_dir(&users).unwrap();
        // no file at all
        assert!(domain_dir(&users.join("cdb"), "example.org").unwrap().is_none());
    }
}
