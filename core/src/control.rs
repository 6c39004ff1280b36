/*
 * control.rs
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

//! Control-file loading: newline-delimited lists, one-liners, integers,
//! `filterconf` key=value settings with user/domain/global scope, domain
//! suffix matching, and packed binary CIDR lists.
//!
//! Files are opened with a non-blocking shared lock; a file that cannot be
//! locked is treated as not present, so a concurrent writer never feeds a
//! half-written policy to a running session.

use std::fs::File;
use std::io::{self, Read};
use std::net::Ipv6Addr;
use std::path::{Path, PathBuf};

use tracing::warn;

/// Which configuration level a setting was found at. Filters report this so
/// the log can say whose policy rejected the mail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfScope {
    None,
    User,
    Domain,
    Global,
}

impl ConfScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfScope::None => "none",
            ConfScope::User => "user",
            ConfScope::Domain => "domain",
            ConfScope::Global => "global",
        }
    }
}

#[derive(Debug)]
pub enum ControlError {
    /// The file exists but violates its format; the whole file is rejected.
    Malformed(PathBuf),
    Io(io::Error),
}

impl std::fmt::Display for ControlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlError::Malformed(p) => write!(f, "malformed control file {}", p.display()),
            ControlError::Io(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ControlError {}

impl From<io::Error> for ControlError {
    fn from(e: io::Error) -> Self {
        ControlError::Io(e)
    }
}

/// Read a whole control file under a shared advisory lock. `Ok(None)` means
/// the file does not exist or is currently locked by a writer.
fn read_locked(path: &Path) -> Result<Option<Vec<u8>>, ControlError> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(ControlError::Io(e)),
    };
    if file.try_lock_shared().is_err() {
        warn!(path = %path.display(), "cannot lock control file, treating as absent");
        return Ok(None);
    }
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    Ok(Some(buf))
}

/// Strip a comment (`#` not escaped by `\`) and trailing whitespace from one
/// line. Returns `None` for a line that is empty after stripping, and
/// `Err(())` when non-whitespace follows embedded whitespace.
fn clean_line(raw: &str) -> Result<Option<&str>, ()> {
    let mut end = raw.len();
    let bytes = raw.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        if b == b'#' && (i == 0 || bytes[i - 1] != b'\\') {
            end = i;
            break;
        }
    }
    let line = &raw[..end];
    let trimmed = line.trim_end_matches([' ', '\t']);
    // embedded whitespace means the rest of the line must have been blank
    if trimmed.contains([' ', '\t']) {
        return Err(());
    }
    if trimmed.is_empty() {
        Ok(None)
    } else {
        Ok(Some(trimmed))
    }
}

/// Load a list file: comments stripped, blank lines dropped, entries failing
/// the validator logged and skipped (the file itself stays valid).
pub fn load_list(
    path: &Path,
    validator: Option<fn(&str) -> bool>,
) -> Result<Vec<String>, ControlError> {
    let buf = match read_locked(path)? {
        Some(b) => b,
        None => return Ok(Vec::new()),
    };
    let text = String::from_utf8_lossy(&buf);
    let mut out = Vec::new();
    for raw in text.lines() {
        let entry = match clean_line(raw) {
            Ok(Some(e)) => e,
            Ok(None) => continue,
            Err(()) => return Err(ControlError::Malformed(path.to_path_buf())),
        };
        if let Some(check) = validator {
            if !check(entry) {
                warn!(path = %path.display(), entry, "invalid entry in control file");
                continue;
            }
        }
        out.push(entry.to_string());
    }
    Ok(out)
}

/// Load a file that must contain exactly one non-comment line.
/// With `optional`, a missing file is `Ok(None)`; otherwise it is an error.
pub fn load_oneliner(path: &Path, optional: bool) -> Result<Option<String>, ControlError> {
    let lines = load_list(path, None)?;
    match lines.len() {
        0 => {
            if optional {
                Ok(None)
            } else {
                Err(ControlError::Io(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("{} not found", path.display()),
                )))
            }
        }
        1 => Ok(lines.into_iter().next()),
        _ => Err(ControlError::Malformed(path.to_path_buf())),
    }
}

/// Load a file containing a single unsigned integer, with a default for a
/// missing file.
pub fn load_int(path: &Path, default: u64) -> Result<u64, ControlError> {
    match load_oneliner(path, true)? {
        None => Ok(default),
        Some(s) => s
            .parse::<u64>()
            .map_err(|_| ControlError::Malformed(path.to_path_buf())),
    }
}

/// Match a domain against one list expression: leading `.` is a suffix
/// match, anything else must match the whole name. Case-insensitive.
pub fn match_domain(domain: &str, expr: &str) -> bool {
    if expr.len() > domain.len() {
        return false;
    }
    if expr.starts_with('.') {
        domain[domain.len() - expr.len()..].eq_ignore_ascii_case(expr)
    } else {
        domain.len() == expr.len() && domain.eq_ignore_ascii_case(expr)
    }
}

/// Match a domain against every expression in a list.
pub fn domain_matches_list(domain: &str, list: &[String]) -> bool {
    list.iter().any(|e| match_domain(domain, e))
}

/// Scan a domain list file (like `rcpthosts`) for a match without keeping
/// the contents around.
pub fn find_domain(path: &Path, domain: &str) -> Result<bool, ControlError> {
    let buf = match read_locked(path)? {
        Some(b) => b,
        None => return Ok(false),
    };
    let text = String::from_utf8_lossy(&buf);
    for raw in text.lines() {
        if raw.starts_with('#') {
            continue;
        }
        let entry = raw.trim_end_matches([' ', '\t']);
        if !entry.is_empty() && match_domain(domain, entry) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// One entry of a packed CIDR file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CidrEntry {
    /// Network address; IPv4 as v4-mapped IPv6.
    pub net: Ipv6Addr,
    pub prefix: u8,
}

/// Check whether a (v4-mapped) address lies inside the entry's network.
pub fn cidr_contains(entry: &CidrEntry, ip: &Ipv6Addr) -> bool {
    let net = u128::from_be_bytes(entry.net.octets());
    let ip = u128::from_be_bytes(ip.octets());
    let shift = 128 - u32::from(entry.prefix);
    (ip >> shift) == (net >> shift)
}

fn parse_cidr(buf: &[u8], record: usize, path: &Path) -> Result<Vec<CidrEntry>, ControlError> {
    if buf.len() % record != 0 {
        return Err(ControlError::Malformed(path.to_path_buf()));
    }
    let addr_len = record - 1;
    let max_prefix = (addr_len * 8) as u8;
    let mut out = Vec::with_capacity(buf.len() / record);
    for rec in buf.chunks(record) {
        let prefix = rec[addr_len];
        if !(8..=max_prefix).contains(&prefix) {
            return Err(ControlError::Malformed(path.to_path_buf()));
        }
        let net = if addr_len == 4 {
            let v4: [u8; 4] = rec[..4].try_into().expect("record length");
            std::net::Ipv4Addr::from(v4).to_ipv6_mapped()
        } else {
            let v6: [u8; 16] = rec[..16].try_into().expect("record length");
            Ipv6Addr::from(v6)
        };
        let prefix = if addr_len == 4 { prefix + 96 } else { prefix };
        out.push(CidrEntry { net, prefix });
    }
    Ok(out)
}

/// Load an IPv4 CIDR file: repeated 4-byte address + 1-byte prefix in
/// [8, 32]. Any bad record makes the whole file malformed. Entries come
/// back v4-mapped with the prefix shifted accordingly.
pub fn load_cidr4(path: &Path) -> Result<Vec<CidrEntry>, ControlError> {
    match read_locked(path)? {
        None => Ok(Vec::new()),
        Some(buf) => parse_cidr(&buf, 5, path),
    }
}

/// Load an IPv6 CIDR file: repeated 16-byte address + 1-byte prefix in [8, 128].
pub fn load_cidr6(path: &Path) -> Result<Vec<CidrEntry>, ControlError> {
    match read_locked(path)? {
        None => Ok(Vec::new()),
        Some(buf) => parse_cidr(&buf, 17, path),
    }
}

/// Match an address against a whole CIDR file.
pub fn find_cidr_match(path: &Path, ip: &Ipv6Addr, v6: bool) -> Result<bool, ControlError> {
    let entries = if v6 { load_cidr6(path)? } else { load_cidr4(path)? };
    Ok(entries.iter().any(|e| cidr_contains(e, ip)))
}

/// The per-recipient configuration hierarchy: the user's directory, the
/// domain's directory, and the global control directory, each optionally
/// carrying a `filterconf` key=value file.
pub struct UserConf {
    pub user_path: Option<PathBuf>,
    pub domain_path: Option<PathBuf>,
    user_conf: Vec<String>,
    domain_conf: Vec<String>,
}

impl UserConf {
    pub fn new(user_path: Option<PathBuf>, domain_path: Option<PathBuf>) -> Self {
        let user_conf = user_path
            .as_deref()
            .map(|p| load_list(&p.join("filterconf"), None).unwrap_or_default())
            .unwrap_or_default();
        let domain_conf = domain_path
            .as_deref()
            .map(|p| load_list(&p.join("filterconf"), None).unwrap_or_default())
            .unwrap_or_default();
        Self {
            user_path,
            domain_path,
            user_conf,
            domain_conf,
        }
    }

    pub fn empty() -> Self {
        Self {
            user_path: None,
            domain_path: None,
            user_conf: Vec::new(),
            domain_conf: Vec::new(),
        }
    }

    fn lookup(entries: &[String], key: &str) -> Option<i64> {
        for e in entries {
            if let Some(v) = e.strip_prefix(key) {
                if let Some(v) = v.strip_prefix('=') {
                    return v.parse().ok();
                }
                if v.is_empty() {
                    // bare key counts as boolean on
                    return Some(1);
                }
            }
        }
        None
    }

    /// Look up an integer setting in the user then domain filterconf.
    pub fn get_setting(&self, key: &str) -> (Option<i64>, ConfScope) {
        if let Some(v) = Self::lookup(&self.user_conf, key) {
            return (Some(v), ConfScope::User);
        }
        if let Some(v) = Self::lookup(&self.domain_conf, key) {
            return (Some(v), ConfScope::Domain);
        }
        (None, ConfScope::None)
    }

    /// Like get_setting, falling back to the global filterconf list.
    pub fn get_setting_global(&self, key: &str, global: &[String]) -> (Option<i64>, ConfScope) {
        match self.get_setting(key) {
            (Some(v), scope) => (Some(v), scope),
            _ => match Self::lookup(global, key) {
                Some(v) => (Some(v), ConfScope::Global),
                None => (None, ConfScope::None),
            },
        }
    }

    /// Find a per-filter policy file in the user then domain directory.
    pub fn get_file(&self, name: &str) -> (Option<PathBuf>, ConfScope) {
        if let Some(p) = self.user_path.as_deref() {
            let f = p.join(name);
            if f.exists() {
                return (Some(f), ConfScope::User);
            }
        }
        if let Some(p) = self.domain_path.as_deref() {
            let f = p.join(name);
            if f.exists() {
                return (Some(f), ConfScope::Domain);
            }
        }
        (None, ConfScope::None)
    }

    /// Like get_file, falling back to the global control directory.
    pub fn get_file_global(&self, name: &str, control_dir: &Path) -> (Option<PathBuf>, ConfScope) {
        match self.get_file(name) {
            (Some(p), scope) => (Some(p), scope),
            _ => {
                let f = control_dir.join(name);
                if f.exists() {
                    (Some(f), ConfScope::Global)
                } else {
                    (None, ConfScope::None)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
        let p = dir.join(name);
        File::create(&p).unwrap().write_all(content).unwrap();
        p
    }

    #[test]
    fn list_strips_comments_and_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        let p = write_file(
            dir.path(),
            "badhelo",
            b"# leading comment\nexample.com\n\n.dialup.example   \nspam\\#house\n",
        );
        let l = load_list(&p, None).unwrap();
        assert_eq!(l, vec!["example.com", ".dialup.example", "spam\\#house"]);
    }

    #[test]
    fn list_rejects_embedded_whitespace() {
        let dir = tempfile::tempdir().unwrap();
        let p = write_file(dir.path(), "bad", b"foo bar\n");
        assert!(matches!(
            load_list(&p, None),
            Err(ControlError::Malformed(_))
        ));
    }

    #[test]
    fn list_validator_skips_entries() {
        let dir = tempfile::tempdir().unwrap();
        let p = write_file(dir.path(), "l", b"good.example\nBAD ENTRY#\nalso.good\n");
        let l = load_list(&p, Some(|e| !e.contains("BAD"))).unwrap();
        assert_eq!(l, vec!["good.example", "also.good"]);
    }

    #[test]
    fn oneliner_and_int() {
        let dir = tempfile::tempdir().unwrap();
        let p = write_file(dir.path(), "databytes", b"40000000\n");
        assert_eq!(load_int(&p, 0).unwrap(), 40000000);
        assert_eq!(load_int(&dir.path().join("missing"), 7).unwrap(), 7);
        let two = write_file(dir.path(), "two", b"a\nb\n");
        assert!(matches!(
            load_oneliner(&two, true),
            Err(ControlError::Malformed(_))
        ));
    }

    #[test]
    fn domain_matching_rules() {
        assert!(match_domain("example.org", "example.org"));
        assert!(match_domain("EXAMPLE.org", "example.ORG"));
        assert!(match_domain("mail.example.org", ".example.org"));
        assert!(!match_domain("example.org", ".example.org"));
        assert!(!match_domain("badexample.org", "example.org"));
        assert!(!match_domain("org", ".example.org"));
    }

    #[test]
    fn find_domain_scans_file() {
        let dir = tempfile::tempdir().unwrap();
        let p = write_file(dir.path(), "rcpthosts", b"# hosts\nexample.org\n.example.net\t\n");
        assert!(find_domain(&p, "example.org").unwrap());
        assert!(find_domain(&p, "sub.example.net").unwrap());
        assert!(!find_domain(&p, "example.com").unwrap());
    }

    #[test]
    fn cidr4_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        // 192.0.2.0/24 and 10.0.0.0/8
        let p = write_file(
            dir.path(),
            "ipbl",
            &[192, 0, 2, 0, 24, 10, 0, 0, 0, 8],
        );
        let inside: Ipv6Addr = "::ffff:192.0.2.99".parse().unwrap();
        let outside: Ipv6Addr = "::ffff:192.0.3.1".parse().unwrap();
        let ten: Ipv6Addr = "::ffff:10.200.1.1".parse().unwrap();
        assert!(find_cidr_match(&p, &inside, false).unwrap());
        assert!(!find_cidr_match(&p, &outside, false).unwrap());
        assert!(find_cidr_match(&p, &ten, false).unwrap());
    }

    #[test]
    fn cidr_rejects_bad_prefix_and_length() {
        let dir = tempfile::tempdir().unwrap();
        let bad_prefix = write_file(dir.path(), "p", &[192, 0, 2, 0, 40]);
        assert!(load_cidr4(&bad_prefix).is_err());
        let bad_len = write_file(dir.path(), "l", &[192, 0, 2, 0]);
        assert!(load_cidr4(&bad_len).is_err());
    }

    #[test]
    fn cidr_naive_scan_equivalence() {
        // the mask comparison must agree with a naive per-bit scan
        let entry = CidrEntry {
            net: "2001:db8::".parse().unwrap(),
            prefix: 32,
        };
        let yes: Ipv6Addr = "2001:db8:1234::1".parse().unwrap();
        let no: Ipv6Addr = "2001:db9::1".parse().unwrap();
        for (ip, expect) in [(yes, true), (no, false)] {
            let naive = {
                let a = entry.net.octets();
                let b = ip.octets();
                let full = (entry.prefix / 8) as usize;
                let rem = entry.prefix % 8;
                let mut eq = a[..full] == b[..full];
                if eq && rem > 0 {
                    let mask = 0xffu8 << (8 - rem);
                    eq = (a[full] & mask) == (b[full] & mask);
                }
                eq
            };
            assert_eq!(cidr_contains(&entry, &ip), expect);
            assert_eq!(naive, expect);
        }
    }

    #[test]
    fn filterconf_scopes() {
        let dir = tempfile::tempdir().unwrap();
        let user = dir.path().join("user");
        let domain = dir.path().join("domain");
        std::fs::create_dir_all(&user).unwrap();
        std::fs::create_dir_all(&domain).unwrap();
        write_file(&user, "filterconf", b"spfpolicy=3\nfail_hard_on_temp\n");
        write_file(&domain, "filterconf", b"spfpolicy=1\nhelovalid=5\n");
        let uc = UserConf::new(Some(user), Some(domain));
        assert_eq!(uc.get_setting("spfpolicy"), (Some(3), ConfScope::User));
        assert_eq!(uc.get_setting("helovalid"), (Some(5), ConfScope::Domain));
        assert_eq!(
            uc.get_setting("fail_hard_on_temp"),
            (Some(1), ConfScope::User)
        );
        let global = vec!["nonexist_on_block=1".to_string()];
        assert_eq!(
            uc.get_setting_global("nonexist_on_block", &global),
            (Some(1), ConfScope::Global)
        );
        assert_eq!(uc.get_setting("missing"), (None, ConfScope::None));
    }
}
