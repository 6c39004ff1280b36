/*
 * spf.rs
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

//! SPF evaluation (RFC 4408): record discovery, every mechanism with
//! qualifiers, include/redirect recursion, exp= explanations, and full
//! macro expansion. Hard caps: recursion depth 20 and 10 DNS-querying
//! terms per evaluation.

use std::future::Future;
use std::net::Ipv6Addr;
use std::pin::Pin;

use crate::dns::{DnsError, Resolver, PRIO_IMPLICIT};

/// Outcome alphabet of an SPF evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpfResult {
    /// No SPF policy published.
    None,
    Pass,
    Neutral,
    SoftFail,
    Fail,
    /// The record (or the queried domain) is malformed.
    MalformedRecord,
    /// An include target published no policy.
    NonexistentInclude,
    /// Temporary DNS problem, evaluation could not complete.
    TempError,
    /// Permanent evaluation error (unknown mechanism, bad syntax).
    HardError,
    /// Policy checking was switched off for this peer.
    Ignored,
}

impl SpfResult {
    /// True for every flavor of SPF failure.
    pub fn is_fail(&self) -> bool {
        matches!(
            self,
            SpfResult::Fail | SpfResult::MalformedRecord | SpfResult::NonexistentInclude
        )
    }

    /// The result name used in Received-SPF headers.
    pub fn header_name(&self) -> &'static str {
        match self {
            SpfResult::None => "None",
            SpfResult::Pass => "Pass",
            SpfResult::Neutral => "Neutral",
            SpfResult::SoftFail => "SoftFail",
            SpfResult::Fail => "Fail",
            SpfResult::MalformedRecord
            | SpfResult::NonexistentInclude
            | SpfResult::HardError => "PermError",
            SpfResult::TempError => "TempError",
            SpfResult::Ignored => "None",
        }
    }
}

/// Session facts the evaluator and the macro expander draw from.
pub struct SpfContext<'a> {
    /// Peer address, IPv4 as v4-mapped.
    pub remote_ip: Ipv6Addr,
    /// HELO string (or the reverse DNS name when HELO matched it).
    pub helo: &'a str,
    /// Envelope sender; `None` for a bounce.
    pub mail_from: Option<&'a str>,
    /// Our own host name (`%{r}` and the Received-SPF receiver field).
    pub local_name: &'a str,
    /// Validated reverse DNS name of the peer, empty if none.
    pub remote_host: &'a str,
}

impl SpfContext<'_> {
    fn sender(&self) -> String {
        match self.mail_from {
            Some(s) => s.to_string(),
            None => format!("postmaster@{}", self.helo),
        }
    }

    fn ip_dotted(&self) -> String {
        match self.remote_ip.to_ipv4_mapped() {
            Some(v4) => v4.to_string(),
            None => {
                let mut out = String::with_capacity(63);
                for (i, b) in self.remote_ip.octets().iter().enumerate() {
                    if i > 0 {
                        out.push('.');
                    }
                    out.push_str(&format!("{:x}.{:x}", b >> 4, b & 0xf));
                }
                out
            }
        }
    }

    fn ip_readable(&self) -> String {
        match self.remote_ip.to_ipv4_mapped() {
            Some(v4) => v4.to_string(),
            None => self.remote_ip.to_string(),
        }
    }
}

/// Everything a caller needs from one evaluation.
#[derive(Debug, Clone)]
pub struct SpfOutcome {
    pub result: SpfResult,
    /// The matching mechanism, for the Received-SPF header.
    pub mechanism: Option<&'static str>,
    /// Either the domain's exp= text (on Fail) or the sanitized offending
    /// token (on HardError).
    pub explanation: Option<String>,
}

impl SpfOutcome {
    fn plain(result: SpfResult) -> Self {
        Self {
            result,
            mechanism: None,
            explanation: None,
        }
    }
}

const MAX_RECURSION: u32 = 20;
const MAX_LOOKUPS: u32 = 10;
const DELIMITERS: &[u8] = b".-+,/_=";

/// Evaluate the SPF policy of `domain` for the given session.
pub async fn check_host<R: Resolver>(
    dns: &R,
    ctx: &SpfContext<'_>,
    domain: &str,
) -> SpfOutcome {
    if !crate::addr::domain_valid(domain.trim_end_matches('.')) {
        return SpfOutcome::plain(SpfResult::MalformedRecord);
    }
    let mut eval = Eval {
        dns,
        ctx,
        lookups: 0,
        mechanism: None,
        explanation: None,
    };
    let result = eval.lookup(domain.to_string(), 0).await;
    SpfOutcome {
        result,
        mechanism: eval.mechanism,
        explanation: eval.explanation,
    }
}

struct Eval<'a, R: Resolver> {
    dns: &'a R,
    ctx: &'a SpfContext<'a>,
    lookups: u32,
    mechanism: Option<&'static str>,
    explanation: Option<String>,
}

/// Result of matching one mechanism: hit, miss, or an error that ends the
/// whole evaluation.
enum Match {
    Hit,
    Miss,
    Abort(SpfResult),
}

impl<'a, R: Resolver> Eval<'a, R> {
    fn count_lookup(&mut self) -> bool {
        self.lookups += 1;
        self.lookups <= MAX_LOOKUPS
    }

    /// TXT lookup with the SPF constraints: trailing dots dropped, over-long
    /// names shortened from the left.
    async fn spf_txt(&self, domain: &str) -> Result<Vec<String>, DnsError> {
        let mut name = domain.trim_end_matches('.');
        if name.is_empty() {
            return Err(DnsError::Perm);
        }
        while name.len() > 253 {
            match name.find('.') {
                Some(i) => name = &name[i + 1..],
                None => return Err(DnsError::Perm),
            }
        }
        self.dns.txt(name).await
    }

    fn lookup<'s>(
        &'s mut self,
        domain: String,
        rec: u32,
    ) -> Pin<Box<dyn Future<Output = SpfResult> + 's>> {
        Box::pin(async move {
            if rec >= MAX_RECURSION {
                return SpfResult::HardError;
            }
            let records = match self.spf_txt(&domain).await {
                Ok(r) => r,
                Err(DnsError::NxDomain) => return SpfResult::None,
                Err(DnsError::Temp) => return SpfResult::TempError,
                Err(_) => return SpfResult::HardError,
            };
            let spf: Vec<&String> = records
                .iter()
                .filter(|r| r.as_str() == "v=spf1" || r.starts_with("v=spf1 "))
                .collect();
            if spf.len() > 1 {
                return SpfResult::MalformedRecord;
            }
            let record = match spf.first() {
                Some(r) => r.as_str(),
                None => return SpfResult::None,
            };

            let mut redirect: Option<String> = None;
            for token in record.split_ascii_whitespace().skip(1) {
                let (qualifier, term) = match token.as_bytes()[0] {
                    b'-' => (SpfResult::Fail, &token[1..]),
                    b'~' => (SpfResult::SoftFail, &token[1..]),
                    b'?' => (SpfResult::Neutral, &token[1..]),
                    b'+' => (SpfResult::Pass, &token[1..]),
                    b'a'..=b'z' | b'A'..=b'Z' => (SpfResult::Pass, token),
                    _ => return SpfResult::HardError,
                };
                let matched = if let Some(rest) = strip_mech(term, "all") {
                    if rest.is_empty() {
                        self.mechanism = Some("all");
                        Match::Hit
                    } else {
                        Match::Abort(SpfResult::HardError)
                    }
                } else if let Some(rest) = strip_mech(term, "ip4") {
                    self.mechanism = Some("IP4");
                    self.match_ip4(rest)
                } else if let Some(rest) = strip_mech(term, "ip6") {
                    self.mechanism = Some("IP6");
                    self.match_ip6(rest)
                } else if let Some(rest) = strip_mech(term, "mx") {
                    self.mechanism = Some("MX");
                    self.match_mx(&domain, rest).await
                } else if let Some(rest) = strip_mech(term, "a") {
                    self.mechanism = Some("A");
                    self.match_a(&domain, rest).await
                } else if let Some(rest) = strip_mech(term, "ptr") {
                    self.mechanism = Some("PTR");
                    self.match_ptr(&domain, rest).await
                } else if let Some(rest) = strip_mech(term, "exists") {
                    self.mechanism = Some("exists");
                    self.match_exists(&domain, rest).await
                } else if let Some(rest) = strip_mech(term, "include") {
                    self.mechanism = Some("include");
                    let target = match rest.strip_prefix(':') {
                        Some(t) => t,
                        None => return SpfResult::HardError,
                    };
                    let target = match self.expand(target, &domain, false) {
                        Ok(t) => t,
                        Err(e) => return e,
                    };
                    if !self.count_lookup() {
                        return SpfResult::HardError;
                    }
                    match self.lookup(target, rec + 1).await {
                        SpfResult::Pass => Match::Hit,
                        SpfResult::None => Match::Abort(SpfResult::NonexistentInclude),
                        SpfResult::TempError => Match::Abort(SpfResult::TempError),
                        SpfResult::Fail | SpfResult::SoftFail | SpfResult::Neutral => Match::Miss,
                        other => Match::Abort(other),
                    }
                } else if let Some(target) = term.strip_prefix("redirect=") {
                    if redirect.is_none() {
                        redirect = Some(target.to_string());
                    }
                    Match::Miss
                } else if term.starts_with("exp=") {
                    // evaluated only when the final result is a failure
                    Match::Miss
                } else {
                    // unknown term: permanent error, keep the sanitized
                    // token for the trace header
                    self.explanation = Some(sanitize_token(token));
                    Match::Abort(SpfResult::HardError)
                };

                match matched {
                    Match::Hit => {
                        if qualifier == SpfResult::Fail {
                            self.fetch_explanation(record, &domain).await;
                        }
                        return qualifier;
                    }
                    Match::Miss => {}
                    Match::Abort(e) => return e,
                }
            }

            if let Some(target) = redirect {
                let target = match self.expand(&target, &domain, false) {
                    Ok(t) => t,
                    Err(e) => return e,
                };
                if !self.count_lookup() {
                    return SpfResult::HardError;
                }
                return self.lookup(target, rec + 1).await;
            }
            SpfResult::Neutral
        })
    }

    /// On Fail, look up and expand the domain's explanation string.
    async fn fetch_explanation(&mut self, record: &str, domain: &str) {
        let target = match record
            .split_ascii_whitespace()
            .find_map(|t| t.strip_prefix("exp="))
        {
            Some(t) => t,
            None => return,
        };
        let target = match self.expand(target, domain, false) {
            Ok(t) => t,
            Err(_) => return,
        };
        let target = target.trim_end_matches('.');
        if target.is_empty() {
            return;
        }
        if let Ok(txts) = self.spf_txt(target).await {
            if let Some(first) = txts.first() {
                if let Ok(exp) = self.expand(first, domain, true) {
                    self.explanation = Some(exp);
                }
            }
        }
    }

    fn match_ip4(&self, rest: &str) -> Match {
        let arg = match rest.strip_prefix(':') {
            Some(a) => a,
            None => return Match::Abort(SpfResult::HardError),
        };
        let v4 = match self.ctx.remote_ip.to_ipv4_mapped() {
            Some(v4) => v4,
            None => return Match::Miss,
        };
        let (net, prefix) = match split_cidr(arg) {
            Some(x) => x,
            None => return Match::Abort(SpfResult::HardError),
        };
        let prefix = prefix.unwrap_or(32);
        if !(8..=32).contains(&prefix) {
            return Match::Abort(SpfResult::HardError);
        }
        let net: std::net::Ipv4Addr = match net.parse() {
            Ok(n) => n,
            Err(_) => return Match::Abort(SpfResult::HardError),
        };
        let mask = u32::MAX << (32 - u32::from(prefix));
        if (u32::from(v4) & mask) == (u32::from(net) & mask) {
            Match::Hit
        } else {
            Match::Miss
        }
    }

    fn match_ip6(&self, rest: &str) -> Match {
        let arg = match rest.strip_prefix(':') {
            Some(a) => a,
            None => return Match::Abort(SpfResult::HardError),
        };
        if self.ctx.remote_ip.to_ipv4_mapped().is_some() {
            return Match::Miss;
        }
        let (net, prefix) = match split_cidr(arg) {
            Some(x) => x,
            None => return Match::Abort(SpfResult::HardError),
        };
        let prefix = prefix.unwrap_or(128);
        if !(8..=128).contains(&prefix) {
            return Match::Abort(SpfResult::HardError);
        }
        let net: Ipv6Addr = match net.parse() {
            Ok(n) => n,
            Err(_) => return Match::Abort(SpfResult::HardError),
        };
        if v6_masked_eq(&self.ctx.remote_ip, &net, prefix) {
            Match::Hit
        } else {
            Match::Miss
        }
    }

    async fn match_mx(&mut self, domain: &str, rest: &str) -> Match {
        let (target, cidr4, cidr6) = match self.domainspec(domain, rest) {
            Ok(x) => x,
            Err(e) => return Match::Abort(e),
        };
        if !self.count_lookup() {
            return Match::Abort(SpfResult::HardError);
        }
        let name = target.as_deref().unwrap_or(domain);
        let mx = match self.dns.mx(name).await {
            Ok(mx) => mx,
            Err(DnsError::NxDomain) | Err(DnsError::RefusesMail) => return Match::Miss,
            Err(DnsError::Temp) => return Match::Abort(SpfResult::TempError),
            Err(DnsError::Perm) => return Match::Abort(SpfResult::HardError),
        };
        // the implicit MX does not count for the mx mechanism
        for host in mx.iter().filter(|h| h.priority < PRIO_IMPLICIT) {
            if self.addr_in_cidr(&host.addr, cidr4, cidr6) {
                return Match::Hit;
            }
        }
        Match::Miss
    }

    async fn match_a(&mut self, domain: &str, rest: &str) -> Match {
        let (target, cidr4, cidr6) = match self.domainspec(domain, rest) {
            Ok(x) => x,
            Err(e) => return Match::Abort(e),
        };
        if !self.count_lookup() {
            return Match::Abort(SpfResult::HardError);
        }
        let name = target.as_deref().unwrap_or(domain);
        let addrs = match self.dns.addrs(name).await {
            Ok(a) => a,
            Err(DnsError::NxDomain) => return Match::Miss,
            Err(DnsError::Temp) => return Match::Abort(SpfResult::TempError),
            _ => return Match::Abort(SpfResult::HardError),
        };
        for addr in &addrs {
            if self.addr_in_cidr(addr, cidr4, cidr6) {
                return Match::Hit;
            }
        }
        Match::Miss
    }

    async fn match_ptr(&mut self, domain: &str, rest: &str) -> Match {
        let (target, cidr4, cidr6) = match self.domainspec(domain, rest) {
            Ok(x) => x,
            Err(e) => return Match::Abort(e),
        };
        if cidr4.is_some() || cidr6.is_some() {
            return Match::Abort(SpfResult::HardError);
        }
        if !self.count_lookup() {
            return Match::Abort(SpfResult::HardError);
        }
        let suffix = target.as_deref().unwrap_or(domain);
        let names = match self.dns.ptr(&self.ctx.remote_ip).await {
            Ok(n) => n,
            Err(DnsError::NxDomain) => return Match::Miss,
            Err(DnsError::Temp) => return Match::Abort(SpfResult::TempError),
            _ => return Match::Miss,
        };
        for name in &names {
            // validate the PTR name by forward lookup
            let fwd = match self.dns.addrs(name).await {
                Ok(a) => a,
                Err(_) => continue,
            };
            if !fwd.contains(&self.ctx.remote_ip) {
                continue;
            }
            let n = name.trim_end_matches('.');
            if n.eq_ignore_ascii_case(suffix)
                || n.to_ascii_lowercase()
                    .ends_with(&format!(".{}", suffix.to_ascii_lowercase()))
            {
                return Match::Hit;
            }
        }
        Match::Miss
    }

    async fn match_exists(&mut self, domain: &str, rest: &str) -> Match {
        let arg = match rest.strip_prefix(':') {
            Some(a) => a,
            None => return Match::Abort(SpfResult::HardError),
        };
        let target = match self.expand(arg, domain, false) {
            Ok(t) => t,
            Err(e) => return Match::Abort(e),
        };
        if !self.count_lookup() {
            return Match::Abort(SpfResult::HardError);
        }
        match self.dns.a(&target).await {
            Ok(a) if !a.is_empty() => Match::Hit,
            Ok(_) | Err(DnsError::NxDomain) => Match::Miss,
            Err(DnsError::Temp) => Match::Abort(SpfResult::TempError),
            _ => Match::Abort(SpfResult::HardError),
        }
    }

    fn addr_in_cidr(&self, addr: &Ipv6Addr, cidr4: Option<u8>, cidr6: Option<u8>) -> bool {
        match (
            self.ctx.remote_ip.to_ipv4_mapped(),
            addr.to_ipv4_mapped(),
        ) {
            (Some(_), Some(_)) => {
                let prefix = cidr4.unwrap_or(32);
                v6_masked_eq(&self.ctx.remote_ip, addr, 96 + prefix)
            }
            (None, None) => v6_masked_eq(&self.ctx.remote_ip, addr, cidr6.unwrap_or(128)),
            _ => false,
        }
    }

    /// Parse `[:domainspec][/cidr4][//cidr6]` after a mechanism name,
    /// expanding macros in the domain part.
    fn domainspec(
        &self,
        domain: &str,
        rest: &str,
    ) -> Result<(Option<String>, Option<u8>, Option<u8>), SpfResult> {
        let mut spec = rest;
        let mut target = None;
        if let Some(t) = spec.strip_prefix(':') {
            let end = t.find('/').unwrap_or(t.len());
            target = Some(self.expand(&t[..end], domain, false)?);
            spec = &t[end..];
        } else if !spec.is_empty() && !spec.starts_with('/') {
            return Err(SpfResult::HardError);
        }
        let mut cidr4 = None;
        let mut cidr6 = None;
        if let Some(c) = spec.strip_prefix('/') {
            let (four, six) = match c.split_once("//") {
                Some((a, b)) => (a, Some(b)),
                None => (c, None),
            };
            if !four.is_empty() {
                let v: u8 = four.parse().map_err(|_| SpfResult::HardError)?;
                if !(8..=32).contains(&v) {
                    return Err(SpfResult::HardError);
                }
                cidr4 = Some(v);
            }
            if let Some(six) = six {
                let v: u8 = six.parse().map_err(|_| SpfResult::HardError)?;
                if !(8..=128).contains(&v) {
                    return Err(SpfResult::HardError);
                }
                cidr6 = Some(v);
            }
        }
        Ok((target, cidr4, cidr6))
    }

    /// Expand the SPF macro language into `token`. `exp` allows the
    /// explanation-only letters c, t and r.
    fn expand(&self, token: &str, domain: &str, exp: bool) -> Result<String, SpfResult> {
        let bytes = token.as_bytes();
        let mut out = String::new();
        let mut i = 0;
        while i < bytes.len() {
            let b = bytes[i];
            if b != b'%' {
                if !(0x21..=0x7e).contains(&b) {
                    return Err(SpfResult::HardError);
                }
                out.push(b as char);
                i += 1;
                continue;
            }
            i += 1;
            match bytes.get(i) {
                Some(b'%') => {
                    out.push('%');
                    i += 1;
                }
                Some(b'_') => {
                    out.push(' ');
                    i += 1;
                }
                Some(b'-') => {
                    out.push_str("%20");
                    i += 1;
                }
                Some(b'{') => {
                    let close = token[i..]
                        .find('}')
                        .ok_or(SpfResult::HardError)?
                        + i;
                    let body = &token[i + 1..close];
                    out.push_str(&self.expand_letter(body, domain, exp)?);
                    i = close + 1;
                }
                _ => return Err(SpfResult::HardError),
            }
        }
        Ok(out)
    }

    fn expand_letter(&self, body: &str, domain: &str, exp: bool) -> Result<String, SpfResult> {
        let bytes = body.as_bytes();
        if bytes.is_empty() {
            return Err(SpfResult::HardError);
        }
        let letter = bytes[0];
        let urlencode = letter.is_ascii_uppercase();
        let mut i = 1;
        let mut digits = None;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if i > start {
            let n: usize = body[start..i].parse().map_err(|_| SpfResult::HardError)?;
            if n == 0 {
                return Err(SpfResult::HardError);
            }
            digits = Some(n);
        }
        let reverse = if i < bytes.len() && bytes[i] == b'r' {
            i += 1;
            true
        } else {
            false
        };
        let mut delims = Vec::new();
        while i < bytes.len() {
            if DELIMITERS.contains(&bytes[i]) {
                delims.push(bytes[i]);
                i += 1;
            } else {
                return Err(SpfResult::HardError);
            }
        }
        if delims.is_empty() {
            delims.push(b'.');
        }

        let ctx = self.ctx;
        let value = match letter.to_ascii_lowercase() {
            b's' => ctx.sender(),
            b'l' => match ctx.mail_from {
                Some(s) => s.split('@').next().unwrap_or(s).to_string(),
                None => "postmaster".to_string(),
            },
            b'o' => match ctx.mail_from {
                Some(s) => s.rsplit('@').next().unwrap_or(s).to_string(),
                None => ctx.helo.to_string(),
            },
            b'd' => domain.to_string(),
            b'i' => ctx.ip_dotted(),
            b'p' => {
                if ctx.remote_host.is_empty() {
                    "unknown".to_string()
                } else {
                    ctx.remote_host.to_string()
                }
            }
            b'h' => ctx.helo.to_string(),
            b'v' => {
                if ctx.remote_ip.to_ipv4_mapped().is_some() {
                    "in-addr".to_string()
                } else {
                    "ip6".to_string()
                }
            }
            b'c' if exp => ctx.ip_readable(),
            b't' if exp => chrono::Utc::now().timestamp().to_string(),
            b'r' if exp => ctx.local_name.to_string(),
            _ => return Err(SpfResult::HardError),
        };
        Ok(transform(&value, digits, reverse, &delims, urlencode))
    }
}

/// Strip a mechanism name when it is followed by end, `:` or `/`.
fn strip_mech<'a>(term: &'a str, name: &str) -> Option<&'a str> {
    if term.len() < name.len() || !term[..name.len()].eq_ignore_ascii_case(name) {
        return None;
    }
    let rest = &term[name.len()..];
    if rest.is_empty() || rest.starts_with(':') || rest.starts_with('/') {
        Some(rest)
    } else {
        None
    }
}

fn split_cidr(arg: &str) -> Option<(&str, Option<u8>)> {
    match arg.split_once('/') {
        None => Some((arg, None)),
        Some((addr, len)) => {
            let v = len.parse().ok()?;
            Some((addr, Some(v)))
        }
    }
}

fn v6_masked_eq(a: &Ipv6Addr, b: &Ipv6Addr, prefix: u8) -> bool {
    let a = u128::from_be_bytes(a.octets());
    let b = u128::from_be_bytes(b.octets());
    if prefix == 0 {
        return true;
    }
    let shift = 128 - u32::from(prefix);
    (a >> shift) == (b >> shift)
}

/// Apply the macro transformers: split on the delimiter set, optionally
/// reverse, keep the last `digits` parts, join with dots, and %-escape
/// when the letter was uppercase.
fn transform(
    value: &str,
    digits: Option<usize>,
    reverse: bool,
    delims: &[u8],
    urlencode: bool,
) -> String {
    let mut parts: Vec<&str> = value
        .split(|c: char| c.is_ascii() && delims.contains(&(c as u8)))
        .collect();
    if reverse {
        parts.reverse();
    }
    if let Some(n) = digits {
        if n < parts.len() {
            parts = parts.split_off(parts.len() - n);
        }
    }
    let joined = parts.join(".");
    if urlencode {
        url_escape(&joined)
    } else {
        joined
    }
}

fn url_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        if b.is_ascii_alphanumeric()
            || matches!(b, b'-' | b'_' | b'.' | b'!' | b'~' | b'*' | b'\'' | b'(' | b')')
        {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

/// Replace everything unsafe in a MIME header by `%`.
fn sanitize_token(token: &str) -> String {
    token
        .bytes()
        .map(|b| {
            if b <= b' ' || b >= 127 || crate::mime::is_tspecial(b) {
                '%'
            } else {
                b as char
            }
        })
        .collect()
}

/// Render the Received-SPF trace header (LF line endings, continuation
/// lines tab-indented, no trailing newline).
pub fn received_spf(ctx: &SpfContext<'_>, outcome: &SpfOutcome) -> Option<String> {
    if outcome.result == SpfResult::Ignored {
        return None;
    }
    let client_ip = ctx.ip_readable();
    let from = ctx.mail_from.unwrap_or("");
    let mut out = format!("Received-SPF: {}", outcome.result.header_name());
    if outcome.result == SpfResult::HardError {
        if let Some(exp) = &outcome.explanation {
            out.push(' ');
            out.push_str(exp);
        }
    }
    out.push_str(&format!(" ({}: ", ctx.local_name));
    match outcome.result {
        SpfResult::MalformedRecord | SpfResult::NonexistentInclude | SpfResult::HardError => {
            out.push_str(&format!(
                "domain of\n\t{} uses mechanism not recognized by this client)",
                from
            ));
        }
        SpfResult::TempError => {
            out.push_str(&format!(
                "error in processing during lookup of {}: DNS problem)",
                from
            ));
        }
        SpfResult::None | SpfResult::Ignored => {
            out.push_str(&format!(
                "domain of {} does not designate permitted sender hosts)",
                from
            ));
            return Some(out);
        }
        SpfResult::SoftFail | SpfResult::Fail => {
            out.push_str(&format!(
                "domain of {} does not designate {} as permitted sender)",
                from, client_ip
            ));
        }
        SpfResult::Neutral => {
            out.push_str(&format!(
                "{} is neither permitted nor denied by domain of {})",
                client_ip, from
            ));
        }
        SpfResult::Pass => {
            out.push_str(&format!(
                "domain of {} designates {} as permitted sender)",
                from, client_ip
            ));
        }
    }
    out.push_str(&format!(
        "\n\treceiver={}; client-ip={}",
        ctx.local_name, client_ip
    ));
    if let Some(mech) = outcome.mechanism {
        out.push_str(&format!("; mechanism={}", mech));
    }
    out.push_str(&format!(
        ";\n\thelo={}; envelope-from=\"{}\"",
        ctx.helo, from
    ));
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::mock::MockDns;
    use crate::dns::MxHost;
    use std::net::Ipv4Addr;

    fn ctx(ip: &str) -> SpfContext<'static> {
        SpfContext {
            remote_ip: match ip.parse::<Ipv4Addr>() {
                Ok(v4) => v4.to_ipv6_mapped(),
                Err(_) => ip.parse().unwrap(),
            },
            helo: "mail.client.example",
            mail_from: Some("sender@sender.example"),
            local_name: "mx.example.org",
            remote_host: "mail.client.example",
        }
    }

    #[tokio::test]
    async fn fail_all() {
        let dns = MockDns::new().with_txt("sender.example", &["v=spf1 -all"]);
        let out = check_host(&dns, &ctx("192.0.2.1"), "sender.example").await;
        assert_eq!(out.result, SpfResult::Fail);
        assert_eq!(out.mechanism, Some("all"));
    }

    #[tokio::test]
    async fn pass_ip4() {
        let dns =
            MockDns::new().with_txt("sender.example", &["v=spf1 ip4:192.0.2.0/24 -all"]);
        let out = check_host(&dns, &ctx("192.0.2.99"), "sender.example").await;
        assert_eq!(out.result, SpfResult::Pass);
        assert_eq!(out.mechanism, Some("IP4"));
        let out = check_host(&dns, &ctx("192.0.3.1"), "sender.example").await;
        assert_eq!(out.result, SpfResult::Fail);
    }

    #[tokio::test]
    async fn pass_ip6() {
        let dns = MockDns::new().with_txt("sender.example", &["v=spf1 ip6:2001:db8::/32 ~all"]);
        let out = check_host(&dns, &ctx("2001:db8:1::5"), "sender.example").await;
        assert_eq!(out.result, SpfResult::Pass);
        let out = check_host(&dns, &ctx("2001:db9::1"), "sender.example").await;
        assert_eq!(out.result, SpfResult::SoftFail);
    }

    #[tokio::test]
    async fn a_mechanism_with_cidr() {
        let dns = MockDns::new()
            .with_txt("sender.example", &["v=spf1 a/24 -all"])
            .with_a4("sender.example", &["192.0.2.10".parse().unwrap()]);
        let out = check_host(&dns, &ctx("192.0.2.200"), "sender.example").await;
        assert_eq!(out.result, SpfResult::Pass);
    }

    #[tokio::test]
    async fn mx_mechanism_ignores_implicit() {
        let mx = vec![MxHost {
            addr: "::ffff:192.0.2.25".parse().unwrap(),
            priority: 10,
            name: "mx.sender.example".into(),
        }];
        let dns = MockDns::new()
            .with_txt("sender.example", &["v=spf1 mx -all"])
            .with_mx("sender.example", &mx);
        let out = check_host(&dns, &ctx("192.0.2.25"), "sender.example").await;
        assert_eq!(out.result, SpfResult::Pass);

        let implicit = vec![MxHost {
            addr: "::ffff:192.0.2.25".parse().unwrap(),
            priority: PRIO_IMPLICIT,
            name: "sender.example".into(),
        }];
        let dns = MockDns::new()
            .with_txt("sender.example", &["v=spf1 mx -all"])
            .with_mx("sender.example", &implicit);
        let out = check_host(&dns, &ctx("192.0.2.25"), "sender.example").await;
        assert_eq!(out.result, SpfResult::Fail);
    }

    #[tokio::test]
    async fn include_semantics() {
        let dns = MockDns::new()
            .with_txt("sender.example", &["v=spf1 include:other.example -all"])
            .with_txt("other.example", &["v=spf1 ip4:192.0.2.0/24 -all"]);
        let out = check_host(&dns, &ctx("192.0.2.1"), "sender.example").await;
        assert_eq!(out.result, SpfResult::Pass);
        // include target failing means continue, outer -all fails
        let out = check_host(&dns, &ctx("198.51.100.1"), "sender.example").await;
        assert_eq!(out.result, SpfResult::Fail);
        // include of a domain with no policy
        let dns = MockDns::new()
            .with_txt("sender.example", &["v=spf1 include:nopolicy.example -all"])
            .with_txt("nopolicy.example", &["something else"]);
        let out = check_host(&dns, &ctx("192.0.2.1"), "sender.example").await;
        assert_eq!(out.result, SpfResult::NonexistentInclude);
    }

    #[tokio::test]
    async fn redirect_is_followed() {
        let dns = MockDns::new()
            .with_txt("sender.example", &["v=spf1 redirect=real.example"])
            .with_txt("real.example", &["v=spf1 ip4:192.0.2.0/24 -all"]);
        let out = check_host(&dns, &ctx("192.0.2.1"), "sender.example").await;
        assert_eq!(out.result, SpfResult::Pass);
    }

    #[tokio::test]
    async fn no_record_is_none_nxdomain_is_none() {
        let dns = MockDns::new().with_txt("sender.example", &["not spf"]);
        let out = check_host(&dns, &ctx("192.0.2.1"), "sender.example").await;
        assert_eq!(out.result, SpfResult::None);
        let dns = MockDns::new();
        let out = check_host(&dns, &ctx("192.0.2.1"), "sender.example").await;
        assert_eq!(out.result, SpfResult::None);
    }

    #[tokio::test]
    async fn two_records_are_malformed() {
        let dns = MockDns::new().with_txt("sender.example", &["v=spf1 -all", "v=spf1 +all"]);
        let out = check_host(&dns, &ctx("192.0.2.1"), "sender.example").await;
        assert_eq!(out.result, SpfResult::MalformedRecord);
    }

    #[tokio::test]
    async fn unknown_mechanism_is_hard_error() {
        let dns = MockDns::new().with_txt("sender.example", &["v=spf1 frobnicate:x -all"]);
        let out = check_host(&dns, &ctx("192.0.2.1"), "sender.example").await;
        assert_eq!(out.result, SpfResult::HardError);
        assert_eq!(out.explanation.as_deref(), Some("frobnicate%x"));
    }

    #[tokio::test]
    async fn neutral_when_nothing_matches() {
        let dns = MockDns::new().with_txt("sender.example", &["v=spf1 ip4:198.51.100.0/24"]);
        let out = check_host(&dns, &ctx("192.0.2.1"), "sender.example").await;
        assert_eq!(out.result, SpfResult::Neutral);
    }

    #[tokio::test]
    async fn exists_with_macro() {
        let dns = MockDns::new()
            .with_txt("sender.example", &["v=spf1 exists:%{ir}.sp.sender.example -all"])
            .with_a4("1.2.0.192.sp.sender.example", &["127.0.0.2".parse().unwrap()]);
        let out = check_host(&dns, &ctx("192.0.2.1"), "sender.example").await;
        assert_eq!(out.result, SpfResult::Pass);
    }

    #[tokio::test]
    async fn lookup_limit_is_enforced() {
        // self-including record recurses; the lookup cap stops it
        let dns = MockDns::new().with_txt(
            "loop.example",
            &["v=spf1 include:loop.example -all"],
        );
        let out = check_host(&dns, &ctx("192.0.2.1"), "loop.example").await;
        assert_eq!(out.result, SpfResult::HardError);
    }

    #[tokio::test]
    async fn temp_error_propagates() {
        let mut dns = MockDns::new().with_txt("sender.example", &["v=spf1 a -all"]);
        dns.addr
            .insert("sender.example".to_string(), Err(DnsError::Temp));
        let out = check_host(&dns, &ctx("192.0.2.1"), "sender.example").await;
        assert_eq!(out.result, SpfResult::TempError);
    }

    #[tokio::test]
    async fn exp_is_fetched_on_fail() {
        let dns = MockDns::new()
            .with_txt(
                "sender.example",
                &["v=spf1 -all exp=why.sender.example"],
            )
            .with_txt("why.sender.example", &["mail from %{d} is not welcome"]);
        let out = check_host(&dns, &ctx("192.0.2.1"), "sender.example").await;
        assert_eq!(out.result, SpfResult::Fail);
        assert_eq!(
            out.explanation.as_deref(),
            Some("mail from sender.example is not welcome")
        );
    }

    #[tokio::test]
    async fn evaluation_is_deterministic() {
        let dns = MockDns::new().with_txt("sender.example", &["v=spf1 ip4:192.0.2.0/24 -all"]);
        let first = check_host(&dns, &ctx("192.0.2.7"), "sender.example").await;
        let second = check_host(&dns, &ctx("192.0.2.7"), "sender.example").await;
        assert_eq!(first.result, second.result);
        assert_eq!(first.mechanism, second.mechanism);
    }

    #[test]
    fn macro_transformations() {
        assert_eq!(transform("a.b.c", None, false, b".", false), "a.b.c");
        assert_eq!(transform("a.b.c", None, true, b".", false), "c.b.a");
        assert_eq!(transform("a.b.c", Some(2), false, b".", false), "b.c");
        assert_eq!(transform("a.b.c", Some(2), true, b".", false), "b.a");
        assert_eq!(transform("a-b", None, false, b"-", false), "a.b");
        assert_eq!(
            transform("x y", None, false, b".", true),
            "x%20y"
        );
    }

    #[test]
    fn received_spf_shape() {
        let c = ctx("192.0.2.1");
        let out = SpfOutcome {
            result: SpfResult::Pass,
            mechanism: Some("MX"),
            explanation: None,
        };
        let hdr = received_spf(&c, &out).unwrap();
        assert!(hdr.starts_with("Received-SPF: Pass (mx.example.org: "));
        assert!(hdr.contains("client-ip=192.0.2.1"));
        assert!(hdr.contains("mechanism=MX"));
        assert!(hdr.contains("envelope-from=\"sender@sender.example\""));
        let ignored = SpfOutcome {
            result: SpfResult::Ignored,
            mechanism: None,
            explanation: None,
        };
        assert!(received_spf(&c, &ignored).is_none());
    }
}
