/*
 * addr.rs
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

//! Syntax of domains (RFC 1035) and SMTP mailbox arguments (RFC 5321):
//! `<source-route:local@domain>` with quoted localparts and address
//! literals. Parsing never resolves anything; it only classifies.

use std::net::{Ipv4Addr, Ipv6Addr};

/// What kind of address a mailbox argument turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrClass {
    /// Only a domain name (or a bare `postmaster` in RCPT context).
    DomainOnly,
    /// `@domain` without a localpart.
    AtDomain,
    /// `local@domain`.
    Full,
    /// `local@[ip]` or `local@[IPv6:...]`.
    Literal,
}

/// A syntactically valid mailbox, domain lowercased.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAddr {
    pub addr: String,
    pub class: AddrClass,
}

impl ParsedAddr {
    /// The part after the `@`, or the whole string when there is none.
    pub fn domain(&self) -> &str {
        match self.addr.rfind('@') {
            Some(i) => &self.addr[i + 1..],
            None => &self.addr,
        }
    }

    pub fn localpart(&self) -> &str {
        match self.addr.rfind('@') {
            Some(i) => &self.addr[..i],
            None => &self.addr,
        }
    }
}

/// Context a mailbox argument appears in; `<>` is only valid in MAIL FROM,
/// bare `postmaster` only in RCPT TO, and only RCPT TO may carry a source
/// route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrContext {
    MailFrom,
    RcptTo,
}

/// Validate a fully qualified domain name: `[A-Za-z0-9.-]` only, 1..=255
/// bytes, at least one dot, no empty label, no label over 63 bytes, no
/// leading or trailing dot, and the TLD is at least two characters ending
/// in a letter.
pub fn domain_valid(host: &str) -> bool {
    let bytes = host.as_bytes();
    if bytes.is_empty() || bytes.len() > 255 {
        return false;
    }
    if !bytes
        .iter()
        .all(|&b| b.is_ascii_alphanumeric() || b == b'.' || b == b'-')
    {
        return false;
    }
    let mut labels = host.split('.');
    let mut count = 0;
    let mut last = "";
    for label in &mut labels {
        if label.is_empty() || label.len() > 63 {
            return false;
        }
        last = label;
        count += 1;
    }
    if count < 2 {
        return false;
    }
    // the TLD has at least two characters and ends in a letter
    last.len() >= 2 && last.bytes().last().is_some_and(|b| b.is_ascii_alphabetic())
}

/// Validator for address list files: entries may be full addresses,
/// `@domain`, or a bare domain.
pub fn valid_list_address(entry: &str) -> bool {
    classify(entry).is_some()
}

/// Localpart atext per RFC 5321 (dot-atoms, unquoted form).
fn is_atext(b: u8) -> bool {
    b.is_ascii_alphanumeric()
        || matches!(
            b,
            b'.' | b'!'
                | b'#'..=b'\''
                | b'*'
                | b'+'
                | b'-'
                | b'/'
                | b'='
                | b'?'
                | b'^'..=b'`'
                | b'{'..=b'~'
        )
}

/// Validate a localpart, quoted strings included. Returns the index of the
/// terminating `@` (or the end) on success.
fn parse_localpart(addr: &[u8]) -> Option<usize> {
    let mut quoted = false;
    let mut i = 0;
    while i < addr.len() && addr[i] != b'@' {
        let b = addr[i];
        if b == b'"' {
            quoted = !quoted;
        } else if !quoted {
            if !is_atext(b) {
                return None;
            }
        } else if b == b'\\' {
            // backslash masks only a quote or another backslash
            match addr.get(i + 1) {
                Some(b'"') | Some(b'\\') => i += 1,
                _ => return None,
            }
        } else if !matches!(b, 35..=91 | 93..=126 | 1..=8 | 11 | 12 | 14..=31) {
            return None;
        }
        i += 1;
    }
    if quoted {
        None
    } else {
        Some(i)
    }
}

/// Classify an address string (no angle brackets). `None` means invalid.
fn classify(addr: &str) -> Option<AddrClass> {
    let at = match addr.rfind('@') {
        None => {
            return if domain_valid(addr) {
                Some(AddrClass::DomainOnly)
            } else {
                None
            };
        }
        Some(i) => i,
    };
    let local = &addr.as_bytes()[..at];
    if local.len() > 64 {
        return None;
    }
    if parse_localpart(addr.as_bytes()) != Some(at) {
        return None;
    }
    let domain = &addr[at + 1..];
    if domain.len() > 255 {
        return None;
    }
    if at == 0 {
        return if domain_valid(domain) {
            Some(AddrClass::AtDomain)
        } else {
            None
        };
    }
    if let Some(inner) = domain.strip_prefix('[') {
        let inner = inner.strip_suffix(']')?;
        if let Some(v6) = inner.strip_prefix("IPv6:") {
            v6.parse::<Ipv6Addr>().ok()?;
        } else {
            inner.parse::<Ipv4Addr>().ok()?;
        }
        return Some(AddrClass::Literal);
    }
    if domain_valid(domain) {
        Some(AddrClass::Full)
    } else {
        None
    }
}

/// Result of parsing a mailbox argument.
#[derive(Debug, PartialEq, Eq)]
pub struct Mailbox<'a> {
    /// `None` for the empty reverse path `<>`.
    pub addr: Option<ParsedAddr>,
    /// The input following the closing `>`.
    pub rest: &'a str,
}

/// Parse the part of a MAIL FROM / RCPT TO argument after the opening `<`.
/// A source route (`@a.example,@b.example:`) is syntax-checked and
/// discarded; the address itself is lowercased in the domain part.
pub fn parse_mailbox(input: &str, ctx: AddrContext) -> Option<Mailbox<'_>> {
    let mut body = input;
    if ctx == AddrContext::RcptTo && body.starts_with('@') {
        // strip the source route: {@fqdn,}*@fqdn:
        let colon = body.find(':')?;
        if colon + 1 > 256 {
            return None;
        }
        for hop in body[..colon].split(',') {
            let fqdn = hop.strip_prefix('@')?;
            if !domain_valid(fqdn) {
                return None;
            }
        }
        body = &body[colon + 1..];
    }
    let close = body.find('>')?;
    let (addr, rest) = (&body[..close], &body[close + 1..]);

    if addr.is_empty() {
        // the empty reverse path is only allowed in MAIL FROM
        return if ctx == AddrContext::MailFrom {
            Some(Mailbox { addr: None, rest })
        } else {
            None
        };
    }

    let class = if ctx == AddrContext::RcptTo && addr.eq_ignore_ascii_case("postmaster") {
        AddrClass::DomainOnly
    } else {
        match classify(addr)? {
            AddrClass::Full => AddrClass::Full,
            AddrClass::Literal => AddrClass::Literal,
            // a bare domain or @domain is no valid mailbox
            _ => return None,
        }
    };

    let normalized = match addr.rfind('@') {
        Some(i) => format!("{}{}", &addr[..i], addr[i..].to_ascii_lowercase()),
        None => addr.to_ascii_lowercase(),
    };
    Some(Mailbox {
        addr: Some(ParsedAddr {
            addr: normalized,
            class,
        }),
        rest,
    })
}
