/*
 * badmailfrom.rs
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

//! Sender and co-recipient blocklists. Entries come in three shapes:
//! a complete address (exact match), `@domain` (exact domain), or a bare
//! domain (suffix match on a `.` or `@` boundary).

use crate::addr::valid_list_address;
use crate::control;
use crate::dns::Resolver;

use super::{FilterCtx, FilterOutcome, FilterVerdict};

/// Match one mail address against one list entry.
pub fn entry_matches(addr: &str, entry: &str) -> bool {
    if let Some(domain) = entry.strip_prefix('@') {
        return addr
            .rfind('@')
            .is_some_and(|i| addr[i + 1..].eq_ignore_ascii_case(domain));
    }
    if !entry.contains('@') {
        if entry.len() >= addr.len() {
            return false;
        }
        let tail = &addr[addr.len() - entry.len()..];
        if !tail.eq_ignore_ascii_case(entry) {
            return false;
        }
        let boundary = addr.as_bytes()[addr.len() - entry.len() - 1];
        return boundary == b'.' || boundary == b'@';
    }
    addr.eq_ignore_ascii_case(entry)
}

fn load(
    ctx: &FilterCtx<'_, impl Resolver>,
    name: &str,
) -> Result<Option<(Vec<String>, crate::control::ConfScope)>, std::io::Error> {
    let (path, scope) = ctx.conf.get_file_global(name, &ctx.cfg.control_dir);
    let path = match path {
        Some(p) => p,
        None => return Ok(None),
    };
    let list = control::load_list(&path, Some(valid_list_address))
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "bad list file"))?;
    Ok(Some((list, scope)))
}

pub async fn cb_badmailfrom<R: Resolver>(
    ctx: &FilterCtx<'_, R>,
) -> Result<FilterOutcome, std::io::Error> {
    let from = match &ctx.state.mail_from {
        Some(f) => f,
        None => return Ok(FilterOutcome::pass()),
    };
    let (list, scope) = match load(ctx, "badmailfrom")? {
        Some(x) => x,
        None => return Ok(FilterOutcome::pass()),
    };
    if list.iter().any(|e| entry_matches(&from.addr, e)) {
        return Ok(FilterOutcome::denied(
            FilterVerdict::Denied,
            "bad mail from",
            scope,
        ));
    }
    Ok(FilterOutcome::pass())
}

/// One address per news group or web form never gets CC'd legitimately;
/// mail to several of them at once is a spam run. Earlier recipients of
/// this transaction are checked, including rejected ones.
pub async fn cb_badcc<R: Resolver>(
    ctx: &FilterCtx<'_, R>,
) -> Result<FilterOutcome, std::io::Error> {
    if ctx.state.recipients.len() < 2 {
        return Ok(FilterOutcome::pass());
    }
    let (list, scope) = match load(ctx, "badcc")? {
        Some(x) => x,
        None => return Ok(FilterOutcome::pass()),
    };
    let earlier = &ctx.state.recipients[..ctx.state.recipients.len() - 1];
    for r in earlier {
        if list.iter().any(|e| entry_matches(&r.to.addr, e)) {
            return Ok(FilterOutcome::denied(
                FilterVerdict::Denied,
                "bad CC",
                scope,
            ));
        }
    }
    Ok(FilterOutcome::pass())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_entry() {
        assert!(entry_matches("spammer@example.com", "spammer@example.com"));
        assert!(entry_matches("SPAMMER@EXAMPLE.COM", "spammer@example.com"));
        assert!(!entry_matches("other@example.com", "spammer@example.com"));
    }

    #[test]
    fn at_domain_entry() {
        assert!(entry_matches("foo@aol.com", "@aol.com"));
        assert!(!entry_matches("foo@bar.aol.com", "@aol.com"));
    }

    #[test]
    fn bare_domain_entry() {
        assert!(entry_matches("foo@aol.com", "aol.com"));
        assert!(entry_matches("foo@bar.aol.com", "aol.com"));
        assert!(!entry_matches("foo@no-aol.com", "aol.com"));
    }
}
