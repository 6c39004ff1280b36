/*
 * nomail.rs
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

//! A recipient refusing all mail. The `nomail` file may be empty (generic
//! rejection), carry a complete `XYY X.Y.Y text` reply, or bare text that
//! gets the 550 5.7.1 prefix.

use crate::dns::Resolver;

use super::{FilterCtx, FilterOutcome, FilterVerdict};

/// Check for a leading `XYY X.Y.Y ` SMTP code, X being 4 or 5.
fn starts_with_code(msg: &str) -> bool {
    let b = msg.as_bytes();
    if b.len() <= 10 {
        return false;
    }
    (b[0] == b'4' || b[0] == b'5')
        && b[1].is_ascii_digit()
        && b[2].is_ascii_digit()
        && b[3] == b' '
        && b[4] == b[0]
        && b[5] == b'.'
        && b[6].is_ascii_digit()
        && b[7] == b'.'
        && b[8].is_ascii_digit()
        && b[9] == b' '
}

pub async fn cb_nomail<R: Resolver>(
    ctx: &FilterCtx<'_, R>,
) -> Result<FilterOutcome, std::io::Error> {
    let (path, scope) = ctx.conf.get_file("nomail");
    let path = match path {
        Some(p) => p,
        None => return Ok(FilterOutcome::pass()),
    };
    let content = std::fs::read_to_string(&path)?;
    let msg = content.trim_end();
    let verdict = if msg.is_empty() {
        FilterVerdict::Denied
    } else if starts_with_code(msg) {
        FilterVerdict::DeniedMsg(msg.to_string())
    } else {
        FilterVerdict::DeniedMsg(format!("550 5.7.1 {}", msg))
    };
    Ok(FilterOutcome::denied(verdict, "nomail", scope))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_detection() {
        assert!(starts_with_code("552 5.2.1 gone fishing"));
        assert!(starts_with_code("451 4.7.1 try later"));
        assert!(!starts_with_code("452 5.2.1 mismatched class"));
        assert!(!starts_with_code("no code here"));
        assert!(!starts_with_code("552"));
    }
}
