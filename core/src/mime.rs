/*
 * mime.rs
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

//! MIME header scanning (RFC 2045/2046): folded-header whitespace and
//! comments, token/parameter grammar, multipart boundary extraction and
//! location. A malformed boundary definition is a hard error: every server
//! downstream would misinterpret the message, so the transfer must abort.

/// tspecials per RFC 2045.
pub fn is_tspecial(b: u8) -> bool {
    matches!(
        b,
        b'(' | b')' | b'<' | b'>' | b'@' | b',' | b';' | b':' | b'\\' | b'"' | b'/' | b'[' | b']'
            | b'?' | b'='
    )
}

fn is_wspace(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\r' | b'\n')
}

/// A malformed multipart declaration; carries the enhanced status text sent
/// before the transfer is aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MimeError {
    UnterminatedBoundary,
    EmptyBoundary,
    BoundaryTooLong,
    BoundaryTrailingSpace,
    BoundaryBadCharacter,
    Syntax,
}

impl MimeError {
    pub fn reply(&self) -> &'static str {
        match self {
            MimeError::UnterminatedBoundary => {
                "5.6.3 boundary definition is unterminated quoted string"
            }
            MimeError::EmptyBoundary => "5.6.3 boundary definition is empty",
            MimeError::BoundaryTooLong => "5.6.3 boundary definition is too long",
            MimeError::BoundaryTrailingSpace => {
                "5.6.3 quoted boundary definition may not end in space"
            }
            MimeError::BoundaryBadCharacter => {
                "5.6.3 boundary definition contains invalid character"
            }
            MimeError::Syntax => "5.6.3 syntax error in Content-Type header",
        }
    }
}

impl std::fmt::Display for MimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.reply())
    }
}

impl std::error::Error for MimeError {}

/// Skip linear whitespace, CRLF folding, and nested `(comments)` from the
/// start of `line`. Returns the offset of the first significant byte, or
/// `None` on an unfinished comment.
pub fn skip_whitespace(line: &[u8]) -> Option<usize> {
    let mut i = 0;
    loop {
        let mut advanced = false;
        while i < line.len() && (line[i] == b' ' || line[i] == b'\t') {
            i += 1;
            advanced = true;
        }
        while i < line.len() && (line[i] == b'\r' || line[i] == b'\n') {
            i += 1;
            advanced = true;
        }
        if advanced {
            continue;
        }
        if i >= line.len() || line[i] != b'(' {
            return Some(i);
        }
        // comment: track nesting, honor backslash escapes
        let mut depth = 0usize;
        loop {
            if i >= line.len() {
                return None;
            }
            match line[i] {
                b'(' if i == 0 || line[i - 1] != b'\\' => depth += 1,
                b')' if line[i - 1] != b'\\' => {
                    depth -= 1;
                    if depth == 0 {
                        i += 1;
                        break;
                    }
                }
                _ => {}
            }
            i += 1;
        }
    }
}

/// Length of a MIME token (RFC 2045 §5.1) at the start of `line`.
/// Zero means syntax error.
pub fn mime_token(line: &[u8]) -> usize {
    for (i, &b) in line.iter().enumerate() {
        if b == b';' || b == b'=' {
            return i;
        }
        if is_wspace(b) {
            // only trailing whitespace/comment may follow
            return match skip_whitespace(&line[i..]) {
                Some(j) if i + j == line.len() => i,
                _ => 0,
            };
        }
        if b <= 32 || is_tspecial(b) {
            return 0;
        }
    }
    line.len()
}

/// Length of a `token=value` parameter at the start of `line`, quoted
/// values included. Zero means syntax error.
pub fn mime_param(line: &[u8]) -> usize {
    let t = mime_token(line);
    if t == 0 || t == line.len() || line[t] != b'=' {
        return 0;
    }
    let mut i = t + 1;
    if i < line.len() && line[i] == b'"' {
        i += 1;
        while i < line.len() {
            if line[i] == b'"' && line[i - 1] != b'\\' {
                break;
            }
            i += 1;
        }
        if i < line.len() && line[i] == b'"' {
            i += 1;
        }
        if i == line.len() {
            return i;
        }
        if line[i] != b';' && line[i] != b'(' && !is_wspace(line[i]) {
            return 0;
        }
        i
    } else {
        if i < line.len() && is_wspace(line[i]) {
            return 0;
        }
        let j = mime_token(&line[i..]);
        i += j;
        if i == line.len() || line[i] == b';' || is_wspace(line[i]) {
            i
        } else {
            0
        }
    }
}

/// Length of one header field starting at `msg`, folded continuation lines
/// included. Zero if the field does not end inside the data.
pub fn field_len(msg: &[u8]) -> usize {
    let mut i = 0;
    loop {
        while i < msg.len() && msg[i] != b'\r' && msg[i] != b'\n' {
            i += 1;
        }
        if i < msg.len() && msg[i] == b'\r' {
            i += 1;
        }
        if i < msg.len() && msg[i] == b'\n' {
            i += 1;
        }
        if i >= msg.len() || (msg[i] != b' ' && msg[i] != b'\t') {
            break;
        }
    }
    if i > 0 && (msg[i - 1] == b'\n' || msg[i - 1] == b'\r') {
        i
    } else {
        0
    }
}

/// Check whether the RFC 2046 boundary charset allows this byte
/// (space only inside quoted values).
fn boundary_char_ok(b: u8, quoted: bool) -> bool {
    b.is_ascii_alphabetic()
        || (b'+'..=b':').contains(&b)
        || matches!(b, b'\'' | b'(' | b')' | b'_' | b'=' | b'?')
        || (quoted && b == b' ')
}

/// Scan the value of a `Content-Type:` header (everything after the colon)
/// and extract the boundary when the type is `multipart/*`.
/// `Ok(None)` for any other type.
pub fn is_multipart(value: &[u8]) -> Result<Option<String>, MimeError> {
    if value.is_empty() {
        return Ok(None);
    }
    let start = skip_whitespace(value).ok_or(MimeError::Syntax)?;
    if start == value.len() {
        return Err(MimeError::Syntax);
    }
    let rest = &value[start..];
    if rest.len() < 10 || !rest[..10].eq_ignore_ascii_case(b"multipart/") {
        return Ok(None);
    }
    let mut i = 10;
    let sub = mime_token(&rest[i..]);
    if sub == 0 {
        return Err(MimeError::Syntax);
    }
    i += sub;
    if i >= rest.len() || rest[i] != b';' {
        return Err(MimeError::Syntax);
    }
    i += 1;
    loop {
        let ws = skip_whitespace(&rest[i..]).ok_or(MimeError::Syntax)?;
        i += ws;
        if i >= rest.len() {
            // multipart without boundary is invalid
            return Err(MimeError::Syntax);
        }
        let plen = mime_param(&rest[i..]);
        if plen >= 10 && rest[i..i + 9].eq_ignore_ascii_case(b"boundary=") {
            let vstart = i + 9;
            let (raw, quoted) = if rest[vstart] == b'"' {
                let inner = &rest[vstart + 1..];
                let end = inner
                    .iter()
                    .position(|&b| b == b'"')
                    .ok_or(MimeError::UnterminatedBoundary)?;
                (&inner[..end], true)
            } else {
                let inner = &rest[vstart..];
                let end = inner
                    .iter()
                    .position(|&b| is_wspace(b) || b == b';')
                    .unwrap_or(inner.len());
                (&inner[..end], false)
            };
            if raw.is_empty() {
                return Err(MimeError::EmptyBoundary);
            }
            if raw.len() > 70 {
                return Err(MimeError::BoundaryTooLong);
            }
            if quoted && raw[raw.len() - 1] == b' ' {
                return Err(MimeError::BoundaryTrailingSpace);
            }
            if !raw.iter().all(|&b| boundary_char_ok(b, quoted)) {
                return Err(MimeError::BoundaryBadCharacter);
            }
            return Ok(Some(String::from_utf8_lossy(raw).into_owned()));
        }
        if plen == 0 {
            return Err(MimeError::Syntax);
        }
        i += plen;
        if i < rest.len() && rest[i] == b';' {
            i += 1;
        }
    }
}

/// Find the next `CRLF--boundary` in `buf`; returns the offset just past the
/// boundary text. The caller checks for a following `--` to detect the end
/// boundary. `None` when no boundary line is present.
pub fn find_boundary(buf: &[u8], boundary: &str) -> Option<usize> {
    let b = boundary.as_bytes();
    if buf.len() < b.len() + 3 {
        return None;
    }
    let mut pos = 0;
    while pos + 3 + b.len() <= buf.len() {
        if (buf[pos] == b'\r' || buf[pos] == b'\n')
            && buf[pos + 1] == b'-'
            && buf[pos + 2] == b'-'
            && &buf[pos + 3..pos + 3 + b.len()] == b
        {
            let end = pos + 3 + b.len();
            if end == buf.len() || is_wspace(buf[end]) {
                return Some(end);
            }
            if end + 1 < buf.len()
                && buf[end] == b'-'
                && buf[end + 1] == b'-'
                && (end + 2 == buf.len() || is_wspace(buf[end + 2]))
            {
                return Some(end);
            }
        }
        pos += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitespace_and_comments() {
        assert_eq!(skip_whitespace(b"  text"), Some(2));
        assert_eq!(skip_whitespace(b"\t\r\n (comment) x"), Some(14));
        assert_eq!(skip_whitespace(b"(nested (deep)) y"), Some(16));
        assert_eq!(skip_whitespace(b"(unfinished"), None);
        assert_eq!(skip_whitespace(b"plain"), Some(0));
    }

    #[test]
    fn token_grammar() {
        assert_eq!(mime_token(b"text"), 4);
        assert_eq!(mime_token(b"mixed; x"), 5);
        assert_eq!(mime_token(b"name=value"), 4);
        assert_eq!(mime_token(b"bad token more"), 0);
        assert_eq!(mime_token(b"trail  "), 5);
        assert_eq!(mime_token(b"a@b"), 0);
    }

    #[test]
    fn param_grammar() {
        assert_eq!(mime_param(b"charset=utf-8"), 13);
        assert_eq!(mime_param(b"boundary=\"a b\";x"), 14);
        assert_eq!(mime_param(b"boundary= x"), 0);
        assert_eq!(mime_param(b"noequals"), 0);
    }

    #[test]
    fn multipart_detection() {
        let b = is_multipart(b" multipart/mixed; boundary=abc123").unwrap();
        assert_eq!(b.as_deref(), Some("abc123"));
        let b = is_multipart(b" multipart/alternative; charset=x; boundary=\"b o u n d\"").unwrap();
        assert_eq!(b.as_deref(), Some("b o u n d"));
        assert_eq!(is_multipart(b" text/plain; charset=utf-8").unwrap(), None);
    }

    #[test]
    fn multipart_errors() {
        assert_eq!(
            is_multipart(b" multipart/mixed; boundary=\"never ends"),
            Err(MimeError::UnterminatedBoundary)
        );
        assert_eq!(
            is_multipart(b" multipart/mixed; boundary=\"\""),
            Err(MimeError::EmptyBoundary)
        );
        let long = format!(" multipart/mixed; boundary={}", "a".repeat(71));
        assert_eq!(
            is_multipart(long.as_bytes()),
            Err(MimeError::BoundaryTooLong)
        );
        assert_eq!(
            is_multipart(b" multipart/mixed; boundary=\"ends in space \""),
            Err(MimeError::BoundaryTrailingSpace)
        );
        assert_eq!(
            is_multipart(b" multipart/mixed; boundary=a*b"),
            Err(MimeError::BoundaryBadCharacter)
        );
        assert_eq!(is_multipart(b" multipart/mixed"), Err(MimeError::Syntax));
    }

    #[test]
    fn folded_field_length() {
        let msg = b"Content-Type: multipart/mixed;\r\n\tboundary=abc\r\nNext: header\r\n";
        assert_eq!(field_len(msg), 47);
        assert_eq!(field_len(b"no terminator"), 0);
    }

    #[test]
    fn boundary_location() {
        let body = b"preamble\r\n--frontier\r\npart one\r\n--frontier--\r\n";
        let first = find_boundary(body, "frontier").unwrap();
        assert_eq!(&body[first..first + 2], b"\r\n");
        let after = &body[first..];
        let second = find_boundary(after, "frontier").unwrap();
        assert_eq!(&after[second..second + 2], b"--");
        assert!(find_boundary(b"no boundary here", "frontier").is_none());
        // boundary must be preceded by a line break
        assert!(find_boundary(b"x--frontier\r\n", "frontier").is_none());
    }
}
