/*
 * qrdata.rs
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

//! DATA-mode body transmission: CRLF normalization, dot-stuffing, header
//! folding at the 998-octet line limit, and quoted-printable recoding of
//! 8-bit content for peers without 8BITMIME, descending into multipart
//! bodies so clean parts stay untouched.

use std::future::Future;
use std::pin::Pin;

use tracing::warn;

use crate::dns::Resolver;
use crate::mime::{field_len, find_boundary, is_multipart};

use super::{write_status, Delivery, Quit, EXT_8BITMIME};

/// Flags: 1 = contains 8-bit bytes, 2 = contains a line over 998 octets.
pub fn need_recode(buf: &[u8]) -> u8 {
    let mut res = 0u8;
    let mut llen = 0usize;
    for &b in buf {
        match b {
            b'\r' | b'\n' => llen = 0,
            _ => {
                llen += 1;
                if b >= 0x80 {
                    res |= 1;
                }
                if llen > 998 {
                    res |= 2;
                }
            }
        }
        if res == 3 {
            break;
        }
    }
    res
}

/// Normalize line endings to CRLF and optionally dot-stuff. `last_lf`
/// tracks whether the output so far ends in a line break.
pub fn normalize(buf: &[u8], dot_stuff: bool, last_lf: &mut bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(buf.len() + 16);
    let mut at_line_start = *last_lf;
    let mut i = 0;
    while i < buf.len() {
        let b = buf[i];
        match b {
            b'\r' => {
                out.extend_from_slice(b"\r\n");
                if i + 1 < buf.len() && buf[i + 1] == b'\n' {
                    i += 1;
                }
                at_line_start = true;
            }
            b'\n' => {
                out.extend_from_slice(b"\r\n");
                at_line_start = true;
            }
            b'.' if dot_stuff && at_line_start => {
                out.extend_from_slice(b"..");
                at_line_start = false;
            }
            _ => {
                out.push(b);
                at_line_start = false;
            }
        }
        i += 1;
    }
    *last_lf = out.last() == Some(&b'\n');
    out
}

/// The replacement Content-Transfer-Encoding header announcing the recode.
fn recode_header(helo: &str) -> Vec<u8> {
    format!(
        "Content-Transfer-Encoding: quoted-printable (recoded by: bastione-remote {} at {})\r\n",
        env!("CARGO_PKG_VERSION"),
        helo
    )
    .into_bytes()
}

/// Fold a single over-long header line at spaces; continuation lines start
/// with one space. Break points are searched down from 800, up to 970 if
/// the line has no earlier space.
fn wrap_line(line: &[u8], out: &mut Vec<u8>, first: bool) {
    let mut pos = 0;
    let mut first_part = first;
    while line.len() - pos >= 970 {
        let window = &line[pos..];
        let mut cut = 800.min(window.len() - 1);
        while cut > 0 && window[cut] != b' ' {
            cut -= 1;
        }
        if cut < 50 {
            cut = 800;
            while cut < 970.min(window.len() - 1) && window[cut] != b' ' {
                cut += 1;
            }
            if cut >= 970.min(window.len()) {
                cut = 800.min(window.len() - 1);
            }
        }
        if !first_part {
            out.push(b' ');
        }
        // the space stays at the end of the line; leading whitespace of a
        // continuation would be eaten by unfolding
        out.extend_from_slice(&window[..=cut]);
        out.extend_from_slice(b"\r\n");
        pos += cut + 1;
        first_part = false;
    }
    if !first_part {
        out.push(b' ');
    }
    out.extend_from_slice(&line[pos..]);
    out.extend_from_slice(b"\r\n");
}

/// Send a header block, folding any line longer than the wire allows.
fn wrap_header(buf: &[u8], last_lf: &mut bool) -> Vec<u8> {
    if need_recode(buf) & 2 == 0 {
        return normalize(buf, true, last_lf);
    }
    let mut out = Vec::with_capacity(buf.len() + 64);
    for raw in buf.split(|&b| b == b'\n') {
        let line = if raw.last() == Some(&b'\r') {
            &raw[..raw.len() - 1]
        } else {
            raw
        };
        if line.is_empty() && raw.is_empty() {
            continue;
        }
        if line.len() < 999 {
            let mut lf = true;
            let piece = normalize(line, true, &mut lf);
            out.extend_from_slice(&piece);
            out.extend_from_slice(b"\r\n");
        } else {
            wrap_line(line, &mut out, true);
        }
    }
    *last_lf = true;
    out
}

const HEX: &[u8] = b"0123456789ABCDEF";

/// Quoted-printable encode (RFC 2045 §6.7) with soft breaks keeping the
/// encoded line under 80 octets, stuffing dots, and protecting trailing
/// whitespace.
pub fn recode_qp(buf: &[u8], last_lf: &mut bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(buf.len() + buf.len() / 8);
    let mut llen = 0usize;
    let mut i = 0;
    let mut at_line_start = *last_lf;
    while i < buf.len() {
        let b = buf[i];
        if b == b'\r' || b == b'\n' {
            out.extend_from_slice(b"\r\n");
            if b == b'\r' && i + 1 < buf.len() && buf[i + 1] == b'\n' {
                i += 1;
            }
            llen = 0;
            at_line_start = true;
            i += 1;
            continue;
        }
        if llen > 72 {
            // soft line break; encode a whitespace we would otherwise
            // leave hanging at the line end
            if out.last() == Some(&b'\t') {
                out.pop();
                out.extend_from_slice(b"=09");
            } else if out.last() == Some(&b' ') {
                out.pop();
                out.extend_from_slice(b"=20");
            }
            out.extend_from_slice(b"=\r\n");
            llen = 0;
            at_line_start = true;
        }
        if at_line_start && b == b'.' {
            out.extend_from_slice(b"..");
            llen += 2;
        } else if b == b'\t' || b == b' ' {
            let next = buf.get(i + 1);
            if next == Some(&b'\r') || next == Some(&b'\n') || next.is_none() {
                // whitespace before a line break must be encoded
                if b == b'\t' {
                    out.extend_from_slice(b"=09");
                } else {
                    out.extend_from_slice(b"=20");
                }
                llen += 3;
            } else {
                out.push(b);
                llen += 1;
            }
        } else if b < 32 || b == b'=' || b > 126 {
            out.push(b'=');
            out.push(HEX[usize::from(b >> 4)]);
            out.push(HEX[usize::from(b & 0xf)]);
            llen += 3;
        } else {
            out.push(b);
            llen += 1;
        }
        at_line_start = false;
        i += 1;
    }
    *last_lf = out.last() == Some(&b'\n');
    out
}

/// Result of scanning one entity header.
struct HeaderScan {
    /// Offset of the first body byte.
    body: usize,
    /// Multipart boundary, when declared.
    boundary: Option<String>,
    /// Range of the Content-Transfer-Encoding field, to be replaced.
    cte: Option<(usize, usize)>,
}

fn scan_header(buf: &[u8]) -> Result<HeaderScan, &'static str> {
    let mut off = 0;
    let mut ctype: Option<(usize, usize)> = None;
    let mut cte: Option<(usize, usize)> = None;
    let mut body = None;
    // an empty header is legal
    if buf.first() == Some(&b'\r') {
        body = Some(if buf.get(1) == Some(&b'\n') { 2 } else { 1 });
    } else if buf.first() == Some(&b'\n') {
        body = Some(1);
    }
    while body.is_none() && off < buf.len() {
        let rest = &buf[off..];
        if starts_ci(rest, b"Content-Type:") {
            let l = field_len(rest);
            if l > 0 {
                ctype = Some((off, l));
                off += l;
            } else {
                off += rest.len();
            }
        } else if starts_ci(rest, b"Content-Transfer-Encoding:") {
            let l = field_len(rest);
            if l > 0 {
                cte = Some((off, l));
                off += l;
            } else {
                off += rest.len();
            }
        } else {
            // skip one folded field
            let l = field_len(rest);
            if l == 0 {
                off += rest.len();
            } else {
                off += l;
            }
        }
        // blank line ends the header
        if buf.get(off) == Some(&b'\r') {
            body = Some(if buf.get(off + 1) == Some(&b'\n') {
                off + 2
            } else {
                off + 1
            });
        } else if buf.get(off) == Some(&b'\n') {
            body = Some(off + 1);
        }
    }
    let body = body.ok_or("message contains unencoded 8bit data in message header")?;
    if need_recode(&buf[..body]) & 1 != 0 {
        return Err("message contains unencoded 8bit data in message header");
    }
    let boundary = match ctype {
        Some((start, len)) => {
            let field = &buf[start..start + len];
            let value = &field["Content-Type:".len()..];
            is_multipart(value).map_err(|_| "syntax error in Content-Type message header")?
        }
        None => None,
    };
    Ok(HeaderScan {
        body,
        boundary,
        cte,
    })
}

fn starts_ci(buf: &[u8], prefix: &[u8]) -> bool {
    buf.len() >= prefix.len() && buf[..prefix.len()].eq_ignore_ascii_case(prefix)
}

/// Skip transport padding after a boundary: whitespace and one [CR]LF.
fn skip_tpad(buf: &[u8]) -> usize {
    let mut off = 0;
    while off < buf.len() && (buf[off] == b' ' || buf[off] == b'\t') {
        off += 1;
    }
    if off < buf.len() && buf[off] == b'\r' {
        off += 1;
    }
    if off < buf.len() && buf[off] == b'\n' {
        off += 1;
    }
    off
}

pub(super) struct BodySender<'d, 'a, R: Resolver> {
    pub d: &'d mut Delivery<'a, R>,
    pub last_lf: bool,
}

impl<'d, 'a, R: Resolver> BodySender<'d, 'a, R> {
    async fn push(&mut self, bytes: Vec<u8>) -> Result<(), Quit> {
        if bytes.is_empty() {
            return Ok(());
        }
        self.d.write_all(&bytes).await
    }

    async fn send_plain(&mut self, buf: &[u8]) -> Result<(), Quit> {
        let mut lf = self.last_lf;
        let out = normalize(buf, true, &mut lf);
        if !out.is_empty() {
            self.last_lf = lf;
        }
        self.push(out).await
    }

    async fn send_literal(&mut self, bytes: &'static [u8]) -> Result<(), Quit> {
        self.last_lf = bytes.last() == Some(&b'\n');
        self.push(bytes.to_vec()).await
    }

    /// Recode one entity to quoted-printable, recursing into multipart
    /// bodies so only 8-bit parts get touched.
    fn send_qp<'s>(
        &'s mut self,
        buf: &'s [u8],
    ) -> Pin<Box<dyn Future<Output = Result<(), Quit>> + 's>> {
        Box::pin(async move {
            let scan = match scan_header(buf) {
                Ok(s) => s,
                Err(msg) => {
                    write_status(&format!("D5.6.3 {}", msg));
                    return Err(Quit);
                }
            };
            let helo = self.d.cfg.helo_name.clone();
            let mut lf = self.last_lf;
            match &scan.boundary {
                None => {
                    // single part: replace the declared encoding
                    match scan.cte {
                        Some((start, len)) => {
                            let head = wrap_header(&buf[..start], &mut lf);
                            self.last_lf = lf;
                            self.push(head).await?;
                            self.push(recode_header(&helo)).await?;
                            let mut lf2 = true;
                            let rest = wrap_header(&buf[start + len..scan.body], &mut lf2);
                            self.last_lf = lf2;
                            self.push(rest).await?;
                        }
                        None => {
                            self.push(recode_header(&helo)).await?;
                            let head = wrap_header(&buf[..scan.body], &mut lf);
                            self.last_lf = lf;
                            self.push(head).await?;
                        }
                    }
                    let mut lf = self.last_lf;
                    let body = recode_qp(&buf[scan.body..], &mut lf);
                    if !body.is_empty() {
                        self.last_lf = lf;
                    }
                    self.push(body).await
                }
                Some(boundary) => {
                    let boundary = boundary.clone();
                    // the boundary parameter stays; parts carry their own
                    // encodings, so the outer declaration is dropped
                    match scan.cte {
                        Some((start, len)) => {
                            let head = wrap_header(&buf[..start], &mut lf);
                            self.last_lf = lf;
                            self.push(head).await?;
                            let mut lf2 = true;
                            let rest = wrap_header(&buf[start + len..scan.body], &mut lf2);
                            self.last_lf = lf2;
                            self.push(rest).await?;
                        }
                        None => {
                            let head = wrap_header(&buf[..scan.body], &mut lf);
                            self.last_lf = lf;
                            self.push(head).await?;
                        }
                    }
                    self.send_multipart(&buf[scan.body..], &boundary).await
                }
            }
        })
    }

    async fn send_multipart(&mut self, body: &[u8], boundary: &str) -> Result<(), Quit> {
        let helo = self.d.cfg.helo_name.clone();
        let mut off = match find_boundary(body, boundary) {
            Some(first) => first,
            None => {
                // declared multipart without a single boundary: synthesize
                // the structure around the recoded content
                self.push(format!("\r\n--{}\r\n", boundary).into_bytes())
                    .await?;
                self.push(recode_header(&helo)).await?;
                self.send_literal(b"\r\n").await?;
                let mut lf = true;
                let out = recode_qp(body, &mut lf);
                self.last_lf = lf;
                self.push(out).await?;
                self.push(format!("\r\n--{}--\r\n", boundary).into_bytes())
                    .await?;
                self.last_lf = true;
                return Ok(());
            }
        };
        // preamble up to the first boundary, boundary text included
        let preamble = off;
        if need_recode(&body[..preamble]) != 0 {
            warn!("discarding invalid MIME preamble");
            self.push(
                format!("\r\ninvalid MIME preamble was discarded.\r\n\r\n--{}", boundary)
                    .into_bytes(),
            )
            .await?;
        } else {
            self.send_plain(&body[..preamble]).await?;
        }
        let mut is_last = false;
        if body.get(off) == Some(&b'-') {
            // an end boundary before any part
            self.push(format!("\r\n\r\n--{}--", boundary).into_bytes())
                .await?;
            is_last = true;
            off += 2;
        }
        off += skip_tpad(&body[off..]);
        self.send_literal(b"\r\n").await?;

        while off < body.len() && !is_last {
            let next = match find_boundary(&body[off..], boundary) {
                Some(n) => n,
                None => break,
            };
            let part_len = next - boundary.len() - 2;
            let part = &body[off..off + part_len];
            let nr = need_recode(part);
            if (self.d.ext & EXT_8BITMIME == 0 && nr & 1 != 0) || nr & 2 != 0 {
                self.send_qp(part).await?;
            } else {
                self.send_plain(part).await?;
            }
            self.push(format!("--{}", boundary).into_bytes()).await?;
            off += next;
            if body.get(off) == Some(&b'-') {
                self.send_literal(b"--").await?;
                off += 2;
                is_last = true;
            }
            off += skip_tpad(&body[off..]);
            if off >= body.len() && !is_last {
                self.send_literal(b"--\r\n").await?;
                return Ok(());
            }
            self.send_literal(b"\r\n").await?;
            if off >= body.len() {
                return Ok(());
            }
        }
        if !is_last {
            self.push(format!("\r\n--{}--\r\n", boundary).into_bytes())
                .await?;
            self.last_lf = true;
        }
        // what follows the end boundary is the epilogue; a broken one is
        // dropped rather than recoded
        if off < body.len() {
            if need_recode(&body[off..]) != 0 {
                warn!("discarding invalid MIME epilogue");
                self.send_literal(b"\r\ninvalid MIME epilogue has been discarded.\r\n")
                    .await?;
            } else {
                self.send_plain(&body[off..]).await?;
            }
        }
        Ok(())
    }
}

/// Send the message via DATA, recoding when the peer cannot take it
/// verbatim.
pub async fn send_data<R: Resolver>(
    d: &mut Delivery<'_, R>,
    msgdata: &[u8],
    recode: u8,
) -> Result<(), Quit> {
    if d.write_line("DATA").await.is_err() {
        write_status("Zconnection to remote server died");
        return Err(Quit);
    }
    let (code, line) = d.netget().await?;
    if code != 354 {
        let class = if code >= 500 { "D5" } else { "Z4" };
        let text = String::from_utf8_lossy(&line);
        write_status(&format!(
            "{}.3.0 remote host rejected DATA command: {}",
            class,
            text.get(4..).unwrap_or("")
        ));
        d.quit().await;
        return Err(Quit);
    }

    let last_lf = {
        let mut sender = BodySender { d, last_lf: true };
        if (sender.d.ext & EXT_8BITMIME == 0 && recode & 1 != 0) || recode & 2 != 0 {
            sender.d.mode = "(qp recoded) ";
            sender.send_qp(msgdata).await?;
        } else {
            sender.send_plain(msgdata).await?;
        }
        sender.last_lf
    };
    let terminator: &[u8] = if last_lf { b".\r\n" } else { b"\r\n.\r\n" };
    d.write_all(terminator).await?;

    report_success(d).await
}

/// Final reply: K/Z/D status with the acceptance report.
pub(super) async fn report_success<R: Resolver>(d: &mut Delivery<'_, R>) -> Result<(), Quit> {
    let encrypted = if d.encrypted { " encrypted" } else { "" };
    let pre = format!(
        "{} accepted {}message{}./Remote host said: ",
        d.rhost, d.mode, encrypted
    );
    d.checkreply(Some(*b"KZD"), Some(&[pre.as_str()]), 1).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recode_detection() {
        assert_eq!(need_recode(b"plain ascii\r\n"), 0);
        assert_eq!(need_recode(b"sch\xc3\xb6n\r\n"), 1);
        let long = [b'a'; 1100];
        assert_eq!(need_recode(&long), 2);
        let mut both = vec![b'\xff'];
        both.extend_from_slice(&[b'a'; 1100]);
        assert_eq!(need_recode(&both), 3);
    }

    #[test]
    fn normalize_fixes_endings_and_stuffs() {
        let mut lf = true;
        assert_eq!(normalize(b"a\nb\r\nc\rd", false, &mut lf), b"a\r\nb\r\nc\r\nd");
        let mut lf = true;
        assert_eq!(normalize(b".leading\r\n.dot", true, &mut lf), b"..leading\r\n..dot");
        let mut lf = false;
        // not at line start: no stuffing
        assert_eq!(normalize(b".x", true, &mut lf), b".x");
    }

    #[test]
    fn qp_basics() {
        let mut lf = true;
        assert_eq!(recode_qp(b"plain\r\n", &mut lf), b"plain\r\n");
        let mut lf = true;
        assert_eq!(recode_qp(b"=\r\n", &mut lf), b"=3D\r\n");
        let mut lf = true;
        assert_eq!(recode_qp(b"\xff\r\n", &mut lf), b"=FF\r\n");
        let mut lf = true;
        assert_eq!(recode_qp(b".dot\r\n", &mut lf), b"..dot\r\n");
        let mut lf = true;
        assert_eq!(recode_qp(b"tail \r\n", &mut lf), b"tail=20\r\n");
        let mut lf = true;
        assert_eq!(recode_qp(b"tab\t\r\n", &mut lf), b"tab=09\r\n");
    }

    #[test]
    fn qp_decode_roundtrip() {
        // decode what recode_qp produced and compare to the input
        fn qp_decode(enc: &[u8]) -> Vec<u8> {
            let mut out = Vec::new();
            let mut i = 0;
            while i < enc.len() {
                if enc[i] == b'=' && i + 2 < enc.len() && enc[i + 1] == b'\r' {
                    i += 3; // soft break
                } else if enc[i] == b'=' {
                    let hi = (enc[i + 1] as char).to_digit(16).unwrap() as u8;
                    let lo = (enc[i + 2] as char).to_digit(16).unwrap() as u8;
                    out.push(hi << 4 | lo);
                    i += 3;
                } else if enc[i] == b'.' && (i == 0 || enc[i - 1] == b'\n') {
                    // undo dot stuffing
                    if enc.get(i + 1) == Some(&b'.') {
                        out.push(b'.');
                        i += 2;
                    } else {
                        out.push(b'.');
                        i += 1;
                    }
                } else {
                    out.push(enc[i]);
                    i += 1;
                }
            }
            out
        }
        let input = b"some text with umlauts \xc3\xa4\xc3\xb6 and = signs, plus a rather long line that just keeps going to force a soft line break somewhere around the seventy-second column of output\r\n";
        let mut lf = true;
        let encoded = qp_decode(&recode_qp(input, &mut lf));
        assert_eq!(encoded, input);
        // encoded lines stay under 80 octets
        let mut lf = true;
        for line in recode_qp(input, &mut lf).split(|&b| b == b'\n') {
            assert!(line.len() <= 80);
        }
    }

    #[test]
    fn header_scan_finds_parts() {
        let msg = b"From: a@example.org\r\nContent-Type: multipart/mixed; boundary=xyz\r\nContent-Transfer-Encoding: 8bit\r\n\r\nbody";
        let scan = scan_header(msg).unwrap();
        assert_eq!(scan.boundary.as_deref(), Some("xyz"));
        assert!(scan.cte.is_some());
        assert_eq!(&msg[scan.body..], b"body");
    }

    #[test]
    fn header_scan_rejects_8bit() {
        let msg = b"From: \xff@example.org\r\n\r\nbody";
        assert!(scan_header(msg).is_err());
    }

    #[test]
    fn wrap_long_header_line() {
        let mut line = b"X-Long: ".to_vec();
        line.extend(std::iter::repeat_n(b"word ", 300).flatten().copied());
        let mut out = Vec::new();
        wrap_line(&line, &mut out, true);
        for l in out.split(|&b| b == b'\n') {
            assert!(l.len() <= 999, "folded line still too long: {}", l.len());
        }
        // unfolding gives back the original content modulo the folding
        // whitespace
        let unfolded: Vec<u8> = out
            .split(|&b| b == b'\n')
            .map(|l| l.strip_suffix(b"\r").unwrap_or(l))
            .map(|l| l.strip_prefix(b" ").unwrap_or(l))
            .collect::<Vec<_>>()
            .concat();
        assert_eq!(unfolded, line);
    }
}
