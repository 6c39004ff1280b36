/*
 * qrbdat.rs
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

//! Chunked body transmission: normalize line endings, slice into BDAT
//! chunks of the configured size, and never end a chunk between a CR and
//! its LF so the receiver needs no carry state.

use crate::dns::Resolver;

use super::qrdata::normalize;
use super::{Delivery, Quit};

/// Send the message as BDAT chunks. Intermediate chunks expect 250; the
/// final chunk carries LAST and the acceptance report.
pub async fn send_bdat<R: Resolver>(
    d: &mut Delivery<'_, R>,
    msgdata: &[u8],
) -> Result<(), Quit> {
    d.mode = "chunked ";
    let mut lf = true;
    let body = normalize(msgdata, false, &mut lf);
    let chunk_size = d.cfg.chunk_size.max(16);

    let mut off = 0;
    loop {
        let mut end = (off + chunk_size).min(body.len());
        // never split a CRLF pair across chunks
        if end < body.len() && body[end - 1] == b'\r' {
            end -= 1;
        }
        let chunk = &body[off..end];
        let last = end == body.len();
        let header = if last {
            format!("BDAT {} LAST\r\n", chunk.len())
        } else {
            format!("BDAT {}\r\n", chunk.len())
        };
        let mut out = Vec::with_capacity(header.len() + chunk.len());
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(chunk);
        d.write_all(&out).await?;
        if last {
            break;
        }
        if d.checkreply(Some(*b" ZD"), None, 0).await? != 250 {
            d.quit().await;
            return Err(Quit);
        }
        off = end;
    }
    super::qrdata::report_success(d).await
}
