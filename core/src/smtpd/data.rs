/*
 * data.rs
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

//! Message reception: DATA with dot-unstuffing and header policing, BDAT
//! with CRLF state across chunks, synthesis of the trace headers, loop
//! detection, and the hand-off to the queue writer.

use tracing::{error, info};

use crate::dns::Resolver;
use crate::netio::NetError;
use crate::spf::received_spf;

use super::queue::{exit_reply, QueueChild};
use super::{CmdError, Session, STATE_BDAT, STATE_EHLO, STATE_HELO};

/// More Received lines than this and the message is looping.
const MAX_HOPS: u32 = 100;

/// RFC 2822 date of now, e.g. `Tue, 5 Jan 2026 11:02:45 +0100`.
fn date822() -> String {
    chrono::Local::now().format("%a, %d %b %Y %H:%M:%S %z").to_string()
}

/// The synthesized trace headers, written before the client's own header.
/// LF line endings: the queue writer expects Unix text.
fn trace_headers<R: Resolver>(sess: &Session<R>) -> String {
    let mut out = String::new();
    let authenticated = sess.state.auth_name.is_some() || sess.state.tls_client.is_some();
    if !authenticated && sess.relayclient != super::RelayState::Allowed {
        let ctx = crate::spf::SpfContext {
            remote_ip: sess.state.remote_ip,
            helo: sess.state.helo_str(),
            mail_from: sess.state.mail_from.as_ref().map(|a| a.addr.as_str()),
            local_name: &sess.cfg.helo_name,
            remote_host: &sess.state.remote_host,
        };
        if let Some(h) = received_spf(&ctx, &sess.state.spf) {
            out.push_str(&h);
            out.push('\n');
        }
    }
    let authhide = sess.cfg.authhide && authenticated;
    out.push_str("Received: from ");
    if !authhide {
        if sess.state.remote_host.is_empty() {
            out.push_str("unknown");
        } else {
            out.push_str(&sess.state.remote_host);
        }
        out.push_str(" ([");
        out.push_str(&sess.state.remote_ip_str);
        out.push(']');
        if let Some(helo) = &sess.state.helo {
            out.push_str(" HELO ");
            out.push_str(helo);
        }
    }
    if let Some(auth) = &sess.state.auth_name {
        if authhide {
            out.push_str("(auth=");
        } else {
            out.push_str(") (auth=");
        }
        out.push_str(auth);
    } else if authhide {
        out.push('(');
    } else if let Some(info) = &sess.state.remote_info {
        out.push_str(") (");
        out.push_str(info);
    }
    out.push_str(")\n\tby ");
    out.push_str(&sess.cfg.helo_name);
    out.push_str(&format!(" (bastioned {}) with ", env!("CARGO_PKG_VERSION")));
    if sess.chunked {
        out.push_str("(chunked) ");
    }
    out.push_str(sess.protocol);
    if sess.state.auth_name.is_some() {
        // RFC 3848: trailing A on the protocol for authenticated mail
        out.push('A');
    }
    out.push_str("\n\tfor <");
    if let Some(first) = sess.state.recipients.first() {
        out.push_str(&first.to.addr);
    }
    out.push_str(">; ");
    out.push_str(&date822());
    out.push('\n');
    out
}

/// Recipient as written into the envelope: an address literal gets our
/// localiphost substituted for the bracket form.
fn envelope_rcpt<R: Resolver>(sess: &Session<R>, addr: &str) -> String {
    match addr.rfind('@') {
        Some(i) if addr[i + 1..].starts_with('[') => {
            format!("{}@{}", &addr[..i], sess.cfg.liphost)
        }
        _ => addr.to_string(),
    }
}

fn log_received<R: Resolver>(sess: &Session<R>) {
    for r in sess.state.recipients.iter().filter(|r| r.ok) {
        info!(
            encrypted = sess.conn.is_encrypted(),
            chunked = sess.chunked,
            space_bug = sess.state.space_bug,
            to = %r.to.addr,
            from = %sess.state.mail_from_str(),
            ip = %sess.state.remote_ip_str,
            bytes = sess.msgsize,
            recipients = sess.state.goodrcpt,
            "received message"
        );
    }
}

fn log_rejected<R: Resolver>(sess: &Session<R>, reason: &str) {
    for r in sess.state.recipients.iter().filter(|r| r.ok) {
        info!(
            to = %r.to.addr,
            from = %sess.state.mail_from_str(),
            ip = %sess.state.remote_ip_str,
            bytes = sess.msgsize,
            reason = reason,
            "rejected message"
        );
    }
}

/// Close the transaction after the body is fully written: envelope, child
/// exit code, SMTP reply, state reset.
async fn queue_finish<R: Resolver>(sess: &mut Session<R>) -> Result<(), CmdError> {
    let mut q = sess.queue.take().expect("queue child is running");
    if let Err(e) = q.finish_body().await {
        error!(error = %e, "error closing body pipe");
    }
    log_received(sess);
    let sender = sess.state.mail_from_str().to_string();
    let recipients: Vec<String> = sess
        .state
        .recipients
        .iter()
        .filter(|r| r.ok)
        .map(|r| envelope_rcpt(sess, &r.to.addr))
        .collect();
    if let Err(e) = q.write_envelope(&sender, recipients.into_iter()) {
        error!(error = %e, "error writing envelope to queue");
        q.abort().await;
        sess.state.reset_transaction();
        sess.conn
            .write_line("451 4.3.0 error writing mail to queue")
            .await?;
        return Err(CmdError::Done);
    }
    let code = match q.wait().await {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "waitpid(queue writer) went wrong");
            sess.state.reset_transaction();
            sess.conn
                .write_line("451 4.3.2 error while writing mail to queue")
                .await?;
            return Err(CmdError::Done);
        }
    };
    sess.state.reset_transaction();
    sess.comstate = if sess.state.esmtp { STATE_EHLO } else { STATE_HELO };
    if code == 0 {
        sess.conn
            .write_line("250 2.5.0 accepted message for delivery")
            .await?;
        Ok(())
    } else {
        error!(code, "queue writer failed");
        sess.conn.write_line(exit_reply(code)).await?;
        Err(CmdError::Done)
    }
}

/// Why a DATA reception was aborted mid-stream.
enum Abort {
    /// Send this reply after draining the rest of the message.
    Msg(&'static str, &'static str),
    /// Drain, then let the main loop render this error.
    Code(CmdError),
    /// Transport failure; no draining possible.
    Net(NetError),
}

/// Read the message after the 354 go-ahead.
async fn receive_data<R: Resolver>(sess: &mut Session<R>) -> Result<(), Abort> {
    let maxbytes = if sess.cfg.databytes > 0 {
        sess.cfg.databytes
    } else {
        u64::MAX
    };
    let mut hops: u32 = 0;
    let mut flag_date = false;
    let mut flag_from = false;
    let check = sess.state.check2822 & 1 != 0;

    let header = trace_headers(sess);
    write_queue(sess, header.as_bytes()).await?;

    // header section
    let mut line = read_data_line(sess).await?;
    loop {
        if line == b"." || line.is_empty() || sess.msgsize > maxbytes {
            break;
        }
        if line[0] == b'.' {
            let mut out = line[1..].to_vec();
            out.push(b'\n');
            write_queue(sess, &out).await?;
            sess.msgsize += line.len() as u64 + 1;
        } else {
            let mut header_line = true;
            if check {
                if line.len() >= 5 && line[..5].eq_ignore_ascii_case(b"Date:") {
                    if flag_date {
                        return Err(Abort::Msg(
                            "550 5.6.0 message does not comply to RfC2822: more than one 'Date:'",
                            "more than one 'Date:' in header",
                        ));
                    }
                    flag_date = true;
                    header_line = false;
                } else if line.len() >= 5 && line[..5].eq_ignore_ascii_case(b"From:") {
                    if flag_from {
                        return Err(Abort::Msg(
                            "550 5.6.0 message does not comply to RfC2822: more than one 'From:'",
                            "more than one 'From:' in header",
                        ));
                    }
                    flag_from = true;
                    header_line = false;
                }
                if line.iter().any(|&b| b >= 0x80) {
                    return Err(Abort::Msg(
                        "550 5.6.0 message does not comply to RfC2822: 8bit character in message header",
                        "8bit-character in message header",
                    ));
                }
            }
            if header_line {
                if line.len() >= 9 && line[..9].eq_ignore_ascii_case(b"Received:") {
                    hops += 1;
                    if hops > MAX_HOPS {
                        return Err(Abort::Msg(
                            "554 5.4.6 too many hops, this message is looping",
                            "mail loop",
                        ));
                    }
                } else if line.len() > 20 && line.starts_with(b"Delivered-To: ") {
                    // we wrote these ourselves on the way in, so the exact
                    // spelling is ours
                    let delivered = &line[14..];
                    if sess
                        .state
                        .recipients
                        .iter()
                        .any(|r| r.ok && r.to.addr.as_bytes() == delivered)
                    {
                        return Err(Abort::Msg(
                            "554 5.4.6 message is looping, found a \"Delivered-To:\" line with one of the recipients",
                            "mail loop",
                        ));
                    }
                }
            }
            let mut out = line.clone();
            out.push(b'\n');
            write_queue(sess, &out).await?;
            sess.msgsize += line.len() as u64 + 2;
        }
        line = read_data_line(sess).await?;
    }
    if check {
        if !flag_date {
            return Err(Abort::Msg(
                "550 5.6.0 message does not comply to RfC2822: 'Date:' missing",
                "no 'Date:' in header",
            ));
        }
        if !flag_from {
            return Err(Abort::Msg(
                "550 5.6.0 message does not comply to RfC2822: 'From:' missing",
                "no 'From:' in header",
            ));
        }
    }
    if line.is_empty() {
        // empty line separates header from body
        write_queue(sess, b"\n").await?;
        line = read_data_line(sess).await?;
        while line != b"." && sess.msgsize <= maxbytes {
            if check && !sess.state.eightbit && line.iter().any(|&b| b >= 0x80) {
                return Err(Abort::Msg(
                    "550 5.6.0 message contains 8bit characters",
                    "8bit-character in message body",
                ));
            }
            let offset = usize::from(line.first() == Some(&b'.'));
            let mut out = line[offset..].to_vec();
            out.push(b'\n');
            write_queue(sess, &out).await?;
            sess.msgsize += (line.len() + 2 - offset) as u64;
            line = read_data_line(sess).await?;
        }
    }
    if sess.msgsize > maxbytes {
        return Err(Abort::Code(CmdError::MessageSize));
    }
    Ok(())
}

async fn read_data_line<R: Resolver>(sess: &mut Session<R>) -> Result<Vec<u8>, Abort> {
    match sess.conn.read_line().await {
        Ok(l) => Ok(l),
        Err(NetError::BadCrlf) => Err(Abort::Msg(
            "500 5.5.2 bad <CRLF> sequence",
            "bad CRLF sequence",
        )),
        Err(NetError::LineTooLong) => Err(Abort::Code(CmdError::LineTooLong)),
        Err(e) => Err(Abort::Net(e)),
    }
}

async fn write_queue<R: Resolver>(sess: &mut Session<R>, data: &[u8]) -> Result<(), Abort> {
    let q = sess.queue.as_mut().expect("queue child is running");
    q.write_body(data).await.map_err(|e| {
        error!(error = %e, "broken pipe to queue writer");
        Abort::Msg("451 4.3.0 error writing mail to queue", "queue write error")
    })
}

/// Swallow the remainder of the message up to the lone dot.
async fn drain_message<R: Resolver>(sess: &mut Session<R>) -> Result<(), NetError> {
    loop {
        match sess.conn.read_line().await {
            Ok(l) if l == b"." => return Ok(()),
            Ok(_) | Err(NetError::BadCrlf) | Err(NetError::LineTooLong) => {}
            Err(e) => return Err(e),
        }
    }
}

async fn handle_abort<R: Resolver>(sess: &mut Session<R>, abort: Abort) -> CmdError {
    if let Some(q) = sess.queue.take() {
        q.abort().await;
    }
    let e = match abort {
        Abort::Net(e) => return CmdError::Net(e),
        Abort::Msg(reply, log) => {
            log_rejected(sess, log);
            if let Err(e) = drain_message(sess).await {
                return CmdError::Net(e);
            }
            match sess.conn.write_line(reply).await {
                Ok(()) => CmdError::Done,
                Err(e) => CmdError::Net(e),
            }
        }
        Abort::Code(c) => {
            log_rejected(sess, "read error");
            if let Err(e) = drain_message(sess).await {
                return CmdError::Net(e);
            }
            c
        }
    };
    sess.state.reset_transaction();
    e
}

/// The DATA verb.
pub async fn smtp_data<R: Resolver>(sess: &mut Session<R>) -> Result<(), CmdError> {
    if sess.state.bad_bounce || sess.state.goodrcpt == 0 {
        sess.tarpit().await;
        sess.conn.write_line("554 5.1.1 no valid recipients").await?;
        return Err(CmdError::Done);
    }
    let authenticated = sess.state.auth_name.is_some() || sess.state.tls_client.is_some();
    let q = match QueueChild::spawn(authenticated) {
        Ok(q) => q,
        Err(e) => {
            error!(error = %e, "cannot start queue writer");
            sess.conn
                .write_line("451 4.3.0 cannot start queue writer")
                .await?;
            return Err(CmdError::Done);
        }
    };
    sess.queue = Some(q);
    sess.msgsize = 0;
    sess.chunked = false;
    // input already waiting here means the client ignored our replies
    if sess.conn.data_pending() {
        sess.sync_pipelining().await?;
        if let Some(q) = sess.queue.take() {
            q.abort().await;
        }
        return Err(CmdError::Handled);
    }
    sess.conn
        .write_line("354 Start mail input; end with <CRLF>.<CRLF>")
        .await?;

    match receive_data(sess).await {
        Ok(()) => queue_finish(sess).await,
        Err(abort) => Err(handle_abort(sess, abort).await),
    }
}

/// Convert CRLF pairs to LF, passing everything else through. A trailing
/// CR is held back and completed (or emitted) by the next chunk.
fn convert_crlf(chunk: &[u8], last_cr: &mut bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(chunk.len());
    for &b in chunk {
        if *last_cr {
            *last_cr = false;
            if b == b'\n' {
                out.push(b'\n');
                continue;
            }
            out.push(b'\r');
        }
        if b == b'\r' {
            *last_cr = true;
        } else {
            out.push(b);
        }
    }
    out
}

/// The BDAT verb: `BDAT <size> [LAST]`, body bytes read in binary mode.
pub async fn smtp_bdat<R: Resolver>(sess: &mut Session<R>, arg: &str) -> Result<(), CmdError> {
    if sess.state.bad_bounce || sess.state.goodrcpt == 0 {
        sess.tarpit().await;
        sess.conn.write_line("554 5.1.1 no valid recipients").await?;
        return Err(CmdError::Done);
    }
    let (num, last) = match arg.split_once(' ') {
        Some((n, rest)) => {
            if !rest.eq_ignore_ascii_case("LAST") {
                return Err(CmdError::Syntax);
            }
            (n, true)
        }
        None => (arg, false),
    };
    if num.is_empty() || !num.bytes().all(|b| b.is_ascii_digit()) {
        return Err(CmdError::Syntax);
    }
    let mut chunksize: u64 = num.parse().map_err(|_| CmdError::Syntax)?;

    if sess.comstate != STATE_BDAT {
        sess.msgsize = 0;
        sess.last_cr = false;
        sess.chunked = true;
        sess.comstate = STATE_BDAT;
        let authenticated = sess.state.auth_name.is_some() || sess.state.tls_client.is_some();
        match QueueChild::spawn(authenticated) {
            Ok(q) => sess.queue = Some(q),
            Err(e) => {
                error!(error = %e, "cannot start queue writer");
            }
        }
        if sess.queue.is_some() {
            let header = trace_headers(sess);
            if write_queue(sess, header.as_bytes()).await.is_err() {
                if let Some(q) = sess.queue.take() {
                    q.abort().await;
                }
            }
        }
    }

    // the declared bytes must be consumed even when the queue is broken
    let mut failed = sess.queue.is_none();
    while chunksize > 0 {
        let want = chunksize.min(2048) as usize;
        let mut buf = Vec::with_capacity(want);
        sess.conn.read_binary(want, &mut buf).await?;
        chunksize -= buf.len() as u64;
        sess.msgsize += buf.len() as u64;
        if !failed {
            let mut cr = sess.last_cr;
            let mut out = convert_crlf(&buf, &mut cr);
            if last && chunksize == 0 && cr {
                // a CR ending the final chunk is literal
                out.push(b'\r');
                cr = false;
            }
            sess.last_cr = cr;
            if write_queue(sess, &out).await.is_err() {
                failed = true;
                if let Some(q) = sess.queue.take() {
                    q.abort().await;
                }
            }
        }
    }

    let maxbytes = if sess.cfg.databytes > 0 {
        sess.cfg.databytes
    } else {
        u64::MAX
    };
    if sess.msgsize > maxbytes && !failed {
        log_rejected(sess, "message too big");
        if let Some(q) = sess.queue.take() {
            q.abort().await;
        }
        sess.state.reset_transaction();
        return Err(CmdError::MessageSize);
    }
    if failed {
        if let Some(q) = sess.queue.take() {
            q.abort().await;
        }
        sess.state.reset_transaction();
        sess.conn
            .write_line("451 4.3.0 error writing mail to queue")
            .await?;
        return Err(CmdError::Done);
    }
    if last {
        return queue_finish(sess).await;
    }
    let msg = format!("250 2.5.0 {} octets received", num);
    sess.conn.write_line(&msg).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crlf_conversion_within_chunk() {
        let mut cr = false;
        assert_eq!(convert_crlf(b"a\r\nb\r\n", &mut cr), b"a\nb\n");
        assert!(!cr);
    }

    #[test]
    fn crlf_split_across_chunks() {
        let mut cr = false;
        let first = convert_crlf(b"abc\r", &mut cr);
        assert_eq!(first, b"abc");
        assert!(cr);
        let second = convert_crlf(b"\ndef", &mut cr);
        assert_eq!(second, b"\ndef");
        assert!(!cr);
    }

    #[test]
    fn bare_cr_is_preserved() {
        let mut cr = false;
        let first = convert_crlf(b"a\r", &mut cr);
        assert_eq!(first, b"a");
        assert!(cr);
        let second = convert_crlf(b"b", &mut cr);
        assert_eq!(second, b"\rb");
        assert!(!cr);
    }

    #[test]
    fn date_is_rfc2822_shaped() {
        let d = date822();
        // "Tue, 05 Jan 2026 11:02:45 +0100"
        assert_eq!(&d[3..5], ", ");
        assert!(d.ends_with(|c: char| c.is_ascii_digit()));
        assert!(d.contains(':'));
    }
}
