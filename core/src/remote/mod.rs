/*
 * mod.rs
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

//! The outbound relay client: MX resolution with static-route overrides,
//! connection fail-over, extension negotiation, STARTTLS, the pipelined
//! envelope, and per-recipient status reporting to the spawner on fd 1.

pub mod qrbdat;
pub mod qrdata;
pub mod smtproutes;
pub mod starttls;

use std::io::Write;
use std::net::Ipv6Addr;
use std::path::PathBuf;
use std::time::Duration;

use tokio::net::TcpSocket;
use tracing::warn;

use crate::control::{self, ControlError};
use crate::dns::{sort_mx, MxHost, Resolver, PRIO_CURRENT, PRIO_TRIED};
use crate::netio::{Conn, NetError, SmtpStream};

pub const EXT_SIZE: u8 = 0x01;
pub const EXT_PIPELINING: u8 = 0x02;
pub const EXT_STARTTLS: u8 = 0x04;
pub const EXT_8BITMIME: u8 = 0x08;
pub const EXT_CHUNKING: u8 = 0x10;

/// Status channel to the spawner: message text, LF, terminating NUL.
pub fn write_status(msg: &str) {
    let mut out = Vec::with_capacity(msg.len() + 2);
    out.extend_from_slice(msg.as_bytes());
    out.push(b'\n');
    out.push(0);
    let _ = std::io::stdout().write_all(&out);
    let _ = std::io::stdout().flush();
}

fn write_raw(bytes: &[u8]) {
    let _ = std::io::stdout().write_all(bytes);
    let _ = std::io::stdout().flush();
}

/// The delivery ended; whatever had to go to fd 1 is already there.
pub struct Quit;

type DResult<T> = Result<T, Quit>;

pub struct RemoteConfig {
    pub control_dir: PathBuf,
    pub helo_name: String,
    pub timeout: Duration,
    pub chunk_size: usize,
    pub outgoing_ip: Option<Ipv6Addr>,
}

impl RemoteConfig {
    pub fn load(base_dir: &std::path::Path) -> Result<Self, ControlError> {
        let control_dir = base_dir.join("control");
        let c = |n: &str| control_dir.join(n);
        let helo_name = match control::load_oneliner(&c("helohost"), true)? {
            Some(h) => h,
            None => control::load_oneliner(&c("me"), false)?.expect("mandatory oneliner"),
        };
        if !crate::addr::domain_valid(&helo_name) {
            return Err(ControlError::Malformed(c("helohost")));
        }
        let timeout = control::load_int(&c("timeoutremote"), 320)?;
        let chunk_size = control::load_int(&c("chunksizeremote"), 32768)?;
        if chunk_size >= 1 << 31 {
            return Err(ControlError::Malformed(c("chunksizeremote")));
        }
        let outgoing_ip = match control::load_oneliner(&c("outgoingip"), true)? {
            Some(s) => Some(
                crate::smtpd::parse_ip(&s).ok_or(ControlError::Malformed(c("outgoingip")))?,
            ),
            None => None,
        };
        Ok(Self {
            control_dir,
            helo_name,
            timeout: Duration::from_secs(timeout),
            chunk_size: chunk_size as usize,
            outgoing_ip,
        })
    }
}

/// One outbound delivery attempt over an established connection.
pub struct Delivery<'a, R: Resolver> {
    pub cfg: &'a RemoteConfig,
    pub dns: &'a R,
    pub conn: Conn,
    /// Peer-advertised extension mask.
    pub ext: u8,
    /// SIZE advertised by the peer, 0 if none.
    pub remote_size: u64,
    /// Display name of the peer: `fqdn [ip]` or `[ip]`.
    pub rhost: String,
    /// Verified reverse name of the peer, for TLS certificate matching.
    pub partner_fqdn: Option<String>,
    /// Body transfer description for the success report.
    pub mode: &'static str,
    pub encrypted: bool,
}

impl<'a, R: Resolver> Delivery<'a, R> {
    /// Read one reply line and parse the SMTP code. Network and syntax
    /// problems end the delivery with a Z status.
    pub async fn netget(&mut self) -> DResult<(u16, Vec<u8>)> {
        let line = match self.conn.read_line().await {
            Ok(l) => l,
            Err(NetError::Timeout) => {
                write_status("Zconnection to remote server died");
                warn!("connection timed out");
                return Err(Quit);
            }
            Err(NetError::PeerClosed) => {
                write_status("Zconnection to remote timed out");
                warn!("connection died");
                return Err(Quit);
            }
            Err(NetError::BadCrlf) | Err(NetError::LineTooLong) => {
                write_status("Zsyntax error in server reply");
                self.quit().await;
                return Err(Quit);
            }
            Err(NetError::Io(e)) => {
                write_status(&format!("Z{}", e));
                self.quit().await;
                return Err(Quit);
            }
        };
        if line.len() < 3
            || (line.len() > 3 && line[3] != b' ' && line[3] != b'-')
            || !line[..3].iter().all(|b| b.is_ascii_digit())
        {
            write_status("Zsyntax error in server reply");
            self.quit().await;
            return Err(Quit);
        }
        let code = (line[0] - b'0') as u16 * 100 + (line[1] - b'0') as u16 * 10
            + (line[2] - b'0') as u16;
        if !(200..600).contains(&code) {
            write_status("Zsyntax error in server reply");
            self.quit().await;
            return Err(Quit);
        }
        Ok((code, line))
    }

    /// Read a whole (possibly multi-line) reply and report it on fd 1.
    ///
    /// `status` holds the three report characters for 2xx / 4xx / 5xx; a
    /// leading space means success stays silent. `pre` lines are prepended
    /// when the reply class matches `mask` (1: 2xx, 2: 4xx, 4: 5xx).
    pub async fn checkreply(
        &mut self,
        status: Option<[u8; 3]>,
        pre: Option<&[&str]>,
        mask: u8,
    ) -> DResult<u16> {
        let (code, line) = self.netget().await?;
        let mut ignore = false;
        let mut out: Vec<u8> = Vec::new();
        if let Some(status) = status {
            let class = if (211..=252).contains(&code) {
                if status[0] == b' ' {
                    ignore = true;
                } else {
                    out.push(status[0]);
                }
                1
            } else if (421..=452).contains(&code) {
                out.push(status[1]);
                2
            } else {
                out.push(status[2]);
                4
            };
            if !ignore {
                if let Some(pre) = pre {
                    if class & mask != 0 {
                        for p in pre {
                            out.extend_from_slice(p.as_bytes());
                        }
                    }
                }
                out.extend_from_slice(&line);
            }
        }
        let mut last = line;
        while last.len() > 3 && last[3] == b'-' {
            let (_, next) = self.netget().await?;
            if status.is_some() && !ignore {
                out.extend_from_slice(&next);
                out.push(b'\n');
            }
            last = next;
        }
        if status.is_some() && !ignore {
            out.push(0);
            write_raw(&out);
        }
        // map out-of-range codes so a < 300 check means success
        Ok(if code < 200 { 599 } else { code })
    }

    /// EHLO, falling back to HELO; fills the extension mask.
    pub async fn greeting(&mut self) -> DResult<bool> {
        let cmd = format!("EHLO {}", self.cfg.helo_name);
        if self.write_line(&cmd).await.is_err() {
            return Ok(false);
        }
        self.ext = 0;
        self.remote_size = 0;
        let mut code;
        loop {
            let (c, line) = self.netget().await?;
            code = c;
            if c == 250 && line.len() > 4 {
                let ext = &line[4..];
                if starts_ci(ext, b"SIZE") {
                    let arg = &ext[4..];
                    if arg.is_empty() {
                        self.ext |= EXT_SIZE;
                    } else if arg[0] == b' ' {
                        match std::str::from_utf8(&arg[1..])
                            .ok()
                            .and_then(|s| s.parse::<u64>().ok())
                        {
                            Some(n) => {
                                self.remote_size = n;
                                self.ext |= EXT_SIZE;
                            }
                            None => warn!("syntax error in EHLO response \"SIZE\""),
                        }
                    }
                } else if ext.eq_ignore_ascii_case(b"PIPELINING") {
                    self.ext |= EXT_PIPELINING;
                } else if ext.eq_ignore_ascii_case(b"STARTTLS") {
                    self.ext |= EXT_STARTTLS;
                } else if ext.eq_ignore_ascii_case(b"8BITMIME") {
                    self.ext |= EXT_8BITMIME;
                } else if ext.eq_ignore_ascii_case(b"CHUNKING") {
                    self.ext |= EXT_CHUNKING;
                }
            }
            if line.len() <= 3 || line[3] != b'-' {
                break;
            }
        }
        if code == 250 {
            return Ok(true);
        }
        // EHLO failed, try HELO
        let cmd = format!("HELO {}", self.cfg.helo_name);
        if self.write_line(&cmd).await.is_err() {
            return Ok(false);
        }
        loop {
            let (c, line) = self.netget().await?;
            code = c;
            if line.len() <= 3 || line[3] != b'-' {
                break;
            }
        }
        self.ext = 0;
        Ok(code == 250)
    }

    pub async fn write_line(&mut self, line: &str) -> Result<(), NetError> {
        self.conn.write_line(line).await
    }

    pub async fn write_all(&mut self, data: &[u8]) -> DResult<()> {
        match self.conn.write_all(data).await {
            Ok(()) => Ok(()),
            Err(NetError::Timeout) => {
                write_status("Zconnection to remote server died");
                Err(Quit)
            }
            Err(e) => {
                write_status(&format!("Z{}", e));
                Err(Quit)
            }
        }
    }

    /// Clean shutdown: QUIT, wait for the 221, close.
    pub async fn quit(&mut self) {
        if self.conn.write_line("QUIT").await.is_ok() {
            loop {
                match self.conn.read_line().await {
                    Ok(l) if l.len() > 3 && l[3] == b'-' => {}
                    _ => break,
                }
            }
        }
        self.conn.shutdown().await;
    }
}

fn starts_ci(buf: &[u8], prefix: &[u8]) -> bool {
    buf.len() >= prefix.len() && buf[..prefix.len()].eq_ignore_ascii_case(prefix)
}

/// Resolve the target host list: bracket literals, static routes, then MX.
/// Returns the sorted list plus the target port.
pub async fn get_mx_list<R: Resolver>(
    cfg: &RemoteConfig,
    dns: &R,
    remhost: &str,
) -> DResult<(Vec<MxHost>, u16)> {
    if let Some(inner) = remhost.strip_prefix('[').and_then(|r| r.strip_suffix(']')) {
        match crate::smtpd::parse_ip(inner) {
            Some(addr) => {
                let mx = vec![MxHost {
                    addr,
                    priority: 0,
                    name: inner.to_string(),
                }];
                return Ok((mask_unroutable(cfg, mx), 25));
            }
            None => {
                warn!(host = remhost, "parse error in first argument");
                write_status("Z4.3.0 parse error in first argument");
                return Err(Quit);
            }
        }
    }
    let mut port = 25;
    let route = match smtproutes::smtproute(dns, &cfg.control_dir, remhost).await {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "bad smtproutes configuration");
            write_status("Z4.3.0 Configuration error.");
            return Err(Quit);
        }
    };
    let mut mx = match route {
        Some(r) => {
            port = r.port;
            r.mx
        }
        None => Vec::new(),
    };
    if mx.is_empty() {
        mx = match dns.mx(remhost).await {
            Ok(mx) => mx,
            Err(_) => {
                write_status(&format!("Z4.4.3 cannot find a mail exchanger for {}", remhost));
                return Err(Quit);
            }
        };
    }
    sort_mx(&mut mx);
    Ok((mask_unroutable(cfg, mx), port))
}

/// With an IPv4 outgoing address there is no way to reach IPv6 targets;
/// mark them as already tried.
fn mask_unroutable(cfg: &RemoteConfig, mut mx: Vec<MxHost>) -> Vec<MxHost> {
    if let Some(out) = cfg.outgoing_ip {
        if out.to_ipv4_mapped().is_some() {
            for h in &mut mx {
                if h.addr.to_ipv4_mapped().is_none() {
                    h.priority = PRIO_TRIED;
                }
            }
        }
    }
    mx
}

async fn connect_one(
    cfg: &RemoteConfig,
    addr: Ipv6Addr,
    port: u16,
) -> std::io::Result<tokio::net::TcpStream> {
    let (socket, remote) = match addr.to_ipv4_mapped() {
        Some(v4) => (TcpSocket::new_v4()?, std::net::SocketAddr::from((v4, port))),
        None => (TcpSocket::new_v6()?, std::net::SocketAddr::from((addr, port))),
    };
    if let Some(out) = cfg.outgoing_ip {
        let local = match out.to_ipv4_mapped() {
            Some(v4) => std::net::SocketAddr::from((v4, 0)),
            None => std::net::SocketAddr::from((out, 0)),
        };
        socket.bind(local)?;
    }
    socket.connect(remote).await
}

/// Walk the MX list: try every host not yet marked, remember the active
/// one with the sentinel priority so the caller can name it.
pub async fn try_connect(
    cfg: &RemoteConfig,
    mx: &mut [MxHost],
    port: u16,
) -> DResult<Conn> {
    loop {
        for h in mx.iter_mut() {
            if h.priority == PRIO_CURRENT {
                h.priority = PRIO_TRIED;
            }
        }
        let next = match mx
            .iter()
            .position(|h| h.priority <= crate::dns::PRIO_IMPLICIT)
        {
            Some(i) => i,
            None => {
                write_status("Zcan't connect to any server");
                return Err(Quit);
            }
        };
        let addr = mx[next].addr;
        match tokio::time::timeout(cfg.timeout, connect_one(cfg, addr, port)).await {
            Ok(Ok(stream)) => {
                mx[next].priority = PRIO_CURRENT;
                return Ok(Conn::new(SmtpStream::Plain(stream), cfg.timeout));
            }
            Ok(Err(_)) | Err(_) => {
                mx[next].priority = PRIO_TRIED;
            }
        }
    }
}

/// Describe the active peer: `fqdn [ip]` when the PTR resolves, `[ip]`
/// otherwise.
pub async fn get_rhost<R: Resolver>(dns: &R, mx: &[MxHost]) -> (String, Option<String>) {
    let active = match mx.iter().find(|h| h.priority == PRIO_CURRENT) {
        Some(h) => h,
        None => return (String::new(), None),
    };
    let ip = match active.addr.to_ipv4_mapped() {
        Some(v4) => v4.to_string(),
        None => active.addr.to_string(),
    };
    match dns.ptr(&active.addr).await {
        Ok(names) if !names.is_empty() => {
            let fqdn = names[0].clone();
            (format!("{} [{}]", fqdn, ip), Some(fqdn))
        }
        _ => (format!("[{}]", ip), None),
    }
}

/// Run one complete delivery: connect, negotiate, send envelope and body,
/// report per-recipient status. Always consumes the process outcome via
/// fd 1; the caller just exits afterwards.
pub async fn deliver<R: Resolver>(
    cfg: &RemoteConfig,
    dns: &R,
    remhost: &str,
    sender: &str,
    recipients: &[String],
    msgdata: &[u8],
) {
    let _ = run_delivery(cfg, dns, remhost, sender, recipients, msgdata).await;
}

async fn run_delivery<R: Resolver>(
    cfg: &RemoteConfig,
    dns: &R,
    remhost: &str,
    sender: &str,
    recipients: &[String],
    msgdata: &[u8],
) -> DResult<()> {
    let (mut mx, port) = get_mx_list(cfg, dns, remhost).await?;

    // walk the list until one host greets and answers EHLO or HELO
    let mut delivery = loop {
        let conn = try_connect(cfg, &mut mx, port).await?;
        let mut d = Delivery {
            cfg,
            dns,
            conn,
            ext: 0,
            remote_size: 0,
            rhost: String::new(),
            partner_fqdn: None,
            mode: "",
            encrypted: false,
        };
        let (code, mut line) = d.netget().await?;
        if code != 220 {
            d.quit().await;
            continue;
        }
        while line.len() > 3 && line[3] == b'-' {
            let (c, l) = d.netget().await?;
            if c != 220 {
                break;
            }
            line = l;
        }
        if d.greeting().await? {
            break d;
        }
        d.quit().await;
    };

    let (rhost, fqdn) = get_rhost(delivery.dns, &mx).await;
    delivery.rhost = rhost;
    delivery.partner_fqdn = fqdn;

    if delivery.ext & EXT_STARTTLS != 0 {
        starttls::tls_init(&mut delivery).await?;
        if !delivery.greeting().await? {
            write_status("ZEHLO failed after STARTTLS");
            delivery.quit().await;
            return Err(Quit);
        }
    }

    let recode = qrdata::need_recode(msgdata);

    // envelope
    let mut mail = format!("MAIL FROM:<{}>", sender);
    if delivery.ext & EXT_SIZE != 0 {
        mail.push_str(&format!(" SIZE={}", msgdata.len()));
    }
    if delivery.ext & EXT_8BITMIME != 0 {
        mail.push_str(if recode & 1 != 0 {
            " BODY=8BITMIME"
        } else {
            " BODY=7BIT"
        });
    }
    let mailerr = format!("Connected to {} but sender was rejected", delivery.rhost);
    let mut any_rcpt = false;
    if delivery.ext & EXT_PIPELINING != 0 {
        // hide the latency: send everything, then collect the replies in
        // order
        let mut block = mail;
        block.push_str("\r\n");
        for r in recipients {
            block.push_str(&format!("RCPT TO:<{}>\r\n", r));
        }
        delivery.write_all(block.as_bytes()).await?;
        if delivery
            .checkreply(Some(*b" ZD"), Some(&[mailerr.as_str()]), 6)
            .await?
            >= 300
        {
            for _ in recipients {
                delivery.checkreply(None, None, 0).await?;
            }
            delivery.quit().await;
            return Err(Quit);
        }
        for _ in recipients {
            if delivery.checkreply(Some(*b" sh"), None, 0).await? < 300 {
                write_raw(b"r\0");
                any_rcpt = true;
            }
        }
    } else {
        if delivery.write_line(&mail).await.is_err() {
            write_status("Zconnection to remote server died");
            return Err(Quit);
        }
        if delivery
            .checkreply(Some(*b" ZD"), Some(&[mailerr.as_str()]), 6)
            .await?
            >= 300
        {
            delivery.quit().await;
            return Err(Quit);
        }
        for r in recipients {
            let cmd = format!("RCPT TO:<{}>", r);
            if delivery.write_line(&cmd).await.is_err() {
                write_status("Zconnection to remote server died");
                return Err(Quit);
            }
            if delivery.checkreply(Some(*b" sh"), None, 0).await? < 300 {
                write_raw(b"r\0");
                any_rcpt = true;
            }
        }
    }
    if !any_rcpt {
        // all recipients rejected
        delivery.quit().await;
        return Err(Quit);
    }

    if delivery.ext & EXT_CHUNKING != 0 {
        qrbdat::send_bdat(&mut delivery, msgdata).await?;
    } else {
        qrdata::send_data(&mut delivery, msgdata, recode).await?;
    }
    delivery.quit().await;
    Ok(())
}
