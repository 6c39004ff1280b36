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

//! The receiving SMTP state machine: command table with per-state masks,
//! greeting and pipelining guards, HTTP proxy detection, tarpitting, the
//! bad-command counter, and the MAIL FROM / RCPT TO handlers feeding the
//! per-recipient filter pipeline.

pub mod auth;
pub mod data;
pub mod filters;
pub mod queue;
pub mod starttls;
pub mod vpop;

use std::net::Ipv6Addr;
use std::path::PathBuf;
use std::time::Duration;

use tracing::{info, warn};

use crate::addr::{parse_mailbox, AddrClass, AddrContext, ParsedAddr};
use crate::control::{self, ControlError};
use crate::dns::{DnsError, MxHost, Resolver};
use crate::netio::{Conn, NetError};
use crate::spf::{SpfOutcome, SpfResult};

/// Maximum recipients accepted in one transaction.
pub const MAX_RCPT: usize = 500;
const MAX_BAD_CMDS: u32 = 5;

pub const STATE_START: u16 = 0x001;
pub const STATE_HELO: u16 = 0x008;
pub const STATE_EHLO: u16 = 0x010;
pub const STATE_MAIL: u16 = 0x020;
pub const STATE_RCPT: u16 = 0x040;
pub const STATE_DATA: u16 = 0x080;
pub const STATE_STARTTLS: u16 = 0x100;
pub const STATE_AUTH: u16 = 0x200;
pub const STATE_BDAT: u16 = 0x800;

/// Classification of the HELO/EHLO argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeloStatus {
    Valid = 0,
    /// HELO is our own host name.
    MyName = 1,
    /// HELO is our IP in brackets.
    MyIp = 2,
    /// HELO is syntactically invalid.
    Invalid = 3,
    /// HELO is our IP without brackets.
    MyIpNoBrackets = 5,
}

impl HeloStatus {
    pub fn reject_reason(&self) -> &'static str {
        match self {
            HeloStatus::Valid => "",
            HeloStatus::MyName => "HELO is my name",
            HeloStatus::MyIp => "HELO is [my IP]",
            HeloStatus::Invalid => "HELO is syntactically invalid",
            HeloStatus::MyIpNoBrackets => "HELO is my IP",
        }
    }
}

/// One recipient of the current transaction. Rejected ones stay in the list
/// so the bad-CC filter can see them.
#[derive(Debug, Clone)]
pub struct Recipient {
    pub to: ParsedAddr,
    pub ok: bool,
}

/// Per-session transmission state; reset between transactions.
pub struct TransferState {
    pub esmtp: bool,
    /// HELO string, only when it differs from the reverse lookup.
    pub helo: Option<String>,
    pub helo_status: HeloStatus,
    pub remote_host: String,
    pub remote_ip: Ipv6Addr,
    pub remote_ip_str: String,
    pub remote_info: Option<String>,
    pub local_ip_str: String,
    pub ipv4_conn: bool,
    pub mail_from: Option<ParsedAddr>,
    /// true once MAIL FROM was seen (the sender may still be empty).
    pub have_mail_from: bool,
    pub declared_size: u64,
    /// BODY=8BITMIME was declared (default on for ESMTP).
    pub eightbit: bool,
    pub space_bug: bool,
    pub spf: SpfOutcome,
    /// MX list of the sender domain and the error class of that lookup.
    pub from_mx: Option<Vec<MxHost>>,
    pub from_mx_err: Option<DnsError>,
    pub auth_name: Option<String>,
    /// Client-certificate identity accepted for relaying.
    pub tls_client: Option<String>,
    pub recipients: Vec<Recipient>,
    pub goodrcpt: u32,
    pub bad_bounce: bool,
    /// RFC 5322 policing level requested by a recipient (0 none, 2 strict).
    pub check2822: u8,
}

impl TransferState {
    pub fn from_env(remote_host: String) -> Result<Self, String> {
        let (remote_ip_str, ipv4_conn) = match std::env::var("TCPREMOTEIP") {
            Ok(v) => (v, true),
            Err(_) => (
                std::env::var("TCP6REMOTEIP").map_err(|_| "no TCPREMOTEIP in environment")?,
                false,
            ),
        };
        let remote_ip = parse_ip(&remote_ip_str).ok_or("unparseable remote IP")?;
        let ipv4_conn = ipv4_conn || remote_ip.to_ipv4_mapped().is_some();
        let local_ip_str = std::env::var("TCPLOCALIP")
            .or_else(|_| std::env::var("TCP6LOCALIP"))
            .unwrap_or_default();
        Ok(Self::new(remote_ip, remote_ip_str, local_ip_str, ipv4_conn, remote_host))
    }

    pub fn new(
        remote_ip: Ipv6Addr,
        remote_ip_str: String,
        local_ip_str: String,
        ipv4_conn: bool,
        remote_host: String,
    ) -> Self {
        Self {
            esmtp: false,
            helo: None,
            helo_status: HeloStatus::Valid,
            remote_host,
            remote_ip,
            remote_ip_str,
            remote_info: std::env::var("TCPREMOTEINFO").ok(),
            local_ip_str,
            ipv4_conn,
            mail_from: None,
            have_mail_from: false,
            declared_size: 0,
            eightbit: false,
            space_bug: false,
            spf: SpfOutcome {
                result: SpfResult::None,
                mechanism: None,
                explanation: None,
            },
            from_mx: None,
            from_mx_err: None,
            auth_name: None,
            tls_client: None,
            recipients: Vec::new(),
            goodrcpt: 0,
            bad_bounce: false,
            check2822: 0,
        }
    }

    /// The HELO string, falling back to the reverse lookup.
    pub fn helo_str(&self) -> &str {
        self.helo.as_deref().unwrap_or(&self.remote_host)
    }

    pub fn mail_from_str(&self) -> &str {
        self.mail_from.as_ref().map(|a| a.addr.as_str()).unwrap_or("")
    }

    /// Drop the current transaction (RSET, HELO, end of mail).
    pub fn reset_transaction(&mut self) {
        self.mail_from = None;
        self.have_mail_from = false;
        self.declared_size = 0;
        self.space_bug = false;
        self.from_mx = None;
        self.from_mx_err = None;
        self.recipients.clear();
        self.goodrcpt = 0;
        self.bad_bounce = false;
    }
}

pub fn parse_ip(s: &str) -> Option<Ipv6Addr> {
    if let Ok(v4) = s.parse::<std::net::Ipv4Addr>() {
        return Some(v4.to_ipv6_mapped());
    }
    s.parse().ok()
}

/// Static server configuration loaded from the control directory.
pub struct SmtpdConfig {
    pub control_dir: PathBuf,
    /// The users/cdb domain database.
    pub users_cdb: PathBuf,
    /// control/me: the name we announce.
    pub helo_name: String,
    /// control/localiphost: domain substituted for a local IP literal.
    pub liphost: String,
    /// control/rcpthosts entries.
    pub rcpthosts: Vec<String>,
    pub databytes: u64,
    pub timeout: Duration,
    /// Global filterconf entries.
    pub global_conf: Vec<String>,
    pub vpopbounce: Option<String>,
    /// Mechanism names from control/authtypes.
    pub auth_types: Vec<String>,
    /// control/forcesslauth: advertise AUTH only under TLS.
    pub force_ssl_auth: bool,
    /// control/authhide: omit client host and address from the Received
    /// line of authenticated mail.
    pub authhide: bool,
    /// Hostname used in CRAM-MD5 challenges; set from argv.
    pub auth_host: Option<String>,
    /// checkpassword program and its subprogram arguments.
    pub auth_check: Option<PathBuf>,
    pub auth_sub: Vec<String>,
}

impl SmtpdConfig {
    /// Load the controls from the qmail base directory (`AUTOQMAIL` or
    /// /var/qmail). Missing `me` or `rcpthosts` is fatal; the caller
    /// answers 421 and gives up.
    pub fn load(base_dir: &std::path::Path) -> Result<Self, ControlError> {
        let control_dir = base_dir.join("control");
        let users_cdb = base_dir.join("users/cdb");
        let c = |n: &str| control_dir.join(n);
        let helo_name = control::load_oneliner(&c("me"), false)?
            .expect("oneliner present when not optional");
        let liphost =
            control::load_oneliner(&c("localiphost"), true)?.unwrap_or_else(|| helo_name.clone());
        let rcpthosts = control::load_list(&c("rcpthosts"), None)?;
        if rcpthosts.is_empty() {
            return Err(ControlError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "control/rcpthosts missing or empty",
            )));
        }
        let databytes = control::load_int(&c("databytes"), 0)?;
        let timeout = control::load_int(&c("timeoutsmtpd"), 320)?;
        let global_conf = control::load_list(&c("filterconf"), None)?;
        let vpopbounce = control::load_oneliner(&c("vpopbounce"), true)?;
        let auth_types = control::load_list(&c("authtypes"), None)?;
        let force_ssl_auth = control::load_int(&c("forcesslauth"), 0)? != 0;
        let authhide = control::load_int(&c("authhide"), 0)? != 0;
        Ok(Self {
            control_dir,
            users_cdb,
            helo_name,
            liphost,
            rcpthosts,
            databytes,
            timeout: Duration::from_secs(timeout),
            global_conf,
            vpopbounce,
            auth_types,
            force_ssl_auth,
            authhide,
            auth_host: None,
            auth_check: None,
            auth_sub: Vec::new(),
        })
    }
}

/// Why a command handler gave up; the main loop renders the reply.
#[derive(Debug)]
pub enum CmdError {
    /// 500 5.5.2 command syntax error.
    Syntax,
    /// 501 5.5.2 unrecognized command parameter.
    BadParameter,
    /// 500 5.5.2 line too long.
    LineTooLong,
    /// 503 5.5.1 bad sequence of commands.
    BadSequence,
    /// 552 too much mail data.
    MessageSize,
    /// 550 5.7.5 data encryption error.
    Crypto,
    /// Reply already written; does not count as a bad command.
    Done,
    /// Reply already written; counts as a bad command.
    Handled,
    /// Unable to read controls; 421 has been sent, session must end.
    Config,
    /// Clean QUIT exchange, session over.
    Quit,
    /// Transport failure, terminal.
    Net(NetError),
}

impl From<NetError> for CmdError {
    fn from(e: NetError) -> Self {
        CmdError::Net(e)
    }
}

/// How the session finished; mapped to the process exit code.
#[derive(Debug, PartialEq, Eq)]
pub enum SessionEnd {
    Quit,
    Timeout,
    PeerClosed,
    TooManyBadCommands,
    HttpProxy,
    ConfigError,
    IoError,
}

#[derive(Clone, Copy, PartialEq)]
enum Verb {
    Noop,
    Quit,
    Rset,
    Helo,
    Ehlo,
    MailFrom,
    RcptTo,
    Data,
    StartTls,
    Auth,
    Vrfy,
    Bdat,
    Post,
}

struct SmtpCommand {
    name: &'static str,
    mask: u16,
    /// State to enter on success: Some(bits), or None when the handler
    /// decides itself.
    state: Option<u16>,
    /// Bit 1: takes arguments; bit 2: checks the 512-byte limit itself.
    flags: u8,
    verb: Verb,
}

const COMMANDS: &[SmtpCommand] = &[
    SmtpCommand { name: "NOOP", mask: 0xffff, state: None, flags: 0, verb: Verb::Noop },
    SmtpCommand { name: "QUIT", mask: 0xfffd, state: None, flags: 0, verb: Verb::Quit },
    SmtpCommand { name: "RSET", mask: 0xfffd, state: None, flags: 0, verb: Verb::Rset },
    SmtpCommand { name: "HELO ", mask: 0xfffd, state: Some(STATE_HELO), flags: 1, verb: Verb::Helo },
    SmtpCommand { name: "EHLO ", mask: 0xfffd, state: Some(STATE_EHLO), flags: 1, verb: Verb::Ehlo },
    SmtpCommand { name: "MAIL FROM:", mask: STATE_HELO | STATE_EHLO, state: Some(STATE_MAIL), flags: 3, verb: Verb::MailFrom },
    SmtpCommand { name: "RCPT TO:", mask: STATE_MAIL | STATE_RCPT, state: Some(STATE_RCPT), flags: 1, verb: Verb::RcptTo },
    SmtpCommand { name: "DATA", mask: STATE_RCPT, state: None, flags: 0, verb: Verb::Data },
    SmtpCommand { name: "STARTTLS", mask: STATE_EHLO, state: Some(STATE_START), flags: 0, verb: Verb::StartTls },
    SmtpCommand { name: "AUTH ", mask: STATE_EHLO, state: None, flags: 1, verb: Verb::Auth },
    SmtpCommand { name: "VRFY", mask: 0xffff, state: None, flags: 1, verb: Verb::Vrfy },
    SmtpCommand { name: "BDAT ", mask: STATE_RCPT | STATE_BDAT, state: None, flags: 3, verb: Verb::Bdat },
    SmtpCommand { name: "POST", mask: 0xffff, state: None, flags: 1, verb: Verb::Post },
];

/// Whether this client may relay: unchecked, allowed, or denied.
#[derive(Clone, Copy, PartialEq)]
enum RelayState {
    Unchecked,
    Allowed,
    Denied,
}

pub struct Session<R: Resolver> {
    pub conn: Conn,
    pub cfg: SmtpdConfig,
    pub dns: R,
    pub state: TransferState,
    pub comstate: u16,
    /// Wire protocol tag for the Received header.
    pub protocol: &'static str,
    badcmds: u32,
    tarpit_extra: u32,
    relayclient: RelayState,
    /// Recipient count including rejected ones.
    rcptcount: usize,
    /// The queue writer of the transaction in progress.
    pub queue: Option<queue::QueueChild>,
    /// Bytes of message body seen so far.
    pub msgsize: u64,
    /// A CR at the end of the previous BDAT chunk waits for its LF.
    pub last_cr: bool,
    /// This message arrived via BDAT.
    pub chunked: bool,
}

impl<R: Resolver> Session<R> {
    pub fn new(conn: Conn, cfg: SmtpdConfig, dns: R, state: TransferState) -> Self {
        Self {
            conn,
            cfg,
            dns,
            state,
            comstate: STATE_START,
            protocol: "SMTP",
            badcmds: 0,
            tarpit_extra: 0,
            relayclient: RelayState::Unchecked,
            rcptcount: 0,
            queue: None,
            msgsize: 0,
            last_cr: false,
            chunked: false,
        }
    }

    /// Delay the next negative reply; spammers pay in their own time.
    /// No sleep when input is pending, the peer gets kicked faster instead.
    pub async fn tarpit(&mut self) {
        if self.conn.data_pending() {
            return;
        }
        tokio::time::sleep(Duration::from_secs(u64::from(5 + self.tarpit_extra))).await;
        if self.tarpit_extra < 235 {
            self.tarpit_extra += 1;
        }
    }

    /// Input buffered where the client should have been waiting for our
    /// reply: discard it. Used before replies whose timing is load-bearing.
    pub async fn sync_pipelining(&mut self) -> Result<(), NetError> {
        if self.conn.data_pending() {
            self.conn.discard_pending();
            self.conn
                .write_line("550 5.5.1 you must wait for my reply")
                .await?;
        }
        Ok(())
    }

    async fn wait_for_quit(&mut self) -> SessionEnd {
        loop {
            let line = match self.conn.read_line().await {
                Ok(l) => l,
                Err(NetError::Timeout) => return SessionEnd::Timeout,
                Err(NetError::PeerClosed) => return SessionEnd::PeerClosed,
                Err(_) => continue,
            };
            if line.eq_ignore_ascii_case(b"QUIT") {
                let _ = self.smtp_quit().await;
                return SessionEnd::Quit;
            }
            self.badcmds += 1;
            if self.badcmds > MAX_BAD_CMDS {
                return self.die_abusive().await;
            }
            let _ = self
                .conn
                .write_line("503 5.5.1 Bad sequence of commands")
                .await;
        }
    }

    async fn die_abusive(&mut self) -> SessionEnd {
        let _ = self.conn.write_line("550-5.7.1 too many bad commands").await;
        info!(ip = %self.state.remote_ip_str, "dropped connection: too many bad commands");
        let _ = self.conn.write_line("550 5.7.1 die slow and painful").await;
        self.conn.shutdown().await;
        SessionEnd::TooManyBadCommands
    }

    /// Send the greeting and run the command loop until the session ends.
    pub async fn run(&mut self) -> SessionEnd {
        if std::env::var_os("BANNER").is_none() {
            if self.conn.data_pending() {
                // peer talks before our banner
                let line = match self.conn.read_line().await {
                    Ok(l) => l,
                    Err(NetError::Timeout) => return SessionEnd::Timeout,
                    Err(NetError::PeerClosed) => return SessionEnd::PeerClosed,
                    Err(_) => Vec::new(),
                };
                if line.starts_with(b"POST / HTTP/1.") {
                    info!(
                        ip = %self.state.remote_ip_str,
                        "dropped connection: client is talking HTTP to me"
                    );
                    return SessionEnd::HttpProxy;
                }
                let _ = self
                    .conn
                    .write_line("450 4.5.0 transmission error, please try again")
                    .await;
                return self.wait_for_quit().await;
            }
            let banner = format!(
                "220 {} bastioned {} ESMTP",
                self.cfg.helo_name,
                env!("CARGO_PKG_VERSION")
            );
            if self.conn.write_line(&banner).await.is_err() {
                return SessionEnd::IoError;
            }
        }
        self.command_loop().await
    }

    async fn command_loop(&mut self) -> SessionEnd {
        loop {
            let line = match self.conn.read_line().await {
                Ok(l) => l,
                Err(NetError::Timeout) => {
                    warn!(ip = %self.state.remote_ip_str, "connection timed out");
                    return SessionEnd::Timeout;
                }
                Err(NetError::PeerClosed) => {
                    warn!(ip = %self.state.remote_ip_str, "connection died");
                    return SessionEnd::PeerClosed;
                }
                Err(NetError::BadCrlf) => {
                    if let Some(end) = self.reply_error(CmdError::Syntax).await {
                        return end;
                    }
                    continue;
                }
                Err(NetError::LineTooLong) => {
                    if let Some(end) = self.reply_error(CmdError::LineTooLong).await {
                        return end;
                    }
                    continue;
                }
                Err(e) => {
                    warn!(ip = %self.state.remote_ip_str, error = %e, "read error");
                    return SessionEnd::IoError;
                }
            };
            // outside of DATA every byte must be plain ASCII without NUL
            let err = if line.iter().any(|&b| b == 0 || b >= 0x80) {
                Some(CmdError::Syntax)
            } else {
                match self.dispatch(&line).await {
                    Ok(()) => None,
                    Err(e) => Some(e),
                }
            };
            if let Some(e) = err {
                match e {
                    CmdError::Quit => return SessionEnd::Quit,
                    CmdError::Net(NetError::Timeout) => return SessionEnd::Timeout,
                    CmdError::Net(NetError::PeerClosed) => return SessionEnd::PeerClosed,
                    CmdError::Net(_) => return SessionEnd::IoError,
                    CmdError::Config => return SessionEnd::ConfigError,
                    other => {
                        if let Some(end) = self.reply_error(other).await {
                            return end;
                        }
                    }
                }
            }
        }
    }

    /// Render the reply for a failed command, ticking the bad-command
    /// counter. Returns an end state when the session must stop.
    async fn reply_error(&mut self, e: CmdError) -> Option<SessionEnd> {
        self.badcmds += 1;
        if self.badcmds > MAX_BAD_CMDS {
            return Some(self.die_abusive().await);
        }
        let r = match e {
            CmdError::Syntax => {
                self.tarpit().await;
                info!(ip = %self.state.remote_ip_str, "bad SMTP command syntax");
                self.conn.write_line("500 5.5.2 command syntax error").await
            }
            CmdError::BadParameter => {
                self.tarpit().await;
                info!(ip = %self.state.remote_ip_str, "bad SMTP command parameter");
                self.conn
                    .write_line("501 5.5.2 unrecognized command parameter")
                    .await
            }
            CmdError::LineTooLong => {
                self.tarpit().await;
                info!(ip = %self.state.remote_ip_str, "too long SMTP line");
                self.conn
                    .write_multiline(
                        500,
                        &[
                            "5.5.2 line too long",
                            "This is usually a bug in your mail client",
                            "Try to use a different encoding like quoted-printable for this mail.",
                        ],
                    )
                    .await
            }
            CmdError::BadSequence => {
                self.tarpit().await;
                self.conn
                    .write_line("503 5.5.1 Bad sequence of commands")
                    .await
            }
            CmdError::MessageSize => {
                self.badcmds = 0;
                self.conn.write_line("552 4.3.1 Too much mail data").await
            }
            CmdError::Crypto => {
                self.conn.write_line("550 5.7.5 data encryption error").await
            }
            CmdError::Done => {
                self.badcmds = 0;
                Ok(())
            }
            CmdError::Handled => Ok(()),
            CmdError::Quit | CmdError::Config | CmdError::Net(_) => {
                unreachable!("terminal errors handled by caller")
            }
        };
        match r {
            Ok(()) => None,
            Err(NetError::Timeout) => Some(SessionEnd::Timeout),
            Err(NetError::PeerClosed) => Some(SessionEnd::PeerClosed),
            Err(_) => Some(SessionEnd::IoError),
        }
    }

    async fn dispatch(&mut self, line: &[u8]) -> Result<(), CmdError> {
        let text = std::str::from_utf8(line).map_err(|_| CmdError::Syntax)?;
        for cmd in COMMANDS {
            let n = cmd.name.len();
            let matches = text.len() >= n && text[..n].eq_ignore_ascii_case(cmd.name)
                || (cmd.name.ends_with(' ')
                    && text.eq_ignore_ascii_case(cmd.name.trim_end())
                    && cmd.flags & 1 != 0);
            if !matches {
                continue;
            }
            if self.comstate & cmd.mask == 0 {
                return Err(CmdError::BadSequence);
            }
            if cmd.flags & 2 == 0 && text.len() > 510 {
                return Err(CmdError::LineTooLong);
            }
            if cmd.flags & 1 == 0 && text.len() > cmd.name.len() {
                return Err(CmdError::Syntax);
            }
            let arg = if text.len() > n { &text[n..] } else { "" };
            match cmd.verb {
                Verb::Noop => self.smtp_noop().await?,
                Verb::Quit => {
                    self.smtp_quit().await?;
                    return Err(CmdError::Quit);
                }
                Verb::Rset => self.smtp_rset().await?,
                Verb::Helo => self.smtp_helo(arg).await?,
                Verb::Ehlo => self.smtp_ehlo(arg).await?,
                Verb::MailFrom => self.smtp_from(arg).await?,
                Verb::RcptTo => self.smtp_rcpt(arg).await?,
                Verb::Data => data::smtp_data(self).await?,
                Verb::StartTls => starttls::smtp_starttls(self).await?,
                Verb::Auth => auth::smtp_auth(self, arg).await?,
                Verb::Vrfy => self.smtp_vrfy().await?,
                Verb::Bdat => data::smtp_bdat(self, arg).await?,
                Verb::Post => return self.http_post(text),
            }
            if let Some(next) = cmd.state {
                self.comstate = next;
            } else if cmd.verb == Verb::Rset {
                self.comstate = if self.comstate >= STATE_HELO {
                    if self.state.esmtp {
                        STATE_EHLO
                    } else {
                        STATE_HELO
                    }
                } else {
                    STATE_START
                };
            }
            self.badcmds = 0;
            return Ok(());
        }
        Err(CmdError::Syntax)
    }

    fn http_post(&self, text: &str) -> Result<(), CmdError> {
        if self.comstate == STATE_START && text.starts_with("POST / HTTP/1.") {
            info!(
                ip = %self.state.remote_ip_str,
                "dropped connection: client is talking HTTP to me"
            );
            // no reply at all; just end the session
            return Err(CmdError::Quit);
        }
        Err(CmdError::Syntax)
    }

    async fn smtp_noop(&mut self) -> Result<(), CmdError> {
        self.sync_pipelining().await?;
        self.conn.write_line("250 2.0.0 ok").await?;
        Ok(())
    }

    async fn smtp_quit(&mut self) -> Result<(), CmdError> {
        let msg = format!(
            "221 2.0.0 {} service closing transmission channel",
            self.cfg.helo_name
        );
        self.conn.write_line(&msg).await?;
        self.conn.shutdown().await;
        Ok(())
    }

    async fn smtp_rset(&mut self) -> Result<(), CmdError> {
        if let Some(q) = self.queue.take() {
            q.abort().await;
        }
        self.chunked = false;
        self.last_cr = false;
        self.state.reset_transaction();
        self.rcptcount = 0;
        self.conn.write_line("250 2.0.0 ok").await?;
        Ok(())
    }

    async fn smtp_vrfy(&mut self) -> Result<(), CmdError> {
        self.conn
            .write_line("252 send some mail, I'll do my very best")
            .await?;
        Ok(())
    }

    /// Classify the HELO argument against our name and IP.
    fn helo_valid(&mut self, helo: &str) {
        self.state.helo_status = HeloStatus::Valid;
        if helo.eq_ignore_ascii_case(&self.state.remote_host) && !self.state.remote_host.is_empty()
        {
            self.state.helo = None;
            return;
        }
        self.state.helo = Some(helo.to_string());
        if helo.eq_ignore_ascii_case(&self.cfg.helo_name) {
            self.state.helo_status = HeloStatus::MyName;
            return;
        }
        let local = &self.state.local_ip_str;
        if !local.is_empty() {
            if helo == local {
                self.state.helo_status = HeloStatus::MyIpNoBrackets;
                return;
            }
            if helo.len() > 2 && &helo[1..helo.len() - 1] == local && helo.starts_with('[') && helo.ends_with(']') {
                self.state.helo_status = HeloStatus::MyIp;
                return;
            }
        }
        if crate::addr::domain_valid(helo) {
            return;
        }
        // not a domain: accept an IPv4 literal in brackets, flag the rest
        self.state.helo_status = HeloStatus::Invalid;
        if let Some(inner) = helo.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
            if inner.parse::<std::net::Ipv4Addr>().is_ok() {
                self.state.helo_status = HeloStatus::Valid;
            }
        }
    }

    async fn smtp_helo(&mut self, arg: &str) -> Result<(), CmdError> {
        self.state.reset_transaction();
        self.rcptcount = 0;
        self.protocol = "SMTP";
        self.state.esmtp = false;
        self.state.eightbit = false;
        self.state.spf = SpfOutcome {
            result: SpfResult::None,
            mechanism: None,
            explanation: None,
        };
        self.helo_valid(arg);
        let msg = format!("250 {}", self.cfg.helo_name);
        self.conn.write_line(&msg).await?;
        Ok(())
    }

    async fn smtp_ehlo(&mut self, arg: &str) -> Result<(), CmdError> {
        self.state.reset_transaction();
        self.rcptcount = 0;
        if !self.conn.is_encrypted() {
            self.protocol = "ESMTP";
        }
        self.helo_valid(arg);
        let mut lines: Vec<String> = vec![
            self.cfg.helo_name.clone(),
            "ENHANCEDSTATUSCODES".to_string(),
            "PIPELINING".to_string(),
            "8BITMIME".to_string(),
            "CHUNKING".to_string(),
        ];
        if self.cfg.auth_host.is_some()
            && (!self.cfg.force_ssl_auth || self.conn.is_encrypted())
        {
            if let Some(types) = auth::advertised_mechanisms(&self.cfg) {
                lines.push(format!("AUTH {}", types));
            }
        }
        let on_smtps = std::env::var("TCPLOCALPORT").is_ok_and(|p| p == "465");
        if !self.conn.is_encrypted()
            && !on_smtps
            && self.cfg.control_dir.join("servercert.pem").exists()
        {
            lines.push("STARTTLS".to_string());
        }
        if self.cfg.databytes > 0 {
            lines.push(format!("SIZE {}", self.cfg.databytes));
        } else {
            lines.push("SIZE".to_string());
        }
        let refs: Vec<&str> = lines.iter().map(|s| s.as_str()).collect();
        // the 250 ending EHLO re-enables pipelining; flush stale input first
        self.sync_pipelining().await?;
        self.conn.write_multiline(250, &refs).await?;
        self.state.esmtp = true;
        self.state.eightbit = true;
        self.state.spf = SpfOutcome {
            result: SpfResult::None,
            mechanism: None,
            explanation: None,
        };
        Ok(())
    }

    /// Check whether this client may relay: authenticated, TLS client cert,
    /// or listed in control/relayclients.
    async fn is_authenticated(&mut self) -> Result<bool, CmdError> {
        if self.state.auth_name.is_some() || self.state.tls_client.is_some() {
            return Ok(true);
        }
        if self.relayclient == RelayState::Unchecked {
            self.relayclient = RelayState::Denied;
            let fname = if self.state.ipv4_conn {
                "relayclients"
            } else {
                "relayclients6"
            };
            let path = self.cfg.control_dir.join(fname);
            match control::find_cidr_match(&path, &self.state.remote_ip, !self.state.ipv4_conn) {
                Ok(true) => self.relayclient = RelayState::Allowed,
                Ok(false) => {}
                Err(e) => {
                    // reject everything on parse error, anything else would
                    // turn this into an open relay by accident
                    warn!(error = %e, "parse error in relayclients");
                }
            }
        }
        Ok(self.relayclient == RelayState::Allowed)
    }

    async fn smtp_from(&mut self, arg: &str) -> Result<(), CmdError> {
        let mut rest = arg;
        let mut bug = false;
        while let Some(r) = rest.strip_prefix(' ') {
            rest = r;
            bug = true;
        }
        let body = rest.strip_prefix('<').ok_or(CmdError::Syntax)?;
        if bug {
            self.state.space_bug = true;
        }
        let parsed = match parse_mailbox(body, AddrContext::MailFrom) {
            Some(m) => m,
            None => {
                self.conn
                    .write_line("501 5.1.3 domain of mail address is syntactically incorrect")
                    .await?;
                return Err(CmdError::Handled);
            }
        };
        // an address literal is no valid return path here
        if parsed
            .addr
            .as_ref()
            .is_some_and(|a| a.class == AddrClass::Literal)
        {
            self.conn
                .write_line("501 5.1.3 domain of mail address is syntactically incorrect")
                .await?;
            return Err(CmdError::Handled);
        }

        let mut more = parsed.rest;
        if !more.is_empty() && !self.state.esmtp {
            return Err(CmdError::Syntax);
        }
        let mut valid_length = 510usize;
        let mut seen_size = false;
        let mut seen_body = false;
        while !more.is_empty() {
            let rest = more.strip_prefix(' ').ok_or(CmdError::Syntax)?;
            if let Some(num) = strip_prefix_ci(rest, "SIZE=") {
                if seen_size {
                    return Err(CmdError::Syntax);
                }
                seen_size = true;
                let end = num
                    .find(|c: char| !c.is_ascii_digit())
                    .unwrap_or(num.len());
                if end == 0 {
                    return Err(CmdError::Syntax);
                }
                self.state.declared_size =
                    num[..end].parse().map_err(|_| CmdError::Syntax)?;
                valid_length += 26;
                more = &num[end..];
            } else if let Some(body) = strip_prefix_ci(rest, "BODY=") {
                if seen_body {
                    return Err(CmdError::Syntax);
                }
                seen_body = true;
                if let Some(r) = strip_prefix_ci(body, "8BITMIME") {
                    self.state.eightbit = true;
                    more = r;
                } else if let Some(r) = strip_prefix_ci(body, "7BIT") {
                    self.state.eightbit = false;
                    more = r;
                } else {
                    return Err(CmdError::Syntax);
                }
            } else if let Some(x) = strip_prefix_ci(rest, "AUTH=") {
                let xlen = xtext_len(x).ok_or(CmdError::Syntax)?;
                if xlen == 0 {
                    return Err(CmdError::Syntax);
                }
                valid_length += 500;
                more = &x[xlen..];
            } else {
                return Err(CmdError::BadParameter);
            }
            if !more.is_empty() && !more.starts_with(' ') {
                return Err(CmdError::Syntax);
            }
        }
        if arg.len() + 10 > valid_length {
            return Err(CmdError::LineTooLong);
        }
        if self.cfg.databytes > 0 && self.state.declared_size > self.cfg.databytes {
            self.conn
                .write_line("452 4.3.1 Requested action not taken: insufficient system storage")
                .await?;
            return Err(CmdError::Done);
        }

        self.state.mail_from = parsed.addr;
        self.state.have_mail_from = true;
        self.state.recipients.clear();
        self.state.goodrcpt = 0;
        self.state.bad_bounce = false;
        self.rcptcount = 0;

        // MX of the sender domain, for the fromdomain filter
        self.state.from_mx = None;
        self.state.from_mx_err = None;
        let spf_domain = if let Some(from) = self.state.mail_from.clone() {
            match self.dns.mx(from.domain()).await {
                Ok(mx) => self.state.from_mx = Some(mx),
                Err(e) => self.state.from_mx_err = Some(e),
            }
            from.domain().to_string()
        } else {
            self.state.helo_str().to_string()
        };

        // SPF, unless the peer's reverse name is a known forwarder
        let friends = self.cfg.control_dir.join("spffriends");
        let ignore = !self.state.remote_host.is_empty()
            && control::find_domain(&friends, &self.state.remote_host).unwrap_or(false);
        if ignore {
            self.state.spf = SpfOutcome {
                result: SpfResult::Ignored,
                mechanism: None,
                explanation: None,
            };
        } else {
            let ctx = crate::spf::SpfContext {
                remote_ip: self.state.remote_ip,
                helo: self.state.helo.as_deref().unwrap_or(&self.state.remote_host),
                mail_from: self.state.mail_from.as_ref().map(|a| a.addr.as_str()),
                local_name: &self.cfg.helo_name,
                remote_host: &self.state.remote_host,
            };
            self.state.spf = crate::spf::check_host(&self.dns, &ctx, &spf_domain).await;
        }

        let msg = format!(
            "250 2.1.5 sender <{}> is syntactically correct",
            self.state.mail_from_str()
        );
        self.conn.write_line(&msg).await?;
        Ok(())
    }

    async fn smtp_rcpt(&mut self, arg: &str) -> Result<(), CmdError> {
        let mut rest = arg;
        let mut bug = false;
        while let Some(r) = rest.strip_prefix(' ') {
            rest = r;
            bug = true;
        }
        let body = rest.strip_prefix('<').ok_or(CmdError::Syntax)?;
        if bug {
            self.state.space_bug = true;
        }
        let parsed = match parse_mailbox(body, AddrContext::RcptTo) {
            Some(m) => m,
            None => {
                self.conn
                    .write_line("501 5.1.3 domain of mail address is syntactically incorrect")
                    .await?;
                return Err(CmdError::Handled);
            }
        };
        if !parsed.rest.is_empty() {
            // no extension of ours puts data behind the forward path
            return Err(CmdError::Syntax);
        }
        let addr = parsed.addr.expect("RCPT TO never yields an empty path");

        let conf = match vpop::addr_allowed(self, &addr).await? {
            vpop::AddrCheck::Local(conf) => conf,
            vpop::AddrCheck::NotLocal => {
                if !self.is_authenticated().await? {
                    info!(
                        to = %addr.addr,
                        from = %self.state.mail_from_str(),
                        ip = %self.state.remote_ip_str,
                        "rejected message: relaying denied"
                    );
                    self.tarpit().await;
                    self.conn.write_line("551 5.7.1 relaying denied").await?;
                    return Err(CmdError::Handled);
                }
                crate::control::UserConf::empty()
            }
            vpop::AddrCheck::NoSuchUser => {
                info!(
                    to = %addr.addr,
                    from = %self.state.mail_from_str(),
                    ip = %self.state.remote_ip_str,
                    "rejected message: no such user"
                );
                self.tarpit().await;
                let msg = format!("550 5.1.1 no such user <{}>", addr.addr);
                self.conn.write_line(&msg).await?;
                return Err(CmdError::Handled);
            }
        };

        if self.rcptcount >= MAX_RCPT {
            self.conn
                .write_line("452 4.5.3 Too many recipients")
                .await?;
            return Ok(());
        }
        self.state.recipients.push(Recipient {
            to: addr.clone(),
            ok: false,
        });
        self.rcptcount += 1;

        let outcome = filters::run_filters(self, &conf).await;
        if filters::apply_verdict(self, &conf, outcome).await? {
            return Ok(());
        }
        // remember the message policing level the recipient asked for
        if let (Some(v), _) = conf.get_setting_global("check2822", &self.cfg.global_conf) {
            self.state.check2822 = v.clamp(0, 2) as u8;
        }

        // only one recipient allowed for a bounce message
        if self.state.have_mail_from
            && self.state.mail_from.is_none()
            && (self.rcptcount > 1 || self.state.bad_bounce)
        {
            self.tarpit().await;
            self.conn
                .write_line("550 5.5.3 bounce messages must not have more than one recipient")
                .await?;
            if !self.state.bad_bounce {
                for r in &mut self.state.recipients {
                    r.ok = false;
                    info!(
                        to = %r.to.addr,
                        ip = %self.state.remote_ip_str,
                        "rejected message: bad bounce"
                    );
                }
                self.state.bad_bounce = true;
            }
            self.state.goodrcpt = 0;
            return Err(CmdError::Handled);
        }

        self.state.goodrcpt += 1;
        if let Some(last) = self.state.recipients.last_mut() {
            last.ok = true;
        }
        let msg = format!("250 2.1.0 recipient <{}> OK", addr.addr);
        self.conn.write_line(&msg).await?;
        Ok(())
    }
}

/// Case-insensitive prefix strip.
pub fn strip_prefix_ci<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    if s.len() >= prefix.len() && s[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}

/// Length of the xtext token at the start of `s` (RFC 3461): printable
/// US-ASCII except `+` and `=`, with `+XY` hex escapes. `None` on malformed
/// input, `Some(0)` when no xtext is present.
pub fn xtext_len(s: &str) -> Option<usize> {
    let b = s.as_bytes();
    let mut i = 0;
    while i < b.len() {
        match b[i] {
            b'+' => {
                if i + 2 >= b.len()
                    || !b[i + 1].is_ascii_hexdigit()
                    || !b[i + 2].is_ascii_hexdigit()
                {
                    return None;
                }
                i += 3;
            }
            33..=42 | 44..=60 | 62..=126 => i += 1,
            _ => break,
        }
    }
    Some(i)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xtext_rules() {
        assert_eq!(xtext_len("user@example.org"), Some(16));
        assert_eq!(xtext_len("a+2Bb"), Some(5));
        assert_eq!(xtext_len("a+2"), None);
        assert_eq!(xtext_len("a+zz"), None);
        assert_eq!(xtext_len("<>"), Some(0));
        assert_eq!(xtext_len("abc def"), Some(3));
    }

    #[test]
    fn command_table_masks() {
        // DATA is only reachable with an accepted recipient
        let data = COMMANDS.iter().find(|c| c.verb == Verb::Data).unwrap();
        assert_eq!(data.mask, STATE_RCPT);
        // QUIT is allowed everywhere but mid-DATA
        let quit = COMMANDS.iter().find(|c| c.verb == Verb::Quit).unwrap();
        assert_ne!(quit.mask & STATE_START, 0);
        assert_ne!(quit.mask & STATE_RCPT, 0);
        // MAIL FROM requires a HELO or EHLO first
        let mail = COMMANDS.iter().find(|c| c.verb == Verb::MailFrom).unwrap();
        assert_eq!(mail.mask, STATE_HELO | STATE_EHLO);
        // STARTTLS only after EHLO
        let tls = COMMANDS.iter().find(|c| c.verb == Verb::StartTls).unwrap();
        assert_eq!(tls.mask, STATE_EHLO);
    }

    #[test]
    fn ip_parsing() {
        assert_eq!(
            parse_ip("192.0.2.1"),
            Some("::ffff:192.0.2.1".parse().unwrap())
        );
        assert_eq!(parse_ip("2001:db8::1"), Some("2001:db8::1".parse().unwrap()));
        assert!(parse_ip("not an ip").is_none());
    }
}
