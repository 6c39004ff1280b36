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

//! The per-recipient filter pipeline: an ordered table of named filters
//! sharing one context, a closed verdict alphabet, and the two global
//! escalation settings (`fail_hard_on_temp`, `nonexist_on_block`). The
//! orchestrator owns all I/O to the peer; filters only return verdicts.

mod badmailfrom;
mod boolean;
mod dnsbl;
mod fromdomain;
mod helo;
mod ipbl;
mod nomail;
mod smtpbugs;
mod soberg;
mod spf;
mod usersize;

use tracing::{info, warn};

use crate::control::{ConfScope, UserConf};
use crate::dns::Resolver;

use super::{CmdError, Session, SmtpdConfig, TransferState};

/// What one filter decided.
#[derive(Debug, PartialEq)]
pub enum FilterVerdict {
    Pass,
    /// Denied; the orchestrator sends this exact reply line.
    DeniedMsg(String),
    /// Denied; announce the generic policy error.
    Denied,
    /// Denied; pretend the recipient does not exist.
    DeniedNoUser,
    /// Temporarily denied.
    DeniedTemp,
    /// Accepted and no further filter may run.
    Whitelisted,
}

/// Verdict plus the log tag and the scope whose policy matched.
#[derive(Debug)]
pub struct FilterOutcome {
    pub verdict: FilterVerdict,
    pub log: Option<String>,
    pub scope: ConfScope,
}

impl FilterOutcome {
    pub fn pass() -> Self {
        Self {
            verdict: FilterVerdict::Pass,
            log: None,
            scope: ConfScope::None,
        }
    }

    pub fn denied(verdict: FilterVerdict, log: &str, scope: ConfScope) -> Self {
        Self {
            verdict,
            log: Some(log.to_string()),
            scope,
        }
    }
}

/// Read-only view a filter gets of the session.
pub struct FilterCtx<'a, R: Resolver> {
    pub state: &'a TransferState,
    pub conf: &'a UserConf,
    pub cfg: &'a SmtpdConfig,
    pub dns: &'a R,
    pub encrypted: bool,
}

impl<R: Resolver> FilterCtx<'_, R> {
    /// The current recipient (always the last one in the list).
    pub fn this_rcpt(&self) -> &str {
        self.state
            .recipients
            .last()
            .map(|r| r.to.addr.as_str())
            .unwrap_or("")
    }

    pub fn setting(&self, key: &str) -> (Option<i64>, ConfScope) {
        self.conf.get_setting(key)
    }

    pub fn setting_global(&self, key: &str) -> (Option<i64>, ConfScope) {
        self.conf.get_setting_global(key, &self.cfg.global_conf)
    }
}

type FilterResult = Result<FilterOutcome, std::io::Error>;

/// Every filter, by name. Dispatch happens through `run_one`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterId {
    Whitelistauth,
    Nomail,
    Smtpbugs,
    Usersize,
    Soberg,
    Nobounce,
    Forcestarttls,
    Noapos,
    Fromdomain,
    Ipbl,
    Badhelo,
    Spf,
    Badmailfrom,
    Badcc,
    Dnsbl,
    Forceesmtp,
}

/// The filters in evaluation order: offline checks first, DNS-touching
/// checks last.
const FILTERS: &[(&str, FilterId)] = &[
    ("whitelistauth", FilterId::Whitelistauth),
    ("nomail", FilterId::Nomail),
    ("smtpbugs", FilterId::Smtpbugs),
    ("usersize", FilterId::Usersize),
    ("soberg", FilterId::Soberg),
    ("nobounce", FilterId::Nobounce),
    ("forcestarttls", FilterId::Forcestarttls),
    ("noapos", FilterId::Noapos),
    ("fromdomain", FilterId::Fromdomain),
    ("ipbl", FilterId::Ipbl),
    ("badhelo", FilterId::Badhelo),
    ("spf", FilterId::Spf),
    ("badmailfrom", FilterId::Badmailfrom),
    ("badcc", FilterId::Badcc),
    ("dnsbl", FilterId::Dnsbl),
    ("forceesmtp", FilterId::Forceesmtp),
];

async fn run_one<R: Resolver>(id: FilterId, ctx: &FilterCtx<'_, R>) -> FilterResult {
    match id {
        FilterId::Whitelistauth => boolean::cb_whitelistauth(ctx).await,
        FilterId::Nomail => nomail::cb_nomail(ctx).await,
        FilterId::Smtpbugs => smtpbugs::cb_smtpbugs(ctx).await,
        FilterId::Usersize => usersize::cb_usersize(ctx).await,
        FilterId::Soberg => soberg::cb_soberg(ctx).await,
        FilterId::Nobounce => boolean::cb_nobounce(ctx).await,
        FilterId::Forcestarttls => boolean::cb_forcestarttls(ctx).await,
        FilterId::Noapos => boolean::cb_noapos(ctx).await,
        FilterId::Fromdomain => fromdomain::cb_fromdomain(ctx).await,
        FilterId::Ipbl => ipbl::cb_ipbl(ctx).await,
        FilterId::Badhelo => helo::cb_helo(ctx).await,
        FilterId::Spf => spf::cb_spf(ctx).await,
        FilterId::Badmailfrom => badmailfrom::cb_badmailfrom(ctx).await,
        FilterId::Badcc => badmailfrom::cb_badcc(ctx).await,
        FilterId::Dnsbl => dnsbl::cb_dnsbl(ctx).await,
        FilterId::Forceesmtp => dnsbl::cb_forceesmtp(ctx).await,
    }
}

/// Run the pipeline for the current recipient. Stops at the first non-pass
/// verdict; whitelisting preempts everything after it. A filter error is
/// logged and degrades to a temporary rejection once all other filters
/// passed.
pub async fn run_filters<R: Resolver>(sess: &Session<R>, conf: &UserConf) -> FilterOutcome {
    let ctx = FilterCtx {
        state: &sess.state,
        conf,
        cfg: &sess.cfg,
        dns: &sess.dns,
        encrypted: sess.conn.is_encrypted(),
    };
    let mut tempfail = false;
    for &(name, id) in FILTERS {
        match run_one(id, &ctx).await {
            Ok(outcome) => match outcome.verdict {
                FilterVerdict::Pass => {}
                FilterVerdict::Whitelisted => {
                    if let Some(reason) = &outcome.log {
                        info!(
                            to = %ctx.this_rcpt(),
                            from = %sess.state.mail_from_str(),
                            ip = %sess.state.remote_ip_str,
                            reason = %reason,
                            scope = outcome.scope.as_str(),
                            "not rejected message: whitelisted"
                        );
                    }
                    return outcome;
                }
                _ => return outcome,
            },
            Err(e) => {
                warn!(
                    filter = name,
                    to = %ctx.this_rcpt(),
                    error = %e,
                    "error in filter"
                );
                tempfail = true;
            }
        }
    }
    if tempfail {
        FilterOutcome {
            verdict: FilterVerdict::DeniedTemp,
            log: None,
            scope: ConfScope::None,
        }
    } else {
        FilterOutcome::pass()
    }
}

/// Write the reply for a non-pass verdict, after applying the global
/// escalations. Returns true when the recipient was denied.
pub async fn apply_verdict<R: Resolver>(
    sess: &mut Session<R>,
    conf: &UserConf,
    mut outcome: FilterOutcome,
) -> Result<bool, CmdError> {
    match outcome.verdict {
        FilterVerdict::Pass | FilterVerdict::Whitelisted => return Ok(false),
        _ => {}
    }

    // escalations configured by the recipient
    if outcome.verdict == FilterVerdict::DeniedTemp
        && conf.get_setting("fail_hard_on_temp").0.unwrap_or(0) > 0
    {
        outcome.verdict = FilterVerdict::Denied;
    }
    if matches!(
        outcome.verdict,
        FilterVerdict::Denied | FilterVerdict::DeniedMsg(_)
    ) && conf.get_setting("nonexist_on_block").0.unwrap_or(0) > 0
    {
        outcome.verdict = FilterVerdict::DeniedNoUser;
    }

    let rcpt = sess
        .state
        .recipients
        .last()
        .map(|r| r.to.addr.clone())
        .unwrap_or_default();
    if let Some(reason) = &outcome.log {
        info!(
            to = %rcpt,
            from = %sess.state.mail_from_str(),
            ip = %sess.state.remote_ip_str,
            reason = %reason,
            scope = outcome.scope.as_str(),
            "rejected message: blocked by policy"
        );
    }
    sess.tarpit().await;
    match outcome.verdict {
        FilterVerdict::DeniedMsg(msg) => sess.conn.write_line(&msg).await?,
        FilterVerdict::Denied => {
            sess.conn
                .write_line("550 5.7.1 mail denied for policy reasons")
                .await?
        }
        FilterVerdict::DeniedNoUser => {
            let msg = format!("550 5.1.1 no such user <{}>", rcpt);
            sess.conn.write_line(&msg).await?
        }
        FilterVerdict::DeniedTemp => {
            sess.conn
                .write_line("450 4.7.0 mail temporary denied for policy reasons")
                .await?
        }
        FilterVerdict::Pass | FilterVerdict::Whitelisted => unreachable!(),
    }
    Ok(true)
}

/// The DNSBL query prefix for an address: reversed dotted quads for IPv4,
/// reversed dotted nibbles for IPv6, trailing dot included.
pub fn rbl_prefix(ip: &std::net::Ipv6Addr) -> String {
    match ip.to_ipv4_mapped() {
        Some(v4) => {
            let o = v4.octets();
            format!("{}.{}.{}.{}.", o[3], o[2], o[1], o[0])
        }
        None => {
            let mut out = String::with_capacity(64);
            for b in ip.octets().iter().rev() {
                out.push_str(&format!("{:x}.{:x}.", b & 0xf, b >> 4));
            }
            out
        }
    }
}
