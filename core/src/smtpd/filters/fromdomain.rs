/*
 * fromdomain.rs
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

//! Sanity checks on the sender domain's mail exchangers, controlled by the
//! `fromdomain` bitmask: bit 1 rejects nonexistent domains, bit 2 rejects
//! loopback-only MX sets, bit 4 rejects MX sets living entirely in private,
//! link-local, or documentation ranges.

use std::net::Ipv6Addr;

use crate::dns::{DnsError, Resolver};

use super::{FilterCtx, FilterOutcome, FilterVerdict};

fn is_loopback(ip: &Ipv6Addr) -> bool {
    match ip.to_ipv4_mapped() {
        Some(v4) => v4.octets()[0] == 127,
        None => ip.is_loopback(),
    }
}

fn is_private(ip: &Ipv6Addr) -> bool {
    match ip.to_ipv4_mapped() {
        Some(v4) => {
            let o = v4.octets();
            o[0] == 10
                || (o[0] == 172 && (16..32).contains(&o[1]))
                || (o[0] == 192 && o[1] == 168)
                || (o[0] == 169 && o[1] == 254)
                || (o[0] == 192 && o[1] == 0 && o[2] == 2)
                || (o[0] == 198 && o[1] == 51 && o[2] == 100)
                || (o[0] == 203 && o[1] == 0 && o[2] == 113)
        }
        None => {
            let seg = ip.segments();
            // fe80::/10 link-local, fec0::/10 deprecated site-local,
            // fc00::/7 unique-local, 2001:db8::/32 documentation
            (seg[0] & 0xffc0) == 0xfe80
                || (seg[0] & 0xffc0) == 0xfec0
                || (seg[0] & 0xfe00) == 0xfc00
                || (seg[0] == 0x2001 && seg[1] == 0x0db8)
        }
    }
}

pub async fn cb_fromdomain<R: Resolver>(
    ctx: &FilterCtx<'_, R>,
) -> Result<FilterOutcome, std::io::Error> {
    // a bounce has no sender domain to check
    if ctx.state.mail_from.is_none() {
        return Ok(FilterOutcome::pass());
    }
    let (v, scope) = ctx.setting_global("fromdomain");
    let mask = match v {
        Some(m) if m > 0 => m,
        _ => return Ok(FilterOutcome::pass()),
    };

    let mx = ctx.state.from_mx.as_deref().unwrap_or(&[]);
    if mask & 1 != 0 && mx.is_empty() {
        let (verdict, log) = match ctx.state.from_mx_err {
            Some(DnsError::Temp) => (
                FilterVerdict::DeniedMsg("451 4.4.3 temporary DNS failure".to_string()),
                "temporary DNS error on from domain lookup",
            ),
            Some(DnsError::NxDomain) => (
                FilterVerdict::DeniedMsg(
                    "501 5.1.8 Domain of sender address does not exist".to_string(),
                ),
                "NXDOMAIN",
            ),
            _ => (
                FilterVerdict::DeniedMsg(
                    "501 5.1.8 Sorry, can't find a mail exchanger for sender address"
                        .to_string(),
                ),
                "no MX",
            ),
        };
        return Ok(FilterOutcome::denied(verdict, log, scope));
    }
    if mask & 2 != 0 && !mx.is_empty() && mx.iter().all(|h| is_loopback(&h.addr)) {
        return Ok(FilterOutcome::denied(
            FilterVerdict::DeniedMsg(
                "501 5.4.0 all your mail exchangers have loopback addresses".to_string(),
            ),
            "DNS loop",
            scope,
        ));
    }
    if mask & 4 != 0 && !mx.is_empty() && mx.iter().all(|h| is_private(&h.addr)) {
        return Ok(FilterOutcome::denied(
            FilterVerdict::DeniedMsg(
                "501 5.4.0 all your mail exchangers point to local networks".to_string(),
            ),
            "MX in private network",
            scope,
        ));
    }
    Ok(FilterOutcome::pass())
}
