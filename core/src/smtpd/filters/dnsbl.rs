/*
 * dnsbl.rs
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

//! DNS blocklist checks. The peer address is reversed, prefixed to each
//! zone, and looked up as an A record. One temp-failing zone with no hit
//! elsewhere yields a temporary rejection, so a flaky list never turns
//! into an accept.

use tracing::warn;

use crate::addr::domain_valid;
use crate::control;
use crate::dns::{DnsError, Resolver};

use super::{rbl_prefix, FilterCtx, FilterOutcome, FilterVerdict};

/// Look the peer up in each zone. `Ok(Some)` carries the matching zone and
/// its TXT explanation, if any.
async fn check_rbl<R: Resolver>(
    ctx: &FilterCtx<'_, R>,
    zones: &[String],
) -> Result<Option<(String, Option<String>)>, DnsError> {
    let prefix = rbl_prefix(&ctx.state.remote_ip);
    let mut temp = false;
    for zone in zones {
        if prefix.len() + zone.len() > 255 {
            warn!(zone = %zone, "name of rbl too long");
            continue;
        }
        let query = format!("{}{}", prefix, zone);
        match ctx.dns.a(&query).await {
            Ok(addrs) if !addrs.is_empty() => {
                let txt = ctx
                    .dns
                    .txt(&query)
                    .await
                    .ok()
                    .and_then(|t| t.into_iter().next());
                return Ok(Some((zone.clone(), txt)));
            }
            Ok(_) | Err(DnsError::NxDomain) => {}
            Err(DnsError::Temp) => temp = true,
            Err(_) => {}
        }
    }
    if temp {
        Err(DnsError::Temp)
    } else {
        Ok(None)
    }
}

fn load_zones(
    ctx: &FilterCtx<'_, impl Resolver>,
    name: &str,
) -> Result<Option<(Vec<String>, crate::control::ConfScope)>, std::io::Error> {
    let (path, scope) = ctx.conf.get_file_global(name, &ctx.cfg.control_dir);
    let path = match path {
        Some(p) => p,
        None => return Ok(None),
    };
    let zones = control::load_list(&path, Some(domain_valid))
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "bad zone list"))?;
    Ok(Some((zones, scope)))
}

pub async fn cb_dnsbl<R: Resolver>(
    ctx: &FilterCtx<'_, R>,
) -> Result<FilterOutcome, std::io::Error> {
    let (zones, scope) = match load_zones(ctx, "rblv")? {
        Some(x) => x,
        None => return Ok(FilterOutcome::pass()),
    };
    match check_rbl(ctx, &zones).await {
        Ok(Some((zone, txt))) => {
            let msg = match &txt {
                Some(reason) if !reason.is_empty() => {
                    format!("551 5.7.1 {}", reason)
                }
                _ => format!("551 5.7.1 message rejected, you are listed in {}", zone),
            };
            Ok(FilterOutcome::denied(
                FilterVerdict::DeniedMsg(msg),
                "DNSBL",
                scope,
            ))
        }
        Ok(None) => Ok(FilterOutcome::pass()),
        Err(_) => Ok(FilterOutcome::denied(
            FilterVerdict::DeniedTemp,
            "temporary DNS error on RBL lookup",
            scope,
        )),
    }
}

/// Peers still talking plain SMTP that are listed in the `forceesmtp`
/// zones have to come back with EHLO.
pub async fn cb_forceesmtp<R: Resolver>(
    ctx: &FilterCtx<'_, R>,
) -> Result<FilterOutcome, std::io::Error> {
    if ctx.state.esmtp {
        return Ok(FilterOutcome::pass());
    }
    let name = if ctx.state.ipv4_conn {
        "forceesmtp"
    } else {
        "forceesmtpv6"
    };
    let (zones, scope) = match load_zones(ctx, name)? {
        Some(x) => x,
        None => return Ok(FilterOutcome::pass()),
    };
    match check_rbl(ctx, &zones).await {
        Ok(Some(_)) => Ok(FilterOutcome::denied(
            FilterVerdict::Denied,
            "ESMTP forced",
            scope,
        )),
        Ok(None) => Ok(FilterOutcome::pass()),
        Err(_) => Ok(FilterOutcome::denied(
            FilterVerdict::DeniedTemp,
            "temporary DNS error on RBL lookup",
            scope,
        )),
    }
}
