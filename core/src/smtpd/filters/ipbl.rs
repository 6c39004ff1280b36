/*
 * ipbl.rs
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

//! Local IP block and allow lists: packed CIDR files `ipbl`/`ipwl` for
//! IPv4 peers, `ipblv6`/`ipwlv6` for IPv6. A match on the block list may
//! still be overridden by a user/domain whitelist.

use tracing::error;

use crate::control;
use crate::dns::Resolver;

use super::{FilterCtx, FilterOutcome, FilterVerdict};

pub async fn cb_ipbl<R: Resolver>(
    ctx: &FilterCtx<'_, R>,
) -> Result<FilterOutcome, std::io::Error> {
    let v6 = !ctx.state.ipv4_conn;
    let (fnb, fnw) = if v6 {
        ("ipblv6", "ipwlv6")
    } else {
        ("ipbl", "ipwl")
    };
    let (path, scope) = ctx.conf.get_file_global(fnb, &ctx.cfg.control_dir);
    let path = match path {
        Some(p) => p,
        None => return Ok(FilterOutcome::pass()),
    };
    let blocked = match control::find_cidr_match(&path, &ctx.state.remote_ip, v6) {
        Ok(b) => b,
        Err(e) => {
            error!(to = %ctx.this_rcpt(), error = %e, "bad input data in ipbl file");
            return Ok(FilterOutcome::denied(
                FilterVerdict::DeniedMsg("451 4.3.0 temporary policy error".to_string()),
                "broken ipbl",
                scope,
            ));
        }
    };
    if !blocked {
        return Ok(FilterOutcome::pass());
    }
    // blocked: a personal whitelist may still let the peer through
    let (wl, wl_scope) = ctx.conf.get_file(fnw);
    if let Some(wl) = wl {
        match control::find_cidr_match(&wl, &ctx.state.remote_ip, v6) {
            Ok(true) => {
                return Ok(FilterOutcome::denied(
                    FilterVerdict::Whitelisted,
                    "ipbl",
                    wl_scope,
                ));
            }
            Ok(false) => {}
            Err(e) => {
                error!(to = %ctx.this_rcpt(), error = %e, "bad input data in ipwl file");
                return Ok(FilterOutcome::denied(
                    FilterVerdict::DeniedMsg("451 4.3.0 temporary policy error".to_string()),
                    "broken ipwl",
                    wl_scope,
                ));
            }
        }
    }
    Ok(FilterOutcome::denied(FilterVerdict::Denied, "ipbl", scope))
}
