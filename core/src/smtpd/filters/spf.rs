/*
 * spf.rs
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

//! Map the session's SPF evaluation onto the recipient's `spfpolicy`
//! level:
//!
//! 1. temporary DNS errors block temporarily
//! 2. also reject on Fail
//! 3. also reject on SoftFail
//! 4. also reject on Neutral
//! 5. also reject when no usable policy exists
//!
//! A peer whose reverse name is listed in `spfignore` passes anyway; a
//! sender domain listed in `spfstrict` must pass outright.

use crate::control;
use crate::dns::Resolver;
use crate::spf::SpfResult;

use super::{FilterCtx, FilterOutcome, FilterVerdict};

fn list_match(
    ctx: &FilterCtx<'_, impl Resolver>,
    name: &str,
    needle: &str,
) -> Result<Option<crate::control::ConfScope>, std::io::Error> {
    let (path, scope) = ctx.conf.get_file_global(name, &ctx.cfg.control_dir);
    let path = match path {
        Some(p) => p,
        None => return Ok(None),
    };
    let hit = control::find_domain(&path, needle)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "bad domain list"))?;
    Ok(hit.then_some(scope))
}

pub async fn cb_spf<R: Resolver>(
    ctx: &FilterCtx<'_, R>,
) -> Result<FilterOutcome, std::io::Error> {
    let spf = ctx.state.spf.result;
    let from = match &ctx.state.mail_from {
        Some(f) => f,
        None => return Ok(FilterOutcome::pass()),
    };
    if matches!(spf, SpfResult::Pass | SpfResult::Ignored) {
        return Ok(FilterOutcome::pass());
    }
    let (p, scope) = ctx.setting_global("spfpolicy");
    let p = match p {
        Some(p) if p > 0 => p,
        _ => return Ok(FilterOutcome::pass()),
    };

    let blocked = if spf == SpfResult::TempError {
        true
    } else if spf.is_fail() && p >= 2 {
        true
    } else if spf == SpfResult::SoftFail && p >= 3 {
        true
    } else if spf == SpfResult::Neutral && p >= 4 {
        true
    } else if matches!(spf, SpfResult::None | SpfResult::HardError) && p >= 5 {
        true
    } else {
        // anything but Pass blocks senders that declared themselves strict
        list_match(ctx, "spfstrict", from.domain())?.is_some()
    };
    if !blocked {
        return Ok(FilterOutcome::pass());
    }

    if !ctx.state.remote_host.is_empty() {
        if let Some(wl_scope) = list_match(ctx, "spfignore", &ctx.state.remote_host)? {
            return Ok(FilterOutcome::denied(
                FilterVerdict::Whitelisted,
                "SPF",
                wl_scope,
            ));
        }
    }
    if spf == SpfResult::TempError {
        return Ok(FilterOutcome::denied(
            FilterVerdict::DeniedTemp,
            "SPF temp error",
            scope,
        ));
    }
    Ok(FilterOutcome::denied(
        FilterVerdict::DeniedMsg("501 5.7.1 mail denied by SPF policy".to_string()),
        "SPF",
        scope,
    ))
}
