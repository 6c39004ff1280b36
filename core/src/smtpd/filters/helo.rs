/*
 * helo.rs
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

//! Reject HELO lies (our name, our IP, unparseable) per the `helovalid`
//! policy bitmask, and anything listed in `badhelo` (leading dot = suffix
//! match).

use crate::control;
use crate::dns::Resolver;
use crate::smtpd::HeloStatus;

use super::{FilterCtx, FilterOutcome, FilterVerdict};

pub async fn cb_helo<R: Resolver>(
    ctx: &FilterCtx<'_, R>,
) -> Result<FilterOutcome, std::io::Error> {
    if ctx.state.helo_status != HeloStatus::Valid {
        let (mask, scope) = ctx.setting_global("helovalid");
        if (1i64 << (ctx.state.helo_status as u8)) & mask.unwrap_or(0) != 0 {
            return Ok(FilterOutcome::denied(
                FilterVerdict::Denied,
                ctx.state.helo_status.reject_reason(),
                scope,
            ));
        }
    }
    let helo = ctx.state.helo_str();
    let (path, scope) = ctx
        .conf
        .get_file_global("badhelo", &ctx.cfg.control_dir);
    if let Some(path) = path {
        if control::find_domain(&path, helo)
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "badhelo"))?
        {
            return Ok(FilterOutcome::denied(
                FilterVerdict::Denied,
                "bad helo",
                scope,
            ));
        }
    }
    Ok(FilterOutcome::pass())
}
