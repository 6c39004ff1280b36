/*
 * soberg.rs
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

//! The SoberG worm greets with a HELO derived from its forged sender:
//! MAIL FROM `foo@bar.com` leads to HELO `foo.com`.

use crate::dns::Resolver;

use super::{FilterCtx, FilterOutcome, FilterVerdict};

pub async fn cb_soberg<R: Resolver>(
    ctx: &FilterCtx<'_, R>,
) -> Result<FilterOutcome, std::io::Error> {
    let from = match &ctx.state.mail_from {
        Some(f) => f.clone(),
        None => return Ok(FilterOutcome::pass()),
    };
    let (v, scope) = ctx.setting_global("block_SoberG");
    if v.unwrap_or(0) <= 0 {
        return Ok(FilterOutcome::pass());
    }
    let helo = ctx.state.helo_str();
    let local = from.localpart();
    let tld = match from.addr.rfind('.') {
        Some(i) => &from.addr[i..],
        None => return Ok(FilterOutcome::pass()),
    };
    if helo.len() == local.len() + tld.len()
        && helo[..local.len()].eq_ignore_ascii_case(local)
        && helo[local.len()..].eq_ignore_ascii_case(tld)
    {
        return Ok(FilterOutcome::denied(
            FilterVerdict::DeniedMsg("550 5.7.1 mail looks like SoberG worm".to_string()),
            "SoberG suspect",
            scope,
        ));
    }
    Ok(FilterOutcome::pass())
}
