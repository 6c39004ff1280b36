/*
 * usersize.rs
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

//! Reject when the announced SIZE exceeds the recipient's own cap.

use crate::dns::Resolver;

use super::{FilterCtx, FilterOutcome, FilterVerdict};

pub async fn cb_usersize<R: Resolver>(
    ctx: &FilterCtx<'_, R>,
) -> Result<FilterOutcome, std::io::Error> {
    let (v, scope) = ctx.setting("usersize");
    let cap = match v {
        Some(c) if c > 0 => c as u64,
        _ => return Ok(FilterOutcome::pass()),
    };
    if ctx.state.declared_size <= cap {
        return Ok(FilterOutcome::pass());
    }
    Ok(FilterOutcome::denied(
        FilterVerdict::DeniedMsg(
            "552 5.2.3 Requested mail action aborted: exceeded storage allocation".to_string(),
        ),
        "message too big",
        scope,
    ))
}
