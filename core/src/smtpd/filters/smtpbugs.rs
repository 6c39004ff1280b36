/*
 * smtpbugs.rs
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

//! Reject clients whose SMTP engine put whitespace between the colon and
//! the `<` of MAIL FROM / RCPT TO.

use tracing::warn;

use crate::dns::Resolver;

use super::{FilterCtx, FilterOutcome, FilterVerdict};

const PERMIT_ESMTP: i64 = 1;
const PERMIT_TLS: i64 = 2;
const PERMIT_AUTH: i64 = 3;
const REJECT_ALL: i64 = 255;

pub async fn cb_smtpbugs<R: Resolver>(
    ctx: &FilterCtx<'_, R>,
) -> Result<FilterOutcome, std::io::Error> {
    if !ctx.state.space_bug {
        return Ok(FilterOutcome::pass());
    }
    let (v, scope) = ctx.setting_global("smtp_space_bug");
    let filter = match v {
        Some(f) if f > 0 => f,
        _ => return Ok(FilterOutcome::pass()),
    };
    let pass = match filter {
        PERMIT_TLS => ctx.encrypted || ctx.state.auth_name.is_some(),
        PERMIT_AUTH => ctx.state.auth_name.is_some(),
        PERMIT_ESMTP => ctx.state.esmtp,
        REJECT_ALL => false,
        _ => {
            warn!(to = %ctx.this_rcpt(), "unknown value for smtp_space_bug");
            true
        }
    };
    if pass {
        return Ok(FilterOutcome::pass());
    }
    Ok(FilterOutcome::denied(
        FilterVerdict::DeniedMsg("500 5.5.2 command syntax error".to_string()),
        "SMTP space bug",
        scope,
    ))
}
