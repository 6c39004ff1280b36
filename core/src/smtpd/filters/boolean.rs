/*
 * boolean.rs
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

//! Simple yes/no reject decisions.

use crate::dns::Resolver;

use super::{FilterCtx, FilterOutcome, FilterVerdict};

/// Authenticated or certificate-identified senders skip the remaining
/// filters when the recipient opts in.
pub async fn cb_whitelistauth<R: Resolver>(
    ctx: &FilterCtx<'_, R>,
) -> Result<FilterOutcome, std::io::Error> {
    let (v, scope) = ctx.setting_global("whitelistauth");
    if v.unwrap_or(0) > 0 && (ctx.state.auth_name.is_some() || ctx.state.tls_client.is_some()) {
        return Ok(FilterOutcome::denied(
            FilterVerdict::Whitelisted,
            "authenticated",
            scope,
        ));
    }
    Ok(FilterOutcome::pass())
}

/// A recipient that never sends mail cannot legitimately receive bounces.
pub async fn cb_nobounce<R: Resolver>(
    ctx: &FilterCtx<'_, R>,
) -> Result<FilterOutcome, std::io::Error> {
    if ctx.state.mail_from.is_some() {
        return Ok(FilterOutcome::pass());
    }
    let (v, scope) = ctx.setting("nobounce");
    if v.unwrap_or(0) > 0 {
        return Ok(FilterOutcome::denied(
            FilterVerdict::DeniedMsg(
                "550 5.7.1 address does not send mail, there can't be any bounces".to_string(),
            ),
            "no bounces allowed",
            scope,
        ));
    }
    Ok(FilterOutcome::pass())
}

/// Requiring TLS for local delivery violates RFC 3207 section 4, so this
/// is a user/domain setting only, never a global one.
pub async fn cb_forcestarttls<R: Resolver>(
    ctx: &FilterCtx<'_, R>,
) -> Result<FilterOutcome, std::io::Error> {
    if ctx.encrypted {
        return Ok(FilterOutcome::pass());
    }
    let (v, scope) = ctx.setting("forcestarttls");
    if v.unwrap_or(0) > 0 {
        return Ok(FilterOutcome::denied(
            FilterVerdict::DeniedMsg(
                "501 5.7.1 recipient requires encrypted message transmission".to_string(),
            ),
            "TLS required",
            scope,
        ));
    }
    Ok(FilterOutcome::pass())
}

/// Apostrophes in the sender localpart are a popular spam-generator tell.
pub async fn cb_noapos<R: Resolver>(
    ctx: &FilterCtx<'_, R>,
) -> Result<FilterOutcome, std::io::Error> {
    let from = match &ctx.state.mail_from {
        Some(f) => f,
        None => return Ok(FilterOutcome::pass()),
    };
    let (v, scope) = ctx.setting("noapos");
    if v.unwrap_or(0) > 0 && from.localpart().contains('\'') {
        return Ok(FilterOutcome::denied(
            FilterVerdict::DeniedMsg("501 5.7.1 recipient does not like you".to_string()),
            "apostroph in from",
            scope,
        ));
    }
    Ok(FilterOutcome::pass())
}
