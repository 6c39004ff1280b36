/*
 * lib.rs
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

//! Bastione: a qmail-compatible SMTP suite. `smtpd` is the inbound policy
//! server handing accepted mail to an external queue writer, `remote` the
//! outbound relay client, and the remaining modules the protocol machinery
//! both sides share.

pub mod addr;
pub mod cdb;
pub mod control;
pub mod dns;
pub mod mime;
pub mod netio;
pub mod remote;
pub mod smtpd;
pub mod spf;
