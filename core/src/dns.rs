/*
 * dns.rs
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

//! Narrow typed DNS client over hickory-resolver: MX (with the RFC 5321
//! implicit-MX fallback and null-MX detection), A/AAAA, PTR, TXT. Errors
//! collapse onto a small alphabet the filters and the outbound client
//! dispatch on. Everything that needs DNS takes the `Resolver` trait so
//! tests can substitute a canned zone.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use hickory_resolver::proto::op::ResponseCode;
use hickory_resolver::TokioAsyncResolver;

/// MX priority for hosts synthesized from A/AAAA when the domain has no MX.
pub const PRIO_IMPLICIT: u32 = 65536;
/// Connection walk marker: this host has already been tried.
pub const PRIO_TRIED: u32 = 65537;
/// Connection walk marker: this is the currently connected host.
pub const PRIO_CURRENT: u32 = 65538;

/// DNS result alphabet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsError {
    /// The name does not exist.
    NxDomain,
    /// Temporary failure, retry later.
    Temp,
    /// Permanent failure other than NXDOMAIN.
    Perm,
    /// The domain published a null MX (`0 .`): it never accepts mail.
    RefusesMail,
}

impl std::fmt::Display for DnsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DnsError::NxDomain => write!(f, "name does not exist"),
            DnsError::Temp => write!(f, "temporary DNS error"),
            DnsError::Perm => write!(f, "permanent DNS error"),
            DnsError::RefusesMail => write!(f, "domain refuses mail (null MX)"),
        }
    }
}

impl std::error::Error for DnsError {}

/// One target host for a delivery attempt: address plus MX priority
/// (IPv4 stored v4-mapped).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MxHost {
    pub addr: Ipv6Addr,
    pub priority: u32,
    /// The MX host name the address came from (for logging and TLS checks).
    pub name: String,
}

/// Sort by priority ascending; within a priority IPv6 precedes IPv4-mapped.
/// The sort is stable.
pub fn sort_mx(list: &mut [MxHost]) {
    list.sort_by_key(|h| (h.priority, h.addr.to_ipv4_mapped().is_some()));
}

fn classify(e: &ResolveError) -> DnsError {
    match e.kind() {
        ResolveErrorKind::NoRecordsFound { response_code, .. } => match response_code {
            ResponseCode::NXDomain => DnsError::NxDomain,
            ResponseCode::ServFail => DnsError::Temp,
            _ => DnsError::NxDomain,
        },
        ResolveErrorKind::Timeout => DnsError::Temp,
        ResolveErrorKind::Io(_) => DnsError::Temp,
        _ => DnsError::Perm,
    }
}

/// The lookups the suite needs. `mx` resolves exchange names to addresses
/// and applies the implicit-MX rule; `addrs` returns AAAA before A.
pub trait Resolver {
    fn mx(&self, name: &str) -> impl std::future::Future<Output = Result<Vec<MxHost>, DnsError>>;
    fn addrs(
        &self,
        name: &str,
    ) -> impl std::future::Future<Output = Result<Vec<Ipv6Addr>, DnsError>>;
    fn a(&self, name: &str) -> impl std::future::Future<Output = Result<Vec<Ipv4Addr>, DnsError>>;
    fn ptr(
        &self,
        ip: &Ipv6Addr,
    ) -> impl std::future::Future<Output = Result<Vec<String>, DnsError>>;
    fn txt(&self, name: &str) -> impl std::future::Future<Output = Result<Vec<String>, DnsError>>;
}

/// Resolver backed by the system configuration.
pub struct SystemResolver {
    inner: TokioAsyncResolver,
}

impl SystemResolver {
    pub fn from_system() -> Result<Self, DnsError> {
        let inner = TokioAsyncResolver::tokio_from_system_conf().map_err(|_| DnsError::Perm)?;
        Ok(Self { inner })
    }
}

impl Resolver for SystemResolver {
    async fn mx(&self, name: &str) -> Result<Vec<MxHost>, DnsError> {
        let mx = match self.inner.mx_lookup(name).await {
            Ok(mx) => mx,
            Err(e) => match classify(&e) {
                // no MX record: RFC 5321 implicit MX from the address records
                DnsError::NxDomain
                    if !matches!(
                        e.kind(),
                        ResolveErrorKind::NoRecordsFound {
                            response_code: ResponseCode::NXDomain,
                            ..
                        }
                    ) =>
                {
                    return self.implicit_mx(name).await;
                }
                err => return Err(err),
            },
        };
        let records: Vec<_> = mx.iter().collect();
        if records.is_empty() {
            return self.implicit_mx(name).await;
        }
        if records.len() == 1
            && records[0].preference() == 0
            && records[0].exchange().is_root()
        {
            return Err(DnsError::RefusesMail);
        }
        let mut out = Vec::new();
        for r in records {
            let host = r.exchange().to_utf8();
            let host = host.trim_end_matches('.').to_string();
            let addrs = match self.addrs(&host).await {
                Ok(a) => a,
                // an MX target that does not resolve is skipped
                Err(DnsError::NxDomain) | Err(DnsError::Perm) => continue,
                Err(e) => return Err(e),
            };
            for addr in addrs {
                out.push(MxHost {
                    addr,
                    priority: u32::from(r.preference()),
                    name: host.clone(),
                });
            }
        }
        sort_mx(&mut out);
        Ok(out)
    }

    async fn addrs(&self, name: &str) -> Result<Vec<Ipv6Addr>, DnsError> {
        let mut out = Vec::new();
        let mut nx = None;
        match self.inner.ipv6_lookup(name).await {
            Ok(l) => out.extend(l.iter().map(|r| r.0)),
            Err(e) => nx = Some(classify(&e)),
        }
        match self.inner.ipv4_lookup(name).await {
            Ok(l) => out.extend(l.iter().map(|r| r.0.to_ipv6_mapped())),
            Err(e) => {
                let c = classify(&e);
                if out.is_empty() {
                    return Err(nx.map_or(c, |n| if n == DnsError::Temp { n } else { c }));
                }
            }
        }
        if out.is_empty() {
            Err(nx.unwrap_or(DnsError::NxDomain))
        } else {
            Ok(out)
        }
    }

    async fn a(&self, name: &str) -> Result<Vec<Ipv4Addr>, DnsError> {
        match self.inner.ipv4_lookup(name).await {
            Ok(l) => Ok(l.iter().map(|r| r.0).collect()),
            Err(e) => Err(classify(&e)),
        }
    }

    async fn ptr(&self, ip: &Ipv6Addr) -> Result<Vec<String>, DnsError> {
        let addr = match ip.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(*ip),
        };
        match self.inner.reverse_lookup(addr).await {
            Ok(l) => Ok(l
                .iter()
                .map(|n| n.0.to_utf8().trim_end_matches('.').to_string())
                .collect()),
            Err(e) => Err(classify(&e)),
        }
    }

    async fn txt(&self, name: &str) -> Result<Vec<String>, DnsError> {
        match self.inner.txt_lookup(name).await {
            Ok(l) => Ok(l
                .iter()
                .map(|r| {
                    r.txt_data()
                        .iter()
                        .map(|d| String::from_utf8_lossy(d).into_owned())
                        .collect::<Vec<_>>()
                        .concat()
                })
                .collect()),
            Err(e) => Err(classify(&e)),
        }
    }
}

impl SystemResolver {
    async fn implicit_mx(&self, name: &str) -> Result<Vec<MxHost>, DnsError> {
        let addrs = self.addrs(name).await?;
        let mut out: Vec<MxHost> = addrs
            .into_iter()
            .map(|addr| MxHost {
                addr,
                priority: PRIO_IMPLICIT,
                name: name.to_string(),
            })
            .collect();
        sort_mx(&mut out);
        Ok(out)
    }
}

/// Canned zone data for tests: exact-name tables per record type.
#[cfg(test)]
pub mod mock {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    pub struct MockDns {
        pub mx: HashMap<String, Result<Vec<MxHost>, DnsError>>,
        pub addr: HashMap<String, Result<Vec<Ipv6Addr>, DnsError>>,
        pub a4: HashMap<String, Result<Vec<Ipv4Addr>, DnsError>>,
        pub ptr: HashMap<Ipv6Addr, Result<Vec<String>, DnsError>>,
        pub txt: HashMap<String, Result<Vec<String>, DnsError>>,
    }

    impl MockDns {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_txt(mut self, name: &str, records: &[&str]) -> Self {
            self.txt.insert(
                name.to_string(),
                Ok(records.iter().map(|s| s.to_string()).collect()),
            );
            self
        }

        pub fn with_a4(mut self, name: &str, addrs: &[Ipv4Addr]) -> Self {
            self.a4.insert(name.to_string(), Ok(addrs.to_vec()));
            self.addr.insert(
                name.to_string(),
                Ok(addrs.iter().map(|a| a.to_ipv6_mapped()).collect()),
            );
            self
        }

        pub fn with_mx(mut self, name: &str, hosts: &[MxHost]) -> Self {
            self.mx.insert(name.to_string(), Ok(hosts.to_vec()));
            self
        }
    }

    impl Resolver for MockDns {
        async fn mx(&self, name: &str) -> Result<Vec<MxHost>, DnsError> {
            self.mx
                .get(name)
                .cloned()
                .unwrap_or(Err(DnsError::NxDomain))
        }

        async fn addrs(&self, name: &str) -> Result<Vec<Ipv6Addr>, DnsError> {
            self.addr
                .get(name)
                .cloned()
                .unwrap_or(Err(DnsError::NxDomain))
        }

        async fn a(&self, name: &str) -> Result<Vec<Ipv4Addr>, DnsError> {
            self.a4
                .get(name)
                .cloned()
                .unwrap_or(Err(DnsError::NxDomain))
        }

        async fn ptr(&self, ip: &Ipv6Addr) -> Result<Vec<String>, DnsError> {
            self.ptr.get(ip).cloned().unwrap_or(Err(DnsError::NxDomain))
        }

        async fn txt(&self, name: &str) -> Result<Vec<String>, DnsError> {
            self.txt
                .get(name)
                .cloned()
                .unwrap_or(Err(DnsError::NxDomain))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(addr: &str, priority: u32) -> MxHost {
        MxHost {
            addr: addr.parse().unwrap(),
            priority,
            name: "mx.example.org".to_string(),
        }
    }

    #[test]
    fn sort_is_by_priority_then_family() {
        let mut list = vec![
            host("::ffff:192.0.2.1", 20),
            host("::ffff:192.0.2.2", 10),
            host("2001:db8::2", 20),
            host("2001:db8::1", 10),
        ];
        sort_mx(&mut list);
        assert_eq!(list[0].addr, "2001:db8::1".parse::<Ipv6Addr>().unwrap());
        assert_eq!(list[1].addr, "::ffff:192.0.2.2".parse::<Ipv6Addr>().unwrap());
        assert_eq!(list[2].addr, "2001:db8::2".parse::<Ipv6Addr>().unwrap());
        assert_eq!(list[3].addr, "::ffff:192.0.2.1".parse::<Ipv6Addr>().unwrap());
        // non-decreasing priorities
        assert!(list.windows(2).all(|w| w[0].priority <= w[1].priority));
    }

    #[test]
    fn sort_is_stable_within_key() {
        let mut a = host("2001:db8::1", 10);
        a.name = "first.example".into();
        let mut b = host("2001:db8::1", 10);
        b.name = "second.example".into();
        let mut list = vec![a, b];
        sort_mx(&mut list);
        assert_eq!(list[0].name, "first.example");
        assert_eq!(list[1].name, "second.example");
    }
}
