use std::net::IpAddr;

use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use hickory_resolver::TokioAsyncResolver;

use crate::packet::{normalize_hostname, Family};

/// Host-resolver facade shared by the PTR fallback and the hostname
/// pre-cache.
///
/// Lookups leave through the kernel like any other traffic, so with
/// `selfDNSQueue` configured they are gated by the synthetic self-filter.
pub(crate) struct Resolver {
    inner: TokioAsyncResolver,
}

impl Resolver {
    pub(crate) fn from_system_conf() -> Result<Self, ResolveError> {
        Ok(Self {
            inner: TokioAsyncResolver::tokio_from_system_conf()?,
        })
    }

    /// Reverse-resolve `ip` into normalized hostnames.
    ///
    /// An NXDOMAIN answer is an empty result, not an error.
    pub(crate) async fn reverse(&self, ip: IpAddr) -> Result<Vec<String>, ResolveError> {
        match self.inner.reverse_lookup(ip).await {
            Ok(lookup) => Ok(lookup
                .iter()
                .map(|ptr| normalize_hostname(&ptr.0))
                .collect()),
            Err(err) if is_no_records(&err) => Ok(Vec::new()),
            Err(err) => Err(err),
        }
    }

    /// Resolve `host` to addresses of the requested family only.
    pub(crate) async fn addrs(
        &self,
        host: &str,
        family: Family,
    ) -> Result<Vec<IpAddr>, ResolveError> {
        match family {
            Family::Ipv4 => match self.inner.ipv4_lookup(host).await {
                Ok(lookup) => Ok(lookup.iter().map(|a| IpAddr::V4(a.0)).collect()),
                Err(err) if is_no_records(&err) => Ok(Vec::new()),
                Err(err) => Err(err),
            },
            Family::Ipv6 => match self.inner.ipv6_lookup(host).await {
                Ok(lookup) => Ok(lookup.iter().map(|aaaa| IpAddr::V6(aaaa.0)).collect()),
                Err(err) if is_no_records(&err) => Ok(Vec::new()),
                Err(err) => Err(err),
            },
        }
    }
}

fn is_no_records(err: &ResolveError) -> bool {
    matches!(err.kind(), ResolveErrorKind::NoRecordsFound { .. })
}
