//! Range Enumerator
//!
//! Expands configured inclusive IPv4 ranges into the deduplicated set of
//! candidate addresses swept by discovery.

use std::collections::BTreeSet;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use ipnet::Ipv4Net;

use crate::error::{Error, Result};

/// An inclusive IPv4 address range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpRange {
    start: Ipv4Addr,
    end: Ipv4Addr,
}

impl IpRange {
    /// Create a range, rejecting `start > end`.
    pub fn new(start: Ipv4Addr, end: Ipv4Addr) -> Result<Self> {
        if u32::from(start) > u32::from(end) {
            return Err(Error::invalid_range(
                start.to_string(),
                end.to_string(),
                "start is after end",
            ));
        }
        Ok(Self { start, end })
    }

    /// Parse both bounds from IPv4 literals.
    pub fn parse(start: &str, end: &str) -> Result<Self> {
        let parse_bound = |raw: &str| {
            raw.trim().parse::<Ipv4Addr>().map_err(|_| {
                Error::invalid_range(start, end, format!("'{}' is not an IPv4 address", raw))
            })
        };
        Self::new(parse_bound(start)?, parse_bound(end)?)
    }

    /// Range covering a CIDR block from network to broadcast address.
    pub fn from_cidr(net: Ipv4Net) -> Self {
        Self {
            start: net.network(),
            end: net.broadcast(),
        }
    }

    /// A range holding one address.
    pub fn single(addr: Ipv4Addr) -> Self {
        Self {
            start: addr,
            end: addr,
        }
    }

    pub fn start(&self) -> Ipv4Addr {
        self.start
    }

    pub fn end(&self) -> Ipv4Addr {
        self.end
    }

    /// Number of addresses in the range.
    pub fn len(&self) -> u64 {
        u64::from(u32::from(self.end)) - u64::from(u32::from(self.start)) + 1
    }

    /// A valid range always holds at least one address.
    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        (u32::from(self.start)..=u32::from(self.end)).contains(&u32::from(addr))
    }

    /// Lazily walk every address in the range.
    pub fn iter(&self) -> impl Iterator<Item = Ipv4Addr> {
        (u32::from(self.start)..=u32::from(self.end)).map(Ipv4Addr::from)
    }
}

impl fmt::Display for IpRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

impl FromStr for IpRange {
    type Err = Error;

    /// Accepts `a.b.c.d-e.f.g.h`, CIDR `a.b.c.d/n`, or a single address.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some((start, end)) = s.split_once('-') {
            return Self::parse(start, end);
        }
        if s.contains('/') {
            let net: Ipv4Net = s
                .parse()
                .map_err(|e| Error::invalid_range(s, s, format!("bad CIDR block: {}", e)))?;
            return Ok(Self::from_cidr(net));
        }
        Self::parse(s, s)
    }
}

/// Deduplicated union of every address in every range.
pub fn enumerate_candidates(ranges: &[IpRange]) -> BTreeSet<Ipv4Addr> {
    ranges.iter().flat_map(IpRange::iter).collect()
}
