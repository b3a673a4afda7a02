//! Banned address checks for the control and transfer acceptors
//!
//! Entries are individual addresses (`203.0.113.7`) or CIDR ranges
//! (`198.51.100.0/24`, `2001:db8::/32`).

use std::net::IpAddr;
use thiserror::Error;

/// Consulted before any control or data connection is accepted
pub trait BanChecker: Send + Sync {
    fn is_banned(&self, ip: &IpAddr) -> bool;
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum BanListError {
    #[error("Invalid IP address: {0}")]
    InvalidIpAddress(String),

    #[error("Invalid CIDR notation: {0}")]
    InvalidCidr(String),
}

#[derive(Debug, Clone, PartialEq)]
struct Network {
    addr: IpAddr,
    prefix_len: u8,
}

impl Network {
    fn parse(s: &str) -> Result<Self, BanListError> {
        let (ip, prefix) = match s.split_once('/') {
            Some((ip, prefix)) => (ip, Some(prefix)),
            None => (s, None),
        };
        let addr: IpAddr = ip
            .parse()
            .map_err(|_| BanListError::InvalidIpAddress(s.to_string()))?;
        let max_prefix = if addr.is_ipv4() { 32 } else { 128 };

        let prefix_len = match prefix {
            Some(p) => p
                .parse::<u8>()
                .ok()
                .filter(|p| *p <= max_prefix)
                .ok_or_else(|| BanListError::InvalidCidr(s.to_string()))?,
            None => max_prefix,
        };

        Ok(Self { addr, prefix_len })
    }

    fn contains(&self, ip: &IpAddr) -> bool {
        if self.prefix_len == 0 {
            return self.addr.is_ipv4() == ip.is_ipv4();
        }
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = !0u32 << (32 - self.prefix_len);
                (u32::from(net) & mask) == (u32::from(*ip) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = !0u128 << (128 - self.prefix_len);
                (u128::from(net) & mask) == (u128::from(*ip) & mask)
            }
            _ => false,
        }
    }
}

/// Static list of banned networks
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BanList {
    networks: Vec<Network>,
}

impl BanList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries<I, S>(entries: I) -> Result<Self, BanListError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let networks = entries
            .into_iter()
            .map(|entry| Network::parse(entry.as_ref().trim()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { networks })
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.networks.len()
    }
}

impl BanChecker for BanList {
    fn is_banned(&self, ip: &IpAddr) -> bool {
        // IPv4-mapped IPv6 peers are checked as IPv4
        let ip = match ip {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(*ip),
            IpAddr::V4(_) => *ip,
        };
        self.networks.iter().any(|network| network.contains(&ip))
    }
}
