use std::{net::IpAddr, str::FromStr};

use anyhow::Context;
use ipnet::IpNet;
use url::{Host, Url};

pub const DEFAULT_BLOCKED_NETWORKS: [&str; 4] =
    ["127.0.0.0/8", "10.0.0.0/8", "192.168.0.0/16", "172.16.0.0/12"];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TargetError {
    #[error("URL is required")]
    Missing,
    #[error("Invalid URL format")]
    Malformed,
    #[error("URL must use HTTP or HTTPS protocol")]
    UnsupportedScheme,
    #[error("Scanning private/local addresses is not allowed")]
    PrivateAddress,
}

/// Decides which URLs may be handed to the scanner.
#[derive(Debug, Clone)]
pub struct TargetPolicy {
    blocked: Vec<IpNet>,
}

impl Default for TargetPolicy {
    fn default() -> Self {
        Self {
            blocked: DEFAULT_BLOCKED_NETWORKS
                .iter()
                .filter_map(|net| IpNet::from_str(net).ok())
                .collect(),
        }
    }
}

impl TargetPolicy {
    pub fn from_networks(networks: &[String]) -> anyhow::Result<Self> {
        let blocked = networks
            .iter()
            .map(|entry| {
                IpNet::from_str(entry.trim())
                    .with_context(|| format!("invalid blocked network {entry:?}"))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self { blocked })
    }

    pub fn validate(&self, raw: &str) -> Result<Url, TargetError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(TargetError::Missing);
        }

        let url = Url::parse(raw).map_err(|_| TargetError::Malformed)?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(TargetError::UnsupportedScheme);
        }

        let blocked = match url.host() {
            None => return Err(TargetError::Malformed),
            Some(Host::Domain(name)) => {
                name.trim_end_matches('.').eq_ignore_ascii_case("localhost")
            }
            Some(Host::Ipv4(ip)) => self.is_blocked(IpAddr::V4(ip)),
            Some(Host::Ipv6(ip)) => {
                ip.is_loopback()
                    || self.is_blocked(IpAddr::V6(ip))
                    || ip
                        .to_ipv4_mapped()
                        .is_some_and(|v4| self.is_blocked(IpAddr::V4(v4)))
            }
        };

        if blocked {
            return Err(TargetError::PrivateAddress);
        }
        Ok(url)
    }

    fn is_blocked(&self, ip: IpAddr) -> bool {
        self.blocked.iter().any(|net| net.contains(&ip))
    }
}
