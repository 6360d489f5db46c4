//! Proxy bypass rules in `NO_PROXY` / Windows `ProxyOverride` format.
//!
//! Supported entries:
//! - `*` matches every destination and overrides all other entries
//! - `10.0.0.0/8`, `fd00::/8` CIDR ranges
//! - `1.2.3.4`, `1.2.3.4:8080`, `[::1]:22` literal addresses, optionally port-scoped
//! - `example.com` matches example.com itself and any subdomain
//! - `.example.com` and `*.example.com` match subdomains only
//! - any domain form may carry a `:port` suffix

use crate::error::TunnelError;
use ipnet::IpNet;
use log::warn;
use std::net::IpAddr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Matcher {
    All,
    Cidr(IpNet),
    Ip {
        ip: IpAddr,
        port: Option<u16>,
    },
    Domain {
        // always stored with a leading '.'
        suffix: String,
        port: Option<u16>,
        match_bare_host: bool,
    },
}

impl Matcher {
    fn matches(&self, host: &str, port: Option<u16>, ip: Option<IpAddr>) -> bool {
        match self {
            Matcher::All => true,
            Matcher::Cidr(net) => ip.is_some_and(|ip| net.contains(&ip)),
            Matcher::Ip { ip: rule_ip, port: rule_port } => {
                ip == Some(*rule_ip) && port_matches(*rule_port, port)
            }
            Matcher::Domain {
                suffix,
                port: rule_port,
                match_bare_host,
            } => {
                let hit = host.ends_with(suffix.as_str()) || (*match_bare_host && host == &suffix[1..]);
                hit && port_matches(*rule_port, port)
            }
        }
    }
}

fn port_matches(rule: Option<u16>, requested: Option<u16>) -> bool {
    match rule {
        None => true,
        Some(p) => requested == Some(p),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BypassMatcher {
    ip_matchers: Vec<Matcher>,
    domain_matchers: Vec<Matcher>,
}

impl BypassMatcher {
    /// Entries with an unparsable port are skipped with a warning; the rest
    /// of the list still applies. Only an unusable separator fails.
    pub fn compile(bypass_list: &str, separator: char) -> Result<Self, TunnelError> {
        if separator.is_alphanumeric()
            || separator.is_whitespace()
            || matches!(separator, '.' | ':' | '/' | '*')
        {
            return Err(TunnelError::Config(format!(
                "invalid bypass list separator {:?}",
                separator
            )));
        }
        let mut matcher = BypassMatcher::default();

        for entry in bypass_list.split(separator) {
            let entry = entry.trim().to_lowercase();
            if entry.is_empty() {
                continue;
            }

            if entry == "*" {
                return Ok(BypassMatcher {
                    ip_matchers: vec![Matcher::All],
                    domain_matchers: vec![Matcher::All],
                });
            }

            if let Ok(net) = entry.parse::<IpNet>() {
                matcher.ip_matchers.push(Matcher::Cidr(net.trunc()));
                continue;
            }

            let (host, port) = split_entry(&entry);
            if host.is_empty() {
                // ":8080" and friends carry no host; nothing sensible to match
                continue;
            }
            let port = match port {
                None | Some("") => None,
                Some(p) => match p.parse::<u16>() {
                    Ok(p) => Some(p),
                    Err(_) => {
                        warn!("Ignoring bypass entry {:?}: invalid port", entry);
                        continue;
                    }
                },
            };

            if let Ok(ip) = host.parse::<IpAddr>() {
                matcher.ip_matchers.push(Matcher::Ip { ip, port });
                continue;
            }

            let host = host.strip_prefix('*').filter(|h| h.starts_with('.')).unwrap_or(host);
            let (suffix, match_bare_host) = if host.starts_with('.') {
                (host.to_string(), false)
            } else {
                (format!(".{}", host), true)
            };
            matcher.domain_matchers.push(Matcher::Domain {
                suffix,
                port,
                match_bare_host,
            });
        }

        Ok(matcher)
    }

    pub fn ip_matchers(&self) -> &[Matcher] {
        &self.ip_matchers
    }

    pub fn domain_matchers(&self) -> &[Matcher] {
        &self.domain_matchers
    }

    /// True when `address` (`host:port`) should be dialed directly.
    pub fn should_bypass(&self, address: &str) -> bool {
        if address.is_empty() {
            return false;
        }
        let Some((host, port)) = split_host_port(address) else {
            // Not a dialable host:port; the direct dial reports the real error.
            return true;
        };
        if host.eq_ignore_ascii_case("localhost") {
            return true;
        }
        let ip = host.parse::<IpAddr>().ok();
        if ip.is_some_and(|ip| ip.is_loopback()) {
            return true;
        }

        let host = host.trim().to_lowercase();
        let port = port.parse::<u16>().ok();

        if ip.is_some() && self.ip_matchers.iter().any(|m| m.matches(&host, port, ip)) {
            return true;
        }
        self.domain_matchers.iter().any(|m| m.matches(&host, port, ip))
    }
}

/// Splits a bypass entry into host and optional port. Unbracketed IPv6
/// literals (more than one colon) are returned whole.
fn split_entry(entry: &str) -> (&str, Option<&str>) {
    if let Some(rest) = entry.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            return (host, tail.strip_prefix(':'));
        }
        return (entry, None);
    }
    match entry.split_once(':') {
        Some((host, port)) if !port.contains(':') => (host, Some(port)),
        _ => (entry, None),
    }
}

/// `host:port` / `[v6]:port` splitting with brackets removed from the host.
pub(crate) fn split_host_port(address: &str) -> Option<(&str, &str)> {
    if let Some(rest) = address.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        let port = tail.strip_prefix(':')?;
        return Some((host, port));
    }
    let (host, port) = address.rsplit_once(':')?;
    if host.contains(':') {
        return None;
    }
    Some((host, port))
}
