//! Where [`ProxySettings`] come from.

use crate::config::ProxySettings;
use log::debug;

/// Produces the proxy settings a dialer should use, if any.
///
/// Platform-specific sources (a registry key, a desktop proxy setting) plug in
/// here; [`EnvProxyDiscovery`] covers the usual environment variables.
pub trait ProxyDiscovery: Send + Sync {
    fn discover(&self) -> Option<ProxySettings>;
}

const PROXY_VARS: [[&str; 2]; 4] = [
    ["SSH_PROXY", "ssh_proxy"],
    ["HTTPS_PROXY", "https_proxy"],
    ["HTTP_PROXY", "http_proxy"],
    ["ALL_PROXY", "all_proxy"],
];

const NO_PROXY_VARS: [&str; 2] = ["NO_PROXY", "no_proxy"];

type Lookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Reads `SSH_PROXY`, `HTTPS_PROXY`, `HTTP_PROXY` and `ALL_PROXY` (first
/// non-empty wins, upper case before lower case) plus `NO_PROXY`.
pub struct EnvProxyDiscovery {
    lookup: Lookup,
}

impl Default for EnvProxyDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvProxyDiscovery {
    pub fn new() -> Self {
        Self::with_lookup(|name| std::env::var(name).ok())
    }

    /// Uses `lookup` in place of the process environment.
    pub fn with_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            lookup: Box::new(lookup),
        }
    }

    fn first_set(&self, names: &[&str]) -> Option<String> {
        names
            .iter()
            .filter_map(|name| (self.lookup)(name))
            .map(|value| value.trim().to_string())
            .find(|value| !value.is_empty())
    }
}

impl ProxyDiscovery for EnvProxyDiscovery {
    fn discover(&self) -> Option<ProxySettings> {
        let server = PROXY_VARS.iter().find_map(|names| self.first_set(names))?;
        let bypass = self.first_set(&NO_PROXY_VARS).unwrap_or_default();
        debug!("Discovered proxy {} (bypass: {:?})", server, bypass);
        Some(ProxySettings::new(server, bypass, ','))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn discovery(vars: &[(&str, &str)]) -> EnvProxyDiscovery {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EnvProxyDiscovery::with_lookup(move |name| vars.get(name).cloned())
    }

    #[test]
    fn test_nothing_configured() {
        assert!(discovery(&[("NO_PROXY", "localhost")]).discover().is_none());
    }

    #[test]
    fn test_ssh_proxy_takes_precedence() {
        let settings = discovery(&[
            ("HTTPS_PROXY", "http://web:3128"),
            ("ssh_proxy", "ssh://bastion"),
            ("no_proxy", "10.0.0.0/8,.corp"),
        ])
        .discover()
        .unwrap();
        assert_eq!(settings.proxy_server, "ssh://bastion");
        assert_eq!(settings.bypass_list, "10.0.0.0/8,.corp");
        assert_eq!(settings.separator, ',');
    }

    #[test]
    fn test_upper_case_before_lower_case() {
        let settings = discovery(&[
            ("http_proxy", "http://lower:1"),
            ("HTTP_PROXY", "http://upper:1"),
        ])
        .discover()
        .unwrap();
        assert_eq!(settings.proxy_server, "http://upper:1");
    }

    #[test]
    fn test_empty_values_are_skipped() {
        let settings = discovery(&[
            ("HTTPS_PROXY", "  "),
            ("ALL_PROXY", "socks5://127.0.0.1:1080"),
        ])
        .discover()
        .unwrap();
        assert_eq!(settings.proxy_server, "socks5://127.0.0.1:1080");
        assert!(settings.bypass_list.is_empty());
    }
}
