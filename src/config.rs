use crate::bypass::BypassMatcher;
use crate::error::TunnelError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

fn default_timeout_secs() -> u64 {
    30
}

fn default_separator() -> char {
    ','
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

impl Default for LogFormat {
    fn default() -> Self {
        LogFormat::Text
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: Option<LogLevel>,
    #[serde(default)]
    pub format: Option<LogFormat>,
}

/// Which tunnel failures may be answered with a direct connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// Only failures to reach the proxy at all (refused, timed out, DNS).
    EstablishmentOnly,
    /// Any tunnel error, including 407/403 rejections and SSH auth failures.
    AnyTunnelError,
    /// Never dial directly once a proxy has been chosen.
    Never,
}

impl Default for FallbackPolicy {
    fn default() -> Self {
        FallbackPolicy::EstablishmentOnly
    }
}

impl FallbackPolicy {
    pub fn allows(&self, err: &TunnelError) -> bool {
        if err.is_terminal() {
            return false;
        }
        match self {
            FallbackPolicy::EstablishmentOnly => err.is_recoverable(),
            FallbackPolicy::AnyTunnelError => true,
            FallbackPolicy::Never => false,
        }
    }
}

/// Resolved proxy settings: the proxy server plus its bypass list.
///
/// The bypass list is compiled at most once, on [`ProxySettings::initialize`]
/// or on the first bypass query, whichever comes first. Concurrent first
/// queries race on a `OnceLock`, so only one compilation ever wins.
#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub proxy_server: String,
    pub bypass_list: String,
    pub separator: char,
    matcher: OnceLock<Result<BypassMatcher, String>>,
}

impl ProxySettings {
    pub fn new(proxy_server: impl Into<String>, bypass_list: impl Into<String>, separator: char) -> Self {
        Self {
            proxy_server: proxy_server.into(),
            bypass_list: bypass_list.into(),
            separator,
            matcher: OnceLock::new(),
        }
    }

    pub fn initialize(&self) -> Result<(), TunnelError> {
        match self.compiled() {
            Ok(_) => Ok(()),
            Err(e) => Err(TunnelError::Config(e.clone())),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.matcher.get().is_some()
    }

    fn compiled(&self) -> &Result<BypassMatcher, String> {
        self.matcher.get_or_init(|| {
            BypassMatcher::compile(&self.bypass_list, self.separator).map_err(|e| e.to_string())
        })
    }

    /// Whether `address` should skip the proxy. A bypass list that failed to
    /// compile never bypasses.
    pub fn should_bypass(&self, address: &str) -> bool {
        match self.compiled() {
            Ok(matcher) => matcher.should_bypass(address),
            Err(e) => {
                log::warn!("Bypass list {:?} is invalid, using proxy: {}", self.bypass_list, e);
                false
            }
        }
    }

    pub fn use_proxy(&self, address: &str) -> bool {
        !self.should_bypass(address)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialerConfig {
    #[serde(default)]
    pub proxy_server: Option<String>,
    // NO_PROXY format: "*", CIDR, ip[:port], [ipv6]:port, domain[:port], .domain, *.domain
    #[serde(default)]
    pub bypass_list: Option<String>,
    #[serde(default = "default_separator")]
    pub separator: char,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub fallback: FallbackPolicy,
    // Extra PEM roots trusted when talking to an https:// proxy
    #[serde(default)]
    pub proxy_ca_file: Option<PathBuf>,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

impl Default for DialerConfig {
    fn default() -> Self {
        Self {
            proxy_server: None,
            bypass_list: None,
            separator: default_separator(),
            timeout_secs: default_timeout_secs(),
            fallback: FallbackPolicy::default(),
            proxy_ca_file: None,
            logging: None,
        }
    }
}

impl DialerConfig {
    pub fn from_file(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: DialerConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> Result<(), Box<dyn std::error::Error>> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn proxy_settings(&self) -> Option<ProxySettings> {
        let server = self.proxy_server.as_deref().map(str::trim).unwrap_or("");
        if server.is_empty() {
            return None;
        }
        Some(ProxySettings::new(
            server,
            self.bypass_list.clone().unwrap_or_default(),
            self.separator,
        ))
    }

    pub fn validate(&self) -> Result<(), TunnelError> {
        if self.timeout_secs == 0 {
            return Err(TunnelError::Config("timeout_secs must be greater than zero".to_string()));
        }
        if self.separator.is_alphanumeric() || self.separator.is_whitespace() {
            return Err(TunnelError::Config(format!(
                "invalid bypass list separator {:?}",
                self.separator
            )));
        }
        if let Some(settings) = self.proxy_settings() {
            crate::transport::ProxyEndpoint::parse(&settings.proxy_server)?;
            settings.initialize()?;
        }
        if let Some(ca) = &self.proxy_ca_file {
            if !ca.exists() {
                return Err(TunnelError::Config(format!(
                    "proxy CA file not found: {}",
                    ca.display()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_settings_initialize_is_idempotent() {
        let settings = ProxySettings::new("http://proxy:8080", "10.0.0.0/8,.corp.local", ',');
        assert!(!settings.is_initialized());
        settings.initialize().unwrap();
        settings.initialize().unwrap();
        assert!(settings.is_initialized());
        assert!(settings.should_bypass("10.1.2.3:22"));
        assert!(settings.use_proxy("github.com:22"));
    }

    #[test]
    fn test_invalid_bypass_list_uses_proxy() {
        let settings = ProxySettings::new("http://proxy:8080", "build.corp.local", 'x');
        assert!(settings.initialize().is_err());
        assert!(!settings.should_bypass("build.corp.local:22"));
    }

    #[test]
    fn test_bad_port_entry_keeps_other_rules() {
        let settings = ProxySettings::new("http://proxy:8080", "*.corp.local:notaport,10.0.0.0/8", ',');
        settings.initialize().unwrap();
        assert!(settings.should_bypass("10.20.30.40:22"));
        assert!(settings.use_proxy("build.corp.local:22"));
    }

    #[test]
    fn test_concurrent_first_queries_share_one_matcher() {
        let settings = Arc::new(ProxySettings::new("proxy:3128", "example.com", ','));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let settings = settings.clone();
                std::thread::spawn(move || settings.should_bypass("www.example.com:443"))
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap());
        }
        assert!(settings.is_initialized());
    }

    #[test]
    fn test_config_defaults_from_json() {
        let config: DialerConfig =
            serde_json::from_str(r#"{"proxy_server": "socks5://127.0.0.1:1080"}"#).unwrap();
        assert_eq!(config.timeout_secs, 30);
        assert_eq!(config.separator, ',');
        assert_eq!(config.fallback, FallbackPolicy::EstablishmentOnly);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_rejects_unknown_scheme() {
        let config = DialerConfig {
            proxy_server: Some("ftp://proxy:21".to_string()),
            ..DialerConfig::default()
        };
        assert!(matches!(config.validate(), Err(TunnelError::Config(_))));
    }

    #[test]
    fn test_blank_proxy_server_means_no_proxy() {
        let config = DialerConfig {
            proxy_server: Some("   ".to_string()),
            ..DialerConfig::default()
        };
        assert!(config.proxy_settings().is_none());
    }

    #[test]
    fn test_fallback_policy() {
        let unreachable = TunnelError::ProxyUnreachable {
            proxy: "p".into(),
            target: "t".into(),
            source: std::io::ErrorKind::ConnectionRefused.into(),
        };
        let rejected = TunnelError::Protocol {
            proxy: "p".into(),
            target: "t".into(),
            reason: "HTTP/1.1 407".into(),
        };
        let config = TunnelError::Config("bad scheme".into());

        assert!(FallbackPolicy::EstablishmentOnly.allows(&unreachable));
        assert!(!FallbackPolicy::EstablishmentOnly.allows(&rejected));
        assert!(FallbackPolicy::AnyTunnelError.allows(&rejected));
        assert!(!FallbackPolicy::AnyTunnelError.allows(&config));
        assert!(!FallbackPolicy::Never.allows(&unreachable));
    }
}
