//! Picks a path to the target for every dial: direct, or through the proxy
//! with a single direct retry when the policy allows it.

use crate::config::{DialerConfig, FallbackPolicy, ProxySettings};
use crate::discovery::{EnvProxyDiscovery, ProxyDiscovery};
use crate::error::{Result, TunnelError};
use crate::http_connect::{tls_client_config, HttpConnectTransport};
use crate::socks5::Socks5Transport;
use crate::ssh_jump::SshJumpTransport;
use crate::stream::TunnelConnection;
use crate::transport::{ProxyEndpoint, ProxyScheme, TunnelTransport};
use log::{debug, warn};
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Receives the dialer's human-readable progress messages.
pub type DebugSink = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Clone)]
pub struct TunnelDialer {
    settings: Option<Arc<ProxySettings>>,
    fallback: FallbackPolicy,
    timeout: Duration,
    debug: Option<DebugSink>,
    http: Arc<dyn TunnelTransport>,
    socks5: Arc<dyn TunnelTransport>,
    ssh: Arc<dyn TunnelTransport>,
}

impl fmt::Debug for TunnelDialer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelDialer")
            .field("settings", &self.settings)
            .field("fallback", &self.fallback)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl TunnelDialer {
    /// A dialer for `settings`; `None` means every dial goes direct.
    pub fn new(settings: Option<ProxySettings>) -> Result<Self> {
        Ok(Self {
            settings: settings.map(Arc::new),
            fallback: FallbackPolicy::default(),
            timeout: DEFAULT_TIMEOUT,
            debug: None,
            http: Arc::new(HttpConnectTransport::new()?),
            socks5: Arc::new(Socks5Transport::new()),
            ssh: Arc::new(SshJumpTransport::new()),
        })
    }

    pub fn from_discovery(discovery: &dyn ProxyDiscovery) -> Result<Self> {
        Self::new(discovery.discover())
    }

    /// Proxy settings from `SSH_PROXY`, `HTTPS_PROXY`, `HTTP_PROXY`,
    /// `ALL_PROXY` and `NO_PROXY`.
    pub fn from_env() -> Result<Self> {
        Self::from_discovery(&EnvProxyDiscovery::new())
    }

    pub fn from_config(config: &DialerConfig) -> Result<Self> {
        config.validate()?;
        let tls = tls_client_config(config.proxy_ca_file.as_deref())?;
        Ok(Self::new(config.proxy_settings())?
            .with_fallback(config.fallback)
            .with_timeout(config.timeout())
            .with_http_transport(Arc::new(HttpConnectTransport::with_tls_config(Arc::new(tls)))))
    }

    pub fn with_fallback(mut self, fallback: FallbackPolicy) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_debug_sink(mut self, sink: DebugSink) -> Self {
        self.debug = Some(sink);
        if let Some(settings) = &self.settings {
            self.note(&format!("Use proxy {}", redact(&settings.proxy_server)));
        }
        self
    }

    pub fn with_http_transport(mut self, transport: Arc<dyn TunnelTransport>) -> Self {
        self.http = transport;
        self
    }

    pub fn with_socks5_transport(mut self, transport: Arc<dyn TunnelTransport>) -> Self {
        self.socks5 = transport;
        self
    }

    pub fn with_ssh_transport(mut self, transport: Arc<dyn TunnelTransport>) -> Self {
        self.ssh = transport;
        self
    }

    pub fn settings(&self) -> Option<&ProxySettings> {
        self.settings.as_deref()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn note(&self, msg: &str) {
        debug!("{}", msg);
        if let Some(sink) = &self.debug {
            sink(msg);
        }
    }

    fn transport_for(&self, scheme: ProxyScheme) -> &dyn TunnelTransport {
        match scheme {
            ProxyScheme::Http | ProxyScheme::Https => self.http.as_ref(),
            ProxyScheme::Socks5 | ProxyScheme::Socks5h => self.socks5.as_ref(),
            ProxyScheme::Ssh => self.ssh.as_ref(),
        }
    }

    /// Dials with the configured timeout.
    pub async fn dial(&self, address: &str) -> Result<TunnelConnection> {
        self.dial_timeout(address, self.timeout).await
    }

    pub async fn dial_timeout(&self, address: &str, timeout: Duration) -> Result<TunnelConnection> {
        let Some(settings) = self.settings.as_deref() else {
            return self.dial_direct(address, timeout).await;
        };
        if settings.should_bypass(address) {
            self.note(&format!("{} matches the bypass list", address));
            return self.dial_direct(address, timeout).await;
        }

        let proxy = ProxyEndpoint::parse(&settings.proxy_server)?;
        if proxy.address() == address {
            self.note(&format!(
                "Proxy {} is the target itself, connecting directly",
                proxy.redacted()
            ));
            return self.dial_direct(address, timeout).await;
        }

        match self.transport_for(proxy.scheme()).dial(&proxy, address, timeout).await {
            Ok(conn) => Ok(conn),
            Err(e) if self.fallback.allows(&e) => {
                warn!("{}", e);
                self.note(&format!("Tunnel cannot establish, try connect direct {}", address));
                self.dial_direct(address, timeout).await
            }
            Err(e) => Err(e),
        }
    }

    /// Like [`dial_timeout`](Self::dial_timeout), but gives up as soon as
    /// `cancel` fires. A cancelled dial never falls back.
    pub async fn dial_with_cancel(
        &self,
        address: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<TunnelConnection> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.note(&format!("Dial to {} cancelled", address));
                Err(TunnelError::Cancelled { target: address.to_string() })
            }
            result = self.dial_timeout(address, timeout) => result,
        }
    }

    /// Plain TCP connect to `address`. Failures here are final.
    pub async fn dial_direct(&self, address: &str, timeout: Duration) -> Result<TunnelConnection> {
        let direct_err = |source: io::Error| TunnelError::DirectDial {
            target: address.to_string(),
            source,
        };
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
            Ok(result) => result.map_err(direct_err)?,
            Err(_) => {
                return Err(direct_err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {} timed out", address),
                )))
            }
        };
        stream.set_nodelay(true).ok();
        let conn = TunnelConnection::direct(stream).map_err(direct_err)?;
        self.note(&format!("Establish direct connection {}", conn.peer_addr()));
        Ok(conn)
    }
}

fn redact(proxy_server: &str) -> String {
    ProxyEndpoint::parse(proxy_server)
        .map(|p| p.redacted())
        .unwrap_or_else(|_| proxy_server.to_string())
}
