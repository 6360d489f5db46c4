use crate::error::{is_connect_failure, DialContext, Result, TunnelError};
use crate::stream::TunnelConnection;
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use percent_encoding::percent_decode_str;
use std::fmt;
use std::future::Future;
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;
use url::Url;
use zeroize::Zeroize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyScheme {
    Http,
    Https,
    Socks5,
    Socks5h,
    Ssh,
}

impl ProxyScheme {
    fn from_str(scheme: &str) -> Option<Self> {
        match scheme {
            "http" => Some(ProxyScheme::Http),
            "https" => Some(ProxyScheme::Https),
            "socks5" => Some(ProxyScheme::Socks5),
            "socks5h" => Some(ProxyScheme::Socks5h),
            "ssh" => Some(ProxyScheme::Ssh),
            _ => None,
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            ProxyScheme::Http => 80,
            ProxyScheme::Https => 443,
            ProxyScheme::Socks5 | ProxyScheme::Socks5h => 1080,
            ProxyScheme::Ssh => 22,
        }
    }
}

impl fmt::Display for ProxyScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyScheme::Http => write!(f, "http"),
            ProxyScheme::Https => write!(f, "https"),
            ProxyScheme::Socks5 => write!(f, "socks5"),
            ProxyScheme::Socks5h => write!(f, "socks5h"),
            ProxyScheme::Ssh => write!(f, "ssh"),
        }
    }
}

/// Userinfo from the proxy URL, percent-decoded. Wiped on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: Option<String>,
}

impl Credentials {
    /// `base64(username:password)` for a `Proxy-Authorization: Basic` header.
    pub fn basic_auth(&self) -> String {
        let mut raw = format!("{}:{}", self.username, self.password.as_deref().unwrap_or(""));
        let encoded = general_purpose::STANDARD.encode(raw.as_bytes());
        raw.zeroize();
        encoded
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

impl Drop for Credentials {
    fn drop(&mut self) {
        self.username.zeroize();
        if let Some(password) = self.password.as_mut() {
            password.zeroize();
        }
    }
}

/// A proxy server string normalized into something dialable.
#[derive(Debug, Clone)]
pub struct ProxyEndpoint {
    url: Url,
    scheme: ProxyScheme,
    host: String,
    port: u16,
    credentials: Option<Credentials>,
}

impl ProxyEndpoint {
    /// Accepts a full URL or a bare `host:port`, which is taken as `http://`.
    pub fn parse(proxy_server: &str) -> Result<Self> {
        let raw = proxy_server.trim();
        let normalized = if raw.contains("://") {
            raw.to_string()
        } else {
            format!("http://{}", raw)
        };
        let url = Url::parse(&normalized)
            .map_err(|e| TunnelError::Config(format!("invalid proxy url {:?}: {}", raw, e)))?;
        let scheme = ProxyScheme::from_str(url.scheme()).ok_or_else(|| {
            TunnelError::Config(format!("unsupported proxy scheme {:?}", url.scheme()))
        })?;
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| TunnelError::Config(format!("proxy url {:?} has no host", raw)))?
            .to_string();
        let port = url.port().unwrap_or_else(|| scheme.default_port());

        let credentials = if url.username().is_empty() && url.password().is_none() {
            None
        } else {
            let decode = |s: &str| percent_decode_str(s).decode_utf8_lossy().into_owned();
            Some(Credentials {
                username: decode(url.username()),
                password: url.password().map(decode),
            })
        };

        Ok(Self {
            url,
            scheme,
            host,
            port,
            credentials,
        })
    }

    pub fn scheme(&self) -> ProxyScheme {
        self.scheme
    }

    /// Host as it appears in the URL; IPv6 literals keep their brackets.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port` to open a socket to.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    /// The URL with any password masked, safe for logs and error messages.
    pub fn redacted(&self) -> String {
        let mut url = self.url.clone();
        if url.password().is_some() {
            let _ = url.set_password(Some("***"));
        }
        url.to_string().trim_end_matches('/').to_string()
    }

    pub(crate) fn context(&self, target: &str) -> DialContext {
        DialContext::new(self.redacted(), target)
    }
}

/// One way of reaching a target through a proxy.
#[async_trait]
pub trait TunnelTransport: Send + Sync {
    async fn dial(&self, proxy: &ProxyEndpoint, target: &str, timeout: Duration) -> Result<TunnelConnection>;
}

/// Runs a whole proxy handshake under one deadline; running out of time is a
/// connection-establishment failure.
pub(crate) async fn with_timeout<T, F>(ctx: &DialContext, timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(ctx.timed_out()),
    }
}

/// Opens a TCP socket to the proxy. Resolution failures and refused or
/// unreachable connects all mean the proxy is not usable.
pub(crate) async fn connect_proxy(ctx: &DialContext, address: &str) -> Result<TcpStream> {
    let addrs: Vec<_> = tokio::net::lookup_host(address)
        .await
        .map_err(|e| {
            ctx.unreachable(io::Error::new(
                io::ErrorKind::NotFound,
                format!("failed to resolve proxy {}: {}", address, e),
            ))
        })?
        .collect();

    let mut last_err = io::Error::new(
        io::ErrorKind::NotFound,
        format!("proxy {} resolved to no addresses", address),
    );
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                stream.set_nodelay(true).ok();
                return Ok(stream);
            }
            Err(e) => last_err = e,
        }
    }
    if is_connect_failure(&last_err) || last_err.kind() == io::ErrorKind::NotFound {
        Err(ctx.unreachable(last_err))
    } else {
        Err(ctx.io(last_err))
    }
}
