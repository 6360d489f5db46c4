//! Tunnels through a SOCKS5 proxy (RFC 1928, RFC 1929 password auth).
//!
//! `socks5://` and `socks5h://` behave the same: target names are resolved
//! by the proxy.

use crate::bypass::split_host_port;
use crate::error::{is_connect_failure, DialContext, Result};
use crate::stream::TunnelConnection;
use crate::transport::{connect_proxy, with_timeout, ProxyEndpoint, TunnelTransport};
use async_trait::async_trait;
use log::info;
use std::net::SocketAddr;
use std::time::Duration;
use tokio_socks::tcp::Socks5Stream;
use tokio_socks::{Error as SocksError, TargetAddr};

#[derive(Debug, Clone, Default)]
pub struct Socks5Transport;

impl Socks5Transport {
    pub fn new() -> Self {
        Self
    }

    /// IP literals go out as addresses; every other host is sent by name so
    /// that names only the proxy can resolve still work.
    fn target_addr(target: &str, ctx: &DialContext) -> Result<TargetAddr<'static>> {
        let (host, port) = split_host_port(target)
            .ok_or_else(|| ctx.protocol(format!("invalid SOCKS5 target address {:?}", target)))?;
        let port: u16 = port
            .parse()
            .map_err(|_| ctx.protocol(format!("invalid SOCKS5 target port {:?}", port)))?;

        match host.parse() {
            Ok(ip) => Ok(TargetAddr::Ip(SocketAddr::new(ip, port))),
            Err(_) => Ok(TargetAddr::Domain(host.to_string().into(), port)),
        }
    }

    async fn establish(&self, proxy: &ProxyEndpoint, target: &str, ctx: &DialContext) -> Result<TunnelConnection> {
        let target_addr = Self::target_addr(target, ctx)?;
        let tcp = connect_proxy(ctx, &proxy.address()).await?;
        let local = tcp.local_addr().map_err(|e| ctx.io(e))?;
        let peer = tcp.peer_addr().map_err(|e| ctx.io(e))?;

        let handshake = match proxy.credentials() {
            Some(creds) => {
                Socks5Stream::connect_with_password_and_socket(
                    tcp,
                    target_addr,
                    &creds.username,
                    creds.password.as_deref().unwrap_or(""),
                )
                .await
            }
            None => Socks5Stream::connect_with_socket(tcp, target_addr).await,
        };
        let stream = handshake.map_err(|e| classify(ctx, e))?;

        info!("Established connection to proxy({}): {}", proxy.scheme(), proxy.address());
        Ok(TunnelConnection::socks5(stream, local, peer))
    }
}

fn classify(ctx: &DialContext, err: SocksError) -> crate::error::TunnelError {
    match err {
        SocksError::Io(e) if is_connect_failure(&e) => ctx.unreachable(e),
        SocksError::Io(e) => ctx.io(e),
        SocksError::PasswordAuthFailure(_)
        | SocksError::NoAcceptableAuthMethods
        | SocksError::InvalidAuthValues(_) => ctx.auth(format!("SOCKS5 authentication failed: {}", err)),
        other => ctx.protocol(format!("SOCKS5 handshake failed: {}", other)),
    }
}

#[async_trait]
impl TunnelTransport for Socks5Transport {
    async fn dial(&self, proxy: &ProxyEndpoint, target: &str, timeout: Duration) -> Result<TunnelConnection> {
        let ctx = proxy.context(target);
        with_timeout(&ctx, timeout, self.establish(proxy, target, &ctx)).await
    }
}
