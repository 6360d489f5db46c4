//! Tunnels through an SSH jump host with a `direct-tcpip` channel.

use crate::bypass::split_host_port;
use crate::error::{is_connect_failure, DialContext, Result, TunnelError};
use crate::ssh_config::{expand_tilde, SshConfig};
use crate::stream::TunnelConnection;
use crate::transport::{connect_proxy, with_timeout, ProxyEndpoint, TunnelTransport};
use async_trait::async_trait;
use log::{debug, info, warn};
use russh::client::{self, Handle, Msg};
use russh::keys::{self, PrivateKey, PrivateKeyWithHashAlg, PublicKey};
use russh::{ChannelStream, Disconnect};
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

const DEFAULT_IDENTITIES: [&str; 3] = ["id_ed25519", "id_ecdsa", "id_rsa"];

/// Where the jump transport gets its user name, keys and host-key trust from.
pub trait JumpHostCredentials: Send + Sync {
    /// Configured login for `host`, if any.
    fn user_for_host(&self, host: &str) -> Option<String>;

    /// Private keys to offer, in order.
    fn identities(&self, host: &str) -> Vec<PrivateKey>;

    /// Whether the server key presented by `host:port` is trusted.
    fn verify_host_key(&self, host: &str, port: u16, key: &PublicKey) -> bool;
}

/// Reads `~/.ssh/config`, the usual `~/.ssh/id_*` keys and `~/.ssh/known_hosts`.
pub struct DefaultJumpHostCredentials {
    config: SshConfig,
    ssh_dir: Option<PathBuf>,
    accept_unknown_hosts: bool,
}

impl DefaultJumpHostCredentials {
    pub fn load() -> Self {
        Self::with_config(
            SshConfig::load_default(),
            dirs::home_dir().map(|home| home.join(".ssh")),
        )
    }

    pub fn with_config(config: SshConfig, ssh_dir: Option<PathBuf>) -> Self {
        Self {
            config,
            ssh_dir,
            accept_unknown_hosts: false,
        }
    }

    /// Accept hosts that have no `known_hosts` entry. Changed keys are still
    /// rejected.
    pub fn accept_unknown_hosts(mut self, accept: bool) -> Self {
        self.accept_unknown_hosts = accept;
        self
    }

    fn load_key(path: &Path) -> Option<PrivateKey> {
        match keys::load_secret_key(path, None) {
            Ok(key) => Some(key),
            Err(e) => {
                debug!("Skipping identity {}: {}", path.display(), e);
                None
            }
        }
    }
}

impl JumpHostCredentials for DefaultJumpHostCredentials {
    fn user_for_host(&self, host: &str) -> Option<String> {
        self.config.get(host, "User").map(str::to_string)
    }

    fn identities(&self, host: &str) -> Vec<PrivateKey> {
        let configured = self.config.get_all(host, "IdentityFile");
        if !configured.is_empty() {
            return configured
                .into_iter()
                .filter_map(|path| Self::load_key(&expand_tilde(path)))
                .collect();
        }
        let Some(dir) = &self.ssh_dir else {
            return Vec::new();
        };
        DEFAULT_IDENTITIES
            .iter()
            .filter_map(|name| Self::load_key(&dir.join(name)))
            .collect()
    }

    fn verify_host_key(&self, host: &str, port: u16, key: &PublicKey) -> bool {
        let Some(dir) = &self.ssh_dir else {
            return self.accept_unknown_hosts;
        };
        match keys::check_known_hosts_path(host, port, key, dir.join("known_hosts")) {
            Ok(true) => true,
            Ok(false) => {
                if !self.accept_unknown_hosts {
                    warn!("Host key for {}:{} is not in known_hosts", host, port);
                }
                self.accept_unknown_hosts
            }
            Err(keys::Error::KeyChanged { line }) => {
                warn!("Host key for {}:{} does not match known_hosts line {}", host, port, line);
                false
            }
            Err(e) => {
                debug!("Could not check known_hosts for {}: {}", host, e);
                self.accept_unknown_hosts
            }
        }
    }
}

pub(crate) struct JumpHostHandler {
    host: String,
    port: u16,
    credentials: Arc<dyn JumpHostCredentials>,
}

impl client::Handler for JumpHostHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> std::result::Result<bool, Self::Error> {
        Ok(self.credentials.verify_host_key(&self.host, self.port, server_public_key))
    }
}

/// The SSH client connection to the jump host plus the forwarded channel
/// riding on it.
pub struct SshTunnel {
    pub(crate) channel: Pin<Box<ChannelStream<Msg>>>,
    session: Handle<JumpHostHandler>,
    pub(crate) local_addr: SocketAddr,
    pub(crate) peer_addr: SocketAddr,
}

impl SshTunnel {
    /// Channel first, then the client. Both are attempted; the first error is
    /// reported.
    pub(crate) async fn close(mut self) -> io::Result<()> {
        let channel = self.channel.shutdown().await;
        let session = self
            .session
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
            .map_err(io::Error::other);
        channel.and(session)
    }
}

#[derive(Clone)]
pub struct SshJumpTransport {
    credentials: Arc<dyn JumpHostCredentials>,
}

impl Default for SshJumpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SshJumpTransport {
    pub fn new() -> Self {
        Self::with_credentials(Arc::new(DefaultJumpHostCredentials::load()))
    }

    pub fn with_credentials(credentials: Arc<dyn JumpHostCredentials>) -> Self {
        Self { credentials }
    }

    /// URL userinfo, then ssh config, then the local account.
    fn resolve_user(&self, proxy: &ProxyEndpoint, host: &str) -> Result<String> {
        if let Some(creds) = proxy.credentials().filter(|c| !c.username.is_empty()) {
            return Ok(creds.username.clone());
        }
        if let Some(user) = self.credentials.user_for_host(host) {
            return Ok(user);
        }
        ["USER", "USERNAME", "LOGNAME"]
            .iter()
            .filter_map(|var| std::env::var(var).ok())
            .find(|user| !user.is_empty())
            .ok_or_else(|| TunnelError::Config("unable to determine user name for the jump host".into()))
    }

    async fn authenticate(
        &self,
        session: &mut Handle<JumpHostHandler>,
        proxy: &ProxyEndpoint,
        host: &str,
        user: &str,
        ctx: &DialContext,
    ) -> Result<()> {
        let hash_alg = session
            .best_supported_rsa_hash()
            .await
            .map_err(|e| classify(ctx, e))?
            .flatten();

        for key in self.credentials.identities(host) {
            let key = PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg);
            let result = session
                .authenticate_publickey(user, key)
                .await
                .map_err(|e| classify(ctx, e))?;
            if result.success() {
                return Ok(());
            }
        }

        if let Some(password) = proxy.credentials().and_then(|c| c.password.as_deref()) {
            let result = session
                .authenticate_password(user, password)
                .await
                .map_err(|e| classify(ctx, e))?;
            if result.success() {
                return Ok(());
            }
        }

        Err(ctx.auth(format!("jump host rejected every credential offered for {}", user)))
    }

    async fn establish(&self, proxy: &ProxyEndpoint, target: &str, ctx: &DialContext) -> Result<TunnelConnection> {
        let (target_host, target_port) = split_host_port(target)
            .and_then(|(h, p)| p.parse::<u16>().ok().map(|p| (h, p)))
            .ok_or_else(|| ctx.protocol(format!("invalid target address {:?}", target)))?;
        let host = proxy.host().trim_start_matches('[').trim_end_matches(']');
        let user = self.resolve_user(proxy, host)?;

        let tcp = connect_proxy(ctx, &proxy.address()).await?;
        let local = tcp.local_addr().map_err(|e| ctx.io(e))?;
        let peer = tcp.peer_addr().map_err(|e| ctx.io(e))?;

        let handler = JumpHostHandler {
            host: host.to_string(),
            port: proxy.port(),
            credentials: self.credentials.clone(),
        };
        let config = Arc::new(client::Config::default());
        let mut session = client::connect_stream(config, tcp, handler)
            .await
            .map_err(|e| classify(ctx, e))?;

        if let Err(e) = self.authenticate(&mut session, proxy, host, &user, ctx).await {
            let _ = session.disconnect(Disconnect::ByApplication, "", "en").await;
            return Err(e);
        }

        let channel = match session
            .channel_open_direct_tcpip(target_host, u32::from(target_port), local.ip().to_string(), u32::from(local.port()))
            .await
        {
            Ok(channel) => channel,
            Err(e) => {
                let _ = session.disconnect(Disconnect::ByApplication, "", "en").await;
                return Err(ctx.protocol(format!("jump host could not open a channel to {}: {}", target, e)));
            }
        };

        info!("Established connection to proxy({}): {}", proxy.scheme(), proxy.address());
        Ok(TunnelConnection::ssh_jump(SshTunnel {
            channel: Box::pin(channel.into_stream()),
            session,
            local_addr: local,
            peer_addr: peer,
        }))
    }
}

fn classify(ctx: &DialContext, err: russh::Error) -> TunnelError {
    match err {
        russh::Error::IO(e) if is_connect_failure(&e) => ctx.unreachable(e),
        russh::Error::IO(e) => ctx.io(e),
        russh::Error::UnknownKey => ctx.auth("jump host key is not trusted"),
        other => ctx.protocol(format!("SSH handshake failed: {}", other)),
    }
}

#[async_trait]
impl TunnelTransport for SshJumpTransport {
    async fn dial(&self, proxy: &ProxyEndpoint, target: &str, timeout: Duration) -> Result<TunnelConnection> {
        let ctx = proxy.context(target);
        with_timeout(&ctx, timeout, self.establish(proxy, target, &ctx)).await
    }
}
