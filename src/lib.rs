pub mod bypass;
pub mod config;
pub mod dialer;
pub mod discovery;
pub mod error;
pub mod http_connect;
pub mod logging;
pub mod response;
pub mod socks5;
pub mod ssh_config;
pub mod ssh_jump;
pub mod stream;
pub mod transport;

pub use config::{DialerConfig, FallbackPolicy, ProxySettings};
pub use dialer::{DebugSink, TunnelDialer};
pub use discovery::{EnvProxyDiscovery, ProxyDiscovery};
pub use error::{Result, TunnelError};
pub use stream::{TunnelConnection, TunnelKind};
pub use transport::{ProxyEndpoint, ProxyScheme, TunnelTransport};
