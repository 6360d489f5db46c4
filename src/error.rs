use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection error: couldn't establish connection to proxy {proxy} while dialing {target}: {source}")]
    ProxyUnreachable {
        proxy: String,
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("Protocol error: proxy {proxy} while dialing {target}: {reason}")]
    Protocol {
        proxy: String,
        target: String,
        reason: String,
    },

    #[error("Authentication error: proxy {proxy} while dialing {target}: {reason}")]
    Auth {
        proxy: String,
        target: String,
        reason: String,
    },

    #[error("IO error: proxy {proxy} while dialing {target}: {source}")]
    Io {
        proxy: String,
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("Direct connection to {target} failed: {source}")]
    DirectDial {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("Dial to {target} was cancelled")]
    Cancelled { target: String },
}

impl TunnelError {
    /// Connection-establishment failures towards the proxy itself. Only these
    /// are safe to answer with a direct connection.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, TunnelError::ProxyUnreachable { .. })
    }

    /// Errors that no fallback policy may ever turn into a direct dial.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TunnelError::Config(_) | TunnelError::DirectDial { .. } | TunnelError::Cancelled { .. }
        )
    }
}

/// Failures while reading a CONNECT response header block.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("unexpected EOF before end of response headers")]
    UnexpectedEof,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed HTTP status line: {0:?}")]
    MalformedStatus(String),

    #[error("malformed HTTP header line: {0:?}")]
    MalformedHeader(String),

    #[error("response headers exceed {0} bytes")]
    HeadersTooLarge(usize),
}

/// Carries the proxy/target pair so every transport error names both.
#[derive(Debug, Clone)]
pub(crate) struct DialContext {
    pub proxy: String,
    pub target: String,
}

impl DialContext {
    pub fn new(proxy: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            proxy: proxy.into(),
            target: target.into(),
        }
    }

    pub fn unreachable(&self, source: io::Error) -> TunnelError {
        TunnelError::ProxyUnreachable {
            proxy: self.proxy.clone(),
            target: self.target.clone(),
            source,
        }
    }

    pub fn protocol(&self, reason: impl Into<String>) -> TunnelError {
        TunnelError::Protocol {
            proxy: self.proxy.clone(),
            target: self.target.clone(),
            reason: reason.into(),
        }
    }

    pub fn auth(&self, reason: impl Into<String>) -> TunnelError {
        TunnelError::Auth {
            proxy: self.proxy.clone(),
            target: self.target.clone(),
            reason: reason.into(),
        }
    }

    pub fn io(&self, source: io::Error) -> TunnelError {
        TunnelError::Io {
            proxy: self.proxy.clone(),
            target: self.target.clone(),
            source,
        }
    }

    pub fn timed_out(&self) -> TunnelError {
        self.unreachable(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("timed out establishing tunnel via {}", self.proxy),
        ))
    }
}

/// Connect-phase I/O errors that mean "the proxy is not there".
pub(crate) fn is_connect_failure(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::TimedOut
            | io::ErrorKind::HostUnreachable
            | io::ErrorKind::NetworkUnreachable
            | io::ErrorKind::AddrNotAvailable
    )
}

pub type Result<T> = std::result::Result<T, TunnelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_unreachable_is_recoverable() {
        let ctx = DialContext::new("http://proxy:8080", "example.com:22");
        assert!(ctx.unreachable(io::ErrorKind::ConnectionRefused.into()).is_recoverable());
        assert!(ctx.timed_out().is_recoverable());
        assert!(!ctx.protocol("HTTP/1.1 407 Proxy Authentication Required").is_recoverable());
        assert!(!ctx.auth("rejected").is_recoverable());
        assert!(!ctx.io(io::ErrorKind::UnexpectedEof.into()).is_recoverable());
        assert!(!TunnelError::Config("bad".into()).is_recoverable());
    }

    #[test]
    fn test_error_message_names_proxy_and_target() {
        let ctx = DialContext::new("http://proxy:8080", "example.com:22");
        let msg = ctx.protocol("HTTP/1.1 403 Forbidden").to_string();
        assert!(msg.contains("http://proxy:8080"));
        assert!(msg.contains("example.com:22"));
        assert!(msg.contains("403 Forbidden"));
    }
}
