//! CONNECT response header parsing.
//!
//! The proxy's reply is read one byte at a time so that nothing past the
//! blank line that ends the header block is consumed here. Whatever follows
//! already belongs to the tunneled stream.

use crate::error::ParseError;
use bytes::{BufMut, BytesMut};
use http::header::{HeaderName, HeaderValue};
use http::HeaderMap;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

pub const MAX_HEADER_SIZE: usize = 16 * 1024;

/// Progress towards the `\r\n\r\n` header terminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    None,
    Cr,
    CrLf,
    CrLfCr,
    CrLfCrLf,
}

impl ScanState {
    pub fn advance(self, byte: u8) -> ScanState {
        match byte {
            b'\r' => match self {
                ScanState::CrLf => ScanState::CrLfCr,
                _ => ScanState::Cr,
            },
            b'\n' => match self {
                ScanState::Cr => ScanState::CrLf,
                ScanState::CrLfCr => ScanState::CrLfCrLf,
                _ => ScanState::None,
            },
            _ => ScanState::None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectResponse {
    pub status: u16,
    pub status_line: String,
    pub headers: HeaderMap,
}

impl ConnectResponse {
    pub fn is_established(&self) -> bool {
        self.status == 200
    }
}

#[derive(Debug)]
pub struct ConnectResponseParser {
    state: ScanState,
    buf: BytesMut,
    max_header_size: usize,
}

impl Default for ConnectResponseParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectResponseParser {
    pub fn new() -> Self {
        Self::with_max_header_size(MAX_HEADER_SIZE)
    }

    pub fn with_max_header_size(max_header_size: usize) -> Self {
        Self {
            state: ScanState::None,
            buf: BytesMut::with_capacity(512),
            max_header_size,
        }
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    /// Accumulates one byte. Returns `Ok(true)` once the terminator is seen.
    pub fn feed(&mut self, byte: u8) -> Result<bool, ParseError> {
        if self.buf.len() >= self.max_header_size {
            return Err(ParseError::HeadersTooLarge(self.max_header_size));
        }
        self.buf.put_u8(byte);
        self.state = self.state.advance(byte);
        Ok(self.state == ScanState::CrLfCrLf)
    }

    /// Reads a full response header block from `reader`, stopping exactly at
    /// the blank line.
    pub async fn parse<R>(reader: &mut R) -> Result<ConnectResponse, ParseError>
    where
        R: AsyncRead + Unpin,
    {
        let mut parser = ConnectResponseParser::new();
        loop {
            let byte = match reader.read_u8().await {
                Ok(b) => b,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return Err(ParseError::UnexpectedEof);
                }
                Err(e) => return Err(ParseError::Io(e)),
            };
            if parser.feed(byte)? {
                return parser.finish();
            }
        }
    }

    pub fn finish(self) -> Result<ConnectResponse, ParseError> {
        if self.state != ScanState::CrLfCrLf {
            return Err(ParseError::UnexpectedEof);
        }
        let text = String::from_utf8_lossy(&self.buf);
        let mut lines = text
            .split('\n')
            .map(|l| l.strip_suffix('\r').unwrap_or(l));

        let status_line = lines.next().unwrap_or_default().to_string();
        let status = parse_status_line(&status_line)?;

        let mut headers = HeaderMap::new();
        let mut last: Option<(HeaderName, String)> = None;
        for line in lines {
            if line.is_empty() {
                continue;
            }
            if line.starts_with(' ') || line.starts_with('\t') {
                // obsolete line folding continues the previous value
                match last.as_mut() {
                    Some((_, value)) => {
                        value.push(' ');
                        value.push_str(line.trim());
                        continue;
                    }
                    None => return Err(ParseError::MalformedHeader(line.to_string())),
                }
            }
            if let Some((name, value)) = last.take() {
                append_header(&mut headers, name, &value)?;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| ParseError::MalformedHeader(line.to_string()))?;
            let name = HeaderName::from_bytes(name.trim().as_bytes())
                .map_err(|_| ParseError::MalformedHeader(line.to_string()))?;
            last = Some((name, value.trim().to_string()));
        }
        if let Some((name, value)) = last {
            append_header(&mut headers, name, &value)?;
        }

        Ok(ConnectResponse {
            status,
            status_line,
            headers,
        })
    }
}

fn append_header(headers: &mut HeaderMap, name: HeaderName, value: &str) -> Result<(), ParseError> {
    let value = HeaderValue::from_str(value)
        .map_err(|_| ParseError::MalformedHeader(format!("{}: {}", name, value)))?;
    headers.append(name, value);
    Ok(())
}

/// `HTTP/1.1 200 Connection established` -> 200
fn parse_status_line(line: &str) -> Result<u16, ParseError> {
    let malformed = || ParseError::MalformedStatus(line.to_string());
    let (proto, rest) = line.split_once(' ').ok_or_else(malformed)?;
    if !proto.starts_with("HTTP/") {
        return Err(malformed());
    }
    let rest = rest.trim_start_matches(' ');
    let code = rest.split_once(' ').map_or(rest, |(code, _)| code);
    if code.len() != 3 || !code.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed());
    }
    code.parse().map_err(|_| malformed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;

    /// Hands out one byte per read call.
    struct Trickle<'a>(&'a [u8]);

    impl AsyncRead for Trickle<'_> {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            let data = self.0;
            if let Some((first, rest)) = data.split_first() {
                buf.put_slice(&[*first]);
                self.0 = rest;
            }
            Poll::Ready(Ok(()))
        }
    }

    #[test]
    fn test_state_transitions() {
        let mut state = ScanState::None;
        for (byte, expected) in [
            (b'x', ScanState::None),
            (b'\r', ScanState::Cr),
            (b'\r', ScanState::Cr),
            (b'\n', ScanState::CrLf),
            (b'\n', ScanState::None),
            (b'\r', ScanState::Cr),
            (b'\n', ScanState::CrLf),
            (b'\r', ScanState::CrLfCr),
            (b'\n', ScanState::CrLfCrLf),
        ] {
            state = state.advance(byte);
            assert_eq!(state, expected);
        }
    }

    #[tokio::test]
    async fn test_parse_established() {
        let mut src = Trickle(b"HTTP/1.1 200 Connection established\r\n\r\n");
        let resp = ConnectResponseParser::parse(&mut src).await.unwrap();
        assert_eq!(resp.status, 200);
        assert!(resp.is_established());
        assert_eq!(resp.status_line, "HTTP/1.1 200 Connection established");
        assert!(resp.headers.is_empty());
    }

    #[tokio::test]
    async fn test_parse_does_not_consume_tunnel_bytes() {
        let mut src: &[u8] = b"HTTP/1.0 200 OK\r\nVia: squid\r\n\r\nSSH-2.0-OpenSSH_9.6\r\n";
        let resp = ConnectResponseParser::parse(&mut src).await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.headers.get("via").unwrap(), "squid");
        assert_eq!(src, b"SSH-2.0-OpenSSH_9.6\r\n");
    }

    #[tokio::test]
    async fn test_parse_rejection_keeps_headers() {
        let mut src = Trickle(b"HTTP/1.1 407 Unauthorized\r\nProxy-Authenticate: Basic\r\n\r\n");
        let resp = ConnectResponseParser::parse(&mut src).await.unwrap();
        assert_eq!(resp.status, 407);
        assert!(!resp.is_established());
        assert_eq!(resp.headers.get("proxy-authenticate").unwrap(), "Basic");
    }

    #[tokio::test]
    async fn test_repeated_headers_are_kept() {
        let mut src: &[u8] = b"HTTP/1.1 200 OK\r\nVia: a\r\nVia: b\r\n\r\n";
        let resp = ConnectResponseParser::parse(&mut src).await.unwrap();
        let vias: Vec<_> = resp.headers.get_all("via").iter().collect();
        assert_eq!(vias, ["a", "b"]);
    }

    #[tokio::test]
    async fn test_eof_before_terminator() {
        let mut src: &[u8] = b"HTTP/1.1 200 OK\r\n";
        let err = ConnectResponseParser::parse(&mut src).await.unwrap_err();
        assert!(matches!(err, ParseError::UnexpectedEof));
    }

    #[tokio::test]
    async fn test_malformed_status() {
        let cases: [&[u8]; 4] = [
            b"HTTP/1.1 20 OK\r\n\r\n",
            b"HTTP/1.1 abc OK\r\n\r\n",
            b"garbage\r\n\r\n",
            b"SSH-2.0 200 x\r\n\r\n",
        ];
        for raw in cases {
            let mut src = raw;
            let err = ConnectResponseParser::parse(&mut src).await.unwrap_err();
            assert!(matches!(err, ParseError::MalformedStatus(_)), "{:?}", raw);
        }
    }

    #[tokio::test]
    async fn test_status_without_reason() {
        let mut src: &[u8] = b"HTTP/1.1 200\r\n\r\n";
        let resp = ConnectResponseParser::parse(&mut src).await.unwrap();
        assert_eq!(resp.status, 200);
    }

    #[tokio::test]
    async fn test_malformed_header() {
        let mut src: &[u8] = b"HTTP/1.1 200 OK\r\nno colon here\r\n\r\n";
        let err = ConnectResponseParser::parse(&mut src).await.unwrap_err();
        assert!(matches!(err, ParseError::MalformedHeader(_)));
    }

    #[test]
    fn test_header_limit() {
        let mut parser = ConnectResponseParser::with_max_header_size(8);
        for b in b"HTTP/1.1" {
            assert!(!parser.feed(*b).unwrap());
        }
        assert!(matches!(parser.feed(b' '), Err(ParseError::HeadersTooLarge(8))));
    }
}
