//! Upgrade handshake for the persistent channel.
//!
//! Reads the client's HTTP upgrade request straight off the socket, checks the
//! `Sec-WebSocket-Key` nonce and answers with `101 Switching Protocols`.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ring::digest;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Fixed GUID appended to the client key before hashing
pub const ACCEPT_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

const MAX_REQUEST_HEAD: usize = 8 * 1024;
const KEY_NONCE_LEN: usize = 16;
const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Sent when the upgrade is refused; the connection is closed afterwards.
pub const BAD_REQUEST_RESPONSE: &[u8] =
    b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\nContent-Length: 0\r\n\r\n";

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("connection closed before the upgrade request completed")]
    Incomplete,

    #[error("upgrade request head exceeds 8 KiB")]
    TooLarge,

    #[error("malformed request line")]
    BadRequestLine,

    #[error("upgrade must use GET, got {0}")]
    Method(String),

    #[error("missing Sec-WebSocket-Key header")]
    MissingKey,

    #[error("Sec-WebSocket-Key is not a base64-encoded 16 byte nonce")]
    InvalidKey,

    #[error("I/O error during handshake: {0}")]
    Io(#[from] std::io::Error),
}

impl HandshakeError {
    /// Whether the peer is still there to receive a 400 response
    pub fn should_respond(&self) -> bool {
        !matches!(self, HandshakeError::Incomplete | HandshakeError::Io(_))
    }
}

/// A validated upgrade request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest {
    pub path: String,
    pub key: String,
    headers: Vec<(String, String)>,
}

impl UpgradeRequest {
    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(header, _)| header.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn accept_key(&self) -> String {
        accept_key(&self.key)
    }
}

/// `base64(sha1(key ++ GUID))`
pub fn accept_key(key: &str) -> String {
    let mut ctx = digest::Context::new(&digest::SHA1_FOR_LEGACY_USE_ONLY);
    ctx.update(key.as_bytes());
    ctx.update(ACCEPT_GUID.as_bytes());
    BASE64.encode(ctx.finish())
}

pub fn switching_protocols_response(accept: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept}\r\n\r\n"
    )
}

/// Parse and validate the request head (everything before the blank line).
pub fn parse_request(head: &str) -> Result<UpgradeRequest, HandshakeError> {
    let mut lines = head.split("\r\n");
    let request_line = lines.next().ok_or(HandshakeError::BadRequestLine)?;

    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(path), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(HandshakeError::BadRequestLine);
    };
    if !version.starts_with("HTTP/") {
        return Err(HandshakeError::BadRequestLine);
    }
    if method != "GET" {
        return Err(HandshakeError::Method(method.to_string()));
    }

    let headers: Vec<(String, String)> = lines
        .filter(|line| !line.is_empty())
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .collect();

    let key = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("sec-websocket-key"))
        .map(|(_, value)| value.clone())
        .ok_or(HandshakeError::MissingKey)?;
    match BASE64.decode(&key) {
        Ok(nonce) if nonce.len() == KEY_NONCE_LEN => {}
        _ => return Err(HandshakeError::InvalidKey),
    }

    Ok(UpgradeRequest {
        path: path.to_string(),
        key,
        headers,
    })
}

/// Read the upgrade request from `reader`.
///
/// Returns the request and any bytes the client sent after the head; those
/// already belong to the framed stream.
pub async fn read_request<R>(reader: &mut R) -> Result<(UpgradeRequest, Vec<u8>), HandshakeError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(HandshakeError::Incomplete);
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(end) = find_head_end(&buf) {
            if end > MAX_REQUEST_HEAD {
                return Err(HandshakeError::TooLarge);
            }
            let head = String::from_utf8_lossy(&buf[..end - HEAD_TERMINATOR.len()]).into_owned();
            let request = parse_request(&head)?;
            return Ok((request, buf.split_off(end)));
        }
        if buf.len() > MAX_REQUEST_HEAD {
            return Err(HandshakeError::TooLarge);
        }
    }
}

/// Offset just past the `\r\n\r\n` that ends the head.
fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEAD_TERMINATOR.len())
        .position(|window| window == HEAD_TERMINATOR)
        .map(|pos| pos + HEAD_TERMINATOR.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";

    fn request_with_key(key_line: &str) -> String {
        format!(
            "GET /colony HTTP/1.1\r\n\
             Host: localhost:3001\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             {key_line}\
             Sec-WebSocket-Version: 13\r\n\r\n"
        )
    }

    #[test]
    fn accept_key_matches_rfc_6455_example() {
        assert_eq!(accept_key(SAMPLE_KEY), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn parses_a_valid_upgrade_request() {
        let raw = request_with_key(&format!("sec-websocket-key: {SAMPLE_KEY}\r\n"));
        let head = raw.trim_end_matches("\r\n\r\n");
        let request = parse_request(head).unwrap();
        assert_eq!(request.path, "/colony");
        assert_eq!(request.key, SAMPLE_KEY);
        assert_eq!(request.header("upgrade"), Some("websocket"));
        assert_eq!(request.accept_key(), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn refuses_missing_key() {
        let raw = request_with_key("");
        assert!(matches!(
            parse_request(raw.trim_end()),
            Err(HandshakeError::MissingKey)
        ));
    }

    #[test]
    fn refuses_key_that_is_not_a_16_byte_nonce() {
        for bad in ["not base64!!", "c2hvcnQ=", ""] {
            let raw = request_with_key(&format!("Sec-WebSocket-Key: {bad}\r\n"));
            assert!(
                matches!(parse_request(raw.trim_end()), Err(HandshakeError::InvalidKey)),
                "key {bad:?} should be refused"
            );
        }
    }

    #[test]
    fn refuses_non_get_requests() {
        let raw = format!("POST / HTTP/1.1\r\nSec-WebSocket-Key: {SAMPLE_KEY}");
        assert!(matches!(
            parse_request(&raw),
            Err(HandshakeError::Method(method)) if method == "POST"
        ));
        assert!(matches!(
            parse_request("garbage"),
            Err(HandshakeError::BadRequestLine)
        ));
    }

    #[test]
    fn response_carries_accept_header() {
        let response = switching_protocols_response("abc=");
        assert!(response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(response.contains("\r\nSec-WebSocket-Accept: abc=\r\n"));
        assert!(response.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn read_request_returns_bytes_after_the_head() {
        let mut raw = request_with_key(&format!("Sec-WebSocket-Key: {SAMPLE_KEY}\r\n")).into_bytes();
        raw.extend_from_slice(&[0x81, 0x80, 1, 2, 3, 4]);
        let mut reader: &[u8] = &raw;

        let (request, leftover) = read_request(&mut reader).await.unwrap();
        assert_eq!(request.key, SAMPLE_KEY);
        assert_eq!(leftover, vec![0x81, 0x80, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn head_over_limit_is_refused_when_terminator_arrives_late() {
        let padding = format!("X-Padding: {}\r\n", "a".repeat(8300));
        let raw = request_with_key(&format!("{padding}Sec-WebSocket-Key: {SAMPLE_KEY}\r\n"));
        assert!(raw.len() > MAX_REQUEST_HEAD && raw.len() < MAX_REQUEST_HEAD + 1024);
        let mut reader: &[u8] = raw.as_bytes();

        let err = read_request(&mut reader).await.unwrap_err();
        assert!(matches!(err, HandshakeError::TooLarge));
    }

    #[tokio::test]
    async fn read_request_fails_on_early_eof() {
        let mut reader: &[u8] = b"GET / HTTP/1.1\r\nHost: x\r\n";
        let err = read_request(&mut reader).await.unwrap_err();
        assert!(matches!(err, HandshakeError::Incomplete));
        assert!(!err.should_respond());
    }
}
