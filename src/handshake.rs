//! HTTP/1.1 upgrade wire format
//!
//! Parsing and building of the handful of HTTP messages the transport
//! exchanges before framing starts:
//! - the client's upgrade request and the server's 101 answer
//! - the 405 answer to non-GET requests
//! - the empty 200 answer to GET probes that do not ask for an upgrade
//!
//! The async drivers live in [`crate::negotiate`].

use base64::Engine;
use bytes::{BufMut, Bytes, BytesMut};
use sha1::{Digest, Sha1};

use crate::WS_GUID;
use crate::error::{Error, Result};

/// Maximum number of headers parsed per message
const MAX_HEADERS: usize = 32;

/// Parsed head of an inbound HTTP request (server-side)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    /// Request method
    pub method: String,
    /// Request target
    pub path: String,
    /// The Host header
    pub host: Option<String>,
    /// The Sec-WebSocket-Key header
    pub key: Option<String>,
    /// The Sec-WebSocket-Version header
    pub version: Option<String>,
    /// `Upgrade` lists `websocket`
    pub upgrade_websocket: bool,
    /// `Connection` lists `upgrade`
    pub connection_upgrade: bool,
}

impl RequestHead {
    /// Whether this is a complete WebSocket opening handshake
    pub fn is_websocket_upgrade(&self) -> bool {
        self.method == "GET"
            && self.upgrade_websocket
            && self.connection_upgrade
            && self.key.is_some()
            && self.version.as_deref() == Some("13")
    }
}

/// Parsed head of an HTTP response (client-side)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    /// HTTP status code
    pub status: u16,
    /// The Sec-WebSocket-Accept header
    pub accept: Option<String>,
    /// The Content-Length header
    pub content_length: Option<usize>,
}

#[inline]
fn header_value(value: &[u8]) -> Result<&str> {
    std::str::from_utf8(value)
        .map(str::trim)
        .map_err(|_| Error::InvalidHttp("invalid header value"))
}

#[inline]
fn lists_token(value: &str, token: &str) -> bool {
    value
        .split(',')
        .any(|item| item.trim().eq_ignore_ascii_case(token))
}

/// Parse an HTTP request head
///
/// Returns the parsed head and the number of bytes consumed, or `None` when
/// the head is not complete yet. The method is not checked here.
pub fn parse_request(buf: &[u8]) -> Result<Option<(RequestHead, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    let len = match req.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(_) => return Err(Error::InvalidHttp("failed to parse HTTP request")),
    };

    let mut head = RequestHead {
        method: req.method.unwrap_or_default().to_string(),
        path: req.path.unwrap_or("/").to_string(),
        host: None,
        key: None,
        version: None,
        upgrade_websocket: false,
        connection_upgrade: false,
    };

    for header in req.headers.iter() {
        let value = header_value(header.value)?;
        match header.name.to_ascii_lowercase().as_str() {
            "host" => head.host = Some(value.to_string()),
            "sec-websocket-key" => head.key = Some(value.to_string()),
            "sec-websocket-version" => head.version = Some(value.to_string()),
            "upgrade" => head.upgrade_websocket |= lists_token(value, "websocket"),
            "connection" => head.connection_upgrade |= lists_token(value, "upgrade"),
            _ => {}
        }
    }

    Ok(Some((head, len)))
}

/// Parse an HTTP response head
///
/// Any status is accepted; the caller decides what a non-101 means.
pub fn parse_response(buf: &[u8]) -> Result<Option<(ResponseHead, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut res = httparse::Response::new(&mut headers);

    let len = match res.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(_) => return Err(Error::InvalidHttp("failed to parse HTTP response")),
    };

    let mut head = ResponseHead {
        status: res.code.unwrap_or(0),
        accept: None,
        content_length: None,
    };

    for header in res.headers.iter() {
        let value = header_value(header.value)?;
        match header.name.to_ascii_lowercase().as_str() {
            "sec-websocket-accept" => head.accept = Some(value.to_string()),
            "content-length" => {
                let len = value
                    .parse()
                    .map_err(|_| Error::InvalidHttp("invalid Content-Length"))?;
                head.content_length = Some(len);
            }
            _ => {}
        }
    }

    Ok(Some((head, len)))
}

/// Generate the Sec-WebSocket-Accept key
///
/// This computes: Base64(SHA-1(key + GUID))
#[inline]
pub fn generate_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    let hash = hasher.finalize();
    base64::engine::general_purpose::STANDARD.encode(hash)
}

/// Validate the server's accept key (client-side)
pub fn validate_accept_key(sent_key: &str, received_accept: &str) -> bool {
    generate_accept_key(sent_key) == received_accept
}

/// Generate a random Sec-WebSocket-Key: 16 random bytes, base64 encoded (24 chars)
pub fn generate_key() -> String {
    let mut nonce = [0u8; 16];
    getrandom::getrandom(&mut nonce).expect("getrandom failed");
    base64::engine::general_purpose::STANDARD.encode(nonce)
}

#[inline]
fn put_header(buf: &mut BytesMut, name: &str, value: &str) {
    buf.put_slice(name.as_bytes());
    buf.put_slice(b": ");
    buf.put_slice(value.as_bytes());
    buf.put_slice(b"\r\n");
}

#[inline]
fn put_server_name(buf: &mut BytesMut, server_name: Option<&str>) {
    if let Some(name) = server_name {
        put_header(buf, "Server", name);
    }
}

/// Build the client's upgrade request
///
/// A bodiless GET carrying `Content-Type: text/plain; charset=utf-8` and
/// `Content-Length: 0` next to the upgrade headers.
pub fn build_request(host: &str, path: &str, key: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(256);

    buf.put_slice(b"GET ");
    buf.put_slice(path.as_bytes());
    buf.put_slice(b" HTTP/1.1\r\n");
    put_header(&mut buf, "Host", host);
    put_header(&mut buf, "Content-Type", "text/plain; charset=utf-8");
    put_header(&mut buf, "Content-Length", "0");
    put_header(&mut buf, "Upgrade", "websocket");
    put_header(&mut buf, "Connection", "Upgrade");
    put_header(&mut buf, "Sec-WebSocket-Key", key);
    put_header(&mut buf, "Sec-WebSocket-Version", "13");
    buf.put_slice(b"\r\n");

    buf.freeze()
}

/// Build the server's 101 Switching Protocols response
pub fn build_response(accept_key: &str, server_name: Option<&str>) -> Bytes {
    let mut buf = BytesMut::with_capacity(192);

    buf.put_slice(b"HTTP/1.1 101 Switching Protocols\r\n");
    put_header(&mut buf, "Upgrade", "websocket");
    put_header(&mut buf, "Connection", "Upgrade");
    put_header(&mut buf, "Sec-WebSocket-Accept", accept_key);
    put_server_name(&mut buf, server_name);
    buf.put_slice(b"\r\n");

    buf.freeze()
}

/// Build the 405 answer to a non-GET request
pub fn build_method_not_allowed(server_name: Option<&str>) -> Bytes {
    let mut buf = BytesMut::with_capacity(128);

    buf.put_slice(b"HTTP/1.1 405 Method Not Allowed\r\n");
    put_header(&mut buf, "Connection", "close");
    put_header(&mut buf, "Content-Length", "0");
    put_server_name(&mut buf, server_name);
    buf.put_slice(b"\r\n");

    buf.freeze()
}

/// Build the empty 200 answer to a GET that does not request an upgrade
pub fn build_probe_response(server_name: Option<&str>) -> Bytes {
    let mut buf = BytesMut::with_capacity(128);

    buf.put_slice(b"HTTP/1.1 200 OK\r\n");
    put_header(&mut buf, "Content-Type", "text/html");
    put_header(&mut buf, "Content-Length", "0");
    put_header(&mut buf, "Connection", "close");
    put_server_name(&mut buf, server_name);
    buf.put_slice(b"\r\n");

    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_accept_key() {
        // Test vector from RFC 6455
        let key = "dGhlIHNhbXBsZSBub25jZQ==";
        let accept = generate_accept_key(key);
        assert_eq!(accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn test_validate_accept_key() {
        let key = "dGhlIHNhbXBsZSBub25jZQ==";
        assert!(validate_accept_key(key, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
        assert!(!validate_accept_key(key, "invalid"));
    }

    #[test]
    fn test_generate_key_shape() {
        let key = generate_key();
        assert_eq!(key.len(), 24);
        assert!(key.ends_with("=="));
        assert_ne!(key, generate_key());
    }

    #[test]
    fn test_parse_upgrade_request() {
        let request = b"GET /chat HTTP/1.1\r\n\
            Host: server.example.com\r\n\
            Upgrade: websocket\r\n\
            Connection: keep-alive, Upgrade\r\n\
            Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
            Sec-WebSocket-Version: 13\r\n\
            \r\n";

        let (head, len) = parse_request(request).unwrap().unwrap();
        assert_eq!(head.method, "GET");
        assert_eq!(head.path, "/chat");
        assert_eq!(head.host.as_deref(), Some("server.example.com"));
        assert_eq!(head.key.as_deref(), Some("dGhlIHNhbXBsZSBub25jZQ=="));
        assert!(head.is_websocket_upgrade());
        assert_eq!(len, request.len());
    }

    #[test]
    fn test_parse_request_partial() {
        let request = b"GET /chat HTTP/1.1\r\nHost: server.example.com\r\n";
        assert!(parse_request(request).unwrap().is_none());
    }

    #[test]
    fn test_plain_get_is_not_upgrade() {
        let request = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let (head, _) = parse_request(request).unwrap().unwrap();
        assert!(!head.is_websocket_upgrade());
    }

    #[test]
    fn test_post_is_parsed_not_rejected() {
        let request = b"POST / HTTP/1.1\r\nContent-Length: 0\r\n\r\n";
        let (head, _) = parse_request(request).unwrap().unwrap();
        assert_eq!(head.method, "POST");
        assert!(!head.is_websocket_upgrade());
    }

    #[test]
    fn test_request_round_trip() {
        let key = generate_key();
        let request = build_request("127.0.0.1:10001", "/", &key);

        let text = std::str::from_utf8(&request).unwrap();
        assert!(text.starts_with("GET / HTTP/1.1\r\n"));
        assert!(text.contains("Content-Type: text/plain; charset=utf-8\r\n"));
        assert!(text.contains("Content-Length: 0\r\n"));

        let (head, len) = parse_request(&request).unwrap().unwrap();
        assert_eq!(len, request.len());
        assert_eq!(head.host.as_deref(), Some("127.0.0.1:10001"));
        assert_eq!(head.key.as_deref(), Some(key.as_str()));
        assert!(head.is_websocket_upgrade());
    }

    #[test]
    fn test_build_response() {
        let response = build_response("s3pPLMBiTxaQ9kYGzzhZRbK+xOo=", Some("node-1"));

        let (head, len) = parse_response(&response).unwrap().unwrap();
        assert_eq!(len, response.len());
        assert_eq!(head.status, 101);
        assert_eq!(head.accept.as_deref(), Some("s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));

        let text = std::str::from_utf8(&response).unwrap();
        assert!(text.contains("Server: node-1\r\n"));
    }

    #[test]
    fn test_method_not_allowed_response() {
        let response = build_method_not_allowed(None);
        let text = std::str::from_utf8(&response).unwrap();
        assert!(text.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(!text.contains("Server:"));

        let (head, _) = parse_response(&response).unwrap().unwrap();
        assert_eq!(head.content_length, Some(0));
    }

    #[test]
    fn test_probe_response() {
        let response = build_probe_response(Some("node-1"));
        let text = std::str::from_utf8(&response).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Type: text/html\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_parse_rejection_response() {
        let response = b"HTTP/1.1 404 Not Found\r\nContent-Length: 9\r\n\r\nnot found";
        let (head, len) = parse_response(response).unwrap().unwrap();
        assert_eq!(head.status, 404);
        assert_eq!(head.content_length, Some(9));
        assert_eq!(&response[len..], b"not found");
    }
}
