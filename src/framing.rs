//! Wire framing shared by the native-messaging broker and the allow-listed
//! HTTP fetch path used by Tier-0 telemetry enrichment.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::policy::Policy;

/// Chrome's native-messaging host protocol caps a single message body at
/// this many bytes; a longer declared length is treated as a framing error.
pub const NATIVE_MESSAGE_MAX_BYTES: u32 = 8_000_000;

#[derive(Debug)]
pub enum FramingError {
    Io(std::io::Error),
    Eof,
    ZeroLength,
    TooLarge(u32),
    InvalidUtf8,
}

impl std::fmt::Display for FramingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::Eof => write!(f, "connection closed mid-frame"),
            Self::ZeroLength => write!(f, "zero-length frame"),
            Self::TooLarge(n) => write!(f, "frame of {n} bytes exceeds the native-messaging cap"),
            Self::InvalidUtf8 => write!(f, "frame body was not valid utf-8"),
        }
    }
}

impl std::error::Error for FramingError {}

impl From<std::io::Error> for FramingError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Read one native-messaging frame: a 4-byte little-endian length prefix
/// followed by that many bytes of UTF-8 JSON. A declared length of zero or
/// greater than [`NATIVE_MESSAGE_MAX_BYTES`] is a protocol violation and the
/// connection must be dropped rather than resynchronized.
pub async fn read_frame<R>(reader: &mut R) -> Result<String, FramingError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Err(FramingError::Eof),
        Err(e) => return Err(FramingError::Io(e)),
    }
    let len = u32::from_le_bytes(len_buf);
    if len == 0 {
        return Err(FramingError::ZeroLength);
    }
    if len > NATIVE_MESSAGE_MAX_BYTES {
        return Err(FramingError::TooLarge(len));
    }
    let mut body = vec![0u8; len as usize];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|_| FramingError::Eof)?;
    String::from_utf8(body).map_err(|_| FramingError::InvalidUtf8)
}

/// Write one native-messaging frame. Returns `FramingError::TooLarge` rather
/// than silently truncating when the caller hands us an oversized body.
pub async fn write_frame<W>(writer: &mut W, body: &str) -> Result<(), FramingError>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let bytes = body.as_bytes();
    let len = u32::try_from(bytes.len()).map_err(|_| FramingError::TooLarge(u32::MAX))?;
    if len == 0 {
        return Err(FramingError::ZeroLength);
    }
    if len > NATIVE_MESSAGE_MAX_BYTES {
        return Err(FramingError::TooLarge(len));
    }
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

#[derive(Debug)]
pub enum FetchError {
    PolicyDenied(String),
    InvalidUrl(String),
    Io(String),
    TooManyRedirects,
    BodyTooLarge,
    NonUtf8,
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PolicyDenied(host) => write!(f, "host '{host}' is not on the allow-list"),
            Self::InvalidUrl(s) => write!(f, "invalid url: {s}"),
            Self::Io(s) => write!(f, "io error: {s}"),
            Self::TooManyRedirects => write!(f, "exceeded redirect limit"),
            Self::BodyTooLarge => write!(f, "response body exceeded configured byte budget"),
            Self::NonUtf8 => write!(f, "response body was not valid utf-8"),
        }
    }
}

impl std::error::Error for FetchError {}

/// A small plain-HTTP/1.1 GET, revalidated against the policy's host
/// allow-list on every hop of a redirect chain (a redirect to a
/// non-allow-listed host is refused, not silently followed).
///
/// # Errors
///
/// Returns [`FetchError`] on policy denial, malformed URL, I/O failure,
/// oversized body, or a redirect chain exceeding `max_redirects`.
pub async fn fetch_allowlisted(
    policy: &Policy,
    url: &str,
    max_bytes: usize,
    connect_timeout: Duration,
    max_redirects: u8,
) -> Result<(u16, String), FetchError> {
    let mut current = url::Url::parse(url).map_err(|e| FetchError::InvalidUrl(e.to_string()))?;
    for _ in 0..=max_redirects {
        let host = current
            .host_str()
            .ok_or_else(|| FetchError::InvalidUrl("missing host".into()))?
            .to_string();
        if !policy.is_host_allowed(&host) {
            return Err(FetchError::PolicyDenied(host));
        }
        let port = current
            .port_or_known_default()
            .ok_or_else(|| FetchError::InvalidUrl("missing port".into()))?;
        let path = if current.query().is_some() {
            format!("{}?{}", current.path(), current.query().unwrap_or(""))
        } else {
            current.path().to_string()
        };

        let (status, headers, body) =
            raw_http_get(&host, port, &path, max_bytes, connect_timeout).await?;

        if matches!(status, 301 | 302 | 303 | 307 | 308) {
            if let Some(location) = headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case("location"))
                .map(|(_, v)| v.clone())
            {
                current = current
                    .join(&location)
                    .map_err(|e| FetchError::InvalidUrl(e.to_string()))?;
                continue;
            }
        }
        return Ok((status, body));
    }
    Err(FetchError::TooManyRedirects)
}

async fn raw_http_get(
    host: &str,
    port: u16,
    path: &str,
    max_bytes: usize,
    connect_timeout: Duration,
) -> Result<(u16, Vec<(String, String)>, String), FetchError> {
    let addr = format!("{host}:{port}");
    let mut stream = timeout(connect_timeout, TcpStream::connect(&addr))
        .await
        .map_err(|_| FetchError::Io(format!("connect to {addr} timed out")))?
        .map_err(|e| FetchError::Io(e.to_string()))?;

    let request =
        format!("GET {path} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n");
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| FetchError::Io(e.to_string()))?;

    let mut buf = Vec::with_capacity(4096);
    let mut tmp = [0u8; 4096];
    loop {
        let n = stream
            .read(&mut tmp)
            .await
            .map_err(|e| FetchError::Io(e.to_string()))?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&tmp[..n]);
        if buf.len() > max_bytes {
            return Err(FetchError::BodyTooLarge);
        }
    }

    let text = String::from_utf8(buf).map_err(|_| FetchError::NonUtf8)?;
    let header_end = text
        .find("\r\n\r\n")
        .ok_or_else(|| FetchError::Io("malformed response: no header terminator".into()))?;
    let header_block = &text[..header_end];
    let body = text[header_end + 4..].to_string();

    let mut lines = header_block.lines();
    let status_line = lines
        .next()
        .ok_or_else(|| FetchError::Io("empty response".into()))?;
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| FetchError::Io(format!("unparseable status line: {status_line}")))?;

    let headers = lines
        .filter_map(|l| l.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();

    Ok((status, headers, body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn round_trips_a_frame() {
        let mut buf = Vec::new();
        write_frame(&mut buf, r#"{"ok":true}"#).await.unwrap();
        let mut cursor = Cursor::new(buf);
        let out = read_frame(&mut cursor).await.unwrap();
        assert_eq!(out, r#"{"ok":true}"#);
    }

    #[tokio::test]
    async fn rejects_zero_length_frame() {
        let mut cursor = Cursor::new(0u32.to_le_bytes().to_vec());
        let err = read_frame(&mut cursor).await.unwrap_err();
        assert!(matches!(err, FramingError::ZeroLength));
    }

    #[tokio::test]
    async fn rejects_oversized_frame() {
        let mut bytes = (NATIVE_MESSAGE_MAX_BYTES + 1).to_le_bytes().to_vec();
        bytes.extend_from_slice(b"x");
        let mut cursor = Cursor::new(bytes);
        let err = read_frame(&mut cursor).await.unwrap_err();
        assert!(matches!(err, FramingError::TooLarge(_)));
    }

    #[tokio::test]
    async fn eof_mid_length_prefix_is_reported() {
        let mut cursor = Cursor::new(vec![0u8, 1]);
        let err = read_frame(&mut cursor).await.unwrap_err();
        assert!(matches!(err, FramingError::Eof));
    }

    #[test]
    fn fetch_denies_host_outside_allow_list() {
        use crate::policy::PolicyMode;
        let policy = Policy::new(PolicyMode::Strict, vec!["good.example".to_string()]);
        assert!(policy.is_host_allowed("good.example"));
        assert!(!policy.is_host_allowed("bad.example"));
    }
}
