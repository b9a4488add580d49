use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, Version};
use tokio::io::{AsyncRead, AsyncReadExt};

pub const MAX_HEADER_BYTES: usize = 64 * 1024;
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// A parsed HTTP/1.1 request read off either a plain socket or a
/// MITM'd TLS stream. The body is read fully up front (bounded by
/// [`MAX_BODY_BYTES`]); chunked request bodies are rejected as
/// unsupported, matching the inbound parser's capabilities.
pub struct ParsedRequest {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

pub struct SyntheticResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl SyntheticResponse {
    pub fn plain_text(status: StatusCode, text: impl Into<String>) -> Self {
        let body = text.into().into_bytes();
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        Self {
            status,
            headers,
            body,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReadRequestError {
    #[error("peer closed the connection")]
    Eof,
    #[error("request exceeded the maximum header size")]
    HeaderTooLarge,
    #[error("request body exceeded the maximum allowed size")]
    BodyTooLarge,
    #[error("chunked request bodies are not supported")]
    ChunkedBodyUnsupported,
    #[error("malformed request: {0}")]
    Malformed(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Reads one HTTP/1.1 request (request line, headers, and body) from an
/// async stream. Returns [`ReadRequestError::Eof`] when the peer closes
/// before sending any bytes, which callers treat as a clean session end
/// rather than a logged failure.
pub async fn read_request<S>(stream: &mut S) -> Result<ParsedRequest, ReadRequestError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(4096);
    let header_end = loop {
        let mut chunk = [0u8; 4096];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            if buf.is_empty() {
                return Err(ReadRequestError::Eof);
            }
            return Err(ReadRequestError::Malformed(
                "connection closed mid-request".into(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > MAX_HEADER_BYTES {
            return Err(ReadRequestError::HeaderTooLarge);
        }
        if let Some(pos) = find_subslice(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let mut header_storage = [httparse::EMPTY_HEADER; 64];
    let mut parsed = httparse::Request::new(&mut header_storage);
    let head = &buf[..header_end];
    match parsed
        .parse(head)
        .map_err(|e| ReadRequestError::Malformed(e.to_string()))?
    {
        httparse::Status::Complete(_) => {}
        httparse::Status::Partial => {
            return Err(ReadRequestError::Malformed("incomplete request head".into()));
        }
    }

    let method = parsed
        .method
        .ok_or_else(|| ReadRequestError::Malformed("missing method".into()))?;
    let method = Method::from_bytes(method.as_bytes())
        .map_err(|e| ReadRequestError::Malformed(e.to_string()))?;
    let path = parsed
        .path
        .ok_or_else(|| ReadRequestError::Malformed("missing path".into()))?;
    let uri: Uri = path
        .parse()
        .map_err(|_| ReadRequestError::Malformed(format!("invalid request target: {path}")))?;

    let mut headers = HeaderMap::new();
    for header in parsed.headers.iter() {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|e| ReadRequestError::Malformed(e.to_string()))?;
        let value = HeaderValue::from_bytes(header.value)
            .map_err(|e| ReadRequestError::Malformed(e.to_string()))?;
        headers.append(name, value);
    }

    let version = if parsed.version == Some(0) {
        Version::HTTP_10
    } else {
        Version::HTTP_11
    };

    if method == Method::CONNECT {
        return Ok(ParsedRequest {
            method,
            uri,
            version,
            headers,
            body: Vec::new(),
        });
    }

    let mut body = buf[header_end..].to_vec();

    if headers
        .get(http::header::TRANSFER_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("chunked"))
    {
        return Err(ReadRequestError::ChunkedBodyUnsupported);
    }

    if let Some(content_length) = parse_content_length(&headers) {
        if content_length > MAX_BODY_BYTES {
            return Err(ReadRequestError::BodyTooLarge);
        }
        while body.len() < content_length {
            let mut chunk = [0u8; 4096];
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(ReadRequestError::Malformed(
                    "connection closed before full body received".into(),
                ));
            }
            body.extend_from_slice(&chunk[..n]);
            if body.len() > MAX_BODY_BYTES {
                return Err(ReadRequestError::BodyTooLarge);
            }
        }
        body.truncate(content_length);
    } else {
        body.clear();
    }

    Ok(ParsedRequest {
        method,
        uri,
        version,
        headers,
        body,
    })
}

pub fn parse_content_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(http::header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

pub fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Per the connection-reuse heuristic (response-loop termination
/// invariant): true when the client has no way to tell where the
/// message ends, meaning the MITM loop must not attempt another
/// pipelined request after this response.
pub fn has_indeterminate_length(
    headers: &HeaderMap,
    version: Version,
    connection_close: bool,
    transparently_decompressed: bool,
) -> bool {
    let content_length_absent_or_zero = match parse_content_length(headers) {
        None => true,
        Some(0) => true,
        Some(_) => false,
    };
    let is_chunked = headers
        .get(http::header::TRANSFER_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("chunked"));
    let at_least_http11 = version >= Version::HTTP_11;

    content_length_absent_or_zero
        && !connection_close
        && at_least_http11
        && !transparently_decompressed
        && !is_chunked
}

/// Serializes a request line, headers, and body into raw HTTP/1.1 bytes,
/// used when forwarding a request to a dialed origin verbatim (the
/// WebSocket and opaque-tunnel handoff paths).
pub fn build_request_bytes(req: &ParsedRequest) -> Vec<u8> {
    let mut out = Vec::with_capacity(256 + req.body.len());
    out.extend_from_slice(format!("{} {} HTTP/1.1\r\n", req.method, req.uri).as_bytes());
    for (name, value) in req.headers.iter() {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(&req.body);
    out
}

/// Serializes a status line, headers, and body into raw HTTP/1.1 bytes
/// suitable for writing directly to a client socket.
pub fn build_response_bytes(status: StatusCode, headers: &HeaderMap, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(256 + body.len());
    out.extend_from_slice(
        format!(
            "HTTP/1.1 {} {}\r\n",
            status.as_u16(),
            status.canonical_reason().unwrap_or("")
        )
        .as_bytes(),
    );
    for (name, value) in headers.iter() {
        if *name == http::header::CONTENT_LENGTH || *name == http::header::TRANSFER_ENCODING {
            continue;
        }
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
    out.extend_from_slice(body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_subslice_locates_header_terminator() {
        let haystack = b"GET / HTTP/1.1\r\nHost: a\r\n\r\nbody";
        assert_eq!(find_subslice(haystack, b"\r\n\r\n"), Some(25));
    }

    #[test]
    fn indeterminate_length_true_when_no_content_length_and_keep_alive() {
        let headers = HeaderMap::new();
        assert!(has_indeterminate_length(
            &headers,
            Version::HTTP_11,
            false,
            false
        ));
    }

    #[test]
    fn determinate_length_when_content_length_present() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::CONTENT_LENGTH, HeaderValue::from_static("2"));
        assert!(!has_indeterminate_length(
            &headers,
            Version::HTTP_11,
            false,
            false
        ));
    }

    #[test]
    fn determinate_when_connection_close() {
        let headers = HeaderMap::new();
        assert!(!has_indeterminate_length(
            &headers,
            Version::HTTP_11,
            true,
            false
        ));
    }

    #[test]
    fn determinate_when_chunked() {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::TRANSFER_ENCODING,
            HeaderValue::from_static("chunked"),
        );
        assert!(!has_indeterminate_length(
            &headers,
            Version::HTTP_11,
            false,
            false
        ));
    }

    #[tokio::test]
    async fn read_request_parses_method_and_headers() {
        let raw = b"GET /a HTTP/1.1\r\nHost: example.test\r\nConnection: close\r\n\r\n".to_vec();
        let mut cursor = std::io::Cursor::new(raw);
        let req = read_request(&mut cursor).await.expect("parses");
        assert_eq!(req.method, Method::GET);
        assert_eq!(req.uri.path(), "/a");
        assert_eq!(req.headers.get("Host").unwrap(), "example.test");
    }

    #[tokio::test]
    async fn read_request_reads_body_by_content_length() {
        let raw = b"POST /a HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello".to_vec();
        let mut cursor = std::io::Cursor::new(raw);
        let req = read_request(&mut cursor).await.expect("parses");
        assert_eq!(req.body, b"hello");
    }

    #[tokio::test]
    async fn read_request_eof_on_empty_stream() {
        let raw: Vec<u8> = Vec::new();
        let mut cursor = std::io::Cursor::new(raw);
        let err = read_request(&mut cursor).await.unwrap_err();
        assert!(matches!(err, ReadRequestError::Eof));
    }
}
