use http::{HeaderMap, HeaderName, HeaderValue, header::CONNECTION};

/// Hop-by-hop headers per RFC 7230 section 6.1. `Keep-Alive` and the two
/// `Proxy-Authenticate`/`Proxy-Authorization` entries are listed alongside
/// `Connection` even though most of them never reach a loopback proxy in
/// practice.
pub const HOP_BY_HOP_HEADERS: [&str; 9] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub fn is_hop_by_hop_header(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

/// Removes every hop-by-hop header and every header named as a token
/// inside a `Connection` value. Multiple `Connection` headers are each
/// parsed; blank tokens are ignored.
pub fn strip(headers: &mut HeaderMap) {
    let mut named_by_connection: Vec<HeaderName> = Vec::new();
    for value in headers.get_all(CONNECTION) {
        if let Ok(value) = value.to_str() {
            for token in value.split(',') {
                let token = token.trim();
                if token.is_empty() {
                    continue;
                }
                if let Ok(name) = HeaderName::from_bytes(token.as_bytes()) {
                    named_by_connection.push(name);
                }
            }
        }
    }

    let hop_by_hop: Vec<HeaderName> = headers
        .keys()
        .filter(|name| is_hop_by_hop_header(name.as_str()))
        .cloned()
        .collect();

    for name in named_by_connection.into_iter().chain(hop_by_hop) {
        headers.remove(&name);
    }
}

#[allow(dead_code)]
pub fn connection_header_value(tokens: &[&str]) -> HeaderValue {
    HeaderValue::from_str(&tokens.join(", ")).expect("tokens form a valid header value")
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn strips_static_hop_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("Connection", HeaderValue::from_static("close"));
        headers.insert("Transfer-Encoding", HeaderValue::from_static("chunked"));
        headers.insert("Upgrade", HeaderValue::from_static("websocket"));
        headers.insert("X-Custom", HeaderValue::from_static("v"));

        strip(&mut headers);

        assert!(headers.get("Connection").is_none());
        assert!(headers.get("Transfer-Encoding").is_none());
        assert!(headers.get("Upgrade").is_none());
        assert_eq!(headers.get("X-Custom").unwrap(), "v");
    }

    #[test]
    fn strips_headers_named_in_connection_value() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "Connection",
            HeaderValue::from_static("close, X-Custom"),
        );
        headers.insert("X-Custom", HeaderValue::from_static("v"));
        headers.insert("X-Other", HeaderValue::from_static("w"));

        strip(&mut headers);

        assert!(headers.get("X-Custom").is_none());
        assert_eq!(headers.get("X-Other").unwrap(), "w");
    }

    #[test]
    fn ignores_blank_tokens_and_handles_multiple_connection_headers() {
        let mut headers = HeaderMap::new();
        headers.append("Connection", HeaderValue::from_static("close, , X-A"));
        headers.append("Connection", HeaderValue::from_static("X-B"));
        headers.insert("X-A", HeaderValue::from_static("a"));
        headers.insert("X-B", HeaderValue::from_static("b"));
        headers.insert("X-C", HeaderValue::from_static("c"));

        strip(&mut headers);

        assert!(headers.get("X-A").is_none());
        assert!(headers.get("X-B").is_none());
        assert_eq!(headers.get("X-C").unwrap(), "c");
    }

    #[test]
    fn proxy_auth_headers_are_hop_by_hop() {
        assert!(is_hop_by_hop_header("Proxy-Authenticate"));
        assert!(is_hop_by_hop_header("proxy-authorization"));
        assert!(is_hop_by_hop_header("Keep-Alive"));
    }
}
