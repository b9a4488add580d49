use std::net::SocketAddr;

use async_trait::async_trait;

use crate::exclusion::ExclusionSet;
use crate::request::{ParsedRequest, SyntheticResponse};

pub struct FilterContext {
    pub client_addr: SocketAddr,
    /// True while filtering the outer CONNECT request itself (before any
    /// TLS termination); false for the plain-HTTP path and for inner
    /// requests inside the MITM loop.
    pub via_connect: bool,
}

/// `handle(ctx, request) -> Option<response>`: a response short-circuits
/// delivery to the origin, `None` forwards the request unchanged.
/// Implementations must be safe under concurrent callers and must not
/// consume the request body unless they return a response.
#[async_trait]
pub trait Filter: Send + Sync {
    async fn handle(&self, ctx: &FilterContext, req: &ParsedRequest) -> Option<SyntheticResponse>;
}

/// Reference filter: blocks requests whose host suffix-matches an entry
/// in a block list, using the same suffix-match discipline as the
/// exclusion set (C4). Everything else passes through untouched.
pub struct HostBlockFilter {
    blocked: ExclusionSet,
}

impl HostBlockFilter {
    pub fn new(blocked_hosts: impl IntoIterator<Item = String>) -> Self {
        let blocked = ExclusionSet::new();
        for host in blocked_hosts {
            blocked.add(host);
        }
        Self { blocked }
    }

    fn target_host(req: &ParsedRequest) -> Option<&str> {
        req.uri
            .host()
            .or_else(|| req.headers.get(http::header::HOST)?.to_str().ok())
    }
}

#[async_trait]
impl Filter for HostBlockFilter {
    async fn handle(&self, _ctx: &FilterContext, req: &ParsedRequest) -> Option<SyntheticResponse> {
        let host = Self::target_host(req)?;
        let host = host.split(':').next().unwrap_or(host);
        if self.blocked.contains(host) {
            Some(SyntheticResponse::plain_text(
                http::StatusCode::FORBIDDEN,
                "blocked by proxy filter",
            ))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderMap, Method, Version};

    fn req_for_host(host: &str) -> ParsedRequest {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::HOST, host.parse().unwrap());
        ParsedRequest {
            method: Method::GET,
            uri: "/".parse().unwrap(),
            version: Version::HTTP_11,
            headers,
            body: Vec::new(),
        }
    }

    #[tokio::test]
    async fn blocks_matching_host() {
        let filter = HostBlockFilter::new(["ads.test".to_string()]);
        let ctx = FilterContext {
            client_addr: "127.0.0.1:1".parse().unwrap(),
            via_connect: false,
        };
        let resp = filter.handle(&ctx, &req_for_host("ads.test")).await;
        assert!(resp.is_some());
        assert_eq!(resp.unwrap().status, http::StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn allows_unmatched_host() {
        let filter = HostBlockFilter::new(["ads.test".to_string()]);
        let ctx = FilterContext {
            client_addr: "127.0.0.1:1".parse().unwrap(),
            via_connect: false,
        };
        let resp = filter.handle(&ctx, &req_for_host("example.test")).await;
        assert!(resp.is_none());
    }
}
