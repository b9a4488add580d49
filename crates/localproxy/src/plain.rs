use std::net::SocketAddr;

use futures::StreamExt;
use http::StatusCode;
use log::{error, warn};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::filter::{Filter, FilterContext};
use crate::headers;
use crate::request::{ParsedRequest, SyntheticResponse, build_request_bytes, build_response_bytes};
use crate::websocket;

pub struct PlainProxyContext<'a> {
    pub client: &'a reqwest::Client,
    pub filter: &'a dyn Filter,
    pub client_addr: SocketAddr,
}

/// Forwards a non-CONNECT request per the plain-HTTP proxy path: filter,
/// WebSocket handoff, header scrubbing, outbound round-trip with
/// redirects left to the client, and a streamed response.
pub async fn handle<S>(ctx: PlainProxyContext<'_>, mut req: ParsedRequest, mut stream: S)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let filter_ctx = FilterContext {
        client_addr: ctx.client_addr,
        via_connect: false,
    };
    if let Some(resp) = ctx.filter.handle(&filter_ctx, &req).await {
        write_synthetic(&mut stream, &resp).await;
        return;
    }

    if websocket::is_websocket_upgrade(&req.headers) {
        match dial_for_websocket(&req).await {
            Ok(origin) => websocket::proxy_upgrade(stream, origin).await,
            Err(err) => {
                warn!("websocket origin dial failed: {err}");
                write_synthetic(
                    &mut stream,
                    &SyntheticResponse::plain_text(StatusCode::BAD_GATEWAY, err),
                )
                .await;
            }
        }
        return;
    }

    headers::strip(&mut req.headers);

    let url = match build_target_url(&req) {
        Ok(url) => url,
        Err(err) => {
            write_synthetic(
                &mut stream,
                &SyntheticResponse::plain_text(StatusCode::BAD_REQUEST, err),
            )
            .await;
            return;
        }
    };

    let mut builder = ctx.client.request(req.method.clone(), url);
    for (name, value) in req.headers.iter() {
        if *name == http::header::HOST {
            continue;
        }
        builder = builder.header(name.clone(), value.clone());
    }
    if !req.body.is_empty() {
        builder = builder.body(req.body.clone());
    }

    let resp = match builder.send().await {
        Ok(resp) => resp,
        Err(err) => {
            error!("outbound request failed: {err}");
            write_synthetic(
                &mut stream,
                &SyntheticResponse::plain_text(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
            )
            .await;
            return;
        }
    };

    stream_response(resp, &mut stream).await;
}

/// Clears any absolute-form request-URI and resolves the target URL:
/// absolute-form paths are used directly, origin-form paths are
/// combined with the `Host` header.
fn build_target_url(req: &ParsedRequest) -> Result<String, String> {
    if req.uri.scheme().is_some() {
        return Ok(req.uri.to_string());
    }
    let host = req
        .headers
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| "missing Host header".to_string())?;
    let path = req.uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    Ok(format!("http://{host}{path}"))
}

fn target_authority(req: &ParsedRequest) -> Result<String, String> {
    if let Some(host) = req.uri.host() {
        let port = req.uri.port_u16().unwrap_or(80);
        return Ok(format!("{host}:{port}"));
    }
    let host_header = req
        .headers
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| "missing Host header".to_string())?;
    if host_header.contains(':') {
        Ok(host_header.to_string())
    } else {
        Ok(format!("{host_header}:80"))
    }
}

async fn dial_for_websocket(req: &ParsedRequest) -> Result<TcpStream, String> {
    let authority = target_authority(req)?;
    let mut stream = TcpStream::connect(&authority)
        .await
        .map_err(|err| format!("dialing {authority}: {err}"))?;
    stream
        .write_all(&build_request_bytes(req))
        .await
        .map_err(|err| format!("forwarding request to {authority}: {err}"))?;
    Ok(stream)
}

async fn stream_response<W>(resp: reqwest::Response, writer: &mut W)
where
    W: AsyncWrite + Unpin,
{
    let status = resp.status();
    let mut headers = resp.headers().clone();
    headers::strip(&mut headers);

    let mut head = format!(
        "HTTP/1.1 {} {}\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    )
    .into_bytes();
    for (name, value) in headers.iter() {
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");
    if writer.write_all(&head).await.is_err() {
        return;
    }

    let mut body = resp.bytes_stream();
    while let Some(chunk) = body.next().await {
        match chunk {
            Ok(bytes) => {
                if writer.write_all(&bytes).await.is_err() {
                    return;
                }
            }
            Err(err) => {
                warn!("error reading upstream response body: {err}");
                return;
            }
        }
    }
}

async fn write_synthetic<W>(writer: &mut W, resp: &SyntheticResponse)
where
    W: AsyncWrite + Unpin,
{
    let bytes = build_response_bytes(resp.status, &resp.headers, &resp.body);
    let _ = writer.write_all(&bytes).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderMap, Method, Version};

    fn req(uri: &str, host: Option<&str>) -> ParsedRequest {
        let mut headers = HeaderMap::new();
        if let Some(host) = host {
            headers.insert(http::header::HOST, host.parse().unwrap());
        }
        ParsedRequest {
            method: Method::GET,
            uri: uri.parse().unwrap(),
            version: Version::HTTP_11,
            headers,
            body: Vec::new(),
        }
    }

    #[test]
    fn builds_url_from_absolute_form() {
        let r = req("http://example.test/a?b=1", None);
        assert_eq!(build_target_url(&r).unwrap(), "http://example.test/a?b=1");
    }

    #[test]
    fn builds_url_from_origin_form_and_host_header() {
        let r = req("/a?b=1", Some("example.test"));
        assert_eq!(build_target_url(&r).unwrap(), "http://example.test/a?b=1");
    }

    #[test]
    fn origin_form_without_host_header_errors() {
        let r = req("/a", None);
        assert!(build_target_url(&r).is_err());
    }
}
