use std::net::SocketAddr;
use std::sync::Arc;

use http::{StatusCode, Uri};
use log::warn;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;

use crate::certmanager::CertificateManager;
use crate::error::is_tls_failure;
use crate::exclusion::ExclusionSet;
use crate::filter::{Filter, FilterContext};
use crate::headers;
use crate::request::{
    self, ParsedRequest, ReadRequestError, build_response_bytes, has_indeterminate_length,
};
use crate::tunnel;
use crate::websocket;

pub struct ConnectContext<'a> {
    pub client: &'a reqwest::Client,
    pub filter: &'a dyn Filter,
    pub certs: &'a dyn CertificateManager,
    pub exclusions: &'a ExclusionSet,
    pub client_addr: SocketAddr,
}

/// Handles one CONNECT request per the MITM engine's state machine:
/// pre-filter, tunnel-vs-MITM decision, and for MITM'd hosts a
/// per-connection loop of inner requests over the terminated TLS
/// session.
pub async fn handle<S>(ctx: ConnectContext<'_>, req: ParsedRequest, mut stream: S)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let filter_ctx = FilterContext {
        client_addr: ctx.client_addr,
        via_connect: true,
    };
    if let Some(resp) = ctx.filter.handle(&filter_ctx, &req).await {
        write_bytes(&mut stream, &build_response_bytes(resp.status, &resp.headers, &resp.body))
            .await;
        return;
    }

    let authority = req.uri.authority().map(|a| a.to_string()).unwrap_or_else(|| {
        req.headers
            .get(http::header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    });
    if authority.is_empty() {
        write_bytes(&mut stream, b"HTTP/1.1 400 Bad Request\r\n\r\n").await;
        return;
    }
    let host = authority.split(':').next().unwrap_or(&authority).to_string();

    let wants_tunnel = ctx.exclusions.contains(&host) || host.parse::<std::net::IpAddr>().is_ok();

    if wants_tunnel {
        tunnel_opaque(&authority, stream).await;
        return;
    }

    mitm(ctx, &authority, &host, stream).await;
}

async fn tunnel_opaque<S>(authority: &str, mut client: S)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let origin = match TcpStream::connect(authority).await {
        Ok(origin) => origin,
        Err(err) => {
            warn!("dialing tunnel target {authority} failed: {err}");
            write_bytes(&mut client, b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await;
            return;
        }
    };
    if write_bytes(&mut client, b"HTTP/1.1 200 OK\r\n\r\n").await.is_err() {
        return;
    }
    tunnel::splice(client, origin).await;
}

async fn mitm<S>(ctx: ConnectContext<'_>, authority: &str, host: &str, mut client: S)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let leaf = match ctx.certs.certificate_for(host).await {
        Ok(leaf) => leaf,
        Err(err) => {
            warn!("failed to mint certificate for {host}: {err}");
            write_bytes(&mut client, b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await;
            return;
        }
    };

    if write_bytes(&mut client, b"HTTP/1.1 200 OK\r\n\r\n").await.is_err() {
        return;
    }

    let acceptor = TlsAcceptor::from(leaf.server_config);
    let mut tls = match acceptor.accept(client).await {
        Ok(tls) => tls,
        Err(err) => {
            if is_tls_failure(&err) {
                ctx.exclusions.add(host.to_string());
            }
            warn!("TLS handshake with client for {host} failed: {err}");
            return;
        }
    };

    loop {
        let mut inner = match request::read_request(&mut tls).await {
            Ok(inner) => inner,
            Err(ReadRequestError::Eof) => return,
            Err(ReadRequestError::Io(err)) if is_tls_failure(&err) => {
                ctx.exclusions.add(host.to_string());
                return;
            }
            Err(err) => {
                warn!("failed to read inner request for {host}: {err}");
                return;
            }
        };

        patch_to_origin(&mut inner, authority);

        if websocket::is_websocket_upgrade(&inner.headers) {
            match dial_tls_origin(authority, host).await {
                Ok(origin) => websocket::proxy_upgrade(tls, origin).await,
                Err(err) => {
                    warn!("websocket origin dial failed for {host}: {err}");
                    let _ = write_bytes(
                        &mut tls,
                        &build_response_bytes(StatusCode::BAD_GATEWAY, &http::HeaderMap::new(), &[]),
                    )
                    .await;
                }
            }
            return;
        }

        let filter_ctx = FilterContext {
            client_addr: ctx.client_addr,
            via_connect: false,
        };
        if let Some(resp) = ctx.filter.handle(&filter_ctx, &inner).await {
            let _ = write_bytes(&mut tls, &build_response_bytes(resp.status, &resp.headers, &resp.body)).await;
            return;
        }

        headers::strip(&mut inner.headers);

        let url = format!("https://{authority}{}", inner.uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/"));
        let mut builder = ctx.client.request(inner.method.clone(), url);
        for (name, value) in inner.headers.iter() {
            if *name == http::header::HOST {
                continue;
            }
            builder = builder.header(name.clone(), value.clone());
        }
        if !inner.body.is_empty() {
            builder = builder.body(inner.body.clone());
        }

        let resp = match builder.send().await {
            Ok(resp) => resp,
            Err(err) => {
                if is_tls_failure(&err) {
                    ctx.exclusions.add(host.to_string());
                }
                warn!("round-trip to {host} failed: {err}");
                let _ = write_bytes(&mut tls, b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await;
                return;
            }
        };

        let status = resp.status();
        let version = resp.version();
        let connection_close = resp
            .headers()
            .get(http::header::CONNECTION)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("close")));
        let mut resp_headers = resp.headers().clone();
        headers::strip(&mut resp_headers);
        let indeterminate = has_indeterminate_length(&resp_headers, version, connection_close, false);

        let body = match resp.bytes().await {
            Ok(body) => body,
            Err(err) => {
                warn!("failed to read upstream response body for {host}: {err}");
                return;
            }
        };

        let bytes = build_response_bytes(status, &resp_headers, &body);
        if write_bytes(&mut tls, &bytes).await.is_err() {
            return;
        }

        if indeterminate {
            return;
        }
    }
}

fn patch_to_origin(req: &mut ParsedRequest, authority: &str) {
    let path = req.uri.path_and_query().map(|pq| pq.as_str().to_string()).unwrap_or_else(|| "/".to_string());
    let patched: Uri = format!("https://{authority}{path}")
        .parse()
        .unwrap_or_else(|_| req.uri.clone());
    req.uri = patched;
}

async fn dial_tls_origin(
    authority: &str,
    host: &str,
) -> anyhow::Result<tokio_rustls::client::TlsStream<TcpStream>> {
    use rustls::pki_types::ServerName;
    use std::sync::OnceLock;

    static ROOTS: OnceLock<Arc<rustls::RootCertStore>> = OnceLock::new();
    let roots = ROOTS.get_or_init(|| {
        let mut store = rustls::RootCertStore::empty();
        store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        Arc::new(store)
    });

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots.clone())
        .with_no_client_auth();
    let connector = tokio_rustls::TlsConnector::from(Arc::new(config));

    let tcp = TcpStream::connect(authority).await?;
    let server_name = ServerName::try_from(host.to_string())?;
    let tls = connector.connect(server_name, tcp).await?;
    Ok(tls)
}

async fn write_bytes<W>(writer: &mut W, bytes: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(bytes).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderMap, Method, Version};

    fn connect_req(authority: &str) -> ParsedRequest {
        ParsedRequest {
            method: Method::CONNECT,
            uri: authority.parse().unwrap(),
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: Vec::new(),
        }
    }

    #[test]
    fn patch_to_origin_rewrites_uri_to_https_authority() {
        let mut req = connect_req("example.test:443");
        req.uri = "/a/b?c=1".parse().unwrap();
        patch_to_origin(&mut req, "example.test:443");
        assert_eq!(req.uri.to_string(), "https://example.test:443/a/b?c=1");
    }

    #[test]
    fn ip_literal_authority_is_tunneled() {
        let exclusions = ExclusionSet::new();
        assert!("127.0.0.1".parse::<std::net::IpAddr>().is_ok());
        assert!(!exclusions.contains("127.0.0.1"));
    }

    #[test]
    fn excluded_host_is_tunneled() {
        let exclusions = ExclusionSet::new();
        exclusions.add("example.com");
        assert!(exclusions.contains("www.example.com"));
    }
}
