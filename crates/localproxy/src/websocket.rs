use http::HeaderMap;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::tunnel;

/// True when the request's `Connection`/`Upgrade` headers ask for a
/// WebSocket upgrade.
pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let upgrade_requested = headers
        .get(http::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.split(',').any(|tok| tok.trim().eq_ignore_ascii_case("upgrade")));
    let is_websocket = headers
        .get(http::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    upgrade_requested && is_websocket
}

/// Hands a client connection off to the origin as an opaque byte splice.
/// This crate does not interpret WebSocket frames; it only fulfils the
/// handoff contract described in the design notes: the caller has
/// already scrubbed the request and dialed the origin (optionally over
/// TLS), and just needs the two ends wired together from here on.
pub async fn proxy_upgrade<C, O>(client: C, origin: O)
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    O: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    tunnel::splice(client, origin).await;
}
