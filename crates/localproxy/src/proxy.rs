use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex as AsyncMutex;

use crate::certmanager::CertificateManager;
use crate::connect::{self, ConnectContext};
use crate::error::ProxyError;
use crate::exclusion::{self, ExclusionSet};
use crate::filter::Filter;
use crate::plain::{self, PlainProxyContext};
use crate::request::{self, ReadRequestError};
use crate::shutdown::GracefulShutdown;
use crate::sysproxy::SystemProxyHook;

/// Graceful-shutdown budget for `Stop`: past this, in-flight non-hijacked
/// requests are dropped rather than waited on.
const SHUTDOWN_BUDGET: Duration = Duration::from_secs(5);

struct Collaborators {
    client: reqwest::Client,
    filter: Arc<dyn Filter>,
    certs: Arc<dyn CertificateManager>,
    exclusions: Arc<ExclusionSet>,
}

/// Everything a running server task needs, cheaply cloned per connection.
#[derive(Clone)]
struct ProxyCtx {
    collaborators: Arc<Collaborators>,
}

struct Running {
    port: u16,
    shutdown: GracefulShutdown,
    server: tokio::task::JoinHandle<()>,
}

/// Process-wide proxy instance (C8). Owns the listener, the exclusion
/// set, and handles to its collaborators (C9/C10). `start` must be
/// called exactly once before `stop`; `stop` is idempotent when the
/// proxy was never started.
pub struct Proxy {
    bind: SocketAddr,
    exclusion_list_urls: Vec<String>,
    collaborators: Arc<Collaborators>,
    sysproxy: Arc<dyn SystemProxyHook>,
    running: AsyncMutex<Option<Running>>,
}

impl Proxy {
    pub fn new(
        bind: SocketAddr,
        filter: Arc<dyn Filter>,
        certs: Arc<dyn CertificateManager>,
        sysproxy: Arc<dyn SystemProxyHook>,
        exclusion_list_urls: Vec<String>,
    ) -> Self {
        Self {
            bind,
            exclusion_list_urls,
            collaborators: Arc::new(Collaborators {
                client: reqwest::Client::builder()
                    .redirect(reqwest::redirect::Policy::none())
                    .build()
                    .expect("building the shared reqwest client"),
                filter,
                certs,
                exclusions: Arc::new(ExclusionSet::new()),
            }),
            sysproxy,
            running: AsyncMutex::new(None),
        }
    }

    /// Binds the listener, bootstraps the exclusion list, spawns the
    /// accept loop, and enables the system-wide proxy setting. Returns
    /// the effective (possibly OS-assigned) port.
    pub async fn start(&self) -> Result<u16, ProxyError> {
        self.collaborators
            .certs
            .init()
            .await
            .map_err(ProxyError::CertManagerInit)?;

        exclusion::bootstrap(
            &self.collaborators.client,
            &self.exclusion_list_urls,
            &self.collaborators.exclusions,
        )
        .await;

        let listener =
            TcpListener::bind(self.bind)
                .await
                .map_err(|source| ProxyError::Bind {
                    addr: self.bind,
                    source,
                })?;
        let port = listener.local_addr().map_err(|source| ProxyError::Bind {
            addr: self.bind,
            source,
        })?.port();
        info!("localproxy listening on 127.0.0.1:{port}");

        let shutdown = GracefulShutdown::new();
        let ctx = ProxyCtx {
            collaborators: self.collaborators.clone(),
        };
        let server_shutdown = shutdown.clone();
        let server = tokio::spawn(serve(listener, ctx, server_shutdown));

        self.sysproxy
            .enable(port)
            .await
            .map_err(ProxyError::SystemProxyEnable)?;

        *self.running.lock().await = Some(Running {
            port,
            shutdown,
            server,
        });
        Ok(port)
    }

    /// Returns the effective port if the proxy is running.
    pub async fn port(&self) -> Option<u16> {
        self.running.lock().await.as_ref().map(|r| r.port)
    }

    /// Requests a graceful shutdown with a 5-second budget, disables the
    /// system proxy, and optionally purges the certificate cache. A
    /// no-op (returning success) if the proxy was never started.
    pub async fn stop(&self, purge: bool) -> Result<(), ProxyError> {
        let running = self.running.lock().await.take();
        if let Some(running) = running {
            running.shutdown.initiate();
            match tokio::time::timeout(SHUTDOWN_BUDGET, running.server).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => warn!("proxy server task panicked during shutdown: {join_err}"),
                Err(_) => warn!(
                    "graceful shutdown exceeded its {:?} budget; dropping in-flight requests",
                    SHUTDOWN_BUDGET
                ),
            }
        }

        self.sysproxy
            .disable()
            .await
            .map_err(ProxyError::SystemProxyDisable)?;

        if purge {
            self.collaborators.certs.purge_cache().await;
        }

        Ok(())
    }
}

async fn serve(listener: TcpListener, ctx: ProxyCtx, shutdown: GracefulShutdown) {
    loop {
        let Some((stream, peer)) = accept_or_shutdown(&listener, &shutdown).await else {
            break;
        };
        let ctx = ctx.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            handle_connection(stream, peer, ctx, shutdown).await;
        });
    }
    shutdown.wait_inflight_zero().await;
}

async fn accept_or_shutdown(
    listener: &TcpListener,
    shutdown: &GracefulShutdown,
) -> Option<(TcpStream, SocketAddr)> {
    tokio::select! {
        accepted = listener.accept() => match accepted {
            Ok(pair) => Some(pair),
            Err(err) => {
                warn!("accept failed: {err}");
                None
            }
        },
        _ = shutdown.wait_shutting_down() => None,
    }
}

/// Dispatches by method per the control flow in the system overview:
/// CONNECT is handed to the MITM engine (C7) without an inflight guard
/// (hijacked sessions are not waited on during shutdown); everything
/// else goes through the plain-HTTP path (C6) guarded so `stop` can
/// drain it within its budget.
async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    ctx: ProxyCtx,
    shutdown: GracefulShutdown,
) {
    let req = match request::read_request(&mut stream).await {
        Ok(req) => req,
        Err(ReadRequestError::Eof) => return,
        Err(err) => {
            warn!("peer={peer} failed to read request: {err}");
            return;
        }
    };

    if req.method == http::Method::CONNECT {
        let connect_ctx = ConnectContext {
            client: &ctx.collaborators.client,
            filter: ctx.collaborators.filter.as_ref(),
            certs: ctx.collaborators.certs.as_ref(),
            exclusions: &ctx.collaborators.exclusions,
            client_addr: peer,
        };
        connect::handle(connect_ctx, req, stream).await;
        return;
    }

    let _guard = shutdown.inflight_guard();
    let plain_ctx = PlainProxyContext {
        client: &ctx.collaborators.client,
        filter: ctx.collaborators.filter.as_ref(),
        client_addr: peer,
    };
    plain::handle(plain_ctx, req, stream).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certmanager::RcgenCertificateManager;
    use crate::filter::HostBlockFilter;
    use crate::sysproxy::NoopSystemProxyHook;
    use std::net::IpAddr;
    use std::net::Ipv4Addr;

    fn proxy() -> Proxy {
        Proxy::new(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            Arc::new(HostBlockFilter::new(Vec::<String>::new())),
            Arc::new(RcgenCertificateManager::new(None, None)),
            Arc::new(NoopSystemProxyHook),
            Vec::new(),
        )
    }

    #[tokio::test]
    async fn stop_without_start_is_a_no_op() {
        let proxy = proxy();
        proxy.stop(false).await.expect("idempotent stop succeeds");
    }

    #[tokio::test]
    async fn start_binds_an_os_assigned_port_and_stop_tears_it_down() {
        let proxy = proxy();
        let port = proxy.start().await.expect("start succeeds");
        assert!(port > 0);
        assert_eq!(proxy.port().await, Some(port));

        proxy.stop(true).await.expect("stop succeeds");
        assert_eq!(proxy.port().await, None);
    }

    #[tokio::test]
    async fn stop_is_idempotent_after_already_stopped() {
        let proxy = proxy();
        proxy.start().await.expect("start succeeds");
        proxy.stop(false).await.expect("first stop succeeds");
        proxy.stop(false).await.expect("second stop succeeds");
    }
}
