use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use localproxy::sysproxy::{NoopSystemProxyHook, SystemProxyHook};
use localproxy::{Cli, Config, HostBlockFilter, Proxy, RcgenCertificateManager};
use log::info;

#[cfg(target_os = "macos")]
use localproxy::sysproxy::MacosSystemProxyHook;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::resolve(cli)?;

    localproxy::logger::init(&config.log_level, config.colored)?;
    info!("starting localproxy on {}", config.bind);

    let filter = Arc::new(HostBlockFilter::new(config.block_hosts.clone()));
    let certs = Arc::new(RcgenCertificateManager::new(
        config.ca_cert.clone(),
        config.ca_key.clone(),
    ));
    let sysproxy = build_sysproxy_hook(&config);

    let proxy = Proxy::new(
        config.bind,
        filter,
        certs,
        sysproxy,
        config.exclusion_list_urls.clone(),
    );

    let port = proxy.start().await?;
    info!("localproxy ready on 127.0.0.1:{port}");

    let ctrlc = localproxy::shutdown::install_ctrlc()?;
    let _ = ctrlc.await;
    info!("shutdown requested, waiting for in-flight requests...");

    proxy.stop(false).await?;
    info!("shutdown complete");
    Ok(())
}

fn build_sysproxy_hook(config: &Config) -> Arc<dyn SystemProxyHook> {
    if !config.system_proxy {
        return Arc::new(NoopSystemProxyHook);
    }

    #[cfg(target_os = "macos")]
    {
        Arc::new(MacosSystemProxyHook {
            network_service: "Wi-Fi".to_string(),
        })
    }
    #[cfg(not(target_os = "macos"))]
    {
        Arc::new(NoopSystemProxyHook)
    }
}
