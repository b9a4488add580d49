use anyhow::{Context, Result};
use async_trait::async_trait;

/// Platform-specific enable/disable of the OS-level proxy setting. The
/// contract is idempotent in both directions.
#[async_trait]
pub trait SystemProxyHook: Send + Sync {
    async fn enable(&self, port: u16) -> Result<()>;
    async fn disable(&self) -> Result<()>;
}

/// Used whenever no platform-specific hook is compiled in, or when the
/// caller opted out via configuration.
pub struct NoopSystemProxyHook;

#[async_trait]
impl SystemProxyHook for NoopSystemProxyHook {
    async fn enable(&self, _port: u16) -> Result<()> {
        Ok(())
    }

    async fn disable(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(target_os = "macos")]
pub struct MacosSystemProxyHook {
    pub network_service: String,
}

#[cfg(target_os = "macos")]
#[async_trait]
impl SystemProxyHook for MacosSystemProxyHook {
    async fn enable(&self, port: u16) -> Result<()> {
        let port = port.to_string();
        run_networksetup(&["-setwebproxy", &self.network_service, "127.0.0.1", &port]).await?;
        run_networksetup(&[
            "-setsecurewebproxy",
            &self.network_service,
            "127.0.0.1",
            &port,
        ])
        .await?;
        Ok(())
    }

    async fn disable(&self) -> Result<()> {
        run_networksetup(&["-setwebproxystate", &self.network_service, "off"]).await?;
        run_networksetup(&["-setsecurewebproxystate", &self.network_service, "off"]).await?;
        Ok(())
    }
}

#[cfg(target_os = "macos")]
async fn run_networksetup(args: &[&str]) -> Result<()> {
    let status = tokio::process::Command::new("networksetup")
        .args(args)
        .status()
        .await
        .context("spawning networksetup")?;
    if !status.success() {
        anyhow::bail!("networksetup exited with status {status}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_hook_always_succeeds() {
        let hook = NoopSystemProxyHook;
        hook.enable(8080).await.unwrap();
        hook.disable().await.unwrap();
    }
}
