use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::warn;
use moka::future::Cache;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    KeyUsagePurpose,
};
use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::sync::OnceCell;

/// A minted leaf certificate, already wrapped in a ready-to-use rustls
/// server config so callers don't repeat that assembly per connection.
#[derive(Clone)]
pub struct Leaf {
    pub server_config: Arc<ServerConfig>,
}

/// Produces leaf certificates for MITM'd hosts, owns the root CA, and
/// supports cache invalidation. Implementations must be safe under
/// concurrent callers.
#[async_trait]
pub trait CertificateManager: Send + Sync {
    async fn init(&self) -> Result<()>;
    async fn certificate_for(&self, host: &str) -> Result<Leaf>;
    async fn purge_cache(&self);
}

struct CaMaterial {
    cert: rcgen::Certificate,
    key: KeyPair,
}

/// Reference certificate manager: generates a root CA once per process
/// (optionally persisting its PEM for import into a client trust store)
/// and mints per-host leaves on demand into a bounded, time-limited
/// cache.
pub struct RcgenCertificateManager {
    ca_cert_path: Option<PathBuf>,
    ca_key_path: Option<PathBuf>,
    ca: OnceCell<CaMaterial>,
    cache: Cache<String, Leaf>,
}

impl RcgenCertificateManager {
    pub fn new(ca_cert_path: Option<PathBuf>, ca_key_path: Option<PathBuf>) -> Self {
        Self {
            ca_cert_path,
            ca_key_path,
            ca: OnceCell::new(),
            cache: Cache::builder()
                .max_capacity(4096)
                .time_to_live(Duration::from_secs(6 * 60 * 60))
                .build(),
        }
    }

    fn generate_ca() -> Result<CaMaterial> {
        let mut params =
            CertificateParams::new(Vec::<String>::new()).context("building CA cert params")?;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "localproxy root CA");
        params.distinguished_name = dn;

        let key = KeyPair::generate().context("generating CA keypair")?;
        let cert = params
            .self_signed(&key)
            .context("self-signing root CA certificate")?;

        Ok(CaMaterial { cert, key })
    }

    async fn persist_ca(material: &CaMaterial, cert_path: &PathBuf, key_path: &PathBuf) {
        if let Err(err) = tokio::fs::write(cert_path, material.cert.pem()).await {
            warn!("failed to persist CA certificate to {cert_path:?}: {err}");
        }
        if let Err(err) = tokio::fs::write(key_path, material.key.serialize_pem()).await {
            warn!("failed to persist CA private key to {key_path:?}: {err}");
        }
    }

    async fn ca_material(&self) -> Result<&CaMaterial> {
        self.ca
            .get_or_try_init(|| async {
                let material = Self::generate_ca()?;
                if let (Some(cert_path), Some(key_path)) =
                    (self.ca_cert_path.as_ref(), self.ca_key_path.as_ref())
                {
                    Self::persist_ca(&material, cert_path, key_path).await;
                }
                Ok(material)
            })
            .await
    }

    async fn mint_leaf(ca: &CaMaterial, host: &str) -> Result<Leaf> {
        let mut params = CertificateParams::new(vec![host.to_string()])
            .context("building leaf cert params")?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;

        let leaf_key = KeyPair::generate().context("generating leaf keypair")?;
        let leaf_cert = params
            .signed_by(&leaf_key, &ca.cert, &ca.key)
            .with_context(|| format!("signing leaf certificate for {host}"))?;

        let cert_der: CertificateDer<'static> = leaf_cert.der().clone();
        let key_der: PrivateKeyDer<'static> =
            PrivatePkcs8KeyDer::from(leaf_key.serialize_der()).into();

        let server_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der], key_der)
            .context("building rustls ServerConfig for minted leaf")?;

        Ok(Leaf {
            server_config: Arc::new(server_config),
        })
    }
}

#[async_trait]
impl CertificateManager for RcgenCertificateManager {
    async fn init(&self) -> Result<()> {
        self.ca_material().await?;
        Ok(())
    }

    async fn certificate_for(&self, host: &str) -> Result<Leaf> {
        let ca = self.ca_material().await?;
        let host = host.to_string();
        self.cache
            .try_get_with(host.clone(), Self::mint_leaf(ca, &host))
            .await
            .map_err(|err| anyhow::anyhow!("{err}"))
    }

    async fn purge_cache(&self) {
        self.cache.invalidate_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mints_and_caches_leaf_for_host() {
        let manager = RcgenCertificateManager::new(None, None);
        manager.init().await.expect("init succeeds");

        let first = manager
            .certificate_for("example.test")
            .await
            .expect("mint succeeds");
        let second = manager
            .certificate_for("example.test")
            .await
            .expect("cached fetch succeeds");

        assert!(Arc::ptr_eq(&first.server_config, &second.server_config));
    }

    #[tokio::test]
    async fn purge_cache_forces_a_fresh_mint() {
        let manager = RcgenCertificateManager::new(None, None);
        manager.init().await.expect("init succeeds");

        let first = manager
            .certificate_for("example.test")
            .await
            .expect("mint succeeds");
        manager.purge_cache().await;
        let second = manager
            .certificate_for("example.test")
            .await
            .expect("mint succeeds again");

        assert!(!Arc::ptr_eq(&first.server_config, &second.server_config));
    }
}
