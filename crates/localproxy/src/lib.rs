//! Locally-running HTTP/HTTPS intercepting proxy: CONNECT handling,
//! MITM-vs-tunnel decision, TLS termination, and hop-header scrubbing.
//! See `proxy::Proxy` for the top-level `start`/`stop` lifecycle.

pub mod certmanager;
pub mod config;
pub mod connect;
pub mod error;
pub mod exclusion;
pub mod filter;
pub mod headers;
pub mod logger;
pub mod plain;
pub mod proxy;
pub mod request;
pub mod shutdown;
pub mod sysproxy;
pub mod tunnel;
pub mod websocket;

pub use certmanager::{CertificateManager, RcgenCertificateManager};
pub use config::{Cli, Config};
pub use error::ProxyError;
pub use filter::{Filter, HostBlockFilter};
pub use proxy::Proxy;
pub use sysproxy::SystemProxyHook;
