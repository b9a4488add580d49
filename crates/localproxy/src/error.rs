use std::error::Error as StdError;
use std::io;

/// Errors surfaced across `Start`/`Stop` and the other operations callers
/// observe directly. Per-connection failures are logged and never reach
/// this type; see [`is_closeable`] and [`is_tls_failure`] for how those
/// are classified instead.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to initialize certificate manager: {0}")]
    CertManagerInit(#[source] anyhow::Error),

    #[error("failed to enable system proxy: {0}")]
    SystemProxyEnable(#[source] anyhow::Error),

    #[error("failed to disable system proxy: {0}")]
    SystemProxyDisable(#[source] anyhow::Error),
}

/// Returns true when `err` indicates an expected, silent termination of a
/// transport: a timeout, a clean EOF, or a closed/reset pipe. Anything
/// else is log-worthy.
pub fn is_closeable(err: &io::Error) -> bool {
    use io::ErrorKind::*;
    matches!(
        err.kind(),
        TimedOut | UnexpectedEof | BrokenPipe | ConnectionReset | ConnectionAborted
    )
}

/// Walks an error's `source()` chain looking for a structured TLS error
/// from the rustls stack, rather than substring-matching the message.
/// Covers both client-leg handshake failures (`tokio_rustls::TlsAcceptor`
/// wraps `rustls::Error` inside an `io::Error`) and origin-leg failures
/// surfaced through `reqwest::Error`.
pub fn is_tls_failure(err: &(dyn StdError + 'static)) -> bool {
    let mut cursor: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = cursor {
        if e.downcast_ref::<rustls::Error>().is_some() {
            return true;
        }
        cursor = e.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_closeable() {
        let err = io::Error::new(io::ErrorKind::TimedOut, "deadline exceeded");
        assert!(is_closeable(&err));
    }

    #[test]
    fn unexpected_eof_is_closeable() {
        let err = io::Error::new(io::ErrorKind::UnexpectedEof, "eof");
        assert!(is_closeable(&err));
    }

    #[test]
    fn other_io_error_is_not_closeable() {
        let err = io::Error::new(io::ErrorKind::PermissionDenied, "nope");
        assert!(!is_closeable(&err));
    }

    #[test]
    fn rustls_error_is_detected_through_io_error_wrapper() {
        let rustls_err = rustls::Error::General("bad certificate".into());
        let io_err = io::Error::new(io::ErrorKind::InvalidData, rustls_err);
        assert!(is_tls_failure(&io_err));
    }

    #[test]
    fn plain_io_error_is_not_a_tls_failure() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        assert!(!is_tls_failure(&io_err));
    }
}
