use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinError;

use crate::error::is_closeable;

/// Splices two byte streams until either direction terminates. As soon
/// as one direction's copy loop ends, the other stream's write-half is
/// shut down so its peer observes EOF and the remaining direction can
/// drain and finish on its own; this function returns once both
/// directions have completed. Errors classified closeable (timeouts,
/// clean EOF, reset/closed pipes) are discarded silently; anything else
/// is logged. No framing or inspection of the carried bytes is done.
pub async fn splice<A, B>(a: A, b: B)
where
    A: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    B: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let a_to_b = tokio::spawn(async move {
        let result = tokio::io::copy(&mut a_read, &mut b_write).await;
        let _ = b_write.shutdown().await;
        result
    });

    let b_to_a = tokio::spawn(async move {
        let result = tokio::io::copy(&mut b_read, &mut a_write).await;
        let _ = a_write.shutdown().await;
        result
    });

    let (a_to_b_res, b_to_a_res) = tokio::join!(a_to_b, b_to_a);

    log_direction("client->remote", a_to_b_res);
    log_direction("remote->client", b_to_a_res);
}

fn log_direction(label: &str, res: Result<std::io::Result<u64>, JoinError>) {
    match res {
        Ok(Ok(_)) => {}
        Ok(Err(err)) => {
            if !is_closeable(&err) {
                log::warn!("tunnel direction {label} ended with error: {err}");
            }
        }
        Err(join_err) => {
            log::warn!("tunnel direction {label} task failed: {join_err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, duplex};

    #[tokio::test]
    async fn splice_forwards_bytes_both_ways() {
        let (client, mut client_end) = duplex(64);
        let (remote, mut remote_end) = duplex(64);

        let handle = tokio::spawn(splice(client, remote));

        client_end.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        remote_end.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        remote_end.write_all(b"world").await.unwrap();
        let mut buf = [0u8; 5];
        client_end.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");

        drop(client_end);
        drop(remote_end);
        handle.await.unwrap();
    }
}
