//! Safe TCP bind and cancellation-aware read/write helper functions.

use std::marker::Unpin;
use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket};
use tokio::time::{self, Duration};

use crate::protocol::WireError;
use crate::utils::{CancelToken, TallyError};

/// Reads exactly `buf.len()` bytes from `conn_read`. The cancellation token
/// is polled before every socket read, so a raised token stops the exchange
/// before any further bytes are consumed. Returns:
///   - `Ok(())` if the buffer got completely filled
///   - `Err(WireError::Framing)` if the peer closed the stream early
///   - `Err(WireError::Cancelled)` if termination was requested
///   - `Err(WireError::Connection)` on any other socket failure
pub(crate) async fn cancellable_read<Conn>(
    conn_read: &mut Conn,
    buf: &mut [u8],
    cancel: &CancelToken,
) -> Result<(), WireError>
where
    Conn: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        cancel.check()?;
        let n = conn_read.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(WireError::Framing(format!(
                "short read: got {} of {} bytes",
                filled,
                buf.len()
            )));
        }
        filled += n;
    }
    Ok(())
}

/// Writes all of `bytes` to `conn_write`, polling the cancellation token
/// before every socket write. A zero-length write means the connection is
/// broken.
pub(crate) async fn cancellable_write<Conn>(
    conn_write: &mut Conn,
    bytes: &[u8],
    cancel: &CancelToken,
) -> Result<(), WireError>
where
    Conn: AsyncWrite + Unpin,
{
    let mut written = 0;
    while written < bytes.len() {
        cancel.check()?;
        let n = conn_write.write(&bytes[written..]).await?;
        if n == 0 {
            return Err(WireError::Connection(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "socket connection broken",
            )));
        }
        written += n;
    }
    cancel.check()?;
    conn_write.flush().await?;
    Ok(())
}

/// Wrapper over tokio `TcpSocket::listen()` that provides a retrying logic.
pub(crate) async fn tcp_bind_with_retry(
    bind_addr: SocketAddr,
    backlog: u32,
    mut retries: u8,
) -> Result<TcpListener, TallyError> {
    loop {
        let socket = if bind_addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;

        let bound = match socket.bind(bind_addr) {
            Ok(()) => socket.listen(backlog),
            Err(err) => Err(err),
        };
        match bound {
            Ok(listener) => return Ok(listener),
            Err(err) => {
                if retries == 0 {
                    return logged_err!(
                        "binding listener to {} failed: {}",
                        bind_addr,
                        err
                    );
                }
                pf_warn!("binding {} failed, retrying: {}", bind_addr, err);
                retries -= 1;
                time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

#[cfg(test)]
mod safetcp_tests {
    use super::*;

    #[tokio::test]
    async fn read_exact_from_slice() -> Result<(), TallyError> {
        let (_tx_term, cancel) = CancelToken::new();
        let mut conn: &[u8] = &[1, 2, 3, 4, 5];
        let mut buf = [0u8; 3];
        cancellable_read(&mut conn, &mut buf, &cancel).await?;
        assert_eq!(buf, [1, 2, 3]);
        assert_eq!(conn, &[4, 5]);
        Ok(())
    }

    #[tokio::test]
    async fn read_short_is_framing() {
        let (_tx_term, cancel) = CancelToken::new();
        let mut conn: &[u8] = &[1, 2];
        let mut buf = [0u8; 4];
        let res = cancellable_read(&mut conn, &mut buf, &cancel).await;
        assert!(matches!(res, Err(WireError::Framing(_))));
    }

    #[tokio::test]
    async fn read_cancelled_consumes_nothing() {
        let (tx_term, cancel) = CancelToken::new();
        tx_term.send(true).unwrap();
        let mut conn: &[u8] = &[1, 2, 3];
        let mut buf = [0u8; 1];
        let res = cancellable_read(&mut conn, &mut buf, &cancel).await;
        assert!(matches!(res, Err(WireError::Cancelled)));
        assert_eq!(conn.len(), 3);
    }

    #[tokio::test]
    async fn write_then_cancelled() -> Result<(), TallyError> {
        let (tx_term, cancel) = CancelToken::new();
        let mut conn: Vec<u8> = Vec::new();
        cancellable_write(&mut conn, &[7, 8], &cancel).await?;
        assert_eq!(conn, vec![7, 8]);
        tx_term.send(true).unwrap();
        let res = cancellable_write(&mut conn, &[9], &cancel).await;
        assert!(matches!(res, Err(WireError::Cancelled)));
        assert_eq!(conn, vec![7, 8]);
        Ok(())
    }

    #[tokio::test]
    async fn bind_ephemeral() -> Result<(), TallyError> {
        let listener =
            tcp_bind_with_retry("127.0.0.1:0".parse()?, 8, 0).await?;
        assert_ne!(listener.local_addr()?.port(), 0);
        Ok(())
    }
}
