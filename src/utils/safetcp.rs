//! TCP bind/connect/read/write helper functions. Objects are framed as a
//! big-endian u64 length header followed by their MessagePack encoding.

use std::marker::Unpin;
use std::net::SocketAddr;

use crate::utils::SynleaseError;

use serde::de::DeserializeOwned;
use serde::Serialize;

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::time::{self, Duration};

/// Frames larger than this are treated as a corrupted stream.
const MAX_FRAME_LEN: u64 = 16 * 1024 * 1024;

/// Sends an object of type `T` to a writable connection.
pub(crate) async fn tcp_send_obj<T, Conn>(
    conn_write: &mut Conn,
    obj: &T,
) -> Result<(), SynleaseError>
where
    T: Serialize,
    Conn: AsyncWriteExt + Unpin,
{
    let obj_bytes = encode_to_vec(obj)?;
    conn_write.write_u64(obj_bytes.len() as u64).await?; // length first
    conn_write.write_all(&obj_bytes[..]).await?;
    conn_write.flush().await?;
    Ok(())
}

/// Receives an object of type `T` from a readable connection.
///
/// Not cancellation-safe: if the returned future is dropped midway, the
/// connection must be discarded as well.
pub(crate) async fn tcp_recv_obj<T, Conn>(
    conn_read: &mut Conn,
) -> Result<T, SynleaseError>
where
    T: DeserializeOwned,
    Conn: AsyncReadExt + Unpin,
{
    let obj_len = conn_read.read_u64().await?;
    if obj_len > MAX_FRAME_LEN {
        return Err(SynleaseError::msg(format!(
            "frame length {} exceeds limit",
            obj_len
        )));
    }
    let mut obj_buf: Vec<u8> = vec![0; obj_len as usize];
    conn_read.read_exact(&mut obj_buf[..]).await?;
    Ok(decode_from_slice(&obj_buf)?)
}

/// Wrapper over tokio `TcpListener::bind()` that provides a retrying logic.
pub(crate) async fn tcp_bind_with_retry(
    bind_addr: SocketAddr,
    mut retries: u8,
) -> Result<TcpListener, SynleaseError> {
    loop {
        let socket = if bind_addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;

        match socket.bind(bind_addr).and_then(|_| socket.listen(1024)) {
            Ok(listener) => return Ok(listener),
            Err(err) => {
                if retries == 0 {
                    return Err(err.into());
                }
                retries -= 1;
                time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Wrapper over tokio `TcpStream::connect()` that provides a retrying logic.
pub(crate) async fn tcp_connect_with_retry(
    conn_addr: SocketAddr,
    mut retries: u8,
) -> Result<TcpStream, SynleaseError> {
    loop {
        match TcpStream::connect(conn_addr).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(err) => {
                if retries == 0 {
                    return Err(err.into());
                }
                retries -= 1;
                time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}
