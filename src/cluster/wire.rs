//! Length-prefixed JSON framing shared by the coordination service and the
//! node admin listener. Each frame is a 4-byte big-endian length followed by
//! one JSON document.

use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

// TigerStyle: Explicit limits with _MAX suffix
pub const FRAME_SIZE_MAX: usize = 4 * 1024 * 1024;

pub type Connection = Framed<TcpStream, LengthDelimitedCodec>;

pub fn framed(stream: TcpStream) -> Connection {
    let codec = LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(FRAME_SIZE_MAX)
        .new_codec();
    Framed::new(stream, codec)
}

pub async fn send<T: Serialize>(conn: &mut Connection, message: &T) -> IoResult<()> {
    let bytes = serde_json::to_vec(message)?;
    conn.send(bytes::Bytes::from(bytes)).await
}

/// Next message, or None once the peer closed the connection.
pub async fn recv<T: DeserializeOwned>(conn: &mut Connection) -> IoResult<Option<T>> {
    match conn.next().await {
        None => Ok(None),
        Some(frame) => {
            let frame = frame?;
            let message = serde_json::from_slice(&frame)
                .map_err(|e| IoError::new(ErrorKind::InvalidData, e))?;
            Ok(Some(message))
        }
    }
}

pub async fn connect(addr: &str, timeout: Duration) -> IoResult<Connection> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| IoError::new(ErrorKind::TimedOut, format!("connect to {} timed out", addr)))??;
    stream.set_nodelay(true)?;
    Ok(framed(stream))
}

/// Send one request and wait for its response.
pub async fn call<Req, Resp>(conn: &mut Connection, request: &Req, timeout: Duration) -> IoResult<Resp>
where
    Req: Serialize,
    Resp: DeserializeOwned,
{
    send(conn, request).await?;
    match tokio::time::timeout(timeout, recv(conn)).await {
        Ok(Ok(Some(response))) => Ok(response),
        Ok(Ok(None)) => Err(IoError::new(ErrorKind::UnexpectedEof, "peer closed connection")),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(IoError::new(ErrorKind::TimedOut, "response timed out")),
    }
}

/// Connect, send one request, read one response.
pub async fn request<Req, Resp>(addr: &str, request: &Req, timeout: Duration) -> IoResult<Resp>
where
    Req: Serialize,
    Resp: DeserializeOwned,
{
    let mut conn = connect(addr, timeout).await?;
    call(&mut conn, request, timeout).await
}
