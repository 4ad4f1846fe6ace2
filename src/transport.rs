//! TCP transport with newline-delimited framing.
//!
//! One frame is one line of text terminated by `\n`. Envelopes are encoded
//! as compact JSON, which never contains a raw newline, so the line
//! boundary is the message boundary.
//!
//! ```text
//! {"kind":"game_start_request","payload":{"test":true}}\n
//! ```
//!
//! A trailing `\r` before the `\n` is tolerated on input. Frames longer than
//! the configured maximum are rejected with `InvalidData`.

use bytes::{BufMut, BytesMut};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::trace;

use crate::error::{Error, Result};

/// Default maximum frame size (16MB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Read one frame, without its line terminator.
///
/// Returns `UnexpectedEof` if the stream closes before or during a frame.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> io::Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let limit = max_len as u64 + 1;
    let n = (&mut *reader)
        .take(limit)
        .read_until(b'\n', &mut buf)
        .await?;

    if n == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed",
        ));
    }

    if buf.last() != Some(&b'\n') {
        if buf.len() > max_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame exceeds {max_len} bytes"),
            ));
        }
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed mid-frame",
        ));
    }

    buf.pop();
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }

    Ok(buf)
}

/// Write one frame followed by `\n`, then flush.
pub async fn write_frame<W>(writer: &mut W, frame: &str, max_len: usize) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if frame.len() > max_len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame too large: {} bytes (max {max_len})", frame.len()),
        ));
    }
    if frame.contains('\n') {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "frame contains a line terminator",
        ));
    }

    let mut out = BytesMut::with_capacity(frame.len() + 1);
    out.put_slice(frame.as_bytes());
    out.put_u8(b'\n');

    writer.write_all(&out).await?;
    writer.flush().await
}

/// Bind a listening socket.
///
/// Built through `socket2` so the listen backlog is configurable.
pub fn bind_listener(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    TcpListener::from_std(socket.into())
}

/// Resolve `host:port` to the first matching socket address.
pub async fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no address found for {host}:{port}"),
            )
        })
}

/// Establish an outbound connection within `timeout`.
pub async fn connect(
    host: &str,
    port: u16,
    timeout: Duration,
    max_frame_len: usize,
) -> Result<Connection> {
    let connection_error = |source: io::Error| Error::Connection {
        addr: format!("{host}:{port}"),
        source,
    };

    let stream = match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(connection_error(e)),
        Err(_) => {
            return Err(connection_error(io::Error::new(
                io::ErrorKind::TimedOut,
                "connect timed out",
            )))
        }
    };

    Connection::new(stream, max_frame_len).map_err(connection_error)
}

/// A framed TCP connection.
///
/// Owned by exactly one session. Moves from open to closed once; every
/// operation after that fails with `NotConnected`, except `close` which is
/// a no-op.
#[derive(Debug)]
pub struct Connection {
    stream: Option<BufReader<TcpStream>>,
    peer: SocketAddr,
    max_frame_len: usize,
}

impl Connection {
    pub fn new(stream: TcpStream, max_frame_len: usize) -> io::Result<Self> {
        let peer = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream: Some(BufReader::new(stream)),
            peer,
            max_frame_len,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Read the next frame.
    pub async fn read_frame(&mut self) -> io::Result<Vec<u8>> {
        let max_len = self.max_frame_len;
        let frame = read_frame(self.stream_mut()?, max_len).await?;
        trace!(peer = %self.peer, len = frame.len(), "Frame read");
        Ok(frame)
    }

    /// Write a frame.
    pub async fn write_frame(&mut self, frame: &str) -> io::Result<()> {
        let max_len = self.max_frame_len;
        write_frame(self.stream_mut()?, frame, max_len).await?;
        trace!(peer = %self.peer, len = frame.len(), "Frame written");
        Ok(())
    }

    /// Release the socket.
    ///
    /// `forced = false` flushes and sends FIN. `forced = true` sets a zero
    /// linger so the socket is reset immediately, discarding unsent data.
    pub async fn close(&mut self, forced: bool) -> io::Result<()> {
        let Some(stream) = self.stream.take() else {
            return Ok(());
        };
        let mut stream = stream.into_inner();

        trace!(peer = %self.peer, forced, "Closing connection");

        if forced {
            socket2::SockRef::from(&stream).set_linger(Some(Duration::ZERO))?;
            drop(stream);
            Ok(())
        } else {
            stream.shutdown().await
        }
    }

    fn stream_mut(&mut self) -> io::Result<&mut BufReader<TcpStream>> {
        self.stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection closed"))
    }
}
