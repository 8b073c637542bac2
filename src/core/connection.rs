use std::fmt;
use std::io;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;

use crate::core::command::Cmd;
use crate::core::config::NodeAddr;
use crate::core::{Error, Result};
use crate::proto::codec::{Decoder, Encoder};
use crate::proto::frame::Frame;

const READ_CHUNK: usize = 4096;

/// Opens a TCP connection to `addr`, bounded by `timeout`.
///
/// # Errors
///
/// Returns [`Error::Connect`] on refusal, DNS failure or when the deadline
/// passes first; a timeout carries an [`io::ErrorKind::TimedOut`] source.
pub async fn connect_tcp(addr: &NodeAddr, timeout: Duration) -> Result<TcpStream> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect((addr.host(), addr.port())))
        .await
        .unwrap_or_else(|_| {
            Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect timed out after {:?}", timeout),
            ))
        })
        .map_err(|source| Error::Connect {
            address: addr.to_string(),
            source,
        })?;
    stream.set_nodelay(true).map_err(|source| Error::Io { source })?;
    Ok(stream)
}

/// A framed connection to a single node.
///
/// Wraps an underlying stream and handles RESP encoding and decoding. Used
/// directly for the connection handshake, then [`split`](Connection::split)
/// into halves owned by the session's reader and writer tasks.
pub struct Connection<S> {
    stream: S,
    decoder: Decoder,
    encoder: Encoder,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Creates a new connection with the given stream.
    pub fn new(stream: S) -> Self {
        Self::with_decoder(stream, Decoder::new())
    }

    /// Creates a new connection using a preconfigured decoder.
    pub fn with_decoder(stream: S, decoder: Decoder) -> Self {
        Self {
            stream,
            decoder,
            encoder: Encoder::new(),
        }
    }

    /// Writes a command to the connection.
    pub async fn write_command(&mut self, cmd: &Cmd) -> io::Result<()> {
        self.encoder.encode_args(cmd.args());
        let data = self.encoder.take();
        self.stream.write_all(&data).await
    }

    /// Reads one frame, returning `None` if the peer closed the stream
    /// cleanly between frames.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] on read failure and [`Error::Protocol`] on
    /// malformed data or a close in the middle of a frame.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>> {
        read_frame(&mut self.stream, &mut self.decoder).await
    }

    /// Sends a command and waits for its reply. Only valid before the
    /// connection is split, when nothing else is in flight.
    pub async fn request(&mut self, cmd: &Cmd) -> Result<Frame> {
        self.write_command(cmd).await?;
        self.read_frame().await?.ok_or(Error::ConnectionClosed)
    }

    /// Splits the connection into independently owned read and write halves.
    ///
    /// Bytes already buffered by the decoder stay with the reader.
    pub fn split(self) -> (ConnectionReader<S>, ConnectionWriter<S>) {
        let (read, write) = tokio::io::split(self.stream);
        (
            ConnectionReader {
                stream: read,
                decoder: self.decoder,
            },
            ConnectionWriter {
                stream: write,
                encoder: self.encoder,
            },
        )
    }
}

impl<S> fmt::Debug for Connection<S>
where
    S: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("stream", &self.stream)
            .field("buffered", &self.decoder.buffered())
            .finish()
    }
}

/// Read half of a split [`Connection`].
pub struct ConnectionReader<S> {
    stream: ReadHalf<S>,
    decoder: Decoder,
}

impl<S> ConnectionReader<S>
where
    S: AsyncRead + AsyncWrite,
{
    /// Reads one frame; see [`Connection::read_frame`].
    pub async fn read_frame(&mut self) -> Result<Option<Frame>> {
        read_frame(&mut self.stream, &mut self.decoder).await
    }
}

/// Write half of a split [`Connection`].
pub struct ConnectionWriter<S> {
    stream: WriteHalf<S>,
    encoder: Encoder,
}

impl<S> ConnectionWriter<S>
where
    S: AsyncRead + AsyncWrite,
{
    /// Encodes and writes a batch of commands with a single write.
    pub async fn write_commands(&mut self, cmds: &[Cmd]) -> io::Result<()> {
        for cmd in cmds {
            self.encoder.encode_args(cmd.args());
        }
        let data = self.encoder.take();
        self.stream.write_all(&data).await?;
        self.stream.flush().await
    }

    /// Shuts down the write direction of the stream.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }
}

async fn read_frame<R>(stream: &mut R, decoder: &mut Decoder) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    loop {
        if let Some(frame) = decoder.decode()? {
            return Ok(Some(frame));
        }
        buf.clear();
        let n = stream.read_buf(&mut buf).await?;
        if n == 0 {
            if decoder.buffered() == 0 {
                return Ok(None);
            }
            return Err(Error::protocol("connection closed in the middle of a frame"));
        }
        decoder.append(&buf[..n]);
    }
}
