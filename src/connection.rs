use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use thiserror::Error as ThisError;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time;
use tokio_util::codec::Decoder;

use crate::codec::{self, CommandCodec};
use crate::command::Command;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error(transparent)]
    Protocol(codec::Error),
    /// A single command does not fit in the read buffer.
    #[error("command exceeds the read buffer of {limit} bytes")]
    Oversized { limit: usize },
    #[error("write timed out after {0:?}")]
    WriteTimeout(Duration),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<codec::Error> for Error {
    fn from(err: codec::Error) -> Error {
        match err {
            codec::Error::FrameTooLarge { limit, .. } => Error::Oversized { limit },
            codec::Error::Io(err) => Error::Io(err),
            err => Error::Protocol(err),
        }
    }
}

/// Outcome of a single [`Connection::read`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Read {
    /// That many bytes were appended to the read buffer.
    Data(usize),
    /// The peer closed its side.
    Eof,
    /// The read deadline passed with no data. Buffered bytes are kept.
    TimedOut,
}

/// A client socket with a fixed-capacity read buffer.
///
/// The socket is closed when the connection is dropped.
pub struct Connection {
    stream: TcpStream,
    // Bytes read from the socket and not decoded yet. Never holds more than `capacity` bytes.
    buffer: BytesMut,
    capacity: usize,
    codec: CommandCodec,
}

impl Connection {
    pub fn new(stream: TcpStream, capacity: usize) -> Connection {
        Connection {
            stream,
            buffer: BytesMut::with_capacity(capacity),
            capacity,
            codec: CommandCodec::with_max_frame_size(capacity),
        }
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    /// Bytes received but not decoded yet, such as the beginning of a split frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Reads once from the socket into the free part of the buffer.
    pub async fn read(&mut self, timeout: Duration) -> Result<Read, Error> {
        let free = self.capacity - self.buffer.len();
        if free == 0 {
            return Err(Error::Oversized {
                limit: self.capacity,
            });
        }
        self.compact();

        let mut window = (&mut self.buffer).limit(free);
        match time::timeout(timeout, self.stream.read_buf(&mut window)).await {
            Err(_elapsed) => Ok(Read::TimedOut),
            Ok(Ok(0)) => Ok(Read::Eof),
            Ok(Ok(n)) => Ok(Read::Data(n)),
            Ok(Err(err)) => Err(err.into()),
        }
    }

    /// Decodes every complete command in the buffer, in arrival order.
    ///
    /// Trailing bytes of an incomplete frame stay buffered for the next read.
    pub fn decode(&mut self) -> Result<Vec<Command>, Error> {
        let mut commands = Vec::new();
        while let Some(command) = self.codec.decode(&mut self.buffer)? {
            commands.push(command);
        }
        Ok(commands)
    }

    /// Writes all of `bytes`. On error or timeout an unknown prefix may have been sent.
    pub async fn write(&mut self, bytes: &[u8], timeout: Duration) -> Result<(), Error> {
        match time::timeout(timeout, self.stream.write_all(bytes)).await {
            Err(_elapsed) => Err(Error::WriteTimeout(timeout)),
            Ok(result) => Ok(result?),
        }
    }

    // Moves the pending bytes back to the start of the allocation so the next read can use the
    // whole free capacity.
    fn compact(&mut self) {
        if self.buffer.capacity() >= self.capacity {
            return;
        }

        if self.buffer.is_empty() {
            // Reclaims the whole allocation without copying.
            self.buffer.reserve(self.capacity);
        } else {
            let mut compacted = BytesMut::with_capacity(self.capacity);
            compacted.extend_from_slice(&self.buffer);
            self.buffer = compacted;
        }
    }
}
