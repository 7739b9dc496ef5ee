// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use tokio::io::{self, AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;

use crate::error::Error;

/// A duplex byte stream to one connected client, plain TCP or TLS.
#[derive(Debug)]
pub enum Stream {
    Mqtt(TcpStream),
    Mqtts(Box<TlsStream<TcpStream>>),
}

impl Stream {
    /// Read available bytes into `buf`, returning the number of bytes read.
    ///
    /// # Errors
    ///
    /// Returns error if the underlying socket errors.
    pub async fn read_buf(&mut self, buf: &mut Vec<u8>) -> Result<usize, Error> {
        match self {
            Self::Mqtt(stream) => Ok(stream.read_buf(buf).await?),
            Self::Mqtts(stream) => Ok(stream.read_buf(buf).await?),
        }
    }

    /// Write the whole buffer to the stream.
    ///
    /// # Errors
    ///
    /// Returns error if the underlying socket errors.
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<(), Error> {
        match self {
            Self::Mqtt(stream) => stream.write_all(buf).await?,
            Self::Mqtts(stream) => stream.write_all(buf).await?,
        }
        Ok(())
    }

    /// Shut the stream down, flushing any buffered bytes first.
    pub async fn shutdown(&mut self) {
        let _ignore = match self {
            Self::Mqtt(stream) => stream.shutdown().await,
            Self::Mqtts(stream) => stream.shutdown().await,
        };
    }

    /// Split into independent read and write halves so the receive loop's (possibly
    /// long-suspended) read never shares a lock with outbound writes.
    #[must_use]
    pub fn into_split(self) -> (ReadStream, WriteStream) {
        match self {
            Self::Mqtt(stream) => {
                let (read, write) = stream.into_split();
                (ReadStream::Mqtt(read), WriteStream::Mqtt(write))
            }
            Self::Mqtts(stream) => {
                let (read, write) = io::split(*stream);
                (ReadStream::Mqtts(read), WriteStream::Mqtts(write))
            }
        }
    }
}

impl From<TcpStream> for Stream {
    fn from(stream: TcpStream) -> Self {
        Self::Mqtt(stream)
    }
}

impl From<TlsStream<TcpStream>> for Stream {
    fn from(stream: TlsStream<TcpStream>) -> Self {
        Self::Mqtts(Box::new(stream))
    }
}

/// The read half of a split [`Stream`]; owned exclusively by one connection's receive loop.
#[derive(Debug)]
pub enum ReadStream {
    Mqtt(OwnedReadHalf),
    Mqtts(ReadHalf<TlsStream<TcpStream>>),
}

impl ReadStream {
    /// # Errors
    ///
    /// Returns error if the underlying socket errors.
    pub async fn read_buf(&mut self, buf: &mut Vec<u8>) -> Result<usize, Error> {
        match self {
            Self::Mqtt(half) => Ok(half.read_buf(buf).await?),
            Self::Mqtts(half) => Ok(half.read_buf(buf).await?),
        }
    }
}

/// The write half of a split [`Stream`]; guarded by [`crate::session::Session`]'s write lock so
/// concurrent writers (the delivery loop, the receive loop's own acks, the keepalive reply) are
/// serialised without ever blocking on an in-progress read.
#[derive(Debug)]
pub enum WriteStream {
    Mqtt(OwnedWriteHalf),
    Mqtts(WriteHalf<TlsStream<TcpStream>>),
}

impl WriteStream {
    /// # Errors
    ///
    /// Returns error if the underlying socket errors.
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<(), Error> {
        match self {
            Self::Mqtt(half) => half.write_all(buf).await?,
            Self::Mqtts(half) => half.write_all(buf).await?,
        }
        Ok(())
    }

    /// Half-close the write side, flushing any buffered bytes first.
    pub async fn shutdown(&mut self) {
        let _ignore = match self {
            Self::Mqtt(half) => half.shutdown().await,
            Self::Mqtts(half) => half.shutdown().await,
        };
    }
}
