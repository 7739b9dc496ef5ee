// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use tokio::io::{self, AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_rustls::rustls::{Certificate, ClientConfig, OwnedTrustAnchor, RootCertStore, ServerName};
use tokio_rustls::{client::TlsStream, TlsConnector};

use crate::connect_options::{ConnectType, MqttsConnect, TlsType};
use crate::error::{Error, ErrorKind};

/// A duplex byte stream to the broker, plain TCP or TLS.
pub enum Stream {
    Mqtt(TcpStream),
    Mqtts(Box<TlsStream<TcpStream>>),
}

impl Stream {
    /// # Errors
    ///
    /// Returns error if the TCP connection fails, or (for `Mqtts`) if the certificate cannot be
    /// loaded or the TLS handshake fails.
    pub async fn new(address: &std::net::SocketAddr, connect_type: &ConnectType) -> Result<Self, Error> {
        match connect_type {
            ConnectType::Mqtt => {
                let socket = TcpStream::connect(address).await?;
                Ok(Self::Mqtt(socket))
            }
            ConnectType::Mqtts(mqtts_connect) => Self::new_tls(address, mqtts_connect).await,
        }
    }

    async fn new_tls(address: &std::net::SocketAddr, mqtts_connect: &MqttsConnect) -> Result<Self, Error> {
        let mut root_store = RootCertStore::empty();
        root_store.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|anchor| {
            OwnedTrustAnchor::from_subject_spki_name_constraints(
                anchor.subject,
                anchor.spki,
                anchor.name_constraints,
            )
        }));
        if let TlsType::SelfSigned(self_signed) = &mqtts_connect.tls_type {
            let file = File::open(&self_signed.root_ca_pem)?;
            let mut reader = BufReader::new(file);
            let certs = rustls_pemfile::certs(&mut reader)?;
            for cert in certs {
                root_store
                    .add(&Certificate(cert))
                    .map_err(|err| Error::from_string(ErrorKind::CertError, format!("{err}")))?;
            }
        }

        let config = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(config));
        let name = ServerName::try_from(mqtts_connect.domain.as_str())
            .map_err(|err| Error::from_string(ErrorKind::CertError, format!("{err}")))?;

        let socket = TcpStream::connect(address).await?;
        let socket = connector.connect(name, socket).await?;
        Ok(Self::Mqtts(Box::new(socket)))
    }

    /// # Errors
    ///
    /// Returns error if the underlying socket errors.
    pub async fn read_buf(&mut self, buf: &mut Vec<u8>) -> Result<usize, Error> {
        match self {
            Self::Mqtt(socket) => Ok(socket.read_buf(buf).await?),
            Self::Mqtts(socket) => Ok(socket.read_buf(buf).await?),
        }
    }

    /// # Errors
    ///
    /// Returns error if the underlying socket errors.
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<(), Error> {
        match self {
            Self::Mqtt(socket) => socket.write_all(buf).await?,
            Self::Mqtts(socket) => socket.write_all(buf).await?,
        }
        Ok(())
    }

    pub async fn shutdown(&mut self) {
        let _ignore = match self {
            Self::Mqtt(socket) => socket.shutdown().await,
            Self::Mqtts(socket) => socket.shutdown().await,
        };
    }

    /// Split into independent read and write halves so the background receive loop's
    /// (typically long-suspended) read never shares a lock with `publish`/`subscribe`/the
    /// keepalive ticker's writes.
    #[must_use]
    pub fn into_split(self) -> (ReadStream, WriteStream) {
        match self {
            Self::Mqtt(socket) => {
                let (read, write) = socket.into_split();
                (ReadStream::Mqtt(read), WriteStream::Mqtt(write))
            }
            Self::Mqtts(socket) => {
                let (read, write) = io::split(*socket);
                (ReadStream::Mqtts(read), WriteStream::Mqtts(write))
            }
        }
    }
}

/// The read half of a split [`Stream`]; owned exclusively by the client's background receive
/// loop.
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

/// The write half of a split [`Stream`]; guarded by [`crate::session::Session`]'s write lock.
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
