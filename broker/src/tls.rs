// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! TLS listener support, built on `rustls` via `tokio-rustls`. Optional: `Broker::serve()` only
//! builds an acceptor when both `tls_cert_path` and `tls_key_path` are set.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

use crate::error::{Error, ErrorKind};

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, Error> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| Error::from_string(ErrorKind::CertError, format!("invalid certificate: {err}")))
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, Error> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|err| Error::from_string(ErrorKind::CertError, format!("invalid private key: {err}")))?
        .ok_or_else(|| Error::new(ErrorKind::CertError, "no private key found in file"))
}

/// Build a server-side acceptor from a PEM certificate chain and private key.
///
/// # Errors
///
/// Returns error if either file cannot be read or parsed, or if `rustls` rejects the pair.
pub fn build_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, Error> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|err| Error::from_string(ErrorKind::CertError, format!("{err}")))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}
