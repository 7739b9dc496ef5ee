// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

use codec::utils::random_client_id;
use codec::QoS;

/// A certificate authority file trusted in addition to the platform's web roots, for brokers
/// presenting a self-signed certificate.
#[derive(Clone, Debug)]
pub struct SelfSignedTls {
    pub root_ca_pem: PathBuf,
}

#[derive(Clone, Debug)]
pub enum TlsType {
    /// Verify the broker's certificate against the bundled `webpki-roots` trust anchors.
    CASigned,
    SelfSigned(SelfSignedTls),
}

#[derive(Clone, Debug)]
pub struct MqttsConnect {
    /// Server name used for SNI and certificate verification.
    pub domain: String,
    pub tls_type: TlsType,
}

#[derive(Clone, Debug)]
pub enum ConnectType {
    Mqtt,
    Mqtts(MqttsConnect),
}

/// Username/password carried as `"basic"` authentication data on `CONNECT`, matching the
/// broker's `basic` scheme.
#[derive(Clone, Debug)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

/// Username/password exchanged over the two-round `"login"` scheme: username travels on the
/// initiating `CONNECT`, password on the follow-up `AUTH`.
#[derive(Clone, Debug)]
pub struct LoginAuth {
    pub username: String,
    pub password: String,
}

#[derive(Clone, Debug)]
pub enum Auth {
    None,
    Basic(BasicAuth),
    Login(LoginAuth),
}

/// A will message to register with the broker for this connection, per 3.1.2.5.
#[derive(Clone, Debug)]
pub struct Will {
    pub topic: String,
    pub message: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

#[derive(Clone, Debug)]
pub struct ConnectOptions {
    address: SocketAddr,
    connect_type: ConnectType,
    client_id: String,
    keep_alive: Duration,
    connect_timeout: Duration,
    auth: Auth,
    will: Option<Will>,
}

impl ConnectOptions {
    /// # Errors
    ///
    /// Returns error if `address` does not resolve to at least one socket address.
    pub fn new<A: ToSocketAddrs>(address: A) -> io::Result<Self> {
        let mut addrs = address.to_socket_addrs()?;
        let address = addrs
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "address did not resolve"))?;
        Ok(Self {
            address,
            connect_type: ConnectType::Mqtt,
            client_id: random_client_id(),
            connect_timeout: Duration::from_secs(10),
            keep_alive: Duration::from_secs(30),
            auth: Auth::None,
            will: None,
        })
    }

    #[must_use]
    pub const fn address(&self) -> &SocketAddr {
        &self.address
    }

    pub fn set_connect_type(&mut self, connect_type: ConnectType) -> &mut Self {
        self.connect_type = connect_type;
        self
    }

    #[must_use]
    pub const fn connect_type(&self) -> &ConnectType {
        &self.connect_type
    }

    pub fn set_client_id(&mut self, client_id: &str) -> &mut Self {
        self.client_id = client_id.to_owned();
        self
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn set_connect_timeout(&mut self, connect_timeout: Duration) -> &mut Self {
        self.connect_timeout = connect_timeout;
        self
    }

    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn set_keep_alive(&mut self, keep_alive: Duration) -> &mut Self {
        self.keep_alive = keep_alive;
        self
    }

    #[must_use]
    pub const fn keep_alive(&self) -> Duration {
        self.keep_alive
    }

    pub fn set_auth(&mut self, auth: Auth) -> &mut Self {
        self.auth = auth;
        self
    }

    #[must_use]
    pub const fn auth(&self) -> &Auth {
        &self.auth
    }

    pub fn set_will(&mut self, will: Will) -> &mut Self {
        self.will = Some(will);
        self
    }

    #[must_use]
    pub const fn will(&self) -> Option<&Will> {
        self.will.as_ref()
    }
}
