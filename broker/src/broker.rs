// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! The broker itself: binds the listener, runs the `CONNECT`/`AUTH` handshake (including the
//! `"basic"` and `"login"` authentication schemes), owns the subscription table and the map of
//! connected clients, and fans `PUBLISH` out to matching subscribers. Specification component
//! 4.5.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use codec::{v5, ByteArray, DecodeError, DecodePacket, EncodePacket, FixedHeader, PacketType, QoS};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;

use crate::auth;
use crate::config::Config;
use crate::connection::{ClientHandle, ClientId, Connection};
use crate::error::{Error, ErrorKind};
use crate::stream::Stream;
use crate::subscription::SubscriptionTable;
use crate::tls;

/// A best-effort lifecycle notification; dropped silently if the event channel is full rather
/// than ever blocking a client-facing task.
#[derive(Debug, Clone)]
pub enum Event {
    Connect { client_id: ClientId },
    Disconnect { client_id: ClientId },
    Subscribe { client_id: ClientId, filter: String, qos: QoS },
    Publish { topic: String, qos: QoS },
}

/// Shared broker state: the subscription table, the connected-clients map, and the event feed.
/// One instance is shared, behind an `Arc`, by every `Connection` it accepts.
pub struct Broker {
    config: Config,
    subscriptions: SubscriptionTable,
    clients: StdMutex<HashMap<ClientId, ClientHandle>>,
    events: mpsc::Sender<Event>,
}

impl Broker {
    /// Construct a broker and its lifecycle event receiver. The caller may drop the receiver
    /// if it has no use for the event feed; `emit` degrades to a no-op once the channel closes.
    #[must_use]
    pub fn new(config: Config) -> (Arc<Self>, mpsc::Receiver<Event>) {
        let (events, rx) = mpsc::channel(config.event_channel_capacity);
        let broker = Arc::new(Self {
            config,
            subscriptions: SubscriptionTable::new(),
            clients: StdMutex::new(HashMap::new()),
            events,
        });
        (broker, rx)
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub const fn subscriptions(&self) -> &SubscriptionTable {
        &self.subscriptions
    }

    fn emit(&self, event: Event) {
        let _ignore = self.events.try_send(event);
    }

    /// Subscribe `client_id` to `filter` at `qos` and record the lifecycle event, returning the
    /// reason code to place in `SUBACK`.
    pub fn subscribe(&self, client_id: &str, filter: &str, qos: QoS) -> v5::ReasonCode {
        let reason = self.subscriptions.subscribe(client_id, filter, qos);
        self.emit(Event::Subscribe {
            client_id: client_id.to_owned(),
            filter: filter.to_owned(),
            qos,
        });
        reason
    }

    /// Bind `config.listen_address` and accept connections until an I/O error stops the
    /// listener itself (a failure to accept one socket only logs and continues).
    ///
    /// # Errors
    ///
    /// Returns error if the listener cannot be bound, or a TLS acceptor is configured but its
    /// certificate/key cannot be loaded.
    pub async fn serve(self: &Arc<Self>) -> Result<(), Error> {
        let listener = TcpListener::bind(&self.config.listen_address).await?;
        log::info!("broker: listening on {}", self.config.listen_address);
        self.serve_on(listener).await
    }

    /// Accept connections on an already-bound listener until accepting itself fails.
    ///
    /// Split out of [`Self::serve`] so callers that need the bound port up front (tests binding
    /// to `127.0.0.1:0`) can retrieve it from the `TcpListener` before handing it off here.
    ///
    /// # Errors
    ///
    /// Returns error if a TLS acceptor is configured but its certificate/key cannot be loaded.
    pub async fn serve_on(self: &Arc<Self>, listener: TcpListener) -> Result<(), Error> {
        let acceptor = match (&self.config.tls_cert_path, &self.config.tls_key_path) {
            (Some(cert), Some(key)) => Some(tls::build_acceptor(cert, key)?),
            _ => None,
        };

        loop {
            let (socket, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(err) => {
                    log::warn!("broker: accept error: {err}");
                    continue;
                }
            };
            log::debug!("broker: accepted {peer}");
            let broker = Arc::clone(self);
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                if let Err(err) = broker.accept_one(socket, acceptor).await {
                    log::debug!("broker: connection from {peer} dropped: {err}");
                }
            });
        }
    }

    async fn accept_one(
        self: Arc<Self>,
        socket: TcpStream,
        acceptor: Option<TlsAcceptor>,
    ) -> Result<(), Error> {
        let mut stream: Stream = match acceptor {
            Some(acceptor) => acceptor.accept(socket).await?.into(),
            None => socket.into(),
        };

        let handshake_timeout = Duration::from_secs(self.config.handshake_timeout_secs);
        let connect = match timeout(handshake_timeout, self.handshake(&mut stream)).await {
            Ok(Ok(connect)) => connect,
            Ok(Err(err)) => {
                stream.shutdown().await;
                return Err(err);
            }
            Err(_elapsed) => {
                stream.shutdown().await;
                return Err(Error::new(ErrorKind::TimeoutError, "broker: handshake timed out"));
            }
        };

        let client_id = connect.client_id().to_owned();
        let (connection, handle) = Connection::new(stream, &connect, Arc::clone(&self), &self.config);
        self.clients
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(client_id.clone(), handle);
        self.emit(Event::Connect { client_id });
        connection.spawn();
        Ok(())
    }

    /// Read the first frame, require it to be `CONNECT`, run the configured authentication
    /// policy (optionally exchanging a second-round `AUTH`), and reply with `CONNACK`.
    ///
    /// # Errors
    ///
    /// Returns error on a malformed or non-`CONNECT` first frame, or on authentication failure.
    /// A best-effort `CONNACK`/`AUTH` reply is written to `stream` before every error return.
    async fn handshake(&self, stream: &mut Stream) -> Result<v5::ConnectPacket, Error> {
        let frame = read_frame(stream).await?;
        let mut ba = ByteArray::new(&frame);
        let fixed_header = FixedHeader::decode(&mut ba)?;
        if fixed_header.packet_type() != PacketType::Connect {
            return Err(Error::new(
                ErrorKind::DecodeError,
                "broker: first packet is not CONNECT",
            ));
        }

        let connect = match v5::ConnectPacket::decode(&mut ba) {
            Ok(connect) => connect,
            Err(err) => {
                let ack = v5::ConnectAckPacket::new(false, v5::ReasonCode::MalformedPacket);
                let _ignore = write_packet(stream, &ack).await;
                return Err(err.into());
            }
        };

        if connect.client_id().is_empty() && !self.config.allow_empty_client_id {
            let ack = v5::ConnectAckPacket::new(false, v5::ReasonCode::ClientIdentifierNotValid);
            let _ignore = write_packet(stream, &ack).await;
            return Err(Error::new(
                ErrorKind::AuthError,
                "broker: empty client id not allowed",
            ));
        }

        match auth::authenticate_connect(
            connect.properties(),
            self.config.basic_auth.as_ref(),
            self.config.login_auth.as_ref(),
        ) {
            None | Some(auth::AuthOutcome::Granted) => {}
            Some(auth::AuthOutcome::Denied) => {
                let ack = v5::ConnectAckPacket::new(false, v5::ReasonCode::NotAuthorized);
                let _ignore = write_packet(stream, &ack).await;
                return Err(Error::new(ErrorKind::AuthError, "broker: authentication denied"));
            }
            Some(auth::AuthOutcome::Continue) => {
                self.continue_login(stream, &connect).await?;
            }
        }

        let ack = v5::ConnectAckPacket::new(false, v5::ReasonCode::Success);
        write_packet(stream, &ack).await?;
        Ok(connect)
    }

    /// Run the second round of a `"login"` exchange: send `AUTH(ContinueAuthentication)`, read
    /// the client's follow-up `AUTH`, and check its credentials.
    async fn continue_login(&self, stream: &mut Stream, connect: &v5::ConnectPacket) -> Result<(), Error> {
        let mut challenge = v5::AuthPacket::new();
        challenge.set_reason_code(v5::ReasonCode::ContinueAuthentication);
        write_packet(stream, &challenge).await?;

        let frame = read_frame(stream).await?;
        let mut ba = ByteArray::new(&frame);
        let fixed_header = FixedHeader::decode(&mut ba)?;
        if fixed_header.packet_type() != PacketType::Auth {
            let ack = v5::ConnectAckPacket::new(false, v5::ReasonCode::ProtocolError);
            let _ignore = write_packet(stream, &ack).await;
            return Err(Error::new(ErrorKind::AuthError, "broker: expected AUTH"));
        }
        let reply = match v5::AuthPacket::decode(&mut ba) {
            Ok(reply) => reply,
            Err(err) => {
                let ack = v5::ConnectAckPacket::new(false, v5::ReasonCode::MalformedPacket);
                let _ignore = write_packet(stream, &ack).await;
                return Err(err.into());
            }
        };

        let Some(login) = self.config.login_auth.as_ref() else {
            let ack = v5::ConnectAckPacket::new(false, v5::ReasonCode::NotAuthorized);
            let _ignore = write_packet(stream, &ack).await;
            return Err(Error::new(ErrorKind::AuthError, "broker: no login config"));
        };
        let username = auth::find_authentication_data(connect.properties()).unwrap_or(&[]);
        let password = auth::find_authentication_data(reply.properties()).unwrap_or(&[]);
        match auth::authenticate_login(username, password, login) {
            auth::AuthOutcome::Granted => Ok(()),
            auth::AuthOutcome::Denied | auth::AuthOutcome::Continue => {
                let ack = v5::ConnectAckPacket::new(false, v5::ReasonCode::NotAuthorized);
                let _ignore = write_packet(stream, &ack).await;
                Err(Error::new(ErrorKind::AuthError, "broker: login denied"))
            }
        }
    }

    /// Drop `client_id` from the connected-clients map and record the lifecycle event.
    ///
    /// Subscriptions are left to the caller (`Connection::close` also calls
    /// `subscriptions().unsubscribe_all()`), so partial failures never leave a dangling entry
    /// in one table but not the other.
    pub async fn remove_client(&self, client_id: &str) {
        self.clients
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(client_id);
        self.emit(Event::Disconnect {
            client_id: client_id.to_owned(),
        });
    }

    /// Fan `publish` out to every client currently subscribed to its topic, downgrading each
    /// copy's QoS to the minimum of the publisher's level and the subscriber's granted level.
    pub async fn publish(&self, publish: v5::PublishPacket) {
        self.emit(Event::Publish {
            topic: publish.topic().to_owned(),
            qos: publish.qos(),
        });

        let subscribers = self.subscriptions.clients_by_topic(publish.topic());
        if subscribers.is_empty() {
            return;
        }

        let deliveries: Vec<(ClientHandle, v5::PublishPacket)> = {
            let clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
            subscribers
                .into_iter()
                .filter_map(|(client_id, granted_qos)| {
                    let handle = clients.get(&client_id)?.clone();
                    Some((handle, downgrade(&publish, granted_qos)))
                })
                .collect()
        };
        for (handle, outbound) in deliveries {
            handle.deliver(outbound).await;
        }
    }

    /// Route a client's will message exactly like any other `PUBLISH`, per 3.1.2.5.
    pub async fn dispatch_will(&self, will: v5::PublishPacket) {
        self.publish(will).await;
    }
}

/// Clone `publish` and cap its QoS at `granted_qos`, the lower of the two levels winning.
fn downgrade(publish: &v5::PublishPacket, granted_qos: QoS) -> v5::PublishPacket {
    let mut outbound = publish.clone();
    let qos = publish.qos().min(granted_qos);
    let _ignore = outbound.set_qos(qos);
    outbound
}

/// Read bytes from `stream` until a complete MQTT frame (fixed header plus remaining length) is
/// available, returning exactly that frame.
async fn read_frame(stream: &mut Stream) -> Result<Vec<u8>, Error> {
    let mut buf = Vec::new();
    loop {
        let mut peek = ByteArray::new(&buf);
        match FixedHeader::decode(&mut peek) {
            Ok(fixed_header) => {
                let frame_len = fixed_header.bytes() + fixed_header.remaining_length();
                if buf.len() >= frame_len {
                    buf.truncate(frame_len);
                    return Ok(buf);
                }
            }
            Err(DecodeError::OutOfRange) => {}
            Err(err) => return Err(err.into()),
        }

        let n = stream.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(Error::new(
                ErrorKind::IoError,
                "read_frame: peer closed before a full frame arrived",
            ));
        }
    }
}

async fn write_packet<P: EncodePacket>(stream: &mut Stream, packet: &P) -> Result<(), Error> {
    let mut buf = Vec::new();
    packet.encode(&mut buf)?;
    stream.write_all(&buf).await
}
