// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Owns one accepted TCP connection and runs its protocol loop: a receive loop that reads
//! frames and dispatches on type, and a delivery loop that drains the per-client channel of
//! outbound `PUBLISH` messages. Specification component 4.4.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use codec::{v5, ByteArray, DecodeError, DecodePacket, EncodePacket, FixedHeader, PacketType, QoS};
use tokio::sync::mpsc;
use tokio::time::{self, Instant};

use crate::broker::Broker;
use crate::config::Config;
use crate::session::{AckValue, AwaitedAck, Session};
use crate::stream::{ReadStream, Stream};

/// Opaque client identity; the MQTT `CONNECT.client_id` string.
pub type ClientId = String;

/// Will message captured off `CONNECT`, dispatched by `close()` unless the close was a
/// received `DISCONNECT`.
#[derive(Clone)]
struct Will {
    topic: String,
    message: Vec<u8>,
    qos: QoS,
    retain: bool,
    properties: v5::Properties,
}

/// A handle the broker keeps per connected client to enqueue outbound `PUBLISH` packets.
#[derive(Clone)]
pub struct ClientHandle {
    pub client_id: ClientId,
    tx: mpsc::Sender<v5::PublishPacket>,
}

impl ClientHandle {
    /// Enqueue `publish` for delivery; silently dropped if the client's delivery loop has
    /// already exited (connection going away concurrently with fan-out).
    pub async fn deliver(&self, publish: v5::PublishPacket) {
        let _ignore = self.tx.send(publish).await;
    }
}

/// One connected client's protocol handler.
pub struct Connection {
    client_id: ClientId,
    session: Arc<Session>,
    broker: Arc<Broker>,
    keep_alive: Duration,
    will: Option<Will>,
    closed: AtomicBool,
    delivery_rx: tokio::sync::Mutex<mpsc::Receiver<v5::PublishPacket>>,
    max_retries: u32,
    /// Owned solely by `run_receive_loop`; split off from the write half so a long-suspended
    /// read (up to the keepalive interval) never blocks the delivery loop's writes.
    read_stream: tokio::sync::Mutex<ReadStream>,
}

impl Connection {
    /// Build a connection from an already-handshaken socket and the decoded `CONNECT`.
    #[must_use]
    pub fn new(
        stream: Stream,
        connect: &v5::ConnectPacket,
        broker: Arc<Broker>,
        config: &Config,
    ) -> (Arc<Self>, ClientHandle) {
        let client_id = connect.client_id().to_owned();
        let keep_alive = if connect.keep_alive() > 0 {
            Duration::from_secs(u64::from(connect.keep_alive()))
        } else {
            Duration::from_secs(config.default_keep_alive)
        };
        let will = if connect.will() {
            connect.will_topic().map(|topic| Will {
                topic: topic.to_owned(),
                message: connect.will_message().to_vec(),
                qos: connect.will_qos(),
                retain: connect.will_retain(),
                properties: connect.will_properties().clone(),
            })
        } else {
            None
        };
        let (read_half, write_half) = stream.into_split();
        let session = Arc::new(Session::new(
            write_half,
            Duration::from_secs(config.session_ack_timeout_secs),
            Duration::from_secs(config.session_retry_delay_secs),
        ));
        let (tx, rx) = mpsc::channel(crate::config::DELIVERY_CHANNEL_CAPACITY);
        let handle = ClientHandle {
            client_id: client_id.clone(),
            tx,
        };
        let connection = Arc::new(Self {
            client_id,
            session,
            broker,
            keep_alive,
            will,
            closed: AtomicBool::new(false),
            delivery_rx: tokio::sync::Mutex::new(rx),
            max_retries: config.max_session_retries,
            read_stream: tokio::sync::Mutex::new(read_half),
        });
        (connection, handle)
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Spawn the receive loop and the delivery loop, each running until the connection closes.
    pub fn spawn(self: &Arc<Self>) {
        let recv = Arc::clone(self);
        tokio::spawn(async move {
            recv.run_receive_loop().await;
        });
        let deliver = Arc::clone(self);
        tokio::spawn(async move {
            deliver.run_delivery_loop().await;
        });
    }

    async fn run_receive_loop(self: Arc<Self>) {
        let mut buf = Vec::new();
        let mut last_activity = Instant::now();
        let mut stream = self.read_stream.lock().await;
        loop {
            let read_result = time::timeout(self.keep_alive, stream.read_buf(&mut buf)).await;
            let n = match read_result {
                Ok(Ok(n)) => n,
                Ok(Err(err)) => {
                    log::debug!("connection {}: read error: {err}", self.client_id);
                    break;
                }
                Err(_elapsed) => {
                    log::debug!("connection {}: keepalive expired", self.client_id);
                    break;
                }
            };
            if n == 0 {
                log::debug!("connection {}: peer closed", self.client_id);
                break;
            }
            last_activity = Instant::now();
            let _ignore = last_activity;

            while let Some(consumed) = self.try_dispatch_one(&buf).await {
                buf.drain(..consumed);
                if buf.is_empty() {
                    break;
                }
            }
        }
        // A graceful DISCONNECT already called `close(true)` from within `dispatch`, making
        // this a no-op; every other way out of this loop (read error, keepalive expiry, bare
        // EOF) is an abnormal close and must still fire the will.
        self.close(false).await;
    }

    /// Attempt to decode and dispatch exactly one frame from the front of `buf`.
    ///
    /// Returns `None` when `buf` does not yet hold a complete frame (need more bytes from the
    /// socket); returns `Some(consumed)` after a frame (malformed or not) has been handled.
    async fn try_dispatch_one(&self, buf: &[u8]) -> Option<usize> {
        let mut peek = ByteArray::new(buf);
        let fixed_header = match FixedHeader::decode(&mut peek) {
            Ok(header) => header,
            Err(DecodeError::OutOfRange) => return None,
            Err(err) => {
                log::warn!("connection {}: malformed fixed header: {err:?}", self.client_id);
                self.close(false).await;
                return Some(buf.len());
            }
        };
        let frame_len = fixed_header.bytes() + fixed_header.remaining_length();
        if buf.len() < frame_len {
            return None;
        }

        let mut ba = ByteArray::new(&buf[..frame_len]);
        if let Err(err) = self.dispatch(fixed_header.packet_type(), &mut ba).await {
            log::warn!("connection {}: dispatch error: {err:?}", self.client_id);
        }
        Some(frame_len)
    }

    #[allow(clippy::too_many_lines)]
    async fn dispatch(&self, packet_type: PacketType, ba: &mut ByteArray<'_>) -> Result<(), DecodeError> {
        match packet_type {
            PacketType::PingRequest => {
                let _request = v5::PingRequestPacket::decode(ba)?;
                let _ignore = self.session.write(&v5::PingResponsePacket::default()).await;
            }
            PacketType::Subscribe => {
                let subscribe = v5::SubscribePacket::decode(ba)?;
                self.handle_subscribe(&subscribe).await;
            }
            PacketType::Unsubscribe => {
                let unsubscribe = v5::UnsubscribePacket::decode(ba)?;
                self.handle_unsubscribe(&unsubscribe).await;
            }
            PacketType::Publish { qos, .. } => {
                let publish = v5::PublishPacket::decode(ba)?;
                self.handle_publish(publish, qos).await;
            }
            PacketType::PublishRelease => {
                let release = v5::PublishReleasePacket::decode(ba)?;
                self.handle_publish_release(&release).await;
            }
            PacketType::PublishAck => {
                let ack = v5::PublishAckPacket::decode(ba)?;
                let id = ack.packet_id();
                let _ignore = self.session.meet(id, AckValue::PublishAck(ack));
            }
            PacketType::PublishReceived => {
                let received = v5::PublishReceivedPacket::decode(ba)?;
                let id = received.packet_id();
                let _ignore = self.session.meet(id, AckValue::PublishReceived(received));
            }
            PacketType::PublishComplete => {
                let complete = v5::PublishCompletePacket::decode(ba)?;
                let id = complete.packet_id();
                let _ignore = self.session.meet(id, AckValue::PublishComplete(complete));
            }
            PacketType::Disconnect => {
                let _disconnect = v5::DisconnectPacket::decode(ba)?;
                self.close(true).await;
            }
            other => {
                log::debug!("connection {}: unhandled packet type {other:?}", self.client_id);
            }
        }
        Ok(())
    }

    async fn handle_subscribe(&self, subscribe: &v5::SubscribePacket) {
        let mut reasons = Vec::with_capacity(subscribe.topics().len());
        for topic in subscribe.topics() {
            let reason = self
                .broker
                .subscribe(&self.client_id, topic.topic(), topic.qos());
            reasons.push(reason);
        }
        let ack = v5::SubscribeAckPacket::with_vec(subscribe.packet_id(), reasons.clone());
        let _ignore = self.session.write(&ack).await;

        // Only filters that actually granted a subscription (not a malformed filter or a
        // wildcard matching nothing) get retained delivery.
        for (topic, reason) in subscribe.topics().iter().zip(reasons.iter()) {
            if (*reason as u8) >= 0x80 {
                continue;
            }
            for (retained_topic, mut publish) in self.broker.subscriptions().retained_matching(topic.topic()) {
                let _ignore = publish.set_retain(true);
                log::trace!("connection {}: delivering retained on {retained_topic}", self.client_id);
                let _ignore = self.session.write(&publish).await;
            }
        }
    }

    async fn handle_unsubscribe(&self, unsubscribe: &v5::UnsubscribePacket) {
        // A single client-wide removal covers every filter named in this packet; retained
        // messages and other subscribers' entries are untouched.
        self.broker.subscriptions().unsubscribe_all(&self.client_id);
        let ack = v5::UnsubscribeAckPacket::with_vec(
            unsubscribe.packet_id(),
            unsubscribe
                .topics()
                .iter()
                .map(|_| v5::ReasonCode::Success)
                .collect(),
        );
        let _ignore = self.session.write(&ack).await;
    }

    async fn handle_publish(&self, mut publish: v5::PublishPacket, qos: QoS) {
        match qos {
            QoS::AtMostOnce => {
                self.route_publish(publish).await;
            }
            QoS::AtLeastOnce => {
                let ack = v5::PublishAckPacket::new(publish.packet_id());
                let _ignore = self.session.write(&ack).await;
                self.route_publish(publish).await;
            }
            QoS::ExactOnce => {
                let id = publish.packet_id();
                self.session.store_message(publish.clone());
                let received = v5::PublishReceivedPacket::new(id);
                let _ignore = self.session.write(&received).await;
                let _ignore = &mut publish;
            }
        }
    }

    async fn handle_publish_release(&self, release: &v5::PublishReleasePacket) {
        let id = release.packet_id();
        if let Some(publish) = self.session.delete_message(id) {
            let complete = v5::PublishCompletePacket::new(id);
            let _ignore = self.session.write(&complete).await;
            self.route_publish(publish).await;
        }
    }

    /// Apply the retain-handling rules and hand the publish to the broker's fan-out.
    async fn route_publish(&self, mut publish: v5::PublishPacket) {
        if publish.retain() && publish.message().is_empty() {
            self.broker.subscriptions().delete_retained(publish.topic());
            return;
        }
        if publish.retain() {
            self.broker.subscriptions().set_retained(publish.topic(), publish.clone());
            let _ignore = publish.set_retain(false);
        }
        self.broker.publish(publish).await;
    }

    /// Drain the per-client delivery channel, applying the outbound QoS discipline to each
    /// inbound `PUBLISH`.
    async fn run_delivery_loop(self: Arc<Self>) {
        loop {
            let publish = {
                let mut rx = self.delivery_rx.lock().await;
                rx.recv().await
            };
            let Some(publish) = publish else {
                break;
            };
            if self.closed.load(Ordering::Acquire) {
                break;
            }
            if let Err(err) = self.deliver_one(publish).await {
                log::warn!("connection {}: delivery failed: {err}", self.client_id);
                self.close(true).await;
                break;
            }
        }
    }

    async fn deliver_one(&self, publish: v5::PublishPacket) -> Result<(), crate::error::Error> {
        match publish.qos() {
            QoS::AtMostOnce => self.session.write(&publish).await,
            QoS::AtLeastOnce => {
                let id = self.session.next_packet_id();
                let mut outbound = publish;
                let _ignore = outbound.set_packet_id(id);
                self.session
                    .start(id, AwaitedAck::PublishAck, outbound, self.max_retries())
                    .await
                    .map(|_ack| ())
            }
            QoS::ExactOnce => {
                let id = self.session.next_packet_id();
                let mut outbound = publish;
                let _ignore = outbound.set_packet_id(id);
                self.session
                    .start(id, AwaitedAck::PublishReceived, outbound, self.max_retries())
                    .await?;
                let release = v5::PublishReleasePacket::new(id);
                self.session
                    .start(id, AwaitedAck::PublishComplete, release, self.max_retries())
                    .await
                    .map(|_ack| ())
            }
        }
    }

    const fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Idempotent close. `graceful` is `true` when the close was caused by a received
    /// `DISCONNECT` or a clean EOF, suppressing the will dispatch.
    pub async fn close(&self, graceful: bool) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.broker.remove_client(&self.client_id).await;
        self.broker.subscriptions().unsubscribe_all(&self.client_id);
        if !graceful {
            if let Some(will) = &self.will {
                self.broker.dispatch_will(will_to_publish(will)).await;
            }
        }
        self.session.shutdown().await;
    }
}

fn will_to_publish(will: &Will) -> v5::PublishPacket {
    let mut publish = v5::PublishPacket::new(&will.topic, will.qos, &will.message)
        .unwrap_or_else(|_err| v5::PublishPacket::default());
    let _ignore = publish.set_retain(will.retain);
    *publish.properties_mut() = will.properties.clone();
    publish
}
