// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! The async client: runs the `CONNECT`/`AUTH` handshake, then hands off to a background
//! receive loop and a keep-alive ticker while the caller drives `subscribe()`/`publish()`/
//! `unsubscribe()`/`disconnect()` through a shared [`Session`].

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use codec::v5::Property;
use codec::{
    v5, BinaryData, ByteArray, DecodeError, DecodePacket, EncodePacket, FixedHeader, PacketType,
    ProtocolLevel, QoS, StringData,
};
use tokio::sync::mpsc;
use tokio::time::interval;

use crate::connect_options::{Auth, ConnectOptions};
use crate::error::{Error, ErrorKind};
use crate::session::{AckValue, AwaitedAck, Session};
use crate::stream::{ReadStream, Stream};

/// An application message delivered from a subscribed topic.
#[derive(Debug, Clone)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

impl From<&v5::PublishPacket> for Message {
    fn from(publish: &v5::PublishPacket) -> Self {
        Self {
            topic: publish.topic().to_owned(),
            payload: publish.message().to_vec(),
            qos: publish.qos(),
            retain: publish.retain(),
        }
    }
}

const ACK_RETRIES: u32 = 3;

/// A connected MQTT 5 client.
#[derive(Clone)]
pub struct AsyncClient {
    session: Arc<Session>,
}

impl AsyncClient {
    /// Connect to the broker at `options.address()`, run the handshake, and spawn the
    /// background receive loop and keep-alive ticker.
    ///
    /// Returns the client handle and a channel that yields every inbound application message.
    ///
    /// # Errors
    ///
    /// Returns error if the TCP/TLS connection fails, the handshake is rejected, or the broker's
    /// first frame is not `CONNACK`.
    pub async fn connect(options: &ConnectOptions) -> Result<(Self, mpsc::Receiver<Message>), Error> {
        let mut stream = Stream::new(options.address(), options.connect_type()).await?;
        handshake(&mut stream, options).await?;

        let (read_half, write_half) = stream.into_split();
        let ack_timeout = Duration::from_secs(10);
        let retry_delay = Duration::from_millis(500);
        let session = Arc::new(Session::new(write_half, ack_timeout, retry_delay));
        let (tx, rx) = mpsc::channel(64);

        tokio::spawn(receive_loop(Arc::clone(&session), read_half, tx));
        tokio::spawn(ping_loop(Arc::clone(&session), options.keep_alive()));

        Ok((Self { session }, rx))
    }

    /// # Errors
    ///
    /// Returns error if the topic is invalid, the ack times out after retries, or `topics` is
    /// empty.
    pub async fn subscribe(&self, topics: &[(&str, QoS)]) -> Result<Vec<v5::ReasonCode>, Error> {
        let id = self.session.next_packet_id();
        let mut iter = topics.iter();
        let (first_topic, first_qos) = iter
            .next()
            .ok_or_else(|| Error::new(ErrorKind::EncodeError, "subscribe: topics must not be empty"))?;
        let mut packet = v5::SubscribePacket::new(first_topic, *first_qos, id)?;
        if topics.len() > 1 {
            let mut all = vec![v5::SubscribeTopic::new(first_topic, *first_qos)?];
            for (topic, qos) in iter {
                all.push(v5::SubscribeTopic::new(topic, *qos)?);
            }
            packet.set_topics(&all);
        }

        let value = self
            .session
            .start(id, AwaitedAck::SubscribeAck, packet, ACK_RETRIES)
            .await?;
        let AckValue::SubscribeAck(ack) = value else {
            return Err(Error::new(ErrorKind::ChannelError, "subscribe: unexpected ack"));
        };
        Ok(ack.reasons().to_vec())
    }

    /// # Errors
    ///
    /// Returns error if a topic is invalid or the ack times out after retries.
    pub async fn unsubscribe(&self, topics: &[&str]) -> Result<Vec<v5::ReasonCode>, Error> {
        let id = self.session.next_packet_id();
        let packet = v5::UnsubscribePacket::with_topics(topics, id)?;

        let value = self
            .session
            .start(id, AwaitedAck::UnsubscribeAck, packet, ACK_RETRIES)
            .await?;
        let AckValue::UnsubscribeAck(ack) = value else {
            return Err(Error::new(ErrorKind::ChannelError, "unsubscribe: unexpected ack"));
        };
        Ok(ack.reasons().to_vec())
    }

    /// Publish `message` to `topic` at `qos`, waiting for `PUBACK`/`PUBCOMP` on `QoS` 1/2.
    ///
    /// `retain` sets the `RETAIN` bit, asking the broker to hold this message as the topic's
    /// retained message (or, if `message` is empty, to clear any retained message it holds).
    ///
    /// # Errors
    ///
    /// Returns error if the topic is invalid or the delivery flow times out after retries.
    pub async fn publish(&self, topic: &str, qos: QoS, retain: bool, message: &[u8]) -> Result<(), Error> {
        match qos {
            QoS::AtMostOnce => {
                let mut packet = v5::PublishPacket::new(topic, qos, message)?;
                packet.set_retain(retain);
                self.session.write(&packet).await
            }
            QoS::AtLeastOnce => {
                let id = self.session.next_packet_id();
                let mut packet = v5::PublishPacket::new(topic, qos, message)?;
                packet.set_packet_id(id);
                packet.set_retain(retain);
                match self
                    .session
                    .start(id, AwaitedAck::PublishAck, packet, ACK_RETRIES)
                    .await?
                {
                    AckValue::PublishAck(..) => Ok(()),
                    _ => Err(Error::new(ErrorKind::ChannelError, "publish: unexpected ack")),
                }
            }
            QoS::ExactOnce => {
                let id = self.session.next_packet_id();
                let mut packet = v5::PublishPacket::new(topic, qos, message)?;
                packet.set_packet_id(id);
                packet.set_retain(retain);
                match self
                    .session
                    .start(id, AwaitedAck::PublishReceived, packet, ACK_RETRIES)
                    .await?
                {
                    AckValue::PublishReceived(..) => {
                        let release = v5::PublishReleasePacket::new(id);
                        match self
                            .session
                            .start(id, AwaitedAck::PublishComplete, release, ACK_RETRIES)
                            .await?
                        {
                            AckValue::PublishComplete(..) => Ok(()),
                            _ => Err(Error::new(ErrorKind::ChannelError, "publish: unexpected ack")),
                        }
                    }
                    _ => Err(Error::new(ErrorKind::ChannelError, "publish: unexpected ack")),
                }
            }
        }
    }

    /// # Errors
    ///
    /// Returns error if the underlying socket write fails.
    pub async fn disconnect(&self) -> Result<(), Error> {
        let mut packet = v5::DisconnectPacket::new();
        packet.set_reason_code(v5::ReasonCode::Success);
        let result = self.session.write(&packet).await;
        self.session.shutdown().await;
        result
    }
}

async fn handshake(stream: &mut Stream, options: &ConnectOptions) -> Result<(), Error> {
    let mut connect = v5::ConnectPacket::new(options.client_id())?;
    connect.set_protcol_level(ProtocolLevel::V5);
    connect.set_keep_alive(u16::try_from(options.keep_alive().as_secs()).unwrap_or(u16::MAX));
    connect.set_clean_session(true);

    if let Some(will) = options.will() {
        connect.set_will(true);
        connect.set_will_qos(will.qos);
        connect.set_will_retain(will.retain);
        connect.set_will_topic(&will.topic)?;
        connect.set_will_message(&will.message)?;
    }

    match options.auth() {
        Auth::None => {}
        Auth::Basic(basic) => {
            let credentials = format!("{}:{}", basic.username, basic.password);
            let token = BASE64.encode(credentials);
            connect
                .properties_mut()
                .push(Property::AuthenticationMethod(StringData::from("basic")?))?;
            connect
                .properties_mut()
                .push(Property::AuthenticationData(BinaryData::from_slice(token.as_bytes())?))?;
        }
        Auth::Login(login) => {
            connect
                .properties_mut()
                .push(Property::AuthenticationMethod(StringData::from("login")?))?;
            connect.properties_mut().push(Property::AuthenticationData(
                BinaryData::from_slice(login.username.as_bytes())?,
            ))?;
        }
    }

    write_packet(stream, &connect).await?;

    if let Auth::Login(login) = options.auth() {
        let frame = read_frame(stream).await?;
        let mut ba = ByteArray::new(&frame);
        let fixed_header = FixedHeader::decode(&mut ba)?;
        if fixed_header.packet_type() != PacketType::Auth {
            return Err(Error::new(ErrorKind::RejectedError, "handshake: expected AUTH challenge"));
        }
        let challenge = v5::AuthPacket::decode(&mut ba)?;
        if challenge.reason_code() != v5::ReasonCode::ContinueAuthentication {
            return Err(Error::new(ErrorKind::RejectedError, "handshake: unexpected AUTH reason code"));
        }

        let mut reply = v5::AuthPacket::new();
        reply.set_reason_code(v5::ReasonCode::ContinueAuthentication);
        reply
            .properties_mut()
            .push(Property::AuthenticationMethod(StringData::from("login")?))?;
        reply.properties_mut().push(Property::AuthenticationData(BinaryData::from_slice(
            login.password.as_bytes(),
        )?))?;
        write_packet(stream, &reply).await?;
    }

    let frame = read_frame(stream).await?;
    let mut ba = ByteArray::new(&frame);
    let fixed_header = FixedHeader::decode(&mut ba)?;
    if fixed_header.packet_type() != PacketType::ConnectAck {
        return Err(Error::new(ErrorKind::RejectedError, "handshake: expected CONNACK"));
    }
    let ack = v5::ConnectAckPacket::decode(&mut ba)?;
    if ack.reason_code() != v5::ReasonCode::Success {
        return Err(Error::new(ErrorKind::RejectedError, "handshake: broker rejected CONNECT"));
    }
    Ok(())
}

async fn write_packet<P: EncodePacket>(stream: &mut Stream, packet: &P) -> Result<(), Error> {
    let mut buf = Vec::new();
    packet.encode(&mut buf)?;
    stream.write_all(&buf).await
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
                "read_frame: broker closed before a full frame arrived",
            ));
        }
    }
}

/// Same framing loop as `read_frame`, but over the receive loop's split-off read half.
async fn read_frame_half(stream: &mut ReadStream) -> Result<Vec<u8>, Error> {
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
                "read_frame: broker closed before a full frame arrived",
            ));
        }
    }
}

async fn ping_loop(session: Arc<Session>, keep_alive: Duration) {
    if keep_alive.is_zero() {
        return;
    }
    let mut ticker = interval(keep_alive);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if session.write(&v5::PingRequestPacket::new()).await.is_err() {
            return;
        }
    }
}

async fn receive_loop(session: Arc<Session>, mut stream: ReadStream, messages: mpsc::Sender<Message>) {
    loop {
        let frame = read_frame_half(&mut stream).await;
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                log::debug!("client: receive loop stopping: {err}");
                return;
            }
        };

        let mut ba = ByteArray::new(&frame);
        let fixed_header = match FixedHeader::decode(&mut ba) {
            Ok(fixed_header) => fixed_header,
            Err(err) => {
                log::warn!("client: malformed frame: {err:?}");
                continue;
            }
        };

        if let Err(err) = dispatch(&session, &messages, fixed_header.packet_type(), &mut ba).await {
            log::warn!("client: error handling {:?}: {err}", fixed_header.packet_type());
        }
    }
}

async fn dispatch(
    session: &Arc<Session>,
    messages: &mpsc::Sender<Message>,
    packet_type: PacketType,
    ba: &mut ByteArray,
) -> Result<(), Error> {
    match packet_type {
        PacketType::ConnectAck => {}
        PacketType::PingResponse => {
            v5::PingResponsePacket::decode(ba)?;
        }
        PacketType::SubscribeAck => {
            let ack = v5::SubscribeAckPacket::decode(ba)?;
            let id = ack.packet_id();
            drop(session.meet(id, AckValue::SubscribeAck(ack)));
        }
        PacketType::UnsubscribeAck => {
            let ack = v5::UnsubscribeAckPacket::decode(ba)?;
            let id = ack.packet_id();
            drop(session.meet(id, AckValue::UnsubscribeAck(ack)));
        }
        PacketType::PublishAck => {
            let ack = v5::PublishAckPacket::decode(ba)?;
            let id = ack.packet_id();
            drop(session.meet(id, AckValue::PublishAck(ack)));
        }
        PacketType::PublishReceived => {
            let ack = v5::PublishReceivedPacket::decode(ba)?;
            let id = ack.packet_id();
            drop(session.meet(id, AckValue::PublishReceived(ack)));
        }
        PacketType::PublishRelease => {
            let release = v5::PublishReleasePacket::decode(ba)?;
            let id = release.packet_id();
            if let Some(publish) = session.delete_message(id) {
                let _ignore = messages.send(Message::from(&publish)).await;
            }
            let mut complete = v5::PublishCompletePacket::new(id);
            complete.set_reason_code(v5::ReasonCode::Success);
            session.write(&complete).await?;
        }
        PacketType::PublishComplete => {
            let ack = v5::PublishCompletePacket::decode(ba)?;
            let id = ack.packet_id();
            drop(session.meet(id, AckValue::PublishComplete(ack)));
        }
        PacketType::Publish { .. } => {
            let publish = v5::PublishPacket::decode(ba)?;
            deliver(session, messages, publish).await?;
        }
        PacketType::Disconnect => {
            let disconnect = v5::DisconnectPacket::decode(ba)?;
            log::info!("client: broker sent DISCONNECT: {:?}", disconnect.reason_code());
        }
        other => {
            log::warn!("client: unexpected packet type from broker: {other:?}");
        }
    }
    Ok(())
}

async fn deliver(
    session: &Arc<Session>,
    messages: &mpsc::Sender<Message>,
    publish: v5::PublishPacket,
) -> Result<(), Error> {
    match publish.qos() {
        QoS::AtMostOnce => {
            let _ignore = messages.send(Message::from(&publish)).await;
        }
        QoS::AtLeastOnce => {
            let id = publish.packet_id();
            let _ignore = messages.send(Message::from(&publish)).await;
            let mut ack = v5::PublishAckPacket::new(id);
            ack.set_reason_code(v5::ReasonCode::Success);
            session.write(&ack).await?;
        }
        QoS::ExactOnce => {
            let id = publish.packet_id();
            session.store_message(publish);
            let mut received = v5::PublishReceivedPacket::new(id);
            received.set_reason_code(v5::ReasonCode::Success);
            session.write(&received).await?;
        }
    }
    Ok(())
}
