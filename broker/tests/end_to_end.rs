// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Exercises the broker and client library together over real sockets: QoS fan-out, retained
//! messages, QoS 2 handshakes, will dispatch on an abnormal close, and authenticated connects.

use std::net::SocketAddr;
use std::time::Duration;

use broker::config::{Config, LoginAuthConfig};
use broker::Broker;
use client::async_client::AsyncClient;
use client::connect_options::{Auth, ConnectOptions, LoginAuth, Will};
use codec::{v5, ByteArray, DecodePacket, EncodePacket, FixedHeader, PacketType, ProtocolLevel, QoS};
use tokio::net::TcpListener;
use tokio::time::timeout;

/// Bind an ephemeral port, spawn the broker's accept loop on it, and return the address clients
/// should dial. The broker and its event channel are leaked onto a background task for the
/// duration of the test process; nothing but the socket address is needed by callers.
async fn spawn_broker(config: Config) -> SocketAddr {
    let (broker, mut events) = Broker::new(config);
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local_addr");
    tokio::spawn(async move {
        let _ignore = broker.serve_on(listener).await;
    });
    tokio::spawn(async move { while events.recv().await.is_some() {} });
    addr
}

fn connect_options(addr: SocketAddr) -> ConnectOptions {
    let mut options = ConnectOptions::new(addr).expect("resolve loopback address");
    options.set_keep_alive(Duration::from_secs(30));
    options
}

async fn recv_message(messages: &mut tokio::sync::mpsc::Receiver<client::async_client::Message>) -> client::async_client::Message {
    timeout(Duration::from_secs(5), messages.recv())
        .await
        .expect("message arrived before timeout")
        .expect("message channel stayed open")
}

#[tokio::test]
async fn qos0_round_trip() {
    let addr = spawn_broker(Config::default()).await;

    let (a, mut a_messages) = AsyncClient::connect(&connect_options(addr)).await.expect("A connects");
    a.subscribe(&[("gqtt/example", QoS::AtMostOnce)]).await.expect("A subscribes");

    let (b, _b_messages) = AsyncClient::connect(&connect_options(addr)).await.expect("B connects");
    b.publish("gqtt/example", QoS::AtMostOnce, false, b"hello")
        .await
        .expect("B publishes");

    let message = recv_message(&mut a_messages).await;
    assert_eq!(message.topic, "gqtt/example");
    assert_eq!(message.payload, b"hello");
    assert_eq!(message.qos, QoS::AtMostOnce);

    assert!(timeout(Duration::from_millis(200), a_messages.recv()).await.is_err());
}

#[tokio::test]
async fn qos_downgrade_on_fan_out() {
    let addr = spawn_broker(Config::default()).await;

    let (a, mut a_messages) = AsyncClient::connect(&connect_options(addr)).await.expect("A connects");
    a.subscribe(&[("gqtt/example", QoS::AtMostOnce)]).await.expect("A subscribes");

    let (b, _b_messages) = AsyncClient::connect(&connect_options(addr)).await.expect("B connects");
    b.publish("gqtt/example", QoS::ExactOnce, false, b"x")
        .await
        .expect("B publishes at QoS 2");

    let message = recv_message(&mut a_messages).await;
    assert_eq!(message.qos, QoS::AtMostOnce);
    assert_eq!(message.payload, b"x");
}

#[tokio::test]
async fn retained_delivery_and_clearing() {
    let addr = spawn_broker(Config::default()).await;

    let (b, _b_messages) = AsyncClient::connect(&connect_options(addr)).await.expect("B connects");
    b.publish("t", QoS::AtMostOnce, true, b"r1").await.expect("B publishes retained r1");

    let (a, mut a_messages) = AsyncClient::connect(&connect_options(addr)).await.expect("A connects");
    a.subscribe(&[("t", QoS::AtMostOnce)]).await.expect("A subscribes");

    let message = recv_message(&mut a_messages).await;
    assert_eq!(message.payload, b"r1");
    assert!(message.retain);

    b.publish("t", QoS::AtMostOnce, true, b"").await.expect("B clears the retained message");

    let (c, mut c_messages) = AsyncClient::connect(&connect_options(addr)).await.expect("C connects");
    c.subscribe(&[("t", QoS::AtMostOnce)]).await.expect("C subscribes");
    assert!(
        timeout(Duration::from_millis(300), c_messages.recv()).await.is_err(),
        "C must not receive a retained message once it has been cleared"
    );
}

#[tokio::test]
async fn qos2_handshake_delivers_exactly_once() {
    let addr = spawn_broker(Config::default()).await;

    let (a, mut a_messages) = AsyncClient::connect(&connect_options(addr)).await.expect("A connects");
    a.subscribe(&[("gqtt/q2", QoS::ExactOnce)]).await.expect("A subscribes QoS 2");

    let (b, _b_messages) = AsyncClient::connect(&connect_options(addr)).await.expect("B connects");
    b.publish("gqtt/q2", QoS::ExactOnce, false, b"q2")
        .await
        .expect("B publishes QoS 2");

    let message = recv_message(&mut a_messages).await;
    assert_eq!(message.payload, b"q2");
    assert_eq!(message.qos, QoS::ExactOnce);

    assert!(timeout(Duration::from_millis(300), a_messages.recv()).await.is_err());
}

#[tokio::test]
async fn will_dispatched_on_abnormal_close() {
    let addr = spawn_broker(Config::default()).await;

    let (a, mut a_messages) = AsyncClient::connect(&connect_options(addr)).await.expect("A connects");
    a.subscribe(&[("some/will", QoS::AtMostOnce)]).await.expect("A subscribes to will topic");

    {
        let mut options = connect_options(addr);
        options.set_will(Will {
            topic: "some/will".to_owned(),
            message: b"bye".to_vec(),
            qos: QoS::AtMostOnce,
            retain: false,
        });
        // B connects and is dropped without ever sending DISCONNECT; the TCP stream's
        // destructor closes the socket, which the broker must observe as an abnormal close.
        let (_b, _b_messages) = AsyncClient::connect(&options).await.expect("B connects with a will");
    }

    let message = recv_message(&mut a_messages).await;
    assert_eq!(message.topic, "some/will");
    assert_eq!(message.payload, b"bye");
}

#[tokio::test]
async fn authenticated_login_connect() {
    let mut config = Config::default();
    config.login_auth = Some(LoginAuthConfig {
        username: "admin".to_owned(),
        password: "admin".to_owned(),
    });
    let addr = spawn_broker(config).await;

    let mut options = connect_options(addr);
    options.set_auth(Auth::Login(LoginAuth {
        username: "admin".to_owned(),
        password: "admin".to_owned(),
    }));

    // `AsyncClient::connect` drives the two-round login exchange itself (CONNECT ->
    // AUTH(ContinueAuthentication) -> AUTH -> CONNACK); success here exercises the full
    // round trip described for the scenario.
    let (client, _messages) = AsyncClient::connect(&options).await.expect("login handshake succeeds");
    client.disconnect().await.expect("disconnect after authenticated connect");
}

#[tokio::test]
async fn authenticated_login_connect_wrong_password_is_rejected() {
    let mut config = Config::default();
    config.login_auth = Some(LoginAuthConfig {
        username: "admin".to_owned(),
        password: "admin".to_owned(),
    });
    let addr = spawn_broker(config).await;

    let mut options = connect_options(addr);
    options.set_auth(Auth::Login(LoginAuth {
        username: "admin".to_owned(),
        password: "wrong".to_owned(),
    }));

    assert!(AsyncClient::connect(&options).await.is_err());
}

/// Confirms a QoS>0 subscriber never sees duplicate deliveries when the fixed-header `DUP`
/// bit or broker/client retry logic is exercised: two independent messages stay independent.
#[tokio::test]
async fn packet_ids_do_not_collide_across_concurrent_flows() {
    let addr = spawn_broker(Config::default()).await;

    let (a, mut a_messages) = AsyncClient::connect(&connect_options(addr)).await.expect("A connects");
    a.subscribe(&[("gqtt/multi", QoS::AtLeastOnce)]).await.expect("A subscribes");

    let (b, _b_messages) = AsyncClient::connect(&connect_options(addr)).await.expect("B connects");
    for payload in [&b"one"[..], &b"two"[..], &b"three"[..]] {
        b.publish("gqtt/multi", QoS::AtLeastOnce, false, payload)
            .await
            .expect("publish succeeds");
    }

    let mut seen = Vec::new();
    for _ in 0..3 {
        seen.push(recv_message(&mut a_messages).await.payload);
    }
    assert_eq!(seen, vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]);
}

/// Reads one complete frame (fixed header + payload) off a raw socket, returning the decoded
/// header alongside the full frame bytes (header included) for the caller to re-decode the
/// packet body with.
async fn read_frame(stream: &mut tokio::net::TcpStream) -> (FixedHeader, Vec<u8>) {
    use tokio::io::AsyncReadExt;
    let mut frame = Vec::new();
    let fixed_header = loop {
        let mut peek = ByteArray::new(&frame);
        match FixedHeader::decode(&mut peek) {
            Ok(header) => break header,
            Err(_) => {
                let mut chunk = [0_u8; 256];
                let n = stream.read(&mut chunk).await.expect("read frame bytes");
                assert!(n > 0, "broker closed before completing a frame");
                frame.extend_from_slice(&chunk[..n]);
            }
        }
    };
    let frame_len = fixed_header.bytes() + fixed_header.remaining_length();
    while frame.len() < frame_len {
        let mut chunk = [0_u8; 256];
        let n = stream.read(&mut chunk).await.expect("read rest of frame");
        assert!(n > 0, "broker closed mid-frame");
        frame.extend_from_slice(&chunk[..n]);
    }
    (fixed_header, frame)
}

async fn raw_connect(stream: &mut tokio::net::TcpStream, client_id: &str) {
    use tokio::io::AsyncWriteExt;
    let mut connect = v5::ConnectPacket::new(client_id).expect("valid client id");
    connect.set_protcol_level(ProtocolLevel::V5);
    connect.set_clean_session(true);
    let mut buf = Vec::new();
    connect.encode(&mut buf).expect("encode CONNECT");
    stream.write_all(&buf).await.expect("write CONNECT");

    let (header, frame) = read_frame(stream).await;
    assert_eq!(header.packet_type(), PacketType::ConnectAck);
    let mut ba = ByteArray::new(&frame);
    let _discard = FixedHeader::decode(&mut ba).expect("re-decode fixed header");
    let ack = v5::ConnectAckPacket::decode(&mut ba).expect("decode CONNACK");
    assert_eq!(ack.reason_code(), v5::ReasonCode::Success);
}

/// Hand-rolls the CONNECT/CONNACK exchange over a raw socket to confirm the wire-level
/// handshake the client library builds on top of, independent of `AsyncClient`.
#[tokio::test]
async fn raw_connect_handshake_succeeds() {
    let addr = spawn_broker(Config::default()).await;
    let mut stream = tokio::net::TcpStream::connect(addr).await.expect("raw connect");
    raw_connect(&mut stream, "raw-client-1").await;
}

/// A SUBSCRIBE naming a filter with a wildcard in an invalid position (`"foo#"`) must not be
/// dropped wholesale: the codec accepts it at decode (syntax validation is the subscription
/// table's job, not the wire format's), and the broker replies with a SUBACK carrying
/// `UnspecifiedError` for that filter while leaving the connection open.
///
/// The filter is hand-assembled rather than built via `SubscribeTopic::new`, which validates
/// wildcard placement and would reject it before it ever reached the wire.
#[tokio::test]
async fn malformed_subscribe_filter_gets_unspecified_error_reason() {
    use tokio::io::AsyncWriteExt;

    let addr = spawn_broker(Config::default()).await;
    let mut stream = tokio::net::TcpStream::connect(addr).await.expect("raw connect");
    raw_connect(&mut stream, "raw-client-2").await;

    let topic = "foo#";
    let mut payload = Vec::new();
    payload.extend_from_slice(&1u16.to_be_bytes()); // packet id
    payload.push(0x00); // empty property table
    #[allow(clippy::cast_possible_truncation)]
    payload.extend_from_slice(&(topic.len() as u16).to_be_bytes());
    payload.extend_from_slice(topic.as_bytes());
    payload.push(0x00); // subscription options: QoS 0, no flags
    #[allow(clippy::cast_possible_truncation)]
    let mut subscribe_frame = vec![0x82, payload.len() as u8];
    subscribe_frame.extend_from_slice(&payload);
    stream.write_all(&subscribe_frame).await.expect("write SUBSCRIBE");

    let (header, frame) = read_frame(&mut stream).await;
    assert_eq!(header.packet_type(), PacketType::SubscribeAck);
    let mut ba = ByteArray::new(&frame);
    let _discard = FixedHeader::decode(&mut ba).expect("re-decode fixed header");
    let suback = v5::SubscribeAckPacket::decode(&mut ba).expect("decode SUBACK");
    assert_eq!(suback.reasons().to_vec(), vec![v5::ReasonCode::UnspecifiedError]);

    // The connection must still be alive: a PINGREQ still gets a PINGRESP.
    let mut ping_buf = Vec::new();
    v5::PingRequestPacket::default()
        .encode(&mut ping_buf)
        .expect("encode PINGREQ");
    stream.write_all(&ping_buf).await.expect("write PINGREQ");
    let (header, _frame) = read_frame(&mut stream).await;
    assert_eq!(header.packet_type(), PacketType::PingResponse);
}
