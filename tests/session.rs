//! 端到端场景：通过两条管道驱动会话，传输层用内存字节模拟

use bytes::{Bytes, BytesMut};
use mqtt_session::network::packet::{Error as DecodeError, PacketType, QoS};
use mqtt_session::packet::{
    ConnAck, Connect, ConnectReturnCode, Packet, PubAck, PubComp, PubRec, PubRel, Publish, SubAck,
    Subscribe, SubscribeFilter, SubscribeReasonCode,
};
use mqtt_session::{ClientSession, Command, Error, MqttSessionSettings, ServerSession};
use tokio::time::{sleep, Duration};

fn encode(packet: &Packet) -> Bytes {
    let mut buf = BytesMut::new();
    packet.write(&mut buf).unwrap();
    buf.freeze()
}

fn decode(bytes: Bytes) -> Packet {
    let mut buf = BytesMut::from(&bytes[..]);
    Packet::read(&mut buf, 4096).unwrap()
}

fn connect(client_id: &str, keep_alive: u16, clean_session: bool) -> Packet {
    Packet::Connect(Connect {
        keep_alive,
        client_id: client_id.into(),
        clean_session,
        last_will: None,
        login: None,
    })
}

fn publish(qos: QoS, topic: &str, payload: &'static [u8]) -> Packet {
    Packet::Publish(Publish {
        dup: false,
        qos,
        retain: false,
        topic: topic.into(),
        packet_id: 0,
        payload: Bytes::from_static(payload),
    })
}

#[tokio::test]
async fn connect_handshake_carries_token() {
    let session = ClientSession::<&str>::new(MqttSessionSettings::default()).unwrap();
    let mut cmd = session.command_flow().await;
    let mut events = session.event_flow().await;

    cmd.send(Command::new(connect("c", 60, true), "my-token"))
        .await
        .unwrap();

    let wire = decode(cmd.next().await.unwrap());
    match wire {
        Packet::Connect(c) => {
            assert_eq!(c.client_id, "c");
            assert_eq!(c.keep_alive, 60);
            assert!(c.clean_session);
        }
        other => panic!("expected connect on the wire, got {:?}", other),
    }

    events
        .feed(encode(&Packet::ConnAck(ConnAck::new(
            ConnectReturnCode::Success,
            false,
        ))))
        .await
        .unwrap();

    let event = events.next().await.unwrap().unwrap();
    assert!(matches!(event.packet, Packet::ConnAck(_)));
    assert_eq!(event.carry, Some("my-token"));
}

#[tokio::test]
async fn qos1_publish_roundtrip_with_carry() {
    let session = ClientSession::<&str>::new(MqttSessionSettings::default()).unwrap();
    let mut cmd = session.command_flow().await;
    let mut events = session.event_flow().await;

    cmd.send(Command::new(connect("c", 0, true), "t0"))
        .await
        .unwrap();
    cmd.next().await.unwrap();
    events
        .feed(encode(&Packet::ConnAck(ConnAck::new(
            ConnectReturnCode::Success,
            false,
        ))))
        .await
        .unwrap();
    events.next().await.unwrap().unwrap();

    cmd.send(Command::new(publish(QoS::AtLeastOnce, "t", &[0x01]), "k1"))
        .await
        .unwrap();

    // 包 id 由会话分配，从 1 开始
    let wire = decode(cmd.next().await.unwrap());
    match wire {
        Packet::Publish(p) => {
            assert_eq!(p.packet_id, 1);
            assert_eq!(p.qos, QoS::AtLeastOnce);
            assert!(!p.dup);
        }
        other => panic!("expected publish, got {:?}", other),
    }

    events
        .feed(encode(&Packet::PubAck(PubAck { packet_id: 1 })))
        .await
        .unwrap();
    let event = events.next().await.unwrap().unwrap();
    assert!(matches!(event.packet, Packet::PubAck(_)));
    assert_eq!(event.carry, Some("k1"));
}

#[tokio::test(start_paused = true)]
async fn qos2_publish_retransmits_with_dup() {
    let session = ClientSession::<&str>::new(MqttSessionSettings::default()).unwrap();
    let mut cmd = session.command_flow().await;
    let mut events = session.event_flow().await;

    cmd.send(Command::new(connect("c", 0, true), "t0"))
        .await
        .unwrap();
    cmd.next().await.unwrap();
    events
        .feed(encode(&Packet::ConnAck(ConnAck::new(
            ConnectReturnCode::Success,
            false,
        ))))
        .await
        .unwrap();
    events.next().await.unwrap().unwrap();

    cmd.send(Command::new(publish(QoS::ExactlyOnce, "t", b"x"), "k2"))
        .await
        .unwrap();

    let first = decode(cmd.next().await.unwrap());
    match first {
        Packet::Publish(ref p) => {
            assert_eq!(p.packet_id, 1);
            assert!(!p.dup);
        }
        ref other => panic!("expected publish, got {:?}", other),
    }

    // 不应答，等重发定时器到点：同一包 id、dup 置位
    let resent = decode(cmd.next().await.unwrap());
    match resent {
        Packet::Publish(ref p) => {
            assert_eq!(p.packet_id, 1);
            assert!(p.dup);
        }
        ref other => panic!("expected dup publish, got {:?}", other),
    }

    events
        .feed(encode(&Packet::PubRec(PubRec { packet_id: 1 })))
        .await
        .unwrap();
    let rec_event = events.next().await.unwrap().unwrap();
    assert!(matches!(rec_event.packet, Packet::PubRec(_)));
    assert_eq!(rec_event.carry, Some("k2"));

    // PubRec 触发 PubRel（期间可能夹着多余的 dup 重发）
    let mut pubrel_seen = false;
    for _ in 0..4 {
        match decode(cmd.next().await.unwrap()) {
            Packet::PubRel(rel) => {
                assert_eq!(rel.packet_id, 1);
                pubrel_seen = true;
                break;
            }
            Packet::Publish(_) => continue,
            other => panic!("unexpected outbound packet {:?}", other),
        }
    }
    assert!(pubrel_seen);

    events
        .feed(encode(&Packet::PubComp(PubComp { packet_id: 1 })))
        .await
        .unwrap();
    let comp_event = events.next().await.unwrap().unwrap();
    assert!(matches!(comp_event.packet, Packet::PubComp(_)));
    assert_eq!(comp_event.carry, Some("k2"));
}

#[tokio::test(start_paused = true)]
async fn missing_pingresp_fails_both_flows() {
    let session = ClientSession::<()>::new(MqttSessionSettings::default()).unwrap();
    let mut cmd = session.command_flow().await;
    let mut events = session.event_flow().await;

    cmd.send(Command::new(connect("c", 1, true), ()))
        .await
        .unwrap();
    cmd.next().await.unwrap();
    events
        .feed(encode(&Packet::ConnAck(ConnAck::new(
            ConnectReturnCode::Success,
            false,
        ))))
        .await
        .unwrap();
    events.next().await.unwrap().unwrap();

    // 一个 keepalive 周期静默后发出 PingReq
    let ping = cmd.next().await.unwrap();
    assert_eq!(&ping[..], &[0xC0, 0x00]);

    // 再过一个周期没有 PingResp，两条管道一起失败
    let err = events.next().await.unwrap().unwrap_err();
    assert!(matches!(err, Error::PingFailed));
    assert!(events.next().await.is_none());
    assert!(cmd.next().await.is_none());
}

#[tokio::test]
async fn subscribe_carry_round_trip() {
    let session = ClientSession::<u32>::new(MqttSessionSettings::default()).unwrap();
    let mut cmd = session.command_flow().await;
    let mut events = session.event_flow().await;

    cmd.send(Command::new(connect("c", 0, true), 0))
        .await
        .unwrap();
    cmd.next().await.unwrap();
    events
        .feed(encode(&Packet::ConnAck(ConnAck::new(
            ConnectReturnCode::Success,
            false,
        ))))
        .await
        .unwrap();
    events.next().await.unwrap().unwrap();

    cmd.send(Command::new(
        Packet::Subscribe(Subscribe {
            packet_id: 0,
            filters: vec![SubscribeFilter {
                path: "a/b".into(),
                qos: QoS::AtLeastOnce,
            }],
        }),
        77,
    ))
    .await
    .unwrap();

    let wire = decode(cmd.next().await.unwrap());
    let packet_id = match wire {
        Packet::Subscribe(s) => s.packet_id,
        other => panic!("expected subscribe, got {:?}", other),
    };

    events
        .feed(encode(&Packet::SubAck(SubAck {
            packet_id,
            return_codes: vec![SubscribeReasonCode::Success(QoS::AtLeastOnce)],
        })))
        .await
        .unwrap();
    let event = events.next().await.unwrap().unwrap();
    assert!(matches!(event.packet, Packet::SubAck(_)));
    assert_eq!(event.carry, Some(77));
}

#[tokio::test]
async fn client_acks_inbound_qos1_publish_by_command() {
    let session = ClientSession::<()>::new(MqttSessionSettings::default()).unwrap();
    let mut cmd = session.command_flow().await;
    let mut events = session.event_flow().await;

    cmd.send(Command::new(connect("c", 0, true), ()))
        .await
        .unwrap();
    cmd.next().await.unwrap();
    events
        .feed(encode(&Packet::ConnAck(ConnAck::new(
            ConnectReturnCode::Success,
            false,
        ))))
        .await
        .unwrap();
    events.next().await.unwrap().unwrap();

    // 对端推送 QoS1 消息，包 id 由对端选择
    events
        .feed(encode(&Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: false,
            topic: "t".into(),
            packet_id: 5,
            payload: Bytes::from_static(b"m"),
        })))
        .await
        .unwrap();

    let event = events.next().await.unwrap().unwrap();
    match event.packet {
        Packet::Publish(ref p) => assert_eq!(p.packet_id, 5),
        ref other => panic!("expected publish event, got {:?}", other),
    }
    assert_eq!(event.carry, None);

    // 应用用命令给出本地应答
    cmd.send(Command::new(Packet::PubAck(PubAck { packet_id: 5 }), ()))
        .await
        .unwrap();
    assert!(matches!(
        decode(cmd.next().await.unwrap()),
        Packet::PubAck(PubAck { packet_id: 5 })
    ));
}

#[tokio::test]
async fn decode_error_terminates_event_flow() {
    let session = ClientSession::<()>::new(MqttSessionSettings::default()).unwrap();
    let _cmd = session.command_flow().await;
    let mut events = session.event_flow().await;

    // 畸形 ConnAck：返回码 0xFF
    events
        .feed(Bytes::from_static(&[0x20, 0x02, 0x00, 0xFF]))
        .await
        .unwrap();

    let err = events.next().await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        Error::Packet(DecodeError::InvalidConnectReturnCode(0xFF))
    ));
    assert!(events.next().await.is_none());
}

#[tokio::test]
async fn illegal_inbound_direction_fails_flow() {
    let session = ClientSession::<()>::new(MqttSessionSettings::default()).unwrap();
    let _cmd = session.command_flow().await;
    let mut events = session.event_flow().await;

    // 客户端不可能收到 Connect
    events.feed(encode(&connect("x", 0, true))).await.unwrap();

    let err = events.next().await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        Error::IllegalProtocolEvent(PacketType::Connect)
    ));
    assert!(events.next().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn duplicate_disconnect_writes_once() {
    let session = ClientSession::<()>::new(MqttSessionSettings::default()).unwrap();
    let mut cmd = session.command_flow().await;
    let mut events = session.event_flow().await;

    cmd.send(Command::new(connect("c", 0, true), ()))
        .await
        .unwrap();
    cmd.next().await.unwrap();
    events
        .feed(encode(&Packet::ConnAck(ConnAck::new(
            ConnectReturnCode::Success,
            false,
        ))))
        .await
        .unwrap();
    events.next().await.unwrap().unwrap();

    cmd.send(Command::new(Packet::Disconnect, ())).await.unwrap();
    cmd.send(Command::new(Packet::Disconnect, ())).await.unwrap();

    let wire = cmd.next().await.unwrap();
    assert_eq!(&wire[..], &[0xE0, 0x00]);

    // 第二个 Disconnect 没有产生字节：下一段出站字节已经是后续的 Publish
    cmd.send(Command::new(publish(QoS::AtMostOnce, "t", b"x"), ()))
        .await
        .unwrap();
    assert!(matches!(decode(cmd.next().await.unwrap()), Packet::Publish(_)));

    let err = cmd.send(Command::new(Packet::PingResp, ())).await.unwrap_err();
    assert!(matches!(err, Error::IllegalCommand(PacketType::PingResp)));
}

#[tokio::test(start_paused = true)]
async fn clean_session_false_resumes_inflight_publish() {
    let session = ClientSession::<&str>::new(MqttSessionSettings::default()).unwrap();
    let mut cmd = session.command_flow().await;
    let mut events = session.event_flow().await;

    cmd.send(Command::new(connect("c", 0, false), "t0"))
        .await
        .unwrap();
    cmd.next().await.unwrap();
    events
        .feed(encode(&Packet::ConnAck(ConnAck::new(
            ConnectReturnCode::Success,
            false,
        ))))
        .await
        .unwrap();
    events.next().await.unwrap().unwrap();

    cmd.send(Command::new(publish(QoS::AtLeastOnce, "t", b"x"), "k"))
        .await
        .unwrap();
    let wire = decode(cmd.next().await.unwrap());
    assert!(matches!(wire, Packet::Publish(ref p) if p.packet_id == 1 && !p.dup));

    // 传输断开：两个管道一起丢弃
    drop(cmd);
    drop(events);
    sleep(Duration::from_millis(1)).await;

    // 新传输，重新握手
    let mut cmd = session.command_flow().await;
    let mut events = session.event_flow().await;
    cmd.send(Command::new(connect("c", 0, false), "t1"))
        .await
        .unwrap();
    assert!(matches!(decode(cmd.next().await.unwrap()), Packet::Connect(_)));
    events
        .feed(encode(&Packet::ConnAck(ConnAck::new(
            ConnectReturnCode::Success,
            true,
        ))))
        .await
        .unwrap();
    events.next().await.unwrap().unwrap();

    // 在途的 Publish 以 dup 置位重发，包 id 不变
    let resumed = decode(cmd.next().await.unwrap());
    match resumed {
        Packet::Publish(ref p) => {
            assert_eq!(p.packet_id, 1);
            assert!(p.dup);
        }
        ref other => panic!("expected resumed publish, got {:?}", other),
    }

    events
        .feed(encode(&Packet::PubAck(PubAck { packet_id: 1 })))
        .await
        .unwrap();
    let event = events.next().await.unwrap().unwrap();
    assert_eq!(event.carry, Some("k"));
}

#[tokio::test]
async fn server_session_takeover_notifies_watcher() {
    let session = ServerSession::<()>::new(MqttSessionSettings::default()).unwrap();

    // 连接 A 完成握手
    let mut cmd_a = session.command_flow(1).await;
    let mut events_a = session.event_flow(1).await;
    events_a.feed(encode(&connect("c", 0, true))).await.unwrap();
    let event = events_a.next().await.unwrap().unwrap();
    assert!(matches!(event.packet, Packet::Connect(_)));
    cmd_a
        .send(Command::new(
            Packet::ConnAck(ConnAck::new(ConnectReturnCode::Success, false)),
            (),
        ))
        .await
        .unwrap();
    assert!(matches!(decode(cmd_a.next().await.unwrap()), Packet::ConnAck(_)));

    let mut watch = session.watch_client_sessions().await;

    // 同一 client_id 从连接 B 再次连接，A 被挤掉
    let _cmd_b = session.command_flow(2).await;
    let mut events_b = session.event_flow(2).await;
    events_b.feed(encode(&connect("c", 0, true))).await.unwrap();
    let event = events_b.next().await.unwrap().unwrap();
    assert!(matches!(event.packet, Packet::Connect(_)));

    let notice = watch.next().await.unwrap();
    assert_eq!(notice.client_id, "c");

    // A 的两条管道随之关闭
    assert!(events_a.next().await.is_none());
    assert!(cmd_a.next().await.is_none());
}

#[tokio::test]
async fn server_qos2_consumer_dedupes_and_acks_by_command() {
    let session = ServerSession::<()>::new(MqttSessionSettings::default()).unwrap();
    let mut cmd = session.command_flow(1).await;
    let mut events = session.event_flow(1).await;

    events.feed(encode(&connect("c", 0, true))).await.unwrap();
    events.next().await.unwrap().unwrap();
    cmd.send(Command::new(
        Packet::ConnAck(ConnAck::new(ConnectReturnCode::Success, false)),
        (),
    ))
    .await
    .unwrap();
    cmd.next().await.unwrap();

    let incoming = Publish {
        dup: false,
        qos: QoS::ExactlyOnce,
        retain: false,
        topic: "t".into(),
        packet_id: 9,
        payload: Bytes::from_static(b"x"),
    };
    events
        .feed(encode(&Packet::Publish(incoming.clone())))
        .await
        .unwrap();
    let event = events.next().await.unwrap().unwrap();
    assert!(matches!(event.packet, Packet::Publish(_)));

    // 对端重发同一包 id，不再投递
    let mut dup = incoming;
    dup.dup = true;
    events.feed(encode(&Packet::Publish(dup))).await.unwrap();

    // 应用按协议次序应答
    cmd.send(Command::new(Packet::PubRec(PubRec { packet_id: 9 }), ()))
        .await
        .unwrap();
    assert!(matches!(
        decode(cmd.next().await.unwrap()),
        Packet::PubRec(PubRec { packet_id: 9 })
    ));

    events
        .feed(encode(&Packet::PubRel(PubRel { packet_id: 9 })))
        .await
        .unwrap();
    // 重发的 Publish 没有产生事件，下一个事件直接是 PubRel
    let event = events.next().await.unwrap().unwrap();
    assert!(matches!(event.packet, Packet::PubRel(_)));

    cmd.send(Command::new(Packet::PubComp(PubComp { packet_id: 9 }), ()))
        .await
        .unwrap();
    assert!(matches!(
        decode(cmd.next().await.unwrap()),
        Packet::PubComp(PubComp { packet_id: 9 })
    ));
}

#[tokio::test]
async fn server_answers_pingreq_internally() {
    let session = ServerSession::<()>::new(MqttSessionSettings::default()).unwrap();
    let mut cmd = session.command_flow(1).await;
    let mut events = session.event_flow(1).await;

    events.feed(encode(&connect("c", 0, true))).await.unwrap();
    events.next().await.unwrap().unwrap();
    cmd.send(Command::new(
        Packet::ConnAck(ConnAck::new(ConnectReturnCode::Success, false)),
        (),
    ))
    .await
    .unwrap();
    cmd.next().await.unwrap();

    events.feed(Bytes::from_static(&[0xC0, 0x00])).await.unwrap();
    let pong = cmd.next().await.unwrap();
    assert_eq!(&pong[..], &[0xD0, 0x00]);
}

#[tokio::test(start_paused = true)]
async fn server_requires_connect_in_time() {
    let session = ServerSession::<()>::new(MqttSessionSettings::default()).unwrap();
    let _cmd = session.command_flow(1).await;
    let mut events = session.event_flow(1).await;

    // 不发 Connect，等待超时
    let err = events.next().await.unwrap().unwrap_err();
    assert!(matches!(err, Error::ReceiveConnectTimeout));
    assert!(events.next().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn shutdown_rejects_subsequent_commands() {
    let session = ClientSession::<()>::new(MqttSessionSettings::default()).unwrap();
    let cmd = session.command_flow().await;

    session.shutdown().await;
    sleep(Duration::from_millis(1)).await;

    let err = cmd
        .send(Command::new(connect("c", 0, true), ()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SessionClosed));
}
