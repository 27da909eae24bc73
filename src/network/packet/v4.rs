//! 3.1.1 协议版本报文

use bytes::{Buf, BytesMut};

pub use connack::*;
pub use connect::*;
pub use disconnect::*;
pub use pingreq::*;
pub use pingresp::*;
pub use puback::*;
pub use pubcomp::*;
pub use publish::*;
pub use pubrec::*;
pub use pubrel::*;
pub use suback::*;
pub use subscribe::*;
pub use unsuback::*;
pub use unsubscribe::*;

use super::{Error, FixedHeader, PacketType};

pub mod connack;
pub mod connect;
pub mod disconnect;
pub mod pingreq;
pub mod pingresp;
pub mod puback;
pub mod pubcomp;
pub mod publish;
pub mod pubrec;
pub mod pubrel;
pub mod suback;
pub mod subscribe;
pub mod unsuback;
pub mod unsubscribe;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck(PubAck),
    PubRec(PubRec),
    PubRel(PubRel),
    PubComp(PubComp),
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck(UnsubAck),
    PingReq,
    PingResp,
    Disconnect,
}

impl Packet {
    /// 从缓冲区中解析出一个完整报文
    /// 数据不足时返回 InsufficientBytes，由调用方补齐后重试
    pub fn read(stream: &mut BytesMut, max_packet_size: usize) -> Result<Self, Error> {
        let stream_len = stream.len();
        let fixed_header = FixedHeader::read_from(stream.iter())?;

        let packet_len = fixed_header.packet_len();
        if packet_len > max_packet_size {
            return Err(Error::PayloadTooLarge);
        }
        if stream_len < packet_len {
            return Err(Error::InsufficientBytes(packet_len - stream_len));
        }

        // 根据固定头给出的长度信息，取出整个报文字节（包含报文头）
        // split_to 方法会更新 stream
        let packet = stream.split_to(packet_len);

        // 报文类型
        let packet_type = fixed_header.packet_type()?;
        // 没有负载的 packet 类型，获取到报文头后，可以直接返回
        if fixed_header.remaining_len == 0 {
            return match packet_type {
                PacketType::PingReq => Ok(Packet::PingReq),
                PacketType::PingResp => Ok(Packet::PingResp),
                PacketType::Disconnect => Ok(Packet::Disconnect),
                _ => Err(Error::PayloadRequired),
            };
        }

        // 完整的报文
        let mut stream = packet.freeze();
        // 去掉固定头的报文
        let variable_header_index = fixed_header.fixed_header_len;
        stream.advance(variable_header_index);

        let packet = match packet_type {
            PacketType::Connect => Packet::Connect(Connect::read(stream)?),
            PacketType::ConnAck => Packet::ConnAck(ConnAck::read(&fixed_header, stream)?),
            PacketType::Publish => Packet::Publish(Publish::read(&fixed_header, stream)?),
            PacketType::PubAck => Packet::PubAck(PubAck::read(&fixed_header, stream)?),
            PacketType::PubRec => Packet::PubRec(PubRec::read(&fixed_header, stream)?),
            PacketType::PubRel => Packet::PubRel(PubRel::read(&fixed_header, stream)?),
            PacketType::PubComp => Packet::PubComp(PubComp::read(&fixed_header, stream)?),
            PacketType::Subscribe => Packet::Subscribe(Subscribe::read(&fixed_header, stream)?),
            PacketType::SubAck => Packet::SubAck(SubAck::read(&fixed_header, stream)?),
            PacketType::Unsubscribe => {
                Packet::Unsubscribe(Unsubscribe::read(&fixed_header, stream)?)
            }
            PacketType::UnsubAck => Packet::UnsubAck(UnsubAck::read(&fixed_header, stream)?),
            _ => return Err(Error::UnexpectedPacketType),
        };

        Ok(packet)
    }

    pub fn write(&self, stream: &mut BytesMut) -> Result<(), Error> {
        match self {
            Packet::Connect(connect) => connect.write(stream),
            Packet::ConnAck(ack) => ack.write(stream),
            Packet::Publish(publish) => publish.write(stream),
            Packet::PubAck(puback) => puback.write(stream),
            Packet::PubRec(pubrec) => pubrec.write(stream),
            Packet::PubRel(pubrel) => pubrel.write(stream),
            Packet::PubComp(pubcomp) => pubcomp.write(stream),
            Packet::Subscribe(subscribe) => subscribe.write(stream),
            Packet::SubAck(ack) => ack.write(stream),
            Packet::Unsubscribe(unsubscribe) => unsubscribe.write(stream),
            Packet::UnsubAck(ack) => ack.write(stream),
            Packet::PingReq => PingReq.write(stream),
            Packet::PingResp => PingResp.write(stream),
            Packet::Disconnect => Disconnect.write(stream),
        }
    }

    #[inline]
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Connect(_) => PacketType::Connect,
            Packet::ConnAck(_) => PacketType::ConnAck,
            Packet::Publish(_) => PacketType::Publish,
            Packet::PubAck(_) => PacketType::PubAck,
            Packet::PubRec(_) => PacketType::PubRec,
            Packet::PubRel(_) => PacketType::PubRel,
            Packet::PubComp(_) => PacketType::PubComp,
            Packet::Subscribe(_) => PacketType::Subscribe,
            Packet::SubAck(_) => PacketType::SubAck,
            Packet::Unsubscribe(_) => PacketType::Unsubscribe,
            Packet::UnsubAck(_) => PacketType::UnsubAck,
            Packet::PingReq => PacketType::PingReq,
            Packet::PingResp => PacketType::PingResp,
            Packet::Disconnect => PacketType::Disconnect,
        }
    }

    /// 报文携带的包 id，QoS0 / 无 id 报文返回 None
    pub fn packet_id(&self) -> Option<u16> {
        match self {
            Packet::Publish(publish) if publish.qos != super::QoS::AtMostOnce => {
                Some(publish.packet_id)
            }
            Packet::PubAck(ack) => Some(ack.packet_id),
            Packet::PubRec(ack) => Some(ack.packet_id),
            Packet::PubRel(ack) => Some(ack.packet_id),
            Packet::PubComp(ack) => Some(ack.packet_id),
            Packet::Subscribe(subscribe) => Some(subscribe.packet_id),
            Packet::SubAck(ack) => Some(ack.packet_id),
            Packet::Unsubscribe(unsubscribe) => Some(unsubscribe.packet_id),
            Packet::UnsubAck(ack) => Some(ack.packet_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::{Bytes, BytesMut};

    use crate::network::packet::{Error, QoS};

    use super::*;

    const MAX_PACKET_SIZE: usize = 4096;

    fn round_trip(packet: Packet) {
        let mut stream = BytesMut::new();
        packet.write(&mut stream).unwrap();
        let decoded = Packet::read(&mut stream, MAX_PACKET_SIZE).unwrap();
        assert!(stream.is_empty());
        assert_eq!(decoded, packet);
    }

    #[test]
    fn connect_round_trip() {
        round_trip(Packet::Connect(Connect {
            keep_alive: 60,
            client_id: "c".into(),
            clean_session: true,
            last_will: None,
            login: None,
        }));

        round_trip(Packet::Connect(Connect {
            keep_alive: 0,
            client_id: "device-17".into(),
            clean_session: false,
            last_will: Some(LastWill {
                topic: "will/topic".into(),
                message: Bytes::from_static(b"gone"),
                qos: QoS::AtLeastOnce,
                retain: true,
            }),
            login: Some(Login {
                username: "user".into(),
                password: "pass".into(),
            }),
        }));
    }

    #[test]
    fn publish_round_trip() {
        round_trip(Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: "t".into(),
            packet_id: 0,
            payload: Bytes::from_static(&[0x01]),
        }));

        round_trip(Packet::Publish(Publish {
            dup: true,
            qos: QoS::ExactlyOnce,
            retain: true,
            topic: "a/b/c".into(),
            packet_id: 42,
            payload: Bytes::from_static(b"payload"),
        }));
    }

    #[test]
    fn qos1_publish_wire_format() {
        // 首字节 0x32 = publish + qos1，包 id 跟在 topic 之后
        let publish = Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: false,
            topic: "t".into(),
            packet_id: 1,
            payload: Bytes::from_static(&[0x01]),
        };
        let mut stream = BytesMut::new();
        publish.write(&mut stream).unwrap();
        assert_eq!(&stream[..], &[0x32, 0x06, 0x00, 0x01, b't', 0x00, 0x01, 0x01]);
    }

    #[test]
    fn subscribe_round_trip() {
        round_trip(Packet::Subscribe(Subscribe {
            packet_id: 7,
            filters: vec![
                SubscribeFilter {
                    path: "a/+/c".into(),
                    qos: QoS::AtLeastOnce,
                },
                SubscribeFilter {
                    path: "d/#".into(),
                    qos: QoS::ExactlyOnce,
                },
            ],
        }));
    }

    #[test]
    fn acks_round_trip() {
        round_trip(Packet::ConnAck(ConnAck {
            session_present: true,
            code: ConnectReturnCode::Success,
        }));
        round_trip(Packet::PubAck(PubAck { packet_id: 1 }));
        round_trip(Packet::PubRec(PubRec { packet_id: 2 }));
        round_trip(Packet::PubRel(PubRel { packet_id: 3 }));
        round_trip(Packet::PubComp(PubComp { packet_id: 4 }));
        round_trip(Packet::SubAck(SubAck {
            packet_id: 5,
            return_codes: vec![
                SubscribeReasonCode::Success(QoS::AtLeastOnce),
                SubscribeReasonCode::Failure,
            ],
        }));
        round_trip(Packet::Unsubscribe(Unsubscribe {
            packet_id: 6,
            filters: vec!["a/b".into()],
        }));
        round_trip(Packet::UnsubAck(UnsubAck { packet_id: 7 }));
        round_trip(Packet::PingReq);
        round_trip(Packet::PingResp);
        round_trip(Packet::Disconnect);
    }

    #[test]
    fn connack_bad_return_code() {
        let mut stream = BytesMut::from(&[0x20, 0x02, 0x00, 0xFF][..]);
        assert_eq!(
            Packet::read(&mut stream, MAX_PACKET_SIZE).unwrap_err(),
            Error::InvalidConnectReturnCode(0xFF)
        );
    }

    #[test]
    fn publish_with_wildcard_topic_rejected() {
        let publish = Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: "a/+".into(),
            packet_id: 0,
            payload: Bytes::new(),
        };
        let mut stream = BytesMut::new();
        assert_eq!(publish.write(&mut stream).unwrap_err(), Error::InvalidPublishTopic);
    }

    #[test]
    fn qos1_publish_without_packet_id_rejected() {
        // 0x32 = qos1，包 id 为 0
        let mut stream = BytesMut::from(&[0x32, 0x05, 0x00, 0x01, b't', 0x00, 0x00][..]);
        assert_eq!(
            Packet::read(&mut stream, MAX_PACKET_SIZE).unwrap_err(),
            Error::MissPacketId
        );
    }

    #[test]
    fn invalid_qos_rejected() {
        // qos 位为 3
        let mut stream = BytesMut::from(&[0x36, 0x05, 0x00, 0x01, b't', 0x00, 0x01][..]);
        assert_eq!(
            Packet::read(&mut stream, MAX_PACKET_SIZE).unwrap_err(),
            Error::InvalidQoS(3)
        );
    }

    #[test]
    fn unknown_packet_type_rejected() {
        let mut stream = BytesMut::from(&[0x00, 0x00][..]);
        assert_eq!(
            Packet::read(&mut stream, MAX_PACKET_SIZE).unwrap_err(),
            Error::InvalidPacketType(0)
        );
        let mut stream = BytesMut::from(&[0xF0, 0x00][..]);
        assert_eq!(
            Packet::read(&mut stream, MAX_PACKET_SIZE).unwrap_err(),
            Error::InvalidPacketType(15)
        );
    }

    #[test]
    fn oversize_packet_rejected() {
        let publish = Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: "t".into(),
            packet_id: 0,
            payload: Bytes::from(vec![0u8; 64]),
        };
        let mut stream = BytesMut::new();
        publish.write(&mut stream).unwrap();
        assert_eq!(
            Packet::read(&mut stream, 16).unwrap_err(),
            Error::PayloadTooLarge
        );
    }

    #[test]
    fn insufficient_bytes_reports_missing_count() {
        let publish = Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: "t".into(),
            packet_id: 0,
            payload: Bytes::from_static(b"abc"),
        };
        let mut full = BytesMut::new();
        publish.write(&mut full).unwrap();

        let mut partial = BytesMut::from(&full[..4]);
        assert_eq!(
            Packet::read(&mut partial, MAX_PACKET_SIZE).unwrap_err(),
            Error::InsufficientBytes(full.len() - 4)
        );
    }
}
