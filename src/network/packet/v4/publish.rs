use bytes::{BufMut, Bytes, BytesMut};

use crate::network::packet::{self, Error, FixedHeader, QoS};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    /// 是否重新投递
    pub dup: bool,
    /// 服务质量
    pub qos: QoS,
    /// 消息保留
    pub retain: bool,
    /// 主题
    pub topic: String,
    /// 包 id，QoS0 时为 0
    pub packet_id: u16,
    /// 消息负载
    pub payload: Bytes,
}

impl Publish {
    fn len(&self) -> usize {
        let mut len = 2 + self.topic.len();
        if self.qos != QoS::AtMostOnce {
            len += 2;
        }
        len + self.payload.len()
    }

    pub fn read(fixed_header: &FixedHeader, mut stream: Bytes) -> Result<Self, Error> {
        let qos = ((fixed_header.byte1 & 0b0110) >> 1).try_into()?;
        let dup = (fixed_header.byte1 & 0b1000) != 0;
        let retain = (fixed_header.byte1 & 0b0001) != 0;

        let topic = packet::read_string(&mut stream)?;
        // 发布的主题不允许带通配符
        if topic.contains(['+', '#']) {
            return Err(Error::InvalidPublishTopic);
        }

        let packet_id = match qos {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce | QoS::ExactlyOnce => packet::read_u16(&mut stream)?,
        };

        if qos != QoS::AtMostOnce && packet_id == 0 {
            return Err(Error::MissPacketId);
        }

        Ok(Self {
            dup,
            qos,
            retain,
            topic,
            packet_id,
            payload: stream,
        })
    }

    pub fn write(&self, stream: &mut BytesMut) -> Result<(), Error> {
        if self.topic.contains(['+', '#']) {
            return Err(Error::InvalidPublishTopic);
        }

        let dup = self.dup as u8;
        let qos = self.qos as u8;
        let retain = self.retain as u8;
        stream.put_u8(0b0011_0000 | retain | qos << 1 | dup << 3);

        packet::write_remaining_length(stream, self.len())?;
        packet::write_string(stream, &self.topic);

        if self.qos != QoS::AtMostOnce {
            let packet_id = self.packet_id;
            if packet_id == 0 {
                return Err(Error::MissPacketId);
            }

            stream.put_u16(packet_id);
        }

        stream.extend_from_slice(&self.payload);

        Ok(())
    }
}
