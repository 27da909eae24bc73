use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::network::packet::{self, Error, FixedHeader, QoS};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub packet_id: u16,
    pub filters: Vec<SubscribeFilter>,
}

impl Subscribe {
    fn len(&self) -> usize {
        // 包 id + 每个 filter：字符串 + 订阅选项
        2 + self
            .filters
            .iter()
            .map(|f| 2 + f.path.len() + 1)
            .sum::<usize>()
    }

    pub fn read(fixed_header: &FixedHeader, mut stream: Bytes) -> Result<Self, Error> {
        // 固定头 flags 必须为 0010
        if fixed_header.byte1 & 0b1111 != 0b0010 {
            return Err(Error::IncorrectPacketFormat);
        }

        let packet_id = packet::read_u16(&mut stream)?;

        let mut filters = Vec::new();
        while stream.has_remaining() {
            let filter = packet::read_string(&mut stream)?;
            if filter.is_empty() {
                return Err(Error::InvalidSubscribeFilter);
            }
            let options = packet::read_u8(&mut stream)?;
            let qos = options & 0b0000_0011;

            filters.push(SubscribeFilter {
                path: filter,
                qos: qos.try_into()?,
            })
        }

        // 订阅报文至少携带一个 filter
        if filters.is_empty() {
            return Err(Error::PayloadRequired);
        }

        Ok(Self { packet_id, filters })
    }

    pub fn write(&self, stream: &mut BytesMut) -> Result<(), Error> {
        if self.filters.is_empty() {
            return Err(Error::PayloadRequired);
        }

        stream.put_u8(0x82);
        packet::write_remaining_length(stream, self.len())?;
        stream.put_u16(self.packet_id);

        for filter in &self.filters {
            if filter.path.is_empty() {
                return Err(Error::InvalidSubscribeFilter);
            }
            packet::write_string(stream, &filter.path);
            stream.put_u8(filter.qos as u8);
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeFilter {
    pub path: String,
    pub qos: QoS,
}
