use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::network::packet::{self, Error, FixedHeader};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    /// 包 id
    pub packet_id: u16,
    /// 取消订阅的主题
    pub filters: Vec<String>,
}

impl Unsubscribe {
    fn len(&self) -> usize {
        2 + self.filters.iter().map(|f| 2 + f.len()).sum::<usize>()
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
            filters.push(filter);
        }

        if filters.is_empty() {
            return Err(Error::PayloadRequired);
        }

        Ok(Self { packet_id, filters })
    }

    pub fn write(&self, stream: &mut BytesMut) -> Result<(), Error> {
        if self.filters.is_empty() {
            return Err(Error::PayloadRequired);
        }

        stream.put_u8(0xA2);
        packet::write_remaining_length(stream, self.len())?;
        stream.put_u16(self.packet_id);

        for filter in &self.filters {
            packet::write_string(stream, filter);
        }

        Ok(())
    }
}
