use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::network::packet::{self, Error, FixedHeader, QoS};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    /// 包 id
    pub packet_id: u16,
    /// 对应于每个订阅时传递的主题，且顺序一致
    pub return_codes: Vec<SubscribeReasonCode>,
}

impl SubAck {
    fn len(&self) -> usize {
        2 + self.return_codes.len()
    }

    pub fn read(_fixed_header: &FixedHeader, mut stream: Bytes) -> Result<Self, Error> {
        let packet_id = packet::read_u16(&mut stream)?;

        let mut return_codes = Vec::new();
        while stream.has_remaining() {
            let code = packet::read_u8(&mut stream)?;
            return_codes.push(match code {
                0x80 => SubscribeReasonCode::Failure,
                code => SubscribeReasonCode::Success(code.try_into()?),
            });
        }

        if return_codes.is_empty() {
            return Err(Error::PayloadRequired);
        }

        Ok(Self {
            packet_id,
            return_codes,
        })
    }

    pub fn write(&self, stream: &mut BytesMut) -> Result<(), Error> {
        stream.put_u8(0x90);
        let remaining_len = self.len();
        packet::write_remaining_length(stream, remaining_len)?;

        stream.put_u16(self.packet_id);
        let p = self
            .return_codes
            .iter()
            .map(|&code| match code {
                SubscribeReasonCode::Success(qos) => qos as u8,
                SubscribeReasonCode::Failure => 0x80,
            })
            .collect::<Vec<u8>>();
        stream.extend_from_slice(&p);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeReasonCode {
    /// 成功，最大服务质量
    Success(QoS),
    /// 失败
    Failure,
}
