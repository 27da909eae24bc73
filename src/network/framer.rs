use bytes::{Bytes, BytesMut};

use super::packet::{self, FixedHeader};

/// 把任意切分的传输层字节流重新切分为完整的报文帧
/// 只读取固定头的长度信息来确定帧边界，不解析报文内容
pub struct Framer {
    /// 读缓冲区
    /// 传输层给多少字节就缓存多少字节，凑满一帧再取出
    read: BytesMut,
    /// 单个报文的字节上限
    max_packet_size: usize,
}

impl Framer {
    pub fn new(max_packet_size: usize) -> Self {
        Self {
            read: BytesMut::new(),
            max_packet_size,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.read.extend_from_slice(bytes);
    }

    /// 取出一个完整报文的字节
    /// 数据不足时返回 None，等待下一次 push 之后重试
    /// 超过 max_packet_size 的帧返回 PayloadTooLarge，此错误不可恢复
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, packet::Error> {
        let fixed_header = match FixedHeader::read_from(self.read.iter()) {
            Ok(header) => header,
            Err(packet::Error::InsufficientBytes(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        let packet_len = fixed_header.packet_len();
        if packet_len > self.max_packet_size {
            return Err(packet::Error::PayloadTooLarge);
        }
        if self.read.len() < packet_len {
            return Ok(None);
        }

        Ok(Some(self.read.split_to(packet_len).freeze()))
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use crate::network::packet::v4::{Packet, PubAck};
    use crate::network::packet::Error;

    use super::*;

    fn encoded(packet: &Packet) -> BytesMut {
        let mut stream = BytesMut::new();
        packet.write(&mut stream).unwrap();
        stream
    }

    #[test]
    fn frame_assembled_from_single_byte_pushes() {
        let bytes = encoded(&Packet::PubAck(PubAck { packet_id: 9 }));

        let mut framer = Framer::new(4096);
        for byte in &bytes[..bytes.len() - 1] {
            framer.push(&[*byte]);
            assert_eq!(framer.next_frame().unwrap(), None);
        }
        framer.push(&bytes[bytes.len() - 1..]);

        let frame = framer.next_frame().unwrap().unwrap();
        assert_eq!(&frame[..], &bytes[..]);
        assert_eq!(framer.next_frame().unwrap(), None);
    }

    #[test]
    fn two_packets_in_one_push_yield_two_frames() {
        let first = encoded(&Packet::PubAck(PubAck { packet_id: 1 }));
        let second = encoded(&Packet::PingReq);

        let mut framer = Framer::new(4096);
        let mut joined = first.clone();
        joined.extend_from_slice(&second);
        framer.push(&joined);

        assert_eq!(&framer.next_frame().unwrap().unwrap()[..], &first[..]);
        assert_eq!(&framer.next_frame().unwrap().unwrap()[..], &second[..]);
        assert_eq!(framer.next_frame().unwrap(), None);
    }

    #[test]
    fn oversize_frame_is_terminal() {
        // 剩余长度 1000，超过 max_packet_size
        let mut framer = Framer::new(64);
        framer.push(&[0x30, 0xE8, 0x07]);
        assert_eq!(framer.next_frame().unwrap_err(), Error::PayloadTooLarge);
    }
}
