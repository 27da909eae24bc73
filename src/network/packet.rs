use std::slice::Iter;

use bytes::{Buf, BufMut, Bytes, BytesMut};

pub mod v4;

/// 剩余长度字段的协议上限（268435455）
const PAYLOAD_MAX_LENGTH: usize = 268_435_455;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("Invalid packet type: {0}")]
    InvalidPacketType(u8),
    #[error("Malformed packet")]
    MalformedPacket,
    #[error("At least {0} more bytes required")]
    InsufficientBytes(usize),
    #[error("Malformed UTF-8 string")]
    MalformedString,
    #[error("Invalid protocol")]
    InvalidProtocol,
    #[error("Invalid protocol level: {0}")]
    InvalidProtocolLevel(u8),
    #[error("Incorrect packet format")]
    IncorrectPacketFormat,
    #[error("Invalid QoS: {0}")]
    InvalidQoS(u8),
    #[error("Invalid connect return code: {0}")]
    InvalidConnectReturnCode(u8),
    #[error("Payload required")]
    PayloadRequired,
    #[error("Payload too large")]
    PayloadTooLarge,
    #[error("Unexpected packet type")]
    UnexpectedPacketType,
    #[error("Miss packet id")]
    MissPacketId,
    #[error("Invalid publish topic")]
    InvalidPublishTopic,
    #[error("Invalid subscribe filter")]
    InvalidSubscribeFilter,
}

/// 服务质量
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[allow(clippy::enum_variant_names)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce,
    ExactlyOnce,
}

impl TryFrom<u8> for QoS {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            qos => Err(Error::InvalidQoS(qos)),
        }
    }
}

/// 报文类型
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Connect = 1,
    ConnAck,
    Publish,
    PubAck,
    PubRec,
    PubRel,
    PubComp,
    Subscribe,
    SubAck,
    Unsubscribe,
    UnsubAck,
    PingReq,
    PingResp,
    Disconnect,
}

#[derive(Debug)]
pub(crate) struct FixedHeader {
    /// 固定头的第一个字节，包含报文类型和flags
    pub(crate) byte1: u8,
    // 固定头的大小
    pub(crate) fixed_header_len: usize,
    // 剩余长度大小
    pub(crate) remaining_len: usize,
}

impl FixedHeader {
    #[inline]
    pub(crate) fn packet_type(&self) -> Result<PacketType, Error> {
        let num = self.byte1 >> 4;
        match num {
            1 => Ok(PacketType::Connect),
            2 => Ok(PacketType::ConnAck),
            3 => Ok(PacketType::Publish),
            4 => Ok(PacketType::PubAck),
            5 => Ok(PacketType::PubRec),
            6 => Ok(PacketType::PubRel),
            7 => Ok(PacketType::PubComp),
            8 => Ok(PacketType::Subscribe),
            9 => Ok(PacketType::SubAck),
            10 => Ok(PacketType::Unsubscribe),
            11 => Ok(PacketType::UnsubAck),
            12 => Ok(PacketType::PingReq),
            13 => Ok(PacketType::PingResp),
            14 => Ok(PacketType::Disconnect),
            n => Err(Error::InvalidPacketType(n)),
        }
    }

    /// 整个完整报文的字节长度
    #[inline]
    pub(crate) fn packet_len(&self) -> usize {
        self.fixed_header_len + self.remaining_len
    }

    pub(crate) fn read_from(mut stream: Iter<u8>) -> Result<Self, Error> {
        let stream_len = stream.len();
        if stream_len < 2 {
            return Err(Error::InsufficientBytes(2 - stream_len));
        }
        // 第一个字节
        let byte1 = stream.next().unwrap();

        // 剩余字节长度
        let mut remaining_len: usize = 0;
        // 固定头长度
        let mut header_len = 1;
        let mut done = false;
        let mut shift = 0;

        for byte in stream {
            // 固定头长度 + 1
            header_len += 1;
            // 剩余长度字节
            let byte = *byte as usize;
            // 字节的后七位 * 128 + 上一个字节
            remaining_len += (byte & 0x7F) << shift;

            // 是否还有后续 remaining_len 字节
            done = (byte & 0x80) == 0;
            if done {
                break;
            }

            shift += 7;

            // 剩余长度字节最多四个字节（0，7，14，21）
            if shift > 21 {
                return Err(Error::MalformedPacket);
            }
        }

        if !done {
            return Err(Error::InsufficientBytes(1));
        }

        Ok(Self {
            byte1: *byte1,
            fixed_header_len: header_len,
            remaining_len,
        })
    }
}

/// 长度前缀字段：两字节长度 + 内容
/// 进入这里的 stream 已经由 Framer 按固定头切成单个报文，
/// 长度越过帧尾说明报文自身损坏，而不是数据未到齐
fn read_bytes(stream: &mut Bytes) -> Result<Bytes, Error> {
    let len = read_u16(stream)? as usize;
    if len > stream.remaining() {
        return Err(Error::MalformedPacket);
    }

    Ok(stream.split_to(len))
}

/// 长度前缀的 UTF-8 字符串字段
fn read_string(stream: &mut Bytes) -> Result<String, Error> {
    let bytes = read_bytes(stream)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| Error::MalformedString)
}

fn read_u16(stream: &mut Bytes) -> Result<u16, Error> {
    if stream.remaining() < 2 {
        return Err(Error::MalformedPacket);
    }
    Ok(stream.get_u16())
}

fn read_u8(stream: &mut Bytes) -> Result<u8, Error> {
    if !stream.has_remaining() {
        return Err(Error::MalformedPacket);
    }
    Ok(stream.get_u8())
}

/// 剩余长度字段：每字节七位载荷，最高位为续位
fn write_remaining_length(stream: &mut BytesMut, len: usize) -> Result<usize, Error> {
    if len > PAYLOAD_MAX_LENGTH {
        return Err(Error::PayloadTooLarge);
    }

    let mut rest = len;
    let mut count = 0;
    loop {
        let mut byte = (rest & 0x7F) as u8;
        rest >>= 7;
        if rest > 0 {
            byte |= 0x80;
        }

        stream.put_u8(byte);
        count += 1;
        if rest == 0 {
            break;
        }
    }

    Ok(count)
}

fn write_bytes(stream: &mut BytesMut, bytes: &[u8]) {
    stream.put_u16(bytes.len() as u16);
    stream.put_slice(bytes);
}

fn write_string(stream: &mut BytesMut, s: &str) {
    write_bytes(stream, s.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_header_single_byte_length() {
        let bytes = [0x30, 0x05, 0x00, 0x01, b't', 0x00, 0x01];
        let header = FixedHeader::read_from(bytes.iter()).unwrap();
        assert_eq!(header.fixed_header_len, 2);
        assert_eq!(header.remaining_len, 5);
        assert_eq!(header.packet_len(), 7);
        assert_eq!(header.packet_type().unwrap(), PacketType::Publish);
    }

    #[test]
    fn fixed_header_max_remaining_length() {
        // 四个长度字节的最大编码值
        let bytes = [0x30, 0xFF, 0xFF, 0xFF, 0x7F];
        let header = FixedHeader::read_from(bytes.iter()).unwrap();
        assert_eq!(header.remaining_len, 268_435_455);
        assert_eq!(header.fixed_header_len, 5);
    }

    #[test]
    fn fixed_header_overlong_length_rejected() {
        // 第五个长度字节仍带续位，268435456 不可编码
        let bytes = [0x30, 0x80, 0x80, 0x80, 0x80, 0x01];
        assert_eq!(
            FixedHeader::read_from(bytes.iter()).unwrap_err(),
            Error::MalformedPacket
        );
    }

    #[test]
    fn fixed_header_short_input() {
        let bytes = [0x30, 0x80];
        assert_eq!(
            FixedHeader::read_from(bytes.iter()).unwrap_err(),
            Error::InsufficientBytes(1)
        );
        assert_eq!(
            FixedHeader::read_from([0x30].iter()).unwrap_err(),
            Error::InsufficientBytes(1)
        );
    }

    #[test]
    fn remaining_length_round_trip() {
        for len in [0usize, 127, 128, 16_383, 16_384, 2_097_151, 268_435_455] {
            let mut stream = BytesMut::new();
            stream.put_u8(0x30);
            write_remaining_length(&mut stream, len).unwrap();
            let header = FixedHeader::read_from(stream.iter()).unwrap();
            assert_eq!(header.remaining_len, len);
        }
    }

    #[test]
    fn remaining_length_over_limit_rejected() {
        let mut stream = BytesMut::new();
        assert_eq!(
            write_remaining_length(&mut stream, 268_435_456).unwrap_err(),
            Error::PayloadTooLarge
        );
    }
}
