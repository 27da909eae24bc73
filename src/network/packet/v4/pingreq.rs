use bytes::{BufMut, BytesMut};

use crate::network::packet::Error;

pub struct PingReq;

impl PingReq {
    pub fn write(&self, stream: &mut BytesMut) -> Result<(), Error> {
        stream.put_slice(&[0xC0, 0x00]);
        Ok(())
    }
}
