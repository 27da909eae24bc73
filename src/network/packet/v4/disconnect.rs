use bytes::{BufMut, BytesMut};

use crate::network::packet::Error;

pub struct Disconnect;

impl Disconnect {
    pub fn write(&self, stream: &mut BytesMut) -> Result<(), Error> {
        stream.put_slice(&[0xE0, 0x00]);
        Ok(())
    }
}
