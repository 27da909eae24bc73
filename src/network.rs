//! 网络层
//! 本层只关心字节与报文之间的转换，不包含任何会话相关逻辑

pub use framer::Framer;

pub mod framer;
pub mod packet;
