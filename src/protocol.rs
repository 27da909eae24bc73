//! 协议层
//! 会话运行时逻辑，依赖网络层完成字节与报文之间的转换

use crate::network::packet::{self, v4::ConnectReturnCode, v4::Packet, PacketType};

pub use session::client::ClientSession;
pub use session::server::ServerSession;
pub use session::{ClientSessionWatch, CommandFlow, CommandSender, EventFeeder, EventFlow};

mod connector;
mod exchange;
pub mod router;
pub mod session;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Packet error: {0}")]
    Packet(#[from] packet::Error),
    #[error("Router error: {0}")]
    Router(#[from] router::Error),
    #[error("Illegal command: {0:?}")]
    IllegalCommand(PacketType),
    #[error("Illegal protocol event: {0:?}")]
    IllegalProtocolEvent(PacketType),
    #[error("Connection refused: {0:?}")]
    ConnectionRefused(ConnectReturnCode),
    #[error("Ping failed")]
    PingFailed,
    #[error("ConnAck not received in time")]
    ReceiveConnAckTimeout,
    #[error("Connect not received in time")]
    ReceiveConnectTimeout,
    #[error("Exchange abandoned: {0}")]
    ExchangeAbandoned(u16),
    #[error("Connection not found: {0}")]
    ConnectionNotFound(ConnectionId),
    #[error("Session closed")]
    SessionClosed,
    #[error("Reply timeout")]
    ReplyTimeout,
}

/// 服务端一条传输连接的标识，由接入层分配
pub type ConnectionId = u64;

/// 应用提交的协议命令
/// carry 是应用自己的关联凭据，会在对应的事件中原样带回
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command<A> {
    pub packet: Packet,
    pub carry: A,
}

impl<A> Command<A> {
    pub fn new(packet: Packet, carry: A) -> Self {
        Self { packet, carry }
    }
}

/// 上抛给应用的协议事件
/// 只有与本地命令对应的事件才带 carry，对端主动发来的报文不带
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event<A> {
    pub packet: Packet,
    pub carry: Option<A>,
}

impl<A> Event<A> {
    pub(crate) fn correlated(packet: Packet, carry: A) -> Self {
        Self {
            packet,
            carry: Some(carry),
        }
    }

    pub(crate) fn uncorrelated(packet: Packet) -> Self {
        Self {
            packet,
            carry: None,
        }
    }
}

/// 客户端会话结束通知
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSessionTerminated {
    pub client_id: String,
}
