//! mqtt 3.1.1 会话引擎
//!
//! 在字节传输层和应用之间做双向的协议状态机：应用提交 [`Command`]、
//! 观察 [`Event`]，引擎负责编解码、包 id 分配与关联、QoS 交换、
//! keepalive 与连接生命周期。客户端与服务端两个角色都在本库内实现。
//!
//! 引擎不持有 socket。每条传输连接对应两条管道：
//! [`CommandFlow`] 消费命令、产出需要写给传输层的字节；
//! [`EventFlow`] 消费传输层读到的字节、产出事件。
//! 传输层的建立、TLS、消息到订阅主题的路由都由调用方完成。

pub mod config;
pub mod network;
pub mod protocol;

pub use config::MqttSessionSettings;
pub use network::packet::v4 as packet;
pub use protocol::{
    ClientSession, ClientSessionTerminated, ClientSessionWatch, Command, CommandFlow,
    ConnectionId, Error, Event, EventFlow, ServerSession,
};
