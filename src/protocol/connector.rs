//! 连接生命周期状态机
//! 只维护状态与时间记录，定时器和报文写出由会话负责

use tokio::time::{Duration, Instant};

use crate::network::packet::v4::ConnectReturnCode;
use crate::network::packet::PacketType;

use super::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectorState {
    Disconnected,
    ConnectSent,
    Connected,
    Disconnecting,
}

/// keepalive 到点后的处理
#[derive(Debug)]
pub(crate) enum KeepAlive {
    /// 需要发出 PingReq，并在一个 keepalive 周期后再次检查
    Ping,
    /// 周期内有出站流量，睡到距上次写出满一个周期
    Sleep(Duration),
    /// 连接已不在 Connected 状态，定时器退出
    Stop,
}

/// 客户端连接状态机
pub(crate) struct ClientConnector {
    pub(crate) state: ConnectorState,
    /// CONNECT 报文协商的 keepalive，零表示关闭
    keep_alive: Duration,
    /// 断链后是否丢弃会话状态
    pub(crate) clean_session: bool,
    /// 最近一次向对端写出报文的时间
    last_tx_at: Instant,
    /// 已发出 PingReq 且尚未收到 PingResp
    ping_outstanding: bool,
    /// 定时器代数，连接更替后旧定时器按代数作废
    pub(crate) epoch: u64,
}

impl ClientConnector {
    pub(crate) fn new() -> Self {
        Self {
            state: ConnectorState::Disconnected,
            keep_alive: Duration::ZERO,
            clean_session: true,
            last_tx_at: Instant::now(),
            ping_outstanding: false,
            epoch: 0,
        }
    }

    /// Connect 命令，只允许从 Disconnected 发起
    pub(crate) fn connect(&mut self, keep_alive: u16, clean_session: bool) -> Result<(), Error> {
        match self.state {
            ConnectorState::Disconnected => {
                self.state = ConnectorState::ConnectSent;
                self.keep_alive = Duration::from_secs(keep_alive as u64);
                self.clean_session = clean_session;
                self.ping_outstanding = false;
                self.epoch += 1;
                Ok(())
            }
            _ => Err(Error::IllegalCommand(PacketType::Connect)),
        }
    }

    /// 收到对端的 ConnAck
    pub(crate) fn connack(&mut self, code: ConnectReturnCode) -> Result<(), Error> {
        if self.state != ConnectorState::ConnectSent {
            return Err(Error::IllegalProtocolEvent(PacketType::ConnAck));
        }
        match code {
            ConnectReturnCode::Success => {
                self.state = ConnectorState::Connected;
                self.last_tx_at = Instant::now();
                Ok(())
            }
            code => {
                self.state = ConnectorState::Disconnected;
                Err(Error::ConnectionRefused(code))
            }
        }
    }

    /// Disconnect 命令
    /// 返回是否需要写出 Disconnect 报文：重复提交只产生一个
    pub(crate) fn disconnect(&mut self) -> bool {
        match self.state {
            ConnectorState::ConnectSent | ConnectorState::Connected => {
                self.state = ConnectorState::Disconnecting;
                true
            }
            _ => false,
        }
    }

    /// 传输断开，回到 Disconnected
    pub(crate) fn connection_lost(&mut self) {
        self.state = ConnectorState::Disconnected;
        self.ping_outstanding = false;
        self.epoch += 1;
    }

    /// 记录一次出站报文，keepalive 空闲计时重新开始
    pub(crate) fn record_tx(&mut self) {
        self.last_tx_at = Instant::now();
    }

    pub(crate) fn keep_alive(&self) -> Duration {
        self.keep_alive
    }

    pub(crate) fn keep_alive_enabled(&self) -> bool {
        self.state == ConnectorState::Connected && !self.keep_alive.is_zero()
    }

    /// keepalive 定时器到点
    /// 上一个 PingReq 未收到应答视为连接失效
    pub(crate) fn keep_alive_tick(&mut self) -> Result<KeepAlive, Error> {
        if !self.keep_alive_enabled() {
            return Ok(KeepAlive::Stop);
        }
        if self.ping_outstanding {
            return Err(Error::PingFailed);
        }

        let idle = self.last_tx_at.elapsed();
        if idle >= self.keep_alive {
            self.ping_outstanding = true;
            Ok(KeepAlive::Ping)
        } else {
            Ok(KeepAlive::Sleep(self.keep_alive - idle))
        }
    }

    /// 收到 PingResp
    pub(crate) fn pingresp(&mut self) {
        self.ping_outstanding = false;
    }
}
