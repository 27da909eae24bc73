//! 会话引擎配置

use std::time::Duration;

use tokio::{fs, io::AsyncReadExt};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Read settings file error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse settings file error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("command_parallelism must be at least 2, got {0}")]
    CommandParallelismTooSmall(usize),
    #[error("max_packet_size must not be zero")]
    ZeroMaxPacketSize,
}

/// 会话引擎的全部可调参数
/// 时间类参数以毫秒为单位写在配置文件里，通过同名方法取 Duration
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct MqttSessionSettings {
    /// 单个报文的字节上限，超限的帧使事件管道终止
    pub max_packet_size: usize,
    /// 客户端出站字节队列上限
    pub client_send_buffer_size: usize,
    /// 服务端每条连接的出站字节队列上限
    pub server_send_buffer_size: usize,
    /// 命令管道允许积压的命令数，不能小于 2
    pub command_parallelism: usize,
    /// 事件管道允许积压的入站字节段数
    pub event_parallelism: usize,
    /// 会话内部应答超时，同时也是订阅类交换的总期限
    pub actor_mqtt_session_timeout_ms: u64,
    /// 发送端等待 PubAck/PubRec 的重发间隔
    pub producer_pub_ack_rec_timeout_ms: u64,
    /// 发送端等待 PubComp 的重发间隔
    pub producer_pub_comp_timeout_ms: u64,
    /// 接收端等待应用给出 PubAck/PubRec 命令的期限
    pub consumer_pub_ack_rec_timeout_ms: u64,
    /// 接收端等待对端 PubRel 的期限
    pub consumer_pub_rel_timeout_ms: u64,
    /// 接收端等待应用给出 PubComp 命令的期限
    pub consumer_pub_comp_timeout_ms: u64,
    /// 服务端从传输建立到收到 Connect 的期限
    pub receive_connect_timeout_ms: u64,
    /// 客户端从发出 Connect 到收到 ConnAck 的期限
    pub receive_conn_ack_timeout_ms: u64,
    /// 发送端重发次数上限，超过后放弃交换
    pub max_resend_attempts: u8,
    /// 每个会话结束通知订阅者的缓冲大小，溢出丢弃最新通知
    pub client_termination_watcher_buffer_size: usize,
}

impl Default for MqttSessionSettings {
    fn default() -> Self {
        Self {
            max_packet_size: 4096,
            client_send_buffer_size: 100,
            server_send_buffer_size: 100,
            command_parallelism: 50,
            event_parallelism: 10,
            actor_mqtt_session_timeout_ms: 3000,
            producer_pub_ack_rec_timeout_ms: 5000,
            producer_pub_comp_timeout_ms: 5000,
            consumer_pub_ack_rec_timeout_ms: 30_000,
            consumer_pub_rel_timeout_ms: 30_000,
            consumer_pub_comp_timeout_ms: 30_000,
            receive_connect_timeout_ms: 30_000,
            receive_conn_ack_timeout_ms: 30_000,
            max_resend_attempts: 3,
            client_termination_watcher_buffer_size: 100,
        }
    }
}

impl MqttSessionSettings {
    pub async fn from_path(path: &str) -> Result<Self, Error> {
        let mut file = fs::File::open(path).await?;
        let mut s = String::new();
        file.read_to_string(&mut s).await?;

        let settings = toml::from_str::<MqttSessionSettings>(&s)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.command_parallelism < 2 {
            return Err(Error::CommandParallelismTooSmall(self.command_parallelism));
        }
        if self.max_packet_size == 0 {
            return Err(Error::ZeroMaxPacketSize);
        }
        Ok(())
    }

    pub fn actor_mqtt_session_timeout(&self) -> Duration {
        Duration::from_millis(self.actor_mqtt_session_timeout_ms)
    }

    pub fn producer_pub_ack_rec_timeout(&self) -> Duration {
        Duration::from_millis(self.producer_pub_ack_rec_timeout_ms)
    }

    pub fn producer_pub_comp_timeout(&self) -> Duration {
        Duration::from_millis(self.producer_pub_comp_timeout_ms)
    }

    pub fn consumer_pub_ack_rec_timeout(&self) -> Duration {
        Duration::from_millis(self.consumer_pub_ack_rec_timeout_ms)
    }

    pub fn consumer_pub_rel_timeout(&self) -> Duration {
        Duration::from_millis(self.consumer_pub_rel_timeout_ms)
    }

    pub fn consumer_pub_comp_timeout(&self) -> Duration {
        Duration::from_millis(self.consumer_pub_comp_timeout_ms)
    }

    pub fn receive_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_connect_timeout_ms)
    }

    pub fn receive_conn_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_conn_ack_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        MqttSessionSettings::default().validate().unwrap();
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let settings: MqttSessionSettings =
            toml::from_str("max_packet_size = 1024\ncommand_parallelism = 8").unwrap();
        assert_eq!(settings.max_packet_size, 1024);
        assert_eq!(settings.command_parallelism, 8);
        assert_eq!(settings.event_parallelism, 10);
        assert_eq!(
            settings.producer_pub_ack_rec_timeout(),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn command_parallelism_lower_bound() {
        let settings = MqttSessionSettings {
            command_parallelism: 1,
            ..Default::default()
        };
        assert!(matches!(
            settings.validate().unwrap_err(),
            Error::CommandParallelismTooSmall(1)
        ));
    }
}
