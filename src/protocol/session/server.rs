//! 服务端会话
//! 一个会话 actor 按连接 id 复用多条客户端连接
//! 同一 client_id 再次连接时挤掉旧连接（3.1.4），会话结束通过
//! watch_client_sessions 广播

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use log::{debug, error, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Duration, Instant};

use crate::config::{self, MqttSessionSettings};
use crate::network::packet::v4::{Connect, ConnectReturnCode, Packet, PingResp, Publish};
use crate::network::packet::{self, PacketType, QoS};
use crate::network::Framer;
use crate::protocol::exchange::{
    Consumer, Exchange, Producer, ProducerState, Publisher, TimeoutAction, Unpublisher,
};
use crate::protocol::router::{self, LocalPacketRouter, RemotePacketRouter};
use crate::protocol::{ClientSessionTerminated, Command, ConnectionId, Error, Event};

use super::{Ask, ClientSessionWatch, CommandFlow, EventFlow};

/// 会话 actor 的邮箱消息
enum Incoming<A> {
    Command {
        connection_id: ConnectionId,
        ask: Ask<A>,
    },
    AttachCommandFlow {
        connection_id: ConnectionId,
        seq: u64,
        out_tx: mpsc::Sender<Bytes>,
    },
    AttachEventFlow {
        connection_id: ConnectionId,
        seq: u64,
        event_tx: mpsc::Sender<Result<Event<A>, Error>>,
    },
    Packet {
        connection_id: ConnectionId,
        seq: u64,
        packet: Packet,
    },
    DecodeFailure {
        connection_id: ConnectionId,
        seq: u64,
        error: packet::Error,
    },
    ConnectionLost {
        connection_id: ConnectionId,
        seq: u64,
    },
    /// 传输建立后未按时收到 Connect
    ReceiveConnectTimeout {
        connection_id: ConnectionId,
        epoch: u64,
    },
    /// 对端静默检查
    KeepAliveCheck {
        connection_id: ConnectionId,
        epoch: u64,
    },
    ExchangeTimeout {
        connection_id: ConnectionId,
        local: bool,
        packet_id: u16,
        epoch: u64,
    },
    AttachWatcher {
        tx: mpsc::Sender<ClientSessionTerminated>,
    },
    Shutdown,
}

/// 连接所处阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// 等待对端的 Connect
    AwaitingConnect,
    /// Connect 已上抛，等待应用给出 ConnAck 命令
    AwaitingConnAck,
    Connected,
}

/// 服务端视角的一条客户端连接
struct Connection<A> {
    phase: Phase,
    client_id: Option<String>,
    /// Connect 报文协商的 keepalive，静默判定放宽到 1.5 倍
    keep_alive: Duration,
    clean_session: bool,
    last_rx_at: Instant,
    /// 定时器代数
    epoch: u64,
    cmd: Option<(u64, mpsc::Sender<Bytes>)>,
    event: Option<(u64, mpsc::Sender<Result<Event<A>, Error>>)>,
    /// 本端分配 id：发往客户端的 Publish
    local: LocalPacketRouter<A>,
    /// 对端分配 id：来自客户端的 Publish/Subscribe/Unsubscribe
    remote: RemotePacketRouter<A>,
}

impl<A> Connection<A> {
    fn new() -> Self {
        Self {
            phase: Phase::AwaitingConnect,
            client_id: None,
            keep_alive: Duration::ZERO,
            clean_session: true,
            last_rx_at: Instant::now(),
            epoch: 0,
            cmd: None,
            event: None,
            local: LocalPacketRouter::new(),
            remote: RemotePacketRouter::new(),
        }
    }

    fn event_seq(&self) -> Option<u64> {
        self.event.as_ref().map(|(seq, _)| *seq)
    }

    fn cmd_seq(&self) -> Option<u64> {
        self.cmd.as_ref().map(|(seq, _)| *seq)
    }
}

/// clean_session = false 的客户端断开后保留的会话状态
struct RetainedSession<A> {
    local: LocalPacketRouter<A>,
    remote: RemotePacketRouter<A>,
}

/// 命令分派结果
enum Dispatched {
    None,
    Bytes(Bytes),
    /// ConnAck 成功：写出后重发接续会话的在途消息
    Accepted(Bytes),
    /// ConnAck 拒绝：写出后关闭连接
    Refused(Bytes),
}

/// 服务端会话
pub struct ServerSession<A> {
    tx: mpsc::Sender<Incoming<A>>,
    settings: MqttSessionSettings,
    seq: Arc<AtomicU64>,
}

impl<A: Clone + Send + Sync + 'static> ServerSession<A> {
    pub fn new(settings: MqttSessionSettings) -> Result<Self, config::Error> {
        settings.validate()?;

        let (tx, rx) = mpsc::channel(settings.command_parallelism + settings.event_parallelism);
        let actor = ServerActor {
            settings: settings.clone(),
            rx,
            tx: tx.clone(),
            connections: HashMap::new(),
            client_index: HashMap::new(),
            retained: HashMap::new(),
            watchers: Vec::new(),
        };
        tokio::spawn(actor.run());

        Ok(Self {
            tx,
            settings,
            seq: Arc::new(AtomicU64::new(0)),
        })
    }

    /// 为一条客户端连接附着命令管道
    pub async fn command_flow(&self, connection_id: ConnectionId) -> CommandFlow<A> {
        let seq = self.next_seq();
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<Ask<A>>(self.settings.command_parallelism);
        let (out_tx, out_rx) = mpsc::channel(self.settings.server_send_buffer_size);

        let _ = self
            .tx
            .send(Incoming::AttachCommandFlow {
                connection_id,
                seq,
                out_tx,
            })
            .await;

        let session_tx = self.tx.clone();
        tokio::spawn(async move {
            while let Some(ask) = cmd_rx.recv().await {
                if session_tx
                    .send(Incoming::Command { connection_id, ask })
                    .await
                    .is_err()
                {
                    return;
                }
            }
            let _ = session_tx
                .send(Incoming::ConnectionLost { connection_id, seq })
                .await;
        });

        CommandFlow::new(cmd_tx, out_rx, self.settings.actor_mqtt_session_timeout())
    }

    /// 为一条客户端连接附着事件管道
    pub async fn event_flow(&self, connection_id: ConnectionId) -> EventFlow<A> {
        let seq = self.next_seq();
        let (bytes_tx, mut bytes_rx) = mpsc::channel::<Bytes>(self.settings.event_parallelism);
        let (event_tx, event_rx) = mpsc::channel(self.settings.event_parallelism);

        let _ = self
            .tx
            .send(Incoming::AttachEventFlow {
                connection_id,
                seq,
                event_tx,
            })
            .await;

        let session_tx = self.tx.clone();
        let max_packet_size = self.settings.max_packet_size;
        tokio::spawn(async move {
            let mut framer = Framer::new(max_packet_size);
            while let Some(bytes) = bytes_rx.recv().await {
                framer.push(&bytes);
                loop {
                    match framer.next_frame() {
                        Ok(Some(frame)) => {
                            let mut frame = BytesMut::from(&frame[..]);
                            match Packet::read(&mut frame, max_packet_size) {
                                Ok(packet) => {
                                    if session_tx
                                        .send(Incoming::Packet {
                                            connection_id,
                                            seq,
                                            packet,
                                        })
                                        .await
                                        .is_err()
                                    {
                                        return;
                                    }
                                }
                                Err(error) => {
                                    let _ = session_tx
                                        .send(Incoming::DecodeFailure {
                                            connection_id,
                                            seq,
                                            error,
                                        })
                                        .await;
                                    return;
                                }
                            }
                        }
                        Ok(None) => break,
                        Err(error) => {
                            let _ = session_tx
                                .send(Incoming::DecodeFailure {
                                    connection_id,
                                    seq,
                                    error,
                                })
                                .await;
                            return;
                        }
                    }
                }
            }
            let _ = session_tx
                .send(Incoming::ConnectionLost { connection_id, seq })
                .await;
        });

        EventFlow::new(bytes_tx, event_rx)
    }

    /// 订阅客户端会话结束通知
    /// 缓冲满时丢弃最新的通知，订阅者可能错过事件
    pub async fn watch_client_sessions(&self) -> ClientSessionWatch {
        let (tx, rx) = mpsc::channel(self.settings.client_termination_watcher_buffer_size);
        let _ = self.tx.send(Incoming::AttachWatcher { tx }).await;
        ClientSessionWatch::new(rx)
    }

    /// 停止会话，关闭所有连接与订阅
    pub async fn shutdown(&self) {
        let _ = self.tx.send(Incoming::Shutdown).await;
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }
}

struct ServerActor<A> {
    settings: MqttSessionSettings,
    rx: mpsc::Receiver<Incoming<A>>,
    tx: mpsc::Sender<Incoming<A>>,
    connections: HashMap<ConnectionId, Connection<A>>,
    /// client_id → 当前持有该会话的连接
    client_index: HashMap<String, ConnectionId>,
    /// 断开但尚未过期的持久会话
    retained: HashMap<String, RetainedSession<A>>,
    watchers: Vec<mpsc::Sender<ClientSessionTerminated>>,
}

/// 本地路由表超时处理的去向
enum LocalTimeout {
    Resend(Packet, Duration),
    Abandon,
    Reap,
}

impl<A: Clone + Send + Sync + 'static> ServerActor<A> {
    async fn run(mut self) {
        while let Some(incoming) = self.rx.recv().await {
            match incoming {
                Incoming::Command { connection_id, ask } => {
                    let (command, reply) = ask;
                    self.handle_command(connection_id, command, reply).await;
                }
                Incoming::AttachCommandFlow {
                    connection_id,
                    seq,
                    out_tx,
                } => {
                    self.connection_entry(connection_id).cmd = Some((seq, out_tx));
                }
                Incoming::AttachEventFlow {
                    connection_id,
                    seq,
                    event_tx,
                } => {
                    self.connection_entry(connection_id).event = Some((seq, event_tx));
                }
                Incoming::Packet {
                    connection_id,
                    seq,
                    packet,
                } => self.handle_packet(connection_id, seq, packet).await,
                Incoming::DecodeFailure {
                    connection_id,
                    seq,
                    error,
                } => {
                    let current = self
                        .connections
                        .get(&connection_id)
                        .and_then(Connection::event_seq);
                    if current == Some(seq) {
                        self.fail_connection(connection_id, Error::Packet(error))
                            .await;
                    }
                }
                Incoming::ConnectionLost { connection_id, seq } => {
                    let lost = self
                        .connections
                        .get(&connection_id)
                        .map(|conn| {
                            conn.cmd_seq() == Some(seq) || conn.event_seq() == Some(seq)
                        })
                        .unwrap_or(false);
                    if lost {
                        debug!("transport lost on connection {}", connection_id);
                        self.terminate_connection(connection_id);
                    }
                }
                Incoming::ReceiveConnectTimeout {
                    connection_id,
                    epoch,
                } => {
                    let expired = self
                        .connections
                        .get(&connection_id)
                        .map(|conn| conn.epoch == epoch && conn.phase == Phase::AwaitingConnect)
                        .unwrap_or(false);
                    if expired {
                        self.fail_connection(connection_id, Error::ReceiveConnectTimeout)
                            .await;
                    }
                }
                Incoming::KeepAliveCheck {
                    connection_id,
                    epoch,
                } => self.handle_keep_alive_check(connection_id, epoch).await,
                Incoming::ExchangeTimeout {
                    connection_id,
                    local,
                    packet_id,
                    epoch,
                } => {
                    self.handle_exchange_timeout(connection_id, local, packet_id, epoch)
                        .await
                }
                Incoming::AttachWatcher { tx } => self.watchers.push(tx),
                Incoming::Shutdown => break,
            }
        }
    }

    /// 连接首次附着管道时建立状态，并开始等待 Connect
    fn connection_entry(&mut self, connection_id: ConnectionId) -> &mut Connection<A> {
        if !self.connections.contains_key(&connection_id) {
            let conn = Connection::new();
            self.arm_connect_timer(connection_id, conn.epoch);
            self.connections.insert(connection_id, conn);
        }
        self.connections.get_mut(&connection_id).unwrap()
    }

    async fn handle_command(
        &mut self,
        connection_id: ConnectionId,
        command: Command<A>,
        reply: oneshot::Sender<Result<(), Error>>,
    ) {
        match self.dispatch_command(connection_id, command) {
            Ok(Dispatched::None) => {
                let _ = reply.send(Ok(()));
            }
            Ok(Dispatched::Bytes(bytes)) => {
                let _ = reply.send(Ok(()));
                self.emit_bytes(connection_id, bytes).await;
            }
            Ok(Dispatched::Accepted(bytes)) => {
                let _ = reply.send(Ok(()));
                self.emit_bytes(connection_id, bytes).await;
                self.resume_producers(connection_id).await;
            }
            Ok(Dispatched::Refused(bytes)) => {
                let _ = reply.send(Ok(()));
                self.emit_bytes(connection_id, bytes).await;
                self.terminate_connection(connection_id);
            }
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
    }

    fn dispatch_command(
        &mut self,
        connection_id: ConnectionId,
        command: Command<A>,
    ) -> Result<Dispatched, Error> {
        let Command { packet, carry } = command;

        match packet {
            Packet::ConnAck(ref ack) => {
                let conn = self
                    .connections
                    .get_mut(&connection_id)
                    .ok_or(Error::ConnectionNotFound(connection_id))?;
                if conn.phase != Phase::AwaitingConnAck {
                    return Err(Error::IllegalCommand(PacketType::ConnAck));
                }

                let accepted = ack.code == ConnectReturnCode::Success;
                let bytes = Self::encode(&packet)?;
                if accepted {
                    conn.phase = Phase::Connected;
                    conn.epoch += 1;
                    let epoch = conn.epoch;
                    let keep_alive = conn.keep_alive;
                    if !keep_alive.is_zero() {
                        self.arm_keep_alive_timer(
                            connection_id,
                            epoch,
                            keep_alive + keep_alive.mul_f32(0.5),
                        );
                    }
                    Ok(Dispatched::Accepted(bytes))
                } else {
                    Ok(Dispatched::Refused(bytes))
                }
            }
            Packet::Publish(publish) => self.start_producer(connection_id, publish, carry),
            Packet::PubAck(_) | Packet::PubRec(_) | Packet::PubComp(_) => {
                self.consumer_command(connection_id, packet)
            }
            Packet::SubAck(_) | Packet::UnsubAck(_) => self.ack_command(connection_id, packet),
            other => Err(Error::IllegalCommand(other.packet_type())),
        }
    }

    /// 发往客户端的 QoS1/QoS2 Publish 注册为 Producer 交换
    fn start_producer(
        &mut self,
        connection_id: ConnectionId,
        publish: Publish,
        carry: A,
    ) -> Result<Dispatched, Error> {
        let conn = self
            .connections
            .get_mut(&connection_id)
            .ok_or(Error::ConnectionNotFound(connection_id))?;

        if publish.qos == QoS::AtMostOnce {
            return Ok(Dispatched::Bytes(Self::encode(&Packet::Publish(publish))?));
        }

        let id = conn
            .local
            .register(Exchange::Producer(Producer::new(publish, carry)))?;
        let wire = {
            let entry = conn.local.get_mut(id).unwrap();
            let Exchange::Producer(producer) = &mut entry.exchange else {
                unreachable!()
            };
            producer.set_packet_id(id);
            producer.first_wire()
        };

        match Self::encode(&wire) {
            Ok(bytes) => {
                self.arm_exchange_timer(
                    connection_id,
                    true,
                    id,
                    0,
                    self.settings.producer_pub_ack_rec_timeout(),
                );
                Ok(Dispatched::Bytes(bytes))
            }
            Err(e) => {
                // 回滚刚注册的交换
                if let Some(conn) = self.connections.get_mut(&connection_id) {
                    conn.local.release(id);
                }
                Err(e)
            }
        }
    }

    /// 应用对入站 Publish 的本地应答（PubAck/PubRec/PubComp 命令）
    fn consumer_command(
        &mut self,
        connection_id: ConnectionId,
        packet: Packet,
    ) -> Result<Dispatched, Error> {
        let id = packet
            .packet_id()
            .ok_or(Error::IllegalCommand(packet.packet_type()))?;

        let (action, epoch) = {
            let conn = self
                .connections
                .get_mut(&connection_id)
                .ok_or(Error::ConnectionNotFound(connection_id))?;
            let entry = conn
                .remote
                .get_mut(id)
                .ok_or(Error::Router(router::Error::UnknownPacketId(id)))?;
            let Exchange::Consumer(consumer) = &mut entry.exchange else {
                return Err(Error::IllegalCommand(packet.packet_type()));
            };
            let action = consumer.on_command::<A>(&packet)?;
            entry.epoch += 1;
            (action, entry.epoch)
        };

        if action.done {
            if let Some(conn) = self.connections.get_mut(&connection_id) {
                conn.remote.release(id);
            }
        } else {
            self.arm_exchange_timer(
                connection_id,
                false,
                id,
                epoch,
                self.settings.consumer_pub_rel_timeout(),
            );
        }

        match action.wire {
            Some(wire) => Ok(Dispatched::Bytes(Self::encode(&wire)?)),
            None => Ok(Dispatched::None),
        }
    }

    /// 应用对 Subscribe/Unsubscribe 的应答命令（SubAck/UnsubAck）
    fn ack_command(
        &mut self,
        connection_id: ConnectionId,
        packet: Packet,
    ) -> Result<Dispatched, Error> {
        let id = packet
            .packet_id()
            .ok_or(Error::IllegalCommand(packet.packet_type()))?;

        let action = {
            let conn = self
                .connections
                .get_mut(&connection_id)
                .ok_or(Error::ConnectionNotFound(connection_id))?;
            let entry = conn
                .remote
                .get_mut(id)
                .ok_or(Error::Router(router::Error::UnknownPacketId(id)))?;
            match &mut entry.exchange {
                Exchange::Publisher(publisher) => publisher.on_command::<A>(&packet)?,
                Exchange::Unpublisher(unpublisher) => unpublisher.on_command::<A>(&packet)?,
                _ => return Err(Error::IllegalCommand(packet.packet_type())),
            }
        };

        if action.done {
            if let Some(conn) = self.connections.get_mut(&connection_id) {
                conn.remote.release(id);
            }
        }

        match action.wire {
            Some(wire) => Ok(Dispatched::Bytes(Self::encode(&wire)?)),
            None => Ok(Dispatched::None),
        }
    }

    async fn handle_packet(&mut self, connection_id: ConnectionId, seq: u64, packet: Packet) {
        let before_connect = {
            let Some(conn) = self.connections.get_mut(&connection_id) else {
                return;
            };
            if conn.event_seq() != Some(seq) {
                // 旧连接的残留报文
                return;
            }
            conn.last_rx_at = Instant::now();
            conn.phase == Phase::AwaitingConnect
        };

        // 第一个报文必须是 Connect
        if before_connect && !matches!(packet, Packet::Connect(_)) {
            self.fail_connection(
                connection_id,
                Error::IllegalProtocolEvent(packet.packet_type()),
            )
            .await;
            return;
        }

        match packet {
            Packet::Connect(connect) => self.handle_connect(connection_id, connect).await,
            Packet::Publish(publish) => self.handle_inbound_publish(connection_id, publish).await,
            Packet::PubAck(_) | Packet::PubRec(_) | Packet::PubComp(_) => {
                self.route_local(connection_id, packet).await
            }
            Packet::PubRel(_) => self.route_remote(connection_id, packet).await,
            Packet::Subscribe(_) | Packet::Unsubscribe(_) => {
                self.handle_subscription(connection_id, packet).await
            }
            Packet::PingReq => {
                // 引擎直接应答，不上抛
                let mut buf = BytesMut::new();
                if PingResp.write(&mut buf).is_ok() {
                    self.emit_bytes(connection_id, buf.freeze()).await;
                }
            }
            Packet::Disconnect => {
                self.surface(connection_id, Ok(Event::uncorrelated(Packet::Disconnect)))
                    .await;
                self.terminate_connection(connection_id);
            }
            other => {
                // 服务端不应收到的报文方向
                self.fail_connection(
                    connection_id,
                    Error::IllegalProtocolEvent(other.packet_type()),
                )
                .await;
            }
        }
    }

    async fn handle_connect(&mut self, connection_id: ConnectionId, connect: Connect) {
        let illegal = match self.connections.get(&connection_id) {
            Some(conn) => conn.phase != Phase::AwaitingConnect,
            None => return,
        };
        if illegal {
            self.fail_connection(
                connection_id,
                Error::IllegalProtocolEvent(PacketType::Connect),
            )
            .await;
            return;
        }

        // 同一 client_id 已有活跃连接，挤掉旧连接（3.1.4）
        if let Some(&old_id) = self.client_index.get(&connect.client_id) {
            if old_id != connection_id {
                debug!(
                    "session takeover for client {}, closing connection {}",
                    connect.client_id, old_id
                );
                self.terminate_connection(old_id);
            }
        }

        // clean_session 决定是否接续保留的会话状态
        let adopted = if connect.clean_session {
            self.retained.remove(&connect.client_id);
            None
        } else {
            self.retained.remove(&connect.client_id)
        };

        let Some(conn) = self.connections.get_mut(&connection_id) else {
            return;
        };
        conn.phase = Phase::AwaitingConnAck;
        conn.client_id = Some(connect.client_id.clone());
        conn.keep_alive = Duration::from_secs(connect.keep_alive as u64);
        conn.clean_session = connect.clean_session;
        conn.epoch += 1;
        if let Some(state) = adopted {
            conn.local = state.local;
            conn.remote = state.remote;
        }
        self.client_index
            .insert(connect.client_id.clone(), connection_id);

        self.surface(
            connection_id,
            Ok(Event::uncorrelated(Packet::Connect(connect))),
        )
        .await;
    }

    async fn handle_inbound_publish(&mut self, connection_id: ConnectionId, publish: Publish) {
        if publish.qos == QoS::AtMostOnce {
            self.surface(
                connection_id,
                Ok(Event::uncorrelated(Packet::Publish(publish))),
            )
            .await;
            return;
        }

        let id = publish.packet_id;
        let qos = publish.qos;
        {
            let Some(conn) = self.connections.get_mut(&connection_id) else {
                return;
            };
            if conn.remote.contains(id) {
                // 对端重发的 Publish，交换未终止期间不重复投递
                debug!("duplicate publish for in-flight packet id {}, dropped", id);
                return;
            }
            if let Err(e) = conn
                .remote
                .register(id, Exchange::Consumer(Consumer::new(qos)))
            {
                warn!("register consumer for packet id {} failed: {}", id, e);
                return;
            }
        }
        self.arm_exchange_timer(
            connection_id,
            false,
            id,
            0,
            self.settings.consumer_pub_ack_rec_timeout(),
        );
        self.surface(
            connection_id,
            Ok(Event::uncorrelated(Packet::Publish(publish))),
        )
        .await;
    }

    /// 客户端发来的 Subscribe/Unsubscribe 预定对端 id，等待应用应答
    async fn handle_subscription(&mut self, connection_id: ConnectionId, packet: Packet) {
        let Some(id) = packet.packet_id() else { return };

        let exchange = match packet {
            Packet::Subscribe(_) => Exchange::Publisher(Publisher),
            _ => Exchange::Unpublisher(Unpublisher),
        };
        let registered = {
            let Some(conn) = self.connections.get_mut(&connection_id) else {
                return;
            };
            conn.remote.register(id, exchange)
        };

        match registered {
            Ok(()) => {
                self.arm_exchange_timer(
                    connection_id,
                    false,
                    id,
                    0,
                    self.settings.actor_mqtt_session_timeout(),
                );
                self.surface(connection_id, Ok(Event::uncorrelated(packet)))
                    .await;
            }
            Err(e) => {
                // id 冲突只影响这一次交换，连接保持
                warn!("reserve packet id {} failed: {}", id, e);
                self.surface(connection_id, Err(e.into())).await;
            }
        }
    }

    /// 客户端应答路由到本端分配 id 的交换（Producer）
    async fn route_local(&mut self, connection_id: ConnectionId, packet: Packet) {
        let Some(id) = packet.packet_id() else { return };

        let outcome = {
            let Some(conn) = self.connections.get_mut(&connection_id) else {
                return;
            };
            let Some(entry) = conn.local.get_mut(id) else {
                warn!("{:?} for unknown packet id {}, dropped", packet.packet_type(), id);
                return;
            };
            let action = match &mut entry.exchange {
                Exchange::Producer(producer) => producer.on_packet(&packet),
                _ => None,
            };
            match action {
                Some(action) => {
                    entry.epoch += 1;
                    Some((action, entry.epoch))
                }
                None => {
                    warn!(
                        "out of order {:?} for packet id {}, dropped",
                        packet.packet_type(),
                        id
                    );
                    None
                }
            }
        };
        let Some((action, epoch)) = outcome else { return };

        if action.done {
            if let Some(conn) = self.connections.get_mut(&connection_id) {
                conn.local.release(id);
            }
        } else {
            self.arm_exchange_timer(
                connection_id,
                true,
                id,
                epoch,
                self.settings.producer_pub_comp_timeout(),
            );
        }
        if let Some(wire) = action.wire {
            self.emit(connection_id, wire).await;
        }
        if let Some(event) = action.event {
            self.surface(connection_id, Ok(event)).await;
        }
    }

    /// 客户端报文路由到对端分配 id 的交换（PubRel → Consumer）
    async fn route_remote(&mut self, connection_id: ConnectionId, packet: Packet) {
        let Some(id) = packet.packet_id() else { return };

        let outcome = {
            let Some(conn) = self.connections.get_mut(&connection_id) else {
                return;
            };
            let Some(entry) = conn.remote.get_mut(id) else {
                warn!("{:?} for unknown packet id {}, dropped", packet.packet_type(), id);
                return;
            };
            let action = match &mut entry.exchange {
                Exchange::Consumer(consumer) => consumer.on_packet::<A>(&packet),
                _ => None,
            };
            match action {
                Some(action) => {
                    entry.epoch += 1;
                    Some((action, entry.epoch))
                }
                None => {
                    warn!(
                        "out of order {:?} for packet id {}, dropped",
                        packet.packet_type(),
                        id
                    );
                    None
                }
            }
        };
        let Some((action, epoch)) = outcome else { return };

        if action.done {
            if let Some(conn) = self.connections.get_mut(&connection_id) {
                conn.remote.release(id);
            }
        } else {
            self.arm_exchange_timer(
                connection_id,
                false,
                id,
                epoch,
                self.settings.consumer_pub_comp_timeout(),
            );
        }
        if let Some(wire) = action.wire {
            self.emit(connection_id, wire).await;
        }
        if let Some(event) = action.event {
            self.surface(connection_id, Ok(event)).await;
        }
    }

    /// 接续会话被采纳后，重发在途消息（dup 置位）
    async fn resume_producers(&mut self, connection_id: ConnectionId) {
        let ids = match self.connections.get(&connection_id) {
            Some(conn) => conn.local.ids(),
            None => return,
        };
        for id in ids {
            let resend = {
                let Some(conn) = self.connections.get_mut(&connection_id) else {
                    return;
                };
                let Some(entry) = conn.local.get_mut(id) else {
                    continue;
                };
                let Exchange::Producer(producer) = &mut entry.exchange else {
                    continue;
                };
                entry.epoch += 1;
                let timeout = match producer.state {
                    ProducerState::AwaitingPubComp => self.settings.producer_pub_comp_timeout(),
                    _ => self.settings.producer_pub_ack_rec_timeout(),
                };
                (producer.resend_wire(), entry.epoch, timeout)
            };
            let (wire, epoch, timeout) = resend;
            self.arm_exchange_timer(connection_id, true, id, epoch, timeout);
            self.emit(connection_id, wire).await;
        }
    }

    /// 对端静默超过 1.5 倍 keepalive 视为失联
    async fn handle_keep_alive_check(&mut self, connection_id: ConnectionId, epoch: u64) {
        let deadline = {
            let Some(conn) = self.connections.get(&connection_id) else {
                return;
            };
            if conn.epoch != epoch
                || conn.phase != Phase::Connected
                || conn.keep_alive.is_zero()
            {
                return;
            }
            let window = conn.keep_alive + conn.keep_alive.mul_f32(0.5);
            let idle = conn.last_rx_at.elapsed();
            if idle >= window {
                None
            } else {
                Some(window - idle)
            }
        };

        match deadline {
            None => {
                self.fail_connection(connection_id, Error::PingFailed).await;
            }
            Some(remaining) => self.arm_keep_alive_timer(connection_id, epoch, remaining),
        }
    }

    async fn handle_exchange_timeout(
        &mut self,
        connection_id: ConnectionId,
        local: bool,
        id: u16,
        epoch: u64,
    ) {
        if !local {
            // Consumer / Publisher / Unpublisher 到期静默回收
            let Some(conn) = self.connections.get_mut(&connection_id) else {
                return;
            };
            let stale = match conn.remote.get_mut(id) {
                Some(entry) => entry.epoch != epoch,
                None => true,
            };
            if !stale {
                debug!("remote exchange timed out, packet id {} released", id);
                conn.remote.release(id);
            }
            return;
        }

        let outcome = {
            let Some(conn) = self.connections.get_mut(&connection_id) else {
                return;
            };
            let Some(entry) = conn.local.get_mut(id) else { return };
            if entry.epoch != epoch {
                return;
            }
            match &mut entry.exchange {
                Exchange::Producer(producer) => {
                    match producer.on_timeout(self.settings.max_resend_attempts) {
                        TimeoutAction::Resend(packet) => {
                            let timeout = match producer.state {
                                ProducerState::AwaitingPubComp => {
                                    self.settings.producer_pub_comp_timeout()
                                }
                                _ => self.settings.producer_pub_ack_rec_timeout(),
                            };
                            LocalTimeout::Resend(packet, timeout)
                        }
                        TimeoutAction::Abandon => LocalTimeout::Abandon,
                    }
                }
                _ => LocalTimeout::Reap,
            }
        };

        match outcome {
            LocalTimeout::Resend(packet, timeout) => {
                self.arm_exchange_timer(connection_id, true, id, epoch, timeout);
                self.emit(connection_id, packet).await;
            }
            LocalTimeout::Abandon => {
                warn!("producer exchange abandoned, packet id {}", id);
                if let Some(conn) = self.connections.get_mut(&connection_id) {
                    conn.local.release(id);
                }
                self.surface(connection_id, Err(Error::ExchangeAbandoned(id)))
                    .await;
            }
            LocalTimeout::Reap => {
                debug!("exchange timed out, packet id {} released", id);
                if let Some(conn) = self.connections.get_mut(&connection_id) {
                    conn.local.release(id);
                }
            }
        }
    }

    /// 跨切面错误：上抛错误事件后关闭连接
    async fn fail_connection(&mut self, connection_id: ConnectionId, error: Error) {
        warn!("connection {} failed: {}", connection_id, error);
        if let Some(conn) = self.connections.get(&connection_id) {
            if let Some((_, event_tx)) = &conn.event {
                let _ = event_tx.send(Err(error)).await;
            }
        }
        self.terminate_connection(connection_id);
    }

    /// 关闭连接：注销索引、按 clean_session 保留会话状态、广播结束通知
    fn terminate_connection(&mut self, connection_id: ConnectionId) {
        let Some(mut conn) = self.connections.remove(&connection_id) else {
            return;
        };
        conn.cmd = None;
        conn.event = None;

        if let Some(client_id) = conn.client_id.take() {
            if self.client_index.get(&client_id) == Some(&connection_id) {
                self.client_index.remove(&client_id);
            }
            if !conn.clean_session {
                self.retained.insert(
                    client_id.clone(),
                    RetainedSession {
                        local: conn.local,
                        remote: conn.remote,
                    },
                );
            }
            self.notify_watchers(client_id);
        }
    }

    fn notify_watchers(&mut self, client_id: String) {
        self.watchers.retain(|tx| {
            match tx.try_send(ClientSessionTerminated {
                client_id: client_id.clone(),
            }) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // 缓冲满，丢弃最新的通知
                    warn!(
                        "termination watcher buffer full, notice for {} dropped",
                        client_id
                    );
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    async fn emit(&mut self, connection_id: ConnectionId, packet: Packet) {
        match Self::encode(&packet) {
            Ok(bytes) => self.emit_bytes(connection_id, bytes).await,
            Err(e) => error!("encode outbound {:?} failed: {}", packet.packet_type(), e),
        }
    }

    async fn emit_bytes(&mut self, connection_id: ConnectionId, bytes: Bytes) {
        let Some(conn) = self.connections.get(&connection_id) else {
            debug!("connection {} gone, outbound bytes dropped", connection_id);
            return;
        };
        let Some((_, out_tx)) = &conn.cmd else {
            debug!("no command flow attached, outbound bytes dropped");
            return;
        };
        if out_tx.send(bytes).await.is_err() {
            debug!("command flow gone, outbound bytes dropped");
        }
    }

    async fn surface(&self, connection_id: ConnectionId, event: Result<Event<A>, Error>) {
        let Some(conn) = self.connections.get(&connection_id) else {
            return;
        };
        let Some((_, event_tx)) = &conn.event else {
            debug!("no event flow attached, event dropped");
            return;
        };
        let _ = event_tx.send(event).await;
    }

    fn encode(packet: &Packet) -> Result<Bytes, Error> {
        let mut buf = BytesMut::new();
        packet.write(&mut buf)?;
        Ok(buf.freeze())
    }

    fn arm_connect_timer(&self, connection_id: ConnectionId, epoch: u64) {
        let delay = self.settings.receive_connect_timeout();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            time::sleep(delay).await;
            let _ = tx
                .send(Incoming::ReceiveConnectTimeout {
                    connection_id,
                    epoch,
                })
                .await;
        });
    }

    fn arm_keep_alive_timer(&self, connection_id: ConnectionId, epoch: u64, delay: Duration) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            time::sleep(delay).await;
            let _ = tx
                .send(Incoming::KeepAliveCheck {
                    connection_id,
                    epoch,
                })
                .await;
        });
    }

    fn arm_exchange_timer(
        &self,
        connection_id: ConnectionId,
        local: bool,
        packet_id: u16,
        epoch: u64,
        delay: Duration,
    ) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            time::sleep(delay).await;
            let _ = tx
                .send(Incoming::ExchangeTimeout {
                    connection_id,
                    local,
                    packet_id,
                    epoch,
                })
                .await;
        });
    }
}
