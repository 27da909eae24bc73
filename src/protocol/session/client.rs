//! 客户端会话
//! 会话状态的生命周期长于单条传输连接：clean_session = false 时
//! 在途交换跨连接保留，下一次握手成功后置 dup 重发

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use log::{debug, error, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Duration};

use crate::config::{self, MqttSessionSettings};
use crate::network::packet::v4::{Packet, Publish};
use crate::network::packet::{self, QoS};
use crate::network::Framer;
use crate::protocol::connector::{ClientConnector, ConnectorState, KeepAlive};
use crate::protocol::exchange::{
    Consumer, Exchange, Producer, ProducerState, Subscriber, TimeoutAction, Unsubscriber,
};
use crate::protocol::router::{self, LocalPacketRouter, RemotePacketRouter};
use crate::protocol::{Command, Error, Event};

use super::{Ask, CommandFlow, EventFlow};

/// 会话 actor 的邮箱消息
enum Incoming<A> {
    /// 应用命令
    Command(Ask<A>),
    /// 新的命令管道附着，seq 为传输代数
    AttachCommandFlow {
        seq: u64,
        out_tx: mpsc::Sender<Bytes>,
    },
    /// 新的事件管道附着
    AttachEventFlow {
        seq: u64,
        event_tx: mpsc::Sender<Result<Event<A>, Error>>,
    },
    /// 事件管道解出的报文
    Packet { seq: u64, packet: Packet },
    /// 事件管道解码失败，之后该管道不再有报文
    DecodeFailure { seq: u64, error: packet::Error },
    /// 任一管道结束
    ConnectionLost { seq: u64 },
    /// keepalive 定时器到点
    KeepAliveTimeout { epoch: u64 },
    /// ConnAck 等待超时
    ConnAckTimeout { epoch: u64 },
    /// 交换定时器到点，local 区分两张路由表
    ExchangeTimeout {
        local: bool,
        packet_id: u16,
        epoch: u64,
    },
    Shutdown,
}

/// 客户端会话
pub struct ClientSession<A> {
    tx: mpsc::Sender<Incoming<A>>,
    settings: MqttSessionSettings,
    /// 管道附着代数，用于作废旧传输的残留消息
    seq: Arc<AtomicU64>,
}

impl<A: Clone + Send + Sync + 'static> ClientSession<A> {
    pub fn new(settings: MqttSessionSettings) -> Result<Self, config::Error> {
        settings.validate()?;

        let (tx, rx) = mpsc::channel(settings.command_parallelism + settings.event_parallelism);
        let actor = ClientActor {
            settings: settings.clone(),
            rx,
            tx: tx.clone(),
            connector: ClientConnector::new(),
            local: LocalPacketRouter::new(),
            remote: RemotePacketRouter::new(),
            cmd: None,
            event: None,
            pending_connect_carry: None,
        };
        tokio::spawn(actor.run());

        Ok(Self {
            tx,
            settings,
            seq: Arc::new(AtomicU64::new(0)),
        })
    }

    /// 为当前传输连接附着命令管道
    /// 再次调用表示换用新的传输，旧管道随之失效
    pub async fn command_flow(&self) -> CommandFlow<A> {
        let seq = self.next_seq();
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<Ask<A>>(self.settings.command_parallelism);
        let (out_tx, out_rx) = mpsc::channel(self.settings.client_send_buffer_size);

        let _ = self
            .tx
            .send(Incoming::AttachCommandFlow { seq, out_tx })
            .await;

        let session_tx = self.tx.clone();
        tokio::spawn(async move {
            while let Some(ask) = cmd_rx.recv().await {
                if session_tx.send(Incoming::Command(ask)).await.is_err() {
                    return;
                }
            }
            // 应用弃掉了命令管道，视为传输断开
            let _ = session_tx.send(Incoming::ConnectionLost { seq }).await;
        });

        CommandFlow::new(cmd_tx, out_rx, self.settings.actor_mqtt_session_timeout())
    }

    /// 为当前传输连接附着事件管道
    pub async fn event_flow(&self) -> EventFlow<A> {
        let seq = self.next_seq();
        let (bytes_tx, mut bytes_rx) = mpsc::channel::<Bytes>(self.settings.event_parallelism);
        let (event_tx, event_rx) = mpsc::channel(self.settings.event_parallelism);

        let _ = self
            .tx
            .send(Incoming::AttachEventFlow { seq, event_tx })
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
                                        .send(Incoming::Packet { seq, packet })
                                        .await
                                        .is_err()
                                    {
                                        return;
                                    }
                                }
                                Err(error) => {
                                    let _ = session_tx
                                        .send(Incoming::DecodeFailure { seq, error })
                                        .await;
                                    return;
                                }
                            }
                        }
                        Ok(None) => break,
                        Err(error) => {
                            let _ = session_tx
                                .send(Incoming::DecodeFailure { seq, error })
                                .await;
                            return;
                        }
                    }
                }
            }
            let _ = session_tx.send(Incoming::ConnectionLost { seq }).await;
        });

        EventFlow::new(bytes_tx, event_rx)
    }

    /// 停止会话，之后提交的命令全部失败
    pub async fn shutdown(&self) {
        let _ = self.tx.send(Incoming::Shutdown).await;
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }
}

struct ClientActor<A> {
    settings: MqttSessionSettings,
    rx: mpsc::Receiver<Incoming<A>>,
    /// 给定时器任务用的回写端
    tx: mpsc::Sender<Incoming<A>>,
    connector: ClientConnector,
    /// 本端分配 id：Producer / Subscriber / Unsubscriber
    local: LocalPacketRouter<A>,
    /// 对端分配 id：Consumer
    remote: RemotePacketRouter<A>,
    /// 当前命令管道（代数，出站字节端）
    cmd: Option<(u64, mpsc::Sender<Bytes>)>,
    /// 当前事件管道（代数，事件端）
    event: Option<(u64, mpsc::Sender<Result<Event<A>, Error>>)>,
    /// Connect 命令的 carry，ConnAck 事件带回
    pending_connect_carry: Option<A>,
}

/// 本地路由表超时处理的去向
enum LocalTimeout {
    Resend(Packet, Duration),
    Abandon,
    Reap,
}

impl<A: Clone + Send + Sync + 'static> ClientActor<A> {
    async fn run(mut self) {
        while let Some(incoming) = self.rx.recv().await {
            match incoming {
                Incoming::Command((command, reply)) => self.handle_command(command, reply).await,
                Incoming::AttachCommandFlow { seq, out_tx } => {
                    self.cmd = Some((seq, out_tx));
                }
                Incoming::AttachEventFlow { seq, event_tx } => {
                    self.event = Some((seq, event_tx));
                }
                Incoming::Packet { seq, packet } => self.handle_packet(seq, packet).await,
                Incoming::DecodeFailure { seq, error } => {
                    if self.event_seq() == Some(seq) {
                        self.fail_flows(Error::Packet(error)).await;
                    }
                }
                Incoming::ConnectionLost { seq } => {
                    if self.cmd_seq() == Some(seq) || self.event_seq() == Some(seq) {
                        debug!("transport lost");
                        self.connection_lost();
                    }
                }
                Incoming::KeepAliveTimeout { epoch } => self.handle_keep_alive(epoch).await,
                Incoming::ConnAckTimeout { epoch } => {
                    if epoch == self.connector.epoch
                        && self.connector.state == ConnectorState::ConnectSent
                    {
                        self.fail_flows(Error::ReceiveConnAckTimeout).await;
                    }
                }
                Incoming::ExchangeTimeout {
                    local,
                    packet_id,
                    epoch,
                } => self.handle_exchange_timeout(local, packet_id, epoch).await,
                Incoming::Shutdown => break,
            }
        }
    }

    async fn handle_command(&mut self, command: Command<A>, reply: oneshot::Sender<Result<(), Error>>) {
        match self.dispatch_command(command) {
            Ok(Some(bytes)) => {
                // 先受理再写出，写出的背压不阻塞应答
                let _ = reply.send(Ok(()));
                self.emit_bytes(bytes).await;
            }
            Ok(None) => {
                let _ = reply.send(Ok(()));
            }
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
    }

    /// 命令分派，返回需要写出的字节
    fn dispatch_command(&mut self, command: Command<A>) -> Result<Option<Bytes>, Error> {
        let Command { packet, carry } = command;
        match packet {
            Packet::Connect(connect) => {
                self.connector
                    .connect(connect.keep_alive, connect.clean_session)?;
                if connect.clean_session {
                    // 新会话，丢弃上一条连接留下的在途交换
                    self.local.clear();
                    self.remote.clear();
                }
                self.pending_connect_carry = Some(carry);
                self.arm_conn_ack_timer();
                Ok(Some(Self::encode(&Packet::Connect(connect))?))
            }
            Packet::Publish(publish) => self.start_producer(publish, carry),
            Packet::PubAck(_) | Packet::PubRec(_) | Packet::PubComp(_) => {
                self.consumer_command(packet)
            }
            Packet::Subscribe(mut subscribe) => {
                let id = self
                    .local
                    .register(Exchange::Subscriber(Subscriber::new(carry)))?;
                subscribe.packet_id = id;
                match Self::encode(&Packet::Subscribe(subscribe)) {
                    Ok(bytes) => {
                        self.arm_exchange_timer(
                            true,
                            id,
                            0,
                            self.settings.actor_mqtt_session_timeout(),
                        );
                        Ok(Some(bytes))
                    }
                    Err(e) => {
                        self.local.release(id);
                        Err(e)
                    }
                }
            }
            Packet::Unsubscribe(mut unsubscribe) => {
                let id = self
                    .local
                    .register(Exchange::Unsubscriber(Unsubscriber::new(carry)))?;
                unsubscribe.packet_id = id;
                match Self::encode(&Packet::Unsubscribe(unsubscribe)) {
                    Ok(bytes) => {
                        self.arm_exchange_timer(
                            true,
                            id,
                            0,
                            self.settings.actor_mqtt_session_timeout(),
                        );
                        Ok(Some(bytes))
                    }
                    Err(e) => {
                        self.local.release(id);
                        Err(e)
                    }
                }
            }
            Packet::Disconnect => {
                if self.connector.disconnect() {
                    Ok(Some(Self::encode(&Packet::Disconnect)?))
                } else {
                    // 重复的 Disconnect 不再写出
                    Ok(None)
                }
            }
            other => Err(Error::IllegalCommand(other.packet_type())),
        }
    }

    /// QoS1/QoS2 的出站 Publish 注册为 Producer 交换
    fn start_producer(&mut self, publish: Publish, carry: A) -> Result<Option<Bytes>, Error> {
        if publish.qos == QoS::AtMostOnce {
            return Ok(Some(Self::encode(&Packet::Publish(publish))?));
        }

        let id = self
            .local
            .register(Exchange::Producer(Producer::new(publish, carry)))?;
        let wire = {
            let entry = self.local.get_mut(id).unwrap();
            let Exchange::Producer(producer) = &mut entry.exchange else {
                unreachable!()
            };
            producer.set_packet_id(id);
            producer.first_wire()
        };

        match Self::encode(&wire) {
            Ok(bytes) => {
                self.arm_exchange_timer(true, id, 0, self.settings.producer_pub_ack_rec_timeout());
                Ok(Some(bytes))
            }
            Err(e) => {
                self.local.release(id);
                Err(e)
            }
        }
    }

    /// 应用对入站 Publish 的本地应答（PubAck/PubRec/PubComp 命令）
    fn consumer_command(&mut self, packet: Packet) -> Result<Option<Bytes>, Error> {
        let id = packet
            .packet_id()
            .ok_or(Error::IllegalCommand(packet.packet_type()))?;

        let (action, epoch) = {
            let entry = self
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
            self.remote.release(id);
        } else {
            // PubRec 已写出，等待对端 PubRel
            self.arm_exchange_timer(false, id, epoch, self.settings.consumer_pub_rel_timeout());
        }

        match action.wire {
            Some(wire) => Ok(Some(Self::encode(&wire)?)),
            None => Ok(None),
        }
    }

    async fn handle_packet(&mut self, seq: u64, packet: Packet) {
        if self.event_seq() != Some(seq) {
            // 旧连接的残留报文
            return;
        }

        match packet {
            Packet::ConnAck(ref ack) => match self.connector.connack(ack.code) {
                Ok(()) => {
                    let carry = self.pending_connect_carry.take();
                    self.surface(Ok(Event { packet, carry })).await;
                    self.arm_keep_alive_timer(self.connector.keep_alive());
                    self.resume_producers().await;
                }
                Err(e) => self.fail_flows(e).await,
            },
            Packet::Publish(publish) => self.handle_inbound_publish(publish).await,
            Packet::PubAck(_)
            | Packet::PubRec(_)
            | Packet::PubComp(_)
            | Packet::SubAck(_)
            | Packet::UnsubAck(_) => self.route_local(packet).await,
            Packet::PubRel(_) => self.route_remote(packet).await,
            Packet::PingResp => self.connector.pingresp(),
            other => {
                // 客户端不应收到的报文方向
                self.fail_flows(Error::IllegalProtocolEvent(other.packet_type()))
                    .await;
            }
        }
    }

    async fn handle_inbound_publish(&mut self, publish: Publish) {
        if publish.qos == QoS::AtMostOnce {
            self.surface(Ok(Event::uncorrelated(Packet::Publish(publish))))
                .await;
            return;
        }

        let id = publish.packet_id;
        if self.remote.contains(id) {
            // 对端重发的 Publish，交换未终止期间不重复投递
            debug!("duplicate publish for in-flight packet id {}, dropped", id);
            return;
        }

        let qos = publish.qos;
        if let Err(e) = self
            .remote
            .register(id, Exchange::Consumer(Consumer::new(qos)))
        {
            warn!("register consumer for packet id {} failed: {}", id, e);
            return;
        }
        self.arm_exchange_timer(false, id, 0, self.settings.consumer_pub_ack_rec_timeout());
        self.surface(Ok(Event::uncorrelated(Packet::Publish(publish))))
            .await;
    }

    /// 对端应答路由到本端分配 id 的交换
    async fn route_local(&mut self, packet: Packet) {
        let Some(id) = packet.packet_id() else { return };

        let outcome = {
            let Some(entry) = self.local.get_mut(id) else {
                // 3.1.1 对未知包 id 的应答不要求断开
                warn!("{:?} for unknown packet id {}, dropped", packet.packet_type(), id);
                return;
            };
            let action = match &mut entry.exchange {
                Exchange::Producer(producer) => producer.on_packet(&packet),
                Exchange::Subscriber(subscriber) => subscriber.on_packet(&packet),
                Exchange::Unsubscriber(unsubscriber) => unsubscriber.on_packet(&packet),
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
            self.local.release(id);
        } else {
            // Producer 收到 PubRec 后等待 PubComp
            self.arm_exchange_timer(true, id, epoch, self.settings.producer_pub_comp_timeout());
        }
        if let Some(wire) = action.wire {
            self.emit(wire).await;
        }
        if let Some(event) = action.event {
            self.surface(Ok(event)).await;
        }
    }

    /// 对端报文路由到对端分配 id 的交换（PubRel）
    async fn route_remote(&mut self, packet: Packet) {
        let Some(id) = packet.packet_id() else { return };

        let outcome = {
            let Some(entry) = self.remote.get_mut(id) else {
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
            self.remote.release(id);
        } else {
            // PubRel 已上抛，等待应用给出 PubComp 命令
            self.arm_exchange_timer(false, id, epoch, self.settings.consumer_pub_comp_timeout());
        }
        if let Some(wire) = action.wire {
            self.emit(wire).await;
        }
        if let Some(event) = action.event {
            self.surface(Ok(event)).await;
        }
    }

    /// 握手成功后重发上一条连接留下的在途消息（dup 置位）
    async fn resume_producers(&mut self) {
        for id in self.local.ids() {
            let resend = {
                let Some(entry) = self.local.get_mut(id) else {
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
            self.arm_exchange_timer(true, id, epoch, timeout);
            self.emit(wire).await;
        }
    }

    async fn handle_keep_alive(&mut self, epoch: u64) {
        if epoch != self.connector.epoch {
            return;
        }
        match self.connector.keep_alive_tick() {
            Ok(KeepAlive::Ping) => {
                self.emit(Packet::PingReq).await;
                self.arm_keep_alive_timer(self.connector.keep_alive());
            }
            Ok(KeepAlive::Sleep(remaining)) => self.arm_keep_alive_timer(remaining),
            Ok(KeepAlive::Stop) => {}
            Err(e) => self.fail_flows(e).await,
        }
    }

    async fn handle_exchange_timeout(&mut self, local: bool, id: u16, epoch: u64) {
        if !local {
            // Consumer 到期静默回收
            let stale = match self.remote.get_mut(id) {
                Some(entry) => entry.epoch != epoch,
                None => true,
            };
            if !stale {
                debug!("consumer exchange timed out, packet id {} released", id);
                self.remote.release(id);
            }
            return;
        }

        let outcome = {
            let Some(entry) = self.local.get_mut(id) else { return };
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
                // 订阅类交换到期直接回收
                _ => LocalTimeout::Reap,
            }
        };

        match outcome {
            LocalTimeout::Resend(packet, timeout) => {
                self.arm_exchange_timer(true, id, epoch, timeout);
                self.emit(packet).await;
            }
            LocalTimeout::Abandon => {
                warn!("producer exchange abandoned, packet id {}", id);
                self.local.release(id);
                self.surface(Err(Error::ExchangeAbandoned(id))).await;
            }
            LocalTimeout::Reap => {
                debug!("exchange timed out, packet id {} released", id);
                self.local.release(id);
            }
        }
    }

    /// 跨切面错误：上抛错误事件，然后关闭两条管道
    async fn fail_flows(&mut self, error: Error) {
        warn!("session flows failed: {}", error);
        if let Some((_, event_tx)) = &self.event {
            let _ = event_tx.send(Err(error)).await;
        }
        self.connection_lost();
    }

    fn connection_lost(&mut self) {
        self.cmd = None;
        self.event = None;
        self.pending_connect_carry = None;
        self.connector.connection_lost();
        if self.connector.clean_session {
            self.local.clear();
            self.remote.clear();
        }
    }

    async fn emit(&mut self, packet: Packet) {
        match Self::encode(&packet) {
            Ok(bytes) => self.emit_bytes(bytes).await,
            Err(e) => error!("encode outbound {:?} failed: {}", packet.packet_type(), e),
        }
    }

    async fn emit_bytes(&mut self, bytes: Bytes) {
        let Some((_, out_tx)) = &self.cmd else {
            debug!("no command flow attached, outbound bytes dropped");
            return;
        };
        if out_tx.send(bytes).await.is_err() {
            debug!("command flow gone, outbound bytes dropped");
        }
        self.connector.record_tx();
    }

    async fn surface(&self, event: Result<Event<A>, Error>) {
        let Some((_, event_tx)) = &self.event else {
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

    fn arm_conn_ack_timer(&self) {
        let epoch = self.connector.epoch;
        let delay = self.settings.receive_conn_ack_timeout();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            time::sleep(delay).await;
            let _ = tx.send(Incoming::ConnAckTimeout { epoch }).await;
        });
    }

    fn arm_keep_alive_timer(&self, delay: Duration) {
        if !self.connector.keep_alive_enabled() {
            return;
        }
        let epoch = self.connector.epoch;
        let tx = self.tx.clone();
        tokio::spawn(async move {
            time::sleep(delay).await;
            let _ = tx.send(Incoming::KeepAliveTimeout { epoch }).await;
        });
    }

    fn arm_exchange_timer(&self, local: bool, packet_id: u16, epoch: u64, delay: Duration) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            time::sleep(delay).await;
            let _ = tx
                .send(Incoming::ExchangeTimeout {
                    local,
                    packet_id,
                    epoch,
                })
                .await;
        });
    }

    fn cmd_seq(&self) -> Option<u64> {
        self.cmd.as_ref().map(|(seq, _)| *seq)
    }

    fn event_seq(&self) -> Option<u64> {
        self.event.as_ref().map(|(seq, _)| *seq)
    }
}
