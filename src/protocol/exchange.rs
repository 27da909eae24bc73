//! 每个在途包 id 对应一个小状态机
//! 状态机本身不做 IO，迁移只返回需要写出的报文和需要上抛的事件，
//! 由会话负责落地和定时器管理

use crate::network::packet::v4::{Packet, PubRel, Publish};
use crate::network::packet::QoS;

use super::{Error, Event};

/// 一次状态迁移的产物
#[derive(Debug)]
pub(crate) struct Action<A> {
    /// 需要写给对端的报文
    pub(crate) wire: Option<Packet>,
    /// 需要上抛给应用的事件
    pub(crate) event: Option<Event<A>>,
    /// 交换是否已终止（终止后包 id 立即可复用）
    pub(crate) done: bool,
}

impl<A> Action<A> {
    fn new(wire: Option<Packet>, event: Option<Event<A>>, done: bool) -> Self {
        Self { wire, event, done }
    }
}

/// 超时处理结果
pub(crate) enum TimeoutAction {
    /// 重发报文，保持在途
    Resend(Packet),
    /// 放弃交换
    Abandon,
}

pub(crate) enum Exchange<A> {
    Producer(Producer<A>),
    Consumer(Consumer),
    Subscriber(Subscriber<A>),
    Unsubscriber(Unsubscriber<A>),
    Publisher(Publisher),
    Unpublisher(Unpublisher),
}

/// 本端发出的 QoS1/QoS2 Publish
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ProducerState {
    AwaitingPubAck,
    AwaitingPubRec,
    AwaitingPubComp,
}

pub(crate) struct Producer<A> {
    /// 原始报文，重发时置 dup 后原样再写
    publish: Publish,
    carry: A,
    pub(crate) state: ProducerState,
    /// 已重发次数
    attempts: u8,
}

impl<A: Clone> Producer<A> {
    pub(crate) fn new(publish: Publish, carry: A) -> Self {
        let state = match publish.qos {
            QoS::AtLeastOnce => ProducerState::AwaitingPubAck,
            _ => ProducerState::AwaitingPubRec,
        };
        Self {
            publish,
            carry,
            state,
            attempts: 0,
        }
    }

    /// 路由表分配到的包 id 回填进报文
    pub(crate) fn set_packet_id(&mut self, id: u16) {
        self.publish.packet_id = id;
    }

    /// 首次写出的报文
    pub(crate) fn first_wire(&self) -> Packet {
        Packet::Publish(self.publish.clone())
    }

    /// 当前状态下需要重发的报文（dup 置位）
    pub(crate) fn resend_wire(&mut self) -> Packet {
        match self.state {
            ProducerState::AwaitingPubAck | ProducerState::AwaitingPubRec => {
                self.publish.dup = true;
                Packet::Publish(self.publish.clone())
            }
            ProducerState::AwaitingPubComp => Packet::PubRel(PubRel {
                packet_id: self.publish.packet_id,
            }),
        }
    }

    /// 对端的应答报文
    /// 不符合当前状态的应答返回 None，由调用方记日志后丢弃
    pub(crate) fn on_packet(&mut self, packet: &Packet) -> Option<Action<A>> {
        match (&self.state, packet) {
            (ProducerState::AwaitingPubAck, Packet::PubAck(_)) => Some(Action::new(
                None,
                Some(Event::correlated(packet.clone(), self.carry.clone())),
                true,
            )),
            (ProducerState::AwaitingPubRec, Packet::PubRec(ack)) => {
                self.state = ProducerState::AwaitingPubComp;
                self.attempts = 0;
                Some(Action::new(
                    Some(Packet::PubRel(PubRel {
                        packet_id: ack.packet_id,
                    })),
                    Some(Event::correlated(packet.clone(), self.carry.clone())),
                    false,
                ))
            }
            (ProducerState::AwaitingPubComp, Packet::PubComp(_)) => Some(Action::new(
                None,
                Some(Event::correlated(packet.clone(), self.carry.clone())),
                true,
            )),
            _ => None,
        }
    }

    /// 应答超时：重发直到次数耗尽
    pub(crate) fn on_timeout(&mut self, max_attempts: u8) -> TimeoutAction {
        if self.attempts >= max_attempts {
            return TimeoutAction::Abandon;
        }
        self.attempts += 1;
        TimeoutAction::Resend(self.resend_wire())
    }
}

/// 对端发来的 QoS1/QoS2 Publish
/// 本地应答（PubAck/PubRec/PubComp）由应用以命令形式提供
/// 重发的 Publish 不会进到这里：会话在路由之前就按远端表中
/// 已有的包 id 把它丢掉了
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ConsumerState {
    AwaitingLocalPubAck,
    AwaitingLocalPubRec,
    AwaitingPubRel,
    AwaitingLocalPubComp,
}

pub(crate) struct Consumer {
    pub(crate) state: ConsumerState,
}

impl Consumer {
    pub(crate) fn new(qos: QoS) -> Self {
        let state = match qos {
            QoS::AtLeastOnce => ConsumerState::AwaitingLocalPubAck,
            _ => ConsumerState::AwaitingLocalPubRec,
        };
        Self { state }
    }

    /// 对端的报文（PubRel）
    pub(crate) fn on_packet<A>(&mut self, packet: &Packet) -> Option<Action<A>> {
        match (&self.state, packet) {
            (ConsumerState::AwaitingPubRel, Packet::PubRel(_)) => {
                self.state = ConsumerState::AwaitingLocalPubComp;
                Some(Action::new(
                    None,
                    Some(Event::uncorrelated(packet.clone())),
                    false,
                ))
            }
            _ => None,
        }
    }

    /// 应用提供的本地应答命令
    pub(crate) fn on_command<A>(&mut self, packet: &Packet) -> Result<Action<A>, Error> {
        match (&self.state, packet) {
            (ConsumerState::AwaitingLocalPubAck, Packet::PubAck(_)) => {
                Ok(Action::new(Some(packet.clone()), None, true))
            }
            (ConsumerState::AwaitingLocalPubRec, Packet::PubRec(_)) => {
                self.state = ConsumerState::AwaitingPubRel;
                Ok(Action::new(Some(packet.clone()), None, false))
            }
            (ConsumerState::AwaitingLocalPubComp, Packet::PubComp(_)) => {
                Ok(Action::new(Some(packet.clone()), None, true))
            }
            _ => Err(Error::IllegalCommand(packet.packet_type())),
        }
    }
}

/// 本端发出的 Subscribe，等待 SubAck
pub(crate) struct Subscriber<A> {
    carry: A,
}

impl<A: Clone> Subscriber<A> {
    pub(crate) fn new(carry: A) -> Self {
        Self { carry }
    }

    pub(crate) fn on_packet(&mut self, packet: &Packet) -> Option<Action<A>> {
        match packet {
            Packet::SubAck(_) => Some(Action::new(
                None,
                Some(Event::correlated(packet.clone(), self.carry.clone())),
                true,
            )),
            _ => None,
        }
    }
}

/// 本端发出的 Unsubscribe，等待 UnsubAck
pub(crate) struct Unsubscriber<A> {
    carry: A,
}

impl<A: Clone> Unsubscriber<A> {
    pub(crate) fn new(carry: A) -> Self {
        Self { carry }
    }

    pub(crate) fn on_packet(&mut self, packet: &Packet) -> Option<Action<A>> {
        match packet {
            Packet::UnsubAck(_) => Some(Action::new(
                None,
                Some(Event::correlated(packet.clone(), self.carry.clone())),
                true,
            )),
            _ => None,
        }
    }
}

/// 服务端收到 Subscribe 之后，等待应用给出 SubAck 命令
pub(crate) struct Publisher;

impl Publisher {
    pub(crate) fn on_command<A>(&mut self, packet: &Packet) -> Result<Action<A>, Error> {
        match packet {
            Packet::SubAck(_) => Ok(Action::new(Some(packet.clone()), None, true)),
            _ => Err(Error::IllegalCommand(packet.packet_type())),
        }
    }
}

/// 服务端收到 Unsubscribe 之后，等待应用给出 UnsubAck 命令
pub(crate) struct Unpublisher;

impl Unpublisher {
    pub(crate) fn on_command<A>(&mut self, packet: &Packet) -> Result<Action<A>, Error> {
        match packet {
            Packet::UnsubAck(_) => Ok(Action::new(Some(packet.clone()), None, true)),
            _ => Err(Error::IllegalCommand(packet.packet_type())),
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use crate::network::packet::v4::{PubAck, PubComp, PubRec};
    use crate::network::packet::PacketType;

    use super::*;

    fn publish(qos: QoS, packet_id: u16) -> Publish {
        Publish {
            dup: false,
            qos,
            retain: false,
            topic: "t".into(),
            packet_id,
            payload: Bytes::from_static(b"x"),
        }
    }

    #[test]
    fn producer_qos1_completes_on_puback() {
        let mut producer = Producer::new(publish(QoS::AtLeastOnce, 1), "k1");
        assert_eq!(producer.state, ProducerState::AwaitingPubAck);

        let ack = Packet::PubAck(PubAck { packet_id: 1 });
        let action = producer.on_packet(&ack).unwrap();
        assert!(action.done);
        assert!(action.wire.is_none());
        let event = action.event.unwrap();
        assert_eq!(event.carry, Some("k1"));
        assert_eq!(event.packet, ack);
    }

    #[test]
    fn producer_qos2_full_round() {
        let mut producer = Producer::new(publish(QoS::ExactlyOnce, 3), "k2");
        assert_eq!(producer.state, ProducerState::AwaitingPubRec);

        let rec = producer
            .on_packet(&Packet::PubRec(PubRec { packet_id: 3 }))
            .unwrap();
        assert!(!rec.done);
        assert_eq!(rec.wire, Some(Packet::PubRel(PubRel { packet_id: 3 })));
        assert_eq!(rec.event.unwrap().carry, Some("k2"));

        let comp = producer
            .on_packet(&Packet::PubComp(PubComp { packet_id: 3 }))
            .unwrap();
        assert!(comp.done);
        assert_eq!(comp.event.unwrap().carry, Some("k2"));
    }

    #[test]
    fn producer_resends_with_dup_then_abandons() {
        let mut producer = Producer::new(publish(QoS::AtLeastOnce, 1), ());

        match producer.on_timeout(2) {
            TimeoutAction::Resend(Packet::Publish(publish)) => assert!(publish.dup),
            _ => panic!("expected dup resend"),
        }
        assert!(matches!(
            producer.on_timeout(2),
            TimeoutAction::Resend(Packet::Publish(_))
        ));
        assert!(matches!(producer.on_timeout(2), TimeoutAction::Abandon));
    }

    #[test]
    fn producer_resends_pubrel_while_awaiting_pubcomp() {
        let mut producer = Producer::new(publish(QoS::ExactlyOnce, 7), ());
        producer
            .on_packet(&Packet::PubRec(PubRec { packet_id: 7 }))
            .unwrap();

        match producer.on_timeout(3) {
            TimeoutAction::Resend(packet) => {
                assert_eq!(packet, Packet::PubRel(PubRel { packet_id: 7 }))
            }
            TimeoutAction::Abandon => panic!("expected pubrel resend"),
        }
    }

    #[test]
    fn producer_ignores_out_of_order_ack() {
        let mut producer = Producer::new(publish(QoS::ExactlyOnce, 5), ());
        assert!(producer
            .on_packet(&Packet::PubComp(PubComp { packet_id: 5 }))
            .is_none());
    }

    #[test]
    fn consumer_qos1_acked_by_command() {
        let mut consumer = Consumer::new(QoS::AtLeastOnce);
        let action = consumer
            .on_command::<()>(&Packet::PubAck(PubAck { packet_id: 2 }))
            .unwrap();
        assert!(action.done);
        assert_eq!(action.wire, Some(Packet::PubAck(PubAck { packet_id: 2 })));
    }

    #[test]
    fn consumer_qos2_sequence() {
        let mut consumer = Consumer::new(QoS::ExactlyOnce);

        let rec = consumer
            .on_command::<()>(&Packet::PubRec(PubRec { packet_id: 4 }))
            .unwrap();
        assert!(!rec.done);
        assert_eq!(consumer.state, ConsumerState::AwaitingPubRel);

        // 重发的 Publish 由会话按远端表丢弃，不会路由进交换
        assert!(consumer
            .on_packet::<()>(&Packet::Publish(publish(QoS::ExactlyOnce, 4)))
            .is_none());

        let rel = consumer
            .on_packet::<()>(&Packet::PubRel(PubRel { packet_id: 4 }))
            .unwrap();
        assert_eq!(consumer.state, ConsumerState::AwaitingLocalPubComp);
        assert_eq!(rel.event.unwrap().carry, None);

        let comp = consumer
            .on_command::<()>(&Packet::PubComp(PubComp { packet_id: 4 }))
            .unwrap();
        assert!(comp.done);
    }

    #[test]
    fn consumer_rejects_wrong_local_ack() {
        let mut consumer = Consumer::new(QoS::AtLeastOnce);
        let err = consumer
            .on_command::<()>(&Packet::PubComp(PubComp { packet_id: 2 }))
            .unwrap_err();
        assert!(matches!(err, Error::IllegalCommand(PacketType::PubComp)));
    }

    #[test]
    fn subscriber_carries_token_to_suback() {
        use crate::network::packet::v4::{SubAck, SubscribeReasonCode};

        let mut subscriber = Subscriber::new("sub-1");
        let suback = Packet::SubAck(SubAck {
            packet_id: 1,
            return_codes: vec![SubscribeReasonCode::Success(QoS::AtLeastOnce)],
        });
        let action = subscriber.on_packet(&suback).unwrap();
        assert!(action.done);
        assert_eq!(action.event.unwrap().carry, Some("sub-1"));
    }
}
