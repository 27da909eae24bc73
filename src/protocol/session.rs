//! 会话对外的双工管道
//! 每条传输连接对应两条管道：命令管道消费应用命令、产出出站字节，
//! 事件管道消费入站字节、产出应用事件。两条管道共享同一个会话 actor

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Duration};

use super::{ClientSessionTerminated, Command, Error, Event};

pub mod client;
pub mod server;

/// 命令连同应答通道一起进入会话 actor
pub(crate) type Ask<A> = (Command<A>, oneshot::Sender<Result<(), Error>>);

/// 命令管道
/// send 提交命令，next 拉取需要写给传输层的字节
/// 丢弃本管道（连同全部 sender 克隆）视为传输断开
pub struct CommandFlow<A> {
    cmd_tx: mpsc::Sender<Ask<A>>,
    bytes_rx: mpsc::Receiver<Bytes>,
    reply_timeout: Duration,
}

impl<A> CommandFlow<A> {
    pub(crate) fn new(
        cmd_tx: mpsc::Sender<Ask<A>>,
        bytes_rx: mpsc::Receiver<Bytes>,
        reply_timeout: Duration,
    ) -> Self {
        Self {
            cmd_tx,
            bytes_rx,
            reply_timeout,
        }
    }

    /// 提交一个命令，等待会话受理
    /// 受理即返回，不等待对端应答；对端应答以事件形式出现在事件管道
    pub async fn send(&self, command: Command<A>) -> Result<(), Error> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send((command, reply_tx))
            .await
            .map_err(|_| Error::SessionClosed)?;

        match time::timeout(self.reply_timeout, reply_rx).await {
            Err(_) => Err(Error::ReplyTimeout),
            Ok(Err(_)) => Err(Error::SessionClosed),
            Ok(Ok(result)) => result,
        }
    }

    /// 取一段需要原样写给传输层的字节，管道关闭时返回 None
    pub async fn next(&mut self) -> Option<Bytes> {
        self.bytes_rx.recv().await
    }

    /// 可克隆的提交端，便于从多个任务并发提交命令
    pub fn sender(&self) -> CommandSender<A> {
        CommandSender {
            cmd_tx: self.cmd_tx.clone(),
            reply_timeout: self.reply_timeout,
        }
    }
}

pub struct CommandSender<A> {
    cmd_tx: mpsc::Sender<Ask<A>>,
    reply_timeout: Duration,
}

impl<A> Clone for CommandSender<A> {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            reply_timeout: self.reply_timeout,
        }
    }
}

impl<A> CommandSender<A> {
    pub async fn send(&self, command: Command<A>) -> Result<(), Error> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send((command, reply_tx))
            .await
            .map_err(|_| Error::SessionClosed)?;

        match time::timeout(self.reply_timeout, reply_rx).await {
            Err(_) => Err(Error::ReplyTimeout),
            Ok(Err(_)) => Err(Error::SessionClosed),
            Ok(Ok(result)) => result,
        }
    }
}

/// 事件管道
/// feed 灌入传输层收到的字节（任意切分），next 拉取解码后的事件
/// 解码错误以 Err 形式出现，之后管道终止，连接必须关闭
pub struct EventFlow<A> {
    bytes_tx: mpsc::Sender<Bytes>,
    event_rx: mpsc::Receiver<Result<Event<A>, Error>>,
}

impl<A> EventFlow<A> {
    pub(crate) fn new(
        bytes_tx: mpsc::Sender<Bytes>,
        event_rx: mpsc::Receiver<Result<Event<A>, Error>>,
    ) -> Self {
        Self { bytes_tx, event_rx }
    }

    pub async fn feed(&self, bytes: Bytes) -> Result<(), Error> {
        self.bytes_tx
            .send(bytes)
            .await
            .map_err(|_| Error::SessionClosed)
    }

    pub async fn next(&mut self) -> Option<Result<Event<A>, Error>> {
        self.event_rx.recv().await
    }

    /// 可克隆的灌入端
    pub fn feeder(&self) -> EventFeeder {
        EventFeeder {
            bytes_tx: self.bytes_tx.clone(),
        }
    }
}

impl<A> Stream for EventFlow<A> {
    type Item = Result<Event<A>, Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.event_rx.poll_recv(cx)
    }
}

#[derive(Clone)]
pub struct EventFeeder {
    bytes_tx: mpsc::Sender<Bytes>,
}

impl EventFeeder {
    pub async fn feed(&self, bytes: Bytes) -> Result<(), Error> {
        self.bytes_tx
            .send(bytes)
            .await
            .map_err(|_| Error::SessionClosed)
    }
}

/// 客户端会话结束通知的订阅端
/// 缓冲有限，溢出时丢弃最新的通知，订阅者可能错过事件
pub struct ClientSessionWatch {
    rx: mpsc::Receiver<ClientSessionTerminated>,
}

impl ClientSessionWatch {
    pub(crate) fn new(rx: mpsc::Receiver<ClientSessionTerminated>) -> Self {
        Self { rx }
    }

    pub async fn next(&mut self) -> Option<ClientSessionTerminated> {
        self.rx.recv().await
    }
}

impl Stream for ClientSessionWatch {
    type Item = ClientSessionTerminated;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
