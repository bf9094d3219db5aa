//! 事件广播中心
//!
//! 按会话维护订阅者集合，每个订阅者一条独立的有界队列。
//! attach / detach / publish 在同一把锁下串行执行。
//! 会话通道由 [`EventHub::open_session`] 或 attach 建立，未知会话的事件直接丢弃。

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::event::CanonicalEvent;

/// 订阅者 ID
pub type SubscriberId = u64;

/// 订阅者收到的内容
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Event(CanonicalEvent),
    /// 保活窗口内没有事件
    Ping,
}

/// 单个订阅
pub struct Subscription {
    session_id: String,
    id: SubscriberId,
    rx: mpsc::Receiver<CanonicalEvent>,
    keepalive: Duration,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// 接收下一条；保活窗口内无事件返回 `Ping`，被 detach 后返回 None
    pub async fn recv(&mut self) -> Option<Delivery> {
        match tokio::time::timeout(self.keepalive, self.rx.recv()).await {
            Ok(Some(event)) => Some(Delivery::Event(event)),
            Ok(None) => None,
            Err(_) => Some(Delivery::Ping),
        }
    }

    /// 非阻塞接收
    pub fn try_recv(&mut self) -> Option<CanonicalEvent> {
        self.rx.try_recv().ok()
    }
}

/// 一次推送的结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Published {
    /// 送达的订阅者数
    pub delivered: usize,
    /// 推送前有订阅者，移除已关闭的队列后一个不剩
    pub emptied: bool,
}

/// 会话通道：订阅者 + 无人订阅时的积压
#[derive(Default)]
struct SessionChannel {
    subscribers: HashMap<SubscriberId, mpsc::Sender<CanonicalEvent>>,
    backlog: VecDeque<CanonicalEvent>,
}

/// 事件广播中心
pub struct EventHub {
    sessions: RwLock<HashMap<String, SessionChannel>>,
    next_id: AtomicU64,
    queue_capacity: usize,
    keepalive: Duration,
}

impl EventHub {
    pub fn new(queue_capacity: usize, keepalive: Duration) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            queue_capacity: queue_capacity.max(1),
            keepalive,
        })
    }

    /// 建立会话通道（已存在时不变）
    pub fn open_session(&self, session_id: &str) {
        self.sessions.write().entry(session_id.to_string()).or_default();
    }

    /// 订阅会话；第一个订阅者会收到无人订阅期间积压的事件
    pub fn attach(&self, session_id: &str) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.queue_capacity);

        let mut sessions = self.sessions.write();
        let channel = sessions.entry(session_id.to_string()).or_default();

        let drained = channel.backlog.len();
        for event in channel.backlog.drain(..) {
            // 积压上限等于队列容量，不会溢出
            let _ = tx.try_send(event);
        }
        channel.subscribers.insert(id, tx);

        tracing::debug!(
            "📡 Subscriber attached: session={}, id={}, backlog={}, subscribers={}",
            session_id,
            id,
            drained,
            channel.subscribers.len()
        );

        Subscription {
            session_id: session_id.to_string(),
            id,
            rx,
            keepalive: self.keepalive,
        }
    }

    /// 取消订阅，返回会话剩余订阅者数；订阅者不存在时返回 None
    pub fn detach(&self, session_id: &str, id: SubscriberId) -> Option<usize> {
        let mut sessions = self.sessions.write();
        let channel = sessions.get_mut(session_id)?;
        channel.subscribers.remove(&id)?;
        let remaining = channel.subscribers.len();
        tracing::debug!(
            "📡 Subscriber detached: session={}, id={}, remaining={}",
            session_id,
            id,
            remaining
        );
        Some(remaining)
    }

    /// 推送事件给会话的所有订阅者
    ///
    /// 无订阅者时事件进入积压（满了丢最旧的）；队列满只丢该订阅者的这一条；
    /// 队列已关闭的订阅者被移除。会话通道不存在时什么也不做。
    pub fn publish(&self, session_id: &str, event: CanonicalEvent) -> Published {
        self.push(session_id, event, true)
    }

    /// 推送一次执行的终止事件
    ///
    /// 与 [`publish`](Self::publish) 相同，但无订阅者时不进积压，并丢弃这次执行积压的全部事件：
    /// 之后订阅的客户端看不到已经结束的执行。
    pub fn publish_terminal(&self, session_id: &str, event: CanonicalEvent) -> Published {
        self.push(session_id, event, false)
    }

    fn push(&self, session_id: &str, event: CanonicalEvent, retain: bool) -> Published {
        let mut sessions = self.sessions.write();
        let Some(channel) = sessions.get_mut(session_id) else {
            tracing::trace!("📡 No channel for session {}, dropping {}", session_id, event.event_name());
            return Published::default();
        };

        if channel.subscribers.is_empty() && !retain {
            let dropped = channel.backlog.len();
            channel.backlog.clear();
            tracing::debug!(
                "📡 No subscriber for {}, backlog discarded: session={}, events={}",
                event.event_name(),
                session_id,
                dropped
            );
            return Published::default();
        }

        if channel.subscribers.is_empty() {
            if channel.backlog.len() >= self.queue_capacity {
                channel.backlog.pop_front();
                tracing::debug!("📡 Backlog full, dropping oldest: session={}", session_id);
            }
            channel.backlog.push_back(event);
            return Published::default();
        }

        let mut delivered = 0;
        let mut closed = Vec::new();
        for (id, sender) in &channel.subscribers {
            match sender.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(
                        "📡 Queue full, dropping {} event: session={}, id={}",
                        event.event_name(),
                        session_id,
                        id
                    );
                }
                Err(TrySendError::Closed(_)) => closed.push(*id),
            }
        }

        for id in &closed {
            channel.subscribers.remove(id);
            tracing::debug!("📡 Queue closed, detaching: session={}, id={}", session_id, id);
        }

        Published {
            delivered,
            emptied: !closed.is_empty() && channel.subscribers.is_empty(),
        }
    }

    /// 关闭会话通道：所有订阅者的接收端结束，积压丢弃
    pub fn close_session(&self, session_id: &str) -> usize {
        match self.sessions.write().remove(session_id) {
            Some(channel) => {
                let count = channel.subscribers.len();
                tracing::debug!("📡 Session channel closed: session={}, subscribers={}", session_id, count);
                count
            }
            None => 0,
        }
    }

    /// 会话当前订阅者数
    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.sessions
            .read()
            .get(session_id)
            .map(|c| c.subscribers.len())
            .unwrap_or(0)
    }

    /// 会话积压事件数
    pub fn backlog_len(&self, session_id: &str) -> usize {
        self.sessions
            .read()
            .get(session_id)
            .map(|c| c.backlog.len())
            .unwrap_or(0)
    }

    /// 所有会话的订阅者总数
    pub fn total_subscribers(&self) -> usize {
        self.sessions.read().values().map(|c| c.subscribers.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(content: &str) -> CanonicalEvent {
        CanonicalEvent::Text {
            content: content.to_string(),
        }
    }

    #[test]
    fn test_fan_out_preserves_order() {
        let hub = EventHub::new(16, Duration::from_secs(30));
        let mut a = hub.attach("s1");
        let mut b = hub.attach("s1");
        let mut other = hub.attach("s2");

        for i in 0..3 {
            assert_eq!(hub.publish("s1", text(&i.to_string())).delivered, 2);
        }

        for sub in [&mut a, &mut b] {
            let got: Vec<_> = std::iter::from_fn(|| sub.try_recv()).collect();
            assert_eq!(got, vec![text("0"), text("1"), text("2")]);
        }
        assert!(other.try_recv().is_none());
    }

    #[test]
    fn test_full_queue_only_affects_slow_subscriber() {
        let hub = EventHub::new(2, Duration::from_secs(30));
        let mut slow = hub.attach("s1");
        let mut fast = hub.attach("s1");

        for i in 0..4 {
            hub.publish("s1", text(&i.to_string()));
            // fast 每条都及时取走
            assert_eq!(fast.try_recv(), Some(text(&i.to_string())));
        }

        let got: Vec<_> = std::iter::from_fn(|| slow.try_recv()).collect();
        assert_eq!(got, vec![text("0"), text("1")]);
        assert_eq!(hub.subscriber_count("s1"), 2);
    }

    #[test]
    fn test_closed_subscriber_detached_on_publish() {
        let hub = EventHub::new(4, Duration::from_secs(30));
        let gone = hub.attach("s1");
        let mut alive = hub.attach("s1");
        drop(gone);

        let published = hub.publish("s1", text("x"));
        assert_eq!(published.delivered, 1);
        assert!(!published.emptied);
        assert_eq!(hub.subscriber_count("s1"), 1);
        assert_eq!(alive.try_recv(), Some(text("x")));
    }

    #[test]
    fn test_last_closed_subscriber_reports_emptied() {
        let hub = EventHub::new(4, Duration::from_secs(30));
        let gone = hub.attach("s1");
        drop(gone);

        let published = hub.publish("s1", text("x"));
        assert_eq!(published, Published { delivered: 0, emptied: true });
        assert_eq!(hub.subscriber_count("s1"), 0);

        // 已经没有订阅者，再推送只进积压
        assert!(!hub.publish("s1", text("y")).emptied);
        assert_eq!(hub.backlog_len("s1"), 1);
    }

    #[test]
    fn test_backlog_drained_by_first_subscriber() {
        let hub = EventHub::new(2, Duration::from_secs(30));
        hub.open_session("s1");
        hub.publish("s1", text("0"));
        hub.publish("s1", text("1"));
        hub.publish("s1", text("2"));
        assert_eq!(hub.backlog_len("s1"), 2);

        let mut first = hub.attach("s1");
        let mut second = hub.attach("s1");
        let got: Vec<_> = std::iter::from_fn(|| first.try_recv()).collect();
        assert_eq!(got, vec![text("1"), text("2")]);
        assert!(second.try_recv().is_none());
        assert_eq!(hub.backlog_len("s1"), 0);
    }

    #[test]
    fn test_undelivered_terminal_discards_backlog() {
        let hub = EventHub::new(4, Duration::from_secs(30));
        hub.open_session("s1");
        hub.publish("s1", text("stale"));
        assert_eq!(hub.backlog_len("s1"), 1);

        let terminal = CanonicalEvent::error("Execution cancelled", None);
        assert_eq!(hub.publish_terminal("s1", terminal.clone()), Published::default());
        assert_eq!(hub.backlog_len("s1"), 0);

        let mut sub = hub.attach("s1");
        assert!(sub.try_recv().is_none());

        // 有订阅者时照常送达
        assert_eq!(hub.publish_terminal("s1", terminal.clone()).delivered, 1);
        assert_eq!(sub.try_recv(), Some(terminal));
    }

    #[test]
    fn test_publish_to_unknown_or_closed_session_is_dropped() {
        let hub = EventHub::new(4, Duration::from_secs(30));
        assert_eq!(hub.publish("never", text("x")), Published::default());
        assert_eq!(hub.backlog_len("never"), 0);

        let _sub = hub.attach("s1");
        hub.close_session("s1");
        hub.publish("s1", text("late"));
        assert_eq!(hub.backlog_len("s1"), 0);
        assert!(hub.sessions.read().get("s1").is_none());
    }

    #[test]
    fn test_detach_and_close() {
        let hub = EventHub::new(4, Duration::from_secs(30));
        let a = hub.attach("s1");
        let _b = hub.attach("s1");

        assert_eq!(hub.detach("s1", a.id()), Some(1));
        assert_eq!(hub.detach("s1", a.id()), None);
        assert_eq!(hub.detach("missing", 1), None);

        assert_eq!(hub.close_session("s1"), 1);
        assert_eq!(hub.subscriber_count("s1"), 0);
        assert_eq!(hub.total_subscribers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recv_yields_ping_on_idle() {
        let hub = EventHub::new(4, Duration::from_secs(30));
        let mut sub = hub.attach("s1");

        assert_eq!(sub.recv().await, Some(Delivery::Ping));

        hub.publish("s1", text("hi"));
        assert_eq!(sub.recv().await, Some(Delivery::Event(text("hi"))));

        hub.close_session("s1");
        assert_eq!(sub.recv().await, None);
    }
}
