//! 事件总线
//!
//! 进程内按事件类型路由的发布/订阅。发布方永不阻塞：每个订阅者有一个
//! 有界队列（默认 1024），溢出时丢弃最旧的事件。回调式订阅者运行在独立
//! 线程上，回调 panic 会被捕获并记录，总线继续工作。

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;

/// 每个订阅者的默认队列上限
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 1024;

/// 事件数据中原文预览的最大字符数
pub const TEXT_PREVIEW_LIMIT: usize = 64;

/// 事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    SessionStarted,
    Progress,
    CacheHit,
    CacheMiss,
    BackendSelected,
    BackendFailed,
    FallbackUsed,
    ChunkSplit,
    SessionCompleted,
    SessionError,
    VerificationStarted,
    VerificationCompleted,
    VerificationFailed,
    WorkerRegistered,
    WorkerUnreachable,
    JobDispatched,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::SessionStarted => "session_started",
            EventType::Progress => "progress",
            EventType::CacheHit => "cache_hit",
            EventType::CacheMiss => "cache_miss",
            EventType::BackendSelected => "backend_selected",
            EventType::BackendFailed => "backend_failed",
            EventType::FallbackUsed => "fallback_used",
            EventType::ChunkSplit => "chunk_split",
            EventType::SessionCompleted => "session_completed",
            EventType::SessionError => "session_error",
            EventType::VerificationStarted => "verification_started",
            EventType::VerificationCompleted => "verification_completed",
            EventType::VerificationFailed => "verification_failed",
            EventType::WorkerRegistered => "worker_registered",
            EventType::WorkerUnreachable => "worker_unreachable",
            EventType::JobDispatched => "job_dispatched",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 总线上传递的事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub session_id: Option<String>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub data: HashMap<String, Value>,
}

impl Event {
    pub fn new(event_type: EventType, message: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_type,
            session_id: None,
            message: message.into(),
            timestamp: Utc::now(),
            data: HashMap::new(),
        }
    }

    pub fn with_session(mut self, session_id: Option<&str>) -> Self {
        self.session_id = session_id.map(str::to_string);
        self
    }

    pub fn with_data(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    /// 附带截断后的文本预览，不携带完整原文
    pub fn with_text_preview(self, key: &str, text: &str) -> Self {
        self.with_data(key, truncate_preview(text))
    }

    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }
}

fn truncate_preview(text: &str) -> String {
    match text.char_indices().nth(TEXT_PREVIEW_LIMIT) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}

struct SubscriberQueue {
    id: u64,
    filter: Option<EventType>,
    capacity: usize,
    queue: Mutex<VecDeque<Event>>,
    notify: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl SubscriberQueue {
    fn matches(&self, event: &Event) -> bool {
        self.filter.map_or(true, |t| t == event.event_type)
    }

    fn push(&self, event: Event) {
        {
            let mut queue = match self.queue.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if queue.len() >= self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(event);
        }
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<Event> {
        let mut queue = match self.queue.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        queue.pop_front()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }
}

struct BusInner {
    subscribers: RwLock<Vec<Arc<SubscriberQueue>>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl Drop for BusInner {
    fn drop(&mut self) {
        let subscribers = match self.subscribers.get_mut() {
            Ok(subs) => subs,
            Err(poisoned) => poisoned.into_inner(),
        };
        for sub in subscribers.iter() {
            sub.close();
        }
    }
}

/// 事件总线，克隆后共享同一组订阅者
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .field("capacity", &self.inner.capacity)
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SUBSCRIBER_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
                capacity: capacity.max(1),
            }),
        }
    }

    /// 订阅指定类型的事件
    pub fn subscribe(&self, event_type: EventType) -> Subscription {
        self.register(Some(event_type))
    }

    /// 订阅所有事件
    pub fn subscribe_all(&self) -> Subscription {
        self.register(None)
    }

    /// 以回调方式订阅
    ///
    /// 回调在独立线程中按发布顺序执行；回调 panic 只影响当前事件。
    pub fn subscribe_fn<F>(&self, filter: Option<EventType>, handler: F) -> SubscriptionHandle
    where
        F: Fn(&Event) + Send + 'static,
    {
        let subscription = self.register(filter);
        let queue = Arc::clone(&subscription.queue);

        let thread = std::thread::Builder::new()
            .name(format!("event-subscriber-{}", queue.id))
            .spawn(move || {
                while let Some(event) = futures::executor::block_on(subscription.recv()) {
                    let result = panic::catch_unwind(AssertUnwindSafe(|| handler(&event)));
                    if result.is_err() {
                        tracing::error!(
                            event_type = %event.event_type,
                            "事件订阅者处理时发生 panic，已隔离"
                        );
                    }
                }
            });

        if let Err(e) = &thread {
            tracing::error!("无法启动事件订阅线程: {}", e);
        }

        SubscriptionHandle {
            queue,
            thread: thread.ok(),
        }
    }

    /// 发布事件，不会阻塞
    pub fn publish(&self, event: Event) {
        let subscribers = match self.inner.subscribers.read() {
            Ok(subs) => subs,
            Err(poisoned) => poisoned.into_inner(),
        };

        let mut targets = subscribers.iter().filter(|s| s.matches(&event)).peekable();
        while let Some(sub) = targets.next() {
            if targets.peek().is_some() {
                sub.push(event.clone());
            } else {
                sub.push(event);
                break;
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        match self.inner.subscribers.read() {
            Ok(subs) => subs.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    fn register(&self, filter: Option<EventType>) -> Subscription {
        let queue = Arc::new(SubscriberQueue {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            filter,
            capacity: self.inner.capacity,
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });

        match self.inner.subscribers.write() {
            Ok(mut subs) => subs.push(Arc::clone(&queue)),
            Err(poisoned) => poisoned.into_inner().push(Arc::clone(&queue)),
        }

        Subscription {
            queue,
            bus: Arc::downgrade(&self.inner),
        }
    }
}

fn unregister(bus: &Weak<BusInner>, id: u64) {
    if let Some(inner) = bus.upgrade() {
        let mut subs = match inner.subscribers.write() {
            Ok(subs) => subs,
            Err(poisoned) => poisoned.into_inner(),
        };
        subs.retain(|s| s.id != id);
    }
}

/// 队列式订阅，drop 时自动退订
pub struct Subscription {
    queue: Arc<SubscriberQueue>,
    bus: Weak<BusInner>,
}

impl Subscription {
    pub fn try_recv(&self) -> Option<Event> {
        self.queue.pop()
    }

    /// 取出当前排队的全部事件
    pub fn drain(&self) -> Vec<Event> {
        let mut queue = match self.queue.queue.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        queue.drain(..).collect()
    }

    /// 等待下一个事件；总线关闭且队列为空时返回 `None`
    pub async fn recv(&self) -> Option<Event> {
        loop {
            if let Some(event) = self.queue.pop() {
                return Some(event);
            }
            if self.queue.closed.load(Ordering::SeqCst) {
                return None;
            }
            self.queue.notify.notified().await;
        }
    }

    /// 因队列溢出被丢弃的事件数
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        unregister(&self.bus, self.queue.id);
    }
}

/// 回调订阅句柄
pub struct SubscriptionHandle {
    queue: Arc<SubscriberQueue>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl SubscriptionHandle {
    /// 停止回调线程，等待已排队的事件处理完毕
    pub fn close(mut self) {
        self.queue.close();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.queue.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_type_filtered_subscription() {
        let bus = EventBus::new();
        let hits = bus.subscribe(EventType::CacheHit);
        let all = bus.subscribe_all();

        bus.publish(Event::new(EventType::CacheMiss, "miss"));
        bus.publish(Event::new(EventType::CacheHit, "hit"));

        let only_hits = hits.drain();
        assert_eq!(only_hits.len(), 1);
        assert_eq!(only_hits[0].event_type, EventType::CacheHit);
        assert_eq!(all.drain().len(), 2);
    }

    #[test]
    fn test_publish_order_preserved() {
        let bus = EventBus::new();
        let sub = bus.subscribe_all();
        for i in 0..10 {
            bus.publish(Event::new(EventType::Progress, format!("{}", i)));
        }
        let messages: Vec<String> = sub.drain().into_iter().map(|e| e.message).collect();
        let expected: Vec<String> = (0..10).map(|i| i.to_string()).collect();
        assert_eq!(messages, expected);
    }

    #[test]
    fn test_slow_subscriber_drops_oldest() {
        let bus = EventBus::with_capacity(4);
        let sub = bus.subscribe_all();
        for i in 0..6 {
            bus.publish(Event::new(EventType::Progress, format!("{}", i)));
        }
        let messages: Vec<String> = sub.drain().into_iter().map(|e| e.message).collect();
        assert_eq!(messages, vec!["2", "3", "4", "5"]);
        assert_eq!(sub.dropped(), 2);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let bus = EventBus::new();
        let sub = bus.subscribe_all();
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_panicking_subscriber_is_isolated() {
        let bus = EventBus::new();
        let (tx, rx) = mpsc::channel();

        let _faulty = bus.subscribe_fn(None, |event| {
            if event.message == "boom" {
                panic!("subscriber failure");
            }
        });
        let tx_clone = tx.clone();
        let _healthy = bus.subscribe_fn(Some(EventType::Progress), move |event| {
            let _ = tx_clone.send(event.message.clone());
        });

        bus.publish(Event::new(EventType::Progress, "boom"));
        bus.publish(Event::new(EventType::Progress, "after"));

        let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        let second = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(first, "boom");
        assert_eq!(second, "after");
    }

    #[test]
    fn test_text_preview_is_truncated() {
        let long = "ж".repeat(200);
        let event = Event::new(EventType::CacheMiss, "miss").with_text_preview("text", &long);
        let preview = event.data_str("text").unwrap();
        assert!(preview.chars().count() <= TEXT_PREVIEW_LIMIT + 1);
    }

    #[tokio::test]
    async fn test_async_recv() {
        let bus = EventBus::new();
        let sub = bus.subscribe(EventType::SessionStarted);
        let publisher = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish(Event::new(EventType::SessionStarted, "go").with_session(Some("s1")));
        });
        let event = sub.recv().await.unwrap();
        assert_eq!(event.session_id.as_deref(), Some("s1"));
    }
}
